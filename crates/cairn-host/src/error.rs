//! Host error types.
//!
//! Setup-time and lifecycle-misuse failures surface to callers; transient
//! socket errors in the acceptor and dialer are logged and retried, never
//! returned.

use cairn_core::identity::IdentityError;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("failed to bind tcp port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("host is already running")]
    AlreadyRunning,

    #[error("host is not running")]
    NotRunning,

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}
