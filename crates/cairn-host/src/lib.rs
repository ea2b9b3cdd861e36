//! The cairn Host — a mesh of authenticated TCP sessions over a discovery
//! table.
//!
//! [`Host`] accepts inbound connections, dials discovered nodes until the
//! ideal peer count is reached, binds registered [`Capability`] plugins onto
//! each session, evicts unresponsive peers, and persists the known-peer set
//! across restarts. See the crate-level docs of each module for the pieces.

pub mod capability;
pub mod codec;
pub mod error;
pub mod host;
pub mod node;
pub mod peer;
pub mod resolver;
pub mod session;
pub mod table;

pub use capability::{Capability, CapabilityRegistry, SessionCapability};
pub use error::HostError;
pub use host::Host;
pub use node::{Node, NodeEndpoint};
pub use peer::{Peer, PeerStats};
pub use session::{HelloMessage, PeerSessionInfo, Session};
pub use table::{NodeTable, TableEvent};
