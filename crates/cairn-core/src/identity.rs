//! Node identity — the long-term secp256k1 keypair and its storage.
//!
//! A node is addressed by the 64-byte uncompressed form of its public key
//! (the leading 0x04 prefix stripped). The secret key lives in a single
//! 32-byte file under the data directory and is generated on first run.
//!
//! The store is a trait so the Host can be handed an in-memory identity in
//! tests instead of touching the filesystem.

use std::path::{Path, PathBuf};

use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use zeroize::Zeroizing;

/// File name of the identity secret inside the data directory.
pub const IDENTITY_FILE: &str = "host";

// ── NodeId ────────────────────────────────────────────────────────────────────

/// 64-byte public key identifying a node on the overlay.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; 64]);

impl NodeId {
    pub const LEN: usize = 64;

    pub fn from_public(public: &PublicKey) -> Self {
        let uncompressed = public.serialize_uncompressed();
        let mut id = [0u8; 64];
        id.copy_from_slice(&uncompressed[1..]);
        NodeId(id)
    }

    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// First eight hex characters — enough to tell nodes apart in logs.
    pub fn abridged(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId([0u8; 64])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}…", self.abridged())
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// The node's long-term keypair. The secret never leaves this struct except
/// through [`secret_bytes`](Identity::secret_bytes), which hands back a
/// self-wiping copy for persistence.
pub struct Identity {
    secp: Secp256k1<All>,
    secret: SecretKey,
    id: NodeId,
}

impl Identity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let secret = SecretKey::new(&mut rand::thread_rng());
        let id = NodeId::from_public(&PublicKey::from_secret_key(&secp, &secret));
        Self { secp, secret, id }
    }

    /// Reconstruct an identity from stored secret bytes.
    ///
    /// The all-zero secret (and any other invalid scalar) is rejected.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, IdentityError> {
        let secp = Secp256k1::new();
        let secret =
            SecretKey::from_slice(bytes).map_err(|_| IdentityError::InvalidSecret)?;
        let id = NodeId::from_public(&PublicKey::from_secret_key(&secp, &secret));
        Ok(Self { secp, secret, id })
    }

    /// The node id derived from the public key.
    pub fn public(&self) -> NodeId {
        self.id
    }

    /// Sign a 32-byte digest.
    pub fn sign(&self, digest: [u8; 32]) -> Signature {
        self.secp
            .sign_ecdsa(&Message::from_digest(digest), &self.secret)
    }

    /// Copy of the secret for persistence, wiped from memory when dropped.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.secret_bytes())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret.
        write!(f, "Identity({})", self.id)
    }
}

// ── Storage ───────────────────────────────────────────────────────────────────

/// Where the identity secret comes from. Injected into the Host so tests can
/// run without a data directory.
pub trait IdentityStore: Send + Sync {
    /// Load the stored identity, generating and persisting one if the store
    /// is empty or holds the wrong number of bytes. A stored 32-byte secret
    /// that is not a valid scalar is an error, not a regeneration.
    fn load_or_generate(&self) -> Result<Identity, IdentityError>;
}

/// Reads and writes 32 raw bytes at `<data_dir>/host`.
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(IDENTITY_FILE),
        }
    }

    fn persist(&self, identity: &Identity) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, identity.secret_bytes().as_slice())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

impl IdentityStore for FileIdentityStore {
    fn load_or_generate(&self) -> Result<Identity, IdentityError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.len() == 32 => {
                let mut secret = Zeroizing::new([0u8; 32]);
                secret.copy_from_slice(&bytes);
                Identity::from_secret_bytes(&secret)
            }
            _ => {
                let identity = Identity::generate();
                self.persist(&identity)?;
                Ok(identity)
            }
        }
    }
}

/// In-memory store for tests: a fixed secret, or a fresh one per load.
#[derive(Default)]
pub struct MemoryIdentityStore {
    secret: Option<[u8; 32]>,
}

impl MemoryIdentityStore {
    pub fn random() -> Self {
        Self { secret: None }
    }

    pub fn with_secret(secret: [u8; 32]) -> Self {
        Self {
            secret: Some(secret),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load_or_generate(&self) -> Result<Identity, IdentityError> {
        match &self.secret {
            Some(secret) => Identity::from_secret_bytes(secret),
            None => Ok(Identity::generate()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("stored secret is not a valid key (zero or out of range)")]
    InvalidSecret,

    #[error("identity file i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_has_nonzero_id() {
        let identity = Identity::generate();
        assert!(!identity.public().is_zero());
    }

    #[test]
    fn zero_secret_is_rejected() {
        let err = Identity::from_secret_bytes(&[0u8; 32]).unwrap_err();
        assert!(matches!(err, IdentityError::InvalidSecret));
    }

    #[test]
    fn secret_round_trips_to_same_id() {
        let identity = Identity::generate();
        let restored = Identity::from_secret_bytes(&identity.secret_bytes()).unwrap();
        assert_eq!(identity.public(), restored.public());
    }

    #[test]
    fn signing_is_deterministic_per_key() {
        let identity = Identity::generate();
        let digest = [0x42u8; 32];
        assert_eq!(identity.sign(digest), identity.sign(digest));
    }

    #[test]
    fn file_store_persists_across_loads() {
        let dir = std::env::temp_dir().join(format!("cairn-id-test-{}", std::process::id()));
        let store = FileIdentityStore::new(&dir);

        let first = store.load_or_generate().expect("first load");
        let second = store.load_or_generate().expect("second load");
        assert_eq!(first.public(), second.public());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn file_store_regenerates_on_wrong_length() {
        let dir = std::env::temp_dir().join(format!("cairn-id-short-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(IDENTITY_FILE), [1u8; 7]).unwrap();

        let store = FileIdentityStore::new(&dir);
        let identity = store.load_or_generate().expect("load");
        assert!(!identity.public().is_zero());
        // the short file was replaced with a full secret
        assert_eq!(std::fs::read(dir.join(IDENTITY_FILE)).unwrap().len(), 32);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn file_store_rejects_stored_zero_secret() {
        let dir = std::env::temp_dir().join(format!("cairn-id-zero-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(IDENTITY_FILE), [0u8; 32]).unwrap();

        let store = FileIdentityStore::new(&dir);
        assert!(store.load_or_generate().is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn memory_store_with_fixed_secret() {
        let store = MemoryIdentityStore::with_secret([7u8; 32]);
        let a = store.load_or_generate().unwrap();
        let b = store.load_or_generate().unwrap();
        assert_eq!(a.public(), b.public());
    }

    #[test]
    fn node_id_display_is_abridged() {
        let id = NodeId::from_bytes([0xab; 64]);
        assert_eq!(id.abridged(), "abababab");
        assert!(format!("{id}").starts_with("abababab"));
    }
}
