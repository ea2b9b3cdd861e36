//! Cairn wire format — the sealed frame header and base protocol constants.
//!
//! These values ARE the protocol. The frame magic, the length field, the
//! packet-id layout, and the disconnect-reason numbering are shared with
//! every interoperating node. Changing anything here is a breaking change.
//!
//! All fixed-layout types use zerocopy derives for safe, allocation-free
//! serialization. There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Frame seal ────────────────────────────────────────────────────────────────

/// The four magic bytes that open every frame.
pub const FRAME_MAGIC: [u8; 4] = [0x22, 0x40, 0x08, 0x91];

/// Total size of the seal prefix in bytes.
pub const SEAL_BYTES: usize = 8;

/// Upper bound on a single frame. Anything larger is a protocol violation.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// The fixed 8-byte prefix written into the head of every outbound buffer.
///
/// Layout: 4 magic bytes, then the payload length as a big-endian u32.
/// The length counts everything after the seal, i.e. `buffer.len() - 8`.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct SealHeader {
    pub magic: [u8; 4],
    pub length: U32<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(SealHeader, [u8; 8]);

/// Write the seal into the first 8 bytes of `buf` in place.
///
/// `buf` must have been built with 8 reserved bytes at the front. Sealing a
/// buffer that is already sealed produces the identical bytes.
pub fn seal(buf: &mut [u8]) {
    debug_assert!(buf.len() >= SEAL_BYTES, "buffer too short to seal");
    let header = SealHeader {
        magic: FRAME_MAGIC,
        length: U32::new((buf.len() - SEAL_BYTES) as u32),
    };
    buf[..SEAL_BYTES].copy_from_slice(header.as_bytes());
}

/// Parse a seal prefix, returning the payload length it declares.
pub fn read_seal(buf: &[u8]) -> Result<u32, WireError> {
    let header = SealHeader::read_from_prefix(buf).ok_or(WireError::Truncated)?;
    if header.magic != FRAME_MAGIC {
        return Err(WireError::BadMagic(header.magic));
    }
    let length = header.length.get();
    if length as usize > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge(length as usize));
    }
    Ok(length)
}

// ── Base protocol packets ─────────────────────────────────────────────────────

/// Base protocol version spoken in the hello exchange.
pub const PROTOCOL_VERSION: u8 = 3;

pub const HELLO_PACKET: u8 = 0x00;
pub const DISCONNECT_PACKET: u8 = 0x01;
pub const PING_PACKET: u8 = 0x02;
pub const PONG_PACKET: u8 = 0x03;
pub const GET_PEERS_PACKET: u8 = 0x04;
pub const PEERS_PACKET: u8 = 0x05;

/// First packet id available to registered capabilities. Each capability is
/// handed a contiguous range starting here, in registration order.
pub const USER_PACKET_BASE: u8 = 0x10;

// ── Capability descriptors ────────────────────────────────────────────────────

/// Three-byte ASCII capability tag, e.g. `b"eth"`.
pub type CapTag = [u8; 3];

/// A versioned capability identifier. Ordered by tag, then version — the
/// derive produces exactly that lexicographic order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapDesc {
    pub tag: CapTag,
    pub version: u8,
}

impl CapDesc {
    pub const fn new(tag: CapTag, version: u8) -> Self {
        Self { tag, version }
    }
}

impl std::fmt::Display for CapDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", String::from_utf8_lossy(&self.tag), self.version)
    }
}

// ── Disconnect reasons ────────────────────────────────────────────────────────

/// Reason attached to a disconnect packet and recorded per peer.
///
/// The numbering is stable: it is serialized into the persisted peer list and
/// sent on the wire, and must match every interoperating implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    #[default]
    NoDisconnect = 0,
    ClientQuit = 1,
    DisconnectRequested = 2,
    TcpError = 3,
    BadProtocol = 4,
    UselessPeer = 5,
    TooManyPeers = 6,
    DuplicatePeer = 7,
    IncompatibleProtocol = 8,
    NullIdentity = 9,
    UnexpectedIdentity = 10,
    LocalIdentity = 11,
    PingTimeout = 12,
    UserReason = 13,
}

impl DisconnectReason {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for DisconnectReason {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use DisconnectReason::*;
        Ok(match value {
            0 => NoDisconnect,
            1 => ClientQuit,
            2 => DisconnectRequested,
            3 => TcpError,
            4 => BadProtocol,
            5 => UselessPeer,
            6 => TooManyPeers,
            7 => DuplicatePeer,
            8 => IncompatibleProtocol,
            9 => NullIdentity,
            10 => UnexpectedIdentity,
            11 => LocalIdentity,
            12 => PingTimeout,
            13 => UserReason,
            other => return Err(WireError::UnknownDisconnect(other)),
        })
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DisconnectReason::NoDisconnect => "no disconnect",
            DisconnectReason::ClientQuit => "client quit",
            DisconnectReason::DisconnectRequested => "disconnect requested",
            DisconnectReason::TcpError => "tcp error",
            DisconnectReason::BadProtocol => "bad protocol",
            DisconnectReason::UselessPeer => "useless peer",
            DisconnectReason::TooManyPeers => "too many peers",
            DisconnectReason::DuplicatePeer => "duplicate peer",
            DisconnectReason::IncompatibleProtocol => "incompatible protocol",
            DisconnectReason::NullIdentity => "null identity",
            DisconnectReason::UnexpectedIdentity => "unexpected identity",
            DisconnectReason::LocalIdentity => "local identity",
            DisconnectReason::PingTimeout => "ping timeout",
            DisconnectReason::UserReason => "user reason",
        };
        f.write_str(name)
    }
}

// ── Port policy ───────────────────────────────────────────────────────────────

/// TCP ports outside this range get a non-fatal warning when recorded.
pub const PREFERRED_PORT_RANGE: std::ops::RangeInclusive<u16> = 30300..=30305;

/// Ports at or above this are treated as ephemeral and rewritten to 0
/// before persisting.
pub const EPHEMERAL_PORT_FLOOR: u16 = 32768;

/// Discovery table port used when no listen port is available.
pub const DEFAULT_DISCOVERY_PORT: u16 = 30303;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("bad frame magic: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("frame length {0} exceeds maximum {}", MAX_FRAME_BYTES)]
    FrameTooLarge(usize),

    #[error("truncated frame")]
    Truncated,

    #[error("unknown disconnect reason: {0}")]
    UnknownDisconnect(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
