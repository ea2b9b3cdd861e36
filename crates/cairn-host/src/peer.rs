//! Peers — the relationship record for a known remote node.
//!
//! A `Peer` outlives any single connection: it carries the connectivity
//! stats that persist across sessions and across restarts. The Host owns
//! peers strongly; a live `Session` holds a strong reference back to its
//! peer, while the peer only ever holds a weak one to the session.

use std::net::IpAddr;
use std::sync::{Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cairn_core::identity::NodeId;
use cairn_core::netlist::{Item, NetlistError};
use cairn_core::wire::{DisconnectReason, EPHEMERAL_PORT_FLOOR};

use crate::node::{Node, NodeEndpoint};
use crate::session::Session;

/// Peers which haven't connected within this window are not persisted.
pub const SAVE_WINDOW: Duration = Duration::from_secs(48 * 3600);

/// Connectivity stats for one peer. Score and rating are opaque counters
/// owned by sessions; the Host only stores and persists them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub last_connected: Option<SystemTime>,
    pub last_attempted: Option<SystemTime>,
    pub failed_attempts: u32,
    pub last_disconnect: DisconnectReason,
    pub score: i32,
    pub rating: i32,
}

/// A known remote node plus its runtime stats and (possibly dead) session.
pub struct Peer {
    id: NodeId,
    endpoint: Mutex<NodeEndpoint>,
    stats: Mutex<PeerStats>,
    session: Mutex<Weak<Session>>,
}

impl Peer {
    pub fn new(id: NodeId, endpoint: NodeEndpoint) -> Self {
        Self {
            id,
            endpoint: Mutex::new(endpoint),
            stats: Mutex::new(PeerStats::default()),
            session: Mutex::new(Weak::new()),
        }
    }

    pub fn with_stats(id: NodeId, endpoint: NodeEndpoint, stats: PeerStats) -> Self {
        Self {
            id,
            endpoint: Mutex::new(endpoint),
            stats: Mutex::new(stats),
            session: Mutex::new(Weak::new()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn endpoint(&self) -> NodeEndpoint {
        *self.endpoint.lock().unwrap()
    }

    /// Discovery learned a fresh endpoint for this peer.
    pub fn update_endpoint(&self, endpoint: NodeEndpoint) {
        *self.endpoint.lock().unwrap() = endpoint;
    }

    pub fn node(&self) -> Node {
        Node::new(self.id, self.endpoint())
    }

    pub fn stats(&self) -> PeerStats {
        self.stats.lock().unwrap().clone()
    }

    /// A peer is offline exactly when its session reference cannot be
    /// upgraded.
    pub fn is_offline(&self) -> bool {
        self.session.lock().unwrap().upgrade().is_none()
    }

    pub fn session(&self) -> Option<std::sync::Arc<Session>> {
        self.session.lock().unwrap().upgrade()
    }

    pub(crate) fn attach_session(&self, session: Weak<Session>) {
        *self.session.lock().unwrap() = session;
    }

    // ── Stat stamping ─────────────────────────────────────────────────────────

    pub fn note_connected(&self, at: SystemTime) {
        self.stats.lock().unwrap().last_connected = Some(at);
    }

    /// A dial failed: record the TCP error and strictly advance
    /// `last_attempted`.
    pub fn note_dial_failed(&self, at: SystemTime) {
        let mut stats = self.stats.lock().unwrap();
        stats.last_disconnect = DisconnectReason::TcpError;
        stats.last_attempted = Some(at);
        stats.failed_attempts += 1;
    }

    pub fn note_disconnect(&self, reason: DisconnectReason) {
        self.stats.lock().unwrap().last_disconnect = reason;
    }

    pub fn add_score(&self, delta: i32) {
        self.stats.lock().unwrap().score += delta;
    }

    pub fn add_rating(&self, delta: i32) {
        self.stats.lock().unwrap().rating += delta;
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    /// Whether this peer passes the save filter: recently connected, sane
    /// advertised port, not ourselves, and publicly addressable.
    pub fn eligible_for_save(&self, self_id: &NodeId, now: SystemTime) -> bool {
        let endpoint = self.endpoint();
        let recently_connected = self
            .stats
            .lock()
            .unwrap()
            .last_connected
            .and_then(|t| now.duration_since(t).ok())
            .map(|age| age < SAVE_WINDOW)
            .unwrap_or(false);

        recently_connected
            && endpoint.tcp_port > 0
            && endpoint.tcp_port < EPHEMERAL_PORT_FLOOR
            && self.id != *self_id
            && !endpoint.is_private()
            && !endpoint.is_loopback()
            && !endpoint.ip.is_unspecified()
    }

    /// Encode as the 10-field persisted record.
    pub fn to_saved(&self) -> Item {
        let endpoint = self.endpoint();
        let stats = self.stats();
        let ip_bytes = match endpoint.ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        Item::list(vec![
            Item::bytes(ip_bytes),
            Item::uint(endpoint.tcp_port as u64),
            Item::bytes(self.id.as_bytes().to_vec()),
            Item::uint(0), // trust flag, reserved
            Item::uint(epoch_seconds(stats.last_connected)),
            Item::uint(epoch_seconds(stats.last_attempted)),
            Item::uint(stats.failed_attempts as u64),
            Item::uint(stats.last_disconnect.as_u8() as u64),
            Item::uint(stats.score as u32 as u64),
            Item::uint(stats.rating as u32 as u64),
        ])
    }

    /// Decode a persisted record. Errors mean the record is skipped, not
    /// that restore fails.
    pub fn from_saved(item: &Item) -> Result<(Node, PeerStats), NetlistError> {
        let fields = item.as_list()?;
        if fields.len() != 10 {
            return Err(NetlistError::Truncated);
        }

        let ip = match fields[0].as_bytes()? {
            bytes if bytes.len() == 4 => {
                IpAddr::from(<[u8; 4]>::try_from(bytes).unwrap())
            }
            bytes if bytes.len() == 16 => {
                IpAddr::from(<[u8; 16]>::try_from(bytes).unwrap())
            }
            _ => return Err(NetlistError::Truncated),
        };
        let tcp_port = fields[1].as_uint()? as u16;

        let id_bytes = fields[2].as_bytes()?;
        if id_bytes.len() != NodeId::LEN {
            return Err(NetlistError::Truncated);
        }
        let mut id = [0u8; 64];
        id.copy_from_slice(id_bytes);

        let _trust = fields[3].as_uint()?;
        let stats = PeerStats {
            last_connected: from_epoch_seconds(fields[4].as_uint()?),
            last_attempted: from_epoch_seconds(fields[5].as_uint()?),
            failed_attempts: fields[6].as_uint()? as u32,
            last_disconnect: DisconnectReason::try_from(fields[7].as_uint()? as u8)
                .unwrap_or(DisconnectReason::NoDisconnect),
            score: fields[8].as_uint()? as u32 as i32,
            rating: fields[9].as_uint()? as u32 as i32,
        };

        let node = Node::new(
            NodeId::from_bytes(id),
            NodeEndpoint::new(ip, tcp_port, tcp_port),
        );
        Ok((node, stats))
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint())
            .field("offline", &self.is_offline())
            .finish()
    }
}

fn epoch_seconds(t: Option<SystemTime>) -> u64 {
    t.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn from_epoch_seconds(secs: u64) -> Option<SystemTime> {
    (secs > 0).then(|| UNIX_EPOCH + Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::v4;

    fn public_peer(last: u8) -> Peer {
        let peer = Peer::new(
            NodeId::from_bytes([last; 64]),
            NodeEndpoint::new(v4(203, 0, 113, last), 30303, 30303),
        );
        peer.note_connected(SystemTime::now());
        peer
    }

    #[test]
    fn fresh_peer_is_offline() {
        let peer = public_peer(1);
        assert!(peer.is_offline());
        assert!(peer.session().is_none());
    }

    #[test]
    fn failed_dial_advances_last_attempted() {
        let peer = public_peer(1);
        let t1 = SystemTime::now();
        peer.note_dial_failed(t1);
        let t2 = t1 + Duration::from_millis(10);
        peer.note_dial_failed(t2);

        let stats = peer.stats();
        assert_eq!(stats.last_attempted, Some(t2));
        assert_eq!(stats.failed_attempts, 2);
        assert_eq!(stats.last_disconnect, DisconnectReason::TcpError);
    }

    #[test]
    fn saved_record_round_trips() {
        let peer = public_peer(9);
        peer.note_dial_failed(SystemTime::now());
        peer.add_score(17);
        peer.add_rating(-3);

        let (node, stats) = Peer::from_saved(&peer.to_saved()).unwrap();
        assert_eq!(node.id, peer.id());
        assert_eq!(node.endpoint.tcp(), peer.endpoint().tcp());
        // sub-second precision is dropped by the epoch-seconds encoding
        assert_eq!(
            epoch_seconds(stats.last_connected),
            epoch_seconds(peer.stats().last_connected)
        );
        assert_eq!(stats.failed_attempts, 1);
        assert_eq!(stats.last_disconnect, DisconnectReason::TcpError);
        assert_eq!(stats.score, 17);
        assert_eq!(stats.rating, -3);
    }

    #[test]
    fn save_filter_requires_recent_connection() {
        let self_id = NodeId::from_bytes([0xff; 64]);
        let now = SystemTime::now();

        let fresh = public_peer(1);
        assert!(fresh.eligible_for_save(&self_id, now));

        let stale = public_peer(2);
        stale.note_connected(now - SAVE_WINDOW - Duration::from_secs(1));
        assert!(!stale.eligible_for_save(&self_id, now));

        let never = Peer::new(
            NodeId::from_bytes([3; 64]),
            NodeEndpoint::new(v4(203, 0, 113, 3), 30303, 30303),
        );
        assert!(!never.eligible_for_save(&self_id, now));
    }

    #[test]
    fn save_filter_rejects_bad_ports_self_and_private() {
        let self_id = NodeId::from_bytes([0xff; 64]);
        let now = SystemTime::now();

        let zero_port = public_peer(1);
        zero_port.update_endpoint(NodeEndpoint::new(v4(203, 0, 113, 1), 0, 0));
        assert!(!zero_port.eligible_for_save(&self_id, now));

        let ephemeral = public_peer(2);
        ephemeral.update_endpoint(NodeEndpoint::new(v4(203, 0, 113, 2), 40000, 40000));
        assert!(!ephemeral.eligible_for_save(&self_id, now));

        let ourselves = public_peer(0xff);
        assert!(!ourselves.eligible_for_save(&self_id, now));

        let private = public_peer(4);
        private.update_endpoint(NodeEndpoint::new(v4(10, 0, 0, 1), 30303, 30303));
        assert!(!private.eligible_for_save(&self_id, now));

        let loopback = public_peer(5);
        loopback.update_endpoint(NodeEndpoint::new(v4(127, 0, 0, 1), 30303, 30303));
        assert!(!loopback.eligible_for_save(&self_id, now));
    }

    #[test]
    fn malformed_record_is_an_error() {
        assert!(Peer::from_saved(&Item::bytes(vec![1, 2, 3])).is_err());
        assert!(Peer::from_saved(&Item::list(vec![Item::uint(1)])).is_err());
        // wrong node-id width
        let mut fields = vec![
            Item::bytes(vec![203, 0, 113, 1]),
            Item::uint(30303),
            Item::bytes(vec![0u8; 10]),
        ];
        fields.extend((0..7).map(|_| Item::uint(0)));
        assert!(Peer::from_saved(&Item::list(fields)).is_err());
    }

    #[test]
    fn ipv6_saved_record_round_trips() {
        let peer = Peer::new(
            NodeId::from_bytes([5; 64]),
            NodeEndpoint::new("2001:db8::5".parse().unwrap(), 30303, 30303),
        );
        let (node, _) = Peer::from_saved(&peer.to_saved()).unwrap();
        assert_eq!(node.endpoint.ip, peer.endpoint().ip);
    }
}
