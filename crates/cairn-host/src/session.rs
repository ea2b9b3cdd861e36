//! Live sessions — a handshaken TCP connection plus its per-capability state.
//!
//! Sessions are created by the handshake and kept alive by their own I/O
//! tasks; the Host only ever holds a weak reference (see the ownership notes
//! on [`crate::host::Host`]). A session holds a strong reference back to its
//! [`Peer`], never to the Host.
//!
//! The handshake contract: both sides send a `Hello` frame as their first
//! frame and verify the other side's before any other traffic. Every check
//! failure maps onto a stable [`DisconnectReason`].

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use cairn_core::identity::NodeId;
use cairn_core::wire::{
    CapDesc, DisconnectReason, DISCONNECT_PACKET, GET_PEERS_PACKET, HELLO_PACKET, PEERS_PACKET,
    PING_PACKET, PONG_PACKET,
};

use crate::capability::BoundCapability;
use crate::codec::FrameCodec;
use crate::node::Node;
use crate::peer::Peer;

/// Time a handshake has to complete before the socket is dropped.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound frame queue depth per session.
const WRITE_CHAN_SIZE: usize = 64;

/// Cap on entries in a peers response.
const MAX_PEERS_SHARED: usize = 32;

// ── Hello ─────────────────────────────────────────────────────────────────────

/// The first frame on every session, in both directions.
///
/// Layout after the packet id: protocol version u8, client version
/// (u8-length-prefixed UTF-8), listen port u16 BE, node id 64 bytes,
/// capability count u8, then 4 bytes per capability (3-byte tag + version).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloMessage {
    pub protocol_version: u8,
    pub client_version: String,
    pub listen_port: u16,
    pub id: NodeId,
    pub caps: Vec<CapDesc>,
}

impl HelloMessage {
    /// Encode including the leading `HELLO_PACKET` id.
    pub fn encode(&self) -> Bytes {
        let version = self.client_version.as_bytes();
        let version_len = version.len().min(u8::MAX as usize);
        let mut buf = BytesMut::with_capacity(1 + 1 + 1 + version_len + 2 + 64 + 1);
        buf.put_u8(HELLO_PACKET);
        buf.put_u8(self.protocol_version);
        buf.put_u8(version_len as u8);
        buf.put_slice(&version[..version_len]);
        buf.put_u16(self.listen_port);
        buf.put_slice(self.id.as_bytes());
        buf.put_u8(self.caps.len().min(u8::MAX as usize) as u8);
        for cap in self.caps.iter().take(u8::MAX as usize) {
            buf.put_slice(&cap.tag);
            buf.put_u8(cap.version);
        }
        buf.freeze()
    }

    /// Decode a frame payload (including the packet id). `None` on anything
    /// structurally wrong.
    pub fn decode(payload: &[u8]) -> Option<HelloMessage> {
        let mut buf = payload;
        if buf.remaining() < 3 || buf.get_u8() != HELLO_PACKET {
            return None;
        }
        let protocol_version = buf.get_u8();
        let version_len = buf.get_u8() as usize;
        if buf.remaining() < version_len {
            return None;
        }
        let client_version = String::from_utf8(buf[..version_len].to_vec()).ok()?;
        buf.advance(version_len);

        if buf.remaining() < 2 + 64 + 1 {
            return None;
        }
        let listen_port = buf.get_u16();
        let mut id = [0u8; 64];
        id.copy_from_slice(&buf[..64]);
        buf.advance(64);

        let cap_count = buf.get_u8() as usize;
        if buf.remaining() != cap_count * 4 {
            return None;
        }
        let mut caps = Vec::with_capacity(cap_count);
        for _ in 0..cap_count {
            let tag = [buf.get_u8(), buf.get_u8(), buf.get_u8()];
            caps.push(CapDesc::new(tag, buf.get_u8()));
        }

        Some(HelloMessage {
            protocol_version,
            client_version,
            listen_port,
            id: NodeId::from_bytes(id),
            caps,
        })
    }
}

/// Send our hello, then wait for theirs.
pub(crate) async fn exchange_hello(
    framed: &mut Framed<TcpStream, FrameCodec>,
    ours: &HelloMessage,
) -> Result<HelloMessage, HandshakeError> {
    framed.send(ours.encode()).await?;
    let frame = timeout(HANDSHAKE_TIMEOUT, framed.next())
        .await
        .map_err(|_| HandshakeError::TimedOut)?
        .ok_or(HandshakeError::Closed)??;
    HelloMessage::decode(&frame)
        .ok_or(HandshakeError::Declined(DisconnectReason::BadProtocol))
}

/// Best-effort disconnect notification during a declined handshake.
pub(crate) async fn send_decline(
    framed: &mut Framed<TcpStream, FrameCodec>,
    reason: DisconnectReason,
) {
    let _ = framed
        .send(Bytes::from(vec![DISCONNECT_PACKET, reason.as_u8()]))
        .await;
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake declined: {0}")]
    Declined(DisconnectReason),

    #[error("handshake i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake timed out")]
    TimedOut,

    #[error("connection closed during handshake")]
    Closed,
}

// ── Session info ──────────────────────────────────────────────────────────────

/// Snapshot of a live session, as returned by `Host::peers()`.
#[derive(Debug, Clone)]
pub struct PeerSessionInfo {
    pub id: NodeId,
    pub client_version: String,
    pub host: String,
    pub port: u16,
    pub last_ping: Option<Duration>,
    pub caps: Vec<CapDesc>,
}

// ── Session ───────────────────────────────────────────────────────────────────

/// One live, handshaken connection.
pub struct Session {
    peer: Arc<Peer>,
    remote: SocketAddr,
    info: Mutex<PeerSessionInfo>,
    caps: Mutex<Vec<BoundCapability>>,
    writer: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    open: AtomicBool,
    last_received: Mutex<Instant>,
    ping_sent: Mutex<Option<Instant>>,
    nodes_requested: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        peer: Arc<Peer>,
        remote: SocketAddr,
        info: PeerSessionInfo,
        writer: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            remote,
            info: Mutex::new(info),
            caps: Mutex::new(Vec::new()),
            writer,
            cancel,
            open: AtomicBool::new(true),
            last_received: Mutex::new(Instant::now()),
            ping_sent: Mutex::new(None),
            nodes_requested: AtomicBool::new(false),
        })
    }

    pub(crate) fn install_capabilities(&self, bound: Vec<BoundCapability>) {
        let descs: Vec<CapDesc> = bound.iter().map(|b| b.desc).collect();
        self.info.lock().unwrap().caps = descs;
        *self.caps.lock().unwrap() = bound;
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn id(&self) -> NodeId {
        self.peer.id()
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn info(&self) -> PeerSessionInfo {
        self.info.lock().unwrap().clone()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn last_received(&self) -> Instant {
        *self.last_received.lock().unwrap()
    }

    /// Queue a frame. Returns false when the session is closed or the write
    /// queue is full — callers treat both as "peer is going away".
    pub fn send(&self, packet: u8, body: &[u8]) -> bool {
        if !self.is_open() {
            return false;
        }
        let mut buf = BytesMut::with_capacity(1 + body.len());
        buf.put_u8(packet);
        buf.put_slice(body);
        self.writer.try_send(buf.freeze()).is_ok()
    }

    /// Send a keepalive ping and start the RTT clock.
    pub fn ping(&self) {
        *self.ping_sent.lock().unwrap() = Some(Instant::now());
        self.send(PING_PACKET, &[]);
    }

    /// Close the session, notifying the peer with `reason`. Idempotent.
    pub fn disconnect(&self, reason: DisconnectReason) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.peer.note_disconnect(reason);
        // queue the notification, then let the write task drain it on cancel
        let _ = self
            .writer
            .try_send(Bytes::from(vec![DISCONNECT_PACKET, reason.as_u8()]));
        self.cancel.cancel();
        tracing::debug!(peer = %self.peer.id(), %reason, "session disconnect");
    }

    /// Answer a queued peer-list request, if one arrived since the last tick.
    /// Called from the scheduler with a snapshot of known nodes.
    pub fn service_nodes_request(&self, nodes: &[Node]) {
        if !self.nodes_requested.swap(false, Ordering::SeqCst) {
            return;
        }
        let share = &nodes[..nodes.len().min(MAX_PEERS_SHARED)];
        let mut body = BytesMut::new();
        body.put_u8(share.len() as u8);
        for node in share {
            match node.endpoint.ip {
                IpAddr::V4(v4) => {
                    body.put_u8(4);
                    body.put_slice(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    body.put_u8(16);
                    body.put_slice(&v6.octets());
                }
            }
            body.put_u16(node.endpoint.tcp_port);
            body.put_slice(node.id.as_bytes());
        }
        self.send(PEERS_PACKET, &body);
    }

    fn mark_received(&self) {
        *self.last_received.lock().unwrap() = Instant::now();
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Dispatch one inbound frame.
    fn on_frame(&self, payload: &[u8]) {
        self.mark_received();
        let Some((&packet, body)) = payload.split_first() else {
            return;
        };
        match packet {
            PING_PACKET => {
                self.send(PONG_PACKET, &[]);
            }
            PONG_PACKET => {
                if let Some(sent) = self.ping_sent.lock().unwrap().take() {
                    self.info.lock().unwrap().last_ping = Some(sent.elapsed());
                }
            }
            DISCONNECT_PACKET => {
                let reason = body
                    .first()
                    .and_then(|b| DisconnectReason::try_from(*b).ok())
                    .unwrap_or(DisconnectReason::DisconnectRequested);
                tracing::debug!(peer = %self.peer.id(), %reason, "peer disconnected us");
                self.peer.note_disconnect(reason);
                self.mark_closed();
            }
            GET_PEERS_PACKET => {
                self.nodes_requested.store(true, Ordering::SeqCst);
            }
            PEERS_PACKET => {
                // peer-list gossip is consumed by the discovery subsystem
                tracing::trace!(peer = %self.peer.id(), "peers frame ignored");
            }
            HELLO_PACKET => {
                // a second hello is a protocol violation
                self.disconnect(DisconnectReason::BadProtocol);
            }
            user => {
                let caps = self.caps.lock().unwrap();
                match caps.iter().find(|c| c.owns(user)) {
                    Some(cap) => cap.handler.on_packet(user - cap.base_packet, body),
                    None => {
                        tracing::trace!(
                            peer = %self.peer.id(),
                            packet = user,
                            "packet outside every capability range"
                        );
                    }
                }
            }
        }
    }

    /// Spawn the read/write tasks driving this session's socket. Must run
    /// inside the Host's runtime.
    pub(crate) fn spawn_io(
        session: Arc<Session>,
        framed: Framed<TcpStream, FrameCodec>,
        mut writer_rx: mpsc::Receiver<Bytes>,
    ) {
        let (mut sink, mut stream) = framed.split();
        let cancel = session.cancel.clone();

        // write task: owns the sink, drains queued frames on cancellation so
        // a final disconnect notification still reaches the wire
        let write_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = writer_rx.recv() => match frame {
                        Some(frame) => {
                            if sink.send(frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = write_cancel.cancelled() => {
                        while let Ok(frame) = writer_rx.try_recv() {
                            if sink.send(frame).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }
                }
            }
            let _ = sink.close().await;
        });

        // read task: holds the only long-lived strong reference
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = stream.next() => match frame {
                        Some(Ok(payload)) => session.on_frame(&payload),
                        Some(Err(e)) => {
                            tracing::debug!(peer = %session.id(), error = %e, "session read failed");
                            break;
                        }
                        None => break,
                    },
                }
            }
            session.mark_closed();
        });
    }

    /// Session with no socket behind it, for exercising capability binding
    /// and dispatch in tests.
    #[cfg(test)]
    pub(crate) fn detached() -> Arc<Session> {
        use crate::node::NodeEndpoint;
        let peer = Arc::new(Peer::new(
            NodeId::from_bytes([0xee; 64]),
            NodeEndpoint::new("203.0.113.99".parse().unwrap(), 30303, 30303),
        ));
        let (writer, _rx) = mpsc::channel(WRITE_CHAN_SIZE);
        Session::new(
            peer,
            "203.0.113.99:30303".parse().unwrap(),
            PeerSessionInfo {
                id: NodeId::from_bytes([0xee; 64]),
                client_version: "test".into(),
                host: "203.0.113.99".into(),
                port: 30303,
                last_ping: None,
                caps: Vec::new(),
            },
            writer,
            CancellationToken::new(),
        )
    }
}

/// Build the write channel for a new session.
pub(crate) fn write_channel() -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
    mpsc::channel(WRITE_CHAN_SIZE)
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer.id())
            .field("remote", &self.remote)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::wire::PROTOCOL_VERSION;

    fn hello(caps: Vec<CapDesc>) -> HelloMessage {
        HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            client_version: "cairn/test".into(),
            listen_port: 30303,
            id: NodeId::from_bytes([0x11; 64]),
            caps,
        }
    }

    #[test]
    fn hello_round_trip() {
        let msg = hello(vec![CapDesc::new(*b"chn", 1), CapDesc::new(*b"txg", 2)]);
        let decoded = HelloMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn hello_with_no_caps_round_trips() {
        let msg = hello(vec![]);
        assert_eq!(HelloMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn hello_decode_rejects_garbage() {
        assert!(HelloMessage::decode(&[]).is_none());
        assert!(HelloMessage::decode(&[0xff, 3]).is_none());

        // truncated id
        let mut encoded = hello(vec![]).encode().to_vec();
        encoded.truncate(encoded.len() - 10);
        assert!(HelloMessage::decode(&encoded).is_none());

        // cap count promising more entries than present
        let mut encoded = hello(vec![]).encode().to_vec();
        let last = encoded.len() - 1;
        encoded[last] = 5;
        assert!(HelloMessage::decode(&encoded).is_none());
    }

    #[test]
    fn ping_frame_triggers_pong() {
        let session = Session::detached();
        session.on_frame(&[PING_PACKET]);
        // queue holds the pong even with no reader attached
        assert!(session.is_open());
    }

    #[test]
    fn disconnect_frame_closes_and_records_reason() {
        let session = Session::detached();
        session.on_frame(&[DISCONNECT_PACKET, DisconnectReason::TooManyPeers.as_u8()]);
        assert!(!session.is_open());
        assert_eq!(
            session.peer().stats().last_disconnect,
            DisconnectReason::TooManyPeers
        );
    }

    #[test]
    fn second_hello_is_a_protocol_violation() {
        let session = Session::detached();
        session.on_frame(&hello(vec![]).encode());
        assert!(!session.is_open());
        assert_eq!(
            session.peer().stats().last_disconnect,
            DisconnectReason::BadProtocol
        );
    }

    #[test]
    fn disconnect_is_idempotent() {
        let session = Session::detached();
        session.disconnect(DisconnectReason::ClientQuit);
        session.disconnect(DisconnectReason::PingTimeout);
        // first reason sticks
        assert_eq!(
            session.peer().stats().last_disconnect,
            DisconnectReason::ClientQuit
        );
    }

    #[test]
    fn frames_update_last_received() {
        let session = Session::detached();
        let before = session.last_received();
        std::thread::sleep(Duration::from_millis(5));
        session.on_frame(&[PING_PACKET]);
        assert!(session.last_received() > before);
    }

    #[test]
    fn get_peers_queues_a_request() {
        let session = Session::detached();
        session.on_frame(&[GET_PEERS_PACKET]);
        // serviced exactly once
        session.service_nodes_request(&[]);
        assert!(!session.nodes_requested.load(Ordering::SeqCst));
    }

    #[test]
    fn capability_dispatch_uses_relative_ids() {
        use crate::capability::{BoundCapability, SessionCapability};
        use std::sync::atomic::AtomicU32;

        struct Recorder(Arc<AtomicU32>);
        impl SessionCapability for Recorder {
            fn on_packet(&self, packet: u8, _payload: &[u8]) {
                self.0.store(packet as u32 + 1, Ordering::SeqCst);
            }
        }

        let seen = Arc::new(AtomicU32::new(0));
        let session = Session::detached();
        session.install_capabilities(vec![BoundCapability {
            desc: CapDesc::new(*b"chn", 1),
            base_packet: 0x10,
            message_count: 4,
            handler: Box::new(Recorder(seen.clone())),
        }]);

        session.on_frame(&[0x12, 0xaa]);
        assert_eq!(seen.load(Ordering::SeqCst), 3); // relative id 2, +1 marker

        // outside the range: ignored
        session.on_frame(&[0x20]);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
