//! The Host — the long-running component that maintains the session mesh.
//!
//! One `Host` owns the peer book, drives outbound dials toward the ideal
//! peer count, accepts inbound sessions, binds capabilities onto every new
//! session, keeps sessions alive with periodic pings, and persists the set
//! of known peers across restarts.
//!
//! Ownership is deliberately one-directional: the Host strongly owns
//! `Peer`s and weakly references `Session`s; each session strongly
//! references its peer and nothing else of ours. The public API is
//! synchronous and thread-safe — the Host owns its own tokio runtime,
//! built at `start()` and torn down by `stop()`, so callers never need an
//! async context.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashSet;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use cairn_core::config::NetworkPreferences;
use cairn_core::identity::{Identity, IdentityStore, NodeId};
use cairn_core::netlist::Item;
use cairn_core::wire::{
    CapDesc, DisconnectReason, DEFAULT_DISCOVERY_PORT, EPHEMERAL_PORT_FLOOR,
    PREFERRED_PORT_RANGE, PROTOCOL_VERSION,
};

use crate::capability::{Capability, CapabilityRegistry};
use crate::codec::FrameCodec;
use crate::error::HostError;
use crate::node::{Node, NodeEndpoint};
use crate::peer::{Peer, PeerStats};
use crate::resolver::{
    determine_public, probe_local_addresses, NatTraversal, NoTraversal, ResolverInputs,
};
use crate::session::{
    exchange_hello, send_decline, write_channel, HandshakeError, HelloMessage, PeerSessionInfo,
    Session,
};
use crate::table::{InMemoryNodeTable, NodeTable, TableEvent};

/// Scheduler period.
const TICK: Duration = Duration::from_millis(100);

/// Interval between keepalive ping broadcasts.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Reply deadline after a ping broadcast before a silent session is culled.
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outbound connect deadline.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll period while `stop()` waits for the scheduler to wind down.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Poll period between drain rounds.
const DRAIN_POLL: Duration = Duration::from_millis(10);

// ── Peer book ─────────────────────────────────────────────────────────────────

/// Peers and sessions live under one lock so the cross-map invariant — every
/// live session's node-id has a peer entry, and the session's back-pointer is
/// that peer — can never be observed half-updated.
#[derive(Default)]
struct Book {
    peers: HashMap<NodeId, Arc<Peer>>,
    sessions: HashMap<NodeId, Weak<Session>>,
}

// ── Host ──────────────────────────────────────────────────────────────────────

pub struct Host {
    inner: Arc<HostInner>,
    lifecycle: Mutex<Option<NetRuntime>>,
}

struct NetRuntime {
    runtime: tokio::runtime::Runtime,
    cancel: CancellationToken,
}

struct HostInner {
    client_version: String,
    prefs: Mutex<NetworkPreferences>,
    identity: Mutex<Identity>,
    registry: Mutex<CapabilityRegistry>,
    /// Registration-ordered snapshot frozen at `start()`. No lock contention
    /// on the hot path; replaced wholesale on restart.
    active_caps: Mutex<Option<Arc<CapabilityRegistry>>>,
    book: Mutex<Book>,
    /// Single-flight guard for the dialer. Own synchronization, never taken
    /// while holding the book lock.
    pending: DashSet<NodeId>,
    nat: Mutex<Box<dyn NatTraversal>>,
    if_addresses: Mutex<Vec<IpAddr>>,

    running: AtomicBool,
    scheduler_live: AtomicBool,
    accepting: AtomicBool,
    /// Bound port, or -1 when binding failed or was never attempted.
    listen_port: AtomicI32,
    ideal_peers: AtomicU32,
    tcp_public: Mutex<Option<SocketAddr>>,
    peer_addresses: Mutex<BTreeSet<IpAddr>>,
    table: Mutex<Option<Arc<dyn NodeTable>>>,
    rt: Mutex<Option<tokio::runtime::Handle>>,
    last_ping_broadcast: Mutex<Option<Instant>>,
}

impl Host {
    /// Build a Host. The identity is loaded (or generated) immediately;
    /// nothing touches the network until `start()`.
    pub fn new(
        client_version: impl Into<String>,
        prefs: NetworkPreferences,
        store: &dyn IdentityStore,
    ) -> Result<Host, HostError> {
        let identity = store.load_or_generate()?;
        let if_addresses = probe_local_addresses();
        for address in &if_addresses {
            tracing::debug!(%address, "interface address");
        }
        tracing::info!(id = %identity.public(), "host identity ready");

        let ideal = prefs.ideal_peers;
        Ok(Host {
            inner: Arc::new(HostInner {
                client_version: client_version.into(),
                prefs: Mutex::new(prefs),
                identity: Mutex::new(identity),
                registry: Mutex::new(CapabilityRegistry::new()),
                active_caps: Mutex::new(None),
                book: Mutex::new(Book::default()),
                pending: DashSet::new(),
                nat: Mutex::new(Box::new(NoTraversal)),
                if_addresses: Mutex::new(if_addresses),
                running: AtomicBool::new(false),
                scheduler_live: AtomicBool::new(false),
                accepting: AtomicBool::new(false),
                listen_port: AtomicI32::new(-1),
                ideal_peers: AtomicU32::new(ideal),
                tcp_public: Mutex::new(None),
                peer_addresses: Mutex::new(BTreeSet::new()),
                table: Mutex::new(None),
                rt: Mutex::new(None),
                last_ping_broadcast: Mutex::new(None),
            }),
            lifecycle: Mutex::new(None),
        })
    }

    // ── Registration (pre-start) ──────────────────────────────────────────────

    /// Register a capability. Must happen before `start()`; registrations
    /// made while running are ignored with a warning.
    pub fn register_capability(&self, capability: Arc<dyn Capability>) -> Arc<dyn Capability> {
        if self.is_started() {
            tracing::warn!("capability registered while running; ignored until restart");
            return capability;
        }
        self.inner.registry.lock().unwrap().register(capability)
    }

    pub fn have_capability(&self, desc: &CapDesc) -> bool {
        self.inner.registry.lock().unwrap().have(desc)
    }

    pub fn capability_descs(&self) -> Vec<CapDesc> {
        self.inner.registry.lock().unwrap().descs()
    }

    /// Replace the interface-address list used by endpoint resolution.
    /// Takes effect at the next `start()`.
    pub fn set_interface_addresses(&self, addresses: Vec<IpAddr>) {
        *self.inner.if_addresses.lock().unwrap() = addresses;
    }

    /// Inject a NAT traversal implementation. Takes effect at the next
    /// `start()`.
    pub fn set_nat_traversal(&self, nat: Box<dyn NatTraversal>) {
        *self.inner.nat.lock().unwrap() = nat;
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Start the network. Fails with [`HostError::AlreadyRunning`] on a
    /// Host that is already up.
    pub fn start(&self) -> Result<(), HostError> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if lifecycle.is_some() {
            return Err(HostError::AlreadyRunning);
        }

        // concurrency hint 2: the accept/dial path plus a helper for
        // blocking resolves
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("cairn-net")
            .enable_all()
            .build()?;
        let cancel = CancellationToken::new();

        let inner = &self.inner;
        inner.running.store(true, Ordering::SeqCst);
        inner.scheduler_live.store(true, Ordering::SeqCst);
        *inner.rt.lock().unwrap() = Some(runtime.handle().clone());
        *inner.active_caps.lock().unwrap() =
            Some(Arc::new(inner.registry.lock().unwrap().clone()));

        let prefs = inner.prefs.lock().unwrap().clone();
        inner.ideal_peers.store(prefs.ideal_peers, Ordering::SeqCst);

        let listener = match runtime.block_on(TcpListener::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            prefs.listen_port,
        ))) {
            Ok(listener) => {
                let port = listener
                    .local_addr()
                    .map(|a| a.port())
                    .unwrap_or(prefs.listen_port);
                inner.listen_port.store(port as i32, Ordering::SeqCst);
                Some(listener)
            }
            Err(e) => {
                // not fatal: the Host keeps running outbound-only
                let err = HostError::Bind {
                    port: prefs.listen_port,
                    source: e,
                };
                tracing::error!(error = %err, "inbound sessions disabled");
                inner.listen_port.store(-1, Ordering::SeqCst);
                None
            }
        };

        if let Some(caps) = inner.active_caps.lock().unwrap().clone() {
            caps.on_starting();
        }

        let bound_port = inner.listen_port.load(Ordering::SeqCst);
        if let Some(listener) = listener {
            let advertised_ip = match parse_advertised(&prefs.advertised_ip) {
                Ok(ip) => ip,
                Err(e) => {
                    tracing::warn!(error = %e, "advertised address ignored");
                    None
                }
            };
            let if_addresses = inner.if_addresses.lock().unwrap().clone();
            let resolution = {
                let nat = inner.nat.lock().unwrap();
                determine_public(
                    &ResolverInputs {
                        advertised_ip,
                        upnp: prefs.upnp,
                        listen_port: bound_port as u16,
                        if_addresses: &if_addresses,
                        local_networking: prefs.local_networking,
                    },
                    nat.as_ref(),
                )
            };
            tracing::info!(public = %resolution.public, "public endpoint resolved");
            *inner.tcp_public.lock().unwrap() = Some(resolution.public);
            *inner.peer_addresses.lock().unwrap() = resolution.peer_addresses;

            inner.accepting.store(true, Ordering::SeqCst);
            runtime.spawn(HostInner::acceptor_loop(
                inner.clone(),
                listener,
                cancel.clone(),
            ));
        } else {
            *inner.tcp_public.lock().unwrap() = Some(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                prefs.listen_port,
            ));
        }

        // the node table stays up even without an acceptor so discovery can
        // still drive outbound dials
        let table_port = if bound_port > 0 {
            bound_port as u16
        } else {
            DEFAULT_DISCOVERY_PORT
        };
        *inner.table.lock().unwrap() = Some(Arc::new(InMemoryNodeTable::bound(table_port)));
        if bound_port <= 0 {
            tracing::warn!("listen unavailable; operating outbound-only via discovery");
        }

        runtime.spawn(HostInner::scheduler(inner.clone(), cancel.clone()));

        tracing::info!(id = %self.id(), port = bound_port, "host started");
        *lifecycle = Some(NetRuntime { runtime, cancel });
        Ok(())
    }

    /// Stop the network and wait for the drain to complete. Fails with
    /// [`HostError::NotRunning`] on a Host that is not up.
    pub fn stop(&self) -> Result<(), HostError> {
        let net = self.lifecycle.lock().unwrap().take();
        let Some(net) = net else {
            return Err(HostError::NotRunning);
        };

        self.inner.running.store(false, Ordering::SeqCst);
        // the scheduler observes the flag at its next tick, runs the drain,
        // and releases its tick handle; mirror that by polling
        while self.inner.scheduler_live.load(Ordering::SeqCst) {
            std::thread::sleep(STOP_POLL);
        }

        net.cancel.cancel();
        net.runtime.shutdown_timeout(Duration::from_secs(5));
        *self.inner.rt.lock().unwrap() = None;
        *self.inner.active_caps.lock().unwrap() = None;
        *self.inner.tcp_public.lock().unwrap() = None;
        self.inner.listen_port.store(-1, Ordering::SeqCst);
        *self.inner.last_ping_broadcast.lock().unwrap() = None;
        tracing::info!("host stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Swap network preferences, restarting if currently running.
    pub fn set_network_preferences(&self, prefs: NetworkPreferences) -> Result<(), HostError> {
        let had = self.is_started();
        if had {
            self.stop()?;
        }
        self.inner
            .ideal_peers
            .store(prefs.ideal_peers, Ordering::SeqCst);
        *self.inner.prefs.lock().unwrap() = prefs;
        if had {
            self.start()?;
        }
        Ok(())
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn id(&self) -> NodeId {
        self.inner.identity.lock().unwrap().public()
    }

    pub fn protocol_version(&self) -> u8 {
        PROTOCOL_VERSION
    }

    /// Address we are advertising, as a string. Unspecified until started.
    pub fn listen_address(&self) -> String {
        self.inner
            .tcp_public
            .lock()
            .unwrap()
            .map(|ep| ep.ip().to_string())
            .unwrap_or_else(|| Ipv4Addr::UNSPECIFIED.to_string())
    }

    /// Bound TCP port; -1 means binding failed or was never attempted.
    pub fn listen_port(&self) -> i32 {
        self.inner.listen_port.load(Ordering::SeqCst)
    }

    /// Interface addresses peers may legitimately know us by.
    pub fn peer_addresses(&self) -> BTreeSet<IpAddr> {
        self.inner.peer_addresses.lock().unwrap().clone()
    }

    pub fn set_ideal_peer_count(&self, n: u32) {
        self.inner.ideal_peers.store(n, Ordering::SeqCst);
        self.inner.prefs.lock().unwrap().ideal_peers = n;
    }

    /// Live sessions only.
    pub fn peers(&self) -> Vec<PeerSessionInfo> {
        if !self.is_started() {
            return Vec::new();
        }
        self.inner
            .live_sessions()
            .iter()
            .map(|s| s.info())
            .collect()
    }

    /// Number of live sessions; equivalent to, but cheaper than,
    /// `peers().len()`.
    pub fn peer_count(&self) -> usize {
        self.inner.live_sessions().len()
    }

    /// Snapshot of every known peer, live or not.
    pub fn nodes(&self) -> Vec<(Node, PeerStats)> {
        let book = self.inner.book.lock().unwrap();
        book.peers
            .values()
            .map(|p| (p.node(), p.stats()))
            .collect()
    }

    pub fn have_peer_session(&self, id: &NodeId) -> bool {
        self.inner.have_peer_session(id)
    }

    // ── Node injection ────────────────────────────────────────────────────────

    /// Hand a node to the discovery table. `addr` may be an IP literal or a
    /// hostname; hostnames resolve asynchronously on the worker. Strings
    /// that are neither are rejected.
    pub fn add_node(
        &self,
        id: NodeId,
        addr: &str,
        tcp_port: u16,
        udp_port: u16,
    ) -> Result<(), HostError> {
        let tcp_port = sanitize_port(tcp_port);
        match addr.parse::<IpAddr>() {
            Ok(ip) => {
                self.inner
                    .table_add(Node::new(id, NodeEndpoint::new(ip, udp_port, tcp_port)));
                Ok(())
            }
            Err(_) => {
                if !is_plausible_hostname(addr) {
                    return Err(HostError::InvalidAddress(addr.to_string()));
                }
                let handle = self.inner.rt.lock().unwrap().clone();
                let Some(handle) = handle else {
                    tracing::debug!(%addr, "not started; dropping hostname node");
                    return Ok(());
                };
                let inner = self.inner.clone();
                let addr = addr.to_string();
                handle.spawn(async move {
                    match tokio::net::lookup_host((addr.as_str(), tcp_port)).await {
                        Ok(mut resolved) => {
                            if let Some(first) = resolved.next() {
                                inner.table_add(Node::new(
                                    id,
                                    NodeEndpoint::new(first.ip(), udp_port, tcp_port),
                                ));
                            }
                        }
                        Err(e) => {
                            tracing::debug!(%addr, error = %e, "hostname resolution failed");
                        }
                    }
                });
                Ok(())
            }
        }
    }

    /// The discovery table currently attached, if started.
    pub fn node_table(&self) -> Option<Arc<dyn NodeTable>> {
        self.inner.table.lock().unwrap().clone()
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    /// Serialize the known-peer set (versioned, with the identity secret).
    pub fn save_nodes(&self) -> Vec<u8> {
        let identity = self.inner.identity.lock().unwrap();
        let self_id = identity.public();
        let now = SystemTime::now();

        let book = self.inner.book.lock().unwrap();
        let saved: Vec<Item> = book
            .peers
            .values()
            .filter(|p| p.eligible_for_save(&self_id, now))
            .map(|p| p.to_saved())
            .collect();
        let count = saved.len();

        let root = Item::list(vec![
            Item::uint(0),
            Item::bytes(identity.secret_bytes().to_vec()),
            Item::list(saved),
        ]);
        tracing::debug!(count, "saved peer list");
        root.encode()
    }

    /// Restore a peer list produced by [`save_nodes`](Host::save_nodes).
    /// Malformed entries are skipped; unknown versions are ignored whole.
    pub fn restore_nodes(&self, bytes: &[u8]) {
        let root = match Item::decode(bytes) {
            Ok(root) => root,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable saved peer list");
                return;
            }
        };
        let fields = match root.as_list() {
            Ok(fields) if fields.len() >= 3 => fields,
            _ => {
                tracing::warn!("saved peer list has unexpected shape");
                return;
            }
        };
        match fields[0].as_uint() {
            Ok(0) => {}
            Ok(version) => {
                tracing::debug!(version, "ignoring unknown peer-list version");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "saved peer list has no version header");
                return;
            }
        }

        match fields[1].as_bytes() {
            Ok(secret) if secret.len() == 32 => {
                let mut bytes32 = [0u8; 32];
                bytes32.copy_from_slice(secret);
                match Identity::from_secret_bytes(&bytes32) {
                    Ok(identity) => *self.inner.identity.lock().unwrap() = identity,
                    Err(e) => tracing::warn!(error = %e, "saved identity rejected"),
                }
            }
            _ => tracing::warn!("saved identity malformed; keeping current"),
        }

        let Ok(records) = fields[2].as_list() else {
            tracing::warn!("saved peer records malformed");
            return;
        };
        let mut restored = 0usize;
        let mut book = self.inner.book.lock().unwrap();
        for record in records {
            match Peer::from_saved(record) {
                Ok((node, stats)) => {
                    if !book.peers.contains_key(&node.id) {
                        book.peers.insert(
                            node.id,
                            Arc::new(Peer::with_stats(node.id, node.endpoint, stats)),
                        );
                        restored += 1;
                    }
                }
                Err(e) => tracing::debug!(error = %e, "skipping malformed saved peer"),
            }
        }
        tracing::info!(restored, "restored saved peers");
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id())
            .field("started", &self.is_started())
            .field("listen_port", &self.listen_port())
            .finish()
    }
}

/// Parse the operator-supplied advertised address. Empty means unset;
/// anything else must be an IP literal.
fn parse_advertised(addr: &str) -> Result<Option<IpAddr>, HostError> {
    if addr.is_empty() {
        return Ok(None);
    }
    addr.parse::<IpAddr>()
        .map(Some)
        .map_err(|_| HostError::InvalidAddress(addr.to_string()))
}

/// Cheap shape check before handing a string to the resolver.
fn is_plausible_hostname(addr: &str) -> bool {
    !addr.is_empty()
        && addr
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// Apply the port policy: warn outside the preferred range, rewrite
/// ephemeral ports to 0.
fn sanitize_port(tcp_port: u16) -> u16 {
    if tcp_port >= EPHEMERAL_PORT_FLOOR {
        tracing::warn!(port = tcp_port, "ephemeral port being recorded; rewriting to 0");
        return 0;
    }
    if !PREFERRED_PORT_RANGE.contains(&tcp_port) {
        tracing::warn!(port = tcp_port, "non-standard port being recorded");
    }
    tcp_port
}

fn keepalive_due(now: Instant, last_broadcast: Option<Instant>) -> bool {
    last_broadcast.map_or(true, |at| now.saturating_duration_since(at) >= KEEPALIVE_INTERVAL)
}

fn eviction_window_open(now: Instant, last_broadcast: Option<Instant>) -> bool {
    last_broadcast
        .is_some_and(|at| now.saturating_duration_since(at) >= KEEPALIVE_TIMEOUT)
}

// ── Worker-side internals ─────────────────────────────────────────────────────

impl HostInner {
    fn live_sessions(&self) -> Vec<Arc<Session>> {
        let mut book = self.book.lock().unwrap();
        // opportunistic zombie sweep
        book.sessions.retain(|_, weak| weak.strong_count() > 0);
        book.sessions
            .values()
            .filter_map(Weak::upgrade)
            .filter(|s| s.is_open())
            .collect()
    }

    fn have_peer_session(&self, id: &NodeId) -> bool {
        self.book
            .lock()
            .unwrap()
            .sessions
            .get(id)
            .and_then(Weak::upgrade)
            .map(|s| s.is_open())
            .unwrap_or(false)
    }

    fn table_add(&self, node: Node) {
        match self.table.lock().unwrap().as_ref() {
            Some(table) => table.add_node(node),
            None => tracing::debug!(node = %node.id, "no node table attached; node dropped"),
        }
    }

    fn our_hello(&self) -> HelloMessage {
        let caps = self
            .active_caps
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.descs())
            .unwrap_or_default();
        HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            client_version: self.client_version.clone(),
            listen_port: self.listen_port.load(Ordering::SeqCst).max(0) as u16,
            id: self.identity.lock().unwrap().public(),
            caps,
        }
    }

    /// Handshake admission checks, each mapped onto its disconnect reason.
    /// `expected` is the dialed node-id for outbound connections.
    fn admit(&self, hello: &HelloMessage, expected: Option<&NodeId>) -> Result<(), DisconnectReason> {
        if hello.id.is_zero() {
            return Err(DisconnectReason::NullIdentity);
        }
        if hello.id == self.identity.lock().unwrap().public() {
            return Err(DisconnectReason::LocalIdentity);
        }
        if let Some(expected) = expected {
            if *expected != hello.id {
                return Err(DisconnectReason::UnexpectedIdentity);
            }
        }
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(DisconnectReason::IncompatibleProtocol);
        }
        if self.have_peer_session(&hello.id) {
            return Err(DisconnectReason::DuplicatePeer);
        }
        if expected.is_none()
            && self.live_sessions().len() >= self.ideal_peers.load(Ordering::SeqCst) as usize
        {
            return Err(DisconnectReason::TooManyPeers);
        }
        Ok(())
    }

    /// Full handshake over a fresh socket. `expected` is `None` for inbound
    /// connections. Failures never propagate beyond the calling task.
    async fn run_handshake(
        &self,
        stream: TcpStream,
        expected: Option<NodeId>,
    ) -> Result<(), HandshakeError> {
        let remote = stream.peer_addr()?;
        let mut framed = Framed::new(stream, FrameCodec);
        let ours = self.our_hello();
        let theirs = exchange_hello(&mut framed, &ours).await?;

        if let Err(reason) = self.admit(&theirs, expected.as_ref()) {
            send_decline(&mut framed, reason).await;
            return Err(HandshakeError::Declined(reason));
        }
        self.register_session(framed, remote, theirs, expected.is_some())
            .map_err(HandshakeError::Declined)
    }

    /// Create the session, wire it into the book, bind capabilities, and
    /// start its I/O tasks. Runs entirely on the worker.
    fn register_session(
        &self,
        framed: Framed<TcpStream, FrameCodec>,
        remote: SocketAddr,
        hello: HelloMessage,
        outbound: bool,
    ) -> Result<(), DisconnectReason> {
        let advertised_port = if hello.listen_port != 0 {
            hello.listen_port
        } else {
            remote.port()
        };
        let (writer, writer_rx) = write_channel();
        let info = PeerSessionInfo {
            id: hello.id,
            client_version: hello.client_version.clone(),
            host: remote.ip().to_string(),
            port: remote.port(),
            last_ping: None,
            caps: Vec::new(),
        };

        let session = {
            let mut book = self.book.lock().unwrap();
            if !self.running.load(Ordering::SeqCst) {
                // raced with the drain: the registry is being torn down
                return Err(DisconnectReason::ClientQuit);
            }
            // the admission check ran unlocked; re-check now that we hold
            // the book
            if let Some(existing) = book.sessions.get(&hello.id).and_then(Weak::upgrade) {
                if existing.is_open() {
                    return Err(DisconnectReason::DuplicatePeer);
                }
            }
            let peer = book
                .peers
                .entry(hello.id)
                .or_insert_with(|| {
                    Arc::new(Peer::new(
                        hello.id,
                        NodeEndpoint::new(remote.ip(), advertised_port, advertised_port),
                    ))
                })
                .clone();
            peer.note_connected(SystemTime::now());

            let session = Session::new(
                peer.clone(),
                remote,
                info,
                writer,
                CancellationToken::new(),
            );
            book.sessions.insert(hello.id, Arc::downgrade(&session));
            peer.attach_session(Arc::downgrade(&session));
            session
        };

        if let Some(caps) = self.active_caps.lock().unwrap().clone() {
            session.install_capabilities(caps.bind(&session, &hello.caps));
        }
        Session::spawn_io(session, framed, writer_rx);
        tracing::info!(
            peer = %hello.id,
            %remote,
            direction = if outbound { "outbound" } else { "inbound" },
            "session established"
        );
        Ok(())
    }

    // ── Acceptor ──────────────────────────────────────────────────────────────

    async fn acceptor_loop(
        inner: Arc<HostInner>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) {
        tracing::info!(
            port = inner.listen_port.load(Ordering::SeqCst),
            "accepting inbound sessions"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        if !inner.running.load(Ordering::SeqCst) {
                            break;
                        }
                        tracing::debug!(%remote, "inbound connection");
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            // handshake errors stay here; the socket drops
                            // with the task
                            if let Err(e) = inner.run_handshake(stream, None).await {
                                tracing::debug!(%remote, error = %e, "inbound handshake failed");
                            }
                        });
                    }
                    Err(e) => {
                        if !inner.running.load(Ordering::SeqCst) {
                            break;
                        }
                        tracing::warn!(error = %e, "accept failed; re-arming");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
        inner.accepting.store(false, Ordering::SeqCst);
    }

    // ── Dialer ────────────────────────────────────────────────────────────────

    /// Dial a peer, at most one in-flight connect per node-id.
    fn connect(inner: &Arc<HostInner>, peer: &Arc<Peer>) {
        if !inner.running.load(Ordering::SeqCst) {
            return;
        }
        let id = peer.id();
        if inner.have_peer_session(&id) {
            tracing::debug!(node = %id, "dial skipped: already connected");
            return;
        }
        let known = inner
            .table
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| t.has_node(&id))
            .unwrap_or(false);
        if !known {
            tracing::debug!(node = %id, "dial skipped: not in node table");
            return;
        }
        if !inner.pending.insert(id) {
            return; // a connect to this peer is already in flight
        }
        let Some(handle) = inner.rt.lock().unwrap().clone() else {
            inner.pending.remove(&id);
            return;
        };

        let inner = inner.clone();
        let peer = peer.clone();
        handle.spawn(async move {
            let endpoint = peer.endpoint().tcp();
            tracing::debug!(node = %peer.id(), %endpoint, "dialing");
            match timeout(DIAL_TIMEOUT, TcpStream::connect(endpoint)).await {
                Ok(Ok(stream)) => {
                    peer.note_connected(SystemTime::now());
                    if let Err(e) = inner.run_handshake(stream, Some(peer.id())).await {
                        tracing::debug!(node = %peer.id(), error = %e, "outbound handshake failed");
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(node = %peer.id(), %endpoint, error = %e, "connect failed");
                    peer.note_dial_failed(SystemTime::now());
                }
                Err(_) => {
                    tracing::debug!(node = %peer.id(), %endpoint, "connect timed out");
                    peer.note_dial_failed(SystemTime::now());
                }
            }
            inner.pending.remove(&peer.id());
        });
    }

    // ── Scheduler ─────────────────────────────────────────────────────────────

    async fn scheduler(inner: Arc<HostInner>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if !inner.running.load(Ordering::SeqCst) {
                inner.drain(&cancel).await;
                break;
            }
            HostInner::pump_table_events(&inner);
            inner.service_sessions();
            inner.keepalive_peers();
            inner.disconnect_late_peers();
        }
        // dropping the interval releases the tick handle stop() polls for
        drop(tick);
        inner.scheduler_live.store(false, Ordering::SeqCst);
    }

    fn pump_table_events(inner: &Arc<HostInner>) {
        let table = inner.table.lock().unwrap().clone();
        let Some(table) = table else { return };
        for event in table.take_events() {
            match event {
                TableEvent::NodeAdded(id) => {
                    let Some(node) = table.node(&id) else { continue };
                    tracing::debug!(node = %id, "node table event: added");
                    let peer = {
                        let mut book = inner.book.lock().unwrap();
                        let peer = book
                            .peers
                            .entry(id)
                            .or_insert_with(|| Arc::new(Peer::new(id, node.endpoint)))
                            .clone();
                        peer.update_endpoint(node.endpoint);
                        peer
                    };
                    if inner.live_sessions().len()
                        < inner.ideal_peers.load(Ordering::SeqCst) as usize
                    {
                        HostInner::connect(inner, &peer);
                    }
                }
                TableEvent::NodeRemoved(id) => {
                    tracing::debug!(node = %id, "node table event: removed");
                    inner.book.lock().unwrap().peers.remove(&id);
                }
            }
        }
    }

    /// Run each live session's outbound-request pump.
    fn service_sessions(&self) {
        let sessions = self.live_sessions();
        if sessions.is_empty() {
            return;
        }
        let nodes: Vec<Node> = {
            let book = self.book.lock().unwrap();
            book.peers.values().map(|p| p.node()).collect()
        };
        for session in sessions {
            session.service_nodes_request(&nodes);
        }
    }

    fn keepalive_peers(&self) {
        let now = Instant::now();
        let mut last = self.last_ping_broadcast.lock().unwrap();
        if !keepalive_due(now, *last) {
            return;
        }
        for session in self.live_sessions() {
            session.ping();
        }
        *last = Some(now);
    }

    fn disconnect_late_peers(&self) {
        let now = Instant::now();
        let last = *self.last_ping_broadcast.lock().unwrap();
        if !eviction_window_open(now, last) {
            return;
        }
        let Some(last) = last else { return };
        for session in self.live_sessions() {
            if session.last_received() < last {
                tracing::info!(peer = %session.id(), "evicting silent session");
                session.disconnect(DisconnectReason::PingTimeout);
            }
        }
    }

    // ── Drain ─────────────────────────────────────────────────────────────────

    /// Shutdown sequence, run by the scheduler once `running` clears:
    /// detach discovery, stop accepting (waiting out any in-flight accept),
    /// stop capabilities, disconnect every session with `ClientQuit`, and
    /// clear the registry.
    async fn drain(&self, cancel: &CancellationToken) {
        *self.table.lock().unwrap() = None;
        cancel.cancel();
        while self.accepting.load(Ordering::SeqCst) {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        if let Some(caps) = self.active_caps.lock().unwrap().clone() {
            caps.on_stopping();
        }

        loop {
            let open = self.live_sessions();
            if open.is_empty() {
                break;
            }
            for session in open {
                session.disconnect(DisconnectReason::ClientQuit);
            }
            // let the write tasks flush the disconnect frames
            tokio::time::sleep(DRAIN_POLL).await;
        }

        self.book.lock().unwrap().sessions.clear();
        tracing::debug!("drain complete");
    }
}
