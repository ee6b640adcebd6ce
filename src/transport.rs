//! # Encrypted Transport
//!
//! QUIC sessions between routers, authenticated by the identity-bound
//! certificates from [`crate::crypto`]:
//!
//! - **Identity-keyed sessions**: one session per peer `RouterId`, dialed via
//!   the addresses in the peer's NetDB descriptor
//! - **Idempotent connect**: an established session is reused; concurrent
//!   dials to the same peer coalesce onto one handshake
//! - **Ordered framing**: length-prefixed bincode frames on one send stream
//!   per session preserve per-peer order
//! - **Bounded retry**: failed dials back off exponentially per peer
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `connect(id)` | Ensure a session with a known peer exists |
//! | `connect_addr(addr)` | Bootstrap dial to a bare address, learns the id |
//! | `send(id, msg)` | Queue one message on the peer's session |
//! | `add_ref(id)` / `release(id)` | Pin a session for a tunnel hop |
//! | `take_inbound()` | Claim the inbound delivery queue (once) |
//!
//! ## Actor Architecture
//!
//! - `Transport`: public cheap-clone handle
//! - `TransportActor`: private task owning the session table, dial dedup,
//!   and backoff state
//! - Dials and per-session stream I/O run in spawned tasks that report back
//!   over the command channel, so the actor never blocks on the network
//!
//! ## Session Lifecycle
//!
//! Every new session first sends a `DatabaseStore` carrying our own
//! descriptor, then a small sample of other known routers (handshake
//! gossip). Sessions carry a reference count held by tunnel hops; a session
//! with zero references that sits idle past the configured timeout is
//! closed by the maintenance tick.
//!
//! ## Security
//!
//! - The TLS handshake is the authenticated key exchange: the certificate
//!   key must hash to the dialed `RouterId` or the dial fails
//! - Inbound connections without a verifiable identity are rejected before
//!   any frame is read
//! - Frame sizes are bounded before allocation

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use lru::LruCache;
use quinn::{ClientConfig, Connection, Endpoint};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::crypto::{
    create_client_config, create_server_config, extract_verified_router_id, generate_ed25519_cert,
    router_id_to_sni, BOOTSTRAP_SNI,
};
use crate::identity::{RouterId, RouterInfo, RouterKeys};
use crate::messages::{
    decode_message, encode_message, NetDbEntry, RouterMessage, MAX_DESERIALIZE_SIZE,
};
use crate::netdb::{NetDb, GOSSIP_SAMPLE};

/// Sessions kept; the least-recently-used one is closed beyond this.
const MAX_SESSIONS: usize = 256;

/// Outbound frames queued per session before `send` reports backpressure.
const SESSION_SEND_QUEUE: usize = 256;

/// Inbound delivery queue shared by all sessions. Readers await on a full
/// queue, which backpressures the peers instead of buffering without bound.
const INBOUND_QUEUE: usize = 1024;

/// Ceiling on one dial attempt, handshake included.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// First retry delay after a failed dial; doubles per consecutive failure.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Retry delay cap.
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Largest doubling applied to `BACKOFF_BASE`.
const BACKOFF_MAX_SHIFT: u32 = 6;

/// Failed-dial records kept; older peers fall off the end.
const MAX_BACKOFF_TRACKED: usize = 1024;

/// Ceiling of the maintenance cadence. Short idle timeouts tighten it so
/// sessions are reaped soon after they qualify.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Floor of the maintenance cadence.
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(25);

// ============================================================================
// Error Types
// ============================================================================

/// A session with the requested peer could not be established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// No descriptor for the peer is known, so there is nothing to dial.
    NoRoute,
    /// A recent dial to this peer failed; retry after the backoff window.
    Backoff,
    /// Every dialable address failed the handshake.
    HandshakeFailed(String),
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::NoRoute => write!(f, "no known address for peer"),
            ConnectError::Backoff => write!(f, "peer is in dial backoff"),
            ConnectError::HandshakeFailed(reason) => write!(f, "handshake failed: {}", reason),
        }
    }
}

impl std::error::Error for ConnectError {}

/// A message could not be queued on a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// No session with the peer exists; `connect` first.
    NoSession,
    /// The session's outbound queue is full.
    Backpressure,
    /// The session closed underneath the send.
    Closed,
    /// The encoded message exceeds the frame size peers accept.
    Oversize,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::NoSession => write!(f, "no session with peer"),
            SendError::Backpressure => write!(f, "session send queue is full"),
            SendError::Closed => write!(f, "session closed"),
            SendError::Oversize => write!(f, "message exceeds frame size limit"),
        }
    }
}

impl std::error::Error for SendError {}

// ============================================================================
// Bandwidth Accounting
// ============================================================================

/// Shared byte totals, split by direction plus transit-forwarded traffic.
///
/// Counters only ever grow; rate calculation is the caller's business
/// (snapshot twice, divide by the interval).
#[derive(Debug, Default)]
pub struct BandwidthCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    bytes_transit: AtomicU64,
}

impl BandwidthCounters {
    #[inline]
    pub fn add_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_transit(&self, n: u64) {
        self.bytes_transit.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BandwidthSnapshot {
        BandwidthSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            bytes_transit: self.bytes_transit.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub bytes_transit: u64,
}

// ============================================================================
// Transport Handle
// ============================================================================

/// Inbound queue slot, claimable exactly once by the message switch.
type InboundSlot = tokio::sync::Mutex<Option<mpsc::Receiver<(RouterId, RouterMessage)>>>;

/// Handle to the transport actor. Cheap to clone; all clones address the
/// same session table.
#[derive(Clone)]
pub struct Transport {
    cmd_tx: mpsc::Sender<Command>,
    endpoint: Endpoint,
    local_info: RouterInfo,
    counters: Arc<BandwidthCounters>,
    inbound_rx: Arc<InboundSlot>,
}

impl Transport {
    /// Bind the QUIC endpoint and start the transport actor.
    ///
    /// `advertised` becomes the address list of our signed descriptor; when
    /// empty, the actually-bound address is advertised instead (which is only
    /// dialable when the bind address is concrete, as in tests binding
    /// 127.0.0.1 port 0).
    pub async fn bind(
        bind_addr: SocketAddr,
        keys: &RouterKeys,
        advertised: Vec<String>,
        capabilities: u8,
        netdb: NetDb,
        idle_timeout: Duration,
    ) -> Result<Self> {
        let (server_certs, server_key) = generate_ed25519_cert(keys)?;
        let server_config = create_server_config(server_certs, server_key)?;

        let (client_certs, client_key) = generate_ed25519_cert(keys)?;
        let client_config = create_client_config(client_certs, client_key)?;

        let endpoint = Endpoint::server(server_config, bind_addr)
            .with_context(|| format!("failed to bind QUIC endpoint on {}", bind_addr))?;
        let local_addr = endpoint
            .local_addr()
            .context("bound endpoint has no local address")?;

        let addrs = if advertised.is_empty() {
            vec![local_addr.to_string()]
        } else {
            advertised
        };
        let local_info = keys.create_router_info(addrs, capabilities);

        let counters = Arc::new(BandwidthCounters::default());
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);

        let actor = TransportActor {
            local_id: local_info.id(),
            local_info: local_info.clone(),
            netdb,
            endpoint: endpoint.clone(),
            client_config,
            sessions: LruCache::new(
                NonZeroUsize::new(MAX_SESSIONS).expect("session capacity is nonzero"),
            ),
            backoff: LruCache::new(
                NonZeroUsize::new(MAX_BACKOFF_TRACKED).expect("backoff capacity is nonzero"),
            ),
            waiters: HashMap::new(),
            idle_timeout,
            next_generation: 0,
            counters: counters.clone(),
            inbound_tx,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
        };
        tokio::spawn(actor.run());
        tokio::spawn(run_accept_loop(endpoint.clone(), cmd_tx.clone()));

        info!(addr = %local_addr, id = %local_info.id().short(), "transport listening");

        Ok(Self {
            cmd_tx,
            endpoint,
            local_info,
            counters,
            inbound_rx: Arc::new(tokio::sync::Mutex::new(Some(inbound_rx))),
        })
    }

    /// The address the endpoint actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .context("endpoint has no local address")
    }

    /// Our signed descriptor, as advertised to peers on every new session.
    pub fn local_info(&self) -> &RouterInfo {
        &self.local_info
    }

    pub fn local_id(&self) -> RouterId {
        self.local_info.id()
    }

    /// Ensure a session with `peer` exists.
    ///
    /// Idempotent: an established session returns immediately, and
    /// concurrent calls for the same peer share one dial. Addresses come
    /// from the peer's NetDB descriptor.
    pub async fn connect(&self, peer: RouterId) -> Result<(), ConnectError> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Connect(peer, tx)).await.is_err() {
            return Err(ConnectError::HandshakeFailed(
                "transport actor unavailable".to_string(),
            ));
        }
        rx.await.unwrap_or_else(|_| {
            Err(ConnectError::HandshakeFailed(
                "transport actor unavailable".to_string(),
            ))
        })
    }

    /// Dial a bare address whose router identity is not yet known and return
    /// the identity learned from its certificate. Used for bootstrap peers
    /// given as plain `host:port`.
    pub async fn connect_addr(&self, addr: SocketAddr) -> Result<RouterId, ConnectError> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::ConnectAddr(addr, tx))
            .await
            .is_err()
        {
            return Err(ConnectError::HandshakeFailed(
                "transport actor unavailable".to_string(),
            ));
        }
        rx.await.unwrap_or_else(|_| {
            Err(ConnectError::HandshakeFailed(
                "transport actor unavailable".to_string(),
            ))
        })
    }

    /// Queue one message on the peer's session.
    ///
    /// Frames on a session are delivered in `send` order. The call never
    /// dials; a missing session is the caller's cue to `connect` first.
    pub async fn send(&self, peer: RouterId, message: &RouterMessage) -> Result<(), SendError> {
        let frame = encode_message(message).map_err(|_| SendError::Oversize)?;
        if frame.len() as u64 > MAX_DESERIALIZE_SIZE {
            return Err(SendError::Oversize);
        }
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Send(peer, frame, tx))
            .await
            .is_err()
        {
            return Err(SendError::Closed);
        }
        rx.await.unwrap_or(Err(SendError::Closed))
    }

    /// Pin the peer's session open for a tunnel hop.
    pub async fn add_ref(&self, peer: RouterId) {
        let _ = self.cmd_tx.send(Command::AddRef(peer)).await;
    }

    /// Drop one pin. A session at zero pins idles out after the configured
    /// timeout.
    pub async fn release(&self, peer: RouterId) {
        let _ = self.cmd_tx.send(Command::Release(peer)).await;
    }

    /// Claim the inbound delivery queue. The first caller gets the receiver;
    /// later calls return `None`.
    pub async fn take_inbound(&self) -> Option<mpsc::Receiver<(RouterId, RouterMessage)>> {
        self.inbound_rx.lock().await.take()
    }

    /// Shared bandwidth totals.
    pub fn counters(&self) -> Arc<BandwidthCounters> {
        self.counters.clone()
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::SessionCount(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Identities of peers with a live session, most recently used first.
    pub async fn connected_peers(&self) -> Vec<RouterId> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::ConnectedPeers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop the actor and close the endpoint. Peers observe a clean close.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
        self.endpoint.close(0u32.into(), b"router stopping");
        self.endpoint.wait_idle().await;
    }
}

// ============================================================================
// Commands
// ============================================================================

enum Command {
    Connect(RouterId, oneshot::Sender<Result<(), ConnectError>>),
    ConnectAddr(SocketAddr, oneshot::Sender<Result<RouterId, ConnectError>>),
    DialFinished(RouterId, Result<Connection, ConnectError>),
    BootstrapFinished(
        Result<(RouterId, Connection), ConnectError>,
        oneshot::Sender<Result<RouterId, ConnectError>>,
    ),
    Send(RouterId, Vec<u8>, oneshot::Sender<Result<(), SendError>>),
    AddRef(RouterId),
    Release(RouterId),
    InboundEstablished(RouterId, Connection),
    SessionClosed(RouterId, u64),
    SessionCount(oneshot::Sender<usize>),
    ConnectedPeers(oneshot::Sender<Vec<RouterId>>),
    Quit,
}

// ============================================================================
// Actor
// ============================================================================

struct SessionEntry {
    conn: Connection,
    out_tx: mpsc::Sender<Vec<u8>>,
    refs: u32,
    last_activity: Instant,
    generation: u64,
}

struct BackoffEntry {
    failures: u32,
    next_attempt: Instant,
}

struct TransportActor {
    local_id: RouterId,
    local_info: RouterInfo,
    netdb: NetDb,
    endpoint: Endpoint,
    client_config: ClientConfig,
    sessions: LruCache<RouterId, SessionEntry>,
    backoff: LruCache<RouterId, BackoffEntry>,
    waiters: HashMap<RouterId, Vec<oneshot::Sender<Result<(), ConnectError>>>>,
    idle_timeout: Duration,
    next_generation: u64,
    counters: Arc<BandwidthCounters>,
    inbound_tx: mpsc::Sender<(RouterId, RouterMessage)>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
}

impl TransportActor {
    async fn run(mut self) {
        let cadence = self
            .idle_timeout
            .min(CLEANUP_INTERVAL)
            .max(MIN_CLEANUP_INTERVAL);
        let mut maintenance = tokio::time::interval(cadence);
        maintenance.tick().await; // Skip initial tick

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Connect(peer, reply)) => self.handle_connect(peer, reply),
                    Some(Command::ConnectAddr(addr, reply)) => self.handle_connect_addr(addr, reply),
                    Some(Command::DialFinished(peer, result)) => self.handle_dial_finished(peer, result),
                    Some(Command::BootstrapFinished(result, reply)) => {
                        self.handle_bootstrap_finished(result, reply)
                    }
                    Some(Command::Send(peer, frame, reply)) => {
                        let _ = reply.send(self.queue_frame(peer, frame));
                    }
                    Some(Command::AddRef(peer)) => {
                        if let Some(entry) = self.sessions.get_mut(&peer) {
                            entry.refs += 1;
                        }
                    }
                    Some(Command::Release(peer)) => {
                        if let Some(entry) = self.sessions.get_mut(&peer) {
                            entry.refs = entry.refs.saturating_sub(1);
                        }
                    }
                    Some(Command::InboundEstablished(peer, conn)) => {
                        self.handle_inbound_established(peer, conn)
                    }
                    Some(Command::SessionClosed(peer, generation)) => {
                        self.handle_session_closed(peer, generation)
                    }
                    Some(Command::SessionCount(reply)) => {
                        let _ = reply.send(self.live_session_count());
                    }
                    Some(Command::ConnectedPeers(reply)) => {
                        let peers = self
                            .sessions
                            .iter()
                            .filter(|(_, entry)| entry.conn.close_reason().is_none())
                            .map(|(id, _)| *id)
                            .collect();
                        let _ = reply.send(peers);
                    }
                    Some(Command::Quit) | None => {
                        debug!("transport actor stopped");
                        break;
                    }
                },
                _ = maintenance.tick() => self.reap_sessions(),
            }
        }

        while let Some((_, entry)) = self.sessions.pop_lru() {
            entry.conn.close(0u32.into(), b"router stopping");
        }
    }

    fn handle_connect(&mut self, peer: RouterId, reply: oneshot::Sender<Result<(), ConnectError>>) {
        if self.live_session(&peer) {
            if let Some(entry) = self.sessions.get_mut(&peer) {
                entry.last_activity = Instant::now();
            }
            let _ = reply.send(Ok(()));
            return;
        }

        // A dial for this peer is already in flight; share its outcome.
        if let Some(waiters) = self.waiters.get_mut(&peer) {
            waiters.push(reply);
            return;
        }

        if let Some(entry) = self.backoff.peek(&peer) {
            if Instant::now() < entry.next_attempt {
                trace!(peer = %peer.short(), "dial suppressed by backoff");
                let _ = reply.send(Err(ConnectError::Backoff));
                return;
            }
        }

        debug!(peer = %peer.short(), "dialing");
        self.waiters.insert(peer, vec![reply]);
        let endpoint = self.endpoint.clone();
        let config = self.client_config.clone();
        let netdb = self.netdb.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = dial_peer(&endpoint, config, &netdb, peer).await;
            let _ = cmd_tx.send(Command::DialFinished(peer, result)).await;
        });
    }

    fn handle_connect_addr(
        &mut self,
        addr: SocketAddr,
        reply: oneshot::Sender<Result<RouterId, ConnectError>>,
    ) {
        debug!(%addr, "dialing bootstrap address");
        let endpoint = self.endpoint.clone();
        let config = self.client_config.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = dial_addr(&endpoint, config, addr).await;
            let _ = cmd_tx.send(Command::BootstrapFinished(result, reply)).await;
        });
    }

    fn handle_dial_finished(&mut self, peer: RouterId, result: Result<Connection, ConnectError>) {
        match result {
            Ok(conn) => {
                self.backoff.pop(&peer);
                if self.live_session(&peer) {
                    // Simultaneous open. Both sides keep the connection whose
                    // dialer has the smaller id, so they converge instead of
                    // closing each other's pick.
                    if self.local_id < peer {
                        debug!(peer = %peer.short(), "crossed dials, our connection wins");
                        self.install_session(peer, conn);
                    } else {
                        debug!(peer = %peer.short(), "crossed dials, peer's connection wins");
                        conn.close(0u32.into(), b"duplicate session");
                    }
                } else {
                    self.install_session(peer, conn);
                }
                self.finish_waiters(&peer, Ok(()));
            }
            Err(err) => {
                if self.live_session(&peer) {
                    // The peer dialed us while our dial was failing; the
                    // inbound session serves the callers fine.
                    self.finish_waiters(&peer, Ok(()));
                    return;
                }
                self.record_dial_failure(peer, &err);
                self.finish_waiters(&peer, Err(err));
            }
        }
    }

    fn handle_bootstrap_finished(
        &mut self,
        result: Result<(RouterId, Connection), ConnectError>,
        reply: oneshot::Sender<Result<RouterId, ConnectError>>,
    ) {
        match result {
            Ok((peer, conn)) => {
                if peer == self.local_id {
                    conn.close(0u32.into(), b"self connection");
                    let _ = reply.send(Err(ConnectError::HandshakeFailed(
                        "bootstrap address points back at this router".to_string(),
                    )));
                    return;
                }
                self.backoff.pop(&peer);
                if self.live_session(&peer) {
                    conn.close(0u32.into(), b"duplicate session");
                } else {
                    self.install_session(peer, conn);
                }
                self.finish_waiters(&peer, Ok(()));
                let _ = reply.send(Ok(peer));
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    fn handle_inbound_established(&mut self, peer: RouterId, conn: Connection) {
        if peer == self.local_id {
            warn!(remote = %conn.remote_address(), "rejecting connection presenting our own identity");
            conn.close(0u32.into(), b"self connection");
            return;
        }
        if self.live_session(&peer) {
            if peer < self.local_id {
                // Crossed dials; the peer's connection wins the tie.
                debug!(peer = %peer.short(), "crossed dials, replacing with peer's connection");
                self.install_session(peer, conn);
            } else {
                // Keep our session for sending but read the peer's frames
                // until one of the connections dies.
                debug!(peer = %peer.short(), "extra connection from peer, reading only");
                let generation = self.next_generation;
                self.next_generation += 1;
                tokio::spawn(run_session_streams(
                    conn,
                    peer,
                    generation,
                    self.inbound_tx.clone(),
                    self.counters.clone(),
                    self.cmd_tx.clone(),
                ));
            }
            return;
        }
        self.install_session(peer, conn);
        self.finish_waiters(&peer, Ok(()));
    }

    fn handle_session_closed(&mut self, peer: RouterId, generation: u64) {
        // Stale notices from a superseded connection's tasks carry an old
        // generation and must not tear down the replacement.
        let current = self.sessions.peek(&peer).map(|entry| entry.generation);
        if current == Some(generation) {
            if let Some(entry) = self.sessions.pop(&peer) {
                entry.conn.close(0u32.into(), b"session closed");
                debug!(peer = %peer.short(), "session closed");
            }
        }
    }

    /// Install a session for `peer`, spawning its writer and reader tasks
    /// and queueing the handshake gossip.
    fn install_session(&mut self, peer: RouterId, conn: Connection) {
        let generation = self.next_generation;
        self.next_generation += 1;
        let remote = conn.remote_address();

        let (out_tx, out_rx) = mpsc::channel(SESSION_SEND_QUEUE);

        tokio::spawn(run_session_writer(
            conn.clone(),
            out_rx,
            peer,
            generation,
            self.counters.clone(),
            self.cmd_tx.clone(),
        ));
        tokio::spawn(run_session_streams(
            conn.clone(),
            peer,
            generation,
            self.inbound_tx.clone(),
            self.counters.clone(),
            self.cmd_tx.clone(),
        ));

        // Our own descriptor is the first frame on every session; a sample
        // of other known routers follows once the lookup completes.
        let own = RouterMessage::DatabaseStore {
            entry: NetDbEntry::Router(self.local_info.clone()),
        };
        match encode_message(&own) {
            Ok(frame) => {
                let _ = out_tx.try_send(frame);
            }
            Err(e) => warn!(error = %e, "could not encode own descriptor"),
        }
        let netdb = self.netdb.clone();
        let gossip_tx = out_tx.clone();
        tokio::spawn(async move {
            for info in netdb.random_routers(GOSSIP_SAMPLE, &[peer]).await {
                let message = RouterMessage::DatabaseStore {
                    entry: NetDbEntry::Router(info),
                };
                let Ok(frame) = encode_message(&message) else {
                    continue;
                };
                if gossip_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        // A replaced session keeps its reference count; tunnel hops pin the
        // peer, not one particular connection.
        let refs = self.sessions.peek(&peer).map(|e| e.refs).unwrap_or(0);
        let entry = SessionEntry {
            conn,
            out_tx,
            refs,
            last_activity: Instant::now(),
            generation,
        };

        info!(peer = %peer.short(), remote = %remote, "session established");
        if let Some((old_id, old)) = self.sessions.push(peer, entry) {
            if old_id == peer {
                debug!(peer = %peer.short(), "superseded previous session");
            } else {
                debug!(peer = %old_id.short(), "session table full, evicting");
            }
            old.conn.close(0u32.into(), b"superseded");
        }
    }

    fn queue_frame(&mut self, peer: RouterId, frame: Vec<u8>) -> Result<(), SendError> {
        let Some(entry) = self.sessions.get_mut(&peer) else {
            return Err(SendError::NoSession);
        };
        if entry.conn.close_reason().is_some() {
            return Err(SendError::Closed);
        }
        match entry.out_tx.try_send(frame) {
            Ok(()) => {
                entry.last_activity = Instant::now();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    fn finish_waiters(&mut self, peer: &RouterId, result: Result<(), ConnectError>) {
        if let Some(waiters) = self.waiters.remove(peer) {
            for tx in waiters {
                let _ = tx.send(result.clone());
            }
        }
    }

    fn record_dial_failure(&mut self, peer: RouterId, err: &ConnectError) {
        let failures = self
            .backoff
            .peek(&peer)
            .map(|entry| entry.failures)
            .unwrap_or(0)
            + 1;
        let delay = backoff_delay(failures);
        self.backoff.put(
            peer,
            BackoffEntry {
                failures,
                next_attempt: Instant::now() + delay,
            },
        );
        debug!(
            peer = %peer.short(),
            failures,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "dial failed, backing off"
        );
    }

    fn live_session(&self, peer: &RouterId) -> bool {
        self.sessions
            .peek(peer)
            .map(|entry| entry.conn.close_reason().is_none())
            .unwrap_or(false)
    }

    fn live_session_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|(_, entry)| entry.conn.close_reason().is_none())
            .count()
    }

    fn reap_sessions(&mut self) {
        let now = Instant::now();
        let mut drop_list: Vec<(RouterId, &'static str)> = Vec::new();
        for (id, entry) in self.sessions.iter() {
            if entry.conn.close_reason().is_some() {
                drop_list.push((*id, "connection lost"));
            } else if entry.refs == 0
                && now.duration_since(entry.last_activity) >= self.idle_timeout
            {
                drop_list.push((*id, "idle"));
            }
        }
        for (id, why) in drop_list {
            if let Some(entry) = self.sessions.pop(&id) {
                entry.conn.close(0u32.into(), b"reaped");
                debug!(peer = %id.short(), reason = why, "reaping session");
            }
        }
    }
}

/// Exponential backoff ladder: 1s, 2s, 4s, ... capped at `BACKOFF_MAX`.
fn backoff_delay(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(BACKOFF_MAX_SHIFT);
    (BACKOFF_BASE * 2u32.pow(shift)).min(BACKOFF_MAX)
}

// ============================================================================
// Dial Tasks
// ============================================================================

async fn dial_peer(
    endpoint: &Endpoint,
    config: ClientConfig,
    netdb: &NetDb,
    peer: RouterId,
) -> Result<Connection, ConnectError> {
    let Some(info) = netdb.lookup_router(peer).await else {
        return Err(ConnectError::NoRoute);
    };

    let sni = router_id_to_sni(&peer);
    let mut last_error = "no dialable address in descriptor".to_string();

    for addr_str in &info.addrs {
        let Ok(addr) = addr_str.parse::<SocketAddr>() else {
            continue;
        };
        let connecting = match endpoint.connect_with(config.clone(), addr, &sni) {
            Ok(c) => c,
            Err(e) => {
                last_error = e.to_string();
                continue;
            }
        };
        match tokio::time::timeout(DIAL_TIMEOUT, connecting).await {
            Ok(Ok(conn)) => {
                // SECURITY: the verifier already pinned the certificate to
                // the dialed id; re-derive it as a final cross-check.
                match extract_verified_router_id(&conn) {
                    Some(id) if id == peer => return Ok(conn),
                    _ => {
                        conn.close(0u32.into(), b"identity mismatch");
                        last_error = "certificate does not match expected identity".to_string();
                    }
                }
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("dial to {} timed out", addr),
        }
    }

    Err(ConnectError::HandshakeFailed(last_error))
}

async fn dial_addr(
    endpoint: &Endpoint,
    config: ClientConfig,
    addr: SocketAddr,
) -> Result<(RouterId, Connection), ConnectError> {
    let connecting = endpoint
        .connect_with(config, addr, BOOTSTRAP_SNI)
        .map_err(|e| ConnectError::HandshakeFailed(e.to_string()))?;
    let conn = match tokio::time::timeout(DIAL_TIMEOUT, connecting).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => return Err(ConnectError::HandshakeFailed(e.to_string())),
        Err(_) => {
            return Err(ConnectError::HandshakeFailed(format!(
                "dial to {} timed out",
                addr
            )))
        }
    };
    let Some(peer) = extract_verified_router_id(&conn) else {
        conn.close(0u32.into(), b"unverified identity");
        return Err(ConnectError::HandshakeFailed(
            "peer certificate carries no usable identity".to_string(),
        ));
    };
    Ok((peer, conn))
}

// ============================================================================
// Session Tasks
// ============================================================================

/// Writes queued frames to one send stream, in queue order.
async fn run_session_writer(
    conn: Connection,
    mut frames: mpsc::Receiver<Vec<u8>>,
    peer: RouterId,
    generation: u64,
    counters: Arc<BandwidthCounters>,
    cmd_tx: mpsc::Sender<Command>,
) {
    let mut stream = match conn.open_uni().await {
        Ok(s) => s,
        Err(e) => {
            debug!(peer = %peer.short(), error = %e, "could not open send stream");
            let _ = cmd_tx.send(Command::SessionClosed(peer, generation)).await;
            return;
        }
    };

    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_frame(&mut stream, &frame).await {
            debug!(peer = %peer.short(), error = %e, "send stream closed");
            break;
        }
        counters.add_out((4 + frame.len()) as u64);
    }

    let _ = stream.finish();
    let _ = cmd_tx.send(Command::SessionClosed(peer, generation)).await;
}

async fn write_frame(
    stream: &mut quinn::SendStream,
    frame: &[u8],
) -> Result<(), quinn::WriteError> {
    stream
        .write_all(&(frame.len() as u32).to_be_bytes())
        .await?;
    stream.write_all(frame).await?;
    Ok(())
}

/// Accepts the peer's streams on one connection and spawns a frame reader
/// for each. Exits when the connection dies.
async fn run_session_streams(
    conn: Connection,
    peer: RouterId,
    generation: u64,
    inbound_tx: mpsc::Sender<(RouterId, RouterMessage)>,
    counters: Arc<BandwidthCounters>,
    cmd_tx: mpsc::Sender<Command>,
) {
    let remote = conn.remote_address();
    loop {
        let stream = match conn.accept_uni().await {
            Ok(s) => s,
            Err(quinn::ConnectionError::ApplicationClosed(_)) => {
                debug!(peer = %peer.short(), remote = %remote, "connection closed by peer");
                break;
            }
            Err(quinn::ConnectionError::TimedOut) => {
                debug!(peer = %peer.short(), remote = %remote, "connection idle timeout");
                break;
            }
            Err(quinn::ConnectionError::LocallyClosed) => break,
            Err(e) => {
                debug!(peer = %peer.short(), remote = %remote, error = %e, "connection lost");
                break;
            }
        };

        let inbound_tx = inbound_tx.clone();
        let counters = counters.clone();
        tokio::spawn(read_frames(stream, peer, inbound_tx, counters));
    }
    let _ = cmd_tx.send(Command::SessionClosed(peer, generation)).await;
}

/// Reads length-prefixed frames off one stream and forwards the decoded
/// messages to the inbound queue.
async fn read_frames(
    mut stream: quinn::RecvStream,
    peer: RouterId,
    inbound_tx: mpsc::Sender<(RouterId, RouterMessage)>,
    counters: Arc<BandwidthCounters>,
) {
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(()) => {}
            Err(quinn::ReadExactError::FinishedEarly(0)) => break,
            Err(quinn::ReadExactError::FinishedEarly(n)) => {
                debug!(peer = %peer.short(), trailing = n, "stream ended mid-frame");
                break;
            }
            Err(quinn::ReadExactError::ReadError(e)) => {
                trace!(peer = %peer.short(), error = %e, "receive stream closed");
                break;
            }
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len as u64 > MAX_DESERIALIZE_SIZE {
            warn!(peer = %peer.short(), size = len, "dropping oversize frame and its stream");
            let _ = stream.stop(0u32.into());
            break;
        }

        let mut frame = vec![0u8; len];
        if stream.read_exact(&mut frame).await.is_err() {
            debug!(peer = %peer.short(), "stream ended mid-frame");
            break;
        }
        counters.add_in((4 + len) as u64);

        match decode_message(&frame) {
            Ok(message) => {
                trace!(peer = %peer.short(), kind = message.kind(), "frame received");
                // Await so a slow message switch backpressures the peer.
                if inbound_tx.send((peer, message)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, "dropping undecodable frame and its stream");
                let _ = stream.stop(0u32.into());
                break;
            }
        }
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

async fn run_accept_loop(endpoint: Endpoint, cmd_tx: mpsc::Sender<Command>) {
    while let Some(incoming) = endpoint.accept().await {
        let cmd_tx = cmd_tx.clone();
        tokio::spawn(async move {
            match incoming.await {
                Ok(conn) => {
                    let remote = conn.remote_address();
                    let Some(peer) = extract_verified_router_id(&conn) else {
                        warn!(remote = %remote, "rejecting connection: could not verify peer identity");
                        conn.close(0u32.into(), b"unverified identity");
                        return;
                    };
                    let _ = cmd_tx.send(Command::InboundEstablished(peer, conn)).await;
                }
                Err(e) => debug!(error = %e, "inbound handshake failed"),
            }
        });
    }
    debug!("transport accept loop stopped");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{CAP_REACHABLE, CAP_TRANSIT};
    use crate::netdb::{AnyPeer, DEFAULT_ROUTER_TTL_SECS};
    use tokio::time::timeout;

    const RECV_WAIT: Duration = Duration::from_secs(5);

    async fn spawn_transport(idle_timeout: Duration) -> (Transport, NetDb, RouterKeys) {
        let keys = RouterKeys::generate();
        let netdb = NetDb::new(keys.id(), DEFAULT_ROUTER_TTL_SECS, Arc::new(AnyPeer));
        let transport = Transport::bind(
            "127.0.0.1:0".parse().unwrap(),
            &keys,
            vec![],
            CAP_TRANSIT | CAP_REACHABLE,
            netdb.clone(),
            idle_timeout,
        )
        .await
        .expect("transport must bind on loopback");
        (transport, netdb, keys)
    }

    async fn recv_from(
        inbound: &mut mpsc::Receiver<(RouterId, RouterMessage)>,
    ) -> (RouterId, RouterMessage) {
        timeout(RECV_WAIT, inbound.recv())
            .await
            .expect("inbound message within deadline")
            .expect("inbound queue open")
    }

    #[test]
    fn backoff_ladder_doubles_to_cap() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(7), Duration::from_secs(60));
        assert_eq!(backoff_delay(100), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn bind_advertises_bound_address() {
        let (transport, _db, keys) = spawn_transport(Duration::from_secs(60)).await;
        let addr = transport.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let info = transport.local_info();
        assert_eq!(info.id(), keys.id());
        assert_eq!(info.primary_socket_addr(), Some(addr));
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn connect_sends_own_descriptor_then_frames_in_order() {
        let (ta, dba, ka) = spawn_transport(Duration::from_secs(60)).await;
        let (tb, _dbb, kb) = spawn_transport(Duration::from_secs(60)).await;

        dba.store_router_info(tb.local_info().clone())
            .await
            .expect("fresh descriptor stores");
        ta.connect(kb.id()).await.expect("dial by id succeeds");

        let mut inbound_b = tb.take_inbound().await.expect("first take gets the queue");
        assert!(tb.take_inbound().await.is_none());

        let (from, first) = recv_from(&mut inbound_b).await;
        assert_eq!(from, ka.id());
        match first {
            RouterMessage::DatabaseStore {
                entry: NetDbEntry::Router(info),
            } => assert_eq!(info.id(), ka.id()),
            other => panic!("expected the dialer's descriptor first, got {}", other.kind()),
        }

        for counter in 0..10u64 {
            ta.send(
                kb.id(),
                &RouterMessage::TunnelData {
                    tunnel_id: 7,
                    counter,
                    payload: vec![counter as u8; 3],
                },
            )
            .await
            .expect("send on live session");
        }
        for expected in 0..10u64 {
            let (_, message) = recv_from(&mut inbound_b).await;
            match message {
                RouterMessage::TunnelData { counter, .. } => assert_eq!(counter, expected),
                other => panic!("expected tunnel data, got {}", other.kind()),
            }
        }

        ta.shutdown().await;
        tb.shutdown().await;
    }

    #[tokio::test]
    async fn connect_is_idempotent_and_coalesced() {
        let (ta, dba, _ka) = spawn_transport(Duration::from_secs(60)).await;
        let (tb, _dbb, kb) = spawn_transport(Duration::from_secs(60)).await;

        dba.store_router_info(tb.local_info().clone()).await.unwrap();

        let (r1, r2) = tokio::join!(ta.connect(kb.id()), ta.connect(kb.id()));
        r1.expect("first concurrent dial");
        r2.expect("second concurrent dial");
        ta.connect(kb.id()).await.expect("repeat connect is a no-op");

        assert_eq!(ta.session_count().await, 1);

        ta.shutdown().await;
        tb.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_peer_is_no_route_then_backoff() {
        let (ta, _dba, _ka) = spawn_transport(Duration::from_secs(60)).await;
        let stranger = RouterKeys::generate().id();

        assert_eq!(ta.connect(stranger).await, Err(ConnectError::NoRoute));
        // The failed dial is recorded; an immediate retry is suppressed.
        assert_eq!(ta.connect(stranger).await, Err(ConnectError::Backoff));
        ta.shutdown().await;
    }

    #[tokio::test]
    async fn descriptor_without_dialable_address_fails_handshake() {
        let (ta, dba, _ka) = spawn_transport(Duration::from_secs(60)).await;
        let other = RouterKeys::generate();
        let info = other.create_router_info(
            vec!["not-an-address".to_string()],
            CAP_TRANSIT | CAP_REACHABLE,
        );
        dba.store_router_info(info).await.unwrap();

        match ta.connect(other.id()).await {
            Err(ConnectError::HandshakeFailed(_)) => {}
            other => panic!("expected handshake failure, got {:?}", other),
        }
        ta.shutdown().await;
    }

    #[tokio::test]
    async fn mismatched_identity_is_rejected() {
        let (ta, dba, _ka) = spawn_transport(Duration::from_secs(60)).await;
        let (tb, _dbb, _kb) = spawn_transport(Duration::from_secs(60)).await;

        // A descriptor claiming b's address under a different identity. The
        // dial reaches b, whose certificate cannot match the claimed id.
        let imposter = RouterKeys::generate();
        let claimed = imposter.create_router_info(
            vec![tb.local_addr().unwrap().to_string()],
            CAP_TRANSIT | CAP_REACHABLE,
        );
        dba.store_router_info(claimed).await.unwrap();

        match ta.connect(imposter.id()).await {
            Err(ConnectError::HandshakeFailed(_)) => {}
            other => panic!("expected handshake failure, got {:?}", other),
        }
        assert_eq!(ta.session_count().await, 0);

        ta.shutdown().await;
        tb.shutdown().await;
    }

    #[tokio::test]
    async fn bootstrap_dial_learns_peer_identity() {
        let (ta, _dba, ka) = spawn_transport(Duration::from_secs(60)).await;
        let (tb, _dbb, kb) = spawn_transport(Duration::from_secs(60)).await;

        let learned = ta
            .connect_addr(tb.local_addr().unwrap())
            .await
            .expect("bootstrap dial succeeds");
        assert_eq!(learned, kb.id());
        assert_eq!(ta.session_count().await, 1);

        // The learned session is a full session: sends work and b saw our
        // descriptor as the first frame.
        ta.send(kb.id(), &RouterMessage::Garlic { blob: vec![1, 2, 3] })
            .await
            .expect("send on bootstrap session");

        let mut inbound_b = tb.take_inbound().await.unwrap();
        let (from, first) = recv_from(&mut inbound_b).await;
        assert_eq!(from, ka.id());
        assert!(matches!(
            first,
            RouterMessage::DatabaseStore {
                entry: NetDbEntry::Router(_)
            }
        ));

        ta.shutdown().await;
        tb.shutdown().await;
    }

    #[tokio::test]
    async fn send_without_session_is_no_session() {
        let (ta, _dba, _ka) = spawn_transport(Duration::from_secs(60)).await;
        let stranger = RouterKeys::generate().id();
        assert_eq!(
            ta.send(stranger, &RouterMessage::Garlic { blob: vec![0] })
                .await,
            Err(SendError::NoSession)
        );
        ta.shutdown().await;
    }

    #[tokio::test]
    async fn oversize_message_is_rejected_before_queueing() {
        let (ta, _dba, _ka) = spawn_transport(Duration::from_secs(60)).await;
        let stranger = RouterKeys::generate().id();
        let blob = vec![0u8; crate::messages::MAX_MESSAGE_SIZE + 8192];
        assert_eq!(
            ta.send(stranger, &RouterMessage::Garlic { blob }).await,
            Err(SendError::Oversize)
        );
        ta.shutdown().await;
    }

    #[tokio::test]
    async fn pinned_sessions_survive_idle_reaping() {
        let idle = Duration::from_millis(100);
        let (ta, dba, _ka) = spawn_transport(idle).await;
        let (tb, _dbb, kb) = spawn_transport(Duration::from_secs(60)).await;

        dba.store_router_info(tb.local_info().clone()).await.unwrap();
        ta.connect(kb.id()).await.unwrap();
        ta.add_ref(kb.id()).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(ta.session_count().await, 1, "pinned session must survive");

        ta.release(kb.id()).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(ta.session_count().await, 0, "released idle session reaped");

        ta.shutdown().await;
        tb.shutdown().await;
    }

    #[tokio::test]
    async fn crossed_dials_converge_to_one_session() {
        let (ta, dba, ka) = spawn_transport(Duration::from_secs(60)).await;
        let (tb, dbb, kb) = spawn_transport(Duration::from_secs(60)).await;

        dba.store_router_info(tb.local_info().clone()).await.unwrap();
        dbb.store_router_info(ta.local_info().clone()).await.unwrap();

        let (ra, rb) = tokio::join!(ta.connect(kb.id()), tb.connect(ka.id()));
        ra.expect("a's dial");
        rb.expect("b's dial");

        // Let the tie-break settle before using the sessions.
        tokio::time::sleep(Duration::from_millis(300)).await;

        ta.send(kb.id(), &RouterMessage::Garlic { blob: vec![1] })
            .await
            .expect("a to b after glare");
        tb.send(ka.id(), &RouterMessage::Garlic { blob: vec![2] })
            .await
            .expect("b to a after glare");

        assert_eq!(ta.session_count().await, 1);
        assert_eq!(tb.session_count().await, 1);

        ta.shutdown().await;
        tb.shutdown().await;
    }

    #[tokio::test]
    async fn bandwidth_counters_accumulate() {
        let (ta, dba, _ka) = spawn_transport(Duration::from_secs(60)).await;
        let (tb, _dbb, kb) = spawn_transport(Duration::from_secs(60)).await;

        dba.store_router_info(tb.local_info().clone()).await.unwrap();
        ta.connect(kb.id()).await.unwrap();
        ta.send(kb.id(), &RouterMessage::Garlic { blob: vec![9; 128] })
            .await
            .unwrap();

        let mut inbound_b = tb.take_inbound().await.unwrap();
        // Drain until the garlic message arrives so the byte counts are in.
        loop {
            let (_, message) = recv_from(&mut inbound_b).await;
            if matches!(message, RouterMessage::Garlic { .. }) {
                break;
            }
        }

        assert!(ta.counters().snapshot().bytes_out > 0);
        assert!(tb.counters().snapshot().bytes_in > 0);

        ta.shutdown().await;
        tb.shutdown().await;
    }
}
