//! # Tunnel Engine
//!
//! Builds, maintains, and tears down the unidirectional multi-hop tunnels
//! client traffic rides on, and participates in other routers' tunnels as a
//! transit hop:
//!
//! - **Pools**: per-destination sets of inbound and outbound tunnels, kept at
//!   a target size by the maintenance tick
//! - **Layered builds**: one sealed record per hop, chained so each hop opens
//!   only its own record and learns only its predecessor and successor
//! - **Rolling replacement**: a tunnel crossing the replacement margin turns
//!   `Expiring` and a successor build is scheduled exactly once, so a pool
//!   never runs dry at expiry
//! - **Bounded retry**: a failed build is retried with fresh hop selection up
//!   to the configured attempt count, then surfaced as `TunnelBuildFailed`
//! - **Transit table**: accepted build records become transit entries that
//!   peel or add one layer and forward; their bytes feed the transit meter
//!
//! ## Tunnel State Machine
//!
//! `Building → Established → Expiring → (removed)`, with
//! `Building → Failed → (removed)` on reject or build timeout. `Building`
//! and `Failed` live in the pending-build table; only usable tunnels reach
//! the pool.
//!
//! ## Actor Architecture
//!
//! - `TunnelEngine`: public cheap-clone handle
//! - `TunnelEngineActor`: private task owning pools, the transit table, and
//!   all pending-build state
//! - Network sends that may dial run in spawned tasks reporting back over
//!   the command channel; the actor itself never waits on a handshake

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::{
    Config, DEFAULT_REPLACEMENT_MARGIN_SECS, DEFAULT_TUNNEL_LENGTH, DEFAULT_TUNNEL_LIFETIME_SECS,
};
use crate::crypto::{
    open_layer, open_with_key, random_layer_key, seal_layer, seal_to_key, sign_with_domain,
    verify_with_domain, LayerKey, BUILD_RECORD_INFO, BUILD_REPLY_CONTEXT, STREAM_SIGNATURE_DOMAIN,
};
use crate::garlic::{
    new_message_id, open_garlic, peel_in_layers, seal_garlic, wrap_out_layers, ReplayWindow,
};
use crate::identity::{
    new_tunnel_id, now_ms, Destination, DestinationId, DestinationKeys, Lease, LeaseSet, RouterId,
    RouterInfo, RouterKeys,
};
use crate::messages::{
    decode_message, deserialize_bounded, encode_message, BuildRecord, BuildReplyLayer, BuildVote,
    Clove, Delivery, GarlicCleartext, HopRole, LookupKind, NetDbEntry, RejectReason, RouterMessage,
    StreamFrame, TunnelCell, MAX_BUILD_RECORDS,
};
use crate::netdb::{NetDb, SelectError};
use crate::transport::{BandwidthCounters, SendError, Transport};

/// Cadence of the engine's maintenance tick: pending-build timeouts, pool
/// replenishment, transit expiry.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound accepted for a transit entry's lifetime. Records asking for
/// more are rejected as invalid.
const MAX_TRANSIT_LIFETIME_MS: u64 = 30 * 60 * 1000;

/// How long a remote lease-set lookup may stay pending.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Peers asked per remote lease-set lookup.
const LOOKUP_FANOUT: usize = 3;

/// Per-destination inbound frame queue. Full queues drop frames rather than
/// stalling the engine behind a slow local consumer.
const DEST_QUEUE: usize = 256;

// ============================================================================
// Configuration
// ============================================================================

/// Engine knobs, lifted from [`Config`] at router start.
#[derive(Clone, Debug)]
pub struct TunnelConfig {
    /// Hops per tunnel, clamped to `1..=4`.
    pub hop_count: usize,
    /// Fixed tunnel lifetime.
    pub lifetime: Duration,
    /// Remaining lifetime below which a replacement build is scheduled.
    pub replacement_margin: Duration,
    /// Ceiling on one build attempt, request to chained reply.
    pub build_timeout: Duration,
    /// Additional attempts after the first failure.
    pub build_retries: u32,
    /// Target established tunnels per direction per destination.
    pub pool_size: usize,
    /// Transit entries accepted before voting `Reject(Capacity)`.
    pub max_transit: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            hop_count: DEFAULT_TUNNEL_LENGTH,
            lifetime: Duration::from_secs(DEFAULT_TUNNEL_LIFETIME_SECS),
            replacement_margin: Duration::from_secs(DEFAULT_REPLACEMENT_MARGIN_SECS),
            build_timeout: Duration::from_secs(10),
            build_retries: 2,
            pool_size: 1,
            max_transit: 2048,
        }
    }
}

impl TunnelConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            hop_count: config.tunnel_length(),
            lifetime: config.tunnel_lifetime(),
            replacement_margin: Duration::from_secs(DEFAULT_REPLACEMENT_MARGIN_SECS)
                .min(config.tunnel_lifetime() / 2),
            build_timeout: config.build_timeout(),
            build_retries: config.build_retries(),
            pool_size: 1,
            max_transit: 2048,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// A tunnel pool could not reach a usable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// Every attempt of one build chain failed (timeout or hop reject).
    TunnelBuildFailed { attempts: u32 },
    /// Hop selection could not be satisfied. Retryable once the NetDB
    /// gains entries.
    InsufficientPeers { wanted: usize, usable: usize },
    /// The destination was closed while waiting.
    DestinationClosed,
    /// The engine shut down.
    EngineStopped,
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::TunnelBuildFailed { attempts } => {
                write!(f, "tunnel build failed after {} attempts", attempts)
            }
            BuildError::InsufficientPeers { wanted, usable } => {
                write!(f, "insufficient peers for tunnel: wanted {}, {} usable", wanted, usable)
            }
            BuildError::DestinationClosed => write!(f, "destination closed"),
            BuildError::EngineStopped => write!(f, "tunnel engine stopped"),
        }
    }
}

impl std::error::Error for BuildError {}

/// A stream frame could not be dispatched toward a remote destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSendError {
    /// The sending destination is not hosted by this engine.
    UnknownDestination,
    /// No live lease set for the remote destination; resolve first.
    NoLeaseSet,
    /// The pool has no usable outbound tunnel yet.
    NoTunnel,
    /// The first hop refused the frame.
    Transport(SendError),
}

impl std::fmt::Display for StreamSendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamSendError::UnknownDestination => write!(f, "unknown local destination"),
            StreamSendError::NoLeaseSet => write!(f, "no live lease set for remote destination"),
            StreamSendError::NoTunnel => write!(f, "no usable outbound tunnel"),
            StreamSendError::Transport(e) => write!(f, "transport: {}", e),
        }
    }
}

impl std::error::Error for StreamSendError {}

// ============================================================================
// Public Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        }
    }
}

/// Snapshot of the engine's tunnel population.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelCounts {
    /// Usable tunnels across all local pools, both directions.
    pub client: usize,
    /// Live transit entries for other routers' tunnels.
    pub transit: usize,
    /// Build requests launched since the engine started.
    pub builds_launched: u64,
}

/// Canonical payload a destination signs when opening a stream, binding the
/// stream id and both endpoints.
pub fn stream_open_payload(stream_id: u64, from: &Destination, to: &DestinationId) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + 64 + 32);
    data.extend_from_slice(&stream_id.to_le_bytes());
    data.extend_from_slice(&from.signing_key);
    data.extend_from_slice(&from.encryption_key);
    data.extend_from_slice(to.as_bytes());
    data
}

/// One locally-hosted destination: its key material, the inbound frame
/// queue, and the engine handle frames are sent through.
pub struct DestinationHandle {
    keys: DestinationKeys,
    inbound: mpsc::Receiver<StreamFrame>,
    engine: TunnelEngine,
}

impl DestinationHandle {
    #[inline]
    pub fn id(&self) -> DestinationId {
        self.keys.id()
    }

    #[inline]
    pub fn destination(&self) -> Destination {
        self.keys.destination()
    }

    /// Signed stream-open frame toward `to`.
    pub fn open_frame(&self, stream_id: u64, to: &DestinationId) -> StreamFrame {
        let from = self.destination();
        let payload = stream_open_payload(stream_id, &from, to);
        let signature =
            sign_with_domain(self.keys.signing_key(), STREAM_SIGNATURE_DOMAIN, &payload);
        StreamFrame::Open {
            stream_id,
            from,
            signature,
        }
    }

    /// Send one frame toward a remote destination through an outbound
    /// tunnel. The remote lease set must already be resolved.
    pub async fn send(&self, to: DestinationId, frame: StreamFrame) -> Result<(), StreamSendError> {
        self.engine.send_frame(self.id(), to, frame).await
    }

    /// Next inbound frame for this destination, in inbound-tunnel delivery
    /// order. `None` after the destination is closed.
    pub async fn recv(&mut self) -> Option<StreamFrame> {
        self.inbound.recv().await
    }

    /// Wait until the pool has at least one established tunnel in each
    /// direction.
    pub async fn ready(&self) -> Result<(), BuildError> {
        self.engine.ready(self.id()).await
    }

    /// Resolve a remote destination's lease set, asking connected peers when
    /// the local NetDB has none.
    pub async fn resolve(&self, to: DestinationId) -> Option<LeaseSet> {
        self.engine.resolve_lease_set(to).await
    }

    pub fn engine(&self) -> &TunnelEngine {
        &self.engine
    }

    /// Take the handle apart so the receive half can live in its own task
    /// while senders keep the key material and the engine handle.
    pub(crate) fn split(self) -> (DestinationKeys, mpsc::Receiver<StreamFrame>, TunnelEngine) {
        (self.keys, self.inbound, self.engine)
    }

    /// Close the destination: tears its tunnels down and releases their
    /// session references.
    pub async fn close(self) {
        self.engine.close_destination(self.keys.id()).await;
    }
}

impl std::fmt::Debug for DestinationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationHandle")
            .field("id", &self.id().to_hex())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Engine Handle
// ============================================================================

#[derive(Clone)]
pub struct TunnelEngine {
    cmd_tx: mpsc::Sender<Command>,
}

impl TunnelEngine {
    /// Spawn the engine actor.
    pub fn new(
        keys: Arc<RouterKeys>,
        config: TunnelConfig,
        netdb: NetDb,
        transport: Transport,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let counters = transport.counters();
        let actor = TunnelEngineActor {
            local_id: keys.id(),
            local_info: transport.local_info().clone(),
            keys,
            config,
            netdb,
            transport,
            counters,
            pools: HashMap::new(),
            terminus_index: HashMap::new(),
            pending_builds: HashMap::new(),
            transit: HashMap::new(),
            pending_transit: HashMap::new(),
            pending_lookups: HashMap::new(),
            replay: ReplayWindow::default(),
            builds_launched: 0,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
        };
        tokio::spawn(actor.run());
        Self { cmd_tx }
    }

    /// Host a new destination: fresh keys, a fresh pool, builds started.
    pub async fn create_destination(&self) -> Result<DestinationHandle> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::CreateDestination(tx))
            .await
            .ok()
            .context("tunnel engine stopped")?;
        let (keys, inbound) = rx.await.context("tunnel engine stopped")?;
        Ok(DestinationHandle {
            keys,
            inbound,
            engine: self.clone(),
        })
    }

    pub async fn close_destination(&self, id: DestinationId) {
        let _ = self.cmd_tx.send(Command::CloseDestination(id)).await;
    }

    /// Wait until the destination's pool is usable in both directions.
    pub async fn ready(&self, id: DestinationId) -> Result<(), BuildError> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Ready(id, tx)).await.is_err() {
            return Err(BuildError::EngineStopped);
        }
        rx.await.unwrap_or(Err(BuildError::EngineStopped))
    }

    pub async fn send_frame(
        &self,
        from: DestinationId,
        to: DestinationId,
        frame: StreamFrame,
    ) -> Result<(), StreamSendError> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::SendFrame {
                from,
                to,
                frame,
                reply: tx,
            })
            .await
            .is_err()
        {
            return Err(StreamSendError::Transport(SendError::Closed));
        }
        rx.await
            .unwrap_or(Err(StreamSendError::Transport(SendError::Closed)))
    }

    /// Lease set for a remote destination: local NetDB first, then a lookup
    /// fanned out to connected peers with a bounded wait.
    pub async fn resolve_lease_set(&self, id: DestinationId) -> Option<LeaseSet> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::ResolveLease(id, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn counts(&self) -> TunnelCounts {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Counts(tx)).await.is_err() {
            return TunnelCounts::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    // Entry points for the message switch.

    pub(crate) async fn build_request(&self, from: RouterId, build_id: u64, blob: Vec<u8>) {
        let _ = self
            .cmd_tx
            .send(Command::BuildRequest(from, build_id, blob))
            .await;
    }

    pub(crate) async fn build_reply(&self, from: RouterId, build_id: u64, blob: Vec<u8>) {
        let _ = self
            .cmd_tx
            .send(Command::BuildReply(from, build_id, blob))
            .await;
    }

    pub(crate) async fn tunnel_data(
        &self,
        from: RouterId,
        tunnel_id: u64,
        counter: u64,
        payload: Vec<u8>,
    ) {
        let _ = self
            .cmd_tx
            .send(Command::TunnelData(from, tunnel_id, counter, payload))
            .await;
    }

    pub(crate) async fn garlic(&self, blob: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::Garlic(blob)).await;
    }

    pub(crate) async fn database_reply(&self, key: [u8; 32], entry: Option<NetDbEntry>) {
        let _ = self.cmd_tx.send(Command::DatabaseReply(key, entry)).await;
    }
}

// ============================================================================
// Commands
// ============================================================================

enum Command {
    CreateDestination(oneshot::Sender<(DestinationKeys, mpsc::Receiver<StreamFrame>)>),
    CloseDestination(DestinationId),
    Ready(DestinationId, oneshot::Sender<Result<(), BuildError>>),
    SendFrame {
        from: DestinationId,
        to: DestinationId,
        frame: StreamFrame,
        reply: oneshot::Sender<Result<(), StreamSendError>>,
    },
    ResolveLease(DestinationId, oneshot::Sender<Option<LeaseSet>>),
    Counts(oneshot::Sender<TunnelCounts>),

    // Network events routed in by the message switch
    BuildRequest(RouterId, u64, Vec<u8>),
    BuildReply(RouterId, u64, Vec<u8>),
    TunnelData(RouterId, u64, u64, Vec<u8>),
    Garlic(Vec<u8>),
    DatabaseReply([u8; 32], Option<NetDbEntry>),

    // Reports from spawned send tasks
    BuildSendFailed(u64, String),
    /// A build dial acquired its session reference; keyed by build id so
    /// the actor can hand the ref to the pending build or release it when
    /// the attempt already timed out.
    BuildDialComplete(u64, RouterId),
    TransitForwardFailed(u64),
    /// A transit successor dial acquired its session reference; keyed by
    /// the transit tunnel id, same ownership handoff as `BuildDialComplete`.
    TransitPinned(u64, RouterId),
    /// Internal: next attempt of a retry chain, queued so failure handling
    /// never re-enters the build path directly.
    Relaunch(DestinationId, Direction, Vec<RouterId>),

    Quit,
}

// ============================================================================
// Actor State
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TunnelState {
    Established,
    Expiring,
}

struct Hop {
    id: RouterId,
    layer_key: LayerKey,
    receive_id: u64,
}

struct Tunnel {
    direction: Direction,
    state: TunnelState,
    hops: Vec<Hop>,
    /// Outbound: the first hop's receive id, where our cells enter.
    entry_id: u64,
    /// Inbound: our own receive id at the tunnel's end. Zero for outbound.
    terminus_id: u64,
    expires: u64,
    /// Next outbound message counter. Feeds layer nonces; never reused.
    counter: u64,
    /// Sessions pinned for this tunnel, released at teardown.
    pinned: Vec<RouterId>,
}

impl Tunnel {
    #[inline]
    fn usable(&self, now: u64) -> bool {
        self.expires > now
    }

    fn layer_keys(&self) -> Vec<LayerKey> {
        self.hops.iter().map(|h| h.layer_key).collect()
    }
}

struct Pool {
    keys: DestinationKeys,
    inbound_tx: mpsc::Sender<StreamFrame>,
    tunnels: Vec<Tunnel>,
    waiters: Vec<oneshot::Sender<Result<(), BuildError>>>,
    /// Consecutive failed build attempts per direction.
    attempts_out: u32,
    attempts_in: u32,
    /// Publication stamp of the last lease set, kept strictly increasing.
    lease_stamp: u64,
    /// Current signed lease set, bundled into outgoing garlic for replies.
    current_leases: Option<LeaseSet>,
}

impl Pool {
    fn established(&self, direction: Direction, now: u64) -> usize {
        self.tunnels
            .iter()
            .filter(|t| {
                t.direction == direction && t.state == TunnelState::Established && t.usable(now)
            })
            .count()
    }

    fn usable(&self, direction: Direction, now: u64) -> usize {
        self.tunnels
            .iter()
            .filter(|t| t.direction == direction && t.usable(now))
            .count()
    }

    fn is_ready(&self, now: u64) -> bool {
        self.usable(Direction::Outbound, now) > 0 && self.usable(Direction::Inbound, now) > 0
    }

    fn attempts_mut(&mut self, direction: Direction) -> &mut u32 {
        match direction {
            Direction::Outbound => &mut self.attempts_out,
            Direction::Inbound => &mut self.attempts_in,
        }
    }
}

struct PlannedHop {
    info: RouterInfo,
    layer_key: LayerKey,
    receive_id: u64,
}

struct PendingBuild {
    dest: DestinationId,
    direction: Direction,
    hops: Vec<PlannedHop>,
    terminus_id: u64,
    expires: u64,
    deadline: Instant,
    pinned: Vec<RouterId>,
}

struct TransitState {
    key: LayerKey,
    role: HopRole,
    next_hop: Option<RouterId>,
    next_tunnel_id: u64,
    expires: u64,
    /// Gateway-assigned message counter for inbound injection.
    counter: u64,
    /// Whether the successor dial has handed its session ref to this entry.
    /// Only a pinned entry releases `next_hop` when it goes away.
    pinned: bool,
}

struct PendingTransit {
    predecessor: RouterId,
    layer_key: LayerKey,
    receive_tunnel_id: u64,
    deadline: Instant,
}

struct PendingLookup {
    reply: oneshot::Sender<Option<LeaseSet>>,
    deadline: Instant,
}

struct TunnelEngineActor {
    local_id: RouterId,
    local_info: RouterInfo,
    keys: Arc<RouterKeys>,
    config: TunnelConfig,
    netdb: NetDb,
    transport: Transport,
    counters: Arc<BandwidthCounters>,
    pools: HashMap<DestinationId, Pool>,
    /// Inbound terminus id -> owning destination, for fast data dispatch.
    terminus_index: HashMap<u64, DestinationId>,
    pending_builds: HashMap<u64, PendingBuild>,
    transit: HashMap<u64, TransitState>,
    pending_transit: HashMap<u64, PendingTransit>,
    pending_lookups: HashMap<DestinationId, Vec<PendingLookup>>,
    replay: ReplayWindow,
    builds_launched: u64,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
}

impl TunnelEngineActor {
    async fn run(mut self) {
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        maintenance.tick().await; // Skip initial tick

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::CreateDestination(reply)) => self.handle_create(reply).await,
                    Some(Command::CloseDestination(id)) => self.handle_close(id).await,
                    Some(Command::Ready(id, reply)) => self.handle_ready(id, reply),
                    Some(Command::SendFrame { from, to, frame, reply }) => {
                        let _ = reply.send(self.handle_send_frame(from, to, frame).await);
                    }
                    Some(Command::ResolveLease(id, reply)) => {
                        self.handle_resolve_lease(id, reply).await
                    }
                    Some(Command::Counts(reply)) => {
                        let _ = reply.send(self.snapshot_counts());
                    }
                    Some(Command::BuildRequest(from, build_id, blob)) => {
                        self.handle_build_request(from, build_id, blob).await
                    }
                    Some(Command::BuildReply(from, build_id, blob)) => {
                        self.handle_build_reply(from, build_id, blob).await
                    }
                    Some(Command::TunnelData(from, tunnel_id, counter, payload)) => {
                        self.handle_tunnel_data(from, tunnel_id, counter, payload).await
                    }
                    Some(Command::Garlic(blob)) => self.handle_garlic(blob).await,
                    Some(Command::DatabaseReply(key, entry)) => {
                        self.handle_database_reply(key, entry).await
                    }
                    Some(Command::BuildDialComplete(build_id, hop)) => {
                        self.handle_build_dial_complete(build_id, hop).await
                    }
                    Some(Command::TransitPinned(tunnel_id, next)) => {
                        self.handle_transit_pinned(tunnel_id, next).await
                    }
                    Some(Command::BuildSendFailed(build_id, reason)) => {
                        self.fail_build_attempt(build_id, &reason).await
                    }
                    Some(Command::TransitForwardFailed(build_id)) => {
                        self.handle_transit_forward_failed(build_id).await
                    }
                    Some(Command::Relaunch(dest, direction, exclude)) => {
                        self.launch_build(dest, direction, exclude).await
                    }
                    Some(Command::Quit) | None => {
                        debug!("tunnel engine shutting down");
                        break;
                    }
                },
                _ = maintenance.tick() => self.maintain().await,
            }
        }
    }

    // ------------------------------------------------------------------
    // Destinations and pools
    // ------------------------------------------------------------------

    async fn handle_create(
        &mut self,
        reply: oneshot::Sender<(DestinationKeys, mpsc::Receiver<StreamFrame>)>,
    ) {
        let keys = DestinationKeys::generate();
        let id = keys.id();
        let (inbound_tx, inbound_rx) = mpsc::channel(DEST_QUEUE);

        self.pools.insert(
            id,
            Pool {
                keys: keys.clone(),
                inbound_tx,
                tunnels: Vec::new(),
                waiters: Vec::new(),
                attempts_out: 0,
                attempts_in: 0,
                lease_stamp: 0,
                current_leases: None,
            },
        );
        info!(dest = %id.short(), "destination created");

        // First builds start right away rather than on the next tick
        self.launch_build(id, Direction::Outbound, Vec::new()).await;
        self.launch_build(id, Direction::Inbound, Vec::new()).await;

        let _ = reply.send((keys, inbound_rx));
    }

    async fn handle_close(&mut self, id: DestinationId) {
        let Some(mut pool) = self.pools.remove(&id) else {
            return;
        };
        for waiter in pool.waiters.drain(..) {
            let _ = waiter.send(Err(BuildError::DestinationClosed));
        }
        for tunnel in pool.tunnels.drain(..) {
            self.teardown_tunnel(tunnel).await;
        }
        // Builds still in flight for this pool release their pins on
        // completion or timeout; drop them from the table now.
        let stale: Vec<u64> = self
            .pending_builds
            .iter()
            .filter(|(_, p)| p.dest == id)
            .map(|(b, _)| *b)
            .collect();
        for build_id in stale {
            if let Some(pending) = self.pending_builds.remove(&build_id) {
                self.release_pins(&pending.pinned).await;
            }
        }
        info!(dest = %id.short(), "destination closed");
    }

    fn handle_ready(&mut self, id: DestinationId, reply: oneshot::Sender<Result<(), BuildError>>) {
        let Some(pool) = self.pools.get_mut(&id) else {
            let _ = reply.send(Err(BuildError::DestinationClosed));
            return;
        };
        if pool.is_ready(now_ms()) {
            let _ = reply.send(Ok(()));
        } else {
            pool.waiters.push(reply);
        }
    }

    async fn teardown_tunnel(&mut self, tunnel: Tunnel) {
        if tunnel.direction == Direction::Inbound {
            self.terminus_index.remove(&tunnel.terminus_id);
        }
        self.release_pins(&tunnel.pinned).await;
        debug!(
            direction = tunnel.direction.label(),
            hops = tunnel.hops.len(),
            "tunnel torn down"
        );
    }

    async fn release_pins(&self, pins: &[RouterId]) {
        for peer in pins {
            self.transport.release(*peer).await;
        }
    }

    // ------------------------------------------------------------------
    // Build origination
    // ------------------------------------------------------------------

    /// Launch one build attempt for a pool direction.
    ///
    /// `exclude` carries the hops of a failed attempt (fresh selection) or
    /// of the tunnel being replaced. When exclusion starves the selection
    /// the build retries unconstrained rather than failing a small network.
    async fn launch_build(&mut self, dest: DestinationId, direction: Direction, exclude: Vec<RouterId>) {
        if !self.pools.contains_key(&dest) {
            return;
        }
        let count = self.config.hop_count.clamp(1, MAX_BUILD_RECORDS / 2);

        let selection = match self.netdb.select_hops(count, &exclude).await {
            Ok(hops) => Ok(hops),
            Err(SelectError::InsufficientPeers { .. }) if !exclude.is_empty() => {
                self.netdb.select_hops(count, &[]).await
            }
            Err(e) => Err(e),
        };
        let hops = match selection {
            Ok(hops) => hops,
            Err(SelectError::InsufficientPeers { wanted, usable }) => {
                trace!(
                    dest = %dest.short(),
                    direction = direction.label(),
                    wanted,
                    usable,
                    "hop selection failed"
                );
                self.record_build_failure(
                    dest,
                    direction,
                    Vec::new(),
                    BuildError::InsufficientPeers { wanted, usable },
                )
                .await;
                return;
            }
        };

        let planned: Vec<PlannedHop> = hops
            .into_iter()
            .map(|info| PlannedHop {
                info,
                layer_key: random_layer_key(),
                receive_id: new_tunnel_id(),
            })
            .collect();

        let build_id = new_tunnel_id();
        let expires = now_ms() + self.config.lifetime.as_millis() as u64;
        let terminus_id = match direction {
            Direction::Inbound => new_tunnel_id(),
            Direction::Outbound => 0,
        };

        let blob = assemble_build_chain(
            &planned,
            direction,
            self.local_id,
            &self.local_info,
            terminus_id,
            expires,
        );

        let first_hop = planned[0].info.id();
        self.pending_builds.insert(
            build_id,
            PendingBuild {
                dest,
                direction,
                hops: planned,
                terminus_id,
                expires,
                deadline: Instant::now() + self.config.build_timeout,
                // The first hop's ref is handed over by BuildDialComplete
                // once the dial actually holds it.
                pinned: Vec::new(),
            },
        );
        self.builds_launched += 1;
        debug!(
            dest = %dest.short(),
            direction = direction.label(),
            first_hop = %first_hop.short(),
            hops = count,
            "launching tunnel build"
        );

        // The dial may take a while; run it off the actor and report back.
        let transport = self.transport.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let outcome = async {
                transport
                    .connect(first_hop)
                    .await
                    .map_err(|e| e.to_string())?;
                transport.add_ref(first_hop).await;
                // Hand the ref to the actor before the request leaves: the
                // hop's reply then cannot overtake the handoff on the
                // command queue.
                let _ = cmd_tx
                    .send(Command::BuildDialComplete(build_id, first_hop))
                    .await;
                transport
                    .send(first_hop, &RouterMessage::TunnelBuild { build_id, blob })
                    .await
                    .map_err(|e| e.to_string())
            }
            .await;
            if let Err(reason) = outcome {
                let _ = cmd_tx.send(Command::BuildSendFailed(build_id, reason)).await;
            }
        });
    }

    /// Take ownership of the ref a build dial acquired. When the attempt is
    /// already over (deadline fired while the dial was in flight) there is
    /// no owner left, so the ref is dropped on the spot.
    async fn handle_build_dial_complete(&mut self, build_id: u64, hop: RouterId) {
        match self.pending_builds.get_mut(&build_id) {
            Some(pending) => pending.pinned.push(hop),
            None => {
                debug!(build_id, hop = %hop.short(), "dial finished after its build; releasing");
                self.transport.release(hop).await;
            }
        }
    }

    /// One attempt is over (timeout, reject, or send failure). Releases its
    /// pins and decides between retry and surfacing the failure.
    async fn fail_build_attempt(&mut self, build_id: u64, reason: &str) {
        let Some(pending) = self.pending_builds.remove(&build_id) else {
            return;
        };
        self.release_pins(&pending.pinned).await;
        debug!(
            dest = %pending.dest.short(),
            direction = pending.direction.label(),
            reason,
            "tunnel build attempt failed"
        );

        let failed_hops: Vec<RouterId> = pending.hops.iter().map(|h| h.info.id()).collect();
        self.record_build_failure(
            pending.dest,
            pending.direction,
            failed_hops,
            BuildError::TunnelBuildFailed { attempts: 0 },
        )
        .await;
    }

    /// Bounded-retry accounting shared by every failure path. Retries are
    /// queued back through the command channel rather than launched inline.
    async fn record_build_failure(
        &mut self,
        dest: DestinationId,
        direction: Direction,
        failed_hops: Vec<RouterId>,
        error: BuildError,
    ) {
        let max_attempts = 1 + self.config.build_retries;
        let Some(pool) = self.pools.get_mut(&dest) else {
            return;
        };
        let attempts = pool.attempts_mut(direction);
        *attempts += 1;
        let used = *attempts;

        if used < max_attempts {
            // Fresh selection, steering away from the hops that just failed
            let _ = self
                .cmd_tx
                .try_send(Command::Relaunch(dest, direction, failed_hops));
            return;
        }

        *pool.attempts_mut(direction) = 0;
        let surfaced = match error {
            BuildError::InsufficientPeers { .. } => error,
            _ => BuildError::TunnelBuildFailed { attempts: used },
        };
        warn!(
            dest = %dest.short(),
            direction = direction.label(),
            attempts = used,
            error = %surfaced,
            "tunnel build gave up"
        );
        for waiter in pool.waiters.drain(..) {
            let _ = waiter.send(Err(surfaced.clone()));
        }
    }

    /// Chained build reply arriving at its originator.
    async fn process_own_build_reply(&mut self, build_id: u64, blob: Vec<u8>) {
        let Some(pending) = self.pending_builds.get(&build_id) else {
            return;
        };

        // Peel one vote per hop, outermost first
        let mut buf = blob;
        let mut verdict: Result<(), (usize, String)> = Ok(());
        for (idx, hop) in pending.hops.iter().enumerate() {
            let opened = match open_layer(&hop.layer_key, 0, BUILD_REPLY_CONTEXT, &buf) {
                Ok(bytes) => bytes,
                Err(_) => {
                    verdict = Err((idx, "undecodable reply layer".to_string()));
                    break;
                }
            };
            let layer: BuildReplyLayer = match deserialize_bounded(&opened) {
                Ok(layer) => layer,
                Err(_) => {
                    verdict = Err((idx, "malformed reply layer".to_string()));
                    break;
                }
            };
            match layer.vote {
                BuildVote::Accept => buf = layer.inner,
                BuildVote::Reject(reason) => {
                    verdict = Err((idx, format!("hop rejected: {}", reason)));
                    break;
                }
            }
        }

        if let Err((idx, reason)) = verdict {
            debug!(build_id, hop_index = idx, reason, "build rejected in reply chain");
            self.fail_build_attempt(build_id, &reason).await;
            return;
        }

        let pending = self
            .pending_builds
            .remove(&build_id)
            .expect("pending build checked above");
        self.install_tunnel(pending).await;
    }

    async fn install_tunnel(&mut self, pending: PendingBuild) {
        if !self.pools.contains_key(&pending.dest) {
            // Destination closed mid-build
            self.release_pins(&pending.pinned).await;
            return;
        }

        let hops: Vec<Hop> = pending
            .hops
            .iter()
            .map(|h| Hop {
                id: h.info.id(),
                layer_key: h.layer_key,
                receive_id: h.receive_id,
            })
            .collect();
        let entry_id = hops[0].receive_id;

        let pinned = match pending.direction {
            Direction::Outbound => pending.pinned.clone(),
            Direction::Inbound => {
                // The first hop's session only carried the build request;
                // inbound data arrives over the last hop's own session.
                self.release_pins(&pending.pinned).await;
                Vec::new()
            }
        };

        let Some(pool) = self.pools.get_mut(&pending.dest) else {
            return;
        };

        let tunnel = Tunnel {
            direction: pending.direction,
            state: TunnelState::Established,
            hops,
            entry_id,
            terminus_id: pending.terminus_id,
            expires: pending.expires,
            counter: 0,
            pinned,
        };
        info!(
            dest = %pending.dest.short(),
            direction = pending.direction.label(),
            hops = tunnel.hops.len(),
            lifetime_secs = (pending.expires.saturating_sub(now_ms())) / 1000,
            "tunnel established"
        );

        if pending.direction == Direction::Inbound {
            self.terminus_index
                .insert(pending.terminus_id, pending.dest);
        }
        pool.tunnels.push(tunnel);
        *pool.attempts_mut(pending.direction) = 0;

        let now = now_ms();
        if pool.is_ready(now) {
            for waiter in pool.waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
        }

        if pending.direction == Direction::Inbound {
            self.republish_leases(pending.dest).await;
        }
    }

    /// Re-sign and store the lease set after any inbound tunnel change.
    async fn republish_leases(&mut self, dest: DestinationId) {
        let Some(pool) = self.pools.get_mut(&dest) else {
            return;
        };
        let now = now_ms();
        let leases: Vec<Lease> = pool
            .tunnels
            .iter()
            .filter(|t| t.direction == Direction::Inbound && t.usable(now))
            .map(|t| Lease {
                gateway: t.hops[0].id,
                tunnel_id: t.hops[0].receive_id,
                expires: t.expires,
            })
            .collect();
        if leases.is_empty() {
            pool.current_leases = None;
            return;
        }

        pool.lease_stamp = now.max(pool.lease_stamp + 1);
        let lease_set = pool.keys.create_lease_set_at(leases, pool.lease_stamp);
        pool.current_leases = Some(lease_set.clone());
        debug!(
            dest = %dest.short(),
            leases = lease_set.leases.len(),
            "lease set republished"
        );
        if let Err(err) = self.netdb.store_lease_set(lease_set).await {
            warn!(dest = %dest.short(), error = %err, "own lease set rejected by netdb");
        }
    }

    // ------------------------------------------------------------------
    // Transit participation
    // ------------------------------------------------------------------

    async fn handle_build_request(&mut self, from: RouterId, build_id: u64, blob: Vec<u8>) {
        let record_bytes = match open_with_key(self.keys.encryption_secret(), &blob, BUILD_RECORD_INFO)
        {
            Ok(bytes) => bytes,
            Err(_) => {
                debug!(peer = %from.short(), "dropping build record not sealed to this router");
                return;
            }
        };
        let record: BuildRecord = match deserialize_bounded(&record_bytes) {
            Ok(record) => record,
            Err(_) => {
                debug!(peer = %from.short(), "dropping malformed build record");
                return;
            }
        };

        let now = now_ms();
        let reject = if record.receive_tunnel_id == 0
            || record.expires <= now
            || record.expires > now + MAX_TRANSIT_LIFETIME_MS
            || self.transit.contains_key(&record.receive_tunnel_id)
        {
            Some(RejectReason::Invalid)
        } else if self.transit.len() >= self.config.max_transit {
            Some(RejectReason::Capacity)
        } else {
            None
        };

        if let Some(reason) = reject {
            debug!(peer = %from.short(), %reason, "rejecting tunnel build");
            self.send_reply_up(from, build_id, &record.layer_key, BuildVote::Reject(reason), Vec::new())
                .await;
            return;
        }

        self.transit.insert(
            record.receive_tunnel_id,
            TransitState {
                key: record.layer_key,
                role: record.role,
                next_hop: record.next_hop,
                next_tunnel_id: record.next_tunnel_id,
                expires: record.expires,
                counter: 0,
                pinned: false,
            },
        );
        trace!(
            peer = %from.short(),
            tunnel_id = record.receive_tunnel_id,
            role = ?record.role,
            "transit tunnel accepted"
        );

        if record.next_blob.is_empty() {
            // Terminal hop: vote now. A terminal inbound hop still dials the
            // tunnel owner so data can flow the moment the reply lands.
            if let Some(next) = record.next_hop {
                self.pin_next_hop(record.receive_tunnel_id, next, record.next_info)
                    .await;
            }
            self.send_reply_up(from, build_id, &record.layer_key, BuildVote::Accept, Vec::new())
                .await;
            return;
        }

        // Forward the remaining chain; our vote waits for the successor's
        // reply so the originator receives one chained blob.
        let Some(next) = record.next_hop else {
            debug!(peer = %from.short(), "build record with chain but no successor");
            self.transit.remove(&record.receive_tunnel_id);
            self.send_reply_up(
                from,
                build_id,
                &record.layer_key,
                BuildVote::Reject(RejectReason::Invalid),
                Vec::new(),
            )
            .await;
            return;
        };

        self.pending_transit.insert(
            build_id,
            PendingTransit {
                predecessor: from,
                layer_key: record.layer_key,
                receive_tunnel_id: record.receive_tunnel_id,
                deadline: Instant::now() + self.config.build_timeout * 2,
            },
        );

        let transport = self.transport.clone();
        let netdb = self.netdb.clone();
        let cmd_tx = self.cmd_tx.clone();
        let next_info = record.next_info;
        let next_blob = record.next_blob;
        let tunnel_id = record.receive_tunnel_id;
        tokio::spawn(async move {
            if let Some(info) = next_info {
                let _ = netdb.store_router_info(info).await;
            }
            let outcome = async {
                transport.connect(next).await.map_err(|e| e.to_string())?;
                transport.add_ref(next).await;
                // Handed over before the chain leaves, so the successor's
                // reply cannot overtake it on the command queue.
                let _ = cmd_tx.send(Command::TransitPinned(tunnel_id, next)).await;
                transport
                    .send(
                        next,
                        &RouterMessage::TunnelBuild {
                            build_id,
                            blob: next_blob,
                        },
                    )
                    .await
                    .map_err(|e| e.to_string())
            }
            .await;
            if let Err(reason) = outcome {
                debug!(next = %next.short(), reason, "could not forward build chain");
                let _ = cmd_tx.send(Command::TransitForwardFailed(build_id)).await;
            }
        });
    }

    /// Dial and pin the successor of an accepted transit record.
    async fn pin_next_hop(&self, tunnel_id: u64, next: RouterId, next_info: Option<RouterInfo>) {
        let transport = self.transport.clone();
        let netdb = self.netdb.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            if let Some(info) = next_info {
                let _ = netdb.store_router_info(info).await;
            }
            match transport.connect(next).await {
                Ok(()) => {
                    transport.add_ref(next).await;
                    let _ = cmd_tx.send(Command::TransitPinned(tunnel_id, next)).await;
                }
                Err(e) => debug!(next = %next.short(), error = %e, "could not dial tunnel successor"),
            }
        });
    }

    /// Take ownership of the ref a successor dial acquired, or release it
    /// when the transit entry is already gone.
    async fn handle_transit_pinned(&mut self, tunnel_id: u64, next: RouterId) {
        match self.transit.get_mut(&tunnel_id) {
            Some(state) => state.pinned = true,
            None => {
                debug!(tunnel_id, next = %next.short(), "dial finished after its transit entry; releasing");
                self.transport.release(next).await;
            }
        }
    }

    async fn send_reply_up(
        &self,
        to: RouterId,
        build_id: u64,
        layer_key: &LayerKey,
        vote: BuildVote,
        inner: Vec<u8>,
    ) {
        let layer = BuildReplyLayer { vote, inner };
        let encoded = match bincode::serialize(&layer) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "could not encode build reply layer");
                return;
            }
        };
        let blob = seal_layer(layer_key, 0, BUILD_REPLY_CONTEXT, &encoded);
        if let Err(err) = self
            .transport
            .send(to, &RouterMessage::TunnelBuildReply { build_id, blob })
            .await
        {
            debug!(peer = %to.short(), error = %err, "could not send build reply");
        }
    }

    async fn handle_build_reply(&mut self, from: RouterId, build_id: u64, blob: Vec<u8>) {
        if self.pending_builds.contains_key(&build_id) {
            self.process_own_build_reply(build_id, blob).await;
            return;
        }
        // Transit hop: add our accept around the successor's reply and pass
        // it toward the originator.
        let Some(pending) = self.pending_transit.remove(&build_id) else {
            trace!(peer = %from.short(), build_id, "reply for unknown build dropped");
            return;
        };
        self.send_reply_up(
            pending.predecessor,
            build_id,
            &pending.layer_key,
            BuildVote::Accept,
            blob,
        )
        .await;
    }

    async fn handle_transit_forward_failed(&mut self, build_id: u64) {
        let Some(pending) = self.pending_transit.remove(&build_id) else {
            return;
        };
        if let Some(state) = self.transit.remove(&pending.receive_tunnel_id) {
            if state.pinned {
                if let Some(next) = state.next_hop {
                    self.transport.release(next).await;
                }
            }
        }
        self.send_reply_up(
            pending.predecessor,
            build_id,
            &pending.layer_key,
            BuildVote::Reject(RejectReason::Invalid),
            Vec::new(),
        )
        .await;
    }

    // ------------------------------------------------------------------
    // Tunnel data
    // ------------------------------------------------------------------

    async fn handle_tunnel_data(
        &mut self,
        from: RouterId,
        tunnel_id: u64,
        counter: u64,
        payload: Vec<u8>,
    ) {
        // Terminus of one of our own inbound tunnels?
        if let Some(dest) = self.terminus_index.get(&tunnel_id).copied() {
            self.receive_own_inbound(dest, tunnel_id, counter, payload)
                .await;
            return;
        }

        let Some(state) = self.transit.get_mut(&tunnel_id) else {
            trace!(peer = %from.short(), tunnel_id, "data for unknown tunnel dropped");
            return;
        };
        if state.expires <= now_ms() {
            trace!(tunnel_id, "data for expired transit tunnel dropped");
            return;
        }

        match state.role {
            HopRole::Intermediate => {
                let key = state.key;
                let next = state.next_hop;
                let next_id = state.next_tunnel_id;
                let Ok(inner) = open_layer(&key, counter, crate::crypto::TUNNEL_DATA_CONTEXT, &payload)
                else {
                    debug!(tunnel_id, "transit layer failed to open, dropping cell");
                    return;
                };
                self.counters.add_transit(inner.len() as u64);
                let Some(next) = next else { return };
                self.forward_transit(
                    next,
                    RouterMessage::TunnelData {
                        tunnel_id: next_id,
                        counter,
                        payload: inner,
                    },
                )
                .await;
            }
            HopRole::OutboundEndpoint => {
                let key = state.key;
                let Ok(inner) = open_layer(&key, counter, crate::crypto::TUNNEL_DATA_CONTEXT, &payload)
                else {
                    debug!(tunnel_id, "endpoint layer failed to open, dropping cell");
                    return;
                };
                self.counters.add_transit(inner.len() as u64);
                let Ok(cell) = TunnelCell::decode(&inner) else {
                    debug!(tunnel_id, "malformed tunnel cell at endpoint, dropping");
                    return;
                };
                self.execute_delivery(cell).await;
            }
            HopRole::InboundGateway => {
                // The gateway assigns the counter; whatever the sender put
                // in the frame is ignored.
                let fresh = state.counter;
                state.counter += 1;
                let sealed =
                    seal_layer(&state.key, fresh, crate::crypto::TUNNEL_DATA_CONTEXT, &payload);
                self.counters.add_transit(payload.len() as u64);
                let next = state.next_hop;
                let next_id = state.next_tunnel_id;
                let Some(next) = next else { return };
                self.forward_transit(
                    next,
                    RouterMessage::TunnelData {
                        tunnel_id: next_id,
                        counter: fresh,
                        payload: sealed,
                    },
                )
                .await;
            }
            HopRole::InboundHop => {
                let sealed =
                    seal_layer(&state.key, counter, crate::crypto::TUNNEL_DATA_CONTEXT, &payload);
                self.counters.add_transit(payload.len() as u64);
                let next = state.next_hop;
                let next_id = state.next_tunnel_id;
                let Some(next) = next else { return };
                self.forward_transit(
                    next,
                    RouterMessage::TunnelData {
                        tunnel_id: next_id,
                        counter,
                        payload: sealed,
                    },
                )
                .await;
            }
        }
    }

    /// Forward along a transit chain. The session was pinned at build time,
    /// so this is an ordered in-actor send; a lost session drops the cell.
    async fn forward_transit(&mut self, next: RouterId, message: RouterMessage) {
        if next == self.local_id {
            self.dispatch_self(message).await;
            return;
        }
        if let Err(err) = self.transport.send(next, &message).await {
            debug!(next = %next.short(), error = %err, "transit forward failed");
        }
    }

    /// Messages a tunnel terminates into this very router.
    async fn dispatch_self(&mut self, message: RouterMessage) {
        match message {
            RouterMessage::TunnelData {
                tunnel_id,
                counter,
                payload,
            } => {
                // Re-enqueue instead of recursing: the borrow on the transit
                // table has ended by the time the command is handled.
                let _ = self
                    .cmd_tx
                    .try_send(Command::TunnelData(self.local_id, tunnel_id, counter, payload));
            }
            RouterMessage::Garlic { blob } => self.handle_garlic(blob).await,
            RouterMessage::DatabaseStore { entry } => {
                let _ = self.netdb.store_entry(entry).await;
            }
            other => {
                debug!(kind = other.kind(), "unexpected self-addressed message dropped")
            }
        }
    }

    /// A sender's outbound endpoint executing the cell's instruction.
    async fn execute_delivery(&mut self, cell: TunnelCell) {
        match cell.delivery {
            Delivery::Router { to } => {
                let Ok(message) = decode_message(&cell.message) else {
                    debug!("undecodable router delivery dropped");
                    return;
                };
                if to == self.local_id {
                    self.dispatch_self(message).await;
                    return;
                }
                self.deliver_remote(to, message).await;
            }
            Delivery::Tunnel { to, tunnel_id } => {
                let message = RouterMessage::TunnelData {
                    tunnel_id,
                    counter: 0,
                    payload: cell.message,
                };
                if to == self.local_id {
                    self.dispatch_self(message).await;
                    return;
                }
                self.deliver_remote(to, message).await;
            }
        }
    }

    /// Deliver toward a router we may not have a session with yet. Tries the
    /// fast ordered path first and falls back to a dialing task.
    async fn deliver_remote(&self, to: RouterId, message: RouterMessage) {
        match self.transport.send(to, &message).await {
            Ok(()) => {}
            Err(SendError::NoSession) => {
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.connect(to).await {
                        debug!(peer = %to.short(), error = %e, "delivery dial failed");
                        return;
                    }
                    if let Err(e) = transport.send(to, &message).await {
                        debug!(peer = %to.short(), error = %e, "delivery send failed");
                    }
                });
            }
            Err(err) => debug!(peer = %to.short(), error = %err, "delivery failed"),
        }
    }

    /// Data arriving at the terminus of one of our own inbound tunnels.
    async fn receive_own_inbound(
        &mut self,
        dest: DestinationId,
        terminus_id: u64,
        counter: u64,
        payload: Vec<u8>,
    ) {
        let keys = {
            let Some(pool) = self.pools.get(&dest) else {
                return;
            };
            let Some(tunnel) = pool
                .tunnels
                .iter()
                .find(|t| t.direction == Direction::Inbound && t.terminus_id == terminus_id)
            else {
                return;
            };
            tunnel.layer_keys()
        };

        let inner = match peel_in_layers(&keys, counter, &payload) {
            Ok(bytes) => bytes,
            Err(_) => {
                debug!(dest = %dest.short(), "inbound tunnel cell failed to peel, dropped");
                return;
            }
        };
        match decode_message(&inner) {
            Ok(RouterMessage::Garlic { blob }) => self.handle_garlic(blob).await,
            Ok(RouterMessage::DatabaseStore { entry }) => {
                let _ = self.netdb.store_entry(entry).await;
            }
            Ok(other) => {
                debug!(kind = other.kind(), "unexpected message through inbound tunnel dropped")
            }
            Err(_) => debug!("undecodable message through inbound tunnel dropped"),
        }
    }

    // ------------------------------------------------------------------
    // Garlic delivery
    // ------------------------------------------------------------------

    async fn handle_garlic(&mut self, blob: Vec<u8>) {
        // The box is sealed to exactly one of our destinations; try each.
        let mut opened: Option<(DestinationId, GarlicCleartext)> = None;
        for (id, pool) in &self.pools {
            if let Ok(clear) = open_garlic(pool.keys.encryption_secret(), &blob) {
                opened = Some((*id, clear));
                break;
            }
        }
        let Some((dest, clear)) = opened else {
            debug!("garlic not addressed to any local destination, dropped");
            return;
        };

        if !self.replay.register(clear.msg_id) {
            warn!(
                dest = %dest.short(),
                msg_id = clear.msg_id,
                "replayed garlic message dropped"
            );
            return;
        }

        for clove in clear.cloves {
            match clove {
                Clove::SenderLeases(lease_set) => {
                    if let Err(err) = self.netdb.store_lease_set(lease_set).await {
                        debug!(error = %err, "bundled lease set rejected");
                    }
                }
                Clove::Stream { frame } => {
                    if let StreamFrame::Open {
                        stream_id,
                        ref from,
                        ref signature,
                    } = frame
                    {
                        let payload = stream_open_payload(stream_id, from, &dest);
                        if verify_with_domain(
                            &from.signing_key,
                            STREAM_SIGNATURE_DOMAIN,
                            &payload,
                            signature,
                        )
                        .is_err()
                        {
                            warn!(
                                dest = %dest.short(),
                                stream_id,
                                "stream open with bad signature dropped"
                            );
                            continue;
                        }
                    }
                    let Some(pool) = self.pools.get(&dest) else {
                        continue;
                    };
                    if pool.inbound_tx.try_send(frame).is_err() {
                        warn!(dest = %dest.short(), "destination queue full, frame dropped");
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound stream frames
    // ------------------------------------------------------------------

    async fn handle_send_frame(
        &mut self,
        from: DestinationId,
        to: DestinationId,
        frame: StreamFrame,
    ) -> Result<(), StreamSendError> {
        if !self.pools.contains_key(&from) {
            return Err(StreamSendError::UnknownDestination);
        }
        let Some(lease_set) = self.netdb.lookup_lease_set(to).await else {
            return Err(StreamSendError::NoLeaseSet);
        };
        let now = now_ms();
        let Some(lease) = lease_set.live_leases(now).into_iter().next() else {
            return Err(StreamSendError::NoLeaseSet);
        };

        let pool = self
            .pools
            .get_mut(&from)
            .ok_or(StreamSendError::UnknownDestination)?;

        // Garlic bundle: the frame plus our own leases so the remote side
        // can reply without a database round trip.
        let mut cloves = vec![Clove::Stream { frame }];
        if let Some(own_leases) = &pool.current_leases {
            cloves.push(Clove::SenderLeases(own_leases.clone()));
        }
        let cleartext = GarlicCleartext {
            msg_id: new_message_id(),
            cloves,
        };
        let garlic = seal_garlic(&lease_set.destination.encryption_public(), &cleartext);

        let cell = TunnelCell {
            delivery: Delivery::Tunnel {
                to: lease.gateway,
                tunnel_id: lease.tunnel_id,
            },
            message: encode_message(&RouterMessage::Garlic { blob: garlic })
                .map_err(|_| StreamSendError::Transport(SendError::Oversize))?,
        };

        // Prefer a fresh tunnel over one already marked for replacement
        let tunnel = pool
            .tunnels
            .iter_mut()
            .filter(|t| t.direction == Direction::Outbound && t.usable(now))
            .max_by_key(|t| (t.state == TunnelState::Established, t.expires))
            .ok_or(StreamSendError::NoTunnel)?;

        let counter = tunnel.counter;
        tunnel.counter += 1;
        let keys = tunnel.layer_keys();
        let wrapped = wrap_out_layers(&keys, counter, &cell.encode());
        let first_hop = tunnel.hops[0].id;
        let entry_id = tunnel.entry_id;

        self.transport
            .send(
                first_hop,
                &RouterMessage::TunnelData {
                    tunnel_id: entry_id,
                    counter,
                    payload: wrapped,
                },
            )
            .await
            .map_err(StreamSendError::Transport)
    }

    // ------------------------------------------------------------------
    // Lease-set resolution
    // ------------------------------------------------------------------

    async fn handle_resolve_lease(
        &mut self,
        id: DestinationId,
        reply: oneshot::Sender<Option<LeaseSet>>,
    ) {
        if let Some(found) = self.netdb.lookup_lease_set(id).await {
            let _ = reply.send(Some(found));
            return;
        }

        let peers = self.transport.connected_peers().await;
        if peers.is_empty() {
            let _ = reply.send(None);
            return;
        }

        self.pending_lookups.entry(id).or_default().push(PendingLookup {
            reply,
            deadline: Instant::now() + LOOKUP_TIMEOUT,
        });

        let transport = self.transport.clone();
        let key = *id.as_bytes();
        tokio::spawn(async move {
            for peer in peers.into_iter().take(LOOKUP_FANOUT) {
                let _ = transport
                    .send(
                        peer,
                        &RouterMessage::DatabaseLookup {
                            key,
                            kind: LookupKind::Lease,
                        },
                    )
                    .await;
            }
        });
    }

    async fn handle_database_reply(&mut self, key: [u8; 32], entry: Option<NetDbEntry>) {
        let Some(entry) = entry else {
            // Negative answers are ignored; another peer may still reply and
            // the deadline sweep answers None otherwise.
            return;
        };
        if let Err(err) = self.netdb.store_entry(entry).await {
            debug!(error = %err, "looked-up entry rejected");
            return;
        }
        let dest = DestinationId::from_bytes(key);
        if self.pending_lookups.contains_key(&dest) {
            if let Some(found) = self.netdb.lookup_lease_set(dest).await {
                if let Some(waiters) = self.pending_lookups.remove(&dest) {
                    for waiter in waiters {
                        let _ = waiter.reply.send(Some(found.clone()));
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    async fn maintain(&mut self) {
        let now = now_ms();
        let mono_now = Instant::now();

        // Build attempts past their deadline
        let timed_out: Vec<u64> = self
            .pending_builds
            .iter()
            .filter(|(_, p)| p.deadline <= mono_now)
            .map(|(id, _)| *id)
            .collect();
        for build_id in timed_out {
            self.fail_build_attempt(build_id, "build timeout").await;
        }

        // Forwarded chains whose successor never replied: same cleanup as
        // an explicit forward failure, so the half-built transit entry and
        // its successor pin never outlive the build.
        let stale_forwards: Vec<u64> = self
            .pending_transit
            .iter()
            .filter(|(_, p)| p.deadline <= mono_now)
            .map(|(id, _)| *id)
            .collect();
        for build_id in stale_forwards {
            debug!(build_id, "forwarded build chain timed out");
            self.handle_transit_forward_failed(build_id).await;
        }

        // Expired transit entries release their successor sessions
        let expired_transit: Vec<u64> = self
            .transit
            .iter()
            .filter(|(_, s)| s.expires <= now)
            .map(|(id, _)| *id)
            .collect();
        for tunnel_id in expired_transit {
            if let Some(state) = self.transit.remove(&tunnel_id) {
                if state.pinned {
                    if let Some(next) = state.next_hop {
                        self.transport.release(next).await;
                    }
                }
                trace!(tunnel_id, "transit tunnel expired");
            }
        }

        // Expired lookups answer None
        for waiters in self.pending_lookups.values_mut() {
            let (expired, live): (Vec<_>, Vec<_>) =
                waiters.drain(..).partition(|w| w.deadline <= mono_now);
            for waiter in expired {
                let _ = waiter.reply.send(None);
            }
            *waiters = live;
        }
        self.pending_lookups.retain(|_, w| !w.is_empty());

        self.maintain_pools(now).await;
    }

    async fn maintain_pools(&mut self, now: u64) {
        let mut launches: Vec<(DestinationId, Direction, Vec<RouterId>)> = Vec::new();
        let mut republish: Vec<DestinationId> = Vec::new();
        let mut teardowns: Vec<Tunnel> = Vec::new();

        let margin_ms = self.config.replacement_margin.as_millis() as u64;
        let pool_size = self.config.pool_size;

        for (dest, pool) in self.pools.iter_mut() {
            // Remove expired tunnels
            let mut removed_inbound = false;
            let mut keep = Vec::with_capacity(pool.tunnels.len());
            for tunnel in pool.tunnels.drain(..) {
                if tunnel.usable(now) {
                    keep.push(tunnel);
                } else {
                    if tunnel.direction == Direction::Inbound {
                        removed_inbound = true;
                    }
                    teardowns.push(tunnel);
                }
            }
            pool.tunnels = keep;
            if removed_inbound {
                republish.push(*dest);
            }

            // Mark tunnels crossing the replacement margin. Flipping the
            // state is what makes the deficit check below schedule the
            // replacement, and it flips exactly once.
            for tunnel in pool.tunnels.iter_mut() {
                if tunnel.state == TunnelState::Established
                    && tunnel.expires.saturating_sub(now) < margin_ms
                {
                    tunnel.state = TunnelState::Expiring;
                    debug!(
                        dest = %dest.short(),
                        direction = tunnel.direction.label(),
                        "tunnel entering replacement window"
                    );
                }
            }

            // Replenish each direction up to the target, counting builds
            // already in flight
            for direction in [Direction::Outbound, Direction::Inbound] {
                let in_flight = self
                    .pending_builds
                    .values()
                    .filter(|p| p.dest == *dest && p.direction == direction)
                    .count();
                let fresh = pool.established(direction, now);
                if fresh + in_flight < pool_size {
                    // Steer the replacement away from the path it replaces
                    let exclude: Vec<RouterId> = pool
                        .tunnels
                        .iter()
                        .filter(|t| t.direction == direction)
                        .flat_map(|t| t.hops.iter().map(|h| h.id))
                        .collect();
                    launches.push((*dest, direction, exclude));
                }
            }
        }

        for tunnel in teardowns {
            self.teardown_tunnel(tunnel).await;
        }
        for dest in republish {
            self.republish_leases(dest).await;
        }
        for (dest, direction, exclude) in launches {
            self.launch_build(dest, direction, exclude).await;
        }
    }

    fn snapshot_counts(&self) -> TunnelCounts {
        let now = now_ms();
        let client = self
            .pools
            .values()
            .map(|pool| pool.tunnels.iter().filter(|t| t.usable(now)).count())
            .sum();
        let transit = self.transit.values().filter(|s| s.expires > now).count();
        TunnelCounts {
            client,
            transit,
            builds_launched: self.builds_launched,
        }
    }
}

// ============================================================================
// Build Chain Assembly
// ============================================================================

/// Construct the nested build request for a planned path.
///
/// Built from the last hop inward: each record carries the remaining chain
/// sealed to its successor, so a hop opening its own box learns its
/// predecessor (the arriving session), its successor, and nothing else.
fn assemble_build_chain(
    hops: &[PlannedHop],
    direction: Direction,
    local_id: RouterId,
    local_info: &RouterInfo,
    terminus_id: u64,
    expires: u64,
) -> Vec<u8> {
    let n = hops.len();
    let mut blob: Vec<u8> = Vec::new();

    for i in (0..n).rev() {
        let last = i == n - 1;
        let role = match (direction, i, last) {
            (Direction::Outbound, _, true) => HopRole::OutboundEndpoint,
            (Direction::Outbound, _, false) => HopRole::Intermediate,
            (Direction::Inbound, 0, _) => HopRole::InboundGateway,
            (Direction::Inbound, _, _) => HopRole::InboundHop,
        };
        let (next_hop, next_tunnel_id, next_info) = if !last {
            (
                Some(hops[i + 1].info.id()),
                hops[i + 1].receive_id,
                Some(hops[i + 1].info.clone()),
            )
        } else {
            match direction {
                Direction::Outbound => (None, 0, None),
                Direction::Inbound => (Some(local_id), terminus_id, Some(local_info.clone())),
            }
        };

        let record = BuildRecord {
            receive_tunnel_id: hops[i].receive_id,
            layer_key: hops[i].layer_key,
            role,
            next_hop,
            next_tunnel_id,
            next_info,
            expires,
            next_blob: blob,
        };
        let encoded = bincode::serialize(&record).expect("build record serialization cannot fail");
        blob = seal_to_key(
            &hops[i].info.identity.encryption_public(),
            &encoded,
            BUILD_RECORD_INFO,
        );
    }

    blob
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{RouterKeys, CAP_REACHABLE, CAP_TRANSIT};

    struct TestHop {
        keys: RouterKeys,
        planned: PlannedHop,
    }

    fn plan_path(n: usize) -> Vec<TestHop> {
        (0..n)
            .map(|i| {
                let keys = RouterKeys::generate();
                let info = keys.create_router_info(
                    vec![format!("10.{}.0.1:9000", i + 1)],
                    CAP_TRANSIT | CAP_REACHABLE,
                );
                TestHop {
                    keys,
                    planned: PlannedHop {
                        info,
                        layer_key: random_layer_key(),
                        receive_id: new_tunnel_id(),
                    },
                }
            })
            .collect()
    }

    fn planned(hops: &[TestHop]) -> Vec<&PlannedHop> {
        hops.iter().map(|h| &h.planned).collect()
    }

    fn open_record(hop: &TestHop, blob: &[u8]) -> BuildRecord {
        let bytes = open_with_key(hop.keys.encryption_secret(), blob, BUILD_RECORD_INFO)
            .expect("hop must open its own record");
        deserialize_bounded(&bytes).expect("record must decode")
    }

    fn assemble(
        hops: &[TestHop],
        direction: Direction,
        local: &RouterKeys,
        terminus: u64,
    ) -> Vec<u8> {
        let local_info =
            local.create_router_info(vec!["127.0.0.1:1".to_string()], CAP_TRANSIT);
        let refs: Vec<PlannedHop> = hops
            .iter()
            .map(|h| PlannedHop {
                info: h.planned.info.clone(),
                layer_key: h.planned.layer_key,
                receive_id: h.planned.receive_id,
            })
            .collect();
        assemble_build_chain(
            &refs,
            direction,
            local.id(),
            &local_info,
            terminus,
            now_ms() + 600_000,
        )
    }

    #[test]
    fn outbound_chain_gives_each_hop_only_its_record() {
        let local = RouterKeys::generate();
        let hops = plan_path(3);
        let mut blob = assemble(&hops, Direction::Outbound, &local, 0);

        for (i, hop) in hops.iter().enumerate() {
            // Only the addressed hop can open the outer box
            for other in hops.iter().filter(|h| h.keys.id() != hop.keys.id()) {
                assert!(
                    open_with_key(other.keys.encryption_secret(), &blob, BUILD_RECORD_INFO)
                        .is_err(),
                    "hop {i}: record must be opaque to other hops"
                );
            }

            let record = open_record(hop, &blob);
            assert_eq!(record.receive_tunnel_id, hop.planned.receive_id);
            assert_eq!(record.layer_key, hop.planned.layer_key);

            if i + 1 < hops.len() {
                assert_eq!(record.role, HopRole::Intermediate);
                assert_eq!(record.next_hop, Some(hops[i + 1].keys.id()));
                assert_eq!(record.next_tunnel_id, hops[i + 1].planned.receive_id);
                assert!(!record.next_blob.is_empty());
            } else {
                assert_eq!(record.role, HopRole::OutboundEndpoint);
                assert_eq!(record.next_hop, None);
                assert!(record.next_blob.is_empty());
            }
            blob = record.next_blob;
        }
    }

    #[test]
    fn inbound_chain_ends_at_the_owner() {
        let local = RouterKeys::generate();
        let hops = plan_path(2);
        let terminus = new_tunnel_id();
        let blob = assemble(&hops, Direction::Inbound, &local, terminus);

        let gw = open_record(&hops[0], &blob);
        assert_eq!(gw.role, HopRole::InboundGateway);
        assert_eq!(gw.next_hop, Some(hops[1].keys.id()));

        let last = open_record(&hops[1], &gw.next_blob);
        assert_eq!(last.role, HopRole::InboundHop);
        assert_eq!(last.next_hop, Some(local.id()));
        assert_eq!(last.next_tunnel_id, terminus);
        assert!(last.next_blob.is_empty());
        let owner_info = last.next_info.expect("owner descriptor rides along");
        assert_eq!(owner_info.id(), local.id());
    }

    #[test]
    fn single_hop_inbound_is_gateway_to_owner() {
        let local = RouterKeys::generate();
        let hops = plan_path(1);
        let terminus = new_tunnel_id();
        let blob = assemble(&hops, Direction::Inbound, &local, terminus);

        let record = open_record(&hops[0], &blob);
        assert_eq!(record.role, HopRole::InboundGateway);
        assert_eq!(record.next_hop, Some(local.id()));
        assert_eq!(record.next_tunnel_id, terminus);
        assert!(record.next_blob.is_empty());
    }

    #[test]
    fn chained_reply_peels_to_votes() {
        let hops = plan_path(3);

        // Each hop seals its vote around its successor's reply, last first
        let mut reply: Vec<u8> = Vec::new();
        for hop in hops.iter().rev() {
            let layer = BuildReplyLayer {
                vote: BuildVote::Accept,
                inner: reply,
            };
            reply = seal_layer(
                &hop.planned.layer_key,
                0,
                BUILD_REPLY_CONTEXT,
                &bincode::serialize(&layer).unwrap(),
            );
        }

        // The originator peels in path order and sees every vote
        let mut buf = reply;
        for hop in planned(&hops) {
            let opened = open_layer(&hop.layer_key, 0, BUILD_REPLY_CONTEXT, &buf).unwrap();
            let layer: BuildReplyLayer = deserialize_bounded(&opened).unwrap();
            assert_eq!(layer.vote, BuildVote::Accept);
            buf = layer.inner;
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn reject_vote_is_visible_to_the_originator() {
        let hops = plan_path(2);

        // Second hop rejects without forwarding; first hop wraps it
        let reject = BuildReplyLayer {
            vote: BuildVote::Reject(RejectReason::Capacity),
            inner: Vec::new(),
        };
        let inner = seal_layer(
            &hops[1].planned.layer_key,
            0,
            BUILD_REPLY_CONTEXT,
            &bincode::serialize(&reject).unwrap(),
        );
        let outer_layer = BuildReplyLayer {
            vote: BuildVote::Accept,
            inner,
        };
        let reply = seal_layer(
            &hops[0].planned.layer_key,
            0,
            BUILD_REPLY_CONTEXT,
            &bincode::serialize(&outer_layer).unwrap(),
        );

        let opened = open_layer(&hops[0].planned.layer_key, 0, BUILD_REPLY_CONTEXT, &reply).unwrap();
        let first: BuildReplyLayer = deserialize_bounded(&opened).unwrap();
        assert_eq!(first.vote, BuildVote::Accept);

        let opened =
            open_layer(&hops[1].planned.layer_key, 0, BUILD_REPLY_CONTEXT, &first.inner).unwrap();
        let second: BuildReplyLayer = deserialize_bounded(&opened).unwrap();
        assert_eq!(second.vote, BuildVote::Reject(RejectReason::Capacity));
    }

    #[test]
    fn stream_open_signature_binds_both_endpoints() {
        let from = DestinationKeys::generate();
        let to = DestinationKeys::generate().id();
        let other = DestinationKeys::generate().id();

        let payload = stream_open_payload(7, &from.destination(), &to);
        let signature = sign_with_domain(from.signing_key(), STREAM_SIGNATURE_DOMAIN, &payload);

        assert!(verify_with_domain(
            &from.destination().signing_key,
            STREAM_SIGNATURE_DOMAIN,
            &payload,
            &signature
        )
        .is_ok());

        // Same signature does not transfer to another target destination
        let relocated = stream_open_payload(7, &from.destination(), &other);
        assert!(verify_with_domain(
            &from.destination().signing_key,
            STREAM_SIGNATURE_DOMAIN,
            &relocated,
            &signature
        )
        .is_err());
    }

    #[test]
    fn tunnel_usability_follows_expiry() {
        let now = now_ms();
        let tunnel = Tunnel {
            direction: Direction::Outbound,
            state: TunnelState::Established,
            hops: Vec::new(),
            entry_id: 1,
            terminus_id: 0,
            expires: now + 1_000,
            counter: 0,
            pinned: Vec::new(),
        };
        assert!(tunnel.usable(now));
        assert!(!tunnel.usable(now + 1_000));
    }

    // ------------------------------------------------------------------
    // Session-reference handoff on failure paths
    // ------------------------------------------------------------------

    use crate::garlic::MessageSwitch;
    use crate::netdb::{AnyPeer, NetDb};
    use crate::transport::Transport;

    /// Transport + NetDB on loopback with the given session idle timeout.
    async fn net_node(idle: Duration) -> (Arc<RouterKeys>, NetDb, Transport) {
        let keys = Arc::new(RouterKeys::generate());
        let netdb = NetDb::new(keys.id(), 3600, Arc::new(AnyPeer));
        let transport = Transport::bind(
            "127.0.0.1:0".parse().unwrap(),
            &keys,
            Vec::new(),
            CAP_TRANSIT | CAP_REACHABLE,
            netdb.clone(),
            idle,
        )
        .await
        .expect("transport bind");
        (keys, netdb, transport)
    }

    async fn wait_until<F, Fut>(what: &str, limit: Duration, mut probe_state: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = Instant::now() + limit;
        while !probe_state().await {
            assert!(Instant::now() < deadline, "timed out waiting: {what}");
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    #[tokio::test]
    async fn dial_completing_after_its_build_releases_the_session() {
        let (a_keys, a_netdb, a_transport) = net_node(Duration::from_secs(1)).await;
        let (_h_keys, _h_netdb, h_transport) = net_node(Duration::from_secs(600)).await;
        let h_id = h_transport.local_id();
        a_netdb
            .store_router_info(h_transport.local_info().clone())
            .await
            .expect("descriptor accepted");

        let engine = TunnelEngine::new(
            a_keys.clone(),
            TunnelConfig::default(),
            a_netdb.clone(),
            a_transport.clone(),
        );

        // The dial half of a build attempt: session up, ref acquired.
        a_transport.connect(h_id).await.expect("dial hop");
        a_transport.add_ref(h_id).await;

        // The ref keeps the otherwise idle session alive.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(
            a_transport.connected_peers().await.contains(&h_id),
            "pinned session must survive idle reaping"
        );

        // The completion report lands after its build attempt is long gone;
        // the engine owns nothing it could attach the ref to and must drop
        // it so the session can be reaped.
        engine
            .cmd_tx
            .send(Command::BuildDialComplete(4242, h_id))
            .await
            .expect("engine alive");

        wait_until("orphaned dial ref released", Duration::from_secs(6), || {
            let transport = a_transport.clone();
            async move { !transport.connected_peers().await.contains(&h_id) }
        })
        .await;
        engine.quit().await;
    }

    #[tokio::test]
    async fn timed_out_forward_cleans_transit_entry_and_successor_pin() {
        // b forwards a two-hop chain to a successor that never answers
        let (b_keys, b_netdb, b_transport) = net_node(Duration::from_secs(1)).await;
        let (_c_keys, _c_netdb, c_transport) = net_node(Duration::from_secs(600)).await;
        let (t_keys, t_netdb, t_transport) = net_node(Duration::from_secs(600)).await;
        let c_id = c_transport.local_id();

        let config = TunnelConfig {
            build_timeout: Duration::from_secs(1),
            ..TunnelConfig::default()
        };
        let b_engine = TunnelEngine::new(
            b_keys.clone(),
            config,
            b_netdb.clone(),
            b_transport.clone(),
        );
        MessageSwitch::spawn(b_transport.clone(), b_netdb.clone(), b_engine.clone())
            .await
            .expect("switch claims the inbound queue");

        t_netdb
            .store_router_info(b_transport.local_info().clone())
            .await
            .expect("descriptor accepted");

        let planned = vec![
            PlannedHop {
                info: b_transport.local_info().clone(),
                layer_key: random_layer_key(),
                receive_id: new_tunnel_id(),
            },
            PlannedHop {
                info: c_transport.local_info().clone(),
                layer_key: random_layer_key(),
                receive_id: new_tunnel_id(),
            },
        ];
        let blob = assemble_build_chain(
            &planned,
            Direction::Outbound,
            t_keys.id(),
            t_transport.local_info(),
            0,
            now_ms() + 600_000,
        );

        t_transport
            .connect(b_transport.local_id())
            .await
            .expect("dial b");
        t_transport
            .send(
                b_transport.local_id(),
                &RouterMessage::TunnelBuild {
                    build_id: new_tunnel_id(),
                    blob,
                },
            )
            .await
            .expect("chain sent");

        // b accepts its record and forwards the rest toward c
        wait_until("transit entry installed", Duration::from_secs(5), || {
            let engine = b_engine.clone();
            async move { engine.counts().await.transit == 1 }
        })
        .await;

        // c never replies: the forward deadline must clear the half-built
        // entry rather than leaving it to squat until the tunnel expiry
        wait_until("transit entry cleaned up", Duration::from_secs(10), || {
            let engine = b_engine.clone();
            async move { engine.counts().await.transit == 0 }
        })
        .await;

        // and the successor pin went with it, so b's reaper drops c
        wait_until("successor session released", Duration::from_secs(8), || {
            let transport = b_transport.clone();
            async move { !transport.connected_peers().await.contains(&c_id) }
        })
        .await;
        b_engine.quit().await;
    }
}
