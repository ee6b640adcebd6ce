//! # Router Facade
//!
//! [`Router`] owns the whole stack and is what an embedder holds: construct
//! it with a [`Config`], call [`Router::start`], and everything else — NetDB,
//! transport, tunnel engine, message switch, the shared client destination,
//! and both local proxies — comes up behind it. [`Router::stop`] tears the
//! stack down in reverse order; the router can be started again afterwards.
//!
//! All inspection calls (`status`, `info`, `peers`, `tunnels`, `bandwidth`,
//! `logs`) are cheap and safe to call from any task, running or not.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::garlic::MessageSwitch;
use crate::identity::{RouterId, RouterKeys, CAP_REACHABLE, CAP_TRANSIT};
use crate::netdb::{NetDb, SubnetDiversity};
use crate::proxy::{HttpProxy, SocksProxy, StreamGateway};
use crate::transport::{BandwidthSnapshot, Transport};
use crate::tunnel::{DestinationHandle, TunnelConfig, TunnelCounts, TunnelEngine};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Errors and Status
// ============================================================================

/// Start/stop called in the wrong state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    AlreadyRunning,
    NotRunning,
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::AlreadyRunning => write!(f, "router is already running"),
            LifecycleError::NotRunning => write!(f, "router is not running"),
        }
    }
}

impl std::error::Error for LifecycleError {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RouterStatus {
    /// No router constructed yet. [`Router::status`] never returns this;
    /// it is the `Default` for embedders holding an `Option<Router>`.
    #[default]
    Uninitialized,
    Stopped,
    Running,
}

impl std::fmt::Display for RouterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterStatus::Uninitialized => write!(f, "uninitialized"),
            RouterStatus::Stopped => write!(f, "stopped"),
            RouterStatus::Running => write!(f, "running"),
        }
    }
}

/// Coarse health of the overlay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    /// No peers yet (fresh start, nothing bootstrapped).
    Unknown,
    /// Peers connected, but no usable client tunnels yet.
    Testing,
    /// Peers connected and client tunnels established.
    Ok,
}

impl std::fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkStatus::Unknown => write!(f, "unknown"),
            NetworkStatus::Testing => write!(f, "testing"),
            NetworkStatus::Ok => write!(f, "ok"),
        }
    }
}

/// Byte rates over the last sampling interval plus lifetime totals.
#[derive(Debug, Clone, Copy, Default)]
pub struct BandwidthReport {
    /// Bytes per second, averaged over the last interval.
    pub in_rate: u64,
    pub out_rate: u64,
    pub transit_rate: u64,
    pub totals: BandwidthSnapshot,
}

/// One-call summary of the router.
#[derive(Debug, Clone)]
pub struct RouterReport {
    pub version: &'static str,
    pub router_id: RouterId,
    pub status: RouterStatus,
    pub network_status: NetworkStatus,
    pub uptime_secs: u64,
    pub known_routers: usize,
    pub connected_peers: usize,
    pub tunnels: TunnelCounts,
    pub bandwidth: BandwidthReport,
    pub http_proxy: Option<SocketAddr>,
    pub socks_proxy: Option<SocketAddr>,
}

// ============================================================================
// Log Buffer
// ============================================================================

/// Bounded in-memory log tail, shared between the tracing layer and the
/// `logs` call. Old lines fall off the front.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<LogBufferInner>,
}

struct LogBufferInner {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(LogBufferInner {
                lines: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.inner.lines.lock().expect("log buffer lock");
        if lines.len() == self.inner.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Most recent `count` lines, oldest first.
    pub fn tail(&self, count: usize) -> Vec<String> {
        let lines = self.inner.lines.lock().expect("log buffer lock");
        lines
            .iter()
            .skip(lines.len().saturating_sub(count))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lines.lock().expect("log buffer lock").len()
    }

    pub fn clear(&self) {
        self.inner.lines.lock().expect("log buffer lock").clear();
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tracing layer feeding this buffer. Install it alongside the normal
    /// fmt layer; the router never installs a global subscriber itself.
    pub fn layer(&self) -> BufferLayer {
        BufferLayer {
            buffer: self.clone(),
        }
    }
}

/// `tracing-subscriber` layer that renders events into a [`LogBuffer`].
pub struct BufferLayer {
    buffer: LogBuffer,
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for BufferLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let meta = event.metadata();
        let mut line = format!("{} {}", meta.level(), meta.target());
        event.record(&mut LineVisitor { line: &mut line });
        self.buffer.push(line);
    }
}

struct LineVisitor<'a> {
    line: &'a mut String,
}

impl tracing::field::Visit for LineVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.line, " {:?}", value);
        } else {
            let _ = write!(self.line, " {}={:?}", field.name(), value);
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// The embedder-facing handle. Cheap to clone; all clones drive the same
/// router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    keys: Arc<RouterKeys>,
    config: Mutex<Config>,
    logs: LogBuffer,
    state: AsyncMutex<Option<Running>>,
}

/// Everything that exists only while the router runs.
struct Running {
    netdb: NetDb,
    transport: Transport,
    engine: TunnelEngine,
    switch: JoinHandle<()>,
    sampler: JoinHandle<()>,
    rates: Arc<Mutex<BandwidthReport>>,
    gateway: StreamGateway,
    http: Option<HttpProxy>,
    socks: Option<SocksProxy>,
    started: Instant,
}

impl Router {
    /// Construct a router with fresh keys. Construction is the only
    /// initialization there is; `start` may be called immediately.
    pub fn new(config: Config) -> Self {
        Self::with_keys(RouterKeys::generate(), config)
    }

    /// Construct from a `key = value` configuration file.
    pub fn from_conf_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::new(Config::load(path)?))
    }

    /// Construct with persisted key material.
    pub fn with_keys(keys: RouterKeys, config: Config) -> Self {
        let logs = LogBuffer::new(config.log_buffer_lines());
        Self {
            inner: Arc::new(RouterInner {
                keys: Arc::new(keys),
                config: Mutex::new(config),
                logs,
                state: AsyncMutex::new(None),
            }),
        }
    }

    #[inline]
    pub fn router_id(&self) -> RouterId {
        self.inner.keys.id()
    }

    /// The shared log tail. Hand `logs().layer()` to the subscriber builder
    /// to capture tracing output in it.
    pub fn log_buffer(&self) -> LogBuffer {
        self.inner.logs.clone()
    }

    /// Bring the full stack up.
    ///
    /// Fails with [`LifecycleError::AlreadyRunning`] when already started;
    /// bind failures roll the partially-started stack back down.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.is_some() {
            return Err(LifecycleError::AlreadyRunning.into());
        }

        let config = self.inner.config.lock().expect("config lock").clone();
        let bind_addr: SocketAddr = format!("{}:{}", config.host(), config.port())
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", config.host(), config.port()))?;

        let netdb = NetDb::new(
            self.router_id(),
            config.netdb_ttl_secs(),
            Arc::new(SubnetDiversity),
        );
        let transport = match Transport::bind(
            bind_addr,
            &self.inner.keys,
            Vec::new(),
            CAP_TRANSIT | CAP_REACHABLE,
            netdb.clone(),
            config.session_idle_timeout(),
        )
        .await
        {
            Ok(transport) => transport,
            Err(err) => {
                netdb.quit().await;
                return Err(err);
            }
        };

        let engine = TunnelEngine::new(
            self.inner.keys.clone(),
            TunnelConfig::from_config(&config),
            netdb.clone(),
            transport.clone(),
        );
        let switch = match MessageSwitch::spawn(transport.clone(), netdb.clone(), engine.clone())
            .await
            .context("transport inbound queue already claimed")
        {
            Ok(switch) => switch,
            Err(err) => {
                engine.quit().await;
                transport.shutdown().await;
                netdb.quit().await;
                return Err(err);
            }
        };

        // One shared client destination backs both proxies
        let stack = async {
            let handle = engine.create_destination().await?;
            let gateway = StreamGateway::new(handle);
            let http = HttpProxy::bind(
                SocketAddr::from(([127, 0, 0, 1], config.http_proxy_port())),
                gateway.clone(),
            )
            .await?;
            let socks = match SocksProxy::bind(
                SocketAddr::from(([127, 0, 0, 1], config.socks_proxy_port())),
                gateway.clone(),
            )
            .await
            {
                Ok(socks) => socks,
                Err(err) => {
                    http.stop().await;
                    return Err(err);
                }
            };
            Ok::<_, anyhow::Error>((gateway, http, socks))
        }
        .await;
        let (gateway, http, socks) = match stack {
            Ok(parts) => parts,
            Err(err) => {
                switch.abort();
                engine.quit().await;
                transport.shutdown().await;
                netdb.quit().await;
                return Err(err);
            }
        };

        let rates = Arc::new(Mutex::new(BandwidthReport::default()));
        let sampler = spawn_bandwidth_sampler(
            transport.counters(),
            rates.clone(),
            config.bandwidth_interval(),
        );

        let local_addr = transport.local_addr()?;
        info!(
            router = %self.router_id().short(),
            %local_addr,
            http = %http.local_addr(),
            socks = %socks.local_addr(),
            "router started"
        );
        self.inner
            .logs
            .push(format!("router {} started on {}", self.router_id().short(), local_addr));

        *state = Some(Running {
            netdb,
            transport,
            engine,
            switch,
            sampler,
            rates,
            gateway,
            http: Some(http),
            socks: Some(socks),
            started: Instant::now(),
        });
        Ok(())
    }

    /// Tear the stack down in reverse start order.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let Some(running) = state.take() else {
            return Err(LifecycleError::NotRunning.into());
        };

        if let Some(http) = running.http {
            http.stop().await;
        }
        if let Some(socks) = running.socks {
            socks.stop().await;
        }
        running.gateway.close().await;
        running.sampler.abort();
        running.engine.quit().await;
        running.switch.abort();
        running.transport.shutdown().await;
        running.netdb.quit().await;

        info!(router = %self.router_id().short(), "router stopped");
        self.inner
            .logs
            .push(format!("router {} stopped", self.router_id().short()));
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.is_some()
    }

    pub async fn status(&self) -> RouterStatus {
        if self.is_running().await {
            RouterStatus::Running
        } else {
            RouterStatus::Stopped
        }
    }

    /// Bound transport address, when running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let state = self.inner.state.lock().await;
        state.as_ref().and_then(|r| r.transport.local_addr().ok())
    }

    /// Dial a known router address and gossip descriptors with it.
    pub async fn bootstrap(&self, addr: SocketAddr) -> Result<RouterId> {
        let transport = {
            let state = self.inner.state.lock().await;
            state
                .as_ref()
                .map(|r| r.transport.clone())
                .ok_or(LifecycleError::NotRunning)?
        };
        let peer = transport.connect_addr(addr).await?;
        info!(peer = %peer.short(), %addr, "bootstrapped");
        Ok(peer)
    }

    /// Identities of currently connected peers.
    pub async fn peers(&self) -> Vec<RouterId> {
        let transport = {
            let state = self.inner.state.lock().await;
            state.as_ref().map(|r| r.transport.clone())
        };
        match transport {
            Some(transport) => transport.connected_peers().await,
            None => Vec::new(),
        }
    }

    /// Number of currently connected peers.
    pub async fn active_peers(&self) -> usize {
        self.peers().await.len()
    }

    /// Number of router descriptors in the NetDB.
    pub async fn known_peers(&self) -> usize {
        let netdb = {
            let state = self.inner.state.lock().await;
            state.as_ref().map(|r| r.netdb.clone())
        };
        match netdb {
            Some(netdb) => netdb.router_count().await,
            None => 0,
        }
    }

    /// Client plus transit tunnels currently alive.
    pub async fn active_tunnels(&self) -> usize {
        let counts = self.tunnels().await;
        counts.client + counts.transit
    }

    pub async fn tunnels(&self) -> TunnelCounts {
        let engine = {
            let state = self.inner.state.lock().await;
            state.as_ref().map(|r| r.engine.clone())
        };
        match engine {
            Some(engine) => engine.counts().await,
            None => TunnelCounts::default(),
        }
    }

    /// Rates from the last sampling interval; zeros while stopped.
    pub async fn bandwidth(&self) -> BandwidthReport {
        let state = self.inner.state.lock().await;
        match state.as_ref() {
            Some(running) => *running.rates.lock().expect("rates lock"),
            None => BandwidthReport::default(),
        }
    }

    /// Inbound bytes per second over the last sampling interval.
    pub async fn bandwidth_in(&self) -> u64 {
        self.bandwidth().await.in_rate
    }

    /// Outbound bytes per second over the last sampling interval.
    pub async fn bandwidth_out(&self) -> u64 {
        self.bandwidth().await.out_rate
    }

    /// Forwarded transit bytes per second over the last sampling interval.
    pub async fn bandwidth_transit(&self) -> u64 {
        self.bandwidth().await.transit_rate
    }

    /// Local proxy addresses; `None` unless both proxies are bound.
    pub async fn proxy_addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        let state = self.inner.state.lock().await;
        let running = state.as_ref()?;
        Some((
            running.http.as_ref()?.local_addr(),
            running.socks.as_ref()?.local_addr(),
        ))
    }

    /// Rebind the HTTP proxy on the given port. Stops the current listener
    /// first; established streams are dropped but the shared destination and
    /// its tunnels stay up.
    pub async fn start_http_proxy(&self, port: u16) -> Result<SocketAddr> {
        let mut state = self.inner.state.lock().await;
        let running = state.as_mut().ok_or(LifecycleError::NotRunning)?;
        if let Some(http) = running.http.take() {
            http.stop().await;
        }
        let http = HttpProxy::bind(
            SocketAddr::from(([127, 0, 0, 1], port)),
            running.gateway.clone(),
        )
        .await?;
        let addr = http.local_addr();
        running.http = Some(http);
        Ok(addr)
    }

    /// Stop the HTTP proxy listener. No-op when it is not bound.
    pub async fn stop_http_proxy(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let running = state.as_mut().ok_or(LifecycleError::NotRunning)?;
        if let Some(http) = running.http.take() {
            http.stop().await;
        }
        Ok(())
    }

    /// Rebind the SOCKS proxy on the given port, as [`Router::start_http_proxy`].
    pub async fn start_socks_proxy(&self, port: u16) -> Result<SocketAddr> {
        let mut state = self.inner.state.lock().await;
        let running = state.as_mut().ok_or(LifecycleError::NotRunning)?;
        if let Some(socks) = running.socks.take() {
            socks.stop().await;
        }
        let socks = SocksProxy::bind(
            SocketAddr::from(([127, 0, 0, 1], port)),
            running.gateway.clone(),
        )
        .await?;
        let addr = socks.local_addr();
        running.socks = Some(socks);
        Ok(addr)
    }

    /// Stop the SOCKS proxy listener. No-op when it is not bound.
    pub async fn stop_socks_proxy(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let running = state.as_mut().ok_or(LifecycleError::NotRunning)?;
        if let Some(socks) = running.socks.take() {
            socks.stop().await;
        }
        Ok(())
    }

    /// The stream gateway of the shared client destination.
    pub async fn client_gateway(&self) -> Option<StreamGateway> {
        let state = self.inner.state.lock().await;
        state.as_ref().map(|r| r.gateway.clone())
    }

    /// Host a fresh destination on the running engine.
    pub async fn create_destination(&self) -> Result<DestinationHandle> {
        let engine = {
            let state = self.inner.state.lock().await;
            state
                .as_ref()
                .map(|r| r.engine.clone())
                .ok_or(LifecycleError::NotRunning)?
        };
        engine.create_destination().await
    }

    /// Most recent `count` log lines.
    pub fn logs(&self, count: usize) -> Vec<String> {
        self.inner.logs.tail(count)
    }

    /// Wipe the log tail. tracing output elsewhere is unaffected.
    pub fn clear_logs(&self) {
        self.inner.logs.clear();
    }

    pub fn get_config(&self, key: &str) -> Option<String> {
        self.inner
            .config
            .lock()
            .expect("config lock")
            .get(key)
            .map(|v| v.to_string())
    }

    /// Set a config value. Takes effect at the next `start`; the running
    /// stack keeps the values it started with.
    pub fn set_config(&self, key: &str, value: &str) {
        self.inner
            .config
            .lock()
            .expect("config lock")
            .set(key, value);
    }

    /// Full status summary.
    pub async fn info(&self) -> RouterReport {
        let state = self.inner.state.lock().await;
        let Some(running) = state.as_ref() else {
            return RouterReport {
                version: VERSION,
                router_id: self.router_id(),
                status: RouterStatus::Stopped,
                network_status: NetworkStatus::Unknown,
                uptime_secs: 0,
                known_routers: 0,
                connected_peers: 0,
                tunnels: TunnelCounts::default(),
                bandwidth: BandwidthReport::default(),
                http_proxy: None,
                socks_proxy: None,
            };
        };

        let netdb = running.netdb.clone();
        let transport = running.transport.clone();
        let engine = running.engine.clone();
        let uptime_secs = running.started.elapsed().as_secs();
        let bandwidth = *running.rates.lock().expect("rates lock");
        let http_proxy = running.http.as_ref().map(|p| p.local_addr());
        let socks_proxy = running.socks.as_ref().map(|p| p.local_addr());
        drop(state);

        let known_routers = netdb.router_count().await;
        let connected = transport.connected_peers().await.len();
        let tunnels = engine.counts().await;

        let network_status = if connected == 0 {
            NetworkStatus::Unknown
        } else if tunnels.client == 0 {
            NetworkStatus::Testing
        } else {
            NetworkStatus::Ok
        };

        RouterReport {
            version: VERSION,
            router_id: self.router_id(),
            status: RouterStatus::Running,
            network_status,
            uptime_secs,
            known_routers,
            connected_peers: connected,
            tunnels,
            bandwidth,
            http_proxy,
            socks_proxy,
        }
    }
}

/// Periodically diff the monotonic counters into per-second rates.
fn spawn_bandwidth_sampler(
    counters: Arc<crate::transport::BandwidthCounters>,
    rates: Arc<Mutex<BandwidthReport>>,
    interval: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let secs = interval.as_secs().max(1);
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        let mut prev = counters.snapshot();
        loop {
            ticker.tick().await;
            let now = counters.snapshot();
            let report = BandwidthReport {
                in_rate: now.bytes_in.saturating_sub(prev.bytes_in) / secs,
                out_rate: now.bytes_out.saturating_sub(prev.bytes_out) / secs,
                transit_rate: now.bytes_transit.saturating_sub(prev.bytes_transit) / secs,
                totals: now,
            };
            match rates.lock() {
                Ok(mut slot) => *slot = report,
                Err(_) => {
                    warn!("bandwidth rates lock poisoned, sampler stopping");
                    return;
                }
            }
            prev = now;
        }
    })
}
