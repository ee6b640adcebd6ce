//! # Network Database
//!
//! In-memory directory of known routers and published lease sets:
//!
//! - **Validating store**: every entry is signature-checked and
//!   freshness-checked before acceptance; forged or stale records never
//!   reach the tables
//! - **Monotonic replacement**: an offered entry replaces a stored one only
//!   when its published stamp is strictly newer (equal stamps are
//!   idempotent-ok)
//! - **Bounded tables**: LRU capacity caps keep memory flat no matter how
//!   many descriptors peers push
//! - **Hop selection**: randomized tunnel-hop picks under a pluggable
//!   diversity policy
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `store_router_info(ri)` | Validate and store a router descriptor |
//! | `store_lease_set(ls)` | Validate and store a destination lease set |
//! | `lookup_router(id)` | Fetch a live descriptor (purges expired on access) |
//! | `lookup_lease_set(id)` | Fetch a live lease set |
//! | `select_hops(n, exclude)` | Pick n distinct transit-capable hops |
//! | `random_routers(n, exclude)` | Sample descriptors for session gossip |
//!
//! ## Actor Architecture
//!
//! - `NetDb`: public cheap-clone handle
//! - `NetDbActor`: private task owning both tables
//! - Commands flow over an async channel; a periodic sweep tick expires
//!   entries that lookups have not touched
//!
//! ## Security
//!
//! - Ed25519 signature verification on every stored entry
//! - Clock-skew and staleness windows reject future-dated and ancient records
//! - Structural limits checked before any signature work

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tracing::{debug, trace, warn};

use crate::identity::{
    now_ms, parse_host_ip, DestinationId, FreshnessError, LeaseSet, Provenance, RouterId,
    RouterInfo,
};
use crate::messages::{LookupKind, NetDbEntry};

/// Maximum router descriptors retained; least-recently-used entries are
/// evicted beyond this.
pub const DEFAULT_MAX_ROUTERS: usize = 4096;

/// Maximum lease sets retained.
pub const DEFAULT_MAX_LEASE_SETS: usize = 1024;

/// Default descriptor TTL, measured from the published stamp.
pub const DEFAULT_ROUTER_TTL_SECS: u64 = 60 * 60;

/// How many known descriptors to offer a freshly connected peer.
pub const GOSSIP_SAMPLE: usize = 3;

/// Cadence of the expiry sweep inside the actor loop.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Errors
// ============================================================================

/// A record offered to the database failed validation.
///
/// Rejections are expected in normal operation (peers re-gossip stale
/// descriptors all the time) and are never fatal.
#[derive(Debug)]
pub enum StoreError {
    Rejected(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Rejected(reason) => write!(f, "store rejected: {}", reason),
        }
    }
}

impl std::error::Error for StoreError {}

/// Hop selection could not be satisfied from the current tables.
///
/// `usable` counts peers that survived the capability, exclusion, and
/// expiry filters; the diversity policy may still refuse a combination even
/// when `usable >= wanted`. Retryable once more descriptors arrive.
#[derive(Debug, PartialEq, Eq)]
pub enum SelectError {
    InsufficientPeers { wanted: usize, usable: usize },
}

impl std::fmt::Display for SelectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectError::InsufficientPeers { wanted, usable } => {
                write!(f, "insufficient peers: wanted {} hops, {} usable", wanted, usable)
            }
        }
    }
}

impl std::error::Error for SelectError {}

// ============================================================================
// Hop Diversity Policy
// ============================================================================

/// Decides which peers may share a tunnel.
///
/// The selector draws candidates in random order and asks the policy whether
/// each one may join the hops already chosen. Duplicate identities are
/// impossible by construction (the table is keyed by router id), so a policy
/// only has to judge locality.
pub trait HopPolicy: Send + Sync {
    /// Whether `candidate` may join a tunnel alongside the already-chosen hops.
    fn admissible(&self, candidate: &RouterInfo, chosen: &[RouterInfo]) -> bool;
}

/// Default policy: refuses two hops whose addresses share a network prefix
/// (/16 for IPv4, /32 for IPv6).
///
/// Loopback and unparseable addresses are admitted unconditionally. They
/// carry no locality signal, and refusing them would leave single-host
/// networks unable to build any tunnel.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubnetDiversity;

impl HopPolicy for SubnetDiversity {
    fn admissible(&self, candidate: &RouterInfo, chosen: &[RouterInfo]) -> bool {
        let Some(ip) = candidate.primary_addr().and_then(parse_host_ip) else {
            return true;
        };
        if ip.is_loopback() {
            return true;
        }
        let prov = Provenance::from_ip(ip);
        !chosen.iter().any(|c| c.provenance() == Some(prov))
    }
}

/// Permissive policy for tests and tiny networks: everyone may share a
/// tunnel with everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyPeer;

impl HopPolicy for AnyPeer {
    fn admissible(&self, _candidate: &RouterInfo, _chosen: &[RouterInfo]) -> bool {
        true
    }
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Clone)]
pub struct NetDb {
    cmd_tx: mpsc::Sender<Command>,
}

enum Command {
    // Store path (session gossip and local publication both funnel through
    // the same validation)
    StoreRouter(RouterInfo, oneshot::Sender<Result<(), StoreError>>),
    StoreLease(LeaseSet, oneshot::Sender<Result<(), StoreError>>),

    // Queries
    LookupRouter(RouterId, oneshot::Sender<Option<RouterInfo>>),
    LookupLease(DestinationId, oneshot::Sender<Option<LeaseSet>>),
    SelectHops(usize, Vec<RouterId>, oneshot::Sender<Result<Vec<RouterInfo>, SelectError>>),
    RandomRouters(usize, Vec<RouterId>, oneshot::Sender<Vec<RouterInfo>>),
    RouterCount(oneshot::Sender<usize>),

    Quit,
}

impl NetDb {
    /// Spawn the database actor.
    ///
    /// `local_id` is never stored and never selected as a hop. The policy is
    /// fixed at construction.
    pub fn new(local_id: RouterId, router_ttl_secs: u64, policy: Arc<dyn HopPolicy>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(100);

        let actor = NetDbActor {
            local_id,
            routers: LruCache::new(NonZeroUsize::new(DEFAULT_MAX_ROUTERS).unwrap()),
            lease_sets: LruCache::new(NonZeroUsize::new(DEFAULT_MAX_LEASE_SETS).unwrap()),
            policy,
            router_ttl_ms: router_ttl_secs.saturating_mul(1000),
            cmd_rx,
        };

        tokio::spawn(actor.run());

        Self { cmd_tx }
    }

    /// Validate and store a router descriptor.
    pub async fn store_router_info(&self, info: RouterInfo) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::StoreRouter(info, tx)).await.is_err() {
            return Err(StoreError::Rejected("netdb actor unavailable".to_string()));
        }
        rx.await
            .unwrap_or_else(|_| Err(StoreError::Rejected("netdb actor unavailable".to_string())))
    }

    /// Validate and store a destination lease set.
    pub async fn store_lease_set(&self, lease_set: LeaseSet) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::StoreLease(lease_set, tx)).await.is_err() {
            return Err(StoreError::Rejected("netdb actor unavailable".to_string()));
        }
        rx.await
            .unwrap_or_else(|_| Err(StoreError::Rejected("netdb actor unavailable".to_string())))
    }

    /// Store a wire-format database entry through the validating path.
    pub async fn store_entry(&self, entry: NetDbEntry) -> Result<(), StoreError> {
        match entry {
            NetDbEntry::Router(info) => self.store_router_info(info).await,
            NetDbEntry::Lease(lease_set) => self.store_lease_set(lease_set).await,
        }
    }

    /// Fetch a live router descriptor. Expired entries are purged on access.
    pub async fn lookup_router(&self, id: RouterId) -> Option<RouterInfo> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::LookupRouter(id, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Fetch a live lease set for a destination.
    pub async fn lookup_lease_set(&self, id: DestinationId) -> Option<LeaseSet> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::LookupLease(id, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Answer a wire-format lookup against the local tables.
    pub async fn lookup_entry(&self, key: [u8; 32], kind: LookupKind) -> Option<NetDbEntry> {
        match kind {
            LookupKind::Router => self
                .lookup_router(RouterId::from_bytes(key))
                .await
                .map(NetDbEntry::Router),
            LookupKind::Lease => self
                .lookup_lease_set(DestinationId::from_bytes(key))
                .await
                .map(NetDbEntry::Lease),
        }
    }

    /// Select `count` distinct transit-capable hops in random order.
    ///
    /// Never returns the local router, anything in `exclude`, or a
    /// combination the diversity policy refuses.
    pub async fn select_hops(
        &self,
        count: usize,
        exclude: &[RouterId],
    ) -> Result<Vec<RouterInfo>, SelectError> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::SelectHops(count, exclude.to_vec(), tx))
            .await
            .is_err()
        {
            return Err(SelectError::InsufficientPeers { wanted: count, usable: 0 });
        }
        rx.await
            .unwrap_or(Err(SelectError::InsufficientPeers { wanted: count, usable: 0 }))
    }

    /// Sample up to `count` live descriptors for gossip to a new session.
    pub async fn random_routers(&self, count: usize, exclude: &[RouterId]) -> Vec<RouterInfo> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::RandomRouters(count, exclude.to_vec(), tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Number of live router descriptors currently known.
    pub async fn router_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::RouterCount(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Actor
// ============================================================================

struct NetDbActor {
    local_id: RouterId,
    routers: LruCache<RouterId, RouterInfo>,
    lease_sets: LruCache<DestinationId, LeaseSet>,
    policy: Arc<dyn HopPolicy>,
    router_ttl_ms: u64,
    cmd_rx: mpsc::Receiver<Command>,
}

impl NetDbActor {
    async fn run(mut self) {
        let mut sweep_interval = tokio::time::interval(SWEEP_INTERVAL);
        sweep_interval.tick().await; // Skip initial tick

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::StoreRouter(info, reply)) => {
                            let _ = reply.send(self.handle_store_router(info));
                        }
                        Some(Command::StoreLease(lease_set, reply)) => {
                            let _ = reply.send(self.handle_store_lease(lease_set));
                        }
                        Some(Command::LookupRouter(id, reply)) => {
                            let _ = reply.send(self.handle_lookup_router(id));
                        }
                        Some(Command::LookupLease(id, reply)) => {
                            let _ = reply.send(self.handle_lookup_lease(id));
                        }
                        Some(Command::SelectHops(count, exclude, reply)) => {
                            let _ = reply.send(self.handle_select_hops(count, &exclude));
                        }
                        Some(Command::RandomRouters(count, exclude, reply)) => {
                            let _ = reply.send(self.handle_random_routers(count, &exclude));
                        }
                        Some(Command::RouterCount(reply)) => {
                            let _ = reply.send(self.live_router_count());
                        }
                        Some(Command::Quit) | None => {
                            debug!("netdb actor shutting down");
                            break;
                        }
                    }
                }

                // Periodic expiry of entries lookups have not touched
                _ = sweep_interval.tick() => {
                    self.sweep();
                }
            }
        }
    }

    fn handle_store_router(&mut self, info: RouterInfo) -> Result<(), StoreError> {
        let id = info.id();

        if id == self.local_id {
            trace!("ignoring own descriptor offered to netdb");
            return Ok(());
        }

        if !info.validate_structure() {
            debug!(peer = %id.short(), "router descriptor rejected: malformed structure");
            return Err(StoreError::Rejected("malformed descriptor structure".to_string()));
        }

        if let Err(err) = info.verify_fresh(self.router_ttl_ms / 1000) {
            let reason = match err {
                FreshnessError::SignatureInvalid => {
                    warn!(peer = %id.short(), "router descriptor rejected: signature verification failed");
                    "signature verification failed".to_string()
                }
                FreshnessError::ClockSkewFuture { drift_ms, .. } => {
                    debug!(
                        peer = %id.short(),
                        drift_ms,
                        "router descriptor rejected: future-dated"
                    );
                    format!("future-dated by {}ms", drift_ms)
                }
                FreshnessError::Stale { age_ms, .. } => {
                    debug!(
                        peer = %id.short(),
                        age_secs = age_ms / 1000,
                        "router descriptor rejected: stale"
                    );
                    format!("descriptor is {}s old", age_ms / 1000)
                }
            };
            return Err(StoreError::Rejected(reason));
        }

        if let Some(existing) = self.routers.peek(&id) {
            if existing.published > info.published {
                debug!(
                    peer = %id.short(),
                    stored = existing.published,
                    offered = info.published,
                    "router descriptor rejected: older than stored version"
                );
                return Err(StoreError::Rejected("older than stored version".to_string()));
            }
            if existing.published == info.published {
                // Idempotent re-store of the same version
                return Ok(());
            }
        }

        let is_new = self.routers.put(id, info).is_none();
        if is_new {
            debug!(peer = %id.short(), known = self.routers.len(), "learned new router");
        }
        Ok(())
    }

    fn handle_store_lease(&mut self, lease_set: LeaseSet) -> Result<(), StoreError> {
        let id = lease_set.id();

        if !lease_set.validate_structure() {
            debug!(dest = %id.short(), "lease set rejected: malformed structure");
            return Err(StoreError::Rejected("malformed lease set structure".to_string()));
        }

        if lease_set.verify().is_err() {
            warn!(dest = %id.short(), "lease set rejected: signature verification failed");
            return Err(StoreError::Rejected("signature verification failed".to_string()));
        }

        if !lease_set.has_live_lease(now_ms()) {
            debug!(
                dest = %id.short(),
                leases = lease_set.leases.len(),
                "lease set rejected: all leases expired"
            );
            return Err(StoreError::Rejected("all leases expired".to_string()));
        }

        if let Some(existing) = self.lease_sets.peek(&id) {
            if existing.published > lease_set.published {
                debug!(
                    dest = %id.short(),
                    stored = existing.published,
                    offered = lease_set.published,
                    "lease set rejected: older than stored version"
                );
                return Err(StoreError::Rejected("older than stored version".to_string()));
            }
            if existing.published == lease_set.published {
                return Ok(());
            }
        }

        self.lease_sets.put(id, lease_set);
        Ok(())
    }

    fn handle_lookup_router(&mut self, id: RouterId) -> Option<RouterInfo> {
        let now = now_ms();
        let ttl = self.router_ttl_ms;
        match self.routers.get(&id) {
            Some(info) if !descriptor_expired(info, ttl, now) => return Some(info.clone()),
            Some(_) => {}
            None => return None,
        }
        self.routers.pop(&id);
        trace!(peer = %id.short(), "purged expired descriptor on lookup");
        None
    }

    fn handle_lookup_lease(&mut self, id: DestinationId) -> Option<LeaseSet> {
        let now = now_ms();
        match self.lease_sets.get(&id) {
            Some(ls) if ls.has_live_lease(now) => return Some(ls.clone()),
            Some(_) => {}
            None => return None,
        }
        self.lease_sets.pop(&id);
        trace!(dest = %id.short(), "purged expired lease set on lookup");
        None
    }

    fn handle_select_hops(
        &mut self,
        count: usize,
        exclude: &[RouterId],
    ) -> Result<Vec<RouterInfo>, SelectError> {
        let now = now_ms();
        let ttl = self.router_ttl_ms;
        let local = self.local_id;

        let mut candidates: Vec<RouterInfo> = self
            .routers
            .iter()
            .map(|(_, info)| info)
            .filter(|info| {
                let id = info.id();
                id != local
                    && info.accepts_transit()
                    && !exclude.contains(&id)
                    && !descriptor_expired(info, ttl, now)
            })
            .cloned()
            .collect();

        let usable = candidates.len();
        if usable < count {
            return Err(SelectError::InsufficientPeers { wanted: count, usable });
        }

        // Partial Fisher-Yates: draw a random remaining candidate each round
        // and keep it only when the policy admits it next to the hops chosen
        // so far.
        let mut rng = rand::thread_rng();
        let mut chosen: Vec<RouterInfo> = Vec::with_capacity(count);
        let mut remaining = candidates.len();
        while chosen.len() < count && remaining > 0 {
            let pick = rng.gen_range(0..remaining);
            candidates.swap(pick, remaining - 1);
            remaining -= 1;
            let candidate = &candidates[remaining];
            if self.policy.admissible(candidate, &chosen) {
                chosen.push(candidate.clone());
            }
        }

        if chosen.len() < count {
            debug!(
                wanted = count,
                usable,
                admitted = chosen.len(),
                "hop selection exhausted candidates under diversity policy"
            );
            return Err(SelectError::InsufficientPeers { wanted: count, usable });
        }

        Ok(chosen)
    }

    fn handle_random_routers(&mut self, count: usize, exclude: &[RouterId]) -> Vec<RouterInfo> {
        let now = now_ms();
        let ttl = self.router_ttl_ms;
        let local = self.local_id;

        let mut sample: Vec<RouterInfo> = self
            .routers
            .iter()
            .map(|(_, info)| info)
            .filter(|info| {
                let id = info.id();
                id != local && !exclude.contains(&id) && !descriptor_expired(info, ttl, now)
            })
            .cloned()
            .collect();

        sample.shuffle(&mut rand::thread_rng());
        sample.truncate(count);
        sample
    }

    fn live_router_count(&self) -> usize {
        let now = now_ms();
        let ttl = self.router_ttl_ms;
        self.routers
            .iter()
            .filter(|(_, info)| !descriptor_expired(info, ttl, now))
            .count()
    }

    /// Drop expired entries that no lookup has purged.
    fn sweep(&mut self) {
        let now = now_ms();
        let ttl = self.router_ttl_ms;

        let expired_routers: Vec<RouterId> = self
            .routers
            .iter()
            .filter(|(_, info)| descriptor_expired(info, ttl, now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired_routers {
            self.routers.pop(id);
        }

        let expired_leases: Vec<DestinationId> = self
            .lease_sets
            .iter()
            .filter(|(_, ls)| !ls.has_live_lease(now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired_leases {
            self.lease_sets.pop(id);
        }

        if !expired_routers.is_empty() || !expired_leases.is_empty() {
            debug!(
                routers = expired_routers.len(),
                lease_sets = expired_leases.len(),
                remaining = self.routers.len(),
                "netdb sweep expired entries"
            );
        }
    }
}

#[inline]
fn descriptor_expired(info: &RouterInfo, ttl_ms: u64, now: u64) -> bool {
    now.saturating_sub(info.published) > ttl_ms
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{sign_with_domain, ROUTER_INFO_SIGNATURE_DOMAIN};
    use crate::identity::{
        DestinationKeys, Lease, RouterKeys, CAP_REACHABLE, CAP_TRANSIT,
    };
    use std::collections::HashSet;

    fn make_router(addr: &str) -> (RouterKeys, RouterInfo) {
        let keys = RouterKeys::generate();
        let info = keys.create_router_info(vec![addr.to_string()], CAP_TRANSIT | CAP_REACHABLE);
        (keys, info)
    }

    fn signed_info_at(keys: &RouterKeys, addr: &str, published: u64) -> RouterInfo {
        let identity = keys.identity();
        let addrs = vec![addr.to_string()];
        let capabilities = CAP_TRANSIT | CAP_REACHABLE;
        let payload = RouterInfo::build_signed_payload(&identity, &addrs, capabilities, published);
        let signature = sign_with_domain(keys.signing_key(), ROUTER_INFO_SIGNATURE_DOMAIN, &payload);
        RouterInfo {
            identity,
            addrs,
            capabilities,
            published,
            signature,
        }
    }

    fn test_db() -> NetDb {
        NetDb::new(
            RouterKeys::generate().id(),
            DEFAULT_ROUTER_TTL_SECS,
            Arc::new(AnyPeer),
        )
    }

    fn test_actor(policy: Arc<dyn HopPolicy>) -> NetDbActor {
        let (_tx, cmd_rx) = mpsc::channel(1);
        NetDbActor {
            local_id: RouterKeys::generate().id(),
            routers: LruCache::new(NonZeroUsize::new(DEFAULT_MAX_ROUTERS).unwrap()),
            lease_sets: LruCache::new(NonZeroUsize::new(DEFAULT_MAX_LEASE_SETS).unwrap()),
            policy,
            router_ttl_ms: DEFAULT_ROUTER_TTL_SECS * 1000,
            cmd_rx,
        }
    }

    #[tokio::test]
    async fn store_then_lookup_returns_descriptor() {
        let db = test_db();
        let (_, info) = make_router("127.0.0.1:9001");
        let id = info.id();

        db.store_router_info(info.clone()).await.unwrap();

        let found = db.lookup_router(id).await.expect("descriptor should be stored");
        assert_eq!(found, info);
        assert_eq!(db.router_count().await, 1);
    }

    #[tokio::test]
    async fn newer_version_replaces_older_never_reverse() {
        let db = test_db();
        let keys = RouterKeys::generate();
        let now = now_ms();

        let v1 = signed_info_at(&keys, "127.0.0.1:9001", now - 10_000);
        let v2 = signed_info_at(&keys, "127.0.0.1:9002", now - 5_000);

        db.store_router_info(v1.clone()).await.unwrap();
        db.store_router_info(v2.clone()).await.unwrap();

        let found = db.lookup_router(keys.id()).await.unwrap();
        assert_eq!(found.published, v2.published);
        assert_eq!(found.primary_addr(), Some("127.0.0.1:9002"));

        // Replaying the older version must not roll the entry back
        let err = db.store_router_info(v1).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        let found = db.lookup_router(keys.id()).await.unwrap();
        assert_eq!(found.published, v2.published);
    }

    #[tokio::test]
    async fn equal_version_restore_is_idempotent() {
        let db = test_db();
        let (_, info) = make_router("127.0.0.1:9001");

        db.store_router_info(info.clone()).await.unwrap();
        db.store_router_info(info).await.unwrap();
        assert_eq!(db.router_count().await, 1);
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected_and_not_stored() {
        let db = test_db();
        let (_, mut info) = make_router("127.0.0.1:9001");
        let id = info.id();
        info.signature[0] ^= 0x01;

        let err = db.store_router_info(info).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert!(db.lookup_router(id).await.is_none());
        assert_eq!(db.router_count().await, 0);
    }

    #[tokio::test]
    async fn future_dated_descriptor_is_rejected() {
        let db = test_db();
        let keys = RouterKeys::generate();
        let info = signed_info_at(&keys, "127.0.0.1:9001", now_ms() + 60_000);

        let err = db.store_router_info(info).await.unwrap_err();
        let StoreError::Rejected(reason) = err;
        assert!(reason.contains("future-dated"), "unexpected reason: {reason}");
    }

    #[tokio::test]
    async fn stale_descriptor_is_rejected() {
        let db = test_db();
        let keys = RouterKeys::generate();
        let too_old = now_ms() - (DEFAULT_ROUTER_TTL_SECS + 60) * 1000;
        let info = signed_info_at(&keys, "127.0.0.1:9001", too_old);

        let err = db.store_router_info(info).await.unwrap_err();
        let StoreError::Rejected(reason) = err;
        assert!(reason.contains("old"), "unexpected reason: {reason}");
    }

    #[tokio::test]
    async fn own_descriptor_is_ignored() {
        let keys = RouterKeys::generate();
        let db = NetDb::new(keys.id(), DEFAULT_ROUTER_TTL_SECS, Arc::new(AnyPeer));
        let own = keys.create_router_info(vec!["127.0.0.1:9001".to_string()], CAP_TRANSIT);

        db.store_router_info(own).await.unwrap();
        assert_eq!(db.router_count().await, 0);
        assert!(db.lookup_router(keys.id()).await.is_none());
    }

    #[tokio::test]
    async fn lookup_purges_entry_past_ttl() {
        // 1 second TTL so the entry ages out while the test waits
        let db = NetDb::new(RouterKeys::generate().id(), 1, Arc::new(AnyPeer));
        let (_, info) = make_router("127.0.0.1:9001");
        let id = info.id();

        db.store_router_info(info).await.unwrap();
        assert!(db.lookup_router(id).await.is_some());

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(db.lookup_router(id).await.is_none());
        assert_eq!(db.router_count().await, 0);
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let mut actor = test_actor(Arc::new(AnyPeer));
        let keys = RouterKeys::generate();

        // Inserted directly: the validating store path would refuse a
        // descriptor this old.
        let stale = signed_info_at(&keys, "127.0.0.1:9001", 1);
        actor.routers.put(stale.id(), stale);

        let (_, live) = make_router("127.0.0.1:9002");
        actor.routers.put(live.id(), live.clone());

        let dest = DestinationKeys::generate();
        let dead_set = dest.create_lease_set(vec![Lease {
            gateway: RouterKeys::generate().id(),
            tunnel_id: 7,
            expires: 1,
        }]);
        actor.lease_sets.put(dest.id(), dead_set);

        actor.sweep();

        assert_eq!(actor.routers.len(), 1);
        assert!(actor.routers.peek(&live.id()).is_some());
        assert_eq!(actor.lease_sets.len(), 0);
    }

    #[tokio::test]
    async fn select_hops_returns_distinct_usable_peers() {
        let db = test_db();
        let mut ids = HashSet::new();
        for port in 9001..=9005u16 {
            let (_, info) = make_router(&format!("127.0.0.1:{port}"));
            ids.insert(info.id());
            db.store_router_info(info).await.unwrap();
        }

        let hops = db.select_hops(3, &[]).await.unwrap();
        assert_eq!(hops.len(), 3);

        let chosen: HashSet<RouterId> = hops.iter().map(|h| h.id()).collect();
        assert_eq!(chosen.len(), 3, "hops must be distinct");
        assert!(chosen.iter().all(|id| ids.contains(id)));
    }

    #[tokio::test]
    async fn select_hops_fails_when_too_few_usable() {
        let db = test_db();
        for port in 9001..=9002u16 {
            let (_, info) = make_router(&format!("127.0.0.1:{port}"));
            db.store_router_info(info).await.unwrap();
        }

        let err = db.select_hops(3, &[]).await.unwrap_err();
        assert_eq!(err, SelectError::InsufficientPeers { wanted: 3, usable: 2 });
    }

    #[tokio::test]
    async fn select_hops_respects_exclusions() {
        let db = test_db();
        let mut ids = Vec::new();
        for port in 9001..=9003u16 {
            let (_, info) = make_router(&format!("127.0.0.1:{port}"));
            ids.push(info.id());
            db.store_router_info(info).await.unwrap();
        }

        let excluded = ids[0];
        for _ in 0..10 {
            let hops = db.select_hops(2, &[excluded]).await.unwrap();
            assert!(hops.iter().all(|h| h.id() != excluded));
        }

        let err = db.select_hops(3, &[excluded]).await.unwrap_err();
        assert_eq!(err, SelectError::InsufficientPeers { wanted: 3, usable: 2 });
    }

    #[tokio::test]
    async fn select_hops_skips_peers_without_transit() {
        let db = test_db();
        let keys = RouterKeys::generate();
        let no_transit =
            keys.create_router_info(vec!["127.0.0.1:9001".to_string()], CAP_REACHABLE);
        db.store_router_info(no_transit).await.unwrap();

        let err = db.select_hops(1, &[]).await.unwrap_err();
        assert_eq!(err, SelectError::InsufficientPeers { wanted: 1, usable: 0 });
    }

    #[tokio::test]
    async fn select_hops_with_diversity_policy_spreads_subnets() {
        let db = NetDb::new(
            RouterKeys::generate().id(),
            DEFAULT_ROUTER_TTL_SECS,
            Arc::new(SubnetDiversity),
        );

        // Four peers across three /16 networks
        for addr in ["10.1.1.1:9001", "10.1.2.2:9002", "10.2.1.1:9003", "10.3.1.1:9004"] {
            let (_, info) = make_router(addr);
            db.store_router_info(info).await.unwrap();
        }

        for _ in 0..20 {
            let hops = db.select_hops(3, &[]).await.unwrap();
            let prefixes: HashSet<_> = hops.iter().map(|h| h.provenance().unwrap()).collect();
            assert_eq!(prefixes.len(), 3, "chosen hops must span distinct subnets");
        }

        // A fourth hop would have to reuse a subnet, which the policy refuses
        let err = db.select_hops(4, &[]).await.unwrap_err();
        assert_eq!(err, SelectError::InsufficientPeers { wanted: 4, usable: 4 });
    }

    #[test]
    fn subnet_diversity_refuses_shared_prefix() {
        let (_, a) = make_router("10.1.1.1:9001");
        let (_, b) = make_router("10.1.200.7:9002");
        let (_, c) = make_router("10.2.1.1:9003");
        let policy = SubnetDiversity;

        assert!(policy.admissible(&b, &[]));
        assert!(!policy.admissible(&b, &[a.clone()]));
        assert!(policy.admissible(&c, &[a]));
    }

    #[test]
    fn subnet_diversity_admits_loopback_peers() {
        let (_, a) = make_router("127.0.0.1:9001");
        let (_, b) = make_router("127.0.0.1:9002");
        let policy = SubnetDiversity;

        assert!(policy.admissible(&b, &[a]));
    }

    #[tokio::test]
    async fn lease_set_store_lookup_and_replacement() {
        let db = test_db();
        let dest = DestinationKeys::generate();
        let gateway = RouterKeys::generate().id();
        let now = now_ms();

        let v1 = dest.create_lease_set_at(
            vec![Lease { gateway, tunnel_id: 1, expires: now + 60_000 }],
            now - 5_000,
        );
        let v2 = dest.create_lease_set_at(
            vec![Lease { gateway, tunnel_id: 2, expires: now + 60_000 }],
            now - 1_000,
        );

        db.store_lease_set(v1.clone()).await.unwrap();
        db.store_lease_set(v2).await.unwrap();

        let found = db.lookup_lease_set(dest.id()).await.unwrap();
        assert_eq!(found.leases[0].tunnel_id, 2);

        let err = db.store_lease_set(v1).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn lease_set_with_no_live_lease_is_rejected() {
        let db = test_db();
        let dest = DestinationKeys::generate();
        let expired = dest.create_lease_set(vec![Lease {
            gateway: RouterKeys::generate().id(),
            tunnel_id: 1,
            expires: now_ms() - 1,
        }]);

        let err = db.store_lease_set(expired).await.unwrap_err();
        let StoreError::Rejected(reason) = err;
        assert!(reason.contains("expired"), "unexpected reason: {reason}");
        assert!(db.lookup_lease_set(dest.id()).await.is_none());
    }

    #[tokio::test]
    async fn wire_entry_store_and_lookup_roundtrip() {
        let db = test_db();
        let (_, info) = make_router("127.0.0.1:9001");
        let key = *info.id().as_bytes();

        db.store_entry(NetDbEntry::Router(info)).await.unwrap();

        match db.lookup_entry(key, LookupKind::Router).await {
            Some(NetDbEntry::Router(found)) => assert_eq!(*found.id().as_bytes(), key),
            other => panic!("expected router entry, got {:?}", other.is_some()),
        }
        assert!(db.lookup_entry(key, LookupKind::Lease).await.is_none());
    }

    #[tokio::test]
    async fn random_routers_skips_excluded_peers() {
        let db = test_db();
        let mut ids = Vec::new();
        for port in 9001..=9005u16 {
            let (_, info) = make_router(&format!("127.0.0.1:{port}"));
            ids.push(info.id());
            db.store_router_info(info).await.unwrap();
        }

        for _ in 0..10 {
            let sample = db.random_routers(GOSSIP_SAMPLE, &[ids[0]]).await;
            assert!(sample.len() <= GOSSIP_SAMPLE);
            assert!(!sample.is_empty());
            assert!(sample.iter().all(|info| info.id() != ids[0]));
        }
    }
}
