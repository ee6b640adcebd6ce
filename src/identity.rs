//! # Identity, Descriptors, and Leases
//!
//! This module defines the core identity types used throughout Allium:
//!
//! - [`RouterKeys`]: Ed25519 signing keypair + X25519 encryption keypair for a router
//! - [`RouterId`]: 32-byte BLAKE3 digest of the signing key, the router's unique identifier
//! - [`RouterInfo`]: Signed descriptor containing addresses, capabilities, and freshness data
//! - [`DestinationKeys`] / [`Destination`]: Application endpoint identity inside the overlay
//! - [`LeaseSet`]: Signed set of inbound-tunnel entry points for a destination
//!
//! ## Identity Model
//!
//! **RouterId = BLAKE3(Ed25519 public signing key)**. The transport layer derives
//! the same digest from the TLS certificate key, so a session is bound to the
//! RouterId without any external CA. The X25519 encryption key rides inside the
//! descriptor and is authenticated by the descriptor signature, not by TLS.
//!
//! ## Descriptor Records
//!
//! A [`RouterInfo`] is a signed record containing:
//! - The router's identity (both public keys)
//! - Network addresses (IP:port)
//! - Capability flags (transit relaying)
//! - Timestamp and signature for freshness verification
//!
//! Descriptors are stored in the NetDB under key = RouterId, allowing any
//! router to discover how to reach a given identity. A [`LeaseSet`] plays the
//! same role for destinations, except the entries are inbound-tunnel gateways
//! rather than socket addresses.
//!
//! ## Security Invariants
//!
//! - Identity round-trips bytes exactly (`from_bytes`/`as_bytes`)
//! - Only valid Ed25519 points are accepted as signing keys
//! - Descriptor signatures bind addresses and keys to the identity
//! - Timestamps prevent replay of stale descriptor records

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::{SignatureError, LEASE_SET_SIGNATURE_DOMAIN, ROUTER_INFO_SIGNATURE_DOMAIN};

// ============================================================================
// Network Provenance (IP-based locality detection)
// ============================================================================

/// Network provenance for hop-diversity decisions.
///
/// Extracts a coarse identifier representing the peer's network origin:
/// - **IPv4**: `/16` prefix (first two octets, ISP/regional level)
/// - **IPv6**: `/32` prefix (first two segments, similar scope)
///
/// Two candidate hops sharing a provenance value are assumed to sit in the
/// same operator's network, so the default selection policy refuses to place
/// both into one tunnel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Provenance(u16);

impl Provenance {
    /// Extract provenance from a socket address.
    #[inline]
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::from_ip(addr.ip())
    }

    /// Extract provenance from an IP address.
    #[inline]
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => {
                let octets = v4.octets();
                // /16: first two octets
                Self(((octets[0] as u16) << 8) | (octets[1] as u16))
            }
            IpAddr::V6(v6) => {
                // /32: first two segments (ISP-level granularity)
                let segs = v6.segments();
                Self(segs[0].wrapping_add(segs[1]))
            }
        }
    }

    /// Parse from "host:port" string format.
    ///
    /// Handles:
    /// - IPv4: "192.168.1.1:8080"
    /// - IPv6: "[::1]:8080"
    /// - Host only: "192.168.1.1"
    pub fn from_addr_str(addr: &str) -> Option<Self> {
        parse_host_ip(addr).map(Self::from_ip)
    }
}

/// Parse the host portion of a "host:port" (or bare host) string as an IP.
pub(crate) fn parse_host_ip(addr: &str) -> Option<IpAddr> {
    // Try parsing as SocketAddr first (most common case)
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        return Some(socket_addr.ip());
    }

    // Fall back to manual parsing for "host:port" or just "host"
    let host = if let Some(bracket_end) = addr.find(']') {
        // IPv6: [::1]:port
        &addr[1..bracket_end]
    } else if let Some(colon_pos) = addr.rfind(':') {
        // IPv4 or hostname:port - take part before last colon
        &addr[..colon_pos]
    } else {
        addr
    };

    host.parse::<IpAddr>().ok()
}

// ============================================================================
// Capability Flags
// ============================================================================

/// Router accepts transit tunnels built by other routers through it.
pub const CAP_TRANSIT: u8 = 0b0000_0001;

/// Router is directly reachable at its published addresses.
pub const CAP_REACHABLE: u8 = 0b0000_0010;

/// Returns current time as milliseconds since Unix epoch.
/// Used for timestamp generation in signed records and lease expiries.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// Router Keys
// ============================================================================

/// Full key material for a local router: Ed25519 signing keypair plus the
/// X25519 encryption keypair garlic payloads are addressed to.
#[derive(Clone)]
pub struct RouterKeys {
    signing_key: SigningKey,
    encryption_key: x25519_dalek::StaticSecret,
}

impl RouterKeys {
    /// Generate fresh key material from the OS RNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let encryption_key = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        Self {
            signing_key,
            encryption_key,
        }
    }

    /// Reconstruct keys from stored secret bytes.
    pub fn from_secret_bytes(signing: &[u8; 32], encryption: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(signing),
            encryption_key: x25519_dalek::StaticSecret::from(*encryption),
        }
    }

    pub fn signing_secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn encryption_secret_bytes(&self) -> [u8; 32] {
        self.encryption_key.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub(crate) fn encryption_secret(&self) -> &x25519_dalek::StaticSecret {
        &self.encryption_key
    }

    /// The public identity half of this key material.
    pub fn identity(&self) -> RouterIdentity {
        RouterIdentity {
            signing_key: self.signing_key.verifying_key().to_bytes(),
            encryption_key: x25519_dalek::PublicKey::from(&self.encryption_key).to_bytes(),
        }
    }

    #[inline]
    pub fn id(&self) -> RouterId {
        RouterId::from_key_bytes(&self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key
            .verifying_key()
            .verify(message, signature)
            .is_ok()
    }

    /// Create a signed descriptor for this router.
    ///
    /// The timestamp is set to now; publishing a descriptor again supersedes
    /// the previous one in any NetDB that accepts it.
    pub fn create_router_info(&self, addrs: Vec<String>, capabilities: u8) -> RouterInfo {
        let identity = self.identity();
        let published = now_ms();

        let payload = RouterInfo::build_signed_payload(&identity, &addrs, capabilities, published);
        let signature =
            crate::crypto::sign_with_domain(&self.signing_key, ROUTER_INFO_SIGNATURE_DOMAIN, &payload);

        RouterInfo {
            identity,
            addrs,
            capabilities,
            published,
            signature,
        }
    }
}

impl std::fmt::Debug for RouterKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterKeys")
            .field("id", &self.id().to_hex())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Router Identifier
// ============================================================================

/// 32-byte router identifier: BLAKE3 digest of the Ed25519 public signing key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RouterId([u8; 32]);

impl RouterId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the identifier from a public signing key.
    ///
    /// The transport layer applies the same derivation to the key inside a
    /// peer's TLS certificate, binding sessions to RouterIds.
    #[inline]
    pub fn from_key_bytes(public_key: &[u8; 32]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Short hex prefix for log lines.
    #[inline]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for RouterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RouterId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for RouterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for RouterId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<RouterId> for [u8; 32] {
    fn from(id: RouterId) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for RouterId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Router Identity and Descriptor
// ============================================================================

/// Public identity of a router: the signing key sessions are authenticated
/// against and the encryption key garlic messages are addressed to.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterIdentity {
    /// Ed25519 public signing key.
    pub signing_key: [u8; 32],
    /// X25519 public encryption key.
    pub encryption_key: [u8; 32],
}

impl RouterIdentity {
    #[inline]
    pub fn id(&self) -> RouterId {
        RouterId::from_key_bytes(&self.signing_key)
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, SignatureError> {
        VerifyingKey::try_from(self.signing_key.as_slice())
            .map_err(|_| SignatureError::InvalidKey)
    }

    #[inline]
    pub fn encryption_public(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(self.encryption_key)
    }

    /// Check that the signing key is a usable Ed25519 point.
    ///
    /// Rejects trivially invalid keys (all zeros, all 0xFF) before paying for
    /// point decompression.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.signing_key.iter().all(|&b| b == 0) {
            return false;
        }
        if self.signing_key.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.signing_key.as_slice()).is_ok()
    }
}

impl std::fmt::Debug for RouterIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RouterIdentity({})", &self.id().to_hex()[..16])
    }
}

/// Signed router descriptor: identity, reachable addresses, capabilities,
/// and a publication timestamp, all bound by an Ed25519 signature.
///
/// Descriptors are the unit of exchange in the NetDB. A newer valid
/// descriptor for the same identity replaces an older one; stale or
/// tampered descriptors are rejected at the store boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouterInfo {
    pub identity: RouterIdentity,
    pub addrs: Vec<String>,
    /// Capability bitfield, see [`CAP_TRANSIT`] and [`CAP_REACHABLE`].
    pub capabilities: u8,
    /// Timestamp when the descriptor was published (ms since epoch).
    pub published: u64,
    /// Ed25519 signature over the canonical payload.
    pub signature: Vec<u8>,
}

/// Reasons a signed record may fail freshness verification.
///
/// This structured error enables differentiated logging:
/// - Signature failures indicate tampering or corruption
/// - Clock skew failures may indicate infrastructure issues
/// - Stale records are normal expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessError {
    /// Cryptographic signature verification failed.
    SignatureInvalid,
    /// Record timestamp is too far in the future (clock skew detected).
    ClockSkewFuture {
        record_ts: u64,
        local_ts: u64,
        drift_ms: u64,
    },
    /// Record has expired (older than max_age).
    Stale {
        record_ts: u64,
        local_ts: u64,
        age_ms: u64,
    },
}

impl std::fmt::Display for FreshnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FreshnessError::SignatureInvalid => write!(f, "signature verification failed"),
            FreshnessError::ClockSkewFuture { drift_ms, .. } => {
                write!(f, "record timestamp {}ms in the future", drift_ms)
            }
            FreshnessError::Stale { age_ms, .. } => {
                write!(f, "record is {}ms old", age_ms)
            }
        }
    }
}

impl std::error::Error for FreshnessError {}

/// Clock drift allowance for future-dated records.
///
/// SECURITY: kept tight (5s) so an attacker manipulating their clock cannot
/// create records that remain fresh much longer than max_age. Routers with
/// more drift than this will see their descriptors rejected, which indicates
/// misconfiguration rather than a protocol problem.
const FUTURE_TOLERANCE_MS: u64 = 5_000;

impl RouterInfo {
    /// Get the primary address (first in the list).
    pub fn primary_addr(&self) -> Option<&str> {
        self.addrs.first().map(|s| s.as_str())
    }

    /// Resolve the primary address to a socket address, if it parses.
    pub fn primary_socket_addr(&self) -> Option<SocketAddr> {
        self.primary_addr().and_then(|a| a.parse().ok())
    }

    #[inline]
    pub fn id(&self) -> RouterId {
        self.identity.id()
    }

    #[inline]
    pub fn accepts_transit(&self) -> bool {
        self.capabilities & CAP_TRANSIT != 0
    }

    /// Network provenance of the primary address, for hop diversity.
    #[inline]
    pub(crate) fn provenance(&self) -> Option<Provenance> {
        self.primary_addr().and_then(Provenance::from_addr_str)
    }

    /// Verify the cryptographic signature of this descriptor.
    ///
    /// SECURITY: signature verification ensures addresses and the encryption
    /// key are bound to the signing identity. An attacker cannot forge a
    /// descriptor pointing a RouterId at their own address or key.
    pub fn verify(&self) -> Result<(), SignatureError> {
        if self.signature.is_empty() {
            return Err(SignatureError::Missing);
        }
        if self.published == 0 {
            return Err(SignatureError::Missing);
        }

        let payload = Self::build_signed_payload(
            &self.identity,
            &self.addrs,
            self.capabilities,
            self.published,
        );

        crate::crypto::verify_with_domain(
            &self.identity.signing_key,
            ROUTER_INFO_SIGNATURE_DOMAIN,
            &payload,
            &self.signature,
        )
    }

    /// Build the canonical payload for descriptor signatures.
    ///
    /// Format: signing_key(32) || encryption_key(32) || addr_count(4) ||
    /// [addr_len(4) || addr]* || capabilities(1) || published(8)
    #[doc(hidden)]
    pub fn build_signed_payload(
        identity: &RouterIdentity,
        addrs: &[String],
        capabilities: u8,
        published: u64,
    ) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&identity.signing_key);
        data.extend_from_slice(&identity.encryption_key);
        data.extend_from_slice(&(addrs.len() as u32).to_le_bytes());
        for addr in addrs {
            let addr_bytes = addr.as_bytes();
            data.extend_from_slice(&(addr_bytes.len() as u32).to_le_bytes());
            data.extend_from_slice(addr_bytes);
        }
        data.push(capabilities);
        data.extend_from_slice(&published.to_le_bytes());
        data
    }

    /// Verify the signature AND freshness of this descriptor.
    ///
    /// This is the verification path for descriptors arriving from the
    /// network. Rejects records that are:
    /// - Not cryptographically valid (via verify())
    /// - Older than max_age_secs (stale)
    /// - More than the clock-skew tolerance in the future
    pub fn verify_fresh(&self, max_age_secs: u64) -> Result<(), FreshnessError> {
        if self.verify().is_err() {
            return Err(FreshnessError::SignatureInvalid);
        }

        // published is already validated as non-zero by verify()
        let current_time = now_ms();
        let max_age_ms = max_age_secs * 1000;

        if self.published > current_time.saturating_add(FUTURE_TOLERANCE_MS) {
            let drift = self.published.saturating_sub(current_time);
            return Err(FreshnessError::ClockSkewFuture {
                record_ts: self.published,
                local_ts: current_time,
                drift_ms: drift,
            });
        }

        let age_ms = current_time.saturating_sub(self.published);
        if age_ms > max_age_ms {
            return Err(FreshnessError::Stale {
                record_ts: self.published,
                local_ts: current_time,
                age_ms,
            });
        }

        Ok(())
    }

    /// Validate the structural integrity of a descriptor.
    ///
    /// SECURITY: bounds and format only, NOT cryptographic validity. These
    /// limits prevent memory exhaustion when deserializing untrusted
    /// descriptors from the network. Always call `verify_fresh()` as well.
    pub fn validate_structure(&self) -> bool {
        const MAX_ADDRS: usize = 16;
        const MAX_ADDR_LEN: usize = 256;

        if self.addrs.len() > MAX_ADDRS {
            return false;
        }

        for addr in &self.addrs {
            if addr.len() > MAX_ADDR_LEN || addr.is_empty() {
                return false;
            }
        }

        if !self.signature.is_empty() && self.signature.len() != 64 {
            return false;
        }

        true
    }
}

impl PartialEq for RouterInfo {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity && self.published == other.published
    }
}

impl Eq for RouterInfo {}

// ============================================================================
// Destinations
// ============================================================================

/// 32-byte destination identifier: BLAKE3 digest of the destination's
/// public signing key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DestinationId([u8; 32]);

impl DestinationId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn from_key_bytes(public_key: &[u8; 32]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    #[inline]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for DestinationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DestinationId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for DestinationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Public identity of an application endpoint inside the overlay.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Destination {
    /// Ed25519 public signing key (signs the destination's lease sets).
    pub signing_key: [u8; 32],
    /// X25519 public encryption key (garlic messages are sealed to it).
    pub encryption_key: [u8; 32],
}

impl Destination {
    #[inline]
    pub fn id(&self) -> DestinationId {
        DestinationId::from_key_bytes(&self.signing_key)
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, SignatureError> {
        VerifyingKey::try_from(self.signing_key.as_slice())
            .map_err(|_| SignatureError::InvalidKey)
    }

    #[inline]
    pub fn encryption_public(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(self.encryption_key)
    }
}

/// Full key material for a locally-hosted destination.
#[derive(Clone)]
pub struct DestinationKeys {
    signing_key: SigningKey,
    encryption_key: x25519_dalek::StaticSecret,
}

impl DestinationKeys {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            encryption_key: x25519_dalek::StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_secret_bytes(signing: &[u8; 32], encryption: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(signing),
            encryption_key: x25519_dalek::StaticSecret::from(*encryption),
        }
    }

    pub fn destination(&self) -> Destination {
        Destination {
            signing_key: self.signing_key.verifying_key().to_bytes(),
            encryption_key: x25519_dalek::PublicKey::from(&self.encryption_key).to_bytes(),
        }
    }

    #[inline]
    pub fn id(&self) -> DestinationId {
        DestinationId::from_key_bytes(&self.signing_key.verifying_key().to_bytes())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub(crate) fn encryption_secret(&self) -> &x25519_dalek::StaticSecret {
        &self.encryption_key
    }

    /// Create a signed lease set for this destination.
    pub fn create_lease_set(&self, leases: Vec<Lease>) -> LeaseSet {
        self.create_lease_set_at(leases, now_ms())
    }

    /// Create a signed lease set with an explicit publication stamp.
    ///
    /// Remote databases replace a stored set only when the stamp is strictly
    /// newer, so callers that republish in quick succession must pass a
    /// bumped stamp instead of relying on wall-clock resolution.
    pub(crate) fn create_lease_set_at(&self, leases: Vec<Lease>, published: u64) -> LeaseSet {
        let destination = self.destination();

        let payload = LeaseSet::build_signed_payload(&destination, &leases, published);
        let signature =
            crate::crypto::sign_with_domain(&self.signing_key, LEASE_SET_SIGNATURE_DOMAIN, &payload);

        LeaseSet {
            destination,
            leases,
            published,
            signature,
        }
    }
}

impl std::fmt::Debug for DestinationKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationKeys")
            .field("id", &self.id().to_hex())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Leases
// ============================================================================

/// One inbound-tunnel entry point for a destination: deliver to `tunnel_id`
/// at the `gateway` router before `expires`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub gateway: RouterId,
    pub tunnel_id: u64,
    /// Expiry timestamp (ms since epoch). The lease is unusable afterwards.
    pub expires: u64,
}

impl Lease {
    #[inline]
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires <= now
    }
}

/// Signed set of inbound-tunnel gateways for a destination.
///
/// Published to the NetDB whenever the destination's inbound tunnel set
/// changes. Invalid once every lease has expired.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseSet {
    pub destination: Destination,
    pub leases: Vec<Lease>,
    /// Timestamp when the lease set was published (ms since epoch).
    pub published: u64,
    /// Ed25519 signature by the destination's signing key.
    pub signature: Vec<u8>,
}

impl LeaseSet {
    #[inline]
    pub fn id(&self) -> DestinationId {
        self.destination.id()
    }

    /// Leases still usable at `now`, freshest first.
    pub fn live_leases(&self, now: u64) -> Vec<Lease> {
        let mut live: Vec<Lease> = self
            .leases
            .iter()
            .copied()
            .filter(|l| !l.is_expired_at(now))
            .collect();
        live.sort_by(|a, b| b.expires.cmp(&a.expires));
        live
    }

    /// A lease set with no live leases is invalid and eligible for purge.
    #[inline]
    pub fn has_live_lease(&self, now: u64) -> bool {
        self.leases.iter().any(|l| !l.is_expired_at(now))
    }

    /// Verify the destination signature over the canonical payload.
    pub fn verify(&self) -> Result<(), SignatureError> {
        if self.signature.is_empty() {
            return Err(SignatureError::Missing);
        }
        if self.published == 0 {
            return Err(SignatureError::Missing);
        }

        let payload = Self::build_signed_payload(&self.destination, &self.leases, self.published);

        crate::crypto::verify_with_domain(
            &self.destination.signing_key,
            LEASE_SET_SIGNATURE_DOMAIN,
            &payload,
            &self.signature,
        )
    }

    /// Build the canonical payload for lease set signatures.
    ///
    /// Format: signing_key(32) || encryption_key(32) || lease_count(4) ||
    /// [gateway(32) || tunnel_id(8) || expires(8)]* || published(8)
    #[doc(hidden)]
    pub fn build_signed_payload(
        destination: &Destination,
        leases: &[Lease],
        published: u64,
    ) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&destination.signing_key);
        data.extend_from_slice(&destination.encryption_key);
        data.extend_from_slice(&(leases.len() as u32).to_le_bytes());
        for lease in leases {
            data.extend_from_slice(lease.gateway.as_bytes());
            data.extend_from_slice(&lease.tunnel_id.to_le_bytes());
            data.extend_from_slice(&lease.expires.to_le_bytes());
        }
        data.extend_from_slice(&published.to_le_bytes());
        data
    }

    /// Structural bounds for untrusted lease sets.
    pub fn validate_structure(&self) -> bool {
        const MAX_LEASES: usize = 16;

        if self.leases.len() > MAX_LEASES {
            return false;
        }
        if !self.signature.is_empty() && self.signature.len() != 64 {
            return false;
        }
        true
    }
}

/// Generate a fresh random tunnel identifier.
///
/// 64-bit random ids make collisions across a router's transit table
/// negligible without a reservation protocol.
#[inline]
pub(crate) fn new_tunnel_id() -> u64 {
    let mut rng = OsRng;
    loop {
        let id = rng.next_u64();
        if id != 0 {
            return id;
        }
    }
}
