//! # Wire Protocol Messages
//!
//! This module defines all serializable message types exchanged between
//! routers. Messages are serialized using bincode with size limits to prevent
//! memory exhaustion.
//!
//! ## Message Kinds
//!
//! | Kind | Carries | Routed by |
//! |------|---------|-----------|
//! | `TunnelBuild` / `TunnelBuildReply` | nested build records, layered votes | tunnel engine |
//! | `TunnelData` | one layered tunnel cell | transit table |
//! | `Garlic` | sealed end-to-end payload | garlic router |
//! | `DatabaseStore` / `DatabaseLookup` / `DatabaseReply` | descriptors, lease sets | NetDB |
//!
//! Messages carry no sender field; the sender is always the TLS-verified
//! identity of the session they arrived on. Payloads that need their own
//! authentication (descriptors, lease sets) are individually signed.
//!
//! ## Security Limits
//!
//! - `MAX_MESSAGE_SIZE`: maximum encoded frame (64 KiB)
//! - `MAX_DESERIALIZE_SIZE`: maximum deserialization buffer (prevents OOM)
//! - All deserialization uses `deserialize_bounded()` with size limits

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::{Destination, LeaseSet, RouterId, RouterInfo};

/// Maximum size of one encoded wire message (64 KiB).
/// Larger application payloads are chunked into stream frames below this.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum buffer size for deserialization.
/// Set slightly larger than MAX_MESSAGE_SIZE to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_MESSAGE_SIZE as u64) + 4096;

/// Maximum number of records in one tunnel build chain.
pub const MAX_BUILD_RECORDS: usize = 8;

/// Maximum application bytes carried by a single stream frame.
pub const MAX_STREAM_FRAME: usize = 16 * 1024;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn encode_message(message: &RouterMessage) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(message)
}

pub fn decode_message(data: &[u8]) -> Result<RouterMessage, bincode::Error> {
    bincode_options().deserialize(data)
}

// ============================================================================
// Router Messages
// ============================================================================

/// Everything that travels between two routers over an established session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RouterMessage {
    /// Tunnel build request: a chain of sealed hop records. Each hop opens
    /// the outer box, installs its record, and forwards the inner blob.
    TunnelBuild { build_id: u64, blob: Vec<u8> },
    /// Chained build reply travelling back along the request path. Each hop
    /// wraps the blob with its own layer key before passing it on.
    TunnelBuildReply { build_id: u64, blob: Vec<u8> },
    /// One layered tunnel cell addressed to a receive tunnel id at the
    /// recipient. The counter feeds the per-layer AEAD nonce.
    TunnelData {
        tunnel_id: u64,
        counter: u64,
        payload: Vec<u8>,
    },
    /// Sealed end-to-end payload for a destination or router hosted here.
    Garlic { blob: Vec<u8> },
    /// Unsolicited descriptor or lease set. Applied through the validating
    /// NetDB store path; invalid entries are dropped and logged.
    DatabaseStore { entry: NetDbEntry },
    /// Direct lookup by identifier.
    DatabaseLookup { key: [u8; 32], kind: LookupKind },
    /// Answer to a lookup on the same session.
    DatabaseReply {
        key: [u8; 32],
        entry: Option<NetDbEntry>,
    },
}

impl RouterMessage {
    /// Short kind tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            RouterMessage::TunnelBuild { .. } => "tunnel_build",
            RouterMessage::TunnelBuildReply { .. } => "tunnel_build_reply",
            RouterMessage::TunnelData { .. } => "tunnel_data",
            RouterMessage::Garlic { .. } => "garlic",
            RouterMessage::DatabaseStore { .. } => "database_store",
            RouterMessage::DatabaseLookup { .. } => "database_lookup",
            RouterMessage::DatabaseReply { .. } => "database_reply",
        }
    }
}

/// A NetDB entry on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NetDbEntry {
    Router(RouterInfo),
    Lease(LeaseSet),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupKind {
    Router,
    Lease,
}

// ============================================================================
// Tunnel Build Records
// ============================================================================

/// What a hop does with tunnel cells passing through it.
///
/// A hop learns its role, its predecessor (the session the build arrived on),
/// and its successor. It never sees the rest of the path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopRole {
    /// Outbound middle: remove one layer, forward to the next hop.
    Intermediate,
    /// Final outbound hop: remove the last layer and execute the cell's
    /// delivery instruction.
    OutboundEndpoint,
    /// Entry point of an inbound tunnel: assign the message counter, add the
    /// first layer, forward.
    InboundGateway,
    /// Inbound middle: add one layer, forward with the counter unchanged.
    InboundHop,
}

/// Plaintext of one hop's build record, sealed to that hop's encryption key.
///
/// `next_blob` carries the remaining chain (sealed to the next hop), making
/// the build request a recursive structure: the originator builds it from the
/// last hop outward, each hop peels exactly one box travelling inward.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Tunnel id this hop will receive cells on.
    pub receive_tunnel_id: u64,
    /// Symmetric key for this hop's layer. Lives exactly as long as the tunnel.
    pub layer_key: [u8; 32],
    pub role: HopRole,
    /// Successor router, None for the outbound endpoint.
    pub next_hop: Option<RouterId>,
    /// Receive tunnel id at the successor (the originator's terminus id for
    /// the last inbound hop).
    pub next_tunnel_id: u64,
    /// Descriptor of the successor, so a hop can dial it without a prior
    /// NetDB entry. Applied through the validating store path.
    pub next_info: Option<RouterInfo>,
    /// Tunnel expiry (ms since epoch). Transit state is dropped afterwards.
    pub expires: u64,
    /// Remaining chain, sealed to `next_hop`. Empty for the last record.
    pub next_blob: Vec<u8>,
}

/// One hop's vote in the chained build reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildVote {
    Accept,
    Reject(RejectReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Transit table full or bandwidth exhausted.
    Capacity,
    /// Local policy refuses transit participation.
    Policy,
    /// Record was malformed or expired on arrival.
    Invalid,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Capacity => write!(f, "capacity"),
            RejectReason::Policy => write!(f, "policy"),
            RejectReason::Invalid => write!(f, "invalid"),
        }
    }
}

/// Reply layer a hop produces: its own vote plus the (already encrypted)
/// reply of its successor. The originator peels these inward-out, one layer
/// key per hop, collecting votes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildReplyLayer {
    pub vote: BuildVote,
    /// Successor's encrypted reply; empty for the last hop in the chain and
    /// for hops that reject without forwarding.
    pub inner: Vec<u8>,
}

// ============================================================================
// Tunnel Cells
// ============================================================================

/// Where the outbound endpoint sends the decrypted cell content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delivery {
    /// Decode the content as a RouterMessage and hand it to this router.
    Router { to: RouterId },
    /// Inject the content into an inbound tunnel at `to`.
    Tunnel { to: RouterId, tunnel_id: u64 },
}

/// Innermost plaintext of an outbound tunnel: a delivery instruction and the
/// bytes to deliver. Only the outbound endpoint ever sees it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunnelCell {
    pub delivery: Delivery,
    pub message: Vec<u8>,
}

impl TunnelCell {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("tunnel cell serialization cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        deserialize_bounded(bytes)
    }
}

// ============================================================================
// Garlic Cleartext
// ============================================================================

/// Decrypted content of a garlic message: a replay-checked identifier and a
/// bundle of cloves.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GarlicCleartext {
    /// Random message identifier tracked by the replay window.
    pub msg_id: u64,
    pub cloves: Vec<Clove>,
}

impl GarlicCleartext {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("garlic cleartext serialization cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        deserialize_bounded(bytes)
    }
}

/// One bundled instruction inside a garlic message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Clove {
    /// Stream traffic for the destination that decrypted the message.
    Stream { frame: StreamFrame },
    /// The sender's lease set, bundled so the recipient can reply without a
    /// NetDB round trip.
    SenderLeases(LeaseSet),
}

/// Minimal stream framing between two destinations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StreamFrame {
    /// Open a stream. Signed by the initiating destination so a forged
    /// `from` cannot hijack reply routing.
    Open {
        stream_id: u64,
        from: Destination,
        /// Ed25519 signature over (stream_id || from || to destination id).
        signature: Vec<u8>,
    },
    Data {
        stream_id: u64,
        seq: u64,
        payload: Vec<u8>,
    },
    Close {
        stream_id: u64,
    },
}

impl StreamFrame {
    pub fn stream_id(&self) -> u64 {
        match self {
            StreamFrame::Open { stream_id, .. } => *stream_id,
            StreamFrame::Data { stream_id, .. } => *stream_id,
            StreamFrame::Close { stream_id } => *stream_id,
        }
    }
}
