//! # Allium - Anonymizing Overlay Router
//!
//! Allium is a garlic-routing overlay router: traffic between destinations
//! travels through unidirectional multi-hop tunnels, encrypted once per hop,
//! so no single router sees both endpoints. The stack:
//!
//! - **Identity**: Ed25519 router identities with X25519 encryption keys;
//!   signed, expiring descriptors and lease sets
//! - **NetDB**: validating in-memory store of descriptors and lease sets,
//!   with pluggable hop-selection policies
//! - **Transport**: QUIC sessions with identity-bound TLS certificates and
//!   descriptor gossip on handshake
//! - **Tunnels**: layered build protocol, per-destination pools with rolling
//!   replacement, transit participation for other routers
//! - **Garlic**: end-to-end encrypted bundles with replay suppression
//! - **Proxies**: local HTTP CONNECT and SOCKS5 entry points
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** for safe concurrent state:
//! - Each component (NetDB, Transport, Tunnel Engine) has a public Handle
//!   and a private Actor
//! - Handles are cheap to clone and communicate via async channels
//! - Actors own all mutable state and process commands sequentially
//!
//! ## Security Model
//!
//! - All router connections use mutual TLS with Ed25519 certificates;
//!   identity = BLAKE3 of the public signing key
//! - Descriptors and lease sets are individually signed and expire
//! - Each tunnel hop learns only its predecessor and successor
//! - Replay windows, rate limits, and bounded tables cap resource use
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `router` | High-level facade: start/stop, status, the embedder API |
//! | `identity` | Keys, router/destination identities, descriptors, leases |
//! | `crypto` | TLS certificates, domain-separated signatures, layer AEAD |
//! | `netdb` | Validated descriptor/lease-set store and hop selection |
//! | `transport` | QUIC sessions, framing, gossip, bandwidth accounting |
//! | `tunnel` | Tunnel engine: pools, builds, transit, stream dispatch |
//! | `garlic` | Layered transforms, garlic sealing, the message switch |
//! | `proxy` | Stream gateway plus HTTP and SOCKS5 proxies |
//! | `messages` | Serialization types for all wire protocols |
//! | `config` | `key = value` configuration with typed accessors |

pub mod config;
pub mod crypto;
pub mod garlic;
pub mod identity;
pub mod messages;
pub mod netdb;
pub mod proxy;
pub mod router;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use identity::{Destination, DestinationId, RouterId, RouterKeys};
pub use router::{
    BandwidthReport, LifecycleError, LogBuffer, NetworkStatus, Router, RouterReport, RouterStatus,
};
pub use tunnel::{BuildError, DestinationHandle, StreamSendError, TunnelCounts};
