//! # Garlic Layering and the Message Switch
//!
//! Two concerns live here:
//!
//! - **Layered byte transforms**: the recursive encryption wrapping tunnel
//!   traffic. An outbound payload is sealed outward-in, once per hop, so each
//!   hop removes exactly its own layer; an inbound payload gains one layer
//!   per hop and the tunnel owner peels them all. The transforms are explicit
//!   buffer operations over [`crate::crypto::seal_layer`] /
//!   [`crate::crypto::open_layer`].
//! - **The message switch**: the single consumer of the transport's inbound
//!   queue. It routes each decoded [`RouterMessage`] to the NetDB or the
//!   tunnel engine and answers database lookups in place.
//!
//! End-to-end garlic messages are sealed boxes addressed to a destination's
//! X25519 key, carrying a random message id checked against a bounded
//! [`ReplayWindow`] before any clove is delivered.

use std::num::NonZeroUsize;

use lru::LruCache;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::crypto::{
    open_layer, open_with_key, seal_layer, seal_to_key, CryptoError, LayerKey, GARLIC_INFO,
    TUNNEL_DATA_CONTEXT,
};
use crate::identity::RouterId;
use crate::messages::{GarlicCleartext, RouterMessage};
use crate::netdb::NetDb;
use crate::transport::Transport;
use crate::tunnel::TunnelEngine;

/// Garlic message ids remembered for replay suppression.
pub const REPLAY_WINDOW: usize = 4096;

// ============================================================================
// Layered Transforms
// ============================================================================

/// Wrap an outbound payload in one layer per hop, outward-in.
///
/// `keys` is in path order: `keys[0]` belongs to the first hop, which peels
/// the outermost layer. All layers of one message share the tunnel's message
/// counter; key separation keeps the (key, nonce) pairs distinct.
pub fn wrap_out_layers(keys: &[LayerKey], counter: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = payload.to_vec();
    for key in keys.iter().rev() {
        buf = seal_layer(key, counter, TUNNEL_DATA_CONTEXT, &buf);
    }
    buf
}

/// Peel all inbound layers at the tunnel owner.
///
/// `keys` is in path order starting at the gateway. The gateway sealed first,
/// every later hop sealed on top, so the owner opens in reverse path order.
pub fn peel_in_layers(
    keys: &[LayerKey],
    counter: u64,
    payload: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut buf = payload.to_vec();
    for key in keys.iter().rev() {
        buf = open_layer(key, counter, TUNNEL_DATA_CONTEXT, &buf)?;
    }
    Ok(buf)
}

// ============================================================================
// End-to-End Garlic
// ============================================================================

/// Fresh random garlic message id for the replay window.
#[inline]
pub fn new_message_id() -> u64 {
    OsRng.next_u64()
}

/// Seal a garlic cleartext to a destination's (or router's) encryption key.
pub fn seal_garlic(
    recipient: &x25519_dalek::PublicKey,
    cleartext: &GarlicCleartext,
) -> Vec<u8> {
    seal_to_key(recipient, &cleartext.encode(), GARLIC_INFO)
}

/// Open a garlic blob with the recipient's encryption secret.
///
/// Undecodable cleartext after a successful AEAD open is treated as
/// malformed rather than a key mismatch.
pub fn open_garlic(
    secret: &x25519_dalek::StaticSecret,
    blob: &[u8],
) -> Result<GarlicCleartext, CryptoError> {
    let cleartext = open_with_key(secret, blob, GARLIC_INFO)?;
    GarlicCleartext::decode(&cleartext).map_err(|_| CryptoError::Malformed)
}

/// Bounded set of recently seen garlic message ids.
///
/// A repeated id within the window marks a replayed (or duplicated) message;
/// the caller drops it before any clove is delivered. The window is an LRU,
/// so ids eventually age out and very old replays are instead caught by the
/// sealed box being addressed to rotated tunnels.
pub struct ReplayWindow {
    seen: LruCache<u64, ()>,
}

impl ReplayWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("window capacity is nonzero"),
            ),
        }
    }

    /// Register an id. Returns `true` when it is fresh, `false` on replay.
    pub fn register(&mut self, msg_id: u64) -> bool {
        if self.seen.contains(&msg_id) {
            // Touch so a replaying sender cannot age its own id out
            self.seen.get(&msg_id);
            return false;
        }
        self.seen.put(msg_id, ());
        true
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(REPLAY_WINDOW)
    }
}

// ============================================================================
// Message Switch
// ============================================================================

/// Owns the transport's inbound queue and fans messages out to their
/// subsystem. Database lookups are answered in place; everything else is a
/// bounded hand-off, so a slow subsystem backpressures the network instead
/// of buffering without limit.
pub struct MessageSwitch {
    transport: Transport,
    netdb: NetDb,
    engine: TunnelEngine,
}

impl MessageSwitch {
    /// Claim the inbound queue and start the dispatch loop.
    ///
    /// Returns `None` when another switch already claimed the queue.
    pub async fn spawn(
        transport: Transport,
        netdb: NetDb,
        engine: TunnelEngine,
    ) -> Option<JoinHandle<()>> {
        let inbound = transport.take_inbound().await?;
        let switch = Self {
            transport,
            netdb,
            engine,
        };
        Some(tokio::spawn(switch.run(inbound)))
    }

    async fn run(self, mut inbound: mpsc::Receiver<(RouterId, RouterMessage)>) {
        while let Some((from, message)) = inbound.recv().await {
            trace!(peer = %from.short(), kind = message.kind(), "switching message");
            match message {
                RouterMessage::DatabaseStore { entry } => {
                    if let Err(err) = self.netdb.store_entry(entry).await {
                        debug!(peer = %from.short(), error = %err, "gossiped entry rejected");
                    }
                }
                RouterMessage::DatabaseLookup { key, kind } => {
                    let entry = self.netdb.lookup_entry(key, kind).await;
                    let reply = RouterMessage::DatabaseReply { key, entry };
                    if let Err(err) = self.transport.send(from, &reply).await {
                        debug!(peer = %from.short(), error = %err, "could not answer lookup");
                    }
                }
                RouterMessage::DatabaseReply { key, entry } => {
                    self.engine.database_reply(key, entry).await;
                }
                RouterMessage::TunnelBuild { build_id, blob } => {
                    self.engine.build_request(from, build_id, blob).await;
                }
                RouterMessage::TunnelBuildReply { build_id, blob } => {
                    self.engine.build_reply(from, build_id, blob).await;
                }
                RouterMessage::TunnelData {
                    tunnel_id,
                    counter,
                    payload,
                } => {
                    self.engine
                        .tunnel_data(from, tunnel_id, counter, payload)
                        .await;
                }
                RouterMessage::Garlic { blob } => {
                    self.engine.garlic(blob).await;
                }
            }
        }
        warn!("message switch stopped: inbound queue closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_layer_key;
    use crate::messages::{Clove, StreamFrame};

    fn path_keys(n: usize) -> Vec<LayerKey> {
        (0..n).map(|_| random_layer_key()).collect()
    }

    #[test]
    fn wrap_peel_roundtrip_across_hop_counts() {
        for hops in 1..=4 {
            let keys = path_keys(hops);
            let payload = b"tunnel cell bytes".to_vec();

            let mut wrapped = wrap_out_layers(&keys, 5, &payload);
            assert!(wrapped.len() > payload.len());

            // Each hop in path order removes exactly one layer
            for key in &keys {
                wrapped = open_layer(key, 5, TUNNEL_DATA_CONTEXT, &wrapped)
                    .expect("hop must be able to peel its own layer");
            }
            assert_eq!(wrapped, payload, "hops={hops}");
        }
    }

    #[test]
    fn inbound_layers_peel_at_owner() {
        for hops in 1..=4 {
            let keys = path_keys(hops);
            let payload = b"reply bytes".to_vec();

            // Gateway seals first, later hops seal on top, same counter
            let mut buf = payload.clone();
            for key in &keys {
                buf = seal_layer(key, 9, TUNNEL_DATA_CONTEXT, &buf);
            }

            let peeled = peel_in_layers(&keys, 9, &buf).expect("owner peels all layers");
            assert_eq!(peeled, payload, "hops={hops}");
        }
    }

    #[test]
    fn middle_hop_cannot_peel_more_than_its_layer() {
        let keys = path_keys(3);
        let wrapped = wrap_out_layers(&keys, 0, b"secret");

        // First hop peels its layer, then tries the wrong key next
        let after_first = open_layer(&keys[0], 0, TUNNEL_DATA_CONTEXT, &wrapped).unwrap();
        assert_eq!(
            open_layer(&keys[2], 0, TUNNEL_DATA_CONTEXT, &after_first),
            Err(CryptoError::DecryptFailed)
        );
        // And the payload is still not visible
        assert_ne!(after_first, b"secret");
    }

    #[test]
    fn tampered_layer_is_rejected() {
        let keys = path_keys(2);
        let mut wrapped = wrap_out_layers(&keys, 3, b"payload");
        let mid = wrapped.len() / 2;
        wrapped[mid] ^= 1;

        assert_eq!(
            open_layer(&keys[0], 3, TUNNEL_DATA_CONTEXT, &wrapped),
            Err(CryptoError::DecryptFailed)
        );
    }

    #[test]
    fn wrong_counter_fails_every_layer() {
        let keys = path_keys(2);
        let wrapped = wrap_out_layers(&keys, 3, b"payload");
        assert_eq!(
            open_layer(&keys[0], 4, TUNNEL_DATA_CONTEXT, &wrapped),
            Err(CryptoError::DecryptFailed)
        );
        assert!(peel_in_layers(&keys, 4, &wrapped).is_err());
    }

    #[test]
    fn garlic_seal_open_roundtrip() {
        let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);

        let cleartext = GarlicCleartext {
            msg_id: new_message_id(),
            cloves: vec![Clove::Stream {
                frame: StreamFrame::Data {
                    stream_id: 1,
                    seq: 0,
                    payload: b"hello".to_vec(),
                },
            }],
        };

        let blob = seal_garlic(&public, &cleartext);
        let opened = open_garlic(&secret, &blob).expect("recipient opens its garlic");
        assert_eq!(opened.msg_id, cleartext.msg_id);
        assert_eq!(opened.cloves.len(), 1);

        let other = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        assert!(open_garlic(&other, &blob).is_err());
    }

    #[test]
    fn replay_window_drops_repeats() {
        let mut window = ReplayWindow::new(8);

        assert!(window.register(42));
        assert!(!window.register(42), "immediate replay must be caught");
        assert!(window.register(43));
        assert!(!window.register(42), "replay within the window must be caught");
    }

    #[test]
    fn replay_window_ages_out_old_ids() {
        let mut window = ReplayWindow::new(4);
        for id in 0..4u64 {
            assert!(window.register(id));
        }
        // Four fresh ids evict the oldest
        for id in 10..14u64 {
            assert!(window.register(id));
        }
        assert!(window.register(0), "evicted id is fresh again");
    }

    #[test]
    fn message_ids_are_random() {
        let a = new_message_id();
        let b = new_message_id();
        assert_ne!(a, b);
    }
}
