//! # Cryptographic Infrastructure
//!
//! This module provides cryptographic primitives for Allium:
//!
//! - **Signatures**: Domain-separated Ed25519 signing and verification
//! - **TLS**: Certificate generation and verification for mutual transport auth
//! - **Layer Crypto**: ChaCha20-Poly1305 transforms for tunnel layers and
//!   X25519 sealed boxes for build records and garlic payloads
//!
//! ## Identity Model
//!
//! - **RouterId = BLAKE3(public signing key)**: derived identically from the
//!   key inside a peer's TLS certificate and from a descriptor's identity
//! - **Self-Signed Certs**: each router generates its own certificate from its
//!   signing keypair
//! - **Mutual Auth**: both dialer and listener verify each other's certificates
//!
//! ## Security Properties
//!
//! - No PKI/CA required - trust is the binding between certificate key and RouterId
//! - ALPN protocol "allium/1" prevents cross-protocol connections
//! - Only Ed25519 signatures are accepted (no RSA, ECDSA fallback)
//! - Domain separation prevents cross-protocol signature replay
//! - Layer keys are single-tunnel: they are generated at build time and die
//!   with the tunnel
//!
//! ## SECURITY WARNING
//!
//! The `dangerous()` APIs are used intentionally - we implement our own
//! certificate verification that binds identity to public key, not to
//! traditional CA-signed certificate chains.

use std::sync::Arc;

use anyhow::{Context, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use quinn::ClientConfig;
use rand::rngs::OsRng;
use rand::RngCore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::Sha256;

use crate::identity::{RouterId, RouterKeys};

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature verification failures.
/// Used across all Allium signature verification (RouterInfo, LeaseSet, etc.).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Error type for symmetric decryption and sealed-box failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// Ciphertext is too short or otherwise malformed.
    Malformed,
    /// AEAD tag verification failed.
    DecryptFailed,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::Malformed => write!(f, "ciphertext is malformed"),
            CryptoError::DecryptFailed => write!(f, "decryption failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================
//
// SECURITY: Domain separation prevents cross-protocol signature replay attacks.
// Each signed data type in Allium uses a unique prefix to ensure signatures
// cannot be reused in a different context.

/// Domain separation prefix for router descriptor signatures.
pub const ROUTER_INFO_SIGNATURE_DOMAIN: &[u8] = b"allium-router-info-v1:";

/// Domain separation prefix for lease set signatures.
pub const LEASE_SET_SIGNATURE_DOMAIN: &[u8] = b"allium-lease-set-v1:";

/// Domain separation prefix for stream-open signatures.
pub const STREAM_SIGNATURE_DOMAIN: &[u8] = b"allium-stream-v1:";

/// HKDF info string for tunnel-build record sealed boxes.
pub const BUILD_RECORD_INFO: &[u8] = b"allium-build-record-v1";

/// HKDF info string for end-to-end garlic sealed boxes.
pub const GARLIC_INFO: &[u8] = b"allium-garlic-v1";

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

/// Sign data with domain separation.
///
/// Prepends the domain prefix to the data before signing, preventing
/// cross-protocol signature replay attacks.
///
/// # Arguments
/// * `key` - The signing key (router or destination)
/// * `domain` - Domain separation prefix (e.g., `ROUTER_INFO_SIGNATURE_DOMAIN`)
/// * `data` - The data to sign
///
/// # Returns
/// 64-byte Ed25519 signature as a Vec<u8>
pub fn sign_with_domain(key: &SigningKey, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    key.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a signature with domain separation.
///
/// Reconstructs the prefixed data and verifies the Ed25519 signature.
///
/// # Arguments
/// * `public_key` - The claimed signer's Ed25519 public key bytes
/// * `domain` - Domain separation prefix (must match what was used during signing)
/// * `data` - The original data that was signed
/// * `signature` - The 64-byte Ed25519 signature
///
/// # Returns
/// `Ok(())` if signature is valid, `Err(SignatureError)` otherwise
pub fn verify_with_domain(
    public_key: &[u8; 32],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> std::result::Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key = VerifyingKey::try_from(public_key.as_slice())
        .map_err(|_| SignatureError::InvalidKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Transport TLS (identity-bound certificates)
// ============================================================================

/// Lazily-initialized crypto provider for rustls.
/// Uses ring as the underlying cryptographic implementation.
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier. All Allium connections use this to prevent
/// accidental cross-protocol connections.
pub const ALPN: &[u8] = b"allium/1";

/// SNI name used when dialing a bootstrap address whose RouterId is not yet
/// known. The verifier skips identity pinning for this name; the dialer is
/// expected to read the peer's RouterId out of the verified certificate
/// after the handshake.
pub const BOOTSTRAP_SNI: &str = "allium";

pub fn generate_ed25519_cert(
    keys: &RouterKeys,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let secret_key = keys.signing_secret_bytes();
    let public_key = keys.verifying_key().to_bytes();

    // Hand-assembled PKCS#8 v1 wrapper for the raw Ed25519 seed:
    // SEQUENCE { version 0, SEQUENCE { OID 1.3.101.112 }, OCTET STRING { OCTET STRING seed } }
    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];

    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&PKCS8_VERSION);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(&secret_key);

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to create Ed25519 key pair for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec![BOOTSTRAP_SNI.to_string()])
        .context("failed to create certificate params")?;

    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(hex::encode(public_key)),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate self-signed Ed25519 certificate")?;

    let key = PrivateKeyDer::Pkcs8(pkcs8.into());
    let cert_der = CertificateDer::from(cert.der().to_vec());

    Ok((vec![cert_der], key))
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let client_cert_verifier = Arc::new(Ed25519ClientCertVerifier);
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS 1.3")?
        .with_client_cert_verifier(client_cert_verifier)
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));

    server_config.migration(true);

    let transport_config = Arc::get_mut(&mut server_config.transport)
        .expect("transport config should be exclusively owned immediately after creation");
    transport_config.max_idle_timeout(Some(
        std::time::Duration::from_secs(60)
            .try_into()
            .expect("60 seconds is a valid VarInt duration"),
    ));
    transport_config.max_concurrent_bidi_streams(64u32.into());
    transport_config.max_concurrent_uni_streams(64u32.into());

    Ok(server_config)
}

pub fn create_client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig> {
    let verifier = Ed25519CertVerifier::new();

    let client_crypto = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS 1.3")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(certs, key)
        .context("failed to create client TLS config with client auth")?;

    let mut client_crypto_with_alpn = client_crypto;
    client_crypto_with_alpn.alpn_protocols = vec![ALPN.to_vec()];

    let client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto_with_alpn)
            .context("failed to create QUIC client config")?,
    ));

    Ok(client_config)
}

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;

    let spki = cert.public_key();
    let key_bytes = &spki.subject_public_key.data;

    if key_bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(key_bytes);
        Some(key)
    } else {
        None
    }
}

/// Derive the authenticated RouterId of the remote end of a connection.
///
/// The TLS layer has already verified possession of the certificate key, so
/// hashing that key yields an identity the peer provably controls.
pub fn extract_verified_router_id(connection: &quinn::Connection) -> Option<RouterId> {
    let peer_identity = connection.peer_identity()?;
    let certs: &Vec<rustls::pki_types::CertificateDer> = peer_identity.downcast_ref()?;
    let cert_der = certs.first()?.as_ref();
    let public_key = extract_public_key_from_cert(cert_der)?;
    // Reject certificate keys that are not usable Ed25519 points
    VerifyingKey::try_from(public_key.as_slice()).ok()?;
    Some(RouterId::from_key_bytes(&public_key))
}

#[derive(Debug)]
struct Ed25519ClientCertVerifier;

impl rustls::server::danger::ClientCertVerifier for Ed25519ClientCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        let public_key = extract_public_key_from_cert(end_entity.as_ref())
            .ok_or(rustls::Error::InvalidCertificate(
                rustls::CertificateError::BadEncoding,
            ))?;

        if VerifyingKey::try_from(public_key.as_slice()).is_err() {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }

        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// Encode a RouterId as the SNI hostname of an outbound dial.
///
/// 64 hex chars exceed the 63-char DNS label limit, so the digest is split
/// across two labels. The server never resolves this name; it only carries
/// the dialer's expectation into the certificate verifier.
pub(crate) fn router_id_to_sni(id: &RouterId) -> String {
    let hex = hex::encode(id.as_bytes());
    format!("{}.{}", &hex[..32], &hex[32..])
}

fn parse_router_id_from_sni(sni: &str) -> Option<RouterId> {
    let hex_str: String = sni.split('.').collect();
    let bytes = hex::decode(&hex_str).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Some(RouterId::from_bytes(arr))
}

#[derive(Debug)]
struct Ed25519CertVerifier;

impl Ed25519CertVerifier {
    fn new() -> Self {
        Self
    }
}

impl rustls::client::danger::ServerCertVerifier for Ed25519CertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let expected_id_sni = match server_name {
            rustls::pki_types::ServerName::DnsName(name) => name.as_ref(),
            rustls::pki_types::ServerName::IpAddress(_) => {
                return Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure,
                ));
            }
            _ => {
                return Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure,
                ));
            }
        };

        let public_key = extract_public_key_from_cert(end_entity.as_ref())
            .ok_or(rustls::Error::InvalidCertificate(
                rustls::CertificateError::BadEncoding,
            ))?;

        if VerifyingKey::try_from(public_key.as_slice()).is_err() {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }

        // Bootstrap dials go to a bare address with no expected RouterId.
        // The certificate key must still be valid Ed25519; the dialer learns
        // the peer's identity from it after the handshake.
        if expected_id_sni == BOOTSTRAP_SNI {
            return Ok(rustls::client::danger::ServerCertVerified::assertion());
        }

        let expected_id = parse_router_id_from_sni(expected_id_sni).ok_or_else(|| {
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding)
        })?;

        // SECURITY: the dialer reaches the router it intended to reach or the
        // handshake fails. A peer cannot present a certificate for a key
        // whose digest differs from the expected RouterId.
        if RouterId::from_key_bytes(&public_key) != expected_id {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName,
            ));
        }

        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

// ============================================================================
// Layer Crypto (tunnel layers and sealed boxes)
// ============================================================================

/// Per-hop symmetric layer key. Generated by the tunnel originator, delivered
/// inside the hop's build record, destroyed with the tunnel.
pub type LayerKey = [u8; 32];

/// AEAD overhead added by one layer (Poly1305 tag).
pub const LAYER_OVERHEAD: usize = 16;

/// Nonce context for tunnel data layers.
pub(crate) const TUNNEL_DATA_CONTEXT: u32 = 0x5444_0001;

/// Nonce context for encrypted build-reply votes.
pub(crate) const BUILD_REPLY_CONTEXT: u32 = 0x4252_0001;

/// Generate a fresh random layer key.
#[inline]
pub fn random_layer_key() -> LayerKey {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// Build the 12-byte AEAD nonce from a message counter and a context tag.
///
/// SECURITY: a layer key belongs to exactly one tunnel and counters increase
/// monotonically per tunnel, so a (key, nonce) pair is never reused. The
/// context tag separates data layers from reply votes under the same key.
#[inline]
fn layer_nonce(counter: u64, context: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce[8..].copy_from_slice(&context.to_le_bytes());
    nonce
}

/// Encrypt one layer: returns ciphertext with the 16-byte tag appended.
pub fn seal_layer(key: &LayerKey, counter: u64, context: u32, plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = layer_nonce(counter, context);
    cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .expect("ChaCha20-Poly1305 encryption is infallible for in-memory buffers")
}

/// Remove one layer: verifies the tag and returns the inner plaintext.
pub fn open_layer(
    key: &LayerKey,
    counter: u64,
    context: u32,
    ciphertext: &[u8],
) -> std::result::Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < LAYER_OVERHEAD {
        return Err(CryptoError::Malformed);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = layer_nonce(counter, context);
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)
}

/// Sealed-box overhead: ephemeral key (32) + nonce (12) + tag (16).
pub const SEALED_BOX_OVERHEAD: usize = 32 + 12 + 16;

/// Seal a payload to an X25519 public key.
///
/// Ephemeral ECDH against the recipient key, HKDF-SHA256 with the given info
/// string, then ChaCha20-Poly1305. Output layout:
/// `ephemeral_public(32) || nonce(12) || ciphertext+tag`.
///
/// Only the holder of the matching secret can open the box; the sender
/// cannot decrypt its own output once the ephemeral secret is dropped.
pub fn seal_to_key(
    recipient: &x25519_dalek::PublicKey,
    plaintext: &[u8],
    info: &[u8],
) -> Vec<u8> {
    let ephemeral = x25519_dalek::StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = x25519_dalek::PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);

    let key = derive_box_key(shared.as_bytes(), info);
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .expect("ChaCha20-Poly1305 encryption is infallible for in-memory buffers");

    let mut out = Vec::with_capacity(SEALED_BOX_OVERHEAD + plaintext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    out
}

/// Open a sealed box with the recipient's X25519 secret.
pub fn open_with_key(
    secret: &x25519_dalek::StaticSecret,
    blob: &[u8],
    info: &[u8],
) -> std::result::Result<Vec<u8>, CryptoError> {
    if blob.len() < SEALED_BOX_OVERHEAD {
        return Err(CryptoError::Malformed);
    }

    let mut ephemeral_bytes = [0u8; 32];
    ephemeral_bytes.copy_from_slice(&blob[..32]);
    let ephemeral_public = x25519_dalek::PublicKey::from(ephemeral_bytes);
    let nonce = &blob[32..44];
    let ciphertext = &blob[44..];

    let shared = secret.diffie_hellman(&ephemeral_public);
    let key = derive_box_key(shared.as_bytes(), info);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)
}

/// HKDF-SHA256 expand of an ECDH shared secret into an AEAD key.
fn derive_box_key(shared: &[u8; 32], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RouterKeys;
    use std::collections::HashSet;

    #[test]
    fn certificate_contains_signing_public_key() {
        for _ in 0..20 {
            let keys = RouterKeys::generate();
            let public_key = keys.verifying_key().to_bytes();

            let (certs, _key) =
                generate_ed25519_cert(&keys).expect("cert generation must succeed");

            let cert_der = certs[0].as_ref();
            let extracted_pk =
                extract_public_key_from_cert(cert_der).expect("public key extraction must succeed");

            assert_eq!(
                extracted_pk, public_key,
                "certificate public key differs from signing key"
            );
            assert_eq!(RouterId::from_key_bytes(&extracted_pk), keys.id());
        }
    }

    #[test]
    fn different_keypairs_different_cert_public_keys() {
        let mut public_keys = HashSet::new();

        for _ in 0..50 {
            let keys = RouterKeys::generate();
            let (certs, _) = generate_ed25519_cert(&keys).expect("cert generation must succeed");

            let cert_pk =
                extract_public_key_from_cert(certs[0].as_ref()).expect("pk extraction must succeed");

            assert!(
                public_keys.insert(cert_pk),
                "certificate public key collision between different keypairs"
            );
        }
    }

    #[test]
    fn sni_roundtrip_preserves_router_id() {
        let id = RouterKeys::generate().id();
        let sni = router_id_to_sni(&id);

        // Both labels must fit DNS limits
        for label in sni.split('.') {
            assert!(label.len() <= 63);
        }

        assert_eq!(parse_router_id_from_sni(&sni), Some(id));
        assert_eq!(parse_router_id_from_sni("not-hex.either"), None);
        assert_eq!(parse_router_id_from_sni("abcd"), None);

        // The bootstrap name must never alias a real pinned identity.
        assert_eq!(parse_router_id_from_sni(BOOTSTRAP_SNI), None);
    }

    #[test]
    fn domain_separation_prevents_cross_context_replay() {
        let keys = RouterKeys::generate();
        let payload = b"same payload";

        let sig = sign_with_domain(keys.signing_key(), ROUTER_INFO_SIGNATURE_DOMAIN, payload);
        let public = keys.verifying_key().to_bytes();

        assert!(
            verify_with_domain(&public, ROUTER_INFO_SIGNATURE_DOMAIN, payload, &sig).is_ok()
        );
        assert_eq!(
            verify_with_domain(&public, LEASE_SET_SIGNATURE_DOMAIN, payload, &sig),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(
            verify_with_domain(&public, ROUTER_INFO_SIGNATURE_DOMAIN, payload, &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&public, ROUTER_INFO_SIGNATURE_DOMAIN, payload, &sig[..32]),
            Err(SignatureError::InvalidLength)
        );
    }

    #[test]
    fn layer_seal_open_roundtrip() {
        let key = random_layer_key();
        let plaintext = b"tunnel payload bytes";

        let sealed = seal_layer(&key, 7, TUNNEL_DATA_CONTEXT, plaintext);
        assert_eq!(sealed.len(), plaintext.len() + LAYER_OVERHEAD);

        let opened = open_layer(&key, 7, TUNNEL_DATA_CONTEXT, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn layer_open_rejects_wrong_parameters() {
        let key = random_layer_key();
        let sealed = seal_layer(&key, 7, TUNNEL_DATA_CONTEXT, b"payload");

        // Wrong counter
        assert_eq!(
            open_layer(&key, 8, TUNNEL_DATA_CONTEXT, &sealed),
            Err(CryptoError::DecryptFailed)
        );
        // Wrong context
        assert_eq!(
            open_layer(&key, 7, BUILD_REPLY_CONTEXT, &sealed),
            Err(CryptoError::DecryptFailed)
        );
        // Wrong key
        let other = random_layer_key();
        assert_eq!(
            open_layer(&other, 7, TUNNEL_DATA_CONTEXT, &sealed),
            Err(CryptoError::DecryptFailed)
        );
        // Tampered ciphertext
        let mut tampered = sealed.clone();
        tampered[0] ^= 1;
        assert_eq!(
            open_layer(&key, 7, TUNNEL_DATA_CONTEXT, &tampered),
            Err(CryptoError::DecryptFailed)
        );
        // Truncated
        assert_eq!(
            open_layer(&key, 7, TUNNEL_DATA_CONTEXT, &sealed[..8]),
            Err(CryptoError::Malformed)
        );
    }

    #[test]
    fn sealed_box_roundtrip() {
        let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);

        let blob = seal_to_key(&public, b"garlic clove", GARLIC_INFO);
        assert_eq!(blob.len(), b"garlic clove".len() + SEALED_BOX_OVERHEAD);

        let opened = open_with_key(&secret, &blob, GARLIC_INFO).unwrap();
        assert_eq!(opened, b"garlic clove");
    }

    #[test]
    fn sealed_box_rejects_wrong_recipient_and_tampering() {
        let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);
        let blob = seal_to_key(&public, b"garlic clove", GARLIC_INFO);

        let wrong_secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        assert_eq!(
            open_with_key(&wrong_secret, &blob, GARLIC_INFO),
            Err(CryptoError::DecryptFailed)
        );

        // Info string mismatch derives a different key
        assert_eq!(
            open_with_key(&secret, &blob, BUILD_RECORD_INFO),
            Err(CryptoError::DecryptFailed)
        );

        let mut tampered = blob.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert_eq!(
            open_with_key(&secret, &tampered, GARLIC_INFO),
            Err(CryptoError::DecryptFailed)
        );

        assert_eq!(
            open_with_key(&secret, &blob[..SEALED_BOX_OVERHEAD - 1], GARLIC_INFO),
            Err(CryptoError::Malformed)
        );
    }

    #[test]
    fn sealed_boxes_are_randomized() {
        let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);

        let a = seal_to_key(&public, b"same plaintext", GARLIC_INFO);
        let b = seal_to_key(&public, b"same plaintext", GARLIC_INFO);
        assert_ne!(a, b, "fresh ephemeral keys must randomize the box");
    }
}
