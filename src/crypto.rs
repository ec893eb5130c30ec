//! # Cryptographic Infrastructure
//!
//! This module provides the TLS material and report encryption for the
//! client:
//!
//! - **Server TLS**: a throwaway self-signed certificate (2048-bit RSA,
//!   minimal serial) generated at startup for the inbound HTTP/3 role.
//! - **Client TLS**: permissive verification with ALPN `h3`. The transport
//!   security model is "the token is the capability": edges authorize reads
//!   by decrypting the scheduler-issued token, not by TLS identity.
//! - **Report encryption**: RSA-OAEP(SHA-256), chunked, against each
//!   scheduler's published key.
//!
//! ## SECURITY WARNING
//!
//! The `dangerous()` client verifier is used intentionally: peers present
//! self-signed throwaway certificates and authorization happens at the token
//! layer, so certificate chains carry no meaning here.

use std::sync::Arc;
use std::time::Duration;

use quinn::ClientConfig;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePublicKey, EncodePrivateKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::Sha256;

use crate::error::{Error, Result};

/// Lazily-initialized crypto provider for rustls.
/// Uses ring as the underlying cryptographic implementation.
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier for all connections, both roles.
pub const ALPN: &[u8] = b"h3";

/// RSA modulus size for the throwaway server certificate.
const SERVER_KEY_BITS: usize = 2048;

/// SHA-256 digest size, fixed by the OAEP padding scheme.
const OAEP_HASH_SIZE: usize = 32;

/// QUIC keep-alive interval; hole-punched mappings die quickly without it.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Generate the self-signed certificate for the inbound HTTP/3 role.
///
/// Shape matches what remote peers expect from a client endpoint: 2048-bit
/// RSA, serial number 1, no meaningful subject.
pub fn generate_server_cert() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut rng = rand::rngs::OsRng;
    let key = RsaPrivateKey::new(&mut rng, SERVER_KEY_BITS)
        .map_err(|e| Error::config(format!("failed to generate server RSA key: {}", e)))?;

    let pkcs8 = key
        .to_pkcs8_der()
        .map_err(|e| Error::config(format!("failed to encode server key: {}", e)))?;
    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec());

    let key_pair = rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8_der, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| Error::config(format!("failed to load RSA key pair: {}", e)))?;

    let mut params = rcgen::CertificateParams::new(Vec::<String>::new())
        .map_err(|e| Error::config(format!("failed to create certificate params: {}", e)))?;
    params.serial_number = Some(rcgen::SerialNumber::from(vec![1u8]));

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::config(format!("failed to self-sign certificate: {}", e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(pkcs8_der);

    Ok((vec![cert_der], key_der))
}

/// Build the quinn server config for the shared endpoint.
pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::config(format!("server TLS versions: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::config(format!("server TLS config: {}", e)))?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .map_err(|e| Error::config(format!("QUIC server config: {}", e)))?,
    ));

    Ok(server_config)
}

/// Build the quinn client config: permissive verification, ALPN `h3`,
/// 1-second keep-alive.
pub fn create_client_config() -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::config(format!("client TLS versions: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PermissiveServerVerifier))
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .map_err(|e| Error::config(format!("QUIC client config: {}", e)))?,
    ));

    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    client_config.transport_config(Arc::new(transport));

    Ok(client_config)
}

/// Accepts any server certificate. See the module-level security note.
#[derive(Debug)]
struct PermissiveServerVerifier;

impl rustls::client::danger::ServerCertVerifier for PermissiveServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ============================================================================
// Workload report encryption
// ============================================================================

/// Decode a scheduler's published RSA public key from PEM.
///
/// Accepts both SPKI (`PUBLIC KEY`) and PKCS#1 (`RSA PUBLIC KEY`) encodings;
/// deployed schedulers have shipped both.
pub fn decode_public_key(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| Error::encrypt(format!("failed to parse scheduler public key: {}", e)))
}

/// Maximum plaintext bytes per OAEP block for the given key.
pub fn oaep_chunk_size(key: &RsaPublicKey) -> usize {
    key.size() - 2 * OAEP_HASH_SIZE - 2
}

/// Encrypt `msg` with RSA-OAEP(SHA-256), splitting into maximal chunks and
/// concatenating the ciphertext blocks.
pub fn encrypt(msg: &[u8], key: &RsaPublicKey) -> Result<Vec<u8>> {
    let step = oaep_chunk_size(key);
    let mut rng = rand::rngs::OsRng;
    let mut out = Vec::with_capacity(msg.len().div_ceil(step.max(1)) * key.size());

    for chunk in msg.chunks(step) {
        let block = key
            .encrypt(&mut rng, Oaep::new::<Sha256>(), chunk)
            .map_err(|e| Error::encrypt(format!("OAEP encryption failed: {}", e)))?;
        out.extend_from_slice(&block);
    }

    Ok(out)
}
