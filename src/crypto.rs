//! # TLS Identity Binding
//!
//! Every meshcast connection is mutually authenticated QUIC/TLS 1.3. Each node
//! presents a self-signed certificate generated from its Ed25519 keypair, and
//! the certificate's subject public key IS the peer's [`Identity`].
//!
//! - The dialer encodes the expected PeerID in the SNI; the server certificate
//!   must carry that exact key or the handshake fails.
//! - The listener accepts any valid Ed25519 client certificate and reads the
//!   remote PeerID back out of it after the handshake.
//! - Only Ed25519 signatures are accepted.
//!
//! Trust is anchored in the public key itself, so both verifiers go through
//! the `dangerous()` rustls APIs instead of a CA chain.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{IdleTimeout, TransportConfig, VarInt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};

use crate::identity::{Identity, Keypair};

static PROVIDER: LazyLock<Arc<CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN token; peers speaking anything else are refused during the handshake.
pub const ALPN: &[u8] = b"meshcast/1";

const IDLE_TIMEOUT_MS: u32 = 60_000;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const MAX_CONCURRENT_BIDI_STREAMS: u32 = 64;

/// RFC 8410 PKCS#8 header for a bare 32-byte Ed25519 seed.
const ED25519_PKCS8_HEADER: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04, 0x20,
];

/// A node's self-signed certificate and the matching private key.
pub struct NodeCertificate {
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
}

impl NodeCertificate {
    /// Issue a certificate whose subject key is `keypair`'s public key.
    pub fn issue(keypair: &Keypair) -> Result<Self> {
        let pkcs8: Vec<u8> = ED25519_PKCS8_HEADER
            .iter()
            .copied()
            .chain(keypair.secret_key_bytes())
            .collect();

        let signer = rcgen::KeyPair::try_from(&PrivatePkcs8KeyDer::from(pkcs8.clone()))
            .context("Ed25519 seed rejected by certificate generator")?;
        let mut params = rcgen::CertificateParams::new(vec!["meshcast".to_string()])
            .context("invalid certificate parameters")?;
        params.distinguished_name.push(
            rcgen::DnType::CommonName,
            rcgen::DnValue::Utf8String(keypair.identity().to_hex()),
        );
        let cert = params
            .self_signed(&signer)
            .context("self-signing the node certificate failed")?;

        Ok(Self {
            cert: CertificateDer::from(cert.der().to_vec()),
            key: PrivateKeyDer::Pkcs8(pkcs8.into()),
        })
    }

    /// Listener side: demands an Ed25519 client certificate from every dialer.
    pub fn server_config(&self) -> Result<quinn::ServerConfig> {
        let mut tls = rustls::ServerConfig::builder_with_provider(Arc::clone(&PROVIDER))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .context("TLS 1.3 unavailable for server")?
            .with_client_cert_verifier(Arc::new(PeerKeyVerifier))
            .with_single_cert(vec![self.cert.clone()], self.key.clone_key())
            .context("server TLS config rejected the node certificate")?;
        tls.alpn_protocols = vec![ALPN.to_vec()];

        let quic = QuicServerConfig::try_from(tls).context("TLS config unusable for QUIC server")?;
        let mut config = quinn::ServerConfig::with_crypto(Arc::new(quic));
        config.transport_config(Arc::new(transport_config()));
        Ok(config)
    }

    /// Dialer side: checks the server key against the PeerID in the SNI.
    pub fn client_config(&self) -> Result<quinn::ClientConfig> {
        let mut tls = rustls::ClientConfig::builder_with_provider(Arc::clone(&PROVIDER))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .context("TLS 1.3 unavailable for client")?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PeerKeyVerifier))
            .with_client_auth_cert(vec![self.cert.clone()], self.key.clone_key())
            .context("client TLS config rejected the node certificate")?;
        tls.alpn_protocols = vec![ALPN.to_vec()];

        let quic = QuicClientConfig::try_from(tls).context("TLS config unusable for QUIC client")?;
        let mut config = quinn::ClientConfig::new(Arc::new(quic));
        config.transport_config(Arc::new(transport_config()));
        Ok(config)
    }
}

fn transport_config() -> TransportConfig {
    let mut config = TransportConfig::default();
    config
        .max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(IDLE_TIMEOUT_MS))))
        .keep_alive_interval(Some(KEEP_ALIVE_INTERVAL))
        .max_concurrent_bidi_streams(VarInt::from_u32(MAX_CONCURRENT_BIDI_STREAMS))
        .max_concurrent_uni_streams(VarInt::from_u32(0));
    config
}

/// The raw subject public key of a DER certificate, if it is 32 bytes long.
pub fn cert_public_key(der: &[u8]) -> Option<[u8; 32]> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let key: &[u8] = &cert.public_key().subject_public_key.data;
    key.try_into().ok()
}

/// The remote PeerID proven by the TLS handshake on `connection`.
pub fn verified_peer(connection: &quinn::Connection) -> Option<Identity> {
    let presented = connection.peer_identity()?;
    let chain = presented.downcast_ref::<Vec<CertificateDer<'static>>>()?;
    cert_public_key(chain.first()?).map(Identity::from_bytes)
}

/// SNI carrying the expected PeerID. A DNS label is capped at 63 characters,
/// so the 64 hex digits are split into two labels.
pub(crate) fn sni_for(identity: &Identity) -> String {
    let hex = identity.to_hex();
    let (left, right) = hex.split_at(32);
    format!("{left}.{right}")
}

fn identity_from_sni(sni: &str) -> Option<Identity> {
    Identity::from_hex(&sni.replace('.', "")).ok()
}

fn reject(reason: CertificateError) -> rustls::Error {
    rustls::Error::InvalidCertificate(reason)
}

/// Verifies both handshake directions: the certificate key must be a valid
/// Ed25519 point, and on the dialer side it must also match the SNI.
#[derive(Debug)]
struct PeerKeyVerifier;

impl PeerKeyVerifier {
    fn presented_key(end_entity: &CertificateDer<'_>) -> Result<Identity, rustls::Error> {
        let key = cert_public_key(end_entity).ok_or(reject(CertificateError::BadEncoding))?;
        let identity = Identity::from_bytes(key);
        if identity.is_valid() {
            Ok(identity)
        } else {
            Err(reject(CertificateError::ApplicationVerificationFailure))
        }
    }

    fn tls12(
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &PROVIDER.signature_verification_algorithms)
    }

    fn tls13(
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &PROVIDER.signature_verification_algorithms)
    }
}

impl ClientCertVerifier for PeerKeyVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Self::presented_key(end_entity).map(|_| ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Self::tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Self::tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }
}

impl ServerCertVerifier for PeerKeyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let ServerName::DnsName(name) = server_name else {
            return Err(reject(CertificateError::NotValidForName));
        };
        let expected = identity_from_sni(name.as_ref()).ok_or(reject(CertificateError::BadEncoding))?;
        if Self::presented_key(end_entity)? != expected {
            return Err(reject(CertificateError::NotValidForName));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Self::tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Self::tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }
}
