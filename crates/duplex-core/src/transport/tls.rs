//! rustls configuration for the TLS transport variants.
//!
//! The server side loads a PEM certificate chain and private key; their
//! absence is a configuration error. The client side either verifies the
//! peer against a caller-supplied CA bundle or, with
//! `reject_unauthorized = false`, accepts any certificate while still
//! negotiating TLS 1.2/1.3.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use crate::error::{DuplexError, DuplexResult};

/// TLS options for client-side transports.
#[derive(Debug, Clone)]
pub struct TlsClientOptions {
    /// Server name used for SNI and certificate verification.
    pub domain: String,
    /// When `false`, any peer certificate is accepted; when `true`, standard
    /// chain and hostname verification applies against `ca_path`.
    pub reject_unauthorized: bool,
    /// CA bundle (PEM). Required when `reject_unauthorized` is `true`.
    pub ca_path: Option<PathBuf>,
}

impl TlsClientOptions {
    /// Options that accept any server certificate (development / tests).
    pub fn insecure(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            reject_unauthorized: false,
            ca_path: None,
        }
    }

    /// Options that verify the server against a CA bundle.
    pub fn verified(domain: impl Into<String>, ca_path: impl Into<PathBuf>) -> Self {
        Self {
            domain: domain.into(),
            reject_unauthorized: true,
            ca_path: Some(ca_path.into()),
        }
    }
}

/// Build a rustls client config from [`TlsClientOptions`].
pub fn client_config(options: &TlsClientOptions) -> DuplexResult<Arc<rustls::ClientConfig>> {
    if options.reject_unauthorized {
        let ca_path = options.ca_path.as_ref().ok_or_else(|| {
            DuplexError::Config("certificate verification requires a CA bundle path".into())
        })?;
        let ca_pem = std::fs::read(ca_path).map_err(|e| {
            DuplexError::Config(format!("cannot read CA bundle {}: {e}", ca_path.display()))
        })?;
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
            let cert =
                cert.map_err(|e| DuplexError::Config(format!("invalid CA bundle: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| DuplexError::Config(format!("invalid CA certificate: {e}")))?;
        }
        if roots.is_empty() {
            return Err(DuplexError::Config(format!(
                "no CA certificates found in {}",
                ca_path.display()
            )));
        }
        Ok(Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        ))
    } else {
        Ok(Arc::new(
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
                .with_no_client_auth(),
        ))
    }
}

/// Build a rustls server config from PEM certificate and key files.
pub fn server_config(cert_path: &Path, key_path: &Path) -> DuplexResult<Arc<rustls::ServerConfig>> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        DuplexError::Config(format!("cannot read cert {}: {e}", cert_path.display()))
    })?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| DuplexError::Config(format!("cannot read key {}: {e}", key_path.display())))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DuplexError::Config(format!("invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(DuplexError::Config(format!(
            "no certificate found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| DuplexError::Config(format!("invalid key PEM: {e}")))?
        .ok_or_else(|| {
            DuplexError::Config(format!("no private key found in {}", key_path.display()))
        })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| DuplexError::Config(format!("invalid certificate/key pair: {e}")))?;
    Ok(Arc::new(config))
}

/// Verifier used with `reject_unauthorized = false`: accepts every peer
/// certificate but leaves the rest of the handshake intact.
#[derive(Debug)]
struct AcceptAnyCert {
    schemes: Vec<SignatureScheme>,
}

impl AcceptAnyCert {
    fn new() -> Self {
        let provider = CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));
        Self {
            schemes: provider
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
