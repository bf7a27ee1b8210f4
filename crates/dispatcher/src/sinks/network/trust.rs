//! Transport trust policies
//!
//! An encrypted link is attempted under an ordered list of trust modes:
//! the pinned certificates first, then the bundled web roots, then
//! (only when explicitly allowed) no verification at all.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use contracts::{BrokerConfig, TrustConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore,
    SignatureScheme,
};
use thiserror::Error;
use tracing::warn;

/// Certificate acceptance policy for one connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrustMode {
    /// No transport encryption
    Plain,
    /// Only the pinned authority and leaf certificates; host name not checked
    Pinned,
    /// Bundled web PKI roots
    SystemDefault,
    /// Any certificate chain; host name not checked
    NoVerification,
}

impl TrustMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Pinned => "pinned",
            Self::SystemDefault => "system_default",
            Self::NoVerification => "no_verification",
        }
    }
}

impl fmt::Display for TrustMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered trust modes to attempt for this broker
pub fn trust_plan(config: &BrokerConfig) -> Vec<TrustMode> {
    if !config.uses_tls() {
        return vec![TrustMode::Plain];
    }
    let mut plan = vec![TrustMode::Pinned, TrustMode::SystemDefault];
    if config.trust.allow_insecure_fallback {
        plan.push(TrustMode::NoVerification);
    }
    plan
}

/// Trust material failures
#[derive(Debug, Error)]
pub enum TrustError {
    #[error("failed to read certificate file {path}: {message}")]
    Read { path: String, message: String },

    #[error("no certificates found in {0}")]
    Empty(String),

    #[error("invalid trust material: {0}")]
    Invalid(String),
}

/// Pinned certificate material loaded from disk
#[derive(Clone, Default)]
pub struct TrustAnchors {
    authority: Vec<CertificateDer<'static>>,
    leaf: Vec<CertificateDer<'static>>,
}

impl TrustAnchors {
    pub fn new(
        authority: Vec<CertificateDer<'static>>,
        leaf: Vec<CertificateDer<'static>>,
    ) -> Self {
        Self { authority, leaf }
    }

    /// Load the pinned material; a custom authority replaces the pinned one.
    ///
    /// Unreadable files leave that set empty, which later degrades the
    /// pinned mode to the web roots instead of failing the connection.
    pub fn load(config: &TrustConfig) -> Self {
        let authority_path = config
            .custom_ca_path
            .as_ref()
            .or(config.pinned_authority_path.as_ref());
        Self {
            authority: load_optional(authority_path.map(|p| p.as_path())),
            leaf: load_optional(config.pinned_leaf_path.as_deref()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.authority.is_empty() && self.leaf.is_empty()
    }
}

impl fmt::Debug for TrustAnchors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustAnchors")
            .field("authority_certs", &self.authority.len())
            .field("leaf_certs", &self.leaf.len())
            .finish()
    }
}

fn load_optional(path: Option<&Path>) -> Vec<CertificateDer<'static>> {
    let Some(path) = path else {
        return Vec::new();
    };
    match read_certificates(path) {
        Ok(certs) => certs,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring pinned certificate file");
            Vec::new()
        }
    }
}

/// Read PEM certificates, or a single DER certificate
pub fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TrustError> {
    let bytes = std::fs::read(path).map_err(|e| TrustError::Read {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let certs = parse_certificates(&bytes)?;
    if certs.is_empty() {
        return Err(TrustError::Empty(path.display().to_string()));
    }
    Ok(certs)
}

fn parse_certificates(bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>, TrustError> {
    // DER certificates start with a SEQUENCE tag
    if bytes.first() == Some(&0x30) {
        return Ok(vec![CertificateDer::from(bytes.to_vec())]);
    }
    rustls_pemfile::certs(&mut &bytes[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TrustError::Invalid(e.to_string()))
}

/// TLS client configuration for `mode`, or `None` for a plain link.
///
/// Fails for `Pinned` when no usable pinned material was loaded; the caller
/// treats that like a rejected handshake and moves on to the system roots.
pub fn client_config(
    mode: TrustMode,
    anchors: &TrustAnchors,
) -> Result<Option<Arc<ClientConfig>>, TrustError> {
    let config = match mode {
        TrustMode::Plain => return Ok(None),
        TrustMode::Pinned => pinned_config(anchors)?,
        TrustMode::SystemDefault => system_config(),
        TrustMode::NoVerification => {
            warn!("Certificate verification disabled for this connection");
            insecure_config()
        }
    };
    Ok(Some(Arc::new(config)))
}

fn pinned_config(anchors: &TrustAnchors) -> Result<ClientConfig, TrustError> {
    if anchors.is_empty() {
        return Err(TrustError::Invalid("no pinned certificates configured".into()));
    }
    let mut roots = RootCertStore::empty();
    for cert in anchors.authority.iter().chain(&anchors.leaf) {
        roots
            .add(cert.clone())
            .map_err(|e| TrustError::Invalid(e.to_string()))?;
    }
    let inner = WebPkiServerVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| TrustError::Invalid(e.to_string()))?;

    let verifier = PinnedVerifier {
        leaf: anchors.leaf.clone(),
        inner,
        algorithms: supported_algorithms(),
    };
    Ok(ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth())
}

fn system_config() -> ClientConfig {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

fn insecure_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate {
            algorithms: supported_algorithms(),
        }))
        .with_no_client_auth()
}

fn supported_algorithms() -> WebPkiSupportedAlgorithms {
    rustls::crypto::ring::default_provider().signature_verification_algorithms
}

/// Accepts the pinned leaf outright, otherwise chains to the pinned
/// authority ignoring the host name.
#[derive(Debug)]
struct PinnedVerifier {
    leaf: Vec<CertificateDer<'static>>,
    inner: Arc<WebPkiServerVerifier>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        if self.leaf.iter().any(|pinned| pinned.as_ref() == end_entity.as_ref()) {
            return Ok(ServerCertVerified::assertion());
        }
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(TlsError::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Accepts any chain; handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCertificate {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Whether `err` or anything in its source chain is a TLS failure
pub fn is_certificate_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<TlsError>() {
            return true;
        }
        // io::Error hides its payload from source(), so look inside
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.get_ref().is_some_and(|inner| inner.is::<TlsError>()) {
                return true;
            }
        }
        current = e.source();
    }
    false
}
