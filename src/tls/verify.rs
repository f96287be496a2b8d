//! Peer certificate verification policy for client sessions.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};

use super::TlsError;

/// How a client session verifies the server certificate.
///
/// There is no `Default`; every client context names its policy.
#[derive(Clone)]
pub enum Verification {
    /// Verify against the given trust anchors.
    WebPki(RootCertStore),

    /// Verify against the platform's trust store.
    NativeRoots,

    /// Accept any server certificate. Handshake signatures are still checked.
    Disabled,
}

impl fmt::Debug for Verification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebPki(roots) => f.debug_tuple("WebPki").field(&roots.len()).finish(),
            Self::NativeRoots => f.write_str("NativeRoots"),
            Self::Disabled => f.write_str("Disabled"),
        }
    }
}

impl Verification {
    /// Trust exactly the given certificates.
    pub fn with_roots<I>(certs: I) -> Result<Self, TlsError>
    where
        I: IntoIterator<Item = CertificateDer<'static>>,
    {
        let mut roots = RootCertStore::empty();
        for cert in certs {
            roots
                .add(cert)
                .map_err(|error| TlsError::generic(format!("invalid root certificate: {error}")))?;
        }
        Ok(Self::WebPki(roots))
    }
}

pub(super) fn native_roots() -> Result<RootCertStore, TlsError> {
    let found = rustls_native_certs::load_native_certs();
    for error in &found.errors {
        tracing::warn!("error loading native certificate: {error}");
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(found.certs);
    tracing::trace!(added, ignored, "loaded native root certificates");

    if roots.is_empty() {
        return Err(TlsError::generic("no native root certificates found"));
    }
    Ok(roots)
}

/// Crypto provider used for every config built by this crate: the process
/// default if one is installed, otherwise the provider selected by features.
#[allow(unreachable_code)]
pub(super) fn crypto_provider() -> Result<Arc<CryptoProvider>, TlsError> {
    if let Some(provider) = CryptoProvider::get_default() {
        return Ok(provider.clone());
    }

    #[cfg(feature = "tls-ring")]
    return Ok(Arc::new(rustls::crypto::ring::default_provider()));

    #[cfg(all(feature = "tls-aws-lc", not(feature = "tls-ring")))]
    return Ok(Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

    Err(TlsError::generic(
        "no crypto provider installed; enable tls-ring or tls-aws-lc",
    ))
}

/// Accepts any certificate chain while still checking handshake signatures.
#[derive(Debug)]
pub(super) struct NoVerification {
    provider: Arc<CryptoProvider>,
}

impl NoVerification {
    pub(super) fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for NoVerification {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(all(test, feature = "tls-ring"))]
mod tests {
    use super::*;

    #[test]
    fn debug_does_not_dump_roots() {
        let policy = Verification::WebPki(RootCertStore::empty());
        assert_eq!(format!("{policy:?}"), "WebPki(0)");
        assert_eq!(format!("{:?}", Verification::Disabled), "Disabled");
    }

    #[test]
    fn provider_is_available() {
        let provider = crypto_provider().unwrap();
        let verifier = NoVerification::new(provider);
        assert!(!verifier.supported_verify_schemes().is_empty());
    }

    #[test]
    fn garbage_root_is_rejected() {
        let result = Verification::with_roots([CertificateDer::from(vec![0u8; 8])]);
        assert!(result.is_err());
    }
}
