//! Shared TLS configuration from which sessions are created.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ServerConfig};

use super::verify::{crypto_provider, native_roots, NoVerification, Verification};
use super::{TlsError, TlsSession};

#[derive(Clone)]
pub(super) enum Role {
    Server(Arc<ServerConfig>),
    Client {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    },
}

/// Server or client TLS configuration, cheap to clone and shared by every
/// session it creates.
#[derive(Clone)]
pub struct TlsContext {
    role: Role,
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.role {
            Role::Server(_) => f.debug_struct("TlsContext").field("role", &"server").finish(),
            Role::Client { server_name, .. } => f
                .debug_struct("TlsContext")
                .field("role", &"client")
                .field("server_name", server_name)
                .finish(),
        }
    }
}

impl TlsContext {
    /// Server context from a PEM certificate chain and a PEM private key.
    pub fn server_from_pem(cert_chain: &[u8], private_key: &[u8]) -> Result<Self, TlsError> {
        let certs = pem_certificates(cert_chain)?;
        if certs.is_empty() {
            return Err(TlsError::generic("no certificates found in PEM input"));
        }
        let key = pem_private_key(private_key)?;

        let config = ServerConfig::builder_with_provider(crypto_provider()?)
            .with_safe_default_protocol_versions()
            .map_err(|error| TlsError::generic(error.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|error| TlsError::generic(format!("invalid certificate or key: {error}")))?;

        Ok(Self::from_server_config(Arc::new(config)))
    }

    /// Server context from PEM files on disk.
    pub fn server_from_pem_files(
        cert_chain: impl AsRef<Path>,
        private_key: impl AsRef<Path>,
    ) -> Result<Self, crate::Error> {
        let cert_chain = std::fs::read(cert_chain.as_ref())?;
        let private_key = std::fs::read(private_key.as_ref())?;
        Ok(Self::server_from_pem(&cert_chain, &private_key)?)
    }

    /// Wrap an existing server configuration.
    pub fn from_server_config(config: Arc<ServerConfig>) -> Self {
        Self {
            role: Role::Server(config),
        }
    }

    /// Client context for `server_name` with an explicit verification policy.
    pub fn client(server_name: &str, verification: Verification) -> Result<Self, TlsError> {
        let provider = crypto_provider()?;
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|error| TlsError::generic(error.to_string()))?;

        let config = match verification {
            Verification::WebPki(roots) => builder
                .with_root_certificates(roots)
                .with_no_client_auth(),
            Verification::NativeRoots => builder
                .with_root_certificates(native_roots()?)
                .with_no_client_auth(),
            Verification::Disabled => {
                tracing::warn!(
                    server_name,
                    "peer certificate verification is disabled for this client context"
                );
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerification::new(provider)))
                    .with_no_client_auth()
            }
        };

        Self::from_client_config(Arc::new(config), server_name)
    }

    /// Wrap an existing client configuration.
    pub fn from_client_config(
        config: Arc<ClientConfig>,
        server_name: &str,
    ) -> Result<Self, TlsError> {
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|error| TlsError::generic(format!("invalid server name: {error}")))?;
        Ok(Self {
            role: Role::Client {
                config,
                server_name,
            },
        })
    }

    /// True for a server context.
    pub fn is_server(&self) -> bool {
        matches!(self.role, Role::Server(_))
    }

    /// A new session with its role already selected from this context.
    pub fn new_session(&self) -> Result<TlsSession, TlsError> {
        let mut session = TlsSession::new(self.clone());
        if self.is_server() {
            session.accept()?;
        } else {
            session.connect()?;
        }
        Ok(session)
    }

    pub(super) fn role(&self) -> &Role {
        &self.role
    }
}

fn pem_certificates(input: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    rustls_pemfile::certs(&mut &input[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| TlsError::generic(format!("invalid PEM certificate: {error}")))
}

/// First PKCS#8, PKCS#1 or SEC1 key in `input`.
fn pem_private_key(input: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut &input[..])
        .map_err(|error| TlsError::generic(format!("invalid PEM private key: {error}")))?
        .ok_or_else(|| TlsError::generic("no private key found in PEM input"))
}

#[cfg(all(test, feature = "tls-ring"))]
mod tests {
    use super::*;

    use crate::fixtures;

    #[test]
    fn server_context_from_pem() {
        let context = TlsContext::server_from_pem(fixtures::CERT, fixtures::KEY).unwrap();
        assert!(context.is_server());

        let session = context.new_session().unwrap();
        assert!(!session.is_handshake_done());
    }

    #[test]
    fn server_context_from_files() {
        let dir = tempfile::TempDir::with_prefix("switchyard-pem").unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, fixtures::CERT).unwrap();
        std::fs::write(&key, fixtures::KEY).unwrap();

        let context = TlsContext::server_from_pem_files(&cert, &key).unwrap();
        assert!(context.is_server());

        let missing = TlsContext::server_from_pem_files(dir.path().join("nope.pem"), &key);
        assert!(matches!(missing, Err(crate::Error::Io(_))));
    }

    #[test]
    fn mismatched_inputs_are_rejected() {
        assert!(TlsContext::server_from_pem(fixtures::KEY, fixtures::KEY).is_err());
        assert!(TlsContext::server_from_pem(fixtures::CERT, fixtures::CERT).is_err());
        assert!(TlsContext::server_from_pem(b"not pem", fixtures::KEY).is_err());
    }

    #[test]
    fn concatenated_blocks_are_split() {
        let mut chain = fixtures::CERT.to_vec();
        chain.extend_from_slice(b"\n");
        chain.extend_from_slice(fixtures::CERT);

        let certs = pem_certificates(&chain).unwrap();
        assert_eq!(certs.len(), 2);
        assert_eq!(certs[0], certs[1]);
    }

    #[test]
    fn key_is_found_after_other_blocks() {
        let mut bundle = fixtures::CERT.to_vec();
        bundle.extend_from_slice(fixtures::KEY);

        assert!(pem_private_key(&bundle).is_ok());
        assert!(pem_private_key(fixtures::CERT).is_err());
    }

    #[test]
    fn client_context_requires_valid_name() {
        let context = TlsContext::client("localhost", Verification::Disabled).unwrap();
        assert!(!context.is_server());
        assert!(format!("{context:?}").contains("localhost"));

        let invalid = TlsContext::client("not a name!", Verification::Disabled);
        assert!(invalid.is_err());
    }
}
