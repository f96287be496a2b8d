//! TLS sessions over memory conduits.
//!
//! A [`TlsSession`] never touches a socket. Ciphertext received from the
//! transport is appended to the session's read conduit, and ciphertext the
//! engine wants to send accumulates in its write conduit until the transport
//! takes it with [`TlsSession::take_outgoing`]. The engine itself is
//! [`rustls`].

use thiserror::Error;

mod context;
mod session;
mod verify;

pub use self::context::TlsContext;
pub use self::session::TlsSession;
pub use self::verify::Verification;

/// Errors from a TLS session.
///
/// `WantRead` and `WantWrite` are not failures: they tell the caller which
/// kind of I/O must happen before the operation can make progress.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum TlsError {
    /// More ciphertext must be received before progress is possible.
    #[error("tls session wants more ciphertext")]
    WantRead,

    /// The write conduit must be flushed to the peer before calling again.
    #[error("tls session has ciphertext to flush")]
    WantWrite,

    /// The handshake failed. The session is permanently unusable.
    #[error("tls handshake failed: {0}")]
    Handshake(#[source] rustls::Error),

    /// The engine rejected traffic after the handshake. The session is
    /// permanently unusable.
    #[error("tls protocol error: {0}")]
    Protocol(#[source] rustls::Error),

    /// Misuse of the session or a failure outside the engine.
    #[error("tls error: {0}")]
    Generic(String),

    /// Decode was called with nothing in the read conduit.
    #[error("nothing pending to decode")]
    NothingPending,
}

impl TlsError {
    pub(crate) fn generic(message: impl Into<String>) -> Self {
        TlsError::Generic(message.into())
    }

    /// True for `WantRead` and `WantWrite`.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TlsError::WantRead | TlsError::WantWrite)
    }
}
