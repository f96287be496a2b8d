//! Error taxonomy shared by every component of the network core.

use std::io;

use thiserror::Error;

pub use crate::http::ParseError;
#[cfg(feature = "tls")]
pub use crate::tls::TlsError;

/// Errors reported by servers, clients, UDP nodes and the dispatch primitive.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Binding or listening failed for a reason other than the two below.
    #[error("bind failed: {0}")]
    BindFailed(#[source] io::Error),

    /// The requested address is already bound by another socket.
    #[error("address in use: {0}")]
    AddressInUse(#[source] io::Error),

    /// The process may not bind the requested address.
    #[error("permission denied: {0}")]
    PermissionDenied(#[source] io::Error),

    /// The operation is not valid in the current state machine state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The target event loop or handle no longer exists.
    #[error("expired: the target loop or handle is gone")]
    Expired,

    /// Malformed HTTP input.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// TLS engine failure, a non-blocking TLS operation that needs more I/O,
    /// or a decode with nothing pending.
    #[cfg(feature = "tls")]
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// Transport I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Classify an error returned while binding or listening.
    pub(crate) fn bind(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::AddrInUse => Error::AddressInUse(error),
            io::ErrorKind::PermissionDenied => Error::PermissionDenied(error),
            _ => Error::BindFailed(error),
        }
    }

    pub(crate) fn illegal_state(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::debug!("illegal state: {}", message);
        Error::IllegalState(message)
    }

    /// True for the end-of-stream report delivered before a node closes.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Io(error) if error.kind() == io::ErrorKind::UnexpectedEof)
    }

    /// True if this is an `IllegalState` error.
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Error::IllegalState(_))
    }
}
