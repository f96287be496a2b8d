use thiserror::Error;

/// Why the grammar rejected its input.
///
/// [`name`](Self::name) and [`description`](Self::description) follow the
/// `HPE_*` naming used by incremental HTTP tokenizers, so diagnostics stay
/// familiar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ParseErrorKind {
    /// Input ended in the middle of a message.
    InvalidEofState,
    /// The message head exceeded the size or field-count limit.
    HeaderOverflow,
    /// Malformed `HTTP/x.y` token.
    InvalidVersion,
    /// Malformed status line.
    InvalidStatus,
    /// Malformed request method.
    InvalidMethod,
    /// Malformed or missing request target.
    InvalidUrl,
    /// Invalid character in a header name or value.
    InvalidHeaderToken,
    /// `Content-Length` is not a number.
    InvalidContentLength,
    /// `Content-Length` conflicts with another framing header.
    UnexpectedContentLength,
    /// Malformed chunk size line.
    InvalidChunkSize,
    /// A request's `Transfer-Encoding` does not end in `chunked`.
    InvalidTransferEncoding,
    /// A line ending was expected.
    LfExpected,
}

impl ParseErrorKind {
    /// Symbolic error name, e.g. `HPE_INVALID_EOF_STATE`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidEofState => "HPE_INVALID_EOF_STATE",
            Self::HeaderOverflow => "HPE_HEADER_OVERFLOW",
            Self::InvalidVersion => "HPE_INVALID_VERSION",
            Self::InvalidStatus => "HPE_INVALID_STATUS",
            Self::InvalidMethod => "HPE_INVALID_METHOD",
            Self::InvalidUrl => "HPE_INVALID_URL",
            Self::InvalidHeaderToken => "HPE_INVALID_HEADER_TOKEN",
            Self::InvalidContentLength => "HPE_INVALID_CONTENT_LENGTH",
            Self::UnexpectedContentLength => "HPE_UNEXPECTED_CONTENT_LENGTH",
            Self::InvalidChunkSize => "HPE_INVALID_CHUNK_SIZE",
            Self::InvalidTransferEncoding => "HPE_INVALID_TRANSFER_ENCODING",
            Self::LfExpected => "HPE_LF_EXPECTED",
        }
    }

    /// Human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::InvalidEofState => "stream ended at an unexpected time",
            Self::HeaderOverflow => "too many header bytes seen; overflow detected",
            Self::InvalidVersion => "invalid HTTP version",
            Self::InvalidStatus => "invalid HTTP status code",
            Self::InvalidMethod => "invalid HTTP method",
            Self::InvalidUrl => "invalid URL",
            Self::InvalidHeaderToken => "invalid character in header",
            Self::InvalidContentLength => "invalid character in content-length header",
            Self::UnexpectedContentLength => "unexpected content-length header",
            Self::InvalidChunkSize => "invalid character in chunk size header",
            Self::InvalidTransferEncoding => "request has invalid transfer-encoding",
            Self::LfExpected => "LF character expected",
        }
    }
}

/// Malformed HTTP input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{}: {}", .kind.name(), .kind.description())]
pub struct ParseError {
    kind: ParseErrorKind,
}

impl ParseError {
    pub(crate) fn new(kind: ParseErrorKind) -> Self {
        tracing::trace!(name = kind.name(), "http parse error");
        Self { kind }
    }

    /// The error kind.
    pub fn kind(&self) -> ParseErrorKind {
        self.kind
    }

    /// Symbolic error name, e.g. `HPE_INVALID_EOF_STATE`.
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Human-readable description.
    pub fn description(&self) -> &'static str {
        self.kind.description()
    }
}

impl From<ParseErrorKind> for ParseError {
    fn from(kind: ParseErrorKind) -> Self {
        Self::new(kind)
    }
}
