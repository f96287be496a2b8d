//! Information about a TLS connection.
//!
//! TLS information is only meaningful after the handshake is complete.

use crate::info::Protocol;

/// Information about a TLS connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConnectionInfo {
    /// The server name used for this connection, as provided by the SNI
    /// extension.
    pub server_name: Option<String>,

    /// The application layer protocol negotiated for this connection.
    pub alpn: Option<Protocol>,

    /// Negotiated protocol version, e.g. `TLSv1_3`.
    pub version: Option<String>,

    /// Negotiated cipher suite, e.g. `TLS13_AES_256_GCM_SHA384`.
    pub cipher_suite: Option<String>,
}

impl TlsConnectionInfo {
    pub(crate) fn from_connection(conn: &rustls::Connection) -> Self {
        let server_name = match conn {
            rustls::Connection::Server(server) => server
                .server_name()
                .map(|s| s.to_string())
                .filter(|s| !s.is_empty()),
            rustls::Connection::Client(_) => None,
        };

        let alpn = conn
            .alpn_protocol()
            .and_then(|s| std::str::from_utf8(s).ok())
            .and_then(|s| s.parse().ok());

        Self {
            server_name,
            alpn,
            version: conn.protocol_version().map(|v| format!("{v:?}")),
            cipher_suite: conn
                .negotiated_cipher_suite()
                .map(|suite| format!("{:?}", suite.suite())),
        }
    }
}
