//! Configuration for servers, clients and their connection nodes.

use std::time::Duration;

#[cfg(feature = "tls")]
use crate::tls::TlsContext;

/// Default size of the per-connection read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 128;

/// Default cap on simultaneously registered clients.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Per-connection settings shared by accepted and dialed nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Bytes reserved for each transport read.
    pub read_buffer_size: usize,

    /// Time allowed for a single write before the node reports `TimedOut`
    /// and shuts down its write side. `None` waits forever.
    pub write_timeout: Option<Duration>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_timeout: None,
        }
    }
}

impl NodeConfig {
    /// Set the read buffer size. Zero is raised to one byte.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Set the write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }
}

/// Settings for a [`StreamServer`](crate::stream::server::StreamServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen backlog passed to `listen(2)`.
    pub backlog: u32,

    /// Accepts beyond this many registered clients are refused.
    pub max_connections: usize,

    /// Set `SO_REUSEADDR` on the listening socket.
    pub reuse_address: bool,

    /// Settings applied to every accepted node.
    pub node: NodeConfig,

    /// Run a server-role TLS session on every accepted node.
    #[cfg(feature = "tls")]
    pub tls: Option<TlsContext>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            reuse_address: true,
            node: NodeConfig::default(),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

impl ServerConfig {
    /// Set the listen backlog.
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the client cap.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Toggle `SO_REUSEADDR`.
    pub fn with_reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }

    /// Replace the node settings.
    pub fn with_node(mut self, node: NodeConfig) -> Self {
        self.node = node;
        self
    }

    /// Serve TLS with the given server context.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, context: TlsContext) -> Self {
        self.tls = Some(context);
        self
    }
}

/// Settings for a standalone [`StreamClient`](crate::stream::client::StreamClient).
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Settings applied to the dialed node.
    pub node: NodeConfig,

    /// Run a client-role TLS session on the connection.
    #[cfg(feature = "tls")]
    pub tls: Option<TlsContext>,
}

impl ClientConfig {
    /// Replace the node settings.
    pub fn with_node(mut self, node: NodeConfig) -> Self {
        self.node = node;
        self
    }

    /// Speak TLS with the given client context.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, context: TlsContext) -> Self {
        self.tls = Some(context);
        self
    }
}
