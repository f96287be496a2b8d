//! Standalone dialed stream client.
//!
//! A [`StreamClient`] resolves and connects on its event loop, then runs the
//! same connection driver as an accepted server node. With a client
//! [`TlsContext`](crate::tls::TlsContext) configured, the handshake starts as
//! soon as the TCP connection is up and writes issued before it completes are
//! held back until it does.

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::Instrument as _;

use super::conn::{self, ConnHandle, Options};
use super::tcp::TcpStream;
use crate::config::ClientConfig;
use crate::info::{ConnectionId, ConnectionInfo};
use crate::rt::{DispatchMode, LoopHandle, Receiver};
use crate::Error;

/// Callbacks for a [`StreamClient`]. Every method runs on the client's event
/// loop thread.
pub trait ClientHandler: Send + Sync + 'static {
    /// The TCP connection was established, or failed. Closing the client
    /// while it is connecting reports `ConnectionAborted` here.
    fn on_connect(&self, client: &StreamClient, result: Result<(), Error>);

    /// Data (or a read failure) from the peer. End of stream arrives as an
    /// `UnexpectedEof` error, after which the client closes.
    fn on_read(&self, client: &StreamClient, result: Result<Bytes, Error>);

    /// Result of one [`StreamClient::write`].
    fn on_write(&self, client: &StreamClient, result: Result<usize, Error>) {
        let _ = (client, result);
    }

    /// Result of [`StreamClient::shutdown`], or of the automatic shutdown
    /// after a write timeout.
    fn on_shutdown(&self, client: &StreamClient, result: Result<(), Error>) {
        let _ = (client, result);
    }

    /// The connection is closed. Fires once for every client that connected.
    fn on_close(&self, client: &StreamClient) {
        let _ = client;
    }
}

/// Lifecycle of a [`StreamClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Created, not yet dialing.
    Idle,

    /// Resolving and connecting.
    Connecting,

    /// Connected; reads and writes flow.
    Connected,

    /// Closed, or failed to connect.
    Closed,
}

struct ClientInner {
    id: ConnectionId,
    handle: LoopHandle,
    config: ClientConfig,
    handler: Arc<dyn ClientHandler>,

    state: Mutex<ClientState>,
    conn: Mutex<Option<ConnHandle>>,
    info: Mutex<Option<ConnectionInfo>>,
    connecting: Mutex<Option<AbortHandle>>,
}

/// A dialed TCP connection bound to one event loop.
///
/// Cheap to clone; clones refer to the same connection.
#[derive(Clone)]
pub struct StreamClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamClient")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl StreamClient {
    /// Create a client on `handle`'s loop.
    pub fn new<H>(handle: &LoopHandle, config: ClientConfig, handler: H) -> Self
    where
        H: ClientHandler,
    {
        Self {
            inner: Arc::new(ClientInner {
                id: ConnectionId::next(),
                handle: handle.clone(),
                config,
                handler: Arc::new(handler),
                state: Mutex::new(ClientState::Idle),
                conn: Mutex::new(None),
                info: Mutex::new(None),
                connecting: Mutex::new(None),
            }),
        }
    }

    /// Resolve `destination` and connect to `port` on the loop. The outcome is
    /// reported to [`ClientHandler::on_connect`].
    pub fn init(&self, destination: &str, port: u16) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock();
            if *state != ClientState::Idle {
                return Err(Error::illegal_state(format!(
                    "client cannot init while {:?}",
                    *state
                )));
            }
            *state = ClientState::Connecting;
        }

        let inner = self.inner.clone();
        let destination = destination.to_owned();
        let job = move || {
            let span = tracing::debug_span!("connect", id = %inner.id, %destination, port);
            let task = tokio::task::spawn_local(
                dial(inner.clone(), destination, port).instrument(span),
            );
            *inner.connecting.lock() = Some(task.abort_handle());
        };

        if let Err(error) = self.inner.handle.run(job) {
            *self.inner.state.lock() = ClientState::Closed;
            return Err(error);
        }
        Ok(())
    }

    /// Queue `data` for sending. The result arrives in
    /// [`ClientHandler::on_write`].
    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.conn()?.write(data.into())
    }

    /// Shut down the write side after queued writes.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.conn()?.shutdown()
    }

    /// Close the connection, or abandon a connect in progress.
    ///
    /// Closing twice does nothing. Runs directly on the loop thread and is
    /// posted from anywhere else.
    pub fn close(&self) -> Result<DispatchMode, Error> {
        let inner = self.inner.clone();
        self.inner.handle.run(move || inner.close_now())
    }

    /// Id of this connection.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Addresses of the connection, once connected.
    pub fn info(&self) -> Option<ConnectionInfo> {
        *self.inner.info.lock()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.inner.state.lock()
    }

    /// The loop this client runs on.
    pub fn handle(&self) -> &LoopHandle {
        &self.inner.handle
    }

    fn conn(&self) -> Result<ConnHandle, Error> {
        let state = *self.inner.state.lock();
        if state != ClientState::Connected {
            return Err(Error::illegal_state(format!(
                "client is not connected ({state:?})"
            )));
        }
        self.inner.conn.lock().clone().ok_or(Error::Expired)
    }
}

async fn connect(destination: &str, port: u16) -> Result<TcpStream, Error> {
    let mut last = None;
    for addr in tokio::net::lookup_host((destination, port)).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                tracing::trace!(%addr, %error, "connect attempt failed");
                last = Some(error);
            }
        }
    }
    Err(last
        .unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{destination} did not resolve to any address"),
            )
        })
        .into())
}

async fn dial(inner: Arc<ClientInner>, destination: String, port: u16) {
    let result = connect(&destination, port).await;
    inner.connecting.lock().take();

    if *inner.state.lock() != ClientState::Connecting {
        tracing::trace!("connect finished after close");
        return;
    }

    match result.and_then(|stream| inner.start(stream)) {
        Ok(()) => inner.handler.on_connect(&inner.client(), Ok(())),
        Err(error) => {
            tracing::debug!(%error, "connect failed");
            *inner.state.lock() = ClientState::Closed;
            inner.handler.on_connect(&inner.client(), Err(error));
        }
    }
}

impl ClientInner {
    fn client(self: &Arc<Self>) -> StreamClient {
        StreamClient {
            inner: self.clone(),
        }
    }

    /// Register and spawn the driver for a freshly connected stream.
    fn start(self: &Arc<Self>, stream: TcpStream) -> Result<(), Error> {
        let info = stream.info()?;

        let options = Options {
            node: self.config.node.clone(),
            #[cfg(feature = "tls")]
            tls: self
                .config
                .tls
                .as_ref()
                .map(|context| context.new_session())
                .transpose()?,
        };

        tracing::debug!(id = %self.id, remote = %info.remote_addr, "connected");
        self.handle.register(self.id, self.clone());
        let conn = conn::spawn(self.handle.clone(), self.id, stream, options);

        *self.info.lock() = Some(info);
        *self.conn.lock() = Some(conn);
        *self.state.lock() = ClientState::Connected;
        Ok(())
    }

    fn close_now(self: &Arc<Self>) {
        let state = *self.state.lock();
        match state {
            ClientState::Idle => *self.state.lock() = ClientState::Closed,
            ClientState::Connecting => {
                *self.state.lock() = ClientState::Closed;
                if let Some(task) = self.connecting.lock().take() {
                    task.abort();
                }
                tracing::debug!(id = %self.id, "connect aborted");
                self.handler.on_connect(
                    &self.client(),
                    Err(io::Error::from(io::ErrorKind::ConnectionAborted).into()),
                );
            }
            ClientState::Connected => {
                let conn = self.conn.lock().clone();
                if let Some(conn) = conn {
                    if !conn.close() {
                        tracing::trace!(id = %self.id, "client already closing");
                    }
                }
            }
            ClientState::Closed => {}
        }
    }
}

impl Receiver for ClientInner {
    fn on_read(self: Arc<Self>, _: ConnectionId, result: Result<Bytes, Error>) {
        self.handler.on_read(&self.client(), result);
    }

    fn on_write(self: Arc<Self>, _: ConnectionId, result: Result<usize, Error>) {
        self.handler.on_write(&self.client(), result);
    }

    fn on_shutdown(self: Arc<Self>, _: ConnectionId, result: Result<(), Error>) {
        self.handler.on_shutdown(&self.client(), result);
    }

    fn on_close(self: Arc<Self>, _: ConnectionId) {
        *self.state.lock() = ClientState::Closed;
        self.conn.lock().take();
        tracing::debug!(id = %self.id, "client closed");
        self.handler.on_close(&self.client());
    }
}
