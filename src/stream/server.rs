//! Stream server: a listener, its accept loop, and the registry of accepted
//! client nodes.
//!
//! The server owns every node it accepts. Nodes are handed out as
//! [`WeakClient`] references, which hold only the node's id and a weak link
//! back to the server, and resolve the node through the registry on each
//! call. A reference outliving its node (or its server) reports
//! [`Error::Expired`] instead of dangling.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tracing::Instrument as _;

use super::conn::{self, ConnHandle, Options};
use super::tcp::{self, TcpStream};
use crate::config::ServerConfig;
use crate::info::{ConnectionId, ConnectionInfo};
use crate::notify;
use crate::rt::{DispatchMode, LoopHandle, Receiver};
use crate::Error;

/// Per-client data owned by the server while the node is registered.
pub type UserData = Box<dyn Any + Send>;

/// Callbacks for a [`StreamServer`]. Every method runs on the server's event
/// loop thread.
///
/// No registry lock is held while a callback runs, so callbacks may use the
/// server and any [`WeakClient`] freely.
pub trait ServerHandler: Send + Sync + 'static {
    /// A connection is pending. Call [`StreamServer::accept`] to take it; a
    /// connection left unaccepted is dropped when this returns.
    fn on_connection(&self, server: &StreamServer);

    /// Data (or a read failure) from a client. End of stream arrives as an
    /// `UnexpectedEof` error, after which the client closes.
    fn on_client_read(
        &self,
        server: &StreamServer,
        client: WeakClient,
        result: Result<Bytes, Error>,
    ) {
        let _ = (server, client, result);
    }

    /// Result of one [`WeakClient::write`].
    fn on_client_write(
        &self,
        server: &StreamServer,
        client: WeakClient,
        result: Result<usize, Error>,
    ) {
        let _ = (server, client, result);
    }

    /// Result of [`WeakClient::shutdown`].
    fn on_client_shutdown(
        &self,
        server: &StreamServer,
        client: WeakClient,
        result: Result<(), Error>,
    ) {
        let _ = (server, client, result);
    }

    /// Last event for a client. The node is still registered while this runs
    /// and is removed right after.
    fn on_client_close(&self, server: &StreamServer, client: WeakClient) {
        let _ = (server, client);
    }

    /// The listener and every client are closed.
    fn on_server_close(&self, server: &StreamServer) {
        let _ = server;
    }

    /// Data to attach to a newly accepted client.
    fn on_client_user_data_alloc(&self, id: ConnectionId) -> Option<UserData> {
        let _ = id;
        None
    }

    /// Releases the data attached to a client, once, after
    /// [`on_client_close`](Self::on_client_close).
    fn on_client_user_data_dealloc(&self, id: ConnectionId, data: UserData) {
        let _ = id;
        drop(data);
    }
}

/// Lifecycle of a [`StreamServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Created, not yet bound.
    Uninit,

    /// Bound and accepting.
    Listening,

    /// Close requested, waiting for clients to finish.
    Closing,

    /// Listener and all clients are gone.
    Closed,
}

struct ClientNode {
    conn: ConnHandle,
    info: ConnectionInfo,
    user_data: Option<UserData>,
}

struct ServerInner {
    id: ConnectionId,
    handle: LoopHandle,
    config: ServerConfig,
    handler: Arc<dyn ServerHandler>,

    state: Mutex<ServerState>,
    registry: Mutex<HashMap<ConnectionId, ClientNode>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Mutex<Option<notify::Sender>>,
    listener_closed: AtomicBool,

    /// The connection offered to `on_connection`. Only touched on the loop.
    pending: Mutex<Option<TcpStream>>,
    in_connection: AtomicBool,
}

/// A TCP server bound to one event loop.
///
/// Cheap to clone; clones refer to the same server.
#[derive(Clone)]
pub struct StreamServer {
    inner: Arc<ServerInner>,
}

impl fmt::Debug for StreamServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamServer")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .field("clients", &self.len())
            .finish()
    }
}

impl StreamServer {
    /// Create a server on `handle`'s loop. Nothing is bound until
    /// [`init`](Self::init).
    pub fn new<H>(handle: &LoopHandle, config: ServerConfig, handler: H) -> Self
    where
        H: ServerHandler,
    {
        Self {
            inner: Arc::new(ServerInner {
                id: ConnectionId::next(),
                handle: handle.clone(),
                config,
                handler: Arc::new(handler),
                state: Mutex::new(ServerState::Uninit),
                registry: Mutex::new(HashMap::new()),
                local_addr: Mutex::new(None),
                shutdown: Mutex::new(None),
                listener_closed: AtomicBool::new(false),
                pending: Mutex::new(None),
                in_connection: AtomicBool::new(false),
            }),
        }
    }

    /// Bind to `address:port` and start accepting.
    ///
    /// Binding happens before this returns, so bind failures are reported
    /// here and no client is ever registered for a server that failed to
    /// bind. Port 0 picks an ephemeral port; see
    /// [`local_addr`](Self::local_addr).
    pub fn init(&self, address: &str, port: u16) -> Result<(), Error> {
        let inner = &self.inner;
        let (listener, shutdown) = {
            let mut state = inner.state.lock();
            if *state != ServerState::Uninit {
                return Err(Error::illegal_state(format!(
                    "server cannot init while {:?}",
                    *state
                )));
            }

            let addr = resolve(address, port)?;
            let listener =
                tcp::bind_listener(addr, inner.config.backlog, inner.config.reuse_address)?;
            let local = listener.local_addr().map(tcp::make_canonical)?;

            let (tx, rx) = notify::channel();
            *inner.local_addr.lock() = Some(local);
            *inner.shutdown.lock() = Some(tx);
            *state = ServerState::Listening;
            tracing::info!(id = %inner.id, addr = %local, "server listening");
            (listener, rx)
        };

        let job = {
            let inner = inner.clone();
            move || inner.install(listener, shutdown)
        };
        if let Err(error) = inner.handle.run(job) {
            *inner.state.lock() = ServerState::Closed;
            return Err(error);
        }
        Ok(())
    }

    /// Take the pending connection.
    ///
    /// Only valid on the loop thread while [`ServerHandler::on_connection`]
    /// runs. Anywhere else, or once the registry holds `max_connections`
    /// clients, this returns an invalid reference and leaves the registry
    /// untouched.
    pub fn accept(&self) -> WeakClient {
        let inner = &self.inner;
        if !inner.handle.is_loop_thread() || !inner.in_connection.load(Ordering::Acquire) {
            tracing::debug!("accept called outside on_connection");
            return WeakClient::invalid();
        }
        if *inner.state.lock() != ServerState::Listening {
            return WeakClient::invalid();
        }
        let Some(stream) = inner.pending.lock().take() else {
            tracing::debug!("no pending connection to accept");
            return WeakClient::invalid();
        };

        if inner.registry.lock().len() >= inner.config.max_connections {
            tracing::warn!(
                max = inner.config.max_connections,
                "connection limit reached, dropping connection"
            );
            return WeakClient::invalid();
        }

        let info = match stream.info() {
            Ok(info) => info,
            Err(error) => {
                tracing::debug!(%error, "accepted connection has no address");
                return WeakClient::invalid();
            }
        };

        let options = Options {
            node: inner.config.node.clone(),
            #[cfg(feature = "tls")]
            tls: match inner.config.tls.as_ref().map(|context| context.new_session()) {
                Some(Ok(session)) => Some(session),
                Some(Err(error)) => {
                    tracing::warn!(%error, "failed to start tls session");
                    return WeakClient::invalid();
                }
                None => None,
            },
        };

        let id = ConnectionId::next();
        let user_data = inner.handler.on_client_user_data_alloc(id);
        inner.handle.register(id, inner.clone());
        let conn = conn::spawn(inner.handle.clone(), id, stream, options);

        tracing::debug!(%id, remote = %info.remote_addr, "accepted client");
        inner.registry.lock().insert(
            id,
            ClientNode {
                conn,
                info,
                user_data,
            },
        );
        WeakClient::new(id, inner)
    }

    /// Close every client and then the listener.
    ///
    /// On the loop thread every client is told to close before this returns
    /// ([`DispatchMode::Direct`]). From any other thread the close is posted
    /// ([`DispatchMode::Posted`]) and has not happened yet on return. Either
    /// way [`ServerHandler::on_server_close`] marks completion.
    pub fn close(&self) -> Result<DispatchMode, Error> {
        let inner = self.inner.clone();
        self.inner.handle.run(move || inner.close_now())
    }

    /// Run `f` for every client under the registry lock.
    ///
    /// `f` must not call back into this server or any [`WeakClient`]; the lock
    /// is not re-entrant. Use [`clients`](Self::clients) to act on clients.
    pub fn foreach<F>(&self, mut f: F)
    where
        F: FnMut(ConnectionId, &ConnectionInfo),
    {
        for (id, node) in self.inner.registry.lock().iter() {
            f(*id, &node.info);
        }
    }

    /// Run `f` for every client's user data under the registry lock. The same
    /// restrictions as [`foreach`](Self::foreach) apply.
    pub fn update_clients<F>(&self, mut f: F)
    where
        F: FnMut(ConnectionId, &mut Option<UserData>),
    {
        for (id, node) in self.inner.registry.lock().iter_mut() {
            f(*id, &mut node.user_data);
        }
    }

    /// References to every registered client.
    pub fn clients(&self) -> Vec<WeakClient> {
        let ids: Vec<_> = self.inner.registry.lock().keys().copied().collect();
        ids.into_iter()
            .map(|id| WeakClient::new(id, &self.inner))
            .collect()
    }

    /// Reference to the client `id`, invalid if it is not registered.
    pub fn get(&self, id: ConnectionId) -> WeakClient {
        if self.inner.registry.lock().contains_key(&id) {
            WeakClient::new(id, &self.inner)
        } else {
            WeakClient::invalid()
        }
    }

    /// Close the client `id`. It leaves the registry once its close callback
    /// has run. Returns false if no such client is registered.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let conn = self.inner.registry.lock().get(&id).map(|node| node.conn.clone());
        match conn {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// True if no client is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.registry.lock().is_empty()
    }

    /// Address the listener is bound to, once [`init`](Self::init) succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.inner.state.lock()
    }

    /// Id of the server itself.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The loop this server runs on.
    pub fn handle(&self) -> &LoopHandle {
        &self.inner.handle
    }

    /// Post `job` to the server's loop.
    pub fn post<F>(&self, job: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.handle.post(job)
    }
}

fn resolve(address: &str, port: u16) -> Result<SocketAddr, Error> {
    (address, port)
        .to_socket_addrs()
        .map_err(Error::bind)?
        .next()
        .ok_or_else(|| {
            Error::bind(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("{address} did not resolve to any address"),
            ))
        })
}

impl ServerInner {
    fn server(self: &Arc<Self>) -> StreamServer {
        StreamServer {
            inner: self.clone(),
        }
    }

    /// Hand the bound listener to the loop and start accepting.
    fn install(self: Arc<Self>, listener: std::net::TcpListener, shutdown: notify::Receiver) {
        if *self.state.lock() != ServerState::Listening {
            tracing::debug!(id = %self.id, "server closed before listening");
            self.listener_closed.store(true, Ordering::Release);
            self.maybe_finish_close();
            return;
        }

        let listener = match TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(error) => {
                tracing::error!(id = %self.id, %error, "failed to register listener");
                *self.state.lock() = ServerState::Closing;
                self.listener_closed.store(true, Ordering::Release);
                self.maybe_finish_close();
                return;
            }
        };

        let addr = *self.local_addr.lock();
        let span = tracing::debug_span!("server", id = %self.id, addr = ?addr);
        tokio::task::spawn_local(accept_loop(self, listener, shutdown).instrument(span));
    }

    fn on_accept(self: &Arc<Self>, stream: TcpStream) {
        if *self.state.lock() != ServerState::Listening {
            return;
        }

        *self.pending.lock() = Some(stream);
        self.in_connection.store(true, Ordering::Release);
        self.handler.on_connection(&self.server());
        self.in_connection.store(false, Ordering::Release);

        if self.pending.lock().take().is_some() {
            tracing::debug!("connection was not accepted, dropping it");
        }
    }

    fn close_now(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            match *state {
                ServerState::Listening => *state = ServerState::Closing,
                ServerState::Uninit => {
                    *state = ServerState::Closed;
                    return;
                }
                ServerState::Closing | ServerState::Closed => return,
            }
        }
        tracing::debug!(id = %self.id, "closing server");

        if let Some(mut shutdown) = self.shutdown.lock().take() {
            shutdown.send();
        }

        let nodes: Vec<ConnHandle> = self
            .registry
            .lock()
            .values()
            .map(|node| node.conn.clone())
            .collect();
        for node in nodes {
            node.close();
        }

        self.maybe_finish_close();
    }

    fn maybe_finish_close(self: &Arc<Self>) {
        if !self.listener_closed.load(Ordering::Acquire) || !self.registry.lock().is_empty() {
            return;
        }
        {
            let mut state = self.state.lock();
            if *state != ServerState::Closing {
                return;
            }
            *state = ServerState::Closed;
        }
        tracing::debug!(id = %self.id, "server closed");
        self.handler.on_server_close(&self.server());
    }

    fn client(self: &Arc<Self>, id: ConnectionId) -> WeakClient {
        WeakClient::new(id, self)
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener, shutdown: notify::Receiver) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            result = listener.accept() => match result {
                Ok((stream, remote)) => {
                    tracing::trace!(%remote, "incoming connection");
                    inner.on_accept(TcpStream::server(stream, remote));
                }
                Err(error) => tracing::warn!(%error, "accept failed"),
            },
        }
    }

    drop(listener);
    tracing::debug!("listener closed");
    inner.listener_closed.store(true, Ordering::Release);
    inner.maybe_finish_close();
}

impl Receiver for ServerInner {
    fn on_read(self: Arc<Self>, id: ConnectionId, result: Result<Bytes, Error>) {
        self.handler
            .on_client_read(&self.server(), self.client(id), result);
    }

    fn on_write(self: Arc<Self>, id: ConnectionId, result: Result<usize, Error>) {
        self.handler
            .on_client_write(&self.server(), self.client(id), result);
    }

    fn on_shutdown(self: Arc<Self>, id: ConnectionId, result: Result<(), Error>) {
        self.handler
            .on_client_shutdown(&self.server(), self.client(id), result);
    }

    fn on_close(self: Arc<Self>, id: ConnectionId) {
        self.handler.on_client_close(&self.server(), self.client(id));

        let node = self.registry.lock().remove(&id);
        tracing::debug!(%id, "client removed");
        if let Some(data) = node.and_then(|node| node.user_data) {
            self.handler.on_client_user_data_dealloc(id, data);
        }

        self.maybe_finish_close();
    }
}

/// Non-owning reference to a client node of a [`StreamServer`].
///
/// Safe to use from any thread. Operations on a node that has gone away
/// fail with [`Error::Expired`].
#[derive(Clone)]
pub struct WeakClient {
    id: Option<ConnectionId>,
    server: Weak<ServerInner>,
}

impl fmt::Debug for WeakClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakClient")
            .field("id", &self.id)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl WeakClient {
    fn new(id: ConnectionId, server: &Arc<ServerInner>) -> Self {
        Self {
            id: Some(id),
            server: Arc::downgrade(server),
        }
    }

    fn invalid() -> Self {
        Self {
            id: None,
            server: Weak::new(),
        }
    }

    /// Id of the referenced node. `None` for a reference that never pointed
    /// at a node.
    pub fn id(&self) -> Option<ConnectionId> {
        self.id
    }

    /// True while the node is registered with a live server.
    pub fn is_valid(&self) -> bool {
        self.with_node(|_| ()).is_ok()
    }

    /// Queue `data` for sending. The result arrives in
    /// [`ServerHandler::on_client_write`].
    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.conn()?.write(data.into())
    }

    /// Shut down the write side after queued writes.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.conn()?.shutdown()
    }

    /// Close the node. Closing a node that is already closing does nothing.
    pub fn close(&self) -> Result<(), Error> {
        if !self.conn()?.close() {
            tracing::trace!(id = ?self.id, "client already closing");
        }
        Ok(())
    }

    /// True once the node has been asked to close.
    pub fn is_closing(&self) -> bool {
        self.conn().map_or(true, |conn| conn.is_closing())
    }

    /// Addresses of the connection.
    pub fn info(&self) -> Result<ConnectionInfo, Error> {
        self.with_node(|node| node.info)
    }

    /// Run `f` on the node's user data if it is a `T`. Runs under the
    /// registry lock.
    pub fn with_user_data<T, R, F>(&self, f: F) -> Result<Option<R>, Error>
    where
        T: 'static,
        F: FnOnce(&mut T) -> R,
    {
        self.with_node(|node| {
            node.user_data
                .as_mut()
                .and_then(|data| data.downcast_mut::<T>())
                .map(f)
        })
    }

    fn conn(&self) -> Result<ConnHandle, Error> {
        self.with_node(|node| node.conn.clone())
    }

    fn with_node<R>(&self, f: impl FnOnce(&mut ClientNode) -> R) -> Result<R, Error> {
        let id = self.id.ok_or(Error::Expired)?;
        let server = self.server.upgrade().ok_or(Error::Expired)?;
        let mut registry = server.registry.lock();
        registry.get_mut(&id).map(f).ok_or(Error::Expired)
    }
}
