//! Connectionless UDP endpoint bound to an event loop.
//!
//! A [`UdpNode`] holds at most one send in flight. [`UdpNode::write`] on the
//! loop thread issues the send immediately; from any other thread the buffer
//! is held by the node and a job is posted to send it, which
//! [`UdpNode::cancel`] can still call off. A write while another send is
//! outstanding fails with [`Error::IllegalState`] instead of replacing the
//! held buffer.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs as _};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::task::AbortHandle;
use tracing::Instrument as _;

use crate::config::NodeConfig;
use crate::info::ConnectionId;
use crate::rt::{DispatchMode, LoopHandle};
use crate::Error;

/// Callbacks for a [`UdpNode`]. Every method runs on the node's event loop
/// thread.
pub trait UdpHandler: Send + Sync + 'static {
    /// A datagram and its sender, or a receive failure.
    fn on_read(&self, node: &UdpNode, result: Result<(Bytes, SocketAddr), Error>);

    /// Result of a send. Not called for a cancelled send.
    fn on_write(&self, node: &UdpNode, result: Result<usize, Error>) {
        let _ = (node, result);
    }

    /// The node is closed.
    fn on_close(&self, node: &UdpNode) {
        let _ = node;
    }
}

/// Where the node's single send slot stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// No send outstanding; `write` is allowed.
    Ready,

    /// A buffer is held and a job to send it is posted to the loop.
    AsyncQueued,

    /// The posted send was cancelled and will be skipped.
    AsyncCancelled,

    /// A send was issued and its completion has not been reported yet.
    Sent,

    /// The node is closed.
    Ended,
}

/// How [`UdpNode::write`] dispatched a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Issued on the loop thread before `write` returned.
    Sent,

    /// Held and posted to the loop.
    AsyncQueued,
}

enum Slot {
    Unbound,
    Bound(std::net::UdpSocket),
    Ready(Arc<tokio::net::UdpSocket>),
    Closed,
}

struct UdpInner {
    id: ConnectionId,
    handle: LoopHandle,
    config: NodeConfig,
    handler: Arc<dyn UdpHandler>,

    socket: Mutex<Slot>,
    destination: Mutex<Option<SocketAddr>>,
    send: Mutex<SendState>,
    held: Mutex<Option<(Bytes, SocketAddr)>>,
    receiving: Mutex<Option<AbortHandle>>,
}

/// A UDP socket driven by one event loop.
///
/// Cheap to clone; clones refer to the same node.
#[derive(Clone)]
pub struct UdpNode {
    inner: Arc<UdpInner>,
}

impl fmt::Debug for UdpNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpNode")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("destination", &self.destination())
            .finish()
    }
}

impl UdpNode {
    /// Create an unbound node on `handle`'s loop.
    pub fn new<H>(handle: &LoopHandle, config: NodeConfig, handler: H) -> Self
    where
        H: UdpHandler,
    {
        Self {
            inner: Arc::new(UdpInner {
                id: ConnectionId::next(),
                handle: handle.clone(),
                config,
                handler: Arc::new(handler),
                socket: Mutex::new(Slot::Unbound),
                destination: Mutex::new(None),
                send: Mutex::new(SendState::Ready),
                held: Mutex::new(None),
                receiving: Mutex::new(None),
            }),
        }
    }

    /// Bind the socket. Port 0 picks an ephemeral port.
    pub fn bind(&self, addr: SocketAddr) -> Result<(), Error> {
        let mut slot = self.inner.socket.lock();
        if !matches!(*slot, Slot::Unbound) {
            return Err(Error::illegal_state("udp node is already bound"));
        }

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(Error::bind)?;
        socket.set_reuse_address(true).map_err(Error::bind)?;
        socket.bind(&addr.into()).map_err(Error::bind)?;
        socket.set_nonblocking(true).map_err(Error::bind)?;

        let socket: std::net::UdpSocket = socket.into();
        tracing::debug!(id = %self.inner.id, addr = ?socket.local_addr().ok(), "udp node bound");
        *slot = Slot::Bound(socket);
        Ok(())
    }

    /// Resolve and remember where [`write`](Self::write) sends to.
    pub fn set_destination(&self, address: &str, port: u16) -> Result<(), Error> {
        let addr = (address, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{address} did not resolve to any address"),
            )
        })?;
        *self.inner.destination.lock() = Some(addr);
        Ok(())
    }

    /// The current destination.
    pub fn destination(&self) -> Option<SocketAddr> {
        *self.inner.destination.lock()
    }

    /// Allow sending to broadcast addresses.
    pub fn set_broadcast(&self, on: bool) -> Result<(), Error> {
        self.inner.with_socket(|socket| socket.set_broadcast(on))
    }

    /// Set the IP time-to-live of outgoing datagrams.
    pub fn set_ttl(&self, ttl: u32) -> Result<(), Error> {
        self.inner.with_socket(|socket| socket.set_ttl(ttl))
    }

    /// Join an IPv4 multicast group on `interface`.
    pub fn join_multicast_v4(&self, group: Ipv4Addr, interface: Ipv4Addr) -> Result<(), Error> {
        self.inner
            .with_socket(|socket| socket.join_multicast_v4(&group, &interface))
    }

    /// Leave an IPv4 multicast group.
    pub fn leave_multicast_v4(&self, group: Ipv4Addr, interface: Ipv4Addr) -> Result<(), Error> {
        self.inner
            .with_socket(|socket| socket.leave_multicast_v4(&group, &interface))
    }

    /// Receive our own multicast datagrams.
    pub fn set_multicast_loop_v4(&self, on: bool) -> Result<(), Error> {
        self.inner
            .with_socket(|socket| socket.set_multicast_loop_v4(on))
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.inner
            .with_socket(|socket| socket.local_addr())?
            .as_socket()
            .ok_or_else(|| Error::illegal_state("udp node is not an inet socket"))
    }

    /// State of the send slot.
    pub fn state(&self) -> SendState {
        *self.inner.send.lock()
    }

    /// Id of this node.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Send `data` to the destination.
    ///
    /// Fails with [`Error::IllegalState`] without a destination or while a
    /// previous send is outstanding. The outcome arrives in
    /// [`UdpHandler::on_write`].
    pub fn write(&self, data: impl Into<Bytes>) -> Result<SendMode, Error> {
        let inner = &self.inner;
        let destination = self
            .destination()
            .ok_or_else(|| Error::illegal_state("udp node has no destination"))?;
        let on_loop = inner.handle.is_loop_thread();

        {
            let mut send = inner.send.lock();
            if *send != SendState::Ready {
                return Err(Error::illegal_state(format!(
                    "udp send already outstanding ({:?})",
                    *send
                )));
            }
            *send = if on_loop {
                SendState::Sent
            } else {
                SendState::AsyncQueued
            };
        }

        if on_loop {
            inner.issue(data.into(), destination);
            return Ok(SendMode::Sent);
        }

        *inner.held.lock() = Some((data.into(), destination));
        let job = {
            let inner = inner.clone();
            move || inner.flush()
        };
        if let Err(error) = inner.handle.post(job) {
            inner.held.lock().take();
            *inner.send.lock() = SendState::Ready;
            return Err(error);
        }
        Ok(SendMode::AsyncQueued)
    }

    /// Call off a queued send. Returns true if a send was cancelled; it will
    /// be skipped without an [`on_write`](UdpHandler::on_write) and the node
    /// returns to [`SendState::Ready`].
    pub fn cancel(&self) -> bool {
        let mut send = self.inner.send.lock();
        if *send == SendState::AsyncQueued {
            *send = SendState::AsyncCancelled;
            tracing::trace!(id = %self.inner.id, "udp send cancelled");
            true
        } else {
            false
        }
    }

    /// Start delivering datagrams to [`UdpHandler::on_read`].
    pub fn start(&self) -> Result<DispatchMode, Error> {
        if let Slot::Unbound | Slot::Closed = *self.inner.socket.lock() {
            return Err(Error::illegal_state("udp node is not bound"));
        }
        let inner = self.inner.clone();
        self.inner.handle.run(move || inner.start_now())
    }

    /// Stop receiving. The socket stays open.
    pub fn stop(&self) -> Result<DispatchMode, Error> {
        let inner = self.inner.clone();
        self.inner.handle.run(move || {
            if let Some(task) = inner.receiving.lock().take() {
                tracing::trace!(id = %inner.id, "udp receive stopped");
                task.abort();
            }
        })
    }

    /// Close the socket. Closing twice does nothing.
    pub fn close(&self) -> Result<DispatchMode, Error> {
        let inner = self.inner.clone();
        self.inner.handle.run(move || inner.close_now())
    }
}

impl UdpInner {
    fn node(self: &Arc<Self>) -> UdpNode {
        UdpNode {
            inner: self.clone(),
        }
    }

    fn with_socket<R>(&self, f: impl FnOnce(SockRef<'_>) -> io::Result<R>) -> Result<R, Error> {
        match &*self.socket.lock() {
            Slot::Bound(socket) => Ok(f(SockRef::from(socket))?),
            Slot::Ready(socket) => Ok(f(SockRef::from(&**socket))?),
            Slot::Unbound => Err(Error::illegal_state("udp node is not bound")),
            Slot::Closed => Err(Error::illegal_state("udp node is closed")),
        }
    }

    /// Register the socket with the loop on first use. Loop thread only.
    fn ready_socket(&self) -> Result<Arc<tokio::net::UdpSocket>, Error> {
        let mut slot = self.socket.lock();
        match std::mem::replace(&mut *slot, Slot::Closed) {
            Slot::Bound(socket) => {
                let socket = Arc::new(tokio::net::UdpSocket::from_std(socket)?);
                *slot = Slot::Ready(socket.clone());
                Ok(socket)
            }
            Slot::Ready(socket) => {
                *slot = Slot::Ready(socket.clone());
                Ok(socket)
            }
            Slot::Unbound => {
                *slot = Slot::Unbound;
                Err(Error::illegal_state("udp node is not bound"))
            }
            Slot::Closed => Err(Error::illegal_state("udp node is closed")),
        }
    }

    /// The posted half of an off-loop write.
    fn flush(self: Arc<Self>) {
        let held = self.held.lock().take();
        {
            let mut send = self.send.lock();
            match *send {
                SendState::AsyncQueued => *send = SendState::Sent,
                SendState::AsyncCancelled => {
                    tracing::trace!(id = %self.id, "skipping cancelled udp send");
                    *send = SendState::Ready;
                    return;
                }
                _ => return,
            }
        }
        match held {
            Some((data, destination)) => self.issue(data, destination),
            None => self.complete(Err(Error::illegal_state("udp send buffer is missing"))),
        }
    }

    /// Send now, or as soon as the socket is writable. Loop thread only.
    fn issue(self: &Arc<Self>, data: Bytes, destination: SocketAddr) {
        let inner = self.clone();
        let socket = match self.ready_socket() {
            Ok(socket) => socket,
            Err(error) => {
                tokio::task::spawn_local(async move { inner.complete(Err(error)) });
                return;
            }
        };

        let attempt = socket.try_send_to(&data, destination);
        let span = tracing::trace_span!("udp_send", id = %self.id, %destination);
        tokio::task::spawn_local(
            async move {
                let result = match attempt {
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                        socket.send_to(&data, destination).await
                    }
                    result => result,
                };
                inner.complete(result.map_err(Error::from));
            }
            .instrument(span),
        );
    }

    fn complete(self: &Arc<Self>, result: Result<usize, Error>) {
        {
            let mut send = self.send.lock();
            if *send == SendState::Ended {
                return;
            }
            *send = SendState::Ready;
        }
        self.handler.on_write(&self.node(), result);
    }

    fn start_now(self: &Arc<Self>) {
        if self.receiving.lock().is_some() {
            return;
        }
        let socket = match self.ready_socket() {
            Ok(socket) => socket,
            Err(error) => {
                self.handler.on_read(&self.node(), Err(error));
                return;
            }
        };

        let span = tracing::debug_span!("udp_recv", id = %self.id);
        let task = tokio::task::spawn_local(receive(self.clone(), socket).instrument(span));
        *self.receiving.lock() = Some(task.abort_handle());
    }

    fn close_now(self: &Arc<Self>) {
        let previous = std::mem::replace(&mut *self.socket.lock(), Slot::Closed);
        if let Slot::Closed = previous {
            return;
        }

        *self.send.lock() = SendState::Ended;
        self.held.lock().take();
        if let Some(task) = self.receiving.lock().take() {
            task.abort();
        }
        drop(previous);

        tracing::debug!(id = %self.id, "udp node closed");
        self.handler.on_close(&self.node());
    }
}

async fn receive(inner: Arc<UdpInner>, socket: Arc<tokio::net::UdpSocket>) {
    let mut buf = vec![0u8; inner.config.read_buffer_size];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                inner.handler.on_read(&inner.node(), Ok((data, from)));
            }
            Err(error) => {
                let transient = matches!(
                    error.kind(),
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                );
                inner.handler.on_read(&inner.node(), Err(error.into()));
                if !transient {
                    tracing::debug!("udp receive loop ended");
                    break;
                }
            }
        }
    }
    inner.receiving.lock().take();
}
