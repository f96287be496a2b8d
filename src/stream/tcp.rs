//! TCP stream and listener helpers with better address semantics for servers.
//!
//! When a server accepts a connection, it receives the remote `SocketAddr`
//! alongside the stream. On some platforms this information is not available
//! later via `TcpStream::peer_addr`, so the wrapper retains it for the
//! lifetime of the stream.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::ops::Deref;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::ToSocketAddrs;

use crate::info::ConnectionInfo;
use crate::Error;

/// Canonicalize a socket address, converting IPv4 addresses which are
/// mapped into IPv6 addresses into standard IPv4 addresses.
pub(crate) fn make_canonical(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        std::net::IpAddr::V4(_) => addr,
        std::net::IpAddr::V6(ip) => {
            if let Some(ip) = ip.to_ipv4_mapped() {
                SocketAddr::new(std::net::IpAddr::V4(ip), addr.port())
            } else {
                addr
            }
        }
    }
}

/// Bind and listen on `addr` without entering any runtime.
///
/// The returned listener is non-blocking, ready to be handed to the event
/// loop with `tokio::net::TcpListener::from_std`.
pub(crate) fn bind_listener(
    addr: SocketAddr,
    backlog: u32,
    reuse_address: bool,
) -> Result<std::net::TcpListener, Error> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::bind)?;
    socket.set_reuse_address(reuse_address).map_err(Error::bind)?;
    socket.bind(&addr.into()).map_err(Error::bind)?;
    socket
        .listen(i32::try_from(backlog).unwrap_or(i32::MAX))
        .map_err(Error::bind)?;
    socket.set_nonblocking(true).map_err(Error::bind)?;
    tracing::debug!(%addr, backlog, "listening");
    Ok(socket.into())
}

/// A TCP Stream, wrapping `tokio::net::TcpStream` with better
/// address semantics for servers.
pub struct TcpStream {
    stream: tokio::net::TcpStream,
    remote: Option<SocketAddr>,
}

impl fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.stream.fmt(f)
    }
}

impl TcpStream {
    /// Connect to a remote address. See `tokio::net::TcpStream::connect`.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        Ok(Self::client(stream))
    }

    /// Wrap a dialed connection, which has valid `peer_addr` and `local_addr`.
    pub fn client(inner: tokio::net::TcpStream) -> Self {
        Self {
            stream: inner,
            remote: None,
        }
    }

    /// Wrap an accepted connection with the remote address reported by accept.
    pub fn server(inner: tokio::net::TcpStream, remote: SocketAddr) -> Self {
        Self {
            stream: inner,
            remote: Some(make_canonical(remote)),
        }
    }

    /// Remote address of the connection.
    ///
    /// For accepted connections this is the address reported by accept.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self.remote {
            Some(addr) => Ok(addr),
            None => self.stream.peer_addr().map(make_canonical),
        }
    }

    /// Local address of the connection.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr().map(make_canonical)
    }

    /// Addresses of both ends.
    pub fn info(&self) -> io::Result<ConnectionInfo> {
        Ok(ConnectionInfo {
            local_addr: self.local_addr()?,
            remote_addr: self.peer_addr()?,
        })
    }

    /// Unwraps the `TcpStream`, returning the inner `tokio::net::TcpStream`.
    pub fn into_inner(self) -> tokio::net::TcpStream {
        self.stream
    }
}

impl Deref for TcpStream {
    type Target = tokio::net::TcpStream;
    fn deref(&self) -> &Self::Target {
        &self.stream
    }
}
