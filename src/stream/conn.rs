//! The connection driver: one task per stream connection on its event loop.
//!
//! A driver owns the socket and reports every event to the receiver
//! registered under its [`ConnectionId`]. Owners talk to the driver through a
//! [`ConnHandle`], which only queues commands, so it is safe to use from any
//! callback without re-entering the driver.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument as _;

use super::tcp::TcpStream;
use crate::config::NodeConfig;
use crate::info::ConnectionId;
use crate::rt::{LoopHandle, Receiver};
use crate::Error;

#[cfg(feature = "tls")]
use crate::tls::{TlsError, TlsSession};

#[derive(Debug)]
enum Command {
    Write(Bytes),
    Shutdown,
    Close,
}

/// Work for the writer task. `len` is the caller's plaintext length, or
/// `None` for bytes the driver produced itself (TLS records).
#[derive(Debug)]
enum Outgoing {
    Data { wire: Bytes, len: Option<usize> },
    Shutdown,
}

/// Completions reported back by the writer task, in queue order.
#[derive(Debug)]
enum Written {
    Data {
        len: Option<usize>,
        result: Result<(), Error>,
    },
    Shutdown(Result<(), Error>),
}

/// Per-connection settings handed to [`spawn`].
#[derive(Debug, Default)]
pub(crate) struct Options {
    pub(crate) node: NodeConfig,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<TlsSession>,
}

/// Queues commands for a running driver.
#[derive(Debug, Clone)]
pub(crate) struct ConnHandle {
    tx: mpsc::UnboundedSender<Command>,
    closing: Arc<AtomicBool>,
}

impl ConnHandle {
    pub(crate) fn write(&self, data: Bytes) -> Result<(), Error> {
        if self.is_closing() {
            return Err(Error::illegal_state("connection is closing"));
        }
        self.send(Command::Write(data))
    }

    pub(crate) fn shutdown(&self) -> Result<(), Error> {
        if self.is_closing() {
            return Err(Error::illegal_state("connection is closing"));
        }
        self.send(Command::Shutdown)
    }

    /// Begin closing. Returns false if the connection was already closing.
    pub(crate) fn close(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(Command::Close);
        true
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        self.tx.send(command).map_err(|_| Error::Expired)
    }
}

/// Start a driver for `stream` on the current loop.
///
/// Must be called on the loop thread of `handle`. The receiver for `id` should
/// be registered before the first event can fire, i.e. before the caller
/// yields back to the loop.
pub(crate) fn spawn(
    handle: LoopHandle,
    id: ConnectionId,
    stream: TcpStream,
    options: Options,
) -> ConnHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (out, outgoing) = mpsc::unbounded_channel();
    let (done, written) = mpsc::unbounded_channel();
    let closing = Arc::new(AtomicBool::new(false));

    let span = tracing::debug_span!(
        "conn",
        %id,
        remote = ?stream.peer_addr().ok(),
    );

    let (reader, writer) = stream.into_inner().into_split();
    let timeout = options.node.write_timeout;
    let writer = tokio::task::spawn_local(
        write_loop(writer, outgoing, done, timeout).instrument(span.clone()),
    );

    let driver = Driver {
        id,
        handle,
        config: options.node,
        rx,
        closing: closing.clone(),
        out,
        written,
        writer,
        in_flight: VecDeque::new(),
        #[cfg(feature = "tls")]
        tls: options.tls,
        #[cfg(feature = "tls")]
        pending: VecDeque::new(),
        write_shut: false,
    };

    tokio::task::spawn_local(driver.run(reader).instrument(span));
    ConnHandle { tx, closing }
}

/// Drain the outgoing queue onto the socket.
///
/// Runs beside the driver so reads keep flowing while the peer is slow to
/// drain. Once a write fails the stream is unusable and later data fails
/// without touching the socket.
async fn write_loop(
    mut half: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    done: mpsc::UnboundedSender<Written>,
    timeout: Option<Duration>,
) {
    let mut failed = false;
    while let Some(item) = outgoing.recv().await {
        let written = match item {
            Outgoing::Data { wire, len } => {
                let result = if failed {
                    Err(io::Error::from(io::ErrorKind::BrokenPipe).into())
                } else {
                    send(&mut half, &wire, timeout).await
                };
                failed |= result.is_err();
                Written::Data { len, result }
            }
            Outgoing::Shutdown => Written::Shutdown(half.shutdown().await.map_err(Error::from)),
        };
        if done.send(written).is_err() {
            break;
        }
    }
}

async fn send(
    half: &mut OwnedWriteHalf,
    wire: &[u8],
    timeout: Option<Duration>,
) -> Result<(), Error> {
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, half.write_all(wire)).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut).into()),
        },
        None => half.write_all(wire).await.map_err(Error::from),
    }
}

fn aborted() -> Error {
    io::Error::from(io::ErrorKind::ConnectionAborted).into()
}

/// What the read loop should do after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

struct Driver {
    id: ConnectionId,
    handle: LoopHandle,
    config: NodeConfig,
    rx: mpsc::UnboundedReceiver<Command>,
    closing: Arc<AtomicBool>,
    out: mpsc::UnboundedSender<Outgoing>,
    written: mpsc::UnboundedReceiver<Written>,
    writer: JoinHandle<()>,

    /// Lengths of caller writes handed to the writer and not yet reported.
    in_flight: VecDeque<usize>,
    #[cfg(feature = "tls")]
    tls: Option<TlsSession>,

    /// Plaintext written before the TLS handshake finished.
    #[cfg(feature = "tls")]
    pending: VecDeque<Bytes>,
    write_shut: bool,
}

impl Driver {
    async fn run(mut self, mut reader: OwnedReadHalf) {
        let mut buf = BytesMut::with_capacity(self.config.read_buffer_size);

        let mut flow = self.start();
        while flow == Flow::Continue {
            if self.handle.receiver(self.id).is_none() {
                tracing::trace!("owner is gone");
                break;
            }

            buf.reserve(self.config.read_buffer_size);
            flow = tokio::select! {
                command = self.rx.recv() => match command {
                    Some(Command::Write(data)) => self.write(data),
                    Some(Command::Shutdown) => self.shutdown(),
                    Some(Command::Close) | None => Flow::Close,
                },
                Some(written) = self.written.recv() => self.on_written(written),
                result = reader.read_buf(&mut buf) => match result {
                    Ok(0) => {
                        tracing::trace!("end of stream");
                        self.emit_read(Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()));
                        Flow::Close
                    }
                    Ok(_) => {
                        let data = buf.split().freeze();
                        self.on_data(data)
                    }
                    Err(error) => {
                        self.emit_read(Err(error.into()));
                        Flow::Close
                    }
                },
            };
        }

        drop(reader);
        self.finish();
    }

    /// Kick off the TLS handshake. A client session queues its ClientHello
    /// here; a server session has nothing to say yet.
    fn start(&mut self) -> Flow {
        #[cfg(feature = "tls")]
        if self.tls.is_some() {
            if let Err(error) = self.drive_handshake() {
                self.emit_read(Err(error));
                return Flow::Close;
            }
        }
        Flow::Continue
    }

    fn on_data(&mut self, data: Bytes) -> Flow {
        #[cfg(feature = "tls")]
        if self.tls.is_some() {
            return self.on_ciphertext(data);
        }
        self.emit_read(Ok(data));
        Flow::Continue
    }

    fn write(&mut self, data: Bytes) -> Flow {
        if self.write_shut {
            self.emit_write(Err(Error::illegal_state("write side is shut down")));
            return Flow::Continue;
        }

        let len = data.len();
        match self.seal(data) {
            Ok(Some(wire)) => self.queue(wire, Some(len)),
            Ok(None) => {}
            Err(error) => self.emit_write(Err(error)),
        }
        Flow::Continue
    }

    /// Turn plaintext into wire bytes. `None` means the data was queued until
    /// the handshake completes.
    fn seal(&mut self, data: Bytes) -> Result<Option<Bytes>, Error> {
        #[cfg(feature = "tls")]
        if let Some(session) = self.tls.as_mut() {
            if !session.is_handshake_done() {
                tracing::trace!(len = data.len(), "holding write until handshake completes");
                self.pending.push_back(data);
                return Ok(None);
            }
            return Ok(Some(session.encode(&data)?));
        }
        Ok(Some(data))
    }

    /// Hand wire bytes to the writer task. A write the writer never reports
    /// stays in `in_flight` and is failed when the connection closes.
    fn queue(&mut self, wire: Bytes, len: Option<usize>) {
        if let Some(len) = len {
            self.in_flight.push_back(len);
        }
        if self.out.send(Outgoing::Data { wire, len }).is_err() {
            tracing::debug!("writer is gone");
        }
    }

    fn on_written(&mut self, written: Written) -> Flow {
        match written {
            Written::Data {
                len: Some(len),
                result,
            } => {
                self.in_flight.pop_front();
                let timed_out = matches!(
                    &result,
                    Err(Error::Io(error)) if error.kind() == io::ErrorKind::TimedOut
                );
                self.emit_write(result.map(|_| len));

                if timed_out && !self.write_shut {
                    tracing::debug!("write timed out, shutting down write side");
                    return self.shutdown();
                }
                Flow::Continue
            }
            Written::Data {
                len: None,
                result: Err(error),
            } => {
                if self.write_shut {
                    tracing::trace!(%error, "record write failed after shutdown");
                    return Flow::Continue;
                }
                self.emit_read(Err(error));
                Flow::Close
            }
            Written::Data { len: None, .. } => Flow::Continue,
            Written::Shutdown(result) => {
                self.emit_shutdown(result);
                Flow::Continue
            }
        }
    }

    fn shutdown(&mut self) -> Flow {
        if self.write_shut {
            self.emit_shutdown(Ok(()));
            return Flow::Continue;
        }

        #[cfg(feature = "tls")]
        if let Some(session) = self.tls.as_mut() {
            if session.shutdown().is_ok() {
                self.flush_tls();
            }
        }

        self.write_shut = true;
        if self.out.send(Outgoing::Shutdown).is_err() {
            self.emit_shutdown(Err(aborted()));
        }
        Flow::Continue
    }

    fn finish(mut self) {
        self.closing.store(true, Ordering::Release);
        self.writer.abort();
        self.abort_writes();

        match self.handle.unregister(self.id) {
            Some(receiver) => {
                tracing::trace!("closed");
                receiver.on_close(self.id);
            }
            None => tracing::trace!("closed without owner"),
        }
    }

    /// Report every write and shutdown that will never reach the socket.
    fn abort_writes(&mut self) {
        self.rx.close();

        while let Ok(written) = self.written.try_recv() {
            match written {
                Written::Data {
                    len: Some(len),
                    result,
                } => {
                    self.in_flight.pop_front();
                    self.emit_write(result.map(|_| len));
                }
                Written::Shutdown(result) => self.emit_shutdown(result),
                Written::Data { len: None, .. } => {}
            }
        }

        let mut lost = self.in_flight.len();
        self.in_flight.clear();
        #[cfg(feature = "tls")]
        {
            lost += self.pending.len();
            self.pending.clear();
        }

        let mut shutdowns = 0;
        while let Ok(command) = self.rx.try_recv() {
            match command {
                Command::Write(_) => lost += 1,
                Command::Shutdown => shutdowns += 1,
                Command::Close => {}
            }
        }

        if lost > 0 {
            tracing::debug!(writes = lost, "aborting unfinished writes");
        }
        for _ in 0..lost {
            self.emit_write(Err(aborted()));
        }
        for _ in 0..shutdowns {
            self.emit_shutdown(Err(aborted()));
        }
    }

    fn receiver(&self) -> Option<Arc<dyn Receiver>> {
        self.handle.receiver(self.id)
    }

    fn emit_read(&self, result: Result<Bytes, Error>) {
        if let Some(receiver) = self.receiver() {
            receiver.on_read(self.id, result);
        }
    }

    fn emit_write(&self, result: Result<usize, Error>) {
        if let Some(receiver) = self.receiver() {
            receiver.on_write(self.id, result);
        }
    }

    fn emit_shutdown(&self, result: Result<(), Error>) {
        if let Some(receiver) = self.receiver() {
            receiver.on_shutdown(self.id, result);
        }
    }
}

#[cfg(feature = "tls")]
impl Driver {
    fn on_ciphertext(&mut self, data: Bytes) -> Flow {
        let Some(session) = self.tls.as_mut() else {
            return Flow::Continue;
        };
        session.receive(&data);

        if !session.is_handshake_done() {
            match self.drive_handshake() {
                Ok(true) => self.release_pending(),
                Ok(false) => return Flow::Continue,
                Err(error) => {
                    self.emit_read(Err(error));
                    return Flow::Close;
                }
            }
        }

        loop {
            let Some(session) = self.tls.as_mut() else {
                return Flow::Continue;
            };
            let result = session.decode_pending();
            let peer_closed = session.is_peer_closed();
            self.flush_tls();

            match result {
                Ok(plaintext) if plaintext.is_empty() => {
                    self.emit_read(Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()));
                    return Flow::Close;
                }
                Ok(plaintext) => {
                    self.emit_read(Ok(plaintext));
                    if peer_closed {
                        self.emit_read(Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()));
                        return Flow::Close;
                    }
                }
                Err(TlsError::WantRead | TlsError::NothingPending) => return Flow::Continue,
                Err(error) => {
                    self.emit_read(Err(error.into()));
                    return Flow::Close;
                }
            }
        }
    }

    /// Step the handshake until it needs more input. `Ok(true)` once done.
    fn drive_handshake(&mut self) -> Result<bool, Error> {
        loop {
            let Some(session) = self.tls.as_mut() else {
                return Ok(true);
            };
            let step = session.handshake();
            self.flush_tls();

            match step {
                Ok(()) => {
                    if let Some(session) = self.tls.as_ref() {
                        tracing::debug!(
                            cipher = session.cipher_name().as_deref().unwrap_or("unknown"),
                            "tls handshake complete"
                        );
                    }
                    return Ok(true);
                }
                Err(TlsError::WantWrite) => continue,
                Err(TlsError::WantRead) => return Ok(false),
                Err(error) => {
                    tracing::debug!(%error, "tls handshake failed");
                    return Err(error.into());
                }
            }
        }
    }

    /// Encode and queue writes held back during the handshake.
    fn release_pending(&mut self) {
        while let Some(data) = self.pending.pop_front() {
            self.write(data);
        }
    }

    /// Queue whatever the session produced for the wire.
    fn flush_tls(&mut self) {
        let Some(session) = self.tls.as_mut() else {
            return;
        };
        if !session.has_outgoing() {
            return;
        }
        let wire = session.take_outgoing();
        self.queue(wire, None);
    }
}
