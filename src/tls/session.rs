use std::cmp;
use std::fmt;
use std::io::{self, Read as _, Write as _};

use bytes::{Buf as _, Bytes, BytesMut};
use rustls::{ClientConnection, Connection, ServerConnection};

use super::context::Role;
use super::{TlsContext, TlsError};
use crate::info::TlsConnectionInfo;

const READ_ATTEMPT_START: usize = 1024;
const READ_ATTEMPT_MAX: usize = 16 * 1024;

/// Memory-backed byte queue between the engine and the transport.
#[derive(Debug, Default)]
struct Conduit {
    buf: BytesMut,
}

impl Conduit {
    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn len(&self) -> usize {
        self.buf.len()
    }
}

impl io::Read for Conduit {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = cmp::min(out.len(), self.buf.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        Ok(n)
    }
}

impl io::Write for Conduit {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One TLS session between plaintext application bytes and ciphertext wire
/// bytes.
///
/// Select the role with [`accept`](Self::accept) or
/// [`connect`](Self::connect), then call [`handshake`](Self::handshake)
/// whenever new ciphertext arrives or the write conduit has been flushed,
/// until it returns `Ok`. Application data is only accepted by
/// [`encode`](Self::encode) once the handshake is done.
///
/// After a fatal engine error the session keeps the error and returns it
/// from every later call. Any alert the engine produced is left in the
/// write conduit for the caller to flush.
pub struct TlsSession {
    context: TlsContext,
    engine: Option<Connection>,
    handshake_done: bool,
    peer_closed: bool,
    write_conduit: Conduit,
    read_conduit: Conduit,
    failure: Option<TlsError>,
}

impl fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSession")
            .field("role", &self.engine.as_ref().map(role_name))
            .field("handshake_done", &self.handshake_done)
            .field("outgoing", &self.write_conduit.len())
            .field("incoming", &self.read_conduit.len())
            .field("failure", &self.failure)
            .finish()
    }
}

fn role_name(engine: &Connection) -> &'static str {
    match engine {
        Connection::Client(_) => "client",
        Connection::Server(_) => "server",
    }
}

impl TlsSession {
    /// A session with no role selected yet.
    pub fn new(context: TlsContext) -> Self {
        Self {
            context,
            engine: None,
            handshake_done: false,
            peer_closed: false,
            write_conduit: Conduit::default(),
            read_conduit: Conduit::default(),
            failure: None,
        }
    }

    /// Take the server role.
    pub fn accept(&mut self) -> Result<(), TlsError> {
        if self.engine.is_some() {
            return Err(TlsError::generic("session role already selected"));
        }
        let Role::Server(config) = self.context.role() else {
            return Err(TlsError::generic("accept requires a server context"));
        };
        let engine = ServerConnection::new(config.clone()).map_err(TlsError::Handshake)?;
        self.engine = Some(engine.into());
        Ok(())
    }

    /// Take the client role. The ClientHello is queued in the write conduit
    /// by the first call to [`handshake`](Self::handshake).
    pub fn connect(&mut self) -> Result<(), TlsError> {
        if self.engine.is_some() {
            return Err(TlsError::generic("session role already selected"));
        }
        let Role::Client {
            config,
            server_name,
        } = self.context.role()
        else {
            return Err(TlsError::generic("connect requires a client context"));
        };
        let engine = ClientConnection::new(config.clone(), server_name.clone())
            .map_err(TlsError::Handshake)?;
        self.engine = Some(engine.into());
        Ok(())
    }

    /// Drive the handshake one step.
    ///
    /// `Ok` may still leave bytes in the write conduit (the final flight);
    /// callers flush after every call.
    pub fn handshake(&mut self) -> Result<(), TlsError> {
        self.check()?;
        if self.handshake_done {
            return Ok(());
        }

        self.pump_incoming()?;
        self.flush_engine();

        let engine = self.engine()?;
        if !engine.is_handshaking() {
            tracing::trace!(role = role_name(engine), "tls handshake complete");
            self.handshake_done = true;
            return Ok(());
        }

        if self.write_conduit.is_empty() {
            Err(TlsError::WantRead)
        } else {
            Err(TlsError::WantWrite)
        }
    }

    /// Encrypt `plaintext` and return all ciphertext waiting to be sent.
    pub fn encode(&mut self, plaintext: &[u8]) -> Result<Bytes, TlsError> {
        self.check()?;
        if !self.handshake_done {
            return Err(TlsError::generic("cannot encode before the handshake is done"));
        }

        let mut rest = plaintext;
        while !rest.is_empty() {
            let result = self.engine_mut()?.writer().write(rest);
            let written = match result {
                Ok(n) => n,
                Err(error) => return Err(self.fail(TlsError::generic(error.to_string()))),
            };
            self.flush_engine();
            if written == 0 {
                return Err(self.fail(TlsError::generic("tls engine refused plaintext")));
            }
            rest = &rest[written..];
        }

        self.flush_engine();
        Ok(self.take_outgoing())
    }

    /// Append `ciphertext` to the read conduit, then decode.
    pub fn decode(&mut self, ciphertext: &[u8]) -> Result<Bytes, TlsError> {
        self.receive(ciphertext);
        self.decode_pending()
    }

    /// Decode whatever is already pending in the read conduit.
    ///
    /// Plaintext is read in attempts starting at 1 KiB. When the engine has
    /// nothing ready while ciphertext is still queued, the attempt size
    /// doubles, more ciphertext is fed from the conduit, and the read is
    /// retried. `WantRead` is surfaced when nothing was decoded and either the
    /// conduit is drained or the attempt has reached 16 KiB.
    ///
    /// An empty result with `Ok` means the peer sent close_notify.
    pub fn decode_pending(&mut self) -> Result<Bytes, TlsError> {
        self.check()?;
        if self.read_conduit.is_empty() && self.buffered_plaintext()? == 0 {
            return Err(TlsError::NothingPending);
        }

        self.pump_incoming()?;
        if !self.handshake_done && !self.engine()?.is_handshaking() {
            self.handshake_done = true;
        }

        let mut plaintext = BytesMut::new();
        let mut attempt = READ_ATTEMPT_START;
        loop {
            let mut chunk = vec![0u8; attempt];
            let result = self.engine_mut()?.reader().read(&mut chunk);
            match result {
                Ok(0) => {
                    tracing::trace!("tls peer sent close_notify");
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => {
                    plaintext.extend_from_slice(&chunk[..n]);
                    if n == attempt {
                        attempt = cmp::min(attempt * 2, READ_ATTEMPT_MAX);
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    if self.read_conduit.is_empty() || attempt >= READ_ATTEMPT_MAX {
                        break;
                    }
                    attempt = cmp::min(attempt * 2, READ_ATTEMPT_MAX);
                    self.pump_incoming()?;
                }
                Err(error) => {
                    return Err(self.fail(TlsError::generic(error.to_string())));
                }
            }
        }

        self.flush_engine();
        if plaintext.is_empty() && !self.peer_closed {
            return Err(TlsError::WantRead);
        }
        Ok(plaintext.freeze())
    }

    /// Append ciphertext received from the transport to the read conduit.
    pub fn receive(&mut self, ciphertext: &[u8]) {
        self.read_conduit.buf.extend_from_slice(ciphertext);
    }

    /// Queue a close_notify alert in the write conduit.
    pub fn shutdown(&mut self) -> Result<(), TlsError> {
        self.check()?;
        self.engine_mut()?.send_close_notify();
        self.flush_engine();
        Ok(())
    }

    /// Drain the write conduit.
    pub fn take_outgoing(&mut self) -> Bytes {
        self.write_conduit.buf.split().freeze()
    }

    /// True when the write conduit holds ciphertext for the peer.
    pub fn has_outgoing(&self) -> bool {
        !self.write_conduit.is_empty()
    }

    /// True once the handshake has completed.
    pub fn is_handshake_done(&self) -> bool {
        self.handshake_done
    }

    /// Alias of [`is_handshake_done`](Self::is_handshake_done).
    pub fn is_finished(&self) -> bool {
        self.handshake_done
    }

    /// True once the peer has sent close_notify.
    pub fn is_peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// The fatal error this session is stuck on, if any.
    pub fn failure(&self) -> Option<&TlsError> {
        self.failure.as_ref()
    }

    /// Name of the negotiated cipher suite.
    pub fn cipher_name(&self) -> Option<String> {
        self.engine
            .as_ref()?
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite()))
    }

    /// Negotiated session parameters.
    pub fn info(&self) -> TlsConnectionInfo {
        self.engine
            .as_ref()
            .map(TlsConnectionInfo::from_connection)
            .unwrap_or_default()
    }

    fn check(&self) -> Result<(), TlsError> {
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn engine(&self) -> Result<&Connection, TlsError> {
        self.engine
            .as_ref()
            .ok_or_else(|| TlsError::generic("no role selected; call accept or connect"))
    }

    fn engine_mut(&mut self) -> Result<&mut Connection, TlsError> {
        self.engine
            .as_mut()
            .ok_or_else(|| TlsError::generic("no role selected; call accept or connect"))
    }

    fn buffered_plaintext(&mut self) -> Result<usize, TlsError> {
        let result = self.engine_mut()?.process_new_packets();
        match result {
            Ok(state) => Ok(state.plaintext_bytes_to_read()),
            Err(error) => Err(self.engine_error(error)),
        }
    }

    /// Feed the read conduit to the engine. Stops early when the engine's
    /// plaintext buffer is full; the rest stays queued for the next call.
    fn pump_incoming(&mut self) -> Result<(), TlsError> {
        while !self.read_conduit.is_empty() {
            let engine = self
                .engine
                .as_mut()
                .ok_or_else(|| TlsError::generic("no role selected; call accept or connect"))?;

            match engine.read_tls(&mut self.read_conduit) {
                Ok(0) => break,
                Ok(_) => {}
                Err(error) => {
                    tracing::trace!("tls engine deferred input: {error}");
                    break;
                }
            }

            if let Err(error) = engine.process_new_packets() {
                return Err(self.engine_error(error));
            }
        }
        Ok(())
    }

    /// Move everything the engine wants to send into the write conduit.
    fn flush_engine(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        while engine.wants_write() {
            match engine.write_tls(&mut self.write_conduit) {
                Ok(0) => break,
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!("tls engine write failed: {error}");
                    break;
                }
            }
        }
    }

    fn engine_error(&mut self, error: rustls::Error) -> TlsError {
        let error = if self.handshake_done {
            TlsError::Protocol(error)
        } else {
            TlsError::Handshake(error)
        };
        self.fail(error)
    }

    fn fail(&mut self, error: TlsError) -> TlsError {
        tracing::debug!("tls session failed: {error}");
        self.flush_engine();
        self.failure = Some(error.clone());
        error
    }
}

#[cfg(all(test, feature = "tls-ring"))]
mod tests {
    use super::*;

    use crate::fixtures;
    use crate::tls::Verification;

    fn pair() -> (TlsSession, TlsSession) {
        let server = TlsContext::server_from_pem(fixtures::CERT, fixtures::KEY)
            .unwrap()
            .new_session()
            .unwrap();
        let client = TlsContext::client("localhost", Verification::Disabled)
            .unwrap()
            .new_session()
            .unwrap();
        (server, client)
    }

    /// Shuttle ciphertext between the two sessions until both are done.
    fn handshake(server: &mut TlsSession, client: &mut TlsSession) {
        for _ in 0..16 {
            let c = client.handshake();
            let to_server = client.take_outgoing();
            server.receive(&to_server);

            let s = server.handshake();
            let to_client = server.take_outgoing();
            client.receive(&to_client);

            if c.is_ok() && s.is_ok() && client.handshake().is_ok() {
                assert!(!client.has_outgoing());
                return;
            }
        }
        panic!("handshake did not complete");
    }

    #[test]
    fn handshake_signals_want_write_then_want_read() {
        let (mut server, mut client) = pair();

        assert!(matches!(client.handshake(), Err(TlsError::WantWrite)));
        let hello = client.take_outgoing();
        assert!(!hello.is_empty());
        assert!(matches!(client.handshake(), Err(TlsError::WantRead)));

        assert!(matches!(server.handshake(), Err(TlsError::WantRead)));
        server.receive(&hello);
        assert!(matches!(server.handshake(), Err(TlsError::WantWrite)));
    }

    #[test]
    fn round_trip_after_handshake() {
        let (mut server, mut client) = pair();
        handshake(&mut server, &mut client);
        assert!(server.is_handshake_done());
        assert!(client.is_finished());
        assert!(client.cipher_name().is_some());

        let wire = client.encode(b"hello, world").unwrap();
        let plain = server.decode(&wire).unwrap();
        assert_eq!(&plain[..], b"hello, world");

        let wire = server.encode(b"goodbye").unwrap();
        let plain = client.decode(&wire).unwrap();
        assert_eq!(&plain[..], b"goodbye");
    }

    #[test]
    fn large_records_decode_fully() {
        let (mut server, mut client) = pair();
        handshake(&mut server, &mut client);

        let message: Vec<u8> = (0..100_000u32).map(|n| (n % 251) as u8).collect();
        let wire = client.encode(&message).unwrap();

        let mut received = server.decode(&wire).unwrap().to_vec();
        loop {
            match server.decode_pending() {
                Ok(more) => received.extend_from_slice(&more),
                Err(TlsError::NothingPending) => break,
                Err(error) => panic!("unexpected error: {error}"),
            }
        }
        assert_eq!(received, message);
    }

    #[test]
    fn partial_record_wants_read() {
        let (mut server, mut client) = pair();
        handshake(&mut server, &mut client);

        let wire = client.encode(b"split me").unwrap();
        let (head, tail) = wire.split_at(wire.len() / 2);
        assert!(matches!(server.decode(head), Err(TlsError::WantRead)));
        assert_eq!(&server.decode(tail).unwrap()[..], b"split me");
    }

    #[test]
    fn decode_with_nothing_pending() {
        let (mut server, mut client) = pair();
        handshake(&mut server, &mut client);
        assert!(matches!(
            server.decode_pending(),
            Err(TlsError::NothingPending)
        ));
    }

    #[test]
    fn encode_before_handshake_fails() {
        let (_, mut client) = pair();
        assert!(matches!(client.encode(b"early"), Err(TlsError::Generic(_))));
    }

    #[test]
    fn role_must_be_selected_once() {
        let context = TlsContext::server_from_pem(fixtures::CERT, fixtures::KEY).unwrap();
        let mut session = TlsSession::new(context);
        assert!(matches!(session.handshake(), Err(TlsError::Generic(_))));
        assert!(session.connect().is_err());
        session.accept().unwrap();
        assert!(session.accept().is_err());
    }

    #[test]
    fn garbage_poisons_session() {
        let (mut server, _) = pair();
        server.receive(b"this is not a tls record at all\r\n\r\n");
        let error = server.handshake().unwrap_err();
        assert!(matches!(error, TlsError::Handshake(_)));
        assert!(server.failure().is_some());

        // The same failure is reported from here on.
        assert!(matches!(server.handshake(), Err(TlsError::Handshake(_))));
        assert!(matches!(server.decode(b"more"), Err(TlsError::Handshake(_))));
    }

    #[test]
    fn close_notify_is_observed() {
        let (mut server, mut client) = pair();
        handshake(&mut server, &mut client);

        client.shutdown().unwrap();
        let alert = client.take_outgoing();
        let plain = server.decode(&alert).unwrap();
        assert!(plain.is_empty());
        assert!(server.is_peer_closed());
    }

    #[test]
    fn info_reports_server_name() {
        let (mut server, mut client) = pair();
        handshake(&mut server, &mut client);

        let info = server.info();
        assert_eq!(info.server_name.as_deref(), Some("localhost"));
        assert!(info.version.is_some());
        assert_eq!(info.cipher_suite, server.cipher_name());
    }
}
