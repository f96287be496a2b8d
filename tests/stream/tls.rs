use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use switchyard::config::{ClientConfig, ServerConfig};
use switchyard::stream::{ClientHandler, ServerHandler, StreamClient, StreamServer, WeakClient};
use switchyard::tls::{TlsContext, Verification};
use switchyard::{Error, EventLoop};

const CERT: &[u8] = include_bytes!("../certs/localhost.crt");
const KEY: &[u8] = include_bytes!("../certs/localhost.key");
const TIMEOUT: Duration = Duration::from_secs(5);

struct Echo;

impl ServerHandler for Echo {
    fn on_connection(&self, server: &StreamServer) {
        server.accept();
    }

    fn on_client_read(&self, _: &StreamServer, client: WeakClient, result: Result<Bytes, Error>) {
        if let Ok(data) = result {
            let _ = client.write(data);
        }
    }
}

#[derive(Debug)]
enum Event {
    Connect(Result<(), Error>),
    Read(Result<Bytes, Error>),
    Write(Result<usize, Error>),
    Close,
}

struct Recorder {
    events: Mutex<mpsc::Sender<Event>>,
    /// Written from inside `on_connect`, before any handshake byte arrives.
    greeting: Option<&'static str>,
}

impl Recorder {
    fn emit(&self, event: Event) {
        let _ = self.events.lock().unwrap().send(event);
    }
}

impl ClientHandler for Recorder {
    fn on_connect(&self, client: &StreamClient, result: Result<(), Error>) {
        let connected = result.is_ok();
        self.emit(Event::Connect(result));
        if let (true, Some(greeting)) = (connected, self.greeting) {
            client.write(greeting).unwrap();
        }
    }

    fn on_read(&self, _: &StreamClient, result: Result<Bytes, Error>) {
        self.emit(Event::Read(result));
    }

    fn on_write(&self, _: &StreamClient, result: Result<usize, Error>) {
        self.emit(Event::Write(result));
    }

    fn on_close(&self, _: &StreamClient) {
        self.emit(Event::Close);
    }
}

fn tls_server(event_loop: &EventLoop) -> StreamServer {
    let context = TlsContext::server_from_pem(CERT, KEY).unwrap();
    let server = StreamServer::new(
        event_loop.handle(),
        ServerConfig::default().with_tls(context),
        Echo,
    );
    server.init("127.0.0.1", 0).unwrap();
    server
}

fn tls_client(
    event_loop: &EventLoop,
    verification: Verification,
    greeting: Option<&'static str>,
) -> (StreamClient, mpsc::Receiver<Event>) {
    let context = TlsContext::client("localhost", verification).unwrap();
    let (tx, rx) = mpsc::channel();
    let client = StreamClient::new(
        event_loop.handle(),
        ClientConfig::default().with_tls(context),
        Recorder {
            events: Mutex::new(tx),
            greeting,
        },
    );
    (client, rx)
}

#[test]
fn echo_over_tls() {
    let _ = tracing_subscriber::fmt::try_init();
    let server_loop = EventLoop::with_name("tls-server").unwrap();
    let client_loop = EventLoop::with_name("tls-client").unwrap();

    let server = tls_server(&server_loop);
    let port = server.local_addr().unwrap().port();
    let (client, events) = tls_client(&client_loop, Verification::Disabled, None);

    client.init("127.0.0.1", port).unwrap();
    assert!(matches!(events.recv_timeout(TIMEOUT).unwrap(), Event::Connect(Ok(()))));

    // Written before the handshake is done; held until it is.
    client.write("over tls").unwrap();

    let mut echoed = Vec::new();
    while echoed.len() < b"over tls".len() {
        match events.recv_timeout(TIMEOUT).unwrap() {
            Event::Read(Ok(data)) => echoed.extend_from_slice(&data),
            Event::Write(Ok(8)) => {}
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(echoed, b"over tls");

    client.close().unwrap();
    loop {
        match events.recv_timeout(TIMEOUT).unwrap() {
            Event::Close => break,
            Event::Write(Ok(8)) => {}
            other => panic!("unexpected event {other:?}"),
        }
    }

    let deadline = std::time::Instant::now() + TIMEOUT;
    while !server.is_empty() {
        assert!(std::time::Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn untrusted_server_closes_the_client() {
    let _ = tracing_subscriber::fmt::try_init();
    let event_loop = EventLoop::new().unwrap();

    let server = tls_server(&event_loop);
    let port = server.local_addr().unwrap().port();
    let roots = Verification::with_roots(Vec::new()).unwrap();
    let (client, events) = tls_client(&event_loop, roots, Some("never sent"));

    client.init("127.0.0.1", port).unwrap();
    assert!(matches!(events.recv_timeout(TIMEOUT).unwrap(), Event::Connect(Ok(()))));
    match events.recv_timeout(TIMEOUT).unwrap() {
        Event::Read(Err(Error::Tls(_))) => {}
        other => panic!("unexpected event {other:?}"),
    }

    // The greeting was held for the handshake and is failed, not dropped.
    match events.recv_timeout(TIMEOUT).unwrap() {
        Event::Write(Err(Error::Io(error))) => {
            assert_eq!(error.kind(), std::io::ErrorKind::ConnectionAborted)
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(events.recv_timeout(TIMEOUT).unwrap(), Event::Close));
}
