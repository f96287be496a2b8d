//! Stream connections: the TCP server, the dialed client, and the driver
//! that runs each connection on its event loop.

pub mod client;
pub(crate) mod conn;
pub mod server;
pub mod tcp;

pub use self::client::{ClientHandler, ClientState, StreamClient};
pub use self::server::{ServerHandler, ServerState, StreamServer, UserData, WeakClient};
pub use self::tcp::TcpStream;
