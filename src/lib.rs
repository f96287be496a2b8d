//! Switchyard
//!
//! An event-loop network core: TCP servers and clients, UDP nodes, TLS
//! sessions over memory conduits, and an incremental HTTP/1.x parser.
//!
//! Every server, client and UDP node belongs to one [`rt::EventLoop`], a
//! dedicated thread running a single-threaded tokio runtime. All callbacks
//! for a handle run on that thread. Other threads reach the loop through
//! [`rt::LoopHandle::post`].

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod config;
mod error;
pub mod http;
pub mod info;
pub(crate) mod notify;
pub mod rt;
pub mod stream;
#[cfg(feature = "tls")]
pub mod tls;
pub mod udp;

pub use self::error::Error;
pub use self::rt::{DispatchMode, EventLoop, LoopHandle};
pub use self::stream::{StreamClient, StreamServer};
pub use self::udp::UdpNode;

#[cfg(test)]
#[cfg(feature = "tls")]
pub(crate) mod fixtures {
    pub(crate) const CERT: &[u8] = include_bytes!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/certs/localhost.crt"
    ));

    pub(crate) const KEY: &[u8] = include_bytes!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/certs/localhost.key"
    ));
}
