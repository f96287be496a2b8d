//! Incremental HTTP/1.x parsing.
//!
//! [`grammar`] tokenizes bytes into events, [`HttpParser`] collects those
//! events into a [`PropertyBag`], and [`HttpReader`] buffers a connection's
//! byte stream into complete messages.

mod error;
pub mod grammar;
mod parser;
mod property;
mod reader;

pub use self::error::{ParseError, ParseErrorKind};
pub use self::grammar::{Direction, ParserType};
pub use self::parser::HttpParser;
pub use self::property::{
    Headers, PropertyBag, DEFAULT_ACCEPT, DEFAULT_CONTENT_TYPE, DEFAULT_SERVER,
    DEFAULT_USER_AGENT,
};
pub use self::reader::HttpReader;
