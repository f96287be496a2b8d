use bytes::{Buf as _, Bytes, BytesMut};

use super::error::ParseError;
use super::grammar::ParserType;
use super::parser::HttpParser;
use super::property::PropertyBag;

/// Turns the byte stream of one connection into complete messages.
///
/// Bytes are buffered until they form a full message. Pipelined messages in
/// one read are all returned. After a message that upgrades the connection,
/// parsing stops and the remaining bytes are available from
/// [`take_upgraded`](Self::take_upgraded).
#[derive(Debug)]
pub struct HttpReader {
    parser: HttpParser,
    buffer: BytesMut,
    upgraded: bool,
}

impl HttpReader {
    /// A reader for messages of `kind`.
    pub fn new(kind: ParserType) -> Self {
        Self {
            parser: HttpParser::new(kind),
            buffer: BytesMut::new(),
            upgraded: false,
        }
    }

    /// Feed bytes from the connection and collect every message they complete.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<PropertyBag>, ParseError> {
        self.buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        while !self.upgraded && !self.buffer.is_empty() {
            let consumed = self.parser.execute(&self.buffer)?;
            self.buffer.advance(consumed);

            if !self.parser.is_message_complete() {
                break;
            }
            messages.push(self.next_message());
        }
        Ok(messages)
    }

    /// Signal end of input. Completes a close-delimited response.
    pub fn finish(&mut self) -> Result<Option<PropertyBag>, ParseError> {
        if self.upgraded {
            return Ok(None);
        }
        self.parser.execute(&[])?;
        if self.parser.is_message_complete() {
            return Ok(Some(self.next_message()));
        }
        Ok(None)
    }

    fn next_message(&mut self) -> PropertyBag {
        let message = self.parser.take_property();
        if self.parser.is_upgrade() {
            tracing::trace!("connection upgraded after {}", message);
            self.upgraded = true;
        }
        self.parser.clear();
        message
    }

    /// True once a message switched protocols.
    pub fn is_upgraded(&self) -> bool {
        self.upgraded
    }

    /// Bytes received after an upgrade.
    pub fn take_upgraded(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    /// The underlying parser, for keep-alive and direction queries on the
    /// message in progress.
    pub fn parser(&self) -> &HttpParser {
        &self.parser
    }
}
