//! Incremental HTTP/1.x tokenizer.
//!
//! [`Grammar`] turns a byte stream into a sequence of [`Events`]. The start
//! line is reported as soon as it is complete; header fields are tokenized
//! with [`httparse`] once the blank line ending the head has arrived. Body
//! framing (`Content-Length`, chunked transfer coding and
//! close-delimited responses) is tracked here across calls.
//!
//! The grammar stops after every complete message and reports how many bytes
//! it consumed. Call [`Grammar::reset`] before feeding the next message.

use std::cmp;

use super::error::{ParseError, ParseErrorKind};

/// Largest message head (or trailer block) accepted, in bytes.
pub const MAX_HEAD_SIZE: usize = 80 * 1024;

const MAX_HEADERS: usize = 128;
const MAX_CHUNK_LINE: usize = 4096;

/// Which kind of message the grammar expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserType {
    /// Requests only.
    Request,
    /// Responses only.
    Response,
    /// Detect from the first line of each message.
    Both,
}

/// Direction of a parsed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// An HTTP request.
    Request,
    /// An HTTP response.
    Response,
}

/// Summary of a message head, passed to [`Events::on_headers_complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    /// Request or response.
    pub direction: Direction,
    /// Request method, for requests.
    pub method: Option<String>,
    /// Status code, for responses.
    pub status: Option<u16>,
    /// `(major, minor)` protocol version.
    pub version: (u8, u8),
    /// Whether the connection may carry another message afterwards.
    pub keep_alive: bool,
    /// Whether the connection switches protocols after this head.
    pub upgrade: bool,
}

/// Receiver of grammar events. Every method defaults to doing nothing.
#[allow(unused_variables)]
pub trait Events {
    /// A new message started.
    fn on_message_begin(&mut self) {}
    /// Request target of a request line.
    fn on_url(&mut self, url: &[u8]) {}
    /// Reason phrase of a status line (possibly empty).
    fn on_status(&mut self, reason: &[u8]) {}
    /// Header (or trailer) field name.
    fn on_header_field(&mut self, field: &[u8]) {}
    /// Header (or trailer) field value, always following its field name.
    fn on_header_value(&mut self, value: &[u8]) {}
    /// The head is complete.
    fn on_headers_complete(&mut self, head: &Head) {}
    /// A piece of body. `is_final` is set on the piece that ends a
    /// length-delimited body.
    fn on_body(&mut self, chunk: &[u8], is_final: bool) {}
    /// The message is complete.
    fn on_message_complete(&mut self) {}
    /// A chunk size line was read.
    fn on_chunk_header(&mut self, size: u64) {}
    /// A chunk (including the terminal one) was read.
    fn on_chunk_complete(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkDataEnd,
    Trailers,
    UntilEof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Head,
    Body(Body),
    Complete,
    Failed(ParseError),
}

/// Incremental HTTP/1.x tokenizer.
#[derive(Debug)]
pub struct Grammar {
    kind: ParserType,
    state: State,
    buf: Vec<u8>,
    head: Option<Head>,
    /// `on_url`/`on_status` already fired for the current message.
    start_line_seen: bool,
}

impl Grammar {
    /// A grammar expecting messages of `kind`.
    pub fn new(kind: ParserType) -> Self {
        Self {
            kind,
            state: State::Start,
            buf: Vec::new(),
            head: None,
            start_line_seen: false,
        }
    }

    /// The configured parser type.
    pub fn kind(&self) -> ParserType {
        self.kind
    }

    /// Forget the current message and any error, ready for the next message.
    pub fn reset(&mut self) {
        self.state = State::Start;
        self.buf.clear();
        self.head = None;
        self.start_line_seen = false;
    }

    /// Head of the current message, once it has been parsed.
    pub fn head(&self) -> Option<&Head> {
        self.head.as_ref()
    }

    /// Keep-alive computed from the version, `Connection` header and body
    /// framing of the current message.
    pub fn should_keep_alive(&self) -> bool {
        self.head.as_ref().is_some_and(|head| head.keep_alive)
    }

    /// True if the current message switches protocols.
    pub fn is_upgrade(&self) -> bool {
        self.head.as_ref().is_some_and(|head| head.upgrade)
    }

    /// True once the current message is complete.
    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// The error that stopped the grammar, if any.
    pub fn error(&self) -> Option<ParseError> {
        match self.state {
            State::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// Feed `data`, returning how many bytes were consumed.
    ///
    /// Consumption stops at the end of a complete message. An empty `data`
    /// signals end of input, which completes a close-delimited body and is an
    /// error in the middle of any other message. After an error every call
    /// returns the same error until [`reset`](Self::reset).
    pub fn execute<E: Events>(&mut self, data: &[u8], events: &mut E) -> Result<usize, ParseError> {
        if let State::Failed(error) = self.state {
            return Err(error);
        }

        let result = if data.is_empty() {
            self.finish(events).map(|_| 0)
        } else {
            self.feed(data, events)
        };

        result.map_err(|error| {
            self.state = State::Failed(error);
            error
        })
    }

    fn feed<E: Events>(&mut self, data: &[u8], events: &mut E) -> Result<usize, ParseError> {
        let mut pos = 0;
        while pos < data.len() {
            match self.state {
                State::Start => {
                    while pos < data.len() && matches!(data[pos], b'\r' | b'\n') {
                        pos += 1;
                    }
                    if pos < data.len() {
                        events.on_message_begin();
                        self.state = State::Head;
                    }
                }
                State::Head => pos += self.read_head(&data[pos..], events)?,
                State::Body(body) => pos += self.read_body(body, &data[pos..], events)?,
                State::Complete => break,
                State::Failed(error) => return Err(error),
            }
        }
        Ok(pos)
    }

    fn finish<E: Events>(&mut self, events: &mut E) -> Result<(), ParseError> {
        match self.state {
            State::Start | State::Complete => Ok(()),
            State::Body(Body::UntilEof) => {
                self.complete(events);
                Ok(())
            }
            State::Failed(error) => Err(error),
            State::Head | State::Body(_) => Err(ParseErrorKind::InvalidEofState.into()),
        }
    }

    fn complete<E: Events>(&mut self, events: &mut E) {
        self.state = State::Complete;
        events.on_message_complete();
    }

    /// Buffer head bytes until the blank line, then tokenize the whole head.
    fn read_head<E: Events>(&mut self, input: &[u8], events: &mut E) -> Result<usize, ParseError> {
        let Some((consumed, head)) = self.take_block(input)? else {
            self.announce_start_line(events);
            return Ok(input.len());
        };
        self.parse_head(&head, events)?;
        Ok(consumed)
    }

    /// Report the request target or reason phrase once the start line has
    /// arrived, ahead of the header fields. A malformed start line is left
    /// for the full head parse to reject.
    fn announce_start_line<E: Events>(&mut self, events: &mut E) {
        if self.start_line_seen {
            return;
        }
        let Some(end) = self.buf.iter().position(|&b| b == b'\n') else {
            return;
        };

        // The start line alone, closed off as a head with no fields.
        let mut line = self.buf[..=end].to_vec();
        line.extend_from_slice(b"\r\n");

        let mut storage = [httparse::EMPTY_HEADER; 1];
        match self.direction_of(&line) {
            Direction::Request => {
                let mut request = httparse::Request::new(&mut storage);
                let parsed = request.parse(&line).is_ok();
                if let (true, Some(path)) = (parsed, request.path) {
                    events.on_url(path.as_bytes());
                    self.start_line_seen = true;
                }
            }
            Direction::Response => {
                let mut response = httparse::Response::new(&mut storage);
                if response.parse(&line).is_ok() {
                    events.on_status(response.reason.unwrap_or_default().as_bytes());
                    self.start_line_seen = true;
                }
            }
        }
    }

    fn direction_of(&self, head: &[u8]) -> Direction {
        match self.kind {
            ParserType::Request => Direction::Request,
            ParserType::Response => Direction::Response,
            ParserType::Both if head.starts_with(b"HTTP/") => Direction::Response,
            ParserType::Both => Direction::Request,
        }
    }

    /// Accumulate `input` into the block buffer until it contains a blank
    /// line. Returns the bytes of `input` consumed and the complete block.
    fn take_block(&mut self, input: &[u8]) -> Result<Option<(usize, Vec<u8>)>, ParseError> {
        let prev = self.buf.len();
        let room = (MAX_HEAD_SIZE + 4).saturating_sub(prev);
        self.buf.extend_from_slice(&input[..cmp::min(input.len(), room)]);

        match find_block_end(&self.buf, prev.saturating_sub(3)) {
            Some(end) if end <= MAX_HEAD_SIZE => {
                self.buf.truncate(end);
                Ok(Some((end - prev, std::mem::take(&mut self.buf))))
            }
            Some(_) => Err(ParseErrorKind::HeaderOverflow.into()),
            None if self.buf.len() > MAX_HEAD_SIZE => Err(ParseErrorKind::HeaderOverflow.into()),
            None => Ok(None),
        }
    }

    fn parse_head<E: Events>(&mut self, block: &[u8], events: &mut E) -> Result<(), ParseError> {
        let direction = self.direction_of(block);

        let mut storage = vec![httparse::EMPTY_HEADER; MAX_HEADERS];
        let (method, status, minor, headers) = match direction {
            Direction::Request => {
                let mut request = httparse::Request::new(&mut storage);
                let status = request.parse(block).map_err(|error| http_error(error, direction))?;
                if status.is_partial() {
                    return Err(ParseErrorKind::LfExpected.into());
                }
                let path = request.path.ok_or(ParseErrorKind::InvalidUrl)?;
                if !self.start_line_seen {
                    events.on_url(path.as_bytes());
                }
                (
                    request.method.map(str::to_owned),
                    None,
                    request.version.ok_or(ParseErrorKind::InvalidVersion)?,
                    request.headers,
                )
            }
            Direction::Response => {
                let mut response = httparse::Response::new(&mut storage);
                let status = response.parse(block).map_err(|error| http_error(error, direction))?;
                if status.is_partial() {
                    return Err(ParseErrorKind::LfExpected.into());
                }
                if !self.start_line_seen {
                    events.on_status(response.reason.unwrap_or_default().as_bytes());
                }
                (
                    None,
                    Some(response.code.ok_or(ParseErrorKind::InvalidStatus)?),
                    response.version.ok_or(ParseErrorKind::InvalidVersion)?,
                    response.headers,
                )
            }
        };

        let mut framing = Framing::default();
        for header in headers.iter() {
            events.on_header_field(header.name.as_bytes());
            events.on_header_value(header.value);
            framing.observe(header)?;
        }

        let upgrade = match direction {
            Direction::Request => {
                (framing.connection_upgrade && framing.upgrade)
                    || method.as_deref() == Some("CONNECT")
            }
            Direction::Response => status == Some(101),
        };

        let body = if upgrade {
            None
        } else {
            framing.body(direction, status)?
        };

        let mut keep_alive = if minor >= 1 {
            !framing.connection_close
        } else {
            framing.connection_keep_alive
        };
        if body == Some(Body::UntilEof) {
            keep_alive = false;
        }

        let head = Head {
            direction,
            method,
            status,
            version: (1, minor),
            keep_alive,
            upgrade,
        };
        events.on_headers_complete(&head);
        self.head = Some(head);

        match body {
            Some(body) => self.state = State::Body(body),
            None => self.complete(events),
        }
        Ok(())
    }

    fn read_body<E: Events>(
        &mut self,
        body: Body,
        input: &[u8],
        events: &mut E,
    ) -> Result<usize, ParseError> {
        match body {
            Body::Length(remaining) => {
                let n = cmp::min(remaining, input.len() as u64) as usize;
                let remaining = remaining - n as u64;
                events.on_body(&input[..n], remaining == 0);
                if remaining == 0 {
                    self.complete(events);
                } else {
                    self.state = State::Body(Body::Length(remaining));
                }
                Ok(n)
            }
            Body::UntilEof => {
                events.on_body(input, false);
                Ok(input.len())
            }
            Body::ChunkSize => {
                let (consumed, line) = self.take_line(input, MAX_CHUNK_LINE)?;
                if let Some(mut line) = line {
                    // Bare LF ends a line here as it does in the head.
                    if !line.ends_with(b"\r\n") {
                        line.pop();
                        line.extend_from_slice(b"\r\n");
                    }
                    let size = match httparse::parse_chunk_size(&line) {
                        Ok(httparse::Status::Complete((_, size))) => size,
                        _ => return Err(ParseErrorKind::InvalidChunkSize.into()),
                    };
                    events.on_chunk_header(size);
                    if size == 0 {
                        self.buf.push(b'\n');
                        self.state = State::Body(Body::Trailers);
                    } else {
                        self.state = State::Body(Body::ChunkData(size));
                    }
                }
                Ok(consumed)
            }
            Body::ChunkData(remaining) => {
                let n = cmp::min(remaining, input.len() as u64) as usize;
                let remaining = remaining - n as u64;
                events.on_body(&input[..n], false);
                self.state = State::Body(if remaining == 0 {
                    Body::ChunkDataEnd
                } else {
                    Body::ChunkData(remaining)
                });
                Ok(n)
            }
            Body::ChunkDataEnd => {
                let (consumed, line) = self.take_line(input, 2)?;
                if let Some(line) = line {
                    if line != b"\r\n" && line != b"\n" {
                        return Err(ParseErrorKind::LfExpected.into());
                    }
                    events.on_chunk_complete();
                    self.state = State::Body(Body::ChunkSize);
                }
                Ok(consumed)
            }
            Body::Trailers => self.read_trailers(input, events),
        }
    }

    /// The buffer is seeded with the chunk-size line ending on entry, so an
    /// empty trailer section is found by the same blank-line search as a head.
    fn read_trailers<E: Events>(
        &mut self,
        input: &[u8],
        events: &mut E,
    ) -> Result<usize, ParseError> {
        let Some((consumed, block)) = self.take_block(input)? else {
            return Ok(input.len());
        };

        let trailers = &block[1..];
        if trailers != b"\r\n" && trailers != b"\n" {
            let mut storage = vec![httparse::EMPTY_HEADER; MAX_HEADERS];
            match httparse::parse_headers(trailers, &mut storage) {
                Ok(httparse::Status::Complete((_, fields))) => {
                    for field in fields {
                        events.on_header_field(field.name.as_bytes());
                        events.on_header_value(field.value);
                    }
                }
                Ok(httparse::Status::Partial) => return Err(ParseErrorKind::LfExpected.into()),
                Err(error) => return Err(http_error(error, Direction::Request)),
            }
        }

        events.on_chunk_complete();
        self.complete(events);
        Ok(consumed)
    }

    /// Accumulate a single line (up to and including `\n`) into the buffer.
    fn take_line(
        &mut self,
        input: &[u8],
        limit: usize,
    ) -> Result<(usize, Option<Vec<u8>>), ParseError> {
        let (consumed, done) = match input.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (input.len(), false),
        };
        self.buf.extend_from_slice(&input[..consumed]);
        if self.buf.len() > limit {
            return Err(match self.state {
                State::Body(Body::ChunkSize) => ParseErrorKind::InvalidChunkSize,
                _ => ParseErrorKind::LfExpected,
            }
            .into());
        }
        Ok((consumed, done.then(|| std::mem::take(&mut self.buf))))
    }
}

/// Framing-relevant facts collected from a head's header fields.
#[derive(Debug, Default)]
struct Framing {
    content_length: Option<u64>,
    transfer_encoding: bool,
    chunked: bool,
    connection_close: bool,
    connection_keep_alive: bool,
    connection_upgrade: bool,
    upgrade: bool,
}

impl Framing {
    fn observe(&mut self, header: &httparse::Header<'_>) -> Result<(), ParseError> {
        let name = header.name;
        if name.eq_ignore_ascii_case("content-length") {
            let value = trim(header.value);
            if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
                return Err(ParseErrorKind::InvalidContentLength.into());
            }
            let length = std::str::from_utf8(value)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or(ParseErrorKind::InvalidContentLength)?;
            if self.content_length.is_some_and(|previous| previous != length) {
                return Err(ParseErrorKind::UnexpectedContentLength.into());
            }
            self.content_length = Some(length);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            self.transfer_encoding = true;
            self.chunked = tokens(header.value)
                .last()
                .is_some_and(|token| token.eq_ignore_ascii_case(b"chunked"));
        } else if name.eq_ignore_ascii_case("connection") {
            for token in tokens(header.value) {
                if token.eq_ignore_ascii_case(b"close") {
                    self.connection_close = true;
                } else if token.eq_ignore_ascii_case(b"keep-alive") {
                    self.connection_keep_alive = true;
                } else if token.eq_ignore_ascii_case(b"upgrade") {
                    self.connection_upgrade = true;
                }
            }
        } else if name.eq_ignore_ascii_case("upgrade") {
            self.upgrade = true;
        }
        Ok(())
    }

    fn body(&self, direction: Direction, status: Option<u16>) -> Result<Option<Body>, ParseError> {
        if self.transfer_encoding && self.content_length.is_some() {
            return Err(ParseErrorKind::UnexpectedContentLength.into());
        }

        let body = match direction {
            Direction::Request => {
                if self.transfer_encoding {
                    if !self.chunked {
                        return Err(ParseErrorKind::InvalidTransferEncoding.into());
                    }
                    Some(Body::ChunkSize)
                } else {
                    self.content_length.map(Body::Length)
                }
            }
            Direction::Response => {
                let status = status.unwrap_or_default();
                if status / 100 == 1 || status == 204 || status == 304 {
                    None
                } else if self.chunked {
                    Some(Body::ChunkSize)
                } else if self.transfer_encoding {
                    Some(Body::UntilEof)
                } else {
                    Some(self.content_length.map_or(Body::UntilEof, Body::Length))
                }
            }
        };

        Ok(body.filter(|body| *body != Body::Length(0)))
    }
}

fn http_error(error: httparse::Error, direction: Direction) -> ParseError {
    let kind = match error {
        httparse::Error::HeaderName | httparse::Error::HeaderValue => {
            ParseErrorKind::InvalidHeaderToken
        }
        httparse::Error::NewLine => ParseErrorKind::LfExpected,
        httparse::Error::Status => ParseErrorKind::InvalidStatus,
        httparse::Error::Token if direction == Direction::Request => ParseErrorKind::InvalidMethod,
        httparse::Error::Token => ParseErrorKind::InvalidStatus,
        httparse::Error::TooManyHeaders => ParseErrorKind::HeaderOverflow,
        httparse::Error::Version => ParseErrorKind::InvalidVersion,
    };
    ParseError::new(kind)
}

/// End offset of the first blank line at or after `from`.
fn find_block_end(buf: &[u8], from: usize) -> Option<usize> {
    (from..buf.len()).find_map(|i| {
        if buf[i] != b'\n' {
            return None;
        }
        match (buf.get(i + 1), buf.get(i + 2)) {
            (Some(b'\n'), _) => Some(i + 2),
            (Some(b'\r'), Some(b'\n')) => Some(i + 3),
            _ => None,
        }
    })
}

fn trim(value: &[u8]) -> &[u8] {
    let start = value
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(value.len());
    let end = value
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &value[start..end]
}

/// Comma-separated list elements with surrounding whitespace removed.
pub(crate) fn tokens(value: &[u8]) -> impl Iterator<Item = &[u8]> {
    value
        .split(|&b| b == b',')
        .map(trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Trace(Vec<String>);

    impl Events for Trace {
        fn on_message_begin(&mut self) {
            self.0.push("begin".into());
        }
        fn on_url(&mut self, url: &[u8]) {
            self.0.push(format!("url {}", String::from_utf8_lossy(url)));
        }
        fn on_status(&mut self, reason: &[u8]) {
            self.0.push(format!("status {}", String::from_utf8_lossy(reason)));
        }
        fn on_header_field(&mut self, field: &[u8]) {
            self.0.push(format!("field {}", String::from_utf8_lossy(field)));
        }
        fn on_header_value(&mut self, value: &[u8]) {
            self.0.push(format!("value {}", String::from_utf8_lossy(value)));
        }
        fn on_headers_complete(&mut self, head: &Head) {
            self.0.push(format!("headers keep_alive={}", head.keep_alive));
        }
        fn on_body(&mut self, chunk: &[u8], is_final: bool) {
            self.0.push(format!(
                "body {} final={is_final}",
                String::from_utf8_lossy(chunk)
            ));
        }
        fn on_message_complete(&mut self) {
            self.0.push("complete".into());
        }
        fn on_chunk_header(&mut self, size: u64) {
            self.0.push(format!("chunk {size}"));
        }
        fn on_chunk_complete(&mut self) {
            self.0.push("chunk done".into());
        }
    }

    #[test]
    fn request_events_in_order() {
        let mut grammar = Grammar::new(ParserType::Request);
        let mut trace = Trace::default();
        let input = b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";

        let n = grammar.execute(input, &mut trace).unwrap();
        assert_eq!(n, input.len());
        assert!(grammar.is_complete());
        assert_eq!(
            trace.0,
            vec![
                "begin",
                "url /submit",
                "field Host",
                "value x",
                "field Content-Length",
                "value 5",
                "headers keep_alive=true",
                "body hello final=true",
                "complete",
            ]
        );
        assert_eq!(grammar.head().unwrap().method.as_deref(), Some("POST"));
    }

    #[test]
    fn chunked_with_trailers() {
        let mut grammar = Grammar::new(ParserType::Response);
        let mut trace = Trace::default();
        let input = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                      3\r\nabc\r\n0\r\nX-Checksum: 1\r\n\r\n";

        let n = grammar.execute(input, &mut trace).unwrap();
        assert_eq!(n, input.len());
        assert_eq!(
            &trace.0[4..],
            &[
                "headers keep_alive=true",
                "chunk 3",
                "body abc final=false",
                "chunk done",
                "chunk 0",
                "field X-Checksum",
                "value 1",
                "chunk done",
                "complete",
            ]
        );
    }

    #[test]
    fn chunked_terminator_split_across_calls() {
        let mut grammar = Grammar::new(ParserType::Request);
        let mut trace = Trace::default();
        let input = b"PUT / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n";

        for byte in input.iter() {
            assert_eq!(grammar.execute(std::slice::from_ref(byte), &mut trace).unwrap(), 1);
        }
        assert!(grammar.is_complete());
        assert_eq!(trace.0.last().map(String::as_str), Some("complete"));
    }

    #[test]
    fn stops_after_each_message() {
        let mut grammar = Grammar::new(ParserType::Request);
        let mut trace = Trace::default();
        let first = b"GET /a HTTP/1.1\r\n\r\n";
        let mut input = first.to_vec();
        input.extend_from_slice(b"GET /b HTTP/1.1\r\n\r\n");

        let n = grammar.execute(&input, &mut trace).unwrap();
        assert_eq!(n, first.len());
        assert_eq!(grammar.execute(&input[n..], &mut trace).unwrap(), 0);

        grammar.reset();
        let m = grammar.execute(&input[n..], &mut trace).unwrap();
        assert_eq!(n + m, input.len());
        assert!(trace.0.contains(&"url /b".to_string()));
    }

    #[test]
    fn leading_line_endings_are_skipped() {
        let mut grammar = Grammar::new(ParserType::Request);
        let mut trace = Trace::default();
        let input = b"\r\n\r\nGET / HTTP/1.1\r\n\r\n";
        assert_eq!(grammar.execute(input, &mut trace).unwrap(), input.len());
        assert_eq!(trace.0[0], "begin");
    }

    #[test]
    fn response_until_eof() {
        let mut grammar = Grammar::new(ParserType::Response);
        let mut trace = Trace::default();
        grammar
            .execute(b"HTTP/1.1 200 OK\r\n\r\npartial", &mut trace)
            .unwrap();
        assert!(!grammar.should_keep_alive());
        assert!(!grammar.is_complete());

        assert_eq!(grammar.execute(b"", &mut trace).unwrap(), 0);
        assert!(grammar.is_complete());
    }

    #[test]
    fn no_body_statuses() {
        for status in ["100 Continue", "204 No Content", "304 Not Modified"] {
            let mut grammar = Grammar::new(ParserType::Response);
            let input = format!("HTTP/1.1 {status}\r\nContent-Length: 10\r\n\r\n");
            grammar.execute(input.as_bytes(), &mut Trace::default()).unwrap();
            assert!(grammar.is_complete(), "{status}");
        }
    }

    #[test]
    fn keep_alive_rules() {
        let cases: &[(&[u8], bool)] = &[
            (b"GET / HTTP/1.1\r\n\r\n", true),
            (b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n", false),
            (b"GET / HTTP/1.0\r\n\r\n", false),
            (b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n", true),
        ];
        for (input, expected) in cases {
            let mut grammar = Grammar::new(ParserType::Request);
            grammar.execute(input, &mut Trace::default()).unwrap();
            assert_eq!(grammar.should_keep_alive(), *expected);
        }
    }

    #[test]
    fn upgrade_stops_at_head() {
        let mut grammar = Grammar::new(ParserType::Request);
        let head = b"GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n";
        let mut input = head.to_vec();
        input.extend_from_slice(b"\x81\x05hello");

        let n = grammar.execute(&input, &mut Trace::default()).unwrap();
        assert_eq!(n, head.len());
        assert!(grammar.is_upgrade());
        assert!(grammar.is_complete());
    }

    #[test]
    fn detects_direction() {
        let mut grammar = Grammar::new(ParserType::Both);
        grammar
            .execute(b"HTTP/1.0 404 Not Found\r\nContent-Length: 0\r\n\r\n", &mut Trace::default())
            .unwrap();
        assert_eq!(grammar.head().unwrap().direction, Direction::Response);

        grammar.reset();
        grammar
            .execute(b"DELETE /x HTTP/1.1\r\n\r\n", &mut Trace::default())
            .unwrap();
        assert_eq!(grammar.head().unwrap().direction, Direction::Request);
    }

    #[test]
    fn errors_are_sticky() {
        let mut grammar = Grammar::new(ParserType::Request);
        let error = grammar
            .execute(b"GET / HTTP/1.1\r\nContent-Length: abc\r\n\r\n", &mut Trace::default())
            .unwrap_err();
        assert_eq!(error.kind(), ParseErrorKind::InvalidContentLength);
        assert_eq!(grammar.error(), Some(error));
        assert_eq!(
            grammar.execute(b"GET / HTTP/1.1\r\n\r\n", &mut Trace::default()),
            Err(error)
        );

        grammar.reset();
        assert!(grammar.error().is_none());
    }

    #[test]
    fn framing_conflicts() {
        let mut grammar = Grammar::new(ParserType::Request);
        let error = grammar
            .execute(
                b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 3\r\n\r\n",
                &mut Trace::default(),
            )
            .unwrap_err();
        assert_eq!(error.name(), "HPE_UNEXPECTED_CONTENT_LENGTH");

        let mut grammar = Grammar::new(ParserType::Request);
        let error = grammar
            .execute(
                b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n",
                &mut Trace::default(),
            )
            .unwrap_err();
        assert_eq!(error.kind(), ParseErrorKind::InvalidTransferEncoding);
    }

    #[test]
    fn eof_mid_message() {
        let mut grammar = Grammar::new(ParserType::Request);
        grammar
            .execute(b"GET / HTTP/1.1\r\nHo", &mut Trace::default())
            .unwrap();
        let error = grammar.execute(b"", &mut Trace::default()).unwrap_err();
        assert_eq!(error.kind(), ParseErrorKind::InvalidEofState);
    }

    #[test]
    fn oversized_head() {
        let mut grammar = Grammar::new(ParserType::Request);
        let mut input = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        input.resize(MAX_HEAD_SIZE + 10, b'a');
        let error = grammar.execute(&input, &mut Trace::default()).unwrap_err();
        assert_eq!(error.kind(), ParseErrorKind::HeaderOverflow);
    }

    #[test]
    fn bad_chunk_size() {
        let mut grammar = Grammar::new(ParserType::Request);
        let error = grammar
            .execute(
                b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n",
                &mut Trace::default(),
            )
            .unwrap_err();
        assert_eq!(error.kind(), ParseErrorKind::InvalidChunkSize);
    }

    #[test]
    fn bare_line_feeds_frame_chunks() {
        let mut grammar = Grammar::new(ParserType::Request);
        let mut trace = Trace::default();
        let input = b"POST / HTTP/1.1\nTransfer-Encoding: chunked\n\n3\nabc\n0\n\n";

        let n = grammar.execute(input, &mut trace).unwrap();
        assert_eq!(n, input.len());
        assert!(grammar.is_complete());
        assert!(trace.0.iter().any(|event| event == "body abc final=false"));
    }

    #[test]
    fn start_line_is_reported_before_the_head_ends() {
        let mut grammar = Grammar::new(ParserType::Both);
        let mut trace = Trace::default();

        grammar.execute(b"GET /path HT", &mut trace).unwrap();
        assert_eq!(trace.0, vec!["begin"]);
        grammar.execute(b"TP/1.1\r\nHo", &mut trace).unwrap();
        assert_eq!(trace.0, vec!["begin", "url /path"]);
        grammar.execute(b"st: x\r\n\r\n", &mut trace).unwrap();
        assert_eq!(
            trace.0,
            vec![
                "begin",
                "url /path",
                "field Host",
                "value x",
                "headers keep_alive=true",
                "complete",
            ]
        );

        grammar.reset();
        let mut trace = Trace::default();
        grammar.execute(b"HTTP/1.1 404 Not Found\r\n", &mut trace).unwrap();
        assert_eq!(trace.0, vec!["begin", "status Not Found"]);
    }

    #[test]
    fn token_lists() {
        let found: Vec<&[u8]> = tokens(b" keep-alive , Upgrade,,").collect();
        assert_eq!(found, vec![&b"keep-alive"[..], &b"Upgrade"[..]]);
    }
}
