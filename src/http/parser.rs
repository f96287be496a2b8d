use super::error::ParseError;
use super::grammar::{Direction, Events, Grammar, Head, ParserType};
use super::property::PropertyBag;

/// Collects grammar events into a [`PropertyBag`].
#[derive(Debug, Default)]
struct Collector {
    property: PropertyBag,
    field: Vec<u8>,
    value: Vec<u8>,
    has_value: bool,
    header_complete: bool,
    body_complete: bool,
    message_complete: bool,
    body_is_final: bool,
    direction: Option<Direction>,
}

impl Collector {
    fn reset(&mut self) {
        *self = Self::default();
    }

    /// Insert the buffered field/value pair once both halves are present.
    fn commit_header(&mut self) {
        if !self.has_value {
            return;
        }
        let name = String::from_utf8_lossy(&self.field).into_owned();
        let value = String::from_utf8_lossy(&self.value).into_owned();
        self.property.headers.append(name, value);
        self.field.clear();
        self.value.clear();
        self.has_value = false;
    }
}

impl Events for Collector {
    fn on_message_begin(&mut self) {
        self.header_complete = false;
        self.body_complete = false;
        self.message_complete = false;
        self.body_is_final = false;
    }

    fn on_url(&mut self, url: &[u8]) {
        self.property.path.push_str(&String::from_utf8_lossy(url));
    }

    fn on_status(&mut self, reason: &[u8]) {
        self.property.reason.push_str(&String::from_utf8_lossy(reason));
    }

    fn on_header_field(&mut self, field: &[u8]) {
        self.commit_header();
        self.field.extend_from_slice(field);
    }

    fn on_header_value(&mut self, value: &[u8]) {
        self.value.extend_from_slice(value);
        self.has_value = true;
    }

    fn on_headers_complete(&mut self, head: &Head) {
        self.commit_header();
        self.property.version = head.version;
        if let Some(method) = &head.method {
            self.property.method.clone_from(method);
        }
        if let Some(status) = head.status {
            self.property.status = status;
        }
        self.direction = Some(head.direction);
        self.header_complete = true;
    }

    fn on_body(&mut self, chunk: &[u8], is_final: bool) {
        self.property.append_body(chunk);
        self.body_is_final = is_final;
        self.body_complete = is_final;
    }

    fn on_message_complete(&mut self) {
        self.commit_header();
        self.message_complete = true;
        self.body_is_final = true;
    }

    fn on_chunk_complete(&mut self) {
        self.commit_header();
    }
}

/// Incremental HTTP message parser.
///
/// Bytes are fed with [`execute`](Self::execute) in pieces of any size; the
/// resulting [`PropertyBag`] does not depend on how the input was split.
/// [`is_finish`](Self::is_finish) turns true once the head and the body (or
/// the whole message) are complete.
#[derive(Debug)]
pub struct HttpParser {
    grammar: Grammar,
    collector: Collector,
    last_error: Option<ParseError>,
}

impl HttpParser {
    /// A parser for messages of `kind`.
    pub fn new(kind: ParserType) -> Self {
        Self {
            grammar: Grammar::new(kind),
            collector: Collector::default(),
            last_error: None,
        }
    }

    /// A request parser.
    pub fn request() -> Self {
        Self::new(ParserType::Request)
    }

    /// A response parser.
    pub fn response() -> Self {
        Self::new(ParserType::Response)
    }

    /// Feed `data`, returning how many bytes were consumed. An empty slice
    /// signals end of input.
    ///
    /// Parsing stops at the end of a complete message; any remaining bytes
    /// belong to the next message and must be fed again after
    /// [`clear`](Self::clear).
    pub fn execute(&mut self, data: &[u8]) -> Result<usize, ParseError> {
        self.grammar
            .execute(data, &mut self.collector)
            .inspect_err(|error| self.last_error = Some(*error))
    }

    /// True once the head and then either the body or the whole message are
    /// complete.
    pub fn is_finish(&self) -> bool {
        self.collector.header_complete
            && (self.collector.body_complete || self.collector.message_complete)
    }

    /// True once the head has been parsed.
    pub fn is_header_complete(&self) -> bool {
        self.collector.header_complete
    }

    /// True once the final piece of a length-delimited body arrived.
    pub fn is_body_complete(&self) -> bool {
        self.collector.body_complete
    }

    /// True once the whole message has been parsed.
    pub fn is_message_complete(&self) -> bool {
        self.collector.message_complete
    }

    /// True if the most recent body piece ended the body.
    pub fn body_is_final(&self) -> bool {
        self.collector.body_is_final
    }

    /// Keep-alive of the current message.
    pub fn should_keep_alive(&self) -> bool {
        self.grammar.should_keep_alive()
    }

    /// True if the current message switches protocols.
    pub fn is_upgrade(&self) -> bool {
        self.grammar.is_upgrade()
    }

    /// Direction of the current message, once its head is parsed.
    pub fn direction(&self) -> Option<Direction> {
        self.collector.direction
    }

    /// The message parsed so far.
    pub fn property(&self) -> &PropertyBag {
        &self.collector.property
    }

    /// Take the parsed message, leaving an empty bag behind.
    pub fn take_property(&mut self) -> PropertyBag {
        std::mem::take(&mut self.collector.property)
    }

    /// Reset for the next message on the same connection.
    pub fn clear(&mut self) {
        self.grammar.reset();
        self.collector.reset();
        self.last_error = None;
    }

    /// Symbolic name of the last error, e.g. `HPE_INVALID_EOF_STATE`.
    pub fn errno_name(&self) -> Option<&'static str> {
        self.last_error.map(|error| error.name())
    }

    /// Description of the last error.
    pub fn errno_description(&self) -> Option<&'static str> {
        self.last_error.map(|error| error.description())
    }
}
