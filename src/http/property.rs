//! The accumulated representation of one HTTP message.

use std::fmt;

use bytes::{Bytes, BytesMut};

use super::grammar::tokens;

/// Default `User-Agent` filled in by [`PropertyBag::update_default_request`].
pub const DEFAULT_USER_AGENT: &str = concat!("switchyard/", env!("CARGO_PKG_VERSION"));

/// Default `Server` filled in by [`PropertyBag::update_default_response`].
pub const DEFAULT_SERVER: &str = concat!("switchyard/", env!("CARGO_PKG_VERSION"));

/// Default `Accept` filled in by [`PropertyBag::update_default_request`].
pub const DEFAULT_ACCEPT: &str = "*/*";

/// Default `Content-Type` filled in by [`PropertyBag::update_default_response`].
pub const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Ordered header multimap.
///
/// Insertion order is preserved for serialization; lookups compare names
/// case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// An empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field, keeping any existing fields with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every field named `name` with a single field.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// Append a field only if none with this name exists. Returns whether it
    /// was added.
    pub fn insert_if_absent(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        let name = name.into();
        if self.contains(&name) {
            return false;
        }
        self.entries.push((name, value.into()));
        true
    }

    /// Remove every field named `name`, returning how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True if any field is named `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// True if some `name` field lists `token` among its comma-separated
    /// elements, compared case-insensitively.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name).any(|value| {
            tokens(value.as_bytes()).any(|t| t.eq_ignore_ascii_case(token.as_bytes()))
        })
    }

    /// Fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no fields.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every field.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }
}

/// One HTTP request or response.
///
/// Requests use `method` and `path`; responses use `status` and `reason`.
/// A parsed reason is stored verbatim, even when empty. The canonical reason
/// for the status is substituted only when serializing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyBag {
    /// `(major, minor)` protocol version.
    pub version: (u8, u8),
    /// Request method.
    pub method: String,
    /// Request target.
    pub path: String,
    /// Response status code.
    pub status: u16,
    /// Response reason phrase.
    pub reason: String,
    /// Header fields (and chunked trailer fields) in arrival order.
    pub headers: Headers,
    /// Message body.
    pub body: BytesMut,
}

impl PropertyBag {
    /// An empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset every field.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Append bytes to the body.
    pub fn append_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    /// Body as UTF-8 text, replacing invalid sequences.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Fill in request defaults: `User-Agent`, `Accept`, `Content-Length`
    /// for a non-empty body, method `GET`, path `/`, version `1.1`.
    pub fn update_default_request(&mut self) {
        self.headers.insert_if_absent("User-Agent", DEFAULT_USER_AGENT);
        self.headers.insert_if_absent("Accept", DEFAULT_ACCEPT);
        self.default_content_length();
        if self.method.is_empty() {
            self.method = http::Method::GET.to_string();
        }
        if self.path.is_empty() {
            self.path = "/".to_owned();
        }
        self.default_version();
    }

    /// Fill in response defaults: `Server`, `Content-Type`, `Content-Length`
    /// for a non-empty body, status `200`, version `1.1`.
    pub fn update_default_response(&mut self) {
        self.headers.insert_if_absent("Server", DEFAULT_SERVER);
        self.headers.insert_if_absent("Content-Type", DEFAULT_CONTENT_TYPE);
        self.default_content_length();
        if self.status == 0 {
            self.status = http::StatusCode::OK.as_u16();
        }
        self.default_version();
    }

    fn default_content_length(&mut self) {
        if !self.body.is_empty() && !self.headers.contains("Transfer-Encoding") {
            self.headers
                .insert_if_absent("Content-Length", self.body.len().to_string());
        }
    }

    fn default_version(&mut self) {
        if self.version == (0, 0) {
            self.version = (1, 1);
        }
    }

    /// Reason phrase to serialize: the stored one, or the canonical phrase
    /// for the status when none was set.
    pub fn reason_or_default(&self) -> &str {
        if !self.reason.is_empty() {
            return &self.reason;
        }
        http::StatusCode::from_u16(self.status)
            .ok()
            .and_then(|status| status.canonical_reason())
            .unwrap_or("")
    }

    /// Serialize as a request.
    pub fn to_request_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.extend_from_slice(
            format!(
                "{} {} HTTP/{}.{}\r\n",
                self.method, self.path, self.version.0, self.version.1
            )
            .as_bytes(),
        );
        self.write_headers_and_body(&mut out);
        out.freeze()
    }

    /// Serialize as a response.
    pub fn to_response_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.extend_from_slice(
            format!(
                "HTTP/{}.{} {} {}\r\n",
                self.version.0,
                self.version.1,
                self.status,
                self.reason_or_default()
            )
            .as_bytes(),
        );
        self.write_headers_and_body(&mut out);
        out.freeze()
    }

    fn write_headers_and_body(&self, out: &mut BytesMut) {
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
    }

    fn http_version(&self) -> http::Version {
        match self.version {
            (0, 9) => http::Version::HTTP_09,
            (1, 0) => http::Version::HTTP_10,
            (2, _) => http::Version::HTTP_2,
            (3, _) => http::Version::HTTP_3,
            _ => http::Version::HTTP_11,
        }
    }

    fn header_map(&self) -> Result<http::HeaderMap, http::Error> {
        let mut map = http::HeaderMap::with_capacity(self.headers.len());
        for (name, value) in self.headers.iter() {
            map.append(
                http::header::HeaderName::from_bytes(name.as_bytes())?,
                http::HeaderValue::from_str(value)?,
            );
        }
        Ok(map)
    }

    /// Convert into an [`http::Request`].
    pub fn into_request(self) -> Result<http::Request<Bytes>, http::Error> {
        let headers = self.header_map()?;
        let mut request = http::Request::builder()
            .method(self.method.as_str())
            .uri(self.path.as_str())
            .version(self.http_version())
            .body(self.body.freeze())?;
        *request.headers_mut() = headers;
        Ok(request)
    }

    /// Convert into an [`http::Response`].
    pub fn into_response(self) -> Result<http::Response<Bytes>, http::Error> {
        let headers = self.header_map()?;
        let mut response = http::Response::builder()
            .status(self.status)
            .version(self.http_version())
            .body(self.body.freeze())?;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

impl fmt::Display for PropertyBag {
    /// The start line, e.g. `GET / HTTP/1.1` or `HTTP/1.1 200 OK`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.method.is_empty() {
            write!(
                f,
                "HTTP/{}.{} {} {}",
                self.version.0,
                self.version.1,
                self.status,
                self.reason_or_default()
            )
        } else {
            write!(
                f,
                "{} {} HTTP/{}.{}",
                self.method, self.path, self.version.0, self.version.1
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive_and_ordered() {
        let mut headers = Headers::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("Host", "x");
        headers.append("set-cookie", "b=2");

        assert_eq!(headers.get("HOST"), Some("x"));
        assert_eq!(
            headers.get_all("SET-COOKIE").collect::<Vec<_>>(),
            vec!["a=1", "b=2"]
        );
        assert_eq!(
            headers.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            vec!["Set-Cookie", "Host", "set-cookie"]
        );

        assert_eq!(headers.remove("set-COOKIE"), 2);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn lookup_outlives_the_name() {
        let headers: Headers = [("Content-Type", "text/html")].into_iter().collect();
        let value = {
            let name = String::from("content-type");
            headers.get(&name)
        };
        assert_eq!(value, Some("text/html"));
    }

    #[test]
    fn insert_helpers() {
        let mut headers: Headers = [("Accept", "text/plain")].into_iter().collect();
        assert!(!headers.insert_if_absent("accept", "*/*"));
        assert!(headers.insert_if_absent("Host", "x"));
        headers.insert("ACCEPT", "*/*");
        assert_eq!(headers.get("accept"), Some("*/*"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn token_lookup() {
        let mut headers = Headers::new();
        headers.append("Connection", "keep-alive, Upgrade");
        assert!(headers.contains_token("connection", "upgrade"));
        assert!(headers.contains_token("Connection", "KEEP-ALIVE"));
        assert!(!headers.contains_token("Connection", "close"));
        assert!(!headers.contains_token("Upgrade", "websocket"));
    }

    #[test]
    fn default_request() {
        let mut bag = PropertyBag::new();
        bag.append_body(b"abc");
        bag.update_default_request();

        assert_eq!(bag.method, "GET");
        assert_eq!(bag.path, "/");
        assert_eq!(bag.version, (1, 1));
        assert_eq!(bag.headers.get("Content-Length"), Some("3"));
        assert_eq!(bag.headers.get("Accept"), Some(DEFAULT_ACCEPT));
        assert_eq!(bag.headers.get("user-agent"), Some(DEFAULT_USER_AGENT));

        let bytes = bag.to_request_bytes();
        assert!(bytes.starts_with(b"GET / HTTP/1.1\r\nUser-Agent: "));
        assert!(bytes.ends_with(b"\r\n\r\nabc"));
    }

    #[test]
    fn default_response_reason_is_filled_at_serialization() {
        let mut bag = PropertyBag::new();
        bag.status = 404;
        bag.update_default_response();
        assert_eq!(bag.reason, "");
        assert!(bag
            .to_response_bytes()
            .starts_with(b"HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(bag.to_string(), "HTTP/1.1 404 Not Found");

        bag.reason = "Gone Fishing".into();
        assert!(bag
            .to_response_bytes()
            .starts_with(b"HTTP/1.1 404 Gone Fishing\r\n"));
    }

    #[test]
    fn default_response_status() {
        let mut bag = PropertyBag::new();
        bag.update_default_response();
        assert_eq!(bag.status, 200);
        assert_eq!(bag.headers.get("Content-Type"), Some(DEFAULT_CONTENT_TYPE));
        assert!(!bag.headers.contains("Content-Length"));
    }

    #[test]
    fn converts_to_http_types() {
        let mut bag = PropertyBag::new();
        bag.method = "POST".into();
        bag.path = "/upload?x=1".into();
        bag.version = (1, 0);
        bag.headers.append("Host", "example.com");
        bag.append_body(b"data");

        let request = bag.into_request().unwrap();
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(request.uri().query(), Some("x=1"));
        assert_eq!(request.version(), http::Version::HTTP_10);
        assert_eq!(request.headers()["host"], "example.com");
        assert_eq!(&request.body()[..], b"data");

        let mut bag = PropertyBag::new();
        bag.status = 201;
        bag.version = (1, 1);
        let response = bag.into_response().unwrap();
        assert_eq!(response.status(), http::StatusCode::CREATED);
    }
}
