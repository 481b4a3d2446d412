//! HTTP/1.1 request head parsing (via [`httparse`]) and the [`Request`] envelope
//! handed to middleware and handlers.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use super::upload::UploadedFile;
use super::{Headers, Method, OneOrMany, insert_or_push};
use crate::context::{Extensions, Parameters};

/// Errors that can occur while parsing an HTTP/1.1 request head.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("request exceeds maximum allowed size of {max_bytes} bytes")]
    TooLarge { max_bytes: usize },
}

/// The request line and headers of an HTTP/1.1 request, before the body arrives.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Request target exactly as sent, query string included.
    pub target: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub version: u8,
    pub headers: Headers,
}

impl RequestHead {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Parse a request head from a byte slice.
    ///
    /// Returns the head and the byte offset at which the body begins in `buf`
    /// (immediately after the `\r\n\r\n` terminator).
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed to complete the head.
    /// - [`RequestError::Parse`]: the data is malformed.
    /// - [`RequestError::MissingField`]: method, path or version is absent.
    ///
    /// # Examples
    ///
    /// ```
    /// use rttp_kernel::http::RequestHead;
    ///
    /// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
    /// let (head, offset) = RequestHead::parse(raw).unwrap();
    /// assert_eq!(head.method.as_str(), "GET");
    /// assert_eq!(head.target, "/hello?name=world");
    /// assert_eq!(offset, raw.len());
    /// ```
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = match raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse::<Method>()
        {
            Ok(method) => method,
            Err(never) => match never {},
        };

        let target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?
            .to_owned();

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.append(header.name, value);
            }
        }

        Ok((
            Self {
                method,
                target,
                version,
                headers: header_map,
            },
            body_offset,
        ))
    }

    /// The `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.trim().parse().ok()
    }

    /// `true` if the connection should stay open after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive; HTTP/1.0 only with an explicit
    /// `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }
}

/// Uploaded files keyed by form field name.
pub type Files = HashMap<String, OneOrMany<UploadedFile>>;

/// An HTTP request as seen by middleware and handlers.
///
/// The server layer builds it once per request; the kernel then derives the copy
/// that carries route parameters with [`with_params`](Self::with_params). Bodies are
/// stored twice: parsed into a [`serde_json::Value`] (JSON, form fields, or text)
/// and as the raw bytes that arrived on the wire.
///
/// # Examples
///
/// ```
/// use rttp_kernel::http::{Method, Request};
///
/// let req = Request::new(Method::Get, "/search?q=rust+lang&tag=a&tag=b")
///     .header("X-Trace", "abc");
///
/// assert_eq!(req.path(), "/search");
/// assert_eq!(req.query("q"), Some("rust lang"));
/// assert_eq!(req.query_all("tag"), &["a".to_owned(), "b".to_owned()]);
/// assert_eq!(req.header_value("x-trace"), Some("abc"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: String,
    path: String,
    headers: Headers,
    raw_query: Option<String>,
    query: HashMap<String, OneOrMany<String>>,
    body: Value,
    raw_body: Bytes,
    params: Parameters,
    files: Arc<Files>,
    extensions: Extensions,
}

impl Request {
    /// Create a request for `method` and the raw request target `url`.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        let url = url.into();
        let (path, raw_query) = match url.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (url.clone(), None),
        };
        let path = if path.is_empty() { "/".to_owned() } else { path };
        let query = raw_query.as_deref().map(parse_query_string).unwrap_or_default();

        Self {
            method,
            url,
            path,
            headers: Headers::new(),
            raw_query,
            query,
            body: Value::Null,
            raw_body: Bytes::new(),
            params: Parameters::new(),
            files: Arc::new(Files::new()),
            extensions: Extensions::new(),
        }
    }

    /// Create a request from a parsed head; body and files are attached later.
    pub fn from_head(head: RequestHead) -> Self {
        Self::new(head.method, head.target).with_headers(head.headers)
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Append one header.
    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Attach the parsed body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Attach the raw body bytes.
    #[must_use]
    pub fn with_raw_body(mut self, raw: impl Into<Bytes>) -> Self {
        self.raw_body = raw.into();
        self
    }

    #[must_use]
    pub fn with_files(mut self, files: Files) -> Self {
        self.files = Arc::new(files);
        self
    }

    /// The same request, carrying the path parameters of a matched route.
    #[must_use]
    pub fn with_params(mut self, params: Parameters) -> Self {
        self.params = params;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The raw request target, query string included.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The request path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// First value of the header `name` (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains(name)
    }

    /// The raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.raw_query.as_deref()
    }

    /// First decoded value of the query parameter `name`.
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name)?.first().map(String::as_str)
    }

    /// Every decoded value of the query parameter `name`, in order.
    pub fn query_all(&self, name: &str) -> &[String] {
        self.query.get(name).map(OneOrMany::as_slice).unwrap_or_default()
    }

    pub fn has_query(&self, name: &str) -> bool {
        self.query.contains_key(name)
    }

    /// All decoded query parameters.
    pub fn query_map(&self) -> &HashMap<String, OneOrMany<String>> {
        &self.query
    }

    /// JSON object view of the query, used by query validators.
    pub fn query_json(&self) -> Value {
        serde_json::to_value(&self.query).unwrap_or(Value::Null)
    }

    /// The parsed body: `Null` when empty, an object for JSON objects and form
    /// bodies, a string for anything else.
    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn raw_body(&self) -> &Bytes {
        &self.raw_body
    }

    /// Deserialize the raw body as JSON into `T`.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(&self.raw_body)
    }

    /// Look `key` up in the query first, then in an object body.
    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.query.get(key) {
            return serde_json::to_value(value).ok();
        }
        self.body.as_object()?.get(key).cloned()
    }

    /// `true` if `key` is present in the query or an object body.
    pub fn has(&self, key: &str) -> bool {
        self.query.contains_key(key)
            || self
                .body
                .as_object()
                .is_some_and(|body| body.contains_key(key))
    }

    /// Route parameter `name`, once the kernel has matched a route.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    /// First file uploaded under `name`.
    pub fn file(&self, name: &str) -> Option<&UploadedFile> {
        self.files.get(name)?.first()
    }

    /// Every file uploaded under `name`.
    pub fn files(&self, name: &str) -> &[UploadedFile] {
        self.files.get(name).map(OneOrMany::as_slice).unwrap_or_default()
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    /// Every uploaded file, flattened across field names.
    pub fn all_files(&self) -> impl Iterator<Item = &UploadedFile> {
        self.files.values().flat_map(OneOrMany::as_slice)
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// The `Content-Type` header without parameters, lower-cased.
    pub fn content_type(&self) -> Option<String> {
        self.headers
            .get("content-type")
            .map(|ct| ct.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
    }
}

/// Decode `key=value&key2=value2` (percent-decoding, `+` as space). Repeated keys
/// accumulate in order.
pub(crate) fn parse_query_string(query: &str) -> HashMap<String, OneOrMany<String>> {
    let mut params = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        insert_or_push(&mut params, key.into_owned(), value.into_owned());
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (head, offset) = RequestHead::parse(raw).unwrap();
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.target, "/");
        assert_eq!(head.version, 1);
        assert_eq!(head.headers.get("host"), Some("localhost"));
        assert_eq!(offset, raw.len());
    }

    #[test]
    fn incomplete_request() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(RequestHead::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn malformed_request_line() {
        let raw = b"GET /\x01 HTTP/1.1\r\n\r\n";
        assert!(matches!(RequestHead::parse(raw), Err(RequestError::Parse(_))));
    }

    #[test]
    fn keep_alive_rules() {
        let (head, _) = RequestHead::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(head.is_keep_alive());

        let (head, _) = RequestHead::parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!head.is_keep_alive());

        let (head, _) = RequestHead::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!head.is_keep_alive());
    }

    #[test]
    fn content_length_and_body_offset() {
        let raw = b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
        let (head, body_offset) = RequestHead::parse(raw).unwrap();
        assert_eq!(head.content_length(), Some(5));
        assert_eq!(&raw[body_offset..], b"hello");
    }

    #[test]
    fn request_from_head_lowercases_headers_and_splits_query() {
        let raw = b"GET /search?q=caf%C3%A9&page=2 HTTP/1.1\r\nX-Api-Key: k\r\n\r\n";
        let (head, _) = RequestHead::parse(raw).unwrap();
        let req = Request::from_head(head);

        assert_eq!(req.url(), "/search?q=caf%C3%A9&page=2");
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query_string(), Some("q=caf%C3%A9&page=2"));
        assert_eq!(req.query("q"), Some("café"));
        assert_eq!(req.query("page"), Some("2"));
        assert!(req.headers().iter().any(|(k, _)| k == "x-api-key"));
    }

    #[test]
    fn with_params_builds_new_request() {
        let req = Request::new(Method::Get, "/users/42");
        assert!(req.params().is_empty());

        let mut params = Parameters::new();
        params.insert("id", "42");
        let routed = req.clone().with_params(params);

        assert_eq!(routed.param("id"), Some("42"));
        assert_eq!(req.param("id"), None);
    }

    #[test]
    fn get_checks_query_then_body() {
        let req = Request::new(Method::Post, "/?name=query")
            .with_body(serde_json::json!({"name": "body", "age": 30}));
        assert_eq!(req.get("name"), Some(serde_json::json!("query")));
        assert_eq!(req.get("age"), Some(serde_json::json!(30)));
        assert_eq!(req.get("missing"), None);
        assert!(req.has("age"));
        assert!(!req.has("missing"));
    }

    #[test]
    fn json_deserializes_raw_body() {
        #[derive(serde::Deserialize)]
        struct Payload {
            id: u32,
        }
        let req = Request::new(Method::Post, "/").with_raw_body(&b"{\"id\":7}"[..]);
        assert_eq!(req.json::<Payload>().unwrap().id, 7);
    }

    #[test]
    fn files_accessors() {
        let mut files = Files::new();
        insert_or_push(
            &mut files,
            "docs".to_owned(),
            UploadedFile::new("docs", "a.txt", "text/plain", 1, "/tmp/a"),
        );
        insert_or_push(
            &mut files,
            "docs".to_owned(),
            UploadedFile::new("docs", "b.txt", "text/plain", 1, "/tmp/b"),
        );
        let req = Request::new(Method::Post, "/upload").with_files(files);

        assert!(req.has_file("docs"));
        assert_eq!(req.file("docs").unwrap().filename(), "a.txt");
        assert_eq!(req.files("docs").len(), 2);
        assert!(req.files("none").is_empty());
        assert_eq!(req.all_files().count(), 2);
    }

    #[test]
    fn content_type_strips_parameters() {
        let req = Request::new(Method::Post, "/")
            .header("Content-Type", "Multipart/Form-Data; boundary=X");
        assert_eq!(req.content_type().as_deref(), Some("multipart/form-data"));
    }
}
