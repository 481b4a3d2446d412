//! HTTP/1.1 response accumulator.
//!
//! A [`Response`] is built two ways. Handlers construct one with the fluent builder
//! methods and return it; the kernel owns a second, mutable one that middleware
//! decorate in place and that the handler's result is finally committed onto. Once
//! committed (the `sent` flag), the response is frozen.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::{Headers, StatusCode};

/// A response body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Body {
    #[default]
    Empty,
    Text(String),
    Bytes(Bytes),
}

impl Body {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Empty => &[],
            Self::Text(text) => text.as_bytes(),
            Self::Bytes(bytes) => bytes,
        }
    }

    /// The body as text, if it was set from a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes.into())
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

/// An HTTP/1.1 response.
///
/// Every mutating method is a no-op once the response has been marked sent.
///
/// # Examples
///
/// ```
/// use rttp_kernel::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("content-length: 15\r\n"));
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
    // Whether a body was supplied at all, even an empty one.
    body_set: bool,
    sent: bool,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Empty,
            body_set: false,
            sent: false,
            keep_alive: true,
        }
    }

    /// A 200 response with a JSON body and `content-type: application/json`.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if `value` cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        let mut response = Self::default();
        response.send_json(value)?;
        Ok(response)
    }

    /// Replaces the status code.
    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.set_status(status);
        self
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.append_header(name, value);
        self
    }

    /// Sets the response body.
    ///
    /// The `content-length` header is written automatically by [`into_bytes`](Self::into_bytes).
    #[must_use]
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.send(body);
        self
    }

    /// Controls whether `connection: keep-alive` or `connection: close` is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// First value of the header `name` (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn content(&self) -> &Body {
        &self.body
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    /// Whether the connection may stay open after this response.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Freeze the response. Idempotent.
    pub fn mark_sent(&mut self) {
        self.sent = true;
    }

    pub fn set_status(&mut self, status: StatusCode) {
        if !self.sent {
            self.status = status;
        }
    }

    /// Replace every value of `name` with `value`.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        if !self.sent {
            self.headers.set(name, value);
        }
    }

    pub fn append_header(&mut self, name: &str, value: impl Into<String>) {
        if !self.sent {
            self.headers.append(name, value);
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        if !self.sent {
            self.headers.remove(name);
        }
    }

    /// Replace the body.
    pub fn send(&mut self, body: impl Into<Body>) {
        if !self.sent {
            self.body = body.into();
            self.body_set = true;
        }
    }

    /// Serialize `value` as the body and set `content-type: application/json`.
    pub fn send_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        if self.sent {
            return Ok(());
        }
        let json = serde_json::to_string(value)?;
        self.headers.set("content-type", "application/json");
        self.body = Body::Text(json);
        self.body_set = true;
        Ok(())
    }

    /// Copy a handler's result onto this response and mark it sent.
    ///
    /// Status always wins and headers replace same-named ones already present. The
    /// body is taken whenever the handler set one, even an empty one; a handler that
    /// never touched its body leaves a middleware-provided body in place.
    pub fn commit(&mut self, from: Response) {
        if self.sent {
            return;
        }
        self.status = from.status;
        let mut seen: Vec<&str> = Vec::new();
        for (name, value) in from.headers.iter() {
            if seen.contains(&name) {
                self.headers.append(name, value);
            } else {
                self.headers.set(name, value);
                seen.push(name);
            }
        }
        if from.body_set {
            self.body = from.body;
            self.body_set = true;
        }
        self.keep_alive &= from.keep_alive;
        self.sent = true;
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Automatically adds:
    /// - `content-type: text/plain; charset=utf-8` if the body is non-empty and no
    ///   `content-type` header was set.
    /// - `connection: keep-alive` or `connection: close`.
    /// - `content-length: <n>` (always written, replacing any handler value).
    pub fn into_bytes(self) -> BytesMut {
        self.serialize(true)
    }

    /// Like [`into_bytes`](Self::into_bytes) but without the body, for `HEAD`.
    /// `content-length` still reports the body size.
    pub fn into_head_bytes(self) -> BytesMut {
        self.serialize(false)
    }

    fn serialize(mut self, with_body: bool) -> BytesMut {
        let content_length = self.body.len();

        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers.set("content-type", "text/plain; charset=utf-8");
        }

        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        self.headers.set("connection", connection);
        self.headers.remove("content-length");

        let estimated_size = 128 + self.headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Status line
        buf.put(format!("HTTP/1.1 {}\r\n", self.status).as_bytes());

        // Headers
        buf.put(self.headers.to_string().as_bytes());

        // Content-Length is always the last header before the blank line
        buf.put(format!("content-length: {content_length}\r\n").as_bytes());

        // Header/body separator
        buf.put(&b"\r\n"[..]);

        if with_body {
            buf.put(self.body.as_bytes());
        }

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}
