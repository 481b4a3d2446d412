//! Async TCP server using Tokio.
//!
//! Accepts TCP connections, turns the bytes of each HTTP/1.1 request into a
//! [`Request`] (head, query, body parsed by content type, uploads written to temp
//! files) and dispatches it to a shared [`Kernel`]. Supports HTTP/1.1 persistent
//! connections (keep-alive) out of the box.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, ServerConfig};
use crate::http::request::{Files, RequestError, parse_query_string};
use crate::http::{
    Method, MultipartError, MultipartLimits, MultipartParser, Request, RequestHead, Response,
    StatusCode, UploadScope,
};
use crate::kernel::Kernel;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// The HTTP server.
///
/// Binds to a TCP address and dispatches incoming HTTP/1.1 requests to a
/// [`Kernel`].
///
/// # Examples
///
/// ```rust,no_run
/// use rttp_kernel::{Kernel, Response, Router, StatusCode};
/// use rttp_kernel::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut router = Router::new();
///     router.get("/", |_req| async { Ok(Response::new(StatusCode::Ok).body("Hello!")) });
///
///     let mut kernel = Kernel::new();
///     kernel.mount("/", router);
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(kernel).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Arc<AppConfig>,
}

impl Server {
    /// Binds the server to the given TCP address with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let config = AppConfig {
            server: ServerConfig {
                bind_address: addr.as_ref().to_owned(),
                ..ServerConfig::default()
            },
            ..AppConfig::default()
        };
        Self::with_config(config).await
    }

    /// Binds to `config.server.bind_address` and applies the request and upload
    /// limits from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn with_config(config: AppConfig) -> Result<Self, ServerError> {
        let addr = config.server.bind_address.as_str();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            config: Arc::new(config),
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and dispatching requests to `kernel`.
    ///
    /// Runs until the process is terminated.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run(self, kernel: Kernel) -> Result<(), ServerError> {
        self.run_until(kernel, std::future::pending()).await
    }

    /// Like [`run`](Self::run), but stops accepting new connections once `shutdown`
    /// completes. Connections already being served finish on their own tasks.
    pub async fn run_until<S>(self, kernel: Kernel, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()> + Send,
    {
        let kernel = Arc::new(kernel);
        info!(address = %self.local_addr, "rttp listening");

        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                () = &mut shutdown => {
                    info!(address = %self.local_addr, "shutting down");
                    return Ok(());
                }
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let kernel = Arc::clone(&kernel);
            let config = Arc::clone(&self.config);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, kernel, config).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// A JSON `{"error": message}` response that closes the connection.
fn error_response(status: StatusCode, message: &str) -> Response {
    Response::new(status)
        .header("content-type", "application/json")
        .body(json!({ "error": message }).to_string())
        .keep_alive(false)
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, serving one request per
/// iteration, until the peer closes the connection or signals `Connection: close`.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    kernel: Arc<Kernel>,
    config: Arc<AppConfig>,
) -> Result<(), std::io::Error> {
    let limits = &config.server;
    let mut buf = BytesMut::with_capacity(limits.initial_buffer_size);

    loop {
        // Parse whatever is buffered first: a pipelined request may already be here.
        let parsed = if buf.is_empty() {
            Err(RequestError::Incomplete)
        } else {
            RequestHead::parse(&buf)
        };

        let (head, body_offset) = match parsed {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                if buf.len() > limits.max_request_size {
                    warn!(peer = %peer_addr, "request head too large, sending 413");
                    let response =
                        error_response(StatusCode::PayloadTooLarge, "Request entity too large");
                    stream.write_all(&response.into_bytes()).await?;
                    break;
                }
                if stream.read_buf(&mut buf).await? == 0 {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = error_response(StatusCode::BadRequest, &format!("Bad Request: {e}"));
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        if head.headers.contains("transfer-encoding") {
            warn!(peer = %peer_addr, "chunked request bodies are not supported, sending 501");
            let response = error_response(
                StatusCode::NotImplemented,
                "Transfer-Encoding is not supported",
            );
            stream.write_all(&response.into_bytes()).await?;
            break;
        }

        // Guard against excessively large requests before buffering the body.
        let content_length = head.content_length().unwrap_or(0);
        let total_needed = body_offset
            .checked_add(content_length)
            .filter(|&total| total <= limits.max_request_size);
        let Some(total_needed) = total_needed else {
            let error = RequestError::TooLarge {
                max_bytes: limits.max_request_size,
            };
            warn!(peer = %peer_addr, error = %error, "sending 413");
            let response = error_response(StatusCode::PayloadTooLarge, &error.to_string());
            stream.write_all(&response.into_bytes()).await?;
            break;
        };

        // Wait for the full body to arrive.
        while buf.len() < total_needed {
            if stream.read_buf(&mut buf).await? == 0 {
                debug!(peer = %peer_addr, "connection closed mid-body");
                return Ok(());
            }
        }

        let mut raw = buf.split_to(total_needed).freeze();
        let body = raw.split_off(body_offset);

        let keep_alive = head.is_keep_alive();
        let is_head = head.method == Method::Head;

        let mut scope = UploadScope::new();
        let response = match build_request(head, body, &config.multipart, &mut scope).await {
            Ok(request) => {
                debug!(
                    peer = %peer_addr,
                    method = %request.method(),
                    path = %request.path(),
                    "dispatching request"
                );
                kernel.handle(request).await
            }
            Err(response) => response,
        };

        // Either side may ask to close: the request head or the response.
        let keep_alive = keep_alive && response.is_keep_alive();
        let response = response.keep_alive(keep_alive);

        let bytes = if is_head {
            response.into_head_bytes()
        } else {
            response.into_bytes()
        };
        let written = async {
            stream.write_all(&bytes).await?;
            stream.flush().await
        }
        .await;

        scope.release().await;
        written?;

        if !keep_alive {
            debug!(peer = %peer_addr, "connection: close, shutting down");
            break;
        }
    }

    Ok(())
}

/// Assemble the [`Request`] for a parsed head and its complete body.
///
/// Uploaded files are tracked in `scope` as soon as they exist. A body that cannot
/// be parsed yields the error response to send instead.
pub(crate) async fn build_request(
    head: RequestHead,
    body: Bytes,
    limits: &MultipartLimits,
    scope: &mut UploadScope,
) -> Result<Request, Response> {
    let content_type = head.headers.get("content-type").map(str::to_owned);
    let request = Request::from_head(head);

    if body.is_empty() {
        return Ok(request);
    }

    let media_type = content_type
        .as_deref()
        .and_then(|ct| ct.split(';').next())
        .map(|mt| mt.trim().to_ascii_lowercase())
        .unwrap_or_default();

    let (parsed, files) = match media_type.as_str() {
        "multipart/form-data" => {
            let (fields, files) =
                parse_multipart(content_type.as_deref().unwrap_or_default(), &body, limits, scope)
                    .await?;
            (fields, Some(files))
        }
        "application/json" => match serde_json::from_slice::<Value>(&body) {
            Ok(value) => (value, None),
            Err(e) => {
                debug!(error = %e, "rejecting malformed JSON body");
                return Err(error_response(StatusCode::BadRequest, "Invalid JSON body"));
            }
        },
        "application/x-www-form-urlencoded" => {
            let form = parse_query_string(&String::from_utf8_lossy(&body));
            (serde_json::to_value(form).unwrap_or(Value::Null), None)
        }
        _ => (Value::String(String::from_utf8_lossy(&body).into_owned()), None),
    };

    let request = request.with_body(parsed).with_raw_body(body);
    Ok(match files {
        Some(files) => request.with_files(files),
        None => request,
    })
}

async fn parse_multipart(
    content_type: &str,
    body: &[u8],
    limits: &MultipartLimits,
    scope: &mut UploadScope,
) -> Result<(Value, Files), Response> {
    let parsed = match MultipartParser::new(content_type, limits.clone()) {
        Ok(parser) => parser.parse(body).await,
        Err(e) => Err(e),
    };

    match parsed {
        Ok(data) => {
            scope.track_files(data.all_files());
            let fields = serde_json::to_value(&data.fields).unwrap_or(Value::Null);
            Ok((fields, data.files))
        }
        Err(e) => {
            warn!(error = %e, "multipart body rejected");
            let status = match &e {
                e if e.is_limit_exceeded() => StatusCode::PayloadTooLarge,
                MultipartError::Io(_) => StatusCode::InternalServerError,
                _ => StatusCode::BadRequest,
            };
            Err(error_response(status, &e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(raw: &str) -> RequestHead {
        RequestHead::parse(raw.as_bytes()).unwrap().0
    }

    async fn build(raw_head: &str, body: &'static [u8], limits: &MultipartLimits) -> (Result<Request, Response>, UploadScope) {
        let mut scope = UploadScope::new();
        let result = build_request(head(raw_head), Bytes::from_static(body), limits, &mut scope).await;
        (result, scope)
    }

    #[tokio::test]
    async fn json_body_is_parsed() {
        let (result, _) = build(
            "POST /items HTTP/1.1\r\nContent-Type: application/json\r\n\r\n",
            br#"{"name":"widget","tags":["a"]}"#,
            &MultipartLimits::default(),
        )
        .await;
        let request = result.unwrap();
        assert_eq!(request.body()["name"], "widget");
        assert_eq!(request.raw_body().len(), 30);
    }

    #[tokio::test]
    async fn malformed_json_is_400() {
        let (result, _) = build(
            "POST / HTTP/1.1\r\nContent-Type: application/json\r\n\r\n",
            b"{not json",
            &MultipartLimits::default(),
        )
        .await;
        let response = result.unwrap_err();
        assert_eq!(response.status(), StatusCode::BadRequest);
    }

    #[tokio::test]
    async fn urlencoded_body_becomes_object() {
        let (result, _) = build(
            "POST / HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\n",
            b"name=J%C3%B6rg&tag=a&tag=b",
            &MultipartLimits::default(),
        )
        .await;
        let request = result.unwrap();
        assert_eq!(request.body()["name"], "Jörg");
        assert_eq!(request.body()["tag"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn other_content_is_text() {
        let (result, _) = build(
            "POST / HTTP/1.1\r\nContent-Type: text/plain\r\n\r\n",
            b"hello",
            &MultipartLimits::default(),
        )
        .await;
        assert_eq!(result.unwrap().body(), &json!("hello"));
    }

    #[tokio::test]
    async fn empty_body_is_null() {
        let (result, _) = build("GET /?a=1 HTTP/1.1\r\n\r\n", b"", &MultipartLimits::default()).await;
        let request = result.unwrap();
        assert!(request.body().is_null());
        assert_eq!(request.query("a"), Some("1"));
    }

    #[tokio::test]
    async fn multipart_files_are_tracked_for_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let limits = MultipartLimits::default().upload_dir(dir.path());
        let (result, scope) = build(
            "POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=X\r\n\r\n",
            b"--X\r\nContent-Disposition: form-data; name=\"name\"\r\n\r\nok\r\n\
--X\r\nContent-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\
Content-Type: text/plain\r\n\r\nhi\r\n--X--\r\n",
            &limits,
        )
        .await;

        let request = result.unwrap();
        assert_eq!(request.body(), &json!({"name": "ok"}));
        let doc = request.file("doc").unwrap();
        assert_eq!(doc.size(), 2);
        assert!(doc.temp_path().exists());

        assert_eq!(scope.len(), 1);
        assert_eq!(scope.release().await, 1);
        assert!(!doc.temp_path().exists());
    }

    #[tokio::test]
    async fn multipart_errors_map_to_status() {
        let dir = tempfile::tempdir().unwrap();
        let limits = MultipartLimits::default().upload_dir(dir.path()).max_field_size(1);

        let (missing_boundary, _) = build(
            "POST / HTTP/1.1\r\nContent-Type: multipart/form-data\r\n\r\n",
            b"--X--",
            &limits,
        )
        .await;
        assert_eq!(missing_boundary.unwrap_err().status(), StatusCode::BadRequest);

        let (too_large, scope) = build(
            "POST / HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=X\r\n\r\n",
            b"--X\r\nContent-Disposition: form-data; name=\"f\"\r\n\r\ntoo long\r\n--X--\r\n",
            &limits,
        )
        .await;
        assert_eq!(too_large.unwrap_err().status(), StatusCode::PayloadTooLarge);
        assert!(scope.is_empty());
    }
}
