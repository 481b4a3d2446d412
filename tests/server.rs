//! End-to-end tests: real TCP connections against a running server.

use std::path::Path;

use rttp_kernel::config::{AppConfig, ServerConfig};
use rttp_kernel::http::MultipartLimits;
use rttp_kernel::middleware::{LoggerMiddleware, UploadPolicy};
use rttp_kernel::{Kernel, Method, Request, Response, Router, Server, StatusCode};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    fn text(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}

struct TestServer {
    addr: std::net::SocketAddr,
    _shutdown: oneshot::Sender<()>,
}

async fn start(config: AppConfig, kernel: Kernel) -> TestServer {
    let server = Server::with_config(config).await.unwrap();
    let addr = server.local_addr();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(server.run_until(kernel, async {
        let _ = rx.await;
    }));
    TestServer {
        addr,
        _shutdown: tx,
    }
}

fn config(upload_dir: &Path) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            bind_address: "127.0.0.1:0".to_owned(),
            max_request_size: 64 * 1024,
            ..ServerConfig::default()
        },
        multipart: MultipartLimits::default()
            .upload_dir(upload_dir)
            .max_file_size(1024),
    }
}

fn app() -> Kernel {
    let mut api = Router::new();
    api.get("/hello/:name", |req: Request| async move {
        let name = req.param("name").unwrap_or_default().to_owned();
        Ok(Response::new(StatusCode::Ok).body(format!("hello {name}")))
    });
    api.post("/echo", |req: Request| async move {
        Ok(Response::json(&json!({ "body": req.body(), "query": req.query_json() }))?)
    });
    api.route(Method::Post, "/upload")
        .with(UploadPolicy::new().allow_extensions(["txt"]))
        .to(|req: Request| async move {
            let mut files = Vec::new();
            for file in req.all_files() {
                files.push(json!({
                    "name": file.filename(),
                    "content": file.read_to_string().await?,
                    "path": file.temp_path(),
                }));
            }
            Ok(Response::json(&json!({ "fields": req.body(), "files": files }))?)
        });

    let mut kernel = Kernel::new();
    kernel.use_middleware(LoggerMiddleware);
    kernel.mount("/api", api);
    kernel
}

async fn read_reply(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Reply {
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before response head");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8(buf[..head_end].to_vec()).unwrap();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    let status = status_line.split(' ').nth(1).unwrap().parse().unwrap();
    let headers: Vec<(String, String)> = lines
        .filter(|l| !l.is_empty())
        .filter_map(|l| l.split_once(": "))
        .map(|(n, v)| (n.to_owned(), v.to_owned()))
        .collect();

    let length: usize = headers
        .iter()
        .find(|(n, _)| n == "content-length")
        .map(|(_, v)| v.parse().unwrap())
        .unwrap_or(0);

    while buf.len() < head_end + length {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before response body");
        buf.extend_from_slice(&chunk[..n]);
    }

    let body = buf[head_end..head_end + length].to_vec();
    buf.drain(..head_end + length);
    Reply {
        status,
        headers,
        body,
    }
}

async fn roundtrip(server: &TestServer, raw: &[u8]) -> Reply {
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    read_reply(&mut stream, &mut Vec::new()).await
}

fn multipart(boundary: &str, parts: &[(&str, Option<&str>, &str)]) -> Vec<u8> {
    let mut body = String::new();
    for (name, filename, content) in parts {
        body.push_str(&format!("--{boundary}\r\n"));
        match filename {
            Some(filename) => body.push_str(&format!(
                "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                 Content-Type: text/plain\r\n\r\n"
            )),
            None => body.push_str(&format!(
                "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"
            )),
        }
        body.push_str(content);
        body.push_str("\r\n");
    }
    body.push_str(&format!("--{boundary}--\r\n"));
    body.into_bytes()
}

fn post(path: &str, content_type: &str, body: &[u8], close: bool) -> Vec<u8> {
    let connection = if close { "Connection: close\r\n" } else { "" };
    let mut raw = format!(
        "POST {path} HTTP/1.1\r\nHost: test\r\nContent-Type: {content_type}\r\n\
         Content-Length: {}\r\n{connection}\r\n",
        body.len()
    )
    .into_bytes();
    raw.extend_from_slice(body);
    raw
}

// ── Routing ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn serves_route_with_params() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(config(dir.path()), app()).await;

    let reply = roundtrip(&server, b"GET /api/hello/ada HTTP/1.1\r\nHost: test\r\n\r\n").await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.text(), "hello ada");
    assert_eq!(reply.header("content-length"), Some("9"));
    assert_eq!(reply.header("connection"), Some("keep-alive"));
}

#[tokio::test]
async fn unknown_path_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(config(dir.path()), app()).await;

    let reply = roundtrip(&server, b"GET /nope HTTP/1.1\r\nHost: test\r\n\r\n").await;
    assert_eq!(reply.status, 404);
    assert_eq!(reply.text(), "Not Found");
}

#[tokio::test]
async fn head_request_has_no_body() {
    let dir = tempfile::tempdir().unwrap();
    let mut kernel = Kernel::new();
    let mut router = Router::new();
    router.head("/status", |_req: Request| async {
        Ok(Response::new(StatusCode::Ok).body("up"))
    });
    kernel.mount("/", router);
    let server = start(config(dir.path()), kernel).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"HEAD /status HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8(raw).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("content-length: 2\r\n"));
    assert!(text.ends_with("\r\n\r\n"));
}

// ── Bodies ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn json_body_and_query_reach_handler() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(config(dir.path()), app()).await;

    let raw = post("/api/echo?page=2", "application/json", br#"{"a":[1,2]}"#, true);
    let reply = roundtrip(&server, &raw).await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("content-type"), Some("application/json"));
    assert_eq!(
        reply.json(),
        json!({ "body": { "a": [1, 2] }, "query": { "page": "2" } })
    );
}

#[tokio::test]
async fn malformed_json_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(config(dir.path()), app()).await;

    let reply = roundtrip(&server, &post("/api/echo", "application/json", b"{", true)).await;
    assert_eq!(reply.status, 400);
    assert!(reply.json()["error"].is_string());
}

#[tokio::test]
async fn oversized_request_is_413() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(config(dir.path()), app()).await;

    // Only the head is sent: the declared length alone must trigger the rejection.
    let raw = b"POST /api/echo HTTP/1.1\r\nHost: test\r\nContent-Length: 71680\r\n\r\n";
    let reply = roundtrip(&server, raw).await;
    assert_eq!(reply.status, 413);
    assert_eq!(reply.header("connection"), Some("close"));
}

#[tokio::test]
async fn content_length_near_usize_max_is_413() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(config(dir.path()), app()).await;

    let raw = format!(
        "POST /api/echo HTTP/1.1\r\nHost: test\r\nContent-Length: {}\r\n\r\n",
        usize::MAX
    );
    let reply = roundtrip(&server, raw.as_bytes()).await;
    assert_eq!(reply.status, 413);
    assert_eq!(reply.header("connection"), Some("close"));
}

// ── Uploads ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn multipart_upload_is_parsed_and_cleaned_up() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(config(dir.path()), app()).await;

    let body = multipart(
        "Bnd42",
        &[("note", None, "hi"), ("doc", Some("notes.txt"), "file body")],
    );
    let raw = post("/api/upload", "multipart/form-data; boundary=Bnd42", &body, true);

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(&raw).await.unwrap();
    let reply = read_reply(&mut stream, &mut Vec::new()).await;

    assert_eq!(reply.status, 200);
    let json = reply.json();
    assert_eq!(json["fields"], json!({ "note": "hi" }));
    assert_eq!(json["files"][0]["name"], "notes.txt");
    assert_eq!(json["files"][0]["content"], "file body");

    // Temp files are removed once the response has been written.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    let temp_path = json["files"][0]["path"].as_str().unwrap().to_owned();
    assert!(!Path::new(&temp_path).exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn upload_policy_rejects_extension() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(config(dir.path()), app()).await;

    let body = multipart("B", &[("doc", Some("run.exe"), "MZ")]);
    let raw = post("/api/upload", "multipart/form-data; boundary=B", &body, true);
    let reply = roundtrip(&server, &raw).await;

    assert_eq!(reply.status, 400);
    assert!(reply.json()["error"].as_str().unwrap().contains("exe"));
}

#[tokio::test]
async fn upload_over_file_limit_is_413() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(config(dir.path()), app()).await;

    let big = "y".repeat(2048);
    let body = multipart("B", &[("doc", Some("big.txt"), &big)]);
    let raw = post("/api/upload", "multipart/form-data; boundary=B", &body, true);
    let reply = roundtrip(&server, &raw).await;

    assert_eq!(reply.status, 413);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

// ── Connections ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn keep_alive_serves_pipelined_requests() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(config(dir.path()), app()).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(
            b"GET /api/hello/one HTTP/1.1\r\nHost: test\r\n\r\n\
              GET /api/hello/two HTTP/1.1\r\nHost: test\r\n\r\n",
        )
        .await
        .unwrap();

    let mut buf = Vec::new();
    let first = read_reply(&mut stream, &mut buf).await;
    let second = read_reply(&mut stream, &mut buf).await;
    assert_eq!(first.text(), "hello one");
    assert_eq!(second.text(), "hello two");

    stream
        .write_all(b"GET /api/hello/three HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let third = read_reply(&mut stream, &mut buf).await;
    assert_eq!(third.text(), "hello three");
    assert_eq!(third.header("connection"), Some("close"));

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn malformed_request_line_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(config(dir.path()), app()).await;

    let reply = roundtrip(&server, b"NOT A VALID\x01 REQUEST\r\n\r\n").await;
    assert_eq!(reply.status, 400);
}

#[tokio::test]
async fn handler_can_close_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let mut router = Router::new();
    router.get("/bye", |_req: Request| async {
        Ok(Response::new(StatusCode::Ok).body("bye").keep_alive(false))
    });
    let mut kernel = Kernel::new();
    kernel.mount("/", router);
    let server = start(config(dir.path()), kernel).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /bye HTTP/1.1\r\nHost: test\r\n\r\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    let reply = read_reply(&mut stream, &mut buf).await;
    assert_eq!(reply.text(), "bye");
    assert_eq!(reply.header("connection"), Some("close"));

    // The server hangs up even though the request asked for keep-alive.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty() && buf.is_empty());
}
