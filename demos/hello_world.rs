//! A small API on top of the kernel.
//!
//! ```text
//! RUST_LOG=debug cargo run --example hello_world
//!
//! curl localhost:8080/
//! curl localhost:8080/api/users/42?fields=name
//! curl -X POST -H 'content-type: application/json' -d '{"name":"ada"}' localhost:8080/api/users
//! curl -F note=hi -F doc=@Cargo.toml localhost:8080/api/upload
//! ```
//!
//! Pass a TOML file as the first argument to override the defaults.

use rttp_kernel::http::UploadedFile;
use rttp_kernel::middleware::{LoggerMiddleware, UploadPolicy};
use rttp_kernel::security::CorsMiddleware;
use rttp_kernel::validation::{FnValidator, Validated, ValidationError, ValidationMiddleware};
use rttp_kernel::{AppConfig, Kernel, Method, Request, Response, Router, Server, StatusCode};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    let mut root = Router::new();
    root.get("/", |_req: Request| async {
        Ok(Response::new(StatusCode::Ok).body("Hello, World!"))
    });

    let mut kernel = Kernel::new();
    kernel.use_middleware(LoggerMiddleware);
    kernel.use_middleware(CorsMiddleware::new());
    kernel.mount("/api", api());
    kernel.mount("/", root);

    let server = Server::with_config(config).await?;
    println!("Listening on http://{}", server.local_addr());
    server.run(kernel).await?;
    Ok(())
}

fn api() -> Router {
    let mut api = Router::new();

    api.get("/users/:id", |req: Request| async move {
        let body = json!({
            "id": req.param("id"),
            "fields": req.query_all("fields"),
        });
        Ok(Response::json(&body)?)
    });

    let require_name = FnValidator::new(|body: &Value| match body.get("name") {
        Some(Value::String(name)) if !name.is_empty() => Ok(body.clone()),
        _ => Err(vec![
            ValidationError::new("name", "must be a non-empty string").with_code("required"),
        ]),
    });

    api.route(Method::Post, "/users")
        .with(ValidationMiddleware::new().body(require_name))
        .to(|req: Request| async move {
            let user = req
                .extensions()
                .get::<Validated>()
                .and_then(|v| v.body.clone())
                .unwrap_or(Value::Null);
            Ok(Response::json(&json!({ "created": user }))?.with_status(StatusCode::Created))
        });

    api.route(Method::Post, "/upload")
        .with(
            UploadPolicy::new()
                .max_files(2)
                .max_file_size(1024 * 1024)
                .allow_extensions(["txt", "toml", "md"]),
        )
        .to(|req: Request| async move {
            let files: Vec<Value> = req.all_files().map(describe).collect();
            Ok(Response::json(&json!({ "fields": req.body(), "files": files }))?)
        });

    // Preflight needs a matching OPTIONS route to reach the CORS middleware.
    api.options("/users", |_req: Request| async {
        Ok(Response::new(StatusCode::NoContent))
    });

    api
}

fn describe(file: &UploadedFile) -> Value {
    json!({
        "field": file.field_name(),
        "filename": file.filename(),
        "mimetype": file.mimetype(),
        "size": file.size(),
    })
}
