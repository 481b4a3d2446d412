//! # rttp-kernel
//!
//! The request-processing core of an async HTTP/1.1 framework: a method-keyed
//! [`Router`] with `:param` patterns, a [`Kernel`] that runs global, router and route
//! middleware around the matched handler, and a `multipart/form-data` parser that
//! decodes a buffered body and writes each uploaded file to a temporary file.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rttp_kernel::middleware::LoggerMiddleware;
//! use rttp_kernel::{Kernel, Request, Response, Router, Server, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!     router.get("/users/:id", |req: Request| async move {
//!         let id = req.param("id").unwrap_or_default().to_owned();
//!         Ok(Response::new(StatusCode::Ok).body(format!("user {id}")))
//!     });
//!
//!     let mut kernel = Kernel::new();
//!     kernel.use_middleware(LoggerMiddleware);
//!     kernel.mount("/api", router);
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server.run(kernel).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod http;
pub mod kernel;
pub mod middleware;
pub mod router;
pub mod security;
pub mod server;
pub mod validation;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::AppConfig;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use kernel::Kernel;
pub use middleware::{Middleware, Next};
pub use router::{Router, handler};
pub use server::{Server, ServerError};
