//! Security middleware.
//!
//! - [`CorsMiddleware`]: Cross-Origin Resource Sharing header injection and
//!   preflight (`OPTIONS`) short-circuiting.

mod middleware;

pub use middleware::CorsMiddleware;
