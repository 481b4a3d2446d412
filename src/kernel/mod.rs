//! The request dispatch core.
//!
//! A [`Kernel`] owns the global middleware and the routers mounted at path prefixes.
//! [`Kernel::handle`] resolves each request against the mounts, assembles the
//! middleware chain (global, then router, then route) and drives it to the handler.
//! It always produces a [`Response`]: no route is a 404, and an error or panic
//! anywhere in the pipeline becomes a 500 unless the response was already sent.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tracing::{debug, error, warn};

use crate::http::{Method, Request, Response, StatusCode};
use crate::middleware::{Middleware, MiddlewareHandler, Next, from_middleware};
use crate::router::{RouteMatch, Router};

// A router mounted under a path prefix.
struct Mount {
    prefix: String,
    router: Router,
}

impl Mount {
    // The path the router should see, or `None` when `path` is not under the prefix.
    //
    // Segment-aware: `/api` takes `/api` and `/api/...` but not `/api-admin`. A
    // prefix ending in `/` is a plain prefix and keeps that slash on the remainder.
    fn strip<'p>(&self, path: &'p str) -> Option<&'p str> {
        let prefix = self.prefix.as_str();
        if prefix.is_empty() || prefix == "/" {
            return Some(path);
        }
        if let Some(base) = prefix.strip_suffix('/') {
            return path.starts_with(prefix).then(|| &path[base.len()..]);
        }
        let rest = path.strip_prefix(prefix)?;
        if rest.is_empty() {
            Some("/")
        } else if rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }
}

/// Global middleware plus routers mounted at path prefixes.
///
/// Built once during setup, then shared immutably (typically behind an `Arc`) by
/// every connection task.
///
/// # Examples
///
/// ```rust
/// use rttp_kernel::{Kernel, Method, Request, Response, Router, StatusCode};
/// use rttp_kernel::middleware::LoggerMiddleware;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut api = Router::new();
/// api.get("/ping", |_req| async { Ok(Response::new(StatusCode::Ok).body("pong")) });
///
/// let mut kernel = Kernel::new();
/// kernel.use_middleware(LoggerMiddleware);
/// kernel.mount("/api", api);
///
/// let response = kernel.handle(Request::new(Method::Get, "/api/ping")).await;
/// assert_eq!(response.content().as_str(), Some("pong"));
///
/// let missing = kernel.handle(Request::new(Method::Get, "/ping")).await;
/// assert_eq!(missing.status(), StatusCode::NotFound);
/// # }
/// ```
#[derive(Default)]
pub struct Kernel {
    middleware: Vec<MiddlewareHandler>,
    mounts: Vec<Mount>,
}

impl Kernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append global middleware. It runs for every request that matches a route.
    pub fn use_middleware(&mut self, middleware: impl Middleware + 'static) {
        self.middleware.push(from_middleware(middleware));
    }

    /// Mount `router` under `prefix`.
    ///
    /// Several routers may be mounted, under the same prefix or different ones; they
    /// are tried in mount order and the first that resolves the request wins, even
    /// when a later mount has a longer prefix.
    pub fn mount(&mut self, prefix: &str, router: Router) {
        debug!(prefix, routes = router.len(), "router mounted");
        self.mounts.push(Mount {
            prefix: prefix.to_owned(),
            router,
        });
    }

    /// Global middleware, in registration order.
    pub fn middleware(&self) -> &[MiddlewareHandler] {
        &self.middleware
    }

    /// Dispatch `request` through the pipeline and return the finished response.
    ///
    /// Never fails and never panics outward. The returned response is always marked
    /// sent.
    pub async fn handle(&self, request: Request) -> Response {
        let mut response = Response::new(StatusCode::Ok);

        let Some((router, found)) = self.find_route(request.method(), request.path()) else {
            debug!(method = %request.method(), path = %request.path(), "no route matched");
            response.set_status(StatusCode::NotFound);
            response.send("Not Found");
            response.mark_sent();
            return response;
        };

        let chain: Vec<MiddlewareHandler> = self
            .middleware
            .iter()
            .chain(router.middleware())
            .chain(found.route.middleware())
            .cloned()
            .collect();

        debug!(
            method = %request.method(),
            path = %request.path(),
            pattern = found.route.pattern().as_str(),
            middleware = chain.len(),
            "dispatching"
        );

        let mut request = request.with_params(found.params);
        let next = Next::new(&chain, found.route.handler());

        let outcome = AssertUnwindSafe(next.run(&mut request, &mut response))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(format!("panic: {}", panic_message(panic.as_ref()))),
        };

        if let Some(message) = failure {
            if response.is_sent() {
                warn!(path = %request.path(), error = %message, "pipeline failed after response was sent");
            } else {
                error!(path = %request.path(), error = %message, "pipeline failed");
                response.set_status(StatusCode::InternalServerError);
                response.set_header("content-type", "text/plain; charset=utf-8");
                response.send("Internal Server Error");
            }
        }

        response.mark_sent();
        response
    }

    // First mount (in mount order) whose router resolves the request.
    fn find_route(&self, method: &Method, path: &str) -> Option<(&Router, RouteMatch<'_>)> {
        self.mounts.iter().find_map(|mount| {
            let path = mount.strip(path)?;
            mount
                .router
                .resolve(method, path)
                .map(|found| (&mount.router, found))
        })
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("middleware", &self.middleware.len())
            .field(
                "mounts",
                &self.mounts.iter().map(|m| m.prefix.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
