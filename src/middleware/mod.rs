//! Middleware pipeline: composable before/after request handler logic.
//!
//! Middleware see the request and the kernel-owned response by mutable reference and
//! decide whether the chain continues. The kernel builds the chain per request as
//! global, then router, then route middleware, and ends it with the route handler.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining chain; call [`Next::run`] to advance.
//! - [`MiddlewareHandler`]: shared, type-erased middleware as stored by routers.
//! - [`LoggerMiddleware`]: built-in request/response logger.
//! - [`UploadPolicy`]: rejects uploads by count, size, extension or mimetype.

use std::{future::Future, pin::Pin, sync::Arc};

use tokio::time::Instant;

use crate::http::{Request, Response};
use crate::router::Handler;

mod upload;

pub use upload::UploadPolicy;

/// Error type at the boundary between the framework and user code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A pinned, boxed, `Send` future borrowing for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a middleware (or the rest of the chain) reports back.
pub type MiddlewareResult = Result<(), BoxError>;

/// A type-erased, reference-counted middleware.
///
/// The [`Arc`] lets one instance be registered in several scopes and lets the kernel
/// assemble per-request chains without copying middleware state.
pub type MiddlewareHandler = Arc<dyn Middleware>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// # Examples
///
/// ```rust
/// use rttp_kernel::middleware::{LoggerMiddleware, from_middleware};
///
/// let handler = from_middleware(LoggerMiddleware);
/// ```
pub fn from_middleware<M>(middleware: M) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(middleware)
}

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is passed to each middleware's [`Middleware::handle`] implementation and is
/// consumed by [`run`](Self::run), so a middleware can continue the chain at most once.
/// Dropping it without calling `run` short-circuits everything downstream, the handler
/// included.
///
/// # Examples
///
/// ```rust
/// use rttp_kernel::http::{Request, Response};
/// use rttp_kernel::middleware::{BoxFuture, Middleware, MiddlewareResult, Next};
///
/// struct PoweredBy;
///
/// impl Middleware for PoweredBy {
///     fn handle<'a>(
///         &'a self,
///         request: &'a mut Request,
///         response: &'a mut Response,
///         next: Next<'a>,
///     ) -> BoxFuture<'a, MiddlewareResult> {
///         Box::pin(async move {
///             response.set_header("x-powered-by", "rttp");
///             next.run(request, response).await
///         })
///     }
/// }
/// ```
pub struct Next<'a> {
    remaining: &'a [MiddlewareHandler],
    handler: &'a Handler,
}

impl<'a> Next<'a> {
    /// Creates a cursor positioned at the start of `chain`, ending in `handler`.
    pub fn new(chain: &'a [MiddlewareHandler], handler: &'a Handler) -> Self {
        Self {
            remaining: chain,
            handler,
        }
    }

    /// Number of middleware still ahead of the handler.
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }

    /// Invoke the next middleware, or the handler once the chain is exhausted.
    ///
    /// Does nothing when the response has already been sent. When the handler runs,
    /// its [`Response`] is committed onto `response` (see [`Response::commit`]), which
    /// marks it sent.
    ///
    /// # Errors
    ///
    /// Whatever the next middleware or the handler returns.
    pub fn run<'r>(
        self,
        request: &'r mut Request,
        response: &'r mut Response,
    ) -> BoxFuture<'r, MiddlewareResult>
    where
        'a: 'r,
    {
        Box::pin(async move {
            if response.is_sent() {
                return Ok(());
            }

            match self.remaining.split_first() {
                Some((current, rest)) => {
                    let next = Next {
                        remaining: rest,
                        handler: self.handler,
                    };
                    current.handle(request, response, next).await
                }
                None => {
                    let result = (self.handler)(request.clone()).await?;
                    response.commit(result);
                    Ok(())
                }
            }
        })
    }
}

/// The core trait for all middleware.
///
/// Implementors receive the request, the shared response and a [`Next`] cursor. They
/// may:
///
/// - **Pass through**: `next.run(request, response).await`.
/// - **Short-circuit**: write to `response` and return without calling `next`.
/// - **Decorate**: set headers before calling `next`, or inspect the response after.
///
/// Returning `Err` aborts the chain; the kernel turns it into a 500 unless the
/// response was already sent.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    fn handle<'a>(
        &'a self,
        request: &'a mut Request,
        response: &'a mut Response,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult>;
}

impl<M: Middleware + ?Sized> Middleware for Arc<M> {
    fn handle<'a>(
        &'a self,
        request: &'a mut Request,
        response: &'a mut Response,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult> {
        (**self).handle(request, response, next)
    }
}

/// Built-in middleware that logs each request's method, path, status, and duration.
///
/// Emits a single `tracing::info!` event after the rest of the chain completes.
/// `LoggerMiddleware` never short-circuits.
///
/// # Examples
///
/// ```rust
/// use rttp_kernel::{Kernel, middleware::LoggerMiddleware};
///
/// let mut kernel = Kernel::new();
/// kernel.use_middleware(LoggerMiddleware);
/// ```
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle<'a>(
        &'a self,
        request: &'a mut Request,
        response: &'a mut Response,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            let start = Instant::now();
            let method = request.method().clone();
            let url = request.url().to_owned();

            tracing::debug!(%method, %url, "request started");

            let result = next.run(request, response).await;

            tracing::info!(
                %method,
                %url,
                status = response.status().as_u16(),
                failed = result.is_err(),
                elapsed = ?start.elapsed(),
                "request completed"
            );

            result
        })
    }
}
