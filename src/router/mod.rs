//! Request routing: map URL patterns and HTTP methods to handler functions.
//!
//! This module provides [`Router`], which resolves `(method, path)` pairs to a
//! registered [`Route`] plus the path parameters it captured. Two segment styles are
//! supported:
//!
//! | Pattern              | Example match              | Captured params              |
//! |----------------------|----------------------------|------------------------------|
//! | `/users`             | `/users`                   | *(none)*                     |
//! | `/users/:id`         | `/users/42`                | `id → "42"`                  |
//!
//! Matching is anchored and segment-exact: a path matches only when it has the same
//! number of `/`-separated segments as the pattern. Trailing slashes are significant,
//! so `/users/` does not match `/users`, and a capture never spans a `/`.
//!
//! Routes are kept per method and matched in registration order; the first route
//! whose pattern matches wins. Routing does not execute anything: running middleware
//! and the handler is the [`Kernel`](crate::Kernel)'s job.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::Parameters;
use crate::http::{Method, Request, Response};
use crate::middleware::{BoxError, BoxFuture, Middleware, MiddlewareHandler, from_middleware};

/// What a handler produces: a response, or an error the kernel turns into a 500.
pub type HandlerResult = Result<Response, BoxError>;

/// Type-erased, heap-allocated async handler that consumes a [`Request`] and returns a
/// [`HandlerResult`].
///
/// Handlers are stored behind `Arc<dyn Fn(…)>` so they can be shared across tasks
/// without copying the underlying closure. In practice you never construct this type
/// directly: use [`Router::get`] and the other method-specific helpers, or
/// [`handler`] when you need one outside a router.
pub type Handler = Arc<dyn Fn(Request) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static>;

/// Erase an async closure into a [`Handler`].
///
/// # Examples
///
/// ```rust
/// use rttp_kernel::http::{Request, Response, StatusCode};
/// use rttp_kernel::router::handler;
///
/// let h = handler(|_req: Request| async { Ok(Response::new(StatusCode::NoContent)) });
/// ```
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

// A single path segment, either a literal string or a named capture (`:name`).
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Static(String),
    Parameter(String),
}

/// A compiled route pattern.
///
/// Compiled once at registration; matching never re-parses the pattern string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    source: String,
    segments: Vec<Segment>,
}

impl Pattern {
    /// Compile a pattern string.
    ///
    /// The string is split on `/`. A segment of the form `:name` with a non-empty
    /// `name` becomes a capture; every other segment, including a bare `:`, is
    /// matched literally.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use rttp_kernel::router::Pattern;
    ///
    /// let p = Pattern::parse("/users/:id");
    /// assert_eq!(p.parameter_names().collect::<Vec<_>>(), vec!["id"]);
    /// assert_eq!(p.matches("/users/42").unwrap().get("id"), Some("42"));
    /// assert!(p.matches("/users/").is_none());
    /// ```
    pub fn parse(pattern: &str) -> Self {
        let segments = pattern
            .split('/')
            .map(|s| match s.strip_prefix(':') {
                Some(name) if !name.is_empty() => Segment::Parameter(name.to_owned()),
                _ => Segment::Static(s.to_owned()),
            })
            .collect();

        Self {
            source: pattern.to_owned(),
            segments,
        }
    }

    /// The pattern string as registered.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Capture names in the order they appear.
    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|seg| match seg {
            Segment::Parameter(name) => Some(name.as_str()),
            Segment::Static(_) => None,
        })
    }

    /// Match `path` against this pattern, returning the captures on success.
    pub fn matches(&self, path: &str) -> Option<Parameters> {
        let mut params = Parameters::new();
        let mut path_segments = path.split('/');

        for seg in &self.segments {
            let path_seg = path_segments.next()?;
            match seg {
                Segment::Static(s) => {
                    if s != path_seg {
                        return None;
                    }
                }
                Segment::Parameter(name) => {
                    if path_seg.is_empty() {
                        return None;
                    }
                    params.insert(name.as_str(), path_seg);
                }
            }
        }

        if path_segments.next().is_some() {
            return None;
        }

        Some(params)
    }
}

/// A registered route: pattern, handler and route-scoped middleware.
///
/// Immutable once registered.
pub struct Route {
    method: Method,
    pattern: Pattern,
    handler: Handler,
    middleware: Vec<MiddlewareHandler>,
}

impl Route {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Route-scoped middleware, in registration order.
    pub fn middleware(&self) -> &[MiddlewareHandler] {
        &self.middleware
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern.as_str())
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

/// The result of a successful [`Router::resolve`].
#[derive(Debug)]
pub struct RouteMatch<'r> {
    pub route: &'r Route,
    pub params: Parameters,
}

/// HTTP request router.
///
/// Routes are evaluated in registration order within their method; the first route
/// whose pattern matches is returned. Router-scoped middleware registered with
/// [`use_middleware`](Self::use_middleware) runs for every route of this router once
/// it is mounted on a [`Kernel`](crate::Kernel).
///
/// # Examples
///
/// ```rust
/// use rttp_kernel::{Method, Router, Response, StatusCode};
///
/// let mut router = Router::new();
///
/// router.get("/ping", |_req| async { Ok(Response::new(StatusCode::Ok).body("pong")) });
///
/// router.get("/users/:id", |req| async move {
///     let id = req.param("id").unwrap_or("unknown").to_owned();
///     Ok(Response::new(StatusCode::Ok).body(id))
/// });
///
/// let found = router.resolve(&Method::Get, "/users/42").unwrap();
/// assert_eq!(found.params.get("id"), Some("42"));
/// assert!(router.resolve(&Method::Post, "/users/42").is_none());
/// ```
#[derive(Default)]
pub struct Router {
    routes: HashMap<Method, Vec<Route>>,
    middleware: Vec<MiddlewareHandler>,
}

impl Router {
    /// Create a new, empty `Router` with no registered routes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use rttp_kernel::Router;
    ///
    /// let router = Router::new();
    /// assert!(router.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route with route-scoped middleware.
    ///
    /// Appends to the method's list: no deduplication and no conflict detection, so
    /// an earlier registration shadows a later one with an equivalent pattern.
    pub fn add_route(
        &mut self,
        method: Method,
        pattern: &str,
        handler: Handler,
        middleware: Vec<MiddlewareHandler>,
    ) {
        tracing::debug!(%method, pattern, middleware = middleware.len(), "route registered");
        self.routes.entry(method.clone()).or_default().push(Route {
            method,
            pattern: Pattern::parse(pattern),
            handler,
            middleware,
        });
    }

    /// Register a handler for `GET` requests matching `pattern`.
    ///
    /// # Arguments
    ///
    /// - `pattern`: URL pattern string (e.g. `"/users"` or `"/users/:id"`).
    /// - `handler`: Async function that receives the [`Request`] and returns a
    ///   [`HandlerResult`].
    pub fn get<F, Fut>(&mut self, pattern: &str, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_route(Method::Get, pattern, self::handler(handler), Vec::new());
    }

    /// Register a handler for `POST` requests matching `pattern`.
    pub fn post<F, Fut>(&mut self, pattern: &str, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_route(Method::Post, pattern, self::handler(handler), Vec::new());
    }

    /// Register a handler for `PUT` requests matching `pattern`.
    pub fn put<F, Fut>(&mut self, pattern: &str, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_route(Method::Put, pattern, self::handler(handler), Vec::new());
    }

    /// Register a handler for `DELETE` requests matching `pattern`.
    pub fn delete<F, Fut>(&mut self, pattern: &str, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_route(Method::Delete, pattern, self::handler(handler), Vec::new());
    }

    /// Register a handler for `PATCH` requests matching `pattern`.
    pub fn patch<F, Fut>(&mut self, pattern: &str, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_route(Method::Patch, pattern, self::handler(handler), Vec::new());
    }

    /// Register a handler for `OPTIONS` requests matching `pattern`.
    pub fn options<F, Fut>(&mut self, pattern: &str, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_route(Method::Options, pattern, self::handler(handler), Vec::new());
    }

    /// Register a handler for `HEAD` requests matching `pattern`.
    ///
    /// `HEAD` is never answered by a `GET` route; register it explicitly.
    pub fn head<F, Fut>(&mut self, pattern: &str, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_route(Method::Head, pattern, self::handler(handler), Vec::new());
    }

    /// Start registering a route that carries its own middleware.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use rttp_kernel::{Method, Router, Response, StatusCode};
    /// use rttp_kernel::middleware::LoggerMiddleware;
    ///
    /// let mut router = Router::new();
    /// router
    ///     .route(Method::Post, "/users")
    ///     .with(LoggerMiddleware)
    ///     .to(|_req| async { Ok(Response::new(StatusCode::Created)) });
    ///
    /// let found = router.resolve(&Method::Post, "/users").unwrap();
    /// assert_eq!(found.route.middleware().len(), 1);
    /// ```
    pub fn route(&mut self, method: Method, pattern: &str) -> RouteBuilder<'_> {
        RouteBuilder {
            router: self,
            method,
            pattern: pattern.to_owned(),
            middleware: Vec::new(),
        }
    }

    /// Append router-scoped middleware.
    pub fn use_middleware(&mut self, middleware: impl Middleware + 'static) {
        self.middleware.push(from_middleware(middleware));
    }

    /// Router-scoped middleware, in registration order.
    pub fn middleware(&self) -> &[MiddlewareHandler] {
        &self.middleware
    }

    /// Resolve `(method, path)` to the first matching route and its parameters.
    ///
    /// `None` means no route matched; it is not an error.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<RouteMatch<'_>> {
        self.routes.get(method)?.iter().find_map(|route| {
            route
                .pattern
                .matches(path)
                .map(|params| RouteMatch { route, params })
        })
    }

    /// Return the number of routes registered in this router, across all methods.
    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.len())
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

/// Fluent registration of a route with route-scoped middleware.
///
/// Created by [`Router::route`]; nothing is registered until [`to`](Self::to).
#[must_use = "a route is only registered when `to` is called"]
pub struct RouteBuilder<'r> {
    router: &'r mut Router,
    method: Method,
    pattern: String,
    middleware: Vec<MiddlewareHandler>,
}

impl RouteBuilder<'_> {
    /// Add route middleware. Repeatable; order is kept.
    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(from_middleware(middleware));
        self
    }

    /// Register the route with `handler`.
    pub fn to<F, Fut>(self, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.router
            .add_route(self.method, &self.pattern, self::handler(handler), self.middleware);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;
    use crate::middleware::LoggerMiddleware;

    fn noop() -> Handler {
        handler(|_req: Request| async { Ok(Response::new(StatusCode::Ok)) })
    }

    fn status_handler(status: StatusCode) -> Handler {
        handler(move |_req: Request| async move { Ok(Response::new(status)) })
    }

    async fn call(found: RouteMatch<'_>) -> StatusCode {
        let request = Request::new(Method::Get, "/").with_params(found.params);
        (found.route.handler)(request).await.unwrap().status()
    }

    // ── Pattern::parse ────────────────────────────────────────────────────────

    #[test]
    fn pattern_parse_root() {
        let pat = Pattern::parse("/");
        assert_eq!(pat.segments, vec![Segment::Static(String::new()); 2]);
    }

    #[test]
    fn pattern_parse_parameterized_multi() {
        let pat = Pattern::parse("/users/:id/posts/:post_id");
        assert_eq!(pat.segments.len(), 5);
        assert_eq!(pat.segments[2], Segment::Parameter("id".to_owned()));
        assert_eq!(pat.segments[4], Segment::Parameter("post_id".to_owned()));
        assert_eq!(pat.parameter_names().collect::<Vec<_>>(), vec!["id", "post_id"]);
    }

    #[test]
    fn pattern_parse_bare_colon_is_literal() {
        let pat = Pattern::parse("/a/:");
        assert_eq!(pat.segments[2], Segment::Static(":".to_owned()));
        assert!(pat.matches("/a/:").is_some());
        assert!(pat.matches("/a/x").is_none());
    }

    // ── Pattern::matches ──────────────────────────────────────────────────────

    #[test]
    fn pattern_exact_match() {
        let pat = Pattern::parse("/users");
        assert!(pat.matches("/users").is_some());
        assert!(pat.matches("/posts").is_none());
    }

    #[test]
    fn pattern_trailing_slash_is_significant() {
        assert!(Pattern::parse("/users").matches("/users/").is_none());
        assert!(Pattern::parse("/users/").matches("/users").is_none());
        assert!(Pattern::parse("/users/").matches("/users/").is_some());
    }

    #[test]
    fn pattern_root() {
        let pat = Pattern::parse("/");
        assert!(pat.matches("/").is_some());
        assert!(pat.matches("/other").is_none());
        assert!(pat.matches("").is_none());
    }

    #[test]
    fn pattern_param_extracts_value() {
        let params = Pattern::parse("/users/:id").matches("/users/42").unwrap();
        assert_eq!(params.get("id"), Some("42"));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn pattern_param_rejects_empty_segment() {
        let pat = Pattern::parse("/users/:id");
        assert!(pat.matches("/users/").is_none());
        assert!(pat.matches("/users//").is_none());
    }

    #[test]
    fn pattern_param_never_spans_segments() {
        let pat = Pattern::parse("/users/:id");
        assert!(pat.matches("/users").is_none());
        assert!(pat.matches("/users/42/extra").is_none());
    }

    #[test]
    fn pattern_params_keep_capture_order_and_raw_text() {
        let params = Pattern::parse("/u/:user/p/:post")
            .matches("/u/a%20b/p/99")
            .unwrap();
        let pairs: Vec<_> = params.iter().collect();
        assert_eq!(pairs, vec![("user", "a%20b"), ("post", "99")]);
    }

    // ── Router::resolve ───────────────────────────────────────────────────────

    #[test]
    fn router_starts_empty() {
        let router = Router::new();
        assert!(router.is_empty());
        assert!(router.resolve(&Method::Get, "/").is_none());
    }

    #[test]
    fn router_len_counts_all_methods() {
        let mut router = Router::new();
        router.get("/a", |_req| async { Ok(Response::new(StatusCode::Ok)) });
        router.post("/b", |_req| async { Ok(Response::new(StatusCode::Ok)) });
        assert_eq!(router.len(), 2);
    }

    #[test]
    fn router_resolves_by_method() {
        let mut router = Router::new();
        router.add_route(Method::Get, "/hello", noop(), Vec::new());
        assert!(router.resolve(&Method::Get, "/hello").is_some());
        assert!(router.resolve(&Method::Post, "/hello").is_none());
    }

    #[test]
    fn head_and_options_are_not_derived_from_get() {
        let mut router = Router::new();
        router.add_route(Method::Get, "/r", noop(), Vec::new());
        assert!(router.resolve(&Method::Head, "/r").is_none());
        assert!(router.resolve(&Method::Options, "/r").is_none());
    }

    #[test]
    fn users_id_scenario() {
        let mut router = Router::new();
        router.add_route(Method::Get, "/users/:id", noop(), Vec::new());

        let found = router.resolve(&Method::Get, "/users/42").unwrap();
        assert_eq!(found.params, [("id", "42")].into_iter().collect::<Parameters>());
        assert!(router.resolve(&Method::Get, "/users/").is_none());
    }

    #[tokio::test]
    async fn first_registered_route_wins() {
        let mut router = Router::new();
        router.add_route(Method::Get, "/path", status_handler(StatusCode::Ok), Vec::new());
        router.add_route(Method::Get, "/path", status_handler(StatusCode::Accepted), Vec::new());

        let found = router.resolve(&Method::Get, "/path").unwrap();
        assert_eq!(call(found).await, StatusCode::Ok);
    }

    #[tokio::test]
    async fn parameter_name_shadowing_follows_registration_order() {
        let mut router = Router::new();
        router.add_route(Method::Get, "/items/:id", status_handler(StatusCode::Ok), Vec::new());
        router.add_route(Method::Get, "/items/:slug", status_handler(StatusCode::Accepted), Vec::new());

        let found = router.resolve(&Method::Get, "/items/x").unwrap();
        assert_eq!(found.params.get("id"), Some("x"));
        assert!(found.params.get("slug").is_none());
        assert_eq!(call(found).await, StatusCode::Ok);
    }

    #[tokio::test]
    async fn static_route_registered_first_beats_capture() {
        let mut router = Router::new();
        router.add_route(Method::Get, "/users/me", status_handler(StatusCode::Accepted), Vec::new());
        router.add_route(Method::Get, "/users/:id", status_handler(StatusCode::Ok), Vec::new());

        let me = router.resolve(&Method::Get, "/users/me").unwrap();
        assert!(me.params.is_empty());
        assert_eq!(call(me).await, StatusCode::Accepted);

        let other = router.resolve(&Method::Get, "/users/7").unwrap();
        assert_eq!(call(other).await, StatusCode::Ok);
    }

    #[test]
    fn method_helpers_register_under_their_method() {
        let mut router = Router::new();
        router.put("/r", |_req| async { Ok(Response::new(StatusCode::Ok)) });
        router.delete("/r", |_req| async { Ok(Response::new(StatusCode::Ok)) });
        router.patch("/r", |_req| async { Ok(Response::new(StatusCode::Ok)) });
        router.options("/r", |_req| async { Ok(Response::new(StatusCode::Ok)) });
        router.head("/r", |_req| async { Ok(Response::new(StatusCode::Ok)) });
        assert_eq!(router.len(), 5);
        for method in [Method::Put, Method::Delete, Method::Patch, Method::Options, Method::Head] {
            let found = router.resolve(&method, "/r").unwrap();
            assert_eq!(found.route.method(), &method);
        }
    }

    #[test]
    fn route_builder_keeps_middleware_order() {
        let mut router = Router::new();
        router.use_middleware(LoggerMiddleware);
        router
            .route(Method::Post, "/items/:id")
            .with(LoggerMiddleware)
            .with(LoggerMiddleware)
            .to(|_req| async { Ok(Response::new(StatusCode::Created)) });

        let found = router.resolve(&Method::Post, "/items/1").unwrap();
        assert_eq!(found.route.pattern().as_str(), "/items/:id");
        assert_eq!(found.route.middleware().len(), 2);
        assert_eq!(router.middleware().len(), 1);
    }
}
