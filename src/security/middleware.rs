use crate::http::{Method, Request, Response, StatusCode};
use crate::middleware::{BoxFuture, Middleware, MiddlewareResult, Next};

// Which origins may read responses.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AllowedOrigins {
    Any,
    List(Vec<String>),
}

/// CORS middleware: validates the `Origin` header, answers preflight requests and
/// sets `access-control-*` headers before the rest of the chain runs.
///
/// Constructed via [`CorsMiddleware::new`] and further configured through the
/// builder methods.
///
/// # Behavior
///
/// - With the default any-origin policy, `access-control-allow-origin: *` is set
///   whether or not the request carries an `Origin`. When credentials are allowed
///   the request origin is echoed instead, since browsers reject `*` with
///   credentials.
/// - With an allow-list, a listed origin is echoed back together with
///   `vary: origin`; any other origin (or none) passes through with no CORS headers.
/// - `OPTIONS` requests are short-circuited with `204 No Content` whatever the
///   origin; the downstream handler is **not** called. A disallowed origin gets the
///   method and header lists but no `access-control-allow-origin`. Preflight only
///   reaches this middleware when an `OPTIONS` route matches the path.
///
/// # Examples
///
/// ```rust
/// use rttp_kernel::security::CorsMiddleware;
///
/// let cors = CorsMiddleware::new()
///     .allow_origin("https://example.com")
///     .allow_header("X-Custom-Header")
///     .allow_credentials(true)
///     .max_age(600);
/// ```
#[derive(Debug, Clone)]
pub struct CorsMiddleware {
    origins: AllowedOrigins,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
    credentials: bool,
    max_age: u32,
}

impl Default for CorsMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl CorsMiddleware {
    /// Creates a new `CorsMiddleware` with permissive defaults.
    ///
    /// | Setting          | Default value                                   |
    /// |------------------|-------------------------------------------------|
    /// | Allowed origins  | `*` (all origins)                               |
    /// | Allowed methods  | `GET`, `POST`, `PUT`, `DELETE`, `PATCH`, `OPTIONS` |
    /// | Allowed headers  | `Content-Type`, `Authorization`                 |
    /// | Credentials      | not allowed                                     |
    /// | Max age          | 86400 seconds                                   |
    pub fn new() -> Self {
        Self {
            origins: AllowedOrigins::Any,
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"]
                .map(str::to_owned)
                .to_vec(),
            allowed_headers: vec!["Content-Type".to_owned(), "Authorization".to_owned()],
            credentials: false,
            max_age: 86_400,
        }
    }

    /// Restricts the policy to an allow-list and adds `origin` to it.
    ///
    /// The first call replaces the any-origin default. Passing `"*"` switches back to
    /// allowing every origin.
    ///
    /// ```rust
    /// use rttp_kernel::security::CorsMiddleware;
    ///
    /// let cors = CorsMiddleware::new()
    ///     .allow_origin("https://app.example.com")
    ///     .allow_origin("https://staging.example.com");
    /// ```
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        let origin = origin.into();
        if origin == "*" {
            self.origins = AllowedOrigins::Any;
            return self;
        }
        match &mut self.origins {
            AllowedOrigins::List(list) => list.push(origin),
            AllowedOrigins::Any => self.origins = AllowedOrigins::List(vec![origin]),
        }
        self
    }

    /// Adds an allowed HTTP method, sent verbatim in `access-control-allow-methods`.
    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        let method = method.into();
        if !self.allowed_methods.iter().any(|m| m.eq_ignore_ascii_case(&method)) {
            self.allowed_methods.push(method);
        }
        self
    }

    /// Adds an allowed request header, sent verbatim in `access-control-allow-headers`.
    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allowed_headers.push(header.into());
        self
    }

    #[must_use]
    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.credentials = allow;
        self
    }

    /// How long (in seconds) browsers may cache a preflight result.
    #[must_use]
    pub fn max_age(mut self, seconds: u32) -> Self {
        self.max_age = seconds;
        self
    }

    // The `access-control-allow-origin` value for `origin`, and whether it varies by
    // origin. `None` when the origin is not allowed.
    fn resolve_origin(&self, origin: Option<&str>) -> Option<(String, bool)> {
        match (&self.origins, origin) {
            (AllowedOrigins::Any, Some(origin)) if self.credentials => {
                Some((origin.to_owned(), true))
            }
            (AllowedOrigins::Any, _) => Some(("*".to_owned(), false)),
            (AllowedOrigins::List(list), Some(origin)) if list.iter().any(|o| o == origin) => {
                Some((origin.to_owned(), true))
            }
            (AllowedOrigins::List(_), _) => None,
        }
    }

    fn apply_origin(response: &mut Response, allow_origin: String, vary: bool) {
        response.set_header("access-control-allow-origin", allow_origin);
        if vary {
            response.append_header("vary", "Origin");
        }
    }

    fn apply_policy(&self, response: &mut Response) {
        if self.credentials {
            response.set_header("access-control-allow-credentials", "true");
        }
        response.set_header("access-control-allow-methods", self.allowed_methods.join(", "));
        response.set_header("access-control-allow-headers", self.allowed_headers.join(", "));
        response.set_header("access-control-max-age", self.max_age.to_string());
    }
}

impl Middleware for CorsMiddleware {
    fn handle<'a>(
        &'a self,
        request: &'a mut Request,
        response: &'a mut Response,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            let allowed = self.resolve_origin(request.header_value("origin"));
            let preflight = request.method() == &Method::Options;

            match allowed {
                Some((allow_origin, vary)) => {
                    Self::apply_origin(response, allow_origin, vary);
                    self.apply_policy(response);
                }
                None => {
                    tracing::debug!(
                        origin = request.header_value("origin").unwrap_or_default(),
                        "origin not allowed by CORS policy"
                    );
                    if !preflight {
                        return next.run(request, response).await;
                    }
                    self.apply_policy(response);
                }
            }

            if preflight {
                response.set_status(StatusCode::NoContent);
                response.send("");
                response.mark_sent();
                return Ok(());
            }

            next.run(request, response).await
        })
    }
}
