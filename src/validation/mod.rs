//! Request validation.
//!
//! A [`Validator`] turns an input [`serde_json::Value`] into a validated value or a
//! list of [`ValidationError`]s. [`ValidationMiddleware`] runs validators against the
//! four parts of a request (body, query, route parameters, headers, in that order),
//! answers with a single error response when anything fails, and otherwise records
//! the validated values as a [`Validated`] request extension for the handler.
//!
//! Concrete rule sets (string lengths, numeric ranges, object shapes) are not part of
//! this crate; plug them in through the trait or [`FnValidator`].

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};

use crate::http::{Request, Response, StatusCode};
use crate::middleware::{BoxFuture, Middleware, MiddlewareResult, Next};

/// One failed check.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path of the offending field, e.g. `body.email`.
    pub field: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Machine-readable error code, e.g. `too_short`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            value: None,
            code: None,
        }
    }

    #[must_use]
    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Nest this error under `prefix`: `email` becomes `body.email`, and an error on
    /// the whole value (empty field) becomes `body`.
    #[must_use]
    pub fn prefixed(mut self, prefix: &str) -> Self {
        self.field = match (prefix.is_empty(), self.field.is_empty()) {
            (true, _) => self.field,
            (false, true) => prefix.to_owned(),
            (false, false) => format!("{prefix}.{}", self.field),
        };
        self
    }
}

/// The validated (possibly transformed) value, or every error found.
pub type ValidationResult = Result<Value, Vec<ValidationError>>;

/// A check over a JSON value.
///
/// Implement [`validate`](Self::validate); override
/// [`validate_async`](Self::validate_async) only for checks that need I/O. The
/// middleware always calls the async form.
pub trait Validator: Send + Sync {
    fn validate(&self, value: &Value) -> ValidationResult;

    fn validate_async<'a>(&'a self, value: &'a Value) -> BoxFuture<'a, ValidationResult> {
        Box::pin(async move { self.validate(value) })
    }
}

/// Adapts a closure into a [`Validator`].
///
/// # Examples
///
/// ```rust
/// use rttp_kernel::validation::{FnValidator, ValidationError, Validator};
/// use serde_json::json;
///
/// let has_email = FnValidator::new(|value: &serde_json::Value| match value.get("email") {
///     Some(email) if email.is_string() => Ok(value.clone()),
///     _ => Err(vec![ValidationError::new("email", "is required").with_code("required")]),
/// });
///
/// assert!(has_email.validate(&json!({"email": "a@b.c"})).is_ok());
/// let errors = has_email.validate(&json!({})).unwrap_err();
/// assert_eq!(errors[0].field, "email");
/// ```
pub struct FnValidator<F>(F);

impl<F> FnValidator<F>
where
    F: Fn(&Value) -> ValidationResult + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Validator for FnValidator<F>
where
    F: Fn(&Value) -> ValidationResult + Send + Sync,
{
    fn validate(&self, value: &Value) -> ValidationResult {
        (self.0)(value)
    }
}

/// Values that passed validation, stored in the request extensions.
///
/// A section is `Some` only when a validator was configured for it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validated {
    pub body: Option<Value>,
    pub query: Option<Value>,
    pub params: Option<Value>,
    pub headers: Option<Value>,
}

type SharedValidator = Arc<dyn Validator>;
type ErrorFormatter = Arc<dyn Fn(&[ValidationError]) -> Value + Send + Sync>;

/// Middleware that validates request sections before the handler runs.
///
/// On failure the response is `422 Unprocessable Entity` (configurable) with:
///
/// ```json
/// {"error": "Validation failed", "errors": [{"field": "body.email", "message": "..."}]}
/// ```
///
/// and the chain stops. Errors from every section are collected unless
/// [`abort_early`](Self::abort_early) is set, in which case the first failing section
/// ends validation.
///
/// # Examples
///
/// ```rust
/// use rttp_kernel::validation::{FnValidator, ValidationError, ValidationMiddleware};
///
/// let require_id = FnValidator::new(|v: &serde_json::Value| {
///     if v.get("id").is_some() {
///         Ok(v.clone())
///     } else {
///         Err(vec![ValidationError::new("id", "is required")])
///     }
/// });
///
/// let middleware = ValidationMiddleware::new().body(require_id).abort_early(true);
/// ```
pub struct ValidationMiddleware {
    body: Option<SharedValidator>,
    query: Option<SharedValidator>,
    params: Option<SharedValidator>,
    headers: Option<SharedValidator>,
    status: StatusCode,
    abort_early: bool,
    message: String,
    format_errors: Option<ErrorFormatter>,
}

impl Default for ValidationMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationMiddleware {
    pub fn new() -> Self {
        Self {
            body: None,
            query: None,
            params: None,
            headers: None,
            status: StatusCode::UnprocessableEntity,
            abort_early: false,
            message: "Validation failed".to_owned(),
            format_errors: None,
        }
    }

    /// Validate the parsed request body.
    #[must_use]
    pub fn body(mut self, validator: impl Validator + 'static) -> Self {
        self.body = Some(Arc::new(validator));
        self
    }

    /// Validate the decoded query, as an object of strings (arrays for repeated keys).
    #[must_use]
    pub fn query(mut self, validator: impl Validator + 'static) -> Self {
        self.query = Some(Arc::new(validator));
        self
    }

    /// Validate the route parameters, as an object of strings.
    #[must_use]
    pub fn params(mut self, validator: impl Validator + 'static) -> Self {
        self.params = Some(Arc::new(validator));
        self
    }

    /// Validate the headers, as an object keyed by lower-cased name.
    #[must_use]
    pub fn headers(mut self, validator: impl Validator + 'static) -> Self {
        self.headers = Some(Arc::new(validator));
        self
    }

    /// Status of the error response. Defaults to 422.
    #[must_use]
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn abort_early(mut self, abort: bool) -> Self {
        self.abort_early = abort;
        self
    }

    /// Top-level `error` message of the error response.
    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Replace the `errors` value of the error response with `format(errors)`.
    ///
    /// ```rust
    /// use rttp_kernel::validation::ValidationMiddleware;
    ///
    /// let middleware = ValidationMiddleware::new().format_errors(|errors| {
    ///     serde_json::json!(errors.iter().map(|e| e.to_string()).collect::<Vec<_>>())
    /// });
    /// ```
    #[must_use]
    pub fn format_errors<F>(mut self, format: F) -> Self
    where
        F: Fn(&[ValidationError]) -> Value + Send + Sync + 'static,
    {
        self.format_errors = Some(Arc::new(format));
        self
    }

    /// Run the configured validators against `request`.
    pub async fn check(&self, request: &Request) -> Result<Validated, Vec<ValidationError>> {
        let sections: [(&str, Option<&SharedValidator>, fn(&Request) -> Value); 4] = [
            ("body", self.body.as_ref(), |r| r.body().clone()),
            ("query", self.query.as_ref(), Request::query_json),
            ("params", self.params.as_ref(), |r| r.params().to_json()),
            ("headers", self.headers.as_ref(), |r| r.headers().to_json()),
        ];

        let mut validated = Validated::default();
        let mut errors = Vec::new();

        for (name, validator, extract) in sections {
            let Some(validator) = validator else {
                continue;
            };
            let input = extract(request);
            match validator.validate_async(&input).await {
                Ok(value) => {
                    let slot = match name {
                        "body" => &mut validated.body,
                        "query" => &mut validated.query,
                        "params" => &mut validated.params,
                        _ => &mut validated.headers,
                    };
                    *slot = Some(value);
                }
                Err(section_errors) => {
                    errors.extend(section_errors.into_iter().map(|e| e.prefixed(name)));
                    if self.abort_early {
                        break;
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(validated)
        } else {
            Err(errors)
        }
    }
}

impl Middleware for ValidationMiddleware {
    fn handle<'a>(
        &'a self,
        request: &'a mut Request,
        response: &'a mut Response,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            match self.check(request).await {
                Ok(validated) => {
                    request.extensions_mut().insert(validated);
                    next.run(request, response).await
                }
                Err(errors) => {
                    tracing::debug!(path = %request.path(), errors = errors.len(), "validation failed");
                    let errors = match &self.format_errors {
                        Some(format) => format(&errors),
                        None => serde_json::to_value(&errors)?,
                    };
                    response.set_status(self.status);
                    response.send_json(&json!({ "error": self.message, "errors": errors }))?;
                    response.mark_sent();
                    Ok(())
                }
            }
        })
    }
}
