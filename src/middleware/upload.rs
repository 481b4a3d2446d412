use serde_json::json;

use super::{BoxFuture, Middleware, MiddlewareResult, Next};
use crate::http::{Request, Response, StatusCode, UploadedFile};

/// Route-level checks on the files of a multipart request.
///
/// The multipart parser already enforces the hard limits from configuration; this
/// policy narrows them for one route and adds extension and mimetype allow-lists.
/// A rejected request gets `400 Bad Request` with `{"error": "..."}` and the handler
/// does not run. Requests without files pass straight through.
///
/// # Examples
///
/// ```rust
/// use rttp_kernel::middleware::UploadPolicy;
///
/// let avatars = UploadPolicy::new()
///     .max_files(1)
///     .max_file_size(512 * 1024)
///     .allow_extensions(["png", ".JPG"])
///     .allow_mimetypes(["image/png", "image/jpeg"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct UploadPolicy {
    max_files: Option<usize>,
    max_file_size: Option<usize>,
    extensions: Option<Vec<String>>,
    mimetypes: Option<Vec<String>>,
}

impl UploadPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_files(mut self, max: usize) -> Self {
        self.max_files = Some(max);
        self
    }

    #[must_use]
    pub fn max_file_size(mut self, max: usize) -> Self {
        self.max_file_size = Some(max);
        self
    }

    /// Accept only these extensions. Matching ignores case and a leading dot.
    #[must_use]
    pub fn allow_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions = Some(
            extensions
                .into_iter()
                .map(|ext| ext.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        );
        self
    }

    /// Accept only these mimetypes (case-insensitive).
    #[must_use]
    pub fn allow_mimetypes<I, S>(mut self, mimetypes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.mimetypes = Some(
            mimetypes
                .into_iter()
                .map(|m| m.as_ref().to_ascii_lowercase())
                .collect(),
        );
        self
    }

    /// The first violation in `files`, as a client-facing message.
    pub fn check<'f>(&self, files: impl IntoIterator<Item = &'f UploadedFile>) -> Result<(), String> {
        let files: Vec<&UploadedFile> = files.into_iter().collect();

        if let Some(max) = self.max_files {
            if files.len() > max {
                return Err(format!("Too many files uploaded. Maximum allowed: {max}"));
            }
        }

        for file in files {
            if let Some(max) = self.max_file_size {
                if file.size() > max {
                    return Err(format!(
                        "File \"{}\" exceeds maximum size of {max} bytes",
                        file.filename()
                    ));
                }
            }

            if let Some(allowed) = &self.extensions {
                let ext = file.extension().unwrap_or_default().to_ascii_lowercase();
                if !allowed.contains(&ext) {
                    return Err(format!(
                        "File extension \"{ext}\" is not allowed. Allowed extensions: {}",
                        allowed.join(", ")
                    ));
                }
            }

            if let Some(allowed) = &self.mimetypes {
                if !allowed.iter().any(|m| file.is_mimetype(m)) {
                    return Err(format!(
                        "File type \"{}\" is not allowed. Allowed types: {}",
                        file.mimetype(),
                        allowed.join(", ")
                    ));
                }
            }
        }

        Ok(())
    }
}

impl Middleware for UploadPolicy {
    fn handle<'a>(
        &'a self,
        request: &'a mut Request,
        response: &'a mut Response,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            if let Err(message) = self.check(request.all_files()) {
                tracing::warn!(path = %request.path(), %message, "upload rejected");
                response.set_status(StatusCode::BadRequest);
                response.send_json(&json!({ "error": message }))?;
                response.mark_sent();
                return Ok(());
            }
            next.run(request, response).await
        })
    }
}
