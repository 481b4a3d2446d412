//! Uploaded files and the guard that cleans up after them.
//!
//! [`UploadedFile`] describes one file part written to disk by the
//! [`MultipartParser`](super::MultipartParser). The descriptor owns its temp file:
//! whoever holds it either moves the file somewhere permanent ([`move_to`],
//! [`save_to`]) or deletes it. [`UploadScope`] backs that up for the lifetime of a
//! request: anything still sitting at a temp path when the scope is released (or
//! dropped, on an early return or panic) is removed.
//!
//! [`move_to`]: UploadedFile::move_to
//! [`save_to`]: UploadedFile::save_to

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Mimetype recorded when a file part carries no `Content-Type` header.
pub const DEFAULT_MIMETYPE: &str = "application/octet-stream";

/// Descriptor for a file received in a `multipart/form-data` body.
///
/// Deliberately not `Clone`: there is one handle per temp file.
#[derive(Debug, PartialEq, Eq)]
pub struct UploadedFile {
    field_name: String,
    filename: String,
    mimetype: String,
    size: usize,
    temp_path: PathBuf,
}

impl UploadedFile {
    pub fn new(
        field_name: impl Into<String>,
        filename: impl Into<String>,
        mimetype: impl Into<String>,
        size: usize,
        temp_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            filename: filename.into(),
            mimetype: mimetype.into(),
            size,
            temp_path: temp_path.into(),
        }
    }

    /// Name of the form field the file was sent under.
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// Client-supplied filename, exactly as sent.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn mimetype(&self) -> &str {
        &self.mimetype
    }

    /// Size of the file body in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Extension of the client filename without the dot, if it has one.
    ///
    /// ```
    /// use rttp_kernel::http::UploadedFile;
    ///
    /// let file = UploadedFile::new("doc", "report.final.PDF", "application/pdf", 3, "/tmp/x");
    /// assert_eq!(file.extension(), Some("PDF"));
    /// assert_eq!(file.stem(), "report.final");
    /// ```
    pub fn extension(&self) -> Option<&str> {
        Path::new(self.basename())
            .extension()
            .and_then(|ext| ext.to_str())
    }

    /// Client filename with directories and the extension stripped.
    pub fn stem(&self) -> &str {
        let base = self.basename();
        match self.extension() {
            Some(ext) => &base[..base.len() - ext.len() - 1],
            None => base,
        }
    }

    pub fn is_image(&self) -> bool {
        self.mimetype.starts_with("image/")
    }

    pub fn is_mimetype(&self, mimetype: &str) -> bool {
        self.mimetype.eq_ignore_ascii_case(mimetype)
    }

    /// Read the whole file into memory.
    pub async fn read(&self) -> io::Result<Vec<u8>> {
        tokio::fs::read(&self.temp_path).await
    }

    /// Read the whole file as UTF-8 text.
    pub async fn read_to_string(&self) -> io::Result<String> {
        tokio::fs::read_to_string(&self.temp_path).await
    }

    /// Move the temp file to `destination`.
    ///
    /// Falls back to copy-then-delete when the destination is on another
    /// filesystem.
    pub async fn move_to(&self, destination: impl AsRef<Path>) -> io::Result<()> {
        let destination = destination.as_ref();
        match tokio::fs::rename(&self.temp_path, destination).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                tokio::fs::copy(&self.temp_path, destination).await?;
                tokio::fs::remove_file(&self.temp_path).await
            }
            Err(e) => Err(e),
        }
    }

    /// Move the file into `directory`, named `new_name` or the client filename.
    ///
    /// Only the final component of either name is used, so a client filename
    /// such as `../../etc/passwd` lands as `directory/passwd`.
    pub async fn save_to(
        &self,
        directory: impl AsRef<Path>,
        new_name: Option<&str>,
    ) -> io::Result<PathBuf> {
        let name = new_name.unwrap_or(&self.filename);
        let name = Path::new(name)
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty file name"))?;
        let destination = directory.as_ref().join(name);
        self.move_to(&destination).await?;
        Ok(destination)
    }

    /// Delete the temp file. Deleting an already-removed file is not an error.
    pub async fn delete(&self) -> io::Result<()> {
        match tokio::fs::remove_file(&self.temp_path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn basename(&self) -> &str {
        Path::new(&self.filename)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.filename)
    }
}

/// Request-scoped ownership of upload temp files.
///
/// The server creates one scope per request and tracks every temp path the
/// multipart parser produced. When the request is done, [`release`](Self::release)
/// deletes whatever is still there; files that a handler moved or deleted are
/// already gone and are skipped. If the scope is dropped without being released,
/// remaining files are removed synchronously in `Drop`.
#[derive(Debug, Default)]
pub struct UploadScope {
    paths: Vec<PathBuf>,
}

impl UploadScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take responsibility for `path`.
    pub fn track(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }

    /// Track the temp path of every file in `files`.
    pub fn track_files<'a>(&mut self, files: impl IntoIterator<Item = &'a UploadedFile>) {
        self.paths
            .extend(files.into_iter().map(|f| f.temp_path.clone()));
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Delete every tracked file that still exists.
    ///
    /// Failures are logged and do not stop the remaining deletions. Returns the
    /// number of files removed.
    pub async fn release(mut self) -> usize {
        let mut removed = 0;
        for path in std::mem::take(&mut self.paths) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to remove upload temp file");
                }
            }
        }
        if removed > 0 {
            debug!(removed, "upload temp files cleaned up");
        }
        removed
    }
}

impl Drop for UploadScope {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove upload temp file");
                }
            }
        }
    }
}
