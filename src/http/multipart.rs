//! `multipart/form-data` decoding (RFC 7578 / RFC 2046 framing).
//!
//! The parser is buffered: the whole body is in memory before the first part is
//! looked at. Parsing runs in two passes:
//!
//! 1. split the buffer into parts, parse each part's headers and
//!    `Content-Disposition`, and check every size/count limit;
//! 2. only if every part passed, write file bodies to the upload directory.
//!
//! A limit violation therefore never leaves temp files behind, and an I/O failure
//! in pass 2 removes the files already written. Either way the caller gets an
//! error and no partial [`MultipartData`].
//!
//! ```text
//! --BOUNDARY\r\n
//! Content-Disposition: form-data; name="title"\r\n
//! \r\n
//! hello\r\n
//! --BOUNDARY\r\n
//! Content-Disposition: form-data; name="doc"; filename="a.txt"\r\n
//! Content-Type: text/plain\r\n
//! \r\n
//! <bytes>\r\n
//! --BOUNDARY--\r\n
//! ```

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::upload::{DEFAULT_MIMETYPE, UploadedFile};
use super::{OneOrMany, insert_or_push};

/// Default maximum size of a single uploaded file (10 MiB).
pub const DEFAULT_MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

/// Default maximum size of a single non-file field (1 MiB).
pub const DEFAULT_MAX_FIELD_SIZE: usize = 1024 * 1024;

/// Default maximum number of files per body.
pub const DEFAULT_MAX_FILES: usize = 10;

/// Errors produced while constructing a parser or decoding a body.
#[derive(Debug, Error)]
pub enum MultipartError {
    #[error("invalid multipart content-type: missing boundary")]
    MissingBoundary,

    #[error("maximum file count ({max}) exceeded")]
    TooManyFiles { max: usize },

    #[error("file size exceeds maximum allowed size ({max} bytes)")]
    FileTooLarge { max: usize },

    #[error("field size exceeds maximum allowed size ({max} bytes)")]
    FieldTooLarge { max: usize },

    #[error("failed to store upload: {0}")]
    Io(#[from] io::Error),
}

impl MultipartError {
    /// `true` for the size/count limit variants, which servers report as
    /// `413 Payload Too Large`.
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(
            self,
            Self::TooManyFiles { .. } | Self::FileTooLarge { .. } | Self::FieldTooLarge { .. }
        )
    }
}

/// Size and count limits plus the directory uploads are written to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MultipartLimits {
    /// Maximum size of one file part in bytes.
    pub max_file_size: usize,
    /// Maximum size of one field part in bytes.
    pub max_field_size: usize,
    /// Maximum number of file parts.
    pub max_files: usize,
    /// Directory for upload temp files.
    pub upload_dir: PathBuf,
}

impl Default for MultipartLimits {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_field_size: DEFAULT_MAX_FIELD_SIZE,
            max_files: DEFAULT_MAX_FILES,
            upload_dir: std::env::temp_dir(),
        }
    }
}

impl MultipartLimits {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_file_size(mut self, bytes: usize) -> Self {
        self.max_file_size = bytes;
        self
    }

    #[must_use]
    pub fn max_field_size(mut self, bytes: usize) -> Self {
        self.max_field_size = bytes;
        self
    }

    #[must_use]
    pub fn max_files(mut self, count: usize) -> Self {
        self.max_files = count;
        self
    }

    #[must_use]
    pub fn upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = dir.into();
        self
    }
}

/// The decoded body: text fields and uploaded files, keyed by field name.
#[derive(Debug, Default)]
pub struct MultipartData {
    pub fields: HashMap<String, OneOrMany<String>>,
    pub files: HashMap<String, OneOrMany<UploadedFile>>,
}

impl MultipartData {
    /// First value of the field `name`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name)?.first().map(String::as_str)
    }

    /// First file uploaded under `name`.
    pub fn file(&self, name: &str) -> Option<&UploadedFile> {
        self.files.get(name)?.first()
    }

    /// Every uploaded file, in no particular order across names.
    pub fn all_files(&self) -> impl Iterator<Item = &UploadedFile> {
        self.files.values().flat_map(OneOrMany::as_slice)
    }
}

/// Decoder for one `multipart/form-data` content type.
///
/// # Examples
///
/// ```rust,no_run
/// use rttp_kernel::http::{MultipartLimits, MultipartParser};
///
/// # async fn example(body: &[u8]) -> Result<(), rttp_kernel::http::MultipartError> {
/// let parser = MultipartParser::new(
///     "multipart/form-data; boundary=X",
///     MultipartLimits::default(),
/// )?;
/// let data = parser.parse(body).await?;
/// println!("name = {:?}", data.field("name"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MultipartParser {
    boundary: String,
    // `--` + boundary, the dash-boundary of RFC 2046.
    dash_boundary: Vec<u8>,
    limits: MultipartLimits,
}

impl MultipartParser {
    /// Build a parser from a `Content-Type` header value.
    ///
    /// # Errors
    ///
    /// [`MultipartError::MissingBoundary`] if the header has no usable
    /// `boundary=` parameter. This is the only error reported here; limits are
    /// enforced by [`parse`](Self::parse).
    pub fn new(content_type: &str, limits: MultipartLimits) -> Result<Self, MultipartError> {
        let boundary = extract_boundary(content_type).ok_or(MultipartError::MissingBoundary)?;
        let dash_boundary = format!("--{boundary}").into_bytes();
        Ok(Self {
            boundary,
            dash_boundary,
            limits,
        })
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn limits(&self) -> &MultipartLimits {
        &self.limits
    }

    /// Read `reader` to the end, then [`parse`](Self::parse) the result.
    pub async fn parse_reader<R>(&self, mut reader: R) -> Result<MultipartData, MultipartError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        self.parse(&buf).await
    }

    /// Decode a complete body.
    ///
    /// # Errors
    ///
    /// - [`MultipartError::TooManyFiles`]: more than `max_files` file parts.
    /// - [`MultipartError::FileTooLarge`]: a file part exceeds `max_file_size`.
    /// - [`MultipartError::FieldTooLarge`]: a field part exceeds `max_field_size`.
    /// - [`MultipartError::Io`]: a temp file could not be written.
    pub async fn parse(&self, body: &[u8]) -> Result<MultipartData, MultipartError> {
        let entries = self.collect_entries(body)?;
        debug!(parts = entries.len(), boundary = %self.boundary, "multipart body decoded");

        let mut data = MultipartData::default();
        let mut written: Vec<PathBuf> = Vec::new();

        for entry in entries {
            match entry {
                Entry::Field { name, value } => insert_or_push(&mut data.fields, name, value),
                Entry::File {
                    name,
                    filename,
                    mimetype,
                    body,
                } => {
                    let path = match self.save_file(body).await {
                        Ok(path) => path,
                        Err(e) => {
                            for path in &written {
                                let _ = tokio::fs::remove_file(path).await;
                            }
                            return Err(e.into());
                        }
                    };
                    written.push(path.clone());
                    let file = UploadedFile::new(name.clone(), filename, mimetype, body.len(), path);
                    insert_or_push(&mut data.files, name, file);
                }
            }
        }

        Ok(data)
    }

    // Pass 1: frame, parse headers, enforce limits. Nothing touches the disk.
    fn collect_entries<'a>(&self, body: &'a [u8]) -> Result<Vec<Entry<'a>>, MultipartError> {
        let mut entries = Vec::new();
        let mut file_count = 0usize;

        for raw in split_parts(body, &self.dash_boundary) {
            let (headers, part_body) = parse_part(raw);

            let Some(disposition) = header_value(&headers, "content-disposition") else {
                continue;
            };
            let Disposition { name, filename } = parse_content_disposition(disposition);
            let Some(name) = name.filter(|n| !n.is_empty()) else {
                continue;
            };

            match filename.filter(|f| !f.is_empty()) {
                Some(filename) => {
                    file_count += 1;
                    if file_count > self.limits.max_files {
                        return Err(MultipartError::TooManyFiles {
                            max: self.limits.max_files,
                        });
                    }
                    if part_body.len() > self.limits.max_file_size {
                        return Err(MultipartError::FileTooLarge {
                            max: self.limits.max_file_size,
                        });
                    }
                    let mimetype = header_value(&headers, "content-type")
                        .filter(|m| !m.is_empty())
                        .unwrap_or(DEFAULT_MIMETYPE)
                        .to_owned();
                    entries.push(Entry::File {
                        name,
                        filename,
                        mimetype,
                        body: part_body,
                    });
                }
                None => {
                    if part_body.len() > self.limits.max_field_size {
                        return Err(MultipartError::FieldTooLarge {
                            max: self.limits.max_field_size,
                        });
                    }
                    let value = String::from_utf8_lossy(part_body).into_owned();
                    entries.push(Entry::Field { name, value });
                }
            }
        }

        Ok(entries)
    }

    async fn save_file(&self, body: &[u8]) -> io::Result<PathBuf> {
        let path = temp_file_path(&self.limits.upload_dir);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(body).await?;
        file.flush().await?;
        Ok(path)
    }
}

enum Entry<'a> {
    Field {
        name: String,
        value: String,
    },
    File {
        name: String,
        filename: String,
        mimetype: String,
        body: &'a [u8],
    },
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Disposition {
    name: Option<String>,
    filename: Option<String>,
}

/// `upload_<unix millis>_<8 random bytes as hex>` inside `dir`.
fn temp_file_path(dir: &Path) -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    dir.join(format!("upload_{millis}_{:016x}", fastrand::u64(..)))
}

/// Pull the `boundary` parameter out of a `Content-Type` value.
fn extract_boundary(content_type: &str) -> Option<String> {
    const KEY: &str = "boundary=";
    let start = content_type.to_ascii_lowercase().find(KEY)? + KEY.len();
    let rest = &content_type[start..];
    let raw = rest.split(';').next().unwrap_or_default().trim();
    let boundary = unquote(raw);
    (!boundary.is_empty()).then(|| boundary.to_owned())
}

/// Split `buf` into the raw bytes of each complete part.
///
/// Everything before the first dash-boundary is preamble. Each part ends at the
/// next `\r\n--boundary`; a delimiter followed by `--` closes the body. A final
/// segment with no delimiter after it is unterminated and dropped.
fn split_parts<'a>(buf: &'a [u8], dash_boundary: &[u8]) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();

    let Some(first) = find(buf, dash_boundary, 0) else {
        return parts;
    };
    let mut start = first + dash_boundary.len();
    if buf[start..].starts_with(b"--") {
        return parts;
    }
    start += 2;

    let mut delimiter = Vec::with_capacity(dash_boundary.len() + 2);
    delimiter.extend_from_slice(b"\r\n");
    delimiter.extend_from_slice(dash_boundary);

    while start <= buf.len() {
        let Some(end) = find(buf, &delimiter, start) else {
            break;
        };
        parts.push(&buf[start..end]);

        let after = end + delimiter.len();
        if buf[after..].starts_with(b"--") {
            break;
        }
        start = after + 2;
    }

    parts
}

/// Split one part at the first blank line into lower-cased headers and body.
fn parse_part(part: &[u8]) -> (Vec<(String, String)>, &[u8]) {
    let Some(header_end) = find(part, b"\r\n\r\n", 0) else {
        return (Vec::new(), part);
    };

    let section = String::from_utf8_lossy(&part[..header_end]);
    let headers = section
        .split("\r\n")
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim().to_ascii_lowercase(), value.trim().to_owned()))
        })
        .collect();

    (headers, &part[header_end + 4..])
}

fn header_value<'h>(headers: &'h [(String, String)], name: &str) -> Option<&'h str> {
    headers
        .iter()
        .rev()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Parse `form-data; name="x"; filename="y"`. Semicolons inside quotes do not
/// split parameters.
fn parse_content_disposition(value: &str) -> Disposition {
    let mut disposition = Disposition::default();

    for param in split_params(value) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "name" => disposition.name = Some(unquote(raw.trim()).to_owned()),
            "filename" => disposition.filename = Some(unquote(raw.trim()).to_owned()),
            _ => {}
        }
    }

    disposition
}

fn split_params(value: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;

    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                params.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    params.push(value[start..].trim());
    params
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}
