//! Application configuration.
//!
//! [`AppConfig`] is a plain value: build it in code, or load it from TOML with
//! [`AppConfig::load`] / [`AppConfig::from_toml_str`], then hand it to the
//! [`Server`](crate::server::Server). Every section and field is optional in the file;
//! missing ones take their defaults.
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0:8080"
//! max_request_size = 16777216
//!
//! [multipart]
//! max_file_size = 5242880
//! max_files = 4
//! upload_dir = "/var/tmp/uploads"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::http::MultipartLimits;

/// Default bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
pub const DEFAULT_INITIAL_BUFFER_SIZE: usize = 4096;

/// Errors produced while loading or checking configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Listener and connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Largest request (head plus body) buffered before answering 413.
    pub max_request_size: usize,
    pub initial_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_owned(),
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            initial_buffer_size: DEFAULT_INITIAL_BUFFER_SIZE,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub multipart: MultipartLimits,
}

impl AppConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use rttp_kernel::config::AppConfig;
    ///
    /// let config = AppConfig::from_toml_str("[multipart]\nmax_files = 2\n").unwrap();
    /// assert_eq!(config.multipart.max_files, 2);
    /// assert_eq!(config.server.bind_address, "127.0.0.1:8080");
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Reject settings the server cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        if server.bind_address.trim().is_empty() {
            return Err(ConfigError::Invalid("server.bind_address is empty".into()));
        }
        if server.max_request_size == 0 {
            return Err(ConfigError::Invalid("server.max_request_size must be > 0".into()));
        }
        if server.initial_buffer_size == 0 {
            return Err(ConfigError::Invalid("server.initial_buffer_size must be > 0".into()));
        }
        if server.initial_buffer_size > server.max_request_size {
            return Err(ConfigError::Invalid(format!(
                "server.initial_buffer_size ({}) exceeds server.max_request_size ({})",
                server.initial_buffer_size, server.max_request_size
            )));
        }

        let multipart = &self.multipart;
        if multipart.max_file_size == 0 || multipart.max_field_size == 0 {
            return Err(ConfigError::Invalid(
                "multipart size limits must be > 0".into(),
            ));
        }
        Ok(())
    }
}
