//! TOML configuration for the `libz-wasm` binary.
//!
//! Holds the codec settings under `[libz]` and log setup under `[logging]`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::LibzConfig;

/// Contents of a `libz-wasm.toml`.
///
/// # Example
///
/// ```toml
/// [libz]
/// binary = "./zlib.wasm"
///
/// [libz.engine]
/// opt_level = "speed"
/// max_memory_mb = 256
///
/// [libz.pool]
/// enabled = true
/// small_call_threshold = 131072
///
/// [logging]
/// filter = "info,libz_wasm_core=debug"
/// format = "json"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Codec configuration (engine, pool, binary).
    #[serde(default)]
    pub libz: LibzConfig,

    /// Log filter and format.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ConfigFile {
    /// Read and parse `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        debug!(path = %path.display(), bytes = content.len(), "Read configuration");

        Self::from_toml(&content)
    }

    /// Parse TOML text. Missing tables and keys take their defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Log setup for the binary.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "defaults::filter")]
    pub filter: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: defaults::filter(),
            format: LogFormat::default(),
        }
    }
}

/// Errors loading a [`ConfigFile`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {message}")]
    Parse { message: String },
}

mod defaults {
    pub fn filter() -> String {
        "warn,libz_wasm=info".to_string()
    }
}
