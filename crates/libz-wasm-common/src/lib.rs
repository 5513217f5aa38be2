//! Common types, errors, and configuration for libz-wasm.
//!
//! This crate provides shared functionality used across the libz-wasm workspace:
//! - zlib status codes and compression levels
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures and TOML config file loading

pub mod config;
pub mod config_file;
pub mod error;
pub mod status;

pub use config::{EngineConfig, LibzConfig, OptLevel, PoolConfig};
pub use config_file::{ConfigFile, ConfigFileError, LogFormat, LoggingConfig};
pub use error::{InitError, LibzError, SandboxError};
pub use status::{ErrorCode, Level};
