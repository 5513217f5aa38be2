//! Error types for libz-wasm.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`LibzError`]: Top-level errors returned by every public operation
//! - [`InitError`]: Failures of the one-time module compilation (cached)
//! - [`SandboxError`]: Failures reported by the virtual machine backend

use std::fmt;

use thiserror::Error;

use crate::ErrorCode;

/// Top-level libz errors.
///
/// Status errors carry the engine's [`ErrorCode`] and can be matched against
/// the zlib taxonomy with [`LibzError::code`] or [`LibzError::is`].
#[derive(Error, Debug)]
pub enum LibzError {
    /// The compiled module is unavailable.
    #[error(transparent)]
    Init(#[from] InitError),

    /// The engine does not export a required entry point.
    #[error("libz: wasm binary missing required symbol `{symbol}`")]
    MissingSymbol {
        /// Name of the missing export.
        symbol: String,
    },

    /// An entry point returned an unexpected number of values.
    #[error("libz: bad return value from wasm func `{function}`")]
    BadReturn {
        /// Name of the entry point.
        function: String,
    },

    /// Calling an entry point failed inside the virtual machine.
    #[error("libz: wasm call to `{function}` failed: {source}")]
    Call {
        /// Name of the entry point.
        function: String,
        /// The VM diagnostic.
        #[source]
        source: SandboxError,
    },

    /// Instantiation or linear-memory access failed.
    #[error("libz: {0}")]
    Sandbox(#[from] SandboxError),

    /// The engine returned a non-zero status, or the host rejected the call
    /// with one before entering the engine.
    #[error("{}", format_status(*code, message.as_deref(), source.as_ref()))]
    Status {
        /// The zlib status.
        code: ErrorCode,
        /// Optional human-readable detail.
        message: Option<String>,
        /// Optional underlying host-level error.
        #[source]
        source: Option<SandboxError>,
    },
}

/// Errors from compiling the engine binary.
///
/// These are produced at most once per process and handed to every caller
/// afterwards, hence `Clone`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    /// No engine binary was configured.
    #[error("libz: no wasm binary available")]
    NoBinary,

    /// The binary provider failed to produce the bytes.
    #[error("libz: wasm binary unavailable: {reason}")]
    BinaryUnavailable {
        /// Description of the failure.
        reason: String,
    },

    /// The virtual machine could not be created from its configuration.
    #[error("libz: failed to create engine: {reason}")]
    Engine {
        /// The VM diagnostic.
        reason: String,
    },

    /// The binary is malformed or failed to compile.
    #[error("libz: failed to compile wasm binary: {reason}")]
    Compile {
        /// The VM diagnostic.
        reason: String,
    },
}

/// Errors reported by a virtual machine backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// The engine configuration was rejected.
    #[error("engine error: {reason}")]
    Engine { reason: String },

    /// Module compilation failed.
    #[error("compilation failed: {reason}")]
    Compile { reason: String },

    /// Creating an execution context failed.
    #[error("instantiation failed: {reason}")]
    Instantiate { reason: String },

    /// Guest code trapped.
    #[error("wasm trap: {reason}")]
    Trap { reason: String },

    /// Arguments or results do not fit the function signature.
    #[error("signature mismatch: {reason}")]
    Signature { reason: String },

    /// A read or write fell outside linear memory.
    #[error("out of bounds memory access: {len} bytes at offset {offset}")]
    MemoryAccess { offset: u32, len: usize },
}

impl LibzError {
    /// Create a status error without detail.
    pub fn status(code: ErrorCode) -> Self {
        Self::Status {
            code,
            message: None,
            source: None,
        }
    }

    /// Create a status error with a detail message.
    pub fn status_with(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: Some(message.into()),
            source: None,
        }
    }

    /// Create a new `MissingSymbol` error.
    pub fn missing_symbol(symbol: impl Into<String>) -> Self {
        Self::MissingSymbol {
            symbol: symbol.into(),
        }
    }

    /// Create a new `BadReturn` error.
    pub fn bad_return(function: impl Into<String>) -> Self {
        Self::BadReturn {
            function: function.into(),
        }
    }

    /// Create a new `Call` error.
    pub fn call(function: impl Into<String>, source: SandboxError) -> Self {
        Self::Call {
            function: function.into(),
            source,
        }
    }

    /// The zlib status carried by this error, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns `true` if this error carries the given status.
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code() == Some(code)
    }

    /// Returns `true` if this error means the engine never became usable.
    pub fn is_initialization(&self) -> bool {
        matches!(self, Self::Init(_) | Self::MissingSymbol { .. })
    }
}

impl SandboxError {
    /// Create a new `Engine` error.
    pub fn engine(reason: impl fmt::Display) -> Self {
        Self::Engine {
            reason: reason.to_string(),
        }
    }

    /// Create a new `Compile` error.
    pub fn compile(reason: impl fmt::Display) -> Self {
        Self::Compile {
            reason: reason.to_string(),
        }
    }

    /// Create a new `Instantiate` error.
    pub fn instantiate(reason: impl fmt::Display) -> Self {
        Self::Instantiate {
            reason: reason.to_string(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(reason: impl fmt::Display) -> Self {
        Self::Trap {
            reason: reason.to_string(),
        }
    }

    /// Create a new `Signature` error.
    pub fn signature(reason: impl fmt::Display) -> Self {
        Self::Signature {
            reason: reason.to_string(),
        }
    }
}

impl From<SandboxError> for InitError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Engine { reason } => Self::Engine { reason },
            other => Self::Compile {
                reason: other.to_string(),
            },
        }
    }
}

/// `<code message>[: detail][: source]`
fn format_status(code: ErrorCode, message: Option<&str>, source: Option<&SandboxError>) -> String {
    let mut out = code.to_string();
    if let Some(message) = message.filter(|m| !m.is_empty()) {
        out.push_str(": ");
        out.push_str(message);
    }
    if let Some(source) = source {
        out.push_str(": ");
        out.push_str(&source.to_string());
    }
    out
}
