//! Numeric values shared with the sandboxed zlib engine.
//!
//! - [`ErrorCode`]: the signed status returned by every codec entry point
//! - [`Level`]: compression level passed to `compress2`
//!
//! Both are plain `i32` newtypes so that values the host does not know about
//! survive a round trip through the boundary unchanged.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::LibzError;

/// Status returned by a zlib entry point.
///
/// Zero is success, positive values are informational results and negative
/// values are errors. The constants mirror `zlib.h` and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ErrorCode(i32);

impl ErrorCode {
    pub const OK: Self = Self(0);
    pub const STREAM_END: Self = Self(1);
    pub const NEED_DICT: Self = Self(2);
    pub const ERRNO: Self = Self(-1);
    pub const STREAM_ERROR: Self = Self(-2);
    pub const DATA_ERROR: Self = Self(-3);
    pub const MEM_ERROR: Self = Self(-4);
    pub const BUF_ERROR: Self = Self(-5);
    pub const VERSION_ERROR: Self = Self(-6);

    /// Wrap a raw status value.
    pub const fn from_raw(code: i32) -> Self {
        Self(code)
    }

    /// Interpret the low 32 bits of a boundary return value as a status.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub const fn from_return(value: u64) -> Self {
        Self(value as u32 as i32)
    }

    /// The raw status value.
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Returns `true` for [`ErrorCode::OK`].
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` for negative (error) statuses.
    pub const fn is_error(self) -> bool {
        self.0 < 0
    }

    /// Returns `true` if the code is one of the documented zlib statuses.
    pub const fn is_known(self) -> bool {
        self.0 >= -6 && self.0 <= 2
    }

    /// Host-side equivalent of zlib's `zError`.
    ///
    /// Computed locally so that formatting an error never needs a trip into
    /// the sandbox.
    pub const fn message(self) -> &'static str {
        match self.0 {
            0 => "",
            1 => "libz: stream end",
            2 => "libz: need dictionary",
            -1 => "libz: file error",
            -2 => "libz: stream error",
            -3 => "libz: data error",
            -4 => "libz: insufficient memory",
            -5 => "libz: buffer error",
            -6 => "libz: incompatible version",
            _ => "libz: unknown error",
        }
    }

    /// Convert the status into a `Result`.
    ///
    /// Every non-zero status, informational ones included, becomes an error.
    pub fn into_result(self) -> Result<(), LibzError> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(LibzError::status(self))
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            write!(f, "libz: ok")
        } else {
            f.write_str(self.message())
        }
    }
}

impl From<i32> for ErrorCode {
    fn from(code: i32) -> Self {
        Self(code)
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code.0
    }
}

/// Compression level.
///
/// Unlike most Rust compression crates, zero means "store only" and `-1`
/// selects the engine default. Values outside `-1..=9` are passed through
/// unchanged and rejected by the engine with [`ErrorCode::STREAM_ERROR`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Level(i32);

impl Level {
    pub const NO_COMPRESSION: Self = Self(0);
    pub const BEST_SPEED: Self = Self(1);
    pub const BEST_COMPRESSION: Self = Self(9);
    pub const DEFAULT_COMPRESSION: Self = Self(-1);

    /// Wrap a raw level.
    pub const fn new(level: i32) -> Self {
        Self(level)
    }

    /// The raw level value.
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Encode the level as a boundary call argument.
    #[allow(clippy::cast_sign_loss)]
    pub const fn as_arg(self) -> u64 {
        self.0 as u32 as u64
    }
}

impl Default for Level {
    fn default() -> Self {
        Self::DEFAULT_COMPRESSION
    }
}

impl From<i32> for Level {
    fn from(level: i32) -> Self {
        Self(level)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
