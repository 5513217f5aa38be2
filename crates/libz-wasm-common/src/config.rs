//! Codec settings.
//!
//! [`LibzConfig`] groups the [`EngineConfig`] used to compile and run the
//! zlib module with the [`PoolConfig`] deciding which calls share instances.

use serde::{Deserialize, Serialize};

/// Top-level libz configuration.
///
/// Engine settings and the binary location are consulted only when the
/// module is first compiled.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LibzConfig {
    /// Compilation and sandbox limits.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Which calls reuse parked instances.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Path to the compiled zlib engine (`.wasm`).
    #[serde(default)]
    pub binary: Option<String>,
}

/// Cranelift optimization level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    /// No optimizations.
    None,
    /// Optimize for speed.
    #[default]
    Speed,
    /// Optimize for speed and code size.
    SpeedAndSize,
}

/// How the zlib module is compiled and how much memory an instance gets.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Code generation effort.
    #[serde(default)]
    pub opt_level: OptLevel,

    /// Enable the pooling allocator.
    ///
    /// Pre-allocates memory slots for instances. The slot count caps how
    /// many instances can be alive at once, so it is off by default: the
    /// instance pool itself is unbounded.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Slot count for the pooling allocator.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Reserved memory per slot, in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Linear memory limit for a single instance in megabytes.
    ///
    /// Growth beyond the limit makes the engine's `malloc` return null.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,

    /// Allow SIMD instructions in the zlib module.
    #[serde(default = "defaults::simd")]
    pub simd: bool,

    /// Wasmtime cache configuration file.
    ///
    /// When set, compiled machine code is cached on disk across processes.
    #[serde(default)]
    pub cache_config: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::default(),
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            max_memory_mb: defaults::max_memory_mb(),
            simd: defaults::simd(),
            cache_config: None,
        }
    }
}

impl EngineConfig {
    /// Linear memory limit in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb as usize).saturating_mul(1024 * 1024)
    }
}

/// Instance pool policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Route small calls through the shared pool.
    ///
    /// When disabled every call instantiates a fresh instance.
    #[serde(default = "defaults::pool_enabled")]
    pub enabled: bool,

    /// Combined input and output size, in bytes, below which a call uses a
    /// pooled instance.
    ///
    /// Larger calls use a fresh instance that is dropped afterwards, so big
    /// linear memories are not kept alive in the pool.
    #[serde(default = "defaults::small_call_threshold")]
    pub small_call_threshold: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::pool_enabled(),
            small_call_threshold: defaults::small_call_threshold(),
        }
    }
}

impl PoolConfig {
    /// Returns `true` if a call moving `total` bytes should use the pool.
    pub fn use_pool(&self, total: u64) -> bool {
        self.enabled && total < self.small_call_threshold as u64
    }
}

/// Serde fallbacks for absent keys.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn max_memory_mb() -> u32 {
        4096
    }

    pub const fn simd() -> bool {
        true
    }

    pub const fn pool_enabled() -> bool {
        true
    }

    pub const fn small_call_threshold() -> usize {
        128 * 1024
    }
}
