//! Wasmtime engine setup and the default [`Backend`].
//!
//! One [`WasmEngine`] backs the compiled module and every instance made
//! from it. Calls into the engine are synchronous: no async support, no
//! fuel, no epochs. The codec is CPU-bound and always runs to completion.

use std::sync::Arc;

use tracing::{debug, info};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use libz_wasm_common::{EngineConfig, OptLevel, SandboxError};

use crate::module::CompiledModule;
use crate::sandbox::Backend;
use crate::store::WasmSandbox;

/// Shared Wasmtime engine plus the settings it was built from.
///
/// # Example
///
/// ```ignore
/// use libz_wasm_common::EngineConfig;
/// use libz_wasm_core::WasmEngine;
///
/// let engine = WasmEngine::new(&EngineConfig::default())?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Build an engine from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Engine`] if the cache configuration cannot be
    /// loaded or Wasmtime rejects the settings.
    pub fn new(config: &EngineConfig) -> Result<Self, SandboxError> {
        let engine = Engine::new(&wasmtime_config(config)?)
            .map_err(|e| SandboxError::engine(format!("wasmtime rejected engine settings: {e}")))?;

        info!(
            opt_level = ?config.opt_level,
            pooling = config.pooling_allocator,
            max_memory_mb = config.max_memory_mb,
            "Wasmtime engine ready"
        );

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    /// The underlying Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Settings the engine was built from.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("opt_level", &self.config.opt_level)
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("max_memory_mb", &self.config.max_memory_mb)
            .finish_non_exhaustive()
    }
}

fn wasmtime_config(config: &EngineConfig) -> Result<Config, SandboxError> {
    let mut wasmtime = Config::new();

    wasmtime.cranelift_opt_level(match config.opt_level {
        OptLevel::None => wasmtime::OptLevel::None,
        OptLevel::Speed => wasmtime::OptLevel::Speed,
        OptLevel::SpeedAndSize => wasmtime::OptLevel::SpeedAndSize,
    });
    wasmtime.wasm_simd(config.simd);

    if config.pooling_allocator {
        wasmtime.allocation_strategy(InstanceAllocationStrategy::Pooling(pooling(config)));
        debug!(
            slots = config.max_instances,
            slot_memory_mb = config.instance_memory_mb,
            "Pooling allocator enabled"
        );
    }

    if let Some(ref path) = config.cache_config {
        wasmtime
            .cache_config_load(path)
            .map_err(|e| SandboxError::engine(format!("cache config {path}: {e}")))?;
        debug!(cache_config = %path, "Compilation cache enabled");
    }

    Ok(wasmtime)
}

/// Each engine instance needs one core instance, one memory and at most one
/// table, so a slot count of `max_instances` covers all three.
fn pooling(config: &EngineConfig) -> PoolingAllocationConfig {
    let mut pooling = PoolingAllocationConfig::default();
    pooling
        .total_core_instances(config.max_instances)
        .total_memories(config.max_instances)
        .total_tables(config.max_instances)
        .max_memory_size((config.instance_memory_mb as usize) << 20);
    pooling
}

/// [`Backend`] running the engine under Wasmtime.
#[derive(Debug, Clone)]
pub struct WasmtimeBackend {
    engine: WasmEngine,
}

impl WasmtimeBackend {
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }
}

impl Backend for WasmtimeBackend {
    type Config = EngineConfig;
    type Module = CompiledModule;
    type Sandbox = WasmSandbox;

    fn new(config: &EngineConfig) -> Result<Self, SandboxError> {
        WasmEngine::new(config).map(|engine| Self { engine })
    }

    fn compile(&self, bytes: &[u8]) -> Result<CompiledModule, SandboxError> {
        let engine = self.engine.inner();

        // Text is accepted so engines can be written inline in tests
        match std::str::from_utf8(bytes) {
            Ok(wat) if !bytes.starts_with(CompiledModule::MAGIC) => {
                CompiledModule::from_wat(engine, wat)
            }
            _ => CompiledModule::from_bytes(engine, bytes),
        }
    }

    fn instantiate(&self, module: &CompiledModule, name: &str) -> Result<WasmSandbox, SandboxError> {
        WasmSandbox::instantiate(&self.engine, module, name)
    }
}
