//! Per-instance Wasmtime store and the [`Sandbox`] implementation.
//!
//! This module provides:
//! - [`SandboxState`]: Data attached to each store (name, memory limits)
//! - [`WasmSandbox`]: One instantiated engine with its own linear memory

use tracing::{debug, instrument};
use wasmtime::{Func, Instance, Linker, Memory, Store, StoreLimits, StoreLimitsBuilder, Val, ValType};

use libz_wasm_common::SandboxError;

use crate::WasmEngine;
use crate::module::CompiledModule;
use crate::sandbox::Sandbox;

/// Name of the linear memory export every engine must provide.
pub const MEMORY_EXPORT: &str = "memory";

/// Per-instance store data.
pub struct SandboxState {
    /// Unique instance name, used for tracing.
    pub name: String,

    /// Resource limits enforced on the instance.
    limits: StoreLimits,
}

impl SandboxState {
    /// Create store data limiting linear memory to `max_memory_bytes`.
    pub fn new(name: String, max_memory_bytes: usize) -> Self {
        let limits = StoreLimitsBuilder::new()
            .memory_size(max_memory_bytes)
            .instances(1)
            .build();

        Self { name, limits }
    }
}

/// Create a new Wasmtime store for one instance.
pub fn create_store(engine: &WasmEngine, name: String) -> Store<SandboxState> {
    let state = SandboxState::new(name, engine.config().max_memory_bytes());
    let mut store = Store::new(engine.inner(), state);
    store.limiter(|state| &mut state.limits);
    store
}

/// An instantiated engine module.
///
/// Dropping the sandbox drops its store, which releases the linear memory
/// and every other VM resource it owns.
pub struct WasmSandbox {
    store: Store<SandboxState>,
    instance: Instance,
    memory: Memory,
}

impl WasmSandbox {
    /// Instantiate `module` in a fresh store.
    ///
    /// No host functions are linked: the engine gets no filesystem or other
    /// system access. Any import the module declares traps when called.
    ///
    /// # Errors
    ///
    /// Returns an error if instantiation fails or the module does not export
    /// its linear memory.
    #[instrument(skip(engine, module), fields(fingerprint = %module.fingerprint()))]
    pub fn instantiate(
        engine: &WasmEngine,
        module: &CompiledModule,
        name: &str,
    ) -> Result<Self, SandboxError> {
        let mut store = create_store(engine, name.to_string());

        let mut linker: Linker<SandboxState> = Linker::new(engine.inner());
        linker
            .define_unknown_imports_as_traps(module.inner())
            .map_err(SandboxError::instantiate)?;

        let instance = linker
            .instantiate(&mut store, module.inner())
            .map_err(SandboxError::instantiate)?;

        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or_else(|| {
                SandboxError::instantiate(format!(
                    "module does not export linear memory `{MEMORY_EXPORT}`"
                ))
            })?;

        debug!("Sandbox instantiated");

        Ok(Self {
            store,
            instance,
            memory,
        })
    }

    /// Name given to this sandbox at instantiation.
    pub fn name(&self) -> &str {
        &self.store.data().name
    }

    /// Current size of linear memory in bytes.
    pub fn memory_size(&self) -> usize {
        self.memory.data_size(&self.store)
    }
}

impl Sandbox for WasmSandbox {
    type Func = Func;

    fn resolve(&mut self, name: &str) -> Option<Func> {
        self.instance.get_func(&mut self.store, name)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    fn call(&mut self, func: Func, args: &[u64]) -> Result<Vec<u64>, SandboxError> {
        let ty = func.ty(&self.store);

        if ty.params().len() != args.len() {
            return Err(SandboxError::signature(format!(
                "expected {} arguments, got {}",
                ty.params().len(),
                args.len()
            )));
        }

        let params = ty
            .params()
            .zip(args)
            .map(|(param, &arg)| match param {
                ValType::I32 => Ok(Val::I32(arg as i32)),
                ValType::I64 => Ok(Val::I64(arg as i64)),
                other => Err(SandboxError::signature(format!(
                    "unsupported parameter type {other:?}"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut results = vec![Val::I32(0); ty.results().len()];

        func.call(&mut self.store, &params, &mut results)
            .map_err(SandboxError::trap)?;

        results
            .iter()
            .map(|val| match val {
                Val::I32(v) => Ok(u64::from(*v as u32)),
                Val::I64(v) => Ok(*v as u64),
                _ => Err(SandboxError::signature("unsupported result type")),
            })
            .collect()
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), SandboxError> {
        self.memory
            .read(&self.store, offset as usize, buf)
            .map_err(|_| SandboxError::MemoryAccess {
                offset,
                len: buf.len(),
            })
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), SandboxError> {
        self.memory
            .write(&mut self.store, offset as usize, data)
            .map_err(|_| SandboxError::MemoryAccess {
                offset,
                len: data.len(),
            })
    }
}

impl std::fmt::Debug for WasmSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmSandbox")
            .field("name", &self.name())
            .field("memory_size", &self.memory_size())
            .finish_non_exhaustive()
    }
}
