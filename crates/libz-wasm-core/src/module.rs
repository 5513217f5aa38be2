//! Engine module compilation.
//!
//! [`CompiledModule`] wraps a Wasmtime [`Module`] built from the zlib engine
//! binary, together with the fingerprint and timing recorded when it was
//! compiled. A [`crate::Libz`] compiles at most one of these.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::{Duration, Instant};

use tracing::{info, instrument};
use wasmtime::{Engine, Module};

use libz_wasm_common::SandboxError;

/// A compiled engine module.
///
/// Immutable once built. Cloning is cheap and every clone refers to the
/// same machine code, so all instances share one compilation.
#[derive(Clone)]
pub struct CompiledModule {
    inner: Module,
    fingerprint: u64,
    source_len: usize,
    compile_time: Duration,
}

impl CompiledModule {
    /// WebAssembly binary magic number.
    pub const MAGIC: &'static [u8] = b"\0asm";

    /// Length of the magic number plus the version field.
    const HEADER_LEN: usize = 8;

    /// Compile a binary module.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Compile`] for a bad header or when Wasmtime
    /// rejects the module.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, SandboxError> {
        check_header(bytes)?;
        Self::build(engine, bytes, "binary")
    }

    /// Compile a module written in the WebAssembly text format.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Compile`] if the text does not parse or
    /// validate.
    #[instrument(skip(engine, wat), fields(wat_len = wat.len()))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, SandboxError> {
        Self::build(engine, wat.as_bytes(), "text")
    }

    fn build(engine: &Engine, source: &[u8], format: &str) -> Result<Self, SandboxError> {
        let start = Instant::now();

        let inner = Module::new(engine, source)
            .map_err(|e| SandboxError::compile(format!("{format} module rejected: {e:#}")))?;

        let module = Self {
            inner,
            fingerprint: fingerprint(source),
            source_len: source.len(),
            compile_time: start.elapsed(),
        };

        info!(
            fingerprint = %module.fingerprint(),
            format,
            duration_ms = module.compile_time.as_millis(),
            "Engine module compiled"
        );

        Ok(module)
    }

    /// The underlying Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.inner
    }

    /// Hex fingerprint of the source the module was compiled from.
    pub fn fingerprint(&self) -> String {
        format!("{:016x}", self.fingerprint)
    }

    /// Size of the source in bytes.
    pub fn source_len(&self) -> usize {
        self.source_len
    }

    /// Time spent compiling.
    pub fn compile_time(&self) -> Duration {
        self.compile_time
    }

    /// Returns `true` if the module exports a function called `name`.
    pub fn exports_function(&self, name: &str) -> bool {
        self.inner
            .get_export(name)
            .is_some_and(|ty| ty.func().is_some())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("fingerprint", &self.fingerprint())
            .field("source_len", &self.source_len)
            .finish_non_exhaustive()
    }
}

fn check_header(bytes: &[u8]) -> Result<(), SandboxError> {
    if bytes.len() < CompiledModule::HEADER_LEN {
        return Err(SandboxError::compile(format!(
            "binary is {} bytes, shorter than the module header",
            bytes.len()
        )));
    }
    if !bytes.starts_with(CompiledModule::MAGIC) {
        return Err(SandboxError::compile("binary does not start with \\0asm"));
    }
    Ok(())
}

fn fingerprint(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}
