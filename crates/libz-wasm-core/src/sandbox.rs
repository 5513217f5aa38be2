//! Virtual machine capability traits.
//!
//! The codec is treated as a set of named entry points over a byte-addressable
//! linear memory. [`Backend`] compiles and instantiates engine binaries and
//! [`Sandbox`] is one isolated execution context. [`crate::WasmtimeBackend`]
//! is the production implementation; anything else that can satisfy these
//! two traits can host the engine.

use std::fmt;

use libz_wasm_common::SandboxError;

/// A virtual machine able to compile engine binaries and instantiate them.
///
/// One backend value is created per [`crate::Libz`] on first use and lives
/// for as long as its compiled module.
pub trait Backend: Send + Sync + Sized + 'static {
    /// Backend configuration, consulted once when the backend is created.
    type Config: Clone + Default + fmt::Debug + Send + Sync + 'static;

    /// Compiled, immutable module shared by every instance.
    type Module: Send + Sync + 'static;

    /// Execution context produced by [`Backend::instantiate`].
    type Sandbox: Sandbox;

    /// Create the backend from its configuration.
    fn new(config: &Self::Config) -> Result<Self, SandboxError>;

    /// Compile an engine binary.
    fn compile(&self, bytes: &[u8]) -> Result<Self::Module, SandboxError>;

    /// Create a fresh execution context named `name`.
    fn instantiate(&self, module: &Self::Module, name: &str)
    -> Result<Self::Sandbox, SandboxError>;
}

/// One isolated execution context with its own linear memory.
///
/// All methods take the sandbox exclusively (or read-only for memory reads),
/// so a sandbox can never serve two calls at once.
pub trait Sandbox: Send + 'static {
    /// Handle to a resolved entry point.
    type Func: Copy + Send + 'static;

    /// Resolve an exported function by name.
    fn resolve(&mut self, name: &str) -> Option<Self::Func>;

    /// Call a resolved function.
    ///
    /// Arguments and results are raw 64-bit values; 32-bit parameters take
    /// the low bits and 32-bit results are zero-extended.
    fn call(&mut self, func: Self::Func, args: &[u64]) -> Result<Vec<u64>, SandboxError>;

    /// Copy `buf.len()` bytes out of linear memory starting at `offset`.
    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), SandboxError>;

    /// Copy `data` into linear memory starting at `offset`.
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), SandboxError>;
}
