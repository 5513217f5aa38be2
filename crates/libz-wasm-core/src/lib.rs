//! zlib running inside a WebAssembly sandbox.
//!
//! The codec itself is a compiled engine binary exposing the libz ABI
//! (`malloc`, `free`, `zError`, `uncompress`, `compress2`, `compressBound`).
//! This crate provides the host side of the boundary:
//! - [`Backend`] / [`Sandbox`]: The virtual machine capability
//! - [`WasmtimeBackend`]: Wasmtime implementation of that capability
//! - [`Libz`]: Compile-once module cache and the codec operations
//! - [`Instance`]: One engine instance with boundary-safe memory helpers
//! - [`InstancePool`]: Reuse of idle instances for small calls
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Libz                             │
//! │  (One per process via `global()`, thread-safe)          │
//! │  - Binary provider + engine config                      │
//! │  - Compiled module, built once, outcome cached          │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    InstancePool                         │
//! │  (Idle instances for calls under the size threshold)    │
//! │  - Lease: checked out to exactly one call               │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Instance<WasmSandbox>                   │
//! │  (Per-call, isolated)                                   │
//! │  - Linear memory + scratch region                       │
//! │  - Cached entry points                                  │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod engine;
pub mod global;
pub mod instance;
pub mod libz;
pub mod module;
pub mod pool;
pub mod sandbox;
pub mod store;

pub use engine::{WasmEngine, WasmtimeBackend};
pub use global::{
    compress, compress_into, decompress, global, initialize, set_binary, set_binary_provider,
    set_engine_config,
};
pub use instance::{Instance, ScratchRegion};
pub use libz::{BinaryProvider, FileBinary, Libz};
pub use module::CompiledModule;
pub use pool::{InstancePool, Lease, PoolStats};
pub use sandbox::{Backend, Sandbox};
pub use store::{SandboxState, WasmSandbox};

pub use libz_wasm_common::{ErrorCode, InitError, Level, LibzError, SandboxError};
