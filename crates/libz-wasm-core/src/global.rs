//! Process-wide sandboxed zlib.
//!
//! The functions here forward to one lazily created [`Libz`] running on
//! [`WasmtimeBackend`]. It starts with no binary and the default
//! [`EngineConfig`]; supply the binary with [`set_binary`] (or a provider
//! with [`set_binary_provider`]) before the first operation.

use std::sync::LazyLock;

use libz_wasm_common::{EngineConfig, InitError, Level, LibzError};

use crate::WasmtimeBackend;
use crate::libz::{BinaryProvider, Libz};

static GLOBAL: LazyLock<Libz<WasmtimeBackend>> = LazyLock::new(Libz::new);

/// The process-wide instance.
pub fn global() -> &'static Libz<WasmtimeBackend> {
    &GLOBAL
}

/// Set the engine binary. Ignored after the first initialization.
pub fn set_binary(bytes: Vec<u8>) {
    GLOBAL.set_binary(bytes);
}

/// Set the engine binary provider. Ignored after the first initialization.
pub fn set_binary_provider(provider: impl BinaryProvider + 'static) {
    GLOBAL.set_binary_provider(provider);
}

/// Set the Wasmtime configuration. Ignored after the first initialization.
pub fn set_engine_config(config: EngineConfig) {
    GLOBAL.set_engine_config(config);
}

/// See [`Libz::initialize`].
pub fn initialize() -> Result<(), InitError> {
    GLOBAL.initialize()
}

/// See [`Libz::decompress`].
pub fn decompress<'a>(dst: &'a mut [u8], src: &[u8]) -> Result<&'a [u8], LibzError> {
    GLOBAL.decompress(dst, src)
}

/// See [`Libz::compress`].
pub fn compress(src: &[u8], level: Level) -> Result<Vec<u8>, LibzError> {
    GLOBAL.compress(src, level)
}

/// See [`Libz::compress_into`].
pub fn compress_into<'a>(dst: &'a mut [u8], src: &[u8], level: Level) -> Result<&'a [u8], LibzError> {
    GLOBAL.compress_into(dst, src, level)
}
