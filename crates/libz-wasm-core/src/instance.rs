//! Engine instances and boundary helpers.
//!
//! An [`Instance`] is one sandboxed copy of the zlib engine. It owns the
//! sandbox's linear memory, caches resolved entry points, and offers the
//! host-side helpers every call is built from:
//!
//! 1. [`Instance::allocate`] scratch memory through the engine's `malloc`
//! 2. [`Instance::write_bytes`] inputs into it
//! 3. [`Instance::call_status`] an entry point
//! 4. [`Instance::read_bytes`] outputs back
//! 5. [`Instance::release`] the scratch memory through `free`
//!
//! [`Instance::with_scratch`] bundles steps 1 and 5 so the region is freed on
//! every exit path.
//!
//! A failed boundary call or memory access poisons the instance: the engine
//! may have trapped halfway through updating its heap, so a poisoned
//! instance is closed instead of being reused.

use std::collections::HashMap;

use tracing::{debug, warn};

use libz_wasm_common::{ErrorCode, LibzError, SandboxError};

use crate::sandbox::Sandbox;

/// `const char *zError(int)`.
pub const Z_ERROR: &str = "zError";
/// `void *malloc(size_t)`.
pub const MALLOC: &str = "malloc";
/// `void free(void *)`.
pub const FREE: &str = "free";
/// `int uncompress(Bytef *dest, uLongf *destLen, const Bytef *source, uLong sourceLen)`.
pub const UNCOMPRESS: &str = "uncompress";
/// `int compress2(Bytef *dest, uLongf *destLen, const Bytef *source, uLong sourceLen, int level)`.
pub const COMPRESS2: &str = "compress2";
/// `uLong compressBound(uLong sourceLen)`.
pub const COMPRESS_BOUND: &str = "compressBound";

/// Entry points that must resolve for an instance to be created.
pub const REQUIRED_SYMBOLS: [&str; 3] = [Z_ERROR, MALLOC, FREE];

/// Size of the in-place length word that precedes every scratch region.
pub const LEN_HEADER: u32 = 4;

/// Layout of one call's staging area in linear memory.
///
/// ```text
/// base                 base+4                 base+4+input_len
/// | capacity / length | input bytes ........ | output bytes ........ |
/// ```
///
/// The length word is written by the host with the output capacity and
/// overwritten by the engine with the number of bytes produced.
/// `base + size_for(input_len, output_len)` never exceeds `u32::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchRegion {
    base: u32,
    input_len: u32,
    output_len: u32,
}

impl ScratchRegion {
    /// Total bytes needed for a region, or `None` past the 32-bit bound.
    pub fn size_for(input_len: u32, output_len: u32) -> Option<u32> {
        LEN_HEADER
            .checked_add(input_len)
            .and_then(|n| n.checked_add(output_len))
    }

    /// Pointer to the 32-bit little-endian length word.
    pub fn len_ptr(&self) -> u32 {
        self.base
    }

    /// Pointer to the input copy.
    pub fn input_ptr(&self) -> u32 {
        self.base + LEN_HEADER
    }

    /// Pointer to the output area.
    pub fn output_ptr(&self) -> u32 {
        self.base + LEN_HEADER + self.input_len
    }

    /// Input length in bytes.
    pub fn input_len(&self) -> u32 {
        self.input_len
    }

    /// Output capacity in bytes.
    pub fn output_len(&self) -> u32 {
        self.output_len
    }
}

/// One isolated engine instance.
///
/// An instance serves one call at a time; every operation takes it by
/// `&mut`. Close it with [`Instance::close`] or hand it to an
/// [`crate::InstancePool`]. Dropping an unclosed instance still releases
/// its sandbox, but logs that it happened.
pub struct Instance<S: Sandbox> {
    name: String,
    sandbox: S,
    malloc: S::Func,
    free: S::Func,
    exports: HashMap<&'static str, S::Func>,
    poisoned: bool,
    closed: bool,
}

impl<S: Sandbox> Instance<S> {
    /// Wrap a freshly instantiated sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`LibzError::MissingSymbol`] if `zError`, `malloc` or `free`
    /// is not exported. The sandbox is released in that case.
    pub fn new(name: impl Into<String>, mut sandbox: S) -> Result<Self, LibzError> {
        let name = name.into();
        let mut exports = HashMap::with_capacity(8);

        for symbol in REQUIRED_SYMBOLS {
            let Some(func) = sandbox.resolve(symbol) else {
                debug!(instance = %name, symbol, "Required symbol missing");
                return Err(LibzError::missing_symbol(symbol));
            };
            exports.insert(symbol, func);
        }

        Ok(Self {
            malloc: exports[MALLOC],
            free: exports[FREE],
            name,
            sandbox,
            exports,
            poisoned: false,
            closed: false,
        })
    }

    /// Unique name of this instance.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Access the underlying sandbox.
    pub fn sandbox(&self) -> &S {
        &self.sandbox
    }

    /// Returns `true` once a boundary call or memory access has failed.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn poison(&mut self, error: &SandboxError) {
        if !self.poisoned {
            warn!(instance = %self.name, error = %error, "Instance poisoned");
        }
        self.poisoned = true;
    }

    fn check<T>(&mut self, result: Result<T, SandboxError>) -> Result<T, SandboxError> {
        if let Err(ref e) = result {
            self.poison(e);
        }
        result
    }

    /// Resolve an entry point, caching the handle.
    ///
    /// # Errors
    ///
    /// Returns [`LibzError::MissingSymbol`] if the engine does not export it.
    pub fn function(&mut self, name: &'static str) -> Result<S::Func, LibzError> {
        if let Some(func) = self.exports.get(name) {
            return Ok(*func);
        }

        let func = self
            .sandbox
            .resolve(name)
            .ok_or_else(|| LibzError::missing_symbol(name))?;
        self.exports.insert(name, func);
        Ok(func)
    }

    /// Resolve and call an entry point by name.
    pub fn invoke(&mut self, name: &'static str, args: &[u64]) -> Result<Vec<u64>, LibzError> {
        let func = self.function(name)?;
        let result = self.sandbox.call(func, args);
        self.check(result).map_err(|e| LibzError::call(name, e))
    }

    /// Call an entry point that returns exactly one value.
    pub fn call_single(&mut self, func: S::Func, name: &str, args: &[u64]) -> Result<u64, LibzError> {
        let results = self.sandbox.call(func, args);
        let results = self.check(results).map_err(|e| LibzError::call(name, e))?;

        match results.as_slice() {
            [value] => Ok(*value),
            _ => Err(LibzError::bad_return(name)),
        }
    }

    /// Call an entry point that returns a zlib status.
    pub fn call_status(
        &mut self,
        func: S::Func,
        name: &str,
        args: &[u64],
    ) -> Result<ErrorCode, LibzError> {
        self.call_single(func, name, args).map(ErrorCode::from_return)
    }

    /// Allocate `size` bytes of linear memory through the engine's `malloc`.
    ///
    /// # Errors
    ///
    /// A null pointer becomes [`ErrorCode::MEM_ERROR`]; call failures are
    /// propagated unchanged.
    #[allow(clippy::cast_possible_truncation)]
    pub fn allocate(&mut self, size: u32) -> Result<u32, LibzError> {
        let ptr = self.call_single(self.malloc, MALLOC, &[u64::from(size)])? as u32;
        if ptr == 0 {
            return Err(LibzError::status_with(
                ErrorCode::MEM_ERROR,
                format!("{MALLOC}({size}) returned null"),
            ));
        }
        Ok(ptr)
    }

    /// Free memory previously returned by [`Instance::allocate`].
    ///
    /// Best effort: a failure is logged and otherwise ignored so that it
    /// cannot mask the result of the call that owned the memory.
    pub fn release(&mut self, ptr: u32) {
        let result = self.sandbox.call(self.free, &[u64::from(ptr)]);
        if let Err(e) = self.check(result) {
            warn!(instance = %self.name, ptr, error = %e, "Failed to free scratch memory");
        }
    }

    /// Run `f` with a scratch region for `input_len` input bytes and
    /// `output_len` output bytes, freeing the region afterwards whether or
    /// not `f` succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::MEM_ERROR`] if the region does not fit the 32-bit
    /// address space or cannot be allocated, [`SandboxError::MemoryAccess`]
    /// if `malloc` hands back a block that runs past 4 GiB, otherwise the
    /// result of `f`.
    pub fn with_scratch<T>(
        &mut self,
        input_len: u32,
        output_len: u32,
        f: impl FnOnce(&mut Self, ScratchRegion) -> Result<T, LibzError>,
    ) -> Result<T, LibzError> {
        let size = ScratchRegion::size_for(input_len, output_len).ok_or_else(|| {
            LibzError::status_with(ErrorCode::MEM_ERROR, "scratch region exceeds 4 GiB")
        })?;

        let base = self.allocate(size)?;
        if base.checked_add(size).is_none() {
            let error = SandboxError::MemoryAccess {
                offset: base,
                len: size as usize,
            };
            self.poison(&error);
            self.release(base);
            return Err(error.into());
        }

        let region = ScratchRegion {
            base,
            input_len,
            output_len,
        };

        let result = f(self, region);
        self.release(region.base);
        result
    }

    /// Copy `data` into linear memory.
    pub fn write_bytes(&mut self, ptr: u32, data: &[u8]) -> Result<(), LibzError> {
        let result = self.sandbox.write(ptr, data);
        Ok(self.check(result)?)
    }

    /// Copy bytes out of linear memory into `buf`.
    pub fn read_bytes(&mut self, ptr: u32, buf: &mut [u8]) -> Result<(), LibzError> {
        let result = self.sandbox.read(ptr, buf);
        Ok(self.check(result)?)
    }

    /// Write a little-endian `u32`.
    pub fn write_u32(&mut self, ptr: u32, value: u32) -> Result<(), LibzError> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }

    /// Read a little-endian `u32`.
    pub fn read_u32(&mut self, ptr: u32) -> Result<u32, LibzError> {
        let mut buf = [0u8; 4];
        self.read_bytes(ptr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Release the instance and its sandbox.
    pub fn close(mut self) {
        self.closed = true;
        debug!(instance = %self.name, "Instance closed");
    }
}

impl<S: Sandbox> Drop for Instance<S> {
    fn drop(&mut self) {
        if !self.closed {
            warn!(instance = %self.name, "Instance dropped without close; releasing sandbox");
        }
    }
}

impl<S: Sandbox> std::fmt::Debug for Instance<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("resolved", &self.exports.len())
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}
