//! Shared fixtures for the integration tests.
//!
//! Two kinds of engine are available:
//! - WAT engines run under the real Wasmtime backend and implement the libz
//!   ABI with a framing-only "codec" (one marker byte plus the payload)
//! - [`NativeBackend`] implements the VM traits in-process on top of
//!   `flate2`, so real zlib behavior can be exercised without a compiled
//!   zlib module

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use libz_wasm_core::{Backend, Libz, Sandbox, SandboxError, WasmtimeBackend};

// ============================================================================
// WAT engines
// ============================================================================

/// Allocator, `zError` and a `live` export counting outstanding blocks.
///
/// Memory starts at one page and may grow to 16 (1 MiB). `malloc` returns
/// 0 when it cannot grow. Freeing the last live block rewinds the bump
/// pointer so pooled instances do not leak.
const PRELUDE: &str = r#"
    (memory (export "memory") 1 16)
    (global $base i32 (i32.const 1024))
    (global $top (mut i32) (i32.const 1024))
    (global $live (mut i32) (i32.const 0))

    (func (export "zError") (param i32) (result i32) (i32.const 0))

    (func (export "malloc") (param $n i32) (result i32)
        (local $p i32) (local $end i32) (local $have i32)
        (local.set $p (global.get $top))
        (local.set $end
            (i32.and
                (i32.add (i32.add (local.get $p) (local.get $n)) (i32.const 7))
                (i32.const -8)))
        (if (i32.lt_u (local.get $end) (local.get $p))
            (then (return (i32.const 0))))
        (local.set $have (i32.shl (memory.size) (i32.const 16)))
        (if (i32.gt_u (local.get $end) (local.get $have))
            (then
                (if (i32.eq
                        (memory.grow
                            (i32.shr_u
                                (i32.add
                                    (i32.sub (local.get $end) (local.get $have))
                                    (i32.const 65535))
                                (i32.const 16)))
                        (i32.const -1))
                    (then (return (i32.const 0))))))
        (global.set $top (local.get $end))
        (global.set $live (i32.add (global.get $live) (i32.const 1)))
        (local.get $p))

    (func (export "free") (param i32)
        (global.set $live (i32.sub (global.get $live) (i32.const 1)))
        (if (i32.eqz (global.get $live))
            (then (global.set $top (global.get $base)))))

    (func (export "live") (result i32) (global.get $live))
"#;

/// `uncompress` accepting `0xAB` followed by the payload.
///
/// Empty or unmarked input is `Z_DATA_ERROR`; a payload larger than the
/// capacity is `Z_BUF_ERROR`.
const UNCOMPRESS_FRAMED: &str = r#"
    (func (export "uncompress")
        (param $out i32) (param $lenp i32) (param $in i32) (param $len i32) (result i32)
        (local $n i32)
        (if (i32.eqz (local.get $len))
            (then (return (i32.const -3))))
        (if (i32.ne (i32.load8_u (local.get $in)) (i32.const 0xAB))
            (then (return (i32.const -3))))
        (local.set $n (i32.sub (local.get $len) (i32.const 1)))
        (if (i32.gt_u (local.get $n) (i32.load (local.get $lenp)))
            (then (return (i32.const -5))))
        (memory.copy
            (local.get $out)
            (i32.add (local.get $in) (i32.const 1))
            (local.get $n))
        (i32.store (local.get $lenp) (local.get $n))
        (i32.const 0))
"#;

/// `uncompress` that claims one byte more than the capacity.
const UNCOMPRESS_OVERREPORT: &str = r#"
    (func (export "uncompress")
        (param $out i32) (param $lenp i32) (param $in i32) (param $len i32) (result i32)
        (i32.store (local.get $lenp)
            (i32.add (i32.load (local.get $lenp)) (i32.const 1)))
        (i32.const 0))
"#;

/// `uncompress` that traps on its first call and copies the input on every
/// later call. The trap leaves `$tripped` set, so only a reused instance
/// gets past it.
const UNCOMPRESS_TRAPS_FIRST: &str = r#"
    (global $tripped (mut i32) (i32.const 0))

    (func (export "uncompress")
        (param $out i32) (param $lenp i32) (param $in i32) (param $len i32) (result i32)
        (if (i32.eqz (global.get $tripped))
            (then
                (global.set $tripped (i32.const 1))
                (unreachable)))
        (memory.copy (local.get $out) (local.get $in) (local.get $len))
        (i32.store (local.get $lenp) (local.get $len))
        (i32.const 0))
"#;

/// `compress2` writing `0xAB` followed by the input, and `compressBound`.
const COMPRESS_FRAMED: &str = r#"
    (func (export "compress2")
        (param $out i32) (param $lenp i32) (param $in i32) (param $len i32) (param $level i32)
        (result i32)
        (if (i32.or
                (i32.lt_s (local.get $level) (i32.const -1))
                (i32.gt_s (local.get $level) (i32.const 9)))
            (then (return (i32.const -2))))
        (if (i32.ge_u (local.get $len) (i32.load (local.get $lenp)))
            (then (return (i32.const -5))))
        (i32.store8 (local.get $out) (i32.const 0xAB))
        (memory.copy
            (i32.add (local.get $out) (i32.const 1))
            (local.get $in)
            (local.get $len))
        (i32.store (local.get $lenp) (i32.add (local.get $len) (i32.const 1)))
        (i32.const 0))

    (func (export "compressBound") (param i32) (result i32)
        (i32.add (local.get 0) (i32.const 13)))
"#;

/// Engine with the full framed codec.
pub fn framed_engine() -> String {
    format!("(module {PRELUDE} {UNCOMPRESS_FRAMED} {COMPRESS_FRAMED})")
}

/// Engine whose `uncompress` overstates the output length.
pub fn overreporting_engine() -> String {
    format!("(module {PRELUDE} {UNCOMPRESS_OVERREPORT})")
}

/// Engine whose `uncompress` traps the first time each instance runs it.
pub fn trapping_engine() -> String {
    format!("(module {PRELUDE} {UNCOMPRESS_TRAPS_FIRST})")
}

/// Engine with an allocator but no codec entry points.
pub fn allocator_only_engine() -> String {
    format!("(module {PRELUDE})")
}

/// Engine lacking `free`.
pub const NO_FREE_ENGINE: &str = r#"
    (module
        (memory (export "memory") 1)
        (func (export "zError") (param i32) (result i32) (i32.const 0))
        (func (export "malloc") (param i32) (result i32) (i32.const 1024)))
"#;

/// Libz running `engine` on Wasmtime.
pub fn wasm_libz(engine: &str) -> Libz<WasmtimeBackend> {
    Libz::with_binary(engine.as_bytes().to_vec())
}

/// Frame `payload` the way the framed engine's `compress2` does.
pub fn framed(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(0xAB);
    out.extend_from_slice(payload);
    out
}

// ============================================================================
// Native flate2 engine
// ============================================================================

/// Bytes the native backend accepts as its "binary".
pub const NATIVE_BINARY: &[u8] = b"\0asm-native-zlib";

const Z_OK: i32 = 0;
const Z_STREAM_ERROR: i32 = -2;
const Z_DATA_ERROR: i32 = -3;
const Z_BUF_ERROR: i32 = -5;

/// Counters shared by every sandbox of one backend.
#[derive(Debug, Default)]
pub struct NativeStats {
    /// Compile attempts, failed ones included.
    pub compiles: AtomicUsize,
    /// Sandboxes created.
    pub instances: AtomicUsize,
    /// Highest number of calls observed inside one sandbox at once.
    pub max_concurrent_per_instance: AtomicUsize,
    /// Blocks allocated and not yet freed, across all sandboxes.
    pub outstanding: AtomicIsize,
}

impl NativeStats {
    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> isize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent_per_instance.load(Ordering::SeqCst)
    }
}

/// Native backend configuration.
#[derive(Debug, Clone, Default)]
pub struct NativeConfig {
    pub stats: Arc<NativeStats>,
    /// Fail `Backend::new`.
    pub fail_engine: bool,
    /// Time spent in `compile`.
    pub compile_delay: Duration,
    /// Time spent inside every codec call.
    pub call_delay: Duration,
    /// Largest allocation `malloc` grants.
    pub malloc_limit: Option<u32>,
    /// Report one byte more than the capacity from `uncompress`.
    pub overreport: bool,
    /// Exports that do not resolve.
    pub missing: Vec<&'static str>,
}

#[derive(Debug)]
pub struct NativeBackend {
    config: NativeConfig,
}

impl Backend for NativeBackend {
    type Config = NativeConfig;
    type Module = ();
    type Sandbox = NativeSandbox;

    fn new(config: &NativeConfig) -> Result<Self, SandboxError> {
        if config.fail_engine {
            return Err(SandboxError::engine("native engine disabled"));
        }
        Ok(Self {
            config: config.clone(),
        })
    }

    fn compile(&self, bytes: &[u8]) -> Result<(), SandboxError> {
        self.config.stats.compiles.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.config.compile_delay);
        if bytes != NATIVE_BINARY {
            return Err(SandboxError::compile("not a native zlib binary"));
        }
        Ok(())
    }

    fn instantiate(&self, _module: &(), _name: &str) -> Result<NativeSandbox, SandboxError> {
        self.config.stats.instances.fetch_add(1, Ordering::SeqCst);
        Ok(NativeSandbox {
            memory: vec![0; 8],
            live: 0,
            in_use: AtomicUsize::new(0),
            config: self.config.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub enum NativeFunc {
    ZError,
    Malloc,
    Free,
    Uncompress,
    Compress2,
    CompressBound,
}

/// Byte-vector linear memory with a bump allocator.
pub struct NativeSandbox {
    memory: Vec<u8>,
    live: usize,
    in_use: AtomicUsize,
    config: NativeConfig,
}

impl NativeSandbox {
    fn arg(args: &[u64], i: usize) -> u32 {
        args[i] as u32
    }

    fn slice(&self, offset: u32, len: u32) -> Result<&[u8], SandboxError> {
        let start = offset as usize;
        self.memory
            .get(start..start + len as usize)
            .ok_or(SandboxError::MemoryAccess {
                offset,
                len: len as usize,
            })
    }

    fn load_u32(&self, offset: u32) -> Result<u32, SandboxError> {
        let mut buf = [0u8; 4];
        self.read(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn malloc(&mut self, size: u32) -> u32 {
        if self.config.malloc_limit.is_some_and(|limit| size > limit) {
            return 0;
        }
        let ptr = self.memory.len().next_multiple_of(8);
        self.memory.resize(ptr + size as usize, 0);
        self.live += 1;
        self.config.stats.outstanding.fetch_add(1, Ordering::SeqCst);
        ptr as u32
    }

    fn free(&mut self) {
        self.live -= 1;
        self.config.stats.outstanding.fetch_sub(1, Ordering::SeqCst);
        if self.live == 0 {
            self.memory.truncate(8);
        }
    }

    fn uncompress(&mut self, args: &[u64]) -> Result<i32, SandboxError> {
        let (out, lenp, input, len) = (
            Self::arg(args, 0),
            Self::arg(args, 1),
            Self::arg(args, 2),
            Self::arg(args, 3),
        );
        let cap = self.load_u32(lenp)?;
        let src = self.slice(input, len)?.to_vec();

        let Some(mut data) = inflate(&src) else {
            return Ok(Z_DATA_ERROR);
        };
        if data.len() > cap as usize {
            return Ok(if cap == 0 { Z_DATA_ERROR } else { Z_BUF_ERROR });
        }

        let mut produced = data.len() as u32;
        if self.config.overreport {
            produced = cap + 1;
            data.clear();
        }
        self.write(out, &data)?;
        self.write(lenp, &produced.to_le_bytes())?;
        Ok(Z_OK)
    }

    fn compress2(&mut self, args: &[u64]) -> Result<i32, SandboxError> {
        let (out, lenp, input, len) = (
            Self::arg(args, 0),
            Self::arg(args, 1),
            Self::arg(args, 2),
            Self::arg(args, 3),
        );
        let level = Self::arg(args, 4) as i32;
        let level = match level {
            -1 => 6,
            0..=9 => level as u32,
            _ => return Ok(Z_STREAM_ERROR),
        };

        let cap = self.load_u32(lenp)?;
        let src = self.slice(input, len)?.to_vec();
        let data = deflate(&src, level);
        if data.len() > cap as usize {
            return Ok(Z_BUF_ERROR);
        }

        self.write(out, &data)?;
        self.write(lenp, &(data.len() as u32).to_le_bytes())?;
        Ok(Z_OK)
    }
}

impl Sandbox for NativeSandbox {
    type Func = NativeFunc;

    fn resolve(&mut self, name: &str) -> Option<NativeFunc> {
        if self.config.missing.iter().any(|missing| *missing == name) {
            return None;
        }
        match name {
            "zError" => Some(NativeFunc::ZError),
            "malloc" => Some(NativeFunc::Malloc),
            "free" => Some(NativeFunc::Free),
            "uncompress" => Some(NativeFunc::Uncompress),
            "compress2" => Some(NativeFunc::Compress2),
            "compressBound" => Some(NativeFunc::CompressBound),
            _ => None,
        }
    }

    fn call(&mut self, func: NativeFunc, args: &[u64]) -> Result<Vec<u64>, SandboxError> {
        let users = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.config
            .stats
            .max_concurrent_per_instance
            .fetch_max(users, Ordering::SeqCst);

        let result = match func {
            NativeFunc::ZError => Ok(vec![0]),
            NativeFunc::Malloc => Ok(vec![u64::from(self.malloc(Self::arg(args, 0)))]),
            NativeFunc::Free => {
                self.free();
                Ok(vec![])
            }
            NativeFunc::Uncompress => {
                thread::sleep(self.config.call_delay);
                self.uncompress(args).map(|s| vec![u64::from(s as u32)])
            }
            NativeFunc::Compress2 => {
                thread::sleep(self.config.call_delay);
                self.compress2(args).map(|s| vec![u64::from(s as u32)])
            }
            NativeFunc::CompressBound => {
                let n = u64::from(Self::arg(args, 0));
                Ok(vec![n + (n >> 12) + (n >> 14) + (n >> 25) + 13])
            }
        };

        self.in_use.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), SandboxError> {
        let len = buf.len() as u32;
        buf.copy_from_slice(self.slice(offset, len)?);
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), SandboxError> {
        let start = offset as usize;
        let end = start + data.len();
        let Some(dst) = self.memory.get_mut(start..end) else {
            return Err(SandboxError::MemoryAccess {
                offset,
                len: data.len(),
            });
        };
        dst.copy_from_slice(data);
        Ok(())
    }
}

/// Inflate a whole zlib stream, ignoring trailing bytes.
fn inflate(src: &[u8]) -> Option<Vec<u8>> {
    let mut stream = Decompress::new(true);
    let mut out = Vec::with_capacity(64);

    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity());
        }
        let (before_in, before_out) = (stream.total_in(), stream.total_out());
        let consumed = before_in as usize;

        match stream.decompress_vec(&src[consumed..], &mut out, FlushDecompress::None) {
            Ok(Status::StreamEnd) => return Some(out),
            Ok(_) if stream.total_in() == before_in && stream.total_out() == before_out => {
                return None;
            }
            Ok(_) => {}
            Err(_) => return None,
        }
    }
}

fn deflate(src: &[u8], level: u32) -> Vec<u8> {
    let mut stream = Compress::new(Compression::new(level), true);
    let mut out = Vec::with_capacity(src.len() + 64);

    loop {
        let consumed = stream.total_in() as usize;
        match stream.compress_vec(&src[consumed..], &mut out, FlushCompress::Finish) {
            Ok(Status::StreamEnd) => return out,
            Ok(_) => out.reserve(out.capacity().max(64)),
            Err(e) => panic!("deflate failed: {e}"),
        }
    }
}

/// Libz on the native backend with `config`.
pub fn native_libz(config: NativeConfig) -> Libz<NativeBackend> {
    Libz::with_binary(NATIVE_BINARY).with_engine_config(config)
}

/// Decode a hex string.
pub fn hex(s: &str) -> Vec<u8> {
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
        .collect()
}

/// Compress with flate2 directly, for building test inputs.
pub fn zlib(data: &[u8]) -> Vec<u8> {
    deflate(data, 6)
}
