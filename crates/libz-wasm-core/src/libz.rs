//! Module cache and the codec front end.
//!
//! A [`Libz`] owns everything needed to run the engine:
//! - the settings consulted on first use (binary provider, backend config)
//! - the compiled module, produced at most once and cached with its outcome
//! - the pool of idle instances
//!
//! Each codec operation picks an instance by the pool policy, runs the
//! marshaling protocol from [`crate::codec`] on it and hands it back.

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use libz_wasm_common::{EngineConfig, InitError, Level, LibzConfig, LibzError, PoolConfig};

use crate::codec;
use crate::instance::Instance;
use crate::pool::{InstancePool, Lease, PoolStats};
use crate::sandbox::Backend;

/// Source of the engine binary.
///
/// Consulted once, the first time a [`Libz`] initializes.
pub trait BinaryProvider: Send + Sync {
    /// Produce the engine's bytes.
    fn binary(&self) -> Result<Cow<'_, [u8]>, InitError>;
}

impl BinaryProvider for Vec<u8> {
    fn binary(&self) -> Result<Cow<'_, [u8]>, InitError> {
        Ok(Cow::Borrowed(self.as_slice()))
    }
}

impl BinaryProvider for &'static [u8] {
    fn binary(&self) -> Result<Cow<'_, [u8]>, InitError> {
        Ok(Cow::Borrowed(*self))
    }
}

/// Reads the engine binary from a file.
#[derive(Debug, Clone)]
pub struct FileBinary(pub PathBuf);

impl FileBinary {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }
}

impl BinaryProvider for FileBinary {
    fn binary(&self) -> Result<Cow<'_, [u8]>, InitError> {
        std::fs::read(&self.0)
            .map(Cow::Owned)
            .map_err(|e| InitError::BinaryUnavailable {
                reason: format!("{}: {e}", self.0.display()),
            })
    }
}

struct Settings<C> {
    binary: Option<Arc<dyn BinaryProvider>>,
    engine: C,
}

struct Loaded<B: Backend> {
    backend: B,
    module: B::Module,
}

/// A sandboxed zlib.
///
/// The first operation (or an explicit [`Libz::initialize`]) compiles the
/// engine binary. The outcome is cached: later calls, concurrent ones
/// included, never compile again and see the same success or failure.
pub struct Libz<B: Backend> {
    settings: RwLock<Settings<B::Config>>,
    state: OnceLock<Result<Loaded<B>, InitError>>,
    pool: InstancePool<B::Sandbox>,
    pool_config: PoolConfig,
}

impl<B: Backend> Libz<B> {
    /// Create an uninitialized `Libz` with no binary and the default
    /// backend configuration.
    pub fn new() -> Self {
        Self {
            settings: RwLock::new(Settings {
                binary: None,
                engine: B::Config::default(),
            }),
            state: OnceLock::new(),
            pool: InstancePool::new(),
            pool_config: PoolConfig::default(),
        }
    }

    /// Create a `Libz` that loads its engine from `provider`.
    pub fn with_binary(provider: impl BinaryProvider + 'static) -> Self {
        let libz = Self::new();
        libz.settings.write().binary = Some(Arc::new(provider));
        libz
    }

    /// Replace the backend configuration.
    #[must_use]
    pub fn with_engine_config(self, config: B::Config) -> Self {
        self.settings.write().engine = config;
        self
    }

    /// Replace the pool policy.
    #[must_use]
    pub fn with_pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Set the engine binary used by the first initialization.
    pub fn set_binary(&self, bytes: Vec<u8>) {
        self.set_binary_provider(bytes);
    }

    /// Set the binary provider used by the first initialization.
    ///
    /// Has no effect once initialization has run.
    pub fn set_binary_provider(&self, provider: impl BinaryProvider + 'static) {
        if self.is_initialized() {
            warn!("Engine already initialized; ignoring new binary");
            return;
        }
        self.settings.write().binary = Some(Arc::new(provider));
    }

    /// Set the backend configuration used by the first initialization.
    ///
    /// Has no effect once initialization has run.
    pub fn set_engine_config(&self, config: B::Config) {
        if self.is_initialized() {
            warn!("Engine already initialized; ignoring new engine config");
            return;
        }
        self.settings.write().engine = config;
    }

    /// Returns `true` once initialization has run, successfully or not.
    pub fn is_initialized(&self) -> bool {
        self.state.get().is_some()
    }

    /// Compile the engine binary if that has not happened yet.
    ///
    /// # Errors
    ///
    /// - [`InitError::NoBinary`] if no binary was configured
    /// - [`InitError::BinaryUnavailable`] if the provider failed
    /// - [`InitError::Engine`] or [`InitError::Compile`] from the backend
    ///
    /// A failure is returned again on every later call.
    pub fn initialize(&self) -> Result<(), InitError> {
        self.loaded().map(|_| ())
    }

    fn loaded(&self) -> Result<&Loaded<B>, InitError> {
        self.state
            .get_or_init(|| self.load())
            .as_ref()
            .map_err(Clone::clone)
    }

    fn load(&self) -> Result<Loaded<B>, InitError> {
        let start = Instant::now();
        let settings = self.settings.read();

        let provider = settings.binary.clone().ok_or(InitError::NoBinary)?;
        let backend = B::new(&settings.engine)?;
        let bytes = provider.binary()?;

        let module = backend.compile(&bytes).inspect_err(|e| {
            warn!(error = %e, "Engine binary failed to compile");
        })?;

        info!(
            binary_len = bytes.len(),
            duration_ms = start.elapsed().as_millis(),
            "libz engine ready"
        );

        Ok(Loaded { backend, module })
    }

    /// Instantiate a new, unpooled instance.
    ///
    /// Initializes the engine first if needed.
    ///
    /// # Errors
    ///
    /// Returns initialization errors, instantiation failures and
    /// [`LibzError::MissingSymbol`] for engines without `zError`, `malloc`
    /// or `free`.
    pub fn new_instance(&self) -> Result<Instance<B::Sandbox>, LibzError> {
        let loaded = self.loaded()?;
        let name = format!("libz-{}", Uuid::new_v4());

        let sandbox = loaded.backend.instantiate(&loaded.module, &name)?;
        let instance = Instance::new(name, sandbox)?;

        debug!(instance = %instance.name(), "Instance created");
        Ok(instance)
    }

    /// Check out an instance for a call moving `total` bytes.
    ///
    /// Small calls are served from the pool; large ones get a fresh
    /// instance that is closed when the lease is dropped.
    pub fn acquire(&self, total: u64) -> Result<Lease<'_, B::Sandbox>, LibzError> {
        if self.pool_config.use_pool(total) {
            self.pool.acquire(|| self.new_instance())
        } else {
            debug!(total, "Using fresh instance for large call");
            self.new_instance().map(Lease::fresh)
        }
    }

    /// Decompress `src` into `dst`, returning the filled prefix of `dst`.
    ///
    /// # Errors
    ///
    /// - [`libz_wasm_common::ErrorCode::MEM_ERROR`] if the buffers together
    ///   exceed the 32-bit boundary, before anything is allocated
    /// - [`libz_wasm_common::ErrorCode::BUF_ERROR`] if `dst` is too small
    /// - [`libz_wasm_common::ErrorCode::DATA_ERROR`] if `src` is not a zlib stream
    #[instrument(skip_all, fields(src_len = src.len(), dst_len = dst.len()))]
    pub fn decompress<'a>(&self, dst: &'a mut [u8], src: &[u8]) -> Result<&'a [u8], LibzError> {
        codec::check_size(dst.len(), src.len())?;

        let mut lease = self.acquire(dst.len() as u64 + src.len() as u64)?;
        let written = codec::uncompress(&mut *lease, dst, src)?;

        Ok(&dst[..written])
    }

    /// Compress `src` into a new buffer sized by the engine's bound.
    ///
    /// # Errors
    ///
    /// Returns [`libz_wasm_common::ErrorCode::STREAM_ERROR`] for an invalid
    /// level and [`libz_wasm_common::ErrorCode::MEM_ERROR`] if the staged
    /// buffers exceed the 32-bit boundary.
    #[instrument(skip_all, fields(src_len = src.len(), level = %level))]
    pub fn compress(&self, src: &[u8], level: Level) -> Result<Vec<u8>, LibzError> {
        codec::check_size(0, src.len())?;

        // The bound is only known inside the instance; estimate for the policy
        let mut lease = self.acquire((src.len() as u64).saturating_mul(2))?;
        codec::compress_to_vec(&mut *lease, src, level)
    }

    /// Compress `src` into `dst`, returning the filled prefix of `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`libz_wasm_common::ErrorCode::BUF_ERROR`] if `dst` is too
    /// small, otherwise as [`Libz::compress`].
    #[instrument(skip_all, fields(src_len = src.len(), dst_len = dst.len(), level = %level))]
    pub fn compress_into<'a>(
        &self,
        dst: &'a mut [u8],
        src: &[u8],
        level: Level,
    ) -> Result<&'a [u8], LibzError> {
        codec::check_size(dst.len(), src.len())?;

        let mut lease = self.acquire(dst.len() as u64 + src.len() as u64)?;
        let written = codec::compress(&mut *lease, dst, src, level)?;

        Ok(&dst[..written])
    }

    /// Worst-case compressed size of `len` bytes according to the engine.
    pub fn compress_bound(&self, len: usize) -> Result<u64, LibzError> {
        let (_, len) = codec::check_size(0, len)?;

        let mut lease = self.acquire(0)?;
        codec::compress_bound(&mut *lease, len)
    }

    /// Pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Close every idle pooled instance.
    pub fn clear_pool(&self) {
        self.pool.clear();
    }
}

impl<B: Backend<Config = EngineConfig>> Libz<B> {
    /// Create a `Libz` from loaded configuration.
    ///
    /// A configured `binary` path is read lazily on first initialization.
    pub fn from_config(config: &LibzConfig) -> Self {
        let libz = Self::new()
            .with_engine_config(config.engine.clone())
            .with_pool_config(config.pool.clone());

        if let Some(ref path) = config.binary {
            libz.set_binary_provider(FileBinary::new(path));
        }
        libz
    }
}

impl<B: Backend> Default for Libz<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> fmt::Debug for Libz<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Libz")
            .field("initialized", &self.is_initialized())
            .field("pool", &self.pool.stats())
            .field("pool_config", &self.pool_config)
            .finish_non_exhaustive()
    }
}
