//! libz-wasm CLI entry point.
//!
//! Compresses or decompresses a file (or stdin) with zlib running inside the
//! WebAssembly sandbox.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use libz_wasm_common::{ConfigFile, ErrorCode, Level, LogFormat, LoggingConfig};
use libz_wasm_core::{FileBinary, Libz, WasmtimeBackend};

/// Largest output `decompress` grows its buffer to by default (1 GiB).
const DEFAULT_MAX_SIZE: usize = 1 << 30;

#[derive(Parser, Debug)]
#[command(name = "libz-wasm", version)]
#[command(about = "zlib compression running inside a WebAssembly sandbox")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Compiled zlib WebAssembly module
    #[arg(long, env = "LIBZ_WASM_BINARY", global = true)]
    binary: Option<PathBuf>,

    /// Log output format (overrides the config file)
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compress INPUT into a zlib stream
    Compress {
        /// Compression level, 0-9 or -1 for the default
        #[arg(short, long, default_value_t = -1, allow_hyphen_values = true)]
        level: i32,

        /// Input file (stdin if omitted)
        input: Option<PathBuf>,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Decompress a zlib stream
    Decompress {
        /// Largest decompressed size to allow, in bytes
        #[arg(long, default_value_t = DEFAULT_MAX_SIZE)]
        max_size: usize,

        /// Input file (stdin if omitted)
        input: Option<PathBuf>,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => Self::Text,
            LogFormatArg::Json => Self::Json,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ConfigFile::default(),
    };
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }

    init_tracing(&config.logging);

    let libz: Libz<WasmtimeBackend> = Libz::from_config(&config.libz);
    if let Some(ref path) = cli.binary {
        libz.set_binary_provider(FileBinary::new(path));
    }

    libz.initialize()
        .context("Failed to load zlib module (set --binary or LIBZ_WASM_BINARY)")?;

    match cli.command {
        Command::Compress {
            level,
            input,
            output,
        } => {
            let src = read_input(input.as_deref())?;
            let compressed = libz
                .compress(&src, Level::new(level))
                .context("Compression failed")?;

            info!(
                input_bytes = src.len(),
                output_bytes = compressed.len(),
                "Compressed"
            );
            write_output(output.as_deref(), &compressed)?;
        }
        Command::Decompress {
            max_size,
            input,
            output,
        } => {
            let src = read_input(input.as_deref())?;
            let plain = decompress_growing(&libz, &src, max_size)?;

            info!(
                input_bytes = src.len(),
                output_bytes = plain.len(),
                "Decompressed"
            );
            write_output(output.as_deref(), &plain)?;
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries data
    match logging.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .init(),
        LogFormat::Text => registry.with(fmt::layer().with_writer(io::stderr)).init(),
    }
}

/// Decompress without knowing the output size: start at four times the
/// input and double on `Z_BUF_ERROR` up to `max_size`.
fn decompress_growing(
    libz: &Libz<WasmtimeBackend>,
    src: &[u8],
    max_size: usize,
) -> anyhow::Result<Vec<u8>> {
    let mut capacity = initial_capacity(src.len(), max_size);

    loop {
        let mut buf = vec![0u8; capacity];
        match libz.decompress(&mut buf, src) {
            Ok(plain) => {
                let len = plain.len();
                buf.truncate(len);
                return Ok(buf);
            }
            Err(e) if e.is(ErrorCode::BUF_ERROR) && capacity < max_size => {
                capacity = capacity.saturating_mul(2).min(max_size);
                debug!(capacity, "Output buffer too small, growing");
            }
            Err(e) if e.is(ErrorCode::BUF_ERROR) => {
                bail!("Decompressed data exceeds --max-size of {max_size} bytes");
            }
            Err(e) => return Err(e).context("Decompression failed"),
        }
    }
}

/// Four times the input, at least 64 bytes, never above `max_size`.
fn initial_capacity(src_len: usize, max_size: usize) -> usize {
    src_len.saturating_mul(4).max(64).min(max_size)
}

fn read_input(path: Option<&Path>) -> anyhow::Result<Vec<u8>> {
    match path {
        Some(path) => {
            fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
        }
        None => {
            let mut buf = Vec::new();
            io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read stdin")?;
            Ok(buf)
        }
    }
}

fn write_output(path: Option<&Path>, data: &[u8]) -> anyhow::Result<()> {
    match path {
        Some(path) => {
            fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(data).context("Failed to write stdout")?;
            stdout.flush().context("Failed to flush stdout")
        }
    }
}
