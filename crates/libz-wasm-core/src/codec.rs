//! Call marshaling for the codec entry points.
//!
//! Every operation stages its buffers in one scratch region of the
//! instance's linear memory:
//!
//! ```text
//! [u32 LE capacity -> produced length][input bytes][output bytes]
//! ```
//!
//! The host writes the output capacity and the input, calls the entry point
//! with pointers into the region, then reads the produced length and the
//! output back. The region is freed on every exit path.

use tracing::trace;

use libz_wasm_common::{ErrorCode, Level, LibzError};

use crate::instance::{COMPRESS_BOUND, COMPRESS2, Instance, LEN_HEADER, ScratchRegion, UNCOMPRESS};
use crate::sandbox::Sandbox;

/// Largest combined input and output length a single call can stage.
pub const MAX_CALL_SIZE: u64 = u32::MAX as u64 - LEN_HEADER as u64;

/// Check that `dst_len + src_len` fits the 32-bit boundary.
///
/// # Errors
///
/// Returns [`ErrorCode::MEM_ERROR`] when it does not. Nothing is allocated.
#[allow(clippy::cast_possible_truncation)]
pub fn check_size(dst_len: usize, src_len: usize) -> Result<(u32, u32), LibzError> {
    let total = (dst_len as u64).saturating_add(src_len as u64);
    if total > MAX_CALL_SIZE {
        return Err(LibzError::status_with(
            ErrorCode::MEM_ERROR,
            format!("combined buffer size {total} exceeds {MAX_CALL_SIZE} bytes"),
        ));
    }
    Ok((dst_len as u32, src_len as u32))
}

/// Decompress `src` into `dst` with the engine's `uncompress`.
///
/// Returns the number of bytes written to the front of `dst`. On error `dst`
/// is left untouched.
///
/// # Panics
///
/// Panics if the engine reports success with more output than `dst` can
/// hold. That engine is broken and its output cannot be trusted.
pub fn uncompress<S: Sandbox>(
    instance: &mut Instance<S>,
    dst: &mut [u8],
    src: &[u8],
) -> Result<usize, LibzError> {
    let (dst_len, src_len) = check_size(dst.len(), src.len())?;
    let func = instance.function(UNCOMPRESS)?;

    instance.with_scratch(src_len, dst_len, |inst, region| {
        stage(inst, region, src)?;

        let status = inst.call_status(
            func,
            UNCOMPRESS,
            &[
                u64::from(region.output_ptr()),
                u64::from(region.len_ptr()),
                u64::from(region.input_ptr()),
                u64::from(src_len),
            ],
        )?;
        trace!(function = UNCOMPRESS, status = status.raw(), "Boundary call returned");
        status.into_result()?;

        collect(inst, region, UNCOMPRESS, dst)
    })
}

/// Worst-case compressed size of `len` input bytes, as computed by the
/// engine's `compressBound`.
pub fn compress_bound<S: Sandbox>(instance: &mut Instance<S>, len: u32) -> Result<u64, LibzError> {
    let func = instance.function(COMPRESS_BOUND)?;
    instance.call_single(func, COMPRESS_BOUND, &[u64::from(len)])
}

/// Compress `src` into `dst` with the engine's `compress2`.
///
/// An output buffer that is too small fails with [`ErrorCode::BUF_ERROR`]
/// from the engine; an invalid level with [`ErrorCode::STREAM_ERROR`].
///
/// # Panics
///
/// Panics under the same condition as [`uncompress`].
pub fn compress<S: Sandbox>(
    instance: &mut Instance<S>,
    dst: &mut [u8],
    src: &[u8],
    level: Level,
) -> Result<usize, LibzError> {
    let (dst_len, src_len) = check_size(dst.len(), src.len())?;
    let func = instance.function(COMPRESS2)?;

    instance.with_scratch(src_len, dst_len, |inst, region| {
        stage(inst, region, src)?;

        let status = inst.call_status(
            func,
            COMPRESS2,
            &[
                u64::from(region.output_ptr()),
                u64::from(region.len_ptr()),
                u64::from(region.input_ptr()),
                u64::from(src_len),
                level.as_arg(),
            ],
        )?;
        trace!(function = COMPRESS2, status = status.raw(), %level, "Boundary call returned");
        status.into_result()?;

        collect(inst, region, COMPRESS2, dst)
    })
}

/// Compress `src` into a buffer sized by the engine's `compressBound`.
pub fn compress_to_vec<S: Sandbox>(
    instance: &mut Instance<S>,
    src: &[u8],
    level: Level,
) -> Result<Vec<u8>, LibzError> {
    let (_, src_len) = check_size(0, src.len())?;
    let bound = compress_bound(instance, src_len)?;

    let bound = usize::try_from(bound).map_err(|_| {
        LibzError::status_with(ErrorCode::MEM_ERROR, "compression bound exceeds address space")
    })?;
    check_size(bound, src.len())?;

    let mut dst = vec![0u8; bound];
    let written = compress(instance, &mut dst, src, level)?;
    dst.truncate(written);
    Ok(dst)
}

/// Write the capacity header and the input into a fresh region.
fn stage<S: Sandbox>(
    instance: &mut Instance<S>,
    region: ScratchRegion,
    src: &[u8],
) -> Result<(), LibzError> {
    instance.write_u32(region.len_ptr(), region.output_len())?;
    instance.write_bytes(region.input_ptr(), src)
}

/// Read the produced length and copy the output into `dst`.
fn collect<S: Sandbox>(
    instance: &mut Instance<S>,
    region: ScratchRegion,
    function: &str,
    dst: &mut [u8],
) -> Result<usize, LibzError> {
    let produced = instance.read_u32(region.len_ptr())?;
    assert!(
        produced <= region.output_len(),
        "libz: `{function}` reported {produced} bytes written into a {} byte buffer",
        region.output_len()
    );

    let produced = produced as usize;
    instance.read_bytes(region.output_ptr(), &mut dst[..produced])?;
    Ok(produced)
}
