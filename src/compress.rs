use serde::{Deserialize, Serialize};
use std::{cell::RefCell, convert::TryFrom};

thread_local! {
    static ZSTD_CCTX: RefCell<zstd_safe::CCtx<'static>> = RefCell::new(zstd_safe::CCtx::create());
    static ZSTD_DCTX: RefCell<zstd_safe::DCtx<'static>> = RefCell::new(zstd_safe::DCtx::create());
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CompressionError {
    /// Output didn't match the size the container declared.
    #[error("Decompressed size is {actual} bytes, but {expected} were declared")]
    SizeMismatch { expected: usize, actual: usize },
    /// The declared size is more than the input could expand to.
    #[error("Declared size of {actual} bytes is more than the {max} the input can expand to")]
    ExceededSize { max: usize, actual: usize },
    #[error("Malformed zstd frame: {0}")]
    Frame(&'static str),
    #[error("zstd failure, code {0} ({})", zstd_error_name(*.0))]
    ZstdInner(usize),
    /// A provider-specific failure.
    #[error("{0}")]
    Provider(String),
}

fn zstd_error_name(code: usize) -> &'static str {
    // SAFETY: We assume the zstd library will always return a valid
    // static C string from this function, as it promises to do.
    let name = unsafe { core::ffi::CStr::from_ptr(zstd_safe::zstd_sys::ZSTD_getErrorName(code)) };
    name.to_str().unwrap_or("Undisplayable error code")
}

impl From<zstd_safe::ErrorCode> for CompressionError {
    fn from(value: zstd_safe::ErrorCode) -> Self {
        CompressionError::ZstdInner(value)
    }
}

/// Compression flag used by the header for the reference table and the body. Encoded as a single
/// ASCII byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionMode {
    /// `'U'`
    #[default]
    Uncompressed,
    /// `'C'`, LZO in files written by the game.
    Compressed,
}

impl From<CompressionMode> for u8 {
    fn from(val: CompressionMode) -> u8 {
        match val {
            CompressionMode::Uncompressed => b'U',
            CompressionMode::Compressed => b'C',
        }
    }
}

impl TryFrom<u8> for CompressionMode {
    type Error = u8;
    fn try_from(val: u8) -> Result<CompressionMode, u8> {
        match val {
            b'U' => Ok(CompressionMode::Uncompressed),
            b'C' => Ok(CompressionMode::Compressed),
            _ => Err(val),
        }
    }
}

/// A block compression provider for compressed bodies.
///
/// Files written by the game use LZO, which this crate does not implement; plug in an LZO
/// provider to read them. [`ZstdCompressor`] is bundled for tooling and tests that only need the
/// framing to round-trip.
pub trait Compressor: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    fn compress(&self, src: &[u8]) -> Result<Vec<u8>, CompressionError>;

    /// Decompress `src`, which must expand to exactly `expected_len` bytes.
    fn decompress(&self, src: &[u8], expected_len: usize) -> Result<Vec<u8>, CompressionError>;
}

/// A [`Compressor`] built on zstd. Not compatible with game files.
#[derive(Clone, Copy, Debug)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl std::default::Default for ZstdCompressor {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl Compressor for ZstdCompressor {
    fn name(&self) -> &str {
        "zstd"
    }

    fn compress(&self, src: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut dst = Vec::new();
        zstd_compress(src, &mut dst, self.level)?;
        Ok(dst)
    }

    fn decompress(&self, src: &[u8], expected_len: usize) -> Result<Vec<u8>, CompressionError> {
        let mut dst = Vec::new();
        zstd_decompress(src, &mut dst, expected_len)?;
        Ok(dst)
    }
}

fn zstd_compress(input: &[u8], output: &mut Vec<u8>, level: i32) -> Result<usize, CompressionError> {
    use zstd_safe::*;
    ZSTD_CCTX.with_borrow_mut(|ctx| {
        // The container already records both sizes, so the frame carries neither a magic
        // number nor a checksum.
        ctx.reset(ResetDirective::SessionAndParameters)?;
        ctx.set_parameter(CParameter::CompressionLevel(level))?;
        ctx.set_parameter(CParameter::DictIdFlag(false))?;
        ctx.set_parameter(CParameter::ChecksumFlag(false))?;
        ctx.set_parameter(CParameter::Format(zstd_safe::FrameFormat::Magicless))?;
        ctx.set_parameter(CParameter::ContentSizeFlag(true))?;
        ctx.set_pledged_src_size(Some(input.len() as u64))?;

        // Reserve space for the output
        output.reserve(compress_bound(input.len()));
        let out_buffer = output.spare_capacity_mut();

        // Perform compression
        let used_len = unsafe {
            let out_buffer = core::slice::from_raw_parts_mut(
                out_buffer.as_mut_ptr() as *mut u8,
                out_buffer.len(),
            );
            let used_len = ctx.compress2(out_buffer, input)?;
            output.set_len(used_len + output.len());
            used_len
        };

        Ok(used_len)
    })
}

fn zstd_decompress(
    input: &[u8],
    output: &mut Vec<u8>,
    expected_len: usize,
) -> Result<usize, CompressionError> {
    use zstd_safe::*;

    let declared = frame_content_size(input)?;
    if declared != expected_len {
        return Err(CompressionError::SizeMismatch {
            expected: expected_len,
            actual: declared,
        });
    }
    let max = input.len().saturating_mul(MAX_EXPANSION);
    if expected_len > max {
        return Err(CompressionError::ExceededSize {
            max,
            actual: expected_len,
        });
    }

    // One spare byte so an oversized frame shows up as a size mismatch instead of a zstd
    // "destination too small" error.
    output.reserve(expected_len + 1);

    ZSTD_DCTX.with_borrow_mut(|dtx| {
        dtx.reset(ResetDirective::SessionAndParameters)?;
        dtx.set_parameter(DParameter::Format(FrameFormat::Magicless))?;

        // SAFETY:
        // We're just passing the spare capacity directly to zstd to fill out,
        // then adjusting the vec up by how much zstd filled in.
        let out_buffer = output.spare_capacity_mut();
        let used_len = unsafe {
            let out_buffer = core::slice::from_raw_parts_mut(
                out_buffer.as_mut_ptr() as *mut u8,
                out_buffer.len(),
            );
            let used_len = dtx.decompress(out_buffer, input)?;
            output.set_len(used_len + output.len());
            used_len
        };
        if used_len != expected_len {
            return Err(CompressionError::SizeMismatch {
                expected: expected_len,
                actual: used_len,
            });
        }

        Ok(used_len)
    })
}

/// Most output one input byte can produce: a 4-byte RLE block covers at most 128 KiB.
const MAX_EXPANSION: usize = 1 << 15;

/// Reads the content size from the header of a magicless frame. The compressor always writes it,
/// and never writes a checksum or dictionary id.
fn frame_content_size(frame: &[u8]) -> Result<usize, CompressionError> {
    let Some(&descriptor) = frame.first() else {
        return Err(CompressionError::Frame("not enough bytes in header"));
    };
    if descriptor & 0x1F != 0 {
        return Err(CompressionError::Frame("unexpected frame header descriptor"));
    }
    let single_segment = descriptor & 0x20 != 0;
    let len = match descriptor >> 6 {
        0 if single_segment => 1,
        0 => return Err(CompressionError::Frame("missing frame content size")),
        1 => 2,
        2 => 4,
        _ => 8,
    };
    let start = if single_segment { 1 } else { 2 };
    let Some(field) = frame.get(start..start + len) else {
        return Err(CompressionError::Frame("header isn't large enough"));
    };
    let mut bytes = [0u8; 8];
    bytes[..len].copy_from_slice(field);
    let size = u64::from_le_bytes(bytes) + if len == 2 { 256 } else { 0 };
    usize::try_from(size).map_err(|_| CompressionError::Frame("content size too large"))
}
