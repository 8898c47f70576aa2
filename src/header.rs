//! The container header.
//!
//! ```text
//! "GBX"  version:i16  format:u8  ref_compression:u8  body_compression:u8  [unknown:u8]  class:u32
//! [user_data_size:i32  [count:i32  (id:u32 size:u32){count}  payloads]]  num_nodes:i32
//! ```
//!
//! The unknown byte is present from version 4, the user data from version 6. The top bit of a
//! header chunk's size flags it as heavy.

use serde::{Deserialize, Serialize};

use crate::compress::CompressionMode;
use crate::cursor::{Reader, Writer};
use crate::error::{Error, Result};
use crate::MAGIC;

pub const MIN_VERSION: i16 = 3;
pub const MAX_VERSION: i16 = 6;

const HEAVY_BIT: u32 = 1 << 31;

/// Byte format marking a binary file. Text files (`'T'`) aren't supported.
pub const BINARY_FORMAT: u8 = b'B';

/// Header fields other than the class id and the header chunks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderInfo {
    pub version: i16,
    pub byte_format: u8,
    pub ref_compression: CompressionMode,
    pub body_compression: CompressionMode,
    /// Present from version 4.
    pub unknown: Option<u8>,
    /// Node count as stored in the file. Recomputed on write.
    pub num_nodes: i32,
    /// Whether the user-data section held a chunk table. A zero user-data size is kept as zero
    /// when there are no header chunks to write.
    pub user_data_present: bool,
}

impl Default for HeaderInfo {
    fn default() -> Self {
        Self {
            version: MAX_VERSION,
            byte_format: BINARY_FORMAT,
            ref_compression: CompressionMode::Uncompressed,
            body_compression: CompressionMode::Compressed,
            unknown: Some(b'R'),
            num_nodes: 0,
            user_data_present: true,
        }
    }
}

/// A header chunk as framed in the user data, before decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RawHeaderChunk<'a> {
    pub id: u32,
    pub heavy: bool,
    pub data: &'a [u8],
    /// Offset of `data` in the file.
    pub offset: usize,
}

/// The parsed header. Chunk payloads borrow the file buffer.
#[derive(Debug)]
pub(crate) struct RawHeader<'a> {
    pub info: HeaderInfo,
    pub class_id: u32,
    pub chunks: Vec<RawHeaderChunk<'a>>,
}

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedHeader(msg.into())
}

fn compression(byte: u8, what: &str) -> Result<CompressionMode> {
    CompressionMode::try_from(byte)
        .map_err(|b| malformed(format!("unknown {} compression byte {:#04x}", what, b)))
}

pub(crate) fn read_header<'a>(r: &mut Reader<'a>) -> Result<RawHeader<'a>> {
    let magic = r
        .read_bytes(MAGIC.len())
        .map_err(|_| malformed("file too short for a GBX header"))?;
    if magic != MAGIC {
        return Err(malformed("missing GBX magic"));
    }
    let version = r.read_i16()?;
    if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
        return Err(malformed(format!("unsupported version {}", version)));
    }

    let byte_format = r.read_u8()?;
    if byte_format != BINARY_FORMAT {
        return Err(malformed(format!(
            "byte format {:?} is not supported",
            byte_format as char
        )));
    }
    let ref_compression = compression(r.read_u8()?, "reference table")?;
    if ref_compression == CompressionMode::Compressed {
        return Err(malformed("compressed reference tables are not supported"));
    }
    let body_compression = compression(r.read_u8()?, "body")?;
    let unknown = if version >= 4 { Some(r.read_u8()?) } else { None };
    let class_id = r.read_u32()?;

    let mut user_data_present = false;
    let mut chunks = Vec::new();
    if version >= 6 {
        let size_offset = r.offset();
        let size = r.read_i32()?;
        let size = usize::try_from(size).map_err(|_| Error::InvalidLength {
            offset: size_offset,
            length: size as i64,
        })?;
        if size > 0 {
            user_data_present = true;
            let base = r.offset();
            let user_data = r.read_bytes(size)?;
            chunks = split_user_data(user_data, base)?;
        }
    }
    let num_nodes = r.read_i32()?;

    tracing::debug!(
        version,
        class_id = %crate::Hex(class_id),
        header_chunks = chunks.len(),
        num_nodes,
        "read header"
    );
    Ok(RawHeader {
        info: HeaderInfo {
            version,
            byte_format,
            ref_compression,
            body_compression,
            unknown,
            num_nodes,
            user_data_present,
        },
        class_id,
        chunks,
    })
}

/// Split the user data into its chunks. Sizes must account for every byte.
fn split_user_data(data: &[u8], base: usize) -> Result<Vec<RawHeaderChunk<'_>>> {
    let mut r = Reader::with_base(data, base);
    let count = r.read_count()?;
    let table: Vec<(u32, u32)> = r.read_array(count, |r| Ok((r.read_u32()?, r.read_u32()?)))?;
    let mut chunks = Vec::with_capacity(count);
    for (id, size) in table {
        let offset = r.offset();
        let data = r.read_bytes((size & !HEAVY_BIT) as usize).map_err(|_| {
            malformed(format!("header chunk {:#010x} runs past the user data", id))
        })?;
        chunks.push(RawHeaderChunk {
            id,
            heavy: size & HEAVY_BIT != 0,
            data,
            offset,
        });
    }
    if !r.is_empty() {
        return Err(malformed(format!(
            "{} bytes of user data not covered by header chunks",
            r.remaining()
        )));
    }
    Ok(chunks)
}

/// Write the header. `chunks` are `(id, heavy, payload)`, already remapped and encoded.
pub(crate) fn write_header(
    w: &mut Writer,
    info: &HeaderInfo,
    class_id: u32,
    chunks: &[(u32, bool, Vec<u8>)],
    num_nodes: i32,
) -> Result<()> {
    if !(MIN_VERSION..=MAX_VERSION).contains(&info.version) {
        return Err(malformed(format!("unsupported version {}", info.version)));
    }
    w.write_bytes(MAGIC);
    w.write_i16(info.version);
    w.write_u8(info.byte_format);
    w.write_u8(info.ref_compression.into());
    w.write_u8(info.body_compression.into());
    if info.version >= 4 {
        w.write_u8(info.unknown.unwrap_or(b'R'));
    }
    w.write_u32(class_id);

    if info.version >= 6 {
        if chunks.is_empty() && !info.user_data_present {
            w.write_i32(0);
        } else {
            let payload: usize = chunks.iter().map(|(_, _, data)| data.len()).sum();
            let size = payload + chunks.len() * 8 + 4;
            w.write_len(size, Default::default())?;
            w.write_count(chunks.len())?;
            for (id, heavy, data) in chunks {
                let size = u32::try_from(data.len())
                    .ok()
                    .filter(|s| s & HEAVY_BIT == 0)
                    .ok_or_else(|| malformed(format!("header chunk {:#010x} too large", id)))?;
                w.write_u32(*id);
                w.write_u32(if *heavy { size | HEAVY_BIT } else { size });
            }
            for (_, _, data) in chunks {
                w.write_bytes(data);
            }
        }
    } else if !chunks.is_empty() {
        return Err(malformed(format!(
            "version {} has no room for header chunks",
            info.version
        )));
    }
    w.write_i32(num_nodes);
    Ok(())
}
