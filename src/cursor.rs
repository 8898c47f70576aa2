//! Little-endian read/write primitives over byte buffers.
//!
//! The format is not self-describing: every call site chooses the width, the string length
//! prefix, and whether a boolean takes one byte or four. [`Reader`] never allocates except to
//! build owned strings, and [`Writer`] is a thin wrapper around a `Vec<u8>`.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::types::{FileRef, PackedTransform, TimeSpan, Vec2, Vec3};
use crate::FACADE;

/// How a string or byte array announces its length.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LengthPrefix {
    /// One unsigned byte.
    U8,
    /// A signed 32-bit integer. This is what most fields use.
    #[default]
    I32,
}

/// A positioned reader over a borrowed buffer.
#[derive(Clone, Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self::with_base(buf, 0)
    }

    /// A reader whose reported offsets start at `base`, for sub-buffers carved out of a larger
    /// stream.
    pub fn with_base(buf: &'a [u8], base: usize) -> Self {
        Self { buf, pos: 0, base }
    }

    /// Position relative to the start of this reader's buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Position in the enclosing stream, for error reporting.
    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(Error::EndOfBuffer {
                offset: self.base + pos,
                needed: pos - self.buf.len(),
                remaining: 0,
            });
        }
        self.pos = pos;
        Ok(())
    }

    /// Step back `n` bytes.
    pub fn rewind(&mut self, n: usize) -> Result<()> {
        self.pos = self
            .pos
            .checked_sub(n)
            .ok_or_else(|| Error::malformed(self.base, "rewind before start of buffer"))?;
        Ok(())
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if self.remaining() < needed {
            Err(Error::EndOfBuffer {
                offset: self.offset(),
                needed,
                remaining: self.remaining(),
            })
        } else {
            Ok(())
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        self.ensure(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Everything left in the buffer.
    pub fn read_to_end(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(LittleEndian::read_i16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(LittleEndian::read_f64(self.take(8)?))
    }

    pub fn peek_u32(&self) -> Result<u32> {
        self.ensure(4)?;
        Ok(LittleEndian::read_u32(&self.buf[self.pos..]))
    }

    /// A boolean stored as a 4-byte integer.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u32()? != 0)
    }

    /// A boolean stored as a single byte.
    pub fn read_bool_u8(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_vec2(&mut self) -> Result<Vec2> {
        Ok(Vec2 {
            x: self.read_f32()?,
            y: self.read_f32()?,
        })
    }

    pub fn read_vec3(&mut self) -> Result<Vec3> {
        Ok(Vec3 {
            x: self.read_f32()?,
            y: self.read_f32()?,
            z: self.read_f32()?,
        })
    }

    /// Read a length prefix and check it against what's left.
    pub fn read_len(&mut self, prefix: LengthPrefix) -> Result<usize> {
        let offset = self.offset();
        let len = match prefix {
            LengthPrefix::U8 => self.read_u8()? as usize,
            LengthPrefix::I32 => {
                let len = self.read_i32()?;
                usize::try_from(len).map_err(|_| Error::InvalidLength {
                    offset,
                    length: len as i64,
                })?
            }
        };
        self.ensure(len)?;
        Ok(len)
    }

    /// A count of following elements. Unlike [`read_len`][Self::read_len], the remaining bytes
    /// aren't checked since element sizes vary.
    pub fn read_count(&mut self) -> Result<usize> {
        let offset = self.offset();
        let count = self.read_i32()?;
        usize::try_from(count).map_err(|_| Error::InvalidLength {
            offset,
            length: count as i64,
        })
    }

    pub fn read_byte_array(&mut self, prefix: LengthPrefix) -> Result<&'a [u8]> {
        let len = self.read_len(prefix)?;
        self.take(len)
    }

    pub fn read_str(&mut self, prefix: LengthPrefix) -> Result<&'a str> {
        let len = self.read_len(prefix)?;
        let offset = self.offset();
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|source| Error::InvalidString { offset, source })
    }

    pub fn read_string(&mut self, prefix: LengthPrefix) -> Result<String> {
        self.read_str(prefix).map(str::to_owned)
    }

    /// Read `count` items using `f`.
    pub fn read_array<T>(
        &mut self,
        count: usize,
        mut f: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<Vec<T>> {
        // Don't trust `count` for the allocation; every element takes at least one byte.
        let mut out = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            out.push(f(self)?);
        }
        Ok(out)
    }

    pub fn read_time_secs_i32(&mut self) -> Result<TimeSpan> {
        Ok(TimeSpan::from_secs_f64(self.read_i32()? as f64))
    }

    pub fn read_time_millis_i32(&mut self) -> Result<TimeSpan> {
        Ok(TimeSpan::from_millis_f64(self.read_i32()? as f64))
    }

    pub fn read_time_secs_f32(&mut self) -> Result<TimeSpan> {
        Ok(TimeSpan::from_secs_f64(self.read_f32()? as f64))
    }

    pub fn read_time_millis_f32(&mut self) -> Result<TimeSpan> {
        Ok(TimeSpan::from_millis_f64(self.read_f32()? as f64))
    }

    // The nullable variants treat any negative value as absent, not only -1.

    pub fn read_time_secs_i32_opt(&mut self) -> Result<Option<TimeSpan>> {
        Ok(Some(self.read_time_secs_i32()?).filter(|t| !t.is_negative()))
    }

    pub fn read_time_millis_i32_opt(&mut self) -> Result<Option<TimeSpan>> {
        Ok(Some(self.read_time_millis_i32()?).filter(|t| !t.is_negative()))
    }

    pub fn read_time_secs_f32_opt(&mut self) -> Result<Option<TimeSpan>> {
        Ok(Some(self.read_time_secs_f32()?).filter(|t| !t.is_negative()))
    }

    pub fn read_time_millis_f32_opt(&mut self) -> Result<Option<TimeSpan>> {
        Ok(Some(self.read_time_millis_f32()?).filter(|t| !t.is_negative()))
    }

    pub fn read_packed_transform(&mut self) -> Result<PackedTransform> {
        self.ensure(PackedTransform::SIZE)?;
        Ok(PackedTransform {
            position: self.read_vec3()?,
            angle: self.read_u16()?,
            axis_heading: self.read_i16()?,
            axis_pitch: self.read_i16()?,
            speed: self.read_i16()?,
            velocity_heading: self.read_i8()?,
            velocity_pitch: self.read_i8()?,
        })
    }

    pub fn read_file_ref(&mut self) -> Result<FileRef> {
        let version = self.read_u8()?;
        let checksum = if version >= 3 {
            let mut sum = [0u8; 32];
            sum.copy_from_slice(self.take(32)?);
            Some(sum)
        } else {
            None
        };
        let mut file_ref = FileRef {
            version,
            checksum,
            file_path: self.read_string(LengthPrefix::I32)?,
            locator_url: String::new(),
        };
        if file_ref.has_locator() {
            file_ref.locator_url = self.read_string(LengthPrefix::I32)?;
        }
        Ok(file_ref)
    }

    /// Consume bytes up to, but not including, the next `0xFACADE01` marker. Fails with
    /// [`Error::EndOfBuffer`] if the marker never shows up.
    pub fn read_until_facade(&mut self) -> Result<&'a [u8]> {
        let needle = FACADE.to_le_bytes();
        let rest = &self.buf[self.pos..];
        match rest.windows(4).position(|w| w == needle) {
            Some(len) => self.take(len),
            None => Err(Error::EndOfBuffer {
                offset: self.base + self.buf.len(),
                needed: 4,
                remaining: 0,
            }),
        }
    }
}

/// An append-only little-endian writer.
#[derive(Clone, Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_i8(&mut self, v: i8) {
        self.buf.push(v as u8);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u32(v as u32);
    }

    pub fn write_bool_u8(&mut self, v: bool) {
        self.write_u8(v as u8);
    }

    pub fn write_vec2(&mut self, v: Vec2) {
        self.write_f32(v.x);
        self.write_f32(v.y);
    }

    pub fn write_vec3(&mut self, v: Vec3) {
        self.write_f32(v.x);
        self.write_f32(v.y);
        self.write_f32(v.z);
    }

    /// Write a length prefix. Fails if `len` doesn't fit the prefix.
    pub fn write_len(&mut self, len: usize, prefix: LengthPrefix) -> Result<()> {
        let offset = self.buf.len();
        let too_long = move || Error::InvalidLength {
            offset,
            length: len as i64,
        };
        match prefix {
            LengthPrefix::U8 => {
                let len = u8::try_from(len).map_err(|_| too_long())?;
                self.write_u8(len);
            }
            LengthPrefix::I32 => {
                let len = i32::try_from(len).map_err(|_| too_long())?;
                self.write_i32(len);
            }
        }
        Ok(())
    }

    pub fn write_count(&mut self, count: usize) -> Result<()> {
        self.write_len(count, LengthPrefix::I32)
    }

    pub fn write_byte_array(&mut self, bytes: &[u8], prefix: LengthPrefix) -> Result<()> {
        self.write_len(bytes.len(), prefix)?;
        self.write_bytes(bytes);
        Ok(())
    }

    pub fn write_str(&mut self, s: &str, prefix: LengthPrefix) -> Result<()> {
        self.write_byte_array(s.as_bytes(), prefix)
    }

    pub fn write_time_secs_i32(&mut self, t: TimeSpan) {
        self.write_i32(t.as_secs_f64().round() as i32);
    }

    pub fn write_time_millis_i32(&mut self, t: TimeSpan) {
        self.write_i32(t.as_millis_f64().round() as i32);
    }

    pub fn write_time_secs_f32(&mut self, t: TimeSpan) {
        self.write_f32(t.as_secs_f64() as f32);
    }

    pub fn write_time_millis_f32(&mut self, t: TimeSpan) {
        self.write_f32(t.as_millis_f64() as f32);
    }

    // Absent times are written as -1.

    pub fn write_time_secs_i32_opt(&mut self, t: Option<TimeSpan>) {
        match t {
            Some(t) => self.write_time_secs_i32(t),
            None => self.write_i32(-1),
        }
    }

    pub fn write_time_millis_i32_opt(&mut self, t: Option<TimeSpan>) {
        match t {
            Some(t) => self.write_time_millis_i32(t),
            None => self.write_i32(-1),
        }
    }

    pub fn write_time_secs_f32_opt(&mut self, t: Option<TimeSpan>) {
        match t {
            Some(t) => self.write_time_secs_f32(t),
            None => self.write_f32(-1.0),
        }
    }

    pub fn write_time_millis_f32_opt(&mut self, t: Option<TimeSpan>) {
        match t {
            Some(t) => self.write_time_millis_f32(t),
            None => self.write_f32(-1.0),
        }
    }

    pub fn write_packed_transform(&mut self, t: &PackedTransform) {
        self.write_vec3(t.position);
        self.write_u16(t.angle);
        self.write_i16(t.axis_heading);
        self.write_i16(t.axis_pitch);
        self.write_i16(t.speed);
        self.write_i8(t.velocity_heading);
        self.write_i8(t.velocity_pitch);
    }

    pub fn write_file_ref(&mut self, file_ref: &FileRef) -> Result<()> {
        self.write_u8(file_ref.version);
        if file_ref.version >= 3 {
            self.write_bytes(&file_ref.checksum.unwrap_or([0u8; 32]));
        }
        self.write_str(&file_ref.file_path, LengthPrefix::I32)?;
        if file_ref.has_locator() {
            self.write_str(&file_ref.locator_url, LengthPrefix::I32)?;
        }
        Ok(())
    }
}
