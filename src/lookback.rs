//! The lookback string table behind `Id` and `Ident` fields.
//!
//! The first Id read in a session is preceded by a 32-bit table version. Every Id after that is a
//! 32-bit index: the top two bits select a mode, the low 14 bits a payload.
//!
//! | index                       | meaning                                           |
//! |-----------------------------|---------------------------------------------------|
//! | `00xx_xxxx ...`             | a plain number, the whole index is the value      |
//! | `01..` or `10..`, low == 0  | a literal string follows and joins the table      |
//! | `10..`, low == 0x3FFF       | "Unassigned"                                      |
//! | `11..`, low == 0x3FFF       | the empty string                                  |
//! | anything else               | `table[low - 1]`, or empty if out of range        |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cursor::{LengthPrefix, Reader, Writer};
use crate::error::{Error, Result};

/// The table version this crate writes.
pub const ID_VERSION: u32 = 3;

const MODE_LITERAL: u32 = 0x4000_0000;
const LOW_MASK: u32 = 0x3FFF;
const INDEX_UNASSIGNED: u32 = 0xBFFF_FFFF;
const INDEX_EMPTY: u32 = 0xFFFF_FFFF;

/// An interned name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Id {
    /// The well-known "Unassigned" sentinel.
    Unassigned,
    /// An integer stored directly in the index. Always below `0x4000_0000`.
    Number(u32),
    /// A string, possibly empty.
    Str(String),
}

impl Id {
    pub fn empty() -> Self {
        Id::Str(String::new())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Id::Str(s) if s.is_empty())
    }
}

impl Default for Id {
    fn default() -> Self {
        Id::empty()
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id::Str(s.to_owned())
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Id::Str(s)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Unassigned => f.write_str("Unassigned"),
            Id::Number(n) => write!(f, "{}", n),
            Id::Str(s) => f.write_str(s),
        }
    }
}

/// Resource identity: name, collection, and author, always in that order on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ident {
    pub name: Id,
    pub collection: Id,
    pub author: Id,
}

/// How the writer encodes strings it has already emitted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdWriteMode {
    /// Every string is written as a new literal and appended to the table.
    #[default]
    AlwaysLiteral,
    /// A string already in the table is written as a back-reference to its first occurrence.
    ReuseExisting,
}

/// The state of a read table at some point in the stream. Lazily decoded chunks carry one so they
/// can later be decoded against the same table prefix they were stored with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LookbackMark {
    pub(crate) version: Option<u32>,
    pub(crate) len: usize,
}

/// The read side of a lookback table.
#[derive(Clone, Debug, Default)]
pub struct LookbackTable {
    version: Option<u32>,
    strings: Vec<String>,
}

impl LookbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the table as it was at `mark`, given the strings seen by the end of the stream.
    pub(crate) fn at_mark(mark: LookbackMark, strings: &[String]) -> Self {
        Self {
            version: mark.version,
            strings: strings[..mark.len.min(strings.len())].to_vec(),
        }
    }

    pub fn version(&self) -> Option<u32> {
        self.version
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn mark(&self) -> LookbackMark {
        LookbackMark {
            version: self.version,
            len: self.strings.len(),
        }
    }

    /// Forget everything read since `mark`.
    pub fn reset_to(&mut self, mark: LookbackMark) {
        self.version = mark.version;
        self.strings.truncate(mark.len);
    }

    pub fn read_id(&mut self, r: &mut Reader<'_>) -> Result<Id> {
        if self.version.is_none() {
            let version = r.read_u32()?;
            if version & 0xC000_0000 != 0 {
                // Some files start straight in with an index. It can only be told apart from a
                // version by its mode bits, so assume version 3 and read it again as an index.
                self.version = Some(ID_VERSION);
                r.rewind(4)?;
            } else {
                self.version = Some(version);
            }
        }

        let offset = r.offset();
        let index = r.read_u32()?;
        let mode = index >> 30;
        let low = index & LOW_MASK;

        if mode == 0 {
            return Ok(Id::Number(index));
        }
        if low == 0 && (mode == 1 || mode == 2) {
            let s = r.read_string(LengthPrefix::I32)?;
            self.strings.push(s.clone());
            return Ok(Id::Str(s));
        }
        if low == LOW_MASK {
            return match mode {
                2 => Ok(Id::Unassigned),
                3 => Ok(Id::empty()),
                _ => Err(Error::InvalidId { index, offset }),
            };
        }
        let found = (low as usize)
            .checked_sub(1)
            .and_then(|i| self.strings.get(i))
            .cloned()
            .unwrap_or_default();
        Ok(Id::Str(found))
    }

    pub fn read_ident(&mut self, r: &mut Reader<'_>) -> Result<Ident> {
        Ok(Ident {
            name: self.read_id(r)?,
            collection: self.read_id(r)?,
            author: self.read_id(r)?,
        })
    }
}

/// The write side of a lookback table.
#[derive(Clone, Debug, Default)]
pub struct LookbackWriter {
    version_written: bool,
    strings: Vec<String>,
    mode: IdWriteMode,
}

impl LookbackWriter {
    pub fn new(mode: IdWriteMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn write_id(&mut self, w: &mut Writer, id: &Id) -> Result<()> {
        if !self.version_written {
            w.write_u32(ID_VERSION);
            self.version_written = true;
        }

        match id {
            Id::Unassigned => w.write_u32(INDEX_UNASSIGNED),
            Id::Number(n) => {
                if *n >= MODE_LITERAL {
                    return Err(Error::InvalidId {
                        index: *n,
                        offset: w.len(),
                    });
                }
                w.write_u32(*n);
            }
            Id::Str(s) if s.is_empty() => w.write_u32(INDEX_EMPTY),
            Id::Str(s) => {
                let existing = match self.mode {
                    IdWriteMode::AlwaysLiteral => None,
                    IdWriteMode::ReuseExisting => self.strings.iter().position(|e| e == s),
                };
                match existing {
                    Some(i) if i < LOW_MASK as usize - 1 => {
                        w.write_u32((i as u32 + 1) | MODE_LITERAL);
                    }
                    _ => {
                        w.write_u32(MODE_LITERAL);
                        w.write_str(s, LengthPrefix::I32)?;
                        self.strings.push(s.clone());
                    }
                }
            }
        }
        Ok(())
    }

    pub fn write_ident(&mut self, w: &mut Writer, ident: &Ident) -> Result<()> {
        self.write_id(w, &ident.name)?;
        self.write_id(w, &ident.collection)?;
        self.write_id(w, &ident.author)
    }
}
