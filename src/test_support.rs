//! A small node catalog for tests: a map class with a spread of chunk kinds, a block class it
//! references, and a ghost class with background-decoded samples.

use std::sync::Arc;

use crate::chunk::{NodeReader, NodeWriter};
use crate::cursor::LengthPrefix;
use crate::deferred::Deferred;
use crate::error::Result;
use crate::lookback::{Id, Ident};
use crate::node::NodeId;
use crate::registry::{ChunkBody, Registry};
use crate::types::{PackedTransform, TimeSpan};

pub const MAP: u32 = 0x0304_3000;
pub const CHILD: u32 = 0x0305_9000;
pub const BLOCK: u32 = 0x0305_7000;
pub const GHOST: u32 = 0x0303_F000;

pub fn registry() -> Registry {
    Registry::builder()
        .class(MAP, "CGameCtnChallenge")
        .chunk::<MapInfo>(0x0304_3002, "MapInfo")
        .header::<MapDesc>(0x0304_3003, "MapDesc")
        .chunk::<ChallengeParams>(0x0304_3011, "ChallengeParams")
        .skippable::<MapName>(0x0304_3018, "MapName")
        .lazy::<MapName>(0x0304_3019, "LazyMapName")
        .lazy::<Thumbnail>(0x0304_301F, "Thumbnail")
        .chunk::<BlockList>(0x0304_3040, "BlockList")
        .subclass(CHILD, "CGameCtnChallengeVariant", MAP)
        .class(BLOCK, "CGameCtnBlock")
        .chunk::<Block>(BLOCK | 1, "Block")
        .class(GHOST, "CGameGhost")
        .skippable::<GhostSamples>(GHOST | 5, "GhostSamples")
        .build()
}

/// Versioned: `gold_time` only exists from version 3.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapInfo {
    pub version: u32,
    pub laps: i32,
    pub author_time: u32,
    pub gold_time: Option<u32>,
}

impl ChunkBody for MapInfo {
    fn read(r: &mut NodeReader<'_, '_>) -> Result<Self> {
        let version = r.read_version()?;
        let laps = r.read_i32()?;
        let author_time = r.read_u32()?;
        let gold_time = if version >= 3 {
            Some(r.read_u32()?)
        } else {
            None
        };
        Ok(Self {
            version,
            laps,
            author_time,
            gold_time,
        })
    }

    fn write(&self, w: &mut NodeWriter<'_>) -> Result<()> {
        w.write_version(self.version);
        w.write_i32(self.laps);
        w.write_u32(self.author_time);
        if self.version >= 3 {
            w.write_u32(self.gold_time.unwrap_or_default());
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapDesc {
    pub version: u8,
    pub ident: Ident,
}

impl ChunkBody for MapDesc {
    fn read(r: &mut NodeReader<'_, '_>) -> Result<Self> {
        Ok(Self {
            version: r.read_u8()?,
            ident: r.read_ident()?,
        })
    }

    fn write(&self, w: &mut NodeWriter<'_>) -> Result<()> {
        w.write_u8(self.version);
        w.write_ident(&self.ident)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChallengeParams {
    pub parent: Option<NodeId>,
}

impl ChunkBody for ChallengeParams {
    fn read(r: &mut NodeReader<'_, '_>) -> Result<Self> {
        Ok(Self {
            parent: r.read_node_ref(Some(MAP))?,
        })
    }

    fn write(&self, w: &mut NodeWriter<'_>) -> Result<()> {
        w.write_node_ref(self.parent)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapName(pub Id);

impl ChunkBody for MapName {
    fn read(r: &mut NodeReader<'_, '_>) -> Result<Self> {
        Ok(Self(r.read_id()?))
    }

    fn write(&self, w: &mut NodeWriter<'_>) -> Result<()> {
        w.write_id(&self.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Thumbnail {
    pub jpeg: Vec<u8>,
}

impl ChunkBody for Thumbnail {
    fn read(r: &mut NodeReader<'_, '_>) -> Result<Self> {
        Ok(Self {
            jpeg: r.read_byte_array(LengthPrefix::I32)?.to_vec(),
        })
    }

    fn write(&self, w: &mut NodeWriter<'_>) -> Result<()> {
        w.write_byte_array(&self.jpeg, LengthPrefix::I32)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BlockList {
    pub blocks: Vec<Option<NodeId>>,
}

impl ChunkBody for BlockList {
    fn read(r: &mut NodeReader<'_, '_>) -> Result<Self> {
        let count = r.read_count()?;
        let mut blocks = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            blocks.push(r.read_node_ref(Some(BLOCK))?);
        }
        Ok(Self { blocks })
    }

    fn write(&self, w: &mut NodeWriter<'_>) -> Result<()> {
        w.write_count(self.blocks.len())?;
        for block in &self.blocks {
            w.write_node_ref(*block)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Block {
    pub name: Id,
    pub variant: u32,
}

impl ChunkBody for Block {
    fn read(r: &mut NodeReader<'_, '_>) -> Result<Self> {
        Ok(Self {
            name: r.read_id()?,
            variant: r.read_u32()?,
        })
    }

    fn write(&self, w: &mut NodeWriter<'_>) -> Result<()> {
        w.write_id(&self.name)?;
        w.write_u32(self.variant);
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub time: TimeSpan,
    pub transform: PackedTransform,
}

pub const SAMPLE_STRIDE: u32 = 4 + PackedTransform::SIZE as u32;

/// A block of fixed-size records decoded in the background.
#[derive(Clone, Debug)]
pub struct GhostSamples {
    pub stride: u32,
    pub block: Vec<u8>,
    pub samples: Arc<Deferred<Vec<Sample>>>,
}

impl PartialEq for GhostSamples {
    fn eq(&self, other: &Self) -> bool {
        self.stride == other.stride && self.block == other.block
    }
}

impl ChunkBody for GhostSamples {
    fn read(r: &mut NodeReader<'_, '_>) -> Result<Self> {
        let stride = r.read_u32()?;
        let block = r.read_byte_array(LengthPrefix::I32)?.to_vec();
        let samples = Deferred::decode_records("ghost samples", block.clone(), stride as usize, |r| {
            Ok(Sample {
                time: r.read_time_millis_i32()?,
                transform: r.read_packed_transform()?,
            })
        });
        Ok(Self {
            stride,
            block,
            samples: Arc::new(samples),
        })
    }

    fn write(&self, w: &mut NodeWriter<'_>) -> Result<()> {
        w.write_u32(self.stride);
        w.write_byte_array(&self.block, LengthPrefix::I32)
    }
}
