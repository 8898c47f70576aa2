//! Nodes, chunks, and the arena that owns them.
//!
//! Nodes reference each other through [`NodeId`] handles into a [`NodeArena`], so reference
//! cycles between nodes need no special handling.

use educe::Educe;

use crate::lookback::LookbackMark;
use crate::registry::{ChunkBody, DynChunk};

/// Class bits of a chunk id.
pub const fn class_of(chunk_id: u32) -> u32 {
    chunk_id & 0xFFFF_F000
}

/// Chunk number within its class.
pub const fn local_of(chunk_id: u32) -> u32 {
    chunk_id & 0xFFF
}

/// Handle to a node in a [`NodeArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Owner of every node in a document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeArena {
    nodes: Vec<Node>,
}

impl NodeArena {
    pub fn insert(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drop every node inserted after the first `len`. Handles to them become dangling.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.nodes.truncate(len);
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId(i as u32), n))
    }
}

/// A typed graph vertex: a class id and the chunks holding its state.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    class_id: u32,
    chunks: Vec<Chunk>,
    known: bool,
    external: Option<i32>,
}

impl Node {
    pub fn new(class_id: u32) -> Self {
        Self {
            class_id,
            chunks: Vec::new(),
            known: true,
            external: None,
        }
    }

    pub(crate) fn unknown(class_id: u32) -> Self {
        Self {
            known: false,
            ..Self::new(class_id)
        }
    }

    /// Placeholder for a node living in another file, found in the reference table at `slot`.
    pub(crate) fn external(slot: i32) -> Self {
        Self {
            class_id: 0,
            chunks: Vec::new(),
            known: false,
            external: Some(slot),
        }
    }

    pub fn class_id(&self) -> u32 {
        self.class_id
    }

    /// Whether the registry knew this node's class when it was read.
    pub fn is_known(&self) -> bool {
        self.known
    }

    /// The auxiliary slot of an external node.
    pub fn external_slot(&self) -> Option<i32> {
        self.external
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunks_mut(&mut self) -> &mut Vec<Chunk> {
        &mut self.chunks
    }

    pub(crate) fn set_chunks(&mut self, chunks: Vec<Chunk>) {
        self.chunks = chunks;
    }

    pub fn push(&mut self, chunk: Chunk) {
        self.chunks.push(chunk);
    }

    pub fn with_chunk(mut self, chunk: Chunk) -> Self {
        self.chunks.push(chunk);
        self
    }

    pub fn chunk(&self, id: u32) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.id() == id)
    }

    pub fn chunk_mut(&mut self, id: u32) -> Option<&mut Chunk> {
        self.chunks.iter_mut().find(|c| c.id() == id)
    }

    pub fn remove(&mut self, id: u32) -> Option<Chunk> {
        let pos = self.chunks.iter().position(|c| c.id() == id)?;
        Some(self.chunks.remove(pos))
    }

    /// The first decoded chunk of type `T`. Undiscovered chunks are skipped.
    pub fn get<T: ChunkBody>(&self) -> Option<&T> {
        self.chunks.iter().find_map(|c| c.data::<T>())
    }

    pub fn get_mut<T: ChunkBody>(&mut self) -> Option<&mut T> {
        self.chunks.iter_mut().find_map(|c| c.data_mut::<T>())
    }
}

/// Chunk contents: either raw bytes or the decoded value.
#[derive(Clone, Debug)]
pub enum Payload {
    /// Not decoded: unknown, deferred, or failed to decode.
    Raw(Vec<u8>),
    /// Decoded. `raw` holds the bytes it was read from, empty for chunks built in memory.
    Decoded {
        data: Box<dyn DynChunk>,
        raw: Vec<u8>,
    },
}

impl Payload {
    pub fn is_decoded(&self) -> bool {
        matches!(self, Payload::Decoded { .. })
    }

    /// The bytes the chunk was read from, if any.
    pub fn raw(&self) -> &[u8] {
        match self {
            Payload::Raw(raw) | Payload::Decoded { raw, .. } => raw,
        }
    }
}

impl PartialEq for Payload {
    // Decoded payloads compare by value: a chunk built in memory equals the same chunk read back.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Payload::Raw(a), Payload::Raw(b)) => a == b,
            (Payload::Decoded { data: a, .. }, Payload::Decoded { data: b, .. }) => {
                a.eq_dyn(&**b)
            }
            _ => false,
        }
    }
}

/// A size-prefixed body chunk.
#[derive(Clone, Debug, Educe)]
#[educe(PartialEq)]
pub struct SkippableChunk {
    pub id: u32,
    pub payload: Payload,
    /// Lookback state when the chunk was read, used for deferred decoding.
    #[educe(PartialEq(ignore))]
    pub(crate) mark: LookbackMark,
}

/// A chunk from the header's user data.
#[derive(Clone, Debug, Educe)]
#[educe(PartialEq)]
pub struct HeaderChunk {
    pub id: u32,
    pub payload: Payload,
    /// Flags the chunk as expensive to read. Informational only.
    pub heavy: bool,
    #[educe(PartialEq(ignore))]
    pub(crate) mark: LookbackMark,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Chunk {
    /// Unsized, so always decoded.
    Ordinary { id: u32, data: Box<dyn DynChunk> },
    Skippable(SkippableChunk),
    Header(HeaderChunk),
}

impl Chunk {
    pub fn ordinary<T: ChunkBody>(id: u32, data: T) -> Self {
        Chunk::Ordinary {
            id,
            data: Box::new(data),
        }
    }

    pub fn skippable<T: ChunkBody>(id: u32, data: T) -> Self {
        Chunk::Skippable(SkippableChunk {
            id,
            payload: Payload::Decoded {
                data: Box::new(data),
                raw: Vec::new(),
            },
            mark: LookbackMark::default(),
        })
    }

    /// A skippable chunk holding bytes this crate can't interpret.
    pub fn skippable_raw(id: u32, raw: Vec<u8>) -> Self {
        Chunk::Skippable(SkippableChunk {
            id,
            payload: Payload::Raw(raw),
            mark: LookbackMark::default(),
        })
    }

    pub fn header<T: ChunkBody>(id: u32, data: T, heavy: bool) -> Self {
        Chunk::Header(HeaderChunk {
            id,
            payload: Payload::Decoded {
                data: Box::new(data),
                raw: Vec::new(),
            },
            heavy,
            mark: LookbackMark::default(),
        })
    }

    pub fn header_raw(id: u32, raw: Vec<u8>, heavy: bool) -> Self {
        Chunk::Header(HeaderChunk {
            id,
            payload: Payload::Raw(raw),
            heavy,
            mark: LookbackMark::default(),
        })
    }

    pub fn id(&self) -> u32 {
        match self {
            Chunk::Ordinary { id, .. } => *id,
            Chunk::Skippable(c) => c.id,
            Chunk::Header(c) => c.id,
        }
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Chunk::Ordinary { .. } => None,
            Chunk::Skippable(c) => Some(&c.payload),
            Chunk::Header(c) => Some(&c.payload),
        }
    }

    pub(crate) fn payload_mut(&mut self) -> Option<&mut Payload> {
        match self {
            Chunk::Ordinary { .. } => None,
            Chunk::Skippable(c) => Some(&mut c.payload),
            Chunk::Header(c) => Some(&mut c.payload),
        }
    }

    pub(crate) fn mark(&self) -> LookbackMark {
        match self {
            Chunk::Ordinary { .. } => LookbackMark::default(),
            Chunk::Skippable(c) => c.mark,
            Chunk::Header(c) => c.mark,
        }
    }

    /// Whether typed fields are available. Ordinary chunks always are.
    pub fn is_discovered(&self) -> bool {
        self.payload().map_or(true, Payload::is_decoded)
    }

    fn dyn_data(&self) -> Option<&dyn DynChunk> {
        match self {
            Chunk::Ordinary { data, .. } => Some(&**data),
            _ => match self.payload()? {
                Payload::Decoded { data, .. } => Some(&**data),
                Payload::Raw(_) => None,
            },
        }
    }

    pub fn data<T: ChunkBody>(&self) -> Option<&T> {
        self.dyn_data()?.as_any().downcast_ref()
    }

    pub fn data_mut<T: ChunkBody>(&mut self) -> Option<&mut T> {
        let data = match self {
            Chunk::Ordinary { data, .. } => data,
            Chunk::Skippable(SkippableChunk {
                payload: Payload::Decoded { data, .. },
                ..
            })
            | Chunk::Header(HeaderChunk {
                payload: Payload::Decoded { data, .. },
                ..
            }) => data,
            _ => return None,
        };
        data.as_any_mut().downcast_mut()
    }
}
