//! gbx-pack reads and writes GameBox (GBX) files, the chunked node-graph container used to store
//! maps, replays, and items.
//!
//! A GBX file is a small header, an optional table of header chunks, a reference table naming
//! nodes in other files, and a body. The body holds a graph of nodes, each one a class id followed
//! by a stream of versioned chunks. Nodes refer to each other by index, and a node is written in
//! full the first time it is referenced, so the graph can only be recovered by walking it in
//! order.
//!
//! This crate handles the framing and the shared machinery:
//!
//! - Little-endian primitives and the format's composite types ([`cursor`])
//! - The lookback string table behind `Id` and `Ident` fields ([`lookback`])
//! - Node references and the auxiliary node table ([`chunk`], [`session`])
//! - Chunk dispatch, including size-prefixed chunks that can be kept raw when unknown
//! - Header, reference table, and compressed-body framing ([`document`])
//!
//! It does not know any concrete node layouts. Those are described to a [`Registry`] by the
//! caller, one [`ChunkBody`] implementation per chunk. Anything the registry doesn't cover is
//! carried through as raw bytes where the format allows it.
//!
//! ```
//! use std::sync::Arc;
//! use gbx_pack::{Chunk, Document, ReadSettings, Registry, WriteSettings, CompressionMode};
//!
//! let registry = Arc::new(Registry::builder().class(0x0304_3000, "CGameCtnChallenge").build());
//! let mut doc = Document::new(0x0304_3000, Arc::clone(&registry));
//! doc.header_mut().body_compression = CompressionMode::Uncompressed;
//! let root = doc.root();
//! doc.node_mut(root)
//!     .unwrap()
//!     .push(Chunk::skippable_raw(0x0304_3099, vec![1, 2, 3]));
//!
//! let bytes = doc.write(&WriteSettings::default()).unwrap();
//! let back = Document::read(&bytes, registry, &ReadSettings::default()).unwrap();
//! assert_eq!(back.node(back.root()), doc.node(root));
//! ```
//!
//! Compressed bodies need a [`Compressor`]. Files written by the game use LZO, which has to be
//! supplied by the caller.

use std::fmt;

pub mod chunk;
pub mod compress;
pub mod cursor;
pub mod deferred;
pub mod document;
mod error;
pub mod header;
pub mod lookback;
pub mod node;
pub mod ref_table;
pub mod registry;
pub mod session;
pub mod settings;
pub mod types;

#[cfg(test)]
mod test_support;

pub use chunk::{NodeReader, NodeWriter};
pub use compress::{CompressionError, CompressionMode, Compressor, ZstdCompressor};
pub use cursor::{LengthPrefix, Reader, Writer};
pub use deferred::{CancelToken, Deferred};
pub use document::{Body, Document};
pub use error::{Diagnostic, Error, Result};
pub use header::HeaderInfo;
pub use lookback::{Id, IdWriteMode, Ident, LookbackTable, LookbackWriter};
pub use node::{Chunk, Node, NodeArena, NodeId, Payload};
pub use ref_table::{ExternalFile, ExternalNode, RefFolder, RefTable};
pub use registry::{ChunkBody, ChunkKind, IdRemap, Registry, RegistryBuilder};
pub use session::{ReadSession, WriteSession};
pub use settings::{BodyMode, Progress, ProgressSink, ReadSettings, Stage, WriteSettings};
pub use types::{FileRef, PackedTransform, Quat, TimeSpan, Transform, Vec2, Vec3};

/// File magic.
pub const MAGIC: &[u8; 3] = b"GBX";

/// Ends every node's chunk stream.
pub const FACADE: u32 = 0xFACA_DE01;

/// `"PIKS"`, marking a chunk as size-prefixed and skippable.
pub const SKIP_MARKER: u32 = 0x534B_4950;

/// Deepest chain of inline node definitions a read or write will follow.
pub const MAX_DEPTH: usize = 100;

/// Formats a class or chunk id the way they're usually written, for log fields.
pub(crate) struct Hex(pub u32);

impl fmt::Display for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
