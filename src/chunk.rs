//! Chunk stream dispatch.
//!
//! A node's state is a sequence of chunk records terminated by `0xFACADE01`. Each record starts
//! with a chunk id. Skippable chunks follow it with the `PIKS` marker and a byte size, so they can
//! be kept raw when they aren't understood. Ordinary chunks have no size, which makes an unknown
//! ordinary chunk the end of the road for its node.
//!
//! [`NodeReader`] and [`NodeWriter`] are what chunk codecs see. Both deref to the underlying
//! cursor for primitive fields and add the session-aware fields on top: Ids, Idents, and node
//! references.

use std::ops::{Deref, DerefMut};

use tracing::{trace, warn};

use crate::cursor::{Reader, Writer};
use crate::error::{Diagnostic, Error, Result};
use crate::lookback::{Id, Ident};
use crate::node::{class_of, Chunk, HeaderChunk, Node, NodeArena, NodeId, Payload, SkippableChunk};
use crate::registry::{ChunkDescriptor, ChunkKind, DynChunk, IdRemap, Registry};
use crate::session::{Checkpoint, ReadSession, WriteSession};
use crate::{Hex, FACADE, SKIP_MARKER};

/// Reads chunk fields for one session.
pub struct NodeReader<'d, 's> {
    cursor: Reader<'d>,
    session: &'s mut ReadSession,
    arena: &'s mut NodeArena,
    registry: &'s Registry,
}

impl<'d, 's> Deref for NodeReader<'d, 's> {
    type Target = Reader<'d>;
    fn deref(&self) -> &Self::Target {
        &self.cursor
    }
}

impl<'d, 's> DerefMut for NodeReader<'d, 's> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.cursor
    }
}

impl<'d, 's> NodeReader<'d, 's> {
    pub fn new(
        cursor: Reader<'d>,
        session: &'s mut ReadSession,
        arena: &'s mut NodeArena,
        registry: &'s Registry,
    ) -> Self {
        Self {
            cursor,
            session,
            arena,
            registry,
        }
    }

    /// A reader over a sub-buffer that shares this reader's session and arena.
    fn nested<'n>(&'n mut self, buf: &'n [u8], base: usize) -> NodeReader<'n, 'n> {
        NodeReader {
            cursor: Reader::with_base(buf, base),
            session: &mut *self.session,
            arena: &mut *self.arena,
            registry: self.registry,
        }
    }

    pub fn session(&self) -> &ReadSession {
        self.session
    }

    pub fn registry(&self) -> &Registry {
        self.registry
    }

    pub fn arena(&self) -> &NodeArena {
        self.arena
    }

    pub fn read_id(&mut self) -> Result<Id> {
        self.session.lookback.read_id(&mut self.cursor)
    }

    pub fn read_ident(&mut self) -> Result<Ident> {
        self.session.lookback.read_ident(&mut self.cursor)
    }

    /// The leading version field of a versioned chunk.
    pub fn read_version(&mut self) -> Result<u32> {
        self.cursor.read_u32()
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        self.session.checkpoint(self.arena.len())
    }

    pub(crate) fn rollback(&mut self, checkpoint: &Checkpoint) {
        self.session.rollback(checkpoint);
        self.arena.truncate(checkpoint.arena_len);
    }

    /// Read a node reference, parsing the referenced node in place the first time its index
    /// shows up. `expected` is the class the field should hold, if it's constrained.
    pub fn read_node_ref(&mut self, expected: Option<u32>) -> Result<Option<NodeId>> {
        let index = self.cursor.read_i32()?;
        if index <= 0 {
            return Ok(None);
        }
        let slot = index - 1;

        let node = match self.session.aux(slot) {
            Some(node) => node,
            None => {
                let offset = self.cursor.offset();
                let class_id = self.registry.latest_class_id(self.cursor.read_u32()?);
                self.read_aux_node(slot, class_id, offset)?
            }
        };

        let Some(expected) = expected else {
            return Ok(Some(node));
        };
        let found = match self.arena.get(node) {
            Some(n) if n.external_slot().is_some() => return Ok(Some(node)),
            Some(n) => n.class_id(),
            None => return Err(Error::DanglingNode),
        };
        if self.registry.is_a(found, expected) {
            return Ok(Some(node));
        }

        // FIXME: The format sometimes points a reference at a slot further along than the node
        // it means. Falling back to the most recently populated slot matches what existing tools
        // do, but the real trigger is unconfirmed and should be checked against more files.
        self.session.diagnose(Diagnostic::ReferenceAmbiguity {
            index,
            expected,
            found,
        });
        Ok(self.session.last_aux().or(Some(node)))
    }

    /// Parse a referenced node's chunk stream. The slot is filled before the chunks are read, so
    /// a node can refer back to itself or to anything that refers to it.
    fn read_aux_node(&mut self, slot: i32, class_id: u32, offset: usize) -> Result<NodeId> {
        self.session.enter_node()?;
        let result = self.read_aux_node_inner(slot, class_id, offset);
        self.session.leave_node();
        result
    }

    fn read_aux_node_inner(&mut self, slot: i32, class_id: u32, offset: usize) -> Result<NodeId> {
        let node = if self.registry.is_known(class_id) {
            Node::new(class_id)
        } else {
            self.session.diagnose(Diagnostic::UnknownClass { class_id, offset });
            Node::unknown(class_id)
        };
        let id = self.arena.insert(node);
        self.session.insert_aux(slot, id);
        trace!(
            slot,
            class_id = %Hex(class_id),
            class = self.registry.class_name(class_id),
            "reading auxiliary node"
        );

        let chunks = self.read_chunks()?;
        self.arena
            .get_mut(id)
            .ok_or(Error::DanglingNode)?
            .set_chunks(chunks);
        Ok(id)
    }

    /// Read chunks up to and including the terminator.
    pub fn read_chunks(&mut self) -> Result<Vec<Chunk>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.read_chunk()? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    /// Read one chunk record, or `None` at the terminator.
    pub fn read_chunk(&mut self) -> Result<Option<Chunk>> {
        let start = self.cursor.offset();
        let raw_id = self.cursor.read_u32()?;
        if raw_id == FACADE {
            return Ok(None);
        }
        let registry = self.registry;
        let id = registry.latest_chunk_id(raw_id);
        let descriptor = registry.chunk(id);

        let marked = matches!(self.cursor.peek_u32(), Ok(SKIP_MARKER));
        let skippable = marked && descriptor.map_or(true, |d| d.kind() != ChunkKind::Ordinary);
        if skippable {
            self.cursor.skip(4)?;
            return self.read_skippable(id, descriptor, start).map(Some);
        }

        let Some(descriptor) = descriptor else {
            return Err(Error::UnknownChunk {
                class_id: class_of(id),
                chunk_id: id,
                offset: start,
            });
        };
        if descriptor.kind() == ChunkKind::Header {
            return Err(Error::InvalidChunkPlacement(id));
        }
        trace!(chunk = descriptor.name(), id = %Hex(id), "ordinary chunk");
        let data = descriptor.decode(self).map_err(|e| e.in_chunk(id, start))?;
        Ok(Some(Chunk::Ordinary { id, data }))
    }

    fn read_skippable(
        &mut self,
        id: u32,
        descriptor: Option<&ChunkDescriptor>,
        start: usize,
    ) -> Result<Chunk> {
        let size_offset = self.cursor.offset();
        let size = self.cursor.read_i32()?;
        let size = usize::try_from(size).map_err(|_| Error::InvalidLength {
            offset: size_offset,
            length: size as i64,
        })?;
        let base = self.cursor.offset();
        let raw = self.cursor.read_bytes(size)?.to_vec();
        let mark = self.session.lookback.mark();

        let payload = match descriptor {
            Some(d) if !d.is_lazy() => self.decode_payload(d, raw, base),
            Some(d) => {
                trace!(chunk = d.name(), size, "deferring lazy chunk");
                Payload::Raw(raw)
            }
            None => {
                trace!(id = %Hex(id), size, start, "keeping unknown skippable chunk");
                Payload::Raw(raw)
            }
        };
        Ok(Chunk::Skippable(SkippableChunk { id, payload, mark }))
    }

    /// Decode a sized payload. Failure or leftover bytes roll the session back and keep the raw
    /// bytes, since the size tells us exactly where the next chunk starts.
    pub(crate) fn decode_payload(
        &mut self,
        descriptor: &ChunkDescriptor,
        raw: Vec<u8>,
        base: usize,
    ) -> Payload {
        let checkpoint = self.checkpoint();
        let result = {
            let mut sub = self.nested(&raw, base);
            descriptor.decode(&mut sub).and_then(|data| {
                if sub.is_empty() {
                    Ok(data)
                } else {
                    Err(Error::malformed(
                        sub.offset(),
                        format!("{} bytes left unread", sub.remaining()),
                    ))
                }
            })
        };
        match result {
            Ok(data) => Payload::Decoded { data, raw },
            Err(err) => {
                self.rollback(&checkpoint);
                self.session.diagnose(Diagnostic::UndecodableChunk {
                    chunk_id: descriptor.id(),
                    offset: base,
                    message: err.to_string(),
                });
                Payload::Raw(raw)
            }
        }
    }

    /// Decode one header chunk payload.
    pub(crate) fn read_header_chunk(&mut self, id: u32, heavy: bool, raw: &[u8], base: usize) -> Chunk {
        let mark = self.session.lookback.mark();
        let registry = self.registry;
        let payload = match registry.chunk(id) {
            Some(d) if d.kind() == ChunkKind::Header && !d.is_lazy() => {
                self.decode_payload(d, raw.to_vec(), base)
            }
            Some(d) if d.kind() != ChunkKind::Header => {
                warn!(chunk = d.name(), "body chunk found in header; kept raw");
                Payload::Raw(raw.to_vec())
            }
            _ => Payload::Raw(raw.to_vec()),
        };
        Chunk::Header(HeaderChunk {
            id,
            payload,
            heavy,
            mark,
        })
    }
}

/// Writes chunk fields for one session.
pub struct NodeWriter<'s> {
    out: Writer,
    session: &'s mut WriteSession,
    arena: &'s NodeArena,
    registry: &'s Registry,
    remap: IdRemap,
}

impl<'s> Deref for NodeWriter<'s> {
    type Target = Writer;
    fn deref(&self) -> &Self::Target {
        &self.out
    }
}

impl<'s> DerefMut for NodeWriter<'s> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.out
    }
}

impl<'s> NodeWriter<'s> {
    pub fn new(
        session: &'s mut WriteSession,
        arena: &'s NodeArena,
        registry: &'s Registry,
        remap: IdRemap,
    ) -> Self {
        Self {
            out: Writer::new(),
            session,
            arena,
            registry,
            remap,
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.out.into_inner()
    }

    pub fn session(&self) -> &WriteSession {
        self.session
    }

    pub fn arena(&self) -> &NodeArena {
        self.arena
    }

    /// Run `f` against a fresh buffer sharing this writer's session, and return what it wrote.
    fn nested(&mut self, f: impl FnOnce(&mut NodeWriter<'_>) -> Result<()>) -> Result<Vec<u8>> {
        let mut sub = NodeWriter {
            out: Writer::new(),
            session: &mut *self.session,
            arena: self.arena,
            registry: self.registry,
            remap: self.remap,
        };
        f(&mut sub)?;
        Ok(sub.out.into_inner())
    }

    pub fn write_id(&mut self, id: &Id) -> Result<()> {
        self.session.lookback.write_id(&mut self.out, id)
    }

    pub fn write_ident(&mut self, ident: &Ident) -> Result<()> {
        self.session.lookback.write_ident(&mut self.out, ident)
    }

    pub fn write_version(&mut self, version: u32) {
        self.out.write_u32(version);
    }

    /// Write a node reference. The first reference to a node assigns it the next free index and
    /// writes the node inline; later ones only repeat the index.
    pub fn write_node_ref(&mut self, node: Option<NodeId>) -> Result<()> {
        self.session.count_emission();
        let Some(id) = node else {
            self.out.write_i32(-1);
            return Ok(());
        };
        let arena = self.arena;
        let node = arena.get(id).ok_or(Error::DanglingNode)?;
        if let Some(slot) = node.external_slot().or_else(|| self.session.slot_of(id)) {
            self.out.write_i32(slot + 1);
            return Ok(());
        }

        let slot = self.session.assign(id);
        self.out.write_i32(slot + 1);
        self.out
            .write_u32(self.registry.remap_class_id(node.class_id(), self.remap));
        self.session.enter_node()?;
        let result = self.write_chunks(node.chunks());
        self.session.leave_node();
        result
    }

    /// Write chunk records followed by the terminator.
    pub fn write_chunks(&mut self, chunks: &[Chunk]) -> Result<()> {
        for chunk in chunks {
            self.write_chunk(chunk)?;
        }
        self.out.write_u32(FACADE);
        Ok(())
    }

    pub fn write_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        match chunk {
            Chunk::Ordinary { id, data } => {
                self.out.write_u32(self.registry.remap_chunk_id(*id, self.remap));
                data.write_dyn(self)
            }
            Chunk::Skippable(c) => {
                let body = self.payload_bytes(&c.payload)?;
                self.out.write_u32(self.registry.remap_chunk_id(c.id, self.remap));
                self.out.write_u32(SKIP_MARKER);
                self.out.write_byte_array(&body, Default::default())
            }
            Chunk::Header(c) => Err(Error::InvalidChunkPlacement(c.id)),
        }
    }

    /// The encoded bytes of a sized payload: the stored bytes if it was never decoded, otherwise
    /// a fresh encoding of the decoded value.
    pub(crate) fn payload_bytes(&mut self, payload: &Payload) -> Result<Vec<u8>> {
        match payload {
            Payload::Raw(raw) => Ok(raw.clone()),
            Payload::Decoded { data, .. } => {
                let data: &dyn DynChunk = &**data;
                self.nested(|w| data.write_dyn(w))
            }
        }
    }
}
