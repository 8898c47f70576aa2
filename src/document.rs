//! Whole GBX files.
//!
//! A [`Document`] is the header, its header chunks, the reference table, and the node graph the
//! body decodes to. Reading walks the file front to back:
//!
//! 1. The header and its chunk table. Header chunks get a lookback session of their own.
//! 2. The reference table. Every external node becomes a placeholder in the arena, sitting in the
//!    auxiliary slot its index names.
//! 3. The body, decompressed if needed, then parsed as the root node's chunk stream. Nodes
//!    referenced from those chunks are parsed in place.
//!
//! Whatever follows the root's terminator is kept as the body's rest. If the root stream hits an
//! ordinary chunk nobody knows how to read, the parse stops there, and the unread bytes join the
//! rest so the file still writes back unchanged.
//!
//! Offsets in errors and diagnostics raised from the body count from the start of the
//! (decompressed) body, not the file.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::chunk::{NodeReader, NodeWriter};
use crate::compress::CompressionMode;
use crate::cursor::{LengthPrefix, Reader, Writer};
use crate::deferred::Deferred;
use crate::error::{Diagnostic, Error, Result};
use crate::header::{read_header, write_header, HeaderInfo};
use crate::node::{Chunk, Node, NodeArena, NodeId, Payload};
use crate::ref_table::{ExternalNode, RefTable};
use crate::registry::{ChunkBody, ChunkKind, Registry};
use crate::session::{DiscoveryContext, ReadSession, WriteSession};
use crate::settings::{BodyMode, ReadSettings, Stage, WriteSettings};
use crate::{Hex, FACADE};

/// The state of a document's body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Body {
    /// Parsed into the node arena.
    Parsed {
        /// Bytes after the root's chunk stream.
        rest: Vec<u8>,
        /// False if parsing stopped early. `rest` then starts at the chunk that stopped it and
        /// carries the original terminator.
        complete: bool,
    },
    /// Stored exactly as read. `uncompressed_size` is set when `data` is compressed.
    Raw {
        uncompressed_size: Option<i32>,
        data: Vec<u8>,
    },
    /// Not read at all. The document can't be written.
    Unread,
}

/// Where a chunk lives, for discovery.
#[derive(Clone, Copy, Debug)]
enum ChunkSlot {
    Header(usize),
    Body(NodeId, usize),
}

#[derive(Clone, Debug)]
pub struct Document {
    header: HeaderInfo,
    header_chunks: Vec<Chunk>,
    ref_table: RefTable,
    arena: NodeArena,
    root: NodeId,
    body: Body,
    discovery: DiscoveryContext,
    header_discovery: DiscoveryContext,
    diagnostics: Vec<Diagnostic>,
    registry: Arc<Registry>,
}

impl Document {
    /// An empty document with a root node of class `class_id`.
    pub fn new(class_id: u32, registry: Arc<Registry>) -> Self {
        let mut arena = NodeArena::default();
        let root = arena.insert(Node::new(class_id));
        Self {
            header: HeaderInfo::default(),
            header_chunks: Vec::new(),
            ref_table: RefTable::default(),
            arena,
            root,
            body: Body::Parsed {
                rest: Vec::new(),
                complete: true,
            },
            discovery: DiscoveryContext::default(),
            header_discovery: DiscoveryContext::default(),
            diagnostics: Vec::new(),
            registry,
        }
    }

    #[tracing::instrument(
        level = "debug",
        name = "gbx_read",
        skip_all,
        fields(len = data.len(), session = tracing::field::Empty)
    )]
    pub fn read(data: &[u8], registry: Arc<Registry>, settings: &ReadSettings) -> Result<Self> {
        let mut r = Reader::new(data);
        let raw = read_header(&mut r)?;
        settings.report(Stage::Header, r.position(), data.len(), None);

        let mut diagnostics = Vec::new();
        let class_id = registry.latest_class_id(raw.class_id);
        let mut arena = NodeArena::default();
        let root = if registry.is_known(class_id) {
            arena.insert(Node::new(class_id))
        } else {
            // The class id follows the unknown byte, which version 3 lacks.
            let offset = if raw.info.version >= 4 { 9 } else { 8 };
            let diagnostic = Diagnostic::UnknownClass { class_id, offset };
            tracing::warn!("{}", diagnostic);
            diagnostics.push(diagnostic);
            arena.insert(Node::unknown(class_id))
        };

        let mut header_session = ReadSession::new();
        let header_chunks = {
            let mut hr =
                NodeReader::new(Reader::new(&[]), &mut header_session, &mut arena, &registry);
            let mut chunks = Vec::with_capacity(raw.chunks.len());
            for c in &raw.chunks {
                let id = registry.latest_chunk_id(c.id);
                trace!(id = %Hex(id), size = c.data.len(), heavy = c.heavy, "header chunk");
                chunks.push(hr.read_header_chunk(id, c.heavy, c.data, c.offset));
                settings.report(Stage::HeaderChunk, c.offset + c.data.len(), data.len(), Some(id));
            }
            chunks
        };
        let header_discovery = header_session.discovery_context();
        diagnostics.extend(header_session.take_diagnostics());

        let ref_table = RefTable::read(&mut r, raw.info.version)?;
        let compressed = raw.info.body_compression == CompressionMode::Compressed;

        let mut discovery = DiscoveryContext::default();
        let body = match settings.get_body_mode() {
            BodyMode::Skip => Body::Unread,
            BodyMode::KeepRaw if compressed => {
                let (uncompressed_size, packed) = read_compressed_frame(&mut r)?;
                Body::Raw {
                    uncompressed_size: Some(uncompressed_size),
                    data: packed.to_vec(),
                }
            }
            BodyMode::KeepRaw => Body::Raw {
                uncompressed_size: None,
                data: r.read_to_end().to_vec(),
            },
            BodyMode::Parse => {
                let unpacked;
                let bytes = if compressed {
                    let compressor = settings.get_compressor().ok_or(Error::MissingCompressor)?;
                    let (size, packed) = read_compressed_frame(&mut r)?;
                    let size = size as usize;
                    unpacked = compressor.decompress(packed, size)?;
                    if unpacked.len() != size {
                        return Err(crate::compress::CompressionError::SizeMismatch {
                            expected: size,
                            actual: unpacked.len(),
                        }
                        .into());
                    }
                    debug!(
                        compressor = compressor.name(),
                        packed = packed.len(),
                        size,
                        "decompressed body"
                    );
                    &unpacked[..]
                } else {
                    r.read_to_end()
                };
                let (mut session, body) =
                    parse_body(bytes, &registry, &mut arena, root, &ref_table, settings)?;
                discovery = session.discovery_context();
                diagnostics.extend(session.take_diagnostics());
                settings.report(Stage::Body, bytes.len(), bytes.len(), None);
                body
            }
        };
        if !r.is_empty() {
            debug!(trailing = r.remaining(), "ignoring bytes after compressed body");
        }

        debug!(
            nodes = arena.len(),
            header_chunks = header_chunks.len(),
            diagnostics = diagnostics.len(),
            "read document"
        );
        Ok(Self {
            header: raw.info,
            header_chunks,
            ref_table,
            arena,
            root,
            body,
            discovery,
            header_discovery,
            diagnostics,
            registry,
        })
    }

    pub fn read_from<R: Read>(
        mut reader: R,
        registry: Arc<Registry>,
        settings: &ReadSettings,
    ) -> Result<Self> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Self::read(&data, registry, settings)
    }

    pub fn open(
        path: impl AsRef<Path>,
        registry: Arc<Registry>,
        settings: &ReadSettings,
    ) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::read(&data, registry, settings)
    }

    /// Read on a background thread. Set a cancel token in `settings` to stop it early.
    pub fn spawn_read(data: Vec<u8>, registry: Arc<Registry>, settings: ReadSettings) -> Deferred<Self> {
        Deferred::spawn("document read", move || {
            Self::read(&data, registry, &settings)
        })
    }

    #[tracing::instrument(
        level = "debug",
        name = "gbx_write",
        skip_all,
        fields(session = tracing::field::Empty)
    )]
    pub fn write(&self, settings: &WriteSettings) -> Result<Vec<u8>> {
        if self.has_pending_chunks() {
            // Raw payloads hold Ids encoded against the table they were read with. Decode them
            // so this write's session encodes them afresh.
            let mut doc = self.clone();
            let decoded = doc.discover_all()?;
            debug!(decoded, "decoded deferred chunks before writing");
            return doc.write_encoded(settings);
        }
        self.write_encoded(settings)
    }

    /// Whether any chunk the registry has a codec for is still held raw.
    fn has_pending_chunks(&self) -> bool {
        let pending = |c: &Chunk| !c.is_discovered() && self.registry.chunk(c.id()).is_some();
        self.header_chunks.iter().any(pending)
            || self
                .arena
                .iter()
                .any(|(_, node)| node.chunks().iter().any(pending))
    }

    fn write_encoded(&self, settings: &WriteSettings) -> Result<Vec<u8>> {
        let registry: &Registry = &self.registry;
        let remap = settings.get_remap();

        let (body, num_nodes) = match &self.body {
            Body::Unread => return Err(Error::BodyNotParsed),
            Body::Raw { .. } => (None, self.header.num_nodes),
            Body::Parsed { rest, complete } => {
                let mut session = WriteSession::new(settings.get_id_mode());
                tracing::Span::current().record("session", tracing::field::display(session.id()));
                for external in &self.ref_table.nodes {
                    session.reserve(external.node_index);
                }
                let mut nw = NodeWriter::new(&mut session, &self.arena, registry, remap);
                for chunk in self.root_node()?.chunks() {
                    nw.write_chunk(chunk)?;
                }
                if *complete {
                    nw.write_u32(FACADE);
                }
                nw.write_bytes(rest);
                let body = nw.into_inner();
                // Indices inside an unparsed rest still count against the original node total.
                let num_nodes = if *complete {
                    session.num_nodes()
                } else {
                    self.header.num_nodes
                };
                (Some(body), num_nodes)
            }
        };

        let mut header_session = WriteSession::new(settings.get_id_mode());
        let header_chunks = {
            let mut hw = NodeWriter::new(&mut header_session, &self.arena, registry, remap);
            let mut chunks = Vec::with_capacity(self.header_chunks.len());
            for chunk in &self.header_chunks {
                let Chunk::Header(c) = chunk else {
                    return Err(Error::InvalidChunkPlacement(chunk.id()));
                };
                let payload = hw.payload_bytes(&c.payload)?;
                chunks.push((registry.remap_chunk_id(c.id, remap), c.heavy, payload));
            }
            chunks
        };

        let mut w = Writer::with_capacity(body.as_ref().map_or(0, Vec::len) + 64);
        let class_id = registry.remap_class_id(self.class_id(), remap);
        write_header(&mut w, &self.header, class_id, &header_chunks, num_nodes)?;
        self.ref_table.write(&mut w, self.header.version)?;

        let compressed = self.header.body_compression == CompressionMode::Compressed;
        match (body, &self.body) {
            (Some(body), _) if compressed => {
                let compressor = settings.get_compressor().ok_or(Error::MissingCompressor)?;
                let packed = compressor.compress(&body)?;
                w.write_len(body.len(), LengthPrefix::I32)?;
                w.write_byte_array(&packed, LengthPrefix::I32)?;
            }
            (Some(body), _) => w.write_bytes(&body),
            (None, Body::Raw { uncompressed_size, data }) => match uncompressed_size {
                Some(size) if compressed => {
                    w.write_i32(*size);
                    w.write_byte_array(data, LengthPrefix::I32)?;
                }
                None if !compressed => w.write_bytes(data),
                _ => {
                    return Err(Error::MalformedHeader(
                        "body compression flag doesn't match the stored body".into(),
                    ))
                }
            },
            (None, _) => return Err(Error::BodyNotParsed),
        }
        debug!(len = w.len(), num_nodes, "wrote document");
        Ok(w.into_inner())
    }

    pub fn write_to<W: Write>(&self, mut writer: W, settings: &WriteSettings) -> Result<()> {
        writer.write_all(&self.write(settings)?)?;
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>, settings: &WriteSettings) -> Result<()> {
        std::fs::write(path, self.write(settings)?)?;
        Ok(())
    }

    pub fn header(&self) -> &HeaderInfo {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut HeaderInfo {
        &mut self.header
    }

    pub fn header_chunks(&self) -> &[Chunk] {
        &self.header_chunks
    }

    /// Add a header chunk. Only [`Chunk::Header`] chunks belong here.
    pub fn push_header_chunk(&mut self, chunk: Chunk) -> Result<()> {
        match chunk {
            Chunk::Header(_) => {
                self.header_chunks.push(chunk);
                Ok(())
            }
            other => Err(Error::InvalidChunkPlacement(other.id())),
        }
    }

    /// The first decoded header chunk of type `T`.
    pub fn header_chunk<T: ChunkBody>(&self) -> Option<&T> {
        self.header_chunks.iter().find_map(|c| c.data::<T>())
    }

    pub fn ref_table(&self) -> &RefTable {
        &self.ref_table
    }

    /// Add an external node and return the placeholder standing in for it. Body references to
    /// the placeholder are written with the external node's index.
    pub fn add_external(&mut self, node: ExternalNode) -> NodeId {
        let id = self.arena.insert(Node::external(node.node_index));
        self.ref_table.nodes.push(node);
        id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    fn root_node(&self) -> Result<&Node> {
        self.arena.get(self.root).ok_or(Error::DanglingNode)
    }

    /// The root node's class id.
    pub fn class_id(&self) -> u32 {
        self.arena.get(self.root).map_or(0, Node::class_id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.arena.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.arena.get_mut(id)
    }

    pub fn insert_node(&mut self, node: Node) -> NodeId {
        self.arena.insert(node)
    }

    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Bytes after the root chunk stream, if the body was parsed.
    pub fn rest(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Parsed { rest, .. } => Some(rest),
            _ => None,
        }
    }

    /// False if the body wasn't parsed, or parsing stopped before the root's terminator.
    pub fn is_body_complete(&self) -> bool {
        matches!(self.body, Body::Parsed { complete: true, .. })
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Decode a skippable chunk that was kept raw. Returns whether the chunk is now decoded.
    /// Failures don't return an error: the chunk stays raw and a diagnostic is recorded.
    pub fn discover_chunk(&mut self, node: NodeId, chunk_id: u32) -> Result<bool> {
        let index = self
            .arena
            .get(node)
            .ok_or(Error::DanglingNode)?
            .chunks()
            .iter()
            .position(|c| c.id() == chunk_id);
        match index {
            Some(i) => self.discover(ChunkSlot::Body(node, i)),
            None => Ok(false),
        }
    }

    pub fn discover_header_chunk(&mut self, chunk_id: u32) -> Result<bool> {
        match self.header_chunks.iter().position(|c| c.id() == chunk_id) {
            Some(i) => self.discover(ChunkSlot::Header(i)),
            None => Ok(false),
        }
    }

    /// Decode every raw chunk the registry has a codec for. Returns how many were decoded.
    pub fn discover_all(&mut self) -> Result<usize> {
        let mut slots: Vec<ChunkSlot> = (0..self.header_chunks.len())
            .filter(|&i| !self.header_chunks[i].is_discovered())
            .map(ChunkSlot::Header)
            .collect();
        for (id, node) in self.arena.iter() {
            slots.extend(
                node.chunks()
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| !c.is_discovered())
                    .map(|(i, _)| ChunkSlot::Body(id, i)),
            );
        }
        let mut found = 0;
        for slot in slots {
            if self.discover(slot)? {
                found += 1;
            }
        }
        Ok(found)
    }

    fn discover(&mut self, slot: ChunkSlot) -> Result<bool> {
        let registry = Arc::clone(&self.registry);
        let (id, raw, mut session) = {
            let (chunk, ctx, kind) = match slot {
                ChunkSlot::Header(i) => {
                    (self.header_chunks.get(i), &self.header_discovery, ChunkKind::Header)
                }
                ChunkSlot::Body(node, i) => (
                    self.arena.get(node).ok_or(Error::DanglingNode)?.chunks().get(i),
                    &self.discovery,
                    ChunkKind::Skippable,
                ),
            };
            let Some(chunk) = chunk else {
                return Ok(false);
            };
            let raw = match chunk.payload() {
                Some(Payload::Raw(raw)) => raw.clone(),
                _ => return Ok(chunk.is_discovered()),
            };
            match registry.chunk(chunk.id()) {
                Some(d) if d.kind() == kind => {}
                _ => return Ok(false),
            }
            (
                chunk.id(),
                raw,
                ReadSession::for_discovery(ctx, chunk.mark()),
            )
        };
        let Some(descriptor) = registry.chunk(id) else {
            return Ok(false);
        };

        trace!(chunk = descriptor.name(), id = %Hex(id), "discovering chunk");
        let payload = NodeReader::new(Reader::new(&[]), &mut session, &mut self.arena, &registry)
            .decode_payload(descriptor, raw, 0);
        self.diagnostics.extend(session.take_diagnostics());
        let decoded = payload.is_decoded();

        let chunk = match slot {
            ChunkSlot::Header(i) => self.header_chunks.get_mut(i),
            ChunkSlot::Body(node, i) => self
                .arena
                .get_mut(node)
                .and_then(|n| n.chunks_mut().get_mut(i)),
        };
        if let Some(target) = chunk.and_then(Chunk::payload_mut) {
            *target = payload;
        }
        Ok(decoded)
    }
}

/// `uncompressed_size:i32  compressed_size:i32  bytes`
fn read_compressed_frame<'a>(r: &mut Reader<'a>) -> Result<(i32, &'a [u8])> {
    let offset = r.offset();
    let size = r.read_i32()?;
    if size < 0 {
        return Err(Error::InvalidLength {
            offset,
            length: size as i64,
        });
    }
    let packed = r.read_byte_array(LengthPrefix::I32)?;
    Ok((size, packed))
}

/// Parse the root chunk stream. External placeholders go into the arena first, right after the
/// root.
fn parse_body(
    body: &[u8],
    registry: &Registry,
    arena: &mut NodeArena,
    root: NodeId,
    ref_table: &RefTable,
    settings: &ReadSettings,
) -> Result<(ReadSession, Body)> {
    let mut session = ReadSession::new();
    tracing::Span::current().record("session", tracing::field::display(session.id()));
    session.set_cancel(settings.get_cancel().cloned());
    for external in &ref_table.nodes {
        let id = arena.insert(Node::external(external.node_index));
        session.insert_aux(external.node_index, id);
    }

    let mut chunks = Vec::new();
    let mut truncated = None;
    let rest = {
        let mut nr = NodeReader::new(Reader::new(body), &mut session, arena, registry);
        loop {
            nr.session().check_cancelled()?;
            let start = nr.position();
            let checkpoint = nr.checkpoint();
            match nr.read_chunk() {
                Ok(Some(chunk)) => {
                    settings.report(Stage::BodyChunk, nr.position(), body.len(), Some(chunk.id()));
                    chunks.push(chunk);
                }
                Ok(None) => break nr.read_to_end().to_vec(),
                Err(err) => {
                    let chunk_id = match err.root_cause() {
                        Error::UnknownChunk { chunk_id, .. } => *chunk_id,
                        _ => return Err(err),
                    };
                    nr.rollback(&checkpoint);
                    nr.seek(start)?;
                    let rest = nr.read_to_end().to_vec();
                    truncated = Some(Diagnostic::TruncatedBody {
                        chunk_id,
                        offset: start,
                        rest_len: rest.len(),
                    });
                    break rest;
                }
            }
        }
    };

    let complete = truncated.is_none();
    if let Some(diagnostic) = truncated {
        session.diagnose(diagnostic);
    }
    arena
        .get_mut(root)
        .ok_or(Error::DanglingNode)?
        .set_chunks(chunks);
    Ok((session, Body::Parsed { rest, complete }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::ZstdCompressor;
    use crate::deferred::CancelToken;
    use crate::lookback::{Ident, IdWriteMode};
    use crate::ref_table::ExternalFile;
    use crate::registry::IdRemap;
    use crate::settings::Progress;
    use crate::test_support::{
        self, Block, BlockList, ChallengeParams, GhostSamples, MapDesc, MapInfo, MapName,
        Thumbnail, BLOCK, GHOST, MAP, SAMPLE_STRIDE,
    };
    use crate::types::PackedTransform;
    use parking_lot::Mutex;

    fn registry() -> Arc<Registry> {
        Arc::new(test_support::registry())
    }

    fn block(name: &str, variant: u32) -> Node {
        Node::new(BLOCK).with_chunk(Chunk::ordinary(
            BLOCK | 1,
            Block {
                name: name.into(),
                variant,
            },
        ))
    }

    /// A map with one of each chunk kind and two blocks, one of them referenced twice.
    fn sample_map() -> Document {
        let mut doc = Document::new(MAP, registry());
        doc.header_mut().body_compression = CompressionMode::Uncompressed;
        doc.push_header_chunk(Chunk::header(
            0x0304_3003,
            MapDesc {
                version: 13,
                ident: Ident {
                    name: "A01".into(),
                    collection: "Stadium".into(),
                    author: "Nadeo".into(),
                },
            },
            false,
        ))
        .unwrap();
        let first = doc.insert_node(block("StadiumRoadMain", 0));
        let second = doc.insert_node(block("StadiumRoadMain", 2));
        let root = doc.root();
        let chunks = doc.node_mut(root).unwrap().chunks_mut();
        chunks.push(Chunk::ordinary(
            0x0304_3002,
            MapInfo {
                version: 3,
                laps: 1,
                author_time: 24_000,
                gold_time: Some(26_000),
            },
        ));
        chunks.push(Chunk::skippable(0x0304_3018, MapName("A01".into())));
        chunks.push(Chunk::ordinary(0x0304_3011, ChallengeParams { parent: None }));
        chunks.push(Chunk::ordinary(
            0x0304_3040,
            BlockList {
                blocks: vec![Some(first), Some(second), Some(first), None],
            },
        ));
        chunks.push(Chunk::skippable(
            0x0304_301F,
            Thumbnail {
                jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
            },
        ));
        doc
    }

    fn read(data: &[u8]) -> Document {
        Document::read(data, registry(), &ReadSettings::default()).unwrap()
    }

    #[test]
    fn round_trip() {
        let doc = sample_map();
        let data = doc.write(&WriteSettings::default()).unwrap();
        let mut back = read(&data);
        assert!(back.diagnostics().is_empty());
        assert!(back.is_body_complete());
        assert_eq!(back.class_id(), MAP);
        // Root plus two distinct blocks.
        assert_eq!(back.header().num_nodes, 3);
        assert_eq!(back.arena().len(), 3);
        assert_eq!(
            back.header_chunk::<MapDesc>(),
            doc.header_chunk::<MapDesc>()
        );

        // The thumbnail is lazy and stays raw until asked for.
        let root = back.root();
        assert!(!back.node(root).unwrap().chunk(0x0304_301F).unwrap().is_discovered());
        assert_ne!(back.arena(), doc.arena());
        assert!(back.discover_chunk(root, 0x0304_301F).unwrap());
        assert_eq!(back.arena(), doc.arena());
        assert_eq!(back.header_chunks(), doc.header_chunks());

        // Writing the decoded document again reproduces the file.
        assert_eq!(back.write(&WriteSettings::default()).unwrap(), data);
    }

    #[test]
    fn shared_references_are_one_node() {
        let data = sample_map().write(&WriteSettings::default()).unwrap();
        let back = read(&data);
        let list = back.node(back.root()).unwrap().get::<BlockList>().unwrap();
        assert_eq!(list.blocks[0], list.blocks[2]);
        assert_ne!(list.blocks[0], list.blocks[1]);
        assert_eq!(list.blocks[3], None);
        let second = back.node(list.blocks[1].unwrap()).unwrap();
        assert_eq!(second.get::<Block>().unwrap().variant, 2);
    }

    #[test]
    fn reused_ids_shrink_the_body() {
        let doc = sample_map();
        let literal = doc.write(&WriteSettings::default()).unwrap();
        let reused = doc
            .write(&WriteSettings::new().id_mode(IdWriteMode::ReuseExisting))
            .unwrap();
        assert!(reused.len() < literal.len());
        let mut back = read(&reused);
        back.discover_all().unwrap();
        assert_eq!(back.arena(), doc.arena());
    }

    #[test]
    fn compressed_body() {
        let mut doc = sample_map();
        doc.header_mut().body_compression = CompressionMode::Compressed;
        let zstd: Arc<dyn crate::compress::Compressor> = Arc::new(ZstdCompressor::default());

        assert!(matches!(
            doc.write(&WriteSettings::default()),
            Err(Error::MissingCompressor)
        ));
        let data = doc
            .write(&WriteSettings::new().compressor(Arc::clone(&zstd)))
            .unwrap();

        assert!(matches!(
            Document::read(&data, registry(), &ReadSettings::default()),
            Err(Error::MissingCompressor)
        ));
        let settings = ReadSettings::new().compressor(zstd);
        let mut back = Document::read(&data, registry(), &settings).unwrap();
        back.discover_all().unwrap();
        assert_eq!(back.arena(), doc.arena());
    }

    #[test]
    fn raw_and_skipped_bodies() {
        let mut doc = sample_map();
        doc.header_mut().body_compression = CompressionMode::Compressed;
        let write = WriteSettings::new().compressor(Arc::new(ZstdCompressor::default()));
        let data = doc.write(&write).unwrap();

        // No compressor needed to carry the body through untouched.
        let settings = ReadSettings::new().body_mode(BodyMode::KeepRaw);
        let raw = Document::read(&data, registry(), &settings).unwrap();
        assert!(matches!(
            raw.body(),
            Body::Raw {
                uncompressed_size: Some(_),
                ..
            }
        ));
        assert!(!raw.is_body_complete());
        assert_eq!(raw.write(&WriteSettings::default()).unwrap(), data);

        let settings = ReadSettings::new().body_mode(BodyMode::Skip);
        let skipped = Document::read(&data, registry(), &settings).unwrap();
        assert!(skipped.header_chunk::<MapDesc>().is_some());
        assert_eq!(skipped.arena().len(), 1);
        assert!(matches!(
            skipped.write(&write),
            Err(Error::BodyNotParsed)
        ));
    }

    #[test]
    fn unknown_skippable_chunks_pass_through() {
        let mut doc = Document::new(MAP, registry());
        doc.header_mut().body_compression = CompressionMode::Uncompressed;
        let root = doc.root();
        doc.node_mut(root)
            .unwrap()
            .push(Chunk::skippable_raw(0x0304_3099, vec![9, 8, 7, 6, 5]));
        doc.push_header_chunk(Chunk::header_raw(0x0304_30F0, vec![1, 2, 3], true))
            .unwrap();
        let data = doc.write(&WriteSettings::default()).unwrap();

        let back = read(&data);
        assert_eq!(back.arena(), doc.arena());
        assert_eq!(back.header_chunks(), doc.header_chunks());
        assert_eq!(back.write(&WriteSettings::default()).unwrap(), data);
    }

    #[test]
    fn heavy_flag_survives() {
        let mut doc = sample_map();
        doc.push_header_chunk(Chunk::header_raw(0x0304_3005, vec![0; 8], true))
            .unwrap();
        let back = read(&doc.write(&WriteSettings::default()).unwrap());
        match &back.header_chunks()[1] {
            Chunk::Header(c) => assert!(c.heavy),
            other => panic!("expected a header chunk, got {other:?}"),
        }
        match &back.header_chunks()[0] {
            Chunk::Header(c) => assert!(!c.heavy),
            other => panic!("expected a header chunk, got {other:?}"),
        }
    }

    #[test]
    fn unknown_ordinary_chunk_truncates_the_body() {
        // Body = MapInfo, an unknown ordinary chunk, the terminator, trailing bytes.
        let mut empty = Document::new(MAP, registry());
        empty.header_mut().body_compression = CompressionMode::Uncompressed;
        let empty_file = empty.write(&WriteSettings::default()).unwrap();
        let prefix = &empty_file[..empty_file.len() - 4];

        let mut with_info = empty.clone();
        let root = with_info.root();
        with_info
            .node_mut(root)
            .unwrap()
            .push(Chunk::ordinary(0x0304_3002, MapInfo::default()));
        let info_file = with_info.write(&WriteSettings::default()).unwrap();
        let info_chunk = &info_file[prefix.len()..info_file.len() - 4];

        let mut data = prefix.to_vec();
        data.extend_from_slice(info_chunk);
        let unknown_at = data.len() - prefix.len();
        data.extend_from_slice(&0x0304_3077u32.to_le_bytes());
        data.extend_from_slice(&[0xAB; 6]);
        data.extend_from_slice(&FACADE.to_le_bytes());
        data.extend_from_slice(&[1, 2]);

        let back = read(&data);
        assert!(!back.is_body_complete());
        assert_eq!(back.node(back.root()).unwrap().chunks().len(), 1);
        assert_eq!(back.rest().unwrap().len(), 4 + 6 + 4 + 2);
        assert_eq!(
            back.diagnostics(),
            &[Diagnostic::TruncatedBody {
                chunk_id: 0x0304_3077,
                offset: unknown_at,
                rest_len: 16,
            }]
        );
        assert_eq!(back.write(&WriteSettings::default()).unwrap(), data);
    }

    #[test]
    fn deep_node_chains_are_rejected() {
        let mut empty = Document::new(MAP, registry());
        empty.header_mut().body_compression = CompressionMode::Uncompressed;
        let empty_file = empty.write(&WriteSettings::default()).unwrap();
        let mut data = empty_file[..empty_file.len() - 4].to_vec();
        data.extend_from_slice(&0x0304_3011u32.to_le_bytes());
        for i in 1..=20_000i32 {
            data.extend_from_slice(&i.to_le_bytes());
            data.extend_from_slice(&MAP.to_le_bytes());
            data.extend_from_slice(&0x0304_3011u32.to_le_bytes());
        }
        let err = Document::read(&data, registry(), &ReadSettings::default()).unwrap_err();
        assert!(matches!(err.root_cause(), Error::ParseLimit(_)), "{err}");
    }

    #[test]
    fn deferred_chunks_are_reencoded_on_write() {
        let mut doc = Document::new(MAP, registry());
        doc.header_mut().body_compression = CompressionMode::Uncompressed;
        let root = doc.root();
        let node = doc.node_mut(root).unwrap();
        for name in ["A", "A", "B"] {
            node.push(Chunk::skippable(0x0304_3018, MapName(name.into())));
        }
        node.push(Chunk::skippable(0x0304_3019, MapName("B".into())));

        let reused = doc
            .write(&WriteSettings::new().id_mode(IdWriteMode::ReuseExisting))
            .unwrap();
        let back = read(&reused);
        let lazy = back.node(back.root()).unwrap().chunk(0x0304_3019).unwrap();
        assert!(!lazy.is_discovered());
        assert!(matches!(
            lazy.payload(),
            Some(Payload::Raw(raw)) if raw[..] == 0x4000_0002u32.to_le_bytes()
        ));

        // Literal Ids shift every later table index, so the raw back-reference can't be copied.
        let literal = back.write(&WriteSettings::default()).unwrap();
        let mut again = read(&literal);
        again.discover_all().unwrap();
        let lazy = again.node(again.root()).unwrap().chunk(0x0304_3019).unwrap();
        assert_eq!(lazy.data::<MapName>(), Some(&MapName("B".into())));
        assert_eq!(again.arena(), doc.arena());
    }

    #[test]
    fn trailing_bytes_after_terminator_are_kept() {
        let mut doc = Document::new(MAP, registry());
        doc.header_mut().body_compression = CompressionMode::Uncompressed;
        if let Body::Parsed { rest, .. } = &mut doc.body {
            rest.extend_from_slice(b"tail");
        }
        let data = doc.write(&WriteSettings::default()).unwrap();
        assert!(data.ends_with(b"tail"));
        let back = read(&data);
        assert!(back.is_body_complete());
        assert_eq!(back.rest(), Some(&b"tail"[..]));
    }

    #[test]
    fn external_references() {
        let mut doc = Document::new(MAP, registry());
        doc.header_mut().body_compression = CompressionMode::Uncompressed;
        let external = doc.add_external(ExternalNode {
            flags: 0,
            file: ExternalFile::Name {
                file_name: "Road.Block.Gbx".into(),
                folder_index: 0,
            },
            node_index: 0,
            use_file: Some(true),
        });
        let inline = doc.insert_node(block("Pillar", 1));
        let root = doc.root();
        doc.node_mut(root).unwrap().push(Chunk::ordinary(
            0x0304_3040,
            BlockList {
                blocks: vec![Some(external), Some(inline), Some(external)],
            },
        ));
        let data = doc.write(&WriteSettings::default()).unwrap();

        let back = read(&data);
        assert_eq!(back.ref_table(), doc.ref_table());
        assert_eq!(back.arena(), doc.arena());
        // The inline block skips the slot the external node holds.
        assert_eq!(back.header().num_nodes, 3);
        let list = back.node(root).unwrap().get::<BlockList>().unwrap();
        assert_eq!(back.node(list.blocks[0].unwrap()).unwrap().external_slot(), Some(0));
    }

    #[test]
    fn legacy_class_ids() {
        let doc = sample_map();
        let data = doc
            .write(&WriteSettings::new().remap(IdRemap::Legacy))
            .unwrap();
        assert_eq!(&data[9..13], &0x2400_3000u32.to_le_bytes());
        let mut back = read(&data);
        assert_eq!(back.class_id(), MAP);
        back.discover_all().unwrap();
        assert_eq!(back.arena(), doc.arena());
    }

    #[test]
    fn cancellation() {
        let data = sample_map().write(&WriteSettings::default()).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let settings = ReadSettings::new().cancel(token.clone());
        assert!(matches!(
            Document::read(&data, registry(), &settings),
            Err(Error::Cancelled)
        ));

        match Document::spawn_read(data.clone(), registry(), settings).wait() {
            Err(Error::Deferred { message, .. }) => assert!(message.contains("cancelled")),
            other => panic!("expected a cancelled read, got {other:?}"),
        }

        let job = Document::spawn_read(data, registry(), ReadSettings::default());
        let doc = futures_executor::block_on(job).unwrap();
        assert_eq!(doc.class_id(), MAP);
    }

    fn ghost_document(block: Vec<u8>) -> Vec<u8> {
        let mut doc = Document::new(GHOST, registry());
        doc.header_mut().body_compression = CompressionMode::Uncompressed;
        let root = doc.root();
        doc.node_mut(root).unwrap().push(Chunk::skippable(
            GHOST | 5,
            GhostSamples {
                stride: SAMPLE_STRIDE,
                block,
                samples: Arc::new(Deferred::ready("built", Vec::new())),
            },
        ));
        doc.write(&WriteSettings::default()).unwrap()
    }

    fn sample_record(millis: i32) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_i32(millis);
        w.write_packed_transform(&PackedTransform::default());
        w.into_inner()
    }

    #[test]
    fn samples_decode_in_the_background() {
        let block = [sample_record(0), sample_record(50), sample_record(100)].concat();
        let doc = read(&ghost_document(block));
        let ghost = doc.node(doc.root()).unwrap().get::<GhostSamples>().unwrap();
        let samples = ghost.samples.wait().unwrap();
        assert_eq!(samples.len(), 3);
        assert!((samples[1].time.as_millis_f64() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn failed_sample_decoding_leaves_the_read_intact() {
        let mut block = [sample_record(0), sample_record(50)].concat();
        block.pop();
        let doc = read(&ghost_document(block));
        assert!(doc.diagnostics().is_empty());
        let ghost = doc.node(doc.root()).unwrap().get::<GhostSamples>().unwrap();
        assert!(matches!(ghost.samples.wait(), Err(Error::Deferred { .. })));
    }

    #[test]
    fn progress_reports() {
        let stages = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&stages);
        let settings =
            ReadSettings::new().progress(Arc::new(move |p: Progress| sink.lock().push(p.stage)));
        let data = sample_map().write(&WriteSettings::default()).unwrap();
        Document::read(&data, registry(), &settings).unwrap();
        let stages = stages.lock();
        assert_eq!(stages.first(), Some(&Stage::Header));
        assert_eq!(stages.last(), Some(&Stage::Body));
        assert_eq!(stages.iter().filter(|s| **s == Stage::HeaderChunk).count(), 1);
        assert_eq!(stages.iter().filter(|s| **s == Stage::BodyChunk).count(), 5);
    }

    #[test]
    fn misplaced_chunks() {
        let mut doc = sample_map();
        assert!(matches!(
            doc.push_header_chunk(Chunk::skippable_raw(0x0304_3099, vec![])),
            Err(Error::InvalidChunkPlacement(0x0304_3099))
        ));
        let root = doc.root();
        doc.node_mut(root)
            .unwrap()
            .push(Chunk::header_raw(0x0304_3003, vec![], false));
        assert!(matches!(
            doc.write(&WriteSettings::default()),
            Err(Error::InvalidChunkPlacement(0x0304_3003))
        ));
    }

    #[test]
    fn metadata_serializes() {
        let doc = read(&sample_map().write(&WriteSettings::default()).unwrap());
        let header = serde_json::to_value(doc.header()).unwrap();
        assert_eq!(header["version"], 6);
        assert_eq!(header["body_compression"], "Uncompressed");
        let table = serde_json::to_string(doc.ref_table()).unwrap();
        assert!(table.contains("ancestor_level"));
    }
}
