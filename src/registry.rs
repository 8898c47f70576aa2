//! The class and chunk catalog.
//!
//! Concrete node layouts live outside this crate. Callers describe them once, up front, with a
//! [`RegistryBuilder`]: each class gets an id, an optional parent, and a table of chunk codecs.
//! The built [`Registry`] is read-only and can be shared between threads behind an `Arc`.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::chunk::{NodeReader, NodeWriter};
use crate::error::Result;
use crate::node::{class_of, local_of};

/// A chunk layout: how to read it from and write it to a node's chunk stream.
///
/// Versioned chunks read their version first (see [`NodeReader::read_version`]) and gate later
/// fields on it. Each version may only add fields to the one below it.
pub trait ChunkBody: Any + Clone + PartialEq + fmt::Debug + Send + Sync {
    fn read(r: &mut NodeReader<'_, '_>) -> Result<Self>;
    fn write(&self, w: &mut NodeWriter<'_>) -> Result<()>;
}

/// Object-safe face of [`ChunkBody`], implemented for every chunk body.
pub trait DynChunk: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn clone_box(&self) -> Box<dyn DynChunk>;
    fn eq_dyn(&self, other: &dyn DynChunk) -> bool;
    fn write_dyn(&self, w: &mut NodeWriter<'_>) -> Result<()>;
}

impl<T: ChunkBody> DynChunk for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_box(&self) -> Box<dyn DynChunk> {
        Box::new(self.clone())
    }

    fn eq_dyn(&self, other: &dyn DynChunk) -> bool {
        other.as_any().downcast_ref::<T>() == Some(self)
    }

    fn write_dyn(&self, w: &mut NodeWriter<'_>) -> Result<()> {
        self.write(w)
    }
}

impl Clone for Box<dyn DynChunk> {
    fn clone(&self) -> Self {
        (**self).clone_box()
    }
}

impl PartialEq for Box<dyn DynChunk> {
    fn eq(&self, other: &Self) -> bool {
        (**self).eq_dyn(&**other)
    }
}

/// Decodes one chunk body into its boxed form.
pub type DecodeFn = fn(&mut NodeReader<'_, '_>) -> Result<Box<dyn DynChunk>>;

fn decode_as<T: ChunkBody>(r: &mut NodeReader<'_, '_>) -> Result<Box<dyn DynChunk>> {
    Ok(Box::new(T::read(r)?))
}

/// How a chunk is framed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkKind {
    /// No size prefix. Must be known to be read at all.
    Ordinary,
    /// Size prefixed behind the `PIKS` marker, so it can be kept raw.
    Skippable,
    /// Lives in the header's user data.
    Header,
}

#[derive(Clone)]
pub struct ChunkDescriptor {
    id: u32,
    name: &'static str,
    kind: ChunkKind,
    lazy: bool,
    decode: DecodeFn,
}

impl ChunkDescriptor {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> ChunkKind {
        self.kind
    }

    /// Lazy chunks are kept raw at read time and decoded on demand.
    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn decode(&self, r: &mut NodeReader<'_, '_>) -> Result<Box<dyn DynChunk>> {
        (self.decode)(r)
    }
}

impl fmt::Debug for ChunkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkDescriptor")
            .field("id", &format_args!("{:#010x}", self.id))
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("lazy", &self.lazy)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct ClassDescriptor {
    id: u32,
    name: &'static str,
    parent: Option<u32>,
    chunks: BTreeMap<u32, ChunkDescriptor>,
}

impl ClassDescriptor {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn parent(&self) -> Option<u32> {
        self.parent
    }

    pub fn chunks(&self) -> impl Iterator<Item = &ChunkDescriptor> {
        self.chunks.values()
    }
}

/// Which class ids a writer emits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdRemap {
    /// Current class ids. Reads always produce these.
    #[default]
    Latest,
    /// The older equivalents, for tools that predate the renumbering.
    Legacy,
}

/// Legacy class ids and their current equivalents.
const BUILTIN_ALIASES: &[(u32, u32)] = &[(0x2400_3000, 0x0304_3000), (0x2401_B000, 0x0309_3000)];

// Guards against parent loops in a badly built registry.
const MAX_CLASS_DEPTH: usize = 64;

#[derive(Clone, Debug)]
pub struct Registry {
    classes: HashMap<u32, ClassDescriptor>,
    to_latest: HashMap<u32, u32>,
    to_legacy: HashMap<u32, u32>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn class(&self, class_id: u32) -> Option<&ClassDescriptor> {
        self.classes.get(&class_id)
    }

    pub fn is_known(&self, class_id: u32) -> bool {
        self.classes.contains_key(&class_id)
    }

    /// Name of a class for log output.
    pub fn class_name(&self, class_id: u32) -> &'static str {
        self.class(class_id).map_or("unknown class", |c| c.name)
    }

    /// Look a chunk up under the class its id belongs to. Chunks inherited from a parent class
    /// carry the parent's class bits, so this needs no hierarchy walk.
    pub fn chunk(&self, chunk_id: u32) -> Option<&ChunkDescriptor> {
        self.classes.get(&class_of(chunk_id))?.chunks.get(&chunk_id)
    }

    /// Whether `class_id` is `ancestor` or derives from it.
    pub fn is_a(&self, class_id: u32, ancestor: u32) -> bool {
        let mut current = Some(class_id);
        for _ in 0..MAX_CLASS_DEPTH {
            match current {
                Some(c) if c == ancestor => return true,
                Some(c) => current = self.classes.get(&c).and_then(|d| d.parent),
                None => return false,
            }
        }
        false
    }

    pub fn latest_class_id(&self, class_id: u32) -> u32 {
        self.to_latest.get(&class_id).copied().unwrap_or(class_id)
    }

    pub fn latest_chunk_id(&self, chunk_id: u32) -> u32 {
        self.latest_class_id(class_of(chunk_id)) | local_of(chunk_id)
    }

    pub fn remap_class_id(&self, class_id: u32, remap: IdRemap) -> u32 {
        match remap {
            IdRemap::Latest => class_id,
            IdRemap::Legacy => self.to_legacy.get(&class_id).copied().unwrap_or(class_id),
        }
    }

    pub fn remap_chunk_id(&self, chunk_id: u32, remap: IdRemap) -> u32 {
        self.remap_class_id(class_of(chunk_id), remap) | local_of(chunk_id)
    }
}

impl Default for Registry {
    fn default() -> Self {
        RegistryBuilder::new().build()
    }
}

/// Builds a [`Registry`]. Chunks are filed under the class their id belongs to; registering a
/// chunk for a class that hasn't been declared declares it with a placeholder name.
#[derive(Debug)]
pub struct RegistryBuilder {
    classes: HashMap<u32, ClassDescriptor>,
    aliases: Vec<(u32, u32)>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            classes: HashMap::new(),
            aliases: BUILTIN_ALIASES.to_vec(),
        }
    }

    fn declare(&mut self, id: u32, name: &'static str, parent: Option<u32>) {
        let class = self.classes.entry(id).or_insert_with(|| ClassDescriptor {
            id,
            name,
            parent,
            chunks: BTreeMap::new(),
        });
        class.name = name;
        class.parent = parent;
    }

    pub fn class(mut self, id: u32, name: &'static str) -> Self {
        self.declare(id, name, None);
        self
    }

    pub fn subclass(mut self, id: u32, name: &'static str, parent: u32) -> Self {
        self.declare(id, name, Some(parent));
        self
    }

    fn add<T: ChunkBody>(mut self, id: u32, name: &'static str, kind: ChunkKind, lazy: bool) -> Self {
        let class_id = class_of(id);
        let class = self
            .classes
            .entry(class_id)
            .or_insert_with(|| ClassDescriptor {
                id: class_id,
                name: "unnamed class",
                parent: None,
                chunks: BTreeMap::new(),
            });
        class.chunks.insert(
            id,
            ChunkDescriptor {
                id,
                name,
                kind,
                lazy,
                decode: decode_as::<T>,
            },
        );
        self
    }

    pub fn chunk<T: ChunkBody>(self, id: u32, name: &'static str) -> Self {
        self.add::<T>(id, name, ChunkKind::Ordinary, false)
    }

    pub fn skippable<T: ChunkBody>(self, id: u32, name: &'static str) -> Self {
        self.add::<T>(id, name, ChunkKind::Skippable, false)
    }

    /// A skippable chunk that stays raw until explicitly discovered. Its codec should not read
    /// Ids or node references introduced elsewhere after it, since those are decoded against the
    /// state at the chunk's position.
    pub fn lazy<T: ChunkBody>(self, id: u32, name: &'static str) -> Self {
        self.add::<T>(id, name, ChunkKind::Skippable, true)
    }

    pub fn header<T: ChunkBody>(self, id: u32, name: &'static str) -> Self {
        self.add::<T>(id, name, ChunkKind::Header, false)
    }

    /// Map a legacy class id onto its current one.
    pub fn alias(mut self, legacy: u32, latest: u32) -> Self {
        self.aliases.push((legacy, latest));
        self
    }

    pub fn build(self) -> Registry {
        let mut to_latest = HashMap::new();
        let mut to_legacy = HashMap::new();
        for (legacy, latest) in self.aliases {
            to_latest.insert(legacy, latest);
            to_legacy.entry(latest).or_insert(legacy);
        }
        tracing::debug!(
            classes = self.classes.len(),
            aliases = to_latest.len(),
            "chunk registry built"
        );
        Registry {
            classes: self.classes,
            to_latest,
            to_legacy,
        }
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
