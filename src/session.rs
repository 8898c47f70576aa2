//! Per-operation state: the lookback table and the auxiliary node table.
//!
//! A session lives for exactly one read or one write. Nothing here is global except the counter
//! that hands out [`SessionId`]s, so independent files can be processed on independent threads.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::deferred::CancelToken;
use crate::error::{Diagnostic, Error, Result};
use crate::lookback::{IdWriteMode, LookbackMark, LookbackTable, LookbackWriter};
use crate::node::NodeId;
use crate::MAX_DEPTH;

/// Identifies one read or write operation in log output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything needed to roll a read session back to an earlier point.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Checkpoint {
    pub lookback: LookbackMark,
    pub aux_len: usize,
    pub diagnostics: usize,
    pub arena_len: usize,
}

/// State shared by every chunk read in one parse.
#[derive(Debug)]
pub struct ReadSession {
    id: SessionId,
    pub(crate) lookback: LookbackTable,
    /// Slot (wire index minus one) to node. A slot is only present once populated.
    aux: BTreeMap<i32, NodeId>,
    /// Slots in the order they were populated.
    aux_order: Vec<i32>,
    diagnostics: Vec<Diagnostic>,
    cancel: Option<CancelToken>,
    /// Inline node definitions currently open.
    depth: usize,
}

impl ReadSession {
    pub fn new() -> Self {
        Self::with_lookback(LookbackTable::new())
    }

    pub(crate) fn with_lookback(lookback: LookbackTable) -> Self {
        Self {
            id: SessionId::next(),
            lookback,
            aux: BTreeMap::new(),
            aux_order: Vec::new(),
            diagnostics: Vec::new(),
            cancel: None,
            depth: 0,
        }
    }

    /// A session for decoding a deferred chunk after the main parse finished.
    pub(crate) fn for_discovery(ctx: &DiscoveryContext, mark: LookbackMark) -> Self {
        let mut session = Self::with_lookback(LookbackTable::at_mark(mark, &ctx.strings));
        for (&slot, &node) in &ctx.aux {
            session.insert_aux(slot, node);
        }
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn lookback(&self) -> &LookbackTable {
        &self.lookback
    }

    pub(crate) fn set_cancel(&mut self, cancel: Option<CancelToken>) {
        self.cancel = cancel;
    }

    pub(crate) fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(cancel) => cancel.check(),
            None => Ok(()),
        }
    }

    pub(crate) fn enter_node(&mut self) -> Result<()> {
        enter(&mut self.depth)
    }

    pub(crate) fn leave_node(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn aux(&self, slot: i32) -> Option<NodeId> {
        self.aux.get(&slot).copied()
    }

    pub(crate) fn insert_aux(&mut self, slot: i32, node: NodeId) {
        if self.aux.insert(slot, node).is_none() {
            self.aux_order.push(slot);
        }
    }

    /// The most recently populated auxiliary slot.
    pub fn last_aux(&self) -> Option<NodeId> {
        self.aux_order.last().and_then(|slot| self.aux(*slot))
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub(crate) fn diagnose(&mut self, diagnostic: Diagnostic) {
        tracing::warn!(session = %self.id, "{}", diagnostic);
        self.diagnostics.push(diagnostic);
    }

    pub(crate) fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    pub(crate) fn checkpoint(&self, arena_len: usize) -> Checkpoint {
        Checkpoint {
            lookback: self.lookback.mark(),
            aux_len: self.aux_order.len(),
            diagnostics: self.diagnostics.len(),
            arena_len,
        }
    }

    /// Undo everything recorded since `checkpoint`. The caller truncates the arena.
    pub(crate) fn rollback(&mut self, checkpoint: &Checkpoint) {
        self.lookback.reset_to(checkpoint.lookback);
        for slot in self.aux_order.drain(checkpoint.aux_len..) {
            self.aux.remove(&slot);
        }
        self.diagnostics.truncate(checkpoint.diagnostics);
    }

    /// Snapshot what later discovery of deferred chunks needs.
    pub(crate) fn discovery_context(&self) -> DiscoveryContext {
        DiscoveryContext {
            strings: self.lookback.strings().to_vec(),
            aux: self.aux.clone(),
        }
    }
}

impl Default for ReadSession {
    fn default() -> Self {
        Self::new()
    }
}

/// The end-of-parse state deferred chunks are decoded against: the lookback strings (truncated to
/// each chunk's mark on use) and the final auxiliary node table.
#[derive(Clone, Debug, Default)]
pub struct DiscoveryContext {
    strings: Vec<String>,
    aux: BTreeMap<i32, NodeId>,
}

/// State shared by every chunk written in one serialization.
#[derive(Debug)]
pub struct WriteSession {
    id: SessionId,
    pub(crate) lookback: LookbackWriter,
    slots: HashMap<NodeId, i32>,
    next_slot: i32,
    /// Slots owned by external references, never handed to body nodes.
    reserved: BTreeSet<i32>,
    /// Reference emissions, counting repeats.
    emitted: usize,
    depth: usize,
}

impl WriteSession {
    pub fn new(mode: IdWriteMode) -> Self {
        Self {
            id: SessionId::next(),
            lookback: LookbackWriter::new(mode),
            slots: HashMap::new(),
            next_slot: 0,
            reserved: BTreeSet::new(),
            emitted: 0,
            depth: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn reserve(&mut self, slot: i32) {
        self.reserved.insert(slot);
    }

    pub fn slot_of(&self, node: NodeId) -> Option<i32> {
        self.slots.get(&node).copied()
    }

    /// Hand `node` the next free slot.
    pub(crate) fn assign(&mut self, node: NodeId) -> i32 {
        while self.reserved.contains(&self.next_slot) {
            self.next_slot += 1;
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        self.slots.insert(node, slot);
        slot
    }

    pub(crate) fn enter_node(&mut self) -> Result<()> {
        enter(&mut self.depth)
    }

    pub(crate) fn leave_node(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub(crate) fn count_emission(&mut self) {
        self.emitted += 1;
    }

    /// Number of node references written so far, repeats included.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Number of distinct body nodes that were given a slot.
    pub fn assigned(&self) -> usize {
        self.slots.len()
    }

    /// The header's node count: the root plus every slot in use.
    pub fn num_nodes(&self) -> i32 {
        let highest = self.reserved.iter().next_back().copied().unwrap_or(-1);
        highest.max(self.next_slot - 1) + 2
    }
}

fn enter(depth: &mut usize) -> Result<()> {
    if *depth >= MAX_DEPTH {
        return Err(Error::ParseLimit(format!(
            "node definitions nested more than {} deep",
            MAX_DEPTH
        )));
    }
    *depth += 1;
    Ok(())
}
