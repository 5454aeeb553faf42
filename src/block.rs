//! Translated basic blocks and the edges between them.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::policy::{ExecEnv, Policy};

/// Unique, monotonically assigned block id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Classification bits set while a block is visited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockFlags(u8);

impl BlockFlags {
    pub const ROOT: Self = Self(1 << 0);
    pub const FUNCTION_ENTRY: Self = Self(1 << 1);
    pub const FUNCTION_EXIT: Self = Self(1 << 2);
    pub const HOST: Self = Self(1 << 3);
    pub const HAS_INDIRECT_CTI: Self = Self(1 << 4);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for BlockFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// =============================================================================
// Edges
// =============================================================================

/// Direction and scope of a recorded control-flow edge.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// From a predecessor in the same function.
    IntraIncoming = 0,
    /// To a successor in the same function.
    IntraOutgoing = 1,
    /// From a caller.
    InterIncoming = 2,
    /// To a callee.
    InterOutgoing = 3,
}

impl EdgeKind {
    pub fn is_inter(&self) -> bool {
        matches!(self, EdgeKind::InterIncoming | EdgeKind::InterOutgoing)
    }

    pub fn is_incoming(&self) -> bool {
        matches!(self, EdgeKind::IntraIncoming | EdgeKind::InterIncoming)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// The block at the other end.
    pub block: BlockId,
    pub kind: EdgeKind,
}

/// Bounded edge list of one block.
///
/// Holds at most `slots` edges; `slots` doubles on demand up to `max`.
/// Edges that do not fit at `max` are counted and dropped.
#[derive(Debug)]
pub struct EdgeList {
    edges: Vec<Edge>,
    slots: usize,
    max: usize,
    dropped: usize,
}

impl EdgeList {
    pub fn new(slots: usize, max: usize) -> Self {
        let max = max.max(1);
        Self {
            edges: Vec::new(),
            slots: slots.clamp(1, max),
            max,
            dropped: 0,
        }
    }

    /// Record an edge if it is new and a slot is free. Returns true if the
    /// edge is now present.
    pub fn try_add(&mut self, block: BlockId, kind: EdgeKind) -> bool {
        if self.contains(block, kind) {
            return true;
        }
        if self.edges.len() >= self.slots {
            return false;
        }
        self.edges.push(Edge { block, kind });
        true
    }

    /// Double the slots (up to the cap) and record the edge.
    pub fn grow_and_add(&mut self, block: BlockId, kind: EdgeKind) -> bool {
        if self.try_add(block, kind) {
            return true;
        }
        if self.slots >= self.max {
            if self.dropped == 0 {
                warn!("edges: list full at {} slots, dropping edges", self.max);
            }
            self.dropped += 1;
            return false;
        }
        self.slots = (self.slots * 2).min(self.max);
        self.try_add(block, kind)
    }

    pub fn contains(&self, block: BlockId, kind: EdgeKind) -> bool {
        self.edges.iter().any(|e| e.block == block && e.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Edges lost because the list was at its cap.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

// =============================================================================
// Counters
// =============================================================================

/// Run-time counters of one block, updated by the event handlers.
#[derive(Debug, Default)]
pub struct BlockCounters {
    executions: AtomicU64,
    fall_throughs: AtomicU64,
    interrupts: AtomicU64,
    app_calls: AtomicU64,
    host_calls: AtomicU64,
    indirect_calls: AtomicU64,
    watched_accesses: AtomicU64,
    stale_accesses: AtomicU64,
}

impl BlockCounters {
    pub fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fall_through(&self) {
        self.fall_throughs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_app_call(&self) {
        self.app_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_host_call(&self) {
        self.host_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_indirect_call(&self) {
        self.indirect_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an access through a watched pointer; `stale` if its
    /// descriptor was no longer active.
    pub fn record_watched_access(&self, stale: bool) {
        self.watched_accesses.fetch_add(1, Ordering::Relaxed);
        if stale {
            self.stale_accesses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            executions: self.executions.load(Ordering::Relaxed),
            fall_throughs: self.fall_throughs.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            app_calls: self.app_calls.load(Ordering::Relaxed),
            host_calls: self.host_calls.load(Ordering::Relaxed),
            indirect_calls: self.indirect_calls.load(Ordering::Relaxed),
            watched_accesses: self.watched_accesses.load(Ordering::Relaxed),
            stale_accesses: self.stale_accesses.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.executions,
            &self.fall_throughs,
            &self.interrupts,
            &self.app_calls,
            &self.host_calls,
            &self.indirect_calls,
            &self.watched_accesses,
            &self.stale_accesses,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Immutable snapshot of [`BlockCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub executions: u64,
    pub fall_throughs: u64,
    pub interrupts: u64,
    pub app_calls: u64,
    pub host_calls: u64,
    pub indirect_calls: u64,
    pub watched_accesses: u64,
    pub stale_accesses: u64,
}

// =============================================================================
// Basic Block
// =============================================================================

/// State kept for every translated basic block.
pub struct BasicBlock {
    id: BlockId,
    native_pc: u64,
    cache_pc: AtomicU64,
    function_id: AtomicU32,
    policy: Policy,
    env: ExecEnv,
    flags: AtomicU8,
    translated_at_ns: u64,
    num_instructions: usize,
    memory_reads: AtomicU32,
    memory_writes: AtomicU32,
    counters: BlockCounters,
    edges: Mutex<EdgeList>,
}

impl BasicBlock {
    /// A fresh block. Its function id starts as its own id.
    pub fn new(
        id: BlockId,
        native_pc: u64,
        policy: Policy,
        env: ExecEnv,
        num_instructions: usize,
        edges: EdgeList,
    ) -> Self {
        Self {
            id,
            native_pc,
            cache_pc: AtomicU64::new(0),
            function_id: AtomicU32::new(id.0),
            policy,
            env,
            flags: AtomicU8::new(0),
            translated_at_ns: crate::platform::time_ns(),
            num_instructions,
            memory_reads: AtomicU32::new(0),
            memory_writes: AtomicU32::new(0),
            counters: BlockCounters::default(),
            edges: Mutex::new(edges),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn native_pc(&self) -> u64 {
        self.native_pc
    }

    /// Address of the translation in the code cache (0 until emitted).
    pub fn cache_pc(&self) -> u64 {
        self.cache_pc.load(Ordering::Acquire)
    }

    pub fn set_cache_pc(&self, pc: u64) {
        self.cache_pc.store(pc, Ordering::Release);
    }

    /// Id of the function this block belongs to.
    pub fn function_id(&self) -> u32 {
        self.function_id.load(Ordering::Relaxed)
    }

    pub fn set_function_id(&self, function_id: u32) {
        self.function_id.store(function_id, Ordering::Relaxed);
    }

    /// Policy the block was translated under.
    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn env(&self) -> ExecEnv {
        self.env
    }

    pub fn flags(&self) -> BlockFlags {
        BlockFlags(self.flags.load(Ordering::Relaxed))
    }

    pub fn mark(&self, flags: BlockFlags) {
        self.flags.fetch_or(flags.0, Ordering::Relaxed);
    }

    pub fn translated_at_ns(&self) -> u64 {
        self.translated_at_ns
    }

    pub fn num_instructions(&self) -> usize {
        self.num_instructions
    }

    /// Count one memory operand found while visiting.
    pub fn note_memory_op(&self, is_write: bool) {
        let counter = if is_write { &self.memory_writes } else { &self.memory_reads };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Static (reads, writes) memory operand counts.
    pub fn memory_ops(&self) -> (u32, u32) {
        (
            self.memory_reads.load(Ordering::Relaxed),
            self.memory_writes.load(Ordering::Relaxed),
        )
    }

    pub fn counters(&self) -> &BlockCounters {
        &self.counters
    }

    /// Record an edge if a slot is free.
    pub fn add_edge(&self, to: BlockId, kind: EdgeKind) -> bool {
        self.edges.lock().try_add(to, kind)
    }

    /// Record an edge, growing the list if needed.
    pub fn grow_and_add_edge(&self, to: BlockId, kind: EdgeKind) -> bool {
        self.edges.lock().grow_and_add(to, kind)
    }

    pub fn edge_slots(&self) -> usize {
        self.edges.lock().slots()
    }

    /// Copy of the current edges.
    pub fn edges(&self) -> Vec<Edge> {
        self.edges.lock().iter().copied().collect()
    }

    pub fn dropped_edges(&self) -> usize {
        self.edges.lock().dropped()
    }
}

impl fmt::Debug for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicBlock")
            .field("id", &self.id)
            .field("native_pc", &format_args!("{:#x}", self.native_pc))
            .field("policy", &self.policy)
            .field("flags", &self.flags())
            .finish()
    }
}

// =============================================================================
// Block List
// =============================================================================

struct Node {
    block: Arc<BasicBlock>,
    next: *mut Node,
}

/// Process-wide list of published blocks.
///
/// Lock-free push-only stack; nodes are freed when the list is dropped.
pub struct BlockList {
    head: AtomicPtr<Node>,
    len: AtomicUsize,
}

// SAFETY: nodes are immutable once linked and only freed through `&mut`.
unsafe impl Send for BlockList {}
unsafe impl Sync for BlockList {}

impl Default for BlockList {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockList {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    /// Push `block`. Everything written to the block beforehand is visible
    /// to whoever later walks the list.
    pub fn push(&self, block: Arc<BasicBlock>) {
        let node = Box::into_raw(Box::new(Node {
            block,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` is ours until the CAS publishes it.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(x) => head = x,
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Iterate newest first.
    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            next: self.head.load(Ordering::Acquire),
            _list: self,
        }
    }
}

impl Drop for BlockList {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        while !node.is_null() {
            // SAFETY: exclusive access; every node came from `Box::into_raw`.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
        }
    }
}

pub struct BlockIter<'a> {
    next: *mut Node,
    _list: &'a BlockList,
}

impl<'a> Iterator for BlockIter<'a> {
    type Item = &'a Arc<BasicBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_null() {
            return None;
        }
        // SAFETY: linked nodes live as long as the list we borrow.
        let node = unsafe { &*self.next };
        self.next = node.next;
        Some(&node.block)
    }
}
