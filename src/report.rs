//! Point-in-time reports over the translated blocks.

use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::block::{BasicBlock, BlockFlags, BlockId, CounterSnapshot, Edge};
use crate::engine::Engine;
use crate::hash::Murmur3BuildHasher;
use crate::policy::Policy;

/// Snapshot of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReport {
    pub id: BlockId,
    pub function_id: u32,
    pub native_pc: u64,
    pub cache_pc: u64,
    pub policy: Policy,
    pub flags: BlockFlags,
    pub num_instructions: usize,
    pub counters: CounterSnapshot,
    pub edges: Vec<Edge>,
    pub dropped_edges: usize,
    pub translated_at_ns: u64,
}

impl BlockReport {
    pub fn of(block: &BasicBlock) -> Self {
        Self {
            id: block.id(),
            function_id: block.function_id(),
            native_pc: block.native_pc(),
            cache_pc: block.cache_pc(),
            policy: block.policy(),
            flags: block.flags(),
            num_instructions: block.num_instructions(),
            counters: block.counters().snapshot(),
            edges: block.edges(),
            dropped_edges: block.dropped_edges(),
            translated_at_ns: block.translated_at_ns(),
        }
    }
}

/// Per-function totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionSummary {
    pub blocks: usize,
    pub executions: u64,
    /// Executions of the function's entry blocks.
    pub calls: u64,
    pub interrupts: u64,
}

/// Snapshot every published block, ordered by id.
pub fn snapshot(engine: &Engine) -> Vec<BlockReport> {
    let mut reports: Vec<BlockReport> = engine.blocks().map(|b| BlockReport::of(b)).collect();
    reports.sort_unstable_by_key(|r| r.id);
    reports
}

/// Aggregate block reports by function id.
pub fn function_summary(reports: &[BlockReport]) -> HashMap<u32, FunctionSummary, Murmur3BuildHasher> {
    let mut summary = HashMap::with_hasher(Murmur3BuildHasher::default());
    for report in reports {
        let entry: &mut FunctionSummary = summary.entry(report.function_id).or_default();
        entry.blocks += 1;
        entry.executions += report.counters.executions;
        entry.interrupts += report.counters.interrupts;
        if report.flags.contains(BlockFlags::FUNCTION_ENTRY) {
            entry.calls += report.counters.executions;
        }
    }
    summary
}
