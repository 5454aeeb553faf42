//! The instrumentation engine.
//!
//! Owns every piece of shared runtime state and ties the policies to it:
//!
//! - `blocks`: native pc -> translated block, process-wide ([`GlobalTable`])
//! - `target_policies`: native pc -> policy its first discoverer requested
//! - `code_cache`: per-CPU pc -> cache pc, in front of `blocks`
//! - `exec`: per-CPU last-block state driven by the event handlers
//!
//! Blocks are translated on first reach. Two CPUs may race to translate
//! the same pc; the first to publish wins and the loser's block is dropped.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use crate::block::{BasicBlock, BlockId, BlockIter, BlockList, EdgeKind, EdgeList};
use crate::config::{self, EngineConfig};
use crate::cpu_table::{CpuPrivateTable, StorePolicy};
use crate::descriptor::DescriptorAllocator;
use crate::global_table::GlobalTable;
use crate::hash::Murmur3BuildHasher;
use crate::percpu::PerCpu;
use crate::policy::{
    BranchTarget, CodeGenerator, ExecEnv, Hook, Instruction, InterruptHandled, InterruptVector,
    Policy,
};
use crate::watchpoint::Watchpoints;

/// Error types for translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A block must contain at least one instruction.
    EmptyBlock { pc: u64 },
    /// Address 0 cannot be translated.
    NullAddress,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyBlock { pc } => write!(f, "Basic block at {:#x} has no instructions", pc),
            Self::NullAddress => write!(f, "Cannot translate address 0"),
        }
    }
}

impl core::error::Error for Error {}

impl From<Error> for axerrno::AxError {
    fn from(_: Error) -> Self {
        axerrno::AxError::InvalidInput
    }
}

/// What a CPU remembers between two events.
#[derive(Default)]
struct ExecState {
    last: Option<Arc<BasicBlock>>,
}

pub struct Engine {
    config: EngineConfig,
    watchpoints: Watchpoints,
    blocks: GlobalTable<u64, Arc<BasicBlock>>,
    target_policies: GlobalTable<u64, Policy>,
    code_cache: PerCpu<Mutex<CpuPrivateTable>>,
    block_list: BlockList,
    exec: PerCpu<Mutex<ExecState>>,
    next_block_id: AtomicU32,
    trampolines: Mutex<HashMap<Hook, u64, Murmur3BuildHasher>>,
    races_lost: AtomicU64,
}

impl Engine {
    /// Build an engine from a validated configuration.
    pub fn new(config: EngineConfig) -> Result<Self, config::Error> {
        config.validate()?;
        let descriptors =
            DescriptorAllocator::new(config.max_descriptors, config.descriptor_chunk, config.num_cpus);
        Ok(Self {
            watchpoints: Watchpoints::new(descriptors),
            blocks: GlobalTable::with_buckets(config.global_table_buckets),
            target_policies: GlobalTable::with_buckets(config.global_table_buckets),
            code_cache: PerCpu::new(config.num_cpus, |_| {
                Mutex::new(CpuPrivateTable::with_initial_entries(config.cpu_table_entries))
            }),
            block_list: BlockList::new(),
            exec: PerCpu::new(config.num_cpus, |_| Mutex::new(ExecState::default())),
            next_block_id: AtomicU32::new(0),
            trampolines: Mutex::new(HashMap::with_hasher(Murmur3BuildHasher::default())),
            races_lost: AtomicU64::new(0),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn watchpoints(&self) -> &Watchpoints {
        &self.watchpoints
    }

    // =========================================================================
    // Translation
    // =========================================================================

    /// Translate the block at `pc` under the policy recorded for it, or the
    /// root policy if nobody has branched there yet.
    ///
    /// Returns the already-published block if there is one.
    pub fn translate<I: Instruction, G: CodeGenerator>(
        &self,
        pc: u64,
        env: ExecEnv,
        instrs: &[I],
        codegen: &mut G,
    ) -> Result<Arc<BasicBlock>, Error> {
        if let Some(block) = self.blocks.load(&pc) {
            return Ok(block);
        }
        let policy = self.target_policies.load(&pc).unwrap_or(self.config.root_policy);
        self.translate_with(policy, pc, env, instrs, codegen)
    }

    /// Translate the block at `pc` under `policy`.
    pub fn translate_with<I: Instruction, G: CodeGenerator>(
        &self,
        policy: Policy,
        pc: u64,
        env: ExecEnv,
        instrs: &[I],
        codegen: &mut G,
    ) -> Result<Arc<BasicBlock>, Error> {
        if pc == 0 {
            return Err(Error::NullAddress);
        }
        if instrs.is_empty() {
            return Err(Error::EmptyBlock { pc });
        }

        let id = BlockId(self.next_block_id.fetch_add(1, Ordering::Relaxed));
        let edges = EdgeList::new(self.config.initial_edge_slots, self.config.max_edges);
        let block = Arc::new(BasicBlock::new(id, pc, policy, env, instrs.len(), edges));

        let visit = policy.visit(env, &block, instrs, &self.config);

        for call in &visit.calls {
            let entry = self.trampoline(call.hook, codegen);
            codegen.insert_call(call, entry);
        }

        for target in &visit.targets {
            if let BranchTarget::Direct(target_pc) = target.target {
                self.target_policies
                    .store(target_pc, target.policy, StorePolicy::KeepPrevious);
            }
        }

        if let Some(last) = instrs.last()
            && !(last.is_jump() || last.is_return())
            && let Some(next_pc) = last.next_pc()
        {
            self.target_policies
                .store(next_pc, visit.next, StorePolicy::KeepPrevious);
        }

        block.set_cache_pc(codegen.emit(pc));

        let (winner, inserted) = self.blocks.get_or_insert(pc, block);
        if inserted {
            self.block_list.push(winner.clone());
            debug!(
                "engine: translated {} at {:#x} under {} ({} calls)",
                winner.id(),
                pc,
                policy.label(),
                visit.calls.len()
            );
        } else {
            self.races_lost.fetch_add(1, Ordering::Relaxed);
            debug!("engine: lost translation race for {:#x}", pc);
        }

        self.code_cache
            .current()
            .lock()
            .store(pc, winner.cache_pc(), StorePolicy::OverwritePrevious);
        Ok(winner)
    }

    /// Code-cache address of the block at `pc`, if translated.
    ///
    /// Checks this CPU's table first and fills it from the global table.
    pub fn translated_pc(&self, pc: u64) -> Option<u64> {
        let mut table = self.code_cache.current().lock();
        if let Some(cache_pc) = table.find(pc) {
            return Some(cache_pc);
        }
        let cache_pc = self.blocks.load(&pc)?.cache_pc();
        table.store(pc, cache_pc, StorePolicy::OverwritePrevious);
        Some(cache_pc)
    }

    /// The published block at `pc`.
    pub fn block(&self, pc: u64) -> Option<Arc<BasicBlock>> {
        self.blocks.load(&pc)
    }

    /// Policy recorded for code at `pc`.
    pub fn target_policy(&self, pc: u64) -> Option<Policy> {
        self.target_policies.load(&pc)
    }

    /// Every published block, newest first.
    pub fn blocks(&self) -> BlockIter<'_> {
        self.block_list.iter()
    }

    pub fn num_blocks(&self) -> usize {
        self.block_list.len()
    }

    /// Translations discarded because another CPU published first.
    pub fn races_lost(&self) -> u64 {
        self.races_lost.load(Ordering::Relaxed)
    }

    fn trampoline<G: CodeGenerator>(&self, hook: Hook, codegen: &mut G) -> u64 {
        *self
            .trampolines
            .lock()
            .entry(hook)
            .or_insert_with(|| codegen.materialize(hook))
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Entry of a block that was not reached by a call.
    pub fn on_enter_basic_block(&self, block: &Arc<BasicBlock>) {
        let last = self.exec.current().lock().last.replace(block.clone());
        block.counters().record_execution();

        let Some(last) = last else {
            return;
        };
        block.set_function_id(last.function_id());

        if !block.add_edge(last.id(), EdgeKind::IntraIncoming)
            && !last.add_edge(block.id(), EdgeKind::IntraOutgoing)
        {
            if block.edge_slots() < last.edge_slots() {
                block.grow_and_add_edge(last.id(), EdgeKind::IntraIncoming);
            } else {
                last.grow_and_add_edge(block.id(), EdgeKind::IntraOutgoing);
            }
        }
    }

    /// Entry of a block reached by a call.
    pub fn on_enter_function(&self, block: &Arc<BasicBlock>) {
        let last = self.exec.current().lock().last.replace(block.clone());
        block.counters().record_execution();

        let Some(last) = last else {
            return;
        };

        if !last.add_edge(block.id(), EdgeKind::InterOutgoing)
            && !block.add_edge(last.id(), EdgeKind::InterIncoming)
        {
            if last.edge_slots() < block.edge_slots() {
                last.grow_and_add_edge(block.id(), EdgeKind::InterOutgoing);
            } else {
                block.grow_and_add_edge(last.id(), EdgeKind::InterIncoming);
            }
        }
    }

    /// Just before a return.
    pub fn on_exit_function(&self, _block: &Arc<BasicBlock>) {
        self.exec.current().lock().last = None;
    }

    /// Just after a call returned into `block`.
    pub fn on_after_function(&self, block: &Arc<BasicBlock>) {
        self.exec.current().lock().last = Some(block.clone());
    }

    pub fn on_call_app(&self, block: &BasicBlock) {
        block.counters().record_app_call();
    }

    pub fn on_call_host(&self, block: &BasicBlock, target: u64) {
        trace!("engine: {} calls host {:#x}", block.id(), target);
        block.counters().record_host_call();
    }

    pub fn on_call_indirect(&self, block: &BasicBlock) {
        block.counters().record_indirect_call();
    }

    pub fn on_fall_through(&self, block: &BasicBlock) {
        block.counters().record_fall_through();
    }

    /// Memory access through `ptr`; returns the address to really use.
    ///
    /// Accesses through a pointer whose descriptor was freed are counted as
    /// stale.
    pub fn on_watched_access(&self, block: &BasicBlock, ptr: u64, is_write: bool) -> u64 {
        if !self.watchpoints.is_tagged(ptr) {
            return ptr;
        }
        let stale = self.watchpoints.descriptor(ptr).is_none();
        if stale {
            warn!(
                "engine: {} {} through stale pointer {:#x}",
                block.id(),
                if is_write { "writes" } else { "reads" },
                ptr
            );
        }
        block.counters().record_watched_access(stale);
        self.watchpoints.decode(ptr)
    }

    /// Run the handler for `hook`, as the trampoline would.
    ///
    /// Returns the decoded address for the watch hooks and 0 otherwise.
    pub fn dispatch(&self, hook: Hook, block: &Arc<BasicBlock>, arg: Option<u64>) -> u64 {
        match hook {
            Hook::EnterBasicBlock => self.on_enter_basic_block(block),
            Hook::EnterFunction => self.on_enter_function(block),
            Hook::ExitFunction => self.on_exit_function(block),
            Hook::AfterFunction => self.on_after_function(block),
            Hook::CallApp => self.on_call_app(block),
            Hook::CallHost => self.on_call_host(block, arg.unwrap_or(0)),
            Hook::CallIndirect => self.on_call_indirect(block),
            Hook::FallThrough => self.on_fall_through(block),
            Hook::WatchRead => return self.on_watched_access(block, arg.unwrap_or(0), false),
            Hook::WatchWrite => return self.on_watched_access(block, arg.unwrap_or(0), true),
        }
        0
    }

    /// Route an interrupt to the policy of the block it interrupted.
    ///
    /// Without a block the interrupt arrived outside instrumented code and
    /// is always deferred.
    pub fn handle_interrupt(
        &self,
        block: Option<&BasicBlock>,
        vector: InterruptVector,
    ) -> InterruptHandled {
        match block {
            Some(b) => b.policy().handle_interrupt(Some(b), vector),
            None => InterruptHandled::Deferred,
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        info!(
            "engine: shutting down ({} blocks, {} races lost)",
            self.block_list.len(),
            self.races_lost.load(Ordering::Relaxed)
        );
    }
}
