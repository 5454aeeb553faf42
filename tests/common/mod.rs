//! Shared mocks for the integration tests.

#![allow(dead_code)]

use axdbi::policy::{BranchTarget, CodeGenerator, Hook, InjectedCall, Instruction};

/// A decoded instruction described by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockInsn {
    pub pc: u64,
    pub len: u64,
    pub call: bool,
    pub ret: bool,
    pub jcc: bool,
    pub jmp: bool,
    pub read: bool,
    pub write: bool,
    pub target: Option<BranchTarget>,
}

impl MockInsn {
    pub fn plain(pc: u64) -> Self {
        Self { pc, len: 4, ..Self::default() }
    }

    pub fn load(pc: u64) -> Self {
        Self { read: true, ..Self::plain(pc) }
    }

    pub fn store(pc: u64) -> Self {
        Self { write: true, ..Self::plain(pc) }
    }

    pub fn call(pc: u64, target: u64) -> Self {
        Self {
            call: true,
            target: Some(BranchTarget::Direct(target)),
            ..Self::plain(pc)
        }
    }

    pub fn call_indirect(pc: u64) -> Self {
        Self {
            call: true,
            target: Some(BranchTarget::Indirect),
            ..Self::plain(pc)
        }
    }

    pub fn ret(pc: u64) -> Self {
        Self { ret: true, ..Self::plain(pc) }
    }

    pub fn jcc(pc: u64, target: u64) -> Self {
        Self {
            jcc: true,
            target: Some(BranchTarget::Direct(target)),
            ..Self::plain(pc)
        }
    }

    pub fn jmp(pc: u64, target: u64) -> Self {
        Self {
            jmp: true,
            target: Some(BranchTarget::Direct(target)),
            ..Self::plain(pc)
        }
    }
}

impl Instruction for MockInsn {
    fn pc(&self) -> Option<u64> {
        Some(self.pc)
    }

    fn next_pc(&self) -> Option<u64> {
        Some(self.pc + self.len)
    }

    fn is_call(&self) -> bool {
        self.call
    }

    fn is_return(&self) -> bool {
        self.ret
    }

    fn is_cond_branch(&self) -> bool {
        self.jcc
    }

    fn is_jump(&self) -> bool {
        self.jmp
    }

    fn reads_memory(&self) -> bool {
        self.read
    }

    fn writes_memory(&self) -> bool {
        self.write
    }

    fn branch_target(&self) -> Option<BranchTarget> {
        self.target
    }
}

/// Code generator that records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingCodeGen {
    pub materialized: Vec<Hook>,
    pub inserted: Vec<(InjectedCall, u64)>,
    pub emitted: Vec<u64>,
}

/// Cache addresses handed out by [`RecordingCodeGen::emit`].
pub const CACHE_BASE: u64 = 0xffff_c000_0000_0000;

impl RecordingCodeGen {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hooks inserted, in order.
    pub fn hooks(&self) -> Vec<Hook> {
        self.inserted.iter().map(|(c, _)| c.hook).collect()
    }
}

impl CodeGenerator for RecordingCodeGen {
    fn materialize(&mut self, hook: Hook) -> u64 {
        self.materialized.push(hook);
        0x1_0000 + hook as u64 * 0x100
    }

    fn insert_call(&mut self, call: &InjectedCall, entry: u64) {
        self.inserted.push((*call, entry));
    }

    fn emit(&mut self, native_pc: u64) -> u64 {
        self.emitted.push(native_pc);
        CACHE_BASE + native_pc
    }
}
