//! Event hooks and the code-generator seam.
//!
//! A policy never emits machine code. It describes clean calls
//! ([`InjectedCall`]) and the engine hands them to a [`CodeGenerator`],
//! which owns the encoder and the code cache.

use crate::block::BlockId;

/// Handlers a policy can call out to.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// Entry of a non-entry basic block.
    EnterBasicBlock = 0,
    /// Entry of a block reached by a call.
    EnterFunction = 1,
    /// Just before a return.
    ExitFunction = 2,
    /// Just after a call returns.
    AfterFunction = 3,
    /// Before a direct call into application code.
    CallApp = 4,
    /// Before a direct call into host code; argument is the target.
    CallHost = 5,
    /// Before an indirect call.
    CallIndirect = 6,
    /// After a conditional branch that was not taken.
    FallThrough = 7,
    /// Before a memory read; argument is the effective address.
    WatchRead = 8,
    /// Before a memory write; argument is the effective address.
    WatchWrite = 9,
}

impl Hook {
    pub const ALL: [Hook; 10] = [
        Hook::EnterBasicBlock,
        Hook::EnterFunction,
        Hook::ExitFunction,
        Hook::AfterFunction,
        Hook::CallApp,
        Hook::CallHost,
        Hook::CallIndirect,
        Hook::FallThrough,
        Hook::WatchRead,
        Hook::WatchWrite,
    ];

    /// Short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            Hook::EnterBasicBlock => "enter_bb",
            Hook::EnterFunction => "enter_function",
            Hook::ExitFunction => "exit_function",
            Hook::AfterFunction => "after_function",
            Hook::CallApp => "call_app",
            Hook::CallHost => "call_host",
            Hook::CallIndirect => "call_indirect",
            Hook::FallThrough => "fall_through",
            Hook::WatchRead => "watch_read",
            Hook::WatchWrite => "watch_write",
        }
    }

    /// Hooks whose argument is only known at run time.
    pub fn takes_runtime_operand(&self) -> bool {
        matches!(self, Hook::WatchRead | Hook::WatchWrite)
    }
}

/// Where a clean call goes relative to its instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Before,
    After,
}

/// A clean call a policy wants in the translated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectedCall {
    /// Index of the instruction in the block.
    pub index: usize,
    pub placement: Placement,
    pub hook: Hook,
    /// Block whose state the handler receives.
    pub block: BlockId,
    /// Constant argument, e.g. the target of a host call.
    pub arg: Option<u64>,
}

/// The code generator the engine drives while translating a block.
pub trait CodeGenerator {
    /// Build (or find) a callable trampoline for `hook` that saves and
    /// restores machine state around the handler. Returns its address.
    fn materialize(&mut self, hook: Hook) -> u64;

    /// Insert a call to the trampoline at `entry`.
    fn insert_call(&mut self, call: &InjectedCall, entry: u64);

    /// Encode the block into the code cache; returns the cache address.
    fn emit(&mut self, native_pc: u64) -> u64;
}
