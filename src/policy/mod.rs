//! Basic-block instrumentation policies.
//!
//! A policy decides, for one basic block, which clean calls to inject and
//! which policy the block's successors are translated under. The set of
//! policies is closed ([`Policy`]) and every transition goes through
//! [`Policy::visit`], so the whole state machine can be enumerated:
//!
//! ```text
//!            call                          jump / jcc
//!  Root ───────────────► Entry ◄──call── Exit ◄───────┐
//!   │                      │               │          │
//!   └──── jump / jcc ──────┴─► Exit ───────┴──────────┘
//!
//!  Watched ─► Watched      Null ─► Null      EvenOdd(p) ─► EvenOdd(!p)
//!  RcuDepth(d) ─► RcuDepth(d ± 1) across calls to the RCU primitives
//! ```
//!
//! Host code is never instrumented; its successors keep the policy that
//! reached it.

pub mod hook;
pub mod instruction;
pub mod interrupt;

use alloc::vec::Vec;

use crate::block::{BasicBlock, BlockFlags};
use crate::config::EngineConfig;

pub use hook::{CodeGenerator, Hook, InjectedCall, Placement};
pub use instruction::{BranchTarget, ExecEnv, Instruction};
pub use interrupt::{InterruptHandled, InterruptVector};

/// Deepest RCU read-side nesting tracked by [`Policy::RcuDepth`].
pub const MAX_RCU_DEPTH: u8 = 8;

/// Alternation state of [`Policy::EvenOdd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parity {
    Even,
    Odd,
}

impl Parity {
    pub fn flip(self) -> Self {
        match self {
            Parity::Even => Parity::Odd,
            Parity::Odd => Parity::Even,
        }
    }
}

/// The closed set of instrumentation policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    /// Entry point of an externally reachable function.
    Root,
    /// First block of a function reached by a call.
    Entry,
    /// Any other block of a function.
    Exit,
    /// Check every memory operand against the watchpoint descriptors.
    Watched,
    /// Alternate between two states, one block at a time.
    EvenOdd(Parity),
    /// Inside `depth` nested RCU read-side critical sections.
    RcuDepth(u8),
    /// Translate without instrumentation.
    Null,
}

/// How a CTI leaves the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtiKind {
    Call,
    Jump,
    CondBranch,
}

/// Policy requested for the target of one CTI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetPolicy {
    /// Index of the CTI in the block.
    pub index: usize,
    pub kind: CtiKind,
    pub target: BranchTarget,
    pub policy: Policy,
}

/// Result of visiting one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Visit {
    /// Policy for the block's fall-through successor.
    pub next: Policy,
    /// Clean calls to inject, in instruction order.
    pub calls: Vec<InjectedCall>,
    /// Policies for CTI targets.
    pub targets: Vec<TargetPolicy>,
}

/// Which hooks a visit injects.
#[derive(Clone, Copy)]
struct Instrumentation {
    /// Hook at the top of the block.
    entry: Option<Hook>,
    /// Call, return, and fall-through hooks.
    control_flow: bool,
    /// Watchpoint checks before memory operands.
    memory: bool,
}

impl Instrumentation {
    const NONE: Self = Self {
        entry: None,
        control_flow: false,
        memory: false,
    };
}

impl Policy {
    /// True for the policies that build the control-flow graph.
    pub fn is_cfg(&self) -> bool {
        matches!(self, Policy::Root | Policy::Entry | Policy::Exit)
    }

    /// Short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            Policy::Root => "root",
            Policy::Entry => "entry",
            Policy::Exit => "exit",
            Policy::Watched => "watched",
            Policy::EvenOdd(Parity::Even) => "even",
            Policy::EvenOdd(Parity::Odd) => "odd",
            Policy::RcuDepth(_) => "rcu",
            Policy::Null => "null",
        }
    }

    /// Policy for the first block of a function called from here.
    fn callee(self) -> Policy {
        match self {
            Policy::Root | Policy::Entry | Policy::Exit => Policy::Entry,
            other => other,
        }
    }

    /// Policy for a jump or branch target inside the same function.
    fn local(self) -> Policy {
        match self {
            Policy::Root | Policy::Entry | Policy::Exit => Policy::Exit,
            other => other,
        }
    }

    fn instrumentation(self) -> Instrumentation {
        match self {
            Policy::Root | Policy::Entry => Instrumentation {
                entry: Some(Hook::EnterFunction),
                control_flow: true,
                memory: false,
            },
            Policy::Exit => Instrumentation {
                entry: Some(Hook::EnterBasicBlock),
                control_flow: true,
                memory: false,
            },
            Policy::Watched => Instrumentation {
                memory: true,
                ..Instrumentation::NONE
            },
            Policy::RcuDepth(depth) => Instrumentation {
                memory: depth > 0,
                ..Instrumentation::NONE
            },
            Policy::EvenOdd(_) | Policy::Null => Instrumentation::NONE,
        }
    }

    /// Classify `instrs`, mark `block` and decide successor policies.
    pub fn visit<I: Instruction>(
        self,
        env: ExecEnv,
        block: &BasicBlock,
        instrs: &[I],
        config: &EngineConfig,
    ) -> Visit {
        if env == ExecEnv::Host {
            block.mark(BlockFlags::HOST);
            return Visit {
                next: self,
                calls: Vec::new(),
                targets: Vec::new(),
            };
        }

        match self {
            Policy::Root => block.mark(BlockFlags::ROOT | BlockFlags::FUNCTION_ENTRY),
            Policy::Entry => block.mark(BlockFlags::FUNCTION_ENTRY),
            _ => {}
        }

        let inst = self.instrumentation();
        let id = block.id();
        let mut calls = Vec::new();
        let mut targets = Vec::new();
        let mut depth = match self {
            Policy::RcuDepth(depth) => depth,
            _ => 0,
        };

        let mut inject = |index: usize, placement: Placement, hook: Hook, arg: Option<u64>| {
            calls.push(InjectedCall {
                index,
                placement,
                hook,
                block: id,
                arg,
            })
        };

        if let Some(hook) = inst.entry {
            inject(0, Placement::Before, hook, None);
        }

        for (index, insn) in instrs.iter().enumerate() {
            if insn.reads_memory() {
                block.note_memory_op(false);
                if inst.memory {
                    inject(index, Placement::Before, Hook::WatchRead, None);
                }
            }
            if insn.writes_memory() {
                block.note_memory_op(true);
                if inst.memory {
                    inject(index, Placement::Before, Hook::WatchWrite, None);
                }
            }

            if insn.is_call() {
                let target = insn.branch_target().unwrap_or(BranchTarget::Indirect);
                let mut callee = self.callee();

                if inst.control_flow {
                    let (hook, arg) = match target {
                        BranchTarget::Direct(pc) if config.is_app_address(pc) => (Hook::CallApp, None),
                        BranchTarget::Direct(pc) => (Hook::CallHost, Some(pc)),
                        BranchTarget::Indirect => (Hook::CallIndirect, None),
                    };
                    inject(index, Placement::Before, hook, arg);
                    inject(index, Placement::After, Hook::AfterFunction, None);
                }

                if let Policy::RcuDepth(_) = self {
                    let pc = target.pc();
                    if pc.is_some() && pc == config.rcu_read_lock {
                        depth = depth.saturating_add(1).min(MAX_RCU_DEPTH);
                        callee = Policy::Null;
                    } else if pc.is_some() && pc == config.rcu_read_unlock {
                        depth = depth.saturating_sub(1);
                        callee = Policy::Null;
                    } else {
                        callee = Policy::RcuDepth(depth);
                    }
                }

                if !target.is_direct() {
                    block.mark(BlockFlags::HAS_INDIRECT_CTI);
                }
                targets.push(TargetPolicy {
                    index,
                    kind: CtiKind::Call,
                    target,
                    policy: callee,
                });
            } else if insn.is_return() {
                block.mark(BlockFlags::FUNCTION_EXIT);
                if inst.control_flow {
                    inject(index, Placement::Before, Hook::ExitFunction, None);
                }
            } else if insn.is_cond_branch() || insn.is_jump() {
                let target = insn.branch_target().unwrap_or(BranchTarget::Indirect);
                if !target.is_direct() {
                    block.mark(BlockFlags::HAS_INDIRECT_CTI);
                }
                let kind = if insn.is_cond_branch() {
                    if inst.control_flow {
                        inject(index, Placement::After, Hook::FallThrough, None);
                    }
                    CtiKind::CondBranch
                } else {
                    CtiKind::Jump
                };
                let policy = match self {
                    Policy::RcuDepth(_) => Policy::RcuDepth(depth),
                    other => other.local(),
                };
                targets.push(TargetPolicy {
                    index,
                    kind,
                    target,
                    policy,
                });
            }
        }

        let next = match self {
            Policy::EvenOdd(parity) => Policy::EvenOdd(parity.flip()),
            Policy::RcuDepth(_) => Policy::RcuDepth(depth),
            other => other.local(),
        };
        if let Policy::EvenOdd(parity) = self {
            for target in &mut targets {
                target.policy = Policy::EvenOdd(parity.flip());
            }
        }

        Visit {
            next,
            calls,
            targets,
        }
    }

    /// React to an interrupt that arrived while `block` was running.
    ///
    /// Policies may observe the interrupt but never suppress it.
    pub fn handle_interrupt(
        self,
        block: Option<&BasicBlock>,
        vector: InterruptVector,
    ) -> InterruptHandled {
        match self {
            Policy::Null | Policy::EvenOdd(_) => {}
            _ => {
                if let Some(block) = block {
                    block.counters().record_interrupt();
                    trace!("policy {}: {} in block {}", self.label(), vector, block.id());
                }
            }
        }
        InterruptHandled::Deferred
    }
}
