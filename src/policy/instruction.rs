//! What a policy needs to know about decoded instructions.
//!
//! The decoder lives outside this crate; it hands a basic block over as a
//! slice of something implementing [`Instruction`].

/// Where control goes after a CTI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchTarget {
    /// Statically known target address.
    Direct(u64),
    /// Computed at run time (register or memory operand).
    Indirect,
}

impl BranchTarget {
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct(_))
    }

    pub fn pc(&self) -> Option<u64> {
        match self {
            Self::Direct(pc) => Some(*pc),
            Self::Indirect => None,
        }
    }
}

/// Which side of the instrumentation boundary a block runs on.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecEnv {
    /// Instrumented application (or kernel module) code.
    App = 0,
    /// The host: kernel or runtime code outside the instrumented region.
    Host = 1,
}

/// One decoded instruction.
pub trait Instruction {
    /// Native address, if the instruction came from memory.
    fn pc(&self) -> Option<u64>;

    /// Address of the following instruction, i.e. the fall-through.
    fn next_pc(&self) -> Option<u64> {
        None
    }

    fn is_call(&self) -> bool;

    fn is_return(&self) -> bool;

    fn is_cond_branch(&self) -> bool;

    /// Unconditional jump.
    fn is_jump(&self) -> bool;

    fn reads_memory(&self) -> bool;

    fn writes_memory(&self) -> bool;

    /// Target of a call, jump or conditional branch.
    fn branch_target(&self) -> Option<BranchTarget>;

    /// Control-transfer instruction.
    fn is_cti(&self) -> bool {
        self.is_call() || self.is_return() || self.is_cond_branch() || self.is_jump()
    }
}
