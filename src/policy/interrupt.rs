//! Interrupts and faults taken while instrumented code runs.

use core::fmt;

/// An x86 interrupt vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterruptVector(pub u8);

impl InterruptVector {
    pub const DIVIDE_ERROR: Self = Self(0);
    pub const DEBUG: Self = Self(1);
    pub const NMI: Self = Self(2);
    pub const BREAKPOINT: Self = Self(3);
    pub const INVALID_OPCODE: Self = Self(6);
    pub const DOUBLE_FAULT: Self = Self(8);
    pub const GENERAL_PROTECTION: Self = Self(13);
    pub const PAGE_FAULT: Self = Self(14);
    /// First vector available to external devices.
    pub const FIRST_EXTERNAL: Self = Self(32);

    /// CPU exceptions, as opposed to external interrupts.
    pub fn is_exception(&self) -> bool {
        self.0 < Self::FIRST_EXTERNAL.0
    }
}

impl fmt::Display for InterruptVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::GENERAL_PROTECTION => write!(f, "#GP"),
            Self::PAGE_FAULT => write!(f, "#PF"),
            Self::BREAKPOINT => write!(f, "#BP"),
            Self::DEBUG => write!(f, "#DB"),
            v => write!(f, "vector {}", v.0),
        }
    }
}

/// What a policy did with an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptHandled {
    /// The policy dealt with it; resume the interrupted code.
    Handled,
    /// Let the platform's own interrupt path deliver it.
    #[default]
    Deferred,
}
