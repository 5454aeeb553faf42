//! Engine configuration.

use core::fmt;

use crate::policy::Policy;
use crate::tag::MAX_INDEX_COUNT;

/// Upper bound on `num_cpus`.
pub const MAX_CPUS: usize = 256;

/// Upper bound on `max_edges`.
pub const MAX_EDGES_LIMIT: usize = 1 << 16;

/// Error types for configuration validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A table size must be a power of two.
    NotPowerOfTwo { field: &'static str, value: usize },
    /// A value is zero or above its limit.
    OutOfRange {
        field: &'static str,
        value: usize,
        max: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPowerOfTwo { field, value } => {
                write!(f, "{} must be a power of two, got {}", field, value)
            }
            Self::OutOfRange { field, value, max } => {
                write!(f, "{} must be in 1..={}, got {}", field, max, value)
            }
        }
    }
}

impl core::error::Error for Error {}

impl From<Error> for axerrno::AxError {
    fn from(_: Error) -> Self {
        axerrno::AxError::InvalidInput
    }
}

/// Address range of application code. Everything outside is host code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppText {
    pub start: u64,
    pub end: u64,
}

impl AppText {
    pub const fn contains(&self, pc: u64) -> bool {
        pc >= self.start && pc < self.end
    }
}

/// Tunables of an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of per-CPU slots (free lists, code-cache tables, execution state).
    pub num_cpus: usize,
    /// Ceiling of the descriptor index space.
    pub max_descriptors: usize,
    /// Descriptor slots per lazily allocated slab chunk.
    pub descriptor_chunk: usize,
    /// First allocation of each CPU-private code-cache table.
    pub cpu_table_entries: usize,
    /// Initial bucket count of the global tables.
    pub global_table_buckets: usize,
    /// Edge slots a new block starts with.
    pub initial_edge_slots: usize,
    /// Edge slots a block may grow to.
    pub max_edges: usize,
    /// Policy for code reached without a recorded policy.
    pub root_policy: Policy,
    /// Application code range; `None` treats every call target as app code.
    pub app_text: Option<AppText>,
    /// Address of the RCU read-side lock primitive.
    pub rcu_read_lock: Option<u64>,
    /// Address of the RCU read-side unlock primitive.
    pub rcu_read_unlock: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineConfig {
    pub const fn new() -> Self {
        Self {
            num_cpus: 8,
            max_descriptors: MAX_INDEX_COUNT,
            descriptor_chunk: 256,
            cpu_table_entries: 1024,
            global_table_buckets: 16,
            initial_edge_slots: 4,
            max_edges: 1 << 14,
            root_policy: Policy::Root,
            app_text: None,
            rcu_read_lock: None,
            rcu_read_unlock: None,
        }
    }

    pub const fn with_num_cpus(mut self, num_cpus: usize) -> Self {
        self.num_cpus = num_cpus;
        self
    }

    pub const fn with_max_descriptors(mut self, max: usize) -> Self {
        self.max_descriptors = max;
        self
    }

    pub const fn with_global_table_buckets(mut self, buckets: usize) -> Self {
        self.global_table_buckets = buckets;
        self
    }

    pub const fn with_edges(mut self, initial: usize, max: usize) -> Self {
        self.initial_edge_slots = initial;
        self.max_edges = max;
        self
    }

    pub const fn with_root_policy(mut self, policy: Policy) -> Self {
        self.root_policy = policy;
        self
    }

    pub const fn with_app_text(mut self, start: u64, end: u64) -> Self {
        self.app_text = Some(AppText { start, end });
        self
    }

    pub const fn with_rcu_primitives(mut self, read_lock: u64, read_unlock: u64) -> Self {
        self.rcu_read_lock = Some(read_lock);
        self.rcu_read_unlock = Some(read_unlock);
        self
    }

    /// True if `pc` is application code.
    pub fn is_app_address(&self, pc: u64) -> bool {
        self.app_text.is_none_or(|text| text.contains(pc))
    }

    /// Check every field against its limits.
    pub fn validate(&self) -> Result<(), Error> {
        check_range("num_cpus", self.num_cpus, MAX_CPUS)?;
        check_range("max_descriptors", self.max_descriptors, MAX_INDEX_COUNT)?;
        check_range("descriptor_chunk", self.descriptor_chunk, self.max_descriptors)?;
        check_pow2("cpu_table_entries", self.cpu_table_entries)?;
        check_pow2("global_table_buckets", self.global_table_buckets)?;
        check_range("max_edges", self.max_edges, MAX_EDGES_LIMIT)?;
        check_range("initial_edge_slots", self.initial_edge_slots, self.max_edges)?;
        Ok(())
    }
}

fn check_range(field: &'static str, value: usize, max: usize) -> Result<(), Error> {
    if value == 0 || value > max {
        return Err(Error::OutOfRange { field, value, max });
    }
    Ok(())
}

fn check_pow2(field: &'static str, value: usize) -> Result<(), Error> {
    if !value.is_power_of_two() {
        return Err(Error::NotPowerOfTwo { field, value });
    }
    Ok(())
}
