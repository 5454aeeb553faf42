//! AxVisor Dynamic Binary Instrumentation Core
//!
//! This crate provides the runtime data structures behind a dynamic binary
//! translator: tagged watchpoint pointers, an RCU container with the hash
//! tables built on it, and the basic-block instrumentation policies.
//!
//! # Features
//!
//! - `watchpoints` - Tagged-pointer codec and descriptor allocator (default)
//! - `policy` - Instrumentation policies, basic blocks and the engine (default, requires watchpoints)
//! - `axhal` - Take time and CPU ids from axhal instead of the mock platform
//!
//! # Quick Start
//!
//! ```ignore
//! use axdbi::{EngineConfig, ExecEnv};
//!
//! // Build the engine (call once during boot)
//! let engine = axdbi::init(EngineConfig::new().with_app_text(text_start, text_end))?;
//!
//! // Translate the block the dispatcher just reached
//! let block = engine.translate(pc, ExecEnv::App, &decoded, &mut codegen)?;
//!
//! // Watch an allocation
//! let tagged = engine.watchpoints().encode(ptr, size, owner).unwrap_or(ptr);
//! ```

#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

// =============================================================================
// Platform Abstraction (for testing support)
// =============================================================================

pub mod platform;

pub mod percpu;

// =============================================================================
// Concurrent Containers
// =============================================================================

pub mod hash;

pub mod rcu;

pub mod cpu_table;

pub mod global_table;

// =============================================================================
// Watchpoint Module
// =============================================================================

#[cfg(feature = "watchpoints")]
pub mod tag;

#[cfg(feature = "watchpoints")]
pub mod descriptor;

#[cfg(feature = "watchpoints")]
pub mod watchpoint;

// =============================================================================
// Policy Module
// =============================================================================

#[cfg(feature = "policy")]
pub mod config;

#[cfg(feature = "policy")]
pub mod policy;

#[cfg(feature = "policy")]
pub mod block;

#[cfg(feature = "policy")]
pub mod engine;

#[cfg(feature = "policy")]
pub mod report;

// Re-export key types for convenience
pub use cpu_table::{CpuPrivateTable, StorePolicy, StoreState};
pub use global_table::GlobalTable;
pub use rcu::{RcuProtected, RcuWriter, WriteRef};

#[cfg(feature = "watchpoints")]
pub use descriptor::{Descriptor, DescriptorAllocator, DescriptorState, Error as DescriptorError};

#[cfg(feature = "watchpoints")]
pub use watchpoint::Watchpoints;

#[cfg(feature = "policy")]
pub use block::{BasicBlock, BlockFlags, BlockId, EdgeKind};

#[cfg(feature = "policy")]
pub use config::{EngineConfig, Error as ConfigError};

#[cfg(feature = "policy")]
pub use engine::{Engine, Error as EngineError};

#[cfg(feature = "policy")]
pub use policy::{
    CodeGenerator, ExecEnv, Hook, Instruction, InterruptHandled, InterruptVector, Policy,
};

// =============================================================================
// Initialization
// =============================================================================

/// Initialize the instrumentation core and build its engine.
///
/// This should be called during kernel boot after the memory allocator is ready.
#[cfg(feature = "policy")]
pub fn init(config: EngineConfig) -> Result<Engine, ConfigError> {
    info!("Initializing axdbi...");

    if let Err(e) = config.validate() {
        error!("axdbi: invalid configuration: {}", e);
        return Err(e);
    }

    info!("  - watchpoints enabled");
    info!(
        "    - descriptors: {} max, {} per chunk",
        config.max_descriptors, config.descriptor_chunk
    );
    info!("  - policy module enabled");
    info!("    - cpus: {}", config.num_cpus);
    info!("    - root policy: {}", config.root_policy.label());
    info!(
        "    - tables: {} code-cache entries per cpu, {} global buckets",
        config.cpu_table_entries, config.global_table_buckets
    );
    if config.rcu_read_lock.is_some() {
        info!("    - rcu primitives configured");
    }

    let engine = Engine::new(config)?;
    info!("axdbi initialization complete");
    Ok(engine)
}
