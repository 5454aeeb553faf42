//! Platform abstraction layer for kernel operations.
//!
//! The instrumentation core needs two things from the platform: which CPU
//! it is running on (per-CPU free lists, per-CPU code-cache tables and
//! per-CPU execution state) and a monotonic clock for translation stamps.
//! Both are mocked in user space so the containers can be tested on a host.

use core::sync::atomic::{AtomicU64, Ordering};

/// Platform operations trait.
pub trait PlatformOps {
    /// Get current monotonic time in nanoseconds.
    fn time_ns() -> u64;

    /// Get current CPU ID.
    fn cpu_id() -> u32;
}

// =============================================================================
// Real Implementation (kernel environment with axhal)
// =============================================================================

/// Real platform operations using axhal.
#[cfg(all(not(test), feature = "axhal"))]
pub struct RealPlatform;

#[cfg(all(not(test), feature = "axhal"))]
impl PlatformOps for RealPlatform {
    fn time_ns() -> u64 {
        axhal::time::monotonic_time().as_nanos() as u64
    }

    fn cpu_id() -> u32 {
        axhal::percpu::this_cpu_id() as u32
    }
}

// =============================================================================
// Mock Implementation (test environment or no axhal)
// =============================================================================

static MOCK_TIME_NS: AtomicU64 = AtomicU64::new(1_000_000_000);

static MOCK_CPU_ID: AtomicU64 = AtomicU64::new(0);

/// Mock platform operations for host builds.
#[cfg(any(test, not(feature = "axhal")))]
pub struct MockPlatform;

#[cfg(any(test, not(feature = "axhal")))]
impl PlatformOps for MockPlatform {
    fn time_ns() -> u64 {
        MOCK_TIME_NS.load(Ordering::Relaxed)
    }

    fn cpu_id() -> u32 {
        MOCK_CPU_ID.load(Ordering::Relaxed) as u32
    }
}

/// Set mock time.
pub fn set_mock_time(ns: u64) {
    MOCK_TIME_NS.store(ns, Ordering::Relaxed);
}

/// Advance mock time by given nanoseconds.
pub fn advance_mock_time(ns: u64) {
    MOCK_TIME_NS.fetch_add(ns, Ordering::Relaxed);
}

/// Set the CPU the mock platform reports.
///
/// This is process-wide, so every thread of a host test sees the same CPU.
/// Per-CPU state is lock-guarded, so sharing a CPU id between threads only
/// adds contention.
pub fn set_mock_cpu_id(id: u32) {
    MOCK_CPU_ID.store(id as u64, Ordering::Relaxed);
}

// =============================================================================
// Platform Type Alias
// =============================================================================

/// The active platform implementation.
#[cfg(all(not(test), feature = "axhal"))]
pub type Platform = RealPlatform;

#[cfg(any(test, not(feature = "axhal")))]
pub type Platform = MockPlatform;

#[inline]
pub fn time_ns() -> u64 {
    Platform::time_ns()
}

#[inline]
pub fn cpu_id() -> u32 {
    Platform::cpu_id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_time() {
        set_mock_time(5000);
        assert_eq!(time_ns(), 5000);

        advance_mock_time(1000);
        assert_eq!(time_ns(), 6000);
    }

    #[test]
    fn test_mock_cpu_id() {
        set_mock_cpu_id(3);
        assert_eq!(cpu_id(), 3);

        set_mock_cpu_id(0);
        assert_eq!(cpu_id(), 0);
    }
}
