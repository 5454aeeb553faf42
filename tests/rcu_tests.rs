//! Integration tests for RCU-protected values.
//!
//! Tests the writer protocol and reader/writer concurrency.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use axdbi::rcu::{RcuProtected, RcuWriter, WriteRef};

// =============================================================================
// Writer Protocol Tests
// =============================================================================

/// Records the order of its callbacks.
#[derive(Default)]
struct Tracing {
    steps: Vec<&'static str>,
    retired: Option<u32>,
}

impl RcuWriter<u32> for Tracing {
    fn setup(&mut self, current: &u32) {
        assert_eq!(*current, 1);
        self.steps.push("setup");
    }

    fn while_readers_exist(&mut self, write: &mut WriteRef<'_, u32>) {
        self.steps.push("while_readers_exist");
        assert!(!write.is_published());
        let next = write.current() + 1;
        assert!(write.publish(Box::new(next)));
        assert_eq!(*write.current(), 2);
    }

    fn after_readers_done(&mut self, write: &WriteRef<'_, u32>) {
        self.steps.push("after_readers_done");
        assert_eq!(write.retired(), Some(&1));
    }

    fn teardown(&mut self, retired: Option<Box<u32>>) {
        self.steps.push("teardown");
        self.retired = retired.map(|b| *b);
    }
}

#[test]
fn test_writer_callback_order() {
    let rcu = RcuProtected::new(1u32);
    let mut writer = Tracing::default();
    rcu.write(&mut writer);

    assert_eq!(
        writer.steps,
        ["setup", "while_readers_exist", "after_readers_done", "teardown"]
    );
    assert_eq!(writer.retired, Some(1));
    assert_eq!(rcu.read(|v| *v), 2);
}

#[test]
fn test_get_mut_bypasses_protocol() {
    let mut rcu = RcuProtected::new(String::from("a"));
    rcu.get_mut().push('b');
    assert_eq!(rcu.read(|s| s.clone()), "ab");
}

#[test]
fn test_drop_frees_value() {
    struct Counted(Arc<AtomicUsize>);
    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let drops = Arc::new(AtomicUsize::new(0));
    {
        let rcu = RcuProtected::new(Counted(drops.clone()));
        rcu.replace(Counted(drops.clone()));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
    assert_eq!(drops.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_readers_see_old_or_new() {
    let rcu = Arc::new(RcuProtected::new(0u32));
    let written = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let rcu = Arc::clone(&rcu);
            let written = Arc::clone(&written);
            thread::spawn(move || {
                for _ in 0..10_000 {
                    let was_written = written.load(Ordering::SeqCst);
                    let value = rcu.read(|v| *v);
                    assert!(value == 0 || value == 1);
                    if was_written {
                        assert_eq!(value, 1);
                    }
                }
            })
        })
        .collect();

    rcu.update(|_| 1);
    written.store(true, Ordering::SeqCst);

    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(rcu.read(|v| *v), 1);
}

#[test]
fn test_concurrent_writers_serialize() {
    let rcu = Arc::new(RcuProtected::new(0u64));

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let rcu = Arc::clone(&rcu);
            thread::spawn(move || {
                for _ in 0..500 {
                    rcu.update(|v| v + 1);
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    assert_eq!(rcu.read(|v| *v), 2000);
}

#[test]
fn test_reader_guard_value_stays_valid() {
    let rcu = Arc::new(RcuProtected::new(vec![7u8; 64]));
    let stop = Arc::new(AtomicBool::new(false));

    let writer = {
        let rcu = Arc::clone(&rcu);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut n = 0u8;
            while !stop.load(Ordering::SeqCst) {
                n = n.wrapping_add(1);
                rcu.replace(vec![n; 64]);
            }
        })
    };

    for _ in 0..5_000 {
        let guard = rcu.read_guard();
        let first = guard[0];
        assert!(guard.iter().all(|b| *b == first));
    }

    stop.store(true, Ordering::SeqCst);
    writer.join().unwrap();
}
