//! Read-copy-update protected values.
//!
//! [`RcuProtected<T>`] keeps one heap-owned `T` behind an atomic pointer.
//! Readers never block: they join the active *generation* (one of two
//! reference counters), look at the value and leave. Writers are serialized
//! by a spinlock and follow the [`RcuWriter`] protocol:
//!
//! 1. `setup` with the current value.
//! 2. `while_readers_exist`: build the new version and [`WriteRef::publish`]
//!    it. Publication swaps the value pointer and rotates the active
//!    generation in one step, so every reader that joins afterwards sees
//!    the new value.
//! 3. The writer drains the previous generation: it waits until the count
//!    is zero and closes it. A reader that raced with the rotation retries
//!    on the new generation.
//! 4. `after_readers_done`, then the lock is released.
//! 5. `teardown` receives ownership of the retired value.
//!
//! # Deadlock
//!
//! Calling `write` on a container from inside one of its own writer
//! callbacks spins forever on the writer lock. So does holding a
//! [`ReadGuard`] across a `write` on the same container.

use alloc::boxed::Box;
use core::hint::spin_loop;
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use spin::Mutex;

/// Counter value of a generation nobody may join.
const CLOSED: usize = usize::MAX;

/// Reader count of one generation.
struct Generation {
    readers: AtomicUsize,
}

impl Generation {
    const fn open() -> Self {
        Self {
            readers: AtomicUsize::new(0),
        }
    }

    const fn closed() -> Self {
        Self {
            readers: AtomicUsize::new(CLOSED),
        }
    }

    /// Join the generation. Fails if a writer has closed it.
    fn try_enter(&self) -> bool {
        let mut current = self.readers.load(Ordering::SeqCst);
        loop {
            if current == CLOSED {
                return false;
            }
            match self.readers.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(x) => current = x,
            }
        }
    }

    fn exit(&self) {
        self.readers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wait for every reader to leave, then close the generation.
    fn drain(&self) {
        while self
            .readers
            .compare_exchange_weak(0, CLOSED, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    fn reopen(&self) {
        self.readers.store(0, Ordering::SeqCst);
    }
}

/// A value with lock-free readers and one writer at a time.
pub struct RcuProtected<T> {
    value: AtomicPtr<T>,
    generations: [Generation; 2],
    active: AtomicUsize,
    write_lock: Mutex<()>,
    _owns: PhantomData<Box<T>>,
}

// SAFETY: readers share `&T` across threads and writers move `Box<T>`
// between threads.
unsafe impl<T: Send + Sync> Sync for RcuProtected<T> {}
unsafe impl<T: Send> Send for RcuProtected<T> {}

impl<T> RcuProtected<T> {
    pub fn new(value: T) -> Self {
        Self::from_box(Box::new(value))
    }

    pub fn from_box(value: Box<T>) -> Self {
        Self {
            value: AtomicPtr::new(Box::into_raw(value)),
            generations: [Generation::open(), Generation::closed()],
            active: AtomicUsize::new(0),
            write_lock: Mutex::new(()),
            _owns: PhantomData,
        }
    }

    /// Enter a read-side critical section.
    ///
    /// The value cannot be reclaimed while the guard lives; dropping the
    /// guard (including during unwinding) leaves the section.
    pub fn read_guard(&self) -> ReadGuard<'_, T> {
        loop {
            let active = self.active.load(Ordering::SeqCst);
            let generation = &self.generations[active];
            if !generation.try_enter() {
                spin_loop();
                continue;
            }
            // Joined a generation that is not (or no longer) the active one.
            if self.active.load(Ordering::SeqCst) != active {
                generation.exit();
                continue;
            }
            let value = self.value.load(Ordering::SeqCst);
            // SAFETY: the pointer always comes from `Box::into_raw`, and
            // the value it names is not freed until our generation drains.
            let value = unsafe { NonNull::new_unchecked(value) };
            return ReadGuard {
                value,
                generation,
                _marker: PhantomData,
            };
        }
    }

    /// Run `f` on the current value inside a read-side critical section.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.read_guard();
        f(&guard)
    }

    /// Run a writer through the write protocol.
    pub fn write<W: RcuWriter<T> + ?Sized>(&self, writer: &mut W) {
        let lock = self.write_lock.lock();

        let previous = self.active.load(Ordering::SeqCst);
        let next = previous ^ 1;
        self.generations[next].reopen();

        // SAFETY: only writers replace the value and we hold the lock.
        writer.setup(unsafe { &*self.value.load(Ordering::SeqCst) });

        let mut write_ref = WriteRef {
            protected: self,
            next,
            retired: None,
        };
        writer.while_readers_exist(&mut write_ref);

        if write_ref.retired.is_some() {
            self.generations[previous].drain();
        } else {
            // Nothing was published; park the spare generation again.
            self.generations[next].drain();
        }
        writer.after_readers_done(&write_ref);

        let retired = write_ref.retired.take();
        drop(write_ref);
        drop(lock);

        // SAFETY: `retired` was unpublished and its generation is drained.
        writer.teardown(retired.map(|ptr| unsafe { Box::from_raw(ptr.as_ptr()) }));
    }

    /// Replace the value with `f(&current)`.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        struct Update<F>(Option<F>);

        impl<T, F: FnOnce(&T) -> T> RcuWriter<T> for Update<F> {
            fn while_readers_exist(&mut self, write: &mut WriteRef<'_, T>) {
                if let Some(f) = self.0.take() {
                    let new = f(write.current());
                    write.publish(Box::new(new));
                }
            }
        }

        self.write(&mut Update(Some(f)));
    }

    /// Replace the value and return the old one once readers are done.
    pub fn replace(&self, value: T) -> Option<T> {
        struct Replace<T> {
            new: Option<Box<T>>,
            old: Option<Box<T>>,
        }

        impl<T> RcuWriter<T> for Replace<T> {
            fn while_readers_exist(&mut self, write: &mut WriteRef<'_, T>) {
                if let Some(new) = self.new.take() {
                    write.publish(new);
                }
            }

            fn teardown(&mut self, retired: Option<Box<T>>) {
                self.old = retired;
            }
        }

        let mut writer = Replace {
            new: Some(Box::new(value)),
            old: None,
        };
        self.write(&mut writer);
        writer.old.map(|old| *old)
    }

    /// Exclusive access; no readers can exist.
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: `&mut self` excludes readers and writers.
        unsafe { &mut *self.value.load(Ordering::Relaxed) }
    }
}

impl<T: Default> Default for RcuProtected<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Drop for RcuProtected<T> {
    fn drop(&mut self) {
        let value = *self.value.get_mut();
        // SAFETY: sole owner; the pointer came from `Box::into_raw`.
        drop(unsafe { Box::from_raw(value) });
    }
}

/// A read-side critical section. Derefs to the protected value.
pub struct ReadGuard<'a, T> {
    value: NonNull<T>,
    generation: &'a Generation,
    _marker: PhantomData<&'a T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: kept alive by our generation count.
        unsafe { self.value.as_ref() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.generation.exit();
    }
}

/// Writer-side handle passed to [`RcuWriter::while_readers_exist`].
pub struct WriteRef<'a, T> {
    protected: &'a RcuProtected<T>,
    next: usize,
    retired: Option<NonNull<T>>,
}

impl<T> WriteRef<'_, T> {
    /// The value readers currently see.
    pub fn current(&self) -> &T {
        // SAFETY: we hold the writer lock, so nobody else can retire it.
        unsafe { &*self.protected.value.load(Ordering::SeqCst) }
    }

    /// The value replaced by [`publish`](Self::publish), until teardown.
    pub fn retired(&self) -> Option<&T> {
        // SAFETY: retired values are only freed after the write completes.
        self.retired.map(|ptr| unsafe { &*ptr.as_ptr() })
    }

    pub fn is_published(&self) -> bool {
        self.retired.is_some()
    }

    /// Make `new` visible to readers.
    ///
    /// Only one publication is allowed per write; a second call drops
    /// `new` unpublished and returns false.
    pub fn publish(&mut self, new: Box<T>) -> bool {
        if self.retired.is_some() {
            error!("rcu: second publish within one write ignored");
            return false;
        }
        let old = self.protected.value.swap(Box::into_raw(new), Ordering::SeqCst);
        self.protected.active.store(self.next, Ordering::SeqCst);
        self.retired = NonNull::new(old);
        true
    }
}

/// Callbacks of one RCU write.
pub trait RcuWriter<T> {
    /// Called under the writer lock before anything changes.
    fn setup(&mut self, _current: &T) {}

    /// Build the new version and publish it.
    fn while_readers_exist(&mut self, write: &mut WriteRef<'_, T>);

    /// Every reader of the old version has left.
    fn after_readers_done(&mut self, _write: &WriteRef<'_, T>) {}

    /// Outside the lock. Dropping `retired` frees the old version.
    fn teardown(&mut self, retired: Option<Box<T>>) {
        drop(retired);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_initial_value() {
        let rcu = RcuProtected::new(7u32);
        assert_eq!(rcu.read(|v| *v), 7);
    }

    #[test]
    fn test_update_visible_after_write() {
        let rcu = RcuProtected::new(0u32);
        rcu.update(|v| v + 1);
        assert_eq!(rcu.read(|v| *v), 1);
    }

    #[test]
    fn test_replace_returns_old() {
        let rcu = RcuProtected::new(alloc::vec![1, 2, 3]);
        let old = rcu.replace(alloc::vec![4]);
        assert_eq!(old, Some(alloc::vec![1, 2, 3]));
        assert_eq!(rcu.read(|v| v.len()), 1);
    }

    #[test]
    fn test_reader_keeps_old_version_until_dropped() {
        let rcu = RcuProtected::new(1u32);
        {
            let guard = rcu.read_guard();
            assert_eq!(*guard, 1);
        }
        rcu.update(|v| v * 10);
        assert_eq!(*rcu.read_guard(), 10);
    }

    #[test]
    fn test_writer_without_publish_keeps_value() {
        struct Noop;
        impl RcuWriter<u32> for Noop {
            fn while_readers_exist(&mut self, _write: &mut WriteRef<'_, u32>) {}
        }
        let rcu = RcuProtected::new(5u32);
        rcu.write(&mut Noop);
        rcu.write(&mut Noop);
        assert_eq!(rcu.read(|v| *v), 5);
        rcu.update(|v| v + 1);
        assert_eq!(rcu.read(|v| *v), 6);
    }

    #[test]
    fn test_second_publish_rejected() {
        struct Twice;
        impl RcuWriter<u32> for Twice {
            fn while_readers_exist(&mut self, write: &mut WriteRef<'_, u32>) {
                assert!(write.publish(Box::new(1)));
                assert!(!write.publish(Box::new(2)));
                assert_eq!(write.retired(), Some(&0));
            }
        }
        let rcu = RcuProtected::new(0u32);
        rcu.write(&mut Twice);
        assert_eq!(rcu.read(|v| *v), 1);
    }

    #[test]
    fn test_many_writes_alternate_generations() {
        let rcu = RcuProtected::new(0u64);
        for _ in 0..100 {
            rcu.update(|v| v + 1);
        }
        assert_eq!(rcu.read(|v| *v), 100);
    }
}
