//! Read-write spinlock, useful for short, latency-sensitive critical
//! sections such as a per-column mutex guarding `activateCoarse`.
//!
//! Blocking concurrency primitives can add latency. When the
//! rw-exclusion section is short, a latch-and-spin primitive avoids a
//! trip through the OS scheduler.
//!
//! Imagine a door leading into a room with two properties:
//! 1. A reader may enter only when the door is un-latched and un-locked.
//! 2. A writer may enter only when un-latched, un-locked, and the room
//!    is empty; once a writer latches the door, no new reader or writer
//!    may enter, but readers already inside may finish and leave.
//!
//! Callers spin until the relevant condition holds.

use std::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
    result,
    sync::atomic::{AtomicU32, Ordering::SeqCst},
};

pub struct Spinlock<T> {
    latchlock: AtomicU32,
    read_locks: AtomicU32,
    write_locks: AtomicU32,
    conflicts: AtomicU32,

    value: UnsafeCell<T>,
}

// Safety: `value` is only ever reached through a `ReadGuard`/`WriteGuard`
// obtained from `read()`/`write()`, which enforce the same mutual
// exclusion `latchlock` already arbitrates for `&Self` access across
// threads; a `Spinlock<T>` is safe to share across threads exactly when
// `T` is safe to send across them, same as `std::sync::Mutex<T>`.
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    const LATCH_FLAG: u32 = 0x4000_0000;
    const LOCK_FLAG: u32 = 0x8000_0000;
    const LATCH_LOCK_FLAG: u32 = 0xC000_0000;
    const READERS_FLAG: u32 = 0x3FFF_FFFF;

    pub fn new(value: T) -> Spinlock<T> {
        Spinlock {
            latchlock: AtomicU32::new(0),
            read_locks: AtomicU32::new(0),
            write_locks: AtomicU32::new(0),
            conflicts: AtomicU32::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire latch for read permission.
    pub fn read(&self) -> ReadGuard<T> {
        loop {
            let old = self.latchlock.load(SeqCst);
            if (old & Self::LATCH_LOCK_FLAG) == 0
                && self.latchlock.compare_exchange(old, old + 1, SeqCst, SeqCst).is_ok()
            {
                if cfg!(feature = "debug") {
                    self.read_locks.fetch_add(1, SeqCst);
                }
                break ReadGuard { door: self };
            }
            if cfg!(feature = "debug") {
                self.conflicts.fetch_add(1, SeqCst);
            }
        }
    }

    /// Acquire latch for write permission.
    pub fn write(&self) -> WriteGuard<T> {
        loop {
            let old = self.latchlock.load(SeqCst);
            if (old & Self::LATCH_FLAG) == 0 {
                let new = old | Self::LATCH_FLAG;
                if self.latchlock.compare_exchange(old, new, SeqCst, SeqCst).is_ok() {
                    break;
                }
            }
            if cfg!(feature = "debug") {
                self.conflicts.fetch_add(1, SeqCst);
            }
        }
        loop {
            let old = self.latchlock.load(SeqCst);
            if (old & Self::READERS_FLAG) == 0 {
                let new = old | Self::LOCK_FLAG;
                if self.latchlock.compare_exchange(old, new, SeqCst, SeqCst).is_ok() {
                    if cfg!(feature = "debug") {
                        self.write_locks.fetch_add(1, SeqCst);
                    }
                    break WriteGuard { door: self };
                }
            }
            if cfg!(feature = "debug") {
                self.conflicts.fetch_add(1, SeqCst);
            }
        }
    }

    pub fn stats(&self) -> Stats {
        Stats {
            latchlock: self.latchlock.load(SeqCst),
            read_locks: self.read_locks.load(SeqCst) as usize,
            write_locks: self.write_locks.load(SeqCst) as usize,
            conflicts: self.conflicts.load(SeqCst) as usize,
        }
    }
}

pub struct ReadGuard<'a, T> {
    door: &'a Spinlock<T>,
}

impl<'a, T> Deref for ReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: a ReadGuard exists only while `latchlock`'s LATCH_LOCK
        // bits are clear, which is exactly when no WriteGuard can exist.
        unsafe { &*self.door.value.get() }
    }
}

impl<'a, T> Drop for ReadGuard<'a, T> {
    fn drop(&mut self) {
        self.door.latchlock.fetch_sub(1, SeqCst);
    }
}

pub struct WriteGuard<'a, T> {
    door: &'a Spinlock<T>,
}

impl<'a, T> Deref for WriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: see DerefMut.
        unsafe { &*self.door.value.get() }
    }
}

impl<'a, T> DerefMut for WriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: a WriteGuard exists only while the LOCK bit is set,
        // which `write()` only sets once READERS_FLAG reads zero and no
        // other WriteGuard can be live, so this is the sole access path.
        unsafe { &mut *self.door.value.get() }
    }
}

impl<'a, T> Drop for WriteGuard<'a, T> {
    fn drop(&mut self) {
        self.door.latchlock.store(0, SeqCst);
    }
}

#[derive(Default)]
pub struct Stats {
    pub latchlock: u32,
    pub read_locks: usize,
    pub write_locks: usize,
    pub conflicts: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(
            f,
            "{{ latchlock = {:X}, read_locks = {}, write_locks = {}, conflicts = {} }}",
            self.latchlock, self.read_locks, self.write_locks, self.conflicts,
        )
    }
}

#[cfg(test)]
mod spinlock_test {
    use super::*;

    #[test]
    fn test_read_write() {
        let lock = Spinlock::new(10u64);
        {
            let r1 = lock.read();
            let r2 = lock.read();
            assert_eq!(*r1, 10);
            assert_eq!(*r2, 10);
        }
        {
            let mut w = lock.write();
            *w += 1;
        }
        assert_eq!(*lock.read(), 11);
    }
}
