//! The per-store reader-writer lock: an explicit three-state machine
//! (`Unlocked`, `Reading`, `Writing`) with per-thread read counts, owner
//! reentrancy, and a first-class read-to-write upgrade.

use std::collections::HashMap;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

enum LockState {
    Unlocked,
    Reading { threads: HashMap<ThreadId, usize> },
    Writing { thread: ThreadId, depth: usize },
}

pub struct DataLock {
    name: String,
    state: Mutex<LockState>,
    released: Condvar,
}

impl DataLock {
    pub fn new(name: &str) -> DataLock {
        DataLock {
            name: name.to_owned(),
            state: Mutex::new(LockState::Unlocked),
            released: Condvar::new(),
        }
    }

    /// Take (or re-enter) the read lock. A thread holding the write lock
    /// re-enters reads as a no-op.
    pub fn begin_read(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match &mut *state {
                LockState::Unlocked => {
                    let mut threads = HashMap::new();
                    threads.insert(me, 1);
                    *state = LockState::Reading { threads };
                    return;
                }
                LockState::Reading { threads } => {
                    *threads.entry(me).or_insert(0) += 1;
                    return;
                }
                LockState::Writing { thread, .. } if *thread == me => return,
                LockState::Writing { .. } => self.released.wait(&mut state),
            }
        }
    }

    pub fn end_read(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match &mut *state {
            LockState::Writing { thread, .. } if *thread == me => {}
            LockState::Reading { threads } => {
                let count = threads
                    .get_mut(&me)
                    .unwrap_or_else(|| panic!("releasing the read lock of {} without holding it", self.name));
                *count -= 1;
                if *count == 0 {
                    threads.remove(&me);
                }
                if threads.is_empty() {
                    *state = LockState::Unlocked;
                    self.released.notify_all();
                }
            }
            _ => panic!("releasing the read lock of {} without holding it", self.name),
        }
    }

    /// Take (or re-enter) the write lock. A thread holding the read lock
    /// must use [`DataLock::upgrade`] instead.
    pub fn begin_write(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match &mut *state {
                LockState::Unlocked => {
                    *state = LockState::Writing { thread: me, depth: 1 };
                    return;
                }
                LockState::Writing { thread, depth } if *thread == me => {
                    *depth += 1;
                    return;
                }
                LockState::Reading { threads } if threads.contains_key(&me) => {
                    panic!(
                        "taking the write lock of {} while holding its read lock; upgrade instead",
                        self.name
                    );
                }
                _ => self.released.wait(&mut state),
            }
        }
    }

    pub fn end_write(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match &mut *state {
            LockState::Writing { thread, depth } if *thread == me => {
                *depth -= 1;
                if *depth == 0 {
                    *state = LockState::Unlocked;
                    self.released.notify_all();
                }
            }
            _ => panic!("releasing the write lock of {} without holding it", self.name),
        }
    }

    /// Trade this thread's read hold for the write lock, waiting for the
    /// other readers to drain. While the writer is installed no thread holds
    /// the read lock. Returns the displaced read count, to be handed back to
    /// [`DataLock::downgrade`].
    pub fn upgrade(&self) -> usize {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let displaced = match &mut *state {
            LockState::Reading { threads } => {
                let displaced = threads.remove(&me).unwrap_or_else(|| {
                    panic!("upgrading the lock of {} without holding its read lock", self.name)
                });
                if threads.is_empty() {
                    *state = LockState::Unlocked;
                    self.released.notify_all();
                }
                displaced
            }
            _ => panic!(
                "upgrading the lock of {} without holding its read lock",
                self.name
            ),
        };
        // Fully released: if two readers upgrade at once, one wins the wait
        // below and the other follows after it downgrades.
        loop {
            match &mut *state {
                LockState::Unlocked => {
                    *state = LockState::Writing { thread: me, depth: 1 };
                    return displaced;
                }
                _ => self.released.wait(&mut state),
            }
        }
    }

    /// Give up the write lock taken by [`DataLock::upgrade`] and restore the
    /// displaced read count.
    pub fn downgrade(&self, displaced: usize) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match &*state {
            LockState::Writing { thread, depth } if *thread == me && *depth == 1 => {
                let mut threads = HashMap::new();
                threads.insert(me, displaced);
                *state = LockState::Reading { threads };
                self.released.notify_all();
            }
            _ => panic!(
                "downgrading the lock of {} without exclusively holding its write lock",
                self.name
            ),
        }
    }

    pub fn has_read_lock(&self) -> bool {
        let me = thread::current().id();
        match &*self.state.lock() {
            LockState::Reading { threads } => threads.contains_key(&me),
            LockState::Writing { thread, .. } => *thread == me,
            LockState::Unlocked => false,
        }
    }

    pub fn has_write_lock(&self) -> bool {
        let me = thread::current().id();
        matches!(&*self.state.lock(), LockState::Writing { thread, .. } if *thread == me)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn read_is_reentrant_per_thread() {
        let lock = DataLock::new("test");
        lock.begin_read();
        lock.begin_read();
        assert!(lock.has_read_lock());
        lock.end_read();
        assert!(lock.has_read_lock());
        lock.end_read();
        assert!(!lock.has_read_lock());
    }

    #[test]
    fn writer_reenters_everything() {
        let lock = DataLock::new("test");
        lock.begin_write();
        lock.begin_write();
        lock.begin_read();
        assert!(lock.has_read_lock());
        assert!(lock.has_write_lock());
        lock.end_read();
        lock.end_write();
        assert!(lock.has_write_lock());
        lock.end_write();
        assert!(!lock.has_write_lock());
    }

    #[test]
    fn upgrade_round_trip() {
        let lock = DataLock::new("test");
        lock.begin_read();
        lock.begin_read();
        let displaced = lock.upgrade();
        assert_eq!(displaced, 2);
        assert!(lock.has_write_lock());
        lock.downgrade(displaced);
        assert!(lock.has_read_lock());
        assert!(!lock.has_write_lock());
        lock.end_read();
        lock.end_read();
    }

    #[test]
    fn readers_share_writers_exclude() {
        let lock = Arc::new(DataLock::new("test"));
        lock.begin_read();

        let shared = lock.clone();
        let reader = std::thread::spawn(move || {
            shared.begin_read();
            shared.end_read();
        });
        reader.join().unwrap();

        let shared = lock.clone();
        let writer = std::thread::spawn(move || {
            shared.begin_write();
            shared.end_write();
        });
        // The writer must block until the read lock is gone.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());
        lock.end_read();
        writer.join().unwrap();
    }
}
