//! Counting semaphores and the mutex built on them

use alloc::collections::VecDeque;

use super::spinlock::SpinLock;
use crate::sched::{self, TaskId};

struct SemState {
    count: isize,
    /// FIFO of parked task ids, woken head-first.
    waiters: VecDeque<TaskId>,
}

/// Counting semaphore.
///
/// `wait` decrements or parks the caller on a FIFO; `post` increments and
/// wakes the head waiter, which re-checks the count when it runs.
pub struct Semaphore {
    state: SpinLock<SemState>,
}

impl Semaphore {
    pub const fn new(initial: isize) -> Self {
        Self {
            state: SpinLock::new(SemState {
                count: initial,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Decrement the count, blocking while it is zero.
    pub fn wait(&self) {
        loop {
            {
                let mut state = self.state.lock();
                if state.count > 0 {
                    state.count -= 1;
                    return;
                }
                let id = sched::current_task_id();
                if !state.waiters.contains(&id) {
                    state.waiters.push_back(id);
                }
                // Block before the lock drops so a post cannot slip between
                // the check and the state transition.
                sched::mark_blocked(id);
            }
            sched::yield_now();
        }
    }

    /// Decrement the count without blocking.
    pub fn try_wait(&self) -> bool {
        let mut state = self.state.lock();
        if state.count > 0 {
            state.count -= 1;
            true
        } else {
            false
        }
    }

    /// Increment the count and wake the head waiter, if any.
    pub fn post(&self) {
        let woken = {
            let mut state = self.state.lock();
            state.count += 1;
            state.waiters.pop_front()
        };
        if let Some(id) = woken {
            sched::unblock(id);
        }
    }

    /// Current count (diagnostic).
    pub fn count(&self) -> isize {
        self.state.lock().count
    }
}

/// Binary semaphore with the owning task recorded for debugging.
pub struct Mutex {
    sem: Semaphore,
    owner: SpinLock<Option<TaskId>>,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            sem: Semaphore::new(1),
            owner: SpinLock::new(None),
        }
    }

    pub fn lock(&self) {
        self.sem.wait();
        *self.owner.lock() = Some(sched::current_task_id());
    }

    pub fn try_lock(&self) -> bool {
        if self.sem.try_wait() {
            *self.owner.lock() = Some(sched::current_task_id());
            true
        } else {
            false
        }
    }

    pub fn unlock(&self) {
        *self.owner.lock() = None;
        self.sem.post();
    }

    /// Task currently holding the mutex, if any (diagnostic).
    pub fn owner(&self) -> Option<TaskId> {
        *self.owner.lock()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_wait_consumes_and_post_replenishes() {
        let sem = Semaphore::new(2);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());

        sem.post();
        assert_eq!(sem.count(), 1);
        assert!(sem.try_wait());
    }

    #[test]
    fn mutex_tracks_owner() {
        let mutex = Mutex::new();
        assert!(mutex.try_lock());
        assert!(mutex.owner().is_some());
        assert!(!mutex.try_lock());
        mutex.unlock();
        assert!(mutex.owner().is_none());
        assert!(mutex.try_lock());
    }
}
