//! Single-slot waiter
//!
//! Every blockable resource stores one of these: a parking spot for the
//! single task currently blocked on it. A wake that lands before the park
//! leaves a token behind, so the late parker observes it and returns
//! without blocking; both sides run under the slot's spinlock with
//! interrupts off, which is what makes the ordering sound.

use super::spinlock::SpinLock;
use crate::sched::{self, TaskId};

struct SlotState {
    parked: Option<TaskId>,
    /// A wake arrived with nobody parked.
    pending: bool,
}

pub struct WaitSlot {
    state: SpinLock<SlotState>,
}

impl WaitSlot {
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(SlotState {
                parked: None,
                pending: false,
            }),
        }
    }

    /// Park the calling task until the next wake.
    ///
    /// Consumes an already-delivered wake immediately.
    pub fn wait(&self) {
        {
            let mut state = self.state.lock();
            if state.pending {
                state.pending = false;
                return;
            }
            let id = sched::current_task_id();
            state.parked = Some(id);
            sched::mark_blocked(id);
        }
        sched::yield_now();
    }

    /// Wake the parked task, or leave a token for the next parker.
    ///
    /// Safe from ISR context: touches only the slot and the run queue.
    pub fn wake(&self) -> bool {
        let woken = {
            let mut state = self.state.lock();
            match state.parked.take() {
                Some(id) => Some(id),
                None => {
                    state.pending = true;
                    None
                }
            }
        };
        match woken {
            Some(id) => {
                sched::unblock(id);
                true
            }
            None => false,
        }
    }

    /// Discard any parked task or pending token (resource teardown).
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.parked = None;
        state.pending = false;
    }

    /// Task id currently parked here, if any.
    pub fn parked(&self) -> Option<TaskId> {
        self.state.lock().parked
    }
}

impl Default for WaitSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_before_park_leaves_token() {
        let slot = WaitSlot::new();
        assert!(!slot.wake(), "no parker yet");
        // The token makes the next wait return immediately.
        slot.wait();
        // Token consumed: a second wake has nobody to wake again.
        assert!(!slot.wake());
    }

    #[test]
    fn clear_discards_pending_token() {
        let slot = WaitSlot::new();
        slot.wake();
        slot.clear();
        assert!(slot.parked().is_none());
    }
}
