//! Threads
//!
//! A thread is a task sharing its creator's address space, descriptor
//! table, dispositions and thread-group id. The only thread-local state is
//! the kernel stack, the register frame and the signal mask. A thread may
//! register a clear-tid address: at exit the kernel zeroes that user word
//! and wakes the futex on it, which is what join waits on.

use alloc::string::String;

use crate::{
    arch::x86_64::context::SavedFrame,
    error::{KernelError, KernelResult},
    sched::{
        task::{KernelStack, TaskState},
        TaskId, TASKS,
    },
    sync::{SpinLock, WaitSlot},
};

/// Create a thread in the caller's group.
///
/// The new task enters user mode at `entry` with `arg` in the first
/// argument register and `user_stack_top` as its stack. `clear_tid`, when
/// nonzero, is the user address zeroed and futex-woken at exit.
pub fn create_thread(
    entry: u64,
    arg: u64,
    user_stack_top: u64,
    clear_tid: u64,
) -> KernelResult<TaskId> {
    let mut table = TASKS.lock();
    let cur = table.current;

    let (space, fds, actions, tgid, name) = {
        let task = &table.tasks[cur];
        if task.address_space.is_none() {
            return Err(KernelError::InvalidState {
                expected: "user task",
                actual: "kernel task",
            });
        }
        (
            task.address_space.clone(),
            task.fd_table.clone(),
            task.signal_actions.clone(),
            task.tgid,
            task.name.clone(),
        )
    };

    let id = table.allocate_slot()?;
    let task = &mut table.tasks[id];
    task.reset();
    task.name = name.or_else(|| Some(String::from("thread")));
    task.kernel_stack = Some(KernelStack::new());

    let mut frame = SavedFrame::new_user(entry, user_stack_top);
    frame.rdi = arg;
    task.build_initial_frame(frame, 0);

    task.address_space = space;
    task.fd_table = fds;
    task.signal_actions = actions;
    task.parent = Some(cur);
    task.tgid = tgid;
    task.clear_child_tid = clear_tid;
    task.state = TaskState::Ready;
    table.enqueue_ready(id);

    log::debug!("thread {} created in group {}", id, tgid);
    Ok(id)
}

// ---------------------------------------------------------------------------
// Minimal futex: enough for clear-tid join
// ---------------------------------------------------------------------------

const FUTEX_SLOTS: usize = 16;

struct FutexEntry {
    addr: u64,
    waiters: usize,
}

/// Address registry; the parking itself happens on the paired WaitSlot.
static FUTEX_ADDRS: SpinLock<[FutexEntry; FUTEX_SLOTS]> =
    SpinLock::new([const { FutexEntry { addr: 0, waiters: 0 } }; FUTEX_SLOTS]);

static FUTEX_WAIT: [WaitSlot; FUTEX_SLOTS] = [const { WaitSlot::new() }; FUTEX_SLOTS];

/// Block until someone wakes the futex word at `addr`.
///
/// The caller re-checks the word's value; this primitive only parks.
pub fn futex_wait(addr: u64) -> KernelResult<()> {
    let slot = {
        let mut entries = FUTEX_ADDRS.lock();
        let slot = entries
            .iter()
            .position(|e| e.addr == addr)
            .or_else(|| entries.iter().position(|e| e.waiters == 0))
            .ok_or(KernelError::ResourceExhausted {
                resource: "futex slots",
            })?;
        entries[slot].addr = addr;
        entries[slot].waiters += 1;
        slot
    };

    FUTEX_WAIT[slot].wait();

    let mut entries = FUTEX_ADDRS.lock();
    entries[slot].waiters = entries[slot].waiters.saturating_sub(1);
    if entries[slot].waiters == 0 {
        entries[slot].addr = 0;
    }
    Ok(())
}

/// Wake a waiter parked on the futex word at `addr`, if any.
pub fn futex_wake(addr: u64) -> bool {
    let slot = {
        let entries = FUTEX_ADDRS.lock();
        entries
            .iter()
            .position(|e| e.addr == addr && e.waiters > 0)
    };
    match slot {
        Some(slot) => FUTEX_WAIT[slot].wake(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn futex_wake_without_waiter_is_a_noop() {
        assert!(!futex_wake(0xDEAD_0000));
    }
}
