//! Task exit and reaping
//!
//! Exit marks the slot Terminated and wakes a waiting parent; the slot,
//! kernel stack and shared resources are reclaimed only when the parent
//! reaps it through wait. The last thread of a group drops the final
//! reference to the shared address space.

use alloc::sync::Arc;

use crate::{
    error::{KernelError, KernelResult},
    mm::user_validation,
    sched::{self, TaskId, TaskState, CHILD_WAIT, MAX_TASKS, TASKS},
};

/// Encode an exit(code) wait status.
pub fn encode_exited(code: i32) -> i32 {
    (code & 0xFF) << 8
}

/// Encode a killed-by-signal wait status.
pub fn encode_signaled(sig: u32) -> i32 {
    (sig & 0x7F) as i32
}

/// Whether a wait status means "killed by a signal".
pub fn status_signal(status: i32) -> Option<u32> {
    let sig = (status & 0x7F) as u32;
    if sig != 0 {
        Some(sig)
    } else {
        None
    }
}

/// Terminate the current task with an encoded status.
///
/// Shared resources are released here; the slot itself survives until the
/// parent reaps it. Callable from dispatcher context: it does not yield.
fn do_exit(status: i32) {
    // clear_tid_at_exit first: the user word must be written while this
    // task's address space is still mapped and active.
    let tid_addr = {
        let mut table = TASKS.lock();
        let cur = table.current;
        core::mem::take(&mut table.tasks[cur].clear_child_tid)
    };
    if tid_addr != 0 {
        let _ = user_validation::copy_out(tid_addr as usize, &0u32.to_le_bytes());
        super::thread::futex_wake(tid_addr);
    }

    let (parent, space, fds) = {
        let mut table = TASKS.lock();
        let cur = table.current;
        let task = &mut table.tasks[cur];

        task.exit_status = status;
        task.state = TaskState::Terminated;

        // Take shared resources out of the slot; they drop below, outside
        // the table lock.
        (task.parent, task.address_space.take(), task.fd_table.take())
    };

    // The active root may be about to die with the last Arc; run the rest
    // of teardown on the kernel root.
    crate::arch::x86_64::write_cr3(crate::mm::vas::kernel_root().as_u64());

    if let Some(fds) = fds {
        if let Some(fds) = Arc::into_inner(fds) {
            // Last holder: close any sockets still open.
            let fds = fds.lock();
            for handle in fds.sockets() {
                let _ = crate::net::socket::close(handle);
            }
        }
    }
    drop(space);

    if let Some(parent) = parent {
        CHILD_WAIT[parent].wake();
    }
}

/// Exit the current task from syscall context. Never returns.
pub fn exit_current(code: i32) -> ! {
    do_exit(encode_exited(code));
    loop {
        sched::yield_now();
    }
}

/// Terminate the current task from dispatcher context (fault or fatal
/// signal). The caller reschedules; this does not yield.
pub fn terminate_current(sig: u32) {
    do_exit(encode_signaled(sig));
}

/// Which children a wait call matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    AnyChild,
    Child(TaskId),
}

/// Block until a matching child terminates, then reap it.
///
/// Reaping frees the kernel stack, harvests the encoded status and
/// returns the slot to Unused. Interrupted by signal delivery.
pub fn wait_for_child(target: WaitTarget) -> KernelResult<(TaskId, i32)> {
    let me = sched::current_task_id();
    loop {
        {
            let mut table = TASKS.lock();
            let mut have_candidate = false;

            for id in 0..MAX_TASKS {
                let task = &table.tasks[id];
                if task.parent != Some(me) || task.state == TaskState::Unused {
                    continue;
                }
                if let WaitTarget::Child(want) = target {
                    if id != want {
                        continue;
                    }
                }
                have_candidate = true;

                if task.state == TaskState::Terminated {
                    let status = task.exit_status;
                    reap(&mut table, id);
                    drop(table);
                    // Outside the table lock: the waiter slot has its own
                    // lock and is always taken first elsewhere.
                    CHILD_WAIT[id].clear();
                    return Ok((id, status));
                }
            }

            if !have_candidate {
                return Err(KernelError::NoChildren);
            }
        }

        if super::signal::pending_deliverable() != 0 {
            return Err(KernelError::Interrupted);
        }
        CHILD_WAIT[me].wait();
    }
}

/// Reclaim a Terminated slot: free the stack, orphan its children, reset
/// to Unused. The caller clears the slot's child waiter after the table
/// lock drops.
fn reap(table: &mut sched::TaskTable, id: TaskId) {
    debug_assert_eq!(table.tasks[id].state, TaskState::Terminated);

    // Grandchildren are inherited by the idle task so a later wait on
    // them does not dangle.
    for other in 0..MAX_TASKS {
        if table.tasks[other].parent == Some(id) {
            table.tasks[other].parent = Some(0);
        }
    }

    table.tasks[id].reset();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_encoding_round_trip() {
        assert_eq!(encode_exited(0), 0);
        assert_eq!(encode_exited(3), 0x300);
        assert_eq!(status_signal(encode_exited(3)), None);
        assert_eq!(status_signal(encode_signaled(9)), Some(9));
        assert_eq!(status_signal(encode_signaled(11)), Some(11));
    }
}
