//! Process duplication
//!
//! Fork clones the caller's register frame (the child sees 0 in the
//! return slot), COW-clones the address space, and copies the descriptor
//! table. The child lands in its own slot, Ready, and resumes in user
//! mode at the same instruction as the parent.

use alloc::{
    string::String,
    sync::Arc,
};

use crate::{
    arch::x86_64::context::SavedFrame,
    error::{KernelError, KernelResult},
    sched::{
        task::{KernelStack, TaskState},
        TaskId, TASKS,
    },
    sync::SpinLock,
};

/// Fork the current (user) task. Returns the child id to the parent.
pub fn fork_current(parent_frame: &SavedFrame) -> KernelResult<TaskId> {
    // Snapshot the parent's shared resources under a short table lock.
    let (parent_id, name, space, fds, actions) = {
        let table = TASKS.lock();
        let cur = table.current;
        let task = &table.tasks[cur];
        (
            cur,
            task.name.clone(),
            task.address_space.clone(),
            task.fd_table.clone(),
            task.signal_actions.clone(),
        )
    };

    let space = space.ok_or(KernelError::InvalidState {
        expected: "user task",
        actual: "kernel task",
    })?;

    // COW-clone outside the table lock; this is the expensive part and may
    // fault in frame allocations.
    let child_space = {
        let mut parent_space = space.lock();
        parent_space.fork()?
    };
    let child_space = Arc::new(SpinLock::new(child_space));

    let child_fds = fds.map(|fds| {
        let copy = fds.lock().clone();
        Arc::new(SpinLock::new(copy))
    });
    let child_actions = actions.map(|actions| {
        let copy = actions.lock().clone();
        Arc::new(SpinLock::new(copy))
    });

    // Prepare the child's frame: identical to the parent's, but the
    // syscall return slot reads zero.
    let mut child_frame = *parent_frame;
    child_frame.rax = 0;

    let mut table = TASKS.lock();
    let id = table.allocate_slot()?;
    let task = &mut table.tasks[id];
    task.reset();
    task.name = name.or_else(|| Some(String::from("forked")));
    task.kernel_stack = Some(KernelStack::new());
    task.build_initial_frame(child_frame, 0);
    task.address_space = Some(child_space);
    task.fd_table = child_fds;
    task.signal_actions = child_actions;
    task.parent = Some(parent_id);
    task.tgid = id;
    task.state = TaskState::Ready;
    table.enqueue_ready(id);

    log::debug!("fork: task {} -> child {}", parent_id, id);
    Ok(id)
}
