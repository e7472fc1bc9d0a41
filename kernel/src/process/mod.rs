//! Process management
//!
//! Fork, exec, exit/wait, threads, signals and the descriptor table: the
//! lifecycle operations layered over the scheduler's task table.

pub mod exec;
pub mod exit;
pub mod fd;
pub mod fork;
pub mod loader;
pub mod signal;
pub mod thread;

use alloc::sync::Arc;

use crate::{mm::vas::AddressSpace, sched::TASKS, sync::SpinLock};

/// The current task's address space, if it has a user half.
pub fn current_address_space() -> Option<Arc<SpinLock<AddressSpace>>> {
    let table = TASKS.lock();
    table.tasks[table.current].address_space.clone()
}

/// The current task's thread-group id.
pub fn current_tgid() -> crate::sched::TaskId {
    let table = TASKS.lock();
    table.tasks[table.current].tgid
}

/// The current task's descriptor table.
pub fn current_fd_table() -> Option<Arc<SpinLock<fd::FdTable>>> {
    let table = TASKS.lock();
    table.tasks[table.current].fd_table.clone()
}
