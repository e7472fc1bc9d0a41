//! Preemptive task scheduling
//!
//! Public surface over the task table: creation, the timer tick, sleeping,
//! blocking and the dispatcher entry point. Preemption is driven solely by
//! the timer interrupt; voluntary yields go through the yield vector so
//! every switch runs the same saved-frame protocol.

pub mod queue;
pub mod scheduler;
pub mod task;

use core::sync::atomic::{AtomicU64, Ordering};

pub use scheduler::{TaskTable, TASKS};
pub use task::{Task, TaskId, TaskState, KERNEL_STACK_SIZE, MAX_TASKS};

use crate::{error::KernelResult, sync::WaitSlot};

/// Monotonic tick counter, incremented by the timer interrupt.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Per-task parking slots for parents waiting on child exit.
///
/// Kept outside the task table so waking does not nest inside its lock.
pub static CHILD_WAIT: [WaitSlot; MAX_TASKS] = [const { WaitSlot::new() }; MAX_TASKS];

/// Current tick count.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Initialize the scheduler: the boot flow becomes the idle task.
pub fn init() {
    TASKS.lock().init_idle();
    log::info!("scheduler: idle task installed, {} slots", MAX_TASKS);
}

/// Timer interrupt body: advance the tick and wake due sleepers.
///
/// Runs in ISR context before the EOI; the subsequent schedule call picks
/// up anything this promoted to Ready.
pub fn timer_tick() {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    TASKS.lock().wake_sleepers(now);
}

/// Dispatcher entry: exchange the outgoing saved `rsp` for the next one.
pub fn schedule(current_rsp: u64) -> u64 {
    TASKS.lock().schedule_from(current_rsp)
}

/// Id of the task currently executing.
pub fn current_task_id() -> TaskId {
    TASKS.lock().current
}

/// Spawn a kernel task executing `entry`.
pub fn spawn_kernel(name: &str, entry: extern "C" fn()) -> KernelResult<TaskId> {
    let id = TASKS
        .lock()
        .create_kernel_task(name, entry as usize as u64, kernel_task_exit as usize as u64)?;
    log::debug!("spawned kernel task {} ({})", id, name);
    Ok(id)
}

/// Landing pad for kernel entry functions that return.
extern "C" fn kernel_task_exit() -> ! {
    crate::process::exit::exit_current(0)
}

/// Yield the CPU voluntarily.
pub fn yield_now() {
    crate::arch::yield_now();
}

/// Sleep for at least `ticks` timer periods.
pub fn sleep_ticks(ticks: u64) {
    let deadline = TICKS.load(Ordering::Relaxed) + ticks;
    TASKS.lock().sleep_current_until(deadline);
    yield_now();
}

/// Mark a task Blocked. Callers park via their resource's wait slot and
/// must yield afterwards.
pub fn mark_blocked(id: TaskId) {
    TASKS.lock().mark_blocked(id);
}

/// Make a blocked or sleeping task runnable.
pub fn unblock(id: TaskId) {
    TASKS.lock().unblock(id);
}
