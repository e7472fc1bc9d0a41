//! The scheduler
//!
//! One round-robin run queue over the fixed task table, driven from the
//! interrupt dispatcher. The switch protocol trades stack-pointer values:
//! the outgoing task's `rsp` (pointing at the frame the ISR tail just
//! pushed) is saved, the next Ready task's saved `rsp` is returned, and
//! the common tail restores from whichever stack it is handed.

use alloc::string::String;

use super::{
    queue::ReadyQueue,
    task::{KernelStack, Task, TaskId, TaskState, MAX_TASKS},
};
use crate::{
    arch::x86_64::context::SavedFrame,
    error::{KernelResult, SchedError},
    sync::SpinLock,
};

/// The task table plus scheduling state, all behind one spinlock.
pub struct TaskTable {
    pub tasks: [Task; MAX_TASKS],
    pub current: TaskId,
    queue: ReadyQueue,
}

pub static TASKS: SpinLock<TaskTable> = SpinLock::new(TaskTable::new());

impl TaskTable {
    pub const fn new() -> Self {
        Self {
            tasks: [const { Task::unused() }; MAX_TASKS],
            current: 0,
            queue: ReadyQueue::new(),
        }
    }

    /// Claim slot 0 for the boot flow, which doubles as the idle task.
    ///
    /// The idle task runs on the boot stack and never blocks; when the
    /// queue is empty the scheduler falls back to it.
    pub fn init_idle(&mut self) {
        let idle = &mut self.tasks[0];
        idle.state = TaskState::Running;
        idle.name = Some(String::from("idle"));
        idle.tgid = 0;
        self.current = 0;
    }

    /// Find a free slot (never slot 0, which belongs to idle).
    pub fn allocate_slot(&mut self) -> KernelResult<TaskId> {
        for (id, task) in self.tasks.iter().enumerate() {
            if id != 0 && task.state == TaskState::Unused {
                return Ok(id);
            }
        }
        Err(SchedError::TableFull.into())
    }

    /// Queue a Ready task for execution.
    pub fn enqueue_ready(&mut self, id: TaskId) {
        debug_assert_eq!(self.tasks[id].state, TaskState::Ready);
        self.queue.enqueue(&mut self.tasks, id);
    }

    /// Create a kernel task that starts at `entry`.
    ///
    /// The synthetic frame enters at kernel privilege with interrupts
    /// enabled; `exit_landing` catches an entry function that returns.
    pub fn create_kernel_task(
        &mut self,
        name: &str,
        entry: u64,
        exit_landing: u64,
    ) -> KernelResult<TaskId> {
        let id = self.allocate_slot()?;
        let task = &mut self.tasks[id];
        task.reset();
        task.name = Some(String::from(name));
        task.kernel_stack = Some(KernelStack::new());
        task.build_initial_frame(SavedFrame::new_kernel(entry, 0), exit_landing);
        task.tgid = id;
        task.parent = Some(self.current);
        task.state = TaskState::Ready;
        self.queue.enqueue(&mut self.tasks, id);
        Ok(id)
    }

    /// The switch protocol: save the outgoing `rsp`, rotate the queue,
    /// return the incoming task's saved `rsp`.
    pub fn schedule_from(&mut self, current_rsp: u64) -> u64 {
        let cur = self.current;
        self.tasks[cur].kernel_rsp = current_rsp;

        // A still-running task goes back to Ready and re-queues; blocked,
        // sleeping and terminated tasks keep their state and stay out.
        if self.tasks[cur].state == TaskState::Running {
            self.tasks[cur].state = TaskState::Ready;
            if cur != 0 {
                self.queue.enqueue(&mut self.tasks, cur);
            }
        }

        let next = match self.queue.dequeue_ready(&mut self.tasks) {
            Some(id) => id,
            // Nothing runnable: resume the idle task, or the current task
            // if it is still the only Ready one.
            None if self.tasks[cur].state == TaskState::Ready => cur,
            None => 0,
        };

        self.tasks[next].state = TaskState::Running;
        self.current = next;

        // Ring-0 stack for the next user-mode interrupt, and the address
        // space root if it differs from the active one.
        if let Some(stack) = &self.tasks[next].kernel_stack {
            crate::arch::x86_64::gdt::set_kernel_stack(stack.top());
        }
        let root = self.tasks[next]
            .address_space
            .as_ref()
            .map(|space| space.lock().root().as_u64())
            .unwrap_or_else(|| crate::mm::vas::kernel_root().as_u64());
        if root != 0 && root != crate::arch::x86_64::read_cr3() {
            crate::arch::x86_64::write_cr3(root);
        }

        self.tasks[next].kernel_rsp
    }

    /// Promote Sleeping tasks whose deadline has passed.
    pub fn wake_sleepers(&mut self, now: u64) {
        for id in 0..MAX_TASKS {
            if self.tasks[id].state == TaskState::Sleeping && self.tasks[id].wakeup_tick <= now {
                self.tasks[id].state = TaskState::Ready;
                self.queue.enqueue(&mut self.tasks, id);
            }
        }
    }

    /// Transition the current task to Sleeping until `deadline`.
    pub fn sleep_current_until(&mut self, deadline: u64) {
        let cur = self.current;
        self.tasks[cur].wakeup_tick = deadline;
        self.tasks[cur].state = TaskState::Sleeping;
    }

    /// Park a task: Running/Ready -> Blocked.
    pub fn mark_blocked(&mut self, id: TaskId) {
        match self.tasks[id].state {
            TaskState::Running | TaskState::Ready => {
                self.tasks[id].state = TaskState::Blocked;
            }
            _ => {}
        }
    }

    /// Wake a parked task: Blocked/Sleeping -> Ready.
    pub fn unblock(&mut self, id: TaskId) {
        match self.tasks[id].state {
            TaskState::Blocked | TaskState::Sleeping => {
                self.tasks[id].state = TaskState::Ready;
                self.queue.enqueue(&mut self.tasks, id);
            }
            _ => {}
        }
    }

    /// Runnable task count (diagnostic).
    pub fn ready_count(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_idle() -> alloc::boxed::Box<TaskTable> {
        let mut table = alloc::boxed::Box::new(TaskTable::new());
        table.init_idle();
        table
    }

    fn add_ready(table: &mut TaskTable, id: TaskId, rsp: u64) {
        let task = &mut table.tasks[id];
        task.state = TaskState::Ready;
        task.kernel_rsp = rsp;
        task.tgid = id;
        table.queue.enqueue(&mut table.tasks, id);
    }

    #[test]
    fn round_robin_rotates_through_ready_tasks() {
        let mut table = table_with_idle();
        add_ready(&mut table, 1, 0x1000);
        add_ready(&mut table, 2, 0x2000);

        // Idle is interrupted; task 1 takes over.
        assert_eq!(table.schedule_from(0x0AAA), 0x1000);
        assert_eq!(table.current, 1);
        assert_eq!(table.tasks[1].state, TaskState::Running);

        // Task 1 preempted (its live rsp is saved), task 2 runs.
        assert_eq!(table.schedule_from(0x1008), 0x2000);
        assert_eq!(table.tasks[1].state, TaskState::Ready);

        // Rotation returns to task 1 at its updated frame.
        assert_eq!(table.schedule_from(0x2008), 0x1008);
    }

    #[test]
    fn blocked_task_is_not_rescheduled() {
        let mut table = table_with_idle();
        add_ready(&mut table, 1, 0x1000);
        assert_eq!(table.schedule_from(0x0AAA), 0x1000);

        table.mark_blocked(1);
        // Task 1 yields while blocked: falls back to idle.
        let idle_rsp = table.schedule_from(0x1008);
        assert_eq!(table.current, 0);
        assert_eq!(idle_rsp, 0x0AAA);

        // Unblock makes it runnable again.
        table.unblock(1);
        assert_eq!(table.schedule_from(idle_rsp), 0x1008);
    }

    #[test]
    fn sleepers_wake_at_their_deadline_only() {
        let mut table = table_with_idle();
        add_ready(&mut table, 1, 0x1000);
        assert_eq!(table.schedule_from(0x0AAA), 0x1000);

        table.sleep_current_until(10);
        table.schedule_from(0x1008);
        assert_eq!(table.tasks[1].state, TaskState::Sleeping);

        table.wake_sleepers(9);
        assert_eq!(table.tasks[1].state, TaskState::Sleeping);
        table.wake_sleepers(10);
        assert_eq!(table.tasks[1].state, TaskState::Ready);
    }

    #[test]
    fn terminated_task_never_returns_from_queue() {
        let mut table = table_with_idle();
        add_ready(&mut table, 1, 0x1000);
        add_ready(&mut table, 2, 0x2000);
        assert_eq!(table.schedule_from(0x0AAA), 0x1000);

        table.tasks[1].state = TaskState::Terminated;
        assert_eq!(table.schedule_from(0x1008), 0x2000);
        // Only task 2 rotates from here on.
        assert_eq!(table.schedule_from(0x2008), 0x2008);
        assert_eq!(table.current, 2);
    }

    #[test]
    fn create_kernel_task_slot_invariant() {
        let mut table = table_with_idle();
        let id = table
            .create_kernel_task("worker", 0xFFFF_8000_0010_0000, 0xFFFF_8000_0010_0100)
            .unwrap();
        let task = &table.tasks[id];
        assert_eq!(task.state, TaskState::Ready);
        assert!(task.kernel_stack.is_some());
        assert_ne!(task.kernel_rsp, 0);
        assert_eq!(task.tgid, id);
    }
}
