//! Task table entries
//!
//! Tasks are identified by their slot index in a fixed table. Intra-table
//! references (run-queue links, parents) are indices, never pointers, so
//! the table can live in a plain static.

use alloc::{boxed::Box, string::String, sync::Arc};

use crate::{
    arch::x86_64::context::SavedFrame,
    mm::vas::AddressSpace,
    process::{fd::FdTable, signal::SignalActions},
    sync::SpinLock,
};

/// Task identifier: a dense slot index.
pub type TaskId = usize;

/// Size of the fixed task table.
pub const MAX_TASKS: usize = 64;

/// Size of each task's kernel stack.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Unused,
    Ready,
    Running,
    Sleeping,
    Blocked,
    Terminated,
}

/// A task's owned kernel stack, 16-byte aligned for the ABI.
#[repr(C, align(16))]
pub struct KernelStack(pub [u8; KERNEL_STACK_SIZE]);

impl KernelStack {
    pub fn new() -> Box<Self> {
        // Zeroed allocation; the synthetic frame is written afterwards.
        Box::new(Self([0; KERNEL_STACK_SIZE]))
    }

    /// Highest usable address of the stack.
    pub fn top(&self) -> u64 {
        self.0.as_ptr() as u64 + KERNEL_STACK_SIZE as u64
    }
}

/// One slot in the task table.
pub struct Task {
    pub state: TaskState,
    pub name: Option<String>,
    /// Saved kernel stack pointer; the register frame lives on the stack
    /// behind it once the task has been switched away from.
    pub kernel_rsp: u64,
    /// Owned kernel stack; exclusively this task's, freed at reap.
    pub kernel_stack: Option<Box<KernelStack>>,
    /// User address space, shared with thread-group peers. `None` means
    /// the task runs on the kernel root.
    pub address_space: Option<Arc<SpinLock<AddressSpace>>>,
    /// File descriptor table, shared per thread group.
    pub fd_table: Option<Arc<SpinLock<FdTable>>>,
    /// Per-signal dispositions, shared per thread group.
    pub signal_actions: Option<Arc<SpinLock<SignalActions>>>,
    pub parent: Option<TaskId>,
    /// Thread-group id: the id of the group leader.
    pub tgid: TaskId,
    /// Encoded wait status once Terminated.
    pub exit_status: i32,
    /// Pending-signal bitmask.
    pub pending_signals: u64,
    /// Blocked-signal mask (sigprocmask).
    pub signal_mask: u64,
    /// Tick at which a Sleeping task becomes Ready.
    pub wakeup_tick: u64,
    /// Run-queue link: index of the next queued task.
    pub queue_next: Option<TaskId>,
    /// Guards against double-enqueue.
    pub queued: bool,
    /// User address zeroed and futex-woken at exit, or 0.
    pub clear_child_tid: u64,
}

impl Task {
    pub const fn unused() -> Self {
        Self {
            state: TaskState::Unused,
            name: None,
            kernel_rsp: 0,
            kernel_stack: None,
            address_space: None,
            fd_table: None,
            signal_actions: None,
            parent: None,
            tgid: 0,
            exit_status: 0,
            pending_signals: 0,
            signal_mask: 0,
            wakeup_tick: 0,
            queue_next: None,
            queued: false,
            clear_child_tid: 0,
        }
    }

    /// Reset a slot to Unused, dropping everything it owned.
    pub fn reset(&mut self) {
        *self = Self::unused();
    }

    /// Write a synthetic first frame onto this task's kernel stack.
    ///
    /// The first switch into the task pops the frame and `iretq`s into
    /// `frame.rip`. A return address pointing at `exit_landing` sits above
    /// the frame so a kernel entry function that returns falls into exit.
    pub fn build_initial_frame(&mut self, mut frame: SavedFrame, exit_landing: u64) {
        let stack = self
            .kernel_stack
            .as_ref()
            .expect("building a frame requires a stack");
        let mut top = stack.top();

        if frame.cs & 0x3 == 0 {
            // Kernel task: plant the exit landing as the entry's return
            // address and run on this stack.
            top -= 8;
            // SAFETY: top is within the owned kernel stack allocation.
            unsafe {
                core::ptr::write(top as *mut u64, exit_landing);
            }
            frame.rsp = top;
        }

        let frame_addr = top - SavedFrame::SIZE as u64;
        // SAFETY: the frame lies within the owned kernel stack allocation.
        unsafe {
            core::ptr::write(frame_addr as *mut SavedFrame, frame);
        }
        self.kernel_rsp = frame_addr;
    }

    /// Saved frame on this task's kernel stack.
    ///
    /// Valid only while the task is switched away from (its `kernel_rsp`
    /// points at a frame the dispatcher wrote).
    pub fn saved_frame_mut(&mut self) -> &mut SavedFrame {
        debug_assert!(self.kernel_rsp != 0);
        // SAFETY: kernel_rsp points at the SavedFrame most recently pushed
        // on this task's own stack, which we own.
        unsafe { &mut *(self.kernel_rsp as *mut SavedFrame) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::context::SavedFrame;

    #[test]
    fn unused_slot_has_no_stack() {
        let task = Task::unused();
        assert_eq!(task.state, TaskState::Unused);
        assert!(task.kernel_stack.is_none());
        assert_eq!(task.kernel_rsp, 0);
    }

    #[test]
    fn initial_kernel_frame_lands_below_exit_slot() {
        let mut task = Task::unused();
        task.kernel_stack = Some(KernelStack::new());
        let top = task.kernel_stack.as_ref().unwrap().top();

        task.build_initial_frame(SavedFrame::new_kernel(0xDEAD_B000, 0), 0xC0DE);

        // One word for the exit landing, then the frame.
        assert_eq!(task.kernel_rsp, top - 8 - SavedFrame::SIZE as u64);
        let frame = task.saved_frame_mut();
        assert_eq!(frame.rip, 0xDEAD_B000);
        assert_eq!(frame.rsp, top - 8);
        // SAFETY: reads back the word just planted within the owned stack.
        let landing = unsafe { core::ptr::read(frame.rsp as *const u64) };
        assert_eq!(landing, 0xC0DE);
    }

    #[test]
    fn initial_user_frame_keeps_user_stack() {
        let mut task = Task::unused();
        task.kernel_stack = Some(KernelStack::new());
        let top = task.kernel_stack.as_ref().unwrap().top();

        task.build_initial_frame(SavedFrame::new_user(0x40_0000, 0x7FFF_0000), 0xC0DE);

        assert_eq!(task.kernel_rsp, top - SavedFrame::SIZE as u64);
        let frame = task.saved_frame_mut();
        assert_eq!(frame.rsp, 0x7FFF_0000, "user rsp untouched");
        assert!(frame.from_user());
    }
}
