//! Signals
//!
//! Deliver-at-return model: `send` only sets a bit in the target's pending
//! mask (and unblocks it if parked); the dispatcher applies dispositions
//! just before an `iretq` back to user mode. Handler invocation parks the
//! interrupted frame on the user stack and resumes through a sigreturn
//! trampoline the user registered with sigaction.

use crate::{
    arch::x86_64::context::SavedFrame,
    error::{KernelError, KernelResult},
    mm::user_validation,
    sched::{self, TaskState, TASKS},
};

/// Number of signals.
pub const NSIG: usize = 64;

pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGQUIT: u32 = 3;
pub const SIGILL: u32 = 4;
pub const SIGABRT: u32 = 6;
pub const SIGFPE: u32 = 8;
pub const SIGKILL: u32 = 9;
pub const SIGUSR1: u32 = 10;
pub const SIGSEGV: u32 = 11;
pub const SIGUSR2: u32 = 12;
pub const SIGPIPE: u32 = 13;
pub const SIGTERM: u32 = 15;
pub const SIGCHLD: u32 = 17;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;

/// Per-signal disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigAction {
    Default,
    Ignore,
    /// User handler plus the sigreturn trampoline it returns through.
    Handler { handler: u64, restorer: u64 },
}

/// Disposition table, shared per thread group.
#[derive(Debug, Clone)]
pub struct SignalActions {
    actions: [SigAction; NSIG],
}

impl SignalActions {
    pub const fn new() -> Self {
        Self {
            actions: [SigAction::Default; NSIG],
        }
    }

    pub fn get(&self, sig: u32) -> SigAction {
        self.actions[sig as usize]
    }

    /// Install a disposition. SIGKILL and SIGSTOP may not be caught or
    /// ignored.
    pub fn set(&mut self, sig: u32, action: SigAction) -> KernelResult<SigAction> {
        if sig == 0 || sig as usize >= NSIG {
            return Err(KernelError::InvalidArgument {
                name: "signal",
                value: "out of range",
            });
        }
        if (sig == SIGKILL || sig == SIGSTOP) && action != SigAction::Default {
            return Err(KernelError::PermissionDenied {
                operation: "catch SIGKILL/SIGSTOP",
            });
        }
        let old = self.actions[sig as usize];
        self.actions[sig as usize] = action;
        Ok(old)
    }

    /// Reset every caught signal to default (exec).
    pub fn reset_for_exec(&mut self) {
        for action in self.actions.iter_mut() {
            if matches!(action, SigAction::Handler { .. }) {
                *action = SigAction::Default;
            }
        }
    }
}

impl Default for SignalActions {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the default disposition of `sig` is to ignore it.
fn default_ignores(sig: u32) -> bool {
    matches!(sig, SIGCHLD | SIGCONT)
}

/// Post `sig` to task `target`.
///
/// Sets the pending bit and unblocks the target if it is parked on an
/// interruptible wait; the signal itself is acted on when the target next
/// heads back to user mode.
pub fn send(target: sched::TaskId, sig: u32) -> KernelResult<()> {
    if sig == 0 || sig as usize >= NSIG {
        return Err(KernelError::InvalidArgument {
            name: "signal",
            value: "out of range",
        });
    }
    {
        let mut table = TASKS.lock();
        let task = table
            .tasks
            .get_mut(target)
            .ok_or(KernelError::TaskNotFound { id: target })?;
        match task.state {
            TaskState::Unused | TaskState::Terminated => {
                return Err(KernelError::TaskNotFound { id: target });
            }
            _ => {}
        }
        task.pending_signals |= 1u64 << sig;
    }
    // Outside the table lock: unblock re-acquires it.
    sched::unblock(target);
    Ok(())
}

/// Pending, unmasked signals of the current task.
///
/// SIGKILL and SIGSTOP never appear in the mask, so they are always
/// deliverable here.
pub fn pending_deliverable() -> u64 {
    let table = TASKS.lock();
    let task = &table.tasks[table.current];
    task.pending_signals & !task.signal_mask
}

/// Adjust the current task's signal mask; returns the old mask.
///
/// SIGKILL and SIGSTOP cannot be masked.
pub fn set_mask(how: MaskOp, bits: u64) -> u64 {
    let mut table = TASKS.lock();
    let cur = table.current;
    let task = &mut table.tasks[cur];
    let old = task.signal_mask;
    let bits = bits & !(1u64 << SIGKILL) & !(1u64 << SIGSTOP);
    task.signal_mask = match how {
        MaskOp::Block => old | bits,
        MaskOp::Unblock => old & !bits,
        MaskOp::Set => bits,
    };
    old
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskOp {
    Block,
    Unblock,
    Set,
}

/// Apply pending dispositions for the task owning `frame`, which is about
/// to resume in user mode.
///
/// Returns true when a signal terminated the task, in which case the
/// dispatcher must reschedule instead of resuming this frame.
pub fn deliver_pending(frame: &mut SavedFrame) -> bool {
    loop {
        let (sig, action) = {
            let mut table = TASKS.lock();
            let cur = table.current;
            let task = &mut table.tasks[cur];
            let deliverable = task.pending_signals & !task.signal_mask;
            if deliverable == 0 {
                return false;
            }
            let sig = deliverable.trailing_zeros();
            task.pending_signals &= !(1u64 << sig);

            let action = if sig == SIGKILL || sig == SIGSTOP {
                SigAction::Default
            } else {
                task.signal_actions
                    .as_ref()
                    .map(|a| a.lock().get(sig))
                    .unwrap_or(SigAction::Default)
            };
            (sig, action)
        };

        match action {
            SigAction::Ignore => continue,
            SigAction::Default if default_ignores(sig) => continue,
            SigAction::Default => {
                super::exit::terminate_current(sig);
                return true;
            }
            SigAction::Handler { handler, restorer } => {
                if push_handler_frame(frame, sig, handler, restorer).is_err() {
                    // Unwritable user stack: the task cannot catch anything.
                    super::exit::terminate_current(SIGSEGV);
                    return true;
                }
                // One handler at a time; the rest deliver at sigreturn.
                return false;
            }
        }
    }
}

/// Build the user-stack frame that runs `handler` and returns through the
/// sigreturn trampoline.
///
/// Layout (descending): interrupted SavedFrame copy, then the trampoline
/// address as the handler's return slot. The handler's `ret` lands in the
/// trampoline, which issues the sigreturn syscall with the user `rsp`
/// pointing back at the saved copy.
fn push_handler_frame(
    frame: &mut SavedFrame,
    sig: u32,
    handler: u64,
    restorer: u64,
) -> KernelResult<()> {
    let mut sp = frame.rsp;
    sp &= !0xF; // keep the user stack aligned

    sp -= SavedFrame::SIZE as u64;
    let saved_at = sp;
    let saved = *frame;
    let bytes = {
        // SAFETY: SavedFrame is repr(C) plain data; viewing it as bytes
        // for the user-stack copy is sound.
        unsafe {
            core::slice::from_raw_parts(
                (&saved as *const SavedFrame) as *const u8,
                SavedFrame::SIZE,
            )
        }
    };
    user_validation::copy_out(saved_at as usize, bytes)?;

    sp -= 8;
    user_validation::copy_out(sp as usize, &restorer.to_le_bytes())?;

    frame.rip = handler;
    frame.rdi = sig as u64;
    frame.rsp = sp;
    Ok(())
}

/// Restore the frame saved by handler delivery (the sigreturn syscall).
///
/// The trampoline invokes this with the user `rsp` pointing at the saved
/// copy. Privilege-sensitive fields are forced back to user-mode values,
/// so a forged frame cannot escalate.
pub fn sigreturn(frame: &mut SavedFrame) -> KernelResult<()> {
    let saved_at = frame.rsp as usize;
    let bytes = user_validation::copy_in(saved_at, SavedFrame::SIZE)?;
    // SAFETY: the buffer is exactly SavedFrame::SIZE bytes of plain data.
    let mut restored = unsafe { core::ptr::read(bytes.as_ptr() as *const SavedFrame) };
    restored.cs = crate::arch::x86_64::context::USER_CS;
    restored.ss = crate::arch::x86_64::context::USER_SS;
    restored.rflags = crate::arch::x86_64::context::RFLAGS_IF;
    *frame = restored;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_and_stop_cannot_be_caught() {
        let mut actions = SignalActions::new();
        assert!(actions
            .set(SIGKILL, SigAction::Ignore)
            .is_err());
        assert!(actions
            .set(
                SIGSTOP,
                SigAction::Handler {
                    handler: 0x1000,
                    restorer: 0x2000
                }
            )
            .is_err());
        // Re-setting default is allowed.
        assert!(actions.set(SIGKILL, SigAction::Default).is_ok());
    }

    #[test]
    fn exec_reset_clears_handlers_only() {
        let mut actions = SignalActions::new();
        actions
            .set(
                SIGUSR1,
                SigAction::Handler {
                    handler: 0x1000,
                    restorer: 0x2000,
                },
            )
            .unwrap();
        actions.set(SIGINT, SigAction::Ignore).unwrap();
        actions.reset_for_exec();
        assert_eq!(actions.get(SIGUSR1), SigAction::Default);
        assert_eq!(actions.get(SIGINT), SigAction::Ignore, "ignores survive exec");
    }

    #[test]
    fn default_disposition_split() {
        assert!(default_ignores(SIGCHLD));
        assert!(!default_ignores(SIGTERM));
    }
}
