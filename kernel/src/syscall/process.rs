//! Process-related syscalls

use alloc::{string::String, vec::Vec};

use super::SyscallArgs;
use crate::{
    arch::x86_64::context::SavedFrame,
    error::{KernelError, KernelResult},
    mm::user_validation,
    process::{exec, exit, fork, signal, thread},
    sched,
};

pub fn sys_exit(args: SyscallArgs) -> KernelResult<u64> {
    exit::exit_current(args.a0 as i32)
}

pub fn sys_fork(frame: &mut SavedFrame) -> KernelResult<u64> {
    fork::fork_current(frame).map(|id| id as u64)
}

/// execve(path, argv, envp): argv/envp are NULL-terminated arrays of
/// string pointers in user memory.
pub fn sys_execve(frame: &mut SavedFrame, args: SyscallArgs) -> KernelResult<u64> {
    let path = user_validation::copy_string_in(args.a0 as usize)?;
    let argv = copy_string_array(args.a1 as usize)?;
    let envp = copy_string_array(args.a2 as usize)?;
    exec::exec_current(frame, &path, &argv, &envp)?;
    Ok(0)
}

/// Read a NULL-terminated array of user string pointers.
fn copy_string_array(mut array_ptr: usize) -> KernelResult<Vec<String>> {
    const MAX_ARGS: usize = 64;
    let mut strings = Vec::new();
    if array_ptr == 0 {
        return Ok(strings);
    }
    for _ in 0..MAX_ARGS {
        let ptr_bytes = user_validation::copy_in(array_ptr, 8)?;
        let ptr = u64::from_le_bytes(ptr_bytes.try_into().expect("8-byte read"));
        if ptr == 0 {
            return Ok(strings);
        }
        strings.push(user_validation::copy_string_in(ptr as usize)?);
        array_ptr += 8;
    }
    Err(KernelError::InvalidArgument {
        name: "argv",
        value: "too many entries",
    })
}

/// waitpid(pid, status_ptr): pid 0 waits for any child. The encoded
/// status is written to `status_ptr` when non-null.
pub fn sys_waitpid(args: SyscallArgs) -> KernelResult<u64> {
    let target = if args.a0 == 0 {
        exit::WaitTarget::AnyChild
    } else {
        exit::WaitTarget::Child(args.a0 as usize)
    };
    let (id, status) = exit::wait_for_child(target)?;
    if args.a1 != 0 {
        user_validation::copy_out(args.a1 as usize, &status.to_le_bytes())?;
    }
    Ok(id as u64)
}

pub fn sys_kill(args: SyscallArgs) -> KernelResult<u64> {
    signal::send(args.a0 as usize, args.a1 as u32)?;
    Ok(0)
}

/// sigaction(sig, handler, restorer): handler 0 resets to default,
/// handler 1 ignores. Returns the previous handler address (0/1 for
/// default/ignore).
pub fn sys_sigaction(args: SyscallArgs) -> KernelResult<u64> {
    let sig = args.a0 as u32;
    let action = match args.a1 {
        0 => signal::SigAction::Default,
        1 => signal::SigAction::Ignore,
        handler => {
            if !user_validation::is_user_range(handler as usize, 1)
                || !user_validation::is_user_range(args.a2 as usize, 1)
            {
                return Err(KernelError::BadUserPointer {
                    addr: handler as usize,
                    len: 1,
                });
            }
            signal::SigAction::Handler {
                handler,
                restorer: args.a2,
            }
        }
    };

    let actions = {
        let table = sched::TASKS.lock();
        table.tasks[table.current].signal_actions.clone()
    }
    .ok_or(KernelError::InvalidState {
        expected: "user task",
        actual: "kernel task",
    })?;

    let old = actions.lock().set(sig, action)?;
    Ok(match old {
        signal::SigAction::Default => 0,
        signal::SigAction::Ignore => 1,
        signal::SigAction::Handler { handler, .. } => handler,
    })
}

/// sigprocmask(how, bits): how 0=block, 1=unblock, 2=set. Returns the old
/// mask.
pub fn sys_sigprocmask(args: SyscallArgs) -> KernelResult<u64> {
    let how = match args.a0 {
        0 => signal::MaskOp::Block,
        1 => signal::MaskOp::Unblock,
        2 => signal::MaskOp::Set,
        _ => {
            return Err(KernelError::InvalidArgument {
                name: "how",
                value: "unknown op",
            })
        }
    };
    Ok(signal::set_mask(how, args.a1))
}

pub fn sys_sigreturn(frame: &mut SavedFrame) -> KernelResult<u64> {
    signal::sigreturn(frame)?;
    // rax was restored from the saved frame; return it unchanged.
    Ok(frame.rax)
}

/// sleep(ticks)
pub fn sys_sleep(args: SyscallArgs) -> KernelResult<u64> {
    sched::sleep_ticks(args.a0);
    Ok(0)
}

pub fn sys_yield() -> KernelResult<u64> {
    sched::yield_now();
    Ok(0)
}

pub fn sys_getpid() -> KernelResult<u64> {
    Ok(crate::process::current_tgid() as u64)
}

pub fn sys_gettid() -> KernelResult<u64> {
    Ok(sched::current_task_id() as u64)
}

/// thread_create(entry, arg, stack_top, clear_tid)
pub fn sys_thread_create(args: SyscallArgs) -> KernelResult<u64> {
    if !user_validation::is_user_range(args.a0 as usize, 1)
        || !user_validation::is_user_range(args.a2 as usize, 1)
    {
        return Err(KernelError::BadUserPointer {
            addr: args.a0 as usize,
            len: 1,
        });
    }
    thread::create_thread(args.a0, args.a1, args.a2, args.a3).map(|id| id as u64)
}
