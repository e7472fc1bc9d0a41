//! System call dispatch
//!
//! Vector 128 lands here. The number rides in `rax`, arguments in
//! `rdi rsi rdx r10 r8 r9`, and the result goes back into the frame's
//! `rax` slot: non-negative on success, a negative errno on failure.
//! The syscall boundary is the universal recovery point; no kernel error
//! crosses it in any other form.

pub mod io;
pub mod memory;
pub mod net;
pub mod process;

use crate::{arch::x86_64::context::SavedFrame, error::KernelResult};

// Syscall numbers.
pub const SYS_EXIT: u64 = 1;
pub const SYS_FORK: u64 = 2;
pub const SYS_READ: u64 = 3;
pub const SYS_WRITE: u64 = 4;
pub const SYS_OPEN: u64 = 5;
pub const SYS_CLOSE: u64 = 6;
pub const SYS_WAITPID: u64 = 7;
pub const SYS_EXECVE: u64 = 11;
pub const SYS_BRK: u64 = 12;
pub const SYS_KILL: u64 = 13;
pub const SYS_SIGACTION: u64 = 14;
pub const SYS_SIGPROCMASK: u64 = 15;
pub const SYS_SIGRETURN: u64 = 16;
pub const SYS_IOCTL: u64 = 17;
pub const SYS_SLEEP: u64 = 18;
pub const SYS_YIELD: u64 = 19;
pub const SYS_GETPID: u64 = 20;
pub const SYS_GETTID: u64 = 21;
pub const SYS_THREAD_CREATE: u64 = 22;
pub const SYS_MMAP: u64 = 30;
pub const SYS_MUNMAP: u64 = 31;
pub const SYS_SOCKET: u64 = 40;
pub const SYS_BIND: u64 = 41;
pub const SYS_LISTEN: u64 = 42;
pub const SYS_ACCEPT: u64 = 43;
pub const SYS_CONNECT: u64 = 44;
pub const SYS_SEND: u64 = 45;
pub const SYS_RECV: u64 = 46;

/// Arguments in calling-convention order.
#[derive(Debug, Clone, Copy)]
pub struct SyscallArgs {
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
}

impl SyscallArgs {
    fn from_frame(frame: &SavedFrame) -> Self {
        Self {
            a0: frame.rdi,
            a1: frame.rsi,
            a2: frame.rdx,
            a3: frame.r10,
            a4: frame.r8,
            a5: frame.r9,
        }
    }
}

/// Dispatch the syscall captured in `frame`.
pub fn dispatch(frame: &mut SavedFrame) {
    let nr = frame.rax;
    let args = SyscallArgs::from_frame(frame);

    let result: KernelResult<u64> = match nr {
        SYS_EXIT => process::sys_exit(args),
        SYS_FORK => process::sys_fork(frame),
        SYS_READ => io::sys_read(args),
        SYS_WRITE => io::sys_write(args),
        SYS_OPEN => io::sys_open(args),
        SYS_CLOSE => io::sys_close(args),
        SYS_WAITPID => process::sys_waitpid(args),
        SYS_EXECVE => process::sys_execve(frame, args),
        SYS_BRK => memory::sys_brk(args),
        SYS_KILL => process::sys_kill(args),
        SYS_SIGACTION => process::sys_sigaction(args),
        SYS_SIGPROCMASK => process::sys_sigprocmask(args),
        SYS_SIGRETURN => process::sys_sigreturn(frame),
        SYS_IOCTL => io::sys_ioctl(args),
        SYS_SLEEP => process::sys_sleep(args),
        SYS_YIELD => process::sys_yield(),
        SYS_GETPID => process::sys_getpid(),
        SYS_GETTID => process::sys_gettid(),
        SYS_THREAD_CREATE => process::sys_thread_create(args),
        SYS_MMAP => memory::sys_mmap(args),
        SYS_MUNMAP => memory::sys_munmap(args),
        SYS_SOCKET => net::sys_socket(args),
        SYS_BIND => net::sys_bind(args),
        SYS_LISTEN => net::sys_listen(args),
        SYS_ACCEPT => net::sys_accept(args),
        SYS_CONNECT => net::sys_connect(args),
        SYS_SEND => net::sys_send(args),
        SYS_RECV => net::sys_recv(args),
        _ => Err(crate::error::KernelError::UnknownSyscall { nr: nr as usize }),
    };

    frame.rax = match result {
        Ok(value) => value,
        Err(e) => (-e.errno()) as u64,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::context::SavedFrame;

    #[test]
    fn unknown_syscall_returns_enosys() {
        let mut frame = SavedFrame::new_user(0, 0x7000_0000);
        frame.rax = 9999;
        dispatch(&mut frame);
        assert_eq!(frame.rax as i64, -crate::error::errno::ENOSYS);
    }

    #[test]
    fn args_follow_the_register_convention() {
        let mut frame = SavedFrame::new_user(0, 0);
        frame.rdi = 1;
        frame.rsi = 2;
        frame.rdx = 3;
        frame.r10 = 4;
        frame.r8 = 5;
        frame.r9 = 6;
        let args = SyscallArgs::from_frame(&frame);
        assert_eq!(
            (args.a0, args.a1, args.a2, args.a3, args.a4, args.a5),
            (1, 2, 3, 4, 5, 6)
        );
    }
}
