//! Descriptor I/O syscalls
//!
//! With the VFS outside this kernel, descriptors cover the console and
//! sockets; `open` on a path has nothing to resolve against and reports
//! so honestly.

use super::SyscallArgs;
use crate::{
    error::{KernelError, KernelResult},
    mm::user_validation,
    process::fd::FileObject,
    sync::SpinLock,
};

fn fd_object(fd: usize) -> KernelResult<FileObject> {
    let table = crate::process::current_fd_table().ok_or(KernelError::InvalidState {
        expected: "user task",
        actual: "kernel task",
    })?;
    let obj = table.lock().get(fd)?;
    Ok(obj)
}

/// read(fd, buf, len)
pub fn sys_read(args: SyscallArgs) -> KernelResult<u64> {
    let (fd, buf, len) = (args.a0 as usize, args.a1 as usize, args.a2 as usize);
    match fd_object(fd)? {
        // No keyboard driver in this core; console reads return EOF.
        FileObject::Console => Ok(0),
        FileObject::Socket(handle) => {
            let mut data = alloc::vec![0u8; len];
            let n = crate::net::socket::recv(handle, &mut data)?;
            user_validation::copy_out(buf, &data[..n])?;
            Ok(n as u64)
        }
    }
}

/// write(fd, buf, len)
pub fn sys_write(args: SyscallArgs) -> KernelResult<u64> {
    let (fd, buf, len) = (args.a0 as usize, args.a1 as usize, args.a2 as usize);
    let data = user_validation::copy_in(buf, len)?;
    match fd_object(fd)? {
        FileObject::Console => {
            if let Ok(s) = core::str::from_utf8(&data) {
                print!("{}", s);
            }
            Ok(len as u64)
        }
        FileObject::Socket(handle) => {
            let n = crate::net::socket::send(handle, &data)?;
            Ok(n as u64)
        }
    }
}

/// open(path, flags): no VFS behind the boundary.
pub fn sys_open(args: SyscallArgs) -> KernelResult<u64> {
    let _path = user_validation::copy_string_in(args.a0 as usize)?;
    Err(KernelError::OperationNotSupported { operation: "open" })
}

/// close(fd)
pub fn sys_close(args: SyscallArgs) -> KernelResult<u64> {
    let table = crate::process::current_fd_table().ok_or(KernelError::InvalidState {
        expected: "user task",
        actual: "kernel task",
    })?;
    let obj = table.lock().close(args.a0 as usize)?;
    if let FileObject::Socket(handle) = obj {
        crate::net::socket::close(handle)?;
    }
    Ok(0)
}

// Console termios, for the TCGETS/TCSETS subset.
const TCGETS: u64 = 0x5401;
const TCSETS: u64 = 0x5402;
const TERMIOS_SIZE: usize = 36;

static CONSOLE_TERMIOS: SpinLock<[u8; TERMIOS_SIZE]> = SpinLock::new([0; TERMIOS_SIZE]);

/// ioctl(fd, request, argp): termios subset on the console.
pub fn sys_ioctl(args: SyscallArgs) -> KernelResult<u64> {
    let (fd, request, argp) = (args.a0 as usize, args.a1, args.a2 as usize);
    match fd_object(fd)? {
        FileObject::Console => match request {
            TCGETS => {
                let termios = *CONSOLE_TERMIOS.lock();
                user_validation::copy_out(argp, &termios)?;
                Ok(0)
            }
            TCSETS => {
                let data = user_validation::copy_in(argp, TERMIOS_SIZE)?;
                CONSOLE_TERMIOS
                    .lock()
                    .copy_from_slice(&data);
                Ok(0)
            }
            _ => Err(KernelError::InvalidArgument {
                name: "ioctl",
                value: "unknown request",
            }),
        },
        FileObject::Socket(_) => Err(KernelError::InvalidArgument {
            name: "ioctl",
            value: "not a terminal",
        }),
    }
}
