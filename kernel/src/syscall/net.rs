//! Socket syscalls
//!
//! Thin translation between descriptors and socket handles. Addresses
//! cross the boundary as a packed (ipv4, port) register pair rather than a
//! sockaddr blob; the libc shim unpacks them.

use super::SyscallArgs;
use crate::{
    error::{KernelError, KernelResult},
    mm::user_validation,
    net::{socket, Ipv4Address},
    process::fd::FileObject,
};

fn socket_handle(fd: usize) -> KernelResult<usize> {
    let table = crate::process::current_fd_table().ok_or(KernelError::InvalidState {
        expected: "user task",
        actual: "kernel task",
    })?;
    let result = match table.lock().get(fd)? {
        FileObject::Socket(handle) => Ok(handle),
        _ => Err(crate::error::FsError::BadFileDescriptor.into()),
    };
    result
}

/// socket(type): 1 = stream, 2 = datagram.
pub fn sys_socket(args: SyscallArgs) -> KernelResult<u64> {
    let ty = match args.a0 {
        1 => socket::SocketType::Stream,
        2 => socket::SocketType::Datagram,
        _ => {
            return Err(KernelError::InvalidArgument {
                name: "type",
                value: "unknown socket type",
            })
        }
    };
    let handle = socket::create(ty)?;

    let table = crate::process::current_fd_table().ok_or(KernelError::InvalidState {
        expected: "user task",
        actual: "kernel task",
    })?;
    let fd = match table.lock().allocate(FileObject::Socket(handle)) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = socket::close(handle);
            return Err(e);
        }
    };
    Ok(fd as u64)
}

/// bind(fd, ipv4, port)
pub fn sys_bind(args: SyscallArgs) -> KernelResult<u64> {
    let handle = socket_handle(args.a0 as usize)?;
    socket::bind(handle, Ipv4Address::from_u32(args.a1 as u32), args.a2 as u16)?;
    Ok(0)
}

/// listen(fd, backlog)
pub fn sys_listen(args: SyscallArgs) -> KernelResult<u64> {
    let handle = socket_handle(args.a0 as usize)?;
    socket::listen(handle, args.a1 as usize)?;
    Ok(0)
}

/// accept(fd, peer_out): blocks; writes the peer as 6 bytes (ipv4, port
/// big-endian) when `peer_out` is non-null. Returns the new fd.
pub fn sys_accept(args: SyscallArgs) -> KernelResult<u64> {
    let handle = socket_handle(args.a0 as usize)?;
    let (child, peer_ip, peer_port) = socket::accept(handle)?;

    let table = crate::process::current_fd_table().ok_or(KernelError::InvalidState {
        expected: "user task",
        actual: "kernel task",
    })?;
    let fd = match table.lock().allocate(FileObject::Socket(child)) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = socket::close(child);
            return Err(e);
        }
    };

    if args.a1 != 0 {
        let mut peer = [0u8; 6];
        peer[..4].copy_from_slice(&peer_ip.0);
        peer[4..].copy_from_slice(&peer_port.to_be_bytes());
        user_validation::copy_out(args.a1 as usize, &peer)?;
    }
    Ok(fd as u64)
}

/// connect(fd, ipv4, port): blocks until established or refused.
pub fn sys_connect(args: SyscallArgs) -> KernelResult<u64> {
    let handle = socket_handle(args.a0 as usize)?;
    socket::connect(handle, Ipv4Address::from_u32(args.a1 as u32), args.a2 as u16)?;
    Ok(0)
}

/// send(fd, buf, len)
pub fn sys_send(args: SyscallArgs) -> KernelResult<u64> {
    let handle = socket_handle(args.a0 as usize)?;
    let data = user_validation::copy_in(args.a1 as usize, args.a2 as usize)?;
    let sent = socket::send(handle, &data)?;
    Ok(sent as u64)
}

/// recv(fd, buf, len): blocks until data or EOF.
pub fn sys_recv(args: SyscallArgs) -> KernelResult<u64> {
    let handle = socket_handle(args.a0 as usize)?;
    let mut data = alloc::vec![0u8; args.a2 as usize];
    let n = socket::recv(handle, &mut data)?;
    user_validation::copy_out(args.a1 as usize, &data[..n])?;
    Ok(n as u64)
}
