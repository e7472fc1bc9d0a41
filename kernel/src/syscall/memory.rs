//! Memory-management syscalls

use super::SyscallArgs;
use crate::{
    error::{KernelError, KernelResult},
    mm::{
        vas::{VmaFlags, VmaKind},
        PAGE_SIZE,
    },
};

const PROT_READ: u64 = 1;
const PROT_WRITE: u64 = 2;
const PROT_EXEC: u64 = 4;

fn prot_to_flags(prot: u64) -> VmaFlags {
    let mut flags = VmaFlags::empty();
    if prot & PROT_READ != 0 {
        flags |= VmaFlags::READ;
    }
    if prot & PROT_WRITE != 0 {
        flags |= VmaFlags::WRITE;
    }
    if prot & PROT_EXEC != 0 {
        flags |= VmaFlags::EXEC;
    }
    flags
}

fn page_aligned(value: u64) -> bool {
    value % PAGE_SIZE as u64 == 0
}

/// mmap(addr, len, prot): anonymous demand-paged mappings only. addr 0
/// lets the kernel choose a placement.
pub fn sys_mmap(args: SyscallArgs) -> KernelResult<u64> {
    let (addr, len, prot) = (args.a0, args.a1 as usize, args.a2);
    if len == 0 || !page_aligned(addr) || len % PAGE_SIZE != 0 {
        return Err(KernelError::InvalidArgument {
            name: "mmap",
            value: "unaligned or empty",
        });
    }

    let space = crate::process::current_address_space().ok_or(KernelError::InvalidState {
        expected: "user task",
        actual: "kernel task",
    })?;
    let mut space = space.lock();

    let addr = if addr == 0 {
        // Place above everything mapped so far, with a guard gap.
        (space.vmas.highest_end() + PAGE_SIZE as u64).max(0x1000_0000)
    } else {
        addr
    };

    space.add_region(addr, len, prot_to_flags(prot), VmaKind::Anonymous)?;
    Ok(addr)
}

/// munmap(addr, len)
pub fn sys_munmap(args: SyscallArgs) -> KernelResult<u64> {
    let (addr, len) = (args.a0, args.a1 as usize);
    if !page_aligned(addr) || len == 0 || len % PAGE_SIZE != 0 {
        return Err(KernelError::InvalidArgument {
            name: "munmap",
            value: "unaligned or empty",
        });
    }
    let space = crate::process::current_address_space().ok_or(KernelError::InvalidState {
        expected: "user task",
        actual: "kernel task",
    })?;
    space.lock().unmap_region(addr, len)?;
    Ok(0)
}

/// brk(new_brk): 0 queries the current break.
pub fn sys_brk(args: SyscallArgs) -> KernelResult<u64> {
    let space = crate::process::current_address_space().ok_or(KernelError::InvalidState {
        expected: "user task",
        actual: "kernel task",
    })?;
    let mut space = space.lock();
    space.set_brk(args.a0)
}
