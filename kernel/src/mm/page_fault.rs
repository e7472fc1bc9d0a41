//! Page fault resolution
//!
//! Two legitimate faults exist in this kernel: a first touch inside a
//! valid VMA (demand paging) and a write to a shared copy-on-write page.
//! Anything else propagates back to the dispatcher, which terminates a
//! user task or panics for kernel faults.

use super::{
    frame_allocator::alloc_zeroed_frame, page_table, phys_to_virt, vas::VmaFlags, PageFlags,
    VirtualAddress, FRAME_ALLOCATOR, FRAME_SIZE,
};
use crate::error::{KernelError, KernelResult};

/// Resolve a fault at `addr`.
///
/// Consults the current task's address space. Demand paging runs for both
/// user and kernel-mode faults (the kernel touches not-yet-materialized
/// user pages through `copy_in`/`copy_out`); a miss is the caller's
/// problem.
pub fn handle_fault(addr: u64, was_write: bool, _from_user: bool) -> KernelResult<()> {
    let space = crate::process::current_address_space().ok_or(KernelError::UnmappedMemory {
        addr: addr as usize,
    })?;
    let mut space = space.lock();

    let vma = *space.vmas.find(addr).ok_or(KernelError::UnmappedMemory {
        addr: addr as usize,
    })?;

    if was_write && !vma.flags.contains(VmaFlags::WRITE) {
        return Err(KernelError::PermissionDenied {
            operation: "write to read-only region",
        });
    }

    let page = VirtualAddress::new(addr).page_base();
    let root = space.root();

    match page_table::translate(root, page) {
        None => {
            // First touch: materialize a zeroed frame with the VMA's flags.
            let frame = alloc_zeroed_frame()?;
            if let Err(e) = page_table::map(root, page, frame, vma.page_flags()) {
                let _ = FRAME_ALLOCATOR.lock().free_frame(frame);
                return Err(e);
            }
            Ok(())
        }
        Some((frame, flags)) => {
            if was_write && !flags.contains(PageFlags::WRITABLE) {
                resolve_cow(root, page, frame, vma.page_flags())
            } else {
                // Present with sufficient rights: stale TLB entry, nothing
                // to do beyond the invalidation below.
                crate::arch::x86_64::invlpg(page.as_u64());
                Ok(())
            }
        }
    }
}

/// Split or reclaim a copy-on-write page.
///
/// With the frame still shared, copy into a private frame and drop one
/// reference; as the last referent, just restore the writable bit.
fn resolve_cow(
    root: super::PhysicalAddress,
    page: VirtualAddress,
    frame: super::PhysicalAddress,
    target_flags: PageFlags,
) -> KernelResult<()> {
    let shared = FRAME_ALLOCATOR.lock().refcount(frame) > 1;

    if shared {
        let new_frame = FRAME_ALLOCATOR.lock().alloc_frame()?;
        // SAFETY: both frames are covered by the HHDM; new_frame is
        // exclusively ours, and the source is read-only while shared.
        unsafe {
            core::ptr::copy_nonoverlapping(
                phys_to_virt(frame),
                phys_to_virt(new_frame),
                FRAME_SIZE,
            );
        }
        if let Err(e) = page_table::replace_leaf(root, page, new_frame, target_flags) {
            let _ = FRAME_ALLOCATOR.lock().free_frame(new_frame);
            return Err(e);
        }
        let _ = FRAME_ALLOCATOR.lock().unref_frame(frame);
        Ok(())
    } else {
        page_table::remap_flags(root, page, target_flags)
    }
}
