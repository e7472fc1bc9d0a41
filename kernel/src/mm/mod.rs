//! Memory management
//!
//! Physical frames, the high-half direct map, 4-level page tables, virtual
//! address spaces with demand paging and copy-on-write fork, user pointer
//! validation, and the kernel heap.

pub mod frame_allocator;
pub mod heap;
pub mod page_fault;
pub mod page_table;
pub mod user_validation;
pub mod vas;

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

pub use frame_allocator::{FrameAllocator, FRAME_ALLOCATOR};

/// Size of a physical frame (4 KiB).
pub const FRAME_SIZE: usize = 4096;
/// Size of a virtual page; equal to the frame size at this level.
pub const PAGE_SIZE: usize = 4096;

/// First address of the kernel half. Everything below is user space.
pub const KERNEL_HALF_START: u64 = 0xFFFF_8000_0000_0000;
/// Exclusive upper bound of the user half (48-bit canonical split).
pub const USER_HALF_END: u64 = 0x0000_8000_0000_0000;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn frame_index(&self) -> usize {
        (self.0 / FRAME_SIZE as u64) as usize
    }

    pub const fn is_frame_aligned(&self) -> bool {
        self.0 % FRAME_SIZE as u64 == 0
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Round down to the containing page boundary.
    pub const fn page_base(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    /// Whether the address lies in the user half.
    pub const fn is_user(&self) -> bool {
        self.0 < USER_HALF_END
    }
}

bitflags! {
    /// Page table entry flag bits (x86_64 layout).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
        const HUGE     = 1 << 7;
    }
}

/// Offset of the high-half direct map, set once from the boot hand-off.
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Record the HHDM offset supplied by the bootloader.
pub fn set_hhdm_offset(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Relaxed);
}

/// The HHDM offset. Zero until boot hand-off has been consumed.
pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Relaxed)
}

/// Translate a physical address to its HHDM virtual alias.
///
/// Every physical frame is reachable through the direct map for the
/// kernel's whole lifetime, so the returned pointer never dangles; whether
/// dereferencing it races is up to the caller's locking.
pub fn phys_to_virt(phys: PhysicalAddress) -> *mut u8 {
    (hhdm_offset() + phys.as_u64()) as *mut u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_base_masks_offset_bits() {
        let addr = VirtualAddress::new(0x1234_5678);
        assert_eq!(addr.page_base().as_u64(), 0x1234_5000);
    }

    #[test]
    fn user_half_boundary() {
        assert!(VirtualAddress::new(0x7FFF_FFFF_FFFF).is_user());
        assert!(!VirtualAddress::new(USER_HALF_END).is_user());
        assert!(!VirtualAddress::new(KERNEL_HALF_START).is_user());
    }
}
