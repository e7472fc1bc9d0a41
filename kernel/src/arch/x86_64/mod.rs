//! x86_64 architecture support: descriptor tables, interrupt plumbing,
//! saved-frame layout, PIC and PIT.

pub mod context;
pub mod gdt;
pub mod idt;
pub mod isr;
pub mod pic;
pub mod timer;

/// Reload CR3 with a new address-space root, forcing a full TLB flush.
#[cfg(target_os = "none")]
pub fn write_cr3(root: u64) {
    use x86_64::{
        registers::control::{Cr3, Cr3Flags},
        structures::paging::PhysFrame,
        PhysAddr,
    };

    // SAFETY: root is the physical address of a valid L4 table whose upper
    // half mirrors the kernel's canonical root.
    unsafe {
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(root)),
            Cr3Flags::empty(),
        );
    }
}

#[cfg(not(target_os = "none"))]
pub fn write_cr3(_root: u64) {}

/// Current address-space root from CR3.
#[cfg(target_os = "none")]
pub fn read_cr3() -> u64 {
    use x86_64::registers::control::Cr3;
    Cr3::read().0.start_address().as_u64()
}

#[cfg(not(target_os = "none"))]
pub fn read_cr3() -> u64 {
    0
}

/// Invalidate the TLB entry covering a single page.
#[cfg(target_os = "none")]
pub fn invlpg(virt: u64) {
    use x86_64::{instructions::tlb, VirtAddr};
    tlb::flush(VirtAddr::new(virt));
}

#[cfg(not(target_os = "none"))]
pub fn invlpg(_virt: u64) {}
