//! Kernel heap
//!
//! Backs the global allocator on bare metal. The heap window is carved out
//! of physical memory at boot and reached through the HHDM, so no page
//! table work is needed to grow into it.

/// Kernel heap size: 8 MiB.
pub const HEAP_SIZE: usize = 8 * 1024 * 1024;

/// Initialize the kernel heap over `heap_size` bytes of contiguous
/// physical memory starting at `heap_phys`.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init(heap_phys: super::PhysicalAddress, heap_size: usize) {
    let heap_start = super::phys_to_virt(heap_phys);
    // SAFETY: the region was reserved out of the boot memory map before
    // the frame allocator saw it, and the HHDM alias covers it entirely.
    unsafe {
        crate::get_allocator().lock().init(heap_start, heap_size);
    }
    log::info!(
        "kernel heap: {} KiB at {:#x}",
        heap_size / 1024,
        heap_start as usize
    );
}

// Host builds use the system allocator; nothing to set up.
#[cfg(not(target_os = "none"))]
pub fn init(_heap_phys: super::PhysicalAddress, _heap_size: usize) {}
