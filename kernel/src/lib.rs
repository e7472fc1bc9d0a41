//! Basalt kernel library
//!
//! Core of a hobbyist x86_64 monolithic kernel: preemptive scheduler,
//! 4-level virtual memory with demand paging and copy-on-write fork,
//! interrupt dispatch, an embedded TCP/IP stack with a BSD-like socket
//! API, and a write-ahead metadata journal over a block cache.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// On bare metal the kernel heap (mm::heap) backs the global allocator.
// On the host target (x86_64-unknown-linux-gnu) for unit and integration
// tests, delegate to the system allocator so test code using Vec/String
// compiles and runs under the standard harness.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Get a reference to the global allocator
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn get_allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

// Host target: use the system allocator so unit tests can allocate normally.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod error;
pub mod fs;
pub mod logger;
pub mod mm;
pub mod net;
pub mod panic;
pub mod process;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod syscall;

// Re-exports for tests and the boot binary
pub use error::{KernelError, KernelResult};
pub use mm::{PhysicalAddress, VirtualAddress, FRAME_SIZE, PAGE_SIZE};

/// Heap allocation error handler.
///
/// Panic is intentional: heap allocation failure in a no_std kernel is
/// unrecoverable. The alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
