//! Architecture support
//!
//! Basalt targets x86_64 only; the host build of this module provides the
//! small set of stubs the portable code needs to compile for tests.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// Interrupt-flag save/restore used by the spinlock layer.
pub mod interrupts {
    /// Disable interrupts, returning the previous enable state.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub fn save_and_disable() -> bool {
        let enabled = ::x86_64::instructions::interrupts::are_enabled();
        ::x86_64::instructions::interrupts::disable();
        enabled
    }

    /// Restore a previously saved interrupt enable state.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub fn restore(was_enabled: bool) {
        if was_enabled {
            ::x86_64::instructions::interrupts::enable();
        }
    }

    // Host stubs: tests run with no interrupt control.
    #[cfg(not(target_os = "none"))]
    pub fn save_and_disable() -> bool {
        false
    }

    #[cfg(not(target_os = "none"))]
    pub fn restore(_was_enabled: bool) {}
}

/// Stop the CPU permanently.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn halt() -> ! {
    ::x86_64::instructions::interrupts::disable();
    loop {
        ::x86_64::instructions::hlt();
    }
}

#[cfg(not(target_os = "none"))]
pub fn halt() -> ! {
    std::process::exit(1);
}

/// Relinquish the CPU to the scheduler via the yield vector.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn yield_now() {
    // SAFETY: vector 64 is the kernel's own yield gate, installed at boot.
    unsafe {
        core::arch::asm!("int 0x40", options(nomem, preserves_flags));
    }
}

#[cfg(not(target_os = "none"))]
pub fn yield_now() {
    core::hint::spin_loop();
}

/// Architecture init: descriptor tables, interrupt controller, timer.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init() {
    x86_64::gdt::init();
    x86_64::idt::init();
    x86_64::pic::init();
}
