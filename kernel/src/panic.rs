//! Kernel panic path
//!
//! Fatal inconsistencies end here: paint the framebuffer with the fault
//! color, dump the panic message, the interrupted register frame when one
//! is known, and the log ring to serial, then halt.

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

/// Framebuffer handed off by the bootloader, registered at boot.
#[derive(Debug, Clone, Copy)]
pub struct PanicFramebuffer {
    pub addr: *mut u8,
    pub width: usize,
    pub height: usize,
    pub pitch: usize,
    pub bytes_per_pixel: usize,
}

// SAFETY: the raw pointer is only dereferenced on the panic path, with every
// other CPU activity stopped.
unsafe impl Send for PanicFramebuffer {}

static FRAMEBUFFER: Mutex<Option<PanicFramebuffer>> = Mutex::new(None);

/// Saved-frame pointer of the interrupted context, if a dispatcher was
/// active when the panic hit. Zero means none.
static PANIC_FRAME: AtomicU64 = AtomicU64::new(0);

/// Fault background color (dark red, RGB888).
const FAULT_COLOR: [u8; 3] = [0x20, 0x10, 0x7a];

/// Register the boot framebuffer for fault display.
pub fn register_framebuffer(fb: PanicFramebuffer) {
    *FRAMEBUFFER.lock() = Some(fb);
}

/// Record the saved-frame pointer currently being dispatched.
///
/// The interrupt dispatcher calls this on entry so a panic inside a handler
/// can dump the interrupted context.
pub fn set_current_frame(frame_ptr: u64) {
    PANIC_FRAME.store(frame_ptr, Ordering::Relaxed);
}

fn paint_fault_background() {
    // try_lock: the panic may have happened with the lock held.
    if let Some(guard) = FRAMEBUFFER.try_lock() {
        if let Some(fb) = *guard {
            for y in 0..fb.height {
                for x in 0..fb.width {
                    let off = y * fb.pitch + x * fb.bytes_per_pixel;
                    // SAFETY: the framebuffer mapping is supplied by the
                    // bootloader and covers height * pitch bytes.
                    unsafe {
                        let p = fb.addr.add(off);
                        p.write_volatile(FAULT_COLOR[0]);
                        p.add(1).write_volatile(FAULT_COLOR[1]);
                        p.add(2).write_volatile(FAULT_COLOR[2]);
                    }
                }
            }
        }
    }
}

fn dump_saved_frame() {
    let ptr = PANIC_FRAME.load(Ordering::Relaxed);
    if ptr == 0 {
        return;
    }
    // SAFETY: the dispatcher stored a pointer to a live SavedFrame on the
    // current kernel stack before handing control to any handler.
    let frame = unsafe { &*(ptr as *const crate::arch::x86_64::context::SavedFrame) };
    println!("interrupted frame:\n{}", frame);
}

/// Common panic routine for the kernel binary's `#[panic_handler]`.
pub fn kernel_panic(info: &PanicInfo) -> ! {
    paint_fault_background();

    println!();
    println!("======== KERNEL PANIC ========");
    println!("{}", info);
    dump_saved_frame();
    println!("-------- log ring --------");
    crate::logger::dump_ring();
    println!("======== halted ========");

    crate::arch::halt()
}
