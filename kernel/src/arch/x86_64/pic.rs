//! Legacy 8259 PIC setup and end-of-interrupt discipline
//!
//! IRQ lines 0-15 are remapped onto vectors 32-47 so they stay clear of
//! the CPU exception range.

use pic8259::ChainedPics;
use spin::Mutex;

/// Vector base for the primary PIC.
pub const PIC_1_OFFSET: u8 = 32;
/// Vector base for the secondary PIC.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

// SAFETY: the offsets place both PICs outside the exception vectors.
static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remap and unmask the controllers.
#[cfg(target_os = "none")]
pub fn init() {
    // SAFETY: single initialization during boot with interrupts disabled.
    unsafe {
        PICS.lock().initialize();
    }
}

#[cfg(not(target_os = "none"))]
pub fn init() {}

/// Acknowledge an interrupt on the controller owning `vector`.
///
/// Must be called exactly once per hardware IRQ, after the handler has run
/// and before the dispatcher returns to the interrupted context.
#[cfg(target_os = "none")]
pub fn end_of_interrupt(vector: u8) {
    // SAFETY: vector was received on this controller; notifying it is the
    // required protocol.
    unsafe {
        PICS.lock().notify_end_of_interrupt(vector);
    }
}

#[cfg(not(target_os = "none"))]
pub fn end_of_interrupt(_vector: u8) {}
