//! Programmable interval timer
//!
//! Drives preemption: the PIT fires on IRQ 0 (vector 32) at roughly
//! 100 Hz, the scheduler's tick rate.

/// PIT input clock in Hz.
const PIT_FREQUENCY: u32 = 1_193_182;

/// Scheduler tick rate in Hz.
pub const TICK_HZ: u32 = 100;

/// Program channel 0 for periodic interrupts at [`TICK_HZ`].
#[cfg(target_os = "none")]
pub fn init() {
    use x86_64::instructions::port::Port;

    let divisor = (PIT_FREQUENCY / TICK_HZ) as u16;

    let mut command: Port<u8> = Port::new(0x43);
    let mut channel0: Port<u8> = Port::new(0x40);

    // SAFETY: standard PIT programming sequence; channel 0, lobyte/hibyte,
    // mode 3 (square wave).
    unsafe {
        command.write(0x36);
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);
    }

    log::info!("PIT programmed for {} Hz", TICK_HZ);
}

#[cfg(not(target_os = "none"))]
pub fn init() {}
