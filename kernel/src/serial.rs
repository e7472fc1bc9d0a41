//! Serial port (COM1) output
//!
//! Primary console for boot messages, the logger backend, and panic dumps.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod uart {
    use core::fmt;

    use lazy_static::lazy_static;
    use spin::Mutex;
    use uart_16550::SerialPort;

    lazy_static! {
        pub static ref SERIAL1: Mutex<SerialPort> = {
            // SAFETY: 0x3F8 is the standard COM1 I/O port base; the port is
            // only initialized once through this lazy static.
            let mut serial_port = unsafe { SerialPort::new(0x3F8) };
            serial_port.init();
            Mutex::new(serial_port)
        };
    }

    #[doc(hidden)]
    pub fn _print(args: fmt::Arguments) {
        use fmt::Write;

        use x86_64::instructions::interrupts;

        // Writing must not be interleaved with an ISR that also logs.
        interrupts::without_interrupts(|| {
            SERIAL1
                .lock()
                .write_fmt(args)
                .expect("serial write failed");
        });
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use uart::_print;

/// Write a raw string to the serial console.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn write_str(s: &str) {
    _print(format_args!("{}", s));
}

#[cfg(not(target_os = "none"))]
pub fn write_str(s: &str) {
    std::print!("{}", s);
}
