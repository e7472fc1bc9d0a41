//! Kernel logger
//!
//! Backend for the `log` facade: every record is appended to a fixed-size
//! in-memory ring and, at `Info` and above, echoed to the serial console.
//! The panic path dumps the ring so the tail of the log survives a crash
//! without a functioning console.

use core::fmt::{self, Write};

use log::{LevelFilter, Metadata, Record};

use crate::sync::SpinLock;

/// Capacity of the in-memory log ring in bytes.
const LOG_RING_SIZE: usize = 16 * 1024;

/// Byte ring holding the most recent formatted log lines.
struct LogRing {
    buf: [u8; LOG_RING_SIZE],
    head: usize,
    len: usize,
}

impl LogRing {
    const fn new() -> Self {
        Self {
            buf: [0; LOG_RING_SIZE],
            head: 0,
            len: 0,
        }
    }

    fn push_byte(&mut self, b: u8) {
        let tail = (self.head + self.len) % LOG_RING_SIZE;
        self.buf[tail] = b;
        if self.len < LOG_RING_SIZE {
            self.len += 1;
        } else {
            // Overwrite the oldest byte
            self.head = (self.head + 1) % LOG_RING_SIZE;
        }
    }

    /// The ring contents as two contiguous slices, oldest first.
    fn slices(&self) -> (&[u8], &[u8]) {
        let tail = (self.head + self.len) % LOG_RING_SIZE;
        if self.len == 0 {
            (&[], &[])
        } else if self.head < tail {
            (&self.buf[self.head..tail], &[])
        } else {
            (&self.buf[self.head..], &self.buf[..tail])
        }
    }
}

// ISRs log through this too, hence the interrupt-safe lock.
static LOG_RING: SpinLock<LogRing> = SpinLock::new(LogRing::new());

struct RingWriter<'a>(&'a mut LogRing);

impl Write for RingWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            self.0.push_byte(b);
        }
        Ok(())
    }
}

/// Logger instance registered with the `log` facade.
struct KernelLogger;

static KERNEL_LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let ticks = crate::sched::ticks();
        {
            let mut ring = LOG_RING.lock();
            let mut w = RingWriter(&mut ring);
            let _ = writeln!(
                w,
                "[{:>6}] {:<5} {}: {}",
                ticks,
                record.level(),
                record.target(),
                record.args()
            );
        }

        if record.level() <= log::Level::Info {
            println!(
                "[{:>6}] {:<5} {}: {}",
                ticks,
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Register the kernel logger with the `log` facade.
///
/// Called once during boot, before any subsystem that logs.
pub fn init() {
    if log::set_logger(&KERNEL_LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

/// Dump the log ring to the serial console.
///
/// Used by the panic path; must not allocate. try_lock: the panic may
/// have struck while the ring was held.
pub fn dump_ring() {
    let Some(ring) = LOG_RING.try_lock() else {
        crate::serial::write_str("<log ring locked at panic time>\n");
        return;
    };
    let (a, b) = ring.slices();
    for slice in [a, b] {
        if slice.is_empty() {
            continue;
        }
        match core::str::from_utf8(slice) {
            Ok(s) => crate::serial::write_str(s),
            Err(_) => crate::serial::write_str("<non-utf8 log bytes>\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_most_recent_bytes() {
        let mut ring = LogRing::new();
        for i in 0..(LOG_RING_SIZE + 10) {
            ring.push_byte((i % 251) as u8);
        }
        assert_eq!(ring.len, LOG_RING_SIZE);
        let (a, b) = ring.slices();
        assert_eq!(a.len() + b.len(), LOG_RING_SIZE);
        // Oldest surviving byte is the 11th pushed
        assert_eq!(a[0], (10 % 251) as u8);
    }

    #[test]
    fn ring_slices_in_order_before_wrap() {
        let mut ring = LogRing::new();
        for b in b"hello" {
            ring.push_byte(*b);
        }
        let (a, b) = ring.slices();
        assert_eq!(a, b"hello");
        assert!(b.is_empty());
    }
}
