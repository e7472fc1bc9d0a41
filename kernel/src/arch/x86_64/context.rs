//! Saved register frames
//!
//! Every interrupt entry leaves a [`SavedFrame`] on the interrupted task's
//! kernel stack: the ISR stub pushes the vector and an error-code slot, the
//! common tail pushes the general-purpose registers, and the CPU itself
//! supplied `rip/cs/rflags/rsp/ss`. The scheduler never interprets the
//! frame beyond this layout; it only trades stack-pointer values.

use core::fmt;

/// Kernel code selector (GDT slot 1).
pub const KERNEL_CS: u64 = 0x08;
/// Kernel data selector (GDT slot 2).
pub const KERNEL_SS: u64 = 0x10;
/// User data selector with RPL 3 (GDT slot 5).
pub const USER_SS: u64 = 0x2B;
/// User code selector with RPL 3 (GDT slot 6).
pub const USER_CS: u64 = 0x33;

/// RFLAGS with the interrupt flag set and reserved bit 1.
pub const RFLAGS_IF: u64 = 0x202;

/// The register frame built by interrupt entry, in stack order.
///
/// Field order mirrors ascending addresses from the saved `rsp`; keep it in
/// sync with the push sequence in `isr.rs`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SavedFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    /// Interrupt vector number, pushed by the per-vector stub.
    pub vector: u64,
    /// CPU error code, or 0 for vectors that do not supply one.
    pub error_code: u64,
    // Hardware-pushed interrupt frame
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl SavedFrame {
    /// Size of the frame in bytes.
    pub const SIZE: usize = core::mem::size_of::<SavedFrame>();

    /// Synthetic frame for the first entry into a kernel task.
    ///
    /// The first switch pops this frame and `iretq`s straight into `entry`
    /// with interrupts enabled and a clean register set.
    pub fn new_kernel(entry: u64, stack_top: u64) -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            vector: 0,
            error_code: 0,
            rip: entry,
            cs: KERNEL_CS,
            rflags: RFLAGS_IF,
            rsp: stack_top,
            ss: KERNEL_SS,
        }
    }

    /// Synthetic frame entering user mode at `entry` with stack `user_rsp`.
    pub fn new_user(entry: u64, user_rsp: u64) -> Self {
        let mut frame = Self::new_kernel(entry, user_rsp);
        frame.cs = USER_CS;
        frame.ss = USER_SS;
        frame
    }

    /// Whether the frame was captured in user mode.
    pub fn from_user(&self) -> bool {
        self.cs & 0x3 == 3
    }

    /// Rewrite this frame so `iretq` resumes in user mode at the given
    /// entry point and stack. Used by exec and signal delivery.
    pub fn enter_user_at(&mut self, entry: u64, user_rsp: u64) {
        self.rip = entry;
        self.rsp = user_rsp;
        self.cs = USER_CS;
        self.ss = USER_SS;
        self.rflags = RFLAGS_IF;
    }
}

impl fmt::Display for SavedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "  rip={:#018x} cs={:#06x} rflags={:#010x}",
            self.rip, self.cs, self.rflags
        )?;
        writeln!(f, "  rsp={:#018x} ss={:#06x}", self.rsp, self.ss)?;
        writeln!(
            f,
            "  rax={:#018x} rbx={:#018x} rcx={:#018x}",
            self.rax, self.rbx, self.rcx
        )?;
        writeln!(
            f,
            "  rdx={:#018x} rsi={:#018x} rdi={:#018x}",
            self.rdx, self.rsi, self.rdi
        )?;
        writeln!(
            f,
            "  rbp={:#018x} r8 ={:#018x} r9 ={:#018x}",
            self.rbp, self.r8, self.r9
        )?;
        writeln!(
            f,
            "  r10={:#018x} r11={:#018x} r12={:#018x}",
            self.r10, self.r11, self.r12
        )?;
        writeln!(
            f,
            "  r13={:#018x} r14={:#018x} r15={:#018x}",
            self.r13, self.r14, self.r15
        )?;
        write!(
            f,
            "  vector={} error_code={:#x}",
            self.vector, self.error_code
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_matches_push_sequence() {
        // 15 GPRs + vector + error code + 5 hardware words
        assert_eq!(SavedFrame::SIZE, 22 * 8);
        let frame = SavedFrame::new_kernel(0x1234, 0x8000);
        assert_eq!(frame.rip, 0x1234);
        assert_eq!(frame.rflags & 0x200, 0x200, "IF must be set");
        assert!(!frame.from_user());
    }

    #[test]
    fn user_frame_uses_ring3_selectors() {
        let frame = SavedFrame::new_user(0x40_0000, 0x7fff_f000);
        assert!(frame.from_user());
        assert_eq!(frame.cs & 0x3, 3);
        assert_eq!(frame.ss & 0x3, 3);
    }
}
