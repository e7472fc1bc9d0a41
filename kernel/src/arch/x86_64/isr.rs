//! Interrupt service routine stubs and the dispatch core
//!
//! All 256 vectors funnel through per-vector stubs into one common tail.
//! The stub pushes the vector number (and a zero error-code slot when the
//! CPU does not supply one); the tail pushes the general-purpose registers,
//! hands the resulting [`SavedFrame`] pointer to [`interrupt_dispatch`] and
//! restores registers from whatever stack pointer it returns, so a context
//! switch is nothing more than returning a different task's saved `rsp`.

use super::context::SavedFrame;
use crate::sync::waiter::WaitSlot;

/// Timer IRQ vector (PIC line 0).
pub const VEC_TIMER: u64 = 32;
/// First hardware IRQ vector.
pub const VEC_IRQ_BASE: u64 = 32;
/// Last hardware IRQ vector (PIC line 15).
pub const VEC_IRQ_END: u64 = 47;
/// Voluntary yield gate (user-accessible).
pub const VEC_YIELD: u64 = 64;
/// Syscall gate (user-accessible).
pub const VEC_SYSCALL: u64 = 128;
/// Spurious interrupt vector.
pub const VEC_SPURIOUS: u64 = 255;

// Per-vector entry stubs and the common tail.
//
// CPU exceptions 8, 10-14, 17, 21, 29 and 30 push an error code; every
// other vector gets a zero placeholder so the frame layout is uniform.
// The tail's push order must match `SavedFrame`.
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
.altmacro

.macro isr_stub n
.align 16
isr_stub_\n:
.if (\n == 8) || (\n == 10) || (\n == 11) || (\n == 12) || (\n == 13) || (\n == 14) || (\n == 17) || (\n == 21) || (\n == 29) || (\n == 30)
    push \n
.else
    push 0
    push \n
.endif
    jmp isr_common
.endm

.macro isr_stub_addr n
    .quad isr_stub_\n
.endm

.section .text
.align 16
isr_common:
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    cld
    mov rdi, rsp
    call {dispatch}
    mov rsp, rax
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    add rsp, 16
    iretq

.set i, 0
.rept 256
    isr_stub %i
    .set i, i+1
.endr

.section .rodata
.align 8
.global ISR_STUB_TABLE
ISR_STUB_TABLE:
.set i, 0
.rept 256
    isr_stub_addr %i
    .set i, i+1
.endr

.section .text
"#,
    dispatch = sym interrupt_dispatch,
);

#[cfg(target_arch = "x86_64")]
extern "C" {
    /// Addresses of the 256 entry stubs, indexed by vector.
    pub static ISR_STUB_TABLE: [u64; 256];
}

/// Human-readable CPU exception names, indexed by vector.
const EXCEPTION_NAMES: [&str; 32] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack-segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating point",
    "alignment check",
    "machine check",
    "SIMD floating point",
    "virtualization",
    "control protection",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "hypervisor injection",
    "VMM communication",
    "security exception",
    "reserved",
];

/// Single-slot waiters for hardware IRQ lines 0-15.
///
/// A driver parks on its line with [`irq_wait`]; the dispatcher wakes the
/// slot when the IRQ fires, then acknowledges the controller.
static IRQ_WAITERS: [WaitSlot; 16] = [const { WaitSlot::new() }; 16];

/// Block the calling task until the given IRQ line fires.
pub fn irq_wait(line: usize) {
    IRQ_WAITERS[line].wait();
}

/// The dispatch core.
///
/// Entered from the common ISR tail with a pointer to the saved frame on
/// the interrupted task's kernel stack. The return value becomes the stack
/// pointer from which registers are restored; returning a different task's
/// saved pointer performs the context switch.
#[no_mangle]
pub extern "C" fn interrupt_dispatch(frame_ptr: u64) -> u64 {
    crate::panic::set_current_frame(frame_ptr);

    // SAFETY: the common tail passes the address of the SavedFrame it just
    // pushed on the current kernel stack; it stays alive until iretq.
    let frame = unsafe { &mut *(frame_ptr as *mut SavedFrame) };
    let vector = frame.vector;

    let mut next_rsp = frame_ptr;

    match vector {
        VEC_TIMER => {
            crate::sched::timer_tick();
            super::pic::end_of_interrupt(VEC_TIMER as u8);
            next_rsp = crate::sched::schedule(frame_ptr);
        }
        VEC_YIELD => {
            next_rsp = crate::sched::schedule(frame_ptr);
        }
        VEC_SYSCALL => {
            crate::syscall::dispatch(frame);
            // A blocking syscall parks and yields internally; by the time
            // control returns here the result is already in the frame.
        }
        14 => {
            next_rsp = handle_page_fault(frame, frame_ptr);
        }
        0..=13 | 15..=31 => {
            next_rsp = handle_exception(frame, frame_ptr);
        }
        v if (VEC_IRQ_BASE..=VEC_IRQ_END).contains(&v) => {
            let line = (v - VEC_IRQ_BASE) as usize;
            IRQ_WAITERS[line].wake();
            super::pic::end_of_interrupt(v as u8);
        }
        VEC_SPURIOUS => {
            // Spurious: no EOI, no work.
        }
        _ => {
            log::warn!("unexpected interrupt vector {}", vector);
        }
    }

    // Deliver pending signals to whichever task is about to resume, but
    // only on the way back out to user mode. A fatal disposition
    // terminates that task, so the frame must be rescheduled.
    // SAFETY: next_rsp is either our own frame or the saved frame stored by
    // a previous dispatch for the incoming task; both outlive this call.
    let out_frame = unsafe { &mut *(next_rsp as *mut SavedFrame) };
    if out_frame.from_user() && crate::process::signal::deliver_pending(out_frame) {
        next_rsp = crate::sched::schedule(next_rsp);
    }

    crate::panic::set_current_frame(0);
    next_rsp
}

/// Page fault demux: user faults go to the VMM; unresolved user faults
/// terminate the task, kernel faults are fatal.
fn handle_page_fault(frame: &mut SavedFrame, frame_ptr: u64) -> u64 {
    let fault_addr = read_fault_address();
    let was_write = frame.error_code & 0x2 != 0;
    let from_user = frame.from_user();

    match crate::mm::page_fault::handle_fault(fault_addr, was_write, from_user) {
        Ok(()) => frame_ptr,
        Err(_) if from_user => {
            log::warn!(
                "segmentation fault: task {} at {:#x} (rip {:#x})",
                crate::sched::current_task_id(),
                fault_addr,
                frame.rip
            );
            crate::process::exit::terminate_current(crate::process::signal::SIGSEGV);
            crate::sched::schedule(frame_ptr)
        }
        Err(e) => {
            panic!(
                "kernel page fault at {:#x} (rip {:#x}): {}",
                fault_addr, frame.rip, e
            );
        }
    }
}

/// Non-page-fault CPU exceptions: terminate user tasks, panic in the kernel.
fn handle_exception(frame: &mut SavedFrame, frame_ptr: u64) -> u64 {
    let name = EXCEPTION_NAMES[frame.vector as usize];
    if frame.from_user() {
        log::warn!(
            "task {} killed by {} (rip {:#x}, error {:#x})",
            crate::sched::current_task_id(),
            name,
            frame.rip,
            frame.error_code
        );
        let sig = match frame.vector {
            0 | 16 | 19 => crate::process::signal::SIGFPE,
            6 => crate::process::signal::SIGILL,
            _ => crate::process::signal::SIGSEGV,
        };
        crate::process::exit::terminate_current(sig);
        crate::sched::schedule(frame_ptr)
    } else {
        panic!(
            "kernel exception: {} (vector {}, error {:#x}, rip {:#x})",
            name, frame.vector, frame.error_code, frame.rip
        );
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn read_fault_address() -> u64 {
    use x86_64::registers::control::Cr2;
    Cr2::read_raw()
}

#[cfg(not(target_os = "none"))]
fn read_fault_address() -> u64 {
    0
}
