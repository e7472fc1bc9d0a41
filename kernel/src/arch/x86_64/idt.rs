// Interrupt Descriptor Table
//
// All 256 vectors point at the raw entry stubs from isr.rs so every
// interrupt funnels through the common saved-frame tail. Layout:
// 0-31 CPU exceptions, 32-47 PIC IRQs, 64 yield, 128 syscall, 255 spurious.
// Only the yield and syscall gates are reachable from ring 3.

use lazy_static::lazy_static;
use x86_64::{
    structures::idt::InterruptDescriptorTable, PrivilegeLevel, VirtAddr,
};

use super::isr::{ISR_STUB_TABLE, VEC_SYSCALL, VEC_YIELD};

fn stub(vector: usize) -> VirtAddr {
    // SAFETY: ISR_STUB_TABLE is a read-only table of 256 stub addresses
    // emitted by the global_asm block in isr.rs.
    VirtAddr::new(unsafe { ISR_STUB_TABLE[vector] })
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        // SAFETY: every stub address comes from the generated table and
        // follows the saved-frame protocol the common tail expects.
        unsafe {
            idt.divide_error.set_handler_addr(stub(0));
            idt.debug.set_handler_addr(stub(1));
            idt.non_maskable_interrupt.set_handler_addr(stub(2));
            idt.breakpoint.set_handler_addr(stub(3));
            idt.overflow.set_handler_addr(stub(4));
            idt.bound_range_exceeded.set_handler_addr(stub(5));
            idt.invalid_opcode.set_handler_addr(stub(6));
            idt.device_not_available.set_handler_addr(stub(7));
            idt.double_fault
                .set_handler_addr(stub(8))
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
            idt.invalid_tss.set_handler_addr(stub(10));
            idt.segment_not_present.set_handler_addr(stub(11));
            idt.stack_segment_fault.set_handler_addr(stub(12));
            idt.general_protection_fault.set_handler_addr(stub(13));
            idt.page_fault.set_handler_addr(stub(14));
            idt.x87_floating_point.set_handler_addr(stub(16));
            idt.alignment_check.set_handler_addr(stub(17));
            idt.machine_check.set_handler_addr(stub(18));
            idt.simd_floating_point.set_handler_addr(stub(19));
            idt.virtualization.set_handler_addr(stub(20));

            // Hardware IRQs, the software gates and everything above.
            for vector in 32..=255usize {
                let options = idt[vector as u8].set_handler_addr(stub(vector));
                if vector as u64 == VEC_YIELD || vector as u64 == VEC_SYSCALL {
                    options.set_privilege_level(PrivilegeLevel::Ring3);
                }
            }
        }

        idt
    };
}

#[cfg(target_os = "none")]
pub fn init() {
    IDT.load();
}

#[cfg(not(target_os = "none"))]
pub fn init() {}
