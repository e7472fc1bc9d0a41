// Global Descriptor Table

use lazy_static::lazy_static;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

// Mutable so the scheduler can retarget rsp0 at every switch; accessed only
// through raw pointers with interrupts disabled.
static mut TSS: TaskStateSegment = TaskStateSegment::new();

fn tss_init() -> &'static TaskStateSegment {
    // SAFETY: called once from GDT construction before interrupts are
    // enabled; afterwards only set_kernel_stack writes, always with
    // interrupts disabled.
    unsafe {
        let tss = &mut *(&raw mut TSS);

        // Boot kernel stack for ring 0 transitions, until the scheduler
        // installs per-task stacks. Must be 16-byte aligned.
        tss.privilege_stack_table[0] = {
            const STACK_SIZE: usize = 4096 * 5;
            #[repr(align(16))]
            struct AlignedStack([u8; STACK_SIZE]);
            static mut BOOT_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_start = VirtAddr::from_ptr(&raw const BOOT_STACK);
            stack_start + STACK_SIZE as u64
        };

        // Dedicated double fault stack (16-byte aligned).
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            const STACK_SIZE: usize = 4096 * 5;
            #[repr(align(16))]
            struct AlignedStack([u8; STACK_SIZE]);
            static mut STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_start = VirtAddr::from_ptr(&raw const STACK);
            stack_start + STACK_SIZE as u64
        };

        &*(&raw const TSS)
    }
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let tss = tss_init();
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());    // 0x08
        let data_selector = gdt.append(Descriptor::kernel_data_segment());    // 0x10
        let tss_selector = gdt.append(Descriptor::tss_segment(tss));          // 0x18 (2 entries)
        let user_data_selector = gdt.append(Descriptor::user_data_segment()); // 0x28 (+ RPL 3 = 0x2B)
        let user_code_selector = gdt.append(Descriptor::user_code_segment()); // 0x30 (+ RPL 3 = 0x33)
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                tss_selector,
                user_data_selector,
                user_code_selector,
            },
        )
    };
}

/// GDT segment selectors for kernel and user mode.
///
/// Layout:
/// - 0x00: Null descriptor
/// - 0x08: Kernel code segment (Ring 0)
/// - 0x10: Kernel data segment (Ring 0)
/// - 0x18: TSS (occupies 2 entries, 0x18-0x20)
/// - 0x28: User data segment (Ring 3, selector 0x2B with RPL)
/// - 0x30: User code segment (Ring 3, selector 0x33 with RPL)
pub struct Selectors {
    pub code_selector: SegmentSelector,
    pub data_selector: SegmentSelector,
    pub tss_selector: SegmentSelector,
    pub user_data_selector: SegmentSelector,
    pub user_code_selector: SegmentSelector,
}

pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Point the TSS ring-0 stack at the given kernel stack top.
///
/// Called by the scheduler on every switch so the next interrupt taken in
/// user mode lands on the incoming task's own kernel stack.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: single writer (the scheduler, with interrupts disabled); the
    // CPU reads the field only during a ring transition.
    unsafe {
        (*(&raw mut TSS)).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}

#[cfg(target_os = "none")]
pub fn init() {
    use x86_64::instructions::{
        segmentation::{Segment, CS, DS, ES, SS},
        tables::load_tss,
    };

    GDT.0.load();
    // SAFETY: the selectors index the GDT just loaded and stay valid for
    // the kernel's lifetime.
    unsafe {
        CS::set_reg(GDT.1.code_selector);
        SS::set_reg(GDT.1.data_selector);
        DS::set_reg(GDT.1.data_selector);
        ES::set_reg(GDT.1.data_selector);
        load_tss(GDT.1.tss_selector);
    }
}

#[cfg(not(target_os = "none"))]
pub fn init() {}
