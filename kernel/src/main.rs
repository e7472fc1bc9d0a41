//! Basalt kernel binary
//!
//! Boot entry: consume the bootloader hand-off, bring up the memory
//! subsystems, descriptor tables and interrupt plumbing, start the
//! scheduler and the network/storage layers, then settle into the idle
//! loop.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot {
    extern crate alloc;

    use basalt_kernel::{
        arch, fs, logger, mm, net, panic as kpanic, println, process, sched,
    };
    use bootloader_api::{
        config::Mapping,
        entry_point,
        info::{MemoryRegionKind, Optional},
        BootInfo, BootloaderConfig,
    };

    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        // Full physical mapping: this is the HHDM the VMM depends on.
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

    fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
        println!("Basalt v{}", env!("CARGO_PKG_VERSION"));
        logger::init();

        // Boot hand-off: HHDM offset and framebuffer first, so faults can
        // be reported from here on.
        let hhdm = match boot_info.physical_memory_offset {
            Optional::Some(offset) => offset,
            Optional::None => panic!("bootloader did not map physical memory"),
        };
        mm::set_hhdm_offset(hhdm);

        if let Optional::Some(fb) = &mut boot_info.framebuffer {
            let info = fb.info();
            kpanic::register_framebuffer(kpanic::PanicFramebuffer {
                addr: fb.buffer_mut().as_mut_ptr(),
                width: info.width,
                height: info.height,
                pitch: info.stride * info.bytes_per_pixel,
                bytes_per_pixel: info.bytes_per_pixel,
            });
        }

        // Descriptor tables and the interrupt controller, before anything
        // can fault or fire.
        arch::init();

        // The kernel heap comes out of the first usable region that can
        // hold it; everything else goes to the frame allocator. The heap
        // must exist before the allocator logs (or anything allocates).
        let heap_size = mm::heap::HEAP_SIZE as u64;
        let heap_start = boot_info
            .memory_regions
            .iter()
            .find(|r| {
                r.kind == MemoryRegionKind::Usable
                    && r.start >= 0x10_0000
                    && r.end - r.start >= heap_size
            })
            .map(|r| r.start)
            .expect("no usable region large enough for the kernel heap");
        mm::heap::init(mm::PhysicalAddress::new(heap_start), mm::heap::HEAP_SIZE);
        let heap_end = heap_start + heap_size;

        mm::frame_allocator::init(
            boot_info
                .memory_regions
                .iter()
                .filter(|r| r.kind == MemoryRegionKind::Usable)
                .flat_map(|r| {
                    // Split each region around the heap carve.
                    let below = (r.start, r.end.min(heap_start));
                    let above = (r.start.max(heap_end), r.end);
                    [below, above].into_iter().filter(|(s, e)| s < e)
                }),
        );

        // The active boot page tables become the canonical kernel root;
        // every user root copies its upper half.
        mm::vas::set_kernel_root(mm::PhysicalAddress::new(arch::x86_64::read_cr3()));

        sched::init();
        arch::x86_64::timer::init();

        // Network: the loopback device carries local traffic until a NIC
        // driver registers; the pump thread drains the RX mailbox.
        net::device::register(alloc::boxed::Box::new(net::device::LoopbackDevice::new()));
        net::init();
        let _ = sched::spawn_kernel("net_rx", net::device::rx_pump);

        // Storage: ramdisk-backed journal until a disk driver registers.
        if let Err(e) = fs::init() {
            log::warn!("fs: mount failed: {}", e);
        }

        // First user program, when one is embedded.
        if process::loader::find_image("/bin/init").is_some() {
            log::info!("init image present; exec from the first user task");
        }

        x86_64::instructions::interrupts::enable();
        log::info!("boot complete; entering idle loop");

        loop {
            x86_64::instructions::hlt();
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        kpanic::kernel_panic(info)
    }
}

// Host builds of the binary exist only so `cargo test` can link the
// workspace; the kernel proper runs on bare metal.
#[cfg(not(target_os = "none"))]
fn main() {}
