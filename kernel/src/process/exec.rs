//! Program image replacement
//!
//! Exec tears the caller's user half down, builds a fresh address space
//! from the ELF image, lays out an initial stack carrying argv/envp, and
//! rewrites the caller's saved frame so the pending `iretq` enters the new
//! program at its entry point.

use alloc::{string::String, sync::Arc, vec::Vec};

use super::loader::{self, ElfImage};
use crate::{
    arch::x86_64::context::SavedFrame,
    error::{KernelError, KernelResult},
    mm::{
        frame_allocator::alloc_zeroed_frame,
        page_table, phys_to_virt,
        vas::{AddressSpace, VmaFlags, VmaKind},
        PhysicalAddress, VirtualAddress, PAGE_SIZE,
    },
    sched::TASKS,
    sync::SpinLock,
};

/// Top of the user stack region.
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;
/// Reserved stack range: 8 MiB, demand-paged.
pub const USER_STACK_SIZE: u64 = 8 * 1024 * 1024;

fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Copy bytes into a not-yet-active address space, materializing pages as
/// needed. Pages are created with the supplied leaf flags.
fn write_user_bytes(
    root: PhysicalAddress,
    vaddr: u64,
    bytes: &[u8],
    flags: crate::mm::PageFlags,
) -> KernelResult<()> {
    let mut written = 0usize;
    while written < bytes.len() {
        let addr = vaddr + written as u64;
        let page = VirtualAddress::new(page_align_down(addr));
        let offset = (addr - page.as_u64()) as usize;
        let chunk = (PAGE_SIZE - offset).min(bytes.len() - written);

        let frame = match page_table::translate(root, page) {
            Some((frame, _)) => frame,
            None => {
                let frame = alloc_zeroed_frame()?;
                page_table::map(root, page, frame, flags)?;
                frame
            }
        };

        // SAFETY: the frame belongs to the image being built and is fully
        // covered by the HHDM; nothing else references it yet.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes[written..].as_ptr(),
                phys_to_virt(frame).add(offset),
                chunk,
            );
        }
        written += chunk;
    }
    Ok(())
}

/// Place the image's PT_LOAD segments into `space`.
fn load_segments(space: &mut AddressSpace, data: &[u8], image: &ElfImage) -> KernelResult<()> {
    for seg in &image.segments {
        let start = page_align_down(seg.vaddr);
        let end = page_align_up(seg.vaddr + seg.mem_size);
        space.add_region(start, (end - start) as usize, seg.flags, VmaKind::Anonymous)?;

        if seg.file_size > 0 {
            let file = &data[seg.file_offset as usize..(seg.file_offset + seg.file_size) as usize];
            // Copy with writable leaves so the copy itself works; the VMA
            // flags decide what the program may do afterwards.
            write_user_bytes(
                space.root(),
                seg.vaddr,
                file,
                crate::mm::PageFlags::PRESENT
                    | crate::mm::PageFlags::WRITABLE
                    | crate::mm::PageFlags::USER,
            )?;
        }
    }
    Ok(())
}

/// Build the initial user stack: strings, the envp and argv pointer
/// arrays, then argc at the final `rsp`.
fn build_user_stack(
    space: &mut AddressSpace,
    argv: &[String],
    envp: &[String],
) -> KernelResult<u64> {
    space.add_region(
        USER_STACK_TOP - USER_STACK_SIZE,
        USER_STACK_SIZE as usize,
        VmaFlags::READ | VmaFlags::WRITE,
        VmaKind::Stack,
    )?;

    let root = space.root();
    let stack_flags =
        crate::mm::PageFlags::PRESENT | crate::mm::PageFlags::WRITABLE | crate::mm::PageFlags::USER;
    let mut sp = USER_STACK_TOP;

    let mut push_string = |sp: &mut u64, s: &str| -> KernelResult<u64> {
        *sp -= s.len() as u64 + 1;
        write_user_bytes(root, *sp, s.as_bytes(), stack_flags)?;
        write_user_bytes(root, *sp + s.len() as u64, &[0], stack_flags)?;
        Ok(*sp)
    };

    let mut env_ptrs = Vec::with_capacity(envp.len());
    for s in envp.iter().rev() {
        env_ptrs.push(push_string(&mut sp, s)?);
    }
    env_ptrs.reverse();

    let mut arg_ptrs = Vec::with_capacity(argv.len());
    for s in argv.iter().rev() {
        arg_ptrs.push(push_string(&mut sp, s)?);
    }
    arg_ptrs.reverse();

    sp &= !0xF;

    let mut push_word = |sp: &mut u64, word: u64| -> KernelResult<()> {
        *sp -= 8;
        write_user_bytes(root, *sp, &word.to_le_bytes(), stack_flags)
    };

    push_word(&mut sp, 0)?; // envp terminator
    for ptr in env_ptrs.iter().rev() {
        push_word(&mut sp, *ptr)?;
    }
    push_word(&mut sp, 0)?; // argv terminator
    for ptr in arg_ptrs.iter().rev() {
        push_word(&mut sp, *ptr)?;
    }
    push_word(&mut sp, argv.len() as u64)?; // argc

    Ok(sp)
}

/// Replace the current process image.
///
/// On success the caller's saved frame resumes the new program; the old
/// user half is gone. On failure the old image is untouched.
pub fn exec_current(
    frame: &mut SavedFrame,
    path: &str,
    argv: &[String],
    envp: &[String],
) -> KernelResult<()> {
    let data = loader::find_image(path).ok_or(KernelError::NotFound {
        resource: "program image",
        id: 0,
    })?;
    let image = loader::parse(data)?;

    let mut space = AddressSpace::new_user()?;
    load_segments(&mut space, data, &image)?;
    let rsp = build_user_stack(&mut space, argv, envp)?;
    space.init_brk(image.image_end());

    let new_root = space.root().as_u64();
    let new_space = Arc::new(SpinLock::new(space));

    // Swap the address space under the table lock, then move CR3 off the
    // old root before its last reference can drop it.
    let old_space = {
        let mut table = TASKS.lock();
        let cur = table.current;
        let task = &mut table.tasks[cur];
        task.name = Some(String::from(path));
        // A kernel task exec'ing its first program gets the standard
        // descriptor and disposition tables here.
        if task.fd_table.is_none() {
            task.fd_table = Some(Arc::new(SpinLock::new(
                crate::process::fd::FdTable::with_console(),
            )));
        }
        match &task.signal_actions {
            Some(actions) => actions.lock().reset_for_exec(),
            None => {
                task.signal_actions = Some(Arc::new(SpinLock::new(
                    crate::process::signal::SignalActions::new(),
                )));
            }
        }
        core::mem::replace(&mut task.address_space, Some(new_space))
    };
    crate::arch::x86_64::write_cr3(new_root);
    drop(old_space);

    frame.enter_user_at(image.entry, rsp);
    log::info!("exec {}: entry {:#x}", path, image.entry);
    Ok(())
}
