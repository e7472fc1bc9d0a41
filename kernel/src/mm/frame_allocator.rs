//! Physical frame allocator
//!
//! Bitmap allocator over the boot memory map with a per-frame reference
//! count. The counts exist for copy-on-write: a frame shared by several
//! address spaces is freed only when the last mapping lets go. Ref and
//! unref are O(1) and must stay symmetric across COW fork and unmap.

use super::{PhysicalAddress, FRAME_SIZE};
use crate::{
    error::{KernelError, KernelResult},
    sync::SpinLock,
};

/// Maximum physical memory managed: 128K frames = 512 MiB.
pub const MAX_FRAMES: usize = 128 * 1024;

const BITMAP_WORDS: usize = MAX_FRAMES / 64;

/// Bitmap + refcount state. Bit set = frame free.
pub struct FrameAllocator {
    bitmap: [u64; BITMAP_WORDS],
    refcounts: [u16; MAX_FRAMES],
    free_frames: usize,
    /// Rotating search start, so allocation does not rescan low memory.
    next_hint: usize,
}

// Taken on the page-fault path, so it must be the interrupt-safe lock.
pub static FRAME_ALLOCATOR: SpinLock<FrameAllocator> = SpinLock::new(FrameAllocator::new());

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            bitmap: [0; BITMAP_WORDS],
            refcounts: [0; MAX_FRAMES],
            free_frames: 0,
            next_hint: 0,
        }
    }

    /// Mark the frames covering `[start, end)` as usable.
    ///
    /// Called once per usable boot memory region. Partial frames at region
    /// edges are discarded.
    pub fn add_region(&mut self, start: PhysicalAddress, end: PhysicalAddress) {
        let first = start.as_u64().div_ceil(FRAME_SIZE as u64) as usize;
        let last = (end.as_u64() / FRAME_SIZE as u64) as usize;
        for frame in first..last.min(MAX_FRAMES) {
            if !self.is_free(frame) {
                self.set_free(frame);
                self.free_frames += 1;
            }
        }
    }

    fn is_free(&self, frame: usize) -> bool {
        self.bitmap[frame / 64] & (1 << (frame % 64)) != 0
    }

    fn set_free(&mut self, frame: usize) {
        self.bitmap[frame / 64] |= 1 << (frame % 64);
    }

    fn set_used(&mut self, frame: usize) {
        self.bitmap[frame / 64] &= !(1 << (frame % 64));
    }

    /// Allocate one frame. The new frame's reference count is 1; contents
    /// are undefined (callers zero through the HHDM when semantics demand).
    pub fn alloc_frame(&mut self) -> KernelResult<PhysicalAddress> {
        if self.free_frames == 0 {
            return Err(KernelError::OutOfMemory);
        }

        let start_word = self.next_hint / 64;
        for i in 0..BITMAP_WORDS {
            let word_idx = (start_word + i) % BITMAP_WORDS;
            let word = self.bitmap[word_idx];
            if word == 0 {
                continue;
            }
            let bit = word.trailing_zeros() as usize;
            let frame = word_idx * 64 + bit;
            self.set_used(frame);
            self.free_frames -= 1;
            self.refcounts[frame] = 1;
            self.next_hint = frame;
            return Ok(PhysicalAddress::new((frame * FRAME_SIZE) as u64));
        }

        Err(KernelError::OutOfMemory)
    }

    /// Increment a frame's reference count.
    pub fn ref_frame(&mut self, frame: PhysicalAddress) {
        let idx = frame.frame_index();
        debug_assert!(self.refcounts[idx] > 0, "ref of free frame");
        self.refcounts[idx] += 1;
    }

    /// Decrement a frame's reference count, freeing it when the count
    /// reaches zero. Returns the remaining count.
    pub fn unref_frame(&mut self, frame: PhysicalAddress) -> KernelResult<u16> {
        let idx = frame.frame_index();
        if idx >= MAX_FRAMES || self.refcounts[idx] == 0 {
            return Err(KernelError::InvalidAddress {
                addr: frame.as_u64() as usize,
            });
        }
        self.refcounts[idx] -= 1;
        if self.refcounts[idx] == 0 {
            self.set_free(idx);
            self.free_frames += 1;
        }
        Ok(self.refcounts[idx])
    }

    /// Release a frame the caller owns exclusively.
    ///
    /// Double-free is a bug; it surfaces as `InvalidAddress`.
    pub fn free_frame(&mut self, frame: PhysicalAddress) -> KernelResult<()> {
        self.unref_frame(frame).map(|_| ())
    }

    /// Current reference count of a frame.
    pub fn refcount(&self, frame: PhysicalAddress) -> u16 {
        self.refcounts[frame.frame_index()]
    }

    /// Number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_frames
    }
}

/// Allocate a frame and zero it through the direct map.
pub fn alloc_zeroed_frame() -> KernelResult<PhysicalAddress> {
    let frame = FRAME_ALLOCATOR.lock().alloc_frame()?;
    let virt = super::phys_to_virt(frame);
    // SAFETY: a freshly allocated frame is exclusively ours and fully
    // covered by the HHDM.
    unsafe {
        core::ptr::write_bytes(virt, 0, FRAME_SIZE);
    }
    Ok(frame)
}

/// Seed the global allocator from the boot memory map.
pub fn init<I: Iterator<Item = (u64, u64)>>(usable_regions: I) {
    let mut alloc = FRAME_ALLOCATOR.lock();
    for (start, end) in usable_regions {
        alloc.add_region(PhysicalAddress::new(start), PhysicalAddress::new(end));
    }
    log::info!(
        "frame allocator: {} frames ({} MiB) available",
        alloc.free_count(),
        alloc.free_count() * FRAME_SIZE / (1024 * 1024)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed_allocator() -> alloc::boxed::Box<FrameAllocator> {
        // The refcount table is large; keep test instances off the stack.
        alloc::boxed::Box::new(FrameAllocator::new())
    }

    #[test]
    fn alloc_and_free_round_trip() {
        let mut a = boxed_allocator();
        a.add_region(PhysicalAddress::new(0x10000), PhysicalAddress::new(0x20000));
        assert_eq!(a.free_count(), 16);

        let f = a.alloc_frame().unwrap();
        assert!(f.is_frame_aligned());
        assert_eq!(a.refcount(f), 1);
        assert_eq!(a.free_count(), 15);

        a.free_frame(f).unwrap();
        assert_eq!(a.free_count(), 16);
        assert_eq!(a.refcount(f), 0);
    }

    #[test]
    fn double_free_is_an_error() {
        let mut a = boxed_allocator();
        a.add_region(PhysicalAddress::new(0x10000), PhysicalAddress::new(0x14000));
        let f = a.alloc_frame().unwrap();
        a.free_frame(f).unwrap();
        assert!(a.free_frame(f).is_err());
    }

    #[test]
    fn refcounts_track_cow_sharing() {
        let mut a = boxed_allocator();
        a.add_region(PhysicalAddress::new(0x10000), PhysicalAddress::new(0x20000));
        let f = a.alloc_frame().unwrap();

        a.ref_frame(f);
        assert_eq!(a.refcount(f), 2);

        // First unref keeps the frame allocated
        assert_eq!(a.unref_frame(f).unwrap(), 1);
        assert_eq!(a.refcount(f), 1);
        let before = a.free_count();

        // Last unref frees
        assert_eq!(a.unref_frame(f).unwrap(), 0);
        assert_eq!(a.free_count(), before + 1);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mut a = boxed_allocator();
        a.add_region(PhysicalAddress::new(0x10000), PhysicalAddress::new(0x12000));
        a.alloc_frame().unwrap();
        a.alloc_frame().unwrap();
        assert_eq!(a.alloc_frame(), Err(KernelError::OutOfMemory));
    }

    #[test]
    fn partial_frames_at_region_edges_are_discarded() {
        let mut a = boxed_allocator();
        a.add_region(PhysicalAddress::new(0x10800), PhysicalAddress::new(0x13800));
        // Only 0x11000 and 0x12000 are fully contained
        assert_eq!(a.free_count(), 2);
    }
}
