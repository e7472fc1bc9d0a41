//! Virtual address spaces
//!
//! An [`AddressSpace`] owns the user half of one 4-level hierarchy: the L4
//! root plus a sorted, non-overlapping set of [`Vma`] regions describing
//! what the user may touch. Pages are materialized lazily by the fault
//! handler; fork shares frames copy-on-write.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use super::{
    page_table, PageFlags, PhysicalAddress, VirtualAddress, FRAME_ALLOCATOR, PAGE_SIZE,
    USER_HALF_END,
};
use crate::error::{KernelError, KernelResult};

bitflags! {
    /// Access permissions of a virtual memory area.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

/// What backs a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaKind {
    /// Zero-filled on first touch.
    Anonymous,
    /// The user stack; grows within its reserved range.
    Stack,
}

/// A half-open range `[start, end)` of user virtual addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
    pub flags: VmaFlags,
    pub kind: VmaKind,
}

impl Vma {
    pub fn new(start: u64, end: u64, flags: VmaFlags, kind: VmaKind) -> Self {
        debug_assert!(start < end);
        debug_assert_eq!(start % PAGE_SIZE as u64, 0);
        debug_assert_eq!(end % PAGE_SIZE as u64, 0);
        Self {
            start,
            end,
            flags,
            kind,
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Leaf page-table flags this region's pages are mapped with.
    pub fn page_flags(&self) -> PageFlags {
        let mut flags = PageFlags::PRESENT | PageFlags::USER;
        if self.flags.contains(VmaFlags::WRITE) {
            flags |= PageFlags::WRITABLE;
        }
        flags
    }
}

/// Sorted, non-overlapping collection of VMAs.
#[derive(Debug, Default, Clone)]
pub struct VmaSet {
    vmas: Vec<Vma>,
}

impl VmaSet {
    pub const fn new() -> Self {
        Self { vmas: Vec::new() }
    }

    /// Insert a region, rejecting any overlap with an existing one.
    pub fn insert(&mut self, vma: Vma) -> KernelResult<()> {
        let pos = self.vmas.partition_point(|v| v.start < vma.start);
        if pos > 0 && self.vmas[pos - 1].end > vma.start {
            return Err(KernelError::InvalidArgument {
                name: "vma",
                value: "overlaps existing region",
            });
        }
        if pos < self.vmas.len() && self.vmas[pos].start < vma.end {
            return Err(KernelError::InvalidArgument {
                name: "vma",
                value: "overlaps existing region",
            });
        }
        self.vmas.insert(pos, vma);
        Ok(())
    }

    /// The region containing `addr`, if any.
    pub fn find(&self, addr: u64) -> Option<&Vma> {
        let pos = self.vmas.partition_point(|v| v.end <= addr);
        self.vmas.get(pos).filter(|v| v.contains(addr))
    }

    /// Remove every region fully inside `[start, end)` and return them.
    ///
    /// A region straddling the range boundary is an error; this kernel does
    /// not split VMAs.
    pub fn remove_range(&mut self, start: u64, end: u64) -> KernelResult<Vec<Vma>> {
        if self
            .vmas
            .iter()
            .any(|v| v.start < end && v.end > start && !(v.start >= start && v.end <= end))
        {
            return Err(KernelError::InvalidArgument {
                name: "range",
                value: "splits a region",
            });
        }
        let mut removed = Vec::new();
        self.vmas.retain(|v| {
            if v.start >= start && v.end <= end {
                removed.push(*v);
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.vmas.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.vmas.is_empty()
    }

    /// Highest end address in use, for placing new anonymous regions.
    pub fn highest_end(&self) -> u64 {
        self.vmas.last().map(|v| v.end).unwrap_or(0)
    }
}

/// Canonical kernel L4 root; its upper half is copied into every user root.
static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

pub fn set_kernel_root(root: PhysicalAddress) {
    KERNEL_ROOT.store(root.as_u64(), Ordering::Relaxed);
}

pub fn kernel_root() -> PhysicalAddress {
    PhysicalAddress::new(KERNEL_ROOT.load(Ordering::Relaxed))
}

/// One user address space: an owned L4 root plus its VMA set.
pub struct AddressSpace {
    root: PhysicalAddress,
    pub vmas: VmaSet,
    /// Current program break for `brk`.
    brk: u64,
}

impl AddressSpace {
    /// Create an empty user address space sharing the kernel upper half.
    pub fn new_user() -> KernelResult<Self> {
        let root = page_table::new_user_root(kernel_root())?;
        Ok(Self {
            root,
            vmas: VmaSet::new(),
            brk: 0,
        })
    }

    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Register a demand-paged region. No frames are allocated here.
    pub fn add_region(
        &mut self,
        start: u64,
        len: usize,
        flags: VmaFlags,
        kind: VmaKind,
    ) -> KernelResult<()> {
        let end = start
            .checked_add(len as u64)
            .ok_or(KernelError::InvalidArgument {
                name: "len",
                value: "wraps",
            })?;
        if end > USER_HALF_END {
            return Err(KernelError::BadUserPointer {
                addr: start as usize,
                len,
            });
        }
        self.vmas.insert(Vma::new(start, end, flags, kind))
    }

    /// Drop the regions inside `[start, start+len)`, unmapping and
    /// unreferencing any pages that were materialized.
    pub fn unmap_region(&mut self, start: u64, len: usize) -> KernelResult<()> {
        let end = start + len as u64;
        let removed = self.vmas.remove_range(start, end)?;
        for vma in removed {
            let mut page = vma.start;
            while page < vma.end {
                if let Ok(frame) = page_table::unmap(self.root, VirtualAddress::new(page)) {
                    let _ = FRAME_ALLOCATOR.lock().unref_frame(frame);
                }
                page += PAGE_SIZE as u64;
            }
        }
        Ok(())
    }

    /// Adjust the program break, growing or shrinking the heap region.
    /// Returns the resulting break; passing 0 only queries it.
    pub fn set_brk(&mut self, new_brk: u64) -> KernelResult<u64> {
        if new_brk == 0 {
            return Ok(self.brk);
        }
        let old_end = align_up(self.brk);
        let new_end = align_up(new_brk);
        if new_end > old_end {
            self.add_region(
                old_end,
                (new_end - old_end) as usize,
                VmaFlags::READ | VmaFlags::WRITE,
                VmaKind::Anonymous,
            )?;
        } else if new_end < old_end {
            self.unmap_region(new_end, (old_end - new_end) as usize)?;
        }
        self.brk = new_brk;
        Ok(self.brk)
    }

    /// Seed the break after exec has placed the image.
    pub fn init_brk(&mut self, brk: u64) {
        self.brk = align_up(brk);
    }

    /// COW-clone this space for fork.
    ///
    /// Frames become shared read-only in both parent and child; the first
    /// write on either side splits them. On failure the partially built
    /// child is torn down before the error propagates.
    pub fn fork(&mut self) -> KernelResult<AddressSpace> {
        let child_root = page_table::new_user_root(kernel_root())?;
        if let Err(e) = page_table::clone_user_half(self.root, child_root) {
            page_table::destroy_user_root(child_root);
            return Err(e);
        }
        Ok(AddressSpace {
            root: child_root,
            vmas: self.vmas.clone(),
            brk: self.brk,
        })
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        page_table::destroy_user_root(self.root);
    }
}

fn align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vma(start: u64, end: u64) -> Vma {
        Vma::new(start, end, VmaFlags::READ | VmaFlags::WRITE, VmaKind::Anonymous)
    }

    #[test]
    fn insert_keeps_regions_sorted() {
        let mut set = VmaSet::new();
        set.insert(vma(0x3000, 0x4000)).unwrap();
        set.insert(vma(0x1000, 0x2000)).unwrap();
        set.insert(vma(0x5000, 0x8000)).unwrap();

        let starts: Vec<u64> = set.iter().map(|v| v.start).collect();
        assert_eq!(starts, [0x1000, 0x3000, 0x5000]);
    }

    #[test]
    fn overlapping_insert_is_rejected() {
        let mut set = VmaSet::new();
        set.insert(vma(0x1000, 0x3000)).unwrap();
        assert!(set.insert(vma(0x2000, 0x4000)).is_err());
        assert!(set.insert(vma(0x0, 0x2000)).is_err());
        // Adjacent is fine
        set.insert(vma(0x3000, 0x4000)).unwrap();
    }

    #[test]
    fn find_respects_half_open_bounds() {
        let mut set = VmaSet::new();
        set.insert(vma(0x1000, 0x3000)).unwrap();
        assert!(set.find(0x0FFF).is_none());
        assert!(set.find(0x1000).is_some());
        assert!(set.find(0x2FFF).is_some());
        assert!(set.find(0x3000).is_none());
    }

    #[test]
    fn remove_range_refuses_to_split() {
        let mut set = VmaSet::new();
        set.insert(vma(0x1000, 0x3000)).unwrap();
        assert!(set.remove_range(0x2000, 0x4000).is_err());
        let removed = set.remove_range(0x1000, 0x3000).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn writable_vma_maps_writable_pages() {
        let v = vma(0x1000, 0x2000);
        assert!(v.page_flags().contains(PageFlags::WRITABLE));
        assert!(v.page_flags().contains(PageFlags::USER));

        let ro = Vma::new(0x1000, 0x2000, VmaFlags::READ, VmaKind::Anonymous);
        assert!(!ro.page_flags().contains(PageFlags::WRITABLE));
    }
}
