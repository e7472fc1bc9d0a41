//! 4-level page tables
//!
//! Entries, tables and the walk operations: map, unmap, translate, the
//! copy-on-write fork walk, and bottom-up teardown. All table memory is
//! touched through the high-half direct map, so a table is addressable
//! from any address space.

use core::ops::{Index, IndexMut};

use super::{
    phys_to_virt, PageFlags, PhysicalAddress, VirtualAddress, FRAME_ALLOCATOR, FRAME_SIZE,
};
use crate::error::{KernelError, KernelResult};

/// Number of entries in a page table
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// Page table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry {
    entry: u64,
}

impl PageTableEntry {
    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// Create an empty/unused entry
    pub const fn empty() -> Self {
        Self { entry: 0 }
    }

    pub const fn is_unused(&self) -> bool {
        self.entry == 0
    }

    pub const fn is_present(&self) -> bool {
        self.entry & PageFlags::PRESENT.bits() != 0
    }

    /// Physical address this entry points to, if present.
    pub fn addr(&self) -> Option<PhysicalAddress> {
        if self.is_present() {
            Some(PhysicalAddress::new(self.entry & Self::ADDR_MASK))
        } else {
            None
        }
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.entry)
    }

    pub fn set(&mut self, addr: PhysicalAddress, flags: PageFlags) {
        self.entry = (addr.as_u64() & Self::ADDR_MASK) | flags.bits();
    }

    /// Replace the flag bits, keeping the frame address.
    pub fn set_flags(&mut self, flags: PageFlags) {
        self.entry = (self.entry & Self::ADDR_MASK) | flags.bits();
    }

    pub fn clear(&mut self) {
        self.entry = 0;
    }
}

/// A page table with 512 entries
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::empty(); PAGE_TABLE_ENTRIES],
        }
    }

    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PageTableEntry> {
        self.entries.iter_mut()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// Virtual address broken into page table indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressBreakdown {
    pub l4: usize,
    pub l3: usize,
    pub l2: usize,
    pub l1: usize,
    pub offset: usize,
}

impl AddressBreakdown {
    pub fn new(addr: VirtualAddress) -> Self {
        let addr = addr.as_u64();
        Self {
            l4: ((addr >> 39) & 0x1FF) as usize,
            l3: ((addr >> 30) & 0x1FF) as usize,
            l2: ((addr >> 21) & 0x1FF) as usize,
            l1: ((addr >> 12) & 0x1FF) as usize,
            offset: (addr & 0xFFF) as usize,
        }
    }
}

/// Borrow a page table through its HHDM alias.
///
/// # Safety
///
/// `addr` must be the physical address of a live page table, and the caller
/// must hold whatever lock serializes mutation of the owning hierarchy.
unsafe fn table_mut<'a>(addr: PhysicalAddress) -> &'a mut PageTable {
    // SAFETY: per the function contract; the HHDM covers all physical memory.
    unsafe { &mut *(phys_to_virt(addr) as *mut PageTable) }
}

/// Allocate a zeroed frame for an intermediate or root table.
fn alloc_table() -> KernelResult<PhysicalAddress> {
    super::frame_allocator::alloc_zeroed_frame()
}

/// Walk to the L1 table covering `virt`, optionally allocating missing
/// intermediate levels.
///
/// Intermediate entries always carry present|writable; `user` additionally
/// sets the user bit so ring 3 can reach user-visible leaves.
fn walk_to_l1(
    root: PhysicalAddress,
    virt: VirtualAddress,
    allocate: bool,
    user: bool,
) -> KernelResult<Option<PhysicalAddress>> {
    let idx = AddressBreakdown::new(virt);
    let mut table_addr = root;

    for level_index in [idx.l4, idx.l3, idx.l2] {
        // SAFETY: table_addr is the root supplied by the owning address
        // space, or an intermediate discovered through a present entry.
        let table = unsafe { table_mut(table_addr) };
        let entry = &mut table[level_index];

        if !entry.is_present() {
            if !allocate {
                return Ok(None);
            }
            let new_table = alloc_table()?;
            let mut flags = PageFlags::PRESENT | PageFlags::WRITABLE;
            if user {
                flags |= PageFlags::USER;
            }
            entry.set(new_table, flags);
        } else if user && !entry.flags().contains(PageFlags::USER) {
            // An existing intermediate on a user path must be reachable
            // from ring 3 as well.
            entry.set_flags(entry.flags() | PageFlags::USER);
        }

        table_addr = entry.addr().expect("entry was just set present");
    }

    Ok(Some(table_addr))
}

/// Map `virt` to `phys` in the hierarchy rooted at `root`.
///
/// Leaf flags are the caller's; present is implied.
pub fn map(
    root: PhysicalAddress,
    virt: VirtualAddress,
    phys: PhysicalAddress,
    flags: PageFlags,
) -> KernelResult<()> {
    let user = flags.contains(PageFlags::USER);
    let l1_addr = walk_to_l1(root, virt, true, user)?.expect("allocating walk cannot miss");
    // SAFETY: walk_to_l1 returned a live L1 table in this hierarchy.
    let l1 = unsafe { table_mut(l1_addr) };
    let entry = &mut l1[AddressBreakdown::new(virt).l1];
    if entry.is_present() {
        return Err(KernelError::InvalidArgument {
            name: "virt",
            value: "already mapped",
        });
    }
    entry.set(phys, flags | PageFlags::PRESENT);
    Ok(())
}

/// Unmap the page at `virt`, returning the frame it pointed to.
///
/// Issues a single-page TLB invalidation. Intermediate tables are left in
/// place; teardown reclaims them in bulk.
pub fn unmap(root: PhysicalAddress, virt: VirtualAddress) -> KernelResult<PhysicalAddress> {
    let l1_addr = walk_to_l1(root, virt, false, false)?.ok_or(KernelError::UnmappedMemory {
        addr: virt.as_u64() as usize,
    })?;
    // SAFETY: walk_to_l1 returned a live L1 table in this hierarchy.
    let l1 = unsafe { table_mut(l1_addr) };
    let entry = &mut l1[AddressBreakdown::new(virt).l1];
    let frame = entry.addr().ok_or(KernelError::UnmappedMemory {
        addr: virt.as_u64() as usize,
    })?;
    entry.clear();
    crate::arch::x86_64::invlpg(virt.as_u64());
    Ok(frame)
}

/// Translate `virt`, returning the backing frame and leaf flags.
pub fn translate(
    root: PhysicalAddress,
    virt: VirtualAddress,
) -> Option<(PhysicalAddress, PageFlags)> {
    let l1_addr = walk_to_l1(root, virt, false, false).ok()??;
    // SAFETY: walk_to_l1 returned a live L1 table in this hierarchy.
    let l1 = unsafe { table_mut(l1_addr) };
    let entry = l1[AddressBreakdown::new(virt).l1];
    entry.addr().map(|a| (a, entry.flags()))
}

/// Rewrite the leaf flags for a mapped page and flush its TLB entry.
pub fn remap_flags(
    root: PhysicalAddress,
    virt: VirtualAddress,
    flags: PageFlags,
) -> KernelResult<()> {
    let l1_addr = walk_to_l1(root, virt, false, false)?.ok_or(KernelError::UnmappedMemory {
        addr: virt.as_u64() as usize,
    })?;
    // SAFETY: walk_to_l1 returned a live L1 table in this hierarchy.
    let l1 = unsafe { table_mut(l1_addr) };
    let entry = &mut l1[AddressBreakdown::new(virt).l1];
    if !entry.is_present() {
        return Err(KernelError::UnmappedMemory {
            addr: virt.as_u64() as usize,
        });
    }
    entry.set_flags(flags | PageFlags::PRESENT);
    crate::arch::x86_64::invlpg(virt.as_u64());
    Ok(())
}

/// Point a mapped page at a different frame with new flags.
pub fn replace_leaf(
    root: PhysicalAddress,
    virt: VirtualAddress,
    phys: PhysicalAddress,
    flags: PageFlags,
) -> KernelResult<()> {
    let l1_addr = walk_to_l1(root, virt, false, false)?.ok_or(KernelError::UnmappedMemory {
        addr: virt.as_u64() as usize,
    })?;
    // SAFETY: walk_to_l1 returned a live L1 table in this hierarchy.
    let l1 = unsafe { table_mut(l1_addr) };
    l1[AddressBreakdown::new(virt).l1].set(phys, flags | PageFlags::PRESENT);
    crate::arch::x86_64::invlpg(virt.as_u64());
    Ok(())
}

/// Allocate a fresh user root whose upper half mirrors the kernel root.
///
/// The kernel half is shared by copying root-level entries; the tables they
/// point at are the canonical kernel tables themselves.
pub fn new_user_root(kernel_root: PhysicalAddress) -> KernelResult<PhysicalAddress> {
    let root = alloc_table()?;
    // SAFETY: root is freshly allocated; kernel_root is the live canonical
    // root, read-only after boot.
    let (dst, src) = unsafe { (table_mut(root), table_mut(kernel_root)) };
    for i in PAGE_TABLE_ENTRIES / 2..PAGE_TABLE_ENTRIES {
        dst[i] = src[i];
    }
    Ok(root)
}

/// COW-clone the user half of `parent` into the fresh root `child`.
///
/// Every present leaf loses its writable bit in *both* hierarchies and the
/// frame's reference count is bumped; the fault path copies on first write.
/// On out-of-memory the child-only tables built so far are reclaimed by the
/// caller tearing down `child`.
pub fn clone_user_half(parent: PhysicalAddress, child: PhysicalAddress) -> KernelResult<()> {
    // SAFETY: both roots are live, parent is the caller's own hierarchy and
    // child was just created by new_user_root.
    let parent_l4 = unsafe { table_mut(parent) };

    for l4_idx in 0..PAGE_TABLE_ENTRIES / 2 {
        let Some(l3_addr) = parent_l4[l4_idx].addr() else {
            continue;
        };
        // SAFETY: discovered through a present entry in the parent.
        let parent_l3 = unsafe { table_mut(l3_addr) };
        for l3_idx in 0..PAGE_TABLE_ENTRIES {
            let Some(l2_addr) = parent_l3[l3_idx].addr() else {
                continue;
            };
            // SAFETY: discovered through a present entry in the parent.
            let parent_l2 = unsafe { table_mut(l2_addr) };
            for l2_idx in 0..PAGE_TABLE_ENTRIES {
                let Some(l1_addr) = parent_l2[l2_idx].addr() else {
                    continue;
                };
                // SAFETY: discovered through a present entry in the parent.
                let parent_l1 = unsafe { table_mut(l1_addr) };
                for l1_idx in 0..PAGE_TABLE_ENTRIES {
                    let entry = &mut parent_l1[l1_idx];
                    let Some(frame) = entry.addr() else {
                        continue;
                    };

                    // Drop writable on the parent side; the child leaf is
                    // installed with the same demoted flags.
                    let shared_flags = entry.flags() - PageFlags::WRITABLE;
                    entry.set_flags(shared_flags);

                    let virt = VirtualAddress::new(
                        ((l4_idx as u64) << 39)
                            | ((l3_idx as u64) << 30)
                            | ((l2_idx as u64) << 21)
                            | ((l1_idx as u64) << 12),
                    );
                    crate::arch::x86_64::invlpg(virt.as_u64());

                    map(child, virt, frame, shared_flags)?;
                    FRAME_ALLOCATOR.lock().ref_frame(frame);
                }
            }
        }
    }

    Ok(())
}

/// Tear down the user half of a hierarchy: unreference every present leaf
/// frame and free intermediate tables bottom-up, then the root itself.
pub fn destroy_user_root(root: PhysicalAddress) {
    let mut allocator = FRAME_ALLOCATOR.lock();
    // SAFETY: the root belongs to an address space being destroyed; no
    // other CPU context references it anymore.
    let l4 = unsafe { table_mut(root) };

    for l4_idx in 0..PAGE_TABLE_ENTRIES / 2 {
        let Some(l3_addr) = l4[l4_idx].addr() else {
            continue;
        };
        // SAFETY: discovered through a present entry.
        let l3 = unsafe { table_mut(l3_addr) };
        for l3_idx in 0..PAGE_TABLE_ENTRIES {
            let Some(l2_addr) = l3[l3_idx].addr() else {
                continue;
            };
            // SAFETY: discovered through a present entry.
            let l2 = unsafe { table_mut(l2_addr) };
            for l2_idx in 0..PAGE_TABLE_ENTRIES {
                let Some(l1_addr) = l2[l2_idx].addr() else {
                    continue;
                };
                // SAFETY: discovered through a present entry.
                let l1 = unsafe { table_mut(l1_addr) };
                for l1_idx in 0..PAGE_TABLE_ENTRIES {
                    if let Some(frame) = l1[l1_idx].addr() {
                        let _ = allocator.unref_frame(frame);
                    }
                }
                let _ = allocator.free_frame(l1_addr);
            }
            let _ = allocator.free_frame(l2_addr);
        }
        let _ = allocator.free_frame(l3_addr);
    }

    let _ = allocator.free_frame(root);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips_address_and_flags() {
        let mut entry = PageTableEntry::empty();
        assert!(entry.is_unused());

        let addr = PhysicalAddress::new(0x0000_1234_5000);
        entry.set(addr, PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER);
        assert!(entry.is_present());
        assert_eq!(entry.addr(), Some(addr));
        assert!(entry.flags().contains(PageFlags::USER));

        entry.set_flags(PageFlags::PRESENT);
        assert_eq!(entry.addr(), Some(addr), "set_flags keeps the frame");
        assert!(!entry.flags().contains(PageFlags::WRITABLE));
    }

    #[test]
    fn breakdown_splits_indices() {
        let b = AddressBreakdown::new(VirtualAddress::new(0x0000_7F80_1234_5678));
        assert_eq!(b.l4, 0xFF);
        assert_eq!(b.l3, 0x0);
        assert_eq!(b.l2, 0x91);
        assert_eq!(b.l1, 0x145);
        assert_eq!(b.offset, 0x678);
    }

    #[test]
    fn non_present_entry_has_no_address()  {
        let mut entry = PageTableEntry::empty();
        entry.set(PhysicalAddress::new(0x5000), PageFlags::WRITABLE);
        assert_eq!(entry.addr(), None);
    }
}
