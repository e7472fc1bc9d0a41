//! Buffer cache
//!
//! Maps filesystem blocks to pinned in-memory buffers with a reference
//! count and dirty flag. All disk traffic funnels through here, and the
//! single device lock guarantees at most one in-flight I/O per block.

use alloc::collections::BTreeMap;

use super::blockdev::{SharedBlockDevice, SECTOR_SIZE};
use crate::error::{FsError, KernelResult};

/// Filesystem block size: two sectors.
pub const BLOCK_SIZE: usize = 1024;

const SECTORS_PER_BLOCK: u64 = (BLOCK_SIZE / SECTOR_SIZE) as u64;

/// One cached block.
pub struct BufferHead {
    pub data: [u8; BLOCK_SIZE],
    refcount: usize,
    dirty: bool,
}

/// Cache over one block device.
pub struct BufferCache {
    device: SharedBlockDevice,
    buffers: BTreeMap<u64, BufferHead>,
}

impl BufferCache {
    pub fn new(device: SharedBlockDevice) -> Self {
        Self {
            device,
            buffers: BTreeMap::new(),
        }
    }

    /// The device this cache fronts (for remount in tests and recovery).
    pub fn device(&self) -> SharedBlockDevice {
        self.device.clone()
    }

    fn load(&mut self, block: u64) -> KernelResult<()> {
        if self.buffers.contains_key(&block) {
            return Ok(());
        }
        let mut head = BufferHead {
            data: [0; BLOCK_SIZE],
            refcount: 0,
            dirty: false,
        };
        {
            let mut device = self.device.lock();
            for s in 0..SECTORS_PER_BLOCK {
                let offset = s as usize * SECTOR_SIZE;
                let mut sector = [0u8; SECTOR_SIZE];
                device.read_sector(block * SECTORS_PER_BLOCK + s, &mut sector)?;
                head.data[offset..offset + SECTOR_SIZE].copy_from_slice(&sector);
            }
        }
        self.buffers.insert(block, head);
        Ok(())
    }

    /// Pin a block, reading it on a miss, and borrow its buffer.
    ///
    /// Pair every `get` with a `release`.
    pub fn get(&mut self, block: u64) -> KernelResult<&mut BufferHead> {
        self.load(block)?;
        let head = self.buffers.get_mut(&block).expect("just loaded");
        head.refcount += 1;
        Ok(head)
    }

    /// Unpin a block.
    pub fn release(&mut self, block: u64) {
        if let Some(head) = self.buffers.get_mut(&block) {
            debug_assert!(head.refcount > 0, "release without get");
            head.refcount = head.refcount.saturating_sub(1);
        }
    }

    /// Flag a block's buffer as modified.
    pub fn mark_dirty(&mut self, block: u64) {
        if let Some(head) = self.buffers.get_mut(&block) {
            head.dirty = true;
        }
    }

    /// Convenience: read a whole block into a copy.
    pub fn read_block(&mut self, block: u64) -> KernelResult<[u8; BLOCK_SIZE]> {
        let data = self.get(block)?.data;
        self.release(block);
        Ok(data)
    }

    /// Convenience: replace a block's contents and mark it dirty.
    pub fn write_block(&mut self, block: u64, data: &[u8; BLOCK_SIZE]) -> KernelResult<()> {
        let head = self.get(block)?;
        head.data.copy_from_slice(data);
        self.release(block);
        self.mark_dirty(block);
        Ok(())
    }

    fn write_through(&mut self, block: u64) -> KernelResult<()> {
        let Some(head) = self.buffers.get_mut(&block) else {
            return Err(FsError::BlockOutOfRange { block }.into());
        };
        if !head.dirty {
            return Ok(());
        }
        let data = head.data;
        {
            let mut device = self.device.lock();
            for s in 0..SECTORS_PER_BLOCK {
                let offset = s as usize * SECTOR_SIZE;
                let sector: &[u8; SECTOR_SIZE] = data[offset..offset + SECTOR_SIZE]
                    .try_into()
                    .expect("sector-sized slice");
                device.write_sector(block * SECTORS_PER_BLOCK + s, sector)?;
            }
        }
        self.buffers.get_mut(&block).expect("still cached").dirty = false;
        Ok(())
    }

    /// Write one block through to the device immediately.
    pub fn sync_block(&mut self, block: u64) -> KernelResult<()> {
        self.write_through(block)
    }

    /// Write back every dirty buffer.
    pub fn sync_all(&mut self) -> KernelResult<()> {
        let dirty: alloc::vec::Vec<u64> = self
            .buffers
            .iter()
            .filter(|(_, head)| head.dirty)
            .map(|(block, _)| *block)
            .collect();
        for block in dirty {
            self.write_through(block)?;
        }
        self.device.lock().flush()
    }

    /// Drop clean, unpinned buffers (memory pressure relief).
    pub fn shrink(&mut self) {
        self.buffers
            .retain(|_, head| head.dirty || head.refcount > 0);
    }

    /// Number of dirty buffers (diagnostic).
    pub fn dirty_count(&self) -> usize {
        self.buffers.values().filter(|h| h.dirty).count()
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use super::*;
    use crate::fs::blockdev::{share, RamBlockDevice};

    fn cache() -> BufferCache {
        BufferCache::new(share(Box::new(RamBlockDevice::new("ram0", 256))))
    }

    #[test]
    fn dirty_data_survives_only_after_sync() {
        let mut cache = cache();
        let payload = [0xABu8; BLOCK_SIZE];
        cache.write_block(5, &payload).unwrap();
        assert_eq!(cache.dirty_count(), 1);

        // A second cache on the same device does not see unsynced data.
        let device = cache.device();
        let mut other = BufferCache::new(device.clone());
        assert_ne!(other.read_block(5).unwrap(), payload);

        cache.sync_all().unwrap();
        assert_eq!(cache.dirty_count(), 0);
        let mut fresh = BufferCache::new(device);
        assert_eq!(fresh.read_block(5).unwrap(), payload);
    }

    #[test]
    fn pin_counting_balances() {
        let mut cache = cache();
        cache.get(7).unwrap();
        cache.get(7).unwrap();
        cache.release(7);
        cache.release(7);
        // Clean and unpinned: shrink may evict it.
        cache.shrink();
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn shrink_keeps_dirty_buffers() {
        let mut cache = cache();
        cache.write_block(3, &[1u8; BLOCK_SIZE]).unwrap();
        cache.shrink();
        assert_eq!(cache.dirty_count(), 1);
        cache.sync_all().unwrap();
    }
}
