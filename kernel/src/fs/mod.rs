//! Storage: block devices, the buffer cache and the metadata journal.

pub mod blockdev;
pub mod buffer_cache;
pub mod journal;

use alloc::boxed::Box;

pub use blockdev::{BlockDevice, RamBlockDevice, SharedBlockDevice, SECTOR_SIZE};
pub use buffer_cache::{BufferCache, BLOCK_SIZE};
pub use journal::Journal;

use crate::sync::SpinLock;

/// Journal region on the root device: starts at this filesystem block.
const JOURNAL_BASE: u64 = 256;
/// Journal length in blocks.
const JOURNAL_LEN: u32 = 64;

/// The mounted root journal. The AHCI driver is outside this tree, so
/// boot installs a ramdisk; a real disk registers the same way.
static ROOT_JOURNAL: SpinLock<Option<Journal>> = SpinLock::new(None);

/// Mount a journaled block device as the root store, recovering the
/// journal if the previous shutdown was unclean.
pub fn mount_root(device: SharedBlockDevice) -> crate::error::KernelResult<()> {
    let cache = BufferCache::new(device.clone());
    let journal = match Journal::open(cache, JOURNAL_BASE) {
        Ok(journal) => journal,
        Err(crate::error::KernelError::FsError(crate::error::FsError::BadJournalMagic)) => {
            // Fresh device: lay down a clean journal.
            Journal::format(BufferCache::new(device), JOURNAL_BASE, JOURNAL_LEN)?
        }
        Err(e) => return Err(e),
    };
    *ROOT_JOURNAL.lock() = Some(journal);
    log::info!("fs: root journal mounted at block {}", JOURNAL_BASE);
    Ok(())
}

/// Run `f` against the mounted root journal.
pub fn with_journal<R>(f: impl FnOnce(&mut Journal) -> R) -> Option<R> {
    ROOT_JOURNAL.lock().as_mut().map(f)
}

/// Boot-time init: a 1 MiB ramdisk stands in for the disk driver.
pub fn init() -> crate::error::KernelResult<()> {
    let device = blockdev::share(Box::new(RamBlockDevice::new("ram0", 2048)));
    mount_root(device)
}
