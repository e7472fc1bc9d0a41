//! Write-ahead metadata journal
//!
//! An ext3-style circular log of whole-block after-images living in a
//! contiguous run of filesystem blocks. A transaction is a descriptor
//! block, `count` data blocks and a commit block carrying an XOR checksum;
//! a commit block with matching sequence and valid checksum implies all
//! its data blocks are durably on disk. Recovery replays every complete
//! transaction and stops at the first invalid one.
//!
//! Integer fields are written native-endian (recovery requires a
//! same-endian mount); only the magic is a fixed big-endian byte string.

use alloc::vec::Vec;

use super::buffer_cache::{BufferCache, BLOCK_SIZE};
use crate::error::{FsError, KernelError, KernelResult};

/// Journal magic, stored as the big-endian byte string "JRN1".
pub const JOURNAL_MAGIC: u32 = 0x4A52_4E31;

/// Block type tags.
const BLOCK_DESCRIPTOR: u32 = 1;
const BLOCK_COMMIT: u32 = 2;

/// Tag flag: last tag in the descriptor.
const TAG_LAST: u32 = 1;

/// Superblock flag: log is clean (start must be 0).
const FLAG_CLEAN: u32 = 1;

/// Dirty metadata-block copies one transaction may hold.
pub const MAX_TX_BLOCKS: usize = 32;

/// Offset of the first tag in a descriptor block.
const TAG_OFFSET: usize = 16;

fn put_u32(buf: &mut [u8; BLOCK_SIZE], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

fn get_u32(buf: &[u8; BLOCK_SIZE], offset: usize) -> u32 {
    u32::from_ne_bytes(buf[offset..offset + 4].try_into().expect("4-byte field"))
}

fn put_magic(buf: &mut [u8; BLOCK_SIZE]) {
    buf[0..4].copy_from_slice(&JOURNAL_MAGIC.to_be_bytes());
}

fn has_magic(buf: &[u8; BLOCK_SIZE]) -> bool {
    buf[0..4] == JOURNAL_MAGIC.to_be_bytes()
}

/// XOR checksum over a transaction's data blocks, folded as native words.
fn checksum_blocks<'a>(blocks: impl Iterator<Item = &'a [u8; BLOCK_SIZE]>) -> u32 {
    let mut sum = 0u32;
    for block in blocks {
        for word in block.chunks_exact(4) {
            sum ^= u32::from_ne_bytes(word.try_into().expect("4-byte chunk"));
        }
    }
    sum
}

/// The single active transaction: up to [`MAX_TX_BLOCKS`] after-images.
struct Transaction {
    seq: u32,
    /// (home block number, after-image); re-logging refreshes in place.
    blocks: Vec<(u32, [u8; BLOCK_SIZE])>,
}

/// Journal over a region `[base, base + maxlen)` of filesystem blocks.
pub struct Journal {
    cache: BufferCache,
    /// Absolute block of the journal superblock.
    base: u64,
    /// Journal length in blocks, superblock included.
    maxlen: u32,
    /// First log block (journal-relative), always 1.
    first: u32,
    /// Next sequence number to allocate.
    sequence: u32,
    /// Next free log position (journal-relative).
    head: u32,
    /// First live transaction, 0 when the log is empty.
    start: u32,
    /// Sequence carried by the transaction at `start` (meaningful only
    /// while `start != 0`); this is what the on-disk sequence field holds
    /// on a dirty log.
    start_seq: u32,
    active: Option<Transaction>,
}

impl Journal {
    /// Initialize a fresh, clean journal over the region.
    pub fn format(cache: BufferCache, base: u64, maxlen: u32) -> KernelResult<Self> {
        let mut journal = Self {
            cache,
            base,
            maxlen,
            first: 1,
            sequence: 1,
            head: 1,
            start: 0,
            start_seq: 0,
            active: None,
        };
        journal.write_superblock(true)?;
        journal.cache.sync_block(base)?;
        Ok(journal)
    }

    /// Mount an existing journal, running recovery if the log is dirty.
    pub fn open(mut cache: BufferCache, base: u64) -> KernelResult<Self> {
        let sb = cache.read_block(base)?;
        if !has_magic(&sb) {
            return Err(FsError::BadJournalMagic.into());
        }
        let block_size = get_u32(&sb, 4);
        if block_size as usize != BLOCK_SIZE {
            return Err(FsError::BadJournalMagic.into());
        }

        let mut journal = Self {
            cache,
            base,
            maxlen: get_u32(&sb, 8),
            first: get_u32(&sb, 12),
            sequence: get_u32(&sb, 16),
            head: 0,
            start: get_u32(&sb, 20),
            start_seq: get_u32(&sb, 16),
            active: None,
        };

        let clean = get_u32(&sb, 24) & FLAG_CLEAN != 0;
        if !clean && journal.start != 0 {
            journal.recover()?;
        } else {
            journal.start = 0;
            journal.write_superblock(true)?;
            journal.cache.sync_block(base)?;
        }
        journal.head = journal.first;
        Ok(journal)
    }

    /// The cache this journal shares with the filesystem.
    pub fn cache(&mut self) -> &mut BufferCache {
        &mut self.cache
    }

    fn write_superblock(&mut self, clean: bool) -> KernelResult<()> {
        let mut sb = [0u8; BLOCK_SIZE];
        put_magic(&mut sb);
        put_u32(&mut sb, 4, BLOCK_SIZE as u32);
        put_u32(&mut sb, 8, self.maxlen);
        put_u32(&mut sb, 12, self.first);
        put_u32(&mut sb, 16, self.sequence_at_start());
        put_u32(&mut sb, 20, self.start);
        put_u32(&mut sb, 24, if clean { FLAG_CLEAN } else { 0 });
        self.cache.write_block(self.base, &sb)
    }

    /// Sequence the on-disk field must carry: the first live
    /// transaction's when the log is dirty, the next to allocate when
    /// clean.
    fn sequence_at_start(&self) -> u32 {
        if self.start != 0 {
            self.start_seq
        } else {
            self.sequence
        }
    }

    /// Number of usable log blocks.
    fn log_len(&self) -> u32 {
        self.maxlen - self.first
    }

    /// Advance a journal-relative position with wrap-around.
    fn advance(&self, pos: u32, by: u32) -> u32 {
        (pos - self.first + by) % self.log_len() + self.first
    }

    /// Blocks currently occupied by live transactions.
    fn used(&self) -> u32 {
        if self.start == 0 {
            0
        } else {
            let len = self.log_len();
            let used = (self.head + len - self.start) % len;
            if used == 0 {
                len
            } else {
                used
            }
        }
    }

    /// Open a transaction. Only one may be active at a time.
    pub fn begin(&mut self) -> KernelResult<()> {
        if self.active.is_some() {
            return Err(FsError::TransactionActive.into());
        }
        self.active = Some(Transaction {
            seq: self.sequence,
            blocks: Vec::new(),
        });
        Ok(())
    }

    /// Copy the latest cached contents of `fs_block` into the transaction.
    ///
    /// Re-logging the same block refreshes the copy; only the newest
    /// after-image survives to commit.
    pub fn log_block(&mut self, fs_block: u32) -> KernelResult<()> {
        let data = self.cache.read_block(fs_block as u64)?;
        let tx = self
            .active
            .as_mut()
            .ok_or(KernelError::from(FsError::NoTransaction))?;

        if let Some(slot) = tx.blocks.iter_mut().find(|(nr, _)| *nr == fs_block) {
            slot.1 = data;
            return Ok(());
        }
        if tx.blocks.len() >= MAX_TX_BLOCKS {
            return Err(FsError::TransactionFull.into());
        }
        tx.blocks.push((fs_block, data));
        Ok(())
    }

    /// Discard the active transaction without touching the log.
    pub fn abort(&mut self) {
        self.active = None;
    }

    /// Durably commit the active transaction:
    /// descriptor → data blocks → sync → commit block → sync → superblock.
    pub fn commit(&mut self) -> KernelResult<()> {
        let tx = self
            .active
            .take()
            .ok_or(KernelError::from(FsError::NoTransaction))?;
        if tx.blocks.is_empty() {
            return Ok(());
        }

        let needed = tx.blocks.len() as u32 + 2;
        if needed > self.log_len() - self.used() - 1 {
            return Err(KernelError::ResourceExhausted {
                resource: "journal space",
            });
        }

        let tx_start = self.head;

        // Descriptor: header plus one tag per data block, last tag flagged.
        let mut descriptor = [0u8; BLOCK_SIZE];
        put_magic(&mut descriptor);
        put_u32(&mut descriptor, 4, BLOCK_DESCRIPTOR);
        put_u32(&mut descriptor, 8, tx.seq);
        put_u32(&mut descriptor, 12, tx.blocks.len() as u32);
        for (i, (blocknr, _)) in tx.blocks.iter().enumerate() {
            let offset = TAG_OFFSET + i * 8;
            let mut flags = 0;
            if i == tx.blocks.len() - 1 {
                flags |= TAG_LAST;
            }
            put_u32(&mut descriptor, offset, *blocknr);
            put_u32(&mut descriptor, offset + 4, flags);
        }

        let mut pos = tx_start;
        self.write_log_block(pos, &descriptor)?;
        pos = self.advance(pos, 1);
        for (_, data) in &tx.blocks {
            self.write_log_block(pos, data)?;
            pos = self.advance(pos, 1);
        }
        self.sync_log_range(tx_start, 1 + tx.blocks.len() as u32)?;

        let mut commit = [0u8; BLOCK_SIZE];
        put_magic(&mut commit);
        put_u32(&mut commit, 4, BLOCK_COMMIT);
        put_u32(&mut commit, 8, tx.seq);
        put_u32(&mut commit, 12, checksum_blocks(tx.blocks.iter().map(|(_, d)| d)));
        self.write_log_block(pos, &commit)?;
        self.sync_log_range(pos, 1)?;

        // The transaction is durable; expose it through the superblock.
        if self.start == 0 {
            self.start = tx_start;
            self.start_seq = tx.seq;
        }
        self.head = self.advance(pos, 1);
        self.sequence = tx.seq + 1;
        self.write_superblock(false)?;
        self.cache.sync_block(self.base)?;
        Ok(())
    }

    /// Checkpoint: once all committed metadata has reached its home
    /// locations, cut the log and mark it clean.
    pub fn checkpoint(&mut self) -> KernelResult<()> {
        if self.active.is_some() {
            return Err(FsError::TransactionActive.into());
        }
        self.cache.sync_all()?;
        self.start = 0;
        self.head = self.first;
        self.write_superblock(true)?;
        self.cache.sync_block(self.base)?;
        Ok(())
    }

    fn write_log_block(&mut self, pos: u32, data: &[u8; BLOCK_SIZE]) -> KernelResult<()> {
        self.cache.write_block(self.base + pos as u64, data)
    }

    fn sync_log_range(&mut self, start: u32, count: u32) -> KernelResult<()> {
        let mut pos = start;
        for _ in 0..count {
            self.cache.sync_block(self.base + pos as u64)?;
            pos = self.advance(pos, 1);
        }
        Ok(())
    }

    /// Replay every complete transaction from `start`, stopping at the
    /// first invalid or incomplete one. Replay is idempotent: the data
    /// blocks are after-images.
    fn recover(&mut self) -> KernelResult<()> {
        let mut pos = self.start;
        let mut expected_seq = self.sequence;
        let mut replayed = 0usize;

        loop {
            let descriptor = self.cache.read_block(self.base + pos as u64)?;
            if !has_magic(&descriptor)
                || get_u32(&descriptor, 4) != BLOCK_DESCRIPTOR
                || get_u32(&descriptor, 8) != expected_seq
            {
                break;
            }
            let count = get_u32(&descriptor, 12);
            if count == 0
                || count as usize > MAX_TX_BLOCKS
                || count + 2 > self.log_len()
            {
                break;
            }

            // Commit block sits past the data blocks.
            let commit_pos = self.advance(pos, 1 + count);
            let commit = self.cache.read_block(self.base + commit_pos as u64)?;
            if !has_magic(&commit)
                || get_u32(&commit, 4) != BLOCK_COMMIT
                || get_u32(&commit, 8) != expected_seq
            {
                break;
            }

            // Collect the data blocks and verify the checksum before
            // touching any home location.
            let mut data_blocks = Vec::with_capacity(count as usize);
            let mut data_pos = self.advance(pos, 1);
            for _ in 0..count {
                data_blocks.push(self.cache.read_block(self.base + data_pos as u64)?);
                data_pos = self.advance(data_pos, 1);
            }
            if checksum_blocks(data_blocks.iter()) != get_u32(&commit, 12) {
                break;
            }

            // Replay: write each after-image to the block its tag names.
            for (i, data) in data_blocks.iter().enumerate() {
                let tag_offset = TAG_OFFSET + i * 8;
                let home = get_u32(&descriptor, tag_offset);
                self.cache.write_block(home as u64, data)?;
            }
            replayed += 1;

            pos = self.advance(pos, 2 + count);
            expected_seq += 1;
        }

        // Force replayed blocks out, then cut the log.
        self.cache.sync_all()?;
        self.start = 0;
        self.sequence = expected_seq;
        self.head = self.first;
        self.write_superblock(true)?;
        self.cache.sync_block(self.base)?;

        log::info!("journal: recovered {} transaction(s)", replayed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use super::*;
    use crate::fs::blockdev::{share, RamBlockDevice, SharedBlockDevice};

    const JOURNAL_BASE: u64 = 64;
    const JOURNAL_LEN: u32 = 16;

    fn device() -> SharedBlockDevice {
        share(Box::new(RamBlockDevice::new("ram0", 512)))
    }

    fn fresh_journal(device: &SharedBlockDevice) -> Journal {
        let cache = BufferCache::new(device.clone());
        Journal::format(cache, JOURNAL_BASE, JOURNAL_LEN).unwrap()
    }

    fn block_of(byte: u8) -> [u8; BLOCK_SIZE] {
        [byte; BLOCK_SIZE]
    }

    #[test]
    fn clean_format_then_open() {
        let device = device();
        drop(fresh_journal(&device));
        let journal = Journal::open(BufferCache::new(device), JOURNAL_BASE).unwrap();
        assert_eq!(journal.start, 0);
        assert_eq!(journal.sequence, 1);
    }

    #[test]
    fn single_transaction_begin_is_exclusive() {
        let device = device();
        let mut journal = fresh_journal(&device);
        journal.begin().unwrap();
        assert!(journal.begin().is_err());
        journal.abort();
        journal.begin().unwrap();
    }

    #[test]
    fn relogging_keeps_latest_copy() {
        let device = device();
        let mut journal = fresh_journal(&device);
        journal.cache().write_block(100, &block_of(0x11)).unwrap();

        journal.begin().unwrap();
        journal.log_block(100).unwrap();
        journal.cache().write_block(100, &block_of(0x22)).unwrap();
        journal.log_block(100).unwrap();

        let tx = journal.active.as_ref().unwrap();
        assert_eq!(tx.blocks.len(), 1, "dedup keeps one copy");
        assert_eq!(tx.blocks[0].1[0], 0x22, "latest contents win");
    }

    #[test]
    fn commit_then_crash_then_recover_replays() {
        let device = device();
        let mut journal = fresh_journal(&device);

        // New metadata contents exist only in the cache, then in the log.
        journal.cache().write_block(100, &block_of(0xA1)).unwrap();
        journal.cache().write_block(200, &block_of(0xB2)).unwrap();
        journal.begin().unwrap();
        journal.log_block(100).unwrap();
        journal.log_block(200).unwrap();
        journal.commit().unwrap();

        // Crash: the cache (with the dirty home blocks) evaporates.
        drop(journal);

        // The home locations on disk are still stale.
        let mut probe = BufferCache::new(device.clone());
        assert_ne!(probe.read_block(100).unwrap(), block_of(0xA1));
        drop(probe);

        // Remount: recovery replays the committed after-images.
        let mut journal = Journal::open(BufferCache::new(device.clone()), JOURNAL_BASE).unwrap();
        assert_eq!(journal.start, 0, "log clean after recovery");
        assert_eq!(journal.cache().read_block(100).unwrap(), block_of(0xA1));
        assert_eq!(journal.cache().read_block(200).unwrap(), block_of(0xB2));

        // Replay is idempotent: opening again changes nothing.
        drop(journal);
        let mut journal = Journal::open(BufferCache::new(device), JOURNAL_BASE).unwrap();
        assert_eq!(journal.cache().read_block(100).unwrap(), block_of(0xA1));
    }

    #[test]
    fn abort_discards_private_copies() {
        let device = device();
        let mut journal = fresh_journal(&device);
        journal.cache().write_block(100, &block_of(0x55)).unwrap();
        journal.begin().unwrap();
        journal.log_block(100).unwrap();
        journal.abort();

        // Nothing was committed: a crash leaves block 100 untouched.
        drop(journal);
        let journal = Journal::open(BufferCache::new(device), JOURNAL_BASE).unwrap();
        assert_eq!(journal.start, 0);
        assert_eq!(journal.sequence, 1, "sequence unchanged by abort");
    }

    #[test]
    fn checkpoint_marks_clean_and_cuts_log() {
        let device = device();
        let mut journal = fresh_journal(&device);
        journal.cache().write_block(100, &block_of(0x77)).unwrap();
        journal.begin().unwrap();
        journal.log_block(100).unwrap();
        journal.commit().unwrap();
        assert_ne!(journal.start, 0);

        journal.checkpoint().unwrap();
        assert_eq!(journal.start, 0);

        // After checkpoint the home write is durable and the log replays
        // nothing.
        drop(journal);
        let mut journal = Journal::open(BufferCache::new(device), JOURNAL_BASE).unwrap();
        assert_eq!(journal.cache().read_block(100).unwrap(), block_of(0x77));
    }

    #[test]
    fn torn_commit_is_not_replayed() {
        let device = device();
        let mut journal = fresh_journal(&device);
        journal.cache().write_block(100, &block_of(0x99)).unwrap();
        journal.begin().unwrap();
        journal.log_block(100).unwrap();
        journal.commit().unwrap();

        // Corrupt the commit block on disk (journal-relative position 2:
        // descriptor at 1, one data block, commit at 3).
        {
            let mut cache = BufferCache::new(device.clone());
            let commit_block = JOURNAL_BASE + 3;
            let mut data = cache.read_block(commit_block).unwrap();
            data[12] ^= 0xFF; // break the checksum field
            cache.write_block(commit_block, &data).unwrap();
            cache.sync_all().unwrap();
        }

        let mut journal = Journal::open(BufferCache::new(device), JOURNAL_BASE).unwrap();
        assert_ne!(
            journal.cache().read_block(100).unwrap(),
            block_of(0x99),
            "incomplete transaction must not replay"
        );
    }

    #[test]
    fn transaction_capacity_is_bounded() {
        let device = device();
        let mut journal = fresh_journal(&device);
        journal.begin().unwrap();
        for i in 0..MAX_TX_BLOCKS as u32 {
            journal.log_block(100 + i).unwrap();
        }
        assert!(matches!(
            journal.log_block(135),
            Err(KernelError::FsError(FsError::TransactionFull))
        ));
        journal.abort();
    }
}
