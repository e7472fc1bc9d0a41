//! Journal crash-recovery scenario
//!
//! Log new contents for two metadata blocks, commit, crash before the
//! home writes reach the device, remount, and expect recovery to replay
//! both blocks and leave the log clean.

use basalt_kernel::fs::{
    blockdev::{share, RamBlockDevice},
    BufferCache, Journal, BLOCK_SIZE,
};

const JOURNAL_BASE: u64 = 128;
const JOURNAL_LEN: u32 = 32;

fn filled(byte: u8) -> [u8; BLOCK_SIZE] {
    [byte; BLOCK_SIZE]
}

#[test]
fn committed_transaction_survives_a_crash() {
    let device = share(Box::new(RamBlockDevice::new("crashdisk", 1024)));

    // Mount, stage new contents for blocks 100 and 200, journal them.
    {
        let cache = BufferCache::new(device.clone());
        let mut journal = Journal::format(cache, JOURNAL_BASE, JOURNAL_LEN).unwrap();

        journal.cache().write_block(100, &filled(0x1A)).unwrap();
        journal.cache().write_block(200, &filled(0x2B)).unwrap();

        journal.begin().unwrap();
        journal.log_block(100).unwrap();
        journal.log_block(200).unwrap();
        journal.commit().unwrap();

        // Crash: the journal (and its cache full of dirty home blocks)
        // disappears without a checkpoint.
    }

    // The device still holds stale home blocks...
    {
        let mut probe = BufferCache::new(device.clone());
        assert_ne!(probe.read_block(100).unwrap(), filled(0x1A));
        assert_ne!(probe.read_block(200).unwrap(), filled(0x2B));
    }

    // ...until remount recovery replays the committed transaction.
    {
        let mut journal = Journal::open(BufferCache::new(device.clone()), JOURNAL_BASE).unwrap();
        assert_eq!(journal.cache().read_block(100).unwrap(), filled(0x1A));
        assert_eq!(journal.cache().read_block(200).unwrap(), filled(0x2B));
    }

    // Replaying again is a no-op: the log is clean after recovery.
    {
        let mut journal = Journal::open(BufferCache::new(device), JOURNAL_BASE).unwrap();
        assert_eq!(journal.cache().read_block(100).unwrap(), filled(0x1A));
        assert_eq!(journal.cache().read_block(200).unwrap(), filled(0x2B));
    }
}

#[test]
fn several_transactions_replay_in_order() {
    let device = share(Box::new(RamBlockDevice::new("crashdisk2", 1024)));

    {
        let cache = BufferCache::new(device.clone());
        let mut journal = Journal::format(cache, JOURNAL_BASE, JOURNAL_LEN).unwrap();

        // Two transactions touching the same block: the later one wins.
        journal.cache().write_block(77, &filled(0x01)).unwrap();
        journal.begin().unwrap();
        journal.log_block(77).unwrap();
        journal.commit().unwrap();

        journal.cache().write_block(77, &filled(0x02)).unwrap();
        journal.begin().unwrap();
        journal.log_block(77).unwrap();
        journal.commit().unwrap();
    }

    let mut journal = Journal::open(BufferCache::new(device), JOURNAL_BASE).unwrap();
    assert_eq!(journal.cache().read_block(77).unwrap(), filled(0x02));
}

#[test]
fn checkpoint_then_crash_needs_no_replay() {
    let device = share(Box::new(RamBlockDevice::new("crashdisk3", 1024)));

    {
        let cache = BufferCache::new(device.clone());
        let mut journal = Journal::format(cache, JOURNAL_BASE, JOURNAL_LEN).unwrap();
        journal.cache().write_block(55, &filled(0xEE)).unwrap();
        journal.begin().unwrap();
        journal.log_block(55).unwrap();
        journal.commit().unwrap();
        journal.checkpoint().unwrap();
    }

    // Home write is already durable; remount finds a clean log.
    let mut probe = BufferCache::new(device.clone());
    assert_eq!(probe.read_block(55).unwrap(), filled(0xEE));
    drop(probe);
    let mut journal = Journal::open(BufferCache::new(device), JOURNAL_BASE).unwrap();
    assert_eq!(journal.cache().read_block(55).unwrap(), filled(0xEE));
}
