//! Test-side fakes: random block contents and a minimal log reader
//! that rebuilds the filesystem image a recovery pass would produce.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use jrnl_rs::config::JOURNAL_MAGIC;
use jrnl_rs::disk::{
    BlockTag, BlockType, Header, RevokeBlockHeader, RevokeEntry, TagFlag, HEADER_SIZE, REVOKE_ENTRY_SIZE,
    REVOKE_HEADER_SIZE, TAG_SIZE, UUID_SIZE,
};
use jrnl_rs::sal::{BlockDevice, Buffer, System};
use rand::Rng;
use spin::Mutex;

use super::sal::UserSystem;

pub fn get_block(system: &UserSystem, block_id: usize) -> Arc<Mutex<dyn Buffer>> {
    let dev = system.block_device();
    system
        .get_buffer_provider()
        .lock()
        .get_buffer(dev, block_id)
        .unwrap()
}

/// Fill a buffer with random bytes and return a copy of them.
pub fn fill_random(buf_rc: &Arc<Mutex<dyn Buffer>>) -> Vec<u8> {
    let mut buf = buf_rc.lock();
    let data = buf.buf_mut();
    rand::thread_rng().fill(data);
    data.to_vec()
}

/// Like [`fill_random`], but the first word collides with the journal
/// magic so the logged copy must be escaped.
pub fn fill_random_magic_prefixed(buf_rc: &Arc<Mutex<dyn Buffer>>) -> Vec<u8> {
    let mut buf = buf_rc.lock();
    let data = buf.buf_mut();
    rand::thread_rng().fill(data);
    data[0..4].copy_from_slice(&JOURNAL_MAGIC.to_be_bytes());
    data.to_vec()
}

/// Read a block straight from the device, bypassing the cache.
pub fn read_device_block(dev: &Arc<dyn BlockDevice>, block_id: usize) -> Vec<u8> {
    let mut data = vec![0u8; dev.block_size()];
    dev.read_block(block_id, &mut data);
    data
}

pub struct ReplayTx {
    pub sequence: u32,
    pub committed: bool,
    /// (home block, escaped, journal-relative log block)
    pub tags: Vec<(u32, bool, u32)>,
    pub revokes: Vec<(u32, u32)>,
}

/// Walk the log the way a recovery pass would: transactions in
/// sequence order starting from the superblock's `start`, stopping at
/// the first block that does not belong to the expected transaction.
pub fn scan_log(dev: &Arc<dyn BlockDevice>, journal_offset: usize) -> Vec<ReplayTx> {
    let sb_raw = read_device_block(dev, journal_offset);
    let be32 = |at: usize| u32::from_be_bytes(sb_raw[at..at + 4].try_into().unwrap());
    let maxlen = be32(16);
    let first = be32(20);
    let mut sequence = be32(24);
    let start = be32(28);

    let mut txs: Vec<ReplayTx> = Vec::new();
    if start == 0 {
        return txs;
    }
    let next = |block: u32| if block + 1 == maxlen { first } else { block + 1 };

    let mut block = start;
    loop {
        let raw = read_device_block(dev, journal_offset + block as usize);
        let header = Header::decode(&raw);
        if !header.has_magic() || header.sequence != sequence {
            break;
        }
        let tx = tx_entry(&mut txs, sequence);
        match BlockType::try_from(header.block_type) {
            Ok(BlockType::DescriptorBlock) => {
                let mut offset = HEADER_SIZE;
                let mut data_block = next(block);
                loop {
                    let tag = BlockTag::decode(&raw[offset..offset + TAG_SIZE]);
                    offset += TAG_SIZE;
                    if !tag.flag.contains(TagFlag::SAME_UUID) {
                        offset += UUID_SIZE;
                    }
                    tx.tags
                        .push((tag.block_nr, tag.flag.contains(TagFlag::ESCAPE), data_block));
                    data_block = next(data_block);
                    if tag.flag.contains(TagFlag::LAST_TAG) {
                        break;
                    }
                }
                block = data_block;
            }
            Ok(BlockType::RevokeBlock) => {
                let revoke_header = RevokeBlockHeader::decode(&raw);
                let mut offset = REVOKE_HEADER_SIZE;
                while offset < revoke_header.count as usize {
                    let entry = RevokeEntry::decode(&raw[offset..offset + REVOKE_ENTRY_SIZE]);
                    tx.revokes.push((entry.block_nr, entry.sequence));
                    offset += REVOKE_ENTRY_SIZE;
                }
                block = next(block);
            }
            Ok(BlockType::CommitBlock) => {
                tx.committed = true;
                sequence += 1;
                block = next(block);
            }
            _ => break,
        }
    }
    txs
}

/// The blocks a replay would write home, keyed by absolute block id.
/// Transactions without a commit record are ignored, and revoked
/// blocks are suppressed up to and including the revoking transaction.
pub fn replay_log(dev: &Arc<dyn BlockDevice>, journal_offset: usize) -> HashMap<usize, Vec<u8>> {
    let txs = scan_log(dev, journal_offset);
    let committed: Vec<&ReplayTx> = txs.iter().filter(|tx| tx.committed).collect();

    let mut revoked: HashMap<u32, u32> = HashMap::new();
    for tx in committed.iter() {
        for (home, revoke_sequence) in tx.revokes.iter() {
            let entry = revoked.entry(*home).or_insert(0);
            *entry = (*entry).max(*revoke_sequence);
        }
    }

    let mut image = HashMap::new();
    for tx in committed.iter() {
        for (home, escaped, log_block) in tx.tags.iter() {
            if revoked.get(home).map_or(false, |&sequence| sequence >= tx.sequence) {
                continue;
            }
            let mut data = read_device_block(dev, journal_offset + *log_block as usize);
            if *escaped {
                data[0..4].copy_from_slice(&JOURNAL_MAGIC.to_be_bytes());
            }
            image.insert(*home as usize, data);
        }
    }
    image
}

/// The sequence numbers of all committed transactions found in the log.
pub fn committed_sequences(dev: &Arc<dyn BlockDevice>, journal_offset: usize) -> HashSet<u32> {
    scan_log(dev, journal_offset)
        .iter()
        .filter(|tx| tx.committed)
        .map(|tx| tx.sequence)
        .collect()
}

fn tx_entry(txs: &mut Vec<ReplayTx>, sequence: u32) -> &mut ReplayTx {
    if txs.last().map_or(true, |tx| tx.sequence != sequence) {
        txs.push(ReplayTx {
            sequence,
            committed: false,
            tags: Vec::new(),
            revokes: Vec::new(),
        });
    }
    txs.last_mut().unwrap()
}
