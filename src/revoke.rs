//! Block revocation.
//!
//! A revoke says: this block was superseded before its logged copy
//! could be checkpointed, so replay must not write the logged copy
//! back. Records accumulate in a table on the side of the running
//! transaction; commit flips the tables and writes the frozen one into
//! revoke blocks in the log.

extern crate alloc;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::mem;
use spin::Mutex;

use crate::buffer::JournalBuffer;
use crate::disk::{BlockType, RevokeEntry, REVOKE_ENTRY_SIZE, REVOKE_HEADER_SIZE};
use crate::err::{JournalError, JournalResult};
use crate::journal::{Journal, WriteBatch};
use crate::sal::Buffer;
use crate::tx::{Handle, Tid, Transaction};

/// The two revoke tables. `current` collects records of the running
/// transaction; the other table belongs to the committing transaction
/// and is drained by [`Journal::write_revoke_records`].
pub(crate) struct RevokeTables {
    tables: [BTreeMap<u32, Tid>; 2],
    current: usize,
}

impl RevokeTables {
    pub fn new() -> Self {
        RevokeTables {
            tables: [BTreeMap::new(), BTreeMap::new()],
            current: 0,
        }
    }

    fn insert(&mut self, blocknr: u32, sequence: Tid) {
        self.tables[self.current].insert(blocknr, sequence);
    }

    fn remove(&mut self, blocknr: u32) -> Option<Tid> {
        self.tables[self.current].remove(&blocknr)
    }

    fn flip(&mut self) {
        self.current = 1 - self.current;
    }

    fn take_inactive(&mut self) -> BTreeMap<u32, Tid> {
        mem::take(&mut self.tables[1 - self.current])
    }
}

impl Handle {
    /// Revoke a deleted metadata block so replay cannot resurrect an
    /// older logged copy of it. The block is forgotten from this
    /// transaction as part of the revoke.
    pub fn revoke(&mut self, buf_rc: &Arc<Mutex<dyn Buffer>>) -> JournalResult {
        let tx_rc = self.transaction()?;
        let journal = Self::journal_of(&tx_rc)?;
        let tid = tx_rc.lock().tid;

        let block_id = {
            let mut buf = buf_rc.lock();
            if buf.test_set_revoked() {
                log::error!("Buffer {} is revoked again; data is inconsistent!", buf.block_id());
                return Err(JournalError::IoError);
            }
            buf.test_set_revoke_valid();
            buf.block_id()
        };

        self.forget(buf_rc)?;
        journal.record_revoke(block_id as u32, tid);

        log::debug!("Revoked buffer {} in transaction {}.", block_id, tid);
        Ok(())
    }

    /// Cancel any pending revoke for a block that is being reused, so
    /// replay does not suppress its newly logged contents.
    ///
    /// The `revoke_valid` bit makes the common case cheap: once it is
    /// set, the `revoked` bit is trusted and an unrevoked block skips
    /// the table lookup entirely.
    pub(crate) fn cancel_revoke(&self, buf_rc: &Arc<Mutex<dyn Buffer>>) -> JournalResult {
        let tx_rc = self.transaction()?;
        let journal = Self::journal_of(&tx_rc)?;

        let (block_id, need_cancel) = {
            let mut buf = buf_rc.lock();
            let need = if buf.test_set_revoke_valid() {
                buf.test_clear_revoked()
            } else {
                buf.clear_revoked();
                true
            };
            (buf.block_id(), need)
        };

        if need_cancel && journal.cancel_revoke_record(block_id as u32).is_some() {
            log::debug!("Cancelled revoke for buffer {}.", block_id);
        }
        Ok(())
    }
}

impl Journal {
    pub(crate) fn record_revoke(&self, blocknr: u32, sequence: Tid) {
        self.revoke_tables.lock().insert(blocknr, sequence);
    }

    pub(crate) fn cancel_revoke_record(&self, blocknr: u32) -> Option<Tid> {
        self.revoke_tables.lock().remove(blocknr)
    }

    /// Route new revoke records to the other table. The records
    /// collected so far now belong to the committing transaction.
    pub(crate) fn switch_revoke_table(&self) {
        self.revoke_tables.lock().flip();
    }

    /// Serialize the committing transaction's revoke records into
    /// revoke blocks in the log.
    pub(crate) fn write_revoke_records(&self, tx_rc: &Arc<Mutex<Transaction>>, tid: Tid) -> JournalResult {
        let records = self.revoke_tables.lock().take_inactive();
        if records.is_empty() {
            return Ok(());
        }

        let block_size = self.devs.dev.block_size();
        let mut batch = WriteBatch::new(self.wbufsize);
        let mut descriptor: Option<Arc<Mutex<JournalBuffer>>> = None;
        let mut offset = 0;

        for (blocknr, sequence) in records.iter() {
            if offset + REVOKE_ENTRY_SIZE > block_size {
                if let Some(desc_rc) = descriptor.take() {
                    Self::seal_revoke_block(&desc_rc, offset);
                    batch.push(desc_rc.lock().buf.clone());
                    if batch.is_full() {
                        batch.submit();
                    }
                }
            }
            let desc_rc = match descriptor.clone() {
                Some(rc) => rc,
                None => {
                    let mut tx = tx_rc.lock();
                    let rc = self.get_descriptor_buffer(tx_rc, &mut tx, BlockType::RevokeBlock)?;
                    drop(tx);
                    offset = REVOKE_HEADER_SIZE;
                    descriptor = Some(rc.clone());
                    rc
                }
            };
            let jb = desc_rc.lock();
            let mut buf = jb.buf.lock();
            let entry = RevokeEntry {
                block_nr: *blocknr,
                sequence: *sequence,
            };
            entry.encode_into(&mut buf.buf_mut()[offset..offset + REVOKE_ENTRY_SIZE]);
            offset += REVOKE_ENTRY_SIZE;
        }

        if let Some(desc_rc) = descriptor.take() {
            Self::seal_revoke_block(&desc_rc, offset);
            batch.push(desc_rc.lock().buf.clone());
        }
        batch.submit();

        log::debug!("Wrote {} revoke records for transaction {}.", records.len(), tid);
        Ok(())
    }

    /// Record how many bytes of the revoke block are in use, header
    /// included.
    fn seal_revoke_block(desc_rc: &Arc<Mutex<JournalBuffer>>, used: usize) {
        let jb = desc_rc.lock();
        let mut buf = jb.buf.lock();
        let count = (used as u32).to_be_bytes();
        buf.buf_mut()[REVOKE_HEADER_SIZE - 4..REVOKE_HEADER_SIZE].copy_from_slice(&count);
    }
}
