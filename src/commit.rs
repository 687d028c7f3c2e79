//! The commit state machine.
//!
//! Drives a sealed transaction from Running to Finished: quiesce the
//! handles, write ordered data home, serialize revokes, descriptors
//! and block copies into the log, write the commit record, then hand
//! surviving blocks to the checkpoint registry.
//!
//! IO failures along the way are sticky: they escalate to a journal
//! abort before the commit record can be written, but every phase
//! still runs so no block is left on a dangling list.

extern crate alloc;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::buffer::{self, BufferListType, JournalBuffer};
use crate::disk::{needs_escape, BlockTag, BlockType, Header, TagFlag, HEADER_SIZE, TAG_SIZE, UUID_SIZE};
use crate::err::{JournalError, JournalResult};
use crate::journal::{Journal, JournalFlag, WriteBatch};
use crate::jrnl_assert;
use crate::sal::IoOutcome;
use crate::tx::{Tid, Transaction, TransactionState};

impl Journal {
    /// Commit the running transaction. Returns once the transaction
    /// has reached the Finished state, successfully or not.
    pub fn commit_transaction(&self) -> JournalResult {
        // Erase the effects of a prior flush before the log gains new
        // content.
        if self.states.lock().flags.contains(JournalFlag::FLUSHED) {
            self.update_superblock();
        }

        // Only one commit may be in flight; wait out the current one
        // before taking the running transaction.
        let running = loop {
            let token = self.wait_done_commit.prepare_to_wait();
            let states = self.states.lock();
            if states.committing_transaction.is_none() {
                break states.running_transaction.clone();
            }
            drop(states);
            self.wait_done_commit.wait(token);
        };
        let Some(commit_tx) = running else {
            log::debug!("No transaction to commit.");
            return Ok(());
        };

        let tid = {
            let mut tx = commit_tx.lock();
            if tx.state != TransactionState::Running {
                // Another task sealed this transaction first; its
                // commit satisfies ours.
                let tid = tx.tid;
                drop(tx);
                return self.wait_for_commit(tid);
            }
            tx.state = TransactionState::Locked;
            tx.tid
        };
        log::debug!("Starting commit of transaction {}.", tid);

        // Wait for all outstanding updates to complete.
        loop {
            let token = self.wait_updates.prepare_to_wait();
            let updates = {
                let tx = commit_tx.lock();
                let info = tx.handle_info.lock();
                jrnl_assert!(info.outstanding_credits <= self.max_transaction_buffers);
                info.updates
            };
            if updates == 0 {
                break;
            }
            self.wait_updates.wait(token);
        }

        self.discard_reserved(&commit_tx);
        self.clean_checkpoint_list();
        log::debug!("Commit phase 1.");

        self.switch_revoke_table();

        // Seal and publish: this transaction is now the committing
        // one, and a new running transaction may start.
        {
            let mut states = self.states.lock();
            let mut tx = commit_tx.lock();
            tx.state = TransactionState::Flush;
            tx.log_start = states.head;
            states.committing_transaction = Some(commit_tx.clone());
            states.running_transaction = None;
        }
        self.wait_transaction_locked.notify_all();
        log::debug!("Commit phase 2.");

        // Accesses to the buffers are tracked for a new transaction
        // only from here on.
        let keys: Vec<usize> = commit_tx.lock().buffers.keys().cloned().collect();
        for key in keys {
            loop {
                let tx = commit_tx.lock();
                let Some(jb_rc) = tx.buffers.get(&key).cloned() else {
                    break;
                };
                let Some(mut jb) = jb_rc.try_lock() else {
                    drop(tx);
                    self.yield_now();
                    continue;
                };
                jb.modified = false;
                break;
            }
        }

        let mut io_err = false;

        self.write_out_data(&commit_tx);
        self.drain_locked_list(&commit_tx, &mut io_err);
        if io_err {
            log::error!("Data write-out failed for transaction {}.", tid);
            if self.states.lock().flags.contains(JournalFlag::ABORT_ON_SYNCDATA_ERR) {
                self.abort_hard();
            }
        }

        if self.write_revoke_records(&commit_tx, tid).is_err() {
            self.abort_hard();
            io_err = true;
        }

        jrnl_assert!(commit_tx.lock().sync_datalist.is_empty());
        log::debug!("Commit phase 3.");

        self.write_metadata(&commit_tx, &mut io_err);

        log::debug!("Commit phase 4.");
        self.drain_iobuf_list(&commit_tx, &mut io_err);
        jrnl_assert!(commit_tx.lock().shadow_list.is_empty());

        log::debug!("Commit phase 5.");
        self.drain_log_list(&commit_tx, &mut io_err);

        log::debug!("Commit phase 6.");
        if io_err {
            self.abort_hard();
        }
        {
            let mut tx = commit_tx.lock();
            jrnl_assert!(tx.state == TransactionState::Flush);
            tx.state = TransactionState::Commit;
        }
        if !self.is_aborted() && self.write_commit_record(tid).is_err() {
            self.abort_hard();
            io_err = true;
        }

        log::debug!("Commit phase 7.");
        jrnl_assert!({
            let tx = commit_tx.lock();
            tx.sync_datalist.is_empty()
                && tx.reserved_list.is_empty()
                && tx.buffers.is_empty()
                && tx.iobuf_list.is_empty()
                && tx.shadow_list.is_empty()
                && tx.log_list.is_empty()
        });
        loop {
            self.process_forget_list(&commit_tx);
            // Live readers may still append to the forget list while
            // it drains; recheck before finalizing.
            let more = {
                let _states = self.states.lock();
                !commit_tx.lock().forget.is_empty()
            };
            if !more {
                break;
            }
        }

        log::debug!("Commit phase 8.");
        let tail_sequence = {
            let mut states = self.states.lock();
            let mut tx = commit_tx.lock();
            jrnl_assert!(tx.state == TransactionState::Commit);
            jrnl_assert!(tx.drained());
            tx.state = TransactionState::Finished;
            states.commit_sequence = tx.tid;
            states.committing_transaction = None;
            let keep = !tx.checkpoint_set.is_empty();
            drop(tx);
            if keep {
                self.checkpoint_transactions.lock().push_back(commit_tx.clone());
            }
            states.tail_sequence
        };

        log::debug!("Commit {} complete, tail sequence {}.", tid, tail_sequence);
        self.wait_done_commit.notify_all();

        if io_err {
            Err(JournalError::IoError)
        } else {
            Ok(())
        }
    }

    /// Return reserved-but-never-modified blocks to the journal. An
    /// undo snapshot on such a block is discarded, since no change
    /// was recorded against it.
    fn discard_reserved(&self, commit_tx: &Arc<Mutex<Transaction>>) {
        loop {
            let mut tx = commit_tx.lock();
            let Some(jb_rc) = tx.reserved_list.values().next().cloned() else {
                break;
            };
            let Some(mut jb) = jb_rc.try_lock() else {
                drop(tx);
                self.yield_now();
                continue;
            };
            jrnl_assert!(jb.next_transaction.is_none());
            jb.committed_data = None;
            buffer::unfile_buffer(&mut tx, &mut jb);
            drop(jb);
            drop(tx);
            buffer::release_buffer(&jb_rc);
        }
    }

    /// Push every dirty data block into write batches and park it on
    /// the locked list; detach blocks that are already clean. Runs
    /// until the data list is observed empty.
    fn write_out_data(&self, commit_tx: &Arc<Mutex<Transaction>>) {
        let mut batch = WriteBatch::new(self.wbufsize);
        loop {
            let mut tx = commit_tx.lock();
            let Some(jb_rc) = tx.sync_datalist.values().next().cloned() else {
                break;
            };
            let Some(mut jb) = jb_rc.try_lock() else {
                drop(tx);
                self.yield_now();
                continue;
            };
            let buf_rc = jb.buf.clone();
            let (locked, dirty) = {
                let buf = buf_rc.lock();
                (buf.locked(), buf.dirty())
            };
            if locked {
                // A foreign writer beat us to it; wait for that IO in
                // the drain below.
                buffer::move_buffer(commit_tx, &mut tx, &jb_rc, &mut jb, BufferListType::Locked);
            } else if dirty {
                buffer::move_buffer(commit_tx, &mut tx, &jb_rc, &mut jb, BufferListType::Locked);
                batch.push(buf_rc);
                if batch.is_full() {
                    drop(jb);
                    drop(tx);
                    log::debug!("Submitting a full batch of data writes.");
                    batch.submit();
                }
            } else {
                buffer::unfile_buffer(&mut tx, &mut jb);
                drop(jb);
                drop(tx);
                buffer::release_buffer(&jb_rc);
            }
        }
        batch.submit();
    }

    /// Wait for the parked data writes, newest first, unfiling each
    /// block as its IO completes.
    fn drain_locked_list(&self, commit_tx: &Arc<Mutex<Transaction>>, io_err: &mut bool) {
        loop {
            let jb_rc = {
                let tx = commit_tx.lock();
                match tx.locked_list.values().next_back().cloned() {
                    Some(rc) => rc,
                    None => break,
                }
            };
            let buf_rc = {
                let Some(jb) = jb_rc.try_lock() else {
                    self.yield_now();
                    continue;
                };
                jb.buf.clone()
            };
            self.wait_on_buffer(&buf_rc);
            if !buf_rc.lock().uptodate() {
                *io_err = true;
            }
            loop {
                let mut tx = commit_tx.lock();
                let Some(mut jb) = jb_rc.try_lock() else {
                    drop(tx);
                    self.yield_now();
                    continue;
                };
                if jb.jlist == BufferListType::Locked && jb.owned_by(commit_tx) {
                    buffer::unfile_buffer(&mut tx, &mut jb);
                    drop(jb);
                    drop(tx);
                    buffer::release_buffer(&jb_rc);
                }
                break;
            }
        }
    }

    /// Serialize the transaction's metadata into the log: descriptor
    /// blocks carrying tags, followed by copies of the blocks
    /// themselves. Once the journal aborts, the remaining blocks are
    /// unjournaled instead of written.
    fn write_metadata(&self, commit_tx: &Arc<Mutex<Transaction>>, io_err: &mut bool) {
        let mut batch = WriteBatch::new(self.wbufsize);
        let mut cursor: Option<TagCursor> = None;

        loop {
            let mut tx = commit_tx.lock();
            let Some(jb_rc) = tx.buffers.values().next().cloned() else {
                break;
            };

            if self.is_aborted() {
                let Some(mut jb) = jb_rc.try_lock() else {
                    drop(tx);
                    self.yield_now();
                    continue;
                };
                let release = self.refile_or_release(commit_tx, &mut tx, &jb_rc, &mut jb);
                drop(jb);
                drop(tx);
                if release {
                    buffer::release_buffer(&jb_rc);
                }
                continue;
            }

            if cursor.is_none() {
                log::debug!("Opening a new descriptor block.");
                match self.get_descriptor_buffer(commit_tx, &mut tx, BlockType::DescriptorBlock) {
                    Ok(desc_rc) => {
                        let desc_buf = desc_rc.lock().buf.clone();
                        let size = desc_buf.lock().size();
                        batch.push(desc_buf);
                        cursor = Some(TagCursor::new(desc_rc, size));
                    }
                    Err(_) => {
                        drop(tx);
                        self.abort_hard();
                        continue;
                    }
                }
            }

            let Some(mut jb) = jb_rc.try_lock() else {
                drop(tx);
                self.yield_now();
                continue;
            };

            let log_block = match self.next_log_block() {
                Ok(block) => block,
                Err(_) => {
                    drop(jb);
                    drop(tx);
                    log::error!("Log space ran out mid-commit.");
                    self.abort_hard();
                    continue;
                }
            };
            // Handle admission reads outstanding_credits for its
            // space estimate; the slot just claimed is spoken for.
            {
                let mut info = tx.handle_info.lock();
                info.outstanding_credits = info.outstanding_credits.saturating_sub(1);
            }

            match self.write_metadata_buffer(commit_tx, &mut tx, &jb_rc, &mut jb, log_block) {
                Ok((io_jb_rc, escaped, home_block)) => {
                    let io_buf = io_jb_rc.lock().buf.clone();
                    batch.push(io_buf);

                    let mut flag = TagFlag::empty();
                    if escaped {
                        flag |= TagFlag::ESCAPE;
                    }
                    if let Some(cur) = cursor.as_mut() {
                        cur.append(&self.uuid, home_block as u32, flag);
                    }

                    drop(jb);
                    let exhausted = tx.buffers.is_empty();
                    drop(tx);

                    let out_of_tag_space = cursor
                        .as_ref()
                        .map_or(false, |cur| cur.space_left < TAG_SIZE + UUID_SIZE);
                    if batch.is_full() || exhausted || out_of_tag_space {
                        if let Some(cur) = cursor.take() {
                            cur.seal();
                        }
                        log::debug!("Submitting a descriptor batch.");
                        batch.submit();
                    }
                }
                Err(_) => {
                    drop(jb);
                    drop(tx);
                    *io_err = true;
                    self.abort_hard();
                    continue;
                }
            }
        }

        // An abort mid-batch leaves copies pending; push them out so
        // their list members can drain.
        if let Some(cur) = cursor.take() {
            cur.seal();
        }
        batch.submit();
    }

    /// Copy one metadata block into a log buffer, escaping it when its
    /// first word collides with the journal magic. The original moves
    /// to the shadow list; the copy is filed for IO with a back-link
    /// to the block it shadows.
    fn write_metadata_buffer(
        &self,
        tx_rc: &Arc<Mutex<Transaction>>,
        tx: &mut Transaction,
        jb_rc: &Arc<Mutex<JournalBuffer>>,
        jb: &mut JournalBuffer,
        log_block: u32,
    ) -> JournalResult<(Arc<Mutex<JournalBuffer>>, bool, usize)> {
        let buf_rc = jb.buf.clone();
        let home_block = buf_rc.lock().block_id();
        let io_buf_rc = self.log_block_buffer(log_block)?;

        let escaped = {
            let mut io_buf = io_buf_rc.lock();
            let data = io_buf.buf_mut();
            match &jb.frozen_data {
                // A later transaction claimed the block; the log gets
                // the contents frozen at claim time.
                Some(frozen) => data.copy_from_slice(frozen),
                None => data.copy_from_slice(buf_rc.lock().buf()),
            }
            let escaped = needs_escape(data);
            if escaped {
                data[0..4].fill(0);
            }
            io_buf.set_uptodate();
            escaped
        };

        buffer::move_buffer(tx_rc, tx, jb_rc, jb, BufferListType::Shadow);
        let io_jb_rc = buffer::attach(&io_buf_rc);
        {
            let mut io_jb = io_jb_rc.lock();
            io_jb.shadows = Some(jb_rc.clone());
            buffer::file_buffer(tx_rc, tx, &io_jb_rc, &mut io_jb, BufferListType::IO);
        }
        Ok((io_jb_rc, escaped, home_block))
    }

    /// Wait for the log-side copies, newest first. Each completed copy
    /// is dropped and the block it shadows moves to the forget list.
    fn drain_iobuf_list(&self, commit_tx: &Arc<Mutex<Transaction>>, io_err: &mut bool) {
        loop {
            let io_jb_rc = {
                let tx = commit_tx.lock();
                match tx.iobuf_list.values().next_back().cloned() {
                    Some(rc) => rc,
                    None => break,
                }
            };
            let io_buf_rc = {
                let Some(io_jb) = io_jb_rc.try_lock() else {
                    self.yield_now();
                    continue;
                };
                io_jb.buf.clone()
            };
            self.wait_on_buffer(&io_buf_rc);
            if !io_buf_rc.lock().uptodate() {
                *io_err = true;
            }
            loop {
                let mut tx = commit_tx.lock();
                let Some(mut io_jb) = io_jb_rc.try_lock() else {
                    drop(tx);
                    self.yield_now();
                    continue;
                };
                if let Some(jb_rc) = io_jb.shadows.clone() {
                    // Both bookkeeping locks are needed; restart
                    // rather than mutate one side alone.
                    let Some(mut jb) = jb_rc.try_lock() else {
                        drop(io_jb);
                        drop(tx);
                        self.yield_now();
                        continue;
                    };
                    jrnl_assert!(jb.jlist == BufferListType::Shadow);
                    jrnl_assert!(jb.buf.lock().journal_dirty());
                    buffer::move_buffer(commit_tx, &mut tx, &jb_rc, &mut jb, BufferListType::Forget);
                    let queue = jb.buf.lock().wait_queue();
                    drop(jb);
                    // The shadow is gone; the live block may be frozen
                    // or written again.
                    queue.notify_all();
                }
                io_jb.shadows = None;
                buffer::unfile_buffer(&mut tx, &mut io_jb);
                drop(io_jb);
                drop(tx);
                buffer::release_buffer(&io_jb_rc);
                break;
            }
        }
    }

    /// Wait for descriptor and revoke block writes, newest first,
    /// unfiling each as it completes.
    fn drain_log_list(&self, commit_tx: &Arc<Mutex<Transaction>>, io_err: &mut bool) {
        loop {
            let jb_rc = {
                let tx = commit_tx.lock();
                match tx.log_list.values().next_back().cloned() {
                    Some(rc) => rc,
                    None => break,
                }
            };
            let buf_rc = {
                let Some(jb) = jb_rc.try_lock() else {
                    self.yield_now();
                    continue;
                };
                jb.buf.clone()
            };
            self.wait_on_buffer(&buf_rc);
            if !buf_rc.lock().uptodate() {
                *io_err = true;
            }
            loop {
                let mut tx = commit_tx.lock();
                let Some(mut jb) = jb_rc.try_lock() else {
                    drop(tx);
                    self.yield_now();
                    continue;
                };
                buffer::unfile_buffer(&mut tx, &mut jb);
                drop(jb);
                drop(tx);
                buffer::release_buffer(&jb_rc);
                break;
            }
        }
    }

    /// The durability line: a single header-only block whose durable
    /// write commits the whole transaction. A barrier write the device
    /// refuses downgrades the journal to plain sync writes.
    fn write_commit_record(&self, tid: Tid) -> JournalResult {
        let block = self.next_log_block()?;
        let buf_rc = self.log_block_buffer(block)?;
        let barrier = self.states.lock().flags.contains(JournalFlag::BARRIER);

        let mut buf = buf_rc.lock();
        {
            let data = buf.buf_mut();
            data.fill(0);
            Header::new(BlockType::CommitBlock, tid).encode_into(data);
        }
        buf.set_uptodate();

        if barrier {
            match buf.sync_write(true) {
                IoOutcome::Done => return Ok(()),
                IoOutcome::Unsupported => {
                    log::warn!("Barrier-based sync failed; disabling barriers.");
                    self.states.lock().flags.remove(JournalFlag::BARRIER);
                    // And try again, without the barrier.
                    buf.set_uptodate();
                    buf.mark_dirty();
                }
                IoOutcome::Failed => return Err(JournalError::IoError),
            }
        }
        match buf.sync_write(false) {
            IoOutcome::Done => Ok(()),
            _ => Err(JournalError::IoError),
        }
    }

    /// Process the forget list: rotate undo snapshots, sever stale
    /// checkpoint links, and either re-checkpoint each block under
    /// this transaction or release it outright.
    fn process_forget_list(&self, commit_tx: &Arc<Mutex<Transaction>>) {
        loop {
            let jb_rc = {
                let tx = commit_tx.lock();
                match tx.forget.values().next().cloned() {
                    Some(rc) => rc,
                    None => break,
                }
            };
            // Block lock first here; the transaction guards below are
            // taken while it is held.
            let mut jb = jb_rc.lock();
            jrnl_assert!(jb.owned_by(commit_tx));

            // The frozen copy, if any, is now the authoritative
            // committed contents.
            if jb.committed_data.is_some() {
                jb.committed_data = jb.frozen_data.take();
            } else {
                jb.frozen_data = None;
            }

            if let Some(cp_rc) = jb.checkpointed_by() {
                let mut registry = self.checkpoint_transactions.lock();
                let key = jb.buf.lock().block_id();
                let mut cp = cp_rc.lock();
                cp.checkpoint_set.remove(&key);
                jb.cp_transaction = None;
                let drained = cp.checkpoint_set.is_empty();
                drop(cp);
                if drained {
                    registry.retain(|rc| !Arc::ptr_eq(rc, &cp_rc));
                }
            }

            let buf_rc = jb.buf.clone();
            let journal_dirty = buf_rc.lock().journal_dirty();
            if journal_dirty {
                // Not yet home; this commit must see it checkpointed.
                let key = buf_rc.lock().block_id();
                let release = {
                    let mut tx = commit_tx.lock();
                    tx.checkpoint_set.insert(key, jb_rc.clone());
                    jb.cp_transaction = Some(Arc::downgrade(commit_tx));
                    self.refile_or_release(commit_tx, &mut tx, &jb_rc, &mut jb)
                };
                drop(jb);
                if release {
                    buffer::release_buffer(&jb_rc);
                }
            } else {
                jrnl_assert!(!buf_rc.lock().dirty());
                jrnl_assert!(jb.next_transaction.is_none());
                {
                    let mut tx = commit_tx.lock();
                    buffer::unfile_buffer(&mut tx, &mut jb);
                }
                drop(jb);
                buffer::release_buffer(&jb_rc);
            }
        }
    }

    /// Detach a block from the committing transaction: hand it to the
    /// transaction that claimed it, or unfile it and let the host
    /// write it back. Returns whether the caller should try to drop
    /// the bookkeeping.
    fn refile_or_release(
        &self,
        _tx_rc: &Arc<Mutex<Transaction>>,
        tx: &mut Transaction,
        jb_rc: &Arc<Mutex<JournalBuffer>>,
        jb: &mut JournalBuffer,
    ) -> bool {
        if let Some(next_rc) = jb.next_transaction.as_ref().and_then(|weak| weak.upgrade()) {
            buffer::temp_unlink_buffer(tx, jb);
            jb.next_transaction = None;
            let list = if jb.modified {
                BufferListType::Metadata
            } else {
                BufferListType::Reserved
            };
            let mut next = next_rc.lock();
            buffer::file_buffer(&next_rc, &mut next, jb_rc, jb, list);
            false
        } else {
            buffer::unfile_buffer(tx, jb);
            let buf_rc = jb.buf.clone();
            let mut buf = buf_rc.lock();
            if buf.test_clear_journal_dirty() {
                // The host owns write-back from here.
                buf.mark_dirty();
            }
            true
        }
    }
}

/// Tag layout state of the open descriptor block.
struct TagCursor {
    descriptor: Arc<Mutex<JournalBuffer>>,
    offset: usize,
    space_left: usize,
    first_tag: bool,
    last_tag_offset: usize,
}

impl TagCursor {
    fn new(descriptor: Arc<Mutex<JournalBuffer>>, block_size: usize) -> Self {
        TagCursor {
            descriptor,
            offset: HEADER_SIZE,
            space_left: block_size - HEADER_SIZE,
            first_tag: true,
            last_tag_offset: 0,
        }
    }

    /// Append a tag for `block_nr`. The first tag of a descriptor is
    /// followed by the journal UUID; later tags carry SAME_UUID
    /// instead.
    fn append(&mut self, uuid: &[u8; 16], block_nr: u32, mut flag: TagFlag) {
        if !self.first_tag {
            flag |= TagFlag::SAME_UUID;
        }
        let jb = self.descriptor.lock();
        let mut buf = jb.buf.lock();
        let data = buf.buf_mut();

        let tag = BlockTag { block_nr, flag };
        tag.encode_into(&mut data[self.offset..self.offset + TAG_SIZE]);
        self.last_tag_offset = self.offset;
        self.offset += TAG_SIZE;
        self.space_left -= TAG_SIZE;

        if self.first_tag {
            data[self.offset..self.offset + UUID_SIZE].copy_from_slice(uuid);
            self.offset += UUID_SIZE;
            self.space_left -= UUID_SIZE;
            self.first_tag = false;
        }
    }

    /// Mark the most recent tag as the last one of this descriptor. A
    /// descriptor that never received a tag (the journal aborted right
    /// after it was opened) is withdrawn instead: its buffer is left
    /// clean so the write batch skips it.
    fn seal(&self) {
        let jb = self.descriptor.lock();
        let mut buf = jb.buf.lock();
        if self.first_tag {
            buf.test_clear_dirty();
            return;
        }
        let data = buf.buf_mut();
        let raw = &mut data[self.last_tag_offset..self.last_tag_offset + TAG_SIZE];
        let mut tag = BlockTag::decode(raw);
        tag.flag |= TagFlag::LAST_TAG;
        tag.encode_into(raw);
    }
}
