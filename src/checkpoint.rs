//! Checkpointing: writing committed blocks home and reclaiming the
//! log space their transactions occupy.
//!
//! Registry members are processed oldest first. A block that a live
//! transaction owns again is skipped; the newer commit writes a newer
//! copy, which satisfies this checkpoint as well.

extern crate alloc;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::buffer::{self, JournalBuffer};
use crate::err::{JournalError, JournalResult};
use crate::journal::{Journal, JournalFlag};
use crate::jrnl_assert;
use crate::sal::IoOutcome;
use crate::tx::Transaction;

impl Journal {
    /// Write every checkpoint member home, drop drained transactions
    /// from the registry and advance the log tail over the reclaimed
    /// space.
    pub fn checkpoint(&self) -> JournalResult {
        log::debug!("Start checkpoint.");
        let registry: Vec<Arc<Mutex<Transaction>>> =
            self.checkpoint_transactions.lock().iter().cloned().collect();
        for tx_rc in registry.iter() {
            self.checkpoint_transaction(tx_rc)?;
        }
        self.checkpoint_transactions
            .lock()
            .retain(|tx_rc| !tx_rc.lock().checkpoint_set.is_empty());
        self.cleanup_tail();
        Ok(())
    }

    fn checkpoint_transaction(&self, tx_rc: &Arc<Mutex<Transaction>>) -> JournalResult {
        let mut tx = tx_rc.lock();
        let members: Vec<(usize, Arc<Mutex<JournalBuffer>>)> =
            tx.checkpoint_set.iter().map(|(key, rc)| (*key, rc.clone())).collect();

        for (key, jb_rc) in members {
            let Some(mut jb) = jb_rc.try_lock() else {
                continue;
            };
            if jb.transaction.is_some() {
                continue;
            }

            let buf_rc = jb.buf.clone();
            let mut buf = buf_rc.lock();
            if buf.dirty() {
                match buf.sync_write(false) {
                    IoOutcome::Done => {}
                    _ => {
                        log::error!("Failed to write buffer {} home.", buf.block_id());
                        drop(buf);
                        drop(jb);
                        drop(tx);
                        self.abort_hard();
                        return Err(JournalError::IoError);
                    }
                }
            }
            drop(buf);

            tx.checkpoint_set.remove(&key);
            jb.cp_transaction = None;
            drop(jb);
            buffer::release_buffer(&jb_rc);
        }
        Ok(())
    }

    /// Drop checkpoint members that need no write at all: blocks the
    /// host has already written home and no transaction owns.
    pub(crate) fn clean_checkpoint_list(&self) {
        let registry: Vec<Arc<Mutex<Transaction>>> =
            self.checkpoint_transactions.lock().iter().cloned().collect();
        let mut dropped = 0;

        for tx_rc in registry.iter() {
            let mut tx = tx_rc.lock();
            let members: Vec<(usize, Arc<Mutex<JournalBuffer>>)> =
                tx.checkpoint_set.iter().map(|(key, rc)| (*key, rc.clone())).collect();

            for (key, jb_rc) in members {
                let Some(mut jb) = jb_rc.try_lock() else {
                    continue;
                };
                if jb.transaction.is_some() {
                    continue;
                }
                let clean = {
                    let buf = jb.buf.lock();
                    !buf.dirty() && !buf.journal_dirty()
                };
                if !clean {
                    continue;
                }
                tx.checkpoint_set.remove(&key);
                jb.cp_transaction = None;
                drop(jb);
                buffer::release_buffer(&jb_rc);
                dropped += 1;
            }
        }

        self.checkpoint_transactions
            .lock()
            .retain(|tx_rc| !tx_rc.lock().checkpoint_set.is_empty());
        if dropped > 0 {
            log::debug!("Dropped {} clean checkpoint buffers.", dropped);
        }
    }

    /// Advance the log tail past transactions no longer in the
    /// registry, then record the new tail in the superblock.
    ///
    /// The anchor transaction guards are only tried; on contention the
    /// cleanup simply runs again on a later call.
    pub(crate) fn cleanup_tail(&self) {
        let mut states = self.states.lock();
        let registry = self.checkpoint_transactions.lock();

        let anchor = if let Some(tx_rc) = registry.front() {
            tx_rc.try_lock().map(|tx| (tx.tid, tx.log_start))
        } else if let Some(tx_rc) = &states.committing_transaction {
            tx_rc.try_lock().map(|tx| (tx.tid, tx.log_start))
        } else if let Some(tx_rc) = &states.running_transaction {
            tx_rc.try_lock().map(|tx| (tx.tid, states.head))
        } else {
            Some((states.transaction_sequence, states.head))
        };
        let Some((first_tid, blocknr)) = anchor else {
            return;
        };
        drop(registry);

        jrnl_assert!(blocknr != 0);
        if states.tail_sequence == first_tid {
            return;
        }
        jrnl_assert!(first_tid > states.tail_sequence);

        let freed = if blocknr >= states.tail {
            blocknr - states.tail
        } else {
            (states.last - states.first) - (states.tail - blocknr)
        };
        log::debug!(
            "Cleanup tail: sequence {} -> {}, tail block {} -> {}, freed {}.",
            states.tail_sequence,
            first_tid,
            states.tail,
            blocknr,
            freed
        );

        states.free += freed;
        states.tail_sequence = first_tid;
        states.tail = blocknr;
        let aborted = states.flags.contains(JournalFlag::ABORT);
        drop(states);

        if !aborted {
            self.update_superblock();
        }
    }
}
