//! Transactions and the handle interface.
//!
//! A handle is one task's window onto the running transaction. All of
//! its access methods follow the same locking discipline: take the
//! transaction guard, then `try_lock` the block; on contention both
//! are dropped and the attempt restarts after a yield.

extern crate alloc;
use spin::Mutex;

use crate::buffer::{self, BufferListType, JournalBuffer};
use crate::err::{JournalError, JournalResult};
use crate::journal::Journal;
use crate::jrnl_assert;
use crate::sal::Buffer;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};

/// Transaction id.
pub type Tid = u32;

/// A membership list, ordered by the block id of its members.
pub(crate) type BufferList = BTreeMap<usize, Arc<Mutex<JournalBuffer>>>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransactionState {
    /// Accepting new handles.
    Running,
    /// Sealed; commit is waiting for outstanding handles to finish.
    Locked,
    /// Commit is writing data and log blocks.
    Flush,
    /// Log writes are durable up to the commit record.
    Commit,
    /// Commit done; the transaction survives only as a checkpoint
    /// entry, if it has one.
    Finished,
}

pub struct Transaction {
    /// Journal for this transaction [no locking]
    pub(crate) journal: Weak<Journal>,
    /// Sequence number for this transaction [no locking]
    pub(crate) tid: Tid,
    /// Transaction's current state
    /// [no locking - only the committing task alters this]
    pub(crate) state: TransactionState,
    /// Where in the log does this transaction's commit start? [no locking]
    pub(crate) log_start: u32,
    /// Creation time, for age-based commit policies of the host [no locking]
    pub(crate) start_time: usize,
    /// Buffers reserved by this transaction but not yet modified [tx lock]
    pub(crate) reserved_list: BufferList,
    /// Buffers under data write-out during commit [tx lock]
    pub(crate) locked_list: BufferList,
    /// Metadata buffers owned by this transaction [tx lock]
    pub(crate) buffers: BufferList,
    /// Data buffers still to be flushed before this transaction can be
    /// committed [tx lock]
    pub(crate) sync_datalist: BufferList,
    /// Buffers waiting to be forgotten once this transaction commits [tx lock]
    pub(crate) forget: BufferList,
    /// Log-side copies queued for IO during commit [tx lock]
    pub(crate) iobuf_list: BufferList,
    /// Live blocks whose log-side copy is in flight [tx lock]
    pub(crate) shadow_list: BufferList,
    /// Control blocks (descriptors and revoke blocks) owned by this
    /// transaction [tx lock]
    pub(crate) log_list: BufferList,
    /// Blocks this transaction must see written home before its log
    /// space can be reclaimed [tx lock]
    pub(crate) checkpoint_set: BufferList,

    pub(crate) handle_info: Mutex<TransactionHandleInfo>,
}

impl Transaction {
    pub(crate) fn new(journal: Weak<Journal>) -> Self {
        Transaction {
            journal,
            tid: 0,
            state: TransactionState::Running,
            log_start: 0,
            start_time: 0,
            reserved_list: BufferList::new(),
            locked_list: BufferList::new(),
            buffers: BufferList::new(),
            sync_datalist: BufferList::new(),
            forget: BufferList::new(),
            iobuf_list: BufferList::new(),
            shadow_list: BufferList::new(),
            log_list: BufferList::new(),
            checkpoint_set: BufferList::new(),
            handle_info: Mutex::new(TransactionHandleInfo {
                updates: 0,
                outstanding_credits: 0,
                handle_count: 0,
            }),
        }
    }

    pub(crate) fn list_mut(&mut self, list: BufferListType) -> &mut BufferList {
        match list {
            BufferListType::Reserved => &mut self.reserved_list,
            BufferListType::Locked => &mut self.locked_list,
            BufferListType::Metadata => &mut self.buffers,
            BufferListType::SyncData => &mut self.sync_datalist,
            BufferListType::Forget => &mut self.forget,
            BufferListType::IO => &mut self.iobuf_list,
            BufferListType::Shadow => &mut self.shadow_list,
            BufferListType::LogCtl => &mut self.log_list,
            BufferListType::None => unreachable!(),
        }
    }

    pub(crate) fn lists(&self) -> [(BufferListType, &BufferList); 8] {
        [
            (BufferListType::Reserved, &self.reserved_list),
            (BufferListType::Locked, &self.locked_list),
            (BufferListType::Metadata, &self.buffers),
            (BufferListType::SyncData, &self.sync_datalist),
            (BufferListType::Forget, &self.forget),
            (BufferListType::IO, &self.iobuf_list),
            (BufferListType::Shadow, &self.shadow_list),
            (BufferListType::LogCtl, &self.log_list),
        ]
    }

    /// Whether every working list has drained. The checkpoint set does
    /// not count; it outlives the commit.
    pub(crate) fn drained(&self) -> bool {
        self.lists().iter().all(|(_, list)| list.is_empty())
    }
}

/// Info related to handles [handle lock]
pub struct TransactionHandleInfo {
    /// Number of handles still attached to this transaction.
    pub updates: u32,
    /// Log blocks reserved for attached and finished handles.
    pub outstanding_credits: u32,
    /// Total handles that have ever joined this transaction.
    pub handle_count: u32,
}

/// Represents a single atomic update being performed by some task.
pub struct Handle {
    /// Which compound transaction is this update a part of?
    pub(crate) transaction: Option<Arc<Mutex<Transaction>>>,
    /// Number of remaining buffers we are allowed to dirty.
    pub(crate) buffer_credits: u32,
    /// Nested `start` calls sharing this handle.
    pub(crate) ref_count: u32,
    /// Fatal error on handle [no locking]
    pub(crate) aborted: bool,
}

impl Handle {
    pub(crate) fn new(nblocks: u32) -> Self {
        Self {
            transaction: None,
            buffer_credits: nblocks,
            ref_count: 1,
            aborted: false,
        }
    }

    pub fn credits(&self) -> u32 {
        self.buffer_credits
    }

    pub(crate) fn transaction(&self) -> JournalResult<Arc<Mutex<Transaction>>> {
        if self.aborted {
            return Err(JournalError::Aborted);
        }
        self.transaction.clone().ok_or(JournalError::Aborted)
    }

    pub(crate) fn journal_of(tx_rc: &Arc<Mutex<Transaction>>) -> JournalResult<Arc<Journal>> {
        let weak = tx_rc.lock().journal.clone();
        weak.upgrade().ok_or(JournalError::Aborted)
    }

    /// Declare the intent to modify a block that already has valid,
    /// committed contents.
    ///
    /// If the block still belongs to the committing transaction, its
    /// current contents are frozen first so that commit logs what was
    /// in the block before we touch it, and the block is claimed for
    /// the running transaction.
    pub fn get_write_access(&mut self, buf_rc: &Arc<Mutex<dyn Buffer>>) -> JournalResult {
        self.do_get_access(buf_rc, false)
    }

    /// Like [`get_write_access`], but additionally snapshots the
    /// committed contents so deleted-and-reallocated metadata stays
    /// visible to undo until the reallocating transaction commits.
    ///
    /// [`get_write_access`]: Handle::get_write_access
    pub fn get_undo_access(&mut self, buf_rc: &Arc<Mutex<dyn Buffer>>) -> JournalResult {
        self.do_get_access(buf_rc, true)
    }

    fn do_get_access(&mut self, buf_rc: &Arc<Mutex<dyn Buffer>>, undo: bool) -> JournalResult {
        let tx_rc = self.transaction()?;
        let journal = Self::journal_of(&tx_rc)?;
        if journal.is_aborted() {
            return Err(JournalError::Aborted);
        }
        let jb_rc = buffer::attach(buf_rc);
        loop {
            let mut tx = tx_rc.lock();
            jrnl_assert!(tx.state == TransactionState::Running);
            let Some(mut jb) = jb_rc.try_lock() else {
                drop(tx);
                journal.yield_now();
                continue;
            };
            if !jb.owned_by(&tx_rc) && !jb.claimed_by(&tx_rc) {
                if jb.transaction.is_some() {
                    // Owned by the committing transaction. Freeze what
                    // must reach the log, then claim the block.
                    jb.freeze();
                    jb.next_transaction = Some(Arc::downgrade(&tx_rc));
                } else {
                    buffer::file_buffer(&tx_rc, &mut tx, &jb_rc, &mut jb, BufferListType::Reserved);
                }
            }
            if undo {
                jb.snapshot_committed();
            }
            return Ok(());
        }
    }

    /// Declare access to a block that has just been allocated and
    /// holds no committed contents. Any stale revoke for the block is
    /// cancelled so replay cannot suppress the new contents.
    pub fn get_create_access(&mut self, buf_rc: &Arc<Mutex<dyn Buffer>>) -> JournalResult {
        let tx_rc = self.transaction()?;
        let journal = Self::journal_of(&tx_rc)?;
        if journal.is_aborted() {
            return Err(JournalError::Aborted);
        }
        let jb_rc = buffer::attach(buf_rc);
        loop {
            let mut tx = tx_rc.lock();
            let Some(mut jb) = jb_rc.try_lock() else {
                drop(tx);
                journal.yield_now();
                continue;
            };
            if jb.transaction.is_none() && !jb.claimed_by(&tx_rc) {
                buffer::file_buffer(&tx_rc, &mut tx, &jb_rc, &mut jb, BufferListType::Reserved);
            }
            break;
        }
        self.cancel_revoke(buf_rc)
    }

    /// Mark a block as containing dirty metadata of this transaction.
    /// The first modification of a block charges one credit.
    pub fn dirty_metadata(&mut self, buf_rc: &Arc<Mutex<dyn Buffer>>) -> JournalResult {
        let tx_rc = self.transaction()?;
        let journal = Self::journal_of(&tx_rc)?;
        let Some(jb_rc) = buffer::journal_buffer_of(buf_rc) else {
            jrnl_assert!(false);
            return Err(JournalError::IoError);
        };
        loop {
            let mut tx = tx_rc.lock();
            let Some(mut jb) = jb_rc.try_lock() else {
                drop(tx);
                journal.yield_now();
                continue;
            };
            if !jb.modified {
                if self.buffer_credits == 0 {
                    return Err(JournalError::NotEnoughSpace);
                }
                jb.modified = true;
                self.buffer_credits -= 1;
            }
            {
                // The journal now decides when this block may reach
                // its home location.
                let mut buf = jb.buf.lock();
                buf.test_clear_dirty();
                buf.mark_journal_dirty();
            }
            if jb.owned_by(&tx_rc) {
                buffer::move_buffer(&tx_rc, &mut tx, &jb_rc, &mut jb, BufferListType::Metadata);
            } else {
                // The committing transaction still owns the block; it
                // is claimed for us and refiled when that commit ends.
                jrnl_assert!(jb.claimed_by(&tx_rc));
            }
            return Ok(());
        }
    }

    /// Mark a block as ordered data of this transaction: its contents
    /// must reach the home location before the transaction commits.
    pub fn dirty_data(&mut self, buf_rc: &Arc<Mutex<dyn Buffer>>) -> JournalResult {
        let tx_rc = self.transaction()?;
        let journal = Self::journal_of(&tx_rc)?;
        let jb_rc = buffer::attach(buf_rc);
        loop {
            let mut tx = tx_rc.lock();
            let Some(mut jb) = jb_rc.try_lock() else {
                drop(tx);
                journal.yield_now();
                continue;
            };
            if jb.transaction.is_some() && !jb.owned_by(&tx_rc) {
                // Still queued under the committing transaction, which
                // will write it out; that ordering also covers us.
                jrnl_assert!(
                    jb.jlist == BufferListType::SyncData || jb.jlist == BufferListType::Locked
                );
                return Ok(());
            }
            if jb.owned_by(&tx_rc) {
                buffer::move_buffer(&tx_rc, &mut tx, &jb_rc, &mut jb, BufferListType::SyncData);
            } else {
                buffer::file_buffer(&tx_rc, &mut tx, &jb_rc, &mut jb, BufferListType::SyncData);
            }
            return Ok(());
        }
    }

    /// Tell the journal this block has been deleted. The block must
    /// not reach disk in its pre-deletion state, and any undo snapshot
    /// obligations move with it.
    pub fn forget(&mut self, buf_rc: &Arc<Mutex<dyn Buffer>>) -> JournalResult {
        let tx_rc = self.transaction()?;
        let journal = Self::journal_of(&tx_rc)?;
        let Some(jb_rc) = buffer::journal_buffer_of(buf_rc) else {
            return Ok(());
        };
        loop {
            let mut tx = tx_rc.lock();
            let Some(mut jb) = jb_rc.try_lock() else {
                drop(tx);
                journal.yield_now();
                continue;
            };
            if jb.owned_by(&tx_rc) {
                {
                    let mut buf = jb.buf.lock();
                    buf.clear_dirty();
                    buf.clear_journal_dirty();
                }
                if jb.cp_transaction.is_some() {
                    // An older checkpoint still refers to the block;
                    // commit will drop that reference.
                    buffer::move_buffer(&tx_rc, &mut tx, &jb_rc, &mut jb, BufferListType::Forget);
                } else {
                    buffer::unfile_buffer(&mut tx, &mut jb);
                    drop(jb);
                    drop(tx);
                    buffer::release_buffer(&jb_rc);
                }
            } else if jb.claimed_by(&tx_rc) {
                // We claimed it from the committing transaction but
                // now drop the block instead.
                jb.next_transaction = None;
            }
            return Ok(());
        }
    }
}
