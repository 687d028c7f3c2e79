//! Per-block journal bookkeeping.
//!
//! Every block the journal touches carries one [`JournalBuffer`],
//! reachable from the host buffer through its private slot. It records
//! which transaction owns the block, which membership list it sits on,
//! and any shadow state needed while the block is in flight.
//!
//! Lock order: a task holding a transaction guard may only `try_lock`
//! a block; a task that locked the block first may take the
//! transaction guard blocking. The list manipulation functions below
//! therefore take both guards from the caller, which proves it already
//! holds them in a legal order.

extern crate alloc;
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::Mutex;

use crate::jrnl_assert;
use crate::sal::Buffer;
use crate::tx::Transaction;

/// Which membership list of its owning transaction a block sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferListType {
    None,
    SyncData,
    Metadata,
    Forget,
    IO,
    Shadow,
    LogCtl,
    Reserved,
    Locked,
}

pub(crate) struct JournalBuffer {
    /// The host buffer this bookkeeping belongs to.
    pub buf: Arc<Mutex<dyn Buffer>>,
    /// The transaction this block currently belongs to, if any.
    pub transaction: Option<Weak<Mutex<Transaction>>>,
    /// The running transaction that claimed this block while the
    /// owning one is still committing.
    pub next_transaction: Option<Weak<Mutex<Transaction>>>,
    /// The transaction whose checkpoint set holds this block.
    pub cp_transaction: Option<Weak<Mutex<Transaction>>>,
    /// List membership under the owning transaction.
    pub jlist: BufferListType,
    /// Snapshot of the block as it must reach the log, taken when a
    /// later transaction modified the block before the owning one had
    /// written it out.
    pub frozen_data: Option<Vec<u8>>,
    /// Snapshot of the committed contents, kept for undo-visible
    /// access while the block is being reallocated.
    pub committed_data: Option<Vec<u8>>,
    /// For a log-side IO buffer: the live block it shadows.
    pub shadows: Option<Arc<Mutex<JournalBuffer>>>,
    /// Set once the current transaction modified the block and charged
    /// a credit for it.
    pub modified: bool,
}

impl JournalBuffer {
    fn new(buf: Arc<Mutex<dyn Buffer>>) -> Self {
        JournalBuffer {
            buf,
            transaction: None,
            next_transaction: None,
            cp_transaction: None,
            jlist: BufferListType::None,
            frozen_data: None,
            committed_data: None,
            shadows: None,
            modified: false,
        }
    }

    pub fn owned_by(&self, tx_rc: &Arc<Mutex<Transaction>>) -> bool {
        match &self.transaction {
            Some(weak) => weak.upgrade().map_or(false, |rc| Arc::ptr_eq(&rc, tx_rc)),
            None => false,
        }
    }

    pub fn claimed_by(&self, tx_rc: &Arc<Mutex<Transaction>>) -> bool {
        match &self.next_transaction {
            Some(weak) => weak.upgrade().map_or(false, |rc| Arc::ptr_eq(&rc, tx_rc)),
            None => false,
        }
    }

    pub fn checkpointed_by(&self) -> Option<Arc<Mutex<Transaction>>> {
        self.cp_transaction.as_ref().and_then(|weak| weak.upgrade())
    }

    /// Freeze the current block contents so the commit machinery logs
    /// them even if the live buffer is modified afterwards.
    pub fn freeze(&mut self) {
        if self.frozen_data.is_none() {
            let buf = self.buf.lock();
            self.frozen_data = Some(buf.buf().to_vec());
        }
    }

    /// Keep an undo-visible snapshot of the committed contents.
    pub fn snapshot_committed(&mut self) {
        if self.committed_data.is_none() {
            let buf = self.buf.lock();
            self.committed_data = Some(buf.buf().to_vec());
        }
    }
}

/// The journal bookkeeping attached to a host buffer, if any.
pub(crate) fn journal_buffer_of(buf_rc: &Arc<Mutex<dyn Buffer>>) -> Option<Arc<Mutex<JournalBuffer>>> {
    let buf = buf_rc.lock();
    buf.private()
        .as_ref()
        .and_then(|private| private.downcast_ref::<Weak<Mutex<JournalBuffer>>>())
        .and_then(|weak| weak.upgrade())
}

/// Attach journal bookkeeping to a host buffer, or fetch the existing
/// one. The private slot keeps only a weak link, so an attached block
/// that ends up on no list simply expires.
pub(crate) fn attach(buf_rc: &Arc<Mutex<dyn Buffer>>) -> Arc<Mutex<JournalBuffer>> {
    if let Some(jb_rc) = journal_buffer_of(buf_rc) {
        return jb_rc;
    }
    let jb_rc = Arc::new(Mutex::new(JournalBuffer::new(buf_rc.clone())));
    let mut buf = buf_rc.lock();
    buf.set_private(Some(Box::new(Arc::downgrade(&jb_rc))));
    buf.set_journaled(true);
    jb_rc
}

/// File a list-less block onto one of `tx`'s membership lists and make
/// `tx` its owner.
pub(crate) fn file_buffer(
    tx_rc: &Arc<Mutex<Transaction>>,
    tx: &mut Transaction,
    jb_rc: &Arc<Mutex<JournalBuffer>>,
    jb: &mut JournalBuffer,
    list: BufferListType,
) {
    jrnl_assert!(jb.jlist == BufferListType::None);
    jrnl_assert!(list != BufferListType::None);
    let key = jb.buf.lock().block_id();
    let _evicted = tx.list_mut(list).insert(key, jb_rc.clone());
    jrnl_assert!(_evicted.is_none());
    jb.jlist = list;
    jb.transaction = Some(Arc::downgrade(tx_rc));
}

/// Drop a block from its current list without touching ownership.
pub(crate) fn temp_unlink_buffer(tx: &mut Transaction, jb: &mut JournalBuffer) {
    if jb.jlist == BufferListType::None {
        return;
    }
    let key = jb.buf.lock().block_id();
    let _removed = tx.list_mut(jb.jlist).remove(&key);
    jrnl_assert!(_removed.is_some());
    jb.jlist = BufferListType::None;
}

/// Drop a block from its list and sever its transaction ownership.
pub(crate) fn unfile_buffer(tx: &mut Transaction, jb: &mut JournalBuffer) {
    temp_unlink_buffer(tx, jb);
    jb.transaction = None;
}

/// Move a block between two lists of the same transaction.
pub(crate) fn move_buffer(
    tx_rc: &Arc<Mutex<Transaction>>,
    tx: &mut Transaction,
    jb_rc: &Arc<Mutex<JournalBuffer>>,
    jb: &mut JournalBuffer,
    list: BufferListType,
) {
    if jb.jlist == list {
        return;
    }
    temp_unlink_buffer(tx, jb);
    file_buffer(tx_rc, tx, jb_rc, jb, list);
}

/// Detach the bookkeeping from its host buffer once nothing refers to
/// the block any more. Dropping the last membership is only legal when
/// every ownership field has been cleared first.
pub(crate) fn release_buffer(jb_rc: &Arc<Mutex<JournalBuffer>>) {
    let jb = jb_rc.lock();
    if jb.transaction.is_some() || jb.next_transaction.is_some() || jb.cp_transaction.is_some() {
        return;
    }
    jrnl_assert!(jb.jlist == BufferListType::None);
    let buf_rc = jb.buf.clone();
    drop(jb);
    let mut buf = buf_rc.lock();
    buf.set_journaled(false);
    buf.set_private(None);
}
