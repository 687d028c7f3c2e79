//! The journal object and its lifecycle.

extern crate alloc;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::mem;
use spin::Mutex;

use crate::buffer::{self, BufferListType, JournalBuffer};
use crate::config::{JOURNAL_MAGIC, MIN_JOURNAL_BLOCKS, MIN_LOG_RESERVED_BLOCKS, WRITE_BATCH_BLOCKS};
use crate::disk::{BlockType, Header, Superblock};
use crate::err::{JournalError, JournalResult};
use crate::jrnl_assert;
use crate::revoke::RevokeTables;
use crate::sal::{BlockDevice, Buffer, IoOutcome, System, WaitQueue};
use crate::tx::{Handle, Tid, Transaction, TransactionState};

bitflags! {
    pub struct JournalFlag: usize {
        /// Journal is being torn down
        const UNMOUNT = 0x001;
        /// Journaling has been aborted for errors
        const ABORT = 0x002;
        /// The errno in the sb has been acked
        const ACK_ERR = 0x004;
        /// The journal superblock records an empty log
        const FLUSHED = 0x008;
        /// The journal superblock is loaded
        const LOADED = 0x010;
        /// Use IO barriers for the commit record
        const BARRIER = 0x020;
        /// Abort the journal as soon as a data write fails
        const ABORT_ON_SYNCDATA_ERR = 0x040;
    }
}

pub struct Journal {
    pub(crate) system: Arc<dyn System>,
    pub(crate) sb_buffer: Arc<Mutex<dyn Buffer>>,
    pub(crate) format_version: i32,
    /// Journal states protected by a single state lock
    pub(crate) states: Mutex<JournalStates>,
    /// Committed transactions awaiting checkpoint, oldest first
    /// [registry lock]
    pub(crate) checkpoint_transactions: Mutex<VecDeque<Arc<Mutex<Transaction>>>>,
    /// Revoke records of the running and the committing transaction
    /// [revoke lock]
    pub(crate) revoke_tables: Mutex<RevokeTables>,
    /// Block devices
    pub(crate) devs: JournalDevs,
    /// Total maximum capacity of the journal region on disk
    pub(crate) maxlen: u32,
    /// Maximum number of metadata buffers to allow in a single compound
    /// commit transaction
    pub(crate) max_transaction_buffers: u32,
    /// Maximum number of blocks submitted per IO burst during commit
    pub(crate) wbufsize: usize,
    /// Copied from the superblock; descriptor tags refer to it
    pub(crate) uuid: [u8; 16],

    /// Woken when the running transaction loses its last handle
    pub(crate) wait_updates: Arc<dyn WaitQueue>,
    /// Woken when a sealed transaction leaves the running slot
    pub(crate) wait_transaction_locked: Arc<dyn WaitQueue>,
    /// Woken when a commit finishes
    pub(crate) wait_done_commit: Arc<dyn WaitQueue>,
}

pub(crate) struct JournalDevs {
    pub dev: Arc<dyn BlockDevice>,
    pub blk_offset: u32,
    pub fs_dev: Arc<dyn BlockDevice>,
}

/// Journal states protected by a single state lock.
///
/// The ring pointers are log-relative block numbers; `last` is an
/// exclusive bound.
pub(crate) struct JournalStates {
    pub flags: JournalFlag,
    pub errno: i32,
    pub running_transaction: Option<Arc<Mutex<Transaction>>>,
    pub committing_transaction: Option<Arc<Mutex<Transaction>>>,
    /// Journal head: identifies the first unused block in the journal.
    pub head: u32,
    /// Journal tail: identifies the oldest still-used block in the journal
    pub tail: u32,
    /// Journal free: how many free blocks are there in the journal?
    pub free: u32,
    /// Journal start: the block number of the first usable block in the journal
    pub first: u32,
    /// Journal end: one past the last usable block in the journal
    pub last: u32,

    /// Sequence number of the oldest transaction in the log
    pub tail_sequence: Tid,
    /// Sequence number of the next transaction to grant
    pub transaction_sequence: Tid,
    /// Sequence number of the most recently committed transaction
    pub commit_sequence: Tid,
}

/// Public interfaces.
impl Journal {
    /// Initialize an in-memory journal structure over a device region
    /// previously set aside for it. The journal stays unusable until
    /// [`create`] or [`load`] has run.
    ///
    /// [`create`]: Journal::create
    /// [`load`]: Journal::load
    pub fn init_dev(
        system: Arc<dyn System>,
        dev: Arc<dyn BlockDevice>,
        fs_dev: Arc<dyn BlockDevice>,
        start: u32,
        len: u32,
    ) -> JournalResult<Self> {
        if dev.block_size() < mem::size_of::<Superblock>() {
            log::error!("Device block size {} cannot hold a journal superblock.", dev.block_size());
            return Err(JournalError::InvalidJournalSize);
        }
        let devs = JournalDevs {
            dev,
            blk_offset: start,
            fs_dev,
        };
        let sb_buffer = system
            .get_buffer_provider()
            .lock()
            .get_buffer(devs.dev.clone(), devs.blk_offset as usize)
            .ok_or(JournalError::InsufficientCache)?;

        Ok(Self {
            sb_buffer,
            format_version: 0,
            states: Mutex::new(JournalStates {
                flags: JournalFlag::ABORT,
                errno: 0,
                running_transaction: None,
                committing_transaction: None,
                head: 0,
                tail: 0,
                free: 0,
                first: 0,
                last: 0,
                tail_sequence: 0,
                transaction_sequence: 0,
                commit_sequence: 0,
            }),
            checkpoint_transactions: Mutex::new(VecDeque::new()),
            revoke_tables: Mutex::new(RevokeTables::new()),
            devs,
            maxlen: len,
            max_transaction_buffers: 0,
            wbufsize: WRITE_BATCH_BLOCKS,
            uuid: [0; 16],
            wait_updates: system.new_wait_queue(),
            wait_transaction_locked: system.new_wait_queue(),
            wait_done_commit: system.new_wait_queue(),
            system,
        })
    }

    /// Wipe the journal region and write a fresh superblock.
    pub fn create(&mut self) -> JournalResult {
        if self.maxlen < MIN_JOURNAL_BLOCKS {
            log::error!("Journal too small: {} blocks.", self.maxlen);
            return Err(JournalError::InvalidJournalSize);
        }

        log::debug!("Zeroing out journal blocks.");
        for block in 0..self.maxlen {
            let buf_rc = self.log_block_buffer(block)?;
            let mut buf = buf_rc.lock();
            buf.buf_mut().fill(0);
        }
        self.sync_buf()?;
        log::debug!("Journal cleared.");

        {
            let mut states = self.states.lock();
            let sb_buffer = self.sb_buffer.clone();
            let mut sb_guard = sb_buffer.lock();
            let sb = Self::superblock_mut(&mut *sb_guard);

            sb.header.magic = JOURNAL_MAGIC.to_be();
            sb.header.block_type = <BlockType as Into<u32>>::into(BlockType::SuperblockV2).to_be();
            sb.block_size = (self.devs.dev.block_size() as u32).to_be();
            sb.maxlen = self.maxlen.to_be();
            sb.first = 1_u32.to_be();
            sb.sequence = 1_u32.to_be();

            states.transaction_sequence = 1;
            states.flags.remove(JournalFlag::ABORT);
            drop(states);

            // `start` stays zero: the log is empty. Later superblock
            // updates skip an empty log, so flush this one here.
            if sb_guard.sync_write(false) != IoOutcome::Done {
                log::error!("Failed to write the journal superblock.");
                return Err(JournalError::IoError);
            }
        }
        self.format_version = 2;
        self.reset()
    }

    /// Load the journal from an existing, externally recovered
    /// superblock and make it ready for new transactions.
    pub fn load(&mut self) -> JournalResult {
        self.load_superblock()?;
        self.reset()?;

        let mut states = self.states.lock();
        states.flags.remove(JournalFlag::ABORT);
        states.flags.insert(JournalFlag::LOADED);
        Ok(())
    }

    /// Flush every outstanding checkpoint and record the log as empty.
    /// All transactions must have finished before this is called.
    pub fn destroy(&mut self) -> JournalResult {
        {
            let states = self.states.lock();
            jrnl_assert!(states.running_transaction.is_none());
            jrnl_assert!(states.committing_transaction.is_none());
        }
        self.checkpoint()?;
        jrnl_assert!(self.checkpoint_transactions.lock().is_empty());
        {
            let mut states = self.states.lock();
            states.tail = 0;
            states.tail_sequence = states.transaction_sequence;
            states.flags.insert(JournalFlag::UNMOUNT);
        }
        self.update_superblock();
        log::debug!("Journal destroyed.");
        Ok(())
    }

    /// Obtain a handle on the running transaction with room to modify
    /// `nblocks` blocks, starting a transaction if none is running. A
    /// task that already holds a handle gets the same handle back.
    pub fn start(journal: &Arc<Journal>, nblocks: u32) -> JournalResult<Arc<Mutex<Handle>>> {
        if let Some(handle_rc) = journal.system.get_current_handle() {
            handle_rc.lock().ref_count += 1;
            return Ok(handle_rc);
        }
        let mut handle = Handle::new(nblocks);
        start_handle(journal, &mut handle)?;
        let handle_rc = Arc::new(Mutex::new(handle));
        journal.system.set_current_handle(Some(handle_rc.clone()));
        Ok(handle_rc)
    }

    /// Release a handle. The owning transaction becomes eligible for
    /// commit once its last handle is gone.
    pub fn stop(&self, handle_rc: &Arc<Mutex<Handle>>) -> JournalResult {
        let mut handle = handle_rc.lock();
        jrnl_assert!(handle.ref_count > 0);
        handle.ref_count -= 1;
        if handle.ref_count > 0 {
            return Ok(());
        }
        let tx_opt = handle.transaction.take();
        let unused_credits = handle.buffer_credits;
        let aborted = handle.aborted;
        drop(handle);
        self.system.set_current_handle(None);

        if let Some(tx_rc) = tx_opt {
            let tx = tx_rc.lock();
            let mut info = tx.handle_info.lock();
            jrnl_assert!(info.updates > 0);
            info.updates -= 1;
            info.outstanding_credits = info.outstanding_credits.saturating_sub(unused_credits);
            let quiesced = info.updates == 0;
            drop(info);
            drop(tx);
            if quiesced {
                self.wait_updates.notify_all();
            }
        }
        log::debug!("Handle released.");
        if aborted || self.is_aborted() {
            return Err(JournalError::Aborted);
        }
        Ok(())
    }

    /// Put the journal in the abort state. No further transactions are
    /// admitted, and the error is recorded in the superblock.
    pub fn abort(&self, errno: i32) {
        {
            let mut states = self.states.lock();
            if states.flags.contains(JournalFlag::ABORT) {
                if states.errno == 0 {
                    states.errno = errno;
                }
                return;
            }
            log::error!("Aborting journal (errno {}).", errno);
            states.errno = errno;
            states.flags.insert(JournalFlag::ABORT);
        }
        self.update_superblock();
    }

    /// Abort without touching the on-disk superblock. Used on the
    /// commit path, where further journal IO cannot be trusted.
    pub(crate) fn abort_hard(&self) {
        let mut states = self.states.lock();
        if !states.flags.contains(JournalFlag::ABORT) {
            log::error!("Aborting journal.");
            states.flags.insert(JournalFlag::ABORT);
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.states.lock().flags.contains(JournalFlag::ABORT)
    }

    /// The recorded abort error, if any.
    pub fn errno(&self) -> i32 {
        self.states.lock().errno
    }

    /// Acknowledge a recorded error so new transactions are admitted
    /// again.
    pub fn ack_err(&self) {
        let mut states = self.states.lock();
        if states.errno != 0 {
            states.flags.insert(JournalFlag::ACK_ERR);
        }
    }

    /// Clear a recorded error and write the cleaned superblock.
    pub fn clear_err(&self) {
        {
            let mut states = self.states.lock();
            if states.flags.contains(JournalFlag::ABORT) {
                return;
            }
            states.errno = 0;
        }
        self.update_superblock();
    }

    /// Order the commit record against preceding log writes with a
    /// device barrier. Cleared automatically when the device refuses.
    pub fn set_barrier(&self, enabled: bool) {
        let mut states = self.states.lock();
        if enabled {
            states.flags.insert(JournalFlag::BARRIER);
        } else {
            states.flags.remove(JournalFlag::BARRIER);
        }
    }

    /// Escalate data write-back failures to a journal abort as soon as
    /// they are seen, instead of at commit-record time.
    pub fn set_abort_on_syncdata_err(&self, enabled: bool) {
        let mut states = self.states.lock();
        if enabled {
            states.flags.insert(JournalFlag::ABORT_ON_SYNCDATA_ERR);
        } else {
            states.flags.remove(JournalFlag::ABORT_ON_SYNCDATA_ERR);
        }
    }

    /// Unused block count of the log ring.
    pub fn log_free(&self) -> u32 {
        self.states.lock().free
    }

    /// Sequence number of the most recently committed transaction.
    pub fn commit_sequence(&self) -> Tid {
        self.states.lock().commit_sequence
    }

    /// Block until the transaction `tid` has committed.
    pub fn wait_for_commit(&self, tid: Tid) -> JournalResult {
        loop {
            let token = self.wait_done_commit.prepare_to_wait();
            if self.states.lock().commit_sequence >= tid {
                break;
            }
            self.wait_done_commit.wait(token);
        }
        if self.is_aborted() {
            Err(JournalError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Walk every tracked block and verify that membership lists,
    /// ownership back-links and checkpoint registry entries agree.
    /// Meant for quiesced moments; panics on inconsistency.
    pub fn self_check(&self) {
        let states = self.states.lock();
        if let Some(tx_rc) = &states.running_transaction {
            Self::check_transaction(tx_rc);
        }
        if let Some(tx_rc) = &states.committing_transaction {
            Self::check_transaction(tx_rc);
        }
        drop(states);

        let registry = self.checkpoint_transactions.lock();
        for tx_rc in registry.iter() {
            let tx = tx_rc.lock();
            assert!(
                !tx.checkpoint_set.is_empty(),
                "checkpoint registry holds a drained transaction"
            );
            for (key, jb_rc) in tx.checkpoint_set.iter() {
                let jb = jb_rc.lock();
                assert_eq!(*key, jb.buf.lock().block_id());
                let cp = jb.checkpointed_by();
                assert!(
                    cp.map_or(false, |rc| Arc::ptr_eq(&rc, tx_rc)),
                    "checkpoint member does not point back at its transaction"
                );
            }
        }
    }
}

/// Internal helper functions.
impl Journal {
    fn check_transaction(tx_rc: &Arc<Mutex<Transaction>>) {
        let tx = tx_rc.lock();
        for (list_type, list) in tx.lists() {
            for (key, jb_rc) in list.iter() {
                let jb = jb_rc.lock();
                assert_eq!(jb.jlist, list_type);
                assert_eq!(*key, jb.buf.lock().block_id());
                assert!(jb.owned_by(tx_rc), "list member not owned by its transaction");
            }
        }
    }

    /// Given a journal structure, initialize the various fields for
    /// startup of a new journaling session. We use this both when
    /// creating a journal and after loading an old one to reset it for
    /// subsequent use.
    fn reset(&mut self) -> JournalResult {
        let (first, last) = {
            let sb_buffer = self.sb_buffer.clone();
            let sb_guard = sb_buffer.lock();
            let sb = Self::superblock_ref(&*sb_guard);
            (u32::from_be(sb.first), u32::from_be(sb.maxlen))
        };

        if first + MIN_JOURNAL_BLOCKS > last + 1 {
            log::error!("Journal too small: blocks {}-{}.", first, last);
            return Err(JournalError::InvalidJournalSize);
        }

        {
            let mut states = self.states.lock();
            states.first = first;
            states.last = last;

            states.head = first;
            states.tail = first;
            states.free = last - first;

            states.tail_sequence = states.transaction_sequence;
            states.commit_sequence = states.transaction_sequence.wrapping_sub(1);
        }
        self.max_transaction_buffers = self.maxlen / 4;

        self.update_superblock();
        Ok(())
    }

    /// Load the on-disk journal superblock and read the key fields.
    fn load_superblock(&mut self) -> JournalResult {
        self.validate_superblock()?;

        let sb_buffer = self.sb_buffer.clone();
        let sb_guard = sb_buffer.lock();
        let sb = Self::superblock_ref(&*sb_guard);
        let mut states = self.states.lock();

        states.tail_sequence = u32::from_be(sb.sequence);
        states.transaction_sequence = states.tail_sequence;
        states.tail = u32::from_be(sb.start);
        states.first = u32::from_be(sb.first);
        states.errno = u32::from_be(sb.errno) as i32;
        if sb.start == 0 {
            states.flags.insert(JournalFlag::FLUSHED);
        }
        drop(states);
        self.uuid = sb.uuid;
        Ok(())
    }

    /// Update the journal's dynamic superblock fields and write the
    /// superblock to disk before returning.
    pub(crate) fn update_superblock(&self) {
        let mut states = self.states.lock();
        let sb_buffer = self.sb_buffer.clone();
        let mut sb_guard = sb_buffer.lock();
        let sb = Self::superblock_mut(&mut *sb_guard);

        if sb.start == 0 && states.tail_sequence == states.transaction_sequence {
            log::debug!("Skipping superblock update on already-flushed journal.");
            states.flags.insert(JournalFlag::FLUSHED);
            return;
        }

        log::debug!(
            "Updating superblock (start {}, sequence {}, errno {}).",
            states.tail,
            states.tail_sequence,
            states.errno
        );
        sb.sequence = states.tail_sequence.to_be();
        sb.start = states.tail.to_be();
        sb.errno = (states.errno as u32).to_be();

        if sb.start != 0 {
            states.flags.remove(JournalFlag::FLUSHED);
        } else {
            states.flags.insert(JournalFlag::FLUSHED);
        }
        drop(states);

        match sb_guard.sync_write(false) {
            IoOutcome::Done => {}
            _ => log::error!("Failed to write the journal superblock."),
        }
    }

    fn validate_superblock(&mut self) -> JournalResult {
        let sb_buffer = self.sb_buffer.clone();
        let sb_guard = sb_buffer.lock();
        let sb = Self::superblock_ref(&*sb_guard);

        if u32::from_be(sb.header.magic) != JOURNAL_MAGIC {
            log::error!("Not a journal superblock.");
            return Err(JournalError::InvalidSuperblock);
        }
        if u32::from_be(sb.block_size) != self.devs.dev.block_size() as u32 {
            log::error!("Journal block size does not match the device.");
            return Err(JournalError::InvalidSuperblock);
        }

        let block_type: BlockType = u32::from_be(sb.header.block_type).try_into()?;
        match block_type {
            BlockType::SuperblockV1 => self.format_version = 1,
            BlockType::SuperblockV2 => self.format_version = 2,
            _ => {
                log::error!("Invalid journal superblock block type.");
                return Err(JournalError::InvalidSuperblock);
            }
        }

        if u32::from_be(sb.maxlen) <= self.maxlen {
            self.maxlen = u32::from_be(sb.maxlen);
        } else {
            log::error!("Journal too short.");
            return Err(JournalError::InvalidSuperblock);
        }

        if u32::from_be(sb.first) == 0 || u32::from_be(sb.first) >= self.maxlen {
            log::error!("Journal has invalid start block.");
            return Err(JournalError::InvalidSuperblock);
        }

        Ok(())
    }

    fn superblock_ref<'a>(buf: &'a dyn Buffer) -> &'a Superblock {
        unsafe { &*(buf.data() as *const Superblock) }
    }

    fn superblock_mut<'a>(buf: &'a mut dyn Buffer) -> &'a mut Superblock {
        buf.mark_dirty();
        unsafe { &mut *(buf.data() as *mut Superblock) }
    }

    /// Usable log space, with headroom held back for descriptors,
    /// revoke blocks and the commit block.
    pub(crate) fn log_space_left(states: &JournalStates) -> u32 {
        let left = states.free.saturating_sub(MIN_LOG_RESERVED_BLOCKS);
        left - (left >> 3)
    }

    /// Claim the next unused log block, advancing the head pointer.
    pub(crate) fn next_log_block(&self) -> JournalResult<u32> {
        let mut states = self.states.lock();
        if states.free == 0 {
            return Err(JournalError::NotEnoughSpace);
        }
        let block = states.head;
        states.head += 1;
        if states.head == states.last {
            states.head = states.first;
        }
        states.free -= 1;
        Ok(block)
    }

    /// The cached buffer backing a log-relative block.
    pub(crate) fn log_block_buffer(&self, block: u32) -> JournalResult<Arc<Mutex<dyn Buffer>>> {
        let block_id = (self.devs.blk_offset + block) as usize;
        self.system
            .get_buffer_provider()
            .lock()
            .get_buffer(self.devs.dev.clone(), block_id)
            .ok_or(JournalError::InsufficientCache)
    }

    /// Allocate and zero a control block of the given type, filing it
    /// on the transaction's control list. Called with the transaction
    /// guard held.
    pub(crate) fn get_descriptor_buffer(
        &self,
        tx_rc: &Arc<Mutex<Transaction>>,
        tx: &mut Transaction,
        block_type: BlockType,
    ) -> JournalResult<Arc<Mutex<JournalBuffer>>> {
        let block = self.next_log_block()?;
        let buf_rc = self.log_block_buffer(block)?;
        {
            let mut buf = buf_rc.lock();
            buf.buf_mut().fill(0);
            Header::new(block_type, tx.tid).encode_into(buf.buf_mut());
            buf.set_uptodate();
        }
        let jb_rc = buffer::attach(&buf_rc);
        {
            // Freshly attached; nothing else can hold this bookkeeping yet.
            let mut jb = jb_rc.lock();
            buffer::file_buffer(tx_rc, tx, &jb_rc, &mut jb, BufferListType::LogCtl);
        }
        Ok(jb_rc)
    }

    /// Block until a submitted write on `buf_rc` has completed. Must
    /// be called with no journal locks held.
    pub(crate) fn wait_on_buffer(&self, buf_rc: &Arc<Mutex<dyn Buffer>>) {
        loop {
            let queue = {
                let buf = buf_rc.lock();
                if !buf.locked() {
                    return;
                }
                buf.wait_queue()
            };
            let token = queue.prepare_to_wait();
            if !buf_rc.lock().locked() {
                return;
            }
            queue.wait(token);
        }
    }

    pub(crate) fn yield_now(&self) {
        self.system.yield_now();
    }

    fn sync_buf(&self) -> JournalResult {
        if self.system.get_buffer_provider().lock().sync() {
            Ok(())
        } else {
            Err(JournalError::IoError)
        }
    }
}

fn start_handle(journal: &Arc<Journal>, handle: &mut Handle) -> JournalResult {
    let nblocks = handle.buffer_credits;

    if nblocks > journal.max_transaction_buffers {
        log::error!(
            "Transaction requires too many credits ({} > {}).",
            nblocks,
            journal.max_transaction_buffers
        );
        return Err(JournalError::NotEnoughSpace);
    }

    log::debug!("New handle going live.");
    let mut reclaimed = false;
    loop {
        let mut states = journal.states.lock();
        if states.flags.contains(JournalFlag::ABORT)
            || (states.errno != 0 && !states.flags.contains(JournalFlag::ACK_ERR))
        {
            log::error!("Journal has aborted.");
            return Err(JournalError::Aborted);
        }

        if states.running_transaction.is_none() {
            let tx = Transaction::new(Arc::downgrade(journal));
            let tx = Arc::new(Mutex::new(tx));
            set_transaction(&mut states, &journal.system, &tx);
        }

        let Some(tx_rc) = states.running_transaction.clone() else {
            continue;
        };
        let tx = tx_rc.lock();

        if tx.state == TransactionState::Locked {
            let token = journal.wait_transaction_locked.prepare_to_wait();
            drop(tx);
            drop(states);
            journal.wait_transaction_locked.wait(token);
            continue;
        }

        let mut info = tx.handle_info.lock();
        let needed = info.outstanding_credits + nblocks;

        if needed > journal.max_transaction_buffers {
            // Too full to take us; wait until it has committed and
            // retry on its successor.
            log::debug!(
                "Handle must wait: transaction already holds {} reserved credits.",
                info.outstanding_credits
            );
            let token = journal.wait_transaction_locked.prepare_to_wait();
            drop(info);
            drop(tx);
            drop(states);
            journal.wait_transaction_locked.wait(token);
            continue;
        }

        if Journal::log_space_left(&states) < needed {
            drop(info);
            drop(tx);
            drop(states);
            if reclaimed {
                log::error!("Log space exhausted even after checkpointing.");
                return Err(JournalError::NotEnoughSpace);
            }
            reclaimed = true;
            journal.checkpoint()?;
            continue;
        }

        handle.transaction = Some(tx_rc.clone());
        info.outstanding_credits += nblocks;
        info.updates += 1;
        info.handle_count += 1;

        log::debug!("Handle joined transaction {} with {} credits.", tx.tid, nblocks);
        return Ok(());
    }
}

/// Install a new running transaction. Called with the state lock held.
fn set_transaction(states: &mut JournalStates, system: &Arc<dyn System>, tx_rc: &Arc<Mutex<Transaction>>) {
    jrnl_assert!(states.running_transaction.is_none());
    {
        let mut tx = tx_rc.lock();
        tx.start_time = system.get_time();
        tx.tid = states.transaction_sequence;
    }
    states.transaction_sequence = states.transaction_sequence.wrapping_add(1);
    states.running_transaction = Some(tx_rc.clone());
}

/// Accumulates buffers and submits their writes in bursts, so IO on
/// the log device stays clustered.
pub(crate) struct WriteBatch {
    bufs: Vec<Arc<Mutex<dyn Buffer>>>,
    capacity: usize,
}

impl WriteBatch {
    pub fn new(capacity: usize) -> Self {
        WriteBatch {
            bufs: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, buf: Arc<Mutex<dyn Buffer>>) {
        self.bufs.push(buf);
    }

    pub fn is_full(&self) -> bool {
        self.bufs.len() >= self.capacity
    }

    /// Submit asynchronous writes for every batched buffer that is
    /// still dirty.
    pub fn submit(&mut self) {
        for buf_rc in self.bufs.drain(..) {
            let mut buf = buf_rc.lock();
            if buf.test_clear_dirty() {
                buf.set_uptodate();
                buf.submit_write();
            }
        }
    }
}
