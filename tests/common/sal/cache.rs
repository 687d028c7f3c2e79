use jrnl_rs::sal::{BlockDevice, Buffer, BufferProvider, IoOutcome, WaitQueue};
use spin::Mutex;
use std::{
    alloc::{self, Layout},
    any::Any,
    collections::{HashSet, VecDeque},
    slice,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};

use super::CondvarQueue;

const BLOCK_CACHE_SIZE: usize = 4096;

/// Knobs and records for the backing device: every completed write
/// lands in `writes` in completion order, writes to listed blocks
/// fail, writes to stalled blocks are parked in flight until
/// [`complete_stalled`] releases them, and barrier support can be
/// switched off.
///
/// [`complete_stalled`]: IoHarness::complete_stalled
pub struct IoHarness {
    writes: Mutex<Vec<usize>>,
    fail_blocks: Mutex<HashSet<usize>>,
    stall_blocks: Mutex<HashSet<usize>>,
    stalled: Mutex<Vec<StalledWrite>>,
    barriers_supported: AtomicBool,
}

/// An async write held in flight by the harness. The buffer reports
/// `locked` until the write is released.
struct StalledWrite {
    device: Arc<dyn BlockDevice>,
    block_id: usize,
    data: Vec<u8>,
    queue: Arc<CondvarQueue>,
}

impl IoHarness {
    pub fn new() -> Self {
        Self {
            writes: Mutex::new(Vec::new()),
            fail_blocks: Mutex::new(HashSet::new()),
            stall_blocks: Mutex::new(HashSet::new()),
            stalled: Mutex::new(Vec::new()),
            barriers_supported: AtomicBool::new(true),
        }
    }

    pub fn written_order(&self) -> Vec<usize> {
        self.writes.lock().clone()
    }

    pub fn reset_writes(&self) {
        self.writes.lock().clear();
    }

    pub fn fail_block(&self, block_id: usize) {
        self.fail_blocks.lock().insert(block_id);
    }

    /// Park the next async write to `block_id` instead of completing
    /// it. One-shot: later writes to the same block run normally.
    pub fn stall_block(&self, block_id: usize) {
        self.stall_blocks.lock().insert(block_id);
    }

    pub fn stalled_count(&self) -> usize {
        self.stalled.lock().len()
    }

    /// Complete every parked write: the data reaches the device and
    /// waiters on each buffer are woken.
    pub fn complete_stalled(&self) {
        let parked = std::mem::take(&mut *self.stalled.lock());
        for write in parked {
            write.device.write_block(write.block_id, &write.data);
            self.record(write.block_id);
            write.queue.notify_all();
        }
    }

    pub fn set_barriers_supported(&self, supported: bool) {
        self.barriers_supported.store(supported, Ordering::SeqCst);
    }

    fn should_fail(&self, block_id: usize) -> bool {
        self.fail_blocks.lock().contains(&block_id)
    }

    fn take_stall(&self, block_id: usize) -> bool {
        self.stall_blocks.lock().remove(&block_id)
    }

    fn is_stalled(&self, block_id: usize) -> bool {
        self.stalled.lock().iter().any(|write| write.block_id == block_id)
    }

    fn park(&self, write: StalledWrite) {
        self.stalled.lock().push(write);
    }

    fn record(&self, block_id: usize) {
        self.writes.lock().push(block_id);
    }
}

struct BlockCache {
    device: Arc<dyn BlockDevice>,
    harness: Arc<IoHarness>,
    queue: Arc<CondvarQueue>,
    block_id: usize,
    size: usize,
    data: *mut u8,
    private: Option<Box<dyn Any + Send + Sync>>,
    journaled: bool,
    dirty: bool,
    journal_dirty: bool,
    uptodate: bool,
    revoked: bool,
    revoke_valid: bool,
}

unsafe impl Sync for BlockCache {}
unsafe impl Send for BlockCache {}

impl BlockCache {
    fn new(block_id: usize, size: usize, device: Arc<dyn BlockDevice>, harness: Arc<IoHarness>) -> Self {
        let data = unsafe { alloc::alloc(Layout::from_size_align(size, 8).unwrap()) };
        device.read_block(block_id, unsafe { slice::from_raw_parts_mut(data, size) });
        Self {
            device,
            harness,
            queue: Arc::new(CondvarQueue::new()),
            block_id,
            size,
            data,
            private: None,
            journaled: false,
            dirty: false,
            journal_dirty: false,
            uptodate: true,
            revoked: false,
            revoke_valid: false,
        }
    }

    fn write_now(&mut self) -> bool {
        if self.harness.should_fail(self.block_id) {
            return false;
        }
        self.device
            .write_block(self.block_id, unsafe { slice::from_raw_parts(self.data, self.size) });
        self.harness.record(self.block_id);
        true
    }
}

impl Buffer for BlockCache {
    fn device(&self) -> Arc<dyn BlockDevice> {
        self.device.clone()
    }

    fn block_id(&self) -> usize {
        self.block_id
    }

    fn size(&self) -> usize {
        self.size
    }

    fn data(&self) -> *mut u8 {
        self.data
    }

    fn private(&self) -> &Option<Box<dyn Any + Send + Sync>> {
        &self.private
    }

    fn set_private(&mut self, private: Option<Box<dyn Any + Send + Sync>>) {
        self.private = private;
    }

    fn journaled(&self) -> bool {
        self.journaled
    }

    fn set_journaled(&mut self, journaled: bool) {
        self.journaled = journaled;
    }

    fn dirty(&self) -> bool {
        self.dirty
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    fn test_clear_dirty(&mut self) -> bool {
        let ret = self.dirty;
        self.dirty = false;
        ret
    }

    fn journal_dirty(&self) -> bool {
        self.journal_dirty
    }

    fn mark_journal_dirty(&mut self) {
        self.journal_dirty = true;
    }

    fn clear_journal_dirty(&mut self) {
        self.journal_dirty = false;
    }

    fn test_clear_journal_dirty(&mut self) -> bool {
        let ret = self.journal_dirty;
        self.journal_dirty = false;
        ret
    }

    fn uptodate(&self) -> bool {
        self.uptodate
    }

    fn set_uptodate(&mut self) {
        self.uptodate = true;
    }

    fn clear_uptodate(&mut self) {
        self.uptodate = false;
    }

    // Writes normally complete before `submit_write` returns; a buffer
    // is only observed in flight while the harness holds its write
    // parked.
    fn locked(&self) -> bool {
        self.harness.is_stalled(self.block_id)
    }

    fn revoked(&self) -> bool {
        self.revoked
    }

    fn set_revoked(&mut self) {
        self.revoked = true;
    }

    fn clear_revoked(&mut self) {
        self.revoked = false;
    }

    fn test_set_revoked(&mut self) -> bool {
        let ret = self.revoked;
        self.revoked = true;
        ret
    }

    fn test_clear_revoked(&mut self) -> bool {
        let ret = self.revoked;
        self.revoked = false;
        ret
    }

    fn revoke_valid(&self) -> bool {
        self.revoke_valid
    }

    fn test_set_revoke_valid(&mut self) -> bool {
        let ret = self.revoke_valid;
        self.revoke_valid = true;
        ret
    }

    fn submit_write(&mut self) {
        if self.harness.take_stall(self.block_id) {
            let data = unsafe { slice::from_raw_parts(self.data, self.size) }.to_vec();
            self.harness.park(StalledWrite {
                device: self.device.clone(),
                block_id: self.block_id,
                data,
                queue: self.queue.clone(),
            });
            return;
        }
        if !self.write_now() {
            self.uptodate = false;
        }
        self.queue.notify_all();
    }

    fn sync_write(&mut self, barrier: bool) -> IoOutcome {
        if barrier && !self.harness.barriers_supported.load(Ordering::SeqCst) {
            return IoOutcome::Unsupported;
        }
        if !self.write_now() {
            self.uptodate = false;
            return IoOutcome::Failed;
        }
        self.dirty = false;
        IoOutcome::Done
    }

    fn wait_queue(&self) -> Arc<dyn WaitQueue> {
        self.queue.clone()
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        if self.dirty {
            self.write_now();
        }
        unsafe {
            alloc::dealloc(self.data, Layout::from_size_align(self.size, 8).unwrap());
        }
    }
}

pub struct BlockCacheManager {
    queue: VecDeque<(usize, Arc<Mutex<dyn Buffer>>)>,
    harness: Arc<IoHarness>,
}

impl BlockCacheManager {
    pub fn new(harness: Arc<IoHarness>) -> Self {
        Self {
            queue: VecDeque::new(),
            harness,
        }
    }
}

impl BufferProvider for BlockCacheManager {
    fn get_buffer(&mut self, dev: Arc<dyn BlockDevice>, block_id: usize) -> Option<Arc<Mutex<dyn Buffer>>> {
        if let Some(pair) = self.queue.iter().find(|pair| pair.0 == block_id) {
            Some(Arc::clone(&pair.1))
        } else {
            if self.queue.len() == BLOCK_CACHE_SIZE {
                // Evict the oldest buffer nothing else holds on to.
                if let Some((idx, _)) = self
                    .queue
                    .iter()
                    .enumerate()
                    .find(|(_, pair)| Arc::strong_count(&pair.1) == 1)
                {
                    self.queue.drain(idx..=idx);
                } else {
                    return None;
                }
            }
            let block_cache = BlockCache::new(block_id, dev.block_size(), Arc::clone(&dev), self.harness.clone());
            let block_cache: Arc<Mutex<dyn Buffer>> = Arc::new(Mutex::new(block_cache));
            self.queue.push_back((block_id, Arc::clone(&block_cache)));
            Some(block_cache)
        }
    }

    fn sync(&mut self) -> bool {
        for (_, buf) in self.queue.iter() {
            let mut buf = buf.lock();
            if buf.dirty() && buf.sync_write(false) != IoOutcome::Done {
                return false;
            }
        }
        true
    }
}
