//! The system abstraction layer.
//!
//! The journal owns no buffer cache and spawns no threads of its own.
//! Everything it needs from the host, block IO, cached buffers, wait
//! queues and the per-task handle slot, comes in through the traits
//! defined here.

use core::any::Any;
extern crate alloc;
use alloc::boxed::Box;
use alloc::sync::Arc;
use spin::Mutex;

use crate::tx::Handle;

pub trait BlockDevice: Send + Sync + Any {
    /// Read data from block to buffer
    fn read_block(&self, block_id: usize, buf: &mut [u8]);
    /// Write data from buffer to block
    fn write_block(&self, block_id: usize, buf: &[u8]);
    /// Block size of the device
    fn block_size(&self) -> usize;
}

/// Outcome of a synchronous write, as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// The write reached the device.
    Done,
    /// The device cannot honour the requested write mode. Only
    /// returned for barrier writes; the data has not been written.
    Unsupported,
    /// The write failed.
    Failed,
}

/// A cached block buffer owned by the host.
///
/// The journal stores its per-block bookkeeping behind [`set_private`]
/// and distinguishes two dirty bits: `dirty` means the host may write
/// the buffer back at any time, `journal_dirty` means the buffer must
/// not reach its home location until the owning transaction commits.
///
/// `data` must point to at least `size` bytes aligned to 8 bytes, and
/// stay valid for the lifetime of the buffer.
///
/// [`set_private`]: Buffer::set_private
pub trait Buffer: Send + Sync + Any {
    fn device(&self) -> Arc<dyn BlockDevice>;
    fn block_id(&self) -> usize;
    fn size(&self) -> usize;
    fn data(&self) -> *mut u8;

    fn private(&self) -> &Option<Box<dyn Any + Send + Sync>>;
    fn set_private(&mut self, private: Option<Box<dyn Any + Send + Sync>>);

    /// Whether the journal is tracking this buffer.
    fn journaled(&self) -> bool;
    fn set_journaled(&mut self, journaled: bool);

    fn dirty(&self) -> bool;
    fn mark_dirty(&mut self);
    fn clear_dirty(&mut self);
    fn test_clear_dirty(&mut self) -> bool;

    fn journal_dirty(&self) -> bool;
    fn mark_journal_dirty(&mut self);
    fn clear_journal_dirty(&mut self);
    fn test_clear_journal_dirty(&mut self) -> bool;

    fn uptodate(&self) -> bool;
    fn set_uptodate(&mut self);
    fn clear_uptodate(&mut self);

    /// Whether a write submitted through [`submit_write`] is still in
    /// flight.
    ///
    /// [`submit_write`]: Buffer::submit_write
    fn locked(&self) -> bool;

    fn revoked(&self) -> bool;
    fn set_revoked(&mut self);
    fn clear_revoked(&mut self);
    fn test_set_revoked(&mut self) -> bool;
    fn test_clear_revoked(&mut self) -> bool;

    fn revoke_valid(&self) -> bool;
    fn test_set_revoke_valid(&mut self) -> bool;

    /// Queue an asynchronous write of the current contents. Completion
    /// clears `locked` and wakes the buffer's wait queue; a failed
    /// write additionally clears `uptodate`.
    fn submit_write(&mut self);

    /// Write the current contents to the device before returning,
    /// clearing `dirty` on success. With `barrier` set the host must
    /// also order the write against all previously submitted ones, or
    /// report [`IoOutcome::Unsupported`] without writing.
    fn sync_write(&mut self, barrier: bool) -> IoOutcome;

    /// The wait queue woken on IO completion for this buffer.
    fn wait_queue(&self) -> Arc<dyn WaitQueue>;

    fn buf(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.data(), self.size()) }
    }

    fn buf_mut(&mut self) -> &mut [u8] {
        self.mark_dirty();
        unsafe { core::slice::from_raw_parts_mut(self.data(), self.size()) }
    }
}

pub trait BufferProvider: Send + Sync + Any {
    /// Get the cached buffer for a block, loading it from the device
    /// on a cache miss. Returns `None` when the cache is exhausted.
    fn get_buffer(&mut self, dev: Arc<dyn BlockDevice>, block_id: usize) -> Option<Arc<Mutex<dyn Buffer>>>;
    /// Write back all dirty buffers.
    fn sync(&mut self) -> bool;
}

/// A wait queue with a token protocol that closes the window between
/// deciding to sleep and going to sleep.
///
/// A waiter takes a token with [`prepare_to_wait`], re-checks its
/// condition, then calls [`wait`]. `wait` returns once any notify has
/// happened after the token was taken, even if the notify landed
/// before `wait` was entered. Spurious returns are allowed.
///
/// [`prepare_to_wait`]: WaitQueue::prepare_to_wait
/// [`wait`]: WaitQueue::wait
pub trait WaitQueue: Send + Sync + Any {
    fn prepare_to_wait(&self) -> u64;
    fn wait(&self, token: u64);
    fn notify_one(&self);
    fn notify_all(&self);
}

pub trait System: Send + Sync + Any {
    fn get_buffer_provider(&self) -> Arc<Mutex<dyn BufferProvider>>;
    /// The journal handle attached to the current task, if any.
    fn get_current_handle(&self) -> Option<Arc<Mutex<Handle>>>;
    fn set_current_handle(&self, handle: Option<Arc<Mutex<Handle>>>);
    fn new_wait_queue(&self) -> Arc<dyn WaitQueue>;
    /// Give other tasks a chance to run. Called in busy-retry loops.
    fn yield_now(&self);
    fn get_time(&self) -> usize;
}
