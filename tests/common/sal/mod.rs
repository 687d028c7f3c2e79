use std::collections::HashMap;
use std::sync::{Condvar, Mutex as StdMutex};
use std::thread::{self, ThreadId};
use std::time::{SystemTime, UNIX_EPOCH};
use std::{io, sync::Arc};

use jrnl_rs::{
    sal::{BlockDevice, BufferProvider, System, WaitQueue},
    Handle,
};
use spin::Mutex;

use self::cache::{BlockCacheManager, IoHarness};
use self::dev::FileDevice;

pub mod cache;
pub mod dev;

pub struct UserSystem {
    device: Arc<dyn BlockDevice>,
    cache_manager: Arc<Mutex<BlockCacheManager>>,
    harness: Arc<IoHarness>,
    handles: Mutex<HashMap<ThreadId, Arc<Mutex<Handle>>>>,
}

impl UserSystem {
    pub fn new(path: &str, nblocks: usize) -> Result<Self, io::Error> {
        let harness = Arc::new(IoHarness::new());
        let device = FileDevice::new(path, nblocks)?;
        let cache_manager = Arc::new(Mutex::new(BlockCacheManager::new(harness.clone())));
        Ok(Self {
            device: Arc::new(device),
            cache_manager,
            harness,
            handles: Mutex::new(HashMap::new()),
        })
    }

    pub fn block_device(&self) -> Arc<dyn BlockDevice> {
        self.device.clone()
    }

    pub fn harness(&self) -> Arc<IoHarness> {
        self.harness.clone()
    }
}

impl System for UserSystem {
    fn get_buffer_provider(&self) -> Arc<Mutex<dyn BufferProvider>> {
        self.cache_manager.clone()
    }
    fn get_current_handle(&self) -> Option<Arc<Mutex<Handle>>> {
        self.handles.lock().get(&thread::current().id()).cloned()
    }
    fn set_current_handle(&self, handle: Option<Arc<Mutex<Handle>>>) {
        let mut handles = self.handles.lock();
        match handle {
            Some(handle) => {
                handles.insert(thread::current().id(), handle);
            }
            None => {
                handles.remove(&thread::current().id());
            }
        }
    }
    fn new_wait_queue(&self) -> Arc<dyn WaitQueue> {
        Arc::new(CondvarQueue::new())
    }
    fn yield_now(&self) {
        thread::yield_now();
    }
    fn get_time(&self) -> usize {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as usize)
            .unwrap_or(0)
    }
}

/// A generation-counting wait queue. `prepare_to_wait` snapshots the
/// generation; `wait` sleeps only while no notify has bumped it past
/// the snapshot, so a notify between the two calls is never lost.
pub struct CondvarQueue {
    generation: StdMutex<u64>,
    condvar: Condvar,
}

impl CondvarQueue {
    pub fn new() -> Self {
        Self {
            generation: StdMutex::new(0),
            condvar: Condvar::new(),
        }
    }
}

impl WaitQueue for CondvarQueue {
    fn prepare_to_wait(&self) -> u64 {
        *self.generation.lock().unwrap()
    }
    fn wait(&self, token: u64) {
        let mut generation = self.generation.lock().unwrap();
        while *generation <= token {
            generation = self.condvar.wait(generation).unwrap();
        }
    }
    fn notify_one(&self) {
        *self.generation.lock().unwrap() += 1;
        self.condvar.notify_one();
    }
    fn notify_all(&self) {
        *self.generation.lock().unwrap() += 1;
        self.condvar.notify_all();
    }
}
