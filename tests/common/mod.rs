pub mod mock;
pub mod sal;

use std::sync::Arc;

use jrnl_rs::{err::JournalResult, Handle, Journal};
use sal::UserSystem;
use spin::Mutex;

/// Journal length in blocks; the data area occupies the blocks below
/// the journal offset.
pub const JOURNAL_SIZE: usize = 1024;
pub const JOURNAL_BLK_OFFSET: usize = 2048;
const NBLOCKS: usize = JOURNAL_BLK_OFFSET + JOURNAL_SIZE;

pub fn create_system(name: &str) -> Arc<UserSystem> {
    let _ = env_logger::builder().is_test(true).try_init();
    std::fs::create_dir_all("target/test-images").unwrap();
    let path = format!("target/test-images/{}.img", name);
    let _ = std::fs::remove_file(&path);
    Arc::new(UserSystem::new(&path, NBLOCKS).unwrap())
}

pub fn create_journal(name: &str) -> JournalResult<(Arc<UserSystem>, Arc<Journal>)> {
    let system = create_system(name);
    let dev = system.block_device();
    let mut journal = Journal::init_dev(
        system.clone(),
        dev.clone(),
        dev,
        JOURNAL_BLK_OFFSET as u32,
        JOURNAL_SIZE as u32,
    )?;
    journal.create()?;
    Ok((system, Arc::new(journal)))
}

pub fn create_handle(journal: &Arc<Journal>, nblocks: u32) -> JournalResult<Arc<Mutex<Handle>>> {
    Journal::start(journal, nblocks)
}

/// Unwrap the journal from its shared pointer and tear it down. Panics
/// if a transaction or handle still holds a reference.
pub fn destroy_journal(journal: Arc<Journal>) -> JournalResult {
    let mut journal = match Arc::try_unwrap(journal) {
        Ok(journal) => journal,
        Err(_) => panic!("journal still referenced"),
    };
    journal.destroy()
}
