use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use jrnl_rs::sal::BlockDevice;
use spin::Mutex;

pub const BLOCK_SIZE: usize = 1024;

pub struct FileDevice(Mutex<File>);

impl FileDevice {
    pub fn new(path: &str, nblocks: usize) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        file.set_len((nblocks * BLOCK_SIZE) as u64)?;
        Ok(Self(Mutex::new(file)))
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let mut file = self.0.lock();
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .expect("Error when seeking!");
        assert_eq!(file.read(buf).unwrap(), BLOCK_SIZE, "Not a complete block!");
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut file = self.0.lock();
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .expect("Error when seeking!");
        assert_eq!(file.write(buf).unwrap(), BLOCK_SIZE, "Not a complete block!");
    }
}
