//! Compile-time parameters of the journal.

/// Magic number identifying journal control blocks on disk.
pub const JOURNAL_MAGIC: u32 = 0xa31c56e8;

/// Smallest journal region we are willing to drive.
pub const MIN_JOURNAL_BLOCKS: u32 = 1024;

/// Log blocks held back from handles so that the commit machinery
/// always has room for descriptors, revoke blocks and the commit block.
pub const MIN_LOG_RESERVED_BLOCKS: u32 = 32;

/// Upper bound on the number of blocks submitted in one write batch.
pub const WRITE_BATCH_BLOCKS: usize = 64;
