//! On-disk structures for the journal.
//!
//! All multi-byte fields are stored in big-endian byte order. The
//! [`Superblock`] keeps the raw big-endian words in its fields and is
//! accessed in place; the smaller records are encoded and decoded
//! through explicit byte codecs so they can live at arbitrary offsets
//! inside a block.

use bitflags::bitflags;

use crate::config::JOURNAL_MAGIC;
use crate::err::{JournalError, JournalResult};

/// Size in bytes of an encoded [`Header`].
pub const HEADER_SIZE: usize = 12;
/// Size in bytes of an encoded [`BlockTag`].
pub const TAG_SIZE: usize = 8;
/// Size in bytes of the UUID payload following the first tag of a descriptor.
pub const UUID_SIZE: usize = 16;
/// Size in bytes of an encoded [`RevokeBlockHeader`].
pub const REVOKE_HEADER_SIZE: usize = 16;
/// Size in bytes of one revoke entry, a (block, sequence) pair.
pub const REVOKE_ENTRY_SIZE: usize = 8;

/// Control block types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    DescriptorBlock = 1,
    CommitBlock = 2,
    SuperblockV1 = 3,
    SuperblockV2 = 4,
    RevokeBlock = 5,
}

impl Into<u32> for BlockType {
    fn into(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for BlockType {
    type Error = JournalError;
    fn try_from(value: u32) -> JournalResult<Self> {
        match value {
            1 => Ok(BlockType::DescriptorBlock),
            2 => Ok(BlockType::CommitBlock),
            3 => Ok(BlockType::SuperblockV1),
            4 => Ok(BlockType::SuperblockV2),
            5 => Ok(BlockType::RevokeBlock),
            _ => Err(JournalError::InvalidSuperblock),
        }
    }
}

bitflags! {
    #[derive(Default)]
    #[repr(C)]
    pub struct TagFlag: u32 {
        const ESCAPE = 1;
        const SAME_UUID = 1 << 1;
        const DELETED = 1 << 2;
        const LAST_TAG = 1 << 3;
    }
}

/// Standard header for all control blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Header {
    pub magic: u32,
    pub block_type: u32,
    pub sequence: u32,
}

impl Header {
    pub fn new(block_type: BlockType, sequence: u32) -> Self {
        Header {
            magic: JOURNAL_MAGIC,
            block_type: block_type.into(),
            sequence,
        }
    }

    pub fn encode_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..8].copy_from_slice(&self.block_type.to_be_bytes());
        out[8..12].copy_from_slice(&self.sequence.to_be_bytes());
    }

    pub fn decode(raw: &[u8]) -> Self {
        Header {
            magic: u32::from_be_bytes(raw[0..4].try_into().unwrap()),
            block_type: u32::from_be_bytes(raw[4..8].try_into().unwrap()),
            sequence: u32::from_be_bytes(raw[8..12].try_into().unwrap()),
        }
    }

    pub fn has_magic(&self) -> bool {
        self.magic == JOURNAL_MAGIC
    }
}

/// Describes a single logged buffer inside a descriptor block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BlockTag {
    /// The on-disk block number the logged copy belongs to.
    pub block_nr: u32,
    pub flag: TagFlag,
}

impl BlockTag {
    pub fn encode_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.block_nr.to_be_bytes());
        out[4..8].copy_from_slice(&self.flag.bits().to_be_bytes());
    }

    pub fn decode(raw: &[u8]) -> Self {
        BlockTag {
            block_nr: u32::from_be_bytes(raw[0..4].try_into().unwrap()),
            flag: TagFlag::from_bits_truncate(u32::from_be_bytes(raw[4..8].try_into().unwrap())),
        }
    }
}

/// Leading record of a revoke block. `count` is the number of bytes
/// used in the block, header included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct RevokeBlockHeader {
    pub header: Header,
    pub count: u32,
}

impl RevokeBlockHeader {
    pub fn encode_into(&self, out: &mut [u8]) {
        self.header.encode_into(out);
        out[12..16].copy_from_slice(&self.count.to_be_bytes());
    }

    pub fn decode(raw: &[u8]) -> Self {
        RevokeBlockHeader {
            header: Header::decode(raw),
            count: u32::from_be_bytes(raw[12..16].try_into().unwrap()),
        }
    }
}

/// One entry in a revoke block: the revoked block number and the
/// sequence number of the transaction that revoked it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct RevokeEntry {
    pub block_nr: u32,
    pub sequence: u32,
}

impl RevokeEntry {
    pub fn encode_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.block_nr.to_be_bytes());
        out[4..8].copy_from_slice(&self.sequence.to_be_bytes());
    }

    pub fn decode(raw: &[u8]) -> Self {
        RevokeEntry {
            block_nr: u32::from_be_bytes(raw[0..4].try_into().unwrap()),
            sequence: u32::from_be_bytes(raw[4..8].try_into().unwrap()),
        }
    }
}

/// Whether a data block must be escaped before it is written to the
/// log. A block whose first word collides with the journal magic would
/// otherwise be mistaken for a control block on replay.
pub fn needs_escape(data: &[u8]) -> bool {
    data[0..4] == JOURNAL_MAGIC.to_be_bytes()
}

/// The journal superblock. All fields are in big-endian byte order.
#[repr(C)]
pub struct Superblock {
    pub header: Header,

    /* Static information describing the journal */
    /// Journal device blocksize
    pub block_size: u32,
    /// Total blocks in journal file
    pub maxlen: u32,
    /// First block of log information
    pub first: u32,

    /* Dynamic information describing the current state of the log */
    /// First commit ID expected in log
    pub sequence: u32,
    /// Block_nr of start of log
    pub start: u32,

    /* Error value, as set by abort(). */
    pub errno: u32,

    /* Remaining fields are only valid in a version-2 superblock */
    /// Compatible feature set
    pub feature_compat: u32,
    /// Incompatible feature set
    pub feature_incompat: u32,
    /// Readonly-compatible feature set
    pub feature_ro_compat: u32,
    /// UUID of journal superblock
    pub uuid: [u8; 16],
    /// Number of filesystems sharing log
    pub nr_users: u32,
    /// Blocknr of dynamic superblock copy
    pub dyn_super: u32,
    /// Limit of journal blocks per trans
    pub max_transaction: u32,
    /// Limit of data blocks per trans
    pub max_trans_data: u32,
    pub padding: [u32; 44],
    /// Ids of all fs'es sharing the log
    pub users: [u8; 16 * 48],
}
