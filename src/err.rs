#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalError {
    // Buffer
    InsufficientCache,
    // Journal
    InvalidJournalSize,
    InvalidSuperblock,
    NotEnoughSpace,
    Aborted,
    // Misc
    IoError,
}

pub type JournalResult<T = ()> = Result<T, JournalError>;
