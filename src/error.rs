use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Empty key, or key/value lengths that no header width can carry.
    KeyInvalid,
    /// The record arena would grow past its configured cap or past 4 GiB.
    ArenaCapped,
    /// Both candidate rows are full and the sheet store is at its cap.
    ShardFull,
    /// Increment on a key whose value is not a counter link.
    NotACounter,
    /// Walk cursor referencing a freed or out-of-range node or record.
    CursorInvalid,
    /// Spin bound exceeded while acquiring a lock.
    LockNotTaken,
    Initialization,
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {}
