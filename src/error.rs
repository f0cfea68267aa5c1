//! Error types for the snapshot core.
//!
//! The variants map onto the error categories of the copy-on-write engine:
//! I/O failures propagate, policy violations surface as `NotPermitted`,
//! probe-only COW checks report `NeedsCow`, and on-disk corruption is
//! distinguished so the volume can flip itself read-only.

use thiserror::Error;

use crate::blockdev::BlockDeviceError;
use crate::modules::journaling::JournalError;

/// Crate-level error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Block device failure.
    #[error("I/O error: {0}")]
    Device(#[from] BlockDeviceError),

    /// Generic I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Journal failure.
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    /// The volume has no free blocks left for the request.
    #[error("no space left on volume")]
    NoSpace,

    /// The operation is forbidden in the current snapshot state.
    #[error("operation not permitted: {0}")]
    NotPermitted(&'static str),

    /// The request itself is malformed or targets an unsuitable inode.
    #[error("invalid operation: {0}")]
    Invalid(String),

    /// Probe result: the block is in use by the active snapshot and must be
    /// copied out before it may be overwritten or freed.
    #[error("block needs copy-on-write")]
    NeedsCow,

    /// A block belonging to a snapshot file turned up preserved in the COW
    /// bitmap; the exclude bitmap is missing bits.
    #[error("exclude bitmap inconsistent: block {block} in group {group}")]
    ExcludeInconsistent {
        /// Block group of the offending block.
        group: u32,
        /// Physical block number.
        block: u32,
    },

    /// The volume is mounted (or has been forced) read-only.
    #[error("volume is read-only")]
    ReadOnly,

    /// The snapshot inode is no longer linked on the snapshot chain.
    #[error("stale snapshot inode {0}")]
    Stale(u32),

    /// On-disk state does not make sense; the volume needs fsck.
    #[error("filesystem corrupt: {0}")]
    Corrupt(String),

    /// The superblock or another on-disk structure failed to parse.
    #[error("bad on-disk format: {0}")]
    Format(String),
}

/// Crate-level result type.
pub type Result<T> = std::result::Result<T, Error>;
