//! SnapFS core - a writable-snapshot copy-on-write layer for a journaled,
//! block-based filesystem.
//!
//! An administrator freezes the live volume at an instant in time,
//! producing a read-only point-in-time image that stays mountable while
//! the volume keeps accepting writes. Snapshots chain chronologically;
//! the copy-on-write engine preserves every block the newest (active)
//! snapshot still needs before the host filesystem overwrites or frees it,
//! and the read router stitches older images together across the chain
//! down to the live device.

#![warn(rust_2018_idioms)]

// Core modules
pub mod blockdev;
pub mod buffer;
pub mod error;
pub mod format;
pub mod layout;
pub mod volume;

mod alloc;
mod inode;

// Feature modules
pub mod modules;

// Re-export block device types
pub use blockdev::{BlockDevice, BlockDeviceError, FileBackedBlockDevice, BLOCK_SIZE};

// Re-export the error types
pub use error::{Error, Result};

// Re-export the central handles
pub use inode::{AllocIntent, InodeHandle, MapInsert};
pub use layout::{snapshot_iblock, snapshot_pblk, Layout, Lblk, Pblk};
pub use volume::{Volume, VolumeConfig};

/// Re-export common types and traits
pub mod prelude {
    pub use crate::blockdev::{BlockDevice, BlockDeviceError, FileBackedBlockDevice, BLOCK_SIZE};
    pub use crate::buffer::{Buffer, BufferCache};
    pub use crate::error::{Error, Result};
    pub use crate::format::{iflags, MkfsParams, Superblock};
    pub use crate::inode::InodeHandle;
    pub use crate::layout::{snapshot_iblock, Layout, Lblk, Pblk};
    pub use crate::modules::journaling::{JournalConfig, JournalManager, Transaction};
    pub use crate::modules::snapshot::{control, lifecycle, read};
    pub use crate::volume::{Volume, VolumeConfig};
}
