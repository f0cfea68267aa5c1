//! Block device interface consumed by the snapshot engine.
//!
//! The engine needs exactly four things from a device: single-block reads
//! and writes, a durability barrier, and cheap block zeroing (the journal
//! retires its log by zeroing the head record). Errors are classified so
//! the volume's error policy can tell media failures, which force the
//! filesystem read-only, apart from caller mistakes, which do not.

use std::io;
use thiserror::Error;

/// Block size in bytes (4KB). Equal to the page size; the snapshot core
/// relies on this equality and never splits a block across pages.
pub const BLOCK_SIZE: usize = 4096;

/// Error type for block device operations.
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    /// The underlying read or write failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The request addressed a block past the end of the device.
    #[error("block {block} beyond device end ({device_blocks} blocks)")]
    OutOfRange {
        /// Requested block number.
        block: u64,
        /// Total blocks on the device.
        device_blocks: u64,
    },
    /// The caller's buffer is not exactly one block.
    #[error("buffer of {0} bytes is not one block (expected {BLOCK_SIZE})")]
    Misaligned(usize),
    /// Write attempted on a read-only device.
    #[error("device is read-only")]
    ReadOnly,
    /// The device handle was closed underneath us.
    #[error("device is closed")]
    Closed,
}

impl BlockDeviceError {
    /// Whether the failure points at bad media or a lost device. A volume
    /// seeing one of these goes read-only and demands fsck; the other
    /// variants are caller mistakes and stay local to the operation.
    pub fn is_media_error(&self) -> bool {
        match self {
            Self::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            Self::Closed => true,
            Self::OutOfRange { .. } | Self::Misaligned(_) | Self::ReadOnly => false,
        }
    }
}

/// Result type for block device operations.
pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// The device surface the snapshot volume sits on.
#[async_trait::async_trait]
pub trait BlockDevice: Send + Sync + 'static {
    /// Read one block into `buf` (exactly `BLOCK_SIZE` bytes).
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()>;

    /// Write one block from `data` (exactly `BLOCK_SIZE` bytes).
    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()>;

    /// Write a zeroed block. Journal log retirement and mkfs use this;
    /// devices with a discard primitive can do better than the default.
    async fn zero_block(&self, block_num: u64) -> Result<()> {
        let zero = [0u8; BLOCK_SIZE];
        self.write_block(block_num, &zero).await
    }

    /// Total number of blocks on the device.
    fn block_count(&self) -> u64;

    /// Block size in bytes.
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    /// Durability barrier: everything written before this call survives a
    /// crash after it returns.
    async fn sync(&self) -> Result<()>;

    /// Whether the device rejects writes.
    fn is_read_only(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_error_classification() {
        assert!(BlockDeviceError::Io(io::Error::new(io::ErrorKind::Other, "bad sector"))
            .is_media_error());
        assert!(BlockDeviceError::Closed.is_media_error());
        assert!(!BlockDeviceError::OutOfRange {
            block: 99,
            device_blocks: 10
        }
        .is_media_error());
        assert!(!BlockDeviceError::Misaligned(17).is_media_error());
        assert!(!BlockDeviceError::ReadOnly.is_media_error());
        assert!(
            !BlockDeviceError::Io(io::Error::new(io::ErrorKind::Interrupted, "signal"))
                .is_media_error()
        );
    }
}
