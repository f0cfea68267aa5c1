//! Block device I/O for the snapshot volume.

mod blockdev_trait;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

// Re-export the block device trait and related types
pub use self::blockdev_trait::{BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};

/// A block device backed by a regular file (or a raw block device node).
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    file: Mutex<Option<File>>,
    path: PathBuf,
    size: u64,
    block_count: u64,
    read_only: bool,
}

impl FileBackedBlockDevice {
    /// Create a new file-backed block device of the given byte size.
    pub async fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        file.set_len(size).await?;

        let block_count = size / BLOCK_SIZE as u64;

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            size,
            block_count,
            read_only: false,
        })
    }

    /// Size of a backing file or raw block device.
    fn backing_size(path: &Path) -> Result<u64> {
        let metadata = std::fs::metadata(path)?;

        #[cfg(unix)]
        {
            use std::fs::File as StdFile;
            use std::os::unix::fs::FileTypeExt;
            use std::os::unix::io::AsRawFd;

            if metadata.file_type().is_block_device() {
                let file = StdFile::open(path)?;
                let fd = file.as_raw_fd();

                // BLKGETSIZE64
                const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

                let mut size: u64 = 0;
                let result = unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut size as *mut u64) };
                if result == -1 {
                    return Err(BlockDeviceError::Io(std::io::Error::last_os_error()));
                }
                return Ok(size);
            }
        }

        Ok(metadata.len())
    }

    /// Open an existing device.
    pub async fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .await?;

        let size = Self::backing_size(&path)?;
        let block_count = size / BLOCK_SIZE as u64;

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            size,
            block_count,
            read_only,
        })
    }

    /// Get the total size of the device in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BlockDevice for FileBackedBlockDevice {
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        if block_num >= self.block_count {
            return Err(BlockDeviceError::OutOfRange {
                block: block_num,
                device_blocks: self.block_count,
            });
        }

        if buf.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::Misaligned(buf.len()));
        }

        let offset = block_num * BLOCK_SIZE as u64;
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(buf).await?;
            Ok(())
        } else {
            Err(BlockDeviceError::Closed)
        }
    }

    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }

        if block_num >= self.block_count {
            return Err(BlockDeviceError::OutOfRange {
                block: block_num,
                device_blocks: self.block_count,
            });
        }

        if data.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::Misaligned(data.len()));
        }

        let offset = block_num * BLOCK_SIZE as u64;
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
            Ok(())
        } else {
            Err(BlockDeviceError::Closed)
        }
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    async fn sync(&self) -> Result<()> {
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            file.sync_all().await?;
            Ok(())
        } else {
            Err(BlockDeviceError::Closed)
        }
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_block_device_operations() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_device.bin");

        let device = FileBackedBlockDevice::create(&file_path, 4096 * 8)
            .await
            .unwrap();

        let test_data = [0xAAu8; 4096];
        device.write_block(0, &test_data).await.unwrap();

        let mut read_buf = [0u8; 4096];
        device.read_block(0, &mut read_buf).await.unwrap();
        assert_eq!(test_data, read_buf);

        for i in 1..8 {
            let data = [i as u8; 4096];
            device.write_block(i, &data).await.unwrap();

            let mut read_data = [0u8; 4096];
            device.read_block(i, &mut read_data).await.unwrap();
            assert_eq!(data, read_data);
        }
    }

    #[tokio::test]
    async fn test_read_only() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_read_only.bin");

        let device = FileBackedBlockDevice::create(&file_path, 4096)
            .await
            .unwrap();

        let test_data = [0x55u8; 4096];
        device.write_block(0, &test_data).await.unwrap();

        let read_only_device = FileBackedBlockDevice::open(&file_path, true).await.unwrap();

        let mut read_buf = [0u8; 4096];
        read_only_device.read_block(0, &mut read_buf).await.unwrap();
        assert_eq!(test_data, read_buf);

        let write_result = read_only_device.write_block(0, &[0u8; 4096]).await;
        assert!(matches!(write_result, Err(BlockDeviceError::ReadOnly)));
    }
}
