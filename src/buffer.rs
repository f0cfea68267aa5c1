//! Block buffer cache.
//!
//! Buffers are the unit the copy-on-write engine works on: every physical
//! block the host filesystem mutates is represented by an `Arc<Buffer>`
//! that carries, besides the usual uptodate/dirty state, the snapshot
//! bookkeeping the engine needs: the per-transaction COW mark, the
//! pending-COW counter used by the copy rendezvous, and a tracked-reader
//! count that the copy path drains before it duplicates the contents.
//!
//! The cache is keyed by physical block number. Eviction only ever drops
//! buffers that are clean and unreferenced; a dropped buffer's stale COW
//! mark costs at most one redundant bitmap/map check on the next access.

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;

use crate::blockdev::{BlockDevice, BlockDeviceError, BLOCK_SIZE};
use crate::layout::Pblk;

/// A cached block with snapshot bookkeeping.
pub struct Buffer {
    blk: Pblk,
    data: RwLock<Box<[u8; BLOCK_SIZE]>>,
    state: Mutex<BufState>,
}

#[derive(Default)]
struct BufState {
    uptodate: bool,
    dirty: bool,
    /// Id of the transaction that last copied this block out. Equality with
    /// the running transaction means the block is already handled.
    cow_tid: u64,
    /// Number of tasks currently copying this block into the snapshot.
    pending_cow: u32,
    /// Outstanding tracked reads; the copy path waits for zero.
    tracked_readers: u32,
}

impl Buffer {
    fn new(blk: Pblk) -> Self {
        Self {
            blk,
            data: RwLock::new(Box::new([0u8; BLOCK_SIZE])),
            state: Mutex::new(BufState::default()),
        }
    }

    /// Physical block number this buffer caches.
    pub fn block(&self) -> Pblk {
        self.blk
    }

    /// Whether the buffer holds the on-disk contents.
    pub fn is_uptodate(&self) -> bool {
        self.state.lock().uptodate
    }

    /// Mark the buffer contents valid (caller fully wrote them).
    pub fn mark_uptodate(&self) {
        self.state.lock().uptodate = true;
    }

    /// Whether the buffer has modifications not yet written back.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Mark the buffer dirty.
    pub fn mark_dirty(&self) {
        let mut st = self.state.lock();
        st.dirty = true;
        st.uptodate = true;
    }

    pub(crate) fn clear_dirty(&self) {
        self.state.lock().dirty = false;
    }

    /// Transaction id that last copied this block out.
    pub fn cow_tid(&self) -> u64 {
        self.state.lock().cow_tid
    }

    /// Record that the given transaction handled this block.
    pub fn set_cow_tid(&self, tid: u64) {
        self.state.lock().cow_tid = tid;
    }

    /// Enter the copy rendezvous: bump the pending-COW counter.
    pub fn pending_cow_inc(&self) {
        self.state.lock().pending_cow += 1;
    }

    /// Leave the copy rendezvous.
    pub fn pending_cow_dec(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.pending_cow > 0);
        st.pending_cow = st.pending_cow.saturating_sub(1);
    }

    /// Number of copies of this block currently in flight.
    pub fn pending_cow(&self) -> u32 {
        self.state.lock().pending_cow
    }

    /// Begin a tracked read of this buffer.
    pub fn tracked_read_inc(&self) {
        self.state.lock().tracked_readers += 1;
    }

    /// End a tracked read.
    pub fn tracked_read_dec(&self) {
        let mut st = self.state.lock();
        st.tracked_readers = st.tracked_readers.saturating_sub(1);
    }

    /// Outstanding tracked reads.
    pub fn tracked_readers(&self) -> u32 {
        self.state.lock().tracked_readers
    }

    /// Shared access to the block contents. Do not hold across `.await`.
    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8; BLOCK_SIZE]>> {
        self.data.read()
    }

    /// Exclusive access to the block contents. Do not hold across `.await`.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8; BLOCK_SIZE]>> {
        self.data.write()
    }

    /// Copy the block contents out.
    pub fn copy_out(&self) -> Box<[u8; BLOCK_SIZE]> {
        Box::new(**self.data.read())
    }

    /// Replace the full block contents and mark the buffer uptodate.
    pub fn fill(&self, src: &[u8]) {
        debug_assert_eq!(src.len(), BLOCK_SIZE);
        self.data.write().copy_from_slice(src);
        self.mark_uptodate();
    }

    fn fill_if_stale(&self, src: &[u8]) {
        // Another task may have written the buffer while our device read was
        // in flight; its contents win over the stale disk image.
        let mut st = self.state.lock();
        if !st.uptodate {
            self.data.write().copy_from_slice(src);
            st.uptodate = true;
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Buffer")
            .field("blk", &self.blk)
            .field("uptodate", &st.uptodate)
            .field("dirty", &st.dirty)
            .field("cow_tid", &st.cow_tid)
            .field("pending_cow", &st.pending_cow)
            .finish()
    }
}

/// Result type for buffer cache operations.
pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// Buffer cache over a block device.
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    map: Mutex<HashMap<Pblk, Arc<Buffer>>>,
    capacity: usize,
}

impl BufferCache {
    /// Create a cache with the given capacity (in blocks).
    pub fn new(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        Self {
            device,
            map: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Get (or create) the buffer for a block without any I/O.
    pub fn getblk(&self, blk: Pblk) -> Arc<Buffer> {
        let mut map = self.map.lock();
        if let Some(buf) = map.get(&blk) {
            return buf.clone();
        }
        Self::evict_excess(&mut map, self.capacity);
        let buf = Arc::new(Buffer::new(blk));
        map.insert(blk, buf.clone());
        buf
    }

    /// Get the buffer for a block, reading it from the device if needed.
    pub async fn read(&self, blk: Pblk) -> Result<Arc<Buffer>> {
        let buf = self.getblk(blk);
        self.ensure_uptodate(&buf).await?;
        Ok(buf)
    }

    /// Read the buffer contents from the device unless already valid.
    pub async fn ensure_uptodate(&self, buf: &Buffer) -> Result<()> {
        if buf.is_uptodate() {
            return Ok(());
        }
        let mut block = [0u8; BLOCK_SIZE];
        self.device.read_block(buf.block() as u64, &mut block).await?;
        buf.fill_if_stale(&block);
        Ok(())
    }

    /// Write a buffer's contents back to its home location.
    pub async fn write_back(&self, buf: &Buffer) -> Result<()> {
        let data = buf.copy_out();
        self.device.write_block(buf.block() as u64, &data[..]).await?;
        buf.clear_dirty();
        Ok(())
    }

    /// Flush every dirty buffer and sync the device.
    pub async fn sync_all(&self) -> Result<()> {
        let dirty: Vec<Arc<Buffer>> = {
            let map = self.map.lock();
            map.values().filter(|b| b.is_dirty()).cloned().collect()
        };
        for buf in dirty {
            self.write_back(&buf).await?;
        }
        self.device.sync().await
    }

    /// Drop a cached buffer (page-cache invalidation).
    pub fn discard(&self, blk: Pblk) {
        self.map.lock().remove(&blk);
    }

    /// Underlying device.
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    fn evict_excess(map: &mut HashMap<Pblk, Arc<Buffer>>, capacity: usize) {
        if map.len() < capacity {
            return;
        }
        // Only clean buffers nobody else holds are droppable; COW marks and
        // pending-COW counters live on referenced buffers and survive.
        let victims: Vec<Pblk> = map
            .iter()
            .filter(|(_, b)| Arc::strong_count(b) == 1 && !b.is_dirty() && b.pending_cow() == 0)
            .map(|(blk, _)| *blk)
            .take(map.len() - capacity / 2)
            .collect();
        for blk in victims {
            map.remove(&blk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::FileBackedBlockDevice;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_read_write_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bufcache.img");
        let device = Arc::new(
            FileBackedBlockDevice::create(&path, 8 * BLOCK_SIZE as u64)
                .await
                .unwrap(),
        );

        let cache = BufferCache::new(device.clone(), 16);

        let buf = cache.read(3).await.unwrap();
        buf.data_mut().fill(0x5A);
        buf.mark_dirty();
        cache.write_back(&buf).await.unwrap();

        let mut raw = [0u8; BLOCK_SIZE];
        device.read_block(3, &mut raw).await.unwrap();
        assert_eq!(raw, [0x5A; BLOCK_SIZE]);
        assert!(!buf.is_dirty());
    }

    #[tokio::test]
    async fn test_cow_mark_and_pending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("marks.img");
        let device = Arc::new(
            FileBackedBlockDevice::create(&path, 4 * BLOCK_SIZE as u64)
                .await
                .unwrap(),
        );
        let cache = BufferCache::new(device, 16);

        let buf = cache.getblk(1);
        assert_eq!(buf.cow_tid(), 0);
        buf.set_cow_tid(7);
        assert_eq!(buf.cow_tid(), 7);

        buf.pending_cow_inc();
        buf.pending_cow_inc();
        assert_eq!(buf.pending_cow(), 2);
        buf.pending_cow_dec();
        buf.pending_cow_dec();
        assert_eq!(buf.pending_cow(), 0);

        // The same physical block maps to the same buffer object, so the
        // mark is visible to every holder.
        let again = cache.getblk(1);
        assert_eq!(again.cow_tid(), 7);
    }

    #[tokio::test]
    async fn test_eviction_keeps_dirty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("evict.img");
        let device = Arc::new(
            FileBackedBlockDevice::create(&path, 64 * BLOCK_SIZE as u64)
                .await
                .unwrap(),
        );
        let cache = BufferCache::new(device, 4);

        let dirty = cache.getblk(0);
        dirty.mark_dirty();
        drop(dirty);

        for blk in 1..32u32 {
            drop(cache.getblk(blk));
        }

        // The dirty buffer must still be present for sync_all to find.
        let map_len = cache.map.lock().len();
        assert!(map_len <= 32);
        assert!(cache.map.lock().contains_key(&0));
    }
}
