//! Write-ahead journaling.
//!
//! All metadata mutations are logged before they are applied. A transaction
//! collects block images; commit writes the images plus a commit record to
//! the journal area, syncs, and only then writes the buffers back to their
//! home locations. Recovery replays every fully committed transaction found
//! in the log.
//!
//! Two extensions serve the snapshot layer:
//!
//! * every transaction carries an explicit *credit* budget. A credit pays
//!   for one logged block. The copy-on-write path consumes a bounded number
//!   of credits per copy (`COW_CREDITS`); callers that run low extend the
//!   budget, or restart the transaction and reacquire access.
//! * the journal keeps a frozen *committed copy* of every buffer a running
//!   transaction has modified, so the COW-bitmap materialization can read
//!   the pre-transaction state of the block bitmap.
//!
//! `lock_updates` is the freeze barrier snapshot take runs under: it waits
//! out every running transaction and blocks new ones.

pub mod access;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::blockdev::{BlockDevice, BlockDeviceError, BLOCK_SIZE};
use crate::buffer::{Buffer, BufferCache};
use crate::layout::Pblk;

/// Journal credits one copy-on-write may consume: the COW-bitmap block, the
/// copied block itself, up to three block-map spine blocks of the snapshot
/// file, the bitmap blocks touched by the allocation, the snapshot inode
/// and the exclude bitmap.
pub const COW_CREDITS: u32 = 8;

/// Credits charged for plain journaled access to one buffer.
pub const ACCESS_CREDITS: u32 = 1;

/// Default credit budget for a fresh transaction.
pub const DEFAULT_TXN_CREDITS: u32 = 64;

/// Journal error types
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Journal area exhausted")]
    JournalFull,
    #[error("Corrupt journal record at block {0}")]
    CorruptRecord(u64),
}

/// Result type for journal operations.
pub type Result<T> = std::result::Result<T, JournalError>;

/// Journal record types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RecordType {
    /// Start of a transaction
    TransactionStart = 1,
    /// Image of a metadata block
    MetadataImage = 2,
    /// Image of a data block journaled on behalf of a snapshot copy
    DataImage = 3,
    /// Commit marker; the transaction is durable
    Commit = 4,
}

/// Journal record header
#[derive(Debug, Clone)]
pub struct RecordHeader {
    /// Record type
    pub record_type: RecordType,
    /// Transaction ID
    pub transaction_id: u64,
    /// Home block the image belongs to (0 for markers)
    pub target_block: Pblk,
    /// Data length
    pub data_length: u32,
    /// Checksum of the record data
    pub checksum: u32,
}

impl RecordHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 32;

    /// Serialize the header to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u32::<LittleEndian>(self.record_type as u32)
            .unwrap();
        buf.write_u64::<LittleEndian>(self.transaction_id).unwrap();
        buf.write_u32::<LittleEndian>(self.target_block).unwrap();
        buf.write_u32::<LittleEndian>(self.data_length).unwrap();
        buf.write_u32::<LittleEndian>(self.checksum).unwrap();
        buf.resize(Self::SIZE, 0);
        buf
    }

    /// Deserialize the header from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(JournalError::CorruptRecord(0));
        }
        let mut cursor = Cursor::new(data);
        let raw = cursor.read_u32::<LittleEndian>()?;
        let record_type = match raw {
            1 => RecordType::TransactionStart,
            2 => RecordType::MetadataImage,
            3 => RecordType::DataImage,
            4 => RecordType::Commit,
            _ => return Err(JournalError::CorruptRecord(0)),
        };
        Ok(Self {
            record_type,
            transaction_id: cursor.read_u64::<LittleEndian>()?,
            target_block: cursor.read_u32::<LittleEndian>()?,
            data_length: cursor.read_u32::<LittleEndian>()?,
            checksum: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

/// Journal record containing header and data
#[derive(Debug, Clone)]
pub struct JournalRecord {
    /// Record header
    pub header: RecordHeader,
    /// Record data (a block image for image records)
    pub data: Vec<u8>,
}

impl JournalRecord {
    /// Create a new journal record
    pub fn new(
        record_type: RecordType,
        transaction_id: u64,
        target_block: Pblk,
        data: Vec<u8>,
    ) -> Self {
        let checksum = crc32fast::hash(&data);
        let header = RecordHeader {
            record_type,
            transaction_id,
            target_block,
            data_length: data.len() as u32,
            checksum,
        };
        Self { header, data }
    }

    /// Serialize the entire record to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = self.header.to_bytes();
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Verify the checksum of the record
    pub fn verify_checksum(&self) -> bool {
        crc32fast::hash(&self.data) == self.header.checksum
    }

    fn blocks(&self) -> u64 {
        ((RecordHeader::SIZE + self.data.len() + BLOCK_SIZE - 1) / BLOCK_SIZE) as u64
    }
}

/// A running transaction.
///
/// Holding a `Transaction` keeps the journal's update barrier open; the
/// snapshot take path waits for every handle to be dropped (committed or
/// aborted) before it freezes the volume.
pub struct Transaction {
    id: u64,
    credits: AtomicU32,
    cowing: AtomicBool,
    records: Mutex<Vec<JournalRecord>>,
    undo_blocks: Mutex<Vec<Pblk>>,
    dirty: Mutex<Vec<Arc<Buffer>>>,
    _updates: OwnedRwLockReadGuard<()>,
}

impl Transaction {
    /// Transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remaining credit budget.
    pub fn credits(&self) -> u32 {
        self.credits.load(Ordering::Acquire)
    }

    /// Whether this transaction is currently inside a copy-on-write.
    pub fn is_cowing(&self) -> bool {
        self.cowing.load(Ordering::Acquire)
    }

    /// Enter the copy-on-write section. Blocks allocated while the guard is
    /// alive are not themselves subject to COW (re-entrancy cut-off).
    pub fn enter_cow(&self) -> CowGuard<'_> {
        self.cowing.store(true, Ordering::Release);
        CowGuard { txn: self }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("credits", &self.credits())
            .field("cowing", &self.is_cowing())
            .finish()
    }
}

/// Clears the per-transaction `cowing` flag on drop.
pub struct CowGuard<'a> {
    txn: &'a Transaction,
}

impl Drop for CowGuard<'_> {
    fn drop(&mut self) {
        self.txn.cowing.store(false, Ordering::Release);
    }
}

/// Journal manager configuration
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// First block of the journal area.
    pub area_start: Pblk,
    /// Length of the journal area in blocks.
    pub area_blocks: u32,
}

/// Journal manager handling transactions and write-ahead logging.
pub struct JournalManager {
    device: Arc<dyn BlockDevice>,
    buffers: Arc<BufferCache>,
    config: JournalConfig,
    next_tid: AtomicU64,
    /// Next free block within the journal area; only touched while
    /// `log_lock` is held.
    write_pos: AtomicU64,
    log_lock: tokio::sync::Mutex<()>,
    updates: Arc<RwLock<()>>,
    committed: Mutex<HashMap<Pblk, (u64, Box<[u8; BLOCK_SIZE]>)>>,
}

impl JournalManager {
    /// Create a new journal manager over the given journal area.
    pub fn new(device: Arc<dyn BlockDevice>, buffers: Arc<BufferCache>, config: JournalConfig) -> Self {
        Self {
            device,
            buffers,
            config,
            next_tid: AtomicU64::new(1),
            write_pos: AtomicU64::new(0),
            log_lock: tokio::sync::Mutex::new(()),
            updates: Arc::new(RwLock::new(())),
            committed: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a new transaction with the given credit budget.
    pub async fn begin(&self, credits: u32) -> Transaction {
        let guard = self.updates.clone().read_owned().await;
        let id = self.next_tid.fetch_add(1, Ordering::SeqCst);
        log::debug!("journal: started transaction {} ({} credits)", id, credits);
        Transaction {
            id,
            credits: AtomicU32::new(credits),
            cowing: AtomicBool::new(false),
            records: Mutex::new(Vec::new()),
            undo_blocks: Mutex::new(Vec::new()),
            dirty: Mutex::new(Vec::new()),
            _updates: guard,
        }
    }

    /// Acquire the update barrier: waits for all running transactions and
    /// blocks new ones until the guard is dropped. Used by snapshot take
    /// and deactivation.
    pub async fn lock_updates(&self) -> OwnedRwLockWriteGuard<()> {
        self.updates.clone().write_owned().await
    }

    /// Charge `n` credits to a transaction, extending the budget when it
    /// runs low. Extension requests are always honored; a caller that wants
    /// bounded transactions uses `restart` instead.
    pub fn charge(&self, txn: &Transaction, n: u32) {
        let left = txn.credits.load(Ordering::Acquire);
        if left < n {
            let extend = (n - left) + DEFAULT_TXN_CREDITS;
            log::debug!(
                "journal: extending transaction {} by {} credits",
                txn.id,
                extend
            );
            txn.credits.fetch_add(extend, Ordering::AcqRel);
        }
        txn.credits.fetch_sub(n, Ordering::AcqRel);
    }

    /// Record the committed (pre-transaction) contents of a buffer the
    /// first time a transaction touches it.
    pub fn reserve_undo(&self, txn: &Transaction, buf: &Buffer) {
        let mut committed = self.committed.lock();
        if !committed.contains_key(&buf.block()) {
            committed.insert(buf.block(), (txn.id, buf.copy_out()));
            txn.undo_blocks.lock().push(buf.block());
        }
    }

    /// Pre-transaction contents of a block, if some running transaction has
    /// modified it. The snapshot must reflect committed state only.
    pub fn committed_copy(&self, blk: Pblk) -> Option<Box<[u8; BLOCK_SIZE]>> {
        self.committed.lock().get(&blk).map(|(_, data)| data.clone())
    }

    /// Queue a metadata buffer image into the transaction and mark the
    /// buffer dirty.
    pub fn dirty_metadata(&self, txn: &Transaction, buf: &Arc<Buffer>) {
        self.queue_image(txn, buf, RecordType::MetadataImage);
    }

    /// Queue a data buffer image (snapshot copy destination).
    pub fn dirty_data(&self, txn: &Transaction, buf: &Arc<Buffer>) {
        self.queue_image(txn, buf, RecordType::DataImage);
    }

    fn queue_image(&self, txn: &Transaction, buf: &Arc<Buffer>, kind: RecordType) {
        let image = buf.copy_out().to_vec();
        let record = JournalRecord::new(kind, txn.id, buf.block(), image);
        txn.records.lock().push(record);
        buf.mark_dirty();
        let mut dirty = txn.dirty.lock();
        if !dirty.iter().any(|b| b.block() == buf.block()) {
            dirty.push(buf.clone());
        }
    }

    /// Flush the queued records of a transaction and write the touched
    /// buffers back. Shared by `commit` and `restart`.
    async fn flush(&self, txn: &Transaction) -> Result<()> {
        // Only the newest image per block needs to hit the log.
        let records: Vec<JournalRecord> = {
            let mut records = txn.records.lock();
            let mut taken = Vec::new();
            std::mem::swap(&mut *records, &mut taken);
            let mut newest: HashMap<Pblk, usize> = HashMap::new();
            for (i, r) in taken.iter().enumerate() {
                newest.insert(r.header.target_block, i);
            }
            taken
                .into_iter()
                .enumerate()
                .filter(|(i, r)| newest[&r.header.target_block] == *i)
                .map(|(_, r)| r)
                .collect()
        };
        if records.is_empty() {
            return Ok(());
        }

        let start = JournalRecord::new(RecordType::TransactionStart, txn.id, 0, vec![]);
        let commit = JournalRecord::new(RecordType::Commit, txn.id, 0, vec![]);
        let needed: u64 = start.blocks()
            + commit.blocks()
            + records.iter().map(|r| r.blocks()).sum::<u64>();

        let _log = self.log_lock.lock().await;

        let mut pos = self.write_pos.load(Ordering::Acquire);
        if pos + needed > self.config.area_blocks as u64 {
            // Every committed transaction has already been written back, so
            // the old log contents are dead; wrap to the start.
            if needed > self.config.area_blocks as u64 {
                return Err(JournalError::JournalFull);
            }
            self.device.sync().await?;
            pos = 0;
        }

        for record in std::iter::once(&start)
            .chain(records.iter())
            .chain(std::iter::once(&commit))
        {
            pos = self.write_record(record, pos).await?;
        }
        // Terminate the log so a recovery scan never walks past this commit
        // into records left over from before a wrap.
        if pos < self.config.area_blocks as u64 {
            self.device
                .zero_block(self.config.area_start as u64 + pos)
                .await?;
        }
        self.device.sync().await?;
        self.write_pos.store(pos, Ordering::Release);

        // Log is durable; now update the home locations.
        let dirty: Vec<Arc<Buffer>> = {
            let mut d = txn.dirty.lock();
            let mut taken = Vec::new();
            std::mem::swap(&mut *d, &mut taken);
            taken
        };
        for buf in dirty {
            self.buffers.write_back(&buf).await?;
        }

        // The transaction's updates are committed; drop the frozen copies.
        {
            let mut committed = self.committed.lock();
            for blk in txn.undo_blocks.lock().drain(..) {
                if committed.get(&blk).map(|(tid, _)| *tid) == Some(txn.id) {
                    committed.remove(&blk);
                }
            }
        }

        log::debug!("journal: committed transaction {}", txn.id);
        Ok(())
    }

    async fn write_record(&self, record: &JournalRecord, pos: u64) -> Result<u64> {
        let bytes = record.to_bytes();
        let blocks = record.blocks();
        let mut padded = vec![0u8; blocks as usize * BLOCK_SIZE];
        padded[..bytes.len()].copy_from_slice(&bytes);
        for i in 0..blocks {
            let blk = self.config.area_start as u64 + pos + i;
            let off = i as usize * BLOCK_SIZE;
            self.device
                .write_block(blk, &padded[off..off + BLOCK_SIZE])
                .await?;
        }
        Ok(pos + blocks)
    }

    /// Commit a transaction: log, sync, write back.
    pub async fn commit(&self, txn: Transaction) -> Result<()> {
        self.flush(&txn).await
    }

    /// Retire the log: sync every home location, then mark the log empty.
    /// Callers quiesce the journal first (update barrier or unmount); the
    /// take path runs this before its journal-bypassing writes so a later
    /// replay cannot regress them.
    pub async fn checkpoint(&self) -> Result<()> {
        let _log = self.log_lock.lock().await;
        self.device.sync().await?;
        self.device.zero_block(self.config.area_start as u64).await?;
        self.device.sync().await?;
        self.write_pos.store(0, Ordering::Release);
        log::debug!("journal: checkpoint, log retired");
        Ok(())
    }

    /// Commit the work queued so far and hand the transaction a fresh
    /// credit budget. Callers must reacquire write access to any buffer
    /// they keep using.
    pub async fn restart(&self, txn: &Transaction) -> Result<()> {
        self.flush(txn).await?;
        txn.credits.store(DEFAULT_TXN_CREDITS, Ordering::Release);
        log::debug!("journal: restarted transaction {}", txn.id);
        Ok(())
    }

    /// Abort a transaction: roll every touched buffer back to its frozen
    /// committed contents and drop the queued records.
    pub fn abort(&self, txn: Transaction) {
        txn.records.lock().clear();
        let mut committed = self.committed.lock();
        for blk in txn.undo_blocks.lock().drain(..) {
            if let Some((tid, image)) = committed.get(&blk) {
                if *tid == txn.id {
                    let buf = self.buffers.getblk(blk);
                    buf.fill(&image[..]);
                    buf.clear_dirty();
                    committed.remove(&blk);
                }
            }
        }
        log::debug!("journal: aborted transaction {}", txn.id);
    }

    /// Scan the journal area and replay every fully committed transaction.
    /// Returns the number of transactions replayed.
    pub async fn recover(&self) -> Result<u32> {
        log::info!("journal: starting recovery scan");

        let mut pos: u64 = 0;
        let mut pending: HashMap<u64, Vec<(Pblk, Vec<u8>)>> = HashMap::new();
        let mut replayed = 0u32;

        while pos < self.config.area_blocks as u64 {
            let mut head = vec![0u8; BLOCK_SIZE];
            self.device
                .read_block(self.config.area_start as u64 + pos, &mut head)
                .await?;

            let header = match RecordHeader::from_bytes(&head) {
                Ok(h) => h,
                Err(_) => break, // end of log
            };

            let mut data = Vec::with_capacity(header.data_length as usize);
            let in_head = (BLOCK_SIZE - RecordHeader::SIZE).min(header.data_length as usize);
            data.extend_from_slice(&head[RecordHeader::SIZE..RecordHeader::SIZE + in_head]);
            let total_blocks =
                ((RecordHeader::SIZE + header.data_length as usize + BLOCK_SIZE - 1) / BLOCK_SIZE) as u64;
            for i in 1..total_blocks {
                let mut block = vec![0u8; BLOCK_SIZE];
                self.device
                    .read_block(self.config.area_start as u64 + pos + i, &mut block)
                    .await?;
                let want = header.data_length as usize - data.len();
                data.extend_from_slice(&block[..want.min(BLOCK_SIZE)]);
            }

            let record = JournalRecord {
                header,
                data,
            };
            if !record.verify_checksum() {
                log::warn!(
                    "journal: corrupt record checksum at block {}, stopping scan",
                    pos
                );
                break;
            }

            match record.header.record_type {
                RecordType::TransactionStart => {
                    pending.insert(record.header.transaction_id, Vec::new());
                }
                RecordType::MetadataImage | RecordType::DataImage => {
                    if let Some(images) = pending.get_mut(&record.header.transaction_id) {
                        images.push((record.header.target_block, record.data));
                    }
                }
                RecordType::Commit => {
                    if let Some(images) = pending.remove(&record.header.transaction_id) {
                        for (blk, image) in images {
                            let mut block = [0u8; BLOCK_SIZE];
                            block[..image.len().min(BLOCK_SIZE)]
                                .copy_from_slice(&image[..image.len().min(BLOCK_SIZE)]);
                            self.device.write_block(blk as u64, &block).await?;
                        }
                        replayed += 1;
                    }
                }
            }

            pos += total_blocks;
        }

        if replayed > 0 {
            self.device.sync().await?;
        }

        // Fresh log: uncommitted tails are discarded by the journal's
        // rollback semantics.
        self.device.zero_block(self.config.area_start as u64).await?;
        self.write_pos.store(0, Ordering::Release);

        log::info!("journal: recovery complete, {} transactions replayed", replayed);
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::FileBackedBlockDevice;
    use tempfile::tempdir;

    async fn setup(blocks: u64) -> (Arc<FileBackedBlockDevice>, Arc<BufferCache>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.img");
        let device = Arc::new(
            FileBackedBlockDevice::create(&path, blocks * BLOCK_SIZE as u64)
                .await
                .unwrap(),
        );
        let buffers = Arc::new(BufferCache::new(device.clone(), 64));
        (device, buffers, dir)
    }

    #[test]
    fn test_record_roundtrip() {
        let record = JournalRecord::new(RecordType::MetadataImage, 42, 17, vec![1, 2, 3, 4]);
        assert!(record.verify_checksum());
        let bytes = record.to_bytes();
        let header = RecordHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.transaction_id, 42);
        assert_eq!(header.target_block, 17);
        assert_eq!(header.data_length, 4);
    }

    #[tokio::test]
    async fn test_commit_writes_back() {
        let (device, buffers, _dir) = setup(64).await;
        let journal = JournalManager::new(
            device.clone(),
            buffers.clone(),
            JournalConfig {
                area_start: 32,
                area_blocks: 32,
            },
        );

        let txn = journal.begin(DEFAULT_TXN_CREDITS).await;
        let buf = buffers.read(5).await.unwrap();
        journal.reserve_undo(&txn, &buf);
        buf.data_mut().fill(0xC3);
        journal.dirty_metadata(&txn, &buf);
        journal.commit(txn).await.unwrap();

        let mut raw = [0u8; BLOCK_SIZE];
        device.read_block(5, &mut raw).await.unwrap();
        assert_eq!(raw, [0xC3; BLOCK_SIZE]);
        assert!(journal.committed_copy(5).is_none());
    }

    #[tokio::test]
    async fn test_committed_copy_visible_until_commit() {
        let (device, buffers, _dir) = setup(64).await;
        let journal = JournalManager::new(
            device,
            buffers.clone(),
            JournalConfig {
                area_start: 32,
                area_blocks: 32,
            },
        );

        let buf = buffers.read(3).await.unwrap();
        buf.data_mut().fill(0x11);
        buf.mark_uptodate();

        let txn = journal.begin(DEFAULT_TXN_CREDITS).await;
        journal.reserve_undo(&txn, &buf);
        buf.data_mut().fill(0x22);
        journal.dirty_metadata(&txn, &buf);

        let frozen = journal.committed_copy(3).expect("frozen image present");
        assert_eq!(frozen[0], 0x11);

        journal.commit(txn).await.unwrap();
        assert!(journal.committed_copy(3).is_none());
    }

    #[tokio::test]
    async fn test_abort_rolls_back() {
        let (_device, buffers, _dir) = setup(64).await;
        let journal = JournalManager::new(
            buffers.device().clone(),
            buffers.clone(),
            JournalConfig {
                area_start: 32,
                area_blocks: 32,
            },
        );

        let buf = buffers.read(7).await.unwrap();
        buf.data_mut().fill(0xAA);
        buf.mark_uptodate();

        let txn = journal.begin(DEFAULT_TXN_CREDITS).await;
        journal.reserve_undo(&txn, &buf);
        buf.data_mut().fill(0xBB);
        journal.dirty_metadata(&txn, &buf);
        journal.abort(txn);

        assert_eq!(buf.data()[0], 0xAA);
        assert!(!buf.is_dirty());
    }

    #[tokio::test]
    async fn test_recovery_replays_committed() {
        let (device, buffers, _dir) = setup(64).await;
        {
            let journal = JournalManager::new(
                device.clone(),
                buffers.clone(),
                JournalConfig {
                    area_start: 32,
                    area_blocks: 32,
                },
            );
            let txn = journal.begin(DEFAULT_TXN_CREDITS).await;
            let buf = buffers.read(9).await.unwrap();
            journal.reserve_undo(&txn, &buf);
            buf.data_mut().fill(0x77);
            journal.dirty_metadata(&txn, &buf);
            // Log only: simulate a crash after the log hit disk but before
            // write-back by flushing the record stream manually.
            journal.flush(&txn).await.unwrap();
        }

        // Clobber the home block to prove replay restores it.
        device.zero_block(9).await.unwrap();

        let buffers2 = Arc::new(BufferCache::new(device.clone(), 64));
        let journal2 = JournalManager::new(
            device.clone(),
            buffers2,
            JournalConfig {
                area_start: 32,
                area_blocks: 32,
            },
        );
        // flush() already wrote back above, so the log replay is what
        // restores the block here.
        let replayed = journal2.recover().await.unwrap();
        assert_eq!(replayed, 1);

        let mut raw = [0u8; BLOCK_SIZE];
        device.read_block(9, &mut raw).await.unwrap();
        assert_eq!(raw, [0x77; BLOCK_SIZE]);
    }

    #[tokio::test]
    async fn test_credit_extension() {
        let (_device, buffers, _dir) = setup(64).await;
        let journal = JournalManager::new(
            buffers.device().clone(),
            buffers.clone(),
            JournalConfig {
                area_start: 32,
                area_blocks: 32,
            },
        );
        let txn = journal.begin(4).await;
        journal.charge(&txn, COW_CREDITS);
        // The charge exceeded the budget; the journal extended it.
        assert!(txn.credits() >= DEFAULT_TXN_CREDITS - COW_CREDITS);
        journal.abort(txn);
    }

    #[tokio::test]
    async fn test_lock_updates_excludes_transactions() {
        let (_device, buffers, _dir) = setup(64).await;
        let journal = Arc::new(JournalManager::new(
            buffers.device().clone(),
            buffers.clone(),
            JournalConfig {
                area_start: 32,
                area_blocks: 32,
            },
        ));

        let txn = journal.begin(DEFAULT_TXN_CREDITS).await;

        let j = journal.clone();
        let freeze = tokio::spawn(async move {
            let _guard = j.lock_updates().await;
        });

        // The freeze cannot complete while the transaction is alive.
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        assert!(!freeze.is_finished());

        journal.abort(txn);
        freeze.await.unwrap();
    }
}
