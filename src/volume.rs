//! The mounted volume: device, buffers, groups, journal, snapshot chain.
//!
//! Every piece of global mutable state lives in this per-mount context and
//! is threaded through the engine by reference. The write/free funnels at
//! the bottom are the host-filesystem entry points; they are what routes
//! every mutation through the journal access hooks, which is where the
//! snapshot engine earns its preservation guarantee.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::buffer::BufferCache;
use crate::error::{Error, Result};
use crate::format::{features, state, GroupDesc, Inode, Superblock, MODE_REG};
use crate::inode::{AllocIntent, InodeHandle, MapInsert};
use crate::layout::{Layout, Lblk, Pblk, GROUP_DESC_SIZE};
use crate::modules::journaling::{
    access, JournalConfig, JournalManager, Transaction, DEFAULT_TXN_CREDITS,
};
use crate::modules::snapshot::{lifecycle, SnapshotChain};

/// Construction-time configuration of a mounted volume.
///
/// The optional capabilities are composable: a volume built without
/// move-on-write falls back to copying data blocks, with identical
/// preservation semantics.
#[derive(Debug, Clone)]
pub struct VolumeConfig {
    /// Buffer cache capacity in blocks.
    pub cache_blocks: usize,
    /// Transfer data-block ownership to the snapshot instead of copying.
    pub move_on_write: bool,
    /// Write snapshot copies through to the device immediately.
    pub sync_cow: bool,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            cache_blocks: 1024,
            move_on_write: true,
            sync_cow: false,
        }
    }
}

/// Per-group in-memory state.
pub struct GroupInfo {
    /// Group descriptor; the lock doubles as the per-group spinlock that
    /// protects the COW-bitmap slot handshake.
    desc: Mutex<GroupDesc>,
    /// Three-state COW-bitmap rendezvous slot: `0`, the group's
    /// block-bitmap block (in progress), or the committed bitmap block.
    /// Cache only; reset at every take and recomputed on mount.
    cow_slot: Mutex<u32>,
}

impl GroupInfo {
    fn new(desc: GroupDesc) -> Self {
        Self {
            desc: Mutex::new(desc),
            cow_slot: Mutex::new(0),
        }
    }

    /// Copy of the group descriptor.
    pub fn desc(&self) -> GroupDesc {
        *self.desc.lock()
    }

    /// Mutate the group descriptor.
    pub fn update_desc<R>(&self, f: impl FnOnce(&mut GroupDesc) -> R) -> R {
        f(&mut self.desc.lock())
    }

    /// The COW-bitmap rendezvous slot.
    pub fn cow_slot(&self) -> &Mutex<u32> {
        &self.cow_slot
    }
}

/// A mounted volume.
pub struct Volume {
    device: Arc<dyn BlockDevice>,
    buffers: Arc<BufferCache>,
    journal: JournalManager,
    layout: Layout,
    sb: RwLock<Superblock>,
    groups: Vec<GroupInfo>,
    inodes: Mutex<HashMap<u32, Arc<InodeHandle>>>,
    snapshots: SnapshotChain,
    read_only: AtomicBool,
    config: VolumeConfig,
}

impl Volume {
    /// Mount a formatted volume with the default configuration.
    pub async fn mount(device: Arc<dyn BlockDevice>, read_only: bool) -> Result<Arc<Volume>> {
        Self::mount_with(device, read_only, VolumeConfig::default()).await
    }

    /// Mount a formatted volume.
    pub async fn mount_with(
        device: Arc<dyn BlockDevice>,
        read_only: bool,
        config: VolumeConfig,
    ) -> Result<Arc<Volume>> {
        // Bootstrap parse: geometry and journal location never change, so
        // the pre-recovery superblock is good enough to find the journal.
        let mut raw = vec![0u8; BLOCK_SIZE];
        device.read_block(0, &mut raw).await?;
        let sb0 = Superblock::read_from(&mut Cursor::new(&raw[..]))?;
        let layout = sb0.layout();

        let buffers = Arc::new(BufferCache::new(device.clone(), config.cache_blocks));

        let journal_area = Self::resolve_journal_area(&device, &layout, &sb0).await?;
        let journal = JournalManager::new(device.clone(), buffers.clone(), journal_area);
        if !read_only && sb0.features_compat & features::COMPAT_HAS_JOURNAL != 0 {
            journal.recover().await?;
        }

        // Authoritative state, post-replay.
        let sb = {
            let buf = buffers.read(0).await?;
            let data = buf.data();
            Superblock::read_from(&mut Cursor::new(&data[..]))?
        };

        let mut groups = Vec::with_capacity(layout.group_count as usize);
        for g in 0..layout.group_count {
            let byte = g as usize * GROUP_DESC_SIZE;
            let gdt_blk = 1 + (byte / BLOCK_SIZE) as u32;
            let off = byte % BLOCK_SIZE;
            let buf = buffers.read(gdt_blk).await?;
            let desc = {
                let data = buf.data();
                GroupDesc::read_from(&mut Cursor::new(&data[off..off + GROUP_DESC_SIZE]))?
            };
            groups.push(GroupInfo::new(desc));
        }

        let vol = Arc::new(Volume {
            device,
            buffers,
            journal,
            layout,
            sb: RwLock::new(sb),
            groups,
            inodes: Mutex::new(HashMap::new()),
            snapshots: SnapshotChain::new(),
            read_only: AtomicBool::new(read_only),
            config,
        });

        if !read_only {
            vol.update_superblock(|sb| {
                sb.state = (sb.state | state::RECOVER) & !state::CLEAN;
            });
            vol.write_superblock().await?;
        }

        lifecycle::load(&vol, read_only).await?;

        log::info!(
            "mounted volume: {} blocks, {} groups, {} snapshot(s), active {}",
            vol.layout.block_count,
            vol.layout.group_count,
            vol.snapshots.len(),
            vol.superblock().active_snapshot_ino
        );
        Ok(vol)
    }

    async fn resolve_journal_area(
        device: &Arc<dyn BlockDevice>,
        layout: &Layout,
        sb: &Superblock,
    ) -> Result<JournalConfig> {
        if sb.journal_ino == 0 || sb.journal_blocks == 0 {
            return Err(Error::Format("volume has no journal".into()));
        }
        let (group, idx) = layout.inode_location(sb.journal_ino);
        let byte = group as usize * GROUP_DESC_SIZE;
        let mut raw = vec![0u8; BLOCK_SIZE];
        device.read_block(1 + (byte / BLOCK_SIZE) as u64, &mut raw).await?;
        let off = byte % BLOCK_SIZE;
        let desc = GroupDesc::read_from(&mut Cursor::new(&raw[off..off + GROUP_DESC_SIZE]))?;
        let (slot_blk, slot_off) = layout.inode_slot(desc.inode_table, idx);
        device.read_block(slot_blk as u64, &mut raw).await?;
        let inode = Inode::read_from(&mut Cursor::new(
            &raw[slot_off..slot_off + crate::layout::INODE_SIZE],
        ))?;
        if inode.block[0] == 0 {
            return Err(Error::Format("journal inode has no blocks".into()));
        }
        // The journal area is contiguous by construction; the inode's
        // first pointer locates it.
        Ok(JournalConfig {
            area_start: inode.block[0],
            area_blocks: sb.journal_blocks,
        })
    }

    /// Unmount: tear the snapshot state down and write everything back.
    pub async fn unmount(&self) -> Result<()> {
        lifecycle::destroy(self).await?;
        if !self.is_read_only() {
            self.write_group_descriptors().await?;
            self.buffers.sync_all().await?;
            self.journal.checkpoint().await?;
            self.update_superblock(|sb| sb.state = state::CLEAN);
            self.write_superblock().await?;
        }
        self.device.sync().await?;
        log::info!("volume unmounted");
        Ok(())
    }

    /// Underlying device.
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Buffer cache.
    pub fn buffers(&self) -> &BufferCache {
        &self.buffers
    }

    /// Journal manager.
    pub fn journal(&self) -> &JournalManager {
        &self.journal
    }

    /// Volume geometry.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Per-group state.
    pub fn group(&self, group: u32) -> &GroupInfo {
        &self.groups[group as usize]
    }

    /// The snapshot chain.
    pub fn snapshots(&self) -> &SnapshotChain {
        &self.snapshots
    }

    /// Construction-time configuration.
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub(crate) fn inode_cache(&self) -> &Mutex<HashMap<u32, Arc<InodeHandle>>> {
        &self.inodes
    }

    /// Copy of the superblock.
    pub fn superblock(&self) -> Superblock {
        self.sb.read().clone()
    }

    /// Mutate the in-memory superblock.
    pub fn update_superblock<R>(&self, f: impl FnOnce(&mut Superblock) -> R) -> R {
        f(&mut self.sb.write())
    }

    /// Write the superblock to disk (direct, via the buffer for coherence).
    pub async fn write_superblock(&self) -> Result<()> {
        let image = self.sb.read().to_block();
        let buf = self.buffers.getblk(0);
        buf.fill(&image);
        self.buffers.write_back(&buf).await?;
        Ok(())
    }

    /// Write all group descriptors to disk.
    pub async fn write_group_descriptors(&self) -> Result<()> {
        for g in 0..self.layout.group_count {
            let byte = g as usize * GROUP_DESC_SIZE;
            let gdt_blk = 1 + (byte / BLOCK_SIZE) as u32;
            let off = byte % BLOCK_SIZE;
            let buf = self.buffers.read(gdt_blk).await?;
            {
                let desc = self.group(g).desc();
                let mut data = buf.data_mut();
                let mut c = Cursor::new(&mut data[off..off + GROUP_DESC_SIZE]);
                desc.write_to(&mut c)?;
            }
            buf.mark_dirty();
            self.buffers.write_back(&buf).await?;
        }
        Ok(())
    }

    /// Whether the volume is (or was forced) read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Force the volume read-only (error policy).
    pub fn set_read_only(&self, ro: bool) {
        self.read_only.store(ro, Ordering::Release);
    }

    /// The active snapshot, if any. Read lock-free relative to the
    /// lifecycle mutex; the pointer only changes under the journal's update
    /// barrier.
    pub fn active_snapshot(&self) -> Option<Arc<InodeHandle>> {
        self.snapshots.active()
    }

    /// Raise a filesystem error: the volume needs fsck and goes read-only.
    pub async fn fs_error(&self, msg: &str) {
        log::error!("filesystem error: {}", msg);
        self.set_read_only(true);
        let _ = self.write_superblock().await;
    }

    /// Error policy for the write funnels: a media-level device failure
    /// flips the volume read-only before the error propagates; caller
    /// mistakes (range, alignment) stay local to the operation.
    async fn escalate(&self, err: Error) -> Error {
        if let Error::Device(e) = &err {
            if e.is_media_error() {
                self.fs_error(&format!("device failure: {}", e)).await;
            }
        }
        err
    }

    /// Exclude-bitmap inconsistency: record the FIX_EXCLUDE feature so fsck
    /// rebuilds the exclude inode, then go read-only.
    pub async fn exclude_inconsistency(&self, group: u32, block: Pblk) {
        self.update_superblock(|sb| {
            sb.features_ro_compat |= features::RO_FIX_EXCLUDE;
        });
        self.fs_error(&format!(
            "exclude bitmap inconsistent: snapshot-owned block {} of group {} marked in use",
            block, group
        ))
        .await;
    }

    /// Begin a journaled transaction.
    pub async fn begin_txn(&self) -> Result<Transaction> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        Ok(self.journal.begin(DEFAULT_TXN_CREDITS).await)
    }

    /// Commit a transaction.
    pub async fn commit_txn(&self, txn: Transaction) -> Result<()> {
        self.journal.commit(txn).await?;
        Ok(())
    }

    /// Abort a transaction, rolling its buffers back.
    pub fn abort_txn(&self, txn: Transaction) {
        self.journal.abort(txn);
    }

    // ------------------------------------------------------------------
    // Host filesystem funnels. Every mutation of volume state passes
    // through a journal access hook before it touches a buffer.
    // ------------------------------------------------------------------

    /// Overwrite a physical block as metadata (journaled, COW protected).
    pub async fn overwrite_block(
        &self,
        inode: Option<&Arc<InodeHandle>>,
        blk: Pblk,
        data: &[u8],
    ) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(Error::Invalid(format!(
                "block write of {} bytes",
                data.len()
            )));
        }
        let txn = self.begin_txn().await?;
        let result = async {
            let buf = self.buffers.read(blk).await?;
            access::get_write_access(self, &txn, inode, &buf).await?;
            buf.data_mut().copy_from_slice(data);
            self.journal.dirty_metadata(&txn, &buf);
            Ok(())
        }
        .await;
        match result {
            Ok(()) => self.commit_txn(txn).await,
            Err(e) => {
                self.abort_txn(txn);
                Err(self.escalate(e).await)
            }
        }
    }

    /// Create a plain regular file inode.
    pub async fn create_file_inode(&self) -> Result<Arc<InodeHandle>> {
        let txn = self.begin_txn().await?;
        let result = async {
            let ino = self.alloc_inode(&txn).await?;
            let mut inode = Inode::empty();
            inode.mode = MODE_REG;
            inode.links = 1;
            let h = Arc::new(InodeHandle::new(ino, inode));
            self.inodes.lock().insert(ino, h.clone());
            self.flush_inode(&txn, &h).await?;
            Ok(h)
        }
        .await;
        match result {
            Ok(h) => {
                self.commit_txn(txn).await?;
                Ok(h)
            }
            Err(e) => {
                self.abort_txn(txn);
                Err(e)
            }
        }
    }

    /// Write one logical block of a regular file. Overwrites trigger the
    /// move (or copy) hook so the pre-image stays with the snapshot.
    pub async fn file_write_block(
        &self,
        h: &Arc<InodeHandle>,
        lblk: Lblk,
        data: &[u8],
    ) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(Error::Invalid(format!(
                "block write of {} bytes",
                data.len()
            )));
        }
        if h.is_snapfile() {
            return Err(Error::NotPermitted("snapshot files are read-only"));
        }

        let txn = self.begin_txn().await?;
        let result = async {
            let (target, fresh) = match self.map_block(h, lblk).await? {
                Some(p) => {
                    let moved = access::get_move_access(self, &txn, h, p, true).await?;
                    if moved > 0 {
                        // The old block now belongs to the snapshot; give
                        // the file a fresh one for the new contents.
                        self.map_clear(&txn, h, lblk).await?;
                        let blk = match self
                            .map_insert(&txn, h, lblk, AllocIntent::Alloc { goal: p })
                            .await?
                        {
                            MapInsert::New(p) | MapInsert::Existing(p) => p,
                        };
                        (blk, true)
                    } else {
                        (p, false)
                    }
                }
                None => {
                    let blk = match self
                        .map_insert(&txn, h, lblk, AllocIntent::Alloc { goal: 0 })
                        .await?
                    {
                        MapInsert::New(p) | MapInsert::Existing(p) => p,
                    };
                    (blk, true)
                }
            };

            let buf = self.buffers.getblk(target);
            if fresh {
                // Fresh blocks go through the create hook: one that still
                // needed a copy would mean a free raced past the engine.
                access::get_create_access(self, &txn, &buf).await?;
            }
            buf.fill(data);
            self.journal.dirty_data(&txn, &buf);

            let new_size = (lblk as u64 + 1) * BLOCK_SIZE as u64;
            h.update(|i| {
                if i.size < new_size {
                    i.size = new_size;
                }
                if i.disksize < new_size {
                    i.disksize = new_size;
                }
            });
            self.flush_inode(&txn, h).await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => self.commit_txn(txn).await,
            Err(e) => {
                self.abort_txn(txn);
                Err(self.escalate(e).await)
            }
        }
    }

    /// Read one logical block of a regular file (zeros when unmapped).
    pub async fn file_read_block(
        &self,
        h: &Arc<InodeHandle>,
        lblk: Lblk,
    ) -> Result<Box<[u8; BLOCK_SIZE]>> {
        match self.map_block(h, lblk).await? {
            Some(p) => {
                let buf = self.buffers.read(p).await?;
                Ok(buf.copy_out())
            }
            None => Ok(Box::new([0u8; BLOCK_SIZE])),
        }
    }

    /// Free one logical block of a regular file. A block the snapshot still
    /// preserves is re-parented instead of freed.
    pub async fn file_free_block(&self, h: &Arc<InodeHandle>, lblk: Lblk) -> Result<()> {
        if h.is_snapfile() {
            return Err(Error::NotPermitted("snapshot files are read-only"));
        }
        let txn = self.begin_txn().await?;
        let result = async {
            if let Some(p) = self.map_block(h, lblk).await? {
                let moved = access::get_delete_access(self, &txn, h, p, 1).await?;
                self.map_clear(&txn, h, lblk).await?;
                if moved == 0 {
                    self.free_blocks_raw(&txn, p, 1).await?;
                    h.update(|i| i.blocks = i.blocks.saturating_sub(1));
                    self.flush_inode(&txn, h).await?;
                }
            }
            Ok(())
        }
        .await;
        match result {
            Ok(()) => self.commit_txn(txn).await,
            Err(e) => {
                self.abort_txn(txn);
                Err(self.escalate(e).await)
            }
        }
    }
}
