//! In-memory inode handles and block-map operations.
//!
//! The block map is the classic 12-direct / indirect / double-indirect
//! scheme with 32-bit pointers. Snapshot files use it with the sparse
//! layout where logical block `snapshot_iblock(p)` preserves physical
//! block `p`; every block the map allocates for a snapshot file is marked
//! in the exclude bitmap so it is never preserved recursively.
//!
//! Map mutations serialize on the handle's `truncate_mutex`; `map_insert`
//! acquires it internally, which is what gives concurrent COWers their
//! single winner.

use parking_lot::RwLock;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::blockdev::BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::format::{iflags, Inode, DIND_SLOT, IND_SLOT};
use crate::layout::{Lblk, Pblk, INODE_SIZE};
use crate::modules::journaling::{access, Transaction};
use crate::modules::snapshot::bitmap;
use crate::volume::Volume;

/// Pointers per map block.
const PTRS_PER_BLOCK: u32 = (BLOCK_SIZE / 4) as u32;
/// Number of direct pointers.
const DIRECT_BLOCKS: u32 = IND_SLOT as u32;

/// An inode pinned in memory.
pub struct InodeHandle {
    /// Inode number.
    pub ino: u32,
    disk: RwLock<Inode>,
    /// Serializes block-pointer mutations on this inode.
    pub truncate_mutex: tokio::sync::Mutex<()>,
    open_count: AtomicU32,
}

impl InodeHandle {
    /// Wrap an on-disk inode.
    pub fn new(ino: u32, inode: Inode) -> Self {
        Self {
            ino,
            disk: RwLock::new(inode),
            truncate_mutex: tokio::sync::Mutex::new(()),
            open_count: AtomicU32::new(0),
        }
    }

    /// Read access to the on-disk image.
    pub fn with<R>(&self, f: impl FnOnce(&Inode) -> R) -> R {
        f(&self.disk.read())
    }

    /// Mutate the on-disk image (in memory; call `Volume::flush_inode` to
    /// persist).
    pub fn update<R>(&self, f: impl FnOnce(&mut Inode) -> R) -> R {
        f(&mut self.disk.write())
    }

    /// Current flag bits.
    pub fn flags(&self) -> u32 {
        self.disk.read().flags
    }

    /// Whether a flag bit is set.
    pub fn has_flag(&self, bit: u32) -> bool {
        self.flags() & bit != 0
    }

    /// Set flag bits.
    pub fn set_flags(&self, bits: u32) {
        self.disk.write().flags |= bits;
    }

    /// Clear flag bits.
    pub fn clear_flags(&self, bits: u32) {
        self.disk.write().flags &= !bits;
    }

    /// Snapshot id (generation) of this inode.
    pub fn generation(&self) -> u32 {
        self.disk.read().generation
    }

    /// Whether the inode belongs to the snapshot subsystem.
    pub fn is_snapfile(&self) -> bool {
        self.has_flag(iflags::SNAPFILE)
    }

    /// Number of open file handles (drives the dynamic `OPEN` flag).
    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Acquire)
    }

    /// Register an open file handle.
    pub fn open(&self) {
        self.open_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Release a file handle.
    pub fn release(&self) {
        let prev = self.open_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }
}

impl std::fmt::Debug for InodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeHandle")
            .field("ino", &self.ino)
            .field("flags", &format_args!("{:#x}", self.flags()))
            .field("open_count", &self.open_count())
            .finish()
    }
}

/// How `map_insert` should obtain the physical block.
#[derive(Debug, Clone, Copy)]
pub enum AllocIntent {
    /// Allocate a fresh block near the given goal.
    Alloc {
        /// Allocation goal (physical block to stay close to).
        goal: Pblk,
    },
    /// Re-parent an existing block without copying data (move-on-write).
    Move(Pblk),
}

/// Outcome of `map_insert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapInsert {
    /// The mapping was created; the block is now owned by the inode.
    New(Pblk),
    /// A mapping already existed (a concurrent inserter won the race).
    Existing(Pblk),
}

/// Path through the block map to a logical block.
enum MapPath {
    Direct(usize),
    Indirect { idx: u32 },
    DoubleIndirect { idx1: u32, idx2: u32 },
}

fn map_path(lblk: Lblk) -> Result<MapPath> {
    if lblk < DIRECT_BLOCKS {
        return Ok(MapPath::Direct(lblk as usize));
    }
    let l = lblk - DIRECT_BLOCKS;
    if l < PTRS_PER_BLOCK {
        return Ok(MapPath::Indirect { idx: l });
    }
    let l = l - PTRS_PER_BLOCK;
    if l < PTRS_PER_BLOCK * PTRS_PER_BLOCK {
        return Ok(MapPath::DoubleIndirect {
            idx1: l / PTRS_PER_BLOCK,
            idx2: l % PTRS_PER_BLOCK,
        });
    }
    Err(Error::Invalid(format!(
        "logical block {} beyond double-indirect reach",
        lblk
    )))
}

fn read_ptr(data: &[u8], idx: u32) -> Pblk {
    let off = idx as usize * 4;
    LittleEndian::read_u32(&data[off..off + 4])
}

fn write_ptr(data: &mut [u8], idx: u32, val: Pblk) {
    let off = idx as usize * 4;
    LittleEndian::write_u32(&mut data[off..off + 4], val);
}

impl Volume {
    /// Look up an inode, loading it from the inode table on first use.
    pub async fn get_inode(&self, ino: u32) -> Result<Arc<InodeHandle>> {
        if let Some(h) = self.inode_cache().lock().get(&ino) {
            return Ok(h.clone());
        }
        let inode = self.read_inode_raw(ino).await?;
        let mut cache = self.inode_cache().lock();
        // A concurrent loader may have beaten us to it.
        if let Some(h) = cache.get(&ino) {
            return Ok(h.clone());
        }
        let h = Arc::new(InodeHandle::new(ino, inode));
        cache.insert(ino, h.clone());
        Ok(h)
    }

    /// Drop an inode from the in-memory cache.
    pub fn forget_inode(&self, ino: u32) {
        self.inode_cache().lock().remove(&ino);
    }

    /// Read an inode straight from the inode table.
    pub async fn read_inode_raw(&self, ino: u32) -> Result<Inode> {
        if ino < 1 || ino > self.layout().inode_count() {
            return Err(Error::Invalid(format!("inode {} out of range", ino)));
        }
        let (group, idx) = self.layout().inode_location(ino);
        let desc = self.group(group).desc();
        let (blk, off) = self.layout().inode_slot(desc.inode_table, idx);
        let buf = self.buffers().read(blk).await?;
        let inode = {
            let data = buf.data();
            Inode::read_from(&mut Cursor::new(&data[off..off + INODE_SIZE]))?
        };
        Ok(inode)
    }

    /// Write an inode's in-memory image into its inode-table slot through
    /// the journal.
    pub async fn flush_inode(&self, txn: &Transaction, h: &InodeHandle) -> Result<()> {
        let (group, idx) = self.layout().inode_location(h.ino);
        let desc = self.group(group).desc();
        let (blk, off) = self.layout().inode_slot(desc.inode_table, idx);
        let buf = self.buffers().read(blk).await?;
        access::get_write_access(self, txn, None, &buf).await?;
        {
            let image = h.with(|inode| {
                let mut bytes = [0u8; INODE_SIZE];
                inode
                    .write_to(&mut Cursor::new(&mut bytes[..]))
                    .expect("inode fits its slot");
                bytes
            });
            buf.data_mut()[off..off + INODE_SIZE].copy_from_slice(&image);
        }
        self.journal().dirty_metadata(txn, &buf);
        Ok(())
    }

    /// Resolve a logical block to its physical block, if mapped.
    pub async fn map_block(&self, h: &InodeHandle, lblk: Lblk) -> Result<Option<Pblk>> {
        match map_path(lblk)? {
            MapPath::Direct(slot) => {
                let p = h.with(|i| i.block[slot]);
                Ok((p != 0).then_some(p))
            }
            MapPath::Indirect { idx } => {
                let ind = h.with(|i| i.block[IND_SLOT]);
                if ind == 0 {
                    return Ok(None);
                }
                let buf = self.buffers().read(ind).await?;
                let p = read_ptr(&buf.data()[..], idx);
                Ok((p != 0).then_some(p))
            }
            MapPath::DoubleIndirect { idx1, idx2 } => {
                let dind = h.with(|i| i.block[DIND_SLOT]);
                if dind == 0 {
                    return Ok(None);
                }
                let buf = self.buffers().read(dind).await?;
                let ind = read_ptr(&buf.data()[..], idx1);
                if ind == 0 {
                    return Ok(None);
                }
                let buf = self.buffers().read(ind).await?;
                let p = read_ptr(&buf.data()[..], idx2);
                Ok((p != 0).then_some(p))
            }
        }
    }

    /// Allocate a fresh, zeroed map-spine block for `h`.
    async fn alloc_spine_block(
        &self,
        txn: &Transaction,
        h: &InodeHandle,
        goal: Pblk,
    ) -> Result<Pblk> {
        let blk = self.alloc_block(txn, goal).await?;
        let buf = self.buffers().getblk(blk);
        buf.data_mut().fill(0);
        buf.mark_uptodate();
        self.journal().dirty_metadata(txn, &buf);
        if h.is_snapfile() {
            bitmap::exclude_blocks(self, txn, blk, 1).await?;
        }
        h.update(|i| i.blocks += 1);
        Ok(blk)
    }

    /// Store a pointer inside a map block, journaled.
    async fn set_spine_ptr(
        &self,
        txn: &Transaction,
        spine: Pblk,
        idx: u32,
        val: Pblk,
    ) -> Result<()> {
        let buf = self.buffers().read(spine).await?;
        access::get_write_access(self, txn, None, &buf).await?;
        write_ptr(&mut buf.data_mut()[..], idx, val);
        self.journal().dirty_metadata(txn, &buf);
        Ok(())
    }

    /// Insert a mapping for `lblk`, allocating a block (or re-parenting an
    /// existing one for `AllocIntent::Move`). Returns `Existing` when a
    /// concurrent inserter got there first; exactly one caller ever sees
    /// `New` for a given (inode, lblk).
    pub async fn map_insert(
        &self,
        txn: &Transaction,
        h: &InodeHandle,
        lblk: Lblk,
        intent: AllocIntent,
    ) -> Result<MapInsert> {
        // The inode image is flushed after the map lock is released: the
        // inode-table write may itself trigger a COW into the snapshot this
        // map belongs to, and that COW takes the same lock.
        let inserted = {
            let _guard = h.truncate_mutex.lock().await;

            if let Some(p) = self.map_block(h, lblk).await? {
                return Ok(MapInsert::Existing(p));
            }

            let goal = match intent {
                AllocIntent::Alloc { goal } => goal,
                AllocIntent::Move(p) => p,
            };

            // Make sure the spine down to the pointer exists.
            let step = match map_path(lblk)? {
                MapPath::Direct(slot) => Err(slot),
                MapPath::Indirect { idx } => {
                    let mut ind = h.with(|i| i.block[IND_SLOT]);
                    if ind == 0 {
                        ind = self.alloc_spine_block(txn, h, goal).await?;
                        h.update(|i| i.block[IND_SLOT] = ind);
                    }
                    Ok((ind, idx))
                }
                MapPath::DoubleIndirect { idx1, idx2 } => {
                    let mut dind = h.with(|i| i.block[DIND_SLOT]);
                    if dind == 0 {
                        dind = self.alloc_spine_block(txn, h, goal).await?;
                        h.update(|i| i.block[DIND_SLOT] = dind);
                    }
                    let ind_cur = {
                        let dind_buf = self.buffers().read(dind).await?;
                        let p = read_ptr(&dind_buf.data()[..], idx1);
                        p
                    };
                    let ind = if ind_cur == 0 {
                        let ind = self.alloc_spine_block(txn, h, goal).await?;
                        self.set_spine_ptr(txn, dind, idx1, ind).await?;
                        ind
                    } else {
                        ind_cur
                    };
                    Ok((ind, idx2))
                }
            };

            let blk = self.map_obtain_block(txn, h, intent).await?;
            match step {
                Err(slot) => {
                    h.update(|i| i.block[slot] = blk);
                }
                Ok((spine, idx)) => {
                    self.set_spine_ptr(txn, spine, idx, blk).await?;
                }
            }
            blk
        };

        self.flush_inode(txn, h).await?;
        Ok(MapInsert::New(inserted))
    }

    async fn map_obtain_block(
        &self,
        txn: &Transaction,
        h: &InodeHandle,
        intent: AllocIntent,
    ) -> Result<Pblk> {
        match intent {
            AllocIntent::Alloc { goal } => {
                let blk = self.alloc_block(txn, goal).await?;
                if h.is_snapfile() {
                    bitmap::exclude_blocks(self, txn, blk, 1).await?;
                }
                h.update(|i| i.blocks += 1);
                Ok(blk)
            }
            AllocIntent::Move(p) => {
                // Ownership transfer; the block stays allocated in the live
                // bitmap and simply gains a new parent.
                h.update(|i| i.blocks += 1);
                Ok(p)
            }
        }
    }

    /// Remove the mapping for `lblk` without freeing the block. Returns the
    /// physical block that was mapped, if any.
    pub async fn map_clear(
        &self,
        txn: &Transaction,
        h: &InodeHandle,
        lblk: Lblk,
    ) -> Result<Option<Pblk>> {
        // Same flush-outside-the-lock discipline as `map_insert`.
        let cleared = {
            let _guard = h.truncate_mutex.lock().await;

            match map_path(lblk)? {
                MapPath::Direct(slot) => {
                    let p = h.with(|i| i.block[slot]);
                    if p == 0 {
                        return Ok(None);
                    }
                    h.update(|i| i.block[slot] = 0);
                    p
                }
                MapPath::Indirect { idx } => {
                    let ind = h.with(|i| i.block[IND_SLOT]);
                    if ind == 0 {
                        return Ok(None);
                    }
                    let p = {
                        let buf = self.buffers().read(ind).await?;
                        let v = read_ptr(&buf.data()[..], idx);
                        v
                    };
                    if p == 0 {
                        return Ok(None);
                    }
                    self.set_spine_ptr(txn, ind, idx, 0).await?;
                    p
                }
                MapPath::DoubleIndirect { idx1, idx2 } => {
                    let dind = h.with(|i| i.block[DIND_SLOT]);
                    if dind == 0 {
                        return Ok(None);
                    }
                    let ind = {
                        let buf = self.buffers().read(dind).await?;
                        let v = read_ptr(&buf.data()[..], idx1);
                        v
                    };
                    if ind == 0 {
                        return Ok(None);
                    }
                    let p = {
                        let buf = self.buffers().read(ind).await?;
                        let v = read_ptr(&buf.data()[..], idx2);
                        v
                    };
                    if p == 0 {
                        return Ok(None);
                    }
                    self.set_spine_ptr(txn, ind, idx2, 0).await?;
                    p
                }
            }
        };

        self.flush_inode(txn, h).await?;
        Ok(Some(cleared))
    }

    /// Collect every mapped (logical, physical) pair of the inode.
    pub async fn mapped_blocks(&self, h: &InodeHandle) -> Result<Vec<(Lblk, Pblk)>> {
        let mut out = Vec::new();
        let (direct, ind, dind) = h.with(|i| {
            let mut direct = [0u32; IND_SLOT];
            direct.copy_from_slice(&i.block[..IND_SLOT]);
            (direct, i.block[IND_SLOT], i.block[DIND_SLOT])
        });

        for (slot, p) in direct.iter().enumerate() {
            if *p != 0 {
                out.push((slot as Lblk, *p));
            }
        }

        if ind != 0 {
            let ptrs = {
                let buf = self.buffers().read(ind).await?;
                let data = buf.data();
                (0..PTRS_PER_BLOCK)
                    .map(|i| read_ptr(&data[..], i))
                    .collect::<Vec<_>>()
            };
            for (i, p) in ptrs.iter().enumerate() {
                if *p != 0 {
                    out.push((DIRECT_BLOCKS + i as u32, *p));
                }
            }
        }

        if dind != 0 {
            let inds = {
                let buf = self.buffers().read(dind).await?;
                let data = buf.data();
                (0..PTRS_PER_BLOCK)
                    .map(|i| read_ptr(&data[..], i))
                    .collect::<Vec<_>>()
            };
            for (i1, ind_blk) in inds.iter().enumerate() {
                if *ind_blk == 0 {
                    continue;
                }
                let ptrs = {
                    let buf = self.buffers().read(*ind_blk).await?;
                    let data = buf.data();
                    (0..PTRS_PER_BLOCK)
                        .map(|i| read_ptr(&data[..], i))
                        .collect::<Vec<_>>()
                };
                for (i2, p) in ptrs.iter().enumerate() {
                    if *p != 0 {
                        out.push((
                            DIRECT_BLOCKS + PTRS_PER_BLOCK + i1 as u32 * PTRS_PER_BLOCK + i2 as u32,
                            *p,
                        ));
                    }
                }
            }
        }

        Ok(out)
    }

    /// Collect the map-spine blocks (indirect and double-indirect) of the
    /// inode; used when tearing the file down.
    pub async fn spine_blocks(&self, h: &InodeHandle) -> Result<Vec<Pblk>> {
        let mut out = Vec::new();
        let (ind, dind) = h.with(|i| (i.block[IND_SLOT], i.block[DIND_SLOT]));
        if ind != 0 {
            out.push(ind);
        }
        if dind != 0 {
            let inds = {
                let buf = self.buffers().read(dind).await?;
                let data = buf.data();
                (0..PTRS_PER_BLOCK)
                    .map(|i| read_ptr(&data[..], i))
                    .collect::<Vec<_>>()
            };
            for ind_blk in inds {
                if ind_blk != 0 {
                    out.push(ind_blk);
                }
            }
            out.push(dind);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_path_boundaries() {
        assert!(matches!(map_path(0).unwrap(), MapPath::Direct(0)));
        assert!(matches!(map_path(11).unwrap(), MapPath::Direct(11)));
        assert!(matches!(map_path(12).unwrap(), MapPath::Indirect { idx: 0 }));
        assert!(matches!(
            map_path(12 + 1023).unwrap(),
            MapPath::Indirect { idx: 1023 }
        ));
        assert!(matches!(
            map_path(12 + 1024).unwrap(),
            MapPath::DoubleIndirect { idx1: 0, idx2: 0 }
        ));
        assert!(matches!(
            map_path(12 + 1024 + 1024 + 1).unwrap(),
            MapPath::DoubleIndirect { idx1: 1, idx2: 1 }
        ));
    }

    #[test]
    fn test_ptr_io() {
        let mut data = vec![0u8; BLOCK_SIZE];
        write_ptr(&mut data, 5, 0xDEAD);
        assert_eq!(read_ptr(&data, 5), 0xDEAD);
        assert_eq!(read_ptr(&data, 4), 0);
    }

    #[test]
    fn test_handle_flags() {
        let mut inode = Inode::empty();
        inode.flags = iflags::SNAPFILE;
        let h = InodeHandle::new(42, inode);
        assert!(h.is_snapfile());
        assert!(!h.has_flag(iflags::ENABLED));
        h.set_flags(iflags::ENABLED | iflags::ON_LIST);
        assert!(h.has_flag(iflags::ENABLED));
        h.clear_flags(iflags::ENABLED);
        assert!(!h.has_flag(iflags::ENABLED));
        assert!(h.has_flag(iflags::ON_LIST));

        h.open();
        h.open();
        assert_eq!(h.open_count(), 2);
        h.release();
        h.release();
        assert_eq!(h.open_count(), 0);
    }
}
