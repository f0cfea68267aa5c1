//! On-disk format: superblock, group descriptors, inodes, and mkfs.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::layout::{Layout, Pblk, GROUP_DESC_SIZE, INODE_SIZE};

/// Magic number identifying the filesystem.
pub const SNAPFS_MAGIC: &[u8; 8] = b"SNAPFS\x00\x00";
/// Current filesystem version.
pub const FS_VERSION: u32 = 1;

/// Root directory inode.
pub const INO_ROOT: u32 = 1;
/// Journal inode; its data blocks are the journal area.
pub const INO_JOURNAL: u32 = 8;
/// Exclude inode; its data blocks are the per-group exclude bitmaps.
pub const INO_EXCLUDE: u32 = 9;
/// First inode number handed out to ordinary files and snapshots.
pub const INO_FIRST_FREE: u32 = 11;

/// Superblock state bits.
pub mod state {
    /// Volume was unmounted cleanly.
    pub const CLEAN: u16 = 0x0001;
    /// Journal recovery is (or may be) needed.
    pub const RECOVER: u16 = 0x0002;
}

/// Feature flags.
pub mod features {
    /// Compat: the volume carries a journal.
    pub const COMPAT_HAS_JOURNAL: u32 = 0x0001;
    /// Compat: the exclude inode exists.
    pub const COMPAT_EXCLUDE_INODE: u32 = 0x0002;
    /// Compat, advisory: the journal is large enough for worst-case COW
    /// credit consumption.
    pub const COMPAT_BIG_JOURNAL: u32 = 0x0004;

    /// RO-compat: at least one snapshot exists (or existed).
    pub const RO_HAS_SNAPSHOT: u32 = 0x0001;
    /// RO-compat: this superblock is a snapshot image copy.
    pub const RO_IS_SNAPSHOT: u32 = 0x0002;
    /// RO-compat: an exclude-bitmap inconsistency was detected; fsck must
    /// rebuild the exclude inode.
    pub const RO_FIX_EXCLUDE: u32 = 0x0004;
}

/// Per-inode flag bits.
pub mod iflags {
    /// The file belongs to the snapshot subsystem; never cleared.
    pub const SNAPFILE: u32 = 0x0100;
    /// The inode is linked on the snapshot chain.
    pub const ON_LIST: u32 = 0x0200;
    /// The snapshot is user visible and may be loop mounted.
    pub const ENABLED: u32 = 0x0400;
    /// The snapshot currently receives copy-on-write (at most one).
    pub const ACTIVE: u32 = 0x0800;
    /// An older enabled snapshot reads through this one.
    pub const IN_USE: u32 = 0x1000;
    /// Removal was requested; the lifecycle will reap it.
    pub const DELETED: u32 = 0x2000;
    /// The shrink pass has completed on this snapshot.
    pub const SHRUNK: u32 = 0x4000;
    /// Somebody holds the snapshot file open (dynamic, never stored).
    pub const OPEN: u32 = 0x8000;

    /// Flags recomputed from runtime state rather than trusted from disk.
    pub const DYNAMIC: u32 = ACTIVE | IN_USE | OPEN;
}

/// File mode: regular file.
pub const MODE_REG: u16 = 0o100000;
/// File mode: directory.
pub const MODE_DIR: u16 = 0o040000;

/// On-disk superblock.
#[derive(Debug, Clone)]
pub struct Superblock {
    /// Magic number.
    pub magic: [u8; 8],
    /// Format version.
    pub version: u32,
    /// State bits (`state::*`).
    pub state: u16,
    /// Total number of blocks.
    pub block_count: u32,
    /// Blocks per group.
    pub blocks_per_group: u32,
    /// Inodes per group.
    pub inodes_per_group: u32,
    /// Free block count.
    pub free_blocks: u32,
    /// Free inode count.
    pub free_inodes: u32,
    /// Journal inode number (0 when the image has no journal).
    pub journal_ino: u32,
    /// Length of the journal area in blocks.
    pub journal_blocks: u32,
    /// Compat feature flags.
    pub features_compat: u32,
    /// RO-compat feature flags.
    pub features_ro_compat: u32,
    /// Newest snapshot inode; head of the on-disk chain (0 = empty).
    pub last_snapshot_ino: u32,
    /// The active snapshot inode (0 = none).
    pub active_snapshot_ino: u32,
    /// Monotonic snapshot id counter; 0 means no snapshot was ever taken.
    pub snapshot_id: u32,
    /// Free-block floor required before a snapshot take may proceed.
    pub snapshot_reserved_blocks: u32,
    /// mkfs timestamp (epoch seconds).
    pub mkfs_time: u64,
    /// Volume UUID.
    pub uuid: [u8; 16],
    /// Volume name.
    pub volume_name: [u8; 16],
}

impl Superblock {
    /// Serialized size in bytes.
    pub const SIZE: usize = 8 + 4 + 2 + 2 + 13 * 4 + 8 + 16 + 16;

    /// Serialize into a writer.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.magic)?;
        w.write_u32::<LittleEndian>(self.version)?;
        w.write_u16::<LittleEndian>(self.state)?;
        w.write_u16::<LittleEndian>(0)?; // pad
        w.write_u32::<LittleEndian>(self.block_count)?;
        w.write_u32::<LittleEndian>(self.blocks_per_group)?;
        w.write_u32::<LittleEndian>(self.inodes_per_group)?;
        w.write_u32::<LittleEndian>(self.free_blocks)?;
        w.write_u32::<LittleEndian>(self.free_inodes)?;
        w.write_u32::<LittleEndian>(self.journal_ino)?;
        w.write_u32::<LittleEndian>(self.journal_blocks)?;
        w.write_u32::<LittleEndian>(self.features_compat)?;
        w.write_u32::<LittleEndian>(self.features_ro_compat)?;
        w.write_u32::<LittleEndian>(self.last_snapshot_ino)?;
        w.write_u32::<LittleEndian>(self.active_snapshot_ino)?;
        w.write_u32::<LittleEndian>(self.snapshot_id)?;
        w.write_u32::<LittleEndian>(self.snapshot_reserved_blocks)?;
        w.write_u64::<LittleEndian>(self.mkfs_time)?;
        w.write_all(&self.uuid)?;
        w.write_all(&self.volume_name)?;
        Ok(())
    }

    /// Deserialize from a reader.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != SNAPFS_MAGIC {
            return Err(Error::Format("bad magic number".into()));
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != FS_VERSION {
            return Err(Error::Format(format!("unsupported version {}", version)));
        }
        let state = r.read_u16::<LittleEndian>()?;
        let _pad = r.read_u16::<LittleEndian>()?;
        let block_count = r.read_u32::<LittleEndian>()?;
        let blocks_per_group = r.read_u32::<LittleEndian>()?;
        let inodes_per_group = r.read_u32::<LittleEndian>()?;
        let free_blocks = r.read_u32::<LittleEndian>()?;
        let free_inodes = r.read_u32::<LittleEndian>()?;
        let journal_ino = r.read_u32::<LittleEndian>()?;
        let journal_blocks = r.read_u32::<LittleEndian>()?;
        let features_compat = r.read_u32::<LittleEndian>()?;
        let features_ro_compat = r.read_u32::<LittleEndian>()?;
        let last_snapshot_ino = r.read_u32::<LittleEndian>()?;
        let active_snapshot_ino = r.read_u32::<LittleEndian>()?;
        let snapshot_id = r.read_u32::<LittleEndian>()?;
        let snapshot_reserved_blocks = r.read_u32::<LittleEndian>()?;
        let mkfs_time = r.read_u64::<LittleEndian>()?;
        let mut uuid = [0u8; 16];
        r.read_exact(&mut uuid)?;
        let mut volume_name = [0u8; 16];
        r.read_exact(&mut volume_name)?;

        if blocks_per_group < 16 || block_count == 0 {
            return Err(Error::Format("implausible geometry".into()));
        }

        Ok(Self {
            magic,
            version,
            state,
            block_count,
            blocks_per_group,
            inodes_per_group,
            free_blocks,
            free_inodes,
            journal_ino,
            journal_blocks,
            features_compat,
            features_ro_compat,
            last_snapshot_ino,
            active_snapshot_ino,
            snapshot_id,
            snapshot_reserved_blocks,
            mkfs_time,
            uuid,
            volume_name,
        })
    }

    /// Serialize into a full block image.
    pub fn to_block(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        let mut cursor = Cursor::new(&mut block[..]);
        self.write_to(&mut cursor).expect("superblock fits a block");
        block
    }

    /// Volume geometry described by this superblock.
    pub fn layout(&self) -> Layout {
        Layout::new(self.block_count, self.blocks_per_group, self.inodes_per_group)
    }

    /// Rewrite the superblock so it presents as a stand-alone, read-only
    /// image: no journal, no snapshot chain, flagged as a snapshot copy.
    pub fn patch_for_image(&mut self) {
        self.features_compat &=
            !(features::COMPAT_HAS_JOURNAL | features::COMPAT_BIG_JOURNAL);
        self.journal_ino = 0;
        self.journal_blocks = 0;
        self.last_snapshot_ino = 0;
        self.active_snapshot_ino = 0;
        self.features_ro_compat &= !features::RO_HAS_SNAPSHOT;
        self.features_ro_compat |= features::RO_IS_SNAPSHOT;
        self.state = state::CLEAN;
    }
}

/// On-disk block-group descriptor.
///
/// `exclude_bitmap` is persistent; the COW-bitmap cache slot exists only in
/// memory and is recomputed on every mount (see `volume::GroupInfo`).
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupDesc {
    /// Block bitmap block.
    pub block_bitmap: Pblk,
    /// Inode bitmap block.
    pub inode_bitmap: Pblk,
    /// First inode-table block.
    pub inode_table: Pblk,
    /// Exclude-bitmap block (data block of the exclude inode).
    pub exclude_bitmap: Pblk,
    /// Free blocks in the group.
    pub free_blocks: u16,
    /// Free inodes in the group.
    pub free_inodes: u16,
}

impl GroupDesc {
    /// Serialize into a writer (always `GROUP_DESC_SIZE` bytes).
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.block_bitmap)?;
        w.write_u32::<LittleEndian>(self.inode_bitmap)?;
        w.write_u32::<LittleEndian>(self.inode_table)?;
        w.write_u32::<LittleEndian>(self.exclude_bitmap)?;
        w.write_u16::<LittleEndian>(self.free_blocks)?;
        w.write_u16::<LittleEndian>(self.free_inodes)?;
        w.write_all(&[0u8; GROUP_DESC_SIZE - 20])?;
        Ok(())
    }

    /// Deserialize from a reader.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let block_bitmap = r.read_u32::<LittleEndian>()?;
        let inode_bitmap = r.read_u32::<LittleEndian>()?;
        let inode_table = r.read_u32::<LittleEndian>()?;
        let exclude_bitmap = r.read_u32::<LittleEndian>()?;
        let free_blocks = r.read_u16::<LittleEndian>()?;
        let free_inodes = r.read_u16::<LittleEndian>()?;
        let mut pad = [0u8; GROUP_DESC_SIZE - 20];
        r.read_exact(&mut pad)?;
        Ok(Self {
            block_bitmap,
            inode_bitmap,
            inode_table,
            exclude_bitmap,
            free_blocks,
            free_inodes,
        })
    }
}

/// On-disk inode (128 bytes).
#[derive(Debug, Clone)]
pub struct Inode {
    /// File mode and type.
    pub mode: u16,
    /// Hard link count; 0 means the inode slot is free.
    pub links: u16,
    /// Flag bits (`iflags::*`).
    pub flags: u32,
    /// Visible size in bytes. Disabled snapshots show 0 here.
    pub size: u64,
    /// On-disk extent in bytes; for snapshots, the live volume size at take.
    pub disksize: u64,
    /// Generation; for snapshot files this is the snapshot id.
    pub generation: u32,
    /// Next inode on the snapshot chain (shared with the orphan slot;
    /// snapshots are never orphans at the same time).
    pub next_snapshot: u32,
    /// Number of blocks charged to this inode.
    pub blocks: u32,
    /// Last access time (epoch seconds).
    pub atime: u32,
    /// Last modification time.
    pub mtime: u32,
    /// Last status change time.
    pub ctime: u32,
    /// Block pointers: 12 direct, then indirect, double-indirect and
    /// triple-indirect.
    pub block: [u32; 15],
}

/// Index of the single-indirect slot in `Inode::block`.
pub const IND_SLOT: usize = 12;
/// Index of the double-indirect slot.
pub const DIND_SLOT: usize = 13;
/// Index of the triple-indirect slot (reserved).
pub const TIND_SLOT: usize = 14;

impl Inode {
    /// A zeroed (free) inode.
    pub fn empty() -> Self {
        Self {
            mode: 0,
            links: 0,
            flags: 0,
            size: 0,
            disksize: 0,
            generation: 0,
            next_snapshot: 0,
            blocks: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            block: [0; 15],
        }
    }

    /// Whether this inode is part of the snapshot subsystem.
    #[inline]
    pub fn is_snapfile(&self) -> bool {
        self.flags & iflags::SNAPFILE != 0
    }

    /// Whether a flag bit is set.
    #[inline]
    pub fn has_flag(&self, bit: u32) -> bool {
        self.flags & bit != 0
    }

    /// Serialize into a writer (always `INODE_SIZE` bytes).
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut buf = [0u8; INODE_SIZE];
        {
            let mut c = Cursor::new(&mut buf[..]);
            c.write_u16::<LittleEndian>(self.mode)?;
            c.write_u16::<LittleEndian>(self.links)?;
            c.write_u32::<LittleEndian>(self.flags)?;
            c.write_u64::<LittleEndian>(self.size)?;
            c.write_u64::<LittleEndian>(self.disksize)?;
            c.write_u32::<LittleEndian>(self.generation)?;
            c.write_u32::<LittleEndian>(self.next_snapshot)?;
            c.write_u32::<LittleEndian>(self.blocks)?;
            c.write_u32::<LittleEndian>(self.atime)?;
            c.write_u32::<LittleEndian>(self.mtime)?;
            c.write_u32::<LittleEndian>(self.ctime)?;
            for b in &self.block {
                c.write_u32::<LittleEndian>(*b)?;
            }
        }
        w.write_all(&buf)
    }

    /// Deserialize from a reader.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; INODE_SIZE];
        r.read_exact(&mut buf)?;
        let mut c = Cursor::new(&buf[..]);
        let mode = c.read_u16::<LittleEndian>()?;
        let links = c.read_u16::<LittleEndian>()?;
        let flags = c.read_u32::<LittleEndian>()?;
        let size = c.read_u64::<LittleEndian>()?;
        let disksize = c.read_u64::<LittleEndian>()?;
        let generation = c.read_u32::<LittleEndian>()?;
        let next_snapshot = c.read_u32::<LittleEndian>()?;
        let blocks = c.read_u32::<LittleEndian>()?;
        let atime = c.read_u32::<LittleEndian>()?;
        let mtime = c.read_u32::<LittleEndian>()?;
        let ctime = c.read_u32::<LittleEndian>()?;
        let mut block = [0u32; 15];
        for b in block.iter_mut() {
            *b = c.read_u32::<LittleEndian>()?;
        }
        Ok(Self {
            mode,
            links,
            flags,
            size,
            disksize,
            generation,
            next_snapshot,
            blocks,
            atime,
            mtime,
            ctime,
            block,
        })
    }
}

/// Parameters for formatting a new volume.
#[derive(Debug, Clone)]
pub struct MkfsParams {
    /// Blocks per block group.
    pub blocks_per_group: u32,
    /// Inodes per block group.
    pub inodes_per_group: u32,
    /// Journal area size in blocks.
    pub journal_blocks: u32,
    /// Free-block floor required for a snapshot take.
    pub snapshot_reserved_blocks: u32,
    /// Volume name.
    pub volume_name: Option<String>,
}

impl Default for MkfsParams {
    fn default() -> Self {
        Self {
            blocks_per_group: (BLOCK_SIZE * 8) as u32,
            inodes_per_group: 128,
            journal_blocks: 64,
            snapshot_reserved_blocks: 32,
            volume_name: None,
        }
    }
}

/// Journal size (in blocks) above which mkfs advertises `BIG_JOURNAL`: room
/// for at least 32 worst-case COW transactions.
const BIG_JOURNAL_BLOCKS: u32 = 256;

struct MkfsBuilder {
    layout: Layout,
    bitmaps: Vec<Vec<u8>>,
    exclude: Vec<Vec<u8>>,
}

impl MkfsBuilder {
    fn new(layout: Layout) -> Self {
        let bitmap_bytes = ((layout.blocks_per_group + 7) / 8) as usize;
        let mut b = Self {
            bitmaps: vec![vec![0u8; bitmap_bytes]; layout.group_count as usize],
            exclude: vec![vec![0u8; bitmap_bytes]; layout.group_count as usize],
            layout,
        };
        // Blocks past the end of the device in the (short) last group do
        // not exist; mark them used so they are never handed out.
        let last = layout.group_count - 1;
        for off in layout.blocks_in_group(last)..layout.blocks_per_group {
            b.set_used(layout.group_first_block(last) + off);
        }
        b
    }

    fn set_used(&mut self, p: Pblk) {
        let (g, off) = self.layout.group_of(p);
        self.bitmaps[g as usize][(off / 8) as usize] |= 1 << (off % 8);
    }

    fn is_used(&self, p: Pblk) -> bool {
        let (g, off) = self.layout.group_of(p);
        self.bitmaps[g as usize][(off / 8) as usize] & (1 << (off % 8)) != 0
    }

    fn set_excluded(&mut self, p: Pblk) {
        let (g, off) = self.layout.group_of(p);
        self.exclude[g as usize][(off / 8) as usize] |= 1 << (off % 8);
    }

    /// Claim `count` contiguous free blocks in `group`, preferring the data
    /// area after the inode table.
    fn claim_run(&mut self, group: u32, count: u32) -> Result<Pblk> {
        let meta = self.layout.group_meta(group);
        let first = self.layout.group_first_block(group);
        let end = first + self.layout.blocks_in_group(group);
        let mut start = meta.first_data;
        'scan: while start + count <= end {
            for i in 0..count {
                if self.is_used(start + i) {
                    start += i + 1;
                    continue 'scan;
                }
            }
            for i in 0..count {
                self.set_used(start + i);
            }
            return Ok(start);
        }
        Err(Error::NoSpace)
    }
}

/// Format a new volume on `device`.
///
/// Writes the superblock, group descriptors, block and inode bitmaps, inode
/// tables, the journal area (owned by the journal inode) and the exclude
/// inode with one exclude-bitmap block per group.
pub async fn mkfs(device: &dyn BlockDevice, params: &MkfsParams) -> Result<Layout> {
    let block_count = device.block_count().min(u32::MAX as u64) as u32;
    let layout = Layout::new(block_count, params.blocks_per_group, params.inodes_per_group);
    if layout.group_count == 0 {
        return Err(Error::Format("device too small".into()));
    }

    let mut b = MkfsBuilder::new(layout);

    // Fixed metadata.
    b.set_used(0); // superblock
    for i in 0..layout.gdt_blocks {
        b.set_used(1 + i);
    }
    for g in 0..layout.group_count {
        let meta = layout.group_meta(g);
        b.set_used(meta.block_bitmap);
        b.set_used(meta.inode_bitmap);
        for i in 0..layout.itb_per_group {
            b.set_used(meta.inode_table + i);
        }
    }

    // Exclude inode: one bitmap block per group, placed inside its group so
    // the group descriptor can point straight at it. The bitmap blocks are
    // themselves snapshot-subsystem blocks and carry their own exclude bit.
    let mut exclude_blocks = Vec::with_capacity(layout.group_count as usize);
    for g in 0..layout.group_count {
        let blk = b.claim_run(g, 1)?;
        b.set_excluded(blk);
        exclude_blocks.push(blk);
    }
    let mut exclude_inode = Inode::empty();
    exclude_inode.mode = MODE_REG;
    exclude_inode.links = 1;
    exclude_inode.size = layout.group_count as u64 * BLOCK_SIZE as u64;
    exclude_inode.disksize = exclude_inode.size;
    exclude_inode.blocks = layout.group_count;
    let mut exclude_ind: Option<(Pblk, Vec<u32>)> = None;
    for (g, blk) in exclude_blocks.iter().enumerate() {
        if g < IND_SLOT {
            exclude_inode.block[g] = *blk;
        } else {
            if exclude_ind.is_none() {
                let ind = b.claim_run(0, 1)?;
                b.set_excluded(ind);
                exclude_inode.block[IND_SLOT] = ind;
                exclude_inode.blocks += 1;
                exclude_ind = Some((ind, vec![0u32; BLOCK_SIZE / 4]));
            }
            let (_, ptrs) = exclude_ind.as_mut().unwrap();
            let idx = g - IND_SLOT;
            if idx >= ptrs.len() {
                return Err(Error::Format("too many groups for mkfs".into()));
            }
            ptrs[idx] = *blk;
        }
    }

    // Journal: one contiguous run in group 0, mapped through the journal
    // inode (direct pointers plus one indirect block when needed).
    let journal_blocks = params.journal_blocks;
    let journal_start = b.claim_run(0, journal_blocks)?;
    let mut journal_inode = Inode::empty();
    journal_inode.mode = MODE_REG;
    journal_inode.links = 1;
    journal_inode.size = journal_blocks as u64 * BLOCK_SIZE as u64;
    journal_inode.disksize = journal_inode.size;
    journal_inode.blocks = journal_blocks;
    let mut journal_ind: Option<(Pblk, Vec<u32>)> = None;
    for i in 0..journal_blocks {
        let blk = journal_start + i;
        if (i as usize) < IND_SLOT {
            journal_inode.block[i as usize] = blk;
        } else {
            if journal_ind.is_none() {
                let ind = b.claim_run(0, 1)?;
                journal_inode.block[IND_SLOT] = ind;
                journal_inode.blocks += 1;
                journal_ind = Some((ind, vec![0u32; BLOCK_SIZE / 4]));
            }
            let (_, ptrs) = journal_ind.as_mut().unwrap();
            let idx = i as usize - IND_SLOT;
            if idx >= ptrs.len() {
                return Err(Error::Format("journal too large for mkfs".into()));
            }
            ptrs[idx] = blk;
        }
    }

    // Root inode: an empty directory is all the snapshot layer needs.
    let mut root_inode = Inode::empty();
    root_inode.mode = MODE_DIR;
    root_inode.links = 2;

    // Inode bitmaps: inodes below INO_FIRST_FREE are reserved in group 0.
    let bitmap_bytes = ((layout.blocks_per_group + 7) / 8) as usize;
    let mut inode_bitmaps = vec![vec![0u8; bitmap_bytes]; layout.group_count as usize];
    for ino in 1..INO_FIRST_FREE {
        let (g, idx) = layout.inode_location(ino);
        inode_bitmaps[g as usize][(idx / 8) as usize] |= 1 << (idx % 8);
    }

    // Accounting.
    let mut free_blocks_total = 0u32;
    let mut group_free_blocks = vec![0u16; layout.group_count as usize];
    for g in 0..layout.group_count {
        let mut free = 0u32;
        for off in 0..layout.blocks_in_group(g) {
            if !b.is_used(layout.group_first_block(g) + off) {
                free += 1;
            }
        }
        group_free_blocks[g as usize] = free.min(u16::MAX as u32) as u16;
        free_blocks_total += free;
    }
    let reserved_inos = INO_FIRST_FREE - 1;
    let free_inodes_total = layout.inode_count() - reserved_inos;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut compat = features::COMPAT_HAS_JOURNAL | features::COMPAT_EXCLUDE_INODE;
    if journal_blocks >= BIG_JOURNAL_BLOCKS {
        compat |= features::COMPAT_BIG_JOURNAL;
    }

    let mut uuid = [0u8; 16];
    uuid[..8].copy_from_slice(&now.to_le_bytes());
    uuid[8..12].copy_from_slice(&block_count.to_le_bytes());
    uuid[12..16].copy_from_slice(&layout.group_count.to_le_bytes());

    let mut volume_name = [0u8; 16];
    if let Some(name) = &params.volume_name {
        let bytes = name.as_bytes();
        let len = bytes.len().min(volume_name.len());
        volume_name[..len].copy_from_slice(&bytes[..len]);
    }

    let sb = Superblock {
        magic: *SNAPFS_MAGIC,
        version: FS_VERSION,
        state: state::CLEAN,
        block_count,
        blocks_per_group: params.blocks_per_group,
        inodes_per_group: params.inodes_per_group,
        free_blocks: free_blocks_total,
        free_inodes: free_inodes_total,
        journal_ino: INO_JOURNAL,
        journal_blocks,
        features_compat: compat,
        features_ro_compat: 0,
        last_snapshot_ino: 0,
        active_snapshot_ino: 0,
        snapshot_id: 0,
        snapshot_reserved_blocks: params.snapshot_reserved_blocks,
        mkfs_time: now,
        uuid,
        volume_name,
    };

    // Write everything out.
    device.write_block(0, &sb.to_block()).await?;

    let mut gdt = vec![0u8; layout.gdt_blocks as usize * BLOCK_SIZE];
    for g in 0..layout.group_count {
        let meta = layout.group_meta(g);
        let desc = GroupDesc {
            block_bitmap: meta.block_bitmap,
            inode_bitmap: meta.inode_bitmap,
            inode_table: meta.inode_table,
            exclude_bitmap: exclude_blocks[g as usize],
            free_blocks: group_free_blocks[g as usize],
            free_inodes: if g == 0 {
                (layout.inodes_per_group - reserved_inos) as u16
            } else {
                layout.inodes_per_group as u16
            },
        };
        let off = g as usize * GROUP_DESC_SIZE;
        let mut c = Cursor::new(&mut gdt[off..off + GROUP_DESC_SIZE]);
        desc.write_to(&mut c)?;
    }
    for i in 0..layout.gdt_blocks {
        let off = i as usize * BLOCK_SIZE;
        device
            .write_block(1 + i as u64, &gdt[off..off + BLOCK_SIZE])
            .await?;
    }

    for g in 0..layout.group_count {
        let meta = layout.group_meta(g);

        let mut bb = [0u8; BLOCK_SIZE];
        bb[..bitmap_bytes].copy_from_slice(&b.bitmaps[g as usize]);
        device.write_block(meta.block_bitmap as u64, &bb).await?;

        let mut ib = [0u8; BLOCK_SIZE];
        ib[..bitmap_bytes].copy_from_slice(&inode_bitmaps[g as usize]);
        device.write_block(meta.inode_bitmap as u64, &ib).await?;

        for i in 0..layout.itb_per_group {
            device.zero_block((meta.inode_table + i) as u64).await?;
        }

        let mut ex = [0u8; BLOCK_SIZE];
        ex[..bitmap_bytes].copy_from_slice(&b.exclude[g as usize]);
        device
            .write_block(exclude_blocks[g as usize] as u64, &ex)
            .await?;
    }

    // Indirect blocks of the exclude and journal inodes.
    for (ind, ptrs) in [exclude_ind, journal_ind].into_iter().flatten() {
        let mut block = [0u8; BLOCK_SIZE];
        {
            let mut c = Cursor::new(&mut block[..]);
            for p in &ptrs {
                c.write_u32::<LittleEndian>(*p)?;
            }
        }
        device.write_block(ind as u64, &block).await?;
    }

    // Zero the head of the journal area so recovery finds a clean log.
    device.zero_block(journal_start as u64).await?;

    // Reserved inodes live in group 0's inode table.
    let per_block = (BLOCK_SIZE / INODE_SIZE) as u32;
    let g0 = layout.group_meta(0);
    let mut itb_cache: std::collections::HashMap<Pblk, [u8; BLOCK_SIZE]> =
        std::collections::HashMap::new();
    for (ino, inode) in [
        (INO_ROOT, &root_inode),
        (INO_JOURNAL, &journal_inode),
        (INO_EXCLUDE, &exclude_inode),
    ] {
        let (_, idx) = layout.inode_location(ino);
        let blk = g0.inode_table + idx / per_block;
        let off = (idx % per_block) as usize * INODE_SIZE;
        let entry = itb_cache.entry(blk).or_insert([0u8; BLOCK_SIZE]);
        let mut c = Cursor::new(&mut entry[off..off + INODE_SIZE]);
        inode.write_to(&mut c)?;
    }
    for (blk, data) in &itb_cache {
        device.write_block(*blk as u64, data).await?;
    }

    device.sync().await?;

    log::info!(
        "mkfs: {} blocks, {} groups of {}, journal {} blocks at {}",
        block_count,
        layout.group_count,
        params.blocks_per_group,
        journal_blocks,
        journal_start
    );

    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::FileBackedBlockDevice;
    use tempfile::tempdir;

    #[test]
    fn test_superblock_roundtrip() {
        let mut sb = Superblock {
            magic: *SNAPFS_MAGIC,
            version: FS_VERSION,
            state: state::CLEAN,
            block_count: 512,
            blocks_per_group: 64,
            inodes_per_group: 32,
            free_blocks: 400,
            free_inodes: 200,
            journal_ino: INO_JOURNAL,
            journal_blocks: 32,
            features_compat: features::COMPAT_HAS_JOURNAL | features::COMPAT_EXCLUDE_INODE,
            features_ro_compat: 0,
            last_snapshot_ino: 0,
            active_snapshot_ino: 0,
            snapshot_id: 0,
            snapshot_reserved_blocks: 16,
            mkfs_time: 1234,
            uuid: [7; 16],
            volume_name: [0; 16],
        };
        sb.volume_name[..4].copy_from_slice(b"test");

        let block = sb.to_block();
        let parsed = Superblock::read_from(&mut Cursor::new(&block[..])).unwrap();
        assert_eq!(parsed.block_count, 512);
        assert_eq!(parsed.blocks_per_group, 64);
        assert_eq!(parsed.journal_ino, INO_JOURNAL);
        assert_eq!(&parsed.volume_name[..4], b"test");
    }

    #[test]
    fn test_superblock_image_patch() {
        let mut sb = Superblock {
            magic: *SNAPFS_MAGIC,
            version: FS_VERSION,
            state: state::RECOVER,
            block_count: 512,
            blocks_per_group: 64,
            inodes_per_group: 32,
            free_blocks: 400,
            free_inodes: 200,
            journal_ino: INO_JOURNAL,
            journal_blocks: 32,
            features_compat: features::COMPAT_HAS_JOURNAL,
            features_ro_compat: features::RO_HAS_SNAPSHOT,
            last_snapshot_ino: 12,
            active_snapshot_ino: 12,
            snapshot_id: 3,
            snapshot_reserved_blocks: 16,
            mkfs_time: 0,
            uuid: [0; 16],
            volume_name: [0; 16],
        };
        sb.patch_for_image();
        assert_eq!(sb.journal_ino, 0);
        assert_eq!(sb.last_snapshot_ino, 0);
        assert_eq!(sb.active_snapshot_ino, 0);
        assert_eq!(sb.features_compat & features::COMPAT_HAS_JOURNAL, 0);
        assert_eq!(sb.features_ro_compat & features::RO_HAS_SNAPSHOT, 0);
        assert_ne!(sb.features_ro_compat & features::RO_IS_SNAPSHOT, 0);
    }

    #[test]
    fn test_inode_roundtrip() {
        let mut inode = Inode::empty();
        inode.mode = MODE_REG;
        inode.links = 1;
        inode.flags = iflags::SNAPFILE | iflags::ON_LIST;
        inode.size = 99;
        inode.disksize = 4096 * 64;
        inode.generation = 5;
        inode.next_snapshot = 17;
        inode.block[0] = 42;
        inode.block[IND_SLOT] = 77;

        let mut buf = Vec::new();
        inode.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), INODE_SIZE);

        let parsed = Inode::read_from(&mut Cursor::new(&buf[..])).unwrap();
        assert!(parsed.is_snapfile());
        assert_eq!(parsed.next_snapshot, 17);
        assert_eq!(parsed.block[0], 42);
        assert_eq!(parsed.block[IND_SLOT], 77);
        assert_eq!(parsed.disksize, 4096 * 64);
    }

    #[tokio::test]
    async fn test_mkfs_small_volume() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mkfs.img");
        let device = FileBackedBlockDevice::create(&path, 256 * BLOCK_SIZE as u64)
            .await
            .unwrap();

        let params = MkfsParams {
            blocks_per_group: 64,
            inodes_per_group: 32,
            journal_blocks: 16,
            ..Default::default()
        };
        let layout = mkfs(&device, &params).await.unwrap();
        assert_eq!(layout.group_count, 4);

        let mut raw = [0u8; BLOCK_SIZE];
        device.read_block(0, &mut raw).await.unwrap();
        let sb = Superblock::read_from(&mut Cursor::new(&raw[..])).unwrap();
        assert_eq!(sb.block_count, 256);
        assert_eq!(sb.journal_blocks, 16);
        assert_ne!(sb.features_compat & features::COMPAT_EXCLUDE_INODE, 0);
        assert_eq!(sb.snapshot_id, 0);

        // Every group descriptor points at an exclude bitmap inside the
        // group it describes.
        device.read_block(1, &mut raw).await.unwrap();
        for g in 0..4u32 {
            let off = g as usize * GROUP_DESC_SIZE;
            let desc =
                GroupDesc::read_from(&mut Cursor::new(&raw[off..off + GROUP_DESC_SIZE])).unwrap();
            assert_eq!(desc.block_bitmap / 64, g);
            assert_eq!(desc.exclude_bitmap / 64, g);
        }
    }
}
