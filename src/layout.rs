//! On-disk layout: block-group geometry and the snapshot address shift.

/// Physical block number on the live volume (32-bit by design).
pub type Pblk = u32;

/// Logical block number within a file.
pub type Lblk = u32;

/// Size of an on-disk inode in bytes.
pub const INODE_SIZE: usize = 128;

/// Size of an on-disk group descriptor in bytes.
pub const GROUP_DESC_SIZE: usize = 32;

/// Number of logical blocks reserved at the front of every snapshot file
/// for metadata copies: the patched superblock copy at block 0, the patched
/// group-descriptor copy starting at block 1.
pub const SNAPSHOT_RESERVED_BLOCKS: Lblk = 16;

/// Logical block of the patched superblock copy inside a snapshot file.
pub const SNAPSHOT_SUPERBLOCK_LBLK: Lblk = 0;

/// First logical block of the patched group-descriptor copy.
pub const SNAPSHOT_GDT_LBLK: Lblk = 1;

/// Logical block of a snapshot file that preserves physical block `p`.
#[inline]
pub fn snapshot_iblock(p: Pblk) -> Lblk {
    p + SNAPSHOT_RESERVED_BLOCKS
}

/// Physical block preserved at snapshot logical block `l` (body only).
#[inline]
pub fn snapshot_pblk(l: Lblk) -> Pblk {
    debug_assert!(l >= SNAPSHOT_RESERVED_BLOCKS);
    l - SNAPSHOT_RESERVED_BLOCKS
}

/// Canonical per-group metadata placement.
#[derive(Debug, Clone, Copy)]
pub struct GroupMeta {
    /// Block bitmap block of the group.
    pub block_bitmap: Pblk,
    /// Inode bitmap block of the group.
    pub inode_bitmap: Pblk,
    /// First block of the group's inode table.
    pub inode_table: Pblk,
    /// First block usable for data in the group.
    pub first_data: Pblk,
}

/// Volume geometry derived from the superblock.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    /// Total number of blocks on the volume.
    pub block_count: u32,
    /// Blocks per block group.
    pub blocks_per_group: u32,
    /// Inodes per block group.
    pub inodes_per_group: u32,
    /// Number of block groups.
    pub group_count: u32,
    /// Blocks occupied by the group-descriptor table (after the superblock).
    pub gdt_blocks: u32,
    /// Inode-table blocks per group.
    pub itb_per_group: u32,
}

impl Layout {
    /// Compute the geometry for a volume of `block_count` blocks.
    pub fn new(block_count: u32, blocks_per_group: u32, inodes_per_group: u32) -> Self {
        assert!(blocks_per_group >= 16, "block group too small");
        let group_count = (block_count + blocks_per_group - 1) / blocks_per_group;
        let gdt_bytes = group_count as usize * GROUP_DESC_SIZE;
        let gdt_blocks =
            ((gdt_bytes + crate::blockdev::BLOCK_SIZE - 1) / crate::blockdev::BLOCK_SIZE) as u32;
        let itb_bytes = inodes_per_group as usize * INODE_SIZE;
        let itb_per_group =
            ((itb_bytes + crate::blockdev::BLOCK_SIZE - 1) / crate::blockdev::BLOCK_SIZE) as u32;

        Self {
            block_count,
            blocks_per_group,
            inodes_per_group,
            group_count,
            gdt_blocks,
            itb_per_group,
        }
    }

    /// Split a physical block number into (group, offset within group).
    #[inline]
    pub fn group_of(&self, p: Pblk) -> (u32, u32) {
        (p / self.blocks_per_group, p % self.blocks_per_group)
    }

    /// First physical block of a group.
    #[inline]
    pub fn group_first_block(&self, group: u32) -> Pblk {
        group * self.blocks_per_group
    }

    /// Number of blocks actually present in a group (the last one may be
    /// short).
    pub fn blocks_in_group(&self, group: u32) -> u32 {
        let first = self.group_first_block(group);
        (self.block_count - first).min(self.blocks_per_group)
    }

    /// Canonical placement of a group's metadata blocks. Group 0 starts
    /// after the superblock and the group-descriptor table.
    pub fn group_meta(&self, group: u32) -> GroupMeta {
        let first = self.group_first_block(group);
        let skip = if group == 0 { 1 + self.gdt_blocks } else { 0 };
        let block_bitmap = first + skip;
        let inode_bitmap = block_bitmap + 1;
        let inode_table = inode_bitmap + 1;
        let first_data = inode_table + self.itb_per_group;
        GroupMeta {
            block_bitmap,
            inode_bitmap,
            inode_table,
            first_data,
        }
    }

    /// Split an inode number (1-based) into (group, index within group).
    #[inline]
    pub fn inode_location(&self, ino: u32) -> (u32, u32) {
        debug_assert!(ino >= 1);
        let idx = ino - 1;
        (idx / self.inodes_per_group, idx % self.inodes_per_group)
    }

    /// Total number of inodes on the volume.
    #[inline]
    pub fn inode_count(&self) -> u32 {
        self.group_count * self.inodes_per_group
    }

    /// Inode-table block and byte offset for an inode, given the group's
    /// inode-table start.
    pub fn inode_slot(&self, inode_table: Pblk, index_in_group: u32) -> (Pblk, usize) {
        let per_block = (crate::blockdev::BLOCK_SIZE / INODE_SIZE) as u32;
        let block = inode_table + index_in_group / per_block;
        let offset = (index_in_group % per_block) as usize * INODE_SIZE;
        (block, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_group_geometry() {
        let layout = Layout::new(256, 64, 32);
        assert_eq!(layout.group_count, 4);
        assert_eq!(layout.gdt_blocks, 1);
        assert_eq!(layout.itb_per_group, 1);

        let g0 = layout.group_meta(0);
        assert_eq!(g0.block_bitmap, 2);
        assert_eq!(g0.inode_bitmap, 3);
        assert_eq!(g0.inode_table, 4);
        assert_eq!(g0.first_data, 5);

        let g1 = layout.group_meta(1);
        assert_eq!(g1.block_bitmap, 64);
        assert_eq!(g1.first_data, 67);
    }

    #[test]
    fn test_snapshot_shift_roundtrip() {
        for p in [0u32, 1, 63, 4095] {
            assert_eq!(snapshot_pblk(snapshot_iblock(p)), p);
        }
        assert_eq!(snapshot_iblock(0), SNAPSHOT_RESERVED_BLOCKS);
    }

    #[test]
    fn test_inode_location() {
        let layout = Layout::new(256, 64, 32);
        assert_eq!(layout.inode_location(1), (0, 0));
        assert_eq!(layout.inode_location(32), (0, 31));
        assert_eq!(layout.inode_location(33), (1, 0));

        let (blk, off) = layout.inode_slot(4, 3);
        assert_eq!(blk, 4);
        assert_eq!(off, 3 * INODE_SIZE);
    }
}
