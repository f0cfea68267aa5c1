//! Block and inode allocation over the per-group on-disk bitmaps.
//!
//! Every bitmap mutation funnels through the journal access hooks, which is
//! what guarantees a bitmap block is copied into the active snapshot before
//! its first modification after a take. Concurrent allocators serialize on
//! the bitmap buffer's data lock; the scan and the bit flip happen under
//! one guard.

use crate::error::{Error, Result};
use crate::layout::Pblk;
use crate::modules::journaling::{access, Transaction};
use crate::volume::Volume;

fn bit_is_set(data: &[u8], off: u32) -> bool {
    data[(off / 8) as usize] & (1 << (off % 8)) != 0
}

fn set_bit(data: &mut [u8], off: u32) {
    data[(off / 8) as usize] |= 1 << (off % 8);
}

fn clear_bit(data: &mut [u8], off: u32) {
    data[(off / 8) as usize] &= !(1 << (off % 8));
}

impl Volume {
    /// Allocate one block, preferring the group of `goal`.
    pub async fn alloc_block(&self, txn: &Transaction, goal: Pblk) -> Result<Pblk> {
        let layout = *self.layout();
        let goal = goal.min(layout.block_count.saturating_sub(1));
        let (goal_group, goal_off) = layout.group_of(goal);

        for i in 0..layout.group_count {
            let g = (goal_group + i) % layout.group_count;
            if self.group(g).desc().free_blocks == 0 {
                continue;
            }
            let desc = self.group(g).desc();
            let bb = self.buffers().read(desc.block_bitmap).await?;
            access::get_write_access(self, txn, None, &bb).await?;

            let in_group = layout.blocks_in_group(g);
            let start = if i == 0 { goal_off } else { 0 };
            let found = {
                let mut data = bb.data_mut();
                let mut found = None;
                for probe in 0..in_group {
                    let off = (start + probe) % in_group;
                    if !bit_is_set(&data[..], off) {
                        set_bit(&mut data[..], off);
                        found = Some(off);
                        break;
                    }
                }
                found
            };

            if let Some(off) = found {
                self.journal().dirty_metadata(txn, &bb);
                self.group(g).update_desc(|d| {
                    d.free_blocks = d.free_blocks.saturating_sub(1);
                });
                self.update_superblock(|sb| {
                    sb.free_blocks = sb.free_blocks.saturating_sub(1);
                });
                let blk = layout.group_first_block(g) + off;
                log::debug!("alloc: block {} (group {})", blk, g);
                return Ok(blk);
            }
        }

        log::warn!("alloc: volume out of blocks");
        Err(Error::NoSpace)
    }

    /// Free a run of blocks in the live bitmap. The caller is responsible
    /// for having preserved (or moved) any block the active snapshot still
    /// needs, and for clearing exclude bits of snapshot-owned blocks.
    pub async fn free_blocks_raw(&self, txn: &Transaction, start: Pblk, count: u32) -> Result<()> {
        let layout = *self.layout();
        let mut blk = start;
        let end = start + count;
        while blk < end {
            let (g, off) = layout.group_of(blk);
            let in_group = layout.blocks_in_group(g);
            let run = (end - blk).min(in_group - off);

            let desc = self.group(g).desc();
            let bb = self.buffers().read(desc.block_bitmap).await?;
            access::get_undo_access(self, txn, &bb).await?;

            {
                let mut data = bb.data_mut();
                for i in 0..run {
                    if !bit_is_set(&data[..], off + i) {
                        return Err(Error::Corrupt(format!(
                            "freeing already-free block {}",
                            blk + i
                        )));
                    }
                    clear_bit(&mut data[..], off + i);
                }
            }
            self.journal().dirty_metadata(txn, &bb);
            self.group(g).update_desc(|d| {
                d.free_blocks = d.free_blocks.saturating_add(run as u16);
            });
            self.update_superblock(|sb| {
                sb.free_blocks = sb.free_blocks.saturating_add(run);
            });
            log::debug!("alloc: freed {} block(s) at {}", run, blk);

            blk += run;
        }
        Ok(())
    }

    /// Whether a physical block is allocated in the live bitmap.
    pub async fn block_allocated(&self, blk: Pblk) -> Result<bool> {
        let (g, off) = self.layout().group_of(blk);
        let desc = self.group(g).desc();
        let bb = self.buffers().read(desc.block_bitmap).await?;
        let set = bit_is_set(&bb.data()[..], off);
        Ok(set)
    }

    /// Allocate an inode number.
    pub async fn alloc_inode(&self, txn: &Transaction) -> Result<u32> {
        let layout = *self.layout();
        for g in 0..layout.group_count {
            if self.group(g).desc().free_inodes == 0 {
                continue;
            }
            let desc = self.group(g).desc();
            let ib = self.buffers().read(desc.inode_bitmap).await?;
            access::get_write_access(self, txn, None, &ib).await?;

            let found = {
                let mut data = ib.data_mut();
                let mut found = None;
                for idx in 0..layout.inodes_per_group {
                    if !bit_is_set(&data[..], idx) {
                        set_bit(&mut data[..], idx);
                        found = Some(idx);
                        break;
                    }
                }
                found
            };

            if let Some(idx) = found {
                self.journal().dirty_metadata(txn, &ib);
                self.group(g).update_desc(|d| {
                    d.free_inodes = d.free_inodes.saturating_sub(1);
                });
                self.update_superblock(|sb| {
                    sb.free_inodes = sb.free_inodes.saturating_sub(1);
                });
                let ino = g * layout.inodes_per_group + idx + 1;
                log::debug!("alloc: inode {} (group {})", ino, g);
                return Ok(ino);
            }
        }
        Err(Error::NoSpace)
    }

    /// Release an inode number.
    pub async fn free_inode(&self, txn: &Transaction, ino: u32) -> Result<()> {
        let layout = *self.layout();
        let (g, idx) = layout.inode_location(ino);
        let desc = self.group(g).desc();
        let ib = self.buffers().read(desc.inode_bitmap).await?;
        access::get_write_access(self, txn, None, &ib).await?;
        {
            let mut data = ib.data_mut();
            if !bit_is_set(&data[..], idx) {
                return Err(Error::Corrupt(format!("freeing already-free inode {}", ino)));
            }
            clear_bit(&mut data[..], idx);
        }
        self.journal().dirty_metadata(txn, &ib);
        self.group(g).update_desc(|d| {
            d.free_inodes = d.free_inodes.saturating_add(1);
        });
        self.update_superblock(|sb| {
            sb.free_inodes = sb.free_inodes.saturating_add(1);
        });
        Ok(())
    }
}
