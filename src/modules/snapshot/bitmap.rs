//! Per-group COW-bitmap cache and exclude-bitmap machinery.
//!
//! The COW bitmap of a group is the snapshot's point-in-time view of the
//! group's block bitmap: `block_bitmap AND NOT exclude_bitmap`, captured at
//! take time. It is materialized lazily, at most once per (group, active
//! snapshot), through a three-state rendezvous on the group's in-memory
//! `cow_bitmap` slot:
//!
//! * `0`: nobody has materialized this group yet;
//! * `== block_bitmap`: a task claimed materialization and is working;
//! * anything else: the committed snapshot-file block holding the bitmap.
//!
//! Losers of the claim busy-wait with short sleeps. The event happens at
//! most once per group per snapshot lifetime, so a wait queue would buy
//! nothing.

use std::sync::Arc;
use std::time::Duration;

use crate::blockdev::BLOCK_SIZE;
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::format::INO_EXCLUDE;
use crate::inode::{AllocIntent, InodeHandle, MapInsert};
use crate::layout::{snapshot_iblock, Pblk};
use crate::modules::journaling::{access, Transaction, COW_CREDITS};
use crate::volume::Volume;

/// How long a loser of the materialization claim sleeps between polls.
const RENDEZVOUS_SLEEP: Duration = Duration::from_millis(1);

/// The group's exclude-bitmap buffer (a data block of the exclude inode).
pub async fn read_exclude_bitmap(vol: &Volume, group: u32) -> Result<Arc<Buffer>> {
    let desc = vol.group(group).desc();
    if desc.exclude_bitmap == 0 {
        return Err(Error::Corrupt(format!(
            "group {} has no exclude bitmap",
            group
        )));
    }
    Ok(vol.buffers().read(desc.exclude_bitmap).await?)
}

/// Idempotently set `count` exclude bits starting at physical block
/// `start`; the run must stay within one group. Returns how many bits were
/// newly set. Journaled.
pub async fn exclude_blocks(vol: &Volume, txn: &Transaction, start: Pblk, count: u32) -> Result<u32> {
    let (group, off) = vol.layout().group_of(start);
    debug_assert!(off + count <= vol.layout().blocks_per_group);

    let exclude_inode = vol.get_inode(INO_EXCLUDE).await?;
    let buf = read_exclude_bitmap(vol, group).await?;
    access::get_write_access(vol, txn, Some(&exclude_inode), &buf).await?;

    let newly_set = {
        let mut data = buf.data_mut();
        let mut newly_set = 0;
        for i in 0..count {
            let bit = off + i;
            let byte = &mut data[(bit / 8) as usize];
            let mask = 1 << (bit % 8);
            if *byte & mask == 0 {
                *byte |= mask;
                newly_set += 1;
            }
        }
        newly_set
    };
    if newly_set > 0 {
        vol.journal().dirty_metadata(txn, &buf);
    }
    log::debug!(
        "exclude: group {} blocks {}..{} ({} newly set)",
        group,
        start,
        start + count,
        newly_set
    );
    Ok(newly_set)
}

/// Clear exclude bits for a run of blocks (they stopped belonging to a
/// snapshot file, i.e. the file is being torn down). Returns how many bits
/// were actually cleared.
pub async fn unexclude_blocks(
    vol: &Volume,
    txn: &Transaction,
    start: Pblk,
    count: u32,
) -> Result<u32> {
    let (group, off) = vol.layout().group_of(start);
    debug_assert!(off + count <= vol.layout().blocks_per_group);

    let exclude_inode = vol.get_inode(INO_EXCLUDE).await?;
    let buf = read_exclude_bitmap(vol, group).await?;
    access::get_write_access(vol, txn, Some(&exclude_inode), &buf).await?;

    let cleared = {
        let mut data = buf.data_mut();
        let mut cleared = 0;
        for i in 0..count {
            let bit = off + i;
            let byte = &mut data[(bit / 8) as usize];
            let mask = 1 << (bit % 8);
            if *byte & mask != 0 {
                *byte &= !mask;
                cleared += 1;
            }
        }
        cleared
    };
    if cleared > 0 {
        vol.journal().dirty_metadata(txn, &buf);
    }
    Ok(cleared)
}

enum ClaimState {
    Claimed,
    Busy,
    Done(Pblk),
}

/// The COW bitmap of `group` for the active snapshot, materializing it on
/// first use. Concurrent callers rendezvous on the group's slot; exactly
/// one performs the copy.
pub async fn read_cow_bitmap(
    vol: &Volume,
    txn: &Transaction,
    snapshot: &Arc<InodeHandle>,
    group: u32,
) -> Result<Arc<Buffer>> {
    let desc = vol.group(group).desc();

    loop {
        let state = {
            let mut slot = vol.group(group).cow_slot().lock();
            if *slot == 0 {
                // Claim materialization with the in-progress marker.
                *slot = desc.block_bitmap;
                ClaimState::Claimed
            } else if *slot == desc.block_bitmap {
                ClaimState::Busy
            } else {
                ClaimState::Done(*slot)
            }
        };

        match state {
            ClaimState::Done(blk) => return Ok(vol.buffers().read(blk).await?),
            ClaimState::Busy => tokio::time::sleep(RENDEZVOUS_SLEEP).await,
            ClaimState::Claimed => break,
        }
    }

    let result = materialize(vol, txn, snapshot, group).await;
    match result {
        Ok(blk) => {
            {
                let mut slot = vol.group(group).cow_slot().lock();
                *slot = blk;
            }
            log::debug!("cow bitmap: group {} materialized at block {}", group, blk);
            Ok(vol.buffers().read(blk).await?)
        }
        Err(e) => {
            // Reset so a later caller may retry.
            let mut slot = vol.group(group).cow_slot().lock();
            *slot = 0;
            Err(e)
        }
    }
}

async fn materialize(
    vol: &Volume,
    txn: &Transaction,
    snapshot: &Arc<InodeHandle>,
    group: u32,
) -> Result<Pblk> {
    let desc = vol.group(group).desc();
    let _cow = txn.enter_cow();
    vol.journal().charge(txn, COW_CREDITS);

    // The COW bitmap lives in the snapshot file at the position of the
    // group's block bitmap; take may have pre-copied it there already.
    let iblk = snapshot_iblock(desc.block_bitmap);
    let blk = match vol
        .map_insert(
            txn,
            snapshot,
            iblk,
            AllocIntent::Alloc {
                goal: desc.block_bitmap,
            },
        )
        .await?
    {
        MapInsert::New(p) | MapInsert::Existing(p) => p,
    };

    // The snapshot reflects committed state: prefer the journal's frozen
    // copies of both bitmaps over the live buffers.
    let bb = vol.buffers().read(desc.block_bitmap).await?;
    let live = match vol.journal().committed_copy(desc.block_bitmap) {
        Some(frozen) => frozen,
        None => bb.copy_out(),
    };
    let excl_buf = read_exclude_bitmap(vol, group).await?;
    let excl = match vol.journal().committed_copy(desc.exclude_bitmap) {
        Some(frozen) => frozen,
        None => excl_buf.copy_out(),
    };

    let dst = vol.buffers().getblk(blk);
    {
        let mut d = dst.data_mut();
        for i in 0..BLOCK_SIZE {
            d[i] = live[i] & !excl[i];
        }
    }
    dst.mark_uptodate();
    vol.journal().dirty_data(txn, &dst);

    // The block bitmap itself is handled for this transaction.
    bb.set_cow_tid(txn.id());

    Ok(blk)
}

/// Synthesize the snapshot's point-in-time view of a group's block bitmap
/// into `dst`. Used by the image read router when a reader reads the
/// block-bitmap block through to the live device.
pub async fn read_block_bitmap_for_image(vol: &Volume, group: u32, dst: &mut [u8]) -> Result<()> {
    debug_assert_eq!(dst.len(), BLOCK_SIZE);
    let desc = vol.group(group).desc();

    if let Some(active) = vol.active_snapshot() {
        // A materialized COW bitmap is exactly the image's bitmap.
        let slot = *vol.group(group).cow_slot().lock();
        if slot != 0 && slot != desc.block_bitmap {
            let buf = vol.buffers().read(slot).await?;
            dst.copy_from_slice(&buf.data()[..]);
            return Ok(());
        }
        if let Some(blk) = vol
            .map_block(&active, snapshot_iblock(desc.block_bitmap))
            .await?
        {
            let buf = vol.buffers().read(blk).await?;
            dst.copy_from_slice(&buf.data()[..]);
            return Ok(());
        }
    }

    // Not materialized: compute the view from the committed bitmaps
    // without allocating anything.
    let bb = vol.buffers().read(desc.block_bitmap).await?;
    let live = match vol.journal().committed_copy(desc.block_bitmap) {
        Some(frozen) => frozen,
        None => bb.copy_out(),
    };
    let excl_buf = read_exclude_bitmap(vol, group).await?;
    let excl = match vol.journal().committed_copy(desc.exclude_bitmap) {
        Some(frozen) => frozen,
        None => excl_buf.copy_out(),
    };
    for i in 0..BLOCK_SIZE {
        dst[i] = live[i] & !excl[i];
    }
    Ok(())
}

/// Test the COW bit of `start` and measure how many following blocks share
/// the same bit value (within the group, capped at `max`). Range-aware
/// helper for move-on-write.
pub async fn cow_bit_run(
    vol: &Volume,
    txn: &Transaction,
    snapshot: &Arc<InodeHandle>,
    start: Pblk,
    max: u32,
) -> Result<(bool, u32)> {
    let (group, off) = vol.layout().group_of(start);
    let bitmap = read_cow_bitmap(vol, txn, snapshot, group).await?;
    let in_group = vol.layout().blocks_in_group(group);

    let data = bitmap.data();
    let bit_at = |o: u32| data[(o / 8) as usize] & (1 << (o % 8)) != 0;
    let first = bit_at(off);
    let mut run = 1;
    while run < max && off + run < in_group && bit_at(off + run) == first {
        run += 1;
    }
    Ok((first, run))
}

/// Forget every group's COW bitmap so the next access re-materializes
/// against the new active snapshot. Called at take.
pub fn reset_cow_caches(vol: &Volume) {
    for g in 0..vol.layout().group_count {
        *vol.group(g).cow_slot().lock() = 0;
    }
    log::debug!("cow bitmap: caches reset for new active snapshot");
}
