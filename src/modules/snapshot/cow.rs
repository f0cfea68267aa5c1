//! The copy-on-write decision engine and its move-on-write variant.
//!
//! `test_and_cow` is the single choke point every metadata overwrite and
//! every block free passes through before it may touch a block the active
//! snapshot still preserves. `test_and_move` is the data-block variant: it
//! re-parents whole block runs into the snapshot file instead of copying.
//!
//! Concurrent COWers of the same block serialize through the snapshot-file
//! allocator: exactly one caller sees `MapInsert::New` and performs the
//! copy; everyone else falls through the already-mapped path and waits on
//! the buffer's pending-COW counter until the winner finishes.

use std::sync::Arc;
use std::time::Duration;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::format::INO_EXCLUDE;
use crate::inode::{AllocIntent, InodeHandle, MapInsert};
use crate::layout::{snapshot_iblock, Lblk, Pblk};
use crate::modules::journaling::{Transaction, COW_CREDITS};
use crate::modules::snapshot::bitmap;
use crate::volume::Volume;

/// Sleep between polls while waiting out a concurrent copy or a tracked
/// read. The events are rare (at most one copy per block per snapshot), so
/// a wait queue is not cost justified.
const COW_SLEEP: Duration = Duration::from_millis(1);

async fn wait_pending_cow(buf: &Buffer) {
    while buf.pending_cow() > 0 {
        tokio::time::sleep(COW_SLEEP).await;
    }
}

/// Decide whether `buf` must be preserved for the active snapshot before
/// the caller mutates or frees it, and if so, copy it out exactly once.
///
/// `inode` identifies the owning inode for data and block-map writes;
/// `None` means global metadata. With `may_cow == false` the call only
/// probes and reports `Error::NeedsCow` instead of copying.
pub async fn test_and_cow(
    vol: &Volume,
    txn: &Transaction,
    inode: Option<&Arc<InodeHandle>>,
    buf: &Arc<Buffer>,
    may_cow: bool,
) -> Result<()> {
    // Fast paths, in order.
    let snapshot = match vol.active_snapshot() {
        Some(s) => s,
        None => return Ok(()),
    };
    if txn.is_cowing() {
        // Blocks we allocate while copying are not themselves preserved.
        return Ok(());
    }
    if let Some(h) = inode {
        if h.ino == snapshot.ino {
            // The active snapshot is writable only through the copy path.
            return Err(Error::NotPermitted("active snapshot file is immutable"));
        }
        if h.ino == INO_EXCLUDE {
            return Ok(());
        }
    }
    if buf.cow_tid() == txn.id() {
        return Ok(());
    }

    // Bitmap test: was the block in use at take time?
    let (group, offset) = vol.layout().group_of(buf.block());
    let cow_bitmap = bitmap::read_cow_bitmap(vol, txn, &snapshot, group).await?;
    let in_use = {
        let data = cow_bitmap.data();
        data[(offset / 8) as usize] & (1 << (offset % 8)) != 0
    };
    if !in_use {
        buf.set_cow_tid(txn.id());
        return Ok(());
    }
    if inode.map_or(false, |h| h.is_snapfile()) {
        // Snapshot-owned blocks are masked out of the COW bitmap when the
        // exclude bitmap is intact; a set bit here means it is not.
        vol.exclude_inconsistency(group, buf.block()).await;
        return Err(Error::ExcludeInconsistent {
            group,
            block: buf.block(),
        });
    }

    // Already mapped: another COWer won; rendezvous with its copy.
    let iblk = snapshot_iblock(buf.block());
    if vol.map_block(&snapshot, iblk).await?.is_some() {
        wait_pending_cow(buf).await;
        buf.set_cow_tid(txn.id());
        return Ok(());
    }

    if !may_cow {
        return Err(Error::NeedsCow);
    }

    // Perform the copy.
    let _cow = txn.enter_cow();
    vol.journal().charge(txn, COW_CREDITS);

    if !buf.is_uptodate() {
        vol.buffers().ensure_uptodate(buf).await?;
        if !buf.is_uptodate() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "source buffer unreadable during copy-out",
            )));
        }
    }

    buf.pending_cow_inc();
    let result = cow_copy(vol, txn, &snapshot, buf, iblk).await;
    buf.pending_cow_dec();

    match result {
        Ok(true) => {
            log::debug!(
                "cow: block {} copied into snapshot {}",
                buf.block(),
                snapshot.ino
            );
            buf.set_cow_tid(txn.id());
            Ok(())
        }
        Ok(false) => {
            // Lost the allocation race; wait for the winner's copy.
            wait_pending_cow(buf).await;
            buf.set_cow_tid(txn.id());
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Copy `src` into the snapshot at `iblk`. Returns `Ok(true)` if this call
/// performed the copy, `Ok(false)` if a concurrent caller already owned the
/// mapping.
async fn cow_copy(
    vol: &Volume,
    txn: &Transaction,
    snapshot: &Arc<InodeHandle>,
    src: &Arc<Buffer>,
    iblk: Lblk,
) -> Result<bool> {
    let dst_blk = match vol
        .map_insert(
            txn,
            snapshot,
            iblk,
            AllocIntent::Alloc { goal: src.block() },
        )
        .await?
    {
        MapInsert::New(p) => p,
        MapInsert::Existing(_) => return Ok(false),
    };

    // Let in-flight tracked reads of the source drain before duplicating.
    while src.tracked_readers() > 0 {
        tokio::time::sleep(COW_SLEEP).await;
    }

    let dst = vol.buffers().getblk(dst_blk);
    {
        let data = src.data();
        dst.data_mut().copy_from_slice(&data[..]);
    }
    dst.mark_uptodate();
    vol.journal().dirty_data(txn, &dst);
    if vol.config().sync_cow {
        vol.buffers().write_back(&dst).await?;
    }
    Ok(true)
}

/// Data-block move-on-write over a range.
///
/// Examines up to `maxblocks` blocks starting at `start` that belong to
/// `inode`. Returns the number of blocks transferred into the active
/// snapshot (or, for the probe variant with `may_move == false`, the number
/// that would need to be). `Ok(0)` means the leading block needs no
/// preservation and the caller may overwrite or free it in place.
pub async fn test_and_move(
    vol: &Volume,
    txn: &Transaction,
    inode: &Arc<InodeHandle>,
    start: Pblk,
    maxblocks: u32,
    may_move: bool,
) -> Result<u32> {
    let snapshot = match vol.active_snapshot() {
        Some(s) => s,
        None => return Ok(0),
    };
    if txn.is_cowing() {
        return Ok(0);
    }
    if inode.ino == snapshot.ino {
        return Err(Error::NotPermitted("active snapshot file is immutable"));
    }
    if inode.ino == INO_EXCLUDE {
        return Ok(0);
    }

    let (in_use, run) = bitmap::cow_bit_run(vol, txn, &snapshot, start, maxblocks).await?;
    if !in_use {
        return Ok(0);
    }
    if inode.is_snapfile() {
        let (group, _) = vol.layout().group_of(start);
        vol.exclude_inconsistency(group, start).await;
        return Err(Error::ExcludeInconsistent {
            group,
            block: start,
        });
    }

    // Clamp to the prefix not yet preserved in the snapshot.
    let mut count = 0;
    while count < run {
        if vol
            .map_block(&snapshot, snapshot_iblock(start + count))
            .await?
            .is_some()
        {
            break;
        }
        count += 1;
    }
    if count == 0 {
        // The leading block is already preserved; make sure its copy is
        // complete before the caller touches the original.
        let src = vol.buffers().getblk(start);
        wait_pending_cow(&src).await;
        return Ok(0);
    }

    if !may_move {
        return Ok(count);
    }

    let moved = {
        let _cow = txn.enter_cow();
        vol.journal().charge(txn, COW_CREDITS);

        let mut moved = 0;
        while moved < count {
            let p = start + moved;
            match vol
                .map_insert(txn, &snapshot, snapshot_iblock(p), AllocIntent::Move(p))
                .await?
            {
                MapInsert::New(_) => moved += 1,
                MapInsert::Existing(_) => break,
            }
        }
        if moved > 0 {
            // Moved blocks now belong to the snapshot file.
            bitmap::exclude_blocks(vol, txn, start, moved).await?;
        }
        moved
    };

    if moved > 0 {
        // Quota: the snapshot owner was charged at map time; debit the live
        // inode for what it gave up. Flushed outside the re-entrancy guard
        // so the inode-table block still gets its own copy-out.
        inode.update(|i| i.blocks = i.blocks.saturating_sub(moved));
        vol.flush_inode(txn, inode).await?;
        log::debug!(
            "mow: {} block(s) at {} re-parented into snapshot {}",
            moved,
            start,
            snapshot.ino
        );
    }

    Ok(moved)
}
