//! Snapshot-image read router.
//!
//! A snapshot file is sparse: it only holds the blocks that were copied or
//! moved into it while it was active. Reads of missing blocks route to the
//! next newer snapshot on the chain, and from the active snapshot through
//! to the live block device. Snapshot files are never writable through any
//! read/write surface; the copy engine is the only writer.

use std::sync::Arc;

use crate::blockdev::BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::format::iflags;
use crate::inode::InodeHandle;
use crate::layout::{snapshot_pblk, Lblk, SNAPSHOT_RESERVED_BLOCKS};
use crate::modules::snapshot::bitmap;
use crate::volume::Volume;

/// Read one logical block of a snapshot file, routing across the chain.
pub async fn read_snapshot_block(
    vol: &Volume,
    snapshot: &Arc<InodeHandle>,
    lblk: Lblk,
) -> Result<Box<[u8; BLOCK_SIZE]>> {
    if !snapshot.has_flag(iflags::ON_LIST) {
        // A snapshot mid-creation still points at the old chain head; any
        // other unlinked inode is stale and must not be read.
        let head = vol.snapshots().head().unwrap_or(0);
        if snapshot.with(|i| i.next_snapshot) != head {
            return Err(Error::Stale(snapshot.ino));
        }
        return read_mapped_or_zero(vol, snapshot, lblk).await;
    }

    // The reserved header region is ordinary (sparse) file content.
    if lblk < SNAPSHOT_RESERVED_BLOCKS {
        return read_mapped_or_zero(vol, snapshot, lblk).await;
    }

    let mut cur = snapshot.clone();
    loop {
        if let Some(p) = vol.map_block(&cur, lblk).await? {
            let buf = vol.buffers().read(p).await?;
            buf.tracked_read_inc();
            let out = buf.copy_out();
            buf.tracked_read_dec();
            return Ok(out);
        }

        if cur.has_flag(iflags::ACTIVE) {
            // Miss in the active snapshot: the live volume holds the
            // current (equal to point-in-time) contents.
            return read_through(vol, lblk).await;
        }

        // Route to the next newer snapshot. Running out of chain is an
        // I/O error, and so is reaching a non-active head (the next
        // iteration sees a miss with no newer neighbor): nothing backs
        // the read-through.
        let prev = match vol.snapshots().newer_neighbor(cur.ino) {
            Some(ino) => ino,
            None => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("snapshot chain broken above inode {}", cur.ino),
                )));
            }
        };
        cur = vol.get_inode(prev).await?;
    }
}

/// Read a byte range of a snapshot image (loop-mount style access). Reads
/// past the visible size return zero bytes read; a disabled snapshot has
/// visible size 0.
pub async fn read_snapshot(
    vol: &Volume,
    snapshot: &Arc<InodeHandle>,
    offset: u64,
    out: &mut [u8],
) -> Result<usize> {
    let visible = snapshot.with(|i| i.size);
    if offset >= visible {
        return Ok(0);
    }
    let len = out.len().min((visible - offset) as usize);
    let mut done = 0usize;
    while done < len {
        let pos = offset + done as u64;
        let lblk = (pos / BLOCK_SIZE as u64) as Lblk;
        let in_block = (pos % BLOCK_SIZE as u64) as usize;
        let chunk = (BLOCK_SIZE - in_block).min(len - done);
        let block = read_snapshot_block(vol, snapshot, lblk).await?;
        out[done..done + chunk].copy_from_slice(&block[in_block..in_block + chunk]);
        done += chunk;
    }
    Ok(done)
}

async fn read_mapped_or_zero(
    vol: &Volume,
    snapshot: &Arc<InodeHandle>,
    lblk: Lblk,
) -> Result<Box<[u8; BLOCK_SIZE]>> {
    match vol.map_block(snapshot, lblk).await? {
        Some(p) => {
            let buf = vol.buffers().read(p).await?;
            Ok(buf.copy_out())
        }
        None => Ok(Box::new([0u8; BLOCK_SIZE])),
    }
}

async fn read_through(vol: &Volume, lblk: Lblk) -> Result<Box<[u8; BLOCK_SIZE]>> {
    let phys = snapshot_pblk(lblk);
    if phys >= vol.layout().block_count {
        return Ok(Box::new([0u8; BLOCK_SIZE]));
    }

    // Reading a group's block-bitmap block through must present the
    // snapshot's point-in-time bitmap, not the live one.
    let (group, _) = vol.layout().group_of(phys);
    if vol.group(group).desc().block_bitmap == phys {
        let mut out = Box::new([0u8; BLOCK_SIZE]);
        bitmap::read_block_bitmap_for_image(vol, group, &mut out[..]).await?;
        return Ok(out);
    }

    let buf = vol.buffers().read(phys).await?;
    buf.tracked_read_inc();
    let out = buf.copy_out();
    buf.tracked_read_dec();
    Ok(out)
}
