//! Journal access hooks.
//!
//! The host filesystem calls one of these before any metadata mutation,
//! undo-style bitmap update, buffer initialization, data overwrite or block
//! free. They are the funnel that guarantees a block preserved by the
//! active snapshot is copied (or moved) out before it changes.

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::inode::InodeHandle;
use crate::layout::Pblk;
use crate::modules::journaling::{Transaction, ACCESS_CREDITS};
use crate::modules::snapshot::cow;
use crate::volume::Volume;

/// Access a buffer for modification. Performs COW when the active snapshot
/// preserves the block, then freezes the committed image for undo.
pub async fn get_write_access(
    vol: &Volume,
    txn: &Transaction,
    inode: Option<&Arc<InodeHandle>>,
    buf: &Arc<Buffer>,
) -> Result<()> {
    vol.journal().charge(txn, ACCESS_CREDITS);
    Box::pin(cow::test_and_cow(vol, txn, inode, buf, true)).await?;
    vol.journal().reserve_undo(txn, buf);
    Ok(())
}

/// Access a buffer for an undo-style update (the block bitmap is the prime
/// caller, just before bits are cleared). The COW-bitmap materialization
/// path has always copied the bitmap by the time frees happen, so an actual
/// copy being needed here means the volume is corrupt.
pub async fn get_undo_access(vol: &Volume, txn: &Transaction, buf: &Arc<Buffer>) -> Result<()> {
    vol.journal().charge(txn, ACCESS_CREDITS);
    match cow::test_and_cow(vol, txn, None, buf, false).await {
        Ok(()) => {}
        Err(Error::NeedsCow) => {
            return Err(Error::Corrupt(format!(
                "block {} still preserved by the active snapshot on the undo path",
                buf.block()
            )));
        }
        Err(e) => return Err(e),
    }
    vol.journal().reserve_undo(txn, buf);
    Ok(())
}

/// Access a freshly allocated buffer the caller is about to initialize.
/// Needing a copy here suggests blocks were freed without being copied out
/// (typically after an offline fsck); log it and copy anyway.
pub async fn get_create_access(vol: &Volume, txn: &Transaction, buf: &Arc<Buffer>) -> Result<()> {
    vol.journal().charge(txn, ACCESS_CREDITS);
    match cow::test_and_cow(vol, txn, None, buf, false).await {
        Ok(()) => {}
        Err(Error::NeedsCow) => {
            log::warn!(
                "block {} was in use by the snapshot but reallocated; copying late",
                buf.block()
            );
            cow::test_and_cow(vol, txn, None, buf, true).await?;
        }
        Err(e) => return Err(e),
    }
    vol.journal().reserve_undo(txn, buf);
    Ok(())
}

/// Access a data block of `inode` for overwrite. With move-on-write
/// enabled, ownership of the old block transfers to the snapshot and the
/// return value is 1; the caller then maps a fresh block for the new
/// contents. Returns 0 when the block may be overwritten in place.
pub async fn get_move_access(
    vol: &Volume,
    txn: &Transaction,
    inode: &Arc<InodeHandle>,
    block: Pblk,
    may_move: bool,
) -> Result<u32> {
    if vol.config().move_on_write {
        cow::test_and_move(vol, txn, inode, block, 1, may_move).await
    } else {
        // Move-on-write disabled at construction: fall back to copying the
        // data block like metadata; the caller keeps writing in place.
        let buf = vol.buffers().read(block).await?;
        cow::test_and_cow(vol, txn, Some(inode), &buf, may_move).await?;
        Ok(0)
    }
}

/// Access a run of data blocks of `inode` about to be freed. Blocks still
/// preserved by the snapshot are re-parented instead of freed; the caller
/// frees whatever this returns as not moved.
pub async fn get_delete_access(
    vol: &Volume,
    txn: &Transaction,
    inode: &Arc<InodeHandle>,
    block: Pblk,
    count: u32,
) -> Result<u32> {
    if vol.config().move_on_write {
        cow::test_and_move(vol, txn, inode, block, count, true).await
    } else {
        for i in 0..count {
            let buf = vol.buffers().read(block + i).await?;
            cow::test_and_cow(vol, txn, Some(inode), &buf, true).await?;
        }
        Ok(0)
    }
}
