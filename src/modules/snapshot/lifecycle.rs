//! Snapshot lifecycle manager.
//!
//! Every operation here runs under the chain's lifecycle mutex. `take`
//! additionally holds the journal's update barrier: with no transactions in
//! flight its writes bypass the journal, and ordering is enforced by
//! explicit syncs: the metadata copies inside the snapshot file are
//! durable before the live superblock flips the active pointer. A crash
//! between the two leaves an inert snapshot on the chain, which the next
//! `update` pass reaps as a failed take.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::blockdev::BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::format::{iflags, Inode, INO_JOURNAL, MODE_REG};
use crate::inode::{AllocIntent, InodeHandle, MapInsert};
use crate::layout::{
    snapshot_iblock, snapshot_pblk, Lblk, SNAPSHOT_GDT_LBLK, SNAPSHOT_RESERVED_BLOCKS,
    SNAPSHOT_SUPERBLOCK_LBLK,
};
use crate::modules::journaling::Transaction;
use crate::modules::snapshot::{bitmap, read};
use crate::volume::Volume;

/// Allocate a fresh, properly flagged snapshot file inode. Convenience for
/// the control surface; the inode is not yet on the chain.
pub async fn create_snapshot_file(vol: &Volume) -> Result<u32> {
    let txn = vol.begin_txn().await?;
    let result = async {
        let ino = vol.alloc_inode(&txn).await?;
        let mut inode = Inode::empty();
        inode.mode = MODE_REG;
        inode.links = 1;
        inode.flags = iflags::SNAPFILE;
        let h = Arc::new(InodeHandle::new(ino, inode));
        vol.inode_cache().lock().insert(ino, h.clone());
        vol.flush_inode(&txn, &h).await?;
        Ok(ino)
    }
    .await;
    match result {
        Ok(ino) => {
            vol.commit_txn(txn).await?;
            Ok(ino)
        }
        Err(e) => {
            vol.abort_txn(txn);
            Err(e)
        }
    }
}

/// Link an empty, snapshot-flagged inode onto the chain and pre-allocate
/// its reserved metadata blocks. The snapshot captures nothing until
/// `snapshot_take` runs.
pub async fn snapshot_create(vol: &Volume, ino: u32) -> Result<()> {
    let _lock = vol.snapshots().mutex.lock().await;
    if vol.is_read_only() {
        return Err(Error::ReadOnly);
    }

    let h = vol.get_inode(ino).await?;
    if !h.is_snapfile() {
        return Err(Error::Invalid(format!(
            "inode {} is not flagged as a snapshot file",
            ino
        )));
    }
    if h.has_flag(iflags::ON_LIST) {
        return Err(Error::Invalid(format!("inode {} is already on the chain", ino)));
    }
    if h.with(|i| i.blocks != 0 || i.size != 0) {
        return Err(Error::Invalid(format!("inode {} is not empty", ino)));
    }
    // A chain head that was never activated is a take in progress (or a
    // failed one nobody reaped yet).
    if let Some(head) = vol.snapshots().head() {
        let head_h = vol.get_inode(head).await?;
        if !head_h.has_flag(iflags::ACTIVE) {
            return Err(Error::Invalid(
                "the newest snapshot on the chain was never activated".into(),
            ));
        }
    }
    let sb = vol.superblock();
    if sb.free_blocks < sb.snapshot_reserved_blocks {
        return Err(Error::NoSpace);
    }

    let txn = vol.begin_txn().await?;
    let result = create_locked(vol, &txn, &h).await;
    match result {
        Ok(()) => vol.commit_txn(txn).await?,
        Err(e) => {
            vol.abort_txn(txn);
            return Err(e);
        }
    }

    vol.snapshots().push_head(ino);
    vol.write_superblock().await?;
    log::info!(
        "snapshot {}: created (id {})",
        ino,
        h.generation()
    );
    Ok(())
}

async fn create_locked(vol: &Volume, txn: &Transaction, h: &Arc<InodeHandle>) -> Result<()> {
    let sb = vol.superblock();
    let layout = *vol.layout();

    h.update(|i| {
        i.generation = sb.snapshot_id + 1;
        i.disksize = sb.block_count as u64 * BLOCK_SIZE as u64;
        i.size = 0;
        i.flags |= iflags::ON_LIST;
        i.flags &= !iflags::ENABLED;
        i.next_snapshot = sb.last_snapshot_ino;
    });
    vol.flush_inode(txn, h).await?;

    vol.update_superblock(|s| {
        s.last_snapshot_ino = h.ino;
        s.features_ro_compat |= crate::format::features::RO_HAS_SNAPSHOT;
    });

    // Pre-allocate the reserved header: superblock copy plus the group
    // descriptor copy blocks.
    let mut preallocated = 0u32;
    prealloc(vol, txn, h, SNAPSHOT_SUPERBLOCK_LBLK, 0).await?;
    for i in 0..layout.gdt_blocks {
        let lblk = SNAPSHOT_GDT_LBLK + i;
        if lblk >= SNAPSHOT_RESERVED_BLOCKS {
            return Err(Error::Invalid(
                "group descriptor table exceeds the reserved snapshot header".into(),
            ));
        }
        prealloc(vol, txn, h, lblk, 1 + i).await?;
    }

    // Critical-path blocks for every snapshot inode on the chain (this one
    // included) and for the journal inode: the take pass must be able to
    // copy each one's block bitmap, inode bitmap and inode-table block
    // without allocating under the freeze.
    let mut targets = vol.snapshots().snapshot_list();
    targets.push(h.ino);
    targets.push(INO_JOURNAL);
    let mut seen_groups: HashSet<u32> = HashSet::new();
    for tino in targets {
        let (group, idx) = layout.inode_location(tino);
        let desc = vol.group(group).desc();
        let (itb_blk, _) = layout.inode_slot(desc.inode_table, idx);
        let wanted = if seen_groups.insert(group) {
            vec![desc.block_bitmap, desc.inode_bitmap, itb_blk]
        } else {
            vec![itb_blk]
        };
        for blk in wanted {
            prealloc(vol, txn, h, snapshot_iblock(blk), blk).await?;
            preallocated += 1;
            // A large create is split into bounded transactions; the
            // journal hands the handle a fresh budget each time.
            if preallocated % 4 == 0 {
                vol.journal().restart(txn).await?;
            }
        }
    }

    Ok(())
}

async fn prealloc(
    vol: &Volume,
    txn: &Transaction,
    h: &Arc<InodeHandle>,
    lblk: Lblk,
    goal: u32,
) -> Result<()> {
    match vol
        .map_insert(txn, h, lblk, AllocIntent::Alloc { goal })
        .await?
    {
        MapInsert::New(p) => {
            let buf = vol.buffers().getblk(p);
            buf.data_mut().fill(0);
            buf.mark_uptodate();
            vol.journal().dirty_data(txn, &buf);
        }
        MapInsert::Existing(_) => {}
    }
    Ok(())
}

/// Capture the volume into the chain head: freeze, patch the metadata
/// copies, flip the active pointer, thaw.
pub async fn snapshot_take(vol: &Volume, ino: u32) -> Result<()> {
    let _lock = vol.snapshots().mutex.lock().await;
    if vol.is_read_only() {
        return Err(Error::ReadOnly);
    }

    let h = vol.get_inode(ino).await?;
    if !h.is_snapfile() || !h.has_flag(iflags::ON_LIST) {
        return Err(Error::Invalid(format!("inode {} is not a chained snapshot", ino)));
    }
    if vol.snapshots().head() != Some(ino) {
        return Err(Error::Invalid("only the chain head can be taken".into()));
    }
    if h.has_flag(iflags::ACTIVE) {
        return Err(Error::Invalid(format!("snapshot {} is already active", ino)));
    }
    if h.has_flag(iflags::DELETED) {
        return Err(Error::NotPermitted("take of a deleted snapshot"));
    }
    let sb = vol.superblock();
    if sb.free_blocks < sb.snapshot_reserved_blocks {
        return Err(Error::NoSpace);
    }

    let freeze = vol.journal().lock_updates().await;
    let result = take_frozen(vol, &h).await;
    drop(freeze);

    match result {
        Ok(()) => {
            log::info!("snapshot {}: taken (id {})", ino, h.generation());
            Ok(())
        }
        Err(e) => {
            // The inode stays on the chain without the active flag; the
            // next update pass cleans it up as a failed take.
            log::warn!("snapshot {}: take failed: {}", ino, e);
            Err(e)
        }
    }
}

async fn take_frozen(vol: &Volume, h: &Arc<InodeHandle>) -> Result<()> {
    let layout = *vol.layout();

    // Everything below bypasses the journal; retire the log first so a
    // crash-replay cannot regress these writes with stale images.
    vol.journal().checkpoint().await?;

    // Patched superblock copy at logical block 0: the image presents as a
    // stand-alone, journal-less, snapshot-less read-only filesystem.
    let mut sb_copy = vol.superblock();
    sb_copy.patch_for_image();
    write_snapshot_block(vol, h, SNAPSHOT_SUPERBLOCK_LBLK, &sb_copy.to_block()).await?;

    // Group-descriptor copies.
    for i in 0..layout.gdt_blocks {
        let gdt = vol.buffers().read(1 + i).await?;
        let image = gdt.copy_out();
        write_snapshot_block(vol, h, SNAPSHOT_GDT_LBLK + i, &image[..]).await?;
    }

    // Bitmap and inode-table copies for every chained snapshot inode and
    // the journal inode, patched so the image is self-consistent: snapshot
    // blocks read as unallocated, the journal inode reads as absent.
    let mut staged: HashMap<Lblk, [u8; BLOCK_SIZE]> = HashMap::new();
    let mut targets = vol.snapshots().snapshot_list();
    targets.push(INO_JOURNAL);

    for tino in targets {
        let (group, idx) = layout.inode_location(tino);
        let desc = vol.group(group).desc();

        // Block bitmap masked by the exclude bitmap: exactly the group's
        // COW bitmap at this instant.
        let bb_lblk = snapshot_iblock(desc.block_bitmap);
        if !staged.contains_key(&bb_lblk) {
            let bb = vol.buffers().read(desc.block_bitmap).await?;
            let excl = bitmap::read_exclude_bitmap(vol, group).await?;
            let mut masked = [0u8; BLOCK_SIZE];
            {
                let b = bb.data();
                let e = excl.data();
                for i in 0..BLOCK_SIZE {
                    masked[i] = b[i] & !e[i];
                }
            }
            staged.insert(bb_lblk, masked);
        }

        let ib_lblk = snapshot_iblock(desc.inode_bitmap);
        if !staged.contains_key(&ib_lblk) {
            let ib = vol.buffers().read(desc.inode_bitmap).await?;
            staged.insert(ib_lblk, *ib.copy_out());
        }

        let (itb_blk, slot_off) = layout.inode_slot(desc.inode_table, idx);
        let itb_lblk = snapshot_iblock(itb_blk);
        if !staged.contains_key(&itb_lblk) {
            let itb = vol.buffers().read(itb_blk).await?;
            staged.insert(itb_lblk, *itb.copy_out());
        }
        let image = staged.get_mut(&itb_lblk).expect("staged above");
        if tino == INO_JOURNAL {
            // The image has no journal.
            image[slot_off..slot_off + crate::layout::INODE_SIZE].fill(0);
        } else {
            // Prune the snapshot inode's block pointers so its blocks
            // appear unallocated in the image.
            let mut copy = Inode::read_from(&mut std::io::Cursor::new(
                &image[slot_off..slot_off + crate::layout::INODE_SIZE],
            ))?;
            copy.block = [0; 15];
            copy.blocks = 0;
            copy.size = 0;
            let mut bytes = [0u8; crate::layout::INODE_SIZE];
            copy.write_to(&mut std::io::Cursor::new(&mut bytes[..]))?;
            image[slot_off..slot_off + crate::layout::INODE_SIZE].copy_from_slice(&bytes);
        }
    }

    for (lblk, image) in &staged {
        write_snapshot_block(vol, h, *lblk, &image[..]).await?;
    }

    // The copies must be durable before the superblock points at them.
    vol.device().sync().await?;

    vol.update_superblock(|s| {
        s.snapshot_id += 1;
        s.active_snapshot_ino = h.ino;
        s.state &= !crate::format::state::RECOVER;
    });
    // COW redirects here from now on; the predecessor stops being the
    // read-through endpoint.
    if let Some(prev) = vol.active_snapshot() {
        if prev.ino != h.ino {
            prev.clear_flags(iflags::ACTIVE);
            flush_inode_direct(vol, &prev).await?;
        }
    }
    h.set_flags(iflags::ACTIVE);
    flush_inode_direct(vol, h).await?;
    vol.snapshots().set_active(Some(h.clone()));

    // Forget every group's COW bitmap; the new snapshot re-materializes
    // them lazily.
    bitmap::reset_cow_caches(vol);

    vol.write_superblock().await?;
    vol.device().sync().await?;
    Ok(())
}

/// Direct (journal-bypassing) write of one pre-allocated snapshot block.
async fn write_snapshot_block(
    vol: &Volume,
    h: &Arc<InodeHandle>,
    lblk: Lblk,
    data: &[u8],
) -> Result<()> {
    let p = vol
        .map_block(h, lblk)
        .await?
        .ok_or_else(|| Error::Corrupt(format!("snapshot block {} was not pre-allocated", lblk)))?;
    let buf = vol.buffers().getblk(p);
    buf.fill(data);
    vol.buffers().write_back(&buf).await?;
    Ok(())
}

/// Direct write of an inode slot (take path only; no transactions are in
/// flight under the freeze).
async fn flush_inode_direct(vol: &Volume, h: &Arc<InodeHandle>) -> Result<()> {
    let layout = *vol.layout();
    let (group, idx) = layout.inode_location(h.ino);
    let desc = vol.group(group).desc();
    let (blk, off) = layout.inode_slot(desc.inode_table, idx);
    let buf = vol.buffers().read(blk).await?;
    {
        let image = h.with(|inode| {
            let mut bytes = [0u8; crate::layout::INODE_SIZE];
            inode
                .write_to(&mut std::io::Cursor::new(&mut bytes[..]))
                .expect("inode fits its slot");
            bytes
        });
        buf.data_mut()[off..off + crate::layout::INODE_SIZE].copy_from_slice(&image);
    }
    buf.mark_dirty();
    vol.buffers().write_back(&buf).await?;
    Ok(())
}

/// Make a snapshot user visible (loop mountable).
pub async fn snapshot_enable(vol: &Volume, ino: u32) -> Result<()> {
    let _lock = vol.snapshots().mutex.lock().await;
    if vol.is_read_only() {
        return Err(Error::ReadOnly);
    }
    let h = vol.get_inode(ino).await?;
    if !h.has_flag(iflags::ON_LIST) {
        return Err(Error::NotPermitted("enable of an unlinked snapshot"));
    }
    if h.has_flag(iflags::DELETED) {
        return Err(Error::NotPermitted("enable of a deleted snapshot"));
    }
    h.set_flags(iflags::ENABLED);
    h.update(|i| i.size = i.disksize);
    persist_flags(vol, &h).await?;
    log::info!("snapshot {}: enabled", ino);
    update_locked(vol, true).await
}

/// Hide a snapshot from users; its pages above the header are dropped.
pub async fn snapshot_disable(vol: &Volume, ino: u32) -> Result<()> {
    let _lock = vol.snapshots().mutex.lock().await;
    if vol.is_read_only() {
        return Err(Error::ReadOnly);
    }
    let h = vol.get_inode(ino).await?;
    if h.open_count() > 0 {
        return Err(Error::NotPermitted("disable of an open snapshot"));
    }
    h.clear_flags(iflags::ENABLED);
    h.update(|i| i.size = 0);
    // Page-cache invalidation above the header region.
    for (lblk, p) in vol.mapped_blocks(&h).await? {
        if lblk >= SNAPSHOT_RESERVED_BLOCKS {
            vol.buffers().discard(p);
        }
    }
    persist_flags(vol, &h).await?;
    log::info!("snapshot {}: disabled", ino);
    update_locked(vol, true).await
}

/// Request removal; the update pass reaps the snapshot when nothing needs
/// it anymore.
pub async fn snapshot_delete(vol: &Volume, ino: u32) -> Result<()> {
    let _lock = vol.snapshots().mutex.lock().await;
    if vol.is_read_only() {
        return Err(Error::ReadOnly);
    }
    let h = vol.get_inode(ino).await?;
    if h.has_flag(iflags::ENABLED) {
        return Err(Error::NotPermitted("delete of an enabled snapshot"));
    }
    if !h.has_flag(iflags::ON_LIST) {
        return Err(Error::Invalid(format!("inode {} is not on the chain", ino)));
    }
    h.set_flags(iflags::DELETED);
    persist_flags(vol, &h).await?;
    log::info!("snapshot {}: marked deleted", ino);
    update_locked(vol, true).await
}

async fn persist_flags(vol: &Volume, h: &Arc<InodeHandle>) -> Result<()> {
    if vol.is_read_only() {
        return Ok(());
    }
    let txn = vol.begin_txn().await?;
    match vol.flush_inode(&txn, h).await {
        Ok(()) => vol.commit_txn(txn).await,
        Err(e) => {
            vol.abort_txn(txn);
            Err(e)
        }
    }
}

/// Run the reconciliation pass.
pub async fn snapshot_update(vol: &Volume, cleanup: bool) -> Result<()> {
    let _lock = vol.snapshots().mutex.lock().await;
    update_locked(vol, cleanup).await
}

/// The reconciliation walk: oldest to newest, recomputing dynamic flags,
/// reaping failed takes and unused deleted snapshots, shrinking and merging
/// runs of deleted snapshots between survivors.
async fn update_locked(vol: &Volume, cleanup: bool) -> Result<()> {
    let read_only = vol.is_read_only();
    let active = vol.active_snapshot();
    let active_gen = active.as_ref().map(|a| a.generation());
    let sb_active_ino = vol.superblock().active_snapshot_ino;

    let mut used_by: Option<u32> = None;
    let mut found_enabled = false;
    let mut need_shrink = 0u32;
    let mut need_merge = 0u32;
    let mut victims: Vec<u32> = Vec::new();

    let chain = vol.snapshots().snapshot_list();
    for ino in chain.iter().rev().copied() {
        let h = vol.get_inode(ino).await?;

        // Anything newer than the active snapshot is a failed take.
        let newer_than_active = match active_gen {
            None => true,
            Some(g) => h.generation() > g,
        };
        if newer_than_active {
            if cleanup && !read_only {
                log::warn!("snapshot {}: reaping failed take", ino);
                snapshot_remove(vol, &h).await?;
            }
            continue;
        }

        // Recompute the dynamic flags from runtime state.
        if sb_active_ino == ino {
            h.set_flags(iflags::ACTIVE);
        } else {
            h.clear_flags(iflags::ACTIVE);
        }
        if found_enabled {
            h.set_flags(iflags::IN_USE);
        } else {
            h.clear_flags(iflags::IN_USE);
        }

        let is_active = h.has_flag(iflags::ACTIVE);
        let deleted = h.has_flag(iflags::DELETED) && !is_active;

        if deleted {
            if used_by.is_none() {
                if cleanup && !read_only {
                    snapshot_remove(vol, &h).await?;
                }
                continue;
            }
            if !h.has_flag(iflags::SHRUNK) {
                need_shrink += 1;
            }
            if !h.has_flag(iflags::IN_USE) {
                need_merge += 1;
            }
            victims.push(ino);
        } else if is_active && h.has_flag(iflags::DELETED) {
            // Deleted-but-active head: it still receives COW, so it can
            // only be shrunk against the nearest surviving snapshot, never
            // merged or removed while something older needs it.
            if !h.has_flag(iflags::SHRUNK) {
                need_shrink += 1;
            }
            victims.push(ino);
            if !read_only && need_shrink > 0 {
                if let Some(start) = used_by {
                    snapshot_shrink(vol, start, &victims).await?;
                }
            }
            victims.clear();
            need_shrink = 0;
            need_merge = 0;
        } else {
            if !read_only && need_shrink > 0 {
                if let Some(start) = used_by {
                    snapshot_shrink(vol, start, &victims).await?;
                }
            }
            if cleanup && !read_only && need_merge > 0 {
                if let Some(start) = used_by {
                    snapshot_merge(vol, start, &victims).await?;
                }
            }
            victims.clear();
            need_shrink = 0;
            need_merge = 0;
            used_by = Some(ino);
            if h.has_flag(iflags::ENABLED) {
                found_enabled = true;
            }
        }
    }

    // A deleted active snapshot nothing depends on: deactivate under the
    // update barrier, then reap it.
    if cleanup && !read_only {
        if let Some(a) = active {
            if a.has_flag(iflags::DELETED) && used_by.is_none() {
                log::info!("snapshot {}: deactivating deleted active snapshot", a.ino);
                let freeze = vol.journal().lock_updates().await;
                vol.journal().checkpoint().await?;
                a.clear_flags(iflags::ACTIVE);
                vol.update_superblock(|s| s.active_snapshot_ino = 0);
                vol.snapshots().set_active(None);
                flush_inode_direct(vol, &a).await?;
                vol.write_superblock().await?;
                vol.device().sync().await?;
                drop(freeze);
                snapshot_remove(vol, &a).await?;
            }
        }
    }

    Ok(())
}

/// Free, inside the deleted snapshots `victims`, every preserved block the
/// surviving snapshot `start_ino` does not need; keep one copy (the oldest
/// victim's) of every block it does. Marks the victims shrunk.
async fn snapshot_shrink(vol: &Volume, start_ino: u32, victims: &[u32]) -> Result<()> {
    if victims.is_empty() {
        return Ok(());
    }
    let start = vol.get_inode(start_ino).await?;
    log::info!(
        "shrink: {} deleted snapshot(s) against snapshot {}",
        victims.len(),
        start_ino
    );

    // START's point-in-time bitmap views, fetched through the read router
    // (its own copy, a newer snapshot's, or the synthesized live view).
    let mut views: HashMap<u32, Box<[u8; BLOCK_SIZE]>> = HashMap::new();

    // Logical positions of the groups' bitmap copies; the active victim's
    // must survive because the COW-bitmap cache may point at them.
    let mut bitmap_lblks: HashSet<Lblk> = HashSet::new();
    for g in 0..vol.layout().group_count {
        bitmap_lblks.insert(snapshot_iblock(vol.group(g).desc().block_bitmap));
    }

    let mut kept: HashSet<Lblk> = HashSet::new();
    for v_ino in victims.iter().copied() {
        let v = vol.get_inode(v_ino).await?;
        let is_active_victim = v.has_flag(iflags::ACTIVE);

        let txn = vol.begin_txn().await?;
        let result = async {
            let mut freed = 0u32;
            for (lblk, p) in vol.mapped_blocks(&v).await? {
                if lblk < SNAPSHOT_RESERVED_BLOCKS {
                    continue;
                }
                if is_active_victim && bitmap_lblks.contains(&lblk) {
                    continue;
                }
                let phys = snapshot_pblk(lblk);
                let (group, off) = vol.layout().group_of(phys);
                if !views.contains_key(&group) {
                    let desc = vol.group(group).desc();
                    let view =
                        read::read_snapshot_block(vol, &start, snapshot_iblock(desc.block_bitmap))
                            .await?;
                    views.insert(group, view);
                }
                let needed = {
                    let view = &views[&group];
                    view[(off / 8) as usize] & (1 << (off % 8)) != 0
                };
                if needed && !kept.contains(&lblk) {
                    // First (oldest) copy on the route from START; keep it.
                    kept.insert(lblk);
                    continue;
                }
                vol.map_clear(&txn, &v, lblk).await?;
                vol.free_blocks_raw(&txn, p, 1).await?;
                bitmap::unexclude_blocks(vol, &txn, p, 1).await?;
                v.update(|i| i.blocks = i.blocks.saturating_sub(1));
                freed += 1;
            }
            v.set_flags(iflags::SHRUNK);
            vol.flush_inode(&txn, &v).await?;
            Ok(freed)
        }
        .await;
        match result {
            Ok(freed) => {
                vol.commit_txn(txn).await?;
                log::info!("shrink: snapshot {} released {} block(s)", v_ino, freed);
            }
            Err(e) => {
                vol.abort_txn(txn);
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Fold shrunk, unused deleted snapshots into the surviving snapshot
/// `start_ino`: re-parent their remaining preserved blocks, then remove
/// them from the chain. Newest victim first, as in the reference pass.
async fn snapshot_merge(vol: &Volume, start_ino: u32, victims: &[u32]) -> Result<()> {
    let start = vol.get_inode(start_ino).await?;

    for v_ino in victims.iter().rev().copied() {
        let v = vol.get_inode(v_ino).await?;
        if !v.has_flag(iflags::SHRUNK) || v.has_flag(iflags::IN_USE) || v.has_flag(iflags::ACTIVE)
        {
            continue;
        }
        log::info!("merge: folding snapshot {} into snapshot {}", v_ino, start_ino);

        let txn = vol.begin_txn().await?;
        let result = async {
            for (lblk, p) in vol.mapped_blocks(&v).await? {
                if lblk < SNAPSHOT_RESERVED_BLOCKS {
                    continue;
                }
                if vol.map_block(&start, lblk).await?.is_none() {
                    // Move the copy down to the survivor; exclude bits
                    // travel with snapshot ownership and stay set.
                    vol.map_clear(&txn, &v, lblk).await?;
                    match vol
                        .map_insert(&txn, &start, lblk, AllocIntent::Move(p))
                        .await?
                    {
                        MapInsert::New(_) => {}
                        MapInsert::Existing(_) => {
                            return Err(Error::Corrupt(format!(
                                "merge raced on logical block {}",
                                lblk
                            )));
                        }
                    }
                    v.update(|i| i.blocks = i.blocks.saturating_sub(1));
                } else {
                    // The survivor already preserves this block.
                    vol.map_clear(&txn, &v, lblk).await?;
                    vol.free_blocks_raw(&txn, p, 1).await?;
                    bitmap::unexclude_blocks(vol, &txn, p, 1).await?;
                    v.update(|i| i.blocks = i.blocks.saturating_sub(1));
                }
            }
            vol.flush_inode(&txn, &v).await?;
            vol.flush_inode(&txn, &start).await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => vol.commit_txn(txn).await?,
            Err(e) => {
                vol.abort_txn(txn);
                return Err(e);
            }
        }

        snapshot_remove(vol, &v).await?;
    }

    Ok(())
}

/// Free every block of a snapshot and unlink it from the chain. A truncate
/// specialized for snapshot inodes: non-active snapshots cannot grow, so no
/// allocation races with the teardown.
async fn snapshot_remove(vol: &Volume, h: &Arc<InodeHandle>) -> Result<()> {
    log::info!("snapshot {}: removing", h.ino);

    let txn = vol.begin_txn().await?;
    let result = async {
        let mapped = vol.mapped_blocks(h).await?;
        let spine = vol.spine_blocks(h).await?;

        // Free while the exclude bits are still set, so a concurrent
        // COW-bitmap materialization keeps masking these blocks out; only
        // then drop the bits.
        for (_, p) in &mapped {
            vol.free_blocks_raw(&txn, *p, 1).await?;
            bitmap::unexclude_blocks(vol, &txn, *p, 1).await?;
        }
        for p in &spine {
            vol.free_blocks_raw(&txn, *p, 1).await?;
            bitmap::unexclude_blocks(vol, &txn, *p, 1).await?;
        }

        // Unlink from the on-disk chain.
        let next = h.with(|i| i.next_snapshot);
        match vol.snapshots().newer_neighbor(h.ino) {
            None => {
                vol.update_superblock(|s| s.last_snapshot_ino = next);
            }
            Some(newer_ino) => {
                let newer = vol.get_inode(newer_ino).await?;
                newer.update(|i| i.next_snapshot = next);
                vol.flush_inode(&txn, &newer).await?;
            }
        }

        h.update(|i| {
            i.block = [0; 15];
            i.blocks = 0;
            i.size = 0;
            i.disksize = 0;
            i.next_snapshot = 0;
            i.links = 0;
            i.flags &= !(iflags::ON_LIST
                | iflags::ENABLED
                | iflags::ACTIVE
                | iflags::IN_USE
                | iflags::DELETED
                | iflags::SHRUNK);
        });
        vol.flush_inode(&txn, h).await?;
        vol.free_inode(&txn, h.ino).await?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => vol.commit_txn(txn).await?,
        Err(e) => {
            vol.abort_txn(txn);
            return Err(e);
        }
    }

    vol.snapshots().unlink(h.ino);
    vol.forget_inode(h.ino);
    vol.write_superblock().await?;
    Ok(())
}

/// Mount-time load: walk the on-disk chain, validate it, restore the
/// active pointer, then reconcile without cleanup.
pub async fn load(vol: &Volume, read_only: bool) -> Result<()> {
    let _lock = vol.snapshots().mutex.lock().await;
    let sb = vol.superblock();

    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut ino = sb.last_snapshot_ino;
    while ino != 0 {
        if !seen.insert(ino) {
            return Err(Error::Corrupt(format!(
                "snapshot chain loops back to inode {}",
                ino
            )));
        }
        let h = vol.get_inode(ino).await?;
        if !h.is_snapfile() {
            return Err(Error::Corrupt(format!(
                "inode {} on the snapshot chain is not a snapshot file",
                ino
            )));
        }
        h.set_flags(iflags::ON_LIST);
        if ino == sb.active_snapshot_ino {
            h.set_flags(iflags::ACTIVE);
            vol.snapshots().set_active(Some(h.clone()));
        }
        chain.push(ino);
        ino = h.with(|i| i.next_snapshot);
    }
    vol.snapshots().set_list(chain);

    if let Some(a) = vol.active_snapshot() {
        if vol.snapshots().head() != Some(a.ino) {
            log::warn!(
                "active snapshot {} is not the chain head; update will reconcile",
                a.ino
            );
        }
    }
    log::info!(
        "snapshot load: {} snapshot(s) on the chain (read_only={})",
        vol.snapshots().len(),
        read_only
    );

    update_locked(vol, false).await
}

/// Unmount-time teardown of the in-memory snapshot state.
pub async fn destroy(vol: &Volume) -> Result<()> {
    let _lock = vol.snapshots().mutex.lock().await;
    vol.snapshots().set_active(None);
    for ino in vol.snapshots().snapshot_list() {
        vol.forget_inode(ino);
    }
    vol.snapshots().set_list(Vec::new());
    log::debug!("snapshot state destroyed");
    Ok(())
}
