//! Flag-based control surface.
//!
//! Administrative tooling drives the lifecycle by toggling the chain,
//! enabled and deleted bits on a snapshot inode; the dynamic bits (active,
//! in-use, open) are computed from runtime state and cannot be set.

use crate::error::{Error, Result};
use crate::format::iflags;
use crate::modules::snapshot::lifecycle;
use crate::volume::Volume;

/// Bits a caller may toggle through `set_flags`.
pub const CONTROLLABLE: u32 = iflags::ON_LIST | iflags::ENABLED | iflags::DELETED;

/// Current flags of an inode with the dynamic bits recomputed from runtime
/// state: `ACTIVE` from the superblock pointer, `OPEN` from the handle
/// count, `IN_USE` from enabled older snapshots on the chain.
pub async fn get_flags(vol: &Volume, ino: u32) -> Result<u32> {
    let h = vol.get_inode(ino).await?;
    let mut flags = h.flags() & !iflags::DYNAMIC;

    if vol.superblock().active_snapshot_ino == ino {
        flags |= iflags::ACTIVE;
    }
    if h.open_count() > 0 {
        flags |= iflags::OPEN;
    }

    // An older enabled snapshot reads through this one.
    let mut older = vol.snapshots().older_neighbor(ino);
    while let Some(o) = older {
        let oh = vol.get_inode(o).await?;
        if oh.has_flag(iflags::ENABLED) {
            flags |= iflags::IN_USE;
            break;
        }
        older = vol.snapshots().older_neighbor(o);
    }

    Ok(flags)
}

/// Apply a new flag word to a snapshot inode. Toggles of the controllable
/// bits drive lifecycle transitions; everything else must be unchanged.
/// Transitions apply in a fixed order (disable, delete, link, enable) so a
/// single call can e.g. disable and delete in one step.
pub async fn set_flags(vol: &Volume, ino: u32, new_flags: u32) -> Result<()> {
    let h = vol.get_inode(ino).await?;
    let old_flags = h.flags() & !iflags::DYNAMIC;
    let changed = (old_flags ^ new_flags) & !iflags::DYNAMIC;

    if changed & !CONTROLLABLE != 0 {
        return Err(Error::Invalid(format!(
            "flags {:#x} are not controllable",
            changed & !CONTROLLABLE
        )));
    }

    if changed & iflags::ENABLED != 0 && new_flags & iflags::ENABLED == 0 {
        lifecycle::snapshot_disable(vol, ino).await?;
    }
    if changed & iflags::DELETED != 0 {
        if new_flags & iflags::DELETED == 0 {
            return Err(Error::NotPermitted("undelete of a snapshot"));
        }
        lifecycle::snapshot_delete(vol, ino).await?;
    }
    if changed & iflags::ON_LIST != 0 {
        if new_flags & iflags::ON_LIST == 0 {
            return Err(Error::NotPermitted(
                "snapshots leave the chain through deletion",
            ));
        }
        lifecycle::snapshot_create(vol, ino).await?;
    }
    if changed & iflags::ENABLED != 0 && new_flags & iflags::ENABLED != 0 {
        lifecycle::snapshot_enable(vol, ino).await?;
    }

    Ok(())
}
