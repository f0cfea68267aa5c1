//! The snapshot engine: copy-on-write preservation, the per-group bitmap
//! cache, the image read router, and the lifecycle state machine.

pub mod bitmap;
pub mod control;
pub mod cow;
pub mod lifecycle;
pub mod read;

use parking_lot::RwLock;
use std::sync::Arc;

use crate::inode::InodeHandle;

/// In-memory snapshot chain: chronologically ordered inode numbers, newest
/// first, mirroring the on-disk next-pointer chain, plus the active
/// snapshot pointer.
///
/// The chain is read without the lifecycle mutex on the COW map-check path;
/// it is mutated only under `mutex` with journal credits in hand. The
/// active pointer changes only under the journal's update barrier, so any
/// reader inside a transaction sees a stable value.
pub struct SnapshotChain {
    list: RwLock<Vec<u32>>,
    active: RwLock<Option<Arc<InodeHandle>>>,
    /// Serializes every lifecycle operation.
    pub mutex: tokio::sync::Mutex<()>,
}

impl SnapshotChain {
    /// An empty chain.
    pub fn new() -> Self {
        Self {
            list: RwLock::new(Vec::new()),
            active: RwLock::new(None),
            mutex: tokio::sync::Mutex::new(()),
        }
    }

    /// Newest snapshot (chain head), if any.
    pub fn head(&self) -> Option<u32> {
        self.list.read().first().copied()
    }

    /// Snapshot inode numbers, newest first.
    pub fn snapshot_list(&self) -> Vec<u32> {
        self.list.read().clone()
    }

    /// Number of snapshots on the chain.
    pub fn len(&self) -> usize {
        self.list.read().len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.list.read().is_empty()
    }

    /// Whether an inode is linked on the chain.
    pub fn contains(&self, ino: u32) -> bool {
        self.list.read().contains(&ino)
    }

    /// Link a new snapshot at the head.
    pub fn push_head(&self, ino: u32) {
        self.list.write().insert(0, ino);
    }

    /// Unlink a snapshot from the chain.
    pub fn unlink(&self, ino: u32) {
        self.list.write().retain(|i| *i != ino);
    }

    /// Replace the whole chain (mount-time load).
    pub fn set_list(&self, list: Vec<u32>) {
        *self.list.write() = list;
    }

    /// The next newer snapshot: the chain neighbor toward the head.
    pub fn newer_neighbor(&self, ino: u32) -> Option<u32> {
        let list = self.list.read();
        let pos = list.iter().position(|i| *i == ino)?;
        if pos == 0 {
            None
        } else {
            Some(list[pos - 1])
        }
    }

    /// The next older snapshot: the chain neighbor away from the head.
    pub fn older_neighbor(&self, ino: u32) -> Option<u32> {
        let list = self.list.read();
        let pos = list.iter().position(|i| *i == ino)?;
        list.get(pos + 1).copied()
    }

    /// The active snapshot, if any.
    pub fn active(&self) -> Option<Arc<InodeHandle>> {
        self.active.read().clone()
    }

    /// Install or clear the active snapshot. Callers hold the journal's
    /// update barrier.
    pub fn set_active(&self, snapshot: Option<Arc<InodeHandle>>) {
        *self.active.write() = snapshot;
    }
}

impl Default for SnapshotChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Inode;

    fn handle(ino: u32) -> Arc<InodeHandle> {
        Arc::new(InodeHandle::new(ino, Inode::empty()))
    }

    #[test]
    fn test_chain_order_and_neighbors() {
        let chain = SnapshotChain::new();
        chain.push_head(11);
        chain.push_head(12);
        chain.push_head(13);

        assert_eq!(chain.head(), Some(13));
        assert_eq!(chain.snapshot_list(), vec![13, 12, 11]);
        assert_eq!(chain.newer_neighbor(11), Some(12));
        assert_eq!(chain.newer_neighbor(13), None);
        assert_eq!(chain.older_neighbor(13), Some(12));
        assert_eq!(chain.older_neighbor(11), None);

        chain.unlink(12);
        assert_eq!(chain.snapshot_list(), vec![13, 11]);
        assert_eq!(chain.newer_neighbor(11), Some(13));
    }

    #[test]
    fn test_active_pointer() {
        let chain = SnapshotChain::new();
        assert!(chain.active().is_none());
        let h = handle(42);
        chain.set_active(Some(h.clone()));
        assert_eq!(chain.active().unwrap().ino, 42);
        chain.set_active(None);
        assert!(chain.active().is_none());
    }
}
