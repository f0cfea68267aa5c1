//! Lifecycle invariants: single active snapshot, chain ordering, monotonic
//! ids, permission checks, and persistence across remounts.

use std::sync::Arc;

use snapfs::format::{self, iflags, MkfsParams};
use snapfs::modules::snapshot::{control, lifecycle, read};
use snapfs::{snapshot_iblock, FileBackedBlockDevice, Volume, BLOCK_SIZE};
use tempfile::TempDir;

async fn format_device(dir: &TempDir, blocks: u64) -> std::path::PathBuf {
    env_logger::builder().is_test(true).try_init().ok();
    let path = dir.path().join("volume.img");
    let device = FileBackedBlockDevice::create(&path, blocks * BLOCK_SIZE as u64)
        .await
        .expect("create device");
    let params = MkfsParams {
        blocks_per_group: 64,
        inodes_per_group: 32,
        journal_blocks: 32,
        snapshot_reserved_blocks: 8,
        volume_name: Some("lifecycle".into()),
    };
    format::mkfs(&device, &params).await.expect("mkfs");
    path
}

async fn mount(path: &std::path::Path) -> Arc<Volume> {
    let device = Arc::new(
        FileBackedBlockDevice::open(path, false)
            .await
            .expect("open device"),
    );
    Volume::mount(device, false).await.expect("mount")
}

async fn take_snapshot(vol: &Volume) -> u32 {
    let ino = lifecycle::create_snapshot_file(vol).await.unwrap();
    lifecycle::snapshot_create(vol, ino).await.unwrap();
    lifecycle::snapshot_take(vol, ino).await.unwrap();
    ino
}

#[tokio::test]
async fn test_single_active_and_head_invariants() {
    let dir = TempDir::new().unwrap();
    let path = format_device(&dir, 256).await;
    let vol = mount(&path).await;

    let s1 = take_snapshot(&vol).await;
    let s2 = take_snapshot(&vol).await;
    let s3 = take_snapshot(&vol).await;

    // Exactly one ACTIVE snapshot, and it is the chain head.
    let chain = vol.snapshots().snapshot_list();
    assert_eq!(chain, vec![s3, s2, s1], "newest first");
    let mut active = Vec::new();
    for ino in &chain {
        let flags = control::get_flags(&vol, *ino).await.unwrap();
        if flags & iflags::ACTIVE != 0 {
            active.push(*ino);
        }
    }
    assert_eq!(active, vec![s3]);
    assert_eq!(vol.superblock().active_snapshot_ino, s3);

    vol.unmount().await.unwrap();
}

#[tokio::test]
async fn test_monotonic_snapshot_ids() {
    let dir = TempDir::new().unwrap();
    let path = format_device(&dir, 256).await;
    let vol = mount(&path).await;

    let mut last = 0u32;
    for _ in 0..3 {
        let ino = take_snapshot(&vol).await;
        let h = vol.get_inode(ino).await.unwrap();
        let gen = h.generation();
        assert!(gen > last, "snapshot ids must strictly increase");
        assert_eq!(gen, vol.superblock().snapshot_id);
        last = gen;
    }

    vol.unmount().await.unwrap();
}

#[tokio::test]
async fn test_permission_checks() {
    let dir = TempDir::new().unwrap();
    let path = format_device(&dir, 256).await;
    let vol = mount(&path).await;

    let ino = take_snapshot(&vol).await;

    // Delete of an enabled snapshot is refused.
    lifecycle::snapshot_enable(&vol, ino).await.unwrap();
    let err = lifecycle::snapshot_delete(&vol, ino).await.unwrap_err();
    assert!(matches!(err, snapfs::Error::NotPermitted(_)));

    // Disable of an open snapshot is refused.
    let h = vol.get_inode(ino).await.unwrap();
    h.open();
    let err = lifecycle::snapshot_disable(&vol, ino).await.unwrap_err();
    assert!(matches!(err, snapfs::Error::NotPermitted(_)));
    let flags = control::get_flags(&vol, ino).await.unwrap();
    assert_ne!(flags & iflags::OPEN, 0);
    h.release();

    // Enable of a deleted snapshot is refused.
    lifecycle::snapshot_disable(&vol, ino).await.unwrap();
    lifecycle::snapshot_delete(&vol, ino).await.unwrap();
    if vol.snapshots().contains(ino) {
        let err = lifecycle::snapshot_enable(&vol, ino).await.unwrap_err();
        assert!(matches!(err, snapfs::Error::NotPermitted(_)));
    }

    vol.unmount().await.unwrap();
}

#[tokio::test]
async fn test_dynamic_in_use_flag() {
    let dir = TempDir::new().unwrap();
    let path = format_device(&dir, 256).await;
    let vol = mount(&path).await;

    let s1 = take_snapshot(&vol).await;
    let s2 = take_snapshot(&vol).await;

    // Nothing enabled: nothing in use.
    let flags = control::get_flags(&vol, s2).await.unwrap();
    assert_eq!(flags & iflags::IN_USE, 0);

    // Enabling the older snapshot makes the newer one in-use (it serves
    // the older one's read-through).
    lifecycle::snapshot_enable(&vol, s1).await.unwrap();
    let flags = control::get_flags(&vol, s2).await.unwrap();
    assert_ne!(flags & iflags::IN_USE, 0);
    let flags = control::get_flags(&vol, s1).await.unwrap();
    assert_eq!(flags & iflags::IN_USE, 0, "oldest has nothing older");

    vol.unmount().await.unwrap();
}

#[tokio::test]
async fn test_enable_sets_visible_size() {
    let dir = TempDir::new().unwrap();
    let path = format_device(&dir, 256).await;
    let vol = mount(&path).await;

    let ino = take_snapshot(&vol).await;
    let h = vol.get_inode(ino).await.unwrap();

    assert_eq!(h.with(|i| i.size), 0, "disabled snapshots expose size 0");

    lifecycle::snapshot_enable(&vol, ino).await.unwrap();
    let expected = 256 * BLOCK_SIZE as u64;
    assert_eq!(h.with(|i| (i.size, i.disksize)), (expected, expected));

    // A byte read within the visible size succeeds now.
    let mut buf = [0u8; 16];
    let n = read::read_snapshot(&vol, &h, 0, &mut buf).await.unwrap();
    assert_eq!(n, 16);

    lifecycle::snapshot_disable(&vol, ino).await.unwrap();
    assert_eq!(h.with(|i| i.size), 0);
    let n = read::read_snapshot(&vol, &h, 0, &mut buf).await.unwrap();
    assert_eq!(n, 0, "disabled snapshots read as empty");

    vol.unmount().await.unwrap();
}

#[tokio::test]
async fn test_chain_survives_remount() {
    let dir = TempDir::new().unwrap();
    let path = format_device(&dir, 256).await;

    let (s1, s2, old_phys, file_ino) = {
        let vol = mount(&path).await;

        let file = vol.create_file_inode().await.unwrap();
        for i in 0..6u32 {
            vol.file_write_block(&file, i, &vec![0x50 + i as u8; BLOCK_SIZE])
                .await
                .unwrap();
        }
        let s1 = take_snapshot(&vol).await;
        let s2 = take_snapshot(&vol).await;

        let old = vol.map_block(&file, 4).await.unwrap().unwrap();
        vol.file_write_block(&file, 4, &vec![0xFF; BLOCK_SIZE])
            .await
            .unwrap();

        vol.unmount().await.unwrap();
        (s1, s2, old, file.ino)
    };

    let vol = mount(&path).await;

    assert_eq!(vol.snapshots().snapshot_list(), vec![s2, s1]);
    assert_eq!(vol.superblock().active_snapshot_ino, s2);
    let active = vol.active_snapshot().expect("active restored");
    assert_eq!(active.ino, s2);

    // The preserved pre-image survived the remount.
    let snap = vol.get_inode(s2).await.unwrap();
    let preserved = read::read_snapshot_block(&vol, &snap, snapshot_iblock(old_phys))
        .await
        .unwrap();
    assert!(preserved.iter().all(|x| *x == 0x54));

    // And the live file still has the new contents.
    let file = vol.get_inode(file_ino).await.unwrap();
    let live = vol.file_read_block(&file, 4).await.unwrap();
    assert!(live.iter().all(|x| *x == 0xFF));

    vol.unmount().await.unwrap();
}

#[tokio::test]
async fn test_take_requires_reserved_space() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tiny.img");
    let device = FileBackedBlockDevice::create(&path, 64 * BLOCK_SIZE as u64)
        .await
        .unwrap();
    let params = MkfsParams {
        blocks_per_group: 64,
        inodes_per_group: 32,
        journal_blocks: 32,
        // Demand more free blocks than the volume can ever have.
        snapshot_reserved_blocks: 10_000,
        volume_name: None,
    };
    format::mkfs(&device, &params).await.unwrap();
    let vol = Volume::mount(Arc::new(device), false).await.unwrap();

    let ino = lifecycle::create_snapshot_file(&vol).await.unwrap();
    let err = lifecycle::snapshot_create(&vol, ino).await.unwrap_err();
    assert!(matches!(err, snapfs::Error::NoSpace));

    vol.unmount().await.unwrap();
}
