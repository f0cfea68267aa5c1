//! End-to-end snapshot scenarios: preservation across writes, read-through
//! across the chain, shrink/merge reclamation, permission checks and the
//! concurrent-writer rendezvous.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use snapfs::format::{self, iflags, MkfsParams, Superblock};
use snapfs::modules::snapshot::{control, lifecycle, read};
use snapfs::{snapshot_iblock, FileBackedBlockDevice, InodeHandle, Volume, BLOCK_SIZE};
use tempfile::TempDir;

async fn setup_volume(blocks: u64, blocks_per_group: u32) -> (Arc<Volume>, TempDir) {
    env_logger::builder().is_test(true).try_init().ok();

    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("volume.img");
    let device = FileBackedBlockDevice::create(&path, blocks * BLOCK_SIZE as u64)
        .await
        .expect("create device");

    let params = MkfsParams {
        blocks_per_group,
        inodes_per_group: 32,
        journal_blocks: 32,
        snapshot_reserved_blocks: 8,
        volume_name: Some("scenario".into()),
    };
    format::mkfs(&device, &params).await.expect("mkfs");

    let vol = Volume::mount(Arc::new(device), false).await.expect("mount");
    (vol, dir)
}

async fn take_snapshot(vol: &Volume) -> u32 {
    let ino = lifecycle::create_snapshot_file(vol).await.expect("create file");
    lifecycle::snapshot_create(vol, ino).await.expect("create");
    lifecycle::snapshot_take(vol, ino).await.expect("take");
    ino
}

fn block_of(byte: u8) -> Vec<u8> {
    vec![byte; BLOCK_SIZE]
}

/// Write `count` file blocks and return their physical positions.
async fn populate_file(
    vol: &Volume,
    file: &Arc<InodeHandle>,
    count: u32,
    seed: u8,
) -> Vec<u32> {
    let mut phys = Vec::new();
    for i in 0..count {
        vol.file_write_block(file, i, &block_of(seed + i as u8))
            .await
            .expect("file write");
        phys.push(
            vol.map_block(file, i)
                .await
                .expect("map")
                .expect("mapped after write"),
        );
    }
    phys
}

// S1: take a snapshot, overwrite a block, read the original through the
// snapshot.
#[tokio::test]
async fn test_s1_overwrite_preserves_pre_image() {
    let (vol, _dir) = setup_volume(256, 64).await;

    let file = vol.create_file_inode().await.unwrap();
    let phys = populate_file(&vol, &file, 10, 0x10).await;

    let snap_ino = take_snapshot(&vol).await;
    let snap = vol.get_inode(snap_ino).await.unwrap();

    // Overwrite the sixth file block.
    let target_lblk = 5u32;
    let old_phys = phys[5];
    vol.file_write_block(&file, target_lblk, &block_of(0xEE))
        .await
        .unwrap();

    // The snapshot now maps the preserved position.
    assert!(
        vol.map_block(&snap, snapshot_iblock(old_phys))
            .await
            .unwrap()
            .is_some(),
        "snapshot must map the overwritten block"
    );

    // And serves the pre-write contents.
    let preserved = read::read_snapshot_block(&vol, &snap, snapshot_iblock(old_phys))
        .await
        .unwrap();
    assert_eq!(preserved[0], 0x15);
    assert!(preserved.iter().all(|b| *b == 0x15));

    // The live file sees the new contents.
    let live = vol.file_read_block(&file, target_lblk).await.unwrap();
    assert!(live.iter().all(|b| *b == 0xEE));

    vol.unmount().await.unwrap();
}

// Preservation is byte exact: random block contents survive an overwrite
// unchanged, with no pattern for a sloppy copy to hide behind.
#[tokio::test]
async fn test_random_contents_preserved_exactly() {
    let (vol, _dir) = setup_volume(256, 64).await;

    let mut rng = StdRng::seed_from_u64(0x5eed_cafe);
    let mut original = vec![0u8; BLOCK_SIZE];
    rng.fill(&mut original[..]);
    let mut replacement = vec![0u8; BLOCK_SIZE];
    rng.fill(&mut replacement[..]);

    let file = vol.create_file_inode().await.unwrap();
    vol.file_write_block(&file, 0, &original).await.unwrap();
    let phys = vol.map_block(&file, 0).await.unwrap().unwrap();

    let snap_ino = take_snapshot(&vol).await;
    let snap = vol.get_inode(snap_ino).await.unwrap();

    vol.file_write_block(&file, 0, &replacement).await.unwrap();

    let preserved = read::read_snapshot_block(&vol, &snap, snapshot_iblock(phys))
        .await
        .unwrap();
    assert_eq!(&preserved[..], &original[..]);

    let live = vol.file_read_block(&file, 0).await.unwrap();
    assert_eq!(&live[..], &replacement[..]);

    vol.unmount().await.unwrap();
}

// S2: a second snapshot; the older one reads changed blocks through the
// newer one.
#[tokio::test]
async fn test_s2_read_through_newer_snapshot() {
    let (vol, _dir) = setup_volume(256, 64).await;

    let file = vol.create_file_inode().await.unwrap();
    let phys = populate_file(&vol, &file, 10, 0x20).await;

    let snap_a = take_snapshot(&vol).await;
    let a = vol.get_inode(snap_a).await.unwrap();

    let snap_b = take_snapshot(&vol).await;
    let b = vol.get_inode(snap_b).await.unwrap();

    // Overwrite block 6 of the file while B is active.
    let old_phys = phys[6];
    vol.file_write_block(&file, 6, &block_of(0xBB)).await.unwrap();

    // B holds the pre-image.
    let via_b = read::read_snapshot_block(&vol, &b, snapshot_iblock(old_phys))
        .await
        .unwrap();
    assert!(via_b.iter().all(|x| *x == 0x26));

    // A has no mapping of its own and routes through B.
    assert!(vol
        .map_block(&a, snapshot_iblock(old_phys))
        .await
        .unwrap()
        .is_none());
    let via_a = read::read_snapshot_block(&vol, &a, snapshot_iblock(old_phys))
        .await
        .unwrap();
    assert!(via_a.iter().all(|x| *x == 0x26));

    // An unchanged block reads through both snapshots to the live device.
    let untouched = phys[2];
    let via_a = read::read_snapshot_block(&vol, &a, snapshot_iblock(untouched))
        .await
        .unwrap();
    assert!(via_a.iter().all(|x| *x == 0x22));

    vol.unmount().await.unwrap();
}

// S3: deleting the newer enabled snapshot shrinks it but keeps it on the
// chain while the older one depends on it.
#[tokio::test]
async fn test_s3_deleted_head_is_shrunk_not_removed() {
    let (vol, _dir) = setup_volume(256, 64).await;

    let file = vol.create_file_inode().await.unwrap();
    let phys = populate_file(&vol, &file, 10, 0x30).await;

    let snap_a = take_snapshot(&vol).await;
    let snap_b = take_snapshot(&vol).await;

    lifecycle::snapshot_enable(&vol, snap_a).await.unwrap();
    lifecycle::snapshot_enable(&vol, snap_b).await.unwrap();

    let old_phys = phys[6];
    vol.file_write_block(&file, 6, &block_of(0xB3)).await.unwrap();

    // Disable and delete B in one control verb.
    let flags = control::get_flags(&vol, snap_b).await.unwrap();
    control::set_flags(&vol, snap_b, (flags & !iflags::ENABLED) | iflags::DELETED)
        .await
        .unwrap();

    // B stays: A still reads through it.
    assert!(vol.snapshots().contains(snap_b), "B must stay on the chain");
    let b_flags = control::get_flags(&vol, snap_b).await.unwrap();
    assert_ne!(b_flags & iflags::DELETED, 0, "B is deleted");
    assert_ne!(b_flags & iflags::SHRUNK, 0, "B was shrunk by update");

    let a = vol.get_inode(snap_a).await.unwrap();
    let via_a = read::read_snapshot_block(&vol, &a, snapshot_iblock(old_phys))
        .await
        .unwrap();
    assert!(via_a.iter().all(|x| *x == 0x36));

    vol.unmount().await.unwrap();
}

// S4: deleting everything returns the live bitmap to its pre-snapshot
// state.
#[tokio::test]
async fn test_s4_full_deletion_frees_all_snapshot_blocks() {
    let (vol, _dir) = setup_volume(256, 64).await;

    let file = vol.create_file_inode().await.unwrap();
    let phys = populate_file(&vol, &file, 10, 0x40).await;

    let free_before = vol.superblock().free_blocks;

    let snap_a = take_snapshot(&vol).await;
    let snap_b = take_snapshot(&vol).await;

    vol.file_write_block(&file, 3, &block_of(0xD4)).await.unwrap();
    vol.file_write_block(&file, 7, &block_of(0xD5)).await.unwrap();

    lifecycle::snapshot_delete(&vol, snap_a).await.unwrap();
    lifecycle::snapshot_delete(&vol, snap_b).await.unwrap();
    lifecycle::snapshot_update(&vol, true).await.unwrap();

    assert!(vol.snapshots().is_empty(), "chain must be empty");
    let sb = vol.superblock();
    assert_eq!(sb.active_snapshot_ino, 0);
    assert_eq!(
        sb.free_blocks, free_before,
        "every snapshot-held block must be back in the free pool"
    );

    // The blocks that were re-parented into the snapshots are free again.
    for lblk in [3u32, 7] {
        let old = phys[lblk as usize];
        let now = vol.map_block(&file, lblk).await.unwrap().unwrap();
        assert_ne!(old, now, "overwrite relocated the live block");
        assert!(!vol.block_allocated(old).await.unwrap());
    }

    vol.unmount().await.unwrap();
}

// S5: snapshot files reject writes.
#[tokio::test]
async fn test_s5_snapshot_writes_denied() {
    let (vol, _dir) = setup_volume(256, 64).await;

    let snap_ino = take_snapshot(&vol).await;
    lifecycle::snapshot_enable(&vol, snap_ino).await.unwrap();
    let snap = vol.get_inode(snap_ino).await.unwrap();

    let err = vol
        .file_write_block(&snap, 100, &block_of(0xAA))
        .await
        .unwrap_err();
    assert!(matches!(err, snapfs::Error::NotPermitted(_)));

    let err = vol.file_free_block(&snap, 100).await.unwrap_err();
    assert!(matches!(err, snapfs::Error::NotPermitted(_)));

    vol.unmount().await.unwrap();
}

// S6: two concurrent writers in one group; one bitmap materialization, two
// preserved pre-images.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_s6_concurrent_writers_single_materialization() {
    let (vol, _dir) = setup_volume(256, 64).await;

    let file = vol.create_file_inode().await.unwrap();
    let phys = populate_file(&vol, &file, 4, 0x60).await;

    let snap_ino = take_snapshot(&vol).await;
    let snap = vol.get_inode(snap_ino).await.unwrap();

    let (g0, _) = vol.layout().group_of(phys[0]);
    let (g1, _) = vol.layout().group_of(phys[1]);
    assert_eq!(g0, g1, "both targets must share a block group");

    // Metadata-style overwrites of two distinct blocks, concurrently; both
    // race to materialize the group's COW bitmap.
    let v1 = vol.clone();
    let v2 = vol.clone();
    let b1 = phys[0];
    let b2 = phys[1];
    let w1 = tokio::spawn(async move { v1.overwrite_block(None, b1, &block_of(0xE1)).await });
    let w2 = tokio::spawn(async move { v2.overwrite_block(None, b2, &block_of(0xE2)).await });
    w1.await.unwrap().unwrap();
    w2.await.unwrap().unwrap();

    // The rendezvous slot settled on a committed bitmap block.
    let desc = vol.group(g0).desc();
    let slot = *vol.group(g0).cow_slot().lock();
    assert_ne!(slot, 0, "bitmap must be materialized");
    assert_ne!(slot, desc.block_bitmap, "in-progress marker must be gone");

    // Both pre-images preserved, both writes applied.
    let p1 = read::read_snapshot_block(&vol, &snap, snapshot_iblock(b1))
        .await
        .unwrap();
    assert!(p1.iter().all(|x| *x == 0x60));
    let p2 = read::read_snapshot_block(&vol, &snap, snapshot_iblock(b2))
        .await
        .unwrap();
    assert!(p2.iter().all(|x| *x == 0x61));

    let l1 = vol.buffers().read(b1).await.unwrap();
    assert!(l1.copy_out().iter().all(|x| *x == 0xE1));
    let l2 = vol.buffers().read(b2).await.unwrap();
    assert!(l2.copy_out().iter().all(|x| *x == 0xE2));

    vol.unmount().await.unwrap();
}

// Freeing a block after a take re-parents it instead of releasing it.
#[tokio::test]
async fn test_free_after_take_moves_block_into_snapshot() {
    let (vol, _dir) = setup_volume(256, 64).await;

    let file = vol.create_file_inode().await.unwrap();
    let phys = populate_file(&vol, &file, 4, 0x70).await;

    let snap_ino = take_snapshot(&vol).await;
    let snap = vol.get_inode(snap_ino).await.unwrap();

    vol.file_free_block(&file, 2).await.unwrap();

    // The block stays allocated, now owned by the snapshot.
    assert!(vol.block_allocated(phys[2]).await.unwrap());
    assert!(vol
        .map_block(&snap, snapshot_iblock(phys[2]))
        .await
        .unwrap()
        .is_some());
    let preserved = read::read_snapshot_block(&vol, &snap, snapshot_iblock(phys[2]))
        .await
        .unwrap();
    assert!(preserved.iter().all(|x| *x == 0x72));

    vol.unmount().await.unwrap();
}

// Every block a snapshot file owns carries its exclude bit, so it can
// never be preserved into itself.
#[tokio::test]
async fn test_exclude_bits_cover_snapshot_blocks() {
    let (vol, _dir) = setup_volume(256, 64).await;

    let file = vol.create_file_inode().await.unwrap();
    populate_file(&vol, &file, 4, 0x77).await;

    let snap_ino = take_snapshot(&vol).await;
    let snap = vol.get_inode(snap_ino).await.unwrap();
    vol.file_write_block(&file, 1, &block_of(0x99)).await.unwrap();

    let mut owned: Vec<u32> = vol
        .mapped_blocks(&snap)
        .await
        .unwrap()
        .into_iter()
        .map(|(_, p)| p)
        .collect();
    owned.extend(vol.spine_blocks(&snap).await.unwrap());
    assert!(!owned.is_empty());

    for p in owned {
        let (g, off) = vol.layout().group_of(p);
        let excl_blk = vol.group(g).desc().exclude_bitmap;
        let excl = vol.buffers().read(excl_blk).await.unwrap();
        let set = {
            let data = excl.data();
            data[(off / 8) as usize] & (1 << (off % 8)) != 0
        };
        assert!(set, "block {} of snapshot {} must be excluded", p, snap_ino);
    }

    vol.unmount().await.unwrap();
}

// The image's superblock copy parses as a stand-alone, journal-less,
// snapshot-less filesystem.
#[tokio::test]
async fn test_image_superblock_self_consistency() {
    let (vol, _dir) = setup_volume(256, 64).await;

    let snap_ino = take_snapshot(&vol).await;
    let snap = vol.get_inode(snap_ino).await.unwrap();

    let block0 = read::read_snapshot_block(&vol, &snap, 0).await.unwrap();
    let sb = Superblock::read_from(&mut std::io::Cursor::new(&block0[..])).unwrap();

    use snapfs::format::features;
    assert_eq!(sb.features_compat & features::COMPAT_HAS_JOURNAL, 0);
    assert_eq!(sb.features_ro_compat & features::RO_HAS_SNAPSHOT, 0);
    assert_ne!(sb.features_ro_compat & features::RO_IS_SNAPSHOT, 0);
    assert_eq!(sb.journal_ino, 0);
    assert_eq!(sb.last_snapshot_ino, 0);
    assert_eq!(sb.active_snapshot_ino, 0);

    vol.unmount().await.unwrap();
}
