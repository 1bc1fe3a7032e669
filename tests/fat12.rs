mod common;

use common::*;
use fat_rs::bpb::FatVariant;

// 1 MiB floppy-ish volume: ~2000 clusters of one sector
const TOTAL: u32 = 2048;
const SPC: u8 = 1;

#[test]
fn small_volumes_come_up_as_fat12() {
    let (_disk, fs) = fresh(Width::Fat12, TOTAL, SPC);
    assert_eq!(fs.variant(), FatVariant::Fat12);
    // no mount-state flags on FAT12
    assert!(fs.was_unmounted_cleanly().unwrap());
}

#[test]
fn create_write_read_and_remount() {
    let disk = RamDisk::from_image(mkfs(Width::Fat12, TOTAL, SPC));
    {
        let fs = mount(&disk);
        let root = fs.root();
        let file = root.create_file(&fs, "NOTE.TXT").unwrap();
        file.write_at(&fs, 0, b"twelve bits at a time").unwrap();
        fs.unmount().unwrap();
    }
    let fs = mount(&disk);
    let file = fs.root().open(&fs, "NOTE.TXT").unwrap();
    let mut buf = vec![0u8; file.size() as usize];
    file.read_at(&fs, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"twelve bits at a time");
}

#[test]
fn chains_spanning_the_packed_sector_boundary_survive() {
    // entries 340..342 sit around FAT byte offset 511, where a 12-bit
    // value straddles two sectors
    let (disk, fs) = fresh(Width::Fat12, TOTAL, SPC);
    let root = fs.root();
    let file = root.create_file(&fs, "LONG.BIN").unwrap();

    let mut payload = vec![0u8; 400 * SECTOR];
    for (i, b) in payload.iter_mut().enumerate() {
        *b = (i / 7 % 253) as u8;
    }
    file.write_at(&fs, 0, &payload).unwrap();
    fs.sync().unwrap();

    let mut back = vec![0u8; payload.len()];
    file.read_at(&fs, 0, &mut back).unwrap();
    assert_eq!(back, payload);

    assert!(fat_copies_identical(&disk, Width::Fat12, TOTAL, SPC));

    // remount and walk the chain cold
    fs.unmount().unwrap();
    drop(fs);
    let fs = mount(&disk);
    let file = fs.root().open(&fs, "LONG.BIN").unwrap();
    let mut clusters = 0u32;
    while file.seek_cluster(&fs, clusters).unwrap().is_some() {
        clusters += 1;
    }
    assert_eq!(clusters, 400);
    file.read_at(&fs, 0, &mut back).unwrap();
    assert_eq!(back, payload);
}

#[test]
fn subdirectory_grows_beyond_one_cluster() {
    let (_disk, fs) = fresh(Width::Fat12, TOTAL, SPC);
    let root = fs.root();
    let sub = root.create_directory(&fs, "MANY").unwrap();
    // 16 records per cluster; dot entries take two
    for i in 0..30 {
        sub.create_file(&fs, &format!("E{:02}.DAT", i)).unwrap();
    }
    assert_eq!(sub.entries(&fs).unwrap().len(), 32);
    for i in 0..30 {
        sub.open(&fs, &format!("E{:02}.DAT", i)).unwrap();
    }
}

#[test]
fn fixed_root_cannot_grow() {
    let (_disk, fs) = fresh(Width::Fat12, TOTAL, SPC);
    let root = fs.root();
    // 512 root entries on this format
    for i in 0..512 {
        root.create_file(&fs, &format!("R{:04}.TXT", i)).unwrap();
    }
    assert_eq!(
        root.create_file(&fs, "FULL.TXT").unwrap_err(),
        fat_rs::FsError::NoSpace
    );
}

#[test]
fn free_count_tracks_the_fat() {
    let (_disk, fs) = fresh(Width::Fat12, TOTAL, SPC);
    let g = geometry(Width::Fat12, TOTAL, SPC);
    assert_eq!(fs.free_count().unwrap(), g.cluster_count);
    let root = fs.root();
    let file = root.create_file(&fs, "SOME.BIN").unwrap();
    file.write_at(&fs, 0, &vec![0u8; 10 * SECTOR]).unwrap();
    assert_eq!(fs.free_count().unwrap(), g.cluster_count - 10);
    file.truncate(&fs, 0).unwrap();
    assert_eq!(fs.free_count().unwrap(), g.cluster_count);
}
