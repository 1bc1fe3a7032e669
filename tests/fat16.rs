mod common;

use common::*;
use fat_rs::{FsError, MountOptions};

// 64 MiB, 512-byte sectors, 2 sectors per cluster
const TOTAL: u32 = 131072;
const SPC: u8 = 2;

#[test]
fn fresh_volume_free_count_covers_every_cluster() {
    let (_disk, fs) = fresh(Width::Fat16, TOTAL, SPC);
    let g = geometry(Width::Fat16, TOTAL, SPC);
    // the fixed root directory consumes no clusters
    assert_eq!(fs.free_count().unwrap(), g.cluster_count);
}

#[test]
fn create_write_read_back() {
    let (_disk, fs) = fresh(Width::Fat16, TOTAL, SPC);
    let root = fs.root();
    let file = root.create_file(&fs, "HELLO.TXT").unwrap();
    assert_eq!(file.write_at(&fs, 0, b"hi\n").unwrap(), 3);

    let mut buf = [0u8; 3];
    assert_eq!(file.read_at(&fs, 0, &mut buf).unwrap(), 3);
    assert_eq!(&buf, b"hi\n");

    // reads past end of file clamp
    let mut long = [0u8; 16];
    assert_eq!(file.read_at(&fs, 0, &mut long).unwrap(), 3);
    assert_eq!(file.read_at(&fs, 3, &mut long).unwrap(), 0);
    assert_eq!(file.size(), 3);
}

#[test]
fn allocation_decrements_free_count() {
    let (_disk, fs) = fresh(Width::Fat16, TOTAL, SPC);
    let before = fs.free_count().unwrap();
    let root = fs.root();
    let file = root.create_file(&fs, "DATA.BIN").unwrap();
    let payload = vec![0xA5u8; fs.cluster_size() * 3];
    file.write_at(&fs, 0, &payload).unwrap();
    assert_eq!(fs.free_count().unwrap(), before - 3);

    drop(file);
    root.unlink(&fs, "DATA.BIN").unwrap();
    assert_eq!(fs.free_count().unwrap(), before);
}

#[test]
fn contents_survive_remount() {
    let disk = RamDisk::from_image(mkfs(Width::Fat16, TOTAL, SPC));
    {
        let fs = mount(&disk);
        let root = fs.root();
        let file = root.create_file(&fs, "KEEP.TXT").unwrap();
        file.write_at(&fs, 0, b"persistent contents").unwrap();
        fs.unmount().unwrap();
    }
    let fs = mount(&disk);
    let root = fs.root();
    let file = root.open(&fs, "KEEP.TXT").unwrap();
    assert_eq!(file.size(), 19);
    let mut buf = vec![0u8; 19];
    file.read_at(&fs, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"persistent contents");
}

#[test]
fn mount_state_flags_follow_the_lifecycle() {
    let disk = RamDisk::from_image(mkfs(Width::Fat16, TOTAL, SPC));
    let g = geometry(Width::Fat16, TOTAL, SPC);
    let entry1 = |disk: &RamDisk| {
        disk.with_bytes(|b| {
            let base = g.reserved as usize * SECTOR;
            u16::from_le_bytes([b[base + 2], b[base + 3]])
        })
    };
    assert_eq!(entry1(&disk) & 0xC000, 0xC000);

    let fs = mount(&disk);
    assert!(fs.was_unmounted_cleanly().unwrap());
    // mounting read-write clears the clean-shutdown bits on disk
    assert_eq!(entry1(&disk) & 0xC000, 0);
    fs.unmount().unwrap();
    assert_eq!(entry1(&disk) & 0xC000, 0xC000);
}

#[test]
fn sparse_write_zero_fills_the_gap() {
    // 4 KiB clusters for this one
    let (_disk, fs) = fresh(Width::Fat16, TOTAL, 8);
    assert_eq!(fs.cluster_size(), 4096);
    let root = fs.root();
    let file = root.create_file(&fs, "SPARSE.BIN").unwrap();

    let payload = vec![0x5Au8; 4096];
    file.write_at(&fs, 1 << 20, &payload).unwrap();
    assert_eq!(file.size(), (1 << 20) + 4096);

    // the hole reads back as zeros
    let mut buf = vec![0xFFu8; 8192];
    file.read_at(&fs, 0, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
    file.read_at(&fs, (1 << 20) - 8192, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));

    let mut tail = vec![0u8; 4096];
    file.read_at(&fs, 1 << 20, &mut tail).unwrap();
    assert_eq!(tail, payload);

    // 256 clusters of hole plus one of data
    let mut clusters = 0;
    while file.seek_cluster(&fs, clusters).unwrap().is_some() {
        clusters += 1;
    }
    assert_eq!(clusters, 257);
}

#[test]
fn freed_clusters_are_reused_tightly() {
    let (_disk, fs) = fresh(Width::Fat16, TOTAL, SPC);
    let root = fs.root();
    let cs = fs.cluster_size();

    let first = root.create_file(&fs, "FIRST.BIN").unwrap();
    first.write_at(&fs, 0, &vec![1u8; cs * 2]).unwrap();
    let reused = first.first_cluster();
    drop(first);

    let second = root.create_file(&fs, "SECOND.BIN").unwrap();
    second.write_at(&fs, 0, &vec![2u8; cs]).unwrap();

    root.unlink(&fs, "FIRST.BIN").unwrap();

    let third = root.create_file(&fs, "THIRD.BIN").unwrap();
    third.write_at(&fs, 0, &vec![3u8; cs]).unwrap();
    assert_eq!(third.first_cluster(), reused);
}

#[test]
fn truncate_frees_exactly_the_tail() {
    let (_disk, fs) = fresh(Width::Fat16, TOTAL, SPC);
    let root = fs.root();
    let cs = fs.cluster_size() as u32;
    let file = root.create_file(&fs, "TRUNC.BIN").unwrap();
    file.write_at(&fs, 0, &vec![7u8; cs as usize * 4]).unwrap();
    let before = fs.free_count().unwrap();

    file.truncate(&fs, cs * 2).unwrap();
    assert_eq!(fs.free_count().unwrap(), before + 2);
    assert_eq!(file.size(), cs * 2);

    // the retained chain ends exactly at cluster 2
    assert!(file.seek_cluster(&fs, 1).unwrap().is_some());
    assert!(file.seek_cluster(&fs, 2).unwrap().is_none());

    let mut buf = vec![0u8; cs as usize];
    file.read_at(&fs, cs as usize, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 7));

    file.truncate(&fs, 0).unwrap();
    assert_eq!(file.size(), 0);
    assert_eq!(file.first_cluster(), 0);
    assert_eq!(fs.free_count().unwrap(), before + 4);
}

#[test]
fn fat_copies_stay_identical_after_sync() {
    let (disk, fs) = fresh(Width::Fat16, TOTAL, SPC);
    let root = fs.root();
    let file = root.create_file(&fs, "MIRROR.BIN").unwrap();
    file.write_at(&fs, 0, &vec![9u8; fs.cluster_size() * 5]).unwrap();
    file.truncate(&fs, 100).unwrap();
    root.create_directory(&fs, "SUB").unwrap();
    fs.sync().unwrap();
    assert!(fat_copies_identical(&disk, Width::Fat16, TOTAL, SPC));
}

#[test]
fn read_only_mount_refuses_writes_without_touching_the_device() {
    let disk = RamDisk::from_image(mkfs(Width::Fat16, TOTAL, SPC));
    let fs = mount_opts(&disk, MountOptions::parse("ro"));
    let before = disk.write_count();
    let root = fs.root();
    assert_eq!(root.create_file(&fs, "NOPE.TXT").unwrap_err(), FsError::ReadOnly);
    let err = root.open(&fs, "MISSING").unwrap_err();
    assert_eq!(err, FsError::NotFound);
    fs.unmount().unwrap();
    assert_eq!(disk.write_count(), before);
}

#[test]
fn directory_listing_round_trips() {
    let (_disk, fs) = fresh(Width::Fat16, TOTAL, SPC);
    let root = fs.root();
    let names = [
        "UPPER.TXT",
        "lower.txt",
        "Mixed Case Long Name.data",
        "日本語テキスト.txt",
    ];
    for n in &names {
        root.create_file(&fs, n).unwrap();
    }
    let listed: Vec<String> = root
        .entries(&fs)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    for n in &names {
        assert!(listed.iter().any(|l| l == n), "{} missing from {:?}", n, listed);
    }
    // a second pass yields the same set
    let again: Vec<String> = root
        .entries(&fs)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(listed, again);

    // lookups are byte-exact
    for n in &names {
        root.open(&fs, n).unwrap();
    }
    assert_eq!(root.open(&fs, "upper.txt").unwrap_err(), FsError::NotFound);
}

#[test]
fn duplicate_names_are_rejected() {
    let (_disk, fs) = fresh(Width::Fat16, TOTAL, SPC);
    let root = fs.root();
    root.create_file(&fs, "TAKEN.TXT").unwrap();
    assert_eq!(
        root.create_file(&fs, "TAKEN.TXT").unwrap_err(),
        FsError::Exists
    );
    // same stored short name is a collision even when the case differs
    assert_eq!(
        root.create_file(&fs, "taken.txt").unwrap_err(),
        FsError::Exists
    );
    // case-fold duplicates are rejected on the long-name path too, where
    // the stored short names would otherwise diverge as ~1 and ~2
    root.create_file(&fs, "MyDocument.txt").unwrap();
    assert_eq!(
        root.create_file(&fs, "MYDOCUMENT.TXT").unwrap_err(),
        FsError::Exists
    );
    assert_eq!(
        root.create_file(&fs, "mydocument.txt").unwrap_err(),
        FsError::Exists
    );
    // distinct folded names still coexist, and lookup stays byte-exact
    root.create_file(&fs, "OtherDocument.txt").unwrap();
    root.open(&fs, "MyDocument.txt").unwrap();
    assert_eq!(
        root.open(&fs, "MYDOCUMENT.TXT").unwrap_err(),
        FsError::NotFound
    );
}

#[test]
fn unlink_semantics() {
    let (_disk, fs) = fresh(Width::Fat16, TOTAL, SPC);
    let root = fs.root();
    root.create_file(&fs, "GONE.TXT").unwrap();
    let sub = root.create_directory(&fs, "SUB").unwrap();

    assert_eq!(root.unlink(&fs, "SUB").unwrap_err(), FsError::IsDirectory);
    assert_eq!(
        root.remove_directory(&fs, "GONE.TXT").unwrap_err(),
        FsError::NotDirectory
    );

    sub.create_file(&fs, "INNER.TXT").unwrap();
    assert_eq!(
        root.remove_directory(&fs, "SUB").unwrap_err(),
        FsError::NotEmpty
    );
    sub.unlink(&fs, "INNER.TXT").unwrap();
    root.remove_directory(&fs, "SUB").unwrap();

    root.unlink(&fs, "GONE.TXT").unwrap();
    assert_eq!(root.open(&fs, "GONE.TXT").unwrap_err(), FsError::NotFound);
    assert_eq!(root.unlink(&fs, "GONE.TXT").unwrap_err(), FsError::NotFound);
}

#[test]
fn deleted_but_open_file_keeps_its_data() {
    let (_disk, fs) = fresh(Width::Fat16, TOTAL, SPC);
    let root = fs.root();
    let file = root.create_file(&fs, "HELD.TXT").unwrap();
    file.write_at(&fs, 0, b"still here").unwrap();
    fs.remote_refer(&file);

    root.unlink(&fs, "HELD.TXT").unwrap();
    assert!(file.is_deleted());
    let mut buf = [0u8; 10];
    file.read_at(&fs, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"still here");

    let before = fs.free_count().unwrap();
    fs.remote_unref(file).unwrap();
    // the chain is released with the last remote reference
    assert!(fs.free_count().unwrap() > before);
}

#[test]
fn rename_within_a_directory() {
    let (_disk, fs) = fresh(Width::Fat16, TOTAL, SPC);
    let root = fs.root();
    let file = root.create_file(&fs, "OLD.TXT").unwrap();
    file.write_at(&fs, 0, b"payload").unwrap();

    root.rename(&fs, "OLD.TXT", &root.clone(), "NEW.TXT").unwrap();
    assert_eq!(root.open(&fs, "OLD.TXT").unwrap_err(), FsError::NotFound);
    let renamed = root.open(&fs, "NEW.TXT").unwrap();
    let mut buf = [0u8; 7];
    renamed.read_at(&fs, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"payload");

    // case-only rename lands on the same stored short name
    root.rename(&fs, "NEW.TXT", &root.clone(), "new.txt").unwrap();
    let lowered = root.open(&fs, "new.txt").unwrap();
    lowered.read_at(&fs, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"payload");
}

#[test]
fn rename_replaces_an_existing_file() {
    let (_disk, fs) = fresh(Width::Fat16, TOTAL, SPC);
    let root = fs.root();
    root.create_file(&fs, "A.TXT")
        .unwrap()
        .write_at(&fs, 0, b"aaa")
        .unwrap();
    root.create_file(&fs, "B.TXT")
        .unwrap()
        .write_at(&fs, 0, b"bb")
        .unwrap();

    root.rename(&fs, "A.TXT", &root.clone(), "B.TXT").unwrap();
    assert_eq!(root.open(&fs, "A.TXT").unwrap_err(), FsError::NotFound);
    let b = root.open(&fs, "B.TXT").unwrap();
    assert_eq!(b.size(), 3);
}

#[test]
fn symlink_round_trips_through_file_content() {
    let (_disk, fs) = fresh(Width::Fat16, TOTAL, SPC);
    let root = fs.root();
    let link = root.symlink(&fs, "LINK", "target/elsewhere").unwrap();
    let mut buf = vec![0u8; link.size() as usize];
    link.read_at(&fs, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"target/elsewhere");
}
