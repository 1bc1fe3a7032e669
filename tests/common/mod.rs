//! Shared fixtures: an in-memory block device and bare-bones volume
//! builders for all three FAT widths.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use spin::Mutex;

use fat_rs::name::FixedClock;
use fat_rs::{
    BlockDevice, FileSystem, FsResult, MountOptions, Timestamp,
};

pub const SECTOR: usize = 512;

pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn from_image(image: Vec<u8>) -> Arc<Self> {
        assert_eq!(image.len() % SECTOR, 0);
        Arc::new(Self {
            data: Mutex::new(image),
            writes: AtomicUsize::new(0),
        })
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.lock())
    }
}

impl BlockDevice for RamDisk {
    fn block_size(&self) -> usize {
        SECTOR
    }

    fn read_block(&self, sector: u64, buf: &mut [u8]) -> FsResult<()> {
        let start = sector as usize * SECTOR;
        buf.copy_from_slice(&self.data.lock()[start..start + SECTOR]);
        Ok(())
    }

    fn write_block(&self, sector: u64, buf: &[u8]) -> FsResult<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let start = sector as usize * SECTOR;
        self.data.lock()[start..start + SECTOR].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> FsResult<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq)]
pub enum Width {
    Fat12,
    Fat16,
    Fat32,
}

pub struct Geometry {
    pub total_sectors: u32,
    pub sectors_per_cluster: u8,
    pub reserved: u16,
    pub root_entries: u16,
    pub cluster_count: u32,
    pub sectors_per_fat: u32,
}

fn fat_bytes(width: Width, entries: u64) -> u64 {
    match width {
        Width::Fat12 => entries * 3 / 2 + 1,
        Width::Fat16 => entries * 2,
        Width::Fat32 => entries * 4,
    }
}

/// Solve the FAT size / cluster count fixpoint for a volume layout.
pub fn geometry(width: Width, total_sectors: u32, spc: u8) -> Geometry {
    let (reserved, root_entries): (u16, u16) = match width {
        Width::Fat32 => (32, 0),
        _ => (1, 512),
    };
    let root_sectors = root_entries as u32 * 32 / SECTOR as u32;
    let mut spf = 1u32;
    loop {
        let meta = reserved as u32 + 2 * spf + root_sectors;
        let clusters = (total_sectors - meta) / spc as u32;
        let needed =
            (fat_bytes(width, clusters as u64 + 2) as u32 + SECTOR as u32 - 1) / SECTOR as u32;
        if needed <= spf {
            return Geometry {
                total_sectors,
                sectors_per_cluster: spc,
                reserved,
                root_entries,
                cluster_count: clusters,
                sectors_per_fat: spf,
            };
        }
        spf = needed;
    }
}

/// Build a freshly formatted volume image.
pub fn mkfs(width: Width, total_sectors: u32, spc: u8) -> Vec<u8> {
    let g = geometry(width, total_sectors, spc);
    match width {
        Width::Fat12 => assert!(g.cluster_count < 4085, "{} clusters", g.cluster_count),
        Width::Fat16 => assert!(
            (4085..65525).contains(&g.cluster_count),
            "{} clusters",
            g.cluster_count
        ),
        Width::Fat32 => assert!(g.cluster_count >= 65525, "{} clusters", g.cluster_count),
    }

    let mut image = vec![0u8; total_sectors as usize * SECTOR];

    // boot sector
    image[0] = 0xEB;
    image[1] = 0x3C;
    image[2] = 0x90;
    image[3..11].copy_from_slice(b"MSWIN4.1");
    image[11..13].copy_from_slice(&(SECTOR as u16).to_le_bytes());
    image[13] = spc;
    image[14..16].copy_from_slice(&g.reserved.to_le_bytes());
    image[16] = 2; // FAT copies
    image[17..19].copy_from_slice(&g.root_entries.to_le_bytes());
    if total_sectors < 0x10000 && width != Width::Fat32 {
        image[19..21].copy_from_slice(&(total_sectors as u16).to_le_bytes());
    } else {
        image[32..36].copy_from_slice(&total_sectors.to_le_bytes());
    }
    image[21] = 0xF8;
    match width {
        Width::Fat32 => {
            image[36..40].copy_from_slice(&g.sectors_per_fat.to_le_bytes());
            image[42..44].copy_from_slice(&0u16.to_le_bytes()); // version
            image[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
            image[48..50].copy_from_slice(&1u16.to_le_bytes()); // fsinfo
            image[50..52].copy_from_slice(&6u16.to_le_bytes());
            image[66] = 0x29;
            image[71..82].copy_from_slice(b"NO NAME    ");
            image[82..90].copy_from_slice(b"FAT32   ");
        }
        _ => {
            image[22..24].copy_from_slice(&(g.sectors_per_fat as u16).to_le_bytes());
            image[38] = 0x29;
            image[43..54].copy_from_slice(b"NO NAME    ");
            image[54..62].copy_from_slice(if width == Width::Fat12 {
                b"FAT12   "
            } else {
                b"FAT16   "
            });
        }
    }
    image[510] = 0x55;
    image[511] = 0xAA;

    // FSInfo with unknown counters
    if width == Width::Fat32 {
        let fsi = SECTOR;
        image[fsi..fsi + 4].copy_from_slice(&0x41615252u32.to_le_bytes());
        image[fsi + 484..fsi + 488].copy_from_slice(&0x61417272u32.to_le_bytes());
        image[fsi + 488..fsi + 492].copy_from_slice(&0xFFFFFFFFu32.to_le_bytes());
        image[fsi + 492..fsi + 496].copy_from_slice(&0xFFFFFFFFu32.to_le_bytes());
        image[fsi + 508..fsi + 512].copy_from_slice(&0xAA550000u32.to_le_bytes());
        image[fsi + 510] = 0x55;
        image[fsi + 511] = 0xAA;
    }

    // reserved FAT entries in both copies, plus the FAT32 root chain
    for copy in 0..2u32 {
        let base = (g.reserved as usize + (copy * g.sectors_per_fat) as usize) * SECTOR;
        match width {
            Width::Fat12 => {
                image[base] = 0xF8;
                image[base + 1] = 0xFF;
                image[base + 2] = 0xFF;
            }
            Width::Fat16 => {
                image[base..base + 2].copy_from_slice(&0xFFF8u16.to_le_bytes());
                image[base + 2..base + 4].copy_from_slice(&0xFFFFu16.to_le_bytes());
            }
            Width::Fat32 => {
                image[base..base + 4].copy_from_slice(&0x0FFFFFF8u32.to_le_bytes());
                image[base + 4..base + 8].copy_from_slice(&0x0FFFFFFFu32.to_le_bytes());
                image[base + 8..base + 12].copy_from_slice(&0x0FFFFFFFu32.to_le_bytes());
            }
        }
    }

    image
}

pub const TEST_TIME: Timestamp = Timestamp {
    secs: 1_600_000_000,
    nanos: 0,
};

pub fn mount(disk: &Arc<RamDisk>) -> Arc<FileSystem> {
    mount_opts(disk, MountOptions::default())
}

pub fn mount_opts(disk: &Arc<RamDisk>, options: MountOptions) -> Arc<FileSystem> {
    FileSystem::mount_with(
        Arc::clone(disk) as Arc<dyn BlockDevice>,
        options,
        64 << 20,
        Box::new(FixedClock(TEST_TIME)),
    )
    .expect("mount")
}

pub fn fresh(width: Width, total_sectors: u32, spc: u8) -> (Arc<RamDisk>, Arc<FileSystem>) {
    let disk = RamDisk::from_image(mkfs(width, total_sectors, spc));
    let fs = mount(&disk);
    (disk, fs)
}

/// The two FAT copies compared byte for byte, as `sync` must leave them.
pub fn fat_copies_identical(disk: &RamDisk, width: Width, total_sectors: u32, spc: u8) -> bool {
    let g = geometry(width, total_sectors, spc);
    disk.with_bytes(|bytes| {
        let spf = g.sectors_per_fat as usize * SECTOR;
        let fat1 = g.reserved as usize * SECTOR;
        bytes[fat1..fat1 + spf] == bytes[fat1 + spf..fat1 + 2 * spf]
    })
}
