//! BIOS Parameter Block (BPB) and boot sector
//!
//! The first important data structure on a FAT volume is the BPB, located
//! in the first sector of the volume in the reserved region. This sector is
//! sometimes called the "boot sector" or the "0th sector"; the important
//! fact is simply that it is the first sector of the volume.
//!
//! FAT volume layout:
//!     boot sector - reserved sectors - FAT 1 .. FAT n -
//!     root directory region (FAT12/16 only) - data region
//!
//! The count of data clusters starts at cluster 2; the maximum valid
//! cluster number for the volume is `cluster_count + 1`. Given any valid
//! data cluster number N, the first sector of that cluster is
//!     first_data_sector + (N - 2) * sectors_per_cluster
//!
//! FAT type determination has one and only one rule, and it is based on the
//! cluster count alone:
//!
//! - fewer than 4085 clusters: FAT12
//! - fewer than 65525 clusters: FAT16
//! - otherwise: FAT32
//!
//! The informational "FAT12"/"FAT16"/"FAT32" string near the end of the
//! boot sector plays no part in this and is frequently wrong on real media.
//!
//! A FAT32 FAT entry is actually only a 28-bit entry. The high 4 bits are
//! reserved, must be ignored when reading and preserved when writing; the
//! only time they are ever set is at format time, when the whole 32-bit
//! entry is zeroed.

use log::error;

use crate::{
    FsError, FsResult, FAT12_CLUSTER_LIMIT, FAT16_CLUSTER_LIMIT, LEAD_SIGNATURE, STRUCT_SIGNATURE,
    TRAIL_SIGNATURE,
};

/// On-disk FAT entry width, derived from the cluster count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatVariant {
    Fat12,
    Fat16,
    Fat32,
}

impl FatVariant {
    pub fn from_cluster_count(clusters: u32) -> Self {
        if clusters < FAT12_CLUSTER_LIMIT {
            FatVariant::Fat12
        } else if clusters < FAT16_CLUSTER_LIMIT {
            FatVariant::Fat16
        } else {
            FatVariant::Fat32
        }
    }

    /// Significant bits of one FAT entry.
    pub fn entry_mask(self) -> u32 {
        match self {
            FatVariant::Fat12 => 0x0FFF,
            FatVariant::Fat16 => 0xFFFF,
            FatVariant::Fat32 => 0x0FFF_FFFF,
        }
    }

    /// Lowest end-of-chain value; any entry at or above it terminates a
    /// chain.
    pub fn eof_min(self) -> u32 {
        match self {
            FatVariant::Fat12 => 0xFF8,
            FatVariant::Fat16 => 0xFFF8,
            FatVariant::Fat32 => 0x0FFF_FFF8,
        }
    }

    /// The canonical end-of-chain mark written into new chain tails.
    pub fn eof_value(self) -> u32 {
        self.entry_mask()
    }

    /// Bad-cluster mark, also used as the poison value a failed FAT read
    /// reports.
    pub fn bad_value(self) -> u32 {
        match self {
            FatVariant::Fat12 => 0xFF7,
            FatVariant::Fat16 => 0xFFF7,
            FatVariant::Fat32 => 0x0FFF_FFF7,
        }
    }

    pub fn is_eof(self, value: u32) -> bool {
        value >= self.eof_min()
    }

    pub fn is_bad(self, value: u32) -> bool {
        value == self.bad_value()
    }

    /// Mount-state flags held in the top two significant bits of FAT
    /// entry 1. FAT12 has no such flags.
    ///
    /// Clean-shutdown bit: 1 means the volume was unmounted cleanly.
    /// Hard-error bit: 0 means an I/O error was seen while mounted.
    pub fn dirty_flags_mask(self) -> u32 {
        match self {
            FatVariant::Fat12 => 0,
            FatVariant::Fat16 => 0x8000 | 0x4000,
            FatVariant::Fat32 => 0x0800_0000 | 0x0400_0000,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FatVariant::Fat12 => "FAT12",
            FatVariant::Fat16 => "FAT16",
            FatVariant::Fat32 => "FAT32",
        }
    }
}

/// Boot sector fields common to every FAT variant, bytes 0..36.
/// On-disk layout, all integers little-endian.
#[derive(Debug, Clone, Copy)]
#[repr(packed)]
pub struct BaseBpb {
    /// x86 jump to the boot code: 0xEB 0x?? 0x90, or 0xE9 0x?? 0x??.
    pub(crate) jmp_boot: [u8; 3],
    /// Name string, informational only.
    pub(crate) oem_name: [u8; 8],
    /// Bytes per sector: 512, 1024, 2048 or 4096.
    pub(crate) byts_per_sec: u16,
    /// Sectors per allocation unit: a non-zero power of two.
    pub(crate) sec_per_clus: u8,
    /// Sectors in the reserved region, starting with the boot sector.
    /// Must be at least 1; typically 32 on FAT32.
    pub(crate) rsvd_sec_cnt: u16,
    /// Number of FAT copies. Two on almost everything.
    pub(crate) num_fats: u8,
    /// Count of 32-byte entries in the fixed root directory. Zero on
    /// FAT32; must be sector-aligned on FAT12/16.
    pub(crate) root_ent_cnt: u16,
    /// 16-bit total sector count; zero when `tot_sec32` carries it.
    pub(crate) tot_sec16: u16,
    /// Media descriptor; 0xF8 for fixed media. Legacy.
    pub(crate) media: u8,
    /// Sectors per FAT for FAT12/16; zero on FAT32.
    pub(crate) fat_sz16: u16,
    /// Disk geometry for int 13h. Unused here.
    pub(crate) sec_per_trk: u16,
    pub(crate) num_heads: u16,
    /// Sectors preceding this volume on partitioned media.
    pub(crate) hidd_sec: u32,
    /// 32-bit total sector count; zero when `tot_sec16` carries it.
    pub(crate) tot_sec32: u32,
}

/// FAT32 extension of the boot sector, bytes 36..90. Only meaningful when
/// the cluster count says the volume is FAT32.
#[derive(Debug, Clone, Copy)]
#[repr(packed)]
pub struct Fat32Ext {
    /// Sectors per FAT. `fat_sz16` must be zero when this is in use.
    pub(crate) fat_sz32: u32,
    /// Bit 7 clear: the FAT is mirrored into every copy at runtime.
    pub(crate) ext_flags: u16,
    /// Filesystem version, must be 0x0000.
    pub(crate) fs_ver: u16,
    /// First cluster of the root directory, usually 2.
    pub(crate) root_clus: u32,
    /// Sector number of the FSInfo structure inside the reserved region,
    /// usually 1.
    pub(crate) fs_info: u16,
    /// Sector number of the backup boot record, usually 6.
    pub(crate) bk_boot_sec: u16,
    pub(crate) reserved: [u8; 12],
    pub(crate) drv_num: u8,
    pub(crate) reserved1: u8,
    /// 0x29 when the three fields below are present.
    pub(crate) boot_sig: u8,
    pub(crate) vol_id: u32,
    pub(crate) vol_lab: [u8; 11],
    /// Informational only; does not determine the FAT type.
    pub(crate) fil_sys_type: [u8; 8],
}

/// The parsed head of sector 0. The trailing 0x55AA signature lives at
/// byte offset 510 regardless of sector size and is checked from the raw
/// sector by the mount path.
#[derive(Debug, Clone, Copy)]
#[repr(packed)]
pub struct BiosParameterBlock {
    pub(crate) base: BaseBpb,
    pub(crate) ext: Fat32Ext,
}

const _: () = assert!(core::mem::size_of::<BaseBpb>() == 36);
const _: () = assert!(core::mem::size_of::<Fat32Ext>() == 54);
const _: () = assert!(core::mem::size_of::<BiosParameterBlock>() == 90);

impl BiosParameterBlock {
    pub fn bytes_per_sector(&self) -> usize {
        self.base.byts_per_sec as usize
    }

    pub fn sectors_per_cluster(&self) -> usize {
        self.base.sec_per_clus as usize
    }

    pub fn cluster_size(&self) -> usize {
        self.bytes_per_sector() * self.sectors_per_cluster()
    }

    pub fn reserved_sectors(&self) -> u64 {
        self.base.rsvd_sec_cnt as u64
    }

    pub fn fat_count(&self) -> u32 {
        self.base.num_fats as u32
    }

    pub fn root_dirent_count(&self) -> usize {
        self.base.root_ent_cnt as usize
    }

    /// Total sectors: the 16-bit field when non-zero, else the 32-bit one.
    pub fn total_sectors(&self) -> u64 {
        if self.base.tot_sec16 != 0 {
            self.base.tot_sec16 as u64
        } else {
            self.base.tot_sec32 as u64
        }
    }

    /// Sectors per FAT: the 16-bit field when non-zero, else the FAT32
    /// 32-bit one.
    pub fn sectors_per_fat(&self) -> u64 {
        if self.base.fat_sz16 != 0 {
            self.base.fat_sz16 as u64
        } else {
            self.ext.fat_sz32 as u64
        }
    }

    pub fn first_fat_sector(&self) -> u64 {
        self.reserved_sectors()
    }

    /// Sectors occupied by the fixed root directory; zero on FAT32. The
    /// computation rounds up, though a valid volume is exactly aligned.
    pub fn root_dir_sectors(&self) -> u64 {
        ((self.root_dirent_count() * 32 + self.bytes_per_sector() - 1) / self.bytes_per_sector())
            as u64
    }

    /// First sector of the fixed root directory region, right after the
    /// FAT copies.
    pub fn first_root_sector(&self) -> u64 {
        self.first_fat_sector() + self.fat_count() as u64 * self.sectors_per_fat()
    }

    /// The start of the data region, which is the first sector of
    /// cluster 2.
    pub fn first_data_sector(&self) -> u64 {
        self.first_root_sector() + self.root_dir_sectors()
    }

    pub fn data_sectors(&self) -> u64 {
        self.total_sectors().saturating_sub(self.first_data_sector())
    }

    /// The count of data clusters starting at cluster 2. Rounds down; the
    /// tail sectors that do not fill a cluster are dead space.
    pub fn cluster_count(&self) -> u32 {
        (self.data_sectors() / self.sectors_per_cluster() as u64) as u32
    }

    pub fn variant(&self) -> FatVariant {
        FatVariant::from_cluster_count(self.cluster_count())
    }

    pub fn first_sector_of_cluster(&self, cluster: u32) -> u64 {
        debug_assert!(cluster >= 2);
        self.first_data_sector() + (cluster as u64 - 2) * self.sectors_per_cluster() as u64
    }

    pub fn root_cluster(&self) -> u32 {
        self.ext.root_clus
    }

    pub fn fsinfo_sector(&self) -> u64 {
        self.ext.fs_info as u64
    }

    /// Check every constraint the mount relies on. Each rejection logs the
    /// offending field. `boot_sig` is bytes 510..512 of the raw sector.
    pub fn validate(&self, boot_sig: [u8; 2], device_block_size: usize) -> FsResult<FatVariant> {
        let jmp = self.base.jmp_boot;
        if !(jmp[0] == 0xEB && jmp[2] == 0x90) && jmp[0] != 0xE9 {
            error!("boot sector: no x86 jump at byte 0 ({:02X?})", jmp);
            return Err(FsError::Io);
        }
        if boot_sig != [0x55, 0xAA] {
            error!("boot sector: missing 0x55AA signature");
            return Err(FsError::Io);
        }
        let bps = self.bytes_per_sector();
        if !bps.is_power_of_two() || !(512..=4096).contains(&bps) {
            error!("boot sector: bytes per sector {} out of range", bps);
            return Err(FsError::Io);
        }
        if bps != device_block_size {
            error!(
                "boot sector: bytes per sector {} does not match device sector size {}",
                bps, device_block_size
            );
            return Err(FsError::Io);
        }
        let spc = self.sectors_per_cluster();
        if spc == 0 || !spc.is_power_of_two() {
            error!("boot sector: sectors per cluster {} not a power of two", spc);
            return Err(FsError::Io);
        }
        if self.reserved_sectors() < 1 {
            error!("boot sector: no reserved sectors");
            return Err(FsError::Io);
        }
        if self.fat_count() < 1 {
            error!("boot sector: no FAT copies");
            return Err(FsError::Io);
        }
        if self.total_sectors() == 0 {
            error!("boot sector: total sector count is zero");
            return Err(FsError::Io);
        }
        if self.sectors_per_fat() == 0 {
            error!("boot sector: sectors per FAT is zero");
            return Err(FsError::Io);
        }
        if self.total_sectors() <= self.first_data_sector() {
            error!("boot sector: metadata regions exceed the volume");
            return Err(FsError::Io);
        }

        let variant = self.variant();
        match variant {
            FatVariant::Fat12 | FatVariant::Fat16 => {
                if self.root_dirent_count() == 0 {
                    error!("boot sector: {} volume with no root directory", variant.name());
                    return Err(FsError::Io);
                }
                if (self.root_dirent_count() * 32) % bps != 0 {
                    error!(
                        "boot sector: root directory entry count {} not sector aligned",
                        self.root_dirent_count()
                    );
                    return Err(FsError::Io);
                }
            }
            FatVariant::Fat32 => {
                if self.root_dirent_count() != 0 {
                    error!("boot sector: FAT32 volume with a fixed root directory");
                    return Err(FsError::Io);
                }
                if self.base.fat_sz16 != 0 {
                    let fat_sz16 = self.base.fat_sz16;
                    error!("boot sector: FAT32 volume with 16-bit FAT size {}", fat_sz16);
                    return Err(FsError::Io);
                }
                let fs_ver = self.ext.fs_ver;
                if fs_ver != 0 {
                    error!("boot sector: unsupported filesystem version {:#06X}", fs_ver);
                    return Err(FsError::Io);
                }
                let root = self.root_cluster();
                if root < 2 || root >= self.cluster_count() + 2 {
                    error!("boot sector: root cluster {} out of range", root);
                    return Err(FsError::Io);
                }
                if self.fsinfo_sector() == 0 || self.fsinfo_sector() >= self.reserved_sectors() {
                    error!(
                        "boot sector: FSInfo sector {} outside the reserved region",
                        self.fsinfo_sector()
                    );
                    return Err(FsError::Io);
                }
            }
        }
        Ok(variant)
    }
}

/// FAT32 FSInfo sector. Caches the free-cluster count and a next-free
/// search hint so mounts do not have to scan the whole FAT.
///
/// Either counter may be 0xFFFFFFFF ("unknown") or stale; both are range
/// checked before use and recomputed when out of range.
#[derive(Clone, Copy)]
#[repr(packed)]
pub struct FsInfoSector {
    /// 0x41615252, offset 0.
    pub(crate) lead_sig: u32,
    pub(crate) reserved1: [u8; 480],
    /// 0x61417272, offset 484.
    pub(crate) struc_sig: u32,
    /// Last known free cluster count, offset 488.
    pub(crate) free_count: u32,
    /// Cluster number at which to start looking for free clusters,
    /// offset 492.
    pub(crate) next_free: u32,
    pub(crate) reserved2: [u8; 12],
    /// 0xAA550000, offset 508. The high two bytes land at offsets 510 and
    /// 511 and match the boot sector signature bytes.
    pub(crate) trail_sig: u32,
}

const _: () = assert!(core::mem::size_of::<FsInfoSector>() == 512);

impl FsInfoSector {
    pub fn signatures_ok(&self) -> bool {
        self.lead_sig == LEAD_SIGNATURE
            && self.struc_sig == STRUCT_SIGNATURE
            && self.trail_sig == TRAIL_SIGNATURE
    }

    pub fn free_count(&self) -> u32 {
        self.free_count
    }

    pub fn next_free(&self) -> u32 {
        self.next_free
    }

    /// Rewrite the three signatures and both counters.
    pub fn update(&mut self, free_count: u32, next_free: u32) {
        self.lead_sig = LEAD_SIGNATURE;
        self.struc_sig = STRUCT_SIGNATURE;
        self.trail_sig = TRAIL_SIGNATURE;
        self.free_count = free_count;
        self.next_free = next_free;
    }
}
