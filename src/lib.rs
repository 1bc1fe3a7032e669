//! User-space FAT12/16/32 driver core.
//!
//! The crate mediates between a sector-addressable block device and a
//! filesystem service layer. It owns the pieces that make FAT usable as a
//! live, writable filesystem: the FAT table and cluster-chain allocator,
//! a bounded write-back block cache, the inode cache, and the directory
//! entry engine with long-filename support.
//!
//! Layering is strict: the service boundary calls into inodes, inodes call
//! the directory / allocator / FAT / block-cache layers, and those call the
//! device. Nothing calls upward.

pub mod block_cache;
pub mod bpb;
pub mod device;
pub mod dir;
pub mod entry;
pub mod fat;
pub mod fs;
pub mod inode;
pub mod name;

pub use device::{BlockDevice, Device};
pub use fs::{CacheSize, FileSystem, MountOptions};
pub use inode::{Inode, Stat};
pub use name::{ClockSource, SystemClock, Timestamp};

/// FSInfo sector lead signature, offset 0.
pub const LEAD_SIGNATURE: u32 = 0x41615252;
/// FSInfo sector structure signature, offset 484.
pub const STRUCT_SIGNATURE: u32 = 0x61417272;
/// FSInfo sector trail signature, offset 508.
pub const TRAIL_SIGNATURE: u32 = 0xAA550000;

/// A zero FAT entry marks the cluster free, on every FAT width.
pub const FREE_CLUSTER: u32 = 0;
/// FSInfo counter value meaning "not known, recompute".
pub const FREE_COUNT_UNKNOWN: u32 = 0xFFFF_FFFF;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
/// The impossible attribute combination that marks a long-name record.
pub const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;

/// One on-disk directory record.
pub const DIRENT_SIZE: usize = 32;

/// First byte of a deleted directory record.
pub const DIR_ENTRY_UNUSED: u8 = 0xE5;
/// First byte marking unused space up to the end of the directory.
pub const DIR_ENTRY_END: u8 = 0x00;
/// Escape for a real leading 0xE5 byte in a short name.
pub const DIR_ENTRY_KANJI_ESCAPE: u8 = 0x05;

/// Ordinal flag on the first stored long-name record of a chain.
pub const LAST_LONG_ENTRY: u8 = 0x40;
/// UCS-2 code units carried by one long-name record.
pub const LONG_NAME_UNITS: usize = 13;
/// Logical name length cap, in UCS-2 code units.
pub const NAME_UNITS_MAX: usize = 255;
/// ceil(255 / 13): the longest legal long-name chain.
pub const LONG_ENTRIES_MAX: usize = 20;

/// Volumes below this cluster count are FAT12, per the one and only
/// type-determination rule.
pub const FAT12_CLUSTER_LIMIT: u32 = 4085;
/// Volumes below this cluster count (and at least `FAT12_CLUSTER_LIMIT`)
/// are FAT16; everything above is FAT32.
pub const FAT16_CLUSTER_LIMIT: u32 = 65525;

pub const SPACE: u8 = 0x20;

/// Errors surfaced to the service layer.
///
/// An inconsistency on disk is not an error kind of its own: detection
/// latches the corruption flag on the filesystem root (forcing the volume
/// read-only) and the triggering operation reports `Io`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("input/output error")]
    Io,
    #[error("no space left on volume")]
    NoSpace,
    #[error("read-only filesystem")]
    ReadOnly,
    #[error("no such file or directory")]
    NotFound,
    #[error("entry already exists")]
    Exists,
    #[error("not a directory")]
    NotDirectory,
    #[error("is a directory")]
    IsDirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("name too long")]
    NameTooLong,
    #[error("invalid name")]
    InvalidName,
    #[error("cross-device link")]
    CrossDevice,
    #[error("operation not supported")]
    Unsupported,
}

pub type FsResult<T> = Result<T, FsError>;
