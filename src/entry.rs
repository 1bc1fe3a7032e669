//! On-disk directory records.
//!
//! A directory is a sequence of 32-byte records. A short record carries
//! the 8+3 name, attributes, timestamps, the first-cluster pair and the
//! file size. A long-name record (attribute 0x0F) carries 13 UCS-2 code
//! units of the logical name across three disjoint ranges, an ordinal and
//! a checksum over the short name it precedes.
//!
//! Special first-byte values of any record:
//! - 0xE5: the record is free (deleted).
//! - 0x00: the record is free and so is everything after it; readers stop
//!   here instead of scanning to the end of the directory.
//! - 0x05: the real first byte is 0xE5, which is a valid lead byte in the
//!   Japanese OEM character set.
//!
//! A set of long records is stored in descending ordinal order, the
//! highest ordinal first with the 0x40 flag, immediately followed by its
//! short record. Ordinals run from 1; a damaged run (wrong order, wrong
//! checksum) is an orphan and is ignored.

use crate::name::{self, Timestamp};
use crate::{
    ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_LONG_NAME, ATTR_VOLUME_ID, DIRENT_SIZE, DIR_ENTRY_END,
    DIR_ENTRY_UNUSED, LAST_LONG_ENTRY, LONG_NAME_UNITS,
};

/// FAT 32-byte short directory record.
#[derive(Clone, Copy, Debug)]
#[repr(packed)]
pub struct ShortDirEntry {
    /// 8 name bytes then 3 extension bytes, space padded, uppercase.
    name: [u8; 11],
    /// Attribute bits; 0x0F here means the record is a long-name record.
    attr: u8,
    /// Reserved flags. The two case bits record a lowercase base or
    /// extension so that such names survive without a long-name chain.
    nt_res: u8,
    /// Creation time, hundredths of a second: 0..=199 including the odd
    /// second the 2-second `crt_time` granularity drops.
    crt_time_tenth: u8,
    crt_time: u16,
    crt_date: u16,
    /// Date of last read or write; there is no last-access time.
    lst_acc_date: u16,
    /// High half of the first cluster; always 0 on FAT12/16.
    fst_clus_hi: u16,
    wrt_time: u16,
    wrt_date: u16,
    fst_clus_lo: u16,
    /// Always 0 for directories, which are sized by their chains.
    file_size: u32,
}

const _: () = assert!(core::mem::size_of::<ShortDirEntry>() == DIRENT_SIZE);

impl ShortDirEntry {
    pub fn empty() -> Self {
        Self {
            name: [0; 11],
            attr: 0,
            nt_res: 0,
            crt_time_tenth: 0,
            crt_time: 0,
            crt_date: 0,
            lst_acc_date: 0,
            fst_clus_hi: 0,
            wrt_time: 0,
            wrt_date: 0,
            fst_clus_lo: 0,
            file_size: 0,
        }
    }

    pub fn new(name11: [u8; 11], nt_flags: u8, attr: u8, first_cluster: u32) -> Self {
        let mut entry = Self::empty();
        entry.name = name11;
        entry.nt_res = nt_flags;
        entry.attr = attr;
        entry.set_first_cluster(first_cluster);
        entry
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= DIRENT_SIZE);
        unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self as *const Self as *const u8, DIRENT_SIZE) }
    }

    pub fn first_byte(&self) -> u8 {
        self.name[0]
    }

    pub fn is_deleted(&self) -> bool {
        self.name[0] == DIR_ENTRY_UNUSED
    }

    /// Free, and everything after it in the directory is free too.
    pub fn is_end(&self) -> bool {
        self.name[0] == DIR_ENTRY_END
    }

    pub fn is_free(&self) -> bool {
        self.is_deleted() || self.is_end()
    }

    pub fn mark_deleted(&mut self) {
        self.name[0] = DIR_ENTRY_UNUSED;
    }

    pub fn is_long_name(&self) -> bool {
        self.attr & 0x3F == ATTR_LONG_NAME
    }

    pub fn is_dir(&self) -> bool {
        !self.is_long_name() && self.attr & ATTR_DIRECTORY != 0
    }

    pub fn is_volume_label(&self) -> bool {
        !self.is_long_name() && self.attr & ATTR_VOLUME_ID != 0
    }

    pub fn attr(&self) -> u8 {
        self.attr
    }

    pub fn set_attr(&mut self, attr: u8) {
        self.attr = attr;
    }

    pub fn name_bytes(&self) -> [u8; 11] {
        self.name
    }

    pub fn set_name_bytes(&mut self, name11: [u8; 11], nt_flags: u8) {
        self.name = name11;
        self.nt_res = nt_flags;
    }

    pub fn nt_flags(&self) -> u8 {
        self.nt_res
    }

    /// Decoded logical name of this record alone, case flags applied.
    pub fn decoded_name(&self) -> String {
        name::decode_short(&self.name, self.nt_res)
    }

    pub fn checksum(&self) -> u8 {
        name::checksum(&self.name)
    }

    pub fn first_cluster(&self) -> u32 {
        ((self.fst_clus_hi as u32) << 16) | self.fst_clus_lo as u32
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.fst_clus_hi = (cluster >> 16) as u16;
        self.fst_clus_lo = cluster as u16;
    }

    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    pub fn set_file_size(&mut self, size: u32) {
        self.file_size = size;
    }

    pub fn created(&self) -> Timestamp {
        name::decode_time(self.crt_date, self.crt_time, self.crt_time_tenth)
    }

    pub fn set_created(&mut self, ts: Timestamp) {
        let (date, time, tenths) = name::encode_time(ts);
        self.crt_date = date;
        self.crt_time = time;
        self.crt_time_tenth = tenths;
    }

    pub fn modified(&self) -> Timestamp {
        name::decode_time(self.wrt_date, self.wrt_time, 0)
    }

    pub fn set_modified(&mut self, ts: Timestamp) {
        let (date, time, _) = name::encode_time(ts);
        self.wrt_date = date;
        self.wrt_time = time;
    }

    pub fn accessed(&self) -> Timestamp {
        name::decode_date(self.lst_acc_date)
    }

    pub fn set_accessed(&mut self, ts: Timestamp) {
        self.lst_acc_date = name::encode_date(ts);
    }

    /// The two standard attribute sets used when creating entries.
    pub fn file_attr() -> u8 {
        ATTR_ARCHIVE
    }

    pub fn dir_attr() -> u8 {
        ATTR_DIRECTORY
    }
}

/// FAT 32-byte long-name record.
#[derive(Clone, Copy, Debug)]
#[repr(packed)]
pub struct LongDirEntry {
    /// 1-based position of this record within its set, flagged with 0x40
    /// on the last (first-stored) member. Never 0x00 or 0xE5, which keep
    /// their free-record meanings.
    ord: u8,
    /// Name units 1..=5, UTF-16LE.
    name1: [u16; 5],
    /// Always `ATTR_LONG_NAME`.
    attr: u8,
    /// Zero: sub-component of a long name.
    ldir_type: u8,
    /// Checksum over the 11 name bytes of the following short record;
    /// every member of the set carries the same value.
    chk_sum: u8,
    /// Name units 6..=11.
    name2: [u16; 6],
    /// Must be zero for compatibility with old disk tools.
    fst_clus_lo: u16,
    /// Name units 12..=13.
    name3: [u16; 2],
}

const _: () = assert!(core::mem::size_of::<LongDirEntry>() == DIRENT_SIZE);

impl LongDirEntry {
    pub fn new(ordinal: u8, checksum: u8, fragment: [u16; LONG_NAME_UNITS]) -> Self {
        let mut entry = Self {
            ord: ordinal,
            name1: [0; 5],
            attr: ATTR_LONG_NAME,
            ldir_type: 0,
            chk_sum: checksum,
            name2: [0; 6],
            fst_clus_lo: 0,
            name3: [0; 2],
        };
        entry.set_fragment(fragment);
        entry
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= DIRENT_SIZE);
        unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self as *const Self as *const u8, DIRENT_SIZE) }
    }

    pub fn ordinal(&self) -> u8 {
        self.ord
    }

    /// Position within the set, 1..=20.
    pub fn sequence(&self) -> usize {
        (self.ord & (LAST_LONG_ENTRY - 1)) as usize
    }

    pub fn is_last_in_set(&self) -> bool {
        self.ord & LAST_LONG_ENTRY != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.ord == DIR_ENTRY_UNUSED
    }

    pub fn is_end(&self) -> bool {
        self.ord == DIR_ENTRY_END
    }

    pub fn checksum(&self) -> u8 {
        self.chk_sum
    }

    pub fn mark_deleted(&mut self) {
        self.ord = DIR_ENTRY_UNUSED;
    }

    /// The 13 name units carried by this record, in logical order.
    pub fn fragment(&self) -> [u16; LONG_NAME_UNITS] {
        let mut units = [0u16; LONG_NAME_UNITS];
        units[..5].copy_from_slice(unsafe { &core::ptr::addr_of!(self.name1).read_unaligned() });
        units[5..11].copy_from_slice(unsafe { &core::ptr::addr_of!(self.name2).read_unaligned() });
        units[11..].copy_from_slice(unsafe { &core::ptr::addr_of!(self.name3).read_unaligned() });
        units
    }

    pub fn set_fragment(&mut self, units: [u16; LONG_NAME_UNITS]) {
        unsafe {
            core::ptr::addr_of_mut!(self.name1).write_unaligned(units[..5].try_into().unwrap());
            core::ptr::addr_of_mut!(self.name2).write_unaligned(units[5..11].try_into().unwrap());
            core::ptr::addr_of_mut!(self.name3).write_unaligned(units[11..].try_into().unwrap());
        }
    }
}
