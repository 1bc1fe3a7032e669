//! Directory engine.
//!
//! Directory contents are a flat sequence of 32-byte records read and
//! written through the owning inode, so ordinary directories follow their
//! cluster chains and the fixed FAT12/16 root is bounded by the BPB's
//! root-entry count.
//!
//! On-disk layout of one logical entry, low offsets first:
//!
//! ```text
//! lfn record N (ordinal N | 0x40)
//! lfn record N-1
//! ...
//! lfn record 1
//! short record
//! ```
//!
//! Creation writes the long-name records before the short record: a crash
//! in between leaves a checksum-orphaned long run that readers skip and
//! writers reuse as free space, never a half-valid entry. Deletion marks
//! every record of the chain with 0xE5.

use std::sync::Arc;

use log::warn;

use crate::block_cache::Cache;
use crate::entry::{LongDirEntry, ShortDirEntry};
use crate::fs::FileSystem;
use crate::inode::{Inode, NO_CLUSTER};
use crate::name;
use crate::{FsError, FsResult, DIRENT_SIZE, DIR_ENTRY_UNUSED, LAST_LONG_ENTRY, SPACE};

/// One logical directory entry, as yielded by iteration.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    /// Decoded UTF-8 name: the long name when a valid chain precedes the
    /// short record, otherwise the 8.3 name with its case flags applied.
    pub name: String,
    /// First cluster of the entry, which is the inode id. A directory
    /// entry holding cluster 0 is `..` of a first-level directory and
    /// maps to the root id.
    pub inode_id: u32,
    pub is_dir: bool,
    pub attr: u8,
    /// Byte offset of the short record within the directory.
    pub entry_offset: usize,
    /// Byte offset of the first record of the entry (the start of the
    /// long-name run, or the short record itself).
    pub run_start: usize,
    /// The stored 8.3 name field, for collision checks.
    pub short_name: [u8; 11],
}

impl DirEntryInfo {
    pub fn record_count(&self) -> usize {
        (self.entry_offset - self.run_start) / DIRENT_SIZE + 1
    }
}

/// Where a new entry's records will go.
struct FreeSlot {
    start: usize,
    /// Directory must grow to at least this size first.
    grow_to: Option<u32>,
}

impl Inode {
    fn read_record(
        &self,
        fs: &FileSystem,
        offset: usize,
    ) -> FsResult<Option<[u8; DIRENT_SIZE]>> {
        let mut buf = [0u8; DIRENT_SIZE];
        if self.read_at(fs, offset, &mut buf)? < DIRENT_SIZE {
            return Ok(None);
        }
        Ok(Some(buf))
    }

    fn patch_record_first_byte(&self, fs: &FileSystem, offset: usize, byte: u8) -> FsResult<()> {
        let (sector, in_sector) = self.locate(fs, offset)?.ok_or(FsError::Io)?;
        fs.block(sector)?
            .write()
            .modify_bytes(in_sector, 1, |b| b[0] = byte);
        Ok(())
    }

    /// Yield the next logical entry at or after `*pos`, consuming any
    /// long-name run. Deleted records, volume labels and orphaned
    /// long-name runs are skipped; `*pos` is left on the record after the
    /// yielded entry, or on the terminator.
    pub fn next_entry(
        self: &Arc<Self>,
        fs: &FileSystem,
        pos: &mut usize,
    ) -> FsResult<Option<DirEntryInfo>> {
        let mut lfn: Vec<LongDirEntry> = Vec::new();
        let mut run_start = 0usize;
        loop {
            let offset = *pos;
            let Some(raw) = self.read_record(fs, offset)? else {
                return Ok(None);
            };
            let short = ShortDirEntry::from_bytes(&raw);
            if short.is_end() {
                return Ok(None);
            }
            *pos += DIRENT_SIZE;
            if short.is_deleted() {
                lfn.clear();
                continue;
            }
            if short.is_long_name() {
                let long = LongDirEntry::from_bytes(&raw);
                if long.is_last_in_set() {
                    lfn.clear();
                    lfn.push(long);
                    run_start = offset;
                } else {
                    let fits = lfn.last().map_or(false, |prev| {
                        prev.sequence() == long.sequence() + 1
                            && prev.checksum() == long.checksum()
                    });
                    if fits {
                        lfn.push(long);
                    } else {
                        lfn.clear();
                    }
                }
                continue;
            }
            if short.is_volume_label() {
                lfn.clear();
                continue;
            }

            let chain_complete = !lfn.is_empty()
                && lfn.last().map_or(false, |l| l.sequence() == 1)
                && lfn[0].checksum() == short.checksum();
            let (entry_name, start) = if chain_complete {
                let frags: Vec<_> = lfn.iter().rev().map(|l| l.fragment()).collect();
                (name::join_long_name(&frags), run_start)
            } else {
                if !lfn.is_empty() {
                    warn!(
                        "orphaned long-name run before entry at byte {} of directory {}",
                        offset,
                        self.id()
                    );
                }
                (short.decoded_name(), offset)
            };

            let cluster = short.first_cluster();
            let inode_id = if short.is_dir() && cluster == NO_CLUSTER {
                fs.root_id()
            } else {
                cluster
            };
            return Ok(Some(DirEntryInfo {
                name: entry_name,
                inode_id,
                is_dir: short.is_dir(),
                attr: short.attr(),
                entry_offset: offset,
                run_start: start,
                short_name: short.name_bytes(),
            }));
        }
    }

    /// All logical entries, including `.` and `..`.
    pub fn entries(self: &Arc<Self>, fs: &FileSystem) -> FsResult<Vec<DirEntryInfo>> {
        let mut out = Vec::new();
        let mut pos = 0;
        while let Some(info) = self.next_entry(fs, &mut pos)? {
            out.push(info);
        }
        Ok(out)
    }

    fn find_entry(
        self: &Arc<Self>,
        fs: &FileSystem,
        target: &str,
    ) -> FsResult<Option<DirEntryInfo>> {
        let mut pos = 0;
        while let Some(info) = self.next_entry(fs, &mut pos)? {
            if info.name == target {
                return Ok(Some(info));
            }
        }
        Ok(None)
    }

    /// Record ranges that must not be overwritten (valid logical entries
    /// and volume labels) plus the byte offset of the terminator region.
    /// Deleted records and orphaned long-name runs fall in the gaps and
    /// count as free.
    fn occupied_intervals(
        self: &Arc<Self>,
        fs: &FileSystem,
    ) -> FsResult<(Vec<(usize, usize)>, usize)> {
        let mut intervals = Vec::new();
        let mut lfn_depth = 0usize;
        let mut lfn_sum = 0u8;
        let mut lfn_seq = 0usize;
        let mut run_start = 0usize;
        let mut pos = 0usize;
        loop {
            let Some(raw) = self.read_record(fs, pos)? else {
                return Ok((intervals, pos));
            };
            let short = ShortDirEntry::from_bytes(&raw);
            if short.is_end() {
                return Ok((intervals, pos));
            }
            let offset = pos;
            pos += DIRENT_SIZE;
            if short.is_deleted() {
                lfn_depth = 0;
                continue;
            }
            if short.is_long_name() {
                let long = LongDirEntry::from_bytes(&raw);
                if long.is_last_in_set() {
                    lfn_depth = 1;
                    lfn_sum = long.checksum();
                    lfn_seq = long.sequence();
                    run_start = offset;
                } else if lfn_depth > 0
                    && long.sequence() + 1 == lfn_seq
                    && long.checksum() == lfn_sum
                {
                    lfn_depth += 1;
                    lfn_seq = long.sequence();
                } else {
                    lfn_depth = 0;
                }
                continue;
            }
            // short record: a label or entry occupies itself, plus the
            // long run when the checksum ties them together
            let start = if lfn_depth > 0 && lfn_seq == 1 && lfn_sum == short.checksum() {
                run_start
            } else {
                offset
            };
            intervals.push((start, offset + DIRENT_SIZE));
            lfn_depth = 0;
        }
    }

    /// Earliest position with `needed` contiguous free records, growing
    /// through the terminator region when the existing space is too
    /// tight. The fixed root cannot grow.
    fn find_free_slot(self: &Arc<Self>, fs: &FileSystem, needed: usize) -> FsResult<FreeSlot> {
        let (intervals, end_offset) = self.occupied_intervals(fs)?;
        let want = needed * DIRENT_SIZE;
        let mut prev_end = 0usize;
        for &(start, end) in &intervals {
            if start - prev_end >= want {
                return Ok(FreeSlot {
                    start: prev_end,
                    grow_to: None,
                });
            }
            prev_end = end;
        }
        // from prev_end onward everything is free: trailing deleted
        // records and then the terminator region
        let start = prev_end;
        let required = start + want;
        if required <= self.size() as usize {
            return Ok(FreeSlot {
                start,
                grow_to: None,
            });
        }
        if self.first_cluster() == crate::inode::FAT1216_ROOT_ID {
            return Err(FsError::NoSpace);
        }
        let cs = fs.cluster_size();
        let aligned = (required + cs - 1) / cs * cs;
        Ok(FreeSlot {
            start,
            grow_to: Some(aligned as u32),
        })
    }

    /// Write one logical entry: pick the stored 8.3 name, lay the
    /// long-name records down first and the short record last.
    ///
    /// With `replace`, the new records supersede an existing entry of the
    /// same file: an identical short name of identical length is
    /// overwritten in place, anything else frees the old records before
    /// the new ones are placed.
    fn create_entry(
        self: &Arc<Self>,
        fs: &FileSystem,
        new_name: &str,
        proto: ShortDirEntry,
        replace: Option<&DirEntryInfo>,
    ) -> FsResult<(usize, usize)> {
        fs.ensure_writable()?;
        name::validate_name(new_name)?;

        // lookups stay byte-exact, but no two undeleted entries may carry
        // the same case-folded name
        let folded = new_name.to_lowercase();
        let mut shorts: Vec<[u8; 11]> = Vec::new();
        let mut pos = 0;
        while let Some(info) = self.next_entry(fs, &mut pos)? {
            if let Some(old) = replace {
                if old.entry_offset == info.entry_offset {
                    continue;
                }
            }
            if info.name.to_lowercase() == folded {
                return Err(FsError::Exists);
            }
            shorts.push(info.short_name);
        }

        let (name11, nt_flags, lfn_frags) = match name::short_name_with_case(new_name) {
            Some((bytes, flags)) => {
                if shorts.contains(&bytes) {
                    return Err(FsError::Exists);
                }
                (bytes, flags, None)
            }
            None => {
                let frags = name::split_long_name(new_name)?;
                let base = name::encode_fallback(new_name);
                let mut chosen = None;
                for n in 1..1_000_000u32 {
                    let candidate = name::with_numeric_tail(&base, n);
                    if !shorts.contains(&candidate) {
                        chosen = Some(candidate);
                        break;
                    }
                }
                (chosen.ok_or(FsError::Exists)?, 0u8, Some(frags))
            }
        };

        let lfn_count = lfn_frags.as_ref().map_or(0, |f| f.len());
        let needed = lfn_count + 1;

        // whether the superseded records still need clearing afterwards
        let mut clear_old_after = false;
        let slot = match replace {
            Some(old) if old.short_name == name11 && old.record_count() == needed => {
                // same short name, same footprint: rewrite in place
                old.run_start
            }
            Some(old) => {
                if old.short_name == name11 {
                    // two live entries must never share one short name,
                    // so the old records go first here
                    for off in (old.run_start..=old.entry_offset).step_by(DIRENT_SIZE) {
                        self.patch_record_first_byte(fs, off, DIR_ENTRY_UNUSED)?;
                    }
                } else {
                    clear_old_after = true;
                }
                let slot = self.find_free_slot(fs, needed)?;
                if let Some(min_size) = slot.grow_to {
                    self.grow_to(fs, min_size)?;
                }
                slot.start
            }
            None => {
                let slot = self.find_free_slot(fs, needed)?;
                if let Some(min_size) = slot.grow_to {
                    self.grow_to(fs, min_size)?;
                }
                slot.start
            }
        };

        let mut short = proto;
        short.set_name_bytes(name11, nt_flags);
        if let Some(frags) = &lfn_frags {
            let sum = name::checksum(&name11);
            let count = frags.len();
            for (i, k) in (1..=count).rev().enumerate() {
                let ordinal = if k == count {
                    k as u8 | LAST_LONG_ENTRY
                } else {
                    k as u8
                };
                let long = LongDirEntry::new(ordinal, sum, frags[k - 1]);
                self.write_at(fs, slot + i * DIRENT_SIZE, long.as_bytes())?;
            }
        }
        let entry_offset = slot + lfn_count * DIRENT_SIZE;
        self.write_at(fs, entry_offset, short.as_bytes())?;
        if clear_old_after {
            // the new records are complete; the superseded name goes away
            let old = replace.unwrap();
            for off in (old.run_start..=old.entry_offset).step_by(DIRENT_SIZE) {
                self.patch_record_first_byte(fs, off, DIR_ENTRY_UNUSED)?;
            }
        }
        Ok((slot, entry_offset))
    }

    /// The live inode behind the short record at `entry_offset`, created
    /// through the inode table on first sight.
    fn inode_for_entry(
        self: &Arc<Self>,
        fs: &FileSystem,
        entry_offset: usize,
    ) -> FsResult<Arc<Inode>> {
        let (sector, in_sector) = self.locate(fs, entry_offset)?.ok_or(FsError::Io)?;
        let block = fs.block(sector)?;
        let entry = block.read().read(in_sector, |e: &ShortDirEntry| *e);
        fs.get_or_create_inode(self, &entry, block, in_sector)
    }

    /// Resolve `target` to an inode. `.` and `..` do not walk the
    /// records. Lookup is byte-exact on the decoded name.
    pub fn open(self: &Arc<Self>, fs: &FileSystem, target: &str) -> FsResult<Arc<Inode>> {
        if !self.is_dir() {
            return Err(FsError::NotDirectory);
        }
        if target == "." || target.is_empty() {
            return Ok(Arc::clone(self));
        }
        if target == ".." {
            if fs.is_root(self) {
                return Ok(Arc::clone(self));
            }
            return self
                .parent()
                .or_else(|| fs.get_inode(self.parent_id()))
                .ok_or(FsError::NotFound);
        }
        match self.find_entry(fs, target)? {
            Some(info) => self.inode_for_entry(fs, info.entry_offset),
            None => Err(FsError::NotFound),
        }
    }

    /// Create an empty regular file.
    pub fn create_file(
        self: &Arc<Self>,
        fs: &FileSystem,
        file_name: &str,
    ) -> FsResult<Arc<Inode>> {
        if !self.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let now = fs.now();
        let mut proto = ShortDirEntry::new([SPACE; 11], 0, ShortDirEntry::file_attr(), NO_CLUSTER);
        proto.set_created(now);
        proto.set_modified(now);
        proto.set_accessed(now);
        let (_, entry_offset) = self.create_entry(fs, file_name, proto, None)?;
        self.inode_for_entry(fs, entry_offset)
    }

    /// Create a directory with its `.` and `..` entries in a zero-filled
    /// first cluster. The cluster contents reach the dirty queue before
    /// the FAT entry that commits them, and the parent's record goes last.
    pub fn create_directory(
        self: &Arc<Self>,
        fs: &FileSystem,
        dir_name: &str,
    ) -> FsResult<Arc<Inode>> {
        if !self.is_dir() {
            return Err(FsError::NotDirectory);
        }
        fs.ensure_writable()?;
        name::validate_name(dir_name)?;
        if self.find_entry(fs, dir_name)?.is_some() {
            return Err(FsError::Exists);
        }

        let now = fs.now();
        let cluster = fs.allocate_cluster()?;
        let seed = (|| -> FsResult<()> {
            fs.zero_cluster(cluster)?;

            let mut dot_name = [SPACE; 11];
            dot_name[0] = b'.';
            let mut dot = ShortDirEntry::new(dot_name, 0, ShortDirEntry::dir_attr(), cluster);
            dot.set_created(now);
            dot.set_modified(now);
            dot.set_accessed(now);

            let mut dotdot_name = [SPACE; 11];
            dotdot_name[0] = b'.';
            dotdot_name[1] = b'.';
            let parent_cluster = if fs.is_root(self) {
                NO_CLUSTER
            } else {
                self.first_cluster()
            };
            let mut dotdot =
                ShortDirEntry::new(dotdot_name, 0, ShortDirEntry::dir_attr(), parent_cluster);
            dotdot.set_created(now);
            dotdot.set_modified(now);
            dotdot.set_accessed(now);

            let sector = fs.first_sector_of_cluster(cluster);
            let block = fs.block(sector)?;
            let mut guard = block.write();
            guard.modify(0, |e: &mut ShortDirEntry| *e = dot);
            guard.modify(DIRENT_SIZE, |e: &mut ShortDirEntry| *e = dotdot);
            drop(guard);

            fs.fat_set(cluster, fs.fat().variant().eof_value())
        })();
        if let Err(e) = seed {
            fs.free_cluster(cluster);
            return Err(e);
        }

        let mut proto = ShortDirEntry::new([SPACE; 11], 0, ShortDirEntry::dir_attr(), cluster);
        proto.set_created(now);
        proto.set_modified(now);
        proto.set_accessed(now);
        match self.create_entry(fs, dir_name, proto, None) {
            Ok((_, entry_offset)) => self.inode_for_entry(fs, entry_offset),
            Err(e) => {
                // give the seeded cluster back
                let _ = fs.fat_set(cluster, 0);
                fs.free_cluster(cluster);
                Err(e)
            }
        }
    }

    /// Additional names for an existing inode. FAT cannot represent
    /// them: a second entry pointing at the same chain is exactly the
    /// cross-link a checker repairs.
    pub fn link(
        self: &Arc<Self>,
        _fs: &FileSystem,
        _link_name: &str,
        _existing: &Arc<Inode>,
    ) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    /// Create a symbolic link, stored as a regular file whose content is
    /// the target path. FAT has no on-disk marker for links; the service
    /// layer owns the convention.
    pub fn symlink(
        self: &Arc<Self>,
        fs: &FileSystem,
        link_name: &str,
        target: &str,
    ) -> FsResult<Arc<Inode>> {
        let link = self.create_file(fs, link_name)?;
        match link.write_at(fs, 0, target.as_bytes()) {
            Ok(_) => Ok(link),
            Err(e) => {
                let _ = self.unlink(fs, link_name);
                Err(e)
            }
        }
    }

    /// Whether this directory holds nothing but `.` and `..`.
    pub fn is_empty_dir(self: &Arc<Self>, fs: &FileSystem) -> FsResult<bool> {
        let mut pos = 0;
        while let Some(info) = self.next_entry(fs, &mut pos)? {
            if info.name != "." && info.name != ".." {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Remove a regular file's entry.
    pub fn unlink(self: &Arc<Self>, fs: &FileSystem, target: &str) -> FsResult<()> {
        self.remove_entry(fs, target, false)
    }

    /// Remove an empty directory's entry.
    pub fn remove_directory(self: &Arc<Self>, fs: &FileSystem, target: &str) -> FsResult<()> {
        self.remove_entry(fs, target, true)
    }

    fn remove_entry(
        self: &Arc<Self>,
        fs: &FileSystem,
        target: &str,
        want_dir: bool,
    ) -> FsResult<()> {
        fs.ensure_writable()?;
        if !self.is_dir() {
            return Err(FsError::NotDirectory);
        }
        if target == "." || target == ".." {
            return Err(FsError::InvalidName);
        }
        let info = self.find_entry(fs, target)?.ok_or(FsError::NotFound)?;
        if want_dir && !info.is_dir {
            return Err(FsError::NotDirectory);
        }
        if !want_dir && info.is_dir {
            return Err(FsError::IsDirectory);
        }
        let victim = self.inode_for_entry(fs, info.entry_offset)?;
        if want_dir && !victim.is_empty_dir(fs)? {
            return Err(FsError::NotEmpty);
        }

        for off in (info.run_start..=info.entry_offset).step_by(DIRENT_SIZE) {
            self.patch_record_first_byte(fs, off, DIR_ENTRY_UNUSED)?;
        }
        self.touch(fs);

        // the chain survives until the last reference drops
        fs.retire_inode(victim)
    }

    /// Move `old_name` in this directory to `new_name` under `new_dir`.
    /// A same-directory rename onto the same stored short name rewrites
    /// the records in place. A moved directory gets its `..` record and
    /// parent back-reference rewritten.
    pub fn rename(
        self: &Arc<Self>,
        fs: &FileSystem,
        old_name: &str,
        new_dir: &Arc<Inode>,
        new_name: &str,
    ) -> FsResult<()> {
        fs.ensure_writable()?;
        if !self.is_dir() || !new_dir.is_dir() {
            return Err(FsError::NotDirectory);
        }
        if old_name == "." || old_name == ".." || new_name == "." || new_name == ".." {
            return Err(FsError::InvalidName);
        }
        name::validate_name(new_name)?;
        let same_dir = Arc::ptr_eq(self, new_dir);
        if same_dir && old_name == new_name {
            return Ok(());
        }

        let info = self.find_entry(fs, old_name)?.ok_or(FsError::NotFound)?;
        let moved = self.inode_for_entry(fs, info.entry_offset)?;

        // a moved directory must not be carried into its own subtree
        if moved.is_dir() {
            let mut ancestor = Some(Arc::clone(new_dir));
            while let Some(a) = ancestor {
                if Arc::ptr_eq(&a, &moved) {
                    return Err(FsError::InvalidName);
                }
                ancestor = if fs.is_root(&a) {
                    None
                } else {
                    a.parent().or_else(|| fs.get_inode(a.parent_id()))
                };
            }
        }

        if let Some(existing) = new_dir.find_entry(fs, new_name)? {
            let clash_is_self = same_dir && existing.entry_offset == info.entry_offset;
            if !clash_is_self {
                if existing.is_dir {
                    if !info.is_dir {
                        return Err(FsError::IsDirectory);
                    }
                    new_dir.remove_entry(fs, new_name, true)?;
                } else {
                    if info.is_dir {
                        return Err(FsError::NotDirectory);
                    }
                    new_dir.remove_entry(fs, new_name, false)?;
                }
            }
        }

        let proto = moved.entry_snapshot();
        let entry_offset = if same_dir {
            // create_entry retires the superseded records itself
            let (_, entry_offset) = self.create_entry(fs, new_name, proto, Some(&info))?;
            entry_offset
        } else {
            let (_, entry_offset) = new_dir.create_entry(fs, new_name, proto, None)?;
            for off in (info.run_start..=info.entry_offset).step_by(DIRENT_SIZE) {
                self.patch_record_first_byte(fs, off, DIR_ENTRY_UNUSED)?;
            }
            entry_offset
        };

        let (sector, in_sector) = new_dir.locate(fs, entry_offset)?.ok_or(FsError::Io)?;
        moved.set_dirent(fs.block(sector)?, in_sector);
        moved.set_parent(new_dir);

        if moved.is_dir() && !same_dir {
            let parent_cluster = if fs.is_root(new_dir) {
                NO_CLUSTER
            } else {
                new_dir.first_cluster()
            };
            let (s, o) = moved.locate(fs, DIRENT_SIZE)?.ok_or(FsError::Io)?;
            fs.block(s)?
                .write()
                .modify(o, |e: &mut ShortDirEntry| e.set_first_cluster(parent_cluster));
        }

        self.touch(fs);
        if !same_dir {
            new_dir.touch(fs);
        }
        Ok(())
    }
}
