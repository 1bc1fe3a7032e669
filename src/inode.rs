//! In-memory file and directory objects.
//!
//! An inode is identified by the first cluster of its data, which is what
//! the cluster-high/low pair of its directory entry stores. The root
//! directory has no entry of its own: on FAT32 its id is the BPB root
//! cluster, on FAT12/16 it is the reserved value 1, which can never be a
//! data cluster and doubles as the "fixed root region" marker in the
//! first-cluster field.
//!
//! Every live inode pins the cached sector holding its directory entry,
//! so writing metadata back never has to re-walk the parent directory.
//! Mutations set a dirty flag and enqueue the inode on the filesystem's
//! dirty list; `FileSystem::sync` writes the short entries back in that
//! order before flushing the block cache.

use std::sync::{Arc, Weak};

use spin::RwLock;

use crate::block_cache::{Block, Cache};
use crate::entry::ShortDirEntry;
use crate::fs::FileSystem;
use crate::name::Timestamp;
use crate::{FsError, FsResult, ATTR_DIRECTORY, DIRENT_SIZE};

/// First-cluster value of an empty file.
pub const NO_CLUSTER: u32 = 0;
/// Inode id of the fixed FAT12/16 root directory.
pub const FAT1216_ROOT_ID: u32 = 1;

/// Answer to the service layer's stat call. Mode and ownership are the
/// in-memory values; FAT persists neither.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub ino: u32,
    pub is_dir: bool,
    pub size: u64,
    /// 512-byte units actually allocated to the chain.
    pub blocks: u64,
    pub nlink: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub created: Timestamp,
    pub modified: Timestamp,
    pub accessed: Timestamp,
}

pub(crate) struct InodeInner {
    pub(crate) id: u32,
    /// Back-reference to the containing directory, not owning; the inode
    /// table holds the strong reference for every live inode. A rename
    /// updates this explicitly. The root refers to itself by id.
    pub(crate) parent: Weak<Inode>,
    pub(crate) parent_id: u32,
    pub(crate) first_cluster: u32,
    pub(crate) size: u32,
    pub(crate) attr: u8,
    pub(crate) nt_flags: u8,
    pub(crate) created: Timestamp,
    pub(crate) modified: Timestamp,
    pub(crate) accessed: Timestamp,
    /// Pinned sector holding this inode's short entry, and the byte
    /// offset of the entry inside it. The root has neither.
    pub(crate) dirent_block: Option<Arc<RwLock<Block>>>,
    pub(crate) dirent_offset: usize,
    /// Unlinked while still referenced; the chain is freed on last close.
    pub(crate) deleted: bool,
    pub(crate) dirty: bool,
    /// Last chain position resolved, so forward sequential access does
    /// not restart from the head every time.
    pub(crate) seek: Option<(u32, u32)>,
    pub(crate) remote_refs: u32,
    pub(crate) mode: u32,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
}

pub struct Inode {
    pub(crate) inner: RwLock<InodeInner>,
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode").field("id", &self.inner.read().id).finish()
    }
}

impl Inode {
    pub(crate) fn from_entry(
        id: u32,
        parent: &Arc<Inode>,
        entry: &ShortDirEntry,
        dirent_block: Arc<RwLock<Block>>,
        dirent_offset: usize,
        size: u32,
    ) -> Self {
        Self {
            inner: RwLock::new(InodeInner {
                id,
                parent: Arc::downgrade(parent),
                parent_id: parent.id(),
                first_cluster: entry.first_cluster(),
                size,
                attr: entry.attr(),
                nt_flags: entry.nt_flags(),
                created: entry.created(),
                modified: entry.modified(),
                accessed: entry.accessed(),
                dirent_block: Some(dirent_block),
                dirent_offset,
                deleted: false,
                dirty: false,
                seek: None,
                remote_refs: 0,
                mode: 0,
                uid: 0,
                gid: 0,
            }),
        }
    }

    pub(crate) fn root(id: u32, first_cluster: u32, size: u32) -> Self {
        Self {
            inner: RwLock::new(InodeInner {
                id,
                parent: Weak::new(),
                parent_id: id,
                first_cluster,
                size,
                attr: ATTR_DIRECTORY,
                nt_flags: 0,
                created: Timestamp::EPOCH,
                modified: Timestamp::EPOCH,
                accessed: Timestamp::EPOCH,
                dirent_block: None,
                dirent_offset: 0,
                deleted: false,
                dirty: false,
                seek: None,
                remote_refs: 0,
                mode: 0,
                uid: 0,
                gid: 0,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.read().id
    }

    /// The containing directory, while it is still live. The root and
    /// inodes whose parent has been collected resolve to `None`; callers
    /// fall back to the inode table by id.
    pub fn parent(&self) -> Option<Arc<Inode>> {
        self.inner.read().parent.upgrade()
    }

    /// Inode id of the containing directory; the root names itself.
    pub fn parent_id(&self) -> u32 {
        self.inner.read().parent_id
    }

    pub(crate) fn set_parent(&self, parent: &Arc<Inode>) {
        let mut inner = self.inner.write();
        inner.parent = Arc::downgrade(parent);
        inner.parent_id = parent.id();
    }

    pub fn is_dir(&self) -> bool {
        self.inner.read().attr & ATTR_DIRECTORY != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.read().deleted
    }

    pub fn size(&self) -> u32 {
        self.inner.read().size
    }

    pub fn first_cluster(&self) -> u32 {
        self.inner.read().first_cluster
    }

    /// Whether this inode is the fixed root region of a FAT12/16 volume,
    /// which is not a cluster chain at all.
    fn is_fixed_root(inner: &InodeInner) -> bool {
        inner.first_cluster == FAT1216_ROOT_ID
    }

    pub(crate) fn matches_dirent(&self, block_sector: u64, offset: usize) -> bool {
        let inner = self.inner.read();
        match &inner.dirent_block {
            Some(block) => block.read().sector() == block_sector && inner.dirent_offset == offset,
            None => false,
        }
    }

    /// Cluster id at `chain_index` along this inode's chain, or `None`
    /// past the end. Restarts from the head only when seeking backwards.
    pub fn seek_cluster(&self, fs: &FileSystem, chain_index: u32) -> FsResult<Option<u32>> {
        let mut inner = self.inner.write();
        Self::seek_locked(&mut inner, fs, chain_index)
    }

    fn seek_locked(
        inner: &mut InodeInner,
        fs: &FileSystem,
        chain_index: u32,
    ) -> FsResult<Option<u32>> {
        debug_assert!(!Self::is_fixed_root(inner));
        if inner.first_cluster == NO_CLUSTER {
            return Ok(None);
        }
        let (mut index, mut cluster) = match inner.seek {
            Some((i, c)) if i <= chain_index => (i, c),
            _ => (0, inner.first_cluster),
        };
        if !fs.fat().contains(cluster) {
            fs.corrupted("inode first cluster out of range");
            return Err(FsError::Io);
        }
        while index < chain_index {
            match fs.fat_next(cluster)? {
                Some(next) => {
                    cluster = next;
                    index += 1;
                }
                None => return Ok(None),
            }
        }
        inner.seek = Some((index, cluster));
        Ok(Some(cluster))
    }

    /// Number of clusters in the chain. Zero for an empty file.
    pub fn chain_length(&self, fs: &FileSystem) -> FsResult<u32> {
        let mut inner = self.inner.write();
        if Self::is_fixed_root(&inner) {
            return Ok(0);
        }
        if inner.first_cluster == NO_CLUSTER {
            return Ok(0);
        }
        let mut count = 1u32;
        let mut cluster = inner.first_cluster;
        while let Some(next) = fs.fat_next(cluster)? {
            cluster = next;
            count += 1;
            if count > fs.fat().cluster_count() {
                fs.corrupted("cluster chain longer than the volume");
                return Err(FsError::Io);
            }
        }
        inner.seek = Some((count - 1, cluster));
        Ok(count)
    }

    /// Device sector and intra-sector offset backing byte `offset` of
    /// this inode, resolving the chain. `None` past the chain end.
    fn sector_of(
        inner: &mut InodeInner,
        fs: &FileSystem,
        offset: usize,
    ) -> FsResult<Option<(u64, usize)>> {
        let bps = fs.bytes_per_sector();
        if Self::is_fixed_root(inner) {
            let sector = fs.first_root_sector() + (offset / bps) as u64;
            return Ok(Some((sector, offset % bps)));
        }
        let cs = fs.cluster_size();
        let Some(cluster) = Self::seek_locked(inner, fs, (offset / cs) as u32)? else {
            return Ok(None);
        };
        let in_cluster = offset % cs;
        let sector = fs.first_sector_of_cluster(cluster) + (in_cluster / bps) as u64;
        Ok(Some((sector, in_cluster % bps)))
    }

    /// Device location of byte `offset`, for callers that patch records
    /// in place through the block cache.
    pub(crate) fn locate(&self, fs: &FileSystem, offset: usize) -> FsResult<Option<(u64, usize)>> {
        let mut inner = self.inner.write();
        Self::sector_of(&mut inner, fs, offset)
    }

    /// Re-point the pinned directory entry, after a rename moved it.
    pub(crate) fn set_dirent(&self, block: Arc<RwLock<Block>>, offset: usize) {
        let mut inner = self.inner.write();
        inner.dirent_block = Some(block);
        inner.dirent_offset = offset;
    }

    /// A short entry carrying this inode's current metadata, with the
    /// name field left for the caller to fill.
    pub(crate) fn entry_snapshot(&self) -> ShortDirEntry {
        let inner = self.inner.read();
        let mut entry = ShortDirEntry::empty();
        entry.set_attr(inner.attr);
        entry.set_first_cluster(inner.first_cluster);
        entry.set_file_size(if inner.attr & ATTR_DIRECTORY != 0 {
            0
        } else {
            inner.size
        });
        entry.set_created(inner.created);
        entry.set_modified(inner.modified);
        entry.set_accessed(inner.accessed);
        entry
    }

    /// Read up to `buf.len()` bytes at `offset`, clamped against the
    /// inode size. Returns the byte count actually read.
    pub fn read_at(&self, fs: &FileSystem, offset: usize, buf: &mut [u8]) -> FsResult<usize> {
        let mut inner = self.inner.write();
        let size = inner.size as usize;
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let end = size.min(offset + buf.len());
        let bps = fs.bytes_per_sector();

        let mut pos = offset;
        let mut done = 0;
        while pos < end {
            let Some((sector, in_sector)) = Self::sector_of(&mut inner, fs, pos)? else {
                fs.corrupted("cluster chain shorter than the recorded size");
                return Err(FsError::Io);
            };
            let len = (bps - in_sector).min(end - pos);
            let block = fs.block(sector)?;
            block
                .read()
                .read_bytes(in_sector, len, |bytes| buf[done..done + len].copy_from_slice(bytes));
            pos += len;
            done += len;
        }
        Ok(done)
    }

    /// Write `buf` at `offset`, extending and zero-filling the chain as
    /// needed. Directories never change size here; their records always
    /// lie inside the chain the directory engine maintains.
    pub fn write_at(
        self: &Arc<Self>,
        fs: &FileSystem,
        offset: usize,
        buf: &[u8],
    ) -> FsResult<usize> {
        fs.ensure_writable()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset + buf.len();
        if end > u32::MAX as usize {
            return Err(FsError::NoSpace);
        }
        {
            let inner = self.inner.read();
            if end > inner.size as usize && inner.attr & ATTR_DIRECTORY != 0 {
                return Err(FsError::Io);
            }
        }
        if end > self.size() as usize {
            self.grow_to(fs, end as u32)?;
        }

        let mut inner = self.inner.write();
        let bps = fs.bytes_per_sector();
        let mut pos = offset;
        let mut done = 0;
        while pos < end {
            let Some((sector, in_sector)) = Self::sector_of(&mut inner, fs, pos)? else {
                fs.corrupted("cluster chain shorter than the recorded size");
                return Err(FsError::Io);
            };
            let len = (bps - in_sector).min(end - pos);
            let block = fs.block(sector)?;
            block
                .write()
                .modify_bytes(in_sector, len, |bytes| bytes.copy_from_slice(&buf[done..done + len]));
            pos += len;
            done += len;
        }

        let now = fs.now();
        inner.modified = now;
        inner.accessed = now;
        drop(inner);
        fs.mark_inode_dirty(self);
        Ok(done)
    }

    /// Extend the chain so that `new_size` bytes are backed, zero-filling
    /// every newly linked cluster. FAT has no holes, so a sparse write
    /// allocates everything up to its offset.
    pub(crate) fn grow_to(self: &Arc<Self>, fs: &FileSystem, new_size: u32) -> FsResult<()> {
        fs.ensure_writable()?;
        let mut inner = self.inner.write();
        debug_assert!(!Self::is_fixed_root(&inner));
        let old_size = inner.size;
        if new_size <= old_size {
            return Ok(());
        }
        let cs = fs.cluster_size() as u32;
        let old_clusters = (old_size + cs - 1) / cs;
        let new_clusters = (new_size + cs - 1) / cs;

        // stale bytes may follow the old end inside its final cluster
        if old_clusters > 0 && old_size % cs != 0 {
            let tail = old_size % cs;
            if let Some(cluster) = Self::seek_locked(&mut inner, fs, old_clusters - 1)? {
                fs.zero_cluster_range(cluster, tail as usize, cs as usize)?;
            }
        }

        let mut fresh: Vec<u32> = Vec::with_capacity((new_clusters - old_clusters) as usize);
        for _ in old_clusters..new_clusters {
            match fs.allocate_cluster() {
                Ok(cluster) => {
                    // data first: the cluster reaches the dirty queue
                    // before any FAT sector referencing it
                    if let Err(e) = fs.zero_cluster(cluster) {
                        fs.free_cluster(cluster);
                        for &c in &fresh {
                            fs.free_cluster(c);
                        }
                        return Err(e);
                    }
                    fresh.push(cluster);
                }
                Err(e) => {
                    // roll partially allocated clusters back in
                    for &c in &fresh {
                        fs.free_cluster(c);
                    }
                    return Err(e);
                }
            }
        }

        if !fresh.is_empty() {
            let eof = fs.fat().variant().eof_value();
            for pair in fresh.windows(2) {
                fs.fat_set(pair[0], pair[1])?;
            }
            fs.fat_set(*fresh.last().unwrap(), eof)?;
            if inner.first_cluster == NO_CLUSTER {
                inner.first_cluster = fresh[0];
                inner.seek = Some((0, fresh[0]));
                let old_id = inner.id;
                inner.id = fresh[0];
                drop(inner);
                fs.rekey_inode(self, old_id, fresh[0]);
                inner = self.inner.write();
            } else {
                let tail = Self::seek_locked(&mut inner, fs, old_clusters - 1)?
                    .ok_or(FsError::Io)?;
                fs.fat_set(tail, fresh[0])?;
            }
        }

        inner.size = new_size;
        drop(inner);
        fs.mark_inode_dirty(self);
        Ok(())
    }

    /// Grow or shrink to `new_size`. Shrinking rewrites the FAT entry of
    /// the last retained cluster to end-of-chain and frees the tail; a
    /// truncation to zero also clears the first cluster.
    pub fn truncate(self: &Arc<Self>, fs: &FileSystem, new_size: u32) -> FsResult<()> {
        fs.ensure_writable()?;
        if self.is_dir() {
            return Err(FsError::IsDirectory);
        }
        let old_size = self.size();
        if new_size > old_size {
            return self.grow_to(fs, new_size);
        }
        if new_size == old_size {
            return Ok(());
        }

        let mut inner = self.inner.write();
        let cs = fs.cluster_size() as u32;
        let keep = (new_size + cs - 1) / cs;

        if inner.first_cluster != NO_CLUSTER {
            let mut tail: Vec<u32> = Vec::new();
            if keep == 0 {
                let mut cluster = Some(inner.first_cluster);
                while let Some(c) = cluster {
                    if !fs.fat().contains(c) {
                        fs.corrupted("cluster chain escapes the volume");
                        return Err(FsError::Io);
                    }
                    tail.push(c);
                    cluster = fs.fat_next(c)?;
                }
            } else if let Some(last_kept) = Self::seek_locked(&mut inner, fs, keep - 1)? {
                let mut cluster = fs.fat_next(last_kept)?;
                while let Some(c) = cluster {
                    tail.push(c);
                    cluster = fs.fat_next(c)?;
                }
                if !tail.is_empty() {
                    fs.fat_set(last_kept, fs.fat().variant().eof_value())?;
                }
            }
            for &c in &tail {
                fs.fat_set(c, 0)?;
                fs.free_cluster(c);
            }
            if keep == 0 {
                inner.first_cluster = NO_CLUSTER;
                let old_id = inner.id;
                inner.id = NO_CLUSTER;
                inner.seek = None;
                drop(inner);
                fs.rekey_inode(self, old_id, NO_CLUSTER);
                inner = self.inner.write();
            } else if let Some((index, _)) = inner.seek {
                if index >= keep {
                    inner.seek = None;
                }
            }
        }

        inner.size = new_size;
        inner.modified = fs.now();
        drop(inner);
        fs.mark_inode_dirty(self);
        Ok(())
    }

    /// Write the short entry back through the block cache and clear the
    /// dirty flag. The root and deleted inodes have nothing to write.
    pub(crate) fn sync_dirent(&self, fs: &FileSystem) -> FsResult<()> {
        let mut inner = self.inner.write();
        if !inner.dirty {
            return Ok(());
        }
        if inner.deleted || inner.dirent_block.is_none() {
            inner.dirty = false;
            return Ok(());
        }
        let block = Arc::clone(inner.dirent_block.as_ref().unwrap());
        let offset = inner.dirent_offset;
        let is_dir = inner.attr & ATTR_DIRECTORY != 0;
        debug_assert!(offset % DIRENT_SIZE == 0);
        block.write().modify(offset, |entry: &mut ShortDirEntry| {
            entry.set_first_cluster(inner.first_cluster);
            entry.set_file_size(if is_dir { 0 } else { inner.size });
            entry.set_attr(inner.attr);
            entry.set_created(inner.created);
            entry.set_modified(inner.modified);
            entry.set_accessed(inner.accessed);
        });
        inner.dirty = false;
        Ok(())
    }

    pub fn stat(&self, fs: &FileSystem) -> FsResult<Stat> {
        let chain = self.chain_length(fs)?;
        let inner = self.inner.read();
        let blocks = chain as u64 * fs.cluster_size() as u64 / 512;
        Ok(Stat {
            ino: inner.id,
            is_dir: inner.attr & ATTR_DIRECTORY != 0,
            size: inner.size as u64,
            blocks,
            nlink: 1,
            mode: inner.mode,
            uid: inner.uid,
            gid: inner.gid,
            created: inner.created,
            modified: inner.modified,
            accessed: inner.accessed,
        })
    }

    /// FAT stores no permission bits; accepted and kept in memory only,
    /// gone at unmount.
    pub fn change_mode(&self, mode: u32) {
        self.inner.write().mode = mode;
    }

    /// FAT stores no ownership; accepted and kept in memory only.
    pub fn change_owner(&self, uid: u32, gid: u32) {
        let mut inner = self.inner.write();
        inner.uid = uid;
        inner.gid = gid;
    }

    /// Stamp a content change on this inode (directories included).
    pub(crate) fn touch(self: &Arc<Self>, fs: &FileSystem) {
        let now = fs.now();
        {
            let mut inner = self.inner.write();
            inner.modified = now;
            inner.accessed = now;
        }
        fs.mark_inode_dirty(self);
    }

    pub fn utimens(
        self: &Arc<Self>,
        fs: &FileSystem,
        accessed: Option<Timestamp>,
        modified: Option<Timestamp>,
    ) -> FsResult<()> {
        fs.ensure_writable()?;
        {
            let mut inner = self.inner.write();
            if let Some(ts) = accessed {
                inner.accessed = ts;
            }
            if let Some(ts) = modified {
                inner.modified = ts;
            }
        }
        fs.mark_inode_dirty(self);
        Ok(())
    }
}
