//! Filesystem root: mount state, allocator front-end and the inode table.
//!
//! One `FileSystem` exists per mounted volume. It owns the block cache and
//! the inode table as plain fields; nothing here is process-global. The
//! boot sector stays pinned in the cache for the lifetime of the mount.
//!
//! `sync` drains state in the crash-ordering the rest of the crate set up:
//! dirty inodes write their short entries back through the cache, FSInfo
//! follows, and only then does the dirty block queue reach the device in
//! first-dirtied order, finishing with a device flush.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, warn};
use spin::{Mutex, Once, RwLock};

use crate::block_cache::{Block, BlockCacheManager, Cache};
use crate::bpb::{BiosParameterBlock, FatVariant, FsInfoSector};
use crate::device::{BlockDevice, Device};
use crate::entry::ShortDirEntry;
use crate::fat::{FatEntry, FatTable};
use crate::inode::{Inode, FAT1216_ROOT_ID, NO_CLUSTER};
use crate::name::{ClockSource, SystemClock, Timestamp};
use crate::{FsError, FsResult, DIRENT_SIZE, FREE_COUNT_UNKNOWN};

/// Block cache budget from the `cache=` mount option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSize {
    /// 10% of available memory.
    Default,
    Percent(u32),
    Bytes(u64),
}

impl CacheSize {
    /// Sector count the budget buys at the given sector size.
    pub fn resolve(self, available_memory: u64, sector_size: usize) -> usize {
        let bytes = match self {
            CacheSize::Default => available_memory / 10,
            CacheSize::Percent(p) => available_memory / 100 * p as u64,
            CacheSize::Bytes(b) => b,
        };
        (bytes / sector_size as u64) as usize
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MountOptions {
    pub read_only: bool,
    pub cache: CacheSize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            cache: CacheSize::Default,
        }
    }
}

impl MountOptions {
    /// Parse a comma-separated option string: `ro`, `rw`,
    /// `cache=N[%|K|M|G]`. Unknown options warn and are ignored.
    pub fn parse(options: &str) -> Self {
        let mut out = Self::default();
        for opt in options.split(',').filter(|o| !o.is_empty()) {
            if opt == "ro" {
                out.read_only = true;
            } else if opt == "rw" {
                out.read_only = false;
            } else if let Some(value) = opt.strip_prefix("cache=") {
                match parse_cache_size(value) {
                    Some(size) => out.cache = size,
                    None => warn!("ignoring malformed cache size '{}'", value),
                }
            } else {
                warn!("ignoring unknown mount option '{}'", opt);
            }
        }
        out
    }
}

fn parse_cache_size(value: &str) -> Option<CacheSize> {
    let (digits, suffix) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => value.split_at(i),
        None => (value, ""),
    };
    let n: u64 = digits.parse().ok()?;
    match suffix {
        "%" => {
            if n == 0 || n > 100 {
                None
            } else {
                Some(CacheSize::Percent(n as u32))
            }
        }
        "" => Some(CacheSize::Bytes(n)),
        "K" | "k" => Some(CacheSize::Bytes(n << 10)),
        "M" | "m" => Some(CacheSize::Bytes(n << 20)),
        "G" | "g" => Some(CacheSize::Bytes(n << 30)),
        _ => None,
    }
}

struct AllocState {
    /// Rolling cursor into `[0, cluster_count)`; cluster number minus 2.
    free_search: u32,
    /// `None` mirrors the on-disk "unknown" sentinel.
    free_count: Option<u32>,
    /// Counters last written to (or read from) FSInfo, to skip no-op
    /// rewrites.
    persisted: Option<(u32, u32)>,
}

pub struct FileSystem {
    device: Arc<Device>,
    cache: Mutex<BlockCacheManager>,
    bpb: BiosParameterBlock,
    /// Pin on sector 0 for the lifetime of the mount.
    #[allow(dead_code)]
    bpb_block: Arc<RwLock<Block>>,
    variant: FatVariant,
    fat: FatTable,
    clock: Box<dyn ClockSource>,
    read_only: AtomicBool,
    corrupted: AtomicBool,
    check_requested: AtomicBool,
    alloc: Mutex<AllocState>,
    /// Live inodes keyed by id. Empty files share id 0, so a bucket can
    /// hold several objects told apart by directory-entry position.
    inodes: RwLock<BTreeMap<u32, Vec<Arc<Inode>>>>,
    /// Insertion-ordered dirty list; weak so it never keeps a handle
    /// count inflated.
    dirty_inodes: Mutex<Vec<Weak<Inode>>>,
    root: Once<Arc<Inode>>,
}

impl FileSystem {
    /// Mount with the process wall clock.
    pub fn mount(
        device: Arc<dyn BlockDevice>,
        options: MountOptions,
        available_memory: u64,
    ) -> FsResult<Arc<FileSystem>> {
        Self::mount_with(device, options, available_memory, Box::new(SystemClock))
    }

    pub fn mount_with(
        device: Arc<dyn BlockDevice>,
        options: MountOptions,
        available_memory: u64,
        clock: Box<dyn ClockSource>,
    ) -> FsResult<Arc<FileSystem>> {
        let device = Arc::new(Device::new(device));
        let sector_size = device.block_size();
        if !(512..=4096).contains(&sector_size) || !sector_size.is_power_of_two() {
            error!("device sector size {} unusable for FAT", sector_size);
            return Err(FsError::Io);
        }

        let capacity = options.cache.resolve(available_memory, sector_size);
        let mut cache = BlockCacheManager::new(Arc::clone(&device), capacity);

        let bpb_block = cache.get(0)?;
        let (bpb, boot_sig) = {
            let guard = bpb_block.read();
            let bpb = guard.read(0, |b: &BiosParameterBlock| *b);
            let sig = guard.read_bytes(510, 2, |b| [b[0], b[1]]);
            (bpb, sig)
        };
        let variant = bpb.validate(boot_sig, sector_size)?;
        debug!(
            "{}: {} clusters of {} bytes, {} FATs of {} sectors, data at sector {}",
            variant.name(),
            bpb.cluster_count(),
            bpb.cluster_size(),
            bpb.fat_count(),
            bpb.sectors_per_fat(),
            bpb.first_data_sector(),
        );
        let fat = FatTable::new(&bpb);

        let mut alloc = AllocState {
            free_search: 0,
            free_count: None,
            persisted: None,
        };
        if variant == FatVariant::Fat32 {
            let fsinfo_block = cache.get(bpb.fsinfo_sector())?;
            let fsinfo = fsinfo_block.read().read(0, |f: &FsInfoSector| *f);
            if fsinfo.signatures_ok() {
                let clusters = bpb.cluster_count();
                if fsinfo.free_count() <= clusters {
                    alloc.free_count = Some(fsinfo.free_count());
                }
                let hint = fsinfo.next_free();
                if hint >= 2 && hint < clusters + 2 {
                    alloc.free_search = hint - 2;
                }
                alloc.persisted = Some((fsinfo.free_count(), fsinfo.next_free()));
            } else {
                warn!("FSInfo signatures invalid; counters ignored");
            }
        }

        // size the root before anything else walks it
        let (root_id, root_first, root_size) = match variant {
            FatVariant::Fat12 | FatVariant::Fat16 => (
                FAT1216_ROOT_ID,
                FAT1216_ROOT_ID,
                (bpb.root_dirent_count() * DIRENT_SIZE) as u32,
            ),
            FatVariant::Fat32 => {
                let first = bpb.root_cluster();
                let mut length = 1u32;
                let mut cluster = first;
                loop {
                    match fat.entry(&mut cache, cluster)? {
                        FatEntry::Eof => break,
                        FatEntry::Next(next) => {
                            cluster = next;
                            length += 1;
                            if length > fat.cluster_count() {
                                error!("root directory chain never terminates");
                                return Err(FsError::Io);
                            }
                        }
                        other => {
                            error!("root directory chain hits {:?}", other);
                            return Err(FsError::Io);
                        }
                    }
                }
                (first, first, length * bpb.cluster_size() as u32)
            }
        };

        let fs = Arc::new(FileSystem {
            device,
            cache: Mutex::new(cache),
            bpb,
            bpb_block,
            variant,
            fat,
            clock,
            read_only: AtomicBool::new(options.read_only),
            corrupted: AtomicBool::new(false),
            check_requested: AtomicBool::new(false),
            alloc: Mutex::new(alloc),
            inodes: RwLock::new(BTreeMap::new()),
            dirty_inodes: Mutex::new(Vec::new()),
            root: Once::new(),
        });

        let root = Arc::new(Inode::root(root_id, root_first, root_size));
        fs.root.call_once(|| Arc::clone(&root));
        fs.inodes.write().entry(root_id).or_default().push(root);

        if !fs.was_unmounted_cleanly()? {
            warn!("volume was not unmounted cleanly; a check is advisable");
        }
        if !options.read_only {
            fs.mark_mounted()?;
        }
        Ok(fs)
    }

    pub fn root(&self) -> Arc<Inode> {
        Arc::clone(self.root.get().expect("root initialised at mount"))
    }

    pub fn root_id(&self) -> u32 {
        self.root.get().expect("root initialised at mount").id()
    }

    pub fn is_root(&self, inode: &Arc<Inode>) -> bool {
        Arc::ptr_eq(inode, self.root.get().expect("root initialised at mount"))
    }

    pub fn variant(&self) -> FatVariant {
        self.variant
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    pub(crate) fn fat(&self) -> &FatTable {
        &self.fat
    }

    pub fn cluster_size(&self) -> usize {
        self.bpb.cluster_size()
    }

    pub fn bytes_per_sector(&self) -> usize {
        self.bpb.bytes_per_sector()
    }

    pub fn sectors_per_cluster(&self) -> usize {
        self.bpb.sectors_per_cluster()
    }

    pub(crate) fn first_sector_of_cluster(&self, cluster: u32) -> u64 {
        self.bpb.first_sector_of_cluster(cluster)
    }

    pub(crate) fn first_root_sector(&self) -> u64 {
        self.bpb.first_root_sector()
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub(crate) fn block(&self, sector: u64) -> FsResult<Arc<RwLock<Block>>> {
        self.cache.lock().get(sector)
    }

    /// Latch the corruption flag: the volume goes read-only at the device,
    /// and the needs-check flag is raised for the next mount's benefit.
    pub fn corrupted(&self, why: &str) {
        if !self.corrupted.swap(true, Ordering::Relaxed) {
            error!("on-disk inconsistency, volume now read-only: {}", why);
        }
        self.check_requested.store(true, Ordering::Relaxed);
        self.device.disable_writes();
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::Relaxed)
    }

    pub fn request_check(&self) {
        self.check_requested.store(true, Ordering::Relaxed);
    }

    pub fn check_requested(&self) -> bool {
        self.check_requested.load(Ordering::Relaxed)
    }

    pub(crate) fn ensure_writable(&self) -> FsResult<()> {
        if self.is_read_only() || self.is_corrupted() {
            return Err(FsError::ReadOnly);
        }
        Ok(())
    }

    /// Follow the FAT one hop, translating chain damage into the
    /// corruption latch.
    pub(crate) fn fat_next(&self, cluster: u32) -> FsResult<Option<u32>> {
        let entry = {
            let mut cache = self.cache.lock();
            self.fat.entry(&mut cache, cluster)?
        };
        match entry {
            FatEntry::Eof => Ok(None),
            FatEntry::Next(next) => Ok(Some(next)),
            FatEntry::Bad => Err(FsError::Io),
            FatEntry::Free => {
                self.corrupted("cluster chain runs into a free cluster");
                Err(FsError::Io)
            }
            FatEntry::Invalid(value) => {
                self.corrupted(&format!("FAT entry {:#X} out of range", value));
                Err(FsError::Io)
            }
        }
    }

    pub(crate) fn fat_set(&self, cluster: u32, value: u32) -> FsResult<()> {
        let mut cache = self.cache.lock();
        self.fat.write(&mut cache, cluster, value)
    }

    /// Chain length starting at `first`, bounded by the volume size.
    pub(crate) fn chain_length_of(&self, first: u32) -> FsResult<u32> {
        if first == NO_CLUSTER {
            return Ok(0);
        }
        let mut length = 1u32;
        let mut cluster = first;
        while let Some(next) = self.fat_next(cluster)? {
            cluster = next;
            length += 1;
            if length > self.fat.cluster_count() {
                self.corrupted("cluster chain never terminates");
                return Err(FsError::Io);
            }
        }
        Ok(length)
    }

    /// Claim the first free cluster at or after the search cursor. The
    /// FAT entry itself stays zero; the caller links it. The free count
    /// is computed on first need, as the on-disk value may be unknown.
    pub(crate) fn allocate_cluster(&self) -> FsResult<u32> {
        self.ensure_writable()?;
        let mut alloc = self.alloc.lock();
        if alloc.free_count.is_none() {
            let mut cache = self.cache.lock();
            alloc.free_count = Some(self.fat.count_free(&mut cache)?);
        }
        if alloc.free_count == Some(0) {
            return Err(FsError::NoSpace);
        }
        let found = {
            let mut cache = self.cache.lock();
            self.fat.find_free(&mut cache, alloc.free_search)?
        };
        match found {
            Some(cluster) => {
                alloc.free_search = (cluster - 2 + 1) % self.fat.cluster_count();
                if let Some(count) = &mut alloc.free_count {
                    *count -= 1;
                }
                Ok(cluster)
            }
            None => {
                alloc.free_count = Some(0);
                Err(FsError::NoSpace)
            }
        }
    }

    /// Account a cluster as free again and pull the search cursor back
    /// when that lets the next allocation reuse it tightly. The caller
    /// has already zeroed the FAT entry.
    pub(crate) fn free_cluster(&self, cluster: u32) {
        debug_assert!(cluster >= 2);
        let mut alloc = self.alloc.lock();
        let index = cluster - 2;
        if index < alloc.free_search {
            alloc.free_search = index;
        }
        if let Some(count) = &mut alloc.free_count {
            *count += 1;
        }
    }

    /// Zero every FAT entry of a chain and return its clusters to the
    /// allocator.
    pub(crate) fn free_chain(&self, first: u32) -> FsResult<()> {
        let mut cluster = first;
        let mut steps = 0u32;
        while self.fat.contains(cluster) {
            let entry = {
                let mut cache = self.cache.lock();
                self.fat.entry(&mut cache, cluster)?
            };
            self.fat_set(cluster, 0)?;
            self.free_cluster(cluster);
            steps += 1;
            if steps > self.fat.cluster_count() {
                self.corrupted("freed chain never terminates");
                return Err(FsError::Io);
            }
            match entry {
                FatEntry::Next(next) => cluster = next,
                _ => break,
            }
        }
        Ok(())
    }

    /// Free clusters on the volume, scanning the FAT only when the count
    /// is not already known.
    pub fn free_count(&self) -> FsResult<u32> {
        let mut alloc = self.alloc.lock();
        if let Some(count) = alloc.free_count {
            return Ok(count);
        }
        let count = {
            let mut cache = self.cache.lock();
            self.fat.count_free(&mut cache)?
        };
        alloc.free_count = Some(count);
        Ok(count)
    }

    /// Rewrite the FSInfo sector when either counter moved. FAT32 only.
    pub(crate) fn write_fsinfo(&self) -> FsResult<()> {
        if self.variant != FatVariant::Fat32 || self.is_read_only() || self.is_corrupted() {
            return Ok(());
        }
        let mut alloc = self.alloc.lock();
        let free = alloc.free_count.unwrap_or(FREE_COUNT_UNKNOWN);
        let next = alloc.free_search + 2;
        if alloc.persisted == Some((free, next)) {
            return Ok(());
        }
        let block = self.cache.lock().get(self.bpb.fsinfo_sector())?;
        block
            .write()
            .modify(0, |f: &mut FsInfoSector| f.update(free, next));
        alloc.persisted = Some((free, next));
        Ok(())
    }

    pub(crate) fn zero_cluster(&self, cluster: u32) -> FsResult<()> {
        self.zero_cluster_range(cluster, 0, self.cluster_size())
    }

    /// Zero byte range `[from, to)` within a cluster.
    pub(crate) fn zero_cluster_range(&self, cluster: u32, from: usize, to: usize) -> FsResult<()> {
        let bps = self.bytes_per_sector();
        let base = self.first_sector_of_cluster(cluster);
        for s in 0..self.sectors_per_cluster() {
            let lo = s * bps;
            let hi = lo + bps;
            let a = from.max(lo);
            let b = to.min(hi);
            if a >= b {
                continue;
            }
            let block = self.block(base + s as u64)?;
            block.write().modify_bytes(a - lo, b - a, |bytes| bytes.fill(0));
        }
        Ok(())
    }

    /// Service-layer handle lookup by inode id.
    pub fn get_inode(&self, id: u32) -> Option<Arc<Inode>> {
        self.inodes.read().get(&id).and_then(|v| v.first().cloned())
    }

    /// The live inode for a directory entry, constructing and linking a
    /// new one on first sight. Identity is the id plus the entry's
    /// position, which keeps the shared id 0 of empty files unambiguous.
    pub(crate) fn get_or_create_inode(
        &self,
        parent: &Arc<Inode>,
        entry: &ShortDirEntry,
        dirent_block: Arc<RwLock<Block>>,
        dirent_offset: usize,
    ) -> FsResult<Arc<Inode>> {
        let id = entry.first_cluster();
        let sector = dirent_block.read().sector();
        if let Some(bucket) = self.inodes.read().get(&id) {
            for inode in bucket {
                if inode.matches_dirent(sector, dirent_offset) {
                    return Ok(Arc::clone(inode));
                }
            }
        }
        let size = if entry.is_dir() {
            self.chain_length_of(id)?
                .saturating_mul(self.cluster_size() as u32)
        } else {
            entry.file_size()
        };
        let inode = Arc::new(Inode::from_entry(
            id,
            parent,
            entry,
            dirent_block,
            dirent_offset,
            size,
        ));
        self.inodes
            .write()
            .entry(id)
            .or_default()
            .push(Arc::clone(&inode));
        Ok(inode)
    }

    /// Move an inode between id buckets after its first cluster changed.
    pub(crate) fn rekey_inode(&self, inode: &Arc<Inode>, old_id: u32, new_id: u32) {
        let mut map = self.inodes.write();
        if let Some(bucket) = map.get_mut(&old_id) {
            bucket.retain(|i| !Arc::ptr_eq(i, inode));
            if bucket.is_empty() {
                map.remove(&old_id);
            }
        }
        map.entry(new_id).or_default().push(Arc::clone(inode));
    }

    fn drop_from_table(&self, inode: &Arc<Inode>) {
        let id = inode.id();
        let mut map = self.inodes.write();
        if let Some(bucket) = map.get_mut(&id) {
            bucket.retain(|i| !Arc::ptr_eq(i, inode));
            if bucket.is_empty() {
                map.remove(&id);
            }
        }
    }

    pub(crate) fn mark_inode_dirty(&self, inode: &Arc<Inode>) {
        {
            let mut inner = inode.inner.write();
            if inner.dirty {
                return;
            }
            inner.dirty = true;
        }
        self.dirty_inodes.lock().push(Arc::downgrade(inode));
    }

    /// An unlinked inode: keep it while anything still holds it, free the
    /// chain as soon as nothing does.
    pub(crate) fn retire_inode(&self, victim: Arc<Inode>) -> FsResult<()> {
        victim.inner.write().deleted = true;
        self.reap(victim)
    }

    /// Drop a deleted inode nothing references any more, freeing its
    /// chain. Parent back-references are weak, so a deleted directory is
    /// never held hostage by inodes it once contained.
    fn reap(&self, inode: Arc<Inode>) -> FsResult<()> {
        let (deleted, remote, first) = {
            let inner = inode.inner.read();
            (inner.deleted, inner.remote_refs, inner.first_cluster)
        };
        // two strong handles: the table's and ours
        if !deleted || remote > 0 || Arc::strong_count(&inode) > 2 {
            return Ok(());
        }
        self.drop_from_table(&inode);
        drop(inode);
        if first != NO_CLUSTER && first != FAT1216_ROOT_ID {
            self.free_chain(first)?;
        }
        Ok(())
    }

    /// Service-layer open-handle accounting, independent of the core's
    /// own references.
    pub fn remote_refer(&self, inode: &Arc<Inode>) {
        inode.inner.write().remote_refs += 1;
    }

    /// Consumes the handle: the caller's last use of the `Arc` is the
    /// unref itself, so a deleted inode can be collected right here.
    pub fn remote_unref(&self, inode: Arc<Inode>) -> FsResult<()> {
        {
            let mut inner = inode.inner.write();
            inner.remote_refs = inner.remote_refs.saturating_sub(1);
        }
        self.reap(inode)
    }

    /// Shutdown path: every remote reference is dropped on the floor so
    /// handle leaks in the service layer cannot pin deleted chains.
    pub fn release_remote_refs(&self) -> FsResult<()> {
        let all: Vec<Arc<Inode>> = self
            .inodes
            .read()
            .values()
            .flat_map(|bucket| bucket.iter().cloned())
            .collect();
        for inode in all {
            inode.inner.write().remote_refs = 0;
            self.reap(inode)?;
        }
        Ok(())
    }

    /// FAT12 has no mount flags and always reports clean.
    pub fn was_unmounted_cleanly(&self) -> FsResult<bool> {
        let mask = self.variant.dirty_flags_mask();
        if mask == 0 {
            return Ok(true);
        }
        let value = {
            let mut cache = self.cache.lock();
            self.fat.read_reserved1(&mut cache)?
        };
        Ok(value & mask == mask)
    }

    /// Clear the mount-state bits in FAT entry 1 and force a sync, so a
    /// crash from here on is visible to the next mount.
    pub fn mark_mounted(&self) -> FsResult<()> {
        self.set_mount_flags(false)
    }

    /// Set the bits back and sync; skipped entirely once a check has been
    /// requested, so the next mount still sees the volume as suspect.
    pub fn mark_unmounted(&self) -> FsResult<()> {
        if self.check_requested() {
            return Ok(());
        }
        self.set_mount_flags(true)
    }

    fn set_mount_flags(&self, clean: bool) -> FsResult<()> {
        let mask = self.variant.dirty_flags_mask();
        if mask == 0 || self.is_read_only() || self.is_corrupted() {
            return Ok(());
        }
        {
            let mut cache = self.cache.lock();
            let value = self.fat.read_reserved1(&mut cache)?;
            let updated = if clean { value | mask } else { value & !mask };
            if updated != value {
                self.fat.write_reserved1(&mut cache, updated)?;
            }
        }
        self.sync()
    }

    /// Flush everything: dirty inodes, FSInfo, dirty blocks in
    /// first-dirtied order, then the device.
    pub fn sync(&self) -> FsResult<()> {
        let dirty: Vec<Weak<Inode>> = core::mem::take(&mut *self.dirty_inodes.lock());
        let mut first_err = None;
        for weak in dirty {
            if let Some(inode) = weak.upgrade() {
                if let Err(e) = inode.sync_dirent(self) {
                    // kept dirty, retried on the next sync
                    self.dirty_inodes.lock().push(Arc::downgrade(&inode));
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        self.write_fsinfo()?;
        self.cache.lock().sync_all()
    }

    /// Sync and, when safe, stamp the volume clean.
    pub fn unmount(&self) -> FsResult<()> {
        self.sync()?;
        if !self.is_read_only() && !self.is_corrupted() {
            self.mark_unmounted()?;
        }
        Ok(())
    }
}
