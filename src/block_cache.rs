//! Bounded write-back cache of device sectors.
//!
//! Every sector the core touches goes through here. A cached sector is
//! pinned for as long as any `Arc` handle to it is held outside the cache;
//! pinned sectors are never evicted, so the cache can temporarily exceed
//! its bound when every resident sector is in use.
//!
//! Mutations mark the sector dirty and append it to a queue; `sync_all`
//! writes the queue back in insertion order, which is what preserves the
//! on-disk ordering of data clusters before FAT linkage before directory
//! entries during crash recovery.

use std::sync::Arc;

use lru::LruCache;
use spin::{Mutex, RwLock};

use crate::device::Device;
use crate::FsResult;

/// Floor for the configured capacity; below this the cache would thrash on
/// a single directory operation.
const CACHE_BLOCKS_MIN: usize = 8;

pub trait Cache {
    /// The read-only mapper to the cached sector.
    ///
    /// - `offset`: byte offset of a `T` within the sector
    /// - `f`: a closure to read it
    fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V;
    /// The mutable mapper to the cached sector. Marks the sector dirty.
    ///
    /// - `offset`: byte offset of a `T` within the sector
    /// - `f`: a closure to write it
    fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V;
}

pub struct Block {
    data: Vec<u8>,
    // sector number on the device, not within any cluster
    sector: u64,
    device: Arc<Device>,
    dirty: bool,
    // shared with the owning manager; push-on-first-dirty keeps it ordered
    dirty_queue: Arc<Mutex<Vec<u64>>>,
}

impl Block {
    fn load(sector: u64, device: Arc<Device>, dirty_queue: Arc<Mutex<Vec<u64>>>) -> FsResult<Self> {
        let mut data = vec![0u8; device.block_size()];
        device.read_block(sector, &mut data)?;
        Ok(Self {
            data,
            sector,
            device,
            dirty: false,
            dirty_queue,
        })
    }

    pub fn sector(&self) -> u64 {
        self.sector
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn mark_dirty(&mut self) {
        if !self.dirty {
            self.dirty = true;
            self.dirty_queue.lock().push(self.sector);
        }
    }

    fn addr_of_offset(&self, offset: usize) -> usize {
        &self.data[offset] as *const _ as usize
    }

    fn get_ref<T>(&self, offset: usize) -> &T
    where
        T: Sized,
    {
        let type_size = core::mem::size_of::<T>();
        assert!(offset + type_size <= self.data.len());
        let addr = self.addr_of_offset(offset);
        unsafe { &*(addr as *const T) }
    }

    fn get_mut<T>(&mut self, offset: usize) -> &mut T
    where
        T: Sized,
    {
        let type_size = core::mem::size_of::<T>();
        assert!(offset + type_size <= self.data.len());
        self.mark_dirty();
        let addr = self.addr_of_offset(offset);
        unsafe { &mut *(addr as *mut T) }
    }

    /// Byte-slice view for variable-length access.
    pub fn read_bytes<V>(&self, offset: usize, len: usize, f: impl FnOnce(&[u8]) -> V) -> V {
        f(&self.data[offset..offset + len])
    }

    /// Mutable byte-slice view. Marks the sector dirty.
    pub fn modify_bytes<V>(
        &mut self,
        offset: usize,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> V,
    ) -> V {
        self.mark_dirty();
        f(&mut self.data[offset..offset + len])
    }

    /// Write the sector to the device if dirty, then clear the flag.
    pub fn sync(&mut self) -> FsResult<()> {
        if self.dirty {
            self.device.write_block(self.sector, &self.data)?;
            self.dirty = false;
        }
        Ok(())
    }
}

impl Cache for Block {
    fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get_ref(offset))
    }

    fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }
}

pub struct BlockCacheManager {
    lru: LruCache<u64, Arc<RwLock<Block>>>,
    dirty_queue: Arc<Mutex<Vec<u64>>>,
    capacity: usize,
    device: Arc<Device>,
}

impl BlockCacheManager {
    pub fn new(device: Arc<Device>, capacity: usize) -> Self {
        Self {
            // the bound is enforced by hand so that pinned sectors survive
            lru: LruCache::unbounded(),
            dirty_queue: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(CACHE_BLOCKS_MIN),
            device,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Get a pinned handle to a sector, reading it from the device on a
    /// miss. A hit promotes the sector to most-recently used.
    pub fn get(&mut self, sector: u64) -> FsResult<Arc<RwLock<Block>>> {
        if let Some(block) = self.lru.get(&sector) {
            return Ok(Arc::clone(block));
        }
        if self.lru.len() >= self.capacity {
            self.evict_one()?;
        }
        let block = Arc::new(RwLock::new(Block::load(
            sector,
            Arc::clone(&self.device),
            Arc::clone(&self.dirty_queue),
        )?));
        self.lru.put(sector, Arc::clone(&block));
        Ok(block)
    }

    /// Look up a resident sector without promoting it.
    pub fn peek(&self, sector: u64) -> Option<Arc<RwLock<Block>>> {
        self.lru.peek(&sector).map(Arc::clone)
    }

    /// Drop the least-recently-used unpinned sector, writing it out first
    /// if dirty. A fully pinned cache evicts nothing and the bound is
    /// exceeded until pins are released.
    fn evict_one(&mut self) -> FsResult<()> {
        let victim = self
            .lru
            .iter()
            .rev()
            .find(|(_, block)| Arc::strong_count(block) == 1)
            .map(|(&sector, _)| sector);
        let Some(sector) = victim else {
            return Ok(());
        };
        if let Some(block) = self.lru.peek(&sector) {
            block.write().sync()?;
        }
        self.lru.pop(&sector);
        Ok(())
    }

    /// Write out every dirty sector in the order it was first dirtied,
    /// then flush the device itself.
    pub fn sync_all(&mut self) -> FsResult<()> {
        let queue: Vec<u64> = core::mem::take(&mut *self.dirty_queue.lock());
        for sector in queue {
            // evicted sectors were already written on the way out
            if let Some(block) = self.lru.peek(&sector) {
                block.write().sync()?;
            }
        }
        self.device.sync()
    }

    pub fn resident(&self) -> usize {
        self.lru.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BlockDevice;
    use crate::testutil::RamDisk;

    fn manager(sectors: usize, capacity: usize) -> BlockCacheManager {
        let disk = Arc::new(RamDisk::new(sectors, 512));
        BlockCacheManager::new(Arc::new(Device::new(disk)), capacity)
    }

    #[test]
    fn hit_returns_same_block() {
        let mut cache = manager(32, 8);
        let a = cache.get(3).unwrap();
        let b = cache.get(3).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn writes_come_back_after_sync() {
        let disk = Arc::new(RamDisk::new(32, 512));
        let device = Arc::new(Device::new(Arc::clone(&disk) as _));
        let mut cache = BlockCacheManager::new(Arc::clone(&device), 8);
        {
            let block = cache.get(5).unwrap();
            block.write().modify(10, |b: &mut u8| *b = 0xAB);
        }
        cache.sync_all().unwrap();

        let mut fresh = BlockCacheManager::new(device, 8);
        let block = fresh.get(5).unwrap();
        assert_eq!(block.read().read(10, |b: &u8| *b), 0xAB);
    }

    #[test]
    fn pinned_blocks_survive_eviction_pressure() {
        let mut cache = manager(64, 8);
        let pinned = cache.get(0).unwrap();
        pinned.write().modify(0, |b: &mut u8| *b = 1);
        for sector in 1..40 {
            cache.get(sector).unwrap();
        }
        // the pinned handle still maps the same sector
        assert_eq!(pinned.read().sector(), 0);
        assert!(cache.resident() <= 9);
        assert_eq!(pinned.read().read(0, |b: &u8| *b), 1);
    }

    #[test]
    fn dirty_evictee_is_written_out() {
        let disk = Arc::new(RamDisk::new(64, 512));
        let device = Arc::new(Device::new(Arc::clone(&disk) as _));
        let mut cache = BlockCacheManager::new(Arc::clone(&device), 8);
        cache
            .get(1)
            .unwrap()
            .write()
            .modify(0, |b: &mut u8| *b = 0x77);
        for sector in 2..20 {
            cache.get(sector).unwrap();
        }
        assert!(cache.peek(1).is_none());
        let mut probe = vec![0u8; 512];
        disk.read_block(1, &mut probe).unwrap();
        assert_eq!(probe[0], 0x77);
    }
}
