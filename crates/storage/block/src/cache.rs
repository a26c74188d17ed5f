//! Cached block management.
//!
//! Each device connection may carry a cache of logical blocks. A block is
//! keyed by its logical address; its physical address is computed once per
//! identity. Blocks with a zero reference count stay on the free list,
//! eligible for recycling. Dirty blocks are written back on recycling, on
//! `put` over the high-water mark, and always under write-through mode.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use strata_driver_traits::ServiceId;

use crate::{BlockError, BlockPool, BlockResult, DevCon};

bitflags! {
    /// Flags accepted by `BlockPool::get`.
    pub struct BlockFlags: u32 {
        /// Do not read the block contents from the device; the caller will
        /// overwrite the whole block.
        const NOREAD = 0x01;
    }
}

/// Cache write policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// `put` of a dirty block syncs it immediately.
    WriteThrough,
    /// Sync deferred to eviction or `cache_fini`.
    WriteBack,
}

/// Cache occupancy thresholds.
///
/// Below `low` the cache grows freely; above `high` idle blocks are freed
/// rather than kept for re-lookup.
#[derive(Debug, Clone, Copy)]
pub struct CacheParams {
    pub low: usize,
    pub high: usize,
}

impl Default for CacheParams {
    fn default() -> Self {
        CacheParams { low: 10, high: 20 }
    }
}

/// Retry budget for contended recycling before `Busy` is reported.
const CACHE_MAX_RETRIES: u32 = 8;

pub(crate) struct Cache {
    pub(crate) lblock_size: usize,
    /// Physical blocks per cached block
    pub(crate) blocks_cluster: usize,
    pub(crate) blocks_cached: usize,
    pub(crate) mode: CacheMode,
    pub(crate) params: CacheParams,
    pub(crate) hash: BTreeMap<u64, Arc<Block>>,
    pub(crate) free_list: Vec<Arc<Block>>,
}

impl Cache {
    fn can_grow(&self) -> bool {
        if self.blocks_cached < self.params.low {
            return true;
        }
        if !self.free_list.is_empty() {
            return false;
        }
        true
    }

    fn free_list_remove(&mut self, block: &Arc<Block>) {
        self.free_list.retain(|b| !Arc::ptr_eq(b, block));
    }

    fn free_list_to_tail(&mut self, block: &Arc<Block>) {
        self.free_list_remove(block);
        self.free_list.push(block.clone());
    }

    /// Take a reference to a block found in the hash table. Returns the
    /// latched toxic state so the caller can fail the access once the
    /// cache lock is released.
    fn take_ref(&mut self, b: &Arc<Block>) -> bool {
        let mut st = b.state.lock();
        st.refcnt += 1;
        if st.refcnt == 1 {
            self.free_list_remove(b);
        }
        st.toxic
    }
}

fn cache_of<'a>(guard: &'a mut MutexGuard<'_, Option<Cache>>) -> BlockResult<&'a mut Cache> {
    guard.as_mut().ok_or(BlockError::NotSupported)
}

struct BlockState {
    lba: u64,
    pba: u64,
    refcnt: u32,
    dirty: bool,
    toxic: bool,
}

/// A cached block.
///
/// Metadata lives behind the block mutex, contents behind a separate
/// readers/writer lock so readers of one block never serialise against
/// metadata traffic. Lock order is cache, then block, then communication
/// area.
pub struct Block {
    service_id: ServiceId,
    size: usize,
    state: Mutex<BlockState>,
    contents: RwLock<Vec<u8>>,
}

impl Block {
    fn new(service_id: ServiceId, size: usize) -> Self {
        Block {
            service_id,
            size,
            state: Mutex::new(BlockState {
                lba: 0,
                pba: 0,
                refcnt: 1,
                dirty: false,
                toxic: false,
            }),
            contents: RwLock::new(vec![0u8; size]),
        }
    }

    /// Owning device service id.
    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    /// Logical block address.
    pub fn lba(&self) -> u64 {
        self.state.lock().lba
    }

    /// Block size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Shared view of the block contents.
    pub fn data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.contents.read()
    }

    /// Exclusive view of the block contents.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.contents.write()
    }

    /// Mark the block as modified; it will be written back according to
    /// the cache mode.
    pub fn mark_dirty(&self) {
        self.state.lock().dirty = true;
    }

    #[cfg(test)]
    pub(crate) fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    #[cfg(test)]
    pub(crate) fn is_toxic(&self) -> bool {
        self.state.lock().toxic
    }

    /// Write the block contents out to the device.
    fn sync(&self, devcon: &DevCon, pba: u64, blocks_cluster: usize) -> BlockResult<()> {
        let data = self.contents.read();
        devcon.write_blocks(pba, blocks_cluster, &data)
    }
}

impl BlockPool {
    /// Attach a cache of `size`-byte logical blocks to the connection.
    ///
    /// `size` must be a whole multiple of the device block size (1:1 or
    /// small-to-large translation).
    pub fn cache_init(
        &self,
        service_id: ServiceId,
        size: usize,
        mode: CacheMode,
        params: CacheParams,
    ) -> BlockResult<()> {
        let devcon = self.devcon(service_id)?;
        let mut cache = devcon.cache.lock();
        if cache.is_some() {
            return Err(BlockError::AlreadyExists);
        }
        if size == 0 || size % devcon.pblock_size != 0 {
            return Err(BlockError::NotSupported);
        }

        *cache = Some(Cache {
            lblock_size: size,
            blocks_cluster: size / devcon.pblock_size,
            blocks_cached: 0,
            mode,
            params,
            hash: BTreeMap::new(),
            free_list: Vec::new(),
        });
        Ok(())
    }

    /// Detach and destroy the connection's cache, writing back any dirty
    /// idle blocks.
    ///
    /// All blocks are expected to be idle; a block still referenced makes
    /// the teardown fail with `Busy`.
    pub fn cache_fini(&self, service_id: ServiceId) -> BlockResult<()> {
        let devcon = self.devcon(service_id)?;
        let mut cache_guard = devcon.cache.lock();
        let cache = match cache_guard.as_mut() {
            Some(c) => c,
            None => return Ok(()),
        };

        while let Some(b) = cache.free_list.pop() {
            let st = b.state.lock();
            if st.dirty {
                b.sync(&devcon, st.pba, cache.blocks_cluster)?;
            }
            cache.hash.remove(&st.lba);
            cache.blocks_cached -= 1;
        }

        if !cache.hash.is_empty() {
            return Err(BlockError::Busy);
        }

        *cache_guard = None;
        Ok(())
    }

    /// Instantiate a block in memory and take a reference to it.
    ///
    /// With `BlockFlags::NOREAD` the contents are not fetched from the
    /// device; the caller promises to overwrite the whole block.
    pub fn get(
        &self,
        service_id: ServiceId,
        ba: u64,
        flags: BlockFlags,
    ) -> BlockResult<Arc<Block>> {
        let devcon = self.devcon(service_id)?;
        let mut retries = 0u32;

        'retry: loop {
            let mut cache_guard = devcon.cache.lock();

            if let Some(b) = cache_of(&mut cache_guard)?.hash.get(&ba).cloned() {
                let toxic = cache_of(&mut cache_guard)?.take_ref(&b);
                drop(cache_guard);
                if toxic {
                    let _ = self.put(b);
                    return Err(BlockError::IoError);
                }
                return Ok(b);
            }

            // The block was not found in the cache.
            let blocks_cluster = cache_of(&mut cache_guard)?.blocks_cluster;
            let lblock_size = cache_of(&mut cache_guard)?.lblock_size;

            let b: Arc<Block>;
            if cache_of(&mut cache_guard)?.can_grow() {
                b = Arc::new(Block::new(service_id, lblock_size));
                cache_of(&mut cache_guard)?.blocks_cached += 1;
            } else {
                // Recycle a block from the free list.
                let cand = match cache_of(&mut cache_guard)?.free_list.first().cloned() {
                    Some(c) => c,
                    None => return Err(BlockError::OutOfMemory),
                };

                let mut st = cand.state.lock();
                if st.dirty {
                    // The block must reach the device before it changes
                    // identity. Move it to the tail of the free list so
                    // other callers draining the list are not slowed down,
                    // and sync without the cache lock held.
                    cache_of(&mut cache_guard)?.free_list_to_tail(&cand);
                    drop(cache_guard);

                    let pba = st.pba;
                    if cand.sync(&devcon, pba, blocks_cluster).is_err() {
                        // Keep the block around for another try.
                        drop(st);
                        retries += 1;
                        if retries > CACHE_MAX_RETRIES {
                            return Err(BlockError::Busy);
                        }
                        continue 'retry;
                    }
                    st.dirty = false;

                    cache_guard = match devcon.cache.try_lock() {
                        Some(g) => g,
                        None => {
                            // Somebody is racing with us; start over.
                            drop(st);
                            retries += 1;
                            if retries > CACHE_MAX_RETRIES {
                                return Err(BlockError::Busy);
                            }
                            continue 'retry;
                        }
                    };

                    if let Some(other) = cache_of(&mut cache_guard)?.hash.get(&ba).cloned() {
                        // Someone else instantiated the block while the
                        // cache was unlocked. Leave the recycled candidate
                        // on the free list and use the found block.
                        drop(st);
                        let toxic = cache_of(&mut cache_guard)?.take_ref(&other);
                        drop(cache_guard);
                        if toxic {
                            let _ = self.put(other);
                            return Err(BlockError::IoError);
                        }
                        return Ok(other);
                    }
                }

                // Unlink the candidate from the free list and hash table.
                let old_lba = st.lba;
                drop(st);
                let cache = cache_of(&mut cache_guard)?;
                cache.free_list_remove(&cand);
                cache.hash.remove(&old_lba);
                b = cand;
            }

            {
                let mut st = b.state.lock();
                st.lba = ba;
                st.pba = ba * blocks_cluster as u64;
                st.refcnt = 1;
                st.dirty = false;
                st.toxic = false;
            }
            cache_of(&mut cache_guard)?.hash.insert(ba, b.clone());

            // Hold the block lock over the read so concurrent cache
            // operations are not blocked by the device.
            let mut st = b.state.lock();
            drop(cache_guard);

            if !flags.contains(BlockFlags::NOREAD) {
                let pba = st.pba;
                let rc = {
                    let mut data = b.contents.write();
                    devcon.read_blocks(pba, blocks_cluster, &mut data)
                };
                if let Err(err) = rc {
                    st.toxic = true;
                    drop(st);
                    let _ = self.put(b);
                    return Err(err);
                }
            }

            drop(st);
            return Ok(b);
        }
    }

    /// Release a reference to a block.
    ///
    /// Dropping the last reference puts the block on the free list, or
    /// frees it when the cache is over the high-water mark or the block
    /// could not be written back.
    pub fn put(&self, block: Arc<Block>) -> BlockResult<()> {
        let devcon = self.devcon(block.service_id)?;
        let mut retries = 0u32;

        loop {
            let (blocks_cached, mode, blocks_cluster, high) = {
                let mut guard = devcon.cache.lock();
                let cache = cache_of(&mut guard)?;
                (
                    cache.blocks_cached,
                    cache.mode,
                    cache.blocks_cluster,
                    cache.params.high,
                )
            };

            // Whether to sync is decided on a snapshot taken without the
            // cache lock; the conditions are re-checked below once the
            // lock is held again.
            let mut rc: BlockResult<()> = Ok(());
            {
                let mut st = block.state.lock();
                if st.toxic {
                    // Never write back stale data.
                    st.dirty = false;
                }
                if st.dirty
                    && st.refcnt == 1
                    && (blocks_cached > high || mode != CacheMode::WriteBack)
                {
                    rc = block.sync(&devcon, st.pba, blocks_cluster);
                    st.dirty = false;
                }
            }

            let mut cache_guard = devcon.cache.lock();
            let cache = cache_of(&mut cache_guard)?;
            let mut st = block.state.lock();

            st.refcnt -= 1;
            if st.refcnt == 0 {
                if cache.blocks_cached > cache.params.high || rc.is_err() {
                    // Too many cached blocks, or the write-back failed.
                    if st.dirty {
                        // Cannot sync under the cache lock; restore the
                        // reference and start over.
                        st.refcnt += 1;
                        drop(st);
                        drop(cache_guard);
                        retries += 1;
                        if retries > CACHE_MAX_RETRIES {
                            return Err(BlockError::Busy);
                        }
                        continue;
                    }
                    let lba = st.lba;
                    cache.hash.remove(&lba);
                    cache.blocks_cached -= 1;
                    drop(st);
                    return rc;
                }
                if cache.mode != CacheMode::WriteBack && st.dirty {
                    // A concurrent modifier re-dirtied the block; restore
                    // the reference and start over.
                    st.refcnt += 1;
                    drop(st);
                    drop(cache_guard);
                    retries += 1;
                    if retries > CACHE_MAX_RETRIES {
                        return Err(BlockError::Busy);
                    }
                    continue;
                }
                cache.free_list.push(block.clone());
            }

            return rc;
        }
    }

    #[cfg(test)]
    pub(crate) fn cache_stats(&self, service_id: ServiceId) -> BlockResult<(usize, usize)> {
        let devcon = self.devcon(service_id)?;
        let mut guard = devcon.cache.lock();
        let cache = cache_of(&mut guard)?;
        Ok((cache.blocks_cached, cache.free_list.len()))
    }
}
