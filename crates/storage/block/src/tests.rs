//! Unit tests for the block cache.

use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use spin::Mutex;

use strata_driver_ram::RamDisk;
use strata_driver_traits::{BlockDevice, DriverError, DriverResult};

use super::*;

const DEV: u64 = 7;

/// RAM disk wrapper that fails transfers touching selected addresses.
struct FlakyDisk {
    inner: RamDisk,
    fail_reads: Mutex<BTreeSet<u64>>,
    fail_writes: Mutex<BTreeSet<u64>>,
}

impl FlakyDisk {
    fn new(block_size: usize, num_blocks: u64) -> Self {
        FlakyDisk {
            inner: RamDisk::new(block_size, num_blocks),
            fail_reads: Mutex::new(BTreeSet::new()),
            fail_writes: Mutex::new(BTreeSet::new()),
        }
    }
}

impl BlockDevice for FlakyDisk {
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn num_blocks(&self) -> u64 {
        self.inner.num_blocks()
    }

    fn read_blocks(&self, ba: u64, cnt: usize, buf: &mut [u8]) -> DriverResult<()> {
        let fail = self.fail_reads.lock();
        if (ba..ba + cnt as u64).any(|a| fail.contains(&a)) {
            return Err(DriverError::IoError);
        }
        self.inner.read_blocks(ba, cnt, buf)
    }

    fn write_blocks(&self, ba: u64, cnt: usize, buf: &[u8]) -> DriverResult<()> {
        let fail = self.fail_writes.lock();
        if (ba..ba + cnt as u64).any(|a| fail.contains(&a)) {
            return Err(DriverError::IoError);
        }
        self.inner.write_blocks(ba, cnt, buf)
    }
}

fn pool_with_ram(nblocks: u64, mode: CacheMode) -> (BlockPool, Arc<RamDisk>) {
    let disk = Arc::new(RamDisk::new(512, nblocks));
    let pool = BlockPool::new();
    pool.init(DEV, disk.clone(), 2048).unwrap();
    pool.cache_init(DEV, 512, mode, CacheParams::default())
        .unwrap();
    (pool, disk)
}

#[test]
fn get_put_roundtrip() {
    let (pool, disk) = pool_with_ram(64, CacheMode::WriteBack);

    let b = pool.get(DEV, 3, BlockFlags::NOREAD).unwrap();
    b.data_mut().fill(0x5A);
    b.mark_dirty();
    pool.put(b).unwrap();

    // Write-back: nothing on the device yet.
    let mut raw = [0u8; 512];
    disk.read_blocks(3, 1, &mut raw).unwrap();
    assert!(raw.iter().all(|&x| x == 0));

    pool.cache_fini(DEV).unwrap();
    disk.read_blocks(3, 1, &mut raw).unwrap();
    assert!(raw.iter().all(|&x| x == 0x5A));
}

#[test]
fn write_through_syncs_on_put() {
    let (pool, disk) = pool_with_ram(64, CacheMode::WriteThrough);

    let b = pool.get(DEV, 5, BlockFlags::NOREAD).unwrap();
    b.data_mut().fill(0xC3);
    b.mark_dirty();
    pool.put(b).unwrap();

    let mut raw = [0u8; 512];
    disk.read_blocks(5, 1, &mut raw).unwrap();
    assert!(raw.iter().all(|&x| x == 0xC3));
}

#[test]
fn cache_hit_returns_same_block() {
    let (pool, _disk) = pool_with_ram(64, CacheMode::WriteBack);

    let a = pool.get(DEV, 9, BlockFlags::NOREAD).unwrap();
    a.data_mut()[0] = 0x11;
    let b = pool.get(DEV, 9, BlockFlags::empty()).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(b.data()[0], 0x11);
    pool.put(a).unwrap();
    pool.put(b).unwrap();
}

#[test]
fn occupancy_bounded_by_high_watermark() {
    let (pool, _disk) = pool_with_ram(256, CacheMode::WriteBack);
    let params = CacheParams::default();

    // Cycle many more blocks than the cache may keep.
    for ba in 0..100u64 {
        let b = pool.get(DEV, ba, BlockFlags::NOREAD).unwrap();
        pool.put(b).unwrap();
    }

    let (cached, free) = pool.cache_stats(DEV).unwrap();
    assert!(cached <= params.high + 1);
    // Every block is idle, so the free list accounts for all of them.
    assert_eq!(cached, free);
}

#[test]
fn read_error_latches_toxic() {
    let disk = Arc::new(FlakyDisk::new(512, 64));
    let pool = BlockPool::new();
    pool.init(DEV, disk.clone(), 2048).unwrap();
    pool.cache_init(DEV, 512, CacheMode::WriteBack, CacheParams::default())
        .unwrap();

    disk.fail_reads.lock().insert(13);
    assert!(matches!(
        pool.get(DEV, 13, BlockFlags::empty()),
        Err(BlockError::IoError)
    ));

    // The error is latched: the next access fails without touching the
    // device again.
    disk.fail_reads.lock().clear();
    assert!(matches!(
        pool.get(DEV, 13, BlockFlags::empty()),
        Err(BlockError::IoError)
    ));
}

#[test]
fn toxic_block_is_never_dirty() {
    let disk = Arc::new(FlakyDisk::new(512, 64));
    let pool = BlockPool::new();
    pool.init(DEV, disk.clone(), 2048).unwrap();
    pool.cache_init(DEV, 512, CacheMode::WriteThrough, CacheParams::default())
        .unwrap();

    disk.fail_reads.lock().insert(21);
    assert!(pool.get(DEV, 21, BlockFlags::empty()).is_err());
    disk.fail_reads.lock().clear();

    // Re-fetch the poisoned block from the hash to inspect its state.
    let devcon = pool.devcon(DEV).unwrap();
    let guard = devcon.cache.lock();
    let b = guard.as_ref().unwrap().hash.get(&21).unwrap().clone();
    drop(guard);
    assert!(b.is_toxic());
    assert!(!b.is_dirty());
}

#[test]
fn noread_skips_device() {
    let disk = Arc::new(FlakyDisk::new(512, 64));
    let pool = BlockPool::new();
    pool.init(DEV, disk.clone(), 2048).unwrap();
    pool.cache_init(DEV, 512, CacheMode::WriteBack, CacheParams::default())
        .unwrap();

    disk.fail_reads.lock().insert(2);
    let b = pool.get(DEV, 2, BlockFlags::NOREAD).unwrap();
    b.data_mut().fill(1);
    b.mark_dirty();
    pool.put(b).unwrap();
}

#[test]
fn direct_io_bypasses_cache() {
    let (pool, disk) = pool_with_ram(64, CacheMode::WriteBack);

    let wbuf = [0x42u8; 512];
    pool.write_direct(DEV, 10, 1, &wbuf).unwrap();

    let mut raw = [0u8; 512];
    disk.read_blocks(10, 1, &mut raw).unwrap();
    assert_eq!(&raw[..], &wbuf[..]);

    let mut rbuf = [0u8; 512];
    pool.read_direct(DEV, 10, 1, &mut rbuf).unwrap();
    assert_eq!(&rbuf[..], &wbuf[..]);
}

#[test]
fn read_bytes_direct_unaligned() {
    let (pool, disk) = pool_with_ram(64, CacheMode::WriteBack);

    let mut image = [0u8; 1024];
    for (i, byte) in image.iter_mut().enumerate() {
        *byte = i as u8;
    }
    disk.write_blocks(0, 2, &image).unwrap();

    let mut buf = [0u8; 16];
    pool.read_bytes_direct(DEV, 508, &mut buf).unwrap();
    for (i, &byte) in buf.iter().enumerate() {
        assert_eq!(byte, (508 + i) as u8);
    }
}

#[test]
fn seqread_streams_across_blocks() {
    let (pool, disk) = pool_with_ram(8, CacheMode::WriteBack);

    let mut image = alloc::vec![0u8; 4096];
    for (i, byte) in image.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    disk.write_blocks(0, 8, &image).unwrap();

    let mut bufpos = 0usize;
    let mut buflen = 0usize;
    let mut pos = 0u64;
    let mut out = alloc::vec![0u8; 1500];
    pool.seqread(DEV, &mut bufpos, &mut buflen, &mut pos, &mut out)
        .unwrap();
    assert_eq!(pos, 1500);
    assert_eq!(&out[..], &image[..1500]);

    let mut out2 = alloc::vec![0u8; 700];
    pool.seqread(DEV, &mut bufpos, &mut buflen, &mut pos, &mut out2)
        .unwrap();
    assert_eq!(&out2[..], &image[1500..2200]);
}

#[test]
fn boot_block_is_cached_copy() {
    let (pool, disk) = pool_with_ram(8, CacheMode::WriteBack);

    let mut sector = [0u8; 512];
    sector[0] = 0xEB;
    sector[510] = 0x55;
    sector[511] = 0xAA;
    disk.write_blocks(0, 1, &sector).unwrap();

    pool.bb_read(DEV, 0).unwrap();
    let bb = pool.bb_get(DEV).unwrap();
    assert_eq!(bb[0], 0xEB);
    assert_eq!(&bb[510..512], &[0x55, 0xAA]);

    assert_eq!(pool.bb_read(DEV, 0), Err(BlockError::AlreadyExists));
}

#[test]
fn fini_rejects_double_init() {
    let disk = Arc::new(RamDisk::new(512, 8));
    let pool = BlockPool::new();
    pool.init(DEV, disk.clone(), 1024).unwrap();
    assert_eq!(
        pool.init(DEV, disk.clone(), 1024),
        Err(BlockError::AlreadyExists)
    );
    pool.fini(DEV).unwrap();
    pool.init(DEV, disk, 1024).unwrap();
}
