//! File Allocation Table manipulation
//!
//! Cluster chains are walked and rewritten through the block cache. All
//! mutating operations keep every FAT copy in sync: allocation builds the
//! chain in the first FAT and replays it into the shadow copies, rolling
//! the first FAT back if the replay fails.

use alloc::vec::Vec;
use spin::Mutex;

use strata_block::{BlockError, BlockFlags, BlockPool};
use strata_vfs::{ServiceId, VfsError, VfsResult};

use crate::bpb::{BootSector, FatType, CLST_FIRST, CLST_RES0, CLST_ROOT};

/// Number of the first FAT
pub const FAT1: u32 = 0;

/// The allocation lock protects all copies of the FAT during cluster
/// allocation. Deallocation does not need to hold it.
static FAT_ALLOC_LOCK: Mutex<()> = Mutex::new(());

pub(crate) fn berr(err: BlockError) -> VfsError {
    match err {
        BlockError::NotFound => VfsError::NotFound,
        BlockError::AlreadyExists => VfsError::AlreadyExists,
        BlockError::OutOfMemory => VfsError::OutOfMemory,
        BlockError::NotSupported => VfsError::NotSupported,
        BlockError::Busy => VfsError::Busy,
        BlockError::LimitExceeded => VfsError::LimitExceeded,
        BlockError::InvalidArgument => VfsError::InvalidArgument,
        BlockError::IoError => VfsError::IoError,
    }
}

/// Get a cluster value from the given FAT.
pub(crate) fn get_cluster(
    pool: &BlockPool,
    bs: &BootSector,
    sid: ServiceId,
    fatno: u32,
    clst: u32,
) -> VfsResult<u32> {
    match bs.fat_type() {
        FatType::Fat12 => get_cluster_fat12(pool, bs, sid, fatno, clst),
        FatType::Fat16 => get_cluster_fat16(pool, bs, sid, fatno, clst),
        FatType::Fat32 => get_cluster_fat32(pool, bs, sid, fatno, clst),
    }
}

fn get_cluster_fat12(
    pool: &BlockPool,
    bs: &BootSector,
    sid: ServiceId,
    fatno: u32,
    clst: u32,
) -> VfsResult<u32> {
    // Entries are packed three nibbles per byte pair.
    let offset = clst as u64 + clst as u64 / 2;
    let bps = bs.bps() as u64;
    if offset / bps >= bs.sf() as u64 {
        return Err(VfsError::LimitExceeded);
    }

    let fat_base = bs.rscnt() as u64 + bs.sf() as u64 * fatno as u64;
    let b = pool
        .get(sid, fat_base + offset / bps, BlockFlags::empty())
        .map_err(berr)?;

    let byte1 = b.data()[(offset % bps) as usize] as u16;
    let byte2;
    if (offset % bps) + 1 == bps {
        // The entry spans a sector boundary.
        if offset / bps + 1 >= bs.sf() as u64 {
            // It would run past the end of the FAT.
            let _ = pool.put(b);
            return Err(VfsError::LimitExceeded);
        }
        let b1 = pool
            .get(sid, fat_base + offset / bps + 1, BlockFlags::empty())
            .map_err(berr)?;
        byte2 = b1.data()[0] as u16;
        pool.put(b1).map_err(berr)?;
    } else {
        byte2 = b.data()[(offset % bps) as usize + 1] as u16;
    }
    pool.put(b).map_err(berr)?;

    let value = byte1 | (byte2 << 8);
    Ok(if clst & 1 != 0 {
        (value >> 4) as u32
    } else {
        (value & 0x0FFF) as u32
    })
}

fn get_cluster_fat16(
    pool: &BlockPool,
    bs: &BootSector,
    sid: ServiceId,
    fatno: u32,
    clst: u32,
) -> VfsResult<u32> {
    let offset = clst as u64 * 2;
    let bps = bs.bps() as u64;
    let fat_base = bs.rscnt() as u64 + bs.sf() as u64 * fatno as u64;

    let b = pool
        .get(sid, fat_base + offset / bps, BlockFlags::empty())
        .map_err(berr)?;
    let o = (offset % bps) as usize;
    let value = u16::from_le_bytes([b.data()[o], b.data()[o + 1]]) as u32;
    pool.put(b).map_err(berr)?;
    Ok(value)
}

fn get_cluster_fat32(
    pool: &BlockPool,
    bs: &BootSector,
    sid: ServiceId,
    fatno: u32,
    clst: u32,
) -> VfsResult<u32> {
    let offset = clst as u64 * 4;
    let bps = bs.bps() as u64;
    let fat_base = bs.rscnt() as u64 + bs.sf() as u64 * fatno as u64;

    let b = pool
        .get(sid, fat_base + offset / bps, BlockFlags::empty())
        .map_err(berr)?;
    let o = (offset % bps) as usize;
    let value = u32::from_le_bytes([b.data()[o], b.data()[o + 1], b.data()[o + 2], b.data()[o + 3]])
        & 0x0FFFFFFF;
    pool.put(b).map_err(berr)?;
    Ok(value)
}

/// Set a cluster value in one FAT instance.
pub(crate) fn set_cluster(
    pool: &BlockPool,
    bs: &BootSector,
    sid: ServiceId,
    fatno: u32,
    clst: u32,
    value: u32,
) -> VfsResult<()> {
    match bs.fat_type() {
        FatType::Fat12 => set_cluster_fat12(pool, bs, sid, fatno, clst, value),
        FatType::Fat16 => set_cluster_fat16(pool, bs, sid, fatno, clst, value),
        FatType::Fat32 => set_cluster_fat32(pool, bs, sid, fatno, clst, value),
    }
}

fn set_cluster_fat12(
    pool: &BlockPool,
    bs: &BootSector,
    sid: ServiceId,
    fatno: u32,
    clst: u32,
    value: u32,
) -> VfsResult<()> {
    let offset = clst as u64 + clst as u64 / 2;
    let bps = bs.bps() as u64;
    if offset / bps >= bs.sf() as u64 {
        return Err(VfsError::LimitExceeded);
    }

    let fat_base = bs.rscnt() as u64 + bs.sf() as u64 * fatno as u64;
    let b = pool
        .get(sid, fat_base + offset / bps, BlockFlags::empty())
        .map_err(berr)?;

    let o = (offset % bps) as usize;
    let mut byte1 = b.data()[o] as u16;
    let mut byte2;
    let border = (offset % bps) + 1 == bps;
    let b1 = if border {
        if offset / bps + 1 >= bs.sf() as u64 {
            let _ = pool.put(b);
            return Err(VfsError::LimitExceeded);
        }
        let b1 = pool
            .get(sid, fat_base + offset / bps + 1, BlockFlags::empty())
            .map_err(berr)?;
        byte2 = b1.data()[0] as u16;
        Some(b1)
    } else {
        byte2 = b.data()[o + 1] as u16;
        None
    };

    let value = if clst & 1 != 0 {
        byte1 &= 0x0F;
        byte2 = 0;
        (value << 4) as u16
    } else {
        byte1 = 0;
        byte2 &= 0xF0;
        (value & 0x0FFF) as u16
    };
    byte1 |= value & 0xFF;
    byte2 |= value >> 8;

    b.data_mut()[o] = byte1 as u8;
    if let Some(b1) = b1 {
        b1.data_mut()[0] = byte2 as u8;
        b1.mark_dirty();
        pool.put(b1).map_err(berr)?;
    } else {
        b.data_mut()[o + 1] = byte2 as u8;
    }

    b.mark_dirty();
    pool.put(b).map_err(berr)
}

fn set_cluster_fat16(
    pool: &BlockPool,
    bs: &BootSector,
    sid: ServiceId,
    fatno: u32,
    clst: u32,
    value: u32,
) -> VfsResult<()> {
    let offset = clst as u64 * 2;
    let bps = bs.bps() as u64;
    let fat_base = bs.rscnt() as u64 + bs.sf() as u64 * fatno as u64;

    let b = pool
        .get(sid, fat_base + offset / bps, BlockFlags::empty())
        .map_err(berr)?;
    let o = (offset % bps) as usize;
    b.data_mut()[o..o + 2].copy_from_slice(&(value as u16).to_le_bytes());
    b.mark_dirty();
    pool.put(b).map_err(berr)
}

fn set_cluster_fat32(
    pool: &BlockPool,
    bs: &BootSector,
    sid: ServiceId,
    fatno: u32,
    clst: u32,
    value: u32,
) -> VfsResult<()> {
    let offset = clst as u64 * 4;
    let bps = bs.bps() as u64;
    let fat_base = bs.rscnt() as u64 + bs.sf() as u64 * fatno as u64;

    let b = pool
        .get(sid, fat_base + offset / bps, BlockFlags::empty())
        .map_err(berr)?;
    let o = (offset % bps) as usize;
    // The top nibble is reserved and preserved.
    let old = u32::from_le_bytes([b.data()[o], b.data()[o + 1], b.data()[o + 2], b.data()[o + 3]]);
    let new = (old & 0xF0000000) | (value & 0x0FFFFFFF);
    b.data_mut()[o..o + 4].copy_from_slice(&new.to_le_bytes());
    b.mark_dirty();
    pool.put(b).map_err(berr)
}

/// Walk the cluster chain starting at `firstc` for at most
/// `max_clusters` links. Returns the last cluster visited and the number
/// of clusters seen.
pub(crate) fn cluster_walk(
    pool: &BlockPool,
    bs: &BootSector,
    sid: ServiceId,
    firstc: u32,
    max_clusters: u32,
) -> VfsResult<(u32, u32)> {
    if firstc == CLST_RES0 {
        // No space allocated to the file.
        return Ok((firstc, 0));
    }

    let clst_last1 = bs.clst_last1();
    let clst_bad = bs.clst_bad();

    let mut clst = firstc;
    let mut lastc = firstc;
    let mut clusters = 0u32;

    while clst < clst_last1 && clusters < max_clusters {
        if clst < CLST_FIRST || clst == clst_bad {
            return Err(VfsError::IoError);
        }
        lastc = clst;
        clst = get_cluster(pool, bs, sid, FAT1, clst)?;
        if clst == clst_bad {
            // A chain terminated by a bad cluster is an I/O defect, not
            // an end of file.
            return Err(VfsError::IoError);
        }
        clusters += 1;
    }

    if clst < clst_last1 {
        lastc = clst;
    }
    Ok((lastc, clusters))
}

/// Number of clusters in the chain starting at `firstc`.
pub(crate) fn clusters_get(
    pool: &BlockPool,
    bs: &BootSector,
    sid: ServiceId,
    firstc: u32,
) -> VfsResult<u32> {
    cluster_walk(pool, bs, sid, firstc, u32::MAX).map(|(_, numc)| numc)
}

/// Read a file block by its chain-relative block number.
///
/// Returns the block and the cluster it lives in so callers can cache
/// the walk position.
pub(crate) fn block_get_by_clst(
    pool: &BlockPool,
    bs: &BootSector,
    sid: ServiceId,
    fcl: u32,
    bn: u64,
    flags: BlockFlags,
) -> VfsResult<(alloc::sync::Arc<strata_block::Block>, u32)> {
    if fcl == CLST_RES0 {
        return Err(VfsError::LimitExceeded);
    }

    if !bs.is_fat32() && fcl == CLST_ROOT {
        // Root directory special case: a fixed sector run after the
        // FATs.
        if bn >= bs.rds() as u64 {
            return Err(VfsError::LimitExceeded);
        }
        let pba = bs.rscnt() as u64 + bs.fatcnt() as u64 * bs.sf() as u64 + bn;
        let b = pool.get(sid, pba, flags).map_err(berr)?;
        return Ok((b, CLST_ROOT));
    }

    let max_clusters = (bn / bs.spc() as u64) as u32;
    let (c, clusters) = cluster_walk(pool, bs, sid, fcl, max_clusters)?;
    if clusters != max_clusters {
        return Err(VfsError::LimitExceeded);
    }

    let b = pool.get(sid, bs.clbn2pbn(c, bn), flags).map_err(berr)?;
    Ok((b, c))
}

/// Replay an allocation into all shadow copies of the FAT.
pub(crate) fn alloc_shadow_clusters(
    pool: &BlockPool,
    bs: &BootSector,
    sid: ServiceId,
    lifo: &[u32],
) -> VfsResult<()> {
    let clst_last1 = bs.clst_last1();
    for fatno in FAT1 + 1..bs.fatcnt() {
        for (c, &clst) in lifo.iter().enumerate() {
            let value = if c == 0 { clst_last1 } else { lifo[c - 1] };
            set_cluster(pool, bs, sid, fatno, clst, value)?;
        }
    }
    Ok(())
}

/// Allocate `nclsts` clusters in all copies of the FAT.
///
/// The allocated clusters form an independent chain not yet belonging to
/// any file. Returns the chain's first and last cluster. On any failure
/// every tentative allocation is rolled back and `NoSpace` is reported.
pub(crate) fn alloc_clusters(
    pool: &BlockPool,
    bs: &BootSector,
    sid: ServiceId,
    nclsts: u32,
) -> VfsResult<(u32, u32)> {
    if nclsts == 0 {
        return Err(VfsError::InvalidArgument);
    }
    let mut lifo: Vec<u32> = Vec::with_capacity(nclsts as usize);
    let clst_last1 = bs.clst_last1();

    // Search the first FAT for unused clusters.
    let _alloc = FAT_ALLOC_LOCK.lock();

    let mut rc = Ok(());
    let mut clst = CLST_FIRST;
    while clst < bs.cc() + CLST_FIRST && (lifo.len() as u32) < nclsts {
        let value = match get_cluster(pool, bs, sid, FAT1, clst) {
            Ok(v) => v,
            Err(err) => {
                rc = Err(err);
                break;
            }
        };

        if value == CLST_RES0 {
            // The cluster is free. Mark it as the head of our chain so
            // far and push it on the stack of found clusters.
            let link = if lifo.is_empty() {
                clst_last1
            } else {
                lifo[lifo.len() - 1]
            };
            if let Err(err) = set_cluster(pool, bs, sid, FAT1, clst, link) {
                rc = Err(err);
                break;
            }
            lifo.push(clst);
        }
        clst += 1;
    }

    if rc.is_ok() && lifo.len() as u32 == nclsts {
        if alloc_shadow_clusters(pool, bs, sid, &lifo).is_ok() {
            let mcl = lifo[lifo.len() - 1];
            let lcl = lifo[0];
            return Ok((mcl, lcl));
        }
    }

    // Something went wrong: free every tentatively allocated cluster.
    for &clst in lifo.iter() {
        let _ = set_cluster(pool, bs, sid, FAT1, clst, CLST_RES0);
    }

    Err(VfsError::NoSpace)
}

/// Free the cluster chain starting at `firstc` in all copies of the FAT.
pub(crate) fn free_clusters(
    pool: &BlockPool,
    bs: &BootSector,
    sid: ServiceId,
    firstc: u32,
) -> VfsResult<()> {
    let clst_bad = bs.clst_bad();
    let mut clst = firstc;

    while clst < bs.clst_last1() {
        if clst < CLST_FIRST || clst >= clst_bad {
            return Err(VfsError::IoError);
        }
        let nextc = get_cluster(pool, bs, sid, FAT1, clst)?;
        for fatno in FAT1..bs.fatcnt() {
            set_cluster(pool, bs, sid, fatno, clst, CLST_RES0)?;
        }
        clst = nextc;
    }

    Ok(())
}

/// Zero out a whole cluster.
pub(crate) fn zero_cluster(
    pool: &BlockPool,
    bs: &BootSector,
    sid: ServiceId,
    c: u32,
) -> VfsResult<()> {
    for i in 0..bs.spc() as u64 {
        let (b, _) = block_get_by_clst(pool, bs, sid, c, i, BlockFlags::NOREAD)?;
        b.data_mut().fill(0);
        b.mark_dirty();
        pool.put(b).map_err(berr)?;
    }
    Ok(())
}

/// Count free clusters in the first FAT.
pub(crate) fn free_cluster_count(
    pool: &BlockPool,
    bs: &BootSector,
    sid: ServiceId,
) -> VfsResult<u32> {
    let mut free = 0;
    for clst in CLST_FIRST..bs.cc() + CLST_FIRST {
        if get_cluster(pool, bs, sid, FAT1, clst)? == CLST_RES0 {
            free += 1;
        }
    }
    Ok(free)
}

/// Basic sanity checks ruling out devices which obviously do not contain
/// a FAT filesystem.
pub(crate) fn sanity_check(pool: &BlockPool, bs: &BootSector, sid: ServiceId) -> VfsResult<()> {
    if bs.fatcnt() == 0 {
        return Err(VfsError::NotSupported);
    }
    if bs.ts() == 0 {
        return Err(VfsError::NotSupported);
    }
    if bs.total_sectors_16 != 0
        && bs.total_sectors_32 != 0
        && bs.total_sectors_16 as u32 != bs.total_sectors_32
    {
        return Err(VfsError::NotSupported);
    }
    if bs.media_descriptor & 0xF0 != 0xF0 {
        return Err(VfsError::NotSupported);
    }
    if bs.sf() == 0 {
        return Err(VfsError::NotSupported);
    }
    // Root directory entries must take up whole sectors so the root and
    // regular directories can be treated uniformly.
    if !bs.is_fat32() && (bs.rde() as usize * crate::bpb::DENTRY_SIZE) % bs.bps() as usize != 0 {
        return Err(VfsError::NotSupported);
    }

    // Check the signature entries of each FAT copy.
    for fatno in 0..bs.fatcnt() {
        let e0 = get_cluster(pool, bs, sid, fatno, 0).map_err(|_| VfsError::IoError)?;
        let e1 = get_cluster(pool, bs, sid, fatno, 1).map_err(|_| VfsError::IoError)?;

        if e0 & 0xFF != bs.media_descriptor as u32 {
            return Err(VfsError::NotSupported);
        }
        if bs.fat_type() != FatType::Fat12
            && ((e0 >> 8) != (bs.mask() >> 8) || e1 != bs.mask())
        {
            return Err(VfsError::NotSupported);
        }
    }

    Ok(())
}
