//! In-core FAT nodes and the idle node cache
//!
//! Every open FAT object has one in-core node carrying its first
//! cluster, size and the cluster caches that spare repeated FAT walks.
//! Nodes whose reference count drops to zero stay on an idle list for
//! cheap re-lookup; the list is recycled before new nodes are allocated
//! and any dirty node leaving it is written back first.

use alloc::sync::Arc;
use spin::Mutex;

use strata_block::{Block, BlockFlags};
use strata_vfs::{MountTarget, NodeType, ServiceId, VfsError, VfsResult};

use crate::bpb::{BootSector, CLST_ROOT, CLST_ROOTPAR};
use crate::dentry::{Dentry, FAT_ATTR_SUBDIR};
use crate::idx::IdxEntry;
use crate::table::{self, berr};
use crate::FatFs;

pub(crate) struct FatNodeInner {
    pub(crate) idx: Option<Arc<IdxEntry>>,
    pub(crate) node_type: NodeType,
    /// First cluster; zero for zero-length nodes, the root sentinel for
    /// the FAT12/16 root directory
    pub(crate) firstc: u32,
    pub(crate) size: u64,
    pub(crate) lnkcnt: u32,
    pub(crate) refcnt: u32,
    pub(crate) dirty: bool,
    /// Held alive after unlink until relinked or destroyed
    pub(crate) keepalive: bool,
    /// Cache of the node's last cluster
    pub(crate) lastc_cached: Option<u32>,
    /// Cache of the cluster the last I/O took place in, as (block
    /// number, cluster)
    pub(crate) currc_cached: Option<(u64, u32)>,
    /// Set while a filesystem is grafted onto this node
    pub(crate) mp: Option<MountTarget>,
}

pub struct FatNode {
    pub(crate) inner: Mutex<FatNodeInner>,
}

impl FatNode {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(FatNode {
            inner: Mutex::new(FatNodeInner::empty()),
        })
    }
}

impl FatNodeInner {
    fn empty() -> Self {
        FatNodeInner {
            idx: None,
            node_type: NodeType::Unknown,
            firstc: 0,
            size: 0,
            lnkcnt: 0,
            refcnt: 0,
            dirty: false,
            keepalive: false,
            lastc_cached: None,
            currc_cached: None,
            mp: None,
        }
    }

    fn reinit(&mut self) {
        *self = FatNodeInner::empty();
    }
}

impl FatFs {
    /// Fetch a fresh node structure, preferably by recycling an idle
    /// one. A dirty recyclee is written back first.
    pub(crate) fn node_get_new(&self) -> VfsResult<Arc<FatNode>> {
        loop {
            let candidate = self.ffn.lock().pop();
            let node = match candidate {
                Some(n) => n,
                None => return Ok(FatNode::new()),
            };

            let mut inner = node.inner.lock();
            if inner.refcnt != 0 {
                // Raced with a re-lookup; leave the node alone.
                continue;
            }

            if inner.dirty {
                if let Err(err) = self.node_sync_inner(&inner) {
                    if let Some(idx) = inner.idx.take() {
                        idx.pos.lock().nodep = None;
                    }
                    return Err(err);
                }
                inner.dirty = false;
            }

            if let Some(idx) = inner.idx.take() {
                idx.pos.lock().nodep = None;
            }
            inner.reinit();
            drop(inner);
            return Ok(node);
        }
    }

    /// Instantiate (or revive) the node for a locked index entry and
    /// take a reference to it.
    pub(crate) fn node_get_core(&self, idxp: &Arc<IdxEntry>) -> VfsResult<Arc<FatNode>> {
        loop {
            let existing = {
                let pos = idxp.pos.lock();
                pos.nodep.as_ref().and_then(|w| w.upgrade())
            };

            if let Some(node) = existing {
                let mut inner = node.inner.lock();
                let still_ours = inner
                    .idx
                    .as_ref()
                    .map(|i| Arc::ptr_eq(i, idxp))
                    .unwrap_or(false);
                if !still_ours {
                    // The node was recycled under us; look again.
                    continue;
                }
                if inner.refcnt == 0 {
                    self.ffn.lock().retain(|n| !Arc::ptr_eq(n, &node));
                }
                inner.refcnt += 1;
                drop(inner);
                return Ok(node);
            }

            // Instantiate the node from the filesystem.
            let (sid, pfc, pdi) = {
                let pos = idxp.pos.lock();
                (idxp.service_id, pos.pfc, pos.pdi)
            };
            if pfc == CLST_ROOTPAR {
                // Only linked nodes can be instantiated from disk.
                return Err(VfsError::NotFound);
            }

            let bs = self.bs(sid)?;
            let node = self.node_get_new()?;

            let (b, _) = table::block_get_by_clst(
                &self.pool,
                &bs,
                sid,
                pfc,
                (pdi as u64 * crate::bpb::DENTRY_SIZE as u64) / bs.bps() as u64,
                BlockFlags::empty(),
            )?;

            let d = {
                let data = b.data();
                let off = (pdi % bs.dps()) as usize * crate::bpb::DENTRY_SIZE;
                Dentry::decode(&data[off..off + crate::bpb::DENTRY_SIZE])
            };
            self.pool.put(b).map_err(berr)?;

            let mut inner = node.inner.lock();
            inner.firstc = d.first_cluster(bs.is_fat32());

            if d.attr & FAT_ATTR_SUBDIR != 0 {
                // The size field of a directory entry is undefined; the
                // directory size comes from walking the FAT.
                inner.node_type = NodeType::Directory;
                let clusters = table::clusters_get(&self.pool, &bs, sid, inner.firstc)?;
                inner.size = bs.bpc() as u64 * clusters as u64;
            } else {
                inner.node_type = NodeType::File;
                inner.size = d.size as u64;
            }
            inner.lnkcnt = 1;
            inner.refcnt = 1;
            inner.idx = Some(idxp.clone());
            drop(inner);

            idxp.pos.lock().nodep = Some(Arc::downgrade(&node));
            return Ok(node);
        }
    }

    /// Instantiate the in-core node with the given stable index.
    pub(crate) fn node_get_internal(
        &self,
        sid: ServiceId,
        index: u32,
    ) -> VfsResult<Option<Arc<FatNode>>> {
        let idxp = match self.idx.get_by_index(sid, index) {
            Some(i) => i,
            None => return Ok(None),
        };
        self.node_get_core(&idxp).map(Some)
    }

    /// Drop a reference to a node; the last reference parks it on the
    /// idle list.
    pub(crate) fn node_put_internal(&self, node: Arc<FatNode>) {
        let mut inner = node.inner.lock();
        inner.refcnt -= 1;
        if inner.refcnt == 0 && inner.idx.is_some() {
            drop(inner);
            self.ffn.lock().push(node);
        }
        // A node without an index structure is dropped for good; it can
        // only exist after a failed node creation.
    }

    /// Write a dirty node's metadata back into its directory entry.
    pub(crate) fn node_sync_inner(&self, inner: &FatNodeInner) -> VfsResult<()> {
        let idxp = match inner.idx.as_ref() {
            Some(i) => i.clone(),
            None => return Ok(()),
        };
        let (sid, pfc, pdi) = {
            let pos = idxp.pos.lock();
            (idxp.service_id, pos.pfc, pos.pdi)
        };
        if pfc == CLST_ROOTPAR {
            // The root directory and unlinked nodes have no entry to
            // update.
            return Ok(());
        }

        let bs = self.bs(sid)?;
        let (b, _) = table::block_get_by_clst(
            &self.pool,
            &bs,
            sid,
            pfc,
            (pdi as u64 * crate::bpb::DENTRY_SIZE as u64) / bs.bps() as u64,
            BlockFlags::empty(),
        )?;

        {
            let mut data = b.data_mut();
            let off = (pdi % bs.dps()) as usize * crate::bpb::DENTRY_SIZE;
            let raw = &mut data[off..off + crate::bpb::DENTRY_SIZE];
            let mut d = Dentry::decode(raw);
            d.set_first_cluster(bs.is_fat32(), inner.firstc);
            if inner.node_type == NodeType::File {
                d.size = inner.size as u32;
            } else if inner.node_type == NodeType::Directory {
                d.attr = FAT_ATTR_SUBDIR;
            }
            d.encode(raw);
        }
        b.mark_dirty();
        self.pool.put(b).map_err(berr)?;
        Ok(())
    }

    /// Flush and drop all idle nodes belonging to an unmounted device.
    pub(crate) fn node_fini_by_service(&self, sid: ServiceId) -> VfsResult<()> {
        let idle: alloc::vec::Vec<Arc<FatNode>> = {
            let mut ffn = self.ffn.lock();
            let mut kept = alloc::vec::Vec::new();
            let mut gone = alloc::vec::Vec::new();
            for node in ffn.drain(..) {
                let belongs = node
                    .inner
                    .lock()
                    .idx
                    .as_ref()
                    .map(|i| i.service_id == sid)
                    .unwrap_or(false);
                if belongs {
                    gone.push(node);
                } else {
                    kept.push(node);
                }
            }
            *ffn = kept;
            gone
        };

        for node in idle {
            let mut inner = node.inner.lock();
            if inner.dirty {
                self.node_sync_inner(&inner)?;
                inner.dirty = false;
            }
            if let Some(idx) = inner.idx.take() {
                idx.pos.lock().nodep = None;
            }
        }
        Ok(())
    }

    /// Read the file block containing byte offset `bn * bps`, going
    /// through the node's cluster caches.
    pub(crate) fn fat_block_get_node(
        &self,
        bs: &BootSector,
        sid: ServiceId,
        inner: &mut FatNodeInner,
        bn: u64,
        flags: BlockFlags,
    ) -> VfsResult<Arc<Block>> {
        if inner.size == 0 {
            return Err(VfsError::LimitExceeded);
        }

        let spc = bs.spc() as u64;
        let mut firstc = inner.firstc;
        let mut relbn = bn;

        let root_shortcut = !bs.is_fat32() && inner.firstc == CLST_ROOT;
        if !root_shortcut {
            if let Some(lastc) = inner.lastc_cached {
                if ((inner.size - 1) / bs.bps() as u64) / spc == bn / spc {
                    // A request within the last cluster, which is
                    // fortunately cached.
                    return self
                        .pool
                        .get(sid, bs.clbn2pbn(lastc, bn), flags)
                        .map_err(berr);
                }
            }

            if let Some((cached_bn, cached_clst)) = inner.currc_cached {
                if bn >= cached_bn {
                    // Re-enter the chain at the cluster of the previous
                    // I/O.
                    firstc = cached_clst;
                    relbn -= (cached_bn / spc) * spc;
                }
            }
        }

        let (b, currc) = table::block_get_by_clst(&self.pool, bs, sid, firstc, relbn, flags)?;
        inner.currc_cached = Some((bn, currc));
        Ok(b)
    }

    /// Zero the gap between the end of the file and a new write
    /// position so no stale bytes ever become readable.
    pub(crate) fn fill_gap(
        &self,
        bs: &BootSector,
        sid: ServiceId,
        inner: &mut FatNodeInner,
        mcl: u32,
        pos: u64,
    ) -> VfsResult<()> {
        let bps = bs.bps() as u64;
        let bpc = bs.bpc() as u64;
        let boundary = (inner.size + bpc - 1) / bpc * bpc;

        // Zero out already allocated space.
        let mut o = inner.size;
        while o < pos && o < boundary {
            let flags = if o % bps == 0 {
                BlockFlags::NOREAD
            } else {
                BlockFlags::empty()
            };
            let b = self.fat_block_get_node(bs, sid, inner, o / bps, flags)?;
            {
                let mut data = b.data_mut();
                let from = (o % bps) as usize;
                data[from..bps as usize].fill(0);
            }
            b.mark_dirty();
            self.pool.put(b).map_err(berr)?;
            o = (o + bps) / bps * bps;
        }

        if o >= pos {
            return Ok(());
        }

        // Zero out the initial part of the newly appended chain.
        let mut o = boundary;
        while o < pos {
            let (b, _) = table::block_get_by_clst(
                &self.pool,
                bs,
                sid,
                mcl,
                (o - boundary) / bps,
                BlockFlags::NOREAD,
            )?;
            {
                let mut data = b.data_mut();
                let len = core::cmp::min(bps, pos - o) as usize;
                data[..len].fill(0);
            }
            b.mark_dirty();
            self.pool.put(b).map_err(berr)?;
            o += bps;
        }

        Ok(())
    }

    /// Append an independent cluster chain to the node, in all FATs.
    pub(crate) fn append_clusters(
        &self,
        bs: &BootSector,
        sid: ServiceId,
        inner: &mut FatNodeInner,
        mcl: u32,
        lcl: u32,
    ) -> VfsResult<()> {
        if inner.firstc == crate::bpb::CLST_RES0 {
            // No clusters allocated to the node yet.
            inner.firstc = mcl;
            inner.dirty = true;
        } else {
            let lastc = match inner.lastc_cached.take() {
                Some(l) => l,
                None => {
                    table::cluster_walk(&self.pool, bs, sid, inner.firstc, u32::MAX)?.0
                }
            };

            for fatno in 0..bs.fatcnt() {
                table::set_cluster(&self.pool, bs, sid, fatno, lastc, mcl)?;
            }
        }

        inner.lastc_cached = Some(lcl);
        Ok(())
    }

    /// Terminate the chain at `lcl` and free everything after it, in
    /// all FATs. A zero `lcl` frees the whole chain.
    pub(crate) fn chop_clusters(
        &self,
        bs: &BootSector,
        sid: ServiceId,
        inner: &mut FatNodeInner,
        lcl: u32,
    ) -> VfsResult<()> {
        // Invalidate the cached cluster numbers.
        inner.lastc_cached = None;
        if inner.currc_cached.map(|(_, c)| c) != Some(lcl) {
            inner.currc_cached = None;
        }

        if lcl == crate::bpb::CLST_RES0 {
            // The node will have zero size and no clusters.
            table::free_clusters(&self.pool, bs, sid, inner.firstc)?;
            inner.firstc = crate::bpb::CLST_RES0;
            inner.dirty = true;
        } else {
            let nextc = table::get_cluster(&self.pool, bs, sid, table::FAT1, lcl)?;
            for fatno in 0..bs.fatcnt() {
                table::set_cluster(&self.pool, bs, sid, fatno, lcl, bs.clst_last1())?;
            }
            table::free_clusters(&self.pool, bs, sid, nextc)?;
        }

        inner.lastc_cached = Some(lcl);
        Ok(())
    }
}
