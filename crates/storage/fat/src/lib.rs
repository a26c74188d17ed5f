//! FAT12/16/32 filesystem server
//!
//! The canonical on-disk filesystem of the stack. Data lives in cluster
//! chains encoded in the File Allocation Table (all copies kept in
//! sync), directories are arrays of 32-byte entries with long-name
//! fragment support, and a per-mount index layer bridges stable VFS
//! indices with the volatile on-disk positions that rename and unlink
//! move around.
//!
//! Module map:
//! - `bpb`: boot sector and derived geometry
//! - `table`: FAT entry access, chain walking, cluster allocation
//! - `dentry`: 8.3 names, long name fragments, checksums
//! - `dir`: directory iteration and mutation
//! - `idx`: stable index <-> position translation
//! - `node`: in-core nodes and the idle node cache
//! - `fmt`: filesystem creation

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use strata_block::{BlockFlags, BlockPool, CacheMode, CacheParams};
use strata_driver_traits::DeviceRegistry;
use strata_vfs::libfs::{libfs_lookup, FsOps};
use strata_vfs::{
    FsIndex, FsProbeInfo, FsProperties, FsServer, FsStats, LookupFlags, LookupOutcome,
    LookupRequest, LookupRes, MountTarget, MountedInfo, NodeType, ServiceId, Triplet, VfsError,
    VfsResult, WriteRes, NAME_MAX,
};

pub mod bpb;
pub mod dentry;
pub mod fmt;

mod dir;
mod idx;
mod node;
mod table;

#[cfg(test)]
mod tests;

use bpb::{BootSector, BS_BLOCK, BS_SIZE, CLST_RES0, CLST_ROOTPAR, DENTRY_SIZE};
use dentry::{Dentry, FAT_ATTR_SUBDIR, FAT_EXT_PAD, FAT_NAME_DOT, FAT_NAME_DOT_DOT, FAT_PAD};
use dir::FatDirectory;
use idx::FatIdx;
use node::FatNode;
use table::berr;

struct FatInstance {
    bs: BootSector,
    lfn_enabled: bool,
    /// Strong reference pinning the root node for the whole mount
    root: Option<Arc<FatNode>>,
}

/// The FAT server. One server multiplexes any number of mounted
/// devices.
pub struct FatFs {
    pub(crate) pool: Arc<BlockPool>,
    registry: Arc<dyn DeviceRegistry>,
    instances: Mutex<BTreeMap<ServiceId, FatInstance>>,
    pub(crate) idx: FatIdx,
    /// Cached idle nodes
    pub(crate) ffn: Mutex<Vec<Arc<FatNode>>>,
}

impl FatFs {
    pub fn new(registry: Arc<dyn DeviceRegistry>) -> Self {
        FatFs {
            pool: Arc::new(BlockPool::new()),
            registry,
            instances: Mutex::new(BTreeMap::new()),
            idx: FatIdx::new(),
            ffn: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn bs(&self, sid: ServiceId) -> VfsResult<BootSector> {
        self.instances
            .lock()
            .get(&sid)
            .map(|i| i.bs)
            .ok_or(VfsError::NotFound)
    }

    pub(crate) fn lfn_enabled(&self, sid: ServiceId) -> VfsResult<bool> {
        self.instances
            .lock()
            .get(&sid)
            .map(|i| i.lfn_enabled)
            .ok_or(VfsError::NotFound)
    }

    fn node_or_enoent(&self, sid: ServiceId, index: FsIndex) -> VfsResult<Arc<FatNode>> {
        self.node_get_internal(sid, index)?.ok_or(VfsError::NotFound)
    }

    /// Scan a directory for any valid entry.
    fn has_children_node(&self, node: &Arc<FatNode>) -> VfsResult<bool> {
        let (is_dir, size, sid) = {
            let inner = node.inner.lock();
            let sid = inner
                .idx
                .as_ref()
                .map(|i| i.service_id)
                .ok_or(VfsError::InvalidArgument)?;
            (inner.node_type == NodeType::Directory, inner.size, sid)
        };
        if !is_dir {
            return Ok(false);
        }

        let bs = self.bs(sid)?;
        let blocks = size / bs.bps() as u64;

        for i in 0..blocks {
            let b = {
                let mut inner = node.inner.lock();
                self.fat_block_get_node(&bs, sid, &mut inner, i, BlockFlags::empty())?
            };
            let mut verdict = None;
            {
                let data = b.data();
                for j in 0..bs.dps() as usize {
                    let raw = &data[j * DENTRY_SIZE..(j + 1) * DENTRY_SIZE];
                    match dentry::classify(raw) {
                        dentry::DentryClass::Skip | dentry::DentryClass::Free => continue,
                        dentry::DentryClass::Last => {
                            verdict = Some(false);
                            break;
                        }
                        _ => {
                            verdict = Some(true);
                            break;
                        }
                    }
                }
            }
            self.pool.put(b).map_err(berr)?;
            if let Some(v) = verdict {
                return Ok(v);
            }
        }

        Ok(false)
    }

    /// Plant the `.` and `..` entries in a fresh directory.
    fn plant_dots(
        &self,
        bs: &BootSector,
        sid: ServiceId,
        child: &Arc<FatNode>,
        parent_firstc: u32,
    ) {
        let mut inner = child.inner.lock();
        let child_firstc = inner.firstc;

        // Failure here only costs the optional dot entries; the link
        // itself stays valid.
        let b = match self.fat_block_get_node(bs, sid, &mut inner, 0, BlockFlags::empty()) {
            Ok(b) => b,
            Err(_) => return,
        };

        {
            let mut data = b.data_mut();

            if dentry::classify(&data[..DENTRY_SIZE]) == dentry::DentryClass::Last
                || data[..8] == FAT_NAME_DOT[..]
            {
                let mut d = Dentry {
                    attr: FAT_ATTR_SUBDIR,
                    ..Dentry::default()
                };
                d.name.copy_from_slice(FAT_NAME_DOT);
                d.ext.copy_from_slice(FAT_EXT_PAD);
                d.set_first_cluster(bs.is_fat32(), child_firstc);
                d.encode(&mut data[..DENTRY_SIZE]);
            }

            if dentry::classify(&data[DENTRY_SIZE..2 * DENTRY_SIZE]) == dentry::DentryClass::Last
                || data[DENTRY_SIZE..DENTRY_SIZE + 8] == FAT_NAME_DOT_DOT[..]
            {
                let mut d = Dentry {
                    attr: FAT_ATTR_SUBDIR,
                    ..Dentry::default()
                };
                d.name.copy_from_slice(FAT_NAME_DOT_DOT);
                d.ext.copy_from_slice(FAT_EXT_PAD);
                let pfc = if parent_firstc == bs.root_clst() {
                    CLST_ROOTPAR
                } else {
                    parent_firstc
                };
                d.set_first_cluster(bs.is_fat32(), pfc);
                d.encode(&mut data[DENTRY_SIZE..2 * DENTRY_SIZE]);
            }
        }
        b.mark_dirty();
        let _ = self.pool.put(b);
    }
}

impl FsOps for FatFs {
    type Node = Arc<FatNode>;

    fn root_get(&self, service_id: ServiceId) -> VfsResult<Self::Node> {
        self.node_or_enoent(service_id, 0)
    }

    fn match_child(&self, parent: &Self::Node, name: &str) -> VfsResult<Option<Self::Node>> {
        let (sid, parent_firstc) = {
            let inner = parent.inner.lock();
            let sid = inner
                .idx
                .as_ref()
                .map(|i| i.service_id)
                .ok_or(VfsError::InvalidArgument)?;
            (sid, inner.firstc)
        };

        let mut di = FatDirectory::open(self, parent.clone())?;
        let hit = loop {
            match di.read() {
                Ok(Some((entry_name, _))) => {
                    if dentry::namecmp(&entry_name, name) {
                        break Some(di.pos);
                    }
                    if di.next().is_err() {
                        break None;
                    }
                }
                Ok(None) => break None,
                Err(err) => {
                    let _ = di.close();
                    return Err(err);
                }
            }
        };
        di.close()?;

        match hit {
            Some(pdi) => {
                let idxp = self.idx.get_by_pos(sid, parent_firstc, pdi)?;
                Ok(Some(self.node_get_core(&idxp)?))
            }
            None => Ok(None),
        }
    }

    fn node_get(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<Option<Self::Node>> {
        self.node_get_internal(service_id, index)
    }

    fn node_put(&self, node: Self::Node) {
        self.node_put_internal(node);
    }

    fn create_node(&self, service_id: ServiceId, flags: LookupFlags) -> VfsResult<Self::Node> {
        let bs = self.bs(service_id)?;
        let directory = flags.contains(LookupFlags::DIRECTORY);

        let mut mcl = CLST_RES0;
        if directory {
            let (m, _l) = table::alloc_clusters(&self.pool, &bs, service_id, 1)?;
            // Populate the new cluster with unused entries.
            if let Err(err) = table::zero_cluster(&self.pool, &bs, service_id, m) {
                let _ = table::free_clusters(&self.pool, &bs, service_id, m);
                return Err(err);
            }
            mcl = m;
        }

        let node = match self.node_get_new() {
            Ok(n) => n,
            Err(err) => {
                if directory {
                    let _ = table::free_clusters(&self.pool, &bs, service_id, mcl);
                }
                return Err(err);
            }
        };

        let idxp = match self.idx.get_new(service_id) {
            Ok(i) => i,
            Err(err) => {
                if directory {
                    let _ = table::free_clusters(&self.pool, &bs, service_id, mcl);
                }
                return Err(err);
            }
        };

        {
            let mut inner = node.inner.lock();
            if directory {
                inner.node_type = NodeType::Directory;
                inner.firstc = mcl;
                inner.size = bs.bpc() as u64;
            } else {
                inner.node_type = NodeType::File;
                inner.firstc = CLST_RES0;
                inner.size = 0;
            }
            inner.lnkcnt = 0; // not linked anywhere
            inner.refcnt = 1;
            inner.dirty = true;
            inner.idx = Some(idxp.clone());
        }
        idxp.pos.lock().nodep = Some(Arc::downgrade(&node));

        Ok(node)
    }

    fn destroy_node(&self, node: Self::Node) -> VfsResult<()> {
        // The node is unreachable from the namespace at this point.
        if self.has_children_node(&node)? {
            return Err(VfsError::NotEmpty);
        }

        let (lnkcnt, firstc, sid, idxp) = {
            let inner = node.inner.lock();
            let sid = inner
                .idx
                .as_ref()
                .map(|i| i.service_id)
                .ok_or(VfsError::InvalidArgument)?;
            (inner.lnkcnt, inner.firstc, sid, inner.idx.clone())
        };
        if lnkcnt != 0 {
            return Err(VfsError::Busy);
        }

        let bs = self.bs(sid)?;
        if firstc != CLST_RES0 {
            // Free all clusters allocated to the node.
            table::free_clusters(&self.pool, &bs, sid, firstc)?;
        }

        if let Some(idxp) = idxp {
            idxp.pos.lock().nodep = None;
            self.idx.destroy(&idxp);
        }
        node.inner.lock().idx = None;
        Ok(())
    }

    fn link_node(&self, parent: &Self::Node, child: &Self::Node, name: &str) -> VfsResult<()> {
        {
            let cinner = child.inner.lock();
            if cinner.lnkcnt == 1 {
                // FAT does not support multiple hard links.
                return Err(VfsError::TooManyLinks);
            }
        }

        if !dentry::valid_name(name) || name.len() > NAME_MAX {
            return Err(VfsError::NotSupported);
        }

        let (sid, parent_firstc) = {
            let inner = parent.inner.lock();
            let sid = inner
                .idx
                .as_ref()
                .map(|i| i.service_id)
                .ok_or(VfsError::InvalidArgument)?;
            (sid, inner.firstc)
        };
        let bs = self.bs(sid)?;

        // Only the name goes to disk now; the remaining dentry fields
        // follow when the child node is synced.
        let mut de = Dentry {
            name: [FAT_PAD; 8],
            ext: [FAT_PAD; 3],
            ..Dentry::default()
        };

        let mut di = FatDirectory::open(self, parent.clone())?;
        if let Err(err) = di.write_name(name, &mut de) {
            let _ = di.close();
            return Err(err);
        }
        let pdi = di.pos;
        di.close()?;

        let child_is_dir = child.inner.lock().node_type == NodeType::Directory;
        if child_is_dir {
            self.plant_dots(&bs, sid, child, parent_firstc);
        }

        let cidx = child
            .inner
            .lock()
            .idx
            .clone()
            .ok_or(VfsError::InvalidArgument)?;
        {
            let mut pos = cidx.pos.lock();
            pos.pfc = parent_firstc;
            pos.pdi = pdi;
        }
        // Hash the index structure in under its new position.
        self.idx.hashin(&cidx);

        {
            let mut cinner = child.inner.lock();
            cinner.lnkcnt = 1;
            cinner.dirty = true;
            if cinner.keepalive {
                cinner.keepalive = false;
                cinner.refcnt -= 1;
            }
        }
        Ok(())
    }

    fn unlink_node(
        &self,
        parent: Option<&Self::Node>,
        child: &Self::Node,
        _name: &str,
    ) -> VfsResult<()> {
        let parent = parent.ok_or(VfsError::Busy)?;

        if self.has_children_node(child)? {
            return Err(VfsError::NotEmpty);
        }

        let cidx = child
            .inner
            .lock()
            .idx
            .clone()
            .ok_or(VfsError::NotFound)?;
        let pdi = cidx.pos.lock().pdi;

        let mut di = FatDirectory::open(self, parent.clone())?;
        if let Err(err) = di.seek(pdi).and_then(|_| di.erase()) {
            let _ = di.close();
            return Err(err);
        }
        di.close()?;

        // Remove the index structure from the position hash and clear
        // the position; the entry itself survives while the node is
        // referenced.
        self.idx.hashout(&cidx);
        {
            let mut pos = cidx.pos.lock();
            pos.pfc = CLST_ROOTPAR;
            pos.pdi = 0;
        }

        {
            let mut cinner = child.inner.lock();
            cinner.lnkcnt = 0;
            // Keep the node in memory until relinked or destroyed.
            cinner.refcnt += 1;
            cinner.keepalive = true;
            cinner.dirty = true;
        }
        Ok(())
    }

    fn has_children(&self, node: &Self::Node) -> VfsResult<bool> {
        self.has_children_node(node)
    }

    fn index_get(&self, node: &Self::Node) -> FsIndex {
        node.inner
            .lock()
            .idx
            .as_ref()
            .map(|i| i.index)
            .unwrap_or(0)
    }

    fn size_get(&self, node: &Self::Node) -> u64 {
        node.inner.lock().size
    }

    fn lnkcnt_get(&self, node: &Self::Node) -> u32 {
        node.inner.lock().lnkcnt
    }

    fn is_directory(&self, node: &Self::Node) -> bool {
        node.inner.lock().node_type == NodeType::Directory
    }

    fn is_file(&self, node: &Self::Node) -> bool {
        node.inner.lock().node_type == NodeType::File
    }

    fn mount_target(&self, node: &Self::Node) -> Option<MountTarget> {
        node.inner.lock().mp
    }
}

impl FsServer for FatFs {
    fn properties(&self) -> FsProperties {
        FsProperties {
            name: "fat",
            concurrent_read_write: false,
            write_retains_size: false,
        }
    }

    fn fsprobe(&self, service_id: ServiceId) -> VfsResult<FsProbeInfo> {
        let dev = self
            .registry
            .resolve(service_id)
            .ok_or(VfsError::NotFound)?;
        if dev.block_size() < BS_SIZE {
            return Err(VfsError::NotSupported);
        }

        let mut sector = alloc::vec![0u8; dev.block_size()];
        dev.read_blocks(BS_BLOCK, 1, &mut sector)
            .map_err(|_| VfsError::IoError)?;
        let bs = BootSector::parse(&sector)?;
        Ok(FsProbeInfo {
            label: String::from(bs.label_str()),
        })
    }

    fn mounted(&self, service_id: ServiceId, opts: &str) -> VfsResult<MountedInfo> {
        if self.instances.lock().contains_key(&service_id) {
            return Err(VfsError::AlreadyExists);
        }

        let mut cmode = CacheMode::WriteBack;
        let mut lfn_enabled = true;
        for opt in opts.split(',') {
            match opt.trim() {
                // Check for the option enabling write through.
                "wtcache" => cmode = CacheMode::WriteThrough,
                "nolfn" => lfn_enabled = false,
                _ => {}
            }
        }

        let dev = self
            .registry
            .resolve(service_id)
            .ok_or(VfsError::NotFound)?;

        self.pool
            .init(service_id, dev, BS_SIZE)
            .map_err(berr)?;

        // Prepare the boot block.
        if let Err(err) = self.pool.bb_read(service_id, BS_BLOCK) {
            let _ = self.pool.fini(service_id);
            return Err(berr(err));
        }

        let bb = self.pool.bb_get(service_id).map_err(berr)?;
        let bs = match BootSector::parse(&bb) {
            Ok(bs) => bs,
            Err(err) => {
                let _ = self.pool.fini(service_id);
                return Err(err);
            }
        };

        if bs.bps() as usize != BS_SIZE {
            let _ = self.pool.fini(service_id);
            return Err(VfsError::NotSupported);
        }

        if let Err(err) = self.pool.cache_init(
            service_id,
            bs.bps() as usize,
            cmode,
            CacheParams::default(),
        ) {
            let _ = self.pool.fini(service_id);
            return Err(berr(err));
        }

        // Rule out devices which obviously hold something else.
        if let Err(err) = table::sanity_check(&self.pool, &bs, service_id) {
            let _ = self.pool.cache_fini(service_id);
            let _ = self.pool.fini(service_id);
            return Err(err);
        }

        if let Err(err) = self.idx.init_instance(service_id) {
            let _ = self.pool.cache_fini(service_id);
            let _ = self.pool.fini(service_id);
            return Err(err);
        }

        self.instances.lock().insert(
            service_id,
            FatInstance {
                bs,
                lfn_enabled,
                root: None,
            },
        );

        // Initialize the root node.
        let rc = (|| -> VfsResult<u64> {
            let ridxp = self.idx.get_by_pos(service_id, CLST_ROOTPAR, 0)?;
            let root = self.node_get_new()?;

            let size = if bs.is_fat32() {
                let clusters =
                    table::clusters_get(&self.pool, &bs, service_id, bs.root_clst())?;
                bs.bpc() as u64 * clusters as u64
            } else {
                bs.rde() as u64 * DENTRY_SIZE as u64
            };

            {
                let mut inner = root.inner.lock();
                inner.node_type = NodeType::Directory;
                inner.firstc = bs.root_clst();
                inner.refcnt = 1;
                inner.lnkcnt = 0; // the filesystem root is not linked
                inner.size = size;
                inner.idx = Some(ridxp.clone());
            }
            ridxp.pos.lock().nodep = Some(Arc::downgrade(&root));
            // The mount reference keeps the root pinned in memory.
            if let Some(instance) = self.instances.lock().get_mut(&service_id) {
                instance.root = Some(root);
            }
            Ok(size)
        })();

        match rc {
            Ok(size) => Ok(MountedInfo { index: 0, size }),
            Err(err) => {
                self.instances.lock().remove(&service_id);
                self.idx.fini_instance(service_id);
                let _ = self.pool.cache_fini(service_id);
                let _ = self.pool.fini(service_id);
                Err(err)
            }
        }
    }

    fn unmounted(&self, service_id: ServiceId) -> VfsResult<()> {
        if self.idx.has_open_nodes(service_id) {
            return Err(VfsError::Busy);
        }

        let root = self.node_or_enoent(service_id, 0)?;

        // Expect exactly two references: ours and the mount reference
        // taken when the device was mounted.
        {
            let inner = root.inner.lock();
            if inner.refcnt != 2 {
                drop(inner);
                self.node_put_internal(root);
                return Err(VfsError::Busy);
            }
        }

        // Drop both references, forcing the root onto the idle list.
        self.node_put_internal(root.clone());
        self.node_put_internal(root);

        // Write back the dirty remains and stop using the device.
        self.node_fini_by_service(service_id)?;
        self.idx.fini_instance(service_id);
        self.pool.cache_fini(service_id).map_err(berr)?;
        self.pool.fini(service_id).map_err(berr)?;
        self.instances.lock().remove(&service_id);
        Ok(())
    }

    fn lookup(&self, req: &LookupRequest<'_>) -> VfsResult<LookupOutcome> {
        libfs_lookup(self, req.fs_handle, req)
    }

    fn read(
        &self,
        service_id: ServiceId,
        index: FsIndex,
        pos: u64,
        buf: &mut [u8],
    ) -> VfsResult<usize> {
        let node = self.node_or_enoent(service_id, index)?;
        let bs = match self.bs(service_id) {
            Ok(bs) => bs,
            Err(err) => {
                self.node_put_internal(node);
                return Err(err);
            }
        };

        let result = (|| {
            let is_file = node.inner.lock().node_type == NodeType::File;
            if is_file {
                // One block at most per call; the client must be ready
                // to handle short transfers anyway.
                let mut inner = node.inner.lock();
                if pos >= inner.size {
                    return Ok(0);
                }
                let bps = bs.bps() as u64;
                let bytes = core::cmp::min(
                    core::cmp::min(buf.len() as u64, bps - pos % bps),
                    inner.size - pos,
                ) as usize;
                let b =
                    self.fat_block_get_node(&bs, service_id, &mut inner, pos / bps, BlockFlags::empty())?;
                {
                    let data = b.data();
                    let off = (pos % bps) as usize;
                    buf[..bytes].copy_from_slice(&data[off..off + bytes]);
                }
                self.pool.put(b).map_err(berr)?;
                Ok(bytes)
            } else {
                // One directory entry name per call; the return value is
                // the number of entry slots consumed.
                let spos = pos as u32;
                let mut di = FatDirectory::open(self, node.clone())?;
                if let Err(err) = di.seek(spos) {
                    let _ = di.close();
                    return Err(err);
                }
                match di.read() {
                    Ok(Some((name, _))) => {
                        let taken = di.pos;
                        di.close()?;
                        let bytes = name.as_bytes();
                        if buf.len() < bytes.len() + 1 {
                            return Err(VfsError::LimitExceeded);
                        }
                        buf[..bytes.len()].copy_from_slice(bytes);
                        buf[bytes.len()] = 0;
                        Ok((taken - spos) as usize + 1)
                    }
                    Ok(None) => {
                        di.close()?;
                        Err(VfsError::NotFound)
                    }
                    Err(err) => {
                        let _ = di.close();
                        Err(err)
                    }
                }
            }
        })();

        self.node_put_internal(node);
        result
    }

    fn write(
        &self,
        service_id: ServiceId,
        index: FsIndex,
        pos: u64,
        data: &[u8],
    ) -> VfsResult<WriteRes> {
        let node = self.node_or_enoent(service_id, index)?;
        let bs = match self.bs(service_id) {
            Ok(bs) => bs,
            Err(err) => {
                self.node_put_internal(node);
                return Err(err);
            }
        };

        let result = (|| {
            let mut inner = node.inner.lock();
            if inner.node_type != NodeType::File {
                return Err(VfsError::IsADirectory);
            }
            if data.is_empty() {
                return Ok(WriteRes {
                    bytes: 0,
                    size: inner.size,
                });
            }

            let bps = bs.bps() as u64;
            let bpc = bs.bpc() as u64;

            // At most one block worth of data per call; the client is
            // required to handle short writes.
            let bytes = core::cmp::min(data.len() as u64, bps - pos % bps) as usize;
            let flags = if bytes as u64 == bps {
                BlockFlags::NOREAD
            } else {
                BlockFlags::empty()
            };

            let boundary = (inner.size + bpc - 1) / bpc * bpc;
            if pos < boundary {
                // Overwriting existing contents, or writing past the end
                // but still within the limits of the last cluster.
                self.fill_gap(&bs, service_id, &mut inner, CLST_RES0, pos)?;
                let b = self.fat_block_get_node(&bs, service_id, &mut inner, pos / bps, flags)?;
                {
                    let mut block_data = b.data_mut();
                    let off = (pos % bps) as usize;
                    block_data[off..off + bytes].copy_from_slice(&data[..bytes]);
                }
                b.mark_dirty();
                self.pool.put(b).map_err(berr)?;

                if pos + bytes as u64 > inner.size {
                    inner.size = pos + bytes as u64;
                    inner.dirty = true;
                }
                Ok(WriteRes {
                    bytes,
                    size: inner.size,
                })
            } else {
                // New clusters must be allocated and zeroed first.
                let nclsts =
                    (((pos + bytes as u64 + bpc - 1) / bpc * bpc - boundary) / bpc) as u32;
                let (mcl, lcl) = table::alloc_clusters(&self.pool, &bs, service_id, nclsts)?;

                if let Err(err) = self.fill_gap(&bs, service_id, &mut inner, mcl, pos) {
                    let _ = table::free_clusters(&self.pool, &bs, service_id, mcl);
                    return Err(err);
                }

                let spc = bs.spc() as u64;
                let b = match table::block_get_by_clst(
                    &self.pool,
                    &bs,
                    service_id,
                    lcl,
                    (pos / bps) % spc,
                    flags,
                ) {
                    Ok((b, _)) => b,
                    Err(err) => {
                        let _ = table::free_clusters(&self.pool, &bs, service_id, mcl);
                        return Err(err);
                    }
                };
                {
                    let mut block_data = b.data_mut();
                    let off = (pos % bps) as usize;
                    block_data[off..off + bytes].copy_from_slice(&data[..bytes]);
                }
                b.mark_dirty();
                if let Err(err) = self.pool.put(b) {
                    let _ = table::free_clusters(&self.pool, &bs, service_id, mcl);
                    return Err(berr(err));
                }

                // Append the new chain to the node's own chain.
                if let Err(err) = self.append_clusters(&bs, service_id, &mut inner, mcl, lcl) {
                    let _ = table::free_clusters(&self.pool, &bs, service_id, mcl);
                    return Err(err);
                }

                inner.size = pos + bytes as u64;
                inner.dirty = true;
                Ok(WriteRes {
                    bytes,
                    size: inner.size,
                })
            }
        })();

        self.node_put_internal(node);
        result
    }

    fn truncate(&self, service_id: ServiceId, index: FsIndex, size: u64) -> VfsResult<()> {
        let node = self.node_or_enoent(service_id, index)?;
        let bs = match self.bs(service_id) {
            Ok(bs) => bs,
            Err(err) => {
                self.node_put_internal(node);
                return Err(err);
            }
        };

        let result = (|| {
            let mut inner = node.inner.lock();
            let bpc = bs.bpc() as u64;

            if inner.size == size {
                Ok(())
            } else if inner.size < size {
                // The standard would let us grow the node; we do not.
                Err(VfsError::InvalidArgument)
            } else if (inner.size + bpc - 1) / bpc == (size + bpc - 1) / bpc {
                // The node shrinks within its last cluster.
                inner.size = size;
                inner.dirty = true;
                Ok(())
            } else if size == 0 {
                self.chop_clusters(&bs, service_id, &mut inner, CLST_RES0)?;
                inner.size = 0;
                inner.dirty = true;
                Ok(())
            } else {
                let (lastc, _) = table::cluster_walk(
                    &self.pool,
                    &bs,
                    service_id,
                    inner.firstc,
                    ((size - 1) / bpc) as u32,
                )?;
                self.chop_clusters(&bs, service_id, &mut inner, lastc)?;
                inner.size = size;
                inner.dirty = true;
                Ok(())
            }
        })();

        self.node_put_internal(node);
        result
    }

    fn close(&self, _service_id: ServiceId, _index: FsIndex) -> VfsResult<()> {
        Ok(())
    }

    fn destroy(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<()> {
        let node = self.node_or_enoent(service_id, index)?;
        let result = self.destroy_node(node.clone());
        if result.is_err() {
            self.node_put_internal(node);
        }
        result
    }

    fn sync(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<()> {
        let node = self.node_or_enoent(service_id, index)?;
        let result = {
            let mut inner = node.inner.lock();
            let rc = self.node_sync_inner(&inner);
            if rc.is_ok() {
                inner.dirty = false;
            }
            rc
        };
        self.node_put_internal(node);
        result
    }

    fn node_info(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<LookupRes> {
        let node = self.node_or_enoent(service_id, index)?;
        let res = {
            let inner = node.inner.lock();
            LookupRes {
                triplet: Triplet {
                    fs_handle: 0,
                    service_id,
                    index,
                },
                size: inner.size,
                lnkcnt: inner.lnkcnt,
                node_type: inner.node_type,
            }
        };
        self.node_put_internal(node);
        Ok(res)
    }

    fn has_children(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<bool> {
        let node = self.node_or_enoent(service_id, index)?;
        let result = self.has_children_node(&node);
        self.node_put_internal(node);
        result
    }

    fn statfs(&self, service_id: ServiceId, _index: FsIndex) -> VfsResult<FsStats> {
        let bs = self.bs(service_id)?;
        let free = table::free_cluster_count(&self.pool, &bs, service_id)?;
        Ok(FsStats {
            total_blocks: bs.cc() as u64,
            free_blocks: free as u64,
            block_size: bs.bpc(),
            total_nodes: 0,
            free_nodes: 0,
            max_name_len: dentry::FAT_LFN_NAME_LEN as u32,
        })
    }

    fn mount_notify(
        &self,
        service_id: ServiceId,
        index: FsIndex,
        target: MountTarget,
    ) -> VfsResult<()> {
        let node = self.node_or_enoent(service_id, index)?;
        let mut inner = node.inner.lock();
        if inner.mp.is_some() {
            drop(inner);
            self.node_put_internal(node);
            return Err(VfsError::Busy);
        }
        inner.mp = Some(target);
        // The reference taken above pins the mount point in memory.
        Ok(())
    }

    fn unmount_notify(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<()> {
        let node = self.node_or_enoent(service_id, index)?;
        node.inner.lock().mp = None;
        // Drop our reference and the pin taken by `mount_notify`.
        self.node_put_internal(node.clone());
        self.node_put_internal(node);
        Ok(())
    }
}
