//! RAM filesystem server
//!
//! Keeps the whole tree in anonymous memory: file contents in one flat
//! buffer per node, directories as lists of name/child pairs. Implements
//! the same outward contract as the on-disk servers, which makes it both
//! the bootstrap root filesystem and the reference implementation the
//! dispatcher is tested against.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use strata_vfs::libfs::{libfs_lookup, FsOps};
use strata_vfs::{
    FsIndex, FsStats, LookupFlags, LookupOutcome, LookupRequest, LookupRes, MountTarget,
    MountedInfo, NodeType, ServiceId, Triplet, VfsError, VfsResult, WriteRes, NAME_MAX,
};

/// All root nodes have index 0.
const TMPFS_ROOT: FsIndex = 0;

struct TmpfsDentry {
    name: String,
    node: Arc<TmpfsNode>,
}

struct TmpfsNodeInner {
    node_type: NodeType,
    lnkcnt: u32,
    /// File contents; realloc'd on growth
    data: Vec<u8>,
    /// Directory entries
    children: Vec<TmpfsDentry>,
    /// Set while a filesystem is grafted onto this node
    mp: Option<MountTarget>,
}

pub struct TmpfsNode {
    service_id: ServiceId,
    index: FsIndex,
    inner: Mutex<TmpfsNodeInner>,
}

impl TmpfsNode {
    fn new(service_id: ServiceId, index: FsIndex, node_type: NodeType) -> Arc<Self> {
        Arc::new(TmpfsNode {
            service_id,
            index,
            inner: Mutex::new(TmpfsNodeInner {
                node_type,
                lnkcnt: 0,
                data: Vec::new(),
                children: Vec::new(),
                mp: None,
            }),
        })
    }
}

struct TmpfsState {
    nodes: BTreeMap<(ServiceId, FsIndex), Arc<TmpfsNode>>,
    /// Counter for assigning node indices, shared by all instances.
    next_index: FsIndex,
}

/// The tmpfs server.
pub struct Tmpfs {
    state: Mutex<TmpfsState>,
}

impl Tmpfs {
    pub fn new() -> Self {
        Tmpfs {
            state: Mutex::new(TmpfsState {
                nodes: BTreeMap::new(),
                next_index: 1,
            }),
        }
    }

    fn node(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<Arc<TmpfsNode>> {
        self.state
            .lock()
            .nodes
            .get(&(service_id, index))
            .cloned()
            .ok_or(VfsError::NotFound)
    }
}

impl Default for Tmpfs {
    fn default() -> Self {
        Self::new()
    }
}

impl FsOps for Tmpfs {
    type Node = Arc<TmpfsNode>;

    fn root_get(&self, service_id: ServiceId) -> VfsResult<Self::Node> {
        self.node(service_id, TMPFS_ROOT)
    }

    fn match_child(&self, parent: &Self::Node, name: &str) -> VfsResult<Option<Self::Node>> {
        let inner = parent.inner.lock();
        Ok(inner
            .children
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.node.clone()))
    }

    fn node_get(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<Option<Self::Node>> {
        Ok(self.state.lock().nodes.get(&(service_id, index)).cloned())
    }

    fn node_put(&self, _node: Self::Node) {}

    fn create_node(&self, service_id: ServiceId, flags: LookupFlags) -> VfsResult<Self::Node> {
        let node_type = if flags.contains(LookupFlags::DIRECTORY) {
            NodeType::Directory
        } else {
            NodeType::File
        };

        let mut state = self.state.lock();
        let index = state.next_index;
        state.next_index += 1;

        let node = TmpfsNode::new(service_id, index, node_type);
        state.nodes.insert((service_id, index), node.clone());
        Ok(node)
    }

    fn destroy_node(&self, node: Self::Node) -> VfsResult<()> {
        let inner = node.inner.lock();
        if inner.lnkcnt != 0 || !inner.children.is_empty() {
            return Err(VfsError::Busy);
        }
        drop(inner);

        self.state
            .lock()
            .nodes
            .remove(&(node.service_id, node.index));
        Ok(())
    }

    fn link_node(&self, parent: &Self::Node, child: &Self::Node, name: &str) -> VfsResult<()> {
        if name.len() > NAME_MAX {
            return Err(VfsError::NameTooLong);
        }

        let mut pinner = parent.inner.lock();
        if pinner.node_type != NodeType::Directory {
            return Err(VfsError::NotADirectory);
        }
        if pinner.children.iter().any(|d| d.name == name) {
            return Err(VfsError::AlreadyExists);
        }

        pinner.children.push(TmpfsDentry {
            name: String::from(name),
            node: child.clone(),
        });
        drop(pinner);

        child.inner.lock().lnkcnt += 1;
        Ok(())
    }

    fn unlink_node(
        &self,
        parent: Option<&Self::Node>,
        child: &Self::Node,
        name: &str,
    ) -> VfsResult<()> {
        let parent = parent.ok_or(VfsError::Busy)?;

        let mut pinner = parent.inner.lock();
        let pos = pinner
            .children
            .iter()
            .position(|d| d.name == name && Arc::ptr_eq(&d.node, child))
            .ok_or(VfsError::NotFound)?;

        {
            let cinner = child.inner.lock();
            if cinner.lnkcnt == 1 && !cinner.children.is_empty() {
                return Err(VfsError::NotEmpty);
            }
        }

        pinner.children.remove(pos);
        drop(pinner);

        child.inner.lock().lnkcnt -= 1;
        Ok(())
    }

    fn has_children(&self, node: &Self::Node) -> VfsResult<bool> {
        Ok(!node.inner.lock().children.is_empty())
    }

    fn index_get(&self, node: &Self::Node) -> FsIndex {
        node.index
    }

    fn size_get(&self, node: &Self::Node) -> u64 {
        let inner = node.inner.lock();
        match inner.node_type {
            NodeType::File => inner.data.len() as u64,
            _ => inner.children.len() as u64,
        }
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

impl strata_vfs::FsServer for Tmpfs {
    fn properties(&self) -> strata_vfs::FsProperties {
        strata_vfs::FsProperties {
            name: "tmpfs",
            concurrent_read_write: true,
            write_retains_size: false,
        }
    }

    fn mounted(&self, service_id: ServiceId, _opts: &str) -> VfsResult<MountedInfo> {
        let mut state = self.state.lock();
        if state.nodes.contains_key(&(service_id, TMPFS_ROOT)) {
            return Err(VfsError::AlreadyExists);
        }

        let root = TmpfsNode::new(service_id, TMPFS_ROOT, NodeType::Directory);
        state.nodes.insert((service_id, TMPFS_ROOT), root);

        Ok(MountedInfo {
            index: TMPFS_ROOT,
            size: 0,
        })
    }

    fn unmounted(&self, service_id: ServiceId) -> VfsResult<()> {
        let mut state = self.state.lock();
        state.nodes.retain(|&(sid, _), _| sid != service_id);
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
        let node = self.node(service_id, index)?;
        let inner = node.inner.lock();

        if inner.node_type == NodeType::File {
            if pos >= inner.data.len() as u64 {
                return Ok(0);
            }
            let start = pos as usize;
            let bytes = core::cmp::min(inner.data.len() - start, buf.len());
            buf[..bytes].copy_from_slice(&inner.data[start..start + bytes]);
            Ok(bytes)
        } else {
            // One directory entry name per call.
            let dentry = inner
                .children
                .get(pos as usize)
                .ok_or(VfsError::NotFound)?;
            let name = dentry.name.as_bytes();
            if buf.len() < name.len() + 1 {
                return Err(VfsError::LimitExceeded);
            }
            buf[..name.len()].copy_from_slice(name);
            buf[name.len()] = 0;
            Ok(1)
        }
    }

    fn write(
        &self,
        service_id: ServiceId,
        index: FsIndex,
        pos: u64,
        data: &[u8],
    ) -> VfsResult<WriteRes> {
        let node = self.node(service_id, index)?;
        let mut inner = node.inner.lock();

        if inner.node_type != NodeType::File {
            return Err(VfsError::IsADirectory);
        }

        let end = pos as usize + data.len();
        if end > inner.data.len() {
            // Zero-fill any gap between the old end and the write
            // position.
            inner.data.resize(end, 0);
        }
        let start = pos as usize;
        inner.data[start..end].copy_from_slice(data);

        Ok(WriteRes {
            bytes: data.len(),
            size: inner.data.len() as u64,
        })
    }

    fn truncate(&self, service_id: ServiceId, index: FsIndex, size: u64) -> VfsResult<()> {
        let node = self.node(service_id, index)?;
        let mut inner = node.inner.lock();

        if inner.node_type != NodeType::File {
            return Err(VfsError::IsADirectory);
        }
        inner.data.resize(size as usize, 0);
        Ok(())
    }

    fn close(&self, _service_id: ServiceId, _index: FsIndex) -> VfsResult<()> {
        Ok(())
    }

    fn destroy(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<()> {
        let node = self.node(service_id, index)?;
        self.destroy_node(node)
    }

    fn sync(&self, _service_id: ServiceId, _index: FsIndex) -> VfsResult<()> {
        // The in-memory structures are always consistent.
        Ok(())
    }

    fn node_info(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<LookupRes> {
        let node = self.node(service_id, index)?;
        let node_type = node.inner.lock().node_type;
        Ok(LookupRes {
            triplet: Triplet {
                fs_handle: 0,
                service_id,
                index,
            },
            size: self.size_get(&node),
            lnkcnt: self.lnkcnt_get(&node),
            node_type,
        })
    }

    fn has_children(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<bool> {
        let node = self.node(service_id, index)?;
        FsOps::has_children(self, &node)
    }

    fn statfs(&self, service_id: ServiceId, _index: FsIndex) -> VfsResult<FsStats> {
        let state = self.state.lock();
        let nodes = state
            .nodes
            .keys()
            .filter(|&&(sid, _)| sid == service_id)
            .count() as u64;
        Ok(FsStats {
            total_nodes: nodes,
            max_name_len: NAME_MAX as u32,
            ..FsStats::default()
        })
    }

    fn mount_notify(
        &self,
        service_id: ServiceId,
        index: FsIndex,
        target: MountTarget,
    ) -> VfsResult<()> {
        let node = self.node(service_id, index)?;
        let mut inner = node.inner.lock();
        if inner.mp.is_some() {
            return Err(VfsError::Busy);
        }
        inner.mp = Some(target);
        Ok(())
    }

    fn unmount_notify(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<()> {
        let node = self.node(service_id, index)?;
        node.inner.lock().mp = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_vfs::FsServer;

    const SID: ServiceId = 1;

    fn mounted() -> Tmpfs {
        let fs = Tmpfs::new();
        fs.mounted(SID, "").unwrap();
        fs
    }

    fn create_file(fs: &Tmpfs, name: &str) -> Arc<TmpfsNode> {
        let root = fs.root_get(SID).unwrap();
        let node = fs.create_node(SID, LookupFlags::FILE).unwrap();
        fs.link_node(&root, &node, name).unwrap();
        node
    }

    #[test]
    fn root_is_index_zero() {
        let fs = mounted();
        let info = fs.node_info(SID, TMPFS_ROOT).unwrap();
        assert_eq!(info.node_type, NodeType::Directory);
        assert_eq!(info.size, 0);
    }

    #[test]
    fn write_read_roundtrip() {
        let fs = mounted();
        let node = create_file(&fs, "data");

        let res = fs.write(SID, node.index, 0, b"hello world").unwrap();
        assert_eq!(res.bytes, 11);
        assert_eq!(res.size, 11);

        let mut buf = [0u8; 16];
        let n = fs.read(SID, node.index, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
    }

    #[test]
    fn sparse_write_zero_fills() {
        let fs = mounted();
        let node = create_file(&fs, "sparse");

        fs.write(SID, node.index, 8192, b"x").unwrap();
        assert_eq!(fs.size_get(&node), 8193);

        let mut buf = alloc::vec![0xFFu8; 8192];
        let n = fs.read(SID, node.index, 0, &mut buf).unwrap();
        assert_eq!(n, 8192);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn truncate_shrinks_and_grows() {
        let fs = mounted();
        let node = create_file(&fs, "t");

        fs.write(SID, node.index, 0, b"abcdef").unwrap();
        fs.truncate(SID, node.index, 3).unwrap();
        assert_eq!(fs.size_get(&node), 3);

        fs.truncate(SID, node.index, 6).unwrap();
        let mut buf = [0u8; 6];
        fs.read(SID, node.index, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc\0\0\0");
    }

    #[test]
    fn link_rejects_duplicates() {
        let fs = mounted();
        let root = fs.root_get(SID).unwrap();
        let node = create_file(&fs, "a");
        assert!(matches!(
            fs.link_node(&root, &node, "a"),
            Err(VfsError::AlreadyExists)
        ));
    }

    #[test]
    fn unlink_then_destroy() {
        let fs = mounted();
        let root = fs.root_get(SID).unwrap();
        let node = create_file(&fs, "gone");
        let index = node.index;

        fs.unlink_node(Some(&root), &node, "gone").unwrap();
        assert_eq!(fs.lnkcnt_get(&node), 0);
        fs.destroy(SID, index).unwrap();
        assert!(fs.node_get(SID, index).unwrap().is_none());
    }

    #[test]
    fn directory_read_lists_names() {
        let fs = mounted();
        create_file(&fs, "one");
        create_file(&fs, "two");

        let mut buf = [0u8; 64];
        let n = fs.read(SID, TMPFS_ROOT, 0, &mut buf).unwrap();
        assert_eq!(n, 1);
        assert_eq!(&buf[..4], b"one\0");

        fs.read(SID, TMPFS_ROOT, 1, &mut buf).unwrap();
        assert_eq!(&buf[..4], b"two\0");

        assert!(matches!(
            fs.read(SID, TMPFS_ROOT, 2, &mut buf),
            Err(VfsError::NotFound)
        ));
    }

    #[test]
    fn unmounted_drops_instance() {
        let fs = mounted();
        create_file(&fs, "x");
        fs.unmounted(SID).unwrap();
        assert!(fs.node_get(SID, TMPFS_ROOT).unwrap().is_none());
    }
}
