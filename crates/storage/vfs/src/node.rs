//! VFS node table
//!
//! In-memory cache of filesystem objects the VFS currently knows about,
//! keyed by triplet. Invariants:
//!
//! * a node with zero references is not in the table;
//! * a node with zero references and zero links has its backing storage
//!   destroyed by the owning server;
//! * a mount point holds an extra reference on itself and on the mounted
//!   root until unmount.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::{Mutex, RwLock};

use crate::server::LookupRes;
use crate::{FsHandle, NodeType, ServiceId, Triplet};

pub(crate) struct VfsNodeState {
    pub(crate) refcnt: u32,
    pub(crate) lnkcnt: u32,
    pub(crate) size: u64,
    pub(crate) node_type: NodeType,
    pub(crate) mount: Option<Arc<VfsNode>>,
}

/// An active, in-memory VFS node.
pub struct VfsNode {
    pub triplet: Triplet,
    pub(crate) state: Mutex<VfsNodeState>,
    /// Holding this lock prevents modifications of the node's contents.
    pub(crate) contents: RwLock<()>,
}

impl VfsNode {
    /// Cached file size.
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    /// Node type, if known.
    pub fn node_type(&self) -> NodeType {
        self.state.lock().node_type
    }

    /// Link count as of the last server answer.
    pub fn lnkcnt(&self) -> u32 {
        self.state.lock().lnkcnt
    }

    /// Root of the filesystem mounted on this node, if any.
    pub fn mount(&self) -> Option<Arc<VfsNode>> {
        self.state.lock().mount.clone()
    }

    #[cfg(test)]
    pub(crate) fn refcnt(&self) -> u32 {
        self.state.lock().refcnt
    }
}

/// The VFS node table.
pub struct NodeTable {
    nodes: Mutex<BTreeMap<Triplet, Arc<VfsNode>>>,
}

impl NodeTable {
    pub fn new() -> Self {
        NodeTable {
            nodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Find or instantiate the node for a lookup result and take a
    /// reference to it.
    pub fn get(&self, res: &LookupRes) -> Arc<VfsNode> {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .entry(res.triplet)
            .or_insert_with(|| {
                Arc::new(VfsNode {
                    triplet: res.triplet,
                    state: Mutex::new(VfsNodeState {
                        refcnt: 0,
                        lnkcnt: res.lnkcnt,
                        size: res.size,
                        node_type: res.node_type,
                        mount: None,
                    }),
                    contents: RwLock::new(()),
                })
            })
            .clone();

        let mut state = node.state.lock();
        state.refcnt += 1;
        state.lnkcnt = res.lnkcnt;
        state.size = res.size;
        if state.node_type == NodeType::Unknown && res.node_type != NodeType::Unknown {
            // Upgrade the node type.
            state.node_type = res.node_type;
        }
        drop(state);

        node
    }

    /// Take a reference to the node for `triplet` only if it is already
    /// instantiated.
    pub fn peek(&self, triplet: &Triplet) -> Option<Arc<VfsNode>> {
        let nodes = self.nodes.lock();
        let node = nodes.get(triplet).cloned()?;
        node.state.lock().refcnt += 1;
        Some(node)
    }

    /// Take an additional reference to a node.
    pub fn addref(&self, node: &Arc<VfsNode>) {
        let _nodes = self.nodes.lock();
        node.state.lock().refcnt += 1;
    }

    /// Drop a reference to a node.
    ///
    /// Returns the node's triplet when the last reference to an unlinked
    /// node was dropped: the caller must ask the owning server to destroy
    /// the backing storage.
    pub fn delref(&self, node: &Arc<VfsNode>) -> Option<Triplet> {
        let mut nodes = self.nodes.lock();
        let mut state = node.state.lock();

        state.refcnt -= 1;
        if state.refcnt > 0 {
            return None;
        }

        nodes.remove(&node.triplet);
        if state.lnkcnt == 0 {
            return Some(node.triplet);
        }
        None
    }

    /// Remove a node from the table regardless of its reference count.
    /// Used when tearing down a mount.
    pub fn forget(&self, node: &Arc<VfsNode>) {
        let mut nodes = self.nodes.lock();
        nodes.remove(&node.triplet);
    }

    /// Sum of all node reference counts belonging to one filesystem
    /// instance. Exactly one reference (the mount edge itself) means the
    /// filesystem is idle and may be unmounted.
    pub fn refcount_sum(&self, fs_handle: FsHandle, service_id: ServiceId) -> u32 {
        let nodes = self.nodes.lock();
        nodes
            .values()
            .filter(|n| n.triplet.fs_handle == fs_handle && n.triplet.service_id == service_id)
            .map(|n| n.state.lock().refcnt)
            .sum()
    }
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}
