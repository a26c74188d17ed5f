//! Shared server-side lookup implementation
//!
//! Filesystem servers expose their node primitives through `FsOps` and
//! delegate the component-by-component path walk to `libfs_lookup`. The
//! walker collects components from the Path Lookup Buffer, descends
//! through directories, hands the request over at mount points and
//! performs the create/link/unlink legs of the protocol.

use arrayvec::ArrayVec;

use crate::server::{LookupOutcome, LookupRequest, LookupRes, MountTarget};
use crate::{FsHandle, FsIndex, LookupFlags, NodeType, ServiceId, Triplet, VfsError, VfsResult,
    NAME_MAX, PLB_SIZE};

/// Node primitives a filesystem provides to the shared walker.
pub trait FsOps {
    /// Cheap in-core node handle
    type Node: Clone;

    fn root_get(&self, service_id: ServiceId) -> VfsResult<Self::Node>;
    fn match_child(&self, parent: &Self::Node, name: &str) -> VfsResult<Option<Self::Node>>;
    fn node_get(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<Option<Self::Node>>;
    fn node_put(&self, node: Self::Node);
    fn create_node(&self, service_id: ServiceId, flags: LookupFlags) -> VfsResult<Self::Node>;
    fn destroy_node(&self, node: Self::Node) -> VfsResult<()>;
    fn link_node(&self, parent: &Self::Node, child: &Self::Node, name: &str) -> VfsResult<()>;
    fn unlink_node(
        &self,
        parent: Option<&Self::Node>,
        child: &Self::Node,
        name: &str,
    ) -> VfsResult<()>;
    fn has_children(&self, node: &Self::Node) -> VfsResult<bool>;
    fn index_get(&self, node: &Self::Node) -> FsIndex;
    fn size_get(&self, node: &Self::Node) -> u64;
    fn lnkcnt_get(&self, node: &Self::Node) -> u32;
    fn is_directory(&self, node: &Self::Node) -> bool;
    fn is_file(&self, node: &Self::Node) -> bool;
    /// Mount target when the node is an active mount point
    fn mount_target(&self, node: &Self::Node) -> Option<MountTarget>;
}

/// Node holder that returns the node to its filesystem when it goes out
/// of scope.
struct NodeRef<'a, O: FsOps> {
    ops: &'a O,
    node: Option<O::Node>,
}

impl<'a, O: FsOps> NodeRef<'a, O> {
    fn new(ops: &'a O, node: O::Node) -> Self {
        NodeRef {
            ops,
            node: Some(node),
        }
    }

    fn get(&self) -> &O::Node {
        match self.node.as_ref() {
            Some(n) => n,
            None => unreachable!("node already released"),
        }
    }

    fn replace(&mut self, node: O::Node) {
        if let Some(old) = self.node.replace(node) {
            self.ops.node_put(old);
        }
    }
}

impl<O: FsOps> Drop for NodeRef<'_, O> {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            self.ops.node_put(node);
        }
    }
}

fn node_res<O: FsOps>(
    ops: &O,
    fs_handle: FsHandle,
    service_id: ServiceId,
    node: &O::Node,
) -> LookupRes {
    let node_type = if ops.is_directory(node) {
        NodeType::Directory
    } else if ops.is_file(node) {
        NodeType::File
    } else {
        NodeType::Unknown
    };
    LookupRes {
        triplet: Triplet {
            fs_handle,
            service_id,
            index: ops.index_get(node),
        },
        size: ops.size_get(node),
        lnkcnt: ops.lnkcnt_get(node),
        node_type,
    }
}

/// Create a new node (or fetch the one being linked) and link it under
/// `parent` as `name`.
fn create_and_link<O: FsOps>(
    ops: &O,
    fs_handle: FsHandle,
    req: &LookupRequest<'_>,
    parent: &O::Node,
    name: &str,
) -> VfsResult<LookupRes> {
    if !ops.is_directory(parent) {
        return Err(VfsError::NotADirectory);
    }

    let create = req.flags.contains(LookupFlags::CREATE);
    let node = if create {
        ops.create_node(req.service_id, req.flags)?
    } else {
        let index = req.index.ok_or(VfsError::InvalidArgument)?;
        ops.node_get(req.service_id, index)?
            .ok_or(VfsError::NotFound)?
    };

    match ops.link_node(parent, &node, name) {
        Ok(()) => {
            let res = node_res(ops, fs_handle, req.service_id, &node);
            ops.node_put(node);
            Ok(res)
        }
        Err(err) => {
            if create {
                let _ = ops.destroy_node(node);
            } else {
                ops.node_put(node);
            }
            Err(err)
        }
    }
}

/// Look up a parked path in the filesystem's namespace.
///
/// The path between `req.first` and `req.last` must be canonical. The
/// walk either answers the request or yields `LookupOutcome::Forward`
/// when it enters a subtree grafted from another filesystem.
pub fn libfs_lookup<O: FsOps>(
    ops: &O,
    fs_handle: FsHandle,
    req: &LookupRequest<'_>,
) -> VfsResult<LookupOutcome> {
    let first = req.first;
    let mut next = req.first;
    let mut last = req.last;
    let flags = req.flags;
    let cross_mounts = !flags.contains(LookupFlags::DISABLE_MOUNTS);

    if last < next {
        last += PLB_SIZE;
    }

    let mut par: Option<NodeRef<'_, O>> = None;
    let mut cur = match req.start {
        Some(index) => NodeRef::new(
            ops,
            ops.node_get(req.service_id, index)?
                .ok_or(VfsError::NotFound)?,
        ),
        None => NodeRef::new(ops, ops.root_get(req.service_id)?),
    };

    if cross_mounts {
        if let Some(target) = ops.mount_target(cur.get()) {
            return Ok(LookupOutcome::Forward { target, next, last });
        }
    }

    if req.plb.get_char(next) == b'/' {
        next += 1; // eat slash
    }

    let mut component = ArrayVec::<u8, NAME_MAX>::new();

    while next <= last && ops.has_children(cur.get())? {
        // Collect the component.
        component.clear();
        while next <= last && req.plb.get_char(next) != b'/' {
            component
                .try_push(req.plb.get_char(next))
                .map_err(|_| VfsError::NameTooLong)?;
            next += 1;
        }
        if component.is_empty() {
            return Err(VfsError::InvalidArgument);
        }
        next += 1; // eat slash

        let name = core::str::from_utf8(&component).map_err(|_| VfsError::InvalidArgument)?;

        // Match the component.
        match ops.match_child(cur.get(), name)? {
            None => {
                if next <= last {
                    // Miss in the middle of the path.
                    return Err(VfsError::NotFound);
                }
                // Miss in the last component.
                if flags.intersects(LookupFlags::CREATE | LookupFlags::LINK) {
                    let res = create_and_link(ops, fs_handle, req, cur.get(), name)?;
                    return Ok(LookupOutcome::Done(res));
                }
                return Err(VfsError::NotFound);
            }
            Some(found) => {
                if cross_mounts {
                    if let Some(target) = ops.mount_target(&found) {
                        if next > last {
                            next = first;
                            last = first;
                        } else {
                            next -= 1;
                        }
                        ops.node_put(found);
                        return Ok(LookupOutcome::Forward { target, next, last });
                    }
                }

                // Descend one level.
                let old = match cur.node.replace(found) {
                    Some(n) => n,
                    None => return Err(VfsError::NotFound),
                };
                match par.as_mut() {
                    Some(p) => p.replace(old),
                    None => par = Some(NodeRef::new(ops, old)),
                }
            }
        }
    }

    if next <= last {
        // Excessive components remain after reaching a childless node.
        if !flags.intersects(LookupFlags::CREATE | LookupFlags::LINK) {
            return Err(VfsError::NotFound);
        }

        // Collect the next component; more than one means a miss in the
        // middle of the path.
        component.clear();
        while next <= last {
            let ch = req.plb.get_char(next);
            if ch == b'/' {
                return Err(VfsError::NotFound);
            }
            component
                .try_push(ch)
                .map_err(|_| VfsError::NameTooLong)?;
            next += 1;
        }
        if component.is_empty() {
            return Err(VfsError::InvalidArgument);
        }
        let name = core::str::from_utf8(&component).map_err(|_| VfsError::InvalidArgument)?;

        let res = create_and_link(ops, fs_handle, req, cur.get(), name)?;
        return Ok(LookupOutcome::Done(res));
    }

    // Hit.
    if flags.contains(LookupFlags::UNLINK) {
        let name = core::str::from_utf8(&component).map_err(|_| VfsError::InvalidArgument)?;
        let old_lnkcnt = ops.lnkcnt_get(cur.get());
        ops.unlink_node(par.as_ref().map(|p| p.get()), cur.get(), name)?;
        let mut res = node_res(ops, fs_handle, req.service_id, cur.get());
        res.lnkcnt = old_lnkcnt;
        return Ok(LookupOutcome::Done(res));
    }

    if (flags.contains(LookupFlags::CREATE) && flags.contains(LookupFlags::EXCLUSIVE))
        || flags.contains(LookupFlags::LINK)
    {
        return Err(VfsError::AlreadyExists);
    }
    if flags.contains(LookupFlags::FILE) && ops.is_directory(cur.get()) {
        return Err(VfsError::IsADirectory);
    }
    if flags.contains(LookupFlags::DIRECTORY) && ops.is_file(cur.get()) {
        return Err(VfsError::NotADirectory);
    }
    if flags.contains(LookupFlags::MP) && ops.mount_target(cur.get()).is_none() {
        return Err(VfsError::NotMounted);
    }

    if flags.contains(LookupFlags::PARENT) {
        if let Some(p) = par.as_ref() {
            return Ok(LookupOutcome::Done(node_res(
                ops,
                fs_handle,
                req.service_id,
                p.get(),
            )));
        }
    }

    Ok(LookupOutcome::Done(node_res(
        ops,
        fs_handle,
        req.service_id,
        cur.get(),
    )))
}
