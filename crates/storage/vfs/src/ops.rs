//! Operations the VFS offers to its clients
//!
//! The dispatcher resolves handles to nodes, serialises namespace
//! modifications behind the namespace lock and forwards the actual work
//! to the registered filesystem servers.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::file::{ClientId, File, FileTable};
use crate::node::{NodeTable, VfsNode};
use crate::path::{canonify, shared_path};
use crate::plb::Plb;
use crate::server::{
    FsProbeInfo, FsProperties, FsServer, LookupOutcome, LookupRequest, LookupRes, MountTarget,
};
use crate::{
    FileStat, FsHandle, FsIndex, FsStats, LookupFlags, NodeType, OpenFlags, ServiceId, Triplet,
    VfsError, VfsResult,
};

struct FsInfo {
    handle: FsHandle,
    server: Arc<dyn FsServer>,
    instance: u32,
}

struct ClientState {
    files: FileTable,
}

/// Either side of a node's contents lock.
enum ContentsGuard<'a> {
    Read(RwLockReadGuard<'a, ()>),
    Write(RwLockWriteGuard<'a, ()>),
}

/// The VFS dispatcher.
pub struct Vfs {
    plb: Plb,
    registry: Mutex<Vec<FsInfo>>,
    nodes: NodeTable,
    /// Holding this lock prevents changes in the file system namespace.
    namespace: RwLock<()>,
    clients: Mutex<BTreeMap<ClientId, ClientState>>,
    /// Handles passed between clients, waiting to be picked up.
    boxes: Mutex<BTreeMap<ClientId, VecDeque<Arc<File>>>>,
    root: Mutex<Option<Arc<VfsNode>>>,
    next_client: AtomicU64,
    next_fs_handle: AtomicU32,
}

impl Vfs {
    pub fn new() -> Self {
        Vfs {
            plb: Plb::new(),
            registry: Mutex::new(Vec::new()),
            nodes: NodeTable::new(),
            namespace: RwLock::new(()),
            clients: Mutex::new(BTreeMap::new()),
            boxes: Mutex::new(BTreeMap::new()),
            root: Mutex::new(None),
            next_client: AtomicU64::new(1),
            next_fs_handle: AtomicU32::new(1),
        }
    }

    /// Shared node table, for invariant checks and tests.
    pub fn nodes(&self) -> &NodeTable {
        &self.nodes
    }

    /*
     * Registration.
     */

    /// Register a filesystem server. The returned handle names this
    /// type-instance in triplets from now on.
    pub fn register(&self, server: Arc<dyn FsServer>, instance: u32) -> VfsResult<FsHandle> {
        let props = server.properties();
        let mut registry = self.registry.lock();
        if registry
            .iter()
            .any(|fs| fs.server.properties().name == props.name && fs.instance == instance)
        {
            return Err(VfsError::AlreadyExists);
        }
        let handle = self.next_fs_handle.fetch_add(1, Ordering::Relaxed);
        registry.push(FsInfo {
            handle,
            server,
            instance,
        });
        Ok(handle)
    }

    /// Names of all registered filesystem types.
    pub fn fstypes(&self) -> Vec<String> {
        let registry = self.registry.lock();
        registry
            .iter()
            .map(|fs| String::from(fs.server.properties().name))
            .collect()
    }

    fn server(&self, handle: FsHandle) -> VfsResult<Arc<dyn FsServer>> {
        let registry = self.registry.lock();
        registry
            .iter()
            .find(|fs| fs.handle == handle)
            .map(|fs| fs.server.clone())
            .ok_or(VfsError::NoFilesystem)
    }

    fn props(&self, handle: FsHandle) -> VfsResult<FsProperties> {
        Ok(self.server(handle)?.properties())
    }

    fn handle_by_name(&self, name: &str, instance: u32) -> VfsResult<FsHandle> {
        let registry = self.registry.lock();
        registry
            .iter()
            .find(|fs| fs.server.properties().name == name && fs.instance == instance)
            .map(|fs| fs.handle)
            .ok_or(VfsError::NoFilesystem)
    }

    /*
     * Clients.
     */

    /// Attach a new client and hand out its identifier.
    pub fn client_attach(&self) -> ClientId {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        self.clients.lock().insert(
            id,
            ClientState {
                files: FileTable::new(),
            },
        );
        id
    }

    /// Detach a client, releasing all of its open files. In-flight
    /// handles parked for this client are released as well.
    pub fn client_detach(&self, client: ClientId) {
        let files = match self.clients.lock().remove(&client) {
            Some(mut state) => state.files.drain(),
            None => Vec::new(),
        };
        for file in files {
            self.file_drop(file);
        }

        let boxed = self.boxes.lock().remove(&client).unwrap_or_default();
        for file in boxed {
            self.file_drop(file);
        }
    }

    fn file_get(&self, client: ClientId, fd: usize) -> VfsResult<Arc<File>> {
        let clients = self.clients.lock();
        let state = clients.get(&client).ok_or(VfsError::BadHandle)?;
        state.files.get(fd)
    }

    fn fd_alloc(&self, client: ClientId, file: Arc<File>, high: bool) -> VfsResult<usize> {
        let mut clients = self.clients.lock();
        let state = clients.get_mut(&client).ok_or(VfsError::BadHandle)?;
        state.files.alloc(file, high)
    }

    /// Drop one handle reference to an open file.
    fn file_drop(&self, file: Arc<File>) {
        if !file.delref() {
            return;
        }
        let was_open = {
            let state = file.state.lock();
            state.open_read || state.open_write
        };
        if was_open {
            if let Ok(server) = self.server(file.node.triplet.fs_handle) {
                let _ = server.close(file.node.triplet.service_id, file.node.triplet.index);
            }
        }
        self.node_unref(&file.node);
    }

    /// Drop one node reference; destroys the backing storage of a node
    /// that lost its last reference and its last name.
    fn node_unref(&self, node: &Arc<VfsNode>) {
        if let Some(triplet) = self.nodes.delref(node) {
            self.out_destroy(&triplet);
        }
    }

    /// Destroy the file if and only if there are no hard links left.
    fn out_destroy(&self, triplet: &Triplet) {
        if let Ok(server) = self.server(triplet.fs_handle) {
            let _ = server.destroy(triplet.service_id, triplet.index);
        }
    }

    /*
     * Lookup.
     */

    /// Resolve a canonical path starting from `base`, following the
    /// walk across servers until one of them answers.
    fn lookup_internal(
        &self,
        base: &Arc<VfsNode>,
        path: &str,
        flags: LookupFlags,
        index: Option<FsIndex>,
    ) -> VfsResult<LookupRes> {
        let claim = self.plb.claim(path)?;

        let mut target = MountTarget {
            fs_handle: base.triplet.fs_handle,
            service_id: base.triplet.service_id,
        };
        let mut first = claim.first();
        let mut last = claim.last();
        let mut start = Some(base.triplet.index);

        loop {
            let server = self.server(target.fs_handle)?;
            let req = LookupRequest {
                plb: &self.plb,
                fs_handle: target.fs_handle,
                service_id: target.service_id,
                first,
                last,
                flags,
                index,
                start,
            };
            match server.lookup(&req)? {
                LookupOutcome::Done(res) => return Ok(res),
                LookupOutcome::Forward {
                    target: next_target,
                    next,
                    last: next_last,
                } => {
                    target = next_target;
                    first = next;
                    last = next_last;
                    start = None;
                }
            }
        }
    }

    fn root_node(&self) -> VfsResult<Arc<VfsNode>> {
        self.root.lock().clone().ok_or(VfsError::NotMounted)
    }

    /*
     * Mounting.
     */

    /// Mount the root filesystem.
    pub fn mount_root(
        &self,
        fs_name: &str,
        instance: u32,
        service_id: ServiceId,
        opts: &str,
    ) -> VfsResult<()> {
        let _ns = self.namespace.write();

        if self.root.lock().is_some() {
            return Err(VfsError::Busy);
        }

        let handle = self.handle_by_name(fs_name, instance)?;
        let server = self.server(handle)?;
        let info = server.mounted(service_id, opts)?;

        let res = LookupRes {
            triplet: Triplet {
                fs_handle: handle,
                service_id,
                index: info.index,
            },
            size: info.size,
            lnkcnt: 0,
            node_type: NodeType::Directory,
        };
        let node = self.nodes.get(&res);
        *self.root.lock() = Some(node);
        Ok(())
    }

    /// Obtain a handle on the global root directory.
    pub fn op_root(&self, client: ClientId) -> VfsResult<usize> {
        let root = self.root_node()?;
        self.nodes.addref(&root);
        let file = File::new(root, OpenFlags::READ | OpenFlags::WRITE | OpenFlags::APPEND);
        self.fd_alloc(client, file, false)
    }

    /// Graft a filesystem instance onto the directory open under `mpfd`.
    ///
    /// On success the mounted root is open under the returned handle;
    /// it must be put before the filesystem can be unmounted again.
    pub fn op_mount(
        &self,
        client: ClientId,
        mpfd: usize,
        fs_name: &str,
        instance: u32,
        service_id: ServiceId,
        opts: &str,
    ) -> VfsResult<usize> {
        let mp = self.file_get(client, mpfd)?;

        if mp.node.mount().is_some() {
            return Err(VfsError::Busy);
        }
        if mp.node.node_type() != NodeType::Directory {
            return Err(VfsError::NotADirectory);
        }
        let mp_server = self.server(mp.node.triplet.fs_handle)?;
        if mp_server.has_children(mp.node.triplet.service_id, mp.node.triplet.index)? {
            return Err(VfsError::NotEmpty);
        }

        let _ns = self.namespace.write();

        let handle = self.handle_by_name(fs_name, instance)?;
        let server = self.server(handle)?;
        let info = server.mounted(service_id, opts)?;

        let res = LookupRes {
            triplet: Triplet {
                fs_handle: handle,
                service_id,
                index: info.index,
            },
            size: info.size,
            lnkcnt: 0,
            node_type: NodeType::Directory,
        };
        // One reference for the mount edge...
        let root = self.nodes.get(&res);

        if let Err(err) = mp_server.mount_notify(
            mp.node.triplet.service_id,
            mp.node.triplet.index,
            MountTarget {
                fs_handle: handle,
                service_id,
            },
        ) {
            self.nodes.forget(&root);
            let _ = server.unmounted(service_id);
            return Err(err);
        }

        // ...plus the mount point's reference on itself and the edge
        // stored in the node.
        self.nodes.addref(&mp.node);
        {
            let mut state = mp.node.state.lock();
            state.mount = Some(root.clone());
        }

        // The returned handle takes its own reference.
        self.nodes.addref(&root);
        let file = File::new(root, OpenFlags::READ | OpenFlags::WRITE | OpenFlags::APPEND);
        self.fd_alloc(client, file, false)
    }

    /// Tear down the filesystem mounted on the directory open under
    /// `mpfd`. Fails with `Busy` while anyone still uses it.
    pub fn op_unmount(&self, client: ClientId, mpfd: usize) -> VfsResult<()> {
        let mp = self.file_get(client, mpfd)?;
        let root = mp.node.mount().ok_or(VfsError::NotMounted)?;

        let _ns = self.namespace.write();

        // The mount edge must hold the only remaining reference for the
        // mounted instance.
        if self
            .nodes
            .refcount_sum(root.triplet.fs_handle, root.triplet.service_id)
            != 1
        {
            return Err(VfsError::Busy);
        }

        let server = self.server(root.triplet.fs_handle)?;
        server.unmounted(root.triplet.service_id)?;

        let mp_server = self.server(mp.node.triplet.fs_handle)?;
        let _ = mp_server.unmount_notify(mp.node.triplet.service_id, mp.node.triplet.index);

        self.nodes.forget(&root);
        {
            let mut state = mp.node.state.lock();
            state.mount = None;
        }
        self.node_unref(&mp.node);
        Ok(())
    }

    /*
     * Walking and opening.
     */

    fn walk_flags_valid(flags: LookupFlags) -> bool {
        if flags.intersects(LookupFlags::UNLINK | LookupFlags::LINK | LookupFlags::PARENT) {
            return false;
        }
        if flags.contains(LookupFlags::FILE) && flags.contains(LookupFlags::DIRECTORY) {
            return false;
        }
        if flags.contains(LookupFlags::CREATE)
            && !flags.intersects(LookupFlags::FILE | LookupFlags::DIRECTORY)
        {
            return false;
        }
        true
    }

    /// Resolve `path` relative to the directory open under `parentfd`
    /// and open a new handle for the result.
    pub fn op_walk(
        &self,
        client: ClientId,
        parentfd: usize,
        path: &str,
        flags: LookupFlags,
    ) -> VfsResult<usize> {
        if !Self::walk_flags_valid(flags) {
            return Err(VfsError::InvalidArgument);
        }

        let mut flags = flags;
        if flags.contains(LookupFlags::DIRECTORY) && flags.contains(LookupFlags::CREATE) {
            flags |= LookupFlags::EXCLUSIVE;
        }

        let parent = self.file_get(client, parentfd)?;
        let canonical = canonify(path).ok_or(VfsError::InvalidArgument)?;

        let _ns = self.namespace.read();

        let lr = self.lookup_internal(&parent.node, &canonical, flags, None)?;
        let node = self.nodes.get(&lr);

        let permissions = parent.state.lock().permissions;
        let file = File::new(node, permissions);
        self.fd_alloc(client, file, false)
    }

    /// Set the access mode of a handle. Must happen exactly once before
    /// the first read or write.
    pub fn op_open(&self, client: ClientId, fd: usize, mode: OpenFlags) -> VfsResult<()> {
        if mode.is_empty() {
            return Err(VfsError::InvalidArgument);
        }

        let file = self.file_get(client, fd)?;

        {
            let mut state = file.state.lock();
            if !state.permissions.contains(mode) {
                return Err(VfsError::PermissionDenied);
            }
            if state.open_read || state.open_write {
                return Err(VfsError::Busy);
            }
            state.open_read = mode.contains(OpenFlags::READ);
            state.open_write = mode.intersects(OpenFlags::WRITE | OpenFlags::APPEND);
            state.append = mode.contains(OpenFlags::APPEND);

            if file.node.node_type() == NodeType::Directory && state.open_write {
                state.open_read = false;
                state.open_write = false;
                state.append = false;
                return Err(VfsError::InvalidArgument);
            }
        }

        let server = self.server(file.node.triplet.fs_handle)?;
        match server.node_info(file.node.triplet.service_id, file.node.triplet.index) {
            Ok(info) => {
                let mut state = file.node.state.lock();
                state.size = info.size;
                state.lnkcnt = info.lnkcnt;
                Ok(())
            }
            Err(err) => {
                let mut state = file.state.lock();
                state.open_read = false;
                state.open_write = false;
                state.append = false;
                Err(err)
            }
        }
    }

    /*
     * Reading and writing.
     */

    fn rdwr(
        &self,
        client: ClientId,
        fd: usize,
        pos: Option<u64>,
        read: bool,
        buf: &mut [u8],
        data: &[u8],
    ) -> VfsResult<usize> {
        let file = self.file_get(client, fd)?;

        let append = {
            let state = file.state.lock();
            if read && !state.open_read {
                return Err(VfsError::InvalidArgument);
            }
            if !read && !state.open_write {
                return Err(VfsError::InvalidArgument);
            }
            state.append
        };

        let node = &file.node;
        let props = self.props(node.triplet.fs_handle)?;

        // Writers of filesystems whose writes retain the size and permit
        // concurrent readers take the contents lock shared as well.
        let rlock = read || (props.concurrent_read_write && props.write_retains_size);

        let _contents = if rlock {
            ContentsGuard::Read(node.contents.read())
        } else {
            ContentsGuard::Write(node.contents.write())
        };

        // Nobody may modify the namespace while a directory is being
        // listed.
        let _ns;
        if node.node_type() == NodeType::Directory {
            if !read {
                return Err(VfsError::InvalidArgument);
            }
            _ns = self.namespace.read();
        }

        let effective_pos = match pos {
            _ if !read && append => node.size(),
            Some(p) => p,
            None => file.state.lock().pos,
        };

        let server = self.server(node.triplet.fs_handle)?;
        let bytes = if read {
            server.read(
                node.triplet.service_id,
                node.triplet.index,
                effective_pos,
                buf,
            )?
        } else {
            let res = server.write(
                node.triplet.service_id,
                node.triplet.index,
                effective_pos,
                data,
            )?;
            if !rlock {
                // Refresh the cached node size from the reply.
                node.state.lock().size = res.size;
            }
            res.bytes
        };

        if pos.is_none() {
            file.state.lock().pos = effective_pos + bytes as u64;
        }
        Ok(bytes)
    }

    /// Read from the file open under `fd`. With `pos` absent the
    /// handle's implicit position is used and advanced.
    pub fn op_read(
        &self,
        client: ClientId,
        fd: usize,
        pos: Option<u64>,
        buf: &mut [u8],
    ) -> VfsResult<usize> {
        self.rdwr(client, fd, pos, true, buf, &[])
    }

    /// Write to the file open under `fd`. Partial writes are allowed;
    /// callers loop until done.
    pub fn op_write(
        &self,
        client: ClientId,
        fd: usize,
        pos: Option<u64>,
        data: &[u8],
    ) -> VfsResult<usize> {
        self.rdwr(client, fd, pos, false, &mut [], data)
    }

    /// Truncate or grow the file open under `fd`.
    pub fn op_resize(&self, client: ClientId, fd: usize, size: u64) -> VfsResult<()> {
        let file = self.file_get(client, fd)?;

        {
            let state = file.state.lock();
            if !state.open_write || file.node.node_type() != NodeType::File {
                return Err(VfsError::InvalidArgument);
            }
        }

        let node = &file.node;
        let _contents = node.contents.write();

        let server = self.server(node.triplet.fs_handle)?;
        server.truncate(node.triplet.service_id, node.triplet.index, size)?;
        node.state.lock().size = size;
        Ok(())
    }

    /// Stat the object open under `fd`.
    pub fn op_stat(&self, client: ClientId, fd: usize) -> VfsResult<FileStat> {
        let file = self.file_get(client, fd)?;
        let node = &file.node;
        let server = self.server(node.triplet.fs_handle)?;
        let info = server.node_info(node.triplet.service_id, node.triplet.index)?;
        let mut stat = info.stat();
        stat.triplet = node.triplet;
        Ok(stat)
    }

    /// Filesystem statistics for the instance holding `fd`.
    pub fn op_statfs(&self, client: ClientId, fd: usize) -> VfsResult<FsStats> {
        let file = self.file_get(client, fd)?;
        let node = &file.node;
        let server = self.server(node.triplet.fs_handle)?;
        server.statfs(node.triplet.service_id, node.triplet.index)
    }

    /// Flush the object open under `fd` to its device.
    pub fn op_sync(&self, client: ClientId, fd: usize) -> VfsResult<()> {
        let file = self.file_get(client, fd)?;
        let node = &file.node;
        let server = self.server(node.triplet.fs_handle)?;
        server.sync(node.triplet.service_id, node.triplet.index)
    }

    /// Release a handle.
    pub fn op_put(&self, client: ClientId, fd: usize) -> VfsResult<()> {
        let file = {
            let mut clients = self.clients.lock();
            let state = clients.get_mut(&client).ok_or(VfsError::BadHandle)?;
            state.files.free(fd)?
        };
        self.file_drop(file);
        Ok(())
    }

    /// Duplicate a handle. With `newfd` given the old file is installed
    /// there, displacing any previous occupant; otherwise a free handle
    /// is allocated (`high` selects the allocation end).
    pub fn op_clone(
        &self,
        client: ClientId,
        oldfd: usize,
        newfd: Option<usize>,
        high: bool,
    ) -> VfsResult<usize> {
        let oldfile = self.file_get(client, oldfd)?;

        match newfd {
            Some(newfd) => {
                if newfd == oldfd {
                    return Ok(newfd);
                }
                oldfile.addref();
                let displaced = {
                    let mut clients = self.clients.lock();
                    let state = clients.get_mut(&client).ok_or(VfsError::BadHandle)?;
                    state.files.assign(newfd, oldfile)?
                };
                if let Some(old) = displaced {
                    self.file_drop(old);
                }
                Ok(newfd)
            }
            None => {
                self.nodes.addref(&oldfile.node);
                let permissions = oldfile.state.lock().permissions;
                let file = File::new(oldfile.node.clone(), permissions);
                self.fd_alloc(client, file, high)
            }
        }
    }

    /*
     * Namespace modification.
     */

    /// Unlink the object at `path` relative to `parentfd`. With
    /// `expectfd` given, the operation only proceeds when the path still
    /// resolves to the node open under that handle.
    pub fn op_unlink(
        &self,
        client: ClientId,
        parentfd: usize,
        expectfd: Option<usize>,
        path: &str,
    ) -> VfsResult<()> {
        let parent = self.file_get(client, parentfd)?;
        let canonical = canonify(path).ok_or(VfsError::InvalidArgument)?;

        let _ns = self.namespace.write();

        if let Some(expectfd) = expectfd {
            let expect = self.file_get(client, expectfd)?;
            let lr = self.lookup_internal(&parent.node, &canonical, LookupFlags::empty(), None)?;
            let found = self.nodes.peek(&lr.triplet);
            let matches = found
                .as_ref()
                .map(|n| Arc::ptr_eq(n, &expect.node))
                .unwrap_or(false);
            if let Some(found) = found {
                self.node_unref(&found);
            }
            if !matches {
                return Err(VfsError::NotFound);
            }
        }

        let lr = self.lookup_internal(&parent.node, &canonical, LookupFlags::UNLINK, None)?;

        // If the node is not held by anyone, destroy it right away.
        match self.nodes.peek(&lr.triplet) {
            Some(node) => {
                {
                    let mut state = node.state.lock();
                    state.lnkcnt = lr.lnkcnt.saturating_sub(1);
                }
                self.node_unref(&node);
            }
            None => {
                if lr.lnkcnt <= 1 {
                    self.out_destroy(&lr.triplet);
                }
            }
        }
        Ok(())
    }

    /// Rename `old` to `new`, both relative to `basefd`. The object
    /// keeps its index; a pre-existing target is replaced.
    pub fn op_rename(
        &self,
        client: ClientId,
        basefd: usize,
        old: &str,
        new: &str,
    ) -> VfsResult<()> {
        let base_file = self.file_get(client, basefd)?;

        let old = canonify(old).ok_or(VfsError::InvalidArgument)?;
        let new = canonify(new).ok_or(VfsError::InvalidArgument)?;

        // Do not allow one path to be a prefix of the other.
        if old == new
            || (new.starts_with(old.as_str())
                && new.as_bytes().get(old.len()) == Some(&b'/'))
            || (old.starts_with(new.as_str())
                && old.as_bytes().get(new.len()) == Some(&b'/'))
        {
            return Err(VfsError::InvalidArgument);
        }

        let shared = shared_path(&old, &new);

        let mut base = base_file.node.clone();
        self.nodes.addref(&base);

        let _ns = self.namespace.write();

        // Resolve the shared portion of the paths first.
        let (old_sub, new_sub);
        if shared != 0 {
            let base_lr = match self.lookup_internal(
                &base,
                &old[..shared],
                LookupFlags::DIRECTORY,
                None,
            ) {
                Ok(lr) => lr,
                Err(err) => {
                    self.node_unref(&base);
                    return Err(err);
                }
            };
            self.node_unref(&base);
            base = self.nodes.get(&base_lr);
            old_sub = &old[shared..];
            new_sub = &new[shared..];
        } else {
            old_sub = old.as_str();
            new_sub = new.as_str();
        }

        let unlink_flags = LookupFlags::UNLINK | LookupFlags::DISABLE_MOUNTS;
        let link_flags = LookupFlags::LINK | LookupFlags::DISABLE_MOUNTS;

        // Unlink any pre-existing target so the new name is free.
        let mut orig_unlinked = None;
        match self.lookup_internal(&base, new_sub, unlink_flags, None) {
            Ok(lr) => orig_unlinked = Some(lr),
            Err(VfsError::NotFound) => {}
            Err(err) => {
                self.node_unref(&base);
                return Err(err);
            }
        }

        // Take the source out of the namespace; its index survives the
        // move.
        let old_lr = match self.lookup_internal(&base, old_sub, unlink_flags, None) {
            Ok(lr) => lr,
            Err(err) => {
                if let Some(ref orig) = orig_unlinked {
                    let _ =
                        self.lookup_internal(&base, new_sub, link_flags, Some(orig.triplet.index));
                }
                self.node_unref(&base);
                return Err(err);
            }
        };

        if let Err(err) =
            self.lookup_internal(&base, new_sub, link_flags, Some(old_lr.triplet.index))
        {
            // Reinstate the original link, then the replaced target.
            let _ = self.lookup_internal(&base, old_sub, link_flags, Some(old_lr.triplet.index));
            if let Some(ref orig) = orig_unlinked {
                let _ = self.lookup_internal(&base, new_sub, link_flags, Some(orig.triplet.index));
            }
            self.node_unref(&base);
            return Err(err);
        }

        // A replaced target that nobody holds open is destroyed now.
        if let Some(orig) = orig_unlinked {
            match self.nodes.peek(&orig.triplet) {
                Some(node) => {
                    {
                        let mut state = node.state.lock();
                        state.lnkcnt = orig.lnkcnt.saturating_sub(1);
                    }
                    self.node_unref(&node);
                }
                None => {
                    if orig.lnkcnt <= 1 {
                        self.out_destroy(&orig.triplet);
                    }
                }
            }
        }

        self.node_unref(&base);
        Ok(())
    }

    /*
     * Handle passing.
     */

    /// Park a copy of `fd` for `recipient` to pick up.
    pub fn pass_handle(
        &self,
        client: ClientId,
        fd: usize,
        recipient: ClientId,
    ) -> VfsResult<()> {
        let file = self.file_get(client, fd)?;
        if !self.clients.lock().contains_key(&recipient) {
            return Err(VfsError::BadHandle);
        }
        file.addref();
        self.boxes.lock().entry(recipient).or_default().push_back(file);
        Ok(())
    }

    /// Pick up a handle parked for this client. `high` selects handle
    /// allocation from the top of the table.
    pub fn wait_handle(&self, client: ClientId, high: bool) -> VfsResult<usize> {
        let file = {
            let mut boxes = self.boxes.lock();
            boxes
                .get_mut(&client)
                .and_then(|q| q.pop_front())
                .ok_or(VfsError::NotFound)?
        };
        self.fd_alloc(client, file, high)
    }

    /*
     * Probing.
     */

    /// Probe an unmounted device for a filesystem type.
    pub fn op_fsprobe(
        &self,
        fs_name: &str,
        instance: u32,
        service_id: ServiceId,
    ) -> VfsResult<FsProbeInfo> {
        let handle = self.handle_by_name(fs_name, instance)?;
        self.server(handle)?.fsprobe(service_id)
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}
