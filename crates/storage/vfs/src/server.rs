//! Filesystem server contract
//!
//! Every filesystem server implements `FsServer`. The dispatcher never
//! touches on-disk state itself; it resolves handles to triplets and
//! forwards the work. Bulk payloads travel as borrowed buffers, control
//! data as the call arguments.

use alloc::string::String;

use crate::plb::Plb;
use crate::{FileStat, FsHandle, FsIndex, FsStats, LookupFlags, NodeType, ServiceId, Triplet,
    VfsError, VfsResult};

/// Static properties a server announces on registration.
#[derive(Debug, Clone, Copy)]
pub struct FsProperties {
    /// Filesystem type name (`"fat"`, `"tmpfs"`, ...)
    pub name: &'static str,
    /// Reads and writes on one node may proceed concurrently
    pub concurrent_read_write: bool,
    /// A write never changes the file size
    pub write_retains_size: bool,
}

/// Where a mount point hands the walk over to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountTarget {
    pub fs_handle: FsHandle,
    pub service_id: ServiceId,
}

/// Root information returned by `mounted`.
#[derive(Debug, Clone, Copy)]
pub struct MountedInfo {
    pub index: FsIndex,
    pub size: u64,
}

/// Successful lookup answer.
#[derive(Debug, Clone, Copy)]
pub struct LookupRes {
    pub triplet: Triplet,
    pub size: u64,
    pub lnkcnt: u32,
    pub node_type: NodeType,
}

impl LookupRes {
    pub fn stat(&self) -> FileStat {
        FileStat {
            triplet: self.triplet,
            node_type: self.node_type,
            lnkcnt: self.lnkcnt,
            size: self.size,
        }
    }
}

/// Result of one server-side walk: either an answer, or a hand-over to
/// the filesystem mounted on a node encountered during the walk.
#[derive(Debug, Clone, Copy)]
pub enum LookupOutcome {
    Done(LookupRes),
    Forward {
        target: MountTarget,
        next: usize,
        last: usize,
    },
}

/// One path lookup as seen by a server.
pub struct LookupRequest<'a> {
    /// Read-only view of the Path Lookup Buffer
    pub plb: &'a Plb,
    /// Handle under which the addressed server is registered
    pub fs_handle: FsHandle,
    /// Device to operate on
    pub service_id: ServiceId,
    /// Index of the first unprocessed path character
    pub first: usize,
    /// Index of the last path character
    pub last: usize,
    pub flags: LookupFlags,
    /// Pre-existing index to link when `LookupFlags::LINK` is set
    pub index: Option<FsIndex>,
    /// Node to start the walk from; the filesystem root when absent
    pub start: Option<FsIndex>,
}

/// Reply to a successful write.
#[derive(Debug, Clone, Copy)]
pub struct WriteRes {
    /// Bytes actually transferred; may be less than requested
    pub bytes: usize,
    /// File size after the write
    pub size: u64,
}

/// Probe information for an unmounted volume.
#[derive(Debug, Clone)]
pub struct FsProbeInfo {
    pub label: String,
}

/// The outward-facing operations of a filesystem server.
pub trait FsServer: Send + Sync {
    fn properties(&self) -> FsProperties;

    /// Probe an unmounted device for this filesystem type.
    fn fsprobe(&self, _service_id: ServiceId) -> VfsResult<FsProbeInfo> {
        Err(VfsError::NotSupported)
    }

    /// Attach to a device. Returns the root node's identity.
    fn mounted(&self, service_id: ServiceId, opts: &str) -> VfsResult<MountedInfo>;

    /// Detach from a device. All nodes must be idle.
    fn unmounted(&self, service_id: ServiceId) -> VfsResult<()>;

    /// Walk a parked path. See `libfs::libfs_lookup` for the shared
    /// implementation servers delegate to.
    fn lookup(&self, req: &LookupRequest<'_>) -> VfsResult<LookupOutcome>;

    /// Read from a file, or read one directory entry name when the node
    /// is a directory. Returns the number of bytes (respectively
    /// directory entries) consumed.
    fn read(&self, service_id: ServiceId, index: FsIndex, pos: u64, buf: &mut [u8])
        -> VfsResult<usize>;

    /// Write to a file. Partial writes are allowed; the caller loops.
    fn write(
        &self,
        service_id: ServiceId,
        index: FsIndex,
        pos: u64,
        data: &[u8],
    ) -> VfsResult<WriteRes>;

    /// Truncate (or grow, where supported) a file to `size` bytes.
    fn truncate(&self, service_id: ServiceId, index: FsIndex, size: u64) -> VfsResult<()>;

    /// Per-open-handle close notification.
    fn close(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<()>;

    /// Destroy an unlinked node and release its backing storage.
    fn destroy(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<()>;

    /// Flush a node's metadata and data to the device.
    fn sync(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<()>;

    /// Current identity and attributes of a node.
    fn node_info(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<LookupRes>;

    /// Whether a directory node has any entries.
    fn has_children(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<bool>;

    /// Filesystem statistics for a mounted device.
    fn statfs(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<FsStats>;

    /// Mark a node as an active mount point. The server takes a node
    /// reference that keeps the mount point in memory until unmounted.
    fn mount_notify(
        &self,
        service_id: ServiceId,
        index: FsIndex,
        target: MountTarget,
    ) -> VfsResult<()>;

    /// Clear an active mount point and drop its node reference.
    fn unmount_notify(&self, service_id: ServiceId, index: FsIndex) -> VfsResult<()>;
}
