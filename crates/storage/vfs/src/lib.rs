//! Virtual file system dispatcher
//!
//! The VFS owns the global namespace and hands the actual file system work
//! to registered servers:
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │               Clients                │
//! └──────────────────┬───────────────────┘
//!                    │ walk/open/read/write/mount
//! ┌──────────────────▼───────────────────┐
//! │             VFS dispatcher           │
//! │  - canonical paths + PLB             │
//! │  - node table, mount graph           │
//! │  - per-client file tables            │
//! └──────────────────┬───────────────────┘
//!                    │ FsServer contract
//! ┌─────────┬────────┴────────┬──────────┐
//! │  tmpfs  │       FAT       │   ...    │
//! └─────────┴─────────────────┴──────────┘
//! ```
//!
//! Path resolution is performed by the servers themselves: the path is
//! parked in the shared Path Lookup Buffer and the owning server walks it
//! component by component, handing the request back whenever it runs into
//! a mount point.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use bitflags::bitflags;

pub mod error;
pub mod file;
pub mod libfs;
pub mod node;
pub mod ops;
pub mod path;
pub mod plb;
pub mod server;

pub use error::{VfsError, VfsResult};
pub use file::{ClientId, File};
pub use node::{NodeTable, VfsNode};
pub use ops::Vfs;
pub use plb::{Plb, PlbClaim};
pub use server::{
    FsProbeInfo, FsProperties, FsServer, LookupOutcome, LookupRequest, LookupRes, MountTarget,
    MountedInfo, WriteRes,
};

/// Registered filesystem type-instance handle
pub type FsHandle = u32;
/// Backing device service identifier
pub type ServiceId = u64;
/// Stable, filesystem-assigned object id
pub type FsIndex = u32;

/// Maximum length of a single path component
pub const NAME_MAX: usize = 255;

/// Maximum length of a full path
pub const MAX_PATH_LEN: usize = 64 * 1024;

/// Size of the Path Lookup Buffer
pub const PLB_SIZE: usize = 2 * MAX_PATH_LEN;

/// Open file slots per client
pub const MAX_OPEN_FILES: usize = 128;

/// Unique identity of a filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Triplet {
    pub fs_handle: FsHandle,
    pub service_id: ServiceId,
    pub index: FsIndex,
}

/// Node type as far as the VFS knows it. The type is monotonic: once
/// known, it never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Unknown,
    File,
    Directory,
}

bitflags! {
    /// Path lookup flags.
    pub struct LookupFlags: u32 {
        /// Succeed only on a regular file
        const FILE = 0x01;
        /// Succeed only on a directory; implies EXCLUSIVE with CREATE
        const DIRECTORY = 0x02;
        /// With CREATE, fail if the object exists
        const EXCLUSIVE = 0x04;
        /// Create the object if missing
        const CREATE = 0x08;
        /// Link a pre-existing index under the final component
        const LINK = 0x10;
        /// Remove the final component from the namespace
        const UNLINK = 0x20;
        /// Return the parent's triplet instead of the object's
        const PARENT = 0x40;
        /// The object must be an active mount point
        const MP = 0x80;
        /// Do not cross mount points during the walk
        const DISABLE_MOUNTS = 0x100;
    }
}

bitflags! {
    /// Per-handle access mode.
    pub struct OpenFlags: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const APPEND = 0x04;
    }
}

/// Stat information for one filesystem object.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub triplet: Triplet,
    pub node_type: NodeType,
    pub lnkcnt: u32,
    pub size: u64,
}

/// Filesystem-wide statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStats {
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub block_size: u32,
    pub total_nodes: u64,
    pub free_nodes: u64,
    pub max_name_len: u32,
}
