//! Open files and per-client file tables
//!
//! Each client owns a dense array of open-file slots keyed by small
//! integer handles. A slot may be allocated from the low end (smallest
//! free handle) or from the high end (largest free handle), and several
//! handles may share one open file after `clone` or handle passing.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::node::VfsNode;
use crate::{OpenFlags, VfsError, VfsResult, MAX_OPEN_FILES};

/// Client identifier assigned on attach.
pub type ClientId = u64;

pub(crate) struct FileState {
    /// Modes this handle may be opened with
    pub(crate) permissions: OpenFlags,
    pub(crate) open_read: bool,
    pub(crate) open_write: bool,
    pub(crate) append: bool,
    /// Implicit position for cursor-style I/O
    pub(crate) pos: u64,
    /// Number of handles referencing this open file
    pub(crate) refcnt: u32,
}

/// An open file: a node plus per-open state.
pub struct File {
    pub node: Arc<VfsNode>,
    pub(crate) state: Mutex<FileState>,
}

impl File {
    pub(crate) fn new(node: Arc<VfsNode>, permissions: OpenFlags) -> Arc<File> {
        Arc::new(File {
            node,
            state: Mutex::new(FileState {
                permissions,
                open_read: false,
                open_write: false,
                append: false,
                pos: 0,
                refcnt: 1,
            }),
        })
    }

    pub(crate) fn addref(&self) {
        self.state.lock().refcnt += 1;
    }

    /// Drops one handle reference; true when it was the last one.
    pub(crate) fn delref(&self) -> bool {
        let mut state = self.state.lock();
        state.refcnt -= 1;
        state.refcnt == 0
    }
}

/// Dense per-client table of open-file slots.
pub(crate) struct FileTable {
    files: Vec<Option<Arc<File>>>,
}

impl FileTable {
    pub(crate) fn new() -> Self {
        let mut files = Vec::new();
        files.resize_with(MAX_OPEN_FILES, || None);
        FileTable { files }
    }

    /// Allocate a handle for `file`, from the low or the high end.
    pub(crate) fn alloc(&mut self, file: Arc<File>, high: bool) -> VfsResult<usize> {
        let slot = if high {
            (0..self.files.len()).rev().find(|&i| self.files[i].is_none())
        } else {
            (0..self.files.len()).find(|&i| self.files[i].is_none())
        };

        match slot {
            Some(fd) => {
                self.files[fd] = Some(file);
                Ok(fd)
            }
            None => Err(VfsError::TooManyOpenFiles),
        }
    }

    /// Install `file` under a specific handle, dropping whatever was
    /// there.
    pub(crate) fn assign(&mut self, fd: usize, file: Arc<File>) -> VfsResult<Option<Arc<File>>> {
        if fd >= self.files.len() {
            return Err(VfsError::BadHandle);
        }
        Ok(self.files[fd].replace(file))
    }

    /// Release a handle, returning its open file.
    pub(crate) fn free(&mut self, fd: usize) -> VfsResult<Arc<File>> {
        if fd >= self.files.len() {
            return Err(VfsError::BadHandle);
        }
        self.files[fd].take().ok_or(VfsError::BadHandle)
    }

    pub(crate) fn get(&self, fd: usize) -> VfsResult<Arc<File>> {
        self.files
            .get(fd)
            .and_then(|f| f.clone())
            .ok_or(VfsError::BadHandle)
    }

    /// Drain every slot; used on client detach.
    pub(crate) fn drain(&mut self) -> Vec<Arc<File>> {
        self.files.iter_mut().filter_map(|f| f.take()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeTable;
    use crate::server::LookupRes;
    use crate::{NodeType, Triplet};

    fn file() -> Arc<File> {
        let table = NodeTable::new();
        let node = table.get(&LookupRes {
            triplet: Triplet {
                fs_handle: 1,
                service_id: 1,
                index: 1,
            },
            size: 0,
            lnkcnt: 1,
            node_type: NodeType::File,
        });
        File::new(node, OpenFlags::READ | OpenFlags::WRITE)
    }

    #[test]
    fn low_and_high_allocation() {
        let mut table = FileTable::new();
        assert_eq!(table.alloc(file(), false).unwrap(), 0);
        assert_eq!(table.alloc(file(), false).unwrap(), 1);
        assert_eq!(table.alloc(file(), true).unwrap(), MAX_OPEN_FILES - 1);
        table.free(0).unwrap();
        assert_eq!(table.alloc(file(), false).unwrap(), 0);
    }

    #[test]
    fn free_invalidates_handle() {
        let mut table = FileTable::new();
        let fd = table.alloc(file(), false).unwrap();
        table.free(fd).unwrap();
        assert!(matches!(table.get(fd), Err(VfsError::BadHandle)));
        assert!(matches!(table.free(fd), Err(VfsError::BadHandle)));
    }
}
