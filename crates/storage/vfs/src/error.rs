//! VFS error types

/// VFS result type
pub type VfsResult<T> = Result<T, VfsError>;

/// Error kinds surfaced by the VFS and its filesystem servers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsError {
    /// File or directory not found
    NotFound,
    /// File already exists
    AlreadyExists,
    /// Not a directory
    NotADirectory,
    /// Is a directory (when expecting a file)
    IsADirectory,
    /// Directory not empty
    NotEmpty,
    /// Name or path component too long
    NameTooLong,
    /// No space left on device
    NoSpace,
    /// Read-only filesystem
    ReadOnly,
    /// Resource in use
    Busy,
    /// I/O error
    IoError,
    /// Range or size limit exceeded
    LimitExceeded,
    /// Invalid argument
    InvalidArgument,
    /// Out of memory
    OutOfMemory,
    /// Unrecognised filesystem or unsupported feature
    NotSupported,
    /// Hard link limit reached
    TooManyLinks,
    /// Bad file handle
    BadHandle,
    /// Too many open files
    TooManyOpenFiles,
    /// Access mode not permitted by the handle
    PermissionDenied,
    /// No filesystem of the requested type is registered
    NoFilesystem,
    /// Not a mount point
    NotMounted,
}

impl VfsError {
    /// Convert to an errno-style code
    pub fn to_errno(&self) -> i32 {
        match self {
            VfsError::NotFound => -2,         // ENOENT
            VfsError::IoError => -5,          // EIO
            VfsError::OutOfMemory => -12,     // ENOMEM
            VfsError::PermissionDenied => -13, // EACCES
            VfsError::Busy => -16,            // EBUSY
            VfsError::AlreadyExists => -17,   // EEXIST
            VfsError::NotADirectory => -20,   // ENOTDIR
            VfsError::IsADirectory => -21,    // EISDIR
            VfsError::InvalidArgument => -22, // EINVAL
            VfsError::TooManyOpenFiles => -24, // EMFILE
            VfsError::NoSpace => -28,         // ENOSPC
            VfsError::ReadOnly => -30,        // EROFS
            VfsError::TooManyLinks => -31,    // EMLINK
            VfsError::LimitExceeded => -34,   // ERANGE
            VfsError::NameTooLong => -36,     // ENAMETOOLONG
            VfsError::NotEmpty => -39,        // ENOTEMPTY
            VfsError::NotSupported => -38,    // ENOSYS
            VfsError::BadHandle => -9,        // EBADF
            VfsError::NoFilesystem => -19,    // ENODEV
            VfsError::NotMounted => -22,      // EINVAL
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(VfsError::NotFound.to_errno(), -2);
        assert_eq!(VfsError::IoError.to_errno(), -5);
        assert_eq!(VfsError::NoSpace.to_errno(), -28);
        assert_eq!(VfsError::NotEmpty.to_errno(), -39);
        assert_eq!(VfsError::TooManyLinks.to_errno(), -31);
    }
}
