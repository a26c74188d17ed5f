//! Debug macros for stack subsystems
//!
//! These macros compile to nothing when debug features are disabled.

/// Debug print for the storage subsystem (block cache, FAT, VBD)
#[macro_export]
#[cfg(feature = "debug-storage")]
macro_rules! debug_storage {
    ($($arg:tt)*) => {
        $crate::_debug_print("[STORAGE] ", format_args!($($arg)*))
    };
}

#[macro_export]
#[cfg(not(feature = "debug-storage"))]
macro_rules! debug_storage {
    ($($arg:tt)*) => {};
}

/// Debug print for the VFS subsystem
#[macro_export]
#[cfg(feature = "debug-vfs")]
macro_rules! debug_vfs {
    ($($arg:tt)*) => {
        $crate::_debug_print("[VFS] ", format_args!($($arg)*))
    };
}

#[macro_export]
#[cfg(not(feature = "debug-vfs"))]
macro_rules! debug_vfs {
    ($($arg:tt)*) => {};
}

/// Debug output sink - a no-op until a console hooks it up
#[doc(hidden)]
#[cfg(any(feature = "debug-storage", feature = "debug-vfs"))]
pub fn _debug_print(_prefix: &str, _args: core::fmt::Arguments) {}
