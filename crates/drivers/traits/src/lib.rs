//! Driver trait interfaces for the strata storage stack
//!
//! This crate defines the seams between device producers (RAM disks,
//! partition proxies) and their consumers (the block cache, filesystem
//! servers). Consumers talk to a `BlockDevice` without knowing which
//! driver backs it; producers publish devices through a `DeviceRegistry`
//! without knowing who will mount them.
//!
//! # Debug features
//!
//! Verbose subsystem output is compiled in only when the matching feature
//! is enabled:
//!
//! ```toml
//! strata-driver-traits = { path = "...", features = ["debug-storage"] }
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod block;
mod debug;
mod registry;

pub use block::*;
pub use debug::*;
pub use registry::*;

/// Common error type for driver operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// Device not found or not responding
    DeviceNotFound,
    /// Invalid parameter
    InvalidParameter,
    /// Request outside the device's address range
    OutOfRange,
    /// Device busy
    Busy,
    /// Name or device already registered
    AlreadyExists,
    /// I/O error
    IoError,
    /// Not supported by this device
    NotSupported,
    /// Out of memory
    OutOfMemory,
}

pub type DriverResult<T> = Result<T, DriverError>;
