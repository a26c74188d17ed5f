//! Device registry trait
//!
//! The stand-in seam for the system naming service: producers register
//! block devices under service names, consumers resolve them by id.

use alloc::string::String;
use alloc::sync::Arc;

use crate::{BlockDevice, DriverResult, ServiceId};

/// Name-to-device registry.
pub trait DeviceRegistry: Send + Sync {
    /// Register a device under `name`, returning its service id.
    fn register(&self, name: &str, dev: Arc<dyn BlockDevice>) -> DriverResult<ServiceId>;

    /// Unregister a previously registered service.
    fn unregister(&self, sid: ServiceId) -> DriverResult<()>;

    /// Resolve a service id to its device.
    fn resolve(&self, sid: ServiceId) -> Option<Arc<dyn BlockDevice>>;

    /// Resolve a service name to its id.
    fn resolve_name(&self, name: &str) -> Option<ServiceId>;

    /// Service name for a registered id.
    fn service_name(&self, sid: ServiceId) -> Option<String>;
}
