//! In-process device locator
//!
//! Stands in for the system naming service: block device producers
//! register under service names, consumers resolve devices by name or
//! by the service id handed out at registration.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use strata_driver_traits::{BlockDevice, DeviceRegistry, DriverError, DriverResult, ServiceId};

struct LocEntry {
    sid: ServiceId,
    name: String,
    dev: Arc<dyn BlockDevice>,
}

struct LocState {
    next: ServiceId,
    entries: Vec<LocEntry>,
}

/// The locator.
pub struct Locator {
    state: Mutex<LocState>,
}

impl Locator {
    pub fn new() -> Self {
        Locator {
            state: Mutex::new(LocState {
                next: 1,
                entries: Vec::new(),
            }),
        }
    }
}

impl Default for Locator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry for Locator {
    fn register(&self, name: &str, dev: Arc<dyn BlockDevice>) -> DriverResult<ServiceId> {
        let mut state = self.state.lock();
        if state.entries.iter().any(|e| e.name == name) {
            return Err(DriverError::AlreadyExists);
        }
        let sid = state.next;
        state.next += 1;
        state.entries.push(LocEntry {
            sid,
            name: String::from(name),
            dev,
        });
        Ok(sid)
    }

    fn unregister(&self, sid: ServiceId) -> DriverResult<()> {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|e| e.sid != sid);
        if state.entries.len() == before {
            return Err(DriverError::DeviceNotFound);
        }
        Ok(())
    }

    fn resolve(&self, sid: ServiceId) -> Option<Arc<dyn BlockDevice>> {
        self.state
            .lock()
            .entries
            .iter()
            .find(|e| e.sid == sid)
            .map(|e| e.dev.clone())
    }

    fn resolve_name(&self, name: &str) -> Option<ServiceId> {
        self.state
            .lock()
            .entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.sid)
    }

    fn service_name(&self, sid: ServiceId) -> Option<String> {
        self.state
            .lock()
            .entries
            .iter()
            .find(|e| e.sid == sid)
            .map(|e| e.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_driver_ram::RamDisk;

    #[test]
    fn register_resolve_unregister() {
        let locator = Locator::new();
        let disk = Arc::new(RamDisk::new(512, 8));

        let sid = locator.register("ram0", disk).unwrap();
        assert_eq!(locator.resolve_name("ram0"), Some(sid));
        assert_eq!(locator.service_name(sid).as_deref(), Some("ram0"));
        assert!(locator.resolve(sid).is_some());

        let disk2 = Arc::new(RamDisk::new(512, 8));
        assert_eq!(
            locator.register("ram0", disk2),
            Err(DriverError::AlreadyExists)
        );

        locator.unregister(sid).unwrap();
        assert_eq!(locator.resolve_name("ram0"), None);
    }
}
