//! Virtual block device service
//!
//! Watches raw disks, reads their partition labels and publishes every
//! non-extended partition as a block device of its own. The published
//! proxies translate block addresses by the partition's first block and
//! range-check every transfer. Partition create/delete operations edit
//! the label in place, wipe the first block of new partitions and keep
//! service registrations consistent when partition indices shift.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

use strata_block::BlockPool;
use strata_driver_traits::{BlockDevice, DeviceRegistry, DriverError, DriverResult, ServiceId};

pub mod label;

use label::{Label, LabelPart, LabelType, PartKind};

/// Partition identifier assigned by the service
pub type PartId = u64;

/// Size of the staging buffer for raw disk access
const DISK_COMM_SIZE: usize = 2048;

/// Information about one disk.
#[derive(Debug, Clone, Copy)]
pub struct DiskInfo {
    pub ltype: LabelType,
    pub block_size: usize,
    pub nblocks: u64,
}

/// Information about one partition.
#[derive(Debug, Clone, Copy)]
pub struct PartInfo {
    pub index: u32,
    pub kind: PartKind,
    pub block0: u64,
    pub nblocks: u64,
    /// Service id of the published proxy; zero while unregistered
    pub svc_id: ServiceId,
}

/// Parameters of a new partition.
#[derive(Debug, Clone, Copy)]
pub struct PartSpec {
    pub index: u32,
    pub ptype: u8,
    pub block0: u64,
    pub nblocks: u64,
}

struct PartState {
    lpart: Option<LabelPart>,
    svc_id: ServiceId,
    /// Label index the service was registered under
    reg_idx: u32,
    open_cnt: u32,
}

struct VbdPart {
    pid: PartId,
    disk: Arc<VbdDisk>,
    /// Serializes open/close against in-flight I/O
    lock: RwLock<()>,
    state: Mutex<PartState>,
}

struct VbdDisk {
    svc_id: ServiceId,
    svc_name: String,
    block_size: usize,
    nblocks: u64,
    label: Mutex<Label>,
    parts: Mutex<Vec<Arc<VbdPart>>>,
}

/// Block device proxy published for one partition.
struct PartDevice {
    pool: Arc<BlockPool>,
    part: Arc<VbdPart>,
}

impl PartDevice {
    /// Translate a block segment address with range checking.
    fn bsa_translate(&self, ba: u64, cnt: usize) -> DriverResult<u64> {
        let state = self.part.state.lock();
        let lpart = state.lpart.ok_or(DriverError::DeviceNotFound)?;
        if ba + cnt as u64 > lpart.nblocks {
            return Err(DriverError::OutOfRange);
        }
        Ok(lpart.block0 + ba)
    }
}

impl BlockDevice for PartDevice {
    fn block_size(&self) -> usize {
        self.part.disk.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.part
            .state
            .lock()
            .lpart
            .map(|p| p.nblocks)
            .unwrap_or(0)
    }

    fn read_blocks(&self, ba: u64, cnt: usize, buf: &mut [u8]) -> DriverResult<()> {
        let _io = self.part.lock.read();
        let gba = self.bsa_translate(ba, cnt)?;
        self.pool
            .read_direct(self.part.disk.svc_id, gba, cnt, buf)
            .map_err(|_| DriverError::IoError)
    }

    fn write_blocks(&self, ba: u64, cnt: usize, buf: &[u8]) -> DriverResult<()> {
        let _io = self.part.lock.read();
        let gba = self.bsa_translate(ba, cnt)?;
        self.pool
            .write_direct(self.part.disk.svc_id, gba, cnt, buf)
            .map_err(|_| DriverError::IoError)
    }

    fn open(&self) -> DriverResult<()> {
        let _excl = self.part.lock.write();
        self.part.state.lock().open_cnt += 1;
        Ok(())
    }

    fn close(&self) -> DriverResult<()> {
        // Taking the writer side drains all in-flight I/O first.
        let _excl = self.part.lock.write();
        self.part.state.lock().open_cnt -= 1;
        Ok(())
    }
}

/// The VBD service.
pub struct Vbd {
    pool: Arc<BlockPool>,
    registry: Arc<dyn DeviceRegistry>,
    disks: Mutex<Vec<Arc<VbdDisk>>>,
    parts: Mutex<Vec<Arc<VbdPart>>>,
    next_part_id: Mutex<PartId>,
}

impl Vbd {
    pub fn new(registry: Arc<dyn DeviceRegistry>) -> Self {
        Vbd {
            pool: Arc::new(BlockPool::new()),
            registry,
            disks: Mutex::new(Vec::new()),
            parts: Mutex::new(Vec::new()),
            next_part_id: Mutex::new(1),
        }
    }

    fn disk_by_svcid(&self, sid: ServiceId) -> DriverResult<Arc<VbdDisk>> {
        self.disks
            .lock()
            .iter()
            .find(|d| d.svc_id == sid)
            .cloned()
            .ok_or(DriverError::DeviceNotFound)
    }

    fn part_by_pid(&self, pid: PartId) -> DriverResult<Arc<VbdPart>> {
        self.parts
            .lock()
            .iter()
            .find(|p| p.pid == pid)
            .cloned()
            .ok_or(DriverError::DeviceNotFound)
    }

    /// Partition lookup by the service id of its published proxy.
    pub fn part_by_svcid(&self, svcid: ServiceId) -> DriverResult<PartId> {
        self.parts
            .lock()
            .iter()
            .find(|p| p.state.lock().svc_id == svcid)
            .map(|p| p.pid)
            .ok_or(DriverError::DeviceNotFound)
    }

    /// Register the proxy service for a partition.
    fn part_svc_register(&self, part: &Arc<VbdPart>) -> DriverResult<()> {
        let (idx, disk_name) = {
            let state = part.state.lock();
            let lpart = state.lpart.ok_or(DriverError::DeviceNotFound)?;
            (lpart.index, part.disk.svc_name.clone())
        };

        let name = format!("{}p{}", disk_name, idx);
        let dev = Arc::new(PartDevice {
            pool: self.pool.clone(),
            part: part.clone(),
        });
        let svc_id = self.registry.register(&name, dev)?;

        let mut state = part.state.lock();
        state.svc_id = svc_id;
        state.reg_idx = idx;
        Ok(())
    }

    fn part_svc_unregister(&self, part: &Arc<VbdPart>) -> DriverResult<()> {
        let svc_id = {
            let state = part.state.lock();
            state.svc_id
        };
        if svc_id == 0 {
            return Ok(());
        }
        self.registry.unregister(svc_id)?;

        let mut state = part.state.lock();
        state.svc_id = 0;
        state.reg_idx = 0;
        Ok(())
    }

    /// Add one labelled partition to the inventory, publishing it when
    /// it is not an extended partition.
    fn part_add(&self, disk: &Arc<VbdDisk>, lpart: LabelPart) -> DriverResult<Arc<VbdPart>> {
        let pid = {
            let mut next = self.next_part_id.lock();
            let pid = *next;
            *next += 1;
            pid
        };

        let part = Arc::new(VbdPart {
            pid,
            disk: disk.clone(),
            lock: RwLock::new(()),
            state: Mutex::new(PartState {
                lpart: Some(lpart),
                svc_id: 0,
                reg_idx: 0,
                open_cnt: 0,
            }),
        });

        if lpart.kind != PartKind::Extended {
            self.part_svc_register(&part)?;
        }

        disk.parts.lock().push(part.clone());
        self.parts.lock().push(part.clone());
        Ok(part)
    }

    /// Remove a partition from the inventory, returning its label
    /// entry. Fails with `Busy` when the partition is open, unless
    /// `force` is set.
    fn part_remove(&self, part: &Arc<VbdPart>, force: bool) -> DriverResult<LabelPart> {
        let _excl = part.lock.write();

        let lpart = {
            let state = part.state.lock();
            if !force && state.open_cnt > 0 {
                return Err(DriverError::Busy);
            }
            state.lpart.ok_or(DriverError::DeviceNotFound)?
        };

        self.part_svc_unregister(part)?;

        part.disk.parts.lock().retain(|p| p.pid != part.pid);
        self.parts.lock().retain(|p| p.pid != part.pid);
        part.state.lock().lpart = None;
        Ok(lpart)
    }

    /// Re-register services for any partition whose label index
    /// changed.
    fn part_indices_update(&self, disk: &Arc<VbdDisk>) -> DriverResult<()> {
        let parts: Vec<Arc<VbdPart>> = disk.parts.lock().clone();

        // First unregister everything whose index moved away...
        for part in parts.iter() {
            let stale = {
                let state = part.state.lock();
                match state.lpart {
                    Some(lpart) => state.svc_id != 0 && lpart.index != state.reg_idx,
                    None => false,
                }
            };
            if stale {
                self.part_svc_unregister(part)?;
            }
        }

        // ...then register everything publishable under its new index.
        for part in parts.iter() {
            let publish = {
                let state = part.state.lock();
                match state.lpart {
                    Some(lpart) => state.svc_id == 0 && lpart.kind != PartKind::Extended,
                    None => false,
                }
            };
            if publish {
                self.part_svc_register(part)?;
            }
        }

        Ok(())
    }

    fn label_read(&self, disk: &VbdDisk) -> DriverResult<Vec<u8>> {
        let mut sector = vec![0u8; disk.block_size];
        self.pool
            .read_direct(disk.svc_id, 0, 1, &mut sector)
            .map_err(|_| DriverError::IoError)?;
        Ok(sector)
    }

    fn label_write(&self, disk: &VbdDisk, sector: &[u8]) -> DriverResult<()> {
        self.pool
            .write_direct(disk.svc_id, 0, 1, sector)
            .map_err(|_| DriverError::IoError)
    }

    /// Take a new disk into the inventory: open it, read its label and
    /// publish the partitions found.
    pub fn disk_add(&self, disk_name: &str) -> DriverResult<()> {
        let sid = self
            .registry
            .resolve_name(disk_name)
            .ok_or(DriverError::DeviceNotFound)?;
        if self.disk_by_svcid(sid).is_ok() {
            return Err(DriverError::AlreadyExists);
        }

        let dev = self.registry.resolve(sid).ok_or(DriverError::DeviceNotFound)?;
        self.pool.init(sid, dev.clone(), DISK_COMM_SIZE).map_err(|_| DriverError::IoError)?;

        let block_size = dev.block_size();
        let nblocks = dev.num_blocks();

        let disk = Arc::new(VbdDisk {
            svc_id: sid,
            svc_name: String::from(disk_name),
            block_size,
            nblocks,
            label: Mutex::new(Label {
                ltype: LabelType::None,
                parts: Vec::new(),
            }),
            parts: Mutex::new(Vec::new()),
        });

        let sector = match self.label_read(&disk) {
            Ok(sector) => sector,
            Err(err) => {
                let _ = self.pool.fini(sid);
                return Err(err);
            }
        };
        let parsed = label::parse(&sector);
        *disk.label.lock() = parsed.clone();

        self.disks.lock().push(disk.clone());

        for lpart in parsed.parts {
            if let Err(err) = self.part_add(&disk, lpart) {
                // Roll the whole disk back; a half-published disk would
                // be worse than none.
                let _ = self.disk_remove(disk_name);
                return Err(err);
            }
        }

        Ok(())
    }

    /// Remove a disk and all of its partitions from the inventory.
    pub fn disk_remove(&self, disk_name: &str) -> DriverResult<()> {
        let sid = self
            .registry
            .resolve_name(disk_name)
            .ok_or(DriverError::DeviceNotFound)?;
        let disk = self.disk_by_svcid(sid)?;

        let parts: Vec<Arc<VbdPart>> = disk.parts.lock().clone();
        for part in parts {
            self.part_remove(&part, true)?;
        }

        self.disks.lock().retain(|d| d.svc_id != sid);
        self.pool.fini(sid).map_err(|_| DriverError::IoError)?;
        Ok(())
    }

    /// Service ids of all known disks.
    pub fn disk_ids(&self) -> Vec<ServiceId> {
        self.disks.lock().iter().map(|d| d.svc_id).collect()
    }

    pub fn disk_info(&self, sid: ServiceId) -> DriverResult<DiskInfo> {
        let disk = self.disk_by_svcid(sid)?;
        let ltype = disk.label.lock().ltype;
        Ok(DiskInfo {
            ltype,
            block_size: disk.block_size,
            nblocks: disk.nblocks,
        })
    }

    /// Partition ids of one disk.
    pub fn get_parts(&self, sid: ServiceId) -> DriverResult<Vec<PartId>> {
        let disk = self.disk_by_svcid(sid)?;
        let ids = disk.parts.lock().iter().map(|p| p.pid).collect();
        Ok(ids)
    }

    pub fn part_get_info(&self, pid: PartId) -> DriverResult<PartInfo> {
        let part = self.part_by_pid(pid)?;
        let state = part.state.lock();
        let lpart = state.lpart.ok_or(DriverError::DeviceNotFound)?;
        Ok(PartInfo {
            index: lpart.index,
            kind: lpart.kind,
            block0: lpart.block0,
            nblocks: lpart.nblocks,
            svc_id: state.svc_id,
        })
    }

    /// Write an empty label onto an unlabelled disk.
    pub fn label_create(&self, sid: ServiceId) -> DriverResult<()> {
        let disk = self.disk_by_svcid(sid)?;

        if disk.label.lock().ltype != LabelType::None {
            return Err(DriverError::AlreadyExists);
        }

        let mut sector = self.label_read(&disk)?;
        label::create(&mut sector);
        self.label_write(&disk, &sector)?;

        *disk.label.lock() = label::parse(&sector);
        Ok(())
    }

    /// Destroy the label of a disk. All partitions must be idle.
    pub fn label_delete(&self, sid: ServiceId) -> DriverResult<()> {
        let disk = self.disk_by_svcid(sid)?;

        let parts: Vec<Arc<VbdPart>> = disk.parts.lock().clone();
        for part in parts {
            self.part_remove(&part, false)?;
        }

        let mut sector = self.label_read(&disk)?;
        label::destroy(&mut sector);
        self.label_write(&disk, &sector)?;

        *disk.label.lock() = label::parse(&sector);
        Ok(())
    }

    /// Create a partition, wiping the first block of its new address
    /// range so no residual filesystem signature survives.
    pub fn part_create(&self, sid: ServiceId, spec: &PartSpec) -> DriverResult<PartId> {
        let disk = self.disk_by_svcid(sid)?;

        if spec.block0 + spec.nblocks > disk.nblocks {
            return Err(DriverError::OutOfRange);
        }

        let mut sector = self.label_read(&disk)?;
        label::part_create(&mut sector, spec.index, spec.ptype, spec.block0, spec.nblocks)?;
        self.label_write(&disk, &sector)?;

        let parsed = label::parse(&sector);
        let lpart = parsed
            .parts
            .iter()
            .find(|p| p.index == spec.index)
            .copied()
            .ok_or(DriverError::IoError)?;
        *disk.label.lock() = parsed;

        // Destroy any residual filesystem signature in the new
        // partition.
        let zeroes = vec![0u8; disk.block_size];
        self.pool
            .write_direct(disk.svc_id, lpart.block0, 1, &zeroes)
            .map_err(|_| DriverError::IoError)?;

        self.part_indices_update(&disk)?;

        let part = match self.part_add(&disk, lpart) {
            Ok(part) => part,
            Err(err) => {
                // Roll the label change back.
                let mut sector = self.label_read(&disk)?;
                let _ = label::part_destroy(&mut sector, spec.index);
                let _ = self.label_write(&disk, &sector);
                *disk.label.lock() = label::parse(&sector);
                return Err(err);
            }
        };

        Ok(part.pid)
    }

    /// Delete a partition. Fails with `Busy` while it is open.
    pub fn part_delete(&self, pid: PartId) -> DriverResult<()> {
        let part = self.part_by_pid(pid)?;
        let disk = part.disk.clone();

        let lpart = self.part_remove(&part, false)?;

        let mut sector = self.label_read(&disk)?;
        if let Err(err) = label::part_destroy(&mut sector, lpart.index) {
            // Reinsert the destroyed partition.
            let _ = self.part_add(&disk, lpart);
            return Err(err);
        }
        self.label_write(&disk, &sector)?;
        *disk.label.lock() = label::parse(&sector);

        self.part_indices_update(&disk)?;
        Ok(())
    }

    /// Suggest a partition type byte for the given content.
    pub fn suggest_ptype(&self, content: label::PartContent) -> u8 {
        label::suggest_ptype(content)
    }
}

#[cfg(test)]
mod tests;
