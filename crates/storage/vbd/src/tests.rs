//! VBD service tests over RAM disks with hand-made labels.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use spin::Mutex;

use strata_driver_ram::RamDisk;
use strata_driver_traits::{BlockDevice, DeviceRegistry, DriverError, DriverResult, ServiceId};

use super::label::{self, LabelType, PartContent, PTYPE_FAT16, PTYPE_FAT32};
use super::*;

struct TestRegistry {
    state: Mutex<RegistryState>,
}

struct RegistryState {
    next: ServiceId,
    by_id: BTreeMap<ServiceId, (String, Arc<dyn BlockDevice>)>,
}

impl TestRegistry {
    fn new() -> Arc<Self> {
        Arc::new(TestRegistry {
            state: Mutex::new(RegistryState {
                next: 1,
                by_id: BTreeMap::new(),
            }),
        })
    }
}

impl DeviceRegistry for TestRegistry {
    fn register(&self, name: &str, dev: Arc<dyn BlockDevice>) -> DriverResult<ServiceId> {
        let mut state = self.state.lock();
        if state.by_id.values().any(|(n, _)| n == name) {
            return Err(DriverError::AlreadyExists);
        }
        let sid = state.next;
        state.next += 1;
        state.by_id.insert(sid, (name.to_string(), dev));
        Ok(sid)
    }

    fn unregister(&self, sid: ServiceId) -> DriverResult<()> {
        self.state
            .lock()
            .by_id
            .remove(&sid)
            .map(|_| ())
            .ok_or(DriverError::DeviceNotFound)
    }

    fn resolve(&self, sid: ServiceId) -> Option<Arc<dyn BlockDevice>> {
        self.state.lock().by_id.get(&sid).map(|(_, d)| d.clone())
    }

    fn resolve_name(&self, name: &str) -> Option<ServiceId> {
        self.state
            .lock()
            .by_id
            .iter()
            .find(|(_, (n, _))| n == name)
            .map(|(&sid, _)| sid)
    }

    fn service_name(&self, sid: ServiceId) -> Option<String> {
        self.state.lock().by_id.get(&sid).map(|(n, _)| n.clone())
    }
}

/// A disk with two primary FAT partitions.
fn labelled_disk() -> Arc<RamDisk> {
    let disk = Arc::new(RamDisk::new(512, 4096));
    let mut sector = [0u8; 512];
    label::create(&mut sector);
    label::part_create(&mut sector, 1, PTYPE_FAT16, 64, 1024).unwrap();
    label::part_create(&mut sector, 2, PTYPE_FAT32, 1088, 2048).unwrap();
    disk.write_blocks(0, 1, &sector).unwrap();
    disk
}

fn setup() -> (Vbd, Arc<TestRegistry>, ServiceId) {
    let registry = TestRegistry::new();
    let disk = labelled_disk();
    let sid = registry.register("ram0", disk).unwrap();
    let vbd = Vbd::new(registry.clone());
    (vbd, registry, sid)
}

#[test]
fn disk_discovery_publishes_partitions() {
    let (vbd, registry, sid) = setup();
    vbd.disk_add("ram0").unwrap();

    let info = vbd.disk_info(sid).unwrap();
    assert_eq!(info.ltype, LabelType::Mbr);
    assert_eq!(info.nblocks, 4096);

    let parts = vbd.get_parts(sid).unwrap();
    assert_eq!(parts.len(), 2);

    // Both partitions appear under their `<disk>p<index>` names.
    let p1 = registry.resolve_name("ram0p1").unwrap();
    let p2 = registry.resolve_name("ram0p2").unwrap();
    assert_ne!(p1, p2);

    let info = vbd.part_get_info(parts[0]).unwrap();
    assert_eq!(info.index, 1);
    assert_eq!(info.block0, 64);
    assert_eq!(info.nblocks, 1024);
    assert_eq!(info.svc_id, p1);
}

#[test]
fn proxy_translates_and_range_checks() {
    let (vbd, registry, _sid) = setup();
    vbd.disk_add("ram0").unwrap();

    let p1 = registry.resolve_name("ram0p1").unwrap();
    let dev = registry.resolve(p1).unwrap();

    assert_eq!(dev.block_size(), 512);
    assert_eq!(dev.num_blocks(), 1024);

    // A write through the proxy lands at the translated address.
    let payload = [0x77u8; 512];
    dev.write_blocks(5, 1, &payload).unwrap();

    let disk = registry.resolve(registry.resolve_name("ram0").unwrap()).unwrap();
    let mut raw = [0u8; 512];
    disk.read_blocks(64 + 5, 1, &mut raw).unwrap();
    assert_eq!(&raw[..], &payload[..]);

    let mut buf = [0u8; 512];
    assert_eq!(
        dev.read_blocks(1024, 1, &mut buf),
        Err(DriverError::OutOfRange)
    );
    assert_eq!(
        dev.read_blocks(1023, 2, &mut buf),
        Err(DriverError::OutOfRange)
    );
}

#[test]
fn part_create_wipes_first_block() {
    let (vbd, registry, sid) = setup();
    vbd.disk_add("ram0").unwrap();

    // Plant a stale filesystem signature where the new partition will
    // start.
    let disk = registry.resolve(sid).unwrap();
    let mut stale = [0u8; 512];
    stale[510] = 0x55;
    stale[511] = 0xAA;
    disk.write_blocks(3200, 1, &stale).unwrap();

    let pid = vbd
        .part_create(
            sid,
            &PartSpec {
                index: 3,
                ptype: vbd.suggest_ptype(PartContent::Fat16),
                block0: 3200,
                nblocks: 512,
            },
        )
        .unwrap();

    let mut raw = [0u8; 512];
    disk.read_blocks(3200, 1, &mut raw).unwrap();
    assert!(raw.iter().all(|&b| b == 0));

    assert!(registry.resolve_name("ram0p3").is_some());
    assert_eq!(vbd.part_get_info(pid).unwrap().index, 3);
}

#[test]
fn part_delete_requires_idle_partition() {
    let (vbd, registry, sid) = setup();
    vbd.disk_add("ram0").unwrap();

    let parts = vbd.get_parts(sid).unwrap();
    let p1 = registry.resolve_name("ram0p1").unwrap();
    let dev = registry.resolve(p1).unwrap();

    dev.open().unwrap();
    assert_eq!(vbd.part_delete(parts[0]), Err(DriverError::Busy));

    dev.close().unwrap();
    vbd.part_delete(parts[0]).unwrap();
    assert!(registry.resolve_name("ram0p1").is_none());
    assert!(registry.resolve_name("ram0p2").is_some());

    // The label no longer carries the partition.
    let disk = registry.resolve(sid).unwrap();
    let mut sector = [0u8; 512];
    disk.read_blocks(0, 1, &mut sector).unwrap();
    assert_eq!(label::parse(&sector).parts.len(), 1);
}

#[test]
fn label_create_and_delete() {
    let registry = TestRegistry::new();
    let disk = Arc::new(RamDisk::new(512, 1024));
    let sid = registry.register("ram1", disk).unwrap();

    let vbd = Vbd::new(registry.clone());
    vbd.disk_add("ram1").unwrap();
    assert_eq!(vbd.disk_info(sid).unwrap().ltype, LabelType::None);

    vbd.label_create(sid).unwrap();
    assert_eq!(vbd.disk_info(sid).unwrap().ltype, LabelType::Mbr);
    assert_eq!(vbd.label_create(sid), Err(DriverError::AlreadyExists));

    vbd.part_create(
        sid,
        &PartSpec {
            index: 1,
            ptype: PTYPE_FAT16,
            block0: 8,
            nblocks: 512,
        },
    )
    .unwrap();
    assert!(registry.resolve_name("ram1p1").is_some());

    vbd.label_delete(sid).unwrap();
    assert_eq!(vbd.disk_info(sid).unwrap().ltype, LabelType::None);
    assert!(registry.resolve_name("ram1p1").is_none());
}

#[test]
fn gpt_disk_publishes_nothing() {
    let registry = TestRegistry::new();
    let disk = Arc::new(RamDisk::new(512, 1024));
    let mut sector = [0u8; 512];
    label::create(&mut sector);
    label::part_create(&mut sector, 1, label::PTYPE_GPT_PROTECTIVE, 1, 1023).unwrap();
    disk.write_blocks(0, 1, &sector).unwrap();
    registry.register("gptdisk", disk).unwrap();

    let vbd = Vbd::new(registry.clone());
    vbd.disk_add("gptdisk").unwrap();

    let sid = registry.resolve_name("gptdisk").unwrap();
    assert_eq!(vbd.disk_info(sid).unwrap().ltype, LabelType::Gpt);
    assert!(vbd.get_parts(sid).unwrap().is_empty());
}

#[test]
fn disk_remove_unpublishes_everything() {
    let (vbd, registry, _sid) = setup();
    vbd.disk_add("ram0").unwrap();
    assert!(registry.resolve_name("ram0p1").is_some());

    vbd.disk_remove("ram0").unwrap();
    assert!(registry.resolve_name("ram0p1").is_none());
    assert!(registry.resolve_name("ram0p2").is_none());
    assert!(vbd.disk_ids().is_empty());
}

#[test]
fn partition_ids_resolve_by_service() {
    let (vbd, registry, sid) = setup();
    vbd.disk_add("ram0").unwrap();

    let parts = vbd.get_parts(sid).unwrap();
    let p2 = registry.resolve_name("ram0p2").unwrap();
    assert_eq!(vbd.part_by_svcid(p2).unwrap(), parts[1]);
    assert_eq!(
        vbd.part_by_svcid(0xDEAD),
        Err(DriverError::DeviceNotFound)
    );
}
