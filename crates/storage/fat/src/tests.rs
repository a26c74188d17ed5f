//! Scenario tests for the FAT server, driven against formatted RAM
//! disks through the public server contract.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use strata_driver_ram::RamDisk;
use strata_driver_traits::{BlockDevice, DeviceRegistry, DriverError, DriverResult, ServiceId};
use strata_vfs::{
    FsServer, LookupFlags, LookupOutcome, LookupRequest, LookupRes, Plb, VfsError, VfsResult,
};

use crate::bpb::{BootSector, FatType};
use crate::dentry::{self, FAT_ATTR_LFN};
use crate::fmt::{self, FatCfg};
use crate::FatFs;

struct MapRegistry {
    devices: Mutex<BTreeMap<ServiceId, Arc<dyn BlockDevice>>>,
}

impl MapRegistry {
    fn new() -> Self {
        MapRegistry {
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    fn insert(&self, sid: ServiceId, dev: Arc<dyn BlockDevice>) {
        self.devices.lock().insert(sid, dev);
    }
}

impl DeviceRegistry for MapRegistry {
    fn register(&self, _name: &str, dev: Arc<dyn BlockDevice>) -> DriverResult<ServiceId> {
        let mut devices = self.devices.lock();
        let sid = devices.keys().next_back().map(|&s| s + 1).unwrap_or(1);
        devices.insert(sid, dev);
        Ok(sid)
    }

    fn unregister(&self, sid: ServiceId) -> DriverResult<()> {
        self.devices
            .lock()
            .remove(&sid)
            .map(|_| ())
            .ok_or(DriverError::DeviceNotFound)
    }

    fn resolve(&self, sid: ServiceId) -> Option<Arc<dyn BlockDevice>> {
        self.devices.lock().get(&sid).cloned()
    }

    fn resolve_name(&self, _name: &str) -> Option<ServiceId> {
        None
    }

    fn service_name(&self, _sid: ServiceId) -> Option<String> {
        None
    }
}

const SID: ServiceId = 1;

fn format_disk(total_sectors: u32, fat_type: Option<FatType>) -> Arc<RamDisk> {
    let disk = Arc::new(RamDisk::new(512, total_sectors as u64));
    let mut cfg = FatCfg {
        total_sectors,
        fat_type,
        label: Some(*b"TESTVOL    "),
        serial: 0x2A2A2A2A,
        ..FatCfg::default()
    };
    fmt::mkfat(disk.as_ref(), &mut cfg).unwrap();
    disk
}

fn mounted_fs(total_sectors: u32, fat_type: Option<FatType>, opts: &str) -> (FatFs, Arc<RamDisk>) {
    let disk = format_disk(total_sectors, fat_type);
    let registry = Arc::new(MapRegistry::new());
    registry.insert(SID, disk.clone());
    let fat = FatFs::new(registry);
    fat.mounted(SID, opts).unwrap();
    (fat, disk)
}

fn lookup(
    fat: &FatFs,
    plb: &Plb,
    path: &str,
    flags: LookupFlags,
    index: Option<u32>,
) -> VfsResult<LookupRes> {
    let claim = plb.claim(path)?;
    let req = LookupRequest {
        plb,
        fs_handle: 1,
        service_id: SID,
        first: claim.first(),
        last: claim.last(),
        flags,
        index,
        start: None,
    };
    match fat.lookup(&req)? {
        LookupOutcome::Done(res) => Ok(res),
        LookupOutcome::Forward { .. } => Err(VfsError::NotSupported),
    }
}

fn write_all(fat: &FatFs, index: u32, mut pos: u64, mut data: &[u8]) -> u64 {
    let mut size = 0;
    while !data.is_empty() {
        let res = fat.write(SID, index, pos, data).unwrap();
        pos += res.bytes as u64;
        data = &data[res.bytes..];
        size = res.size;
    }
    size
}

fn read_exact(fat: &FatFs, index: u32, mut pos: u64, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < len {
        let mut buf = alloc::vec![0u8; len - out.len()];
        let n = fat.read(SID, index, pos, &mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
        pos += n as u64;
    }
    out
}

/// Names of all entries in a directory, read through the server.
fn list_dir(fat: &FatFs, index: u32) -> Vec<String> {
    let mut names = Vec::new();
    let mut pos = 0u64;
    loop {
        let mut buf = [0u8; 300];
        match fat.read(SID, index, pos, &mut buf) {
            Ok(consumed) => {
                let len = buf.iter().position(|&b| b == 0).unwrap_or(0);
                names.push(String::from_utf8_lossy(&buf[..len]).into_owned());
                pos += consumed as u64;
            }
            Err(VfsError::NotFound) => break,
            Err(err) => panic!("directory read failed: {:?}", err),
        }
    }
    names
}

#[test]
fn mount_and_stat_root() {
    let (fat, _disk) = mounted_fs(20480, Some(FatType::Fat16), "wtcache");

    let info = fat.node_info(SID, 0).unwrap();
    assert_eq!(info.node_type, strata_vfs::NodeType::Directory);
    assert_eq!(info.lnkcnt, 0);
    assert!(list_dir(&fat, 0).is_empty());

    let probe = fat.fsprobe(SID).unwrap();
    assert_eq!(probe.label, "TESTVOL");

    // The root directory carries the label as a volume label entry.
    let root = fat.node_or_enoent(SID, 0).unwrap();
    let mut di = crate::dir::FatDirectory::open(&fat, root.clone()).unwrap();
    assert_eq!(di.vollabel_get().unwrap().as_deref(), Some("TESTVOL"));
    di.close().unwrap();
    fat.node_put_internal(root);
}

#[test]
fn boot_sector_carries_label() {
    let disk = format_disk(20480, Some(FatType::Fat16));
    let image = disk.snapshot();
    assert_eq!(&image[43..54], b"TESTVOL    ");
    assert_eq!(&image[510..512], &[0x55, 0xAA]);
}

#[test]
fn create_write_read_roundtrip() {
    let (fat, _disk) = mounted_fs(20480, Some(FatType::Fat16), "wtcache");
    let plb = Plb::new();

    let lr = lookup(
        &fat,
        &plb,
        "/hello.txt",
        LookupFlags::CREATE | LookupFlags::FILE,
        None,
    )
    .unwrap();

    let size = write_all(&fat, lr.triplet.index, 0, b"hello world");
    assert_eq!(size, 11);

    // Re-resolve and read back.
    let lr2 = lookup(&fat, &plb, "/hello.txt", LookupFlags::FILE, None).unwrap();
    assert_eq!(lr2.triplet.index, lr.triplet.index);
    assert_eq!(lr2.size, 11);
    assert_eq!(read_exact(&fat, lr2.triplet.index, 0, 16), b"hello world");
}

#[test]
fn sparse_write_zero_fills_gap() {
    let (fat, _disk) = mounted_fs(20480, None, "wtcache");
    let plb = Plb::new();

    let lr = lookup(
        &fat,
        &plb,
        "/sparse",
        LookupFlags::CREATE | LookupFlags::FILE,
        None,
    )
    .unwrap();

    let res = fat.write(SID, lr.triplet.index, 8192, b"x").unwrap();
    assert_eq!(res.bytes, 1);
    assert_eq!(res.size, 8193);

    let gap = read_exact(&fat, lr.triplet.index, 0, 8192);
    assert_eq!(gap.len(), 8192);
    assert!(gap.iter().all(|&b| b == 0));

    // The chain has no holes: the size occupies the minimum whole
    // number of clusters.
    let bs = fat.bs(SID).unwrap();
    let node = fat.node_or_enoent(SID, lr.triplet.index).unwrap();
    let firstc = node.inner.lock().firstc;
    let clusters = crate::table::clusters_get(&fat.pool, &bs, SID, firstc).unwrap();
    let bpc = bs.bpc() as u64;
    assert_eq!(clusters as u64, (8193 + bpc - 1) / bpc);
    fat.node_put_internal(node);
}

#[test]
fn truncate_to_zero_releases_clusters() {
    let (fat, _disk) = mounted_fs(20480, Some(FatType::Fat16), "wtcache");
    let plb = Plb::new();

    let before = fat.statfs(SID, 0).unwrap().free_blocks;

    let lr = lookup(
        &fat,
        &plb,
        "/data.bin",
        LookupFlags::CREATE | LookupFlags::FILE,
        None,
    )
    .unwrap();
    write_all(&fat, lr.triplet.index, 0, &alloc::vec![7u8; 10000]);
    assert!(fat.statfs(SID, 0).unwrap().free_blocks < before);

    fat.truncate(SID, lr.triplet.index, 0).unwrap();
    assert_eq!(fat.statfs(SID, 0).unwrap().free_blocks, before);

    let node = fat.node_or_enoent(SID, lr.triplet.index).unwrap();
    assert_eq!(node.inner.lock().firstc, 0);
    fat.node_put_internal(node);
}

#[test]
fn lfn_roundtrip_and_on_disk_layout() {
    let name = "A Very Long Filename Containing Spaces.txt";
    let (fat, disk) = mounted_fs(20480, Some(FatType::Fat16), "wtcache");
    let plb = Plb::new();

    lookup(
        &fat,
        &plb,
        "/A Very Long Filename Containing Spaces.txt",
        LookupFlags::CREATE | LookupFlags::FILE,
        None,
    )
    .unwrap();

    // The listing shows the exact long name.
    assert_eq!(list_dir(&fat, 0), alloc::vec![String::from(name)]);

    // Lookups match case-insensitively through the long name.
    assert!(lookup(
        &fat,
        &plb,
        "/a very long filename containing spaces.TXT",
        LookupFlags::FILE,
        None
    )
    .is_ok());

    // On disk: the volume label, four long fragments in descending
    // order, then the synthesized short entry.
    fat.unmounted(SID).unwrap();
    let image = disk.snapshot();
    let bs = BootSector::parse(&image[..512]).unwrap();
    let root = (bs.rscnt() + bs.fatcnt() * bs.sf()) as usize * 512;

    let lfn = &image[root + 32..root + 5 * 32];
    let sfn = &image[root + 5 * 32..root + 6 * 32];

    assert_eq!(&sfn[0..11], b"AVERYL~1TXT");
    let checksum = dentry::chksum(&sfn[0..11]);

    let units: usize = name.encode_utf16().count();
    assert_eq!((units + 12) / 13, 4);
    for (i, slot) in lfn.chunks(32).enumerate() {
        assert_eq!(slot[11], FAT_ATTR_LFN);
        assert_eq!(slot[13], checksum);
        let expected_order = (4 - i) as u8;
        if i == 0 {
            assert_eq!(slot[0], expected_order | dentry::FAT_LFN_LAST);
        } else {
            assert_eq!(slot[0], expected_order);
        }
    }
}

#[test]
fn short_name_synthesis_is_deterministic() {
    let (fat, _disk) = mounted_fs(20480, Some(FatType::Fat16), "wtcache");
    let plb = Plb::new();

    lookup(
        &fat,
        &plb,
        "/longish name.ext",
        LookupFlags::CREATE | LookupFlags::FILE,
        None,
    )
    .unwrap();
    lookup(
        &fat,
        &plb,
        "/longish name two.ext",
        LookupFlags::CREATE | LookupFlags::FILE,
        None,
    )
    .unwrap();

    // Both long names map to distinct ~N short names.
    let mut di = crate::dir::FatDirectory::open(
        &fat,
        fat.node_or_enoent(SID, 0).unwrap(),
    )
    .unwrap();
    let mut shorts = Vec::new();
    loop {
        let raw = match di.get() {
            Ok(raw) => raw,
            Err(_) => break,
        };
        if dentry::classify(&raw) == dentry::DentryClass::Valid {
            shorts.push(raw[0..11].to_vec());
        }
        if di.next().is_err() {
            break;
        }
    }
    di.close().unwrap();

    assert!(shorts.contains(&b"LONGIS~1EXT".to_vec()));
    assert!(shorts.contains(&b"LONGIS~2EXT".to_vec()));
}

#[test]
fn unlink_keeps_index_alive_until_destroy() {
    let (fat, _disk) = mounted_fs(20480, Some(FatType::Fat16), "wtcache");
    let plb = Plb::new();

    let lr = lookup(
        &fat,
        &plb,
        "/victim",
        LookupFlags::CREATE | LookupFlags::FILE,
        None,
    )
    .unwrap();
    write_all(&fat, lr.triplet.index, 0, b"payload");

    let unlinked = lookup(&fat, &plb, "/victim", LookupFlags::UNLINK, None).unwrap();
    assert_eq!(unlinked.triplet.index, lr.triplet.index);
    assert_eq!(unlinked.lnkcnt, 1);

    assert!(matches!(
        lookup(&fat, &plb, "/victim", LookupFlags::empty(), None),
        Err(VfsError::NotFound)
    ));

    // The unlinked node is still reachable by index and readable.
    assert_eq!(read_exact(&fat, lr.triplet.index, 0, 7), b"payload");

    fat.destroy(SID, lr.triplet.index).unwrap();
    assert!(fat.node_get_internal(SID, lr.triplet.index).unwrap().is_none());
}

#[test]
fn rename_via_unlink_link_preserves_index() {
    let (fat, _disk) = mounted_fs(20480, Some(FatType::Fat16), "wtcache");
    let plb = Plb::new();

    lookup(
        &fat,
        &plb,
        "/a",
        LookupFlags::CREATE | LookupFlags::DIRECTORY | LookupFlags::EXCLUSIVE,
        None,
    )
    .unwrap();
    lookup(
        &fat,
        &plb,
        "/b",
        LookupFlags::CREATE | LookupFlags::DIRECTORY | LookupFlags::EXCLUSIVE,
        None,
    )
    .unwrap();
    let f = lookup(
        &fat,
        &plb,
        "/a/f",
        LookupFlags::CREATE | LookupFlags::FILE,
        None,
    )
    .unwrap();

    lookup(&fat, &plb, "/a/f", LookupFlags::UNLINK, None).unwrap();
    let g = lookup(
        &fat,
        &plb,
        "/b/g",
        LookupFlags::LINK,
        Some(f.triplet.index),
    )
    .unwrap();

    assert_eq!(g.triplet.index, f.triplet.index);
    assert!(matches!(
        lookup(&fat, &plb, "/a/f", LookupFlags::empty(), None),
        Err(VfsError::NotFound)
    ));
    assert!(lookup(&fat, &plb, "/b/g", LookupFlags::FILE, None).is_ok());
}

#[test]
fn directory_with_children_refuses_unlink() {
    let (fat, _disk) = mounted_fs(20480, Some(FatType::Fat16), "wtcache");
    let plb = Plb::new();

    lookup(
        &fat,
        &plb,
        "/dir",
        LookupFlags::CREATE | LookupFlags::DIRECTORY | LookupFlags::EXCLUSIVE,
        None,
    )
    .unwrap();
    lookup(
        &fat,
        &plb,
        "/dir/child",
        LookupFlags::CREATE | LookupFlags::FILE,
        None,
    )
    .unwrap();

    assert!(matches!(
        lookup(&fat, &plb, "/dir", LookupFlags::UNLINK, None),
        Err(VfsError::NotEmpty)
    ));
}

#[test]
fn fat_copies_agree_after_allocation() {
    let (fat, disk) = mounted_fs(20480, Some(FatType::Fat16), "wtcache");
    let plb = Plb::new();

    let lr = lookup(
        &fat,
        &plb,
        "/big",
        LookupFlags::CREATE | LookupFlags::FILE,
        None,
    )
    .unwrap();
    write_all(&fat, lr.triplet.index, 0, &alloc::vec![1u8; 40000]);

    fat.unmounted(SID).unwrap();
    let image = disk.snapshot();
    let bs = BootSector::parse(&image[..512]).unwrap();

    let fat_len = bs.sf() as usize * 512;
    let fat1 = &image[bs.rscnt() as usize * 512..][..fat_len];
    let fat2 = &image[(bs.rscnt() + bs.sf()) as usize * 512..][..fat_len];
    assert_eq!(fat1, fat2);
}

#[test]
fn full_volume_returns_no_space_without_leaks() {
    // A tiny FAT12 volume that fills up quickly.
    let (fat, _disk) = mounted_fs(128, Some(FatType::Fat12), "wtcache");
    let plb = Plb::new();

    let lr = lookup(
        &fat,
        &plb,
        "/fill",
        LookupFlags::CREATE | LookupFlags::FILE,
        None,
    )
    .unwrap();

    let mut pos = 0u64;
    let err = loop {
        match fat.write(SID, lr.triplet.index, pos, &[0xAB; 512]) {
            Ok(res) => pos += res.bytes as u64,
            Err(err) => break err,
        }
    };
    assert_eq!(err, VfsError::NoSpace);

    let free_after_fail = fat.statfs(SID, 0).unwrap().free_blocks;
    assert_eq!(free_after_fail, 0);

    // Releasing the file gives every cluster back.
    fat.truncate(SID, lr.triplet.index, 0).unwrap();
    let bs = fat.bs(SID).unwrap();
    assert_eq!(fat.statfs(SID, 0).unwrap().free_blocks, bs.cc() as u64);
}

#[test]
fn unmount_busy_while_node_referenced() {
    let (fat, _disk) = mounted_fs(20480, Some(FatType::Fat16), "wtcache");
    let plb = Plb::new();

    let lr = lookup(
        &fat,
        &plb,
        "/open",
        LookupFlags::CREATE | LookupFlags::FILE,
        None,
    )
    .unwrap();

    // Hold the node open across the unmount attempt.
    let node = fat.node_or_enoent(SID, lr.triplet.index).unwrap();
    assert!(matches!(fat.unmounted(SID), Err(VfsError::Busy)));

    fat.node_put_internal(node);
    fat.unmounted(SID).unwrap();
}

fn exercise_variant(fat: &FatFs) {
    let plb = Plb::new();

    let dir = lookup(
        fat,
        &plb,
        "/nested",
        LookupFlags::CREATE | LookupFlags::DIRECTORY | LookupFlags::EXCLUSIVE,
        None,
    )
    .unwrap();
    let file = lookup(
        fat,
        &plb,
        "/nested/file.bin",
        LookupFlags::CREATE | LookupFlags::FILE,
        None,
    )
    .unwrap();

    write_all(fat, file.triplet.index, 0, b"variant check");
    assert_eq!(read_exact(fat, file.triplet.index, 0, 13), b"variant check");
    assert_eq!(list_dir(fat, dir.triplet.index), ["file.bin"]);
}

#[test]
fn fat12_variant_works() {
    let (fat, _disk) = mounted_fs(2880, Some(FatType::Fat12), "");
    exercise_variant(&fat);
}

#[test]
fn fat32_variant_works() {
    // Just past the FAT16 cluster limit with one sector per cluster.
    let disk = Arc::new(RamDisk::new(512, 70000));
    let mut cfg = FatCfg {
        total_sectors: 70000,
        sectors_per_cluster: 1,
        fat_type: Some(FatType::Fat32),
        label: Some(*b"BIGVOL     "),
        serial: 7,
        ..FatCfg::default()
    };
    fmt::mkfat(disk.as_ref(), &mut cfg).unwrap();

    let registry = Arc::new(MapRegistry::new());
    registry.insert(SID, disk);
    let fat = FatFs::new(registry);
    fat.mounted(SID, "").unwrap();
    exercise_variant(&fat);
}
