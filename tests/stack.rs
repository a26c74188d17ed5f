//! End-to-end scenarios driven through the whole stack: dispatcher,
//! servers, block cache and RAM disks.

use std::sync::Arc;

use strata::fat::bpb::FatType;
use strata::fat::fmt::{self, FatCfg};
use strata::ram::RamDisk;
use strata::vfs::{ClientId, LookupFlags, NodeType, OpenFlags, ServiceId, Vfs, VfsError};
use strata::{read_full_at, write_all_at, Stack};
use strata_driver_traits::DeviceRegistry;

/// Format a RAM disk the way the mkfat tool would.
fn fat_disk(total_sectors: u32, fat_type: FatType, label: &str) -> Arc<RamDisk> {
    let disk = Arc::new(RamDisk::new(512, total_sectors as u64));
    let mut cfg = FatCfg {
        total_sectors,
        fat_type: Some(fat_type),
        label: Some(fmt::label_encode(label).unwrap()),
        serial: 0x00C0FFEE,
        ..FatCfg::default()
    };
    fmt::mkfat(disk.as_ref(), &mut cfg).unwrap();
    disk
}

/// Stack with a FAT volume mounted as the root filesystem.
fn fat_root_stack(opts: &str) -> (Stack, ClientId, usize, Arc<RamDisk>) {
    let stack = Stack::new().unwrap();
    let disk = fat_disk(20480, FatType::Fat16, "TESTVOL");
    let sid = stack.locator.register("ram0", disk.clone()).unwrap();
    stack.vfs.mount_root("fat", 0, sid, opts).unwrap();

    let client = stack.vfs.client_attach();
    let rootfd = stack.vfs.op_root(client).unwrap();
    (stack, client, rootfd, disk)
}

/// Stack with a tmpfs root.
fn tmpfs_root_stack() -> (Stack, ClientId, usize) {
    let stack = Stack::new().unwrap();
    stack.vfs.mount_root("tmpfs", 0, 1, "").unwrap();
    let client = stack.vfs.client_attach();
    let rootfd = stack.vfs.op_root(client).unwrap();
    (stack, client, rootfd)
}

fn create_file(vfs: &Vfs, client: ClientId, rootfd: usize, path: &str) -> usize {
    let fd = vfs
        .op_walk(
            client,
            rootfd,
            path,
            LookupFlags::CREATE | LookupFlags::FILE,
        )
        .unwrap();
    vfs.op_open(client, fd, OpenFlags::READ | OpenFlags::WRITE)
        .unwrap();
    fd
}

fn mkdir(vfs: &Vfs, client: ClientId, rootfd: usize, path: &str) {
    let fd = vfs
        .op_walk(
            client,
            rootfd,
            path,
            LookupFlags::CREATE | LookupFlags::DIRECTORY,
        )
        .unwrap();
    vfs.op_put(client, fd).unwrap();
}

/// List a directory by reading entry names through the dispatcher.
fn list_dir(vfs: &Vfs, client: ClientId, rootfd: usize, path: &str) -> Vec<String> {
    let fd = vfs
        .op_walk(client, rootfd, path, LookupFlags::DIRECTORY)
        .unwrap();
    vfs.op_open(client, fd, OpenFlags::READ).unwrap();

    let mut names = Vec::new();
    let mut pos = 0u64;
    loop {
        let mut buf = [0u8; 300];
        match vfs.op_read(client, fd, Some(pos), &mut buf) {
            Ok(consumed) => {
                let len = buf.iter().position(|&b| b == 0).unwrap_or(0);
                names.push(String::from_utf8_lossy(&buf[..len]).into_owned());
                pos += consumed as u64;
            }
            Err(VfsError::NotFound) => break,
            Err(err) => panic!("directory read failed: {:?}", err),
        }
    }
    vfs.op_put(client, fd).unwrap();
    names
}

#[test]
fn s1_format_and_mount() {
    let (stack, client, rootfd, disk) = fat_root_stack("wtcache");

    // Root directory is readable and empty.
    assert!(list_dir(&stack.vfs, client, rootfd, "/").is_empty());

    // Stat shows a directory.
    let stat = stack.vfs.op_stat(client, rootfd).unwrap();
    assert_eq!(stat.node_type, NodeType::Directory);

    // The volume label sits in boot sector bytes 43..53.
    let image = disk.snapshot();
    assert_eq!(&image[43..54], b"TESTVOL    ");

    // The probe surface reports it too.
    let sid = stack.locator.resolve_name("ram0").unwrap();
    let probe = stack.vfs.op_fsprobe("fat", 0, sid).unwrap();
    assert_eq!(probe.label, "TESTVOL");
}

#[test]
fn s2_create_write_read() {
    let (stack, client, rootfd, _disk) = fat_root_stack("wtcache");
    let vfs = &stack.vfs;

    let fd = create_file(vfs, client, rootfd, "/hello.txt");
    write_all_at(vfs, client, fd, 0, b"hello world").unwrap();

    let stat = vfs.op_stat(client, fd).unwrap();
    assert_eq!(stat.size, 11);
    vfs.op_put(client, fd).unwrap();

    // Re-open and read back.
    let fd = vfs
        .op_walk(client, rootfd, "/hello.txt", LookupFlags::FILE)
        .unwrap();
    vfs.op_open(client, fd, OpenFlags::READ).unwrap();
    let mut buf = [0u8; 16];
    let n = read_full_at(vfs, client, fd, 0, &mut buf).unwrap();
    assert_eq!(n, 11);
    assert_eq!(&buf[..n], b"hello world");
    vfs.op_put(client, fd).unwrap();
}

#[test]
fn s3_sparse_write_zero_fills() {
    let (stack, client, rootfd, _disk) = fat_root_stack("wtcache");
    let vfs = &stack.vfs;

    let fd = create_file(vfs, client, rootfd, "/sparse.bin");
    let n = vfs.op_write(client, fd, Some(8192), b"x").unwrap();
    assert_eq!(n, 1);
    assert_eq!(vfs.op_stat(client, fd).unwrap().size, 8193);

    let mut gap = vec![0xFFu8; 8192];
    let read = read_full_at(vfs, client, fd, 0, &mut gap).unwrap();
    assert_eq!(read, 8192);
    assert!(gap.iter().all(|&b| b == 0));
    vfs.op_put(client, fd).unwrap();
}

#[test]
fn s4_rename_across_directories() {
    let (stack, client, rootfd, _disk) = fat_root_stack("wtcache");
    let vfs = &stack.vfs;

    mkdir(vfs, client, rootfd, "/a");
    mkdir(vfs, client, rootfd, "/b");
    let fd = create_file(vfs, client, rootfd, "/a/f");
    let index_before = vfs.op_stat(client, fd).unwrap().triplet.index;
    vfs.op_put(client, fd).unwrap();

    vfs.op_rename(client, rootfd, "/a/f", "/b/g").unwrap();

    assert!(matches!(
        vfs.op_walk(client, rootfd, "/a/f", LookupFlags::empty()),
        Err(VfsError::NotFound)
    ));

    let fd = vfs
        .op_walk(client, rootfd, "/b/g", LookupFlags::FILE)
        .unwrap();
    let index_after = vfs.op_stat(client, fd).unwrap().triplet.index;
    assert_eq!(index_after, index_before);
    vfs.op_put(client, fd).unwrap();
}

#[test]
fn rename_roundtrip_restores_pre_state() {
    let (stack, client, rootfd, _disk) = fat_root_stack("wtcache");
    let vfs = &stack.vfs;

    let fd = create_file(vfs, client, rootfd, "/orig");
    write_all_at(vfs, client, fd, 0, b"stable identity").unwrap();
    let index = vfs.op_stat(client, fd).unwrap().triplet.index;
    vfs.op_put(client, fd).unwrap();

    vfs.op_rename(client, rootfd, "/orig", "/moved").unwrap();
    vfs.op_rename(client, rootfd, "/moved", "/orig").unwrap();

    let fd = vfs
        .op_walk(client, rootfd, "/orig", LookupFlags::FILE)
        .unwrap();
    vfs.op_open(client, fd, OpenFlags::READ).unwrap();
    assert_eq!(vfs.op_stat(client, fd).unwrap().triplet.index, index);
    let mut buf = [0u8; 15];
    read_full_at(vfs, client, fd, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"stable identity");
    vfs.op_put(client, fd).unwrap();
}

#[test]
fn rename_rejects_prefix_paths() {
    let (stack, client, rootfd, _disk) = fat_root_stack("wtcache");
    let vfs = &stack.vfs;

    mkdir(vfs, client, rootfd, "/a");
    assert!(matches!(
        vfs.op_rename(client, rootfd, "/a", "/a/b"),
        Err(VfsError::InvalidArgument)
    ));
    assert!(matches!(
        vfs.op_rename(client, rootfd, "/a/b", "/a"),
        Err(VfsError::InvalidArgument)
    ));
}

#[test]
fn s5_long_filename_listing() {
    let (stack, client, rootfd, _disk) = fat_root_stack("wtcache");
    let vfs = &stack.vfs;

    let name = "A Very Long Filename Containing Spaces.txt";
    let fd = create_file(vfs, client, rootfd, "/A Very Long Filename Containing Spaces.txt");
    vfs.op_put(client, fd).unwrap();

    assert_eq!(list_dir(vfs, client, rootfd, "/"), vec![name.to_string()]);
}

#[test]
fn s6_unmount_busy_until_files_closed() {
    let (stack, client, rootfd) = tmpfs_root_stack();
    let vfs = &stack.vfs;

    let disk = fat_disk(20480, FatType::Fat16, "DATA");
    let sid: ServiceId = stack.locator.register("ram0", disk).unwrap();

    mkdir(vfs, client, rootfd, "/mnt");
    let mpfd = vfs
        .op_walk(client, rootfd, "/mnt", LookupFlags::DIRECTORY)
        .unwrap();

    let mounted_rootfd = vfs
        .op_mount(client, mpfd, "fat", 0, sid, "wtcache")
        .unwrap();
    vfs.op_put(client, mounted_rootfd).unwrap();

    // A path below the mount point is served by the FAT server.
    let fd = create_file(vfs, client, rootfd, "/mnt/hello");
    write_all_at(vfs, client, fd, 0, b"over the mount").unwrap();

    assert!(matches!(
        vfs.op_unmount(client, mpfd),
        Err(VfsError::Busy)
    ));

    vfs.op_put(client, fd).unwrap();
    vfs.op_unmount(client, mpfd).unwrap();

    // After unmount the mount point is an empty directory again.
    assert!(list_dir(vfs, client, rootfd, "/mnt").is_empty());

    // Mounting again brings the contents back.
    let mounted_rootfd = vfs
        .op_mount(client, mpfd, "fat", 0, sid, "wtcache")
        .unwrap();
    vfs.op_put(client, mounted_rootfd).unwrap();
    assert_eq!(list_dir(vfs, client, rootfd, "/mnt"), vec!["hello"]);
    let fd = vfs
        .op_walk(client, rootfd, "/mnt/hello", LookupFlags::FILE)
        .unwrap();
    vfs.op_open(client, fd, OpenFlags::READ).unwrap();
    let mut buf = [0u8; 14];
    read_full_at(vfs, client, fd, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"over the mount");
    vfs.op_put(client, fd).unwrap();
}

#[test]
fn mount_requires_empty_directory() {
    let (stack, client, rootfd) = tmpfs_root_stack();
    let vfs = &stack.vfs;

    let disk = fat_disk(20480, FatType::Fat16, "DATA");
    let sid = stack.locator.register("ram0", disk).unwrap();

    mkdir(vfs, client, rootfd, "/mnt");
    let fd = create_file(vfs, client, rootfd, "/mnt/occupied");
    vfs.op_put(client, fd).unwrap();

    let mpfd = vfs
        .op_walk(client, rootfd, "/mnt", LookupFlags::DIRECTORY)
        .unwrap();
    assert!(matches!(
        vfs.op_mount(client, mpfd, "fat", 0, sid, ""),
        Err(VfsError::NotEmpty)
    ));
}

#[test]
fn open_close_is_a_node_noop() {
    let (stack, client, rootfd, _disk) = fat_root_stack("wtcache");
    let vfs = &stack.vfs;

    let fd = create_file(vfs, client, rootfd, "/probe");
    write_all_at(vfs, client, fd, 0, b"contents").unwrap();
    let before = vfs.op_stat(client, fd).unwrap();
    vfs.op_put(client, fd).unwrap();

    let fd = vfs
        .op_walk(client, rootfd, "/probe", LookupFlags::FILE)
        .unwrap();
    vfs.op_open(client, fd, OpenFlags::READ).unwrap();
    let after = vfs.op_stat(client, fd).unwrap();
    vfs.op_put(client, fd).unwrap();

    assert_eq!(before.triplet, after.triplet);
    assert_eq!(before.size, after.size);
    assert_eq!(before.lnkcnt, after.lnkcnt);
}

#[test]
fn unlink_destroys_after_last_close() {
    let (stack, client, rootfd, _disk) = fat_root_stack("wtcache");
    let vfs = &stack.vfs;

    let fd = create_file(vfs, client, rootfd, "/doomed");
    write_all_at(vfs, client, fd, 0, b"short lived").unwrap();

    let free_before = vfs.op_statfs(client, rootfd).unwrap().free_blocks;

    vfs.op_unlink(client, rootfd, None, "/doomed").unwrap();
    assert!(matches!(
        vfs.op_walk(client, rootfd, "/doomed", LookupFlags::empty()),
        Err(VfsError::NotFound)
    ));

    // The open handle still reads the unlinked file.
    let mut buf = [0u8; 11];
    read_full_at(vfs, client, fd, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"short lived");

    // The last close releases the clusters.
    vfs.op_put(client, fd).unwrap();
    let free_after = vfs.op_statfs(client, rootfd).unwrap().free_blocks;
    assert!(free_after > free_before);
}

#[test]
fn resize_truncates_and_refuses_directories() {
    let (stack, client, rootfd, _disk) = fat_root_stack("wtcache");
    let vfs = &stack.vfs;

    let fd = create_file(vfs, client, rootfd, "/trim");
    write_all_at(vfs, client, fd, 0, &vec![9u8; 5000]).unwrap();
    vfs.op_resize(client, fd, 100).unwrap();
    assert_eq!(vfs.op_stat(client, fd).unwrap().size, 100);
    vfs.op_put(client, fd).unwrap();

    assert!(matches!(
        vfs.op_resize(client, rootfd, 0),
        Err(VfsError::InvalidArgument)
    ));
}

#[test]
fn clone_and_handle_passing() {
    let (stack, client, rootfd, _disk) = fat_root_stack("wtcache");
    let vfs = &stack.vfs;

    let fd = create_file(vfs, client, rootfd, "/shared");
    write_all_at(vfs, client, fd, 0, b"one file, two handles").unwrap();

    // A clone shares the node but starts with a closed access mode.
    let dup = vfs.op_clone(client, fd, None, true).unwrap();
    assert!(dup > fd);
    vfs.op_open(client, dup, OpenFlags::READ).unwrap();

    // Pass the duplicate to a second client.
    let other = vfs.client_attach();
    vfs.pass_handle(client, dup, other).unwrap();
    let theirs = vfs.wait_handle(other, false).unwrap();

    let mut buf = [0u8; 21];
    read_full_at(vfs, other, theirs, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"one file, two handles");

    vfs.op_put(client, fd).unwrap();
    vfs.op_put(client, dup).unwrap();
    stack.vfs.client_detach(other);
}

#[test]
fn fstypes_lists_registered_servers() {
    let stack = Stack::new().unwrap();
    let types = stack.vfs.fstypes();
    assert!(types.iter().any(|t| t == "tmpfs"));
    assert!(types.iter().any(|t| t == "fat"));
}

/// The same client sequence must behave identically on both servers.
fn exercise_server(vfs: &Vfs, client: ClientId, rootfd: usize) {
    mkdir(vfs, client, rootfd, "/docs");
    let fd = create_file(vfs, client, rootfd, "/docs/report.txt");
    write_all_at(vfs, client, fd, 0, b"quarterly numbers").unwrap();

    let mut buf = [0u8; 17];
    read_full_at(vfs, client, fd, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"quarterly numbers");
    vfs.op_put(client, fd).unwrap();

    assert_eq!(
        list_dir(vfs, client, rootfd, "/docs"),
        vec!["report.txt".to_string()]
    );
}

#[test]
fn tmpfs_write_read_parity_with_fat() {
    let (stack, client, rootfd) = tmpfs_root_stack();
    exercise_server(&stack.vfs, client, rootfd);

    let (stack, client, rootfd, _disk) = fat_root_stack("");
    exercise_server(&stack.vfs, client, rootfd);
}

#[test]
fn vbd_partition_hosts_a_filesystem() {
    // Partition a raw disk through the VBD, then format and mount the
    // published partition.
    let stack = Stack::new().unwrap();
    let disk = Arc::new(RamDisk::new(512, 24576));
    stack.locator.register("disk0", disk).unwrap();

    let sid = stack.locator.resolve_name("disk0").unwrap();
    stack.vbd.disk_add("disk0").unwrap();
    stack.vbd.label_create(sid).unwrap();
    stack
        .vbd
        .part_create(
            sid,
            &strata::vbd::PartSpec {
                index: 1,
                ptype: strata::vbd::label::PTYPE_FAT16,
                block0: 64,
                nblocks: 20480,
            },
        )
        .unwrap();

    let part_sid = stack.locator.resolve_name("disk0p1").unwrap();
    let part_dev = stack.locator.resolve(part_sid).unwrap();

    let mut cfg = FatCfg {
        total_sectors: 20480,
        fat_type: Some(FatType::Fat16),
        label: Some(fmt::label_encode("ONPART").unwrap()),
        serial: 0x0BADCAFE,
        ..FatCfg::default()
    };
    fmt::mkfat(part_dev.as_ref(), &mut cfg).unwrap();

    stack.vfs.mount_root("fat", 0, part_sid, "wtcache").unwrap();
    let client = stack.vfs.client_attach();
    let rootfd = stack.vfs.op_root(client).unwrap();

    let fd = create_file(&stack.vfs, client, rootfd, "/on-partition");
    write_all_at(&stack.vfs, client, fd, 0, b"behind the proxy").unwrap();
    let mut buf = [0u8; 16];
    read_full_at(&stack.vfs, client, fd, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"behind the proxy");
}
