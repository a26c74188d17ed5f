//! mkfat - create a FAT12/16/32 filesystem on a device image
//!
//! The FAT variant is auto-selected from the computed cluster count
//! unless pinned with `--type`.

use std::fs;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use strata_driver_ram::RamDisk;
use strata_fat::bpb::FatType;
use strata_fat::fmt::{label_encode, mkfat, FatCfg};

const NAME: &str = "mkfat";

fn syntax_print() {
    eprintln!("syntax: mkfat [<options>...] <device-image>");
    eprintln!("options:");
    eprintln!("\t--size <sectors>  Filesystem size, overrides device size");
    eprintln!("\t--type 12|16|32   FAT type (auto-detected by default)");
    eprintln!("\t--label <label>   Volume label");
}

fn run() -> u8 {
    let mut args = std::env::args().skip(1);

    let mut total_sectors: u32 = 0;
    let mut fat_type: Option<FatType> = None;
    let mut label: Option<String> = None;
    let mut device: Option<String> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--size" => {
                let value = match args.next() {
                    Some(v) => v,
                    None => {
                        eprintln!("{}: Error, argument missing.", NAME);
                        syntax_print();
                        return 1;
                    }
                };
                total_sectors = match value.parse() {
                    Ok(n) => n,
                    Err(_) => {
                        eprintln!("{}: Error, invalid argument.", NAME);
                        syntax_print();
                        return 1;
                    }
                };
            }
            "--type" => {
                let value = match args.next() {
                    Some(v) => v,
                    None => {
                        eprintln!("{}: Error, argument missing.", NAME);
                        syntax_print();
                        return 1;
                    }
                };
                fat_type = match value.as_str() {
                    "12" => Some(FatType::Fat12),
                    "16" => Some(FatType::Fat16),
                    "32" => Some(FatType::Fat32),
                    _ => {
                        eprintln!("{}: Error. Unknown FAT type.", NAME);
                        syntax_print();
                        return 1;
                    }
                };
            }
            "--label" => {
                label = match args.next() {
                    Some(v) => Some(v),
                    None => {
                        eprintln!("{}: Error, argument missing.", NAME);
                        syntax_print();
                        return 1;
                    }
                };
            }
            _ if device.is_none() => device = Some(arg),
            _ => {
                eprintln!("{}: Error, unexpected argument.", NAME);
                syntax_print();
                return 1;
            }
        }
    }

    let device = match device {
        Some(d) => d,
        None => {
            eprintln!("{}: Error, argument missing.", NAME);
            syntax_print();
            return 1;
        }
    };

    let encoded_label = match label.as_deref().map(label_encode) {
        Some(Ok(l)) => Some(l),
        Some(Err(_)) => {
            eprintln!("{}: Invalid volume label.", NAME);
            return 1;
        }
        None => None,
    };

    // Load or create the image.
    let image = match fs::read(&device) {
        Ok(image) if !image.is_empty() => image,
        _ => {
            if total_sectors == 0 {
                eprintln!("{}: Error. You must specify filesystem size.", NAME);
                return 1;
            }
            vec![0u8; total_sectors as usize * 512]
        }
    };

    let disk = match RamDisk::from_image(512, image) {
        Ok(disk) => disk,
        Err(_) => {
            eprintln!("{}: Error, image size is not sector aligned.", NAME);
            return 2;
        }
    };

    println!("Device: {}", device);
    println!("{}: Block device has {} blocks.", NAME, disk_blocks(&disk));
    println!("{}: Creating FAT filesystem on device {}.", NAME, device);

    let serial = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ d.as_secs() as u32)
        .unwrap_or(0);

    let mut cfg = FatCfg {
        total_sectors,
        fat_type,
        label: encoded_label,
        serial,
        ..FatCfg::default()
    };

    if let Err(err) = mkfat(&disk, &mut cfg) {
        eprintln!("{}: Error writing device: {:?}.", NAME, err);
        return 2;
    }

    match cfg.fat_type {
        Some(FatType::Fat12) => println!("{}: Filesystem type FAT12.", NAME),
        Some(FatType::Fat16) => println!("{}: Filesystem type FAT16.", NAME),
        Some(FatType::Fat32) => println!("{}: Filesystem type FAT32.", NAME),
        None => {}
    }

    if fs::write(&device, disk.snapshot()).is_err() {
        eprintln!("{}: Error writing device.", NAME);
        return 2;
    }

    println!("Success.");
    0
}

fn disk_blocks(disk: &RamDisk) -> u64 {
    use strata_driver_traits::BlockDevice;
    disk.num_blocks()
}

fn main() -> ExitCode {
    ExitCode::from(run())
}
