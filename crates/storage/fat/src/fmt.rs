//! FAT filesystem creation
//!
//! Computes the on-disk parameters for a new volume, constructs its boot
//! sector and writes the empty filesystem structures straight to a block
//! device. The FAT variant is picked automatically from the resulting
//! cluster count unless the caller pins it.

use alloc::vec;

use strata_driver_traits::BlockDevice;
use strata_vfs::{VfsError, VfsResult};

use crate::bpb::{FatType, DENTRY_SIZE, FAT12_CLST_MAX, FAT16_CLST_MAX};
use crate::dentry::{FAT_ATTR_VOLLABEL, FAT_PAD, FAT_VOLLABEL_LEN};

/// Default filesystem parameters
const DEFAULT_SECTOR_SIZE: usize = 512;
const DEFAULT_SECTORS_PER_CLUSTER: u8 = 4;
const DEFAULT_FAT_COUNT: u8 = 2;
/// Fixed disk
const DEFAULT_MEDIA_DESCRIPTOR: u8 = 0xF8;
const FAT32_ROOT_CLUSTER: u32 = 2;

const LABEL_NONAME: &[u8; 11] = b"NO NAME    ";

fn div_round_up(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

/// Twice the FAT entry size in bytes, to keep the FAT12 entry-and-a-half
/// exact.
fn fat_cluster_double_size(fat_type: FatType) -> u32 {
    match fat_type {
        FatType::Fat12 => 3,
        FatType::Fat16 => 4,
        FatType::Fat32 => 8,
    }
}

/// Configurable and derived filesystem parameters.
#[derive(Debug, Clone, Copy)]
pub struct FatCfg {
    pub sector_size: usize,
    pub sectors_per_cluster: u8,
    pub fat_count: u8,
    pub total_sectors: u32,
    pub addt_res_sectors: u32,
    pub root_ent_max: u16,
    /// Pinned FAT variant; auto-selected when absent
    pub fat_type: Option<FatType>,
    /// Pre-encoded volume label
    pub label: Option<[u8; FAT_VOLLABEL_LEN]>,
    pub serial: u32,

    // Derived by `params_compute`
    pub reserved_sectors: u16,
    pub rootdir_sectors: u32,
    pub fat_sectors: u32,
    pub total_clusters: u32,
}

impl Default for FatCfg {
    fn default() -> Self {
        FatCfg {
            sector_size: DEFAULT_SECTOR_SIZE,
            sectors_per_cluster: DEFAULT_SECTORS_PER_CLUSTER,
            fat_count: DEFAULT_FAT_COUNT,
            total_sectors: 0,
            addt_res_sectors: 0,
            root_ent_max: 128,
            fat_type: None,
            label: None,
            serial: 0,
            reserved_sectors: 0,
            rootdir_sectors: 0,
            fat_sectors: 0,
            total_clusters: 0,
        }
    }
}

/// Encode a volume label: ASCII only, uppercased, space padded.
pub fn label_encode(label: &str) -> VfsResult<[u8; FAT_VOLLABEL_LEN]> {
    let mut out = [FAT_PAD; FAT_VOLLABEL_LEN];
    if label.len() > FAT_VOLLABEL_LEN {
        return Err(VfsError::InvalidArgument);
    }
    for (i, ch) in label.bytes().enumerate() {
        if !ch.is_ascii() {
            return Err(VfsError::InvalidArgument);
        }
        out[i] = ch.to_ascii_uppercase();
    }
    Ok(out)
}

/// Derive the sizes of the filesystem structures.
pub fn params_compute(cfg: &mut FatCfg) -> VfsResult<()> {
    if cfg.total_sectors == 0 || cfg.sector_size == 0 || cfg.sectors_per_cluster == 0 {
        return Err(VfsError::InvalidArgument);
    }

    cfg.reserved_sectors = 1 + cfg.addt_res_sectors as u16;

    // A conservative guess good enough to pick the FAT variant; only
    // correct for FAT12/16 where the root directory is a fixed area.
    let rd_sectors = div_round_up(
        cfg.root_ent_max as u32 * DENTRY_SIZE as u32,
        cfg.sector_size as u32,
    );
    let non_data_lb_16 = cfg.reserved_sectors as u32 + rd_sectors;
    if cfg.total_sectors <= non_data_lb_16 {
        return Err(VfsError::InvalidArgument);
    }
    let tot_clust_16 = div_round_up(
        cfg.total_sectors - non_data_lb_16,
        cfg.sectors_per_cluster as u32,
    );

    let fat_type = if tot_clust_16 <= FAT12_CLST_MAX {
        FatType::Fat12
    } else if tot_clust_16 <= FAT16_CLST_MAX {
        FatType::Fat16
    } else {
        FatType::Fat32
    };
    match cfg.fat_type {
        None => cfg.fat_type = Some(fat_type),
        Some(pinned) if pinned == fat_type => {}
        Some(_) => return Err(VfsError::InvalidArgument),
    }

    // Actual root directory size and non-data sectors.
    let non_data;
    if cfg.fat_type != Some(FatType::Fat32) {
        cfg.rootdir_sectors = div_round_up(
            cfg.root_ent_max as u32 * DENTRY_SIZE as u32,
            cfg.sector_size as u32,
        );
        non_data = cfg.reserved_sectors as u32 + cfg.rootdir_sectors;
    } else {
        // A single-cluster root directory in the data area.
        cfg.rootdir_sectors = cfg.sectors_per_cluster as u32;
        cfg.root_ent_max = 0;
        non_data = cfg.reserved_sectors as u32;
    }

    cfg.total_clusters = div_round_up(
        cfg.total_sectors - non_data,
        cfg.sectors_per_cluster as u32,
    );

    let dsize = match cfg.fat_type {
        Some(t) => fat_cluster_double_size(t),
        None => return Err(VfsError::InvalidArgument),
    };
    let fat_bytes = div_round_up((cfg.total_clusters + 2) * dsize, 2);
    cfg.fat_sectors = div_round_up(fat_bytes, cfg.sector_size as u32);

    Ok(())
}

/// Construct the boot sector.
pub fn bootsec_create(cfg: &FatCfg, sector: &mut [u8]) {
    sector.fill(0);

    // Jump instruction and OEM name
    sector[0] = 0xEB;
    sector[1] = 0x3C;
    sector[2] = 0x90;
    sector[3..11].copy_from_slice(b"STRATA  ");

    // BIOS Parameter Block
    sector[11..13].copy_from_slice(&(cfg.sector_size as u16).to_le_bytes());
    sector[13] = cfg.sectors_per_cluster;
    sector[14..16].copy_from_slice(&cfg.reserved_sectors.to_le_bytes());
    sector[16] = cfg.fat_count;
    sector[17..19].copy_from_slice(&cfg.root_ent_max.to_le_bytes());

    if cfg.total_sectors < 0x10000 {
        sector[19..21].copy_from_slice(&(cfg.total_sectors as u16).to_le_bytes());
    } else {
        sector[32..36].copy_from_slice(&cfg.total_sectors.to_le_bytes());
    }

    sector[21] = DEFAULT_MEDIA_DESCRIPTOR;
    sector[24..26].copy_from_slice(&63u16.to_le_bytes());
    sector[26..28].copy_from_slice(&6u16.to_le_bytes());
    sector[28..32].copy_from_slice(&0u32.to_le_bytes());

    let label = cfg.label.unwrap_or(*LABEL_NONAME);

    if cfg.fat_type == Some(FatType::Fat32) {
        sector[22..24].copy_from_slice(&0u16.to_le_bytes());
        sector[36..40].copy_from_slice(&cfg.fat_sectors.to_le_bytes());
        sector[44..48].copy_from_slice(&FAT32_ROOT_CLUSTER.to_le_bytes());
        sector[64] = 0x80; // physical drive number
        sector[66] = 0x29; // extended boot signature
        sector[67..71].copy_from_slice(&cfg.serial.to_le_bytes());
        sector[71..82].copy_from_slice(&label);
        sector[82..90].copy_from_slice(b"FAT32   ");
    } else {
        sector[22..24].copy_from_slice(&(cfg.fat_sectors as u16).to_le_bytes());
        sector[36] = 0x80;
        sector[38] = 0x29;
        sector[39..43].copy_from_slice(&cfg.serial.to_le_bytes());
        sector[43..54].copy_from_slice(&label);
        if cfg.fat_type == Some(FatType::Fat12) {
            sector[54..62].copy_from_slice(b"FAT12   ");
        } else {
            sector[54..62].copy_from_slice(b"FAT16   ");
        }
    }

    sector[510] = 0x55;
    sector[511] = 0xAA;
}

/// Write the filesystem structures to the device.
pub fn blocks_write(cfg: &FatCfg, dev: &dyn BlockDevice) -> VfsResult<()> {
    if dev.block_size() != cfg.sector_size {
        return Err(VfsError::NotSupported);
    }

    let mut sector = vec![0u8; cfg.sector_size];
    bootsec_create(cfg, &mut sector);
    dev.write_blocks(0, 1, &sector)
        .map_err(|_| VfsError::IoError)?;

    let mut addr: u64 = 1;

    // Remaining reserved sectors
    sector.fill(0);
    for _ in 1..cfg.reserved_sectors {
        dev.write_blocks(addr, 1, &sector)
            .map_err(|_| VfsError::IoError)?;
        addr += 1;
    }

    // File allocation tables
    for _ in 0..cfg.fat_count {
        for j in 0..cfg.fat_sectors {
            sector.fill(0);
            if j == 0 {
                sector[0] = DEFAULT_MEDIA_DESCRIPTOR;
                sector[1] = 0xFF;
                sector[2] = 0xFF;
                match cfg.fat_type {
                    Some(FatType::Fat16) => sector[3] = 0xFF,
                    Some(FatType::Fat32) => {
                        sector[3] = 0x0F;
                        sector[4..8].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0x0F]);
                        // The root directory chain ends in its first
                        // cluster.
                        sector[8..12].copy_from_slice(&[0xF8, 0xFF, 0xFF, 0x0F]);
                    }
                    _ => {}
                }
            }
            dev.write_blocks(addr, 1, &sector)
                .map_err(|_| VfsError::IoError)?;
            addr += 1;
        }
    }

    if cfg.fat_type == Some(FatType::Fat32) {
        // The root directory is an ordinary cluster chain.
        addr += (FAT32_ROOT_CLUSTER - 2) as u64 * cfg.sectors_per_cluster as u64;
    }

    // Root directory
    for idx in 0..cfg.rootdir_sectors {
        sector.fill(0);
        if idx == 0 {
            if let Some(label) = cfg.label {
                // Volume label entry
                sector[0..FAT_VOLLABEL_LEN].copy_from_slice(&label);
                sector[11] = FAT_ATTR_VOLLABEL;
            }
        }
        dev.write_blocks(addr, 1, &sector)
            .map_err(|_| VfsError::IoError)?;
        addr += 1;
    }

    Ok(())
}

/// Create a FAT filesystem on `dev` with the given parameters.
pub fn mkfat(dev: &dyn BlockDevice, cfg: &mut FatCfg) -> VfsResult<()> {
    if cfg.total_sectors == 0 || dev.num_blocks() < cfg.total_sectors as u64 {
        cfg.total_sectors = dev.num_blocks() as u32;
    }
    cfg.sector_size = dev.block_size();
    params_compute(cfg)?;
    blocks_write(cfg, dev)
}
