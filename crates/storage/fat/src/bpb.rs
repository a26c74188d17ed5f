//! Boot sector parsing and derived volume geometry

use strata_vfs::{VfsError, VfsResult};

/// Boot sector block address and size
pub const BS_BLOCK: u64 = 0;
pub const BS_SIZE: usize = 512;

/// FAT variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

/// Cluster number constants
pub const CLST_RES0: u32 = 0;
pub const CLST_RES1: u32 = 1;
pub const CLST_FIRST: u32 = 2;

/// Internally used to mark the root directory (FAT12/16)
pub const CLST_ROOT: u32 = CLST_RES1;
/// Internally used to mark the root directory's parent
pub const CLST_ROOTPAR: u32 = CLST_RES0;

pub const FAT12_MASK: u32 = 0x0FFF;
pub const FAT16_MASK: u32 = 0xFFFF;
pub const FAT32_MASK: u32 = 0x0FFFFFFF;

pub const FAT12_CLST_MAX: u32 = 4085;
pub const FAT16_CLST_MAX: u32 = 65525;

const FAT32_CLST_BAD: u32 = 0x0FFFFFF7;
const FAT32_CLST_LAST1: u32 = 0x0FFFFFF8;

/// Directory entry size in bytes
pub const DENTRY_SIZE: usize = 32;

/// Parsed boot sector.
///
/// The raw little-endian fields are decoded once at mount; the geometry
/// helpers below derive everything else from them.
#[derive(Debug, Clone, Copy)]
pub struct BootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sector_count: u16,
    pub fat_count: u8,
    pub root_entry_max: u16,
    pub total_sectors_16: u16,
    pub media_descriptor: u8,
    pub sectors_per_fat_16: u16,
    pub sectors_per_track: u16,
    pub head_count: u16,
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,
    /// FAT32 extension block
    pub sectors_per_fat_32: u32,
    pub fat_flags: u16,
    pub fs_version: u16,
    pub root_cluster: u32,
    pub fsinfo_sector: u16,
    pub backup_boot_sector: u16,
    /// Extended BPB, either variant
    pub serial: u32,
    pub label: [u8; 11],
    pub fs_type: [u8; 8],
}

impl BootSector {
    /// Parse a boot sector.
    pub fn parse(data: &[u8]) -> VfsResult<Self> {
        if data.len() < BS_SIZE {
            return Err(VfsError::InvalidArgument);
        }
        if data[510] != 0x55 || data[511] != 0xAA {
            return Err(VfsError::NotSupported);
        }

        let bytes_per_sector = u16::from_le_bytes([data[11], data[12]]);
        let sectors_per_cluster = data[13];
        let reserved_sector_count = u16::from_le_bytes([data[14], data[15]]);
        let fat_count = data[16];
        let root_entry_max = u16::from_le_bytes([data[17], data[18]]);
        let total_sectors_16 = u16::from_le_bytes([data[19], data[20]]);
        let media_descriptor = data[21];
        let sectors_per_fat_16 = u16::from_le_bytes([data[22], data[23]]);
        let sectors_per_track = u16::from_le_bytes([data[24], data[25]]);
        let head_count = u16::from_le_bytes([data[26], data[27]]);
        let hidden_sectors = u32::from_le_bytes([data[28], data[29], data[30], data[31]]);
        let total_sectors_32 = u32::from_le_bytes([data[32], data[33], data[34], data[35]]);

        if bytes_per_sector == 0 || sectors_per_cluster == 0 {
            return Err(VfsError::NotSupported);
        }

        // The extended BPB sits at different offsets for FAT12/16 and
        // FAT32; a zero 16-bit FAT size implies the FAT32 layout.
        let fat32 = sectors_per_fat_16 == 0;

        let (
            sectors_per_fat_32,
            fat_flags,
            fs_version,
            root_cluster,
            fsinfo_sector,
            backup_boot_sector,
            serial,
            label,
            fs_type,
        ) = if fat32 {
            let mut label = [0u8; 11];
            label.copy_from_slice(&data[71..82]);
            let mut fs_type = [0u8; 8];
            fs_type.copy_from_slice(&data[82..90]);
            (
                u32::from_le_bytes([data[36], data[37], data[38], data[39]]),
                u16::from_le_bytes([data[40], data[41]]),
                u16::from_le_bytes([data[42], data[43]]),
                u32::from_le_bytes([data[44], data[45], data[46], data[47]]),
                u16::from_le_bytes([data[48], data[49]]),
                u16::from_le_bytes([data[50], data[51]]),
                u32::from_le_bytes([data[67], data[68], data[69], data[70]]),
                label,
                fs_type,
            )
        } else {
            let mut label = [0u8; 11];
            label.copy_from_slice(&data[43..54]);
            let mut fs_type = [0u8; 8];
            fs_type.copy_from_slice(&data[54..62]);
            (
                0,
                0,
                0,
                0,
                0,
                0,
                u32::from_le_bytes([data[39], data[40], data[41], data[42]]),
                label,
                fs_type,
            )
        };

        Ok(BootSector {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sector_count,
            fat_count,
            root_entry_max,
            total_sectors_16,
            media_descriptor,
            sectors_per_fat_16,
            sectors_per_track,
            head_count,
            hidden_sectors,
            total_sectors_32,
            sectors_per_fat_32,
            fat_flags,
            fs_version,
            root_cluster,
            fsinfo_sector,
            backup_boot_sector,
            serial,
            label,
            fs_type,
        })
    }

    /// Bytes per sector
    pub fn bps(&self) -> u32 {
        self.bytes_per_sector as u32
    }

    /// Sectors per cluster
    pub fn spc(&self) -> u32 {
        self.sectors_per_cluster as u32
    }

    /// Bytes per cluster
    pub fn bpc(&self) -> u32 {
        self.bps() * self.spc()
    }

    /// Reserved sector count
    pub fn rscnt(&self) -> u32 {
        self.reserved_sector_count as u32
    }

    /// Number of FAT copies
    pub fn fatcnt(&self) -> u32 {
        self.fat_count as u32
    }

    /// Sectors per FAT
    pub fn sf(&self) -> u32 {
        if self.sectors_per_fat_16 != 0 {
            self.sectors_per_fat_16 as u32
        } else {
            self.sectors_per_fat_32
        }
    }

    /// Maximum number of root directory entries (FAT12/16)
    pub fn rde(&self) -> u32 {
        self.root_entry_max as u32
    }

    /// Total sector count
    pub fn ts(&self) -> u32 {
        if self.total_sectors_16 != 0 {
            self.total_sectors_16 as u32
        } else {
            self.total_sectors_32
        }
    }

    /// Root directory sectors (FAT12/16)
    pub fn rds(&self) -> u32 {
        let bytes = DENTRY_SIZE as u32 * self.rde();
        bytes / self.bps() + u32::from(bytes % self.bps() != 0)
    }

    /// First sector after the system area
    pub fn ssa(&self) -> u32 {
        self.rscnt() + self.fatcnt() * self.sf() + self.rds()
    }

    /// Data sectors
    pub fn ds(&self) -> u32 {
        self.ts().saturating_sub(self.ssa())
    }

    /// Cluster count
    pub fn cc(&self) -> u32 {
        self.ds() / self.spc()
    }

    /// Entries per sector
    pub fn dps(&self) -> u32 {
        self.bps() / DENTRY_SIZE as u32
    }

    /// FAT variant, decided by cluster count
    pub fn fat_type(&self) -> FatType {
        let cc = self.cc();
        if cc < FAT12_CLST_MAX {
            FatType::Fat12
        } else if cc < FAT16_CLST_MAX {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    pub fn is_fat32(&self) -> bool {
        self.fat_type() == FatType::Fat32
    }

    /// Cluster value mask for this variant
    pub fn mask(&self) -> u32 {
        match self.fat_type() {
            FatType::Fat12 => FAT12_MASK,
            FatType::Fat16 => FAT16_MASK,
            FatType::Fat32 => FAT32_MASK,
        }
    }

    /// Lowest end-of-chain marker
    pub fn clst_last1(&self) -> u32 {
        FAT32_CLST_LAST1 & self.mask()
    }

    /// Bad cluster marker
    pub fn clst_bad(&self) -> u32 {
        FAT32_CLST_BAD & self.mask()
    }

    /// First cluster of the root directory; the sentinel `CLST_ROOT` on
    /// FAT12/16 where the root lives outside the cluster area.
    pub fn root_clst(&self) -> u32 {
        if self.is_fat32() {
            self.root_cluster
        } else {
            CLST_ROOT
        }
    }

    /// Physical block of block `bn` within cluster `cl`.
    pub fn clbn2pbn(&self, cl: u32, bn: u64) -> u64 {
        self.ssa() as u64 + (cl - CLST_FIRST) as u64 * self.spc() as u64 + bn % self.spc() as u64
    }

    /// Volume label, trimmed.
    pub fn label_str(&self) -> &str {
        let end = self
            .label
            .iter()
            .rposition(|&c| c != b' ' && c != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        core::str::from_utf8(&self.label[..end]).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmt::{self, FatCfg};

    #[test]
    fn parse_rejects_missing_signature() {
        let data = [0u8; 512];
        assert!(matches!(
            BootSector::parse(&data),
            Err(VfsError::NotSupported)
        ));
    }

    #[test]
    fn parse_formatted_fat16() {
        let mut cfg = FatCfg {
            total_sectors: 20480,
            fat_type: Some(FatType::Fat16),
            label: Some(*b"TESTVOL    "),
            serial: 0xDEADBEEF,
            ..FatCfg::default()
        };
        fmt::params_compute(&mut cfg).unwrap();
        let mut sector = [0u8; 512];
        fmt::bootsec_create(&cfg, &mut sector);

        let bs = BootSector::parse(&sector).unwrap();
        assert_eq!(bs.bps(), 512);
        assert_eq!(bs.fatcnt(), 2);
        assert_eq!(bs.fat_type(), FatType::Fat16);
        assert_eq!(bs.label_str(), "TESTVOL");
        assert_eq!(bs.serial, 0xDEADBEEF);
        assert_eq!(bs.mask(), FAT16_MASK);
        assert_eq!(bs.clst_last1(), 0xFFF8);
        assert_eq!(bs.clst_bad(), 0xFFF7);
        assert_eq!(bs.root_clst(), CLST_ROOT);
    }

    #[test]
    fn geometry_is_consistent() {
        let mut cfg = FatCfg {
            total_sectors: 8192,
            ..FatCfg::default()
        };
        fmt::params_compute(&mut cfg).unwrap();
        let mut sector = [0u8; 512];
        fmt::bootsec_create(&cfg, &mut sector);

        let bs = BootSector::parse(&sector).unwrap();
        assert_eq!(bs.ssa(), bs.rscnt() + bs.fatcnt() * bs.sf() + bs.rds());
        assert!(bs.cc() > 0);
        // The first data cluster begins right after the system area.
        assert_eq!(bs.clbn2pbn(CLST_FIRST, 0), bs.ssa() as u64);
    }
}
