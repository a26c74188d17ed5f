//! Partition label parsing and editing
//!
//! Works on the raw first sector of a disk. MBR labels are parsed and
//! edited in place; GPT is recognized by its protective MBR entry but
//! not edited. A boot sector that carries the signature without a
//! partition table (a raw filesystem) is classified as unlabelled.

use alloc::vec::Vec;

use strata_driver_traits::{DriverError, DriverResult};

/// Offset of the MBR partition entry array
const MBR_TABLE_OFFSET: usize = 446;
/// Bytes per MBR partition entry
const MBR_ENTRY_SIZE: usize = 16;
/// Number of primary partition slots
pub const MBR_PRIMARY_ENTRIES: u32 = 4;

/// MBR partition type bytes
pub const PTYPE_EMPTY: u8 = 0x00;
pub const PTYPE_FAT12: u8 = 0x01;
pub const PTYPE_FAT16_SMALL: u8 = 0x04;
pub const PTYPE_EXTENDED_CHS: u8 = 0x05;
pub const PTYPE_FAT16: u8 = 0x06;
pub const PTYPE_FAT32: u8 = 0x0B;
pub const PTYPE_FAT32_LBA: u8 = 0x0C;
pub const PTYPE_FAT16_LBA: u8 = 0x0E;
pub const PTYPE_EXTENDED_LBA: u8 = 0x0F;
pub const PTYPE_GPT_PROTECTIVE: u8 = 0xEE;

/// Label flavour found on a disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelType {
    /// No label (or a raw filesystem without a partition table)
    None,
    Mbr,
    Gpt,
}

/// Partition kind within a label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Primary,
    Extended,
}

/// Filesystem content a new partition is meant for, used when
/// suggesting a partition type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartContent {
    Fat12,
    Fat16,
    Fat32,
}

/// One partition as recorded in the label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelPart {
    /// Partition index within the label, starting at 1
    pub index: u32,
    pub block0: u64,
    pub nblocks: u64,
    pub kind: PartKind,
    pub ptype: u8,
    pub bootable: bool,
}

/// Parsed label.
#[derive(Debug, Clone)]
pub struct Label {
    pub ltype: LabelType,
    pub parts: Vec<LabelPart>,
}

fn entry(sector: &[u8], slot: u32) -> &[u8] {
    let off = MBR_TABLE_OFFSET + slot as usize * MBR_ENTRY_SIZE;
    &sector[off..off + MBR_ENTRY_SIZE]
}

fn entry_mut(sector: &mut [u8], slot: u32) -> &mut [u8] {
    let off = MBR_TABLE_OFFSET + slot as usize * MBR_ENTRY_SIZE;
    &mut sector[off..off + MBR_ENTRY_SIZE]
}

fn has_signature(sector: &[u8]) -> bool {
    sector[510] == 0x55 && sector[511] == 0xAA
}

/// Parse the first sector of a disk.
pub fn parse(sector: &[u8]) -> Label {
    if sector.len() < 512 || !has_signature(sector) {
        return Label {
            ltype: LabelType::None,
            parts: Vec::new(),
        };
    }

    // A protective MBR entry means the real label is a GPT.
    if entry(sector, 0)[4] == PTYPE_GPT_PROTECTIVE {
        return Label {
            ltype: LabelType::Gpt,
            parts: Vec::new(),
        };
    }

    let mut parts = Vec::new();
    for slot in 0..MBR_PRIMARY_ENTRIES {
        let e = entry(sector, slot);
        let ptype = e[4];
        let block0 = u32::from_le_bytes([e[8], e[9], e[10], e[11]]) as u64;
        let nblocks = u32::from_le_bytes([e[12], e[13], e[14], e[15]]) as u64;

        if ptype != PTYPE_EMPTY && nblocks > 0 {
            let kind = if ptype == PTYPE_EXTENDED_CHS || ptype == PTYPE_EXTENDED_LBA {
                PartKind::Extended
            } else {
                PartKind::Primary
            };
            parts.push(LabelPart {
                index: slot + 1,
                block0,
                nblocks,
                kind,
                ptype,
                bootable: e[0] == 0x80,
            });
        }
    }

    if parts.is_empty() {
        // The signature may belong to a volume boot record: a raw
        // filesystem without any partition table.
        let fat16_sig = &sector[54..62];
        let fat32_sig = &sector[82..90];
        if fat32_sig == b"FAT32   " || fat16_sig.starts_with(b"FAT") {
            return Label {
                ltype: LabelType::None,
                parts: Vec::new(),
            };
        }
    }

    Label {
        ltype: LabelType::Mbr,
        parts,
    }
}

/// Write an empty MBR label into the sector.
pub fn create(sector: &mut [u8]) {
    sector[MBR_TABLE_OFFSET..510].fill(0);
    sector[510] = 0x55;
    sector[511] = 0xAA;
}

/// Remove the label from the sector.
pub fn destroy(sector: &mut [u8]) {
    sector.fill(0);
}

/// Record a new partition in the label.
pub fn part_create(
    sector: &mut [u8],
    index: u32,
    ptype: u8,
    block0: u64,
    nblocks: u64,
) -> DriverResult<()> {
    if index == 0 || index > MBR_PRIMARY_ENTRIES || ptype == PTYPE_EMPTY {
        return Err(DriverError::InvalidParameter);
    }
    if block0 > u32::MAX as u64 || nblocks > u32::MAX as u64 {
        return Err(DriverError::OutOfRange);
    }
    if !has_signature(sector) {
        return Err(DriverError::InvalidParameter);
    }

    let e = entry_mut(sector, index - 1);
    if e[4] != PTYPE_EMPTY {
        return Err(DriverError::AlreadyExists);
    }

    e.fill(0);
    e[4] = ptype;
    e[8..12].copy_from_slice(&(block0 as u32).to_le_bytes());
    e[12..16].copy_from_slice(&(nblocks as u32).to_le_bytes());
    Ok(())
}

/// Delete a partition from the label.
pub fn part_destroy(sector: &mut [u8], index: u32) -> DriverResult<()> {
    if index == 0 || index > MBR_PRIMARY_ENTRIES {
        return Err(DriverError::InvalidParameter);
    }
    let e = entry_mut(sector, index - 1);
    if e[4] == PTYPE_EMPTY {
        return Err(DriverError::DeviceNotFound);
    }
    e.fill(0);
    Ok(())
}

/// Suggest an MBR type byte for the given content.
pub fn suggest_ptype(content: PartContent) -> u8 {
    match content {
        PartContent::Fat12 => PTYPE_FAT12,
        PartContent::Fat16 => PTYPE_FAT16,
        PartContent::Fat32 => PTYPE_FAT32,
    }
}
