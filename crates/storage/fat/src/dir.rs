//! Directory traversal and mutation
//!
//! A `FatDirectory` iterates a directory entry by entry, keeping the
//! current block checked out of the cache. Long names are assembled from
//! fragment runs on reading and synthesized, together with a unique `~N`
//! short name, on writing.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use strata_block::BlockFlags;
use strata_vfs::{ServiceId, VfsError, VfsResult};

use crate::bpb::{BootSector, CLST_ROOT, DENTRY_SIZE};
use crate::dentry::{
    self, chksum, classify, Dentry, DentryClass, FAT_DENTRY_ERASED, FAT_EXT_LEN, FAT_LFN_ENTRY_SIZE,
    FAT_LFN_LAST, FAT_LFN_MAX_COUNT, FAT_LFN_NAME_LEN, FAT_MAX_SFN, FAT_NAME_LEN, FAT_PAD,
    FAT_SFN_CHAR,
};
use crate::node::FatNode;
use crate::table::berr;
use crate::FatFs;

pub(crate) struct FatDirectory<'a> {
    fat: &'a FatFs,
    bs: BootSector,
    sid: ServiceId,
    node: Arc<FatNode>,
    lfn_enabled: bool,
    /// Directory size in blocks
    blocks: u32,
    /// Current entry position
    pub(crate) pos: u32,
    /// Block number the checked-out block belongs to
    bnum: u32,
    b: Option<Arc<strata_block::Block>>,
}

impl<'a> FatDirectory<'a> {
    pub(crate) fn open(fat: &'a FatFs, node: Arc<FatNode>) -> VfsResult<Self> {
        let (sid, size, is_dir) = {
            let inner = node.inner.lock();
            let sid = inner
                .idx
                .as_ref()
                .map(|i| i.service_id)
                .ok_or(VfsError::InvalidArgument)?;
            (
                sid,
                inner.size,
                inner.node_type == strata_vfs::NodeType::Directory,
            )
        };
        if !is_dir {
            return Err(VfsError::NotADirectory);
        }

        let bs = fat.bs(sid)?;
        let lfn_enabled = fat.lfn_enabled(sid)?;
        let bps = bs.bps() as u64;
        Ok(FatDirectory {
            fat,
            bs,
            sid,
            node,
            lfn_enabled,
            blocks: ((size + bps - 1) / bps) as u32,
            pos: 0,
            bnum: 0,
            b: None,
        })
    }

    pub(crate) fn close(mut self) -> VfsResult<()> {
        if let Some(b) = self.b.take() {
            self.fat.pool.put(b).map_err(berr)?;
        }
        Ok(())
    }

    fn block_load(&mut self) -> VfsResult<()> {
        let i = (self.pos * DENTRY_SIZE as u32) / self.bs.bps();
        if i >= self.blocks {
            return Err(VfsError::NotFound);
        }

        if self.b.is_some() && self.bnum != i {
            if let Some(b) = self.b.take() {
                self.fat.pool.put(b).map_err(berr)?;
            }
        }
        if self.b.is_none() {
            let mut inner = self.node.inner.lock();
            let b = self.fat.fat_block_get_node(
                &self.bs,
                self.sid,
                &mut inner,
                i as u64,
                BlockFlags::empty(),
            )?;
            drop(inner);
            self.b = Some(b);
            self.bnum = i;
        }
        Ok(())
    }

    pub(crate) fn next(&mut self) -> VfsResult<()> {
        self.pos += 1;
        if let Err(err) = self.block_load() {
            self.pos -= 1;
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn prev(&mut self) -> VfsResult<()> {
        if self.pos == 0 {
            return Err(VfsError::NotFound);
        }
        self.pos -= 1;
        if let Err(err) = self.block_load() {
            self.pos += 1;
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn seek(&mut self, pos: u32) -> VfsResult<()> {
        let old = self.pos;
        self.pos = pos;
        if let Err(err) = self.block_load() {
            self.pos = old;
            return Err(err);
        }
        Ok(())
    }

    /// Raw 32-byte slot at the current position.
    pub(crate) fn get(&mut self) -> VfsResult<[u8; DENTRY_SIZE]> {
        self.block_load()?;
        let b = self.b.as_ref().ok_or(VfsError::NotFound)?;
        let data = b.data();
        let o = (self.pos % self.bs.dps()) as usize * DENTRY_SIZE;
        let mut raw = [0u8; DENTRY_SIZE];
        raw.copy_from_slice(&data[o..o + DENTRY_SIZE]);
        Ok(raw)
    }

    /// Overwrite the slot at the current position.
    pub(crate) fn set(&mut self, raw: &[u8; DENTRY_SIZE]) -> VfsResult<()> {
        self.block_load()?;
        let b = self.b.as_ref().ok_or(VfsError::NotFound)?;
        {
            let mut data = b.data_mut();
            let o = (self.pos % self.bs.dps()) as usize * DENTRY_SIZE;
            data[o..o + DENTRY_SIZE].copy_from_slice(raw);
        }
        b.mark_dirty();
        Ok(())
    }

    /// Read the next valid entry from the current position onwards,
    /// reconstructing its long name when one precedes it.
    pub(crate) fn read(&mut self) -> VfsResult<Option<(String, Dentry)>> {
        let mut wname = [0u16; FAT_LFN_NAME_LEN + 1];
        let mut lfn_offset = 0usize;
        let mut lfn_size = 0usize;
        let mut long_entry = false;
        let mut long_entry_count = 0u8;
        let mut checksum = 0u8;

        loop {
            let raw = match self.get() {
                Ok(raw) => raw,
                Err(VfsError::NotFound) => return Ok(None),
                Err(err) => return Err(err),
            };

            match classify(&raw) {
                DentryClass::Last => return Ok(None),
                DentryClass::Lfn => {
                    if long_entry {
                        long_entry_count -= 1;
                        if dentry::lfn_order(&raw) == long_entry_count
                            && checksum == dentry::lfn_chksum(&raw)
                        {
                            dentry::lfn_get_entry(&raw, &mut wname, &mut lfn_offset);
                        } else {
                            // Out of order; abandon this fragment group.
                            long_entry = false;
                            long_entry_count = 0;
                        }
                    } else if dentry::lfn_is_last(&raw) && self.lfn_enabled {
                        let count = dentry::lfn_count(&raw);
                        if count <= FAT_LFN_MAX_COUNT && count > 0 {
                            long_entry = true;
                            long_entry_count = count;
                            lfn_size = FAT_LFN_ENTRY_SIZE * (count as usize - 1)
                                + dentry::lfn_size(&raw);
                            lfn_offset = lfn_size;
                            dentry::lfn_get_entry(&raw, &mut wname, &mut lfn_offset);
                            checksum = dentry::lfn_chksum(&raw);
                        }
                    }
                }
                DentryClass::Valid => {
                    let d = Dentry::decode(&raw);
                    let name = if long_entry
                        && long_entry_count == 1
                        && checksum == chksum(&raw[0..11])
                    {
                        String::from_utf16(&wname[..lfn_size])
                            .unwrap_or_else(|_| d.name_str())
                    } else {
                        d.name_str()
                    };
                    return Ok(Some((name, d)));
                }
                DentryClass::Skip | DentryClass::Free => {
                    long_entry = false;
                    long_entry_count = 0;
                }
            }

            match self.next() {
                Ok(()) => {}
                Err(VfsError::NotFound) => return Ok(None),
                Err(err) => return Err(err),
            }
        }
    }

    /// Erase the entry at the current position together with its long
    /// name fragments.
    pub(crate) fn erase(&mut self) -> VfsResult<()> {
        let mut raw = self.get()?;
        let checksum = chksum(&raw[0..11]);

        raw[0] = FAT_DENTRY_ERASED;
        self.set(&raw)?;

        let mut done = false;
        while !done && self.prev().is_ok() {
            let raw = self.get()?;
            if classify(&raw) == DentryClass::Lfn && checksum == dentry::lfn_chksum(&raw) {
                if dentry::lfn_is_last(&raw) {
                    done = true;
                }
                let mut cleared = [0u8; DENTRY_SIZE];
                cleared[0] = FAT_DENTRY_ERASED;
                self.set(&cleared)?;
            } else {
                break;
            }
        }

        Ok(())
    }

    /// Write `name` and the prepared short entry at a run of free slots,
    /// creating long name fragments when the name does not fit 8.3.
    /// Leaves the position at the short entry.
    pub(crate) fn write_name(&mut self, name: &str, de: &mut Dentry) -> VfsResult<()> {
        if dentry::valid_short_name(name) {
            // The name fits the dentry directly; no long fragments.
            de.set_name(name);
            if self.is_sfn_exist(de)? {
                return Err(VfsError::AlreadyExists);
            }
            self.lookup_free(1)?;
            let mut raw = [0u8; DENTRY_SIZE];
            de.encode(&mut raw);
            self.set(&raw)?;
            return Ok(());
        }

        if !self.lfn_enabled || !dentry::valid_name(name) {
            return Err(VfsError::NotSupported);
        }

        let wname: Vec<u16> = name.encode_utf16().collect();
        if wname.len() > FAT_LFN_NAME_LEN {
            return Err(VfsError::NameTooLong);
        }

        let lfn_size = wname.len();
        let mut long_entry_count = lfn_size / FAT_LFN_ENTRY_SIZE;
        if lfn_size % FAT_LFN_ENTRY_SIZE != 0 {
            long_entry_count += 1;
        }
        self.lookup_free(long_entry_count + 1)?;
        let start_pos = self.pos;

        // Write the short entry last in the run.
        self.create_sfn(de, name)?;
        let checksum = {
            let mut short = [0u8; 11];
            short[..FAT_NAME_LEN].copy_from_slice(&de.name);
            short[FAT_NAME_LEN..].copy_from_slice(&de.ext);
            chksum(&short)
        };

        self.seek(start_pos + long_entry_count as u32)?;
        let mut raw = [0u8; DENTRY_SIZE];
        de.encode(&mut raw);
        self.set(&raw)?;

        // Walk backwards writing the fragments with ascending order
        // numbers; the physically first one carries the LAST flag.
        let mut lfn_offset = 0usize;
        let mut order = 0u8;
        loop {
            self.prev()?;
            let mut raw = [0u8; DENTRY_SIZE];
            dentry::lfn_set_entry(&wname, &mut lfn_offset, &mut raw);
            order += 1;
            raw[0] = order;
            raw[13] = checksum;
            if lfn_offset >= lfn_size {
                raw[0] = order | FAT_LFN_LAST;
                self.set(&raw)?;
                break;
            }
            self.set(&raw)?;
        }

        self.seek(start_pos + long_entry_count as u32)?;
        Ok(())
    }

    /// Synthesize a unique `<prefix>~<N>[.<ext>]` short name for a long
    /// name, probing N upwards.
    pub(crate) fn create_sfn(&mut self, de: &mut Dentry, lname: &str) -> VfsResult<()> {
        let bytes = lname.as_bytes();
        let (base, ext) = match lname.rfind('.') {
            Some(dot) if dot > 0 => (&bytes[..dot], &bytes[dot + 1..]),
            _ => (bytes, &[][..]),
        };

        // Spaces are dropped from the synthesized name; any other
        // character the short form cannot hold becomes a placeholder.
        let mut name = [FAT_PAD; FAT_NAME_LEN];
        let mut base_len = 0;
        for &ch in base.iter() {
            if base_len == FAT_NAME_LEN {
                break;
            }
            if ch == b' ' {
                continue;
            }
            name[base_len] = if ch.is_ascii() {
                ch.to_ascii_uppercase()
            } else {
                FAT_SFN_CHAR
            };
            base_len += 1;
        }

        let mut ext_buf = [FAT_PAD; FAT_EXT_LEN];
        let mut ext_len = 0;
        for &ch in ext.iter() {
            if ext_len == FAT_EXT_LEN {
                break;
            }
            if ch == b' ' {
                continue;
            }
            ext_buf[ext_len] = if ch.is_ascii() {
                ch.to_ascii_uppercase()
            } else {
                FAT_SFN_CHAR
            };
            ext_len += 1;
        }

        for n in 1..=FAT_MAX_SFN {
            let mut number = [0u8; FAT_NAME_LEN];
            let mut digits = 0;
            let mut v = n;
            while v > 0 {
                number[digits] = b'0' + (v % 10) as u8;
                digits += 1;
                v /= 10;
            }
            number[..digits].reverse();

            de.name = [FAT_PAD; FAT_NAME_LEN];
            de.ext = ext_buf;

            let prefix = core::cmp::min(base_len, FAT_NAME_LEN - digits - 1);
            de.name[..prefix].copy_from_slice(&name[..prefix]);
            de.name[prefix] = b'~';
            de.name[prefix + 1..prefix + 1 + digits].copy_from_slice(&number[..digits]);

            if !self.is_sfn_exist(de)? {
                return Ok(());
            }
        }

        Err(VfsError::LimitExceeded)
    }

    /// Position the iterator at the start of a run of `count` free
    /// slots, growing the directory when none exists.
    pub(crate) fn lookup_free(&mut self, count: usize) -> VfsResult<()> {
        loop {
            let mut found = 0usize;
            let mut pos = 0u32;
            self.seek(0)?;
            loop {
                let raw = match self.get() {
                    Ok(raw) => raw,
                    Err(VfsError::NotFound) => break,
                    Err(err) => return Err(err),
                };
                match classify(&raw) {
                    DentryClass::Last | DentryClass::Free => {
                        if found == 0 {
                            pos = self.pos;
                        }
                        found += 1;
                        if found == count {
                            self.seek(pos)?;
                            return Ok(());
                        }
                    }
                    _ => found = 0,
                }
                if self.next().is_err() {
                    break;
                }
            }
            self.expand()?;
        }
    }

    /// Grow the directory by one zeroed cluster.
    fn expand(&mut self) -> VfsResult<()> {
        let firstc = self.node.inner.lock().firstc;
        if !self.bs.is_fat32() && firstc == CLST_ROOT {
            // The FAT12/16 root directory cannot grow.
            return Err(VfsError::NoSpace);
        }

        let (mcl, lcl) = crate::table::alloc_clusters(&self.fat.pool, &self.bs, self.sid, 1)?;
        if let Err(err) = crate::table::zero_cluster(&self.fat.pool, &self.bs, self.sid, mcl) {
            let _ = crate::table::free_clusters(&self.fat.pool, &self.bs, self.sid, mcl);
            return Err(err);
        }

        let mut inner = self.node.inner.lock();
        if let Err(err) = self.fat.append_clusters(&self.bs, self.sid, &mut inner, mcl, lcl) {
            drop(inner);
            let _ = crate::table::free_clusters(&self.fat.pool, &self.bs, self.sid, mcl);
            return Err(err);
        }
        inner.size += self.bs.bpc() as u64;
        inner.dirty = true;
        self.blocks = (inner.size / self.bs.bps() as u64) as u32;
        Ok(())
    }

    /// Find an entry by name.
    pub(crate) fn lookup_name(&mut self, name: &str) -> VfsResult<Option<(String, Dentry)>> {
        self.seek(0)?;
        while let Some((entry_name, d)) = self.read()? {
            if dentry::namecmp(&entry_name, name) {
                return Ok(Some((entry_name, d)));
            }
            if self.next().is_err() {
                break;
            }
        }
        Ok(None)
    }

    /// Whether a short entry with the same 8.3 name already exists.
    pub(crate) fn is_sfn_exist(&mut self, de: &Dentry) -> VfsResult<bool> {
        let pos = self.pos;
        self.seek(0)?;
        loop {
            let raw = match self.get() {
                Ok(raw) => raw,
                Err(VfsError::NotFound) => break,
                Err(err) => return Err(err),
            };
            match classify(&raw) {
                DentryClass::Last => break,
                DentryClass::Valid => {
                    if raw[0..FAT_NAME_LEN] == de.name && raw[8..8 + FAT_EXT_LEN] == de.ext {
                        let _ = self.seek(pos);
                        return Ok(true);
                    }
                }
                _ => {}
            }
            if self.next().is_err() {
                break;
            }
        }
        let _ = self.seek(pos);
        Ok(false)
    }

    /// Find the volume label entry.
    pub(crate) fn vollabel_get(&mut self) -> VfsResult<Option<String>> {
        self.seek(0)?;
        loop {
            let raw = match self.get() {
                Ok(raw) => raw,
                Err(VfsError::NotFound) => return Ok(None),
                Err(err) => return Err(err),
            };
            if raw[11] & dentry::FAT_ATTR_VOLLABEL != 0 && classify(&raw) == DentryClass::Skip {
                let d = Dentry::decode(&raw);
                return Ok(Some(d.vollabel_str()));
            }
            if classify(&raw) == DentryClass::Last {
                return Ok(None);
            }
            if self.next().is_err() {
                return Ok(None);
            }
        }
    }
}
