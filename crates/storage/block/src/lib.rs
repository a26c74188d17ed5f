//! Block device client library with a per-device buffer cache.
//!
//! Filesystem servers access their backing devices through a `BlockPool`:
//! one pool per server, one connection per device. A connection owns a
//! staging buffer (the communication area) that serialises raw transfers,
//! an optional boot-block copy, and an optional cache of fixed-size
//! logical blocks with write-back or write-through semantics.
//!
//! Interface:
//! * `init`/`fini` open and close a device connection.
//! * `cache_init`/`cache_fini` attach a block cache to a connection.
//! * `get`/`put` check cached blocks out and back in.
//! * `read_direct`/`write_direct` bypass the cache.
//! * `seqread` streams sequential data through the staging buffer.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use strata_driver_traits::{BlockDevice, DriverError, ServiceId};

mod cache;

pub use cache::{Block, BlockFlags, CacheMode, CacheParams};
pub(crate) use cache::Cache;

/// Block layer error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// No connection for the given service id
    NotFound,
    /// Connection or cache already exists
    AlreadyExists,
    /// Cache cannot grow and has nothing to recycle
    OutOfMemory,
    /// Unsupported geometry or operation
    NotSupported,
    /// Device transfer failed
    IoError,
    /// Retry budget exhausted while the cache was contended
    Busy,
    /// Address or transfer size out of range
    LimitExceeded,
    /// Invalid argument
    InvalidArgument,
}

pub type BlockResult<T> = Result<T, BlockError>;

impl From<DriverError> for BlockError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::DeviceNotFound => BlockError::NotFound,
            DriverError::OutOfRange => BlockError::LimitExceeded,
            DriverError::OutOfMemory => BlockError::OutOfMemory,
            DriverError::NotSupported => BlockError::NotSupported,
            DriverError::InvalidParameter => BlockError::InvalidArgument,
            DriverError::Busy => BlockError::Busy,
            _ => BlockError::IoError,
        }
    }
}

/// Staging buffer serialising raw transfers on one connection.
struct CommArea {
    buf: Vec<u8>,
}

/// One device connection.
pub(crate) struct DevCon {
    service_id: ServiceId,
    dev: Arc<dyn BlockDevice>,
    comm: Mutex<CommArea>,
    comm_size: usize,
    pblock_size: usize,
    bb: Mutex<Option<BootBlock>>,
    pub(crate) cache: Mutex<Option<Cache>>,
}

struct BootBlock {
    data: Vec<u8>,
    #[allow(dead_code)]
    addr: u64,
}

impl DevCon {
    /// Read `cnt` physical blocks through the communication area.
    pub(crate) fn read_blocks(&self, ba: u64, cnt: usize, dst: &mut [u8]) -> BlockResult<()> {
        let len = cnt * self.pblock_size;
        if len > self.comm_size || dst.len() < len {
            return Err(BlockError::LimitExceeded);
        }
        let mut comm = self.comm.lock();
        self.dev.read_blocks(ba, cnt, &mut comm.buf[..len])?;
        dst[..len].copy_from_slice(&comm.buf[..len]);
        Ok(())
    }

    /// Write `cnt` physical blocks through the communication area.
    pub(crate) fn write_blocks(&self, ba: u64, cnt: usize, src: &[u8]) -> BlockResult<()> {
        let len = cnt * self.pblock_size;
        if len > self.comm_size || src.len() < len {
            return Err(BlockError::LimitExceeded);
        }
        let mut comm = self.comm.lock();
        comm.buf[..len].copy_from_slice(&src[..len]);
        self.dev.write_blocks(ba, cnt, &comm.buf[..len])?;
        Ok(())
    }
}

/// A set of device connections, one per backing device.
pub struct BlockPool {
    devices: Mutex<Vec<Arc<DevCon>>>,
}

impl BlockPool {
    pub const fn new() -> Self {
        BlockPool {
            devices: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn devcon(&self, service_id: ServiceId) -> BlockResult<Arc<DevCon>> {
        let devices = self.devices.lock();
        devices
            .iter()
            .find(|d| d.service_id == service_id)
            .cloned()
            .ok_or(BlockError::NotFound)
    }

    /// Open a connection to `dev` under `service_id`.
    ///
    /// `comm_size` bounds a single raw transfer and must hold at least one
    /// physical block.
    pub fn init(
        &self,
        service_id: ServiceId,
        dev: Arc<dyn BlockDevice>,
        comm_size: usize,
    ) -> BlockResult<()> {
        let pblock_size = dev.block_size();
        if comm_size < pblock_size {
            return Err(BlockError::InvalidArgument);
        }

        dev.open()?;

        let devcon = Arc::new(DevCon {
            service_id,
            dev,
            comm: Mutex::new(CommArea {
                buf: vec![0u8; comm_size],
            }),
            comm_size,
            pblock_size,
            bb: Mutex::new(None),
            cache: Mutex::new(None),
        });

        let mut devices = self.devices.lock();
        if devices.iter().any(|d| d.service_id == service_id) {
            devcon.dev.close()?;
            return Err(BlockError::AlreadyExists);
        }
        devices.push(devcon);
        Ok(())
    }

    /// Close the connection for `service_id`, tearing down its cache first.
    pub fn fini(&self, service_id: ServiceId) -> BlockResult<()> {
        let devcon = self.devcon(service_id)?;

        if devcon.cache.lock().is_some() {
            self.cache_fini(service_id)?;
        }

        let mut devices = self.devices.lock();
        devices.retain(|d| d.service_id != service_id);
        drop(devices);

        devcon.dev.close()?;
        Ok(())
    }

    /// Read the device's boot block into the connection.
    pub fn bb_read(&self, service_id: ServiceId, ba: u64) -> BlockResult<()> {
        let devcon = self.devcon(service_id)?;
        let mut bb = devcon.bb.lock();
        if bb.is_some() {
            return Err(BlockError::AlreadyExists);
        }

        let mut data = vec![0u8; devcon.pblock_size];
        devcon.read_blocks(ba, 1, &mut data)?;
        *bb = Some(BootBlock { data, addr: ba });
        Ok(())
    }

    /// Copy of the previously read boot block.
    pub fn bb_get(&self, service_id: ServiceId) -> BlockResult<Vec<u8>> {
        let devcon = self.devcon(service_id)?;
        let bb = devcon.bb.lock();
        bb.as_ref()
            .map(|b| b.data.clone())
            .ok_or(BlockError::NotFound)
    }

    /// Read blocks directly from the device (bypass the cache).
    ///
    /// Addresses are physical.
    pub fn read_direct(
        &self,
        service_id: ServiceId,
        ba: u64,
        cnt: usize,
        buf: &mut [u8],
    ) -> BlockResult<()> {
        let devcon = self.devcon(service_id)?;
        devcon.read_blocks(ba, cnt, buf)
    }

    /// Write blocks directly to the device (bypass the cache).
    pub fn write_direct(
        &self,
        service_id: ServiceId,
        ba: u64,
        cnt: usize,
        buf: &[u8],
    ) -> BlockResult<()> {
        let devcon = self.devcon(service_id)?;
        devcon.write_blocks(ba, cnt, buf)
    }

    /// Read a byte range directly from the device, without block alignment
    /// requirements on the caller.
    pub fn read_bytes_direct(
        &self,
        service_id: ServiceId,
        abs_offset: u64,
        buf: &mut [u8],
    ) -> BlockResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let devcon = self.devcon(service_id)?;
        let bsize = devcon.pblock_size as u64;

        let first_block = abs_offset / bsize;
        let offset = (abs_offset % bsize) as usize;
        let last_block = (abs_offset + buf.len() as u64 - 1) / bsize;
        let blocks = (last_block - first_block + 1) as usize;

        let mut staged = vec![0u8; blocks * devcon.pblock_size];
        devcon.read_blocks(first_block, blocks, &mut staged)?;
        buf.copy_from_slice(&staged[offset..offset + buf.len()]);
        Ok(())
    }

    /// Device block size.
    pub fn get_bsize(&self, service_id: ServiceId) -> BlockResult<usize> {
        Ok(self.devcon(service_id)?.pblock_size)
    }

    /// Total number of device blocks.
    pub fn get_nblocks(&self, service_id: ServiceId) -> BlockResult<u64> {
        Ok(self.devcon(service_id)?.dev.num_blocks())
    }

    /// Read sequential data from the device.
    ///
    /// `bufpos` and `buflen` describe the unread window of the staging
    /// buffer; `pos` is the device byte position. The window refills one
    /// block at a time as the cursor wraps.
    pub fn seqread(
        &self,
        service_id: ServiceId,
        bufpos: &mut usize,
        buflen: &mut usize,
        pos: &mut u64,
        dst: &mut [u8],
    ) -> BlockResult<()> {
        let devcon = self.devcon(service_id)?;
        let block_size = devcon.pblock_size;

        let mut comm = devcon.comm.lock();
        let mut offset = 0usize;
        let mut left = dst.len();

        while left > 0 {
            let rd = if *bufpos + left < *buflen {
                left
            } else {
                *buflen - *bufpos
            };

            if rd > 0 {
                dst[offset..offset + rd].copy_from_slice(&comm.buf[*bufpos..*bufpos + rd]);
                offset += rd;
                *bufpos += rd;
                *pos += rd as u64;
                left -= rd;
            }

            if *bufpos == *buflen {
                // Refill the communication buffer with a new block.
                let ba = *pos / block_size as u64;
                devcon.dev.read_blocks(ba, 1, &mut comm.buf[..block_size])?;
                *bufpos = 0;
                *buflen = block_size;
            }
        }

        Ok(())
    }
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests;
