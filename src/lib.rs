//! strata - a microkernel-style storage stack
//!
//! The stack is a set of cooperating services behind narrow seams:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                   Clients                    │
//! └─────────────────────┬────────────────────────┘
//!                       │
//! ┌─────────────────────▼────────────────────────┐
//! │            VFS dispatcher (strata-vfs)       │
//! └───────┬──────────────────────────┬───────────┘
//!         │ FsServer                 │ FsServer
//! ┌───────▼────────┐        ┌────────▼───────────┐
//! │ tmpfs server   │        │ FAT server         │
//! └────────────────┘        │  └ block cache     │
//!                           └────────┬───────────┘
//!                                    │ BlockDevice
//! ┌───────────────────┐     ┌────────▼───────────┐
//! │ VBD (partitions)  ├────►│ Locator (naming)   │
//! └───────────────────┘     └────────┬───────────┘
//!                                    │
//!                           ┌────────▼───────────┐
//!                           │ RAM disks, ...     │
//!                           └────────────────────┘
//! ```
//!
//! This crate wires the pieces together: the in-process device locator
//! standing in for the naming service, a `Stack` builder registering the
//! filesystem servers with a fresh dispatcher, and the client-side
//! transfer loops for the partial reads and writes the servers are
//! allowed to answer with.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod locator;

pub use locator::Locator;

pub use strata_block as block;
pub use strata_driver_ram as ram;
pub use strata_driver_traits as driver;
pub use strata_fat as fat;
pub use strata_tmpfs as tmpfs;
pub use strata_vbd as vbd;
pub use strata_vfs as vfs;

use alloc::sync::Arc;

use strata_fat::FatFs;
use strata_tmpfs::Tmpfs;
use strata_vbd::Vbd;
use strata_vfs::{ClientId, Vfs, VfsResult};

/// An assembled storage stack.
pub struct Stack {
    pub locator: Arc<Locator>,
    pub vfs: Arc<Vfs>,
    pub tmpfs: Arc<Tmpfs>,
    pub fat: Arc<FatFs>,
    pub vbd: Arc<Vbd>,
}

impl Stack {
    /// Bring up a dispatcher with the tmpfs and FAT servers registered
    /// and a VBD watching the shared locator.
    pub fn new() -> VfsResult<Stack> {
        let locator = Arc::new(Locator::new());
        let vfs = Arc::new(Vfs::new());

        let tmpfs = Arc::new(Tmpfs::new());
        vfs.register(tmpfs.clone(), 0)?;

        let fat = Arc::new(FatFs::new(locator.clone()));
        vfs.register(fat.clone(), 0)?;

        let vbd = Arc::new(Vbd::new(locator.clone()));

        Ok(Stack {
            locator,
            vfs,
            tmpfs,
            fat,
            vbd,
        })
    }
}

/// Write the whole buffer, looping over the partial transfers the
/// filesystem servers may answer with.
pub fn write_all_at(
    vfs: &Vfs,
    client: ClientId,
    fd: usize,
    mut pos: u64,
    mut data: &[u8],
) -> VfsResult<()> {
    while !data.is_empty() {
        let n = vfs.op_write(client, fd, Some(pos), data)?;
        if n == 0 {
            return Err(strata_vfs::VfsError::IoError);
        }
        pos += n as u64;
        data = &data[n..];
    }
    Ok(())
}

/// Read until the buffer is full or the end of the file is reached;
/// returns the number of bytes read.
pub fn read_full_at(
    vfs: &Vfs,
    client: ClientId,
    fd: usize,
    mut pos: u64,
    buf: &mut [u8],
) -> VfsResult<usize> {
    let mut done = 0;
    while done < buf.len() {
        let n = vfs.op_read(client, fd, Some(pos), &mut buf[done..])?;
        if n == 0 {
            break;
        }
        done += n;
        pos += n as u64;
    }
    Ok(done)
}
