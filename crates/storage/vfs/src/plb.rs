//! Path Lookup Buffer
//!
//! A single process-wide ring of path bytes. Each in-flight lookup claims
//! a contiguous (possibly wrap-around) slice; filesystem servers read the
//! claimed path character by character through a read-only view. Claims
//! never overlap and are released only after the lookup reply returns.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

use crate::{VfsError, VfsResult, PLB_SIZE};

struct PlbEntry {
    id: u64,
    index: usize,
    len: usize,
}

struct PlbState {
    entries: VecDeque<PlbEntry>,
    next_id: u64,
}

/// The Path Lookup Buffer.
pub struct Plb {
    state: Mutex<PlbState>,
    buf: RwLock<Vec<u8>>,
}

impl Plb {
    pub fn new() -> Self {
        Plb {
            state: Mutex::new(PlbState {
                entries: VecDeque::new(),
                next_id: 0,
            }),
            buf: RwLock::new(vec![0u8; PLB_SIZE]),
        }
    }

    /// Claim a slice of the ring and copy `path` into it.
    ///
    /// Fails with `LimitExceeded` when the buffer cannot absorb the path.
    pub fn claim(&self, path: &str) -> VfsResult<PlbClaim<'_>> {
        let len = path.len();
        if len == 0 || len > PLB_SIZE {
            return Err(VfsError::InvalidArgument);
        }

        let (id, first) = {
            let mut state = self.state.lock();

            let (first, last) = match (state.entries.back(), state.entries.front()) {
                (Some(newest), Some(oldest)) => (
                    (newest.index + newest.len) % PLB_SIZE,
                    (oldest.index + PLB_SIZE - 1) % PLB_SIZE,
                ),
                _ => (0, PLB_SIZE - 1),
            };

            let free = if first <= last {
                last - first + 1
            } else {
                PLB_SIZE - (first - last - 1)
            };
            if free < len {
                // The buffer cannot absorb the path.
                return Err(VfsError::LimitExceeded);
            }

            let id = state.next_id;
            state.next_id += 1;
            state.entries.push_back(PlbEntry {
                id,
                index: first,
                len,
            });
            (id, first)
        };

        {
            let mut buf = self.buf.write();
            let cnt1 = core::cmp::min(len, PLB_SIZE - first);
            let cnt2 = len - cnt1;
            buf[first..first + cnt1].copy_from_slice(&path.as_bytes()[..cnt1]);
            buf[..cnt2].copy_from_slice(&path.as_bytes()[cnt1..]);
        }

        Ok(PlbClaim {
            plb: self,
            id,
            first,
            len,
        })
    }

    /// Read one path character from the shared read-only view.
    pub fn get_char(&self, pos: usize) -> u8 {
        self.buf.read()[pos % PLB_SIZE]
    }

    fn release(&self, id: u64, first: usize, len: usize) {
        {
            // Erasing the path comes in handy when debugging.
            let mut buf = self.buf.write();
            let cnt1 = core::cmp::min(len, PLB_SIZE - first);
            let cnt2 = len - cnt1;
            buf[first..first + cnt1].fill(0);
            buf[..cnt2].fill(0);
        }

        let mut state = self.state.lock();
        state.entries.retain(|e| e.id != id);
    }
}

impl Default for Plb {
    fn default() -> Self {
        Self::new()
    }
}

/// An active PLB claim. Releasing the claim erases the slice and returns
/// it to the ring.
pub struct PlbClaim<'a> {
    plb: &'a Plb,
    id: u64,
    first: usize,
    len: usize,
}

impl PlbClaim<'_> {
    /// Index of the first path character.
    pub fn first(&self) -> usize {
        self.first
    }

    /// Index of the last path character.
    pub fn last(&self) -> usize {
        (self.first + self.len - 1) % PLB_SIZE
    }
}

impl Drop for PlbClaim<'_> {
    fn drop(&mut self) {
        self.plb.release(self.id, self.first, self.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_and_read_back() {
        let plb = Plb::new();
        let claim = plb.claim("/a/b").unwrap();
        let first = claim.first();
        assert_eq!(plb.get_char(first), b'/');
        assert_eq!(plb.get_char(first + 1), b'a');
        assert_eq!(plb.get_char(claim.last()), b'b');
    }

    #[test]
    fn claims_do_not_overlap() {
        let plb = Plb::new();
        let a = plb.claim("/one").unwrap();
        let b = plb.claim("/two").unwrap();
        assert_eq!(b.first(), a.first() + 4);
        drop(a);
        drop(b);

        // With all claims gone the ring restarts from the front.
        let c = plb.claim("/three").unwrap();
        assert_eq!(c.first(), 0);
    }

    #[test]
    fn release_erases_slice() {
        let plb = Plb::new();
        let claim = plb.claim("/x").unwrap();
        let first = claim.first();
        drop(claim);
        assert_eq!(plb.get_char(first), 0);
    }

    #[test]
    fn ring_refuses_oversized_path() {
        let plb = Plb::new();
        let big = alloc::string::String::from_utf8(alloc::vec![b'a'; PLB_SIZE + 1]).unwrap();
        assert!(matches!(plb.claim(&big), Err(VfsError::InvalidArgument)));
    }
}
