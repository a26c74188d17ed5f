//! Translation between FAT entities and stable VFS indices
//!
//! FAT has no persistent object identity: a file is addressed by the
//! position of its directory entry, which rename and unlink both move or
//! destroy. The index layer invents a per-mount stable integer and keeps
//! a two-way mapping between it and the volatile position, expressed as
//! the pair (parent's first cluster, dentry index within the parent).

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::Mutex;

use strata_vfs::{FsIndex, ServiceId, VfsError, VfsResult};

use crate::node::FatNode;

/// Volatile position of an entry, plus the in-core node when one is
/// instantiated. A position of (0, 0) on a non-root entry marks a node
/// that has been unlinked but is still open somewhere.
pub(crate) struct IdxPos {
    /// Parent directory's first cluster
    pub(crate) pfc: u32,
    /// Directory entry index within the parent
    pub(crate) pdi: u32,
    pub(crate) nodep: Option<Weak<FatNode>>,
}

/// One stable index.
pub(crate) struct IdxEntry {
    pub(crate) service_id: ServiceId,
    pub(crate) index: FsIndex,
    pub(crate) pos: Mutex<IdxPos>,
}

/// Unassigned index bookkeeping for one device: a monotonic counter plus
/// a sorted list of freed intervals eligible for reuse.
struct Unused {
    service_id: ServiceId,
    /// Next index to assign from the counter
    next: FsIndex,
    /// Number of indices remaining under the counter
    remaining: u64,
    /// Sorted, disjoint intervals of freed indices
    freed: Vec<(FsIndex, FsIndex)>,
}

struct IdxState {
    unused: Vec<Unused>,
    by_pos: BTreeMap<(ServiceId, u32, u32), Arc<IdxEntry>>,
    by_index: BTreeMap<(ServiceId, FsIndex), Arc<IdxEntry>>,
}

/// The index tables of a FAT server, shared by all its instances.
pub(crate) struct FatIdx {
    state: Mutex<IdxState>,
}

impl FatIdx {
    pub(crate) fn new() -> Self {
        FatIdx {
            state: Mutex::new(IdxState {
                unused: Vec::new(),
                by_pos: BTreeMap::new(),
                by_index: BTreeMap::new(),
            }),
        }
    }

    /// Start managing indices for a newly mounted device.
    pub(crate) fn init_instance(&self, service_id: ServiceId) -> VfsResult<()> {
        let mut state = self.state.lock();
        if state.unused.iter().any(|u| u.service_id == service_id) {
            return Err(VfsError::AlreadyExists);
        }
        state.unused.push(Unused {
            service_id,
            next: 0,
            remaining: u64::from(u32::MAX) + 1,
            freed: Vec::new(),
        });
        Ok(())
    }

    /// Drop all index state belonging to an unmounted device.
    pub(crate) fn fini_instance(&self, service_id: ServiceId) {
        let mut state = self.state.lock();
        state.unused.retain(|u| u.service_id != service_id);
        state.by_pos.retain(|&(sid, _, _), _| sid != service_id);
        state.by_index.retain(|&(sid, _), _| sid != service_id);
    }

    /// Allocate a fresh index and register it, not yet hashed by
    /// position.
    pub(crate) fn get_new(&self, service_id: ServiceId) -> VfsResult<Arc<IdxEntry>> {
        let mut state = self.state.lock();
        let index = Self::alloc_index(&mut state, service_id)?;
        let entry = Arc::new(IdxEntry {
            service_id,
            index,
            pos: Mutex::new(IdxPos {
                pfc: 0,
                pdi: 0,
                nodep: None,
            }),
        });
        state.by_index.insert((service_id, index), entry.clone());
        Ok(entry)
    }

    /// Look an entry up by position, creating it (with a fresh index)
    /// when the position is encountered for the first time.
    pub(crate) fn get_by_pos(
        &self,
        service_id: ServiceId,
        pfc: u32,
        pdi: u32,
    ) -> VfsResult<Arc<IdxEntry>> {
        let mut state = self.state.lock();
        if let Some(entry) = state.by_pos.get(&(service_id, pfc, pdi)) {
            return Ok(entry.clone());
        }

        let index = Self::alloc_index(&mut state, service_id)?;
        let entry = Arc::new(IdxEntry {
            service_id,
            index,
            pos: Mutex::new(IdxPos {
                pfc,
                pdi,
                nodep: None,
            }),
        });
        state.by_pos.insert((service_id, pfc, pdi), entry.clone());
        state.by_index.insert((service_id, index), entry.clone());
        Ok(entry)
    }

    pub(crate) fn get_by_index(
        &self,
        service_id: ServiceId,
        index: FsIndex,
    ) -> Option<Arc<IdxEntry>> {
        self.state
            .lock()
            .by_index
            .get(&(service_id, index))
            .cloned()
    }

    /// Whether any non-root node of this device is still referenced.
    /// Consulted for unmount eligibility.
    pub(crate) fn has_open_nodes(&self, service_id: ServiceId) -> bool {
        let entries: Vec<Arc<IdxEntry>> = {
            let state = self.state.lock();
            state
                .by_index
                .range((service_id, 0)..=(service_id, FsIndex::MAX))
                .filter(|(&(_, index), _)| index != 0)
                .map(|(_, e)| e.clone())
                .collect()
        };

        entries.iter().any(|entry| {
            let node = {
                let pos = entry.pos.lock();
                pos.nodep.as_ref().and_then(|w| w.upgrade())
            };
            node.map(|n| n.inner.lock().refcnt > 0).unwrap_or(false)
        })
    }

    /// Hash an entry into the position table under its current position.
    pub(crate) fn hashin(&self, entry: &Arc<IdxEntry>) {
        let mut state = self.state.lock();
        let pos = entry.pos.lock();
        state
            .by_pos
            .insert((entry.service_id, pos.pfc, pos.pdi), entry.clone());
    }

    /// Remove an entry from the position table.
    pub(crate) fn hashout(&self, entry: &Arc<IdxEntry>) {
        let mut state = self.state.lock();
        let pos = entry.pos.lock();
        state
            .by_pos
            .remove(&(entry.service_id, pos.pfc, pos.pdi));
    }

    /// Destroy an entry, returning its index to the free pool.
    pub(crate) fn destroy(&self, entry: &Arc<IdxEntry>) {
        let mut state = self.state.lock();
        let pos = entry.pos.lock();
        state
            .by_pos
            .remove(&(entry.service_id, pos.pfc, pos.pdi));
        state.by_index.remove(&(entry.service_id, entry.index));
        drop(pos);
        Self::free_index(&mut state, entry.service_id, entry.index);
    }

    fn alloc_index(state: &mut IdxState, service_id: ServiceId) -> VfsResult<FsIndex> {
        let u = state
            .unused
            .iter_mut()
            .find(|u| u.service_id == service_id)
            .ok_or(VfsError::NotFound)?;

        if let Some(&(first, last)) = u.freed.first() {
            // Reuse a freed index.
            if first == last {
                u.freed.remove(0);
            } else {
                u.freed[0] = (first + 1, last);
            }
            return Ok(first);
        }

        if u.remaining == 0 {
            // Out of indices; only theoretically possible, e.g. with too
            // many open unlinked nodes.
            return Err(VfsError::NoSpace);
        }
        let index = u.next;
        u.next += 1;
        u.remaining -= 1;
        Ok(index)
    }

    fn free_index(state: &mut IdxState, service_id: ServiceId, index: FsIndex) {
        let u = match state
            .unused
            .iter_mut()
            .find(|u| u.service_id == service_id)
        {
            Some(u) => u,
            None => return,
        };

        if u.next == index + 1 {
            // The index can be returned directly to the counter.
            u.next -= 1;
            u.remaining += 1;
            return;
        }

        // Return the index to an existing freed interval, or start a new
        // one, keeping the list sorted and coalesced.
        let mut i = 0;
        while i < u.freed.len() {
            let (first, last) = u.freed[i];
            if index + 1 == first {
                u.freed[i] = (index, last);
                if i > 0 && u.freed[i - 1].1 + 1 == index {
                    let merged = (u.freed[i - 1].0, last);
                    u.freed[i - 1] = merged;
                    u.freed.remove(i);
                }
                return;
            }
            if last + 1 == index {
                u.freed[i] = (first, index);
                if i + 1 < u.freed.len() && index + 1 == u.freed[i + 1].0 {
                    let merged = (first, u.freed[i + 1].1);
                    u.freed[i] = merged;
                    u.freed.remove(i + 1);
                }
                return;
            }
            if index < first {
                u.freed.insert(i, (index, index));
                return;
            }
            i += 1;
        }

        // The index forms the last interval.
        u.freed.push((index, index));
    }
}
