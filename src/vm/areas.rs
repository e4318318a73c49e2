//! The global area registry
//!
//! Every live area is in this one id-ordered tree. Lookups share a
//! reader/writer lock; inserts and removals take it exclusively.
//!
//! Lookups hand out the area without a kernel reference: the caller must
//! keep it alive by other means, usually a reference to the address space
//! that owns it.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, Ordering};

use super::area::VmArea;
use crate::kern::lock::{ReadLockGuard, RwSpinLock, WriteLockGuard};
use crate::types::{AreaId, Error, Result};

type AreaTree = BTreeMap<AreaId, Arc<VmArea>>;

/// Registry of all areas, by id
pub struct VmAreas {
    tree: RwSpinLock<AreaTree>,
    next_id: AtomicI32,
    max_areas: usize,
}

impl VmAreas {
    pub fn new(max_areas: usize) -> Self {
        Self {
            tree: RwSpinLock::new(BTreeMap::new()),
            next_id: AtomicI32::new(1),
            max_areas,
        }
    }

    /// Hand out the next area id
    ///
    /// Ids grow monotonically; after wrapping, ids still in use are skipped.
    pub fn allocate_id(&self) -> AreaId {
        let tree = self.tree.read();
        loop {
            let mut id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id <= 0 {
                self.next_id.store(2, Ordering::Relaxed);
                id = 1;
            }
            if !tree.contains_key(&AreaId(id)) {
                return AreaId(id);
            }
        }
    }

    pub fn read_lock(&self) -> ReadLockGuard<'_, AreaTree> {
        self.tree.read()
    }

    pub fn write_lock(&self) -> WriteLockGuard<'_, AreaTree> {
        self.tree.write()
    }

    /// Look an area up in an already read-locked tree
    pub fn lookup_locked(tree: &AreaTree, id: AreaId) -> Option<Arc<VmArea>> {
        tree.get(&id).cloned()
    }

    pub fn lookup(&self, id: AreaId) -> Option<Arc<VmArea>> {
        let area = Self::lookup_locked(&self.tree.read(), id);
        if area.is_none() {
            log::trace!("area {} not found", id);
        }
        area
    }

    /// Id of the first area called `name`
    ///
    /// A linear scan under the read lock.
    pub fn find(&self, name: &str) -> Result<AreaId> {
        self.tree
            .read()
            .values()
            .find(|area| area.name() == name)
            .map(|area| area.id())
            .ok_or(Error::NameNotFound)
    }

    pub fn insert(&self, area: Arc<VmArea>) -> Result<()> {
        let mut tree = self.tree.write();
        if tree.contains_key(&area.id()) {
            return Err(Error::AlreadyExists);
        }
        if tree.len() >= self.max_areas {
            return Err(Error::NoMoreAreas);
        }
        log::debug!("area {} ({}) inserted", area.id(), area.name());
        tree.insert(area.id(), area);
        Ok(())
    }

    pub fn remove(&self, id: AreaId) -> Option<Arc<VmArea>> {
        let area = self.tree.write().remove(&id);
        if area.is_some() {
            log::debug!("area {} removed", id);
        }
        area
    }

    pub fn count(&self) -> usize {
        self.tree.read().len()
    }

    /// Every registered area, in id order
    pub fn snapshot(&self) -> Vec<Arc<VmArea>> {
        self.tree.read().values().cloned().collect()
    }
}
