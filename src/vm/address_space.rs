//! Address spaces
//!
//! Every team owns one address space: its translation map and the areas
//! placed in it, ordered by base address. The area tree is guarded by the
//! address-space lock, which ranks below the cache and translation map
//! locks.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use super::area::VmArea;
use super::translation_map::TranslationMap;
use crate::kern::lock::{Mutex, MutexGuard};
use crate::kern::lock_order::LockClass;
use crate::kern::referenceable::{KernelReferenceable, Reference, ReferenceCount};
use crate::types::{Addr, AreaId, Error, Result, TeamId};

/// Areas of an address space, keyed by base address
#[derive(Default)]
pub struct AddressSpaceLocked {
    areas: BTreeMap<Addr, Arc<VmArea>>,
}

impl AddressSpaceLocked {
    /// The area covering `address`
    pub fn lookup_area(&self, address: Addr) -> Option<&Arc<VmArea>> {
        self.areas
            .range(..=address)
            .next_back()
            .map(|(_, area)| area)
            .filter(|area| area.contains_address(address))
    }

    pub fn areas(&self) -> impl DoubleEndedIterator<Item = &Arc<VmArea>> {
        self.areas.values()
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// First address at or above `minimum` past every placed area
    pub fn free_base(&self, minimum: Addr) -> Addr {
        self.areas
            .values()
            .next_back()
            .map_or(minimum, |last| last.end().max(minimum))
    }

    fn overlaps(&self, base: Addr, end: Addr) -> bool {
        self.areas
            .range(..end)
            .next_back()
            .is_some_and(|(_, area)| area.end() > base)
    }
}

pub struct VmAddressSpace {
    refs: ReferenceCount,
    id: TeamId,
    kernel: bool,
    translation_map: Arc<dyn TranslationMap>,
    lock: Mutex<AddressSpaceLocked>,
}

impl VmAddressSpace {
    pub fn new(id: TeamId, kernel: bool, translation_map: Arc<dyn TranslationMap>) -> Reference<Self> {
        log::debug!("address space {} created", id);
        Reference::new(Self {
            refs: ReferenceCount::new(),
            id,
            kernel,
            translation_map,
            lock: Mutex::new(
                LockClass::AddressSpace,
                "address space",
                AddressSpaceLocked::default(),
            ),
        })
    }

    /// The owning team
    pub fn id(&self) -> TeamId {
        self.id
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    pub fn translation_map(&self) -> &Arc<dyn TranslationMap> {
        &self.translation_map
    }

    pub fn lock(&self) -> MutexGuard<'_, AddressSpaceLocked> {
        self.lock.lock()
    }

    /// Place `area` in the address space
    ///
    /// Fails with [`Error::BadValue`] if the area belongs to another team
    /// or overlaps an area already placed.
    pub fn insert_area(&self, area: Arc<VmArea>) -> Result<()> {
        if area.address_space() != self.id || area.size() == 0 {
            return Err(Error::BadValue);
        }
        let mut locked = self.lock();
        if locked.overlaps(area.base(), area.end()) {
            log::debug!(
                "address space {}: area {} at {:#x} overlaps",
                self.id,
                area.id(),
                area.base()
            );
            return Err(Error::BadValue);
        }
        locked.areas.insert(area.base(), area);
        Ok(())
    }

    pub fn remove_area(&self, id: AreaId) -> Option<Arc<VmArea>> {
        let mut locked = self.lock();
        let base = locked.areas.iter().find(|(_, area)| area.id() == id).map(|(&base, _)| base)?;
        locked.areas.remove(&base)
    }

    pub fn lookup_area(&self, address: Addr) -> Option<Arc<VmArea>> {
        self.lock().lookup_area(address).cloned()
    }

    pub fn area_count(&self) -> usize {
        self.lock().len()
    }

    /// First address at or above `minimum` past every placed area
    pub fn free_base(&self, minimum: Addr) -> Addr {
        self.lock().free_base(minimum)
    }

    /// Build an area at the free base and place it
    ///
    /// `build` gets the base from [`AddressSpaceLocked::free_base`]. Picking
    /// the base and inserting the area happen under one hold of the
    /// address-space lock, so concurrent callers never pick the same base.
    pub fn insert_area_at_free_base(
        &self,
        minimum: Addr,
        build: impl FnOnce(Addr) -> Arc<VmArea>,
    ) -> Result<Arc<VmArea>> {
        let mut locked = self.lock();
        let base = locked.free_base(minimum);
        let area = build(base);
        if area.address_space() != self.id || area.size() == 0 || area.base() != base {
            return Err(Error::BadValue);
        }
        if locked.overlaps(base, area.end()) {
            return Err(Error::BadValue);
        }
        locked.areas.insert(base, Arc::clone(&area));
        Ok(area)
    }

    /// Take every area out, unmapping each
    ///
    /// Used when the owning team goes away; returns the areas so the caller
    /// can drop them from the global registry.
    pub fn remove_all_areas(&self) -> Vec<Arc<VmArea>> {
        let areas: Vec<Arc<VmArea>> = {
            let mut locked = self.lock();
            core::mem::take(&mut locked.areas).into_values().collect()
        };
        for area in &areas {
            self.translation_map.unmap_area(area, true, false);
        }
        areas
    }
}

impl KernelReferenceable for VmAddressSpace {
    fn reference_count(&self) -> &ReferenceCount {
        &self.refs
    }

    fn last_reference_released(&self) {
        log::debug!("address space {} released", self.id);
    }
}

impl fmt::Debug for VmAddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmAddressSpace")
            .field("id", &self.id)
            .field("kernel", &self.kernel)
            .finish()
    }
}
