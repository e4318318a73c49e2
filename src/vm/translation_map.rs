//! Translation Maps
//!
//! A translation map mediates all access to one address space's page
//! tables. Backends implement the single-page primitives for their page
//! table format; the bulk operations and the physical-page bookkeeping
//! that follows every unmap are provided here on top of them.
//!
//! ## Locking
//!
//! Page-table changes happen under the map's recursive lock. A backend's
//! `unmap_page` takes the lock, clears the entry and then calls
//! [`TranslationMap::page_unmapped`], which releases it. When the caller
//! batches mapping records in a queue, the lock is left held and the
//! caller releases it.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use super::area::{MemoryType, Protection, VmArea};
use super::cache::CacheType;
use super::page::{
    FreeMappingFlags, PageMapping, PageMappingsQueue, PageRef, PageState, PhysicalPageService, VmPage,
};
use crate::config::{PAGE_SHIFT, PAGE_SIZE};
use crate::kern::lock::RecursiveLock;
use crate::kern::lock_order::LockClass;
use crate::types::{Addr, Error, PageNumber, PhysAddr, Result};

bitflags::bitflags! {
    /// State of a page table entry, as reported by `query`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        const PRESENT = 0x01;
        const MODIFIED = 0x02;
        const ACCESSED = 0x04;
    }
}

/// A page table entry as seen through `query`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryResult {
    pub physical_address: PhysAddr,
    pub flags: PageFlags,
    pub protection: Protection,
}

/// State every translation map carries
pub struct TranslationMapBase {
    lock: RecursiveLock,
    map_count: AtomicU64,
    pages: Arc<dyn PhysicalPageService>,
    kernel: bool,
}

impl TranslationMapBase {
    pub fn new(pages: Arc<dyn PhysicalPageService>, kernel: bool) -> Self {
        Self {
            lock: RecursiveLock::new(LockClass::TranslationMap, "translation map"),
            map_count: AtomicU64::new(0),
            pages,
            kernel,
        }
    }

    pub fn lock(&self) {
        self.lock.lock();
    }

    pub fn unlock(&self) {
        self.lock.unlock();
    }

    pub fn is_locked_by_current(&self) -> bool {
        self.lock.is_locked_by_current()
    }

    /// Pages mapped through this map
    pub fn map_count(&self) -> u64 {
        self.map_count.load(Ordering::Acquire)
    }

    pub fn mapped(&self) {
        self.map_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unmapped(&self) {
        self.map_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn pages(&self) -> &Arc<dyn PhysicalPageService> {
        &self.pages
    }

    /// Whether the map belongs to the kernel address space
    pub fn is_kernel(&self) -> bool {
        self.kernel
    }
}

/// Page-table access for one address space
pub trait TranslationMap: Send + Sync {
    fn base(&self) -> &TranslationMapBase;

    // === Backend primitives ===

    /// Install a mapping; the map lock must be held
    fn map(
        &self,
        virtual_address: Addr,
        physical_address: PhysAddr,
        protection: Protection,
        memory_type: MemoryType,
    ) -> Result<()>;

    /// Clear entries in `[start, end)` without page bookkeeping
    fn unmap(&self, start: Addr, end: Addr) -> Result<()>;

    /// Unmap one page of `area` and do its bookkeeping
    ///
    /// Takes the map lock and leaves it to [`TranslationMap::page_unmapped`].
    /// Returns [`Error::EntryNotFound`] if nothing was mapped there.
    fn unmap_page(
        &self,
        area: &VmArea,
        address: Addr,
        update_page_queue: bool,
        mappings_queue: Option<&mut PageMappingsQueue>,
    ) -> Result<()>;

    fn query(&self, virtual_address: Addr) -> Result<QueryResult>;

    /// Like `query`, but safe with interrupts disabled
    fn query_interrupt(&self, virtual_address: Addr) -> Result<QueryResult>;

    fn protect(&self, start: Addr, end: Addr, protection: Protection, memory_type: MemoryType) -> Result<()>;

    fn clear_flags(&self, virtual_address: Addr, flags: PageFlags) -> Result<()>;

    /// Clear the accessed and modified bits of a page of `area`
    ///
    /// Returns `(accessed, modified)` as they were. With
    /// `unmap_if_unaccessed`, a page that was not accessed is unmapped.
    fn clear_accessed_and_modified(
        &self,
        area: &VmArea,
        address: Addr,
        unmap_if_unaccessed: bool,
    ) -> (bool, bool);

    fn flush(&self);

    /// Bytes currently mapped
    fn mapped_size(&self) -> u64 {
        self.base().map_count() << PAGE_SHIFT
    }

    /// Page-table pages a mapping of `[start, end)` could need
    fn max_pages_needed_to_map(&self, start: Addr, end: Addr) -> usize;

    // === Generic operations ===

    /// Unmap `[base, base + size)` of `area` page by page
    ///
    /// `deleting_address_space` lets backends skip TLB work; here every
    /// page gets the full treatment.
    fn unmap_pages(&self, area: &VmArea, base: Addr, size: u64, update_page_queue: bool, deleting_address_space: bool) {
        crate::kassert!(base % PAGE_SIZE as u64 == 0, "unmap_pages: unaligned base {:#x}", base);
        crate::kassert!(size % PAGE_SIZE as u64 == 0, "unmap_pages: unaligned size {:#x}", size);
        let _ = deleting_address_space;

        crate::kassert!(
            size == 0 || base.checked_add(size - 1).is_some(),
            "unmap_pages: range {:#x}+{:#x} wraps",
            base,
            size
        );

        for index in 0..size / PAGE_SIZE as u64 {
            let address = base + index * PAGE_SIZE as u64;
            if !cfg!(feature = "debug_page_access") || self.is_present(address) {
                let _ = self.unmap_page(area, address, update_page_queue, None);
            }
        }
    }

    /// Unmap all of `area`
    ///
    /// The flags are hints for backends that can skip work when the whole
    /// address space or cache goes away; the generic version ignores them.
    fn unmap_area(&self, area: &VmArea, deleting_address_space: bool, ignore_top_cache_page_flags: bool) {
        let _ = ignore_top_cache_page_flags;
        let (base, size) = (area.base(), area.size());
        log::trace!("unmap_area {} at {:#x}, {:#x} bytes", area.id(), base, size);

        for index in 0..size / PAGE_SIZE as u64 {
            let address = base + index * PAGE_SIZE as u64;
            if !cfg!(feature = "debug_page_access") || self.is_present(address) {
                let _ = self.unmap_page(area, address, true, None);
            }
        }
        let _ = deleting_address_space;
    }

    fn protect_page(&self, area: &VmArea, address: Addr, protection: Protection) -> Result<()> {
        let address = address & !(PAGE_SIZE as u64 - 1);
        self.protect(address, address + PAGE_SIZE as u64, protection, area.memory_type())
    }

    fn protect_area(&self, area: &VmArea, protection: Protection) -> Result<()> {
        self.protect(area.base(), area.end(), protection, area.memory_type())
    }

    /// Bookkeeping after one page of `area` was unmapped
    ///
    /// Called exactly once per unmapped page, with the map lock held and
    /// the page table entry already cleared. Folds `accessed`/`modified`
    /// into the page, drops the area's mapping record (or the wired
    /// count), and once the page is no longer mapped anywhere updates the
    /// global count and, if asked, the page's queue.
    ///
    /// Without `mappings_queue` the map lock is released here and the
    /// record freed; with one, the record goes to the queue and the lock
    /// stays held.
    fn page_unmapped(
        &self,
        area: &VmArea,
        page_number: PageNumber,
        accessed: bool,
        modified: bool,
        update_page_queue: bool,
        mappings_queue: Option<&mut PageMappingsQueue>,
    ) {
        let base = self.base();
        if area.cache_type() == CacheType::Device {
            if mappings_queue.is_none() {
                base.unlock();
            }
            return;
        }

        let page = lookup_mapped_page(base, page_number);
        let mapping = {
            let mut page = page.lock();
            page.accessed |= accessed;
            page.modified |= modified;

            let mapping = detach_mapping(area, &mut page);
            if !page.is_mapped() {
                base.pages().adjust_mapped_pages(-1);
                if update_page_queue {
                    let state = queue_after_unmap(&page);
                    base.pages().set_page_state(&mut page, state);
                }
            }
            mapping
        };

        match mappings_queue {
            Some(queue) => queue.extend(mapping),
            None => {
                base.unlock();
                if let Some(mapping) = mapping {
                    let mut flags = FreeMappingFlags::DONT_WAIT_FOR_MEMORY;
                    if base.is_kernel() {
                        flags |= FreeMappingFlags::DONT_LOCK_KERNEL_SPACE;
                    }
                    base.pages().free_page_mapping(page_number, mapping, flags);
                }
            }
        }
    }

    /// Bookkeeping after unmapping a page known not to have been accessed
    ///
    /// Like [`TranslationMap::page_unmapped`] without the flag transfer
    /// and queue update. Never takes the kernel address-space lock, so it
    /// is usable outside thread context. Always releases the map lock.
    fn unaccessed_page_unmapped(&self, area: &VmArea, page_number: PageNumber) {
        let base = self.base();
        if area.cache_type() == CacheType::Device {
            base.unlock();
            return;
        }

        let page = lookup_mapped_page(base, page_number);
        let (mapping, now_unmapped) = {
            let mut page = page.lock();
            let mapping = detach_mapping(area, &mut page);
            (mapping, !page.is_mapped())
        };
        base.unlock();

        if now_unmapped {
            base.pages().adjust_mapped_pages(-1);
        }
        if let Some(mapping) = mapping {
            base.pages().free_page_mapping(
                page_number,
                mapping,
                FreeMappingFlags::DONT_WAIT_FOR_MEMORY | FreeMappingFlags::DONT_LOCK_KERNEL_SPACE,
            );
        }
    }

    /// Print what `virtual_address` maps to; backends may fill this in
    fn debug_print_mapping_info(&self, virtual_address: Addr) {
        let _ = virtual_address;
    }

    /// Report every virtual address mapping `physical_address`
    ///
    /// `callback` returns true to stop. Returns true if stopped early.
    fn debug_get_reverse_mapping_info(
        &self,
        physical_address: PhysAddr,
        callback: &mut dyn FnMut(Addr) -> bool,
    ) -> bool {
        let _ = (physical_address, callback);
        false
    }

    #[doc(hidden)]
    fn is_present(&self, address: Addr) -> bool {
        self.query(address)
            .is_ok_and(|entry| entry.flags.contains(PageFlags::PRESENT))
    }
}

fn lookup_mapped_page(base: &TranslationMapBase, page_number: PageNumber) -> PageRef {
    match base.pages().lookup_page(page_number) {
        Some(page) => page,
        None => crate::kernel_panic!("page_unmapped: no page {:#x}", page_number),
    }
}

/// Drop `area`'s claim on `page`: its mapping record, or one wired count
fn detach_mapping(area: &VmArea, page: &mut VmPage) -> Option<PageMapping> {
    if !area.wiring().tracks_mappings() {
        page.decrement_wired_count();
        return None;
    }

    let Some(mapping) = page.remove_mapping(area.id()) else {
        crate::kernel_panic!(
            "page_unmapped: mapping not found (area {}, page {:#x}, accessed {}, modified {})",
            area.id(),
            page.physical_page_number,
            page.accessed,
            page.modified
        );
    };
    area.remove_mapping(page.physical_page_number);
    Some(mapping)
}

fn queue_after_unmap(page: &VmPage) -> PageState {
    if page.cache().is_some_and(|cache| cache.is_temporary()) {
        PageState::Inactive
    } else if page.modified {
        PageState::Modified
    } else {
        PageState::Cached
    }
}

/// Map `page` at `address` in `area` and record the mapping
///
/// An address that is already mapped is refused with
/// [`Error::AlreadyExists`]; the check and the mapping happen under one
/// hold of the map lock. Non-wired areas get a mapping record on the page and the area; wired
/// areas raise the page's wired count. A page mapped for the first time
/// leaves the cached and inactive queues.
pub fn map_page(
    map: &dyn TranslationMap,
    area: &VmArea,
    page: &PageRef,
    address: Addr,
    protection: Protection,
) -> Result<()> {
    if !area.contains_address(address) {
        return Err(Error::BadValue);
    }
    let base = map.base();
    let (page_number, physical_address, was_mapped) = {
        let page = page.lock();
        (page.physical_page_number, page.physical_address(), page.is_mapped())
    };

    base.lock();
    if map.query(address).is_ok_and(|entry| entry.flags.contains(PageFlags::PRESENT)) {
        base.unlock();
        return Err(Error::AlreadyExists);
    }
    let result = map.map(address, physical_address, protection, area.memory_type());
    if result.is_ok() {
        let mut page = page.lock();
        if !page.is_mapped() {
            base.pages().adjust_mapped_pages(1);
        }
        if area.wiring().tracks_mappings() {
            page.mappings.push(PageMapping {
                page: page_number,
                area: area.id(),
            });
            area.add_mapping(page_number);
        } else {
            page.increment_wired_count();
        }
        if !was_mapped && matches!(page.state, PageState::Cached | PageState::Inactive) {
            base.pages().set_page_state(&mut page, PageState::Active);
        }
    }
    base.unlock();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::referenceable::Reference;
    use crate::types::{AreaId, TeamId};
    use crate::vm::area::{AreaSpec, Wiring};
    use crate::vm::cache::VmCache;
    use crate::vm::page::PageStore;
    use crate::vm::soft_map::SoftTranslationMap;

    const BASE: Addr = 0x20_0000;

    struct Fixture {
        store: Arc<PageStore>,
        map: SoftTranslationMap,
        cache: Reference<VmCache>,
        area: VmArea,
    }

    fn fixture(wiring: Wiring, cache_type: CacheType, temporary: bool) -> Fixture {
        let store = Arc::new(PageStore::new());
        store.add_range(0x100, 8);
        let map = SoftTranslationMap::new(store.clone(), false);
        let cache = VmCache::new(cache_type, temporary);
        let spec = AreaSpec {
            name: "test area",
            address_space: TeamId(7),
            kernel: false,
            base: BASE,
            size: 4 * PAGE_SIZE,
            protection: Protection::READ | Protection::WRITE,
            wiring,
            memory_type: MemoryType::default(),
            cache_offset: 0,
        };
        let area = VmArea::new(AreaId(11), &spec, cache.clone());
        Fixture { store, map, cache, area }
    }

    impl Fixture {
        fn map_new_page(&self, index: u64, state: PageState) -> PageRef {
            let page = self
                .store
                .allocate_page(Reference::as_arc(&self.cache), state)
                .unwrap();
            map_page(&self.map, &self.area, &page, BASE + index * PAGE_SIZE, Protection::READ).unwrap();
            page
        }
    }

    #[test]
    fn test_unmap_folds_flags_and_frees_mapping() {
        let f = fixture(Wiring::NoLock, CacheType::Ram, true);
        let page = f.map_new_page(0, PageState::Active);
        assert_eq!(f.store.mapped_pages(), 1);
        assert_eq!(f.area.mapping_count(), 1);

        f.map.touch(BASE, true).unwrap();
        f.map.unmap_page(&f.area, BASE, true, None).unwrap();

        let page = page.lock();
        assert!(page.accessed && page.modified);
        assert!(!page.is_mapped());
        assert_eq!(page.state, PageState::Inactive);
        assert_eq!(f.area.mapping_count(), 0);
        assert_eq!(f.store.mapped_pages(), 0);
        assert_eq!(f.store.freed_mappings(), 1);
        assert!(!f.map.base().is_locked_by_current());
    }

    #[test]
    fn test_queue_choice_for_backed_cache() {
        let f = fixture(Wiring::NoLock, CacheType::Vnode, false);
        let dirty = f.map_new_page(0, PageState::Active);
        let clean = f.map_new_page(1, PageState::Active);
        f.map.touch(BASE, true).unwrap();

        f.map.unmap_pages(&f.area, BASE, 2 * PAGE_SIZE, true, false);
        assert_eq!(dirty.lock().state, PageState::Modified);
        assert_eq!(clean.lock().state, PageState::Cached);
    }

    #[test]
    fn test_no_queue_update_keeps_state() {
        let f = fixture(Wiring::NoLock, CacheType::Ram, true);
        let page = f.map_new_page(0, PageState::Active);
        f.map.unmap_page(&f.area, BASE, false, None).unwrap();
        assert_eq!(page.lock().state, PageState::Active);
        assert_eq!(f.store.mapped_pages(), 0);
    }

    #[test]
    fn test_wired_area_uses_wired_count() {
        let f = fixture(Wiring::FullLock, CacheType::Ram, true);
        let page = f.map_new_page(2, PageState::Wired);
        {
            let page = page.lock();
            assert_eq!(page.wired_count, 1);
            assert!(page.mappings.is_empty());
        }
        assert_eq!(f.area.mapping_count(), 0);

        f.map.unmap_page(&f.area, BASE + 2 * PAGE_SIZE, false, None).unwrap();
        assert_eq!(page.lock().wired_count, 0);
        assert_eq!(f.store.freed_mappings(), 0);
        assert_eq!(f.store.mapped_pages(), 0);
    }

    #[test]
    fn test_mappings_queue_keeps_lock() {
        let f = fixture(Wiring::NoLock, CacheType::Ram, true);
        f.map_new_page(0, PageState::Active);
        f.map_new_page(1, PageState::Active);

        let mut queue = PageMappingsQueue::new();
        f.map.unmap_page(&f.area, BASE, true, Some(&mut queue)).unwrap();
        assert!(f.map.base().is_locked_by_current());
        f.map.unmap_page(&f.area, BASE + PAGE_SIZE, true, Some(&mut queue)).unwrap();
        f.map.base().unlock();
        f.map.base().unlock();

        assert!(!f.map.base().is_locked_by_current());
        assert_eq!(queue.len(), 2);
        assert_eq!(f.store.freed_mappings(), 0);
        assert_eq!(f.area.mapping_count(), 0);
    }

    #[test]
    fn test_unmap_area_skips_holes() {
        let f = fixture(Wiring::NoLock, CacheType::Ram, true);
        f.map_new_page(0, PageState::Active);
        f.map_new_page(3, PageState::Active);

        f.map.unmap_area(&f.area, false, false);
        assert_eq!(f.map.entry_count(), 0);
        assert_eq!(f.map.mapped_size(), 0);
        assert_eq!(f.store.mapped_pages(), 0);
        assert_eq!(f.store.count_in_state(PageState::Inactive), 2);
        assert_eq!(f.map.unmap_page(&f.area, BASE, true, None), Err(Error::EntryNotFound));
    }

    #[test]
    fn test_device_cache_only_unlocks() {
        let f = fixture(Wiring::NoLock, CacheType::Device, false);
        f.map.base().lock();
        f.map.page_unmapped(&f.area, 0xdead, true, true, true, None);
        assert!(!f.map.base().is_locked_by_current());

        let mut queue = PageMappingsQueue::new();
        f.map.base().lock();
        f.map.page_unmapped(&f.area, 0xdead, true, true, true, Some(&mut queue));
        assert!(f.map.base().is_locked_by_current());
        f.map.base().unlock();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_unaccessed_page_unmapped() {
        let f = fixture(Wiring::NoLock, CacheType::Ram, true);
        let page = f.map_new_page(1, PageState::Active);
        let address = BASE + PAGE_SIZE;

        f.map.touch(address, false).unwrap();
        assert_eq!(f.map.clear_accessed_and_modified(&f.area, address, true), (true, false));
        assert_eq!(f.map.entry_count(), 1);

        assert_eq!(f.map.clear_accessed_and_modified(&f.area, address, true), (false, false));
        assert_eq!(f.map.entry_count(), 0);
        let page = page.lock();
        assert!(!page.is_mapped());
        assert!(!page.accessed);
        assert_eq!(page.state, PageState::Active);
        assert_eq!(f.store.freed_mappings(), 1);
        assert!(!f.map.base().is_locked_by_current());
    }

    #[test]
    fn test_first_mapping_activates_cached_page() {
        let f = fixture(Wiring::NoLock, CacheType::Vnode, false);
        let page = f.map_new_page(0, PageState::Cached);
        assert_eq!(page.lock().state, PageState::Active);
        assert_eq!(f.map.query(BASE).unwrap().physical_address, page.lock().physical_address());
    }

    #[test]
    fn test_protect_page_and_area() {
        let f = fixture(Wiring::NoLock, CacheType::Ram, true);
        f.map_new_page(0, PageState::Active);
        f.map_new_page(1, PageState::Active);

        f.map.protect_page(&f.area, BASE + 0x123, Protection::READ | Protection::WRITE).unwrap();
        assert_eq!(f.map.query(BASE).unwrap().protection, Protection::READ | Protection::WRITE);
        assert_eq!(f.map.query(BASE + PAGE_SIZE).unwrap().protection, Protection::READ);

        f.map.protect_area(&f.area, Protection::EXECUTE).unwrap();
        assert_eq!(f.map.query(BASE + PAGE_SIZE).unwrap().protection, Protection::EXECUTE);
    }

    #[test]
    fn test_map_page_outside_area() {
        let f = fixture(Wiring::NoLock, CacheType::Ram, true);
        let page = f.store.lookup_page(0x100).unwrap();
        assert_eq!(
            map_page(&f.map, &f.area, &page, BASE + 4 * PAGE_SIZE, Protection::READ),
            Err(Error::BadValue)
        );
    }

    #[test]
    fn test_map_page_refuses_present_entry() {
        let f = fixture(Wiring::NoLock, CacheType::Ram, true);
        let page = f.map_new_page(0, PageState::Active);

        assert_eq!(
            map_page(&f.map, &f.area, &page, BASE, Protection::READ),
            Err(Error::AlreadyExists)
        );
        assert_eq!(page.lock().mappings.len(), 1);
        assert_eq!(f.area.mapping_count(), 1);
        assert_eq!(f.store.mapped_pages(), 1);
        assert_eq!(f.map.entry_count(), 1);
        assert!(!f.map.base().is_locked_by_current());
    }

    #[test]
    fn test_unmap_pages_at_top_of_address_space() {
        let f = fixture(Wiring::NoLock, CacheType::Ram, true);
        let top = u64::MAX - PAGE_SIZE + 1;
        let spec = AreaSpec {
            name: "top",
            address_space: TeamId(7),
            kernel: true,
            base: top,
            size: PAGE_SIZE,
            protection: Protection::KERNEL_READ,
            wiring: Wiring::NoLock,
            memory_type: MemoryType::default(),
            cache_offset: 0,
        };
        let area = VmArea::new(AreaId(12), &spec, f.cache.clone());
        let page = f
            .store
            .allocate_page(Reference::as_arc(&f.cache), PageState::Active)
            .unwrap();
        map_page(&f.map, &area, &page, top, Protection::KERNEL_READ).unwrap();

        f.map.unmap_pages(&area, top, PAGE_SIZE, true, false);
        assert_eq!(f.map.entry_count(), 0);
        assert!(!page.lock().is_mapped());
        assert_eq!(area.mapping_count(), 0);
    }

    #[test]
    #[should_panic(expected = "mapping not found")]
    fn test_second_unmap_of_same_page_is_fatal() {
        let f = fixture(Wiring::NoLock, CacheType::Ram, true);
        let page = f.map_new_page(0, PageState::Active);
        let number = page.lock().physical_page_number;
        f.map.unmap_page(&f.area, BASE, true, None).unwrap();

        f.map.base().lock();
        f.map.page_unmapped(&f.area, number, false, false, true, None);
    }
}
