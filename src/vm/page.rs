//! Physical Pages
//!
//! The physical-page side of the VM core: the page record the translation
//! maps update when a mapping goes away, and the service through which
//! they look pages up, move them between queues and free mapping records.
//!
//! ## Mappings
//!
//! A page mapped into a non-wired area carries one [`PageMapping`] per
//! area; the area keeps the matching page number in its own list. Pages
//! mapped into wired areas carry no records, only a wired count. A page
//! is mapped while it has either.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use super::cache::VmCache;
use crate::config::PAGE_SHIFT;
use crate::kern::lock::SpinLock;
use crate::types::{AreaId, PageNumber, PhysAddr};

// ============================================================================
// Page State
// ============================================================================

/// Queue a physical page belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageState {
    Active,
    Inactive,
    Modified,
    Cached,
    Free,
    Clear,
    Wired,
    Unused,
}

/// Links a page to one area that maps it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapping {
    pub page: PageNumber,
    pub area: AreaId,
}

/// Mapping records collected by a batching caller, freed later in one go
pub type PageMappingsQueue = Vec<PageMapping>;

bitflags::bitflags! {
    /// How [`PhysicalPageService::free_page_mapping`] may behave
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FreeMappingFlags: u32 {
        /// Do not block waiting for memory
        const DONT_WAIT_FOR_MEMORY = 0x01;
        /// Do not take the kernel address-space lock
        const DONT_LOCK_KERNEL_SPACE = 0x02;
    }
}

// ============================================================================
// Page Structure
// ============================================================================

/// A physical page
#[derive(Debug)]
pub struct VmPage {
    pub physical_page_number: PageNumber,
    /// Sticky: set by translation maps when a mapping is torn down
    pub accessed: bool,
    /// Sticky, like `accessed`
    pub modified: bool,
    pub wired_count: u32,
    pub mappings: Vec<PageMapping>,
    pub state: PageState,
    cache: Weak<VmCache>,
}

impl VmPage {
    pub fn new(physical_page_number: PageNumber) -> Self {
        Self {
            physical_page_number,
            accessed: false,
            modified: false,
            wired_count: 0,
            mappings: Vec::new(),
            state: PageState::Free,
            cache: Weak::new(),
        }
    }

    pub fn physical_address(&self) -> PhysAddr {
        self.physical_page_number << PAGE_SHIFT
    }

    pub fn is_mapped(&self) -> bool {
        self.wired_count > 0 || !self.mappings.is_empty()
    }

    pub fn increment_wired_count(&mut self) {
        self.wired_count += 1;
    }

    pub fn decrement_wired_count(&mut self) {
        crate::kassert!(
            self.wired_count > 0,
            "page {:#x}: wired count underflow",
            self.physical_page_number
        );
        self.wired_count -= 1;
    }

    /// Owning cache, if it is still alive
    pub fn cache(&self) -> Option<Arc<VmCache>> {
        self.cache.upgrade()
    }

    pub fn set_cache(&mut self, cache: Weak<VmCache>) {
        self.cache = cache;
    }

    /// Detach the mapping record for `area`, if the page has one
    pub fn remove_mapping(&mut self, area: AreaId) -> Option<PageMapping> {
        let index = self.mappings.iter().position(|m| m.area == area)?;
        Some(self.mappings.remove(index))
    }
}

/// Shared handle to a page record
pub type PageRef = Arc<SpinLock<VmPage>>;

// ============================================================================
// Physical Page Service
// ============================================================================

/// What the translation maps need from the physical page allocator
pub trait PhysicalPageService: Send + Sync {
    /// The page with this physical page number
    fn lookup_page(&self, page_number: PageNumber) -> Option<PageRef>;

    /// Move `page` to the queue for `state`
    fn set_page_state(&self, page: &mut VmPage, state: PageState);

    /// Return a mapping record to the allocator
    fn free_page_mapping(&self, page_number: PageNumber, mapping: PageMapping, flags: FreeMappingFlags);

    /// Add `delta` to the system-wide count of mapped pages
    fn adjust_mapped_pages(&self, delta: i64);

    fn mapped_pages(&self) -> i64;
}

/// In-memory page allocator state
#[derive(Default)]
pub struct PageStore {
    pages: SpinLock<BTreeMap<PageNumber, PageRef>>,
    mapped_pages: AtomicI64,
    freed_mappings: AtomicUsize,
}

impl PageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `count` free pages starting at `first`
    pub fn add_range(&self, first: PageNumber, count: u64) {
        let mut pages = self.pages.lock();
        for number in first..first + count {
            pages
                .entry(number)
                .or_insert_with(|| Arc::new(SpinLock::new(VmPage::new(number))));
        }
    }

    /// Take a free page for `cache`
    pub fn allocate_page(&self, cache: &Arc<VmCache>, state: PageState) -> Option<PageRef> {
        let pages = self.pages.lock();
        for page in pages.values() {
            let mut locked = page.lock();
            if locked.state == PageState::Free {
                locked.state = state;
                locked.accessed = false;
                locked.modified = false;
                locked.set_cache(Arc::downgrade(cache));
                drop(locked);
                return Some(Arc::clone(page));
            }
        }
        log::trace!("page store exhausted");
        None
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn count_in_state(&self, state: PageState) -> usize {
        self.pages
            .lock()
            .values()
            .filter(|page| page.lock().state == state)
            .count()
    }

    /// Mapping records handed back so far
    pub fn freed_mappings(&self) -> usize {
        self.freed_mappings.load(Ordering::Acquire)
    }
}

impl PhysicalPageService for PageStore {
    fn lookup_page(&self, page_number: PageNumber) -> Option<PageRef> {
        self.pages.lock().get(&page_number).cloned()
    }

    fn set_page_state(&self, page: &mut VmPage, state: PageState) {
        log::trace!(
            "page {:#x}: {:?} -> {:?}",
            page.physical_page_number,
            page.state,
            state
        );
        page.state = state;
    }

    fn free_page_mapping(&self, _page_number: PageNumber, _mapping: PageMapping, _flags: FreeMappingFlags) {
        self.freed_mappings.fetch_add(1, Ordering::AcqRel);
    }

    fn adjust_mapped_pages(&self, delta: i64) {
        self.mapped_pages.fetch_add(delta, Ordering::AcqRel);
    }

    fn mapped_pages(&self) -> i64 {
        self.mapped_pages.load(Ordering::Acquire)
    }
}
