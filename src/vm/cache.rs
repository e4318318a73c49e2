//! VM caches
//!
//! Only what the area and translation-map code needs of a cache: its type,
//! whether it is temporary, the pages it owns, and the cache lock. The
//! lock of an area's top cache is what guards the area's wired ranges.

use alloc::collections::BTreeMap;
use alloc::sync::Weak;
use alloc::vec::Vec;
use core::fmt;

use super::page::PageRef;
use crate::config::PAGE_SHIFT;
use crate::kern::lock::{Mutex, MutexGuard};
use crate::kern::lock_order::LockClass;
use crate::kern::referenceable::{KernelReferenceable, Lockable, LockedReference, Reference, ReferenceCount};

/// Backing store behind a cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    /// Anonymous memory
    Ram,
    /// File contents
    Vnode,
    /// Device memory; has no page records
    Device,
    Null,
}

/// Cache state guarded by the cache lock
#[derive(Default)]
pub struct CacheLocked {
    pages: BTreeMap<u64, PageRef>,
}

impl CacheLocked {
    /// The page caching byte `offset`
    pub fn lookup_page(&self, offset: u64) -> Option<&PageRef> {
        self.pages.get(&(offset >> PAGE_SHIFT))
    }

    pub fn insert_page(&mut self, offset: u64, page: PageRef) -> Option<PageRef> {
        self.pages.insert(offset >> PAGE_SHIFT, page)
    }

    pub fn remove_page(&mut self, offset: u64) -> Option<PageRef> {
        self.pages.remove(&(offset >> PAGE_SHIFT))
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Remove and return every page
    pub fn take_pages(&mut self) -> Vec<PageRef> {
        core::mem::take(&mut self.pages).into_values().collect()
    }
}

/// A cache of pages backing one or more areas
pub struct VmCache {
    refs: ReferenceCount,
    cache_type: CacheType,
    temporary: bool,
    this: Weak<VmCache>,
    lock: Mutex<CacheLocked>,
}

impl VmCache {
    pub fn new(cache_type: CacheType, temporary: bool) -> Reference<Self> {
        Reference::new_cyclic(|this| Self {
            refs: ReferenceCount::new(),
            cache_type,
            temporary,
            this: this.clone(),
            lock: Mutex::new(LockClass::Cache, "vm cache", CacheLocked::default()),
        })
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    /// Temporary caches hold anonymous memory that has no backing file
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn lock(&self) -> MutexGuard<'_, CacheLocked> {
        self.lock.lock()
    }

    pub fn is_locked_by_current(&self) -> bool {
        self.lock.is_locked_by_current()
    }

    pub fn weak(&self) -> Weak<VmCache> {
        self.this.clone()
    }
}

impl KernelReferenceable for VmCache {
    fn reference_count(&self) -> &ReferenceCount {
        &self.refs
    }
}

impl Lockable for VmCache {
    type Locked = CacheLocked;

    fn object_lock(&self) -> &Mutex<CacheLocked> {
        &self.lock
    }
}

impl fmt::Debug for VmCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmCache")
            .field("type", &self.cache_type)
            .field("temporary", &self.temporary)
            .finish()
    }
}

/// A referenced, locked cache
pub type CacheLocker = LockedReference<VmCache>;
