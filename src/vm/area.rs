//! VM Areas
//!
//! An area is one contiguous range of virtual memory in one address space,
//! backed by a cache starting at `cache_offset`.
//!
//! ## Wired ranges
//!
//! I/O that needs an area's pages to stay put wires a range of the area
//! for its duration. Code that wants to unmap or resize memory must wait
//! until the range is unwired: it registers an [`UnwiredWaiter`] on the
//! range and blocks on it once it has dropped its locks.
//!
//! The wired-range list has no lock of its own. Every operation on it
//! takes a [`CacheLocker`] for the area's top cache as proof that the
//! caller holds that lock; a locker for any other cache is fatal.

use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::fmt;

use super::cache::{CacheLocker, CacheType, VmCache};
use crate::config::{truncated_name, Name, PAGE_SHIFT, PAGE_SIZE};
use crate::kern::condition_variable::{ConditionVariable, ConditionVariableEntry};
use crate::kern::cpu::Timeout;
use crate::kern::lock::SpinLock;
use crate::kern::referenceable::Reference;
use crate::types::{Addr, AreaId, PageNumber, Result, TeamId};

bitflags::bitflags! {
    /// Access rights of an area or page
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const EXECUTE = 0x04;
        const STACK = 0x08;
        const KERNEL_READ = 0x10;
        const KERNEL_WRITE = 0x20;
        const KERNEL_EXECUTE = 0x40;
        const KERNEL_STACK = 0x80;
    }
}

impl Protection {
    /// The bits a per-page protection entry can hold
    pub const USER_MASK: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE).union(Self::STACK);

    /// Kernel rights implied by the user rights
    pub fn implied_kernel(self) -> Self {
        let mut kernel = Self::empty();
        if self.contains(Self::READ) {
            kernel |= Self::KERNEL_READ;
        }
        if self.contains(Self::WRITE) {
            kernel |= Self::KERNEL_WRITE;
        }
        kernel
    }
}

/// Mapping policy of an area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wiring {
    /// Pages come and go on demand
    NoLock,
    /// Pages are wired on first touch
    LazyLock,
    /// All pages wired at creation
    FullLock,
    /// Physically contiguous and wired
    Contiguous,
    /// Wired by whoever created it, before the area existed
    AlreadyWired,
}

impl Wiring {
    /// Whether pages of such areas carry mapping records
    pub fn tracks_mappings(self) -> bool {
        self == Wiring::NoLock
    }
}

/// Caching attributes of an area's mappings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryType {
    #[default]
    WriteBack,
    Uncached,
    WriteCombining,
    WriteThrough,
    WriteProtected,
}

bitflags::bitflags! {
    /// Options for [`VmArea::add_waiter_if_wired_range`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WiredWaitFlags: u32 {
        /// Only read-wired ranges count
        const IGNORE_WRITE_WIRED_RANGES = 0x01;
    }
}

// ============================================================================
// Wired Ranges
// ============================================================================

/// Handle of a range wired into an area
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WiredRangeId(u64);

/// A wired span of an area
pub struct WiredRange {
    pub base: Addr,
    pub size: u64,
    pub writable: bool,
    /// Created by the VM itself rather than passed in by a caller
    pub implicit: bool,
    area: Option<AreaId>,
    waiters: Vec<Arc<ConditionVariable>>,
}

impl WiredRange {
    pub fn new(base: Addr, size: u64, writable: bool, implicit: bool) -> Self {
        Self {
            base,
            size,
            writable,
            implicit,
            area: None,
            waiters: Vec::new(),
        }
    }

    /// The area the range is wired into
    pub fn area(&self) -> Option<AreaId> {
        self.area
    }

    pub fn intersects_with(&self, base: Addr, size: u64) -> bool {
        if size == 0 || self.size == 0 {
            return false;
        }
        let end = self.base.saturating_add(self.size - 1);
        let other_end = base.saturating_add(size - 1);
        self.base <= other_end && base <= end
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}

impl fmt::Debug for WiredRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WiredRange")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("writable", &self.writable)
            .field("implicit", &self.implicit)
            .field("area", &self.area)
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

/// Someone waiting for wired memory to become unwired
pub struct UnwiredWaiter {
    area: Option<AreaId>,
    base: Addr,
    size: u64,
    condition: Arc<ConditionVariable>,
    entry: ConditionVariableEntry,
}

impl UnwiredWaiter {
    pub fn new() -> Self {
        Self {
            area: None,
            base: 0,
            size: 0,
            condition: Arc::new(ConditionVariable::new()),
            entry: ConditionVariableEntry::new(),
        }
    }

    /// The area and span the waiter was registered for
    pub fn target(&self) -> Option<(AreaId, Addr, u64)> {
        self.area.map(|area| (area, self.base, self.size))
    }

    /// Block until the range is unwired
    ///
    /// Only valid after an `add_waiter_if_wired*` call returned true.
    pub fn wait(&self, timeout: Timeout) -> Result<()> {
        self.entry.wait(timeout)
    }

    pub fn is_notified(&self) -> bool {
        self.entry.is_notified()
    }
}

impl Default for UnwiredWaiter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct WiredRanges {
    next_id: u64,
    ranges: Vec<(WiredRangeId, WiredRange)>,
}

// ============================================================================
// Area
// ============================================================================

struct AreaAttributes {
    protection: Protection,
    protection_max: Protection,
    memory_type: MemoryType,
    page_protections: Option<Vec<u8>>,
}

/// A mapped region of an address space
pub struct VmArea {
    id: AreaId,
    name: Name,
    address_space: TeamId,
    kernel: bool,
    base: SpinLock<(Addr, u64)>,
    wiring: Wiring,
    cache: Reference<VmCache>,
    cache_offset: u64,
    attributes: SpinLock<AreaAttributes>,
    /// Page numbers mapped through this area; guarded by the translation map lock
    mappings: SpinLock<BTreeSet<PageNumber>>,
    /// Guarded by the top cache lock
    wired_ranges: UnsafeCell<WiredRanges>,
}

// SAFETY: `wired_ranges` is only reached through methods that verify the
// caller holds the top cache lock.
unsafe impl Sync for VmArea {}

/// Construction parameters of an area
#[derive(Debug, Clone)]
pub struct AreaSpec<'a> {
    pub name: &'a str,
    pub address_space: TeamId,
    pub kernel: bool,
    pub base: Addr,
    pub size: u64,
    pub protection: Protection,
    pub wiring: Wiring,
    pub memory_type: MemoryType,
    pub cache_offset: u64,
}

impl VmArea {
    pub fn new(id: AreaId, spec: &AreaSpec<'_>, cache: Reference<VmCache>) -> Self {
        Self {
            id,
            name: truncated_name(spec.name),
            address_space: spec.address_space,
            kernel: spec.kernel,
            base: SpinLock::new((spec.base, spec.size)),
            wiring: spec.wiring,
            cache,
            cache_offset: spec.cache_offset,
            attributes: SpinLock::new(AreaAttributes {
                protection: spec.protection,
                protection_max: spec.protection,
                memory_type: spec.memory_type,
                page_protections: None,
            }),
            mappings: SpinLock::new(BTreeSet::new()),
            wired_ranges: UnsafeCell::new(WiredRanges::default()),
        }
    }

    pub fn id(&self) -> AreaId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Team whose address space holds the area
    pub fn address_space(&self) -> TeamId {
        self.address_space
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    pub fn base(&self) -> Addr {
        self.base.lock().0
    }

    pub fn size(&self) -> u64 {
        self.base.lock().1
    }

    pub fn end(&self) -> Addr {
        let (base, size) = *self.base.lock();
        base + size
    }

    pub fn set_base(&self, base: Addr) {
        self.base.lock().0 = base;
    }

    pub fn set_size(&self, size: u64) {
        self.base.lock().1 = size;
    }

    pub fn contains_address(&self, address: Addr) -> bool {
        let (base, size) = *self.base.lock();
        address >= base && address - base < size
    }

    pub fn wiring(&self) -> Wiring {
        self.wiring
    }

    pub fn cache(&self) -> &Reference<VmCache> {
        &self.cache
    }

    pub fn cache_offset(&self) -> u64 {
        self.cache_offset
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache.cache_type()
    }

    pub fn protection(&self) -> Protection {
        self.attributes.lock().protection
    }

    pub fn protection_max(&self) -> Protection {
        self.attributes.lock().protection_max
    }

    pub fn set_protection(&self, protection: Protection) {
        self.attributes.lock().protection = protection;
    }

    pub fn set_protection_max(&self, protection: Protection) {
        self.attributes.lock().protection_max = protection;
    }

    pub fn memory_type(&self) -> MemoryType {
        self.attributes.lock().memory_type
    }

    pub fn set_memory_type(&self, memory_type: MemoryType) {
        self.attributes.lock().memory_type = memory_type;
    }

    // === Page protections ===

    /// Give every page its own protection, starting from the area's
    pub fn allocate_page_protections(&self) {
        let pages = (self.size() >> PAGE_SHIFT) as usize;
        let mut attributes = self.attributes.lock();
        let nibble = (attributes.protection & Protection::USER_MASK).bits() as u8;
        attributes.page_protections = Some(vec![nibble | (nibble << 4); pages.div_ceil(2)]);
    }

    pub fn has_page_protections(&self) -> bool {
        self.attributes.lock().page_protections.is_some()
    }

    /// Effective protection of the page at `address`
    ///
    /// Kernel areas report only the kernel rights.
    pub fn page_protection(&self, address: Addr) -> Protection {
        let index = self.page_index(address);
        let attributes = self.attributes.lock();
        let Some(protections) = &attributes.page_protections else {
            return attributes.protection;
        };

        let byte = protections[index / 2];
        let nibble = if index % 2 == 0 { byte & 0x0f } else { byte >> 4 };
        let protection = Protection::from_bits_truncate(nibble as u32);
        let kernel = protection.implied_kernel();
        if self.kernel {
            kernel
        } else {
            protection | kernel
        }
    }

    /// Override the protection of the page at `address`
    ///
    /// Allocates the per-page table on first use.
    pub fn set_page_protection(&self, address: Addr, protection: Protection) {
        if !self.has_page_protections() {
            self.allocate_page_protections();
        }
        let index = self.page_index(address);
        let nibble = (protection & Protection::USER_MASK).bits() as u8;
        let mut attributes = self.attributes.lock();
        if let Some(protections) = attributes.page_protections.as_mut() {
            let byte = &mut protections[index / 2];
            *byte = if index % 2 == 0 {
                (*byte & 0xf0) | nibble
            } else {
                (*byte & 0x0f) | (nibble << 4)
            };
        }
    }

    fn page_index(&self, address: Addr) -> usize {
        crate::kassert!(
            self.contains_address(address),
            "area {}: address {:#x} out of range",
            self.id,
            address
        );
        ((address - self.base()) >> PAGE_SHIFT) as usize
    }

    // === Mapping list ===

    pub fn add_mapping(&self, page: PageNumber) {
        self.mappings.lock().insert(page);
    }

    pub fn remove_mapping(&self, page: PageNumber) -> bool {
        self.mappings.lock().remove(&page)
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.lock().len()
    }

    pub fn mapped_pages(&self) -> Vec<PageNumber> {
        self.mappings.lock().iter().copied().collect()
    }

    // === Wired ranges ===

    fn ranges(&self, locker: &CacheLocker) -> &WiredRanges {
        self.check_cache_locker(locker);
        // SAFETY: the top cache lock is held and `locker` borrows it
        unsafe { &*self.wired_ranges.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn ranges_mut(&self, locker: &CacheLocker) -> &mut WiredRanges {
        self.check_cache_locker(locker);
        // SAFETY: as in `ranges`; the lock makes this the only access
        unsafe { &mut *self.wired_ranges.get() }
    }

    fn check_cache_locker(&self, locker: &CacheLocker) {
        crate::kassert!(
            Reference::ptr_eq(locker.reference(), &self.cache),
            "area {}: wired ranges need the top cache lock",
            self.id
        );
    }

    /// Whether any wired range intersects `[base, base + size)`
    pub fn is_wired_range(&self, locker: &CacheLocker, base: Addr, size: u64) -> bool {
        self.ranges(locker)
            .ranges
            .iter()
            .any(|(_, range)| range.intersects_with(base, size))
    }

    /// Whether anything in the area is wired
    pub fn is_wired(&self, locker: &CacheLocker) -> bool {
        !self.ranges(locker).ranges.is_empty()
    }

    pub fn wired_range_count(&self, locker: &CacheLocker) -> usize {
        self.ranges(locker).ranges.len()
    }

    /// Attach `range` to the area
    pub fn wire(&self, locker: &CacheLocker, mut range: WiredRange) -> WiredRangeId {
        crate::kassert!(
            range.area.is_none(),
            "area {}: range already wired into area {:?}",
            self.id,
            range.area
        );
        range.area = Some(self.id);

        let ranges = self.ranges_mut(locker);
        let id = WiredRangeId(ranges.next_id);
        ranges.next_id += 1;
        ranges.ranges.push((id, range));
        id
    }

    /// Detach a range and wake everyone waiting on it
    pub fn unwire(&self, locker: &CacheLocker, id: WiredRangeId) -> WiredRange {
        let ranges = self.ranges_mut(locker);
        let Some(index) = ranges.ranges.iter().position(|(range_id, _)| *range_id == id) else {
            crate::kernel_panic!("area {}: unwire of range {:?} not wired here", self.id, id);
        };
        let (_, range) = ranges.ranges.remove(index);
        Self::release_range(range)
    }

    /// Unwire the implicit range exactly matching `base`, `size` and `writable`
    ///
    /// Not finding one is fatal: the wiring accounting is broken.
    pub fn unwire_implicit(&self, locker: &CacheLocker, base: Addr, size: u64, writable: bool) -> WiredRange {
        let ranges = self.ranges_mut(locker);
        let index = ranges.ranges.iter().position(|(_, range)| {
            range.implicit && range.base == base && range.size == size && range.writable == writable
        });
        let Some(index) = index else {
            crate::kernel_panic!(
                "area {}: unwire({:#x}, {:#x}, {}): no such range",
                self.id,
                base,
                size,
                writable
            );
        };
        let (_, range) = ranges.ranges.remove(index);
        Self::release_range(range)
    }

    fn release_range(mut range: WiredRange) -> WiredRange {
        range.area = None;
        for condition in range.waiters.drain(..) {
            condition.notify_all();
        }
        range
    }

    /// Register `waiter` on the first wired range, if there is one
    ///
    /// On true the caller must drop its locks and wait; on false nothing
    /// is wired and it must not.
    pub fn add_waiter_if_wired(&self, locker: &CacheLocker, waiter: &mut UnwiredWaiter) -> bool {
        let (base, size) = (self.base(), self.size());
        let id = self.id;
        let ranges = self.ranges_mut(locker);
        let Some((_, range)) = ranges.ranges.first_mut() else {
            return false;
        };
        Self::attach_waiter(id, range, waiter, base, size);
        true
    }

    /// Register `waiter` on a wired range intersecting `[base, base + size)`
    pub fn add_waiter_if_wired_range(
        &self,
        locker: &CacheLocker,
        waiter: &mut UnwiredWaiter,
        base: Addr,
        size: u64,
        flags: WiredWaitFlags,
    ) -> bool {
        let id = self.id;
        let ignore_write = flags.contains(WiredWaitFlags::IGNORE_WRITE_WIRED_RANGES);
        let ranges = self.ranges_mut(locker);
        let found = ranges
            .ranges
            .iter_mut()
            .map(|(_, range)| range)
            .filter(|range| !(ignore_write && range.writable))
            .find(|range| range.intersects_with(base, size));
        let Some(range) = found else {
            return false;
        };
        Self::attach_waiter(id, range, waiter, base, size);
        true
    }

    fn attach_waiter(area: AreaId, range: &mut WiredRange, waiter: &mut UnwiredWaiter, base: Addr, size: u64) {
        waiter.area = Some(area);
        waiter.base = base;
        waiter.size = size;
        waiter.condition.init(area.0 as u64, "area unwired");
        waiter.condition.add(&waiter.entry);
        range.waiters.push(Arc::clone(&waiter.condition));
    }
}

impl fmt::Debug for VmArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (base, size) = *self.base.lock();
        f.debug_struct("VmArea")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("base", &format_args!("{:#x}", base))
            .field("size", &format_args!("{:#x}", size))
            .field("wiring", &self.wiring)
            .finish()
    }
}

/// Page-align `size` upwards
pub fn page_align(size: u64) -> u64 {
    (size + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    fn area(wiring: Wiring, kernel: bool) -> VmArea {
        let spec = AreaSpec {
            name: "test area",
            address_space: TeamId(2),
            kernel,
            base: 0x1000,
            size: 0x4000,
            protection: Protection::READ | Protection::WRITE,
            wiring,
            memory_type: MemoryType::default(),
            cache_offset: 0,
        };
        VmArea::new(AreaId(1), &spec, VmCache::new(CacheType::Ram, true))
    }

    fn locker(area: &VmArea) -> CacheLocker {
        CacheLocker::lock(area.cache().clone())
    }

    #[test]
    fn test_wire_and_unwire() {
        let area = area(Wiring::NoLock, false);
        let locker = locker(&area);

        let id = area.wire(&locker, WiredRange::new(0x1000, 0x1000, true, false));
        assert!(area.is_wired(&locker));
        assert!(area.is_wired_range(&locker, 0x1800, 0x100));
        assert!(!area.is_wired_range(&locker, 0x2000, 0x1000));

        let range = area.unwire(&locker, id);
        assert_eq!(range.area(), None);
        assert!(!area.is_wired_range(&locker, 0x1000, 0x1000));
    }

    #[test]
    fn test_unwire_implicit_matches_exactly() {
        let area = area(Wiring::NoLock, false);
        let locker = locker(&area);
        area.wire(&locker, WiredRange::new(0x1000, 0x1000, false, true));
        area.wire(&locker, WiredRange::new(0x1000, 0x1000, true, true));

        let range = area.unwire_implicit(&locker, 0x1000, 0x1000, true);
        assert!(range.writable);
        assert_eq!(area.wired_range_count(&locker), 1);
    }

    #[test]
    #[should_panic(expected = "no such range")]
    fn test_unwire_implicit_without_match_is_fatal() {
        let area = area(Wiring::NoLock, false);
        let locker = locker(&area);
        area.wire(&locker, WiredRange::new(0x1000, 0x1000, true, true));
        area.unwire_implicit(&locker, 0x1800, 0x1000, true);
    }

    #[test]
    #[should_panic(expected = "top cache lock")]
    fn test_foreign_cache_locker_is_fatal() {
        let area = area(Wiring::NoLock, false);
        let other = CacheLocker::lock(VmCache::new(CacheType::Ram, true));
        area.is_wired(&other);
    }

    #[test]
    fn test_waiters_notified_on_unwire() {
        let area = area(Wiring::NoLock, false);
        let locker = locker(&area);
        let mut early = UnwiredWaiter::new();
        assert!(!area.add_waiter_if_wired(&locker, &mut early));

        let id = area.wire(&locker, WiredRange::new(0x2000, 0x1000, true, false));
        let mut whole = UnwiredWaiter::new();
        let mut span = UnwiredWaiter::new();
        assert!(area.add_waiter_if_wired(&locker, &mut whole));
        assert!(area.add_waiter_if_wired_range(&locker, &mut span, 0x2800, 0x100, WiredWaitFlags::empty()));
        assert_eq!(whole.target(), Some((AreaId(1), 0x1000, 0x4000)));
        assert!(!whole.is_notified());

        let range = area.unwire(&locker, id);
        assert_eq!(range.waiter_count(), 0);
        assert!(whole.is_notified());
        assert!(span.is_notified());
        assert_eq!(span.wait(Timeout::Infinite), Ok(()));
    }

    #[test]
    fn test_waiter_can_ignore_write_wired_ranges() {
        let area = area(Wiring::NoLock, false);
        let locker = locker(&area);
        area.wire(&locker, WiredRange::new(0x1000, 0x2000, true, false));

        let mut waiter = UnwiredWaiter::new();
        assert!(!area.add_waiter_if_wired_range(
            &locker,
            &mut waiter,
            0x1000,
            0x1000,
            WiredWaitFlags::IGNORE_WRITE_WIRED_RANGES
        ));
        assert!(area.add_waiter_if_wired_range(&locker, &mut waiter, 0x1000, 0x1000, WiredWaitFlags::empty()));
    }

    #[test]
    fn test_intersection_near_top_of_address_space() {
        let top = WiredRange::new(u64::MAX - 0xfff, 0x1000, true, false);
        assert!(top.intersects_with(u64::MAX - 0x7ff, 0x1000));
        assert!(top.intersects_with(0, u64::MAX));
        assert!(!top.intersects_with(0x1000, 0x1000));
        assert!(!top.intersects_with(u64::MAX - 0xfff, 0));

        let low = WiredRange::new(0x1000, 0x1000, false, false);
        assert!(!low.intersects_with(u64::MAX - 0xfff, 0x2000));
        assert!(low.intersects_with(0x1fff, 1));
        assert!(!low.intersects_with(0x2000, 1));
    }

    #[test]
    fn test_wired_range_debug() {
        let area = area(Wiring::NoLock, false);
        let locker = locker(&area);
        let id = area.wire(&locker, WiredRange::new(0x1000, 0x1000, true, false));
        let mut waiter = UnwiredWaiter::new();
        assert!(area.add_waiter_if_wired(&locker, &mut waiter));

        let range = area.unwire(&locker, id);
        let text = format!("{:?}", range);
        assert!(text.starts_with("WiredRange"));
        assert!(text.contains("base: 4096"));
        assert!(text.contains("waiters: 0"));
    }

    #[test]
    fn test_page_protections() {
        let user = area(Wiring::NoLock, false);
        assert_eq!(user.page_protection(0x2000), Protection::READ | Protection::WRITE);

        user.set_page_protection(0x2000, Protection::READ);
        assert_eq!(
            user.page_protection(0x2000),
            Protection::READ | Protection::KERNEL_READ
        );
        assert_eq!(
            user.page_protection(0x3000),
            Protection::READ | Protection::WRITE | Protection::KERNEL_READ | Protection::KERNEL_WRITE
        );

        let kernel = area(Wiring::FullLock, true);
        kernel.allocate_page_protections();
        assert_eq!(
            kernel.page_protection(0x1000),
            Protection::KERNEL_READ | Protection::KERNEL_WRITE
        );
    }

    #[test]
    fn test_geometry() {
        let area = area(Wiring::NoLock, false);
        assert!(area.contains_address(0x4fff));
        assert!(!area.contains_address(0x5000));
        area.set_size(0x1000);
        assert_eq!(area.end(), 0x2000);
        assert_eq!(page_align(0x1001), 0x2000);
        assert!(Wiring::NoLock.tracks_mappings());
        assert!(!Wiring::FullLock.tracks_mappings());
    }
}
