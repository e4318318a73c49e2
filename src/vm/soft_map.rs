//! Software translation map
//!
//! A page table kept in a `BTreeMap`, for hosts without an MMU and for
//! exercising the generic unmap paths. Accessed and modified bits are set
//! through [`SoftTranslationMap::touch`], standing in for the hardware.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use super::area::{MemoryType, Protection, VmArea};
use super::page::{PageMappingsQueue, PhysicalPageService};
use super::translation_map::{PageFlags, QueryResult, TranslationMap, TranslationMapBase};
use crate::config::{PAGE_SHIFT, PAGE_SIZE};
use crate::kern::lock::SpinLock;
use crate::types::{Addr, Error, PhysAddr, Result};

#[derive(Debug, Clone, Copy)]
struct SoftEntry {
    physical_address: PhysAddr,
    protection: Protection,
    memory_type: MemoryType,
    accessed: bool,
    modified: bool,
}

impl SoftEntry {
    fn flags(&self) -> PageFlags {
        let mut flags = PageFlags::PRESENT;
        flags.set(PageFlags::ACCESSED, self.accessed);
        flags.set(PageFlags::MODIFIED, self.modified);
        flags
    }
}

/// A translation map with a software page table
pub struct SoftTranslationMap {
    base: TranslationMapBase,
    /// Keyed by page-aligned virtual address; guarded by the map lock
    entries: SpinLock<BTreeMap<Addr, SoftEntry>>,
}

fn page_address(address: Addr) -> Addr {
    address & !(PAGE_SIZE - 1)
}

impl SoftTranslationMap {
    pub fn new(pages: Arc<dyn PhysicalPageService>, kernel: bool) -> Self {
        Self {
            base: TranslationMapBase::new(pages, kernel),
            entries: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Record an access to `address`, as the MMU would
    pub fn touch(&self, address: Addr, write: bool) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&page_address(address))
            .ok_or(Error::NotMapped)?;
        entry.accessed = true;
        entry.modified |= write;
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    fn lookup(&self, address: Addr) -> QueryResult {
        match self.entries.lock().get(&page_address(address)) {
            Some(entry) => QueryResult {
                physical_address: entry.physical_address,
                flags: entry.flags(),
                protection: entry.protection,
            },
            None => QueryResult {
                physical_address: 0,
                flags: PageFlags::empty(),
                protection: Protection::empty(),
            },
        }
    }
}

impl TranslationMap for SoftTranslationMap {
    fn base(&self) -> &TranslationMapBase {
        &self.base
    }

    fn map(
        &self,
        virtual_address: Addr,
        physical_address: PhysAddr,
        protection: Protection,
        memory_type: MemoryType,
    ) -> Result<()> {
        crate::kassert!(
            self.base.is_locked_by_current(),
            "soft map: map({:#x}) without the map lock",
            virtual_address
        );
        let entry = SoftEntry {
            physical_address: page_address(physical_address),
            protection,
            memory_type,
            accessed: false,
            modified: false,
        };
        if self
            .entries
            .lock()
            .insert(page_address(virtual_address), entry)
            .is_none()
        {
            self.base.mapped();
        }
        Ok(())
    }

    fn unmap(&self, start: Addr, end: Addr) -> Result<()> {
        self.base.lock();
        let mut entries = self.entries.lock();
        let doomed: alloc::vec::Vec<Addr> = entries.range(start..end).map(|(&address, _)| address).collect();
        for address in doomed {
            entries.remove(&address);
            self.base.unmapped();
        }
        drop(entries);
        self.base.unlock();
        Ok(())
    }

    fn unmap_page(
        &self,
        area: &VmArea,
        address: Addr,
        update_page_queue: bool,
        mappings_queue: Option<&mut PageMappingsQueue>,
    ) -> Result<()> {
        crate::kassert!(
            area.contains_address(address),
            "soft map: unmap_page({:#x}) outside area {}",
            address,
            area.id()
        );
        self.base.lock();
        let Some(entry) = self.entries.lock().remove(&page_address(address)) else {
            self.base.unlock();
            return Err(Error::EntryNotFound);
        };
        self.base.unmapped();

        self.page_unmapped(
            area,
            entry.physical_address >> PAGE_SHIFT,
            entry.accessed,
            entry.modified,
            update_page_queue,
            mappings_queue,
        );
        Ok(())
    }

    fn query(&self, virtual_address: Addr) -> Result<QueryResult> {
        Ok(self.lookup(virtual_address))
    }

    fn query_interrupt(&self, virtual_address: Addr) -> Result<QueryResult> {
        Ok(self.lookup(virtual_address))
    }

    fn protect(&self, start: Addr, end: Addr, protection: Protection, memory_type: MemoryType) -> Result<()> {
        self.base.lock();
        for (_, entry) in self.entries.lock().range_mut(start..end) {
            entry.protection = protection;
            entry.memory_type = memory_type;
        }
        self.base.unlock();
        Ok(())
    }

    fn clear_flags(&self, virtual_address: Addr, flags: PageFlags) -> Result<()> {
        self.base.lock();
        if let Some(entry) = self.entries.lock().get_mut(&page_address(virtual_address)) {
            if flags.contains(PageFlags::ACCESSED) {
                entry.accessed = false;
            }
            if flags.contains(PageFlags::MODIFIED) {
                entry.modified = false;
            }
        }
        self.base.unlock();
        Ok(())
    }

    fn clear_accessed_and_modified(
        &self,
        area: &VmArea,
        address: Addr,
        unmap_if_unaccessed: bool,
    ) -> (bool, bool) {
        self.base.lock();
        let key = page_address(address);
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&key) else {
            drop(entries);
            self.base.unlock();
            return (false, false);
        };

        let (accessed, modified) = (entry.accessed, entry.modified);
        if unmap_if_unaccessed && !accessed {
            let physical_address = entry.physical_address;
            entries.remove(&key);
            drop(entries);
            self.base.unmapped();
            self.unaccessed_page_unmapped(area, physical_address >> PAGE_SHIFT);
            return (false, modified);
        }

        entry.accessed = false;
        entry.modified = false;
        drop(entries);
        self.base.unlock();
        (accessed, modified)
    }

    fn flush(&self) {
        log::trace!("soft map: flush");
    }

    fn max_pages_needed_to_map(&self, _start: Addr, _end: Addr) -> usize {
        0
    }

    fn debug_print_mapping_info(&self, virtual_address: Addr) {
        match self.entries.lock().get(&page_address(virtual_address)) {
            Some(entry) => log::info!(
                "{:#x} -> {:#x} {:?} {:?}",
                virtual_address,
                entry.physical_address,
                entry.protection,
                entry.flags()
            ),
            None => log::info!("{:#x}: not mapped", virtual_address),
        }
    }

    fn debug_get_reverse_mapping_info(
        &self,
        physical_address: PhysAddr,
        callback: &mut dyn FnMut(Addr) -> bool,
    ) -> bool {
        let target = page_address(physical_address);
        let matches: alloc::vec::Vec<Addr> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.physical_address == target)
            .map(|(&address, _)| address)
            .collect();
        matches.into_iter().any(|address| callback(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::page::PageStore;

    fn soft_map() -> SoftTranslationMap {
        SoftTranslationMap::new(Arc::new(PageStore::new()), false)
    }

    #[test]
    fn test_map_query_touch() {
        let map = soft_map();
        map.base().lock();
        map.map(0x40_1000, 0x9000, Protection::READ, MemoryType::default()).unwrap();
        map.base().unlock();
        assert_eq!(map.mapped_size(), PAGE_SIZE);

        let entry = map.query(0x40_1abc).unwrap();
        assert_eq!(entry.physical_address, 0x9000);
        assert_eq!(entry.flags, PageFlags::PRESENT);

        map.touch(0x40_1000, true).unwrap();
        let flags = map.query_interrupt(0x40_1000).unwrap().flags;
        assert!(flags.contains(PageFlags::ACCESSED | PageFlags::MODIFIED));

        map.clear_flags(0x40_1000, PageFlags::MODIFIED).unwrap();
        assert_eq!(
            map.query(0x40_1000).unwrap().flags,
            PageFlags::PRESENT | PageFlags::ACCESSED
        );
        assert_eq!(map.touch(0x50_0000, false), Err(Error::NotMapped));
        assert!(map.query(0x50_0000).unwrap().flags.is_empty());
    }

    #[test]
    fn test_unmap_and_protect_range() {
        let map = soft_map();
        map.base().lock();
        for page in 0..4u64 {
            map.map(0x1000 * (page + 1), 0x10_0000 + 0x1000 * page, Protection::READ, MemoryType::default())
                .unwrap();
        }
        map.base().unlock();

        map.protect(0x1000, 0x3000, Protection::READ | Protection::WRITE, MemoryType::Uncached)
            .unwrap();
        assert_eq!(map.query(0x2000).unwrap().protection, Protection::READ | Protection::WRITE);
        assert_eq!(map.query(0x3000).unwrap().protection, Protection::READ);

        map.unmap(0x2000, 0x4000).unwrap();
        assert_eq!(map.entry_count(), 2);
        assert_eq!(map.base().map_count(), 2);
        assert!(!map.base().is_locked_by_current());
    }

    #[test]
    fn test_reverse_mapping() {
        let map = soft_map();
        map.base().lock();
        map.map(0x1000, 0x7000, Protection::READ, MemoryType::default()).unwrap();
        map.map(0x5000, 0x7000, Protection::READ, MemoryType::default()).unwrap();
        map.base().unlock();

        let mut seen = alloc::vec::Vec::new();
        let stopped = map.debug_get_reverse_mapping_info(0x7000, &mut |address| {
            seen.push(address);
            false
        });
        assert!(!stopped);
        assert_eq!(seen, [0x1000, 0x5000]);
        assert!(map.debug_get_reverse_mapping_info(0x7000, &mut |_| true));
    }

    #[test]
    #[should_panic(expected = "without the map lock")]
    fn test_map_requires_lock() {
        let _ = soft_map().map(0x1000, 0x2000, Protection::READ, MemoryType::default());
    }
}
