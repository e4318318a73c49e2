//! Virtual memory core
//!
//! Areas and their wired ranges, the global area registry, address spaces,
//! translation maps with the generic unmap bookkeeping, and the page and
//! cache records those operate on.

pub mod address_space;
pub mod area;
pub mod areas;
pub mod cache;
pub mod page;
pub mod soft_map;
pub mod translation_map;

pub use address_space::VmAddressSpace;
pub use area::{AreaSpec, MemoryType, Protection, UnwiredWaiter, VmArea, WiredRange, Wiring};
pub use areas::VmAreas;
pub use cache::{CacheLocker, CacheType, VmCache};
pub use page::{PageState, PageStore, PhysicalPageService, VmPage};
pub use soft_map::SoftTranslationMap;
pub use translation_map::{map_page, PageFlags, TranslationMap, TranslationMapBase};
