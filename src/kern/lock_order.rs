//! Lock hierarchy
//!
//! Blocking locks carry a [`LockClass`]. A context may only block on a
//! lock whose class is not lower than any class it already holds:
//!
//! ```text
//! ProcessGroup < Team < Session < Thread < AddressSpace < Cache
//!     < TranslationMap < OrphanedCheck
//! ```
//!
//! Equal classes are allowed because a parent team is locked before its
//! child. Non-blocking attempts (`try_lock`) are exempt; they are how the
//! composite lockers take a lock against the hierarchy without deadlock.
//!
//! The checker runs on hosts (`std`) in debug builds, or whenever the
//! `lock_order_check` feature is on. Elsewhere every hook is a no-op.

/// Position of a lock in the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockClass {
    ProcessGroup = 0,
    Team = 1,
    Session = 2,
    Thread = 3,
    AddressSpace = 4,
    Cache = 5,
    TranslationMap = 6,
    OrphanedCheck = 7,
}

#[cfg(any(test, feature = "std"))]
mod checker {
    use super::LockClass;
    use crate::config::MAX_HELD_LOCKS;
    use core::cell::RefCell;
    use core::sync::atomic::{AtomicBool, Ordering};
    use heapless::Vec;

    pub static ENABLED: AtomicBool =
        AtomicBool::new(cfg!(any(debug_assertions, feature = "lock_order_check")));

    std::thread_local! {
        static HELD: RefCell<Vec<LockClass, MAX_HELD_LOCKS>> = const { RefCell::new(Vec::new()) };
    }

    fn push(held: &mut Vec<LockClass, MAX_HELD_LOCKS>, class: LockClass) {
        if held.push(class).is_err() {
            crate::kernel_panic!("lock order: more than {} locks held", MAX_HELD_LOCKS);
        }
    }

    pub fn will_block_on(class: LockClass) {
        if !ENABLED.load(Ordering::Relaxed) {
            return;
        }
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(highest) = held.iter().max().copied() {
                if class < highest {
                    crate::kernel_panic!(
                        "lock order violation: acquiring {:?} while holding {:?}",
                        class,
                        highest
                    );
                }
            }
            push(&mut held, class);
        });
    }

    pub fn acquired_without_blocking(class: LockClass) {
        if !ENABLED.load(Ordering::Relaxed) {
            return;
        }
        HELD.with(|held| push(&mut held.borrow_mut(), class));
    }

    pub fn released(class: LockClass) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(index) = held.iter().rposition(|&c| c == class) {
                held.remove(index);
            }
        });
    }

    pub fn held() -> Vec<LockClass, MAX_HELD_LOCKS> {
        HELD.with(|held| held.borrow().clone())
    }
}

/// Record a blocking acquisition, halting on an inversion
#[inline]
pub fn will_block_on(class: LockClass) {
    #[cfg(any(test, feature = "std"))]
    checker::will_block_on(class);
    #[cfg(not(any(test, feature = "std")))]
    let _ = class;
}

/// Record a successful non-blocking acquisition
#[inline]
pub fn acquired_without_blocking(class: LockClass) {
    #[cfg(any(test, feature = "std"))]
    checker::acquired_without_blocking(class);
    #[cfg(not(any(test, feature = "std")))]
    let _ = class;
}

/// Record a release; locks may be released in any order
#[inline]
pub fn released(class: LockClass) {
    #[cfg(any(test, feature = "std"))]
    checker::released(class);
    #[cfg(not(any(test, feature = "std")))]
    let _ = class;
}

/// Turn the checker on or off for every context
#[cfg(any(test, feature = "std"))]
pub fn set_enabled(enabled: bool) {
    checker::ENABLED.store(enabled, core::sync::atomic::Ordering::Relaxed);
}

/// Classes currently held by the calling context, oldest first
#[cfg(any(test, feature = "std"))]
pub fn held_classes() -> heapless::Vec<LockClass, { crate::config::MAX_HELD_LOCKS }> {
    checker::held()
}
