//! Reference-counted kernel objects
//!
//! A kernel object carries a [`ReferenceCount`] that governs its logical
//! lifetime: registries and other owners hold counted references, and the
//! release that takes the count from one to zero runs the object's
//! [`KernelReferenceable::last_reference_released`] hook exactly once.
//! Memory is owned separately by an `Arc`, so a weak link (`Weak<T>`) can
//! be held by parents, groups and caches without keeping the object alive
//! and without risking a dangling pointer.
//!
//! [`Reference<T>`] is the RAII handle: cloning acquires, dropping
//! releases. [`Reference::upgrade`] refuses objects whose count already
//! reached zero, so a dying object can never be resurrected from a weak
//! link or a lookup table.

use alloc::sync::{Arc, Weak};
use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::Deref;
use core::sync::atomic::{AtomicI32, Ordering};

use super::lock::Mutex;

/// The embedded counter; starts at one for the creator's reference
pub struct ReferenceCount(AtomicI32);

impl ReferenceCount {
    pub const fn new() -> Self {
        Self(AtomicI32::new(1))
    }

    /// Current count; a snapshot only
    pub fn count(&self) -> i32 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for ReferenceCount {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReferenceCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReferenceCount({})", self.count())
    }
}

/// A kernel object with a logical reference count
pub trait KernelReferenceable: Send + Sync {
    fn reference_count(&self) -> &ReferenceCount;

    /// Runs once, when the count drops from one to zero
    fn last_reference_released(&self) {}

    /// Add a reference; returns the count before the increment
    ///
    /// A previous count of zero or less means the object is already dying;
    /// the caller must treat that as a fatal misuse.
    fn acquire_reference(&self) -> i32 {
        self.reference_count().0.fetch_add(1, Ordering::AcqRel)
    }

    /// Add a reference unless the object is already dying
    fn try_acquire_reference(&self) -> bool {
        let count = &self.reference_count().0;
        let mut current = count.load(Ordering::Relaxed);
        loop {
            if current <= 0 {
                return false;
            }
            match count.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a reference; returns the count before the decrement
    fn release_reference(&self) -> i32 {
        let previous = self.reference_count().0.fetch_sub(1, Ordering::AcqRel);
        if previous <= 0 {
            crate::kernel_panic!("release_reference: object already released (count {})", previous);
        }
        if previous == 1 {
            self.last_reference_released();
        }
        previous
    }
}

/// Counted reference to a kernel object
pub struct Reference<T: KernelReferenceable> {
    object: Arc<T>,
}

impl<T: KernelReferenceable> Reference<T> {
    /// Wrap a freshly created object, adopting its initial reference
    pub fn new(object: T) -> Self {
        Self::adopt(Arc::new(object))
    }

    /// Like [`Reference::new`], handing the object a weak link to itself
    pub fn new_cyclic(build: impl FnOnce(&Weak<T>) -> T) -> Self {
        Self::adopt(Arc::new_cyclic(build))
    }

    fn adopt(object: Arc<T>) -> Self {
        let count = object.reference_count().count();
        if count != 1 {
            crate::kernel_panic!("Reference::new: fresh object has {} references", count);
        }
        Self { object }
    }

    /// Take a new reference to an object known through its `Arc`
    pub fn try_get(object: &Arc<T>) -> Option<Self> {
        object.try_acquire_reference().then(|| Self {
            object: Arc::clone(object),
        })
    }

    /// Turn a weak link into a counted reference, unless the object is dying
    pub fn upgrade(weak: &Weak<T>) -> Option<Self> {
        Self::try_get(&weak.upgrade()?)
    }

    pub fn downgrade(this: &Self) -> Weak<T> {
        Arc::downgrade(&this.object)
    }

    pub fn as_arc(this: &Self) -> &Arc<T> {
        &this.object
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.object, &b.object)
    }
}

impl<T: KernelReferenceable> Clone for Reference<T> {
    fn clone(&self) -> Self {
        let previous = self.object.acquire_reference();
        if previous <= 0 {
            crate::kernel_panic!("Reference::clone: object already released (count {})", previous);
        }
        Self {
            object: Arc::clone(&self.object),
        }
    }
}

impl<T: KernelReferenceable> Drop for Reference<T> {
    fn drop(&mut self) {
        self.object.release_reference();
    }
}

impl<T: KernelReferenceable> Deref for Reference<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.object
    }
}

impl<T: KernelReferenceable + fmt::Debug> fmt::Debug for Reference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Reference").field(&*self.object).finish()
    }
}

// ============================================================================
// Locked references
// ============================================================================

/// An object whose state lives behind a blocking [`Mutex`]
pub trait Lockable: KernelReferenceable {
    type Locked;

    fn object_lock(&self) -> &Mutex<Self::Locked>;
}

/// A counted reference whose object lock is held
///
/// Dropping it unlocks first, then releases the reference.
pub struct LockedReference<T: Lockable> {
    object: ManuallyDrop<Reference<T>>,
}

impl<T: Lockable> LockedReference<T> {
    /// Lock the object, blocking
    pub fn lock(object: Reference<T>) -> Self {
        object.object_lock().raw_lock();
        Self {
            object: ManuallyDrop::new(object),
        }
    }

    /// Lock the object without blocking, handing the reference back on failure
    pub fn try_lock(object: Reference<T>) -> core::result::Result<Self, Reference<T>> {
        if object.object_lock().raw_try_lock() {
            Ok(Self {
                object: ManuallyDrop::new(object),
            })
        } else {
            Err(object)
        }
    }

    /// Wrap an object whose lock the calling context already holds
    ///
    /// # Safety
    ///
    /// The calling context must hold `object`'s lock and give up the
    /// responsibility to unlock it.
    pub unsafe fn adopt(object: Reference<T>) -> Self {
        Self {
            object: ManuallyDrop::new(object),
        }
    }

    pub fn reference(&self) -> &Reference<T> {
        &self.object
    }

    /// Unlock, keeping the reference
    pub fn unlock(self) -> Reference<T> {
        let mut this = ManuallyDrop::new(self);
        unsafe {
            this.object.object_lock().raw_unlock();
            ManuallyDrop::take(&mut this.object)
        }
    }

    /// Give up the lock responsibility without unlocking
    pub fn detach(self) -> Reference<T> {
        let mut this = ManuallyDrop::new(self);
        unsafe { ManuallyDrop::take(&mut this.object) }
    }

    /// The locked state
    pub fn locked(&self) -> &T::Locked {
        unsafe { &*self.object.object_lock().data_ptr() }
    }

    pub fn locked_mut(&mut self) -> &mut T::Locked {
        unsafe { &mut *self.object.object_lock().data_ptr() }
    }
}

impl<T: Lockable> Deref for LockedReference<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.object
    }
}

impl<T: Lockable> Drop for LockedReference<T> {
    fn drop(&mut self) {
        unsafe {
            self.object.object_lock().raw_unlock();
            ManuallyDrop::drop(&mut self.object);
        }
    }
}
