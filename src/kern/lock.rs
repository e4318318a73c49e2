//! Locking Primitives
//!
//! Provides:
//! - Simple spin locks for short critical sections ([`SimpleLock`], [`SpinLock`])
//! - Read/write spin locks for the global registries ([`RwLock`], [`RwSpinLock`])
//! - A sequence lock for data read far more often than written ([`SeqLock`])
//! - Blocking mutexes that take part in the lock hierarchy ([`Mutex`])
//! - Recursive locks owned by an execution context ([`RecursiveLock`])
//!
//! Spin locks are leaves: nothing blocking may be acquired while one is
//! held. Blocking locks report to [`super::lock_order`] and must be taken
//! in ascending [`LockClass`] order.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};

use super::cpu::{self, ContextId, Timeout, NO_CONTEXT};
use super::lock_order::{self, LockClass};
use crate::types::Result;

// ============================================================================
// Simple Lock (Spin Lock)
// ============================================================================

/// A simple spin lock
///
/// This is the basic locking primitive. It spins waiting for the lock
/// to become available. Should only be used for very short critical sections.
#[repr(C)]
pub struct SimpleLock {
    lock_data: AtomicBool,
}

impl fmt::Debug for SimpleLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl SimpleLock {
    /// Create a new unlocked simple lock
    pub const fn new() -> Self {
        Self {
            lock_data: AtomicBool::new(false),
        }
    }

    /// Acquire the lock, spinning until available
    pub fn lock(&self) {
        while self
            .lock_data
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.lock_data.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Release the lock
    pub fn unlock(&self) {
        self.lock_data.store(false, Ordering::Release);
    }

    /// Try to acquire the lock without blocking
    pub fn try_lock(&self) -> bool {
        self.lock_data
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Check if the lock is held
    pub fn is_locked(&self) -> bool {
        self.lock_data.load(Ordering::Relaxed)
    }
}

impl Default for SimpleLock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Spin Lock with Data
// ============================================================================

/// A spin lock that protects data
pub struct SpinLock<T> {
    inner: spin::Mutex<T>,
}

pub type SpinLockGuard<'a, T> = spin::MutexGuard<'a, T>;

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: spin::Mutex::new(data),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.inner.try_lock()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("SpinLock").field("data", &*guard).finish(),
            None => f.write_str("SpinLock { <locked> }"),
        }
    }
}

// ============================================================================
// Read/Write Lock
// ============================================================================

const LOCK_FREE: u32 = 0;
const LOCK_WRITE: u32 = 0x8000_0000;
const LOCK_READ_MASK: u32 = 0x7FFF_FFFF;

/// A read/write spin lock
///
/// Allows multiple concurrent readers or a single writer. A waiting
/// writer keeps new readers out so writers cannot starve.
#[repr(C)]
pub struct RwLock {
    /// High bit = write lock, low 31 bits = reader count
    state: AtomicU32,

    /// Writers waiting for the lock
    want_write: AtomicU32,

    /// Interlock for modifying the lock state
    interlock: SimpleLock,
}

impl RwLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(LOCK_FREE),
            want_write: AtomicU32::new(0),
            interlock: SimpleLock::new(),
        }
    }

    /// Acquire for writing (exclusive access)
    pub fn write(&self) {
        self.want_write.fetch_add(1, Ordering::AcqRel);
        self.interlock.lock();

        loop {
            if self.state.load(Ordering::Relaxed) == LOCK_FREE {
                self.state.store(LOCK_WRITE, Ordering::Release);
                self.want_write.fetch_sub(1, Ordering::AcqRel);
                self.interlock.unlock();
                return;
            }

            self.interlock.unlock();
            while self.state.load(Ordering::Relaxed) != LOCK_FREE {
                core::hint::spin_loop();
            }
            self.interlock.lock();
        }
    }

    /// Acquire for reading (shared access)
    pub fn read(&self) {
        self.interlock.lock();

        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & LOCK_WRITE == 0 && self.want_write.load(Ordering::Relaxed) == 0 {
                self.state.fetch_add(1, Ordering::AcqRel);
                self.interlock.unlock();
                return;
            }

            self.interlock.unlock();
            while self.state.load(Ordering::Relaxed) & LOCK_WRITE != 0
                || self.want_write.load(Ordering::Relaxed) != 0
            {
                core::hint::spin_loop();
            }
            self.interlock.lock();
        }
    }

    /// Release the lock (works for both read and write)
    pub fn done(&self) {
        self.interlock.lock();

        let state = self.state.load(Ordering::Relaxed);
        if state & LOCK_WRITE != 0 {
            self.state.store(LOCK_FREE, Ordering::Release);
        } else if state > 0 {
            self.state.fetch_sub(1, Ordering::AcqRel);
        }

        self.interlock.unlock();
    }

    /// Try to acquire for writing without blocking
    pub fn try_write(&self) -> bool {
        if !self.interlock.try_lock() {
            return false;
        }

        let acquired = self.state.load(Ordering::Relaxed) == LOCK_FREE;
        if acquired {
            self.state.store(LOCK_WRITE, Ordering::Release);
        }
        self.interlock.unlock();
        acquired
    }

    /// Try to acquire for reading without blocking
    pub fn try_read(&self) -> bool {
        if !self.interlock.try_lock() {
            return false;
        }

        let state = self.state.load(Ordering::Relaxed);
        let acquired = state & LOCK_WRITE == 0 && self.want_write.load(Ordering::Relaxed) == 0;
        if acquired {
            self.state.fetch_add(1, Ordering::AcqRel);
        }
        self.interlock.unlock();
        acquired
    }

    /// Current reader count
    pub fn read_count(&self) -> u32 {
        self.state.load(Ordering::Relaxed) & LOCK_READ_MASK
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & LOCK_WRITE != 0
    }

    pub fn is_read_locked(&self) -> bool {
        let state = self.state.load(Ordering::Relaxed);
        state != LOCK_FREE && state & LOCK_WRITE == 0
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A read/write spin lock that protects data
///
/// Used for the global registries: lookups take it shared, insertion and
/// removal take it exclusive.
pub struct RwSpinLock<T> {
    inner: spin::RwLock<T>,
}

pub type ReadLockGuard<'a, T> = spin::RwLockReadGuard<'a, T>;
pub type WriteLockGuard<'a, T> = spin::RwLockWriteGuard<'a, T>;

impl<T> RwSpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: spin::RwLock::new(data),
        }
    }

    pub fn read(&self) -> ReadLockGuard<'_, T> {
        self.inner.read()
    }

    pub fn write(&self) -> WriteLockGuard<'_, T> {
        self.inner.write()
    }

    pub fn try_read(&self) -> Option<ReadLockGuard<'_, T>> {
        self.inner.try_read()
    }

    pub fn try_write(&self) -> Option<WriteLockGuard<'_, T>> {
        self.inner.try_write()
    }

    pub fn reader_count(&self) -> usize {
        self.inner.reader_count()
    }
}

impl<T: Default> Default for RwSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

// ============================================================================
// Sequence Lock
// ============================================================================

/// A sequence lock around a `Copy` value
///
/// Writers serialize on an internal spin lock and bump the sequence
/// before and after the update. Readers never block writers; they retry
/// until they observe the same even sequence on both sides of the read.
pub struct SeqLock<T: Copy> {
    sequence: AtomicU32,
    writer: SimpleLock,
    data: UnsafeCell<T>,
}

impl<T: Copy> SeqLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            sequence: AtomicU32::new(0),
            writer: SimpleLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Update the value
    pub fn write(&self, update: impl FnOnce(&mut T)) {
        self.writer.lock();
        self.sequence.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);

        update(unsafe { &mut *self.data.get() });

        self.sequence.fetch_add(1, Ordering::Release);
        self.writer.unlock();
    }

    /// Read a consistent snapshot
    pub fn read(&self) -> T {
        loop {
            let before = self.sequence.load(Ordering::Acquire);
            if before & 1 != 0 {
                core::hint::spin_loop();
                continue;
            }

            let value = unsafe { core::ptr::read_volatile(self.data.get()) };
            fence(Ordering::Acquire);

            if self.sequence.load(Ordering::Relaxed) == before {
                return value;
            }
        }
    }

    /// Number of completed writes
    pub fn writes(&self) -> u32 {
        self.sequence.load(Ordering::Relaxed) / 2
    }
}

impl<T: Copy + Default> Default for SeqLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

unsafe impl<T: Copy + Send> Send for SeqLock<T> {}
unsafe impl<T: Copy + Send> Sync for SeqLock<T> {}

// ============================================================================
// Mutex (blocking, ordered)
// ============================================================================

/// A blocking mutex owned by an execution context
///
/// Waiters back off with [`cpu::relax`]. Blocking acquisitions are
/// checked against the lock hierarchy; re-locking by the holder is fatal.
///
/// Besides the guard API, the raw `raw_lock`/`raw_unlock` pair lets the
/// composite lockers hold several object locks across a retry loop.
pub struct Mutex<T> {
    class: LockClass,
    name: &'static str,
    holder: AtomicU64,
    data: UnsafeCell<T>,
}

impl<T> Mutex<T> {
    pub const fn new(class: LockClass, name: &'static str, data: T) -> Self {
        Self {
            class,
            name,
            holder: AtomicU64::new(NO_CONTEXT),
            data: UnsafeCell::new(data),
        }
    }

    pub fn class(&self) -> LockClass {
        self.class
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn try_claim(&self, context: ContextId) -> bool {
        self.holder
            .compare_exchange(NO_CONTEXT, context, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquire, blocking until available
    pub fn raw_lock(&self) {
        let context = cpu::current_context();
        if self.holder.load(Ordering::Relaxed) == context {
            crate::kernel_panic!("mutex \"{}\": recursive lock", self.name);
        }

        lock_order::will_block_on(self.class);
        while !self.try_claim(context) {
            cpu::relax();
        }
    }

    /// Acquire without blocking; exempt from the hierarchy check
    pub fn raw_try_lock(&self) -> bool {
        let acquired = self.try_claim(cpu::current_context());
        if acquired {
            lock_order::acquired_without_blocking(self.class);
        }
        acquired
    }

    /// Acquire, giving up at the timeout
    pub fn raw_lock_with_timeout(&self, timeout: Timeout) -> Result<()> {
        let context = cpu::current_context();
        if self.try_claim(context) {
            lock_order::acquired_without_blocking(self.class);
            return Ok(());
        }
        if timeout.is_poll() {
            return Err(timeout.expired_error());
        }

        let deadline = timeout.deadline();
        lock_order::will_block_on(self.class);
        loop {
            if self.try_claim(context) {
                return Ok(());
            }
            if let Err(error) = cpu::check_deadline(deadline, timeout) {
                lock_order::released(self.class);
                return Err(error);
            }
            cpu::relax();
        }
    }

    /// Release a lock taken with one of the raw acquire calls
    ///
    /// # Safety
    ///
    /// The calling context must hold the lock and must not use any
    /// reference obtained from [`Mutex::data_ptr`] afterwards.
    pub unsafe fn raw_unlock(&self) {
        if self.holder.load(Ordering::Relaxed) != cpu::current_context() {
            crate::kernel_panic!("mutex \"{}\": unlocked by a context that does not hold it", self.name);
        }
        self.holder.store(NO_CONTEXT, Ordering::Release);
        lock_order::released(self.class);
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw_lock();
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.raw_try_lock().then(|| MutexGuard { mutex: self })
    }

    pub fn lock_with_timeout(&self, timeout: Timeout) -> Result<MutexGuard<'_, T>> {
        self.raw_lock_with_timeout(timeout)?;
        Ok(MutexGuard { mutex: self })
    }

    pub fn is_locked(&self) -> bool {
        self.holder.load(Ordering::Relaxed) != NO_CONTEXT
    }

    pub fn is_locked_by_current(&self) -> bool {
        self.holder.load(Ordering::Relaxed) == cpu::current_context()
    }

    /// Pointer to the protected data; dereference only while holding the lock
    pub fn data_ptr(&self) -> *mut T {
        self.data.get()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("holder", &self.holder.load(Ordering::Relaxed))
            .finish()
    }
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

/// RAII guard for a [`Mutex`]
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.mutex.raw_unlock() }
    }
}

// ============================================================================
// Recursive Lock
// ============================================================================

/// A lock the holding context may re-acquire
///
/// Only the first acquisition is checked against the hierarchy; only the
/// final release gives the lock up.
pub struct RecursiveLock {
    class: LockClass,
    name: &'static str,
    holder: AtomicU64,
    recursion: AtomicU32,
}

impl RecursiveLock {
    pub const fn new(class: LockClass, name: &'static str) -> Self {
        Self {
            class,
            name,
            holder: AtomicU64::new(NO_CONTEXT),
            recursion: AtomicU32::new(0),
        }
    }

    pub fn lock(&self) {
        let context = cpu::current_context();
        if self.holder.load(Ordering::Relaxed) == context {
            self.recursion.fetch_add(1, Ordering::Relaxed);
            return;
        }

        lock_order::will_block_on(self.class);
        while self
            .holder
            .compare_exchange(NO_CONTEXT, context, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            cpu::relax();
        }
        self.recursion.store(1, Ordering::Relaxed);
    }

    pub fn try_lock(&self) -> bool {
        let context = cpu::current_context();
        if self.holder.load(Ordering::Relaxed) == context {
            self.recursion.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let acquired = self
            .holder
            .compare_exchange(NO_CONTEXT, context, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        if acquired {
            self.recursion.store(1, Ordering::Relaxed);
            lock_order::acquired_without_blocking(self.class);
        }
        acquired
    }

    pub fn unlock(&self) {
        if !self.is_locked_by_current() {
            crate::kernel_panic!(
                "recursive lock \"{}\": unlocked by a context that does not hold it",
                self.name
            );
        }
        if self.recursion.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.holder.store(NO_CONTEXT, Ordering::Release);
            lock_order::released(self.class);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.holder.load(Ordering::Relaxed) != NO_CONTEXT
    }

    pub fn is_locked_by_current(&self) -> bool {
        self.holder.load(Ordering::Relaxed) == cpu::current_context()
    }

    /// Acquisition depth of the holder, zero when free
    pub fn recursion(&self) -> u32 {
        if self.is_locked_by_current() {
            self.recursion.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for RecursiveLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecursiveLock")
            .field("name", &self.name)
            .field("holder", &self.holder.load(Ordering::Relaxed))
            .field("recursion", &self.recursion.load(Ordering::Relaxed))
            .finish()
    }
}

/// RAII holder for a [`RecursiveLock`]
///
/// [`RecursiveLocker::detach`] hands the pending unlock to someone else,
/// e.g. a callee that releases the lock itself.
pub struct RecursiveLocker<'a> {
    lock: Option<&'a RecursiveLock>,
}

impl<'a> RecursiveLocker<'a> {
    pub fn new(lock: &'a RecursiveLock) -> Self {
        lock.lock();
        Self { lock: Some(lock) }
    }

    pub fn detach(mut self) {
        self.lock = None;
    }

    pub fn unlock(mut self) {
        if let Some(lock) = self.lock.take() {
            lock.unlock();
        }
    }
}

impl Drop for RecursiveLocker<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.unlock();
        }
    }
}
