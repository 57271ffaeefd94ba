use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use super::collection::Collection;

/// Two collections: one receives writes while the other is drained.
///
/// The persistence side calls [`Window::try_switch_pointer`], flips the
/// pointer, reads [`Window::last`] and finally [`Window::finish_reading_last`].
/// A switch is refused while the collection it would vacate into is still
/// being read, so a drained generation is never overwritten mid-read.
pub struct Window<C: Collection> {
    slots: [Mutex<C>; 2],
    pointer: AtomicUsize,
    switching: AtomicBool,
}

impl<C: Collection> Window<C> {
    /// Builds both collections with `make`.
    pub fn new(make: impl Fn() -> C) -> Self {
        Self {
            slots: [Mutex::new(make()), Mutex::new(make())],
            pointer: AtomicUsize::new(0),
            switching: AtomicBool::new(false),
        }
    }

    /// Locks the current collection for writing.
    ///
    /// The pointer is re-checked after the lock is taken: a writer that raced
    /// a switch retries against the new current collection instead of
    /// writing into the vacated one.
    pub fn start_writing(&self) -> WriteGuard<'_, C> {
        loop {
            let idx = self.pointer.load(Ordering::Acquire);
            let mut guard = self.slots[idx].lock();
            if self.pointer.load(Ordering::Acquire) == idx {
                guard.set_writing(true);
                return WriteGuard { guard };
            }
        }
    }

    /// Writes one item into the current collection.
    pub fn put(&self, item: C::Item) {
        self.start_writing().put(item);
    }

    /// Claims the right to switch.
    ///
    /// Returns `None` when another switch is in flight or the collection that
    /// would become `last` is still being read. Dropping the guard without
    /// switching releases the claim.
    pub fn try_switch_pointer(&self) -> Option<SwitchGuard<'_, C>> {
        if self
            .switching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let guard = SwitchGuard { window: self };
        if self.slots[self.last_index()].lock().is_reading() {
            return None;
        }

        Some(guard)
    }

    /// Locks the collection most recently switched out.
    pub fn last(&self) -> MutexGuard<'_, C> {
        self.slots[self.last_index()].lock()
    }

    /// Clears the last collection and marks it idle.
    pub fn finish_reading_last(&self) {
        let mut last = self.last();
        last.clear();
        last.set_reading(false);
    }

    /// Number of items in the current collection.
    pub fn current_size(&self) -> usize {
        self.slots[self.pointer.load(Ordering::Acquire)].lock().size()
    }

    fn last_index(&self) -> usize {
        1 - self.pointer.load(Ordering::Acquire)
    }
}

/// Exclusive write access to the current collection.
pub struct WriteGuard<'a, C: Collection> {
    guard: MutexGuard<'a, C>,
}

impl<C: Collection> WriteGuard<'_, C> {
    pub fn put(&mut self, item: C::Item) {
        self.guard.put(item);
    }
}

impl<C: Collection> Deref for WriteGuard<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.guard
    }
}

impl<C: Collection> DerefMut for WriteGuard<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.guard
    }
}

impl<C: Collection> Drop for WriteGuard<'_, C> {
    fn drop(&mut self) {
        self.guard.set_writing(false);
    }
}

/// A granted switch claim; released on drop.
pub struct SwitchGuard<'a, C: Collection> {
    window: &'a Window<C>,
}

impl<C: Collection> SwitchGuard<'_, C> {
    /// Flips the pointer and marks the vacated collection as being read.
    ///
    /// Waits for an in-flight writer on the vacated collection to finish
    /// before marking it.
    pub fn switch_pointer(&self) {
        let vacated = self.window.pointer.load(Ordering::Acquire);
        self.window.pointer.store(1 - vacated, Ordering::Release);
        self.window.slots[vacated].lock().set_reading(true);
    }
}

impl<C: Collection> Drop for SwitchGuard<'_, C> {
    fn drop(&mut self) {
        self.window.switching.store(false, Ordering::Release);
    }
}
