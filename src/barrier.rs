use std::cell::UnsafeCell;

use parking_lot::{lock_api::RawMutex, RawMutex as Lock};

use crate::api::ObjectRef;

/// Remembered set populated by mutator write barriers: mature objects that
/// may hold references into the young generation.
///
/// Mutator threads push between collections under the lock; the collector
/// consumes the whole set in one swap at the start of a pause. Entries
/// removed with [`unremember`](WriteBarrier::unremember) leave a null
/// tombstone behind so removal never has to compact the buffer.
pub struct WriteBarrier {
    lock: Lock,
    set: UnsafeCell<Vec<ObjectRef>>,
}

unsafe impl Send for WriteBarrier {}
unsafe impl Sync for WriteBarrier {}

impl WriteBarrier {
    pub fn new() -> Self {
        Self {
            lock: Lock::INIT,
            set: UnsafeCell::new(Vec::new()),
        }
    }

    /// Records `obj` as a possible mature-to-young source. The header's
    /// remember bit keeps the set free of duplicates.
    pub fn remember(&self, obj: ObjectRef) {
        if !obj.is_reference() {
            return;
        }
        unsafe {
            let header = obj.header();
            if (*header).is_remembered() {
                return;
            }
            (*header).set_remember();
            self.lock.lock();
            (*self.set.get()).push(obj);
            self.lock.unlock();
        }
    }

    /// Drops `obj` from the set, leaving a null tombstone in its slot.
    pub fn unremember(&self, obj: ObjectRef) {
        if !obj.is_reference() {
            return;
        }
        unsafe {
            self.lock.lock();
            for slot in (*self.set.get()).iter_mut() {
                if *slot == obj {
                    *slot = ObjectRef::null();
                }
            }
            (*obj.header()).clear_remember();
            self.lock.unlock();
        }
    }

    /// Replaces the buffer with a fresh empty one and hands the old buffer
    /// to the caller. The mutator is at a safepoint, so the single
    /// publication point under the lock is all the atomicity required.
    pub fn swap_remember_set(&self) -> Vec<ObjectRef> {
        unsafe {
            self.lock.lock();
            let set = std::mem::take(&mut *self.set.get());
            self.lock.unlock();
            set
        }
    }

    pub fn len(&self) -> usize {
        unsafe {
            self.lock.lock();
            let len = (*self.set.get()).len();
            self.lock.unlock();
            len
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WriteBarrier {
    fn default() -> Self {
        Self::new()
    }
}
