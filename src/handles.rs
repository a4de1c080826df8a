use std::ptr::NonNull;

use crossbeam_utils::atomic::AtomicCell;

use crate::api::ObjectRef;

const IN_USE: u8 = 1 << 0;
const WEAK: u8 = 1 << 1;
const RDATA: u8 = 1 << 2;
const VALID: u8 = 1 << 3;

/// A persistent reference exported to foreign code.
///
/// Foreign code reads and writes the target slot between collections while
/// the collector rewrites it during the pause, so the slot is an atomic
/// cell. Strong handles pin their target; weak handles do not. A handle
/// flagged `rdata` fronts a mature object carrying a foreign payload that
/// the owner mutates without write barriers.
pub struct Handle {
    object: AtomicCell<ObjectRef>,
    flags: AtomicCell<u8>,
}

impl Handle {
    fn new(object: ObjectRef, flags: u8) -> Self {
        Self {
            object: AtomicCell::new(object),
            flags: AtomicCell::new(flags | IN_USE | VALID),
        }
    }

    pub fn object(&self) -> ObjectRef {
        self.object.load()
    }
    pub fn set_object(&self, obj: ObjectRef) {
        self.object.store(obj);
    }

    pub fn is_in_use(&self) -> bool {
        self.flags.load() & IN_USE != 0
    }
    pub fn is_weak(&self) -> bool {
        self.flags.load() & WEAK != 0
    }
    pub fn is_rdata(&self) -> bool {
        self.flags.load() & RDATA != 0
    }
    pub fn is_valid(&self) -> bool {
        self.flags.load() & VALID != 0
    }

    /// Marks the handle as carrying a foreign payload. From now on its
    /// mature target is rescanned on every collection.
    pub fn set_rdata(&self) {
        self.flags.store(self.flags.load() | RDATA);
    }

    /// Releases the handle. The slot stays allocated but is skipped by
    /// collection walks and reported as bad if still referenced globally.
    pub fn free(&self) {
        self.flags.store(self.flags.load() & !(IN_USE | VALID));
    }
}

/// Table of all handles handed out to foreign code. Handles are boxed so
/// their addresses stay stable; foreign code stores `*mut Handle`.
pub struct HandleTable {
    handles: Vec<Box<Handle>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    pub fn allocate(&mut self, object: ObjectRef) -> NonNull<Handle> {
        self.allocate_with(object, 0)
    }

    pub fn allocate_weak(&mut self, object: ObjectRef) -> NonNull<Handle> {
        self.allocate_with(object, WEAK)
    }

    pub fn allocate_rdata(&mut self, object: ObjectRef) -> NonNull<Handle> {
        self.allocate_with(object, RDATA)
    }

    fn allocate_with(&mut self, object: ObjectRef, flags: u8) -> NonNull<Handle> {
        let mut handle = Box::new(Handle::new(object, flags));
        let ptr = NonNull::from(&mut *handle);
        self.handles.push(handle);
        ptr
    }

    pub fn iter(&self) -> impl Iterator<Item = &Handle> {
        self.handles.iter().map(|h| &**h)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A foreign-held global: a location that stores a handle pointer. The
/// collector chases the double indirection and rewrites the handle's target
/// if it moved, but never touches the location itself.
pub struct GlobalHandleLocation {
    location: *mut *mut Handle,
}

impl GlobalHandleLocation {
    /// `location` must outlive the collection that walks it.
    pub unsafe fn new(location: *mut *mut Handle) -> Self {
        Self { location }
    }

    pub fn handle(&self) -> *mut Handle {
        unsafe { *self.location }
    }

    /// Foreign code sometimes parks tagged immediates in handle slots;
    /// those are not dereferencable handle pointers.
    pub fn is_handle_pointer(ptr: *mut Handle) -> bool {
        !ptr.is_null() && ptr as usize & (std::mem::align_of::<Handle>() - 1) == 0
    }
}
