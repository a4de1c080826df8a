use std::{
    any::TypeId,
    collections::HashMap,
    marker::PhantomData,
    mem::size_of,
    ops::{Deref, DerefMut},
    ptr::{null_mut, NonNull},
    sync::atomic::{AtomicU16, Ordering},
};

use modular_bitfield::prelude::*;
use parking_lot::Mutex;

/// Minimum allocation granularity. Every heap object starts at an address
/// aligned to this, which is what makes the low-bit tagging of [ObjectRef]
/// sound.
pub const MIN_ALLOCATION: usize = 8;

/// One-word tagged reference as stored in roots, object fields and handle
/// slots. Either a heap reference (aligned pointer to a [HeapObjectHeader]),
/// a fixnum immediate (low bit set), the nil sentinel, or null.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct ObjectRef(usize);

const NIL_BITS: usize = 0b110;
const FIXNUM_TAG: usize = 0b1;

impl ObjectRef {
    #[inline(always)]
    pub const fn null() -> Self {
        ObjectRef(0)
    }
    #[inline(always)]
    pub const fn nil() -> Self {
        ObjectRef(NIL_BITS)
    }
    #[inline(always)]
    pub fn fixnum(value: isize) -> Self {
        ObjectRef(((value as usize) << 1) | FIXNUM_TAG)
    }
    #[inline(always)]
    pub fn from_header(header: *mut HeapObjectHeader) -> Self {
        ObjectRef(header as usize)
    }

    /// True iff this word is a real heap reference, as opposed to a tagged
    /// immediate, nil or null.
    #[inline(always)]
    pub fn is_reference(self) -> bool {
        self.0 != 0 && self.0 & (MIN_ALLOCATION - 1) == 0
    }
    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
    #[inline(always)]
    pub fn is_nil(self) -> bool {
        self.0 == NIL_BITS
    }
    #[inline(always)]
    pub fn is_fixnum(self) -> bool {
        self.0 & FIXNUM_TAG != 0
    }
    #[inline(always)]
    pub fn as_fixnum(self) -> isize {
        (self.0 as isize) >> 1
    }

    /// The header this reference points at. Caller must have checked
    /// [`is_reference`](ObjectRef::is_reference).
    #[inline(always)]
    pub fn header(self) -> *mut HeapObjectHeader {
        debug_assert!(self.is_reference());
        self.0 as *mut HeapObjectHeader
    }
    #[inline(always)]
    pub fn raw(self) -> usize {
        self.0
    }
}

impl std::fmt::Pointer for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:p}", self.0 as *const u8)
    }
}

// Header state is packed into two 64 bit words:
//
// word 0: | vtable or forwarding address (48) | forwarded (1) | remember (1) | age (3) | unused |
// word 1: | size in bytes (32) | type id (16) | unused (16) |
//
// The vtable bits are overwritten by the forwarding address on evacuation,
// which is why the size lives in the second word: it must stay readable
// between evacuating an object and scanning its copy.
#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
struct HeaderWord {
    vtable: B48,
    forwarded: bool,
    remember: bool,
    age: B3,
    #[skip]
    __: B11,
}

#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
struct MetaWord {
    size: B32,
    type_id: B16,
    #[skip]
    __: B16,
}

/// Per-object metadata, prepended to every heap allocation.
#[repr(C)]
pub struct HeapObjectHeader {
    word: HeaderWord,
    meta: MetaWord,
}

impl HeapObjectHeader {
    pub(crate) fn init(&mut self, vtable: usize, size: usize, type_id: u16) {
        self.word = HeaderWord::new().with_vtable(vtable as u64);
        self.meta = MetaWord::new()
            .with_size(size as u32)
            .with_type_id(type_id);
    }

    #[inline(always)]
    pub fn vtable(&self) -> usize {
        self.word.vtable() as usize
    }

    #[inline(always)]
    pub fn is_forwarded(&self) -> bool {
        self.word.forwarded()
    }
    /// Stores the forwarding address over the vtable bits and sets the
    /// forwarded bit. Readers must observe both through
    /// [`is_forwarded`](HeapObjectHeader::is_forwarded) / [`forward`](HeapObjectHeader::forward).
    #[inline(always)]
    pub fn set_forwarded(&mut self, fwd: *mut HeapObjectHeader) {
        self.word.set_vtable(fwd as u64);
        self.word.set_forwarded(true);
    }
    #[inline(always)]
    pub fn forward(&self) -> *mut HeapObjectHeader {
        debug_assert!(self.is_forwarded());
        self.word.vtable() as usize as *mut HeapObjectHeader
    }

    #[inline(always)]
    pub fn is_remembered(&self) -> bool {
        self.word.remember()
    }
    #[inline(always)]
    pub fn set_remember(&mut self) {
        self.word.set_remember(true);
    }
    #[inline(always)]
    pub fn clear_remember(&mut self) {
        self.word.set_remember(false);
    }

    #[inline(always)]
    pub fn age(&self) -> u8 {
        self.word.age()
    }
    /// Bumps the age, saturating at the field maximum, and returns the new
    /// value.
    #[inline(always)]
    pub fn inc_age(&mut self) -> u8 {
        let age = self.word.age();
        if age < 7 {
            self.word.set_age(age + 1);
        }
        self.word.age()
    }
    #[inline(always)]
    pub(crate) fn clear_age(&mut self) {
        self.word.set_age(0);
    }

    /// Total size of the allocation in bytes, header included.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.meta.size() as usize
    }
    #[inline(always)]
    pub fn set_size(&mut self, size: usize) {
        self.meta.set_size(size as u32);
    }

    #[inline(always)]
    pub fn type_id(&self) -> u16 {
        self.meta.type_id()
    }

    #[inline(always)]
    pub fn data(&self) -> *const u8 {
        (self as *const Self as usize + size_of::<Self>()) as *const u8
    }

    /// Reconstructs the `dyn Collectable` this header fronts from the
    /// payload pointer and the stored vtable.
    #[inline(always)]
    pub fn get_dyn(&mut self) -> &mut dyn Collectable {
        debug_assert!(!self.is_forwarded());
        unsafe {
            std::mem::transmute(TraitObject {
                data: self.data() as *mut (),
                vtable: self.vtable() as *mut (),
            })
        }
    }
}

// Relies on the (data, vtable) layout of fat pointers.
#[repr(C)]
pub(crate) struct TraitObject {
    pub data: *mut (),
    pub vtable: *mut (),
}

pub(crate) fn vtable_of<T: Collectable>() -> usize {
    let x = null_mut::<T>();
    unsafe { std::mem::transmute::<_, TraitObject>(x as *mut dyn Collectable).vtable as usize }
}

/// Implemented by every heap type; reports each reference slot to the
/// visitor so a moving collection can rewrite it in place.
pub trait Trace {
    fn trace(&mut self, _vis: &mut dyn Visitor) {}
}

/// A type that can live in the GC heap.
pub trait Collectable: Trace + 'static {
    fn allocation_size(&self) -> usize {
        std::mem::size_of_val(self)
    }
}

/// Receives every reference slot during a scan and may rewrite it.
pub trait Visitor {
    fn mark_object(&mut self, slot: &mut ObjectRef);
}

impl Trace for ObjectRef {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        vis.mark_object(self);
    }
}

/// Typed pointer into the GC heap.
pub struct Gc<T: Collectable> {
    pub(crate) base: NonNull<HeapObjectHeader>,
    pub(crate) marker: PhantomData<T>,
}

impl<T: Collectable> Gc<T> {
    #[inline(always)]
    pub fn to_ref(self) -> ObjectRef {
        ObjectRef::from_header(self.base.as_ptr())
    }

    /// Reconstructs a typed pointer from a reference, checking the
    /// registered type id.
    pub fn from_ref(obj: ObjectRef) -> Option<Gc<T>> {
        if !obj.is_reference() {
            return None;
        }
        unsafe {
            if (*obj.header()).type_id() != type_id_of::<T>() {
                return None;
            }
        }
        Some(Gc {
            base: unsafe { NonNull::new_unchecked(obj.header()) },
            marker: PhantomData,
        })
    }

    pub fn is<U: Collectable>(&self) -> bool {
        unsafe { (*self.base.as_ptr()).type_id() == type_id_of::<U>() }
    }
}

impl<T: Collectable> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: Collectable> Copy for Gc<T> {}

impl<T: Collectable> Deref for Gc<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe {
            let data = (*self.base.as_ptr()).data().cast::<T>();
            &*data
        }
    }
}

impl<T: Collectable> DerefMut for Gc<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe {
            let data = (*self.base.as_ptr()).data().cast::<T>() as *mut T;
            &mut *data
        }
    }
}

impl<T: Collectable> Trace for Gc<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        let mut slot = self.to_ref();
        vis.mark_object(&mut slot);
        if slot.is_reference() {
            self.base = unsafe { NonNull::new_unchecked(slot.header()) };
        }
    }
}

impl<T: Collectable> Trace for Option<Gc<T>> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        if let Some(gc) = self.as_mut() {
            gc.trace(vis);
        }
    }
}

impl<T: Collectable> std::fmt::Pointer for Gc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:p}", self.base)
    }
}

static NEXT_TYPE_ID: AtomicU16 = AtomicU16::new(1);
static TYPE_ID_MAP: Mutex<Option<HashMap<TypeId, u16>>> = parking_lot::const_mutex(None);

/// Sequential id for `T`, assigned on first use. Id 0 is never handed out
/// and marks an uninitialized header.
pub fn type_id_of<T: Collectable>() -> u16 {
    let mut map = TYPE_ID_MAP.lock();
    let map = map.get_or_insert_with(HashMap::new);
    if let Some(&id) = map.get(&TypeId::of::<T>()) {
        return id;
    }
    let id = NEXT_TYPE_ID.fetch_add(1, Ordering::AcqRel);
    assert!(id != u16::MAX, "type id space exhausted");
    map.insert(TypeId::of::<T>(), id);
    id
}

/// Bounds check for a header's type id. Anything outside the handed-out
/// range means the header bytes are corrupt.
pub fn valid_type_id(id: u16) -> bool {
    id >= 1 && id < NEXT_TYPE_ID.load(Ordering::Acquire)
}

macro_rules! impl_prim {
    ($($t: ty)*) => {
        $(
            impl Trace for $t {}
            impl Collectable for $t {}
        )*
    };
}

impl_prim!(
    u8 u16 u32 u64
    i8 i16 i32 i64
    f32 f64
    bool String
);
