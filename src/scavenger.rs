use std::mem::size_of;
use std::ptr::{null_mut, NonNull};

use crate::api::{
    type_id_of, valid_type_id, vtable_of, Collectable, Gc, HeapObjectHeader, ObjectRef, Visitor,
    MIN_ALLOCATION,
};
use crate::barrier::WriteBarrier;
use crate::bug;
use crate::config::ScavengerOptions;
use crate::finalizer::FinalizerRegistry;
use crate::handles::GlobalHandleLocation;
use crate::heap::{align_usize, Heap};
use crate::mature::MatureSpace;
use crate::mmap::Mmap;
use crate::roots::{GcData, ManagedThread};
use crate::stats::ScavengeStats;
use crate::weakref::WeakRefTable;

const OVER_FULL_THRESHOLD: f64 = 95.0;
const OVER_FULL_TIMES: i32 = 3;
const MINIMUM_LIFETIME: u8 = 1;

const UNDER_FULL_THRESHOLD: f64 = 20.0;
const UNDER_FULL_TIMES: i32 = -3;
const MAXIMUM_LIFETIME: u8 = 6;

/// Where an address sits relative to the young generation. Debug aid: at
/// rest nothing live may sit in the idle survivor half.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjectPosition {
    /// In Eden or the survivor half currently holding live objects.
    Valid,
    /// In the idle survivor half, which should be empty between
    /// collections.
    InWrongYoungHalf,
    /// Not in the young generation at all.
    Unknown,
}

/// Young-generation copying collector.
///
/// One backing map holds Eden plus two survivor halves. Mutators
/// bump-allocate into Eden. A collection evacuates every reachable young
/// object into the idle survivor half, or into the mature space once its
/// age crosses the promotion lifetime, then the halves swap roles.
///
/// All of [`collect`](Scavenger::collect) runs with the mutator stopped;
/// nothing here suspends or yields.
pub struct Scavenger {
    full: Mmap,
    eden: Heap,
    survivors: [Heap; 2],
    current: usize,
    next: usize,

    promoted_stack: Vec<*mut HeapObjectHeader>,
    promoted_objects: usize,
    total_objects: usize,
    copy_spills: usize,

    autotune: bool,
    tune_threshold: i32,
    original_lifetime: u8,
    lifetime: u8,
}

impl Scavenger {
    /// Carves the young generation out of one contiguous map: Eden gets
    /// `eden_size` bytes, the survivor halves a quarter of the total each.
    pub fn new(options: &ScavengerOptions) -> Box<Scavenger> {
        let bytes = options.rounded_eden();
        let full = Mmap::new(bytes * 2);
        let lifetime = options
            .original_lifetime
            .max(MINIMUM_LIFETIME)
            .min(MAXIMUM_LIFETIME);
        unsafe {
            let eden = Heap::new(full.start(), bytes);
            let heap_a = Heap::new(full.start().add(bytes), bytes / 2);
            let heap_b = Heap::new(full.start().add(bytes + bytes / 2), bytes / 2);
            Box::new(Self {
                full,
                eden,
                survivors: [heap_a, heap_b],
                current: 0,
                next: 1,
                promoted_stack: Vec::with_capacity(128),
                promoted_objects: 0,
                total_objects: 0,
                copy_spills: 0,
                autotune: options.autotune,
                tune_threshold: 0,
                original_lifetime: lifetime,
                lifetime,
            })
        }
    }

    /// Bump-allocates `value` in Eden, handing the value back when Eden is
    /// full so the caller can trigger a collection and retry.
    pub fn try_allocate<T: Collectable>(&self, value: T) -> Result<Gc<T>, T> {
        let size = align_usize(
            value.allocation_size() + size_of::<HeapObjectHeader>(),
            MIN_ALLOCATION,
        );
        let memory = self.eden.allocate(size);
        if memory.is_null() {
            return Err(value);
        }
        unsafe {
            (*memory).init(vtable_of::<T>(), size, type_id_of::<T>());
            ((*memory).data() as *mut T).write(value);
            Ok(Gc {
                base: NonNull::new_unchecked(memory),
                marker: Default::default(),
            })
        }
    }

    pub fn is_young(&self, obj: ObjectRef) -> bool {
        obj.is_reference() && self.is_young_addr(obj.header() as *const u8)
    }

    fn is_young_addr(&self, addr: *const u8) -> bool {
        addr >= self.full.start() as *const u8 && addr < self.full.end() as *const u8
    }

    pub fn in_current(&self, obj: ObjectRef) -> bool {
        obj.is_reference() && self.survivors[self.current].contains(obj.header() as *const u8)
    }

    pub fn in_eden(&self, obj: ObjectRef) -> bool {
        obj.is_reference() && self.eden.contains(obj.header() as *const u8)
    }

    pub fn lifetime(&self) -> u8 {
        self.lifetime
    }

    pub fn eden_used(&self) -> usize {
        self.eden.used()
    }

    /// Protects the idle survivor half so stray writes fault immediately.
    /// Debugging aid; the next collection re-enables access itself.
    pub fn protect_next(&self) {
        let next = &self.survivors[self.next];
        self.full.protect_none(next.start(), next.size());
    }

    /// Classifies `obj` against the young generation layout.
    pub fn validate_object(&self, obj: ObjectRef) -> ObjectPosition {
        if !obj.is_reference() {
            return ObjectPosition::Unknown;
        }
        let addr = obj.header() as *const u8;
        if self.survivors[self.current].contains(addr) || self.eden.contains(addr) {
            ObjectPosition::Valid
        } else if self.survivors[self.next].contains(addr) {
            ObjectPosition::InWrongYoungHalf
        } else {
            ObjectPosition::Unknown
        }
    }

    /// Returns the post-collection address for `obj`, evacuating it on
    /// first sight. Reachable objects may be seen any number of times;
    /// only the first sighting moves them.
    fn saw_object(&mut self, mature: &mut dyn MatureSpace, obj: ObjectRef) -> ObjectRef {
        if !obj.is_reference() {
            return obj;
        }
        let header = obj.header();
        if !self.is_young_addr(header as *const u8) {
            return obj;
        }
        unsafe {
            if (*header).is_forwarded() {
                return ObjectRef::from_header((*header).forward());
            }

            // This object is already in the next space, we don't want to
            // copy it again!
            if self.survivors[self.next].contains(header as *const u8) {
                return obj;
            }

            // Aged objects promote no matter how much room the to-space
            // has left.
            let copy = if (*header).inc_age() >= self.lifetime {
                let copy = mature.promote_object(header);
                (*header).set_forwarded(copy);
                self.promoted_push(copy);
                copy
            } else if self.survivors[self.next].enough_space((*header).size()) {
                let copy = self.survivors[self.next].move_object(header);
                self.total_objects += 1;
                copy
            } else {
                self.copy_spills += 1;
                let copy = mature.promote_object(header);
                (*header).set_forwarded(copy);
                self.promoted_push(copy);
                copy
            };

            ObjectRef::from_header(copy)
        }
    }

    fn promoted_push(&mut self, obj: *mut HeapObjectHeader) {
        self.promoted_objects += 1;
        self.promoted_stack.push(obj);
    }

    fn scan_object(
        &mut self,
        mature: &mut dyn MatureSpace,
        barrier: &WriteBarrier,
        obj: *mut HeapObjectHeader,
    ) {
        let mut vis = YoungVisitor {
            gc: self,
            mature,
            barrier,
            parent: obj,
        };
        unsafe {
            (*obj).get_dyn().trace(&mut vis);
        }
    }

    /// Scans the remaining unscanned portion of the to-space.
    fn copy_unscanned(&mut self, mature: &mut dyn MatureSpace, barrier: &WriteBarrier) {
        loop {
            let obj = self.survivors[self.next].next_unscanned();
            if obj.is_null() {
                break;
            }
            debug_assert!(self.is_young_addr(obj as *const u8));
            unsafe {
                if !(*obj).is_forwarded() {
                    self.scan_object(mature, barrier, obj);
                }
            }
        }
    }

    /// True once the to-space scan cursor has caught the bump pointer in
    /// the current collection.
    fn fully_scanned(&self) -> bool {
        self.survivors[self.next].fully_scanned()
    }

    /// Drains both worklists to fixpoint: scanning a promoted object can
    /// copy more into the to-space, and scanning the to-space can promote
    /// more.
    fn handle_promotions(&mut self, mature: &mut dyn MatureSpace, barrier: &WriteBarrier) {
        while !self.promoted_stack.is_empty() || !self.fully_scanned() {
            while let Some(obj) = self.promoted_stack.pop() {
                self.scan_object(mature, barrier, obj);
            }
            self.copy_unscanned(mature, barrier);
        }
    }

    /// Performs garbage collection on the young objects.
    pub fn collect(&mut self, data: &mut GcData<'_>, stats: Option<&mut ScavengeStats>) {
        // The survivor halves may have been protected for debugging
        // between collections.
        for half in self.survivors.iter() {
            self.full.protect_rw(half.start(), half.size());
        }

        let mature = &mut *data.mature;
        let barrier = data.barrier;

        self.total_objects = 0;
        self.copy_spills = 0;
        self.promoted_objects = 0;
        self.promoted_stack.clear();

        // Start by scanning objects in the remember set.
        let current_rs = barrier.swap_remember_set();
        for obj in current_rs {
            // unremember leaves a null behind so removal never has to
            // compact the set.
            if !obj.is_reference() {
                continue;
            }
            unsafe {
                (*obj.header()).clear_remember();
            }
            self.scan_object(mature, barrier, obj.header());
        }

        for aux in data.aux_barriers {
            let rs = aux.swap_remember_set();
            for obj in rs {
                if !obj.is_reference() {
                    continue;
                }
                unsafe {
                    (*obj.header()).clear_remember();
                }
                self.scan_object(mature, barrier, obj.header());
            }
        }

        for slot in data.roots.iter_mut() {
            let obj = *slot;
            *slot = self.saw_object(mature, obj);
        }

        if let Some(threads) = data.threads.as_deref_mut() {
            for thread in threads.iter_mut() {
                for slot in thread.stack_mut() {
                    let obj = *slot;
                    *slot = self.saw_object(mature, obj);
                }
            }
        }

        if let Some(handles) = data.handles {
            for handle in handles.iter() {
                if !handle.is_in_use() {
                    continue;
                }
                let obj = handle.object();
                if !handle.is_weak() && self.is_young(obj) {
                    handle.set_object(self.saw_object(mature, obj));

                // Foreign owners reach the payload of an rdata object
                // without running a write barrier, so a mature rdata can
                // hide young pointers and must be rescanned every cycle.
                } else if obj.is_reference() && !self.is_young(obj) && handle.is_rdata() {
                    self.scan_object(mature, barrier, obj.header());
                }

                let obj = handle.object();
                if obj.is_reference() {
                    unsafe {
                        assert!(
                            valid_type_id((*obj.header()).type_id()),
                            "corrupt type id behind handle {:p}",
                            obj
                        );
                    }
                }
            }
        }

        if let Some(locations) = data.global_handles {
            for location in locations {
                let hdl = location.handle();
                if hdl.is_null() || !GlobalHandleLocation::is_handle_pointer(hdl) {
                    continue;
                }
                unsafe {
                    if (*hdl).is_valid() {
                        let obj = (*hdl).object();
                        if obj.is_reference() && self.is_young(obj) {
                            (*hdl).set_object(self.saw_object(mature, obj));
                        }
                    } else {
                        log::warn!("bad handle {:p} checking global handle locations", hdl);
                    }
                }
            }
        }

        if let Some(jit) = data.jit.as_mut() {
            let mut vis = YoungVisitor {
                gc: self,
                mature: &mut *mature,
                barrier,
                parent: null_mut(),
            };
            jit.gc_scan(&mut vis);
        }

        // Handle all promotions to non-young space that occurred.
        self.handle_promotions(mature, barrier);
        if !self.fully_scanned() {
            bug("young gen not fully scanned after strong graph");
        }

        // We're now done seeing the entire object graph of normal, live
        // references. Objects with finalizers must be kept alive until the
        // finalizers have run.
        self.walk_finalizers(mature, data.finalizers.as_deref_mut());

        // Process possible promotions from the finalizer walk.
        self.handle_promotions(mature, barrier);

        if !self.promoted_stack.is_empty() {
            bug("promote stack has elements!");
        }
        if !self.fully_scanned() {
            bug("more young refs");
        }

        // Check any weakrefs and replace dead objects with nil.
        self.clean_weakrefs(data.weak_refs.as_deref_mut());

        // Remove unreachable locked objects still in the lists.
        if let Some(threads) = data.threads.as_deref_mut() {
            for thread in threads.iter_mut() {
                self.clean_locked_objects(thread);
            }
        }

        // Swap the two halves.
        std::mem::swap(&mut self.current, &mut self.next);

        if let Some(stats) = stats {
            stats.lifetime = self.lifetime;
            stats.percentage_used = self.survivors[self.current].percentage_used();
            stats.promoted_objects = self.promoted_objects;
            stats.excess_objects = self.copy_spills;
        }

        // Tune the age at which promotion occurs.
        if self.autotune {
            self.tune_lifetime();
        }

        log::debug!(
            "young gc: copied {} promoted {} spilled {} survivor {:.1}% lifetime {}",
            self.total_objects,
            self.promoted_objects,
            self.copy_spills,
            self.survivors[self.current].percentage_used(),
            self.lifetime
        );

        self.eden.reset();
        self.survivors[self.next].reset();
    }

    fn walk_finalizers(
        &mut self,
        mature: &mut dyn MatureSpace,
        registry: Option<&mut FinalizerRegistry>,
    ) {
        let registry = match registry {
            Some(registry) => registry,
            None => return,
        };
        registry.walk(|record| {
            let mut live = true;
            if self.is_young(record.object) {
                // Liveness is decided before the record forces the object
                // to survive; prior forwarding is the oracle.
                live = unsafe { (*record.object.header()).is_forwarded() };
                record.object = self.saw_object(mature, record.object);
            }
            if self.is_young(record.finalizer) {
                record.finalizer = self.saw_object(mature, record.finalizer);
            }
            live
        });
    }

    fn clean_weakrefs(&mut self, table: Option<&mut WeakRefTable>) {
        let table = match table {
            Some(table) => table,
            None => return,
        };
        table.each_slot(|slot| {
            if !self.is_young(*slot) {
                return;
            }
            unsafe {
                let header = slot.header();
                if (*header).is_forwarded() {
                    *slot = ObjectRef::from_header((*header).forward());
                } else {
                    *slot = ObjectRef::nil();
                }
            }
        });
    }

    fn clean_locked_objects(&self, thread: &mut ManagedThread) {
        let locked = thread.locked_mut();
        let mut i = 0;
        while i < locked.len() {
            let obj = locked[i];
            if self.is_young(obj) {
                unsafe {
                    let header = obj.header();
                    if (*header).is_forwarded() {
                        locked[i] = ObjectRef::from_header((*header).forward());
                        i += 1;
                    } else {
                        locked.remove(i);
                    }
                }
            } else {
                i += 1;
            }
        }
    }

    /// Sustained over-full survivors mean objects are being kept young too
    /// long; sustained under-full means they promote too early. Otherwise
    /// drift the counter, then the lifetime, back toward their resting
    /// values.
    fn tune_lifetime(&mut self) {
        let used = self.survivors[self.current].percentage_used();
        if used > OVER_FULL_THRESHOLD {
            if self.tune_threshold >= OVER_FULL_TIMES {
                self.tune_threshold = 0;
                if self.lifetime > MINIMUM_LIFETIME {
                    self.lifetime -= 1;
                }
            } else {
                self.tune_threshold += 1;
            }
        } else if used < UNDER_FULL_THRESHOLD {
            if self.tune_threshold <= UNDER_FULL_TIMES {
                self.tune_threshold = 0;
                if self.lifetime < MAXIMUM_LIFETIME {
                    self.lifetime += 1;
                }
            } else {
                self.tune_threshold -= 1;
            }
        } else if self.tune_threshold > 0 {
            self.tune_threshold -= 1;
        } else if self.tune_threshold < 0 {
            self.tune_threshold += 1;
        } else if self.lifetime < self.original_lifetime {
            self.lifetime += 1;
        } else if self.lifetime > self.original_lifetime {
            self.lifetime -= 1;
        }
    }
}

/// Evacuating visitor handed to object trace methods during a scan. Each
/// reported slot is rewritten with the post-collection address.
pub(crate) struct YoungVisitor<'a> {
    gc: &'a mut Scavenger,
    mature: &'a mut dyn MatureSpace,
    barrier: &'a WriteBarrier,
    parent: *mut HeapObjectHeader,
}

impl<'a> Visitor for YoungVisitor<'a> {
    fn mark_object(&mut self, slot: &mut ObjectRef) {
        let new = self.gc.saw_object(self.mature, *slot);
        *slot = new;

        // A mature parent now points at a young survivor; the next
        // collection has to find this edge again.
        if !self.parent.is_null()
            && !self.gc.is_young_addr(self.parent as *const u8)
            && self.gc.is_young(new)
        {
            self.barrier.remember(ObjectRef::from_header(self.parent));
        }
    }
}
