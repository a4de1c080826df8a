use crate::api::{ObjectRef, Visitor};
use crate::barrier::WriteBarrier;
use crate::finalizer::FinalizerRegistry;
use crate::handles::{GlobalHandleLocation, HandleTable};
use crate::mature::MatureSpace;
use crate::weakref::WeakRefTable;

/// Registry of root slots: globals, VM registers, anything the runtime
/// pins outside of thread stacks. Slots are rewritten in place when their
/// target moves.
pub struct Roots {
    slots: Vec<ObjectRef>,
}

/// Index of a slot in [Roots].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Root(usize);

impl Roots {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn add(&mut self, obj: ObjectRef) -> Root {
        self.slots.push(obj);
        Root(self.slots.len() - 1)
    }

    pub fn get(&self, root: Root) -> ObjectRef {
        self.slots[root.0]
    }

    pub fn set(&mut self, root: Root, obj: ObjectRef) {
        self.slots[root.0] = obj;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ObjectRef> {
        self.slots.iter_mut()
    }
}

impl Default for Roots {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread state the collector cares about: the flattened stack slots
/// (frames and locals) and the list of objects the thread holds locks on.
pub struct ManagedThread {
    stack: Vec<ObjectRef>,
    locked: Vec<ObjectRef>,
}

impl ManagedThread {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            locked: Vec::new(),
        }
    }

    pub fn push(&mut self, obj: ObjectRef) -> usize {
        self.stack.push(obj);
        self.stack.len() - 1
    }

    pub fn get(&self, slot: usize) -> ObjectRef {
        self.stack[slot]
    }

    pub fn stack_mut(&mut self) -> &mut [ObjectRef] {
        &mut self.stack
    }

    /// Notes that this thread holds `obj`'s lock. Locked entries do not
    /// keep the object alive; unreachable ones are dropped at collection.
    pub fn lock_object(&mut self, obj: ObjectRef) {
        self.locked.push(obj);
    }

    pub fn locked_objects(&self) -> &[ObjectRef] {
        &self.locked
    }

    pub(crate) fn locked_mut(&mut self) -> &mut Vec<ObjectRef> {
        &mut self.locked
    }
}

impl Default for ManagedThread {
    fn default() -> Self {
        Self::new()
    }
}

/// Hook for JIT or other codegen state that keeps object references in
/// places the collector cannot enumerate itself.
pub trait JitRoots {
    fn gc_scan(&mut self, vis: &mut dyn Visitor);
}

/// Everything a collection needs from the surrounding runtime, bundled so
/// [`collect`](crate::Scavenger::collect) takes one argument. Optional
/// sources that a runtime does not have stay `None`.
pub struct GcData<'a> {
    pub mature: &'a mut dyn MatureSpace,
    pub roots: &'a mut Roots,
    pub barrier: &'a WriteBarrier,
    pub aux_barriers: &'a [&'a WriteBarrier],
    pub threads: Option<&'a mut [ManagedThread]>,
    pub handles: Option<&'a HandleTable>,
    pub global_handles: Option<&'a [GlobalHandleLocation]>,
    pub weak_refs: Option<&'a mut WeakRefTable>,
    pub finalizers: Option<&'a mut FinalizerRegistry>,
    pub jit: Option<&'a mut dyn JitRoots>,
}

impl<'a> GcData<'a> {
    pub fn new(
        mature: &'a mut dyn MatureSpace,
        roots: &'a mut Roots,
        barrier: &'a WriteBarrier,
    ) -> Self {
        Self {
            mature,
            roots,
            barrier,
            aux_barriers: &[],
            threads: None,
            handles: None,
            global_handles: None,
            weak_refs: None,
            finalizers: None,
            jit: None,
        }
    }
}
