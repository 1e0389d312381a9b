//! Heap: generational young space, region-based old space, remembered set,
//! ephemerons, weak arrays, the class table, and identity swap.
//!
//! Young space is a pair of semispaces collected with Cheney's algorithm;
//! survivors of one cycle are tenured into old space through a LIFO carved
//! from the top of to-space. Old space is a list of fixed-size regions (plus
//! dedicated regions for large objects) collected by mark-sweep, with a
//! mark stack borrowed from the idle from-space.
//!
//! C. J. Cheney. "A nonrecursive list compacting algorithm." CACM. 1970.
//! Barry Hayes. "Ephemerons: a new finalization mechanism." OOPSLA. 1997.

use std::ptr;
use std::time::Instant;

use tracing::debug;

use crate::consts::*;
use crate::error::GcReason;
use crate::freelist::FreeList;
use crate::interpreter::Interpreter;
use crate::memory::{allocation_size, VirtualMemory};
use crate::object::*;

/// How an allocation is directed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocator {
    /// Bump in young space, collecting on overflow.
    Normal,
    /// Monotonic bump into old space; never collects. Used while a snapshot
    /// loads so the graph materializes deterministically.
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrowthPolicy {
    Control,
    Force,
}

struct Semispace {
    memory: VirtualMemory,
}

impl Semispace {
    fn allocate(size: usize) -> Semispace {
        Semispace {
            memory: VirtualMemory::allocate(size),
        }
    }

    fn base(&self) -> usize {
        self.memory.base()
    }

    fn limit(&self) -> usize {
        self.memory.limit()
    }

    fn size(&self) -> usize {
        self.memory.size()
    }

    fn object_start(&self) -> usize {
        self.base() + NEW_OBJECT_ALIGNMENT_OFFSET
    }

    fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.limit()
    }
}

struct Region {
    memory: VirtualMemory,
    object_end: usize,
}

impl Region {
    fn allocate(size: usize) -> Region {
        let memory = VirtualMemory::allocate(size);
        let object_end = memory.base();
        Region { memory, object_end }
    }

    fn object_start(&self) -> usize {
        self.memory.base()
    }

    fn limit(&self) -> usize {
        self.memory.limit()
    }

    fn try_allocate(&mut self, size: usize) -> usize {
        debug_assert!(size & OBJECT_ALIGNMENT_MASK == 0);
        let result = self.object_end;
        if self.limit() - self.object_end < size {
            return 0;
        }
        debug_assert!(result & OBJECT_ALIGNMENT_MASK == OLD_OBJECT_ALIGNMENT_OFFSET);
        self.object_end += size;
        result
    }
}

/// Mark stack scribbled over the idle from-space during mark-sweep.
struct MarkStack {
    base: *mut Obj,
    top: *mut Obj,
    end: *mut Obj,
}

impl MarkStack {
    fn init(space: &Semispace) -> MarkStack {
        let base = space.base() as *mut Obj;
        MarkStack {
            base,
            top: base,
            end: space.limit() as *mut Obj,
        }
    }

    fn is_empty(&self) -> bool {
        self.top == self.base
    }

    fn push(&mut self, obj: Obj) {
        if self.top == self.end {
            panic!("mark stack overflow");
        }
        unsafe {
            *self.top = obj;
            self.top = self.top.add(1);
        }
    }

    fn pop(&mut self) -> Obj {
        debug_assert!(!self.is_empty());
        unsafe {
            self.top = self.top.sub(1);
            *self.top
        }
    }
}

#[inline]
fn is_forwarded(obj: Obj) -> bool {
    // The mark bit of a forwarded header aliases the tag bit of the
    // forwarding pointer.
    let header = unsafe { *(obj.addr() as *const usize) };
    header & (1 << MARK_BIT) != 0
}

#[inline]
fn forwarding_target(obj: Obj) -> Obj {
    debug_assert!(is_forwarded(obj));
    let header = unsafe { *(obj.addr() as *const usize) };
    debug_assert!(header & SMI_TAG_MASK == HEAP_OBJECT_TAG);
    Obj::from_raw(header)
}

#[inline]
fn set_forwarded(old_obj: Obj, new_obj: Obj) {
    debug_assert!(old_obj.is_new_object());
    debug_assert!(!is_forwarded(old_obj));
    let header = new_obj.raw();
    debug_assert!(header & SMI_TAG_MASK == HEAP_OBJECT_TAG);
    unsafe { *(old_obj.addr() as *mut usize) = header }
}

/// Word-wise copy; addresses are object-aligned and `size` is a positive
/// multiple of the alignment.
#[inline]
fn objcpy(dst: usize, src: usize, size: usize) {
    unsafe {
        ptr::copy_nonoverlapping(src as *const usize, dst as *mut usize, size / WORD_SIZE);
    }
}

pub struct Heap {
    // Young space.
    top: usize,
    end: usize,
    survivor_end: usize,
    to_space: Semispace,
    from_space: Semispace,
    next_semispace_capacity: usize,

    // Old space.
    regions: Vec<Region>,
    freelist: FreeList,
    old_size: usize,
    old_capacity: usize,
    old_limit: usize,

    // Remembered set.
    remembered_set: Vec<Obj>,

    // Class table. Recycled ids chain through Smi-tagged slots.
    class_table: Vec<Obj>,
    class_table_free: usize,
    class_table_gc_threshold: usize,

    // Roots.
    interpreter: *mut Interpreter,
    handles: [*mut Obj; HANDLES_CAPACITY],
    handles_size: usize,

    // Intrusive lists built during collection. `Obj::ZERO` terminates.
    ephemeron_list: Obj,
    weak_list: Obj,
}

impl Heap {
    pub fn new() -> Box<Heap> {
        Box::new(Heap {
            top: 0,
            end: 0,
            survivor_end: 0,
            to_space: Semispace::allocate(INITIAL_SEMISPACE_CAPACITY),
            from_space: Semispace::allocate(INITIAL_SEMISPACE_CAPACITY),
            next_semispace_capacity: INITIAL_SEMISPACE_CAPACITY,
            regions: Vec::new(),
            freelist: FreeList::new(),
            old_size: 0,
            old_capacity: 0,
            old_limit: 0,
            remembered_set: Vec::with_capacity(1024),
            class_table: vec![Obj::smi(0); FIRST_REGULAR_OBJECT_CID],
            class_table_free: 0,
            class_table_gc_threshold: 1024,
            interpreter: ptr::null_mut(),
            handles: [ptr::null_mut(); HANDLES_CAPACITY],
            handles_size: 0,
            ephemeron_list: Obj::ZERO,
            weak_list: Obj::ZERO,
        })
    }

    pub(crate) fn initialize_interpreter(&mut self, interpreter: *mut Interpreter) {
        debug_assert!(self.interpreter.is_null());
        self.interpreter = interpreter;
    }

    fn interpreter(&self) -> &'static mut Interpreter {
        unsafe { &mut *self.interpreter }
    }

    /// Live bytes: young-space bump extent plus old-space live size.
    pub fn size(&self) -> usize {
        let new_size = self.top.wrapping_sub(self.to_space.object_start());
        new_size.wrapping_add(self.old_size)
    }

    pub fn handles(&self) -> usize {
        self.handles_size
    }

    /* Allocation */

    #[inline]
    fn allocate(&mut self, size: usize, allocator: Allocator) -> usize {
        debug_assert!(size & OBJECT_ALIGNMENT_MASK == 0);
        if size < LARGE_ALLOCATION {
            let result = self.top;
            if result + size <= self.end {
                self.top = result + size;
                return result;
            }
        }
        match allocator {
            Allocator::Snapshot => self.allocate_snapshot(size),
            Allocator::Normal => self.allocate_normal(size),
        }
    }

    fn allocate_normal(&mut self, size: usize) -> usize {
        if size >= LARGE_ALLOCATION {
            return self.allocate_old_large(size, GrowthPolicy::Control);
        }

        let mut addr = self.top;
        if addr + size > self.end {
            self.scavenge(GcReason::NewSpace);
            if self.old_size > self.old_limit {
                self.mark_sweep(GcReason::Tenure);
            }
            addr = self.top;
            if addr + size > self.end {
                return self.allocate_old_small(size, GrowthPolicy::Control);
            }
        }
        self.top = addr + size;
        addr
    }

    fn allocate_copy(&mut self, size: usize) -> usize {
        let result = self.top;
        debug_assert!(size <= self.end - self.top, "to-space exhausted mid-scavenge");
        debug_assert!(result & OBJECT_ALIGNMENT_MASK == NEW_OBJECT_ALIGNMENT_OFFSET);
        self.top = result + size;
        result
    }

    fn allocate_tenure(&mut self, size: usize) -> usize {
        let result = self.allocate_old_small(size, GrowthPolicy::Force);
        self.push_tenure_stack(result);
        result
    }

    fn allocate_old_small(&mut self, size: usize, growth: GrowthPolicy) -> usize {
        debug_assert!(size < LARGE_ALLOCATION);
        let mut addr = self.freelist.try_allocate(size);
        if addr == 0 {
            let index = self.allocate_region(REGION_SIZE, growth);
            let region = &mut self.regions[index];
            addr = region.try_allocate(size);
            let remaining = region.limit() - region.object_end;
            if remaining > 0 {
                let start = region.object_end;
                region.object_end = region.limit();
                self.freelist.enqueue_range(start, remaining);
            }
        }
        debug_assert!(addr != 0);
        self.old_size += size;
        addr
    }

    fn allocate_old_large(&mut self, size: usize, growth: GrowthPolicy) -> usize {
        debug_assert!(size >= LARGE_ALLOCATION);
        let index = self.allocate_region(size, growth);
        let addr = self.regions[index].try_allocate(size);
        debug_assert!(addr != 0);
        self.old_size += size;
        addr
    }

    fn allocate_snapshot(&mut self, size: usize) -> usize {
        if size >= LARGE_ALLOCATION {
            return self.allocate_old_large(size, GrowthPolicy::Force);
        }

        let mut addr = self.top;
        if addr + size > self.end {
            let remaining = self.end - self.top;
            if remaining > 0 {
                self.freelist.enqueue_range(self.top, remaining);
                self.old_size -= remaining;
            }
            let index = self.allocate_region(REGION_SIZE, GrowthPolicy::Force);
            let region = &mut self.regions[index];
            self.top = region.object_start();
            self.end = region.limit();
            region.object_end = region.limit();
            let remaining = self.end - self.top;
            self.old_size += remaining;
            debug_assert!(size <= remaining);
            addr = self.top;
        }
        self.top = addr + size;
        addr
    }

    fn allocate_region(&mut self, region_size: usize, growth: GrowthPolicy) -> usize {
        if growth == GrowthPolicy::Control && self.old_size + region_size > self.old_limit {
            self.mark_sweep(GcReason::OldSpace);
        }
        let region = Region::allocate(region_size);
        self.old_capacity += region.memory.size();
        self.regions.push(region);
        self.regions.len() - 1
    }

    /* Object allocators. Each is a safepoint under the Normal allocator. */

    pub fn allocate_regular_object(
        &mut self,
        cid: Cid,
        num_slots: usize,
        allocator: Allocator,
    ) -> Obj {
        debug_assert!(cid == EPHEMERON_CID || cid >= FIRST_REGULAR_OBJECT_CID);
        let heap_size = allocation_size((HEADER_WORDS + num_slots) * WORD_SIZE);
        let addr = self.allocate(heap_size, allocator);
        let obj = Obj::initialize(addr, cid, heap_size);
        if (HEADER_WORDS + num_slots) & 1 == 1 {
            // The leftover alignment slot is visited by the collector;
            // keep it a valid immediate.
            store_slot_no_barrier(obj, HEADER_WORDS + num_slots, Obj::smi(0));
        }
        obj
    }

    pub fn allocate_byte_array(&mut self, num_bytes: usize, allocator: Allocator) -> Obj {
        let heap_size = allocation_size(3 * WORD_SIZE + num_bytes);
        let addr = self.allocate(heap_size, allocator);
        let obj = Obj::initialize(addr, BYTE_ARRAY_CID, heap_size);
        Bytes::cast(obj).set_size(Obj::smi(num_bytes as isize));
        obj
    }

    pub fn allocate_string(&mut self, num_bytes: usize, allocator: Allocator) -> Obj {
        let heap_size = allocation_size(3 * WORD_SIZE + num_bytes);
        let addr = self.allocate(heap_size, allocator);
        let obj = Obj::initialize(addr, STRING_CID, heap_size);
        Bytes::cast(obj).set_size(Obj::smi(num_bytes as isize));
        obj
    }

    pub fn allocate_array(&mut self, num_slots: usize, allocator: Allocator) -> Obj {
        let heap_size = allocation_size((3 + num_slots) * WORD_SIZE);
        let addr = self.allocate(heap_size, allocator);
        let obj = Obj::initialize(addr, ARRAY_CID, heap_size);
        Array::cast(obj).set_size(Obj::smi(num_slots as isize));
        obj
    }

    pub fn allocate_weak_array(&mut self, num_slots: usize, allocator: Allocator) -> Obj {
        let heap_size = allocation_size((4 + num_slots) * WORD_SIZE);
        let addr = self.allocate(heap_size, allocator);
        let obj = Obj::initialize(addr, WEAK_ARRAY_CID, heap_size);
        let weak = WeakArray::cast(obj);
        weak.set_size(Obj::smi(num_slots as isize));
        weak.set_next(Obj::ZERO);
        obj
    }

    pub fn allocate_closure(&mut self, num_copied: usize, allocator: Allocator) -> Obj {
        let heap_size = allocation_size((Closure::COPIED_WORD + num_copied) * WORD_SIZE);
        let addr = self.allocate(heap_size, allocator);
        let obj = Obj::initialize(addr, CLOSURE_CID, heap_size);
        Closure::cast(obj).set_num_copied(num_copied);
        obj
    }

    pub fn allocate_activation(&mut self, allocator: Allocator) -> Obj {
        let addr = self.allocate(Activation::HEAP_SIZE, allocator);
        Obj::initialize(addr, ACTIVATION_CID, Activation::HEAP_SIZE)
    }

    pub fn allocate_medium_integer(&mut self, allocator: Allocator) -> Obj {
        let addr = self.allocate(MediumInteger::HEAP_SIZE, allocator);
        Obj::initialize(addr, MINT_CID, MediumInteger::HEAP_SIZE)
    }

    pub fn allocate_large_integer(&mut self, capacity: usize, allocator: Allocator) -> Obj {
        let heap_size = allocation_size(
            LargeInteger::DIGITS_WORD * WORD_SIZE + capacity * std::mem::size_of::<Digit>(),
        );
        let addr = self.allocate(heap_size, allocator);
        let obj = Obj::initialize(addr, BIGINT_CID, heap_size);
        let large = LargeInteger::cast(obj);
        large.set_capacity(capacity);
        large.set_negative(false);
        large.set_size(0);
        obj
    }

    pub fn allocate_float(&mut self, allocator: Allocator) -> Obj {
        let addr = self.allocate(Float::HEAP_SIZE, allocator);
        Obj::initialize(addr, FLOAT_CID, Float::HEAP_SIZE)
    }

    /// Instantiate the image's Message class, registering a class id for it
    /// on first use.
    pub fn allocate_message(&mut self) -> Obj {
        let store = ObjectStore::cast(self.interpreter().object_store());
        let mut behavior = Behavior::cast(store.message_class());
        behavior.assert_could_be_behavior();
        let mut id = behavior.id();
        if id == self.interpreter().nil_obj() {
            id = Obj::smi(self.allocate_class_id() as isize); // SAFEPOINT
            let store = ObjectStore::cast(self.interpreter().object_store());
            behavior = Behavior::cast(store.message_class());
            self.register_class(id.smi_value() as Cid, behavior.obj());
        }
        let num_slots = behavior.format().smi_value() as usize;
        debug_assert!(num_slots == Message::NUM_SLOTS);
        self.allocate_regular_object(id.smi_value() as Cid, num_slots, Allocator::Normal)
    }

    /* Remembered set */

    pub(crate) fn add_to_remembered_set(&mut self, obj: Obj) {
        debug_assert!(obj.is_old_object());
        debug_assert!(!obj.is_remembered());
        self.remembered_set.push(obj);
        obj.set_is_remembered(true);
    }

    fn shrink_remembered_set(&mut self) {
        let wanted = self.remembered_set.len() + (self.remembered_set.len() >> 1) + 1;
        let preferred = (wanted + KB - 1) / KB * KB;
        if self.remembered_set.capacity() > preferred {
            debug!(target: "gc", capacity = preferred, "shrinking remembered set");
            self.remembered_set.shrink_to(preferred);
        }
    }

    /* Class table */

    pub fn class_at(&self, cid: Cid) -> Obj {
        debug_assert!(cid > ILLEGAL_CID);
        debug_assert!(cid < self.class_table.len());
        self.class_table[cid]
    }

    pub fn register_class(&mut self, cid: Cid, cls: Obj) {
        while self.class_table.len() <= cid {
            self.class_table.push(Obj::smi(0));
        }
        self.class_table[cid] = cls;
        let behavior = Behavior::cast(cls);
        behavior.set_id(Obj::smi(cid as isize));
        behavior.assert_could_be_behavior();
        debug_assert!(cls.cid() >= FIRST_REGULAR_OBJECT_CID);
    }

    /// Claim a class id, recycling mourned ids and collecting before the
    /// table grows.
    pub fn allocate_class_id(&mut self) -> Cid {
        if self.class_table_free != 0 {
            let cid = self.class_table_free;
            self.class_table_free = self.class_table[cid].smi_value() as usize;
            self.class_table[cid] = Obj::smi(0);
            return cid;
        }
        if self.class_table.len() >= self.class_table_gc_threshold {
            debug!(target: "gc", "collecting to free class table entries");
            self.collect_all(GcReason::ClassTable);
            if self.class_table_free != 0 {
                let cid = self.class_table_free;
                self.class_table_free = self.class_table[cid].smi_value() as usize;
                self.class_table[cid] = Obj::smi(0);
                return cid;
            }
            self.class_table_gc_threshold += self.class_table_gc_threshold >> 1;
            debug!(target: "gc", threshold = self.class_table_gc_threshold, "growing class table");
        }
        self.class_table.push(Obj::smi(0));
        self.class_table.len() - 1
    }

    /// Snapshot loading registers classes before their slots are filled, so
    /// the recorded ids are corrected here, and the bump allocator is
    /// switched from old space back to young space.
    pub fn initialize_after_snapshot(&mut self) {
        let nil = self.interpreter().nil_obj();
        for cid in FIRST_LEGAL_CID..self.class_table.len() {
            let cls = Behavior::cast(self.class_table[cid]);
            cls.assert_could_be_behavior();
            if cls.id() == nil {
                cls.set_id(Obj::smi(cid as isize));
            }
        }

        let remaining = self.end - self.top;
        if remaining > 0 {
            self.freelist.enqueue_range(self.top, remaining);
            self.old_size -= remaining;
        }
        self.top = self.to_space.object_start();
        self.end = self.to_space.limit();

        self.set_old_allocation_limit();
    }

    /// Full collection.
    pub fn collect_all(&mut self, reason: GcReason) {
        self.mark_sweep(reason);
    }

    /// Hand the freshly loaded object store to the interpreter.
    pub(crate) fn publish_roots(&mut self, store: ObjectStore) {
        self.interpreter().initialize_root(store);
    }

    /* Scavenge */

    pub fn scavenge(&mut self, reason: GcReason) {
        let start = Instant::now();
        let new_before = self.top.wrapping_sub(self.to_space.object_start());
        let old_before = self.old_size;

        self.flip_spaces();

        self.interpreter().gc_prologue();

        // Strong references.
        self.scavenge_roots();
        let mut scan = self.to_space.object_start();
        while scan < self.top || self.end < self.to_space.limit() {
            scan = self.scavenge_to_space(scan);
            self.process_tenure_stack();
            self.scavenge_ephemeron_list();
        }

        // Weak references.
        self.mourn_ephemeron_list();
        self.mourn_weak_list_scavenge();
        self.mourn_class_table_scavenge();

        self.interpreter().gc_epilogue();

        self.survivor_end = self.top;

        let new_after = self.top - self.to_space.object_start();
        let old_after = self.old_size;
        let tenured = old_after - old_before;
        let survived = new_after + tenured;

        if survived > self.to_space.size() / 3 {
            self.next_semispace_capacity = (self.to_space.size() * 2).min(MAX_SEMISPACE_CAPACITY);
        }

        let freed = (new_before + old_before).saturating_sub(new_after + old_after);
        debug!(
            target: "gc",
            %reason,
            new_kb = new_after / KB,
            tenured_kb = tenured / KB,
            freed_kb = freed / KB,
            us = start.elapsed().as_micros() as u64,
            "scavenge"
        );
    }

    fn flip_spaces(&mut self) {
        std::mem::swap(&mut self.to_space, &mut self.from_space);

        debug_assert!(self.next_semispace_capacity <= MAX_SEMISPACE_CAPACITY);
        if self.to_space.size() < self.next_semispace_capacity {
            if self.from_space.size() < self.next_semispace_capacity {
                debug!(target: "gc", mb = self.next_semispace_capacity / MB, "growing new space");
            }
            self.to_space = Semispace::allocate(self.next_semispace_capacity);
        }

        debug_assert!(self.to_space.size() >= self.from_space.size());
        self.top = self.to_space.object_start();
        self.end = self.to_space.limit();
    }

    fn scavenge_roots(&mut self) {
        // Process the remembered set first so visiting and resetting happen
        // in one pass.
        let saved = std::mem::take(&mut self.remembered_set);
        for &obj in &saved {
            debug_assert!(obj.is_old_object());
            debug_assert!(obj.is_remembered());
            obj.set_is_remembered(false);
            self.scavenge_old_object(obj);
        }
        drop(saved);

        for i in 0..self.handles_size {
            self.scavenge_pointer(self.handles[i]);
        }

        let (roots, roots_len) = self.interpreter().root_pointers();
        for i in 0..roots_len {
            self.scavenge_pointer(unsafe { roots.add(i) });
        }
        let (stack, stack_len) = self.interpreter().stack_pointers();
        for i in 0..stack_len {
            self.scavenge_pointer(unsafe { stack.add(i) });
        }
    }

    fn scavenge_to_space(&mut self, mut scan: usize) -> usize {
        while scan < self.top {
            let obj = Obj::from_addr(scan);
            let cid = obj.cid();
            if cid == WEAK_ARRAY_CID {
                self.add_to_weak_list(obj);
            } else if cid == EPHEMERON_CID {
                self.add_to_ephemeron_list(obj);
            } else {
                self.scavenge_class(cid);
                let (slots, len) = obj.pointers();
                for i in 0..len {
                    self.scavenge_pointer(unsafe { slots.add(i) });
                }
            }
            scan += obj.heap_size();
        }
        scan
    }

    fn push_tenure_stack(&mut self, addr: usize) {
        debug_assert!(self.end > self.top);
        debug_assert!(self.end <= self.to_space.limit());
        self.end -= WORD_SIZE;
        unsafe { *(self.end as *mut usize) = addr }
    }

    fn pop_tenure_stack(&mut self) -> usize {
        let addr = unsafe { *(self.end as *const usize) };
        self.end += WORD_SIZE;
        addr
    }

    fn is_tenure_stack_empty(&self) -> bool {
        self.end == self.to_space.limit()
    }

    fn process_tenure_stack(&mut self) {
        while !self.is_tenure_stack_empty() {
            let addr = self.pop_tenure_stack();
            self.scavenge_old_object(Obj::from_addr(addr));
        }
    }

    fn scavenge_pointer(&mut self, ptr: *mut Obj) -> bool {
        let old_target = unsafe { *ptr };
        if old_target.is_immediate_or_old_object() {
            return false;
        }

        debug_assert!(self.from_space.contains(old_target.addr()));

        let new_target = if is_forwarded(old_target) {
            forwarding_target(old_target)
        } else {
            // Now known reachable; move to to-space, or tenure survivors of
            // a previous cycle.
            let size = old_target.heap_size();
            let new_addr = if old_target.addr() < self.survivor_end {
                self.allocate_tenure(size)
            } else {
                self.allocate_copy(size)
            };
            objcpy(new_addr, old_target.addr(), size);
            let new_target = Obj::from_addr(new_addr);
            set_forwarded(old_target, new_target);
            new_target
        };

        debug_assert!(new_target.is_old_object() || self.to_space.contains(new_target.addr()));
        unsafe { *ptr = new_target }
        new_target.is_new_object()
    }

    fn scavenge_old_object(&mut self, obj: Obj) {
        let cid = obj.cid();
        if cid == WEAK_ARRAY_CID {
            self.add_to_weak_list(obj);
        } else if cid == EPHEMERON_CID {
            self.add_to_ephemeron_list(obj);
        } else {
            let mut has_new_target = self.scavenge_class(cid);
            let (slots, len) = obj.pointers();
            for i in 0..len {
                has_new_target |= self.scavenge_pointer(unsafe { slots.add(i) });
            }
            if has_new_target {
                self.add_to_remembered_set(obj);
            }
        }
    }

    /// Ensure the class named by `cid` survives. The table entry itself is
    /// repointed in the class-table pass.
    fn scavenge_class(&mut self, cid: Cid) -> bool {
        debug_assert!(cid < self.class_table.len());
        let old_target = self.class_table[cid];
        if old_target.is_immediate_or_old_object() {
            return false;
        }

        if is_forwarded(old_target) {
            return forwarding_target(old_target).is_new_object();
        }

        let size = old_target.heap_size();
        let new_addr = if old_target.addr() < self.survivor_end {
            self.allocate_tenure(size)
        } else {
            self.allocate_copy(size)
        };
        objcpy(new_addr, old_target.addr(), size);
        let new_target = Obj::from_addr(new_addr);
        set_forwarded(old_target, new_target);
        true
    }

    /* Mark-sweep */

    fn mark_sweep(&mut self, reason: GcReason) {
        let start = Instant::now();
        let size_before = self.old_size;

        let mut mark_stack = MarkStack::init(&self.from_space);

        // Rebuilt during marking.
        self.remembered_set.clear();
        self.old_size = 0;

        self.interpreter().gc_prologue();

        self.mark_roots(&mut mark_stack);
        while !mark_stack.is_empty() {
            self.process_mark_stack(&mut mark_stack);
            self.mark_ephemeron_list(&mut mark_stack);
        }

        debug_assert!(self.old_size <= self.old_capacity);

        self.mourn_ephemeron_list();
        self.mourn_weak_list_mark_sweep();
        self.mourn_class_table_mark_sweep();

        self.interpreter().gc_epilogue();

        self.sweep();

        self.shrink_remembered_set();

        self.set_old_allocation_limit();

        debug!(
            target: "gc",
            %reason,
            old_kb = self.old_size / KB,
            freed_kb = size_before.saturating_sub(self.old_size) / KB,
            us = start.elapsed().as_micros() as u64,
            "mark-sweep"
        );
    }

    fn mark_roots(&mut self, mark_stack: &mut MarkStack) {
        for i in 0..self.handles_size {
            self.mark_object(mark_stack, unsafe { *self.handles[i] });
        }

        let (roots, roots_len) = self.interpreter().root_pointers();
        for i in 0..roots_len {
            self.mark_object(mark_stack, unsafe { *roots.add(i) });
        }
        let (stack, stack_len) = self.interpreter().stack_pointers();
        for i in 0..stack_len {
            self.mark_object(mark_stack, unsafe { *stack.add(i) });
        }
    }

    fn mark_object(&mut self, mark_stack: &mut MarkStack, obj: Obj) {
        if obj.is_smi() {
            return;
        }
        if obj.is_marked() {
            return;
        }
        obj.set_is_marked(true);
        obj.set_is_remembered(false);
        mark_stack.push(obj);
    }

    fn process_mark_stack(&mut self, mark_stack: &mut MarkStack) {
        while !mark_stack.is_empty() {
            let obj = mark_stack.pop();
            debug_assert!(obj.is_marked());
            debug_assert!(!obj.is_remembered());

            let cid = obj.cid();
            debug_assert!(cid != ILLEGAL_CID);
            debug_assert!(cid != FORWARDING_CORPSE_CID);
            debug_assert!(cid != FREE_LIST_ELEMENT_CID);

            if cid == WEAK_ARRAY_CID {
                self.add_to_weak_list(obj);
            } else if cid == EPHEMERON_CID {
                self.add_to_ephemeron_list(obj);
            } else {
                let klass = self.class_at(cid);
                self.mark_object(mark_stack, klass);
                let mut has_new_target = klass.is_new_object();
                let (slots, len) = obj.pointers();
                for i in 0..len {
                    let target = unsafe { *slots.add(i) };
                    has_new_target |= target.is_new_object();
                    self.mark_object(mark_stack, target);
                }
                if has_new_target && obj.is_old_object() {
                    self.add_to_remembered_set(obj);
                }
            }
        }
    }

    fn sweep(&mut self) {
        self.freelist.reset();

        // Young space: coalesce unmarked runs into free-list stubs so the
        // linear walk stays valid. The stubs are not enqueued; the space is
        // reclaimed wholesale at the next scavenge.
        let mut scan = self.to_space.object_start();
        while scan < self.top {
            let obj = Obj::from_addr(scan);
            if obj.is_marked() {
                obj.set_is_marked(false);
                scan += obj.heap_size();
            } else {
                let mut free_scan = scan + obj.heap_size();
                while free_scan < self.top {
                    let next = Obj::from_addr(free_scan);
                    if next.is_marked() {
                        break;
                    }
                    free_scan += next.heap_size();
                }
                let size = free_scan - scan;
                let stub = Obj::initialize(scan, FREE_LIST_ELEMENT_CID, size);
                let element = FreeListElement::cast(stub);
                element.set_next(Obj::ZERO);
                if stub.header_heap_size() == 0 {
                    element.set_overflow_size(size);
                }
                scan = free_scan;
            }
        }

        let mut i = 0;
        while i < self.regions.len() {
            let (in_use, live) = Self::sweep_region(&mut self.freelist, &self.regions[i]);
            self.old_size += live;
            if in_use {
                i += 1;
            } else {
                let region = self.regions.remove(i);
                self.old_capacity -= region.memory.size();
            }
        }
    }

    /// Returns whether the region is still in use and its live byte count.
    /// Entirely dead regions (large single-object regions in particular)
    /// are released rather than enqueued.
    fn sweep_region(freelist: &mut FreeList, region: &Region) -> (bool, usize) {
        let mut live = 0;
        let mut scan = region.object_start();
        let end = region.object_end;
        while scan < end {
            let obj = Obj::from_addr(scan);
            if obj.is_marked() {
                obj.set_is_marked(false);
                let size = obj.heap_size();
                live += size;
                scan += size;
            } else {
                let mut free_scan = scan + obj.heap_size();
                while free_scan < end {
                    let next = Obj::from_addr(free_scan);
                    if next.is_marked() {
                        break;
                    }
                    free_scan += next.heap_size();
                }

                if scan == region.object_start() && free_scan == end {
                    return (false, 0);
                }

                freelist.enqueue_range(scan, free_scan - scan);
                scan = free_scan;
            }
        }
        (true, live)
    }

    fn set_old_allocation_limit(&mut self) {
        self.old_limit = self.old_size + (self.old_size / 2).max(2 * REGION_SIZE);
        debug!(
            target: "gc",
            size_kb = self.old_size / KB,
            capacity_kb = self.old_capacity / KB,
            limit_kb = self.old_limit / KB,
            "old space"
        );
    }

    /* Ephemerons */

    fn add_to_ephemeron_list(&mut self, survivor: Obj) {
        debug_assert!(survivor.is_old_object() || self.to_space.contains(survivor.addr()));
        Ephemeron::cast(survivor).set_next(self.ephemeron_list);
        self.ephemeron_list = survivor;
    }

    fn is_scavenge_survivor(obj: Obj) -> bool {
        obj.is_immediate_or_old_object() || is_forwarded(obj)
    }

    fn scavenge_ephemeron_list(&mut self) {
        let mut survivor = std::mem::replace(&mut self.ephemeron_list, Obj::ZERO);

        while survivor != Obj::ZERO {
            let ephemeron = Ephemeron::cast(survivor);
            let next = ephemeron.next();
            ephemeron.set_next(Obj::ZERO);

            if Self::is_scavenge_survivor(ephemeron.key()) {
                let mut has_new_target = false;
                let slots = ephemeron.key_slot();
                for i in 0..Ephemeron::NUM_SLOTS {
                    has_new_target |= self.scavenge_pointer(unsafe { slots.add(i) });
                }
                if has_new_target && survivor.is_old_object() {
                    self.add_to_remembered_set(survivor);
                }
            } else {
                // Fate of the key is not yet known; revisit next round.
                self.add_to_ephemeron_list(survivor);
            }

            survivor = next;
        }
    }

    fn is_mark_sweep_survivor(obj: Obj) -> bool {
        obj.is_smi() || obj.is_marked()
    }

    fn mark_ephemeron_list(&mut self, mark_stack: &mut MarkStack) {
        let mut survivor = std::mem::replace(&mut self.ephemeron_list, Obj::ZERO);

        while survivor != Obj::ZERO {
            let ephemeron = Ephemeron::cast(survivor);
            let next = ephemeron.next();
            ephemeron.set_next(Obj::ZERO);

            if Self::is_mark_sweep_survivor(ephemeron.key()) {
                let mut has_new_target = false;
                let slots = ephemeron.key_slot();
                for i in 0..Ephemeron::NUM_SLOTS {
                    let target = unsafe { *slots.add(i) };
                    has_new_target |= target.is_new_object();
                    self.mark_object(mark_stack, target);
                }
                if has_new_target && survivor.is_old_object() {
                    self.add_to_remembered_set(survivor);
                }
            } else {
                self.add_to_ephemeron_list(survivor);
            }

            survivor = next;
        }
    }

    /// No further progress is possible: unreachable keys take their values
    /// and finalizers with them.
    fn mourn_ephemeron_list(&mut self) {
        let nil = self.interpreter().nil_obj();
        let mut survivor = std::mem::replace(&mut self.ephemeron_list, Obj::ZERO);

        while survivor != Obj::ZERO {
            let ephemeron = Ephemeron::cast(survivor);
            ephemeron.set_key_no_barrier(nil);
            ephemeron.set_value_no_barrier(nil);
            ephemeron.set_finalizer_no_barrier(nil);

            let next = ephemeron.next();
            ephemeron.set_next(Obj::ZERO);
            survivor = next;
        }
    }

    /* Weak arrays */

    fn add_to_weak_list(&mut self, survivor: Obj) {
        debug_assert!(survivor.is_old_object() || self.to_space.contains(survivor.addr()));
        WeakArray::cast(survivor).set_next(self.weak_list);
        self.weak_list = survivor;
    }

    fn mourn_weak_list_scavenge(&mut self) {
        let mut survivor = std::mem::replace(&mut self.weak_list, Obj::ZERO);
        while survivor != Obj::ZERO {
            let weak = WeakArray::cast(survivor);

            let mut has_new_target = false;
            let (slots, len) = survivor.pointers();
            for i in 0..len {
                has_new_target |= self.mourn_weak_pointer_scavenge(unsafe { slots.add(i) });
            }
            if has_new_target && survivor.is_old_object() {
                self.add_to_remembered_set(survivor);
            }

            let next = weak.next();
            weak.set_next(Obj::ZERO);
            survivor = next;
        }
    }

    fn mourn_weak_pointer_scavenge(&mut self, ptr: *mut Obj) -> bool {
        let old_target = unsafe { *ptr };
        if old_target.is_immediate_or_old_object() {
            return false;
        }

        let new_target = if is_forwarded(old_target) {
            forwarding_target(old_target)
        } else {
            // The store and nil itself have already been scavenged.
            self.interpreter().nil_obj()
        };

        unsafe { *ptr = new_target }
        new_target.is_new_object()
    }

    fn mourn_weak_list_mark_sweep(&mut self) {
        let nil = self.interpreter().nil_obj();
        debug_assert!(Self::is_mark_sweep_survivor(nil));
        let mut survivor = std::mem::replace(&mut self.weak_list, Obj::ZERO);
        while survivor != Obj::ZERO {
            let weak = WeakArray::cast(survivor);

            let mut has_new_target = false;
            let (slots, len) = survivor.pointers();
            for i in 0..len {
                let slot = unsafe { slots.add(i) };
                let target = unsafe { *slot };
                if !Self::is_mark_sweep_survivor(target) {
                    unsafe { *slot = nil }
                }
                has_new_target |= unsafe { *slot }.is_new_object();
            }
            if has_new_target && survivor.is_old_object() {
                self.add_to_remembered_set(survivor);
            }

            let next = weak.next();
            weak.set_next(Obj::ZERO);
            survivor = next;
        }
    }

    /* Class table mourning: dead classes return their ids to the free list. */

    fn mourn_class_table_scavenge(&mut self) {
        for i in FIRST_LEGAL_CID..self.class_table.len() {
            let old_target = self.class_table[i];
            if old_target.is_immediate_or_old_object() {
                continue;
            }

            if is_forwarded(old_target) {
                self.class_table[i] = forwarding_target(old_target);
            } else {
                self.class_table[i] = Obj::smi(self.class_table_free as isize);
                self.class_table_free = i;
            }
        }
    }

    fn mourn_class_table_mark_sweep(&mut self) {
        for i in FIRST_LEGAL_CID..self.class_table.len() {
            let target = self.class_table[i];
            if Self::is_mark_sweep_survivor(target) {
                continue;
            }
            self.class_table[i] = Obj::smi(self.class_table_free as isize);
            self.class_table_free = i;
        }
    }

    fn mourn_class_table_forwarded(&mut self) {
        for i in FIRST_LEGAL_CID..self.class_table.len() {
            let old_class = self.class_table[i];
            if !old_class.is_forwarding_corpse() {
                continue;
            }
            debug_assert!(i >= FIRST_REGULAR_OBJECT_CID);
            self.class_table[i] = Obj::smi(self.class_table_free as isize);
            self.class_table_free = i;
        }
    }

    /* Become */

    /// Swap the identities of paired elements. The forwardee inherits the
    /// forwarder's identity hash; instances of forwarded classes migrate to
    /// the surviving class id; every root and heap slot is repointed and
    /// the remembered set rebuilt.
    pub fn become_forward(&mut self, old: Obj, new: Obj) -> bool {
        if !old.is_array() || !new.is_array() {
            return false;
        }
        let old = Array::cast(old);
        let new = Array::cast(new);
        if old.len() != new.len() {
            return false;
        }

        let length = old.len();
        debug!(target: "become", length, "become");

        for i in 0..length {
            if old.element(i).is_smi() || new.element(i).is_smi() {
                return false;
            }
        }

        self.interpreter().gc_prologue(); // Before creating forwarders!

        for i in 0..length {
            let forwarder = old.element(i);
            let forwardee = new.element(i);

            debug_assert!(!forwarder.is_forwarding_corpse());
            debug_assert!(!forwardee.is_forwarding_corpse());

            forwardee.set_header_hash(forwarder.header_hash());

            let heap_size = forwarder.heap_size();
            let corpse_obj = Obj::initialize(forwarder.addr(), FORWARDING_CORPSE_CID, heap_size);
            let corpse = ForwardingCorpse::cast(corpse_obj);
            if corpse_obj.header_heap_size() == 0 {
                corpse.set_overflow_size(heap_size);
            }
            debug_assert!(corpse_obj.heap_size() == heap_size);

            corpse.set_target(forwardee);
        }

        self.forward_class_ids();
        self.forward_roots();
        self.forward_heap(); // With forwarded class ids.
        self.mourn_class_table_forwarded();

        self.interpreter().gc_epilogue();

        true
    }

    fn forward_pointer(ptr: *mut Obj) -> bool {
        let old_target = unsafe { *ptr };
        if old_target.is_heap_object() && old_target.is_forwarding_corpse() {
            let new_target = ForwardingCorpse::cast(old_target).target();
            debug_assert!(!new_target.is_forwarding_corpse());
            unsafe { *ptr = new_target }
            return new_target.is_new_object();
        }
        old_target.is_new_object()
    }

    fn forward_class(&mut self, obj: Obj) -> bool {
        let old_class = self.class_at(obj.cid());
        if old_class.is_forwarding_corpse() {
            let new_class = Behavior::cast(ForwardingCorpse::cast(old_class).target());
            debug_assert!(!new_class.obj().is_forwarding_corpse());
            obj.set_cid(new_class.id().smi_value() as Cid);
            return new_class.obj().is_new_object();
        }
        old_class.is_new_object()
    }

    fn forward_roots(&mut self) {
        for i in 0..self.handles_size {
            Self::forward_pointer(self.handles[i]);
        }

        let (roots, roots_len) = self.interpreter().root_pointers();
        for i in 0..roots_len {
            Self::forward_pointer(unsafe { roots.add(i) });
        }
        let (stack, stack_len) = self.interpreter().stack_pointers();
        for i in 0..stack_len {
            Self::forward_pointer(unsafe { stack.add(i) });
        }
    }

    fn forward_heap(&mut self) {
        let mut scan = self.to_space.object_start();
        while scan < self.top {
            let obj = Obj::from_addr(scan);
            if obj.cid() >= FIRST_LEGAL_CID {
                self.forward_class(obj);
                let (slots, len) = obj.pointers();
                for i in 0..len {
                    Self::forward_pointer(unsafe { slots.add(i) });
                }
            }
            scan += obj.heap_size();
        }

        self.remembered_set.clear();
        for index in 0..self.regions.len() {
            let mut scan = self.regions[index].object_start();
            let end = self.regions[index].object_end;
            while scan < end {
                let obj = Obj::from_addr(scan);
                if obj.cid() >= FIRST_LEGAL_CID {
                    obj.set_is_remembered(false);
                    let mut has_new_target = self.forward_class(obj);
                    let (slots, len) = obj.pointers();
                    for i in 0..len {
                        has_new_target |= Self::forward_pointer(unsafe { slots.add(i) });
                    }
                    if has_new_target {
                        self.add_to_remembered_set(obj);
                    }
                }
                scan += obj.heap_size();
            }
        }
    }

    /// Forwarded classes keep the forwarder's cid: kinds with fixed ids
    /// must not migrate, so all classes are treated alike. The mark bit
    /// guards against swapping a pair back.
    fn forward_class_ids(&mut self) {
        let nil = self.interpreter().nil_obj();
        for old_cid in FIRST_LEGAL_CID..self.class_table.len() {
            let old_class = self.class_table[old_cid];
            if !old_class.is_forwarding_corpse() {
                continue;
            }
            if old_class.is_marked() {
                continue; // Already swapped: don't swap back.
            }

            let new_class = Behavior::cast(ForwardingCorpse::cast(old_class).target());
            debug_assert!(!new_class.obj().is_forwarding_corpse());

            if new_class.id() != nil {
                // Arrange for instances with the new cid to migrate to the
                // old cid.
                let new_cid = new_class.id().smi_value() as Cid;
                self.class_table[new_cid] = old_class;
            }

            new_class.set_id(Obj::smi(old_cid as isize));
            self.class_table[old_cid] = new_class.obj();
            old_class.set_is_marked(true);
        }

        for cid in FIRST_LEGAL_CID..self.class_table.len() {
            let klass = self.class_table[cid];
            if klass.is_heap_object() && klass.is_forwarding_corpse() {
                klass.set_is_marked(false);
            }
        }
    }

    /* Heap reflection */

    fn truncate(array: Array, new_size: usize) {
        debug_assert!(new_size <= array.len());

        let old_heap_size = allocation_size((Array::ELEMENTS_WORD + array.len()) * WORD_SIZE);
        let new_heap_size = allocation_size((Array::ELEMENTS_WORD + new_size) * WORD_SIZE);
        debug_assert!(array.obj().heap_size() == old_heap_size);

        array.set_size(Obj::smi(new_size as isize));
        array.obj().set_header_heap_size(new_heap_size);

        let free_size = old_heap_size - new_heap_size;
        if free_size != 0 {
            let free_start = array.obj().addr() + new_heap_size;
            let stub = Obj::initialize(free_start, FREE_LIST_ELEMENT_CID, free_size);
            let element = FreeListElement::cast(stub);
            element.set_next(Obj::ZERO);
            if stub.header_heap_size() == 0 {
                element.set_overflow_size(free_size);
            }
        }
    }

    fn count_instances(&self, cid: Cid, start: usize, end: usize) -> usize {
        let mut count = 0;
        let mut scan = start;
        while scan < end {
            let obj = Obj::from_addr(scan);
            if obj.cid() == cid {
                count += 1;
            }
            scan += obj.heap_size();
        }
        count
    }

    fn collect_instances(&self, result: Array, mut cursor: usize, cid: Cid, start: usize, end: usize) -> usize {
        let mut scan = start;
        while scan < end {
            let obj = Obj::from_addr(scan);
            if obj.cid() == cid {
                result.init_element(cursor, obj);
                cursor += 1;
            }
            scan += obj.heap_size();
        }
        cursor
    }

    /// All current instances of `cls`, as a fresh array.
    pub fn instances_of(&mut self, cls: Obj) -> Obj {
        let behavior = Behavior::cast(cls);
        if behavior.id() == self.interpreter().nil_obj() {
            // Class not yet registered: nothing was ever allocated.
            return self.allocate_array(0, Allocator::Normal); // SAFEPOINT
        }
        let cid = behavior.id().smi_value() as Cid;

        let mut count = self.count_instances(cid, self.to_space.object_start(), self.top);
        for region in &self.regions {
            count = count + self.count_instances(cid, region.object_start(), region.object_end);
        }
        if cid == ARRAY_CID {
            count += 1; // The result array itself.
        }

        let result = Array::cast(self.allocate_array(count, Allocator::Normal)); // SAFEPOINT

        let mut cursor =
            self.collect_instances(result, 0, cid, self.to_space.object_start(), self.top);
        for region in &self.regions {
            cursor =
                self.collect_instances(result, cursor, cid, region.object_start(), region.object_end);
        }

        // Allocating the result may have collected, leaving fewer instances
        // than first counted.
        Self::truncate(result, cursor);
        result.obj()
    }

    fn count_references(&self, target: Obj, start: usize, end: usize) -> usize {
        let mut count = 0;
        let mut scan = start;
        while scan < end {
            let obj = Obj::from_addr(scan);
            if obj.cid() >= FIRST_LEGAL_CID {
                let (slots, len) = obj.pointers();
                for i in 0..len {
                    if unsafe { *slots.add(i) } == target {
                        count += 1;
                        break;
                    }
                }
            }
            scan += obj.heap_size();
        }
        count
    }

    fn collect_references(&self, result: Array, mut cursor: usize, target: Obj, start: usize, end: usize) -> usize {
        let mut scan = start;
        while scan < end {
            let obj = Obj::from_addr(scan);
            if obj.cid() >= FIRST_LEGAL_CID {
                let (slots, len) = obj.pointers();
                for i in 0..len {
                    if unsafe { *slots.add(i) } == target {
                        result.init_element(cursor, obj);
                        cursor += 1;
                        break;
                    }
                }
            }
            scan += obj.heap_size();
        }
        cursor
    }

    /// All objects with a slot equal to `target`, as a fresh array.
    pub fn references_to(&mut self, mut target: Obj) -> Obj {
        let mut count = self.count_references(target, self.to_space.object_start(), self.top);
        for region in &self.regions {
            count = count + self.count_references(target, region.object_start(), region.object_end);
        }

        let result;
        {
            let _h1 = HandleScope::new(self, &mut target);
            result = Array::cast(self.allocate_array(count, Allocator::Normal)); // SAFEPOINT
        }

        let mut cursor =
            self.collect_references(result, 0, target, self.to_space.object_start(), self.top);
        for region in &self.regions {
            cursor = self.collect_references(
                result,
                cursor,
                target,
                region.object_start(),
                region.object_end,
            );
        }

        Self::truncate(result, cursor);
        result.obj()
    }
}

/// Registers a stack slot with the heap for the dynamic extent of a
/// safepoint: collection repoints the slot instead of leaving it stale.
pub struct HandleScope {
    heap: *mut Heap,
}

impl HandleScope {
    pub fn new(heap: &mut Heap, slot: &mut Obj) -> HandleScope {
        assert!(heap.handles_size < HANDLES_CAPACITY);
        heap.handles[heap.handles_size] = slot as *mut Obj;
        heap.handles_size += 1;
        HandleScope { heap }
    }
}

impl Drop for HandleScope {
    fn drop(&mut self) {
        unsafe { (*self.heap).handles_size -= 1 }
    }
}
