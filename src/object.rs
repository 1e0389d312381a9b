//! Tagged words, object headers, and typed views over heap objects.
//!
//! A word is either an immediate small integer (low bit clear, payload
//! shifted left by one) or a heap reference (low bit set, address plus one).
//! Heap objects begin with a header word (mark/remembered/canonical bits,
//! size-in-alignment-units, class id) and an aux word that holds the
//! identity hash on live objects and is repurposed as a forwarding pointer
//! or free-list link during collection.
//!
//! All raw address arithmetic in the VM lives here and in the heap module.
//! Everything outside manipulates `Obj` values and the typed views below.

use crate::consts::*;
use crate::heap::Heap;
use crate::memory::allocation_size;

#[cfg(target_pointer_width = "64")]
pub type Digit = u32;
#[cfg(target_pointer_width = "64")]
pub type DDigit = u64;

#[cfg(target_pointer_width = "32")]
pub type Digit = u16;
#[cfg(target_pointer_width = "32")]
pub type DDigit = u32;

/// Bits in one large-integer digit.
pub const DIGIT_BITS: u32 = Digit::BITS;

/// A tagged word: a small integer or a heap reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Obj(usize);

impl Obj {
    /// The untagged zero word. A valid Smi, used as the vacant marker in
    /// frame slots and intrusive list heads.
    pub const ZERO: Obj = Obj(0);

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn from_raw(raw: usize) -> Obj {
        Obj(raw)
    }

    #[inline]
    pub fn smi(value: isize) -> Obj {
        debug_assert!(Obj::is_smi_value(value));
        Obj((value as usize) << SMI_TAG_SHIFT)
    }

    /// Whether `value` survives the tag shift. Checks that the top two bits
    /// agree.
    #[inline]
    pub fn is_smi_value(value: isize) -> bool {
        (value ^ value.wrapping_shl(1)) >= 0
    }

    #[inline]
    pub fn smi_value(self) -> isize {
        debug_assert!(self.is_smi());
        (self.0 as isize) >> SMI_TAG_SHIFT
    }

    #[inline]
    pub fn from_addr(addr: usize) -> Obj {
        debug_assert!(addr & SMI_TAG_MASK == 0);
        Obj(addr + HEAP_OBJECT_TAG)
    }

    #[inline]
    pub fn addr(self) -> usize {
        debug_assert!(self.is_heap_object());
        self.0 - HEAP_OBJECT_TAG
    }

    #[inline]
    pub fn is_smi(self) -> bool {
        self.0 & SMI_TAG_MASK == SMI_TAG
    }

    #[inline]
    pub fn is_heap_object(self) -> bool {
        self.0 & SMI_TAG_MASK == HEAP_OBJECT_TAG
    }

    #[inline]
    pub fn is_old_object(self) -> bool {
        self.0 & OBJECT_ALIGNMENT_MASK == OLD_OBJECT_BITS
    }

    #[inline]
    pub fn is_new_object(self) -> bool {
        self.0 & OBJECT_ALIGNMENT_MASK == NEW_OBJECT_BITS
    }

    /// Like `!is_heap_object() || is_old_object()`, in a single compare.
    #[inline]
    pub fn is_immediate_or_old_object(self) -> bool {
        self.0 & OBJECT_ALIGNMENT_MASK != NEW_OBJECT_BITS
    }

    #[inline]
    pub fn is_immediate_or_new_object(self) -> bool {
        self.0 & OBJECT_ALIGNMENT_MASK != OLD_OBJECT_BITS
    }

    /// Class id of any value; immediates answer without touching memory.
    #[inline]
    pub fn cid(self) -> Cid {
        if self.is_smi() {
            SMI_CID
        } else {
            self.header_cid()
        }
    }

    pub fn is_forwarding_corpse(self) -> bool {
        self.cid() == FORWARDING_CORPSE_CID
    }
    pub fn is_free_list_element(self) -> bool {
        self.cid() == FREE_LIST_ELEMENT_CID
    }
    pub fn is_medium_integer(self) -> bool {
        self.cid() == MINT_CID
    }
    pub fn is_large_integer(self) -> bool {
        self.cid() == BIGINT_CID
    }
    pub fn is_float(self) -> bool {
        self.cid() == FLOAT_CID
    }
    pub fn is_byte_array(self) -> bool {
        self.cid() == BYTE_ARRAY_CID
    }
    pub fn is_string(self) -> bool {
        self.cid() == STRING_CID
    }
    pub fn is_bytes(self) -> bool {
        matches!(self.cid(), BYTE_ARRAY_CID | STRING_CID)
    }
    pub fn is_array(self) -> bool {
        self.cid() == ARRAY_CID
    }
    pub fn is_weak_array(self) -> bool {
        self.cid() == WEAK_ARRAY_CID
    }
    pub fn is_ephemeron(self) -> bool {
        self.cid() == EPHEMERON_CID
    }
    pub fn is_activation(self) -> bool {
        self.cid() == ACTIVATION_CID
    }
    pub fn is_closure(self) -> bool {
        self.cid() == CLOSURE_CID
    }
    pub fn is_regular_object(self) -> bool {
        self.cid() >= FIRST_REGULAR_OBJECT_CID
    }

    /// The receiver's class object, via the heap's class table.
    #[inline]
    pub fn klass(self, heap: &Heap) -> Obj {
        heap.class_at(self.cid())
    }
}

/* Header access. Only meaningful on heap references. */

const HEADER_WORD: usize = 0;
const HASH_WORD: usize = 1;

/// Words occupied by the header (header word + hash/aux word).
pub const HEADER_WORDS: usize = 2;

#[inline]
pub(crate) fn slot_ptr(obj: Obj, word: usize) -> *mut Obj {
    (obj.addr() + word * WORD_SIZE) as *mut Obj
}

#[inline]
fn load_word(obj: Obj, word: usize) -> usize {
    unsafe { *((obj.addr() + word * WORD_SIZE) as *const usize) }
}

#[inline]
fn store_word(obj: Obj, word: usize, value: usize) {
    unsafe { *((obj.addr() + word * WORD_SIZE) as *mut usize) = value }
}

#[inline]
pub(crate) fn load_slot(obj: Obj, word: usize) -> Obj {
    unsafe { *slot_ptr(obj, word) }
}

/// Store without the generational barrier. The value must be provably
/// immediate or old, or the containing object must be newly allocated.
#[inline]
pub(crate) fn store_slot_no_barrier(obj: Obj, word: usize, value: Obj) {
    unsafe { *slot_ptr(obj, word) = value }
}

/// Store through the generational write barrier: an old container gaining a
/// new-space child enters the remembered set exactly once.
#[inline]
pub(crate) fn store_slot(heap: &mut Heap, obj: Obj, word: usize, value: Obj) {
    unsafe { *slot_ptr(obj, word) = value }
    if obj.is_old_object() && value.is_new_object() && !obj.is_remembered() {
        heap.add_to_remembered_set(obj);
    }
}

impl Obj {
    #[inline]
    fn header(self) -> usize {
        load_word(self, HEADER_WORD)
    }

    #[inline]
    fn set_header(self, header: usize) {
        store_word(self, HEADER_WORD, header)
    }

    pub fn is_marked(self) -> bool {
        self.header() & (1 << MARK_BIT) != 0
    }

    pub fn set_is_marked(self, value: bool) {
        let header = self.header() & !(1 << MARK_BIT);
        self.set_header(header | ((value as usize) << MARK_BIT));
    }

    pub fn is_remembered(self) -> bool {
        self.header() & (1 << REMEMBERED_BIT) != 0
    }

    pub fn set_is_remembered(self, value: bool) {
        let header = self.header() & !(1 << REMEMBERED_BIT);
        self.set_header(header | ((value as usize) << REMEMBERED_BIT));
    }

    pub fn is_canonical(self) -> bool {
        self.header() & (1 << CANONICAL_BIT) != 0
    }

    pub fn set_is_canonical(self, value: bool) {
        let header = self.header() & !(1 << CANONICAL_BIT);
        self.set_header(header | ((value as usize) << CANONICAL_BIT));
    }

    /// Size recorded in the header, in bytes. Zero means variable-sized.
    pub fn header_heap_size(self) -> usize {
        let tag = (self.header() >> SIZE_FIELD_OFFSET) & ((1 << SIZE_FIELD_BITS) - 1);
        tag << OBJECT_ALIGNMENT_LOG2
    }

    pub(crate) fn set_header_heap_size(self, heap_size: usize) {
        debug_assert!(heap_size & OBJECT_ALIGNMENT_MASK == 0);
        let tag = heap_size >> OBJECT_ALIGNMENT_LOG2;
        debug_assert!(tag < (1 << SIZE_FIELD_BITS));
        let mask = ((1usize << SIZE_FIELD_BITS) - 1) << SIZE_FIELD_OFFSET;
        let header = self.header() & !mask;
        self.set_header(header | (tag << SIZE_FIELD_OFFSET));
    }

    fn header_cid(self) -> Cid {
        (self.header() >> CID_FIELD_OFFSET) & ((1 << CID_FIELD_BITS) - 1)
    }

    pub fn set_cid(self, cid: Cid) {
        debug_assert!(cid < (1 << CID_FIELD_BITS));
        let mask = ((1usize << CID_FIELD_BITS) - 1) << CID_FIELD_OFFSET;
        let header = self.header() & !mask;
        self.set_header(header | (cid << CID_FIELD_OFFSET));
    }

    pub fn header_hash(self) -> usize {
        load_word(self, HASH_WORD)
    }

    pub fn set_header_hash(self, hash: usize) {
        store_word(self, HASH_WORD, hash)
    }

    /// Write a fresh header at `addr` and return the tagged reference.
    pub(crate) fn initialize(addr: usize, cid: Cid, heap_size: usize) -> Obj {
        debug_assert!(cid != ILLEGAL_CID);
        debug_assert!(heap_size > 0);
        debug_assert!(heap_size & OBJECT_ALIGNMENT_MASK == 0);
        let mut tag = heap_size >> OBJECT_ALIGNMENT_LOG2;
        if tag >= (1 << SIZE_FIELD_BITS) {
            tag = 0;
            debug_assert!(cid < FIRST_REGULAR_OBJECT_CID);
        }
        let header = (tag << SIZE_FIELD_OFFSET) | (cid << CID_FIELD_OFFSET);
        let obj = Obj::from_addr(addr);
        store_word(obj, HEADER_WORD, header);
        store_word(obj, HASH_WORD, 0);
        debug_assert!(!obj.is_marked());
        obj
    }

    /// Total size in bytes, from the header or from the object's own size
    /// fields when the header tag overflowed.
    pub fn heap_size(self) -> usize {
        let from_tag = self.header_heap_size();
        if from_tag != 0 {
            return from_tag;
        }
        self.heap_size_from_shape()
    }

    fn heap_size_from_shape(self) -> usize {
        match self.header_cid() {
            FORWARDING_CORPSE_CID => ForwardingCorpse::cast(self).overflow_size(),
            FREE_LIST_ELEMENT_CID => FreeListElement::cast(self).overflow_size(),
            BYTE_ARRAY_CID | STRING_CID => {
                allocation_size(Bytes::ELEMENTS_WORD * WORD_SIZE + Bytes::cast(self).len())
            }
            ARRAY_CID => {
                allocation_size((Array::ELEMENTS_WORD + Array::cast(self).len()) * WORD_SIZE)
            }
            WEAK_ARRAY_CID => allocation_size(
                (WeakArray::ELEMENTS_WORD + WeakArray::cast(self).len()) * WORD_SIZE,
            ),
            CLOSURE_CID => allocation_size(
                (Closure::COPIED_WORD + Closure::cast(self).num_copied()) * WORD_SIZE,
            ),
            BIGINT_CID => allocation_size(
                LargeInteger::DIGITS_WORD * WORD_SIZE
                    + LargeInteger::cast(self).capacity() * std::mem::size_of::<Digit>(),
            ),
            cid => panic!("heap size of cid {} not derivable from shape", cid),
        }
    }

    /// The range of tagged slots the collector must visit: a raw pointer to
    /// the first slot and the slot count. Weak arrays answer their elements
    /// (the scavenger handles them off the weak list); bytes-like objects
    /// answer an empty range.
    pub(crate) fn pointers(self) -> (*mut Obj, usize) {
        let none = (std::ptr::null_mut(), 0);
        match self.header_cid() {
            ILLEGAL_CID | SMI_CID => unreachable!("pointers of non-object"),
            FORWARDING_CORPSE_CID | FREE_LIST_ELEMENT_CID => none,
            MINT_CID | FLOAT_CID | BIGINT_CID | BYTE_ARRAY_CID | STRING_CID => none,
            ARRAY_CID => {
                let array = Array::cast(self);
                (slot_ptr(self, Array::ELEMENTS_WORD), array.len())
            }
            WEAK_ARRAY_CID => {
                let array = WeakArray::cast(self);
                (slot_ptr(self, WeakArray::ELEMENTS_WORD), array.len())
            }
            EPHEMERON_CID => (slot_ptr(self, Ephemeron::KEY_WORD), 3),
            ACTIVATION_CID => {
                let activation = Activation::cast(self);
                (
                    slot_ptr(self, Activation::SENDER_WORD),
                    6 + activation.stack_depth(),
                )
            }
            CLOSURE_CID => {
                let closure = Closure::cast(self);
                (
                    slot_ptr(self, Closure::NUM_COPIED_WORD),
                    4 + closure.num_copied(),
                )
            }
            _ => {
                // Regular object: every word after the header, including the
                // alignment padding slot (kept a valid Smi by allocation).
                let num_slots = self.heap_size() / WORD_SIZE - HEADER_WORDS;
                (slot_ptr(self, HEADER_WORDS), num_slots)
            }
        }
    }
}

macro_rules! view {
    ($(#[$doc:meta])* $name:ident, $pred:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(transparent)]
        pub struct $name(Obj);

        impl $name {
            #[inline]
            pub fn cast(obj: Obj) -> $name {
                debug_assert!(obj.$pred(), "cast to {}", stringify!($name));
                $name(obj)
            }

            #[inline]
            pub fn obj(self) -> Obj {
                self.0
            }
        }
    };
}

view!(
    /// An object overwritten in place to redirect to its new identity. The
    /// hash word holds the forwardee.
    ForwardingCorpse,
    is_forwarding_corpse
);

impl ForwardingCorpse {
    const OVERFLOW_SIZE_WORD: usize = 2;

    pub fn target(self) -> Obj {
        Obj::from_raw(self.0.header_hash())
    }

    pub fn set_target(self, target: Obj) {
        self.0.set_header_hash(target.raw());
    }

    pub fn overflow_size(self) -> usize {
        load_word(self.0, Self::OVERFLOW_SIZE_WORD)
    }

    pub fn set_overflow_size(self, size: usize) {
        store_word(self.0, Self::OVERFLOW_SIZE_WORD, size)
    }
}

view!(
    /// A reclaimed run of old space, chained through the hash word.
    FreeListElement,
    is_free_list_element
);

impl FreeListElement {
    const OVERFLOW_SIZE_WORD: usize = 2;

    /// Next element, or `Obj::ZERO` at the end of a chain.
    pub fn next(self) -> Obj {
        Obj::from_raw(self.0.header_hash())
    }

    pub fn set_next(self, next: Obj) {
        self.0.set_header_hash(next.raw());
    }

    pub fn overflow_size(self) -> usize {
        load_word(self.0, Self::OVERFLOW_SIZE_WORD)
    }

    pub fn set_overflow_size(self, size: usize) {
        store_word(self.0, Self::OVERFLOW_SIZE_WORD, size)
    }
}

view!(
    /// Boxed 64-bit signed integer.
    MediumInteger,
    is_medium_integer
);

impl MediumInteger {
    const VALUE_WORD: usize = 2;
    pub const HEAP_SIZE: usize = allocation_size(Self::VALUE_WORD * WORD_SIZE + 8);

    pub fn value(self) -> i64 {
        unsafe { *((self.0.addr() + Self::VALUE_WORD * WORD_SIZE) as *const i64) }
    }

    pub fn set_value(self, value: i64) {
        unsafe { *((self.0.addr() + Self::VALUE_WORD * WORD_SIZE) as *mut i64) = value }
    }
}

view!(
    /// Boxed IEEE-754 double.
    Float,
    is_float
);

impl Float {
    const VALUE_WORD: usize = 2;
    pub const HEAP_SIZE: usize = allocation_size(Self::VALUE_WORD * WORD_SIZE + 8);

    pub fn value(self) -> f64 {
        unsafe { *((self.0.addr() + Self::VALUE_WORD * WORD_SIZE) as *const f64) }
    }

    pub fn set_value(self, value: f64) {
        unsafe { *((self.0.addr() + Self::VALUE_WORD * WORD_SIZE) as *mut f64) = value }
    }
}

view!(
    /// Sign/size/capacity header and inline little-endian digits.
    LargeInteger,
    is_large_integer
);

impl LargeInteger {
    const CAPACITY_WORD: usize = 2;
    const NEGATIVE_WORD: usize = 3;
    const SIZE_WORD: usize = 4;
    pub(crate) const DIGITS_WORD: usize = 5;

    pub fn negative(self) -> bool {
        load_word(self.0, Self::NEGATIVE_WORD) != 0
    }

    pub fn set_negative(self, negative: bool) {
        store_word(self.0, Self::NEGATIVE_WORD, negative as usize)
    }

    /// Digits in use.
    pub fn size(self) -> usize {
        load_word(self.0, Self::SIZE_WORD)
    }

    pub fn set_size(self, size: usize) {
        debug_assert!(size <= self.capacity());
        store_word(self.0, Self::SIZE_WORD, size)
    }

    /// Digits allocated.
    pub fn capacity(self) -> usize {
        load_word(self.0, Self::CAPACITY_WORD)
    }

    pub(crate) fn set_capacity(self, capacity: usize) {
        store_word(self.0, Self::CAPACITY_WORD, capacity)
    }

    fn digit_ptr(self, index: usize) -> *mut Digit {
        debug_assert!(index < self.capacity());
        unsafe { (self.0.addr() as *mut Digit).add(Self::DIGITS_WORD * WORD_SIZE / std::mem::size_of::<Digit>() + index) }
    }

    pub fn digit(self, index: usize) -> Digit {
        unsafe { *self.digit_ptr(index) }
    }

    pub fn set_digit(self, index: usize, value: Digit) {
        unsafe { *self.digit_ptr(index) = value }
    }
}

view!(
    /// Size slot and inline bytes; covers both byte arrays and strings.
    Bytes,
    is_bytes
);

impl Bytes {
    const SIZE_WORD: usize = 2;
    pub(crate) const ELEMENTS_WORD: usize = 3;

    pub fn size(self) -> Obj {
        load_slot(self.0, Self::SIZE_WORD)
    }

    pub(crate) fn set_size(self, size: Obj) {
        store_slot_no_barrier(self.0, Self::SIZE_WORD, size)
    }

    pub fn len(self) -> usize {
        self.size().smi_value() as usize
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    pub(crate) fn element_addr(self, index: usize) -> *mut u8 {
        (self.0.addr() + Self::ELEMENTS_WORD * WORD_SIZE + index) as *mut u8
    }

    pub fn element(self, index: usize) -> u8 {
        debug_assert!(index < self.len());
        unsafe { *self.element_addr(index) }
    }

    pub fn set_element(self, index: usize, value: u8) {
        debug_assert!(index < self.len());
        unsafe { *self.element_addr(index) = value }
    }

    pub fn as_slice(self) -> &'static [u8] {
        unsafe { std::slice::from_raw_parts(self.element_addr(0), self.len()) }
    }

    pub fn copy_from(self, bytes: &[u8]) {
        debug_assert!(bytes.len() == self.len());
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.element_addr(0), bytes.len())
        }
    }

    /// The identity hash of a string is its salted content hash; computed
    /// lazily and stored in the hash word.
    pub fn ensure_hash(self, salt: u64) -> isize {
        let mut hash = self.0.header_hash();
        if hash == 0 {
            hash = string_hash(self.as_slice(), salt);
            self.0.set_header_hash(hash);
        }
        hash as isize
    }
}

/// Salted FNV-1a over the string's bytes, folded into the positive Smi
/// range and kept nonzero (zero means "unassigned" in the hash word).
pub fn string_hash(bytes: &[u8], salt: u64) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325 ^ salt;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let folded = (hash as usize) & (SMI_MAX as usize);
    if folded == 0 {
        1
    } else {
        folded
    }
}

view!(
    /// Size slot and inline object slots.
    Array,
    is_array
);

impl Array {
    const SIZE_WORD: usize = 2;
    pub(crate) const ELEMENTS_WORD: usize = 3;

    pub fn size(self) -> Obj {
        load_slot(self.0, Self::SIZE_WORD)
    }

    pub(crate) fn set_size(self, size: Obj) {
        store_slot_no_barrier(self.0, Self::SIZE_WORD, size)
    }

    pub fn len(self) -> usize {
        self.size().smi_value() as usize
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    pub fn element(self, index: usize) -> Obj {
        debug_assert!(index < self.len());
        load_slot(self.0, Self::ELEMENTS_WORD + index)
    }

    pub fn set_element(self, heap: &mut Heap, index: usize, value: Obj) {
        debug_assert!(index < self.len());
        store_slot(heap, self.0, Self::ELEMENTS_WORD + index, value)
    }

    pub fn init_element(self, index: usize, value: Obj) {
        debug_assert!(index < self.len());
        store_slot_no_barrier(self.0, Self::ELEMENTS_WORD + index, value)
    }
}

view!(
    /// Like an array, but elements do not keep their targets alive. Carries
    /// a GC-private intrusive next link that ordinary tracing never visits.
    WeakArray,
    is_weak_array
);

impl WeakArray {
    const SIZE_WORD: usize = 2;
    const NEXT_WORD: usize = 3;
    pub(crate) const ELEMENTS_WORD: usize = 4;

    pub fn size(self) -> Obj {
        load_slot(self.0, Self::SIZE_WORD)
    }

    pub(crate) fn set_size(self, size: Obj) {
        store_slot_no_barrier(self.0, Self::SIZE_WORD, size)
    }

    pub fn len(self) -> usize {
        self.size().smi_value() as usize
    }

    /// GC-private; bypasses the barrier.
    pub(crate) fn next(self) -> Obj {
        load_slot(self.0, Self::NEXT_WORD)
    }

    pub(crate) fn set_next(self, next: Obj) {
        store_slot_no_barrier(self.0, Self::NEXT_WORD, next)
    }

    pub fn element(self, index: usize) -> Obj {
        debug_assert!(index < self.len());
        load_slot(self.0, Self::ELEMENTS_WORD + index)
    }

    pub fn set_element(self, heap: &mut Heap, index: usize, value: Obj) {
        debug_assert!(index < self.len());
        store_slot(heap, self.0, Self::ELEMENTS_WORD + index, value)
    }

    pub fn init_element(self, index: usize, value: Obj) {
        debug_assert!(index < self.len());
        store_slot_no_barrier(self.0, Self::ELEMENTS_WORD + index, value)
    }
}

view!(
    /// Key, value, and finalizer with key-dependent reachability, plus the
    /// GC-private next link.
    Ephemeron,
    is_ephemeron
);

impl Ephemeron {
    pub(crate) const KEY_WORD: usize = 2;
    const VALUE_WORD: usize = 3;
    const FINALIZER_WORD: usize = 4;
    const NEXT_WORD: usize = 5;

    /// Named slots of an ephemeron, as the image sees them.
    pub const NUM_SLOTS: usize = 3;

    pub fn key(self) -> Obj {
        load_slot(self.0, Self::KEY_WORD)
    }

    pub fn set_key(self, heap: &mut Heap, key: Obj) {
        store_slot(heap, self.0, Self::KEY_WORD, key)
    }

    pub fn set_key_no_barrier(self, key: Obj) {
        store_slot_no_barrier(self.0, Self::KEY_WORD, key)
    }

    pub fn value(self) -> Obj {
        load_slot(self.0, Self::VALUE_WORD)
    }

    pub fn set_value(self, heap: &mut Heap, value: Obj) {
        store_slot(heap, self.0, Self::VALUE_WORD, value)
    }

    pub fn set_value_no_barrier(self, value: Obj) {
        store_slot_no_barrier(self.0, Self::VALUE_WORD, value)
    }

    pub fn finalizer(self) -> Obj {
        load_slot(self.0, Self::FINALIZER_WORD)
    }

    pub fn set_finalizer(self, heap: &mut Heap, finalizer: Obj) {
        store_slot(heap, self.0, Self::FINALIZER_WORD, finalizer)
    }

    pub fn set_finalizer_no_barrier(self, finalizer: Obj) {
        store_slot_no_barrier(self.0, Self::FINALIZER_WORD, finalizer)
    }

    pub(crate) fn key_slot(self) -> *mut Obj {
        slot_ptr(self.0, Self::KEY_WORD)
    }

    pub(crate) fn next(self) -> Obj {
        load_slot(self.0, Self::NEXT_WORD)
    }

    pub(crate) fn set_next(self, next: Obj) {
        store_slot_no_barrier(self.0, Self::NEXT_WORD, next)
    }
}

view!(
    /// A reified stack frame: sender, bytecode index, method, closure,
    /// receiver, and a fixed-length temp area.
    ///
    /// The sender slot double-duties: a heap activation for suspended
    /// chains, or a Smi-encoded frame pointer while a live frame mirrors
    /// this activation.
    Activation,
    is_activation
);

impl Activation {
    pub(crate) const SENDER_WORD: usize = 2;
    const BCI_WORD: usize = 3;
    const METHOD_WORD: usize = 4;
    const CLOSURE_WORD: usize = 5;
    const RECEIVER_WORD: usize = 6;
    const STACK_DEPTH_WORD: usize = 7;
    const TEMPS_WORD: usize = 8;

    pub const HEAP_SIZE: usize = allocation_size((Self::TEMPS_WORD + MAX_TEMPS) * WORD_SIZE);

    pub fn sender(self) -> Obj {
        load_slot(self.0, Self::SENDER_WORD)
    }

    pub fn set_sender(self, heap: &mut Heap, sender: Obj) {
        store_slot(heap, self.0, Self::SENDER_WORD, sender)
    }

    pub fn set_sender_no_barrier(self, sender: Obj) {
        store_slot_no_barrier(self.0, Self::SENDER_WORD, sender)
    }

    /// Frame pointer stashed while a frame mirrors this activation.
    pub(crate) fn sender_fp(self) -> usize {
        self.sender().smi_value() as usize
    }

    pub(crate) fn set_sender_fp(self, fp: usize) {
        store_slot_no_barrier(self.0, Self::SENDER_WORD, Obj::smi(fp as isize))
    }

    pub fn bci(self) -> Obj {
        load_slot(self.0, Self::BCI_WORD)
    }

    pub fn set_bci(self, bci: Obj) {
        store_slot_no_barrier(self.0, Self::BCI_WORD, bci)
    }

    pub fn method(self) -> Obj {
        load_slot(self.0, Self::METHOD_WORD)
    }

    pub fn set_method(self, heap: &mut Heap, method: Obj) {
        store_slot(heap, self.0, Self::METHOD_WORD, method)
    }

    pub fn set_method_no_barrier(self, method: Obj) {
        store_slot_no_barrier(self.0, Self::METHOD_WORD, method)
    }

    pub fn closure(self) -> Obj {
        load_slot(self.0, Self::CLOSURE_WORD)
    }

    pub fn set_closure(self, heap: &mut Heap, closure: Obj) {
        store_slot(heap, self.0, Self::CLOSURE_WORD, closure)
    }

    pub fn set_closure_no_barrier(self, closure: Obj) {
        store_slot_no_barrier(self.0, Self::CLOSURE_WORD, closure)
    }

    pub fn receiver(self) -> Obj {
        load_slot(self.0, Self::RECEIVER_WORD)
    }

    pub fn set_receiver(self, heap: &mut Heap, receiver: Obj) {
        store_slot(heap, self.0, Self::RECEIVER_WORD, receiver)
    }

    pub fn set_receiver_no_barrier(self, receiver: Obj) {
        store_slot_no_barrier(self.0, Self::RECEIVER_WORD, receiver)
    }

    pub fn stack_depth(self) -> usize {
        load_slot(self.0, Self::STACK_DEPTH_WORD).smi_value() as usize
    }

    pub fn set_stack_depth(self, depth: usize) {
        store_slot_no_barrier(self.0, Self::STACK_DEPTH_WORD, Obj::smi(depth as isize))
    }

    pub fn temp(self, index: usize) -> Obj {
        debug_assert!(index < MAX_TEMPS);
        load_slot(self.0, Self::TEMPS_WORD + index)
    }

    pub fn set_temp(self, heap: &mut Heap, index: usize, value: Obj) {
        debug_assert!(index < MAX_TEMPS);
        store_slot(heap, self.0, Self::TEMPS_WORD + index, value)
    }

    pub fn init_temp(self, index: usize, value: Obj) {
        debug_assert!(index < MAX_TEMPS);
        store_slot_no_barrier(self.0, Self::TEMPS_WORD + index, value)
    }

    pub fn pop_n_and_push(self, heap: &mut Heap, drop_count: usize, value: Obj) {
        debug_assert!(drop_count <= self.stack_depth());
        self.set_stack_depth(self.stack_depth() - drop_count + 1);
        self.set_temp(heap, self.stack_depth() - 1, value);
    }

    pub fn push(self, heap: &mut Heap, value: Obj) {
        self.pop_n_and_push(heap, 0, value);
    }
}

view!(
    /// Defining activation, initial bytecode index, argument count, and
    /// copied free variables.
    Closure,
    is_closure
);

impl Closure {
    pub(crate) const NUM_COPIED_WORD: usize = 2;
    const DEFINING_ACTIVATION_WORD: usize = 3;
    const INITIAL_BCI_WORD: usize = 4;
    const NUM_ARGS_WORD: usize = 5;
    pub(crate) const COPIED_WORD: usize = 6;

    pub fn num_copied(self) -> usize {
        load_slot(self.0, Self::NUM_COPIED_WORD).smi_value() as usize
    }

    pub(crate) fn set_num_copied(self, num_copied: usize) {
        store_slot_no_barrier(self.0, Self::NUM_COPIED_WORD, Obj::smi(num_copied as isize))
    }

    pub fn defining_activation(self) -> Obj {
        load_slot(self.0, Self::DEFINING_ACTIVATION_WORD)
    }

    pub fn set_defining_activation(self, heap: &mut Heap, activation: Obj) {
        store_slot(heap, self.0, Self::DEFINING_ACTIVATION_WORD, activation)
    }

    pub fn init_defining_activation(self, activation: Obj) {
        store_slot_no_barrier(self.0, Self::DEFINING_ACTIVATION_WORD, activation)
    }

    pub fn initial_bci(self) -> Obj {
        load_slot(self.0, Self::INITIAL_BCI_WORD)
    }

    pub fn set_initial_bci(self, bci: Obj) {
        store_slot_no_barrier(self.0, Self::INITIAL_BCI_WORD, bci)
    }

    pub fn num_args(self) -> Obj {
        load_slot(self.0, Self::NUM_ARGS_WORD)
    }

    pub fn set_num_args(self, num_args: Obj) {
        store_slot_no_barrier(self.0, Self::NUM_ARGS_WORD, num_args)
    }

    pub fn copied(self, index: usize) -> Obj {
        debug_assert!(index < self.num_copied());
        load_slot(self.0, Self::COPIED_WORD + index)
    }

    pub fn set_copied(self, heap: &mut Heap, index: usize, value: Obj) {
        debug_assert!(index < self.num_copied());
        store_slot(heap, self.0, Self::COPIED_WORD + index, value)
    }

    pub fn init_copied(self, index: usize, value: Obj) {
        debug_assert!(index < self.num_copied());
        store_slot_no_barrier(self.0, Self::COPIED_WORD + index, value)
    }
}

view!(
    /// An ordinary instance: named slots only.
    RegularObject,
    is_heap_object
);

impl RegularObject {
    pub(crate) const SLOTS_WORD: usize = HEADER_WORDS;

    pub fn slot(self, index: usize) -> Obj {
        load_slot(self.0, Self::SLOTS_WORD + index)
    }

    pub fn set_slot(self, heap: &mut Heap, index: usize, value: Obj) {
        store_slot(heap, self.0, Self::SLOTS_WORD + index, value)
    }

    pub fn init_slot(self, index: usize, value: Obj) {
        store_slot_no_barrier(self.0, Self::SLOTS_WORD + index, value)
    }
}

/* Behavior, Class, Metaclass, AbstractMixin, Method, Message, and
ObjectStore are regular objects whose slot positions the VM knows. */

view!(
    /// A class or metaclass: layout, method array, superclass, and mixin.
    Behavior,
    is_regular_object
);

impl Behavior {
    const SUPERCLASS_SLOT: usize = 0;
    const METHODS_SLOT: usize = 1;
    const ENCLOSING_OBJECT_SLOT: usize = 2;
    const MIXIN_SLOT: usize = 3;
    const CLASSID_SLOT: usize = 4;
    const FORMAT_SLOT: usize = 5;

    /// Slot count of a Class-shaped behavior (Behavior plus name and
    /// weakly-held subclasses).
    pub const CLASS_SLOTS: usize = 8;

    fn regular(self) -> RegularObject {
        RegularObject::cast(self.0)
    }

    pub fn superclass(self) -> Obj {
        self.regular().slot(Self::SUPERCLASS_SLOT)
    }

    pub fn methods(self) -> Obj {
        self.regular().slot(Self::METHODS_SLOT)
    }

    pub fn enclosing_object(self) -> Obj {
        self.regular().slot(Self::ENCLOSING_OBJECT_SLOT)
    }

    pub fn mixin(self) -> Obj {
        self.regular().slot(Self::MIXIN_SLOT)
    }

    pub fn id(self) -> Obj {
        self.regular().slot(Self::CLASSID_SLOT)
    }

    pub fn set_id(self, id: Obj) {
        self.regular().init_slot(Self::CLASSID_SLOT, id)
    }

    pub fn format(self) -> Obj {
        self.regular().slot(Self::FORMAT_SLOT)
    }

    /// A behavior is a class (8 slots) or metaclass (7 slots, padded to the
    /// same footprint); anything else in a class-table slot is corruption.
    pub fn assert_could_be_behavior(self) {
        debug_assert!(self.0.is_regular_object());
        let heap_words = self.0.heap_size() / WORD_SIZE;
        debug_assert!(
            heap_words == 8 || heap_words == 10,
            "implausible behavior of {} words",
            heap_words
        );
    }
}

view!(
    /// Class view over a behavior.
    Class,
    is_regular_object
);

impl Class {
    const NAME_SLOT: usize = 6;
    const SUBCLASSES_SLOT: usize = 7;

    pub fn name(self) -> Obj {
        RegularObject::cast(self.0).slot(Self::NAME_SLOT)
    }

    pub fn subclasses(self) -> Obj {
        RegularObject::cast(self.0).slot(Self::SUBCLASSES_SLOT)
    }
}

view!(
    /// A reusable bundle of methods and its lexical enclosure.
    AbstractMixin,
    is_regular_object
);

impl AbstractMixin {
    const NAME_SLOT: usize = 0;
    const METHODS_SLOT: usize = 1;
    const ENCLOSING_MIXIN_SLOT: usize = 2;

    pub fn name(self) -> Obj {
        RegularObject::cast(self.0).slot(Self::NAME_SLOT)
    }

    pub fn methods(self) -> Obj {
        RegularObject::cast(self.0).slot(Self::METHODS_SLOT)
    }

    pub fn enclosing_mixin(self) -> Obj {
        RegularObject::cast(self.0).slot(Self::ENCLOSING_MIXIN_SLOT)
    }
}

view!(
    /// Compiled method: packed header, literals, bytecode, defining mixin,
    /// selector, and source.
    Method,
    is_regular_object
);

impl Method {
    const HEADER_SLOT: usize = 0;
    const LITERALS_SLOT: usize = 1;
    const BYTECODE_SLOT: usize = 2;
    const MIXIN_SLOT: usize = 3;
    const SELECTOR_SLOT: usize = 4;
    const SOURCE_SLOT: usize = 5;

    pub const NUM_SLOTS: usize = 6;

    fn regular(self) -> RegularObject {
        RegularObject::cast(self.0)
    }

    pub fn header(self) -> Obj {
        self.regular().slot(Self::HEADER_SLOT)
    }

    pub fn literals(self) -> Obj {
        self.regular().slot(Self::LITERALS_SLOT)
    }

    pub fn bytecode(self) -> Obj {
        self.regular().slot(Self::BYTECODE_SLOT)
    }

    pub fn mixin(self) -> Obj {
        self.regular().slot(Self::MIXIN_SLOT)
    }

    pub fn selector(self) -> Obj {
        self.regular().slot(Self::SELECTOR_SLOT)
    }

    pub fn source(self) -> Obj {
        self.regular().slot(Self::SOURCE_SLOT)
    }

    fn header_value(self) -> usize {
        self.header().smi_value() as usize
    }

    pub fn is_public(self) -> bool {
        (self.header_value() >> 28) as isize == METHOD_PUBLIC
    }

    pub fn is_protected(self) -> bool {
        (self.header_value() >> 28) as isize == METHOD_PROTECTED
    }

    pub fn is_private(self) -> bool {
        (self.header_value() >> 28) as isize == METHOD_PRIVATE
    }

    pub fn primitive(self) -> usize {
        (self.header_value() >> 16) & 1023
    }

    pub fn num_args(self) -> usize {
        self.header_value() & 255
    }

    pub fn num_temps(self) -> usize {
        (self.header_value() >> 8) & 255
    }

    /// Instruction pointer for a 1-origin bytecode index.
    pub fn ip(self, bci: Obj) -> *const u8 {
        let bytecode = Bytes::cast(self.bytecode());
        debug_assert!(bci.smi_value() >= 1);
        debug_assert!(bci.smi_value() as usize <= bytecode.len() + 1);
        unsafe { bytecode.element_addr(0).add(bci.smi_value() as usize - 1) }
    }

    /// 1-origin bytecode index for an instruction pointer.
    pub fn bci(self, ip: *const u8) -> Obj {
        let bytecode = Bytes::cast(self.bytecode());
        let base = bytecode.element_addr(0) as usize;
        Obj::smi((ip as usize - base + 1) as isize)
    }
}

view!(
    /// Selector and arguments of a failed send, handed to the image's
    /// doesNotUnderstand: protocol.
    Message,
    is_regular_object
);

impl Message {
    const SELECTOR_SLOT: usize = 0;
    const ARGUMENTS_SLOT: usize = 1;

    pub const NUM_SLOTS: usize = 2;

    pub fn set_selector(self, heap: &mut Heap, selector: Obj) {
        RegularObject::cast(self.0).set_slot(heap, Self::SELECTOR_SLOT, selector)
    }

    pub fn set_arguments(self, heap: &mut Heap, arguments: Obj) {
        RegularObject::cast(self.0).set_slot(heap, Self::ARGUMENTS_SLOT, arguments)
    }
}

view!(
    /// The root record: distinguished instances, canned selectors, the
    /// common-selector table, and the built-in class objects by kind.
    ObjectStore,
    is_regular_object
);

impl ObjectStore {
    const NIL_SLOT: usize = 1;
    const FALSE_SLOT: usize = 2;
    const TRUE_SLOT: usize = 3;
    const MESSAGE_LOOP_SLOT: usize = 4;
    const COMMON_SELECTORS_SLOT: usize = 5;
    const DOES_NOT_UNDERSTAND_SLOT: usize = 6;
    const NON_BOOLEAN_RECEIVER_SLOT: usize = 7;
    const CANNOT_RETURN_SLOT: usize = 8;
    const ABOUT_TO_RETURN_THROUGH_SLOT: usize = 9;
    const UNUSED_BYTECODE_SLOT: usize = 10;
    const DISPATCH_MESSAGE_SLOT: usize = 11;
    const DISPATCH_SIGNAL_SLOT: usize = 12;
    const ARRAY_CLASS_SLOT: usize = 13;
    const BYTE_ARRAY_CLASS_SLOT: usize = 14;
    const STRING_CLASS_SLOT: usize = 15;
    const CLOSURE_CLASS_SLOT: usize = 16;
    const EPHEMERON_CLASS_SLOT: usize = 17;
    const FLOAT_CLASS_SLOT: usize = 18;
    const LARGE_INTEGER_CLASS_SLOT: usize = 19;
    const MEDIUM_INTEGER_CLASS_SLOT: usize = 20;
    const MESSAGE_CLASS_SLOT: usize = 21;
    const SMALL_INTEGER_CLASS_SLOT: usize = 22;
    const WEAK_ARRAY_CLASS_SLOT: usize = 23;
    const ACTIVATION_CLASS_SLOT: usize = 24;
    const METHOD_CLASS_SLOT: usize = 25;

    /// Named slots the VM reads from the store.
    pub const NUM_SLOTS: usize = 26;

    fn regular(self) -> RegularObject {
        RegularObject::cast(self.0)
    }

    pub fn nil_obj(self) -> Obj {
        self.regular().slot(Self::NIL_SLOT)
    }

    pub fn false_obj(self) -> Obj {
        self.regular().slot(Self::FALSE_SLOT)
    }

    pub fn true_obj(self) -> Obj {
        self.regular().slot(Self::TRUE_SLOT)
    }

    pub fn message_loop(self) -> Obj {
        self.regular().slot(Self::MESSAGE_LOOP_SLOT)
    }

    pub fn common_selectors(self) -> Obj {
        self.regular().slot(Self::COMMON_SELECTORS_SLOT)
    }

    pub fn does_not_understand(self) -> Obj {
        self.regular().slot(Self::DOES_NOT_UNDERSTAND_SLOT)
    }

    pub fn non_boolean_receiver(self) -> Obj {
        self.regular().slot(Self::NON_BOOLEAN_RECEIVER_SLOT)
    }

    pub fn cannot_return(self) -> Obj {
        self.regular().slot(Self::CANNOT_RETURN_SLOT)
    }

    pub fn about_to_return_through(self) -> Obj {
        self.regular().slot(Self::ABOUT_TO_RETURN_THROUGH_SLOT)
    }

    pub fn unused_bytecode(self) -> Obj {
        self.regular().slot(Self::UNUSED_BYTECODE_SLOT)
    }

    pub fn dispatch_message(self) -> Obj {
        self.regular().slot(Self::DISPATCH_MESSAGE_SLOT)
    }

    pub fn dispatch_signal(self) -> Obj {
        self.regular().slot(Self::DISPATCH_SIGNAL_SLOT)
    }

    pub fn array_class(self) -> Obj {
        self.regular().slot(Self::ARRAY_CLASS_SLOT)
    }

    pub fn byte_array_class(self) -> Obj {
        self.regular().slot(Self::BYTE_ARRAY_CLASS_SLOT)
    }

    pub fn string_class(self) -> Obj {
        self.regular().slot(Self::STRING_CLASS_SLOT)
    }

    pub fn closure_class(self) -> Obj {
        self.regular().slot(Self::CLOSURE_CLASS_SLOT)
    }

    pub fn ephemeron_class(self) -> Obj {
        self.regular().slot(Self::EPHEMERON_CLASS_SLOT)
    }

    pub fn float_class(self) -> Obj {
        self.regular().slot(Self::FLOAT_CLASS_SLOT)
    }

    pub fn large_integer_class(self) -> Obj {
        self.regular().slot(Self::LARGE_INTEGER_CLASS_SLOT)
    }

    pub fn medium_integer_class(self) -> Obj {
        self.regular().slot(Self::MEDIUM_INTEGER_CLASS_SLOT)
    }

    pub fn message_class(self) -> Obj {
        self.regular().slot(Self::MESSAGE_CLASS_SLOT)
    }

    pub fn small_integer_class(self) -> Obj {
        self.regular().slot(Self::SMALL_INTEGER_CLASS_SLOT)
    }

    pub fn weak_array_class(self) -> Obj {
        self.regular().slot(Self::WEAK_ARRAY_CLASS_SLOT)
    }

    pub fn activation_class(self) -> Obj {
        self.regular().slot(Self::ACTIVATION_CLASS_SLOT)
    }

    pub fn method_class(self) -> Obj {
        self.regular().slot(Self::METHOD_CLASS_SLOT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn smi_tagging() {
        assert!(Obj::smi(0).is_smi());
        assert_eq!(Obj::smi(0).smi_value(), 0);
        assert_eq!(Obj::smi(7).smi_value(), 7);
        assert_eq!(Obj::smi(-7).smi_value(), -7);
        assert_eq!(Obj::smi(SMI_MAX).smi_value(), SMI_MAX);
        assert_eq!(Obj::smi(SMI_MIN).smi_value(), SMI_MIN);
        assert_eq!(Obj::smi(0).cid(), SMI_CID);
    }

    #[test]
    fn smi_range() {
        assert!(Obj::is_smi_value(SMI_MAX));
        assert!(Obj::is_smi_value(SMI_MIN));
        assert!(!Obj::is_smi_value(SMI_MAX + 1));
        assert!(!Obj::is_smi_value(SMI_MIN - 1));
    }

    #[quickcheck]
    fn smi_roundtrip(value: isize) -> bool {
        let value = value >> 2;
        Obj::smi(value).smi_value() == value
    }

    #[test]
    fn generation_bits() {
        let old = Obj::from_raw(0x1000 | HEAP_OBJECT_TAG);
        let new = Obj::from_raw((0x1000 + WORD_SIZE) | HEAP_OBJECT_TAG);
        assert!(old.is_old_object() && !old.is_new_object());
        assert!(new.is_new_object() && !new.is_old_object());
        assert!(Obj::smi(3).is_immediate_or_old_object());
        assert!(Obj::smi(3).is_immediate_or_new_object());
        assert!(old.is_immediate_or_old_object() && !old.is_immediate_or_new_object());
        assert!(new.is_immediate_or_new_object() && !new.is_immediate_or_old_object());
    }

    #[test]
    fn header_round_trips() {
        let backing = crate::memory::VirtualMemory::allocate(4 * OBJECT_ALIGNMENT);
        let addr = backing.base();
        let obj = Obj::initialize(addr, ARRAY_CID, 4 * OBJECT_ALIGNMENT);
        assert_eq!(obj.cid(), ARRAY_CID);
        assert_eq!(obj.heap_size(), 4 * OBJECT_ALIGNMENT);
        assert!(!obj.is_marked() && !obj.is_remembered() && !obj.is_canonical());

        obj.set_is_marked(true);
        obj.set_is_canonical(true);
        assert!(obj.is_marked() && obj.is_canonical() && !obj.is_remembered());
        obj.set_is_marked(false);
        assert!(!obj.is_marked() && obj.is_canonical());

        obj.set_cid(STRING_CID);
        assert_eq!(obj.cid(), STRING_CID);
        assert_eq!(obj.heap_size(), 4 * OBJECT_ALIGNMENT);

        obj.set_header_hash(12345);
        assert_eq!(obj.header_hash(), 12345);
    }

    #[test]
    fn string_hash_is_salted_and_nonzero() {
        let a = string_hash(b"abc", 17);
        let b = string_hash(b"abc", 17);
        let c = string_hash(b"abc", 18);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(string_hash(b"", 0), 0);
        assert!(a <= SMI_MAX as usize);
    }
}
