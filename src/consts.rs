//! VM parameters

use std::mem;

/* POINTER TAGGING */

/// Length of a machine word, in bytes.
pub const WORD_SIZE: usize = mem::size_of::<usize>();

/// log2 of [`WORD_SIZE`].
pub const WORD_SIZE_LOG2: u32 = WORD_SIZE.trailing_zeros();

/// Tag of an immediate small integer (low bit clear).
pub const SMI_TAG: usize = 0;

/// Tag of a heap-object reference (low bit set).
pub const HEAP_OBJECT_TAG: usize = 1;

/// Mask selecting the tag bit.
pub const SMI_TAG_MASK: usize = 1;

/// Smi payloads are shifted left by this amount.
pub const SMI_TAG_SHIFT: u32 = 1;

/// Significant bits of a small integer payload.
pub const SMI_BITS: u32 = usize::BITS - 2;

/// Largest value representable as an immediate small integer.
pub const SMI_MAX: isize = (1_isize << SMI_BITS) - 1;

/// Smallest value representable as an immediate small integer.
pub const SMI_MIN: isize = -(1_isize << SMI_BITS);

/* OBJECT ALIGNMENT */

/// Objects are aligned to two words; the second-lowest address bit encodes
/// the object's generation.
pub const OBJECT_ALIGNMENT: usize = 2 * WORD_SIZE;

/// log2 of [`OBJECT_ALIGNMENT`].
pub const OBJECT_ALIGNMENT_LOG2: u32 = OBJECT_ALIGNMENT.trailing_zeros();

/// Mask selecting the alignment bits of an address.
pub const OBJECT_ALIGNMENT_MASK: usize = OBJECT_ALIGNMENT - 1;

/// New-space objects sit one word past an alignment boundary.
pub const NEW_OBJECT_ALIGNMENT_OFFSET: usize = WORD_SIZE;

/// Old-space objects sit on an alignment boundary.
pub const OLD_OBJECT_ALIGNMENT_OFFSET: usize = 0;

/// Low address bits of a tagged new-space reference.
pub const NEW_OBJECT_BITS: usize = NEW_OBJECT_ALIGNMENT_OFFSET | HEAP_OBJECT_TAG;

/// Low address bits of a tagged old-space reference.
pub const OLD_OBJECT_BITS: usize = OLD_OBJECT_ALIGNMENT_OFFSET | HEAP_OBJECT_TAG;

/* HEADER FIELDS */

/// Header bit marking an object as seen by the collector. On a forwarded
/// new-space object the bit aliases the tag bit of the forwarding pointer.
pub const MARK_BIT: usize = 0;

/// Header bit recording membership in the remembered set.
pub const REMEMBERED_BIT: usize = 1;

/// Header bit marking an interned value: pointer equality implies equality.
pub const CANONICAL_BIT: usize = 2;

#[cfg(target_pointer_width = "64")]
pub const SIZE_FIELD_OFFSET: u32 = 16;
#[cfg(target_pointer_width = "64")]
pub const SIZE_FIELD_BITS: u32 = 16;
#[cfg(target_pointer_width = "64")]
pub const CID_FIELD_OFFSET: u32 = 32;
#[cfg(target_pointer_width = "64")]
pub const CID_FIELD_BITS: u32 = 32;

#[cfg(target_pointer_width = "32")]
pub const SIZE_FIELD_OFFSET: u32 = 8;
#[cfg(target_pointer_width = "32")]
pub const SIZE_FIELD_BITS: u32 = 8;
#[cfg(target_pointer_width = "32")]
pub const CID_FIELD_OFFSET: u32 = 16;
#[cfg(target_pointer_width = "32")]
pub const CID_FIELD_BITS: u32 = 16;

/* CLASS IDS */

/// Index into the class table.
pub type Cid = usize;

pub const ILLEGAL_CID: Cid = 0;
pub const FORWARDING_CORPSE_CID: Cid = 1;
pub const FREE_LIST_ELEMENT_CID: Cid = 2;

/// Smallest class id that names a live object kind.
pub const FIRST_LEGAL_CID: Cid = 3;

pub const SMI_CID: Cid = 3;
pub const MINT_CID: Cid = 4;
pub const BIGINT_CID: Cid = 5;
pub const FLOAT_CID: Cid = 6;
pub const BYTE_ARRAY_CID: Cid = 7;
pub const STRING_CID: Cid = 8;
pub const ARRAY_CID: Cid = 9;
pub const WEAK_ARRAY_CID: Cid = 10;
pub const EPHEMERON_CID: Cid = 11;
pub const ACTIVATION_CID: Cid = 12;
pub const CLOSURE_CID: Cid = 13;

/// Class ids at or above this are ordinary language-defined classes.
pub const FIRST_REGULAR_OBJECT_CID: Cid = 14;

/* HEAP SIZING */

pub const KB: usize = 1024;
pub const MB: usize = KB * KB;

/// Allocations at least this large get a dedicated old-space region.
pub const LARGE_ALLOCATION: usize = 32 * KB;

/// Starting capacity of each young-generation semispace.
pub const INITIAL_SEMISPACE_CAPACITY: usize = WORD_SIZE * MB / 8;

/// Hard ceiling for semispace growth.
pub const MAX_SEMISPACE_CAPACITY: usize = 2 * WORD_SIZE * MB;

/// Size of an ordinary old-space region.
pub const REGION_SIZE: usize = 256 * KB;

/// Registered handle slots available to a single safepoint.
pub const HANDLES_CAPACITY: usize = 8;

/* INTERPRETER */

/// Slots in the interpreter's value stack.
pub const STACK_SLOTS: usize = 1024;

/// Maximum temporaries (including arguments) of a single activation.
pub const MAX_TEMPS: usize = 35;

/* METHOD HEADER

A method's packed header Smi:

  bits 28..  access modifier (0 public, 1 protected, 2 private)
  bits 16..26  primitive number
  bits  8..16  temp count
  bits  0..8   argument count
*/

pub const METHOD_PUBLIC: isize = 0;
pub const METHOD_PROTECTED: isize = 1;
pub const METHOD_PRIVATE: isize = 2;

/// Primitive numbers with this bit denote an instance-variable getter.
pub const PRIMITIVE_GETTER_BIT: usize = 256;

/// Primitive numbers with this bit denote an instance-variable setter.
pub const PRIMITIVE_SETTER_BIT: usize = 512;

/* LOOKUP RULES */

/// Lookup rule discriminants for the NS cache. Outer-send rules use the
/// (positive) lexical depth directly, so the named rules sit above 255.
pub type LookupRule = usize;

pub const RULE_SELF: LookupRule = 0;
pub const RULE_SUPER: LookupRule = 256;
pub const RULE_IMPLICIT_RECEIVER: LookupRule = 257;
pub const RULE_MNU: LookupRule = 258;

/* SNAPSHOT */

/// Leading magic of a snapshot stream.
pub const SNAPSHOT_MAGIC: u16 = 0x1984;

/// The only understood snapshot version.
pub const SNAPSHOT_VERSION: usize = 0;
