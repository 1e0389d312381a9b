//! Clustered snapshot deserializer.
//!
//! A snapshot packs same-shape objects into clusters. Nodes (sizes and
//! value payloads) for every cluster come first, then every cluster's
//! edges (references by 1-origin allocation order), so cycles resolve in
//! two passes. The trailing reference names the object store.
//!
//! All allocation happens under the snapshot allocator: straight into old
//! space, never collecting, so a load is deterministic.

use std::time::Instant;

use strum::FromRepr;
use tracing::debug;

use crate::consts::*;
use crate::error::{GcReason, SnapshotError};
use crate::heap::{Allocator, Heap};
use crate::object::*;

/// Negative cluster formats name the built-in shapes; non-negative formats
/// are regular-object clusters with that many named slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(i64)]
pub enum ClusterTag {
    Integer = -1,
    LargeInteger = -2,
    Float = -3,
    String = -4,
    ByteArray = -5,
    Array = -6,
    WeakArray = -7,
    Closure = -8,
    Activation = -9,
    Ephemeron = -10,
}

enum Cluster {
    Regular {
        format: usize,
        cid: Cid,
        ref_start: usize,
        ref_stop: usize,
    },
    ByteArray,
    String,
    Array {
        ref_start: usize,
        ref_stop: usize,
    },
    WeakArray {
        ref_start: usize,
        ref_stop: usize,
    },
    Closure {
        ref_start: usize,
        ref_stop: usize,
    },
    Activation {
        ref_start: usize,
        ref_stop: usize,
    },
    Integer,
    LargeInteger,
    Float,
}

pub struct Deserializer<'a> {
    snapshot: &'a [u8],
    cursor: usize,
    heap: &'a mut Heap,
    refs: Vec<Obj>,
    next_ref: usize,
}

/// Read `snapshot` into `heap` and publish the root handles to the
/// registered interpreter.
pub fn deserialize(heap: &mut Heap, snapshot: &[u8]) -> Result<(), SnapshotError> {
    Deserializer {
        snapshot,
        cursor: 0,
        heap,
        refs: Vec::new(),
        next_ref: 1,
    }
    .deserialize()
}

impl<'a> Deserializer<'a> {
    fn deserialize(mut self) -> Result<(), SnapshotError> {
        let start = Instant::now();

        // Skip an interpreter directive, if any.
        if self.snapshot.len() >= 2 && self.snapshot[0] == b'#' && self.snapshot[1] == b'!' {
            self.cursor = 2;
            while self.read_u8()? != b'\n' {}
        }

        let magic_offset = self.cursor;
        let magic = self.read_u16()?;
        if magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::WrongMagic {
                found: magic,
                offset: magic_offset,
            });
        }
        let version_offset = self.cursor;
        let version = self.read_leb128()?;
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::WrongVersion {
                found: version,
                offset: version_offset,
            });
        }

        let num_clusters = self.read_leb128()?;
        let num_nodes = self.read_leb128()?;
        self.refs = vec![Obj::ZERO; num_nodes + 1]; // Refs are 1-origin.

        let mut clusters = Vec::with_capacity(num_clusters);
        for _ in 0..num_clusters {
            let mut cluster = self.read_cluster()?;
            self.read_nodes(&mut cluster)?;
            clusters.push(cluster);
        }
        if self.next_ref - 1 != num_nodes {
            return Err(SnapshotError::NodeCountMismatch {
                declared: num_nodes,
                read: self.next_ref - 1,
            });
        }
        for cluster in &clusters {
            self.read_edges(cluster)?;
        }

        let store = ObjectStore::cast(self.read_ref()?);

        self.heap.register_class(SMI_CID, store.small_integer_class());
        self.heap.register_class(MINT_CID, store.medium_integer_class());
        self.heap.register_class(BIGINT_CID, store.large_integer_class());
        self.heap.register_class(FLOAT_CID, store.float_class());
        self.heap.register_class(BYTE_ARRAY_CID, store.byte_array_class());
        self.heap.register_class(STRING_CID, store.string_class());
        self.heap.register_class(ARRAY_CID, store.array_class());
        self.heap.register_class(WEAK_ARRAY_CID, store.weak_array_class());
        self.heap.register_class(EPHEMERON_CID, store.ephemeron_class());
        self.heap.register_class(ACTIVATION_CID, store.activation_class());
        self.heap.register_class(CLOSURE_CID, store.closure_class());

        self.heap.publish_roots(store);
        self.heap.initialize_after_snapshot();

        debug!(
            target: "gc",
            snapshot_kb = self.snapshot.len() / KB,
            heap_kb = self.heap.size() / KB,
            objects = self.next_ref - 1,
            us = start.elapsed().as_micros() as u64,
            "deserialized snapshot"
        );

        if cfg!(debug_assertions) {
            // Snapshots must contain no garbage.
            let before = self.heap.size();
            self.heap.collect_all(GcReason::SnapshotTest);
            let after = self.heap.size();
            debug_assert!(before == after, "snapshot contained garbage");
        }

        Ok(())
    }

    /* Primitive reads */

    fn read_u8(&mut self) -> Result<u8, SnapshotError> {
        let byte = *self
            .snapshot
            .get(self.cursor)
            .ok_or(SnapshotError::Truncated {
                offset: self.cursor,
            })?;
        self.cursor += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, SnapshotError> {
        let low = self.read_u8()?;
        let high = self.read_u8()?;
        Ok(u16::from_le_bytes([low, high]))
    }

    fn read_f64(&mut self) -> Result<f64, SnapshotError> {
        let mut bytes = [0u8; 8];
        for byte in &mut bytes {
            *byte = self.read_u8()?;
        }
        // Snapshot floats are in native byte order; the format is not
        // endian-portable.
        Ok(f64::from_ne_bytes(bytes))
    }

    fn read_leb128(&mut self) -> Result<usize, SnapshotError> {
        let mut result: usize = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7f) as usize) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    fn read_sleb128(&mut self) -> Result<i64, SnapshotError> {
        let mut result: i64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7f) as i64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if byte & 0x40 != 0 && shift < 64 {
                    result |= !0_i64 << shift;
                }
                return Ok(result);
            }
        }
    }

    fn register_ref(&mut self, obj: Obj) {
        self.refs[self.next_ref] = obj;
        self.next_ref += 1;
    }

    fn read_ref(&mut self) -> Result<Obj, SnapshotError> {
        let offset = self.cursor;
        let id = self.read_leb128()?;
        if id == 0 || id >= self.next_ref {
            return Err(SnapshotError::InvalidRef { id, offset });
        }
        Ok(self.refs[id])
    }

    /* Clusters */

    fn read_cluster(&mut self) -> Result<Cluster, SnapshotError> {
        let offset = self.cursor;
        let format = self.read_sleb128()?;
        if format >= 0 {
            return Ok(Cluster::Regular {
                format: format as usize,
                cid: ILLEGAL_CID,
                ref_start: 0,
                ref_stop: 0,
            });
        }
        match ClusterTag::from_repr(format) {
            Some(ClusterTag::ByteArray) => Ok(Cluster::ByteArray),
            Some(ClusterTag::String) => Ok(Cluster::String),
            Some(ClusterTag::Array) => Ok(Cluster::Array {
                ref_start: 0,
                ref_stop: 0,
            }),
            Some(ClusterTag::WeakArray) => Ok(Cluster::WeakArray {
                ref_start: 0,
                ref_stop: 0,
            }),
            Some(ClusterTag::Ephemeron) => Ok(Cluster::Regular {
                format: Ephemeron::NUM_SLOTS,
                cid: EPHEMERON_CID,
                ref_start: 0,
                ref_stop: 0,
            }),
            Some(ClusterTag::Closure) => Ok(Cluster::Closure {
                ref_start: 0,
                ref_stop: 0,
            }),
            Some(ClusterTag::Activation) => Ok(Cluster::Activation {
                ref_start: 0,
                ref_stop: 0,
            }),
            Some(ClusterTag::Integer) => Ok(Cluster::Integer),
            Some(ClusterTag::LargeInteger) => Ok(Cluster::LargeInteger),
            Some(ClusterTag::Float) => Ok(Cluster::Float),
            None => Err(SnapshotError::UnknownClusterFormat { format, offset }),
        }
    }

    fn read_nodes(&mut self, cluster: &mut Cluster) -> Result<(), SnapshotError> {
        match cluster {
            Cluster::Regular {
                format,
                cid,
                ref_start,
                ref_stop,
            } => {
                let num_objects = self.read_leb128()?;
                if *cid == ILLEGAL_CID {
                    *cid = self.heap.allocate_class_id();
                }
                *ref_start = self.next_ref;
                *ref_stop = *ref_start + num_objects;
                for _ in 0..num_objects {
                    let object =
                        self.heap
                            .allocate_regular_object(*cid, *format, Allocator::Snapshot);
                    self.register_ref(object);
                }
            }
            Cluster::ByteArray => {
                let num_objects = self.read_leb128()?;
                for _ in 0..num_objects {
                    let size = self.read_leb128()?;
                    let object = self.heap.allocate_byte_array(size, Allocator::Snapshot);
                    let bytes = Bytes::cast(object);
                    for j in 0..size {
                        bytes.set_element(j, self.read_u8()?);
                    }
                    self.register_ref(object);
                }
            }
            Cluster::String => {
                // Two sub-clusters back to back: non-canonical, canonical.
                self.read_string_nodes(false)?;
                self.read_string_nodes(true)?;
            }
            Cluster::Array {
                ref_start,
                ref_stop,
            } => {
                let num_objects = self.read_leb128()?;
                *ref_start = self.next_ref;
                *ref_stop = *ref_start + num_objects;
                for _ in 0..num_objects {
                    let size = self.read_leb128()?;
                    let object = self.heap.allocate_array(size, Allocator::Snapshot);
                    self.register_ref(object);
                }
            }
            Cluster::WeakArray {
                ref_start,
                ref_stop,
            } => {
                let num_objects = self.read_leb128()?;
                *ref_start = self.next_ref;
                *ref_stop = *ref_start + num_objects;
                for _ in 0..num_objects {
                    let size = self.read_leb128()?;
                    let object = self.heap.allocate_weak_array(size, Allocator::Snapshot);
                    self.register_ref(object);
                }
            }
            Cluster::Closure {
                ref_start,
                ref_stop,
            } => {
                let num_objects = self.read_leb128()?;
                *ref_start = self.next_ref;
                *ref_stop = *ref_start + num_objects;
                for _ in 0..num_objects {
                    let size = self.read_leb128()?;
                    let object = self.heap.allocate_closure(size, Allocator::Snapshot);
                    self.register_ref(object);
                }
            }
            Cluster::Activation {
                ref_start,
                ref_stop,
            } => {
                let num_objects = self.read_leb128()?;
                *ref_start = self.next_ref;
                *ref_stop = *ref_start + num_objects;
                for _ in 0..num_objects {
                    let object = self.heap.allocate_activation(Allocator::Snapshot);
                    self.register_ref(object);
                }
            }
            Cluster::Integer => {
                let num_objects = self.read_leb128()?;
                for _ in 0..num_objects {
                    let value = self.read_sleb128()?;
                    if value >= SMI_MIN as i64 && value <= SMI_MAX as i64 {
                        self.register_ref(Obj::smi(value as isize));
                    } else {
                        let object = self.heap.allocate_medium_integer(Allocator::Snapshot);
                        MediumInteger::cast(object).set_value(value);
                        self.register_ref(object);
                    }
                }
            }
            Cluster::LargeInteger => {
                let num_objects = self.read_leb128()?;
                for _ in 0..num_objects {
                    let object = self.read_large_integer_node()?;
                    self.register_ref(object);
                }
            }
            Cluster::Float => {
                let num_objects = self.read_leb128()?;
                for _ in 0..num_objects {
                    let value = self.read_f64()?;
                    let object = self.heap.allocate_float(Allocator::Snapshot);
                    Float::cast(object).set_value(value);
                    self.register_ref(object);
                }
            }
        }
        Ok(())
    }

    fn read_string_nodes(&mut self, is_canonical: bool) -> Result<(), SnapshotError> {
        let num_objects = self.read_leb128()?;
        for _ in 0..num_objects {
            let size = self.read_leb128()?;
            let object = self.heap.allocate_string(size, Allocator::Snapshot);
            object.set_is_canonical(is_canonical);
            let bytes = Bytes::cast(object);
            for j in 0..size {
                bytes.set_element(j, self.read_u8()?);
            }
            self.register_ref(object);
        }
        Ok(())
    }

    /// Sign byte, byte count, then raw little-endian bytes packed into
    /// digits of the target digit width.
    fn read_large_integer_node(&mut self) -> Result<Obj, SnapshotError> {
        let negative = self.read_u8()? != 0;
        let bytes = self.read_leb128()?;
        let digit_size = std::mem::size_of::<Digit>();
        let digits = (bytes + digit_size - 1) / digit_size;
        let full_digits = bytes / digit_size;

        let object = self.heap.allocate_large_integer(digits, Allocator::Snapshot);
        let large = LargeInteger::cast(object);
        large.set_negative(negative);
        large.set_size(digits);

        for j in 0..full_digits {
            let mut digit: Digit = 0;
            for shift in (0..DIGIT_BITS).step_by(8) {
                digit |= (self.read_u8()? as Digit) << shift;
            }
            large.set_digit(j, digit);
        }

        if full_digits != digits {
            let leftover_bytes = bytes % digit_size;
            debug_assert!(leftover_bytes != 0);
            let mut digit: Digit = 0;
            for shift in (0..leftover_bytes * 8).step_by(8) {
                digit |= (self.read_u8()? as Digit) << shift;
            }
            large.set_digit(digits - 1, digit);
        }

        Ok(object)
    }

    fn read_edges(&mut self, cluster: &Cluster) -> Result<(), SnapshotError> {
        match cluster {
            Cluster::Regular {
                format,
                cid,
                ref_start,
                ref_stop,
            } => {
                let cls = self.read_ref()?;
                self.heap.register_class(*cid, cls);

                for i in *ref_start..*ref_stop {
                    let object = RegularObject::cast(self.refs[i]);
                    for j in 0..*format {
                        let value = self.read_ref()?;
                        object.init_slot(j, value);
                    }
                }
            }
            Cluster::Array {
                ref_start,
                ref_stop,
            } => {
                for i in *ref_start..*ref_stop {
                    let object = Array::cast(self.refs[i]);
                    for j in 0..object.len() {
                        let value = self.read_ref()?;
                        object.init_element(j, value);
                    }
                }
            }
            Cluster::WeakArray {
                ref_start,
                ref_stop,
            } => {
                for i in *ref_start..*ref_stop {
                    let object = WeakArray::cast(self.refs[i]);
                    for j in 0..object.len() {
                        let value = self.read_ref()?;
                        object.init_element(j, value);
                    }
                }
            }
            Cluster::Closure {
                ref_start,
                ref_stop,
            } => {
                for i in *ref_start..*ref_stop {
                    let object = Closure::cast(self.refs[i]);
                    let defining_activation = self.read_ref()?;
                    object.init_defining_activation(defining_activation);
                    let initial_bci = self.read_ref()?;
                    object.set_initial_bci(initial_bci);
                    let num_args = self.read_ref()?;
                    object.set_num_args(num_args);
                    for j in 0..object.num_copied() {
                        let value = self.read_ref()?;
                        object.init_copied(j, value);
                    }
                }
            }
            Cluster::Activation {
                ref_start,
                ref_stop,
            } => {
                for i in *ref_start..*ref_stop {
                    let object = Activation::cast(self.refs[i]);
                    let sender = self.read_ref()?;
                    object.set_sender_no_barrier(sender);
                    let bci = self.read_ref()?;
                    object.set_bci(bci);
                    let method = self.read_ref()?;
                    object.set_method_no_barrier(method);
                    let closure = self.read_ref()?;
                    object.set_closure_no_barrier(closure);
                    let receiver = self.read_ref()?;
                    object.set_receiver_no_barrier(receiver);

                    let size = self.read_leb128()?;
                    debug_assert!(size < MAX_TEMPS);
                    object.set_stack_depth(size);
                    for j in 0..size {
                        let value = self.read_ref()?;
                        object.init_temp(j, value);
                    }
                    for j in size..MAX_TEMPS {
                        object.init_temp(j, Obj::smi(0));
                    }
                }
            }
            Cluster::ByteArray
            | Cluster::String
            | Cluster::Integer
            | Cluster::LargeInteger
            | Cluster::Float => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn encode_leb128(mut value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                return out;
            }
            out.push(byte | 0x80);
        }
    }

    fn encode_sleb128(mut value: i64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            let sign_clear = byte & 0x40 == 0;
            if (value == 0 && sign_clear) || (value == -1 && !sign_clear) {
                out.push(byte);
                return out;
            }
            out.push(byte | 0x80);
        }
    }

    fn decode_leb128(bytes: &[u8]) -> usize {
        let mut result: usize = 0;
        let mut shift = 0;
        for &byte in bytes {
            result |= ((byte & 0x7f) as usize) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
        result
    }

    fn decode_sleb128(bytes: &[u8]) -> i64 {
        let mut result: i64 = 0;
        let mut shift = 0;
        for &byte in bytes {
            result |= ((byte & 0x7f) as i64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if byte & 0x40 != 0 && shift < 64 {
                    result |= !0_i64 << shift;
                }
                break;
            }
        }
        result
    }

    #[quickcheck]
    fn leb128_roundtrip(value: u64) -> bool {
        decode_leb128(&encode_leb128(value)) as u64 == value
    }

    #[quickcheck]
    fn sleb128_roundtrip(value: i64) -> bool {
        decode_sleb128(&encode_sleb128(value)) == value
    }

    #[test]
    fn cluster_tags_cover_the_reserved_range() {
        for format in -10..=-1_i64 {
            assert!(ClusterTag::from_repr(format).is_some(), "tag {}", format);
        }
        assert!(ClusterTag::from_repr(-11).is_none());
    }
}
