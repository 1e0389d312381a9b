//! Array, weak-array, byte-array, and string primitives. Indexing is
//! 1-origin except for the scalar byte accessors, which take byte offsets.

use super::{
    mint_arg, ret, ret_bool, ret_float, ret_mint, ret_self, ret_smi, smi_arg, PrimitiveResult,
    FAILURE,
};
use crate::bigint::BigInt;
use crate::heap::{Allocator, Heap};
use crate::interpreter::Interpreter;
use crate::object::{Array, Bytes, WeakArray};

pub(super) fn array_class_new(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let length = match smi_arg(interpreter, 0) {
        Some(length) if length >= 0 => length as usize,
        _ => return FAILURE,
    };
    let result = Array::cast(heap.allocate_array(length, Allocator::Normal)); // SAFEPOINT
    let nil = interpreter.nil_obj();
    for i in 0..length {
        result.init_element(i, nil);
    }
    ret(interpreter, num_args, result.obj())
}

pub(super) fn array_at(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let array = Array::cast(interpreter.stack(1));
    let index = match smi_arg(interpreter, 0) {
        Some(index) => index - 1,
        None => return FAILURE,
    };
    if index < 0 || index as usize >= array.len() {
        return FAILURE;
    }
    ret(interpreter, num_args, array.element(index as usize))
}

pub(super) fn array_at_put(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let array = Array::cast(interpreter.stack(2));
    let index = match smi_arg(interpreter, 1) {
        Some(index) => index - 1,
        None => return FAILURE,
    };
    if index < 0 || index as usize >= array.len() {
        return FAILURE;
    }
    let value = interpreter.stack(0);
    array.set_element(heap, index as usize, value);
    ret(interpreter, num_args, value)
}

pub(super) fn array_size(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let array = Array::cast(interpreter.stack(0));
    ret(interpreter, num_args, array.size())
}

pub(super) fn array_replace_from_to_with_starting_at(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let receiver = Array::cast(interpreter.stack(4));
    let start = match smi_arg(interpreter, 3) {
        Some(start) => start,
        None => return FAILURE,
    };
    let stop = match smi_arg(interpreter, 2) {
        Some(stop) => stop,
        None => return FAILURE,
    };
    let replacement = interpreter.stack(1);
    if !replacement.is_array() {
        return FAILURE;
    }
    let replacement = Array::cast(replacement);
    let replacement_start = match smi_arg(interpreter, 0) {
        Some(start) => start,
        None => return FAILURE,
    };

    if start <= 0 {
        return FAILURE;
    }
    if stop < start {
        // Empty copy.
        return ret_self(interpreter, num_args);
    }
    if stop as usize > receiver.len() {
        return FAILURE;
    }

    let count = (stop - start + 1) as usize;

    if replacement_start <= 0 {
        return FAILURE;
    }
    if replacement_start as usize + count - 1 > replacement.len() {
        return FAILURE;
    }

    // The replacement may be the receiver; copy in the non-clobbering
    // direction.
    let dst = start as usize - 1;
    let src = replacement_start as usize - 1;
    if replacement_start < start {
        for i in (0..count).rev() {
            receiver.set_element(heap, dst + i, replacement.element(src + i));
        }
    } else {
        for i in 0..count {
            receiver.set_element(heap, dst + i, replacement.element(src + i));
        }
    }

    ret_self(interpreter, num_args)
}

pub(super) fn array_copy_from_to(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let start = match smi_arg(interpreter, 1) {
        Some(start) => start,
        None => return FAILURE,
    };
    let stop = match smi_arg(interpreter, 0) {
        Some(stop) => stop,
        None => return FAILURE,
    };
    if !interpreter.stack(2).is_array() {
        return FAILURE;
    }
    let len = Array::cast(interpreter.stack(2)).len();
    if start <= 0 || stop as usize > len || stop + 1 < start {
        return FAILURE;
    }
    let subsize = (stop - start + 1) as usize;

    let result = Array::cast(heap.allocate_array(subsize, Allocator::Normal)); // SAFEPOINT
    let array = Array::cast(interpreter.stack(2));
    for i in 0..subsize {
        result.set_element(heap, i, array.element(i + start as usize - 1));
    }
    ret(interpreter, num_args, result.obj())
}

pub(super) fn weak_array_class_new(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let length = match smi_arg(interpreter, 0) {
        Some(length) if length >= 0 => length as usize,
        _ => return FAILURE,
    };
    let result = WeakArray::cast(heap.allocate_weak_array(length, Allocator::Normal)); // SAFEPOINT
    let nil = interpreter.nil_obj();
    for i in 0..length {
        result.init_element(i, nil);
    }
    ret(interpreter, num_args, result.obj())
}

pub(super) fn weak_array_at(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let array = WeakArray::cast(interpreter.stack(1));
    let index = match smi_arg(interpreter, 0) {
        Some(index) => index - 1,
        None => return FAILURE,
    };
    if index < 0 || index as usize >= array.len() {
        return FAILURE;
    }
    ret(interpreter, num_args, array.element(index as usize))
}

pub(super) fn weak_array_at_put(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let array = WeakArray::cast(interpreter.stack(2));
    let index = match smi_arg(interpreter, 1) {
        Some(index) => index - 1,
        None => return FAILURE,
    };
    if index < 0 || index as usize >= array.len() {
        return FAILURE;
    }
    let value = interpreter.stack(0);
    array.set_element(heap, index as usize, value);
    ret(interpreter, num_args, value)
}

pub(super) fn weak_array_size(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let array = WeakArray::cast(interpreter.stack(0));
    ret(interpreter, num_args, array.size())
}

/* Scalar byte access, at 0-origin byte offsets in native byte order. */

macro_rules! scalar_access {
    ($at:ident, $at_put:ident, $ty:ty, $read_ret:ident) => {
        pub(super) fn $at(
            num_args: usize,
            heap: &mut Heap,
            interpreter: &mut Interpreter,
        ) -> PrimitiveResult {
            let array = interpreter.stack(1);
            if !array.is_bytes() {
                return FAILURE;
            }
            let array = Bytes::cast(array);
            let index = match smi_arg(interpreter, 0) {
                Some(index) if index >= 0 => index as usize,
                _ => return FAILURE,
            };
            let width = std::mem::size_of::<$ty>();
            if index + width > array.len() {
                return FAILURE;
            }
            let value =
                unsafe { std::ptr::read_unaligned(array.element_addr(index) as *const $ty) };
            $read_ret(interpreter, heap, num_args, value)
        }

        pub(super) fn $at_put(
            num_args: usize,
            _heap: &mut Heap,
            interpreter: &mut Interpreter,
        ) -> PrimitiveResult {
            let array = interpreter.stack(2);
            if !array.is_bytes() {
                return FAILURE;
            }
            let array = Bytes::cast(array);
            let index = match smi_arg(interpreter, 1) {
                Some(index) if index >= 0 => index as usize,
                _ => return FAILURE,
            };
            let width = std::mem::size_of::<$ty>();
            if index + width > array.len() {
                return FAILURE;
            }
            let value = match mint_arg(interpreter, 0) {
                Some(value) => value,
                None => return FAILURE,
            };
            if value < <$ty>::MIN as i64 || value > <$ty>::MAX as i64 {
                return FAILURE;
            }
            unsafe {
                std::ptr::write_unaligned(array.element_addr(index) as *mut $ty, value as $ty)
            };
            let result = interpreter.stack(0);
            ret(interpreter, num_args, result)
        }
    };
}

fn ret_scalar_int<T: Into<i64>>(
    interpreter: &mut Interpreter,
    heap: &mut Heap,
    num_args: usize,
    value: T,
) -> PrimitiveResult {
    ret_mint(interpreter, heap, num_args, value.into())
}

scalar_access!(bytes_uint8_at, bytes_uint8_at_put, u8, ret_scalar_int);
scalar_access!(bytes_uint16_at, bytes_uint16_at_put, u16, ret_scalar_int);
scalar_access!(bytes_uint32_at, bytes_uint32_at_put, u32, ret_scalar_int);
scalar_access!(bytes_int8_at, bytes_int8_at_put, i8, ret_scalar_int);
scalar_access!(bytes_int16_at, bytes_int16_at_put, i16, ret_scalar_int);
scalar_access!(bytes_int32_at, bytes_int32_at_put, i32, ret_scalar_int);
scalar_access!(bytes_int64_at, bytes_int64_at_put, i64, ret_scalar_int);

pub(super) fn bytes_uint64_at(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let array = interpreter.stack(1);
    if !array.is_bytes() {
        return FAILURE;
    }
    let array = Bytes::cast(array);
    let index = match smi_arg(interpreter, 0) {
        Some(index) if index >= 0 => index as usize,
        _ => return FAILURE,
    };
    if index + 8 > array.len() {
        return FAILURE;
    }
    let value = unsafe { std::ptr::read_unaligned(array.element_addr(index) as *const u64) };
    if value <= i64::MAX as u64 {
        ret_mint(interpreter, heap, num_args, value as i64)
    } else {
        let boxed = BigInt::from_u64(value).into_obj(heap); // SAFEPOINT
        ret(interpreter, num_args, boxed)
    }
}

pub(super) fn bytes_uint64_at_put(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let array = interpreter.stack(2);
    if !array.is_bytes() {
        return FAILURE;
    }
    let array = Bytes::cast(array);
    let index = match smi_arg(interpreter, 1) {
        Some(index) if index >= 0 => index as usize,
        _ => return FAILURE,
    };
    if index + 8 > array.len() {
        return FAILURE;
    }
    let value = match mint_arg(interpreter, 0) {
        Some(value) if value >= 0 => value as u64,
        _ => return FAILURE,
    };
    unsafe { std::ptr::write_unaligned(array.element_addr(index) as *mut u64, value) };
    let result = interpreter.stack(0);
    ret(interpreter, num_args, result)
}

macro_rules! scalar_float_access {
    ($at:ident, $at_put:ident, $ty:ty) => {
        pub(super) fn $at(
            num_args: usize,
            heap: &mut Heap,
            interpreter: &mut Interpreter,
        ) -> PrimitiveResult {
            let array = interpreter.stack(1);
            if !array.is_bytes() {
                return FAILURE;
            }
            let array = Bytes::cast(array);
            let index = match smi_arg(interpreter, 0) {
                Some(index) if index >= 0 => index as usize,
                _ => return FAILURE,
            };
            let width = std::mem::size_of::<$ty>();
            if index + width > array.len() {
                return FAILURE;
            }
            let value =
                unsafe { std::ptr::read_unaligned(array.element_addr(index) as *const $ty) };
            ret_float(interpreter, heap, num_args, value as f64)
        }

        pub(super) fn $at_put(
            num_args: usize,
            _heap: &mut Heap,
            interpreter: &mut Interpreter,
        ) -> PrimitiveResult {
            let array = interpreter.stack(2);
            if !array.is_bytes() {
                return FAILURE;
            }
            let array = Bytes::cast(array);
            let index = match smi_arg(interpreter, 1) {
                Some(index) if index >= 0 => index as usize,
                _ => return FAILURE,
            };
            let width = std::mem::size_of::<$ty>();
            if index + width > array.len() {
                return FAILURE;
            }
            let value = interpreter.stack(0);
            if !value.is_float() {
                return FAILURE;
            }
            let raw = crate::object::Float::cast(value).value() as $ty;
            unsafe { std::ptr::write_unaligned(array.element_addr(index) as *mut $ty, raw) };
            ret(interpreter, num_args, value)
        }
    };
}

scalar_float_access!(bytes_float32_at, bytes_float32_at_put, f32);
scalar_float_access!(bytes_float64_at, bytes_float64_at_put, f64);

/* Searching and slicing. */

pub(super) fn bytes_starts_with(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let string = interpreter.stack(1);
    let prefix = interpreter.stack(0);
    if !string.is_bytes() || !prefix.is_bytes() {
        return FAILURE;
    }
    let string = Bytes::cast(string).as_slice();
    let prefix = Bytes::cast(prefix).as_slice();
    ret_bool(interpreter, num_args, string.starts_with(prefix))
}

pub(super) fn bytes_ends_with(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let string = interpreter.stack(1);
    let suffix = interpreter.stack(0);
    if !string.is_bytes() || !suffix.is_bytes() {
        return FAILURE;
    }
    let string = Bytes::cast(string).as_slice();
    let suffix = Bytes::cast(suffix).as_slice();
    ret_bool(interpreter, num_args, string.ends_with(suffix))
}

/// 1-origin index of the first occurrence at or after `start`, or 0.
pub(super) fn bytes_index_of(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let string = interpreter.stack(2);
    let substring = interpreter.stack(1);
    if !string.is_bytes() || !substring.is_bytes() {
        return FAILURE;
    }
    let start_index = match smi_arg(interpreter, 0) {
        Some(start) => start - 1,
        None => return FAILURE,
    };
    let string = Bytes::cast(string).as_slice();
    let substring = Bytes::cast(substring).as_slice();
    if start_index < 0 || start_index as usize > string.len() {
        return FAILURE;
    }
    if substring.len() > string.len() {
        return ret_smi(interpreter, num_args, 0);
    }

    let limit = string.len() - substring.len();
    for start in start_index as usize..=limit {
        if &string[start..start + substring.len()] == substring {
            return ret_smi(interpreter, num_args, start as isize + 1);
        }
    }
    ret_smi(interpreter, num_args, 0)
}

/// 1-origin index of the last occurrence at or before `start`, or 0.
pub(super) fn bytes_last_index_of(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let string = interpreter.stack(2);
    let substring = interpreter.stack(1);
    if !string.is_bytes() || !substring.is_bytes() {
        return FAILURE;
    }
    let start_index = match smi_arg(interpreter, 0) {
        Some(start) => start - 1,
        None => return FAILURE,
    };
    let string = Bytes::cast(string).as_slice();
    let substring = Bytes::cast(substring).as_slice();
    if start_index < 0 || start_index as usize > string.len() {
        return FAILURE;
    }
    if substring.len() > string.len() {
        return ret_smi(interpreter, num_args, 0);
    }

    let limit = (string.len() - substring.len()).min(start_index as usize);
    for start in (0..=limit).rev() {
        if &string[start..start + substring.len()] == substring {
            return ret_smi(interpreter, num_args, start as isize + 1);
        }
    }
    ret_smi(interpreter, num_args, 0)
}

fn copy_bytes_from_to(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
    as_string: bool,
) -> PrimitiveResult {
    let start = match smi_arg(interpreter, 1) {
        Some(start) => start,
        None => return FAILURE,
    };
    let stop = match smi_arg(interpreter, 0) {
        Some(stop) => stop,
        None => return FAILURE,
    };
    if !interpreter.stack(2).is_bytes() {
        return FAILURE;
    }
    let len = Bytes::cast(interpreter.stack(2)).len();
    if start <= 0 || stop as usize > len || stop + 1 < start {
        return FAILURE;
    }
    let subsize = (stop - start + 1) as usize;

    let result = if as_string {
        heap.allocate_string(subsize, Allocator::Normal) // SAFEPOINT
    } else {
        heap.allocate_byte_array(subsize, Allocator::Normal) // SAFEPOINT
    };
    let bytes = Bytes::cast(interpreter.stack(2));
    let slice = &bytes.as_slice()[start as usize - 1..stop as usize];
    Bytes::cast(result).copy_from(slice);
    ret(interpreter, num_args, result)
}

pub(super) fn bytes_copy_string_from_to(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    copy_bytes_from_to(num_args, heap, interpreter, true)
}

pub(super) fn bytes_copy_byte_array_from_to(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    copy_bytes_from_to(num_args, heap, interpreter, false)
}

/* Byte arrays. */

pub(super) fn byte_array_class_new(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let length = match smi_arg(interpreter, 0) {
        Some(length) if length >= 0 => length as usize,
        _ => return FAILURE,
    };
    let result = heap.allocate_byte_array(length, Allocator::Normal); // SAFEPOINT
    let bytes = Bytes::cast(result);
    for i in 0..length {
        bytes.set_element(i, 0);
    }
    ret(interpreter, num_args, result)
}

pub(super) fn byte_array_class_with_all(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let source = interpreter.stack(0);
    if !source.is_bytes() {
        return FAILURE;
    }
    let length = Bytes::cast(source).len();
    let result = heap.allocate_byte_array(length, Allocator::Normal); // SAFEPOINT
    let source = Bytes::cast(interpreter.stack(0));
    Bytes::cast(result).copy_from(source.as_slice());
    ret(interpreter, num_args, result)
}

pub(super) fn byte_array_at(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let array = Bytes::cast(interpreter.stack(1));
    let index = match smi_arg(interpreter, 0) {
        Some(index) => index - 1,
        None => return FAILURE,
    };
    if index < 0 || index as usize >= array.len() {
        return FAILURE;
    }
    ret_smi(interpreter, num_args, array.element(index as usize) as isize)
}

pub(super) fn byte_array_at_put(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let array = Bytes::cast(interpreter.stack(2));
    let index = match smi_arg(interpreter, 1) {
        Some(index) => index - 1,
        None => return FAILURE,
    };
    if index < 0 || index as usize >= array.len() {
        return FAILURE;
    }
    let value = interpreter.stack(0);
    if !value.is_smi() || !(0..=255).contains(&value.smi_value()) {
        return FAILURE;
    }
    array.set_element(index as usize, value.smi_value() as u8);
    ret(interpreter, num_args, value)
}

pub(super) fn byte_array_size(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let array = Bytes::cast(interpreter.stack(0));
    ret(interpreter, num_args, array.size())
}

pub(super) fn byte_array_replace_from_to_with_starting_at(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let receiver = Bytes::cast(interpreter.stack(4));
    let start = match smi_arg(interpreter, 3) {
        Some(start) => start,
        None => return FAILURE,
    };
    let stop = match smi_arg(interpreter, 2) {
        Some(stop) => stop,
        None => return FAILURE,
    };
    let replacement = interpreter.stack(1);
    if !replacement.is_bytes() {
        return FAILURE;
    }
    let replacement = Bytes::cast(replacement);
    let replacement_start = match smi_arg(interpreter, 0) {
        Some(start) => start,
        None => return FAILURE,
    };

    if start <= 0 {
        return FAILURE;
    }
    if stop < start {
        // Empty copy.
        return ret_self(interpreter, num_args);
    }
    if stop as usize > receiver.len() {
        return FAILURE;
    }

    let count = (stop - start + 1) as usize;

    if replacement_start <= 0 {
        return FAILURE;
    }
    if replacement_start as usize + count - 1 > replacement.len() {
        return FAILURE;
    }

    // The replacement may be the receiver.
    unsafe {
        std::ptr::copy(
            replacement.element_addr(replacement_start as usize - 1),
            receiver.element_addr(start as usize - 1),
            count,
        );
    }
    ret_self(interpreter, num_args)
}

/* Strings. */

pub(super) fn string_at(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let string = Bytes::cast(interpreter.stack(1));
    let index = match smi_arg(interpreter, 0) {
        Some(index) => index - 1,
        None => return FAILURE,
    };
    if index < 0 || index as usize >= string.len() {
        return FAILURE;
    }
    ret_smi(interpreter, num_args, string.element(index as usize) as isize)
}

pub(super) fn string_size(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let string = Bytes::cast(interpreter.stack(0));
    ret(interpreter, num_args, string.size())
}

pub(super) fn string_hash(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let string = Bytes::cast(interpreter.stack(0));
    let hash = string.ensure_hash(interpreter.isolate().salt());
    ret_smi(interpreter, num_args, hash)
}

pub(super) fn string_equals(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let left = interpreter.stack(1);
    let right = interpreter.stack(0);
    if left == right {
        return ret_bool(interpreter, num_args, true);
    }
    if !left.is_string() || !right.is_string() {
        return ret_bool(interpreter, num_args, false);
    }
    let left = Bytes::cast(left);
    let right = Bytes::cast(right);
    if left.len() != right.len() {
        return ret_bool(interpreter, num_args, false);
    }
    let salt = interpreter.isolate().salt();
    if left.ensure_hash(salt) != right.ensure_hash(salt) {
        return ret_bool(interpreter, num_args, false);
    }
    ret_bool(interpreter, num_args, left.as_slice() == right.as_slice())
}

pub(super) fn string_concat(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let a = interpreter.stack(1);
    let b = interpreter.stack(0);
    if !a.is_string() || !b.is_string() {
        return FAILURE;
    }
    let a_length = Bytes::cast(a).len();
    let b_length = Bytes::cast(b).len();
    let result = heap.allocate_string(a_length + b_length, Allocator::Normal); // SAFEPOINT
    let a = Bytes::cast(interpreter.stack(1));
    let b = Bytes::cast(interpreter.stack(0));
    let result_bytes = Bytes::cast(result);
    unsafe {
        std::ptr::copy_nonoverlapping(a.element_addr(0), result_bytes.element_addr(0), a_length);
        std::ptr::copy_nonoverlapping(
            b.element_addr(0),
            result_bytes.element_addr(a_length),
            b_length,
        );
    }
    ret(interpreter, num_args, result)
}

pub(super) fn string_class_with(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let byte = match smi_arg(interpreter, 0) {
        Some(byte) if (0..=255).contains(&byte) => byte as u8,
        _ => return FAILURE,
    };
    let result = heap.allocate_string(1, Allocator::Normal); // SAFEPOINT
    Bytes::cast(result).set_element(0, byte);
    ret(interpreter, num_args, result)
}

/// Build a string from a byte source or an array of byte-sized Smis.
pub(super) fn string_class_with_all(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let source = interpreter.stack(0);
    if source.is_bytes() {
        let length = Bytes::cast(source).len();
        let result = heap.allocate_string(length, Allocator::Normal); // SAFEPOINT
        let source = Bytes::cast(interpreter.stack(0));
        Bytes::cast(result).copy_from(source.as_slice());
        return ret(interpreter, num_args, result);
    }
    if source.is_array() {
        let length = Array::cast(source).len();
        for i in 0..length {
            let element = Array::cast(source).element(i);
            if !element.is_smi() || !(0..=255).contains(&element.smi_value()) {
                return FAILURE;
            }
        }
        let result = heap.allocate_string(length, Allocator::Normal); // SAFEPOINT
        let source = Array::cast(interpreter.stack(0));
        let bytes = Bytes::cast(result);
        for i in 0..length {
            bytes.set_element(i, source.element(i).smi_value() as u8);
        }
        return ret(interpreter, num_args, result);
    }
    FAILURE
}
