//! Numeric primitives: the Smi/Mint/LargeInteger/Float coercion ladder,
//! integer bit operations, and float functions.

use super::{
    float_value, ret, ret_bool, ret_float, ret_mint, ret_smi, ret_string, smi_arg,
    PrimitiveResult, FAILURE,
};
use crate::bigint::BigInt;
use crate::heap::Heap;
use crate::interpreter::Interpreter;
use crate::object::{Bytes, Digit, Float, LargeInteger, MediumInteger, Obj};

use std::cmp::Ordering;

fn is_small_int(value: Obj) -> bool {
    value.is_smi() || value.is_medium_integer()
}

fn is_int(value: Obj) -> bool {
    value.is_smi() || value.is_medium_integer() || value.is_large_integer()
}

fn int64_value(value: Obj) -> i64 {
    if value.is_smi() {
        value.smi_value() as i64
    } else {
        MediumInteger::cast(value).value()
    }
}

fn is_float_op(left: Obj, right: Obj) -> bool {
    left.is_float() || right.is_float()
}

fn ret_bigint(
    interpreter: &mut Interpreter,
    heap: &mut Heap,
    num_args: usize,
    value: BigInt,
) -> PrimitiveResult {
    let boxed = value.into_obj(heap); // SAFEPOINT
    ret(interpreter, num_args, boxed)
}

macro_rules! arith {
    ($name:ident, $checked:ident, $bigop:ident, $floatop:tt) => {
        pub(super) fn $name(
            num_args: usize,
            heap: &mut Heap,
            interpreter: &mut Interpreter,
        ) -> PrimitiveResult {
            let left = interpreter.stack(1);
            let right = interpreter.stack(0);

            if is_small_int(left) && is_small_int(right) {
                if let Some(result) = int64_value(left).$checked(int64_value(right)) {
                    return ret_mint(interpreter, heap, num_args, result);
                }
                // Fall through to the large-integer operation.
            }

            if is_int(left) && is_int(right) {
                let result = BigInt::from_obj(left).$bigop(&BigInt::from_obj(right));
                return ret_bigint(interpreter, heap, num_args, result);
            }

            if is_float_op(left, right) {
                let raw_left = match float_value(left) {
                    Some(raw) => raw,
                    None => return FAILURE,
                };
                let raw_right = match float_value(right) {
                    Some(raw) => raw,
                    None => return FAILURE,
                };
                return ret_float(interpreter, heap, num_args, raw_left $floatop raw_right);
            }

            FAILURE
        }
    };
}

arith!(number_add, checked_add, add, +);
arith!(number_subtract, checked_sub, subtract, -);
arith!(number_multiply, checked_mul, multiply, *);

/// Exact division: fails on a nonzero remainder so the image can fall back
/// to fractions.
pub(super) fn number_divide(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let left = interpreter.stack(1);
    let right = interpreter.stack(0);

    if is_small_int(left) && is_small_int(right) {
        let raw_left = int64_value(left);
        let raw_right = int64_value(right);
        if raw_right == 0 {
            return FAILURE; // Division by zero.
        }
        if raw_right == -1 && raw_left == i64::MIN {
            // Overflow; fall through to the large-integer operation.
        } else {
            if raw_left % raw_right != 0 {
                return FAILURE; // Inexact division.
            }
            return ret_mint(interpreter, heap, num_args, raw_left / raw_right);
        }
    }

    if is_int(left) && is_int(right) {
        let divisor = BigInt::from_obj(right);
        if divisor.is_zero() {
            return FAILURE; // Division by zero.
        }
        let (quotient, remainder) = BigInt::from_obj(left).div_rem(&divisor);
        if !remainder.is_zero() {
            return FAILURE; // Inexact division.
        }
        return ret_bigint(interpreter, heap, num_args, quotient);
    }

    if is_float_op(left, right) {
        let raw_left = match float_value(left) {
            Some(raw) => raw,
            None => return FAILURE,
        };
        let raw_right = match float_value(right) {
            Some(raw) => raw,
            None => return FAILURE,
        };
        return ret_float(interpreter, heap, num_args, raw_left / raw_right);
    }

    FAILURE
}

fn floor_div_i64(a: i64, b: i64) -> i64 {
    let quotient = a / b;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        quotient - 1
    } else {
        quotient
    }
}

fn floor_mod_i64(a: i64, b: i64) -> i64 {
    let remainder = a % b;
    if remainder != 0 && (remainder < 0) != (b < 0) {
        remainder + b
    } else {
        remainder
    }
}

macro_rules! int_division {
    ($name:ident, $small:expr, $big:expr, $float:expr) => {
        pub(super) fn $name(
            num_args: usize,
            heap: &mut Heap,
            interpreter: &mut Interpreter,
        ) -> PrimitiveResult {
            let left = interpreter.stack(1);
            let right = interpreter.stack(0);

            if is_small_int(left) && is_small_int(right) {
                let raw_left = int64_value(left);
                let raw_right = int64_value(right);
                if raw_right == 0 {
                    return FAILURE; // Division by zero.
                }
                if raw_right == -1 && raw_left == i64::MIN {
                    // Overflow; fall through to the large-integer operation.
                } else {
                    let small: fn(i64, i64) -> i64 = $small;
                    return ret_mint(interpreter, heap, num_args, small(raw_left, raw_right));
                }
            }

            if is_int(left) && is_int(right) {
                let divisor = BigInt::from_obj(right);
                if divisor.is_zero() {
                    return FAILURE; // Division by zero.
                }
                let big: fn(&BigInt, &BigInt) -> BigInt = $big;
                let result = big(&BigInt::from_obj(left), &divisor);
                return ret_bigint(interpreter, heap, num_args, result);
            }

            if is_float_op(left, right) {
                let raw_left = match float_value(left) {
                    Some(raw) => raw,
                    None => return FAILURE,
                };
                let raw_right = match float_value(right) {
                    Some(raw) => raw,
                    None => return FAILURE,
                };
                if raw_right == 0.0 {
                    return FAILURE; // Division by zero.
                }
                let float: fn(f64, f64) -> f64 = $float;
                return ret_float(interpreter, heap, num_args, float(raw_left, raw_right));
            }

            FAILURE
        }
    };
}

int_division!(
    number_div,
    floor_div_i64,
    |a, b| a.div_mod_floored(b).0,
    |a, b| (a / b).floor()
);
int_division!(
    number_mod,
    floor_mod_i64,
    |a, b| a.div_mod_floored(b).1,
    |a, b| a - b * (a / b).floor()
);
int_division!(
    number_quo,
    |a, b| a / b,
    |a, b| a.div_rem(b).0,
    |a, b| (a / b).trunc()
);
int_division!(
    number_rem,
    |a, b| a % b,
    |a, b| a.div_rem(b).1,
    |a, b| a % b
);

fn compare(
    num_args: usize,
    interpreter: &mut Interpreter,
    int_pred: fn(Ordering) -> bool,
    float_pred: fn(f64, f64) -> bool,
) -> PrimitiveResult {
    let left = interpreter.stack(1);
    let right = interpreter.stack(0);

    if is_small_int(left) && is_small_int(right) {
        let ordering = int64_value(left).cmp(&int64_value(right));
        return ret_bool(interpreter, num_args, int_pred(ordering));
    }

    if is_int(left) && is_int(right) {
        let ordering = BigInt::from_obj(left).compare(&BigInt::from_obj(right));
        return ret_bool(interpreter, num_args, int_pred(ordering));
    }

    if is_float_op(left, right) {
        let raw_left = match float_value(left) {
            Some(raw) => raw,
            None => return FAILURE,
        };
        let raw_right = match float_value(right) {
            Some(raw) => raw,
            None => return FAILURE,
        };
        return ret_bool(interpreter, num_args, float_pred(raw_left, raw_right));
    }

    FAILURE
}

pub(super) fn number_equal(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    compare(num_args, interpreter, |o| o == Ordering::Equal, |a, b| a == b)
}

pub(super) fn number_less(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    compare(num_args, interpreter, |o| o == Ordering::Less, |a, b| a < b)
}

pub(super) fn number_greater(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    compare(num_args, interpreter, |o| o == Ordering::Greater, |a, b| {
        a > b
    })
}

pub(super) fn number_less_or_equal(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    compare(num_args, interpreter, |o| o != Ordering::Greater, |a, b| {
        a <= b
    })
}

pub(super) fn number_greater_or_equal(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    compare(num_args, interpreter, |o| o != Ordering::Less, |a, b| a >= b)
}

pub(super) fn number_as_integer(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let receiver = interpreter.stack(0);
    if receiver.is_float() {
        let raw = Float::cast(receiver).value();
        match BigInt::from_f64(raw.trunc()) {
            Some(value) => return ret_bigint(interpreter, heap, num_args, value),
            None => return FAILURE,
        }
    }
    FAILURE
}

pub(super) fn number_as_double(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let receiver = interpreter.stack(0);
    if is_int(receiver) {
        let raw = float_value(receiver).expect("integer coerces to double");
        return ret_float(interpreter, heap, num_args, raw);
    }
    FAILURE
}

/// Shortest form that still reads back as the same value; floats keep a
/// decimal point or exponent so they stay recognizably floats.
fn shortest_float_string(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value < 0.0 { "-Infinity" } else { "Infinity" }.to_string();
    }
    let printed = format!("{}", value);
    if printed.contains('.') || printed.contains('e') || printed.contains('E') {
        printed
    } else {
        format!("{}.0", printed)
    }
}

pub(super) fn number_as_string(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let receiver = interpreter.stack(0);
    let printed = if receiver.is_smi() {
        format!("{}", receiver.smi_value())
    } else if receiver.is_medium_integer() {
        format!("{}", MediumInteger::cast(receiver).value())
    } else if receiver.is_float() {
        shortest_float_string(Float::cast(receiver).value())
    } else if receiver.is_large_integer() {
        BigInt::from_obj(receiver).to_decimal_string()
    } else {
        return FAILURE;
    };
    ret_string(interpreter, heap, num_args, printed.as_bytes())
}

macro_rules! bitwise {
    ($name:ident, $op:tt, $bigop:ident) => {
        pub(super) fn $name(
            num_args: usize,
            heap: &mut Heap,
            interpreter: &mut Interpreter,
        ) -> PrimitiveResult {
            let left = interpreter.stack(1);
            let right = interpreter.stack(0);

            if left.is_smi() && right.is_smi() {
                let raw_result = left.smi_value() $op right.smi_value();
                return ret_smi(interpreter, num_args, raw_result);
            }

            if is_int(left) && is_int(right) {
                let result = BigInt::from_obj(left).$bigop(&BigInt::from_obj(right));
                return ret_bigint(interpreter, heap, num_args, result);
            }

            FAILURE
        }
    };
}

bitwise!(integer_bit_and, &, bit_and);
bitwise!(integer_bit_or, |, bit_or);
bitwise!(integer_bit_xor, ^, bit_xor);

pub(super) fn integer_bit_shift_left(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let left = interpreter.stack(1);
    let shift = match smi_arg(interpreter, 0) {
        Some(shift) if shift >= 0 => shift as usize,
        _ => return FAILURE,
    };
    if !is_int(left) {
        return FAILURE;
    }
    let result = BigInt::from_obj(left).shift_left(shift);
    ret_bigint(interpreter, heap, num_args, result)
}

pub(super) fn integer_bit_shift_right(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let left = interpreter.stack(1);
    let shift = match smi_arg(interpreter, 0) {
        Some(shift) if shift >= 0 => shift as usize,
        _ => return FAILURE,
    };
    if !is_int(left) {
        return FAILURE;
    }
    let result = BigInt::from_obj(left).shift_right(shift);
    ret_bigint(interpreter, heap, num_args, result)
}

/// 1-origin index into the magnitude's base-256 digits.
pub(super) fn integer_digit_at(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let receiver = interpreter.stack(1);
    let index = match smi_arg(interpreter, 0) {
        Some(index) => index - 1,
        None => return FAILURE,
    };

    if is_small_int(receiver) {
        if !(0..8).contains(&index) {
            return FAILURE;
        }
        let magnitude = int64_value(receiver).unsigned_abs() >> (8 * index);
        if magnitude == 0 {
            return FAILURE;
        }
        return ret_smi(interpreter, num_args, (magnitude & 0xff) as isize);
    }

    if receiver.is_large_integer() {
        let value = LargeInteger::cast(receiver);
        let digit_size = std::mem::size_of::<Digit>() as isize;
        let mut len = (value.size() as isize - 1) * digit_size;
        let mut high = value.digit(value.size() - 1);
        while high != 0 {
            len += 1;
            high >>= 8;
        }
        if index < 0 || index >= len {
            return FAILURE;
        }
        let digit = value.digit(index as usize / digit_size as usize);
        let byte = (digit >> (8 * (index as usize % digit_size as usize))) & 0xff;
        return ret_smi(interpreter, num_args, byte as isize);
    }

    FAILURE
}

pub(super) fn integer_digit_length(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let receiver = interpreter.stack(0);

    if is_small_int(receiver) {
        let mut magnitude = int64_value(receiver).unsigned_abs();
        let mut result = 0;
        while magnitude != 0 {
            result += 1;
            magnitude >>= 8;
        }
        return ret_smi(interpreter, num_args, result);
    }

    if receiver.is_large_integer() {
        let value = LargeInteger::cast(receiver);
        let digit_size = std::mem::size_of::<Digit>();
        let mut result = (value.size() - 1) * digit_size;
        let mut high = value.digit(value.size() - 1);
        while high != 0 {
            result += 1;
            high >>= 8;
        }
        return ret_smi(interpreter, num_args, result as isize);
    }

    FAILURE
}

/* Float functions. The receiver must already be boxed. */

macro_rules! float_function_1 {
    ($name:ident, $func:expr) => {
        pub(super) fn $name(
            num_args: usize,
            heap: &mut Heap,
            interpreter: &mut Interpreter,
        ) -> PrimitiveResult {
            let receiver = interpreter.stack(0);
            if !receiver.is_float() {
                return FAILURE;
            }
            let func: fn(f64) -> f64 = $func;
            let result = func(Float::cast(receiver).value());
            ret_float(interpreter, heap, num_args, result)
        }
    };
}

macro_rules! float_function_2 {
    ($name:ident, $func:expr) => {
        pub(super) fn $name(
            num_args: usize,
            heap: &mut Heap,
            interpreter: &mut Interpreter,
        ) -> PrimitiveResult {
            let receiver = interpreter.stack(1);
            let argument = interpreter.stack(0);
            if !receiver.is_float() || !argument.is_float() {
                return FAILURE;
            }
            let func: fn(f64, f64) -> f64 = $func;
            let result = func(Float::cast(receiver).value(), Float::cast(argument).value());
            ret_float(interpreter, heap, num_args, result)
        }
    };
}

float_function_1!(double_floor, f64::floor);
float_function_1!(double_ceiling, f64::ceil);
float_function_1!(double_rounded, f64::round);
float_function_1!(double_sin, f64::sin);
float_function_1!(double_cos, f64::cos);
float_function_1!(double_tan, f64::tan);
float_function_1!(double_asin, f64::asin);
float_function_1!(double_acos, f64::acos);
float_function_1!(double_atan, f64::atan);
float_function_2!(double_atan2, f64::atan2);
float_function_1!(double_exp, f64::exp);
float_function_1!(double_ln, f64::ln);
float_function_1!(double_log, f64::log10);
float_function_1!(double_sqrt, f64::sqrt);
float_function_2!(double_pow, f64::powf);

pub(super) fn double_as_string_fixed(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let receiver = interpreter.stack(1);
    if !receiver.is_float() {
        return FAILURE;
    }
    let fraction_digits = match smi_arg(interpreter, 0) {
        Some(digits) if (0..=20).contains(&digits) => digits as usize,
        _ => return FAILURE,
    };
    let value = Float::cast(receiver).value();
    let printed = if value < 1e21 && value > -1e21 {
        format!("{:.*}", fraction_digits, value)
    } else {
        shortest_float_string(value)
    };
    ret_string(interpreter, heap, num_args, printed.as_bytes())
}

pub(super) fn double_as_string_exponential(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let receiver = interpreter.stack(1);
    if !receiver.is_float() {
        return FAILURE;
    }
    let fraction_digits = match smi_arg(interpreter, 0) {
        Some(digits) if (0..=20).contains(&digits) => digits as usize,
        _ => return FAILURE,
    };
    let value = Float::cast(receiver).value();
    let printed = format!("{:.*e}", fraction_digits, value);
    ret_string(interpreter, heap, num_args, printed.as_bytes())
}

pub(super) fn double_as_string_precision(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let receiver = interpreter.stack(1);
    if !receiver.is_float() {
        return FAILURE;
    }
    let precision = match smi_arg(interpreter, 0) {
        Some(precision) if (1..=21).contains(&precision) => precision as usize,
        _ => return FAILURE,
    };
    let value = Float::cast(receiver).value();
    let printed = format!("{:.*e}", precision - 1, value);
    ret_string(interpreter, heap, num_args, printed.as_bytes())
}

pub(super) fn double_is_finite(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let receiver = interpreter.stack(0);
    if !receiver.is_float() {
        return FAILURE;
    }
    let value = Float::cast(receiver).value();
    ret_bool(interpreter, num_args, value.is_finite())
}

pub(super) fn double_is_infinite(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let receiver = interpreter.stack(0);
    if !receiver.is_float() {
        return FAILURE;
    }
    let value = Float::cast(receiver).value();
    ret_bool(interpreter, num_args, value.is_infinite())
}

pub(super) fn double_class_parse(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let text = interpreter.stack(0);
    if !text.is_string() {
        return FAILURE;
    }
    let bytes = Bytes::cast(text);
    let parsed = match std::str::from_utf8(bytes.as_slice()) {
        Ok(text) => text.trim().parse::<f64>(),
        Err(_) => return FAILURE,
    };
    match parsed {
        Ok(value) => ret_float(interpreter, heap, num_args, value),
        Err(_) => FAILURE,
    }
}
