//! Primitive dispatch table.
//!
//! Each primitive is a function of (argument count, heap, interpreter).
//! Preconditions: receiver at `stack(argc)`, arguments at
//! `stack(argc-1..0)`. On success the primitive has popped the receiver
//! and arguments and pushed exactly one result (or dropped only the
//! arguments, for "return self"). On failure the stack is untouched and
//! the interpreter activates the method's fallback body. Primitives that
//! allocate must re-read heap values after the safepoint, through handles.
//!
//! Indices are fixed by the image. Unassigned indices fail, letting the
//! image observe the hole through the fallback body.

use std::sync::OnceLock;

use crate::consts::*;
use crate::error::Exit;
use crate::heap::Heap;
use crate::interpreter::Interpreter;
use crate::object::Obj;

mod collections;
mod control;
mod numeric;
mod os;
mod reflection;

/// Marker observed by non-local return: frames running this primitive must
/// be offered the return via #aboutToReturn:through:.
pub const UNWIND_PROTECT: usize = 162;

/// Marker observed by non-local return and the reflective primitive
/// runner: returns never cross it.
pub const SIMULATION_ROOT: usize = 163;

pub fn is_unwind_protect(prim: usize) -> bool {
    prim == UNWIND_PROTECT
}

pub fn is_simulation_root(prim: usize) -> bool {
    prim == SIMULATION_ROOT
}

pub const NUM_PRIMITIVES: usize = 512;

pub type PrimitiveResult = Result<bool, Exit>;
pub type Primitive = fn(usize, &mut Heap, &mut Interpreter) -> PrimitiveResult;

pub(crate) const SUCCESS: PrimitiveResult = Ok(true);
pub(crate) const FAILURE: PrimitiveResult = Ok(false);

pub fn invoke(
    prim: usize,
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    debug_assert!(prim > 0);
    debug_assert!(prim < NUM_PRIMITIVES);
    table()[prim](num_args, heap, interpreter)
}

fn unimplemented(_num_args: usize, _heap: &mut Heap, _interpreter: &mut Interpreter) -> PrimitiveResult {
    FAILURE
}

fn table() -> &'static [Primitive; NUM_PRIMITIVES] {
    static TABLE: OnceLock<[Primitive; NUM_PRIMITIVES]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut t: [Primitive; NUM_PRIMITIVES] = [unimplemented; NUM_PRIMITIVES];

        // Numerics.
        t[1] = numeric::number_add;
        t[2] = numeric::number_subtract;
        t[3] = numeric::number_multiply;
        t[4] = numeric::number_divide;
        t[5] = numeric::number_div;
        t[6] = numeric::number_mod;
        t[7] = numeric::number_quo;
        t[8] = numeric::number_rem;
        t[12] = numeric::number_equal;
        t[13] = numeric::number_less;
        t[14] = numeric::number_greater;
        t[15] = numeric::number_less_or_equal;
        t[16] = numeric::number_greater_or_equal;
        t[17] = numeric::number_as_integer;
        t[18] = numeric::number_as_double;
        t[19] = numeric::number_as_string;
        t[20] = numeric::integer_bit_and;
        t[21] = numeric::integer_bit_or;
        t[22] = numeric::integer_bit_xor;
        t[23] = numeric::integer_bit_shift_left;
        t[24] = numeric::integer_bit_shift_right;
        t[28] = numeric::integer_digit_at;
        t[29] = numeric::integer_digit_length;
        t[32] = numeric::double_floor;
        t[33] = numeric::double_ceiling;
        t[35] = numeric::double_rounded;
        t[37] = numeric::double_sin;
        t[38] = numeric::double_cos;
        t[39] = numeric::double_tan;
        t[40] = numeric::double_asin;
        t[41] = numeric::double_acos;
        t[42] = numeric::double_atan;
        t[43] = numeric::double_atan2;
        t[50] = numeric::double_exp;
        t[51] = numeric::double_ln;
        t[52] = numeric::double_log;
        t[53] = numeric::double_sqrt;
        t[54] = numeric::double_pow;
        t[55] = numeric::double_as_string_fixed;
        t[56] = numeric::double_as_string_exponential;
        t[57] = numeric::double_as_string_precision;
        t[58] = numeric::double_is_finite;
        t[59] = numeric::double_is_infinite;
        t[63] = numeric::double_class_parse;

        // Arrays, byte arrays, strings.
        t[66] = collections::array_class_new;
        t[69] = collections::array_at;
        t[70] = collections::array_at_put;
        t[71] = collections::array_size;
        t[72] = collections::array_replace_from_to_with_starting_at;
        t[73] = collections::array_copy_from_to;
        t[75] = collections::weak_array_class_new;
        t[78] = collections::weak_array_at;
        t[79] = collections::weak_array_at_put;
        t[80] = collections::weak_array_size;
        t[84] = collections::bytes_uint8_at;
        t[85] = collections::bytes_uint8_at_put;
        t[86] = collections::bytes_uint16_at;
        t[87] = collections::bytes_uint16_at_put;
        t[88] = collections::bytes_uint32_at;
        t[89] = collections::bytes_uint32_at_put;
        t[90] = collections::bytes_uint64_at;
        t[91] = collections::bytes_uint64_at_put;
        t[92] = collections::bytes_int8_at;
        t[93] = collections::bytes_int8_at_put;
        t[94] = collections::bytes_int16_at;
        t[95] = collections::bytes_int16_at_put;
        t[96] = collections::bytes_int32_at;
        t[97] = collections::bytes_int32_at_put;
        t[98] = collections::bytes_int64_at;
        t[99] = collections::bytes_int64_at_put;
        t[100] = collections::bytes_float32_at;
        t[101] = collections::bytes_float32_at_put;
        t[102] = collections::bytes_float64_at;
        t[103] = collections::bytes_float64_at_put;
        t[104] = collections::bytes_starts_with;
        t[105] = collections::bytes_ends_with;
        t[106] = collections::bytes_index_of;
        t[107] = collections::bytes_last_index_of;
        t[108] = collections::bytes_copy_string_from_to;
        t[109] = collections::bytes_copy_byte_array_from_to;
        t[110] = collections::byte_array_class_new;
        t[112] = collections::byte_array_class_with_all;
        t[113] = collections::byte_array_at;
        t[114] = collections::byte_array_at_put;
        t[115] = collections::byte_array_size;
        t[116] = collections::byte_array_replace_from_to_with_starting_at;
        t[117] = collections::string_at;
        t[118] = collections::string_size;
        t[119] = collections::string_hash;
        t[120] = collections::string_equals;
        t[121] = collections::string_concat;
        t[122] = collections::string_class_with;
        t[123] = collections::string_class_with_all;

        // Objects and behaviors.
        t[126] = reflection::object_yourself;
        t[127] = reflection::object_class;
        t[128] = reflection::object_is_canonical;
        t[129] = reflection::object_mark_canonical;
        t[130] = reflection::object_inst_var_at;
        t[131] = reflection::object_inst_var_at_put;
        t[133] = reflection::object_references_to;
        t[134] = reflection::object_perform_with_all;
        t[135] = reflection::object_identical;
        t[136] = reflection::object_identity_hash;
        t[137] = reflection::object_heap_size;
        t[140] = reflection::behavior_basic_new;
        t[141] = reflection::behavior_all_instances;
        t[142] = reflection::behavior_adopt_instance;

        // Closures and activations.
        t[145] = control::closure_class_new;
        t[146] = control::closure_class_with_num_copied;
        t[147] = control::closure_num_copied;
        t[148] = control::closure_defining_activation;
        t[149] = control::closure_defining_activation_put;
        t[150] = control::closure_initial_bci;
        t[151] = control::closure_initial_bci_put;
        t[152] = control::closure_num_args;
        t[153] = control::closure_num_args_put;
        t[154] = control::closure_copied_at;
        t[155] = control::closure_copied_at_put;
        t[156] = control::closure_value0;
        t[157] = control::closure_value1;
        t[158] = control::closure_value2;
        t[159] = control::closure_value3;
        t[160] = control::closure_value_array;
        t[161] = control::closure_on_do;
        t[UNWIND_PROTECT] = control::closure_ensure;
        t[SIMULATION_ROOT] = control::simulation_root;
        t[164] = control::current_activation;
        t[165] = control::activation_jump;
        t[166] = control::activation_sender;
        t[167] = control::activation_sender_put;
        t[168] = control::activation_bci;
        t[169] = control::activation_bci_put;
        t[170] = control::activation_method;
        t[171] = control::activation_method_put;
        t[172] = control::activation_closure;
        t[173] = control::activation_closure_put;
        t[174] = control::activation_receiver;
        t[175] = control::activation_receiver_put;
        t[176] = control::activation_temp_at;
        t[177] = control::activation_temp_at_put;
        t[178] = control::activation_temp_size;
        t[179] = control::activation_temp_size_put;
        t[180] = control::activation_class_new;
        t[181] = control::do_primitive_with_args;

        // Heap and interpreter services.
        t[182] = control::interpreter_flush_cache;
        t[183] = control::heap_become_forward;
        t[184] = control::heap_collect_garbage;
        t[187] = os::panic;

        // Message loop and ports.
        t[188] = os::message_loop_finish;
        t[189] = os::message_loop_exit;
        t[190] = os::message_loop_await_signal;
        t[191] = os::message_loop_cancel_signal_wait;
        t[192] = os::open_port;
        t[193] = os::close_port;
        t[194] = os::send;
        t[195] = os::spawn;

        // Platform, time, entropy, files.
        t[256] = os::platform_number_of_processors;
        t[257] = os::platform_operating_system;
        t[264] = os::time_monotonic_nanos;
        t[265] = os::time_realtime_nanos;
        t[267] = os::random_get_entropy;
        t[509] = os::print;
        t[510] = os::read_file_as_bytes;
        t[511] = os::write_bytes_to_file;

        t
    })
}

/* Shared stack-effect helpers. */

pub(crate) fn ret(interpreter: &mut Interpreter, num_args: usize, result: Obj) -> PrimitiveResult {
    interpreter.pop_n_and_push(num_args + 1, result);
    SUCCESS
}

pub(crate) fn ret_self(interpreter: &mut Interpreter, num_args: usize) -> PrimitiveResult {
    interpreter.drop_n(num_args);
    SUCCESS
}

pub(crate) fn ret_bool(
    interpreter: &mut Interpreter,
    num_args: usize,
    value: bool,
) -> PrimitiveResult {
    let result = if value {
        interpreter.true_obj()
    } else {
        interpreter.false_obj()
    };
    ret(interpreter, num_args, result)
}

pub(crate) fn ret_smi(
    interpreter: &mut Interpreter,
    num_args: usize,
    value: isize,
) -> PrimitiveResult {
    debug_assert!(Obj::is_smi_value(value));
    ret(interpreter, num_args, Obj::smi(value))
}

/// A Smi when it fits, a boxed 64-bit integer otherwise.
pub(crate) fn ret_mint(
    interpreter: &mut Interpreter,
    heap: &mut Heap,
    num_args: usize,
    value: i64,
) -> PrimitiveResult {
    if value >= SMI_MIN as i64 && value <= SMI_MAX as i64 {
        return ret(interpreter, num_args, Obj::smi(value as isize));
    }
    let result = heap.allocate_medium_integer(crate::heap::Allocator::Normal); // SAFEPOINT
    crate::object::MediumInteger::cast(result).set_value(value);
    ret(interpreter, num_args, result)
}

pub(crate) fn ret_float(
    interpreter: &mut Interpreter,
    heap: &mut Heap,
    num_args: usize,
    value: f64,
) -> PrimitiveResult {
    let result = heap.allocate_float(crate::heap::Allocator::Normal); // SAFEPOINT
    crate::object::Float::cast(result).set_value(value);
    ret(interpreter, num_args, result)
}

/// Allocate a heap string holding `bytes` and return it.
pub(crate) fn ret_string(
    interpreter: &mut Interpreter,
    heap: &mut Heap,
    num_args: usize,
    bytes: &[u8],
) -> PrimitiveResult {
    let result = heap.allocate_string(bytes.len(), crate::heap::Allocator::Normal); // SAFEPOINT
    crate::object::Bytes::cast(result).copy_from(bytes);
    ret(interpreter, num_args, result)
}

pub(crate) fn smi_arg(interpreter: &Interpreter, index: usize) -> Option<isize> {
    let value = interpreter.stack(index);
    if value.is_smi() {
        Some(value.smi_value())
    } else {
        None
    }
}

pub(crate) fn mint_arg(interpreter: &Interpreter, index: usize) -> Option<i64> {
    let value = interpreter.stack(index);
    if value.is_smi() {
        Some(value.smi_value() as i64)
    } else if value.is_medium_integer() {
        Some(crate::object::MediumInteger::cast(value).value())
    } else {
        None
    }
}

/// Coerce any number kind to a double.
pub(crate) fn float_value(value: Obj) -> Option<f64> {
    if value.is_smi() {
        Some(value.smi_value() as f64)
    } else if value.is_medium_integer() {
        Some(crate::object::MediumInteger::cast(value).value() as f64)
    } else if value.is_float() {
        Some(crate::object::Float::cast(value).value())
    } else if value.is_large_integer() {
        Some(crate::bigint::BigInt::from_obj(value).to_f64())
    } else {
        None
    }
}
