//! Closure and activation primitives, the control-flow markers, and heap
//! and interpreter services.

use super::{ret, ret_self, ret_smi, smi_arg, PrimitiveResult, FAILURE, SUCCESS};
use crate::consts::*;
use crate::error::GcReason;
use crate::heap::{Allocator, Heap};
use crate::interpreter::Interpreter;
use crate::object::{Activation, Array, Closure, Obj, RegularObject};

/* Closures */

pub(super) fn closure_class_new(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let defining_activation = interpreter.stack(3);
    let initial_bci = interpreter.stack(2);
    let closure_num_args = interpreter.stack(1);
    if !defining_activation.is_activation()
        || !initial_bci.is_smi()
        || !closure_num_args.is_smi()
    {
        return FAILURE;
    }
    let num_copied = match smi_arg(interpreter, 0) {
        Some(count) if count >= 0 => count as usize,
        _ => return FAILURE,
    };

    let result = Closure::cast(heap.allocate_closure(num_copied, Allocator::Normal)); // SAFEPOINT
    let defining_activation = interpreter.stack(3);
    let initial_bci = interpreter.stack(2);
    let closure_num_args = interpreter.stack(1);

    result.set_defining_activation(heap, defining_activation);
    result.set_initial_bci(initial_bci);
    result.set_num_args(closure_num_args);
    let nil = interpreter.nil_obj();
    for i in 0..num_copied {
        result.init_copied(i, nil);
    }

    ret(interpreter, num_args, result.obj())
}

pub(super) fn closure_class_with_num_copied(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let num_copied = match smi_arg(interpreter, 0) {
        Some(count) if count >= 0 => count as usize,
        _ => return FAILURE,
    };

    let result = Closure::cast(heap.allocate_closure(num_copied, Allocator::Normal)); // SAFEPOINT
    let nil = interpreter.nil_obj();
    result.init_defining_activation(nil);
    result.set_initial_bci(Obj::smi(0));
    result.set_num_args(Obj::smi(-1));
    for i in 0..num_copied {
        result.init_copied(i, nil);
    }
    ret(interpreter, num_args, result.obj())
}

pub(super) fn closure_num_copied(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let closure = interpreter.stack(0);
    if !closure.is_closure() {
        return FAILURE;
    }
    ret_smi(
        interpreter,
        num_args,
        Closure::cast(closure).num_copied() as isize,
    )
}

pub(super) fn closure_defining_activation(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let closure = interpreter.stack(0);
    if !closure.is_closure() {
        return FAILURE;
    }
    ret(interpreter, num_args, Closure::cast(closure).defining_activation())
}

pub(super) fn closure_defining_activation_put(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let closure = interpreter.stack(1);
    let activation = interpreter.stack(0);
    if !closure.is_closure() {
        return FAILURE;
    }
    if !activation.is_activation() && activation != interpreter.nil_obj() {
        return FAILURE;
    }
    Closure::cast(closure).set_defining_activation(heap, activation);
    ret_self(interpreter, num_args)
}

pub(super) fn closure_initial_bci(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let closure = interpreter.stack(0);
    if !closure.is_closure() {
        return FAILURE;
    }
    ret(interpreter, num_args, Closure::cast(closure).initial_bci())
}

pub(super) fn closure_initial_bci_put(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let closure = interpreter.stack(1);
    let bci = interpreter.stack(0);
    if !closure.is_closure() || !bci.is_smi() {
        return FAILURE;
    }
    Closure::cast(closure).set_initial_bci(bci);
    ret_self(interpreter, num_args)
}

pub(super) fn closure_num_args(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let closure = interpreter.stack(0);
    if !closure.is_closure() {
        return FAILURE;
    }
    ret(interpreter, num_args, Closure::cast(closure).num_args())
}

pub(super) fn closure_num_args_put(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let closure = interpreter.stack(1);
    let count = interpreter.stack(0);
    if !closure.is_closure() || !count.is_smi() {
        return FAILURE;
    }
    Closure::cast(closure).set_num_args(count);
    ret_self(interpreter, num_args)
}

pub(super) fn closure_copied_at(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let closure = interpreter.stack(1);
    if !closure.is_closure() {
        return FAILURE;
    }
    let closure = Closure::cast(closure);
    let index = match smi_arg(interpreter, 0) {
        Some(index) => index - 1,
        None => return FAILURE,
    };
    if index < 0 || index as usize >= closure.num_copied() {
        return FAILURE;
    }
    ret(interpreter, num_args, closure.copied(index as usize))
}

pub(super) fn closure_copied_at_put(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let closure = interpreter.stack(2);
    if !closure.is_closure() {
        return FAILURE;
    }
    let closure = Closure::cast(closure);
    let index = match smi_arg(interpreter, 1) {
        Some(index) => index - 1,
        None => return FAILURE,
    };
    if index < 0 || index as usize >= closure.num_copied() {
        return FAILURE;
    }
    let value = interpreter.stack(0);
    closure.set_copied(heap, index as usize, value);
    ret(interpreter, num_args, value)
}

macro_rules! closure_value {
    ($name:ident, $arity:expr) => {
        pub(super) fn $name(
            num_args: usize,
            _heap: &mut Heap,
            interpreter: &mut Interpreter,
        ) -> PrimitiveResult {
            debug_assert!(num_args == $arity);
            let closure = interpreter.stack(num_args);
            debug_assert!(closure.is_closure());
            if Closure::cast(closure).num_args() != Obj::smi($arity) {
                return FAILURE;
            }
            interpreter.activate_closure($arity)?; // SAFEPOINT
            SUCCESS
        }
    };
}

closure_value!(closure_value0, 0);
closure_value!(closure_value1, 1);
closure_value!(closure_value2, 2);
closure_value!(closure_value3, 3);

pub(super) fn closure_value_array(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    debug_assert!(num_args == 1);
    let closure = interpreter.stack(1);
    let args = interpreter.stack(0);
    debug_assert!(closure.is_closure());
    if !args.is_array() {
        return FAILURE;
    }
    let args = Array::cast(args);
    if Closure::cast(closure).num_args() != args.size() {
        return FAILURE;
    }

    interpreter.pop();
    let closure_args = args.len();
    for i in 0..closure_args {
        interpreter.push(args.element(i));
    }

    interpreter.activate_closure(closure_args)?; // SAFEPOINT
    SUCCESS
}

/// Marker primitive for the in-image exception machinery.
pub(super) fn closure_on_do(
    _num_args: usize,
    _heap: &mut Heap,
    _interpreter: &mut Interpreter,
) -> PrimitiveResult {
    FAILURE
}

/// Marker primitive checked on non-local return.
pub(super) fn closure_ensure(
    _num_args: usize,
    _heap: &mut Heap,
    _interpreter: &mut Interpreter,
) -> PrimitiveResult {
    FAILURE
}

/// Marker primitive for non-local return and exception signaling.
pub(super) fn simulation_root(
    _num_args: usize,
    _heap: &mut Heap,
    _interpreter: &mut Interpreter,
) -> PrimitiveResult {
    FAILURE
}

/* Activations */

pub(super) fn current_activation(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let result = interpreter.current_activation(); // SAFEPOINT
    ret(interpreter, num_args, result)
}

pub(super) fn activation_jump(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let target = interpreter.stack(0);
    if !target.is_activation() || !Activation::cast(target).bci().is_smi() {
        return FAILURE;
    }

    interpreter.drop_n(num_args + 1);
    interpreter.set_current_activation(Activation::cast(target)); // SAFEPOINT
    SUCCESS
}

pub(super) fn activation_sender(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let activation = interpreter.stack(0);
    debug_assert!(activation.is_activation());
    let result = interpreter.activation_sender(Activation::cast(activation)); // SAFEPOINT
    ret(interpreter, num_args, result)
}

pub(super) fn activation_sender_put(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let activation = interpreter.stack(1);
    debug_assert!(activation.is_activation());
    let new_sender = interpreter.stack(0);
    if !new_sender.is_activation() && new_sender != interpreter.nil_obj() {
        return FAILURE;
    }
    interpreter.activation_sender_put(Activation::cast(activation), new_sender); // SAFEPOINT
    ret_self(interpreter, num_args)
}

pub(super) fn activation_bci(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let activation = interpreter.stack(0);
    debug_assert!(activation.is_activation());
    let result = interpreter.activation_bci(Activation::cast(activation));
    ret(interpreter, num_args, result)
}

pub(super) fn activation_bci_put(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let activation = interpreter.stack(1);
    debug_assert!(activation.is_activation());
    let new_bci = interpreter.stack(0);
    if !new_bci.is_smi() {
        return FAILURE;
    }
    interpreter.activation_bci_put(Activation::cast(activation), new_bci); // SAFEPOINT
    ret_self(interpreter, num_args)
}

pub(super) fn activation_method(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let activation = interpreter.stack(0);
    debug_assert!(activation.is_activation());
    ret(interpreter, num_args, Activation::cast(activation).method())
}

pub(super) fn activation_method_put(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let activation = interpreter.stack(1);
    debug_assert!(activation.is_activation());
    let new_method = interpreter.stack(0);
    interpreter.activation_method_put(Activation::cast(activation), new_method); // SAFEPOINT
    ret_self(interpreter, num_args)
}

pub(super) fn activation_closure(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let activation = interpreter.stack(0);
    debug_assert!(activation.is_activation());
    ret(interpreter, num_args, Activation::cast(activation).closure())
}

pub(super) fn activation_closure_put(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let activation = interpreter.stack(1);
    debug_assert!(activation.is_activation());
    let new_closure = interpreter.stack(0);
    if !new_closure.is_closure() && new_closure != interpreter.nil_obj() {
        return FAILURE;
    }
    interpreter.activation_closure_put(Activation::cast(activation), new_closure); // SAFEPOINT
    ret_self(interpreter, num_args)
}

pub(super) fn activation_receiver(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let activation = interpreter.stack(0);
    debug_assert!(activation.is_activation());
    ret(interpreter, num_args, Activation::cast(activation).receiver())
}

pub(super) fn activation_receiver_put(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let activation = interpreter.stack(1);
    debug_assert!(activation.is_activation());
    let new_receiver = interpreter.stack(0);
    interpreter.activation_receiver_put(Activation::cast(activation), new_receiver); // SAFEPOINT
    ret_self(interpreter, num_args)
}

pub(super) fn activation_temp_at(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let activation = interpreter.stack(1);
    debug_assert!(activation.is_activation());
    let activation = Activation::cast(activation);
    let index = match smi_arg(interpreter, 0) {
        Some(index) => index - 1,
        None => return FAILURE,
    };
    if index < 0 || index as usize >= interpreter.activation_temp_size(activation) {
        return FAILURE;
    }
    let result = interpreter.activation_temp_at(activation, index as usize);
    ret(interpreter, num_args, result)
}

pub(super) fn activation_temp_at_put(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let activation = interpreter.stack(2);
    debug_assert!(activation.is_activation());
    let activation = Activation::cast(activation);
    let index = match smi_arg(interpreter, 1) {
        Some(index) => index - 1,
        None => return FAILURE,
    };
    if index < 0 || index as usize >= interpreter.activation_temp_size(activation) {
        return FAILURE;
    }
    let value = interpreter.stack(0);
    interpreter.activation_temp_at_put(activation, index as usize, value);
    ret(interpreter, num_args, value)
}

pub(super) fn activation_temp_size(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let activation = interpreter.stack(0);
    debug_assert!(activation.is_activation());
    let size = interpreter.activation_temp_size(Activation::cast(activation));
    ret_smi(interpreter, num_args, size as isize)
}

pub(super) fn activation_temp_size_put(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let activation = interpreter.stack(1);
    debug_assert!(activation.is_activation());
    let new_size = match smi_arg(interpreter, 0) {
        Some(size) if (0..=MAX_TEMPS as isize).contains(&size) => size as usize,
        _ => return FAILURE,
    };
    interpreter.activation_temp_size_put(Activation::cast(activation), new_size); // SAFEPOINT
    ret_self(interpreter, num_args)
}

pub(super) fn activation_class_new(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let result = Activation::cast(heap.allocate_activation(Allocator::Normal)); // SAFEPOINT
    let nil = interpreter.nil_obj();
    result.set_sender_no_barrier(nil);
    result.set_bci(nil);
    result.set_method_no_barrier(nil);
    result.set_closure_no_barrier(nil);
    result.set_receiver_no_barrier(nil);
    result.set_stack_depth(0);
    ret(interpreter, num_args, result.obj())
}

/// Run a primitive reflectively against an explicit receiver and argument
/// array. Control-flow primitives are refused; the callee must leave the
/// frame exactly where it found it.
pub(super) fn do_primitive_with_args(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let primitive_index = interpreter.stack(2);
    let receiver = interpreter.stack(1);
    let arguments = interpreter.stack(0);

    if !primitive_index.is_smi() || !arguments.is_array() {
        return FAILURE;
    }

    let index = primitive_index.smi_value();
    if index <= 0 {
        return FAILURE;
    }
    if index == 164  // currentActivation
        || index == 156  // value
        || index == 157  // value:
        || index == 158  // value:value:
        || index == 159  // value:value:value:
        || index == 160  // valueWithArguments:
        || index == 165  // Activation jump
        || index == 134
    // perform:withAll:
    {
        return FAILURE;
    }

    let arguments = Array::cast(arguments);
    let callee_num_args = arguments.len();

    // The accessor encodings shift up by one bit here so ordinary indices
    // keep their meaning.
    if index as usize & (PRIMITIVE_GETTER_BIT << 1) != 0 {
        let offset = index as usize & (PRIMITIVE_GETTER_BIT * 2 - 1);
        if !receiver.is_regular_object() && !receiver.is_ephemeron() {
            return FAILURE;
        }
        let value = RegularObject::cast(receiver).slot(offset);
        return ret(interpreter, num_args, value);
    } else if index as usize & (PRIMITIVE_SETTER_BIT << 1) != 0 {
        let offset = index as usize & (PRIMITIVE_GETTER_BIT * 2 - 1);
        if !receiver.is_regular_object() && !receiver.is_ephemeron() {
            return FAILURE;
        }
        let value = arguments.element(0);
        RegularObject::cast(receiver).set_slot(heap, offset, value);
        return ret(interpreter, num_args, receiver);
    }

    if index <= 0 || index as usize >= super::NUM_PRIMITIVES {
        return FAILURE;
    }

    interpreter.push(receiver);
    for i in 0..callee_num_args {
        if arguments.element(i) == arguments.obj() {
            panic!("simulation error");
        }
        interpreter.push(arguments.element(i));
    }

    let callee_success = super::invoke(index as usize, callee_num_args, heap, interpreter)?;

    if callee_success {
        let result = interpreter.stack(0);
        interpreter.pop_n_and_push(num_args + 1 + 1, result);
        SUCCESS
    } else {
        interpreter.drop_n(callee_num_args + 1);
        let failure_token = interpreter.stack(0); // The arguments array.
        debug_assert!(failure_token.is_array());
        interpreter.pop_n_and_push(num_args + 1, failure_token);
        SUCCESS
    }
}

/* Heap and interpreter services. */

/// Atomic method install flushes through become; a separate cache flush is
/// unused.
pub(super) fn interpreter_flush_cache(
    _num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    interpreter.flush_lookup_caches();
    FAILURE
}

pub(super) fn heap_become_forward(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let left = interpreter.stack(1);
    let right = interpreter.stack(0);
    if left.is_array() && right.is_array() && heap.become_forward(left, right) {
        return ret_self(interpreter, num_args);
    }
    FAILURE
}

pub(super) fn heap_collect_garbage(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    heap.collect_all(GcReason::Primitive); // SAFEPOINT
    ret_self(interpreter, num_args)
}
