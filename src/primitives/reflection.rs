//! Object, behavior, and mirror primitives.

use super::{ret, ret_bool, ret_self, ret_smi, smi_arg, PrimitiveResult, FAILURE, SUCCESS};
use crate::consts::*;
use crate::heap::{Allocator, Heap};
use crate::interpreter::Interpreter;
use crate::object::{Array, Behavior, Bytes, Obj, RegularObject};

pub(super) fn object_yourself(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    ret_self(interpreter, num_args)
}

pub(super) fn object_class(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let subject = interpreter.stack(0);
    ret(interpreter, num_args, subject.klass(heap))
}

pub(super) fn object_is_canonical(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let subject = interpreter.stack(0);
    let canonical = subject.is_smi() || subject.is_canonical();
    ret_bool(interpreter, num_args, canonical)
}

pub(super) fn object_mark_canonical(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let subject = interpreter.stack(0);
    if subject.is_smi() {
        return FAILURE;
    }
    subject.set_is_canonical(true);
    ret_self(interpreter, num_args)
}

/// Mirror-style access: (mirror, subject, 1-origin index).
pub(super) fn object_inst_var_at(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let object = interpreter.stack(1);
    if !object.is_regular_object() && !object.is_ephemeron() {
        return FAILURE;
    }
    let index = match smi_arg(interpreter, 0) {
        Some(index) => index,
        None => return FAILURE,
    };
    let format = Behavior::cast(object.klass(heap)).format().smi_value();
    if index <= 0 || index > format {
        return FAILURE;
    }
    let value = RegularObject::cast(object).slot(index as usize - 1);
    ret(interpreter, num_args, value)
}

pub(super) fn object_inst_var_at_put(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let object = interpreter.stack(2);
    if !object.is_regular_object() && !object.is_ephemeron() {
        return FAILURE;
    }
    let index = match smi_arg(interpreter, 1) {
        Some(index) => index,
        None => return FAILURE,
    };
    let format = Behavior::cast(object.klass(heap)).format().smi_value();
    if index <= 0 || index > format {
        return FAILURE;
    }
    let value = interpreter.stack(0);
    RegularObject::cast(object).set_slot(heap, index as usize - 1, value);
    ret(interpreter, num_args, value)
}

pub(super) fn object_references_to(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let target = interpreter.stack(0);
    let result = heap.references_to(target); // SAFEPOINT
    ret(interpreter, num_args, result)
}

/// Reflective send: pushes the receiver and arguments, then dispatches the
/// selector as an ordinary send.
pub(super) fn object_perform_with_all(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let receiver = interpreter.stack(2);
    let selector = interpreter.stack(1);
    let arguments = interpreter.stack(0);

    if !selector.is_string() || !selector.is_canonical() || !arguments.is_array() {
        return FAILURE;
    }

    interpreter.drop_n(num_args + 1);
    let arguments = Array::cast(arguments);
    interpreter.push(receiver);
    for i in 0..arguments.len() {
        interpreter.push(arguments.element(i));
    }
    interpreter.ordinary_send_selector(selector, arguments.len())?; // SAFEPOINT
    SUCCESS
}

pub(super) fn object_identical(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let left = interpreter.stack(1);
    let right = interpreter.stack(0);
    ret_bool(interpreter, num_args, left == right)
}

pub(super) fn object_identity_hash(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let receiver = interpreter.stack(0);
    let hash;
    if receiver.is_smi() {
        let value = receiver.smi_value();
        hash = if value == 0 { 1 } else { value };
    } else if receiver.is_medium_integer() {
        let value = crate::object::MediumInteger::cast(receiver).value();
        let masked = (value as isize) & SMI_MAX;
        hash = if masked == 0 { 1 } else { masked };
    } else if receiver.is_string() {
        // A string's identity hash is its content hash.
        hash = Bytes::cast(receiver).ensure_hash(interpreter.isolate().salt());
    } else {
        let mut assigned = receiver.header_hash() as isize;
        if assigned == 0 {
            assigned = (interpreter.isolate().next_nonce() as isize) & SMI_MAX;
            if assigned == 0 {
                assigned = 1;
            }
            receiver.set_header_hash(assigned as usize);
        }
        hash = assigned;
    }
    ret_smi(interpreter, num_args, hash)
}

pub(super) fn object_heap_size(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let target = interpreter.stack(0);
    let heap_size = if target.is_heap_object() {
        target.heap_size()
    } else {
        0
    };
    ret_smi(interpreter, num_args, heap_size as isize)
}

pub(super) fn behavior_basic_new(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let mut behavior = Behavior::cast(interpreter.stack(0));
    behavior.assert_could_be_behavior();
    let mut id = behavior.id();
    if id == interpreter.nil_obj() {
        id = Obj::smi(heap.allocate_class_id() as isize); // SAFEPOINT
        behavior = Behavior::cast(interpreter.stack(0));
        heap.register_class(id.smi_value() as Cid, behavior.obj());
    }
    debug_assert!(heap.class_at(id.smi_value() as Cid) == behavior.obj());
    let num_slots = behavior.format().smi_value();
    if !(0..255).contains(&num_slots) {
        return FAILURE;
    }

    let instance = heap.allocate_regular_object(
        id.smi_value() as Cid,
        num_slots as usize,
        Allocator::Normal,
    ); // SAFEPOINT
    let nil = interpreter.nil_obj();
    let view = RegularObject::cast(instance);
    for i in 0..num_slots as usize {
        view.init_slot(i, nil);
    }
    ret(interpreter, num_args, instance)
}

pub(super) fn behavior_all_instances(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let behavior = interpreter.stack(0);
    let result = heap.instances_of(behavior); // SAFEPOINT
    ret(interpreter, num_args, result)
}

/// Migrate `instance` to `new_cls`, allocating a class id on demand. Both
/// classes must agree on layout.
pub(super) fn behavior_adopt_instance(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let new_cls = Behavior::cast(interpreter.stack(1));
    let instance = interpreter.stack(0);
    if !instance.is_regular_object() {
        return FAILURE;
    }
    let old_cls = Behavior::cast(instance.klass(heap));
    if old_cls.obj().cid() < FIRST_REGULAR_OBJECT_CID
        || old_cls.format() != new_cls.format()
    {
        return FAILURE;
    }

    let mut id = new_cls.id();
    if id == interpreter.nil_obj() {
        id = Obj::smi(heap.allocate_class_id() as isize); // SAFEPOINT
        let new_cls = Behavior::cast(interpreter.stack(1));
        heap.register_class(id.smi_value() as Cid, new_cls.obj());
    }
    let instance = interpreter.stack(0);
    instance.set_cid(id.smi_value() as Cid);

    ret_self(interpreter, num_args)
}
