//! Platform, time, entropy, file, console, and message-loop primitives.

use rand::RngCore;

use super::{
    mint_arg, ret, ret_bool, ret_mint, ret_self, ret_smi, ret_string, smi_arg, PrimitiveResult,
    FAILURE,
};
use crate::heap::{Allocator, Heap};
use crate::interpreter::Interpreter;
use crate::message_loop::{monotonic_nanos, IsolateMessage, Payload};
use crate::object::Bytes;
use crate::port::{PortMap, ILLEGAL_PORT};

/* Message loop */

/// End the current message dispatch: adjust the loop's wakeup, pop the
/// dispatch frame, and surrender to the loop.
pub(super) fn message_loop_finish(
    _num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let new_wakeup = match mint_arg(interpreter, 0) {
        Some(wakeup) => wakeup,
        None => return FAILURE,
    };
    interpreter.isolate().loop_mut().message_epilogue(new_wakeup);
    interpreter.return_from_dispatch();
    Err(interpreter.exit())
}

pub(super) fn message_loop_exit(
    _num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let exit_code = match smi_arg(interpreter, 0) {
        Some(code) => code,
        None => return FAILURE,
    };
    interpreter.isolate().loop_mut().exit(exit_code as i64);
    Err(interpreter.exit())
}

/// Native handle waiting belongs to the host abstraction; without it the
/// image's fallback path runs.
pub(super) fn message_loop_await_signal(
    _num_args: usize,
    _heap: &mut Heap,
    _interpreter: &mut Interpreter,
) -> PrimitiveResult {
    FAILURE
}

pub(super) fn message_loop_cancel_signal_wait(
    _num_args: usize,
    _heap: &mut Heap,
    _interpreter: &mut Interpreter,
) -> PrimitiveResult {
    FAILURE
}

pub(super) fn open_port(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let port = interpreter.isolate().loop_mut().open_port();
    ret_mint(interpreter, heap, num_args, port)
}

pub(super) fn close_port(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let port = match mint_arg(interpreter, 0) {
        Some(port) => port,
        None => return FAILURE,
    };
    interpreter.isolate().loop_mut().close_port(port);
    ret_self(interpreter, num_args)
}

pub(super) fn send(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let port = match mint_arg(interpreter, 1) {
        Some(port) => port,
        None => return FAILURE,
    };
    let data = interpreter.stack(0);
    if !data.is_byte_array() {
        return FAILURE;
    }

    let payload = Bytes::cast(data).as_slice().to_vec();
    let delivered = PortMap::post_message(IsolateMessage {
        port,
        payload: Payload::Bytes(payload),
    });
    ret_bool(interpreter, num_args, delivered)
}

/// Run a fresh isolate over the same snapshot on its own thread, seeded
/// with the given message.
pub(super) fn spawn(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let message = interpreter.stack(0);
    if !message.is_byte_array() {
        return FAILURE;
    }
    let payload = Bytes::cast(message).as_slice().to_vec();
    interpreter.isolate().spawn(IsolateMessage {
        port: ILLEGAL_PORT,
        payload: Payload::Bytes(payload),
    });
    ret_self(interpreter, num_args)
}

/* Platform */

pub(super) fn platform_number_of_processors(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let processors = std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1);
    ret_smi(interpreter, num_args, processors as isize)
}

pub(super) fn platform_operating_system(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    ret_string(interpreter, heap, num_args, std::env::consts::OS.as_bytes())
}

/* Time */

pub(super) fn time_monotonic_nanos(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    ret_mint(interpreter, heap, num_args, monotonic_nanos())
}

pub(super) fn time_realtime_nanos(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or(0);
    ret_mint(interpreter, heap, num_args, now)
}

/* Entropy */

/// Fill the first `size` bytes of the buffer argument; answers status 0.
pub(super) fn random_get_entropy(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let size = match smi_arg(interpreter, 0) {
        Some(size) if size >= 0 => size as usize,
        _ => return FAILURE,
    };
    let buffer = interpreter.stack(1);
    if !buffer.is_byte_array() || Bytes::cast(buffer).len() < size {
        return FAILURE;
    }
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    let buffer = Bytes::cast(buffer);
    for (i, &byte) in bytes.iter().enumerate() {
        buffer.set_element(i, byte);
    }
    ret_smi(interpreter, num_args, 0)
}

/* Console */

pub(super) fn print(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let message = interpreter.stack(0);
    if message.is_string() {
        let bytes = Bytes::cast(message);
        println!("{}", String::from_utf8_lossy(bytes.as_slice()));
    } else if message.is_smi() {
        println!("[print] {}", message.smi_value());
    } else {
        println!("[print] instance with cid {}", message.cid());
    }
    ret_self(interpreter, num_args)
}

pub(super) fn panic(
    _num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    eprintln!("Panic:");
    interpreter.print_stack();
    std::process::exit(-1);
}

/* Files */

fn filename_arg(interpreter: &Interpreter, index: usize) -> Option<String> {
    let filename = interpreter.stack(index);
    if !filename.is_bytes() {
        return None;
    }
    Some(String::from_utf8_lossy(Bytes::cast(filename).as_slice()).into_owned())
}

pub(super) fn read_file_as_bytes(
    num_args: usize,
    heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let filename = match filename_arg(interpreter, 0) {
        Some(filename) => filename,
        None => return FAILURE,
    };
    let contents = match std::fs::read(&filename) {
        Ok(contents) => contents,
        Err(_) => return FAILURE,
    };

    let result = heap.allocate_byte_array(contents.len(), Allocator::Normal); // SAFEPOINT
    Bytes::cast(result).copy_from(&contents);
    ret(interpreter, num_args, result)
}

pub(super) fn write_bytes_to_file(
    num_args: usize,
    _heap: &mut Heap,
    interpreter: &mut Interpreter,
) -> PrimitiveResult {
    let content = interpreter.stack(1);
    if !content.is_bytes() {
        return FAILURE;
    }
    let filename = match filename_arg(interpreter, 0) {
        Some(filename) => filename,
        None => return FAILURE,
    };
    if std::fs::write(&filename, Bytes::cast(content).as_slice()).is_err() {
        return FAILURE;
    }
    ret_self(interpreter, num_args)
}
