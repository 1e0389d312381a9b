//! End-to-end control flow: whole images built with the test helpers,
//! driven through the message loop, observed via exit codes.

use broth_vm::isolate::run_isolate;
use broth_vm::util::test_helpers::{build_test_image, Literal, MethodSpec};

const MESSAGE_LOOP_EXIT: usize = 189;
const MESSAGE_LOOP_FINISH: usize = 188;

/// A method whose primitive exits the loop with its argument.
fn exit_method() -> MethodSpec {
    MethodSpec {
        selector: "exit:",
        primitive: MESSAGE_LOOP_EXIT,
        num_args: 1,
        num_temps: 1,
        literals: vec![],
        bytecode: vec![216],
    }
}

fn run(methods: Vec<MethodSpec>) -> i64 {
    let image = build_test_image(methods);
    run_isolate(&image, &[]).expect("image loads")
}

#[test]
fn smi_addition_reaches_exit_code() {
    // dispatchMessage:port: computes 40 + 2 and exits with the sum.
    let dispatch = MethodSpec {
        selector: "dispatchMessage:port:",
        primitive: 0,
        num_args: 2,
        num_temps: 2,
        literals: vec![Literal::Symbol("exit:")],
        bytecode: vec![
            76, // push receiver
            229, 40, // push 40
            229, 2, // push 2
            80, // +
            238, 1, // send exit: (selector 0, 1 arg)
        ],
    };
    assert_eq!(run(vec![dispatch, exit_method()]), 42);
}

#[test]
fn smi_comparison_branches() {
    // 5 < 3 takes the false branch; exit with 0 there, 1 otherwise.
    let dispatch = MethodSpec {
        selector: "dispatchMessage:port:",
        primitive: 0,
        num_args: 2,
        num_temps: 2,
        literals: vec![Literal::Symbol("exit:")],
        bytecode: vec![
            76, // push receiver
            229, 5, // push 5
            229, 3, // push 3
            82, // <
            244, 4, // branch if false over the true path
            229, 1, // push 1
            242, 2, // jump over the false path
            229, 0, // push 0
            238, 1, // send exit:
        ],
    };
    assert_eq!(run(vec![dispatch, exit_method()]), 0);

    let dispatch = MethodSpec {
        selector: "dispatchMessage:port:",
        primitive: 0,
        num_args: 2,
        num_temps: 2,
        literals: vec![Literal::Symbol("exit:")],
        bytecode: vec![
            76, 229, 3, 229, 5, 82, // 3 < 5
            244, 4, 229, 1, 242, 2, 229, 0, 238, 1,
        ],
    };
    assert_eq!(run(vec![dispatch, exit_method()]), 1);
}

#[test]
fn ordinary_send_activates_method_body() {
    // double: answers its argument added to itself; the dispatch method
    // exits with `self double: 21`.
    let dispatch = MethodSpec {
        selector: "dispatchMessage:port:",
        primitive: 0,
        num_args: 2,
        num_temps: 2,
        literals: vec![Literal::Symbol("double:"), Literal::Symbol("exit:")],
        bytecode: vec![
            76, // push receiver (for exit:)
            76, // push receiver (for double:)
            229, 21, // push 21
            238, 1, // send double: (selector 0, 1 arg)
            238, 9, // send exit: (selector 1, 1 arg)
        ],
    };
    let double = MethodSpec {
        selector: "double:",
        primitive: 0,
        num_args: 1,
        num_temps: 1,
        literals: vec![],
        bytecode: vec![
            64, // push temp 0 (the argument)
            64, // push temp 0
            80, // +
            217, // return top
        ],
    };
    assert_eq!(run(vec![dispatch, double, exit_method()]), 42);
}

#[test]
fn repeated_sends_hit_the_lookup_cache() {
    // Chain double: three times through a local; the second and later
    // sends are ordinary-cache hits. Temps 0 and 1 are the dispatch
    // arguments, temp 2 the local.
    let dispatch = MethodSpec {
        selector: "dispatchMessage:port:",
        primitive: 0,
        num_args: 2,
        num_temps: 3,
        literals: vec![Literal::Symbol("double:"), Literal::Symbol("exit:")],
        bytecode: vec![
            76, // push receiver (for exit:)
            76, 229, 3, 238, 1, // self double: 3 -> 6
            234, 2, 220, // store into temp 2, pop
            76, 66, 238, 1, // self double: temp2 -> 12
            234, 2, 220, //
            76, 66, 238, 1, // self double: temp2 -> 24
            238, 9, // exit: 24
        ],
    };
    let double = MethodSpec {
        selector: "double:",
        primitive: 0,
        num_args: 1,
        num_temps: 1,
        literals: vec![],
        bytecode: vec![64, 64, 80, 217],
    };
    assert_eq!(run(vec![dispatch, double, exit_method()]), 24);
}

#[test]
fn closure_local_return_resumes_caller() {
    // Push a closure answering 7, apply it with #value, exit with the
    // result.
    let dispatch = MethodSpec {
        selector: "dispatchMessage:port:",
        primitive: 0,
        num_args: 2,
        num_temps: 2,
        literals: vec![Literal::Symbol("exit:")],
        bytecode: vec![
            76, // push receiver
            253, 0, 3, // push closure: 0 copied, 0 args, 3 byte body
            229, 7, // push 7
            218, // closure local return
            105, // quick send #value
            238, 1, // send exit:
        ],
    };
    assert_eq!(run(vec![dispatch, exit_method()]), 7);
}

#[test]
fn closure_argument_is_visible_as_temp() {
    // [:x | x + 10] value: 9 -> 19.
    let dispatch = MethodSpec {
        selector: "dispatchMessage:port:",
        primitive: 0,
        num_args: 2,
        num_temps: 2,
        literals: vec![Literal::Symbol("exit:")],
        bytecode: vec![
            76, // push receiver
            253, 1, 5, // push closure: 0 copied, 1 arg, 5 byte body
            64, // push temp 0 (the closure argument)
            229, 10, // push 10
            80, // +
            218, // closure local return
            229, 9, // push 9
            106, // quick send #value:
            238, 1, // send exit:
        ],
    };
    assert_eq!(run(vec![dispatch, exit_method()]), 19);
}

#[test]
fn non_local_return_unwinds_to_home_sender() {
    // run creates a closure that returns 5 from run itself, and hands it
    // to call:, which applies it. The non-local return unwinds call:'s
    // frame and answers 5 as run's result.
    let dispatch = MethodSpec {
        selector: "dispatchMessage:port:",
        primitive: 0,
        num_args: 2,
        num_temps: 2,
        literals: vec![Literal::Symbol("run"), Literal::Symbol("exit:")],
        bytecode: vec![
            76, // push receiver (for exit:)
            76, // push receiver (for run)
            238, 0, // send run (selector 0, 0 args)
            238, 9, // send exit: (selector 1, 1 arg)
        ],
    };
    let run_method = MethodSpec {
        selector: "run",
        primitive: 0,
        num_args: 0,
        num_temps: 0,
        literals: vec![Literal::Symbol("call:")],
        bytecode: vec![
            76, // push receiver (for call:)
            253, 0, 3, // push closure: 0 copied, 0 args, 3 byte body
            229, 5, // push 5
            217, // method return: non-local from the closure
            238, 1, // send call: (selector 0, 1 arg)
            229, 99, // unreachable
            217, // unreachable
        ],
    };
    let call = MethodSpec {
        selector: "call:",
        primitive: 0,
        num_args: 1,
        num_temps: 1,
        literals: vec![],
        bytecode: vec![
            64, // push temp 0 (the closure)
            105, // quick send #value
            217, // return top (not reached: the closure unwinds past us)
        ],
    };
    assert_eq!(run(vec![dispatch, run_method, call, exit_method()]), 5);
}

#[test]
fn does_not_understand_packages_the_message() {
    // No method named flub anywhere: the send lands in
    // doesNotUnderstand:, which exits with 13.
    let dispatch = MethodSpec {
        selector: "dispatchMessage:port:",
        primitive: 0,
        num_args: 2,
        num_temps: 2,
        literals: vec![Literal::Symbol("flub")],
        bytecode: vec![
            76, // push receiver
            238, 0, // send flub (selector 0, 0 args)
            216, // return receiver (not reached)
        ],
    };
    let dnu = MethodSpec {
        selector: "doesNotUnderstand:",
        primitive: 0,
        num_args: 1,
        num_temps: 1,
        literals: vec![Literal::Symbol("exit:")],
        bytecode: vec![
            76, // push receiver
            229, 13, // push 13
            238, 1, // send exit:
        ],
    };
    assert_eq!(run(vec![dispatch, dnu, exit_method()]), 13);
}

#[test]
fn finish_drains_the_loop_and_exits_cleanly() {
    // dispatchMessage:port: finishes the dispatch; with no ports open the
    // loop goes quiescent with exit code 0.
    let dispatch = MethodSpec {
        selector: "dispatchMessage:port:",
        primitive: 0,
        num_args: 2,
        num_temps: 2,
        literals: vec![Literal::Symbol("finish:")],
        bytecode: vec![
            76, // push receiver
            229, 0, // push 0 (no wakeup)
            238, 1, // send finish:
        ],
    };
    let finish = MethodSpec {
        selector: "finish:",
        primitive: MESSAGE_LOOP_FINISH,
        num_args: 1,
        num_temps: 1,
        literals: vec![],
        bytecode: vec![216],
    };
    assert_eq!(run(vec![dispatch, finish, exit_method()]), 0);
}

#[test]
fn quick_sends_route_through_the_common_selector_table() {
    // 1000 * 1000 \\ 1000: the multiply has no fast path and dispatches
    // through the common-selector table to the multiply primitive; the
    // modulo then folds the product back to zero.
    let dispatch = MethodSpec {
        selector: "dispatchMessage:port:",
        primitive: 0,
        num_args: 2,
        num_temps: 2,
        literals: vec![
            Literal::Symbol("*"),
            Literal::Symbol("\\\\"),
            Literal::Symbol("exit:"),
        ],
        bytecode: vec![
            76, // push receiver
            225, 3, 229, 232, // push extB(3):232 = 1000
            225, 3, 229, 232, // push 1000
            88, // quick send * -> 1000000 (fits a Smi)
            225, 3, 229, 232, // push 1000
            90, // quick send \\ -> 0
            238, 17, // send exit: (selector 2, 1 arg)
        ],
    };
    assert_eq!(run(vec![dispatch, exit_method()]), 0);
}
