//! Bytecode interpreter: value stack, frame bookkeeping, and the decode
//! loop, split across one module per concern.
//!
//! Frame layout, from high to low stack indices:
//!
//! ```text
//! | ...                      | (high indices / stack base)
//! | message receiver         |
//! | argument 1               |
//! | ...                      |
//! | argument N               |
//! | ------------------------ |
//! | saved IP / base sender   |
//! | saved FP / 0             |  <= fp
//! | flags                    |
//! | method                   |
//! | activation / 0           |
//! | method receiver          |
//! | temporary 1              |
//! | ...                      |
//! | temporary N              |  <= sp
//! | ...                      | (low indices / stack limit)
//! ```
//!
//! The message receiver differs from the method receiver in closure
//! activations: the message receiver is the closure, the method receiver is
//! the receiver of the closure's home activation (the binding of `self`).
//!
//! Saved FPs and frame flags are SmallIntegers. The only GC-unsafe stack
//! values are the saved IPs, which the GC prologue swaps for Smi bytecode
//! indices and the epilogue swaps back; the collector can then visit every
//! slot, and bytecode arrays are free to move.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::consts::*;
use crate::error::Exit;
use crate::heap::Heap;
use crate::isolate::Isolate;
use crate::lookup::LookupCache;
use crate::object::{Activation, Method, Obj, ObjectStore};

mod activation;
mod dispatch;
mod frame;
mod send;

/// Sentinel stored in the checked stack limit to interrupt the interpreter
/// from another thread.
pub(crate) const INTERRUPT_SENTINEL: usize = usize::MAX;

/// Index one past the last stack slot; the empty stack's SP.
const STACK_BASE: usize = STACK_SLOTS;

/// Root slots handed to the collector as one contiguous range.
const NIL_ROOT: usize = 0;
const FALSE_ROOT: usize = 1;
const TRUE_ROOT: usize = 2;
const OBJECT_STORE_ROOT: usize = 3;
const NUM_ROOTS: usize = 4;

pub struct Interpreter {
    ip: *const u8,
    sp: usize,
    fp: usize,
    stack: Box<[Obj]>,
    /// Stack-overflow boundary, shared so another thread can store the
    /// interrupt sentinel.
    checked_stack_limit: Arc<AtomicUsize>,

    roots: [Obj; NUM_ROOTS],

    heap: *mut Heap,
    isolate: *mut Isolate,
    lookup_cache: LookupCache,
}

impl Interpreter {
    pub fn new(heap: &mut Heap) -> Box<Interpreter> {
        let mut interpreter = Box::new(Interpreter {
            ip: ptr::null(),
            sp: STACK_BASE,
            fp: 0,
            stack: vec![Obj::smi(0); STACK_SLOTS].into_boxed_slice(),
            checked_stack_limit: Arc::new(AtomicUsize::new(
                Activation::HEAP_SIZE / WORD_SIZE,
            )),
            roots: [Obj::smi(0); NUM_ROOTS],
            heap: heap as *mut Heap,
            isolate: ptr::null_mut(),
            lookup_cache: LookupCache::new(),
        });
        heap.initialize_interpreter(interpreter.as_mut() as *mut Interpreter);
        interpreter
    }

    pub(crate) fn attach_isolate(&mut self, isolate: *mut Isolate) {
        debug_assert!(self.isolate.is_null());
        self.isolate = isolate;
    }

    #[inline]
    pub(crate) fn heap(&self) -> &'static mut Heap {
        unsafe { &mut *self.heap }
    }

    #[inline]
    pub(crate) fn isolate(&self) -> &'static mut Isolate {
        unsafe { &mut *self.isolate }
    }

    /// Shared handle to the stack-limit word, for cross-thread interrupts.
    pub(crate) fn stack_limit_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.checked_stack_limit)
    }

    /// Request an exit at the next stack check.
    pub fn interrupt(&self) {
        self.checked_stack_limit
            .store(INTERRUPT_SENTINEL, Ordering::Relaxed);
    }

    /* Roots */

    pub fn nil_obj(&self) -> Obj {
        self.roots[NIL_ROOT]
    }

    pub fn false_obj(&self) -> Obj {
        self.roots[FALSE_ROOT]
    }

    pub fn true_obj(&self) -> Obj {
        self.roots[TRUE_ROOT]
    }

    pub fn object_store(&self) -> Obj {
        self.roots[OBJECT_STORE_ROOT]
    }

    pub(crate) fn initialize_root(&mut self, store: ObjectStore) {
        debug_assert!(self.roots[OBJECT_STORE_ROOT] == Obj::smi(0));
        self.roots[NIL_ROOT] = store.nil_obj();
        self.roots[FALSE_ROOT] = store.false_obj();
        self.roots[TRUE_ROOT] = store.true_obj();
        self.roots[OBJECT_STORE_ROOT] = store.obj();
    }

    /// Contiguous root range for the collector.
    pub(crate) fn root_pointers(&mut self) -> (*mut Obj, usize) {
        (self.roots.as_mut_ptr(), NUM_ROOTS)
    }

    /// Live stack range for the collector: SP up to the stack base.
    pub(crate) fn stack_pointers(&mut self) -> (*mut Obj, usize) {
        let live = STACK_BASE - self.sp;
        (unsafe { self.stack.as_mut_ptr().add(self.sp) }, live)
    }

    /* Value stack */

    #[inline]
    pub fn push(&mut self, value: Obj) {
        debug_assert!(self.sp > 0);
        self.sp -= 1;
        self.stack[self.sp] = value;
    }

    #[inline]
    pub fn pop(&mut self) -> Obj {
        let value = self.stack[self.sp];
        self.sp += 1;
        value
    }

    #[inline]
    pub fn pop_n_and_push(&mut self, n: usize, value: Obj) {
        // n may be zero: a pure push.
        self.sp = (self.sp as isize + n as isize - 1) as usize;
        self.stack[self.sp] = value;
    }

    #[inline]
    pub fn stack(&self, depth: usize) -> Obj {
        self.stack[self.sp + depth]
    }

    #[inline]
    pub fn stack_put(&mut self, depth: usize, value: Obj) {
        self.stack[self.sp + depth] = value;
    }

    #[inline]
    pub fn grow(&mut self, slots: usize) {
        self.sp -= slots;
    }

    #[inline]
    pub fn drop_n(&mut self, slots: usize) {
        self.sp += slots;
    }

    /// Values above the current frame's fixed slots.
    #[inline]
    pub fn stack_depth(&self) -> usize {
        self.fp - 4 - self.sp
    }

    /* Entry and exit */

    /// Run bytecode until a primitive surrenders control to the loop.
    pub fn enter(&mut self) {
        let saved_handles = self.heap().handles();
        match self.interpret() {
            Err(Exit) => {}
            Ok(()) => unreachable!("interpreter stopped without an exit"),
        }
        debug_assert!(self.heap().handles() == saved_handles);
    }

    /// Unwound by `?` to the `enter` frame.
    pub(crate) fn exit(&self) -> Exit {
        Exit
    }

    /* Safepoint bookkeeping */

    /// Convert the live IP and every saved IP into Smi bytecode indices so
    /// that all stack slots are valid tagged values.
    pub(crate) fn gc_prologue(&mut self) {
        let mut fp = self.fp;
        let mut slot_of: Option<usize> = None;
        while fp != 0 {
            let method = Method::cast(self.frame_method(fp));
            match slot_of {
                None => {
                    let bci = method.bci(self.ip);
                    self.ip = bci.raw() as *const u8;
                }
                Some(frame) => {
                    let bci = method.bci(self.frame_saved_ip(frame));
                    self.frame_put_saved_ip_obj(frame, bci);
                }
            }
            slot_of = Some(fp);
            fp = self.frame_saved_fp(fp);
        }
    }

    /// Convert bytecode indices back into raw IPs, and invalidate the
    /// lookup caches: methods may have moved or changed identity.
    pub(crate) fn gc_epilogue(&mut self) {
        let mut fp = self.fp;
        let mut slot_of: Option<usize> = None;
        while fp != 0 {
            let method = Method::cast(self.frame_method(fp));
            match slot_of {
                None => {
                    let bci = Obj::from_raw(self.ip as usize);
                    self.ip = method.ip(bci);
                }
                Some(frame) => {
                    let bci = self.frame_saved_ip_obj(frame);
                    self.frame_put_saved_ip(frame, method.ip(bci));
                }
            }
            slot_of = Some(fp);
            fp = self.frame_saved_fp(fp);
        }

        self.lookup_cache.clear();
    }

    /// Drop every cached method binding (become, cache-flush primitive).
    pub fn flush_lookup_caches(&mut self) {
        self.lookup_cache.clear();
    }

    /// Log the current call chain, reifying frames first.
    pub fn print_stack(&mut self) {
        let top = self.flush_all_frames();
        let mut activation = top;
        let nil = self.nil_obj();
        while activation != nil && activation.is_activation() {
            let act = crate::object::Activation::cast(activation);
            let method = act.method();
            if method != nil && method.is_regular_object() {
                let selector = Method::cast(method).selector();
                if selector.is_string() {
                    let bytes = crate::object::Bytes::cast(selector);
                    tracing::info!(
                        target: "interp",
                        selector = %String::from_utf8_lossy(bytes.as_slice()),
                        "  frame"
                    );
                }
            }
            activation = act.sender();
        }
        self.create_base_frame(crate::object::Activation::cast(top));
    }
}
