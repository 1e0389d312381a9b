//! BrothVM: a bytecode virtual machine for a dynamically typed, pure
//! object-oriented language in the Smalltalk/Newspeak tradition.
//!
//! The core is a tagged-pointer object model over a generational copying
//! heap, a stack-machine interpreter with inline method-lookup caches and
//! reified activation records, and a clustered snapshot loader that
//! populates the heap from an image. Embedders feed a snapshot and an argv
//! to [`isolate::run_isolate`] and receive the image's exit code.

pub mod bigint;
pub mod consts;
pub mod error;
pub mod freelist;
pub mod heap;
pub mod interpreter;
pub mod isolate;
pub mod lookup;
pub mod memory;
pub mod message_loop;
pub mod object;
pub mod port;
pub mod primitives;
pub mod snapshot;
pub mod util;

pub mod prelude {
    pub use crate::error::{Exit, GcReason, SnapshotError};
    pub use crate::heap::{Allocator, HandleScope, Heap};
    pub use crate::interpreter::Interpreter;
    pub use crate::isolate::{interrupt_all, run_isolate, Isolate};
    pub use crate::object::{
        Activation, Array, Behavior, Bytes, Closure, Method, Obj, ObjectStore, WeakArray,
    };
    pub use crate::port::{Port, ILLEGAL_PORT};
}
