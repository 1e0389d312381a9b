//! An isolate: one heap, one interpreter with its own stack, one message
//! loop, one PRNG, and a salt for hash seeding. Isolates share nothing but
//! the port map; `spawn` runs the same snapshot on a fresh thread.

use std::sync::atomic::AtomicUsize;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, OnceLock};

use itertools::Itertools;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::SnapshotError;
use crate::heap::{Allocator, HandleScope, Heap};
use crate::interpreter::Interpreter;
use crate::message_loop::{IsolateMessage, LoopEvent, MessageLoop, Payload, Wait};
use crate::object::{Array, Behavior, Bytes, MediumInteger, Method, Obj, ObjectStore};
use crate::port::ILLEGAL_PORT;
use crate::snapshot;

/// Entry registered for every live isolate so that `interrupt_all` can
/// reach it from any thread.
struct RegistryEntry {
    id: u64,
    stack_limit: Arc<AtomicUsize>,
    loop_sender: Sender<LoopEvent>,
}

fn registry() -> &'static Mutex<Vec<RegistryEntry>> {
    static REGISTRY: OnceLock<Mutex<Vec<RegistryEntry>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

fn next_isolate_id() -> u64 {
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed) as u64
}

pub struct Isolate {
    heap: Box<Heap>,
    interpreter: Box<Interpreter>,
    message_loop: MessageLoop,
    snapshot: Arc<Vec<u8>>,
    rng: StdRng,
    salt: u64,
    id: u64,
}

impl Isolate {
    /// Bring up an isolate over `snapshot`: heap, interpreter, loop, then
    /// the deserialized image.
    pub fn new(snapshot: Arc<Vec<u8>>) -> Result<Box<Isolate>, SnapshotError> {
        let mut heap = Heap::new();
        let interpreter = Interpreter::new(&mut heap);
        let mut rng = StdRng::from_entropy();
        let salt = rng.gen();

        let mut isolate = Box::new(Isolate {
            heap,
            interpreter,
            message_loop: MessageLoop::new(),
            snapshot,
            rng,
            salt,
            id: next_isolate_id(),
        });
        let isolate_ptr: *mut Isolate = isolate.as_mut();
        isolate.interpreter.attach_isolate(isolate_ptr);

        let image = Arc::clone(&isolate.snapshot);
        snapshot::deserialize(&mut isolate.heap, image.as_slice())?;

        registry().lock().expect("isolate registry").push(RegistryEntry {
            id: isolate.id,
            stack_limit: isolate.interpreter.stack_limit_handle(),
            loop_sender: isolate.message_loop.sender(),
        });

        Ok(isolate)
    }

    pub fn heap(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn interpreter(&mut self) -> &mut Interpreter {
        &mut self.interpreter
    }

    pub fn loop_mut(&mut self) -> &mut MessageLoop {
        &mut self.message_loop
    }

    /// Hash-seeding salt, fixed for the isolate's lifetime.
    pub fn salt(&self) -> u64 {
        self.salt
    }

    /// Fresh randomness for identity-hash assignment.
    pub fn next_nonce(&mut self) -> u64 {
        self.rng.gen()
    }

    /// Drive the loop until the image exits or goes quiescent.
    pub fn run(&mut self) -> i64 {
        while self.message_loop.is_running() {
            match self.message_loop.wait() {
                Wait::Message(message) => self.dispatch_message(message),
                Wait::Wakeup => self.dispatch_wakeup(),
                Wait::Interrupted => continue,
                Wait::Quiescent => break,
            }
        }
        self.message_loop.exit_code()
    }

    fn dispatch_message(&mut self, message: IsolateMessage) {
        if self.activate_message(message).is_ok() {
            self.interpreter.enter();
        }
    }

    fn dispatch_wakeup(&mut self) {
        let nil = self.interpreter.nil_obj();
        if self.activate(nil, nil).is_ok() {
            self.interpreter.enter();
        }
    }

    /// Materialize the message payload and port as heap objects and push
    /// the dispatch activation.
    fn activate_message(&mut self, message: IsolateMessage) -> Result<(), crate::error::Exit> {
        let mut payload_obj = match &message.payload {
            Payload::Bytes(bytes) => {
                let object = self.heap.allocate_byte_array(bytes.len(), Allocator::Normal);
                // SAFEPOINT
                Bytes::cast(object).copy_from(bytes);
                object
            }
            Payload::Argv(argv) => {
                let strings = Array::cast(
                    self.heap.allocate_array(argv.len(), Allocator::Normal), // SAFEPOINT
                );
                for i in 0..argv.len() {
                    strings.init_element(i, Obj::smi(0));
                }

                let mut strings_obj = strings.obj();
                {
                    let _h1 = HandleScope::new(&mut self.heap, &mut strings_obj);
                    let arg_bytes = argv.iter().map(|arg| arg.as_bytes()).collect_vec();
                    for (i, bytes) in arg_bytes.iter().enumerate() {
                        let string =
                            self.heap.allocate_string(bytes.len(), Allocator::Normal); // SAFEPOINT
                        Bytes::cast(string).copy_from(bytes);
                        Array::cast(strings_obj).set_element(&mut self.heap, i, string);
                    }
                }
                strings_obj
            }
        };

        let port_obj = if message.port == ILLEGAL_PORT {
            self.interpreter.nil_obj()
        } else if Obj::is_smi_value(message.port as isize) {
            Obj::smi(message.port as isize)
        } else {
            let _h1 = HandleScope::new(&mut self.heap, &mut payload_obj);
            let boxed = self.heap.allocate_medium_integer(Allocator::Normal); // SAFEPOINT
            MediumInteger::cast(boxed).set_value(message.port);
            boxed
        };

        self.activate(payload_obj, port_obj)
    }

    /// Dispatch a native I/O signal into the image, when the embedder has
    /// one to deliver.
    pub fn activate_signal(
        &mut self,
        handle: isize,
        status: isize,
        signals: isize,
        count: isize,
    ) {
        let store = ObjectStore::cast(self.interpreter.object_store());
        let message_loop = store.message_loop();

        let cls = Behavior::cast(message_loop.klass(&self.heap));
        let selector = store.dispatch_signal();
        let method = self.interpreter.method_at(cls, selector);
        if method == self.interpreter.nil_obj() {
            panic!("image has no signal dispatch method");
        }

        self.interpreter.push(message_loop);
        self.interpreter.push(Obj::smi(handle));
        self.interpreter.push(Obj::smi(status));
        self.interpreter.push(Obj::smi(signals));
        self.interpreter.push(Obj::smi(count));
        if self
            .interpreter
            .activate_dispatch(Method::cast(method), 4) // SAFEPOINT
            .is_ok()
        {
            self.interpreter.enter();
        }
    }

    /// Push the message-loop receiver and arguments and enter the image's
    /// dispatch method.
    fn activate(&mut self, message: Obj, port: Obj) -> Result<(), crate::error::Exit> {
        let store = ObjectStore::cast(self.interpreter.object_store());
        let message_loop = store.message_loop();

        let cls = Behavior::cast(message_loop.klass(&self.heap));
        let selector = store.dispatch_message();
        let method = self.interpreter.method_at(cls, selector);
        if method == self.interpreter.nil_obj() {
            panic!("image has no message dispatch method");
        }

        self.interpreter.push(message_loop);
        self.interpreter.push(message);
        self.interpreter.push(port);
        let entered = self.interpreter.activate_dispatch(Method::cast(method), 2); // SAFEPOINT
        if entered.is_err() {
            debug!(target: "interp", "dispatch activation interrupted");
        }
        entered
    }

    /// Run a copy of this isolate's snapshot on a worker thread, seeded
    /// with `initial_message`. A nonzero exit from the child takes the
    /// process down, matching the exit contract of spawned work.
    pub fn spawn(&self, initial_message: IsolateMessage) {
        let snapshot = Arc::clone(&self.snapshot);
        std::thread::spawn(move || {
            let mut child = match Isolate::new(snapshot) {
                Ok(child) => child,
                Err(error) => {
                    eprintln!("spawn failed to load snapshot: {}", error);
                    std::process::exit(-1);
                }
            };
            child.message_loop.post_message(initial_message);
            let exit_code = child.run();
            drop(child);
            if exit_code != 0 {
                std::process::exit(exit_code as i32);
            }
        });
    }

    /// Asynchronously interrupt every live isolate.
    pub fn interrupt_all() {
        let registry = registry().lock().expect("isolate registry");
        for entry in registry.iter() {
            entry
                .stack_limit
                .store(usize::MAX, std::sync::atomic::Ordering::Relaxed);
            let _ = entry.loop_sender.send(LoopEvent::Interrupt);
        }
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        let mut registry = registry().lock().expect("isolate registry");
        registry.retain(|entry| entry.id != self.id);
    }
}

/// Instantiate an isolate over `snapshot`, post the initial argv message,
/// and drive the loop until an exit primitive runs or the image quiesces.
pub fn run_isolate(snapshot: &[u8], argv: &[String]) -> Result<i64, SnapshotError> {
    let mut isolate = Isolate::new(Arc::new(snapshot.to_vec()))?;
    isolate.message_loop.post_message(IsolateMessage {
        port: ILLEGAL_PORT,
        payload: Payload::Argv(argv.to_vec()),
    });
    Ok(isolate.run())
}

/// Asynchronously interrupt every live isolate in the process.
pub fn interrupt_all() {
    Isolate::interrupt_all();
}
