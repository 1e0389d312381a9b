//! Method lookup and the send protocols: ordinary, self, super, outer,
//! implicit-receiver, and the doesNotUnderstand: fallback, each filling
//! the lookup caches on the way back from a miss.

use tracing::trace;

use super::Interpreter;
use crate::consts::*;
use crate::error::Exit;
use crate::heap::HandleScope;
use crate::object::{
    AbstractMixin, Array, Behavior, Bytes, Message, Method, Obj, ObjectStore,
};

impl Interpreter {
    /// Selector from the current method's literal frame; selectors are
    /// always canonical strings.
    pub(crate) fn selector_at(&self, index: usize) -> Obj {
        let literals = Array::cast(Method::cast(self.frame_method(self.fp)).literals());
        debug_assert!(index < literals.len());
        let selector = literals.element(index);
        debug_assert!(selector.is_string());
        debug_assert!(selector.is_canonical());
        selector
    }

    /// Find `selector` in `cls`'s own method array, or nil.
    pub(crate) fn method_at(&self, cls: Behavior, selector: Obj) -> Obj {
        debug_assert!(selector.is_string());
        debug_assert!(selector.is_canonical());
        let methods = Array::cast(cls.methods());
        for i in 0..methods.len() {
            let method = Method::cast(methods.element(i));
            if method.selector() == selector {
                return method.obj();
            }
        }
        self.nil_obj()
    }

    fn has_method(&self, cls: Behavior, selector: Obj) -> bool {
        self.method_at(cls, selector) != self.nil_obj()
    }

    /// Send through the object-store-provided common-selector table.
    pub(crate) fn common_send(&mut self, offset: usize) -> Result<(), Exit> {
        let store = ObjectStore::cast(self.object_store());
        let common_selectors = Array::cast(store.common_selectors());
        let selector = common_selectors.element(offset * 2);
        debug_assert!(selector.is_canonical());
        let arity = common_selectors.element(offset * 2 + 1);
        debug_assert!(arity.is_smi());
        self.ordinary_send_selector(selector, arity.smi_value() as usize) // SAFEPOINT
    }

    pub(crate) fn ordinary_send(
        &mut self,
        selector_index: usize,
        num_args: usize,
    ) -> Result<(), Exit> {
        let selector = self.selector_at(selector_index);
        self.ordinary_send_selector(selector, num_args) // SAFEPOINT
    }

    pub(crate) fn ordinary_send_selector(
        &mut self,
        selector: Obj,
        num_args: usize,
    ) -> Result<(), Exit> {
        let receiver = self.stack(num_args);
        if let Some(target) = self.lookup_cache.lookup_ordinary(receiver.cid(), selector) {
            return self.activate(Method::cast(target), num_args); // SAFEPOINT
        }

        self.ordinary_send_miss(selector, num_args) // SAFEPOINT
    }

    fn ordinary_send_miss(&mut self, selector: Obj, num_args: usize) -> Result<(), Exit> {
        let nil = self.nil_obj();
        let receiver = self.stack(num_args);
        let receiver_class = receiver.klass(self.heap());
        let mut lookup_class = receiver_class;
        while lookup_class != nil {
            let method = self.method_at(Behavior::cast(lookup_class), selector);
            if method != nil {
                let method = Method::cast(method);
                if method.is_public() {
                    self.lookup_cache
                        .insert_ordinary(receiver.cid(), selector, method.obj());
                    return self.activate(method, num_args); // SAFEPOINT
                } else if method.is_protected() {
                    let present_receiver = true;
                    return self.dnu_send(
                        selector,
                        num_args,
                        receiver,
                        Behavior::cast(receiver_class),
                        present_receiver,
                    ); // SAFEPOINT
                }
            }
            lookup_class = Behavior::cast(lookup_class).superclass();
        }
        let present_receiver = true;
        self.dnu_send(
            selector,
            num_args,
            receiver,
            Behavior::cast(receiver_class),
            present_receiver,
        ) // SAFEPOINT
    }

    /// The class on `klass`'s superclass chain that is the application of
    /// `mixin`.
    pub(crate) fn find_application_of(&self, mixin: AbstractMixin, klass: Behavior) -> Behavior {
        let nil = self.nil_obj();
        let mut klass = klass;
        while klass.mixin() != mixin.obj() {
            let superclass = klass.superclass();
            if superclass == nil {
                panic!("cannot find mixin application");
            }
            klass = Behavior::cast(superclass);
        }
        klass
    }

    pub(crate) fn super_send(
        &mut self,
        selector_index: usize,
        num_args: usize,
    ) -> Result<(), Exit> {
        let selector = self.selector_at(selector_index);

        let receiver = self.frame_receiver(self.fp);
        let caller = self.frame_method(self.fp);
        if let Some((absent_receiver, target)) =
            self.lookup_cache
                .lookup_ns(receiver.cid(), selector, caller, RULE_SUPER)
        {
            debug_assert!(absent_receiver.is_none());
            return self.activate_absent(Method::cast(target), receiver, num_args); // SAFEPOINT
        }

        self.super_send_miss(selector, num_args) // SAFEPOINT
    }

    fn super_send_miss(&mut self, selector: Obj, num_args: usize) -> Result<(), Exit> {
        let receiver = self.frame_receiver(self.fp);
        let method_mixin = AbstractMixin::cast(Method::cast(self.frame_method(self.fp)).mixin());
        let receiver_class = Behavior::cast(receiver.klass(self.heap()));
        let method_mixin_app = self.find_application_of(method_mixin, receiver_class);
        self.protected_send(
            selector,
            num_args,
            receiver,
            method_mixin_app.superclass(),
            RULE_SUPER,
        ) // SAFEPOINT
    }

    pub(crate) fn implicit_receiver_send(
        &mut self,
        selector_index: usize,
        num_args: usize,
    ) -> Result<(), Exit> {
        let selector = self.selector_at(selector_index);

        let method_receiver = self.frame_receiver(self.fp);
        let caller = self.frame_method(self.fp);
        if let Some((absent_receiver, target)) = self.lookup_cache.lookup_ns(
            method_receiver.cid(),
            selector,
            caller,
            RULE_IMPLICIT_RECEIVER,
        ) {
            let receiver = absent_receiver.unwrap_or(method_receiver);
            return self.activate_absent(Method::cast(target), receiver, num_args); // SAFEPOINT
        }

        self.implicit_receiver_send_miss(selector, num_args) // SAFEPOINT
    }

    /// Walk the enclosing mixins of the current method for the innermost
    /// one defining `selector`; degrade to a protected send at the method
    /// receiver's class when none does.
    fn implicit_receiver_send_miss(&mut self, selector: Obj, num_args: usize) -> Result<(), Exit> {
        let nil = self.nil_obj();
        let method_receiver = self.frame_receiver(self.fp);

        let mut candidate_receiver = method_receiver;
        let mut candidate_mixin =
            AbstractMixin::cast(Method::cast(self.frame_method(self.fp)).mixin());

        loop {
            let candidate_application = self.find_application_of(
                candidate_mixin,
                Behavior::cast(candidate_receiver.klass(self.heap())),
            );
            if self.has_method(candidate_application, selector) {
                return self.lexical_send(
                    selector,
                    num_args,
                    candidate_receiver,
                    candidate_mixin,
                    RULE_IMPLICIT_RECEIVER,
                ); // SAFEPOINT
            }
            let enclosing = candidate_mixin.enclosing_mixin();
            if enclosing == nil {
                break;
            }
            candidate_receiver = candidate_application.enclosing_object();
            candidate_mixin = AbstractMixin::cast(enclosing);
        }
        let receiver_class = method_receiver.klass(self.heap());
        self.protected_send(
            selector,
            num_args,
            method_receiver,
            receiver_class,
            RULE_IMPLICIT_RECEIVER,
        ) // SAFEPOINT
    }

    pub(crate) fn outer_send(
        &mut self,
        selector_index: usize,
        num_args: usize,
        depth: usize,
    ) -> Result<(), Exit> {
        let selector = self.selector_at(selector_index);

        let receiver = self.frame_receiver(self.fp);
        let caller = self.frame_method(self.fp);
        if let Some((absent_receiver, target)) =
            self.lookup_cache
                .lookup_ns(receiver.cid(), selector, caller, depth)
        {
            let absent_receiver = absent_receiver.expect("outer send binds an enclosing object");
            return self.activate_absent(Method::cast(target), absent_receiver, num_args);
            // SAFEPOINT
        }

        self.outer_send_miss(selector, num_args, depth) // SAFEPOINT
    }

    fn outer_send_miss(
        &mut self,
        selector: Obj,
        num_args: usize,
        depth: usize,
    ) -> Result<(), Exit> {
        let mut receiver = self.frame_receiver(self.fp);
        let mut target_mixin =
            AbstractMixin::cast(Method::cast(self.frame_method(self.fp)).mixin());
        for _ in 0..depth {
            let mixin_app =
                self.find_application_of(target_mixin, Behavior::cast(receiver.klass(self.heap())));
            receiver = mixin_app.enclosing_object();
            target_mixin = AbstractMixin::cast(target_mixin.enclosing_mixin());
        }
        self.lexical_send(selector, num_args, receiver, target_mixin, depth) // SAFEPOINT
    }

    pub(crate) fn self_send(
        &mut self,
        selector_index: usize,
        num_args: usize,
    ) -> Result<(), Exit> {
        let selector = self.selector_at(selector_index);

        let receiver = self.frame_receiver(self.fp);
        let caller = self.frame_method(self.fp);
        if let Some((absent_receiver, target)) =
            self.lookup_cache
                .lookup_ns(receiver.cid(), selector, caller, RULE_SELF)
        {
            debug_assert!(absent_receiver.is_none());
            return self.activate_absent(Method::cast(target), receiver, num_args); // SAFEPOINT
        }

        self.self_send_miss(selector, num_args) // SAFEPOINT
    }

    fn self_send_miss(&mut self, selector: Obj, num_args: usize) -> Result<(), Exit> {
        let receiver = self.frame_receiver(self.fp);
        let method_mixin = AbstractMixin::cast(Method::cast(self.frame_method(self.fp)).mixin());
        self.lexical_send(selector, num_args, receiver, method_mixin, RULE_SELF) // SAFEPOINT
    }

    /// A private method in the mixin's own application wins; otherwise the
    /// send degrades to a protected send from the receiver's class.
    fn lexical_send(
        &mut self,
        selector: Obj,
        num_args: usize,
        receiver: Obj,
        mixin: AbstractMixin,
        rule: LookupRule,
    ) -> Result<(), Exit> {
        let nil = self.nil_obj();
        let receiver_class = Behavior::cast(receiver.klass(self.heap()));
        let mixin_application = self.find_application_of(mixin, receiver_class);
        let method = self.method_at(mixin_application, selector);
        if method != nil && Method::cast(method).is_private() {
            let method_receiver = self.frame_receiver(self.fp);
            let caller = self.frame_method(self.fp);
            let absent_receiver = if receiver == method_receiver {
                None
            } else {
                Some(receiver)
            };
            self.lookup_cache.insert_ns(
                method_receiver.cid(),
                selector,
                caller,
                rule,
                absent_receiver,
                method,
            );
            return self.activate_absent(Method::cast(method), receiver, num_args); // SAFEPOINT
        }
        self.protected_send(selector, num_args, receiver, receiver_class.obj(), rule)
        // SAFEPOINT
    }

    fn protected_send(
        &mut self,
        selector: Obj,
        num_args: usize,
        receiver: Obj,
        mixin_application: Obj,
        rule: LookupRule,
    ) -> Result<(), Exit> {
        let nil = self.nil_obj();
        let mut lookup_class = mixin_application;
        while lookup_class != nil {
            let method = self.method_at(Behavior::cast(lookup_class), selector);
            if method != nil && !Method::cast(method).is_private() {
                let method_receiver = self.frame_receiver(self.fp);
                let caller = self.frame_method(self.fp);
                let absent_receiver = if receiver == method_receiver {
                    None
                } else {
                    Some(receiver)
                };
                self.lookup_cache.insert_ns(
                    method_receiver.cid(),
                    selector,
                    caller,
                    rule,
                    absent_receiver,
                    method,
                );
                return self.activate_absent(Method::cast(method), receiver, num_args);
                // SAFEPOINT
            }
            lookup_class = Behavior::cast(lookup_class).superclass();
        }
        let present_receiver = false;
        self.dnu_send(
            selector,
            num_args,
            receiver,
            Behavior::cast(mixin_application),
            present_receiver,
        ) // SAFEPOINT
    }

    /// Package the failed send into a Message and activate the image's
    /// doesNotUnderstand: handler.
    pub(crate) fn dnu_send(
        &mut self,
        selector: Obj,
        num_args: usize,
        receiver: Obj,
        lookup_class: Behavior,
        present_receiver: bool,
    ) -> Result<(), Exit> {
        let nil = self.nil_obj();
        if selector.is_string() {
            trace!(
                target: "send",
                selector = %String::from_utf8_lossy(Bytes::cast(selector).as_slice()),
                "doesNotUnderstand:"
            );
        }

        let store = ObjectStore::cast(self.object_store());
        let dnu_selector = store.does_not_understand();

        let mut cls = lookup_class.obj();
        let mut method = nil;
        while cls != nil {
            method = self.method_at(Behavior::cast(cls), dnu_selector);
            if method != nil {
                break;
            }
            cls = Behavior::cast(cls).superclass();
        }

        if method == nil {
            panic!("recursive #doesNotUnderstand:");
        }

        let mut selector = selector;
        let mut receiver = receiver;
        let mut method = method;
        let arguments;
        {
            let heap = self.heap();
            let _h1 = HandleScope::new(heap, &mut selector);
            let _h2 = HandleScope::new(heap, &mut receiver);
            let _h3 = HandleScope::new(heap, &mut method);
            arguments = heap.allocate_array(num_args, crate::heap::Allocator::Normal);
            // SAFEPOINT
        }
        let arguments_array = Array::cast(arguments);
        for i in 0..num_args {
            let element = self.stack(num_args - i - 1);
            arguments_array.set_element(self.heap(), i, element);
        }

        let mut arguments = arguments;
        let message;
        {
            let heap = self.heap();
            let _h1 = HandleScope::new(heap, &mut selector);
            let _h2 = HandleScope::new(heap, &mut receiver);
            let _h3 = HandleScope::new(heap, &mut method);
            let _h4 = HandleScope::new(heap, &mut arguments);
            message = heap.allocate_message(); // SAFEPOINT
        }

        let message_view = Message::cast(message);
        message_view.set_selector(self.heap(), selector);
        message_view.set_arguments(self.heap(), arguments);

        self.drop_n(num_args);
        if !present_receiver {
            self.push(receiver);
        }
        self.push(message);
        self.activate(Method::cast(method), 1) // SAFEPOINT
    }

    /* Hooks surfaced to the image */

    pub(crate) fn send_cannot_return(&mut self, mut result: Obj) -> Result<(), Exit> {
        trace!(target: "send", "#cannotReturn:");

        let top;
        {
            let heap = self.heap();
            let _h1 = HandleScope::new(heap, &mut result);
            top = self.ensure_activation(self.fp).obj(); // SAFEPOINT
        }

        let nil = self.nil_obj();
        let store = ObjectStore::cast(self.object_store());
        let selector = store.cannot_return();

        let mut cls = top.klass(self.heap());
        let mut method = nil;
        while cls != nil {
            method = self.method_at(Behavior::cast(cls), selector);
            if method != nil {
                break;
            }
            cls = Behavior::cast(cls).superclass();
        }

        if method == nil {
            panic!("missing #cannotReturn:");
        }

        self.push(top);
        self.push(result);
        self.activate(Method::cast(method), 1) // SAFEPOINT
    }

    pub(crate) fn send_about_to_return_through(
        &mut self,
        mut result: Obj,
        mut unwind: Obj,
    ) -> Result<(), Exit> {
        trace!(target: "send", "#aboutToReturn:through:");

        let top;
        {
            let heap = self.heap();
            let _h1 = HandleScope::new(heap, &mut result);
            let _h2 = HandleScope::new(heap, &mut unwind);
            top = self.ensure_activation(self.fp).obj(); // SAFEPOINT
        }

        let nil = self.nil_obj();
        let store = ObjectStore::cast(self.object_store());
        let selector = store.about_to_return_through();

        let mut cls = top.klass(self.heap());
        let mut method = nil;
        while cls != nil {
            method = self.method_at(Behavior::cast(cls), selector);
            if method != nil {
                break;
            }
            cls = Behavior::cast(cls).superclass();
        }

        if method == nil {
            panic!("missing #aboutToReturn:through:");
        }

        self.push(top);
        self.push(result);
        self.push(unwind);
        self.activate(Method::cast(method), 2) // SAFEPOINT
    }

    pub(crate) fn send_non_boolean_receiver(&mut self, mut non_boolean: Obj) -> Result<(), Exit> {
        trace!(target: "send", "#nonBooleanReceiver:");

        let top;
        {
            let heap = self.heap();
            let _h1 = HandleScope::new(heap, &mut non_boolean);
            top = self.ensure_activation(self.fp).obj(); // SAFEPOINT
        }

        let nil = self.nil_obj();
        let store = ObjectStore::cast(self.object_store());
        let selector = store.non_boolean_receiver();

        let mut cls = top.klass(self.heap());
        let mut method = nil;
        while cls != nil {
            method = self.method_at(Behavior::cast(cls), selector);
            if method != nil {
                break;
            }
            cls = Behavior::cast(cls).superclass();
        }

        if method == nil {
            panic!("missing #nonBooleanReceiver:");
        }

        self.push(top);
        self.push(non_boolean);
        self.activate(Method::cast(method), 1) // SAFEPOINT
    }

    /* Absent receivers */

    /// Open a slot under the arguments for a receiver that was not pushed
    /// by the caller (self, super, outer, implicit-receiver sends).
    fn insert_absent_receiver(&mut self, receiver: Obj, num_args: usize) {
        debug_assert!(num_args < 255);
        self.grow(1);
        for i in 0..num_args {
            let value = self.stack(i + 1);
            self.stack_put(i, value);
        }
        self.stack_put(num_args, receiver);
    }

    pub(crate) fn activate_absent(
        &mut self,
        method: Method,
        receiver: Obj,
        num_args: usize,
    ) -> Result<(), Exit> {
        self.insert_absent_receiver(receiver, num_args);
        self.activate(method, num_args) // SAFEPOINT
    }
}
