//! Method and closure entry, frame flushing, activation reification, and
//! the return family, including non-local return with its unwind-protect
//! and cannot-return hooks.

use super::frame::{flags_is_closure, flags_num_args, make_flags};
use super::{Interpreter, INTERRUPT_SENTINEL, STACK_BASE};
use crate::consts::*;
use crate::error::Exit;
use crate::heap::{Allocator, HandleScope};
use crate::object::{Activation, Closure, Method, Obj};
use crate::primitives;

use std::ptr;
use std::sync::atomic::Ordering;

impl Interpreter {
    /// Enter `method` for a send with `num_args` arguments already on the
    /// stack under the receiver. Primitives run first; on success they have
    /// already adjusted the stack, on failure the method body is activated.
    pub(crate) fn activate(&mut self, method: Method, num_args: usize) -> Result<(), Exit> {
        debug_assert!(num_args == method.num_args());

        let mut method_obj = method.obj();
        let prim = method.primitive();
        if prim != 0 {
            if prim & PRIMITIVE_GETTER_BIT != 0 {
                let offset = prim & 255;
                debug_assert!(num_args == 0);
                let receiver = self.stack(0);
                debug_assert!(receiver.is_regular_object() || receiver.is_ephemeron());
                let value = crate::object::RegularObject::cast(receiver).slot(offset);
                self.pop_n_and_push(1, value);
                return Ok(());
            } else if prim & PRIMITIVE_SETTER_BIT != 0 {
                let offset = prim & 255;
                debug_assert!(num_args == 1);
                let receiver = self.stack(1);
                let value = self.stack(0);
                debug_assert!(receiver.is_regular_object() || receiver.is_ephemeron());
                let heap = self.heap();
                crate::object::RegularObject::cast(receiver).set_slot(heap, offset, value);
                self.pop_n_and_push(2, receiver);
                return Ok(());
            } else {
                let heap = self.heap();
                let _h1 = HandleScope::new(heap, &mut method_obj);
                if primitives::invoke(prim, num_args, heap, self)? {
                    return Ok(());
                }
            }
        }
        let method = Method::cast(method_obj);

        // Create frame.
        let receiver = self.stack(num_args);
        self.push(Obj::from_raw(self.ip as usize)); // Saved IP.
        self.push(Obj::smi(self.fp as isize)); // Saved FP.
        self.fp = self.sp;
        self.push(make_flags(num_args, false));
        self.push(method.obj());
        self.push(Obj::ZERO); // Activation.
        self.push(receiver);

        self.ip = method.ip(Obj::smi(1));
        let num_temps = method.num_temps();
        let nil = self.nil_obj();
        for _ in num_args..num_temps {
            self.push(nil);
        }

        if self.sp < self.checked_stack_limit.load(Ordering::Relaxed) {
            self.stack_overflow()?;
        }
        Ok(())
    }

    /// Enter the closure sitting at `stack(num_args)`. The new frame's
    /// method receiver is the home activation's receiver, not the closure.
    pub(crate) fn activate_closure(&mut self, num_args: usize) -> Result<(), Exit> {
        let closure = Closure::cast(self.stack(num_args));
        debug_assert!(closure.num_args() == Obj::smi(num_args as isize));

        let home = Activation::cast(closure.defining_activation());
        let method = Method::cast(home.method());

        // Create frame.
        self.push(Obj::from_raw(self.ip as usize));
        self.push(Obj::smi(self.fp as isize));
        self.fp = self.sp;
        self.push(make_flags(num_args, true));
        self.push(method.obj());
        self.push(Obj::ZERO); // Activation.
        self.push(home.receiver());

        self.ip = method.ip(closure.initial_bci());

        let num_copied = closure.num_copied();
        for i in 0..num_copied {
            self.push(closure.copied(i));
        }

        // Further temps are allocated by bytecodes.

        if self.sp < self.checked_stack_limit.load(Ordering::Relaxed) {
            self.stack_overflow()?;
        }
        Ok(())
    }

    /// Like `activate`, but for message dispatch from the loop: never a
    /// primitive.
    pub(crate) fn activate_dispatch(
        &mut self,
        method: Method,
        num_args: usize,
    ) -> Result<(), Exit> {
        debug_assert!(method.primitive() == 0);
        self.activate(method, num_args)
    }

    /// Pop the dispatch frame after a drained message, re-basing to its
    /// sender when one was suspended underneath.
    pub(crate) fn return_from_dispatch(&mut self) {
        let saved_fp = self.frame_saved_fp(self.fp);
        if saved_fp == 0 {
            let sender = self.frame_base_sender(self.fp);
            if sender.is_heap_object() && sender.is_activation() {
                self.ip = ptr::null();
                self.sp = self.frame_saved_sp(self.fp);
                self.fp = 0;
                self.create_base_frame(Activation::cast(sender));
                return;
            }
        }

        self.ip = self.frame_saved_ip(self.fp);
        self.sp = self.frame_saved_sp(self.fp);
        self.fp = saved_fp;
    }

    /// Rebuild the bottom frame of the stack from a suspended activation.
    pub(crate) fn create_base_frame(&mut self, activation: Activation) {
        debug_assert!(activation.bci().is_smi());
        debug_assert!(self.sp == STACK_BASE);
        debug_assert!(self.fp == 0);

        let nil = self.nil_obj();
        let is_closure;
        let num_args;
        if activation.closure() == nil {
            is_closure = false;
            num_args = Method::cast(activation.method()).num_args();
            self.push(activation.receiver()); // Message receiver.
        } else {
            let closure = Closure::cast(activation.closure());
            is_closure = true;
            num_args = closure.num_args().smi_value() as usize;
            self.push(closure.obj()); // Message receiver.
        }
        for i in 0..num_args {
            self.push(activation.temp(i));
        }

        debug_assert!(!activation.sender().is_smi());

        // Create frame.
        self.push(activation.sender()); // Base sender.
        self.push(Obj::smi(0)); // Saved FP.
        self.fp = self.sp;
        self.push(make_flags(num_args, is_closure));
        self.push(activation.method());
        self.push(activation.obj());
        self.push(activation.receiver());

        let num_temps = activation.stack_depth();
        for i in num_args..num_temps {
            self.push(activation.temp(i));
        }
        // Drop the temps. The frame, not the activation, is the truth now;
        // stale references left behind would leak.
        activation.set_stack_depth(num_args);

        self.ip = Method::cast(activation.method()).ip(activation.bci());

        activation.set_sender_fp(self.fp);

        debug_assert!(self.frame_saved_fp(self.fp) == 0);
        debug_assert!(self.frame_method(self.fp) == activation.method());
        debug_assert!(self.frame_activation(self.fp) == activation.obj());
        debug_assert!(self.frame_receiver(self.fp) == activation.receiver());
    }

    /// SP crossed the checked limit: interrupt requested, or a real
    /// overflow, handled by migrating every frame to the heap and
    /// rebuilding only the top as a base frame.
    pub(crate) fn stack_overflow(&mut self) -> Result<(), Exit> {
        if self.checked_stack_limit.load(Ordering::Relaxed) == INTERRUPT_SENTINEL {
            self.print_stack();
            return Err(self.exit());
        }

        let top = self.flush_all_frames(); // SAFEPOINT
        self.create_base_frame(Activation::cast(top));
        Ok(())
    }

    /* Returns */

    pub(crate) fn method_return(&mut self, result: Obj) -> Result<(), Exit> {
        if !flags_is_closure(self.frame_flags(self.fp)) {
            self.local_return(result)
        } else {
            self.non_local_return(result)
        }
    }

    pub(crate) fn local_return(&mut self, result: Obj) -> Result<(), Exit> {
        let saved_fp = self.frame_saved_fp(self.fp);
        if saved_fp == 0 {
            return self.local_base_return(result);
        }

        self.ip = self.frame_saved_ip(self.fp);
        self.sp = self.frame_saved_sp(self.fp);
        self.fp = saved_fp;
        self.push(result);
        Ok(())
    }

    fn local_base_return(&mut self, mut result: Obj) -> Result<(), Exit> {
        // Returning from the base frame.
        let top;
        {
            let heap = self.heap();
            let _h1 = HandleScope::new(heap, &mut result);
            top = self.flush_all_frames(); // SAFEPOINT
        }
        let top = Activation::cast(top);

        let sender = top.sender();
        if !sender.is_heap_object()
            || !sender.is_activation()
            || !Activation::cast(sender).bci().is_smi()
        {
            self.create_base_frame(top);
            return self.send_cannot_return(result);
        }

        let nil = self.nil_obj();
        top.set_sender_no_barrier(nil);
        top.set_bci(nil);

        self.create_base_frame(Activation::cast(sender));
        self.push(result);
        Ok(())
    }

    /// Return from a closure to the home method's sender, notifying any
    /// unwind-protect frame passed through, and refusing when the home
    /// activation is dead.
    pub(crate) fn non_local_return(&mut self, mut result: Obj) -> Result<(), Exit> {
        // Search the static chain for the enclosing method activation.
        debug_assert!(flags_is_closure(self.frame_flags(self.fp)));
        let nil = self.nil_obj();
        let closure = Closure::cast(self.frame_temp(self.fp, -1));
        let mut home = Activation::cast(closure.defining_activation());
        let mut c = home.closure();
        while c != nil {
            home = Activation::cast(Closure::cast(c).defining_activation());
            c = home.closure();
        }
        let mut home_obj = home.obj();

        // Search the dynamic chain for the home activation's frame.
        let mut fp = self.frame_saved_fp(self.fp);
        while fp != 0 {
            if self.frame_activation(fp) == home_obj {
                if self.frame_saved_fp(fp) == 0 {
                    break; // Return crosses the base frame.
                }
                // This implicitly zaps every activation on the dynamic
                // chain.
                self.ip = self.frame_saved_ip(fp);
                self.sp = self.frame_saved_sp(fp);
                self.fp = self.frame_saved_fp(fp);
                self.push(result);
                return Ok(());
            }

            let prim = Method::cast(self.frame_method(fp)).primitive();
            if primitives::is_unwind_protect(prim) || primitives::is_simulation_root(prim) {
                break;
            }
            fp = self.frame_saved_fp(fp);
        }

        // Crossing the base frame, #cannotReturn:, or #aboutToReturn:
        // through:. Rare enough to flush to activations rather than handle
        // a mixture of frames and activations.
        let top;
        {
            let heap = self.heap();
            let _h1 = HandleScope::new(heap, &mut home_obj);
            let _h2 = HandleScope::new(heap, &mut result);
            top = self.flush_all_frames(); // SAFEPOINT
        }
        let top = Activation::cast(top);
        let home = Activation::cast(home_obj);

        // Search the dynamic chain for a dead activation or an
        // unwind-protect activation blocking the return.
        let mut unwind = top.sender();
        while unwind != home.obj() {
            if !unwind.is_heap_object() || !unwind.is_activation() {
                self.create_base_frame(top);
                return self.send_cannot_return(result);
            }

            let prim = Method::cast(Activation::cast(unwind).method()).primitive();
            if primitives::is_unwind_protect(prim) {
                self.create_base_frame(top);
                return self.send_about_to_return_through(result, unwind);
            }
            if primitives::is_simulation_root(prim) {
                self.create_base_frame(top);
                return self.send_cannot_return(result);
            }

            unwind = Activation::cast(unwind).sender();
        }

        let sender = home.sender();
        if !sender.is_heap_object()
            || !sender.is_activation()
            || !Activation::cast(sender).bci().is_smi()
        {
            self.create_base_frame(top);
            return self.send_cannot_return(result);
        }

        // Mark activations on the dynamic chain up to the return target as
        // dead, the home activation included.
        let mut zap = top.obj();
        loop {
            let activation = Activation::cast(zap);
            let next = activation.sender();
            activation.set_sender_no_barrier(nil);
            activation.set_bci(nil);
            zap = next;
            if zap == sender {
                break;
            }
        }

        self.create_base_frame(Activation::cast(sender));
        self.push(result);
        Ok(())
    }

    /* Reification */

    /// The frame's activation, materialized on demand.
    pub(crate) fn ensure_activation(&mut self, fp: usize) -> Activation {
        let existing = self.frame_activation(fp);
        if existing != Obj::ZERO {
            return Activation::cast(existing);
        }

        let heap = self.heap();
        let activation =
            Activation::cast(heap.allocate_activation(Allocator::Normal)); // SAFEPOINT
        let nil = self.nil_obj();
        activation.set_sender_fp(fp);
        activation.set_bci(nil);
        activation.set_method(heap, self.frame_method(fp));
        if flags_is_closure(self.frame_flags(fp)) {
            let closure = self.frame_temp(fp, -1);
            debug_assert!(closure.is_closure());
            activation.set_closure(heap, closure);
        } else {
            activation.set_closure_no_barrier(nil);
        }
        activation.set_receiver(heap, self.frame_receiver(fp));
        // Locals stay in the frame until it is flushed; returned-from
        // activations keep no copies.
        activation.set_stack_depth(0);

        self.frame_activation_put(fp, activation.obj());
        activation
    }

    /// Migrate every frame into heap activations and empty the stack.
    /// Answers the (former) top activation.
    pub(crate) fn flush_all_frames(&mut self) -> Obj {
        let mut top = self.ensure_activation(self.fp).obj(); // SAFEPOINT
        let heap = self.heap();
        let _h1 = HandleScope::new(heap, &mut top);

        while self.fp != 0 {
            self.ensure_activation(self.fp); // SAFEPOINT

            let saved_fp = self.frame_saved_fp(self.fp);
            let sender = if saved_fp != 0 {
                self.ensure_activation(saved_fp).obj() // SAFEPOINT
            } else {
                self.frame_base_sender(self.fp)
            };

            let activation = Activation::cast(self.frame_activation(self.fp));
            activation.set_sender(heap, sender);
            activation.set_bci(Method::cast(activation.method()).bci(self.ip));

            let num_args = flags_num_args(self.frame_flags(self.fp));
            let num_temps = num_args + self.frame_num_locals(self.fp, self.sp);
            for i in 0..num_temps {
                activation.set_temp(heap, i, self.frame_temp(self.fp, i as isize));
            }
            activation.set_stack_depth(num_temps);

            self.ip = self.frame_saved_ip(self.fp);
            self.sp = self.frame_saved_sp(self.fp);
            self.fp = saved_fp;
        }

        self.ip = ptr::null(); // Was the base sender.
        debug_assert!(self.sp == STACK_BASE);

        top
    }

    /// Whether `activation` is currently mirrored by a live frame. Repairs
    /// the activation's sender/bci when its frame has died.
    pub(crate) fn has_living_frame(&mut self, activation: Activation) -> bool {
        if !activation.sender().is_smi() {
            return false;
        }

        let activation_fp = activation.sender_fp();
        let mut fp = self.fp;
        while fp != 0 {
            if fp == activation_fp {
                if self.frame_activation(fp) == activation.obj() {
                    return true;
                }
                break;
            }
            fp = self.frame_saved_fp(fp);
        }

        // Frame is gone.
        let nil = self.nil_obj();
        activation.set_sender_no_barrier(nil);
        activation.set_bci(nil);
        false
    }

    /* Activation mirror protocol. Mutations that would desynchronize a
    live frame flush first. */

    pub(crate) fn current_activation(&mut self) -> Obj {
        self.ensure_activation(self.fp).obj() // SAFEPOINT
    }

    pub(crate) fn set_current_activation(&mut self, new_activation: Activation) {
        let mut protect = new_activation.obj();
        if self.fp != 0 {
            let heap = self.heap();
            let _h1 = HandleScope::new(heap, &mut protect);
            self.flush_all_frames(); // SAFEPOINT
        }
        self.create_base_frame(Activation::cast(protect));
    }

    pub(crate) fn activation_sender(&mut self, activation: Activation) -> Obj {
        if self.has_living_frame(activation) {
            let fp = activation.sender_fp();
            let sender_fp = self.frame_saved_fp(fp);
            if sender_fp == 0 {
                self.frame_base_sender(fp)
            } else {
                self.ensure_activation(sender_fp).obj() // SAFEPOINT
            }
        } else {
            activation.sender()
        }
    }

    pub(crate) fn activation_sender_put(&mut self, activation: Activation, new_sender: Obj) {
        debug_assert!(!new_sender.is_smi());
        if self.has_living_frame(activation) {
            let mut activation_obj = activation.obj();
            let mut sender_obj = new_sender;
            let top;
            {
                let heap = self.heap();
                let _h1 = HandleScope::new(heap, &mut activation_obj);
                let _h2 = HandleScope::new(heap, &mut sender_obj);
                top = self.flush_all_frames(); // SAFEPOINT
            }
            Activation::cast(activation_obj).set_sender(self.heap(), sender_obj);
            self.create_base_frame(Activation::cast(top));
        } else {
            activation.set_sender(self.heap(), new_sender);
        }
    }

    pub(crate) fn activation_bci(&mut self, activation: Activation) -> Obj {
        if activation.sender().is_smi() {
            let activation_fp = activation.sender_fp();
            let mut fp = self.fp;
            let mut ip = self.ip;
            while fp != 0 {
                if fp == activation_fp {
                    if self.frame_activation(fp) == activation.obj() {
                        return Method::cast(self.frame_method(fp)).bci(ip);
                    }
                    break;
                }
                ip = self.frame_saved_ip(fp);
                fp = self.frame_saved_fp(fp);
            }
            // Frame is gone.
            let nil = self.nil_obj();
            activation.set_sender_no_barrier(nil);
            activation.set_bci(nil);
        }

        activation.bci()
    }

    pub(crate) fn activation_bci_put(&mut self, activation: Activation, new_bci: Obj) {
        if self.has_living_frame(activation) {
            let mut activation_obj = activation.obj();
            let top;
            {
                let heap = self.heap();
                let _h1 = HandleScope::new(heap, &mut activation_obj);
                top = self.flush_all_frames(); // SAFEPOINT
            }
            Activation::cast(activation_obj).set_bci(new_bci);
            self.create_base_frame(Activation::cast(top));
        } else {
            activation.set_bci(new_bci);
        }
    }

    pub(crate) fn activation_method_put(&mut self, activation: Activation, new_method: Obj) {
        if self.has_living_frame(activation) {
            let mut activation_obj = activation.obj();
            let mut method_obj = new_method;
            let top;
            {
                let heap = self.heap();
                let _h1 = HandleScope::new(heap, &mut activation_obj);
                let _h2 = HandleScope::new(heap, &mut method_obj);
                top = self.flush_all_frames(); // SAFEPOINT
            }
            Activation::cast(activation_obj).set_method(self.heap(), method_obj);
            self.create_base_frame(Activation::cast(top));
        } else {
            activation.set_method(self.heap(), new_method);
        }
    }

    pub(crate) fn activation_closure_put(&mut self, activation: Activation, new_closure: Obj) {
        if self.has_living_frame(activation) {
            let mut activation_obj = activation.obj();
            let mut closure_obj = new_closure;
            let top;
            {
                let heap = self.heap();
                let _h1 = HandleScope::new(heap, &mut activation_obj);
                let _h2 = HandleScope::new(heap, &mut closure_obj);
                top = self.flush_all_frames(); // SAFEPOINT
            }
            Activation::cast(activation_obj).set_closure(self.heap(), closure_obj);
            self.create_base_frame(Activation::cast(top));
        } else {
            activation.set_closure(self.heap(), new_closure);
        }
    }

    pub(crate) fn activation_receiver_put(&mut self, activation: Activation, new_receiver: Obj) {
        if self.has_living_frame(activation) {
            let mut activation_obj = activation.obj();
            let mut receiver_obj = new_receiver;
            let top;
            {
                let heap = self.heap();
                let _h1 = HandleScope::new(heap, &mut activation_obj);
                let _h2 = HandleScope::new(heap, &mut receiver_obj);
                top = self.flush_all_frames(); // SAFEPOINT
            }
            Activation::cast(activation_obj).set_receiver(self.heap(), receiver_obj);
            self.create_base_frame(Activation::cast(top));
        } else {
            activation.set_receiver(self.heap(), new_receiver);
        }
    }

    pub(crate) fn activation_temp_at(&mut self, activation: Activation, index: usize) -> Obj {
        if self.has_living_frame(activation) {
            let fp = activation.sender_fp();
            self.frame_temp(fp, index as isize)
        } else {
            activation.temp(index)
        }
    }

    pub(crate) fn activation_temp_at_put(
        &mut self,
        activation: Activation,
        index: usize,
        value: Obj,
    ) {
        if self.has_living_frame(activation) {
            let fp = activation.sender_fp();
            self.frame_temp_put(fp, index as isize, value);
        } else {
            activation.set_temp(self.heap(), index, value);
        }
    }

    pub(crate) fn activation_temp_size(&mut self, activation: Activation) -> usize {
        if activation.sender().is_smi() {
            let activation_fp = activation.sender_fp();
            let mut fp = self.fp;
            let mut sp = self.sp;
            while fp != 0 {
                if fp == activation_fp {
                    if self.frame_activation(fp) == activation.obj() {
                        return flags_num_args(self.frame_flags(fp))
                            + self.frame_num_locals(fp, sp);
                    }
                    break;
                }
                sp = self.frame_saved_sp(fp);
                fp = self.frame_saved_fp(fp);
            }
            // Frame is gone.
            let nil = self.nil_obj();
            activation.set_sender_no_barrier(nil);
            activation.set_bci(nil);
        }

        activation.stack_depth()
    }

    pub(crate) fn activation_temp_size_put(&mut self, activation: Activation, new_size: usize) {
        if self.has_living_frame(activation) {
            let mut activation_obj = activation.obj();
            let top;
            {
                let heap = self.heap();
                let _h1 = HandleScope::new(heap, &mut activation_obj);
                top = self.flush_all_frames(); // SAFEPOINT
            }
            let activation = Activation::cast(activation_obj);
            let nil = self.nil_obj();
            for i in activation.stack_depth()..new_size {
                activation.init_temp(i, nil);
            }
            activation.set_stack_depth(new_size);
            self.create_base_frame(Activation::cast(top));
        } else {
            let nil = self.nil_obj();
            for i in activation.stack_depth()..new_size {
                activation.init_temp(i, nil);
            }
            activation.set_stack_depth(new_size);
        }
    }
}
