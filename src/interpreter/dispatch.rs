//! Fetch-decode-execute loop.
//!
//! A prefix-extension encoding: opcodes 224/225 accumulate signed 8- or
//! 16-bit extensions (extA, extB) that widen the operands of the following
//! instruction; both reset when consumed. Opcode positions the compiler no
//! longer emits trap fatally.
//!
//! With the `static-prediction` feature, the quick-send opcodes try
//! receiver-tag-based fast paths (Smi arithmetic and comparison, array and
//! bytes access) before falling back to the common-selector table. The
//! decision never consults a primitive number, only runtime tags.

use super::Interpreter;
use crate::error::Exit;
use crate::heap::Allocator;
use crate::object::{AbstractMixin, Array, Behavior, Closure, Method, Obj};

#[cfg(feature = "static-prediction")]
use crate::object::Bytes;

impl Interpreter {
    #[inline]
    fn fetch(&mut self) -> u8 {
        let byte = unsafe { *self.ip };
        self.ip = unsafe { self.ip.add(1) };
        byte
    }

    fn push_literal_variable(&mut self, _offset: usize) {
        // Only reached by the implementation of eventual sends; binds the
        // message loop.
        let store = crate::object::ObjectStore::cast(self.object_store());
        self.push(store.message_loop());
    }

    fn push_temporary(&mut self, offset: usize) {
        let temp = self.frame_temp(self.fp, offset as isize);
        self.push(temp);
    }

    fn push_remote_temp(&mut self, vector_offset: usize, offset: usize) {
        let vector = self.frame_temp(self.fp, vector_offset as isize);
        let temp = Array::cast(vector).element(offset);
        self.push(temp);
    }

    fn store_into_temporary(&mut self, offset: usize) {
        let top = self.stack(0);
        self.frame_temp_put(self.fp, offset as isize, top);
    }

    fn store_into_remote_temp(&mut self, vector_offset: usize, offset: usize) {
        let top = self.stack(0);
        let vector = self.frame_temp(self.fp, vector_offset as isize);
        Array::cast(vector).set_element(self.heap(), offset, top);
    }

    fn pop_into_temporary(&mut self, offset: usize) {
        let top = self.pop();
        self.frame_temp_put(self.fp, offset as isize, top);
    }

    fn pop_into_remote_temp(&mut self, vector_offset: usize, offset: usize) {
        let top = self.pop();
        let vector = self.frame_temp(self.fp, vector_offset as isize);
        Array::cast(vector).set_element(self.heap(), offset, top);
    }

    fn push_literal(&mut self, offset: usize) {
        let method = Method::cast(self.frame_method(self.fp));
        let literals = Array::cast(method.literals());
        let literal = if offset == literals.len() + 1 {
            // The compiler drops the trailing selector and mixin-class
            // association from the literal frame; the mixin is reached
            // through the method instead.
            method.mixin()
        } else {
            literals.element(offset)
        };
        self.push(literal);
    }

    fn push_enclosing_object(&mut self, depth: usize) {
        debug_assert!(depth > 0); // Zero would be a push of the receiver.

        let mut enclosing_object = self.frame_receiver(self.fp);
        let mut target_mixin =
            AbstractMixin::cast(Method::cast(self.frame_method(self.fp)).mixin());
        for _ in 0..depth {
            let mixin_app = self.find_application_of(
                target_mixin,
                Behavior::cast(enclosing_object.klass(self.heap())),
            );
            enclosing_object = mixin_app.enclosing_object();
            target_mixin = AbstractMixin::cast(target_mixin.enclosing_mixin());
        }
        self.push(enclosing_object);
    }

    fn push_new_array_with_elements(&mut self, size: usize) {
        let result = Array::cast(self.heap().allocate_array(size, Allocator::Normal)); // SAFEPOINT
        for i in 0..size {
            let element = self.stack(size - i - 1);
            result.set_element(self.heap(), i, element);
        }
        self.pop_n_and_push(size, result.obj());
    }

    fn push_new_array(&mut self, size: usize) {
        let result = Array::cast(self.heap().allocate_array(size, Allocator::Normal)); // SAFEPOINT
        let nil = self.nil_obj();
        for i in 0..size {
            result.init_element(i, nil);
        }
        self.push(result.obj());
    }

    fn push_closure(&mut self, num_copied: usize, num_args: usize, block_size: usize) {
        self.ensure_activation(self.fp); // SAFEPOINT

        let closure =
            Closure::cast(self.heap().allocate_closure(num_copied, Allocator::Normal)); // SAFEPOINT
        let heap = self.heap();
        closure.set_defining_activation(heap, self.frame_activation(self.fp));
        closure.set_initial_bci(Method::cast(self.frame_method(self.fp)).bci(self.ip));
        closure.set_num_args(Obj::smi(num_args as isize));
        for i in 0..num_copied {
            let element = self.stack(num_copied - i - 1);
            closure.set_copied(heap, i, element);
        }

        self.ip = unsafe { self.ip.add(block_size) };
        self.pop_n_and_push(num_copied, closure.obj());
    }

    pub(crate) fn interpret(&mut self) -> Result<(), Exit> {
        let mut ext_a: isize = 0;
        let mut ext_b: isize = 0;
        loop {
            debug_assert!(!self.ip.is_null());
            debug_assert!(self.fp != 0);

            let byte1 = self.fetch();
            match byte1 {
                0..=15 => panic!("unused bytecode {}", byte1),
                16..=31 => self.push_literal_variable(byte1 as usize - 16),
                32..=63 => self.push_literal(byte1 as usize - 32),
                64..=75 => self.push_temporary(byte1 as usize - 64),
                76 => {
                    let receiver = self.frame_receiver(self.fp);
                    self.push(receiver);
                }
                77 => {
                    match ext_b {
                        0 => self.push(self.false_obj()),
                        1 => self.push(self.true_obj()),
                        2 => self.push(self.nil_obj()),
                        3 => panic!("unused bytecode 77/3"),
                        _ => {
                            debug_assert!(ext_b < 0, "unused bytecode 77/{}", ext_b);
                            self.push_enclosing_object((-ext_b) as usize);
                        }
                    }
                    ext_b = 0;
                }
                78 => self.push(Obj::smi(0)),
                79 => self.push(Obj::smi(1)),

                #[cfg(feature = "static-prediction")]
                80 => {
                    // +
                    let left = self.stack(1);
                    let right = self.stack(0);
                    if left.is_smi() && right.is_smi() {
                        let raw_result = left.smi_value() + right.smi_value();
                        if Obj::is_smi_value(raw_result) {
                            self.pop_n_and_push(2, Obj::smi(raw_result));
                            continue;
                        }
                    }
                    self.common_send(byte1 as usize - 80)?;
                }
                #[cfg(feature = "static-prediction")]
                81 => {
                    // -
                    let left = self.stack(1);
                    let right = self.stack(0);
                    if left.is_smi() && right.is_smi() {
                        let raw_result = left.smi_value() - right.smi_value();
                        if Obj::is_smi_value(raw_result) {
                            self.pop_n_and_push(2, Obj::smi(raw_result));
                            continue;
                        }
                    }
                    self.common_send(byte1 as usize - 80)?;
                }
                #[cfg(feature = "static-prediction")]
                82 => {
                    // <
                    let left = self.stack(1);
                    let right = self.stack(0);
                    if left.is_smi() && right.is_smi() {
                        let result = if (left.raw() as isize) < (right.raw() as isize) {
                            self.true_obj()
                        } else {
                            self.false_obj()
                        };
                        self.pop_n_and_push(2, result);
                        continue;
                    }
                    self.common_send(byte1 as usize - 80)?;
                }
                #[cfg(feature = "static-prediction")]
                83 => {
                    // >
                    let left = self.stack(1);
                    let right = self.stack(0);
                    if left.is_smi() && right.is_smi() {
                        let result = if (left.raw() as isize) > (right.raw() as isize) {
                            self.true_obj()
                        } else {
                            self.false_obj()
                        };
                        self.pop_n_and_push(2, result);
                        continue;
                    }
                    self.common_send(byte1 as usize - 80)?;
                }
                #[cfg(feature = "static-prediction")]
                84 => {
                    // <=
                    let left = self.stack(1);
                    let right = self.stack(0);
                    if left.is_smi() && right.is_smi() {
                        let result = if (left.raw() as isize) <= (right.raw() as isize) {
                            self.true_obj()
                        } else {
                            self.false_obj()
                        };
                        self.pop_n_and_push(2, result);
                        continue;
                    }
                    self.common_send(byte1 as usize - 80)?;
                }
                #[cfg(feature = "static-prediction")]
                85 => {
                    // >=
                    let left = self.stack(1);
                    let right = self.stack(0);
                    if left.is_smi() && right.is_smi() {
                        let result = if (left.raw() as isize) >= (right.raw() as isize) {
                            self.true_obj()
                        } else {
                            self.false_obj()
                        };
                        self.pop_n_and_push(2, result);
                        continue;
                    }
                    self.common_send(byte1 as usize - 80)?;
                }
                #[cfg(feature = "static-prediction")]
                86 => {
                    // =
                    let left = self.stack(1);
                    let right = self.stack(0);
                    if left.is_smi() && right.is_smi() {
                        let result = if left == right {
                            self.true_obj()
                        } else {
                            self.false_obj()
                        };
                        self.pop_n_and_push(2, result);
                        continue;
                    }
                    self.common_send(byte1 as usize - 80)?;
                }
                #[cfg(feature = "static-prediction")]
                90 => {
                    // \\
                    let left = self.stack(1);
                    let right = self.stack(0);
                    if left.is_smi() && right.is_smi() && right.smi_value() != 0 {
                        let raw_result = floor_mod(left.smi_value(), right.smi_value());
                        debug_assert!(Obj::is_smi_value(raw_result));
                        self.pop_n_and_push(2, Obj::smi(raw_result));
                        continue;
                    }
                    self.common_send(byte1 as usize - 80)?;
                }
                #[cfg(feature = "static-prediction")]
                94 => {
                    // bitAnd:
                    let left = self.stack(1);
                    let right = self.stack(0);
                    if left.is_smi() && right.is_smi() {
                        let raw_result = left.smi_value() & right.smi_value();
                        self.pop_n_and_push(2, Obj::smi(raw_result));
                        continue;
                    }
                    self.common_send(byte1 as usize - 80)?;
                }
                #[cfg(feature = "static-prediction")]
                95 => {
                    // bitOr:
                    let left = self.stack(1);
                    let right = self.stack(0);
                    if left.is_smi() && right.is_smi() {
                        let raw_result = left.smi_value() | right.smi_value();
                        self.pop_n_and_push(2, Obj::smi(raw_result));
                        continue;
                    }
                    self.common_send(byte1 as usize - 80)?;
                }
                #[cfg(feature = "static-prediction")]
                96 => {
                    // at:
                    let array = self.stack(1);
                    let index = self.stack(0);
                    if index.is_smi() {
                        let raw_index = index.smi_value() - 1;
                        if array.is_array() {
                            let view = Array::cast(array);
                            if raw_index >= 0 && (raw_index as usize) < view.len() {
                                let value = view.element(raw_index as usize);
                                self.pop_n_and_push(2, value);
                                continue;
                            }
                        } else if array.is_bytes() {
                            let view = Bytes::cast(array);
                            if raw_index >= 0 && (raw_index as usize) < view.len() {
                                let value = view.element(raw_index as usize);
                                self.pop_n_and_push(2, Obj::smi(value as isize));
                                continue;
                            }
                        }
                    }
                    self.common_send(byte1 as usize - 80)?;
                }
                #[cfg(feature = "static-prediction")]
                97 => {
                    // at:put:
                    let array = self.stack(2);
                    let index = self.stack(1);
                    if index.is_smi() {
                        let raw_index = index.smi_value() - 1;
                        if array.is_array() {
                            let view = Array::cast(array);
                            if raw_index >= 0 && (raw_index as usize) < view.len() {
                                let value = self.stack(0);
                                view.set_element(self.heap(), raw_index as usize, value);
                                self.pop_n_and_push(3, value);
                                continue;
                            }
                        } else if array.is_byte_array() {
                            let view = Bytes::cast(array);
                            let value = self.stack(0);
                            if value.is_smi()
                                && raw_index >= 0
                                && (raw_index as usize) < view.len()
                                && value.raw() <= (255 << 1)
                            {
                                view.set_element(raw_index as usize, value.smi_value() as u8);
                                self.pop_n_and_push(3, value);
                                continue;
                            }
                        }
                    }
                    self.common_send(byte1 as usize - 80)?;
                }
                #[cfg(feature = "static-prediction")]
                98 => {
                    // size
                    let array = self.stack(0);
                    if array.is_array() {
                        self.pop_n_and_push(1, Array::cast(array).size());
                        continue;
                    } else if array.is_bytes() {
                        self.pop_n_and_push(1, Bytes::cast(array).size());
                        continue;
                    }
                    self.common_send(byte1 as usize - 80)?;
                }
                #[cfg(feature = "static-prediction")]
                87..=89 | 91..=93 | 99..=111 => {
                    // ~= * / @ bitShift: // and the rest of the quick sends.
                    self.common_send(byte1 as usize - 80)?;
                }

                #[cfg(not(feature = "static-prediction"))]
                80..=111 => self.common_send(byte1 as usize - 80)?,

                112..=127 => self.ordinary_send(byte1 as usize & 15, 0)?,
                128..=143 => self.ordinary_send(byte1 as usize & 15, 1)?,
                144..=159 => self.ordinary_send(byte1 as usize & 15, 2)?,
                160..=175 => self.implicit_receiver_send(byte1 as usize & 15, 0)?,
                176..=183 => panic!("unused bytecode {}", byte1),
                184..=191 => self.pop_into_temporary(byte1 as usize & 7),
                192..=215 => panic!("unused bytecode {}", byte1),
                216 => {
                    let receiver = self.frame_receiver(self.fp);
                    self.method_return(receiver)?;
                }
                217 => {
                    let result = self.pop();
                    self.method_return(result)?;
                }
                218 => {
                    debug_assert!(super::frame::flags_is_closure(
                        self.frame_flags(self.fp)
                    ));
                    let result = self.pop();
                    self.local_return(result)?;
                }
                219 => {
                    let top = self.stack(0);
                    self.push(top);
                }
                220 => self.drop_n(1),
                221..=223 => panic!("unused bytecode {}", byte1),
                224 => {
                    let byte2 = self.fetch();
                    ext_a = (ext_a << 8) + byte2 as isize;
                }
                225 => {
                    let byte2 = self.fetch();
                    if ext_b == 0 && byte2 > 127 {
                        ext_b = byte2 as isize - 256;
                    } else {
                        ext_b = (ext_b << 8) + byte2 as isize;
                    }
                }
                226 => panic!("unused bytecode 226"),
                227 => {
                    let byte2 = self.fetch();
                    self.push_literal_variable(((ext_a << 8) + byte2 as isize) as usize);
                    ext_a = 0;
                }
                228 => {
                    let byte2 = self.fetch();
                    self.push_literal(byte2 as usize + (ext_a as usize) * 256);
                    ext_a = 0;
                }
                229 => {
                    let byte2 = self.fetch();
                    self.push(Obj::smi((ext_b << 8) + byte2 as isize));
                    ext_b = 0;
                }
                230 => {
                    let byte2 = self.fetch();
                    self.push_temporary(byte2 as usize);
                }
                231 => {
                    let byte2 = self.fetch();
                    if byte2 < 128 {
                        self.push_new_array(byte2 as usize);
                    } else {
                        self.push_new_array_with_elements(byte2 as usize - 128);
                    }
                }
                232 | 233 => panic!("unused bytecode {}", byte1),
                234 => {
                    let byte2 = self.fetch();
                    self.store_into_temporary(byte2 as usize);
                }
                235 | 236 => panic!("unused bytecode {}", byte1),
                237 => {
                    let byte2 = self.fetch();
                    self.pop_into_temporary(byte2 as usize);
                }
                238 => {
                    let byte2 = self.fetch();
                    let selector_index = ((ext_a << 5) + (byte2 >> 3) as isize) as usize;
                    let num_args = ((ext_b << 3) | (byte2 & 7) as isize) as usize;
                    ext_a = 0;
                    ext_b = 0;
                    self.ordinary_send(selector_index, num_args)?;
                }
                239 => panic!("unused bytecode 239"),
                240 => {
                    let byte2 = self.fetch();
                    let selector_index = ((ext_a << 5) + (byte2 >> 3) as isize) as usize;
                    let num_args = ((ext_b << 3) | (byte2 & 7) as isize) as usize;
                    ext_a = 0;
                    ext_b = 0;
                    self.implicit_receiver_send(selector_index, num_args)?;
                }
                241 => {
                    let byte2 = self.fetch();
                    let selector_index = ((ext_a << 5) + (byte2 >> 3) as isize) as usize;
                    let num_args = ((ext_b << 3) | (byte2 & 7) as isize) as usize;
                    ext_a = 0;
                    ext_b = 0;
                    self.super_send(selector_index, num_args)?;
                }
                242 => {
                    let byte2 = self.fetch();
                    let delta = (ext_b << 8) + byte2 as isize;
                    ext_b = 0;
                    self.ip = unsafe { self.ip.offset(delta) };
                }
                243 => {
                    let byte2 = self.fetch();
                    let delta = (ext_b << 8) + byte2 as isize;
                    ext_b = 0;
                    let top = self.pop();
                    if top == self.false_obj() {
                    } else if top == self.true_obj() {
                        self.ip = unsafe { self.ip.offset(delta) };
                    } else {
                        self.send_non_boolean_receiver(top)?;
                    }
                }
                244 => {
                    let byte2 = self.fetch();
                    let delta = (ext_b << 8) + byte2 as isize;
                    ext_b = 0;
                    let top = self.pop();
                    if top == self.true_obj() {
                    } else if top == self.false_obj() {
                        self.ip = unsafe { self.ip.offset(delta) };
                    } else {
                        self.send_non_boolean_receiver(top)?;
                    }
                }
                245 => {
                    let byte2 = self.fetch();
                    let selector_index = ((ext_a << 5) + (byte2 >> 3) as isize) as usize;
                    let num_args = ((ext_b << 3) | (byte2 & 7) as isize) as usize;
                    ext_a = 0;
                    ext_b = 0;
                    self.self_send(selector_index, num_args)?;
                }
                246..=249 => panic!("unused bytecode {}", byte1),
                250 => {
                    let byte2 = self.fetch();
                    let byte3 = self.fetch();
                    self.push_remote_temp(byte3 as usize, byte2 as usize);
                }
                251 => {
                    let byte2 = self.fetch();
                    let byte3 = self.fetch();
                    self.store_into_remote_temp(byte3 as usize, byte2 as usize);
                }
                252 => {
                    let byte2 = self.fetch();
                    let byte3 = self.fetch();
                    self.pop_into_remote_temp(byte3 as usize, byte2 as usize);
                }
                253 => {
                    let byte2 = self.fetch();
                    let byte3 = self.fetch();
                    let num_copied = ((byte2 >> 3) & 7) as usize + ((ext_a as usize / 16) << 3);
                    let num_args = (byte2 & 7) as usize + ((ext_a as usize % 16) << 3);
                    let block_size = byte3 as usize + ((ext_b as usize) << 8);
                    ext_a = 0;
                    ext_b = 0;
                    self.push_closure(num_copied, num_args, block_size);
                }
                254 => {
                    let byte2 = self.fetch();
                    let byte3 = self.fetch();
                    let selector_index = ((ext_a << 5) + (byte2 >> 3) as isize) as usize;
                    let num_args = ((ext_b << 3) | (byte2 & 7) as isize) as usize;
                    let depth = byte3 as usize;
                    ext_a = 0;
                    ext_b = 0;
                    self.outer_send(selector_index, num_args, depth)?;
                }
                255 => panic!("unused bytecode 255"),
            }
        }
    }
}

/// Modulo with the sign of the divisor.
#[cfg(feature = "static-prediction")]
fn floor_mod(a: isize, b: isize) -> isize {
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) {
        r + b
    } else {
        r
    }
}
