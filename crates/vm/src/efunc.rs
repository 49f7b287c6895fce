//! EFuncs: dynamically dispatched host callbacks
//!
//! An EFunc is registered by symbol and invoked from scripts through
//! `vm.ecall(@name, arg)`. The callback never touches `Value` directly;
//! it speaks a typed stack-slot protocol over a window of the current
//! task's stack, so host code stays GC-safe by construction (everything it
//! pushes sits below `stack_top` and is traced).

use tern_core::{ObjHeader, Value};

use crate::object::{value_as, Array, Instance, SymbolKey, TernString};
use crate::task::Task;
use crate::vm::VM;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EFuncStatus {
    Ok,
    TypeError,
    Underflow,
    OutOfBounds,
}

pub(crate) struct EFunc {
    pub callback: Box<dyn FnMut(&mut EFuncContext) -> bool>,
}

impl EFunc {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnMut(&mut EFuncContext) -> bool + 'static,
    {
        EFunc {
            callback: Box::new(callback),
        }
    }
}

/// Slot window handed to an EFunc callback. On entry the script argument
/// is the single value on the window; whatever is on top when the callback
/// returns becomes the `ecall` result (null for an empty window).
pub struct EFuncContext<'vm> {
    vm: &'vm mut VM,
    task: *mut Task,
    base: *mut Value,
}

impl<'vm> EFuncContext<'vm> {
    pub(crate) fn new(vm: &'vm mut VM, task: *mut Task, base: *mut Value) -> Self {
        EFuncContext { vm, task, base }
    }

    fn push(&mut self, v: Value) {
        unsafe {
            let top = (*self.task).stack_top;
            debug_assert!(top < (*self.task).stack_end(), "efunc stack exhausted");
            *top = v;
            (*self.task).stack_top = top.add(1);
        }
    }

    fn top(&self) -> Option<Value> {
        unsafe {
            let top = (*self.task).stack_top;
            if top <= self.base {
                None
            } else {
                Some(*top.sub(1))
            }
        }
    }

    /// Pop the top slot. False on underflow.
    pub fn pop(&mut self) -> bool {
        unsafe {
            if (*self.task).stack_top <= self.base {
                return false;
            }
            (*self.task).stack_top = (*self.task).stack_top.sub(1);
            true
        }
    }

    fn pop_value(&mut self) -> Option<Value> {
        let v = self.top()?;
        self.pop();
        Some(v)
    }

    // =========================================================================
    // Pushes
    // =========================================================================

    pub fn push_int(&mut self, i: i32) {
        self.push(Value::from_int(i));
    }

    pub fn push_float(&mut self, f: f64) {
        self.push(Value::from_float(f));
    }

    pub fn push_bool(&mut self, b: bool) {
        self.push(Value::from_bool(b));
    }

    pub fn push_null(&mut self) {
        self.push(Value::null());
    }

    pub fn push_string(&mut self, s: &str) {
        let string = self.vm.allocate_string(s);
        self.push(Value::from_object(string as *mut ObjHeader));
    }

    pub fn push_symbol(&mut self, s: &str) {
        let sym = self.vm.intern(s);
        self.push(Value::from_object(sym as *mut ObjHeader));
    }

    pub fn push_empty_array(&mut self) {
        let array = self.vm.allocate_array(0, Value::null());
        self.push(Value::from_object(array as *mut ObjHeader));
    }

    /// Pop a value and append it to the array now on top.
    pub fn push_to_array(&mut self) -> EFuncStatus {
        let Some(value) = self.pop_value() else {
            return EFuncStatus::Underflow;
        };
        match self.top() {
            Some(top) => match unsafe { value_as::<Array>(top) } {
                Some(array) => {
                    unsafe { (*array).inner.push(value) };
                    EFuncStatus::Ok
                }
                None => {
                    self.push(value);
                    EFuncStatus::TypeError
                }
            },
            None => EFuncStatus::Underflow,
        }
    }

    pub fn push_empty_object(&mut self) {
        let class = self.vm.builtin_classes.object;
        let instance = self.vm.allocate_instance(class);
        self.push(Value::from_object(instance as *mut ObjHeader));
    }

    /// Pop a value and store it as property `name` of the instance on top.
    pub fn set_object_property(&mut self, name: &str) -> EFuncStatus {
        let Some(value) = self.pop_value() else {
            return EFuncStatus::Underflow;
        };
        match self.top() {
            Some(top) => match unsafe { value_as::<Instance>(top) } {
                Some(instance) => {
                    let sym = self.vm.intern(name);
                    unsafe { (*instance).properties.insert(SymbolKey(sym), value) };
                    EFuncStatus::Ok
                }
                None => {
                    self.push(value);
                    EFuncStatus::TypeError
                }
            },
            None => EFuncStatus::Underflow,
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn as_int(&self, out: &mut i32) -> EFuncStatus {
        match self.top() {
            Some(v) if v.is_int() => {
                *out = v.as_int();
                EFuncStatus::Ok
            }
            Some(_) => EFuncStatus::TypeError,
            None => EFuncStatus::Underflow,
        }
    }

    pub fn as_float(&self, out: &mut f64) -> EFuncStatus {
        match self.top() {
            Some(v) if v.is_float() => {
                *out = v.as_float();
                EFuncStatus::Ok
            }
            Some(_) => EFuncStatus::TypeError,
            None => EFuncStatus::Underflow,
        }
    }

    pub fn as_bool(&self, out: &mut bool) -> EFuncStatus {
        match self.top() {
            Some(v) if v.is_bool() => {
                *out = v.as_bool();
                EFuncStatus::Ok
            }
            Some(_) => EFuncStatus::TypeError,
            None => EFuncStatus::Underflow,
        }
    }

    pub fn as_string(&self, out: &mut String) -> EFuncStatus {
        match self.top() {
            Some(v) => match unsafe { value_as::<TernString>(v) } {
                Some(s) => {
                    out.clear();
                    out.push_str(unsafe { &(*s).contents });
                    EFuncStatus::Ok
                }
                None => EFuncStatus::TypeError,
            },
            None => EFuncStatus::Underflow,
        }
    }

    pub fn as_symbol(&self, out: &mut String) -> EFuncStatus {
        match self.top() {
            Some(v) => match unsafe { value_as::<crate::object::Symbol>(v) } {
                Some(s) => {
                    out.clear();
                    out.push_str(unsafe { &(*s).contents });
                    EFuncStatus::Ok
                }
                None => EFuncStatus::TypeError,
            },
            None => EFuncStatus::Underflow,
        }
    }

    pub fn is_null(&self) -> EFuncStatus {
        match self.top() {
            Some(v) if v.is_null() => EFuncStatus::Ok,
            Some(_) => EFuncStatus::TypeError,
            None => EFuncStatus::Underflow,
        }
    }

    pub fn is_object(&self) -> EFuncStatus {
        match self.top() {
            Some(v) if unsafe { value_as::<Instance>(v) }.is_some() => EFuncStatus::Ok,
            Some(_) => EFuncStatus::TypeError,
            None => EFuncStatus::Underflow,
        }
    }

    pub fn get_array_length(&self, out: &mut usize) -> EFuncStatus {
        match self.top() {
            Some(v) => match unsafe { value_as::<Array>(v) } {
                Some(array) => {
                    *out = unsafe { (*array).inner.len() };
                    EFuncStatus::Ok
                }
                None => EFuncStatus::TypeError,
            },
            None => EFuncStatus::Underflow,
        }
    }

    /// Push element `pos` of the array on top.
    pub fn get_array_element(&mut self, pos: usize) -> EFuncStatus {
        match self.top() {
            Some(v) => match unsafe { value_as::<Array>(v) } {
                Some(array) => {
                    let element = match unsafe { (*array).inner.get(pos) } {
                        Some(&e) => e,
                        None => return EFuncStatus::OutOfBounds,
                    };
                    self.push(element);
                    EFuncStatus::Ok
                }
                None => EFuncStatus::TypeError,
            },
            None => EFuncStatus::Underflow,
        }
    }

    /// Push property `name` of the instance on top.
    pub fn get_object_property(&mut self, name: &str) -> EFuncStatus {
        match self.top() {
            Some(v) => match unsafe { value_as::<Instance>(v) } {
                Some(instance) => {
                    let sym = self.vm.intern(name);
                    match unsafe { (*instance).properties.get(&SymbolKey(sym)) } {
                        Some(&value) => {
                            self.push(value);
                            EFuncStatus::Ok
                        }
                        None => EFuncStatus::OutOfBounds,
                    }
                }
                None => EFuncStatus::TypeError,
            },
            None => EFuncStatus::Underflow,
        }
    }
}

/// `vm.ecall(@name, arg)`: run the EFunc registered under `name` with a
/// fresh slot window holding `arg`. Whatever the callback leaves on top is
/// the result; a `false` return throws it instead.
pub(crate) fn ecall(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let name = *slots;
        let Some(sym) = value_as::<crate::object::Symbol>(name) else {
            let error = vm.create_error(
                vm.builtin_classes.type_error,
                &format!(
                    "The first argument must be a Symbol, not {}",
                    crate::object::type_string(name)
                ),
            );
            vm.return_value = error;
            return false;
        };
        // Take the efunc out so the callback can borrow the VM; reentrant
        // ecalls of the *same* efunc are not supported.
        let Some(mut efunc) = vm.efuncs.remove(&SymbolKey(sym)) else {
            let error = vm.create_error(
                vm.builtin_classes.error,
                &format!("Cannot find EFunc {}", &(*sym).contents),
            );
            vm.return_value = error;
            return false;
        };
        let task = vm.current_task;
        let base = slots.add(1);
        let old_stack_top = (*task).stack_top;
        (*task).stack_top = slots.add(2);

        let result = {
            let mut ctx = EFuncContext::new(vm, task, base);
            (efunc.callback)(&mut ctx)
        };

        vm.return_value = if (*task).stack_top <= base {
            Value::null()
        } else {
            *(*task).stack_top.sub(1)
        };
        (*task).stack_top = old_stack_top;
        vm.efuncs.insert(SymbolKey(sym), efunc);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{new_vm, VM};

    /// Build a context over the root task's stack with `arg` as the single
    /// slot, the way `ecall` does.
    fn with_context<R>(vm: &mut VM, arg: Value, body: impl FnOnce(&mut EFuncContext) -> R) -> R {
        unsafe {
            let task = vm.current_task;
            let base = (*task).stack_base();
            *base = arg;
            (*task).stack_top = base.add(1);
            let mut ctx = EFuncContext::new(vm, task, base);
            let result = body(&mut ctx);
            (*task).stack_top = (*task).stack_base();
            result
        }
    }

    #[test]
    fn test_typed_pushes_and_reads() {
        let mut vm = new_vm();
        with_context(&mut vm, Value::from_int(41), |ctx| {
            let mut arg = 0;
            assert_eq!(ctx.as_int(&mut arg), EFuncStatus::Ok);
            assert_eq!(arg, 41);
            assert!(ctx.pop());
            ctx.push_empty_array();
            ctx.push_int(arg + 1);
            assert_eq!(ctx.push_to_array(), EFuncStatus::Ok);
            ctx.push_string("two");
            assert_eq!(ctx.push_to_array(), EFuncStatus::Ok);
            let mut len = 0;
            assert_eq!(ctx.get_array_length(&mut len), EFuncStatus::Ok);
            assert_eq!(len, 2);
            assert_eq!(ctx.get_array_element(1), EFuncStatus::Ok);
            let mut s = String::new();
            assert_eq!(ctx.as_string(&mut s), EFuncStatus::Ok);
            assert_eq!(s, "two");
            assert_eq!(ctx.get_array_element(5), EFuncStatus::TypeError);
        });
    }

    #[test]
    fn test_object_protocol() {
        let mut vm = new_vm();
        with_context(&mut vm, Value::null(), |ctx| {
            assert_eq!(ctx.is_null(), EFuncStatus::Ok);
            assert!(ctx.pop());
            ctx.push_empty_object();
            ctx.push_int(7);
            assert_eq!(ctx.set_object_property("x"), EFuncStatus::Ok);
            assert_eq!(ctx.is_object(), EFuncStatus::Ok);
            assert_eq!(ctx.get_object_property("x"), EFuncStatus::Ok);
            let mut x = 0;
            assert_eq!(ctx.as_int(&mut x), EFuncStatus::Ok);
            assert_eq!(x, 7);
            assert!(ctx.pop());
            assert_eq!(ctx.get_object_property("missing"), EFuncStatus::OutOfBounds);
        });
    }

    #[test]
    fn test_underflow_and_type_errors() {
        let mut vm = new_vm();
        with_context(&mut vm, Value::from_int(1), |ctx| {
            let mut f = 0.0;
            assert_eq!(ctx.as_float(&mut f), EFuncStatus::TypeError);
            assert!(ctx.pop());
            assert!(!ctx.pop());
            let mut i = 0;
            assert_eq!(ctx.as_int(&mut i), EFuncStatus::Underflow);
            assert_eq!(ctx.push_to_array(), EFuncStatus::Underflow);
        });
    }

    #[test]
    fn test_register_and_deregister() {
        let mut vm = new_vm();
        vm.register_efunc("probe", |_ctx| true);
        assert!(vm.deregister_efunc("probe"));
        assert!(!vm.deregister_efunc("probe"));
    }
}
