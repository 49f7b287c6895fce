//! Native builtins
//!
//! Methods on the built-in classes plus the `vm`, `math` and `random`
//! modules and the prelude helper functions the compiler relies on.
//!
//! Every native has the signature `(vm, slots) -> bool`: true means the
//! result is in `vm.return_value`, false means `vm.return_value` holds an
//! error to throw. For methods, `slots[0]` is the receiver and declared
//! arities count only the arguments after it. Dispatch has already checked
//! the receiver's class, so receiver downcasts are unchecked.

use rand::seq::SliceRandom;
use rand::Rng;

use tern_core::{ObjHeader, Value};

use crate::emitter::disassemble;
use crate::function::{Function, NativeFunction};
use crate::object::{
    obj_as, string_find, string_replace, type_string, value_as, Array, ArrayIterator, Class, Map,
    MapIterator, Range, StringIterator, SymbolKey, TernString,
};
use crate::vm::VM;

macro_rules! throw {
    ($vm:expr, $class:ident, $($fmt:tt)*) => {{
        let message = format!($($fmt)*);
        let class = $vm.builtin_classes.$class;
        $vm.return_value = $vm.create_error(class, &message);
        return false;
    }};
}

// =============================================================================
// Object and Class
// =============================================================================

fn object_tostring(vm: &mut VM, slots: *mut Value) -> bool {
    let string = vm.to_string(unsafe { *slots });
    vm.return_value = Value::from_object(string as *mut ObjHeader);
    true
}

fn object_getclass(vm: &mut VM, slots: *mut Value) -> bool {
    let class = vm.get_class(unsafe { *slots });
    vm.return_value = Value::from_object(class as *mut ObjHeader);
    true
}

/// Inherited by every class without its own constructor: builds an empty
/// instance of the receiving class.
fn object_construct(vm: &mut VM, slots: *mut Value) -> bool {
    let receiver = unsafe { *slots };
    let class = match unsafe { value_as::<Class>(receiver) } {
        Some(class) => class,
        None => vm.builtin_classes.object,
    };
    let instance = vm.allocate_instance(class);
    vm.return_value = Value::from_object(instance as *mut ObjHeader);
    true
}

fn class_name(vm: &mut VM, slots: *mut Value) -> bool {
    let name = unsafe {
        let class = obj_as::<Class>((*slots).as_object());
        (*class).name.clone()
    };
    let string = vm.allocate_string(&name);
    vm.return_value = Value::from_object(string as *mut ObjHeader);
    true
}

fn class_getsuper(vm: &mut VM, slots: *mut Value) -> bool {
    let super_class = unsafe { (*obj_as::<Class>((*slots).as_object())).super_class };
    vm.return_value = if super_class.is_null() {
        Value::null()
    } else {
        Value::from_object(super_class as *mut ObjHeader)
    };
    true
}

// =============================================================================
// Array
// =============================================================================

fn array_push(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let array = obj_as::<Array>((*slots).as_object());
        (*array).inner.push(*slots.add(1));
    }
    vm.return_value = Value::null();
    true
}

fn array_pop(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let array = obj_as::<Array>((*slots).as_object());
        match (*array).inner.pop() {
            Some(value) => {
                vm.return_value = value;
                true
            }
            None => throw!(vm, index_error, "Cannot pop from empty array"),
        }
    }
}

fn array_len(vm: &mut VM, slots: *mut Value) -> bool {
    let len = unsafe { (*obj_as::<Array>((*slots).as_object())).inner.len() };
    vm.return_value = Value::from_int(len as i32);
    true
}

fn array_insert(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let array = obj_as::<Array>((*slots).as_object());
        let index = *slots.add(1);
        if !index.is_int() {
            throw!(
                vm,
                type_error,
                "Expected Int for array index got {}",
                type_string(index)
            );
        }
        let index = index.as_int();
        if index < 0 || index as usize > (*array).inner.len() {
            throw!(vm, index_error, "Array index out of range");
        }
        (*array).inner.insert(index as usize, *slots.add(2));
    }
    vm.return_value = Value::null();
    true
}

fn array_remove(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let array = obj_as::<Array>((*slots).as_object());
        let index = *slots.add(1);
        if !index.is_int() {
            throw!(
                vm,
                type_error,
                "Expected Int for array index got {}",
                type_string(index)
            );
        }
        let index = index.as_int();
        if index < 0 || index as usize >= (*array).inner.len() {
            throw!(vm, index_error, "Array index out of range");
        }
        (*array).inner.remove(index as usize);
    }
    vm.return_value = Value::null();
    true
}

fn array_clear(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe { (*obj_as::<Array>((*slots).as_object())).inner.clear() };
    vm.return_value = Value::null();
    true
}

fn array_iter(vm: &mut VM, slots: *mut Value) -> bool {
    let iter = unsafe { vm.allocate_array_iterator(obj_as::<Array>((*slots).as_object())) };
    vm.return_value = Value::from_object(iter as *mut ObjHeader);
    true
}

fn array_construct(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let len = *slots.add(1);
        if !len.is_int() {
            throw!(
                vm,
                type_error,
                "The first argument must be a Int, not {}",
                type_string(len)
            );
        }
        if len.as_int() < 0 {
            throw!(vm, error, "The array size must be non negative");
        }
        let array = vm.allocate_array(len.as_int() as usize, *slots.add(2));
        vm.return_value = Value::from_object(array as *mut ObjHeader);
    }
    true
}

// =============================================================================
// Map
// =============================================================================

fn map_construct(vm: &mut VM, _slots: *mut Value) -> bool {
    let map = vm.allocate_map();
    vm.return_value = Value::from_object(map as *mut ObjHeader);
    true
}

fn map_clear(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe { (*obj_as::<Map>((*slots).as_object())).inner.clear() };
    vm.return_value = Value::null();
    true
}

fn map_len(vm: &mut VM, slots: *mut Value) -> bool {
    let len = unsafe { (*obj_as::<Map>((*slots).as_object())).inner.len() };
    vm.return_value = Value::from_int(len as i32);
    true
}

fn map_contains(vm: &mut VM, slots: *mut Value) -> bool {
    let contains = unsafe {
        let map = obj_as::<Map>((*slots).as_object());
        (*map)
            .inner
            .contains_key(&crate::object::HashKey(*slots.add(1)))
    };
    vm.return_value = Value::from_bool(contains);
    true
}

fn map_remove(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let map = obj_as::<Map>((*slots).as_object());
        let key = *slots.add(1);
        // shift_remove keeps insertion order for the survivors.
        if (*map)
            .inner
            .shift_remove(&crate::object::HashKey(key))
            .is_none()
        {
            throw!(
                vm,
                key_error,
                "Key {} does not exist in map.",
                vm.format_value(key)
            );
        }
    }
    vm.return_value = Value::null();
    true
}

fn map_keys(vm: &mut VM, slots: *mut Value) -> bool {
    let iter = unsafe { vm.allocate_map_iterator(obj_as::<Map>((*slots).as_object())) };
    vm.return_value = Value::from_object(iter as *mut ObjHeader);
    true
}

// =============================================================================
// String and Symbol
// =============================================================================

fn string_construct(vm: &mut VM, _slots: *mut Value) -> bool {
    let string = vm.allocate_string("");
    vm.return_value = Value::from_object(string as *mut ObjHeader);
    true
}

fn string_find_method(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let haystack = obj_as::<TernString>((*slots).as_object());
        let needle = match value_as::<TernString>(*slots.add(1)) {
            Some(s) => s,
            None => throw!(
                vm,
                type_error,
                "Expected String got {}",
                type_string(*slots.add(1))
            ),
        };
        let position = string_find(
            (*haystack).contents.as_bytes(),
            (*needle).contents.as_bytes(),
            0,
        );
        vm.return_value = if position == (*haystack).contents.len() {
            Value::from_int(-1)
        } else {
            Value::from_int(position as i32)
        };
    }
    true
}

fn string_replace_method(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let this = obj_as::<TernString>((*slots).as_object());
        let (from, to) = match (
            value_as::<TernString>(*slots.add(1)),
            value_as::<TernString>(*slots.add(2)),
        ) {
            (Some(from), Some(to)) => (from, to),
            _ => throw!(
                vm,
                type_error,
                "Expected String and String got {} and {}",
                type_string(*slots.add(1)),
                type_string(*slots.add(2))
            ),
        };
        if (*from).contents.is_empty() {
            vm.return_value = *slots;
            return true;
        }
        let replaced = string_replace(&(*this).contents, &(*from).contents, &(*to).contents);
        let result = vm.allocate_string(&replaced);
        vm.return_value = Value::from_object(result as *mut ObjHeader);
    }
    true
}

fn string_chars(vm: &mut VM, slots: *mut Value) -> bool {
    let iter = unsafe { vm.allocate_string_iterator(obj_as::<TernString>((*slots).as_object())) };
    vm.return_value = Value::from_object(iter as *mut ObjHeader);
    true
}

fn symbol_construct(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let arg = *slots.add(1);
        match value_as::<TernString>(arg) {
            Some(s) => {
                let contents = (*s).contents.to_string();
                let sym = vm.intern(&contents);
                vm.return_value = Value::from_object(sym as *mut ObjHeader);
                true
            }
            None => throw!(
                vm,
                type_error,
                "The first argument must be a String, not {}",
                type_string(arg)
            ),
        }
    }
}

// =============================================================================
// Range and iterators
// =============================================================================

fn range_construct(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let (start, end) = (*slots.add(1), *slots.add(2));
        if !start.is_int() || !end.is_int() {
            throw!(
                vm,
                type_error,
                "Expected Int and Int for the start and end of the range got {} and {} instead",
                type_string(start),
                type_string(end)
            );
        }
        let range = vm.allocate_range(start.as_int(), end.as_int());
        vm.return_value = Value::from_object(range as *mut ObjHeader);
    }
    true
}

fn range_start(vm: &mut VM, slots: *mut Value) -> bool {
    vm.return_value =
        Value::from_int(unsafe { (*obj_as::<Range>((*slots).as_object())).start });
    true
}

fn range_end(vm: &mut VM, slots: *mut Value) -> bool {
    vm.return_value = Value::from_int(unsafe { (*obj_as::<Range>((*slots).as_object())).end });
    true
}

fn range_hasnext(vm: &mut VM, slots: *mut Value) -> bool {
    let range = unsafe { obj_as::<Range>((*slots).as_object()) };
    vm.return_value = Value::from_bool(unsafe { (*range).start < (*range).end });
    true
}

/// Yields `start` and advances while `start != end`. The protocol calls
/// `hasNext` first; skipping it repeats the final value, matching the
/// cursor staying put at the end.
fn range_next(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let range = obj_as::<Range>((*slots).as_object());
        vm.return_value = Value::from_int((*range).start);
        if (*range).start != (*range).end {
            (*range).start += 1;
        }
    }
    true
}

fn arrayiterator_hasnext(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let iter = obj_as::<ArrayIterator>((*slots).as_object());
        vm.return_value =
            Value::from_bool((*iter).position < (*(*iter).array).inner.len());
    }
    true
}

fn arrayiterator_next(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let iter = obj_as::<ArrayIterator>((*slots).as_object());
        let inner = &(*(*iter).array).inner;
        if (*iter).position < inner.len() {
            vm.return_value = inner[(*iter).position];
            (*iter).position += 1;
        } else {
            vm.return_value = Value::null();
        }
    }
    true
}

fn mapiterator_hasnext(vm: &mut VM, slots: *mut Value) -> bool {
    let exhausted =
        unsafe { (*obj_as::<MapIterator>((*slots).as_object())).last_key.is_empty() };
    vm.return_value = Value::from_bool(!exhausted);
    true
}

fn mapiterator_next(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let iter = obj_as::<MapIterator>((*slots).as_object());
        if (*iter).last_key.is_empty() {
            vm.return_value = Value::null();
            return true;
        }
        vm.return_value = (*iter).last_key;
        // Relocate the key we just yielded and step to its successor.
        // Undefined if the map was mutated since the last call.
        let map = &(*(*iter).map).inner;
        (*iter).last_key = match map.get_index_of(&crate::object::HashKey((*iter).last_key)) {
            Some(index) => match map.get_index(index + 1) {
                Some((key, _)) => key.0,
                None => Value::empty(),
            },
            None => Value::empty(),
        };
    }
    true
}

fn stringiterator_hasnext(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let iter = obj_as::<StringIterator>((*slots).as_object());
        vm.return_value =
            Value::from_bool((*iter).position < (*(*iter).string).contents.len());
    }
    true
}

/// Yields one UTF-8 scalar as a new String per step.
fn stringiterator_next(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let iter = obj_as::<StringIterator>((*slots).as_object());
        let contents = &(*(*iter).string).contents;
        if (*iter).position >= contents.len() {
            vm.return_value = Value::null();
            return true;
        }
        let start = (*iter).position;
        let scalar = match contents[start..].chars().next() {
            Some(c) => c,
            None => {
                vm.return_value = Value::null();
                return true;
            }
        };
        (*iter).position = start + scalar.len_utf8();
        let piece = contents[start..start + scalar.len_utf8()].to_string();
        let string = vm.allocate_string(&piece);
        vm.return_value = Value::from_object(string as *mut ObjHeader);
    }
    true
}

// =============================================================================
// Numeric conversions
// =============================================================================

fn int_construct(vm: &mut VM, _slots: *mut Value) -> bool {
    vm.return_value = Value::from_int(0);
    true
}

fn float_construct(vm: &mut VM, _slots: *mut Value) -> bool {
    vm.return_value = Value::from_float(0.0);
    true
}

fn bool_construct(vm: &mut VM, _slots: *mut Value) -> bool {
    vm.return_value = Value::from_bool(false);
    true
}

fn null_construct(vm: &mut VM, _slots: *mut Value) -> bool {
    vm.return_value = Value::null();
    true
}

fn int_tofloat(vm: &mut VM, slots: *mut Value) -> bool {
    let i = unsafe { (*slots).as_int() };
    vm.return_value = Value::from_float(i as f64);
    true
}

fn float_toint(vm: &mut VM, slots: *mut Value) -> bool {
    let f = unsafe { (*slots).as_float() };
    if f.is_nan() || f > i32::MAX as f64 || f < i32::MIN as f64 {
        throw!(vm, overflow_error, "{f} does not fit in an Int");
    }
    vm.return_value = Value::from_int(f as i32);
    true
}

fn float_isnan(vm: &mut VM, slots: *mut Value) -> bool {
    vm.return_value = Value::from_bool(unsafe { (*slots).as_float() }.is_nan());
    true
}

// =============================================================================
// math module
// =============================================================================

macro_rules! math_fn {
    ($name:ident, $method:ident) => {
        fn $name(vm: &mut VM, slots: *mut Value) -> bool {
            let num = unsafe { *slots };
            if num.is_int() {
                vm.return_value = Value::from_float((num.as_int() as f64).$method());
            } else if num.is_float() {
                vm.return_value = Value::from_float(num.as_float().$method());
            } else {
                throw!(
                    vm,
                    type_error,
                    "The first argument must be a Int or Float, not {}",
                    unsafe { type_string(num) }
                );
            }
            true
        }
    };
}

math_fn!(math_acos, acos);
math_fn!(math_asin, asin);
math_fn!(math_atan, atan);
math_fn!(math_cbrt, cbrt);
math_fn!(math_ceil, ceil);
math_fn!(math_cos, cos);
math_fn!(math_floor, floor);
math_fn!(math_round, round);
math_fn!(math_sin, sin);
math_fn!(math_sqrt, sqrt);
math_fn!(math_tan, tan);
math_fn!(math_log, ln);
math_fn!(math_log2, log2);
math_fn!(math_exp, exp);

fn math_abs(vm: &mut VM, slots: *mut Value) -> bool {
    let num = unsafe { *slots };
    if num.is_int() {
        match num.as_int().checked_abs() {
            Some(result) => vm.return_value = Value::from_int(result),
            None => throw!(
                vm,
                overflow_error,
                "abs of {} does not fit in an Int",
                num.as_int()
            ),
        }
    } else if num.is_float() {
        vm.return_value = Value::from_float(num.as_float().abs());
    } else {
        throw!(
            vm,
            type_error,
            "The first argument must be a Int or Float, not {}",
            unsafe { type_string(num) }
        );
    }
    true
}

fn math_pow(vm: &mut VM, slots: *mut Value) -> bool {
    let (a, b) = unsafe { (*slots, *slots.add(1)) };
    let base = if a.is_int() {
        a.as_int() as f64
    } else if a.is_float() {
        a.as_float()
    } else {
        throw!(
            vm,
            type_error,
            "The two arguments must be a Int or Float, not {} and {}",
            unsafe { type_string(a) },
            unsafe { type_string(b) }
        );
    };
    let exponent = if b.is_int() {
        b.as_int() as f64
    } else if b.is_float() {
        b.as_float()
    } else {
        throw!(
            vm,
            type_error,
            "The two arguments must be a Int or Float, not {} and {}",
            unsafe { type_string(a) },
            unsafe { type_string(b) }
        );
    };
    vm.return_value = Value::from_float(base.powf(exponent));
    true
}

// =============================================================================
// random module
// =============================================================================

fn random_random(vm: &mut VM, _slots: *mut Value) -> bool {
    let value: f64 = vm.rng.gen();
    vm.return_value = Value::from_float(value);
    true
}

fn random_shuffle(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let arg = *slots;
        match value_as::<Array>(arg) {
            Some(array) => {
                (*array).inner.shuffle(&mut vm.rng);
                vm.return_value = Value::null();
                true
            }
            None => throw!(
                vm,
                type_error,
                "The first argument must be an Array, not {}",
                type_string(arg)
            ),
        }
    }
}

fn random_range(vm: &mut VM, slots: *mut Value) -> bool {
    let (lo, hi) = unsafe { (*slots, *slots.add(1)) };
    if !lo.is_int() || !hi.is_int() {
        throw!(
            vm,
            type_error,
            "Expected Int and Int for the start and end of the range got {} and {} instead",
            unsafe { type_string(lo) },
            unsafe { type_string(hi) }
        );
    }
    let (lo, hi) = (lo.as_int(), hi.as_int());
    if lo > hi {
        throw!(vm, error, "The start of the range must not exceed the end");
    }
    vm.return_value = Value::from_int(vm.rng.gen_range(lo..=hi));
    true
}

// =============================================================================
// vm module
// =============================================================================

fn vm_disassemble(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let fun = *slots;
        if let Some(function) = value_as::<Function>(fun) {
            let listing = disassemble(&*(*function).function_info);
            let string = vm.allocate_string(&listing);
            vm.return_value = Value::from_object(string as *mut ObjHeader);
            return true;
        }
        if let Some(native) = value_as::<NativeFunction>(fun) {
            throw!(
                vm,
                type_error,
                "Cannot disassemble native function {}",
                (*native).name
            );
        }
        throw!(
            vm,
            type_error,
            "The first argument must be a Function, not {}",
            type_string(fun)
        );
    }
}

fn vm_gc(vm: &mut VM, _slots: *mut Value) -> bool {
    vm.collect();
    vm.return_value = Value::null();
    true
}

fn vm_generate_stack_trace(vm: &mut VM, slots: *mut Value) -> bool {
    let skip = unsafe { *slots };
    if !skip.is_int() {
        throw!(
            vm,
            type_error,
            "The first argument must be a Int, not {}",
            unsafe { type_string(skip) }
        );
    }
    let trace = vm.generate_stack_trace(skip.as_int().max(0) as usize);
    let string = vm.allocate_string(&trace);
    vm.return_value = Value::from_object(string as *mut ObjHeader);
    true
}

// =============================================================================
// Prelude internals
// =============================================================================

fn get_module(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let name = *slots;
        match value_as::<TernString>(name) {
            Some(s) => {
                let contents = (*s).contents.to_string();
                vm.return_value = match vm.get_module(&contents) {
                    Some(module) => Value::from_object(module as *mut ObjHeader),
                    None => Value::null(),
                };
                true
            }
            None => throw!(
                vm,
                type_error,
                "The first argument must be a String, not {}",
                type_string(name)
            ),
        }
    }
}

fn get_caller_module(vm: &mut VM, _slots: *mut Value) -> bool {
    unsafe {
        let task = vm.current_task;
        if (*task).frames.len() < 2 {
            throw!(vm, error, "Function does not have a caller");
        }
        let frame = (*task).frames[(*task).frames.len() - 2];
        let module = (*(*frame.f).function_info).module.clone();
        let string = vm.allocate_string(&module);
        vm.return_value = Value::from_object(string as *mut ObjHeader);
    }
    true
}

fn extend_class(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let (sub, sup) = (*slots, *slots.add(1));
        match (value_as::<Class>(sub), value_as::<Class>(sup)) {
            (Some(sub), Some(sup)) => {
                if (*sup).is_native && sup != vm.builtin_classes.object {
                    throw!(vm, type_error, "Cannot inherit from native class");
                }
                (*sub).super_class = sup;
                vm.return_value = Value::null();
                true
            }
            _ => throw!(
                vm,
                type_error,
                "Expected Class and Class got {} and {} instead",
                type_string(sub),
                type_string(sup)
            ),
        }
    }
}

fn copy_methods(vm: &mut VM, slots: *mut Value) -> bool {
    unsafe {
        let (dst, src) = (*slots, *slots.add(1));
        match (value_as::<Class>(dst), value_as::<Class>(src)) {
            (Some(dst), Some(src)) => {
                if (*src).is_native {
                    throw!(vm, type_error, "Cannot copy methods from native class");
                }
                if dst != src {
                    (*dst).copy_methods(&*src);
                }
                vm.return_value = Value::null();
                true
            }
            _ => throw!(
                vm,
                type_error,
                "Expected Class and Class got {} and {} instead",
                type_string(dst),
                type_string(src)
            ),
        }
    }
}

// =============================================================================
// Registration
// =============================================================================

fn declare_class(vm: &mut VM, name: &str, super_class: *mut Class) -> *mut Class {
    let class = vm.allocate_class(name, super_class, true);
    let index = vm
        .add_module_variable("<prelude>", name, false, true)
        .unwrap_or_else(|| panic!("duplicate prelude class {name}"));
    vm.set_module_variable(index, Value::from_object(class as *mut ObjHeader));
    class
}

fn declare_error_class(vm: &mut VM, name: &str, super_class: *mut Class) -> *mut Class {
    // Error classes are script-subclassable, so they are not native.
    let class = vm.allocate_class(name, super_class, false);
    let index = vm
        .add_module_variable("<prelude>", name, false, true)
        .unwrap_or_else(|| panic!("duplicate prelude class {name}"));
    vm.set_module_variable(index, Value::from_object(class as *mut ObjHeader));
    class
}

fn declare_method(
    vm: &mut VM,
    class: *mut Class,
    name: &str,
    arity: u8,
    callback: crate::function::NativeFunctionCallback,
) {
    let sym = vm.intern(name);
    vm.temp_roots.push(Value::from_object(sym as *mut ObjHeader));
    let native = vm.allocate_native_function(name, "<prelude>", arity, callback);
    unsafe {
        (*class)
            .methods
            .insert(SymbolKey(sym), Value::from_object(native as *mut ObjHeader));
    }
    vm.temp_roots.pop();
}

fn declare_math_constant(vm: &mut VM, name: &str, value: f64) {
    let index = vm
        .add_module_variable("math", name, false, true)
        .unwrap_or_else(|| panic!("duplicate math constant {name}"));
    vm.set_module_variable(index, Value::from_float(value));
}

/// Install the prelude classes, the error hierarchy and the `vm`, `math`
/// and `random` modules into a fresh VM.
pub(crate) fn declare_native_builtins(vm: &mut VM) {
    let object = declare_class(vm, "Object", std::ptr::null_mut());
    vm.builtin_classes.object = object;
    vm.builtin_classes.class_ = declare_class(vm, "Class", object);
    vm.builtin_classes.int = declare_class(vm, "Int", object);
    vm.builtin_classes.float = declare_class(vm, "Float", object);
    vm.builtin_classes.bool_ = declare_class(vm, "Bool", object);
    vm.builtin_classes.null = declare_class(vm, "Null", object);
    vm.builtin_classes.string = declare_class(vm, "String", object);
    vm.builtin_classes.symbol = declare_class(vm, "Symbol", object);
    vm.builtin_classes.array = declare_class(vm, "Array", object);
    vm.builtin_classes.map = declare_class(vm, "Map", object);
    vm.builtin_classes.function = declare_class(vm, "Function", object);
    vm.builtin_classes.module = declare_class(vm, "Module", object);
    vm.builtin_classes.task = declare_class(vm, "Task", object);
    vm.builtin_classes.range = declare_class(vm, "Range", object);
    vm.builtin_classes.array_iterator = declare_class(vm, "ArrayIterator", object);
    vm.builtin_classes.map_iterator = declare_class(vm, "MapIterator", object);
    vm.builtin_classes.string_iterator = declare_class(vm, "StringIterator", object);

    let error = declare_error_class(vm, "Error", object);
    vm.builtin_classes.error = error;
    vm.builtin_classes.type_error = declare_error_class(vm, "TypeError", error);
    vm.builtin_classes.overflow_error = declare_error_class(vm, "OverflowError", error);
    vm.builtin_classes.index_error = declare_error_class(vm, "IndexError", error);
    vm.builtin_classes.key_error = declare_error_class(vm, "KeyError", error);
    vm.builtin_classes.name_error = declare_error_class(vm, "NameError", error);

    let b = &vm.builtin_classes;
    let (object, class_, int, float, bool_, null, string, symbol, array, map, range) = (
        b.object, b.class_, b.int, b.float, b.bool_, b.null, b.string, b.symbol, b.array, b.map,
        b.range,
    );
    let (array_iterator, map_iterator, string_iterator) =
        (b.array_iterator, b.map_iterator, b.string_iterator);

    declare_method(vm, object, "toString", 0, object_tostring);
    declare_method(vm, object, "getClass", 0, object_getclass);
    declare_method(vm, object, "construct", 0, object_construct);
    declare_method(vm, class_, "name", 0, class_name);
    declare_method(vm, class_, "getSuper", 0, class_getsuper);

    declare_method(vm, array, "push", 1, array_push);
    declare_method(vm, array, "pop", 0, array_pop);
    declare_method(vm, array, "len", 0, array_len);
    declare_method(vm, array, "insert", 2, array_insert);
    declare_method(vm, array, "remove", 1, array_remove);
    declare_method(vm, array, "clear", 0, array_clear);
    declare_method(vm, array, "iter", 0, array_iter);
    declare_method(vm, array, "construct", 2, array_construct);

    declare_method(vm, map, "construct", 0, map_construct);
    declare_method(vm, map, "clear", 0, map_clear);
    declare_method(vm, map, "len", 0, map_len);
    declare_method(vm, map, "contains", 1, map_contains);
    declare_method(vm, map, "remove", 1, map_remove);
    declare_method(vm, map, "keys", 0, map_keys);

    declare_method(vm, string, "construct", 0, string_construct);
    declare_method(vm, string, "find", 1, string_find_method);
    declare_method(vm, string, "replace", 2, string_replace_method);
    declare_method(vm, string, "chars", 0, string_chars);
    declare_method(vm, symbol, "construct", 1, symbol_construct);

    declare_method(vm, range, "construct", 2, range_construct);
    declare_method(vm, range, "start", 0, range_start);
    declare_method(vm, range, "end", 0, range_end);
    declare_method(vm, range, "hasNext", 0, range_hasnext);
    declare_method(vm, range, "next", 0, range_next);
    declare_method(vm, array_iterator, "hasNext", 0, arrayiterator_hasnext);
    declare_method(vm, array_iterator, "next", 0, arrayiterator_next);
    declare_method(vm, map_iterator, "hasNext", 0, mapiterator_hasnext);
    declare_method(vm, map_iterator, "next", 0, mapiterator_next);
    declare_method(vm, string_iterator, "hasNext", 0, stringiterator_hasnext);
    declare_method(vm, string_iterator, "next", 0, stringiterator_next);

    declare_method(vm, int, "construct", 0, int_construct);
    declare_method(vm, int, "toFloat", 0, int_tofloat);
    declare_method(vm, float, "construct", 0, float_construct);
    declare_method(vm, float, "toInt", 0, float_toint);
    declare_method(vm, float, "isNaN", 0, float_isnan);
    declare_method(vm, bool_, "construct", 0, bool_construct);
    declare_method(vm, null, "construct", 0, null_construct);

    vm.create_module("vm");
    vm.create_module("math");
    vm.create_module("random");

    vm.declare_native_function("vm", "disassemble", true, 1, vm_disassemble);
    vm.declare_native_function("vm", "gc", true, 0, vm_gc);
    vm.declare_native_function("vm", "ecall", true, 2, crate::efunc::ecall);
    vm.declare_native_function("vm", "generateStackTrace", true, 1, vm_generate_stack_trace);

    vm.declare_native_function("math", "acos", true, 1, math_acos);
    vm.declare_native_function("math", "asin", true, 1, math_asin);
    vm.declare_native_function("math", "atan", true, 1, math_atan);
    vm.declare_native_function("math", "cbrt", true, 1, math_cbrt);
    vm.declare_native_function("math", "ceil", true, 1, math_ceil);
    vm.declare_native_function("math", "cos", true, 1, math_cos);
    vm.declare_native_function("math", "floor", true, 1, math_floor);
    vm.declare_native_function("math", "round", true, 1, math_round);
    vm.declare_native_function("math", "sin", true, 1, math_sin);
    vm.declare_native_function("math", "sqrt", true, 1, math_sqrt);
    vm.declare_native_function("math", "tan", true, 1, math_tan);
    vm.declare_native_function("math", "log", true, 1, math_log);
    vm.declare_native_function("math", "log2", true, 1, math_log2);
    vm.declare_native_function("math", "exp", true, 1, math_exp);
    vm.declare_native_function("math", "abs", true, 1, math_abs);
    vm.declare_native_function("math", "pow", true, 2, math_pow);

    declare_math_constant(vm, "NaN", f64::NAN);
    declare_math_constant(vm, "Infinity", f64::INFINITY);
    declare_math_constant(vm, "E", std::f64::consts::E);
    declare_math_constant(vm, "LN2", std::f64::consts::LN_2);
    declare_math_constant(vm, "LOG2E", std::f64::consts::LOG2_E);
    declare_math_constant(vm, "SQRT1_2", std::f64::consts::FRAC_1_SQRT_2);
    declare_math_constant(vm, "LN10", std::f64::consts::LN_10);
    declare_math_constant(vm, "LOG10E", std::f64::consts::LOG10_E);
    declare_math_constant(vm, "PI", std::f64::consts::PI);
    declare_math_constant(vm, "SQRT2", std::f64::consts::SQRT_2);

    vm.declare_native_function("random", "random", true, 0, random_random);
    vm.declare_native_function("random", "shuffle", true, 1, random_shuffle);
    vm.declare_native_function("random", "range", true, 2, random_range);

    vm.declare_native_function("<prelude>", "_getModule", false, 1, get_module);
    vm.declare_native_function("<prelude>", "_getCallerModule", false, 0, get_caller_module);
    vm.declare_native_function("<prelude>", "_extendClass", false, 2, extend_class);
    vm.declare_native_function("<prelude>", "_copyMethods", false, 2, copy_methods);
}
