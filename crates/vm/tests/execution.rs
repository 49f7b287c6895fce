//! End-to-end programs driven through the emitter, the way the compiler
//! front-end produces them.
//!
//! Register conventions per test are ad-hoc, like compiler output: the
//! callee window for `Call*` starts at the named register, method calls
//! place the receiver first and count it in `argc`.

use tern_vm::object::value_as;
use tern_vm::op::Op;
use tern_vm::task::TaskStatus;
use tern_vm::vm::{new_vm, VMStatus, VM};
use tern_vm::{FunctionInfoWriter, Value};

fn setup() -> VM {
    // RUST_LOG=debug surfaces gc/task events when a test misbehaves.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let mut vm = new_vm();
    vm.create_module("<test>");
    vm
}

fn main_writer(vm: &mut VM) -> FunctionInfoWriter {
    vm.new_function_info("main", "<test>", 0)
}

/// `CallMethod name, receiver_reg, argc` (argc counts the receiver).
fn call_method(w: &mut FunctionInfoWriter, name: &str, reg: u8, argc: u8, line: u32) {
    let sym = w.symbol_constant(name).unwrap();
    w.write_op(Op::CallMethod, line);
    w.write_u8(sym as u8);
    w.write_u8(reg);
    w.write_u8(argc);
}

fn load_small_int(w: &mut FunctionInfoWriter, value: i8, line: u32) {
    w.write_op(Op::LoadSmallInt, line);
    w.write_i8(value);
}

#[test]
fn test_int_overflow_raises() {
    let mut vm = setup();
    let mut w = main_writer(&mut vm);
    let k = w.int_constant(i32::MAX).unwrap();
    w.write_op(Op::LoadConstant, 1);
    w.write_u8(k as u8);
    w.write_op(Op::AddInt, 1);
    w.write_i8(1);
    w.write_op(Op::Return, 1);
    w.set_max_registers(1);

    let result = w.run(false);
    assert_eq!(result.status, VMStatus::Error);
    assert_eq!(
        result.result,
        "OverflowError: Cannot add 2147483647 and 1 as the result does not fit in an Int"
    );
    assert!(result.stack_trace.contains("at main (<test>:1)"));
}

#[test]
fn test_float_addition_does_not_overflow() {
    let mut vm = setup();
    let mut w = main_writer(&mut vm);
    let k = w.float_constant(i32::MAX as f64).unwrap();
    w.write_op(Op::LoadConstant, 1);
    w.write_u8(k as u8);
    w.write_op(Op::AddInt, 1);
    w.write_i8(1);
    w.write_op(Op::Exit, 1);
    w.set_max_registers(1);

    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    assert_eq!(result.result, "2147483648");
}

#[test]
fn test_array_insert() {
    let mut vm = setup();
    let mut w = main_writer(&mut vm);
    // var a = [10, 20, 30]
    w.write_op(Op::NewArray, 1);
    w.write_u8(3);
    w.write_u8(0);
    for (index, value) in [(0, 10), (1, 20), (2, 30)] {
        load_small_int(&mut w, value, 1);
        w.write_op(Op::StoreArrayUnchecked, 1);
        w.write_u8(0);
        w.write_u8(index);
    }
    // a.insert(1, 15)
    load_small_int(&mut w, 1, 2);
    w.write_op(Op::StoreR1, 2);
    load_small_int(&mut w, 15, 2);
    w.write_op(Op::StoreR2, 2);
    call_method(&mut w, "insert", 0, 3, 2);
    // a
    w.write_op(Op::LoadR0, 3);
    w.write_op(Op::Exit, 3);
    w.set_max_registers(4);

    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    assert_eq!(result.result, "[ 10, 15, 20, 30 ]");
}

#[test]
fn test_map_overwrite_and_len() {
    let mut vm = setup();
    let map_class = vm.module_variable("<prelude>", "Map").unwrap().index;
    let mut w = main_writer(&mut vm);
    // var m = Map()  (calling a class invokes its constructor)
    w.write_op(Op::LoadModuleVariable, 1);
    w.write_u8(map_class as u8);
    w.write_op(Op::Call, 1);
    w.write_u8(0);
    w.write_u8(0);
    w.write_op(Op::StoreR0, 1);
    // m[@k] = 1; m[@k] = 2  (same interned key, so the second write wins)
    let k = w.symbol_constant("k").unwrap();
    w.write_op(Op::LoadConstant, 2);
    w.write_u8(k as u8);
    w.write_op(Op::StoreR1, 2);
    load_small_int(&mut w, 1, 2);
    w.write_op(Op::StoreSubscript, 2);
    w.write_u8(0);
    w.write_u8(1);
    load_small_int(&mut w, 2, 3);
    w.write_op(Op::StoreSubscript, 3);
    w.write_u8(0);
    w.write_u8(1);
    // [m.len(), m[@k]]  (expect [ 1, 2 ]: overwrite, not insert)
    w.write_op(Op::NewArray, 4);
    w.write_u8(2);
    w.write_u8(2);
    call_method(&mut w, "len", 0, 1, 4);
    w.write_op(Op::StoreArrayUnchecked, 4);
    w.write_u8(2);
    w.write_u8(0);
    w.write_op(Op::LoadConstant, 4);
    w.write_u8(k as u8);
    w.write_op(Op::LoadSubscript, 4);
    w.write_u8(0);
    w.write_op(Op::StoreArrayUnchecked, 4);
    w.write_u8(2);
    w.write_u8(1);
    w.write_op(Op::LoadR2, 4);
    w.write_op(Op::Exit, 4);
    w.set_max_registers(4);

    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    assert_eq!(result.result, "[ 1, 2 ]");
}

#[test]
fn test_closure_counter_shares_upvalue() {
    let mut vm = setup();

    // fun mk() { var x = 0; return fun() { x = x + 1; return x } }
    let mut inner = vm.new_function_info("increment", "<test>", 0);
    inner.write_op(Op::LoadUpvalue, 2);
    inner.write_u8(0);
    inner.write_op(Op::AddInt, 2);
    inner.write_i8(1);
    inner.write_op(Op::StoreUpvalue, 2);
    inner.write_u8(0);
    inner.write_op(Op::Return, 2);
    inner.set_max_registers(0);
    inner.add_upvalue(0, true);

    let mut mk = vm.new_function_info("mk", "<test>", 0);
    let inner_const = mk.fun_constant(inner).unwrap();
    load_small_int(&mut mk, 0, 1);
    mk.write_op(Op::StoreR0, 1);
    mk.write_op(Op::Closure, 2);
    mk.write_u8(inner_const as u8);
    mk.write_op(Op::Return, 2);
    mk.set_max_registers(1);

    let mut w = main_writer(&mut vm);
    let mk_const = w.fun_constant(mk).unwrap();
    // var c = mk()
    w.write_op(Op::Closure, 3);
    w.write_u8(mk_const as u8);
    w.write_op(Op::Call0Argument, 3);
    w.write_u8(2);
    w.write_op(Op::StoreR0, 3);
    // [c(), c(), c()]
    w.write_op(Op::NewArray, 4);
    w.write_u8(3);
    w.write_u8(1);
    for index in 0..3 {
        w.write_op(Op::LoadR0, 4);
        w.write_op(Op::Call0Argument, 4);
        w.write_u8(2);
        w.write_op(Op::StoreArrayUnchecked, 4);
        w.write_u8(1);
        w.write_u8(index);
    }
    w.write_op(Op::LoadR1, 4);
    w.write_op(Op::Exit, 4);
    w.set_max_registers(2);

    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    assert_eq!(result.result, "[ 1, 2, 3 ]");
}

#[test]
fn test_catch_index_error_class_name() {
    let mut vm = setup();
    let mut w = main_writer(&mut vm);
    // try { [1,2,3][5] } catch e { e.getClass().name() }
    w.write_op(Op::NewArray, 1);
    w.write_u8(3);
    w.write_u8(0);
    load_small_int(&mut w, 5, 1);
    let fail = w.write_op(Op::LoadSubscript, 1);
    w.write_u8(0);
    let try_end = w.size();
    w.write_op(Op::Exit, 1);
    let catch_begin = w.size();
    w.write_op(Op::LoadRegister, 2);
    w.write_u8(2);
    call_method(&mut w, "getClass", 2, 1, 2);
    w.write_op(Op::StoreR3, 2);
    call_method(&mut w, "name", 3, 1, 2);
    w.write_op(Op::Exit, 2);
    w.set_max_registers(5);
    w.add_exception_handler(fail as u32, try_end as u32, 2, catch_begin as u32);

    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    assert_eq!(result.result, "IndexError");
}

#[test]
fn test_string_chars_counts_scalars() {
    let mut vm = setup();
    let mut w = main_writer(&mut vm);
    let s = w.string_constant("héllo").unwrap();
    // var it = "héllo".chars(); var n = 0
    w.write_op(Op::LoadConstant, 1);
    w.write_u8(s as u8);
    w.write_op(Op::StoreR0, 1);
    call_method(&mut w, "chars", 0, 1, 1);
    w.write_op(Op::StoreR0, 1);
    load_small_int(&mut w, 0, 1);
    w.write_op(Op::StoreR1, 1);
    // while (it.hasNext()) { it.next(); n = n + 1 }
    let loop_start = w.size();
    call_method(&mut w, "hasNext", 0, 1, 2);
    let exit_jump = w.write_op(Op::JumpIfFalse, 2);
    w.write_u8(0);
    call_method(&mut w, "next", 0, 1, 2);
    w.write_op(Op::LoadR1, 2);
    w.write_op(Op::AddInt, 2);
    w.write_i8(1);
    w.write_op(Op::StoreR1, 2);
    let jump_back = w.write_op(Op::JumpBack, 2);
    w.write_u8((jump_back - loop_start) as u8);
    let loop_exit = w.size();
    w.patch_jump(exit_jump, (loop_exit - (exit_jump + 2)) as u32)
        .unwrap();
    w.write_op(Op::LoadR1, 3);
    w.write_op(Op::Exit, 3);
    w.set_max_registers(3);

    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    assert_eq!(result.result, "5");
}

#[test]
fn test_range_iteration_sum() {
    let mut vm = setup();
    let range_class = vm.module_variable("<prelude>", "Range").unwrap().index;
    let mut w = main_writer(&mut vm);
    // var r = Range(0, 3); var sum = 0
    load_small_int(&mut w, 0, 1);
    w.write_op(Op::StoreR1, 1);
    load_small_int(&mut w, 3, 1);
    w.write_op(Op::StoreR2, 1);
    w.write_op(Op::LoadModuleVariable, 1);
    w.write_u8(range_class as u8);
    w.write_op(Op::Call, 1);
    w.write_u8(0);
    w.write_u8(2);
    w.write_op(Op::StoreR0, 1);
    load_small_int(&mut w, 0, 1);
    w.write_op(Op::StoreR1, 1);
    // for i in r { sum = sum + i }
    let loop_start = w.size();
    call_method(&mut w, "hasNext", 0, 1, 2);
    let exit_jump = w.write_op(Op::JumpIfFalse, 2);
    w.write_u8(0);
    call_method(&mut w, "next", 0, 1, 2);
    w.write_op(Op::AddRegister, 2);
    w.write_u8(1);
    w.write_op(Op::StoreR1, 2);
    let jump_back = w.write_op(Op::JumpBack, 2);
    w.write_u8((jump_back - loop_start) as u8);
    let loop_exit = w.size();
    w.patch_jump(exit_jump, (loop_exit - (exit_jump + 2)) as u32)
        .unwrap();
    w.write_op(Op::LoadR1, 3);
    w.write_op(Op::Exit, 3);
    w.set_max_registers(4);

    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    assert_eq!(result.result, "3");
}

#[test]
fn test_for_loop_opcode() {
    let mut vm = setup();
    let mut w = main_writer(&mut vm);
    // for (i = 0; i < 3; i++) sum += i  via the fused ForLoop opcode
    load_small_int(&mut w, 0, 1);
    w.write_op(Op::StoreR0, 1);
    load_small_int(&mut w, 3, 1);
    w.write_op(Op::StoreR1, 1);
    load_small_int(&mut w, 0, 1);
    w.write_op(Op::StoreR2, 1);
    let body = w.size();
    w.write_op(Op::LoadR2, 2);
    w.write_op(Op::AddRegister, 2);
    w.write_u8(0);
    w.write_op(Op::StoreR2, 2);
    let for_loop = w.write_op(Op::ForLoop, 2);
    w.write_u8((for_loop - body) as u8);
    w.write_u8(0);
    w.write_op(Op::LoadR2, 3);
    w.write_op(Op::Exit, 3);
    w.set_max_registers(3);

    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    assert_eq!(result.result, "3");
}

#[test]
fn test_throw_and_catch_across_frames() {
    let mut vm = setup();

    let mut thrower = vm.new_function_info("thrower", "<test>", 0);
    load_small_int(&mut thrower, 42, 5);
    thrower.write_op(Op::Throw, 5);
    thrower.set_max_registers(0);

    let mut w = main_writer(&mut vm);
    let thrower_const = w.fun_constant(thrower).unwrap();
    let try_begin = w.size();
    w.write_op(Op::Closure, 1);
    w.write_u8(thrower_const as u8);
    w.write_op(Op::Call0Argument, 1);
    w.write_u8(3);
    w.write_op(Op::Exit, 1);
    let try_end = w.size();
    let catch_begin = w.size();
    w.write_op(Op::LoadRegister, 2);
    w.write_u8(2);
    w.write_op(Op::Exit, 2);
    w.set_max_registers(3);
    w.add_exception_handler(try_begin as u32, try_end as u32, 2, catch_begin as u32);

    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    assert_eq!(result.result, "42");
}

#[test]
fn test_uncaught_error_stack_trace() {
    let mut vm = setup();

    let mut inner = vm.new_function_info("inner", "<test>", 0);
    load_small_int(&mut inner, 1, 7);
    inner.write_op(Op::StoreR0, 7);
    load_small_int(&mut inner, 0, 7);
    inner.write_op(Op::DivideRegister, 7);
    inner.write_u8(0);
    inner.write_op(Op::Return, 7);
    inner.set_max_registers(1);

    let mut w = main_writer(&mut vm);
    let inner_const = w.fun_constant(inner).unwrap();
    w.write_op(Op::Closure, 3);
    w.write_u8(inner_const as u8);
    w.write_op(Op::Call0Argument, 3);
    w.write_u8(0);
    w.write_op(Op::Exit, 3);
    w.set_max_registers(1);

    let result = w.run(false);
    assert_eq!(result.status, VMStatus::Error);
    assert_eq!(result.result, "Error: Cannot divide 1 by zero");
    assert!(result.stack_trace.contains("at inner (<test>:7)"));
    assert!(result.stack_trace.contains("at main (<test>:3)"));
}

#[test]
fn test_division_and_modulo_edge_cases() {
    // i32::MIN % -1 == 0 by definition
    let mut vm = setup();
    let mut w = main_writer(&mut vm);
    let min = w.int_constant(i32::MIN).unwrap();
    w.write_op(Op::LoadConstant, 1);
    w.write_u8(min as u8);
    w.write_op(Op::ModInt, 1);
    w.write_i8(-1);
    w.write_op(Op::Exit, 1);
    w.set_max_registers(1);
    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    assert_eq!(result.result, "0");

    // i32::MIN / -1 overflows
    let mut w = main_writer(&mut vm);
    let min = w.int_constant(i32::MIN).unwrap();
    w.write_op(Op::LoadConstant, 1);
    w.write_u8(min as u8);
    w.write_op(Op::DivideInt, 1);
    w.write_i8(-1);
    w.write_op(Op::Exit, 1);
    w.set_max_registers(1);
    let result = w.run(false);
    assert_eq!(result.status, VMStatus::Error);
    assert!(result.result.starts_with("OverflowError:"));
}

#[test]
fn test_wide_and_extrawide_operands() {
    let mut vm = setup();
    let mut w = main_writer(&mut vm);
    // A register index above 255 forces the Wide prefix; a large immediate
    // forces ExtraWide.
    w.write_op(Op::ExtraWide, 1);
    w.write_op(Op::LoadInt, 1);
    w.write_i32(123_456_789);
    w.write_op(Op::Wide, 1);
    w.write_op(Op::StoreRegister, 1);
    w.write_u16(300);
    w.write_op(Op::LoadNull, 2);
    w.write_op(Op::Wide, 2);
    w.write_op(Op::LoadRegister, 2);
    w.write_u16(300);
    w.write_op(Op::Exit, 2);
    w.set_max_registers(301);

    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    assert_eq!(result.result, "123456789");
}

#[test]
fn test_string_concat_and_replace() {
    let mut vm = setup();
    let mut w = main_writer(&mut vm);
    let hello = w.string_constant("hello ").unwrap();
    let world = w.string_constant("world").unwrap();
    w.write_op(Op::LoadConstant, 1);
    w.write_u8(hello as u8);
    w.write_op(Op::StoreR0, 1);
    w.write_op(Op::LoadConstant, 1);
    w.write_u8(world as u8);
    w.write_op(Op::ConcatRegister, 1);
    w.write_u8(0);
    w.write_op(Op::StoreR0, 1);
    // "hello world".replace("l", "L")
    let from = w.string_constant("l").unwrap();
    let to = w.string_constant("L").unwrap();
    w.write_op(Op::LoadConstant, 2);
    w.write_u8(from as u8);
    w.write_op(Op::StoreR1, 2);
    w.write_op(Op::LoadConstant, 2);
    w.write_u8(to as u8);
    w.write_op(Op::StoreR2, 2);
    call_method(&mut w, "replace", 0, 3, 2);
    w.write_op(Op::Exit, 2);
    w.set_max_registers(3);

    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    assert_eq!(result.result, "heLLo worLd");
}

#[test]
fn test_user_class_methods_and_inheritance() {
    let mut vm = setup();

    // Method bodies: receiver-only functions returning constants.
    let mut base_get = vm.new_function_info("speak", "<test>", 1);
    load_small_int(&mut base_get, 7, 1);
    base_get.write_op(Op::Return, 1);
    base_get.set_max_registers(1);

    let mut sub_get = vm.new_function_info("speak", "<test>", 1);
    load_small_int(&mut sub_get, 8, 1);
    sub_get.write_op(Op::Return, 1);
    sub_get.set_max_registers(1);

    let extend_class = vm
        .module_variable("<prelude>", "_extendClass")
        .unwrap()
        .index;

    let mut w = main_writer(&mut vm);
    let base_const = w.fun_constant(base_get).unwrap();
    let sub_const = w.fun_constant(sub_get).unwrap();
    let point = w.symbol_constant("Point").unwrap();
    let sub = w.symbol_constant("Point3").unwrap();
    let speak = w.symbol_constant("speak").unwrap();

    // class Point { fun speak() { return 7 } }
    w.write_op(Op::MakeClass, 1);
    w.write_u8(point as u8);
    w.write_op(Op::StoreR0, 1);
    w.write_op(Op::Closure, 1);
    w.write_u8(base_const as u8);
    w.write_op(Op::StoreMethod, 1);
    w.write_u8(0);
    w.write_u8(speak as u8);

    // class Point3 extends Point {}
    w.write_op(Op::MakeClass, 2);
    w.write_u8(sub as u8);
    w.write_op(Op::StoreR1, 2);
    w.write_op(Op::Move, 2);
    w.write_u8(1);
    w.write_u8(2);
    w.write_op(Op::Move, 2);
    w.write_u8(0);
    w.write_u8(3);
    w.write_op(Op::LoadModuleVariable, 2);
    w.write_u8(extend_class as u8);
    w.write_op(Op::Call, 2);
    w.write_u8(2);
    w.write_u8(2);

    // Inherited: Point3().speak() == 7
    w.write_op(Op::LoadR1, 3);
    w.write_op(Op::Call, 3);
    w.write_u8(4);
    w.write_u8(0);
    w.write_op(Op::StoreR2, 3);
    call_method(&mut w, "speak", 2, 1, 3);
    w.write_op(Op::StoreR4, 3);

    // Override: class Point3 { fun speak() { return 8 } } then re-dispatch
    w.write_op(Op::Closure, 4);
    w.write_u8(sub_const as u8);
    w.write_op(Op::StoreMethod, 4);
    w.write_u8(1);
    w.write_u8(speak as u8);
    call_method(&mut w, "speak", 2, 1, 4);
    w.write_op(Op::StoreR5, 4);

    // Property storage on the instance
    load_small_int(&mut w, 3, 5);
    w.write_op(Op::StoreProperty, 5);
    w.write_u8(2);
    let x = w.symbol_constant("x").unwrap();
    w.write_u8(x as u8);

    // [inherited, overridden, property]
    w.write_op(Op::NewArray, 6);
    w.write_u8(3);
    w.write_u8(6);
    w.write_op(Op::LoadR4, 6);
    w.write_op(Op::StoreArrayUnchecked, 6);
    w.write_u8(6);
    w.write_u8(0);
    w.write_op(Op::LoadR5, 6);
    w.write_op(Op::StoreArrayUnchecked, 6);
    w.write_u8(6);
    w.write_u8(1);
    w.write_op(Op::LoadR2, 6);
    let load_x = w.symbol_constant("x").unwrap();
    w.write_op(Op::LoadProperty, 6);
    w.write_u8(load_x as u8);
    w.write_op(Op::StoreArrayUnchecked, 6);
    w.write_u8(6);
    w.write_u8(2);
    w.write_op(Op::LoadR6, 6);
    w.write_op(Op::Exit, 6);
    w.set_max_registers(7);

    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    assert_eq!(result.result, "[ 7, 8, 3 ]");
}

#[test]
fn test_array_iterator_yields_every_element() {
    let mut vm = setup();
    let mut w = main_writer(&mut vm);
    // var a = [5, 6, 7]; var it = a.iter(); var sum = 0
    w.write_op(Op::NewArray, 1);
    w.write_u8(3);
    w.write_u8(0);
    for (index, value) in [(0, 5), (1, 6), (2, 7)] {
        load_small_int(&mut w, value, 1);
        w.write_op(Op::StoreArrayUnchecked, 1);
        w.write_u8(0);
        w.write_u8(index);
    }
    call_method(&mut w, "iter", 0, 1, 2);
    w.write_op(Op::StoreR0, 2);
    load_small_int(&mut w, 0, 2);
    w.write_op(Op::StoreR1, 2);
    // while (it.hasNext()) { sum = sum + it.next() }
    let loop_start = w.size();
    call_method(&mut w, "hasNext", 0, 1, 3);
    let exit_jump = w.write_op(Op::JumpIfFalse, 3);
    w.write_u8(0);
    call_method(&mut w, "next", 0, 1, 3);
    w.write_op(Op::AddRegister, 3);
    w.write_u8(1);
    w.write_op(Op::StoreR1, 3);
    let jump_back = w.write_op(Op::JumpBack, 3);
    w.write_u8((jump_back - loop_start) as u8);
    let loop_exit = w.size();
    w.patch_jump(exit_jump, (loop_exit - (exit_jump + 2)) as u32)
        .unwrap();
    w.write_op(Op::LoadR1, 4);
    w.write_op(Op::Exit, 4);
    w.set_max_registers(3);

    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    assert_eq!(result.result, "18");
}

#[test]
fn test_negate_not_and_comparison() {
    let mut vm = setup();
    let mut w = main_writer(&mut vm);
    // !(-5 < 3)
    load_small_int(&mut w, 5, 1);
    w.write_op(Op::Negate, 1);
    w.write_op(Op::StoreR0, 1);
    load_small_int(&mut w, 3, 1);
    w.write_op(Op::LessThan, 1);
    w.write_u8(0);
    w.write_op(Op::Not, 1);
    w.write_op(Op::Exit, 1);
    w.set_max_registers(1);

    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    assert_eq!(result.result, "false");
}

#[test]
fn test_undefined_global_is_name_error() {
    let mut vm = setup();
    let g = vm.add_global("mystery");
    let mut w = main_writer(&mut vm);
    w.write_op(Op::LoadGlobal, 1);
    w.write_u8(g as u8);
    w.write_op(Op::Exit, 1);
    w.set_max_registers(1);

    let result = w.run(false);
    assert_eq!(result.status, VMStatus::Error);
    assert_eq!(result.result, "NameError: Undefined variable 'mystery'");
}

#[test]
fn test_cooperative_tasks_interleave() {
    let mut vm = setup();
    let g = vm.add_global("shared");

    // Task body: shared = 99
    let mut body = vm.new_function_info("worker", "<test>", 0);
    load_small_int(&mut body, 99, 1);
    body.write_op(Op::StoreGlobal, 1);
    body.write_u8(g as u8);
    body.write_op(Op::LoadNull, 1);
    body.write_op(Op::Return, 1);
    body.set_max_registers(0);

    // Materialize the worker as a Function via a loader program.
    let mut loader = vm.new_function_info("loader", "<test>", 0);
    let body_const = loader.fun_constant(body).unwrap();
    loader.write_op(Op::Closure, 1);
    loader.write_u8(body_const as u8);
    loader.write_op(Op::Exit, 1);
    loader.set_max_registers(0);
    let result = loader.run(false);
    assert_eq!(result.status, VMStatus::Success);
    let worker = unsafe { value_as::<tern_vm::function::Function>(vm.return_value) }.unwrap();

    let task = vm.spawn_task(worker);

    // Root: yield once (letting the worker run), then read the global.
    let mut w = main_writer(&mut vm);
    w.write_op(Op::Yield, 1);
    w.write_op(Op::LoadGlobal, 2);
    w.write_u8(g as u8);
    w.write_op(Op::Exit, 2);
    w.set_max_registers(1);

    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    assert_eq!(result.result, "99");
    unsafe {
        assert_eq!((*task).status, TaskStatus::Success);
    }
}

#[test]
fn test_cancelled_task_unwinds() {
    let mut vm = setup();

    // Worker: loop { yield }
    let mut body = vm.new_function_info("spinner", "<test>", 0);
    let loop_start = body.size();
    body.write_op(Op::Yield, 1);
    let jump_back = body.write_op(Op::JumpBack, 1);
    body.write_u8((jump_back - loop_start) as u8);
    body.set_max_registers(0);

    let mut loader = vm.new_function_info("loader", "<test>", 0);
    let body_const = loader.fun_constant(body).unwrap();
    loader.write_op(Op::Closure, 1);
    loader.write_u8(body_const as u8);
    loader.write_op(Op::Exit, 1);
    loader.set_max_registers(0);
    assert_eq!(loader.run(false).status, VMStatus::Success);
    let worker = unsafe { value_as::<tern_vm::function::Function>(vm.return_value) }.unwrap();

    let task = vm.spawn_task(worker);
    vm.cancel_task(task, Value::from_int(7));

    // Root yields twice so the scheduler resumes the worker, which then
    // observes the cancellation and dies.
    let mut w = main_writer(&mut vm);
    w.write_op(Op::Yield, 1);
    w.write_op(Op::Yield, 1);
    load_small_int(&mut w, 1, 2);
    w.write_op(Op::Exit, 2);
    w.set_max_registers(1);

    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    unsafe {
        assert_eq!((*task).status, TaskStatus::Error);
    }
}

#[test]
fn test_ecall_roundtrip() {
    let mut vm = setup();
    vm.register_efunc("double", |ctx| {
        let mut value = 0;
        if ctx.as_int(&mut value) != tern_vm::EFuncStatus::Ok {
            return false;
        }
        ctx.pop();
        ctx.push_int(value * 2);
        true
    });
    let ecall = vm.module_variable("vm", "ecall").unwrap().index;

    let mut w = main_writer(&mut vm);
    let sym = w.symbol_constant("double").unwrap();
    w.write_op(Op::LoadConstant, 1);
    w.write_u8(sym as u8);
    w.write_op(Op::StoreR0, 1);
    load_small_int(&mut w, 21, 1);
    w.write_op(Op::StoreR1, 1);
    w.write_op(Op::Wide, 1);
    w.write_op(Op::LoadModuleVariable, 1);
    w.write_u16(ecall as u16);
    w.write_op(Op::Call, 1);
    w.write_u8(0);
    w.write_u8(2);
    w.write_op(Op::Exit, 1);
    w.set_max_registers(2);

    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    assert_eq!(result.result, "42");
}

#[test]
fn test_math_and_random_modules() {
    let mut vm = setup();
    let sqrt = vm.module_variable("math", "sqrt").unwrap().index;
    let mut w = main_writer(&mut vm);
    load_small_int(&mut w, 9, 1);
    w.write_op(Op::StoreR0, 1);
    w.write_op(Op::Wide, 1);
    w.write_op(Op::LoadModuleVariable, 1);
    w.write_u16(sqrt as u16);
    w.write_op(Op::Call1Argument, 1);
    w.write_u8(0);
    w.write_op(Op::Exit, 1);
    w.set_max_registers(1);
    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    assert_eq!(result.result, "3");

    // random.range(2, 2) is deterministic
    let range = vm.module_variable("random", "range").unwrap().index;
    let mut w = main_writer(&mut vm);
    load_small_int(&mut w, 2, 1);
    w.write_op(Op::StoreR0, 1);
    load_small_int(&mut w, 2, 1);
    w.write_op(Op::StoreR1, 1);
    w.write_op(Op::Wide, 1);
    w.write_op(Op::LoadModuleVariable, 1);
    w.write_u16(range as u16);
    w.write_op(Op::Call, 1);
    w.write_u8(0);
    w.write_u8(2);
    w.write_op(Op::Exit, 1);
    w.set_max_registers(2);
    let result = w.run(true);
    assert_eq!(result.status, VMStatus::Success);
    assert_eq!(result.result, "2");
}

#[test]
fn test_call_arity_mismatch() {
    let mut vm = setup();
    let mut callee = vm.new_function_info("wants_two", "<test>", 2);
    callee.write_op(Op::LoadNull, 1);
    callee.write_op(Op::Return, 1);
    callee.set_max_registers(2);

    let mut w = main_writer(&mut vm);
    let callee_const = w.fun_constant(callee).unwrap();
    w.write_op(Op::Closure, 1);
    w.write_u8(callee_const as u8);
    w.write_op(Op::Call1Argument, 1);
    w.write_u8(0);
    w.write_op(Op::Exit, 1);
    w.set_max_registers(1);

    let result = w.run(false);
    assert_eq!(result.status, VMStatus::Error);
    assert_eq!(
        result.result,
        "TypeError: Function 'wants_two' takes 2 arguments but 1 given"
    );
}

#[test]
fn test_missing_method_is_type_error() {
    let mut vm = setup();
    let mut w = main_writer(&mut vm);
    load_small_int(&mut w, 3, 1);
    w.write_op(Op::StoreR0, 1);
    call_method(&mut w, "push", 0, 1, 1);
    w.write_op(Op::Exit, 1);
    w.set_max_registers(1);

    let result = w.run(false);
    assert_eq!(result.status, VMStatus::Error);
    assert_eq!(result.result, "TypeError: Cannot find method 'push' for Int");
}
