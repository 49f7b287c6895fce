//! The dispatch loop
//!
//! Accumulator + register-file execution. Each frame's registers are a
//! window `bp[0..max_registers]` into the task stack; most opcodes combine
//! the accumulator with one register or one immediate.
//!
//! The three operand widths share one set of handler definitions: the
//! `dispatch_op!` macro expands the full opcode match once per width
//! (narrow `u8/i8`, `Wide` `u16/i16`, `ExtraWide` `u32/i32`). A prefix
//! opcode widens exactly one following instruction, matching the emitter.
//!
//! Thrown values travel as explicit control flow (`throw_!` →
//! `VM::throw_value`), never as host panics, so dispatch stays a plain
//! loop.

use tern_core::{ObjHeader, Value};

use crate::function::{Function, FunctionInfo, NativeFunction};
use crate::object::{
    obj_as, obj_is, type_string, value_as, value_equals, Array, Class, HashKey, Instance, Map,
    Symbol, TernString,
};
use crate::op::Op;
use crate::task::{Task, MAX_FRAMES};
use crate::vm::VM;

/// How one `execute_current` slice ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepResult {
    Done,
    Error,
    Yield,
}

/// Little-endian operand decoding; the only primitive that advances `ip`.
trait Decode: Copy {
    unsafe fn decode(ip: &mut *const u8) -> Self;
}

macro_rules! impl_decode {
    ($($t:ty),*) => {
        $(impl Decode for $t {
            #[inline(always)]
            unsafe fn decode(ip: &mut *const u8) -> $t {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                std::ptr::copy_nonoverlapping(*ip, buf.as_mut_ptr(), buf.len());
                *ip = ip.add(buf.len());
                <$t>::from_le_bytes(buf)
            }
        })*
    };
}

impl_decode!(u8, u16, u32, i8, i16, i32);

/// Outcome of dispatching a call.
enum CallAction {
    /// A script frame was pushed; the loop reloads its locals.
    Frame,
    /// A native ran to completion; its result is in `return_value`.
    NativeOk,
    /// The callee (native or dispatch itself) threw.
    Throw(Value),
    /// Unrecoverable (stack overflow); task state is already Error.
    Fatal,
}

impl VM {
    /// Run the current task until it finishes, fails or yields.
    pub(crate) unsafe fn execute_current(&mut self) -> StepResult {
        let task = self.current_task;

        // Host cancellation lands at resume points.
        if !(*task).cancel_value.is_empty() {
            let cancel = (*task).cancel_value;
            (*task).cancel_value = Value::empty();
            if !self.throw_value(cancel) {
                return StepResult::Error;
            }
        }

        let frame = *(*task).frames.last().unwrap();
        let mut bp = frame.bp;
        let mut ip = frame.ip;
        let mut fun = frame.f;
        let mut constants: *const Value = (*(*fun).function_info).constants.as_ptr();

        macro_rules! save_ip {
            () => {
                (*task).frames.last_mut().unwrap().ip = ip
            };
        }

        macro_rules! reload_frame {
            () => {{
                let frame = *(*task).frames.last().unwrap();
                bp = frame.bp;
                ip = frame.ip;
                fun = frame.f;
                let info = (*fun).function_info;
                constants = (*info).constants.as_ptr();
                (*task).stack_top = bp.add((*info).max_registers as usize);
            }};
        }

        macro_rules! throw_ {
            ($value:expr) => {{
                let value = $value;
                save_ip!();
                if self.throw_value(value) {
                    reload_frame!();
                    continue;
                } else {
                    return StepResult::Error;
                }
            }};
        }

        // Build an error instance of a builtin error class and throw it.
        macro_rules! panic_class {
            ($class:ident, $($fmt:tt)*) => {{
                let message = format!($($fmt)*);
                let class = self.builtin_classes.$class;
                let error = self.create_error(class, &message);
                throw_!(error)
            }};
        }

        macro_rules! binary_op_register {
            ($utype:ty, $opname:literal, $checked:ident, $op:tt) => {{
                let reg = <$utype as Decode>::decode(&mut ip) as usize;
                let lhs = *bp.add(reg);
                let rhs = self.accumulator;
                if lhs.is_int() && rhs.is_int() {
                    match lhs.as_int().$checked(rhs.as_int()) {
                        Some(result) => self.accumulator = Value::from_int(result),
                        None => panic_class!(
                            overflow_error,
                            "Cannot {} {} and {} as the result does not fit in an Int",
                            $opname,
                            lhs.as_int(),
                            rhs.as_int()
                        ),
                    }
                } else if lhs.is_float() && rhs.is_float() {
                    self.accumulator = Value::from_float(lhs.as_float() $op rhs.as_float());
                } else if lhs.is_int() && rhs.is_float() {
                    self.accumulator = Value::from_float((lhs.as_int() as f64) $op rhs.as_float());
                } else if lhs.is_float() && rhs.is_int() {
                    self.accumulator = Value::from_float(lhs.as_float() $op (rhs.as_int() as f64));
                } else {
                    panic_class!(
                        type_error,
                        "Cannot {} types {} and {}",
                        $opname,
                        type_string(lhs),
                        type_string(rhs)
                    );
                }
            }};
        }

        macro_rules! binary_op_int {
            ($utype:ty, $itype:ty, $opname:literal, $checked:ident, $op:tt) => {{
                let imm = <$itype as Decode>::decode(&mut ip) as i32;
                let lhs = self.accumulator;
                if lhs.is_int() {
                    match lhs.as_int().$checked(imm) {
                        Some(result) => self.accumulator = Value::from_int(result),
                        None => panic_class!(
                            overflow_error,
                            "Cannot {} {} and {} as the result does not fit in an Int",
                            $opname,
                            lhs.as_int(),
                            imm
                        ),
                    }
                } else if lhs.is_float() {
                    self.accumulator = Value::from_float(lhs.as_float() $op (imm as f64));
                } else {
                    panic_class!(
                        type_error,
                        "Cannot {} types {} and Int",
                        $opname,
                        type_string(lhs)
                    );
                }
            }};
        }

        macro_rules! comparison_op {
            ($utype:ty, $op:tt) => {{
                let reg = <$utype as Decode>::decode(&mut ip) as usize;
                let lhs = *bp.add(reg);
                let rhs = self.accumulator;
                let result = if lhs.is_int() && rhs.is_int() {
                    lhs.as_int() $op rhs.as_int()
                } else if lhs.is_float() && rhs.is_float() {
                    lhs.as_float() $op rhs.as_float()
                } else if lhs.is_int() && rhs.is_float() {
                    (lhs.as_int() as f64) $op rhs.as_float()
                } else if lhs.is_float() && rhs.is_int() {
                    lhs.as_float() $op (rhs.as_int() as f64)
                } else {
                    panic_class!(
                        type_error,
                        "Cannot compare types {} and {}",
                        type_string(lhs),
                        type_string(rhs)
                    );
                };
                self.accumulator = Value::from_bool(result);
            }};
        }

        macro_rules! call_result {
            ($action:expr) => {{
                match $action {
                    CallAction::Frame => {
                        reload_frame!();
                        continue;
                    }
                    CallAction::NativeOk => self.accumulator = self.return_value,
                    CallAction::Throw(value) => throw_!(value),
                    CallAction::Fatal => return StepResult::Error,
                }
            }};
        }

        // The single opcode match, expanded once per operand width.
        macro_rules! dispatch_op {
            ($op:expr, $utype:ty, $itype:ty, $prefix_size:expr) => {{
                match $op {
                    Op::Wide | Op::ExtraWide => {
                        unreachable!("width prefix cannot prefix another prefix")
                    }

                    // ---- loads and stores --------------------------------
                    Op::LoadR0 => self.accumulator = *bp.add(0),
                    Op::LoadR1 => self.accumulator = *bp.add(1),
                    Op::LoadR2 => self.accumulator = *bp.add(2),
                    Op::LoadR3 => self.accumulator = *bp.add(3),
                    Op::LoadR4 => self.accumulator = *bp.add(4),
                    Op::LoadR5 => self.accumulator = *bp.add(5),
                    Op::LoadR6 => self.accumulator = *bp.add(6),
                    Op::LoadR7 => self.accumulator = *bp.add(7),
                    Op::LoadR8 => self.accumulator = *bp.add(8),
                    Op::LoadR9 => self.accumulator = *bp.add(9),
                    Op::LoadR10 => self.accumulator = *bp.add(10),
                    Op::LoadR11 => self.accumulator = *bp.add(11),
                    Op::LoadR12 => self.accumulator = *bp.add(12),
                    Op::LoadR13 => self.accumulator = *bp.add(13),
                    Op::LoadR14 => self.accumulator = *bp.add(14),
                    Op::LoadR15 => self.accumulator = *bp.add(15),
                    Op::StoreR0 => *bp.add(0) = self.accumulator,
                    Op::StoreR1 => *bp.add(1) = self.accumulator,
                    Op::StoreR2 => *bp.add(2) = self.accumulator,
                    Op::StoreR3 => *bp.add(3) = self.accumulator,
                    Op::StoreR4 => *bp.add(4) = self.accumulator,
                    Op::StoreR5 => *bp.add(5) = self.accumulator,
                    Op::StoreR6 => *bp.add(6) = self.accumulator,
                    Op::StoreR7 => *bp.add(7) = self.accumulator,
                    Op::StoreR8 => *bp.add(8) = self.accumulator,
                    Op::StoreR9 => *bp.add(9) = self.accumulator,
                    Op::StoreR10 => *bp.add(10) = self.accumulator,
                    Op::StoreR11 => *bp.add(11) = self.accumulator,
                    Op::StoreR12 => *bp.add(12) = self.accumulator,
                    Op::StoreR13 => *bp.add(13) = self.accumulator,
                    Op::StoreR14 => *bp.add(14) = self.accumulator,
                    Op::StoreR15 => *bp.add(15) = self.accumulator,
                    Op::LoadRegister => {
                        let reg = <$utype as Decode>::decode(&mut ip) as usize;
                        self.accumulator = *bp.add(reg);
                    }
                    Op::StoreRegister => {
                        let reg = <$utype as Decode>::decode(&mut ip) as usize;
                        *bp.add(reg) = self.accumulator;
                    }
                    Op::Move => {
                        let src = <$utype as Decode>::decode(&mut ip) as usize;
                        let dest = <$utype as Decode>::decode(&mut ip) as usize;
                        *bp.add(dest) = *bp.add(src);
                    }
                    Op::LoadConstant => {
                        let index = <$utype as Decode>::decode(&mut ip) as usize;
                        self.accumulator = *constants.add(index);
                    }
                    Op::LoadInt => {
                        let imm = <$itype as Decode>::decode(&mut ip) as i32;
                        self.accumulator = Value::from_int(imm);
                    }
                    Op::LoadSmallInt => {
                        let imm = <i8 as Decode>::decode(&mut ip) as i32;
                        self.accumulator = Value::from_int(imm);
                    }
                    Op::LoadNull => self.accumulator = Value::null(),
                    Op::LoadTrue => self.accumulator = Value::from_bool(true),
                    Op::LoadFalse => self.accumulator = Value::from_bool(false),
                    Op::LoadGlobal => {
                        let index = <$utype as Decode>::decode(&mut ip) as u32;
                        let value = self.globals[index as usize].value;
                        if value.is_empty() {
                            panic_class!(
                                name_error,
                                "Undefined variable '{}'",
                                self.global_name(index)
                            );
                        }
                        self.accumulator = value;
                    }
                    Op::StoreGlobal => {
                        let index = <$utype as Decode>::decode(&mut ip) as usize;
                        self.globals[index].value = self.accumulator;
                    }
                    Op::LoadModuleVariable => {
                        let index = <$utype as Decode>::decode(&mut ip) as u32;
                        let value = self.module_variables[index as usize];
                        if value.is_empty() {
                            panic_class!(
                                name_error,
                                "Module variable '{}' used before definition",
                                self.module_variable_name(index)
                            );
                        }
                        self.accumulator = value;
                    }
                    Op::StoreModuleVariable => {
                        let index = <$utype as Decode>::decode(&mut ip) as usize;
                        self.module_variables[index] = self.accumulator;
                    }
                    Op::LoadUpvalue => {
                        let index = <$utype as Decode>::decode(&mut ip) as usize;
                        self.accumulator = *(*(*fun).upvalues[index]).location;
                    }
                    Op::StoreUpvalue => {
                        let index = <$utype as Decode>::decode(&mut ip) as usize;
                        *(*(*fun).upvalues[index]).location = self.accumulator;
                    }

                    // ---- arithmetic --------------------------------------
                    Op::AddRegister => binary_op_register!($utype, "add", checked_add, +),
                    Op::SubtractRegister => {
                        binary_op_register!($utype, "subtract", checked_sub, -)
                    }
                    Op::MultiplyRegister => {
                        binary_op_register!($utype, "multiply", checked_mul, *)
                    }
                    Op::DivideRegister => {
                        let reg = <$utype as Decode>::decode(&mut ip) as usize;
                        let lhs = *bp.add(reg);
                        let rhs = self.accumulator;
                        match self.arith_divide(lhs, rhs) {
                            Ok(result) => self.accumulator = result,
                            Err(error) => throw_!(error),
                        }
                    }
                    Op::ModRegister => {
                        let reg = <$utype as Decode>::decode(&mut ip) as usize;
                        let lhs = *bp.add(reg);
                        let rhs = self.accumulator;
                        match self.arith_mod(lhs, rhs) {
                            Ok(result) => self.accumulator = result,
                            Err(error) => throw_!(error),
                        }
                    }
                    Op::AddInt => binary_op_int!($utype, $itype, "add", checked_add, +),
                    Op::SubtractInt => {
                        binary_op_int!($utype, $itype, "subtract", checked_sub, -)
                    }
                    Op::MultiplyInt => {
                        binary_op_int!($utype, $itype, "multiply", checked_mul, *)
                    }
                    Op::DivideInt => {
                        let imm = <$itype as Decode>::decode(&mut ip) as i32;
                        let lhs = self.accumulator;
                        match self.arith_divide(lhs, Value::from_int(imm)) {
                            Ok(result) => self.accumulator = result,
                            Err(error) => throw_!(error),
                        }
                    }
                    Op::ModInt => {
                        let imm = <$itype as Decode>::decode(&mut ip) as i32;
                        let lhs = self.accumulator;
                        match self.arith_mod(lhs, Value::from_int(imm)) {
                            Ok(result) => self.accumulator = result,
                            Err(error) => throw_!(error),
                        }
                    }
                    Op::Negate => {
                        let value = self.accumulator;
                        if value.is_int() {
                            match value.as_int().checked_neg() {
                                Some(result) => self.accumulator = Value::from_int(result),
                                None => panic_class!(
                                    overflow_error,
                                    "Cannot negate {} as the result cannot be stored in an Int",
                                    value.as_int()
                                ),
                            }
                        } else if value.is_float() {
                            self.accumulator = Value::from_float(-value.as_float());
                        } else {
                            panic_class!(
                                type_error,
                                "Cannot negate type {}",
                                type_string(value)
                            );
                        }
                    }
                    Op::Not => {
                        self.accumulator = Value::from_bool(self.accumulator.is_null_or_false());
                    }
                    Op::ConcatRegister => {
                        let reg = <$utype as Decode>::decode(&mut ip) as usize;
                        let lhs = *bp.add(reg);
                        let rhs = self.accumulator;
                        match (value_as::<TernString>(lhs), value_as::<TernString>(rhs)) {
                            (Some(a), Some(b)) => {
                                let result = self.concat(a, b);
                                self.accumulator =
                                    Value::from_object(result as *mut ObjHeader);
                            }
                            _ => panic_class!(
                                type_error,
                                "Cannot concat types {} and {}",
                                type_string(lhs),
                                type_string(rhs)
                            ),
                        }
                    }

                    // ---- comparison --------------------------------------
                    Op::Equal => {
                        let reg = <$utype as Decode>::decode(&mut ip) as usize;
                        self.accumulator =
                            Value::from_bool(value_equals(*bp.add(reg), self.accumulator));
                    }
                    Op::NotEqual => {
                        let reg = <$utype as Decode>::decode(&mut ip) as usize;
                        self.accumulator =
                            Value::from_bool(!value_equals(*bp.add(reg), self.accumulator));
                    }
                    Op::LessThan => comparison_op!($utype, <),
                    Op::LessThanOrEqual => comparison_op!($utype, <=),
                    Op::GreaterThan => comparison_op!($utype, >),
                    Op::GreaterThanOrEqual => comparison_op!($utype, >=),

                    // ---- control flow ------------------------------------
                    Op::Jump => {
                        let offset = <$utype as Decode>::decode(&mut ip) as usize;
                        ip = ip.add(offset);
                    }
                    Op::JumpBack => {
                        let offset = <$utype as Decode>::decode(&mut ip) as usize;
                        ip = ip.sub(
                            offset + 1 + std::mem::size_of::<$utype>() + $prefix_size,
                        );
                    }
                    Op::JumpIfFalse => {
                        let offset = <$utype as Decode>::decode(&mut ip) as usize;
                        if self.accumulator.is_null_or_false() {
                            ip = ip.add(offset);
                        }
                    }
                    Op::ForLoop => {
                        let offset = <$utype as Decode>::decode(&mut ip) as usize;
                        let iter = <$utype as Decode>::decode(&mut ip) as usize;
                        let slot = bp.add(iter);
                        debug_assert!((*slot).is_int() && (*bp.add(iter + 1)).is_int());
                        *slot = Value::from_int((*slot).as_int().wrapping_add(1));
                        if (*slot).as_int() < (*bp.add(iter + 1)).as_int() {
                            ip = ip.sub(
                                offset + 1 + 2 * std::mem::size_of::<$utype>() + $prefix_size,
                            );
                        }
                    }

                    // ---- calls -------------------------------------------
                    Op::Call => {
                        let reg = <$utype as Decode>::decode(&mut ip) as usize;
                        let argc = <$utype as Decode>::decode(&mut ip) as usize;
                        save_ip!();
                        let callee = self.accumulator;
                        call_result!(self.call_value(task, callee, bp.add(reg), argc, 0));
                    }
                    Op::Call0Argument => {
                        let reg = <$utype as Decode>::decode(&mut ip) as usize;
                        save_ip!();
                        let callee = self.accumulator;
                        call_result!(self.call_value(task, callee, bp.add(reg), 0, 0));
                    }
                    Op::Call1Argument => {
                        let reg = <$utype as Decode>::decode(&mut ip) as usize;
                        save_ip!();
                        let callee = self.accumulator;
                        call_result!(self.call_value(task, callee, bp.add(reg), 1, 0));
                    }
                    Op::Call2Argument => {
                        let reg = <$utype as Decode>::decode(&mut ip) as usize;
                        save_ip!();
                        let callee = self.accumulator;
                        call_result!(self.call_value(task, callee, bp.add(reg), 2, 0));
                    }
                    Op::CallMethod => {
                        let sym_index = <$utype as Decode>::decode(&mut ip) as usize;
                        let reg = <$utype as Decode>::decode(&mut ip) as usize;
                        let argc = <$utype as Decode>::decode(&mut ip) as usize;
                        save_ip!();
                        let sym = obj_as::<Symbol>((*constants.add(sym_index)).as_object());
                        let receiver = *bp.add(reg);
                        let class = self.get_class(receiver);
                        match (*class).find_method(sym) {
                            Some(method) => call_result!(self.call_value(
                                task,
                                method,
                                bp.add(reg),
                                argc,
                                1
                            )),
                            None => panic_class!(
                                type_error,
                                "Cannot find method '{}' for {}",
                                &(*sym).contents,
                                type_string(receiver)
                            ),
                        }
                    }

                    // ---- closures and upvalues ---------------------------
                    Op::Closure => {
                        let index = <$utype as Decode>::decode(&mut ip) as usize;
                        let info =
                            obj_as::<FunctionInfo>((*constants.add(index)).as_object());
                        self.accumulator = self.make_closure(task, info, fun, bp);
                    }
                    Op::Close => {
                        let reg = <$utype as Decode>::decode(&mut ip) as usize;
                        (*task).close_upvalues(bp.add(reg));
                    }

                    // ---- objects -----------------------------------------
                    Op::NewArray => {
                        let len = <$utype as Decode>::decode(&mut ip) as usize;
                        let reg = <$utype as Decode>::decode(&mut ip) as usize;
                        let array = self.allocate_array(len, Value::null());
                        *bp.add(reg) = Value::from_object(array as *mut ObjHeader);
                    }
                    Op::LoadSubscript => {
                        let reg = <$utype as Decode>::decode(&mut ip) as usize;
                        let object = *bp.add(reg);
                        let subscript = self.accumulator;
                        match self.load_subscript(object, subscript) {
                            Ok(value) => self.accumulator = value,
                            Err(error) => throw_!(error),
                        }
                    }
                    Op::StoreSubscript => {
                        let obj_reg = <$utype as Decode>::decode(&mut ip) as usize;
                        let key_reg = <$utype as Decode>::decode(&mut ip) as usize;
                        let object = *bp.add(obj_reg);
                        let subscript = *bp.add(key_reg);
                        let value = self.accumulator;
                        if let Err(error) = self.store_subscript(object, subscript, value) {
                            throw_!(error);
                        }
                    }
                    Op::StoreArrayUnchecked => {
                        let reg = <$utype as Decode>::decode(&mut ip) as usize;
                        let index = <$utype as Decode>::decode(&mut ip) as usize;
                        let array = obj_as::<Array>((*bp.add(reg)).as_object());
                        (*array).inner[index] = self.accumulator;
                    }
                    Op::LoadProperty => {
                        let sym_index = <$utype as Decode>::decode(&mut ip) as usize;
                        let sym = obj_as::<Symbol>((*constants.add(sym_index)).as_object());
                        let object = self.accumulator;
                        match value_as::<Instance>(object) {
                            Some(instance) => {
                                match (*instance).properties.get(&crate::object::SymbolKey(sym))
                                {
                                    Some(&value) => self.accumulator = value,
                                    None => panic_class!(
                                        error,
                                        "{} has no property '{}'",
                                        type_string(object),
                                        &(*sym).contents
                                    ),
                                }
                            }
                            None => panic_class!(
                                type_error,
                                "Cannot read property '{}' of type {}",
                                &(*sym).contents,
                                type_string(object)
                            ),
                        }
                    }
                    Op::StoreProperty => {
                        let reg = <$utype as Decode>::decode(&mut ip) as usize;
                        let sym_index = <$utype as Decode>::decode(&mut ip) as usize;
                        let sym = obj_as::<Symbol>((*constants.add(sym_index)).as_object());
                        let object = *bp.add(reg);
                        match value_as::<Instance>(object) {
                            Some(instance) => {
                                (*instance)
                                    .properties
                                    .insert(crate::object::SymbolKey(sym), self.accumulator);
                            }
                            None => panic_class!(
                                type_error,
                                "Cannot set property '{}' of type {}",
                                &(*sym).contents,
                                type_string(object)
                            ),
                        }
                    }
                    Op::MakeClass => {
                        let sym_index = <$utype as Decode>::decode(&mut ip) as usize;
                        let sym = obj_as::<Symbol>((*constants.add(sym_index)).as_object());
                        let name = (*sym).contents.to_string();
                        let class =
                            self.allocate_class(&name, self.builtin_classes.object, false);
                        self.accumulator = Value::from_object(class as *mut ObjHeader);
                    }
                    Op::StoreMethod => {
                        let reg = <$utype as Decode>::decode(&mut ip) as usize;
                        let sym_index = <$utype as Decode>::decode(&mut ip) as usize;
                        let sym = obj_as::<Symbol>((*constants.add(sym_index)).as_object());
                        let class_value = *bp.add(reg);
                        let method = self.accumulator;
                        let method_ok = method.is_object()
                            && (obj_is::<Function>(method.as_object())
                                || obj_is::<NativeFunction>(method.as_object()));
                        match value_as::<Class>(class_value) {
                            Some(class) if method_ok => {
                                (*class)
                                    .methods
                                    .insert(crate::object::SymbolKey(sym), method);
                            }
                            _ => panic_class!(
                                type_error,
                                "Cannot define method '{}' on {} with {}",
                                &(*sym).contents,
                                type_string(class_value),
                                type_string(method)
                            ),
                        }
                    }
                    Op::ToString => {
                        let string = self.to_string(self.accumulator);
                        self.accumulator = Value::from_object(string as *mut ObjHeader);
                    }

                    // ---- exceptions, return, task control ----------------
                    Op::Throw => {
                        throw_!(self.accumulator);
                    }
                    Op::Return => {
                        (*task).close_upvalues(bp);
                        (*task).frames.pop();
                        if (*task).frames.is_empty() {
                            (*task).stack_top = (*task).stack_base();
                            self.return_value = self.accumulator;
                            return StepResult::Done;
                        }
                        reload_frame!();
                    }
                    Op::Exit => {
                        (*task).close_upvalues((*task).stack_base());
                        (*task).frames.clear();
                        (*task).stack_top = (*task).stack_base();
                        self.return_value = self.accumulator;
                        return StepResult::Done;
                    }
                    Op::Yield => {
                        save_ip!();
                        return StepResult::Yield;
                    }
                }
            }};
        }

        loop {
            let byte = <u8 as Decode>::decode(&mut ip);
            let Some(op) = Op::from_byte(byte) else {
                unreachable!("invalid opcode byte {byte}");
            };
            match op {
                Op::Wide => {
                    let byte = <u8 as Decode>::decode(&mut ip);
                    let Some(op) = Op::from_byte(byte) else {
                        unreachable!("invalid opcode byte {byte}");
                    };
                    dispatch_op!(op, u16, i16, 1)
                }
                Op::ExtraWide => {
                    let byte = <u8 as Decode>::decode(&mut ip);
                    let Some(op) = Op::from_byte(byte) else {
                        unreachable!("invalid opcode byte {byte}");
                    };
                    dispatch_op!(op, u32, i32, 1)
                }
                op => dispatch_op!(op, u8, i8, 0),
            }
        }
    }

    // =========================================================================
    // Call dispatch
    // =========================================================================

    /// Dispatch a call with `argc` values already placed at `slots`
    /// (receiver first for method calls). `native_receiver` is 1 when
    /// `slots[0]` is a receiver that native arities do not count.
    unsafe fn call_value(
        &mut self,
        task: *mut Task,
        callee: Value,
        slots: *mut Value,
        argc: usize,
        native_receiver: usize,
    ) -> CallAction {
        if !callee.is_object() {
            return self.call_type_error(callee);
        }
        let object = callee.as_object();
        if obj_is::<Function>(object) {
            let function = obj_as::<Function>(object);
            let info = (*function).function_info;
            if (*info).arity as usize != argc {
                let error = self.create_error(
                    self.builtin_classes.type_error,
                    &format!(
                        "Function '{}' takes {} arguments but {} given",
                        (*info).name,
                        (*info).arity,
                        argc
                    ),
                );
                return CallAction::Throw(error);
            }
            if (*task).frames.len() == MAX_FRAMES
                || slots.add((*info).max_registers as usize) > (*task).stack_end()
            {
                self.fatal_error("Stack overflow");
                return CallAction::Fatal;
            }
            // Registers past the arguments may hold stale values from dead
            // frames; clear them so the GC never traces garbage.
            for i in argc..(*info).max_registers as usize {
                *slots.add(i) = Value::empty();
            }
            (*task).frames.push(crate::task::Frame {
                bp: slots,
                f: function,
                ip: (*info).bytecode.as_ptr(),
            });
            (*task).stack_top = slots.add((*info).max_registers as usize);
            return CallAction::Frame;
        }
        if obj_is::<Class>(object) {
            // Calling a class runs its `construct` method. The compiler
            // leaves the receiver slot free: arguments sit at `slots[1..]`,
            // and the class itself becomes `slots[0]`.
            let class = obj_as::<Class>(object);
            let construct = self.intern("construct");
            return match (*class).find_method(construct) {
                Some(method) => {
                    *slots = callee;
                    self.call_value(task, method, slots, argc + 1, 1)
                }
                None => {
                    let error = self.create_error(
                        self.builtin_classes.type_error,
                        &format!("Class {} has no constructor", (*class).name),
                    );
                    CallAction::Throw(error)
                }
            };
        }
        if obj_is::<NativeFunction>(object) {
            let native = obj_as::<NativeFunction>(object);
            let expected = (*native).arity as usize;
            if argc < native_receiver || argc - native_receiver != expected {
                let error = self.create_error(
                    self.builtin_classes.type_error,
                    &format!(
                        "Function '{}' takes {} arguments but {} given",
                        (*native).name,
                        expected,
                        argc - native_receiver.min(argc)
                    ),
                );
                return CallAction::Throw(error);
            }
            let callback = (*native).callback;
            if callback(self, slots) {
                CallAction::NativeOk
            } else {
                CallAction::Throw(self.return_value)
            }
        } else {
            self.call_type_error(callee)
        }
    }

    unsafe fn call_type_error(&mut self, callee: Value) -> CallAction {
        let error = self.create_error(
            self.builtin_classes.type_error,
            &format!("Cannot call type {}", type_string(callee)),
        );
        CallAction::Throw(error)
    }

    // =========================================================================
    // Closures
    // =========================================================================

    /// Allocate a closure over `info`, capturing upvalues per its
    /// descriptors: locals from the current frame's slots, the rest from
    /// the enclosing function's cells.
    unsafe fn make_closure(
        &mut self,
        task: *mut Task,
        info: *mut FunctionInfo,
        enclosing: *mut Function,
        bp: *mut Value,
    ) -> Value {
        let count = (*info).upvalues.len();
        let function = self.allocate_function(info, count);
        self.temp_roots
            .push(Value::from_object(function as *mut ObjHeader));
        for i in 0..count {
            let descriptor = (*info).upvalues[i];
            let cell = if descriptor.is_local {
                self.capture_upvalue(task, bp.add(descriptor.index as usize))
            } else {
                (*enclosing).upvalues[descriptor.index as usize]
            };
            (*function).upvalues[i] = cell;
        }
        self.temp_roots.pop();
        Value::from_object(function as *mut ObjHeader)
    }

    /// Find or create the open upvalue for a stack slot. The per-task list
    /// is sorted by descending address so the scan stops at the insertion
    /// point.
    unsafe fn capture_upvalue(
        &mut self,
        task: *mut Task,
        location: *mut Value,
    ) -> *mut crate::function::UpValue {
        let mut previous: *mut crate::function::UpValue = std::ptr::null_mut();
        let mut current = (*task).open_upvalues;
        while !current.is_null() && (*current).location > location {
            previous = current;
            current = (*current).next;
        }
        if !current.is_null() && (*current).location == location {
            return current;
        }
        let created = self.allocate_upvalue(location);
        (*created).next = current;
        if previous.is_null() {
            (*task).open_upvalues = created;
        } else {
            (*previous).next = created;
        }
        created
    }

    // =========================================================================
    // Arithmetic and subscripts shared across widths
    // =========================================================================

    unsafe fn arith_divide(&mut self, lhs: Value, rhs: Value) -> Result<Value, Value> {
        if lhs.is_int() && rhs.is_int() {
            let (a, b) = (lhs.as_int(), rhs.as_int());
            if b == 0 {
                return Err(self.create_error(
                    self.builtin_classes.error,
                    &format!("Cannot divide {a} by zero"),
                ));
            }
            return match a.checked_div(b) {
                Some(result) => Ok(Value::from_int(result)),
                None => Err(self.create_error(
                    self.builtin_classes.overflow_error,
                    &format!("Cannot divide {a} and {b} as the result does not fit in an Int"),
                )),
            };
        }
        if lhs.is_float() && rhs.is_float() {
            return Ok(Value::from_float(lhs.as_float() / rhs.as_float()));
        }
        if lhs.is_int() && rhs.is_float() {
            return Ok(Value::from_float(lhs.as_int() as f64 / rhs.as_float()));
        }
        if lhs.is_float() && rhs.is_int() {
            return Ok(Value::from_float(lhs.as_float() / rhs.as_int() as f64));
        }
        Err(self.create_error(
            self.builtin_classes.type_error,
            &format!(
                "Cannot divide types {} and {}",
                type_string(lhs),
                type_string(rhs)
            ),
        ))
    }

    unsafe fn arith_mod(&mut self, lhs: Value, rhs: Value) -> Result<Value, Value> {
        if lhs.is_int() && rhs.is_int() {
            let (a, b) = (lhs.as_int(), rhs.as_int());
            if b == 0 {
                return Err(self.create_error(
                    self.builtin_classes.error,
                    &format!("Cannot mod {a} by zero"),
                ));
            }
            // i32::MIN % -1 is defined to be 0.
            if b == -1 {
                return Ok(Value::from_int(0));
            }
            return Ok(Value::from_int(a % b));
        }
        if lhs.is_float() && rhs.is_float() {
            return Ok(Value::from_float(lhs.as_float() % rhs.as_float()));
        }
        if lhs.is_int() && rhs.is_float() {
            return Ok(Value::from_float(lhs.as_int() as f64 % rhs.as_float()));
        }
        if lhs.is_float() && rhs.is_int() {
            return Ok(Value::from_float(lhs.as_float() % rhs.as_int() as f64));
        }
        Err(self.create_error(
            self.builtin_classes.type_error,
            &format!(
                "Cannot mod types {} and {}",
                type_string(lhs),
                type_string(rhs)
            ),
        ))
    }

    unsafe fn load_subscript(&mut self, object: Value, subscript: Value) -> Result<Value, Value> {
        if let Some(array) = value_as::<Array>(object) {
            if !subscript.is_int() {
                return Err(self.create_error(
                    self.builtin_classes.type_error,
                    &format!("Array indices must be Int not {}", type_string(subscript)),
                ));
            }
            let index = subscript.as_int();
            if index < 0 || index as usize >= (*array).inner.len() {
                return Err(self.create_error(
                    self.builtin_classes.index_error,
                    "Array index out of range",
                ));
            }
            return Ok((*array).inner[index as usize]);
        }
        if let Some(map) = value_as::<Map>(object) {
            return match (*map).inner.get(&HashKey(subscript)) {
                Some(&value) => Ok(value),
                None => Err(self.create_error(
                    self.builtin_classes.key_error,
                    &format!("Key {} does not exist in map", self.format_value(subscript)),
                )),
            };
        }
        Err(self.create_error(
            self.builtin_classes.type_error,
            &format!("Cannot index type {}", type_string(object)),
        ))
    }

    unsafe fn store_subscript(
        &mut self,
        object: Value,
        subscript: Value,
        value: Value,
    ) -> Result<(), Value> {
        if let Some(array) = value_as::<Array>(object) {
            if !subscript.is_int() {
                return Err(self.create_error(
                    self.builtin_classes.type_error,
                    &format!("Array indices must be Int not {}", type_string(subscript)),
                ));
            }
            let index = subscript.as_int();
            if index < 0 || index as usize >= (*array).inner.len() {
                return Err(self.create_error(
                    self.builtin_classes.index_error,
                    "Array index out of range",
                ));
            }
            (*array).inner[index as usize] = value;
            return Ok(());
        }
        if let Some(map) = value_as::<Map>(object) {
            (*map).inner.insert(HashKey(subscript), value);
            return Ok(());
        }
        Err(self.create_error(
            self.builtin_classes.type_error,
            &format!("Cannot index type {}", type_string(object)),
        ))
    }

    /// Reverse lookup of a module-variable slot for error messages.
    pub(crate) fn module_variable_name(&self, index: u32) -> String {
        for (module, names) in &self.module_variable_names {
            for (name, var) in names {
                if var.index == index {
                    return format!("{module}.{name}");
                }
            }
        }
        format!("<slot {index}>")
    }
}
