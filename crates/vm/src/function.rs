//! Functions, closures and upvalues
//!
//! `FunctionInfo` is the compiled form of one function: bytecode, constant
//! pool, line table, upvalue descriptors and exception handlers. It is a
//! heap object so the GC keeps the constants alive for as long as any
//! closure over it exists. `Function` is a closure: a `FunctionInfo` plus
//! captured upvalue cells.

use tern_core::{ObjHeader, ObjType, Value};

use crate::object::GcObject;
use crate::vm::VM;

/// Bytecode offset → source line. Only recorded when the line changes.
#[derive(Debug, Clone, Copy)]
pub struct LineInfo {
    pub offset: u32,
    pub line: u32,
}

/// How a closure captures one upvalue: a slot of the enclosing frame
/// (`is_local`) or an upvalue of the enclosing function.
#[derive(Debug, Clone, Copy)]
pub struct UpvalueInfo {
    pub index: u16,
    pub is_local: bool,
}

/// One `try` region. `ip` offsets in `[try_begin, try_end)` are covered;
/// the thrown value lands in `error_reg` and execution resumes at
/// `catch_begin`.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionHandler {
    pub try_begin: u32,
    pub try_end: u32,
    pub error_reg: u16,
    pub catch_begin: u32,
}

#[repr(C)]
pub struct FunctionInfo {
    pub header: ObjHeader,
    pub name: String,
    pub module: String,
    pub arity: u8,
    pub max_registers: u16,
    pub bytecode: Vec<u8>,
    pub constants: Vec<Value>,
    pub lines: Vec<LineInfo>,
    pub upvalues: Vec<UpvalueInfo>,
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl GcObject for FunctionInfo {
    const TYPE: ObjType = ObjType::FunctionInfo;
}

impl FunctionInfo {
    /// Source line for a bytecode offset, from the change-points table.
    pub fn line_at(&self, offset: u32) -> u32 {
        let mut line = 0;
        for info in &self.lines {
            if info.offset > offset {
                break;
            }
            line = info.line;
        }
        line
    }

    /// Innermost handler covering a saved instruction pointer. A saved ip
    /// points just past its instruction, so an instruction starting at
    /// `try_begin` or ending at `try_end` is covered: the test is
    /// `try_begin < offset <= try_end`. Handlers are emitted outermost
    /// first, so the last match wins.
    pub fn handler_at(&self, offset: u32) -> Option<ExceptionHandler> {
        self.exception_handlers
            .iter()
            .rev()
            .find(|h| h.try_begin < offset && offset <= h.try_end)
            .copied()
    }
}

/// A closure: compiled code plus captured upvalue cells.
#[repr(C)]
pub struct Function {
    pub header: ObjHeader,
    pub function_info: *mut FunctionInfo,
    pub upvalues: Box<[*mut UpValue]>,
}

impl GcObject for Function {
    const TYPE: ObjType = ObjType::Function;
}

/// Shared storage cell for a captured variable.
///
/// While open, `location` points at a live stack slot of the owning task and
/// `next` threads the task's open-upvalue list (sorted by descending stack
/// address). Closing copies the slot into `closed` and repoints `location`
/// at it, after which the cell is self-contained.
#[repr(C)]
pub struct UpValue {
    pub header: ObjHeader,
    pub location: *mut Value,
    pub next: *mut UpValue,
    pub closed: Value,
}

impl GcObject for UpValue {
    const TYPE: ObjType = ObjType::UpValue;
}

/// Success → result in `vm.return_value`; failure → a pre-built error
/// value in `vm.return_value`, which the interpreter then throws.
pub type NativeFunctionCallback = fn(&mut VM, *mut Value) -> bool;

/// A function implemented by the host. Runs to completion inside the
/// caller's frame; never suspends.
#[repr(C)]
pub struct NativeFunction {
    pub header: ObjHeader,
    pub arity: u8,
    pub name: String,
    pub module_name: String,
    pub callback: NativeFunctionCallback,
}

impl GcObject for NativeFunction {
    const TYPE: ObjType = ObjType::NativeFunction;
}
