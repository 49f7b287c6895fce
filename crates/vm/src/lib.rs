//! Tern VM: the execution core of the Tern scripting language
//!
//! A register-based bytecode virtual machine with NaN-boxed values, a
//! tracing mark-sweep garbage collector, first-class closures with shared
//! upvalues, methods on built-in and user-defined classes, cooperative
//! tasks and native-function interop.
//!
//! The compiler front-end drives the [`emitter::FunctionInfoWriter`] to
//! produce bytecode; embedders construct a VM with [`vm::new_vm`], register
//! natives and EFuncs, and execute with [`vm::VM::run`].
//!
//! # Modules
//!
//! - `op`: opcode definitions and width-prefix encoding
//! - `object`: heap object layouts, value equality/hashing, string search
//! - `function`: compiled functions, closures and upvalue cells
//! - `gc`: allocation and tri-color mark-sweep collection
//! - `interner`: weak symbol table (content-unique symbols)
//! - `emitter`: compiler-facing bytecode writer and disassembler
//! - `interpreter`: the accumulator/register dispatch loop
//! - `builtins`: native methods and the `vm`/`math`/`random` modules
//! - `task`: cooperative tasks, frames, the value stack
//! - `handle`: host-held GC roots
//! - `efunc`: symbol-dispatched host callbacks

#![allow(dangerous_implicit_autorefs)]

pub mod efunc;
pub mod emitter;
pub mod function;
pub mod handle;
pub mod interner;
pub mod object;
pub mod op;
pub mod task;
pub mod vm;

mod builtins;
mod gc;
mod interpreter;

pub use tern_core::{ObjHeader, ObjType, Value};

pub use efunc::{EFuncContext, EFuncStatus};
pub use emitter::{disassemble, EmitError, FunctionInfoWriter};
pub use handle::Handle;
pub use op::Op;
pub use task::{Task, TaskStatus};
pub use vm::{new_vm, VMResult, VMStatus, VM};
