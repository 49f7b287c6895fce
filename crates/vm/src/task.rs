//! Tasks and call frames
//!
//! A task is one cooperative execution context: its own value stack, its
//! own frame vector and its own open-upvalue list. Exactly one task is the
//! VM's `current_task` while executing; the rest sit in the ready queue.
//! Tasks never run concurrently, so the GC always sees a consistent graph.

use tern_core::{ObjHeader, ObjType, Value};

use crate::function::{Function, UpValue};
use crate::object::{GcObject, TernString};

/// Call-depth limit. Hitting it is a fatal, uncatchable error.
pub const MAX_FRAMES: usize = 1024;

/// Values per task stack. Fixed so stack slots never move and open upvalues
/// can point straight into them.
pub const STACK_SIZE: usize = 128 * 1024;

/// One suspended call: register window base, executing closure, saved
/// instruction pointer.
#[derive(Clone, Copy)]
pub struct Frame {
    pub bp: *mut Value,
    pub f: *mut Function,
    pub ip: *const u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Suspended,
    Success,
    Error,
}

#[repr(C)]
pub struct Task {
    pub header: ObjHeader,
    /// Optional task name, shown by the formatter. Null when unnamed.
    pub name: *mut TernString,
    pub stack: Box<[Value]>,
    pub stack_top: *mut Value,
    pub frames: Vec<Frame>,
    /// Head of the open-upvalue list, sorted by descending stack address.
    pub open_upvalues: *mut UpValue,
    pub status: TaskStatus,
    /// Set by `VM::cancel_task`; observed at the next resume, which unwinds
    /// with this value through the exception path. Empty when no
    /// cancellation is pending.
    pub cancel_value: Value,
}

impl GcObject for Task {
    const TYPE: ObjType = ObjType::Task;
}

impl Task {
    pub fn stack_base(&mut self) -> *mut Value {
        self.stack.as_mut_ptr()
    }

    pub fn stack_end(&mut self) -> *mut Value {
        unsafe { self.stack.as_mut_ptr().add(STACK_SIZE) }
    }

    /// Close every open upvalue whose location is at or above `last`:
    /// copy the stack slot into the cell and repoint the cell at itself.
    /// The list is sorted by descending address, so this pops a prefix.
    pub unsafe fn close_upvalues(&mut self, last: *mut Value) {
        while !self.open_upvalues.is_null() && (*self.open_upvalues).location >= last {
            let upvalue = self.open_upvalues;
            (*upvalue).closed = *(*upvalue).location;
            (*upvalue).location = &mut (*upvalue).closed;
            self.open_upvalues = (*upvalue).next;
            (*upvalue).next = std::ptr::null_mut();
        }
    }
}
