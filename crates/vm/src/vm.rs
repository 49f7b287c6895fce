//! The virtual machine
//!
//! `VM` owns everything: the GC'd heap, the symbol interner, module
//! variables and globals, builtin classes, tasks, host handles and EFuncs.
//! There is no process-wide state; embedders create as many VMs as they
//! like, each fully independent.
//!
//! The host-facing API lives here: `new_vm`, `run`, globals and module
//! variables, native function registration, handles and EFuncs. The
//! dispatch loop itself is in `interpreter`, allocation and collection in
//! `gc`, builtin classes and modules in `builtins`.

use std::collections::HashMap;

use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::SeedableRng;

use tern_core::{fnv1a, ObjHeader, Value};

use crate::efunc::EFunc;
use crate::emitter::FunctionInfoWriter;
use crate::function::{Function, NativeFunctionCallback};
use crate::handle::{Handle, HandleList};
use crate::interner::SymbolTable;
use crate::interpreter::StepResult;
use crate::object::{
    format_value, obj_as, value_as, Class, Instance, Module, Symbol, SymbolKey, TernString,
};
use crate::task::{Frame, Task, TaskStatus};

pub const INITIAL_HEAP_SIZE: usize = 10 * 1024 * 1024;
pub const HEAP_GROWTH_FACTOR: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VMStatus {
    Success,
    Error,
}

/// Outcome of one `run`: the formatted result (eval mode) or the formatted
/// uncaught error, plus the captured stack trace on error.
#[derive(Debug, Clone)]
pub struct VMResult {
    pub status: VMStatus,
    pub result: String,
    pub stack_trace: String,
}

pub(crate) struct Global {
    pub name: String,
    pub value: Value,
}

/// Emit-time metadata for one module variable.
#[derive(Clone, Copy)]
pub struct ModuleVariable {
    pub index: u32,
    pub mutable: bool,
    pub exported: bool,
}

/// Pre-registered classes for every built-in type plus the error hierarchy.
pub struct BuiltinClasses {
    pub object: *mut Class,
    pub class_: *mut Class,
    pub int: *mut Class,
    pub float: *mut Class,
    pub bool_: *mut Class,
    pub null: *mut Class,
    pub string: *mut Class,
    pub symbol: *mut Class,
    pub array: *mut Class,
    pub map: *mut Class,
    pub function: *mut Class,
    pub module: *mut Class,
    pub task: *mut Class,
    pub range: *mut Class,
    pub array_iterator: *mut Class,
    pub map_iterator: *mut Class,
    pub string_iterator: *mut Class,
    pub error: *mut Class,
    pub type_error: *mut Class,
    pub overflow_error: *mut Class,
    pub index_error: *mut Class,
    pub key_error: *mut Class,
    pub name_error: *mut Class,
}

impl BuiltinClasses {
    fn empty() -> Self {
        let n = std::ptr::null_mut();
        BuiltinClasses {
            object: n,
            class_: n,
            int: n,
            float: n,
            bool_: n,
            null: n,
            string: n,
            symbol: n,
            array: n,
            map: n,
            function: n,
            module: n,
            task: n,
            range: n,
            array_iterator: n,
            map_iterator: n,
            string_iterator: n,
            error: n,
            type_error: n,
            overflow_error: n,
            index_error: n,
            key_error: n,
            name_error: n,
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = *mut Class> {
        [
            self.object,
            self.class_,
            self.int,
            self.float,
            self.bool_,
            self.null,
            self.string,
            self.symbol,
            self.array,
            self.map,
            self.function,
            self.module,
            self.task,
            self.range,
            self.array_iterator,
            self.map_iterator,
            self.string_iterator,
            self.error,
            self.type_error,
            self.overflow_error,
            self.index_error,
            self.key_error,
            self.name_error,
        ]
        .into_iter()
        .filter(|c| !c.is_null())
    }
}

pub struct VM {
    // GC state
    pub(crate) bytes_allocated: usize,
    pub(crate) threshhold: usize,
    pub(crate) first_obj: *mut ObjHeader,
    pub(crate) greyobjects: Vec<*mut ObjHeader>,
    /// LIFO scratch roots for natives and the emitter.
    pub(crate) temp_roots: Vec<Value>,
    pub(crate) handles: HandleList,

    // Interning
    pub(crate) symbols: SymbolTable,

    // Globals and modules
    pub(crate) globals: Vec<Global>,
    pub(crate) module_variables: Vec<Value>,
    pub(crate) modules: HashMap<String, *mut Module>,
    pub(crate) module_variable_names: HashMap<String, IndexMap<String, ModuleVariable>>,

    // Tasks
    pub(crate) root_task: *mut Task,
    pub(crate) current_task: *mut Task,
    pub(crate) ready_queue: Vec<*mut Task>,

    // Execution state, rooted by the GC
    pub return_value: Value,
    pub(crate) accumulator: Value,
    pub(crate) last_panic: Option<String>,
    pub(crate) stack_trace: String,

    pub builtin_classes: BuiltinClasses,
    pub(crate) efuncs: HashMap<SymbolKey, EFunc>,
    pub(crate) rng: StdRng,
}

/// Construct a VM with the prelude classes and the `vm`, `math` and
/// `random` modules loaded.
pub fn new_vm() -> VM {
    let mut vm = VM {
        bytes_allocated: 0,
        threshhold: INITIAL_HEAP_SIZE,
        first_obj: std::ptr::null_mut(),
        greyobjects: Vec::new(),
        temp_roots: Vec::new(),
        handles: HandleList::new(),
        symbols: SymbolTable::new(),
        globals: Vec::new(),
        module_variables: Vec::new(),
        modules: HashMap::new(),
        module_variable_names: HashMap::new(),
        root_task: std::ptr::null_mut(),
        current_task: std::ptr::null_mut(),
        ready_queue: Vec::new(),
        return_value: Value::null(),
        accumulator: Value::null(),
        last_panic: None,
        stack_trace: String::new(),
        builtin_classes: BuiltinClasses::empty(),
        efuncs: HashMap::new(),
        rng: StdRng::from_entropy(),
    };
    vm.create_module("<prelude>");
    let root = vm.allocate_task(std::ptr::null_mut());
    vm.root_task = root;
    vm.current_task = root;
    crate::builtins::declare_native_builtins(&mut vm);
    tracing::debug!("vm ready");
    vm
}

impl VM {
    // =========================================================================
    // Interning and strings
    // =========================================================================

    /// Return the unique symbol for `contents`, creating it if needed.
    pub fn intern(&mut self, contents: &str) -> *mut Symbol {
        let hash = fnv1a(contents.as_bytes());
        if let Some(sym) = unsafe { self.symbols.find(hash, contents) } {
            return sym;
        }
        let sym = self.allocate_symbol(contents, hash);
        unsafe { self.symbols.insert(sym) };
        sym
    }

    /// Concatenate two strings into a new allocation.
    pub fn concat(&mut self, a: *mut TernString, b: *mut TernString) -> *mut TernString {
        let mut s = String::with_capacity(unsafe { (*a).contents.len() + (*b).contents.len() });
        unsafe {
            s.push_str(&(*a).contents);
            s.push_str(&(*b).contents);
        }
        self.allocate_string(&s)
    }

    /// Script-facing conversion. Strings pass through unchanged; everything
    /// else gets its formatted representation.
    pub fn to_string(&mut self, v: Value) -> *mut TernString {
        if let Some(s) = unsafe { value_as::<TernString>(v) } {
            return s;
        }
        let repr = self.format_value(v);
        self.allocate_string(&repr)
    }

    pub fn format_value(&self, v: Value) -> String {
        let mut out = String::new();
        unsafe { format_value(&mut out, v, 0) };
        out
    }

    // =========================================================================
    // Classes and errors
    // =========================================================================

    /// The class of any value. Built-in kinds map to their pre-registered
    /// classes; instances report their own class.
    pub fn get_class(&self, v: Value) -> *mut Class {
        let b = &self.builtin_classes;
        if v.is_int() {
            return b.int;
        }
        if v.is_float() {
            return b.float;
        }
        if v.is_bool() {
            return b.bool_;
        }
        if v.is_null() {
            return b.null;
        }
        debug_assert!(v.is_object());
        unsafe {
            let o = v.as_object();
            use tern_core::ObjType::*;
            match (*o).ty {
                String => b.string,
                Symbol => b.symbol,
                Array => b.array,
                Map => b.map,
                Range => b.range,
                ArrayIterator => b.array_iterator,
                MapIterator => b.map_iterator,
                StringIterator => b.string_iterator,
                Class => b.class_,
                Instance => (*obj_as::<crate::object::Instance>(o)).class,
                Function | NativeFunction => b.function,
                Module => b.module,
                Task => b.task,
                FunctionInfo | UpValue => b.object,
            }
        }
    }

    /// Build an error instance: `Instance { message: <msg> }` of the given
    /// error class.
    pub fn create_error(&mut self, class: *mut Class, message: &str) -> Value {
        // Root each piece across the following allocations.
        let sym = self.intern("message");
        self.temp_roots.push(Value::from_object(sym as *mut ObjHeader));
        let msg = self.allocate_string(message);
        self.temp_roots.push(Value::from_object(msg as *mut ObjHeader));
        let instance = self.allocate_instance(class);
        unsafe {
            (*instance)
                .properties
                .insert(SymbolKey(sym), Value::from_object(msg as *mut ObjHeader));
        }
        self.temp_roots.pop();
        self.temp_roots.pop();
        Value::from_object(instance as *mut ObjHeader)
    }

    /// `ClassName: message` for error instances, plain formatting otherwise.
    pub fn format_error(&mut self, v: Value) -> String {
        unsafe {
            if let Some(instance) = value_as::<Instance>(v) {
                let sym = self.intern("message");
                if let Some(&msg) = (*instance).properties.get(&SymbolKey(sym)) {
                    let class_name = &(*(*instance).class).name;
                    if let Some(s) = value_as::<TernString>(msg) {
                        return format!("{}: {}", class_name, &(*s).contents);
                    }
                    return format!("{}: {}", class_name, self.format_value(msg));
                }
            }
        }
        self.format_value(v)
    }

    // =========================================================================
    // Globals and module variables
    // =========================================================================

    /// Declare a global slot. Slots are addressed by declaration order and
    /// never reused.
    pub fn add_global(&mut self, name: &str) -> u32 {
        self.globals.push(Global {
            name: name.to_string(),
            value: Value::empty(),
        });
        (self.globals.len() - 1) as u32
    }

    pub fn global_count(&self) -> u32 {
        self.globals.len() as u32
    }

    pub(crate) fn global_name(&self, index: u32) -> &str {
        &self.globals[index as usize].name
    }

    /// Create a module. Returns false if it already exists.
    pub fn create_module(&mut self, name: &str) -> bool {
        if self.modules.contains_key(name) {
            return false;
        }
        let module = self.allocate_module(name);
        self.modules.insert(name.to_string(), module);
        self.module_variable_names
            .insert(name.to_string(), IndexMap::new());
        true
    }

    pub fn get_module(&self, name: &str) -> Option<*mut Module> {
        self.modules.get(name).copied()
    }

    /// Declare a module variable, returning its slot index. Fails (None) for
    /// unknown modules or duplicate names; the emitter treats that as an
    /// emit-time error.
    pub fn add_module_variable(
        &mut self,
        module: &str,
        name: &str,
        mutable: bool,
        exported: bool,
    ) -> Option<u32> {
        let index = self.module_variables.len() as u32;
        let names = self.module_variable_names.get_mut(module)?;
        if names.contains_key(name) {
            return None;
        }
        names.insert(
            name.to_string(),
            ModuleVariable {
                index,
                mutable,
                exported,
            },
        );
        self.module_variables.push(Value::empty());
        if exported {
            let module_obj = *self.modules.get(module)?;
            unsafe { (*module_obj).module_variables.push(index) };
        }
        Some(index)
    }

    /// Emit-time resolution of a module variable reference.
    pub fn module_variable(&self, module: &str, name: &str) -> Option<ModuleVariable> {
        self.module_variable_names.get(module)?.get(name).copied()
    }

    pub(crate) fn set_module_variable(&mut self, index: u32, value: Value) {
        self.module_variables[index as usize] = value;
    }

    // =========================================================================
    // Native functions, handles, EFuncs
    // =========================================================================

    /// Register a native function as a module variable of `module`.
    pub fn declare_native_function(
        &mut self,
        module: &str,
        name: &str,
        exported: bool,
        arity: u8,
        callback: NativeFunctionCallback,
    ) {
        let nf = self.allocate_native_function(name, module, arity, callback);
        let index = self
            .add_module_variable(module, name, false, exported)
            .unwrap_or_else(|| panic!("duplicate native function {module}.{name}"));
        self.set_module_variable(index, Value::from_object(nf as *mut ObjHeader));
    }

    /// Pin an object across VM calls.
    pub fn make_handle(&mut self, object: *mut ObjHeader) -> *mut Handle {
        self.handles.make(object)
    }

    /// Release a handle created by `make_handle`.
    pub unsafe fn release(&mut self, handle: *mut Handle) {
        self.handles.release(handle);
    }

    /// Register a host callback reachable from scripts via
    /// `vm.ecall(@name, arg)`.
    pub fn register_efunc<F>(&mut self, name: &str, callback: F)
    where
        F: FnMut(&mut crate::efunc::EFuncContext) -> bool + 'static,
    {
        let sym = self.intern(name);
        self.efuncs.insert(SymbolKey(sym), EFunc::new(callback));
    }

    pub fn deregister_efunc(&mut self, name: &str) -> bool {
        let hash = fnv1a(name.as_bytes());
        match unsafe { self.symbols.find(hash, name) } {
            Some(sym) => self.efuncs.remove(&SymbolKey(sym)).is_some(),
            None => false,
        }
    }

    /// Begin a function-info writer. The underlying `FunctionInfo` is kept
    /// alive through a handle for as long as the writer exists.
    pub fn new_function_info(&mut self, name: &str, module: &str, arity: u8) -> FunctionInfoWriter {
        FunctionInfoWriter::new(self, name, module, arity)
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Create a suspended task that will run `function` (arity 0) when the
    /// scheduler reaches it.
    pub fn spawn_task(&mut self, function: *mut Function) -> *mut Task {
        let task = self.allocate_task(std::ptr::null_mut());
        unsafe {
            let info = (*function).function_info;
            debug_assert_eq!((*info).arity, 0, "spawned task functions take no arguments");
            let bp = (*task).stack_base();
            for i in 0..(*info).max_registers as usize {
                *bp.add(i) = Value::empty();
            }
            (*task).frames.push(Frame {
                bp,
                f: function,
                ip: (*info).bytecode.as_ptr(),
            });
            (*task).stack_top = bp.add((*info).max_registers as usize);
            (*task).status = TaskStatus::Suspended;
        }
        self.ready_queue.push(task);
        tracing::debug!(task = ?task, "task spawned");
        task
    }

    /// Request cancellation: the task unwinds with `value` at its next
    /// resume.
    pub fn cancel_task(&mut self, task: *mut Task, value: Value) {
        unsafe {
            if matches!((*task).status, TaskStatus::Running | TaskStatus::Suspended) {
                (*task).cancel_value = value;
            }
        }
    }

    // =========================================================================
    // Running
    // =========================================================================

    /// Execute `function` on the root task. With `eval` the formatted result
    /// value is returned in `VMResult::result`.
    pub fn run(&mut self, function: *mut Function, eval: bool) -> VMResult {
        unsafe {
            let root = self.root_task;
            (*root).frames.clear();
            (*root).open_upvalues = std::ptr::null_mut();
            let bp = (*root).stack_base();
            let info = (*function).function_info;
            for i in 0..(*info).max_registers as usize {
                *bp.add(i) = Value::empty();
            }
            (*root).frames.push(Frame {
                bp,
                f: function,
                ip: (*info).bytecode.as_ptr(),
            });
            (*root).stack_top = bp.add((*info).max_registers as usize);
            (*root).status = TaskStatus::Running;
            self.current_task = root;
            self.last_panic = None;
            self.stack_trace.clear();

            loop {
                let step = self.execute_current();
                let task = self.current_task;
                match step {
                    StepResult::Done => {
                        (*task).status = TaskStatus::Success;
                        if task == root {
                            break;
                        }
                    }
                    StepResult::Error => {
                        debug_assert_eq!((*task).status, TaskStatus::Error);
                        if task == root {
                            break;
                        }
                        tracing::debug!(task = ?task, "task failed");
                    }
                    StepResult::Yield => {
                        (*task).status = TaskStatus::Suspended;
                        self.ready_queue.push(task);
                    }
                }
                // Round-robin to the next runnable task.
                let next = loop {
                    match self.ready_queue.first().copied() {
                        Some(t) => {
                            self.ready_queue.remove(0);
                            if matches!((*t).status, TaskStatus::Suspended) {
                                break t;
                            }
                        }
                        None => break root,
                    }
                };
                if next == root && !matches!((*root).status, TaskStatus::Suspended) {
                    // Root already finished and the queue has drained.
                    break;
                }
                (*next).status = TaskStatus::Running;
                self.current_task = next;
            }

            self.current_task = root;
            if (*root).status == TaskStatus::Success {
                let result = if eval {
                    let value = self.return_value;
                    if let Some(s) = value_as::<TernString>(value) {
                        (*s).contents.to_string()
                    } else {
                        self.format_value(value)
                    }
                } else {
                    String::new()
                };
                VMResult {
                    status: VMStatus::Success,
                    result,
                    stack_trace: String::new(),
                }
            } else {
                VMResult {
                    status: VMStatus::Error,
                    result: self.last_panic.clone().unwrap_or_default(),
                    stack_trace: self.stack_trace.clone(),
                }
            }
        }
    }

    // =========================================================================
    // Unwinding and stack traces
    // =========================================================================

    /// Walk the current task's frames newest-to-oldest for a handler
    /// covering each saved `ip`. Returns true when caught (frames truncated,
    /// thrown value placed in the catch register); false when the task has
    /// transitioned to `Error`.
    pub(crate) unsafe fn throw_value(&mut self, value: Value) -> bool {
        let task = self.current_task;
        for i in (0..(*task).frames.len()).rev() {
            let frame = (*task).frames[i];
            let info = &*(*frame.f).function_info;
            let offset = frame.ip as usize - info.bytecode.as_ptr() as usize;
            if let Some(handler) = info.handler_at(offset as u32) {
                if i + 1 < (*task).frames.len() {
                    let cut = (*task).frames[i + 1].bp;
                    (*task).close_upvalues(cut);
                    (*task).frames.truncate(i + 1);
                }
                let bp = frame.bp;
                let top = (*task).frames.last_mut().unwrap();
                top.ip = info.bytecode.as_ptr().add(handler.catch_begin as usize);
                *bp.add(handler.error_reg as usize) = value;
                (*task).stack_top = bp.add(info.max_registers as usize);
                return true;
            }
        }
        // Uncaught: capture the trace while the frames are intact.
        self.stack_trace = self.generate_stack_trace(0);
        self.last_panic = Some(self.format_error(value));
        (*task).close_upvalues((*task).stack_base());
        (*task).frames.clear();
        (*task).stack_top = (*task).stack_base();
        (*task).status = TaskStatus::Error;
        false
    }

    /// Fatal (uncatchable) failure of the current task: stack overflow and
    /// kin. Bypasses handlers entirely.
    pub(crate) unsafe fn fatal_error(&mut self, message: &str) {
        let task = self.current_task;
        self.stack_trace = self.generate_stack_trace(0);
        self.last_panic = Some(format!("Error: {message}"));
        (*task).close_upvalues((*task).stack_base());
        (*task).frames.clear();
        (*task).stack_top = (*task).stack_base();
        (*task).status = TaskStatus::Error;
    }

    /// Render the current task's frames, newest first, skipping `skip`
    /// frames. Lines map through each function's line table.
    pub fn generate_stack_trace(&self, skip: usize) -> String {
        unsafe {
            let task = self.current_task;
            let mut out = String::new();
            for frame in (*task).frames.iter().rev().skip(skip) {
                let info = &*(*frame.f).function_info;
                let offset = frame.ip as usize - info.bytecode.as_ptr() as usize;
                let line = info.line_at(offset as u32);
                out.push_str(&format!("at {} ({}:{})\n", info.name, info.module, line));
            }
            out
        }
    }
}

impl Drop for VM {
    fn drop(&mut self) {
        // Free every object regardless of reachability.
        let mut cursor = self.first_obj;
        while !cursor.is_null() {
            let next = unsafe { (*cursor).next };
            unsafe { self.drop_object(cursor) };
            cursor = next;
        }
        self.first_obj = std::ptr::null_mut();
    }
}
