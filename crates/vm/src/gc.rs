//! Mark-sweep garbage collector
//!
//! Stop-the-world, tri-color via a grey worklist. Every allocation goes
//! through `allocate_obj`, which links the object into the intrusive
//! all-objects list and may trigger a collection first. The sweep walks
//! that list, prunes dead symbols out of the interner and frees everything
//! unmarked.
//!
//! `bytes_allocated` always equals the summed `object_size` of live
//! objects; the sizes counted for variable payloads are the ones fixed at
//! allocation time (string bytes, closure upvalue slots), so the figure
//! never drifts between allocation and sweep.

use tern_core::{ObjHeader, ObjType, Value};

use crate::function::{Function, FunctionInfo, NativeFunction, UpValue};
use crate::object::{
    obj_as, Array, ArrayIterator, Class, Instance, Map, MapIterator, Module, Range,
    StringIterator, Symbol, TernString,
};
use crate::task::Task;
use crate::vm::{HEAP_GROWTH_FACTOR, INITIAL_HEAP_SIZE, VM};

use crate::object::GcObject;

fn new_header<T: GcObject>() -> ObjHeader {
    ObjHeader {
        ty: T::TYPE,
        is_dark: false,
        next: std::ptr::null_mut(),
    }
}

impl VM {
    /// Allocate and manage a heap object. `extra` is the payload size
    /// charged on top of the struct itself and must match `object_size`.
    fn allocate_obj<T: GcObject>(&mut self, obj: T, extra: usize) -> *mut T {
        let size = std::mem::size_of::<T>() + extra;
        self.bytes_allocated += size;
        if cfg!(feature = "stress-gc") || self.bytes_allocated > self.threshhold {
            self.collect();
        }
        let ptr = Box::into_raw(Box::new(obj));
        let header = ptr as *mut ObjHeader;
        unsafe {
            (*header).is_dark = false;
            (*header).next = self.first_obj;
        }
        self.first_obj = header;
        ptr
    }

    pub fn allocate_string(&mut self, contents: &str) -> *mut TernString {
        self.allocate_obj(
            TernString {
                header: new_header::<TernString>(),
                contents: contents.into(),
            },
            contents.len(),
        )
    }

    /// Only `intern` calls this; symbols are unique per contents.
    pub(crate) fn allocate_symbol(&mut self, contents: &str, hash: u32) -> *mut Symbol {
        self.allocate_obj(
            Symbol {
                header: new_header::<Symbol>(),
                hash,
                contents: contents.into(),
            },
            contents.len(),
        )
    }

    pub fn allocate_array(&mut self, len: usize, fill: Value) -> *mut Array {
        self.allocate_obj(
            Array {
                header: new_header::<Array>(),
                inner: vec![fill; len],
            },
            0,
        )
    }

    pub fn allocate_map(&mut self) -> *mut Map {
        self.allocate_obj(
            Map {
                header: new_header::<Map>(),
                inner: indexmap::IndexMap::new(),
            },
            0,
        )
    }

    pub fn allocate_range(&mut self, start: i32, end: i32) -> *mut Range {
        self.allocate_obj(
            Range {
                header: new_header::<Range>(),
                start,
                end,
            },
            0,
        )
    }

    pub fn allocate_array_iterator(&mut self, array: *mut Array) -> *mut ArrayIterator {
        self.allocate_obj(
            ArrayIterator {
                header: new_header::<ArrayIterator>(),
                array,
                position: 0,
            },
            0,
        )
    }

    pub fn allocate_map_iterator(&mut self, map: *mut Map) -> *mut MapIterator {
        let last_key = unsafe { (*map).inner.first() }
            .map(|(k, _)| k.0)
            .unwrap_or_else(Value::empty);
        self.allocate_obj(
            MapIterator {
                header: new_header::<MapIterator>(),
                map,
                last_key,
            },
            0,
        )
    }

    pub fn allocate_string_iterator(&mut self, string: *mut TernString) -> *mut StringIterator {
        self.allocate_obj(
            StringIterator {
                header: new_header::<StringIterator>(),
                string,
                position: 0,
            },
            0,
        )
    }

    pub fn allocate_class(
        &mut self,
        name: &str,
        super_class: *mut Class,
        is_native: bool,
    ) -> *mut Class {
        self.allocate_obj(
            Class {
                header: new_header::<Class>(),
                name: name.to_string(),
                super_class,
                methods: std::collections::HashMap::new(),
                is_native,
            },
            0,
        )
    }

    pub fn allocate_instance(&mut self, class: *mut Class) -> *mut Instance {
        self.allocate_obj(
            Instance {
                header: new_header::<Instance>(),
                class,
                properties: indexmap::IndexMap::new(),
            },
            0,
        )
    }

    pub fn allocate_module(&mut self, name: &str) -> *mut Module {
        self.allocate_obj(
            Module {
                header: new_header::<Module>(),
                name: name.to_string(),
                module_variables: Vec::new(),
            },
            0,
        )
    }

    pub(crate) fn allocate_function_info(
        &mut self,
        name: &str,
        module: &str,
        arity: u8,
    ) -> *mut FunctionInfo {
        self.allocate_obj(
            FunctionInfo {
                header: new_header::<FunctionInfo>(),
                name: name.to_string(),
                module: module.to_string(),
                arity,
                max_registers: 0,
                bytecode: Vec::new(),
                constants: Vec::new(),
                lines: Vec::new(),
                upvalues: Vec::new(),
                exception_handlers: Vec::new(),
            },
            0,
        )
    }

    /// A closure with `num_upvalues` empty slots, filled in by the
    /// `Closure` opcode.
    pub fn allocate_function(
        &mut self,
        function_info: *mut FunctionInfo,
        num_upvalues: usize,
    ) -> *mut Function {
        self.allocate_obj(
            Function {
                header: new_header::<Function>(),
                function_info,
                upvalues: vec![std::ptr::null_mut(); num_upvalues].into_boxed_slice(),
            },
            num_upvalues * std::mem::size_of::<*mut UpValue>(),
        )
    }

    pub fn allocate_upvalue(&mut self, location: *mut Value) -> *mut UpValue {
        self.allocate_obj(
            UpValue {
                header: new_header::<UpValue>(),
                location,
                next: std::ptr::null_mut(),
                closed: Value::empty(),
            },
            0,
        )
    }

    pub(crate) fn allocate_native_function(
        &mut self,
        name: &str,
        module_name: &str,
        arity: u8,
        callback: crate::function::NativeFunctionCallback,
    ) -> *mut NativeFunction {
        self.allocate_obj(
            NativeFunction {
                header: new_header::<NativeFunction>(),
                arity,
                name: name.to_string(),
                module_name: module_name.to_string(),
                callback,
            },
            0,
        )
    }

    pub(crate) fn allocate_task(&mut self, name: *mut TernString) -> *mut Task {
        let mut stack = vec![Value::empty(); crate::task::STACK_SIZE].into_boxed_slice();
        let stack_top = stack.as_mut_ptr();
        self.allocate_obj(
            Task {
                header: new_header::<Task>(),
                name,
                stack,
                stack_top,
                frames: Vec::new(),
                open_upvalues: std::ptr::null_mut(),
                status: crate::task::TaskStatus::Suspended,
                cancel_value: Value::empty(),
            },
            0,
        )
    }

    // =========================================================================
    // Collection
    // =========================================================================

    pub fn collect(&mut self) {
        let before = self.bytes_allocated;

        // Roots.
        self.grey(self.root_task as *mut ObjHeader);
        self.grey(self.current_task as *mut ObjHeader);
        for i in 0..self.ready_queue.len() {
            self.grey(self.ready_queue[i] as *mut ObjHeader);
        }
        for i in 0..self.temp_roots.len() {
            self.grey_value(self.temp_roots[i]);
        }
        let mut handle_objects: Vec<*mut ObjHeader> = self.handles.iter().collect();
        for o in handle_objects.drain(..) {
            self.grey(o);
        }
        for i in 0..self.globals.len() {
            self.grey_value(self.globals[i].value);
        }
        for i in 0..self.module_variables.len() {
            self.grey_value(self.module_variables[i]);
        }
        let modules: Vec<*mut Module> = self.modules.values().copied().collect();
        for m in modules {
            self.grey(m as *mut ObjHeader);
        }
        for class in self.builtin_classes.iter() {
            self.grey(class as *mut ObjHeader);
        }
        self.grey_value(self.return_value);
        self.grey_value(self.accumulator);
        let efunc_keys: Vec<*mut Symbol> = self.efuncs.keys().map(|k| k.0).collect();
        for sym in efunc_keys {
            self.grey(sym as *mut ObjHeader);
        }

        // Trace.
        while let Some(obj) = self.greyobjects.pop() {
            unsafe { self.blacken(obj) };
        }

        // Sweep.
        unsafe { self.sweep() };

        self.threshhold = std::cmp::max(
            INITIAL_HEAP_SIZE,
            self.bytes_allocated * HEAP_GROWTH_FACTOR,
        );
        tracing::debug!(
            freed = before - self.bytes_allocated,
            live = self.bytes_allocated,
            threshhold = self.threshhold,
            "gc cycle"
        );
    }

    fn grey(&mut self, obj: *mut ObjHeader) {
        if obj.is_null() {
            return;
        }
        unsafe {
            if !(*obj).is_dark {
                (*obj).is_dark = true;
                self.greyobjects.push(obj);
            }
        }
    }

    fn grey_value(&mut self, v: Value) {
        if v.is_object() {
            self.grey(v.as_object());
        }
    }

    /// Trace one object's outgoing references.
    unsafe fn blacken(&mut self, obj: *mut ObjHeader) {
        match (*obj).ty {
            ObjType::String | ObjType::Symbol | ObjType::Range | ObjType::NativeFunction
            | ObjType::Module => {}
            ObjType::Array => {
                let arr = obj_as::<Array>(obj);
                for i in 0..(*arr).inner.len() {
                    self.grey_value((*arr).inner[i]);
                }
            }
            ObjType::Map => {
                let map = obj_as::<Map>(obj);
                for i in 0..(*map).inner.len() {
                    let (k, v) = (*map).inner.get_index(i).unwrap();
                    let (k, v) = (k.0, *v);
                    self.grey_value(k);
                    self.grey_value(v);
                }
            }
            ObjType::ArrayIterator => {
                let it = obj_as::<ArrayIterator>(obj);
                self.grey((*it).array as *mut ObjHeader);
            }
            ObjType::MapIterator => {
                let it = obj_as::<MapIterator>(obj);
                self.grey((*it).map as *mut ObjHeader);
                self.grey_value((*it).last_key);
            }
            ObjType::StringIterator => {
                let it = obj_as::<StringIterator>(obj);
                self.grey((*it).string as *mut ObjHeader);
            }
            ObjType::Class => {
                let class = obj_as::<Class>(obj);
                self.grey((*class).super_class as *mut ObjHeader);
                let entries: Vec<(*mut Symbol, Value)> =
                    (*class).methods.iter().map(|(k, &v)| (k.0, v)).collect();
                for (sym, method) in entries {
                    self.grey(sym as *mut ObjHeader);
                    self.grey_value(method);
                }
            }
            ObjType::Instance => {
                let instance = obj_as::<Instance>(obj);
                self.grey((*instance).class as *mut ObjHeader);
                for i in 0..(*instance).properties.len() {
                    let (k, v) = (*instance).properties.get_index(i).unwrap();
                    let (k, v) = (k.0, *v);
                    self.grey(k as *mut ObjHeader);
                    self.grey_value(v);
                }
            }
            ObjType::Function => {
                let f = obj_as::<Function>(obj);
                self.grey((*f).function_info as *mut ObjHeader);
                for i in 0..(*f).upvalues.len() {
                    self.grey((*f).upvalues[i] as *mut ObjHeader);
                }
            }
            ObjType::FunctionInfo => {
                let info = obj_as::<FunctionInfo>(obj);
                for i in 0..(*info).constants.len() {
                    self.grey_value((*info).constants[i]);
                }
            }
            ObjType::UpValue => {
                let upvalue = obj_as::<UpValue>(obj);
                self.grey_value((*upvalue).closed);
                // While open, *location is a stack slot traced via its task.
            }
            ObjType::Task => {
                let task = obj_as::<Task>(obj);
                self.grey((*task).name as *mut ObjHeader);
                self.grey_value((*task).cancel_value);
                let base = (*task).stack.as_ptr();
                let live = ((*task).stack_top as usize - base as usize)
                    / std::mem::size_of::<Value>();
                for i in 0..live {
                    self.grey_value(*base.add(i));
                }
                for i in 0..(*task).frames.len() {
                    self.grey((*task).frames[i].f as *mut ObjHeader);
                }
                let mut upvalue = (*task).open_upvalues;
                while !upvalue.is_null() {
                    self.grey(upvalue as *mut ObjHeader);
                    upvalue = (*upvalue).next;
                }
            }
        }
    }

    unsafe fn sweep(&mut self) {
        let mut prev: *mut ObjHeader = std::ptr::null_mut();
        let mut cursor = self.first_obj;
        while !cursor.is_null() {
            let next = (*cursor).next;
            if (*cursor).is_dark {
                (*cursor).is_dark = false;
                prev = cursor;
            } else {
                if prev.is_null() {
                    self.first_obj = next;
                } else {
                    (*prev).next = next;
                }
                if (*cursor).ty == ObjType::Symbol {
                    self.symbols.remove(cursor as *mut Symbol);
                }
                self.drop_object(cursor);
            }
            cursor = next;
        }
    }

    /// Size charged against `bytes_allocated` for this object. Counts only
    /// payload fixed at allocation time.
    unsafe fn object_size(&self, obj: *mut ObjHeader) -> usize {
        match (*obj).ty {
            ObjType::String => {
                std::mem::size_of::<TernString>() + (*obj_as::<TernString>(obj)).contents.len()
            }
            ObjType::Symbol => {
                std::mem::size_of::<Symbol>() + (*obj_as::<Symbol>(obj)).contents.len()
            }
            ObjType::Function => {
                std::mem::size_of::<Function>()
                    + (*obj_as::<Function>(obj)).upvalues.len()
                        * std::mem::size_of::<*mut UpValue>()
            }
            ObjType::Array => std::mem::size_of::<Array>(),
            ObjType::Map => std::mem::size_of::<Map>(),
            ObjType::Range => std::mem::size_of::<Range>(),
            ObjType::ArrayIterator => std::mem::size_of::<ArrayIterator>(),
            ObjType::MapIterator => std::mem::size_of::<MapIterator>(),
            ObjType::StringIterator => std::mem::size_of::<StringIterator>(),
            ObjType::Class => std::mem::size_of::<Class>(),
            ObjType::Instance => std::mem::size_of::<Instance>(),
            ObjType::Module => std::mem::size_of::<Module>(),
            ObjType::NativeFunction => std::mem::size_of::<NativeFunction>(),
            ObjType::FunctionInfo => std::mem::size_of::<FunctionInfo>(),
            ObjType::UpValue => std::mem::size_of::<UpValue>(),
            ObjType::Task => std::mem::size_of::<Task>(),
        }
    }

    /// Free one object, running the concrete type's drop glue.
    pub(crate) unsafe fn drop_object(&mut self, obj: *mut ObjHeader) {
        self.bytes_allocated -= self.object_size(obj);
        match (*obj).ty {
            ObjType::String => drop(Box::from_raw(obj as *mut TernString)),
            ObjType::Symbol => drop(Box::from_raw(obj as *mut Symbol)),
            ObjType::Array => drop(Box::from_raw(obj as *mut Array)),
            ObjType::Map => drop(Box::from_raw(obj as *mut Map)),
            ObjType::Range => drop(Box::from_raw(obj as *mut Range)),
            ObjType::ArrayIterator => drop(Box::from_raw(obj as *mut ArrayIterator)),
            ObjType::MapIterator => drop(Box::from_raw(obj as *mut MapIterator)),
            ObjType::StringIterator => drop(Box::from_raw(obj as *mut StringIterator)),
            ObjType::Class => drop(Box::from_raw(obj as *mut Class)),
            ObjType::Instance => drop(Box::from_raw(obj as *mut Instance)),
            ObjType::Module => drop(Box::from_raw(obj as *mut Module)),
            ObjType::NativeFunction => drop(Box::from_raw(obj as *mut NativeFunction)),
            ObjType::FunctionInfo => drop(Box::from_raw(obj as *mut FunctionInfo)),
            ObjType::UpValue => drop(Box::from_raw(obj as *mut UpValue)),
            ObjType::Function => drop(Box::from_raw(obj as *mut Function)),
            ObjType::Task => drop(Box::from_raw(obj as *mut Task)),
        }
    }

    /// Number of objects currently on the all-objects list. Test support.
    #[cfg(test)]
    pub(crate) fn live_objects(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.first_obj;
        while !cursor.is_null() {
            count += 1;
            cursor = unsafe { (*cursor).next };
        }
        count
    }
}
