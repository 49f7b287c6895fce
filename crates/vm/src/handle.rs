//! Host-held roots
//!
//! A `Handle` pins one heap object across VM calls. Handles form an
//! intrusive doubly-linked list owned by the VM; the GC walks the list as
//! part of the root set. Host code must not create or release handles while
//! the VM is executing (single-thread invariant, see the concurrency notes
//! in the crate docs).

use tern_core::ObjHeader;

pub struct Handle {
    pub object: *mut ObjHeader,
    pub(crate) previous: *mut Handle,
    pub(crate) next: *mut Handle,
}

/// Owner side of the handle list. Stored in the VM.
pub struct HandleList {
    head: *mut Handle,
}

impl HandleList {
    pub fn new() -> Self {
        HandleList {
            head: std::ptr::null_mut(),
        }
    }

    /// Pin `object`, returning a stable pointer the host keeps until
    /// `release`.
    pub fn make(&mut self, object: *mut ObjHeader) -> *mut Handle {
        let handle = Box::into_raw(Box::new(Handle {
            object,
            previous: std::ptr::null_mut(),
            next: self.head,
        }));
        unsafe {
            if !self.head.is_null() {
                (*self.head).previous = handle;
            }
        }
        self.head = handle;
        handle
    }

    /// Unpin and free a handle created by `make`.
    pub unsafe fn release(&mut self, handle: *mut Handle) {
        if (*handle).previous.is_null() {
            self.head = (*handle).next;
        } else {
            (*(*handle).previous).next = (*handle).next;
        }
        if !(*handle).next.is_null() {
            (*(*handle).next).previous = (*handle).previous;
        }
        drop(Box::from_raw(handle));
    }

    pub fn iter(&self) -> HandleIter {
        HandleIter { cursor: self.head }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

impl Default for HandleList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HandleList {
    fn drop(&mut self) {
        // Host leaked its handles; free the nodes so teardown is clean.
        let mut cursor = self.head;
        while !cursor.is_null() {
            let next = unsafe { (*cursor).next };
            unsafe { drop(Box::from_raw(cursor)) };
            cursor = next;
        }
    }
}

pub struct HandleIter {
    cursor: *mut Handle,
}

impl Iterator for HandleIter {
    type Item = *mut ObjHeader;

    fn next(&mut self) -> Option<*mut ObjHeader> {
        if self.cursor.is_null() {
            return None;
        }
        let object = unsafe { (*self.cursor).object };
        self.cursor = unsafe { (*self.cursor).next };
        Some(object)
    }
}
