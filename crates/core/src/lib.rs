//! Tern Core: value representation for a register-based scripting VM
//!
//! This crate provides the representation-level primitives shared by the
//! interpreter, the garbage collector and the bytecode emitter:
//!
//! - `Value`: a 64-bit NaN-boxed tagged value (with a tagged-union fallback
//!   for targets where pointers do not fit in 48 bits)
//! - `ObjHeader`: the common 3-field header carried by every heap object
//! - `fnv1a`: the string/symbol hash used for interning and map keys
//!
//! Heap object *layouts* live in `tern-vm`; this crate only knows that an
//! object starts with an `ObjHeader`.

pub mod hash;
pub mod value;

pub use hash::fnv1a;
pub use value::{ObjHeader, ObjType, Value};
