//! NaN-boxed `Value` with a tagged-union fallback
//!
//! Every value the VM manipulates is a 64-bit `Value`. On 64-bit targets it
//! is NaN-boxed:
//!
//! ```text
//! 0                    empty sentinel (never visible to scripts)
//! 1                    null
//! 2 / 3                true / false
//! (1 << 48) | u32      32-bit integer in the low bits
//! bits + (2 << 48)     float, biased so every double lands above 2 << 48
//! otherwise            pointer to a heap object (high 16 bits zero)
//! ```
//!
//! The bias trick means `is_float` is a single compare and object pointers
//! need no masking: canonical x86-64/AArch64 user-space pointers fit in
//! 48 bits. On other targets (or with the `tagged-value` feature) a plain
//! tag + union layout is used instead. Both layouts expose the same API and
//! pass the same tests.
//!
//! Accessors debug-assert their predicate; callers check first.

/// Heap object kinds. Stored in every object header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjType {
    String,
    Symbol,
    Array,
    Map,
    Range,
    ArrayIterator,
    MapIterator,
    StringIterator,
    Class,
    Instance,
    Function,
    UpValue,
    NativeFunction,
    FunctionInfo,
    Module,
    Task,
}

/// Common header at offset 0 of every heap object.
///
/// `next` threads the GC's intrusive all-objects list; `is_dark` is the
/// mark bit. Concrete object layouts in `tern-vm` start with this header
/// (`#[repr(C)]`) so any object pointer can be read as `*mut ObjHeader`.
#[repr(C)]
pub struct ObjHeader {
    pub ty: ObjType,
    pub is_dark: bool,
    pub next: *mut ObjHeader,
}

#[cfg(all(target_pointer_width = "64", not(feature = "tagged-value")))]
mod imp {
    use super::ObjHeader;

    const VALUE_EMPTY: u64 = 0;
    const VALUE_NULL: u64 = 1;
    const VALUE_TRUE: u64 = 2;
    const VALUE_FALSE: u64 = 3;
    const INT_TAG: u64 = 1 << 48;
    const FLOAT_BIAS: u64 = 2 << 48;

    /// A NaN-boxed 64-bit value.
    #[repr(transparent)]
    #[derive(Clone, Copy)]
    pub struct Value(u64);

    impl Value {
        #[inline(always)]
        pub fn empty() -> Self {
            Value(VALUE_EMPTY)
        }

        #[inline(always)]
        pub fn null() -> Self {
            Value(VALUE_NULL)
        }

        #[inline(always)]
        pub fn from_bool(b: bool) -> Self {
            Value(if b { VALUE_TRUE } else { VALUE_FALSE })
        }

        #[inline(always)]
        pub fn from_int(i: i32) -> Self {
            Value(INT_TAG | (i as u32 as u64))
        }

        /// Floats are stored biased by `2 << 48`. The addition wraps for the
        /// highest NaN payloads, matching the biased-range check below.
        #[inline(always)]
        pub fn from_float(f: f64) -> Self {
            Value(f.to_bits().wrapping_add(FLOAT_BIAS))
        }

        #[inline(always)]
        pub fn from_object(o: *mut ObjHeader) -> Self {
            debug_assert!(!o.is_null());
            Value(o as u64)
        }

        #[inline(always)]
        pub fn is_empty(self) -> bool {
            self.0 == VALUE_EMPTY
        }

        #[inline(always)]
        pub fn is_null(self) -> bool {
            self.0 == VALUE_NULL
        }

        #[inline(always)]
        pub fn is_bool(self) -> bool {
            self.0 == VALUE_TRUE || self.0 == VALUE_FALSE
        }

        #[inline(always)]
        pub fn as_bool(self) -> bool {
            debug_assert!(self.is_bool());
            self.0 == VALUE_TRUE
        }

        #[inline(always)]
        pub fn is_int(self) -> bool {
            (self.0 >> 48) == 1
        }

        #[inline(always)]
        pub fn as_int(self) -> i32 {
            debug_assert!(self.is_int());
            self.0 as u32 as i32
        }

        #[inline(always)]
        pub fn is_float(self) -> bool {
            self.0 >= FLOAT_BIAS
        }

        #[inline(always)]
        pub fn as_float(self) -> f64 {
            debug_assert!(self.is_float());
            f64::from_bits(self.0.wrapping_sub(FLOAT_BIAS))
        }

        #[inline(always)]
        pub fn is_object(self) -> bool {
            (self.0 >> 48) == 0 && self.0 > VALUE_FALSE
        }

        #[inline(always)]
        pub fn as_object(self) -> *mut ObjHeader {
            debug_assert!(self.is_object());
            self.0 as *mut ObjHeader
        }

        #[inline(always)]
        pub fn is_null_or_false(self) -> bool {
            self.0 == VALUE_NULL || self.0 == VALUE_FALSE
        }

        /// Representation identity: same variant and same payload bits.
        /// Floats compare by bits (so NaN is identical to NaN and +0.0 is
        /// not identical to -0.0); objects compare by pointer.
        #[inline(always)]
        pub fn identical(self, other: Self) -> bool {
            self.0 == other.0
        }
    }
}

#[cfg(any(not(target_pointer_width = "64"), feature = "tagged-value"))]
mod imp {
    use super::ObjHeader;

    #[derive(Clone, Copy)]
    enum Repr {
        Empty,
        Int(i32),
        Float(f64),
        Object(*mut ObjHeader),
        True,
        False,
        Null,
    }

    /// Tagged-union fallback with the same API as the NaN-boxed layout.
    #[derive(Clone, Copy)]
    pub struct Value(Repr);

    impl Value {
        #[inline(always)]
        pub fn empty() -> Self {
            Value(Repr::Empty)
        }

        #[inline(always)]
        pub fn null() -> Self {
            Value(Repr::Null)
        }

        #[inline(always)]
        pub fn from_bool(b: bool) -> Self {
            Value(if b { Repr::True } else { Repr::False })
        }

        #[inline(always)]
        pub fn from_int(i: i32) -> Self {
            Value(Repr::Int(i))
        }

        #[inline(always)]
        pub fn from_float(f: f64) -> Self {
            Value(Repr::Float(f))
        }

        #[inline(always)]
        pub fn from_object(o: *mut ObjHeader) -> Self {
            debug_assert!(!o.is_null());
            Value(Repr::Object(o))
        }

        #[inline(always)]
        pub fn is_empty(self) -> bool {
            matches!(self.0, Repr::Empty)
        }

        #[inline(always)]
        pub fn is_null(self) -> bool {
            matches!(self.0, Repr::Null)
        }

        #[inline(always)]
        pub fn is_bool(self) -> bool {
            matches!(self.0, Repr::True | Repr::False)
        }

        #[inline(always)]
        pub fn as_bool(self) -> bool {
            debug_assert!(self.is_bool());
            matches!(self.0, Repr::True)
        }

        #[inline(always)]
        pub fn is_int(self) -> bool {
            matches!(self.0, Repr::Int(_))
        }

        #[inline(always)]
        pub fn as_int(self) -> i32 {
            match self.0 {
                Repr::Int(i) => i,
                _ => {
                    debug_assert!(false, "as_int() on non-int value");
                    0
                }
            }
        }

        #[inline(always)]
        pub fn is_float(self) -> bool {
            matches!(self.0, Repr::Float(_))
        }

        #[inline(always)]
        pub fn as_float(self) -> f64 {
            match self.0 {
                Repr::Float(f) => f,
                _ => {
                    debug_assert!(false, "as_float() on non-float value");
                    0.0
                }
            }
        }

        #[inline(always)]
        pub fn is_object(self) -> bool {
            matches!(self.0, Repr::Object(_))
        }

        #[inline(always)]
        pub fn as_object(self) -> *mut ObjHeader {
            match self.0 {
                Repr::Object(o) => o,
                _ => {
                    debug_assert!(false, "as_object() on non-object value");
                    std::ptr::null_mut()
                }
            }
        }

        #[inline(always)]
        pub fn is_null_or_false(self) -> bool {
            matches!(self.0, Repr::Null | Repr::False)
        }

        #[inline(always)]
        pub fn identical(self, other: Self) -> bool {
            match (self.0, other.0) {
                (Repr::Empty, Repr::Empty) => true,
                (Repr::Null, Repr::Null) => true,
                (Repr::True, Repr::True) => true,
                (Repr::False, Repr::False) => true,
                (Repr::Int(a), Repr::Int(b)) => a == b,
                (Repr::Float(a), Repr::Float(b)) => a.to_bits() == b.to_bits(),
                (Repr::Object(a), Repr::Object(b)) => std::ptr::eq(a, b),
                _ => false,
            }
        }
    }
}

pub use imp::Value;

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "Empty")
        } else if self.is_null() {
            write!(f, "Null")
        } else if self.is_bool() {
            write!(f, "Bool({})", self.as_bool())
        } else if self.is_int() {
            write!(f, "Int({})", self.as_int())
        } else if self.is_float() {
            write!(f, "Float({})", self.as_float())
        } else {
            write!(f, "Object({:p})", self.as_object())
        }
    }
}
