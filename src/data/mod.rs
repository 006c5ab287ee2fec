//! The in-memory data model: storage scalar types, dynamically typed vectors
//! and matrices, and the fill buffers backends hand out for in-place writes.

mod buffer;
mod matrix;
mod named;
mod scalar;
mod vector;

pub use buffer::*;
pub use matrix::*;
pub use named::*;
pub use scalar::*;
pub use vector::*;

/// One element type of the storage-scalar universe, with the hooks needed to
/// move between the typed world and the dynamic containers.
pub trait Element: Clone + PartialEq + Send + Sync + std::fmt::Debug + 'static {
    const TYPE: ScalarType;

    fn dyn_from_vec(values: Vec<Self>) -> DynVector;
    fn slice_of(values: &DynVector) -> Option<&[Self]>;
    fn from_scalar(value: &ScalarValue) -> Option<Self>;
    fn to_scalar(&self) -> ScalarValue;
    fn is_zero_element(&self) -> bool;
    fn zero_element() -> Self;
    fn buffer_mut(buffer: &mut DynBuffer) -> Option<&mut [Self]>;
    fn wrap_buffer(buffer: SliceBuffer<Self>) -> DynBuffer;
}

macro_rules! impl_element {
    ($variant:ident, $t:ty, $zero:expr, $is_zero:expr) => {
        impl Element for $t {
            const TYPE: ScalarType = ScalarType::$variant;

            fn dyn_from_vec(values: Vec<Self>) -> DynVector {
                DynVector::$variant(values)
            }

            fn slice_of(values: &DynVector) -> Option<&[Self]> {
                match values {
                    DynVector::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn from_scalar(value: &ScalarValue) -> Option<Self> {
                match value {
                    ScalarValue::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }

            fn to_scalar(&self) -> ScalarValue {
                ScalarValue::$variant(self.clone())
            }

            fn is_zero_element(&self) -> bool {
                let is_zero: fn(&Self) -> bool = $is_zero;
                is_zero(self)
            }

            fn zero_element() -> Self {
                $zero
            }

            fn buffer_mut(buffer: &mut DynBuffer) -> Option<&mut [Self]> {
                match buffer {
                    DynBuffer::$variant(b) => Some(b.as_mut_slice()),
                    _ => None,
                }
            }

            fn wrap_buffer(buffer: SliceBuffer<Self>) -> DynBuffer {
                DynBuffer::$variant(buffer)
            }
        }
    };
}

impl_element!(I8, i8, 0, |v| *v == 0);
impl_element!(I16, i16, 0, |v| *v == 0);
impl_element!(I32, i32, 0, |v| *v == 0);
impl_element!(I64, i64, 0, |v| *v == 0);
impl_element!(U8, u8, 0, |v| *v == 0);
impl_element!(U16, u16, 0, |v| *v == 0);
impl_element!(U32, u32, 0, |v| *v == 0);
impl_element!(U64, u64, 0, |v| *v == 0);
impl_element!(F32, f32, 0.0, |v| *v == 0.0);
impl_element!(F64, f64, 0.0, |v| *v == 0.0);
impl_element!(Bool, bool, false, |v| !*v);
impl_element!(Str, String, String::new(), |_| false);

/// Run `$body` with `$T` bound to the concrete element type named by a
/// [`ScalarType`] value. The single place where dynamic tags meet generics.
macro_rules! dispatch_scalar_type {
    ($tag:expr, $T:ident => $body:expr) => {
        match $tag {
            $crate::data::ScalarType::I8 => {
                type $T = i8;
                $body
            }
            $crate::data::ScalarType::I16 => {
                type $T = i16;
                $body
            }
            $crate::data::ScalarType::I32 => {
                type $T = i32;
                $body
            }
            $crate::data::ScalarType::I64 => {
                type $T = i64;
                $body
            }
            $crate::data::ScalarType::U8 => {
                type $T = u8;
                $body
            }
            $crate::data::ScalarType::U16 => {
                type $T = u16;
                $body
            }
            $crate::data::ScalarType::U32 => {
                type $T = u32;
                $body
            }
            $crate::data::ScalarType::U64 => {
                type $T = u64;
                $body
            }
            $crate::data::ScalarType::F32 => {
                type $T = f32;
                $body
            }
            $crate::data::ScalarType::F64 => {
                type $T = f64;
                $body
            }
            $crate::data::ScalarType::Bool => {
                type $T = bool;
                $body
            }
            $crate::data::ScalarType::Str => {
                type $T = String;
                $body
            }
        }
    };
}

/// Like [`dispatch_scalar_type!`] but restricted to the numeric-or-bool
/// subset; the `$other` arm handles strings.
macro_rules! dispatch_real_type {
    ($tag:expr, $T:ident => $body:expr, $other:expr) => {
        match $tag {
            $crate::data::ScalarType::I8 => {
                type $T = i8;
                $body
            }
            $crate::data::ScalarType::I16 => {
                type $T = i16;
                $body
            }
            $crate::data::ScalarType::I32 => {
                type $T = i32;
                $body
            }
            $crate::data::ScalarType::I64 => {
                type $T = i64;
                $body
            }
            $crate::data::ScalarType::U8 => {
                type $T = u8;
                $body
            }
            $crate::data::ScalarType::U16 => {
                type $T = u16;
                $body
            }
            $crate::data::ScalarType::U32 => {
                type $T = u32;
                $body
            }
            $crate::data::ScalarType::U64 => {
                type $T = u64;
                $body
            }
            $crate::data::ScalarType::F32 => {
                type $T = f32;
                $body
            }
            $crate::data::ScalarType::F64 => {
                type $T = f64;
                $body
            }
            $crate::data::ScalarType::Bool => {
                type $T = bool;
                $body
            }
            $crate::data::ScalarType::Str => $other,
        }
    };
}

/// Dispatch restricted to the ten numeric types; `$bool_arm` and `$str_arm`
/// handle the two element types `num` cannot cast through.
macro_rules! dispatch_numeric_type {
    ($tag:expr, $T:ident => $body:expr, $bool_arm:expr, $str_arm:expr) => {
        match $tag {
            $crate::data::ScalarType::I8 => {
                type $T = i8;
                $body
            }
            $crate::data::ScalarType::I16 => {
                type $T = i16;
                $body
            }
            $crate::data::ScalarType::I32 => {
                type $T = i32;
                $body
            }
            $crate::data::ScalarType::I64 => {
                type $T = i64;
                $body
            }
            $crate::data::ScalarType::U8 => {
                type $T = u8;
                $body
            }
            $crate::data::ScalarType::U16 => {
                type $T = u16;
                $body
            }
            $crate::data::ScalarType::U32 => {
                type $T = u32;
                $body
            }
            $crate::data::ScalarType::U64 => {
                type $T = u64;
                $body
            }
            $crate::data::ScalarType::F32 => {
                type $T = f32;
                $body
            }
            $crate::data::ScalarType::F64 => {
                type $T = f64;
                $body
            }
            $crate::data::ScalarType::Bool => $bool_arm,
            $crate::data::ScalarType::Str => $str_arm,
        }
    };
}

/// Match every variant of a dynamic container, binding the typed payload.
macro_rules! with_dyn_vector {
    ($value:expr, |$v:ident| $body:expr) => {
        match $value {
            $crate::data::DynVector::I8($v) => $body,
            $crate::data::DynVector::I16($v) => $body,
            $crate::data::DynVector::I32($v) => $body,
            $crate::data::DynVector::I64($v) => $body,
            $crate::data::DynVector::U8($v) => $body,
            $crate::data::DynVector::U16($v) => $body,
            $crate::data::DynVector::U32($v) => $body,
            $crate::data::DynVector::U64($v) => $body,
            $crate::data::DynVector::F32($v) => $body,
            $crate::data::DynVector::F64($v) => $body,
            $crate::data::DynVector::Bool($v) => $body,
            $crate::data::DynVector::Str($v) => $body,
        }
    };
}

/// Like [`with_dyn_vector!`] but with a separate arm for strings, so the
/// main body can use traits strings lack.
macro_rules! with_dyn_vector_real {
    ($value:expr, |$v:ident| $body:expr, |$s:ident| $str_body:expr) => {
        match $value {
            $crate::data::DynVector::I8($v) => $body,
            $crate::data::DynVector::I16($v) => $body,
            $crate::data::DynVector::I32($v) => $body,
            $crate::data::DynVector::I64($v) => $body,
            $crate::data::DynVector::U8($v) => $body,
            $crate::data::DynVector::U16($v) => $body,
            $crate::data::DynVector::U32($v) => $body,
            $crate::data::DynVector::U64($v) => $body,
            $crate::data::DynVector::F32($v) => $body,
            $crate::data::DynVector::F64($v) => $body,
            $crate::data::DynVector::Bool($v) => $body,
            $crate::data::DynVector::Str($s) => $str_body,
        }
    };
}

pub(crate) use dispatch_numeric_type;
pub(crate) use dispatch_real_type;
pub(crate) use dispatch_scalar_type;
pub(crate) use with_dyn_vector;
pub(crate) use with_dyn_vector_real;

/// The zero value of a storage type (an empty string for `Str`).
pub fn zero_scalar(element_type: ScalarType) -> ScalarValue {
    dispatch_scalar_type!(element_type, T => <T as Element>::zero_element().to_scalar())
}
