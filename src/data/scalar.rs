use std::fmt;

use anyhow::{bail, Result};

/// Semantic tag for the storage-scalar universe: the element types a store
/// can hold in scalars and vectors. Matrices restrict this to [`ScalarType::is_real`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Bool,
    Str,
}

impl ScalarType {
    /// Byte footprint of one element, used by the storage-fraction estimates.
    /// Strings are variable length; they never take the sparse path, so the
    /// pointer size stands in for them.
    pub fn size_of(self) -> usize {
        match self {
            ScalarType::I8 | ScalarType::U8 | ScalarType::Bool => 1,
            ScalarType::I16 | ScalarType::U16 => 2,
            ScalarType::I32 | ScalarType::U32 | ScalarType::F32 => 4,
            ScalarType::I64 | ScalarType::U64 | ScalarType::F64 | ScalarType::Str => 8,
        }
    }

    /// Numeric or bool, the types a matrix may hold in its canonical forms.
    pub fn is_real(self) -> bool {
        self != ScalarType::Str
    }

    pub fn is_float(self) -> bool {
        matches!(self, ScalarType::F32 | ScalarType::F64)
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ScalarType::I8 | ScalarType::I16 | ScalarType::I32 | ScalarType::I64
        )
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            ScalarType::U8 | ScalarType::U16 | ScalarType::U32 | ScalarType::U64
        )
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarType::I8 => "i8",
            ScalarType::I16 => "i16",
            ScalarType::I32 => "i32",
            ScalarType::I64 => "i64",
            ScalarType::U8 => "u8",
            ScalarType::U16 => "u16",
            ScalarType::U32 => "u32",
            ScalarType::U64 => "u64",
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
            ScalarType::Bool => "bool",
            ScalarType::Str => "str",
        };
        f.write_str(name)
    }
}

/// A single value of a storage-scalar type.
#[derive(Clone, Debug, PartialEq)]
pub enum ScalarValue {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Str(String),
}

impl ScalarValue {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            ScalarValue::I8(_) => ScalarType::I8,
            ScalarValue::I16(_) => ScalarType::I16,
            ScalarValue::I32(_) => ScalarType::I32,
            ScalarValue::I64(_) => ScalarType::I64,
            ScalarValue::U8(_) => ScalarType::U8,
            ScalarValue::U16(_) => ScalarType::U16,
            ScalarValue::U32(_) => ScalarType::U32,
            ScalarValue::U64(_) => ScalarType::U64,
            ScalarValue::F32(_) => ScalarType::F32,
            ScalarValue::F64(_) => ScalarType::F64,
            ScalarValue::Bool(_) => ScalarType::Bool,
            ScalarValue::Str(_) => ScalarType::Str,
        }
    }

    /// Whether this value is the zero of its type. Strings are never zero;
    /// the sparse paths reject them before asking.
    pub fn is_zero(&self) -> bool {
        match self {
            ScalarValue::I8(v) => *v == 0,
            ScalarValue::I16(v) => *v == 0,
            ScalarValue::I32(v) => *v == 0,
            ScalarValue::I64(v) => *v == 0,
            ScalarValue::U8(v) => *v == 0,
            ScalarValue::U16(v) => *v == 0,
            ScalarValue::U32(v) => *v == 0,
            ScalarValue::U64(v) => *v == 0,
            ScalarValue::F32(v) => *v == 0.0,
            ScalarValue::F64(v) => *v == 0.0,
            ScalarValue::Bool(v) => !*v,
            ScalarValue::Str(_) => false,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::I8(v) => write!(f, "{}", v),
            ScalarValue::I16(v) => write!(f, "{}", v),
            ScalarValue::I32(v) => write!(f, "{}", v),
            ScalarValue::I64(v) => write!(f, "{}", v),
            ScalarValue::U8(v) => write!(f, "{}", v),
            ScalarValue::U16(v) => write!(f, "{}", v),
            ScalarValue::U32(v) => write!(f, "{}", v),
            ScalarValue::U64(v) => write!(f, "{}", v),
            ScalarValue::F32(v) => write!(f, "{}", v),
            ScalarValue::F64(v) => write!(f, "{}", v),
            ScalarValue::Bool(v) => write!(f, "{}", v),
            ScalarValue::Str(v) => f.write_str(v),
        }
    }
}

macro_rules! impl_scalar_from {
    ($variant:ident, $t:ty) => {
        impl From<$t> for ScalarValue {
            fn from(value: $t) -> Self {
                ScalarValue::$variant(value)
            }
        }
    };
}

impl_scalar_from!(I8, i8);
impl_scalar_from!(I16, i16);
impl_scalar_from!(I32, i32);
impl_scalar_from!(I64, i64);
impl_scalar_from!(U8, u8);
impl_scalar_from!(U16, u16);
impl_scalar_from!(U32, u32);
impl_scalar_from!(U64, u64);
impl_scalar_from!(F32, f32);
impl_scalar_from!(F64, f64);
impl_scalar_from!(Bool, bool);
impl_scalar_from!(Str, String);

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::Str(value.to_owned())
    }
}

/// Width of the integer indices of a compressed (sparse) representation as
/// stored on disk. Indices on disk are 1-based, so a width fits a container
/// when its maximum value is at least the number of elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexWidth {
    I8,
    I16,
    I32,
    I64,
}

impl IndexWidth {
    /// The narrowest width whose maximum value is at least `capacity`.
    pub fn for_capacity(capacity: usize) -> IndexWidth {
        if capacity <= i8::MAX as usize {
            IndexWidth::I8
        } else if capacity <= i16::MAX as usize {
            IndexWidth::I16
        } else if capacity <= i32::MAX as usize {
            IndexWidth::I32
        } else {
            IndexWidth::I64
        }
    }

    pub fn size_of(self) -> usize {
        match self {
            IndexWidth::I8 => 1,
            IndexWidth::I16 => 2,
            IndexWidth::I32 => 4,
            IndexWidth::I64 => 8,
        }
    }

    pub fn max_value(self) -> usize {
        match self {
            IndexWidth::I8 => i8::MAX as usize,
            IndexWidth::I16 => i16::MAX as usize,
            IndexWidth::I32 => i32::MAX as usize,
            IndexWidth::I64 => i64::MAX as usize,
        }
    }
}

impl fmt::Display for IndexWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexWidth::I8 => "i8",
            IndexWidth::I16 => "i16",
            IndexWidth::I32 => "i32",
            IndexWidth::I64 => "i64",
        };
        f.write_str(name)
    }
}

fn signed_size_of(t: ScalarType) -> usize {
    // An unsigned type needs one extra byte to survive the trip to signed.
    if t.is_unsigned() || t == ScalarType::Bool {
        t.size_of() + 1
    } else {
        t.size_of()
    }
}

fn signed_for_width(width: usize) -> ScalarType {
    match width {
        0..=1 => ScalarType::I8,
        2 => ScalarType::I16,
        3..=4 => ScalarType::I32,
        _ => ScalarType::I64,
    }
}

fn unsigned_for_width(width: usize) -> ScalarType {
    match width {
        0..=1 => ScalarType::U8,
        2 => ScalarType::U16,
        3..=4 => ScalarType::U32,
        _ => ScalarType::U64,
    }
}

fn float_for_width(width: usize) -> ScalarType {
    if width <= 4 {
        ScalarType::F32
    } else {
        ScalarType::F64
    }
}

/// Promote a pair of element types to one that can hold values of both.
/// The accumulator is `None` when nothing has been seen yet (the seed when no
/// empty value was supplied), in which case the right side wins outright.
pub fn merge_dtypes(left: Option<ScalarType>, right: ScalarType) -> ScalarType {
    let left = match left {
        None => return right,
        Some(left) => left,
    };
    if left == right {
        return left;
    }
    if left == ScalarType::Str || right == ScalarType::Str {
        return ScalarType::Str;
    }
    if left.is_float() || right.is_float() {
        return float_for_width(left.size_of().max(right.size_of()));
    }
    if left.is_signed() || right.is_signed() {
        return signed_for_width(signed_size_of(left).max(signed_size_of(right)));
    }
    // Bool meets Bool was handled by the equality fast path; Bool meets an
    // unsigned integer behaves as a one-byte unsigned.
    unsigned_for_width(left.size_of().max(right.size_of()))
}

/// Fold [`merge_dtypes`] over the element types of a property across sources.
pub fn merged_dtype<I>(seed: Option<ScalarType>, types: I) -> Result<ScalarType>
where
    I: IntoIterator<Item = ScalarType>,
{
    let mut accumulator = seed;
    for t in types {
        accumulator = Some(merge_dtypes(accumulator, t));
    }
    match accumulator {
        Some(t) => Ok(t),
        None => bail!("cannot merge the element types of a property with no values"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_width_by_capacity() {
        assert_eq!(IndexWidth::for_capacity(0), IndexWidth::I8);
        assert_eq!(IndexWidth::for_capacity(127), IndexWidth::I8);
        assert_eq!(IndexWidth::for_capacity(128), IndexWidth::I16);
        assert_eq!(IndexWidth::for_capacity(40_000), IndexWidth::I32);
        assert_eq!(IndexWidth::for_capacity(1 << 40), IndexWidth::I64);
    }

    #[test]
    fn merge_promotes_floats_by_width() {
        assert_eq!(
            merge_dtypes(Some(ScalarType::F32), ScalarType::I16),
            ScalarType::F32
        );
        assert_eq!(
            merge_dtypes(Some(ScalarType::F32), ScalarType::I64),
            ScalarType::F64
        );
        assert_eq!(
            merge_dtypes(Some(ScalarType::F64), ScalarType::F32),
            ScalarType::F64
        );
    }

    #[test]
    fn merge_promotes_unsigned_into_wider_signed() {
        assert_eq!(
            merge_dtypes(Some(ScalarType::U8), ScalarType::I8),
            ScalarType::I16
        );
        assert_eq!(
            merge_dtypes(Some(ScalarType::U16), ScalarType::I8),
            ScalarType::I32
        );
        assert_eq!(
            merge_dtypes(Some(ScalarType::U64), ScalarType::I8),
            ScalarType::I64
        );
        assert_eq!(
            merge_dtypes(Some(ScalarType::U8), ScalarType::U32),
            ScalarType::U32
        );
    }

    #[test]
    fn merge_strings_dominate() {
        assert_eq!(
            merge_dtypes(Some(ScalarType::Str), ScalarType::F64),
            ScalarType::Str
        );
        assert_eq!(
            merge_dtypes(Some(ScalarType::I32), ScalarType::Str),
            ScalarType::Str
        );
    }

    #[test]
    fn merge_seed_is_transparent() {
        assert_eq!(merge_dtypes(None, ScalarType::U16), ScalarType::U16);
        assert_eq!(
            merged_dtype(None, [ScalarType::Bool, ScalarType::Bool]).unwrap(),
            ScalarType::Bool
        );
        assert!(merged_dtype(None, []).is_err());
    }
}
