use anyhow::{anyhow, bail, ensure, Result};

use super::{
    dispatch_numeric_type, dispatch_scalar_type, with_dyn_vector, Element, ScalarType, ScalarValue,
};

/// A dense, contiguous sequence of one storage-scalar type.
#[derive(Clone, Debug, PartialEq)]
pub enum DynVector {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Bool(Vec<bool>),
    Str(Vec<String>),
}

impl DynVector {
    pub fn len(&self) -> usize {
        with_dyn_vector!(self, |v| v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            DynVector::I8(_) => ScalarType::I8,
            DynVector::I16(_) => ScalarType::I16,
            DynVector::I32(_) => ScalarType::I32,
            DynVector::I64(_) => ScalarType::I64,
            DynVector::U8(_) => ScalarType::U8,
            DynVector::U16(_) => ScalarType::U16,
            DynVector::U32(_) => ScalarType::U32,
            DynVector::U64(_) => ScalarType::U64,
            DynVector::F32(_) => ScalarType::F32,
            DynVector::F64(_) => ScalarType::F64,
            DynVector::Bool(_) => ScalarType::Bool,
            DynVector::Str(_) => ScalarType::Str,
        }
    }

    pub fn get(&self, index: usize) -> ScalarValue {
        with_dyn_vector!(self, |v| v[index].to_scalar())
    }

    /// A vector of `len` copies of `value`.
    pub fn filled(value: &ScalarValue, len: usize) -> DynVector {
        dispatch_scalar_type!(value.scalar_type(), T => {
            let typed = <T as Element>::from_scalar(value).unwrap();
            <T as Element>::dyn_from_vec(vec![typed; len])
        })
    }

    /// A vector of `len` zeros (empty strings for `Str`).
    pub fn zeros(element_type: ScalarType, len: usize) -> DynVector {
        dispatch_scalar_type!(element_type, T => {
            <T as Element>::dyn_from_vec(vec![<T as Element>::zero_element(); len])
        })
    }

    pub fn count_nonzero(&self) -> usize {
        with_dyn_vector!(self, |v| v
            .iter()
            .filter(|value| !value.is_zero_element())
            .count())
    }

    /// Indices (0-based, ascending) and values of the non-zero elements.
    pub fn nonzero_entries(&self) -> (Vec<usize>, DynVector) {
        with_dyn_vector!(self, |values| {
            let mut indices = Vec::new();
            let mut kept = Vec::new();
            for (index, value) in values.iter().enumerate() {
                if !value.is_zero_element() {
                    indices.push(index);
                    kept.push(value.clone());
                }
            }
            (indices, Element::dyn_from_vec(kept))
        })
    }

    /// Convert to another element type. Numeric conversions go through `num`
    /// and fail on values the target cannot represent; any type renders into
    /// strings; strings convert to nothing else.
    pub fn cast(&self, to: ScalarType) -> Result<DynVector> {
        if self.scalar_type() == to {
            return Ok(self.clone());
        }
        match self {
            DynVector::Str(_) => bail!(
                "cannot convert a vector of strings into a vector of {}",
                to
            ),
            DynVector::Bool(values) => {
                let bytes: Vec<u8> = values.iter().map(|value| u8::from(*value)).collect();
                cast_numeric_slice(&bytes, to)
            }
            other => with_dyn_vector!(other, |values| cast_any_slice(values, to)),
        }
    }
}

fn cast_any_slice<S: Element>(values: &[S], to: ScalarType) -> Result<DynVector> {
    match S::TYPE {
        ScalarType::Str | ScalarType::Bool => unreachable!("handled by the caller"),
        _ => dispatch_numeric_type!(S::TYPE, _Same => {
            let typed: Vec<_Same> = values
                .iter()
                .map(|value| _Same::from_scalar(&value.to_scalar()).unwrap())
                .collect();
            cast_numeric_slice(&typed, to)
        }, unreachable!(), unreachable!()),
    }
}

fn cast_numeric_slice<S>(values: &[S], to: ScalarType) -> Result<DynVector>
where
    S: num::ToPrimitive + Copy + std::fmt::Display,
{
    dispatch_numeric_type!(
        to,
        T => {
            let converted: Result<Vec<T>> = values
                .iter()
                .map(|value| {
                    num::NumCast::from(*value).ok_or_else(|| {
                        anyhow!("the value {} does not fit in {}", value, to)
                    })
                })
                .collect();
            Ok(<T as Element>::dyn_from_vec(converted?))
        },
        Ok(DynVector::Bool(
            values
                .iter()
                .map(|value| value.to_f64().map(|f| f != 0.0).unwrap_or(true))
                .collect()
        )),
        Ok(DynVector::Str(
            values.iter().map(|value| value.to_string()).collect()
        ))
    )
}

/// Convert one scalar value to another storage type, with the same rules as
/// [`DynVector::cast`].
pub fn cast_scalar(value: &ScalarValue, to: ScalarType) -> Result<ScalarValue> {
    if value.scalar_type() == to {
        return Ok(value.clone());
    }
    let as_vector = DynVector::filled(value, 1).cast(to)?;
    Ok(as_vector.get(0))
}

/// The compressed form of a vector: 0-based ascending indices of the stored
/// entries plus their values. On disk the indices are written 1-based at the
/// narrowest viable width; that is the backend's concern, not this type's.
#[derive(Clone, Debug, PartialEq)]
pub struct SparseVector {
    length: usize,
    nzind: Vec<usize>,
    nzval: DynVector,
}

impl SparseVector {
    pub fn new(length: usize, nzind: Vec<usize>, nzval: DynVector) -> Result<SparseVector> {
        ensure!(
            nzind.len() == nzval.len(),
            "sparse vector with {} indices but {} values",
            nzind.len(),
            nzval.len()
        );
        ensure!(
            nzval.scalar_type() != ScalarType::Str,
            "sparse vectors of strings are not expressible in memory"
        );
        for (position, index) in nzind.iter().enumerate() {
            ensure!(
                *index < length,
                "sparse vector index {} is out of the bounds of length {}",
                index,
                length
            );
            if position > 0 {
                ensure!(
                    nzind[position - 1] < *index,
                    "sparse vector indices are not sorted in strictly ascending order"
                );
            }
        }
        Ok(SparseVector {
            length,
            nzind,
            nzval,
        })
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn nnz(&self) -> usize {
        self.nzind.len()
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.nzval.scalar_type()
    }

    pub fn nzind(&self) -> &[usize] {
        &self.nzind
    }

    pub fn nzval(&self) -> &DynVector {
        &self.nzval
    }

    pub fn get(&self, index: usize) -> ScalarValue {
        match self.nzind.binary_search(&index) {
            Ok(position) => self.nzval.get(position),
            Err(_) => dispatch_scalar_type!(self.nzval.scalar_type(), T => {
                <T as Element>::zero_element().to_scalar()
            }),
        }
    }

    pub fn to_dense(&self) -> DynVector {
        dispatch_scalar_type!(self.nzval.scalar_type(), T => {
            let mut dense = vec![<T as Element>::zero_element(); self.length];
            let stored = <T as Element>::slice_of(&self.nzval).unwrap();
            for (index, value) in self.nzind.iter().zip(stored) {
                dense[*index] = value.clone();
            }
            <T as Element>::dyn_from_vec(dense)
        })
    }
}

/// A vector property: dense or sparse.
#[derive(Clone, Debug, PartialEq)]
pub enum VectorData {
    Dense(DynVector),
    Sparse(SparseVector),
}

impl VectorData {
    pub fn len(&self) -> usize {
        match self {
            VectorData::Dense(dense) => dense.len(),
            VectorData::Sparse(sparse) => sparse.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            VectorData::Dense(dense) => dense.scalar_type(),
            VectorData::Sparse(sparse) => sparse.scalar_type(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, VectorData::Sparse(_))
    }

    pub fn get(&self, index: usize) -> ScalarValue {
        match self {
            VectorData::Dense(dense) => dense.get(index),
            VectorData::Sparse(sparse) => sparse.get(index),
        }
    }

    /// Stored entries: all of them for a dense vector, the non-zeros for a
    /// sparse one. Used by the storage-fraction estimates.
    pub fn stored_entries(&self) -> usize {
        match self {
            VectorData::Dense(dense) => dense.len(),
            VectorData::Sparse(sparse) => sparse.nnz(),
        }
    }

    pub fn to_dense(&self) -> DynVector {
        match self {
            VectorData::Dense(dense) => dense.clone(),
            VectorData::Sparse(sparse) => sparse.to_dense(),
        }
    }

    /// Densify and convert in one step.
    pub fn to_dense_cast(&self, to: ScalarType) -> Result<DynVector> {
        self.to_dense().cast(to)
    }

    /// Compressed entries converted to `to`: 0-based indices plus values.
    /// A dense vector is compressed by dropping its zeros; explicit zeros
    /// stored in a sparse vector are preserved.
    pub fn to_sparse_cast(&self, to: ScalarType) -> Result<(Vec<usize>, DynVector)> {
        match self {
            VectorData::Dense(dense) => {
                let (indices, values) = dense.nonzero_entries();
                Ok((indices, values.cast(to)?))
            }
            VectorData::Sparse(sparse) => Ok((sparse.nzind.clone(), sparse.nzval.cast(to)?)),
        }
    }
}

impl From<DynVector> for VectorData {
    fn from(dense: DynVector) -> VectorData {
        VectorData::Dense(dense)
    }
}

impl From<SparseVector> for VectorData {
    fn from(sparse: SparseVector) -> VectorData {
        VectorData::Sparse(sparse)
    }
}

macro_rules! impl_dyn_vector_from {
    ($variant:ident, $t:ty) => {
        impl From<Vec<$t>> for DynVector {
            fn from(values: Vec<$t>) -> DynVector {
                DynVector::$variant(values)
            }
        }

        impl From<Vec<$t>> for VectorData {
            fn from(values: Vec<$t>) -> VectorData {
                VectorData::Dense(DynVector::$variant(values))
            }
        }
    };
}

impl_dyn_vector_from!(I8, i8);
impl_dyn_vector_from!(I16, i16);
impl_dyn_vector_from!(I32, i32);
impl_dyn_vector_from!(I64, i64);
impl_dyn_vector_from!(U8, u8);
impl_dyn_vector_from!(U16, u16);
impl_dyn_vector_from!(U32, u32);
impl_dyn_vector_from!(U64, u64);
impl_dyn_vector_from!(F32, f32);
impl_dyn_vector_from!(F64, f64);
impl_dyn_vector_from!(Bool, bool);
impl_dyn_vector_from!(Str, String);

impl From<Vec<&str>> for DynVector {
    fn from(values: Vec<&str>) -> DynVector {
        DynVector::Str(values.into_iter().map(str::to_owned).collect())
    }
}

impl From<Vec<&str>> for VectorData {
    fn from(values: Vec<&str>) -> VectorData {
        VectorData::Dense(DynVector::from(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cast_between_numeric_widths() {
        let vector = DynVector::from(vec![1u8, 2, 200]);
        assert_eq!(
            vector.cast(ScalarType::I32).unwrap(),
            DynVector::from(vec![1i32, 2, 200])
        );
        assert!(vector.cast(ScalarType::I8).is_err());
        assert_eq!(
            vector.cast(ScalarType::Str).unwrap(),
            DynVector::from(vec!["1", "2", "200"])
        );
    }

    #[test]
    fn cast_bool_round_trips_through_numbers() {
        let vector = DynVector::from(vec![true, false, true]);
        assert_eq!(
            vector.cast(ScalarType::U16).unwrap(),
            DynVector::from(vec![1u16, 0, 1])
        );
        let numbers = DynVector::from(vec![0i64, 3]);
        assert_eq!(
            numbers.cast(ScalarType::Bool).unwrap(),
            DynVector::from(vec![false, true])
        );
    }

    #[test]
    fn sparse_vector_validation() {
        assert!(SparseVector::new(4, vec![0, 2], DynVector::from(vec![1.0f32, 2.0])).is_ok());
        assert!(SparseVector::new(4, vec![2, 0], DynVector::from(vec![1.0f32, 2.0])).is_err());
        assert!(SparseVector::new(2, vec![2], DynVector::from(vec![1.0f32])).is_err());
        assert!(SparseVector::new(2, vec![0], DynVector::from(vec!["x"])).is_err());
    }

    #[test]
    fn sparse_dense_round_trip() {
        let sparse =
            SparseVector::new(5, vec![1, 3], DynVector::from(vec![10i32, 30])).unwrap();
        assert_eq!(
            sparse.to_dense(),
            DynVector::from(vec![0i32, 10, 0, 30, 0])
        );
        assert_eq!(sparse.get(3), ScalarValue::I32(30));
        assert_eq!(sparse.get(4), ScalarValue::I32(0));

        let dense = VectorData::from(vec![0i32, 10, 0, 30, 0]);
        let (indices, values) = dense.to_sparse_cast(ScalarType::I32).unwrap();
        assert_eq!(indices, vec![1, 3]);
        assert_eq!(values, DynVector::from(vec![10i32, 30]));
    }
}
