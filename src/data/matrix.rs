use anyhow::{anyhow, bail, Result};
use nalgebra_sparse::csc::CscMatrix;
use nalgebra_sparse::csr::CsrMatrix;
use ndarray::{Array2, Axis, ShapeBuilder};

use super::{dispatch_real_type, dispatch_scalar_type, DynVector, Element, ScalarType, ScalarValue};

/// Element types that can live in a dense matrix (all of them).
pub trait DenseElement: Element {
    fn dense_from(array: Array2<Self>) -> DynDense;
    fn array_of(dense: &DynDense) -> Option<&Array2<Self>>;
}

/// Element types that can live in a compressed matrix: numeric or bool.
pub trait SparseElement: DenseElement {
    fn csc_from(matrix: CscMatrix<Self>) -> DynCsc;
    fn csc_of(sparse: &DynCsc) -> Option<&CscMatrix<Self>>;
    fn csr_from(matrix: CsrMatrix<Self>) -> DynCsr;
    fn csr_of(sparse: &DynCsr) -> Option<&CsrMatrix<Self>>;
}

macro_rules! impl_dense_element {
    ($variant:ident, $t:ty) => {
        impl DenseElement for $t {
            fn dense_from(array: Array2<Self>) -> DynDense {
                DynDense::$variant(array)
            }

            fn array_of(dense: &DynDense) -> Option<&Array2<Self>> {
                match dense {
                    DynDense::$variant(array) => Some(array),
                    _ => None,
                }
            }
        }
    };
}

macro_rules! impl_sparse_element {
    ($variant:ident, $t:ty) => {
        impl_dense_element!($variant, $t);

        impl SparseElement for $t {
            fn csc_from(matrix: CscMatrix<Self>) -> DynCsc {
                DynCsc::$variant(matrix)
            }

            fn csc_of(sparse: &DynCsc) -> Option<&CscMatrix<Self>> {
                match sparse {
                    DynCsc::$variant(matrix) => Some(matrix),
                    _ => None,
                }
            }

            fn csr_from(matrix: CsrMatrix<Self>) -> DynCsr {
                DynCsr::$variant(matrix)
            }

            fn csr_of(sparse: &DynCsr) -> Option<&CsrMatrix<Self>> {
                match sparse {
                    DynCsr::$variant(matrix) => Some(matrix),
                    _ => None,
                }
            }
        }
    };
}

impl_sparse_element!(I8, i8);
impl_sparse_element!(I16, i16);
impl_sparse_element!(I32, i32);
impl_sparse_element!(I64, i64);
impl_sparse_element!(U8, u8);
impl_sparse_element!(U16, u16);
impl_sparse_element!(U32, u32);
impl_sparse_element!(U64, u64);
impl_sparse_element!(F32, f32);
impl_sparse_element!(F64, f64);
impl_sparse_element!(Bool, bool);
impl_dense_element!(Str, String);

/// A dense 2-D array of one storage-scalar type. The stride order of the
/// underlying array is meaningful: it decides the major axis.
#[derive(Clone, Debug, PartialEq)]
pub enum DynDense {
    I8(Array2<i8>),
    I16(Array2<i16>),
    I32(Array2<i32>),
    I64(Array2<i64>),
    U8(Array2<u8>),
    U16(Array2<u16>),
    U32(Array2<u32>),
    U64(Array2<u64>),
    F32(Array2<f32>),
    F64(Array2<f64>),
    Bool(Array2<bool>),
    Str(Array2<String>),
}

macro_rules! with_dyn_dense {
    ($value:expr, |$m:ident| $body:expr) => {
        match $value {
            $crate::data::DynDense::I8($m) => $body,
            $crate::data::DynDense::I16($m) => $body,
            $crate::data::DynDense::I32($m) => $body,
            $crate::data::DynDense::I64($m) => $body,
            $crate::data::DynDense::U8($m) => $body,
            $crate::data::DynDense::U16($m) => $body,
            $crate::data::DynDense::U32($m) => $body,
            $crate::data::DynDense::U64($m) => $body,
            $crate::data::DynDense::F32($m) => $body,
            $crate::data::DynDense::F64($m) => $body,
            $crate::data::DynDense::Bool($m) => $body,
            $crate::data::DynDense::Str($m) => $body,
        }
    };
}

pub(crate) use with_dyn_dense;

/// A compressed-sparse-column matrix of one real storage type. The values of
/// each column are contiguous: the major axis is always `Columns`.
#[derive(Clone, Debug, PartialEq)]
pub enum DynCsc {
    I8(CscMatrix<i8>),
    I16(CscMatrix<i16>),
    I32(CscMatrix<i32>),
    I64(CscMatrix<i64>),
    U8(CscMatrix<u8>),
    U16(CscMatrix<u16>),
    U32(CscMatrix<u32>),
    U64(CscMatrix<u64>),
    F32(CscMatrix<f32>),
    F64(CscMatrix<f64>),
    Bool(CscMatrix<bool>),
}

macro_rules! with_dyn_csc {
    ($value:expr, |$m:ident| $body:expr) => {
        match $value {
            $crate::data::DynCsc::I8($m) => $body,
            $crate::data::DynCsc::I16($m) => $body,
            $crate::data::DynCsc::I32($m) => $body,
            $crate::data::DynCsc::I64($m) => $body,
            $crate::data::DynCsc::U8($m) => $body,
            $crate::data::DynCsc::U16($m) => $body,
            $crate::data::DynCsc::U32($m) => $body,
            $crate::data::DynCsc::U64($m) => $body,
            $crate::data::DynCsc::F32($m) => $body,
            $crate::data::DynCsc::F64($m) => $body,
            $crate::data::DynCsc::Bool($m) => $body,
        }
    };
}

pub(crate) use with_dyn_csc;

/// A compressed-sparse-row matrix: the mirror image of [`DynCsc`], with the
/// major axis always `Rows`.
#[derive(Clone, Debug, PartialEq)]
pub enum DynCsr {
    I8(CsrMatrix<i8>),
    I16(CsrMatrix<i16>),
    I32(CsrMatrix<i32>),
    I64(CsrMatrix<i64>),
    U8(CsrMatrix<u8>),
    U16(CsrMatrix<u16>),
    U32(CsrMatrix<u32>),
    U64(CsrMatrix<u64>),
    F32(CsrMatrix<f32>),
    F64(CsrMatrix<f64>),
    Bool(CsrMatrix<bool>),
}

macro_rules! with_dyn_csr {
    ($value:expr, |$m:ident| $body:expr) => {
        match $value {
            $crate::data::DynCsr::I8($m) => $body,
            $crate::data::DynCsr::I16($m) => $body,
            $crate::data::DynCsr::I32($m) => $body,
            $crate::data::DynCsr::I64($m) => $body,
            $crate::data::DynCsr::U8($m) => $body,
            $crate::data::DynCsr::U16($m) => $body,
            $crate::data::DynCsr::U32($m) => $body,
            $crate::data::DynCsr::U64($m) => $body,
            $crate::data::DynCsr::F32($m) => $body,
            $crate::data::DynCsr::F64($m) => $body,
            $crate::data::DynCsr::Bool($m) => $body,
        }
    };
}

pub(crate) use with_dyn_csr;

impl DynDense {
    pub fn shape(&self) -> (usize, usize) {
        with_dyn_dense!(self, |m| m.dim())
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            DynDense::I8(_) => ScalarType::I8,
            DynDense::I16(_) => ScalarType::I16,
            DynDense::I32(_) => ScalarType::I32,
            DynDense::I64(_) => ScalarType::I64,
            DynDense::U8(_) => ScalarType::U8,
            DynDense::U16(_) => ScalarType::U16,
            DynDense::U32(_) => ScalarType::U32,
            DynDense::U64(_) => ScalarType::U64,
            DynDense::F32(_) => ScalarType::F32,
            DynDense::F64(_) => ScalarType::F64,
            DynDense::Bool(_) => ScalarType::Bool,
            DynDense::Str(_) => ScalarType::Str,
        }
    }

    pub fn get(&self, row: usize, column: usize) -> ScalarValue {
        with_dyn_dense!(self, |m| m[[row, column]].to_scalar())
    }

    pub fn count_nonzero(&self) -> usize {
        with_dyn_dense!(self, |m| m
            .iter()
            .filter(|value| !value.is_zero_element())
            .count())
    }

    /// Row strides and column strides of the underlying array.
    pub fn strides(&self) -> (isize, isize) {
        with_dyn_dense!(self, |m| {
            let strides = m.strides();
            (strides[0], strides[1])
        })
    }

    /// The elements in memory order (column-major for a column-major array).
    pub fn memory_order_values(&self) -> DynVector {
        with_dyn_dense!(self, |m| {
            match m.as_slice_memory_order() {
                Some(slice) => Element::dyn_from_vec(slice.to_vec()),
                None => Element::dyn_from_vec(m.iter().cloned().collect()),
            }
        })
    }

    /// The elements in column-major order regardless of the array's layout.
    pub fn column_major_values(&self) -> DynVector {
        with_dyn_dense!(self, |m| {
            let mut values = Vec::with_capacity(m.len());
            for column in m.axis_iter(Axis(1)) {
                values.extend(column.iter().cloned());
            }
            Element::dyn_from_vec(values)
        })
    }

    /// Build a column-major dense matrix from values in column-major order.
    pub fn from_column_major(
        nrows: usize,
        ncols: usize,
        values: DynVector,
    ) -> Result<DynDense> {
        dispatch_scalar_type!(values.scalar_type(), T => {
            let typed = <T as Element>::slice_of(&values).unwrap().to_vec();
            let array = Array2::from_shape_vec((nrows, ncols).f(), typed)
                .map_err(|error| anyhow!("{}", error))?;
            Ok(<T as DenseElement>::dense_from(array))
        })
    }

    /// Convert the elements, preserving shape and stride order.
    pub fn cast(&self, to: ScalarType) -> Result<DynDense> {
        if self.scalar_type() == to {
            return Ok(self.clone());
        }
        let (nrows, ncols) = self.shape();
        let (row_stride, column_stride) = self.strides();
        if column_stride == 1 && row_stride != 1 {
            // Row-major input rebuilds row-major.
            let values = with_dyn_dense!(self, |m| {
                Element::dyn_from_vec(m.iter().cloned().collect())
            })
            .cast(to)?;
            dispatch_scalar_type!(to, T => {
                let typed = <T as Element>::slice_of(&values).unwrap().to_vec();
                let array = Array2::from_shape_vec((nrows, ncols), typed)
                    .map_err(|error| anyhow!("{}", error))?;
                Ok(<T as DenseElement>::dense_from(array))
            })
        } else {
            let values = self.column_major_values().cast(to)?;
            DynDense::from_column_major(nrows, ncols, values)
        }
    }
}

impl DynCsc {
    pub fn shape(&self) -> (usize, usize) {
        with_dyn_csc!(self, |m| (m.nrows(), m.ncols()))
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            DynCsc::I8(_) => ScalarType::I8,
            DynCsc::I16(_) => ScalarType::I16,
            DynCsc::I32(_) => ScalarType::I32,
            DynCsc::I64(_) => ScalarType::I64,
            DynCsc::U8(_) => ScalarType::U8,
            DynCsc::U16(_) => ScalarType::U16,
            DynCsc::U32(_) => ScalarType::U32,
            DynCsc::U64(_) => ScalarType::U64,
            DynCsc::F32(_) => ScalarType::F32,
            DynCsc::F64(_) => ScalarType::F64,
            DynCsc::Bool(_) => ScalarType::Bool,
        }
    }

    pub fn nnz(&self) -> usize {
        with_dyn_csc!(self, |m| m.nnz())
    }

    /// 0-based column offsets, length `ncols + 1`.
    pub fn col_offsets(&self) -> &[usize] {
        with_dyn_csc!(self, |m| m.col_offsets())
    }

    /// 0-based row indices, sorted within each column.
    pub fn row_indices(&self) -> &[usize] {
        with_dyn_csc!(self, |m| m.row_indices())
    }

    pub fn values(&self) -> DynVector {
        with_dyn_csc!(self, |m| Element::dyn_from_vec(m.values().to_vec()))
    }

    pub fn get(&self, row: usize, column: usize) -> ScalarValue {
        let stored = with_dyn_csc!(self, |m| {
            let lo = m.col_offsets()[column];
            let hi = m.col_offsets()[column + 1];
            m.row_indices()[lo..hi]
                .binary_search(&row)
                .ok()
                .map(|position| m.values()[lo + position].to_scalar())
        });
        stored.unwrap_or_else(|| super::zero_scalar(self.scalar_type()))
    }

    pub fn from_parts(
        nrows: usize,
        ncols: usize,
        col_offsets: Vec<usize>,
        row_indices: Vec<usize>,
        values: DynVector,
    ) -> Result<DynCsc> {
        dispatch_real_type!(values.scalar_type(), T => {
            let typed = <T as Element>::slice_of(&values).unwrap().to_vec();
            let matrix =
                CscMatrix::try_from_csc_data(nrows, ncols, col_offsets, row_indices, typed)
                    .map_err(|error| anyhow!("invalid compressed columns: {}", error))?;
            Ok(<T as SparseElement>::csc_from(matrix))
        }, bail!("compressed matrices of strings are not expressible in memory"))
    }

    pub fn cast(&self, to: ScalarType) -> Result<DynCsc> {
        if self.scalar_type() == to {
            return Ok(self.clone());
        }
        let (nrows, ncols) = self.shape();
        DynCsc::from_parts(
            nrows,
            ncols,
            self.col_offsets().to_vec(),
            self.row_indices().to_vec(),
            self.values().cast(to)?,
        )
    }
}

impl DynCsr {
    pub fn shape(&self) -> (usize, usize) {
        with_dyn_csr!(self, |m| (m.nrows(), m.ncols()))
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            DynCsr::I8(_) => ScalarType::I8,
            DynCsr::I16(_) => ScalarType::I16,
            DynCsr::I32(_) => ScalarType::I32,
            DynCsr::I64(_) => ScalarType::I64,
            DynCsr::U8(_) => ScalarType::U8,
            DynCsr::U16(_) => ScalarType::U16,
            DynCsr::U32(_) => ScalarType::U32,
            DynCsr::U64(_) => ScalarType::U64,
            DynCsr::F32(_) => ScalarType::F32,
            DynCsr::F64(_) => ScalarType::F64,
            DynCsr::Bool(_) => ScalarType::Bool,
        }
    }

    pub fn nnz(&self) -> usize {
        with_dyn_csr!(self, |m| m.nnz())
    }

    pub fn row_offsets(&self) -> &[usize] {
        with_dyn_csr!(self, |m| m.row_offsets())
    }

    pub fn col_indices(&self) -> &[usize] {
        with_dyn_csr!(self, |m| m.col_indices())
    }

    pub fn values(&self) -> DynVector {
        with_dyn_csr!(self, |m| Element::dyn_from_vec(m.values().to_vec()))
    }

    pub fn get(&self, row: usize, column: usize) -> ScalarValue {
        let stored = with_dyn_csr!(self, |m| {
            let lo = m.row_offsets()[row];
            let hi = m.row_offsets()[row + 1];
            m.col_indices()[lo..hi]
                .binary_search(&column)
                .ok()
                .map(|position| m.values()[lo + position].to_scalar())
        });
        stored.unwrap_or_else(|| super::zero_scalar(self.scalar_type()))
    }

    pub fn from_parts(
        nrows: usize,
        ncols: usize,
        row_offsets: Vec<usize>,
        col_indices: Vec<usize>,
        values: DynVector,
    ) -> Result<DynCsr> {
        dispatch_real_type!(values.scalar_type(), T => {
            let typed = <T as Element>::slice_of(&values).unwrap().to_vec();
            let matrix =
                CsrMatrix::try_from_csr_data(nrows, ncols, row_offsets, col_indices, typed)
                    .map_err(|error| anyhow!("invalid compressed rows: {}", error))?;
            Ok(<T as SparseElement>::csr_from(matrix))
        }, bail!("compressed matrices of strings are not expressible in memory"))
    }

    pub fn cast(&self, to: ScalarType) -> Result<DynCsr> {
        if self.scalar_type() == to {
            return Ok(self.clone());
        }
        let (nrows, ncols) = self.shape();
        DynCsr::from_parts(
            nrows,
            ncols,
            self.row_offsets().to_vec(),
            self.col_indices().to_vec(),
            self.values().cast(to)?,
        )
    }
}

/// A matrix property in any of its three physical forms. The form encodes
/// the major axis: compressed columns are `Columns`-major, compressed rows
/// are `Rows`-major, and a dense array carries its order in its strides.
#[derive(Clone, Debug, PartialEq)]
pub enum MatrixData {
    Dense(DynDense),
    Csc(DynCsc),
    Csr(DynCsr),
}

impl MatrixData {
    pub fn shape(&self) -> (usize, usize) {
        match self {
            MatrixData::Dense(dense) => dense.shape(),
            MatrixData::Csc(sparse) => sparse.shape(),
            MatrixData::Csr(sparse) => sparse.shape(),
        }
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            MatrixData::Dense(dense) => dense.scalar_type(),
            MatrixData::Csc(sparse) => sparse.scalar_type(),
            MatrixData::Csr(sparse) => sparse.scalar_type(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        !matches!(self, MatrixData::Dense(_))
    }

    pub fn get(&self, row: usize, column: usize) -> ScalarValue {
        match self {
            MatrixData::Dense(dense) => dense.get(row, column),
            MatrixData::Csc(sparse) => sparse.get(row, column),
            MatrixData::Csr(sparse) => sparse.get(row, column),
        }
    }

    /// Stored entries: all elements of a dense matrix, the structural
    /// non-zeros of a compressed one.
    pub fn stored_entries(&self) -> usize {
        match self {
            MatrixData::Dense(dense) => {
                let (nrows, ncols) = dense.shape();
                nrows * ncols
            }
            MatrixData::Csc(sparse) => sparse.nnz(),
            MatrixData::Csr(sparse) => sparse.nnz(),
        }
    }

    /// Structural non-zeros, counting a dense matrix's actual non-zeros.
    pub fn count_nonzero(&self) -> usize {
        match self {
            MatrixData::Dense(dense) => dense.count_nonzero(),
            MatrixData::Csc(sparse) => sparse.nnz(),
            MatrixData::Csr(sparse) => sparse.nnz(),
        }
    }

    pub fn cast(&self, to: ScalarType) -> Result<MatrixData> {
        match self {
            MatrixData::Dense(dense) => Ok(MatrixData::Dense(dense.cast(to)?)),
            MatrixData::Csc(sparse) => Ok(MatrixData::Csc(sparse.cast(to)?)),
            MatrixData::Csr(sparse) => Ok(MatrixData::Csr(sparse.cast(to)?)),
        }
    }

    /// Element-wise equality across physical forms.
    pub fn same_values(&self, other: &MatrixData) -> bool {
        if self.shape() != other.shape() {
            return false;
        }
        let (nrows, ncols) = self.shape();
        for column in 0..ncols {
            for row in 0..nrows {
                if self.get(row, column) != other.get(row, column) {
                    return false;
                }
            }
        }
        true
    }
}

impl From<DynDense> for MatrixData {
    fn from(dense: DynDense) -> MatrixData {
        MatrixData::Dense(dense)
    }
}

impl From<DynCsc> for MatrixData {
    fn from(sparse: DynCsc) -> MatrixData {
        MatrixData::Csc(sparse)
    }
}

impl From<DynCsr> for MatrixData {
    fn from(sparse: DynCsr) -> MatrixData {
        MatrixData::Csr(sparse)
    }
}

macro_rules! impl_matrix_from {
    ($variant:ident, $t:ty) => {
        impl From<Array2<$t>> for DynDense {
            fn from(array: Array2<$t>) -> DynDense {
                DynDense::$variant(array)
            }
        }

        impl From<Array2<$t>> for MatrixData {
            fn from(array: Array2<$t>) -> MatrixData {
                MatrixData::Dense(DynDense::$variant(array))
            }
        }
    };
}

impl_matrix_from!(I8, i8);
impl_matrix_from!(I16, i16);
impl_matrix_from!(I32, i32);
impl_matrix_from!(I64, i64);
impl_matrix_from!(U8, u8);
impl_matrix_from!(U16, u16);
impl_matrix_from!(U32, u32);
impl_matrix_from!(U64, u64);
impl_matrix_from!(F32, f32);
impl_matrix_from!(F64, f64);
impl_matrix_from!(Bool, bool);
impl_matrix_from!(Str, String);

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn dense_column_major_round_trip() {
        let dense = DynDense::from_column_major(
            3,
            2,
            DynVector::from(vec![0i64, 2, 3, 1, 0, 4]),
        )
        .unwrap();
        assert_eq!(dense.shape(), (3, 2));
        assert_eq!(dense.get(0, 1), ScalarValue::I64(1));
        assert_eq!(dense.get(2, 0), ScalarValue::I64(3));
        assert_eq!(dense.strides().0, 1);
        assert_eq!(
            dense.column_major_values(),
            DynVector::from(vec![0i64, 2, 3, 1, 0, 4])
        );
    }

    #[test]
    fn csc_construction_and_lookup() {
        // [[1, 0], [0, 2], [3, 0]]
        let sparse = DynCsc::from_parts(
            3,
            2,
            vec![0, 2, 3],
            vec![0, 2, 1],
            DynVector::from(vec![1i32, 3, 2]),
        )
        .unwrap();
        assert_eq!(sparse.nnz(), 3);
        assert_eq!(sparse.get(0, 0), ScalarValue::I32(1));
        assert_eq!(sparse.get(1, 0), ScalarValue::I32(0));
        assert_eq!(sparse.get(1, 1), ScalarValue::I32(2));
    }

    #[test]
    fn csc_rejects_malformed_offsets() {
        assert!(DynCsc::from_parts(
            2,
            2,
            vec![0, 2, 1],
            vec![0, 1, 0],
            DynVector::from(vec![1i32, 2, 3]),
        )
        .is_err());
        assert!(DynCsc::from_parts(
            2,
            1,
            vec![0, 1],
            vec![0],
            DynVector::from(vec!["x"]),
        )
        .is_err());
    }

    #[test]
    fn matrix_value_equality_across_forms() {
        let dense = MatrixData::from(array![[1i32, 0], [0, 2], [3, 0]]);
        let sparse = MatrixData::Csc(
            DynCsc::from_parts(
                3,
                2,
                vec![0, 2, 3],
                vec![0, 2, 1],
                DynVector::from(vec![1i32, 3, 2]),
            )
            .unwrap(),
        );
        assert!(dense.same_values(&sparse));
        assert_eq!(dense.count_nonzero(), 3);
        assert_eq!(sparse.stored_entries(), 3);
    }
}
