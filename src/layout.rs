//! The matrix-layout discipline: which of the two axes of a matrix is
//! contiguous in memory, how to physically rearrange a matrix to flip that,
//! and when a compressed representation pays for itself.

use anyhow::{anyhow, bail, Result};
use ndarray::{Array2, ArrayView2, Axis, ShapeBuilder};

use crate::data::{
    with_dyn_csc, with_dyn_csr, with_dyn_dense, DenseElement, DynCsc, DynCsr, DynDense, DynVector,
    Element, IndexWidth, MatrixData, ScalarType, SparseVector, VectorData,
};
use crate::globals::{inefficient_action_policy, InefficientPolicy};

/// Symbolic labels for the two axes of a matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MatrixAxis {
    Rows,
    Columns,
}

impl MatrixAxis {
    pub fn other(self) -> MatrixAxis {
        match self {
            MatrixAxis::Rows => MatrixAxis::Columns,
            MatrixAxis::Columns => MatrixAxis::Rows,
        }
    }
}

impl std::fmt::Display for MatrixAxis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatrixAxis::Rows => f.write_str("rows"),
            MatrixAxis::Columns => f.write_str("columns"),
        }
    }
}

/// Which axis of the matrix is contiguous in memory: `Columns` when stride-1
/// runs along the rows (column-major), `Rows` when it runs along the columns
/// (row-major), `None` when neither does.
pub fn major_axis(matrix: &MatrixData) -> Option<MatrixAxis> {
    match matrix {
        MatrixData::Dense(dense) => dense_major_axis(dense),
        MatrixData::Csc(_) => Some(MatrixAxis::Columns),
        MatrixData::Csr(_) => Some(MatrixAxis::Rows),
    }
}

fn dense_major_axis(dense: &DynDense) -> Option<MatrixAxis> {
    let (row_stride, column_stride) = dense.strides();
    if row_stride == 1 {
        Some(MatrixAxis::Columns)
    } else if column_stride == 1 {
        Some(MatrixAxis::Rows)
    } else {
        None
    }
}

/// Check that an operation about to traverse `matrix` finds `needed`
/// contiguous, applying the process-wide inefficiency policy when it does
/// not.
#[track_caller]
pub fn require_major_axis(matrix: &MatrixData, needed: MatrixAxis, operand: &str) -> Result<()> {
    let actual = major_axis(matrix);
    if actual == Some(needed) {
        return Ok(());
    }
    let location = std::panic::Location::caller();
    match inefficient_action_policy() {
        InefficientPolicy::Ignore => Ok(()),
        InefficientPolicy::Warn => {
            log::warn!(
                "inefficient access of {}: the major axis is {} but the operation at {}:{} needs {}",
                operand,
                actual.map_or_else(|| "neither".to_owned(), |axis| axis.to_string()),
                location.file(),
                location.line(),
                needed,
            );
            Ok(())
        }
        InefficientPolicy::Error => bail!(
            "inefficient access of {}: the major axis is {} but the operation at {}:{} needs {}",
            operand,
            actual.map_or_else(|| "neither".to_owned(), |axis| axis.to_string()),
            location.file(),
            location.line(),
            needed,
        ),
    }
}

/// Transpose a compressed-by-major representation into the equivalent
/// compressed-by-minor one. The stable scatter keeps the minor indices of
/// the output sorted within each major slice.
fn transpose_compressed<T: Clone>(
    nminor: usize,
    offsets: &[usize],
    indices: &[usize],
    values: &[T],
) -> (Vec<usize>, Vec<usize>, Vec<T>) {
    let nmajor = offsets.len() - 1;
    let nnz = values.len();

    let mut out_offsets = vec![0usize; nminor + 1];
    for index in indices {
        out_offsets[index + 1] += 1;
    }
    for minor in 0..nminor {
        out_offsets[minor + 1] += out_offsets[minor];
    }

    let mut next = out_offsets[..nminor].to_vec();
    let mut out_indices = vec![0usize; nnz];
    // Seeded with the input values; the scatter below overwrites every slot.
    let mut out_values = values.to_vec();
    for major in 0..nmajor {
        for position in offsets[major]..offsets[major + 1] {
            let minor = indices[position];
            let slot = next[minor];
            next[minor] += 1;
            out_indices[slot] = major;
            out_values[slot] = values[position].clone();
        }
    }
    (out_offsets, out_indices, out_values)
}

fn dense_in_order(dense: &DynDense, order: MatrixAxis) -> Result<DynDense> {
    with_dyn_dense!(dense, |m| Ok(DenseElement::dense_from(materialize_view(
        m.view(),
        order
    )?)))
}

fn materialize_view<T: Element>(view: ArrayView2<T>, order: MatrixAxis) -> Result<Array2<T>> {
    let dim = view.dim();
    match order {
        MatrixAxis::Rows => {
            let values: Vec<T> = view.iter().cloned().collect();
            Array2::from_shape_vec(dim, values).map_err(|error| anyhow!("{}", error))
        }
        MatrixAxis::Columns => {
            let mut values = Vec::with_capacity(view.len());
            for column in view.axis_iter(Axis(1)) {
                values.extend(column.iter().cloned());
            }
            Array2::from_shape_vec(dim.f(), values).map_err(|error| anyhow!("{}", error))
        }
    }
}

/// Physically rearrange the elements so that the result has the same shape
/// but the opposite major axis. A compressed matrix is rebuilt by transposing
/// its representation, never by a zero-copy wrapper.
pub fn relayout(matrix: &MatrixData) -> Result<MatrixData> {
    match matrix {
        MatrixData::Dense(dense) => {
            let target = dense_major_axis(dense)
                .unwrap_or(MatrixAxis::Rows)
                .other();
            Ok(MatrixData::Dense(dense_in_order(dense, target)?))
        }
        MatrixData::Csc(sparse) => {
            let (nrows, ncols) = sparse.shape();
            let (offsets, indices, values) = with_dyn_csc!(sparse, |m| {
                let (offsets, indices, values) =
                    transpose_compressed(m.nrows(), m.col_offsets(), m.row_indices(), m.values());
                (offsets, indices, Element::dyn_from_vec(values))
            });
            Ok(MatrixData::Csr(DynCsr::from_parts(
                nrows, ncols, offsets, indices, values,
            )?))
        }
        MatrixData::Csr(sparse) => {
            let (nrows, ncols) = sparse.shape();
            let (offsets, indices, values) = with_dyn_csr!(sparse, |m| {
                let (offsets, indices, values) =
                    transpose_compressed(m.ncols(), m.row_offsets(), m.col_indices(), m.values());
                (offsets, indices, Element::dyn_from_vec(values))
            });
            Ok(MatrixData::Csc(DynCsc::from_parts(
                nrows, ncols, offsets, indices, values,
            )?))
        }
    }
}

/// Physically build the transpose: flipped axes, same major-axis label.
/// Composing with the form flip of [`relayout`], `transposer(relayout(M))`
/// is the zero-rearrangement transpose of `M`.
pub fn transposer(matrix: &MatrixData) -> Result<MatrixData> {
    match matrix {
        MatrixData::Dense(dense) => {
            let order = dense_major_axis(dense).unwrap_or(MatrixAxis::Columns);
            let transposed = with_dyn_dense!(dense, |m| {
                Ok::<DynDense, anyhow::Error>(DenseElement::dense_from(materialize_view(
                    m.t(),
                    order,
                )?))
            })?;
            Ok(MatrixData::Dense(transposed))
        }
        MatrixData::Csc(sparse) => {
            let (nrows, ncols) = sparse.shape();
            let (offsets, indices, values) = with_dyn_csc!(sparse, |m| {
                let (offsets, indices, values) =
                    transpose_compressed(m.nrows(), m.col_offsets(), m.row_indices(), m.values());
                (offsets, indices, Element::dyn_from_vec(values))
            });
            // The compressed rows of M are exactly the compressed columns of
            // its transpose.
            Ok(MatrixData::Csc(DynCsc::from_parts(
                ncols, nrows, offsets, indices, values,
            )?))
        }
        MatrixData::Csr(sparse) => {
            let (nrows, ncols) = sparse.shape();
            let (offsets, indices, values) = with_dyn_csr!(sparse, |m| {
                let (offsets, indices, values) =
                    transpose_compressed(m.ncols(), m.row_offsets(), m.col_indices(), m.values());
                (offsets, indices, Element::dyn_from_vec(values))
            });
            Ok(MatrixData::Csr(DynCsr::from_parts(
                ncols, nrows, offsets, indices, values,
            )?))
        }
    }
}

/// A mutable copy preserving the physical form.
pub fn copy_array(matrix: &MatrixData) -> MatrixData {
    matrix.clone()
}

/// Compress a matrix, preserving its major axis: a column-major dense matrix
/// compresses into columns, a row-major one into rows.
pub fn sparsify(matrix: &MatrixData, element_type: Option<ScalarType>) -> Result<MatrixData> {
    let converted;
    let matrix = match element_type {
        Some(to) if to != matrix.scalar_type() => {
            converted = matrix.cast(to)?;
            &converted
        }
        _ => matrix,
    };
    match matrix {
        MatrixData::Csc(_) | MatrixData::Csr(_) => Ok(matrix.clone()),
        MatrixData::Dense(dense) => match dense_major_axis(dense).unwrap_or(MatrixAxis::Columns) {
            MatrixAxis::Columns => {
                let (nrows, ncols) = dense.shape();
                let (offsets, indices, values) = compress_lanes(dense, Axis(1));
                Ok(MatrixData::Csc(DynCsc::from_parts(
                    nrows, ncols, offsets, indices, values,
                )?))
            }
            MatrixAxis::Rows => {
                let (nrows, ncols) = dense.shape();
                let (offsets, indices, values) = compress_lanes(dense, Axis(0));
                Ok(MatrixData::Csr(DynCsr::from_parts(
                    nrows, ncols, offsets, indices, values,
                )?))
            }
        },
    }
}

fn compress_lanes(dense: &DynDense, major: Axis) -> (Vec<usize>, Vec<usize>, DynVector) {
    with_dyn_dense!(dense, |m| {
        let mut offsets = Vec::with_capacity(m.len_of(major) + 1);
        offsets.push(0);
        let mut indices = Vec::new();
        let mut values = Vec::new();
        for lane in m.axis_iter(major) {
            for (minor, value) in lane.iter().enumerate() {
                if !value.is_zero_element() {
                    indices.push(minor);
                    values.push(value.clone());
                }
            }
            offsets.push(indices.len());
        }
        (offsets, indices, Element::dyn_from_vec(values))
    })
}

/// Expand a matrix into its dense form, preserving the major axis.
pub fn densify(matrix: &MatrixData, element_type: Option<ScalarType>) -> Result<MatrixData> {
    let converted;
    let matrix = match element_type {
        Some(to) if to != matrix.scalar_type() => {
            converted = matrix.cast(to)?;
            &converted
        }
        _ => matrix,
    };
    match matrix {
        MatrixData::Dense(_) => Ok(matrix.clone()),
        MatrixData::Csc(sparse) => {
            let dense = with_dyn_csc!(sparse, |m| {
                let mut out = Array2::from_elem(
                    (m.nrows(), m.ncols()).f(),
                    Element::zero_element(),
                );
                for column in 0..m.ncols() {
                    for position in m.col_offsets()[column]..m.col_offsets()[column + 1] {
                        out[[m.row_indices()[position], column]] = m.values()[position].clone();
                    }
                }
                DenseElement::dense_from(out)
            });
            Ok(MatrixData::Dense(dense))
        }
        MatrixData::Csr(sparse) => {
            let dense = with_dyn_csr!(sparse, |m| {
                let mut out =
                    Array2::from_elem((m.nrows(), m.ncols()), Element::zero_element());
                for row in 0..m.nrows() {
                    for position in m.row_offsets()[row]..m.row_offsets()[row + 1] {
                        out[[row, m.col_indices()[position]]] = m.values()[position].clone();
                    }
                }
                DenseElement::dense_from(out)
            });
            Ok(MatrixData::Dense(dense))
        }
    }
}

/// Pick the compressed form when it saves at least `threshold` of the dense
/// byte footprint, the dense form otherwise.
pub fn bestify(
    matrix: &MatrixData,
    threshold: f64,
    element_type: Option<ScalarType>,
) -> Result<MatrixData> {
    let element = element_type.unwrap_or_else(|| matrix.scalar_type());
    let (nrows, ncols) = matrix.shape();
    let nnz = matrix.count_nonzero();
    if matrix_sparse_saves_fraction(element, nrows, ncols, nnz) >= threshold {
        sparsify(matrix, element_type)
    } else {
        densify(matrix, element_type)
    }
}

/// Compress a vector, dropping its zeros.
pub fn sparsify_vector(
    vector: &VectorData,
    element_type: Option<ScalarType>,
) -> Result<VectorData> {
    let to = element_type.unwrap_or_else(|| vector.scalar_type());
    let (indices, values) = vector.to_sparse_cast(to)?;
    Ok(VectorData::Sparse(SparseVector::new(
        vector.len(),
        indices,
        values,
    )?))
}

/// Expand a vector into its dense form.
pub fn densify_vector(
    vector: &VectorData,
    element_type: Option<ScalarType>,
) -> Result<VectorData> {
    let to = element_type.unwrap_or_else(|| vector.scalar_type());
    Ok(VectorData::Dense(vector.to_dense_cast(to)?))
}

/// The sparse-or-dense choice for vectors, mirroring [`bestify`].
pub fn bestify_vector(
    vector: &VectorData,
    threshold: f64,
    element_type: Option<ScalarType>,
) -> Result<VectorData> {
    let element = element_type.unwrap_or_else(|| vector.scalar_type());
    let nnz = match vector {
        VectorData::Dense(dense) => dense.count_nonzero(),
        VectorData::Sparse(sparse) => sparse.nnz(),
    };
    if vector_sparse_saves_fraction(element, vector.len(), nnz) >= threshold {
        sparsify_vector(vector, element_type)
    } else {
        densify_vector(vector, element_type)
    }
}

pub fn dense_vector_bytes(element_type: ScalarType, len: usize) -> usize {
    len * element_type.size_of()
}

pub fn sparse_vector_bytes(element_type: ScalarType, len: usize, nnz: usize) -> usize {
    let index = IndexWidth::for_capacity(len);
    nnz * (element_type.size_of() + index.size_of())
}

pub fn dense_matrix_bytes(element_type: ScalarType, nrows: usize, ncols: usize) -> usize {
    nrows * ncols * element_type.size_of()
}

pub fn sparse_matrix_bytes(
    element_type: ScalarType,
    nrows: usize,
    ncols: usize,
    nnz: usize,
) -> usize {
    let index = IndexWidth::for_capacity(nrows * ncols);
    nnz * (element_type.size_of() + index.size_of()) + (ncols + 1) * index.size_of()
}

/// `(dense_bytes - sparse_bytes) / dense_bytes`; positive when the
/// compressed form is cheaper.
pub fn matrix_sparse_saves_fraction(
    element_type: ScalarType,
    nrows: usize,
    ncols: usize,
    nnz: usize,
) -> f64 {
    let dense = dense_matrix_bytes(element_type, nrows, ncols);
    if dense == 0 {
        return 0.0;
    }
    let sparse = sparse_matrix_bytes(element_type, nrows, ncols, nnz);
    (dense as f64 - sparse as f64) / dense as f64
}

pub fn vector_sparse_saves_fraction(element_type: ScalarType, len: usize, nnz: usize) -> f64 {
    let dense = dense_vector_bytes(element_type, len);
    if dense == 0 {
        return 0.0;
    }
    let sparse = sparse_vector_bytes(element_type, len, nnz);
    (dense as f64 - sparse as f64) / dense as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DynVector;
    use ndarray::array;

    fn example_dense() -> MatrixData {
        MatrixData::Dense(
            DynDense::from_column_major(3, 2, DynVector::from(vec![0i64, 2, 3, 1, 0, 4]))
                .unwrap(),
        )
    }

    #[test]
    fn major_axis_of_each_form() {
        let column_major = example_dense();
        assert_eq!(major_axis(&column_major), Some(MatrixAxis::Columns));
        let row_major = MatrixData::from(array![[0i64, 1], [2, 0], [3, 4]]);
        assert_eq!(major_axis(&row_major), Some(MatrixAxis::Rows));
        let compressed = sparsify(&column_major, None).unwrap();
        assert_eq!(major_axis(&compressed), Some(MatrixAxis::Columns));
        assert_eq!(MatrixAxis::Rows.other(), MatrixAxis::Columns);
        assert_eq!(MatrixAxis::Columns.other(), MatrixAxis::Rows);
    }

    #[test]
    fn relayout_flips_major_and_round_trips() {
        let matrix = example_dense();
        let flipped = relayout(&matrix).unwrap();
        assert_eq!(major_axis(&flipped), Some(MatrixAxis::Rows));
        assert_eq!(flipped.shape(), (3, 2));
        assert!(matrix.same_values(&flipped));
        let back = relayout(&flipped).unwrap();
        assert_eq!(major_axis(&back), Some(MatrixAxis::Columns));
        assert!(matrix.same_values(&back));
    }

    #[test]
    fn relayout_of_compressed_transposes_the_representation() {
        let sparse = sparsify(&example_dense(), None).unwrap();
        let flipped = relayout(&sparse).unwrap();
        assert!(matches!(flipped, MatrixData::Csr(_)));
        assert_eq!(flipped.stored_entries(), sparse.stored_entries());
        assert!(sparse.same_values(&flipped));
        let back = relayout(&flipped).unwrap();
        assert!(matches!(back, MatrixData::Csc(_)));
        assert!(sparse.same_values(&back));
    }

    #[test]
    fn transposer_flips_axes_but_not_major() {
        let matrix = example_dense();
        let transposed = transposer(&matrix).unwrap();
        assert_eq!(transposed.shape(), (2, 3));
        assert_eq!(major_axis(&transposed), Some(MatrixAxis::Columns));
        assert_eq!(transposed.get(1, 2), matrix.get(2, 1));
        let back = transposer(&transposed).unwrap();
        assert!(matrix.same_values(&back));

        let sparse = sparsify(&matrix, None).unwrap();
        let sparse_transposed = transposer(&sparse).unwrap();
        assert_eq!(sparse_transposed.shape(), (2, 3));
        assert_eq!(major_axis(&sparse_transposed), Some(MatrixAxis::Columns));
        assert!(transposer(&sparse_transposed).unwrap().same_values(&sparse));
    }

    #[test]
    fn sparsify_densify_round_trip() {
        let matrix = example_dense();
        let sparse = sparsify(&matrix, None).unwrap();
        assert_eq!(sparse.stored_entries(), 4);
        let dense = densify(&sparse, None).unwrap();
        assert!(matrix.same_values(&dense));
        assert_eq!(major_axis(&dense), Some(MatrixAxis::Columns));

        let row_major = MatrixData::from(array![[0i64, 1], [2, 0], [3, 4]]);
        let compressed_rows = sparsify(&row_major, None).unwrap();
        assert!(matches!(compressed_rows, MatrixData::Csr(_)));
        assert!(row_major.same_values(&compressed_rows));
    }

    #[test]
    fn storage_fraction_formulas() {
        // 1000 x 1000 f64 with 10% occupancy: indices are i32.
        let saved = matrix_sparse_saves_fraction(ScalarType::F64, 1000, 1000, 100_000);
        let dense = 1_000_000.0 * 8.0;
        let sparse = 100_000.0 * (8.0 + 4.0) + 1001.0 * 4.0;
        assert!((saved - (dense - sparse) / dense).abs() < 1e-12);
        assert!(saved >= 0.25);

        let full = matrix_sparse_saves_fraction(ScalarType::F64, 1000, 1000, 1_000_000);
        assert!(full < 0.0);
    }

    #[test]
    fn bestify_picks_by_threshold() {
        let mut values = vec![0.0f64; 100];
        values[3] = 1.0;
        let sparse_worthy = MatrixData::Dense(
            DynDense::from_column_major(10, 10, DynVector::from(values)).unwrap(),
        );
        assert!(bestify(&sparse_worthy, 0.25, None).unwrap().is_sparse());

        let full = MatrixData::Dense(
            DynDense::from_column_major(10, 10, DynVector::from(vec![1.0f64; 100])).unwrap(),
        );
        assert!(!bestify(&full, 0.25, None).unwrap().is_sparse());
    }

    #[test]
    fn vector_forms_round_trip() {
        let vector = VectorData::from(vec![0.0f64, 1.5, 0.0, 2.5]);
        let sparse = sparsify_vector(&vector, None).unwrap();
        assert!(sparse.is_sparse());
        assert_eq!(sparse.stored_entries(), 2);
        let dense = densify_vector(&sparse, None).unwrap();
        assert_eq!(dense, vector);
    }
}
