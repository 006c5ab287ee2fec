//! The high-level write surface: frozen/duplicate/existence checks, shape
//! validation, the column-major storage discipline, and lock scoping over
//! the raw write primitives.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use itertools::Itertools;

use crate::data::{
    DynVector, IndexWidth, MatrixData, ScalarType, ScalarValue, VectorData,
};
use crate::format::{
    DenseMatrixFill, DenseVectorFill, FormatWriter, SparseMatrixFill, SparseVectorFill,
};
use crate::layout::{major_axis, relayout, require_major_axis, MatrixAxis};
use crate::readers::DafReader;

/// RAII scope for the data write lock of a store (or of a whole chain).
pub struct WriteScope<'a, T: FormatWriter + ?Sized> {
    store: &'a T,
}

impl<'a, T: FormatWriter + ?Sized> WriteScope<'a, T> {
    pub fn enter(store: &'a T) -> WriteScope<'a, T> {
        store.begin_data_write();
        WriteScope { store }
    }
}

impl<T: FormatWriter + ?Sized> Drop for WriteScope<'_, T> {
    fn drop(&mut self) {
        self.store.end_data_write();
    }
}

/// High-level write operations, available on every writer through the
/// blanket implementation (including `dyn FormatWriter` itself).
pub trait DafWriter: FormatWriter {
    fn set_scalar(&self, name: &str, value: ScalarValue, overwrite: bool) -> Result<()> {
        self.require_mutable()?;
        let _scope = WriteScope::enter(self);
        if self.format_has_scalar(name)? {
            ensure!(
                overwrite,
                "refusing to overwrite the scalar {}\nin the data set {}",
                name,
                self.name()
            );
            self.format_delete_scalar(name, true)?;
        }
        self.format_set_scalar(name, value)
    }

    fn delete_scalar(&self, name: &str, must_exist: bool) -> Result<()> {
        self.require_mutable()?;
        let _scope = WriteScope::enter(self);
        if !self.format_has_scalar(name)? {
            ensure!(
                !must_exist,
                "missing scalar {}\nin the data set {}",
                name,
                self.name()
            );
            return Ok(());
        }
        self.format_delete_scalar(name, false)
    }

    /// Create an axis from its entries. Axes may not be re-added; entries
    /// must be unique and non-empty.
    fn add_axis(&self, axis: &str, entries: Vec<String>) -> Result<()> {
        self.require_mutable()?;
        let _scope = WriteScope::enter(self);
        ensure!(
            !self.format_has_axis(axis)?,
            "refusing to re-add the axis {}\nin the data set {}",
            axis,
            self.name()
        );
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            ensure!(
                !entry.is_empty(),
                "empty entry in the new axis {}\nin the data set {}",
                axis,
                self.name()
            );
            ensure!(
                seen.insert(entry.as_str()),
                "duplicate entry {}\nin the new axis {}\nin the data set {}",
                entry,
                axis,
                self.name()
            );
        }
        self.format_add_axis(axis, entries)
    }

    /// Delete an axis; every vector and matrix referencing it must already
    /// be gone.
    fn delete_axis(&self, axis: &str, must_exist: bool) -> Result<()> {
        self.require_mutable()?;
        let _scope = WriteScope::enter(self);
        if !self.format_has_axis(axis)? {
            ensure!(
                !must_exist,
                "missing axis {}\nin the data set {}",
                axis,
                self.name()
            );
            return Ok(());
        }
        let vectors = self.format_vectors_set(axis)?;
        ensure!(
            vectors.is_empty(),
            "refusing to delete the axis {}\nwith the vectors: {}\nin the data set {}",
            axis,
            vectors.iter().sorted().join(", "),
            self.name()
        );
        for other in self.format_axes_set()? {
            for (rows_axis, columns_axis) in
                [(axis, other.as_str()), (other.as_str(), axis)]
            {
                let matrices = self.format_matrices_set(rows_axis, columns_axis)?;
                ensure!(
                    matrices.is_empty(),
                    "refusing to delete the axis {}\nwith the matrices of {} / {}: {}\nin the data set {}",
                    axis,
                    rows_axis,
                    columns_axis,
                    matrices.iter().sorted().join(", "),
                    self.name()
                );
            }
        }
        self.format_delete_axis(axis)
    }

    fn set_vector(&self, axis: &str, name: &str, vector: VectorData, overwrite: bool) -> Result<()> {
        self.require_mutable()?;
        let _scope = WriteScope::enter(self);
        self.require_axis(axis)?;
        let length = self.format_axis_length(axis)?;
        ensure!(
            vector.len() == length,
            "the length {} of the vector {}\nis different from the length {} of the axis {}\nin the data set {}",
            vector.len(),
            name,
            length,
            axis,
            self.name()
        );
        if self.format_has_vector(axis, name)? {
            ensure!(
                overwrite,
                "refusing to overwrite the vector {}\nof the axis {}\nin the data set {}",
                name,
                axis,
                self.name()
            );
            self.format_delete_vector(axis, name, true)?;
        }
        self.format_set_vector(axis, name, vector)
    }

    /// Set a vector to a uniform scalar fill.
    fn fill_vector(&self, axis: &str, name: &str, value: ScalarValue, overwrite: bool) -> Result<()> {
        self.require_mutable()?;
        let _scope = WriteScope::enter(self);
        self.require_axis(axis)?;
        let length = self.format_axis_length(axis)?;
        let vector = VectorData::Dense(DynVector::filled(&value, length));
        drop(_scope);
        self.set_vector(axis, name, vector, overwrite)
    }

    fn delete_vector(&self, axis: &str, name: &str, must_exist: bool) -> Result<()> {
        self.require_mutable()?;
        let _scope = WriteScope::enter(self);
        self.require_axis(axis)?;
        if !self.format_has_vector(axis, name)? {
            ensure!(
                !must_exist,
                "missing vector {}\nof the axis {}\nin the data set {}",
                name,
                axis,
                self.name()
            );
            return Ok(());
        }
        self.format_delete_vector(axis, name, false)
    }

    /// Store a matrix under `(rows_axis, columns_axis, name)`. The stored
    /// form is rows-contiguous (column-major); data arriving in the other
    /// layout triggers the inefficiency policy and is relaid out on the way
    /// in.
    fn set_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
        matrix: MatrixData,
        overwrite: bool,
    ) -> Result<()> {
        self.require_mutable()?;
        let _scope = WriteScope::enter(self);
        self.require_axis(rows_axis)?;
        self.require_axis(columns_axis)?;
        let nrows = self.format_axis_length(rows_axis)?;
        let ncols = self.format_axis_length(columns_axis)?;
        ensure!(
            matrix.shape() == (nrows, ncols),
            "the shape ({}, {}) of the matrix {}\nis different from the shape ({}, {}) of the axes {} and {}\nin the data set {}",
            matrix.shape().0,
            matrix.shape().1,
            name,
            nrows,
            ncols,
            rows_axis,
            columns_axis,
            self.name()
        );
        let matrix = if major_axis(&matrix) == Some(MatrixAxis::Columns) {
            matrix
        } else {
            require_major_axis(&matrix, MatrixAxis::Columns, name)?;
            relayout(&matrix)?
        };
        if self.format_has_matrix(rows_axis, columns_axis, name)? {
            ensure!(
                overwrite,
                "refusing to overwrite the matrix {}\nof the rows axis {}\nand the columns axis {}\nin the data set {}",
                name,
                rows_axis,
                columns_axis,
                self.name()
            );
            self.format_delete_matrix(rows_axis, columns_axis, name, true)?;
        }
        self.format_set_matrix(rows_axis, columns_axis, name, matrix)
    }

    fn delete_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
        must_exist: bool,
    ) -> Result<()> {
        self.require_mutable()?;
        let _scope = WriteScope::enter(self);
        self.require_axis(rows_axis)?;
        self.require_axis(columns_axis)?;
        if !self.format_has_matrix(rows_axis, columns_axis, name)? {
            ensure!(
                !must_exist,
                "missing matrix {}\nof the rows axis {}\nand the columns axis {}\nin the data set {}",
                name,
                rows_axis,
                columns_axis,
                self.name()
            );
            return Ok(());
        }
        self.format_delete_matrix(rows_axis, columns_axis, name, false)
    }

    /// Materialize the flipped layout `(columns_axis, rows_axis, name)` of
    /// an existing matrix; the two layouts are independent properties from
    /// then on.
    fn relayout_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
        overwrite: bool,
    ) -> Result<Arc<MatrixData>> {
        self.require_mutable()?;
        let _scope = WriteScope::enter(self);
        self.require_axis(rows_axis)?;
        self.require_axis(columns_axis)?;
        ensure!(
            self.format_has_matrix(rows_axis, columns_axis, name)?,
            "missing matrix {}\nof the rows axis {}\nand the columns axis {}\nin the data set {}",
            name,
            rows_axis,
            columns_axis,
            self.name()
        );
        if self.format_has_matrix(columns_axis, rows_axis, name)? {
            ensure!(
                overwrite,
                "refusing to overwrite the matrix {}\nof the rows axis {}\nand the columns axis {}\nin the data set {}",
                name,
                columns_axis,
                rows_axis,
                self.name()
            );
            self.format_delete_matrix(columns_axis, rows_axis, name, true)?;
        }
        self.format_relayout_matrix(rows_axis, columns_axis, name)
    }

    /// Allocate an empty dense vector in the backend for in-place filling.
    fn get_empty_dense_vector(
        &self,
        axis: &str,
        name: &str,
        element_type: ScalarType,
        overwrite: bool,
    ) -> Result<DenseVectorFill> {
        self.require_mutable()?;
        let _scope = WriteScope::enter(self);
        self.require_axis(axis)?;
        self.require_fresh_vector(axis, name, overwrite)?;
        self.format_get_empty_dense_vector(axis, name, element_type)
    }

    fn filled_empty_dense_vector(&self, fill: DenseVectorFill) -> Result<()> {
        let _scope = WriteScope::enter(self);
        self.format_filled_empty_dense_vector(fill)
    }

    fn get_empty_sparse_vector(
        &self,
        axis: &str,
        name: &str,
        element_type: ScalarType,
        nnz: usize,
        index_width: IndexWidth,
        overwrite: bool,
    ) -> Result<SparseVectorFill> {
        self.require_mutable()?;
        let _scope = WriteScope::enter(self);
        self.require_axis(axis)?;
        self.require_fresh_vector(axis, name, overwrite)?;
        self.format_get_empty_sparse_vector(axis, name, element_type, nnz, index_width)
    }

    fn filled_empty_sparse_vector(&self, fill: SparseVectorFill) -> Result<()> {
        let _scope = WriteScope::enter(self);
        self.format_filled_empty_sparse_vector(fill)
    }

    fn get_empty_dense_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
        element_type: ScalarType,
        overwrite: bool,
    ) -> Result<DenseMatrixFill> {
        self.require_mutable()?;
        let _scope = WriteScope::enter(self);
        self.require_axis(rows_axis)?;
        self.require_axis(columns_axis)?;
        self.require_fresh_matrix(rows_axis, columns_axis, name, overwrite)?;
        self.format_get_empty_dense_matrix(rows_axis, columns_axis, name, element_type)
    }

    fn filled_empty_dense_matrix(&self, fill: DenseMatrixFill) -> Result<()> {
        let _scope = WriteScope::enter(self);
        self.format_filled_empty_dense_matrix(fill)
    }

    fn get_empty_sparse_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
        element_type: ScalarType,
        nnz: usize,
        index_width: IndexWidth,
        overwrite: bool,
    ) -> Result<SparseMatrixFill> {
        self.require_mutable()?;
        let _scope = WriteScope::enter(self);
        self.require_axis(rows_axis)?;
        self.require_axis(columns_axis)?;
        self.require_fresh_matrix(rows_axis, columns_axis, name, overwrite)?;
        self.format_get_empty_sparse_matrix(
            rows_axis,
            columns_axis,
            name,
            element_type,
            nnz,
            index_width,
        )
    }

    fn filled_empty_sparse_matrix(&self, fill: SparseMatrixFill) -> Result<()> {
        let _scope = WriteScope::enter(self);
        self.format_filled_empty_sparse_matrix(fill)
    }

    fn require_mutable(&self) -> Result<()> {
        ensure!(
            !self.frozen(),
            "the data set {} is read-only",
            self.name()
        );
        Ok(())
    }

    /// Check (and under `overwrite` clear) the target slot of a vector fill.
    fn require_fresh_vector(&self, axis: &str, name: &str, overwrite: bool) -> Result<()> {
        if self.format_has_vector(axis, name)? {
            ensure!(
                overwrite,
                "refusing to overwrite the vector {}\nof the axis {}\nin the data set {}",
                name,
                axis,
                self.name()
            );
            self.format_delete_vector(axis, name, true)?;
        }
        Ok(())
    }

    /// Check (and under `overwrite` clear) the target slot of a matrix fill.
    fn require_fresh_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
        overwrite: bool,
    ) -> Result<()> {
        if self.format_has_matrix(rows_axis, columns_axis, name)? {
            ensure!(
                overwrite,
                "refusing to overwrite the matrix {}\nof the rows axis {}\nand the columns axis {}\nin the data set {}",
                name,
                rows_axis,
                columns_axis,
                self.name()
            );
            self.format_delete_matrix(rows_axis, columns_axis, name, true)?;
        }
        Ok(())
    }
}

impl<T: FormatWriter + ?Sized> DafWriter for T {}

/// Convert borrowed entry names into the owned form [`DafWriter::add_axis`]
/// takes.
pub fn axis_entries_of(entries: &[&str]) -> Vec<String> {
    entries.iter().map(|entry| (*entry).to_owned()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DynDense;
    use crate::memory::MemoryDaf;
    use crate::readers::DafReader;

    #[test]
    fn scalar_life_cycle() {
        let daf = MemoryDaf::new("writers-scalars");
        daf.set_scalar("version", ScalarValue::from("1.0"), false).unwrap();
        assert!(daf.set_scalar("version", ScalarValue::from("2.0"), false).is_err());
        daf.set_scalar("version", ScalarValue::from("2.0"), true).unwrap();
        assert_eq!(daf.get_scalar("version").unwrap(), ScalarValue::from("2.0"));
        daf.delete_scalar("version", true).unwrap();
        assert!(daf.delete_scalar("version", true).is_err());
        daf.delete_scalar("version", false).unwrap();
    }

    #[test]
    fn axis_rules() {
        let daf = MemoryDaf::new("writers-axes");
        daf.add_axis("cell", axis_entries_of(&["c1", "c2"])).unwrap();
        assert!(daf.add_axis("cell", axis_entries_of(&["c3"])).is_err());
        assert!(daf.add_axis("gene", axis_entries_of(&["g1", "g1"])).is_err());
        assert!(daf.add_axis("gene", axis_entries_of(&["g1", ""])).is_err());
        assert_eq!(daf.axis_length("cell").unwrap(), 2);

        daf.set_vector("cell", "age", VectorData::from(vec![1i8, 2]), false)
            .unwrap();
        assert!(daf.delete_axis("cell", true).is_err());
        daf.delete_vector("cell", "age", true).unwrap();
        daf.delete_axis("cell", true).unwrap();
        assert!(!daf.has_axis("cell").unwrap());
    }

    #[test]
    fn vector_length_is_checked() {
        let daf = MemoryDaf::new("writers-vectors");
        daf.add_axis("cell", axis_entries_of(&["c1", "c2", "c3"])).unwrap();
        assert!(daf
            .set_vector("cell", "age", VectorData::from(vec![1i8, 2]), false)
            .is_err());
        daf.fill_vector("cell", "age", ScalarValue::I8(7), false).unwrap();
        assert_eq!(
            *daf.get_vector("cell", "age").unwrap(),
            VectorData::from(vec![7i8, 7, 7])
        );
    }

    #[test]
    fn matrix_is_stored_rows_contiguous() {
        let daf = MemoryDaf::new("writers-matrices");
        daf.add_axis("cell", axis_entries_of(&["c1", "c2", "c3"])).unwrap();
        daf.add_axis("gene", axis_entries_of(&["g1", "g2"])).unwrap();
        // Row-major input is relaid out on the way in.
        let matrix = MatrixData::from(ndarray::array![[0i64, 1], [2, 0], [3, 4]]);
        daf.set_matrix("cell", "gene", "UMIs", matrix.clone(), false).unwrap();
        let stored = daf.get_matrix("cell", "gene", "UMIs").unwrap();
        assert_eq!(
            crate::layout::major_axis(stored.as_ref()),
            Some(MatrixAxis::Columns)
        );
        assert!(stored.same_values(&matrix));

        let flipped = daf.relayout_matrix("cell", "gene", "UMIs", false).unwrap();
        assert_eq!(flipped.shape(), (2, 3));
        let read_back = daf.get_matrix("gene", "cell", "UMIs").unwrap();
        assert_eq!(read_back.get(1, 2), matrix.get(2, 1));

        let column_major = MatrixData::Dense(
            DynDense::from_column_major(
                3,
                2,
                crate::data::DynVector::from(vec![0i64, 2, 3, 1, 0, 4]),
            )
            .unwrap(),
        );
        assert!(daf
            .set_matrix("cell", "gene", "UMIs", column_major, false)
            .is_err());
    }
}
