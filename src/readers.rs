//! The high-level read surface over any backend: lock scoping, existence
//! checks with full diagnostics, and memoization through the store cache.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{ensure, Result};
use indexmap::IndexSet;
use itertools::Itertools;

use crate::cache::{
    axis_cache_key, matrix_cache_key, vector_cache_key, CacheClass, CachedData,
};
use crate::data::{MatrixData, NamedMatrix, NamedVector, ScalarValue, VectorData};
use crate::format::FormatReader;
use crate::layout::major_axis;

/// RAII scope for the data read lock of a store (or of a whole chain).
pub struct ReadScope<'a, T: FormatReader + ?Sized> {
    store: &'a T,
}

impl<'a, T: FormatReader + ?Sized> ReadScope<'a, T> {
    pub fn enter(store: &'a T) -> ReadScope<'a, T> {
        store.begin_data_read();
        ReadScope { store }
    }
}

impl<T: FormatReader + ?Sized> Drop for ReadScope<'_, T> {
    fn drop(&mut self) {
        self.store.end_data_read();
    }
}

/// High-level read operations, available on every store through the blanket
/// implementation (including `dyn FormatReader` itself).
pub trait DafReader: FormatReader {
    fn has_scalar(&self, name: &str) -> Result<bool> {
        let _scope = ReadScope::enter(self);
        self.format_has_scalar(name)
    }

    fn scalars_set(&self) -> Result<IndexSet<String>> {
        let _scope = ReadScope::enter(self);
        self.format_scalars_set()
    }

    fn get_scalar(&self, name: &str) -> Result<ScalarValue> {
        let _scope = ReadScope::enter(self);
        ensure!(
            self.format_has_scalar(name)?,
            "missing scalar {}\nin the data set {}",
            name,
            self.name()
        );
        self.format_get_scalar(name)
    }

    fn has_axis(&self, axis: &str) -> Result<bool> {
        let _scope = ReadScope::enter(self);
        self.format_has_axis(axis)
    }

    fn axes_set(&self) -> Result<IndexSet<String>> {
        let _scope = ReadScope::enter(self);
        self.format_axes_set()
    }

    fn axis_entries(&self, axis: &str) -> Result<Arc<Vec<String>>> {
        let _scope = ReadScope::enter(self);
        self.require_axis(axis)?;
        let key = axis_cache_key(axis);
        if let Some(CachedData::Axis(entries)) = self.state().cache().get(&key) {
            return Ok(entries);
        }
        let entries = self.format_axis_entries(axis)?;
        self.state().cache().put(
            &key,
            CacheClass::MappedData,
            CachedData::Axis(entries.clone()),
            &[],
        );
        Ok(entries)
    }

    fn axis_length(&self, axis: &str) -> Result<usize> {
        let _scope = ReadScope::enter(self);
        self.require_axis(axis)?;
        self.format_axis_length(axis)
    }

    fn has_vector(&self, axis: &str, name: &str) -> Result<bool> {
        let _scope = ReadScope::enter(self);
        self.require_axis(axis)?;
        self.format_has_vector(axis, name)
    }

    fn vectors_set(&self, axis: &str) -> Result<IndexSet<String>> {
        let _scope = ReadScope::enter(self);
        self.require_axis(axis)?;
        self.format_vectors_set(axis)
    }

    fn get_vector(&self, axis: &str, name: &str) -> Result<Arc<VectorData>> {
        let _scope = ReadScope::enter(self);
        self.require_axis(axis)?;
        ensure!(
            self.format_has_vector(axis, name)?,
            "missing vector {}\nof the axis {}\nin the data set {}",
            name,
            axis,
            self.name()
        );
        let key = vector_cache_key(axis, name);
        if let Some(CachedData::Vector(vector)) = self.state().cache().get(&key) {
            return Ok(vector);
        }
        let (vector, class) = self.format_get_vector(axis, name)?;
        self.state().cache().put(
            &key,
            class,
            CachedData::Vector(vector.clone()),
            &[axis_cache_key(axis)],
        );
        Ok(vector)
    }

    /// The vector decorated with its axis entry names.
    fn get_named_vector(&self, axis: &str, name: &str) -> Result<NamedVector> {
        let entries = self.axis_entries(axis)?;
        let vector = self.get_vector(axis, name)?;
        NamedVector::new(entries, vector)
    }

    fn has_matrix(&self, rows_axis: &str, columns_axis: &str, name: &str) -> Result<bool> {
        let _scope = ReadScope::enter(self);
        self.require_axis(rows_axis)?;
        self.require_axis(columns_axis)?;
        self.format_has_matrix(rows_axis, columns_axis, name)
    }

    fn matrices_set(&self, rows_axis: &str, columns_axis: &str) -> Result<IndexSet<String>> {
        let _scope = ReadScope::enter(self);
        self.require_axis(rows_axis)?;
        self.require_axis(columns_axis)?;
        self.format_matrices_set(rows_axis, columns_axis)
    }

    fn get_matrix(&self, rows_axis: &str, columns_axis: &str, name: &str) -> Result<Arc<MatrixData>> {
        let _scope = ReadScope::enter(self);
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
        let key = matrix_cache_key(rows_axis, columns_axis, name);
        if let Some(CachedData::Matrix(matrix)) = self.state().cache().get(&key) {
            return Ok(matrix);
        }
        let (matrix, class) = self.format_get_matrix(rows_axis, columns_axis, name)?;
        self.state().cache().put(
            &key,
            class,
            CachedData::Matrix(matrix.clone()),
            &[axis_cache_key(rows_axis), axis_cache_key(columns_axis)],
        );
        Ok(matrix)
    }

    /// The matrix decorated with the entry names of both axes.
    fn get_named_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
    ) -> Result<NamedMatrix> {
        let row_names = self.axis_entries(rows_axis)?;
        let column_names = self.axis_entries(columns_axis)?;
        let matrix = self.get_matrix(rows_axis, columns_axis, name)?;
        NamedMatrix::new(row_names, column_names, matrix)
    }

    /// The summed change counter of one property key.
    fn version_counter(&self, key: &str) -> u32 {
        self.format_version_counter(key)
    }

    /// Bulk-forget cache entries; exactly one of `clear`/`keep` applies.
    fn empty_cache(&self, clear: Option<CacheClass>, keep: Option<CacheClass>) -> Result<()> {
        self.state().cache().empty(clear, keep)
    }

    /// A deterministic multi-line summary of the store.
    fn description(&self) -> Result<String> {
        let _scope = ReadScope::enter(self);
        let mut out = String::new();
        let _ = writeln!(out, "name: {}", self.name());

        let scalars = self.format_scalars_set()?;
        if !scalars.is_empty() {
            let _ = writeln!(out, "scalars:");
            for name in scalars.iter().sorted() {
                let _ = writeln!(out, "  {}: {}", name, self.format_get_scalar(name)?);
            }
        }

        let axes = self.format_axes_set()?;
        if !axes.is_empty() {
            let _ = writeln!(out, "axes:");
            for axis in axes.iter().sorted() {
                let _ = writeln!(out, "  {}: {} entries", axis, self.format_axis_length(axis)?);
            }
            for axis in axes.iter().sorted() {
                let vectors = self.format_vectors_set(axis)?;
                if vectors.is_empty() {
                    continue;
                }
                let _ = writeln!(out, "vectors of {}:", axis);
                for name in vectors.iter().sorted() {
                    let (vector, _) = self.format_get_vector(axis, name)?;
                    let _ = writeln!(
                        out,
                        "  {}: {} {}",
                        name,
                        vector.scalar_type(),
                        if vector.is_sparse() { "sparse" } else { "dense" },
                    );
                }
            }
            for rows_axis in axes.iter().sorted() {
                for columns_axis in axes.iter().sorted() {
                    let matrices = self.format_matrices_set(rows_axis, columns_axis)?;
                    if matrices.is_empty() {
                        continue;
                    }
                    let _ = writeln!(out, "matrices of {} / {}:", rows_axis, columns_axis);
                    for name in matrices.iter().sorted() {
                        let (matrix, _) = self.format_get_matrix(rows_axis, columns_axis, name)?;
                        let major = major_axis(&matrix)
                            .map_or_else(|| "no".to_owned(), |axis| axis.to_string());
                        let _ = writeln!(
                            out,
                            "  {}: {} {} ({}-major)",
                            name,
                            matrix.scalar_type(),
                            if matrix.is_sparse() { "sparse" } else { "dense" },
                            major,
                        );
                    }
                }
            }
        }
        Ok(out)
    }

    /// Fails with a diagnostic when the axis is missing. Callers must hold a
    /// read scope.
    fn require_axis(&self, axis: &str) -> Result<()> {
        ensure!(
            self.format_has_axis(axis)?,
            "missing axis {}\nin the data set {}",
            axis,
            self.name()
        );
        Ok(())
    }
}

impl<T: FormatReader + ?Sized> DafReader for T {}
