//! The in-memory backend: the format interface over guarded maps. The
//! reference backend for chain and concatenation tests, and a scratch store
//! in its own right.

use std::sync::Arc;

use anyhow::{bail, Result};
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;

use crate::cache::{
    axis_cache_key, matrix_cache_key, scalar_cache_key, vector_cache_key, CacheClass,
};
use crate::data::{
    DynBuffer, DynCsc, DynDense, IndexBuffer, IndexWidth, MatrixData, ScalarType, ScalarValue,
    SparseVector, VectorData,
};
use crate::format::{
    DenseMatrixFill, DenseVectorFill, FormatReader, FormatWriter, SparseMatrixFill,
    SparseVectorFill, StoreState,
};
use crate::layout::transposer;

#[derive(Default)]
struct MemoryContent {
    scalars: IndexMap<String, ScalarValue>,
    axes: IndexMap<String, Arc<Vec<String>>>,
    vectors: IndexMap<String, IndexMap<String, Arc<VectorData>>>,
    matrices: IndexMap<(String, String), IndexMap<String, Arc<MatrixData>>>,
}

/// A complete store living in process memory.
pub struct MemoryDaf {
    state: StoreState,
    content: Mutex<MemoryContent>,
}

impl MemoryDaf {
    pub fn new(name: &str) -> MemoryDaf {
        MemoryDaf {
            state: StoreState::new(name),
            content: Mutex::new(MemoryContent::default()),
        }
    }

    fn axis_len(&self, axis: &str) -> Result<usize> {
        let content = self.content.lock();
        match content.axes.get(axis) {
            Some(entries) => Ok(entries.len()),
            None => bail!("missing axis {} in the data set {}", axis, self.name()),
        }
    }
}

impl std::fmt::Display for MemoryDaf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemoryDaf {}", self.name())
    }
}

impl FormatReader for MemoryDaf {
    fn state(&self) -> &StoreState {
        &self.state
    }

    fn format_has_scalar(&self, name: &str) -> Result<bool> {
        self.state.assert_read("has_scalar");
        Ok(self.content.lock().scalars.contains_key(name))
    }

    fn format_get_scalar(&self, name: &str) -> Result<ScalarValue> {
        self.state.assert_read("get_scalar");
        match self.content.lock().scalars.get(name) {
            Some(value) => Ok(value.clone()),
            None => bail!("missing scalar {} in the data set {}", name, self.name()),
        }
    }

    fn format_scalars_set(&self) -> Result<IndexSet<String>> {
        self.state.assert_read("scalars_set");
        Ok(self.content.lock().scalars.keys().cloned().collect())
    }

    fn format_has_axis(&self, axis: &str) -> Result<bool> {
        self.state.assert_read("has_axis");
        Ok(self.content.lock().axes.contains_key(axis))
    }

    fn format_axes_set(&self) -> Result<IndexSet<String>> {
        self.state.assert_read("axes_set");
        Ok(self.content.lock().axes.keys().cloned().collect())
    }

    fn format_axis_entries(&self, axis: &str) -> Result<Arc<Vec<String>>> {
        self.state.assert_read("axis_entries");
        match self.content.lock().axes.get(axis) {
            Some(entries) => Ok(entries.clone()),
            None => bail!("missing axis {} in the data set {}", axis, self.name()),
        }
    }

    fn format_axis_length(&self, axis: &str) -> Result<usize> {
        self.state.assert_read("axis_length");
        self.axis_len(axis)
    }

    fn format_has_vector(&self, axis: &str, name: &str) -> Result<bool> {
        self.state.assert_read("has_vector");
        Ok(self
            .content
            .lock()
            .vectors
            .get(axis)
            .map_or(false, |vectors| vectors.contains_key(name)))
    }

    fn format_vectors_set(&self, axis: &str) -> Result<IndexSet<String>> {
        self.state.assert_read("vectors_set");
        Ok(self
            .content
            .lock()
            .vectors
            .get(axis)
            .map(|vectors| vectors.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn format_get_vector(&self, axis: &str, name: &str) -> Result<(Arc<VectorData>, CacheClass)> {
        self.state.assert_read("get_vector");
        match self
            .content
            .lock()
            .vectors
            .get(axis)
            .and_then(|vectors| vectors.get(name))
        {
            Some(vector) => Ok((vector.clone(), CacheClass::MappedData)),
            None => bail!(
                "missing vector {} of the axis {} in the data set {}",
                name,
                axis,
                self.name()
            ),
        }
    }

    fn format_has_matrix(&self, rows_axis: &str, columns_axis: &str, name: &str) -> Result<bool> {
        self.state.assert_read("has_matrix");
        Ok(self
            .content
            .lock()
            .matrices
            .get(&(rows_axis.to_owned(), columns_axis.to_owned()))
            .map_or(false, |matrices| matrices.contains_key(name)))
    }

    fn format_matrices_set(&self, rows_axis: &str, columns_axis: &str) -> Result<IndexSet<String>> {
        self.state.assert_read("matrices_set");
        Ok(self
            .content
            .lock()
            .matrices
            .get(&(rows_axis.to_owned(), columns_axis.to_owned()))
            .map(|matrices| matrices.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn format_get_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
    ) -> Result<(Arc<MatrixData>, CacheClass)> {
        self.state.assert_read("get_matrix");
        match self
            .content
            .lock()
            .matrices
            .get(&(rows_axis.to_owned(), columns_axis.to_owned()))
            .and_then(|matrices| matrices.get(name))
        {
            Some(matrix) => Ok((matrix.clone(), CacheClass::MappedData)),
            None => bail!(
                "missing matrix {} of the axes {} and {} in the data set {}",
                name,
                rows_axis,
                columns_axis,
                self.name()
            ),
        }
    }
}

impl FormatWriter for MemoryDaf {
    fn format_set_scalar(&self, name: &str, value: ScalarValue) -> Result<()> {
        self.state.assert_write("set_scalar");
        self.content.lock().scalars.insert(name.to_owned(), value);
        let key = scalar_cache_key(name);
        self.state.cache().invalidate(&key);
        self.state.bump_version(&key);
        Ok(())
    }

    fn format_delete_scalar(&self, name: &str, for_set: bool) -> Result<()> {
        self.state.assert_write("delete_scalar");
        if self.content.lock().scalars.shift_remove(name).is_none() {
            bail!("missing scalar {} in the data set {}", name, self.name());
        }
        let key = scalar_cache_key(name);
        self.state.cache().invalidate(&key);
        if !for_set {
            self.state.bump_version(&key);
        }
        Ok(())
    }

    fn format_add_axis(&self, axis: &str, entries: Vec<String>) -> Result<()> {
        self.state.assert_write("add_axis");
        let mut content = self.content.lock();
        content.axes.insert(axis.to_owned(), Arc::new(entries));
        content.vectors.entry(axis.to_owned()).or_default();
        let key = axis_cache_key(axis);
        self.state.cache().invalidate(&key);
        self.state.bump_version(&key);
        Ok(())
    }

    fn format_delete_axis(&self, axis: &str) -> Result<()> {
        self.state.assert_write("delete_axis");
        let mut content = self.content.lock();
        if content.axes.shift_remove(axis).is_none() {
            bail!("missing axis {} in the data set {}", axis, self.name());
        }
        content.vectors.shift_remove(axis);
        content
            .matrices
            .retain(|(rows_axis, columns_axis), _| rows_axis != axis && columns_axis != axis);
        drop(content);
        let key = axis_cache_key(axis);
        self.state.cache().invalidate(&key);
        self.state.bump_version(&key);
        Ok(())
    }

    fn format_set_vector(&self, axis: &str, name: &str, vector: VectorData) -> Result<()> {
        self.state.assert_write("set_vector");
        let mut content = self.content.lock();
        if !content.axes.contains_key(axis) {
            bail!("missing axis {} in the data set {}", axis, self.name());
        }
        content
            .vectors
            .entry(axis.to_owned())
            .or_default()
            .insert(name.to_owned(), Arc::new(vector));
        drop(content);
        let key = vector_cache_key(axis, name);
        self.state.cache().invalidate(&key);
        self.state.bump_version(&key);
        Ok(())
    }

    fn format_delete_vector(&self, axis: &str, name: &str, for_set: bool) -> Result<()> {
        self.state.assert_write("delete_vector");
        let removed = self
            .content
            .lock()
            .vectors
            .get_mut(axis)
            .and_then(|vectors| vectors.shift_remove(name));
        if removed.is_none() {
            bail!(
                "missing vector {} of the axis {} in the data set {}",
                name,
                axis,
                self.name()
            );
        }
        let key = vector_cache_key(axis, name);
        self.state.cache().invalidate(&key);
        if !for_set {
            self.state.bump_version(&key);
        }
        Ok(())
    }

    fn format_set_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
        matrix: MatrixData,
    ) -> Result<()> {
        self.state.assert_write("set_matrix");
        let mut content = self.content.lock();
        if !content.axes.contains_key(rows_axis) {
            bail!("missing axis {} in the data set {}", rows_axis, self.name());
        }
        if !content.axes.contains_key(columns_axis) {
            bail!(
                "missing axis {} in the data set {}",
                columns_axis,
                self.name()
            );
        }
        content
            .matrices
            .entry((rows_axis.to_owned(), columns_axis.to_owned()))
            .or_default()
            .insert(name.to_owned(), Arc::new(matrix));
        drop(content);
        let key = matrix_cache_key(rows_axis, columns_axis, name);
        self.state.cache().invalidate(&key);
        self.state.bump_version(&key);
        Ok(())
    }

    fn format_delete_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
        for_set: bool,
    ) -> Result<()> {
        self.state.assert_write("delete_matrix");
        let removed = self
            .content
            .lock()
            .matrices
            .get_mut(&(rows_axis.to_owned(), columns_axis.to_owned()))
            .and_then(|matrices| matrices.shift_remove(name));
        if removed.is_none() {
            bail!(
                "missing matrix {} of the axes {} and {} in the data set {}",
                name,
                rows_axis,
                columns_axis,
                self.name()
            );
        }
        let key = matrix_cache_key(rows_axis, columns_axis, name);
        self.state.cache().invalidate(&key);
        if !for_set {
            self.state.bump_version(&key);
        }
        Ok(())
    }

    fn format_get_empty_dense_vector(
        &self,
        axis: &str,
        name: &str,
        element_type: ScalarType,
    ) -> Result<DenseVectorFill> {
        self.state.assert_write("get_empty_dense_vector");
        let length = self.axis_len(axis)?;
        Ok(DenseVectorFill {
            axis: axis.to_owned(),
            name: name.to_owned(),
            values: DynBuffer::heap(element_type, length),
        })
    }

    fn format_filled_empty_dense_vector(&self, fill: DenseVectorFill) -> Result<()> {
        self.state.assert_write("filled_empty_dense_vector");
        let axis = fill.axis.clone();
        let name = fill.name.clone();
        let values = fill
            .values
            .into_dense()?
            .expect("memory fills are always heap backed");
        self.format_set_vector(&axis, &name, VectorData::Dense(values))
    }

    fn format_get_empty_sparse_vector(
        &self,
        axis: &str,
        name: &str,
        element_type: ScalarType,
        nnz: usize,
        index_width: IndexWidth,
    ) -> Result<SparseVectorFill> {
        self.state.assert_write("get_empty_sparse_vector");
        let length = self.axis_len(axis)?;
        Ok(SparseVectorFill {
            axis: axis.to_owned(),
            name: name.to_owned(),
            length,
            nzind: IndexBuffer::heap(index_width, nnz),
            nzval: DynBuffer::heap(element_type, nnz),
        })
    }

    fn format_filled_empty_sparse_vector(&self, fill: SparseVectorFill) -> Result<()> {
        self.state.assert_write("filled_empty_sparse_vector");
        let indices = fill.nzind.to_zero_based();
        let values = fill
            .nzval
            .into_dense()?
            .expect("memory fills are always heap backed");
        let sparse = SparseVector::new(fill.length, indices, values)?;
        self.format_set_vector(&fill.axis, &fill.name, VectorData::Sparse(sparse))
    }

    fn format_get_empty_dense_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
        element_type: ScalarType,
    ) -> Result<DenseMatrixFill> {
        self.state.assert_write("get_empty_dense_matrix");
        let nrows = self.axis_len(rows_axis)?;
        let ncols = self.axis_len(columns_axis)?;
        Ok(DenseMatrixFill {
            rows_axis: rows_axis.to_owned(),
            columns_axis: columns_axis.to_owned(),
            name: name.to_owned(),
            nrows,
            ncols,
            values: DynBuffer::heap(element_type, nrows * ncols),
        })
    }

    fn format_filled_empty_dense_matrix(&self, fill: DenseMatrixFill) -> Result<()> {
        self.state.assert_write("filled_empty_dense_matrix");
        let values = fill
            .values
            .into_dense()?
            .expect("memory fills are always heap backed");
        let dense = DynDense::from_column_major(fill.nrows, fill.ncols, values)?;
        self.format_set_matrix(
            &fill.rows_axis,
            &fill.columns_axis,
            &fill.name,
            MatrixData::Dense(dense),
        )
    }

    fn format_get_empty_sparse_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
        element_type: ScalarType,
        nnz: usize,
        index_width: IndexWidth,
    ) -> Result<SparseMatrixFill> {
        self.state.assert_write("get_empty_sparse_matrix");
        let nrows = self.axis_len(rows_axis)?;
        let ncols = self.axis_len(columns_axis)?;
        Ok(SparseMatrixFill {
            rows_axis: rows_axis.to_owned(),
            columns_axis: columns_axis.to_owned(),
            name: name.to_owned(),
            nrows,
            ncols,
            colptr: IndexBuffer::heap(index_width, ncols + 1),
            rowval: IndexBuffer::heap(index_width, nnz),
            nzval: DynBuffer::heap(element_type, nnz),
        })
    }

    fn format_filled_empty_sparse_matrix(&self, fill: SparseMatrixFill) -> Result<()> {
        self.state.assert_write("filled_empty_sparse_matrix");
        let col_offsets = fill.colptr.to_zero_based();
        let row_indices = fill.rowval.to_zero_based();
        let values = fill
            .nzval
            .into_dense()?
            .expect("memory fills are always heap backed");
        let sparse = DynCsc::from_parts(fill.nrows, fill.ncols, col_offsets, row_indices, values)?;
        self.format_set_matrix(
            &fill.rows_axis,
            &fill.columns_axis,
            &fill.name,
            MatrixData::Csc(sparse),
        )
    }

    fn format_relayout_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
    ) -> Result<Arc<MatrixData>> {
        self.state.assert_write("relayout_matrix");
        let (matrix, _) = self.format_get_matrix(rows_axis, columns_axis, name)?;
        let flipped = Arc::new(transposer(&matrix)?);
        self.format_set_matrix(
            columns_axis,
            rows_axis,
            name,
            MatrixData::clone(&flipped),
        )?;
        Ok(flipped)
    }
}
