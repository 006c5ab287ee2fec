//! The storage-format interface every backend implements: low-level
//! primitives for scalars, axes, vectors and matrices, the empty-buffer
//! allocators concat fills in place, and the shared per-store bookkeeping
//! (name, lock, cache, version counters).
//!
//! Every primitive declares the lock its caller must hold; backends assert
//! this on entry through [`StoreState::assert_read`] / [`StoreState::assert_write`].

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use indexmap::IndexSet;
use parking_lot::Mutex;

use crate::cache::{CacheClass, StorageCache};
use crate::data::{
    DynBuffer, IndexBuffer, IndexWidth, MatrixData, ScalarType, ScalarValue, VectorData,
};
use crate::globals;
use crate::lock::DataLock;

/// Bookkeeping shared by every store: the process-unique name, the data
/// lock, the cache, and the per-property version counters.
pub struct StoreState {
    name: String,
    lock: DataLock,
    cache: StorageCache,
    versions: Mutex<HashMap<String, u32>>,
}

impl StoreState {
    /// Claim `name` (appending a unique suffix if taken) and set up the
    /// lock and cache around it.
    pub fn new(name: &str) -> StoreState {
        let name = globals::claim_name(name);
        let lock = DataLock::new(&name);
        StoreState {
            name,
            lock,
            cache: StorageCache::new(),
            versions: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock(&self) -> &DataLock {
        &self.lock
    }

    pub fn cache(&self) -> &StorageCache {
        &self.cache
    }

    /// The monotonic change counter of one property key (0 if never written).
    pub fn version_counter(&self, key: &str) -> u32 {
        *self.versions.lock().get(key).unwrap_or(&0)
    }

    /// Bump the counter of a key after a successful write.
    pub fn bump_version(&self, key: &str) {
        let mut versions = self.versions.lock();
        let counter = versions.entry(key.to_owned()).or_insert(0);
        *counter = counter.wrapping_add(1);
    }

    pub fn assert_read(&self, operation: &str) {
        assert!(
            self.lock.has_read_lock(),
            "{} of {} invoked without the read lock",
            operation,
            self.name
        );
    }

    pub fn assert_write(&self, operation: &str) {
        assert!(
            self.lock.has_write_lock(),
            "{} of {} invoked without the write lock",
            operation,
            self.name
        );
    }
}

impl Drop for StoreState {
    fn drop(&mut self) {
        globals::release_name(&self.name);
    }
}

/// An empty dense vector handed out by a backend for in-place filling.
/// The buffer is a direct view of the backing storage when the backend can
/// map it; committing through `format_filled_empty_dense_vector` flushes
/// heap-backed fallbacks.
pub struct DenseVectorFill {
    pub axis: String,
    pub name: String,
    pub values: DynBuffer,
}

/// An empty sparse vector: index and value buffers of the declared capacity.
/// Indices written into `nzind` are 1-based at the declared width.
pub struct SparseVectorFill {
    pub axis: String,
    pub name: String,
    pub length: usize,
    pub nzind: IndexBuffer,
    pub nzval: DynBuffer,
}

/// An empty dense matrix; `values` is the column-major element buffer.
pub struct DenseMatrixFill {
    pub rows_axis: String,
    pub columns_axis: String,
    pub name: String,
    pub nrows: usize,
    pub ncols: usize,
    pub values: DynBuffer,
}

/// An empty compressed-columns matrix: `colptr` (length `ncols + 1`),
/// `rowval` and `nzval` (length `nnz`). All indices written are 1-based.
pub struct SparseMatrixFill {
    pub rows_axis: String,
    pub columns_axis: String,
    pub name: String,
    pub nrows: usize,
    pub ncols: usize,
    pub colptr: IndexBuffer,
    pub rowval: IndexBuffer,
    pub nzval: DynBuffer,
}

/// The read-side primitives of a backend. Callers must hold the data read
/// lock (the high-level operations in [`crate::readers`] do this).
pub trait FormatReader: Send + Sync {
    fn state(&self) -> &StoreState;

    fn name(&self) -> &str {
        self.state().name()
    }

    /// Whether this store refuses mutation (a read-only view or mode).
    fn frozen(&self) -> bool {
        false
    }

    /// Enter the store for reading. Chains override this to lock every
    /// member in order.
    fn begin_data_read(&self) {
        self.state().lock().begin_read();
    }

    fn end_data_read(&self) {
        self.state().lock().end_read();
    }

    fn format_has_scalar(&self, name: &str) -> Result<bool>;
    fn format_get_scalar(&self, name: &str) -> Result<ScalarValue>;
    fn format_scalars_set(&self) -> Result<IndexSet<String>>;

    fn format_has_axis(&self, axis: &str) -> Result<bool>;
    fn format_axes_set(&self) -> Result<IndexSet<String>>;
    fn format_axis_entries(&self, axis: &str) -> Result<Arc<Vec<String>>>;
    fn format_axis_length(&self, axis: &str) -> Result<usize>;

    fn format_has_vector(&self, axis: &str, name: &str) -> Result<bool>;
    fn format_vectors_set(&self, axis: &str) -> Result<IndexSet<String>>;
    fn format_get_vector(&self, axis: &str, name: &str)
        -> Result<(Arc<VectorData>, CacheClass)>;

    fn format_has_matrix(&self, rows_axis: &str, columns_axis: &str, name: &str) -> Result<bool>;
    fn format_matrices_set(&self, rows_axis: &str, columns_axis: &str)
        -> Result<IndexSet<String>>;
    fn format_get_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
    ) -> Result<(Arc<MatrixData>, CacheClass)>;

    /// The change counter of a property key; chains sum their members'.
    fn format_version_counter(&self, key: &str) -> u32 {
        self.state().version_counter(key)
    }
}

/// The write-side primitives. Callers must hold the data write lock; the
/// duplicate/existence checks live in [`crate::writers`], not here.
pub trait FormatWriter: FormatReader {
    /// Enter the store for writing. Chains override this to write-lock the
    /// tail writer and read-lock everything before it.
    fn begin_data_write(&self) {
        self.state().lock().begin_write();
    }

    fn end_data_write(&self) {
        self.state().lock().end_write();
    }

    fn format_set_scalar(&self, name: &str, value: ScalarValue) -> Result<()>;
    fn format_delete_scalar(&self, name: &str, for_set: bool) -> Result<()>;

    fn format_add_axis(&self, axis: &str, entries: Vec<String>) -> Result<()>;
    fn format_delete_axis(&self, axis: &str) -> Result<()>;

    fn format_set_vector(&self, axis: &str, name: &str, vector: VectorData) -> Result<()>;
    fn format_delete_vector(&self, axis: &str, name: &str, for_set: bool) -> Result<()>;

    fn format_set_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
        matrix: MatrixData,
    ) -> Result<()>;
    fn format_delete_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
        for_set: bool,
    ) -> Result<()>;

    fn format_get_empty_dense_vector(
        &self,
        axis: &str,
        name: &str,
        element_type: ScalarType,
    ) -> Result<DenseVectorFill>;
    fn format_filled_empty_dense_vector(&self, fill: DenseVectorFill) -> Result<()>;

    fn format_get_empty_sparse_vector(
        &self,
        axis: &str,
        name: &str,
        element_type: ScalarType,
        nnz: usize,
        index_width: IndexWidth,
    ) -> Result<SparseVectorFill>;
    fn format_filled_empty_sparse_vector(&self, fill: SparseVectorFill) -> Result<()>;

    fn format_get_empty_dense_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
        element_type: ScalarType,
    ) -> Result<DenseMatrixFill>;
    fn format_filled_empty_dense_matrix(&self, fill: DenseMatrixFill) -> Result<()>;

    fn format_get_empty_sparse_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
        element_type: ScalarType,
        nnz: usize,
        index_width: IndexWidth,
    ) -> Result<SparseMatrixFill>;
    fn format_filled_empty_sparse_matrix(&self, fill: SparseMatrixFill) -> Result<()>;

    /// Materialize the flipped layout of the matrix stored under
    /// `(rows_axis, columns_axis, name)` as `(columns_axis, rows_axis,
    /// name)`, choosing sparse or dense to match the source, and return it.
    fn format_relayout_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
    ) -> Result<Arc<MatrixData>>;
}
