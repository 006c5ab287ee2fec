//! Read-only views: wrap any store so that no mutation is reachable, while
//! reads pass straight through (sharing the wrapped store's lock and cache).

use std::sync::Arc;

use anyhow::Result;
use indexmap::IndexSet;

use crate::cache::CacheClass;
use crate::data::{MatrixData, ScalarValue, VectorData};
use crate::format::{FormatReader, StoreState};

/// A wrapper exposing only the read side of a store. Wrapping is idempotent:
/// [`read_only`] never stacks two views.
pub struct ReadOnlyView {
    inner: Arc<dyn FormatReader>,
}

impl ReadOnlyView {
    pub fn new(inner: Arc<dyn FormatReader>) -> ReadOnlyView {
        ReadOnlyView { inner }
    }
}

/// Wrap a store read-only; a store that is already a read-only view is
/// returned as-is.
pub fn read_only(reader: Arc<dyn FormatReader>) -> Arc<dyn FormatReader> {
    if reader.frozen() {
        reader
    } else {
        Arc::new(ReadOnlyView::new(reader))
    }
}

impl FormatReader for ReadOnlyView {
    fn state(&self) -> &StoreState {
        self.inner.state()
    }

    fn frozen(&self) -> bool {
        true
    }

    fn begin_data_read(&self) {
        self.inner.begin_data_read();
    }

    fn end_data_read(&self) {
        self.inner.end_data_read();
    }

    fn format_has_scalar(&self, name: &str) -> Result<bool> {
        self.inner.format_has_scalar(name)
    }

    fn format_get_scalar(&self, name: &str) -> Result<ScalarValue> {
        self.inner.format_get_scalar(name)
    }

    fn format_scalars_set(&self) -> Result<IndexSet<String>> {
        self.inner.format_scalars_set()
    }

    fn format_has_axis(&self, axis: &str) -> Result<bool> {
        self.inner.format_has_axis(axis)
    }

    fn format_axes_set(&self) -> Result<IndexSet<String>> {
        self.inner.format_axes_set()
    }

    fn format_axis_entries(&self, axis: &str) -> Result<Arc<Vec<String>>> {
        self.inner.format_axis_entries(axis)
    }

    fn format_axis_length(&self, axis: &str) -> Result<usize> {
        self.inner.format_axis_length(axis)
    }

    fn format_has_vector(&self, axis: &str, name: &str) -> Result<bool> {
        self.inner.format_has_vector(axis, name)
    }

    fn format_vectors_set(&self, axis: &str) -> Result<IndexSet<String>> {
        self.inner.format_vectors_set(axis)
    }

    fn format_get_vector(&self, axis: &str, name: &str) -> Result<(Arc<VectorData>, CacheClass)> {
        self.inner.format_get_vector(axis, name)
    }

    fn format_has_matrix(&self, rows_axis: &str, columns_axis: &str, name: &str) -> Result<bool> {
        self.inner.format_has_matrix(rows_axis, columns_axis, name)
    }

    fn format_matrices_set(&self, rows_axis: &str, columns_axis: &str) -> Result<IndexSet<String>> {
        self.inner.format_matrices_set(rows_axis, columns_axis)
    }

    fn format_get_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
    ) -> Result<(Arc<MatrixData>, CacheClass)> {
        self.inner.format_get_matrix(rows_axis, columns_axis, name)
    }

    fn format_version_counter(&self, key: &str) -> u32 {
        self.inner.format_version_counter(key)
    }
}
