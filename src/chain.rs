//! Chains: an ordered list of stores presented as a single logical store.
//! Reads consult the members from last to first; writes go to the final
//! writer; deletes refuse to shadow data owned by an earlier member.

use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use indexmap::IndexSet;
use itertools::Itertools;

use crate::cache::{
    axis_cache_key, matrix_cache_key, scalar_cache_key, vector_cache_key, CacheClass, CachedData,
};
use crate::data::{
    DynBuffer, IndexBuffer, IndexWidth, MatrixData, ScalarType, ScalarValue, VectorData,
};
use crate::format::{
    DenseMatrixFill, DenseVectorFill, FormatReader, FormatWriter, SparseMatrixFill,
    SparseVectorFill, StoreState,
};
use crate::layout::transposer;

/// Verify that every axis name shared between members carries an identical
/// entry sequence. Runs under each member's own read lock.
fn validate_member_axes(members: &[&dyn FormatReader]) -> Result<()> {
    use crate::readers::DafReader;

    for (later_position, later) in members.iter().enumerate().skip(1) {
        for axis in later.axes_set()? {
            for earlier in &members[..later_position] {
                if !earlier.has_axis(&axis)? {
                    continue;
                }
                let earlier_entries = earlier.axis_entries(&axis)?;
                let later_entries = later.axis_entries(&axis)?;
                ensure!(
                    earlier_entries == later_entries,
                    "different entries of the axis {}\nbetween the data set {}\nand the data set {}",
                    axis,
                    earlier.name(),
                    later.name()
                );
            }
        }
    }
    Ok(())
}

/// Overlay read-only access to an ordered list of stores.
pub struct ChainReader {
    state: StoreState,
    members: Vec<Arc<dyn FormatReader>>,
}

/// Compose readers into a chain; shared axes must be identical across
/// members.
pub fn chain_reader(name: &str, members: Vec<Arc<dyn FormatReader>>) -> Result<ChainReader> {
    ensure!(!members.is_empty(), "empty chain {}", name);
    let borrowed: Vec<&dyn FormatReader> = members.iter().map(|member| member.as_ref()).collect();
    validate_member_axes(&borrowed)?;
    Ok(ChainReader {
        state: StoreState::new(name),
        members,
    })
}

impl std::fmt::Display for ChainReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ReadChain {} of: {}",
            self.name(),
            self.members.iter().map(|member| member.name()).join(", ")
        )
    }
}

/// Shared read-side logic over an ordered member list, consulted from last
/// to first.
macro_rules! impl_chain_reads {
    ($members:ident) => {
        fn format_has_scalar(&self, name: &str) -> Result<bool> {
            self.state().assert_read("has_scalar");
            for member in self.$members().iter().rev() {
                if member.format_has_scalar(name)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }

        fn format_get_scalar(&self, name: &str) -> Result<ScalarValue> {
            self.state().assert_read("get_scalar");
            for member in self.$members().iter().rev() {
                if member.format_has_scalar(name)? {
                    return member.format_get_scalar(name);
                }
            }
            bail!("missing scalar {} in the chain {}", name, self.name())
        }

        fn format_scalars_set(&self) -> Result<IndexSet<String>> {
            self.state().assert_read("scalars_set");
            let mut names = IndexSet::new();
            for member in self.$members() {
                names.extend(member.format_scalars_set()?);
            }
            Ok(names)
        }

        fn format_has_axis(&self, axis: &str) -> Result<bool> {
            self.state().assert_read("has_axis");
            for member in self.$members().iter().rev() {
                if member.format_has_axis(axis)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }

        fn format_axes_set(&self) -> Result<IndexSet<String>> {
            self.state().assert_read("axes_set");
            let mut names = IndexSet::new();
            for member in self.$members() {
                names.extend(member.format_axes_set()?);
            }
            Ok(names)
        }

        fn format_axis_entries(&self, axis: &str) -> Result<Arc<Vec<String>>> {
            self.state().assert_read("axis_entries");
            for member in self.$members().iter().rev() {
                if member.format_has_axis(axis)? {
                    return member.format_axis_entries(axis);
                }
            }
            bail!("missing axis {} in the chain {}", axis, self.name())
        }

        fn format_axis_length(&self, axis: &str) -> Result<usize> {
            self.state().assert_read("axis_length");
            for member in self.$members().iter().rev() {
                if member.format_has_axis(axis)? {
                    return member.format_axis_length(axis);
                }
            }
            bail!("missing axis {} in the chain {}", axis, self.name())
        }

        fn format_has_vector(&self, axis: &str, name: &str) -> Result<bool> {
            self.state().assert_read("has_vector");
            for member in self.$members().iter().rev() {
                if member.format_has_axis(axis)? && member.format_has_vector(axis, name)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }

        fn format_vectors_set(&self, axis: &str) -> Result<IndexSet<String>> {
            self.state().assert_read("vectors_set");
            let mut names = IndexSet::new();
            for member in self.$members() {
                if member.format_has_axis(axis)? {
                    names.extend(member.format_vectors_set(axis)?);
                }
            }
            Ok(names)
        }

        fn format_get_vector(
            &self,
            axis: &str,
            name: &str,
        ) -> Result<(Arc<VectorData>, CacheClass)> {
            self.state().assert_read("get_vector");
            for member in self.$members().iter().rev() {
                if member.format_has_axis(axis)? && member.format_has_vector(axis, name)? {
                    return member.format_get_vector(axis, name);
                }
            }
            bail!(
                "missing vector {} of the axis {} in the chain {}",
                name,
                axis,
                self.name()
            )
        }

        fn format_has_matrix(
            &self,
            rows_axis: &str,
            columns_axis: &str,
            name: &str,
        ) -> Result<bool> {
            self.state().assert_read("has_matrix");
            let key = matrix_cache_key(rows_axis, columns_axis, name);
            for member in self.$members().iter().rev() {
                if member.format_has_axis(rows_axis)?
                    && member.format_has_axis(columns_axis)?
                    && member.format_has_matrix(rows_axis, columns_axis, name)?
                {
                    return Ok(true);
                }
                if matches!(
                    member.state().cache().get(&key),
                    Some(CachedData::Matrix(_))
                ) {
                    return Ok(true);
                }
            }
            Ok(false)
        }

        fn format_matrices_set(
            &self,
            rows_axis: &str,
            columns_axis: &str,
        ) -> Result<IndexSet<String>> {
            self.state().assert_read("matrices_set");
            let mut names = IndexSet::new();
            for member in self.$members() {
                if member.format_has_axis(rows_axis)? && member.format_has_axis(columns_axis)? {
                    names.extend(member.format_matrices_set(rows_axis, columns_axis)?);
                }
            }
            Ok(names)
        }

        fn format_get_matrix(
            &self,
            rows_axis: &str,
            columns_axis: &str,
            name: &str,
        ) -> Result<(Arc<MatrixData>, CacheClass)> {
            self.state().assert_read("get_matrix");
            let key = matrix_cache_key(rows_axis, columns_axis, name);
            for member in self.$members().iter().rev() {
                if member.format_has_axis(rows_axis)?
                    && member.format_has_axis(columns_axis)?
                    && member.format_has_matrix(rows_axis, columns_axis, name)?
                {
                    return member.format_get_matrix(rows_axis, columns_axis, name);
                }
                // A relaid-out copy cached under the owning member.
                if let Some(CachedData::Matrix(matrix)) = member.state().cache().get(&key) {
                    return Ok((matrix, CacheClass::MemoryData));
                }
            }
            bail!(
                "missing matrix {} of the axes {} and {} in the chain {}",
                name,
                rows_axis,
                columns_axis,
                self.name()
            )
        }

        fn format_version_counter(&self, key: &str) -> u32 {
            self.$members()
                .iter()
                .fold(0u32, |sum, member| {
                    sum.wrapping_add(member.format_version_counter(key))
                })
        }
    };
}

impl ChainReader {
    fn read_members(&self) -> &[Arc<dyn FormatReader>] {
        &self.members
    }
}

impl FormatReader for ChainReader {
    fn state(&self) -> &StoreState {
        &self.state
    }

    fn frozen(&self) -> bool {
        true
    }

    fn begin_data_read(&self) {
        self.state.lock().begin_read();
        for member in &self.members {
            member.begin_data_read();
        }
    }

    fn end_data_read(&self) {
        for member in self.members.iter().rev() {
            member.end_data_read();
        }
        self.state.lock().end_read();
    }

    impl_chain_reads!(read_members);
}

/// Overlay an ordered list of readers and one final writer; every mutation
/// goes to the writer.
pub struct ChainWriter<W: FormatWriter> {
    state: StoreState,
    readers: Vec<Arc<dyn FormatReader>>,
    writer: Arc<W>,
    members: Vec<Arc<dyn FormatReader>>,
}

/// Compose a write chain. The writer is the last member; shared axes must be
/// identical across all members.
pub fn chain_writer<W: FormatWriter + 'static>(
    name: &str,
    readers: Vec<Arc<dyn FormatReader>>,
    writer: Arc<W>,
) -> Result<ChainWriter<W>> {
    ensure!(
        !writer.frozen(),
        "the final member {} of the chain {} is read-only",
        writer.name(),
        name
    );
    let mut borrowed: Vec<&dyn FormatReader> =
        readers.iter().map(|member| member.as_ref()).collect();
    borrowed.push(writer.as_ref() as &dyn FormatReader);
    validate_member_axes(&borrowed)?;
    let mut members = readers.clone();
    members.push(writer.clone() as Arc<dyn FormatReader>);
    Ok(ChainWriter {
        state: StoreState::new(name),
        readers,
        writer,
        members,
    })
}

impl<W: FormatWriter> std::fmt::Display for ChainWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "WriteChain {} of: {}",
            self.name(),
            self.members.iter().map(|member| member.name()).join(", ")
        )
    }
}

impl<W: FormatWriter> ChainWriter<W> {
    fn read_members(&self) -> &[Arc<dyn FormatReader>] {
        &self.members
    }

    /// Whether any member before the writer holds the property; such data
    /// cannot be deleted through the chain.
    fn owned_by_earlier(
        &self,
        check: impl Fn(&dyn FormatReader) -> Result<bool>,
    ) -> Result<Option<String>> {
        for member in self.readers.iter().rev() {
            if check(member.as_ref())? {
                return Ok(Some(member.name().to_owned()));
            }
        }
        Ok(None)
    }

    /// Writes that touch an axis the writer does not have first copy the
    /// axis from the member that defines it.
    fn ensure_axis_in_writer(&self, axis: &str) -> Result<()> {
        if self.writer.format_has_axis(axis)? {
            return Ok(());
        }
        let entries = self.format_axis_entries(axis)?;
        self.writer
            .format_add_axis(axis, Vec::clone(&entries))
    }
}

impl<W: FormatWriter> FormatReader for ChainWriter<W> {
    fn state(&self) -> &StoreState {
        &self.state
    }

    fn begin_data_read(&self) {
        self.state.lock().begin_read();
        for member in &self.members {
            member.begin_data_read();
        }
    }

    fn end_data_read(&self) {
        for member in self.members.iter().rev() {
            member.end_data_read();
        }
        self.state.lock().end_read();
    }

    impl_chain_reads!(read_members);
}

impl<W: FormatWriter> FormatWriter for ChainWriter<W> {
    fn begin_data_write(&self) {
        self.state.lock().begin_write();
        for member in &self.readers {
            member.begin_data_read();
        }
        self.writer.begin_data_write();
    }

    fn end_data_write(&self) {
        self.writer.end_data_write();
        for member in self.readers.iter().rev() {
            member.end_data_read();
        }
        self.state.lock().end_write();
    }

    fn format_set_scalar(&self, name: &str, value: ScalarValue) -> Result<()> {
        self.state.assert_write("set_scalar");
        self.writer.format_set_scalar(name, value)?;
        self.state.cache().invalidate(&scalar_cache_key(name));
        Ok(())
    }

    fn format_delete_scalar(&self, name: &str, for_set: bool) -> Result<()> {
        self.state.assert_write("delete_scalar");
        if !for_set {
            if let Some(owner) =
                self.owned_by_earlier(|member| member.format_has_scalar(name))?
            {
                bail!(
                    "refusing to delete the scalar {}\nwhich exists in the earlier member {}\nof the chain {}",
                    name,
                    owner,
                    self.name()
                );
            }
        }
        self.writer.format_delete_scalar(name, for_set)?;
        self.state.cache().invalidate(&scalar_cache_key(name));
        Ok(())
    }

    fn format_add_axis(&self, axis: &str, entries: Vec<String>) -> Result<()> {
        self.state.assert_write("add_axis");
        self.writer.format_add_axis(axis, entries)?;
        self.state.cache().invalidate(&axis_cache_key(axis));
        Ok(())
    }

    fn format_delete_axis(&self, axis: &str) -> Result<()> {
        self.state.assert_write("delete_axis");
        if let Some(owner) = self.owned_by_earlier(|member| member.format_has_axis(axis))? {
            bail!(
                "refusing to delete the axis {}\nwhich exists in the earlier member {}\nof the chain {}",
                axis,
                owner,
                self.name()
            );
        }
        self.writer.format_delete_axis(axis)?;
        self.state.cache().invalidate(&axis_cache_key(axis));
        Ok(())
    }

    fn format_set_vector(&self, axis: &str, name: &str, vector: VectorData) -> Result<()> {
        self.state.assert_write("set_vector");
        self.ensure_axis_in_writer(axis)?;
        self.writer.format_set_vector(axis, name, vector)?;
        self.state.cache().invalidate(&vector_cache_key(axis, name));
        Ok(())
    }

    fn format_delete_vector(&self, axis: &str, name: &str, for_set: bool) -> Result<()> {
        self.state.assert_write("delete_vector");
        if !for_set {
            if let Some(owner) = self.owned_by_earlier(|member| {
                Ok(member.format_has_axis(axis)? && member.format_has_vector(axis, name)?)
            })? {
                bail!(
                    "refusing to delete the vector {}\nof the axis {}\nwhich exists in the earlier member {}\nof the chain {}",
                    name,
                    axis,
                    owner,
                    self.name()
                );
            }
        }
        self.writer.format_delete_vector(axis, name, for_set)?;
        self.state.cache().invalidate(&vector_cache_key(axis, name));
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
        self.ensure_axis_in_writer(rows_axis)?;
        self.ensure_axis_in_writer(columns_axis)?;
        self.writer
            .format_set_matrix(rows_axis, columns_axis, name, matrix)?;
        self.state
            .cache()
            .invalidate(&matrix_cache_key(rows_axis, columns_axis, name));
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
        if !for_set {
            if let Some(owner) = self.owned_by_earlier(|member| {
                Ok(member.format_has_axis(rows_axis)?
                    && member.format_has_axis(columns_axis)?
                    && member.format_has_matrix(rows_axis, columns_axis, name)?)
            })? {
                bail!(
                    "refusing to delete the matrix {}\nof the axes {} and {}\nwhich exists in the earlier member {}\nof the chain {}",
                    name,
                    rows_axis,
                    columns_axis,
                    owner,
                    self.name()
                );
            }
        }
        let key = matrix_cache_key(rows_axis, columns_axis, name);
        let in_writer = self.writer.format_has_axis(rows_axis)?
            && self.writer.format_has_axis(columns_axis)?
            && self
                .writer
                .format_has_matrix(rows_axis, columns_axis, name)?;
        if for_set && !in_writer {
            // Only a relaid-out copy cached under some member exists.
            for member in &self.readers {
                member.state().cache().invalidate(&key);
            }
            self.state.cache().invalidate(&key);
            return Ok(());
        }
        self.writer
            .format_delete_matrix(rows_axis, columns_axis, name, for_set)?;
        self.state.cache().invalidate(&key);
        Ok(())
    }

    fn format_get_empty_dense_vector(
        &self,
        axis: &str,
        name: &str,
        element_type: ScalarType,
    ) -> Result<DenseVectorFill> {
        self.state.assert_write("get_empty_dense_vector");
        self.ensure_axis_in_writer(axis)?;
        self.writer
            .format_get_empty_dense_vector(axis, name, element_type)
    }

    fn format_filled_empty_dense_vector(&self, fill: DenseVectorFill) -> Result<()> {
        self.state.assert_write("filled_empty_dense_vector");
        let key = vector_cache_key(&fill.axis, &fill.name);
        self.writer.format_filled_empty_dense_vector(fill)?;
        self.state.cache().invalidate(&key);
        Ok(())
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
        self.ensure_axis_in_writer(axis)?;
        self.writer
            .format_get_empty_sparse_vector(axis, name, element_type, nnz, index_width)
    }

    fn format_filled_empty_sparse_vector(&self, fill: SparseVectorFill) -> Result<()> {
        self.state.assert_write("filled_empty_sparse_vector");
        let key = vector_cache_key(&fill.axis, &fill.name);
        self.writer.format_filled_empty_sparse_vector(fill)?;
        self.state.cache().invalidate(&key);
        Ok(())
    }

    fn format_get_empty_dense_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
        element_type: ScalarType,
    ) -> Result<DenseMatrixFill> {
        self.state.assert_write("get_empty_dense_matrix");
        self.ensure_axis_in_writer(rows_axis)?;
        self.ensure_axis_in_writer(columns_axis)?;
        self.writer
            .format_get_empty_dense_matrix(rows_axis, columns_axis, name, element_type)
    }

    fn format_filled_empty_dense_matrix(&self, fill: DenseMatrixFill) -> Result<()> {
        self.state.assert_write("filled_empty_dense_matrix");
        let key = matrix_cache_key(&fill.rows_axis, &fill.columns_axis, &fill.name);
        self.writer.format_filled_empty_dense_matrix(fill)?;
        self.state.cache().invalidate(&key);
        Ok(())
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
        self.ensure_axis_in_writer(rows_axis)?;
        self.ensure_axis_in_writer(columns_axis)?;
        self.writer.format_get_empty_sparse_matrix(
            rows_axis,
            columns_axis,
            name,
            element_type,
            nnz,
            index_width,
        )
    }

    fn format_filled_empty_sparse_matrix(&self, fill: SparseMatrixFill) -> Result<()> {
        self.state.assert_write("filled_empty_sparse_matrix");
        let key = matrix_cache_key(&fill.rows_axis, &fill.columns_axis, &fill.name);
        self.writer.format_filled_empty_sparse_matrix(fill)?;
        self.state.cache().invalidate(&key);
        Ok(())
    }

    /// Prefer to materialize into the writer when it owns the source matrix;
    /// otherwise compute the flipped copy and cache it under the owning
    /// member.
    fn format_relayout_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
    ) -> Result<Arc<MatrixData>> {
        self.state.assert_write("relayout_matrix");
        if self.writer.format_has_axis(rows_axis)?
            && self.writer.format_has_axis(columns_axis)?
            && self
                .writer
                .format_has_matrix(rows_axis, columns_axis, name)?
        {
            return self
                .writer
                .format_relayout_matrix(rows_axis, columns_axis, name);
        }
        for member in self.readers.iter().rev() {
            if member.format_has_axis(rows_axis)?
                && member.format_has_axis(columns_axis)?
                && member.format_has_matrix(rows_axis, columns_axis, name)?
            {
                let (matrix, _) = member.format_get_matrix(rows_axis, columns_axis, name)?;
                let flipped = Arc::new(transposer(&matrix)?);
                member.state().cache().put(
                    &matrix_cache_key(columns_axis, rows_axis, name),
                    CacheClass::MemoryData,
                    CachedData::Matrix(flipped.clone()),
                    &[axis_cache_key(rows_axis), axis_cache_key(columns_axis)],
                );
                return Ok(flipped);
            }
        }
        bail!(
            "missing matrix {} of the axes {} and {} in the chain {}",
            name,
            rows_axis,
            columns_axis,
            self.name()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DynVector;
    use crate::memory::MemoryDaf;
    use crate::readers::DafReader;
    use crate::writers::{axis_entries_of, DafWriter};

    fn reader_with_data() -> Arc<MemoryDaf> {
        let daf = MemoryDaf::new("chain-base");
        daf.set_scalar("v", ScalarValue::I64(1), false).unwrap();
        daf.add_axis("cell", axis_entries_of(&["c1", "c2"])).unwrap();
        daf.set_vector("cell", "batch", VectorData::from(vec!["a", "b"]), false)
            .unwrap();
        Arc::new(daf)
    }

    #[test]
    fn chain_reads_last_wins_and_unions() {
        let base = reader_with_data();
        let overlay = MemoryDaf::new("chain-overlay");
        overlay.set_scalar("v", ScalarValue::I64(2), false).unwrap();
        overlay.set_scalar("w", ScalarValue::I64(3), false).unwrap();
        let chain = chain_reader(
            "chain",
            vec![base.clone() as Arc<dyn FormatReader>, Arc::new(overlay)],
        )
        .unwrap();

        assert_eq!(chain.get_scalar("v").unwrap(), ScalarValue::I64(2));
        assert_eq!(chain.get_scalar("w").unwrap(), ScalarValue::I64(3));
        let scalars = chain.scalars_set().unwrap();
        assert!(scalars.contains("v") && scalars.contains("w"));
        assert_eq!(chain.axis_length("cell").unwrap(), 2);
        assert_eq!(
            *chain.get_vector("cell", "batch").unwrap(),
            VectorData::from(vec!["a", "b"])
        );
    }

    #[test]
    fn chain_rejects_mismatched_axes() {
        let base = reader_with_data();
        let other = MemoryDaf::new("chain-mismatch");
        other
            .add_axis("cell", axis_entries_of(&["c1", "c3"]))
            .unwrap();
        let result = chain_reader(
            "chain",
            vec![base as Arc<dyn FormatReader>, Arc::new(other)],
        );
        let message = format!("{:#}", result.err().unwrap());
        assert!(message.contains("different entries of the axis cell"));
    }

    #[test]
    fn chain_writes_go_to_writer_and_deletes_refuse() {
        let base = reader_with_data();
        let writer = Arc::new(MemoryDaf::new("chain-writer"));
        let chain = chain_writer(
            "chain",
            vec![base.clone() as Arc<dyn FormatReader>],
            writer.clone(),
        )
        .unwrap();

        chain.set_scalar("v", ScalarValue::I64(2), true).unwrap();
        assert_eq!(chain.get_scalar("v").unwrap(), ScalarValue::I64(2));
        assert_eq!(writer.get_scalar("v").unwrap(), ScalarValue::I64(2));
        assert_eq!(base.get_scalar("v").unwrap(), ScalarValue::I64(1));

        // The chain cannot hide data it does not own.
        assert!(chain.delete_scalar("v", true).is_err());
        chain.set_scalar("v", ScalarValue::I64(3), true).unwrap();
        assert!(chain.delete_scalar("v", true).is_err());

        // Writing a vector copies its axis into the writer first.
        chain
            .set_vector(
                "cell",
                "age",
                VectorData::Dense(DynVector::from(vec![1i8, 2])),
                false,
            )
            .unwrap();
        assert!(writer.has_axis("cell").unwrap());
        assert_eq!(
            *writer.get_vector("cell", "age").unwrap(),
            VectorData::from(vec![1i8, 2])
        );
    }
}
