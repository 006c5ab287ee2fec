//! The HDF5 backend: a store on an HDF5 file or a group inside one, with a
//! fixed on-disk structure:
//!
//! ```text
//! <root>/
//!   daf                 : version marker, [major, minor]
//!   scalars/            : one dataset per scalar
//!   axes/               : one 1-D string dataset per axis
//!   vectors/<axis>/<name>
//!      dense            : 1-D dataset
//!      sparse           : group { nzind, nzval }  (nzval absent: all-true bool)
//!      sparse-string    : group { nzind, nztxt }
//!   matrices/<rows-axis>/<columns-axis>/<name>
//!      dense            : 2-D dataset, rows-contiguous
//!      sparse           : group { colptr, rowval, nzval }
//!      sparse-string    : group { colptr, rowval, nztxt }
//! ```
//!
//! All on-disk indices are 1-based and sorted, at the narrowest signed width
//! that fits the container. Dense datasets are contiguous (never chunked)
//! and the file is created with `(1, 8)` alignment so they can be memory
//! mapped; the `get_empty_*` allocators hand out fill buffers directly over
//! the mapped storage when possible.

mod mapping;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Result};
use hdf5::types::{FloatSize, IntSize, TypeDescriptor, VarLenUnicode};
use hdf5::{Dataset, File, FileBuilder, Group, H5Type};
use indexmap::IndexSet;
use ndarray::{ArrayView1, ArrayView2};

use crate::cache::{
    axis_cache_key, matrix_cache_key, scalar_cache_key, vector_cache_key, CacheClass,
};
use crate::data::{
    dispatch_numeric_type, dispatch_real_type, with_dyn_vector_real, DynBuffer, DynCsc, DynDense,
    DynVector, Element, IndexBuffer, IndexHeap, IndexWidth, MappedElement, MatrixData, ScalarType,
    ScalarValue, SliceBuffer, SparseVector, VectorData,
};
use crate::format::{
    DenseMatrixFill, DenseVectorFill, FormatReader, FormatWriter, SparseMatrixFill,
    SparseVectorFill, StoreState,
};
use crate::layout::transposer;

const DAF_MARKER: &str = "daf";
const MAJOR_VERSION: u32 = 1;
const MINOR_VERSION: u32 = 0;
const SCALARS_GROUP: &str = "scalars";
const AXES_GROUP: &str = "axes";
const VECTORS_GROUP: &str = "vectors";
const MATRICES_GROUP: &str = "matrices";

/// The open modes of §lifecycle: `r`, `r+`, `w+`, `w`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    ReadPlus,
    WritePlus,
    Write,
}

impl FromStr for AccessMode {
    type Err = anyhow::Error;

    fn from_str(mode: &str) -> Result<AccessMode> {
        match mode {
            "r" => Ok(AccessMode::Read),
            "r+" => Ok(AccessMode::ReadPlus),
            "w+" => Ok(AccessMode::WritePlus),
            "w" => Ok(AccessMode::Write),
            _ => bail!("invalid mode {} (expected one of r, r+, w+, w)", mode),
        }
    }
}

impl AccessMode {
    fn may_create(self) -> bool {
        matches!(self, AccessMode::WritePlus | AccessMode::Write)
    }

    fn writable(self) -> bool {
        self != AccessMode::Read
    }
}

/// A store on an HDF5 file, or on a group inside one when the path carries a
/// `#/group/path` fragment (the `.h5dfs#/...` shorthand).
pub struct H5df {
    state: StoreState,
    file: File,
    root: Group,
    file_path: PathBuf,
    writable: bool,
}

impl H5df {
    /// Open (or create, per `mode`) a store. `target` is either a file path or
    /// `<path>#/<group-path>` to select a nested group.
    pub fn open(target: &str, mode: &str) -> Result<H5df> {
        let mode: AccessMode = mode.parse()?;
        let (path_part, fragment) = match target.split_once('#') {
            Some((path_part, fragment)) => (path_part, Some(fragment.trim_start_matches('/'))),
            None => (target, None),
        };
        let file_path = PathBuf::from(path_part);
        let file = open_file(&file_path, mode, fragment.is_some())?;
        let root = match fragment {
            None => file.group("/")?,
            Some(fragment) => prepare_group(&file, fragment, mode)?,
        };

        if root.link_exists(DAF_MARKER) {
            check_marker(&root, target)?;
            for group in [SCALARS_GROUP, AXES_GROUP, VECTORS_GROUP, MATRICES_GROUP] {
                ensure!(
                    root.link_exists(group),
                    "missing the expected group {}\nin the data set {}",
                    group,
                    target
                );
            }
        } else {
            ensure!(
                mode.may_create(),
                "the group has no {} marker\nso {} may only be opened in a create mode (w or w+)",
                DAF_MARKER,
                target
            );
            initialize_structure(&root)?;
        }

        Ok(H5df {
            state: StoreState::new(target),
            file,
            root,
            file_path,
            writable: mode.writable(),
        })
    }

    fn scalars(&self) -> Result<Group> {
        Ok(self.root.group(SCALARS_GROUP)?)
    }

    fn axes(&self) -> Result<Group> {
        Ok(self.root.group(AXES_GROUP)?)
    }

    fn vectors_of(&self, axis: &str) -> Result<Group> {
        Ok(self.root.group(&format!("{}/{}", VECTORS_GROUP, axis))?)
    }

    fn has_matrix_pair_group(&self, rows_axis: &str, columns_axis: &str) -> Result<bool> {
        let matrices = self.root.group(MATRICES_GROUP)?;
        if !matrices.link_exists(rows_axis) {
            return Ok(false);
        }
        Ok(matrices.group(rows_axis)?.link_exists(columns_axis))
    }

    fn matrix_pair_group(&self, rows_axis: &str, columns_axis: &str) -> Result<Group> {
        Ok(self
            .root
            .group(&format!("{}/{}/{}", MATRICES_GROUP, rows_axis, columns_axis))?)
    }

    fn ensure_matrix_pair_group(&self, rows_axis: &str, columns_axis: &str) -> Result<Group> {
        let matrices = self.root.group(MATRICES_GROUP)?;
        let rows_group = if matrices.link_exists(rows_axis) {
            matrices.group(rows_axis)?
        } else {
            matrices.create_group(rows_axis)?
        };
        if rows_group.link_exists(columns_axis) {
            Ok(rows_group.group(columns_axis)?)
        } else {
            Ok(rows_group.create_group(columns_axis)?)
        }
    }

    fn axis_len(&self, axis: &str) -> Result<usize> {
        let axes = self.axes()?;
        ensure!(
            axes.link_exists(axis),
            "missing axis {} in the data set {}",
            axis,
            self.name()
        );
        Ok(axes.dataset(axis)?.shape()[0])
    }

    fn require_writable(&self) -> Result<()> {
        ensure!(
            self.writable,
            "the data set {} was opened read-only",
            self.name()
        );
        Ok(())
    }

    /// Create a zero-initialized contiguous dataset and hand back a fill
    /// buffer over its mapped storage, falling back to the heap (with a
    /// warning, since the fill then costs an extra copy) when mapping is
    /// impossible.
    fn empty_element_buffer(
        &self,
        group: &Group,
        name: &str,
        element_type: ScalarType,
        len: usize,
    ) -> Result<DynBuffer> {
        if group.link_exists(name) {
            group.unlink(name)?;
        }
        dispatch_numeric_type!(
            element_type,
            T => {
                let zeros = vec![<T as Element>::zero_element(); len];
                let dataset = group
                    .new_dataset_builder()
                    .with_data(zeros.as_slice())
                    .create(name)?;
                match mapping::map_dataset_buffer::<T>(
                    &self.file_path,
                    &self.file,
                    &dataset,
                    len,
                ) {
                    Ok(buffer) => Ok(<T as Element>::wrap_buffer(buffer)),
                    Err(error) => {
                        log::warn!(
                            "filling {} through a heap buffer: {}",
                            dataset.name(),
                            error
                        );
                        Ok(DynBuffer::heap(element_type, len))
                    }
                }
            },
            Ok(DynBuffer::heap(element_type, len)),
            Ok(DynBuffer::heap(element_type, len))
        )
    }

    fn empty_typed_index<T: MappedElement + H5Type>(
        &self,
        group: &Group,
        name: &str,
        len: usize,
    ) -> Result<SliceBuffer<T>> {
        if group.link_exists(name) {
            group.unlink(name)?;
        }
        let zeros = vec![T::zero_element(); len];
        let dataset = group
            .new_dataset_builder()
            .with_data(zeros.as_slice())
            .create(name)?;
        match mapping::map_dataset_buffer::<T>(&self.file_path, &self.file, &dataset, len) {
            Ok(buffer) => Ok(buffer),
            Err(error) => {
                log::warn!("filling {} through a heap buffer: {}", dataset.name(), error);
                Ok(SliceBuffer::heap(len, T::zero_element()))
            }
        }
    }

    fn empty_index_buffer(
        &self,
        group: &Group,
        name: &str,
        width: IndexWidth,
        len: usize,
    ) -> Result<IndexBuffer> {
        Ok(match width {
            IndexWidth::I8 => IndexBuffer::I8(self.empty_typed_index::<i8>(group, name, len)?),
            IndexWidth::I16 => IndexBuffer::I16(self.empty_typed_index::<i16>(group, name, len)?),
            IndexWidth::I32 => IndexBuffer::I32(self.empty_typed_index::<i32>(group, name, len)?),
            IndexWidth::I64 => IndexBuffer::I64(self.empty_typed_index::<i64>(group, name, len)?),
        })
    }

    /// Flush a committed element buffer into `group/name`: mapped buffers
    /// are already on disk, heap ones are written here.
    fn commit_element_buffer(&self, group: &Group, name: &str, buffer: DynBuffer) -> Result<()> {
        match buffer.into_dense()? {
            None => Ok(()),
            Some(values) => {
                if group.link_exists(name) {
                    write_into_dataset(&group.dataset(name)?, &values)
                } else {
                    create_dense_dataset(group, name, &values)
                }
            }
        }
    }

    fn commit_index_buffer(&self, group: &Group, name: &str, buffer: IndexBuffer) -> Result<()> {
        match buffer.into_heap_parts()? {
            None => Ok(()),
            Some(heap) => {
                let exists = group.link_exists(name);
                match heap {
                    IndexHeap::I8(values) => {
                        write_index_values(group, name, exists, values.as_slice())
                    }
                    IndexHeap::I16(values) => {
                        write_index_values(group, name, exists, values.as_slice())
                    }
                    IndexHeap::I32(values) => {
                        write_index_values(group, name, exists, values.as_slice())
                    }
                    IndexHeap::I64(values) => {
                        write_index_values(group, name, exists, values.as_slice())
                    }
                }
            }
        }
    }
}

impl std::fmt::Display for H5df {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "H5df {}", self.name())
    }
}

fn open_file(path: &std::path::Path, mode: AccessMode, has_fragment: bool) -> Result<File> {
    let mut builder = FileBuilder::new();
    // Alignment (1, 8) keeps every allocation 8-byte aligned so contiguous
    // datasets can be mapped.
    builder.with_fapl(|fapl| fapl.alignment(1, 8));
    let file = match mode {
        AccessMode::Read => builder.open(path),
        AccessMode::ReadPlus => builder.open_rw(path),
        AccessMode::WritePlus => builder.append(path),
        // Truncating the whole file is only right when the whole file is
        // the target; a fragment truncates just its group.
        AccessMode::Write => {
            if has_fragment {
                builder.append(path)
            } else {
                builder.create(path)
            }
        }
    };
    file.map_err(|error| anyhow!("{}: {}", path.display(), error))
}

fn prepare_group(file: &File, fragment: &str, mode: AccessMode) -> Result<Group> {
    let components: Vec<&str> = fragment.split('/').filter(|part| !part.is_empty()).collect();
    ensure!(!components.is_empty(), "empty group path after #");
    match mode {
        AccessMode::Read | AccessMode::ReadPlus => Ok(file.group(fragment)?),
        AccessMode::WritePlus => open_or_create_groups(file, &components),
        AccessMode::Write => {
            let (last, parents) = components.split_last().expect("checked non-empty");
            let parent = open_or_create_groups(file, parents)?;
            if parent.link_exists(last) {
                parent.unlink(last)?;
            }
            Ok(parent.create_group(last)?)
        }
    }
}

fn open_or_create_groups(file: &File, components: &[&str]) -> Result<Group> {
    let mut group = file.group("/")?;
    for component in components {
        group = if group.link_exists(component) {
            group.group(component)?
        } else {
            group.create_group(component)?
        };
    }
    Ok(group)
}

fn check_marker(root: &Group, target: &str) -> Result<()> {
    let versions = root.dataset(DAF_MARKER)?.read_raw::<u32>()?;
    ensure!(
        versions.len() >= 2,
        "invalid {} marker\nin the data set {}",
        DAF_MARKER,
        target
    );
    ensure!(
        versions[0] == MAJOR_VERSION,
        "incompatible format major version {} (expected {})\nof the data set {}",
        versions[0],
        MAJOR_VERSION,
        target
    );
    ensure!(
        versions[1] <= MINOR_VERSION,
        "incompatible format minor version {} (expected at most {})\nof the data set {}",
        versions[1],
        MINOR_VERSION,
        target
    );
    Ok(())
}

fn initialize_structure(root: &Group) -> Result<()> {
    let marker = [MAJOR_VERSION, MINOR_VERSION];
    root.new_dataset_builder()
        .with_data(marker.as_slice())
        .create(DAF_MARKER)?;
    root.create_group(SCALARS_GROUP)?;
    root.create_group(AXES_GROUP)?;
    root.create_group(VECTORS_GROUP)?;
    root.create_group(MATRICES_GROUP)?;
    Ok(())
}

fn scalar_type_of(descriptor: &TypeDescriptor) -> Result<ScalarType> {
    match descriptor {
        TypeDescriptor::Integer(IntSize::U1) => Ok(ScalarType::I8),
        TypeDescriptor::Integer(IntSize::U2) => Ok(ScalarType::I16),
        TypeDescriptor::Integer(IntSize::U4) => Ok(ScalarType::I32),
        TypeDescriptor::Integer(IntSize::U8) => Ok(ScalarType::I64),
        TypeDescriptor::Unsigned(IntSize::U1) => Ok(ScalarType::U8),
        TypeDescriptor::Unsigned(IntSize::U2) => Ok(ScalarType::U16),
        TypeDescriptor::Unsigned(IntSize::U4) => Ok(ScalarType::U32),
        TypeDescriptor::Unsigned(IntSize::U8) => Ok(ScalarType::U64),
        TypeDescriptor::Float(FloatSize::U4) => Ok(ScalarType::F32),
        TypeDescriptor::Float(FloatSize::U8) => Ok(ScalarType::F64),
        TypeDescriptor::Boolean => Ok(ScalarType::Bool),
        TypeDescriptor::VarLenUnicode
        | TypeDescriptor::VarLenAscii
        | TypeDescriptor::FixedUnicode(_)
        | TypeDescriptor::FixedAscii(_) => Ok(ScalarType::Str),
        other => bail!("unsupported storage element type {}", other),
    }
}

fn dataset_scalar_type(dataset: &Dataset) -> Result<ScalarType> {
    scalar_type_of(&dataset.dtype()?.to_descriptor()?)
}

fn read_scalar_dataset(dataset: &Dataset) -> Result<ScalarValue> {
    dispatch_real_type!(
        dataset_scalar_type(dataset)?,
        T => Ok(dataset.read_scalar::<T>()?.to_scalar()),
        Ok(ScalarValue::Str(
            dataset.read_scalar::<VarLenUnicode>()?.as_str().to_owned()
        ))
    )
}

fn write_scalar_dataset(group: &Group, name: &str, value: &ScalarValue) -> Result<()> {
    fn numeric<T: H5Type>(group: &Group, name: &str, value: &T) -> Result<()> {
        let dataset = group.new_dataset::<T>().create(name)?;
        dataset.write_scalar(value)?;
        Ok(())
    }

    match value {
        ScalarValue::I8(v) => numeric(group, name, v),
        ScalarValue::I16(v) => numeric(group, name, v),
        ScalarValue::I32(v) => numeric(group, name, v),
        ScalarValue::I64(v) => numeric(group, name, v),
        ScalarValue::U8(v) => numeric(group, name, v),
        ScalarValue::U16(v) => numeric(group, name, v),
        ScalarValue::U32(v) => numeric(group, name, v),
        ScalarValue::U64(v) => numeric(group, name, v),
        ScalarValue::F32(v) => numeric(group, name, v),
        ScalarValue::F64(v) => numeric(group, name, v),
        ScalarValue::Bool(v) => numeric(group, name, v),
        ScalarValue::Str(text) => {
            let text: VarLenUnicode = text
                .parse()
                .map_err(|error| anyhow!("invalid string: {}", error))?;
            let dataset = group.new_dataset::<VarLenUnicode>().create(name)?;
            dataset.write_scalar(&text)?;
            Ok(())
        }
    }
}

fn read_dense_values(dataset: &Dataset) -> Result<DynVector> {
    dispatch_real_type!(
        dataset_scalar_type(dataset)?,
        T => Ok(<T as Element>::dyn_from_vec(dataset.read_raw::<T>()?)),
        Ok(DynVector::Str(
            dataset
                .read_raw::<VarLenUnicode>()?
                .into_iter()
                .map(|text| text.as_str().to_owned())
                .collect()
        ))
    )
}

fn to_unicode(values: &[String]) -> Result<Vec<VarLenUnicode>> {
    values
        .iter()
        .map(|value| {
            value
                .parse::<VarLenUnicode>()
                .map_err(|error| anyhow!("invalid string: {}", error))
        })
        .collect()
}

fn create_dense_dataset(group: &Group, name: &str, values: &DynVector) -> Result<()> {
    with_dyn_vector_real!(
        values,
        |v| {
            group
                .new_dataset_builder()
                .with_data(v.as_slice())
                .create(name)?;
            Ok(())
        },
        |texts| {
            let unicode = to_unicode(texts)?;
            group
                .new_dataset_builder()
                .with_data(unicode.as_slice())
                .create(name)?;
            Ok(())
        }
    )
}

fn write_into_dataset(dataset: &Dataset, values: &DynVector) -> Result<()> {
    with_dyn_vector_real!(
        values,
        |v| {
            dataset.write(ArrayView1::from(v.as_slice()))?;
            Ok(())
        },
        |texts| {
            let unicode = to_unicode(texts)?;
            dataset.write(ArrayView1::from(unicode.as_slice()))?;
            Ok(())
        }
    )
}

fn write_index_values<T: H5Type + Copy>(
    group: &Group,
    name: &str,
    exists: bool,
    values: &[T],
) -> Result<()> {
    if exists {
        group.dataset(name)?.write(ArrayView1::from(values))?;
    } else {
        group
            .new_dataset_builder()
            .with_data(values)
            .create(name)?;
    }
    Ok(())
}

/// Write a 1-based index dataset at the given width.
fn create_index_dataset(
    group: &Group,
    name: &str,
    width: IndexWidth,
    values: impl Iterator<Item = usize>,
) -> Result<()> {
    fn narrow<T: H5Type + num::NumCast>(
        group: &Group,
        name: &str,
        values: impl Iterator<Item = usize>,
    ) -> Result<()> {
        let narrowed: Result<Vec<T>> = values
            .map(|value| {
                num::NumCast::from(value)
                    .ok_or_else(|| anyhow!("the index {} does not fit the index width", value))
            })
            .collect();
        group
            .new_dataset_builder()
            .with_data(narrowed?.as_slice())
            .create(name)?;
        Ok(())
    }

    match width {
        IndexWidth::I8 => narrow::<i8>(group, name, values),
        IndexWidth::I16 => narrow::<i16>(group, name, values),
        IndexWidth::I32 => narrow::<i32>(group, name, values),
        IndexWidth::I64 => narrow::<i64>(group, name, values),
    }
}

fn read_index_dataset(dataset: &Dataset) -> Result<Vec<usize>> {
    Ok(dataset
        .read_raw::<i64>()?
        .into_iter()
        .map(|value| value as usize)
        .collect())
}

/// Read `group/name` back as 0-based positions.
fn read_zero_based(group: &Group, name: &str) -> Result<Vec<usize>> {
    Ok(read_index_dataset(&group.dataset(name)?)?
        .into_iter()
        .map(|value| value.saturating_sub(1))
        .collect())
}

impl FormatReader for H5df {
    fn state(&self) -> &StoreState {
        &self.state
    }

    fn frozen(&self) -> bool {
        !self.writable
    }

    fn format_has_scalar(&self, name: &str) -> Result<bool> {
        self.state.assert_read("has_scalar");
        Ok(self.scalars()?.link_exists(name))
    }

    fn format_get_scalar(&self, name: &str) -> Result<ScalarValue> {
        self.state.assert_read("get_scalar");
        let scalars = self.scalars()?;
        ensure!(
            scalars.link_exists(name),
            "missing scalar {} in the data set {}",
            name,
            self.name()
        );
        read_scalar_dataset(&scalars.dataset(name)?)
    }

    fn format_scalars_set(&self) -> Result<IndexSet<String>> {
        self.state.assert_read("scalars_set");
        Ok(self.scalars()?.member_names()?.into_iter().collect())
    }

    fn format_has_axis(&self, axis: &str) -> Result<bool> {
        self.state.assert_read("has_axis");
        Ok(self.axes()?.link_exists(axis))
    }

    fn format_axes_set(&self) -> Result<IndexSet<String>> {
        self.state.assert_read("axes_set");
        Ok(self.axes()?.member_names()?.into_iter().collect())
    }

    fn format_axis_entries(&self, axis: &str) -> Result<Arc<Vec<String>>> {
        self.state.assert_read("axis_entries");
        let axes = self.axes()?;
        ensure!(
            axes.link_exists(axis),
            "missing axis {} in the data set {}",
            axis,
            self.name()
        );
        let entries = axes
            .dataset(axis)?
            .read_raw::<VarLenUnicode>()?
            .into_iter()
            .map(|entry| entry.as_str().to_owned())
            .collect();
        Ok(Arc::new(entries))
    }

    fn format_axis_length(&self, axis: &str) -> Result<usize> {
        self.state.assert_read("axis_length");
        self.axis_len(axis)
    }

    fn format_has_vector(&self, axis: &str, name: &str) -> Result<bool> {
        self.state.assert_read("has_vector");
        let vectors = self.root.group(VECTORS_GROUP)?;
        if !vectors.link_exists(axis) {
            return Ok(false);
        }
        Ok(vectors.group(axis)?.link_exists(name))
    }

    fn format_vectors_set(&self, axis: &str) -> Result<IndexSet<String>> {
        self.state.assert_read("vectors_set");
        let vectors = self.root.group(VECTORS_GROUP)?;
        if !vectors.link_exists(axis) {
            return Ok(IndexSet::new());
        }
        Ok(vectors.group(axis)?.member_names()?.into_iter().collect())
    }

    fn format_get_vector(&self, axis: &str, name: &str) -> Result<(Arc<VectorData>, CacheClass)> {
        self.state.assert_read("get_vector");
        ensure!(
            self.format_has_vector(axis, name)?,
            "missing vector {} of the axis {} in the data set {}",
            name,
            axis,
            self.name()
        );
        let group = self.vectors_of(axis)?;
        if let Ok(dataset) = group.dataset(name) {
            if dataset.is_chunked() {
                log::warn!(
                    "the dense dataset {} is chunked and cannot be memory mapped",
                    dataset.name()
                );
            }
            let values = read_dense_values(&dataset)?;
            let class = if dataset.is_chunked() || values.scalar_type() == ScalarType::Str {
                CacheClass::MemoryData
            } else {
                CacheClass::MappedData
            };
            return Ok((Arc::new(VectorData::Dense(values)), class));
        }

        let sparse_group = group.group(name)?;
        let length = self.axis_len(axis)?;
        let indices = read_zero_based(&sparse_group, "nzind")?;
        if sparse_group.link_exists("nztxt") {
            // Sparse strings materialize dense; the compressed string form
            // is a disk-only optimization.
            let texts = read_dense_values(&sparse_group.dataset("nztxt")?)?;
            let stored = match texts {
                DynVector::Str(texts) => texts,
                _ => bail!(
                    "invalid nztxt of the vector {} of the axis {} in the data set {}",
                    name,
                    axis,
                    self.name()
                ),
            };
            let mut dense = vec![String::new(); length];
            for (position, index) in indices.iter().enumerate() {
                dense[*index] = stored[position].clone();
            }
            return Ok((
                Arc::new(VectorData::Dense(DynVector::Str(dense))),
                CacheClass::MemoryData,
            ));
        }
        let values = if sparse_group.link_exists("nzval") {
            read_dense_values(&sparse_group.dataset("nzval")?)?
        } else {
            // An absent nzval is the all-true bool elision.
            DynVector::Bool(vec![true; indices.len()])
        };
        let sparse = SparseVector::new(length, indices, values)?;
        Ok((
            Arc::new(VectorData::Sparse(sparse)),
            CacheClass::MappedData,
        ))
    }

    fn format_has_matrix(&self, rows_axis: &str, columns_axis: &str, name: &str) -> Result<bool> {
        self.state.assert_read("has_matrix");
        if !self.has_matrix_pair_group(rows_axis, columns_axis)? {
            return Ok(false);
        }
        Ok(self
            .matrix_pair_group(rows_axis, columns_axis)?
            .link_exists(name))
    }

    fn format_matrices_set(&self, rows_axis: &str, columns_axis: &str) -> Result<IndexSet<String>> {
        self.state.assert_read("matrices_set");
        if !self.has_matrix_pair_group(rows_axis, columns_axis)? {
            return Ok(IndexSet::new());
        }
        Ok(self
            .matrix_pair_group(rows_axis, columns_axis)?
            .member_names()?
            .into_iter()
            .collect())
    }

    fn format_get_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
    ) -> Result<(Arc<MatrixData>, CacheClass)> {
        self.state.assert_read("get_matrix");
        ensure!(
            self.format_has_matrix(rows_axis, columns_axis, name)?,
            "missing matrix {} of the axes {} and {} in the data set {}",
            name,
            rows_axis,
            columns_axis,
            self.name()
        );
        let group = self.matrix_pair_group(rows_axis, columns_axis)?;
        let nrows = self.axis_len(rows_axis)?;
        let ncols = self.axis_len(columns_axis)?;

        if let Ok(dataset) = group.dataset(name) {
            if dataset.is_chunked() {
                log::warn!(
                    "the dense dataset {} is chunked and cannot be memory mapped",
                    dataset.name()
                );
            }
            // The file records the dimensions of the rows-contiguous layout,
            // so the raw element order is column-major of (nrows, ncols).
            let shape = dataset.shape();
            ensure!(
                shape.len() == 2 && shape[0] == ncols && shape[1] == nrows,
                "the shape ({}, {}) of the matrix {}\nis different from the shape ({}, {}) of the axes {} and {}\nin the data set {}",
                shape.get(1).copied().unwrap_or(0),
                shape.first().copied().unwrap_or(0),
                name,
                nrows,
                ncols,
                rows_axis,
                columns_axis,
                self.name()
            );
            let values = read_dense_values(&dataset)?;
            let class = if dataset.is_chunked() || values.scalar_type() == ScalarType::Str {
                CacheClass::MemoryData
            } else {
                CacheClass::MappedData
            };
            let dense = DynDense::from_column_major(nrows, ncols, values)?;
            return Ok((Arc::new(MatrixData::Dense(dense)), class));
        }

        let sparse_group = group.group(name)?;
        let col_offsets = read_zero_based(&sparse_group, "colptr")?;
        let row_indices = read_zero_based(&sparse_group, "rowval")?;
        if sparse_group.link_exists("nztxt") {
            let texts = read_dense_values(&sparse_group.dataset("nztxt")?)?;
            let stored = match texts {
                DynVector::Str(texts) => texts,
                _ => bail!(
                    "invalid nztxt of the matrix {} of the axes {} and {} in the data set {}",
                    name,
                    rows_axis,
                    columns_axis,
                    self.name()
                ),
            };
            let mut dense = ndarray::Array2::from_elem(
                ndarray::ShapeBuilder::f((nrows, ncols)),
                String::new(),
            );
            for column in 0..ncols {
                for position in col_offsets[column]..col_offsets[column + 1] {
                    dense[[row_indices[position], column]] = stored[position].clone();
                }
            }
            return Ok((
                Arc::new(MatrixData::Dense(DynDense::Str(dense))),
                CacheClass::MemoryData,
            ));
        }
        let values = if sparse_group.link_exists("nzval") {
            read_dense_values(&sparse_group.dataset("nzval")?)?
        } else {
            DynVector::Bool(vec![true; row_indices.len()])
        };
        let sparse = DynCsc::from_parts(nrows, ncols, col_offsets, row_indices, values)?;
        Ok((
            Arc::new(MatrixData::Csc(sparse)),
            CacheClass::MappedData,
        ))
    }
}

impl FormatWriter for H5df {
    fn format_set_scalar(&self, name: &str, value: ScalarValue) -> Result<()> {
        self.state.assert_write("set_scalar");
        self.require_writable()?;
        let scalars = self.scalars()?;
        if scalars.link_exists(name) {
            scalars.unlink(name)?;
        }
        write_scalar_dataset(&scalars, name, &value)?;
        let key = scalar_cache_key(name);
        self.state.cache().invalidate(&key);
        self.state.bump_version(&key);
        Ok(())
    }

    fn format_delete_scalar(&self, name: &str, for_set: bool) -> Result<()> {
        self.state.assert_write("delete_scalar");
        self.require_writable()?;
        let scalars = self.scalars()?;
        ensure!(
            scalars.link_exists(name),
            "missing scalar {} in the data set {}",
            name,
            self.name()
        );
        scalars.unlink(name)?;
        let key = scalar_cache_key(name);
        self.state.cache().invalidate(&key);
        if !for_set {
            self.state.bump_version(&key);
        }
        Ok(())
    }

    fn format_add_axis(&self, axis: &str, entries: Vec<String>) -> Result<()> {
        self.state.assert_write("add_axis");
        self.require_writable()?;
        let axes = self.axes()?;
        let unicode = to_unicode(&entries)?;
        axes.new_dataset_builder()
            .with_data(unicode.as_slice())
            .create(axis)?;
        let vectors = self.root.group(VECTORS_GROUP)?;
        if !vectors.link_exists(axis) {
            vectors.create_group(axis)?;
        }
        let key = axis_cache_key(axis);
        self.state.cache().invalidate(&key);
        self.state.bump_version(&key);
        Ok(())
    }

    fn format_delete_axis(&self, axis: &str) -> Result<()> {
        self.state.assert_write("delete_axis");
        self.require_writable()?;
        let axes = self.axes()?;
        ensure!(
            axes.link_exists(axis),
            "missing axis {} in the data set {}",
            axis,
            self.name()
        );
        axes.unlink(axis)?;
        let vectors = self.root.group(VECTORS_GROUP)?;
        if vectors.link_exists(axis) {
            vectors.unlink(axis)?;
        }
        let matrices = self.root.group(MATRICES_GROUP)?;
        if matrices.link_exists(axis) {
            matrices.unlink(axis)?;
        }
        for rows_axis in matrices.member_names()? {
            let rows_group = matrices.group(&rows_axis)?;
            if rows_group.link_exists(axis) {
                rows_group.unlink(axis)?;
            }
        }
        let key = axis_cache_key(axis);
        self.state.cache().invalidate(&key);
        self.state.bump_version(&key);
        Ok(())
    }

    fn format_set_vector(&self, axis: &str, name: &str, vector: VectorData) -> Result<()> {
        self.state.assert_write("set_vector");
        self.require_writable()?;
        let length = self.axis_len(axis)?;
        ensure!(
            vector.len() == length,
            "the length {} of the vector {} is different from the length {} of the axis {} in the data set {}",
            vector.len(),
            name,
            length,
            axis,
            self.name()
        );
        let group = self.vectors_of(axis)?;
        if group.link_exists(name) {
            group.unlink(name)?;
        }
        match vector {
            VectorData::Dense(values) => create_dense_dataset(&group, name, &values)?,
            VectorData::Sparse(sparse) => {
                let width = IndexWidth::for_capacity(length);
                let sparse_group = group.create_group(name)?;
                create_index_dataset(
                    &sparse_group,
                    "nzind",
                    width,
                    sparse.nzind().iter().map(|index| index + 1),
                )?;
                let all_true = matches!(
                    sparse.nzval(),
                    DynVector::Bool(values) if values.iter().all(|value| *value)
                );
                if !all_true {
                    create_dense_dataset(&sparse_group, "nzval", sparse.nzval())?;
                }
            }
        }
        let key = vector_cache_key(axis, name);
        self.state.cache().invalidate(&key);
        self.state.bump_version(&key);
        Ok(())
    }

    fn format_delete_vector(&self, axis: &str, name: &str, for_set: bool) -> Result<()> {
        self.state.assert_write("delete_vector");
        self.require_writable()?;
        ensure!(
            self.format_has_vector(axis, name)?,
            "missing vector {} of the axis {} in the data set {}",
            name,
            axis,
            self.name()
        );
        self.vectors_of(axis)?.unlink(name)?;
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
        self.require_writable()?;
        let nrows = self.axis_len(rows_axis)?;
        let ncols = self.axis_len(columns_axis)?;
        ensure!(
            matrix.shape() == (nrows, ncols),
            "the shape ({}, {}) of the matrix {} is different from the shape ({}, {}) of the axes {} and {} in the data set {}",
            matrix.shape().0,
            matrix.shape().1,
            name,
            nrows,
            ncols,
            rows_axis,
            columns_axis,
            self.name()
        );
        let group = self.ensure_matrix_pair_group(rows_axis, columns_axis)?;
        if group.link_exists(name) {
            group.unlink(name)?;
        }
        match &matrix {
            MatrixData::Dense(dense) => {
                let values = dense.column_major_values();
                create_matrix_dataset(&group, name, nrows, ncols, &values)?;
            }
            MatrixData::Csc(sparse) => {
                let width = IndexWidth::for_capacity(nrows * ncols);
                let sparse_group = group.create_group(name)?;
                create_index_dataset(
                    &sparse_group,
                    "colptr",
                    width,
                    sparse.col_offsets().iter().map(|offset| offset + 1),
                )?;
                create_index_dataset(
                    &sparse_group,
                    "rowval",
                    width,
                    sparse.row_indices().iter().map(|row| row + 1),
                )?;
                let values = sparse.values();
                let all_true = matches!(
                    &values,
                    DynVector::Bool(flags) if flags.iter().all(|flag| *flag)
                );
                if !all_true {
                    create_dense_dataset(&sparse_group, "nzval", &values)?;
                }
            }
            MatrixData::Csr(_) => bail!(
                "storing the matrix {} of the axes {} and {} in the data set {}\nwith the columns axis contiguous",
                name,
                rows_axis,
                columns_axis,
                self.name()
            ),
        }
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
        self.require_writable()?;
        ensure!(
            self.format_has_matrix(rows_axis, columns_axis, name)?,
            "missing matrix {} of the axes {} and {} in the data set {}",
            name,
            rows_axis,
            columns_axis,
            self.name()
        );
        self.matrix_pair_group(rows_axis, columns_axis)?.unlink(name)?;
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
        self.require_writable()?;
        let length = self.axis_len(axis)?;
        let group = self.vectors_of(axis)?;
        let values = self.empty_element_buffer(&group, name, element_type, length)?;
        Ok(DenseVectorFill {
            axis: axis.to_owned(),
            name: name.to_owned(),
            values,
        })
    }

    fn format_filled_empty_dense_vector(&self, fill: DenseVectorFill) -> Result<()> {
        self.state.assert_write("filled_empty_dense_vector");
        self.require_writable()?;
        let group = self.vectors_of(&fill.axis)?;
        let key = vector_cache_key(&fill.axis, &fill.name);
        self.commit_element_buffer(&group, &fill.name, fill.values)?;
        self.state.cache().invalidate(&key);
        self.state.bump_version(&key);
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
        self.require_writable()?;
        let length = self.axis_len(axis)?;
        let group = self.vectors_of(axis)?;
        if group.link_exists(name) {
            group.unlink(name)?;
        }
        let sparse_group = group.create_group(name)?;
        let nzind = self.empty_index_buffer(&sparse_group, "nzind", index_width, nnz)?;
        let nzval = self.empty_element_buffer(&sparse_group, "nzval", element_type, nnz)?;
        Ok(SparseVectorFill {
            axis: axis.to_owned(),
            name: name.to_owned(),
            length,
            nzind,
            nzval,
        })
    }

    fn format_filled_empty_sparse_vector(&self, fill: SparseVectorFill) -> Result<()> {
        self.state.assert_write("filled_empty_sparse_vector");
        self.require_writable()?;
        let sparse_group = self
            .vectors_of(&fill.axis)?
            .group(&fill.name)?;
        let key = vector_cache_key(&fill.axis, &fill.name);
        self.commit_index_buffer(&sparse_group, "nzind", fill.nzind)?;
        self.commit_element_buffer(&sparse_group, "nzval", fill.nzval)?;
        self.state.cache().invalidate(&key);
        self.state.bump_version(&key);
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
        self.require_writable()?;
        let nrows = self.axis_len(rows_axis)?;
        let ncols = self.axis_len(columns_axis)?;
        let group = self.ensure_matrix_pair_group(rows_axis, columns_axis)?;
        if group.link_exists(name) {
            group.unlink(name)?;
        }
        let values = dispatch_numeric_type!(
            element_type,
            T => {
                let zeros = vec![<T as Element>::zero_element(); nrows * ncols];
                let view = ArrayView2::from_shape((ncols, nrows), zeros.as_slice())
                    .map_err(|error| anyhow!("{}", error))?;
                let dataset = group.new_dataset_builder().with_data(view).create(name)?;
                match mapping::map_dataset_buffer::<T>(
                    &self.file_path,
                    &self.file,
                    &dataset,
                    nrows * ncols,
                ) {
                    Ok(buffer) => <T as Element>::wrap_buffer(buffer),
                    Err(error) => {
                        log::warn!(
                            "filling {} through a heap buffer: {}",
                            dataset.name(),
                            error
                        );
                        DynBuffer::heap(element_type, nrows * ncols)
                    }
                }
            },
            DynBuffer::heap(element_type, nrows * ncols),
            DynBuffer::heap(element_type, nrows * ncols)
        );
        Ok(DenseMatrixFill {
            rows_axis: rows_axis.to_owned(),
            columns_axis: columns_axis.to_owned(),
            name: name.to_owned(),
            nrows,
            ncols,
            values,
        })
    }

    fn format_filled_empty_dense_matrix(&self, fill: DenseMatrixFill) -> Result<()> {
        self.state.assert_write("filled_empty_dense_matrix");
        self.require_writable()?;
        let group = self.matrix_pair_group(&fill.rows_axis, &fill.columns_axis)?;
        let key = matrix_cache_key(&fill.rows_axis, &fill.columns_axis, &fill.name);
        let (nrows, ncols, name) = (fill.nrows, fill.ncols, fill.name.clone());
        match fill.values.into_dense()? {
            None => {}
            Some(values) => {
                if group.link_exists(&name) {
                    write_matrix_into(&group.dataset(&name)?, nrows, ncols, &values)?;
                } else {
                    create_matrix_dataset(&group, &name, nrows, ncols, &values)?;
                }
            }
        }
        self.state.cache().invalidate(&key);
        self.state.bump_version(&key);
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
        self.require_writable()?;
        let nrows = self.axis_len(rows_axis)?;
        let ncols = self.axis_len(columns_axis)?;
        let group = self.ensure_matrix_pair_group(rows_axis, columns_axis)?;
        if group.link_exists(name) {
            group.unlink(name)?;
        }
        let sparse_group = group.create_group(name)?;
        let colptr = self.empty_index_buffer(&sparse_group, "colptr", index_width, ncols + 1)?;
        let rowval = self.empty_index_buffer(&sparse_group, "rowval", index_width, nnz)?;
        let nzval = self.empty_element_buffer(&sparse_group, "nzval", element_type, nnz)?;
        Ok(SparseMatrixFill {
            rows_axis: rows_axis.to_owned(),
            columns_axis: columns_axis.to_owned(),
            name: name.to_owned(),
            nrows,
            ncols,
            colptr,
            rowval,
            nzval,
        })
    }

    fn format_filled_empty_sparse_matrix(&self, fill: SparseMatrixFill) -> Result<()> {
        self.state.assert_write("filled_empty_sparse_matrix");
        self.require_writable()?;
        let sparse_group = self
            .matrix_pair_group(&fill.rows_axis, &fill.columns_axis)?
            .group(&fill.name)?;
        let key = matrix_cache_key(&fill.rows_axis, &fill.columns_axis, &fill.name);
        self.commit_index_buffer(&sparse_group, "colptr", fill.colptr)?;
        self.commit_index_buffer(&sparse_group, "rowval", fill.rowval)?;
        self.commit_element_buffer(&sparse_group, "nzval", fill.nzval)?;
        self.state.cache().invalidate(&key);
        self.state.bump_version(&key);
        Ok(())
    }

    fn format_relayout_matrix(
        &self,
        rows_axis: &str,
        columns_axis: &str,
        name: &str,
    ) -> Result<Arc<MatrixData>> {
        self.state.assert_write("relayout_matrix");
        self.require_writable()?;
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

/// Create the 2-D dataset of a rows-contiguous dense matrix from its
/// column-major values.
fn create_matrix_dataset(
    group: &Group,
    name: &str,
    nrows: usize,
    ncols: usize,
    values: &DynVector,
) -> Result<()> {
    with_dyn_vector_real!(
        values,
        |v| {
            let view = ArrayView2::from_shape((ncols, nrows), v.as_slice())
                .map_err(|error| anyhow!("{}", error))?;
            group.new_dataset_builder().with_data(view).create(name)?;
            Ok(())
        },
        |texts| {
            let unicode = to_unicode(texts)?;
            let view = ArrayView2::from_shape((ncols, nrows), unicode.as_slice())
                .map_err(|error| anyhow!("{}", error))?;
            group.new_dataset_builder().with_data(view).create(name)?;
            Ok(())
        }
    )
}

fn write_matrix_into(
    dataset: &Dataset,
    nrows: usize,
    ncols: usize,
    values: &DynVector,
) -> Result<()> {
    with_dyn_vector_real!(
        values,
        |v| {
            let view = ArrayView2::from_shape((ncols, nrows), v.as_slice())
                .map_err(|error| anyhow!("{}", error))?;
            dataset.write(view)?;
            Ok(())
        },
        |texts| {
            let unicode = to_unicode(texts)?;
            let view = ArrayView2::from_shape((ncols, nrows), unicode.as_slice())
                .map_err(|error| anyhow!("{}", error))?;
            dataset.write(view)?;
            Ok(())
        }
    )
}
