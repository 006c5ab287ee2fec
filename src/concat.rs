//! The concatenation engine: merge the data of several sources along one or
//! more axes into a destination writer, choosing sparse or dense targets by
//! the storage-fraction estimate, substituting per-property empty values for
//! missing data, and carrying non-concatenation properties per a merge
//! specification.

use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Result};
use indexmap::IndexSet;
use itertools::Itertools;
use rayon::prelude::*;

use crate::copies::{copy_matrix, copy_scalar, copy_vector};
use crate::data::{
    cast_scalar, dispatch_real_type, dispatch_scalar_type, merged_dtype, DynCsc, DynDense,
    DynVector, Element, IndexWidth, MatrixData, ScalarType, ScalarValue, VectorData,
};
use crate::format::{FormatReader, FormatWriter};
use crate::layout::{densify, relayout, sparsify, transposer};
use crate::readers::DafReader;
use crate::writers::DafWriter;

/// What to do with a property that lives outside the concatenation axes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeAction {
    /// Leave it out of the destination.
    Skip,
    /// Copy the last source's value as-is.
    LastValue,
    /// Stack the per-source values along the dataset axis.
    CollectAxis,
}

/// A property key, also usable as a pattern: any `"*"` component matches
/// anything.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyKey {
    Scalar(String),
    Vector(String, String),
    Matrix(String, String, String),
}

impl PropertyKey {
    fn component_matches(pattern: &str, component: &str) -> bool {
        pattern == "*" || pattern == component
    }

    /// Whether this key, read as a pattern, matches a concrete key.
    pub fn matches(&self, key: &PropertyKey) -> bool {
        match (self, key) {
            (PropertyKey::Scalar(pattern), PropertyKey::Scalar(name)) => {
                PropertyKey::component_matches(pattern, name)
            }
            (PropertyKey::Vector(pattern_axis, pattern_name), PropertyKey::Vector(axis, name)) => {
                PropertyKey::component_matches(pattern_axis, axis)
                    && PropertyKey::component_matches(pattern_name, name)
            }
            (
                PropertyKey::Matrix(pattern_rows, pattern_columns, pattern_name),
                PropertyKey::Matrix(rows_axis, columns_axis, name),
            ) => {
                PropertyKey::component_matches(pattern_rows, rows_axis)
                    && PropertyKey::component_matches(pattern_columns, columns_axis)
                    && PropertyKey::component_matches(pattern_name, name)
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyKey::Scalar(name) => write!(f, ": {}", name),
            PropertyKey::Vector(axis, name) => write!(f, "/ {} : {}", axis, name),
            PropertyKey::Matrix(rows_axis, columns_axis, name) => {
                write!(f, "/ {} / {} : {}", rows_axis, columns_axis, name)
            }
        }
    }
}

/// Whether concatenated axis entries are renamed to `<source>.<entry>`,
/// globally or per concatenation axis.
#[derive(Clone, Debug)]
pub enum Prefix {
    All(bool),
    PerAxis(Vec<bool>),
}

impl Prefix {
    fn for_axis(&self, index: usize) -> bool {
        match self {
            Prefix::All(prefix) => *prefix,
            Prefix::PerAxis(flags) => flags.get(index).copied().unwrap_or(false),
        }
    }
}

/// The tuning knobs of [`concatenate`].
#[derive(Clone, Debug)]
pub struct ConcatOptions {
    /// Unique per-source names; the sources' own names by default.
    pub names: Option<Vec<String>>,
    /// The auxiliary axis naming the participating sources.
    pub dataset_axis: Option<String>,
    /// Whether to also write, for each concatenated axis, a vector assigning
    /// each entry the name of its originating source.
    pub dataset_property: bool,
    pub prefix: Prefix,
    /// Per-concatenation-axis explicit sets of vector names whose (string)
    /// values are prefixed; when absent, vectors named after a prefixed axis
    /// (or `<axis>.…`) are prefixed.
    pub prefixed: Option<Vec<IndexSet<String>>>,
    /// Fill values for properties missing from some source; last matching
    /// key wins.
    pub empty: Vec<(PropertyKey, ScalarValue)>,
    pub sparse_if_saves_storage_fraction: f64,
    /// Ordered merge rules for non-concatenation properties; last matching
    /// rule wins, the default action is `Skip`.
    pub merge: Vec<(PropertyKey, MergeAction)>,
    pub overwrite: bool,
}

impl Default for ConcatOptions {
    fn default() -> ConcatOptions {
        ConcatOptions {
            names: None,
            dataset_axis: Some("dataset".to_owned()),
            dataset_property: true,
            prefix: Prefix::All(false),
            prefixed: None,
            empty: Vec::new(),
            sparse_if_saves_storage_fraction: 0.25,
            merge: Vec::new(),
            overwrite: false,
        }
    }
}

fn resolve_action(merge: &[(PropertyKey, MergeAction)], key: &PropertyKey) -> MergeAction {
    merge
        .iter()
        .rev()
        .find(|(pattern, _)| pattern.matches(key))
        .map(|(_, action)| *action)
        .unwrap_or(MergeAction::Skip)
}

fn lookup_empty<'a>(
    empty: &'a [(PropertyKey, ScalarValue)],
    key: &PropertyKey,
) -> Option<&'a ScalarValue> {
    empty
        .iter()
        .rev()
        .find(|(pattern, _)| pattern.matches(key))
        .map(|(_, value)| value)
}

/// Split a buffer into per-source chunks of the given sizes.
fn split_chunks<'a, T>(mut buffer: &'a mut [T], sizes: &[usize]) -> Vec<&'a mut [T]> {
    let mut chunks = Vec::with_capacity(sizes.len());
    for size in sizes {
        let (head, tail) = buffer.split_at_mut(*size);
        chunks.push(head);
        buffer = tail;
    }
    chunks
}

/// Holds the write lock on the destination and read locks on every source,
/// in order; released in reverse.
struct ConcatScope<'a, W: FormatWriter + ?Sized> {
    destination: &'a W,
    sources: &'a [Arc<dyn FormatReader>],
}

impl<'a, W: FormatWriter + ?Sized> ConcatScope<'a, W> {
    fn enter(destination: &'a W, sources: &'a [Arc<dyn FormatReader>]) -> ConcatScope<'a, W> {
        destination.begin_data_write();
        for source in sources {
            source.begin_data_read();
        }
        ConcatScope {
            destination,
            sources,
        }
    }
}

impl<W: FormatWriter + ?Sized> Drop for ConcatScope<'_, W> {
    fn drop(&mut self) {
        for source in self.sources.iter().rev() {
            source.end_data_read();
        }
        self.destination.end_data_write();
    }
}

/// The layout of one concatenated axis: per-source sizes, running offsets
/// and the total length.
struct AxisLayout {
    axis: String,
    prefixed: bool,
    sizes: Vec<usize>,
    offsets: Vec<usize>,
    total: usize,
}

/// Concatenate the `sources` along the given axes into `destination`.
///
/// Partial writes are left in place on failure; callers needing atomicity
/// should concatenate into a fresh or truncated destination.
pub fn concatenate<W: FormatWriter + ?Sized>(
    destination: &W,
    axes: &[&str],
    sources: &[Arc<dyn FormatReader>],
    options: ConcatOptions,
) -> Result<()> {
    ensure!(!sources.is_empty(), "concatenating no sources");
    ensure!(!axes.is_empty(), "concatenating along no axes");

    let _scope = ConcatScope::enter(destination, sources);

    let names = source_names(sources, &options)?;
    if let Some(prefixed) = &options.prefixed {
        ensure!(
            prefixed.len() == axes.len(),
            "got {} prefixed property sets for {} concatenated axes",
            prefixed.len(),
            axes.len()
        );
    }

    let concat_axes: IndexSet<&str> = axes.iter().copied().collect();
    check_preconditions(destination, axes, &concat_axes, sources, &options)?;

    // Create the concatenated axes.
    let mut layouts = Vec::with_capacity(axes.len());
    for (index, axis) in axes.iter().enumerate() {
        let prefixed = options.prefix.for_axis(index);
        let layout = create_concatenated_axis(destination, axis, prefixed, sources, &names)?;
        layouts.push(layout);
    }

    // The dataset axis and per-axis dataset properties.
    if let Some(dataset_axis) = &options.dataset_axis {
        destination.add_axis(dataset_axis, names.clone())?;
        if options.dataset_property {
            for layout in &layouts {
                let mut values = Vec::with_capacity(layout.total);
                for (size, name) in layout.sizes.iter().zip(&names) {
                    values.extend(std::iter::repeat(name.clone()).take(*size));
                }
                destination.set_vector(
                    &layout.axis,
                    dataset_axis,
                    VectorData::Dense(DynVector::Str(values)),
                    options.overwrite,
                )?;
            }
        }
    }

    // Every other axis is shared by the sources and carried over.
    let other_axes = copy_other_axes(destination, &concat_axes, sources)?;

    // Vector and matrix properties on the concatenated axes.
    for (index, layout) in layouts.iter().enumerate() {
        let mut vector_names = IndexSet::new();
        for source in sources {
            vector_names.extend(source.vectors_set(&layout.axis)?);
        }
        for name in vector_names.iter().sorted() {
            let prefix_values = prefix_this_vector(&options, index, &layouts, name);
            concatenate_vector(destination, layout, name, sources, &names, prefix_values, &options)?;
        }

        for other in other_axes.iter().sorted() {
            let mut column_names = IndexSet::new();
            let mut row_names = IndexSet::new();
            for source in sources {
                if source.has_axis(other)? {
                    column_names.extend(source.matrices_set(other, &layout.axis)?);
                    row_names.extend(source.matrices_set(&layout.axis, other)?);
                }
            }
            for name in column_names.iter().sorted() {
                concatenate_matrix_columns(destination, other, layout, name, sources, &options)?;
            }
            for name in row_names.iter().sorted() {
                concatenate_matrix_rows(destination, layout, other, name, sources, &options)?;
            }
        }
    }

    merge_properties(destination, &other_axes, sources, &options)
}

fn source_names(
    sources: &[Arc<dyn FormatReader>],
    options: &ConcatOptions,
) -> Result<Vec<String>> {
    let names: Vec<String> = match &options.names {
        Some(names) => {
            ensure!(
                names.len() == sources.len(),
                "got {} names for {} concatenated sources",
                names.len(),
                sources.len()
            );
            names.clone()
        }
        None => sources
            .iter()
            .map(|source| source.name().to_owned())
            .collect(),
    };
    let mut seen = IndexSet::new();
    for name in &names {
        ensure!(
            seen.insert(name.as_str()),
            "duplicate name {} of the concatenated sources",
            name
        );
    }
    Ok(names)
}

fn check_preconditions<W: FormatWriter + ?Sized>(
    destination: &W,
    axes: &[&str],
    concat_axes: &IndexSet<&str>,
    sources: &[Arc<dyn FormatReader>],
    options: &ConcatOptions,
) -> Result<()> {
    for axis in axes {
        ensure!(
            !destination.has_axis(axis)?,
            "the concatenated axis {}\nalready exists in the data set {}",
            axis,
            destination.name()
        );
        for source in sources {
            ensure!(
                source.has_axis(axis)?,
                "missing the concatenated axis {}\nin the data set {}",
                axis,
                source.name()
            );
        }
    }

    if let Some(dataset_axis) = &options.dataset_axis {
        ensure!(
            !concat_axes.contains(dataset_axis.as_str()),
            "the dataset axis {}\nis also a concatenated axis",
            dataset_axis
        );
        ensure!(
            !destination.has_axis(dataset_axis)?,
            "the dataset axis {}\nalready exists in the data set {}",
            dataset_axis,
            destination.name()
        );
        for source in sources {
            ensure!(
                !source.has_axis(dataset_axis)?,
                "the dataset axis {}\nalready exists in the data set {}",
                dataset_axis,
                source.name()
            );
        }
    }

    // Matrices spanning two concatenated axes (the square case included)
    // would need to be spliced, not concatenated.
    for source in sources {
        let source_axes = source.axes_set()?;
        for rows_axis in &source_axes {
            if !concat_axes.contains(rows_axis.as_str()) {
                continue;
            }
            for columns_axis in &source_axes {
                if !concat_axes.contains(columns_axis.as_str()) {
                    continue;
                }
                let matrices = source.matrices_set(rows_axis, columns_axis)?;
                ensure!(
                    matrices.is_empty(),
                    "the matrices: {}\nwith both axes {} and {} concatenated\nin the data set {}",
                    matrices.iter().sorted().join(", "),
                    rows_axis,
                    columns_axis,
                    source.name()
                );
            }
        }
    }
    Ok(())
}

fn create_concatenated_axis<W: FormatWriter + ?Sized>(
    destination: &W,
    axis: &str,
    prefixed: bool,
    sources: &[Arc<dyn FormatReader>],
    names: &[String],
) -> Result<AxisLayout> {
    let mut sizes = Vec::with_capacity(sources.len());
    let mut offsets = Vec::with_capacity(sources.len());
    let mut total = 0usize;
    let mut entries: Vec<String> = Vec::new();
    for (source, name) in sources.iter().zip(names) {
        let source_entries = source.axis_entries(axis)?;
        offsets.push(total);
        sizes.push(source_entries.len());
        total += source_entries.len();
        if prefixed {
            entries.extend(
                source_entries
                    .iter()
                    .map(|entry| format!("{}.{}", name, entry)),
            );
        } else {
            entries.extend(source_entries.iter().cloned());
        }
    }
    destination.add_axis(axis, entries)?;
    Ok(AxisLayout {
        axis: axis.to_owned(),
        prefixed,
        sizes,
        offsets,
        total,
    })
}

fn copy_other_axes<W: FormatWriter + ?Sized>(
    destination: &W,
    concat_axes: &IndexSet<&str>,
    sources: &[Arc<dyn FormatReader>],
) -> Result<IndexSet<String>> {
    let mut other_axes = IndexSet::new();
    for source in sources {
        for axis in source.axes_set()? {
            if !concat_axes.contains(axis.as_str()) {
                other_axes.insert(axis);
            }
        }
    }
    for axis in other_axes.iter().sorted() {
        let mut reference: Option<(&Arc<dyn FormatReader>, Arc<Vec<String>>)> = None;
        for source in sources {
            if !source.has_axis(axis)? {
                continue;
            }
            let entries = source.axis_entries(axis)?;
            match &reference {
                None => reference = Some((source, entries)),
                Some((first, first_entries)) => ensure!(
                    *first_entries == entries,
                    "different entries of the axis {}\nbetween the data set {}\nand the data set {}",
                    axis,
                    first.name(),
                    source.name()
                ),
            }
        }
        let (_, entries) = reference.expect("axes in the union come from some source");
        if destination.has_axis(axis)? {
            let existing = destination.axis_entries(axis)?;
            ensure!(
                existing == entries,
                "different entries of the axis {}\nbetween the concatenated sources\nand the data set {}",
                axis,
                destination.name()
            );
        } else {
            destination.add_axis(axis, Vec::clone(&entries))?;
        }
    }
    Ok(other_axes)
}

fn prefix_this_vector(
    options: &ConcatOptions,
    axis_index: usize,
    layouts: &[AxisLayout],
    name: &str,
) -> bool {
    if let Some(prefixed) = &options.prefixed {
        return prefixed[axis_index].contains(name);
    }
    layouts.iter().any(|layout| {
        layout.prefixed
            && (name == layout.axis || name.starts_with(&format!("{}.", layout.axis)))
    })
}

fn missing_property_error(
    kind: &str,
    key: &PropertyKey,
    source_name: &str,
    destination_name: &str,
) -> anyhow::Error {
    anyhow!(
        "missing the {} {}\nin the data set {}\nconcatenated into the data set {}\nwith no empty value",
        kind,
        key,
        source_name,
        destination_name
    )
}

fn sparse_saves(dense_bytes: usize, sparse_bytes: usize) -> f64 {
    if dense_bytes == 0 {
        return 0.0;
    }
    (dense_bytes as f64 - sparse_bytes as f64) / dense_bytes as f64
}

fn concatenate_vector<W: FormatWriter + ?Sized>(
    destination: &W,
    layout: &AxisLayout,
    name: &str,
    sources: &[Arc<dyn FormatReader>],
    names: &[String],
    prefix_values: bool,
    options: &ConcatOptions,
) -> Result<()> {
    let axis = layout.axis.as_str();
    let key = PropertyKey::Vector(axis.to_owned(), name.to_owned());
    let present: Vec<Option<Arc<VectorData>>> = sources
        .iter()
        .map(|source| {
            if source.has_vector(axis, name)? {
                Ok(Some(source.get_vector(axis, name)?))
            } else {
                Ok(None)
            }
        })
        .collect::<Result<_>>()?;
    let empty_value = lookup_empty(&options.empty, &key);
    for (index, slot) in present.iter().enumerate() {
        if slot.is_none() && empty_value.is_none() {
            return Err(missing_property_error(
                "vector",
                &key,
                sources[index].name(),
                destination.name(),
            ));
        }
    }

    let dtype = merged_dtype(
        empty_value.map(|value| value.scalar_type()),
        present.iter().flatten().map(|vector| vector.scalar_type()),
    )?;

    if dtype == ScalarType::Str {
        return concatenate_string_vector(
            destination,
            layout,
            name,
            &present,
            names,
            prefix_values,
            empty_value,
            options,
        );
    }
    ensure!(
        !prefix_values,
        "prefixing the non-string vector {}\nof the axis {}\nconcatenated into the data set {}",
        name,
        axis,
        destination.name()
    );

    let index_width = IndexWidth::for_capacity(layout.total);
    let estimated_nnz: usize = present
        .iter()
        .enumerate()
        .map(|(index, slot)| match slot {
            Some(vector) => {
                if vector.is_sparse() {
                    vector.stored_entries()
                } else {
                    layout.sizes[index]
                }
            }
            None => {
                if empty_value.map_or(true, |value| value.is_zero()) {
                    0
                } else {
                    layout.sizes[index]
                }
            }
        })
        .sum();
    let dense_bytes = layout.total * dtype.size_of();
    let sparse_bytes = estimated_nnz * (dtype.size_of() + index_width.size_of());

    if sparse_saves(dense_bytes, sparse_bytes) >= options.sparse_if_saves_storage_fraction {
        if let Some(value) = empty_value {
            ensure!(
                value.is_zero(),
                "non-zero empty value {}\nfor the sparse concatenated vector {}\nof the axis {}\nin the data set {}",
                value,
                name,
                axis,
                destination.name()
            );
        }
        let slices: Vec<(Vec<usize>, DynVector)> = present
            .par_iter()
            .map(|slot| match slot {
                Some(vector) => vector.to_sparse_cast(dtype),
                None => Ok((Vec::new(), DynVector::zeros(dtype, 0))),
            })
            .collect::<Result<_>>()?;
        let nnz_total: usize = slices.iter().map(|(indices, _)| indices.len()).sum();
        let mut fill = destination.get_empty_sparse_vector(
            axis,
            name,
            dtype,
            nnz_total,
            index_width,
            options.overwrite,
        )?;
        let mut nnz_offset = 0usize;
        for (index, (indices, _)) in slices.iter().enumerate() {
            fill.nzind.write_indices(
                nnz_offset,
                indices.iter().map(|position| position + layout.offsets[index] + 1),
            )?;
            nnz_offset += indices.len();
        }
        dispatch_real_type!(dtype, T => {
            let buffer = <T as Element>::buffer_mut(&mut fill.nzval)
                .ok_or_else(|| anyhow!("mismatched fill buffer type"))?;
            let lens: Vec<usize> = slices.iter().map(|(indices, _)| indices.len()).collect();
            let chunks = split_chunks(buffer, &lens);
            chunks
                .into_par_iter()
                .enumerate()
                .for_each(|(index, chunk)| {
                    let values = <T as Element>::slice_of(&slices[index].1).unwrap();
                    chunk.clone_from_slice(values);
                });
        }, unreachable!("string vectors never take the sparse path"));
        destination.filled_empty_sparse_vector(fill)?;
    } else {
        let mut fill =
            destination.get_empty_dense_vector(axis, name, dtype, options.overwrite)?;
        dispatch_scalar_type!(dtype, T => {
            let buffer = <T as Element>::buffer_mut(&mut fill.values)
                .ok_or_else(|| anyhow!("mismatched fill buffer type"))?;
            let chunks = split_chunks(buffer, &layout.sizes);
            chunks
                .into_par_iter()
                .enumerate()
                .try_for_each(|(index, chunk)| -> Result<()> {
                    match &present[index] {
                        Some(vector) => {
                            let dense = vector.to_dense_cast(dtype)?;
                            let values = <T as Element>::slice_of(&dense).unwrap();
                            chunk.clone_from_slice(values);
                        }
                        None => {
                            let value = cast_scalar(empty_value.unwrap(), dtype)?;
                            let typed = <T as Element>::from_scalar(&value).unwrap();
                            for slot in chunk.iter_mut() {
                                *slot = typed.clone();
                            }
                        }
                    }
                    Ok(())
                })?;
        });
        destination.filled_empty_dense_vector(fill)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn concatenate_string_vector<W: FormatWriter + ?Sized>(
    destination: &W,
    layout: &AxisLayout,
    name: &str,
    present: &[Option<Arc<VectorData>>],
    names: &[String],
    prefix_values: bool,
    empty_value: Option<&ScalarValue>,
    options: &ConcatOptions,
) -> Result<()> {
    let mut fill = destination.get_empty_dense_vector(
        &layout.axis,
        name,
        ScalarType::Str,
        options.overwrite,
    )?;
    {
        let buffer = <String as Element>::buffer_mut(&mut fill.values)
            .ok_or_else(|| anyhow!("mismatched fill buffer type"))?;
        let chunks = split_chunks(buffer, &layout.sizes);
        chunks
            .into_par_iter()
            .enumerate()
            .try_for_each(|(index, chunk)| -> Result<()> {
                match &present[index] {
                    Some(vector) => {
                        let dense = vector.to_dense_cast(ScalarType::Str)?;
                        let values = <String as Element>::slice_of(&dense).unwrap();
                        for (slot, value) in chunk.iter_mut().zip(values) {
                            *slot = if prefix_values {
                                format!("{}.{}", names[index], value)
                            } else {
                                value.clone()
                            };
                        }
                    }
                    None => {
                        let value = cast_scalar(empty_value.unwrap(), ScalarType::Str)?;
                        let text = match value {
                            ScalarValue::Str(text) => text,
                            _ => unreachable!("a value converted to Str is Str"),
                        };
                        for slot in chunk.iter_mut() {
                            *slot = text.clone();
                        }
                    }
                }
                Ok(())
            })?;
    }
    destination.filled_empty_dense_vector(fill)
}

/// Compressed-columns parts of a matrix, converted to `to`.
fn csc_parts_cast(
    matrix: &MatrixData,
    to: ScalarType,
) -> Result<(Vec<usize>, Vec<usize>, DynVector)> {
    let sparse = sparsify(matrix, Some(to))?;
    let sparse = match sparse {
        MatrixData::Csr(_) => relayout(&sparse)?,
        other => other,
    };
    match sparse {
        MatrixData::Csc(csc) => Ok((
            csc.col_offsets().to_vec(),
            csc.row_indices().to_vec(),
            csc.values(),
        )),
        _ => unreachable!("sparsify produces a compressed form"),
    }
}

/// Column-major element values of a matrix, converted to `to`.
fn column_major_values_cast(matrix: &MatrixData, to: ScalarType) -> Result<DynVector> {
    match densify(matrix, Some(to))? {
        MatrixData::Dense(dense) => Ok(dense.column_major_values()),
        _ => unreachable!("densify produces a dense form"),
    }
}

/// Concatenate the matrices stored under `(rows_axis, layout.axis, name)`:
/// the concatenated axis is the columns axis, so each source contributes a
/// contiguous block of columns.
fn concatenate_matrix_columns<W: FormatWriter + ?Sized>(
    destination: &W,
    rows_axis: &str,
    layout: &AxisLayout,
    name: &str,
    sources: &[Arc<dyn FormatReader>],
    options: &ConcatOptions,
) -> Result<()> {
    let axis = layout.axis.as_str();
    let key = PropertyKey::Matrix(rows_axis.to_owned(), axis.to_owned(), name.to_owned());
    let present: Vec<Option<Arc<MatrixData>>> = sources
        .iter()
        .map(|source| {
            if source.has_axis(rows_axis)? && source.has_matrix(rows_axis, axis, name)? {
                Ok(Some(source.get_matrix(rows_axis, axis, name)?))
            } else {
                Ok(None)
            }
        })
        .collect::<Result<_>>()?;
    let nrows = destination.axis_length(rows_axis)?;
    let empty_value = lookup_empty(&options.empty, &key);
    for (index, slot) in present.iter().enumerate() {
        if slot.is_none() && empty_value.is_none() {
            return Err(missing_property_error(
                "matrix",
                &key,
                sources[index].name(),
                destination.name(),
            ));
        }
    }
    let dtype = merged_dtype(
        empty_value.map(|value| value.scalar_type()),
        present.iter().flatten().map(|matrix| matrix.scalar_type()),
    )?;

    let index_width = IndexWidth::for_capacity(nrows * layout.total);
    let estimated_nnz: usize = present
        .iter()
        .enumerate()
        .map(|(index, slot)| match slot {
            Some(matrix) => matrix.stored_entries(),
            None => {
                if empty_value.map_or(true, |value| value.is_zero()) {
                    0
                } else {
                    nrows * layout.sizes[index]
                }
            }
        })
        .sum();
    let dense_bytes = nrows * layout.total * dtype.size_of();
    let sparse_bytes = estimated_nnz * (dtype.size_of() + index_width.size_of())
        + (layout.total + 1) * index_width.size_of();

    let go_sparse = dtype.is_real()
        && sparse_saves(dense_bytes, sparse_bytes) >= options.sparse_if_saves_storage_fraction;

    if go_sparse {
        if let Some(value) = empty_value {
            ensure!(
                value.is_zero(),
                "non-zero empty value {}\nfor the sparse concatenated matrix {}\nof the axes {} and {}\nin the data set {}",
                value,
                name,
                rows_axis,
                axis,
                destination.name()
            );
        }
        let blocks: Vec<(Vec<usize>, Vec<usize>, DynVector)> = present
            .par_iter()
            .enumerate()
            .map(|(index, slot)| match slot {
                Some(matrix) => csc_parts_cast(matrix, dtype),
                None => Ok((
                    vec![0; layout.sizes[index] + 1],
                    Vec::new(),
                    DynVector::zeros(dtype, 0),
                )),
            })
            .collect::<Result<_>>()?;
        let nnz_total: usize = blocks.iter().map(|(_, rows, _)| rows.len()).sum();
        let mut fill = destination.get_empty_sparse_matrix(
            rows_axis,
            axis,
            name,
            dtype,
            nnz_total,
            index_width,
            options.overwrite,
        )?;
        // The leading column pointer is assigned, not assumed.
        fill.colptr.write_indices(0, std::iter::once(1))?;
        let mut nnz_offset = 0usize;
        for (index, (offsets, rows, _)) in blocks.iter().enumerate() {
            fill.colptr.write_indices(
                layout.offsets[index] + 1,
                offsets[1..].iter().map(|offset| offset + nnz_offset + 1),
            )?;
            fill.rowval
                .write_indices(nnz_offset, rows.iter().map(|row| row + 1))?;
            nnz_offset += rows.len();
        }
        fill.colptr
            .write_indices(layout.total, std::iter::once(nnz_total + 1))?;
        dispatch_real_type!(dtype, T => {
            let buffer = <T as Element>::buffer_mut(&mut fill.nzval)
                .ok_or_else(|| anyhow!("mismatched fill buffer type"))?;
            let lens: Vec<usize> = blocks.iter().map(|(_, rows, _)| rows.len()).collect();
            let chunks = split_chunks(buffer, &lens);
            chunks
                .into_par_iter()
                .enumerate()
                .for_each(|(index, chunk)| {
                    let values = <T as Element>::slice_of(&blocks[index].2).unwrap();
                    chunk.clone_from_slice(values);
                });
        }, unreachable!("string matrices never take the sparse path"));
        destination.filled_empty_sparse_matrix(fill)?;
    } else {
        let mut fill = destination.get_empty_dense_matrix(
            rows_axis,
            axis,
            name,
            dtype,
            options.overwrite,
        )?;
        dispatch_scalar_type!(dtype, T => {
            let buffer = <T as Element>::buffer_mut(&mut fill.values)
                .ok_or_else(|| anyhow!("mismatched fill buffer type"))?;
            let block_lens: Vec<usize> =
                layout.sizes.iter().map(|size| nrows * size).collect();
            let chunks = split_chunks(buffer, &block_lens);
            chunks
                .into_par_iter()
                .enumerate()
                .try_for_each(|(index, chunk)| -> Result<()> {
                    match &present[index] {
                        Some(matrix) => {
                            let values = column_major_values_cast(matrix, dtype)?;
                            let typed = <T as Element>::slice_of(&values).unwrap();
                            chunk.clone_from_slice(typed);
                        }
                        None => {
                            let value = cast_scalar(empty_value.unwrap(), dtype)?;
                            let typed = <T as Element>::from_scalar(&value).unwrap();
                            for slot in chunk.iter_mut() {
                                *slot = typed.clone();
                            }
                        }
                    }
                    Ok(())
                })?;
        });
        destination.filled_empty_dense_matrix(fill)?;
    }
    Ok(())
}

/// Concatenate the matrices stored under `(layout.axis, columns_axis,
/// name)`: the concatenated axis is the rows axis. Each source block is
/// transposed to columns orientation, assembled, and transposed back.
fn concatenate_matrix_rows<W: FormatWriter + ?Sized>(
    destination: &W,
    layout: &AxisLayout,
    columns_axis: &str,
    name: &str,
    sources: &[Arc<dyn FormatReader>],
    options: &ConcatOptions,
) -> Result<()> {
    let axis = layout.axis.as_str();
    let key = PropertyKey::Matrix(axis.to_owned(), columns_axis.to_owned(), name.to_owned());
    let present: Vec<Option<Arc<MatrixData>>> = sources
        .iter()
        .map(|source| {
            if source.has_axis(columns_axis)? && source.has_matrix(axis, columns_axis, name)? {
                Ok(Some(source.get_matrix(axis, columns_axis, name)?))
            } else {
                Ok(None)
            }
        })
        .collect::<Result<_>>()?;
    let shared_columns = destination.axis_length(columns_axis)?;
    let empty_value = lookup_empty(&options.empty, &key);
    for (index, slot) in present.iter().enumerate() {
        if slot.is_none() && empty_value.is_none() {
            return Err(missing_property_error(
                "matrix",
                &key,
                sources[index].name(),
                destination.name(),
            ));
        }
    }
    let dtype = merged_dtype(
        empty_value.map(|value| value.scalar_type()),
        present.iter().flatten().map(|matrix| matrix.scalar_type()),
    )?;

    let index_width = IndexWidth::for_capacity(layout.total * shared_columns);
    let estimated_nnz: usize = present
        .iter()
        .enumerate()
        .map(|(index, slot)| match slot {
            Some(matrix) => matrix.stored_entries(),
            None => {
                if empty_value.map_or(true, |value| value.is_zero()) {
                    0
                } else {
                    shared_columns * layout.sizes[index]
                }
            }
        })
        .sum();
    let dense_bytes = layout.total * shared_columns * dtype.size_of();
    let sparse_bytes = estimated_nnz * (dtype.size_of() + index_width.size_of())
        + (shared_columns + 1) * index_width.size_of();
    let go_sparse = dtype.is_real()
        && sparse_saves(dense_bytes, sparse_bytes) >= options.sparse_if_saves_storage_fraction;
    if go_sparse {
        if let Some(value) = empty_value {
            ensure!(
                value.is_zero(),
                "non-zero empty value {}\nfor the sparse concatenated matrix {}\nof the axes {} and {}\nin the data set {}",
                value,
                name,
                axis,
                columns_axis,
                destination.name()
            );
        }
    }

    // Transpose each block so that the concatenated axis becomes columns.
    let blocks: Vec<MatrixData> = present
        .par_iter()
        .enumerate()
        .map(|(index, slot)| match slot {
            Some(matrix) => transposer(matrix),
            None => {
                let value = cast_scalar(empty_value.unwrap(), dtype)?;
                let values =
                    DynVector::filled(&value, shared_columns * layout.sizes[index]);
                Ok(MatrixData::Dense(DynDense::from_column_major(
                    shared_columns,
                    layout.sizes[index],
                    values,
                )?))
            }
        })
        .collect::<Result<_>>()?;
    let assembled = assemble_columns(&blocks, shared_columns, dtype, go_sparse)?;
    let flipped = transposer(&assembled)?;
    destination.set_matrix(axis, columns_axis, name, flipped, options.overwrite)
}

/// Assemble column-oriented blocks of equal row count into one matrix.
fn assemble_columns(
    blocks: &[MatrixData],
    nrows: usize,
    dtype: ScalarType,
    sparse: bool,
) -> Result<MatrixData> {
    let total: usize = blocks.iter().map(|block| block.shape().1).sum();
    if sparse {
        let parts: Vec<(Vec<usize>, Vec<usize>, DynVector)> = blocks
            .par_iter()
            .map(|block| csc_parts_cast(block, dtype))
            .collect::<Result<_>>()?;
        let nnz: usize = parts.iter().map(|(_, rows, _)| rows.len()).sum();
        let mut col_offsets = Vec::with_capacity(total + 1);
        col_offsets.push(0usize);
        let mut row_indices = Vec::with_capacity(nnz);
        let mut nnz_offset = 0usize;
        for (offsets, rows, _) in &parts {
            for offset in &offsets[1..] {
                col_offsets.push(offset + nnz_offset);
            }
            row_indices.extend_from_slice(rows);
            nnz_offset += rows.len();
        }
        let values = dispatch_real_type!(dtype, T => {
            let mut merged: Vec<T> = Vec::with_capacity(nnz);
            for (_, _, part_values) in &parts {
                merged.extend_from_slice(<T as Element>::slice_of(part_values).unwrap());
            }
            <T as Element>::dyn_from_vec(merged)
        }, bail!("compressed matrices of strings are not expressible in memory"));
        Ok(MatrixData::Csc(DynCsc::from_parts(
            nrows,
            total,
            col_offsets,
            row_indices,
            values,
        )?))
    } else {
        let values = dispatch_scalar_type!(dtype, T => {
            let mut merged: Vec<T> = Vec::with_capacity(nrows * total);
            for block in blocks {
                let block_values = column_major_values_cast(block, dtype)?;
                merged.extend_from_slice(<T as Element>::slice_of(&block_values).unwrap());
            }
            <T as Element>::dyn_from_vec(merged)
        });
        Ok(MatrixData::Dense(DynDense::from_column_major(
            nrows, total, values,
        )?))
    }
}

/// Apply the merge rules to every property outside the concatenated axes.
fn merge_properties<W: FormatWriter + ?Sized>(
    destination: &W,
    other_axes: &IndexSet<String>,
    sources: &[Arc<dyn FormatReader>],
    options: &ConcatOptions,
) -> Result<()> {
    let mut scalar_names = IndexSet::new();
    for source in sources {
        scalar_names.extend(source.scalars_set()?);
    }
    for name in scalar_names.iter().sorted() {
        let key = PropertyKey::Scalar(name.clone());
        match resolve_action(&options.merge, &key) {
            MergeAction::Skip => {}
            MergeAction::LastValue => {
                if let Some(source) = last_source_with(sources, |source| source.has_scalar(name))? {
                    copy_scalar(source.as_ref(), destination, name, None, options.overwrite)?;
                }
            }
            MergeAction::CollectAxis => {
                collect_scalar(destination, name, &key, sources, options)?;
            }
        }
    }

    for axis in other_axes.iter().sorted() {
        let mut vector_names = IndexSet::new();
        for source in sources {
            if source.has_axis(axis)? {
                vector_names.extend(source.vectors_set(axis)?);
            }
        }
        for name in vector_names.iter().sorted() {
            let key = PropertyKey::Vector(axis.clone(), name.clone());
            match resolve_action(&options.merge, &key) {
                MergeAction::Skip => {}
                MergeAction::LastValue => {
                    if let Some(source) = last_source_with(sources, |source| {
                        Ok(source.has_axis(axis)? && source.has_vector(axis, name)?)
                    })? {
                        copy_vector(source.as_ref(), destination, axis, name, None, options.overwrite)?;
                    }
                }
                MergeAction::CollectAxis => {
                    collect_vector(destination, axis, name, &key, sources, options)?;
                }
            }
        }
    }

    // Applied separately per matrix layout; the flipped copy is its own key.
    for rows_axis in other_axes.iter().sorted() {
        for columns_axis in other_axes.iter().sorted() {
            let mut matrix_names = IndexSet::new();
            for source in sources {
                if source.has_axis(rows_axis)? && source.has_axis(columns_axis)? {
                    matrix_names.extend(source.matrices_set(rows_axis, columns_axis)?);
                }
            }
            for name in matrix_names.iter().sorted() {
                let key =
                    PropertyKey::Matrix(rows_axis.clone(), columns_axis.clone(), name.clone());
                match resolve_action(&options.merge, &key) {
                    MergeAction::Skip => {}
                    MergeAction::LastValue => {
                        if let Some(source) = last_source_with(sources, |source| {
                            Ok(source.has_axis(rows_axis)?
                                && source.has_axis(columns_axis)?
                                && source.has_matrix(rows_axis, columns_axis, name)?)
                        })? {
                            copy_matrix(
                                source.as_ref(),
                                destination,
                                rows_axis,
                                columns_axis,
                                name,
                                None,
                                options.overwrite,
                            )?;
                        }
                    }
                    MergeAction::CollectAxis => bail!(
                        "collecting the matrix {}\nof the axes {} and {}\nwould require storing a third dimension",
                        name,
                        rows_axis,
                        columns_axis
                    ),
                }
            }
        }
    }

    Ok(())
}

fn last_source_with(
    sources: &[Arc<dyn FormatReader>],
    check: impl Fn(&Arc<dyn FormatReader>) -> Result<bool>,
) -> Result<Option<&Arc<dyn FormatReader>>> {
    for source in sources.iter().rev() {
        if check(source)? {
            return Ok(Some(source));
        }
    }
    Ok(None)
}

fn require_dataset_axis<'a>(
    options: &'a ConcatOptions,
    key: &PropertyKey,
) -> Result<&'a String> {
    options.dataset_axis.as_ref().ok_or_else(|| {
        anyhow!(
            "collecting the property {}\nwith no dataset axis",
            key
        )
    })
}

/// `CollectAxis` for a scalar: one vector on the dataset axis.
fn collect_scalar<W: FormatWriter + ?Sized>(
    destination: &W,
    name: &str,
    key: &PropertyKey,
    sources: &[Arc<dyn FormatReader>],
    options: &ConcatOptions,
) -> Result<()> {
    let dataset_axis = require_dataset_axis(options, key)?;
    let empty_value = lookup_empty(&options.empty, key);
    let mut values = Vec::with_capacity(sources.len());
    for source in sources {
        if source.has_scalar(name)? {
            values.push(source.get_scalar(name)?);
        } else {
            match empty_value {
                Some(value) => values.push(value.clone()),
                None => {
                    return Err(missing_property_error(
                        "scalar",
                        key,
                        source.name(),
                        destination.name(),
                    ))
                }
            }
        }
    }
    let dtype = merged_dtype(
        empty_value.map(|value| value.scalar_type()),
        values.iter().map(|value| value.scalar_type()),
    )?;
    let vector = dispatch_scalar_type!(dtype, T => {
        let typed: Vec<T> = values
            .iter()
            .map(|value| {
                let converted = cast_scalar(value, dtype)?;
                Ok(<T as Element>::from_scalar(&converted).unwrap())
            })
            .collect::<Result<_>>()?;
        <T as Element>::dyn_from_vec(typed)
    });
    destination.set_vector(
        dataset_axis,
        name,
        VectorData::Dense(vector),
        options.overwrite,
    )
}

/// `CollectAxis` for a vector on some other axis: a matrix whose columns are
/// the sources.
fn collect_vector<W: FormatWriter + ?Sized>(
    destination: &W,
    axis: &str,
    name: &str,
    key: &PropertyKey,
    sources: &[Arc<dyn FormatReader>],
    options: &ConcatOptions,
) -> Result<()> {
    let dataset_axis = require_dataset_axis(options, key)?;
    let empty_value = lookup_empty(&options.empty, key);
    let present: Vec<Option<Arc<VectorData>>> = sources
        .iter()
        .map(|source| {
            if source.has_axis(axis)? && source.has_vector(axis, name)? {
                Ok(Some(source.get_vector(axis, name)?))
            } else {
                Ok(None)
            }
        })
        .collect::<Result<_>>()?;
    for (index, slot) in present.iter().enumerate() {
        if slot.is_none() && empty_value.is_none() {
            return Err(missing_property_error(
                "vector",
                key,
                sources[index].name(),
                destination.name(),
            ));
        }
    }
    let dtype = merged_dtype(
        empty_value.map(|value| value.scalar_type()),
        present.iter().flatten().map(|vector| vector.scalar_type()),
    )?;
    let length = destination.axis_length(axis)?;
    let count = sources.len();

    let index_width = IndexWidth::for_capacity(length * count);
    let estimated_nnz: usize = present
        .iter()
        .map(|slot| match slot {
            Some(vector) => vector.stored_entries(),
            None => {
                if empty_value.map_or(true, |value| value.is_zero()) {
                    0
                } else {
                    length
                }
            }
        })
        .sum();
    let dense_bytes = length * count * dtype.size_of();
    let sparse_bytes = estimated_nnz * (dtype.size_of() + index_width.size_of())
        + (count + 1) * index_width.size_of();
    let go_sparse = dtype.is_real()
        && empty_value.map_or(true, |value| value.is_zero())
        && sparse_saves(dense_bytes, sparse_bytes) >= options.sparse_if_saves_storage_fraction;

    let matrix = if go_sparse {
        let mut col_offsets = Vec::with_capacity(count + 1);
        col_offsets.push(0usize);
        let mut row_indices = Vec::new();
        let mut columns = Vec::with_capacity(count);
        for slot in &present {
            match slot {
                Some(vector) => {
                    let (indices, values) = vector.to_sparse_cast(dtype)?;
                    row_indices.extend_from_slice(&indices);
                    columns.push(values);
                }
                None => columns.push(DynVector::zeros(dtype, 0)),
            }
            col_offsets.push(row_indices.len());
        }
        let values = dispatch_real_type!(dtype, T => {
            let mut merged: Vec<T> = Vec::new();
            for column in &columns {
                merged.extend_from_slice(<T as Element>::slice_of(column).unwrap());
            }
            <T as Element>::dyn_from_vec(merged)
        }, unreachable!("string vectors never take the sparse path"));
        MatrixData::Csc(DynCsc::from_parts(
            length,
            count,
            col_offsets,
            row_indices,
            values,
        )?)
    } else {
        let values = dispatch_scalar_type!(dtype, T => {
            let mut merged: Vec<T> = Vec::with_capacity(length * count);
            for slot in &present {
                match slot {
                    Some(vector) => {
                        let dense = vector.to_dense_cast(dtype)?;
                        merged.extend_from_slice(<T as Element>::slice_of(&dense).unwrap());
                    }
                    None => {
                        let value = cast_scalar(empty_value.unwrap(), dtype)?;
                        let typed = <T as Element>::from_scalar(&value).unwrap();
                        merged.extend(std::iter::repeat(typed).take(length));
                    }
                }
            }
            <T as Element>::dyn_from_vec(merged)
        });
        MatrixData::Dense(DynDense::from_column_major(length, count, values)?)
    };
    destination.set_matrix(axis, dataset_axis, name, matrix, options.overwrite)
}
