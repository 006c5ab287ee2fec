//! Copying properties between stores: one scalar, axis, vector or matrix at
//! a time, or everything at once. Representation is preserved: a sparse
//! vector stays sparse, a matrix keeps its physical form.

use anyhow::{ensure, Result};
use itertools::Itertools;

use crate::data::{MatrixData, VectorData};
use crate::format::{FormatReader, FormatWriter};
use crate::readers::DafReader;
use crate::writers::DafWriter;

pub fn copy_scalar<R, W>(
    source: &R,
    destination: &W,
    name: &str,
    rename: Option<&str>,
    overwrite: bool,
) -> Result<()>
where
    R: FormatReader + ?Sized,
    W: FormatWriter + ?Sized,
{
    let value = source.get_scalar(name)?;
    destination.set_scalar(rename.unwrap_or(name), value, overwrite)
}

/// Copy an axis and its entries. An axis already present in the destination
/// must carry the identical entry sequence.
pub fn copy_axis<R, W>(source: &R, destination: &W, axis: &str) -> Result<()>
where
    R: FormatReader + ?Sized,
    W: FormatWriter + ?Sized,
{
    let entries = source.axis_entries(axis)?;
    if destination.has_axis(axis)? {
        let existing = destination.axis_entries(axis)?;
        ensure!(
            existing == entries,
            "different entries of the axis {}\nbetween the data set {}\nand the data set {}",
            axis,
            source.name(),
            destination.name()
        );
        return Ok(());
    }
    destination.add_axis(axis, Vec::clone(&entries))
}

pub fn copy_vector<R, W>(
    source: &R,
    destination: &W,
    axis: &str,
    name: &str,
    rename: Option<&str>,
    overwrite: bool,
) -> Result<()>
where
    R: FormatReader + ?Sized,
    W: FormatWriter + ?Sized,
{
    copy_axis(source, destination, axis)?;
    let vector = source.get_vector(axis, name)?;
    destination.set_vector(axis, rename.unwrap_or(name), VectorData::clone(&vector), overwrite)
}

pub fn copy_matrix<R, W>(
    source: &R,
    destination: &W,
    rows_axis: &str,
    columns_axis: &str,
    name: &str,
    rename: Option<&str>,
    overwrite: bool,
) -> Result<()>
where
    R: FormatReader + ?Sized,
    W: FormatWriter + ?Sized,
{
    copy_axis(source, destination, rows_axis)?;
    copy_axis(source, destination, columns_axis)?;
    let matrix = source.get_matrix(rows_axis, columns_axis, name)?;
    destination.set_matrix(
        rows_axis,
        columns_axis,
        rename.unwrap_or(name),
        MatrixData::clone(&matrix),
        overwrite,
    )
}

/// Copy every scalar, axis, vector and matrix, in deterministic order.
pub fn copy_all<R, W>(source: &R, destination: &W, overwrite: bool) -> Result<()>
where
    R: FormatReader + ?Sized,
    W: FormatWriter + ?Sized,
{
    for name in source.scalars_set()?.iter().sorted() {
        copy_scalar(source, destination, name, None, overwrite)?;
    }
    let axes = source.axes_set()?;
    for axis in axes.iter().sorted() {
        copy_axis(source, destination, axis)?;
    }
    for axis in axes.iter().sorted() {
        for name in source.vectors_set(axis)?.iter().sorted() {
            copy_vector(source, destination, axis, name, None, overwrite)?;
        }
    }
    for rows_axis in axes.iter().sorted() {
        for columns_axis in axes.iter().sorted() {
            for name in source
                .matrices_set(rows_axis, columns_axis)?
                .iter()
                .sorted()
            {
                copy_matrix(
                    source,
                    destination,
                    rows_axis,
                    columns_axis,
                    name,
                    None,
                    overwrite,
                )?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DynVector, ScalarValue};
    use crate::layout::sparsify_vector;
    use crate::memory::MemoryDaf;
    use crate::writers::axis_entries_of;

    #[test]
    fn copy_all_preserves_representation() {
        let source = MemoryDaf::new("copies-source");
        source.set_scalar("v", ScalarValue::F64(2.5), false).unwrap();
        source.add_axis("cell", axis_entries_of(&["c1", "c2", "c3"])).unwrap();
        let sparse = sparsify_vector(
            &VectorData::Dense(DynVector::from(vec![0i32, 7, 0])),
            None,
        )
        .unwrap();
        source.set_vector("cell", "count", sparse.clone(), false).unwrap();

        let destination = MemoryDaf::new("copies-destination");
        copy_all(&source, &destination, false).unwrap();
        assert_eq!(destination.get_scalar("v").unwrap(), ScalarValue::F64(2.5));
        assert_eq!(
            destination.axis_entries("cell").unwrap(),
            source.axis_entries("cell").unwrap()
        );
        let copied = destination.get_vector("cell", "count").unwrap();
        assert!(copied.is_sparse());
        assert_eq!(*copied, sparse);
    }
}
