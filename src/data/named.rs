use std::sync::Arc;

use anyhow::{anyhow, ensure, Result};
use indexmap::IndexMap;

use super::{MatrixData, ScalarValue, VectorData};

/// A vector decorated with the entry names of its axis. The decorator borrows
/// nothing: it owns an `Arc` of the names and of the data, so it can outlive
/// the store lock it was read under.
#[derive(Clone, Debug)]
pub struct NamedVector {
    names: Arc<Vec<String>>,
    positions: IndexMap<String, usize>,
    data: Arc<VectorData>,
}

impl NamedVector {
    pub fn new(names: Arc<Vec<String>>, data: Arc<VectorData>) -> Result<NamedVector> {
        ensure!(
            names.len() == data.len(),
            "a vector of length {} cannot be named by {} entries",
            data.len(),
            names.len()
        );
        let positions = names
            .iter()
            .enumerate()
            .map(|(position, name)| (name.clone(), position))
            .collect();
        Ok(NamedVector {
            names,
            positions,
            data,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn data(&self) -> &VectorData {
        &self.data
    }

    pub fn get(&self, name: &str) -> Result<ScalarValue> {
        let position = self
            .positions
            .get(name)
            .ok_or_else(|| anyhow!("the vector has no entry named {}", name))?;
        Ok(self.data.get(*position))
    }
}

/// A matrix decorated with the entry names of both of its axes.
#[derive(Clone, Debug)]
pub struct NamedMatrix {
    row_names: Arc<Vec<String>>,
    column_names: Arc<Vec<String>>,
    row_positions: IndexMap<String, usize>,
    column_positions: IndexMap<String, usize>,
    data: Arc<MatrixData>,
}

impl NamedMatrix {
    pub fn new(
        row_names: Arc<Vec<String>>,
        column_names: Arc<Vec<String>>,
        data: Arc<MatrixData>,
    ) -> Result<NamedMatrix> {
        let (nrows, ncols) = data.shape();
        ensure!(
            row_names.len() == nrows && column_names.len() == ncols,
            "a matrix of shape ({}, {}) cannot be named by {} row and {} column entries",
            nrows,
            ncols,
            row_names.len(),
            column_names.len()
        );
        let row_positions = positions_of(&row_names);
        let column_positions = positions_of(&column_names);
        Ok(NamedMatrix {
            row_names,
            column_names,
            row_positions,
            column_positions,
            data,
        })
    }

    pub fn row_names(&self) -> &[String] {
        &self.row_names
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn data(&self) -> &MatrixData {
        &self.data
    }

    pub fn get(&self, row: &str, column: &str) -> Result<ScalarValue> {
        let row_position = self
            .row_positions
            .get(row)
            .ok_or_else(|| anyhow!("the matrix has no row named {}", row))?;
        let column_position = self
            .column_positions
            .get(column)
            .ok_or_else(|| anyhow!("the matrix has no column named {}", column))?;
        Ok(self.data.get(*row_position, *column_position))
    }

    /// Propagate the names onto a transformed copy of the data, when the
    /// shape still matches; drop them otherwise.
    pub fn with_data(&self, data: MatrixData) -> Result<NamedMatrix> {
        NamedMatrix::new(
            self.row_names.clone(),
            self.column_names.clone(),
            Arc::new(data),
        )
    }
}

fn positions_of(names: &[String]) -> IndexMap<String, usize> {
    names
        .iter()
        .enumerate()
        .map(|(position, name)| (name.clone(), position))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DynVector;

    #[test]
    fn named_vector_lookup() {
        let names = Arc::new(vec!["c1".to_owned(), "c2".to_owned()]);
        let data = Arc::new(VectorData::Dense(DynVector::from(vec![10i32, 20])));
        let named = NamedVector::new(names, data).unwrap();
        assert_eq!(named.get("c2").unwrap(), ScalarValue::I32(20));
        assert!(named.get("c3").is_err());
    }
}
