use dafs::prelude::*;
use dafs::layout::{
    dense_matrix_bytes, matrix_sparse_saves_fraction, sparse_matrix_bytes,
};
use proptest::prelude::*;

fn matrix_strat() -> impl Strategy<Value = (usize, usize, Vec<f64>)> {
    (1usize..8, 1usize..8).prop_flat_map(|(nrows, ncols)| {
        proptest::collection::vec(
            prop_oneof![3 => Just(0.0f64), 1 => -100.0f64..100.0],
            nrows * ncols,
        )
        .prop_map(move |values| (nrows, ncols, values))
    })
}

proptest! {
    /// relayout(relayout(M)) == M, flipping the major axis both ways.
    #[test]
    fn relayout_round_trips((nrows, ncols, values) in matrix_strat()) {
        let matrix = MatrixData::Dense(
            DynDense::from_column_major(nrows, ncols, values.into()).unwrap(),
        );
        let flipped = relayout(&matrix).unwrap();
        prop_assert_eq!(flipped.shape(), (nrows, ncols));
        if ncols > 1 {
            // A single-column matrix reads as columns-major in either order.
            prop_assert_eq!(major_axis(&flipped), Some(MatrixAxis::Rows));
        }
        prop_assert!(matrix.same_values(&flipped));
        let back = relayout(&flipped).unwrap();
        prop_assert_eq!(major_axis(&back), Some(MatrixAxis::Columns));
        prop_assert!(matrix.same_values(&back));
    }

    /// transposer(transposer(M)) == M, preserving the major-axis label.
    #[test]
    fn transposer_round_trips((nrows, ncols, values) in matrix_strat()) {
        let matrix = MatrixData::Dense(
            DynDense::from_column_major(nrows, ncols, values.into()).unwrap(),
        );
        let transposed = transposer(&matrix).unwrap();
        prop_assert_eq!(transposed.shape(), (ncols, nrows));
        prop_assert_eq!(major_axis(&transposed), major_axis(&matrix));
        let back = transposer(&transposed).unwrap();
        prop_assert!(matrix.same_values(&back));

        let sparse = sparsify(&matrix, None).unwrap();
        let sparse_back = transposer(&transposer(&sparse).unwrap()).unwrap();
        prop_assert!(sparse.same_values(&sparse_back));
    }

    /// Sparse and dense forms hold the same values.
    #[test]
    fn sparsify_densify_round_trips((nrows, ncols, values) in matrix_strat()) {
        let matrix = MatrixData::Dense(
            DynDense::from_column_major(nrows, ncols, values.into()).unwrap(),
        );
        let sparse = sparsify(&matrix, None).unwrap();
        prop_assert!(sparse.is_sparse());
        prop_assert_eq!(sparse.stored_entries(), matrix.count_nonzero());
        let dense = densify(&sparse, None).unwrap();
        prop_assert!(matrix.same_values(&dense));
    }

    /// Bestify picks the compressed form exactly when the saved fraction
    /// clears the threshold.
    #[test]
    fn bestify_matches_the_formula(
        (nrows, ncols, values) in matrix_strat(),
        threshold in 0.0f64..0.9,
    ) {
        let matrix = MatrixData::Dense(
            DynDense::from_column_major(nrows, ncols, values.into()).unwrap(),
        );
        let nnz = matrix.count_nonzero();
        let saved = matrix_sparse_saves_fraction(ScalarType::F64, nrows, ncols, nnz);
        let best = bestify(&matrix, threshold, None).unwrap();
        prop_assert_eq!(best.is_sparse(), saved >= threshold);
        prop_assert!(best.same_values(&matrix));
    }
}

/// The worked numbers behind the threshold rule: a 1000 x 1000 matrix at 10%
/// occupancy compresses, a full one does not.
#[test]
fn storage_fraction_worked_example() {
    let dense = dense_matrix_bytes(ScalarType::F64, 1000, 1000);
    assert_eq!(dense, 8_000_000);
    let sparse = sparse_matrix_bytes(ScalarType::F64, 1000, 1000, 100_000);
    assert_eq!(sparse, 100_000 * 12 + 1001 * 4);
    let saved = matrix_sparse_saves_fraction(ScalarType::F64, 1000, 1000, 100_000);
    assert!((saved - (dense as f64 - sparse as f64) / dense as f64).abs() < 1e-12);
    assert!(saved >= 0.25);
    assert!(matrix_sparse_saves_fraction(ScalarType::F64, 1000, 1000, 1_000_000) < 0.25);
}
