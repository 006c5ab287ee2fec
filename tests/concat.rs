use std::sync::Arc;

use dafs::prelude::*;

fn sources_pair() -> Vec<Arc<dyn FormatReader>> {
    let first = MemoryDaf::new("concat-first");
    first.add_axis("cell", axis_entries_of(&["c1", "c2"])).unwrap();
    first
        .set_vector("cell", "umi", vec![10i64, 20].into(), false)
        .unwrap();
    first
        .set_vector("cell", "kind", vec!["t", "n"].into(), false)
        .unwrap();
    let second = MemoryDaf::new("concat-second");
    second.add_axis("cell", axis_entries_of(&["c3"])).unwrap();
    second
        .set_vector("cell", "umi", vec![30i64].into(), false)
        .unwrap();
    second
        .set_vector("cell", "kind", vec!["t"].into(), false)
        .unwrap();
    vec![Arc::new(first), Arc::new(second)]
}

fn named_options() -> ConcatOptions {
    ConcatOptions {
        names: Some(vec!["a".to_owned(), "b".to_owned()]),
        ..ConcatOptions::default()
    }
}

/// Concatenate two data sets along `cell`, producing the dataset axis.
#[test]
fn concat_two_sources_with_dataset_axis() {
    let destination = MemoryDaf::new("concat-destination");
    concatenate(&destination, &["cell"], &sources_pair(), named_options()).unwrap();

    assert_eq!(
        *destination.axis_entries("cell").unwrap(),
        vec!["c1".to_owned(), "c2".to_owned(), "c3".to_owned()]
    );
    assert_eq!(
        destination.get_vector("cell", "umi").unwrap().to_dense(),
        DynVector::from(vec![10i64, 20, 30])
    );
    assert_eq!(
        destination.get_vector("cell", "kind").unwrap().to_dense(),
        DynVector::from(vec!["t", "n", "t"])
    );
    assert_eq!(
        *destination.axis_entries("dataset").unwrap(),
        vec!["a".to_owned(), "b".to_owned()]
    );
    assert_eq!(
        destination.get_vector("cell", "dataset").unwrap().to_dense(),
        DynVector::from(vec!["a", "a", "b"])
    );
}

/// A missing property with no empty value aborts; with one, prefixing also
/// renames the entries.
#[test]
fn concat_missing_property_needs_empty() {
    let first = MemoryDaf::new("concat-score-first");
    first.add_axis("cell", axis_entries_of(&["c1", "c2"])).unwrap();
    first
        .set_vector("cell", "score", vec![1.0f64, 2.0].into(), false)
        .unwrap();
    let second = MemoryDaf::new("concat-score-second");
    second.add_axis("cell", axis_entries_of(&["c1"])).unwrap();
    let second_name = second.name().to_owned();
    let sources: Vec<Arc<dyn FormatReader>> = vec![Arc::new(first), Arc::new(second)];

    let destination = MemoryDaf::new("concat-score-refused");
    let options = ConcatOptions {
        names: Some(vec!["a".to_owned(), "b".to_owned()]),
        prefix: Prefix::All(true),
        ..ConcatOptions::default()
    };
    let failure = concatenate(&destination, &["cell"], &sources, options.clone());
    let message = format!("{:#}", failure.err().unwrap());
    assert!(message.contains("score"));
    assert!(message.contains(&second_name));

    let destination = MemoryDaf::new("concat-score-filled");
    let options = ConcatOptions {
        empty: vec![(
            PropertyKey::Vector("cell".to_owned(), "score".to_owned()),
            ScalarValue::F64(0.0),
        )],
        ..options
    };
    concatenate(&destination, &["cell"], &sources, options).unwrap();
    assert_eq!(
        *destination.axis_entries("cell").unwrap(),
        vec!["a.c1".to_owned(), "a.c2".to_owned(), "b.c1".to_owned()]
    );
    assert_eq!(
        destination.get_vector("cell", "score").unwrap().to_dense(),
        DynVector::from(vec![1.0f64, 2.0, 0.0])
    );
}

/// Collect a scalar along the dataset axis.
#[test]
fn concat_collects_scalars_along_dataset() {
    let first = MemoryDaf::new("concat-version-first");
    first.add_axis("cell", axis_entries_of(&["c1"])).unwrap();
    first
        .set_scalar("version", ScalarValue::from("1.0"), false)
        .unwrap();
    let second = MemoryDaf::new("concat-version-second");
    second.add_axis("cell", axis_entries_of(&["c2"])).unwrap();
    second
        .set_scalar("version", ScalarValue::from("1.1"), false)
        .unwrap();
    let sources: Vec<Arc<dyn FormatReader>> = vec![Arc::new(first), Arc::new(second)];

    let destination = MemoryDaf::new("concat-version-destination");
    let options = ConcatOptions {
        names: Some(vec!["a".to_owned(), "b".to_owned()]),
        merge: vec![(
            PropertyKey::Scalar("version".to_owned()),
            MergeAction::CollectAxis,
        )],
        ..ConcatOptions::default()
    };
    concatenate(&destination, &["cell"], &sources, options).unwrap();

    assert!(!destination.has_scalar("version").unwrap());
    assert_eq!(
        destination
            .get_vector("dataset", "version")
            .unwrap()
            .to_dense(),
        DynVector::from(vec!["1.0", "1.1"])
    );
}

/// A square matrix over the concatenation axis is rejected.
#[test]
fn concat_rejects_square_matrix_over_axis() {
    let source = MemoryDaf::new("concat-square");
    source.add_axis("cell", axis_entries_of(&["c1", "c2"])).unwrap();
    source
        .set_matrix(
            "cell",
            "cell",
            "distance",
            ndarray::array![[0.0f64, 1.0], [1.0, 0.0]].into(),
            false,
        )
        .unwrap();
    let sources: Vec<Arc<dyn FormatReader>> = vec![Arc::new(source)];

    let destination = MemoryDaf::new("concat-square-destination");
    let failure = concatenate(&destination, &["cell"], &sources, named_options());
    let message = format!("{:#}", failure.err().unwrap());
    assert!(message.contains("distance"));
    assert!(message.contains("cell"));
}

/// Matrices concatenate in both stored layouts, and a mostly-zero input
/// lands in compressed form.
#[test]
fn concat_matrices_both_layouts() {
    let first = MemoryDaf::new("concat-matrix-first");
    first.add_axis("cell", axis_entries_of(&["c1", "c2"])).unwrap();
    first.add_axis("gene", axis_entries_of(&["g1", "g2", "g3"])).unwrap();
    let first_umis: MatrixData = ndarray::array![[0i64, 0, 1], [2, 0, 0]].into();
    let first_by_gene = sparsify(&transposer(&first_umis).unwrap(), None).unwrap();
    first
        .set_matrix("gene", "cell", "UMIs", first_by_gene, false)
        .unwrap();
    first
        .set_matrix("cell", "gene", "UMIs", first_umis, false)
        .unwrap();

    let second = MemoryDaf::new("concat-matrix-second");
    second.add_axis("cell", axis_entries_of(&["c3"])).unwrap();
    second.add_axis("gene", axis_entries_of(&["g1", "g2", "g3"])).unwrap();
    let second_umis: MatrixData = ndarray::array![[0i64, 3, 0]].into();
    let second_by_gene = sparsify(&transposer(&second_umis).unwrap(), None).unwrap();
    second
        .set_matrix("gene", "cell", "UMIs", second_by_gene, false)
        .unwrap();
    second
        .set_matrix("cell", "gene", "UMIs", second_umis, false)
        .unwrap();

    let sources: Vec<Arc<dyn FormatReader>> = vec![Arc::new(first), Arc::new(second)];
    let destination = MemoryDaf::new("concat-matrix-destination");
    concatenate(&destination, &["cell"], &sources, named_options()).unwrap();

    // (gene, cell): the concatenated axis is the columns axis.
    let by_columns = destination.get_matrix("gene", "cell", "UMIs").unwrap();
    assert_eq!(by_columns.shape(), (3, 3));
    assert!(by_columns.is_sparse());
    assert_eq!(by_columns.get(2, 0), ScalarValue::I64(1));
    assert_eq!(by_columns.get(0, 1), ScalarValue::I64(2));
    assert_eq!(by_columns.get(1, 2), ScalarValue::I64(3));

    // (cell, gene): the concatenated axis is the rows axis.
    let by_rows = destination.get_matrix("cell", "gene", "UMIs").unwrap();
    assert_eq!(by_rows.shape(), (3, 3));
    for row in 0..3 {
        for column in 0..3 {
            assert_eq!(by_rows.get(row, column), by_columns.get(column, row));
        }
    }
}

#[test]
fn concat_merges_last_value() {
    let first = MemoryDaf::new("concat-last-first");
    first.add_axis("cell", axis_entries_of(&["c1"])).unwrap();
    first
        .set_scalar("pipeline", ScalarValue::from("v1"), false)
        .unwrap();
    let second = MemoryDaf::new("concat-last-second");
    second.add_axis("cell", axis_entries_of(&["c2"])).unwrap();
    second
        .set_scalar("pipeline", ScalarValue::from("v2"), false)
        .unwrap();
    let sources: Vec<Arc<dyn FormatReader>> = vec![Arc::new(first), Arc::new(second)];

    let destination = MemoryDaf::new("concat-last-value");
    let options = ConcatOptions {
        names: Some(vec!["a".to_owned(), "b".to_owned()]),
        merge: vec![(PropertyKey::Scalar("*".to_owned()), MergeAction::LastValue)],
        ..ConcatOptions::default()
    };
    concatenate(&destination, &["cell"], &sources, options).unwrap();
    assert_eq!(
        destination.get_scalar("pipeline").unwrap(),
        ScalarValue::from("v2")
    );
}

/// Collecting a matrix property would need a third dimension.
#[test]
fn concat_refuses_collecting_matrices() {
    let first = MemoryDaf::new("concat-collect-matrix-first");
    first.add_axis("cell", axis_entries_of(&["c1"])).unwrap();
    first.add_axis("gene", axis_entries_of(&["g1"])).unwrap();
    first.add_axis("batch", axis_entries_of(&["b1"])).unwrap();
    first
        .set_matrix(
            "gene",
            "batch",
            "noise",
            ndarray::array![[1.0f32]].into(),
            false,
        )
        .unwrap();
    let sources: Vec<Arc<dyn FormatReader>> = vec![Arc::new(first)];

    let destination = MemoryDaf::new("concat-collect-matrix-destination");
    let options = ConcatOptions {
        names: Some(vec!["a".to_owned()]),
        merge: vec![(
            PropertyKey::Matrix("*".to_owned(), "*".to_owned(), "*".to_owned()),
            MergeAction::CollectAxis,
        )],
        ..ConcatOptions::default()
    };
    let failure = concatenate(&destination, &["cell"], &sources, options);
    let message = format!("{:#}", failure.err().unwrap());
    assert!(message.contains("third dimension"));
}

/// Collected vectors stack as columns of a matrix on the dataset axis.
#[test]
fn concat_collects_vectors_as_matrix() {
    let first = MemoryDaf::new("concat-collect-vector-first");
    first.add_axis("cell", axis_entries_of(&["c1"])).unwrap();
    first.add_axis("gene", axis_entries_of(&["g1", "g2"])).unwrap();
    first
        .set_vector("gene", "noise", vec![1.0f64, 2.0].into(), false)
        .unwrap();
    let second = MemoryDaf::new("concat-collect-vector-second");
    second.add_axis("cell", axis_entries_of(&["c2"])).unwrap();
    second.add_axis("gene", axis_entries_of(&["g1", "g2"])).unwrap();
    second
        .set_vector("gene", "noise", vec![3.0f64, 4.0].into(), false)
        .unwrap();
    let sources: Vec<Arc<dyn FormatReader>> = vec![Arc::new(first), Arc::new(second)];

    let destination = MemoryDaf::new("concat-collect-vector-destination");
    let options = ConcatOptions {
        names: Some(vec!["a".to_owned(), "b".to_owned()]),
        merge: vec![(
            PropertyKey::Vector("gene".to_owned(), "noise".to_owned()),
            MergeAction::CollectAxis,
        )],
        ..ConcatOptions::default()
    };
    concatenate(&destination, &["cell"], &sources, options).unwrap();

    let collected = destination.get_matrix("gene", "dataset", "noise").unwrap();
    assert_eq!(collected.shape(), (2, 2));
    assert_eq!(collected.get(0, 0), ScalarValue::F64(1.0));
    assert_eq!(collected.get(1, 0), ScalarValue::F64(2.0));
    assert_eq!(collected.get(0, 1), ScalarValue::F64(3.0));
    assert_eq!(collected.get(1, 1), ScalarValue::F64(4.0));
}

/// The sparse estimate drives the representation of the concatenated target.
#[test]
fn concat_picks_sparse_when_it_saves() {
    let first = MemoryDaf::new("concat-sparse-first");
    first
        .add_axis("cell", (0..100).map(|i| format!("a{}", i)).collect())
        .unwrap();
    let mut values = vec![0.0f64; 100];
    values[7] = 1.0;
    first
        .set_vector("cell", "signal", values.into(), false)
        .unwrap();
    let second = MemoryDaf::new("concat-sparse-second");
    second
        .add_axis("cell", (0..100).map(|i| format!("b{}", i)).collect())
        .unwrap();
    let sparse = sparsify_vector(
        &{
            let mut values = vec![0.0f64; 100];
            values[3] = 2.0;
            VectorData::from(values)
        },
        None,
    )
    .unwrap();
    second.set_vector("cell", "signal", sparse, false).unwrap();

    let sources: Vec<Arc<dyn FormatReader>> = vec![Arc::new(first), Arc::new(second)];
    let destination = MemoryDaf::new("concat-sparse-destination");
    concatenate(&destination, &["cell"], &sources, named_options()).unwrap();

    let signal = destination.get_vector("cell", "signal").unwrap();
    assert!(signal.is_sparse());
    assert_eq!(signal.len(), 200);
    assert_eq!(signal.get(7), ScalarValue::F64(1.0));
    assert_eq!(signal.get(103), ScalarValue::F64(2.0));
    // Dense slices are compressed on the way in, so only the true
    // non-zeros are stored.
    assert_eq!(signal.stored_entries(), 2);
}
