mod common;
use common::*;

use dafs::prelude::*;
use ndarray::array;

fn test_scalars<F, T>(daf_gen: F)
where
    F: Fn() -> T,
    T: FormatWriter,
{
    let daf = daf_gen();
    daf.set_scalar("depth", ScalarValue::U32(17), false).unwrap();
    daf.set_scalar("label", ScalarValue::from("batch one"), false)
        .unwrap();
    daf.set_scalar("fraction", ScalarValue::F64(0.25), false)
        .unwrap();
    daf.set_scalar("flag", ScalarValue::Bool(true), false).unwrap();

    assert!(daf.has_scalar("depth").unwrap());
    assert_eq!(daf.get_scalar("depth").unwrap(), ScalarValue::U32(17));
    assert_eq!(
        daf.get_scalar("label").unwrap(),
        ScalarValue::from("batch one")
    );
    assert_eq!(daf.get_scalar("flag").unwrap(), ScalarValue::Bool(true));

    assert!(daf.set_scalar("depth", ScalarValue::U32(18), false).is_err());
    daf.set_scalar("depth", ScalarValue::U32(18), true).unwrap();
    assert_eq!(daf.get_scalar("depth").unwrap(), ScalarValue::U32(18));

    let scalars = daf.scalars_set().unwrap();
    assert_eq!(scalars.len(), 4);
    daf.delete_scalar("depth", true).unwrap();
    assert!(!daf.has_scalar("depth").unwrap());
    assert!(daf.get_scalar("depth").is_err());
}

fn test_axes_and_vectors<F, T>(daf_gen: F)
where
    F: Fn() -> T,
    T: FormatWriter,
{
    let daf = daf_gen();
    daf.add_axis("cell", axis_entries_of(&["c1", "c2", "c3"])).unwrap();
    assert_eq!(daf.axis_length("cell").unwrap(), 3);
    assert_eq!(
        *daf.axis_entries("cell").unwrap(),
        vec!["c1".to_owned(), "c2".to_owned(), "c3".to_owned()]
    );
    assert!(daf.add_axis("cell", axis_entries_of(&["c4"])).is_err());

    daf.set_vector("cell", "umi", vec![10u32, 20, 30].into(), false)
        .unwrap();
    daf.set_vector("cell", "kind", vec!["t", "n", "t"].into(), false)
        .unwrap();
    let sparse = sparsify_vector(&vec![0.0f32, 0.5, 0.0].into(), None).unwrap();
    daf.set_vector("cell", "score", sparse.clone(), false).unwrap();

    // Every vector's length equals its axis's length.
    for name in daf.vectors_set("cell").unwrap() {
        assert_eq!(
            daf.get_vector("cell", &name).unwrap().len(),
            daf.axis_length("cell").unwrap()
        );
    }

    assert_eq!(
        *daf.get_vector("cell", "umi").unwrap(),
        VectorData::from(vec![10u32, 20, 30])
    );
    let score = daf.get_vector("cell", "score").unwrap();
    assert!(score.is_sparse());
    assert_eq!(score.to_dense(), DynVector::from(vec![0.0f32, 0.5, 0.0]));

    let named = daf.get_named_vector("cell", "umi").unwrap();
    assert_eq!(named.get("c2").unwrap(), ScalarValue::U32(20));

    assert!(daf
        .set_vector("cell", "umi", vec![1u32].into(), true)
        .is_err());
    assert!(daf.delete_axis("cell", true).is_err());
    for name in ["umi", "kind", "score"] {
        daf.delete_vector("cell", name, true).unwrap();
    }
    daf.delete_axis("cell", true).unwrap();
    assert!(!daf.has_axis("cell").unwrap());
}

/// Round-trip a dense matrix and materialize both of its layouts.
fn test_matrices<F, T>(daf_gen: F)
where
    F: Fn() -> T,
    T: FormatWriter,
{
    let daf = daf_gen();
    daf.add_axis("cell", axis_entries_of(&["c1", "c2", "c3"])).unwrap();
    daf.add_axis("gene", axis_entries_of(&["g1", "g2"])).unwrap();
    let umis = MatrixData::from(array![[0i64, 1], [2, 0], [3, 4]]);
    daf.set_matrix("cell", "gene", "UMIs", umis.clone(), false)
        .unwrap();

    let stored = daf.get_matrix("cell", "gene", "UMIs").unwrap();
    assert_eq!(stored.shape(), (3, 2));
    assert_eq!(major_axis(stored.as_ref()), Some(MatrixAxis::Columns));
    assert!(stored.same_values(&umis));

    // The flipped layout is an independent property with flipped axes.
    daf.relayout_matrix("cell", "gene", "UMIs", false).unwrap();
    let flipped = daf.get_matrix("gene", "cell", "UMIs").unwrap();
    assert_eq!(flipped.shape(), (2, 3));
    assert_eq!(major_axis(flipped.as_ref()), Some(MatrixAxis::Columns));
    for row in 0..3 {
        for column in 0..2 {
            assert_eq!(stored.get(row, column), flipped.get(column, row));
        }
    }

    let sparse = sparsify(&umis, None).unwrap();
    daf.set_matrix("cell", "gene", "UMIs", sparse, true).unwrap();
    let stored = daf.get_matrix("cell", "gene", "UMIs").unwrap();
    assert!(stored.is_sparse());
    assert!(stored.same_values(&umis));

    let named = daf.get_named_matrix("cell", "gene", "UMIs").unwrap();
    assert_eq!(named.get("c3", "g2").unwrap(), ScalarValue::I64(4));

    daf.delete_matrix("cell", "gene", "UMIs", true).unwrap();
    daf.delete_matrix("gene", "cell", "UMIs", true).unwrap();
    assert!(!daf.has_matrix("cell", "gene", "UMIs").unwrap());
}

fn test_versions_and_cache<F, T>(daf_gen: F)
where
    F: Fn() -> T,
    T: FormatWriter,
{
    let daf = daf_gen();
    daf.add_axis("cell", axis_entries_of(&["c1", "c2"])).unwrap();
    let key = "/ cell : age".to_owned();
    assert_eq!(daf.version_counter(&key), 0);

    daf.set_vector("cell", "age", vec![1i16, 2].into(), false).unwrap();
    assert_eq!(daf.version_counter(&key), 1);
    assert_eq!(
        *daf.get_vector("cell", "age").unwrap(),
        VectorData::from(vec![1i16, 2])
    );

    // Overwriting invalidates whatever the cache held.
    daf.set_vector("cell", "age", vec![3i16, 4].into(), true).unwrap();
    assert_eq!(daf.version_counter(&key), 2);
    assert_eq!(
        *daf.get_vector("cell", "age").unwrap(),
        VectorData::from(vec![3i16, 4])
    );

    daf.empty_cache(None, Some(CacheClass::QueryData)).unwrap();
    assert_eq!(
        *daf.get_vector("cell", "age").unwrap(),
        VectorData::from(vec![3i16, 4])
    );
    assert!(daf.empty_cache(None, None).is_err());
}

fn test_description<F, T>(daf_gen: F)
where
    F: Fn() -> T,
    T: FormatWriter,
{
    let daf = daf_gen();
    daf.set_scalar("depth", ScalarValue::U32(17), false).unwrap();
    daf.add_axis("cell", axis_entries_of(&["c1", "c2"])).unwrap();
    daf.set_vector("cell", "age", vec![1i16, 2].into(), false).unwrap();
    let description = daf.description().unwrap();
    assert!(description.contains("depth: 17"));
    assert!(description.contains("cell: 2 entries"));
    assert!(description.contains("age: i16 dense"));
}

#[test]
fn test_scalars_memory() {
    test_scalars(|| MemoryDaf::new("memory-scalars"));
}

#[test]
fn test_axes_and_vectors_memory() {
    test_axes_and_vectors(|| MemoryDaf::new("memory-vectors"));
}

#[test]
fn test_matrices_memory() {
    test_matrices(|| MemoryDaf::new("memory-matrices"));
}

#[test]
fn test_versions_and_cache_memory() {
    test_versions_and_cache(|| MemoryDaf::new("memory-versions"));
}

#[test]
fn test_description_memory() {
    test_description(|| MemoryDaf::new("memory-description"));
}

#[test]
fn test_scalars_h5() {
    with_tmp_path(|path| {
        test_scalars(|| H5df::open(path.to_str().unwrap(), "w").unwrap());
    })
}

#[test]
fn test_axes_and_vectors_h5() {
    with_tmp_path(|path| {
        test_axes_and_vectors(|| H5df::open(path.to_str().unwrap(), "w").unwrap());
    })
}

#[test]
fn test_matrices_h5() {
    with_tmp_path(|path| {
        test_matrices(|| H5df::open(path.to_str().unwrap(), "w").unwrap());
    })
}

#[test]
fn test_versions_and_cache_h5() {
    with_tmp_path(|path| {
        test_versions_and_cache(|| H5df::open(path.to_str().unwrap(), "w").unwrap());
    })
}

#[test]
fn test_description_h5() {
    with_tmp_path(|path| {
        test_description(|| H5df::open(path.to_str().unwrap(), "w").unwrap());
    })
}
