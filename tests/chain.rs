use std::sync::Arc;

use dafs::prelude::*;

fn base_reader() -> Arc<MemoryDaf> {
    let daf = MemoryDaf::new("chain-test-base");
    daf.set_scalar("v", ScalarValue::I64(1), false).unwrap();
    daf.add_axis("cell", axis_entries_of(&["c1", "c2"])).unwrap();
    daf.set_vector("cell", "batch", vec!["a", "b"].into(), false)
        .unwrap();
    Arc::new(daf)
}

/// Override through a chain, and refuse to delete what an earlier member
/// owns.
#[test]
fn chain_override_and_refused_delete() {
    let base = base_reader();
    let writer = Arc::new(MemoryDaf::new("chain-test-writer"));
    let chain = chain_writer(
        "chain-test",
        vec![read_only(base.clone() as Arc<dyn FormatReader>)],
        writer.clone(),
    )
    .unwrap();

    assert_eq!(chain.get_scalar("v").unwrap(), ScalarValue::I64(1));
    chain.set_scalar("v", ScalarValue::I64(2), true).unwrap();
    assert_eq!(chain.get_scalar("v").unwrap(), ScalarValue::I64(2));
    assert_eq!(writer.get_scalar("v").unwrap(), ScalarValue::I64(2));
    assert_eq!(base.get_scalar("v").unwrap(), ScalarValue::I64(1));

    let refused = chain.delete_scalar("v", true);
    assert!(refused.is_err());
    assert!(format!("{:#}", refused.err().unwrap()).contains("earlier member"));

    // Even after overriding with a different value the delete is refused.
    chain.set_scalar("v", ScalarValue::I64(3), true).unwrap();
    assert!(chain.delete_scalar("v", true).is_err());
}

#[test]
fn chain_reads_union_all_members() {
    let base = base_reader();
    let overlay = MemoryDaf::new("chain-test-overlay");
    overlay.set_scalar("w", ScalarValue::I64(9), false).unwrap();
    overlay
        .add_axis("gene", axis_entries_of(&["g1"]))
        .unwrap();
    overlay
        .set_vector("gene", "length", vec![100u64].into(), false)
        .unwrap();

    let chain = chain_reader(
        "chain-test-union",
        vec![base as Arc<dyn FormatReader>, Arc::new(overlay)],
    )
    .unwrap();

    // Union of keys, each resolved through the last member holding it.
    let axes = chain.axes_set().unwrap();
    assert!(axes.contains("cell") && axes.contains("gene"));
    let scalars = chain.scalars_set().unwrap();
    assert!(scalars.contains("v") && scalars.contains("w"));
    assert!(chain.has_vector("cell", "batch").unwrap());
    assert!(chain.has_vector("gene", "length").unwrap());
    assert_eq!(
        *chain.get_vector("gene", "length").unwrap(),
        VectorData::from(vec![100u64])
    );
}

#[test]
fn chain_version_counters_sum_members() {
    let base = base_reader();
    let writer = Arc::new(MemoryDaf::new("chain-test-versions"));
    let chain = chain_writer(
        "chain-test-versions-chain",
        vec![base as Arc<dyn FormatReader>],
        writer,
    )
    .unwrap();
    let key = ": v";
    let before = chain.version_counter(key);
    chain.set_scalar("v", ScalarValue::I64(2), true).unwrap();
    assert_eq!(chain.version_counter(key), before + 1);
}

#[test]
fn chain_relayout_caches_under_owner() {
    let base = Arc::new(MemoryDaf::new("chain-test-relayout-base"));
    base.add_axis("cell", axis_entries_of(&["c1", "c2", "c3"])).unwrap();
    base.add_axis("gene", axis_entries_of(&["g1", "g2"])).unwrap();
    base.set_matrix(
        "cell",
        "gene",
        "UMIs",
        ndarray::array![[0i64, 1], [2, 0], [3, 4]].into(),
        false,
    )
    .unwrap();

    let writer = Arc::new(MemoryDaf::new("chain-test-relayout-writer"));
    let chain = chain_writer(
        "chain-test-relayout",
        vec![base.clone() as Arc<dyn FormatReader>],
        writer.clone(),
    )
    .unwrap();

    let flipped = chain.relayout_matrix("cell", "gene", "UMIs", false).unwrap();
    assert_eq!(flipped.shape(), (2, 3));
    // The flipped copy is served by the chain but not written anywhere.
    assert!(chain.has_matrix("gene", "cell", "UMIs").unwrap());
    assert!(!writer.has_axis("gene").unwrap());
    let read_back = chain.get_matrix("gene", "cell", "UMIs").unwrap();
    assert_eq!(read_back.get(1, 2), ScalarValue::I64(4));
}

#[test]
fn read_only_views_refuse_nothing_but_reads() {
    let base = base_reader();
    let view = read_only(base.clone() as Arc<dyn FormatReader>);
    assert!(view.frozen());
    assert_eq!(view.get_scalar("v").unwrap(), ScalarValue::I64(1));
    // Wrapping twice does not stack.
    let again = read_only(view.clone());
    assert_eq!(again.name(), view.name());
}
