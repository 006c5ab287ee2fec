mod common;
use common::*;

use std::sync::Arc;

use dafs::prelude::*;
use ndarray::array;

fn populate(daf: &H5df) {
    daf.set_scalar("depth", ScalarValue::U32(17), false).unwrap();
    daf.set_scalar("label", ScalarValue::from("batch one"), false)
        .unwrap();
    daf.add_axis("cell", axis_entries_of(&["c1", "c2", "c3"])).unwrap();
    daf.add_axis("gene", axis_entries_of(&["g1", "g2"])).unwrap();
    daf.set_vector("cell", "umi", vec![10u32, 20, 30].into(), false)
        .unwrap();
    let score = sparsify_vector(&vec![0.0f64, 0.5, 0.0].into(), None).unwrap();
    daf.set_vector("cell", "score", score, false).unwrap();
    let mask = sparsify_vector(&vec![false, true, true].into(), None).unwrap();
    daf.set_vector("cell", "mask", mask, false).unwrap();
    daf.set_matrix(
        "cell",
        "gene",
        "UMIs",
        array![[0i64, 1], [2, 0], [3, 4]].into(),
        false,
    )
    .unwrap();
    let fractions = sparsify(&array![[0.0f32, 0.5], [0.0, 0.0], [0.25, 0.0]].into(), None).unwrap();
    daf.set_matrix("cell", "gene", "fractions", fractions, false)
        .unwrap();
}

/// The exact on-disk structure: marker, groups, 1-based indices, elided
/// all-true bool values.
#[test]
fn on_disk_structure_is_fixed() {
    with_tmp_path(|path| {
        let spec = path.to_str().unwrap().to_owned();
        {
            let daf = H5df::open(&spec, "w").unwrap();
            populate(&daf);
        }

        let file = hdf5::File::open(&path).unwrap();
        let marker = file.dataset("daf").unwrap().read_raw::<u32>().unwrap();
        assert_eq!(marker, vec![1, 0]);

        for group in ["scalars", "axes", "vectors", "matrices"] {
            assert!(file.link_exists(group));
        }
        assert_eq!(
            file.dataset("scalars/depth")
                .unwrap()
                .read_scalar::<u32>()
                .unwrap(),
            17
        );

        let entries = file
            .dataset("axes/cell")
            .unwrap()
            .read_raw::<hdf5::types::VarLenUnicode>()
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].as_str(), "c1");

        // Dense vectors are plain contiguous datasets.
        let umi = file.dataset("vectors/cell/umi").unwrap();
        assert!(!umi.is_chunked());
        assert_eq!(umi.read_raw::<u32>().unwrap(), vec![10, 20, 30]);

        // Sparse vectors are groups with 1-based sorted indices.
        let nzind = file
            .dataset("vectors/cell/score/nzind")
            .unwrap()
            .read_raw::<i64>()
            .unwrap();
        assert_eq!(nzind, vec![2]);
        assert_eq!(
            file.dataset("vectors/cell/score/nzval")
                .unwrap()
                .read_raw::<f64>()
                .unwrap(),
            vec![0.5]
        );

        // All-true bool values are elided on disk.
        assert!(file.link_exists("vectors/cell/mask/nzind"));
        assert!(!file.link_exists("vectors/cell/mask/nzval"));

        // The dense matrix records the rows-contiguous layout: the raw
        // element order is column-major of the logical (3, 2) shape.
        let umis = file.dataset("matrices/cell/gene/UMIs").unwrap();
        assert!(!umis.is_chunked());
        assert_eq!(umis.shape(), vec![2, 3]);
        assert_eq!(umis.read_raw::<i64>().unwrap(), vec![0, 2, 3, 1, 0, 4]);

        // Compressed matrices carry 1-based colptr with its sentinel.
        let colptr = file
            .dataset("matrices/cell/gene/fractions/colptr")
            .unwrap()
            .read_raw::<i64>()
            .unwrap();
        assert_eq!(colptr, vec![1, 2, 3]);
        let rowval = file
            .dataset("matrices/cell/gene/fractions/rowval")
            .unwrap()
            .read_raw::<i64>()
            .unwrap();
        assert_eq!(rowval, vec![3, 1]);
        assert_eq!(
            file.dataset("matrices/cell/gene/fractions/nzval")
                .unwrap()
                .read_raw::<f32>()
                .unwrap(),
            vec![0.25, 0.5]
        );
    })
}

#[test]
fn round_trip_through_reopen() {
    with_tmp_path(|path| {
        let spec = path.to_str().unwrap().to_owned();
        {
            let daf = H5df::open(&spec, "w").unwrap();
            populate(&daf);
        }
        let daf = H5df::open(&spec, "r+").unwrap();
        assert_eq!(daf.get_scalar("depth").unwrap(), ScalarValue::U32(17));
        assert_eq!(
            daf.get_scalar("label").unwrap(),
            ScalarValue::from("batch one")
        );
        assert_eq!(daf.axis_length("cell").unwrap(), 3);
        assert_eq!(
            *daf.get_vector("cell", "umi").unwrap(),
            VectorData::from(vec![10u32, 20, 30])
        );
        let score = daf.get_vector("cell", "score").unwrap();
        assert!(score.is_sparse());
        assert_eq!(score.to_dense(), DynVector::from(vec![0.0f64, 0.5, 0.0]));
        let mask = daf.get_vector("cell", "mask").unwrap();
        assert_eq!(mask.to_dense(), DynVector::from(vec![false, true, true]));
        let umis = daf.get_matrix("cell", "gene", "UMIs").unwrap();
        assert_eq!(umis.shape(), (3, 2));
        assert_eq!(umis.get(2, 1), ScalarValue::I64(4));
        let fractions = daf.get_matrix("cell", "gene", "fractions").unwrap();
        assert!(fractions.is_sparse());
        assert_eq!(fractions.get(0, 1), ScalarValue::F32(0.5));
        assert_eq!(fractions.get(2, 0), ScalarValue::F32(0.25));

        daf.set_scalar("depth", ScalarValue::U32(18), true).unwrap();
    })
}

#[test]
fn read_mode_refuses_mutation() {
    with_tmp_path(|path| {
        let spec = path.to_str().unwrap().to_owned();
        {
            let daf = H5df::open(&spec, "w").unwrap();
            populate(&daf);
        }
        let daf = H5df::open(&spec, "r").unwrap();
        assert!(daf.frozen());
        assert_eq!(daf.get_scalar("depth").unwrap(), ScalarValue::U32(17));
        let refused = daf.set_scalar("depth", ScalarValue::U32(99), true);
        assert!(refused.is_err());
        assert!(format!("{:#}", refused.err().unwrap()).contains("read-only"));
    })
}

#[test]
fn version_markers_are_checked() {
    with_tmp_dir(|dir| {
        // A higher minor version is rejected.
        let minor = dir.join("minor.h5dfs");
        {
            let file = hdf5::File::create(&minor).unwrap();
            file.new_dataset_builder()
                .with_data([1u32, 7].as_slice())
                .create("daf")
                .unwrap();
        }
        let failure = H5df::open(minor.to_str().unwrap(), "r+");
        assert!(format!("{:#}", failure.err().unwrap()).contains("minor version"));

        // A different major version is rejected.
        let major = dir.join("major.h5dfs");
        {
            let file = hdf5::File::create(&major).unwrap();
            file.new_dataset_builder()
                .with_data([2u32, 0].as_slice())
                .create("daf")
                .unwrap();
        }
        let failure = H5df::open(major.to_str().unwrap(), "r+");
        assert!(format!("{:#}", failure.err().unwrap()).contains("major version"));

        // A group without the marker may only be opened in a create mode.
        let unmarked = dir.join("unmarked.h5dfs");
        {
            hdf5::File::create(&unmarked).unwrap();
        }
        assert!(H5df::open(unmarked.to_str().unwrap(), "r+").is_err());
        assert!(H5df::open(unmarked.to_str().unwrap(), "w+").is_ok());
    })
}

#[test]
fn nested_group_shorthand() {
    with_tmp_path(|path| {
        let spec = format!("{}#/nested/inner", path.to_str().unwrap());
        {
            let daf = H5df::open(&spec, "w+").unwrap();
            daf.set_scalar("depth", ScalarValue::U32(17), false).unwrap();
        }
        {
            let file = hdf5::File::open(&path).unwrap();
            assert!(file.link_exists("nested/inner/daf"));
            assert!(file.link_exists("nested/inner/scalars/depth"));
        }
        let daf = H5df::open(&spec, "r").unwrap();
        assert_eq!(daf.get_scalar("depth").unwrap(), ScalarValue::U32(17));
    })
}

/// Concatenate into an HDF5 destination: the bulk fills go through the
/// backend's empty buffers (mapped when the file allows it).
#[test]
fn concat_into_h5_destination() {
    with_tmp_dir(|dir| {
        let first = MemoryDaf::new("h5-concat-first");
        first.add_axis("cell", axis_entries_of(&["c1", "c2"])).unwrap();
        first
            .set_vector("cell", "umi", vec![10i64, 20].into(), false)
            .unwrap();
        first
            .set_vector("cell", "kind", vec!["t", "n"].into(), false)
            .unwrap();
        let second = MemoryDaf::new("h5-concat-second");
        second.add_axis("cell", axis_entries_of(&["c3"])).unwrap();
        second
            .set_vector("cell", "umi", vec![30i64].into(), false)
            .unwrap();
        second
            .set_vector("cell", "kind", vec!["t"].into(), false)
            .unwrap();
        let sources: Vec<Arc<dyn FormatReader>> = vec![Arc::new(first), Arc::new(second)];

        let path = dir.join("concat.h5dfs");
        let destination = H5df::open(path.to_str().unwrap(), "w").unwrap();
        let options = ConcatOptions {
            names: Some(vec!["a".to_owned(), "b".to_owned()]),
            ..ConcatOptions::default()
        };
        concatenate(&destination, &["cell"], &sources, options).unwrap();

        assert_eq!(
            destination.get_vector("cell", "umi").unwrap().to_dense(),
            DynVector::from(vec![10i64, 20, 30])
        );
        assert_eq!(
            destination.get_vector("cell", "kind").unwrap().to_dense(),
            DynVector::from(vec!["t", "n", "t"])
        );
        assert_eq!(
            destination
                .get_vector("cell", "dataset")
                .unwrap()
                .to_dense(),
            DynVector::from(vec!["a", "a", "b"])
        );
    })
}
