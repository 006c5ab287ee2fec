//! `dafs` is a storage engine for multi-axis annotated tabular data: scalar
//! properties, vectors indexed by a named axis, and 2-D matrices indexed by
//! an ordered pair of axes.
//!
//! The pieces:
//!
//! - [`data`]: the storage-scalar universe and the dynamically typed dense
//!   and compressed containers.
//! - [`layout`]: the major-axis discipline (which axis of a matrix is
//!   contiguous), relayout and transposition, and the sparse/dense
//!   storage-fraction decision.
//! - [`format`]: the trait every backend implements, plus the per-store
//!   lock, cache and version bookkeeping.
//! - [`memory`] and [`h5df`]: the in-memory backend and the HDF5 backend
//!   (with memory-mapped fill buffers).
//! - [`chain`]: several stores overlaid as one, with last-wins reads and a
//!   single tail writer.
//! - [`concat`]: merging several sources along an axis into a writer.
//! - [`readers`] / [`writers`] / [`copies`] / [`view`]: the checked
//!   high-level surface over the raw format primitives.
//!
//! ```no_run
//! use dafs::prelude::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let daf = MemoryDaf::new("example");
//! daf.add_axis("cell", vec!["c1".into(), "c2".into(), "c3".into()])?;
//! daf.set_vector("cell", "umi", vec![10u32, 20, 30].into(), false)?;
//! assert_eq!(daf.axis_length("cell")?, 3);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod chain;
pub mod concat;
pub mod copies;
pub mod data;
pub mod format;
pub mod globals;
pub mod h5df;
pub mod layout;
pub mod lock;
pub mod memory;
pub mod readers;
pub mod view;
pub mod writers;

pub mod prelude {
    pub use crate::cache::CacheClass;
    pub use crate::chain::{chain_reader, chain_writer, ChainReader, ChainWriter};
    pub use crate::concat::{concatenate, ConcatOptions, MergeAction, Prefix, PropertyKey};
    pub use crate::copies::{copy_all, copy_axis, copy_matrix, copy_scalar, copy_vector};
    pub use crate::data::{
        DynDense, DynVector, IndexWidth, MatrixData, NamedMatrix, NamedVector, ScalarType,
        ScalarValue, SparseVector, VectorData,
    };
    pub use crate::format::{FormatReader, FormatWriter};
    pub use crate::globals::{
        inefficient_action_policy, set_inefficient_action_policy, unique_name, InefficientPolicy,
    };
    pub use crate::h5df::{AccessMode, H5df};
    pub use crate::layout::{
        bestify, bestify_vector, copy_array, densify, densify_vector, major_axis, relayout,
        sparsify, sparsify_vector, transposer, MatrixAxis,
    };
    pub use crate::memory::MemoryDaf;
    pub use crate::readers::DafReader;
    pub use crate::view::{read_only, ReadOnlyView};
    pub use crate::writers::{axis_entries_of, DafWriter};
}
