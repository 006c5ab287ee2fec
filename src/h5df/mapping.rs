//! Memory-mapping of contiguous HDF5 datasets, used by the empty-buffer
//! allocators so that fills land directly on the backing file.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{anyhow, ensure, Result};
use memmap2::MmapOptions;

use crate::data::{MappedElement, SliceBuffer};

/// Map the storage of a freshly allocated, contiguous dataset as a typed
/// fill buffer. Fails (so the caller can fall back to a heap buffer) when
/// the dataset is chunked, unallocated, or misaligned for the element type.
pub fn map_dataset_buffer<T: MappedElement + hdf5::H5Type>(
    file_path: &Path,
    file: &hdf5::File,
    dataset: &hdf5::Dataset,
    len: usize,
) -> Result<SliceBuffer<T>> {
    ensure!(
        !dataset.is_chunked(),
        "the dataset {} is chunked and cannot be mapped",
        dataset.name()
    );
    // Push the allocation to the OS file before mapping it.
    file.flush().map_err(|error| anyhow!("{}", error))?;
    let offset = dataset.offset().ok_or_else(|| {
        anyhow!(
            "the dataset {} has no allocated storage to map",
            dataset.name()
        )
    })? as usize;
    let os_file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(file_path)
        .map_err(|error| anyhow!("{}: {}", file_path.display(), error))?;
    // The mapping covers the whole file; the typed window starts at the
    // dataset's allocation offset. Safety: the region is only written
    // through this exclusive buffer while the store's write lock is held.
    let map = unsafe {
        MmapOptions::new()
            .map_mut(&os_file)
            .map_err(|error| anyhow!("{}: {}", file_path.display(), error))?
    };
    SliceBuffer::mapped(map, offset, len)
}
