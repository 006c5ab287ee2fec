use std::marker::PhantomData;
use std::mem;

use anyhow::{anyhow, ensure, Result};
use memmap2::MmapMut;

use super::{dispatch_scalar_type, Element, IndexWidth, ScalarType};
use crate::data::DynVector;

/// Element types that may live in a memory-mapped region: fixed-size numerics
/// whose every bit pattern is a valid value. `bool` and `String` stay on the
/// heap.
pub trait MappedElement: Element + Copy {}

impl MappedElement for i8 {}
impl MappedElement for i16 {}
impl MappedElement for i32 {}
impl MappedElement for i64 {}
impl MappedElement for u8 {}
impl MappedElement for u16 {}
impl MappedElement for u32 {}
impl MappedElement for u64 {}
impl MappedElement for f32 {}
impl MappedElement for f64 {}

/// A typed window into a writable memory map. The map is owned by the slice,
/// so the view stays valid for exactly as long as the fill is alive; closing
/// or repacking the store invalidates any pointers derived from it, which is
/// why fills must be committed before the store is touched again.
pub struct MappedSlice<T> {
    map: MmapMut,
    byte_offset: usize,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: MappedElement> MappedSlice<T> {
    pub fn new(map: MmapMut, byte_offset: usize, len: usize) -> Result<MappedSlice<T>> {
        MappedSlice::new_unchecked_type(map, byte_offset, len)
    }
}

impl<T: Element> MappedSlice<T> {
    fn new_unchecked_type(map: MmapMut, byte_offset: usize, len: usize) -> Result<MappedSlice<T>> {
        let bytes = len * mem::size_of::<T>();
        ensure!(
            byte_offset + bytes <= map.len(),
            "mapped region of {} bytes cannot hold {} elements at offset {}",
            map.len(),
            len,
            byte_offset
        );
        ensure!(
            (map.as_ptr() as usize + byte_offset) % mem::align_of::<T>() == 0,
            "mapped region is not aligned for the element type"
        );
        Ok(MappedSlice {
            map,
            byte_offset,
            len,
            _marker: PhantomData,
        })
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let bytes = self.len * mem::size_of::<T>();
        let window = &mut self.map[self.byte_offset..self.byte_offset + bytes];
        // Alignment was checked at construction; every bit pattern of a
        // MappedElement is valid.
        let (head, slice, _tail) = unsafe { window.align_to_mut::<T>() };
        debug_assert!(head.is_empty());
        &mut slice[..self.len]
    }

    pub fn as_slice(&self) -> &[T] {
        let bytes = self.len * mem::size_of::<T>();
        let window = &self.map[self.byte_offset..self.byte_offset + bytes];
        let (head, slice, _tail) = unsafe { window.align_to::<T>() };
        debug_assert!(head.is_empty());
        &slice[..self.len]
    }

    pub fn flush(&self) -> Result<()> {
        self.map.flush().map_err(|error| anyhow!("{}", error))
    }
}

/// The backing of one fill buffer: a heap vector flushed by the backend when
/// the fill is committed, or a memory-mapped window already sitting on the
/// final storage.
pub enum SliceBuffer<T> {
    Heap(Vec<T>),
    Mapped(MappedSlice<T>),
}

impl<T: Element> SliceBuffer<T> {
    pub fn heap(len: usize, zero: T) -> SliceBuffer<T> {
        SliceBuffer::Heap(vec![zero; len])
    }

    pub fn len(&self) -> usize {
        match self {
            SliceBuffer::Heap(values) => values.len(),
            SliceBuffer::Mapped(mapped) => mapped.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match self {
            SliceBuffer::Heap(values) => values.as_mut_slice(),
            SliceBuffer::Mapped(mapped) => mapped.as_mut_slice(),
        }
    }

    pub fn as_slice(&self) -> &[T] {
        match self {
            SliceBuffer::Heap(values) => values.as_slice(),
            SliceBuffer::Mapped(mapped) => mapped.as_slice(),
        }
    }

    /// The heap payload to be flushed by the backend, or `None` if the data
    /// is already in place behind a map (which is synced here).
    pub fn into_heap(self) -> Result<Option<Vec<T>>> {
        match self {
            SliceBuffer::Heap(values) => Ok(Some(values)),
            SliceBuffer::Mapped(mapped) => {
                mapped.flush()?;
                Ok(None)
            }
        }
    }
}

impl<T: MappedElement> SliceBuffer<T> {
    pub fn mapped(map: MmapMut, byte_offset: usize, len: usize) -> Result<SliceBuffer<T>> {
        Ok(SliceBuffer::Mapped(MappedSlice::new(map, byte_offset, len)?))
    }
}

/// A fill buffer for element data, one variant per storage scalar type.
/// `Bool` and `Str` fills are always heap backed.
pub enum DynBuffer {
    I8(SliceBuffer<i8>),
    I16(SliceBuffer<i16>),
    I32(SliceBuffer<i32>),
    I64(SliceBuffer<i64>),
    U8(SliceBuffer<u8>),
    U16(SliceBuffer<u16>),
    U32(SliceBuffer<u32>),
    U64(SliceBuffer<u64>),
    F32(SliceBuffer<f32>),
    F64(SliceBuffer<f64>),
    Bool(SliceBuffer<bool>),
    Str(SliceBuffer<String>),
}

macro_rules! with_dyn_buffer {
    ($value:expr, |$b:ident| $body:expr) => {
        match $value {
            $crate::data::DynBuffer::I8($b) => $body,
            $crate::data::DynBuffer::I16($b) => $body,
            $crate::data::DynBuffer::I32($b) => $body,
            $crate::data::DynBuffer::I64($b) => $body,
            $crate::data::DynBuffer::U8($b) => $body,
            $crate::data::DynBuffer::U16($b) => $body,
            $crate::data::DynBuffer::U32($b) => $body,
            $crate::data::DynBuffer::U64($b) => $body,
            $crate::data::DynBuffer::F32($b) => $body,
            $crate::data::DynBuffer::F64($b) => $body,
            $crate::data::DynBuffer::Bool($b) => $body,
            $crate::data::DynBuffer::Str($b) => $body,
        }
    };
}

pub(crate) use with_dyn_buffer;

impl DynBuffer {
    /// A zero-initialized heap buffer of the given type and length.
    pub fn heap(element_type: ScalarType, len: usize) -> DynBuffer {
        dispatch_scalar_type!(element_type, T => {
            <T as Element>::wrap_buffer(SliceBuffer::heap(len, <T as Element>::zero_element()))
        })
    }

    pub fn len(&self) -> usize {
        with_dyn_buffer!(self, |buffer| buffer.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            DynBuffer::I8(_) => ScalarType::I8,
            DynBuffer::I16(_) => ScalarType::I16,
            DynBuffer::I32(_) => ScalarType::I32,
            DynBuffer::I64(_) => ScalarType::I64,
            DynBuffer::U8(_) => ScalarType::U8,
            DynBuffer::U16(_) => ScalarType::U16,
            DynBuffer::U32(_) => ScalarType::U32,
            DynBuffer::U64(_) => ScalarType::U64,
            DynBuffer::F32(_) => ScalarType::F32,
            DynBuffer::F64(_) => ScalarType::F64,
            DynBuffer::Bool(_) => ScalarType::Bool,
            DynBuffer::Str(_) => ScalarType::Str,
        }
    }

    /// The committed contents as a dense vector, when heap backed.
    /// Mapped buffers return `None` after syncing; their bytes are already
    /// the stored representation.
    pub fn into_dense(self) -> Result<Option<DynVector>> {
        with_dyn_buffer!(self, |buffer| Ok(buffer
            .into_heap()?
            .map(Element::dyn_from_vec)))
    }
}

/// A fill buffer for the integer indices of a compressed representation,
/// at the on-disk width. Values written through it are 1-based.
pub enum IndexBuffer {
    I8(SliceBuffer<i8>),
    I16(SliceBuffer<i16>),
    I32(SliceBuffer<i32>),
    I64(SliceBuffer<i64>),
}

macro_rules! with_index_buffer {
    ($value:expr, |$b:ident| $body:expr) => {
        match $value {
            $crate::data::IndexBuffer::I8($b) => $body,
            $crate::data::IndexBuffer::I16($b) => $body,
            $crate::data::IndexBuffer::I32($b) => $body,
            $crate::data::IndexBuffer::I64($b) => $body,
        }
    };
}

pub(crate) use with_index_buffer;

impl IndexBuffer {
    pub fn heap(width: IndexWidth, len: usize) -> IndexBuffer {
        match width {
            IndexWidth::I8 => IndexBuffer::I8(SliceBuffer::heap(len, 0)),
            IndexWidth::I16 => IndexBuffer::I16(SliceBuffer::heap(len, 0)),
            IndexWidth::I32 => IndexBuffer::I32(SliceBuffer::heap(len, 0)),
            IndexWidth::I64 => IndexBuffer::I64(SliceBuffer::heap(len, 0)),
        }
    }

    pub fn width(&self) -> IndexWidth {
        match self {
            IndexBuffer::I8(_) => IndexWidth::I8,
            IndexBuffer::I16(_) => IndexWidth::I16,
            IndexBuffer::I32(_) => IndexWidth::I32,
            IndexBuffer::I64(_) => IndexWidth::I64,
        }
    }

    pub fn len(&self) -> usize {
        with_index_buffer!(self, |buffer| buffer.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write 1-based index values starting at `start`, checking that each
    /// fits the buffer's width.
    pub fn write_indices(
        &mut self,
        start: usize,
        values: impl Iterator<Item = usize>,
    ) -> Result<()> {
        with_index_buffer!(self, |buffer| {
            let slice = buffer.as_mut_slice();
            for (position, value) in values.enumerate() {
                slice[start + position] = num::NumCast::from(value).ok_or_else(|| {
                    anyhow!("the index {} does not fit the declared index width", value)
                })?;
            }
            Ok(())
        })
    }

    /// Read the buffer back as 1-based values.
    pub fn to_one_based(&self) -> Vec<usize> {
        with_index_buffer!(self, |buffer| {
            buffer
                .as_slice()
                .iter()
                .map(|value| *value as usize)
                .collect()
        })
    }

    /// Read the buffer back as 0-based positions.
    pub fn to_zero_based(&self) -> Vec<usize> {
        with_index_buffer!(self, |buffer| {
            buffer
                .as_slice()
                .iter()
                .map(|value| (*value as usize).saturating_sub(1))
                .collect()
        })
    }

    /// The committed heap payload, if any (see [`SliceBuffer::into_heap`]).
    pub fn into_heap_parts(self) -> Result<Option<IndexHeap>> {
        match self {
            IndexBuffer::I8(buffer) => Ok(buffer.into_heap()?.map(IndexHeap::I8)),
            IndexBuffer::I16(buffer) => Ok(buffer.into_heap()?.map(IndexHeap::I16)),
            IndexBuffer::I32(buffer) => Ok(buffer.into_heap()?.map(IndexHeap::I32)),
            IndexBuffer::I64(buffer) => Ok(buffer.into_heap()?.map(IndexHeap::I64)),
        }
    }
}

/// Owned index data at the on-disk width, produced by committing a heap
/// backed [`IndexBuffer`].
pub enum IndexHeap {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_buffer_round_trip() {
        let mut buffer = DynBuffer::heap(ScalarType::I32, 3);
        assert_eq!(buffer.scalar_type(), ScalarType::I32);
        <i32 as Element>::buffer_mut(&mut buffer)
            .unwrap()
            .copy_from_slice(&[7, 8, 9]);
        let dense = buffer.into_dense().unwrap().unwrap();
        assert_eq!(dense, DynVector::from(vec![7i32, 8, 9]));
    }

    #[test]
    fn index_buffer_checks_width() {
        let mut buffer = IndexBuffer::heap(IndexWidth::I8, 2);
        assert!(buffer.write_indices(0, [1usize, 127].into_iter()).is_ok());
        assert_eq!(buffer.to_one_based(), vec![1, 127]);
        assert_eq!(buffer.to_zero_based(), vec![0, 126]);
        let mut narrow = IndexBuffer::heap(IndexWidth::I8, 1);
        assert!(narrow.write_indices(0, [200usize].into_iter()).is_err());
    }
}
