use std::fmt;
use std::sync::Arc;

use crate::dtype::DType;
use crate::bail;
use crate::error::{Error, Result};
use crate::memory::MemoryPiece;
use crate::shape::Shape;

// Tensor — A thin header over shared memory
//
// A Tensor never owns elements directly. It is (memory, offset, shape): an
// element offset into a reference-counted MemoryPiece plus the shape to read
// it with. Cloning a Tensor clones the header, not the data.
//
// MEMORY MODEL:
//
//   Headers are always contiguous row-major. That is what makes reshape and
//   step free: a reshape view is the same offset with a different shape, and
//   a step view is the owner's offset plus a byte displacement.
//
//   Stores into F16/BF16 tensors round every written value through `half`,
//   so the f32 cells always hold values representable in the tensor's dtype.

/// A contiguous view `(memory, offset, shape)` into a memory block.
#[derive(Clone)]
pub struct Tensor {
    memory: Arc<MemoryPiece>,
    offset: usize,
    shape: Shape,
}

impl Tensor {
    /// Build a header over `memory` starting at element `offset`.
    pub fn new(memory: Arc<MemoryPiece>, offset: usize, shape: Shape) -> Result<Self> {
        let len = shape.elem_count();
        let capacity = memory.len();
        if offset + len > capacity {
            return Err(Error::ViewOutOfBounds {
                offset,
                len,
                capacity,
            });
        }
        Ok(Tensor {
            memory,
            offset,
            shape,
        })
    }

    /// A fresh zero-filled tensor in its own memory block.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType) -> Self {
        let shape = shape.into();
        let memory = MemoryPiece::new(shape.elem_count(), dtype);
        Tensor {
            memory,
            offset: 0,
            shape,
        }
    }

    /// A fresh tensor holding `data` (rounded to `dtype`).
    pub fn from_vec(data: Vec<f32>, shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        let t = Tensor::zeros(shape, dtype);
        t.set_values(&data)?;
        Ok(t)
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.memory.dtype()
    }

    /// Number of elements covered by this header.
    pub fn size(&self) -> usize {
        self.shape.elem_count()
    }

    pub fn memory(&self) -> &Arc<MemoryPiece> {
        &self.memory
    }

    /// Element offset of the first element within the memory block.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Byte offset of the first element within the memory block.
    pub fn byte_offset(&self) -> usize {
        self.offset * self.dtype().size_in_bytes()
    }

    /// Whether both headers point into the same memory block.
    pub fn shares_memory(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.memory, &other.memory)
    }

    // Views

    /// A 1-D header over `size` elements starting `pos` elements into this one.
    pub fn subtensor(&self, pos: usize, size: usize) -> Result<Tensor> {
        if pos + size > self.size() {
            return Err(Error::ViewOutOfBounds {
                offset: pos,
                len: size,
                capacity: self.size(),
            });
        }
        Tensor::new(self.memory.clone(), self.offset + pos, Shape::from(size))
    }

    /// A header of `shape` starting `byte_offset` bytes into this one.
    pub fn view_at_bytes(&self, byte_offset: usize, shape: Shape) -> Result<Tensor> {
        let elem = self.dtype().size_in_bytes();
        if byte_offset % elem != 0 {
            bail!(
                "byte offset {byte_offset} is not aligned to {} elements",
                self.dtype()
            );
        }
        Tensor::new(self.memory.clone(), self.offset + byte_offset / elem, shape)
    }

    /// The same elements under a different shape.
    pub fn reshaped(&self, shape: Shape) -> Result<Tensor> {
        if shape.elem_count() != self.size() {
            return Err(Error::ReshapeElementMismatch {
                src: self.size(),
                dst: shape.elem_count(),
                dst_shape: shape,
            });
        }
        Tensor::new(self.memory.clone(), self.offset, shape)
    }

    // Data access

    /// Copy the covered elements out.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        let data = self.memory.read()?;
        Ok(data[self.offset..self.offset + self.size()].to_vec())
    }

    /// Read a single element by flat index.
    pub fn get(&self, index: usize) -> Result<f32> {
        if index >= self.size() {
            return Err(Error::ViewOutOfBounds {
                offset: index,
                len: 1,
                capacity: self.size(),
            });
        }
        let data = self.memory.read()?;
        Ok(data[self.offset + index])
    }

    /// Overwrite every covered element with `values`.
    pub fn set_values(&self, values: &[f32]) -> Result<()> {
        if values.len() != self.size() {
            bail!(
                "set_values: expected {} values for shape {}, got {}",
                self.size(),
                self.shape,
                values.len()
            );
        }
        self.update(|cells| cells.copy_from_slice(values))
    }

    /// Set every covered element to `value`.
    pub fn fill(&self, value: f32) -> Result<()> {
        self.update(|cells| cells.iter_mut().for_each(|c| *c = value))
    }

    /// Copy the elements of `src` into this tensor. Sizes must match; shapes
    /// need not.
    pub fn copy_from(&self, src: &Tensor) -> Result<()> {
        if src.size() != self.size() {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                got: src.shape.clone(),
            });
        }
        let values = src.to_vec()?;
        self.update(|cells| cells.copy_from_slice(&values))
    }

    /// Mutate the covered cells in place, then round them to the dtype.
    pub(crate) fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut [f32]),
    {
        let dtype = self.dtype();
        let mut data = self.memory.write()?;
        let cells = &mut data[self.offset..self.offset + self.shape.elem_count()];
        f(cells);
        if dtype.is_half() {
            cells.iter_mut().for_each(|c| *c = dtype.round(*c));
        }
        Ok(())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, offset={})",
            self.shape,
            self.dtype(),
            self.offset
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reshaped_shares_memory() {
        let t = Tensor::from_vec((0..6).map(|v| v as f32).collect(), (2, 3), DType::F32).unwrap();
        let r = t.reshaped(Shape::from((3, 2))).unwrap();
        assert!(r.shares_memory(&t));
        r.fill(1.0).unwrap();
        assert_eq!(t.to_vec().unwrap(), vec![1.0; 6]);
        assert!(t.reshaped(Shape::from(5)).is_err());
    }

    #[test]
    fn test_subtensor_and_byte_view() {
        let t = Tensor::from_vec((0..8).map(|v| v as f32).collect(), 8, DType::F32).unwrap();
        let s = t.subtensor(2, 3).unwrap();
        assert_eq!(s.to_vec().unwrap(), vec![2.0, 3.0, 4.0]);
        let v = s.view_at_bytes(4, Shape::from(2)).unwrap();
        assert_eq!(v.to_vec().unwrap(), vec![3.0, 4.0]);
        assert!(t.subtensor(6, 3).is_err());
        assert!(t.view_at_bytes(2, Shape::from(1)).is_err());
    }

    #[test]
    fn test_copy_from_overlapping() {
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], 4, DType::F32).unwrap();
        let lo = t.subtensor(0, 2).unwrap();
        let hi = t.subtensor(2, 2).unwrap();
        lo.copy_from(&hi).unwrap();
        assert_eq!(t.to_vec().unwrap(), vec![3.0, 4.0, 3.0, 4.0]);
    }

    #[test]
    fn test_half_store_rounds() {
        let t = Tensor::zeros(1, DType::F16);
        t.set_values(&[1.0 / 3.0]).unwrap();
        assert_eq!(t.get(0).unwrap(), DType::F16.round(1.0 / 3.0));
    }
}
