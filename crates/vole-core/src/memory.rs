// Memory — reference-counted blocks and the tensor allocator
//
// A MemoryPiece is the unit of ownership: a tensor is only a header pointing
// into one. Several headers (a node's value, a reshape view of it, a
// parameter slice, a communicator shard) can point into the same piece; the
// piece lives as long as any header does.
//
// The element cells sit behind an RwLock so headers can be shared across the
// communicator's worker threads. Callers never hold two guards at once: read
// paths snapshot, write paths take a single write guard.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// A reference-counted block of tensor memory.
#[derive(Debug)]
pub struct MemoryPiece {
    data: RwLock<Vec<f32>>,
    dtype: DType,
}

impl MemoryPiece {
    /// Allocate a zero-filled block of `len` elements.
    pub fn new(len: usize, dtype: DType) -> Arc<Self> {
        Arc::new(MemoryPiece {
            data: RwLock::new(vec![0.0; len]),
            dtype,
        })
    }

    /// Number of elements in the block.
    pub fn len(&self) -> usize {
        // A poisoned block still has a well-defined length.
        match self.data.read() {
            Ok(d) => d.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the block in bytes.
    pub fn size(&self) -> usize {
        self.len() * self.dtype.size_in_bytes()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, Vec<f32>>> {
        self.data.read().map_err(|_| Error::LockPoisoned)
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<f32>>> {
        self.data.write().map_err(|_| Error::LockPoisoned)
    }
}

/// Hands out tensors backed by freshly reserved memory.
///
/// Without a reservation the allocator is unbounded. `reserve_exact` turns
/// the reservation into a hard budget: an allocation that does not fit fails
/// with [`Error::OutOfMemory`] instead of growing.
#[derive(Debug, Clone)]
pub struct TensorAllocator {
    dtype: DType,
    reserved: Option<usize>,
    used: usize,
}

impl TensorAllocator {
    /// Create an unbounded allocator for the given element type.
    pub fn new(dtype: DType) -> Self {
        TensorAllocator {
            dtype,
            reserved: None,
            used: 0,
        }
    }

    /// Reserve exactly `bytes` bytes; later allocations must fit in them.
    pub fn reserve_exact(&mut self, bytes: usize) {
        self.reserved = Some(bytes);
    }

    /// Bytes handed out and not yet freed.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes still available under an exact reservation.
    pub fn available(&self) -> Option<usize> {
        self.reserved.map(|r| r.saturating_sub(self.used))
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Allocate a zero-filled tensor of the given shape.
    pub fn allocate(&mut self, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        let bytes = shape.elem_count() * self.dtype.size_in_bytes();
        if let Some(reserved) = self.reserved {
            let available = reserved.saturating_sub(self.used);
            if bytes > available {
                return Err(Error::OutOfMemory {
                    requested: bytes,
                    available,
                    reserved,
                });
            }
        }
        self.used += bytes;
        let memory = MemoryPiece::new(shape.elem_count(), self.dtype);
        Tensor::new(memory, 0, shape)
    }

    /// Return a tensor's bytes to the budget.
    pub fn free(&mut self, tensor: &Tensor) {
        let bytes = tensor.size() * self.dtype.size_in_bytes();
        self.used = self.used.saturating_sub(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_exact_is_a_budget() {
        let mut alloc = TensorAllocator::new(DType::F32);
        alloc.reserve_exact(4 * 6);
        let t = alloc.allocate((2, 2)).unwrap();
        assert_eq!(t.memory().size(), 16);
        assert_eq!(alloc.available(), Some(8));
        assert!(alloc.allocate(3).is_err());
        alloc.free(&t);
        assert!(alloc.allocate(3).is_ok());
    }

    #[test]
    fn test_poisoned_block_reports_lock_error() {
        let piece = MemoryPiece::new(4, DType::F32);
        let held = Arc::clone(&piece);
        let joined = std::thread::spawn(move || {
            let _guard = held.write().unwrap();
            panic!("writer died");
        })
        .join();
        assert!(joined.is_err());

        assert_eq!(piece.len(), 4);
        assert_eq!(piece.size(), 16);
        let t = Tensor::new(Arc::clone(&piece), 0, Shape::from(4)).unwrap();
        assert!(matches!(t.to_vec(), Err(Error::LockPoisoned)));
    }

    #[test]
    fn test_unbounded_allocator() {
        let mut alloc = TensorAllocator::new(DType::F16);
        let t = alloc.allocate(1000).unwrap();
        assert_eq!(t.memory().size(), 2000);
        assert_eq!(alloc.available(), None);
    }
}
