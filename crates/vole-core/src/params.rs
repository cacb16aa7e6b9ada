// Parameters — The flat store behind every trainable leaf
//
// All parameters of a graph live in ONE contiguous value block and ONE
// contiguous gradient block. A parameter node is only an (offset, shape)
// slice into them. Keeping the blocks flat is what lets the communicator
// treat a replica's whole model as a single vector to shard.
//
// Adding a parameter grows both blocks: new memory is allocated, the old
// contents are copied over, and the new entry is appended at the end.
// Headers into the blocks are therefore rebuilt on every access, never
// cached across an `add`.
//
// The store is shared as Arc<Parameters>; the blocks sit behind an RwLock so
// communicator workers can reach them from other threads.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::dtype::DType;
use crate::bail;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Initial values for a new parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Init {
    Zeros,
    Ones,
    Constant(f32),
    /// Explicit values, one per element.
    Values(Vec<f32>),
}

impl Init {
    fn values(&self, n: usize) -> Result<Vec<f32>> {
        match self {
            Init::Zeros => Ok(vec![0.0; n]),
            Init::Ones => Ok(vec![1.0; n]),
            Init::Constant(v) => Ok(vec![*v; n]),
            Init::Values(v) if v.len() == n => Ok(v.clone()),
            Init::Values(v) => Err(Error::msg(format!(
                "initializer has {} values, parameter needs {}",
                v.len(),
                n
            ))),
        }
    }
}

/// One named slice of the parameter blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamEntry {
    pub name: String,
    pub offset: usize,
    pub shape: Shape,
}

#[derive(Debug)]
struct Blocks {
    vals: Tensor,
    grads: Tensor,
    entries: Vec<ParamEntry>,
}

/// Flat value and gradient storage for all parameters of a graph.
#[derive(Debug)]
pub struct Parameters {
    dtype: DType,
    blocks: RwLock<Blocks>,
}

impl Parameters {
    pub fn new(dtype: DType) -> Self {
        Parameters {
            dtype,
            blocks: RwLock::new(Blocks {
                vals: Tensor::zeros(0, dtype),
                grads: Tensor::zeros(0, dtype),
                entries: Vec::new(),
            }),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Blocks>> {
        self.blocks.read().map_err(|_| Error::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Blocks>> {
        self.blocks.write().map_err(|_| Error::LockPoisoned)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Total number of elements across all parameters.
    pub fn size(&self) -> Result<usize> {
        Ok(self.read()?.vals.size())
    }

    /// Number of parameters.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// All entries, in the order they were added.
    pub fn entries(&self) -> Result<Vec<ParamEntry>> {
        Ok(self.read()?.entries.clone())
    }

    /// Look up a parameter by name.
    pub fn get(&self, name: &str) -> Result<Option<ParamEntry>> {
        Ok(self.read()?.entries.iter().find(|e| e.name == name).cloned())
    }

    /// Append a parameter, growing both blocks. Returns its element offset.
    pub fn add(&self, name: &str, shape: Shape, init: &Init) -> Result<usize> {
        let n = shape.elem_count();
        let values = init.values(n)?;
        let mut blocks = self.write()?;
        if blocks.entries.iter().any(|e| e.name == name) {
            bail!("parameter '{name}' already exists");
        }
        let offset = blocks.vals.size();
        let total = offset + n;

        let mut vals = blocks.vals.to_vec()?;
        vals.extend_from_slice(&values);
        let mut grads = blocks.grads.to_vec()?;
        grads.resize(total, 0.0);

        blocks.vals = Tensor::from_vec(vals, total, self.dtype)?;
        blocks.grads = Tensor::from_vec(grads, total, self.dtype)?;
        blocks.entries.push(ParamEntry {
            name: name.to_string(),
            offset,
            shape,
        });
        log::debug!("param '{name}': {n} elements at offset {offset}, block now {total}");
        Ok(offset)
    }

    /// Header over the whole value block.
    pub fn vals(&self) -> Result<Tensor> {
        Ok(self.read()?.vals.clone())
    }

    /// Header over the whole gradient block.
    pub fn grads(&self) -> Result<Tensor> {
        Ok(self.read()?.grads.clone())
    }

    /// Value slice of `shape` starting at element `offset`.
    pub fn val_slice(&self, offset: usize, shape: Shape) -> Result<Tensor> {
        let vals = self.vals()?;
        let elem = self.dtype.size_in_bytes();
        vals.view_at_bytes(offset * elem, shape)
    }

    /// Gradient slice of `shape` starting at element `offset`.
    pub fn grad_slice(&self, offset: usize, shape: Shape) -> Result<Tensor> {
        let grads = self.grads()?;
        let elem = self.dtype.size_in_bytes();
        grads.view_at_bytes(offset * elem, shape)
    }

    /// Reset the whole gradient block to zero.
    pub fn zero_grads(&self) -> Result<()> {
        self.grads()?.fill(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_preserves_contents() {
        let p = Parameters::new(DType::F32);
        let a = p.add("a", Shape::from(2), &Init::Values(vec![1.0, 2.0])).unwrap();
        p.grads().unwrap().fill(7.0).unwrap();
        let b = p.add("b", Shape::from((1, 3)), &Init::Ones).unwrap();
        assert_eq!((a, b), (0, 2));
        assert_eq!(p.size().unwrap(), 5);
        assert_eq!(p.vals().unwrap().to_vec().unwrap(), vec![1.0, 2.0, 1.0, 1.0, 1.0]);
        assert_eq!(p.grads().unwrap().to_vec().unwrap(), vec![7.0, 7.0, 0.0, 0.0, 0.0]);
        let slice = p.val_slice(2, Shape::from((1, 3))).unwrap();
        assert!(slice.shares_memory(&p.vals().unwrap()));
    }

    #[test]
    fn test_duplicate_and_bad_init() {
        let p = Parameters::new(DType::F32);
        p.add("w", Shape::from(2), &Init::Zeros).unwrap();
        match p.add("w", Shape::from(2), &Init::Zeros) {
            Err(Error::Msg(m)) => assert_eq!(m, "parameter 'w' already exists"),
            other => panic!("expected a duplicate-name error, got {other:?}"),
        }
        assert!(p.add("v", Shape::from(3), &Init::Values(vec![1.0])).is_err());
        assert_eq!(p.get("w").unwrap().unwrap().offset, 0);
        assert!(p.get("v").unwrap().is_none());
    }
}
