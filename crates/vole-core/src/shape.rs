use std::fmt;

use crate::error::{Error, Result};

// Shape — N-dimensional shape of a node or tensor
//
// A Shape is an ordered list of positive dimension sizes. Besides the
// element count and row-major strides it answers the two questions the
// node variants keep asking:
//
//   1. Which concrete axis does a (possibly negative) axis argument name?
//      axis(-1) on [2, 3, 4] is 2, axis(-3) is 0.
//
//   2. Where does an element of a broadcast result live in a smaller input?
//      Shapes are aligned from the right; an input dimension of size 1 (or a
//      missing leading dimension) always maps to index 0.

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    /// A scalar shape [] has 1 element.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Size of the last dimension (1 for a scalar shape).
    pub fn back(&self) -> usize {
        self.0.last().copied().unwrap_or(1)
    }

    /// Compute the contiguous (row-major / C-order) strides for this shape.
    ///
    /// For shape [2, 3, 4], strides are [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::AxisOutOfRange {
            axis: d as i64,
            rank: self.rank(),
        })
    }

    /// Resolve a possibly-negative axis index against this shape's rank.
    pub fn axis(&self, axis: i64) -> Result<usize> {
        let rank = self.rank() as i64;
        let resolved = if axis < 0 { axis + rank } else { axis };
        if resolved < 0 || resolved >= rank {
            return Err(Error::AxisOutOfRange {
                axis,
                rank: self.rank(),
            });
        }
        Ok(resolved as usize)
    }

    /// Return a copy with dimension `axis` replaced by `size`.
    pub fn with_dim(&self, axis: usize, size: usize) -> Shape {
        let mut dims = self.0.clone();
        dims[axis] = size;
        Shape(dims)
    }

    // Broadcasting

    /// Compute the broadcast output shape of any number of shapes.
    ///
    /// NumPy-style rules: align from the right, dimensions are compatible if
    /// equal or one of them is 1, missing leading dimensions count as 1.
    ///
    ///   [3, 4] and [4]        → [3, 4]
    ///   [2, 1] and [1, 3]     → [2, 3]
    ///   [3] and [4]           → Error
    pub fn broadcast(shapes: &[&Shape]) -> Result<Shape> {
        let max_rank = shapes.iter().map(|s| s.rank()).max().unwrap_or(0);
        let mut result = vec![1usize; max_rank];
        let mut witness: Vec<&Shape> = vec![shapes.first().copied().unwrap_or(&EMPTY); max_rank];

        for shape in shapes {
            let offset = max_rank - shape.rank();
            for (i, &d) in shape.dims().iter().enumerate() {
                let slot = &mut result[offset + i];
                if *slot == d || d == 1 {
                    continue;
                }
                if *slot == 1 {
                    *slot = d;
                    witness[offset + i] = shape;
                } else {
                    return Err(Error::BroadcastMismatch {
                        lhs: witness[offset + i].clone(),
                        rhs: (*shape).clone(),
                    });
                }
            }
        }
        Ok(Shape(result))
    }

    /// Decompose a flat row-major index into per-dimension coordinates.
    pub fn coords(&self, mut index: usize, out: &mut [usize]) {
        for i in (0..self.rank()).rev() {
            let d = self.0[i];
            out[i] = index % d;
            index /= d;
        }
    }

    /// Flat index into this shape for coordinates of a (larger or equal rank)
    /// broadcast shape. Size-1 and missing dimensions map to coordinate 0.
    pub fn bindex(&self, full_coords: &[usize]) -> usize {
        let offset = full_coords.len() - self.rank();
        let mut flat = 0;
        for (i, &d) in self.0.iter().enumerate() {
            let c = if d == 1 { 0 } else { full_coords[offset + i] };
            flat = flat * d + c;
        }
        flat
    }
}

static EMPTY: Shape = Shape(Vec::new());

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// Convenient From implementations
// These let you write: Shape::from((3, 4)) instead of Shape::new(vec![3, 4])

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(s: [usize; N]) -> Self {
        Shape(s.to_vec())
    }
}
