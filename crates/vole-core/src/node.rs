use std::sync::atomic::{AtomicU64, Ordering};

use crate::dtype::DType;
use crate::op::Op;
use crate::shape::Shape;
use crate::tensor::Tensor;

// Node — One operation in the expression graph
//
// Nodes live in the graph's arena and point at their children by index.
// Because children are always created first, index order is a topological
// order: forward walks it up, backward walks it down.
//
// STORAGE:
//
//   Owned  — the node allocates its own value and gradient (lazily).
//   View   — (owner, byte_offset): value and gradient are headers rebuilt on
//            every access, pointing into the owner's storage. The owner is
//            never itself a view; views of views are folded at construction.
//   Param  — element offset into the graph's flat parameter block.
//
// Only Owned nodes release memory (`destroy`). A view pointing at a Param
// node aliases the parameter block.

/// Identifies an expression graph; handles from another graph are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphId(pub(crate) u64);

impl GraphId {
    /// Generate a new unique graph ID (global atomic counter).
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        GraphId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Default for GraphId {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a node: its arena index plus the graph that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Expr {
    pub(crate) id: usize,
    pub(crate) graph: GraphId,
}

impl Expr {
    /// Arena index of the node.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn graph(&self) -> GraphId {
        self.graph
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Storage {
    Owned {
        val: Option<Tensor>,
        adj: Option<Tensor>,
    },
    View {
        owner: usize,
        byte_offset: usize,
    },
    Param {
        offset: usize,
    },
}

/// A node of the expression graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) op: Op,
    pub(crate) children: Vec<usize>,
    pub(crate) shape: Shape,
    pub(crate) dtype: DType,
    pub(crate) hash: u64,
    pub(crate) storage: Storage,
    pub(crate) trainable: bool,
    pub(crate) name: Option<String>,
}

impl Node {
    pub fn op(&self) -> &Op {
        &self.op
    }

    /// Arena indices of the children, in order.
    pub fn children(&self) -> &[usize] {
        &self.children
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// The structural hash, computed once at construction.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn type_name(&self) -> &'static str {
        self.op.type_name()
    }

    pub fn color(&self) -> &'static str {
        self.op.color()
    }

    /// Whether this node releases its storage (false for views).
    pub fn destroy(&self) -> bool {
        !matches!(self.storage, Storage::View { .. })
    }

    /// Whether gradients flow into this node.
    pub fn trainable(&self) -> bool {
        self.trainable
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// For a view, the owning node and the byte offset into its storage.
    pub fn view_of(&self) -> Option<(usize, usize)> {
        match self.storage {
            Storage::View { owner, byte_offset } => Some((owner, byte_offset)),
            _ => None,
        }
    }

    /// Same variant, same value type, identical children, equal parameters.
    pub fn equal(&self, other: &Node) -> bool {
        self.dtype == other.dtype
            && self.children == other.children
            && self.op.params_equal(&other.op)
    }
}
