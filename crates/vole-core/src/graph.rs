// ExpressionGraph — Arena of nodes, intern table, forward/backward walks
//
// Building an expression only records nodes; nothing is computed until
// forward(). Every constructor validates its arguments up front, computes
// the output shape, and hashes the new node. With interning enabled a node
// whose hash AND full structure match an existing one is not added: the
// existing handle is returned instead (common-subexpression elimination).
//
// HOW THE WALKS WORK:
//
//   Children are always created before their parents, so arena index order
//   is a topological order.
//
//   forward():   for id in 0..len, allocate the value if needed and run
//                the node's forward ops.
//
//   backward():  zero every adjoint (owned adjoints and the parameter
//                gradient block), seed the root adjoint with ones, then for
//                id in (0..=root).rev() run the node's backward ops, which
//                ACCUMULATE into the children's adjoints.
//
// ACCUMULATION: a node used by several parents receives the sum of all their
// contributions (multivariate chain rule). A view shares its owner's adjoint,
// so whatever flows into a reshape or step lands in the owner directly.
//
// Only nodes that depend on a parameter are `trainable`; everything else is
// skipped by backward() and has no adjoint.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::dtype::DType;
use crate::bail;
use crate::error::{Error, Result};
use crate::hash::hash_combine;
use crate::kernels::{masked_pool_len, PoolMode, PoolWindow};
use crate::memory::TensorAllocator;
use crate::node::{Expr, GraphId, Node, Storage};
use crate::op::{inverse_permutation, Op};
use crate::params::{Init, Parameters};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Configuration of an expression graph.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Fail with `Error::NonFinite` as soon as a node produces NaN or Inf.
    pub check_nan: bool,
    /// Coalesce structurally equal nodes (default: true).
    pub intern: bool,
    /// Value type of every node (default: F32).
    pub dtype: DType,
    /// Exact byte budget for node values and adjoints; unbounded when None.
    pub reserve_bytes: Option<usize>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            check_nan: false,
            intern: true,
            dtype: DType::F32,
            reserve_bytes: None,
        }
    }
}

impl GraphConfig {
    pub fn with_check_nan(mut self, check_nan: bool) -> Self {
        self.check_nan = check_nan;
        self
    }

    pub fn with_intern(mut self, intern: bool) -> Self {
        self.intern = intern;
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_reserve_bytes(mut self, bytes: usize) -> Self {
        self.reserve_bytes = Some(bytes);
        self
    }
}

/// A dynamically built, hash-deduplicated expression graph.
#[derive(Debug)]
pub struct ExpressionGraph {
    id: GraphId,
    config: GraphConfig,
    nodes: Vec<Node>,
    interned: HashMap<u64, Vec<usize>>,
    param_nodes: HashMap<String, usize>,
    params: Arc<Parameters>,
    allocator: TensorAllocator,
}

impl Default for ExpressionGraph {
    fn default() -> Self {
        Self::new(GraphConfig::default())
    }
}

fn owned() -> Storage {
    Storage::Owned {
        val: None,
        adj: None,
    }
}

// Leaves and reshape targets must have every dimension positive; every
// other node derives its shape from them.
fn positive(shape: &Shape) -> Result<()> {
    if shape.dims().contains(&0) {
        return Err(Error::ZeroDim {
            shape: shape.clone(),
        });
    }
    Ok(())
}

impl ExpressionGraph {
    pub fn new(config: GraphConfig) -> Self {
        let mut allocator = TensorAllocator::new(config.dtype);
        if let Some(bytes) = config.reserve_bytes {
            allocator.reserve_exact(bytes);
        }
        ExpressionGraph {
            id: GraphId::new(),
            params: Arc::new(Parameters::new(config.dtype)),
            config,
            nodes: Vec::new(),
            interned: HashMap::new(),
            param_nodes: HashMap::new(),
            allocator,
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The shared parameter store.
    pub fn params(&self) -> &Arc<Parameters> {
        &self.params
    }

    pub fn allocator(&self) -> &TensorAllocator {
        &self.allocator
    }

    /// Inspect the node behind an expression.
    pub fn node(&self, expr: Expr) -> Result<&Node> {
        let id = self.check(expr)?;
        Ok(&self.nodes[id])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Attach a debug name to a node.
    pub fn set_name(&mut self, expr: Expr, name: impl Into<String>) -> Result<()> {
        let id = self.check(expr)?;
        self.nodes[id].name = Some(name.into());
        Ok(())
    }

    fn expr(&self, id: usize) -> Expr {
        Expr { id, graph: self.id }
    }

    fn check(&self, expr: Expr) -> Result<usize> {
        if expr.graph != self.id || expr.id >= self.nodes.len() {
            return Err(Error::ForeignExpr {
                id: expr.id,
                owner: expr.graph.get(),
                graph: self.id.get(),
            });
        }
        Ok(expr.id)
    }

    fn shape_of(&self, id: usize) -> Shape {
        self.nodes[id].shape.clone()
    }

    // Construction

    /// Hash, intern and append a node.
    fn push(&mut self, op: Op, children: Vec<usize>, shape: Shape, storage: Storage) -> Expr {
        let dtype = self.config.dtype;
        let mut hash = 0u64;
        hash_combine(&mut hash, op.type_name());
        hash_combine(&mut hash, &dtype);
        for &c in &children {
            hash_combine(&mut hash, &self.nodes[c].hash);
        }
        op.hash_params(&mut hash);
        if matches!(op, Op::Constant) {
            hash_combine(&mut hash, &self.nodes.len());
        }

        let trainable = match op {
            Op::Param { .. } => true,
            Op::Constant => false,
            _ => children.iter().any(|&c| self.nodes[c].trainable),
        };
        let interning = self.config.intern && !op.is_leaf();
        let node = Node {
            op,
            children,
            shape,
            dtype,
            hash,
            storage,
            trainable,
            name: None,
        };

        if interning {
            if let Some(candidates) = self.interned.get(&hash) {
                if let Some(&id) = candidates.iter().find(|&&id| self.nodes[id].equal(&node)) {
                    log::trace!("coalesced {} into node {id}", node.type_name());
                    return self.expr(id);
                }
            }
        }

        let id = self.nodes.len();
        log::trace!("node {id}: {} {}", node.type_name(), node.shape);
        self.nodes.push(node);
        if interning {
            self.interned.entry(hash).or_default().push(id);
        }
        self.expr(id)
    }

    /// A trainable parameter. Asking again for the same name returns the
    /// existing node; the shape must match.
    pub fn param(&mut self, name: &str, shape: impl Into<Shape>, init: Init) -> Result<Expr> {
        let shape = shape.into();
        positive(&shape)?;
        if let Some(&id) = self.param_nodes.get(name) {
            if self.nodes[id].shape != shape {
                return Err(Error::ShapeMismatch {
                    expected: self.shape_of(id),
                    got: shape,
                });
            }
            return Ok(self.expr(id));
        }
        // After clear() the store still holds the parameter; reattach to it.
        let offset = match self.params.get(name)? {
            Some(entry) => {
                if entry.shape != shape {
                    return Err(Error::ShapeMismatch {
                        expected: entry.shape,
                        got: shape,
                    });
                }
                entry.offset
            }
            None => self.params.add(name, shape.clone(), &init)?,
        };
        let op = Op::Param {
            name: name.to_string(),
        };
        let expr = self.push(op, vec![], shape, Storage::Param { offset });
        self.nodes[expr.id].name = Some(name.to_string());
        self.param_nodes.insert(name.to_string(), expr.id);
        Ok(expr)
    }

    /// A leaf holding fixed `data`. Constants are never coalesced.
    pub fn constant(&mut self, shape: impl Into<Shape>, data: Vec<f32>) -> Result<Expr> {
        let shape = shape.into();
        positive(&shape)?;
        let val = self.allocator.allocate(shape.clone())?;
        val.set_values(&data)?;
        let storage = Storage::Owned {
            val: Some(val),
            adj: None,
        };
        Ok(self.push(Op::Constant, vec![], shape, storage))
    }

    fn unary(&mut self, x: Expr, op: Op) -> Result<Expr> {
        let xi = self.check(x)?;
        let shape = self.shape_of(xi);
        Ok(self.push(op, vec![xi], shape, owned()))
    }

    fn nary(&mut self, xs: &[Expr], op: Op) -> Result<Expr> {
        if xs.is_empty() {
            bail!("{} needs at least one child", op.type_name());
        }
        let ids = xs.iter().map(|&x| self.check(x)).collect::<Result<Vec<_>>>()?;
        let shapes: Vec<&Shape> = ids.iter().map(|&i| &self.nodes[i].shape).collect();
        let shape = Shape::broadcast(&shapes)?;
        Ok(self.push(op, ids, shape, owned()))
    }

    pub fn neg(&mut self, x: Expr) -> Result<Expr> {
        self.unary(x, Op::Neg)
    }

    pub fn log(&mut self, x: Expr) -> Result<Expr> {
        self.unary(x, Op::Log)
    }

    pub fn exp(&mut self, x: Expr) -> Result<Expr> {
        self.unary(x, Op::Exp)
    }

    /// `sqrt(x + eps)`.
    pub fn sqrt(&mut self, x: Expr, eps: f32) -> Result<Expr> {
        self.unary(x, Op::Sqrt { eps })
    }

    pub fn square(&mut self, x: Expr) -> Result<Expr> {
        self.unary(x, Op::Square)
    }

    pub fn sigmoid(&mut self, x: Expr) -> Result<Expr> {
        self.unary(x, Op::Sigmoid)
    }

    pub fn relu(&mut self, x: Expr) -> Result<Expr> {
        self.unary(x, Op::ReLU)
    }

    pub fn prelu(&mut self, x: Expr, alpha: f32) -> Result<Expr> {
        self.unary(x, Op::PReLU { alpha })
    }

    pub fn swish(&mut self, x: Expr) -> Result<Expr> {
        self.unary(x, Op::Swish)
    }

    /// Clamp to `[-c, c]`.
    pub fn clip(&mut self, x: Expr, c: f32) -> Result<Expr> {
        self.unary(x, Op::Clip { c })
    }

    pub fn scalar_add(&mut self, x: Expr, scalar: f32) -> Result<Expr> {
        self.unary(x, Op::ScalarAdd { scalar })
    }

    pub fn scalar_mult(&mut self, x: Expr, scalar: f32) -> Result<Expr> {
        self.unary(x, Op::ScalarMult { scalar })
    }

    /// `tanh` of the broadcast sum of `xs`.
    pub fn tanh(&mut self, xs: &[Expr]) -> Result<Expr> {
        self.nary(xs, Op::Tanh)
    }

    pub fn plus(&mut self, a: Expr, b: Expr) -> Result<Expr> {
        self.nary(&[a, b], Op::Plus)
    }

    pub fn minus(&mut self, a: Expr, b: Expr) -> Result<Expr> {
        self.nary(&[a, b], Op::Minus)
    }

    pub fn mult(&mut self, a: Expr, b: Expr) -> Result<Expr> {
        self.nary(&[a, b], Op::Mult)
    }

    pub fn div(&mut self, a: Expr, b: Expr) -> Result<Expr> {
        self.nary(&[a, b], Op::Div)
    }

    fn reduction(&mut self, x: Expr, axis: i64, mean: bool) -> Result<Expr> {
        let xi = self.check(x)?;
        let axis = self.nodes[xi].shape.axis(axis)?;
        let shape = self.nodes[xi].shape.with_dim(axis, 1);
        let op = if mean {
            Op::Mean { axis }
        } else {
            Op::Sum { axis }
        };
        Ok(self.push(op, vec![xi], shape, owned()))
    }

    /// Sum over `axis` (negative counts from the back), keeping it as size 1.
    pub fn sum(&mut self, x: Expr, axis: i64) -> Result<Expr> {
        self.reduction(x, axis, false)
    }

    /// Mean over `axis`, keeping it as size 1.
    pub fn mean(&mut self, x: Expr, axis: i64) -> Result<Expr> {
        self.reduction(x, axis, true)
    }

    pub fn softmax(&mut self, x: Expr) -> Result<Expr> {
        self.unary(x, Op::Softmax)
    }

    pub fn log_softmax(&mut self, x: Expr) -> Result<Expr> {
        self.unary(x, Op::LogSoftmax)
    }

    /// Permute axes: output dimension `i` is input dimension `axes[i]`.
    pub fn transpose(&mut self, x: Expr, axes: &[usize]) -> Result<Expr> {
        let xi = self.check(x)?;
        let in_shape = self.shape_of(xi);
        let mut seen = vec![false; in_shape.rank()];
        let valid = axes.len() == in_shape.rank()
            && axes.iter().all(|&a| a < seen.len() && !std::mem::replace(&mut seen[a], true));
        if !valid {
            return Err(Error::InvalidPermutation {
                axes: axes.to_vec(),
                shape: in_shape,
            });
        }
        let shape = Shape::new(axes.iter().map(|&a| in_shape.dims()[a]).collect());
        let op = Op::Transpose {
            axes: axes.to_vec(),
            axes_bw: inverse_permutation(axes),
        };
        Ok(self.push(op, vec![xi], shape, owned()))
    }

    /// Storage owner of `id` and the byte offset into it, folding views.
    fn view_base(&self, id: usize) -> (usize, usize) {
        match self.nodes[id].storage {
            Storage::View { owner, byte_offset } => (owner, byte_offset),
            _ => (id, 0),
        }
    }

    /// Zero-copy reshape: the result aliases `x`'s storage.
    pub fn reshape(&mut self, x: Expr, shape: impl Into<Shape>) -> Result<Expr> {
        let xi = self.check(x)?;
        let shape = shape.into();
        positive(&shape)?;
        let src = self.nodes[xi].shape.elem_count();
        if shape.elem_count() != src {
            return Err(Error::ReshapeElementMismatch {
                src,
                dst: shape.elem_count(),
                dst_shape: shape,
            });
        }
        let (owner, byte_offset) = self.view_base(xi);
        let op = Op::Reshape {
            shape: shape.clone(),
        };
        Ok(self.push(op, vec![xi], shape, Storage::View { owner, byte_offset }))
    }

    /// Zero-copy slice `index` along `axis` (kept with size 1). Every
    /// dimension before `axis` must be 1 so the slice is contiguous.
    pub fn step(&mut self, x: Expr, index: usize, axis: i64) -> Result<Expr> {
        let xi = self.check(x)?;
        let in_shape = self.shape_of(xi);
        let axis = in_shape.axis(axis)?;
        let size = in_shape.dims()[axis];
        if index >= size {
            return Err(Error::StepOutOfBounds { index, axis, size });
        }
        if in_shape.dims()[..axis].iter().any(|&d| d > 1) {
            return Err(Error::NonContiguousStep {
                axis,
                shape: in_shape,
            });
        }
        let slice_elems: usize = in_shape.dims()[axis + 1..].iter().product();
        let (owner, base) = self.view_base(xi);
        let byte_offset = base + index * slice_elems * self.config.dtype.size_in_bytes();
        let shape = in_shape.with_dim(axis, 1);
        let op = Op::Step { index, axis };
        Ok(self.push(op, vec![xi], shape, Storage::View { owner, byte_offset }))
    }

    /// Translate by `shift` (one offset per axis), filling vacated cells
    /// with `pad`. The result owns a copy.
    pub fn shift(&mut self, x: Expr, shift: &[i64], pad: f32) -> Result<Expr> {
        let xi = self.check(x)?;
        let rank = self.nodes[xi].shape.rank();
        if shift.len() != rank {
            return Err(Error::RankMismatch {
                expected: rank,
                got: shift.len(),
            });
        }
        let op = Op::Shift {
            shift: shift.to_vec(),
            pad,
        };
        self.unary(x, op)
    }

    /// 2-D pooling over the last two axes.
    pub fn pooling(&mut self, x: Expr, window: PoolWindow, mode: PoolMode) -> Result<Expr> {
        let xi = self.check(x)?;
        let in_shape = self.shape_of(xi);
        let rank = in_shape.rank();
        if rank < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: rank,
            });
        }
        let (h, w) = (in_shape.dims()[rank - 2], in_shape.dims()[rank - 1]);
        let (oh, ow) = window.output_dims(h, w).ok_or_else(|| {
            Error::msg(format!(
                "{} pooling window {}x{} (pad {}x{}, stride {}x{}) does not fit input {in_shape}",
                mode.as_str(),
                window.height,
                window.width,
                window.pad_height,
                window.pad_width,
                window.stride_height,
                window.stride_width
            ))
        })?;
        let shape = in_shape.with_dim(rank - 2, oh).with_dim(rank - 1, ow);
        Ok(self.push(Op::Pooling { window, mode }, vec![xi], shape, owned()))
    }

    /// Masked max pooling of `x: [B, D, L]` with `mask: [B, 1, L]` over
    /// windows of `width` along the last axis. With `is_even` the last
    /// position is ignored.
    pub fn pooling_with_masking(
        &mut self,
        x: Expr,
        mask: Expr,
        width: usize,
        is_even: bool,
    ) -> Result<Expr> {
        let xi = self.check(x)?;
        let mi = self.check(mask)?;
        let in_shape = self.shape_of(xi);
        if in_shape.rank() != 3 {
            return Err(Error::RankMismatch {
                expected: 3,
                got: in_shape.rank(),
            });
        }
        let (b, d, l) = (in_shape.dims()[0], in_shape.dims()[1], in_shape.dims()[2]);
        let expected = Shape::from((b, 1, l));
        if self.nodes[mi].shape != expected {
            return Err(Error::ShapeMismatch {
                expected,
                got: self.shape_of(mi),
            });
        }
        let out_len = if width == 0 {
            0
        } else {
            masked_pool_len(l, width, is_even)
        };
        if out_len == 0 {
            bail!(
                "masked pooling of width {width} over length {l} (is_even={is_even}) is empty"
            );
        }
        let op = Op::PoolingWithMasking { width, is_even };
        Ok(self.push(op, vec![xi, mi], Shape::from((b, d, out_len)), owned()))
    }

    // Access

    fn value_of(&self, id: usize) -> Result<Tensor> {
        let node = &self.nodes[id];
        match &node.storage {
            Storage::Owned { val, .. } => val.clone().ok_or(Error::NotEvaluated {
                id,
                kind: node.type_name(),
            }),
            Storage::Param { offset } => self.params.val_slice(*offset, node.shape.clone()),
            Storage::View { owner, byte_offset } => self
                .value_of(*owner)?
                .view_at_bytes(*byte_offset, node.shape.clone()),
        }
    }

    /// The adjoint of `id`, or None when it does not need one.
    fn adjoint_of(&self, id: usize) -> Result<Option<Tensor>> {
        let node = &self.nodes[id];
        if !node.trainable {
            return Ok(None);
        }
        let adj = match &node.storage {
            Storage::Owned { adj, .. } => adj.clone().ok_or(Error::NotEvaluated {
                id,
                kind: node.type_name(),
            })?,
            Storage::Param { offset } => self.params.grad_slice(*offset, node.shape.clone())?,
            Storage::View { owner, byte_offset } => match self.adjoint_of(*owner)? {
                Some(adj) => adj.view_at_bytes(*byte_offset, node.shape.clone())?,
                None => return Ok(None),
            },
        };
        Ok(Some(adj))
    }

    /// The value of an expression (after `forward()`).
    pub fn val(&self, expr: Expr) -> Result<Tensor> {
        let id = self.check(expr)?;
        self.value_of(id)
    }

    /// The gradient of an expression (after `backward()`).
    pub fn grad(&self, expr: Expr) -> Result<Tensor> {
        let id = self.check(expr)?;
        self.adjoint_of(id)?.ok_or_else(|| {
            Error::msg(format!(
                "node {id} ({}) does not depend on any parameter and has no gradient",
                self.nodes[id].type_name()
            ))
        })
    }

    fn check_finite(&self, id: usize, t: &Tensor) -> Result<()> {
        if t.to_vec()?.iter().any(|v| !v.is_finite()) {
            return Err(Error::NonFinite {
                id,
                kind: self.nodes[id].type_name(),
            });
        }
        Ok(())
    }

    // Walks

    /// Evaluate every node in creation order.
    pub fn forward(&mut self) -> Result<()> {
        log::debug!("forward: {} nodes", self.nodes.len());
        for id in 0..self.nodes.len() {
            if let Storage::Owned { val: None, .. } = self.nodes[id].storage {
                let shape = self.shape_of(id);
                let t = self.allocator.allocate(shape)?;
                if let Storage::Owned { val, .. } = &mut self.nodes[id].storage {
                    *val = Some(t);
                }
            }

            let node = &self.nodes[id];
            if node.op.is_leaf() || node.op.is_view() {
                continue;
            }
            let val = self.value_of(id)?;
            let ins = node
                .children
                .iter()
                .map(|&c| self.value_of(c))
                .collect::<Result<Vec<_>>>()?;
            for op in node.op.forward_ops(&val, &ins) {
                op()?;
            }
            log::trace!("forward node {id} ({})", node.type_name());
            if self.config.check_nan {
                self.check_finite(id, &val)?;
            }
        }
        Ok(())
    }

    /// Backpropagate from the last node, which must hold a single element.
    pub fn backward(&mut self) -> Result<()> {
        let root = match self.nodes.len() {
            0 => return Err(Error::msg("backward() on an empty graph")),
            n => n - 1,
        };
        let shape = self.shape_of(root);
        if shape.elem_count() != 1 {
            bail!(
                "backward() needs a single-element root, node {root} has shape {shape}; \
                 use backward_from() to seed a larger root with ones"
            );
        }
        self.backward_from(self.expr(root))
    }

    /// Backpropagate from `root`, seeding its whole adjoint with ones.
    pub fn backward_from(&mut self, root: Expr) -> Result<()> {
        let root = self.check(root)?;
        log::debug!("backward: root node {root}, {} nodes", root + 1);

        for id in 0..self.nodes.len() {
            if !self.nodes[id].trainable {
                continue;
            }
            let missing = match &self.nodes[id].storage {
                Storage::Owned { adj: Some(adj), .. } => {
                    adj.fill(0.0)?;
                    false
                }
                Storage::Owned { adj: None, .. } => true,
                _ => false,
            };
            if missing {
                let shape = self.shape_of(id);
                let t = self.allocator.allocate(shape)?;
                if let Storage::Owned { adj, .. } = &mut self.nodes[id].storage {
                    *adj = Some(t);
                }
            }
        }
        self.params.zero_grads()?;

        let seed = match self.adjoint_of(root)? {
            Some(seed) => seed,
            None => {
                log::debug!("backward: root node {root} does not depend on any parameter");
                return Ok(());
            }
        };
        seed.fill(1.0)?;

        for id in (0..=root).rev() {
            let node = &self.nodes[id];
            if !node.trainable || node.op.is_leaf() || node.op.is_view() {
                continue;
            }
            let val = self.value_of(id)?;
            let adj = match self.adjoint_of(id)? {
                Some(adj) => adj,
                None => continue,
            };
            if self.config.check_nan {
                self.check_finite(id, &adj)?;
            }
            let ins = node
                .children
                .iter()
                .map(|&c| self.value_of(c))
                .collect::<Result<Vec<_>>>()?;
            let grads = node
                .children
                .iter()
                .map(|&c| self.adjoint_of(c))
                .collect::<Result<Vec<_>>>()?;
            for op in node.op.backward_ops(&val, &adj, &ins, &grads) {
                op()?;
            }
            log::trace!("backward node {id} ({})", node.type_name());
        }
        Ok(())
    }

    /// Drop every node and release their storage. The parameter store is
    /// kept; expressions created before the call become invalid.
    pub fn clear(&mut self) {
        for node in &self.nodes {
            if let Storage::Owned { val, adj } = &node.storage {
                for t in val.iter().chain(adj.iter()) {
                    self.allocator.free(t);
                }
            }
        }
        log::debug!("clear: released {} nodes", self.nodes.len());
        self.nodes.clear();
        self.interned.clear();
        self.param_nodes.clear();
        self.id = GraphId::new();
    }

    /// Render the graph in Graphviz dot format.
    pub fn graphviz(&self) -> String {
        let mut out = String::from("digraph ExpressionGraph {\n");
        for (id, node) in self.nodes.iter().enumerate() {
            let label = match &node.name {
                Some(name) => format!("{} {}", node.type_name(), name),
                None => node.type_name().to_string(),
            };
            let _ = writeln!(
                out,
                "  n{id} [label=\"{label}\\n{}\", style=\"filled\", fillcolor=\"{}\"];",
                node.shape,
                node.color()
            );
            for &c in &node.children {
                let _ = writeln!(out, "  n{c} -> n{id};");
            }
        }
        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_nodes_coalesce() {
        let mut g = ExpressionGraph::default();
        let x = g.param("x", (2, 3), Init::Ones).unwrap();
        let a = g.scalar_mult(x, 2.0).unwrap();
        let b = g.scalar_mult(x, 2.0).unwrap();
        let c = g.scalar_mult(x, 3.0).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(g.len(), 3);
        assert_eq!(g.node(a).unwrap().hash(), g.node(b).unwrap().hash());
    }

    #[test]
    fn test_interning_can_be_disabled() {
        let mut g = ExpressionGraph::new(GraphConfig::default().with_intern(false));
        let x = g.param("x", 4, Init::Zeros).unwrap();
        let a = g.exp(x).unwrap();
        let b = g.exp(x).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_constants_never_coalesce() {
        let mut g = ExpressionGraph::default();
        let a = g.constant(2, vec![1.0, 2.0]).unwrap();
        let b = g.constant(2, vec![1.0, 2.0]).unwrap();
        assert_ne!(a, b);
        assert_ne!(g.node(a).unwrap().hash(), g.node(b).unwrap().hash());
    }

    #[test]
    fn test_param_by_name() {
        let mut g = ExpressionGraph::default();
        let w = g.param("w", (2, 2), Init::Constant(0.5)).unwrap();
        assert_eq!(g.param("w", (2, 2), Init::Zeros).unwrap(), w);
        assert!(g.param("w", 4, Init::Zeros).is_err());
        assert_eq!(g.node(w).unwrap().name(), Some("w"));
        // the first initializer wins
        assert_eq!(g.val(w).unwrap().to_vec().unwrap(), vec![0.5; 4]);
    }

    #[test]
    fn test_foreign_expr_rejected() {
        let mut g1 = ExpressionGraph::default();
        let mut g2 = ExpressionGraph::default();
        let x = g1.constant(1, vec![1.0]).unwrap();
        assert!(matches!(g2.neg(x), Err(Error::ForeignExpr { .. })));
    }

    #[test]
    fn test_backward_needs_scalar_root() {
        let mut g = ExpressionGraph::default();
        let x = g.param("x", 3, Init::Ones).unwrap();
        let _ = g.square(x).unwrap();
        g.forward().unwrap();
        assert!(g.backward().is_err());
    }

    #[test]
    fn test_simple_gradient() {
        // loss = sum(x * x) → grad = 2x
        let mut g = ExpressionGraph::default();
        let x = g.param("x", 3, Init::Values(vec![1.0, -2.0, 3.0])).unwrap();
        let sq = g.square(x).unwrap();
        let _loss = g.sum(sq, 0).unwrap();
        g.forward().unwrap();
        g.backward().unwrap();
        assert_eq!(g.grad(x).unwrap().to_vec().unwrap(), vec![2.0, -4.0, 6.0]);
        // a second backward starts from zero again
        g.backward().unwrap();
        assert_eq!(g.grad(x).unwrap().to_vec().unwrap(), vec![2.0, -4.0, 6.0]);
    }

    #[test]
    fn test_step_contiguity() {
        let mut g = ExpressionGraph::default();
        let x = g.constant((1, 3, 2), vec![0.0; 6]).unwrap();
        assert!(g.step(x, 2, 1).is_ok());
        assert!(g.step(x, 3, 1).is_err());
        let y = g.constant((2, 3), vec![0.0; 6]).unwrap();
        assert!(matches!(
            g.step(y, 0, 1),
            Err(Error::NonContiguousStep { .. })
        ));
    }

    #[test]
    fn test_views_of_views_fold() {
        let mut g = ExpressionGraph::default();
        let x = g.constant((1, 4, 2), (0..8).map(|v| v as f32).collect()).unwrap();
        let s = g.step(x, 1, 1).unwrap();
        let r = g.reshape(s, 2).unwrap();
        assert_eq!(g.node(r).unwrap().view_of(), Some((x.id(), 8)));
        assert!(!g.node(r).unwrap().destroy());
        g.forward().unwrap();
        assert_eq!(g.val(r).unwrap().to_vec().unwrap(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_check_nan() {
        let mut g = ExpressionGraph::new(GraphConfig::default().with_check_nan(true));
        let x = g.constant(1, vec![-1.0]).unwrap();
        let _ = g.log(x).unwrap();
        assert!(matches!(g.forward(), Err(Error::NonFinite { .. })));
    }

    #[test]
    fn test_reserve_budget() {
        let mut g = ExpressionGraph::new(GraphConfig::default().with_reserve_bytes(16));
        let x = g.constant(4, vec![1.0; 4]).unwrap();
        let _ = g.exp(x).unwrap();
        assert!(matches!(g.forward(), Err(Error::OutOfMemory { .. })));
    }

    #[test]
    fn test_clear_keeps_params() {
        let mut g = ExpressionGraph::default();
        let w = g.param("w", 2, Init::Values(vec![3.0, 4.0])).unwrap();
        g.clear();
        assert!(g.is_empty());
        assert!(g.val(w).is_err());
        let w2 = g.param("w", 2, Init::Zeros).unwrap();
        assert_eq!(g.val(w2).unwrap().to_vec().unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_graphviz() {
        let mut g = ExpressionGraph::default();
        let w = g.param("w", 2, Init::Ones).unwrap();
        let _ = g.exp(w).unwrap();
        let dot = g.graphviz();
        assert!(dot.contains("param w"));
        assert!(dot.contains("n0 -> n1;"));
    }
}
