// Op — The node variants of the expression graph
//
// Every node records WHAT it computes via the Op enum. The graph owns the
// wiring (children, shapes, storage); an Op only knows how to turn tensors
// into work:
//
//   forward_ops(val, ins)               → closures that fully populate `val`
//   backward_ops(val, adj, ins, grads)  → closures that ADD into child grads
//
// Backward closures always accumulate. A child feeding several parents
// receives one contribution from each, and a broadcast child receives the
// sum over the broadcast dimensions (kernels::add reduces onto the target).
//
// Example: y = tanh(a + b) with b broadcast along rows
//   forward:  y = tanh(a + b)
//   backward: grad_a += adj * (1 - y²)
//             grad_b += Σ_rows adj * (1 - y²)
//
// View variants (Reshape, Step) produce no ops at all: their value and
// gradient are headers into the owner's memory, so the owner's gradient
// already receives whatever is accumulated through the view.

use crate::hash::{hash_combine, hash_f32};
use crate::kernels::{self, PoolMode, PoolWindow};
use crate::error::Result;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// A deferred tensor operation produced by a node.
pub type NodeOp = Box<dyn FnOnce() -> Result<()> + Send>;

/// The node variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Trainable leaf: a slice of the graph's parameter block.
    Param { name: String },
    /// Leaf holding fixed data.
    Constant,

    // Unary elementwise
    Neg,
    Log,
    Exp,
    Sqrt { eps: f32 },
    Square,
    Sigmoid,
    ReLU,
    PReLU { alpha: f32 },
    Swish,
    Clip { c: f32 },
    ScalarAdd { scalar: f32 },
    ScalarMult { scalar: f32 },

    /// tanh of the broadcast sum of one or more children.
    Tanh,

    // Binary elementwise, broadcasting
    Plus,
    Minus,
    Mult,
    Div,

    // Reductions over one resolved axis (kept with size 1)
    Sum { axis: usize },
    Mean { axis: usize },

    // Row-wise over the last axis
    Softmax,
    LogSoftmax,

    /// `axes_bw` is the inverse permutation, precomputed at construction.
    Transpose {
        axes: Vec<usize>,
        axes_bw: Vec<usize>,
    },

    // Views
    Reshape { shape: Shape },
    Step { index: usize, axis: usize },

    Shift { shift: Vec<i64>, pad: f32 },
    Pooling { window: PoolWindow, mode: PoolMode },
    /// Children: `[x, mask]`.
    PoolingWithMasking { width: usize, is_even: bool },
}

fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn node_op(f: impl FnOnce() -> Result<()> + Send + 'static) -> NodeOp {
    Box::new(f)
}

/// Forward op `val = f(x)` for a unary elementwise variant.
fn unary(val: &Tensor, x: &Tensor, f: impl Fn(f32) -> f32 + Send + 'static) -> NodeOp {
    let (val, x) = (val.clone(), x.clone());
    Box::new(move || kernels::element(&val, &[&x], |_, a| f(a[0])))
}

/// Backward op `grad += scale * f(ins...)`, reduced onto the shape of `grad`.
fn accumulate(
    grad: &Tensor,
    ins: &[&Tensor],
    scale: f32,
    f: impl Fn(&[f32]) -> f32 + Send + 'static,
) -> NodeOp {
    let grad = grad.clone();
    let ins: Vec<Tensor> = ins.iter().map(|t| (*t).clone()).collect();
    Box::new(move || {
        let refs: Vec<&Tensor> = ins.iter().collect();
        kernels::add(&grad, &refs, scale, f)
    })
}

impl Op {
    /// Tag naming the variant; folded into the structural hash.
    pub fn type_name(&self) -> &'static str {
        match self {
            Op::Param { .. } => "param",
            Op::Constant => "const",
            Op::Neg => "-",
            Op::Log => "log",
            Op::Exp => "exp",
            Op::Sqrt { .. } => "sqrt",
            Op::Square => "square",
            Op::Sigmoid => "sigmoid",
            Op::ReLU => "ReLU",
            Op::PReLU { .. } => "PReLU",
            Op::Swish => "swish",
            Op::Clip { .. } => "clip",
            Op::ScalarAdd { .. } => "scalar_add",
            Op::ScalarMult { .. } => "scalar_mult",
            Op::Tanh => "tanh",
            Op::Plus => "+",
            Op::Minus => "minus",
            Op::Mult => "×",
            Op::Div => "÷",
            Op::Sum { .. } => "sum",
            Op::Mean { .. } => "mean",
            Op::Softmax => "softmax",
            Op::LogSoftmax => "logsoftmax",
            Op::Transpose { .. } => "transpose",
            Op::Reshape { .. } => "reshape",
            Op::Step { .. } => "step",
            Op::Shift { .. } => "shift",
            Op::Pooling { .. } => "layer_pooling",
            Op::PoolingWithMasking { .. } => "layer_pooling_masked",
        }
    }

    /// Diagnostic colour used when rendering the graph.
    pub fn color(&self) -> &'static str {
        match self {
            Op::Param { .. } => "orangered",
            Op::Constant => "white",
            Op::Reshape { .. } | Op::Step { .. } => "grey",
            Op::Sum { .. } | Op::Mean { .. } | Op::Transpose { .. } => "orange",
            Op::Plus | Op::Minus | Op::Mult | Op::Div => "orange",
            _ => "yellow",
        }
    }

    /// Leaves are never coalesced with other nodes.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Op::Param { .. } | Op::Constant)
    }

    /// Views alias another node's memory instead of owning storage.
    pub fn is_view(&self) -> bool {
        matches!(self, Op::Reshape { .. } | Op::Step { .. })
    }

    /// Fold this variant's parameters into `seed`.
    pub fn hash_params(&self, seed: &mut u64) {
        match self {
            Op::Param { name } => hash_combine(seed, name.as_str()),
            Op::Sqrt { eps } => hash_f32(seed, *eps),
            Op::PReLU { alpha } => hash_f32(seed, *alpha),
            Op::Clip { c } => hash_f32(seed, *c),
            Op::ScalarAdd { scalar } | Op::ScalarMult { scalar } => hash_f32(seed, *scalar),
            Op::Sum { axis } | Op::Mean { axis } => hash_combine(seed, axis),
            Op::Transpose { axes, .. } => {
                for a in axes {
                    hash_combine(seed, a);
                }
            }
            Op::Reshape { shape } => {
                for d in shape.dims() {
                    hash_combine(seed, d);
                }
            }
            Op::Step { index, axis } => {
                hash_combine(seed, index);
                hash_combine(seed, axis);
            }
            Op::Shift { shift, pad } => {
                for s in shift {
                    hash_combine(seed, s);
                }
                hash_f32(seed, *pad);
            }
            Op::Pooling { window, mode } => {
                hash_combine(seed, window);
                hash_combine(seed, mode);
            }
            Op::PoolingWithMasking { width, is_even } => {
                hash_combine(seed, width);
                hash_combine(seed, is_even);
            }
            _ => {}
        }
    }

    /// Same variant with equal parameters.
    pub fn params_equal(&self, other: &Op) -> bool {
        self == other
    }

    /// Closures computing `val` from the children's values `ins`.
    pub fn forward_ops(&self, val: &Tensor, ins: &[Tensor]) -> Vec<NodeOp> {
        match self {
            Op::Param { .. } | Op::Constant | Op::Reshape { .. } | Op::Step { .. } => vec![],
            Op::Neg => vec![unary(val, &ins[0], |x| -x)],
            Op::Log => vec![unary(val, &ins[0], |x| x.ln())],
            Op::Exp => vec![unary(val, &ins[0], |x| x.exp())],
            Op::Sqrt { eps } => {
                let eps = *eps;
                vec![unary(val, &ins[0], move |x| (x + eps).sqrt())]
            }
            Op::Square => vec![unary(val, &ins[0], |x| x * x)],
            Op::Sigmoid => vec![unary(val, &ins[0], sigmoid)],
            Op::ReLU => vec![unary(val, &ins[0], |x| x.max(0.0))],
            Op::PReLU { alpha } => {
                let alpha = *alpha;
                vec![unary(val, &ins[0], move |x| if x > 0.0 { x } else { alpha * x })]
            }
            Op::Swish => vec![unary(val, &ins[0], |x| x * sigmoid(x))],
            Op::Clip { c } => {
                let c = *c;
                vec![unary(val, &ins[0], move |x| x.clamp(-c, c))]
            }
            Op::ScalarAdd { scalar } => {
                let k = *scalar;
                vec![unary(val, &ins[0], move |x| x + k)]
            }
            Op::ScalarMult { scalar } => {
                let k = *scalar;
                vec![unary(val, &ins[0], move |x| k * x)]
            }
            Op::Tanh => {
                let (val, ins) = (val.clone(), ins.to_vec());
                vec![node_op(move || {
                    let refs: Vec<&Tensor> = ins.iter().collect();
                    kernels::element(&val, &refs, |_, a| a.iter().sum::<f32>().tanh())
                })]
            }
            Op::Plus | Op::Minus | Op::Mult | Op::Div => {
                let f: fn(f32, f32) -> f32 = match self {
                    Op::Plus => |a, b| a + b,
                    Op::Minus => |a, b| a - b,
                    Op::Mult => |a, b| a * b,
                    _ => |a, b| a / b,
                };
                let (val, a, b) = (val.clone(), ins[0].clone(), ins[1].clone());
                vec![node_op(move || {
                    kernels::element(&val, &[&a, &b], |_, x| f(x[0], x[1]))
                })]
            }
            Op::Sum { .. } | Op::Mean { .. } => {
                let scale = match self {
                    Op::Mean { axis } => 1.0 / ins[0].shape().dims()[*axis] as f32,
                    _ => 1.0,
                };
                let (val, x) = (val.clone(), ins[0].clone());
                vec![node_op(move || kernels::reduce(&val, &[&x], scale, |a| a[0]))]
            }
            Op::Softmax => {
                let (val, x) = (val.clone(), ins[0].clone());
                vec![node_op(move || kernels::softmax(&val, &x))]
            }
            Op::LogSoftmax => {
                let (val, x) = (val.clone(), ins[0].clone());
                vec![node_op(move || kernels::log_softmax(&val, &x))]
            }
            Op::Transpose { axes, .. } => {
                let (val, x, axes) = (val.clone(), ins[0].clone(), axes.clone());
                vec![node_op(move || kernels::transpose_nd(&val, &x, &axes))]
            }
            Op::Shift { shift, pad } => {
                let (val, x, shift, pad) = (val.clone(), ins[0].clone(), shift.clone(), *pad);
                vec![node_op(move || kernels::shift(&val, &x, &shift, pad))]
            }
            Op::Pooling { window, mode } => {
                let (val, x, window, mode) = (val.clone(), ins[0].clone(), *window, *mode);
                vec![node_op(move || kernels::pool2d(&val, &x, &window, mode))]
            }
            Op::PoolingWithMasking { width, is_even } => {
                let (val, x, mask) = (val.clone(), ins[0].clone(), ins[1].clone());
                let (width, is_even) = (*width, *is_even);
                vec![node_op(move || {
                    kernels::pooling_with_masking(&val, &x, &mask, width, is_even)
                })]
            }
        }
    }

    /// Closures adding this node's contribution to its children's gradients.
    ///
    /// `grads[i]` is None for a child that does not need a gradient; no op is
    /// produced for it.
    pub fn backward_ops(
        &self,
        val: &Tensor,
        adj: &Tensor,
        ins: &[Tensor],
        grads: &[Option<Tensor>],
    ) -> Vec<NodeOp> {
        let mut ops: Vec<NodeOp> = Vec::new();
        let g0 = grads.first().and_then(|g| g.as_ref());
        match self {
            Op::Param { .. } | Op::Constant | Op::Reshape { .. } | Op::Step { .. } => {}
            Op::Neg => {
                if let Some(g) = g0 {
                    ops.push(accumulate(g, &[adj], 1.0, |a| -a[0]));
                }
            }
            Op::Log => {
                if let Some(g) = g0 {
                    ops.push(accumulate(g, &[adj, &ins[0]], 1.0, |a| a[0] / a[1]));
                }
            }
            Op::Exp => {
                if let Some(g) = g0 {
                    ops.push(accumulate(g, &[adj, val], 1.0, |a| a[0] * a[1]));
                }
            }
            Op::Sqrt { .. } => {
                if let Some(g) = g0 {
                    ops.push(accumulate(g, &[adj, val], 1.0, |a| 0.5 * (1.0 / a[1]) * a[0]));
                }
            }
            Op::Square => {
                if let Some(g) = g0 {
                    ops.push(accumulate(g, &[adj, &ins[0]], 1.0, |a| 2.0 * a[1] * a[0]));
                }
            }
            Op::Sigmoid => {
                if let Some(g) = g0 {
                    ops.push(accumulate(g, &[adj, val], 1.0, |a| a[0] * a[1] * (1.0 - a[1])));
                }
            }
            Op::ReLU => {
                if let Some(g) = g0 {
                    ops.push(accumulate(g, &[adj, &ins[0]], 1.0, |a| {
                        if a[1] > 0.0 {
                            a[0]
                        } else {
                            0.0
                        }
                    }));
                }
            }
            Op::PReLU { alpha } => {
                if let Some(g) = g0 {
                    let alpha = *alpha;
                    ops.push(accumulate(g, &[adj, &ins[0]], 1.0, move |a| {
                        a[0] * if a[1] > 0.0 { 1.0 } else { alpha }
                    }));
                }
            }
            Op::Swish => {
                if let Some(g) = g0 {
                    ops.push(accumulate(g, &[adj, &ins[0], val], 1.0, |a| {
                        a[0] * (a[2] + sigmoid(a[1]) * (1.0 - a[2]))
                    }));
                }
            }
            Op::Clip { c } => {
                if let Some(g) = g0 {
                    let c = *c;
                    ops.push(accumulate(g, &[adj, &ins[0]], 1.0, move |a| {
                        if a[1].abs() < c {
                            a[0]
                        } else {
                            0.0
                        }
                    }));
                }
            }
            Op::ScalarAdd { .. } => {
                if let Some(g) = g0 {
                    ops.push(accumulate(g, &[adj], 1.0, |a| a[0]));
                }
            }
            Op::ScalarMult { scalar } => {
                if let Some(g) = g0 {
                    ops.push(accumulate(g, &[adj], *scalar, |a| a[0]));
                }
            }
            Op::Tanh => {
                for g in grads.iter().flatten() {
                    ops.push(accumulate(g, &[adj, val], 1.0, |a| a[0] * (1.0 - a[1] * a[1])));
                }
            }
            Op::Plus | Op::Minus | Op::Mult | Op::Div => {
                let (a, b) = (&ins[0], &ins[1]);
                let g1 = grads.get(1).and_then(|g| g.as_ref());
                match self {
                    Op::Plus => {
                        if let Some(g) = g0 {
                            ops.push(accumulate(g, &[adj], 1.0, |x| x[0]));
                        }
                        if let Some(g) = g1 {
                            ops.push(accumulate(g, &[adj], 1.0, |x| x[0]));
                        }
                    }
                    Op::Minus => {
                        if let Some(g) = g0 {
                            ops.push(accumulate(g, &[adj], 1.0, |x| x[0]));
                        }
                        if let Some(g) = g1 {
                            ops.push(accumulate(g, &[adj], -1.0, |x| x[0]));
                        }
                    }
                    Op::Mult => {
                        if let Some(g) = g0 {
                            ops.push(accumulate(g, &[adj, b], 1.0, |x| x[0] * x[1]));
                        }
                        if let Some(g) = g1 {
                            ops.push(accumulate(g, &[adj, a], 1.0, |x| x[0] * x[1]));
                        }
                    }
                    _ => {
                        if let Some(g) = g0 {
                            ops.push(accumulate(g, &[adj, b], 1.0, |x| x[0] / x[1]));
                        }
                        if let Some(g) = g1 {
                            ops.push(accumulate(g, &[adj, a, b], -1.0, |x| {
                                x[0] * x[1] / (x[2] * x[2])
                            }));
                        }
                    }
                }
            }
            Op::Sum { axis } | Op::Mean { axis } => {
                if let Some(g) = g0 {
                    let scale = match self {
                        Op::Mean { .. } => 1.0 / ins[0].shape().dims()[*axis] as f32,
                        _ => 1.0,
                    };
                    ops.push(accumulate(g, &[adj], scale, |a| a[0]));
                }
            }
            Op::Softmax => {
                if let Some(g) = g0 {
                    let (g, adj, y) = (g.clone(), adj.clone(), val.clone());
                    ops.push(Box::new(move || kernels::softmax_grad(&g, &adj, &y)));
                }
            }
            Op::LogSoftmax => {
                if let Some(g) = g0 {
                    let (g, adj, y) = (g.clone(), adj.clone(), val.clone());
                    ops.push(Box::new(move || kernels::log_softmax_grad(&g, &adj, &y)));
                }
            }
            Op::Transpose { axes_bw, .. } => {
                if let Some(g) = g0 {
                    let (g, adj, axes_bw) = (g.clone(), adj.clone(), axes_bw.clone());
                    ops.push(Box::new(move || kernels::transpose_nd_grad(&g, &adj, &axes_bw)));
                }
            }
            Op::Shift { shift, .. } => {
                if let Some(g) = g0 {
                    let (g, adj, shift) = (g.clone(), adj.clone(), shift.clone());
                    ops.push(Box::new(move || kernels::shift_grad(&g, &adj, &shift)));
                }
            }
            Op::Pooling { window, mode } => {
                if let Some(g) = g0 {
                    let (g, adj, x) = (g.clone(), adj.clone(), ins[0].clone());
                    let (window, mode) = (*window, *mode);
                    ops.push(Box::new(move || {
                        kernels::pool2d_grad(&g, &adj, &x, &window, mode)
                    }));
                }
            }
            Op::PoolingWithMasking { width, is_even } => {
                if let Some(g) = g0 {
                    let (g, adj) = (g.clone(), adj.clone());
                    let (x, mask) = (ins[0].clone(), ins[1].clone());
                    let (width, is_even) = (*width, *is_even);
                    ops.push(Box::new(move || {
                        kernels::pooling_with_masking_grad(&g, &adj, &x, &mask, width, is_even)
                    }));
                }
            }
        }
        ops
    }
}

/// Inverse of a permutation: `inv[axes[i]] = i`.
pub(crate) fn inverse_permutation(axes: &[usize]) -> Vec<usize> {
    let mut inv = vec![0; axes.len()];
    for (i, &a) in axes.iter().enumerate() {
        inv[a] = i;
    }
    inv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    fn run(ops: Vec<NodeOp>) {
        for op in ops {
            op().unwrap();
        }
    }

    #[test]
    fn test_params_change_hash_and_equality() {
        let a = Op::ScalarMult { scalar: 2.0 };
        let b = Op::ScalarMult { scalar: 3.0 };
        let (mut ha, mut hb) = (0, 0);
        a.hash_params(&mut ha);
        b.hash_params(&mut hb);
        assert_ne!(ha, hb);
        assert!(!a.params_equal(&b));
        assert!(a.params_equal(&Op::ScalarMult { scalar: 2.0 }));
        assert!(!Op::ScalarAdd { scalar: 2.0 }.params_equal(&a));
    }

    #[test]
    fn test_inverse_permutation() {
        assert_eq!(inverse_permutation(&[2, 0, 1]), vec![1, 2, 0]);
        assert_eq!(inverse_permutation(&[0, 1]), vec![0, 1]);
    }

    #[test]
    fn test_sqrt_forward_and_backward() {
        let x = Tensor::from_vec(vec![4.0, 9.0], 2, DType::F32).unwrap();
        let y = Tensor::zeros(2, DType::F32);
        let op = Op::Sqrt { eps: 0.0 };
        run(op.forward_ops(&y, &[x.clone()]));
        assert_eq!(y.to_vec().unwrap(), vec![2.0, 3.0]);

        let adj = Tensor::from_vec(vec![1.0, 1.0], 2, DType::F32).unwrap();
        let g = Tensor::from_vec(vec![1.0, 0.0], 2, DType::F32).unwrap();
        run(op.backward_ops(&y, &adj, &[x], &[Some(g.clone())]));
        // accumulated on top of the existing gradient
        assert_eq!(g.to_vec().unwrap(), vec![1.25, 1.0 / 6.0]);
    }

    #[test]
    fn test_views_have_no_ops() {
        let t = Tensor::zeros(4, DType::F32);
        let op = Op::Reshape {
            shape: Shape::from((2, 2)),
        };
        assert!(op.forward_ops(&t, &[t.clone()]).is_empty());
        assert!(op.backward_ops(&t, &t, &[t.clone()], &[Some(t.clone())]).is_empty());
    }

    #[test]
    fn test_missing_grad_is_skipped() {
        let x = Tensor::zeros(2, DType::F32);
        let ops = Op::Mult.backward_ops(&x, &x, &[x.clone(), x.clone()], &[None, Some(x.clone())]);
        assert_eq!(ops.len(), 1);
    }
}
