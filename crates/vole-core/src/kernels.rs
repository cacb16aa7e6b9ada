// Kernels — CPU reference implementations of the tensor operations
//
// Every node variant's forward and backward ops are built from the functions
// in this module. They all follow the same discipline:
//
//   1. Snapshot the inputs (take each read lock, copy, release).
//   2. Take a single write lock on the output and compute into it.
//
// A kernel therefore never holds two locks at once, and an output may alias
// one of its inputs (an adjoint accumulated into itself, a shard copied onto
// a neighbouring shard of the same block).
//
// BROADCASTING:
//
//   `element` broadcasts its inputs onto the output shape. `add` goes further:
//   it evaluates the functor over the broadcast of the output and all inputs,
//   then sums the result back down onto the output's shape. That reduction is
//   what gives every broadcasting backward pass its "reduce over broadcast
//   dims" for free, and with a size-1 output axis it is a plain axis sum.

use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

fn snapshot(ins: &[&Tensor]) -> Result<Vec<Vec<f32>>> {
    ins.iter().map(|t| t.to_vec()).collect()
}

fn same_shape(expected: &Tensor, got: &Tensor) -> Result<()> {
    if expected.shape() != got.shape() {
        return Err(Error::ShapeMismatch {
            expected: expected.shape().clone(),
            got: got.shape().clone(),
        });
    }
    Ok(())
}

/// Check that `s` can be broadcast onto `target` without growing `target`.
fn broadcasts_into(s: &Shape, target: &Shape) -> Result<()> {
    let mismatch = || Error::BroadcastMismatch {
        lhs: target.clone(),
        rhs: s.clone(),
    };
    if s.rank() > target.rank() {
        return Err(mismatch());
    }
    let offset = target.rank() - s.rank();
    for (i, &d) in s.dims().iter().enumerate() {
        if d != 1 && d != target.dims()[offset + i] {
            return Err(mismatch());
        }
    }
    Ok(())
}

// Elementwise

/// `out[i] = f(out[i], ins[..][i])` with every input broadcast onto `out`.
pub fn element<F>(out: &Tensor, ins: &[&Tensor], f: F) -> Result<()>
where
    F: Fn(f32, &[f32]) -> f32,
{
    let oshape = out.shape().clone();
    for t in ins {
        broadcasts_into(t.shape(), &oshape)?;
    }
    let data = snapshot(ins)?;
    let same: Vec<bool> = ins.iter().map(|t| *t.shape() == oshape).collect();
    let all_same = same.iter().all(|&s| s);
    let mut coords = vec![0usize; oshape.rank()];
    let mut args = vec![0.0f32; ins.len()];
    out.update(|cells| {
        for (i, cell) in cells.iter_mut().enumerate() {
            if !all_same {
                oshape.coords(i, &mut coords);
            }
            for (k, d) in data.iter().enumerate() {
                args[k] = if same[k] {
                    d[i]
                } else {
                    d[ins[k].shape().bindex(&coords)]
                };
            }
            *cell = f(*cell, &args);
        }
    })
}

/// `out += scale * f(ins...)`, evaluated over the broadcast of `out` and all
/// inputs and summed back down onto the shape of `out`.
pub fn add<F>(out: &Tensor, ins: &[&Tensor], scale: f32, f: F) -> Result<()>
where
    F: Fn(&[f32]) -> f32,
{
    let acc = broadcast_sum(out.shape(), ins, &f)?;
    out.update(|cells| {
        for (c, a) in cells.iter_mut().zip(&acc) {
            *c += scale * a;
        }
    })
}

/// `out = scale * f(ins...)` summed down onto the shape of `out`.
pub fn reduce<F>(out: &Tensor, ins: &[&Tensor], scale: f32, f: F) -> Result<()>
where
    F: Fn(&[f32]) -> f32,
{
    let acc = broadcast_sum(out.shape(), ins, &f)?;
    out.update(|cells| {
        for (c, a) in cells.iter_mut().zip(&acc) {
            *c = scale * a;
        }
    })
}

fn broadcast_sum<F>(oshape: &Shape, ins: &[&Tensor], f: &F) -> Result<Vec<f32>>
where
    F: Fn(&[f32]) -> f32,
{
    let mut shapes: Vec<&Shape> = vec![oshape];
    shapes.extend(ins.iter().map(|t| t.shape()));
    let full = Shape::broadcast(&shapes)?;
    let data = snapshot(ins)?;

    let mut acc = vec![0.0f32; oshape.elem_count()];
    let mut coords = vec![0usize; full.rank()];
    let mut args = vec![0.0f32; ins.len()];
    for i in 0..full.elem_count() {
        full.coords(i, &mut coords);
        for (k, d) in data.iter().enumerate() {
            args[k] = d[ins[k].shape().bindex(&coords)];
        }
        acc[oshape.bindex(&coords)] += f(&args);
    }
    Ok(acc)
}

// Softmax family (last axis)

/// Numerically stable softmax over the last axis.
pub fn softmax(out: &Tensor, x: &Tensor) -> Result<()> {
    same_shape(out, x)?;
    let cols = x.shape().back();
    let src = x.to_vec()?;
    out.update(|cells| {
        for (row_out, row) in cells.chunks_mut(cols).zip(src.chunks(cols)) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for (o, &v) in row_out.iter_mut().zip(row) {
                *o = (v - max).exp();
                sum += *o;
            }
            row_out.iter_mut().for_each(|o| *o /= sum);
        }
    })
}

/// Numerically stable log-softmax over the last axis.
pub fn log_softmax(out: &Tensor, x: &Tensor) -> Result<()> {
    same_shape(out, x)?;
    let cols = x.shape().back();
    let src = x.to_vec()?;
    out.update(|cells| {
        for (row_out, row) in cells.chunks_mut(cols).zip(src.chunks(cols)) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let log_sum = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln();
            for (o, &v) in row_out.iter_mut().zip(row) {
                *o = v - max - log_sum;
            }
        }
    })
}

/// `grad += y ⊙ (adj - Σ y⊙adj)` row-wise, where `y` is the softmax output.
pub fn softmax_grad(grad: &Tensor, adj: &Tensor, y: &Tensor) -> Result<()> {
    same_shape(grad, adj)?;
    same_shape(grad, y)?;
    let cols = y.shape().back();
    let dy = adj.to_vec()?;
    let p = y.to_vec()?;
    grad.update(|cells| {
        for ((g, d), p) in cells
            .chunks_mut(cols)
            .zip(dy.chunks(cols))
            .zip(p.chunks(cols))
        {
            let dot: f32 = d.iter().zip(p).map(|(a, b)| a * b).sum();
            for ((g, &d), &p) in g.iter_mut().zip(d).zip(p) {
                *g += p * (d - dot);
            }
        }
    })
}

/// `grad += adj - exp(y) Σ adj` row-wise, where `y` is the log-softmax output.
pub fn log_softmax_grad(grad: &Tensor, adj: &Tensor, y: &Tensor) -> Result<()> {
    same_shape(grad, adj)?;
    same_shape(grad, y)?;
    let cols = y.shape().back();
    let dy = adj.to_vec()?;
    let ly = y.to_vec()?;
    grad.update(|cells| {
        for ((g, d), ly) in cells
            .chunks_mut(cols)
            .zip(dy.chunks(cols))
            .zip(ly.chunks(cols))
        {
            let sum: f32 = d.iter().sum();
            for ((g, &d), &ly) in g.iter_mut().zip(d).zip(ly) {
                *g += d - ly.exp() * sum;
            }
        }
    })
}

// Transpose

fn permute(out: &Tensor, x: &Tensor, axes: &[usize], accumulate: bool) -> Result<()> {
    let xshape = x.shape();
    if axes.len() != xshape.rank() || axes.iter().any(|&a| a >= xshape.rank()) {
        return Err(Error::InvalidPermutation {
            axes: axes.to_vec(),
            shape: xshape.clone(),
        });
    }
    let expected: Vec<usize> = axes.iter().map(|&a| xshape.dims()[a]).collect();
    if out.shape().dims() != expected.as_slice() {
        return Err(Error::ShapeMismatch {
            expected: Shape::new(expected),
            got: out.shape().clone(),
        });
    }
    let xstrides = xshape.stride_contiguous();
    let oshape = out.shape().clone();
    let src = x.to_vec()?;
    let mut coords = vec![0usize; oshape.rank()];
    out.update(|cells| {
        for (j, cell) in cells.iter_mut().enumerate() {
            oshape.coords(j, &mut coords);
            let i: usize = coords
                .iter()
                .zip(axes)
                .map(|(&c, &a)| c * xstrides[a])
                .sum();
            if accumulate {
                *cell += src[i];
            } else {
                *cell = src[i];
            }
        }
    })
}

/// `out = x` with axes permuted: `out.dims[i] == x.dims[axes[i]]`.
pub fn transpose_nd(out: &Tensor, x: &Tensor, axes: &[usize]) -> Result<()> {
    permute(out, x, axes, false)
}

/// `out += x` with axes permuted.
pub fn transpose_nd_grad(out: &Tensor, x: &Tensor, axes: &[usize]) -> Result<()> {
    permute(out, x, axes, true)
}

// Shift

/// Flat source index of `coords - shift`, or None when it falls outside.
fn shifted_source(shape: &Shape, coords: &[usize], shift: &[i64]) -> Option<usize> {
    let mut flat = 0usize;
    for ((&c, &s), &d) in coords.iter().zip(shift).zip(shape.dims()) {
        let src = c as i64 - s;
        if src < 0 || src >= d as i64 {
            return None;
        }
        flat = flat * d + src as usize;
    }
    Some(flat)
}

fn check_shift(out: &Tensor, x: &Tensor, shift: &[i64]) -> Result<()> {
    same_shape(out, x)?;
    if shift.len() != x.shape().rank() {
        return Err(Error::RankMismatch {
            expected: x.shape().rank(),
            got: shift.len(),
        });
    }
    Ok(())
}

/// `out[c] = x[c - shift]`, or `pad` where `c - shift` is outside `x`.
pub fn shift(out: &Tensor, x: &Tensor, shift: &[i64], pad: f32) -> Result<()> {
    check_shift(out, x, shift)?;
    let shape = x.shape().clone();
    let src = x.to_vec()?;
    let mut coords = vec![0usize; shape.rank()];
    out.update(|cells| {
        for (i, cell) in cells.iter_mut().enumerate() {
            shape.coords(i, &mut coords);
            *cell = match shifted_source(&shape, &coords, shift) {
                Some(s) => src[s],
                None => pad,
            };
        }
    })
}

/// `grad[c - shift] += adj[c]` wherever `c - shift` is inside the tensor.
pub fn shift_grad(grad: &Tensor, adj: &Tensor, shift: &[i64]) -> Result<()> {
    check_shift(grad, adj, shift)?;
    let shape = adj.shape().clone();
    let dy = adj.to_vec()?;
    let mut coords = vec![0usize; shape.rank()];
    grad.update(|cells| {
        for (i, &d) in dy.iter().enumerate() {
            shape.coords(i, &mut coords);
            if let Some(s) = shifted_source(&shape, &coords, shift) {
                cells[s] += d;
            }
        }
    })
}

// 2-D pooling

/// How a pooling window is summarised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolMode {
    Max,
    /// Average over the full window; padded cells count as zeros.
    Avg,
}

impl PoolMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolMode::Max => "max",
            PoolMode::Avg => "avg",
        }
    }
}

/// Window geometry of a 2-D pooling over the last two axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolWindow {
    pub height: usize,
    pub width: usize,
    pub pad_height: usize,
    pub pad_width: usize,
    pub stride_height: usize,
    pub stride_width: usize,
}

impl PoolWindow {
    /// Output `(height, width)` for an input plane of `h x w`, or None when
    /// the window does not fit the padded input.
    pub fn output_dims(&self, h: usize, w: usize) -> Option<(usize, usize)> {
        let ph = h + 2 * self.pad_height;
        let pw = w + 2 * self.pad_width;
        if self.height == 0
            || self.width == 0
            || self.stride_height == 0
            || self.stride_width == 0
            || self.height > ph
            || self.width > pw
        {
            return None;
        }
        Some((
            (ph - self.height) / self.stride_height + 1,
            (pw - self.width) / self.stride_width + 1,
        ))
    }

    /// Flat in-plane indices of the unpadded cells under output cell (oy, ox).
    fn cells(&self, h: usize, w: usize, oy: usize, ox: usize) -> Vec<usize> {
        let y0 = (oy * self.stride_height) as isize - self.pad_height as isize;
        let x0 = (ox * self.stride_width) as isize - self.pad_width as isize;
        let mut cells = Vec::with_capacity(self.height * self.width);
        for ky in 0..self.height as isize {
            let y = y0 + ky;
            if y < 0 || y >= h as isize {
                continue;
            }
            for kx in 0..self.width as isize {
                let x = x0 + kx;
                if x < 0 || x >= w as isize {
                    continue;
                }
                cells.push(y as usize * w + x as usize);
            }
        }
        cells
    }
}

struct PoolGeometry {
    planes: usize,
    h: usize,
    w: usize,
    oh: usize,
    ow: usize,
}

fn pool_geometry(x: &Shape, out: &Shape, window: &PoolWindow) -> Result<PoolGeometry> {
    if x.rank() < 2 {
        return Err(Error::RankMismatch {
            expected: 2,
            got: x.rank(),
        });
    }
    let h = x.dims()[x.rank() - 2];
    let w = x.dims()[x.rank() - 1];
    let (oh, ow) = window
        .output_dims(h, w)
        .ok_or_else(|| Error::msg(format!("pooling window {window:?} does not fit input {x}")))?;
    let expected = x.with_dim(x.rank() - 2, oh).with_dim(x.rank() - 1, ow);
    if *out != expected {
        return Err(Error::ShapeMismatch {
            expected,
            got: out.clone(),
        });
    }
    Ok(PoolGeometry {
        planes: x.elem_count() / (h * w),
        h,
        w,
        oh,
        ow,
    })
}

/// Pool each `H x W` plane of `x` into `out`.
pub fn pool2d(out: &Tensor, x: &Tensor, window: &PoolWindow, mode: PoolMode) -> Result<()> {
    let g = pool_geometry(x.shape(), out.shape(), window)?;
    let src = x.to_vec()?;
    let area = (window.height * window.width) as f32;
    out.update(|cells| {
        for p in 0..g.planes {
            let plane = &src[p * g.h * g.w..(p + 1) * g.h * g.w];
            for oy in 0..g.oh {
                for ox in 0..g.ow {
                    let under = window.cells(g.h, g.w, oy, ox);
                    let v = match mode {
                        PoolMode::Max => under
                            .iter()
                            .map(|&i| plane[i])
                            .fold(None, |m: Option<f32>, v| Some(m.map_or(v, |m| m.max(v))))
                            .unwrap_or(0.0),
                        PoolMode::Avg => under.iter().map(|&i| plane[i]).sum::<f32>() / area,
                    };
                    cells[(p * g.oh + oy) * g.ow + ox] = v;
                }
            }
        }
    })
}

/// Route `adj` back through a pooling: max windows send it to their first
/// argmax, average windows spread it evenly over the unpadded cells.
pub fn pool2d_grad(
    grad: &Tensor,
    adj: &Tensor,
    x: &Tensor,
    window: &PoolWindow,
    mode: PoolMode,
) -> Result<()> {
    same_shape(grad, x)?;
    let g = pool_geometry(x.shape(), adj.shape(), window)?;
    let src = x.to_vec()?;
    let dy = adj.to_vec()?;
    let area = (window.height * window.width) as f32;
    grad.update(|cells| {
        for p in 0..g.planes {
            let base = p * g.h * g.w;
            for oy in 0..g.oh {
                for ox in 0..g.ow {
                    let d = dy[(p * g.oh + oy) * g.ow + ox];
                    let under = window.cells(g.h, g.w, oy, ox);
                    match mode {
                        PoolMode::Max => {
                            let mut best: Option<usize> = None;
                            for &i in &under {
                                if best.map_or(true, |b| src[base + i] > src[base + b]) {
                                    best = Some(i);
                                }
                            }
                            if let Some(b) = best {
                                cells[base + b] += d;
                            }
                        }
                        PoolMode::Avg => {
                            for &i in &under {
                                cells[base + i] += d / area;
                            }
                        }
                    }
                }
            }
        }
    })
}

// Masked pooling over the last axis

/// Output length of a masked pooling over `len` positions.
pub fn masked_pool_len(len: usize, width: usize, is_even: bool) -> usize {
    let cols = if is_even { len.saturating_sub(1) } else { len };
    cols.div_ceil(width)
}

struct MaskedGeometry {
    batch: usize,
    dim: usize,
    len: usize,
    cols: usize,
    out_len: usize,
}

fn masked_geometry(
    x: &Shape,
    mask: &Shape,
    out: &Shape,
    width: usize,
    is_even: bool,
) -> Result<MaskedGeometry> {
    if x.rank() != 3 {
        return Err(Error::RankMismatch {
            expected: 3,
            got: x.rank(),
        });
    }
    let (batch, dim, len) = (x.dims()[0], x.dims()[1], x.dims()[2]);
    let expected_mask = Shape::from((batch, 1, len));
    if *mask != expected_mask {
        return Err(Error::ShapeMismatch {
            expected: expected_mask,
            got: mask.clone(),
        });
    }
    let out_len = masked_pool_len(len, width, is_even);
    let expected_out = Shape::from((batch, dim, out_len));
    if *out != expected_out {
        return Err(Error::ShapeMismatch {
            expected: expected_out,
            got: out.clone(),
        });
    }
    Ok(MaskedGeometry {
        batch,
        dim,
        len,
        cols: if is_even { len - 1 } else { len },
        out_len,
    })
}

/// Index (within the row) of the first maximum of `x * mask` over the
/// window starting at `start`. The last window is clipped to `cols`.
fn masked_argmax(row: &[f32], mask: &[f32], start: usize, width: usize, cols: usize) -> usize {
    let end = (start + width).min(cols);
    let mut best = start;
    for t in start + 1..end {
        if row[t] * mask[t] > row[best] * mask[best] {
            best = t;
        }
    }
    best
}

/// `out[b, d, s]` is the max of `x[b, d, t] * mask[b, 0, t]` over window `s`.
pub fn pooling_with_masking(
    out: &Tensor,
    x: &Tensor,
    mask: &Tensor,
    width: usize,
    is_even: bool,
) -> Result<()> {
    let g = masked_geometry(x.shape(), mask.shape(), out.shape(), width, is_even)?;
    let src = x.to_vec()?;
    let m = mask.to_vec()?;
    out.update(|cells| {
        for b in 0..g.batch {
            let mrow = &m[b * g.len..(b + 1) * g.len];
            for d in 0..g.dim {
                let row = &src[(b * g.dim + d) * g.len..(b * g.dim + d + 1) * g.len];
                for s in 0..g.out_len {
                    let t = masked_argmax(row, mrow, s * width, width, g.cols);
                    cells[(b * g.dim + d) * g.out_len + s] = row[t] * mrow[t];
                }
            }
        }
    })
}

/// `grad[b, d, argmax] += adj[b, d, s]` for every window `s`.
pub fn pooling_with_masking_grad(
    grad: &Tensor,
    adj: &Tensor,
    x: &Tensor,
    mask: &Tensor,
    width: usize,
    is_even: bool,
) -> Result<()> {
    same_shape(grad, x)?;
    let g = masked_geometry(x.shape(), mask.shape(), adj.shape(), width, is_even)?;
    let src = x.to_vec()?;
    let m = mask.to_vec()?;
    let dy = adj.to_vec()?;
    grad.update(|cells| {
        for b in 0..g.batch {
            let mrow = &m[b * g.len..(b + 1) * g.len];
            for d in 0..g.dim {
                let base = (b * g.dim + d) * g.len;
                let row = &src[base..base + g.len];
                for s in 0..g.out_len {
                    let t = masked_argmax(row, mrow, s * width, width, g.cols);
                    cells[base + t] += dy[(b * g.dim + d) * g.out_len + s];
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    fn t(data: Vec<f32>, shape: impl Into<Shape>) -> Tensor {
        Tensor::from_vec(data, shape, DType::F32).unwrap()
    }

    #[test]
    fn test_element_broadcast() {
        let out = Tensor::zeros((2, 3), DType::F32);
        let a = t(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3));
        let b = t(vec![10.0, 20.0, 30.0], 3);
        element(&out, &[&a, &b], |_, x| x[0] + x[1]).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_element_rejects_growing_input() {
        let out = Tensor::zeros(3, DType::F32);
        let a = Tensor::zeros((2, 3), DType::F32);
        assert!(element(&out, &[&a], |_, x| x[0]).is_err());
    }

    #[test]
    fn test_add_reduces_broadcast_dims() {
        let out = t(vec![1.0, 1.0, 1.0], (1, 3));
        let a = t(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3));
        add(&out, &[&a], 0.5, |x| x[0]).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![3.5, 4.5, 5.5]);
    }

    #[test]
    fn test_reduce_last_axis() {
        let out = t(vec![99.0, 99.0], (2, 1));
        let a = t(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3));
        reduce(&out, &[&a], 1.0, |x| x[0]).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![6.0, 15.0]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let x = t(vec![1.0, 2.0, 3.0, 1000.0, 1000.0, 1000.0], (2, 3));
        let out = Tensor::zeros((2, 3), DType::F32);
        softmax(&out, &x).unwrap();
        let v = out.to_vec().unwrap();
        assert!((v[0..3].iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!((v[3] - 1.0 / 3.0).abs() < 1e-6);
        let ls = Tensor::zeros((2, 3), DType::F32);
        log_softmax(&ls, &x).unwrap();
        let l = ls.to_vec().unwrap();
        assert!((l[0].exp() - v[0]).abs() < 1e-6);
    }

    #[test]
    fn test_transpose_and_back() {
        let x = t((0..24).map(|v| v as f32).collect(), (2, 3, 4));
        let y = Tensor::zeros((4, 2, 3), DType::F32);
        transpose_nd(&y, &x, &[2, 0, 1]).unwrap();
        // y[k, i, j] == x[i, j, k]
        assert_eq!(y.get(1 * 6 + 1 * 3 + 2).unwrap(), x.get(1 * 12 + 2 * 4 + 1).unwrap());
        let back = Tensor::zeros((2, 3, 4), DType::F32);
        transpose_nd_grad(&back, &y, &[1, 2, 0]).unwrap();
        assert_eq!(back.to_vec().unwrap(), x.to_vec().unwrap());
    }

    #[test]
    fn test_shift_pads_border() {
        let x = t(vec![1.0, 2.0, 3.0, 4.0], (1, 4));
        let out = Tensor::zeros((1, 4), DType::F32);
        shift(&out, &x, &[0, 1], -1.0).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![-1.0, 1.0, 2.0, 3.0]);
        let g = Tensor::zeros((1, 4), DType::F32);
        shift_grad(&g, &t(vec![1.0; 4], (1, 4)), &[0, 1]).unwrap();
        assert_eq!(g.to_vec().unwrap(), vec![1.0, 1.0, 1.0, 0.0]);
        assert!(shift(&out, &x, &[1], 0.0).is_err());
    }

    #[test]
    fn test_max_pool_2x2() {
        let x = t((1..=16).map(|v| v as f32).collect(), (1, 4, 4));
        let window = PoolWindow {
            height: 2,
            width: 2,
            pad_height: 0,
            pad_width: 0,
            stride_height: 2,
            stride_width: 2,
        };
        let out = Tensor::zeros((1, 2, 2), DType::F32);
        pool2d(&out, &x, &window, PoolMode::Max).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![6.0, 8.0, 14.0, 16.0]);
        pool2d(&out, &x, &window, PoolMode::Avg).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![3.5, 5.5, 11.5, 13.5]);
    }

    #[test]
    fn test_masked_pool_last_window_is_clipped() {
        // L = 5, width 2 -> windows [0,1] [2,3] [4]
        let x = t(vec![1.0, 5.0, 2.0, 9.0, 7.0], (1, 1, 5));
        let mask = t(vec![1.0, 1.0, 1.0, 0.0, 1.0], (1, 1, 5));
        assert_eq!(masked_pool_len(5, 2, false), 3);
        let out = Tensor::zeros((1, 1, 3), DType::F32);
        pooling_with_masking(&out, &x, &mask, 2, false).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![5.0, 2.0, 7.0]);

        let grad = Tensor::zeros((1, 1, 5), DType::F32);
        let adj = t(vec![1.0, 2.0, 3.0], (1, 1, 3));
        pooling_with_masking_grad(&grad, &adj, &x, &mask, 2, false).unwrap();
        assert_eq!(grad.to_vec().unwrap(), vec![0.0, 1.0, 2.0, 0.0, 3.0]);
    }

    #[test]
    fn test_masked_pool_is_even_drops_last_column() {
        assert_eq!(masked_pool_len(5, 2, true), 2);
        let x = t(vec![1.0, 5.0, 2.0, 9.0, 70.0], (1, 1, 5));
        let mask = t(vec![1.0; 5], (1, 1, 5));
        let out = Tensor::zeros((1, 1, 2), DType::F32);
        pooling_with_masking(&out, &x, &mask, 2, true).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![5.0, 9.0]);
    }
}
