// Integration tests for the expression graph: interning, views and shift.

use vole_core::{DType, Error, ExpressionGraph, GraphConfig, Init, Op, PoolMode, PoolWindow};

fn iota(n: usize) -> Vec<f32> {
    (0..n).map(|v| v as f32).collect()
}

// Structural hashing and coalescing

#[test]
fn test_same_structure_coalesces() {
    let mut g = ExpressionGraph::default();
    let x = g.param("x", (2, 3), Init::Ones).unwrap();
    let y = g.param("y", (2, 3), Init::Ones).unwrap();

    let a = g.plus(x, y).unwrap();
    let b = g.plus(x, y).unwrap();
    assert_eq!(a, b);

    // child order matters
    let c = g.plus(y, x).unwrap();
    assert_ne!(a, c);

    // deeper expressions coalesce node by node
    let ta = g.tanh(&[a, x]).unwrap();
    let tb = g.tanh(&[b, x]).unwrap();
    assert_eq!(ta, tb);
    assert_eq!(g.len(), 5);
}

#[test]
fn test_any_parameter_change_breaks_equality() {
    let mut g = ExpressionGraph::default();
    let x = g.param("x", (2, 4), Init::Ones).unwrap();
    let z = g.param("z", (1, 2, 4), Init::Ones).unwrap();
    let mask = g.constant((1, 1, 4), vec![1.0; 4]).unwrap();
    let window = PoolWindow {
        height: 1,
        width: 2,
        pad_height: 0,
        pad_width: 0,
        stride_height: 1,
        stride_width: 1,
    };
    let wider = PoolWindow { width: 3, ..window };

    let pairs = [
        (g.sqrt(x, 1e-6).unwrap(), g.sqrt(x, 1e-5).unwrap()),
        (g.prelu(x, 0.1).unwrap(), g.prelu(x, 0.2).unwrap()),
        (g.clip(x, 1.0).unwrap(), g.clip(x, 2.0).unwrap()),
        (g.scalar_add(x, 1.0).unwrap(), g.scalar_add(x, -1.0).unwrap()),
        (g.sum(x, 0).unwrap(), g.sum(x, 1).unwrap()),
        (g.mean(x, 0).unwrap(), g.mean(x, 1).unwrap()),
        (g.transpose(x, &[1, 0]).unwrap(), g.transpose(x, &[0, 1]).unwrap()),
        (g.reshape(x, (4, 2)).unwrap(), g.reshape(x, (8, 1)).unwrap()),
        (g.shift(x, &[0, 1], 0.0).unwrap(), g.shift(x, &[0, 1], 1.0).unwrap()),
        (g.step(x, 0, 0).unwrap(), g.step(x, 1, 0).unwrap()),
        (g.step(z, 0, 0).unwrap(), g.step(z, 0, 1).unwrap()),
        (
            g.pooling(x, window, PoolMode::Max).unwrap(),
            g.pooling(x, window, PoolMode::Avg).unwrap(),
        ),
        (
            g.pooling(x, window, PoolMode::Max).unwrap(),
            g.pooling(x, wider, PoolMode::Max).unwrap(),
        ),
        (
            g.pooling_with_masking(z, mask, 2, false).unwrap(),
            g.pooling_with_masking(z, mask, 3, false).unwrap(),
        ),
        (
            g.pooling_with_masking(z, mask, 2, false).unwrap(),
            g.pooling_with_masking(z, mask, 2, true).unwrap(),
        ),
    ];
    for (a, b) in pairs {
        assert_ne!(a, b);
        let (na, nb) = (g.node(a).unwrap(), g.node(b).unwrap());
        assert!(!na.equal(nb));
        assert_ne!(na.hash(), nb.hash());
    }

    // a different variant with identical children is never equal
    let e = g.exp(x).unwrap();
    let l = g.log(x).unwrap();
    assert_ne!(e, l);
}

#[test]
fn test_negative_axis_hashes_resolved() {
    let mut g = ExpressionGraph::default();
    let x = g.param("x", (2, 3), Init::Ones).unwrap();
    let a = g.sum(x, -1).unwrap();
    let b = g.sum(x, 1).unwrap();
    assert_eq!(a, b);
    assert_eq!(g.node(a).unwrap().op(), &Op::Sum { axis: 1 });
}

#[test]
fn test_value_type_is_part_of_identity() {
    let mut g16 = ExpressionGraph::new(GraphConfig::default().with_dtype(DType::F16));
    let mut g32 = ExpressionGraph::default();
    let a = g16.param("x", 2, Init::Ones).unwrap();
    let b = g32.param("x", 2, Init::Ones).unwrap();
    let a = g16.exp(a).unwrap();
    let b = g32.exp(b).unwrap();
    assert_ne!(g16.node(a).unwrap().hash(), g32.node(b).unwrap().hash());
}

// Views

#[test]
fn test_reshape_round_trip_shares_memory() {
    let mut g = ExpressionGraph::default();
    let x = g.constant((2, 3, 4), iota(24)).unwrap();
    let r = g.reshape(x, (6, 4)).unwrap();
    let back = g.reshape(r, (2, 3, 4)).unwrap();
    g.forward().unwrap();

    let (vx, vb) = (g.val(x).unwrap(), g.val(back).unwrap());
    assert!(vb.shares_memory(&vx));
    assert_eq!(vb.byte_offset(), vx.byte_offset());
    assert_eq!(vb.to_vec().unwrap(), vx.to_vec().unwrap());
    assert_eq!(g.node(back).unwrap().view_of(), Some((x.id(), 0)));

    // writing through the view mutates the owner
    g.val(r).unwrap().fill(3.0).unwrap();
    assert_eq!(g.val(x).unwrap().to_vec().unwrap(), vec![3.0; 24]);
}

#[test]
fn test_reshape_element_mismatch() {
    let mut g = ExpressionGraph::default();
    let x = g.constant((2, 3), iota(6)).unwrap();
    assert!(matches!(
        g.reshape(x, (4, 2)),
        Err(Error::ReshapeElementMismatch { src: 6, dst: 8, .. })
    ));
}

#[test]
fn test_step_partitions_tensor() {
    let mut g = ExpressionGraph::default();
    let x = g.constant((1, 4, 3), iota(12)).unwrap();
    let steps: Vec<_> = (0..4).map(|i| g.step(x, i, 1).unwrap()).collect();
    g.forward().unwrap();

    let mut joined = Vec::new();
    for (i, &s) in steps.iter().enumerate() {
        let v = g.val(s).unwrap();
        assert_eq!(v.shape().dims(), &[1, 1, 3]);
        assert!(v.shares_memory(&g.val(x).unwrap()));
        assert_eq!(v.byte_offset(), i * 3 * 4);
        joined.extend(v.to_vec().unwrap());
    }
    assert_eq!(joined, iota(12));
}

#[test]
fn test_step_on_leading_axis() {
    let mut g = ExpressionGraph::default();
    let x = g.constant((3, 2), iota(6)).unwrap();
    let s = g.step(x, 2, 0).unwrap();
    g.forward().unwrap();
    assert_eq!(g.val(s).unwrap().to_vec().unwrap(), vec![4.0, 5.0]);
}

// Shift

#[test]
fn test_shift_round_trip() {
    let mut g = ExpressionGraph::default();
    let x = g.constant((3, 4), iota(12)).unwrap();
    let y = g.shift(x, &[1, 2], -1.0).unwrap();
    let z = g.shift(y, &[-1, -2], -1.0).unwrap();
    g.forward().unwrap();

    let yv = g.val(y).unwrap().to_vec().unwrap();
    let zv = g.val(z).unwrap().to_vec().unwrap();
    // shifted copy owns its storage
    assert!(!g.val(y).unwrap().shares_memory(&g.val(x).unwrap()));
    for r in 0..3 {
        for c in 0..4 {
            let i = r * 4 + c;
            if r < 1 || c < 2 {
                assert_eq!(yv[i], -1.0);
            } else {
                assert_eq!(yv[i], ((r - 1) * 4 + (c - 2)) as f32);
            }
            // interior survives the round trip, the border is padding
            if r < 2 && c < 2 {
                assert_eq!(zv[i], i as f32);
            } else {
                assert_eq!(zv[i], -1.0);
            }
        }
    }
}

#[test]
fn test_shift_rank_mismatch() {
    let mut g = ExpressionGraph::default();
    let x = g.constant((3, 4), iota(12)).unwrap();
    assert!(matches!(
        g.shift(x, &[1], 0.0),
        Err(Error::RankMismatch { expected: 2, got: 1 })
    ));
}

// Preconditions

#[test]
fn test_transpose_rejects_bad_axes() {
    let mut g = ExpressionGraph::default();
    let x = g.constant((2, 3), iota(6)).unwrap();
    assert!(g.transpose(x, &[0]).is_err());
    assert!(g.transpose(x, &[1, 1]).is_err());
    assert!(g.transpose(x, &[0, 2]).is_err());
}

#[test]
fn test_pooling_window_too_large() {
    let mut g = ExpressionGraph::default();
    let x = g.constant((1, 2, 2), iota(4)).unwrap();
    let window = PoolWindow {
        height: 3,
        width: 1,
        pad_height: 0,
        pad_width: 0,
        stride_height: 1,
        stride_width: 1,
    };
    assert!(g.pooling(x, window, PoolMode::Max).is_err());
}

#[test]
fn test_masked_pooling_shapes() {
    let mut g = ExpressionGraph::default();
    let x = g.constant((2, 3, 7), vec![0.0; 42]).unwrap();
    let mask = g.constant((2, 1, 7), vec![1.0; 14]).unwrap();
    let bad = g.constant((2, 3, 7), vec![1.0; 42]).unwrap();
    let y = g.pooling_with_masking(x, mask, 3, false).unwrap();
    assert_eq!(g.node(y).unwrap().shape().dims(), &[2, 3, 3]);
    let even = g.pooling_with_masking(x, mask, 3, true).unwrap();
    assert_eq!(g.node(even).unwrap().shape().dims(), &[2, 3, 2]);
    assert!(g.pooling_with_masking(x, bad, 3, false).is_err());
    let flat = g.constant(7, vec![0.0; 7]).unwrap();
    assert!(g.pooling_with_masking(flat, mask, 3, false).is_err());
}

#[test]
fn test_zero_sized_dimensions_rejected() {
    let mut g = ExpressionGraph::default();
    assert!(matches!(
        g.constant((2, 0), vec![]),
        Err(Error::ZeroDim { .. })
    ));
    assert!(matches!(
        g.param("w", (1, 0, 3), Init::Zeros),
        Err(Error::ZeroDim { .. })
    ));
    assert!(g.params().is_empty().unwrap());

    let x = g.constant((2, 3), iota(6)).unwrap();
    assert!(matches!(g.reshape(x, (0, 6)), Err(Error::ZeroDim { .. })));

    // nothing reachable from valid leaves can end up empty
    let y = g.softmax(x).unwrap();
    g.forward().unwrap();
    assert_eq!(g.val(y).unwrap().size(), 6);
}

#[test]
fn test_broadcast_mismatch() {
    let mut g = ExpressionGraph::default();
    let a = g.constant(3, iota(3)).unwrap();
    let b = g.constant(4, iota(4)).unwrap();
    assert!(matches!(g.plus(a, b), Err(Error::BroadcastMismatch { .. })));
}

#[test]
fn test_half_values_are_rounded() {
    let mut g = ExpressionGraph::new(GraphConfig::default().with_dtype(DType::F16));
    let x = g.constant(1, vec![1.0]).unwrap();
    let y = g.scalar_mult(x, 1.0 / 3.0).unwrap();
    g.forward().unwrap();
    let v = g.val(y).unwrap().get(0).unwrap();
    assert_eq!(v, DType::F16.round(1.0 / 3.0));
    assert_eq!(g.val(y).unwrap().memory().size(), 2);
}
