//! # vole-core
//!
//! Core tensor primitives, node variants, and the expression graph for Vole.
//!
//! This crate provides:
//! - [`ExpressionGraph`] — dynamically built, hash-deduplicated DAG with
//!   forward evaluation and reverse-mode differentiation
//! - [`Op`] — the node variants and their forward/backward algebra
//! - [`Tensor`] / [`MemoryPiece`] — thin headers over shared memory
//! - [`Parameters`] — the flat value/gradient block behind trainable leaves
//! - [`Shape`] / [`DType`] — shapes and element types
// - memory/tensor: reference-counted blocks, allocator, tensor headers
// - kernels: CPU reference implementations used by every node variant
// - hash: structural hashing for node interning

pub mod dtype;
pub mod error;
pub mod graph;
pub mod hash;
pub mod kernels;
pub mod memory;
pub mod node;
pub mod op;
pub mod params;
pub mod shape;
pub mod tensor;

pub use dtype::DType;
pub use error::{Error, Result};
pub use graph::{ExpressionGraph, GraphConfig};
pub use kernels::{PoolMode, PoolWindow};
pub use memory::{MemoryPiece, TensorAllocator};
pub use node::{Expr, GraphId, Node};
pub use op::{NodeOp, Op};
pub use params::{Init, ParamEntry, Parameters};
pub use shape::Shape;
pub use tensor::Tensor;
