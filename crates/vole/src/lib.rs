//! # Vole
//!
//! Expression-graph training core with multi-replica gradient
//! synchronization.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use vole::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `vole-core` | Shape, DType, Tensor, memory, kernels, node variants, ExpressionGraph |
//! | `vole` | Communicator and process-group transport |
//!
//! ## Modules
//!
//! - [`distributed`] — shard table, communicator, gradient all-reduce
//! - [`transport`] — process-group contract and the single-process group

/// Re-export core types.
pub use vole_core::{
    kernels, DType, Error, Expr, ExpressionGraph, GraphConfig, GraphId, Init, MemoryPiece, Node,
    NodeOp, Op, ParamEntry, Parameters, PoolMode, PoolWindow, Result, Shape, Tensor,
    TensorAllocator,
};

/// Distributed training — sharded gradient and parameter synchronization.
pub mod distributed;

/// Transport — message passing between cooperating processes.
pub mod transport;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::distributed::{create_communicator, Communicator, DefaultCommunicator, ShardTable};
    pub use crate::transport::{AllReduceOp, LocalProcessGroup, ProcessGroup};
    pub use crate::{
        DType, Error, Expr, ExpressionGraph, GraphConfig, Init, PoolMode, PoolWindow, Result,
        Shape, Tensor,
    };
}
