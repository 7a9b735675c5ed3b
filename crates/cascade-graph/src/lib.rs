//! # cascade-graph
//!
//! Computation graphs for the Cascade tensor engine.
//!
//! Provides:
//! - Immutable `Node`s over a closed set of operations, plus a callback
//!   variant for host-defined ones
//! - Broadcasted binary arithmetic with shape checks at construction
//! - Reverse-mode differentiation that builds a gradient graph (`GradTable`)
//! - A device-bound `Context` store and a memoising `Executor`

pub mod backward;
pub mod context;
pub mod executor;
pub mod graph;
pub mod node;
pub mod ops;
pub mod prelude;

pub use backward::{build_back_propagation_graph, GradTable};
pub use context::{Context, ContextRef};
pub use executor::{ExecutionCache, Executor};
pub use graph::topological_order;
pub use node::{BroadcastedBinaryOp, CustomOp, Node, NodeId, NodeRef, Op, Reduction};
