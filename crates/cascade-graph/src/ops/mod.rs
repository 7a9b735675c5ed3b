//! Node constructors.
//!
//! Constructors infer the output shape and element type and reject
//! incompatible operands immediately, so shape and type errors surface while
//! the graph is built rather than when it runs.

use std::sync::Arc;

use cascade_core::{DType, Shape};

use crate::node::{CustomOp, Node, NodeRef, Op};

pub mod arithmetic;
pub mod reduction;
pub mod shape;

pub use arithmetic::{divide, minus, multiply, negate, plus, scale};
pub use reduction::{reduce_mean, reduce_sum};
pub use shape::{no_back_prop, product_of_dims, reshape, reshape_to, shape_of};

/// A named differentiable leaf. Its value is bound in a `Context` or fed to
/// an `Executor` run.
pub fn variable(name: impl Into<String>, shape: Shape, dtype: DType) -> NodeRef {
    Node::new(
        Op::Variable { name: name.into() },
        shape,
        dtype,
        Vec::new(),
    )
}

/// A constant of `shape` with every element equal to `value`.
pub fn fill(shape: Shape, dtype: DType, value: f64) -> NodeRef {
    Node::new(Op::Fill { value }, shape, dtype, Vec::new())
}

/// Ones with the shape and element type of `node`.
pub fn ones_like(node: &NodeRef) -> NodeRef {
    fill(node.shape().clone(), node.dtype(), 1.0)
}

/// A host-defined operation over `inputs`, producing `shape` and `dtype`.
pub fn custom(op: Arc<dyn CustomOp>, inputs: &[NodeRef], shape: Shape, dtype: DType) -> NodeRef {
    Node::new(Op::Custom(op), shape, dtype, inputs.to_vec())
}
