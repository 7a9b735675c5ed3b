//! Broadcasted binary arithmetic and unary element-wise nodes.

use std::sync::Arc;

use cascade_core::{Broadcast, CascadeError, Result};
use cascade_device::BinaryOpKind;

use super::reduction::reduce_sum_dims;
use super::shape::reshape_to;
use crate::node::{BroadcastedBinaryOp, Node, NodeRef, Op};

fn binary(kind: BinaryOpKind, left: &NodeRef, right: &NodeRef) -> Result<NodeRef> {
    if left.dtype() != right.dtype() {
        return Err(CascadeError::TypeMismatch {
            left: left.dtype(),
            right: right.dtype(),
        });
    }
    let plan = Broadcast::new(left.shape(), right.shape())?;
    let result = plan.result.clone();
    Ok(Node::new(
        Op::Binary(BroadcastedBinaryOp { kind, plan }),
        result,
        left.dtype(),
        vec![Arc::clone(left), Arc::clone(right)],
    ))
}

pub fn plus(left: &NodeRef, right: &NodeRef) -> Result<NodeRef> {
    binary(BinaryOpKind::Plus, left, right)
}

pub fn minus(left: &NodeRef, right: &NodeRef) -> Result<NodeRef> {
    binary(BinaryOpKind::Minus, left, right)
}

pub fn multiply(left: &NodeRef, right: &NodeRef) -> Result<NodeRef> {
    binary(BinaryOpKind::Multiply, left, right)
}

pub fn divide(left: &NodeRef, right: &NodeRef) -> Result<NodeRef> {
    binary(BinaryOpKind::Divide, left, right)
}

pub fn negate(input: &NodeRef) -> NodeRef {
    Node::new(
        Op::Negate,
        input.shape().clone(),
        input.dtype(),
        vec![Arc::clone(input)],
    )
}

/// `input * factor` with a host-side constant factor.
pub fn scale(input: &NodeRef, factor: f64) -> NodeRef {
    Node::new(
        Op::Scale { factor },
        input.shape().clone(),
        input.dtype(),
        vec![Arc::clone(input)],
    )
}

/// Gradient of a broadcasted binary node with respect to operand `index`.
///
/// The local derivative is summed over the dimensions the operand was
/// broadcast along (keeping rank), then reshaped to the operand's shape if
/// padding left a rank difference.
pub(crate) fn binary_chain_rule(
    op: &BroadcastedBinaryOp,
    index: usize,
    grad: &NodeRef,
    inputs: &[NodeRef],
) -> Result<NodeRef> {
    let (left, right) = (&inputs[0], &inputs[1]);
    let local = match (op.kind, index) {
        (BinaryOpKind::Plus | BinaryOpKind::Minus, _) => Arc::clone(grad),
        (BinaryOpKind::Multiply, 0) => multiply(grad, right)?,
        (BinaryOpKind::Multiply, _) => multiply(grad, left)?,
        (BinaryOpKind::Divide, 0) => divide(grad, right)?,
        (BinaryOpKind::Divide, _) => {
            let denominator = multiply(right, right)?;
            multiply(grad, &divide(&negate(left), &denominator)?)?
        }
    };

    let (reduce_dims, operand) = if index == 0 {
        (&op.plan.left_reduce_dims, left)
    } else {
        (&op.plan.right_reduce_dims, right)
    };
    let mut derivative = if reduce_dims.is_empty() {
        local
    } else {
        reduce_sum_dims(&local, reduce_dims.clone(), true)
    };
    if op.kind == BinaryOpKind::Minus && index == 1 {
        derivative = negate(&derivative);
    }
    if derivative.shape() != operand.shape() {
        derivative = reshape_to(&derivative, operand.shape().clone())?;
    }
    Ok(derivative)
}
