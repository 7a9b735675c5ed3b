//! Sum and mean reductions.

use std::sync::Arc;

use cascade_core::Result;

use super::arithmetic::multiply;
use super::ones_like;
use super::shape::reshape_to;
use crate::node::{Node, NodeRef, Op, Reduction};

fn reduction(input: &NodeRef, dims: &[isize], keep_dims: bool) -> Result<Reduction> {
    let shape = input.shape();
    let dims = if dims.is_empty() {
        (0..shape.rank()).collect()
    } else {
        shape.normalize_dims(dims)?
    };
    Ok(make_reduction(input, dims, keep_dims))
}

fn make_reduction(input: &NodeRef, dims: Vec<usize>, keep_dims: bool) -> Reduction {
    let count = dims.iter().map(|&d| input.shape()[d]).product();
    Reduction {
        dims,
        keep_dims,
        count,
    }
}

fn reduction_node(input: &NodeRef, reduction: Reduction, mean: bool) -> NodeRef {
    let shape = input.shape().reduced(&reduction.dims, reduction.keep_dims);
    let op = if mean {
        Op::ReduceMean(reduction)
    } else {
        Op::ReduceSum(reduction)
    };
    Node::new(op, shape, input.dtype(), vec![Arc::clone(input)])
}

/// Sum over `dims` (negative indices allowed). An empty list reduces every
/// dimension.
pub fn reduce_sum(input: &NodeRef, dims: &[isize], keep_dims: bool) -> Result<NodeRef> {
    let reduction = reduction(input, dims, keep_dims)?;
    Ok(reduction_node(input, reduction, false))
}

/// Mean over `dims`. An empty list reduces every dimension.
pub fn reduce_mean(input: &NodeRef, dims: &[isize], keep_dims: bool) -> Result<NodeRef> {
    let reduction = reduction(input, dims, keep_dims)?;
    Ok(reduction_node(input, reduction, true))
}

/// Sum over already normalised dimensions.
pub(crate) fn reduce_sum_dims(input: &NodeRef, dims: Vec<usize>, keep_dims: bool) -> NodeRef {
    let reduction = make_reduction(input, dims, keep_dims);
    reduction_node(input, reduction, false)
}

/// Spread `grad` back over the input of a sum: restore the reduced
/// dimensions as size 1, then broadcast against ones of the input's shape.
pub(crate) fn sum_chain_rule(
    reduction: &Reduction,
    input: &NodeRef,
    grad: &NodeRef,
) -> Result<NodeRef> {
    let kept = input.shape().reduced(&reduction.dims, true);
    let grad = if grad.shape() != &kept {
        reshape_to(grad, kept)?
    } else {
        Arc::clone(grad)
    };
    multiply(&grad, &ones_like(input))
}
