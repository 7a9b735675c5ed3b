//! Shape manipulation and metadata nodes.

use std::sync::Arc;

use cascade_core::{CascadeError, DType, Result, Shape};

use crate::node::{Node, NodeRef, Op};

/// Reshape to `target`; one entry may be `-1` and is inferred.
pub fn reshape(input: &NodeRef, target: &[isize]) -> Result<NodeRef> {
    let shape = input.shape().reshape(target)?;
    reshape_to(input, shape)
}

/// Reshape to an explicit shape of the same size.
pub fn reshape_to(input: &NodeRef, shape: Shape) -> Result<NodeRef> {
    if shape.size() != input.shape().size() {
        return Err(CascadeError::ShapeMismatch {
            expected: input.shape().dims().to_vec(),
            got: shape.dims().to_vec(),
        });
    }
    Ok(Node::new(
        Op::Reshape,
        shape,
        input.dtype(),
        vec![Arc::clone(input)],
    ))
}

/// Pass `input` through unchanged while stopping gradients.
///
/// Useful for constants whose shape depends on a differentiable node: the
/// constant stays connected to it for scheduling without producing a bogus
/// derivative.
pub fn no_back_prop(input: &NodeRef) -> NodeRef {
    Node::new(
        Op::NoBackProp,
        input.shape().clone(),
        input.dtype(),
        vec![Arc::clone(input)],
    )
}

/// The dimensions of `input` as an `I64` vector of length rank.
pub fn shape_of(input: &NodeRef) -> NodeRef {
    Node::new(
        Op::ShapeOf,
        Shape::new(&[input.shape().rank()]),
        DType::I64,
        vec![Arc::clone(input)],
    )
}

/// Scalar product of the sizes of `dims` of `input` (all of them when
/// `dims` is empty), as `dtype`.
///
/// For an input of shape `(1, 2, 3, 4)` and dims `[-1, 1]` this is `8`.
pub fn product_of_dims(input: &NodeRef, dims: &[isize], dtype: DType) -> Result<NodeRef> {
    let dims = if dims.is_empty() {
        (0..input.shape().rank()).collect()
    } else {
        input.shape().normalize_dims(dims)?
    };
    Ok(Node::new(
        Op::ProductOfDims { dims },
        Shape::scalar(),
        dtype,
        vec![Arc::clone(input)],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::variable;

    #[test]
    fn test_reshape() {
        let x = variable("x", Shape::new(&[2, 3]), DType::F32);
        let r = reshape(&x, &[-1]).unwrap();
        assert_eq!(r.shape(), &Shape::new(&[6]));
        assert_eq!(r.to_string(), "reshape(x, (6,))");
        assert!(reshape_to(&x, Shape::new(&[4])).is_err());
        assert!(reshape(&x, &[4, -1]).unwrap_err().is_shape_error());
    }

    #[test]
    fn test_metadata_nodes() {
        let x = variable("x", Shape::new(&[1, 2, 3, 4]), DType::F32);
        let s = shape_of(&x);
        assert_eq!(s.shape(), &Shape::new(&[4]));
        assert_eq!(s.dtype(), DType::I64);

        let p = product_of_dims(&x, &[-1, 1], DType::F32).unwrap();
        assert!(p.shape().is_scalar());
        assert!(matches!(p.op(), Op::ProductOfDims { dims } if dims == &vec![1, 3]));
        assert!(product_of_dims(&x, &[7], DType::F32).is_err());
    }
}
