//! Broadcasting tables for element-wise binary operations.
//!
//! Given two operand shapes, [`Broadcast::new`] aligns them, derives the
//! per-dimension size masks consumed by the broadcasting kernel, and records
//! which dimensions each operand was broadcast along so the backward pass can
//! sum gradients back down to the operand's shape.

use crate::shape::Shape;
use crate::Result;

/// Per-dimension stride contributions for both operands of a broadcast.
///
/// `left[d]` is how far the left operand's flat index advances per step of
/// result coordinate `d`, or 0 when the left operand is broadcast along `d`.
/// `result_sub_sizes[d]` is the number of result elements spanned by one step
/// of coordinate `d`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeMasks {
    pub left: Vec<u64>,
    pub right: Vec<u64>,
    pub result_sub_sizes: Vec<u64>,
}

impl SizeMasks {
    /// Derive masks from two already-aligned shapes and their result.
    pub fn from_aligned(left: &Shape, right: &Shape, result: &Shape) -> Self {
        Self {
            left: operand_mask(left.dims()),
            right: operand_mask(right.dims()),
            result_sub_sizes: sub_sizes(result.dims()),
        }
    }

    pub fn rank(&self) -> usize {
        self.result_sub_sizes.len()
    }

    /// Flat offsets into (left, right) for the result element at `flat`.
    pub fn offsets(&self, flat: u64) -> (u64, u64) {
        broadcast_offsets(flat, &self.left, &self.right, &self.result_sub_sizes)
    }
}

fn operand_mask(dims: &[usize]) -> Vec<u64> {
    let rank = dims.len();
    let mut mask = vec![0u64; rank];
    if rank == 0 {
        return mask;
    }
    let mut cumprod: u64 = 1;
    for i in (1..rank).rev() {
        cumprod *= dims[i] as u64;
        mask[i - 1] = if dims[i - 1] == 1 { 0 } else { cumprod };
    }
    mask[rank - 1] = if dims[rank - 1] == 1 { 0 } else { 1 };
    mask
}

fn sub_sizes(dims: &[usize]) -> Vec<u64> {
    let rank = dims.len();
    let mut sub = vec![1u64; rank];
    for i in (0..rank.saturating_sub(1)).rev() {
        sub[i] = sub[i + 1] * dims[i + 1] as u64;
    }
    sub
}

/// Map a flat result index onto flat indices of both operands.
///
/// This is the gather step every broadcasting kernel performs per work item.
pub fn broadcast_offsets(
    flat: u64,
    left_mask: &[u64],
    right_mask: &[u64],
    result_sub_sizes: &[u64],
) -> (u64, u64) {
    let mut rest = flat;
    let mut left = 0u64;
    let mut right = 0u64;
    for d in 0..result_sub_sizes.len() {
        let step = result_sub_sizes[d];
        let coord = rest / step;
        rest %= step;
        left += coord * left_mask[d];
        right += coord * right_mask[d];
    }
    (left, right)
}

/// Positions where `aligned` differs from `result`: the dimensions along
/// which the operand was broadcast.
pub fn dims_difference(aligned: &Shape, result: &Shape) -> Vec<usize> {
    aligned
        .dims()
        .iter()
        .zip(result.dims())
        .enumerate()
        .filter(|(_, (a, r))| a != r)
        .map(|(i, _)| i)
        .collect()
}

/// Everything a broadcasted binary operation needs about its operands' shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    pub left: Shape,
    pub right: Shape,
    pub left_aligned: Shape,
    pub right_aligned: Shape,
    pub result: Shape,
    pub masks: SizeMasks,
    /// Broadcast-added dimensions of the left operand.
    pub left_reduce_dims: Vec<usize>,
    /// Broadcast-added dimensions of the right operand.
    pub right_reduce_dims: Vec<usize>,
}

impl Broadcast {
    pub fn new(left: &Shape, right: &Shape) -> Result<Self> {
        let [left_aligned, right_aligned, result] = Shape::align_for_broadcasting(left, right)?;

        // Two scalars are treated as length-1 vectors for the kernel tables.
        let masks = if result.is_scalar() {
            let one = Shape::new(&[1]);
            SizeMasks::from_aligned(&one, &one, &one)
        } else {
            SizeMasks::from_aligned(&left_aligned, &right_aligned, &result)
        };

        let left_reduce_dims = dims_difference(&left_aligned, &result);
        let right_reduce_dims = dims_difference(&right_aligned, &result);

        Ok(Self {
            left: left.clone(),
            right: right.clone(),
            left_aligned,
            right_aligned,
            result,
            masks,
            left_reduce_dims,
            right_reduce_dims,
        })
    }

    /// Whether both operands already have the result's shape.
    pub fn is_elementwise(&self) -> bool {
        self.left_reduce_dims.is_empty()
            && self.right_reduce_dims.is_empty()
            && self.left == self.result
            && self.right == self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CascadeError;

    #[test]
    fn test_matrix_plus_vector_masks() {
        let b = Broadcast::new(&Shape::new(&[2, 3]), &Shape::new(&[3])).unwrap();
        assert_eq!(b.result.dims(), &[2, 3]);
        assert_eq!(b.masks.left, vec![3, 1]);
        assert_eq!(b.masks.right, vec![0, 1]);
        assert_eq!(b.masks.result_sub_sizes, vec![3, 1]);
        assert!(b.left_reduce_dims.is_empty());
        assert_eq!(b.right_reduce_dims, vec![0]);
    }

    #[test]
    fn test_outer_broadcast_offsets() {
        let b = Broadcast::new(&Shape::new(&[3, 1]), &Shape::new(&[1, 4])).unwrap();
        assert_eq!(b.result.dims(), &[3, 4]);
        // result (2, 3) reads left[2] and right[3]
        assert_eq!(b.masks.offsets(2 * 4 + 3), (2, 3));
        assert_eq!(b.left_reduce_dims, vec![1]);
        assert_eq!(b.right_reduce_dims, vec![0]);
    }

    #[test]
    fn test_offsets_cover_matrix_plus_vector() {
        let b = Broadcast::new(&Shape::new(&[2, 3]), &Shape::new(&[3])).unwrap();
        let offsets: Vec<_> = (0..6).map(|i| b.masks.offsets(i)).collect();
        assert_eq!(
            offsets,
            vec![(0, 0), (1, 1), (2, 2), (3, 0), (4, 1), (5, 2)]
        );
    }

    #[test]
    fn test_scalar_pair() {
        let b = Broadcast::new(&Shape::scalar(), &Shape::scalar()).unwrap();
        assert!(b.result.is_scalar());
        assert_eq!(b.masks.rank(), 1);
        assert_eq!(b.masks.offsets(0), (0, 0));
    }

    #[test]
    fn test_scalar_with_matrix() {
        let b = Broadcast::new(&Shape::new(&[2, 2]), &Shape::scalar()).unwrap();
        assert_eq!(b.right_aligned.dims(), &[1, 1]);
        assert_eq!(b.masks.right, vec![0, 0]);
        assert_eq!(b.right_reduce_dims, vec![0, 1]);
        assert_eq!(b.masks.offsets(3), (3, 0));
    }

    #[test]
    fn test_elementwise() {
        let b = Broadcast::new(&Shape::new(&[4]), &Shape::new(&[4])).unwrap();
        assert!(b.is_elementwise());
        let b = Broadcast::new(&Shape::new(&[1, 4]), &Shape::new(&[4])).unwrap();
        assert!(!b.is_elementwise());
    }

    #[test]
    fn test_incompatible() {
        let err = Broadcast::new(&Shape::new(&[2, 3]), &Shape::new(&[4])).unwrap_err();
        assert!(matches!(err, CascadeError::IncompatibleShapes { .. }));
    }
}
