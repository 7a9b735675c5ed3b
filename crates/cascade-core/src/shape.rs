use smallvec::SmallVec;
use std::fmt;
use std::ops::Index;

use crate::error::CascadeError;
use crate::Result;

/// Immutable n-dimensional size descriptor.
///
/// An empty dimension list denotes a scalar. Dimensions are stored inline for
/// ranks up to 4, which covers nearly every array this engine sees.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    /// Create a new shape from dimensions.
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    /// Scalar shape (0 dimensions).
    pub fn scalar() -> Self {
        Self {
            dims: SmallVec::new(),
        }
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements (1 for a scalar).
    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Turn a possibly negative dimension index into a position.
    /// `-1` is the last dimension.
    pub fn dim_real_index(&self, index: isize) -> Result<usize> {
        let rank = self.rank() as isize;
        let real = if index < 0 { rank + index } else { index };
        if real < 0 || real >= rank {
            return Err(CascadeError::OutOfRange {
                index,
                rank: self.rank(),
            });
        }
        Ok(real as usize)
    }

    /// Size of a dimension; supports negative indexing.
    pub fn dim(&self, index: isize) -> Result<usize> {
        let real = self.dim_real_index(index)?;
        Ok(self.dims[real])
    }

    /// Normalize a list of possibly negative dimension indices into sorted,
    /// deduplicated positions.
    pub fn normalize_dims(&self, dims: &[isize]) -> Result<Vec<usize>> {
        let mut result = dims
            .iter()
            .map(|&d| self.dim_real_index(d))
            .collect::<Result<Vec<_>>>()?;
        result.sort_unstable();
        result.dedup();
        Ok(result)
    }

    /// Reshape to `target`, where at most one entry may be `-1` and is
    /// inferred from the total size.
    pub fn reshape(&self, target: &[isize]) -> Result<Shape> {
        let invalid = |reason: &str| CascadeError::InvalidReshape {
            from: self.dims.to_vec(),
            target: target.to_vec(),
            reason: reason.to_string(),
        };

        let size = self.size();
        let mut inferred_idx = None;
        let mut known_product: usize = 1;

        for (i, &d) in target.iter().enumerate() {
            if d == -1 {
                if inferred_idx.is_some() {
                    return Err(invalid("only one dimension can be inferred"));
                }
                inferred_idx = Some(i);
            } else if d < 0 {
                return Err(invalid("negative dimension"));
            } else {
                known_product = known_product
                    .checked_mul(d as usize)
                    .ok_or_else(|| invalid("dimension product overflows"))?;
            }
        }

        let mut dims: SmallVec<[usize; 4]> = target
            .iter()
            .map(|&d| if d == -1 { 0 } else { d as usize })
            .collect();

        if let Some(idx) = inferred_idx {
            if known_product == 0 {
                return Err(invalid("cannot infer a dimension next to a zero-sized one"));
            }
            if size % known_product != 0 {
                return Err(CascadeError::ShapeMismatch {
                    expected: self.dims.to_vec(),
                    got: dims.to_vec(),
                });
            }
            dims[idx] = size / known_product;
        }

        let result = Shape { dims };
        if result.size() != size {
            return Err(CascadeError::ShapeMismatch {
                expected: self.dims.to_vec(),
                got: result.dims.to_vec(),
            });
        }
        Ok(result)
    }

    /// Row-major strides for a contiguous layout.
    pub fn contiguous_strides(&self) -> SmallVec<[usize; 4]> {
        let rank = self.dims.len();
        let mut strides = SmallVec::from_elem(1usize, rank);
        for i in (0..rank.saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// Unify two shapes for element-wise broadcasting, NumPy style.
    ///
    /// The shorter shape is padded with leading 1s until both ranks match.
    /// Each aligned pair must be equal or contain a 1. Returns
    /// `[left_aligned, right_aligned, result]`; for example `(2, 3)` and `(3,)`
    /// give `(2, 3)`, `(1, 3)` and `(2, 3)`.
    pub fn align_for_broadcasting(left: &Shape, right: &Shape) -> Result<[Shape; 3]> {
        let rank = left.rank().max(right.rank());
        let pad = |s: &Shape| -> SmallVec<[usize; 4]> {
            let mut dims = SmallVec::from_elem(1usize, rank - s.rank());
            dims.extend_from_slice(&s.dims);
            dims
        };
        let left_aligned = pad(left);
        let right_aligned = pad(right);

        let mut result: SmallVec<[usize; 4]> = SmallVec::with_capacity(rank);
        for (&a, &b) in left_aligned.iter().zip(right_aligned.iter()) {
            if a == b || b == 1 {
                result.push(a);
            } else if a == 1 {
                result.push(b);
            } else {
                return Err(CascadeError::IncompatibleShapes {
                    left: left.dims.to_vec(),
                    right: right.dims.to_vec(),
                });
            }
        }

        Ok([
            Shape { dims: left_aligned },
            Shape { dims: right_aligned },
            Shape { dims: result },
        ])
    }

    /// Shape with the given positions set to 1 (reduced, keeping rank) or
    /// removed.
    pub fn reduced(&self, dims: &[usize], keep_dims: bool) -> Shape {
        let mut result = SmallVec::new();
        for (i, &d) in self.dims.iter().enumerate() {
            if dims.contains(&i) {
                if keep_dims {
                    result.push(1);
                }
            } else {
                result.push(d);
            }
        }
        Shape { dims: result }
    }
}

impl Index<usize> for Shape {
    type Output = usize;

    fn index(&self, index: usize) -> &usize {
        &self.dims[index]
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        if self.dims.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape {
            dims: SmallVec::from_vec(dims),
        }
    }
}

macro_rules! impl_shape_from_array {
    ($($n:expr),*) => {
        $(
            impl From<[usize; $n]> for Shape {
                fn from(dims: [usize; $n]) -> Self {
                    Shape::new(&dims)
                }
            }
        )*
    };
}

impl_shape_from_array!(0, 1, 2, 3, 4, 5, 6);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar() {
        let s = Shape::scalar();
        assert_eq!(s.rank(), 0);
        assert_eq!(s.size(), 1);
        assert!(s.is_scalar());
        assert_eq!(s.to_string(), "()");
    }

    #[test]
    fn test_negative_indexing() {
        let s = Shape::new(&[2, 3, 4]);
        assert_eq!(s.dim(0).unwrap(), 2);
        assert_eq!(s.dim(-1).unwrap(), 4);
        assert_eq!(s.dim(-3).unwrap(), 2);
        assert!(matches!(
            s.dim(3),
            Err(CascadeError::OutOfRange { index: 3, rank: 3 })
        ));
        assert!(matches!(s.dim(-4), Err(CascadeError::OutOfRange { .. })));
    }

    #[test]
    fn test_reshape() {
        let s = Shape::new(&[2, 3, 4]);
        assert_eq!(s.reshape(&[6, 4]).unwrap().dims(), &[6, 4]);
        assert_eq!(s.reshape(&[-1, 4]).unwrap().dims(), &[6, 4]);
        assert_eq!(s.reshape(&[2, -1]).unwrap().dims(), &[2, 12]);

        assert!(matches!(
            s.reshape(&[5, 5]),
            Err(CascadeError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            s.reshape(&[-1, -1]),
            Err(CascadeError::InvalidReshape { .. })
        ));
        assert!(matches!(
            s.reshape(&[5, -1]),
            Err(CascadeError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_reshape_to_scalar() {
        let s = Shape::new(&[1, 1]);
        assert!(s.reshape(&[]).unwrap().is_scalar());
    }

    #[test]
    fn test_normalize_dims() {
        let s = Shape::new(&[2, 3, 4]);
        assert_eq!(s.normalize_dims(&[-1, 0, 2]).unwrap(), vec![0, 2]);
        assert!(s.normalize_dims(&[5]).is_err());
    }

    #[test]
    fn test_contiguous_strides() {
        let s = Shape::new(&[2, 3, 4]);
        assert_eq!(s.contiguous_strides().as_slice(), &[12, 4, 1]);
        assert!(Shape::scalar().contiguous_strides().is_empty());
    }

    #[test]
    fn test_align_vector_to_matrix() {
        let [a, b, r] =
            Shape::align_for_broadcasting(&Shape::new(&[2, 3]), &Shape::new(&[3])).unwrap();
        assert_eq!(a.dims(), &[2, 3]);
        assert_eq!(b.dims(), &[1, 3]);
        assert_eq!(r.dims(), &[2, 3]);
    }

    #[test]
    fn test_align_expand_ones() {
        let [a, b, r] =
            Shape::align_for_broadcasting(&Shape::new(&[3, 1]), &Shape::new(&[1, 4])).unwrap();
        assert_eq!(a.dims(), &[3, 1]);
        assert_eq!(b.dims(), &[1, 4]);
        assert_eq!(r.dims(), &[3, 4]);
    }

    #[test]
    fn test_align_incompatible() {
        let err = Shape::align_for_broadcasting(&Shape::new(&[2, 3]), &Shape::new(&[4]))
            .unwrap_err();
        assert!(matches!(err, CascadeError::IncompatibleShapes { .. }));
        assert!(err.is_shape_error());
    }

    #[test]
    fn test_align_scalars() {
        let [a, b, r] =
            Shape::align_for_broadcasting(&Shape::scalar(), &Shape::new(&[2])).unwrap();
        assert_eq!(a.dims(), &[1]);
        assert_eq!(b.dims(), &[2]);
        assert_eq!(r.dims(), &[2]);

        let [_, _, r] =
            Shape::align_for_broadcasting(&Shape::scalar(), &Shape::scalar()).unwrap();
        assert!(r.is_scalar());
    }

    #[test]
    fn test_reduced() {
        let s = Shape::new(&[2, 3, 4]);
        assert_eq!(s.reduced(&[1], true).dims(), &[2, 1, 4]);
        assert_eq!(s.reduced(&[0, 2], false).dims(), &[3]);
    }

    #[test]
    fn test_display() {
        assert_eq!(Shape::new(&[3]).to_string(), "(3,)");
        assert_eq!(Shape::new(&[2, 3]).to_string(), "(2, 3)");
    }

    #[test]
    fn test_from_array() {
        let s: Shape = [2, 3].into();
        assert_eq!(s.dims(), &[2, 3]);
        assert_eq!(s[1], 3);
    }
}
