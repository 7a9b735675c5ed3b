//! Sum reduction over a set of dimensions.

use cascade_core::{CascadeError, Element, Result};

use super::{count_arg, map_items};
use crate::launch::KernelInvocation;

/// `reduce_sum(in, out, in_dims, reduce_flags, rank: int, out_size: ulong)`
///
/// `reduce_flags[d]` is non-zero for every dimension being summed away. The
/// output is laid out as the input shape with those dimensions set to 1.
pub(super) fn reduce_sum<T: Element>(inv: &KernelInvocation<'_>) -> Result<()> {
    let input: Vec<T> = inv.read(0)?;
    let capacity = inv.capacity::<T>(1)?;
    let dims: Vec<u64> = inv.read(2)?;
    let flags: Vec<u64> = inv.read(3)?;
    let rank = inv.i32(4)? as usize;
    let out_size = count_arg(inv, 5, capacity)?;

    if dims.len() < rank || flags.len() < rank {
        return Err(CascadeError::Device(format!(
            "{}: shape buffers are shorter than rank {}",
            inv.kernel(),
            rank
        )));
    }
    let dims: Vec<usize> = dims[..rank].iter().map(|&d| d as usize).collect();
    let reduced: Vec<bool> = flags[..rank].iter().map(|&f| f != 0).collect();

    let in_size: usize = dims.iter().product();
    if input.len() < in_size {
        return Err(CascadeError::Device(format!(
            "{}: input holds {} elements, shape needs {}",
            inv.kernel(),
            input.len(),
            in_size
        )));
    }

    let mut strides = vec![1usize; rank];
    for d in (0..rank.saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * dims[d + 1];
    }
    let kept_dims: Vec<usize> = (0..rank)
        .map(|d| if reduced[d] { 1 } else { dims[d] })
        .collect();
    let reduced_axes: Vec<usize> = (0..rank).filter(|&d| reduced[d]).collect();
    let reduce_count: usize = reduced_axes.iter().map(|&d| dims[d]).product();

    if kept_dims.iter().product::<usize>() != out_size {
        return Err(CascadeError::Device(format!(
            "{}: output size {} does not match the reduced shape",
            inv.kernel(),
            out_size
        )));
    }

    let out = map_items(inv, out_size, |o| {
        // Offset of the first input element folded into output `o`.
        let mut rest = o;
        let mut base = 0;
        for d in (0..rank).rev() {
            base += (rest % kept_dims[d]) * strides[d];
            rest /= kept_dims[d];
        }
        let mut acc = T::zero();
        for r in 0..reduce_count {
            let mut rest = r;
            let mut offset = base;
            for &d in reduced_axes.iter().rev() {
                offset += (rest % dims[d]) * strides[d];
                rest /= dims[d];
            }
            acc = acc.add(input[offset]);
        }
        acc
    })?;
    inv.write(1, &out)
}
