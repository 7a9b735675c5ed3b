//! Broadcasted element-wise binary kernels.
//!
//! Arguments: `left, right, out, left_mask, right_mask, result_sub_sizes,
//! size (ulong), rank (int)`.

use cascade_core::broadcast::broadcast_offsets;
use cascade_core::{CascadeError, Element, Result};

use super::{count_arg, try_map_items};
use crate::launch::KernelInvocation;

fn broadcasted<T: Element>(inv: &KernelInvocation<'_>, op: fn(T, T) -> T) -> Result<()> {
    let left: Vec<T> = inv.read(0)?;
    let right: Vec<T> = inv.read(1)?;
    let capacity = inv.capacity::<T>(2)?;
    let left_mask: Vec<u64> = inv.read(3)?;
    let right_mask: Vec<u64> = inv.read(4)?;
    let sub_sizes: Vec<u64> = inv.read(5)?;
    let size = count_arg(inv, 6, capacity)?;
    let rank = inv.i32(7)? as usize;

    if left_mask.len() < rank || right_mask.len() < rank || sub_sizes.len() < rank {
        return Err(CascadeError::Device(format!(
            "{}: mask buffers are shorter than rank {}",
            inv.kernel(),
            rank
        )));
    }
    let (left_mask, right_mask, sub_sizes) =
        (&left_mask[..rank], &right_mask[..rank], &sub_sizes[..rank]);

    let out = try_map_items(inv, size, |id| {
        let (l, r) = broadcast_offsets(id as u64, left_mask, right_mask, sub_sizes);
        match (left.get(l as usize), right.get(r as usize)) {
            (Some(&a), Some(&b)) => Ok(op(a, b)),
            _ => Err(CascadeError::Device(format!(
                "{}: item {} reads offsets ({}, {}) past operands of {} and {} elements",
                inv.kernel(),
                id,
                l,
                r,
                left.len(),
                right.len()
            ))),
        }
    })?;
    inv.write(2, &out)
}

pub(super) fn plus<T: Element>(inv: &KernelInvocation<'_>) -> Result<()> {
    broadcasted::<T>(inv, T::add)
}

pub(super) fn minus<T: Element>(inv: &KernelInvocation<'_>) -> Result<()> {
    broadcasted::<T>(inv, T::sub)
}

pub(super) fn multiply<T: Element>(inv: &KernelInvocation<'_>) -> Result<()> {
    broadcasted::<T>(inv, T::mul)
}

pub(super) fn divide<T: Element>(inv: &KernelInvocation<'_>) -> Result<()> {
    broadcasted::<T>(inv, T::div)
}
