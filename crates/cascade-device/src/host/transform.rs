//! Unary element-wise kernels.

use cascade_core::{Element, Result};

use super::{count_arg, map_items};
use crate::launch::KernelInvocation;

/// `fill(out, value: double, size: ulong)`
pub(super) fn fill<T: Element>(inv: &KernelInvocation<'_>) -> Result<()> {
    let capacity = inv.capacity::<T>(0)?;
    let value = T::from_f64(inv.f64(1)?);
    let size = count_arg(inv, 2, capacity)?;
    let out = map_items(inv, size, |_| value)?;
    inv.write(0, &out)
}

/// `scale(in, out, factor: double, size: ulong)`
pub(super) fn scale<T: Element>(inv: &KernelInvocation<'_>) -> Result<()> {
    let input: Vec<T> = inv.read(0)?;
    let capacity = inv.capacity::<T>(1)?.min(input.len());
    let factor = inv.f64(2)?;
    let size = count_arg(inv, 3, capacity)?;
    let out = map_items(inv, size, |i| T::from_f64(input[i].to_f64() * factor))?;
    inv.write(1, &out)
}

/// `negate(in, out, size: ulong)`
pub(super) fn negate<T: Element>(inv: &KernelInvocation<'_>) -> Result<()> {
    let input: Vec<T> = inv.read(0)?;
    let capacity = inv.capacity::<T>(1)?.min(input.len());
    let size = count_arg(inv, 2, capacity)?;
    let out = map_items(inv, size, |i| input[i].neg())?;
    inv.write(1, &out)
}
