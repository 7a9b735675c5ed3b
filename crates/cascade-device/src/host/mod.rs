//! Native implementations behind the host device's kernel entry points.
//!
//! Each entry point is generic over the element type; [`lookup`] picks the
//! instantiation matching a program's `scalar_t`. Work items beyond the
//! element count named in the arguments are ignored, as a device kernel
//! would guard them.

use cascade_core::{dispatch_dtype, DType, Element, Result};
use rayon::prelude::*;

use crate::launch::KernelInvocation;

mod elementwise;
mod reduce;
mod transform;

pub type HostKernelFn = fn(&KernelInvocation<'_>) -> Result<()>;

const PAR_THRESHOLD: usize = 8192;

/// Host implementation of kernel `entry` for `dtype`, if there is one.
pub fn lookup(entry: &str, dtype: DType) -> Option<HostKernelFn> {
    dispatch_dtype!(dtype, T => lookup_typed::<T>(entry))
}

fn lookup_typed<T: Element>(entry: &str) -> Option<HostKernelFn> {
    let f: HostKernelFn = match entry {
        "plus" => elementwise::plus::<T>,
        "minus" => elementwise::minus::<T>,
        "multiply" => elementwise::multiply::<T>,
        "divide" => elementwise::divide::<T>,
        "fill" => transform::fill::<T>,
        "scale" => transform::scale::<T>,
        "negate" => transform::negate::<T>,
        "reduce_sum" => reduce::reduce_sum::<T>,
        _ => return None,
    };
    Some(f)
}

/// Evaluate `f` for every output index in `0..n`, in parallel for large `n`.
fn map_items<T, F>(inv: &KernelInvocation<'_>, n: usize, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    inv.check_coverage(n)?;
    Ok(if n >= PAR_THRESHOLD {
        (0..n).into_par_iter().map(f).collect()
    } else {
        (0..n).map(f).collect()
    })
}

/// Like [`map_items`], but the first failing item aborts the launch.
fn try_map_items<T, F>(inv: &KernelInvocation<'_>, n: usize, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(usize) -> Result<T> + Sync + Send,
{
    inv.check_coverage(n)?;
    if n >= PAR_THRESHOLD {
        (0..n).into_par_iter().map(f).collect()
    } else {
        (0..n).map(f).collect()
    }
}

/// Element count argument, checked against a buffer's element capacity.
fn count_arg(inv: &KernelInvocation<'_>, index: usize, capacity: usize) -> Result<usize> {
    let n = inv.u64(index)? as usize;
    if n > capacity {
        return Err(cascade_core::CascadeError::Device(format!(
            "{}: size {} exceeds buffer capacity of {} elements",
            inv.kernel(),
            n,
            capacity
        )));
    }
    Ok(n)
}
