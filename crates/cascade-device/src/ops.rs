//! Kernel dispatch: from `MultiArray` operands to an enqueued launch.
//!
//! Every function here returns immediately. The output array carries the
//! launch's completion event and holds its operands and side buffers as
//! dependencies until that event fires.

use std::fmt;
use std::sync::Arc;

use cascade_core::{Broadcast, CascadeError, DType, Result, Shape};

use crate::array::MultiArrayRef;
use crate::device::Device;
use crate::event::Event;
use crate::kernels::{KernelSource, ELEMENTWISE_BROADCASTED, REDUCE, TRANSFORM};
use crate::launch::{KernelArg, LaunchConfig};
use crate::program::Kernel;

/// The broadcasted element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOpKind {
    Plus,
    Minus,
    Multiply,
    Divide,
}

impl BinaryOpKind {
    /// Kernel entry point name.
    pub fn name(&self) -> &'static str {
        match self {
            BinaryOpKind::Plus => "plus",
            BinaryOpKind::Minus => "minus",
            BinaryOpKind::Multiply => "multiply",
            BinaryOpKind::Divide => "divide",
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOpKind::Plus => "+",
            BinaryOpKind::Minus => "-",
            BinaryOpKind::Multiply => "*",
            BinaryOpKind::Divide => "/",
        }
    }
}

impl fmt::Display for BinaryOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

fn kernel_for(device: &Device, source: &KernelSource, dtype: DType, entry: &str) -> Result<Kernel> {
    let program = device.get_program(source.name, &source.specialize(dtype), "")?;
    program.kernel(entry)
}

fn check_device(device: &Device, array: &MultiArrayRef) -> Result<()> {
    match array.buffer().pool() {
        Some(pool) if Arc::ptr_eq(&pool, device.pool().shared()) => Ok(()),
        _ => Err(CascadeError::InvalidArgument(format!(
            "array of shape {} does not belong to device {}",
            array.shape(),
            device.label()
        ))),
    }
}

/// Element-wise `left <kind> right` over the broadcast result shape.
///
/// The size masks and result sub-sizes are uploaded to small device buffers;
/// the launch waits on those uploads and on both operands' completion.
pub fn broadcasted_binary(
    device: &Device,
    kind: BinaryOpKind,
    left: &MultiArrayRef,
    right: &MultiArrayRef,
    plan: &Broadcast,
) -> Result<MultiArrayRef> {
    if left.dtype() != right.dtype() {
        return Err(CascadeError::TypeMismatch {
            left: left.dtype(),
            right: right.dtype(),
        });
    }
    for (array, expected) in [(left, &plan.left), (right, &plan.right)] {
        if array.shape() != expected {
            return Err(CascadeError::ShapeMismatch {
                expected: expected.dims().to_vec(),
                got: array.shape().dims().to_vec(),
            });
        }
    }
    check_device(device, left)?;
    check_device(device, right)?;

    let dtype = left.dtype();
    let kernel = kernel_for(device, &ELEMENTWISE_BROADCASTED, dtype, kind.name())?;

    let (left_mask, left_mask_ready) = device.reserve_buffer_for_vector(&plan.masks.left)?;
    let (right_mask, right_mask_ready) = device.reserve_buffer_for_vector(&plan.masks.right)?;
    let (sub_sizes, sub_sizes_ready) =
        device.reserve_buffer_for_vector(&plan.masks.result_sub_sizes)?;

    let result = device.make_array(plan.result.clone(), dtype)?;
    let size = result.size();
    let args = vec![
        KernelArg::buffer(left.buffer()),
        KernelArg::buffer(right.buffer()),
        KernelArg::buffer(result.buffer()),
        KernelArg::buffer(&left_mask),
        KernelArg::buffer(&right_mask),
        KernelArg::buffer(&sub_sizes),
        KernelArg::U64(size as u64),
        KernelArg::I32(plan.masks.rank() as i32),
    ];
    let wait_for = vec![
        left_mask_ready,
        right_mask_ready,
        sub_sizes_ready,
        left.completion_event(),
        right.completion_event(),
    ];
    let done = device.queue().enqueue_kernel(
        &kernel,
        args,
        LaunchConfig::for_elements(size, device.work_group_size()),
        wait_for,
    )?;

    result.add_dependencies([left_mask, right_mask, sub_sizes]);
    result.add_dependencies([left, right]);
    result.set_completion_event(done);
    Ok(result)
}

/// A new array with every element set to `value`.
pub fn fill(device: &Device, shape: Shape, dtype: DType, value: f64) -> Result<MultiArrayRef> {
    let kernel = kernel_for(device, &TRANSFORM, dtype, "fill")?;
    let result = device.make_array(shape, dtype)?;
    let size = result.size();
    let done = device.queue().enqueue_kernel(
        &kernel,
        vec![
            KernelArg::buffer(result.buffer()),
            KernelArg::F64(value),
            KernelArg::U64(size as u64),
        ],
        LaunchConfig::for_elements(size, device.work_group_size()),
        Vec::new(),
    )?;
    result.set_completion_event(done);
    Ok(result)
}

fn unary(
    device: &Device,
    input: &MultiArrayRef,
    entry: &str,
    extra: Option<KernelArg>,
) -> Result<MultiArrayRef> {
    check_device(device, input)?;
    let kernel = kernel_for(device, &TRANSFORM, input.dtype(), entry)?;
    let result = device.make_array(input.shape().clone(), input.dtype())?;
    let size = result.size();

    let mut args = vec![
        KernelArg::buffer(input.buffer()),
        KernelArg::buffer(result.buffer()),
    ];
    args.extend(extra);
    args.push(KernelArg::U64(size as u64));

    let done = device.queue().enqueue_kernel(
        &kernel,
        args,
        LaunchConfig::for_elements(size, device.work_group_size()),
        vec![input.completion_event()],
    )?;
    result.add_dependencies([input]);
    result.set_completion_event(done);
    Ok(result)
}

/// `input * factor`, element-wise.
pub fn scale(device: &Device, input: &MultiArrayRef, factor: f64) -> Result<MultiArrayRef> {
    unary(device, input, "scale", Some(KernelArg::F64(factor)))
}

/// `-input`, element-wise.
pub fn negate(device: &Device, input: &MultiArrayRef) -> Result<MultiArrayRef> {
    unary(device, input, "negate", None)
}

/// Sum `input` over `dims`, producing an array of `out_shape`.
///
/// `out_shape` must hold as many elements as the input with every reduced
/// dimension set to 1; the data is laid out in that keep-dims order.
pub fn reduce_sum(
    device: &Device,
    input: &MultiArrayRef,
    dims: &[usize],
    out_shape: Shape,
) -> Result<MultiArrayRef> {
    check_device(device, input)?;
    let in_shape = input.shape();
    if let Some(&bad) = dims.iter().find(|&&d| d >= in_shape.rank()) {
        return Err(CascadeError::OutOfRange {
            index: bad as isize,
            rank: in_shape.rank(),
        });
    }
    let kept = in_shape.reduced(dims, true);
    if kept.size() != out_shape.size() {
        return Err(CascadeError::ShapeMismatch {
            expected: kept.dims().to_vec(),
            got: out_shape.dims().to_vec(),
        });
    }

    let dtype = input.dtype();
    let result = device.make_array(out_shape, dtype)?;
    let out_size = result.size();

    if in_shape.is_scalar() {
        // Nothing to fold: the sum of a single element is a copy.
        let kernel = kernel_for(device, &TRANSFORM, dtype, "scale")?;
        let done = device.queue().enqueue_kernel(
            &kernel,
            vec![
                KernelArg::buffer(input.buffer()),
                KernelArg::buffer(result.buffer()),
                KernelArg::F64(1.0),
                KernelArg::U64(out_size as u64),
            ],
            LaunchConfig::for_elements(out_size, device.work_group_size()),
            vec![input.completion_event()],
        )?;
        result.add_dependencies([input]);
        result.set_completion_event(done);
        return Ok(result);
    }

    let kernel = kernel_for(device, &REDUCE, dtype, "reduce_sum")?;
    let in_dims: Vec<u64> = in_shape.dims().iter().map(|&d| d as u64).collect();
    let flags: Vec<u64> = (0..in_shape.rank())
        .map(|d| u64::from(dims.contains(&d)))
        .collect();
    let (dims_buffer, dims_ready) = device.reserve_buffer_for_vector(&in_dims)?;
    let (flags_buffer, flags_ready) = device.reserve_buffer_for_vector(&flags)?;

    let done = device.queue().enqueue_kernel(
        &kernel,
        vec![
            KernelArg::buffer(input.buffer()),
            KernelArg::buffer(result.buffer()),
            KernelArg::buffer(&dims_buffer),
            KernelArg::buffer(&flags_buffer),
            KernelArg::I32(in_shape.rank() as i32),
            KernelArg::U64(out_size as u64),
        ],
        LaunchConfig::for_elements(out_size, device.work_group_size()),
        vec![dims_ready, flags_ready, input.completion_event()],
    )?;
    result.add_dependencies([dims_buffer, flags_buffer]);
    result.add_dependencies([input]);
    result.set_completion_event(done);
    Ok(result)
}

/// An event that fires once every array in `arrays` is ready, without
/// blocking the caller.
pub fn join(device: &Device, arrays: &[MultiArrayRef]) -> Result<Event> {
    device
        .queue()
        .enqueue_marker(arrays.iter().map(|a| a.completion_event()).collect())
}
