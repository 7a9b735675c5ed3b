//! Kernel launch geometry and argument passing.

use bytemuck::Pod;
use cascade_core::{CascadeError, Result};

use crate::memory::DeviceBuffer;

/// Round `n` up to the next multiple of `divisor`.
pub fn make_divisible_by(divisor: usize, n: usize) -> usize {
    if divisor == 0 {
        return n;
    }
    n.div_ceil(divisor) * divisor
}

/// 1-D launch geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Total work items, always a multiple of `local_size`.
    pub global_size: usize,
    pub local_size: usize,
}

impl LaunchConfig {
    /// Geometry covering `n` elements with groups of `work_group_size`.
    ///
    /// The trailing group may contain work items past `n`; kernels must
    /// ignore them.
    pub fn for_elements(n: usize, work_group_size: usize) -> Self {
        Self {
            global_size: make_divisible_by(work_group_size, n.max(1)),
            local_size: work_group_size,
        }
    }

    pub fn num_groups(&self) -> usize {
        self.global_size / self.local_size.max(1)
    }
}

/// A buffer as seen by a queued command. Holding the handle keeps the block
/// off the free list until the command has run.
#[derive(Clone)]
pub struct BufferArg {
    pub(crate) buffer: DeviceBuffer,
}

/// One kernel argument.
#[derive(Clone)]
pub enum KernelArg {
    Buffer(BufferArg),
    U64(u64),
    I32(i32),
    F64(f64),
}

impl KernelArg {
    pub fn buffer(buffer: &DeviceBuffer) -> Self {
        KernelArg::Buffer(BufferArg {
            buffer: buffer.clone(),
        })
    }

    fn kind(&self) -> &'static str {
        match self {
            KernelArg::Buffer(_) => "buffer",
            KernelArg::U64(_) => "ulong",
            KernelArg::I32(_) => "int",
            KernelArg::F64(_) => "double",
        }
    }
}

impl std::fmt::Debug for KernelArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelArg::Buffer(b) => write!(f, "Buffer(block {}, {} bytes)", b.buffer.block_id(), b.buffer.len()),
            KernelArg::U64(v) => write!(f, "U64({})", v),
            KernelArg::I32(v) => write!(f, "I32({})", v),
            KernelArg::F64(v) => write!(f, "F64({})", v),
        }
    }
}

/// What a host kernel sees when it runs: its arguments and geometry.
pub struct KernelInvocation<'a> {
    kernel: &'a str,
    args: &'a [KernelArg],
    config: LaunchConfig,
}

impl<'a> KernelInvocation<'a> {
    pub fn new(kernel: &'a str, args: &'a [KernelArg], config: LaunchConfig) -> Self {
        Self {
            kernel,
            args,
            config,
        }
    }

    pub fn kernel(&self) -> &str {
        self.kernel
    }

    pub fn global_size(&self) -> usize {
        self.config.global_size
    }

    pub fn local_size(&self) -> usize {
        self.config.local_size
    }

    fn arg(&self, index: usize) -> Result<&KernelArg> {
        self.args.get(index).ok_or_else(|| {
            CascadeError::Device(format!(
                "{}: missing argument {} ({} given)",
                self.kernel,
                index,
                self.args.len()
            ))
        })
    }

    fn wrong_kind(&self, index: usize, expected: &str, got: &KernelArg) -> CascadeError {
        CascadeError::Device(format!(
            "{}: argument {} should be {}, got {}",
            self.kernel,
            index,
            expected,
            got.kind()
        ))
    }

    fn buffer(&self, index: usize) -> Result<&BufferArg> {
        match self.arg(index)? {
            KernelArg::Buffer(b) => Ok(b),
            other => Err(self.wrong_kind(index, "buffer", other)),
        }
    }

    /// How many `T` values buffer argument `index` holds.
    pub fn capacity<T: Pod>(&self, index: usize) -> Result<usize> {
        Ok(self.buffer(index)?.buffer.len() / std::mem::size_of::<T>())
    }

    /// Snapshot the contents of buffer argument `index` as `T` values.
    pub fn read<T: Pod>(&self, index: usize) -> Result<Vec<T>> {
        let arg = self.buffer(index)?;
        let n = arg.buffer.len() / std::mem::size_of::<T>();
        let bytes = arg.buffer.block().bytes.read();
        Ok(bytemuck::pod_collect_to_vec(&bytes[..n * std::mem::size_of::<T>()]))
    }

    /// Write `data` to the start of buffer argument `index`.
    pub fn write<T: Pod>(&self, index: usize, data: &[T]) -> Result<()> {
        let arg = self.buffer(index)?;
        let src: &[u8] = bytemuck::cast_slice(data);
        let len = arg.buffer.len();
        if src.len() > len {
            return Err(CascadeError::Device(format!(
                "{}: writing {} bytes overflows argument {} ({} bytes)",
                self.kernel,
                src.len(),
                index,
                len
            )));
        }
        arg.buffer.block().bytes.write()[..src.len()].copy_from_slice(src);
        Ok(())
    }

    pub fn u64(&self, index: usize) -> Result<u64> {
        match self.arg(index)? {
            KernelArg::U64(v) => Ok(*v),
            other => Err(self.wrong_kind(index, "ulong", other)),
        }
    }

    pub fn i32(&self, index: usize) -> Result<i32> {
        match self.arg(index)? {
            KernelArg::I32(v) => Ok(*v),
            other => Err(self.wrong_kind(index, "int", other)),
        }
    }

    pub fn f64(&self, index: usize) -> Result<f64> {
        match self.arg(index)? {
            KernelArg::F64(v) => Ok(*v),
            other => Err(self.wrong_kind(index, "double", other)),
        }
    }

    /// Check that the launch covers `n` items.
    pub fn check_coverage(&self, n: usize) -> Result<()> {
        if self.config.global_size < n {
            return Err(CascadeError::Device(format!(
                "{}: {} work items cannot cover {} elements",
                self.kernel, self.config.global_size, n
            )));
        }
        Ok(())
    }
}
