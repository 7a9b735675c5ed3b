//! Explicitly constructed compute devices.
//!
//! A [`Device`] bundles one context, one in-order command queue and one
//! buffer pool. There is no global device registry: callers create devices
//! and pass them where needed, so independent devices can coexist.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::Pod;
use cascade_core::{dtype::cast_to_bytes, CascadeError, DType, Element, Result, Shape};

use crate::array::{MultiArray, MultiArrayRef};
use crate::config::DeviceConfig;
use crate::event::Event;
use crate::memory::{BufferPool, DeviceBuffer};
use crate::program::{KernelCache, Program};
use crate::queue::CommandQueue;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a device context. Programs are built per context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(id: u64) -> Self {
        ContextId(id)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

struct DeviceInner {
    context: ContextId,
    config: DeviceConfig,
    queue: CommandQueue,
    pool: BufferPool,
    kernels: Arc<KernelCache>,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        tracing::info!(
            "{}: releasing device ({} bytes pooled)",
            self.config.label,
            self.pool.stats().allocated_bytes
        );
    }
}

/// Handle to a compute device. Clones share the same device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        Self::with_kernel_cache(config, Arc::new(KernelCache::new()))
    }

    /// A host device with the default configuration.
    pub fn host() -> Result<Self> {
        Self::new(DeviceConfig::default())
    }

    /// Create a device that shares `kernels` with other devices. Programs are
    /// still built separately for each device's context.
    pub fn with_kernel_cache(config: DeviceConfig, kernels: Arc<KernelCache>) -> Result<Self> {
        config.validate()?;
        let context = ContextId::next();
        let queue = CommandQueue::new(config.label.clone())?;
        let pool = BufferPool::new(
            config.label.clone(),
            config.min_block_size,
            config.memory_limit,
        );
        tracing::info!(
            "{}: device ready (context {}, work group {}, memory limit {:?})",
            config.label,
            context.raw(),
            config.work_group_size,
            config.memory_limit
        );
        Ok(Self {
            inner: Arc::new(DeviceInner {
                context,
                config,
                queue,
                pool,
                kernels,
            }),
        })
    }

    pub fn context_id(&self) -> ContextId {
        self.inner.context
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    pub fn label(&self) -> &str {
        &self.inner.config.label
    }

    pub fn work_group_size(&self) -> usize {
        self.inner.config.work_group_size
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.inner.queue
    }

    pub fn pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    pub fn kernel_cache(&self) -> &Arc<KernelCache> {
        &self.inner.kernels
    }

    /// Whether two handles refer to the same device.
    pub fn same_device(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Build `source` for this device's context, or fetch it from the cache.
    pub fn get_program(&self, name: &str, source: &str, options: &str) -> Result<Arc<Program>> {
        self.inner
            .kernels
            .get_program(self.inner.context, name, source, options)
    }

    pub fn allocate(&self, bytes: usize) -> Result<DeviceBuffer> {
        self.inner.pool.allocate(bytes)
    }

    /// An uninitialised array whose completion event has already fired.
    /// Producers replace the event once they enqueue the command filling it.
    pub fn make_array(&self, shape: Shape, dtype: DType) -> Result<MultiArrayRef> {
        let buffer = self.allocate(dtype.storage_bytes(shape.size()))?;
        Ok(MultiArray::new(
            shape,
            dtype,
            buffer,
            self.inner.queue.clone(),
            Event::completed(),
        ))
    }

    /// Allocate a buffer sized for `data` and enqueue its upload.
    pub fn reserve_buffer_for_vector<T: Pod>(&self, data: &[T]) -> Result<(DeviceBuffer, Event)> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buffer = self.allocate(bytes.len())?;
        let event = self
            .inner
            .queue
            .enqueue_write(&buffer, bytes.to_vec(), Vec::new())?;
        Ok((buffer, event))
    }

    /// Upload raw bytes of `dtype` as a new array.
    pub fn array_from_bytes(&self, shape: Shape, dtype: DType, bytes: Vec<u8>) -> Result<MultiArrayRef> {
        let expected = dtype.storage_bytes(shape.size());
        if bytes.len() != expected {
            return Err(CascadeError::InvalidArgument(format!(
                "{} bytes given for a {} array of shape {} ({} bytes)",
                bytes.len(),
                dtype,
                shape,
                expected
            )));
        }
        let array = self.make_array(shape, dtype)?;
        let event = self
            .inner
            .queue
            .enqueue_write(array.buffer(), bytes, Vec::new())?;
        array.set_completion_event(event);
        Ok(array)
    }

    /// Upload host values as a new array of `T`'s element type.
    pub fn array_from_slice<T: Element>(&self, shape: Shape, data: &[T]) -> Result<MultiArrayRef> {
        self.array_from_bytes(shape, T::DTYPE, bytemuck::cast_slice(data).to_vec())
    }

    /// Upload host values converted to `dtype`.
    pub fn array_from_slice_as<T: Element>(
        &self,
        shape: Shape,
        data: &[T],
        dtype: DType,
    ) -> Result<MultiArrayRef> {
        self.array_from_bytes(shape, dtype, cast_to_bytes(data, dtype))
    }

    /// Block until every command enqueued so far has run.
    pub fn finish(&self) -> Result<()> {
        self.inner.queue.finish()
    }

    /// Drain the queue and stop its worker. Later enqueues fail.
    pub fn shutdown(&self) {
        self.inner.queue.shutdown();
        tracing::info!("{}: queue shut down", self.label());
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("label", &self.inner.config.label)
            .field("context", &self.inner.context)
            .field("pool", &self.inner.pool.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_contexts() {
        let a = Device::host().unwrap();
        let b = Device::host().unwrap();
        assert_ne!(a.context_id(), b.context_id());
        assert!(a.same_device(&a.clone()));
        assert!(!a.same_device(&b));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = Device::new(DeviceConfig::default().with_work_group_size(3)).unwrap_err();
        assert!(matches!(err, CascadeError::Config(_)));
    }

    #[test]
    fn test_reserve_buffer_for_vector() {
        let device = Device::host().unwrap();
        let (buffer, event) = device.reserve_buffer_for_vector(&[3u64, 1]).unwrap();
        assert_eq!(buffer.len(), 16);
        event.wait().unwrap();
        let bytes = device
            .queue()
            .enqueue_read(&buffer, 16, Vec::new())
            .unwrap()
            .wait()
            .unwrap();
        let values: Vec<u64> = bytemuck::pod_collect_to_vec(&bytes);
        assert_eq!(values, vec![3, 1]);
    }

    #[test]
    fn test_array_from_bytes_checks_length() {
        let device = Device::host().unwrap();
        assert!(matches!(
            device.array_from_bytes(Shape::new(&[2]), DType::F32, vec![0; 4]),
            Err(CascadeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_array_from_slice_as_casts() {
        let device = Device::host().unwrap();
        let a = device
            .array_from_slice_as(Shape::new(&[3]), &[1.0f64, 2.5, -3.0], DType::F16)
            .unwrap();
        assert_eq!(a.dtype(), DType::F16);
        assert_eq!(a.to_f64_vec().unwrap(), vec![1.0, 2.5, -3.0]);
    }

    #[test]
    fn test_shared_kernel_cache_builds_per_context() {
        let cache = Arc::new(KernelCache::new());
        let a = Device::with_kernel_cache(DeviceConfig::default(), Arc::clone(&cache)).unwrap();
        let b = Device::with_kernel_cache(DeviceConfig::default(), Arc::clone(&cache)).unwrap();
        let src = crate::kernels::TRANSFORM.specialize(DType::F32);
        a.get_program("transform", &src, "").unwrap();
        a.get_program("transform", &src, "").unwrap();
        b.get_program("transform", &src, "").unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_shutdown() {
        let device = Device::host().unwrap();
        device.finish().unwrap();
        device.shutdown();
        assert!(device.array_from_slice(Shape::new(&[1]), &[1.0f32]).is_err());
    }
}
