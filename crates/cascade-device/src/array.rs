//! Multi-dimensional arrays living in device memory.
//!
//! A [`MultiArray`] is a shape and element type over a pool buffer, plus the
//! event that fires when the command producing its contents finishes. Arrays
//! also hold strong references to everything the producing command reads
//! (input arrays, side-data buffers) so none of it is recycled while that
//! command may still be queued.

use std::fmt;
use std::sync::Arc;

use cascade_core::dtype::bytes_to_f64;
use cascade_core::{CascadeError, DType, Element, Result, Shape};
use parking_lot::Mutex;

use crate::event::Event;
use crate::memory::{Deferred, DeviceBuffer};
use crate::queue::CommandQueue;

pub type MultiArrayRef = Arc<MultiArray>;

/// Something an array keeps alive until its completion event fires.
#[derive(Debug, Clone)]
pub enum Dependency {
    Array(MultiArrayRef),
    Buffer(DeviceBuffer),
}

impl From<MultiArrayRef> for Dependency {
    fn from(array: MultiArrayRef) -> Self {
        Dependency::Array(array)
    }
}

impl From<&MultiArrayRef> for Dependency {
    fn from(array: &MultiArrayRef) -> Self {
        Dependency::Array(Arc::clone(array))
    }
}

impl From<DeviceBuffer> for Dependency {
    fn from(buffer: DeviceBuffer) -> Self {
        Dependency::Buffer(buffer)
    }
}

impl From<&DeviceBuffer> for Dependency {
    fn from(buffer: &DeviceBuffer) -> Self {
        Dependency::Buffer(buffer.clone())
    }
}

pub struct MultiArray {
    shape: Shape,
    dtype: DType,
    buffer: Option<DeviceBuffer>,
    queue: CommandQueue,
    completion: Mutex<Event>,
    dependencies: Mutex<Vec<Dependency>>,
    label: Mutex<Option<String>>,
}

impl MultiArray {
    pub(crate) fn new(
        shape: Shape,
        dtype: DType,
        buffer: DeviceBuffer,
        queue: CommandQueue,
        completion: Event,
    ) -> MultiArrayRef {
        Arc::new(Self {
            shape,
            dtype,
            buffer: Some(buffer),
            queue,
            completion: Mutex::new(completion),
            dependencies: Mutex::new(Vec::new()),
            label: Mutex::new(None),
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.shape.size()
    }

    /// Number of bytes the contents occupy.
    pub fn nbytes(&self) -> usize {
        self.dtype.storage_bytes(self.size())
    }

    pub fn buffer(&self) -> &DeviceBuffer {
        match &self.buffer {
            Some(buffer) => buffer,
            None => unreachable!("array buffer is only taken on drop"),
        }
    }

    pub fn completion_event(&self) -> Event {
        self.completion.lock().clone()
    }

    /// Replace the event that marks this array's contents as ready.
    pub fn set_completion_event(&self, event: Event) {
        *self.completion.lock() = event;
    }

    pub fn add_dependencies<I>(&self, dependencies: I)
    where
        I: IntoIterator,
        I::Item: Into<Dependency>,
    {
        self.dependencies
            .lock()
            .extend(dependencies.into_iter().map(Into::into));
    }

    pub fn dependency_count(&self) -> usize {
        self.dependencies.lock().len()
    }

    pub fn set_label(&self, label: impl Into<String>) {
        *self.label.lock() = Some(label.into());
    }

    pub fn label(&self) -> Option<String> {
        self.label.lock().clone()
    }

    /// Whether the producing command has finished, successfully or not.
    pub fn is_ready(&self) -> bool {
        self.completion.lock().is_complete()
    }

    /// Block until the contents are computed.
    pub fn wait_until_ready(&self) -> Result<()> {
        self.completion_event().wait()
    }

    /// Copy the first `out.len()` bytes of the contents into host memory,
    /// blocking until they are ready.
    pub fn read_into(&self, out: &mut [u8]) -> Result<()> {
        if out.len() > self.nbytes() {
            return Err(CascadeError::InvalidArgument(format!(
                "cannot read {} bytes from an array of {} bytes",
                out.len(),
                self.nbytes()
            )));
        }
        let readback = self
            .queue
            .enqueue_read(self.buffer(), out.len(), vec![self.completion_event()])?;
        let bytes = readback.wait()?;
        out.copy_from_slice(&bytes);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; self.nbytes()];
        self.read_into(&mut bytes)?;
        Ok(bytes)
    }

    /// Read the contents back as `T`, which must match the element type.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(CascadeError::TypeMismatch {
                left: self.dtype,
                right: T::DTYPE,
            });
        }
        Ok(bytemuck::pod_collect_to_vec(&self.to_bytes()?))
    }

    /// Read the contents back converted to `f64`.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        Ok(bytes_to_f64(&self.to_bytes()?, self.dtype))
    }

    /// A view with another shape of the same size sharing this array's buffer.
    pub fn reshaped(self: &Arc<Self>, shape: Shape) -> Result<MultiArrayRef> {
        if shape.size() != self.size() {
            return Err(CascadeError::ShapeMismatch {
                expected: self.shape.dims().to_vec(),
                got: shape.dims().to_vec(),
            });
        }
        let view = MultiArray::new(
            shape,
            self.dtype,
            self.buffer().clone(),
            self.queue.clone(),
            self.completion_event(),
        );
        view.add_dependencies([self]);
        Ok(view)
    }
}

impl Drop for MultiArray {
    fn drop(&mut self) {
        let completion = self.completion.get_mut().clone();
        if completion.is_complete() {
            return;
        }
        let Some(pool) = self.buffer.as_ref().and_then(DeviceBuffer::pool) else {
            return;
        };
        pool.defer(
            completion,
            Deferred {
                buffer: self.buffer.take(),
                dependencies: std::mem::take(self.dependencies.get_mut()),
            },
        );
    }
}

impl fmt::Debug for MultiArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiArray")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("label", &*self.label.lock())
            .field("ready", &self.is_ready())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Device;

    #[test]
    fn test_upload_and_read_back() {
        let device = Device::host().unwrap();
        let a = device
            .array_from_slice(Shape::new(&[2, 2]), &[1.0f32, 2.0, 3.0, 4.0])
            .unwrap();
        assert_eq!(a.dtype(), DType::F32);
        assert_eq!(a.nbytes(), 16);
        assert_eq!(a.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(a.to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_to_vec_type_mismatch() {
        let device = Device::host().unwrap();
        let a = device.array_from_slice(Shape::new(&[1]), &[7i32]).unwrap();
        assert!(matches!(
            a.to_vec::<f32>(),
            Err(CascadeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_read_into_partial() {
        let device = Device::host().unwrap();
        let a = device.array_from_slice(Shape::new(&[3]), &[1i8, 2, 3]).unwrap();
        let mut out = [0u8; 2];
        a.read_into(&mut out).unwrap();
        assert_eq!(out, [1, 2]);

        let mut too_big = [0u8; 4];
        assert!(matches!(
            a.read_into(&mut too_big),
            Err(CascadeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_reshaped_shares_buffer() {
        let device = Device::host().unwrap();
        let a = device
            .array_from_slice(Shape::new(&[2, 3]), &[1i64, 2, 3, 4, 5, 6])
            .unwrap();
        let b = a.reshaped(Shape::new(&[3, 2])).unwrap();
        assert_eq!(b.buffer().block_id(), a.buffer().block_id());
        assert_eq!(b.dependency_count(), 1);
        assert_eq!(b.to_vec::<i64>().unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert!(a.reshaped(Shape::new(&[4])).is_err());
    }

    #[test]
    fn test_pending_array_defers_release() {
        let device = Device::host().unwrap();
        let a = device.make_array(Shape::new(&[16]), DType::F32).unwrap();
        let id = a.buffer().block_id();
        let gate = Event::user();
        a.set_completion_event(gate.clone());
        assert!(!a.is_ready());
        drop(a);

        assert_eq!(device.pool().stats().pending_blocks, 1);
        let other = device.make_array(Shape::new(&[16]), DType::F32).unwrap();
        assert_ne!(other.buffer().block_id(), id);

        gate.complete();
        let reused = device.make_array(Shape::new(&[16]), DType::F32).unwrap();
        assert_eq!(reused.buffer().block_id(), id);
    }

    #[test]
    fn test_failed_completion_surfaces_on_read() {
        let device = Device::host().unwrap();
        let a = device.make_array(Shape::new(&[2]), DType::F64).unwrap();
        a.set_completion_event(Event::failed(CascadeError::Device("boom".into())));
        assert_eq!(
            a.wait_until_ready().unwrap_err(),
            CascadeError::Device("boom".into())
        );
        assert!(a.to_f64_vec().is_err());
    }
}
