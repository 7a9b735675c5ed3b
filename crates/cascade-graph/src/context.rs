//! Device-bound value store.

use std::collections::HashMap;
use std::sync::Arc;

use cascade_core::{CascadeError, DType, Element, Result, Shape};
use cascade_device::{Device, MultiArrayRef};
use parking_lot::RwLock;

use crate::executor::Executor;
use crate::node::{NodeId, NodeRef};

pub type ContextRef = Arc<Context>;

/// Values persisted on one device, typically trainable variables.
///
/// A node with a stored value is never recomputed: evaluation uses the
/// stored array and does not visit the node's inputs.
pub struct Context {
    device: Device,
    store: RwLock<HashMap<NodeId, MultiArrayRef>>,
}

impl Context {
    pub fn make_for_device(device: &Device) -> ContextRef {
        Arc::new(Self {
            device: device.clone(),
            store: RwLock::new(HashMap::new()),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Upload `data` as the value of `node`, converting to the node's
    /// element type.
    pub fn init<T: Element>(&self, node: &NodeRef, data: &[T], shape: &Shape) -> Result<MultiArrayRef> {
        check_shape(node, shape)?;
        let array = self
            .device
            .array_from_slice_as(shape.clone(), data, node.dtype())?;
        self.bind(node, Arc::clone(&array));
        Ok(array)
    }

    /// Upload raw bytes already encoded as `dtype`.
    pub fn init_bytes(
        &self,
        node: &NodeRef,
        bytes: Vec<u8>,
        dtype: DType,
        shape: &Shape,
    ) -> Result<MultiArrayRef> {
        check_shape(node, shape)?;
        check_dtype(node, dtype)?;
        let array = self.device.array_from_bytes(shape.clone(), dtype, bytes)?;
        self.bind(node, Arc::clone(&array));
        Ok(array)
    }

    /// Bind an existing array, e.g. the result of a previous evaluation.
    pub fn init_array(&self, node: &NodeRef, array: MultiArrayRef) -> Result<()> {
        check_shape(node, array.shape())?;
        check_dtype(node, array.dtype())?;
        self.bind(node, array);
        Ok(())
    }

    fn bind(&self, node: &NodeRef, array: MultiArrayRef) {
        tracing::trace!("{}: bound {} {}", self.device.label(), node.label(), array.shape());
        self.store.write().insert(node.id(), array);
    }

    pub fn get(&self, node: &NodeRef) -> Option<MultiArrayRef> {
        self.get_by_id(node.id())
    }

    pub(crate) fn get_by_id(&self, id: NodeId) -> Option<MultiArrayRef> {
        self.store.read().get(&id).cloned()
    }

    pub fn contains(&self, node: &NodeRef) -> bool {
        self.store.read().contains_key(&node.id())
    }

    pub fn remove(&self, node: &NodeRef) -> Option<MultiArrayRef> {
        self.store.write().remove(&node.id())
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    /// Evaluate `nodes` against this context's store.
    pub fn eval(self: &Arc<Self>, nodes: &[NodeRef]) -> Result<Vec<MultiArrayRef>> {
        Executor::new(Arc::clone(self), nodes.to_vec()).run()
    }
}

pub(crate) fn check_shape(node: &NodeRef, shape: &Shape) -> Result<()> {
    if node.shape() != shape {
        return Err(CascadeError::ShapeMismatch {
            expected: node.shape().dims().to_vec(),
            got: shape.dims().to_vec(),
        });
    }
    Ok(())
}

pub(crate) fn check_dtype(node: &NodeRef, dtype: DType) -> Result<()> {
    if node.dtype() != dtype {
        return Err(CascadeError::TypeMismatch {
            left: node.dtype(),
            right: dtype,
        });
    }
    Ok(())
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.device.label())
            .field("values", &self.len())
            .finish()
    }
}
