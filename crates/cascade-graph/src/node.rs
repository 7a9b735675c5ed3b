//! Computation graph nodes.
//!
//! A [`Node`] is an immutable DAG vertex: output shape, element type, shared
//! references to its inputs and an [`Op`] payload. The set of operations is
//! closed; host-defined operations plug in through [`CustomOp`].

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cascade_core::{Broadcast, CascadeError, DType, Result, Shape};
use cascade_device::{BinaryOpKind, Device, MultiArrayRef};

use crate::ops;

static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(0);

/// Stable identity of a node, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    fn next() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type NodeRef = Arc<Node>;

/// Payload of a broadcasted element-wise binary node.
#[derive(Debug, Clone)]
pub struct BroadcastedBinaryOp {
    pub kind: BinaryOpKind,
    pub plan: Broadcast,
}

/// Payload shared by the sum and mean reductions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reduction {
    /// Reduced input dimensions, sorted.
    pub dims: Vec<usize>,
    pub keep_dims: bool,
    /// Number of input elements folded into each output element.
    pub count: usize,
}

/// A host-defined operation.
///
/// `forward` receives the realised inputs in order and must not block on
/// them: it enqueues work and returns an array whose completion event
/// covers it.
pub trait CustomOp: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn forward(&self, device: &Device, inputs: &[MultiArrayRef]) -> Result<MultiArrayRef>;

    fn participates_in_differentiation(&self) -> bool {
        false
    }

    /// Gradient flowing to input `index`, given the gradient `grad` of the
    /// target with respect to this node's output.
    fn apply_chain_rule(
        &self,
        _index: usize,
        _grad: &NodeRef,
        _inputs: &[NodeRef],
    ) -> Result<Option<NodeRef>> {
        Ok(None)
    }
}

/// What a node computes.
#[derive(Debug, Clone)]
pub enum Op {
    /// Differentiable leaf whose value comes from the context store.
    Variable { name: String },
    /// Constant filled with one value.
    Fill { value: f64 },
    Binary(BroadcastedBinaryOp),
    Negate,
    Scale { factor: f64 },
    ReduceSum(Reduction),
    ReduceMean(Reduction),
    /// Zero-copy view with the node's shape.
    Reshape,
    /// Passes its input through and blocks differentiation.
    NoBackProp,
    /// The input's dimensions as an `I64` vector.
    ShapeOf,
    /// Product of the selected input dimensions as a scalar.
    ProductOfDims { dims: Vec<usize> },
    Custom(Arc<dyn CustomOp>),
}

impl Op {
    pub fn name(&self) -> &str {
        match self {
            Op::Variable { .. } => "variable",
            Op::Fill { .. } => "fill",
            Op::Binary(b) => b.kind.name(),
            Op::Negate => "negate",
            Op::Scale { .. } => "scale",
            Op::ReduceSum(_) => "reduce_sum",
            Op::ReduceMean(_) => "reduce_mean",
            Op::Reshape => "reshape",
            Op::NoBackProp => "no_back_prop",
            Op::ShapeOf => "shape_of",
            Op::ProductOfDims { .. } => "product_of_dims",
            Op::Custom(op) => op.name(),
        }
    }
}

pub struct Node {
    id: NodeId,
    shape: Shape,
    dtype: DType,
    inputs: Vec<NodeRef>,
    op: Op,
}

impl Node {
    pub(crate) fn new(op: Op, shape: Shape, dtype: DType, inputs: Vec<NodeRef>) -> NodeRef {
        Arc::new(Self {
            id: NodeId::next(),
            shape,
            dtype,
            inputs,
            op,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn inputs(&self) -> &[NodeRef] {
        &self.inputs
    }

    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn is_variable(&self) -> bool {
        matches!(self.op, Op::Variable { .. })
    }

    /// Short name for diagnostics, e.g. `plus#12` or `x#3`.
    pub fn label(&self) -> String {
        match &self.op {
            Op::Variable { name } => format!("{}{}", name, self.id),
            op => format!("{}{}", op.name(), self.id),
        }
    }

    /// Whether gradients flow into this node.
    pub fn participates_in_differentiation(&self) -> bool {
        match &self.op {
            Op::Variable { .. }
            | Op::Binary(_)
            | Op::Negate
            | Op::Scale { .. }
            | Op::ReduceSum(_)
            | Op::ReduceMean(_)
            | Op::Reshape => true,
            Op::Fill { .. } | Op::NoBackProp | Op::ShapeOf | Op::ProductOfDims { .. } => false,
            Op::Custom(op) => op.participates_in_differentiation(),
        }
    }

    /// Enqueue this node's computation over already realised inputs.
    ///
    /// Variables have no forward step: their values come from the context.
    pub fn forward(&self, device: &Device, inputs: &[MultiArrayRef]) -> Result<MultiArrayRef> {
        if inputs.len() != self.inputs.len() {
            return Err(CascadeError::InvalidArgument(format!(
                "{} expects {} inputs, got {}",
                self.label(),
                self.inputs.len(),
                inputs.len()
            )));
        }
        match &self.op {
            Op::Variable { name } => Err(CascadeError::UnboundVariable { name: name.clone() }),
            Op::Fill { value } => {
                cascade_device::ops::fill(device, self.shape.clone(), self.dtype, *value)
            }
            Op::Binary(b) => cascade_device::ops::broadcasted_binary(
                device,
                b.kind,
                &inputs[0],
                &inputs[1],
                &b.plan,
            ),
            Op::Negate => cascade_device::ops::negate(device, &inputs[0]),
            Op::Scale { factor } => cascade_device::ops::scale(device, &inputs[0], *factor),
            Op::ReduceSum(r) => {
                cascade_device::ops::reduce_sum(device, &inputs[0], &r.dims, self.shape.clone())
            }
            Op::ReduceMean(r) => {
                let sum = cascade_device::ops::reduce_sum(
                    device,
                    &inputs[0],
                    &r.dims,
                    self.shape.clone(),
                )?;
                cascade_device::ops::scale(device, &sum, 1.0 / r.count as f64)
            }
            Op::Reshape => inputs[0].reshaped(self.shape.clone()),
            Op::NoBackProp => Ok(Arc::clone(&inputs[0])),
            Op::ShapeOf => {
                let dims: Vec<i64> = inputs[0].shape().dims().iter().map(|&d| d as i64).collect();
                device.array_from_slice(self.shape.clone(), &dims)
            }
            Op::ProductOfDims { dims } => {
                let shape = inputs[0].shape();
                let product: usize = dims.iter().filter_map(|&d| shape.dims().get(d)).product();
                device.array_from_slice_as(Shape::scalar(), &[product as f64], self.dtype)
            }
            Op::Custom(op) => op.forward(device, inputs),
        }
    }

    /// The gradient contribution flowing into `wrt`, given `grad`, the
    /// gradient of the target with respect to this node.
    ///
    /// When `wrt` appears at several input positions the contributions are
    /// summed. `Ok(None)` means no gradient flows to `wrt`. Fails with
    /// `NotAnInput` when `wrt` is not one of this node's inputs, and with
    /// `InvalidArgument` when `all_inputs` is not this node's input list.
    pub fn apply_chain_rule(
        &self,
        wrt: &NodeRef,
        grad: &NodeRef,
        all_inputs: &[NodeRef],
    ) -> Result<Option<NodeRef>> {
        let positions: Vec<usize> = self
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, input)| input.id == wrt.id)
            .map(|(i, _)| i)
            .collect();
        if positions.is_empty() {
            return Err(CascadeError::NotAnInput {
                node: self.label(),
                input: wrt.label(),
            });
        }
        let matches_own = all_inputs.len() == self.inputs.len()
            && all_inputs.iter().zip(&self.inputs).all(|(a, b)| a.id == b.id);
        if !matches_own {
            return Err(CascadeError::InvalidArgument(format!(
                "{}: chain rule given inputs [{}], expected [{}]",
                self.label(),
                labels(all_inputs),
                labels(&self.inputs)
            )));
        }

        let mut total: Option<NodeRef> = None;
        for index in positions {
            let Some(part) = self.chain_rule_at(index, grad, &self.inputs)? else {
                continue;
            };
            total = Some(match total {
                Some(acc) => ops::plus(&acc, &part)?,
                None => part,
            });
        }
        Ok(total)
    }

    fn chain_rule_at(
        &self,
        index: usize,
        grad: &NodeRef,
        inputs: &[NodeRef],
    ) -> Result<Option<NodeRef>> {
        let input = &inputs[index];
        match &self.op {
            Op::Variable { .. }
            | Op::Fill { .. }
            | Op::NoBackProp
            | Op::ShapeOf
            | Op::ProductOfDims { .. } => Ok(None),
            Op::Binary(b) => ops::arithmetic::binary_chain_rule(b, index, grad, inputs).map(Some),
            Op::Negate => Ok(Some(ops::negate(grad))),
            Op::Scale { factor } => Ok(Some(ops::scale(grad, *factor))),
            Op::ReduceSum(r) => ops::reduction::sum_chain_rule(r, input, grad).map(Some),
            Op::ReduceMean(r) => {
                let spread = ops::reduction::sum_chain_rule(r, input, grad)?;
                Ok(Some(ops::scale(&spread, 1.0 / r.count as f64)))
            }
            Op::Reshape => ops::reshape_to(grad, input.shape().clone()).map(Some),
            Op::Custom(op) => op.apply_chain_rule(index, grad, inputs),
        }
    }
}

// Unlink inputs iteratively so dropping a long chain does not recurse.
impl Drop for Node {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.inputs);
        while let Some(input) = pending.pop() {
            if let Ok(mut node) = Arc::try_unwrap(input) {
                pending.append(&mut node.inputs);
            }
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("op", &self.op.name())
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field(
                "inputs",
                &self.inputs.iter().map(|i| i.id).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn labels(nodes: &[NodeRef]) -> String {
    nodes.iter().map(|n| n.label()).collect::<Vec<_>>().join(", ")
}

fn write_dims(f: &mut fmt::Formatter<'_>, dims: &[usize]) -> fmt::Result {
    f.write_str("[")?;
    for (i, d) in dims.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", d)?;
    }
    f.write_str("]")
}

/// Expression form, e.g. `reduce_sum((x * y), [0])`.
impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            Op::Variable { name } => f.write_str(name),
            Op::Fill { value } => write!(f, "fill({}, {})", value, self.shape),
            Op::Binary(b) => write!(
                f,
                "({} {} {})",
                self.inputs[0], b.kind.symbol(), self.inputs[1]
            ),
            Op::Negate => write!(f, "(-{})", self.inputs[0]),
            Op::Scale { factor } => write!(f, "({} * {})", self.inputs[0], factor),
            Op::ReduceSum(r) | Op::ReduceMean(r) => {
                write!(f, "{}({}, ", self.op.name(), self.inputs[0])?;
                write_dims(f, &r.dims)?;
                f.write_str(")")
            }
            Op::Reshape => write!(f, "reshape({}, {})", self.inputs[0], self.shape),
            Op::ProductOfDims { dims } => {
                write!(f, "product_of_dims({}, ", self.inputs[0])?;
                write_dims(f, dims)?;
                f.write_str(")")
            }
            Op::NoBackProp | Op::ShapeOf | Op::Custom(_) => {
                write!(f, "{}(", self.op.name())?;
                for (i, input) in self.inputs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", input)?;
                }
                f.write_str(")")
            }
        }
    }
}
