use thiserror::Error;

use crate::dtype::DType;

/// Errors raised anywhere in the Cascade engine.
///
/// Shape and type errors are raised while a graph is being built. Unbound
/// variables and compilation failures are raised on first evaluation. Device
/// failures are carried by completion events and surface when a dependent
/// result is awaited or read.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CascadeError {
    #[error("dimension index {index} is out of range for a shape of rank {rank}")]
    OutOfRange { index: isize, rank: usize },

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("shapes {left:?} and {right:?} cannot be broadcast together")]
    IncompatibleShapes { left: Vec<usize>, right: Vec<usize> },

    #[error("invalid reshape of {from:?} to {target:?}: {reason}")]
    InvalidReshape {
        from: Vec<usize>,
        target: Vec<isize>,
        reason: String,
    },

    #[error("element type mismatch: {left} vs {right}")]
    TypeMismatch { left: DType, right: DType },

    #[error("unsupported element type {0} for this operation")]
    UnsupportedType(DType),

    #[error("variable '{name}' has no value bound in the context")]
    UnboundVariable { name: String },

    #[error("failed to compile program '{program}':\n{log}")]
    Compilation { program: String, log: String },

    #[error("kernel '{kernel}' not found in program '{program}'")]
    KernelNotFound { program: String, kernel: String },

    #[error("device out of memory: requested {requested} bytes, {available} bytes available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("device error: {0}")]
    Device(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cannot differentiate node {node} with respect to {input}: not one of its inputs")]
    NotAnInput { node: String, input: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl CascadeError {
    /// Whether this error belongs to the shape family (raised at graph-build time).
    pub fn is_shape_error(&self) -> bool {
        matches!(
            self,
            CascadeError::OutOfRange { .. }
                | CascadeError::ShapeMismatch { .. }
                | CascadeError::IncompatibleShapes { .. }
                | CascadeError::InvalidReshape { .. }
        )
    }

    /// Whether this error originated on the device while executing a command.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            CascadeError::Device(_) | CascadeError::OutOfMemory { .. }
        )
    }
}
