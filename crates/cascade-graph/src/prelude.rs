//! Convenience re-exports for building and running graphs.
//!
//! ```rust
//! use cascade_graph::prelude::*;
//! ```

pub use cascade_core::prelude::*;
pub use cascade_device::{Device, DeviceConfig, MultiArrayRef};

pub use crate::ops;
pub use crate::{
    build_back_propagation_graph, Context, ContextRef, CustomOp, ExecutionCache, Executor,
    GradTable, NodeRef,
};
