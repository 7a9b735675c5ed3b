//! # cascade-device
//!
//! Device layer for the Cascade tensor engine.
//!
//! Provides:
//! - Explicitly constructed `Device` contexts, each with one in-order
//!   command queue and one buffer pool
//! - Completion `Event`s chained through command wait-lists
//! - `MultiArray` values whose buffers are recycled only after their
//!   producing command has finished
//! - A per-context program cache and native host kernels
//! - Dispatch helpers in [`ops`] that enqueue kernels without blocking

pub mod array;
pub mod config;
pub mod device;
pub mod event;
mod host;
pub mod kernels;
pub mod launch;
pub mod memory;
pub mod ops;
pub mod program;
pub mod queue;

pub use array::{Dependency, MultiArray, MultiArrayRef};
pub use config::DeviceConfig;
pub use device::{ContextId, Device};
pub use event::{Event, EventStatus};
pub use launch::{KernelArg, LaunchConfig};
pub use memory::{BufferPool, DeviceBuffer, PoolStats};
pub use ops::BinaryOpKind;
pub use program::{CacheStats, Kernel, KernelCache, Program};
pub use queue::{CommandQueue, Readback};
