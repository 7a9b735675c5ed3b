//! # cascade-core
//!
//! Value types shared by every layer of the Cascade tensor engine:
//! - Element types (`I8` through `F64`) and the host `Element` trait
//! - Immutable `Shape` with NumPy-style broadcasting alignment
//! - Size-mask tables for broadcasted element-wise kernels
//! - The `CascadeError` taxonomy

pub mod broadcast;
pub mod dtype;
pub mod error;
pub mod prelude;
pub mod shape;

pub use half;

pub use broadcast::{Broadcast, SizeMasks};
pub use dtype::{DType, Element};
pub use error::CascadeError;
pub use shape::Shape;

pub type Result<T> = std::result::Result<T, CascadeError>;
