//! Convenience re-exports for common cascade-core types.
//!
//! ```rust
//! use cascade_core::prelude::*;
//! ```

pub use crate::Broadcast;
pub use crate::CascadeError;
pub use crate::DType;
pub use crate::Element;
pub use crate::Result;
pub use crate::Shape;
