//! Device configuration.

use std::path::Path;

use cascade_core::{CascadeError, Result};
use serde::{Deserialize, Serialize};

/// Settings for one compute device and its buffer pool.
///
/// Every field has a default, so a JSON file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Name used in logs and diagnostics.
    pub label: String,

    /// Upper bound on bytes held by the pool (live plus free blocks).
    /// `None` means unbounded.
    pub memory_limit: Option<usize>,

    /// Work-group size for 1-D kernel launches. Must be a power of two.
    pub work_group_size: usize,

    /// Smallest pool size class in bytes. Requests are rounded up to a power
    /// of two no smaller than this.
    pub min_block_size: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            label: "host:0".into(),
            memory_limit: None,
            work_group_size: 64,
            min_block_size: 256,
        }
    }
}

impl DeviceConfig {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_work_group_size(mut self, size: usize) -> Self {
        self.work_group_size = size;
        self
    }

    pub fn with_min_block_size(mut self, bytes: usize) -> Self {
        self.min_block_size = bytes;
        self
    }

    /// Parse and validate a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CascadeError::Config(format!("invalid device config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CascadeError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| CascadeError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.work_group_size == 0 || !self.work_group_size.is_power_of_two() {
            return Err(CascadeError::Config(format!(
                "work_group_size must be a non-zero power of two, got {}",
                self.work_group_size
            )));
        }
        if self.min_block_size == 0 {
            return Err(CascadeError::Config(
                "min_block_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
