//! VM configuration.

use crate::error::{VmError, VmResult};
use serde::{Deserialize, Serialize};

/// Configuration applied to a VM and its engine at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Execution budget; exhausting it traps. `None` disables metering.
    pub fuel: Option<u64>,
    /// Largest accepted bytecode in bytes
    pub max_module_size: usize,
    /// Whether loaders may accept engine-precompiled artifacts
    pub allow_precompiled: bool,
}

impl VmConfig {
    /// Create a new VM config
    #[must_use]
    pub fn new() -> Self {
        Self {
            fuel: None,
            max_module_size: 10 * 1024 * 1024, // 10MB
            allow_precompiled: false,
        }
    }

    /// Set the fuel budget
    #[must_use]
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = Some(fuel);
        self
    }

    /// Set the module size limit
    #[must_use]
    pub fn with_max_module_size(mut self, size: usize) -> Self {
        self.max_module_size = size;
        self
    }

    /// Allow/disallow precompiled artifacts
    #[must_use]
    pub fn with_allow_precompiled(mut self, allow: bool) -> Self {
        self.allow_precompiled = allow;
        self
    }

    /// Parse a config from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or the config is invalid
    pub fn from_json(json: &str) -> VmResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the config
    ///
    /// # Errors
    ///
    /// Returns error if a limit is zero
    pub fn validate(&self) -> VmResult<()> {
        if self.max_module_size == 0 {
            return Err(VmError::Config("max_module_size must be non-zero".to_string()));
        }
        if self.fuel == Some(0) {
            return Err(VmError::Config("fuel must be non-zero when set".to_string()));
        }
        Ok(())
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}
