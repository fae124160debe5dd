//! Control-plane tunables.

use std::time::Duration;

use fleet_core::audit::DEFAULT_APPEND_TIMEOUT;
use fleet_core::{Error, Result};

/// Default number of nodes examined per sweep batch.
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 100;

/// Tunables shared by the control-plane components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlConfig {
    /// Nodes examined per sweep batch; cancellation is checked between batches.
    pub sweep_batch_size: usize,
    /// Upper bound on a single audit append.
    pub audit_timeout: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            audit_timeout: DEFAULT_APPEND_TIMEOUT,
        }
    }
}

impl ControlConfig {
    /// Checks that the tunables are usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a zero batch size or timeout.
    pub fn validate(&self) -> Result<()> {
        if self.sweep_batch_size == 0 {
            return Err(Error::InvalidInput(
                "sweep_batch_size must be greater than zero".into(),
            ));
        }
        if self.audit_timeout.is_zero() {
            return Err(Error::InvalidInput(
                "audit_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
