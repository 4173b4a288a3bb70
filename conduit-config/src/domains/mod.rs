//! Domain-specific configuration modules

pub mod logging;
pub mod resilience;
pub mod utils;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main Conduit configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConduitConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: logging::LoggingConfig,

    /// Resilience profiles for outbound calls
    #[serde(default)]
    pub resilience: resilience::ResilienceConfig,
}

impl ConduitConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.logging.validate()?;
        self.resilience.validate()?;
        Ok(())
    }
}
