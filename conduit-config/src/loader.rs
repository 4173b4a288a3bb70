//! Configuration loading and environment variable handling

use crate::domains::ConduitConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::Path;
use std::str::FromStr;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "CONDUIT".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML or JSON file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<ConduitConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let mut config: ConduitConfig = if is_json {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        // Apply environment variable overrides
        self.apply_env_overrides(&mut config)?;

        // Validate all domains
        config.validate_all()?;

        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<ConduitConfig> {
        let mut config = ConduitConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<ConduitConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut ConduitConfig) -> ConfigResult<()> {
        self.apply_logging_overrides(&mut config.logging)?;
        self.apply_resilience_overrides(&mut config.resilience.defaults)?;
        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(
        &self,
        config: &mut crate::domains::logging::LoggingConfig,
    ) -> ConfigResult<()> {
        if let Some(level) = self.parse_env_var("LOG_LEVEL")? {
            config.level = level;
        }

        if let Some(format) = self.parse_env_var("LOG_FORMAT")? {
            config.format = format;
        }

        Ok(())
    }

    /// Apply overrides to the default resilience profile
    fn apply_resilience_overrides(
        &self,
        profile: &mut crate::domains::resilience::ResilienceProfile,
    ) -> ConfigResult<()> {
        if let Some(value) = self.parse_env_var("RETRY_MAX_ATTEMPTS")? {
            profile.retry.max_attempts = value;
        }

        if let Some(value) = self.parse_env_var("RETRY_INITIAL_DELAY_MS")? {
            profile.retry.initial_delay_ms = value;
        }

        if let Some(value) = self.parse_env_var("RETRY_MAX_DELAY_MS")? {
            profile.retry.max_delay_ms = value;
        }

        if let Some(value) = self.parse_env_var("CIRCUIT_FAILURE_THRESHOLD")? {
            profile.circuit_breaker.failure_threshold = value;
        }

        if let Some(value) = self.parse_env_var("CIRCUIT_OPEN_DURATION_MS")? {
            profile.circuit_breaker.open_duration_ms = value;
        }

        if let Some(value) = self.parse_env_var("RATE_LIMIT_REQUESTS_PER_WINDOW")? {
            profile
                .rate_limit
                .get_or_insert_with(Default::default)
                .requests_per_window = value;
        }

        Ok(())
    }

    /// Parse an optional prefixed environment variable
    fn parse_env_var<T>(&self, name: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_env_var(name) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::InvalidEnvVar {
                    var: self.env_var_name(name),
                    value: raw.clone(),
                    reason: e.to_string(),
                }),
            Err(_) => Ok(None),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(self.env_var_name(name))
    }

    fn env_var_name(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, name)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
