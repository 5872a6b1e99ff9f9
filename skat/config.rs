use crate::quadform::Davies;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Default cut-off below which eigenvalues of the projected kernel count as zero.
pub const DEFAULT_ZERO_THRESHOLD: f64 = 1e-4;

/// Error type for loading, saving and validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("zero_threshold must be finite and non-negative, got {0}.")]
    InvalidThreshold(f64),
    #[error("Davies accuracy must be finite and strictly positive, got {0}.")]
    InvalidAccuracy(f64),
    #[error("Davies term_limit must be positive.")]
    InvalidTermLimit,
}

/// Numerical settings shared by every test object.
///
/// Saved and loaded as TOML; missing keys take their defaults:
///
/// ```toml
/// add_intercept = true
/// zero_threshold = 1e-4
///
/// [davies]
/// accuracy = 1e-7
/// term_limit = 1000000
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkatConfig {
    /// Append a constant column to the fixed covariates.
    pub add_intercept: bool,
    /// Eigenvalues below this are set to exactly zero.
    pub zero_threshold: f64,
    /// Accuracy settings of the tail-probability primitive.
    pub davies: Davies,
}

impl Default for SkatConfig {
    fn default() -> Self {
        Self {
            add_intercept: true,
            zero_threshold: DEFAULT_ZERO_THRESHOLD,
            davies: Davies::default(),
        }
    }
}

impl SkatConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.zero_threshold.is_finite() || self.zero_threshold < 0.0 {
            return Err(ConfigError::InvalidThreshold(self.zero_threshold));
        }
        if !self.davies.accuracy.is_finite() || self.davies.accuracy <= 0.0 {
            return Err(ConfigError::InvalidAccuracy(self.davies.accuracy));
        }
        if self.davies.term_limit == 0 {
            return Err(ConfigError::InvalidTermLimit);
        }
        Ok(())
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration to a file in a human-readable TOML format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads and validates a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        Self::from_toml_str(&toml_string)
    }
}
