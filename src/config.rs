// src/config.rs - Handoff configuration
use std::env;
use std::path::PathBuf;

use crate::{HandoffError, Result};

/// Default allocation alignment, matches the device cache line.
pub const DEFAULT_ALIGNMENT: usize = 64;
/// Allocations above this are refused.
pub const DEFAULT_MAX_ALLOCATION_BYTES: usize = 1024 * 1024 * 1024;

pub const ENV_ALIGNMENT: &str = "USM_DLPACK_ALIGNMENT";
pub const ENV_MAX_ALLOCATION: &str = "USM_DLPACK_MAX_ALLOCATION";
pub const ENV_CONSUMER_LIBRARY: &str = "USM_DLPACK_CONSUMER_LIBRARY";
pub const ENV_GIVE_SYMBOL: &str = "USM_DLPACK_GIVE_SYMBOL";
pub const ENV_FINALIZE_SYMBOL: &str = "USM_DLPACK_FINALIZE_SYMBOL";

#[derive(Debug, Clone, PartialEq)]
pub struct HandoffConfig {
    /// Alignment of every runtime allocation, a power of two.
    pub alignment: usize,
    pub max_allocation_bytes: usize,
    /// Shared library implementing the consumer side.
    pub consumer_library: Option<PathBuf>,
    pub give_symbol: String,
    pub finalize_symbol: String,
    /// Keep a [`crate::dlpack::TensorSummary`] of every tensor an in-process consumer receives.
    pub record_summaries: bool,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            alignment: DEFAULT_ALIGNMENT,
            max_allocation_bytes: DEFAULT_MAX_ALLOCATION_BYTES,
            consumer_library: None,
            give_symbol: "Give".to_string(),
            finalize_symbol: "Finalize".to_string(),
            record_summaries: true,
        }
    }
}

impl HandoffConfig {
    /// Defaults overridden by `USM_DLPACK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = env::var(ENV_ALIGNMENT) {
            config.alignment = parse_usize(ENV_ALIGNMENT, &value)?;
        }
        if let Ok(value) = env::var(ENV_MAX_ALLOCATION) {
            config.max_allocation_bytes = parse_usize(ENV_MAX_ALLOCATION, &value)?;
        }
        if let Some(path) = env::var_os(ENV_CONSUMER_LIBRARY) {
            config.consumer_library = Some(PathBuf::from(path));
        }
        if let Ok(symbol) = env::var(ENV_GIVE_SYMBOL) {
            config.give_symbol = symbol;
        }
        if let Ok(symbol) = env::var(ENV_FINALIZE_SYMBOL) {
            config.finalize_symbol = symbol;
        }

        config.validate()?;
        log::debug!("Loaded handoff config: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.alignment.is_power_of_two() {
            return Err(HandoffError::InvalidConfig(format!(
                "alignment {} is not a power of two",
                self.alignment
            )));
        }
        if self.max_allocation_bytes == 0 {
            return Err(HandoffError::InvalidConfig(
                "max_allocation_bytes must be positive".to_string(),
            ));
        }
        if self.give_symbol.is_empty() || self.finalize_symbol.is_empty() {
            return Err(HandoffError::InvalidConfig(
                "consumer symbol names must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| HandoffError::InvalidConfig(format!("{}={} is not an integer", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = HandoffConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.alignment, 64);
        assert_eq!(config.give_symbol, "Give");
        assert_eq!(config.finalize_symbol, "Finalize");
    }

    #[test]
    fn test_rejects_bad_alignment() {
        let config = HandoffConfig {
            alignment: 48,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(HandoffError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_empty_symbol() {
        let config = HandoffConfig {
            finalize_symbol: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_usize() {
        assert_eq!(parse_usize("K", " 128 ").unwrap(), 128);
        assert!(parse_usize("K", "lots").is_err());
    }
}
