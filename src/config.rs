//! Diagnostics configuration, loadable from TOML.
//!
//! Every field has a default, so an empty file is a valid configuration. Call
//! [DiagConfig::validate] (done by [DiagConfig::from_toml_str]) before any I/O.

use crate::{
    cells::BalanceSettings,
    decoder::{Decoder, PlausibilityTable},
    error::ConfigError,
    flash::FlashSettings,
    health::ScoringSettings,
    link::RetryPolicy,
    usage::UsageSettings,
};
use fugit::MillisDurationU32;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Retry settings for every request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Per attempt read timeout.
    pub timeout_ms: u32,
    /// Total attempts, including the first.
    pub max_attempts: u8,
}

impl Default for LinkSettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            timeout_ms: policy.timeout.ticks(),
            max_attempts: policy.max_attempts,
        }
    }
}

impl LinkSettings {
    pub fn timeout(&self) -> MillisDurationU32 {
        MillisDurationU32::millis(self.timeout_ms)
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: self.timeout(),
            max_attempts: self.max_attempts,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagConfig {
    pub link: LinkSettings,
    /// Plausibility ranges per register category.
    pub plausibility: PlausibilityTable,
    pub cells: BalanceSettings,
    pub usage: UsageSettings,
    pub scoring: ScoringSettings,
    pub flash: FlashSettings,
}

impl DiagConfig {
    /// Parse and validate.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a TOML file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.link.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "link.max_attempts",
                reason: "must be at least 1",
            });
        }
        if self.link.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "link.timeout_ms",
                reason: "must be greater than 0",
            });
        }
        let ranges = [
            self.plausibility.voltage,
            self.plausibility.current,
            self.plausibility.temperature,
            self.plausibility.capacity,
            self.plausibility.resistance,
            self.plausibility.counter,
        ];
        if ranges.iter().flatten().any(|r| r.min.is_nan() || r.max.is_nan() || r.min > r.max) {
            return Err(ConfigError::InvalidValue {
                field: "plausibility",
                reason: "every range needs min <= max",
            });
        }
        if !(self.cells.imbalance_threshold_mv.is_finite() && self.cells.imbalance_threshold_mv >= 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "cells.imbalance_threshold_mv",
                reason: "must be finite and non-negative",
            });
        }
        if !(self.usage.bucket_width_a.is_finite() && self.usage.bucket_width_a > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "usage.bucket_width_a",
                reason: "must be greater than 0",
            });
        }
        if self.usage.nominal_voltage.is_some_and(|v| !(v.is_finite() && v > 0.0)) {
            return Err(ConfigError::InvalidValue {
                field: "usage.nominal_voltage",
                reason: "must be greater than 0",
            });
        }
        if !self.usage.thresholds.is_ascending() {
            return Err(ConfigError::InvalidValue {
                field: "usage.thresholds",
                reason: "must be strictly ascending",
            });
        }
        self.scoring.validate()?;
        if self.flash.block_size == 0 || self.flash.block_size > FlashSettings::MAX_BLOCK_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "flash.block_size",
                reason: "must be between 1 and 250",
            });
        }
        if self.flash.max_block_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "flash.max_block_attempts",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    pub fn policy(&self) -> RetryPolicy {
        self.link.policy()
    }

    pub fn decoder(&self) -> Decoder {
        Decoder::new(self.plausibility)
    }
}
