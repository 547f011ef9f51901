//! Service configuration.
//!
//! Read from the TOML file named by `ORACLE_CONFIG` when set, defaults
//! otherwise. `ORACLE_BIND_ADDR` overrides the bind address.

use std::collections::HashSet;
use std::path::Path;

use quote_oracle_core::CronSchedule;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// WebSocket server address (0.0.0.0 for Docker/production).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_brand_in")]
    pub brand_in: String,

    #[serde(default = "default_brand_out")]
    pub brand_out: String,

    /// Oracle samples price this much of `brand_in`.
    #[serde(default = "default_unit_amount_in")]
    pub unit_amount_in: u64,

    /// Seconds between aggregator polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Five-field cron schedule starting flux rounds. No rounds when unset.
    #[serde(default)]
    pub round_schedule: Option<String>,

    #[serde(default = "default_oracles")]
    pub oracles: Vec<SimulatedOracleConfig>,

    #[serde(default)]
    pub flux: FluxSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedOracleConfig {
    pub name: String,
    /// Starting price of `unit_amount_in`, in `brand_out` units.
    pub start: f64,
    #[serde(default = "default_volatility")]
    pub volatility: f64,
    #[serde(default)]
    pub failure_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluxSettings {
    #[serde(default = "default_flux_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub absolute_threshold: u64,
    #[serde(default = "default_fractional_threshold")]
    pub fractional_threshold: f64,
    #[serde(default = "default_idle_timer_ticks")]
    pub idle_timer_ticks: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8083".to_string()
}

fn default_brand_in() -> String {
    "ATOM".to_string()
}

fn default_brand_out() -> String {
    "uUSD".to_string()
}

fn default_unit_amount_in() -> u64 {
    1
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_volatility() -> f64 {
    0.002
}

fn default_oracles() -> Vec<SimulatedOracleConfig> {
    [("alpha", 12_340_000.0), ("beta", 12_360_000.0), ("gamma", 12_310_000.0)]
        .into_iter()
        .map(|(name, start)| SimulatedOracleConfig {
            name: name.to_string(),
            start,
            volatility: default_volatility(),
            failure_rate: 0.0,
        })
        .collect()
}

fn default_flux_poll_interval_secs() -> u64 {
    10
}

fn default_fractional_threshold() -> f64 {
    0.005
}

fn default_idle_timer_ticks() -> u64 {
    30
}

impl Default for FluxSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_flux_poll_interval_secs(),
            absolute_threshold: 0,
            fractional_threshold: default_fractional_threshold(),
            idle_timer_ticks: default_idle_timer_ticks(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            brand_in: default_brand_in(),
            brand_out: default_brand_out(),
            unit_amount_in: default_unit_amount_in(),
            poll_interval_secs: default_poll_interval_secs(),
            round_schedule: None,
            oracles: default_oracles(),
            flux: FluxSettings::default(),
        }
    }
}

impl ServiceConfig {
    /// Load from `ORACLE_CONFIG` (or defaults), apply `ORACLE_BIND_ADDR`, and
    /// validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("ORACLE_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        if let Ok(addr) = std::env::var("ORACLE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be positive".into()));
        }
        if self.unit_amount_in == 0 {
            return Err(ConfigError::Invalid("unit_amount_in must be positive".into()));
        }
        if self.brand_in == self.brand_out {
            return Err(ConfigError::Invalid(format!(
                "brand_in and brand_out are both {}",
                self.brand_in
            )));
        }
        if self.oracles.is_empty() {
            return Err(ConfigError::Invalid("at least one oracle is required".into()));
        }

        let mut names = HashSet::new();
        for oracle in &self.oracles {
            if !names.insert(oracle.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate oracle {}", oracle.name)));
            }
            if !oracle.start.is_finite() || oracle.start < 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "oracle {} start must be at least 1",
                    oracle.name
                )));
            }
            if !oracle.volatility.is_finite() || !(0.0..1.0).contains(&oracle.volatility) {
                return Err(ConfigError::Invalid(format!(
                    "oracle {} volatility must be in [0, 1)",
                    oracle.name
                )));
            }
            if !(0.0..=1.0).contains(&oracle.failure_rate) {
                return Err(ConfigError::Invalid(format!(
                    "oracle {} failure_rate must be in [0, 1]",
                    oracle.name
                )));
            }
        }

        if self.flux.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("flux.poll_interval_secs must be positive".into()));
        }
        let fractional = self.flux.fractional_threshold;
        if !fractional.is_finite() || fractional < 0.0 {
            return Err(ConfigError::Invalid(
                "flux.fractional_threshold must be a non-negative number".into(),
            ));
        }

        if let Some(schedule) = &self.round_schedule {
            schedule.parse::<CronSchedule>()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.oracles.len(), 3);
    }

    #[test]
    fn test_parse_partial_file() {
        let config = ServiceConfig::from_toml(
            r#"
            brand_in = "BLD"
            poll_interval_secs = 2
            round_schedule = "*/5 * * * *"

            [[oracles]]
            name = "solo"
            start = 1000.0

            [flux]
            fractional_threshold = 0.1
            "#,
        )
        .unwrap();

        assert_eq!(config.brand_in, "BLD");
        assert_eq!(config.brand_out, "uUSD");
        assert_eq!(config.poll_interval_secs, 2);
        assert_eq!(config.oracles.len(), 1);
        assert_eq!(config.oracles[0].volatility, 0.002);
        assert_eq!(config.flux.fractional_threshold, 0.1);
        assert_eq!(config.flux.idle_timer_ticks, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ServiceConfig::default();
        config.poll_interval_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ServiceConfig::default();
        config.oracles.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ServiceConfig::default();
        config.flux.fractional_threshold = f64::NAN;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ServiceConfig::default();
        config.oracles[1].name = config.oracles[0].name.clone();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ServiceConfig::default();
        config.round_schedule = Some("61 * * * *".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::Schedule(_))));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            ServiceConfig::from_toml("poll_interval_secs = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
