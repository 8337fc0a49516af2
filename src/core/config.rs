//! Configuration management

use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub operating: OperatingCostConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;

        let app_config_dir = config_dir.join("kilncost-tracker");

        if !app_config_dir.exists() {
            fs::create_dir_all(&app_config_dir)?;
        }

        Ok(app_config_dir.join("config.toml"))
    }

    /// Load configuration from the default location, writing defaults on first use
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load configuration from an explicit path, writing defaults if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Reject rates that can never be right
    pub fn validate(&self) -> Result<()> {
        if let Some(rate) = self.pricing.fallback_rate_per_kwh {
            if !rate.is_finite() || rate < 0.0 {
                return Err(Error::Config(format!(
                    "pricing.fallback_rate_per_kwh must be non-negative, got {}",
                    rate
                )));
            }
        }
        for (name, value) in [
            ("depreciation_per_hour", self.operating.depreciation_per_hour),
            ("maintenance_per_hour", self.operating.maintenance_per_hour),
            ("labor_per_hour", self.operating.labor_per_hour),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(Error::Config(format!(
                        "operating.{} must be non-negative, got {}",
                        name, v
                    )));
                }
            }
        }
        if !self.reconcile.balance_tolerance_kwh.is_finite() || self.reconcile.balance_tolerance_kwh < 0.0 {
            return Err(Error::Config(
                "reconcile.balance_tolerance_kwh must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// General application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// SQLite database path (empty = platform data directory)
    #[serde(default)]
    pub database_path: String,
}

impl GeneralConfig {
    pub fn database_path(&self) -> Option<PathBuf> {
        if self.database_path.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.database_path))
        }
    }
}

/// How the electricity rate of a run is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateMode {
    /// Paid / kWh over the run's recharges, falling back to the configured rate
    #[default]
    Derived,
    /// Always the configured rate
    Fixed,
}

/// Electricity pricing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default)]
    pub rate_mode: RateMode,
    /// Currency code
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Currency symbol
    #[serde(default = "default_currency_symbol")]
    pub currency_symbol: String,
    /// Rate per kWh used when no recharge history is available
    #[serde(default)]
    pub fallback_rate_per_kwh: Option<f64>,
}

fn default_currency() -> String { "TZS".to_string() }
fn default_currency_symbol() -> String { "TSh".to_string() }

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            rate_mode: RateMode::default(),
            currency: default_currency(),
            currency_symbol: default_currency_symbol(),
            fallback_rate_per_kwh: None,
        }
    }
}

/// Fixed per-hour operating costs of a drying chamber
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperatingCostConfig {
    #[serde(default)]
    pub depreciation_per_hour: Option<f64>,
    #[serde(default)]
    pub maintenance_per_hour: Option<f64>,
    #[serde(default)]
    pub labor_per_hour: Option<f64>,
}

impl OperatingCostConfig {
    /// Combined non-electrical rate, or None if no component is configured
    pub fn hourly_rate(&self) -> Option<f64> {
        let parts = [
            self.depreciation_per_hour,
            self.maintenance_per_hour,
            self.labor_per_hour,
        ];
        if parts.iter().all(Option::is_none) {
            return None;
        }
        Some(parts.iter().flatten().sum())
    }
}

/// Reconciliation tolerances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Allowed slack when cross-checking a recharge's reported balance (kWh)
    #[serde(default = "default_balance_tolerance")]
    pub balance_tolerance_kwh: f64,
}

fn default_balance_tolerance() -> f64 { 0.5 }

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            balance_tolerance_kwh: default_balance_tolerance(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hourly_rate_sums_components() {
        let operating = OperatingCostConfig {
            depreciation_per_hour: Some(2000.0),
            maintenance_per_hour: Some(1000.0),
            labor_per_hour: Some(3000.0),
        };
        assert_eq!(operating.hourly_rate(), Some(6000.0));
    }

    #[test]
    fn test_hourly_rate_absent() {
        assert_eq!(OperatingCostConfig::default().hourly_rate(), None);

        let partial = OperatingCostConfig {
            labor_per_hour: Some(1500.0),
            ..Default::default()
        };
        assert_eq!(partial.hourly_rate(), Some(1500.0));
    }

    #[test]
    fn test_parse_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [pricing]
            rate_mode = "fixed"
            fallback_rate_per_kwh = 356.25

            [operating]
            labor_per_hour = 3000.0
            "#,
        )
        .unwrap();

        assert_eq!(config.pricing.rate_mode, RateMode::Fixed);
        assert_eq!(config.pricing.currency, "TZS");
        assert_eq!(config.pricing.fallback_rate_per_kwh, Some(356.25));
        assert_eq!(config.operating.hourly_rate(), Some(3000.0));
        assert_eq!(config.reconcile.balance_tolerance_kwh, 0.5);
        assert!(config.general.database_path().is_none());
    }

    #[test]
    fn test_load_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.pricing.rate_mode, RateMode::Derived);

        let mut changed = config.clone();
        changed.pricing.fallback_rate_per_kwh = Some(400.0);
        changed.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.pricing.fallback_rate_per_kwh, Some(400.0));
    }

    #[test]
    fn test_negative_rate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[operating]\nlabor_per_hour = -1.0\n").unwrap();

        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));
    }
}
