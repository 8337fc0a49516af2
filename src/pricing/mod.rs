//! Pricing engine for drying-run cost calculation
//!
//! Resolves the two rates a run is costed with:
//! - Electricity: derived from what was actually paid for the run's recharges
//!   (TSh per kWh), or a configured fallback/fixed rate
//! - Non-electrical: fixed hourly rate covering depreciation, maintenance and labour

use crate::core::{DryingRun, Error, OperatingCostConfig, PricingConfig, RateMode, RechargeEvent, Result};
use serde::{Deserialize, Serialize};

/// Where an electricity rate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateSource {
    /// Amount paid / kWh bought over the run's recharges
    RechargeHistory,
    /// Configured fallback, used because no recharge history was usable
    Fallback,
    /// Configured fixed rate
    Fixed,
}

/// Pricing engine that resolves rates and calculates costs
#[derive(Debug, Clone)]
pub struct PricingEngine {
    config: PricingConfig,
    operating: OperatingCostConfig,
}

impl PricingEngine {
    /// Create a new pricing engine with the given configuration
    pub fn new(config: &PricingConfig, operating: &OperatingCostConfig) -> Self {
        Self {
            config: config.clone(),
            operating: operating.clone(),
        }
    }

    /// Resolve the electricity rate per kWh for a set of recharges
    pub fn electricity_rate(&self, recharges: &[RechargeEvent]) -> Result<(f64, RateSource)> {
        match self.config.rate_mode {
            RateMode::Fixed => self
                .config
                .fallback_rate_per_kwh
                .map(|rate| (rate, RateSource::Fixed))
                .ok_or_else(|| {
                    Error::Config("rate_mode is 'fixed' but no fallback_rate_per_kwh is set".to_string())
                }),
            RateMode::Derived => {
                if let Some(rate) = derived_rate(recharges) {
                    return Ok((rate, RateSource::RechargeHistory));
                }
                self.config
                    .fallback_rate_per_kwh
                    .map(|rate| (rate, RateSource::Fallback))
                    .ok_or_else(|| {
                        Error::Config(
                            "no recharge history to derive an electricity rate and no fallback_rate_per_kwh configured"
                                .to_string(),
                        )
                    })
            }
        }
    }

    /// Resolve the non-electrical hourly rate for a run
    pub fn hourly_rate(&self, run: &DryingRun) -> Result<f64> {
        if let Some(rate) = run.hourly_rate {
            if !rate.is_finite() || rate < 0.0 {
                return Err(Error::Validation(format!(
                    "run '{}' has invalid hourly rate {}",
                    run.code, rate
                )));
            }
            return Ok(rate);
        }
        self.operating.hourly_rate().ok_or_else(|| {
            Error::Config(format!(
                "run '{}' has no hourly rate and no operating costs are configured",
                run.code
            ))
        })
    }

    /// Calculate electricity cost for a given consumption
    pub fn calculate_cost(&self, kwh: f64, rate_per_kwh: f64) -> f64 {
        kwh * rate_per_kwh
    }

    /// Calculate non-electrical cost for a running time
    pub fn non_electrical_cost(&self, hours: f64, hourly_rate: f64) -> f64 {
        hours * hourly_rate
    }
}

/// Sum paid / sum bought, or None when no kWh were bought
pub fn derived_rate(recharges: &[RechargeEvent]) -> Option<f64> {
    let (paid, kwh) = recharges
        .iter()
        .fold((0.0, 0.0), |(paid, kwh), r| (paid + r.amount_paid, kwh + r.kwh_added));
    if kwh > 0.0 {
        Some(paid / kwh)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing_config(mode: RateMode, fallback: Option<f64>) -> PricingConfig {
        PricingConfig {
            rate_mode: mode,
            currency: "TZS".to_string(),
            currency_symbol: "TSh".to_string(),
            fallback_rate_per_kwh: fallback,
        }
    }

    fn operating(labor: Option<f64>) -> OperatingCostConfig {
        OperatingCostConfig {
            labor_per_hour: labor,
            ..Default::default()
        }
    }

    #[test]
    fn test_derived_rate() {
        let engine = PricingEngine::new(&pricing_config(RateMode::Derived, Some(300.0)), &operating(None));
        let recharges = vec![
            RechargeEvent::new(10, 100.0, 35000.0),
            RechargeEvent::new(20, 300.0, 107500.0),
        ];

        let (rate, source) = engine.electricity_rate(&recharges).unwrap();
        assert!((rate - 356.25).abs() < 1e-9);
        assert_eq!(source, RateSource::RechargeHistory);
    }

    #[test]
    fn test_fallback_rate() {
        let engine = PricingEngine::new(&pricing_config(RateMode::Derived, Some(300.0)), &operating(None));
        assert_eq!(engine.electricity_rate(&[]).unwrap(), (300.0, RateSource::Fallback));
    }

    #[test]
    fn test_missing_rate_is_config_error() {
        let engine = PricingEngine::new(&pricing_config(RateMode::Derived, None), &operating(None));
        assert!(matches!(engine.electricity_rate(&[]), Err(Error::Config(_))));

        let fixed = PricingEngine::new(&pricing_config(RateMode::Fixed, None), &operating(None));
        let recharges = vec![RechargeEvent::new(10, 100.0, 35000.0)];
        assert!(matches!(fixed.electricity_rate(&recharges), Err(Error::Config(_))));
    }

    #[test]
    fn test_fixed_ignores_history() {
        let engine = PricingEngine::new(&pricing_config(RateMode::Fixed, Some(292.0)), &operating(None));
        let recharges = vec![RechargeEvent::new(10, 100.0, 35000.0)];
        assert_eq!(engine.electricity_rate(&recharges).unwrap(), (292.0, RateSource::Fixed));
    }

    #[test]
    fn test_hourly_rate_resolution() {
        let engine = PricingEngine::new(&pricing_config(RateMode::Derived, None), &operating(Some(6000.0)));
        let run = DryingRun::new("DRY-001", 0, 100.0);
        assert_eq!(engine.hourly_rate(&run).unwrap(), 6000.0);
        assert_eq!(engine.hourly_rate(&run.with_hourly_rate(4500.0)).unwrap(), 4500.0);

        let bare = PricingEngine::new(&pricing_config(RateMode::Derived, None), &operating(None));
        assert!(matches!(
            bare.hourly_rate(&DryingRun::new("DRY-002", 0, 100.0)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_invalid_hourly_override_rejected() {
        let engine = PricingEngine::new(&pricing_config(RateMode::Derived, None), &operating(Some(6000.0)));
        let run = DryingRun::new("DRY-003", 0, 100.0);
        assert!(matches!(
            engine.hourly_rate(&run.clone().with_hourly_rate(-6000.0)),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            engine.hourly_rate(&run.with_hourly_rate(f64::NAN)),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_cost_example() {
        let engine = PricingEngine::new(&pricing_config(RateMode::Derived, None), &operating(None));
        assert_eq!(engine.calculate_cost(500.0, 356.25), 178125.0);
        assert_eq!(engine.non_electrical_cost(48.0, 6000.0), 288000.0);
    }
}
