//! Consumption reconciler for prepaid ("count-down") electricity meters
//!
//! Walks a drying run's checkpoints (run start, then each reading) and
//! attributes consumption to every gap between them:
//! - no recharge in the gap: `previous - reading`, a rise is an anomaly
//! - recharges in the gap: `previous + recharged - reading`, clipped at zero
//!
//! A recharge is in the gap when `previous_time < t <= reading_time`, so a
//! recharge logged at the same instant as a reading is already visible in it.
//! The result is costed with the rates resolved by [`PricingEngine`].

mod anomaly;

pub use anomaly::Anomaly;

use crate::core::{Config, Error, MeterReading, RechargeEvent, ReconcileConfig, Result, RunHistory};
use crate::pricing::{PricingEngine, RateSource};
use serde::{Deserialize, Serialize};

/// Differences below this are representation noise, not energy
pub const KWH_EPSILON: f64 = 1e-6;

/// Consumption between two consecutive checkpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub from_time: i64,
    pub to_time: i64,
    pub from_meter_kwh: f64,
    pub to_meter_kwh: f64,
    pub recharged_kwh: f64,
    pub recharge_count: usize,
    /// Unclipped arithmetic result
    pub raw_consumed_kwh: f64,
    /// Amount actually counted towards the total
    pub consumed_kwh: f64,
}

/// Consumption timeline of one run, before costing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consumption {
    pub total_consumed_kwh: f64,
    pub segments: Vec<Segment>,
    pub diagnostics: Vec<Anomaly>,
}

/// Full result for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub total_consumed_kwh: f64,
    /// None only when nothing was consumed and no rate could be resolved
    pub electricity_rate: Option<f64>,
    pub rate_source: Option<RateSource>,
    pub electricity_cost: f64,
    pub end_time: i64,
    pub running_hours: f64,
    pub hourly_rate: f64,
    pub non_electrical_cost: f64,
    pub total_cost: f64,
    pub segments: Vec<Segment>,
    pub diagnostics: Vec<Anomaly>,
}

impl Reconciliation {
    pub fn has_anomalies(&self) -> bool {
        !self.diagnostics.is_empty()
    }
}

/// Stateless reconciler. Safe to share across threads; every call is independent.
#[derive(Debug, Clone)]
pub struct Reconciler {
    pricing: PricingEngine,
    options: ReconcileConfig,
}

impl Reconciler {
    pub fn new(pricing: PricingEngine, options: &ReconcileConfig) -> Self {
        Self {
            pricing,
            options: options.clone(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            PricingEngine::new(&config.pricing, &config.operating),
            &config.reconcile,
        )
    }

    /// Reject a history that could never be reconciled, without costing it
    pub fn validate_history(&self, history: &RunHistory) -> Result<()> {
        let run = &history.run;
        if let Some(rate) = run.hourly_rate {
            if !is_non_negative(rate) {
                return Err(Error::Validation(format!(
                    "run '{}' has invalid hourly rate {}",
                    run.code, rate
                )));
            }
        }
        validate(
            run.start_meter_kwh,
            run.start_time,
            run.end_time,
            &history.readings,
            &history.recharges,
        )
    }

    /// Compute consumption and cost for a run's full history
    pub fn reconcile(&self, history: &RunHistory) -> Result<Reconciliation> {
        self.validate_history(history)?;
        let run = &history.run;

        let consumption = self.consumption(
            run.start_meter_kwh,
            run.start_time,
            run.end_time,
            &history.readings,
            &history.recharges,
        )?;

        let end_time = run
            .end_time
            .or_else(|| history.readings.iter().map(|r| r.timestamp).max())
            .ok_or_else(|| {
                Error::InsufficientData(format!(
                    "run '{}' has no end time and no readings",
                    run.code
                ))
            })?;

        let total = consumption.total_consumed_kwh;
        let rate = if total > 0.0 {
            Some(self.pricing.electricity_rate(&history.recharges)?)
        } else {
            // Zero consumption costs nothing whatever the rate
            self.pricing.electricity_rate(&history.recharges).ok()
        };
        let electricity_cost = rate.map_or(0.0, |(r, _)| self.pricing.calculate_cost(total, r));

        let hourly_rate = self.pricing.hourly_rate(run)?;
        let running_hours = (end_time - run.start_time) as f64 / 3600.0;
        let non_electrical_cost = self.pricing.non_electrical_cost(running_hours, hourly_rate);

        log::debug!(
            "Run {}: {:.2} kWh over {:.2} h, {} segment(s), {} anomaly(ies)",
            run.code,
            total,
            running_hours,
            consumption.segments.len(),
            consumption.diagnostics.len()
        );

        Ok(Reconciliation {
            total_consumed_kwh: total,
            electricity_rate: rate.map(|(r, _)| r),
            rate_source: rate.map(|(_, s)| s),
            electricity_cost,
            end_time,
            running_hours,
            hourly_rate,
            non_electrical_cost,
            total_cost: electricity_cost + non_electrical_cost,
            segments: consumption.segments,
            diagnostics: consumption.diagnostics,
        })
    }

    /// Walk the checkpoint timeline and attribute consumption to each segment
    pub fn consumption(
        &self,
        start_meter_kwh: f64,
        start_time: i64,
        end_time: Option<i64>,
        readings: &[MeterReading],
        recharges: &[RechargeEvent],
    ) -> Result<Consumption> {
        validate(start_meter_kwh, start_time, end_time, readings, recharges)?;

        let mut diagnostics = Vec::new();

        let mut readings: Vec<&MeterReading> = readings.iter().collect();
        if let Some(at) = first_out_of_order(readings.iter().map(|r| r.timestamp)) {
            diagnostics.push(Anomaly::OutOfOrderReadings { at });
            readings.sort_by_key(|r| r.timestamp);
        }

        let mut recharges: Vec<&RechargeEvent> = recharges.iter().collect();
        if let Some(at) = first_out_of_order(recharges.iter().map(|r| r.timestamp)) {
            diagnostics.push(Anomaly::OutOfOrderRecharges { at });
            recharges.sort_by_key(|r| r.timestamp);
        }

        let last_reading = readings.last().map(|r| r.timestamp);
        for recharge in &recharges {
            let (at, kwh_added) = (recharge.timestamp, recharge.kwh_added);
            if at < start_time {
                diagnostics.push(Anomaly::RechargeBeforeStart { at, kwh_added });
            } else if end_time.map_or(false, |end| at > end) {
                diagnostics.push(Anomaly::RechargeAfterEnd { at, kwh_added });
            } else if at > last_reading.unwrap_or(start_time) {
                diagnostics.push(Anomaly::RechargeAfterLastReading { at, kwh_added });
            }
        }
        if let Some(end) = end_time {
            for reading in readings.iter().filter(|r| r.timestamp > end) {
                diagnostics.push(Anomaly::ReadingAfterEnd { at: reading.timestamp });
            }
        }

        let tolerance = self.options.balance_tolerance_kwh;
        let mut previous_meter = start_meter_kwh;
        let mut previous_time = start_time;
        let mut cursor = recharges.partition_point(|r| r.timestamp <= start_time);
        let mut total = 0.0;
        let mut segments = Vec::with_capacity(readings.len());

        for reading in readings {
            let window_start = cursor;
            while cursor < recharges.len() && recharges[cursor].timestamp <= reading.timestamp {
                cursor += 1;
            }
            let window = &recharges[window_start..cursor];
            let recharged: f64 = window.iter().map(|r| r.kwh_added).sum();
            let raw = snap(previous_meter + recharged - reading.meter_kwh);

            let consumed = if window.is_empty() {
                if reading.meter_kwh > previous_meter + KWH_EPSILON {
                    diagnostics.push(Anomaly::MeterIncreaseWithoutRecharge {
                        at: reading.timestamp,
                        previous_kwh: previous_meter,
                        reading_kwh: reading.meter_kwh,
                    });
                }
                raw.max(0.0)
            } else {
                check_recharge_balances(window, previous_meter, reading, tolerance, &mut diagnostics);
                if raw < 0.0 {
                    diagnostics.push(Anomaly::NegativeSegmentClipped {
                        at: reading.timestamp,
                        raw_consumed_kwh: raw,
                    });
                }
                raw.max(0.0)
            };

            total += consumed;
            segments.push(Segment {
                from_time: previous_time,
                to_time: reading.timestamp,
                from_meter_kwh: previous_meter,
                to_meter_kwh: reading.meter_kwh,
                recharged_kwh: recharged,
                recharge_count: window.len(),
                raw_consumed_kwh: raw,
                consumed_kwh: consumed,
            });

            previous_meter = reading.meter_kwh;
            previous_time = reading.timestamp;
        }

        diagnostics.sort_by_key(Anomaly::at);

        Ok(Consumption {
            total_consumed_kwh: total,
            segments,
            diagnostics,
        })
    }
}

/// Cross-check the balances recharges reported against the meter timeline
fn check_recharge_balances(
    window: &[&RechargeEvent],
    previous_meter: f64,
    reading: &MeterReading,
    tolerance: f64,
    diagnostics: &mut Vec<Anomaly>,
) {
    // Highest balance the meter could have held just before each top-up
    let mut ceiling = previous_meter;
    for recharge in window {
        match recharge.meter_after_kwh {
            Some(after) => {
                let implied_before = after - recharge.kwh_added;
                if implied_before > ceiling + tolerance {
                    diagnostics.push(Anomaly::RechargeBalanceMismatch {
                        at: recharge.timestamp,
                        implied_before_kwh: implied_before,
                        previous_kwh: ceiling,
                    });
                }
                ceiling = after;
            }
            None => ceiling += recharge.kwh_added,
        }
    }

    if let Some(after) = window.last().and_then(|r| r.meter_after_kwh) {
        if reading.meter_kwh > after + tolerance {
            diagnostics.push(Anomaly::ReadingAboveRechargeBalance {
                at: reading.timestamp,
                reading_kwh: reading.meter_kwh,
                meter_after_kwh: after,
            });
        }
    }
}

fn validate(
    start_meter_kwh: f64,
    start_time: i64,
    end_time: Option<i64>,
    readings: &[MeterReading],
    recharges: &[RechargeEvent],
) -> Result<()> {
    if !is_non_negative(start_meter_kwh) {
        return Err(Error::Validation(format!(
            "start meter value must be a non-negative number, got {}",
            start_meter_kwh
        )));
    }
    if let Some(end) = end_time {
        if end < start_time {
            return Err(Error::Validation(format!(
                "end time {} precedes start time {}",
                end, start_time
            )));
        }
    }
    for reading in readings {
        if !is_non_negative(reading.meter_kwh) {
            return Err(Error::Validation(format!(
                "reading at {} has invalid meter value {}",
                reading.timestamp, reading.meter_kwh
            )));
        }
        if reading.timestamp < start_time {
            return Err(Error::Validation(format!(
                "reading at {} precedes run start {}",
                reading.timestamp, start_time
            )));
        }
    }
    for recharge in recharges {
        validate_recharge(recharge)?;
    }
    Ok(())
}

/// Amounts a recharge carries must be real, non-negative numbers
pub fn validate_recharge(recharge: &RechargeEvent) -> Result<()> {
    if !is_non_negative(recharge.kwh_added) {
        return Err(Error::Validation(format!(
            "recharge at {} has invalid kWh amount {}",
            recharge.timestamp, recharge.kwh_added
        )));
    }
    if !is_non_negative(recharge.amount_paid) {
        return Err(Error::Validation(format!(
            "recharge at {} has invalid amount paid {}",
            recharge.timestamp, recharge.amount_paid
        )));
    }
    if let Some(after) = recharge.meter_after_kwh {
        if !is_non_negative(after) {
            return Err(Error::Validation(format!(
                "recharge at {} has invalid meter-after value {}",
                recharge.timestamp, after
            )));
        }
    }
    Ok(())
}

fn is_non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

fn snap(kwh: f64) -> f64 {
    if kwh.abs() < KWH_EPSILON {
        0.0
    } else {
        kwh
    }
}

/// Timestamp of the first element that is earlier than its predecessor
fn first_out_of_order(timestamps: impl Iterator<Item = i64>) -> Option<i64> {
    let mut previous = i64::MIN;
    for ts in timestamps {
        if ts < previous {
            return Some(ts);
        }
        previous = ts;
    }
    None
}
