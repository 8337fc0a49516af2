//! Non-fatal reconciliation diagnostics

use crate::core::format_timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An inconsistency between expected and observed meter behaviour.
///
/// Anomalies never abort a calculation. They are returned next to the
/// best-effort result so a person can decide whether the source records need
/// correcting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// Meter balance rose between two checkpoints with no recharge recorded
    MeterIncreaseWithoutRecharge {
        at: i64,
        previous_kwh: f64,
        reading_kwh: f64,
    },
    /// A segment with recharges came out negative and was counted as zero
    NegativeSegmentClipped { at: i64, raw_consumed_kwh: f64 },
    /// Readings were not supplied in timestamp order
    OutOfOrderReadings { at: i64 },
    /// Recharges were not supplied in timestamp order
    OutOfOrderRecharges { at: i64 },
    RechargeBeforeStart { at: i64, kwh_added: f64 },
    RechargeAfterEnd { at: i64, kwh_added: f64 },
    /// Recharge inside the run that no reading has observed yet
    RechargeAfterLastReading { at: i64, kwh_added: f64 },
    ReadingAfterEnd { at: i64 },
    /// Balance before the top-up (reported balance minus kWh added) is higher
    /// than the last known balance
    RechargeBalanceMismatch {
        at: i64,
        implied_before_kwh: f64,
        previous_kwh: f64,
    },
    /// A reading is higher than the balance its preceding recharge reported
    ReadingAboveRechargeBalance {
        at: i64,
        reading_kwh: f64,
        meter_after_kwh: f64,
    },
}

impl Anomaly {
    /// Timestamp the anomaly is anchored to
    pub fn at(&self) -> i64 {
        match self {
            Self::MeterIncreaseWithoutRecharge { at, .. }
            | Self::NegativeSegmentClipped { at, .. }
            | Self::OutOfOrderReadings { at }
            | Self::OutOfOrderRecharges { at }
            | Self::RechargeBeforeStart { at, .. }
            | Self::RechargeAfterEnd { at, .. }
            | Self::RechargeAfterLastReading { at, .. }
            | Self::ReadingAfterEnd { at }
            | Self::RechargeBalanceMismatch { at, .. }
            | Self::ReadingAboveRechargeBalance { at, .. } => *at,
        }
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let when = format_timestamp(self.at());
        match self {
            Self::MeterIncreaseWithoutRecharge { previous_kwh, reading_kwh, .. } => write!(
                f,
                "{when}: meter rose from {previous_kwh:.2} to {reading_kwh:.2} kWh with no recharge recorded"
            ),
            Self::NegativeSegmentClipped { raw_consumed_kwh, .. } => write!(
                f,
                "{when}: segment consumption {raw_consumed_kwh:.2} kWh is negative, counted as 0"
            ),
            Self::OutOfOrderReadings { .. } => {
                write!(f, "{when}: readings were out of timestamp order and have been sorted")
            }
            Self::OutOfOrderRecharges { .. } => {
                write!(f, "{when}: recharges were out of timestamp order and have been sorted")
            }
            Self::RechargeBeforeStart { kwh_added, .. } => {
                write!(f, "{when}: recharge of {kwh_added:.2} kWh is dated before the run started")
            }
            Self::RechargeAfterEnd { kwh_added, .. } => {
                write!(f, "{when}: recharge of {kwh_added:.2} kWh is dated after the run ended")
            }
            Self::RechargeAfterLastReading { kwh_added, .. } => write!(
                f,
                "{when}: recharge of {kwh_added:.2} kWh has no later reading to account for it"
            ),
            Self::ReadingAfterEnd { .. } => write!(f, "{when}: reading is dated after the run ended"),
            Self::RechargeBalanceMismatch { implied_before_kwh, previous_kwh, .. } => write!(
                f,
                "{when}: recharge implies {implied_before_kwh:.2} kWh before top-up, but last balance was {previous_kwh:.2} kWh"
            ),
            Self::ReadingAboveRechargeBalance { reading_kwh, meter_after_kwh, .. } => write!(
                f,
                "{when}: reading {reading_kwh:.2} kWh exceeds the {meter_after_kwh:.2} kWh reported after recharge"
            ),
        }
    }
}
