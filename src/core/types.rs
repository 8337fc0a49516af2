//! Domain records shared across the application

use serde::{Deserialize, Serialize};

/// One physical batch of timber going through a drying chamber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryingRun {
    pub id: Option<i64>,
    /// Human-facing run code, e.g. "DRY-010"
    pub code: String,
    /// Unix timestamp when drying started
    pub start_time: i64,
    /// Unix timestamp when drying ended (None while in progress)
    pub end_time: Option<i64>,
    /// kWh remaining on the prepaid meter at run start
    pub start_meter_kwh: f64,
    /// Non-electrical cost per hour (depreciation, maintenance, labour).
    /// Falls back to the configured operating rate when absent.
    pub hourly_rate: Option<f64>,
    /// Last computed total cost. Not authoritative until recomputed.
    pub total_cost: Option<f64>,
    /// Last computed consumption in kWh
    pub consumed_kwh: Option<f64>,
}

impl DryingRun {
    pub fn new(code: &str, start_time: i64, start_meter_kwh: f64) -> Self {
        Self {
            id: None,
            code: code.to_string(),
            start_time,
            end_time: None,
            start_meter_kwh,
            hourly_rate: None,
            total_cost: None,
            consumed_kwh: None,
        }
    }

    pub fn with_hourly_rate(mut self, rate: f64) -> Self {
        self.hourly_rate = Some(rate);
        self
    }

    pub fn with_end_time(mut self, end_time: i64) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Observation of the prepaid meter's remaining balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterReading {
    pub id: Option<i64>,
    pub run_id: i64,
    pub timestamp: i64,
    pub meter_kwh: f64,
}

impl MeterReading {
    pub fn new(run_id: i64, timestamp: i64, meter_kwh: f64) -> Self {
        Self {
            id: None,
            run_id,
            timestamp,
            meter_kwh,
        }
    }
}

/// A top-up of the prepaid meter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RechargeEvent {
    pub id: Option<i64>,
    /// Owning run; None while the recharge is orphaned
    pub run_id: Option<i64>,
    /// Vendor token number, digits only
    pub token: Option<String>,
    pub timestamp: i64,
    pub kwh_added: f64,
    pub amount_paid: f64,
    /// Meter balance reported immediately after the top-up
    pub meter_after_kwh: Option<f64>,
}

impl RechargeEvent {
    pub fn new(timestamp: i64, kwh_added: f64, amount_paid: f64) -> Self {
        Self {
            id: None,
            run_id: None,
            token: None,
            timestamp,
            kwh_added,
            amount_paid,
            meter_after_kwh: None,
        }
    }

    pub fn for_run(mut self, run_id: i64) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_meter_after(mut self, meter_after_kwh: f64) -> Self {
        self.meter_after_kwh = Some(meter_after_kwh);
        self
    }

    pub fn is_orphaned(&self) -> bool {
        self.run_id.is_none()
    }
}

/// Everything the reconciler needs for one run, as fetched from storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistory {
    pub run: DryingRun,
    pub readings: Vec<MeterReading>,
    pub recharges: Vec<RechargeEvent>,
}

impl RunHistory {
    pub fn new(run: DryingRun, readings: Vec<MeterReading>, recharges: Vec<RechargeEvent>) -> Self {
        Self {
            run,
            readings,
            recharges,
        }
    }
}

/// Audit entry for a manual data correction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub id: Option<i64>,
    /// When the correction was made
    pub timestamp: i64,
    /// "reading" or "recharge"
    pub entity: String,
    pub entity_id: i64,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: String,
    pub reason: String,
}

/// Parse a "YYYY-MM-DD HH:MM" wall-clock string into a Unix timestamp (UTC)
pub fn parse_timestamp(value: &str) -> crate::core::Result<i64> {
    chrono::NaiveDateTime::parse_from_str(value.trim(), "%Y-%m-%d %H:%M")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(value.trim(), "%Y-%m-%d %H:%M:%S"))
        .map(|dt| dt.and_utc().timestamp())
        .map_err(|e| crate::core::Error::Parse(format!("invalid timestamp '{}': {}", value, e)))
}

/// Format a Unix timestamp as "YYYY-MM-DD HH:MM"
pub fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_round_trip() {
        let ts = parse_timestamp("2024-03-01 14:22").unwrap();
        assert_eq!(ts, 1709302920);
        assert_eq!(format_timestamp(ts), "2024-03-01 14:22");
    }

    #[test]
    fn test_timestamp_with_seconds() {
        assert_eq!(parse_timestamp("2024-03-01 14:22:30").unwrap(), 1709302950);
    }

    #[test]
    fn test_bad_timestamp() {
        assert!(matches!(parse_timestamp("01/03/2024"), Err(crate::core::Error::Parse(_))));
    }

    #[test]
    fn test_orphaned_recharge() {
        let recharge = RechargeEvent::new(0, 100.0, 35625.0);
        assert!(recharge.is_orphaned());
        assert!(!recharge.for_run(3).is_orphaned());
    }
}
