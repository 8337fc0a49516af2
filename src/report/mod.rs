//! Text and JSON rendering of a run's reconciliation

use crate::core::{format_timestamp, DryingRun, Error, Result};
use crate::pricing::RateSource;
use crate::reconcile::Reconciliation;
use serde::Serialize;
use std::fmt::Write;

/// Printable breakdown: summary, per-segment table and diagnostics
pub fn render_text(run: &DryingRun, result: &Reconciliation, currency_symbol: &str) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "=== Run {} ===", run.code);
    let _ = writeln!(
        out,
        "  Period:        {} -> {}{}",
        format_timestamp(run.start_time),
        format_timestamp(result.end_time),
        if run.is_closed() { "" } else { " (in progress)" }
    );
    let _ = writeln!(out, "  Start meter:   {:.2} kWh", run.start_meter_kwh);
    let _ = writeln!(out, "  Consumed:      {:.2} kWh", result.total_consumed_kwh);
    match (result.electricity_rate, result.rate_source) {
        (Some(rate), Some(source)) => {
            let _ = writeln!(
                out,
                "  Rate:          {:.2} {}/kWh ({})",
                rate,
                currency_symbol,
                rate_source_label(source)
            );
        }
        _ => {
            let _ = writeln!(out, "  Rate:          n/a");
        }
    }
    let _ = writeln!(out, "  Electricity:   {:.2} {}", result.electricity_cost, currency_symbol);
    let _ = writeln!(
        out,
        "  Operating:     {:.2} {} ({:.2} h x {:.2})",
        result.non_electrical_cost, currency_symbol, result.running_hours, result.hourly_rate
    );
    let _ = writeln!(out, "  Total cost:    {:.2} {}", result.total_cost, currency_symbol);

    if !result.segments.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "  To               |   Meter   | Recharged |  Consumed");
        let _ = writeln!(out, "  -----------------+-----------+-----------+-----------");
        for segment in &result.segments {
            let _ = writeln!(
                out,
                "  {} | {:>9.2} | {:>9.2} | {:>9.2}{}",
                format_timestamp(segment.to_time),
                segment.to_meter_kwh,
                segment.recharged_kwh,
                segment.consumed_kwh,
                if segment.consumed_kwh != segment.raw_consumed_kwh { " *" } else { "" }
            );
        }
    }

    if !result.diagnostics.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "  Diagnostics ({}):", result.diagnostics.len());
        for anomaly in &result.diagnostics {
            let _ = writeln!(out, "    - {}", anomaly);
        }
    }

    out
}

#[derive(Serialize)]
struct RunReport<'a> {
    run: &'a DryingRun,
    currency: &'a str,
    #[serde(flatten)]
    result: &'a Reconciliation,
}

/// Pretty JSON document with the run and its full reconciliation
pub fn render_json(run: &DryingRun, result: &Reconciliation, currency: &str) -> Result<String> {
    serde_json::to_string_pretty(&RunReport { run, currency, result })
        .map_err(|e| Error::Serialization(e.to_string()))
}

fn rate_source_label(source: RateSource) -> &'static str {
    match source {
        RateSource::RechargeHistory => "from recharges",
        RateSource::Fallback => "fallback",
        RateSource::Fixed => "fixed",
    }
}
