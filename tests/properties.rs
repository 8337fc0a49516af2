// Property tests for the consumption reconciler.
// CI: 256 cases (default). Soak: PROPTEST_CASES=10000 cargo test --release

use kilncost_tracker_lib::core::{Config, MeterReading, RechargeEvent};
use kilncost_tracker_lib::reconcile::Reconciler;
use proptest::prelude::*;

const T0: i64 = 1_704_067_200;
const HOUR: i64 = 3600;

fn config() -> ProptestConfig {
    ProptestConfig {
        cases: std::env::var("PROPTEST_CASES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(256),
        failure_persistence: None,
        ..ProptestConfig::default()
    }
}

fn reconciler() -> Reconciler {
    Reconciler::from_config(&Config::default())
}

/// Meter values with two decimals, as they appear on the display
fn kwh(max_hundredths: u32) -> impl Strategy<Value = f64> {
    (0..=max_hundredths).prop_map(|v| v as f64 / 100.0)
}

fn hourly_readings(values: &[f64]) -> Vec<MeterReading> {
    values
        .iter()
        .enumerate()
        .map(|(i, &v)| MeterReading::new(1, T0 + (i as i64 + 1) * HOUR, v))
        .collect()
}

fn recharges_at(entries: &[(i64, f64)]) -> Vec<RechargeEvent> {
    entries
        .iter()
        .map(|&(minute, added)| RechargeEvent::new(T0 + minute * 60, added, added * 350.0).for_run(1))
        .collect()
}

proptest! {
    #![proptest_config(config())]

    #[test]
    fn pure_countdown_totals_start_minus_last(
        start in kwh(1_000_000),
        drops in prop::collection::vec(kwh(5_000), 1..20),
    ) {
        let mut meter = start;
        let mut values = Vec::with_capacity(drops.len());
        for drop in drops {
            meter = (meter - drop).max(0.0);
            values.push(meter);
        }
        let c = reconciler()
            .consumption(start, T0, None, &hourly_readings(&values), &[])
            .unwrap();

        let expected = start - values[values.len() - 1];
        prop_assert!((c.total_consumed_kwh - expected).abs() < 1e-6);
        prop_assert!(c.diagnostics.is_empty());
    }

    #[test]
    fn reconciling_twice_is_identical(
        start in kwh(500_000),
        values in prop::collection::vec(kwh(500_000), 0..15),
        entries in prop::collection::vec((0i64..900, kwh(300_000)), 0..5),
    ) {
        let readings = hourly_readings(&values);
        let recharges = recharges_at(&entries);
        let r = reconciler();

        let first = r.consumption(start, T0, None, &readings, &recharges).unwrap();
        let second = r.consumption(start, T0, None, &readings, &recharges).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn segments_never_negative(
        start in kwh(500_000),
        values in prop::collection::vec(kwh(500_000), 0..15),
        entries in prop::collection::vec((0i64..900, kwh(300_000)), 0..5),
    ) {
        let c = reconciler()
            .consumption(start, T0, None, &hourly_readings(&values), &recharges_at(&entries))
            .unwrap();

        prop_assert!(c.total_consumed_kwh >= 0.0);
        for segment in &c.segments {
            prop_assert!(segment.consumed_kwh >= 0.0);
        }
    }

    #[test]
    fn recharge_order_does_not_change_consumption(
        start in kwh(500_000),
        values in prop::collection::vec(kwh(500_000), 1..15),
        entries in prop::collection::vec((0i64..900, kwh(300_000)), 2..6),
    ) {
        let readings = hourly_readings(&values);
        let mut sorted = entries.clone();
        sorted.sort_by_key(|&(minute, _)| minute);
        let mut reversed = sorted.clone();
        reversed.reverse();

        let r = reconciler();
        let a = r.consumption(start, T0, None, &readings, &recharges_at(&sorted)).unwrap();
        let b = r.consumption(start, T0, None, &readings, &recharges_at(&reversed)).unwrap();

        prop_assert!((a.total_consumed_kwh - b.total_consumed_kwh).abs() < 1e-6);
        prop_assert_eq!(a.segments.len(), b.segments.len());
        for (x, y) in a.segments.iter().zip(&b.segments) {
            prop_assert!((x.consumed_kwh - y.consumed_kwh).abs() < 1e-6);
            prop_assert_eq!(x.recharge_count, y.recharge_count);
        }
    }

    #[test]
    fn no_readings_means_no_consumption(
        start in kwh(1_000_000),
        entries in prop::collection::vec((0i64..900, kwh(300_000)), 0..5),
    ) {
        let c = reconciler()
            .consumption(start, T0, Some(T0 + 15 * HOUR), &[], &recharges_at(&entries))
            .unwrap();

        prop_assert_eq!(c.total_consumed_kwh, 0.0);
        prop_assert!(c.segments.is_empty());
    }
}
