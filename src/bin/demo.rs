//! KilnCost Tracker - Demo CLI
//!
//! Reconciles a sample drying run against an in-memory database and prints
//! the report. Nothing is written to disk.

use anyhow::{Context, Result};
use kilncost_tracker_lib::core::{parse_timestamp, Config, DryingRun, MeterReading, RechargeEvent};
use kilncost_tracker_lib::costing::CostService;
use kilncost_tracker_lib::db::Database;
use kilncost_tracker_lib::reconcile::Reconciler;
use kilncost_tracker_lib::report;
use kilncost_tracker_lib::sms::SmsParser;

const RECHARGE_SMS: &str = "TOKEN 1234 5678 9012 3456 7890 2807.0KWH Cost 842100.00 VAT 18% 151578.00 \
                            EWURA 1% 8421.00 REA 3% 25263.00 TOTAL TZS 1,000,000.00 Date 2024-03-02 20:15";

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("==============================================");
    println!("   KilnCost Tracker - Demo");
    println!("==============================================\n");

    // 1. Configuration
    println!("[1/4] Configuring rates...");
    let mut config = Config::default();
    config.operating.depreciation_per_hour = Some(2000.0);
    config.operating.maintenance_per_hour = Some(1000.0);
    config.operating.labor_per_hour = Some(3000.0);
    println!(
        "      Operating rate: {:.2} {}/h",
        config.operating.hourly_rate().unwrap_or_default(),
        config.pricing.currency_symbol
    );
    println!("      Electricity rate: derived from recharges\n");

    // 2. Database
    println!("[2/4] Opening in-memory database...");
    let db = Database::open_in_memory().context("opening in-memory database")?;
    println!();

    // 3. Sample run
    println!("[3/4] Recording run DRY-010...");
    let run_id = db.insert_run(
        &DryingRun::new("DRY-010", parse_timestamp("2024-03-01 08:00")?, 2864.08)
            .with_end_time(parse_timestamp("2024-03-03 08:00")?),
    )?;

    let readings = [
        ("2024-03-01 20:00", 2558.02),
        ("2024-03-02 08:00", 2236.94),
        // Misread meter: balance rises with no top-up
        ("2024-03-02 12:00", 2273.33),
        ("2024-03-02 18:00", 1990.00),
        ("2024-03-03 08:00", 4650.00),
    ];
    for (at, kwh) in readings {
        db.insert_reading(&MeterReading::new(run_id, parse_timestamp(at)?, kwh))?;
        println!("      reading  {}  {:>9.2} kWh", at, kwh);
    }

    let parsed = SmsParser::new()?.parse(RECHARGE_SMS)?;
    println!(
        "      recharge {} kWh for {:.2} {} (token {})",
        parsed.kwh, parsed.total, parsed.currency, parsed.token
    );
    let recharge: RechargeEvent = parsed.into_event(Some(run_id)).with_meter_after(4697.0);
    db.insert_recharge(&recharge)?;
    println!();

    // 4. Reconcile
    println!("[4/4] Reconciling...\n");
    let service = CostService::new(&db, Reconciler::from_config(&config));
    let result = service.recompute(run_id)?;
    let (run, _) = service.preview(run_id)?;

    print!("{}", report::render_text(&run, &result, &config.pricing.currency_symbol));

    println!("\n==============================================");
    println!("   Demo complete");
    println!("==============================================");

    Ok(())
}
