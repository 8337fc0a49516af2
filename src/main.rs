//! KilnCost Tracker - command line entry point
//!
//! Records drying runs, meter readings and prepaid recharges, and keeps each
//! run's electricity and operating cost up to date.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kilncost_tracker_lib::core::{
    format_timestamp, parse_timestamp, Config, DryingRun, MeterReading, RechargeEvent,
};
use kilncost_tracker_lib::costing::CostService;
use kilncost_tracker_lib::db::Database;
use kilncost_tracker_lib::reconcile::Reconciler;
use kilncost_tracker_lib::report;
use kilncost_tracker_lib::sms::SmsParser;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "kilncost")]
#[command(about = "Prepaid electricity reconciliation and drying-cost tracking")]
#[command(version)]
struct Cli {
    /// Configuration file (default: <config dir>/kilncost-tracker/config.toml)
    #[arg(long, global = true, env = "KILNCOST_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file (overrides general.database_path)
    #[arg(long, global = true, env = "KILNCOST_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Ledger(LedgerCommand),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Commands that work against the run database
#[derive(Subcommand)]
enum LedgerCommand {
    /// Manage drying runs
    Run {
        #[command(subcommand)]
        action: RunAction,
    },
    /// Record or correct meter readings
    Reading {
        #[command(subcommand)]
        action: ReadingAction,
    },
    /// Record, attribute or correct recharges
    Recharge {
        #[command(subcommand)]
        action: RechargeAction,
    },
    /// Recompute and store run costs
    Recompute {
        /// Run id or code (omit with --all)
        run: Option<String>,

        /// Recompute every run
        #[arg(long, conflicts_with = "run")]
        all: bool,
    },
}

#[derive(Subcommand)]
enum RunAction {
    /// Start a new drying run
    Create {
        /// Run code, e.g. DRY-010
        code: String,

        /// Start time, "YYYY-MM-DD HH:MM"
        #[arg(long)]
        start: String,

        /// Prepaid meter balance at start (kWh)
        #[arg(long)]
        meter: f64,

        /// Non-electrical cost per hour for this run (overrides config)
        #[arg(long)]
        hourly_rate: Option<f64>,
    },
    /// Set a run's end time and recompute its cost
    Close {
        run: String,

        /// End time, "YYYY-MM-DD HH:MM"
        #[arg(long)]
        end: String,
    },
    /// List runs, most recent first
    List {
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Show a run's cost breakdown and diagnostics
    Show {
        run: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,

        /// Include the correction audit trail
        #[arg(long)]
        audit: bool,
    },
}

#[derive(Subcommand)]
enum ReadingAction {
    /// Record a meter reading for a run
    Add {
        run: String,

        /// Reading time, "YYYY-MM-DD HH:MM"
        #[arg(long)]
        at: String,

        /// Remaining balance shown on the meter (kWh)
        #[arg(long)]
        meter: f64,
    },
    /// Correct the time of a reading
    Retime {
        reading: i64,

        #[arg(long)]
        at: String,

        /// Why the correction is being made (recorded in the audit trail)
        #[arg(long)]
        reason: String,
    },
}

#[derive(Subcommand)]
enum RechargeAction {
    /// Record a recharge by hand
    Add {
        /// Run id or code (omit to leave orphaned)
        #[arg(long)]
        run: Option<String>,

        #[arg(long)]
        at: String,

        /// kWh bought
        #[arg(long)]
        kwh: f64,

        /// Total amount paid
        #[arg(long)]
        paid: f64,

        /// Balance shown on the meter right after the top-up
        #[arg(long)]
        meter_after: Option<f64>,

        #[arg(long)]
        token: Option<String>,
    },
    /// Record a recharge from the vendor's SMS text
    Sms {
        /// File holding the message (reads stdin when omitted)
        file: Option<PathBuf>,

        /// Run id or code (omit to leave orphaned)
        #[arg(long)]
        run: Option<String>,
    },
    /// List recharges not attributed to any run
    Orphans,
    /// List runs whose time span covers a recharge
    Candidates { recharge: i64 },
    /// Attribute a recharge to a run
    Assign {
        recharge: i64,
        run: String,

        #[arg(long)]
        reason: String,
    },
    /// Correct the time of a recharge
    Retime {
        recharge: i64,

        #[arg(long)]
        at: String,

        #[arg(long)]
        reason: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the configuration file path
    Path,
    /// Print the effective configuration
    Show,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .unwrap_or_else(|e| {
        log::warn!("Failed to load config, using defaults: {}", e);
        Config::default()
    });

    match cli.command {
        Commands::Config { action } => config_command(&action, cli.config.as_deref(), &config),
        Commands::Ledger(command) => {
            let db = match cli.db.or_else(|| config.general.database_path()) {
                Some(path) => Database::open(&path)
                    .with_context(|| format!("opening database {}", path.display()))?,
                None => Database::new().context("opening database")?,
            };
            execute(command, &db, &config)
        }
    }
}

fn execute(command: LedgerCommand, db: &Database, config: &Config) -> Result<()> {
    let service = CostService::new(db, Reconciler::from_config(config));
    let symbol = config.pricing.currency_symbol.as_str();

    match command {
        LedgerCommand::Run { action } => match action {
            RunAction::Create { code, start, meter, hourly_rate } => {
                let mut run = DryingRun::new(&code, parse_timestamp(&start)?, meter);
                run.hourly_rate = hourly_rate;
                println!("{}", service.open_run(&run)?);
            }
            RunAction::Close { run, end } => {
                let run_id = run_id(&resolve_run(db, &run)?)?;
                let result = service.close_run(run_id, parse_timestamp(&end)?)?;
                println!("{:.2} {}", result.total_cost, symbol);
            }
            RunAction::List { limit } => {
                for run in db.list_runs(limit)? {
                    println!(
                        "{:>5}  {:<12} {}  {:<16}  {}",
                        run.id.unwrap_or_default(),
                        run.code,
                        format_timestamp(run.start_time),
                        run.end_time.map(format_timestamp).unwrap_or_else(|| "in progress".to_string()),
                        run.total_cost
                            .map(|c| format!("{:.2} {}", c, symbol))
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
            }
            RunAction::Show { run, json, audit } => {
                let run_id = run_id(&resolve_run(db, &run)?)?;
                let (run, result) = service.preview(run_id)?;
                if json {
                    println!("{}", report::render_json(&run, &result, &config.pricing.currency)?);
                } else {
                    print!("{}", report::render_text(&run, &result, symbol));
                }
                if audit {
                    for c in db.corrections_for_run(run_id)? {
                        println!(
                            "  [{}] {} {} {}: {} -> {} ({})",
                            format_timestamp(c.timestamp),
                            c.entity,
                            c.entity_id,
                            c.field,
                            c.old_value.as_deref().unwrap_or("-"),
                            c.new_value,
                            c.reason
                        );
                    }
                }
            }
        },

        LedgerCommand::Reading { action } => match action {
            ReadingAction::Add { run, at, meter } => {
                let run_id = run_id(&resolve_run(db, &run)?)?;
                let id = service.record_reading(&MeterReading::new(run_id, parse_timestamp(&at)?, meter))?;
                println!("{}", id);
                refresh(&service, run_id);
            }
            ReadingAction::Retime { reading, at, reason } => {
                let result = service.retime_reading(reading, parse_timestamp(&at)?, &reason)?;
                println!("{:.2} {}", result.total_cost, symbol);
            }
        },

        LedgerCommand::Recharge { action } => match action {
            RechargeAction::Add { run, at, kwh, paid, meter_after, token } => {
                let run_id = run.as_deref().map(|r| resolve_run(db, r).and_then(|r| run_id(&r))).transpose()?;
                let recharge = RechargeEvent {
                    id: None,
                    run_id,
                    token,
                    timestamp: parse_timestamp(&at)?,
                    kwh_added: kwh,
                    amount_paid: paid,
                    meter_after_kwh: meter_after,
                };
                let id = service.record_recharge(&recharge)?;
                println!("{}", id);
                if let Some(run_id) = run_id {
                    refresh(&service, run_id);
                }
            }
            RechargeAction::Sms { file, run } => {
                let text = match file {
                    Some(path) => std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?,
                    None => {
                        let mut buf = String::new();
                        std::io::stdin().read_to_string(&mut buf)?;
                        buf
                    }
                };
                let parsed = SmsParser::new()?.parse(&text)?;
                if db.has_token(&parsed.token)? {
                    bail!("recharge with token {} is already recorded", parsed.token);
                }
                let run_id = run.as_deref().map(|r| resolve_run(db, r).and_then(|r| run_id(&r))).transpose()?;
                let recharge = parsed.into_event(run_id);
                let id = service.record_recharge(&recharge)?;
                log::info!(
                    "Recorded recharge {}: {:.2} kWh for {:.2} at {}",
                    id,
                    recharge.kwh_added,
                    recharge.amount_paid,
                    format_timestamp(recharge.timestamp)
                );
                println!("{}", id);
                if let Some(run_id) = run_id {
                    refresh(&service, run_id);
                }
            }
            RechargeAction::Orphans => {
                for r in db.orphaned_recharges()? {
                    println!(
                        "{:>5}  {}  {:>9.2} kWh  {:>12.2} {}  {}",
                        r.id.unwrap_or_default(),
                        format_timestamp(r.timestamp),
                        r.kwh_added,
                        r.amount_paid,
                        symbol,
                        r.token.as_deref().unwrap_or("-")
                    );
                }
            }
            RechargeAction::Candidates { recharge } => {
                for run in service.candidate_runs(recharge)? {
                    println!(
                        "{:>5}  {:<12} {} -> {}",
                        run.id.unwrap_or_default(),
                        run.code,
                        format_timestamp(run.start_time),
                        run.end_time.map(format_timestamp).unwrap_or_else(|| "in progress".to_string())
                    );
                }
            }
            RechargeAction::Assign { recharge, run, reason } => {
                let run_id = run_id(&resolve_run(db, &run)?)?;
                let result = service.attribute_recharge(recharge, run_id, &reason)?;
                println!("{:.2} {}", result.total_cost, symbol);
            }
            RechargeAction::Retime { recharge, at, reason } => {
                match service.retime_recharge(recharge, parse_timestamp(&at)?, &reason)? {
                    Some(result) => println!("{:.2} {}", result.total_cost, symbol),
                    None => println!("recharge {} is orphaned; no run recomputed", recharge),
                }
            }
        },

        LedgerCommand::Recompute { run, all } => {
            if all {
                let mut failed = 0;
                for (id, result) in service.recompute_all()? {
                    match result {
                        Ok(r) => println!("{:>5}  {:.2} {}", id, r.total_cost, symbol),
                        Err(e) => {
                            failed += 1;
                            println!("{:>5}  error: {}", id, e);
                        }
                    }
                }
                if failed > 0 {
                    bail!("{} run(s) could not be recomputed", failed);
                }
            } else {
                let Some(run) = run else {
                    bail!("give a run id/code or --all");
                };
                let run_id = run_id(&resolve_run(db, &run)?)?;
                let result = service.recompute(run_id)?;
                println!("{:.2} {}", result.total_cost, symbol);
            }
        }
    }

    Ok(())
}

fn config_command(action: &ConfigAction, path: Option<&Path>, config: &Config) -> Result<()> {
    match action {
        ConfigAction::Path => {
            let path = match path {
                Some(p) => p.to_path_buf(),
                None => Config::config_path()?,
            };
            println!("{}", path.display());
        }
        ConfigAction::Show => {
            println!("{}", toml::to_string_pretty(config).context("serializing config")?);
        }
    }
    Ok(())
}

/// Find a run by numeric id or by code
fn resolve_run(db: &Database, key: &str) -> kilncost_tracker_lib::core::Result<DryingRun> {
    let by_id = match key.parse::<i64>() {
        Ok(id) => db.get_run(id)?,
        Err(_) => None,
    };
    match by_id {
        Some(run) => Ok(run),
        None => db
            .find_run_by_code(key)?
            .ok_or_else(|| kilncost_tracker_lib::core::Error::NotFound(format!("run '{}'", key))),
    }
}

fn run_id(run: &DryingRun) -> kilncost_tracker_lib::core::Result<i64> {
    run.id
        .ok_or_else(|| kilncost_tracker_lib::core::Error::NotFound(format!("run '{}' has no id", run.code)))
}

/// Recompute after the history changed; a run that cannot be costed yet is not an error here
fn refresh(service: &CostService<'_, Database>, run_id: i64) {
    if let Err(e) = service.recompute(run_id) {
        log::warn!("Run {} not recomputed: {}", run_id, e);
    }
}
