//! Core module - Configuration, errors, and domain types

mod config;
mod error;
mod types;

pub use config::{Config, GeneralConfig, OperatingCostConfig, PricingConfig, RateMode, ReconcileConfig};
pub use error::{Error, Result};
pub use types::{format_timestamp, parse_timestamp, Correction, DryingRun, MeterReading, RechargeEvent, RunHistory};
