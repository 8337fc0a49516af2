//! KilnCost Tracker library
//!
//! Prepaid electricity reconciliation and drying-cost calculation for timber
//! kilns, with the storage, SMS ingestion and reporting around it.

pub mod core;
pub mod costing;
pub mod db;
pub mod pricing;
pub mod reconcile;
pub mod report;
pub mod sms;
