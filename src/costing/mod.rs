//! Cost service: recompute and persist run costs, and apply manual corrections
//!
//! Corrections (attributing an orphaned recharge, fixing a timestamp) are
//! never made automatically. Each one is requested explicitly with a reason,
//! written to the audit trail, and followed by a recompute of the affected runs.
//!
//! Every change is applied to an in-memory copy of the run's history and
//! validated first. Nothing is stored for a change the reconciler would reject.

use crate::core::{Correction, DryingRun, Error, MeterReading, RechargeEvent, Result, RunHistory};
use crate::db::{CorrectionStore, RunRepository};
use crate::reconcile::{validate_recharge, Reconciler, Reconciliation};

/// Recomputes run costs against a repository
pub struct CostService<'a, R> {
    repo: &'a R,
    reconciler: Reconciler,
}

impl<'a, R: RunRepository> CostService<'a, R> {
    pub fn new(repo: &'a R, reconciler: Reconciler) -> Self {
        Self { repo, reconciler }
    }

    /// Reconcile a run without persisting anything
    pub fn preview(&self, run_id: i64) -> Result<(DryingRun, Reconciliation)> {
        let history = self.repo.fetch_run_history(run_id)?;
        let result = self.reconciler.reconcile(&history)?;
        Ok((history.run, result))
    }

    /// Reconcile a run and persist its total cost
    pub fn recompute(&self, run_id: i64) -> Result<Reconciliation> {
        let (run, result) = self.preview(run_id)?;

        for anomaly in &result.diagnostics {
            log::warn!("Run {}: {}", run.code, anomaly);
        }

        self.repo.save_run_cost(run_id, &result)?;
        log::info!(
            "Run {}: {:.2} kWh, total cost {:.2} (electricity {:.2}, operating {:.2})",
            run.code,
            result.total_consumed_kwh,
            result.total_cost,
            result.electricity_cost,
            result.non_electrical_cost
        );

        Ok(result)
    }

    /// Recompute every run. One run failing does not stop the others.
    pub fn recompute_all(&self) -> Result<Vec<(i64, Result<Reconciliation>)>> {
        let ids = self.repo.run_ids()?;
        let results: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let result = self.recompute(id);
                if let Err(e) = &result {
                    log::error!("Failed to recompute run {}: {}", id, e);
                }
                (id, result)
            })
            .collect();
        Ok(results)
    }

    /// Store a new run after checking its opening values
    pub fn open_run(&self, run: &DryingRun) -> Result<i64> {
        self.reconciler
            .validate_history(&RunHistory::new(run.clone(), Vec::new(), Vec::new()))?;
        let id = self.repo.add_run(run)?;
        log::info!("Opened run {} (id {})", run.code, id);
        Ok(id)
    }

    /// Set a run's end time and recompute its cost
    pub fn close_run(&self, run_id: i64, end_time: i64) -> Result<Reconciliation> {
        self.check_edit(run_id, |h| h.run.end_time = Some(end_time))?;
        self.repo.set_end_time(run_id, end_time)?;
        self.recompute(run_id)
    }

    /// Store a reading once the run's history still validates with it
    pub fn record_reading(&self, reading: &MeterReading) -> Result<i64> {
        self.check_edit(reading.run_id, |h| h.readings.push(reading.clone()))?;
        self.repo.add_reading(reading)
    }

    /// Store a recharge, checked against its run when it has one
    pub fn record_recharge(&self, recharge: &RechargeEvent) -> Result<i64> {
        match recharge.run_id {
            Some(run_id) => self.check_edit(run_id, |h| h.recharges.push(recharge.clone()))?,
            None => validate_recharge(recharge)?,
        }
        self.repo.add_recharge(recharge)
    }

    /// Validate a run's history as it would be after `edit`, without storing anything
    fn check_edit(&self, run_id: i64, edit: impl FnOnce(&mut RunHistory)) -> Result<()> {
        let mut history = self.repo.fetch_run_history(run_id)?;
        edit(&mut history);
        self.reconciler.validate_history(&history)
    }
}

impl<'a, R: RunRepository + CorrectionStore> CostService<'a, R> {
    /// Runs whose time span covers a recharge, for a person to choose from
    pub fn candidate_runs(&self, recharge_id: i64) -> Result<Vec<DryingRun>> {
        let recharge = self.repo.get_recharge(recharge_id)?;
        self.repo.runs_covering(recharge.timestamp)
    }

    /// Attribute a recharge to a run and recompute the runs involved
    pub fn attribute_recharge(&self, recharge_id: i64, run_id: i64, reason: &str) -> Result<Reconciliation> {
        require_reason(reason)?;
        let recharge = self.repo.get_recharge(recharge_id)?;
        let previous_run = recharge.run_id;
        if previous_run == Some(run_id) {
            return Err(Error::Validation(format!(
                "recharge {} already belongs to run {}",
                recharge_id, run_id
            )));
        }

        self.check_edit(run_id, |h| {
            h.recharges.push(RechargeEvent {
                run_id: Some(run_id),
                ..recharge.clone()
            })
        })?;

        self.repo.assign_recharge(recharge_id, run_id)?;
        self.audit(
            "recharge",
            recharge_id,
            "run_id",
            previous_run.map(|id| id.to_string()),
            run_id.to_string(),
            reason,
        )?;
        log::info!("Recharge {} attributed to run {}: {}", recharge_id, run_id, reason);

        if let Some(old) = previous_run {
            self.recompute_quietly(old);
        }
        self.recompute(run_id)
    }

    /// Correct a reading's timestamp and recompute its run
    pub fn retime_reading(&self, reading_id: i64, timestamp: i64, reason: &str) -> Result<Reconciliation> {
        require_reason(reason)?;
        let reading = self.repo.get_reading(reading_id)?;
        self.check_edit(reading.run_id, |h| {
            for r in h.readings.iter_mut().filter(|r| r.id == Some(reading_id)) {
                r.timestamp = timestamp;
            }
        })?;

        self.repo.set_reading_timestamp(reading_id, timestamp)?;
        self.audit(
            "reading",
            reading_id,
            "timestamp",
            Some(reading.timestamp.to_string()),
            timestamp.to_string(),
            reason,
        )?;
        log::info!("Reading {} moved from {} to {}: {}", reading_id, reading.timestamp, timestamp, reason);

        self.recompute(reading.run_id)
    }

    /// Correct a recharge's timestamp and recompute its run, if it has one
    pub fn retime_recharge(&self, recharge_id: i64, timestamp: i64, reason: &str) -> Result<Option<Reconciliation>> {
        require_reason(reason)?;
        let recharge = self.repo.get_recharge(recharge_id)?;
        if let Some(run_id) = recharge.run_id {
            self.check_edit(run_id, |h| {
                for r in h.recharges.iter_mut().filter(|r| r.id == Some(recharge_id)) {
                    r.timestamp = timestamp;
                }
            })?;
        }

        self.repo.set_recharge_timestamp(recharge_id, timestamp)?;
        self.audit(
            "recharge",
            recharge_id,
            "timestamp",
            Some(recharge.timestamp.to_string()),
            timestamp.to_string(),
            reason,
        )?;
        log::info!("Recharge {} moved from {} to {}: {}", recharge_id, recharge.timestamp, timestamp, reason);

        recharge.run_id.map(|run_id| self.recompute(run_id)).transpose()
    }

    fn audit(
        &self,
        entity: &str,
        entity_id: i64,
        field: &str,
        old_value: Option<String>,
        new_value: String,
        reason: &str,
    ) -> Result<i64> {
        self.repo.record_correction(&Correction {
            id: None,
            timestamp: chrono::Utc::now().timestamp(),
            entity: entity.to_string(),
            entity_id,
            field: field.to_string(),
            old_value,
            new_value,
            reason: reason.to_string(),
        })
    }

    fn recompute_quietly(&self, run_id: i64) {
        if let Err(e) = self.recompute(run_id) {
            log::warn!("Run {} could not be recomputed after losing a recharge: {}", run_id, e);
        }
    }
}

fn require_reason(reason: &str) -> Result<()> {
    if reason.trim().is_empty() {
        return Err(Error::Validation("a correction needs a reason".to_string()));
    }
    Ok(())
}
