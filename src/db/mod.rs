//! Database module for persisting drying runs and their meter history
//!
//! Uses SQLite for local storage of:
//! - Drying runs and their last computed cost
//! - Prepaid meter readings
//! - Recharges (attributed to a run or orphaned)
//! - An audit trail of manual corrections

use crate::core::{Correction, DryingRun, Error, MeterReading, RechargeEvent, Result, RunHistory};
use crate::reconcile::Reconciliation;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};

/// Source of run histories for the reconciler, and sink for its results
pub trait RunRepository {
    /// Fetch a run with its readings and recharges, ordered by timestamp
    fn fetch_run_history(&self, run_id: i64) -> Result<RunHistory>;

    /// Persist the computed cost and consumption onto the run
    fn save_run_cost(&self, run_id: i64, result: &Reconciliation) -> Result<()>;

    /// Ids of every known run
    fn run_ids(&self) -> Result<Vec<i64>>;

    fn add_run(&self, run: &DryingRun) -> Result<i64>;
    fn set_end_time(&self, run_id: i64, end_time: i64) -> Result<()>;
    fn add_reading(&self, reading: &MeterReading) -> Result<i64>;
    fn add_recharge(&self, recharge: &RechargeEvent) -> Result<i64>;
}

/// Storage operations behind the manual correction workflow
pub trait CorrectionStore {
    fn get_reading(&self, reading_id: i64) -> Result<MeterReading>;
    fn get_recharge(&self, recharge_id: i64) -> Result<RechargeEvent>;
    fn assign_recharge(&self, recharge_id: i64, run_id: i64) -> Result<()>;
    fn set_reading_timestamp(&self, reading_id: i64, timestamp: i64) -> Result<()>;
    fn set_recharge_timestamp(&self, recharge_id: i64, timestamp: i64) -> Result<()>;
    fn record_correction(&self, correction: &Correction) -> Result<i64>;
    fn runs_covering(&self, timestamp: i64) -> Result<Vec<DryingRun>>;
}

/// Database manager
pub struct Database {
    conn: Connection,
}

const RUN_COLUMNS: &str =
    "id, code, start_time, end_time, start_meter_kwh, hourly_rate, total_cost, consumed_kwh";
const RECHARGE_COLUMNS: &str =
    "id, run_id, token, timestamp, kwh_added, amount_paid, meter_after_kwh";

impl Database {
    /// Open the database in the platform data directory
    pub fn new() -> Result<Self> {
        let db_path = Self::db_path()?;
        Self::open(&db_path)
    }

    /// Open (or create) a database at an explicit path
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Throwaway database, used by the demo and tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Get the database file path
    fn db_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| Error::Config("Could not determine data directory".to_string()))?;

        let app_dir = data_dir.join("kilncost-tracker");
        std::fs::create_dir_all(&app_dir)?;

        Ok(app_dir.join("data.db"))
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS drying_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL UNIQUE,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                start_meter_kwh REAL NOT NULL,
                hourly_rate REAL,
                total_cost REAL,
                consumed_kwh REAL
            );

            CREATE TABLE IF NOT EXISTS meter_readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES drying_runs(id),
                timestamp INTEGER NOT NULL,
                meter_kwh REAL NOT NULL
            );

            -- run_id NULL = orphaned recharge awaiting attribution
            CREATE TABLE IF NOT EXISTS recharges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER REFERENCES drying_runs(id),
                token TEXT,
                timestamp INTEGER NOT NULL,
                kwh_added REAL NOT NULL,
                amount_paid REAL NOT NULL,
                meter_after_kwh REAL
            );

            CREATE TABLE IF NOT EXISTS corrections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                entity TEXT NOT NULL,
                entity_id INTEGER NOT NULL,
                field TEXT NOT NULL,
                old_value TEXT,
                new_value TEXT NOT NULL,
                reason TEXT NOT NULL
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_readings_run ON meter_readings(run_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_recharges_run ON recharges(run_id, timestamp);
            "#,
        )?;

        Ok(())
    }

    // ===== Runs =====

    /// Insert a new drying run, returning its id
    pub fn insert_run(&self, run: &DryingRun) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO drying_runs (code, start_time, end_time, start_meter_kwh, hourly_rate)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run.code, run.start_time, run.end_time, run.start_meter_kwh, run.hourly_rate],
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Get a specific run by ID
    pub fn get_run(&self, run_id: i64) -> Result<Option<DryingRun>> {
        let run = self
            .conn
            .query_row(
                &format!("SELECT {} FROM drying_runs WHERE id = ?1", RUN_COLUMNS),
                params![run_id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Look a run up by its code
    pub fn find_run_by_code(&self, code: &str) -> Result<Option<DryingRun>> {
        let run = self
            .conn
            .query_row(
                &format!("SELECT {} FROM drying_runs WHERE code = ?1", RUN_COLUMNS),
                params![code],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Get all runs, most recent first, optionally limited
    pub fn list_runs(&self, limit: Option<u32>) -> Result<Vec<DryingRun>> {
        let query = match limit {
            Some(n) => format!(
                "SELECT {} FROM drying_runs ORDER BY start_time DESC LIMIT {}",
                RUN_COLUMNS, n
            ),
            None => format!("SELECT {} FROM drying_runs ORDER BY start_time DESC", RUN_COLUMNS),
        };

        let mut stmt = self.conn.prepare(&query)?;
        let runs = stmt
            .query_map([], run_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(runs)
    }

    /// Close a run at the given time
    pub fn close_run(&self, run_id: i64, end_time: i64) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE drying_runs SET end_time = ?1 WHERE id = ?2",
            params![end_time, run_id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("run {}", run_id)));
        }
        Ok(())
    }

    // ===== Readings =====

    /// Insert a meter reading, returning its id
    pub fn insert_reading(&self, reading: &MeterReading) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO meter_readings (run_id, timestamp, meter_kwh) VALUES (?1, ?2, ?3)",
            params![reading.run_id, reading.timestamp, reading.meter_kwh],
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Readings of a run in timestamp order
    pub fn get_readings(&self, run_id: i64) -> Result<Vec<MeterReading>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, timestamp, meter_kwh
             FROM meter_readings
             WHERE run_id = ?1
             ORDER BY timestamp ASC, id ASC",
        )?;

        let readings = stmt
            .query_map(params![run_id], reading_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(readings)
    }

    // ===== Recharges =====

    /// Insert a recharge, returning its id
    pub fn insert_recharge(&self, recharge: &RechargeEvent) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO recharges (run_id, token, timestamp, kwh_added, amount_paid, meter_after_kwh)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                recharge.run_id,
                recharge.token,
                recharge.timestamp,
                recharge.kwh_added,
                recharge.amount_paid,
                recharge.meter_after_kwh
            ],
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Recharges attributed to a run, in timestamp order
    pub fn get_recharges(&self, run_id: i64) -> Result<Vec<RechargeEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM recharges WHERE run_id = ?1 ORDER BY timestamp ASC, id ASC",
            RECHARGE_COLUMNS
        ))?;

        let recharges = stmt
            .query_map(params![run_id], recharge_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(recharges)
    }

    /// Recharges not yet attributed to any run
    pub fn orphaned_recharges(&self) -> Result<Vec<RechargeEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM recharges WHERE run_id IS NULL ORDER BY timestamp ASC, id ASC",
            RECHARGE_COLUMNS
        ))?;

        let recharges = stmt
            .query_map([], recharge_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(recharges)
    }

    /// Whether a recharge with this vendor token is already stored
    pub fn has_token(&self, token: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM recharges WHERE token = ?1",
            params![token],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ===== Corrections =====

    /// Audit entries touching a run's readings or recharges, oldest first
    pub fn corrections_for_run(&self, run_id: i64) -> Result<Vec<Correction>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.id, c.timestamp, c.entity, c.entity_id, c.field, c.old_value, c.new_value, c.reason
             FROM corrections c
             WHERE (c.entity = 'reading' AND c.entity_id IN (SELECT id FROM meter_readings WHERE run_id = ?1))
                OR (c.entity = 'recharge' AND c.entity_id IN (SELECT id FROM recharges WHERE run_id = ?1))
             ORDER BY c.timestamp ASC, c.id ASC",
        )?;

        let corrections = stmt
            .query_map(params![run_id], |row| {
                Ok(Correction {
                    id: Some(row.get(0)?),
                    timestamp: row.get(1)?,
                    entity: row.get(2)?,
                    entity_id: row.get(3)?,
                    field: row.get(4)?,
                    old_value: row.get(5)?,
                    new_value: row.get(6)?,
                    reason: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(corrections)
    }

    fn ensure_run_exists(&self, run_id: i64) -> Result<DryingRun> {
        self.get_run(run_id)?
            .ok_or_else(|| Error::NotFound(format!("run {}", run_id)))
    }
}

impl RunRepository for Database {
    fn fetch_run_history(&self, run_id: i64) -> Result<RunHistory> {
        let run = self.ensure_run_exists(run_id)?;
        let readings = self.get_readings(run_id)?;
        let recharges = self.get_recharges(run_id)?;

        Ok(RunHistory::new(run, readings, recharges))
    }

    fn save_run_cost(&self, run_id: i64, result: &Reconciliation) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE drying_runs SET total_cost = ?1, consumed_kwh = ?2 WHERE id = ?3",
            params![result.total_cost, result.total_consumed_kwh, run_id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("run {}", run_id)));
        }
        Ok(())
    }

    fn run_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare("SELECT id FROM drying_runs ORDER BY start_time ASC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn add_run(&self, run: &DryingRun) -> Result<i64> {
        self.insert_run(run)
    }

    fn set_end_time(&self, run_id: i64, end_time: i64) -> Result<()> {
        self.close_run(run_id, end_time)
    }

    fn add_reading(&self, reading: &MeterReading) -> Result<i64> {
        self.insert_reading(reading)
    }

    fn add_recharge(&self, recharge: &RechargeEvent) -> Result<i64> {
        self.insert_recharge(recharge)
    }
}

impl CorrectionStore for Database {
    fn get_reading(&self, reading_id: i64) -> Result<MeterReading> {
        self.conn
            .query_row(
                "SELECT id, run_id, timestamp, meter_kwh FROM meter_readings WHERE id = ?1",
                params![reading_id],
                reading_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("reading {}", reading_id)))
    }

    fn get_recharge(&self, recharge_id: i64) -> Result<RechargeEvent> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM recharges WHERE id = ?1", RECHARGE_COLUMNS),
                params![recharge_id],
                recharge_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("recharge {}", recharge_id)))
    }

    fn assign_recharge(&self, recharge_id: i64, run_id: i64) -> Result<()> {
        self.ensure_run_exists(run_id)?;
        let changed = self.conn.execute(
            "UPDATE recharges SET run_id = ?1 WHERE id = ?2",
            params![run_id, recharge_id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("recharge {}", recharge_id)));
        }
        Ok(())
    }

    fn set_reading_timestamp(&self, reading_id: i64, timestamp: i64) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE meter_readings SET timestamp = ?1 WHERE id = ?2",
            params![timestamp, reading_id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("reading {}", reading_id)));
        }
        Ok(())
    }

    fn set_recharge_timestamp(&self, recharge_id: i64, timestamp: i64) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE recharges SET timestamp = ?1 WHERE id = ?2",
            params![timestamp, recharge_id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("recharge {}", recharge_id)));
        }
        Ok(())
    }

    fn record_correction(&self, correction: &Correction) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO corrections (timestamp, entity, entity_id, field, old_value, new_value, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                correction.timestamp,
                correction.entity,
                correction.entity_id,
                correction.field,
                correction.old_value,
                correction.new_value,
                correction.reason
            ],
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    fn runs_covering(&self, timestamp: i64) -> Result<Vec<DryingRun>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM drying_runs
             WHERE start_time <= ?1 AND (end_time IS NULL OR end_time >= ?1)
             ORDER BY start_time ASC",
            RUN_COLUMNS
        ))?;

        let runs = stmt
            .query_map(params![timestamp], run_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(runs)
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<DryingRun> {
    Ok(DryingRun {
        id: Some(row.get(0)?),
        code: row.get(1)?,
        start_time: row.get(2)?,
        end_time: row.get(3)?,
        start_meter_kwh: row.get(4)?,
        hourly_rate: row.get(5)?,
        total_cost: row.get(6)?,
        consumed_kwh: row.get(7)?,
    })
}

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<MeterReading> {
    Ok(MeterReading {
        id: Some(row.get(0)?),
        run_id: row.get(1)?,
        timestamp: row.get(2)?,
        meter_kwh: row.get(3)?,
    })
}

fn recharge_from_row(row: &Row<'_>) -> rusqlite::Result<RechargeEvent> {
    Ok(RechargeEvent {
        id: Some(row.get(0)?),
        run_id: row.get(1)?,
        token: row.get(2)?,
        timestamp: row.get(3)?,
        kwh_added: row.get(4)?,
        amount_paid: row.get(5)?,
        meter_after_kwh: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_704_067_200;

    fn create_test_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_insert_and_get_run() {
        let db = create_test_db();

        let id = db
            .insert_run(&DryingRun::new("DRY-010", T0, 2864.08).with_hourly_rate(6000.0))
            .unwrap();
        let run = db.get_run(id).unwrap().unwrap();
        assert_eq!(run.code, "DRY-010");
        assert_eq!(run.hourly_rate, Some(6000.0));
        assert!(!run.is_closed());
        assert!(run.total_cost.is_none());

        assert_eq!(db.find_run_by_code("DRY-010").unwrap().unwrap().id, Some(id));
        assert!(db.get_run(id + 1).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_code_rejected() {
        let db = create_test_db();
        db.insert_run(&DryingRun::new("DRY-010", T0, 1.0)).unwrap();
        assert!(matches!(
            db.insert_run(&DryingRun::new("DRY-010", T0, 1.0)),
            Err(Error::Database(_))
        ));
    }

    #[test]
    fn test_fetch_history_sorted() {
        let db = create_test_db();
        let run_id = db.insert_run(&DryingRun::new("DRY-001", T0, 100.0)).unwrap();

        db.insert_reading(&MeterReading::new(run_id, T0 + 7200, 80.0)).unwrap();
        db.insert_reading(&MeterReading::new(run_id, T0 + 3600, 90.0)).unwrap();
        db.insert_recharge(&RechargeEvent::new(T0 + 5000, 50.0, 17_812.5).for_run(run_id))
            .unwrap();
        db.insert_recharge(&RechargeEvent::new(T0 + 5000, 50.0, 17_812.5)).unwrap();

        let history = db.fetch_run_history(run_id).unwrap();
        assert_eq!(history.run.id, Some(run_id));
        let times: Vec<i64> = history.readings.iter().map(|r| r.timestamp).collect();
        assert_eq!(times, vec![T0 + 3600, T0 + 7200]);
        assert_eq!(history.recharges.len(), 1);

        assert!(matches!(db.fetch_run_history(999), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_orphans_and_assignment() {
        let db = create_test_db();
        let run_id = db.insert_run(&DryingRun::new("DRY-002", T0, 100.0)).unwrap();
        let recharge_id = db.insert_recharge(&RechargeEvent::new(T0 + 60, 10.0, 3562.5)).unwrap();

        assert_eq!(db.orphaned_recharges().unwrap().len(), 1);
        db.assign_recharge(recharge_id, run_id).unwrap();
        assert!(db.orphaned_recharges().unwrap().is_empty());
        assert_eq!(db.get_recharge(recharge_id).unwrap().run_id, Some(run_id));

        assert!(matches!(db.assign_recharge(recharge_id, 999), Err(Error::NotFound(_))));
        assert!(matches!(db.assign_recharge(999, run_id), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_runs_covering() {
        let db = create_test_db();
        let closed = db
            .insert_run(&DryingRun::new("DRY-003", T0, 1.0).with_end_time(T0 + 100))
            .unwrap();
        let open = db.insert_run(&DryingRun::new("DRY-004", T0 + 50, 1.0)).unwrap();

        let ids = |ts| -> Vec<Option<i64>> {
            db.runs_covering(ts).unwrap().into_iter().map(|r| r.id).collect()
        };
        assert_eq!(ids(T0 + 10), vec![Some(closed)]);
        assert_eq!(ids(T0 + 60), vec![Some(closed), Some(open)]);
        assert_eq!(ids(T0 + 500), vec![Some(open)]);
        assert!(ids(T0 - 1).is_empty());
    }

    #[test]
    fn test_close_and_save_cost() {
        let db = create_test_db();
        let run_id = db.insert_run(&DryingRun::new("DRY-005", T0, 100.0)).unwrap();
        db.close_run(run_id, T0 + 3600).unwrap();

        let result = Reconciliation {
            total_consumed_kwh: 500.0,
            electricity_rate: Some(356.25),
            rate_source: None,
            electricity_cost: 178_125.0,
            end_time: T0 + 3600,
            running_hours: 48.0,
            hourly_rate: 6000.0,
            non_electrical_cost: 288_000.0,
            total_cost: 466_125.0,
            segments: vec![],
            diagnostics: vec![],
        };
        db.save_run_cost(run_id, &result).unwrap();

        let run = db.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.end_time, Some(T0 + 3600));
        assert_eq!(run.total_cost, Some(466_125.0));
        assert_eq!(run.consumed_kwh, Some(500.0));

        assert!(matches!(db.close_run(999, T0), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_corrections_for_run() {
        let db = create_test_db();
        let run_id = db.insert_run(&DryingRun::new("DRY-006", T0, 100.0)).unwrap();
        let reading_id = db.insert_reading(&MeterReading::new(run_id, T0 + 60, 90.0)).unwrap();

        db.set_reading_timestamp(reading_id, T0 + 120).unwrap();
        db.record_correction(&Correction {
            id: None,
            timestamp: T0 + 1000,
            entity: "reading".to_string(),
            entity_id: reading_id,
            field: "timestamp".to_string(),
            old_value: Some((T0 + 60).to_string()),
            new_value: (T0 + 120).to_string(),
            reason: "typo in hour".to_string(),
        })
        .unwrap();

        assert_eq!(db.get_reading(reading_id).unwrap().timestamp, T0 + 120);
        let corrections = db.corrections_for_run(run_id).unwrap();
        assert_eq!(corrections.len(), 1);
        assert_eq!(corrections[0].reason, "typo in hour");
    }

    #[test]
    fn test_has_token() {
        let db = create_test_db();
        let mut recharge = RechargeEvent::new(T0, 10.0, 3562.5);
        recharge.token = Some("12345678901234567890".to_string());
        db.insert_recharge(&recharge).unwrap();

        assert!(db.has_token("12345678901234567890").unwrap());
        assert!(!db.has_token("0").unwrap());
    }
}
