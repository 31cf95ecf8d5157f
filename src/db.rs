//! # WorkflowDB
//!
//! Durable substrate for runs, events and checkpoints, backed by embedded
//! SQLite. Three tables form the public contract the monitoring UI reads:
//!
//! - `pf_runs`: one row per run with status, wall times, step total, error.
//! - `pf_events`: append-only lifecycle log; per run the first event is
//!   `flow_start` and the last is one of `flow_end`, `flow_error`,
//!   `flow_cancel`.
//! - `pf_checkpoints`: one serialised [`Store`] per completed step,
//!   0-based and contiguous.
//!
//! The database runs in WAL journal mode so monitor readers never block the
//! writer. Within the process a mutex serialises writes; the handle is
//! `Clone` and safe to move across threads. The scheduler records each
//! completed step through [`WorkflowDB::record_step`], which wraps the
//! checkpoint row, the `node_end` event and the `total_steps` update in one
//! transaction; a reader that sees the event is guaranteed to see the
//! checkpoint.

use crate::store::Store;
use crate::PipeFlowResult;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Lifecycle state of a run, as stored in `pf_runs.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(status)
    }
}

impl FromStr for RunStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(()),
        }
    }
}

/// A row of `pf_runs`.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub flow_name: String,
    pub status: RunStatus,
    pub started_at: f64,
    pub ended_at: Option<f64>,
    pub total_steps: i64,
    pub error: Option<String>,
}

/// A row of `pf_events`.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub id: i64,
    pub run_id: String,
    pub event: String,
    pub node_name: Option<String>,
    pub action: Option<String>,
    pub elapsed_ms: Option<f64>,
    pub error: Option<String>,
    pub created_at: f64,
}

/// A row of `pf_checkpoints`.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub run_id: String,
    pub step: i64,
    pub node_name: String,
    pub store_json: String,
    pub created_at: f64,
}

/// Current wall time as REAL epoch seconds, the timestamp unit of every
/// table.
pub(crate) fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

/// Handle to the embedded run/event/checkpoint database.
#[derive(Clone)]
pub struct WorkflowDB {
    conn: Arc<Mutex<Connection>>,
}

impl WorkflowDB {
    /// Open (creating if needed) the database at `path` and ensure the
    /// schema exists. Existing tables are never altered.
    pub fn open(path: impl AsRef<Path>) -> PipeFlowResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;

        // WAL keeps monitor readers from ever blocking the writer.
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        let db = WorkflowDB {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Open a private in-memory database (no WAL; single connection).
    pub fn open_in_memory() -> PipeFlowResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = WorkflowDB {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Acquire the connection, recovering from a poisoned mutex: SQLite
    /// state stays consistent across a panicking thread because every write
    /// is transactional.
    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poison) => {
                warn!("workflow db mutex was poisoned; recovering");
                poison.into_inner()
            }
        }
    }

    fn init_schema(&self) -> PipeFlowResult<()> {
        let conn = self.lock_conn();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS pf_runs (
                run_id      TEXT PRIMARY KEY,
                flow_name   TEXT,
                status      TEXT,
                started_at  REAL,
                ended_at    REAL,
                total_steps INTEGER,
                error       TEXT
            );

            CREATE TABLE IF NOT EXISTS pf_checkpoints (
                run_id     TEXT,
                step       INTEGER,
                node_name  TEXT,
                store_json TEXT,
                created_at REAL,
                PRIMARY KEY (run_id, step)
            );

            CREATE TABLE IF NOT EXISTS pf_events (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id     TEXT,
                event      TEXT,
                node_name  TEXT,
                action     TEXT,
                elapsed_ms REAL,
                error      TEXT,
                created_at REAL
            );

            CREATE INDEX IF NOT EXISTS idx_pf_runs_started ON pf_runs(started_at DESC);
            CREATE INDEX IF NOT EXISTS idx_pf_events_run ON pf_events(run_id, id);
            ",
        )?;
        Ok(())
    }

    /// Insert the `running` row for a new run. Idempotent on `run_id`.
    pub fn create_run(&self, run_id: &str, flow_name: &str, started_at: f64) -> PipeFlowResult<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT OR IGNORE INTO pf_runs (run_id, flow_name, status, started_at, total_steps)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![run_id, flow_name, RunStatus::Running.to_string(), started_at],
        )?;
        Ok(())
    }

    /// Update a run's terminal (or intermediate) bookkeeping.
    pub fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        ended_at: Option<f64>,
        total_steps: u64,
        error: Option<&str>,
    ) -> PipeFlowResult<()> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE pf_runs SET status = ?1, ended_at = ?2, total_steps = ?3, error = ?4
             WHERE run_id = ?5",
            params![status.to_string(), ended_at, total_steps as i64, error, run_id],
        )?;
        Ok(())
    }

    /// Append one lifecycle event.
    pub fn insert_event(
        &self,
        run_id: &str,
        event: &str,
        node_name: Option<&str>,
        action: Option<&str>,
        elapsed_ms: Option<f64>,
        error: Option<&str>,
    ) -> PipeFlowResult<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO pf_events (run_id, event, node_name, action, elapsed_ms, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![run_id, event, node_name, action, elapsed_ms, error, unix_now()],
        )?;
        Ok(())
    }

    /// Write (or overwrite) the checkpoint for one step.
    pub fn write_checkpoint(
        &self,
        run_id: &str,
        step: u64,
        node_name: &str,
        store_json: &str,
    ) -> PipeFlowResult<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT OR REPLACE INTO pf_checkpoints (run_id, step, node_name, store_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, step as i64, node_name, store_json, unix_now()],
        )?;
        Ok(())
    }

    /// Record one completed step atomically: the checkpoint row, the
    /// `node_end` event and the run's `total_steps` land in a single
    /// transaction, so a reader that observes the event also observes the
    /// checkpoint.
    pub fn record_step(
        &self,
        run_id: &str,
        step: u64,
        node_name: &str,
        store_json: &str,
        action: &str,
        elapsed_ms: f64,
    ) -> PipeFlowResult<()> {
        let mut conn = self.lock_conn();
        let now = unix_now();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO pf_checkpoints (run_id, step, node_name, store_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, step as i64, node_name, store_json, now],
        )?;
        tx.execute(
            "INSERT INTO pf_events (run_id, event, node_name, action, elapsed_ms, created_at)
             VALUES (?1, 'node_end', ?2, ?3, ?4, ?5)",
            params![run_id, node_name, action, elapsed_ms, now],
        )?;
        tx.execute(
            "UPDATE pf_runs SET total_steps = ?1 WHERE run_id = ?2",
            params![(step + 1) as i64, run_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// All runs, newest first.
    pub fn list_runs(&self) -> PipeFlowResult<Vec<RunRecord>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT run_id, flow_name, status, started_at, ended_at, total_steps, error
             FROM pf_runs ORDER BY started_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_run)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }

    /// Point lookup of one run.
    pub fn get_run(&self, run_id: &str) -> PipeFlowResult<Option<RunRecord>> {
        let conn = self.lock_conn();
        let run = conn
            .query_row(
                "SELECT run_id, flow_name, status, started_at, ended_at, total_steps, error
                 FROM pf_runs WHERE run_id = ?1",
                params![run_id],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    /// A run's events, ordered by insertion.
    pub fn get_events(&self, run_id: &str) -> PipeFlowResult<Vec<EventRecord>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, event, node_name, action, elapsed_ms, error, created_at
             FROM pf_events WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(EventRecord {
                id: row.get(0)?,
                run_id: row.get(1)?,
                event: row.get(2)?,
                node_name: row.get(3)?,
                action: row.get(4)?,
                elapsed_ms: row.get(5)?,
                error: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// A run's checkpoints, ordered by step.
    pub fn get_checkpoints(&self, run_id: &str) -> PipeFlowResult<Vec<CheckpointRecord>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT run_id, step, node_name, store_json, created_at
             FROM pf_checkpoints WHERE run_id = ?1 ORDER BY step ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(CheckpointRecord {
                run_id: row.get(0)?,
                step: row.get(1)?,
                node_name: row.get(2)?,
                store_json: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        let mut checkpoints = Vec::new();
        for row in rows {
            checkpoints.push(row?);
        }
        Ok(checkpoints)
    }

    /// Reconstruct the [`Store`] checkpointed at `step`, schema included.
    pub fn load_checkpoint(&self, run_id: &str, step: u64) -> PipeFlowResult<Store> {
        let store_json: String = {
            let conn = self.lock_conn();
            conn.query_row(
                "SELECT store_json FROM pf_checkpoints WHERE run_id = ?1 AND step = ?2",
                params![run_id, step as i64],
                |row| row.get(0),
            )?
        };
        Store::from_json(&store_json)
    }

    /// Mark runs left `running` by a dead process as `failed`.
    ///
    /// Intended for process startup, before any new run begins; a live
    /// writer in another thread of the same process would be misclassified.
    /// Returns the affected run ids.
    pub fn recover_stale_runs(&self) -> PipeFlowResult<Vec<String>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT run_id FROM pf_runs WHERE status = ?1")?;
        let stale: Vec<String> = stmt
            .query_map(params![RunStatus::Running.to_string()], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        for run_id in &stale {
            conn.execute(
                "UPDATE pf_runs SET status = ?1, ended_at = ?2, error = ?3 WHERE run_id = ?4",
                params![
                    RunStatus::Failed.to_string(),
                    unix_now(),
                    "interrupted",
                    run_id
                ],
            )?;
        }
        Ok(stale)
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let status: String = row.get(2)?;
    Ok(RunRecord {
        run_id: row.get(0)?,
        flow_name: row.get(1)?,
        // Unknown text in the status column reads as Failed rather than
        // aborting the whole listing.
        status: status.parse().unwrap_or(RunStatus::Failed),
        started_at: row.get(3)?,
        ended_at: row.get(4)?,
        total_steps: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
        error: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, TypeTag};
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_open_is_idempotent_on_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runs.db");
        {
            let db = WorkflowDB::open(&path).unwrap();
            db.create_run("a-1", "a", unix_now()).unwrap();
        }
        // Re-opening must not disturb existing rows.
        let db = WorkflowDB::open(&path).unwrap();
        assert_eq!(db.list_runs().unwrap().len(), 1);
    }

    #[test]
    fn test_create_run_is_idempotent() {
        let db = WorkflowDB::open_in_memory().unwrap();
        db.create_run("f-1", "f", 1.0).unwrap();
        db.create_run("f-1", "f", 2.0).unwrap();
        let runs = db.list_runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].started_at, 1.0);
        assert_eq!(runs[0].status, RunStatus::Running);
    }

    #[test]
    fn test_list_runs_newest_first() {
        let db = WorkflowDB::open_in_memory().unwrap();
        db.create_run("old", "f", 100.0).unwrap();
        db.create_run("new", "f", 200.0).unwrap();
        let runs = db.list_runs().unwrap();
        assert_eq!(runs[0].run_id, "new");
        assert_eq!(runs[1].run_id, "old");
    }

    #[test]
    fn test_events_ordered_by_id() {
        let db = WorkflowDB::open_in_memory().unwrap();
        db.create_run("r-1", "r", unix_now()).unwrap();
        db.insert_event("r-1", "flow_start", None, None, None, None)
            .unwrap();
        db.insert_event("r-1", "node_end", Some("A"), Some("next"), Some(1.5), None)
            .unwrap();
        db.insert_event("r-1", "flow_end", None, Some("done"), None, None)
            .unwrap();

        let events = db.get_events("r-1").unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(events[0].event, "flow_start");
        assert_eq!(events[2].event, "flow_end");
        assert_eq!(events[1].action.as_deref(), Some("next"));
    }

    #[test]
    fn test_record_step_is_atomic_and_updates_totals() {
        let db = WorkflowDB::open_in_memory().unwrap();
        db.create_run("r-1", "r", unix_now()).unwrap();

        let store_json = Store::new("s").to_json().unwrap();
        db.record_step("r-1", 0, "A", &store_json, "next", 3.2).unwrap();
        db.record_step("r-1", 1, "B", &store_json, "done", 1.1).unwrap();

        let checkpoints = db.get_checkpoints("r-1").unwrap();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].step, 0);
        assert_eq!(checkpoints[1].step, 1);

        let events = db.get_events("r-1").unwrap();
        assert!(events.iter().all(|e| e.event == "node_end"));

        let run = db.get_run("r-1").unwrap().unwrap();
        assert_eq!(run.total_steps, 2);
    }

    #[test]
    fn test_load_checkpoint_preserves_schema() {
        let db = WorkflowDB::open_in_memory().unwrap();
        db.create_run("r-1", "r", unix_now()).unwrap();

        let mut store = Store::with_schema("s", [("n", TypeTag::Int)]);
        store.set("n", json!(41)).unwrap();
        db.record_step("r-1", 0, "A", &store.to_json().unwrap(), "default", 0.1)
            .unwrap();

        let mut loaded = db.load_checkpoint("r-1", 0).unwrap();
        assert_eq!(loaded.get("n").unwrap(), json!(41));
        // Schema came back too: the type check still applies.
        assert!(loaded.set("n", json!("nope")).is_err());
    }

    #[test]
    fn test_write_checkpoint_directly() {
        let db = WorkflowDB::open_in_memory().unwrap();
        db.create_run("r-1", "r", unix_now()).unwrap();

        let mut store = Store::new("s");
        store.set("k", json!("v")).unwrap();
        db.write_checkpoint("r-1", 0, "A", &store.to_json().unwrap())
            .unwrap();
        // Idempotent on (run_id, step): a rewrite replaces the row.
        db.write_checkpoint("r-1", 0, "A", &store.to_json().unwrap())
            .unwrap();

        assert_eq!(db.get_checkpoints("r-1").unwrap().len(), 1);
        let loaded = db.load_checkpoint("r-1", 0).unwrap();
        assert_eq!(loaded.get("k").unwrap(), json!("v"));
    }

    #[test]
    fn test_load_missing_checkpoint_is_database_error() {
        let db = WorkflowDB::open_in_memory().unwrap();
        assert!(matches!(
            db.load_checkpoint("nope", 0),
            Err(crate::PipeFlowError::Database(_))
        ));
    }

    #[test]
    fn test_update_run_status_terminal_fields() {
        let db = WorkflowDB::open_in_memory().unwrap();
        db.create_run("r-1", "r", 10.0).unwrap();
        db.update_run_status("r-1", RunStatus::Failed, Some(20.0), 3, Some("boom"))
            .unwrap();

        let run = db.get_run("r-1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.ended_at, Some(20.0));
        assert_eq!(run.total_steps, 3);
        assert_eq!(run.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_recover_stale_runs() {
        let db = WorkflowDB::open_in_memory().unwrap();
        db.create_run("dead", "f", 1.0).unwrap();
        db.create_run("done", "f", 2.0).unwrap();
        db.update_run_status("done", RunStatus::Completed, Some(3.0), 1, None)
            .unwrap();

        let recovered = db.recover_stale_runs().unwrap();
        assert_eq!(recovered, vec!["dead".to_string()]);

        let dead = db.get_run("dead").unwrap().unwrap();
        assert_eq!(dead.status, RunStatus::Failed);
        assert_eq!(dead.error.as_deref(), Some("interrupted"));
        let done = db.get_run("done").unwrap().unwrap();
        assert_eq!(done.status, RunStatus::Completed);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<RunStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<RunStatus>().is_err());
    }
}
