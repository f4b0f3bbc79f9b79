//! SQLite storage implementation.
//!
//! Execution rows are written with an optimistic `revision` check: every
//! update names the revision it read, and loses (with
//! [`Error::ConcurrentUpdate`]) if another writer got there first.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use ring::digest::{digest, SHA256};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use super::models::*;
use crate::error::{Error, Result};
use crate::workflow::WorkflowDefinition;

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_json<T: DeserializeOwned>(s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_status(s: &str) -> rusqlite::Result<ExecutionStatus> {
    s.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    })
}

/// SHA-256 over the structural part of a definition (nodes + edges).
///
/// Stored next to each version, so it must not depend on the build.
fn structure_checksum(definition: &WorkflowDefinition) -> Result<String> {
    let structure = serde_json::to_vec(&(&definition.nodes, &definition.edges))?;
    Ok(hex::encode(digest(&SHA256, &structure)))
}

const EXECUTION_COLUMNS: &str = "workflow_id, lead_id, run_id, workflow_version, current_node, \
     status, state, next_wake_at, revision, created_at, updated_at";

/// Default batch size for due wake-up queries.
const DEFAULT_WAKEUP_BATCH: usize = 100;

/// SQLite-based storage.
#[derive(Clone)]
pub struct SqliteStorage {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init_schema_sync(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema_sync(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema_sync(conn: &Connection) -> Result<()> {
        // WAL mode must be set before any transaction begins
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                definition TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                version INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS workflow_versions (
                workflow_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                definition TEXT NOT NULL,
                checksum TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (workflow_id, version),
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                email TEXT,
                name TEXT,
                attributes TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS executions (
                workflow_id TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                workflow_version INTEGER NOT NULL,
                current_node TEXT NOT NULL,
                status TEXT NOT NULL,
                state TEXT NOT NULL,
                next_wake_at TEXT,
                revision INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (workflow_id, lead_id),
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_executions_workflow_updated
                ON executions(workflow_id, updated_at DESC);
            CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);

            CREATE TABLE IF NOT EXISTS execution_runs (
                run_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                workflow_version INTEGER NOT NULL,
                status TEXT NOT NULL,
                current_node TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                archived_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_execution_runs_key
                ON execution_runs(workflow_id, lead_id, archived_at DESC);

            CREATE TABLE IF NOT EXISTS scheduled_wakeups (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                wake_at TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scheduled_wakeups_due ON scheduled_wakeups(wake_at);
            CREATE INDEX IF NOT EXISTS idx_scheduled_wakeups_key
                ON scheduled_wakeups(workflow_id, lead_id);
            "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Workflow operations
    // ========================================================================

    /// Save a definition, bumping its version when nodes or edges changed.
    ///
    /// The incoming `version` is ignored; the store owns versioning.
    pub async fn save_workflow(&self, definition: &WorkflowDefinition) -> Result<StoredWorkflow> {
        let checksum = structure_checksum(definition)?;
        let now = Utc::now();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let existing: Option<(u32, String, String)> = tx
            .query_row(
                "SELECT version, checksum, created_at FROM workflows WHERE id = ?1",
                [definition.id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (version, created_at, changed) = match existing {
            None => (1, now, true),
            Some((version, old_checksum, created_at)) => {
                let created_at = parse_datetime_utc(&created_at)?;
                if old_checksum == checksum {
                    (version, created_at, false)
                } else {
                    (version + 1, created_at, true)
                }
            }
        };

        let mut stored_def = definition.clone();
        stored_def.version = version;
        let definition_json = serde_json::to_string(&stored_def)?;

        tx.execute(
            "INSERT INTO workflows (id, name, definition, is_active, version, checksum, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                is_active = excluded.is_active,
                version = excluded.version,
                checksum = excluded.checksum,
                updated_at = excluded.updated_at",
            params![
                stored_def.id,
                stored_def.name,
                definition_json,
                stored_def.is_active,
                version,
                checksum,
                fmt_ts(&created_at),
                fmt_ts(&now),
            ],
        )?;

        if changed {
            tx.execute(
                "INSERT INTO workflow_versions (workflow_id, version, definition, checksum, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![stored_def.id, version, definition_json, checksum, fmt_ts(&now)],
            )?;
        }

        tx.commit()?;

        Ok(StoredWorkflow {
            definition: stored_def,
            checksum,
            created_at,
            updated_at: now,
        })
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Option<StoredWorkflow>> {
        let conn = self.conn.lock().await;
        let workflow = conn
            .query_row(
                "SELECT definition, checksum, created_at, updated_at FROM workflows WHERE id = ?1",
                [id],
                Self::row_to_workflow,
            )
            .optional()?;
        Ok(workflow)
    }

    pub async fn list_workflows(&self) -> Result<Vec<StoredWorkflow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT definition, checksum, created_at, updated_at FROM workflows ORDER BY id",
        )?;
        let workflows = stmt
            .query_map([], Self::row_to_workflow)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(workflows)
    }

    /// Active workflows only, for event dispatch.
    pub async fn list_active_workflows(&self) -> Result<Vec<StoredWorkflow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT definition, checksum, created_at, updated_at FROM workflows
             WHERE is_active = 1 ORDER BY id",
        )?;
        let workflows = stmt
            .query_map([], Self::row_to_workflow)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(workflows)
    }

    /// Toggle `isActive`. Does not create a new version.
    pub async fn set_workflow_active(&self, id: &str, active: bool) -> Result<StoredWorkflow> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let mut workflow = tx
            .query_row(
                "SELECT definition, checksum, created_at, updated_at FROM workflows WHERE id = ?1",
                [id],
                Self::row_to_workflow,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("workflow '{}'", id)))?;

        workflow.definition.is_active = active;
        workflow.updated_at = Utc::now();
        tx.execute(
            "UPDATE workflows SET definition = ?1, is_active = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                serde_json::to_string(&workflow.definition)?,
                active,
                fmt_ts(&workflow.updated_at),
                id
            ],
        )?;
        tx.commit()?;
        Ok(workflow)
    }

    /// The immutable snapshot an execution pinned.
    pub async fn get_workflow_version(
        &self,
        workflow_id: &str,
        version: u32,
    ) -> Result<Option<WorkflowVersion>> {
        let conn = self.conn.lock().await;
        let snapshot = conn
            .query_row(
                "SELECT workflow_id, version, definition, checksum, created_at
                 FROM workflow_versions WHERE workflow_id = ?1 AND version = ?2",
                params![workflow_id, version],
                Self::row_to_workflow_version,
            )
            .optional()?;
        Ok(snapshot)
    }

    pub async fn list_workflow_versions(&self, workflow_id: &str) -> Result<Vec<WorkflowVersion>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT workflow_id, version, definition, checksum, created_at
             FROM workflow_versions WHERE workflow_id = ?1 ORDER BY version DESC",
        )?;
        let versions = stmt
            .query_map([workflow_id], Self::row_to_workflow_version)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    fn row_to_workflow(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredWorkflow> {
        Ok(StoredWorkflow {
            definition: parse_json(&row.get::<_, String>(0)?)?,
            checksum: row.get(1)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(2)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(3)?)?,
        })
    }

    fn row_to_workflow_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowVersion> {
        Ok(WorkflowVersion {
            workflow_id: row.get(0)?,
            version: row.get(1)?,
            definition: parse_json(&row.get::<_, String>(2)?)?,
            checksum: row.get(3)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(4)?)?,
        })
    }

    // ========================================================================
    // Lead operations
    // ========================================================================

    pub async fn upsert_lead(&self, lead: &Lead) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO leads (id, email, name, attributes, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                name = excluded.name,
                attributes = excluded.attributes,
                updated_at = excluded.updated_at",
            params![
                lead.id,
                lead.email,
                lead.name,
                serde_json::to_string(&lead.attributes)?,
                fmt_ts(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub async fn get_lead(&self, id: &str) -> Result<Option<Lead>> {
        let conn = self.conn.lock().await;
        let lead = conn
            .query_row(
                "SELECT id, email, name, attributes FROM leads WHERE id = ?1",
                [id],
                |row| {
                    Ok(Lead {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        name: row.get(2)?,
                        attributes: parse_json(&row.get::<_, String>(3)?)?,
                    })
                },
            )
            .optional()?;
        Ok(lead)
    }

    // ========================================================================
    // Execution operations
    // ========================================================================

    pub async fn get_execution(
        &self,
        workflow_id: &str,
        lead_id: &str,
    ) -> Result<Option<ExecutionState>> {
        let conn = self.conn.lock().await;
        Self::get_execution_sync(&conn, workflow_id, lead_id)
    }

    fn get_execution_sync(
        conn: &Connection,
        workflow_id: &str,
        lead_id: &str,
    ) -> Result<Option<ExecutionState>> {
        let sql = format!(
            "SELECT {} FROM executions WHERE workflow_id = ?1 AND lead_id = ?2",
            EXECUTION_COLUMNS
        );
        let execution = conn
            .query_row(&sql, params![workflow_id, lead_id], Self::row_to_execution)
            .optional()?;
        Ok(execution)
    }

    /// Executions of a workflow, newest-updated first.
    pub async fn list_executions(&self, workflow_id: &str) -> Result<Vec<ExecutionState>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM executions WHERE workflow_id = ?1 ORDER BY updated_at DESC, lead_id",
            EXECUTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let executions = stmt
            .query_map([workflow_id], Self::row_to_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(executions)
    }

    /// Create-or-restart the execution for `(workflowId, leadId)`.
    ///
    /// An existing row is archived into the run log and replaced. The new
    /// row's revision continues from the old one so any writer still holding
    /// the previous revision loses.
    pub async fn start_run(&self, execution: &ExecutionState) -> Result<ExecutionState> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let previous =
            Self::get_execution_sync(&tx, &execution.workflow_id, &execution.lead_id)?;

        let mut fresh = execution.clone();
        fresh.revision = 0;
        if let Some(previous) = &previous {
            Self::archive_run(&tx, previous, fresh.created_at)?;
            tx.execute(
                "DELETE FROM scheduled_wakeups WHERE workflow_id = ?1 AND lead_id = ?2",
                params![previous.workflow_id, previous.lead_id],
            )?;
            fresh.revision = previous.revision + 1;
        }

        tx.execute(
            "INSERT INTO executions (workflow_id, lead_id, run_id, workflow_version, current_node,
                status, state, next_wake_at, revision, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(workflow_id, lead_id) DO UPDATE SET
                run_id = excluded.run_id,
                workflow_version = excluded.workflow_version,
                current_node = excluded.current_node,
                status = excluded.status,
                state = excluded.state,
                next_wake_at = excluded.next_wake_at,
                revision = excluded.revision,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at",
            params![
                fresh.workflow_id,
                fresh.lead_id,
                fresh.run_id,
                fresh.workflow_version,
                fresh.current_node,
                fresh.status.as_str(),
                serde_json::to_string(&fresh.state)?,
                fresh.next_wake_at.as_ref().map(fmt_ts),
                fresh.revision,
                fmt_ts(&fresh.created_at),
                fmt_ts(&fresh.updated_at),
            ],
        )?;

        tx.commit()?;
        Ok(fresh)
    }

    fn archive_run(
        tx: &Transaction<'_>,
        previous: &ExecutionState,
        archived_at: DateTime<Utc>,
    ) -> Result<()> {
        tx.execute(
            "INSERT OR REPLACE INTO execution_runs
             (run_id, workflow_id, lead_id, workflow_version, status, current_node, state, created_at, archived_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                previous.run_id,
                previous.workflow_id,
                previous.lead_id,
                previous.workflow_version,
                previous.status.as_str(),
                previous.current_node,
                serde_json::to_string(&previous.state)?,
                fmt_ts(&previous.created_at),
                fmt_ts(&archived_at),
            ],
        )?;
        Ok(())
    }

    /// Write an execution if its stored revision still equals `expected_revision`.
    ///
    /// When the new state is WAITING with a wake-up time, the durable
    /// wake-up is scheduled in the same transaction. Returns the state as
    /// stored (with its new revision).
    pub async fn update_execution(
        &self,
        execution: &ExecutionState,
        expected_revision: i64,
    ) -> Result<ExecutionState> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let mut updated = execution.clone();
        updated.revision = expected_revision + 1;

        let rows = tx.execute(
            "UPDATE executions SET
                current_node = ?1,
                status = ?2,
                state = ?3,
                next_wake_at = ?4,
                revision = ?5,
                updated_at = ?6
             WHERE workflow_id = ?7 AND lead_id = ?8 AND run_id = ?9 AND revision = ?10",
            params![
                updated.current_node,
                updated.status.as_str(),
                serde_json::to_string(&updated.state)?,
                updated.next_wake_at.as_ref().map(fmt_ts),
                updated.revision,
                fmt_ts(&updated.updated_at),
                updated.workflow_id,
                updated.lead_id,
                updated.run_id,
                expected_revision,
            ],
        )?;

        if rows == 0 {
            return Err(Error::ConcurrentUpdate {
                workflow_id: updated.workflow_id,
                lead_id: updated.lead_id,
            });
        }

        if let (ExecutionStatus::Waiting, Some(wake_at)) = (updated.status, updated.next_wake_at) {
            Self::insert_wakeup(
                &tx,
                &updated.workflow_id,
                &updated.lead_id,
                &updated.run_id,
                wake_at,
            )?;
        }

        tx.commit()?;
        Ok(updated)
    }

    fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionState> {
        Ok(ExecutionState {
            workflow_id: row.get(0)?,
            lead_id: row.get(1)?,
            run_id: row.get(2)?,
            workflow_version: row.get(3)?,
            current_node: row.get(4)?,
            status: parse_status(&row.get::<_, String>(5)?)?,
            state: parse_json(&row.get::<_, String>(6)?)?,
            next_wake_at: row
                .get::<_, Option<String>>(7)?
                .map(|s| parse_datetime_utc(&s))
                .transpose()?,
            revision: row.get(8)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(9)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(10)?)?,
        })
    }

    // ========================================================================
    // Run log
    // ========================================================================

    /// Archived runs for a `(workflowId, leadId)` pair, newest first.
    pub async fn list_runs(&self, workflow_id: &str, lead_id: &str) -> Result<Vec<ExecutionRun>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT run_id, workflow_id, lead_id, workflow_version, status, current_node, state,
                    created_at, archived_at
             FROM execution_runs
             WHERE workflow_id = ?1 AND lead_id = ?2
             ORDER BY archived_at DESC",
        )?;
        let runs = stmt
            .query_map(params![workflow_id, lead_id], |row| {
                Ok(ExecutionRun {
                    run_id: row.get(0)?,
                    workflow_id: row.get(1)?,
                    lead_id: row.get(2)?,
                    workflow_version: row.get(3)?,
                    status: parse_status(&row.get::<_, String>(4)?)?,
                    current_node: row.get(5)?,
                    state: parse_json(&row.get::<_, String>(6)?)?,
                    created_at: parse_datetime_utc(&row.get::<_, String>(7)?)?,
                    archived_at: parse_datetime_utc(&row.get::<_, String>(8)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    // ========================================================================
    // Scheduled wake-ups
    // ========================================================================

    fn insert_wakeup(
        conn: &Connection,
        workflow_id: &str,
        lead_id: &str,
        run_id: &str,
        wake_at: DateTime<Utc>,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO scheduled_wakeups (id, workflow_id, lead_id, run_id, wake_at, attempts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![id, workflow_id, lead_id, run_id, fmt_ts(&wake_at), fmt_ts(&Utc::now())],
        )?;
        Ok(id)
    }

    /// Schedule a wake-up outside of an execution update (re-arming).
    pub async fn schedule_wakeup(
        &self,
        workflow_id: &str,
        lead_id: &str,
        run_id: &str,
        wake_at: DateTime<Utc>,
    ) -> Result<String> {
        let conn = self.conn.lock().await;
        Self::insert_wakeup(&conn, workflow_id, lead_id, run_id, wake_at)
    }

    /// Wake-ups due at `now`, oldest first.
    pub async fn get_due_wakeups(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledWakeup>> {
        let limit = if limit == 0 { DEFAULT_WAKEUP_BATCH } else { limit };
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, workflow_id, lead_id, run_id, wake_at, attempts, created_at
             FROM scheduled_wakeups
             WHERE wake_at <= ?1
             ORDER BY wake_at ASC
             LIMIT ?2",
        )?;
        let wakeups = stmt
            .query_map(params![fmt_ts(&now), limit as i64], |row| {
                Ok(ScheduledWakeup {
                    id: row.get(0)?,
                    workflow_id: row.get(1)?,
                    lead_id: row.get(2)?,
                    run_id: row.get(3)?,
                    wake_at: parse_datetime_utc(&row.get::<_, String>(4)?)?,
                    attempts: row.get(5)?,
                    created_at: parse_datetime_utc(&row.get::<_, String>(6)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(wakeups)
    }

    pub async fn delete_wakeup(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM scheduled_wakeups WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Push a wake-up later after a failed delivery.
    pub async fn reschedule_wakeup(&self, id: &str, wake_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE scheduled_wakeups SET wake_at = ?1, attempts = attempts + 1 WHERE id = ?2",
            params![fmt_ts(&wake_at), id],
        )?;
        Ok(())
    }

    pub async fn count_pending_wakeups(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM scheduled_wakeups", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// WAITING executions whose current run has no wake-up row.
    pub async fn list_waiting_without_wakeup(&self) -> Result<Vec<ExecutionState>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM executions e
             WHERE e.status = 'WAITING'
               AND NOT EXISTS (
                   SELECT 1 FROM scheduled_wakeups w
                   WHERE w.workflow_id = e.workflow_id
                     AND w.lead_id = e.lead_id
                     AND w.run_id = e.run_id
               )",
            EXECUTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let executions = stmt
            .query_map([], Self::row_to_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(executions)
    }

    /// Executions left in RUNNING, e.g. by a crash between two transitions.
    pub async fn list_running_executions(&self) -> Result<Vec<ExecutionState>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM executions WHERE status = 'RUNNING' ORDER BY updated_at",
            EXECUTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let executions = stmt
            .query_map([], Self::row_to_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(executions)
    }

    /// Simple liveness check.
    pub async fn check_health(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}
