//! libSQL backend: async `Database` trait implementation.
//!
//! A single connection is shared for all operations. Writes are serialized
//! through `write_lock` so the finalize transaction never interleaves with
//! another statement on the same connection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::ScheduledJob;
use crate::runs::{
    JobOutcome, JobRun, Notification, NotificationPriority, RunOutcome, RunStatus,
};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str, column: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("bad uuid in {column}: {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_json<T: serde::Serialize>(value: Option<&T>) -> Result<libsql::Value, DatabaseError> {
    value
        .map(|v| serde_json::to_string(v))
        .transpose()
        .map(opt_text_owned)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn parse_json<T: serde::de::DeserializeOwned>(s: Option<String>) -> Option<T> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}

const JOB_COLUMNS: &str = "id, user_id, name, prompt, schedule, notes, enabled, last_run_at, last_run_status, next_fire_at, created_at, updated_at";

const RUN_COLUMNS: &str = "id, job_id, status, stream_id, started_at, completed_at, summary, tool_calls_executed, notifications_emitted, duration_ms, error_details, token_usage, model_id, trace_id, warnings";

const NOTIFICATION_COLUMNS: &str = "id, run_id, job_id, user_id, title, body, priority, created_at";

/// Map a libsql Row to a ScheduledJob. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<ScheduledJob, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("job row parse: {e}"));

    let id: String = row.get(0).map_err(read)?;
    let enabled: i64 = row.get(6).map_err(read)?;
    let created: String = row.get(10).map_err(read)?;
    let updated: String = row.get(11).map_err(read)?;

    Ok(ScheduledJob {
        id: parse_uuid(&id, "scheduled_jobs.id")?,
        user_id: row.get(1).map_err(read)?,
        name: row.get(2).map_err(read)?,
        prompt: row.get(3).map_err(read)?,
        schedule: row.get::<String>(4).ok(),
        notes: row.get::<String>(5).ok(),
        enabled: enabled != 0,
        last_run_at: parse_optional_datetime(&row.get::<String>(7).ok()),
        last_run_status: row
            .get::<String>(8)
            .ok()
            .and_then(|s| s.parse::<RunStatus>().ok()),
        next_fire_at: parse_optional_datetime(&row.get::<String>(9).ok()),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

/// Map a libsql Row to a JobRun. Column order matches RUN_COLUMNS.
///
/// The outcome is present only when `completed_at` is set.
fn row_to_run(row: &libsql::Row) -> Result<JobRun, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("run row parse: {e}"));

    let id: String = row.get(0).map_err(read)?;
    let job_id: String = row.get(1).map_err(read)?;
    let status: String = row.get(2).map_err(read)?;
    let started: String = row.get(4).map_err(read)?;
    let completed_at = parse_optional_datetime(&row.get::<String>(5).ok());

    let outcome = match completed_at {
        Some(completed_at) => Some(RunOutcome {
            summary: row.get::<String>(6).unwrap_or_default(),
            tool_calls_executed: row.get::<i64>(7).unwrap_or(0).max(0) as u32,
            notifications_emitted: row.get::<i64>(8).unwrap_or(0).max(0) as u32,
            duration_ms: row.get::<i64>(9).unwrap_or(0).max(0) as u64,
            error_details: parse_json(row.get::<String>(10).ok()),
            token_usage: parse_json(row.get::<String>(11).ok()),
            model_id: row.get::<String>(12).ok(),
            trace_id: row.get::<String>(13).ok(),
            warnings: parse_json(row.get::<String>(14).ok()).unwrap_or_default(),
            completed_at,
        }),
        None => None,
    };

    Ok(JobRun {
        id: parse_uuid(&id, "job_runs.id")?,
        job_id: parse_uuid(&job_id, "job_runs.job_id")?,
        status: status
            .parse()
            .map_err(|e: String| DatabaseError::Serialization(e))?,
        stream_id: row.get::<String>(3).ok(),
        started_at: parse_datetime(&started),
        outcome,
    })
}

fn row_to_notification(row: &libsql::Row) -> Result<Notification, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("notification row parse: {e}"));

    let id: String = row.get(0).map_err(read)?;
    let run_id: String = row.get(1).map_err(read)?;
    let job_id: String = row.get(2).map_err(read)?;
    let priority: String = row.get(6).map_err(read)?;
    let created: String = row.get(7).map_err(read)?;

    Ok(Notification {
        id: parse_uuid(&id, "notifications.id")?,
        run_id: parse_uuid(&run_id, "notifications.run_id")?,
        job_id: parse_uuid(&job_id, "notifications.job_id")?,
        user_id: row.get(3).map_err(read)?,
        title: row.get(4).map_err(read)?,
        body: row.get(5).map_err(read)?,
        priority: NotificationPriority::parse_lenient(&priority),
        created_at: parse_datetime(&created),
    })
}

async fn collect_rows<T>(
    mut rows: libsql::Rows,
    context: &str,
    map: impl Fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => out.push(map(&row)?),
            Ok(None) => break,
            Err(e) => return Err(DatabaseError::Query(format!("{context}: {e}"))),
        }
    }
    Ok(out)
}

/// Body of the finalize transaction. Returns false if the run was not running.
async fn apply_outcome(
    conn: &Connection,
    run_id: Uuid,
    job_id: Uuid,
    outcome: &JobOutcome,
) -> Result<bool, DatabaseError> {
    let q = |e: libsql::Error| DatabaseError::Query(format!("finalize_run: {e}"));
    let now = Utc::now().to_rfc3339();
    let status = outcome.run_status();

    let changed = conn
        .execute(
            "UPDATE job_runs SET status = ?1, stream_id = NULL, completed_at = ?2, summary = ?3, \
             tool_calls_executed = ?4, duration_ms = ?5, error_details = ?6, token_usage = ?7, \
             model_id = ?8, trace_id = ?9, warnings = ?10 \
             WHERE id = ?11 AND status = 'running'",
            params![
                status.as_str(),
                now.clone(),
                outcome.summary.as_str(),
                i64::from(outcome.tool_calls_executed),
                i64::try_from(outcome.duration_ms).unwrap_or(i64::MAX),
                opt_json(outcome.error_details.as_ref())?,
                opt_json(outcome.token_usage.as_ref())?,
                opt_text(outcome.model_id.as_deref()),
                opt_text(outcome.trace_id.as_deref()),
                opt_json((!outcome.warnings.is_empty()).then_some(&outcome.warnings))?,
                run_id.to_string(),
            ],
        )
        .await
        .map_err(q)?;

    if changed == 0 {
        return Ok(false);
    }

    let user_id = {
        let mut rows = conn
            .query(
                "SELECT user_id FROM scheduled_jobs WHERE id = ?1",
                params![job_id.to_string()],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => row.get::<String>(0).map_err(q)?,
            None => "default".to_string(),
        }
    };

    for notification in &outcome.notifications {
        conn.execute(
            "INSERT OR IGNORE INTO notifications (id, run_id, job_id, user_id, title, body, priority, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                Uuid::new_v4().to_string(),
                run_id.to_string(),
                job_id.to_string(),
                user_id.as_str(),
                notification.title.as_str(),
                notification.body.as_str(),
                notification.priority.as_str(),
                now.clone(),
            ],
        )
        .await
        .map_err(q)?;
    }

    conn.execute(
        "UPDATE job_runs SET notifications_emitted = \
         (SELECT COUNT(*) FROM notifications WHERE run_id = ?1) WHERE id = ?1",
        params![run_id.to_string()],
    )
    .await
    .map_err(q)?;

    conn.execute(
        "UPDATE scheduled_jobs SET notes = COALESCE(?1, notes), last_run_at = ?2, \
         last_run_status = ?3, updated_at = ?2 WHERE id = ?4",
        params![
            opt_text(outcome.updated_notes.as_deref()),
            now,
            status.as_str(),
            job_id.to_string(),
        ],
    )
    .await
    .map_err(q)?;

    Ok(true)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Scheduled jobs ──────────────────────────────────────────────

    async fn create_job(&self, job: &ScheduledJob) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO scheduled_jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    job.id.to_string(),
                    job.user_id.as_str(),
                    job.name.as_str(),
                    job.prompt.as_str(),
                    opt_text(job.schedule.as_deref()),
                    opt_text(job.notes.as_deref()),
                    i64::from(job.enabled),
                    opt_text_owned(job.last_run_at.map(|t| t.to_rfc3339())),
                    opt_text(job.last_run_status.map(|s| s.as_str())),
                    opt_text_owned(job.next_fire_at.map(|t| t.to_rfc3339())),
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| match e.to_string() {
                msg if msg.contains("UNIQUE") => DatabaseError::Constraint(msg),
                msg => DatabaseError::Query(format!("create_job: {msg}")),
            })?;

        debug!(job_id = %job.id, name = %job.name, "Scheduled job inserted");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ScheduledJob>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }

    async fn list_jobs(&self) -> Result<Vec<ScheduledJob>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs ORDER BY created_at ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs: {e}")))?;
        collect_rows(rows, "list_jobs", row_to_job).await
    }

    async fn list_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM scheduled_jobs \
                     WHERE enabled = 1 AND next_fire_at IS NOT NULL AND next_fire_at <= ?1 \
                     ORDER BY next_fire_at ASC"
                ),
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_due_jobs: {e}")))?;
        collect_rows(rows, "list_due_jobs", row_to_job).await
    }

    async fn advance_next_fire(
        &self,
        id: Uuid,
        expected: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE scheduled_jobs SET next_fire_at = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND next_fire_at = ?4",
                params![
                    opt_text_owned(next.map(|t| t.to_rfc3339())),
                    Utc::now().to_rfc3339(),
                    id.to_string(),
                    expected.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("advance_next_fire: {e}")))?;
        Ok(changed == 1)
    }

    // ── Runs ────────────────────────────────────────────────────────

    async fn insert_run(&self, run: &JobRun) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO job_runs (id, job_id, status, stream_id, started_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run.id.to_string(),
                    run.job_id.to_string(),
                    run.status.as_str(),
                    opt_text(run.stream_id.as_deref()),
                    run.started_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_run: {e}")))?;

        debug!(run_id = %run.id, job_id = %run.job_id, "Run inserted into DB");
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<JobRun>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM job_runs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_run: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_run: {e}"))),
        }
    }

    async fn list_runs(&self, job_id: Uuid, limit: u32) -> Result<Vec<JobRun>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM job_runs WHERE job_id = ?1 \
                     ORDER BY started_at DESC, rowid DESC LIMIT ?2"
                ),
                params![job_id.to_string(), i64::from(limit)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_runs: {e}")))?;
        collect_rows(rows, "list_runs", row_to_run).await
    }

    async fn list_stale_runs(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<JobRun>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM job_runs \
                     WHERE status = 'running' AND started_at < ?1 ORDER BY started_at ASC"
                ),
                params![started_before.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_stale_runs: {e}")))?;
        collect_rows(rows, "list_stale_runs", row_to_run).await
    }

    async fn set_run_stream(&self, run_id: Uuid, stream_id: &str) -> Result<u64, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE job_runs SET stream_id = ?1 \
                 WHERE id = ?2 AND status = 'running' AND (stream_id IS NULL OR stream_id = ?1)",
                params![stream_id, run_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_run_stream: {e}")))
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        job_id: Uuid,
        outcome: &JobOutcome,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("finalize_run begin: {e}")))?;

        match apply_outcome(&tx, run_id, job_id, outcome).await {
            Ok(applied) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("finalize_run commit: {e}")))?;
                Ok(applied)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(run_id = %run_id, error = %rollback, "finalize_run rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn clear_run_stream(&self, run_id: Uuid) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE job_runs SET stream_id = NULL WHERE id = ?1",
                params![run_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_run_stream: {e}")))?;
        Ok(())
    }

    async fn list_notifications(&self, run_id: Uuid) -> Result<Vec<Notification>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE run_id = ?1 \
                     ORDER BY created_at ASC, rowid ASC"
                ),
                params![run_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_notifications: {e}")))?;
        collect_rows(rows, "list_notifications", row_to_notification).await
    }
}
