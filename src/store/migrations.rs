//! Version-tracked database migrations for the libSQL backend.
//!
//! Applied versions are recorded in `_migrations`; only newer entries of
//! `MIGRATIONS` run on startup.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                prompt TEXT NOT NULL,
                schedule TEXT,
                notes TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                last_run_at TEXT,
                next_fire_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_next_fire
                ON scheduled_jobs(next_fire_at) WHERE enabled = 1;

            CREATE TABLE IF NOT EXISTS job_runs (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES scheduled_jobs(id) ON DELETE CASCADE,
                status TEXT NOT NULL DEFAULT 'running',
                stream_id TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                summary TEXT,
                tool_calls_executed INTEGER NOT NULL DEFAULT 0,
                notifications_emitted INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                error_details TEXT,
                token_usage TEXT,
                model_id TEXT,
                trace_id TEXT,
                CHECK (stream_id IS NULL OR status = 'running')
            );
            CREATE INDEX IF NOT EXISTS idx_job_runs_job ON job_runs(job_id, started_at);
            CREATE INDEX IF NOT EXISTS idx_job_runs_status ON job_runs(status);
        "#,
    },
    Migration {
        version: 2,
        name: "run_notifications",
        sql: r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES job_runs(id) ON DELETE CASCADE,
                job_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                priority TEXT NOT NULL DEFAULT 'normal',
                created_at TEXT NOT NULL,
                UNIQUE (run_id, title, body)
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id, created_at);
        "#,
    },
    Migration {
        version: 3,
        name: "run_warnings",
        sql: r#"
            ALTER TABLE job_runs ADD COLUMN warnings TEXT;
            ALTER TABLE scheduled_jobs ADD COLUMN last_run_status TEXT;
        "#,
    },
];

/// Bring the schema up to the latest version.
///
/// Each pending migration and its `_migrations` row are committed together,
/// so a failed step leaves the version where it was.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| migration_error("create _migrations", e))?;

    let applied = applied_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for migration in pending {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        let step = format!("V{} ({})", migration.version, migration.name);
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO _migrations (version, name) VALUES ({}, '{}');\nCOMMIT;",
            migration.sql, migration.version, migration.name
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            // Ignore rollback errors: the batch may have failed before BEGIN took effect.
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(migration_error(&step, e));
        }
    }

    tracing::info!(
        version = MIGRATIONS.last().map_or(0, |m| m.version),
        "Schema migrated"
    );
    Ok(())
}

async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| migration_error("read version", e))?;
    match rows.next().await.map_err(|e| migration_error("read version", e))? {
        Some(row) => row.get::<i64>(0).map_err(|e| migration_error("read version", e)),
        None => Ok(0),
    }
}

fn migration_error(step: &str, e: libsql::Error) -> DatabaseError {
    DatabaseError::Migration(format!("{step} failed: {e}"))
}
