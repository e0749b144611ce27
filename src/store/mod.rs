//! Durable row store for tasks, task events, and step records.
//!
//! SQLite via sqlx. The engine needs nothing fancier than atomic
//! single-row conditional updates: every lifecycle transition is a
//! compare-and-swap keyed on the expected prior status, so concurrent
//! workers coordinate purely through the task row.

pub mod models;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::error::Result;
use models::{StepRecord, Task, TaskEvent, TaskEventType, TaskStatus};

pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Open (or create) a store at the given path and run migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
            }
        }

        // ?mode=rwc creates the database file if it doesn't exist
        let database_url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests. Single connection: each SQLite memory
    /// database is private to its connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL,
                input_text TEXT NOT NULL,
                input_data TEXT NOT NULL,
                result TEXT,
                error TEXT,
                locked_by TEXT,
                locked_at TEXT,
                lease_expires_at TEXT,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tasks_status_created
            ON tasks(status, created_at)
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_steps (
                task_id INTEGER NOT NULL,
                step_id TEXT NOT NULL,
                status TEXT NOT NULL,
                result TEXT,
                error TEXT,
                started_at TEXT,
                completed_at TEXT,
                PRIMARY KEY (task_id, step_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    // ==================== tasks ====================

    pub async fn insert_task(
        &self,
        user_id: i64,
        task_type: &str,
        input_text: &str,
        input_data: &Value,
    ) -> Result<Task> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO tasks
                (user_id, task_type, status, input_text, input_data, created_at, updated_at)
            VALUES (?, ?, 'pending', ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(task_type)
        .bind(input_text)
        .bind(serde_json::to_string(input_data)?)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        task_from_row(&row)
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    /// Atomically claim the oldest pending task: a conditional update keyed
    /// on "status still pending", so concurrent claimants never double-claim.
    /// `started_at` is set on first claim only and survives pause/resume.
    pub async fn claim_oldest_pending(
        &self,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let lease_expires = now + lease_duration;
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'running',
                locked_by = ?,
                locked_at = ?,
                lease_expires_at = ?,
                started_at = COALESCE(started_at, ?),
                updated_at = ?
            WHERE id = (
                SELECT id FROM tasks
                WHERE status = 'pending'
                ORDER BY created_at ASC, id ASC
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now.to_rfc3339())
        .bind(lease_expires.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    /// Revert running tasks whose lease has expired back to pending.
    /// Returns the number of tasks reaped.
    pub async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending',
                locked_by = NULL,
                locked_at = NULL,
                lease_expires_at = NULL,
                updated_at = ?
            WHERE status = 'running' AND lease_expires_at <= ?
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// running -> paused. Lock fields are cleared: a paused task holds no
    /// lease, it waits indefinitely for an external decision.
    pub async fn mark_paused(&self, task_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'paused',
                locked_by = NULL,
                locked_at = NULL,
                lease_expires_at = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// paused -> pending, making the task claimable again.
    pub async fn mark_resumed(&self, task_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending', updated_at = ?
            WHERE id = ? AND status = 'paused'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// running -> completed with a result payload.
    pub async fn mark_completed(&self, task_id: i64, result: &Value) -> Result<bool> {
        let now = Utc::now();
        let outcome = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'completed',
                result = ?,
                locked_by = NULL,
                locked_at = NULL,
                lease_expires_at = NULL,
                completed_at = ?,
                updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(serde_json::to_string(result)?)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() == 1)
    }

    /// running or paused -> failed with a human-readable error.
    pub async fn mark_failed(&self, task_id: i64, error: &str) -> Result<bool> {
        let now = Utc::now();
        let outcome = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed',
                error = ?,
                locked_by = NULL,
                locked_at = NULL,
                lease_expires_at = NULL,
                completed_at = ?,
                updated_at = ?
            WHERE id = ? AND status IN ('running', 'paused')
            "#,
        )
        .bind(error)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() == 1)
    }

    // ==================== events ====================

    pub async fn append_event(
        &self,
        task_id: i64,
        event_type: TaskEventType,
        event_data: &Value,
    ) -> Result<TaskEvent> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO task_events (task_id, event_type, event_data, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(task_id)
        .bind(event_type.as_str())
        .bind(serde_json::to_string(event_data)?)
        .bind(now.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(TaskEvent {
            id: row.try_get("id")?,
            task_id,
            event_type,
            event_data: event_data.clone(),
            created_at: now,
        })
    }

    pub async fn list_events(&self, task_id: i64) -> Result<Vec<TaskEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, event_type, event_data, created_at
            FROM task_events
            WHERE task_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    // ==================== steps ====================

    /// Upsert the durable record of one step. Only the lease holder writes
    /// these rows, so there is no cross-worker contention.
    pub async fn upsert_step(&self, record: &StepRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_steps
                (task_id, step_id, status, result, error, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (task_id, step_id) DO UPDATE SET
                status = excluded.status,
                result = excluded.result,
                error = excluded.error,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(record.task_id)
        .bind(&record.step_id)
        .bind(&record.status)
        .bind(
            record
                .result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&record.error)
        .bind(record.started_at.map(|t| t.to_rfc3339()))
        .bind(record.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_steps(&self, task_id: i64) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT task_id, step_id, status, result, error, started_at, completed_at
            FROM task_steps
            WHERE task_id = ?
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(step_from_row).collect()
    }
}

fn parse_timestamp(raw: String) -> std::result::Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn parse_opt_timestamp(
    raw: Option<String>,
) -> std::result::Result<Option<DateTime<Utc>>, sqlx::Error> {
    raw.map(parse_timestamp).transpose()
}

fn parse_status(raw: &str) -> std::result::Result<TaskStatus, sqlx::Error> {
    TaskStatus::parse(raw).ok_or_else(|| {
        sqlx::Error::Decode(format!("unknown task status '{raw}'").into())
    })
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let status: String = row.try_get("status")?;
    let input_data: String = row.try_get("input_data")?;
    let result: Option<String> = row.try_get("result")?;

    Ok(Task {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        task_type: row.try_get("task_type")?,
        status: parse_status(&status)?,
        input_text: row.try_get("input_text")?,
        input_data: serde_json::from_str(&input_data)?,
        result: result.as_deref().map(serde_json::from_str).transpose()?,
        error: row.try_get("error")?,
        locked_by: row.try_get("locked_by")?,
        locked_at: parse_opt_timestamp(row.try_get("locked_at")?)?,
        lease_expires_at: parse_opt_timestamp(row.try_get("lease_expires_at")?)?,
        started_at: parse_opt_timestamp(row.try_get("started_at")?)?,
        completed_at: parse_opt_timestamp(row.try_get("completed_at")?)?,
        created_at: parse_timestamp(row.try_get("created_at")?)?,
        updated_at: parse_timestamp(row.try_get("updated_at")?)?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<TaskEvent> {
    let event_type: String = row.try_get("event_type")?;
    let event_data: String = row.try_get("event_data")?;

    Ok(TaskEvent {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        event_type: TaskEventType::parse(&event_type).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown event type '{event_type}'").into())
        })?,
        event_data: serde_json::from_str(&event_data)?,
        created_at: parse_timestamp(row.try_get("created_at")?)?,
    })
}

fn step_from_row(row: &SqliteRow) -> Result<StepRecord> {
    let result: Option<String> = row.try_get("result")?;

    Ok(StepRecord {
        task_id: row.try_get("task_id")?,
        step_id: row.try_get("step_id")?,
        status: row.try_get("status")?,
        result: result.as_deref().map(serde_json::from_str).transpose()?,
        error: row.try_get("error")?,
        started_at: parse_opt_timestamp(row.try_get("started_at")?)?,
        completed_at: parse_opt_timestamp(row.try_get("completed_at")?)?,
    })
}
