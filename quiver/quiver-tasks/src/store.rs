//! Postgres-backed task store.
//!
//! Every write is a single statement; status changes are atomic compare-sets
//! over the allowed source states, so concurrent workers can never push a
//! task through an illegal transition.

use async_trait::async_trait;
use chrono::Utc;
use quiver_core::error::{QuiverError, Result};
use quiver_core::traits::TaskStore;
use quiver_core::types::{FailedItem, Task, TaskKind, TaskStatus};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;

/// Source states from which `to` may be entered.
pub(crate) fn allowed_sources(to: TaskStatus) -> &'static [&'static str] {
    match to {
        TaskStatus::Pending => &["PENDING"],
        TaskStatus::Processing => &["PENDING"],
        TaskStatus::Done | TaskStatus::Error => &["PROCESSING"],
        TaskStatus::Canceled => &["PENDING", "PROCESSING"],
        TaskStatus::Refused => &["PENDING"],
    }
}

/// Postgres task store.
pub struct PgTaskStore {
    pool: PgPool,
    table: String,
}

impl PgTaskStore {
    pub fn new(pool: PgPool, prefix: impl AsRef<str>) -> Self {
        Self {
            pool,
            table: format!("{}_tasks", prefix.as_ref()),
        }
    }

    /// Create the tasks table if missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        let sql = format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
                task_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                embedding_model_id TEXT,
                broker_id TEXT,
                parent_id TEXT,
                children JSONB NOT NULL DEFAULT '[]',
                failed_items JSONB NOT NULL DEFAULT '[]',
                failed_item_ids JSONB NOT NULL DEFAULT '[]',
                payload JSONB NOT NULL DEFAULT 'null',
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )"#,
            self.table
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("creating tasks table", e))?;

        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {0}_kind_created_idx ON {0} (kind, created_at DESC)",
            self.table
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("creating tasks index", e))?;
        Ok(())
    }

    async fn fetch(&self, task_id: &str) -> Result<Option<Task>> {
        let sql = format!("SELECT * FROM {} WHERE task_id = $1", self.table);
        let row = sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("fetching task", e))?;
        row.as_ref().map(row_to_task).transpose()
    }
}

fn db_err(context: &str, e: sqlx::Error) -> QuiverError {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            QuiverError::unavailable(format!("{context}: {e}"))
        }
        other => QuiverError::database(format!("{context}: {other}")),
    }
}

fn row_err(e: sqlx::Error) -> QuiverError {
    QuiverError::database(format!("decoding task row: {e}"))
}

fn row_to_task(row: &PgRow) -> Result<Task> {
    let kind: String = row.try_get("kind").map_err(row_err)?;
    let status: String = row.try_get("status").map_err(row_err)?;
    let children: serde_json::Value = row.try_get("children").map_err(row_err)?;
    let failed_items: serde_json::Value = row.try_get("failed_items").map_err(row_err)?;
    let failed_item_ids: serde_json::Value = row.try_get("failed_item_ids").map_err(row_err)?;

    Ok(Task {
        task_id: row.try_get("task_id").map_err(row_err)?,
        kind: TaskKind::parse(&kind)?,
        status: TaskStatus::parse(&status)?,
        embedding_model_id: row.try_get("embedding_model_id").map_err(row_err)?,
        broker_id: row.try_get("broker_id").map_err(row_err)?,
        parent_id: row.try_get("parent_id").map_err(row_err)?,
        children: serde_json::from_value(children)?,
        failed_items: serde_json::from_value(failed_items)?,
        failed_item_ids: serde_json::from_value(failed_item_ids)?,
        payload: row.try_get("payload").map_err(row_err)?,
        created_at: row.try_get("created_at").map_err(row_err)?,
        updated_at: row.try_get("updated_at").map_err(row_err)?,
    })
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create(&self, task: Task) -> Result<Task> {
        let sql = format!(
            r#"INSERT INTO {} (task_id, kind, status, embedding_model_id, broker_id,
                parent_id, children, failed_items, failed_item_ids, payload,
                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (task_id) DO NOTHING"#,
            self.table
        );
        let inserted = sqlx::query(&sql)
            .bind(&task.task_id)
            .bind(task.kind.as_str())
            .bind(task.status.as_str())
            .bind(&task.embedding_model_id)
            .bind(&task.broker_id)
            .bind(&task.parent_id)
            .bind(serde_json::to_value(&task.children)?)
            .bind(serde_json::to_value(&task.failed_items)?)
            .bind(serde_json::to_value(&task.failed_item_ids)?)
            .bind(&task.payload)
            .bind(task.created_at)
            .bind(task.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("creating task", e))?
            .rows_affected();

        if inserted == 0 {
            debug!(task_id = %task.task_id, "Idempotent create returned existing task");
        }
        self.fetch(&task.task_id)
            .await?
            .ok_or_else(|| QuiverError::not_found("task", &task.task_id))
    }

    async fn get(&self, task_id: &str) -> Result<Task> {
        self.fetch(task_id)
            .await?
            .ok_or_else(|| QuiverError::not_found("task", task_id))
    }

    async fn list(
        &self,
        kind: TaskKind,
        status: Option<TaskStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let sql = format!(
            r#"SELECT * FROM {} WHERE kind = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC, task_id DESC OFFSET $3 LIMIT $4"#,
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(status.map(|s| s.as_str()))
            .bind(offset as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("listing tasks", e))?;
        rows.iter().map(row_to_task).collect()
    }

    async fn update_status(&self, task_id: &str, new_status: TaskStatus) -> Result<Task> {
        let sources: Vec<String> = allowed_sources(new_status)
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        let sql = format!(
            r#"UPDATE {} SET status = $2, updated_at = $3
            WHERE task_id = $1 AND status = ANY($4) RETURNING *"#,
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(task_id)
            .bind(new_status.as_str())
            .bind(Utc::now())
            .bind(&sources)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("updating task status", e))?;

        match row {
            Some(row) => row_to_task(&row),
            None => {
                let current = self.get(task_id).await?;
                Err(QuiverError::invalid_transition(
                    current.status.as_str(),
                    new_status.as_str(),
                ))
            }
        }
    }

    async fn set_broker(&self, task_id: &str, broker_id: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET broker_id = $2, updated_at = $3 WHERE task_id = $1",
            self.table
        );
        let updated = sqlx::query(&sql)
            .bind(task_id)
            .bind(broker_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("recording broker id", e))?
            .rows_affected();
        if updated == 0 {
            return Err(QuiverError::not_found("task", task_id));
        }
        Ok(())
    }

    async fn append_failures(&self, task_id: &str, items: &[FailedItem]) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET failed_items = failed_items || $2, updated_at = $3 WHERE task_id = $1",
            self.table
        );
        let updated = sqlx::query(&sql)
            .bind(task_id)
            .bind(serde_json::to_value(items)?)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("appending failed items", e))?
            .rows_affected();
        if updated == 0 {
            return Err(QuiverError::not_found("task", task_id));
        }
        Ok(())
    }

    async fn append_failed_ids(&self, task_id: &str, ids: &[String]) -> Result<()> {
        let sql = format!(
            r#"UPDATE {} SET failed_item_ids = failed_item_ids || $2, updated_at = $3
            WHERE task_id = $1"#,
            self.table
        );
        let updated = sqlx::query(&sql)
            .bind(task_id)
            .bind(serde_json::to_value(ids)?)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("appending failed ids", e))?
            .rows_affected();
        if updated == 0 {
            return Err(QuiverError::not_found("task", task_id));
        }
        Ok(())
    }

    async fn link_child(&self, parent_id: &str, child_id: &str) -> Result<()> {
        let sql = format!(
            r#"UPDATE {} SET children = children || to_jsonb(ARRAY[$2::text]), updated_at = $3
            WHERE task_id = $1 AND NOT children @> to_jsonb(ARRAY[$2::text])"#,
            self.table
        );
        sqlx::query(&sql)
            .bind(parent_id)
            .bind(child_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("linking child task", e))?;
        Ok(())
    }

    async fn restart(&self, task_id: &str) -> Result<Task> {
        let sql = format!(
            r#"UPDATE {} SET status = 'PENDING', failed_items = '[]',
                failed_item_ids = '[]', broker_id = NULL, updated_at = $2
            WHERE task_id = $1 AND status = ANY($3) RETURNING *"#,
            self.table
        );
        let restartable: Vec<String> = ["PENDING", "ERROR", "CANCELED"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        let row = sqlx::query(&sql)
            .bind(task_id)
            .bind(Utc::now())
            .bind(&restartable)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("restarting task", e))?;

        match row {
            Some(row) => row_to_task(&row),
            None => {
                let current = self.get(task_id).await?;
                Err(QuiverError::invalid_transition(
                    current.status.as_str(),
                    TaskStatus::Pending.as_str(),
                ))
            }
        }
    }
}
