//! Postgres-backed clickstream store.
//!
//! Sessions land in the single active batch, numbered densely under a row
//! lock on the batch; release freezes the batch and the next session write
//! opens a fresh one.

use async_trait::async_trait;
use chrono::Utc;
use quiver_core::error::{QuiverError, Result};
use quiver_core::traits::ClickstreamStore;
use quiver_core::types::{Batch, ClickstreamSession, RegisterSession, SessionEvent};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Postgres clickstream store.
pub struct PgClickstreamStore {
    pool: PgPool,
    prefix: String,
}

impl PgClickstreamStore {
    pub fn new(pool: PgPool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    fn batches(&self) -> String {
        format!("{}_batches", self.prefix)
    }

    fn sessions(&self) -> String {
        format!("{}_sessions", self.prefix)
    }

    fn events(&self) -> String {
        format!("{}_session_events", self.prefix)
    }

    /// Create the clickstream tables if missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    batch_id TEXT PRIMARY KEY,
                    released BOOL NOT NULL DEFAULT false,
                    release_id TEXT UNIQUE,
                    created_at TIMESTAMPTZ NOT NULL
                )"#,
                self.batches()
            ),
            format!(
                r#"CREATE TABLE IF NOT EXISTS {sessions} (
                    session_id TEXT PRIMARY KEY,
                    batch_id TEXT NOT NULL REFERENCES {batches} (batch_id),
                    session_number BIGINT NOT NULL,
                    search_query TEXT NOT NULL,
                    results JSONB NOT NULL DEFAULT '[]',
                    is_irrelevant BOOL NOT NULL DEFAULT false,
                    user_id TEXT,
                    is_payload_search BOOL NOT NULL DEFAULT false,
                    use_for_improvement BOOL NOT NULL DEFAULT false,
                    improved_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL,
                    UNIQUE (batch_id, session_number)
                )"#,
                sessions = self.sessions(),
                batches = self.batches()
            ),
            format!(
                r#"CREATE TABLE IF NOT EXISTS {events} (
                    event_id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL REFERENCES {sessions} (session_id),
                    object_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL
                )"#,
                events = self.events(),
                sessions = self.sessions()
            ),
        ];
        for sql in statements {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| db_err("creating clickstream schema", e))?;
        }
        Ok(())
    }

    /// The active batch id, locked for this transaction; opens one lazily.
    async fn active_batch(&self, tx: &mut Transaction<'static, Postgres>) -> Result<String> {
        let sql = format!(
            "SELECT batch_id FROM {} WHERE released = false FOR UPDATE",
            self.batches()
        );
        let row = sqlx::query(&sql)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| db_err("locking active batch", e))?;

        if let Some(row) = row {
            return row.try_get("batch_id").map_err(row_err);
        }

        let batch_id = Uuid::new_v4().to_string();
        let sql = format!(
            "INSERT INTO {} (batch_id, released, created_at) VALUES ($1, false, $2)",
            self.batches()
        );
        sqlx::query(&sql)
            .bind(&batch_id)
            .bind(Utc::now())
            .execute(&mut **tx)
            .await
            .map_err(|e| db_err("opening batch", e))?;
        info!(batch_id = %batch_id, "Opened clickstream batch");
        Ok(batch_id)
    }

    async fn attach_events(
        &self,
        sessions: &mut [ClickstreamSession],
        events_limit: Option<usize>,
    ) -> Result<()> {
        if sessions.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = sessions.iter().map(|s| s.session_id.clone()).collect();
        let sql = format!(
            "SELECT event_id, session_id, object_id, event_type, created_at FROM {} \
             WHERE session_id = ANY($1) ORDER BY created_at, event_id",
            self.events()
        );
        let rows = sqlx::query(&sql)
            .bind(&ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("loading session events", e))?;

        let mut by_session: HashMap<String, Vec<SessionEvent>> = HashMap::new();
        for row in &rows {
            let session_id: String = row.try_get("session_id").map_err(row_err)?;
            by_session.entry(session_id).or_default().push(SessionEvent {
                event_id: row.try_get("event_id").map_err(row_err)?,
                object_id: row.try_get("object_id").map_err(row_err)?,
                event_type: row.try_get("event_type").map_err(row_err)?,
                created_at: row.try_get("created_at").map_err(row_err)?,
            });
        }
        for session in sessions {
            let mut events = by_session.remove(&session.session_id).unwrap_or_default();
            if let Some(limit) = events_limit {
                events.truncate(limit);
            }
            session.events = events;
        }
        Ok(())
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
    QuiverError::database(format!("decoding clickstream row: {e}"))
}

fn row_to_session(row: &PgRow) -> Result<ClickstreamSession> {
    let results: serde_json::Value = row.try_get("results").map_err(row_err)?;
    Ok(ClickstreamSession {
        session_id: row.try_get("session_id").map_err(row_err)?,
        batch_id: row.try_get("batch_id").map_err(row_err)?,
        session_number: row.try_get("session_number").map_err(row_err)?,
        search_query: row.try_get("search_query").map_err(row_err)?,
        results: serde_json::from_value(results)?,
        is_irrelevant: row.try_get("is_irrelevant").map_err(row_err)?,
        user_id: row.try_get("user_id").map_err(row_err)?,
        events: Vec::new(),
        is_payload_search: row.try_get("is_payload_search").map_err(row_err)?,
        use_for_improvement: row.try_get("use_for_improvement").map_err(row_err)?,
        created_at: row.try_get("created_at").map_err(row_err)?,
    })
}

#[async_trait]
impl ClickstreamStore for PgClickstreamStore {
    async fn register_session(&self, session: RegisterSession) -> Result<ClickstreamSession> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("opening register transaction", e))?;

        let batch_id = self.active_batch(&mut tx).await?;

        let sql = format!(
            "SELECT COALESCE(MAX(session_number) + 1, 0) AS next FROM {} WHERE batch_id = $1",
            self.sessions()
        );
        let next: i64 = sqlx::query(&sql)
            .bind(&batch_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| db_err("assigning session number", e))?
            .try_get("next")
            .map_err(row_err)?;

        let created_at = Utc::now();
        let sql = format!(
            r#"INSERT INTO {} (session_id, batch_id, session_number, search_query, results,
                is_irrelevant, user_id, is_payload_search, use_for_improvement, created_at)
            VALUES ($1, $2, $3, $4, $5, false, $6, $7, false, $8)"#,
            self.sessions()
        );
        sqlx::query(&sql)
            .bind(&session.session_id)
            .bind(&batch_id)
            .bind(next)
            .bind(&session.search_query)
            .bind(serde_json::to_value(&session.results)?)
            .bind(&session.user_id)
            .bind(session.is_payload_search)
            .bind(created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("registering session", e))?;

        tx.commit()
            .await
            .map_err(|e| db_err("committing session registration", e))?;

        debug!(session_id = %session.session_id, batch_id = %batch_id,
            session_number = next, "Registered session");
        Ok(ClickstreamSession {
            session_id: session.session_id,
            batch_id,
            session_number: next,
            search_query: session.search_query,
            results: session.results,
            is_irrelevant: false,
            user_id: session.user_id,
            events: Vec::new(),
            is_payload_search: session.is_payload_search,
            use_for_improvement: false,
            created_at,
        })
    }

    async fn get_session(&self, session_id: &str) -> Result<ClickstreamSession> {
        let sql = format!("SELECT * FROM {} WHERE session_id = $1", self.sessions());
        let row = sqlx::query(&sql)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("fetching session", e))?
            .ok_or_else(|| QuiverError::not_found("session", session_id))?;

        let mut sessions = vec![row_to_session(&row)?];
        self.attach_events(&mut sessions, None).await?;
        Ok(sessions.remove(0))
    }

    async fn append_events(&self, session_id: &str, events: &[SessionEvent]) -> Result<()> {
        let sql = format!(
            r#"SELECT b.released FROM {sessions} s
            JOIN {batches} b ON b.batch_id = s.batch_id WHERE s.session_id = $1"#,
            sessions = self.sessions(),
            batches = self.batches()
        );
        let row = sqlx::query(&sql)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("checking session batch", e))?
            .ok_or_else(|| QuiverError::not_found("session", session_id))?;

        let released: bool = row.try_get("released").map_err(row_err)?;
        if released {
            return Err(QuiverError::conflict(format!(
                "session {session_id} belongs to a released batch"
            )));
        }

        for event in events {
            let sql = format!(
                r#"INSERT INTO {} (event_id, session_id, object_id, event_type, created_at)
                VALUES ($1, $2, $3, $4, $5) ON CONFLICT (event_id) DO NOTHING"#,
                self.events()
            );
            sqlx::query(&sql)
                .bind(&event.event_id)
                .bind(session_id)
                .bind(&event.object_id)
                .bind(&event.event_type)
                .bind(event.created_at)
                .execute(&self.pool)
                .await
                .map_err(|e| db_err("appending event", e))?;
        }
        Ok(())
    }

    async fn mark_for_improvement(&self, session_id: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET use_for_improvement = true \
             WHERE session_id = $1 AND NOT is_payload_search",
            self.sessions()
        );
        let updated = sqlx::query(&sql)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("marking session for improvement", e))?
            .rows_affected();

        if updated == 0 {
            // Distinguish a missing session from a payload-search one.
            self.get_session(session_id).await?;
            return Err(QuiverError::validation(format!(
                "payload-search session {session_id} cannot be used for improvement"
            )));
        }
        Ok(())
    }

    async fn get_batch_sessions(
        &self,
        batch_id: &str,
        after_number: Option<i64>,
        limit: usize,
        events_limit: Option<usize>,
    ) -> Result<Vec<ClickstreamSession>> {
        let sql = format!(
            r#"SELECT * FROM {} WHERE batch_id = $1
            AND ($2::bigint IS NULL OR session_number > $2)
            ORDER BY session_number LIMIT $3"#,
            self.sessions()
        );
        let rows = sqlx::query(&sql)
            .bind(batch_id)
            .bind(after_number)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("listing batch sessions", e))?;

        let mut sessions: Vec<ClickstreamSession> =
            rows.iter().map(row_to_session).collect::<Result<_>>()?;
        self.attach_events(&mut sessions, events_limit).await?;
        Ok(sessions)
    }

    async fn release_batch(&self, release_id: &str) -> Result<Batch> {
        // Idempotent: the same release id always answers with its batch.
        let sql = format!("SELECT * FROM {} WHERE release_id = $1", self.batches());
        if let Some(row) = sqlx::query(&sql)
            .bind(release_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("looking up release", e))?
        {
            return Ok(Batch {
                batch_id: row.try_get("batch_id").map_err(row_err)?,
                released: true,
                release_id: Some(release_id.to_owned()),
                created_at: row.try_get("created_at").map_err(row_err)?,
            });
        }

        let sql = format!(
            "UPDATE {} SET released = true, release_id = $1 WHERE released = false RETURNING *",
            self.batches()
        );
        let row = sqlx::query(&sql)
            .bind(release_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("releasing batch", e))?
            .ok_or_else(|| QuiverError::not_found("batch", "active"))?;

        let batch = Batch {
            batch_id: row.try_get("batch_id").map_err(row_err)?,
            released: true,
            release_id: Some(release_id.to_owned()),
            created_at: row.try_get("created_at").map_err(row_err)?,
        };
        info!(batch_id = %batch.batch_id, release_id, "Released clickstream batch");
        Ok(batch)
    }

    async fn improvement_candidates(&self, limit: usize) -> Result<Vec<ClickstreamSession>> {
        let sql = format!(
            r#"SELECT s.* FROM {sessions} s
            JOIN {batches} b ON b.batch_id = s.batch_id
            WHERE b.released AND s.use_for_improvement
                AND s.improved_at IS NULL AND NOT s.is_payload_search
            ORDER BY s.created_at LIMIT $1"#,
            sessions = self.sessions(),
            batches = self.batches()
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("listing improvement candidates", e))?;

        let mut sessions: Vec<ClickstreamSession> =
            rows.iter().map(row_to_session).collect::<Result<_>>()?;
        self.attach_events(&mut sessions, None).await?;
        Ok(sessions)
    }

    async fn mark_improved(&self, session_ids: &[String]) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET improved_at = $2 WHERE session_id = ANY($1)",
            self.sessions()
        );
        sqlx::query(&sql)
            .bind(session_ids)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("marking sessions improved", e))?;
        Ok(())
    }
}
