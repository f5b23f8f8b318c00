//! In-memory clickstream store for tests and local development.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use quiver_core::error::{QuiverError, Result};
use quiver_core::traits::ClickstreamStore;
use quiver_core::types::{Batch, ClickstreamSession, RegisterSession, SessionEvent};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct State {
    batches: HashMap<String, Batch>,
    active_batch: Option<String>,
    sessions: HashMap<String, ClickstreamSession>,
    improved: HashMap<String, bool>,
}

impl State {
    fn active_batch_id(&mut self) -> String {
        if let Some(id) = &self.active_batch {
            return id.clone();
        }
        let batch = Batch {
            batch_id: Uuid::new_v4().to_string(),
            released: false,
            release_id: None,
            created_at: Utc::now(),
        };
        let id = batch.batch_id.clone();
        self.batches.insert(id.clone(), batch);
        self.active_batch = Some(id.clone());
        id
    }

    fn next_session_number(&self, batch_id: &str) -> i64 {
        self.sessions
            .values()
            .filter(|s| s.batch_id == batch_id)
            .map(|s| s.session_number + 1)
            .max()
            .unwrap_or(0)
    }
}

/// In-memory clickstream store with the Postgres store's semantics.
#[derive(Default)]
pub struct InMemoryClickstreamStore {
    state: Mutex<State>,
}

impl InMemoryClickstreamStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClickstreamStore for InMemoryClickstreamStore {
    async fn register_session(&self, session: RegisterSession) -> Result<ClickstreamSession> {
        let mut state = self.state.lock();
        let batch_id = state.active_batch_id();
        let session_number = state.next_session_number(&batch_id);

        let stored = ClickstreamSession {
            session_id: session.session_id.clone(),
            batch_id,
            session_number,
            search_query: session.search_query,
            results: session.results,
            is_irrelevant: false,
            user_id: session.user_id,
            events: Vec::new(),
            is_payload_search: session.is_payload_search,
            use_for_improvement: false,
            created_at: Utc::now(),
        };
        state
            .sessions
            .insert(session.session_id, stored.clone());
        Ok(stored)
    }

    async fn get_session(&self, session_id: &str) -> Result<ClickstreamSession> {
        self.state
            .lock()
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| QuiverError::not_found("session", session_id))
    }

    async fn append_events(&self, session_id: &str, events: &[SessionEvent]) -> Result<()> {
        let mut state = self.state.lock();
        let batch_id = state
            .sessions
            .get(session_id)
            .map(|s| s.batch_id.clone())
            .ok_or_else(|| QuiverError::not_found("session", session_id))?;

        let released = state
            .batches
            .get(&batch_id)
            .is_some_and(|batch| batch.released);
        if released {
            return Err(QuiverError::conflict(format!(
                "session {session_id} belongs to a released batch"
            )));
        }

        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| QuiverError::not_found("session", session_id))?;
        for event in events {
            if !session.events.iter().any(|e| e.event_id == event.event_id) {
                session.events.push(event.clone());
            }
        }
        Ok(())
    }

    async fn mark_for_improvement(&self, session_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| QuiverError::not_found("session", session_id))?;
        if session.is_payload_search {
            return Err(QuiverError::validation(format!(
                "payload-search session {session_id} cannot be used for improvement"
            )));
        }
        session.use_for_improvement = true;
        Ok(())
    }

    async fn get_batch_sessions(
        &self,
        batch_id: &str,
        after_number: Option<i64>,
        limit: usize,
        events_limit: Option<usize>,
    ) -> Result<Vec<ClickstreamSession>> {
        let state = self.state.lock();
        let mut sessions: Vec<ClickstreamSession> = state
            .sessions
            .values()
            .filter(|s| s.batch_id == batch_id)
            .filter(|s| after_number.is_none_or(|after| s.session_number > after))
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.session_number);
        sessions.truncate(limit);
        if let Some(limit) = events_limit {
            for session in &mut sessions {
                session.events.truncate(limit);
            }
        }
        Ok(sessions)
    }

    async fn release_batch(&self, release_id: &str) -> Result<Batch> {
        let mut state = self.state.lock();
        if let Some(batch) = state
            .batches
            .values()
            .find(|b| b.release_id.as_deref() == Some(release_id))
        {
            return Ok(batch.clone());
        }

        let active = state
            .active_batch
            .take()
            .ok_or_else(|| QuiverError::not_found("batch", "active"))?;
        let batch = state
            .batches
            .get_mut(&active)
            .ok_or_else(|| QuiverError::not_found("batch", &active))?;
        batch.released = true;
        batch.release_id = Some(release_id.to_owned());
        Ok(batch.clone())
    }

    async fn improvement_candidates(&self, limit: usize) -> Result<Vec<ClickstreamSession>> {
        let state = self.state.lock();
        let mut candidates: Vec<ClickstreamSession> = state
            .sessions
            .values()
            .filter(|s| {
                s.use_for_improvement
                    && !s.is_payload_search
                    && !state.improved.contains_key(&s.session_id)
                    && state
                        .batches
                        .get(&s.batch_id)
                        .is_some_and(|batch| batch.released)
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn mark_improved(&self, session_ids: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        for id in session_ids {
            state.improved.insert(id.clone(), true);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(session_id: &str) -> RegisterSession {
        RegisterSession {
            session_id: session_id.to_owned(),
            search_query: "red shoes".to_owned(),
            results: Vec::new(),
            user_id: None,
            is_payload_search: false,
        }
    }

    #[tokio::test]
    async fn session_numbers_are_dense_per_batch() {
        let store = InMemoryClickstreamStore::new();
        for i in 0..3 {
            let session = store.register_session(register(&format!("s{i}"))).await.unwrap();
            assert_eq!(session.session_number, i);
        }

        store.release_batch("r1").await.unwrap();

        // A new batch starts at zero again.
        let next = store.register_session(register("s3")).await.unwrap();
        assert_eq!(next.session_number, 0);
    }

    #[tokio::test]
    async fn released_sessions_surface_in_order() {
        let store = InMemoryClickstreamStore::new();
        let first = store.register_session(register("s0")).await.unwrap();
        store.register_session(register("s1")).await.unwrap();
        store.release_batch("r1").await.unwrap();

        let sessions = store
            .get_batch_sessions(&first.batch_id, None, 10, None)
            .await
            .unwrap();
        let numbers: Vec<i64> = sessions.iter().map(|s| s.session_number).collect();
        assert_eq!(numbers, vec![0, 1]);

        let after = store
            .get_batch_sessions(&first.batch_id, Some(0), 10, None)
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].session_id, "s1");
    }

    #[tokio::test]
    async fn events_dedupe_and_freeze_on_release() {
        let store = InMemoryClickstreamStore::new();
        store.register_session(register("s0")).await.unwrap();

        let event = SessionEvent::click("e1", "p");
        store.append_events("s0", &[event.clone()]).await.unwrap();
        store.append_events("s0", &[event]).await.unwrap();
        assert_eq!(store.get_session("s0").await.unwrap().events.len(), 1);

        store.release_batch("r1").await.unwrap();
        let err = store
            .append_events("s0", &[SessionEvent::click("e2", "p")])
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn release_is_idempotent_on_release_id() {
        let store = InMemoryClickstreamStore::new();
        let session = store.register_session(register("s0")).await.unwrap();

        let first = store.release_batch("r1").await.unwrap();
        let second = store.release_batch("r1").await.unwrap();
        assert_eq!(first.batch_id, second.batch_id);
        assert_eq!(first.batch_id, session.batch_id);
    }

    #[tokio::test]
    async fn payload_search_sessions_cannot_improve() {
        let store = InMemoryClickstreamStore::new();
        let mut session = register("s0");
        session.is_payload_search = true;
        store.register_session(session).await.unwrap();

        let err = store.mark_for_improvement("s0").await.unwrap_err();
        assert!(matches!(err, QuiverError::Validation(_)));
    }

    #[tokio::test]
    async fn improvement_candidates_require_release_and_flag() {
        let store = InMemoryClickstreamStore::new();
        store.register_session(register("s0")).await.unwrap();
        store.mark_for_improvement("s0").await.unwrap();

        // Not yet released.
        assert!(store.improvement_candidates(10).await.unwrap().is_empty());

        store.release_batch("r1").await.unwrap();
        let candidates = store.improvement_candidates(10).await.unwrap();
        assert_eq!(candidates.len(), 1);

        store.mark_improved(&["s0".into()]).await.unwrap();
        assert!(store.improvement_candidates(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn events_limit_caps_per_session() {
        let store = InMemoryClickstreamStore::new();
        let session = store.register_session(register("s0")).await.unwrap();
        store
            .append_events(
                "s0",
                &[
                    SessionEvent::click("e1", "a"),
                    SessionEvent::click("e2", "b"),
                    SessionEvent::click("e3", "c"),
                ],
            )
            .await
            .unwrap();

        let sessions = store
            .get_batch_sessions(&session.batch_id, None, 10, Some(2))
            .await
            .unwrap();
        assert_eq!(sessions[0].events.len(), 2);
    }
}
