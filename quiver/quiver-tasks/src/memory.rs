//! In-memory task store for tests and local development.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use quiver_core::error::{QuiverError, Result};
use quiver_core::traits::TaskStore;
use quiver_core::types::{FailedItem, Task, TaskKind, TaskStatus};
use std::collections::HashMap;

/// In-memory task store with the same transition semantics as the Postgres
/// implementation.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<String, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_task<T>(&self, task_id: &str, f: impl FnOnce(&mut Task) -> Result<T>) -> Result<T> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| QuiverError::not_found("task", task_id))?;
        let result = f(task)?;
        task.updated_at = Utc::now();
        Ok(result)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, task: Task) -> Result<Task> {
        let mut tasks = self.tasks.lock();
        Ok(tasks
            .entry(task.task_id.clone())
            .or_insert(task)
            .clone())
    }

    async fn get(&self, task_id: &str) -> Result<Task> {
        self.tasks
            .lock()
            .get(task_id)
            .cloned()
            .ok_or_else(|| QuiverError::not_found("task", task_id))
    }

    async fn list(
        &self,
        kind: TaskKind,
        status: Option<TaskStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let tasks = self.tasks.lock();
        let mut matching: Vec<Task> = tasks
            .values()
            .filter(|t| t.kind == kind && status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.task_id.cmp(&a.task_id))
        });
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn update_status(&self, task_id: &str, new_status: TaskStatus) -> Result<Task> {
        self.with_task(task_id, |task| {
            if !task.status.can_transition(new_status) {
                return Err(QuiverError::invalid_transition(
                    task.status.as_str(),
                    new_status.as_str(),
                ));
            }
            task.status = new_status;
            Ok(task.clone())
        })
    }

    async fn set_broker(&self, task_id: &str, broker_id: &str) -> Result<()> {
        self.with_task(task_id, |task| {
            task.broker_id = Some(broker_id.to_owned());
            Ok(())
        })
    }

    async fn append_failures(&self, task_id: &str, items: &[FailedItem]) -> Result<()> {
        self.with_task(task_id, |task| {
            task.failed_items.extend_from_slice(items);
            Ok(())
        })
    }

    async fn append_failed_ids(&self, task_id: &str, ids: &[String]) -> Result<()> {
        self.with_task(task_id, |task| {
            task.failed_item_ids.extend_from_slice(ids);
            Ok(())
        })
    }

    async fn link_child(&self, parent_id: &str, child_id: &str) -> Result<()> {
        self.with_task(parent_id, |task| {
            if !task.children.iter().any(|c| c == child_id) {
                task.children.push(child_id.to_owned());
            }
            Ok(())
        })
    }

    async fn restart(&self, task_id: &str) -> Result<Task> {
        self.with_task(task_id, |task| {
            if !matches!(
                task.status,
                TaskStatus::Pending | TaskStatus::Error | TaskStatus::Canceled
            ) {
                return Err(QuiverError::invalid_transition(
                    task.status.as_str(),
                    TaskStatus::Pending.as_str(),
                ));
            }
            task.status = TaskStatus::Pending;
            task.failed_items.clear();
            task.failed_item_ids.clear();
            task.broker_id = None;
            Ok(task.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_is_idempotent() {
        let store = InMemoryTaskStore::new();
        let task = Task::new(TaskKind::Upsert, json!({"items": []}), Some("t1".into()));
        let first = store.create(task.clone()).await.unwrap();
        let second = store
            .create(Task::new(TaskKind::Upsert, json!({"other": 1}), Some("t1".into())))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.payload, json!({"items": []}));
    }

    #[tokio::test]
    async fn illegal_transition_fails() {
        let store = InMemoryTaskStore::new();
        let task = store
            .create(Task::new(TaskKind::Delete, json!(null), None))
            .await
            .unwrap();

        let err = store
            .update_status(&task.task_id, TaskStatus::Done)
            .await
            .unwrap_err();
        assert!(matches!(err, QuiverError::InvalidStateTransition { .. }));

        store
            .update_status(&task.task_id, TaskStatus::Processing)
            .await
            .unwrap();
        store
            .update_status(&task.task_id, TaskStatus::Done)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn restart_resets_failures() {
        let store = InMemoryTaskStore::new();
        let task = store
            .create(Task::new(TaskKind::Upsert, json!(null), None))
            .await
            .unwrap();
        store
            .update_status(&task.task_id, TaskStatus::Processing)
            .await
            .unwrap();
        store
            .append_failures(&task.task_id, &[FailedItem::new("o1", "boom")])
            .await
            .unwrap();
        store
            .update_status(&task.task_id, TaskStatus::Error)
            .await
            .unwrap();

        let restarted = store.restart(&task.task_id).await.unwrap();
        assert_eq!(restarted.status, TaskStatus::Pending);
        assert!(restarted.failed_items.is_empty());
        assert!(restarted.broker_id.is_none());
    }

    #[tokio::test]
    async fn restart_of_done_task_is_refused() {
        let store = InMemoryTaskStore::new();
        let task = store
            .create(Task::new(TaskKind::Upsert, json!(null), None))
            .await
            .unwrap();
        store
            .update_status(&task.task_id, TaskStatus::Processing)
            .await
            .unwrap();
        store
            .update_status(&task.task_id, TaskStatus::Done)
            .await
            .unwrap();
        assert!(store.restart(&task.task_id).await.is_err());
    }

    #[tokio::test]
    async fn list_orders_by_created_desc() {
        let store = InMemoryTaskStore::new();
        for i in 0..3 {
            let mut task = Task::new(TaskKind::Reindex, json!(null), Some(format!("t{i}")));
            task.created_at = Utc::now() + chrono::Duration::seconds(i);
            store.create(task).await.unwrap();
        }
        let listed = store
            .list(TaskKind::Reindex, None, 0, 10)
            .await
            .unwrap();
        let ids: Vec<_> = listed.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t2", "t1", "t0"]);
    }

    #[tokio::test]
    async fn children_link_once() {
        let store = InMemoryTaskStore::new();
        let parent = store
            .create(Task::new(TaskKind::Reindex, json!(null), None))
            .await
            .unwrap();
        store.link_child(&parent.task_id, "c1").await.unwrap();
        store.link_child(&parent.task_id, "c1").await.unwrap();
        let parent = store.get(&parent.task_id).await.unwrap();
        assert_eq!(parent.children, vec!["c1"]);
    }
}
