//! Queue dispatcher: named queues, actor registry, retry and cancellation.
//!
//! One queue per worker kind; an [`Actor`] is the registered handler of one
//! queue. Delivery is at-least-once inside a process; tasks left Pending by a
//! crashed worker are re-sent from the task store at boot.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use quiver_core::config::DispatcherConfig;
use quiver_core::error::{QuiverError, Result};
use quiver_core::traits::TaskStore;
use quiver_core::types::{FailedItem, Task, TaskKind, TaskStatus};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::retry::RetryPolicy;

/// One queued delivery.
#[derive(Debug, Clone)]
struct Delivery {
    task_id: String,
    broker_id: String,
}

/// Execution context handed to an actor for one delivery.
pub struct ActorContext {
    pub cancellation: CancellationToken,
    pub attempt: u32,
}

impl ActorContext {
    /// Cancellation checkpoint; call between batches and before mutations.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            Err(QuiverError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// A registered queue handler.
#[async_trait]
pub trait Actor: Send + Sync {
    /// Name of the queue this actor drains.
    fn queue(&self) -> &'static str;

    /// Runs once after the queue is live; workers warm their model
    /// repositories here.
    async fn on_boot(&self) -> Result<()> {
        Ok(())
    }

    /// Process one task. Returning [`QuiverError::Canceled`] marks the task
    /// canceled; retryable errors are retried with backoff.
    async fn handle(&self, task: &Task, ctx: &ActorContext) -> Result<()>;
}

/// Process-local queue dispatcher.
pub struct Dispatcher {
    tasks: Arc<dyn TaskStore>,
    policy: RetryPolicy,
    queue_capacity: usize,
    queues: DashMap<&'static str, mpsc::Sender<Delivery>>,
    aborts: Arc<DashMap<String, CancellationToken>>,
    root: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(config: &DispatcherConfig, tasks: Arc<dyn TaskStore>) -> Self {
        Self {
            tasks,
            policy: RetryPolicy::from_config(config),
            queue_capacity: config.queue_capacity,
            queues: DashMap::new(),
            aborts: Arc::new(DashMap::new()),
            root: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Register an actor and start its worker loop.
    pub fn register(&self, actor: Arc<dyn Actor>) {
        let queue = actor.queue();
        let (tx, mut rx) = mpsc::channel::<Delivery>(self.queue_capacity);
        if self.queues.insert(queue, tx).is_some() {
            warn!(queue, "Actor re-registered, replacing previous queue");
        }

        let tasks = Arc::clone(&self.tasks);
        let aborts = Arc::clone(&self.aborts);
        let policy = self.policy;
        let root = self.root.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = actor.on_boot().await {
                error!(queue, error = %e, "Actor on-boot hook failed");
            }
            info!(queue, "Queue worker started");

            loop {
                let delivery = tokio::select! {
                    _ = root.cancelled() => break,
                    delivery = rx.recv() => match delivery {
                        Some(delivery) => delivery,
                        None => break,
                    },
                };
                process_delivery(&*actor, &tasks, &aborts, policy, &root, delivery).await;
            }
            info!(queue, "Queue worker stopped");
        });
        self.workers.lock().push(handle);
    }

    /// Enqueue a task, returning the fresh broker id recorded on it.
    pub async fn send(&self, queue: &str, task_id: &str) -> Result<String> {
        let sender = self
            .queues
            .get(queue)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                QuiverError::unavailable(format!("no actor registered for queue {queue}"))
            })?;

        let broker_id = Uuid::new_v4().to_string();
        self.aborts
            .insert(broker_id.clone(), self.root.child_token());
        self.tasks.set_broker(task_id, &broker_id).await?;

        sender
            .send(Delivery {
                task_id: task_id.to_owned(),
                broker_id: broker_id.clone(),
            })
            .await
            .map_err(|_| QuiverError::unavailable(format!("queue {queue} is closed")))?;

        debug!(queue, task_id, broker_id = %broker_id, "Task sent");
        Ok(broker_id)
    }

    /// Send a task on its kind's queue.
    pub async fn send_task(&self, task: &Task) -> Result<String> {
        self.send(task.kind.queue(), &task.task_id).await
    }

    /// Send a task only if it is Pending and has never been sent. This is
    /// what makes idempotent create produce at most one queue send.
    pub async fn ensure_sent(&self, task: &Task) -> Result<Option<String>> {
        if task.status != TaskStatus::Pending || task.broker_id.is_some() {
            return Ok(None);
        }
        self.send_task(task).await.map(Some)
    }

    /// Trip the cancellation signal of one delivery.
    pub fn abort(&self, broker_id: &str) {
        if let Some(token) = self.aborts.get(broker_id) {
            info!(broker_id, "Abort signal raised");
            token.cancel();
        } else {
            debug!(broker_id, "Abort for unknown broker id ignored");
        }
    }

    /// Cancel a task: flip Pending tasks directly, signal in-flight ones.
    pub async fn cancel(&self, task_id: &str) -> Result<Task> {
        let task = self.tasks.get(task_id).await?;
        if let Some(broker_id) = &task.broker_id {
            self.abort(broker_id);
        }
        match task.status {
            TaskStatus::Pending => self.tasks.update_status(task_id, TaskStatus::Canceled).await,
            _ => Ok(task),
        }
    }

    /// Re-send every Pending task of the registered queues; the boot-time
    /// redelivery that makes delivery at-least-once across restarts.
    pub async fn resend_pending(&self) -> Result<usize> {
        let kinds = [
            TaskKind::Upsert,
            TaskKind::Delete,
            TaskKind::Reindex,
            TaskKind::FineTune,
            TaskKind::Deploy,
            TaskKind::Undeploy,
            TaskKind::Improve,
        ];

        let mut sent = 0;
        for kind in kinds {
            if !self.queues.contains_key(kind.queue()) {
                continue;
            }
            let pending = self
                .tasks
                .list(kind, Some(TaskStatus::Pending), 0, 10_000)
                .await?;
            for task in pending {
                self.send_task(&task).await?;
                sent += 1;
            }
        }
        if sent > 0 {
            info!(sent, "Re-sent pending tasks");
        }
        Ok(sent)
    }

    /// Stop every worker loop and signal all in-flight deliveries.
    pub fn shutdown(&self) {
        self.root.cancel();
        self.queues.clear();
    }
}

async fn process_delivery(
    actor: &dyn Actor,
    tasks: &Arc<dyn TaskStore>,
    aborts: &DashMap<String, CancellationToken>,
    policy: RetryPolicy,
    root: &CancellationToken,
    delivery: Delivery,
) {
    let token = aborts
        .get(&delivery.broker_id)
        .map(|entry| entry.value().clone())
        .unwrap_or_else(|| root.child_token());

    let result = run_delivery(actor, tasks, policy, &token, &delivery).await;
    if let Err(e) = result {
        error!(task_id = %delivery.task_id, error = %e, "Delivery processing failed");
    }
    aborts.remove(&delivery.broker_id);
}

async fn run_delivery(
    actor: &dyn Actor,
    tasks: &Arc<dyn TaskStore>,
    policy: RetryPolicy,
    token: &CancellationToken,
    delivery: &Delivery,
) -> Result<()> {
    // A task canceled while queued never enters Processing.
    let task = match tasks
        .update_status(&delivery.task_id, TaskStatus::Processing)
        .await
    {
        Ok(task) => task,
        Err(QuiverError::InvalidStateTransition { from, .. }) => {
            debug!(task_id = %delivery.task_id, from, "Skipping delivery of settled task");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let mut attempt = 1u32;
    loop {
        if token.is_cancelled() {
            tasks
                .update_status(&delivery.task_id, TaskStatus::Canceled)
                .await?;
            return Ok(());
        }

        let ctx = ActorContext {
            cancellation: token.clone(),
            attempt,
        };

        match actor.handle(&task, &ctx).await {
            Ok(()) => {
                tasks
                    .update_status(&delivery.task_id, TaskStatus::Done)
                    .await?;
                return Ok(());
            }
            Err(QuiverError::Canceled) => {
                tasks
                    .update_status(&delivery.task_id, TaskStatus::Canceled)
                    .await?;
                return Ok(());
            }
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(task_id = %delivery.task_id, attempt, error = %e,
                    delay_ms = delay.as_millis() as u64, "Retrying after transient error");
                tokio::select! {
                    _ = token.cancelled() => {
                        tasks
                            .update_status(&delivery.task_id, TaskStatus::Canceled)
                            .await?;
                        return Ok(());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => {
                error!(task_id = %delivery.task_id, attempt, error = %e, "Task failed");
                tasks
                    .append_failures(
                        &delivery.task_id,
                        &[FailedItem::new("<task>", e.to_string())],
                    )
                    .await?;
                tasks
                    .update_status(&delivery.task_id, TaskStatus::Error)
                    .await?;
                return Ok(());
            }
        }
    }
}
