//! In-process task queues with at-least-once delivery.
//!
//! Tasks are serialised when enqueued and deserialised on delivery, so a handler only ever sees
//! what a broker would hand it. A delivery that fails with a retryable error is enqueued again
//! after an exponential backoff; once the attempt budget is spent the task is dead-lettered.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::IngestError;
use crate::metrics::{DEAD_LETTERS, TASKS};
use crate::models::UploadId;

/// Logical queue of a task
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QueueName {
    FileProcessing,
    ChunkProcessing,
    CacheUpdates,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [
        QueueName::FileProcessing,
        QueueName::ChunkProcessing,
        QueueName::CacheUpdates,
    ];
}

/// Payload of a task
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    /// Split an upload and enqueue its chunk tasks
    ProcessUpload { upload_id: UploadId },
    /// Process and merge one chunk
    ProcessChunk { upload_id: UploadId, chunk_index: u32 },
    /// Publish the statistics of cities touched by an upload
    UpdateCache {
        upload_id: Option<UploadId>,
        cities: BTreeSet<String>,
    },
    /// Rebuild the statistics of every city
    RefreshAllCaches,
}

impl Task {
    pub fn queue(&self) -> QueueName {
        match self {
            Task::ProcessUpload { .. } => QueueName::FileProcessing,
            Task::ProcessChunk { .. } => QueueName::ChunkProcessing,
            Task::UpdateCache { .. } | Task::RefreshAllCaches => QueueName::CacheUpdates,
        }
    }

    /// Stable identity of the task's effect; redeliveries of a task share it.
    pub fn idempotency_key(&self) -> String {
        match self {
            Task::ProcessUpload { upload_id } => format!("upload:{upload_id}"),
            Task::ProcessChunk {
                upload_id,
                chunk_index,
            } => format!("chunk:{upload_id}:{chunk_index}"),
            Task::UpdateCache { upload_id, cities } => {
                let cities = cities.iter().cloned().collect::<Vec<_>>().join(",");
                match upload_id {
                    Some(upload_id) => format!("cache:{upload_id}:{cities}"),
                    None => format!("cache:{cities}"),
                }
            }
            Task::RefreshAllCaches => "cache:*".to_string(),
        }
    }
}

/// Executes delivered tasks
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Handle one delivery of a task. `attempt` starts at 1.
    async fn handle(&self, task: &Task, attempt: u32) -> Result<(), IngestError>;

    /// Called once when a task is abandoned.
    async fn dead_letter(&self, task: &Task, error: &IngestError);
}

/// Redelivery budget and backoff
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    /// Delay before redelivering a task whose `attempt` failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug)]
struct Delivery {
    payload: String,
    attempt: u32,
}

struct Shared {
    senders: HashMap<QueueName, mpsc::UnboundedSender<Delivery>>,
    policy: RetryPolicy,
    shutdown: watch::Sender<bool>,
    /// Tasks enqueued and not yet finished, including those waiting for a retry
    outstanding: AtomicUsize,
    idle: Notify,
}

impl Shared {
    fn finish(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Named queues served by pools of workers
#[derive(Clone)]
pub struct TaskQueue {
    shared: Arc<Shared>,
    workers: HashMap<QueueName, usize>,
    receivers: Arc<Mutex<HashMap<QueueName, mpsc::UnboundedReceiver<Delivery>>>>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskQueue {
    /// Create the queues. No task is delivered until [TaskQueue::start] is called.
    pub fn new(policy: RetryPolicy, workers: HashMap<QueueName, usize>) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for queue in QueueName::ALL {
            let (sender, receiver) = mpsc::unbounded_channel();
            senders.insert(queue, sender);
            receivers.insert(queue, receiver);
        }
        let (shutdown, _) = watch::channel(false);
        TaskQueue {
            shared: Arc::new(Shared {
                senders,
                policy,
                shutdown,
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
            workers,
            receivers: Arc::new(Mutex::new(receivers)),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.shared.policy
    }

    /// Enqueue a task for its first delivery.
    pub fn enqueue(&self, task: &Task) -> Result<(), IngestError> {
        let queue = task.queue();
        if *self.shared.shutdown.borrow() {
            return Err(IngestError::QueueClosed(queue));
        }
        let delivery = Delivery {
            payload: serde_json::to_string(task)?,
            attempt: 1,
        };
        let sender = self
            .shared
            .senders
            .get(&queue)
            .ok_or(IngestError::QueueClosed(queue))?;
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        if sender.send(delivery).is_err() {
            self.shared.finish();
            return Err(IngestError::QueueClosed(queue));
        }
        tracing::debug!("Enqueued {} on {}", task.idempotency_key(), queue);
        Ok(())
    }

    /// Start the worker pools. Calling this more than once has no effect.
    pub fn start(&self, handler: Arc<dyn TaskHandler>) {
        let receivers = std::mem::take(
            &mut *self
                .receivers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (queue, receiver) in receivers {
            let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
            let workers = self.workers.get(&queue).copied().unwrap_or(1).max(1);
            tracing::info!("Starting {} workers on {}", workers, queue);
            for _ in 0..workers {
                handles.push(tokio::spawn(worker(
                    queue,
                    self.shared.clone(),
                    receiver.clone(),
                    handler.clone(),
                )));
            }
        }
    }

    /// Wait until every enqueued task has finished or been dead-lettered.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Close the queues and wait for the workers to finish their current deliveries.
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        let handles = std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!("Task worker failed: {}", err);
            }
        }
        tracing::info!("Task queues shut down");
    }
}

async fn worker(
    queue: QueueName,
    shared: Arc<Shared>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    handler: Arc<dyn TaskHandler>,
) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let delivery = tokio::select! {
            _ = shutdown.changed() => break,
            delivery = async { receiver.lock().await.recv().await } => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        deliver(queue, &shared, handler.as_ref(), delivery).await;
    }
}

async fn deliver(queue: QueueName, shared: &Arc<Shared>, handler: &dyn TaskHandler, delivery: Delivery) {
    let task: Task = match serde_json::from_str(&delivery.payload) {
        Ok(task) => task,
        Err(err) => {
            tracing::error!("Dropping undecodable task on {}: {}", queue, err);
            DEAD_LETTERS.with_label_values(&[&queue.to_string()]).inc();
            shared.finish();
            return;
        }
    };
    let attempt = delivery.attempt;
    let span = tracing::info_span!("task", %queue, key = %task.idempotency_key(), attempt);
    let result = handler.handle(&task, attempt).instrument(span).await;
    let queue_label = queue.to_string();
    match result {
        Ok(()) => {
            TASKS.with_label_values(&[&queue_label, "succeeded"]).inc();
            shared.finish();
        }
        Err(err) if err.is_retryable() && attempt < shared.policy.max_attempts => {
            TASKS.with_label_values(&[&queue_label, "retried"]).inc();
            let delay = shared.policy.delay(attempt);
            tracing::info!(
                "Task {} attempt {} failed, retrying in {:?}: {}",
                task.idempotency_key(),
                attempt,
                delay,
                err
            );
            let shared = shared.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let retry = Delivery {
                    payload: delivery.payload,
                    attempt: attempt + 1,
                };
                let sent = shared
                    .senders
                    .get(&queue)
                    .map_or(false, |sender| sender.send(retry).is_ok());
                if !sent {
                    shared.finish();
                }
            });
        }
        Err(err) => {
            TASKS.with_label_values(&[&queue_label, "failed"]).inc();
            DEAD_LETTERS.with_label_values(&[&queue_label]).inc();
            tracing::error!(
                "Task {} dead-lettered after {} attempts: {}",
                task.idempotency_key(),
                attempt,
                err
            );
            handler.dead_letter(&task, &err).await;
            shared.finish();
        }
    }
}
