use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{Job, JobHandler, JobKind, JobPayload, JobQueue, QueueName};
use crate::error::PipelineError;

/// Worker pool and redelivery settings, shared by every queue.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Jobs of one queue running at the same time
    pub concurrency: usize,
    /// Deliveries per job, first one included
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_attempts: 1,
            retry_delay: Duration::from_secs(30),
        }
    }
}

impl QueueOptions {
    pub fn from_config(config: &common::SchedulerConfig) -> Self {
        let defaults = Self::default();
        Self {
            concurrency: config.concurrency.unwrap_or(defaults.concurrency).max(1),
            max_attempts: config.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            retry_delay: config
                .retry_delay_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_delay),
        }
    }
}

/// In-process queue: one channel and one bounded worker pool per [`QueueName`].
///
/// A failed job is redelivered until `max_attempts` is reached, except for failures
/// classified fatal, which are dropped at once. Jobs live in memory only; a crash loses
/// whatever is queued and the cron producers refill the stages on their next tick.
pub struct LocalQueue {
    senders: HashMap<QueueName, mpsc::UnboundedSender<Job>>,
    receivers: Mutex<HashMap<QueueName, mpsc::UnboundedReceiver<Job>>>,
    options: QueueOptions,
}

impl LocalQueue {
    pub fn new(options: QueueOptions) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for name in QueueName::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(name, tx);
            receivers.insert(name, rx);
        }
        Self {
            senders,
            receivers: Mutex::new(receivers),
            options,
        }
    }

    fn push(&self, job: Job) -> Result<()> {
        let queue = job.kind.queue();
        self.senders
            .get(&queue)
            .with_context(|| format!("no channel for queue {}", queue.as_str()))?
            .send(job)
            .map_err(|_| anyhow::anyhow!("queue {} is closed", queue.as_str()))
    }

    /// Run one delivery of `job`. Returns the redelivery to schedule if it failed and
    /// has attempts left.
    async fn execute(&self, handler: &dyn JobHandler, job: Job) -> Option<Job> {
        let queue = job.kind.queue().as_str();
        match handler.handle(&job).await {
            Ok(()) => {
                info!(queue, kind = %job.kind, job_id = %job.id, attempt = job.attempt, "job completed");
                None
            }
            Err(e) => {
                error!(
                    queue,
                    kind = %job.kind,
                    job_id = %job.id,
                    attempt = job.attempt,
                    error = %format!("{:#}", e),
                    "job failed"
                );

                let fatal = e.downcast_ref::<PipelineError>().map_or(false, PipelineError::is_fatal);
                if fatal || job.attempt >= self.options.max_attempts {
                    return None;
                }
                Some(Job {
                    attempt: job.attempt + 1,
                    ..job
                })
            }
        }
    }

    async fn requeue_after_delay(&self, job: Job) {
        tokio::time::sleep(self.options.retry_delay).await;
        let queue = job.kind.queue().as_str();
        let job_id = job.id;
        if let Err(e) = self.push(job) {
            warn!(queue, job_id = %job_id, "failed to requeue job: {:#}", e);
        }
    }

    /// Process queued jobs inline, one at a time, until every queue is empty, following
    /// any jobs chained along the way. Returns the number of deliveries made.
    pub async fn run_until_idle(&self, handler: &dyn JobHandler) -> Result<usize> {
        let mut receivers = self.receivers.lock().await;
        if receivers.len() != QueueName::ALL.len() {
            anyhow::bail!("queue workers are already running");
        }

        let mut deliveries = 0;
        loop {
            let next = QueueName::ALL
                .iter()
                .find_map(|name| receivers.get_mut(name).and_then(|rx| rx.try_recv().ok()));
            let Some(job) = next else { break };
            if let Some(retry) = self.execute(handler, job).await {
                self.requeue_after_delay(retry).await;
            }
            deliveries += 1;
        }
        Ok(deliveries)
    }

    /// Start one worker pool per queue and run until `shutdown` flips to true. In-flight
    /// jobs are allowed to finish; queued ones are left behind.
    pub async fn run(self: Arc<Self>, handler: Arc<dyn JobHandler>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let receivers: Vec<_> = {
            let mut guard = self.receivers.lock().await;
            if guard.len() != QueueName::ALL.len() {
                anyhow::bail!("queue workers are already running");
            }
            guard.drain().collect()
        };

        let mut pools = JoinSet::new();
        for (name, rx) in receivers {
            pools.spawn(self.clone().pool(name, rx, handler.clone(), shutdown.clone()));
        }
        info!(queues = pools.len(), concurrency = self.options.concurrency, "job workers started");

        while let Some(res) = pools.join_next().await {
            if let Err(e) = res {
                error!("queue worker task panicked: {}", e);
            }
        }
        info!("job workers stopped");
        Ok(())
    }

    async fn pool(
        self: Arc<Self>,
        name: QueueName,
        mut rx: mpsc::UnboundedReceiver<Job>,
        handler: Arc<dyn JobHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let concurrency = self.options.concurrency;
        let slots = Arc::new(Semaphore::new(concurrency));

        loop {
            if *shutdown.borrow() {
                break;
            }
            // Wait for a free slot before taking the next job off the channel
            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };
            let job = tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            let queue = self.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let retry = queue.execute(handler.as_ref(), job).await;
                // The slot is free while a redelivery waits out its delay
                drop(permit);
                if let Some(retry) = retry {
                    queue.requeue_after_delay(retry).await;
                }
            });
        }

        // Wait for in-flight jobs of this queue
        let _ = slots.acquire_many(concurrency as u32).await;
        info!(queue = name.as_str(), "queue worker stopped");
    }
}

#[async_trait::async_trait]
impl JobQueue for LocalQueue {
    async fn enqueue(&self, kind: JobKind, payload: JobPayload) -> Result<Uuid> {
        let job = Job::new(kind, payload);
        let id = job.id;
        self.push(job)?;
        info!(queue = kind.queue().as_str(), kind = %kind, job_id = %id, "job enqueued");
        Ok(id)
    }
}
