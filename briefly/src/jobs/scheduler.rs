use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{error, info};

use super::{JobKind, JobPayload, JobQueue};

/// The cron-triggered producers: (expression, job kind). Delivery has none; it is only
/// ever chained from compilation.
pub fn producers(config: &common::SchedulerConfig) -> [(&str, JobKind); 3] {
    [
        (config.ingestion_cron(), JobKind::FetchArticles),
        (config.compilation_cron(), JobKind::CompileBriefings),
        (config.maintenance_cron(), JobKind::Cleanup),
    ]
}

/// Register one cron job per producer. Each tick only enqueues; the work itself runs on
/// the queue's worker pools. The returned scheduler is not started.
pub async fn build_scheduler(config: &common::SchedulerConfig, queue: Arc<dyn JobQueue>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    for (cron, kind) in producers(config) {
        let queue = queue.clone();
        let job = CronJob::new_async(cron, move |_uuid, _l| {
            let queue = queue.clone();
            Box::pin(async move {
                if let Err(e) = queue.enqueue(kind, JobPayload::default()).await {
                    error!(kind = %kind, "failed to enqueue scheduled job: {:#}", e);
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(kind = %kind, cron, "cron producer registered");
    }

    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{LocalQueue, QueueOptions};

    #[tokio::test]
    async fn default_cron_expressions_are_accepted() {
        let config = common::SchedulerConfig::default();
        let queue: Arc<dyn JobQueue> = Arc::new(LocalQueue::new(QueueOptions::default()));
        assert!(build_scheduler(&config, queue).await.is_ok());
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected() {
        let config = common::SchedulerConfig {
            ingestion: Some("every two hours".to_string()),
            ..Default::default()
        };
        let queue: Arc<dyn JobQueue> = Arc::new(LocalQueue::new(QueueOptions::default()));
        assert!(build_scheduler(&config, queue).await.is_err());
    }
}
