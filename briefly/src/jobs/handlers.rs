use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use super::{Job, JobHandler, JobKind, JobPayload, JobQueue};
use crate::compiler::BriefingCompiler;
use crate::delivery::BriefingMailer;
use crate::ingestion::{self, FeedFetcher};
use crate::maintenance::Maintenance;
use crate::processing::Enricher;

/// Routes each job kind to its pipeline stage and chains follow-up jobs:
/// new articles trigger one enrichment job, each compiled briefing one delivery job.
pub struct PipelineHandler {
    fetcher: Arc<FeedFetcher>,
    enricher: Option<Arc<Enricher>>,
    compiler: Arc<BriefingCompiler>,
    mailer: Arc<BriefingMailer>,
    maintenance: Arc<Maintenance>,
    queue: Arc<dyn JobQueue>,
}

impl PipelineHandler {
    pub fn new(
        fetcher: Arc<FeedFetcher>,
        enricher: Option<Arc<Enricher>>,
        compiler: Arc<BriefingCompiler>,
        mailer: Arc<BriefingMailer>,
        maintenance: Arc<Maintenance>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            fetcher,
            enricher,
            compiler,
            mailer,
            maintenance,
            queue,
        }
    }

    async fn fetch_articles(&self, payload: &JobPayload) -> Result<()> {
        let results = match payload.source_id {
            Some(source_id) => vec![self.fetcher.fetch_source_by_id(source_id).await?],
            None => self.fetcher.fetch_all_feeds().await?,
        };

        if ingestion::total_new(&results) > 0 {
            self.queue
                .enqueue(JobKind::SummarizeArticles, JobPayload::default())
                .await?;
            info!("Triggered summarization job for new articles");
        }
        Ok(())
    }

    async fn summarize_articles(&self) -> Result<()> {
        // Without a provider the articles stay pending for a later run
        let enricher = self
            .enricher
            .as_ref()
            .context("no LLM provider configured, cannot summarize")?;
        enricher.summarize_pending().await?;
        Ok(())
    }

    async fn compile_briefings(&self) -> Result<()> {
        let now = Utc::now();
        let compiled = self.compiler.compile_all(now).await?;
        info!("Compiled {} briefing(s)", compiled.len());

        // Every briefing still compiled gets a delivery job, so a redelivered compile
        // job picks up briefings whose delivery was never chained.
        let awaiting = self.compiler.awaiting_delivery(now).await?;
        for briefing in &awaiting {
            self.queue
                .enqueue(JobKind::SendBriefing, JobPayload::briefing(briefing.id, briefing.user_id))
                .await?;
        }
        if awaiting.len() > compiled.len() {
            info!(
                resumed = awaiting.len() - compiled.len(),
                "Re-queued delivery for briefings compiled earlier"
            );
        }
        Ok(())
    }

    async fn send_briefing(&self, payload: &JobPayload) -> Result<()> {
        let briefing_id = payload
            .briefing_id
            .context("delivery job is missing briefing_id")?;
        self.mailer.send_briefing(briefing_id).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobHandler for PipelineHandler {
    async fn handle(&self, job: &Job) -> Result<()> {
        match job.kind {
            JobKind::FetchArticles => self.fetch_articles(&job.payload).await,
            JobKind::SummarizeArticles => self.summarize_articles().await,
            JobKind::CompileBriefings => self.compile_briefings().await,
            JobKind::Cleanup => self.maintenance.cleanup(Utc::now()).await.map(|_| ()),
            JobKind::SendBriefing => self.send_briefing(&job.payload).await,
        }
    }
}
