use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::llm::{summarizer, LlmProvider};
use crate::models::{Article, SummaryStatus};
use crate::scraping::ContentExtractor;
use crate::storage::{ArticleRepository, Repositories};

/// Retry and pacing knobs for enrichment. Only the summarization call is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Gap between successive articles of a batch
    pub pacing: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            pacing: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &common::EnrichmentConfig) -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: config.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            initial_backoff: config
                .initial_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_backoff),
            pacing: config.pacing_ms.map(Duration::from_millis).unwrap_or(defaults.pacing),
        }
    }

    /// Delay after the given failed attempt (1-based): initial, 2x initial, 4x initial...
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor)
    }
}

/// Batch counters returned by [`Enricher::summarize_pending`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentStats {
    pub processed: usize,
    pub failed: usize,
}

/// Drives articles through pending -> processing -> completed | failed.
pub struct Enricher {
    articles: Arc<dyn ArticleRepository>,
    llm: Arc<dyn LlmProvider>,
    extractor: Option<Arc<dyn ContentExtractor>>,
    policy: RetryPolicy,
}

impl Enricher {
    pub fn new(
        repos: &Repositories,
        llm: Arc<dyn LlmProvider>,
        extractor: Option<Arc<dyn ContentExtractor>>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            articles: repos.articles.clone(),
            llm,
            extractor,
            policy,
        }
    }

    /// Summarize one article. Returns the status it ended in; an article that was not
    /// pending is left alone and its current status returned.
    pub async fn summarize_article(&self, article: &Article) -> Result<SummaryStatus> {
        // Claim before any external call so a crash leaves the row visibly in processing
        if !self.articles.mark_processing(article.id, Utc::now()).await? {
            let current = self.articles.status(article.id).await?.unwrap_or(article.summary_status);
            debug!(article_id = article.id, status = current.as_str(), "article not pending, skipping");
            return Ok(current);
        }

        let extracted = match &self.extractor {
            Some(extractor) => extractor.extract(&article.url).await,
            None => None,
        };
        let content = extracted.as_deref().or(article.content.as_deref());

        let mut attempt = 0;
        loop {
            attempt += 1;
            match summarizer::summarize_article(self.llm.as_ref(), article, content).await {
                Ok(summary) => {
                    self.articles
                        .mark_completed(article.id, &summary, extracted.as_deref(), Utc::now())
                        .await?;
                    info!(article_id = article.id, attempt, "Summarized: {}", article.title);
                    return Ok(SummaryStatus::Completed);
                }
                Err(e) if attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff_after(attempt);
                    warn!(
                        article_id = article.id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "summarization failed: {:#}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(article_id = article.id, attempt, "summarization gave up: {:#}", e);
                    self.articles.mark_failed(article.id, Utc::now()).await?;
                    return Ok(SummaryStatus::Failed);
                }
            }
        }
    }

    /// Summarize every pending article, oldest first, pausing between articles.
    /// One article's failure never halts the batch.
    pub async fn summarize_pending(&self) -> Result<EnrichmentStats> {
        let pending = self.articles.list_pending().await?;
        if pending.is_empty() {
            info!("No pending articles to summarize");
            return Ok(EnrichmentStats::default());
        }

        info!("Found {} pending articles to summarize", pending.len());
        let mut stats = EnrichmentStats::default();

        for (i, article) in pending.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.policy.pacing).await;
            }
            match self.summarize_article(article).await {
                Ok(SummaryStatus::Completed) => stats.processed += 1,
                Ok(SummaryStatus::Failed) => stats.failed += 1,
                Ok(_) => {}
                Err(e) => {
                    error!(article_id = article.id, "enrichment error: {:#}", e);
                    stats.failed += 1;
                }
            }
        }

        info!(processed = stats.processed, failed = stats.failed, "Enrichment batch complete");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_initial() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_after(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_after(3), Duration::from_secs(8));
    }

    #[test]
    fn config_overrides_defaults() {
        let config = common::EnrichmentConfig {
            max_attempts: Some(0),
            initial_backoff_ms: Some(10),
            pacing_ms: None,
            extract_content: None,
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.initial_backoff, Duration::from_millis(10));
        assert_eq!(policy.pacing, Duration::from_secs(1));
    }
}
