use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::header::{HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::models::Source;
use crate::storage::{ArticleRepository, Repositories, SourceRepository};

pub mod feed;

/// Outcome of one fetch cycle for one source. Errors are reported here rather than raised;
/// the caller decides whether and when to retry.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub source_id: i64,
    pub source_name: String,
    pub new_articles: usize,
    pub skipped: usize,
    pub not_modified: bool,
    pub error: Option<String>,
}

impl FetchResult {
    fn new(source: &Source) -> Self {
        Self {
            source_id: source.id,
            source_name: source.name.clone(),
            new_articles: 0,
            skipped: 0,
            not_modified: false,
            error: None,
        }
    }
}

/// Conditional fetch, parse and dedup insert for feed sources.
pub struct FeedFetcher {
    client: Client,
    sources: Arc<dyn SourceRepository>,
    articles: Arc<dyn ArticleRepository>,
}

impl FeedFetcher {
    pub fn new(client: Client, repos: &Repositories) -> Self {
        Self {
            client,
            sources: repos.sources.clone(),
            articles: repos.articles.clone(),
        }
    }

    pub fn from_config(config: &common::FetchConfig, repos: &Repositories) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.unwrap_or(20)))
            .user_agent(config.user_agent.as_deref().unwrap_or("Briefly/0.1.0"))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self::new(client, repos))
    }

    /// Run one fetch cycle for `source`. Never fails: any error lands on the result, bumps
    /// the failure counter and leaves the cached validators as they were.
    pub async fn fetch_source(&self, source: &Source) -> FetchResult {
        let mut result = FetchResult::new(source);

        if let Err(e) = self.fetch_cycle(source, &mut result).await {
            result.error = Some(format!("{:#}", e));
            if let Err(record_err) = self.sources.record_failure(source.id, Utc::now()).await {
                warn!(source_id = source.id, error = %record_err, "failed to record fetch failure");
            }
        }

        result
    }

    async fn fetch_cycle(&self, source: &Source, result: &mut FetchResult) -> Result<()> {
        let mut request = self.client.get(&source.feed_url);
        if let Some(etag) = source.etag.as_deref() {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = source.last_modified.as_deref() {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await.context("network error during fetch")?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            debug!(source_id = source.id, "feed not modified");
            self.sources.record_not_modified(source.id, Utc::now()).await?;
            result.not_modified = true;
            return Ok(());
        }
        if !status.is_success() {
            anyhow::bail!("feed fetch failed with status: {}", status);
        }

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(ETAG);
        let last_modified = header(LAST_MODIFIED);

        let bytes = response.bytes().await.context("failed to read response body")?;
        let parsed = feed::parse_feed(bytes.as_ref()).context("failed to parse feed")?;

        let now = Utc::now();
        for entry in &parsed.entries {
            let Some(article) = feed::article_from_entry(source.id, entry) else {
                debug!(source_id = source.id, entry_id = %entry.id, "skipping entry without link or title");
                result.skipped += 1;
                continue;
            };

            match self.articles.insert_if_absent(&article, now).await? {
                Some(_) => result.new_articles += 1,
                None => result.skipped += 1,
            }
        }

        self.sources
            .record_success(source.id, Utc::now(), etag.as_deref(), last_modified.as_deref())
            .await?;
        Ok(())
    }

    /// Fetch a single source by id, regardless of its active flag.
    pub async fn fetch_source_by_id(&self, source_id: i64) -> Result<FetchResult> {
        let source = self
            .sources
            .get(source_id)
            .await?
            .ok_or(PipelineError::SourceNotFound(source_id))?;
        let result = self.fetch_source(&source).await;
        log_outcome(&result);
        Ok(result)
    }

    /// Fetch every active source in order. One source failing never halts the batch.
    pub async fn fetch_all_feeds(&self) -> Result<Vec<FetchResult>> {
        let sources = self.sources.list_active().await?;
        info!("Fetching {} active feed(s)", sources.len());

        let mut results = Vec::with_capacity(sources.len());
        for source in &sources {
            info!(source_id = source.id, feed_url = %source.feed_url, "Fetching: {}", source.name);
            let result = self.fetch_source(source).await;
            log_outcome(&result);
            results.push(result);
        }

        let total_new: usize = results.iter().map(|r| r.new_articles).sum();
        let total_errors = results.iter().filter(|r| r.error.is_some()).count();
        info!(total_new, total_errors, "Feed fetch complete");

        Ok(results)
    }
}

fn log_outcome(result: &FetchResult) {
    match &result.error {
        Some(e) => error!(source_id = result.source_id, error = %e, "Feed fetch error: {}", result.source_name),
        None => info!(
            source_id = result.source_id,
            new_articles = result.new_articles,
            skipped = result.skipped,
            not_modified = result.not_modified,
            "Fetched: {}",
            result.source_name
        ),
    }
}

/// Sum of new articles over a batch; a non-zero total chains enrichment.
pub fn total_new(results: &[FetchResult]) -> usize {
    results.iter().map(|r| r.new_articles).sum()
}
