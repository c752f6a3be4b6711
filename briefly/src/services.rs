use anyhow::{Context, Result};
use common::Config;
use reqwest::Client;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::compiler::{BriefingCompiler, CompilerLimits};
use crate::delivery::{BriefingMailer, DiscordOptions, DiscordPoster, Mailer, SmtpMailer};
use crate::ingestion::FeedFetcher;
use crate::jobs::{JobQueue, LocalQueue, PipelineHandler, QueueOptions};
use crate::llm::remote::RemoteLlmProvider;
use crate::llm::LlmProvider;
use crate::maintenance::{Maintenance, RetentionPolicy};
use crate::processing::{Enricher, RetryPolicy};
use crate::scraping::{ContentExtractor, ReadabilityExtractor};
use crate::storage::Repositories;

/// Page extraction request timeout.
const EXTRACT_TIMEOUT_SECS: u64 = 10;

/// Process-wide handles, built once at start and passed to whoever needs them.
///
/// Lifecycle: [`Services::open`] connects and migrates the database, seeds the catalog from
/// the config and constructs every component; [`Services::close`] closes the pool on
/// graceful shutdown.
pub struct Services {
    pub config: Config,
    pub pool: SqlitePool,
    pub repos: Repositories,
    pub queue: Arc<LocalQueue>,
    pub fetcher: Arc<FeedFetcher>,
    /// `None` when no LLM provider could be configured
    pub enricher: Option<Arc<Enricher>>,
    pub compiler: Arc<BriefingCompiler>,
    pub mailer: Arc<BriefingMailer>,
    pub discord: Arc<DiscordPoster>,
    pub maintenance: Arc<Maintenance>,
}

impl Services {
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = common::init_db_pool(&config.database.path).await?;
        common::run_migrations(&pool).await?;
        common::sync_catalog(config, &pool).await?;
        info!(db_path = %config.database.path, "database ready");

        let llm: Option<Arc<dyn LlmProvider>> = match RemoteLlmProvider::from_config(&config.llm) {
            Ok(provider) => {
                info!(model = provider.model(), "LLM provider initialized");
                Some(Arc::new(provider))
            }
            Err(e) => {
                warn!("LLM provider unavailable, summarization disabled: {:#}", e);
                None
            }
        };
        let transport: Arc<dyn Mailer> = Arc::new(SmtpMailer::from_config(&config.email)?);

        Self::build(config, pool, llm, transport)
    }

    /// Wire every component over an already prepared pool.
    pub fn build(
        config: &Config,
        pool: SqlitePool,
        llm: Option<Arc<dyn LlmProvider>>,
        transport: Arc<dyn Mailer>,
    ) -> Result<Self> {
        let repos = Repositories::sqlite(pool.clone());

        let fetcher = Arc::new(FeedFetcher::from_config(&config.fetch, &repos)?);

        let extractor: Option<Arc<dyn ContentExtractor>> = if config.enrichment.extract_content.unwrap_or(true) {
            Some(Arc::new(ReadabilityExtractor::new(EXTRACT_TIMEOUT_SECS)?))
        } else {
            None
        };
        let enricher = llm.map(|llm| {
            Arc::new(Enricher::new(
                &repos,
                llm,
                extractor,
                RetryPolicy::from_config(&config.enrichment),
            ))
        });

        let compiler = Arc::new(BriefingCompiler::new(&repos, CompilerLimits::from_config(&config.compiler)));

        let app_url = config.email.app_url.clone().unwrap_or_else(|| "http://localhost:3000".to_string());
        let mailer = Arc::new(BriefingMailer::new(&repos, transport, app_url));

        let http = Client::builder()
            .timeout(Duration::from_secs(config.fetch.timeout_seconds.unwrap_or(20)))
            .build()
            .context("failed to build reqwest client")?;
        let discord = Arc::new(DiscordPoster::new(
            http,
            config.discord.webhook_url.clone(),
            &repos,
            DiscordOptions::from_config(&config.discord),
        ));

        let maintenance = Arc::new(Maintenance::new(&repos, RetentionPolicy::from_config(&config.retention)));
        let queue = Arc::new(LocalQueue::new(QueueOptions::from_config(&config.scheduler)));

        Ok(Self {
            config: config.clone(),
            pool,
            repos,
            queue,
            fetcher,
            enricher,
            compiler,
            mailer,
            discord,
            maintenance,
        })
    }

    /// The job handler bound to this instance's queue.
    pub fn handler(&self) -> Arc<PipelineHandler> {
        let queue: Arc<dyn JobQueue> = self.queue.clone();
        Arc::new(PipelineHandler::new(
            self.fetcher.clone(),
            self.enricher.clone(),
            self.compiler.clone(),
            self.mailer.clone(),
            self.maintenance.clone(),
            queue,
        ))
    }

    pub async fn close(self) {
        self.pool.close().await;
        info!("database pool closed");
    }
}
