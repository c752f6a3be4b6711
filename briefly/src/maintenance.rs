use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::info;

use crate::storage::{ArticleRepository, BriefingRepository, Repositories};

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub articles: Duration,
    pub briefings: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            articles: Duration::days(30),
            briefings: Duration::days(90),
        }
    }
}

impl RetentionPolicy {
    pub fn from_config(config: &common::RetentionConfig) -> Self {
        let defaults = Self::default();
        Self {
            articles: config.article_days.map(Duration::days).unwrap_or(defaults.articles),
            briefings: config.briefing_days.map(Duration::days).unwrap_or(defaults.briefings),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub articles_deleted: u64,
    pub briefings_deleted: u64,
}

/// Retention sweep over articles and briefings. Briefing rows referencing a purged
/// article or briefing go with it.
pub struct Maintenance {
    articles: Arc<dyn ArticleRepository>,
    briefings: Arc<dyn BriefingRepository>,
    retention: RetentionPolicy,
}

impl Maintenance {
    pub fn new(repos: &Repositories, retention: RetentionPolicy) -> Self {
        Self {
            articles: repos.articles.clone(),
            briefings: repos.briefings.clone(),
            retention,
        }
    }

    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let articles_deleted = self.articles.delete_created_before(now - self.retention.articles).await?;
        info!("Cleanup: deleted {} old article(s)", articles_deleted);

        let briefings_deleted = self.briefings.delete_created_before(now - self.retention.briefings).await?;
        info!("Cleanup: deleted {} old briefing(s)", briefings_deleted);

        Ok(CleanupReport {
            articles_deleted,
            briefings_deleted,
        })
    }
}
