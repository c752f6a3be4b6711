//! Repository interfaces, one per entity. Pipeline components only see these traits;
//! the SQLite implementation is bound once at start through [`Repositories::sqlite`].

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::models::{
    Article, Briefing, BriefingArticle, BriefingEntry, DigestArticle, NewArticle, RecentArticle,
    Source, Subscription, SummaryStatus, User,
};

pub mod sqlite;

pub use sqlite::SqliteStore;

#[async_trait::async_trait]
pub trait SourceRepository: Send + Sync {
    async fn list_active(&self) -> Result<Vec<Source>>;

    async fn get(&self, id: i64) -> Result<Option<Source>>;

    /// Origin answered "not modified": only the fetch timestamp moves.
    async fn record_not_modified(&self, id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Store fresh validators and reset the failure counter.
    async fn record_success(
        &self,
        id: i64,
        at: DateTime<Utc>,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<()>;

    /// Increment the failure counter, leaving validators untouched.
    async fn record_failure(&self, id: i64, at: DateTime<Utc>) -> Result<()>;
}

#[async_trait::async_trait]
pub trait ArticleRepository: Send + Sync {
    /// Dedup insert keyed by (source, guid). Returns `None` when the entry is already known.
    async fn insert_if_absent(&self, article: &NewArticle, at: DateTime<Utc>) -> Result<Option<i64>>;

    /// All pending articles, oldest first.
    async fn list_pending(&self) -> Result<Vec<Article>>;

    async fn status(&self, id: i64) -> Result<Option<SummaryStatus>>;

    /// pending -> processing. Returns false if the article was not pending.
    async fn mark_processing(&self, id: i64, at: DateTime<Utc>) -> Result<bool>;

    /// processing -> completed, storing the summary and, when given, richer extracted content.
    async fn mark_completed(
        &self,
        id: i64,
        summary: &str,
        content: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// processing -> failed.
    async fn mark_failed(&self, id: i64, at: DateTime<Utc>) -> Result<bool>;

    /// Completed articles from sources filed under `topic_id`, seen since `since`,
    /// excluding `exclude`, newest first.
    async fn completed_for_topic(
        &self,
        topic_id: i64,
        since: DateTime<Utc>,
        exclude: &[i64],
        limit: usize,
    ) -> Result<Vec<DigestArticle>>;

    /// Completed articles seen since `since`, newest first, for the chat channel.
    async fn recent_completed(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<RecentArticle>>;

    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait::async_trait]
pub trait TopicRepository: Send + Sync {
    /// The user's subscriptions in descending priority.
    async fn subscriptions_for_user(&self, user_id: i64) -> Result<Vec<Subscription>>;
}

#[async_trait::async_trait]
pub trait UserRepository: Send + Sync {
    async fn list_active(&self) -> Result<Vec<User>>;

    async fn get(&self, id: i64) -> Result<Option<User>>;
}

#[async_trait::async_trait]
pub trait BriefingRepository: Send + Sync {
    async fn find(&self, user_id: i64, date: NaiveDate) -> Result<Option<Briefing>>;

    async fn get(&self, id: i64) -> Result<Option<Briefing>>;

    /// Create the (user, date) briefing as compiled, or promote an existing pending one.
    /// Returns `None` if a non-pending briefing already holds the key.
    async fn upsert_compiled(
        &self,
        user_id: i64,
        date: NaiveDate,
        article_count: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<i64>>;

    /// Briefings of `date` still waiting in `compiled`.
    async fn list_compiled(&self, date: NaiveDate) -> Result<Vec<Briefing>>;

    async fn add_article(&self, row: &BriefingArticle) -> Result<()>;

    async fn entries(&self, briefing_id: i64) -> Result<Vec<BriefingEntry>>;

    /// compiled -> sending. Returns false if the briefing was not compiled.
    async fn mark_sending(&self, id: i64) -> Result<bool>;

    /// sending -> sent.
    async fn mark_sent(&self, id: i64, at: DateTime<Utc>) -> Result<bool>;

    /// compiled | sending -> failed.
    async fn mark_failed(&self, id: i64) -> Result<bool>;

    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// The bound repository implementations, cloned into each component.
#[derive(Clone)]
pub struct Repositories {
    pub sources: Arc<dyn SourceRepository>,
    pub articles: Arc<dyn ArticleRepository>,
    pub topics: Arc<dyn TopicRepository>,
    pub users: Arc<dyn UserRepository>,
    pub briefings: Arc<dyn BriefingRepository>,
}

impl Repositories {
    pub fn sqlite(pool: SqlitePool) -> Self {
        let store = Arc::new(SqliteStore::new(pool));
        Self {
            sources: store.clone(),
            articles: store.clone(),
            topics: store.clone(),
            users: store.clone(),
            briefings: store,
        }
    }
}
