use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Enrichment lifecycle of an article. Transitions only move forward:
/// pending -> processing -> completed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SummaryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SummaryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryStatus::Pending => "pending",
            SummaryStatus::Processing => "processing",
            SummaryStatus::Completed => "completed",
            SummaryStatus::Failed => "failed",
        }
    }
}

/// Delivery lifecycle of a briefing: pending -> compiled -> sending -> sent | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BriefingStatus {
    Pending,
    Compiled,
    Sending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub feed_url: String,
    pub site_url: Option<String>,
    pub active: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub fetch_failures: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Article {
    pub id: i64,
    pub source_id: i64,
    pub guid: String,
    pub title: String,
    pub url: String,
    pub author: Option<String>,
    pub content: Option<String>,
    pub content_hash: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub summary_status: SummaryStatus,
    pub created_at: DateTime<Utc>,
}

/// A feed entry ready for the dedup insert.
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub source_id: i64,
    pub guid: String,
    pub title: String,
    pub url: String,
    pub author: Option<String>,
    pub content: Option<String>,
    pub content_hash: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Completed article joined with its source, as selected for a digest.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DigestArticle {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub author: Option<String>,
    pub summary: String,
    pub published_at: Option<DateTime<Utc>>,
    pub source_name: String,
}

/// Completed article for the chat channel, with the first topic its source is filed under.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RecentArticle {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub summary: String,
    pub published_at: Option<DateTime<Utc>>,
    pub source_name: String,
    pub topic_name: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Topic {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub keywords_json: String,
}

/// A user's subscription to a topic. Higher priority is compiled first.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic: Topic,
    pub priority: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    pub active: bool,
}

impl User {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().filter(|n| !n.is_empty()).unwrap_or(&self.email)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Briefing {
    pub id: i64,
    pub user_id: i64,
    pub briefing_date: NaiveDate,
    pub status: BriefingStatus,
    pub article_count: i64,
    pub compiled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// One materialized row of a compiled briefing.
#[derive(Debug, Clone)]
pub struct BriefingArticle {
    pub briefing_id: i64,
    pub article_id: i64,
    pub position: i64,
    pub topic_id: i64,
    pub topic_slug: String,
}

/// A briefing row joined with the article, source and topic it refers to, in position order.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BriefingEntry {
    pub position: i64,
    pub topic_slug: String,
    pub topic_name: Option<String>,
    pub article_id: i64,
    pub title: String,
    pub url: String,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub source_name: String,
}
