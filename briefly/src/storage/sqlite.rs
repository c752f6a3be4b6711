use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqlitePool;

use super::{
    ArticleRepository, BriefingRepository, SourceRepository, TopicRepository, UserRepository,
};
use crate::models::{
    Article, Briefing, BriefingArticle, BriefingEntry, DigestArticle, NewArticle, RecentArticle,
    Source, Subscription, SummaryStatus, Topic, User,
};

/// SQLite-backed implementation of every repository trait.
///
/// Correctness under concurrent or repeated runs rests on the schema's uniqueness
/// constraints and on guarded status updates (`WHERE status = <predecessor>`).
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const SOURCE_COLUMNS: &str =
    "id, name, feed_url, site_url, active, etag, last_modified, last_fetched_at, fetch_failures";

const ARTICLE_COLUMNS: &str = "id, source_id, guid, title, url, author, content, content_hash, \
     published_at, summary, summary_status, created_at";

const BRIEFING_COLUMNS: &str =
    "id, user_id, briefing_date, status, article_count, compiled_at, sent_at";

#[async_trait::async_trait]
impl SourceRepository for SqliteStore {
    async fn list_active(&self) -> Result<Vec<Source>> {
        sqlx::query_as::<_, Source>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE active = 1 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to list active sources")
    }

    async fn get(&self, id: i64) -> Result<Option<Source>> {
        sqlx::query_as::<_, Source>(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load source")
    }

    async fn record_not_modified(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sources SET last_fetched_at = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to update source fetch timestamp")?;
        Ok(())
    }

    async fn record_success(
        &self,
        id: i64,
        at: DateTime<Utc>,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sources
            SET last_fetched_at = ?, etag = ?, last_modified = ?, fetch_failures = 0
            WHERE id = ?
            "#,
        )
        .bind(at)
        .bind(etag)
        .bind(last_modified)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to record successful fetch")?;
        Ok(())
    }

    async fn record_failure(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE sources SET last_fetched_at = ?, fetch_failures = fetch_failures + 1 WHERE id = ?",
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to record fetch failure")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ArticleRepository for SqliteStore {
    async fn insert_if_absent(&self, article: &NewArticle, at: DateTime<Utc>) -> Result<Option<i64>> {
        // The (source_id, guid) constraint is the dedup key; a conflict is an expected outcome.
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO articles
                (source_id, guid, title, url, author, content, content_hash, published_at,
                 summary_status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            ON CONFLICT (source_id, guid) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(article.source_id)
        .bind(&article.guid)
        .bind(&article.title)
        .bind(&article.url)
        .bind(&article.author)
        .bind(&article.content)
        .bind(&article.content_hash)
        .bind(article.published_at)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .context("failed to insert article")
    }

    async fn list_pending(&self) -> Result<Vec<Article>> {
        sqlx::query_as::<_, Article>(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE summary_status = 'pending' ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to list pending articles")
    }

    async fn status(&self, id: i64) -> Result<Option<SummaryStatus>> {
        sqlx::query_scalar::<_, SummaryStatus>("SELECT summary_status FROM articles WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read article status")
    }

    async fn mark_processing(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE articles SET summary_status = 'processing', updated_at = ? WHERE id = ? AND summary_status = 'pending'",
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to mark article processing")?;
        Ok(res.rows_affected() == 1)
    }

    async fn mark_completed(
        &self,
        id: i64,
        summary: &str,
        content: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE articles
            SET summary = ?, content = COALESCE(?, content), summary_status = 'completed', updated_at = ?
            WHERE id = ? AND summary_status = 'processing'
            "#,
        )
        .bind(summary)
        .bind(content)
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to store article summary")?;
        Ok(res.rows_affected() == 1)
    }

    async fn mark_failed(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE articles SET summary_status = 'failed', updated_at = ? WHERE id = ? AND summary_status = 'processing'",
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to mark article failed")?;
        Ok(res.rows_affected() == 1)
    }

    async fn completed_for_topic(
        &self,
        topic_id: i64,
        since: DateTime<Utc>,
        exclude: &[i64],
        limit: usize,
    ) -> Result<Vec<DigestArticle>> {
        let exclusion = if exclude.is_empty() {
            String::new()
        } else {
            format!("AND a.id NOT IN ({})", vec!["?"; exclude.len()].join(", "))
        };
        let sql = format!(
            r#"
            SELECT a.id, a.title, a.url, a.author, a.summary, a.published_at, s.name AS source_name
            FROM articles a
            JOIN sources s ON s.id = a.source_id
            WHERE a.summary_status = 'completed'
              AND a.summary IS NOT NULL
              AND COALESCE(a.published_at, a.created_at) >= ?
              AND EXISTS (
                  SELECT 1 FROM source_topics st
                  WHERE st.source_id = a.source_id AND st.topic_id = ?
              )
              {exclusion}
            ORDER BY COALESCE(a.published_at, a.created_at) DESC, a.id DESC
            LIMIT ?
            "#
        );

        let mut query = sqlx::query_as::<_, DigestArticle>(&sql).bind(since).bind(topic_id);
        for id in exclude {
            query = query.bind(*id);
        }
        query
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .context("failed to select articles for topic")
    }

    async fn recent_completed(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<RecentArticle>> {
        sqlx::query_as::<_, RecentArticle>(
            r#"
            SELECT a.id, a.title, a.url, a.summary, a.published_at, s.name AS source_name,
                   (SELECT t.name FROM source_topics st
                    JOIN topics t ON t.id = st.topic_id
                    WHERE st.source_id = a.source_id
                    ORDER BY t.name LIMIT 1) AS topic_name
            FROM articles a
            JOIN sources s ON s.id = a.source_id
            WHERE a.summary_status = 'completed'
              AND a.summary IS NOT NULL
              AND a.created_at >= ?
            ORDER BY COALESCE(a.published_at, a.created_at) DESC, a.id DESC
            LIMIT ?
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch recent articles")
    }

    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query("DELETE FROM articles WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("failed to purge old articles")?;
        Ok(res.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: i64,
    name: String,
    slug: String,
    description: Option<String>,
    keywords_json: String,
    priority: i64,
}

#[async_trait::async_trait]
impl TopicRepository for SqliteStore {
    async fn subscriptions_for_user(&self, user_id: i64) -> Result<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT t.id, t.name, t.slug, t.description, t.keywords_json, ut.priority
            FROM user_topics ut
            JOIN topics t ON t.id = ut.topic_id
            WHERE ut.user_id = ?
            ORDER BY ut.priority DESC, t.id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load user subscriptions")?;

        Ok(rows
            .into_iter()
            .map(|r| Subscription {
                topic: Topic {
                    id: r.id,
                    name: r.name,
                    slug: r.slug,
                    description: r.description,
                    keywords_json: r.keywords_json,
                },
                priority: r.priority,
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl UserRepository for SqliteStore {
    async fn list_active(&self) -> Result<Vec<User>> {
        sqlx::query_as::<_, User>("SELECT id, email, name, active FROM users WHERE active = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("failed to list active users")
    }

    async fn get(&self, id: i64) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT id, email, name, active FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load user")
    }
}

#[async_trait::async_trait]
impl BriefingRepository for SqliteStore {
    async fn find(&self, user_id: i64, date: NaiveDate) -> Result<Option<Briefing>> {
        sqlx::query_as::<_, Briefing>(&format!(
            "SELECT {BRIEFING_COLUMNS} FROM briefings WHERE user_id = ? AND briefing_date = ?"
        ))
        .bind(user_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up briefing")
    }

    async fn get(&self, id: i64) -> Result<Option<Briefing>> {
        sqlx::query_as::<_, Briefing>(&format!("SELECT {BRIEFING_COLUMNS} FROM briefings WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load briefing")
    }

    async fn upsert_compiled(
        &self,
        user_id: i64,
        date: NaiveDate,
        article_count: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        // Only a pending row may be promoted; anything further along wins the race.
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO briefings (user_id, briefing_date, status, article_count, compiled_at, created_at)
            VALUES (?, ?, 'compiled', ?, ?, ?)
            ON CONFLICT (user_id, briefing_date) DO UPDATE
                SET status = 'compiled',
                    article_count = excluded.article_count,
                    compiled_at = excluded.compiled_at
                WHERE briefings.status = 'pending'
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(date)
        .bind(article_count)
        .bind(at)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .context("failed to upsert briefing")
    }

    async fn list_compiled(&self, date: NaiveDate) -> Result<Vec<Briefing>> {
        sqlx::query_as::<_, Briefing>(&format!(
            "SELECT {BRIEFING_COLUMNS} FROM briefings WHERE briefing_date = ? AND status = 'compiled' ORDER BY id"
        ))
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .context("failed to list compiled briefings")
    }

    async fn add_article(&self, row: &BriefingArticle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO briefing_articles (briefing_id, article_id, position, topic_id, topic_slug)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (briefing_id, article_id) DO NOTHING
            "#,
        )
        .bind(row.briefing_id)
        .bind(row.article_id)
        .bind(row.position)
        .bind(row.topic_id)
        .bind(&row.topic_slug)
        .execute(&self.pool)
        .await
        .context("failed to insert briefing article")?;
        Ok(())
    }

    async fn entries(&self, briefing_id: i64) -> Result<Vec<BriefingEntry>> {
        sqlx::query_as::<_, BriefingEntry>(
            r#"
            SELECT ba.position, ba.topic_slug, t.name AS topic_name,
                   a.id AS article_id, a.title, a.url, a.author, a.summary,
                   s.name AS source_name
            FROM briefing_articles ba
            JOIN articles a ON a.id = ba.article_id
            JOIN sources s ON s.id = a.source_id
            LEFT JOIN topics t ON t.id = ba.topic_id
            WHERE ba.briefing_id = ?
            ORDER BY ba.position ASC
            "#,
        )
        .bind(briefing_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load briefing articles")
    }

    async fn mark_sending(&self, id: i64) -> Result<bool> {
        let res = sqlx::query("UPDATE briefings SET status = 'sending' WHERE id = ? AND status = 'compiled'")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to mark briefing sending")?;
        Ok(res.rows_affected() == 1)
    }

    async fn mark_sent(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query("UPDATE briefings SET status = 'sent', sent_at = ? WHERE id = ? AND status = 'sending'")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to mark briefing sent")?;
        Ok(res.rows_affected() == 1)
    }

    async fn mark_failed(&self, id: i64) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE briefings SET status = 'failed' WHERE id = ? AND status IN ('compiled', 'sending')",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to mark briefing failed")?;
        Ok(res.rows_affected() == 1)
    }

    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query("DELETE FROM briefings WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("failed to purge old briefings")?;
        Ok(res.rows_affected())
    }
}
