use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::models::{Briefing, BriefingArticle, BriefingStatus, DigestArticle, Topic, User};
use crate::storage::{ArticleRepository, BriefingRepository, Repositories, TopicRepository, UserRepository};

/// Selection quotas for one digest.
#[derive(Debug, Clone)]
pub struct CompilerLimits {
    pub max_per_topic: usize,
    pub max_total: usize,
    pub window: Duration,
}

impl Default for CompilerLimits {
    fn default() -> Self {
        Self {
            max_per_topic: 5,
            max_total: 20,
            window: Duration::hours(24),
        }
    }
}

impl CompilerLimits {
    pub fn from_config(config: &common::CompilerConfig) -> Self {
        let defaults = Self::default();
        Self {
            max_per_topic: config.max_per_topic.unwrap_or(defaults.max_per_topic),
            max_total: config.max_total.unwrap_or(defaults.max_total),
            window: config.window_hours.map(Duration::hours).unwrap_or(defaults.window),
        }
    }
}

/// One topic's share of a digest, in selection order.
#[derive(Debug, Clone)]
pub struct BriefingSection {
    pub topic: Topic,
    pub articles: Vec<DigestArticle>,
}

#[derive(Debug, Clone)]
pub struct CompiledBriefing {
    pub briefing_id: i64,
    pub user_id: i64,
    pub date: NaiveDate,
    pub sections: Vec<BriefingSection>,
}

impl CompiledBriefing {
    pub fn article_count(&self) -> usize {
        self.sections.iter().map(|s| s.articles.len()).sum()
    }
}

#[derive(Debug, Clone)]
pub enum CompileOutcome {
    Compiled(CompiledBriefing),
    /// A briefing past `pending` already exists for the day; nothing was written.
    AlreadyCompiled,
    /// No eligible articles; nothing was written.
    NoArticles,
    NoTopics,
}

/// Builds each user's daily digest from completed articles of their subscribed topics.
pub struct BriefingCompiler {
    articles: Arc<dyn ArticleRepository>,
    topics: Arc<dyn TopicRepository>,
    users: Arc<dyn UserRepository>,
    briefings: Arc<dyn BriefingRepository>,
    limits: CompilerLimits,
}

impl BriefingCompiler {
    pub fn new(repos: &Repositories, limits: CompilerLimits) -> Self {
        Self {
            articles: repos.articles.clone(),
            topics: repos.topics.clone(),
            users: repos.users.clone(),
            briefings: repos.briefings.clone(),
            limits,
        }
    }

    /// Compile `user`'s briefing for the UTC date of `now`. Safe to re-run: once the day's
    /// briefing is past `pending` this returns [`CompileOutcome::AlreadyCompiled`] without writing.
    pub async fn compile_for_user(&self, user: &User, now: DateTime<Utc>) -> Result<CompileOutcome> {
        let today = now.date_naive();

        if let Some(existing) = self.briefings.find(user.id, today).await? {
            if existing.status != BriefingStatus::Pending {
                debug!(user_id = user.id, briefing_id = existing.id, "briefing already compiled");
                return Ok(CompileOutcome::AlreadyCompiled);
            }
        }

        let subscriptions = self.topics.subscriptions_for_user(user.id).await?;
        if subscriptions.is_empty() {
            debug!(user_id = user.id, "user has no topic subscriptions");
            return Ok(CompileOutcome::NoTopics);
        }

        let since = now - self.limits.window;
        let mut claimed: Vec<i64> = Vec::new();
        let mut sections = Vec::new();

        for subscription in subscriptions {
            let remaining = self.limits.max_total.saturating_sub(claimed.len());
            if remaining == 0 {
                break;
            }
            let quota = self.limits.max_per_topic.min(remaining);
            let articles = self
                .articles
                .completed_for_topic(subscription.topic.id, since, &claimed, quota)
                .await
                .with_context(|| format!("failed to select articles for topic {}", subscription.topic.slug))?;
            if articles.is_empty() {
                continue;
            }
            claimed.extend(articles.iter().map(|a| a.id));
            sections.push(BriefingSection {
                topic: subscription.topic,
                articles,
            });
        }

        if claimed.is_empty() {
            info!(user_id = user.id, "No articles for briefing: {}", user.email);
            return Ok(CompileOutcome::NoArticles);
        }

        let Some(briefing_id) = self
            .briefings
            .upsert_compiled(user.id, today, claimed.len() as i64, now)
            .await?
        else {
            // Lost a race with a concurrent compile of the same day
            return Ok(CompileOutcome::AlreadyCompiled);
        };

        // Separate writes, not a transaction: a crash mid-loop leaves the briefing
        // compiled with a prefix of its rows.
        let mut position = 0;
        for section in &sections {
            for article in &section.articles {
                position += 1;
                self.briefings
                    .add_article(&BriefingArticle {
                        briefing_id,
                        article_id: article.id,
                        position,
                        topic_id: section.topic.id,
                        topic_slug: section.topic.slug.clone(),
                    })
                    .await?;
            }
        }

        let compiled = CompiledBriefing {
            briefing_id,
            user_id: user.id,
            date: today,
            sections,
        };
        info!(
            user_id = user.id,
            briefing_id,
            articles = compiled.article_count(),
            "Compiled briefing for {}",
            user.email
        );
        Ok(CompileOutcome::Compiled(compiled))
    }

    /// Compile for every active user. A failing user is logged and skipped.
    pub async fn compile_all(&self, now: DateTime<Utc>) -> Result<Vec<CompiledBriefing>> {
        let users = self.users.list_active().await?;
        info!("Compiling briefings for {} active user(s)", users.len());

        let mut compiled = Vec::new();
        for user in &users {
            match self.compile_for_user(user, now).await {
                Ok(CompileOutcome::Compiled(briefing)) => compiled.push(briefing),
                Ok(_) => {}
                Err(e) => error!(user_id = user.id, "Failed to compile briefing for {}: {:#}", user.email, e),
            }
        }

        info!(compiled = compiled.len(), "Briefing compilation complete");
        Ok(compiled)
    }

    /// The day's briefings still in `compiled`, including those left behind by an
    /// interrupted earlier run.
    pub async fn awaiting_delivery(&self, now: DateTime<Utc>) -> Result<Vec<Briefing>> {
        self.briefings.list_compiled(now.date_naive()).await
    }
}
