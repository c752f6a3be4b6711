use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

use crate::error::PipelineError;
use crate::models::RecentArticle;
use crate::storage::{ArticleRepository, Repositories};

/// Webhook protocol limit on embeds per message.
pub const MAX_EMBEDS_PER_MESSAGE: usize = 10;
/// Suppress push notifications for the article batches.
const SUPPRESS_NOTIFICATIONS: u32 = 4096;
const EMBED_COLOR: u32 = 0x3498db;

#[derive(Debug, Clone)]
pub struct DiscordOptions {
    pub pacing: std::time::Duration,
    pub batch_size: usize,
    pub limit: i64,
    pub group_by_topic: bool,
}

impl Default for DiscordOptions {
    fn default() -> Self {
        Self {
            pacing: std::time::Duration::from_millis(500),
            batch_size: MAX_EMBEDS_PER_MESSAGE,
            limit: 20,
            group_by_topic: false,
        }
    }
}

impl DiscordOptions {
    pub fn from_config(config: &common::DiscordConfig) -> Self {
        let defaults = Self::default();
        Self {
            pacing: config
                .pacing_ms
                .map(std::time::Duration::from_millis)
                .unwrap_or(defaults.pacing),
            batch_size: config
                .batch_size
                .unwrap_or(defaults.batch_size)
                .clamp(1, MAX_EMBEDS_PER_MESSAGE),
            limit: config.limit.unwrap_or(defaults.limit),
            group_by_topic: config.group_by_topic.unwrap_or(defaults.group_by_topic),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostSummary {
    pub posted: usize,
    pub failed_batches: usize,
}

/// Posts the last day's summarized articles to a chat webhook.
pub struct DiscordPoster {
    client: Client,
    webhook_url: Option<String>,
    articles: Arc<dyn ArticleRepository>,
    options: DiscordOptions,
}

impl DiscordPoster {
    pub fn new(
        client: Client,
        webhook_url: Option<String>,
        repos: &Repositories,
        options: DiscordOptions,
    ) -> Self {
        Self {
            client,
            webhook_url: webhook_url.filter(|u| !u.trim().is_empty()),
            articles: repos.articles.clone(),
            options,
        }
    }

    /// Post a header message, then the articles in batches. A missing destination fails
    /// before any query or request; a rejected header is fatal; a rejected batch is
    /// logged and skipped.
    pub async fn post_recent(&self, now: DateTime<Utc>) -> Result<PostSummary> {
        let webhook = self.webhook_url.as_deref().ok_or(PipelineError::MissingWebhook)?;

        let articles = self
            .articles
            .recent_completed(now - Duration::hours(24), self.options.limit)
            .await?;
        if articles.is_empty() {
            info!("No articles to post to Discord");
            return Ok(PostSummary::default());
        }

        let header = WebhookMessage {
            content: Some(format!(
                "📰 **Briefly** — {} — {} articles",
                now.format("%A, %B %-d, %Y"),
                articles.len()
            )),
            embeds: Vec::new(),
            flags: None,
        };
        let response = self
            .client
            .post(webhook)
            .json(&header)
            .send()
            .await
            .context("Discord webhook request failed")?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::WebhookRejected { status, body }.into());
        }

        let mut summary = PostSummary::default();
        for (content, batch) in self.batches(&articles) {
            tokio::time::sleep(self.options.pacing).await;

            let message = WebhookMessage {
                content,
                embeds: batch.iter().map(|a| Embed::from_article(a, now)).collect(),
                flags: Some(SUPPRESS_NOTIFICATIONS),
            };
            match self.client.post(webhook).json(&message).send().await {
                Ok(rsp) if rsp.status().is_success() => summary.posted += batch.len(),
                Ok(rsp) => {
                    let status = rsp.status();
                    let body = rsp.text().await.unwrap_or_default();
                    error!(%status, body = %body, articles = batch.len(), "Discord webhook rejected batch");
                    summary.failed_batches += 1;
                }
                Err(e) => {
                    error!(articles = batch.len(), "Discord webhook request failed: {}", e);
                    summary.failed_batches += 1;
                }
            }
        }

        info!(posted = summary.posted, failed_batches = summary.failed_batches, "Posted articles to Discord");
        Ok(summary)
    }

    /// Split into outbound messages. Grouped mode starts a new message per topic and
    /// labels it with the topic name.
    fn batches<'a>(&self, articles: &'a [RecentArticle]) -> Vec<(Option<String>, Vec<&'a RecentArticle>)> {
        let size = self.options.batch_size;
        if !self.options.group_by_topic {
            let all: Vec<&RecentArticle> = articles.iter().collect();
            return all.chunks(size).map(|c| (None, c.to_vec())).collect();
        }

        let mut groups: Vec<(&str, Vec<&RecentArticle>)> = Vec::new();
        for article in articles {
            let topic = article.topic_name.as_deref().unwrap_or("Other");
            match groups.iter_mut().find(|(name, _)| *name == topic) {
                Some((_, members)) => members.push(article),
                None => groups.push((topic, vec![article])),
            }
        }

        groups
            .into_iter()
            .flat_map(|(topic, members)| {
                members
                    .chunks(size)
                    .map(|c| (Some(format!("**{}**", topic)), c.to_vec()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[derive(Debug, Serialize)]
struct WebhookMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    embeds: Vec<Embed>,
    #[serde(skip_serializing_if = "Option::is_none")]
    flags: Option<u32>,
}

#[derive(Debug, Serialize)]
struct Embed {
    title: String,
    url: String,
    description: String,
    footer: EmbedFooter,
    timestamp: String,
    color: u32,
}

#[derive(Debug, Serialize)]
struct EmbedFooter {
    text: String,
}

impl Embed {
    fn from_article(article: &RecentArticle, now: DateTime<Utc>) -> Self {
        Self {
            title: truncate(&article.title, 256),
            url: article.url.clone(),
            description: truncate(&article.summary, 4096),
            footer: EmbedFooter {
                text: article.source_name.clone(),
            },
            timestamp: article.published_at.unwrap_or(now).to_rfc3339(),
            color: EMBED_COLOR,
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_limit() {
        let long = "x".repeat(300);
        let t = truncate(&long, 256);
        assert_eq!(t.chars().count(), 256);
        assert!(t.ends_with("..."));
        assert_eq!(truncate("short", 256), "short");
    }

    #[test]
    fn batch_size_is_clamped_to_protocol_limit() {
        let options = DiscordOptions::from_config(&common::DiscordConfig {
            batch_size: Some(25),
            ..Default::default()
        });
        assert_eq!(options.batch_size, MAX_EMBEDS_PER_MESSAGE);
    }
}
