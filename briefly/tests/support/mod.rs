#![allow(dead_code)]

use anyhow::Result;
use briefly::delivery::{Mailer, OutgoingEmail};
use briefly::llm::{LlmProvider, LlmRequest, LlmResponse, UsageMetadata};
use briefly::storage::Repositories;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

/// In-memory database with the schema applied.
pub async fn setup_test_db() -> (SqlitePool, Repositories) {
    let pool = ::common::init_memory_pool().await.expect("init pool");
    let repos = Repositories::sqlite(pool.clone());
    (pool, repos)
}

pub async fn insert_source(pool: &SqlitePool, name: &str, feed_url: &str) -> i64 {
    sqlx::query_scalar("INSERT INTO sources (name, feed_url, created_at) VALUES (?, ?, ?) RETURNING id")
        .bind(name)
        .bind(feed_url)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
        .expect("insert source")
}

pub async fn insert_topic(pool: &SqlitePool, slug: &str, name: &str) -> i64 {
    sqlx::query_scalar("INSERT INTO topics (name, slug) VALUES (?, ?) RETURNING id")
        .bind(name)
        .bind(slug)
        .fetch_one(pool)
        .await
        .expect("insert topic")
}

pub async fn link_source_topic(pool: &SqlitePool, source_id: i64, topic_id: i64) {
    sqlx::query("INSERT INTO source_topics (source_id, topic_id) VALUES (?, ?)")
        .bind(source_id)
        .bind(topic_id)
        .execute(pool)
        .await
        .expect("link source to topic");
}

pub async fn insert_user(pool: &SqlitePool, email: &str, name: Option<&str>) -> i64 {
    sqlx::query_scalar("INSERT INTO users (email, name, created_at) VALUES (?, ?, ?) RETURNING id")
        .bind(email)
        .bind(name)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
        .expect("insert user")
}

pub async fn subscribe(pool: &SqlitePool, user_id: i64, topic_id: i64, priority: i64) {
    sqlx::query("INSERT INTO user_topics (user_id, topic_id, priority) VALUES (?, ?, ?)")
        .bind(user_id)
        .bind(topic_id)
        .bind(priority)
        .execute(pool)
        .await
        .expect("subscribe user");
}

pub async fn insert_article(
    pool: &SqlitePool,
    source_id: i64,
    guid: &str,
    status: &str,
    published_at: Option<DateTime<Utc>>,
) -> i64 {
    let summary = (status == "completed").then(|| format!("Summary of {guid}"));
    sqlx::query_scalar(
        r#"
        INSERT INTO articles (source_id, guid, title, url, content, published_at, summary, summary_status, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(source_id)
    .bind(guid)
    .bind(format!("Article {guid}"))
    .bind(format!("https://example.com/{guid}"))
    .bind("Stored feed body")
    .bind(published_at)
    .bind(summary)
    .bind(status)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .expect("insert article")
}

pub async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .expect("count rows")
}

pub async fn article_status(pool: &SqlitePool, id: i64) -> String {
    sqlx::query_scalar("SELECT summary_status FROM articles WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("article status")
}

pub async fn briefing_status(pool: &SqlitePool, id: i64) -> String {
    sqlx::query_scalar("SELECT status FROM briefings WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("briefing status")
}

/// LLM double answering from a script; once the script runs out every call succeeds.
#[derive(Default)]
pub struct ScriptedLlm {
    script: Mutex<VecDeque<Result<String, String>>>,
    pub calls: Mutex<Vec<Instant>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new(script: Vec<Result<&str, &str>>) -> Self {
        Self {
            script: Mutex::new(
                script
                    .into_iter()
                    .map(|r| r.map(str::to_string).map_err(str::to_string))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedLlm {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse> {
        self.calls.lock().unwrap().push(Instant::now());
        self.prompts.lock().unwrap().push(request.prompt.clone());

        let next = self.script.lock().unwrap().pop_front();
        match next.unwrap_or_else(|| Ok("A generated summary.".to_string())) {
            Ok(content) => Ok(LlmResponse {
                content,
                usage: UsageMetadata::default(),
                model: "scripted".to_string(),
            }),
            Err(message) => Err(anyhow::anyhow!(message)),
        }
    }
}

/// Mail transport double that records messages, or refuses them all.
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<OutgoingEmail>>,
    pub fail: bool,
}

impl RecordingMailer {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<()> {
        if self.fail {
            anyhow::bail!("smtp connection refused");
        }
        self.sent.lock().unwrap().push(email);
        Ok(())
    }
}

pub fn rss(items: &[(&str, &str)]) -> String {
    let mut body = String::from(r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Feed</title>"#);
    for (guid, title) in items {
        body.push_str(&format!(
            r#"<item><title>{title}</title><link>https://example.com/{guid}</link><guid isPermaLink="false">{guid}</guid><description>Body of {guid}</description></item>"#
        ));
    }
    body.push_str("</channel></rss>");
    body
}
