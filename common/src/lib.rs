/*!
common/src/lib.rs

Shared configuration types and DB helper functions for Briefly.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader that merges a default and an override config file
- Helpers to initialize and migrate an SQLite database
- Idempotent synchronization of the configured catalog (topics, sources, users)
*/

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/briefly.db")
    pub path: String,
}

/// Cron producers and worker pool settings.
///
/// Cron expressions use the 6-field form (seconds first) and are evaluated in UTC.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: Option<bool>,
    pub ingestion: Option<String>,
    pub compilation: Option<String>,
    pub maintenance: Option<String>,
    /// Worker pool size per queue
    pub concurrency: Option<usize>,
    /// Deliveries per job before it is dropped as failed
    pub max_attempts: Option<u32>,
    pub retry_delay_seconds: Option<u64>,
}

impl SchedulerConfig {
    pub fn ingestion_cron(&self) -> &str {
        self.ingestion.as_deref().unwrap_or("0 0 */2 * * *")
    }

    pub fn compilation_cron(&self) -> &str {
        self.compilation.as_deref().unwrap_or("0 0 6 * * *")
    }

    pub fn maintenance_cron(&self) -> &str {
        self.maintenance.as_deref().unwrap_or("0 0 3 * * Sun")
    }
}

/// Feed fetching configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchConfig {
    pub timeout_seconds: Option<u64>,
    pub user_agent: Option<String>,
}

/// Remote LLM config (OpenAI-compatible chat completions endpoint)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
}

/// Enrichment retry and pacing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub pacing_ms: Option<u64>,
    pub extract_content: Option<bool>,
}

/// Digest selection quotas
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompilerConfig {
    pub max_per_topic: Option<usize>,
    pub max_total: Option<usize>,
    pub window_hours: Option<i64>,
}

/// SMTP transport settings. Credentials are read from the named env vars.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    /// "starttls", "tls" or "none"
    pub tls: Option<String>,
    pub username_env: Option<String>,
    pub password_env: Option<String>,
    pub from: Option<String>,
    pub app_url: Option<String>,
}

/// Chat webhook delivery
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub webhook_url: Option<String>,
    pub pacing_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub limit: Option<i64>,
    pub group_by_topic: Option<bool>,
}

/// Retention windows used by the maintenance sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub article_days: Option<i64>,
    pub briefing_days: Option<i64>,
}

/// Topic seed entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Source seed entry; `topics` lists topic slugs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub feed_url: String,
    pub site_url: Option<String>,
    pub active: Option<bool>,
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub topic: String,
    #[serde(default)]
    pub priority: i64,
}

/// Per-user configuration (users are defined in the global config file)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub email: String,
    pub name: Option<String>,
    pub active: Option<bool>,
    #[serde(default)]
    pub topics: Vec<SubscriptionConfig>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub compiler: CompilerConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub topics: Vec<TopicConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        Ok(cfg)
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Run SQL migrations using sqlx's migration macro.
/// Migrations live in the `migrations` directory at the workspace root and are embedded
/// into the binary at compile time.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("../migrations")
        .run(pool)
        .await
        .context("Failed to run sqlx migrations")?;

    Ok(())
}

/// Initialize an SQLite connection pool.
///
/// This function will create the parent directory if necessary and return a configured
/// `SqlitePool` in WAL mode with foreign keys enforced. Pool size is kept modest:
/// workers run with concurrency 1 per queue, so five connections are plenty.
///
/// Example:
///   let pool = init_db_pool("data/briefly.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}

/// In-memory database with the schema applied. Every connection to `sqlite::memory:` opens a
/// fresh database, so the pool is pinned to a single connection that is never recycled.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .context("Failed to open in-memory sqlite database")?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Ensure that the topics, sources and users defined in the configuration are present in the
/// store. Safe to call on every start:
///  - INSERT OR IGNORE on the natural keys (topic slug, feed url, user email)
///  - UPDATE descriptive fields when the config provides them
///  - link sources to topics and users to topics (priority updated in place)
/// Unknown topic slugs referenced by sources or users are logged and skipped.
pub async fn sync_catalog(config: &Config, pool: &SqlitePool) -> Result<()> {
    let now = Utc::now();

    for t in &config.topics {
        let keywords = serde_json::to_string(&t.keywords).context("failed to encode keywords")?;
        sqlx::query(
            "INSERT OR IGNORE INTO topics (name, slug, description, keywords_json) VALUES (?, ?, ?, ?)",
        )
        .bind(&t.name)
        .bind(&t.slug)
        .bind(t.description.clone())
        .bind(&keywords)
        .execute(pool)
        .await
        .with_context(|| format!("failed to insert or ignore topic {}", t.slug))?;

        sqlx::query(
            "UPDATE topics SET name = ?, description = COALESCE(?, description), keywords_json = ? WHERE slug = ?",
        )
        .bind(&t.name)
        .bind(t.description.clone())
        .bind(&keywords)
        .bind(&t.slug)
        .execute(pool)
        .await
        .with_context(|| format!("failed to update topic {}", t.slug))?;
    }

    for s in &config.sources {
        sqlx::query(
            "INSERT OR IGNORE INTO sources (name, feed_url, site_url, active, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&s.name)
        .bind(&s.feed_url)
        .bind(s.site_url.clone())
        .bind(s.active.unwrap_or(true))
        .bind(now)
        .execute(pool)
        .await
        .with_context(|| format!("failed to insert or ignore source {}", s.feed_url))?;

        sqlx::query("UPDATE sources SET name = ?, active = COALESCE(?, active) WHERE feed_url = ?")
            .bind(&s.name)
            .bind(s.active)
            .bind(&s.feed_url)
            .execute(pool)
            .await
            .with_context(|| format!("failed to update source {}", s.feed_url))?;

        for slug in &s.topics {
            let linked = sqlx::query(
                r#"
                INSERT OR IGNORE INTO source_topics (source_id, topic_id)
                SELECT s.id, t.id FROM sources s, topics t WHERE s.feed_url = ? AND t.slug = ?
                "#,
            )
            .bind(&s.feed_url)
            .bind(slug)
            .execute(pool)
            .await
            .with_context(|| format!("failed to link source {} to topic {}", s.feed_url, slug))?;
            if linked.rows_affected() == 0 && !topic_exists(pool, slug).await? {
                tracing::warn!(source = %s.feed_url, topic = %slug, "unknown topic referenced by source");
            }
        }
    }

    for u in &config.users {
        sqlx::query("INSERT OR IGNORE INTO users (email, name, active, created_at) VALUES (?, ?, ?, ?)")
            .bind(&u.email)
            .bind(u.name.clone())
            .bind(u.active.unwrap_or(true))
            .bind(now)
            .execute(pool)
            .await
            .with_context(|| format!("failed to insert or ignore user {}", u.email))?;

        // COALESCE keeps existing values if None provided
        sqlx::query("UPDATE users SET name = COALESCE(?, name), active = COALESCE(?, active) WHERE email = ?")
            .bind(u.name.clone())
            .bind(u.active)
            .bind(&u.email)
            .execute(pool)
            .await
            .with_context(|| format!("failed to update user {}", u.email))?;

        for sub in &u.topics {
            let linked = sqlx::query(
                r#"
                INSERT INTO user_topics (user_id, topic_id, priority)
                SELECT u.id, t.id, ? FROM users u, topics t WHERE u.email = ? AND t.slug = ?
                ON CONFLICT(user_id, topic_id) DO UPDATE SET priority = excluded.priority
                "#,
            )
            .bind(sub.priority)
            .bind(&u.email)
            .bind(&sub.topic)
            .execute(pool)
            .await
            .with_context(|| format!("failed to subscribe user {} to topic {}", u.email, sub.topic))?;
            if linked.rows_affected() == 0 {
                tracing::warn!(user = %u.email, topic = %sub.topic, "unknown topic referenced by user");
            }
        }
    }

    Ok(())
}

async fn topic_exists(pool: &SqlitePool, slug: &str) -> Result<bool> {
    let found = sqlx::query_scalar::<_, i64>("SELECT id FROM topics WHERE slug = ?")
        .bind(slug)
        .fetch_optional(pool)
        .await
        .context("failed to look up topic")?;
    Ok(found.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [database]
        path = "data/test.db"

        [[topics]]
        slug = "tech"
        name = "Technology"
        keywords = ["ai", "software"]

        [[sources]]
        name = "Example"
        feed_url = "https://example.com/feed.xml"
        topics = ["tech", "missing"]

        [[users]]
        email = "alice@example.com"
        name = "Alice"
        topics = [{ topic = "tech", priority = 2 }]
    "#;

    #[test]
    fn config_defaults_apply_to_missing_sections() {
        let cfg: Config = toml::from_str(MINIMAL).expect("parse config");
        assert_eq!(cfg.scheduler.ingestion_cron(), "0 0 */2 * * *");
        assert_eq!(cfg.scheduler.compilation_cron(), "0 0 6 * * *");
        assert!(cfg.discord.webhook_url.is_none());
        assert_eq!(cfg.users[0].topics[0].priority, 2);
    }

    #[tokio::test]
    async fn override_file_wins_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let default_path = dir.path().join("config.default.toml");
        let override_path = dir.path().join("config.toml");
        tokio::fs::write(&default_path, MINIMAL).await.expect("write default");
        tokio::fs::write(
            &override_path,
            "[database]\npath = \"data/override.db\"\n[compiler]\nmax_total = 10\n",
        )
        .await
        .expect("write override");

        let cfg = Config::load_with_defaults(Some(&default_path), Some(&override_path))
            .await
            .expect("load config");
        assert_eq!(cfg.database.path, "data/override.db");
        assert_eq!(cfg.compiler.max_total, Some(10));
        assert_eq!(cfg.topics.len(), 1);
    }

    #[tokio::test]
    async fn file_pool_and_catalog_sync_are_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("briefly.db");
        let pool = init_db_pool(&db_path.to_string_lossy()).await.expect("init pool");
        run_migrations(&pool).await.expect("migrate");

        let cfg: Config = toml::from_str(MINIMAL).expect("parse config");
        sync_catalog(&cfg, &pool).await.expect("first sync");
        sync_catalog(&cfg, &pool).await.expect("second sync");

        let topics: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM topics")
            .fetch_one(&pool)
            .await
            .expect("count topics");
        let links: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM source_topics")
            .fetch_one(&pool)
            .await
            .expect("count links");
        let priority: i64 = sqlx::query_scalar("SELECT priority FROM user_topics")
            .fetch_one(&pool)
            .await
            .expect("priority");
        assert_eq!(topics, 1);
        assert_eq!(links, 1);
        assert_eq!(priority, 2);
    }
}
