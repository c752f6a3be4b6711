//! Job orchestration: queue names, job kinds and the at-least-once queue contract.
//!
//! Every handler may run more than once for the same job, so each one is written to be
//! safe under redelivery (dedup insert, idempotent compile, compiled-only delivery).

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod handlers;
pub mod queue;
pub mod scheduler;

pub use handlers::PipelineHandler;
pub use queue::{LocalQueue, QueueOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Ingestion,
    Enrichment,
    Compilation,
    Maintenance,
    Delivery,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::Ingestion,
        QueueName::Enrichment,
        QueueName::Compilation,
        QueueName::Maintenance,
        QueueName::Delivery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Ingestion => "ingestion",
            QueueName::Enrichment => "enrichment",
            QueueName::Compilation => "compilation",
            QueueName::Maintenance => "maintenance",
            QueueName::Delivery => "delivery",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    #[serde(rename = "ingestion:fetchArticles")]
    FetchArticles,
    #[serde(rename = "enrichment:summarizeArticles")]
    SummarizeArticles,
    #[serde(rename = "compilation:compileBriefings")]
    CompileBriefings,
    #[serde(rename = "maintenance:cleanup")]
    Cleanup,
    #[serde(rename = "delivery:sendBriefing")]
    SendBriefing,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::FetchArticles => "ingestion:fetchArticles",
            JobKind::SummarizeArticles => "enrichment:summarizeArticles",
            JobKind::CompileBriefings => "compilation:compileBriefings",
            JobKind::Cleanup => "maintenance:cleanup",
            JobKind::SendBriefing => "delivery:sendBriefing",
        }
    }

    pub fn queue(&self) -> QueueName {
        match self {
            JobKind::FetchArticles => QueueName::Ingestion,
            JobKind::SummarizeArticles => QueueName::Enrichment,
            JobKind::CompileBriefings => QueueName::Compilation,
            JobKind::Cleanup => QueueName::Maintenance,
            JobKind::SendBriefing => QueueName::Delivery,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier-only job data. Which fields are meaningful depends on the kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub briefing_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

impl JobPayload {
    pub fn source(source_id: i64) -> Self {
        Self {
            source_id: Some(source_id),
            ..Default::default()
        }
    }

    pub fn briefing(briefing_id: i64, user_id: i64) -> Self {
        Self {
            briefing_id: Some(briefing_id),
            user_id: Some(user_id),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub payload: JobPayload,
    /// 1 on first delivery
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(kind: JobKind, payload: JobPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            attempt: 1,
            enqueued_at: Utc::now(),
        }
    }
}

/// At-least-once task queue.
#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, kind: JobKind, payload: JobPayload) -> Result<Uuid>;
}

/// Executes one job. Must tolerate being called again for the same job.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<()>;
}
