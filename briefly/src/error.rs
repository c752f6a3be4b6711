//! Failures callers need to tell apart. Everything else travels as a plain `anyhow::Error`
//! with context; these variants are recovered with `downcast_ref`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// No chat webhook destination configured. Fatal, never retried.
    #[error("chat webhook destination is not configured (set discord.webhook_url)")]
    MissingWebhook,

    /// The chat webhook refused the header message. Fatal for the whole post.
    #[error("chat webhook rejected the header message ({status}): {body}")]
    WebhookRejected { status: u16, body: String },

    /// The LLM answered without any text. Transient, retried by the enrichment worker.
    #[error("summarization returned an empty response")]
    EmptySummary,

    #[error("source not found: {0}")]
    SourceNotFound(i64),

    #[error("briefing not found: {0}")]
    BriefingNotFound(i64),

    #[error("user not found: {0}")]
    UserNotFound(i64),
}

impl PipelineError {
    /// Configuration problems abort immediately instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::MissingWebhook | PipelineError::WebhookRejected { .. })
    }
}
