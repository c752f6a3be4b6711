// Summarizer module
use anyhow::Result;
use tracing::debug;

use super::{prompt, LlmProvider, LlmRequest};
use crate::error::PipelineError;
use crate::models::Article;

/// Output cap for one article summary.
pub const SUMMARY_MAX_TOKENS: usize = 200;
pub const SUMMARY_TEMPERATURE: f32 = 0.3;

/// One summarization call. An empty or whitespace-only answer counts as a failure so the
/// caller's retry policy applies to it like any other upstream error.
pub async fn summarize_article<P: LlmProvider + ?Sized>(
    provider: &P,
    article: &Article,
    content: Option<&str>,
) -> Result<String> {
    let request = LlmRequest {
        system: Some(prompt::system_prompt().to_string()),
        prompt: prompt::user_prompt(article, content),
        max_tokens: Some(SUMMARY_MAX_TOKENS),
        temperature: Some(SUMMARY_TEMPERATURE),
        timeout_seconds: None,
    };

    let response = provider.generate(request).await?;
    let summary = response.content.trim();
    if summary.is_empty() {
        return Err(PipelineError::EmptySummary.into());
    }

    debug!(
        article_id = article.id,
        model = %response.model,
        tokens = response.usage.total_tokens,
        "summary generated"
    );
    Ok(summary.to_string())
}
