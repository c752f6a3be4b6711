mod support;

use anyhow::Result;
use briefly::llm::{LlmProvider, LlmRequest, LlmResponse, UsageMetadata};
use briefly::models::SummaryStatus;
use briefly::processing::{Enricher, RetryPolicy};
use briefly::scraping::ContentExtractor;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::*;

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(50),
        pacing: Duration::ZERO,
    }
}

async fn pending_article(pool: &SqlitePool, guid: &str) -> (i64, briefly::models::Article) {
    let source_id = match sqlx::query_scalar::<_, i64>("SELECT id FROM sources LIMIT 1")
        .fetch_optional(pool)
        .await
        .unwrap()
    {
        Some(id) => id,
        None => insert_source(pool, "Wire", "https://example.com/feed.xml").await,
    };
    let id = insert_article(pool, source_id, guid, "pending", Some(Utc::now())).await;
    let article = sqlx::query_as::<_, briefly::models::Article>(
        "SELECT id, source_id, guid, title, url, author, content, content_hash, published_at, \
         summary, summary_status, created_at FROM articles WHERE id = ?",
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .unwrap();
    (id, article)
}

#[tokio::test]
async fn two_failures_then_success_ends_completed_with_doubling_backoff() {
    let (pool, repos) = setup_test_db().await;
    let (id, article) = pending_article(&pool, "a").await;
    let llm = Arc::new(ScriptedLlm::new(vec![
        Err("rate limited"),
        Err("rate limited"),
        Ok("Markets rallied on Tuesday."),
    ]));

    let enricher = Enricher::new(&repos, llm.clone(), None, fast_policy(3));
    let status = enricher.summarize_article(&article).await.unwrap();

    assert_eq!(status, SummaryStatus::Completed);
    assert_eq!(article_status(&pool, id).await, "completed");
    let summary: Option<String> = sqlx::query_scalar("SELECT summary FROM articles WHERE id = ?")
        .bind(id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(summary.as_deref(), Some("Markets rallied on Tuesday."));

    let calls = llm.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 3);
    assert!(calls[1] - calls[0] >= Duration::from_millis(50));
    assert!(calls[2] - calls[1] >= Duration::from_millis(100));
}

#[tokio::test]
async fn exhausted_retries_end_failed() {
    let (pool, repos) = setup_test_db().await;
    let (id, article) = pending_article(&pool, "a").await;
    let llm = Arc::new(ScriptedLlm::new(vec![Err("down"), Err("down"), Err("down"), Ok("late")]));

    let enricher = Enricher::new(&repos, llm.clone(), None, fast_policy(3));
    let status = enricher.summarize_article(&article).await.unwrap();

    assert_eq!(status, SummaryStatus::Failed);
    assert_eq!(article_status(&pool, id).await, "failed");
    assert_eq!(llm.call_count(), 3);

    // failed is terminal: a second pass does not pick it up again
    let again = enricher.summarize_article(&article).await.unwrap();
    assert_eq!(again, SummaryStatus::Failed);
    assert_eq!(llm.call_count(), 3);
}

#[tokio::test]
async fn empty_answer_is_retried() {
    let (pool, repos) = setup_test_db().await;
    let (id, article) = pending_article(&pool, "a").await;
    let llm = Arc::new(ScriptedLlm::new(vec![Ok("   "), Ok("A real summary.")]));

    let enricher = Enricher::new(&repos, llm.clone(), None, fast_policy(3));
    assert_eq!(enricher.summarize_article(&article).await.unwrap(), SummaryStatus::Completed);
    assert_eq!(llm.call_count(), 2);
    assert_eq!(article_status(&pool, id).await, "completed");
}

/// Records the article's stored status at the moment the summarizer is called.
struct StatusSpy {
    pool: SqlitePool,
    article_id: i64,
    seen: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl LlmProvider for StatusSpy {
    async fn generate(&self, _request: LlmRequest) -> Result<LlmResponse> {
        let status = article_status(&self.pool, self.article_id).await;
        self.seen.lock().unwrap().push(status);
        Ok(LlmResponse {
            content: "Summary.".to_string(),
            usage: UsageMetadata::default(),
            model: "spy".to_string(),
        })
    }
}

#[tokio::test]
async fn article_is_claimed_before_the_external_call() {
    let (pool, repos) = setup_test_db().await;
    let (id, article) = pending_article(&pool, "a").await;
    let spy = Arc::new(StatusSpy {
        pool: pool.clone(),
        article_id: id,
        seen: Mutex::new(Vec::new()),
    });

    let enricher = Enricher::new(&repos, spy.clone(), None, fast_policy(3));
    enricher.summarize_article(&article).await.unwrap();

    assert_eq!(*spy.seen.lock().unwrap(), vec!["processing".to_string()]);
    assert_eq!(article_status(&pool, id).await, "completed");
}

struct FixedExtractor(Option<&'static str>);

#[async_trait::async_trait]
impl ContentExtractor for FixedExtractor {
    async fn extract(&self, _url: &str) -> Option<String> {
        self.0.map(str::to_string)
    }
}

#[tokio::test]
async fn extracted_page_text_enriches_the_prompt() {
    let (pool, repos) = setup_test_db().await;
    let (id, article) = pending_article(&pool, "a").await;
    let llm = Arc::new(ScriptedLlm::default());

    let extractor: Arc<dyn ContentExtractor> = Arc::new(FixedExtractor(Some("Full page text from the site")));
    let enricher = Enricher::new(&repos, llm.clone(), Some(extractor), fast_policy(3));
    enricher.summarize_article(&article).await.unwrap();

    let prompts = llm.prompts.lock().unwrap().clone();
    assert!(prompts[0].contains("Full page text from the site"));
    let content: Option<String> = sqlx::query_scalar("SELECT content FROM articles WHERE id = ?")
        .bind(id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(content.as_deref(), Some("Full page text from the site"));
}

#[tokio::test]
async fn extraction_failure_falls_back_to_stored_content() {
    let (pool, repos) = setup_test_db().await;
    let (id, article) = pending_article(&pool, "a").await;
    let llm = Arc::new(ScriptedLlm::default());

    let extractor: Arc<dyn ContentExtractor> = Arc::new(FixedExtractor(None));
    let enricher = Enricher::new(&repos, llm.clone(), Some(extractor), fast_policy(3));
    assert_eq!(enricher.summarize_article(&article).await.unwrap(), SummaryStatus::Completed);

    let prompts = llm.prompts.lock().unwrap().clone();
    assert!(prompts[0].contains("Stored feed body"));
    assert_eq!(article_status(&pool, id).await, "completed");
}

#[tokio::test]
async fn batch_runs_oldest_first_and_isolates_failures() {
    let (pool, repos) = setup_test_db().await;
    let (first_id, _) = pending_article(&pool, "older").await;
    let (second_id, _) = pending_article(&pool, "newer").await;
    let source_id: i64 = sqlx::query_scalar("SELECT id FROM sources LIMIT 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    let done = insert_article(&pool, source_id, "done", "completed", None).await;

    // every attempt for the first article fails, the second succeeds at once
    let llm = Arc::new(ScriptedLlm::new(vec![Err("boom"), Err("boom")]));
    let enricher = Enricher::new(&repos, llm.clone(), None, fast_policy(2));
    let stats = enricher.summarize_pending().await.unwrap();

    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(article_status(&pool, first_id).await, "failed");
    assert_eq!(article_status(&pool, second_id).await, "completed");
    assert_eq!(article_status(&pool, done).await, "completed");
    assert_eq!(llm.call_count(), 3);
}
