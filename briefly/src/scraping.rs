use anyhow::{Context, Result};
use reqwest::Client;
use scraper::{Html, Selector};
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on extracted text handed to the summarizer.
pub const MAX_CONTENT_LENGTH: usize = 5000;

/// URL -> readable page text. `None` on any failure; extraction never blocks the caller.
#[async_trait::async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, url: &str) -> Option<String>;
}

/// Fetches a page and extracts the main article text with readability, falling back to a
/// selector heuristic. Redirects are followed up to 10 hops and cookies set along the way are
/// replayed on later hops, which some publishers require before serving the article.
pub struct ReadabilityExtractor {
    client: Client,
}

impl ReadabilityExtractor {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("Mozilla/5.0 (compatible; Briefly/1.0)")
            .redirect(reqwest::redirect::Policy::limited(10))
            .cookie_store(true)
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self { client })
    }

    async fn scrape(&self, url: &str) -> Result<String> {
        let parsed = url::Url::parse(url).context("invalid article url")?;
        if !matches!(parsed.scheme(), "http" | "https") {
            anyhow::bail!("unsupported url scheme: {}", parsed.scheme());
        }

        let response = self
            .client
            .get(parsed)
            .header(reqwest::header::ACCEPT, "text/html")
            .send()
            .await
            .context("failed to fetch article page")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("article fetch failed with status: {}", status);
        }

        // Relative links resolve against the final URL after redirects
        let final_url = response.url().clone();
        let bytes = response.bytes().await.context("failed to read response body")?;

        let text = match readability::extractor::extract(&mut Cursor::new(bytes.as_ref()), &final_url) {
            Ok(product) if !product.text.trim().is_empty() => product.text,
            Ok(_) => selector_fallback(&String::from_utf8_lossy(&bytes)),
            Err(e) => {
                debug!("scraping: readability failed for {}: {}", url, e);
                selector_fallback(&String::from_utf8_lossy(&bytes))
            }
        };

        Ok(text)
    }
}

#[async_trait::async_trait]
impl ContentExtractor for ReadabilityExtractor {
    async fn extract(&self, url: &str) -> Option<String> {
        match self.scrape(url).await {
            Ok(text) => {
                let text = clamp_text(&text);
                if text.is_empty() {
                    None
                } else {
                    debug!("scraping: extracted {} chars from {}", text.len(), url);
                    Some(text)
                }
            }
            Err(e) => {
                warn!("Failed to extract article content from {}: {:#}", url, e);
                None
            }
        }
    }
}

/// Heuristic: try to find the main content
/// 1. <article> tag
/// 2. <main> tag
/// 3. common content containers, then all paragraphs
fn selector_fallback(html: &str) -> String {
    let document = Html::parse_document(html);

    let selectors = ["article", "main", ".post-content", ".entry-content", "#content"];
    for selector_str in selectors {
        if let Ok(selector) = Selector::parse(selector_str) {
            if let Some(element) = document.select(&selector).next() {
                let text = element.text().collect::<Vec<_>>().join(" ");
                if !text.trim().is_empty() {
                    return text;
                }
            }
        }
    }

    match Selector::parse("p") {
        Ok(p) => document
            .select(&p)
            .map(|el| el.text().collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>()
            .join("\n"),
        Err(_) => String::new(),
    }
}

/// Collapse whitespace and cap at [`MAX_CONTENT_LENGTH`] characters.
pub fn clamp_text(text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.chars().count() > MAX_CONTENT_LENGTH {
        let mut truncated: String = normalized.chars().take(MAX_CONTENT_LENGTH).collect();
        truncated.push_str("...");
        truncated
    } else {
        normalized
    }
}
