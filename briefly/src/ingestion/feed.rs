use feed_rs::model::{Entry, Feed};
use feed_rs::parser::{self, ParseFeedResult};
use scraper::Html;
use sha2::{Digest, Sha256};

use crate::models::NewArticle;

/// Parse a feed document. Entries without a guid take their first link as id, so a
/// headline edit does not turn the same link into a new article.
pub fn parse_feed(bytes: &[u8]) -> ParseFeedResult<Feed> {
    parser::Builder::new()
        .id_generator(|links, _, _| {
            links
                .first()
                .map(|l| l.href.trim().to_string())
                .unwrap_or_default()
        })
        .build()
        .parse(bytes)
}

/// Map one parsed feed entry to an article row. Entries without a title or a link are
/// rejected; the caller counts them as skipped.
pub fn article_from_entry(source_id: i64, entry: &Entry) -> Option<NewArticle> {
    let title = entry
        .title
        .as_ref()
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty())?;
    let url = entry
        .links
        .first()
        .map(|l| l.href.trim().to_string())
        .filter(|u| !u.is_empty())?;

    let raw = entry
        .content
        .as_ref()
        .and_then(|c| c.body.clone())
        .or_else(|| entry.summary.as_ref().map(|s| s.content.clone()))
        .filter(|c| !c.trim().is_empty());

    let guid = if entry.id.trim().is_empty() {
        url.clone()
    } else {
        entry.id.trim().to_string()
    };

    Some(NewArticle {
        source_id,
        guid,
        title,
        url,
        author: entry
            .authors
            .first()
            .map(|p| p.name.trim().to_string())
            .filter(|n| !n.is_empty()),
        content_hash: raw.as_deref().map(fingerprint),
        content: raw.as_deref().map(plain_text),
        published_at: entry.published.or(entry.updated),
    })
}

/// SHA-256 of the raw entry body, hex encoded.
pub fn fingerprint(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Strip markup from an entry body and collapse whitespace.
fn plain_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let text = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
