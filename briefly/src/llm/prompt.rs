use crate::models::Article;

pub fn system_prompt() -> &'static str {
    "You are a news summarizer. Your job is to create concise, informative summaries of news articles.

Rules:
- Write the summary in the same language as the original article.
- Keep summaries to 2-3 sentences (max 100 words).
- Focus on the key facts: who, what, when, where, why.
- Be neutral and factual, no opinions or editorializing.
- If the article content is too short or unclear, summarize what is available."
}

/// Per-article prompt. `content` overrides the stored body when richer text was extracted.
pub fn user_prompt(article: &Article, content: Option<&str>) -> String {
    let mut prompt = format!("Title: {}\n", article.title);

    if let Some(author) = article.author.as_deref().filter(|a| !a.is_empty()) {
        prompt.push_str(&format!("Author: {}\n", author));
    }

    if let Some(body) = content.or(article.content.as_deref()).filter(|c| !c.trim().is_empty()) {
        prompt.push_str(&format!("Content: {}\n", body.trim()));
    }

    prompt.push_str("\nPlease provide a concise summary of this article.");
    prompt
}
