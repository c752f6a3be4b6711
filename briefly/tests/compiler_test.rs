mod support;

use briefly::compiler::{BriefingCompiler, CompileOutcome, CompilerLimits};
use briefly::models::{Subscription, User};
use briefly::storage::{Repositories, TopicRepository};
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use support::*;

struct Fixture {
    pool: SqlitePool,
    repos: briefly::storage::Repositories,
    user: User,
    tech_source: i64,
    news_source: i64,
    tech_topic: i64,
    news_topic: i64,
}

/// User subscribed to tech (priority 2) and news (priority 1), one source per topic.
async fn fixture() -> Fixture {
    let (pool, repos) = setup_test_db().await;
    let tech_topic = insert_topic(&pool, "tech", "Technology").await;
    let news_topic = insert_topic(&pool, "news", "World News").await;
    let tech_source = insert_source(&pool, "Tech Wire", "https://tech.example.com/rss").await;
    let news_source = insert_source(&pool, "News Wire", "https://news.example.com/rss").await;
    link_source_topic(&pool, tech_source, tech_topic).await;
    link_source_topic(&pool, news_source, news_topic).await;

    let user_id = insert_user(&pool, "u@example.com", Some("U")).await;
    subscribe(&pool, user_id, news_topic, 1).await;
    subscribe(&pool, user_id, tech_topic, 2).await;
    let user = repos.users.get(user_id).await.unwrap().unwrap();

    Fixture {
        pool,
        repos,
        user,
        tech_source,
        news_source,
        tech_topic,
        news_topic,
    }
}

async fn add_completed(pool: &SqlitePool, source_id: i64, prefix: &str, n: usize) {
    let now = Utc::now();
    for i in 0..n {
        let published = now - Duration::minutes(10 + i as i64);
        insert_article(pool, source_id, &format!("{prefix}-{i}"), "completed", Some(published)).await;
    }
}

#[tokio::test]
async fn priority_order_and_per_topic_cap() {
    let f = fixture().await;
    add_completed(&f.pool, f.tech_source, "tech", 6).await;
    add_completed(&f.pool, f.news_source, "news", 3).await;

    let compiler = BriefingCompiler::new(&f.repos, CompilerLimits::default());
    let outcome = compiler.compile_for_user(&f.user, Utc::now()).await.unwrap();

    let CompileOutcome::Compiled(briefing) = outcome else {
        panic!("expected a compiled briefing");
    };
    assert_eq!(briefing.article_count(), 8);
    assert_eq!(briefing.sections.len(), 2);
    assert_eq!(briefing.sections[0].topic.slug, "tech");
    assert_eq!(briefing.sections[0].articles.len(), 5);
    assert_eq!(briefing.sections[1].topic.slug, "news");
    assert_eq!(briefing.sections[1].articles.len(), 3);

    let rows: Vec<(i64, String, Option<i64>)> = sqlx::query_as(
        "SELECT position, topic_slug, topic_id FROM briefing_articles WHERE briefing_id = ? ORDER BY position",
    )
    .bind(briefing.briefing_id)
    .fetch_all(&f.pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 8);
    assert_eq!(rows.iter().map(|r| r.0).collect::<Vec<_>>(), (1..=8).collect::<Vec<_>>());
    assert!(rows[..5].iter().all(|r| r.1 == "tech" && r.2 == Some(f.tech_topic)));
    assert!(rows[5..].iter().all(|r| r.1 == "news" && r.2 == Some(f.news_topic)));

    let (status, count): (String, i64) =
        sqlx::query_as("SELECT status, article_count FROM briefings WHERE id = ?")
            .bind(briefing.briefing_id)
            .fetch_one(&f.pool)
            .await
            .unwrap();
    assert_eq!(status, "compiled");
    assert_eq!(count, 8);
}

#[tokio::test]
async fn global_cap_bounds_the_digest() {
    let f = fixture().await;
    add_completed(&f.pool, f.tech_source, "tech", 6).await;
    add_completed(&f.pool, f.news_source, "news", 6).await;

    let limits = CompilerLimits {
        max_total: 7,
        ..CompilerLimits::default()
    };
    let compiler = BriefingCompiler::new(&f.repos, limits);
    let CompileOutcome::Compiled(briefing) = compiler.compile_for_user(&f.user, Utc::now()).await.unwrap() else {
        panic!("expected a compiled briefing");
    };

    assert_eq!(briefing.article_count(), 7);
    assert_eq!(briefing.sections[0].articles.len(), 5);
    assert_eq!(briefing.sections[1].articles.len(), 2);
}

#[tokio::test]
async fn second_compile_writes_nothing() {
    let f = fixture().await;
    add_completed(&f.pool, f.tech_source, "tech", 2).await;

    let compiler = BriefingCompiler::new(&f.repos, CompilerLimits::default());
    let now = Utc::now();
    assert!(matches!(
        compiler.compile_for_user(&f.user, now).await.unwrap(),
        CompileOutcome::Compiled(_)
    ));
    let before: (String, Option<String>) = sqlx::query_as("SELECT status, compiled_at FROM briefings")
        .fetch_one(&f.pool)
        .await
        .unwrap();

    // new eligible articles arrive, but the day's briefing is already compiled
    add_completed(&f.pool, f.news_source, "news", 2).await;
    let again = compiler
        .compile_for_user(&f.user, now + Duration::seconds(1))
        .await
        .unwrap();

    assert!(matches!(again, CompileOutcome::AlreadyCompiled));
    assert_eq!(count(&f.pool, "briefings").await, 1);
    assert_eq!(count(&f.pool, "briefing_articles").await, 2);
    let after: (String, Option<String>) = sqlx::query_as("SELECT status, compiled_at FROM briefings")
        .fetch_one(&f.pool)
        .await
        .unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn only_recent_completed_articles_are_eligible() {
    let f = fixture().await;
    let now = Utc::now();
    insert_article(&f.pool, f.tech_source, "old", "completed", Some(now - Duration::hours(30))).await;
    insert_article(&f.pool, f.tech_source, "pending", "pending", Some(now)).await;
    insert_article(&f.pool, f.tech_source, "failed", "failed", Some(now)).await;

    let compiler = BriefingCompiler::new(&f.repos, CompilerLimits::default());
    let outcome = compiler.compile_for_user(&f.user, now).await.unwrap();

    assert!(matches!(outcome, CompileOutcome::NoArticles));
    assert_eq!(count(&f.pool, "briefings").await, 0);
}

#[tokio::test]
async fn pending_briefing_is_promoted_and_empty_run_leaves_it_alone() {
    let f = fixture().await;
    let today = Utc::now().date_naive();
    let pending_id: i64 = sqlx::query_scalar(
        "INSERT INTO briefings (user_id, briefing_date, status, created_at) VALUES (?, ?, 'pending', ?) RETURNING id",
    )
    .bind(f.user.id)
    .bind(today)
    .bind(Utc::now())
    .fetch_one(&f.pool)
    .await
    .unwrap();

    let compiler = BriefingCompiler::new(&f.repos, CompilerLimits::default());
    assert!(matches!(
        compiler.compile_for_user(&f.user, Utc::now()).await.unwrap(),
        CompileOutcome::NoArticles
    ));
    assert_eq!(briefing_status(&f.pool, pending_id).await, "pending");

    add_completed(&f.pool, f.news_source, "news", 1).await;
    let CompileOutcome::Compiled(briefing) = compiler.compile_for_user(&f.user, Utc::now()).await.unwrap() else {
        panic!("expected a compiled briefing");
    };
    assert_eq!(briefing.briefing_id, pending_id);
    assert_eq!(briefing_status(&f.pool, pending_id).await, "compiled");
}

#[tokio::test]
async fn article_is_claimed_by_the_first_topic_only() {
    let f = fixture().await;
    // the tech source also files under news
    link_source_topic(&f.pool, f.tech_source, f.news_topic).await;
    add_completed(&f.pool, f.tech_source, "tech", 2).await;

    let compiler = BriefingCompiler::new(&f.repos, CompilerLimits::default());
    let CompileOutcome::Compiled(briefing) = compiler.compile_for_user(&f.user, Utc::now()).await.unwrap() else {
        panic!("expected a compiled briefing");
    };

    assert_eq!(briefing.sections.len(), 1);
    assert_eq!(briefing.sections[0].topic.slug, "tech");
    assert_eq!(briefing.article_count(), 2);
}

#[tokio::test]
async fn compile_all_covers_active_users_only() {
    let f = fixture().await;
    add_completed(&f.pool, f.tech_source, "tech", 1).await;
    let inactive = insert_user(&f.pool, "gone@example.com", None).await;
    subscribe(&f.pool, inactive, f.tech_topic, 1).await;
    sqlx::query("UPDATE users SET active = 0 WHERE id = ?")
        .bind(inactive)
        .execute(&f.pool)
        .await
        .unwrap();
    insert_user(&f.pool, "nosubs@example.com", None).await;

    let compiler = BriefingCompiler::new(&f.repos, CompilerLimits::default());
    let compiled = compiler.compile_all(Utc::now()).await.unwrap();

    assert_eq!(compiled.len(), 1);
    assert_eq!(compiled[0].user_id, f.user.id);
    assert_eq!(count(&f.pool, "briefings").await, 1);
}

/// Topic repository that fails for one user and delegates otherwise.
struct BrokenSubscriptions {
    inner: Arc<dyn TopicRepository>,
    broken_user: i64,
}

#[async_trait::async_trait]
impl TopicRepository for BrokenSubscriptions {
    async fn subscriptions_for_user(&self, user_id: i64) -> anyhow::Result<Vec<Subscription>> {
        if user_id == self.broken_user {
            anyhow::bail!("database is locked");
        }
        self.inner.subscriptions_for_user(user_id).await
    }
}

#[tokio::test]
async fn one_failing_user_does_not_stop_the_others() {
    let f = fixture().await;
    add_completed(&f.pool, f.tech_source, "tech", 2).await;
    let other = insert_user(&f.pool, "other@example.com", None).await;
    subscribe(&f.pool, other, f.tech_topic, 1).await;

    let repos = Repositories {
        topics: Arc::new(BrokenSubscriptions {
            inner: f.repos.topics.clone(),
            broken_user: f.user.id,
        }),
        ..f.repos.clone()
    };
    let compiler = BriefingCompiler::new(&repos, CompilerLimits::default());
    let compiled = compiler.compile_all(Utc::now()).await.unwrap();

    assert_eq!(compiled.len(), 1);
    assert_eq!(compiled[0].user_id, other);
    assert_eq!(compiled[0].article_count(), 2);
    let owners: Vec<i64> = sqlx::query_scalar("SELECT user_id FROM briefings")
        .fetch_all(&f.pool)
        .await
        .unwrap();
    assert_eq!(owners, vec![other]);
}
