use chrono::{Duration, Utc};
use sqlx::SqlitePool;

use feedbridge::entries::{ensure_entries_schema, EntrySource, SqlEntrySource};

async fn setup_entries() -> SqlitePool {
    let db_path = std::env::temp_dir().join(format!("entries_test_{}.sqlite", uuid::Uuid::new_v4()));
    let pool = common::init_db_pool(&db_path.to_string_lossy())
        .await
        .expect("init pool");
    ensure_entries_schema(&pool).await.expect("ensure schema");
    pool
}

async fn seed_entry(pool: &SqlitePool, title: &str, link: &str, age_hours: i64) {
    let when = Utc::now() - Duration::hours(age_hours);
    sqlx::query(
        "INSERT INTO entries (title, link, content, author, date_entered, date_updated) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(title)
    .bind(link)
    .bind(format!("<p>content of {}</p>", title))
    .bind(Option::<String>::None)
    .bind(when)
    .bind(when)
    .execute(pool)
    .await
    .expect("seed entry");
}

#[tokio::test]
async fn list_entries_orders_newest_first() {
    let pool = setup_entries().await;
    seed_entry(&pool, "Older", "http://x/old", 48).await;
    seed_entry(&pool, "Newer", "http://x/new", 1).await;

    let source = SqlEntrySource::new(pool);
    let entries = source.list_entries().await.expect("list");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].title, "Newer");
    assert_eq!(entries[1].title, "Older");
    assert_eq!(entries[0].content, "<p>content of Newer</p>");
}

#[tokio::test]
async fn find_by_title_is_exact_match() {
    let pool = setup_entries().await;
    seed_entry(&pool, "Exact", "http://x/e", 1).await;

    let source = SqlEntrySource::new(pool);
    let hit = source.find_by_title("Exact").await.expect("lookup");
    assert_eq!(hit.expect("entry").link, "http://x/e");

    let miss = source.find_by_title("exact").await.expect("lookup");
    assert!(miss.is_none());
    let missing = source.find_by_title("Nope").await.expect("lookup");
    assert!(missing.is_none());
}
