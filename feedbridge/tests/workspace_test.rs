use mockito::Matcher;
use serde_json::json;

use feedbridge::ledger::{LedgerRecord, SourceKind};
use feedbridge::workspace::{DocumentStore, HttpDocumentStore};

fn store(server: &mockito::ServerGuard) -> HttpDocumentStore {
    HttpDocumentStore::new(&server.url(), "test-token", "db1", 5).expect("build store")
}

fn sample_record(title: &str, content: &str) -> LedgerRecord {
    LedgerRecord {
        id: 1,
        feed_entry_id: Some(10),
        document_page_id: None,
        title: title.to_string(),
        content: content.to_string(),
        category: Some("technology".to_string()),
        tag: Some(r#"["rust"]"#.to_string()),
        summary: Some("a summary".to_string()),
        rationale: Some("matters because".to_string()),
        link: "http://x/a".to_string(),
        published: None,
        updated: None,
        source: SourceKind::Feed,
        pushed: false,
        last_push: None,
    }
}

#[tokio::test]
async fn list_pages_follows_the_cursor() {
    let mut server = mockito::Server::new_async().await;

    let first = server
        .mock("POST", "/databases/db1/query")
        .match_body(Matcher::Json(json!({})))
        .with_status(200)
        .with_body(
            json!({
                "results": [ {
                    "id": "p1",
                    "properties": {
                        "Name": { "title": [ { "plain_text": "First" } ] },
                        "URL": { "url": "http://x/1" }
                    }
                } ],
                "has_more": true,
                "next_cursor": "c2"
            })
            .to_string(),
        )
        .create_async()
        .await;
    let second = server
        .mock("POST", "/databases/db1/query")
        .match_body(Matcher::Json(json!({ "start_cursor": "c2" })))
        .with_status(200)
        .with_body(
            json!({
                "results": [ {
                    "id": "p2",
                    "properties": {
                        "Name": { "title": [ { "plain_text": "Second" } ] },
                        "URL": { "url": "http://x/2" }
                    }
                } ],
                "has_more": false,
                "next_cursor": null
            })
            .to_string(),
        )
        .create_async()
        .await;

    let pages = store(&server).list_pages().await.expect("list pages");
    assert_eq!(pages.len(), 2);
    assert_eq!(pages[0].id, "p1");
    assert_eq!(pages[0].title, "First");
    assert_eq!(pages[1].id, "p2");
    assert!(pages[1].content.is_empty(), "listing never carries bodies");
    first.assert_async().await;
    second.assert_async().await;
}

#[tokio::test]
async fn list_pages_surfaces_store_errors() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("POST", "/databases/db1/query")
        .with_status(401)
        .create_async()
        .await;

    let result = store(&server).list_pages().await;
    assert!(result.is_err());
}

#[tokio::test]
async fn fetch_page_body_joins_prose_blocks() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("GET", "/blocks/p1/children")
        .match_query(Matcher::UrlEncoded("page_size".into(), "100".into()))
        .with_status(200)
        .with_body(
            json!({
                "results": [
                    { "type": "heading_2",
                      "heading_2": { "rich_text": [ { "plain_text": "Intro" } ] } },
                    { "type": "paragraph",
                      "paragraph": { "rich_text": [ { "plain_text": "First paragraph." } ] } },
                    { "type": "divider", "divider": {} },
                    { "type": "quote",
                      "quote": { "rich_text": [ { "plain_text": "A quote." } ] } }
                ],
                "has_more": false
            })
            .to_string(),
        )
        .create_async()
        .await;

    let body = store(&server).fetch_page_body("p1").await.expect("fetch body");
    assert_eq!(body, "Intro\n\nFirst paragraph.\n\nA quote.");
}

#[tokio::test]
async fn fetch_page_body_encodes_the_continuation_cursor() {
    let mut server = mockito::Server::new_async().await;
    // Cursors are opaque and may carry reserved characters
    let cursor = "c/next=2";

    let first = server
        .mock("GET", "/blocks/p1/children")
        .match_query(Matcher::Regex("^page_size=100$".to_string()))
        .with_status(200)
        .with_body(
            json!({
                "results": [ { "type": "paragraph",
                               "paragraph": { "rich_text": [ { "plain_text": "part one" } ] } } ],
                "has_more": true,
                "next_cursor": cursor
            })
            .to_string(),
        )
        .create_async()
        .await;
    let second = server
        .mock("GET", "/blocks/p1/children")
        .match_query(Matcher::UrlEncoded("start_cursor".into(), cursor.into()))
        .with_status(200)
        .with_body(
            json!({
                "results": [ { "type": "paragraph",
                               "paragraph": { "rich_text": [ { "plain_text": "part two" } ] } } ],
                "has_more": false
            })
            .to_string(),
        )
        .create_async()
        .await;

    let body = store(&server).fetch_page_body("p1").await.expect("fetch body");
    assert_eq!(body, "part one\n\npart two");
    first.assert_async().await;
    second.assert_async().await;
}

#[tokio::test]
async fn create_page_sends_properties_and_returns_id() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/pages")
        .match_body(Matcher::PartialJson(json!({
            "parent": { "database_id": "db1" },
            "properties": {
                "Name": { "title": [ { "text": { "content": "A title" } } ] },
                "URL": { "url": "http://x/a" },
                "Category": { "select": { "name": "technology" } }
            }
        })))
        .with_status(200)
        .with_body(json!({ "id": "new-page" }).to_string())
        .create_async()
        .await;

    let record = sample_record("A title", "one paragraph");
    let id = store(&server).create_page(&record).await.expect("create page");
    assert_eq!(id, "new-page");
    mock.assert_async().await;
}

#[tokio::test]
async fn create_page_failure_maps_to_push_error() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("POST", "/pages")
        .with_status(400)
        .create_async()
        .await;

    let record = sample_record("A title", "content");
    let result = store(&server).create_page(&record).await;
    let err = result.expect_err("status 400 must fail the push");
    assert!(err.to_string().contains("400"), "got: {err}");
}

#[tokio::test]
async fn archive_page_is_soft_and_tolerant() {
    let mut server = mockito::Server::new_async().await;
    let _archived = server
        .mock("PATCH", "/pages/p1")
        .match_body(Matcher::Json(json!({ "archived": true })))
        .with_status(200)
        .with_body(json!({ "id": "p1", "archived": true }).to_string())
        .create_async()
        .await;
    let _missing = server
        .mock("PATCH", "/pages/missing")
        .with_status(404)
        .create_async()
        .await;

    let store = store(&server);
    assert!(store.archive_page("p1").await.expect("archive"));
    assert!(!store.archive_page("missing").await.expect("archive missing"));
}

#[tokio::test]
async fn connect_probe_reports_auth_failure() {
    let mut server = mockito::Server::new_async().await;
    let _ok = server
        .mock("GET", "/databases/db1")
        .match_header("authorization", "Bearer test-token")
        .with_status(200)
        .with_body(json!({ "id": "db1" }).to_string())
        .create_async()
        .await;
    store(&server).connect().await.expect("probe succeeds");

    let mut bad = mockito::Server::new_async().await;
    let _denied = bad.mock("GET", "/databases/db1").with_status(401).create_async().await;
    let result = store(&bad).connect().await;
    assert!(result.is_err());
}
