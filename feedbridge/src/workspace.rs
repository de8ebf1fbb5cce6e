//! Document Source Adapter: HTTP client for the external collaborative
//! document store (Notion-style API). Page listings are cursor-paginated;
//! page bodies live behind a separate block-children endpoint; deletion is
//! soft (archive) only.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::ledger::LedgerRecord;

/// The store rejects page creations with more than 100 child blocks, so we
/// stop one short and keep one slot for the truncation notice.
pub const MAX_BLOCKS: usize = 99;
/// Above this many paragraphs we coalesce lines before giving up and
/// truncating.
const COALESCE_THRESHOLD: usize = 80;
/// Soft cap per text block; the store rejects much beyond this.
const MAX_BLOCK_CHARS: usize = 2000;
/// Character ceiling of the rich-text property fields.
const MAX_RICH_TEXT_CHARS: usize = 2000;

const TRUNCATION_NOTICE: &str =
    "... (Content truncated due to length. Please refer to the original link for complete content.)";

/// One page of the document collection, flattened from the store's
/// property schema. `content` is empty until the body has been fetched.
#[derive(Debug, Clone, Default)]
pub struct DocumentPage {
    pub id: String,
    pub title: String,
    pub link: String,
    pub content: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub summary: Option<String>,
    pub rationale: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

/// Contract of the document store. The trait seam exists so the engine
/// can be exercised against an in-memory double in tests.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// All pages of the collection, paginating until the cursor runs out.
    async fn list_pages(&self) -> Result<Vec<DocumentPage>>;

    /// Full body text of one page: sequential content blocks joined by
    /// blank lines.
    async fn fetch_page_body(&self, page_id: &str) -> Result<String>;

    /// Create a page from a ledger record; returns the new page id.
    async fn create_page(&self, record: &LedgerRecord) -> Result<String>;

    /// Soft-delete a page. The store has no hard delete.
    async fn archive_page(&self, page_id: &str) -> Result<bool>;
}

#[derive(Debug, Deserialize)]
struct PaginatedResponse {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// `DocumentStore` over the real HTTP API.
pub struct HttpDocumentStore {
    client: Client,
    api_url: String,
    database_id: String,
}

impl HttpDocumentStore {
    pub fn new(api_url: &str, api_token: &str, database_id: &str, timeout_secs: u64) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", api_token))
            .context("invalid characters in document API token")?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("feedbridge/0.1.0")
            .default_headers(headers)
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            database_id: database_id.to_string(),
        })
    }

    /// Probe the collection once so auth or connectivity failures surface
    /// before any sync phase starts.
    pub async fn connect(&self) -> Result<()> {
        let url = format!("{}/databases/{}", self.api_url, self.database_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SyncError::SourceUnavailable(format!("document store unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(SyncError::SourceUnavailable(format!(
                "document store rejected collection probe with status {}",
                response.status()
            ))
            .into());
        }
        info!("connected to document collection {}", self.database_id);
        Ok(())
    }

    async fn query_page(&self, cursor: Option<&str>) -> Result<PaginatedResponse> {
        let url = format!("{}/databases/{}/query", self.api_url, self.database_id);
        let body = match cursor {
            Some(c) => json!({ "start_cursor": c }),
            None => json!({}),
        };
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::SourceUnavailable(format!("document store unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(SyncError::SourceUnavailable(format!(
                "collection query failed with status {}",
                response.status()
            ))
            .into());
        }
        response
            .json::<PaginatedResponse>()
            .await
            .context("failed to decode collection query response")
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn list_pages(&self) -> Result<Vec<DocumentPage>> {
        let mut pages = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let response = self.query_page(cursor.as_deref()).await?;
            for raw in &response.results {
                match extract_page(raw) {
                    Some(page) => pages.push(page),
                    None => warn!("skipping document page with unreadable properties"),
                }
            }
            if !response.has_more {
                break;
            }
            cursor = response.next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        info!("retrieved {} pages from document collection", pages.len());
        Ok(pages)
    }

    async fn fetch_page_body(&self, page_id: &str) -> Result<String> {
        let mut paragraphs: Vec<String> = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let url = format!("{}/blocks/{}/children", self.api_url, page_id);
            // Cursors are opaque; let reqwest encode them.
            let mut request = self.client.get(&url).query(&[("page_size", "100")]);
            if let Some(c) = &cursor {
                request = request.query(&[("start_cursor", c.as_str())]);
            }
            let response = request
                .send()
                .await
                .with_context(|| format!("failed to fetch blocks of page {}", page_id))?;
            if !response.status().is_success() {
                anyhow::bail!(
                    "block fetch for page {} failed with status {}",
                    page_id,
                    response.status()
                );
            }
            let body: PaginatedResponse = response
                .json()
                .await
                .context("failed to decode block children response")?;

            for block in &body.results {
                if let Some(text) = block_text(block) {
                    if !text.is_empty() {
                        paragraphs.push(text);
                    }
                }
            }
            if !body.has_more {
                break;
            }
            cursor = body.next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        Ok(paragraphs.join("\n\n"))
    }

    async fn create_page(&self, record: &LedgerRecord) -> Result<String> {
        let url = format!("{}/pages", self.api_url);
        let blocks = content_blocks(&record.content);
        let mut page = json!({
            "parent": { "database_id": self.database_id },
            "properties": page_properties(record),
        });
        if !blocks.is_empty() {
            debug!("creating document page with {} blocks for '{}'", blocks.len(), record.title);
            page["children"] = Value::Array(blocks);
        }

        let response = self
            .client
            .post(&url)
            .json(&page)
            .send()
            .await
            .map_err(|e| SyncError::PushFailure { id: record.id, reason: e.to_string() })?;
        if !response.status().is_success() {
            return Err(SyncError::PushFailure {
                id: record.id,
                reason: format!("page create returned status {}", response.status()),
            }
            .into());
        }

        let created: Value = response
            .json()
            .await
            .context("failed to decode page create response")?;
        let page_id = created
            .get("id")
            .and_then(Value::as_str)
            .context("page create response carried no id")?
            .to_string();
        info!("created document page {} for '{}'", page_id, record.title);
        Ok(page_id)
    }

    async fn archive_page(&self, page_id: &str) -> Result<bool> {
        let url = format!("{}/pages/{}", self.api_url, page_id);
        let response = self
            .client
            .patch(&url)
            .json(&json!({ "archived": true }))
            .send()
            .await
            .with_context(|| format!("failed to archive page {}", page_id))?;
        if response.status().is_success() {
            info!("archived document page {}", page_id);
            Ok(true)
        } else {
            warn!("archive of page {} returned status {}", page_id, response.status());
            Ok(false)
        }
    }
}

// ---------------------------------------------------------------------------
// Property extraction (store JSON -> DocumentPage)
// ---------------------------------------------------------------------------

fn plain_text(fragments: Option<&Value>) -> String {
    fragments
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|t| t.get("plain_text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

fn rich_text_property(properties: &Value, name: &str) -> Option<String> {
    let text = plain_text(properties.get(name).and_then(|p| p.get("rich_text")));
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn parse_time(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Flatten a raw page object into a `DocumentPage`. Returns `None` when
/// the page lacks an id; every property is optional.
pub fn extract_page(raw: &Value) -> Option<DocumentPage> {
    let id = raw.get("id")?.as_str()?.to_string();
    let properties = raw.get("properties").cloned().unwrap_or_else(|| json!({}));

    let title = plain_text(properties.get("Name").and_then(|p| p.get("title")));
    let link = properties
        .get("URL")
        .and_then(|p| p.get("url"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let category = properties
        .get("Category")
        .and_then(|p| p.get("select"))
        .and_then(|s| s.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let tags = properties
        .get("Tags")
        .and_then(|p| p.get("multi_select"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|t| t.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(DocumentPage {
        id,
        title,
        link,
        content: String::new(),
        category,
        tags,
        summary: rich_text_property(&properties, "AI summary"),
        rationale: rich_text_property(&properties, "Why it matters"),
        published: parse_time(raw.get("created_time")),
        updated: parse_time(raw.get("last_edited_time")),
    })
}

/// Text of one content block, for the block kinds that carry prose.
fn block_text(block: &Value) -> Option<String> {
    let kind = block.get("type")?.as_str()?;
    if !matches!(
        kind,
        "paragraph"
            | "heading_1"
            | "heading_2"
            | "heading_3"
            | "bulleted_list_item"
            | "numbered_list_item"
            | "quote"
    ) {
        return None;
    }
    Some(plain_text(block.get(kind).and_then(|b| b.get("rich_text"))))
}

// ---------------------------------------------------------------------------
// Page construction (LedgerRecord -> store JSON)
// ---------------------------------------------------------------------------

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn rich_text_value(text: &str) -> Value {
    json!({ "rich_text": [ { "text": { "content": truncate_chars(text, MAX_RICH_TEXT_CHARS) } } ] })
}

/// Map a ledger record onto the store's fixed property schema.
fn page_properties(record: &LedgerRecord) -> Value {
    let mut properties = json!({
        "Name": { "title": [ { "text": { "content": &record.title } } ] },
        "URL": { "url": &record.link },
        "Why it matters": rich_text_value(record.rationale.as_deref().unwrap_or_default()),
        "Read": { "checkbox": false },
    });
    if let Some(summary) = &record.summary {
        properties["AI summary"] = rich_text_value(summary);
    }
    if let Some(category) = &record.category {
        properties["Category"] = json!({ "select": { "name": category } });
    }
    let tags = record.tags();
    if !tags.is_empty() {
        let options: Vec<Value> = tags.iter().map(|t| json!({ "name": t })).collect();
        properties["Tags"] = json!({ "multi_select": options });
    }
    properties
}

fn paragraph_block(text: &str) -> Value {
    json!({
        "object": "block",
        "type": "paragraph",
        "paragraph": { "rich_text": [ { "type": "text", "text": { "content": text } } ] }
    })
}

/// Split content into paragraph blocks, honoring the store's per-page
/// block ceiling: above `COALESCE_THRESHOLD` paragraphs, lines are greedily
/// coalesced into blocks of under `MAX_BLOCK_CHARS`; if the result still
/// exceeds `MAX_BLOCKS`, the excess is cut and a single truncation notice
/// appended last. Exceeding the ceiling would fail the create call
/// outright, so this policy is mandatory, not cosmetic.
pub fn content_blocks(content: &str) -> Vec<Value> {
    let mut paragraphs: Vec<String> = content
        .split('\n')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();

    if paragraphs.len() > COALESCE_THRESHOLD {
        debug!("coalescing {} paragraphs to reduce block count", paragraphs.len());
        let mut combined: Vec<String> = Vec::new();
        let mut current = String::new();
        for paragraph in &paragraphs {
            if current.len() + paragraph.len() + 1 < MAX_BLOCK_CHARS {
                if current.is_empty() {
                    current = paragraph.clone();
                } else {
                    current.push('\n');
                    current.push_str(paragraph);
                }
            } else {
                if !current.is_empty() {
                    combined.push(std::mem::take(&mut current));
                }
                current = paragraph.clone();
            }
        }
        if !current.is_empty() {
            combined.push(current);
        }
        paragraphs = combined;
    }

    let mut blocks: Vec<Value> = paragraphs.iter().map(|p| paragraph_block(p)).collect();

    if blocks.len() > MAX_BLOCKS {
        warn!("content yields {} blocks, truncating to {}", blocks.len(), MAX_BLOCKS);
        blocks.truncate(MAX_BLOCKS - 1);
        blocks.push(paragraph_block(TRUNCATION_NOTICE));
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_content(block: &Value) -> &str {
        block["paragraph"]["rich_text"][0]["text"]["content"]
            .as_str()
            .unwrap()
    }

    #[test]
    fn short_content_maps_one_block_per_paragraph() {
        let blocks = content_blocks("first\nsecond\n\nthird");
        assert_eq!(blocks.len(), 3);
        assert_eq!(block_content(&blocks[0]), "first");
        assert_eq!(block_content(&blocks[2]), "third");
    }

    #[test]
    fn empty_content_yields_no_blocks() {
        assert!(content_blocks("").is_empty());
        assert!(content_blocks("\n\n  \n").is_empty());
    }

    #[test]
    fn many_short_paragraphs_coalesce_under_ceiling() {
        // 150 paragraphs would blow the 100-block ceiling raw; coalescing
        // packs them into <2000-char blocks instead of truncating.
        let content = (0..150)
            .map(|i| format!("paragraph number {} with a bit of text", i))
            .collect::<Vec<_>>()
            .join("\n");
        let blocks = content_blocks(&content);
        assert!(blocks.len() <= MAX_BLOCKS, "got {} blocks", blocks.len());
        // Coalescing, not truncation: every paragraph survives.
        let all_text: String = blocks.iter().map(|b| block_content(b).to_string()).collect();
        assert!(all_text.contains("paragraph number 149"));
    }

    #[test]
    fn oversized_content_truncates_with_single_notice() {
        // 150 paragraphs of ~2000 chars each cannot be coalesced below the
        // ceiling, so the tail is cut and one notice block appended.
        let long_line = "x".repeat(1990);
        let content = (0..150)
            .map(|i| format!("{}{}", i, long_line))
            .collect::<Vec<_>>()
            .join("\n");
        let blocks = content_blocks(&content);
        assert_eq!(blocks.len(), MAX_BLOCKS);
        assert_eq!(block_content(blocks.last().unwrap()), TRUNCATION_NOTICE);
        let notices = blocks
            .iter()
            .filter(|b| block_content(b) == TRUNCATION_NOTICE)
            .count();
        assert_eq!(notices, 1);
    }

    #[test]
    fn extract_page_reads_property_schema() {
        let raw = serde_json::json!({
            "id": "p1",
            "created_time": "2025-03-01T10:00:00.000Z",
            "last_edited_time": "2025-03-02T11:30:00.000Z",
            "properties": {
                "Name": { "title": [ { "plain_text": "A title" } ] },
                "URL": { "url": "http://x/a" },
                "Category": { "select": { "name": "technology" } },
                "Tags": { "multi_select": [ { "name": "rust" }, { "name": "sync" } ] },
                "AI summary": { "rich_text": [ { "plain_text": "short summary" } ] },
                "Why it matters": { "rich_text": [ { "plain_text": "because" } ] }
            }
        });
        let page = extract_page(&raw).expect("page");
        assert_eq!(page.id, "p1");
        assert_eq!(page.title, "A title");
        assert_eq!(page.link, "http://x/a");
        assert_eq!(page.category.as_deref(), Some("technology"));
        assert_eq!(page.tags, vec!["rust".to_string(), "sync".to_string()]);
        assert_eq!(page.summary.as_deref(), Some("short summary"));
        assert_eq!(page.rationale.as_deref(), Some("because"));
        assert!(page.published.is_some());
        assert!(page.updated.is_some());
    }

    #[test]
    fn extract_page_tolerates_missing_properties() {
        let raw = serde_json::json!({ "id": "p2", "properties": {} });
        let page = extract_page(&raw).expect("page");
        assert_eq!(page.title, "");
        assert_eq!(page.link, "");
        assert!(page.category.is_none());
        assert!(page.tags.is_empty());
    }

    #[test]
    fn block_text_skips_non_prose_blocks() {
        let paragraph = serde_json::json!({
            "type": "paragraph",
            "paragraph": { "rich_text": [ { "plain_text": "hello" } ] }
        });
        let divider = serde_json::json!({ "type": "divider", "divider": {} });
        assert_eq!(block_text(&paragraph).as_deref(), Some("hello"));
        assert!(block_text(&divider).is_none());
    }
}
