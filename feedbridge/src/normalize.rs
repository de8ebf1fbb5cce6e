//! HTML-to-plain-text normalization for ledger content.
//!
//! Feed entries arrive as HTML; the ledger stores plain text. The
//! conversion strips tags, drops script/style subtrees and collapses
//! whitespace. It is deterministic and idempotent: feeding the output back
//! in returns it unchanged, so re-normalizing ledger rows is a no-op.

use scraper::Html;
use tracing::warn;

use crate::error::SyncError;

/// Inputs above this size skip parsing entirely; the caller falls back to
/// the raw content rather than dropping the record.
const MAX_NORMALIZE_BYTES: usize = 4 * 1024 * 1024;

/// Convert HTML content to plain text.
///
/// Newlines in the output come from newlines in the source markup; tags
/// contribute no separators beyond a single space, matching what the
/// paragraph splitter in the document adapter expects.
pub fn html_to_text(html: &str) -> Result<String, SyncError> {
    if html.len() > MAX_NORMALIZE_BYTES {
        return Err(SyncError::ConversionFailure(format!(
            "content of {} bytes exceeds normalization cap",
            html.len()
        )));
    }

    let doc = Html::parse_document(html);
    let mut raw = String::with_capacity(html.len() / 2);
    for node in doc.tree.root().descendants() {
        if let Some(text) = node.value().as_text() {
            let in_skipped_subtree = node.ancestors().any(|a| {
                a.value()
                    .as_element()
                    .map_or(false, |e| matches!(e.name(), "script" | "style"))
            });
            if !in_skipped_subtree {
                raw.push_str(text);
                raw.push(' ');
            }
        }
    }

    Ok(collapse_whitespace(&raw))
}

/// Normalize content for ledger storage, passing the original through
/// unmodified if conversion fails (we never drop content on the floor).
pub fn normalize_content(content: &str) -> String {
    match html_to_text(content) {
        Ok(text) => text,
        Err(e) => {
            warn!("normalization failed, keeping original content: {}", e);
            content.to_string()
        }
    }
}

/// Trim every line, collapse internal runs of whitespace to single spaces
/// and drop empty lines. Idempotent by construction.
fn collapse_whitespace(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tags_and_scripts() {
        let html = "<p>Hello <b>world</b></p><script>var x = 1;</script><style>p { color: red }</style>";
        let text = html_to_text(html).unwrap();
        assert_eq!(text, "Hello world");
    }

    #[test]
    fn collapses_whitespace() {
        let html = "<div>  a   b </div>\n\n<div> c </div>";
        let text = html_to_text(html).unwrap();
        assert_eq!(text, "a b\nc");
    }

    #[test]
    fn normalization_is_idempotent() {
        let inputs = [
            "<p>Hi</p>",
            "plain text already",
            "<ul><li>one</li><li>two</li></ul>",
            "line one\n\n  line   two  ",
        ];
        for input in inputs {
            let once = normalize_content(input);
            let twice = normalize_content(&once);
            assert_eq!(once, twice, "re-normalizing changed output for {:?}", input);
        }
    }

    #[test]
    fn oversized_input_passes_through() {
        let big = "x".repeat(MAX_NORMALIZE_BYTES + 1);
        assert!(html_to_text(&big).is_err());
        assert_eq!(normalize_content(&big), big);
        // still idempotent on the fallback path
        assert_eq!(normalize_content(&normalize_content(&big)), big);
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(normalize_content(""), "");
    }
}
