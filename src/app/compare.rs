use scraper::{ElementRef, Html, Node};
use sha2::{Digest, Sha256};

use super::mime::{self, MimeError};
use super::types::Page;

const HIDDEN_ELEMENTS: &[&str] = &["head", "meta", "style", "link", "script"];

#[derive(Debug, thiserror::Error)]
pub enum CompareError {
    #[error("comparison failed: {0}")]
    ComparisonFailed(#[from] MimeError),
}

pub trait PageComparer: Send + Sync {
    fn have_same_body(&self, a: &Page, b: &Page) -> Result<bool, CompareError>;
}

/// Compares HTML by the text a reader would see, everything else byte for byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct VisibleTextComparer;

impl PageComparer for VisibleTextComparer {
    fn have_same_body(&self, a: &Page, b: &Page) -> Result<bool, CompareError> {
        if a.content_type.trim().is_empty() || b.content_type.trim().is_empty() {
            return Ok(a.body == b.body);
        }

        let type_a = mime::parse_media_type(&a.content_type)?;
        let type_b = mime::parse_media_type(&b.content_type)?;
        if type_a != type_b {
            return Ok(false);
        }

        if type_a == "text/html" {
            let text_a = visible_text(&Html::parse_document(&a.body));
            let text_b = visible_text(&Html::parse_document(&b.body));
            return Ok(checksum(&text_a) == checksum(&text_b));
        }
        Ok(a.body == b.body)
    }
}

/// Trimmed text nodes outside head/meta/style/link/script, one per line.
pub fn visible_text(doc: &Html) -> String {
    let mut lines = Vec::new();
    collect_text(doc.root_element(), &mut lines);
    lines.join("\n")
}

fn collect_text(element: ElementRef<'_>, lines: &mut Vec<String>) {
    if HIDDEN_ELEMENTS.contains(&element.value().name()) {
        return;
    }
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    collect_text(child, lines);
                }
            }
            _ => {}
        }
    }
}

fn checksum(text: &str) -> Vec<u8> {
    Sha256::digest(text.as_bytes()).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn html(body: &str) -> Page {
        Page::new(body, "text/html")
    }

    fn same(a: Page, b: Page) -> bool {
        VisibleTextComparer.have_same_body(&a, &b).unwrap()
    }

    #[test]
    fn tolerates_broken_and_bodyless_html() {
        assert!(same(html("<html <body"), html("<html <body")));
        let bodyless = "<html><head><title>Hello!</title></head></html>";
        assert!(same(html(bodyless), html(bodyless)));
        assert!(same(html(""), html("<html><head><title>empty</title></head></html>")));
        assert!(same(html("hello"), html("<body>hello</body>")));
    }

    #[test]
    fn only_visible_text_matters() {
        let a = r#"<html><body>
            <p>Hello</p>
            <script>alert("Script");</script>
        </body></html>"#;
        let b = r#"<html><head><meta name="x" content="y"><style>p{}</style></head><body>
            <p>Hello</p>
            <link rel="stylesheet" href="style.css" />
        </body></html>"#;
        assert!(same(html(a), html(b)));
        assert!(!same(
            html("<html><body><p>Hello</p></body></html>"),
            html("<html><body><p>Goodbye</p></body></html>")
        ));
    }

    #[test]
    fn charset_is_ignored_but_types_must_match() {
        let a = Page::new("same", "application/json; charset=utf-8");
        let b = Page::new("same", "application/json");
        assert!(same(a, b));
        assert!(!same(Page::new("same", "application/json"), html("same")));
        assert!(!same(
            Page::new("same", "application/json"),
            Page::new("different", "application/json")
        ));
    }

    #[test]
    fn missing_type_on_either_side_compares_raw() {
        assert!(same(Page::new("Body", ""), Page::new("Body", "text/html; charset=utf-8")));
        assert!(same(Page::new("Body", "text/html; charset=utf-8"), Page::new("Body", "")));
        assert!(!same(
            Page::new("<p>Body</p>", ""),
            Page::new("<span>Body</span>", "text/html; charset=utf-8")
        ));
    }

    #[test]
    fn malformed_content_type_is_an_error() {
        let result = VisibleTextComparer.have_same_body(&Page::new("a", "nonsense"), &html("a"));
        assert!(matches!(result, Err(CompareError::ComparisonFailed(_))));
    }

    #[test]
    fn extracts_text_in_document_order() {
        let doc = Html::parse_document(
            r#"<!DOCTYPE html>
            <html>
            <head><title>Ignored</title><style>body { background: #f00; }</style></head>
            <body>
                <h1>Header</h1>
                <p>Paragraph two.</p>
                <div><span>Text inside a span.</span></div>
                <script>console.log("Ignored script");</script>
            </body>
            </html>"#,
        );
        assert_eq!(visible_text(&doc), "Header\nParagraph two.\nText inside a span.");
        assert_eq!(visible_text(&Html::parse_document("<script>alert('x');</script>")), "");
        assert_eq!(visible_text(&Html::parse_document("")), "");
    }
}
