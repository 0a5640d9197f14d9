use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use mime::Mime;

/// Extensions the platform tables commonly carry.
const BASE_TYPES: &[(&str, &str)] = &[
    (".avif", "image/avif"),
    (".bmp", "image/bmp"),
    (".css", "text/css"),
    (".doc", "application/msword"),
    (".eot", "application/vnd.ms-fontobject"),
    (".gif", "image/gif"),
    (".gz", "application/gzip"),
    (".htm", "text/html"),
    (".html", "text/html"),
    (".jpeg", "image/jpeg"),
    (".jpg", "image/jpeg"),
    (".js", "text/javascript"),
    (".json", "application/json"),
    (".mjs", "text/javascript"),
    (".mp3", "audio/mpeg"),
    (".mp4", "video/mp4"),
    (".otf", "font/otf"),
    (".pdf", "application/pdf"),
    (".png", "image/png"),
    (".ppt", "application/vnd.ms-powerpoint"),
    (".pptx", "application/vnd.openxmlformats-officedocument.presentationml.presentation"),
    (".rdf", "application/rdf+xml"),
    (".rss", "application/rss+xml"),
    (".rtf", "application/rtf"),
    (".svg", "image/svg+xml"),
    (".ttf", "font/ttf"),
    (".txt", "text/plain"),
    (".wasm", "application/wasm"),
    (".webm", "video/webm"),
    (".webp", "image/webp"),
    (".xml", "text/xml"),
    (".zip", "application/zip"),
];

/// Entries the default table lacks: office formats, feeds, fonts and icons.
const ADDITIONAL_TYPES: &[(&str, &[&str])] = &[
    (".atom", &["application/atom+xml"]),
    (".csv", &["text/csv"]),
    (
        ".docx",
        &["application/vnd.openxmlformats-officedocument.wordprocessingml.document"],
    ),
    (".ico", &["image/vnd.microsoft.icon", "image/x-icon"]),
    (".ics", &["text/calendar"]),
    (".odp", &["application/vnd.oasis.opendocument.presentation"]),
    (".ods", &["application/vnd.oasis.opendocument.spreadsheet"]),
    (".odt", &["application/vnd.oasis.opendocument.text"]),
    (".xls", &["application/vnd.ms-excel"]),
    (
        ".xlsx",
        &["application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"],
    ),
    (".xml", &["application/xml"]),
    (".js", &["application/javascript"]),
    (".woff", &["font/woff"]),
    (".woff2", &["font/woff2"]),
];

static REGISTRY: LazyLock<ExtensionRegistry> = LazyLock::new(ExtensionRegistry::with_defaults);

#[derive(Debug, thiserror::Error)]
pub enum MimeError {
    #[error("invalid media type {value:?}: {source}")]
    InvalidMediaType {
        value: String,
        #[source]
        source: mime::FromStrError,
    },
}

/// Media type -> known file extensions, kept sorted so lookups are stable.
#[derive(Debug, Default, Clone)]
pub struct ExtensionRegistry {
    by_type: BTreeMap<String, BTreeSet<String>>,
}

impl ExtensionRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        for (ext, media_type) in BASE_TYPES {
            registry.insert(ext, media_type);
        }
        for (ext, media_types) in ADDITIONAL_TYPES {
            for media_type in *media_types {
                registry.insert(ext, media_type);
            }
        }
        registry
    }

    fn insert(&mut self, ext: &str, media_type: &str) {
        self.by_type
            .entry(media_type.to_ascii_lowercase())
            .or_default()
            .insert(ext.to_ascii_lowercase());
    }

    /// Extensions registered for a content type, parameters ignored. Sorted ascending.
    pub fn extensions_by_type(&self, content_type: &str) -> Result<Vec<String>, MimeError> {
        let media_type = parse_media_type(content_type)?;
        Ok(self
            .by_type
            .get(&media_type)
            .map(|exts| exts.iter().cloned().collect())
            .unwrap_or_default())
    }
}

pub fn extensions_by_type(content_type: &str) -> Result<Vec<String>, MimeError> {
    REGISTRY.extensions_by_type(content_type)
}

/// Lowercased `type/subtype` with parameters stripped.
pub fn parse_media_type(content_type: &str) -> Result<String, MimeError> {
    let parsed: Mime = content_type
        .trim()
        .parse()
        .map_err(|source| MimeError::InvalidMediaType {
            value: content_type.to_string(),
            source,
        })?;
    Ok(parsed.essence_str().to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_lists_both_extensions_sorted() {
        let exts = extensions_by_type("text/html; charset=utf-8").unwrap();
        assert_eq!(exts, vec![".htm".to_string(), ".html".to_string()]);
    }

    #[test]
    fn additional_types_are_present() {
        let exts = extensions_by_type(
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        )
        .unwrap();
        assert_eq!(exts, vec![".xlsx".to_string()]);
        assert_eq!(extensions_by_type("font/woff2").unwrap(), vec![".woff2"]);
        assert_eq!(extensions_by_type("image/x-icon").unwrap(), vec![".ico"]);
    }

    #[test]
    fn unknown_type_has_no_extensions() {
        assert!(extensions_by_type("application/x-nothing").unwrap().is_empty());
    }

    #[test]
    fn malformed_media_type_is_rejected() {
        assert!(parse_media_type("").is_err());
        assert!(parse_media_type("texthtml").is_err());
        assert!(parse_media_type("text/ html").is_err());
        assert!(matches!(
            extensions_by_type("not a type"),
            Err(MimeError::InvalidMediaType { .. })
        ));
    }

    #[test]
    fn parameters_and_case_are_ignored() {
        assert_eq!(parse_media_type("Text/HTML; charset=UTF-8").unwrap(), "text/html");
        assert_eq!(parse_media_type(" application/xml ").unwrap(), "application/xml");
        assert_eq!(
            parse_media_type("application/atom+xml;type=feed").unwrap(),
            "application/atom+xml"
        );
    }
}
