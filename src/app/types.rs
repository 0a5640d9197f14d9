use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;

/// One `<url>` of a urlset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitemapEntry {
    pub url: Url,
    pub lastmod: DateTime<Utc>,
}

/// A fetched page body and its `Content-Type` header (possibly empty).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub body: String,
    pub content_type: String,
}

impl Page {
    pub fn new(body: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: content_type.into(),
        }
    }
}

/// Views recorded for one URL. `url` is a path-plus-query reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrlHitCount {
    pub url: String,
    pub view_count: i64,
}

impl UrlHitCount {
    pub fn new(url: impl Into<String>, view_count: i64) -> Self {
        Self {
            url: url.into(),
            view_count,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopUrls {
    pub top_unsampled: Vec<UrlHitCount>,
    pub remaining_sampled: Vec<UrlHitCount>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriftSummary {
    pub pages_compared: u64,
    pub drifts_detected: u64,
    pub errors: u64,
}

impl fmt::Display for DriftSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pages tested: {}", self.pages_compared)?;
        writeln!(f, "Drifts detected: {}", self.drifts_detected)?;
        write!(f, "Errors encountered: {}", self.errors)
    }
}

/// Final tallies of one crawl.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CrawlReport {
    pub crawled: u64,
    pub downloaded: u64,
    pub http_errors: u64,
    pub download_errors: u64,
    pub uploaded: u64,
    pub upload_failures: u64,
}
