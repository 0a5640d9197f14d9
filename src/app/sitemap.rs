use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use parking_lot::Mutex;
use quick_xml::Reader;
use quick_xml::events::Event;
use url::Url;

use super::types::SitemapEntry;

#[derive(Debug, thiserror::Error)]
pub enum SitemapError {
    #[error("parsing sitemap {url}: {source}")]
    Xml {
        url: String,
        #[source]
        source: quick_xml::Error,
    },
}

/// What a fetched XML document turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum SitemapDocument {
    Index { sitemaps: Vec<Url> },
    UrlSet { entries: Vec<SitemapEntry> },
    Other,
}

/// Fallback for a missing or unreadable `lastmod`.
pub fn epoch_sentinel() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// RFC 3339, W3C minute precision or a bare date.
pub fn parse_lastmod(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M%:z", "%Y-%m-%dT%H:%M%#z"] {
        if let Ok(parsed) = DateTime::parse_from_str(raw, format) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    if let Some(naive) = raw.strip_suffix('Z') {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M") {
            return Some(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[derive(Default)]
struct Pending {
    loc: Option<String>,
    lastmod: Option<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    None,
    Loc,
    LastMod,
}

/// Parses a `sitemapindex` or `urlset` document. `<loc>` values are resolved
/// against `base`; entries with an unusable location are skipped.
pub fn parse_sitemap(base: &Url, body: &[u8]) -> Result<SitemapDocument, SitemapError> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut root: Option<Vec<u8>> = None;
    let mut current: Option<Pending> = None;
    let mut field = Field::None;
    let mut sitemaps = Vec::new();
    let mut entries = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|source| SitemapError::Xml {
                url: base.to_string(),
                source,
            })?;
        match event {
            Event::Start(start) => {
                let name = start.local_name().as_ref().to_vec();
                if root.is_none() {
                    if !is_sitemap_root(Some(name.as_slice())) {
                        return Ok(SitemapDocument::Other);
                    }
                    root = Some(name);
                } else {
                    match name.as_slice() {
                        b"sitemap" | b"url" => current = Some(Pending::default()),
                        b"loc" if current.is_some() => field = Field::Loc,
                        b"lastmod" if current.is_some() => field = Field::LastMod,
                        _ => {}
                    }
                }
            }
            Event::Empty(start) if root.is_none() => {
                let name = start.local_name().as_ref().to_vec();
                return Ok(match name.as_slice() {
                    b"sitemapindex" => SitemapDocument::Index { sitemaps },
                    b"urlset" => SitemapDocument::UrlSet { entries },
                    _ => SitemapDocument::Other,
                });
            }
            Event::Text(text) => {
                if let Some(pending) = current.as_mut() {
                    let value = text
                        .unescape()
                        .map_err(|source| SitemapError::Xml {
                            url: base.to_string(),
                            source,
                        })?
                        .trim()
                        .to_string();
                    match field {
                        Field::Loc => pending.loc = Some(value),
                        Field::LastMod => pending.lastmod = Some(value),
                        Field::None => {}
                    }
                }
            }
            Event::CData(data) => {
                if let Some(pending) = current.as_mut() {
                    let value = String::from_utf8_lossy(&data).trim().to_string();
                    match field {
                        Field::Loc => pending.loc = Some(value),
                        Field::LastMod => pending.lastmod = Some(value),
                        Field::None => {}
                    }
                }
            }
            Event::End(end) => match end.local_name().as_ref() {
                b"loc" | b"lastmod" => field = Field::None,
                b"sitemap" => {
                    if let Some(loc) = current.take().and_then(|p| p.loc) {
                        match base.join(&loc) {
                            Ok(url) => sitemaps.push(url),
                            Err(err) => tracing::warn!(loc = %loc, error = %err, "skipping sitemap with bad loc"),
                        }
                    }
                }
                b"url" => {
                    if let Some(pending) = current.take() {
                        if let Some(entry) = entry_from(base, pending) {
                            entries.push(entry);
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(match root.as_deref() {
        Some(b"sitemapindex") => SitemapDocument::Index { sitemaps },
        Some(b"urlset") => SitemapDocument::UrlSet { entries },
        _ => SitemapDocument::Other,
    })
}

fn is_sitemap_root(name: Option<&[u8]>) -> bool {
    matches!(name, Some(b"sitemapindex") | Some(b"urlset"))
}

fn entry_from(base: &Url, pending: Pending) -> Option<SitemapEntry> {
    let loc = pending.loc?;
    let url = match base.join(&loc) {
        Ok(url) => url,
        Err(err) => {
            tracing::warn!(loc = %loc, error = %err, "skipping sitemap entry with bad loc");
            return None;
        }
    };
    let lastmod = match pending.lastmod.as_deref() {
        None | Some("") => epoch_sentinel(),
        Some(raw) => parse_lastmod(raw).unwrap_or_else(|| {
            tracing::warn!(url = %url, lastmod = raw, "unreadable lastmod, using sentinel");
            epoch_sentinel()
        }),
    };
    Some(SitemapEntry { url, lastmod })
}

/// Newest first, ties by URL.
pub fn sort_entries(entries: &mut [SitemapEntry]) {
    entries.sort_by(|a, b| {
        b.lastmod
            .cmp(&a.lastmod)
            .then_with(|| a.url.as_str().cmp(b.url.as_str()))
    });
}

#[derive(Debug, Default)]
struct CrawlState {
    expected_sitemaps: usize,
    completed_sitemaps: usize,
    entries: Vec<SitemapEntry>,
    dispatched: bool,
    pending: HashSet<String>,
}

impl CrawlState {
    fn complete(&mut self, url: &Url) {
        if !self.pending.remove(url.as_str()) {
            self.expected_sitemaps += 1;
        }
        self.completed_sitemaps += 1;
    }

    fn take_ready(&mut self) -> Vec<Url> {
        if self.dispatched {
            let mut late = std::mem::take(&mut self.entries);
            sort_entries(&mut late);
            return late.into_iter().map(|e| e.url).collect();
        }
        if self.expected_sitemaps == 0 || self.completed_sitemaps != self.expected_sitemaps {
            return Vec::new();
        }
        self.dispatched = true;
        let mut ready = std::mem::take(&mut self.entries);
        sort_entries(&mut ready);
        tracing::info!(
            sitemaps = self.completed_sitemaps,
            urls = ready.len(),
            "all sitemaps parsed, dispatching entries"
        );
        ready.into_iter().map(|e| e.url).collect()
    }
}

/// Per-crawl sitemap bookkeeping shared by every worker.
///
/// Entries are held back until every referenced sitemap has been handled,
/// then released once, newest first.
#[derive(Debug, Default)]
pub struct SitemapCoordinator {
    state: Mutex<CrawlState>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SitemapProgress {
    /// Child sitemaps to fetch.
    pub sitemaps: Vec<Url>,
    /// Page URLs ready to crawl, in dispatch order.
    pub ready: Vec<Url>,
}

impl SitemapCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the XML body fetched for `url`; relative `<loc>` values resolve
    /// against `base`, the URL the body was finally served from.
    ///
    /// A referenced sitemap that turns out to be some other XML document
    /// counts as handled. On a parse error the caller should
    /// [`abandon`](Self::abandon) the URL.
    pub fn handle_document(
        &self,
        url: &Url,
        base: &Url,
        body: &[u8],
    ) -> Result<SitemapProgress, SitemapError> {
        let document = parse_sitemap(base, body)?;

        let mut state = self.state.lock();
        let mut progress = SitemapProgress::default();
        match document {
            SitemapDocument::Other => {
                if !state.pending.remove(url.as_str()) {
                    return Ok(progress);
                }
                tracing::warn!(url = %url, "referenced sitemap is not a sitemap document");
                state.completed_sitemaps += 1;
            }
            SitemapDocument::Index { sitemaps } => {
                state.complete(url);
                for sitemap in sitemaps {
                    if state.pending.insert(sitemap.to_string()) {
                        state.expected_sitemaps += 1;
                        progress.sitemaps.push(sitemap);
                    }
                }
                tracing::debug!(url = %url, expected = state.expected_sitemaps, "sitemap index parsed");
            }
            SitemapDocument::UrlSet { entries } => {
                state.complete(url);
                tracing::debug!(url = %url, entries = entries.len(), "urlset parsed");
                state.entries.extend(entries);
            }
        }
        progress.ready = state.take_ready();
        Ok(progress)
    }

    /// Marks a referenced sitemap as done after a failed fetch.
    pub fn abandon(&self, url: &Url) -> Vec<Url> {
        let mut state = self.state.lock();
        if !state.pending.remove(url.as_str()) {
            return Vec::new();
        }
        tracing::warn!(url = %url, "sitemap lost for this run");
        state.completed_sitemaps += 1;
        state.take_ready()
    }
}

#[cfg(test)]
impl SitemapCoordinator {
    fn counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.expected_sitemaps, state.completed_sitemaps)
    }

    fn is_dispatched(&self) -> bool {
        self.state.lock().dispatched
    }
}
