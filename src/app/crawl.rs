use std::borrow::Cow;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use scraper::{Html, Selector};
use tokio::task::JoinSet;
use url::Url;

use super::client::{self, ClientError, RedirectInterceptor, RequestSettings};
use super::files::{self, MirrorWriter};
use super::metrics::CrawlerMetrics;
use super::mime;
use super::rules::FetchRules;
use super::sitemap::SitemapCoordinator;
use super::types::CrawlReport;
use super::upload::Uploader;

const LINK_SELECTOR: &str = "a[href], link[href], img[src], script[src]";

/// Bounded-concurrency mirror crawler.
pub struct Crawler {
    rules: Arc<FetchRules>,
    concurrency: usize,
    worker: Arc<Worker>,
}

struct Worker {
    client: reqwest::Client,
    writer: MirrorWriter,
    uploader: Option<Arc<dyn Uploader>>,
    metrics: Arc<CrawlerMetrics>,
    sitemaps: SitemapCoordinator,
}

#[derive(Debug, Default)]
struct FetchOutcome {
    final_url: Option<Url>,
    discovered: Vec<Url>,
}

impl Crawler {
    pub fn new(
        settings: &RequestSettings,
        rules: FetchRules,
        writer: MirrorWriter,
        uploader: Option<Arc<dyn Uploader>>,
        metrics: Arc<CrawlerMetrics>,
        concurrency: usize,
    ) -> Result<Self, ClientError> {
        let rules = Arc::new(rules);
        let client = client::build_crawl_client(
            settings,
            rules.clone(),
            Some(stub_writer(writer.clone())),
        )?;
        Ok(Self {
            rules,
            concurrency: concurrency.max(1),
            worker: Arc::new(Worker {
                client,
                writer,
                uploader,
                metrics,
                sitemaps: SitemapCoordinator::new(),
            }),
        })
    }

    /// Crawls from `seeds` until the queue drains.
    pub async fn run(&self, seeds: Vec<Url>) -> CrawlReport {
        let mut queue = VecDeque::new();
        let mut seen = HashSet::new();
        self.enqueue_all(seeds, &mut queue, &mut seen);
        tracing::info!(queued = queue.len(), concurrency = self.concurrency, "crawl started");

        let mut set = JoinSet::new();
        loop {
            while set.len() < self.concurrency {
                let Some(url) = queue.pop_front() else {
                    break;
                };
                let worker = self.worker.clone();
                set.spawn(async move { worker.process(url).await });
            }

            if set.is_empty() {
                break;
            }

            if let Some(joined) = set.join_next().await {
                match joined {
                    Ok(outcome) => {
                        if let Some(final_url) = outcome.final_url {
                            seen.insert(visit_key(&final_url));
                        }
                        self.enqueue_all(outcome.discovered, &mut queue, &mut seen);
                    }
                    Err(err) => tracing::error!(error = %err, "crawl worker failed"),
                }
            }
        }

        let report = self.report();
        tracing::info!(
            crawled = report.crawled,
            downloaded = report.downloaded,
            http_errors = report.http_errors,
            download_errors = report.download_errors,
            uploaded = report.uploaded,
            upload_failures = report.upload_failures,
            "crawl finished"
        );
        report
    }

    /// Queues `urls` in order. A referenced sitemap that will not be fetched
    /// is abandoned and whatever that releases takes its place.
    fn enqueue_all(&self, urls: Vec<Url>, queue: &mut VecDeque<Url>, seen: &mut HashSet<String>) {
        let mut pending = VecDeque::from(urls);
        while let Some(url) = pending.pop_front() {
            if self.enqueue(&url, queue, seen) {
                continue;
            }
            for released in self.worker.sitemaps.abandon(&url).into_iter().rev() {
                pending.push_front(released);
            }
        }
    }

    fn enqueue(&self, url: &Url, queue: &mut VecDeque<Url>, seen: &mut HashSet<String>) -> bool {
        if !self.rules.allows(url) {
            tracing::trace!(url = %url, "not allowed");
            return false;
        }
        if !seen.insert(visit_key(url)) {
            return false;
        }
        queue.push_back(url.clone());
        true
    }

    pub fn report(&self) -> CrawlReport {
        let metrics = &self.worker.metrics;
        CrawlReport {
            crawled: metrics.crawled_pages.get(),
            downloaded: metrics.files_downloaded.get(),
            http_errors: metrics.http_errors.get(),
            download_errors: metrics.download_errors.get(),
            uploaded: metrics.files_uploaded.get(),
            upload_failures: metrics.file_upload_failures.get(),
        }
    }
}

impl Worker {
    async fn process(&self, url: Url) -> FetchOutcome {
        let mut outcome = FetchOutcome::default();

        let response = match self.client.get(url.clone()).send().await {
            Ok(response) => response,
            Err(err) => {
                match client::redirect_error(&err) {
                    Some(ClientError::DisallowedRedirect { target }) => {
                        tracing::debug!(url = %url, target = %target, "redirect not followed");
                    }
                    Some(ClientError::RedirectStub { .. }) => {
                        self.metrics.download_errors.inc();
                        tracing::error!(url = %url, error = %err, "error saving redirect");
                    }
                    _ => {
                        self.metrics.http_errors.inc();
                        tracing::warn!(url = %url, error = %err, "request failed");
                    }
                }
                outcome.discovered = self.sitemaps.abandon(&url);
                return outcome;
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.metrics.http_errors.inc();
            tracing::warn!(url = %url, status = status.as_u16(), "unexpected status");
            outcome.discovered = self.sitemaps.abandon(&url);
            return outcome;
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                self.metrics.http_errors.inc();
                tracing::warn!(url = %url, error = %err, "reading body failed");
                outcome.discovered = self.sitemaps.abandon(&url);
                return outcome;
            }
        };
        self.metrics.crawled_pages.inc();
        tracing::debug!(url = %final_url, content_type = %content_type, bytes = body.len(), "fetched");

        let media_type = match mime::parse_media_type(&content_type) {
            Ok(media_type) => Some(media_type),
            Err(err) => {
                tracing::warn!(url = %final_url, error = %err, "could not parse content type");
                None
            }
        };

        let mut handled_sitemap = false;
        match media_type.as_deref() {
            Some("text/html") => outcome.discovered = extract_html_links(&final_url, &body),
            Some("text/css") => {
                outcome.discovered = files::find_css_urls(&body)
                    .iter()
                    .filter_map(|raw| resolve_href(&final_url, raw))
                    .collect();
            }
            Some(media_type) if mask_office_xml(media_type).contains("xml") => {
                handled_sitemap = true;
                match self.sitemaps.handle_document(&url, &final_url, &body) {
                    Ok(progress) => {
                        outcome.discovered = progress.sitemaps;
                        outcome.discovered.extend(progress.ready);
                    }
                    Err(err) => {
                        tracing::warn!(url = %url, error = %err, "sitemap parse failed");
                        outcome.discovered = self.sitemaps.abandon(&url);
                    }
                }
            }
            _ => {}
        }
        if !handled_sitemap {
            outcome.discovered.extend(self.sitemaps.abandon(&url));
        }

        self.store(&final_url, &content_type, &body).await;
        outcome.final_url = Some(final_url);
        outcome
    }

    async fn store(&self, url: &Url, content_type: &str, body: &[u8]) {
        let saved = match self.writer.save(url, content_type, body) {
            Ok(saved) => saved,
            Err(err) => {
                self.metrics.download_errors.inc();
                tracing::error!(url = %url, error = %err, "error saving file");
                return;
            }
        };
        self.metrics.files_downloaded.inc();

        let Some(uploader) = &self.uploader else {
            return;
        };
        match uploader
            .upload_file(&saved.local_path, &saved.key, content_type)
            .await
        {
            Ok(_) => self.metrics.files_uploaded.inc(),
            Err(err) => {
                self.metrics.file_upload_failures.inc();
                tracing::error!(url = %url, key = %saved.key, error = %err, "error uploading file");
            }
        }
    }
}

/// Writes a meta-refresh stub at each intermediate URL of a redirect chain.
fn stub_writer(writer: MirrorWriter) -> RedirectInterceptor {
    Arc::new(move |from: &Url, target: &Url| {
        let saved = writer.save_redirect_stub(from, target)?;
        tracing::debug!(from = %from, target = %target, path = %saved.local_path.display(), "wrote redirect stub");
        Ok(())
    })
}

/// Office formats and `+xml` feeds are not sitemaps.
pub fn mask_office_xml(media_type: &str) -> Cow<'_, str> {
    if media_type.contains("openxmlformats") || media_type.contains("+xml") {
        Cow::Owned(media_type.replace("xml", ""))
    } else {
        Cow::Borrowed(media_type)
    }
}

fn visit_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

pub fn resolve_href(page_url: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("mailto:")
        || href.starts_with("javascript:")
        || href.starts_with("tel:")
        || href.starts_with("data:")
    {
        return None;
    }
    page_url.join(href).ok()
}

/// Every `href` on `a`/`link` and `src` on `img`/`script`, resolved against the page.
pub fn extract_html_links(page_url: &Url, body: &[u8]) -> Vec<Url> {
    let Ok(selector) = Selector::parse(LINK_SELECTOR) else {
        return Vec::new();
    };
    let doc = Html::parse_document(&String::from_utf8_lossy(body));
    doc.select(&selector)
        .filter_map(|el| {
            let attr = match el.value().name() {
                "img" | "script" => "src",
                _ => "href",
            };
            el.value().attr(attr)
        })
        .filter_map(|raw| resolve_href(page_url, raw))
        .collect()
}
