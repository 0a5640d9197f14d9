use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use regex::Regex;
use site_mirror::app::client::RequestSettings;
use site_mirror::app::crawl::Crawler;
use site_mirror::app::files::MirrorWriter;
use site_mirror::app::metrics::CrawlerMetrics;
use site_mirror::app::rules::FetchRules;
use site_mirror::app::upload::{UploadError, UploadOutcome, Uploader};
use tempfile::TempDir;
use url::Url;

const SITEMAP_INDEX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>/sitemap_1.xml</loc></sitemap>
  <sitemap><loc>/sitemap_2.xml</loc></sitemap>
</sitemapindex>"#;

const SITEMAP_1: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>/</loc><lastmod>2025-11-06T11:00:00Z</lastmod></url>
</urlset>"#;

const SITEMAP_2: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>/1</loc><lastmod>2025-11-05T11:00:00Z</lastmod></url>
  <url><loc>/2</loc><lastmod>2025-11-07T11:00:00Z</lastmod></url>
  <url><loc>/3</loc></url>
  <url><loc>/500</loc><lastmod>2025-01-07T11:00:00Z</lastmod></url>
</urlset>"#;

const DENIED_CHILD_INDEX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>/sitemap_1.xml</loc></sitemap>
  <sitemap><loc>/private/sitemap_2.xml</loc></sitemap>
</sitemapindex>"#;

const FEED_CHILD_INDEX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>/sitemap_1.xml</loc></sitemap>
  <sitemap><loc>/feed.xml</loc></sitemap>
</sitemapindex>"#;

const FAN_OUT: &str = r#"<html><body>
  <a href="/slow/0">0</a> <a href="/slow/1">1</a> <a href="/slow/2">2</a> <a href="/slow/3">3</a>
  <a href="/slow/4">4</a> <a href="/slow/5">5</a> <a href="/slow/6">6</a> <a href="/slow/7">7</a>
</body></html>"#;

#[derive(Clone, Default)]
struct Site {
    visits: Arc<Mutex<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

async fn fixture(State(site): State<Site>, uri: Uri) -> Response {
    let path = uri.path().to_string();
    site.visits.lock().push(path.clone());

    let xml = |body: &'static str| ([(header::CONTENT_TYPE, "application/xml")], body).into_response();
    let html = |body: &'static str| ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], body).into_response();
    let moved = |status: StatusCode, location: &'static str| {
        (status, [(header::LOCATION, location)]).into_response()
    };

    if path.starts_with("/slow/") {
        let now = site.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        site.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        site.in_flight.fetch_sub(1, Ordering::SeqCst);
        return html("<html><body><p>slow</p></body></html>");
    }

    match path.as_str() {
        "/sitemap.xml" => xml(SITEMAP_INDEX),
        "/sitemap_1.xml" => xml(SITEMAP_1),
        "/sitemap_2.xml" => xml(SITEMAP_2),
        "/denied/sitemap.xml" => xml(DENIED_CHILD_INDEX),
        "/private/sitemap_2.xml" => xml(SITEMAP_2),
        "/feed/sitemap.xml" => xml(FEED_CHILD_INDEX),
        "/feed.xml" => xml("<feed><entry/></feed>"),
        "/" | "/1" | "/2" | "/3" => html("<html><body><p>page</p></body></html>"),
        "/500" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        "/redirect" => moved(StatusCode::MOVED_PERMANENTLY, "/redirected"),
        "/redirected" => html("<html><body><p>redirected</p></body></html>"),
        "/external/redirect" => moved(StatusCode::SEE_OTHER, "https://disallowed.com"),
        "/fan-out" => html(FAN_OUT),
        "/blocked/page" => html(r#"<html><body><a href="/1">next</a></body></html>"#),
        "/style.css" => (
            [(header::CONTENT_TYPE, "text/css")],
            "body { background-image: url('/assets/background.png'); }",
        )
            .into_response(),
        "/assets/background.png" => (
            [(header::CONTENT_TYPE, "image/png")],
            vec![0x89u8, b'P', b'N', b'G'],
        )
            .into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Records every upload and fails the keys it was told to.
#[derive(Default)]
struct RecordingUploader {
    failing_key: Option<String>,
    uploads: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Uploader for RecordingUploader {
    async fn upload_file(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
    ) -> Result<UploadOutcome, UploadError> {
        if !local_path.exists() {
            return Err(UploadError::FileNotFound(local_path.to_path_buf()));
        }
        if self.failing_key.as_deref() == Some(key) {
            return Err(UploadError::FileNotFound(local_path.with_extension("missing")));
        }
        self.uploads.lock().push((key.to_string(), content_type.to_string()));
        Ok(UploadOutcome::Uploaded)
    }
}

struct CrawlOptions {
    concurrency: usize,
    deny: Vec<Regex>,
    uploader: Option<Arc<dyn Uploader>>,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            deny: Vec::new(),
            uploader: None,
        }
    }
}

struct Harness {
    base: Url,
    site: Site,
    mirror: TempDir,
    metrics: Arc<CrawlerMetrics>,
}

impl Harness {
    async fn start() -> Self {
        let site = Site::default();
        let router = Router::new().fallback(fixture).with_state(site.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            base: Url::parse(&format!("http://{addr}/")).unwrap(),
            site,
            mirror: TempDir::new().unwrap(),
            metrics: Arc::new(CrawlerMetrics::default()),
        }
    }

    async fn crawl(&self, seed: &str) {
        self.crawl_with(seed, CrawlOptions::default()).await;
    }

    async fn crawl_with(&self, seed: &str, options: CrawlOptions) {
        let settings = RequestSettings {
            user_agent: "govuk-mirror-bot".to_string(),
            headers: Vec::new(),
        };
        let crawler = Crawler::new(
            &settings,
            FetchRules::new(vec!["127.0.0.1".to_string()], Vec::new(), options.deny),
            MirrorWriter::new(self.mirror.path()),
            options.uploader,
            self.metrics.clone(),
            options.concurrency,
        )
        .unwrap();
        let crawl = crawler.run(vec![self.base.join(seed).unwrap()]);
        tokio::time::timeout(Duration::from_secs(30), crawl)
            .await
            .expect("crawl did not finish");
    }

    fn visits(&self) -> Vec<String> {
        self.site.visits.lock().clone()
    }

    fn read(&self, relative: &str) -> String {
        let path = self.mirror.path().join("127.0.0.1").join(relative);
        std::fs::read_to_string(&path).unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
    }
}

#[tokio::test]
async fn sitemap_urls_are_visited_newest_first() {
    let harness = Harness::start().await;
    harness.crawl("/sitemap.xml").await;

    assert_eq!(
        harness.visits(),
        vec!["/sitemap.xml", "/sitemap_1.xml", "/sitemap_2.xml", "/2", "/", "/1", "/500", "/3"]
    );
    assert_eq!(harness.metrics.http_errors.get(), 1);
    assert_eq!(harness.metrics.crawled_pages.get(), 7);
    assert!(harness.read("index.html").contains("page"));
    assert!(harness.read("2.html").contains("page"));
}

#[tokio::test]
async fn redirect_leaves_a_stub_and_the_target() {
    let harness = Harness::start().await;
    harness.crawl("/redirect").await;

    let target = harness.base.join("/redirected").unwrap();
    let stub = harness.read("redirect.html");
    assert!(stub.contains(&format!("url={target}")), "stub was {stub}");
    assert!(harness.read("redirected.html").contains("redirected"));
    assert_eq!(harness.visits(), vec!["/redirect", "/redirected"]);
}

#[tokio::test]
async fn external_redirect_is_stubbed_but_not_followed() {
    let harness = Harness::start().await;
    harness.crawl("/external/redirect").await;

    let stub = harness.read("external/redirect.html");
    assert!(stub.contains("url=https://disallowed.com/"), "stub was {stub}");
    assert_eq!(harness.visits(), vec!["/external/redirect"]);
    assert_eq!(harness.metrics.http_errors.get(), 0);
    assert_eq!(harness.metrics.crawled_pages.get(), 0);
}

#[tokio::test]
async fn stylesheet_assets_are_fetched_and_stored() {
    let harness = Harness::start().await;
    harness.crawl("/style.css").await;

    assert_eq!(harness.visits(), vec!["/style.css", "/assets/background.png"]);
    let stored = harness.mirror.path().join("127.0.0.1/assets/background.png");
    assert_eq!(std::fs::read(stored).unwrap(), vec![0x89u8, b'P', b'N', b'G']);
    assert!(harness.read("style.css").contains("background.png"));
    assert_eq!(harness.metrics.files_downloaded.get(), 2);
}

#[tokio::test]
async fn denied_child_sitemap_does_not_hold_back_entries() {
    let harness = Harness::start().await;
    let options = CrawlOptions {
        deny: vec![Regex::new("/private/").unwrap()],
        ..CrawlOptions::default()
    };
    harness.crawl_with("/denied/sitemap.xml", options).await;

    assert_eq!(harness.visits(), vec!["/denied/sitemap.xml", "/sitemap_1.xml", "/"]);
    assert!(harness.read("index.html").contains("page"));
}

#[tokio::test]
async fn child_that_is_not_a_sitemap_does_not_hold_back_entries() {
    let harness = Harness::start().await;
    harness.crawl("/feed/sitemap.xml").await;

    assert_eq!(
        harness.visits(),
        vec!["/feed/sitemap.xml", "/sitemap_1.xml", "/feed.xml", "/"]
    );
    assert_eq!(harness.metrics.http_errors.get(), 0);
}

#[tokio::test]
async fn in_flight_requests_never_exceed_concurrency() {
    let harness = Harness::start().await;
    let options = CrawlOptions {
        concurrency: 2,
        ..CrawlOptions::default()
    };
    harness.crawl_with("/fan-out", options).await;

    assert_eq!(harness.visits().len(), 9);
    assert_eq!(harness.site.peak.load(Ordering::SeqCst), 2);
    assert_eq!(harness.metrics.crawled_pages.get(), 9);
}

#[tokio::test]
async fn uploads_and_upload_failures_are_counted() {
    let harness = Harness::start().await;
    let uploader = Arc::new(RecordingUploader {
        failing_key: Some("127.0.0.1/2.html".to_string()),
        ..RecordingUploader::default()
    });
    let options = CrawlOptions {
        uploader: Some(uploader.clone()),
        ..CrawlOptions::default()
    };
    harness.crawl_with("/sitemap.xml", options).await;

    assert_eq!(harness.metrics.files_downloaded.get(), 7);
    assert_eq!(harness.metrics.files_uploaded.get(), 6);
    assert_eq!(harness.metrics.file_upload_failures.get(), 1);

    let uploads = uploader.uploads.lock().clone();
    assert_eq!(uploads.len(), 6);
    assert!(uploads.contains(&(
        "127.0.0.1/index.html".to_string(),
        "text/html; charset=utf-8".to_string()
    )));
    assert!(uploads.iter().all(|(key, _)| key != "127.0.0.1/2.html"));
}

#[tokio::test]
async fn write_failure_counts_as_download_error_and_crawl_continues() {
    let harness = Harness::start().await;
    let host_dir = harness.mirror.path().join("127.0.0.1");
    std::fs::create_dir_all(&host_dir).unwrap();
    std::fs::write(host_dir.join("blocked"), b"a file where a directory is needed").unwrap();

    harness.crawl("/blocked/page").await;

    assert_eq!(harness.visits(), vec!["/blocked/page", "/1"]);
    assert_eq!(harness.metrics.download_errors.get(), 1);
    assert_eq!(harness.metrics.files_downloaded.get(), 1);
    assert!(harness.read("1.html").contains("page"));
}
