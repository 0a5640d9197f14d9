use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::DateTime;
use parking_lot::{Mutex, RwLock};
use reqwest::StatusCode;
use url::Url;

use super::shutdown::ShutdownListener;

/// Job name metrics are grouped under on the push gateway.
pub const PUSH_JOB: &str = "mirror_metrics";
pub const BACKEND_OVERRIDE_HEADER: &str = "Backend-Override";

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("invalid push gateway url {url:?}: {source}")]
    InvalidGateway {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("push failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("push gateway answered {0}")]
    Rejected(StatusCode),
    #[error("probe answered {0}")]
    ProbeStatus(StatusCode),
    #[error("missing Last-Modified header")]
    MissingLastModified,
    #[error("bad Last-Modified header {value:?}: {source}")]
    BadLastModified {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// f64 gauge stored as raw bits.
#[derive(Debug, Default)]
pub struct Gauge {
    bits: AtomicU64,
}

impl Gauge {
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Gauge family keyed by a single label.
#[derive(Debug)]
pub struct GaugeVec {
    label: &'static str,
    values: Mutex<BTreeMap<String, f64>>,
}

impl GaugeVec {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            values: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn set(&self, label_value: &str, value: f64) {
        self.values.lock().insert(label_value.to_string(), value);
    }

    pub fn get(&self, label_value: &str) -> Option<f64> {
        self.values.lock().get(label_value).copied()
    }
}

/// Something that renders its samples in the Prometheus text format.
pub trait Collector: Send + Sync {
    fn collect(&self, prefix: &str, out: &mut String);
}

#[derive(Debug, Default)]
pub struct CrawlerMetrics {
    pub crawled_pages: Counter,
    pub files_downloaded: Counter,
    pub http_errors: Counter,
    pub download_errors: Counter,
    pub files_uploaded: Counter,
    pub file_upload_failures: Counter,
    pub duration_minutes: Gauge,
}

impl CrawlerMetrics {
    pub fn record_duration(&self, started: Instant) {
        self.duration_minutes
            .set(started.elapsed().as_secs_f64() / 60.0);
    }
}

impl Collector for CrawlerMetrics {
    fn collect(&self, prefix: &str, out: &mut String) {
        write_counter(out, prefix, "crawled_pages_total", "Total number of pages successfully crawled", &self.crawled_pages);
        write_counter(out, prefix, "files_downloaded_total", "Total number of files downloaded by the crawler", &self.files_downloaded);
        write_counter(out, prefix, "http_errors_total", "Total number of HTTP errors encountered by the crawler", &self.http_errors);
        write_counter(out, prefix, "download_errors_total", "Total number of download errors encountered by the crawler", &self.download_errors);
        write_counter(out, prefix, "files_uploaded_total", "Total number of files the crawler has uploaded to the mirror", &self.files_uploaded);
        write_counter(out, prefix, "file_upload_failures_total", "Total number of upload failures encountered by the crawler", &self.file_upload_failures);
        write_gauge(out, prefix, "crawler_duration_minutes", "Duration of crawler in minutes", self.duration_minutes.get());
    }
}

#[derive(Debug)]
pub struct MirrorHealthMetrics {
    pub last_updated: GaugeVec,
    pub response_status: GaugeVec,
}

impl Default for MirrorHealthMetrics {
    fn default() -> Self {
        Self {
            last_updated: GaugeVec::new("backend"),
            response_status: GaugeVec::new("backend"),
        }
    }
}

impl Collector for MirrorHealthMetrics {
    fn collect(&self, prefix: &str, out: &mut String) {
        write_gauge_vec(out, prefix, "mirror_last_updated_time", "Last time the mirror was updated", &self.last_updated);
        write_gauge_vec(out, prefix, "mirror_response_status_code", "Response status code for the mirror availability probe", &self.response_status);
    }
}

/// Named collection of collectors sharing one metric name prefix.
pub struct MetricsRegistry {
    prefix: String,
    collectors: RwLock<Vec<Arc<dyn Collector>>>,
}

impl MetricsRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            collectors: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, collector: Arc<dyn Collector>) {
        self.collectors.write().push(collector);
    }

    pub fn gather(&self) -> String {
        let mut out = String::new();
        for collector in self.collectors.read().iter() {
            collector.collect(&self.prefix, &mut out);
        }
        out
    }
}

fn metric_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}_{name}")
    }
}

fn write_counter(out: &mut String, prefix: &str, name: &str, help: &str, counter: &Counter) {
    let name = metric_name(prefix, name);
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {}", counter.get());
}

fn write_gauge(out: &mut String, prefix: &str, name: &str, help: &str, value: f64) {
    let name = metric_name(prefix, name);
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

fn write_gauge_vec(out: &mut String, prefix: &str, name: &str, help: &str, gauges: &GaugeVec) {
    let name = metric_name(prefix, name);
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    for (label_value, value) in gauges.values.lock().iter() {
        let _ = writeln!(
            out,
            "{name}{{{}=\"{}\"}} {value}",
            gauges.label,
            escape_label_value(label_value)
        );
    }
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Prometheus push gateway client.
#[derive(Debug, Clone)]
pub struct PushGateway {
    client: reqwest::Client,
    url: Url,
}

impl PushGateway {
    pub fn new(client: reqwest::Client, base: &str) -> Result<Self, MetricsError> {
        let invalid = |source| MetricsError::InvalidGateway {
            url: base.to_string(),
            source,
        };
        let base = Url::parse(&format!("{}/", base.trim_end_matches('/'))).map_err(invalid)?;
        let url = base
            .join(&format!("metrics/job/{PUSH_JOB}"))
            .map_err(invalid)?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Replaces every metric in the job's group with the registry's current state.
    pub async fn push(&self, registry: &MetricsRegistry) -> Result<(), MetricsError> {
        let response = self
            .client
            .put(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(registry.gather())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MetricsError::Rejected(response.status()));
        }
        Ok(())
    }
}

/// Pushes the registry every `interval` and once more when shutdown fires.
pub async fn run_push_loop(
    registry: Arc<MetricsRegistry>,
    gateway: PushGateway,
    interval: Duration,
    mut shutdown: ShutdownListener,
) {
    let period = interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Err(err) = gateway.push(&registry).await {
                    tracing::error!(error = %err, "final metrics push failed");
                }
                tracing::info!("metrics push loop shutting down");
                return;
            }
            _ = ticker.tick() => {
                if let Err(err) = gateway.push(&registry).await {
                    tracing::error!(error = %err, "error pushing metrics to the push gateway");
                }
            }
        }
    }
}

/// Probes the mirror through each backend and records freshness and availability.
#[derive(Debug, Clone)]
pub struct MirrorProbe {
    client: reqwest::Client,
    freshness_url: Option<Url>,
    availability_url: Option<Url>,
    backends: Vec<String>,
}

impl MirrorProbe {
    pub fn new(
        client: reqwest::Client,
        freshness_url: Option<Url>,
        availability_url: Option<Url>,
        backends: Vec<String>,
    ) -> Self {
        Self {
            client,
            freshness_url,
            availability_url,
            backends,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.backends.is_empty() && (self.freshness_url.is_some() || self.availability_url.is_some())
    }

    /// Unix timestamp of the mirror's `Last-Modified` as seen through `backend`.
    pub async fn freshness(&self, url: &Url, backend: &str) -> Result<f64, MetricsError> {
        let response = self
            .client
            .get(url.clone())
            .header(BACKEND_OVERRIDE_HEADER, backend)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(MetricsError::ProbeStatus(response.status()));
        }
        let value = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .ok_or(MetricsError::MissingLastModified)?
            .to_string();
        let parsed = DateTime::parse_from_rfc2822(&value)
            .map_err(|source| MetricsError::BadLastModified { value, source })?;
        Ok(parsed.timestamp() as f64)
    }

    pub async fn availability(&self, url: &Url, backend: &str) -> Result<u16, MetricsError> {
        let response = self
            .client
            .get(url.clone())
            .header(BACKEND_OVERRIDE_HEADER, backend)
            .send()
            .await?;
        Ok(response.status().as_u16())
    }

    pub async fn probe_all(&self, health: &MirrorHealthMetrics) {
        for backend in &self.backends {
            if let Some(url) = &self.freshness_url {
                match self.freshness(url, backend).await {
                    Ok(timestamp) => health.last_updated.set(backend, timestamp),
                    Err(err) => tracing::error!(
                        metric = "mirror_last_updated_time",
                        backend = %backend,
                        error = %err,
                        "error updating metrics"
                    ),
                }
            }
            if let Some(url) = &self.availability_url {
                match self.availability(url, backend).await {
                    Ok(status) => health.response_status.set(backend, f64::from(status)),
                    Err(err) => tracing::error!(
                        metric = "mirror_response_status_code",
                        backend = %backend,
                        error = %err,
                        "error updating metrics"
                    ),
                }
            }
        }
    }
}

/// Probes immediately, then every `interval`, until shutdown.
pub async fn run_probe_loop(
    probe: MirrorProbe,
    health: Arc<MirrorHealthMetrics>,
    interval: Duration,
    mut shutdown: ShutdownListener,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("mirror probe loop shutting down");
                return;
            }
            _ = ticker.tick() => {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("mirror probe loop shutting down");
                        return;
                    }
                    _ = probe.probe_all(&health) => {}
                }
            }
        }
    }
}
