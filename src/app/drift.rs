use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use url::Url;

use super::compare::PageComparer;
use super::fetcher::PageFetcher;
use super::types::{DriftSummary, TopUrls, UrlHitCount};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("posting drift summary: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("notification rejected with status {0}")]
    NotifyFailed(StatusCode),
}

#[async_trait]
pub trait DriftNotifier: Send + Sync {
    async fn notify(&self, summary: &DriftSummary) -> Result<(), NotifyError>;
}

pub fn summary_text(site: &str, summary: &DriftSummary) -> String {
    format!("Drifts were detected between the live and mirror versions of pages on {site}\n{summary}")
}

#[derive(Debug, Serialize)]
struct WebhookMessage<'a> {
    text: &'a str,
    username: &'a str,
}

/// Posts the summary to a chat webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhook: Url,
    site: String,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, webhook: Url, site: impl Into<String>) -> Self {
        Self {
            client,
            webhook,
            site: site.into(),
        }
    }
}

#[async_trait]
impl DriftNotifier for WebhookNotifier {
    async fn notify(&self, summary: &DriftSummary) -> Result<(), NotifyError> {
        let text = summary_text(&self.site, summary);
        let username = format!("Mirror drift detection: {}", self.site);
        let response = self
            .client
            .post(self.webhook.clone())
            .json(&WebhookMessage {
                text: &text,
                username: &username,
            })
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(NotifyError::NotifyFailed(response.status()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StdoutNotifier {
    site: String,
}

impl StdoutNotifier {
    pub fn new(site: impl Into<String>) -> Self {
        Self { site: site.into() }
    }
}

#[async_trait]
impl DriftNotifier for StdoutNotifier {
    async fn notify(&self, summary: &DriftSummary) -> Result<(), NotifyError> {
        println!("{}", summary_text(&self.site, summary));
        Ok(())
    }
}

/// Compares live and mirror copies of every sampled page.
pub struct DriftChecker<'a> {
    fetcher: &'a dyn PageFetcher,
    comparer: &'a dyn PageComparer,
    notifier: &'a dyn DriftNotifier,
}

#[derive(Debug)]
pub struct DriftOutcome {
    pub summary: DriftSummary,
    pub drift_detected: bool,
    pub notify_error: Option<NotifyError>,
}

impl DriftOutcome {
    /// 1 on drift or a failed notification.
    pub fn exit_code(&self) -> i32 {
        if self.drift_detected || self.notify_error.is_some() { 1 } else { 0 }
    }
}

impl<'a> DriftChecker<'a> {
    pub fn new(
        fetcher: &'a dyn PageFetcher,
        comparer: &'a dyn PageComparer,
        notifier: &'a dyn DriftNotifier,
    ) -> Self {
        Self {
            fetcher,
            comparer,
            notifier,
        }
    }

    pub async fn check_pages_for_drift(&self, urls: &TopUrls) -> DriftOutcome {
        let mut summary = DriftSummary::default();

        tracing::info!(count = urls.top_unsampled.len(), "comparing top unsampled paths");
        self.compare_all(&urls.top_unsampled, &mut summary).await;
        tracing::info!(count = urls.remaining_sampled.len(), "comparing remaining sampled paths");
        self.compare_all(&urls.remaining_sampled, &mut summary).await;

        tracing::info!(
            pages_compared = summary.pages_compared,
            drifts_detected = summary.drifts_detected,
            errors = summary.errors,
            "drift check finished"
        );

        if summary.drifts_detected == 0 {
            return DriftOutcome {
                summary,
                drift_detected: false,
                notify_error: None,
            };
        }

        let notify_error = match self.notifier.notify(&summary).await {
            Ok(()) => None,
            Err(err) => {
                tracing::error!(error = %err, "failed to send drift notification");
                Some(err)
            }
        };
        DriftOutcome {
            summary,
            drift_detected: true,
            notify_error,
        }
    }

    async fn compare_all(&self, pages: &[UrlHitCount], summary: &mut DriftSummary) {
        for page in pages {
            let path = page.url.as_str();
            let live = match self.fetcher.fetch_live_page(path).await {
                Ok(live) => live,
                Err(err) => {
                    tracing::error!(path, error = %err, "error fetching live page");
                    summary.errors += 1;
                    continue;
                }
            };
            let mirror = match self.fetcher.fetch_mirror_page(path).await {
                Ok(mirror) => mirror,
                Err(err) => {
                    tracing::error!(path, error = %err, "error fetching mirror page");
                    summary.errors += 1;
                    continue;
                }
            };

            summary.pages_compared += 1;
            match self.comparer.have_same_body(&live, &mirror) {
                Ok(true) => tracing::info!(path, views = page.view_count, drift = false, "compared"),
                Ok(false) => {
                    summary.drifts_detected += 1;
                    tracing::warn!(path, views = page.view_count, drift = true, "drift detected between live and mirror");
                }
                Err(err) => {
                    summary.errors += 1;
                    tracing::error!(path, error = %err, "error comparing live and mirror pages");
                }
            }
        }
    }
}
