use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveDate};
use rand::RngCore;
use url::Url;

use super::store::{HttpObjectStore, ObjectStore, StoreError};
use super::top_urls::{self, TopUrlsError, TopUrlsProvider};
use super::types::TopUrls;

/// Yesterday's most viewed pages from the CDN request logs.
///
/// [`PublishedResultsEngine`] never executes this. It is the query behind the
/// scheduled export whose dated output that engine reads, and any
/// [`QueryEngine`] that runs SQL itself receives it through [`AnalyticsQuery`].
pub const TOP_URLS_SQL: &str = r#"
SELECT
    url, count(1) as "count"
FROM
    fastly_logs.govuk_www
WHERE
    date = ?
    AND month = ?
    AND year = ?
    AND url NOT LIKE '%/assets/%'
    AND url NOT LIKE '/api/%'
    AND url NOT LIKE '/search/%'
    AND status >= 200 AND status < 300
GROUP BY
    url
ORDER BY
    "count" DESC
LIMIT 1000
"#;

#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    #[error("query {id} did not succeed, it ended in state {state}")]
    QueryFailed { id: String, state: QueryState },
    #[error("query engine error: {0}")]
    Engine(String),
    #[error("query {id} succeeded without an output location")]
    MissingOutput { id: String },
    #[error("invalid results location: {0}")]
    BadLocation(#[from] url::ParseError),
    #[error("fetching results: {0}")]
    Store(#[from] StoreError),
    #[error("reading CSV results: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueryState::Queued => "QUEUED",
            QueryState::Running => "RUNNING",
            QueryState::Succeeded => "SUCCEEDED",
            QueryState::Failed => "FAILED",
            QueryState::Cancelled => "CANCELLED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyticsQuery {
    pub sql: String,
    /// Day, month, year.
    pub parameters: [String; 3],
}

impl AnalyticsQuery {
    pub fn top_urls_for(day: NaiveDate) -> Self {
        Self {
            sql: TOP_URLS_SQL.to_string(),
            parameters: [
                day.day().to_string(),
                day.month().to_string(),
                day.year().to_string(),
            ],
        }
    }

    pub fn top_urls_yesterday() -> Self {
        let today = Local::now().date_naive();
        Self::top_urls_for(today.pred_opt().unwrap_or(today))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryStatus {
    pub state: QueryState,
    pub output_location: Option<String>,
}

#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn start_query(&self, query: &AnalyticsQuery) -> Result<String, AnalyticsError>;
    async fn query_status(&self, id: &str) -> Result<QueryStatus, AnalyticsError>;
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn fetch_results(&self, location: &ResultLocation) -> Result<Vec<u8>, AnalyticsError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultLocation {
    Bucket { bucket: String, key: String },
    Http(Url),
    File(PathBuf),
}

impl ResultLocation {
    pub fn parse(raw: &str) -> Result<Self, AnalyticsError> {
        let raw = raw.trim();
        if raw.starts_with("s3://") {
            let url = Url::parse(raw)?;
            return Ok(ResultLocation::Bucket {
                bucket: url.host_str().unwrap_or_default().to_string(),
                key: url.path().trim_start_matches('/').to_string(),
            });
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Ok(ResultLocation::Http(Url::parse(raw)?));
        }
        Ok(ResultLocation::File(PathBuf::from(raw.trim_start_matches("file://"))))
    }
}

impl fmt::Display for ResultLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultLocation::Bucket { bucket, key } => write!(f, "s3://{bucket}/{key}"),
            ResultLocation::Http(url) => write!(f, "{url}"),
            ResultLocation::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Results exported on a schedule to a dated location.
///
/// The query's SQL is ignored: only its date parameters are used, to fill
/// the `{year}`, `{month}` and `{day}` placeholders of the location template.
#[derive(Debug, Clone)]
pub struct PublishedResultsEngine {
    template: String,
}

impl PublishedResultsEngine {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn render(&self, query: &AnalyticsQuery) -> String {
        let [day, month, year] = &query.parameters;
        self.template
            .replace("{day}", day)
            .replace("{month}", month)
            .replace("{year}", year)
    }
}

#[async_trait]
impl QueryEngine for PublishedResultsEngine {
    async fn start_query(&self, query: &AnalyticsQuery) -> Result<String, AnalyticsError> {
        Ok(self.render(query))
    }

    async fn query_status(&self, id: &str) -> Result<QueryStatus, AnalyticsError> {
        Ok(QueryStatus {
            state: QueryState::Succeeded,
            output_location: Some(id.to_string()),
        })
    }
}

#[async_trait]
impl ResultStore for HttpObjectStore {
    async fn fetch_results(&self, location: &ResultLocation) -> Result<Vec<u8>, AnalyticsError> {
        match location {
            ResultLocation::Bucket { bucket, key } => Ok(self.get_object(bucket, key).await?),
            ResultLocation::Http(url) => {
                let response = reqwest::get(url.clone()).await.map_err(StoreError::from)?;
                let status = response.status();
                if !status.is_success() {
                    return Err(AnalyticsError::Store(StoreError::Status {
                        status,
                        bucket: String::new(),
                        key: url.to_string(),
                    }));
                }
                Ok(response.bytes().await.map_err(StoreError::from)?.to_vec())
            }
            ResultLocation::File(path) => tokio::fs::read(path).await.map_err(|source| {
                AnalyticsError::Store(StoreError::Io {
                    path: path.clone(),
                    source,
                })
            }),
        }
    }
}

/// Runs the hit-count query, waits for it and samples the CSV it produced.
pub struct AnalyticsTopUrls {
    engine: Arc<dyn QueryEngine>,
    results: Arc<dyn ResultStore>,
    poll_interval: Duration,
    top_count: usize,
    sampled_count: usize,
}

impl AnalyticsTopUrls {
    pub fn new(
        engine: Arc<dyn QueryEngine>,
        results: Arc<dyn ResultStore>,
        poll_interval: Duration,
        top_count: usize,
        sampled_count: usize,
    ) -> Self {
        Self {
            engine,
            results,
            poll_interval,
            top_count,
            sampled_count,
        }
    }

    async fn wait_for(&self, id: &str) -> Result<ResultLocation, AnalyticsError> {
        tracing::info!(query = id, "waiting for query to complete");
        let status = loop {
            let status = self.engine.query_status(id).await?;
            tracing::debug!(query = id, state = %status.state, "query state");
            if !matches!(status.state, QueryState::Queued | QueryState::Running) {
                break status;
            }
            tokio::time::sleep(self.poll_interval).await;
        };

        if status.state != QueryState::Succeeded {
            tracing::error!(query = id, state = %status.state, "query did not succeed");
            return Err(AnalyticsError::QueryFailed {
                id: id.to_string(),
                state: status.state,
            });
        }
        let output = status
            .output_location
            .ok_or_else(|| AnalyticsError::MissingOutput { id: id.to_string() })?;
        tracing::info!(query = id, output = %output, "query succeeded");
        ResultLocation::parse(&output)
    }
}

#[async_trait]
impl TopUrlsProvider for AnalyticsTopUrls {
    async fn top_urls(&self, rng: &mut (dyn RngCore + Send)) -> Result<TopUrls, TopUrlsError> {
        let query = AnalyticsQuery::top_urls_yesterday();
        let id = self.engine.start_query(&query).await?;
        let location = self.wait_for(&id).await?;

        let body = self.results.fetch_results(&location).await?;
        let counts = top_urls::parse_hit_counts(&body)?;
        tracing::info!(rows = counts.len(), location = %location, "hit counts loaded");
        Ok(top_urls::sample_top_urls(
            counts,
            self.top_count,
            self.sampled_count,
            rng,
        )?)
    }
}
