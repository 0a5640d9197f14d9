use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

use super::metrics::BACKEND_OVERRIDE_HEADER;
use super::types::Page;

pub const LIVE_BACKEND: &str = "never";
pub const MIRROR_BACKEND: &str = "mirrorS3";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid page path {path:?}: {source}")]
    InvalidPath {
        path: String,
        #[source]
        source: url::ParseError,
    },
    #[error("fetching {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("fetching {url}: status {status}")]
    Status { url: String, status: StatusCode },
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_live_page(&self, path: &str) -> Result<Page, FetchError>;
    async fn fetch_mirror_page(&self, path: &str) -> Result<Page, FetchError>;
}

/// Fetches paths below `base_url`, steering the CDN with `Backend-Override`.
#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpPageFetcher {
    pub fn new(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    /// `base_url`'s path joined with `path`; the query of `path` is kept.
    pub fn page_url(&self, path: &str) -> Result<Url, FetchError> {
        let invalid = |source| FetchError::InvalidPath {
            path: path.to_string(),
            source,
        };
        let relative = Url::parse("https://mirror.invalid/")
            .and_then(|dummy| dummy.join(path))
            .map_err(invalid)?;

        let mut url = self.base_url.clone();
        let joined = format!(
            "{}/{}",
            self.base_url.path().trim_end_matches('/'),
            relative.path().trim_start_matches('/')
        );
        url.set_path(&joined);
        url.set_query(relative.query());
        url.set_fragment(None);
        Ok(url)
    }

    async fn fetch(&self, path: &str, backend: &str) -> Result<Page, FetchError> {
        let url = self.page_url(path)?;
        let transport = |source| FetchError::Transport {
            url: url.to_string(),
            source,
        };
        let response = self
            .client
            .get(url.clone())
            .header(BACKEND_OVERRIDE_HEADER, backend)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.text().await.map_err(transport)?;
        Ok(Page { body, content_type })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_live_page(&self, path: &str) -> Result<Page, FetchError> {
        self.fetch(path, LIVE_BACKEND).await
    }

    async fn fetch_mirror_page(&self, path: &str) -> Result<Page, FetchError> {
        self.fetch(path, MIRROR_BACKEND).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::RawQuery;
    use axum::http::{HeaderMap, StatusCode as AxumStatus, header};
    use axum::response::IntoResponse;
    use axum::routing::get;

    async fn serve(router: Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    fn fetcher(base: &str) -> HttpPageFetcher {
        HttpPageFetcher::new(reqwest::Client::new(), Url::parse(base).unwrap())
    }

    #[test]
    fn page_urls_join_onto_the_base_path() {
        assert_eq!(
            fetcher("https://www.gov.uk").page_url("/browse?x=1").unwrap().as_str(),
            "https://www.gov.uk/browse?x=1"
        );
        assert_eq!(
            fetcher("https://mirror.example/prefix/").page_url("/a/b").unwrap().as_str(),
            "https://mirror.example/prefix/a/b"
        );
    }

    #[tokio::test]
    async fn backends_are_selected_by_header() {
        let base = serve(Router::new().route(
            "/page",
            get(|headers: HeaderMap, RawQuery(query): RawQuery| async move {
                let backend = headers
                    .get(BACKEND_OVERRIDE_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                (
                    [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                    format!("{backend}:{}", query.unwrap_or_default()),
                )
            }),
        ))
        .await;
        let fetcher = HttpPageFetcher::new(reqwest::Client::new(), base);

        let live = fetcher.fetch_live_page("/page?v=2").await.unwrap();
        assert_eq!(live.body, "never:v=2");
        assert_eq!(live.content_type, "text/html; charset=utf-8");
        let mirror = fetcher.fetch_mirror_page("/page").await.unwrap();
        assert_eq!(mirror.body, "mirrorS3:");
    }

    #[tokio::test]
    async fn non_ok_status_is_an_error() {
        let base = serve(Router::new().route(
            "/gone",
            get(|| async { AxumStatus::GONE.into_response() }),
        ))
        .await;
        let fetcher = HttpPageFetcher::new(reqwest::Client::new(), base);

        let err = fetcher.fetch_live_page("/gone").await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status, .. } if status == StatusCode::GONE));
    }
}
