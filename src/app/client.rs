use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect;
use url::Url;

use super::files::SaveError;
use super::rules::FetchRules;

pub const CRAWL_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_REDIRECTS: usize = 5;

/// Called once per URL already in a redirect chain, with the newest target.
pub type RedirectInterceptor = Arc<dyn Fn(&Url, &Url) -> Result<(), SaveError> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("redirect to {target} is disallowed")]
    DisallowedRedirect { target: Url },
    #[error("stopped after {MAX_REDIRECTS} redirects")]
    TooManyRedirects,
    #[error("writing redirect stub for {from}: {source}")]
    RedirectStub {
        from: Url,
        #[source]
        source: SaveError,
    },
    #[error("invalid header {name:?}")]
    InvalidHeader { name: String },
    #[error("building http client: {0}")]
    Build(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Default)]
pub struct RequestSettings {
    pub user_agent: String,
    pub headers: Vec<(String, String)>,
}

impl RequestSettings {
    pub fn header_map(&self) -> Result<HeaderMap, ClientError> {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            let invalid = || ClientError::InvalidHeader { name: name.clone() };
            let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| invalid())?;
            let value = HeaderValue::from_str(value.trim()).map_err(|_| invalid())?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

/// Shared crawl client: one cookie jar, 60s timeout, rule-checked redirects.
///
/// Every redirect first runs the interceptor over the chain so far, then is
/// checked against `rules`. A disallowed target ends the chain with
/// [`ClientError::DisallowedRedirect`].
pub fn build_crawl_client(
    settings: &RequestSettings,
    rules: Arc<FetchRules>,
    interceptor: Option<RedirectInterceptor>,
) -> Result<reqwest::Client, ClientError> {
    let policy = redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() > MAX_REDIRECTS {
            return attempt.error(ClientError::TooManyRedirects);
        }
        if let Some(intercept) = &interceptor {
            let target = attempt.url().clone();
            let mut failed = None;
            for from in attempt.previous() {
                if let Err(source) = intercept(from, &target) {
                    failed = Some((from.clone(), source));
                    break;
                }
            }
            if let Some((from, source)) = failed {
                return attempt.error(ClientError::RedirectStub { from, source });
            }
        }
        if !rules.allows(attempt.url()) {
            let target = attempt.url().clone();
            return attempt.error(ClientError::DisallowedRedirect { target });
        }
        attempt.follow()
    });

    Ok(reqwest::Client::builder()
        .user_agent(settings.user_agent.clone())
        .default_headers(settings.header_map()?)
        .cookie_store(true)
        .timeout(CRAWL_TIMEOUT)
        .redirect(policy)
        .build()?)
}

/// Plain client carrying the user agent and custom headers.
pub fn build_plain_client(settings: &RequestSettings) -> Result<reqwest::Client, ClientError> {
    Ok(reqwest::Client::builder()
        .user_agent(settings.user_agent.clone())
        .default_headers(settings.header_map()?)
        .build()?)
}

/// The redirect-policy error carried inside a transport error, if any.
pub fn redirect_error(err: &reqwest::Error) -> Option<&ClientError> {
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(current) = source {
        if let Some(found) = current.downcast_ref::<ClientError>() {
            return Some(found);
        }
        source = current.source();
    }
    None
}
