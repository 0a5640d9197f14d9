use std::time::Duration;

use reqwest::redirect;
use url::Url;

use super::client::{ClientError, MAX_REDIRECTS, RequestSettings};

pub const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    #[error("domain not accessible: {host}")]
    DomainUnreachable { host: String },
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Hosts serving assets only, with nothing at the root.
pub fn is_asset_host(host: &str) -> bool {
    host.to_ascii_lowercase().starts_with("assets.")
}

/// Confirms the seed and every allowed host answer with 2xx or 3xx.
pub async fn validate_hosts(
    settings: &RequestSettings,
    seed: Option<&Url>,
    allowed_hosts: &[String],
    timeout: Duration,
) -> Result<(), PreflightError> {
    let client = reqwest::Client::builder()
        .user_agent(settings.user_agent.clone())
        .default_headers(settings.header_map()?)
        .timeout(timeout)
        .redirect(redirect::Policy::custom(|attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.stop()
            } else {
                attempt.follow()
            }
        }))
        .build()
        .map_err(ClientError::Build)?;

    if let Some(seed) = seed {
        if !is_reachable(&client, seed.as_str()).await {
            return Err(PreflightError::DomainUnreachable {
                host: seed.to_string(),
            });
        }
    }

    let scheme = seed.map(Url::scheme).unwrap_or("https");
    for host in allowed_hosts {
        if is_asset_host(host) {
            tracing::debug!(host = %host, "skipping asset host");
            continue;
        }
        if !is_reachable(&client, &format!("{scheme}://{host}")).await {
            return Err(PreflightError::DomainUnreachable { host: host.clone() });
        }
    }
    Ok(())
}

async fn is_reachable(client: &reqwest::Client, target: &str) -> bool {
    match client.get(target).send().await {
        Ok(response) => {
            let status = response.status();
            tracing::debug!(url = %target, status = status.as_u16(), "pre-flight response");
            status.is_success() || status.is_redirection()
        }
        Err(err) => {
            tracing::warn!(url = %target, error = %err, "pre-flight request failed");
            false
        }
    }
}
