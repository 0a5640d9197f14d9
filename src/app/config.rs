use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser};
use regex::Regex;
use url::Url;

use super::client::RequestSettings;
use super::rules::FetchRules;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),
    #[error("invalid header entry {0:?}, expected key:value")]
    InvalidHeader(String),
    #[error("invalid url rule {pattern:?}: {source}")]
    InvalidRule {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid SITE {value:?}: {source}")]
    InvalidSite {
        value: String,
        #[source]
        source: url::ParseError,
    },
    #[error("S3_BUCKET_NAME is required when uploads are enabled")]
    MissingBucket,
    #[error("TOP_URLS_RESULTS is required")]
    MissingResultsLocation,
}

/// Parses Go-style durations: `500ms`, `10s`, `4h`, `1h30m`, `1.5m`.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(raw.to_string());
    let input = raw.trim();
    if input.is_empty() {
        return Err(invalid());
    }
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0f64;
    let mut rest = input;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if number_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        total += value * seconds_per_unit;
        rest = &rest[unit_len..];
    }
    Ok(Duration::from_secs_f64(total))
}

/// `k:v,k2:v2` header list. Values may themselves contain `:`.
pub fn parse_headers(raw: &str) -> Result<HeaderList, ConfigError> {
    let mut headers = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, value) = entry
            .split_once(':')
            .ok_or_else(|| ConfigError::InvalidHeader(entry.to_string()))?;
        if name.trim().is_empty() {
            return Err(ConfigError::InvalidHeader(entry.to_string()));
        }
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(HeaderList(headers))
}

pub fn parse_regex(raw: &str) -> Result<Regex, ConfigError> {
    Regex::new(raw.trim()).map_err(|source| ConfigError::InvalidRule {
        pattern: raw.to_string(),
        source,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList(pub Vec<(String, String)>);

#[derive(Debug, Clone, Args)]
pub struct LoggingArgs {
    /// TRACE, DEBUG, INFO, WARN or ERROR.
    #[arg(long, env = "LOG_LEVEL", default_value = "INFO")]
    pub log_level: String,
}

#[derive(Debug, Clone, Args)]
pub struct RequestArgs {
    #[arg(long, env = "USER_AGENT", default_value = "govuk-mirror-bot")]
    pub user_agent: String,

    /// Extra request headers, `key:value,key2:value2`.
    #[arg(long, env = "HEADERS", value_parser = parse_headers)]
    pub headers: Option<HeaderList>,
}

impl RequestArgs {
    pub fn settings(&self) -> RequestSettings {
        RequestSettings {
            user_agent: self.user_agent.clone(),
            headers: self.headers.clone().unwrap_or_default().0,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct StoreArgs {
    /// S3-compatible endpoint; the regional AWS endpoint when unset.
    #[arg(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    #[arg(long, env = "AWS_REGION", default_value = "eu-west-2")]
    pub aws_region: String,
}

impl StoreArgs {
    pub fn endpoint(&self) -> String {
        match self.s3_endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => endpoint.to_string(),
            _ => format!("https://s3.{}.amazonaws.com", self.aws_region.trim()),
        }
    }
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "site-mirror",
    version,
    about = "Crawls a site into a static mirror and uploads it to an object store"
)]
pub struct MirrorArgs {
    /// Seed URL; empty skips seeding.
    #[arg(long, env = "SITE")]
    pub site: Option<String>,

    #[arg(long, env = "ALLOWED_DOMAINS", value_delimiter = ',')]
    pub allowed_domains: Vec<String>,

    #[command(flatten)]
    pub request: RequestArgs,

    #[arg(long, env = "CONCURRENCY", value_name = "N", default_value_t = 10)]
    pub concurrency: usize,

    #[arg(long = "async", env = "ASYNC", default_value_t = true, action = ArgAction::Set)]
    pub async_mode: bool,

    /// Every URL must match all of these.
    #[arg(long, env = "URL_RULES", value_delimiter = ',', value_parser = parse_regex)]
    pub url_rules: Vec<Regex>,

    #[arg(long, env = "DISALLOWED_URL_RULES", value_delimiter = ',', value_parser = parse_regex)]
    pub disallowed_url_rules: Vec<Regex>,

    #[arg(long, env = "SKIP_VALIDATION", default_value_t = false, action = ArgAction::Set)]
    pub skip_validation: bool,

    #[arg(long, env = "MIRROR_DIR", default_value = ".")]
    pub mirror_dir: PathBuf,

    #[arg(long, env = "UPLOAD_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub upload_enabled: bool,

    #[arg(long, env = "S3_BUCKET_NAME")]
    pub s3_bucket_name: Option<String>,

    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long, env = "PUSHGATEWAY_URL")]
    pub pushgateway_url: Option<String>,

    #[arg(long, env = "METRICS_PREFIX", default_value = "govuk")]
    pub metrics_prefix: String,

    #[arg(long, env = "METRIC_REFRESH_INTERVAL", default_value = "10s", value_parser = parse_duration)]
    pub metric_refresh_interval: Duration,

    #[arg(long, env = "REFRESH_INTERVAL", default_value = "4h", value_parser = parse_duration)]
    pub refresh_interval: Duration,

    #[arg(long, env = "MIRROR_FRESHNESS_URL")]
    pub mirror_freshness_url: Option<Url>,

    #[arg(long, env = "MIRROR_AVAILABILITY_URL")]
    pub mirror_availability_url: Option<Url>,

    #[arg(long, env = "BACKENDS", value_delimiter = ',')]
    pub backends: Vec<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

impl MirrorArgs {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.seed()?;
        if self.upload_enabled && self.bucket().is_none() {
            return Err(ConfigError::MissingBucket);
        }
        Ok(())
    }

    pub fn seed(&self) -> Result<Option<Url>, ConfigError> {
        match self.site.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => Url::parse(raw)
                .map(Some)
                .map_err(|source| ConfigError::InvalidSite {
                    value: raw.to_string(),
                    source,
                }),
        }
    }

    pub fn bucket(&self) -> Option<&str> {
        self.s3_bucket_name
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
    }

    pub fn effective_concurrency(&self) -> usize {
        if self.async_mode {
            self.concurrency.max(1)
        } else {
            1
        }
    }

    pub fn fetch_rules(&self) -> FetchRules {
        FetchRules::new(
            self.allowed_domains.clone(),
            self.url_rules.clone(),
            self.disallowed_url_rules.clone(),
        )
    }

    pub fn backends(&self) -> Vec<String> {
        clean_list(&self.backends)
    }
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "drift-check",
    version,
    about = "Compares popular pages between the live site and its mirror"
)]
pub struct DriftCheckArgs {
    #[arg(long, env = "SITE")]
    pub site: Url,

    #[arg(long, env = "COMPARE_TOP_UNSAMPLED_COUNT", default_value_t = 100)]
    pub compare_top_unsampled_count: usize,

    #[arg(long, env = "COMPARE_REMAINING_SAMPLED_COUNT", default_value_t = 100)]
    pub compare_remaining_sampled_count: usize,

    /// Posts the summary here when set, otherwise prints it.
    #[arg(long, env = "SLACK_WEBHOOK")]
    pub slack_webhook: Option<Url>,

    /// Location of the published hit counts, `{year}`, `{month}` and `{day}` are filled in.
    #[arg(long, env = "TOP_URLS_RESULTS")]
    pub top_urls_results: Option<String>,

    #[arg(long, env = "ANALYTICS_POLL_INTERVAL", default_value = "500ms", value_parser = parse_duration)]
    pub analytics_poll_interval: Duration,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Fixes the sampler seed; random when unset.
    #[arg(long, env = "RANDOM_SEED")]
    pub random_seed: Option<u64>,

    #[command(flatten)]
    pub request: RequestArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

impl DriftCheckArgs {
    pub fn results_location(&self) -> Result<&str, ConfigError> {
        self.top_urls_results
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or(ConfigError::MissingResultsLocation)
    }
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "mirror-status",
    version,
    about = "Probes mirror backends and serves the results as Prometheus metrics"
)]
pub struct StatusCheckArgs {
    #[arg(long, env = "MIRROR_FRESHNESS_URL")]
    pub mirror_freshness_url: Option<Url>,

    #[arg(long, env = "MIRROR_AVAILABILITY_URL")]
    pub mirror_availability_url: Option<Url>,

    #[arg(long, env = "BACKENDS", value_delimiter = ',')]
    pub backends: Vec<String>,

    #[arg(long, env = "STATUS_CHECK_REFRESH_INTERVAL", default_value = "1m", value_parser = parse_duration)]
    pub refresh_interval: Duration,

    #[arg(long, env = "STATUS_LISTEN_ADDR", default_value = "0.0.0.0:9090")]
    pub listen_addr: SocketAddr,

    #[arg(long, env = "METRICS_PREFIX", default_value = "govuk")]
    pub metrics_prefix: String,

    #[command(flatten)]
    pub request: RequestArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

impl StatusCheckArgs {
    pub fn backends(&self) -> Vec<String> {
        clean_list(&self.backends)
    }
}

fn clean_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("4h").unwrap(), Duration::from_secs(4 * 3600));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5m").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        for bad in ["", "10", "s", "10d", "1h30"] {
            assert!(parse_duration(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn headers() {
        let parsed = parse_headers("X-Auth: secret , Rate-Limit-Token:abc:def").unwrap();
        assert_eq!(
            parsed.0,
            vec![
                ("X-Auth".to_string(), "secret".to_string()),
                ("Rate-Limit-Token".to_string(), "abc:def".to_string())
            ]
        );
        assert!(parse_headers("novalue").is_err());
        assert!(parse_headers("").unwrap().0.is_empty());
    }

    #[test]
    fn bad_rule_is_rejected() {
        assert!(parse_regex("(unclosed").is_err());
        assert!(parse_regex("^https://www\\.gov\\.uk/").is_ok());
    }

    #[test]
    fn mirror_defaults_and_lists() {
        let args = MirrorArgs::try_parse_from([
            "site-mirror",
            "--site",
            "https://www.gov.uk/",
            "--allowed-domains",
            "www.gov.uk,assets.publishing.service.gov.uk",
            "--disallowed-url-rules",
            "/search,\\?",
            "--s3-bucket-name",
            "mirror",
            "--async",
            "false",
        ])
        .unwrap();

        args.validate().unwrap();
        assert_eq!(args.allowed_domains.len(), 2);
        assert_eq!(args.disallowed_url_rules.len(), 2);
        assert_eq!(args.effective_concurrency(), 1);
        assert_eq!(args.metric_refresh_interval, Duration::from_secs(10));
        assert_eq!(args.refresh_interval, Duration::from_secs(4 * 3600));
        assert_eq!(args.request.user_agent, "govuk-mirror-bot");
        assert_eq!(args.metrics_prefix, "govuk");

        let rules = args.fetch_rules();
        assert!(rules.allows(&Url::parse("https://www.gov.uk/browse").unwrap()));
        assert!(!rules.allows(&Url::parse("https://www.gov.uk/search/all").unwrap()));
    }

    #[test]
    fn upload_requires_bucket() {
        let args = MirrorArgs::try_parse_from(["site-mirror", "--site", "https://www.gov.uk/"]).unwrap();
        if args.s3_bucket_name.is_none() && args.upload_enabled {
            assert!(matches!(args.validate(), Err(ConfigError::MissingBucket)));
        }

        let args = MirrorArgs::try_parse_from([
            "site-mirror",
            "--site",
            "https://www.gov.uk/",
            "--upload-enabled",
            "false",
        ])
        .unwrap();
        args.validate().unwrap();
    }

    #[test]
    fn bad_site_is_rejected() {
        let args = MirrorArgs::try_parse_from([
            "site-mirror",
            "--site",
            "not a url",
            "--upload-enabled",
            "false",
        ])
        .unwrap();
        assert!(matches!(args.validate(), Err(ConfigError::InvalidSite { .. })));
    }

    #[test]
    fn status_defaults() {
        let args = StatusCheckArgs::try_parse_from([
            "mirror-status",
            "--backends",
            "mirrorS3, mirrorGCS,",
        ])
        .unwrap();
        assert_eq!(args.backends(), vec!["mirrorS3", "mirrorGCS"]);
        assert_eq!(args.listen_addr, "0.0.0.0:9090".parse().unwrap());
    }

    #[test]
    fn store_endpoint_follows_region_unless_set() {
        let args = DriftCheckArgs::try_parse_from([
            "drift-check",
            "--site",
            "https://www.gov.uk",
            "--aws-region",
            "us-east-1",
        ])
        .unwrap();
        assert_eq!(args.store.endpoint(), "https://s3.us-east-1.amazonaws.com");

        let args = DriftCheckArgs::try_parse_from([
            "drift-check",
            "--site",
            "https://www.gov.uk",
            "--s3-endpoint",
            "http://localhost:9000/",
        ])
        .unwrap();
        assert_eq!(args.store.endpoint(), "http://localhost:9000/");
        assert_eq!(args.store.aws_region, "eu-west-2");
    }
}
