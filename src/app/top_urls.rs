use async_trait::async_trait;
use rand::RngCore;
use rand::seq::SliceRandom;
use url::Url;

use super::analytics::AnalyticsError;
use super::types::{TopUrls, UrlHitCount};

#[derive(Debug, thiserror::Error)]
pub enum SamplingError {
    #[error("requested {requested} unsampled urls, but there are only {available}")]
    NotEnoughForTop { requested: usize, available: usize },
    #[error("requested {requested} sampled urls, but only {available} remain after the top {top}")]
    NotEnoughForSample {
        requested: usize,
        available: usize,
        top: usize,
    },
}

/// Top `k` by views plus a seeded uniform sample of `m` from the rest.
pub fn sample_top_urls(
    mut urls: Vec<UrlHitCount>,
    k: usize,
    m: usize,
    rng: &mut (dyn RngCore + Send),
) -> Result<TopUrls, SamplingError> {
    if urls.len() < k {
        return Err(SamplingError::NotEnoughForTop {
            requested: k,
            available: urls.len(),
        });
    }
    if urls.len() - k < m {
        return Err(SamplingError::NotEnoughForSample {
            requested: m,
            available: urls.len() - k,
            top: k,
        });
    }

    urls.sort_by(|a, b| b.view_count.cmp(&a.view_count));
    let mut remaining = urls.split_off(k);
    remaining.shuffle(rng);
    remaining.truncate(m);

    Ok(TopUrls {
        top_unsampled: urls,
        remaining_sampled: remaining,
    })
}

/// `url,count` rows with a header line. Rows with a bad URL or count are dropped.
pub fn parse_hit_counts(csv_body: &[u8]) -> Result<Vec<UrlHitCount>, AnalyticsError> {
    let base = Url::parse("https://mirror.invalid/").map_err(AnalyticsError::BadLocation)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(csv_body);

    let mut counts = Vec::new();
    for record in reader.records() {
        let record = record?;
        let (Some(raw_url), Some(raw_count)) = (record.get(0), record.get(1)) else {
            tracing::warn!(row = ?record, "skipping short row");
            continue;
        };
        if base.join(raw_url.trim()).is_err() {
            tracing::warn!(url = raw_url, "couldn't parse url, skipping");
            continue;
        }
        let Ok(view_count) = raw_count.trim().parse::<i64>() else {
            tracing::warn!(url = raw_url, count = raw_count, "couldn't parse view count, skipping");
            continue;
        };
        counts.push(UrlHitCount::new(raw_url.trim(), view_count));
    }
    Ok(counts)
}

#[derive(Debug, thiserror::Error)]
pub enum TopUrlsError {
    #[error(transparent)]
    Analytics(#[from] AnalyticsError),
    #[error(transparent)]
    Sampling(#[from] SamplingError),
}

#[async_trait]
pub trait TopUrlsProvider: Send + Sync {
    async fn top_urls(&self, rng: &mut (dyn RngCore + Send)) -> Result<TopUrls, TopUrlsError>;
}
