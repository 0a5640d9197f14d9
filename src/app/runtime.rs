use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rusty_s3::Credentials;
use tokio::net::TcpListener;

use super::analytics::{AnalyticsTopUrls, PublishedResultsEngine};
use super::client;
use super::compare::VisibleTextComparer;
use super::config::{DriftCheckArgs, MirrorArgs, StatusCheckArgs, StoreArgs};
use super::crawl::Crawler;
use super::drift::{DriftChecker, DriftNotifier, StdoutNotifier, WebhookNotifier};
use super::fetcher::HttpPageFetcher;
use super::files::MirrorWriter;
use super::metrics::{
    self, CrawlerMetrics, MetricsRegistry, MirrorHealthMetrics, MirrorProbe, PushGateway,
};
use super::preflight;
use super::shutdown::{self, Shutdown, ShutdownListener};
use super::store::HttpObjectStore;
use super::top_urls::TopUrlsProvider;
use super::types::CrawlReport;
use super::upload::{ObjectUploader, Uploader};

/// Validates, crawls until the queue drains, then stops the metric loops
/// after their final push.
pub async fn run_mirror(args: MirrorArgs) -> Result<CrawlReport> {
    args.validate().context("invalid configuration")?;
    let settings = args.request.settings();
    let seed = args.seed()?;
    let plain = client::build_plain_client(&settings).context("building http client")?;

    if args.skip_validation {
        tracing::info!("skipping pre-flight validation");
    } else {
        preflight::validate_hosts(
            &settings,
            seed.as_ref(),
            &args.allowed_domains,
            preflight::PREFLIGHT_TIMEOUT,
        )
        .await
        .context("pre-flight validation failed")?;
    }

    let registry = Arc::new(MetricsRegistry::new(args.metrics_prefix.clone()));
    let crawler_metrics = Arc::new(CrawlerMetrics::default());
    let health = Arc::new(MirrorHealthMetrics::default());
    registry.register(crawler_metrics.clone());
    registry.register(health.clone());

    let shutdown = Shutdown::new();
    let mut loops = Vec::new();
    match args.pushgateway_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => {
            let gateway = PushGateway::new(plain.clone(), url).context("invalid PUSHGATEWAY_URL")?;
            loops.push(tokio::spawn(metrics::run_push_loop(
                registry.clone(),
                gateway,
                args.metric_refresh_interval,
                shutdown.listener(),
            )));
        }
        _ => tracing::warn!("PUSHGATEWAY_URL not set, metrics will not be pushed"),
    }

    let probe = MirrorProbe::new(
        plain.clone(),
        args.mirror_freshness_url.clone(),
        args.mirror_availability_url.clone(),
        args.backends(),
    );
    if probe.is_configured() {
        loops.push(tokio::spawn(metrics::run_probe_loop(
            probe,
            health,
            args.refresh_interval,
            shutdown.listener(),
        )));
    }

    let uploader: Option<Arc<dyn Uploader>> = match args.bucket().filter(|_| args.upload_enabled) {
        Some(bucket) => {
            let store = object_store(plain.clone(), &args.store)?;
            Some(Arc::new(ObjectUploader::new(Arc::new(store), bucket)))
        }
        None => {
            tracing::info!("uploads disabled");
            None
        }
    };

    let crawler = Crawler::new(
        &settings,
        args.fetch_rules(),
        MirrorWriter::new(&args.mirror_dir),
        uploader,
        crawler_metrics.clone(),
        args.effective_concurrency(),
    )
    .context("creating crawler")?;

    let started = Instant::now();
    let report = crawler.run(seed.into_iter().collect()).await;
    crawler_metrics.record_duration(started);
    tracing::info!(minutes = crawler_metrics.duration_minutes.get(), "crawler finished");

    shutdown.trigger();
    for handle in loops {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "metrics task failed");
        }
    }
    Ok(report)
}

/// Returns the process exit code: 1 on drift or a failed notification.
pub async fn run_drift_check(args: DriftCheckArgs) -> Result<i32> {
    let location = args.results_location()?.to_string();
    let plain = client::build_plain_client(&args.request.settings()).context("building http client")?;
    let store = Arc::new(object_store(plain.clone(), &args.store)?);
    let provider = AnalyticsTopUrls::new(
        Arc::new(PublishedResultsEngine::new(location)),
        store,
        args.analytics_poll_interval,
        args.compare_top_unsampled_count,
        args.compare_remaining_sampled_count,
    );

    let seed = args.random_seed.unwrap_or_else(rand::random);
    tracing::debug!(seed, "sampler seeded");
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let urls = provider
        .top_urls(&mut rng)
        .await
        .context("error generating top urls")?;

    let site = args.site.to_string();
    let notifier: Box<dyn DriftNotifier> = match args.slack_webhook.clone() {
        Some(webhook) => Box::new(WebhookNotifier::new(plain.clone(), webhook, site.clone())),
        None => Box::new(StdoutNotifier::new(site.clone())),
    };
    let fetcher = HttpPageFetcher::new(plain, args.site.clone());
    let checker = DriftChecker::new(&fetcher, &VisibleTextComparer, notifier.as_ref());

    let outcome = checker.check_pages_for_drift(&urls).await;
    Ok(outcome.exit_code())
}

/// Credentials come from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and
/// the optional `AWS_SESSION_TOKEN`.
fn object_store(client: reqwest::Client, args: &StoreArgs) -> Result<HttpObjectStore> {
    let credentials = Credentials::from_env();
    if credentials.is_none() {
        tracing::warn!("AWS credentials not set, object store requests will be unsigned");
    }
    let endpoint = args.endpoint();
    tracing::debug!(endpoint = %endpoint, region = %args.aws_region, "object store configured");
    HttpObjectStore::new(client, &endpoint, &args.aws_region, credentials)
        .with_context(|| format!("invalid S3_ENDPOINT {endpoint}"))
}

/// Probes the mirror and serves the gauges until Ctrl-C.
pub async fn run_status_check(args: StatusCheckArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen_addr)
        .await
        .with_context(|| format!("binding {}", args.listen_addr))?;
    let shutdown = Shutdown::new();
    shutdown::trigger_on_ctrl_c(shutdown.clone());
    serve_status(args, listener, shutdown).await
}

pub async fn serve_status(args: StatusCheckArgs, listener: TcpListener, shutdown: Shutdown) -> Result<()> {
    let plain = client::build_plain_client(&args.request.settings()).context("building http client")?;
    let registry = Arc::new(MetricsRegistry::new(args.metrics_prefix.clone()));
    let health = Arc::new(MirrorHealthMetrics::default());
    registry.register(health.clone());

    let probe = MirrorProbe::new(
        plain,
        args.mirror_freshness_url.clone(),
        args.mirror_availability_url.clone(),
        args.backends(),
    );
    if !probe.is_configured() {
        tracing::warn!("no mirror urls or backends configured, nothing will be probed");
    }
    let probe_loop = tokio::spawn(metrics::run_probe_loop(
        probe,
        health,
        args.refresh_interval,
        shutdown.listener(),
    ));

    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(registry);
    tracing::info!(addr = %listener.local_addr()?, "serving metrics");

    let mut stop: ShutdownListener = shutdown.listener();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            stop.cancelled().await;
            tracing::info!("metrics server shutting down");
        })
        .await
        .context("metrics server error")?;

    shutdown.trigger();
    if let Err(err) = probe_loop.await {
        tracing::error!(error = %err, "probe task failed");
    }
    Ok(())
}

async fn render_metrics(State(registry): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        registry.gather(),
    )
}
