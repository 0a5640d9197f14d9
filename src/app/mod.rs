pub mod analytics;
pub mod client;
pub mod compare;
pub mod config;
pub mod crawl;
pub mod drift;
pub mod fetcher;
pub mod files;
pub mod logging;
pub mod metrics;
pub mod mime;
pub mod preflight;
pub mod rules;
pub mod runtime;
pub mod shutdown;
pub mod sitemap;
pub mod store;
pub mod top_urls;
pub mod types;
pub mod upload;
