//! Website mirroring: crawl a site to disk and object storage, watch the
//! mirror's health, and detect drift between the mirror and the live site.

pub mod app;
