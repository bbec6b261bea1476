//! kubetemplater kubehub: watchers, periodic resync and the API-backed
//! template source and status writers.

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use kube::Client;

mod status;
mod tracker;
mod watch;

pub use status::{policy_status_patch, template_status_patch, KubeStatusSink, KubeTemplateSource};
pub use tracker::GenerationTracker;
pub use watch::{resync_loop, watch_policies, watch_templates, WatchContext};

/// Seconds between full resyncs.
pub const RESYNC_ENV: &str = "KT_RESYNC_SECS";
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(300);

/// Resync period from `KT_RESYNC_SECS`; zero or unparsable values fall back to the default.
pub fn resync_period_from_env() -> Duration {
    std::env::var(RESYNC_ENV)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|n| *n > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RESYNC)
}

/// Client from kubeconfig or the in-cluster environment.
pub async fn client() -> anyhow::Result<Client> {
    Client::try_default().await.context("building kube client (kubeconfig or in-cluster env)")
}
