//! Application state

use metrics_exporter_prometheus::PrometheusHandle;
use offline_core::{OfflineCacheManager, Release};
use offline_fetch::Fetcher;
use std::sync::Arc;
use url::Url;

/// Handle used to render the Prometheus exposition
pub type MetricsHandle = PrometheusHandle;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<OfflineCacheManager>,
    /// Used for requests the manager hands back
    pub fetcher: Arc<dyn Fetcher>,
    /// Site origin incoming paths are resolved against
    pub origin: Url,
    /// Release installed on startup and on refresh
    pub release: Arc<Release>,
}

impl AppState {
    pub fn new(
        manager: Arc<OfflineCacheManager>,
        fetcher: Arc<dyn Fetcher>,
        origin: Url,
        release: Arc<Release>,
    ) -> Self {
        Self {
            manager,
            fetcher,
            origin,
            release,
        }
    }
}
