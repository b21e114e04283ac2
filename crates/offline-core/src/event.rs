//! Lifecycle events
//!
//! The three events a host delivers to the manager, dispatched through a
//! single entry point.

use bytes::Bytes;
use http::Request;

use crate::cache::{ActivationReport, FetchOutcome, InstallReport, OfflineCacheManager};
use crate::error::CoreError;
use crate::release::Release;

#[derive(Debug)]
pub enum LifecycleEvent {
    Install(Release),
    Activate,
    Fetch(Request<Bytes>),
}

#[derive(Debug)]
pub enum EventOutcome {
    Installed(InstallReport),
    Activated(ActivationReport),
    Fetch(FetchOutcome),
}

impl OfflineCacheManager {
    /// Dispatch a lifecycle event to the matching operation
    pub async fn handle(&self, event: LifecycleEvent) -> Result<EventOutcome, CoreError> {
        match event {
            LifecycleEvent::Install(release) => {
                self.install(&release).await.map(EventOutcome::Installed)
            }
            LifecycleEvent::Activate => self.activate().await.map(EventOutcome::Activated),
            LifecycleEvent::Fetch(request) => {
                self.handle_request(request).await.map(EventOutcome::Fetch)
            }
        }
    }
}
