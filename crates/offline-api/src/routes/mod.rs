//! API routes

mod health;
pub mod metrics;
mod proxy;
mod status;

use axum::{Router, extract::DefaultBodyLimit};
use std::sync::Arc;

use crate::state::{AppState, MetricsHandle};

pub use proxy::SOURCE_HEADER;

/// Largest request body forwarded to the origin (16MB)
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Create the main router
pub fn create_router(state: AppState, metrics_handle: Option<Arc<MetricsHandle>>) -> Router {
    let mut router = Router::new()
        .merge(health::routes())
        .merge(status::routes())
        // Everything else is site traffic
        .fallback(proxy::proxy)
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE));

    if let Some(handle) = metrics_handle {
        router = router.merge(metrics::routes(handle));
    }

    router
}
