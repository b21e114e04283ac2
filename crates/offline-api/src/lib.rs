//! Offline Cache HTTP Front
//!
//! This crate provides the Axum-based HTTP front that hosts the offline
//! cache manager: every site request is routed through the manager, plus
//! health, metrics and status endpoints.

pub mod error;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::{AppState, MetricsHandle};
