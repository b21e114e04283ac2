//! Offline cache management module

mod lifecycle;
mod manager;
mod strategy;

pub use lifecycle::LifecycleState;
pub use manager::{
    ActivationReport, CacheStats, ClearReport, FetchOutcome, InstallReport, ManagerStatus,
    OfflineCacheConfig, OfflineCacheManager, Served,
};
pub use strategy::{ResponseSource, Strategy, is_navigation};
