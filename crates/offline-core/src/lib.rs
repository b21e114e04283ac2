//! Offline Cache Core Logic
//!
//! This crate provides the offline cache manager: versioned cache
//! generations, the install/activate lifecycle, and the per-request
//! network-first and stale-while-revalidate strategies.

pub mod cache;
pub mod error;
pub mod event;
pub mod release;

#[cfg(test)]
mod testing;

pub use cache::{
    ActivationReport, CacheStats, ClearReport, FetchOutcome, InstallReport, LifecycleState,
    ManagerStatus, OfflineCacheConfig, OfflineCacheManager, ResponseSource, Served, Strategy,
};
pub use error::{CoreError, ManifestFailure};
pub use event::{EventOutcome, LifecycleEvent};
pub use release::{Manifest, Release, ResolvedRelease};
