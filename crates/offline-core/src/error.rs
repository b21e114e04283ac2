//! Core error types

use serde::Serialize;
use thiserror::Error;

use crate::cache::LifecycleState;

/// A precache resource that could not be fetched
#[derive(Debug, Clone, Serialize)]
pub struct ManifestFailure {
    pub url: String,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] offline_storage::StorageError),

    #[error("Precache of {generation} failed for {} resource(s)", failures.len())]
    ManifestFetchFailed {
        generation: String,
        failures: Vec<ManifestFailure>,
    },

    #[error("Nothing has been installed to activate")]
    NothingToActivate,

    #[error("Lifecycle busy: {0}")]
    Busy(LifecycleState),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid release: {0}")]
    InvalidRelease(String),
}
