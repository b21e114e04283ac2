//! Fetch error types

use thiserror::Error;

/// Transport-level failure. An HTTP error status is not a `FetchError`.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Network unavailable: {0}")]
    Unavailable(String),
}
