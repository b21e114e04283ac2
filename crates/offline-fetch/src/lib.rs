//! Offline Cache Network Fetcher
//!
//! This crate provides the network side of the offline cache: a small
//! fetch trait and the reqwest-backed client used against the site origin.

pub mod client;
pub mod error;

pub use client::{Fetcher, HttpFetcher, HttpFetcherConfig};
pub use error::FetchError;
