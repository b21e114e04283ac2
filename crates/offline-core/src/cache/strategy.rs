//! Request routing strategies

use http::{Method, Request, header};
use serde::Serialize;
use std::fmt;

/// How a request is served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Not intercepted; the caller forwards it untouched
    Passthrough,
    /// Page loads: network, then cached copy, then the offline page
    NetworkFirst,
    /// Static assets: cached copy now, refresh in the background
    StaleWhileRevalidate,
}

impl Strategy {
    /// Pick the strategy for a request
    pub fn for_request<B>(request: &Request<B>) -> Self {
        if request.method() != Method::GET {
            Strategy::Passthrough
        } else if is_navigation(request) {
            Strategy::NetworkFirst
        } else {
            Strategy::StaleWhileRevalidate
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Passthrough => "passthrough",
            Strategy::NetworkFirst => "network-first",
            Strategy::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a served response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseSource {
    Network,
    Cache,
    OfflineFallback,
    /// Synthesized when neither network nor cache could answer
    Unavailable,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseSource::Network => "network",
            ResponseSource::Cache => "cache",
            ResponseSource::OfflineFallback => "offline-fallback",
            ResponseSource::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A top-level document load: `Sec-Fetch-Mode: navigate` or an `Accept`
/// header asking for HTML
pub fn is_navigation<B>(request: &Request<B>) -> bool {
    let navigate_mode = request
        .headers()
        .get("sec-fetch-mode")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("navigate"));

    let accepts_html = request
        .headers()
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("text/html"));

    navigate_mode || accepts_html
}
