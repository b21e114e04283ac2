//! Cache keys and stored response snapshots

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a cached request: method, absolute URL and the values of any
/// headers the cache is configured to vary on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
    /// Lowercased header name and value pairs, sorted by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vary: Vec<(String, String)>,
}

impl RequestKey {
    /// Key for a plain GET of `url` with no varying headers
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET.to_string(),
            url: url.into(),
            vary: Vec::new(),
        }
    }

    /// Build the key for a request, picking up the listed headers if present
    pub fn from_request<B>(request: &Request<B>, vary_headers: &[String]) -> Self {
        let mut vary: Vec<(String, String)> = vary_headers
            .iter()
            .filter_map(|name| {
                let name = name.to_ascii_lowercase();
                let values: Vec<&str> = request
                    .headers()
                    .get_all(name.as_str())
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .collect();
                if values.is_empty() {
                    None
                } else {
                    Some((name, values.join(", ")))
                }
            })
            .collect();
        vary.sort();
        vary.dedup_by(|a, b| a.0 == b.0);

        Self {
            method: request.method().as_str().to_ascii_uppercase(),
            url: request.uri().to_string(),
            vary,
        }
    }

    /// The same request with no varying headers
    pub fn without_vary(&self) -> Self {
        Self {
            method: self.method.clone(),
            url: self.url.clone(),
            vary: Vec::new(),
        }
    }

    /// Hex SHA-256 of the canonical key form, stable across runs
    pub fn digest(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)?;
        for (name, value) in &self.vary {
            write!(f, " [{}: {}]", name, value)?;
        }
        Ok(())
    }
}

/// Snapshot of a response as kept in a cache generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub stored_at: DateTime<Utc>,
}

impl StoredResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            stored_at: Utc::now(),
        }
    }

    /// Capture a live response. Header values that are not valid UTF-8 are dropped.
    pub fn from_response(response: &Response<Bytes>) -> Self {
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self::new(response.status().as_u16(), headers, response.body().clone())
    }

    /// Rebuild an `http::Response` from the snapshot
    pub fn to_response(&self) -> Response<Bytes> {
        let mut response = Response::new(self.body.clone());
        *response.status_mut() = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);

        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        response
    }

    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_ok(&self) -> bool {
        self.status == StatusCode::OK.as_u16()
    }
}
