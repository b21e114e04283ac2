//! Site proxy
//!
//! Every request that is not one of the front's own endpoints is rewritten
//! against the site origin and handed to the offline cache manager.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, Request, Uri, header},
    response::Response,
};
use bytes::Bytes;
use offline_core::FetchOutcome;
use offline_fetch::client::forwardable_headers;
use tracing::{debug, warn};
use url::Url;

use crate::error::ApiError;
use crate::state::AppState;

/// Response header naming where a managed response came from
pub const SOURCE_HEADER: &str = "x-offline-cache";

/// Fallback handler for all site traffic
pub async fn proxy(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = origin_request(&state.origin, method, &uri, headers, body)?;
    debug!("{} {}", request.method(), request.uri());

    match state.manager.handle_request(request).await? {
        FetchOutcome::Respond(served) => {
            debug!(
                "{} served from {} ({})",
                uri, served.source, served.strategy
            );
            let mut response = into_response(served.response);
            response.headers_mut().insert(
                SOURCE_HEADER,
                HeaderValue::from_static(served.source.as_str()),
            );
            Ok(response)
        }
        FetchOutcome::Passthrough(request) => {
            let response = state.fetcher.fetch(&request).await.map_err(|e| {
                warn!("Upstream request for {} failed: {}", request.uri(), e);
                ApiError::Fetch(e)
            })?;
            Ok(into_response(response))
        }
    }
}

/// Rebuild an incoming request as an absolute request against the origin
///
/// Only the path and query of the incoming URI are used, so the scheme and
/// host always come from the origin.
fn origin_request(
    origin: &Url,
    method: Method,
    uri: &Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Request<Bytes>, ApiError> {
    let mut url = origin.clone();
    url.set_path(uri.path());
    url.set_query(uri.query());

    let mut request = Request::builder()
        .method(method)
        .uri(url.as_str())
        .body(body)
        .map_err(|e| ApiError::BadRequest(format!("{}: {}", uri, e)))?;

    *request.headers_mut() = headers;
    request.headers_mut().remove(header::HOST);
    Ok(request)
}

fn into_response(response: http::Response<Bytes>) -> Response {
    let (mut parts, body) = response.into_parts();
    parts.headers = forwardable_headers(&parts.headers);
    Response::from_parts(parts, Body::from(body))
}
