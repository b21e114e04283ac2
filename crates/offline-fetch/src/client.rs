//! Network fetch client

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName};
use http::{Request, Response};
use reqwest::Client;
use tracing::{debug, info};

use crate::error::FetchError;

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Something that can perform a network fetch
///
/// Implementations return `Ok` for any response the server produced,
/// whatever its status, and `Err` only when no response was obtained.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request<Bytes>) -> Result<Response<Bytes>, FetchError>;

    /// Fetch, following redirects to the final response
    async fn fetch_following_redirects(
        &self,
        request: &Request<Bytes>,
    ) -> Result<Response<Bytes>, FetchError> {
        self.fetch(request).await
    }
}

/// Redirect hops followed by [`Fetcher::fetch_following_redirects`]
const MAX_REDIRECTS: usize = 10;

/// HTTP fetcher configuration
#[derive(Clone, Debug)]
pub struct HttpFetcherConfig {
    /// User agent sent when the incoming request carries none
    pub user_agent: String,
    /// Skip TLS certificate verification
    pub skip_tls_verify: bool,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("offline-cache/{}", env!("CARGO_PKG_VERSION")),
            skip_tls_verify: false,
        }
    }
}

/// reqwest-backed fetcher
pub struct HttpFetcher {
    /// Hands redirects back to the caller untouched
    client: Client,
    following: Client,
}

impl HttpFetcher {
    /// Create a new HTTP fetcher
    pub fn new(config: HttpFetcherConfig) -> Result<Self, FetchError> {
        let client = Self::build_client(&config, reqwest::redirect::Policy::none())?;
        let following =
            Self::build_client(&config, reqwest::redirect::Policy::limited(MAX_REDIRECTS))?;

        info!("Created HTTP fetcher (user agent: {})", config.user_agent);

        Ok(Self { client, following })
    }

    fn build_client(
        config: &HttpFetcherConfig,
        redirect: reqwest::redirect::Policy,
    ) -> Result<Client, FetchError> {
        let mut builder = Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(redirect);

        if config.skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(builder.build()?)
    }

    async fn send(
        client: &Client,
        request: &Request<Bytes>,
    ) -> Result<Response<Bytes>, FetchError> {
        let uri = request.uri();
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(FetchError::InvalidUrl(uri.to_string()));
        }

        debug!("Fetching {} {}", request.method(), uri);

        let response = client
            .request(request.method().clone(), uri.to_string())
            .headers(forwardable_headers(request.headers()))
            .body(request.body().clone())
            .send()
            .await?;

        let status = response.status();
        let version = response.version();
        let headers = forwardable_headers(response.headers());
        let body = response.bytes().await?;

        debug!("Fetched {} -> {} ({} bytes)", uri, status, body.len());

        let mut out = Response::new(body);
        *out.status_mut() = status;
        *out.version_mut() = version;
        *out.headers_mut() = headers;
        Ok(out)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request<Bytes>) -> Result<Response<Bytes>, FetchError> {
        Self::send(&self.client, request).await
    }

    async fn fetch_following_redirects(
        &self,
        request: &Request<Bytes>,
    ) -> Result<Response<Bytes>, FetchError> {
        Self::send(&self.following, request).await
    }
}

/// Copy of `headers` without hop-by-hop and length headers
///
/// Content length is recomputed from the buffered body on the way out.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in HOP_BY_HOP.iter() {
        out.remove(name);
    }
    out.remove(header::CONTENT_LENGTH);
    out
}
