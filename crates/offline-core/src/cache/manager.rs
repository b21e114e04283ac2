//! Offline cache manager implementation

use bytes::Bytes;
use futures::future::join_all;
use http::{Request, Response, StatusCode, header};
use offline_fetch::Fetcher;
use offline_storage::{CacheStore, RequestKey, StoredResponse};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::lifecycle::{Generation, Lifecycle, LifecycleState};
use super::strategy::{ResponseSource, Strategy};
use crate::error::{CoreError, ManifestFailure};
use crate::release::Release;

/// Configuration for the offline cache manager
#[derive(Debug, Clone)]
pub struct OfflineCacheConfig {
    /// Origin that relative manifest entries resolve against
    pub origin: Url,
    /// Request headers that take part in cache keys
    pub vary_headers: Vec<String>,
}

impl OfflineCacheConfig {
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            vary_headers: Vec::new(),
        }
    }
}

/// Request counters since startup
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub network: u64,
    pub cache: u64,
    pub offline_fallback: u64,
    pub unavailable: u64,
    pub passthrough: u64,
    pub revalidations: u64,
    pub revalidation_failures: u64,
    /// Live responses not stored because they were not a 200
    pub writes_skipped: u64,
}

/// A response chosen by the manager
#[derive(Debug)]
pub struct Served {
    pub response: Response<Bytes>,
    pub source: ResponseSource,
    pub strategy: Strategy,
}

/// Result of handling an intercepted request
#[derive(Debug)]
pub enum FetchOutcome {
    Respond(Served),
    /// Not intercepted; the request is handed back for the caller to forward
    Passthrough(Request<Bytes>),
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub generation: String,
    pub version: String,
    pub precached: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivationReport {
    pub generation: String,
    /// Generations removed from the store
    pub deleted: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearReport {
    /// Generations removed from the store
    pub deleted: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub state: LifecycleState,
    pub active_generation: Option<String>,
    pub active_version: Option<String>,
    pub pending_generation: Option<String>,
    pub precached: usize,
    /// Every generation present in the store
    pub generations: Vec<String>,
    pub stats: CacheStats,
}

/// State shared with background revalidation tasks
struct Shared {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    lifecycle: RwLock<Lifecycle>,
    stats: RwLock<CacheStats>,
    /// Request-path writes hold this shared; purges hold it exclusively
    writes: tokio::sync::RwLock<()>,
}

impl Shared {
    /// Read an entry, treating store failures as a miss
    async fn lookup(&self, generation: &str, key: &RequestKey) -> Option<StoredResponse> {
        match self.store.get(generation, key).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Cache read failed for {} in {}: {}", key, generation, e);
                None
            }
        }
    }

    /// Read the entry for a request, falling back to the entry stored
    /// without vary headers (precached entries carry none)
    async fn lookup_request(&self, generation: &str, key: &RequestKey) -> Option<StoredResponse> {
        if let Some(found) = self.lookup(generation, key).await {
            return Some(found);
        }
        if key.vary.is_empty() {
            return None;
        }
        self.lookup(generation, &key.without_vary()).await
    }

    /// Store a live response if it is a 200 and `generation` still serves
    async fn commit(&self, generation: &str, key: &RequestKey, response: &Response<Bytes>) {
        if response.status() != StatusCode::OK {
            debug!("Not caching {} (status {})", key, response.status());
            self.stats.write().writes_skipped += 1;
            return;
        }

        // Held until the put lands, so a purge cannot run between check and write
        let _writes = self.writes.read().await;

        let serving = self.lifecycle.read().is_serving(generation);
        if !serving {
            debug!("{} no longer serving, dropping write of {}", generation, key);
            return;
        }

        let value = StoredResponse::from_response(response);
        if let Err(e) = self.store.put(generation, key, value).await {
            warn!("Failed to cache {} in {}: {}", key, generation, e);
        }
    }

    /// Delete generations matching `filter` once in-flight request writes finish
    async fn purge(
        &self,
        filter: offline_storage::GenerationFilter<'_>,
    ) -> Result<Vec<String>, CoreError> {
        let _writes = self.writes.write().await;
        let deleted = self.store.delete_generations(filter).await?;
        metrics::counter!("offline_cache_generations_deleted_total")
            .increment(deleted.len() as u64);
        Ok(deleted)
    }

    fn record(&self, strategy: Strategy, source: ResponseSource) {
        {
            let mut stats = self.stats.write();
            match source {
                ResponseSource::Network => stats.network += 1,
                ResponseSource::Cache => stats.cache += 1,
                ResponseSource::OfflineFallback => stats.offline_fallback += 1,
                ResponseSource::Unavailable => stats.unavailable += 1,
            }
        }

        metrics::counter!(
            "offline_cache_requests_total",
            "strategy" => strategy.as_str(),
            "source" => source.as_str()
        )
        .increment(1);
    }
}

/// Offline cache manager
///
/// Owns the install/activate lifecycle and decides, per request, whether
/// to answer from the network, the active generation or the offline page.
pub struct OfflineCacheManager {
    shared: Arc<Shared>,
    config: OfflineCacheConfig,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl OfflineCacheManager {
    /// Create a new offline cache manager
    pub fn new(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        config: OfflineCacheConfig,
    ) -> Self {
        info!(
            "Initializing offline cache manager (origin: {}, vary: {:?})",
            config.origin, config.vary_headers
        );

        Self {
            shared: Arc::new(Shared {
                store,
                fetcher,
                lifecycle: RwLock::new(Lifecycle::default()),
                stats: RwLock::new(CacheStats::default()),
                writes: tokio::sync::RwLock::new(()),
            }),
            config,
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &OfflineCacheConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.lifecycle.read().state()
    }

    /// Name of the generation currently answering lookups
    pub fn active_generation(&self) -> Option<String> {
        self.shared
            .lifecycle
            .read()
            .serving()
            .map(|g| g.name.clone())
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.stats.read().clone()
    }

    // ==================== Lifecycle ====================

    /// Precache a release into its own generation
    ///
    /// Every manifest resource must come back as a 200 before anything is
    /// written. On failure the half-built generation is removed and the
    /// active generation, if any, keeps serving.
    pub async fn install(&self, release: &Release) -> Result<InstallReport, CoreError> {
        let generation = release.generation();
        self.shared.lifecycle.write().begin_install()?;

        info!(
            "Installing {} ({} precache entries)",
            generation,
            release.manifest().len()
        );

        match self.precache(release, &generation).await {
            Ok(installed) => {
                let report = InstallReport {
                    generation: installed.name.clone(),
                    version: installed.version.clone(),
                    precached: installed.precached,
                };
                self.shared.lifecycle.write().install_succeeded(installed);
                metrics::counter!("offline_cache_installs_total", "result" => "ok").increment(1);
                info!(
                    "Installed {} ({} resources), ready to activate",
                    report.generation, report.precached
                );
                Ok(report)
            }
            Err(e) => {
                self.discard_partial(&generation).await;
                self.shared.lifecycle.write().install_failed();
                metrics::counter!("offline_cache_installs_total", "result" => "failed")
                    .increment(1);
                warn!("Install of {} failed: {}", generation, e);
                Err(e)
            }
        }
    }

    async fn precache(&self, release: &Release, generation: &str) -> Result<Generation, CoreError> {
        let resolved = release.resolve(&self.config.origin)?;
        let urls = &resolved.urls;

        let results = join_all(urls.iter().map(|url| self.fetch_precache(url))).await;

        let mut entries = Vec::with_capacity(urls.len());
        let mut failures = Vec::new();
        for (url, result) in urls.iter().zip(results) {
            match result {
                Ok(response) => entries.push((RequestKey::get(url.as_str()), response)),
                Err(reason) => {
                    warn!("Precache of {} failed: {}", url, reason);
                    failures.push(ManifestFailure {
                        url: url.to_string(),
                        reason,
                    });
                }
            }
        }

        if !failures.is_empty() {
            return Err(CoreError::ManifestFetchFailed {
                generation: generation.to_string(),
                failures,
            });
        }

        self.shared.store.open(generation).await?;
        for (key, response) in &entries {
            self.shared
                .store
                .put(generation, key, StoredResponse::from_response(response))
                .await?;
        }

        Ok(Generation {
            name: generation.to_string(),
            version: release.version().to_string(),
            offline_key: RequestKey::get(resolved.offline_url.as_str()),
            precached: entries.len(),
        })
    }

    async fn fetch_precache(&self, url: &Url) -> Result<Response<Bytes>, String> {
        let request = Request::get(url.as_str())
            .body(Bytes::new())
            .map_err(|e| e.to_string())?;

        match self.shared.fetcher.fetch_following_redirects(&request).await {
            Ok(response) if response.status() == StatusCode::OK => Ok(response),
            Ok(response) => Err(format!("status {}", response.status().as_u16())),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Remove a generation left behind by a failed install
    async fn discard_partial(&self, generation: &str) {
        // Reinstalling the serving version writes into it; never delete that
        let serving = self.shared.lifecycle.read().is_serving(generation);
        if serving {
            return;
        }

        let result = self
            .shared
            .store
            .delete_generations(&|name: &str| name == generation)
            .await;
        match result {
            Ok(deleted) if !deleted.is_empty() => {
                debug!("Discarded partial generation {}", generation)
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to discard partial generation {}: {}", generation, e),
        }
    }

    /// Delete every other generation, then start serving the installed one
    pub async fn activate(&self) -> Result<ActivationReport, CoreError> {
        let target = self.shared.lifecycle.write().begin_activate()?;
        info!("Activating {}", target.name);

        let keep = target.name.clone();
        let result = self.shared.purge(&|name: &str| name != keep).await;

        match result {
            Ok(deleted) => {
                for name in &deleted {
                    info!("Deleted old cache generation {}", name);
                }

                self.shared.lifecycle.write().activation_succeeded(target);
                info!("{} is active and claiming requests", keep);

                Ok(ActivationReport {
                    generation: keep,
                    deleted,
                })
            }
            Err(e) => {
                self.shared.lifecycle.write().activation_failed();
                warn!("Activation of {} failed: {}", keep, e);
                Err(e)
            }
        }
    }

    /// Delete every generation and stop serving
    ///
    /// The manager returns to `Idle` and passes requests through until the
    /// next install and activation.
    pub async fn clear(&self) -> Result<ClearReport, CoreError> {
        self.shared.lifecycle.write().begin_clear()?;
        info!("Clearing every cache generation");

        let result = self.shared.purge(&|_: &str| true).await;
        self.shared.lifecycle.write().clear_finished();

        let deleted = result.inspect_err(|e| warn!("Clearing the cache failed: {}", e))?;
        for name in &deleted {
            info!("Deleted cache generation {}", name);
        }
        Ok(ClearReport { deleted })
    }

    /// Install then activate right away, without waiting for old clients
    pub async fn install_and_activate(
        &self,
        release: &Release,
    ) -> Result<(InstallReport, ActivationReport), CoreError> {
        let installed = self.install(release).await?;
        let activated = self.activate().await?;
        Ok((installed, activated))
    }

    /// Adopt the release's generation if the store already holds every
    /// manifest resource for it, e.g. after a restart with a disk store.
    ///
    /// Returns whether the generation was adopted.
    pub async fn resume(&self, release: &Release) -> Result<bool, CoreError> {
        let generation = release.generation();
        let resolved = release.resolve(&self.config.origin)?;
        let urls = &resolved.urls;

        let stored: HashSet<RequestKey> = self
            .shared
            .store
            .keys(&generation)
            .await?
            .into_iter()
            .collect();

        let complete = urls
            .iter()
            .all(|url| stored.contains(&RequestKey::get(url.as_str())));
        if !complete {
            debug!("{} is not complete in the store, not resuming", generation);
            return Ok(false);
        }

        self.shared.lifecycle.write().resume(Generation {
            name: generation.clone(),
            version: release.version().to_string(),
            offline_key: RequestKey::get(resolved.offline_url.as_str()),
            precached: urls.len(),
        })?;

        info!("Resumed {} from the existing cache", generation);
        Ok(true)
    }

    pub async fn status(&self) -> Result<ManagerStatus, CoreError> {
        let generations = self.shared.store.generations().await?;

        let lifecycle = self.shared.lifecycle.read();
        Ok(ManagerStatus {
            state: lifecycle.state(),
            active_generation: lifecycle.active().map(|g| g.name.clone()),
            active_version: lifecycle.active().map(|g| g.version.clone()),
            pending_generation: lifecycle.pending().map(|g| g.name.clone()),
            precached: lifecycle.active().map(|g| g.precached).unwrap_or(0),
            generations,
            stats: self.shared.stats.read().clone(),
        })
    }

    // ==================== Requests ====================

    /// Decide how to answer a request
    ///
    /// Network failures never surface as errors here: they turn into a
    /// cached copy, the offline page, or a synthesized 503/504.
    pub async fn handle_request(&self, request: Request<Bytes>) -> Result<FetchOutcome, CoreError> {
        let strategy = Strategy::for_request(&request);
        let serving = self.shared.lifecycle.read().serving().cloned();

        let generation = match (strategy, serving) {
            (Strategy::Passthrough, _) => return Ok(self.passthrough(request)),
            (_, None) => {
                debug!("No active generation, passing {} through", request.uri());
                return Ok(self.passthrough(request));
            }
            (_, Some(generation)) => generation,
        };

        let key = self.request_key(&request)?;

        let (response, source) = if strategy == Strategy::NetworkFirst {
            self.network_first(request, &key, &generation).await
        } else {
            self.stale_while_revalidate(request, key, &generation).await
        };

        self.shared.record(strategy, source);

        Ok(FetchOutcome::Respond(Served {
            response,
            source,
            strategy,
        }))
    }

    fn passthrough(&self, request: Request<Bytes>) -> FetchOutcome {
        self.shared.stats.write().passthrough += 1;
        FetchOutcome::Passthrough(request)
    }

    /// Cache key with the URL in its normalized absolute form
    fn request_key(&self, request: &Request<Bytes>) -> Result<RequestKey, CoreError> {
        let mut key = RequestKey::from_request(request, &self.config.vary_headers);
        let url = Url::parse(&key.url)
            .map_err(|e| CoreError::InvalidRequest(format!("{}: {}", request.uri(), e)))?;
        key.url = url.to_string();
        Ok(key)
    }

    async fn network_first(
        &self,
        request: Request<Bytes>,
        key: &RequestKey,
        generation: &Generation,
    ) -> (Response<Bytes>, ResponseSource) {
        match self.shared.fetcher.fetch(&request).await {
            Ok(response) => {
                self.shared.commit(&generation.name, key, &response).await;
                (response, ResponseSource::Network)
            }
            Err(e) => {
                debug!("Network failed for {}: {}, trying cache", key, e);

                if let Some(cached) = self.shared.lookup_request(&generation.name, key).await {
                    return (cached.to_response(), ResponseSource::Cache);
                }

                if let Some(offline) = self
                    .shared
                    .lookup(&generation.name, &generation.offline_key)
                    .await
                {
                    return (offline.to_response(), ResponseSource::OfflineFallback);
                }

                warn!(
                    "Offline page {} missing from {}",
                    generation.offline_key.url, generation.name
                );
                (
                    unavailable(StatusCode::SERVICE_UNAVAILABLE),
                    ResponseSource::Unavailable,
                )
            }
        }
    }

    async fn stale_while_revalidate(
        &self,
        request: Request<Bytes>,
        key: RequestKey,
        generation: &Generation,
    ) -> (Response<Bytes>, ResponseSource) {
        if let Some(cached) = self.shared.lookup_request(&generation.name, &key).await {
            debug!("Cache hit for {}, revalidating in background", key);
            self.spawn_revalidation(request, key, generation.name.clone());
            return (cached.to_response(), ResponseSource::Cache);
        }

        match self.shared.fetcher.fetch(&request).await {
            Ok(response) => {
                self.shared.commit(&generation.name, &key, &response).await;
                (response, ResponseSource::Network)
            }
            Err(e) => {
                debug!("Cache miss and network failed for {}: {}", key, e);
                (
                    unavailable(StatusCode::GATEWAY_TIMEOUT),
                    ResponseSource::Unavailable,
                )
            }
        }
    }

    fn spawn_revalidation(&self, request: Request<Bytes>, key: RequestKey, generation: String) {
        let shared = Arc::clone(&self.shared);

        let handle = tokio::spawn(async move {
            match shared.fetcher.fetch(&request).await {
                Ok(response) => {
                    shared.stats.write().revalidations += 1;
                    shared.commit(&generation, &key, &response).await;
                    metrics::counter!("offline_cache_revalidations_total", "result" => "ok")
                        .increment(1);
                }
                Err(e) => {
                    debug!("Revalidation of {} failed: {}", key, e);
                    shared.stats.write().revalidation_failures += 1;
                    metrics::counter!("offline_cache_revalidations_total", "result" => "failed")
                        .increment(1);
                }
            }
        });

        let mut background = self.background.lock();
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    /// Wait for every background revalidation started so far
    pub async fn settle(&self) {
        loop {
            let handles = std::mem::take(&mut *self.background.lock());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!("Background revalidation task failed: {}", e);
                }
            }
        }
    }
}

/// Placeholder answer when neither network nor cache can respond
fn unavailable(status: StatusCode) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from_static(b"Offline: content not available"));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::Manifest;
    use crate::testing::{FakeFetcher, GatedStore};
    use offline_storage::{LocalStore, MemoryStore};
    use std::time::Duration;

    const ORIGIN: &str = "https://site.test/";
    const HOME: &str = "https://site.test/";
    const INDEX: &str = "https://site.test/index.html";
    const OFFLINE: &str = "https://site.test/offline.html";
    const CSS: &str = "https://site.test/styles/home.css";
    const CDN: &str = "https://cdn.test/all.min.css";

    fn release(version: &str) -> Release {
        Release::new(
            "site",
            version,
            Manifest::new([
                "./",
                "index.html",
                "offline.html",
                "styles/home.css",
                CDN,
                "/",
            ]),
            "offline.html",
        )
        .unwrap()
    }

    fn site() -> Arc<FakeFetcher> {
        let fetcher = FakeFetcher::new();
        fetcher.set(HOME, 200, "home v1");
        fetcher.set(INDEX, 200, "index v1");
        fetcher.set(OFFLINE, 200, "you are offline");
        fetcher.set(CSS, 200, "css v1");
        fetcher.set(CDN, 200, "cdn css");
        Arc::new(fetcher)
    }

    fn manager(store: &Arc<MemoryStore>, fetcher: &Arc<FakeFetcher>) -> OfflineCacheManager {
        manager_over(store.clone(), fetcher, &[])
    }

    fn manager_over(
        store: Arc<dyn CacheStore>,
        fetcher: &Arc<FakeFetcher>,
        vary_headers: &[&str],
    ) -> OfflineCacheManager {
        let mut config = OfflineCacheConfig::new(Url::parse(ORIGIN).unwrap());
        config.vary_headers = vary_headers.iter().map(|h| h.to_string()).collect();
        OfflineCacheManager::new(store, fetcher.clone(), config)
    }

    fn navigate(url: &str) -> Request<Bytes> {
        Request::get(url)
            .header("sec-fetch-mode", "navigate")
            .header("accept", "text/html")
            .body(Bytes::new())
            .unwrap()
    }

    fn asset(url: &str) -> Request<Bytes> {
        Request::get(url)
            .header("accept", "*/*")
            .body(Bytes::new())
            .unwrap()
    }

    fn with_language(mut request: Request<Bytes>, language: &'static str) -> Request<Bytes> {
        request.headers_mut().insert(
            "accept-language",
            header::HeaderValue::from_static(language),
        );
        request
    }

    fn served(outcome: FetchOutcome) -> Served {
        match outcome {
            FetchOutcome::Respond(served) => served,
            FetchOutcome::Passthrough(request) => panic!("unexpected passthrough of {}", request.uri()),
        }
    }

    fn body(served: &Served) -> &str {
        std::str::from_utf8(served.response.body()).unwrap()
    }

    async fn stored_body(store: &MemoryStore, generation: &str, url: &str) -> Option<Bytes> {
        store
            .get(generation, &RequestKey::get(url))
            .await
            .unwrap()
            .map(|r| r.body)
    }

    #[tokio::test]
    async fn test_install_precaches_every_manifest_url() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);

        let report = manager.install(&release("v7")).await.unwrap();
        assert_eq!(report.generation, "site-v7");
        // "./" and "/" resolve to the same URL
        assert_eq!(report.precached, 5);
        assert_eq!(manager.state(), LifecycleState::Installed);
        assert_eq!(fetcher.calls(HOME), 1);

        for url in [HOME, INDEX, OFFLINE, CSS, CDN] {
            assert!(
                stored_body(&store, "site-v7", url).await.is_some(),
                "{} not precached",
                url
            );
        }

        // Installed but not yet active: nothing is claimed
        let outcome = manager.handle_request(asset(CSS)).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Passthrough(_)));
    }

    #[tokio::test]
    async fn test_failed_install_leaves_active_generation_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);
        manager.install_and_activate(&release("v6")).await.unwrap();

        fetcher.set(CSS, 404, "gone");
        let err = manager.install(&release("v7")).await.unwrap_err();
        match err {
            CoreError::ManifestFetchFailed {
                generation,
                failures,
            } => {
                assert_eq!(generation, "site-v7");
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].url, CSS);
                assert_eq!(failures[0].reason, "status 404");
            }
            other => panic!("unexpected error: {}", other),
        }

        assert_eq!(manager.state(), LifecycleState::Active);
        assert_eq!(manager.active_generation().as_deref(), Some("site-v6"));
        assert_eq!(store.generations().await.unwrap(), vec!["site-v6".to_string()]);
        assert!(matches!(
            manager.activate().await.map(|r| r.generation),
            Ok(ref g) if g == "site-v6"
        ));
    }

    #[tokio::test]
    async fn test_failed_install_while_offline_activates_nothing() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);

        fetcher.set_offline(true);
        let err = manager.install(&release("v7")).await.unwrap_err();
        assert!(matches!(err, CoreError::ManifestFetchFailed { ref failures, .. } if failures.len() == 5));

        assert_eq!(manager.state(), LifecycleState::Idle);
        assert!(store.generations().await.unwrap().is_empty());
        assert!(matches!(
            manager.activate().await,
            Err(CoreError::NothingToActivate)
        ));
    }

    #[tokio::test]
    async fn test_activation_leaves_only_current_generation() {
        let store = Arc::new(MemoryStore::new());
        store.open("site-v5").await.unwrap();
        store.open("unrelated").await.unwrap();
        let fetcher = site();
        let manager = manager(&store, &fetcher);

        manager.install(&release("v7")).await.unwrap();
        let report = manager.activate().await.unwrap();

        assert_eq!(report.generation, "site-v7");
        assert_eq!(
            report.deleted,
            vec!["site-v5".to_string(), "unrelated".to_string()]
        );
        assert_eq!(store.generations().await.unwrap(), vec!["site-v7".to_string()]);
        assert_eq!(manager.state(), LifecycleState::Active);
    }

    #[tokio::test]
    async fn test_version_rotation_v6_to_v7() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);

        manager.install_and_activate(&release("v6")).await.unwrap();
        assert_eq!(store.generations().await.unwrap(), vec!["site-v6".to_string()]);

        let (installed, activated) = manager.install_and_activate(&release("v7")).await.unwrap();
        assert_eq!(installed.generation, "site-v7");
        assert_eq!(activated.deleted, vec!["site-v6".to_string()]);

        assert_eq!(store.generations().await.unwrap(), vec!["site-v7".to_string()]);
        assert_eq!(store.len("site-v7"), 5);
        for url in [HOME, INDEX, OFFLINE, CSS, CDN] {
            assert!(stored_body(&store, "site-v7", url).await.is_some());
        }
        assert_eq!(manager.active_generation().as_deref(), Some("site-v7"));
    }

    #[tokio::test]
    async fn test_navigation_online_returns_live_and_updates_cache() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);
        manager.install_and_activate(&release("v7")).await.unwrap();

        fetcher.set(INDEX, 200, "index v2");
        let served = served(manager.handle_request(navigate(INDEX)).await.unwrap());

        assert_eq!(served.strategy, Strategy::NetworkFirst);
        assert_eq!(served.source, ResponseSource::Network);
        assert_eq!(body(&served), "index v2");
        assert_eq!(
            stored_body(&store, "site-v7", INDEX).await,
            Some(Bytes::from_static(b"index v2"))
        );
    }

    #[tokio::test]
    async fn test_navigation_error_status_is_returned_but_not_cached() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);
        manager.install_and_activate(&release("v7")).await.unwrap();

        fetcher.set(INDEX, 500, "boom");
        let served = served(manager.handle_request(navigate(INDEX)).await.unwrap());
        assert_eq!(served.response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(served.source, ResponseSource::Network);

        assert_eq!(
            stored_body(&store, "site-v7", INDEX).await,
            Some(Bytes::from_static(b"index v1"))
        );
        assert_eq!(manager.stats().writes_skipped, 1);
    }

    #[tokio::test]
    async fn test_navigation_offline_serves_cached_copy() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);
        manager.install_and_activate(&release("v7")).await.unwrap();

        fetcher.set_offline(true);
        let served = served(manager.handle_request(navigate(INDEX)).await.unwrap());

        assert_eq!(served.source, ResponseSource::Cache);
        assert_eq!(served.response.status(), StatusCode::OK);
        assert_eq!(body(&served), "index v1");
    }

    #[tokio::test]
    async fn test_navigation_offline_without_copy_serves_offline_page() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);
        manager.install_and_activate(&release("v7")).await.unwrap();

        fetcher.set_offline(true);
        let served = served(
            manager
                .handle_request(navigate("https://site.test/for-funders.html"))
                .await
                .unwrap(),
        );

        assert_eq!(served.source, ResponseSource::OfflineFallback);
        assert_eq!(body(&served), "you are offline");
        assert_eq!(manager.stats().offline_fallback, 1);
    }

    #[tokio::test]
    async fn test_navigation_offline_without_offline_page_is_synthesized() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);
        manager.install_and_activate(&release("v7")).await.unwrap();

        store
            .delete("site-v7", &RequestKey::get(OFFLINE))
            .await
            .unwrap();
        fetcher.set_offline(true);

        let served = served(
            manager
                .handle_request(navigate("https://site.test/new.html"))
                .await
                .unwrap(),
        );
        assert_eq!(served.source, ResponseSource::Unavailable);
        assert_eq!(served.response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_non_get_passes_through() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);
        manager.install_and_activate(&release("v7")).await.unwrap();

        let request = Request::post(INDEX)
            .header("accept", "text/html")
            .body(Bytes::from_static(b"name=x"))
            .unwrap();

        match manager.handle_request(request).await.unwrap() {
            FetchOutcome::Passthrough(request) => {
                assert_eq!(request.method(), http::Method::POST);
                assert_eq!(request.body(), &Bytes::from_static(b"name=x"));
            }
            FetchOutcome::Respond(_) => panic!("POST must not be intercepted"),
        }
        assert_eq!(fetcher.calls(INDEX), 1);
        assert_eq!(manager.stats().passthrough, 1);
    }

    #[tokio::test]
    async fn test_asset_hit_returns_before_revalidation_completes() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);
        manager.install_and_activate(&release("v7")).await.unwrap();

        let gate = fetcher.hold(CSS);
        let first = tokio::time::timeout(
            Duration::from_secs(5),
            manager.handle_request(asset(CSS)),
        )
        .await
        .expect("cache hit waited on the network")
        .unwrap();
        let first = served(first);
        assert_eq!(first.strategy, Strategy::StaleWhileRevalidate);
        assert_eq!(first.source, ResponseSource::Cache);
        assert_eq!(body(&first), "css v1");

        // The revalidation fetch is still parked; let it see new content
        fetcher.set(CSS, 200, "css v2");
        gate.add_permits(16);
        manager.settle().await;

        assert_eq!(
            stored_body(&store, "site-v7", CSS).await,
            Some(Bytes::from_static(b"css v2"))
        );

        let second = served(manager.handle_request(asset(CSS)).await.unwrap());
        assert_eq!(second.source, ResponseSource::Cache);
        assert_eq!(body(&second), "css v2");
    }

    #[tokio::test]
    async fn test_asset_revalidation_errors_are_swallowed() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);
        manager.install_and_activate(&release("v7")).await.unwrap();

        fetcher.set_offline(true);
        let served = served(manager.handle_request(asset(CSS)).await.unwrap());
        assert_eq!(served.source, ResponseSource::Cache);
        manager.settle().await;

        assert_eq!(
            stored_body(&store, "site-v7", CSS).await,
            Some(Bytes::from_static(b"css v1"))
        );
        assert_eq!(manager.stats().revalidation_failures, 1);
    }

    #[tokio::test]
    async fn test_asset_revalidation_does_not_store_errors() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);
        manager.install_and_activate(&release("v7")).await.unwrap();

        fetcher.set(CSS, 503, "maintenance");
        manager.handle_request(asset(CSS)).await.unwrap();
        manager.settle().await;

        assert_eq!(
            stored_body(&store, "site-v7", CSS).await,
            Some(Bytes::from_static(b"css v1"))
        );
    }

    #[tokio::test]
    async fn test_asset_miss_awaits_network_and_stores() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);
        manager.install_and_activate(&release("v7")).await.unwrap();

        let js = "https://site.test/js/home.js";
        fetcher.set(js, 200, "console.log(1)");

        let fresh = served(manager.handle_request(asset(js)).await.unwrap());
        assert_eq!(fresh.source, ResponseSource::Network);
        assert_eq!(body(&fresh), "console.log(1)");
        assert_eq!(
            stored_body(&store, "site-v7", js).await,
            Some(Bytes::from_static(b"console.log(1)"))
        );

        // Unknown asset: the 404 is returned and not cached
        let missing = "https://site.test/js/missing.js";
        let not_found = served(manager.handle_request(asset(missing)).await.unwrap());
        assert_eq!(not_found.response.status(), StatusCode::NOT_FOUND);
        assert!(stored_body(&store, "site-v7", missing).await.is_none());
    }

    #[tokio::test]
    async fn test_asset_miss_offline_is_gateway_timeout() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);
        manager.install_and_activate(&release("v7")).await.unwrap();

        fetcher.set_offline(true);
        let served = served(
            manager
                .handle_request(asset("https://site.test/img/unknown.png"))
                .await
                .unwrap(),
        );
        assert_eq!(served.source, ResponseSource::Unavailable);
        assert_eq!(served.response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_revalidation_never_writes_into_retired_generation() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);
        manager.install_and_activate(&release("v6")).await.unwrap();

        let js = "https://site.test/js/extra.js";
        fetcher.set(js, 200, "extra v1");
        manager.handle_request(asset(js)).await.unwrap();

        // Second request hits the cache and parks its revalidation
        let gate = fetcher.hold(js);
        let hit = served(manager.handle_request(asset(js)).await.unwrap());
        assert_eq!(hit.source, ResponseSource::Cache);

        manager.install_and_activate(&release("v7")).await.unwrap();
        gate.add_permits(16);
        manager.settle().await;

        assert_eq!(store.generations().await.unwrap(), vec!["site-v7".to_string()]);
        assert!(stored_body(&store, "site-v7", js).await.is_none());
    }

    #[tokio::test]
    async fn test_install_rejected_while_another_is_running() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = Arc::new(manager(&store, &fetcher));

        let gate = fetcher.hold(OFFLINE);
        let running = {
            let manager = manager.clone();
            let release = release("v7");
            tokio::spawn(async move { manager.install(&release).await })
        };

        while manager.state() != LifecycleState::Installing {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            manager.install(&release("v8")).await,
            Err(CoreError::Busy(LifecycleState::Installing))
        ));
        assert!(matches!(
            manager.activate().await,
            Err(CoreError::Busy(LifecycleState::Installing))
        ));

        gate.add_permits(16);
        let report = running.await.unwrap().unwrap();
        assert_eq!(report.generation, "site-v7");
        assert_eq!(manager.state(), LifecycleState::Installed);
    }

    #[tokio::test]
    async fn test_resume_adopts_complete_generation() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();

        manager(&store, &fetcher)
            .install_and_activate(&release("v7"))
            .await
            .unwrap();

        // A fresh manager over the same store, with the network gone
        fetcher.set_offline(true);
        let restarted = manager(&store, &fetcher);
        assert!(restarted.resume(&release("v7")).await.unwrap());
        assert_eq!(restarted.active_generation().as_deref(), Some("site-v7"));

        let served = served(restarted.handle_request(navigate(INDEX)).await.unwrap());
        assert_eq!(served.source, ResponseSource::Cache);

        // A version that was never installed cannot be resumed
        let other = manager(&store, &fetcher);
        assert!(!other.resume(&release("v8")).await.unwrap());
        assert_eq!(other.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn test_relative_request_uri_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);
        manager.install_and_activate(&release("v7")).await.unwrap();

        let request = Request::get("/index.html").body(Bytes::new()).unwrap();
        assert!(matches!(
            manager.handle_request(request).await,
            Err(CoreError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_status_reports_lifecycle_and_generations() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);

        let status = manager.status().await.unwrap();
        assert_eq!(status.state, LifecycleState::Idle);
        assert!(status.active_generation.is_none());

        manager.install_and_activate(&release("v7")).await.unwrap();
        manager.handle_request(navigate(INDEX)).await.unwrap();

        let status = manager.status().await.unwrap();
        assert_eq!(status.state, LifecycleState::Active);
        assert_eq!(status.active_generation.as_deref(), Some("site-v7"));
        assert_eq!(status.active_version.as_deref(), Some("v7"));
        assert_eq!(status.precached, 5);
        assert_eq!(status.generations, vec!["site-v7".to_string()]);
        assert_eq!(status.stats.network, 1);
    }

    #[tokio::test]
    async fn test_purge_waits_for_in_flight_revalidation_write() {
        let store = Arc::new(GatedStore::new());
        let fetcher = site();
        let manager = Arc::new(manager_over(store.clone(), &fetcher, &[]));
        manager.install_and_activate(&release("v6")).await.unwrap();

        // The hit's revalidation passes the serving check and parks in put
        let gate = store.hold_writes("site-v6");
        let hit = served(manager.handle_request(asset(CSS)).await.unwrap());
        assert_eq!(hit.source, ResponseSource::Cache);
        while store.parked() < 1 {
            tokio::task::yield_now().await;
        }

        let rotation = {
            let manager = manager.clone();
            let release = release("v7");
            tokio::spawn(async move { manager.install_and_activate(&release).await })
        };
        while manager.state() != LifecycleState::Activating {
            tokio::task::yield_now().await;
        }
        // The purge cannot start while the write is in flight
        assert!(
            store
                .generations()
                .await
                .unwrap()
                .contains(&"site-v6".to_string())
        );

        gate.add_permits(16);
        let (_, activated) = rotation.await.unwrap().unwrap();
        manager.settle().await;

        assert_eq!(activated.deleted, vec!["site-v6".to_string()]);
        assert_eq!(store.generations().await.unwrap(), vec!["site-v7".to_string()]);
    }

    #[tokio::test]
    async fn test_precached_entries_reachable_with_vary_headers() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager_over(store.clone(), &fetcher, &["Accept-Language"]);
        manager.install_and_activate(&release("v7")).await.unwrap();

        fetcher.set_offline(true);
        let page = served(
            manager
                .handle_request(with_language(navigate(INDEX), "en"))
                .await
                .unwrap(),
        );
        assert_eq!(page.source, ResponseSource::Cache);
        assert_eq!(body(&page), "index v1");

        let css = served(
            manager
                .handle_request(with_language(asset(CSS), "en"))
                .await
                .unwrap(),
        );
        assert_eq!(css.source, ResponseSource::Cache);
        assert_eq!(body(&css), "css v1");
        manager.settle().await;

        // A live copy stored under a language is preferred for that language only
        fetcher.set_offline(false);
        fetcher.set(INDEX, 200, "index v2");
        manager
            .handle_request(with_language(navigate(INDEX), "en"))
            .await
            .unwrap();

        fetcher.set_offline(true);
        let english = served(
            manager
                .handle_request(with_language(navigate(INDEX), "en"))
                .await
                .unwrap(),
        );
        assert_eq!(body(&english), "index v2");

        let german = served(
            manager
                .handle_request(with_language(navigate(INDEX), "de"))
                .await
                .unwrap(),
        );
        assert_eq!(body(&german), "index v1");
    }

    #[tokio::test]
    async fn test_clear_deletes_every_generation_and_stops_serving() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);
        manager.install_and_activate(&release("v7")).await.unwrap();

        let report = manager.clear().await.unwrap();
        assert_eq!(report.deleted, vec!["site-v7".to_string()]);
        assert_eq!(manager.state(), LifecycleState::Idle);
        assert!(manager.active_generation().is_none());
        assert!(store.generations().await.unwrap().is_empty());

        let outcome = manager.handle_request(navigate(INDEX)).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Passthrough(_)));
        assert!(matches!(
            manager.activate().await,
            Err(CoreError::NothingToActivate)
        ));

        // The next release installs from scratch
        manager.install_and_activate(&release("v8")).await.unwrap();
        assert_eq!(store.generations().await.unwrap(), vec!["site-v8".to_string()]);
    }

    #[tokio::test]
    async fn test_clear_drops_late_revalidation_write() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = manager(&store, &fetcher);
        manager.install_and_activate(&release("v7")).await.unwrap();

        let gate = fetcher.hold(CSS);
        manager.handle_request(asset(CSS)).await.unwrap();

        manager.clear().await.unwrap();
        gate.add_permits(16);
        manager.settle().await;

        assert!(store.generations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_rejected_while_installing() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = site();
        let manager = Arc::new(manager(&store, &fetcher));

        let gate = fetcher.hold(OFFLINE);
        let running = {
            let manager = manager.clone();
            let release = release("v7");
            tokio::spawn(async move { manager.install(&release).await })
        };
        while manager.state() != LifecycleState::Installing {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            manager.clear().await,
            Err(CoreError::Busy(LifecycleState::Installing))
        ));

        gate.add_permits(16);
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rotation_and_restart_on_disk_store() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = site();

        let store = Arc::new(LocalStore::new(dir.path()).await.unwrap());
        let manager = manager_over(store.clone(), &fetcher, &[]);
        manager.install_and_activate(&release("v6")).await.unwrap();
        let (_, activated) = manager.install_and_activate(&release("v7")).await.unwrap();
        assert_eq!(activated.deleted, vec!["site-v6".to_string()]);
        assert_eq!(store.generations().await.unwrap(), vec!["site-v7".to_string()]);

        fetcher.set_offline(true);
        let page = served(manager.handle_request(navigate(INDEX)).await.unwrap());
        assert_eq!(page.source, ResponseSource::Cache);
        assert_eq!(body(&page), "index v1");

        let fallback = served(
            manager
                .handle_request(navigate("https://site.test/for-funders.html"))
                .await
                .unwrap(),
        );
        assert_eq!(fallback.source, ResponseSource::OfflineFallback);
        assert_eq!(body(&fallback), "you are offline");

        // Reopen the directory as after a restart, still offline
        let reopened = Arc::new(LocalStore::new(dir.path()).await.unwrap());
        let restarted = manager_over(reopened, &fetcher, &[]);
        assert!(restarted.resume(&release("v7")).await.unwrap());
        let css = served(restarted.handle_request(asset(CSS)).await.unwrap());
        assert_eq!(css.source, ResponseSource::Cache);
        assert_eq!(body(&css), "css v1");
        restarted.settle().await;
    }
}
