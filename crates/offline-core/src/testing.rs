//! Scriptable fetcher and store wrapper for manager tests

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use offline_fetch::{FetchError, Fetcher};
use offline_storage::{
    CacheStore, GenerationFilter, MemoryStore, RequestKey, StorageError, StoredResponse,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Semaphore;

/// Serves canned responses keyed by absolute URL; unknown URLs get a 404
#[derive(Default)]
pub struct FakeFetcher {
    routes: RwLock<HashMap<String, (u16, Bytes)>>,
    gates: RwLock<HashMap<String, Arc<Semaphore>>>,
    calls: RwLock<HashMap<String, usize>>,
    offline: AtomicBool,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, url: &str, status: u16, body: &'static str) {
        self.routes
            .write()
            .insert(url.to_string(), (status, Bytes::from_static(body.as_bytes())));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Park every fetch of `url` until permits are added to the returned gate
    pub fn hold(&self, url: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates.write().insert(url.to_string(), gate.clone());
        gate
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.read().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, request: &Request<Bytes>) -> Result<Response<Bytes>, FetchError> {
        let url = request.uri().to_string();
        *self.calls.write().entry(url.clone()).or_default() += 1;

        let gate = self.gates.read().get(&url).cloned();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| FetchError::Unavailable(e.to_string()))?;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Unavailable(format!("offline: {}", url)));
        }

        let route = self.routes.read().get(&url).cloned();
        let (status, body) = route.unwrap_or((404, Bytes::from_static(b"not found")));

        let mut response = Response::new(body);
        *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
        Ok(response)
    }
}

/// Memory store whose writes into chosen generations wait on a gate
#[derive(Default)]
pub struct GatedStore {
    inner: MemoryStore,
    gates: RwLock<HashMap<String, Arc<Semaphore>>>,
    parked: AtomicUsize,
}

impl GatedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park every put into `generation` until permits are added to the gate
    pub fn hold_writes(&self, generation: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates
            .write()
            .insert(generation.to_string(), gate.clone());
        gate
    }

    /// Number of puts that have reached a gate
    pub fn parked(&self) -> usize {
        self.parked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheStore for GatedStore {
    async fn open(&self, generation: &str) -> Result<(), StorageError> {
        self.inner.open(generation).await
    }

    async fn get(
        &self,
        generation: &str,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, StorageError> {
        self.inner.get(generation, key).await
    }

    async fn put(
        &self,
        generation: &str,
        key: &RequestKey,
        value: StoredResponse,
    ) -> Result<(), StorageError> {
        let gate = self.gates.read().get(generation).cloned();
        if let Some(gate) = gate {
            self.parked.fetch_add(1, Ordering::SeqCst);
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        self.inner.put(generation, key, value).await
    }

    async fn delete(&self, generation: &str, key: &RequestKey) -> Result<bool, StorageError> {
        self.inner.delete(generation, key).await
    }

    async fn keys(&self, generation: &str) -> Result<Vec<RequestKey>, StorageError> {
        self.inner.keys(generation).await
    }

    async fn generations(&self) -> Result<Vec<String>, StorageError> {
        self.inner.generations().await
    }

    async fn delete_generations(
        &self,
        filter: GenerationFilter<'_>,
    ) -> Result<Vec<String>, StorageError> {
        self.inner.delete_generations(filter).await
    }
}
