//! In-memory storage backend

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

use crate::backend::{CacheStore, GenerationFilter};
use crate::entry::{RequestKey, StoredResponse};
use crate::error::StorageError;

type Generation = HashMap<RequestKey, StoredResponse>;

/// In-memory storage backend
///
/// Nothing survives a restart. Used for tests and for deployments that do
/// not want anything written to disk.
#[derive(Default)]
pub struct MemoryStore {
    generations: RwLock<HashMap<String, Generation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a generation (0 if it does not exist)
    pub fn len(&self, generation: &str) -> usize {
        self.generations
            .read()
            .get(generation)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, generation: &str) -> bool {
        self.len(generation) == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn open(&self, generation: &str) -> Result<(), StorageError> {
        self.generations
            .write()
            .entry(generation.to_string())
            .or_default();
        Ok(())
    }

    async fn get(
        &self,
        generation: &str,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, StorageError> {
        Ok(self
            .generations
            .read()
            .get(generation)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put(
        &self,
        generation: &str,
        key: &RequestKey,
        value: StoredResponse,
    ) -> Result<(), StorageError> {
        debug!("Storing {} in {} ({} bytes)", key, generation, value.body.len());
        self.generations
            .write()
            .entry(generation.to_string())
            .or_default()
            .insert(key.clone(), value);
        Ok(())
    }

    async fn delete(&self, generation: &str, key: &RequestKey) -> Result<bool, StorageError> {
        Ok(self
            .generations
            .write()
            .get_mut(generation)
            .map(|entries| entries.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn keys(&self, generation: &str) -> Result<Vec<RequestKey>, StorageError> {
        let mut keys: Vec<RequestKey> = self
            .generations
            .read()
            .get(generation)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    async fn generations(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self.generations.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_generations(
        &self,
        filter: GenerationFilter<'_>,
    ) -> Result<Vec<String>, StorageError> {
        let mut generations = self.generations.write();
        let mut deleted: Vec<String> = generations
            .keys()
            .filter(|name| filter(name.as_str()))
            .cloned()
            .collect();
        for name in &deleted {
            generations.remove(name);
        }
        deleted.sort();
        Ok(deleted)
    }
}
