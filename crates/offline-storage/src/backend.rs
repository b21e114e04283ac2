//! Cache store trait

use async_trait::async_trait;

use crate::entry::{RequestKey, StoredResponse};
use crate::error::StorageError;

/// Predicate used to select generations for bulk deletion
pub type GenerationFilter<'a> = &'a (dyn Fn(&str) -> bool + Send + Sync);

/// Cache store trait
///
/// A store holds any number of named generations, each an independent
/// key-value map from [`RequestKey`] to [`StoredResponse`]. Replacing an
/// entry is atomic per key: readers see the old or the new value, never a
/// mix of both.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Ensure a generation exists, creating it empty if needed
    async fn open(&self, generation: &str) -> Result<(), StorageError>;

    /// Look up an entry
    async fn get(
        &self,
        generation: &str,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, StorageError>;

    /// Insert or replace an entry (last writer wins)
    async fn put(
        &self,
        generation: &str,
        key: &RequestKey,
        value: StoredResponse,
    ) -> Result<(), StorageError>;

    /// Delete an entry, returning whether it existed
    async fn delete(&self, generation: &str, key: &RequestKey) -> Result<bool, StorageError>;

    /// List the keys held by a generation
    async fn keys(&self, generation: &str) -> Result<Vec<RequestKey>, StorageError>;

    /// List the generations present in the store
    async fn generations(&self) -> Result<Vec<String>, StorageError>;

    /// Delete every generation whose name matches, returning the deleted names
    async fn delete_generations(
        &self,
        filter: GenerationFilter<'_>,
    ) -> Result<Vec<String>, StorageError>;
}

/// Check that a generation name is usable as a single path component
pub fn validate_generation(name: &str) -> Result<(), StorageError> {
    if name.is_empty() || name.len() > 128 {
        return Err(StorageError::InvalidGeneration(format!(
            "length must be 1-128: {:?}",
            name
        )));
    }

    if name.starts_with('.') {
        return Err(StorageError::InvalidGeneration(format!(
            "must not start with '.': {}",
            name
        )));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(StorageError::InvalidGeneration(format!(
            "only [A-Za-z0-9._-] allowed: {}",
            name
        )));
    }

    Ok(())
}
