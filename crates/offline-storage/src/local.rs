//! Local disk storage backend

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::backend::{CacheStore, GenerationFilter, validate_generation};
use crate::entry::{RequestKey, StoredResponse};
use crate::error::StorageError;

const ENTRY_EXTENSION: &str = "entry";

/// Entry header written ahead of the body
#[derive(Serialize, Deserialize)]
struct EntryMeta {
    key: RequestKey,
    status: u16,
    headers: Vec<(String, String)>,
    stored_at: DateTime<Utc>,
}

/// Local disk storage backend
///
/// Each generation is a directory and each entry a single file:
/// `<base_path>/<generation>/<sha256 of key>.entry`
///
/// An entry file is a little-endian `u32` header length, the JSON header,
/// then the raw body. Writes go to a temp file that is renamed into place,
/// so a reader sees either the previous entry or the new one.
pub struct LocalStore {
    base_path: PathBuf,
    tmp_counter: AtomicU64,
}

impl LocalStore {
    /// Create a new local store rooted at `base_path`
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await?;

        info!("Initialized local cache store at {:?}", base_path);

        Ok(Self {
            base_path,
            tmp_counter: AtomicU64::new(0),
        })
    }

    fn generation_path(&self, generation: &str) -> Result<PathBuf, StorageError> {
        validate_generation(generation)?;
        Ok(self.base_path.join(generation))
    }

    fn entry_path(&self, generation: &str, key: &RequestKey) -> Result<PathBuf, StorageError> {
        Ok(self
            .generation_path(generation)?
            .join(format!("{}.{}", key.digest(), ENTRY_EXTENSION)))
    }

    fn encode(key: &RequestKey, value: &StoredResponse) -> Result<Vec<u8>, StorageError> {
        let meta = serde_json::to_vec(&EntryMeta {
            key: key.clone(),
            status: value.status,
            headers: value.headers.clone(),
            stored_at: value.stored_at,
        })?;

        let header_len = u32::try_from(meta.len())
            .map_err(|_| StorageError::Backend("entry header too large".to_string()))?;

        let mut buf = Vec::with_capacity(4 + meta.len() + value.body.len());
        buf.extend_from_slice(&header_len.to_le_bytes());
        buf.extend_from_slice(&meta);
        buf.extend_from_slice(&value.body);
        Ok(buf)
    }

    fn decode(path: &Path, data: Vec<u8>) -> Result<(RequestKey, StoredResponse), StorageError> {
        let corrupt = || StorageError::Corrupt(path.to_string_lossy().to_string());

        let len_bytes: [u8; 4] = data
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(corrupt)?;
        let header_end = 4 + u32::from_le_bytes(len_bytes) as usize;
        let header = data.get(4..header_end).ok_or_else(corrupt)?;

        let meta: EntryMeta = serde_json::from_slice(header)?;
        let mut data = Bytes::from(data);
        let body = data.split_off(header_end);

        Ok((
            meta.key,
            StoredResponse {
                status: meta.status,
                headers: meta.headers,
                body,
                stored_at: meta.stored_at,
            },
        ))
    }

    async fn read_entry(
        path: &Path,
    ) -> Result<Option<(RequestKey, StoredResponse)>, StorageError> {
        match fs::read(path).await {
            Ok(data) => Ok(Some(Self::decode(path, data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[async_trait]
impl CacheStore for LocalStore {
    async fn open(&self, generation: &str) -> Result<(), StorageError> {
        let path = self.generation_path(generation)?;
        fs::create_dir_all(&path).await?;
        Ok(())
    }

    async fn get(
        &self,
        generation: &str,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, StorageError> {
        let path = self.entry_path(generation, key)?;
        debug!("Reading cache entry from {:?}", path);

        match Self::read_entry(&path).await? {
            // Digest collision or a stale file from another key
            Some((stored_key, _)) if &stored_key != key => Ok(None),
            Some((_, value)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        generation: &str,
        key: &RequestKey,
        value: StoredResponse,
    ) -> Result<(), StorageError> {
        let path = self.entry_path(generation, key)?;
        debug!("Writing cache entry {} to {:?}", key, path);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let data = Self::encode(key, &value)?;

        // Unique temp name so concurrent writers of one key do not share it
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let temp_path = path.with_extension(format!("{}.tmp", n));
        fs::write(&temp_path, &data).await?;
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }

        Ok(())
    }

    async fn delete(&self, generation: &str, key: &RequestKey) -> Result<bool, StorageError> {
        let path = self.entry_path(generation, key)?;
        debug!("Deleting cache entry at {:?}", path);

        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn keys(&self, generation: &str) -> Result<Vec<RequestKey>, StorageError> {
        let dir = self.generation_path(generation)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            match Self::read_entry(&path).await {
                Ok(Some((key, _))) => keys.push(key),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable cache entry {:?}: {}", path, e),
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn generations(&self) -> Result<Vec<String>, StorageError> {
        let mut entries = fs::read_dir(&self.base_path).await?;
        let mut names = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_str()
                && validate_generation(name).is_ok()
            {
                names.push(name.to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    async fn delete_generations(
        &self,
        filter: GenerationFilter<'_>,
    ) -> Result<Vec<String>, StorageError> {
        let mut deleted = Vec::new();

        for name in self.generations().await? {
            if !filter(name.as_str()) {
                continue;
            }
            debug!("Deleting generation directory {}", name);
            match fs::remove_dir_all(self.base_path.join(&name)).await {
                Ok(()) => deleted.push(name),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io(e)),
            }
        }

        Ok(deleted)
    }
}
