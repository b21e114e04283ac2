//! Releases and precache manifests
//!
//! A release pairs a version tag with the list of resources that must be
//! cached before that version may serve requests. Changing the version tag
//! is the only thing that starts a new install/activate cycle.

use serde::Serialize;
use std::collections::HashSet;
use url::Url;

use crate::error::CoreError;

/// Ordered precache list with duplicates collapsed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Manifest {
    entries: Vec<String>,
}

impl Manifest {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let entries = entries
            .into_iter()
            .map(Into::into)
            .filter(|e: &String| seen.insert(e.clone()))
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries.iter().any(|e| e == entry)
    }

    /// Resolve every entry against the site origin
    ///
    /// Entries that resolve to the same URL (e.g. `./` and `/`) appear once.
    pub fn resolve(&self, origin: &Url) -> Result<Vec<Url>, CoreError> {
        let mut seen = HashSet::new();
        let mut urls = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            let url = resolve_url(origin, entry)?;
            if seen.insert(url.clone()) {
                urls.push(url);
            }
        }

        Ok(urls)
    }
}

/// Resolve a manifest entry against the origin. Absolute entries are kept as-is.
pub fn resolve_url(origin: &Url, entry: &str) -> Result<Url, CoreError> {
    origin
        .join(entry)
        .map_err(|e| CoreError::InvalidRelease(format!("cannot resolve '{}': {}", entry, e)))
}

/// A release's manifest and offline page resolved against the site origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRelease {
    pub urls: Vec<Url>,
    pub offline_url: Url,
}

/// A versioned precache set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Release {
    cache_prefix: String,
    version: String,
    manifest: Manifest,
    offline_page: String,
}

impl Release {
    /// Create a release, checking that its generation name is usable
    ///
    /// Whether the offline page is in the manifest depends on the origin the
    /// entries resolve against; see [`Release::resolve`].
    pub fn new(
        cache_prefix: impl Into<String>,
        version: impl Into<String>,
        manifest: Manifest,
        offline_page: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let release = Self {
            cache_prefix: cache_prefix.into(),
            version: version.into(),
            manifest,
            offline_page: offline_page.into(),
        };

        if release.cache_prefix.is_empty() || release.version.is_empty() {
            return Err(CoreError::InvalidRelease(
                "cache prefix and version must not be empty".to_string(),
            ));
        }

        offline_storage::validate_generation(&release.generation())
            .map_err(|e| CoreError::InvalidRelease(e.to_string()))?;

        Ok(release)
    }

    /// Resolve the manifest and offline page against `origin`
    ///
    /// Fails unless the offline page resolves to one of the manifest URLs.
    pub fn resolve(&self, origin: &Url) -> Result<ResolvedRelease, CoreError> {
        let urls = self.manifest.resolve(origin)?;
        let offline_url = resolve_url(origin, &self.offline_page)?;

        if !urls.contains(&offline_url) {
            return Err(CoreError::InvalidRelease(format!(
                "offline page '{}' is not in the precache manifest",
                self.offline_page
            )));
        }

        Ok(ResolvedRelease { urls, offline_url })
    }

    /// Name of the cache generation this release installs into
    pub fn generation(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.version)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn offline_page(&self) -> &str {
        &self.offline_page
    }
}
