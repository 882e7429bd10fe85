//! Remote persistence of the library.
//!
//! The library is stored as a bundle of named JSON blobs (see [`chunker`])
//! inside a single private gist (see [`gist`]). [`DocumentStore`] is the seam
//! between the two so the service can run against an in-memory store in tests.

pub mod chunker;
pub mod gist;
#[cfg(test)]
pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Blob name → JSON text, as produced by [`chunker::chunk_library`].
pub type Bundle = BTreeMap<String, String>;

/// Files to write in one request. `None` deletes the file.
pub type FileChanges = BTreeMap<String, Option<String>>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteFile {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub raw_url: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteBundle {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub files: BTreeMap<String, RemoteFile>,
    #[serde(default)]
    pub truncated: bool,
}

/// A remote store holding labelled bundles of text files.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Id of the bundle whose label matches exactly, if any.
    async fn find_bundle(&self, label: &str) -> Result<Option<String>>;

    async fn create_bundle(&self, label: &str, files: &FileChanges) -> Result<String>;

    async fn patch_bundle(&self, id: &str, files: &FileChanges) -> Result<()>;

    async fn fetch_bundle(&self, id: &str) -> Result<RemoteBundle>;

    /// Full content behind a file's secondary URL.
    async fn fetch_raw(&self, url: &str) -> Result<String>;

    async fn verify_credentials(&self) -> Result<bool>;
}

/// Something blobs can be read from by name.
#[async_trait]
pub trait BlobSource: Send + Sync {
    fn names(&self) -> Vec<String>;

    /// `Ok(None)` when no blob has that name. Errors are transport failures.
    async fn read(&self, name: &str) -> Result<Option<String>>;
}

#[async_trait]
impl BlobSource for Bundle {
    fn names(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }

    async fn read(&self, name: &str) -> Result<Option<String>> {
        Ok(self.get(name).cloned())
    }
}

/// A fetched bundle read through its store, so truncated files are
/// completed from their raw URL.
pub struct RemoteBlobs<'a> {
    store: &'a dyn DocumentStore,
    bundle: &'a RemoteBundle,
}

impl<'a> RemoteBlobs<'a> {
    pub fn new(store: &'a dyn DocumentStore, bundle: &'a RemoteBundle) -> Self {
        if bundle.truncated {
            tracing::warn!(bundle = %bundle.id, "remote file listing is truncated");
        }
        Self { store, bundle }
    }
}

#[async_trait]
impl BlobSource for RemoteBlobs<'_> {
    fn names(&self) -> Vec<String> {
        self.bundle.files.keys().cloned().collect()
    }

    async fn read(&self, name: &str) -> Result<Option<String>> {
        let Some(file) = self.bundle.files.get(name) else {
            return Ok(None);
        };
        // Inline content of a truncated file is incomplete even when present.
        if let (true, Some(url)) = (file.truncated, file.raw_url.as_deref()) {
            tracing::debug!(file = name, size = ?file.size, "fetching truncated file from raw url");
            return self.store.fetch_raw(url).await.map(Some);
        }
        Ok(file.content.clone())
    }
}
