//! In-memory [`DocumentStore`] for tests.

use super::{Bundle, DocumentStore, FileChanges, RemoteBundle, RemoteFile};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Default)]
struct StoredBundle {
    label: String,
    files: Bundle,
}

#[derive(Default)]
pub struct MemoryStore {
    bundles: Mutex<BTreeMap<String, StoredBundle>>,
    writes: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store already holding one labelled bundle.
    pub fn with_bundle(label: &str, files: Bundle) -> Self {
        let store = Self::new();
        store.bundles.lock().unwrap().insert(
            "mem-1".to_string(),
            StoredBundle {
                label: label.to_string(),
                files,
            },
        );
        store
    }

    /// Number of create/patch calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes every call fail like a network outage.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Deletes the bundle with this label, as if removed on the remote side.
    pub fn remove_bundle(&self, label: &str) {
        self.bundles.lock().unwrap().retain(|_, b| b.label != label);
    }

    /// Files of the bundle with this label.
    pub fn files(&self, label: &str) -> Option<Bundle> {
        let bundles = self.bundles.lock().unwrap();
        bundles
            .values()
            .find(|b| b.label == label)
            .map(|b| b.files.clone())
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Remote {
                status: 503,
                message: "store offline".to_string(),
            });
        }
        Ok(())
    }
}

fn apply(files: &mut Bundle, changes: &FileChanges) -> Result<()> {
    for (name, change) in changes {
        match change {
            Some(content) => {
                files.insert(name.clone(), content.clone());
            }
            None => {
                if files.remove(name).is_none() {
                    return Err(Error::Remote {
                        status: 422,
                        message: format!("cannot delete missing file {name}"),
                    });
                }
            }
        }
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_bundle(&self, label: &str) -> Result<Option<String>> {
        self.check_online()?;
        let bundles = self.bundles.lock().unwrap();
        Ok(bundles
            .iter()
            .find(|(_, b)| b.label == label)
            .map(|(id, _)| id.clone()))
    }

    async fn create_bundle(&self, label: &str, files: &FileChanges) -> Result<String> {
        self.check_online()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut bundles = self.bundles.lock().unwrap();
        let id = format!("mem-{}", bundles.len() + 1);
        let mut stored = StoredBundle {
            label: label.to_string(),
            files: Bundle::new(),
        };
        apply(&mut stored.files, files)?;
        bundles.insert(id.clone(), stored);
        Ok(id)
    }

    async fn patch_bundle(&self, id: &str, files: &FileChanges) -> Result<()> {
        self.check_online()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut bundles = self.bundles.lock().unwrap();
        let stored = bundles.get_mut(id).ok_or_else(|| Error::Remote {
            status: 404,
            message: "Not Found".to_string(),
        })?;
        apply(&mut stored.files, files)
    }

    async fn fetch_bundle(&self, id: &str) -> Result<RemoteBundle> {
        self.check_online()?;
        let bundles = self.bundles.lock().unwrap();
        let stored = bundles.get(id).ok_or_else(|| Error::Remote {
            status: 404,
            message: "Not Found".to_string(),
        })?;
        Ok(RemoteBundle {
            id: id.to_string(),
            description: Some(stored.label.clone()),
            files: stored
                .files
                .iter()
                .map(|(name, content)| {
                    let file = RemoteFile {
                        content: Some(content.clone()),
                        ..RemoteFile::default()
                    };
                    (name.clone(), file)
                })
                .collect(),
            truncated: false,
        })
    }

    async fn fetch_raw(&self, url: &str) -> Result<String> {
        self.check_online()?;
        Err(Error::Remote {
            status: 404,
            message: format!("no raw content at {url}"),
        })
    }

    async fn verify_credentials(&self) -> Result<bool> {
        self.check_online()?;
        Ok(true)
    }
}
