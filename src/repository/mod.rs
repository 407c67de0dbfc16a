//! Persistence Repository Module
//!
//! Key/value backends shared by cluster metadata and pipeline checkpoints.
//! Keys are hierarchical, `/`-separated paths. Both backends deliver
//! change notifications to in-process watchers.

mod file;
mod registry;
mod watch;

pub use file::FileRepository;
pub use registry::RegistryRepository;
pub use watch::WatcherSet;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{RepositoryConfig, RepositoryType};
use crate::error::{Error, Result};

/// Kind of change reported for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    Added,
    Updated,
    Deleted,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeType::Added => write!(f, "ADDED"),
            ChangeType::Updated => write!(f, "UPDATED"),
            ChangeType::Deleted => write!(f, "DELETED"),
        }
    }
}

/// A change notification for one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChangedEvent {
    pub key: String,
    pub value: String,
    pub change_type: ChangeType,
}

impl DataChangedEvent {
    pub fn new(key: impl Into<String>, value: impl Into<String>, change_type: ChangeType) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            change_type,
        }
    }
}

/// Receiver side of a watch subscription
pub type WatchReceiver = mpsc::UnboundedReceiver<DataChangedEvent>;

/// Storage backend for cluster metadata and checkpoints
#[async_trait]
pub trait PersistRepository: Send + Sync {
    /// Read the value stored at `key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Names of the direct children of `key`, sorted
    async fn get_children_keys(&self, key: &str) -> Result<Vec<String>>;

    /// Create or overwrite the value at `key`
    async fn persist(&self, key: &str, value: &str) -> Result<()>;

    /// Create `key` only if it does not exist yet; returns whether it was created
    async fn persist_exclusive(&self, key: &str, value: &str) -> Result<bool>;

    /// Delete `key` and every key below it
    async fn delete(&self, key: &str) -> Result<()>;

    /// Subscribe to changes at `prefix` and below
    fn watch(&self, prefix: &str) -> WatchReceiver;

    /// Drop every subscription registered for `prefix`
    fn remove_data_listener(&self, prefix: &str);

    /// Check whether a value exists at `key`
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Open the repository described by the configuration
pub fn open_repository(
    config: &RepositoryConfig,
    data_dir: &Path,
) -> Result<Arc<dyn PersistRepository>> {
    match config.repository_type {
        RepositoryType::File => Ok(Arc::new(FileRepository::new(data_dir.to_path_buf())?)),
        RepositoryType::Registry => {
            let path = config.path.as_ref().ok_or_else(|| {
                Error::Config("repository.path is required for the registry repository".into())
            })?;
            let poll_interval = std::time::Duration::from_millis(config.poll_interval_ms.max(1));
            Ok(Arc::new(RegistryRepository::open_with_poll_interval(path, poll_interval)?))
        }
    }
}

/// Normalize a key: single leading slash, no trailing slash, no empty segments
pub(crate) fn normalize_key(key: &str) -> Result<String> {
    let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(Error::Repository(format!("Invalid repository key '{}'", key)));
    }
    if segments.iter().any(|s| *s == "." || *s == "..") {
        return Err(Error::Repository(format!(
            "Relative segments are not allowed in key '{}'",
            key
        )));
    }
    Ok(format!("/{}", segments.join("/")))
}
