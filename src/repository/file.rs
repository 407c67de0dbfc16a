//! File Repository
//!
//! Standalone backend storing each key as a file below a hidden
//! `.wolfshard` working directory. The value of `/a/b` lives in
//! `.wolfshard/a/b.value` so that `/a/b` can also have children in
//! `.wolfshard/a/b/`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{normalize_key, ChangeType, DataChangedEvent, PersistRepository, WatchReceiver, WatcherSet};
use crate::error::{Error, Result};

const WORKING_DIR: &str = ".wolfshard";
const VALUE_SUFFIX: &str = ".value";

/// Filesystem-backed repository
pub struct FileRepository {
    root: PathBuf,
    watchers: WatcherSet,
    /// Serializes writers so added/updated classification stays exact
    write_lock: Mutex<()>,
}

impl FileRepository {
    /// Create a repository rooted at `base_dir/.wolfshard`
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let root = base_dir.join(WORKING_DIR);
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            watchers: WatcherSet::new(),
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory holding all keys
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }

    fn value_path(&self, key: &str) -> PathBuf {
        let dir = self.dir_path(key);
        let name = dir
            .file_name()
            .map(|n| format!("{}{}", n.to_string_lossy(), VALUE_SUFFIX))
            .unwrap_or_else(|| VALUE_SUFFIX.to_string());
        dir.with_file_name(name)
    }

    async fn write_value(&self, key: &str, value: &str) -> Result<()> {
        let path = self.value_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp_path = path.with_extension("value.tmp");
        fs::write(&temp_path, value).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    /// Collect `key` and every descendant key that holds a value
    fn collect_keys(&self, key: &str) -> Result<Vec<(String, String)>> {
        let mut found = Vec::new();
        let value_path = self.value_path(key);
        if value_path.is_file() {
            found.push((key.to_string(), std::fs::read_to_string(&value_path)?));
        }
        let dir = self.dir_path(key);
        if dir.is_dir() {
            for entry in std::fs::read_dir(&dir)? {
                let name = entry?.file_name().to_string_lossy().to_string();
                if let Some(child) = name.strip_suffix(VALUE_SUFFIX) {
                    let child_dir = dir.join(child);
                    // Children with a directory are visited through that directory
                    if !child_dir.is_dir() {
                        let child_key = format!("{}/{}", key, child);
                        found.extend(self.collect_keys(&child_key)?);
                    }
                } else if !name.ends_with(".tmp") {
                    let child_key = format!("{}/{}", key, name);
                    found.extend(self.collect_keys(&child_key)?);
                }
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl PersistRepository for FileRepository {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = normalize_key(key)?;
        match fs::read_to_string(self.value_path(&key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_children_keys(&self, key: &str) -> Result<Vec<String>> {
        let key = normalize_key(key)?;
        let dir = self.dir_path(&key);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".tmp") {
                continue;
            }
            let child = name.strip_suffix(VALUE_SUFFIX).unwrap_or(&name).to_string();
            children.push(child);
        }
        children.sort();
        children.dedup();
        Ok(children)
    }

    async fn persist(&self, key: &str, value: &str) -> Result<()> {
        let key = normalize_key(key)?;
        let _guard = self.write_lock.lock().await;
        let existed = fs::try_exists(self.value_path(&key)).await?;
        self.write_value(&key, value).await?;
        let change_type = if existed { ChangeType::Updated } else { ChangeType::Added };
        self.watchers.notify(&DataChangedEvent::new(key, value, change_type));
        Ok(())
    }

    async fn persist_exclusive(&self, key: &str, value: &str) -> Result<bool> {
        let key = normalize_key(key)?;
        let _guard = self.write_lock.lock().await;
        let path = self.value_path(&key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        file.write_all(value.as_bytes()).await?;
        file.flush().await?;
        self.watchers.notify(&DataChangedEvent::new(key, value, ChangeType::Added));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = normalize_key(key)?;
        let _guard = self.write_lock.lock().await;
        let removed = self.collect_keys(&key)?;

        match fs::remove_file(self.value_path(&key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match fs::remove_dir_all(self.dir_path(&key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Repository(format!("Failed to delete {}: {}", key, e)));
            }
        }

        for (removed_key, value) in removed {
            self.watchers
                .notify(&DataChangedEvent::new(removed_key, value, ChangeType::Deleted));
        }
        Ok(())
    }

    fn watch(&self, prefix: &str) -> WatchReceiver {
        let prefix = normalize_key(prefix).unwrap_or_else(|_| "/".to_string());
        self.watchers.subscribe(prefix)
    }

    fn remove_data_listener(&self, prefix: &str) {
        let prefix = normalize_key(prefix).unwrap_or_else(|_| "/".to_string());
        self.watchers.unsubscribe(&prefix);
    }
}
