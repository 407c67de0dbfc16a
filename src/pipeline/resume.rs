//! Resume / Checkpoint Manager
//!
//! Keeps the inventory and incremental positions of one job item and writes
//! them to the persistence repository, periodically and once more on close.
//! Two blobs live under the job item path:
//!
//! - `<path>/inventory`: `{"unfinished": {task: position}, "finished": [task]}`
//! - `<path>/incremental`: `{data source: position}`

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::position::{IngestPosition, PositionCell};
use crate::error::Result;
use crate::repository::PersistRepository;

/// Default delay between background persists
pub const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_secs(60);

const INVENTORY: &str = "inventory";
const INCREMENTAL: &str = "incremental";

#[derive(Debug, Default, Serialize, Deserialize)]
struct InventoryCheckpoint {
    #[serde(default)]
    unfinished: BTreeMap<String, IngestPosition>,
    #[serde(default)]
    finished: Vec<String>,
}

type PositionMap = RwLock<BTreeMap<String, PositionCell>>;

struct ResumeState {
    repository: Arc<dyn PersistRepository>,
    path: String,
    inventory: PositionMap,
    incremental: PositionMap,
    /// Serializes persists from the ticker and from `close`
    persist_lock: tokio::sync::Mutex<()>,
}

impl ResumeState {
    fn snapshot(map: &PositionMap) -> BTreeMap<String, IngestPosition> {
        map.read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(key, cell)| (key.clone(), cell.get()))
            .collect()
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;

        let incremental = serde_json::to_string(&Self::snapshot(&self.incremental))?;
        self.repository
            .persist(&format!("{}/{}", self.path, INCREMENTAL), &incremental)
            .await?;

        let mut checkpoint = InventoryCheckpoint::default();
        for (key, position) in Self::snapshot(&self.inventory) {
            if position.is_finished() {
                checkpoint.finished.push(key);
            } else {
                checkpoint.unfinished.insert(key, position);
            }
        }
        let inventory = serde_json::to_string(&checkpoint)?;
        self.repository
            .persist(&format!("{}/{}", self.path, INVENTORY), &inventory)
            .await?;

        tracing::debug!(
            "Persisted checkpoint {}: {} unfinished, {} finished",
            self.path,
            checkpoint.unfinished.len(),
            checkpoint.finished.len()
        );
        Ok(())
    }
}

/// Read the inventory and incremental positions persisted under `path`
pub async fn load_checkpoint(
    repository: &dyn PersistRepository,
    path: &str,
) -> Result<(BTreeMap<String, IngestPosition>, BTreeMap<String, IngestPosition>)> {
    let inventory = match repository.get(&format!("{}/{}", path, INVENTORY)).await? {
        Some(text) if !text.trim().is_empty() => {
            let checkpoint: InventoryCheckpoint = serde_json::from_str(&text)?;
            let mut positions = checkpoint.unfinished;
            for key in checkpoint.finished {
                positions.insert(key, IngestPosition::Finished);
            }
            positions
        }
        _ => BTreeMap::new(),
    };
    let incremental = match repository.get(&format!("{}/{}", path, INCREMENTAL)).await? {
        Some(text) if !text.trim().is_empty() => serde_json::from_str(&text)?,
        _ => BTreeMap::new(),
    };
    Ok((inventory, incremental))
}

/// Checkpoint manager of one job item
pub struct ResumeManager {
    state: Arc<ResumeState>,
    resumable: bool,
    ticker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ResumeManager {
    /// Load the checkpoint at `path` and start the background persister.
    ///
    /// An unreadable checkpoint fails here instead of starting from empty
    /// state.
    pub async fn open(
        repository: Arc<dyn PersistRepository>,
        path: impl Into<String>,
        persist_interval: Duration,
    ) -> Result<Self> {
        let path = path.into();

        let (inventory, incremental) = load_checkpoint(repository.as_ref(), &path).await?;
        let resumable = !inventory.is_empty() && !incremental.is_empty();
        tracing::info!(
            "Loaded checkpoint {}: {} inventory, {} incremental positions",
            path,
            inventory.len(),
            incremental.len()
        );

        let to_cells = |positions: BTreeMap<String, IngestPosition>| {
            positions
                .into_iter()
                .map(|(key, position)| (key, PositionCell::new(position)))
                .collect::<BTreeMap<_, _>>()
        };
        let state = Arc::new(ResumeState {
            repository,
            path,
            inventory: RwLock::new(to_cells(inventory)),
            incremental: RwLock::new(to_cells(incremental)),
            persist_lock: tokio::sync::Mutex::new(()),
        });

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Self::tick(Arc::downgrade(&state), persist_interval, cancel.clone()));

        Ok(Self {
            state,
            resumable,
            ticker: Mutex::new(Some((cancel, handle))),
        })
    }

    async fn tick(state: Weak<ResumeState>, period: Duration, cancel: CancellationToken) {
        let period = period.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let Some(state) = state.upgrade() else { break };
            if let Err(e) = state.persist().await {
                tracing::warn!("Periodic checkpoint persist of {} failed: {}", state.path, e);
            }
        }
    }

    /// Both position maps were non-empty when loaded
    pub fn is_resumable(&self) -> bool {
        self.resumable
    }

    pub fn path(&self) -> &str {
        &self.state.path
    }

    /// Track an inventory task; replaces any loaded position for `key`
    pub fn register_inventory(&self, key: impl Into<String>, cell: PositionCell) {
        self.state
            .inventory
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), cell);
    }

    /// Track an incremental stream; replaces any loaded position for `key`
    pub fn register_incremental(&self, key: impl Into<String>, cell: PositionCell) {
        self.state
            .incremental
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), cell);
    }

    pub fn inventory_positions(&self) -> BTreeMap<String, IngestPosition> {
        ResumeState::snapshot(&self.state.inventory)
    }

    pub fn incremental_positions(&self) -> BTreeMap<String, IngestPosition> {
        ResumeState::snapshot(&self.state.incremental)
    }

    /// Write both maps now
    pub async fn persist(&self) -> Result<()> {
        self.state.persist().await
    }

    /// Stop the background persister and write a final checkpoint
    pub async fn close(&self) -> Result<()> {
        let ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((cancel, handle)) = ticker {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::warn!("Checkpoint ticker for {} ended abnormally: {}", self.state.path, e);
            }
        }
        self.state.persist().await
    }
}

impl Drop for ResumeManager {
    fn drop(&mut self) {
        let ticker = self.ticker.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((cancel, _)) = ticker {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::RegistryRepository;

    const PATH: &str = "/pipeline/jobs/j1/0";

    fn repository() -> Arc<dyn PersistRepository> {
        Arc::new(RegistryRepository::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_empty_checkpoint_is_not_resumable() {
        let manager = ResumeManager::open(repository(), PATH, DEFAULT_PERSIST_INTERVAL).await.unwrap();
        assert!(!manager.is_resumable());
        assert!(manager.inventory_positions().is_empty());
    }

    #[tokio::test]
    async fn test_close_persists_and_reload_restores() {
        let repo = repository();
        let manager = ResumeManager::open(repo.clone(), PATH, DEFAULT_PERSIST_INTERVAL).await.unwrap();
        manager.register_inventory("ds_0.t_order_0#0", PositionCell::new(IngestPosition::Finished));
        manager.register_inventory("ds_0.t_order_0#1", PositionCell::new(IngestPosition::integer(500, 999)));
        manager.register_incremental(
            "ds_0",
            PositionCell::new(IngestPosition::Binlog {
                file_name: "binlog.000003".into(),
                position: 154,
            }),
        );
        manager.close().await.unwrap();

        let raw = repo.get(&format!("{}/inventory", PATH)).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["finished"], serde_json::json!(["ds_0.t_order_0#0"]));
        assert_eq!(value["unfinished"]["ds_0.t_order_0#1"]["lower_bound"], 500);

        let reloaded = ResumeManager::open(repo, PATH, DEFAULT_PERSIST_INTERVAL).await.unwrap();
        assert!(reloaded.is_resumable());
        let positions = reloaded.inventory_positions();
        assert_eq!(positions["ds_0.t_order_0#0"], IngestPosition::Finished);
        assert_eq!(positions["ds_0.t_order_0#1"], IngestPosition::integer(500, 999));
    }

    #[tokio::test]
    async fn test_resumable_needs_both_maps() {
        let repo = repository();
        let manager = ResumeManager::open(repo.clone(), PATH, DEFAULT_PERSIST_INTERVAL).await.unwrap();
        manager.register_inventory("ds_0.t_order_0#0", PositionCell::new(IngestPosition::integer(1, 9)));
        manager.close().await.unwrap();

        let reloaded = ResumeManager::open(repo, PATH, DEFAULT_PERSIST_INTERVAL).await.unwrap();
        assert_eq!(reloaded.inventory_positions().len(), 1);
        assert!(!reloaded.is_resumable());
    }

    #[tokio::test]
    async fn test_periodic_persist_follows_cell() {
        let repo = repository();
        let manager = ResumeManager::open(repo.clone(), PATH, Duration::from_millis(30)).await.unwrap();
        let cell = PositionCell::new(IngestPosition::integer(1, 100));
        manager.register_inventory("ds_0.t_order_0#0", cell.clone());
        cell.set(IngestPosition::integer(42, 100));

        tokio::time::sleep(Duration::from_millis(120)).await;
        let raw = repo.get(&format!("{}/inventory", PATH)).await.unwrap().unwrap();
        assert!(raw.contains("42"));
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_fails_open() {
        let repo = repository();
        repo.persist(&format!("{}/inventory", PATH), "{not json").await.unwrap();
        assert!(ResumeManager::open(repo, PATH, DEFAULT_PERSIST_INTERVAL).await.is_err());
    }

    #[tokio::test]
    async fn test_drop_without_close_keeps_last_persisted_state() {
        let repo = repository();
        let manager = ResumeManager::open(repo.clone(), PATH, DEFAULT_PERSIST_INTERVAL).await.unwrap();
        let cell = PositionCell::new(IngestPosition::integer(1, 100));
        manager.register_inventory("ds_0.t_order_0#0", cell.clone());
        manager.persist().await.unwrap();

        // Progress after the last persist is lost when no tick fires
        cell.set(IngestPosition::integer(80, 100));
        drop(manager);

        let reloaded = ResumeManager::open(repo, PATH, DEFAULT_PERSIST_INTERVAL).await.unwrap();
        assert_eq!(
            reloaded.inventory_positions()["ds_0.t_order_0#0"],
            IngestPosition::integer(1, 100)
        );
    }
}
