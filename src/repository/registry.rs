//! Registry Repository
//!
//! Cluster coordination registry backed by a shared SQLite database. Every
//! compute node pointing at the same registry file sees the same keys.
//!
//! Each write also appends to a change log in the same transaction. Local
//! watchers are notified immediately; a background poller replays the log
//! entries written by other processes sharing the file, in commit order.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{normalize_key, ChangeType, DataChangedEvent, PersistRepository, WatchReceiver, WatcherSet};
use crate::error::Result;

/// How often other processes' changes are picked up
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Change log entries older than this are pruned
const CHANGE_RETENTION: &str = "-10 minutes";

/// Prune the change log once every this many polls
const PRUNE_EVERY: u64 = 300;

struct Shared {
    conn: Mutex<Connection>,
    watchers: WatcherSet,
    /// Tags change log rows written through this handle
    origin: String,
}

/// SQLite-backed coordination registry
pub struct RegistryRepository {
    shared: Arc<Shared>,
    poller: Option<JoinHandle<()>>,
}

impl RegistryRepository {
    /// Create or open the registry database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_poll_interval(path, DEFAULT_POLL_INTERVAL)
    }

    /// Open a shared registry, polling for other processes' changes every
    /// `poll_interval`
    pub fn open_with_poll_interval(path: &Path, poll_interval: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        let mut repository = Self::init(conn)?;
        repository.start_poller(poll_interval)?;
        Ok(repository)
    }

    /// Create a private in-memory registry
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS registry (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS registry_changes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                change_type TEXT NOT NULL,
                origin TEXT NOT NULL,
                changed_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(Self {
            shared: Arc::new(Shared {
                conn: Mutex::new(conn),
                watchers: WatcherSet::new(),
                origin: uuid::Uuid::new_v4().to_string(),
            }),
            poller: None,
        })
    }

    fn start_poller(&mut self, poll_interval: Duration) -> Result<()> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime; changes from other processes will not be watched");
            return Ok(());
        };
        let last_seq = self.shared.conn.try_lock().map_or(Ok(0), |conn| latest_seq(&conn))?;
        let shared = Arc::downgrade(&self.shared);
        self.poller = Some(runtime.spawn(poll_changes(shared, poll_interval, last_seq)));
        Ok(())
    }

    /// Keys strictly below `key`, with their values
    fn descendants(conn: &Connection, key: &str) -> Result<Vec<(String, String)>> {
        let prefix = format!("{}/", key);
        let mut stmt = conn.prepare(
            "SELECT key, value FROM registry WHERE substr(key, 1, ?2) = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix, prefix.chars().count() as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn log_change(&self, conn: &Connection, event: &DataChangedEvent) -> Result<()> {
        conn.execute(
            "INSERT INTO registry_changes (key, value, change_type, origin) VALUES (?1, ?2, ?3, ?4)",
            params![event.key, event.value, event.change_type.to_string(), self.shared.origin],
        )?;
        Ok(())
    }
}

impl Drop for RegistryRepository {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

fn latest_seq(conn: &Connection) -> Result<i64> {
    let seq = conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM registry_changes", [], |row| {
        row.get::<_, i64>(0)
    })?;
    Ok(seq)
}

fn parse_change_type(value: &str) -> Option<ChangeType> {
    match value {
        "ADDED" => Some(ChangeType::Added),
        "UPDATED" => Some(ChangeType::Updated),
        "DELETED" => Some(ChangeType::Deleted),
        _ => None,
    }
}

/// Replay change log rows written by other processes until the repository
/// is dropped
async fn poll_changes(shared: Weak<Shared>, poll_interval: Duration, mut last_seq: i64) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut polls: u64 = 0;

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        polls += 1;

        let conn = shared.conn.lock().await;
        match deliver_changes(&conn, &shared, last_seq) {
            Ok(seq) => last_seq = seq,
            Err(e) => tracing::warn!("Failed to read registry change log: {}", e),
        }
        if polls % PRUNE_EVERY == 0 {
            if let Err(e) = conn.execute(
                "DELETE FROM registry_changes WHERE changed_at < datetime('now', ?1)",
                params![CHANGE_RETENTION],
            ) {
                tracing::debug!("Failed to prune registry change log: {}", e);
            }
        }
    }
}

/// Notify watchers of foreign changes after `after`; returns the last
/// sequence number seen
fn deliver_changes(conn: &Connection, shared: &Shared, after: i64) -> Result<i64> {
    let mut stmt = conn.prepare(
        "SELECT seq, key, value, change_type, origin FROM registry_changes WHERE seq > ?1 ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![after], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut last_seq = after;
    for row in rows {
        let (seq, key, value, change_type, origin) = row?;
        last_seq = seq;
        if origin == shared.origin {
            continue;
        }
        match parse_change_type(&change_type) {
            Some(change_type) => shared
                .watchers
                .notify(&DataChangedEvent::new(key, value, change_type)),
            None => tracing::warn!("Unknown change type '{}' for {} in change log", change_type, key),
        }
    }
    Ok(last_seq)
}

#[async_trait]
impl PersistRepository for RegistryRepository {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = normalize_key(key)?;
        let conn = self.shared.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value FROM registry WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn get_children_keys(&self, key: &str) -> Result<Vec<String>> {
        let key = normalize_key(key)?;
        let conn = self.shared.conn.lock().await;
        let prefix_len = key.len() + 1;

        let mut children: Vec<String> = Self::descendants(&conn, &key)?
            .into_iter()
            .filter_map(|(child_key, _)| {
                child_key
                    .get(prefix_len..)
                    .and_then(|rest| rest.split('/').next())
                    .map(|s| s.to_string())
            })
            .collect();
        children.sort();
        children.dedup();
        Ok(children)
    }

    async fn persist(&self, key: &str, value: &str) -> Result<()> {
        let key = normalize_key(key)?;
        let mut conn = self.shared.conn.lock().await;
        let tx = conn.transaction()?;
        let existed = tx
            .query_row("SELECT 1 FROM registry WHERE key = ?1", params![key], |_| Ok(()))
            .optional()?
            .is_some();
        tx.execute(
            r#"
            INSERT INTO registry (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![key, value],
        )?;
        let change_type = if existed {
            ChangeType::Updated
        } else {
            ChangeType::Added
        };
        let event = DataChangedEvent::new(key, value, change_type);
        self.log_change(&tx, &event)?;
        tx.commit()?;

        // Still under the connection lock, so events follow commit order
        self.shared.watchers.notify(&event);
        Ok(())
    }

    async fn persist_exclusive(&self, key: &str, value: &str) -> Result<bool> {
        let key = normalize_key(key)?;
        let mut conn = self.shared.conn.lock().await;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO registry (key, value) VALUES (?1, ?2)",
            params![key, value],
        )? == 1;
        let event = DataChangedEvent::new(key, value, ChangeType::Added);
        if inserted {
            self.log_change(&tx, &event)?;
        }
        tx.commit()?;

        if inserted {
            self.shared.watchers.notify(&event);
        }
        Ok(inserted)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = normalize_key(key)?;
        let mut conn = self.shared.conn.lock().await;
        let tx = conn.transaction()?;

        let mut removed = Vec::new();
        if let Some(value) = tx
            .query_row(
                "SELECT value FROM registry WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?
        {
            removed.push((key.clone(), value));
        }
        removed.extend(Self::descendants(&tx, &key)?);
        let prefix = format!("{}/", key);
        tx.execute(
            "DELETE FROM registry WHERE key = ?1 OR substr(key, 1, ?3) = ?2",
            params![key, prefix, prefix.chars().count() as i64],
        )?;

        let events: Vec<DataChangedEvent> = removed
            .into_iter()
            .map(|(removed_key, value)| DataChangedEvent::new(removed_key, value, ChangeType::Deleted))
            .collect();
        for event in &events {
            self.log_change(&tx, event)?;
        }
        tx.commit()?;

        for event in &events {
            self.shared.watchers.notify(event);
        }
        Ok(())
    }

    fn watch(&self, prefix: &str) -> WatchReceiver {
        let prefix = normalize_key(prefix).unwrap_or_else(|_| "/".to_string());
        self.shared.watchers.subscribe(prefix)
    }

    fn remove_data_listener(&self, prefix: &str) {
        let prefix = normalize_key(prefix).unwrap_or_else(|_| "/".to_string());
        self.shared.watchers.unsubscribe(&prefix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_registry_basic() {
        let repo = RegistryRepository::open_in_memory().unwrap();

        repo.persist("/nodes/compute_nodes/online/proxy/p1", "{}").await.unwrap();
        repo.persist("/nodes/compute_nodes/online/proxy/p2", "{}").await.unwrap();
        repo.persist("/nodes/compute_nodes/online/jdbc/j1", "{}").await.unwrap();

        assert_eq!(
            repo.get_children_keys("/nodes/compute_nodes/online").await.unwrap(),
            vec!["jdbc".to_string(), "proxy".to_string()]
        );
        assert_eq!(
            repo.get_children_keys("/nodes/compute_nodes/online/proxy").await.unwrap(),
            vec!["p1".to_string(), "p2".to_string()]
        );
        assert!(repo.exists("/nodes/compute_nodes/online/jdbc/j1").await.unwrap());
    }

    #[tokio::test]
    async fn test_registry_events() {
        let repo = RegistryRepository::open_in_memory().unwrap();
        let mut rx = repo.watch("/props");

        repo.persist("/props/active_version", "0").await.unwrap();
        repo.persist("/props/active_version", "1").await.unwrap();
        repo.persist("/rules/x", "1").await.unwrap();
        repo.delete("/props").await.unwrap();

        let events: Vec<ChangeType> = vec![
            rx.recv().await.unwrap().change_type,
            rx.recv().await.unwrap().change_type,
            rx.recv().await.unwrap().change_type,
        ];
        assert_eq!(
            events,
            vec![ChangeType::Added, ChangeType::Updated, ChangeType::Deleted]
        );
        assert!(rx.try_recv().is_err());
        assert!(repo.get("/rules/x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_registry_shared_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let first = RegistryRepository::open(&path).unwrap();
        let second = RegistryRepository::open(&path).unwrap();

        first.persist("/states/listener_assisted/db", "CREATE_DATABASE").await.unwrap();
        assert_eq!(
            second.get("/states/listener_assisted/db").await.unwrap().as_deref(),
            Some("CREATE_DATABASE")
        );

        assert!(second.persist_exclusive("/reservation/worker_id/1", "n1").await.unwrap());
        assert!(!first.persist_exclusive("/reservation/worker_id/1", "n2").await.unwrap());
    }

    async fn next_event(rx: &mut WatchReceiver) -> DataChangedEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no change event within 2s")
            .expect("watch closed")
    }

    #[tokio::test]
    async fn test_changes_reach_watchers_of_other_handles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let node_a = RegistryRepository::open_with_poll_interval(&path, Duration::from_millis(20)).unwrap();
        let node_b = RegistryRepository::open_with_poll_interval(&path, Duration::from_millis(20)).unwrap();

        let mut on_a = node_a.watch("/nodes/compute_nodes/kill_process_trigger");
        let mut on_b = node_b.watch("/nodes/compute_nodes/kill_process_trigger");

        let trigger = "/nodes/compute_nodes/kill_process_trigger/node-b:job_0";
        node_a.persist(trigger, "").await.unwrap();

        let event = next_event(&mut on_b).await;
        assert_eq!(event.key, trigger);
        assert_eq!(event.change_type, ChangeType::Added);

        node_b.delete(trigger).await.unwrap();
        let event = next_event(&mut on_a).await;
        assert_eq!(event.change_type, ChangeType::Added);
        let event = next_event(&mut on_a).await;
        assert_eq!(event.key, trigger);
        assert_eq!(event.change_type, ChangeType::Deleted);

        // A handle never replays its own writes
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(on_a.try_recv().is_err());
        assert_eq!(next_event(&mut on_b).await.change_type, ChangeType::Deleted);
        assert!(on_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_history_before_open_is_not_replayed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let first = RegistryRepository::open(&path).unwrap();
        first.persist("/props/active_version", "0").await.unwrap();

        let second = RegistryRepository::open_with_poll_interval(&path, Duration::from_millis(20)).unwrap();
        let mut rx = second.watch("/props");
        first.persist("/props/active_version", "1").await.unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event.value, "1");
        assert_eq!(event.change_type, ChangeType::Updated);
    }

    #[tokio::test]
    async fn test_concurrent_writes_arrive_in_commit_order() {
        let repo = Arc::new(RegistryRepository::open_in_memory().unwrap());
        let mut rx = repo.watch("/nodes/compute_nodes/status");

        let writers: Vec<_> = (0..20)
            .map(|i| {
                let repo = repo.clone();
                tokio::spawn(async move {
                    repo.persist("/nodes/compute_nodes/status/n1", &i.to_string()).await.unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event.value);
        }
        assert_eq!(last, repo.get("/nodes/compute_nodes/status/n1").await.unwrap());
    }
}
