//! Process Management
//!
//! Local registry of running processes, the lock registry used to wait for
//! cluster-wide process operations, and the caller side of kill and
//! show-process-list. A cluster-wide operation writes one trigger key per
//! online instance; each instance acts on its own trigger and deletes it,
//! and the deletions wake the waiting caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::context::ContextManager;
use super::paths;
use crate::error::{Error, Result};
use crate::repository::PersistRepository;

/// A running process visible to `show process list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub id: String,
    /// Process kind, e.g. `MIGRATION`
    pub kind: String,
    pub description: String,
    #[serde(default)]
    pub instance_id: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

impl ProcessInfo {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            description: description.into(),
            instance_id: String::new(),
            start_time: chrono::Utc::now(),
        }
    }
}

struct RunningProcess {
    info: ProcessInfo,
    cancel: CancellationToken,
}

/// Processes running on this instance
#[derive(Default)]
pub struct ProcessRegistry {
    processes: Arc<Mutex<HashMap<String, RunningProcess>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(processes: &Mutex<HashMap<String, RunningProcess>>) -> MutexGuard<'_, HashMap<String, RunningProcess>> {
        processes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a process; it stays listed until the handle is dropped
    pub fn register(&self, info: ProcessInfo) -> ProcessHandle {
        let cancel = CancellationToken::new();
        let id = info.id.clone();
        Self::lock(&self.processes).insert(
            id.clone(),
            RunningProcess {
                info,
                cancel: cancel.clone(),
            },
        );
        tracing::debug!("Registered process {}", id);
        ProcessHandle {
            id,
            cancel,
            processes: Arc::clone(&self.processes),
        }
    }

    /// Cancel a process; returns false when no such process runs here
    pub fn kill(&self, process_id: &str) -> bool {
        match Self::lock(&self.processes).get(process_id) {
            Some(process) => {
                process.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        let mut result: Vec<ProcessInfo> = Self::lock(&self.processes)
            .values()
            .map(|p| p.info.clone())
            .collect();
        result.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        result
    }

    pub fn contains(&self, process_id: &str) -> bool {
        Self::lock(&self.processes).contains_key(process_id)
    }
}

/// Registration of a running process; unregisters on drop
pub struct ProcessHandle {
    id: String,
    cancel: CancellationToken,
    processes: Arc<Mutex<HashMap<String, RunningProcess>>>,
}

impl ProcessHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token cancelled when the process is killed
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        ProcessRegistry::lock(&self.processes).remove(&self.id);
    }
}

/// Wait points for in-flight cluster-wide process operations
#[derive(Default)]
pub struct ProcessOperationLockRegistry {
    locks: Mutex<HashMap<String, Arc<Notify>>>,
}

impl ProcessOperationLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Notify>>> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create the wait point for `lock_id` (or return the existing one)
    pub fn register(&self, lock_id: &str) -> Arc<Notify> {
        Arc::clone(self.lock().entry(lock_id.to_string()).or_default())
    }

    /// Wake the caller waiting on `lock_id`, if any
    pub fn notify(&self, lock_id: &str) {
        if let Some(notify) = self.lock().get(lock_id) {
            notify.notify_waiters();
        }
    }

    pub fn release(&self, lock_id: &str) {
        self.lock().remove(lock_id);
    }

    /// Wait until `is_ready` reports true, re-checking on every notification.
    /// Returns false when `timeout` elapses first.
    pub async fn wait_until_released<F, Fut>(
        &self,
        lock_id: &str,
        timeout: Duration,
        mut is_ready: F,
    ) -> Result<bool>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let notify = self.register(lock_id);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            // Registered before checking so a notification in between is not lost
            notified.as_mut().enable();

            if is_ready().await? {
                return Ok(true);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return is_ready().await;
            }
        }
    }
}

/// Issues cluster-wide process operations
pub struct ProcessCoordinator {
    context: Arc<ContextManager>,
    timeout: Duration,
}

impl ProcessCoordinator {
    pub fn new(context: Arc<ContextManager>) -> Self {
        let timeout = context.process_operation_timeout();
        Self { context, timeout }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn all_removed(repository: Arc<dyn PersistRepository>, keys: Vec<String>) -> Result<bool> {
        for key in &keys {
            if repository.exists(key).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Write one trigger per instance and wait for all of them to be consumed
    async fn fan_out(&self, lock_id: &str, triggers: Vec<String>) -> Result<bool> {
        let repository = Arc::clone(self.context.repository());
        let locks = self.context.process_locks();
        locks.register(lock_id);
        for key in &triggers {
            repository.persist(key, "").await?;
        }

        let waited = locks
            .wait_until_released(lock_id, self.timeout, || {
                Self::all_removed(Arc::clone(&repository), triggers.clone())
            })
            .await;
        locks.release(lock_id);

        let released = waited?;
        if !released {
            for key in &triggers {
                if let Err(e) = repository.delete(key).await {
                    tracing::warn!("Failed to remove trigger {}: {}", key, e);
                }
            }
        }
        Ok(released)
    }

    /// Kill `process_id` wherever it runs
    pub async fn kill_process(&self, process_id: &str) -> Result<()> {
        let triggers: Vec<String> = self
            .context
            .instances()
            .ids()
            .await
            .iter()
            .map(|instance_id| paths::kill_process_trigger(instance_id, process_id))
            .collect();

        tracing::info!("Killing process {} on {} instance(s)", process_id, triggers.len());
        if !self.fan_out(process_id, triggers).await? {
            return Err(Error::Timeout(format!("kill of process {}", process_id)));
        }
        Ok(())
    }

    /// Collect the running processes of every online instance
    pub async fn get_process_list(&self) -> Result<Vec<ProcessInfo>> {
        let task_id = uuid::Uuid::new_v4().simple().to_string();
        let triggers: Vec<String> = self
            .context
            .instances()
            .ids()
            .await
            .iter()
            .map(|instance_id| paths::show_process_list_trigger(instance_id, &task_id))
            .collect();

        if !self.fan_out(&task_id, triggers).await? {
            tracing::warn!("Timed out collecting process lists for task {}", task_id);
        }

        let repository = self.context.repository();
        let root = paths::execution_nodes(&task_id);
        let mut result = Vec::new();
        for instance_id in repository.get_children_keys(&root).await? {
            if let Some(value) = repository
                .get(&paths::execution_node(&task_id, &instance_id))
                .await?
            {
                let processes: Vec<ProcessInfo> = serde_json::from_str(&value)?;
                result.extend(processes);
            }
        }
        repository.delete(&root).await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_process_registry_kill_and_drop() {
        let registry = ProcessRegistry::new();
        let handle = registry.register(ProcessInfo::new("p1", "MIGRATION", "job-1"));
        let token = handle.cancel_token();

        assert_eq!(registry.list().len(), 1);
        assert!(registry.kill("p1"));
        assert!(token.is_cancelled());
        assert!(!registry.kill("p2"));

        drop(handle);
        assert!(registry.list().is_empty());
        assert!(!registry.contains("p1"));
    }

    #[tokio::test]
    async fn test_wait_until_released_wakes_on_notify() {
        let locks = Arc::new(ProcessOperationLockRegistry::new());
        let ready = Arc::new(AtomicBool::new(false));

        let waiter = {
            let locks = Arc::clone(&locks);
            let ready = Arc::clone(&ready);
            tokio::spawn(async move {
                locks
                    .wait_until_released("op", Duration::from_secs(5), || {
                        let ready = Arc::clone(&ready);
                        async move { Ok(ready.load(Ordering::SeqCst)) }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        ready.store(true, Ordering::SeqCst);
        locks.notify("op");

        assert!(waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_wait_until_released_times_out() {
        let locks = ProcessOperationLockRegistry::new();
        let released = locks
            .wait_until_released("op", Duration::from_millis(20), || async { Ok(false) })
            .await
            .unwrap();
        assert!(!released);
    }
}
