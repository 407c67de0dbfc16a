//! Context Manager
//!
//! Node-local view of cluster state. Event handlers mutate it; the
//! pipeline, the admin API and the process coordinator read it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::instance::{ClusterInstanceRegistry, ComputeNodeInstance, InstanceMetaData};
use super::metadata::{MetaDataManager, StatisticsData};
use super::paths;
use super::persist::MetaDataPersistFacade;
use super::process::{ProcessOperationLockRegistry, ProcessRegistry};
use super::version::ActiveVersionChecker;
use crate::error::{Error, Result};
use crate::repository::{ChangeType, DataChangedEvent, PersistRepository};

const DEFAULT_PROCESS_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state of this compute node
pub struct ContextManager {
    repository: Arc<dyn PersistRepository>,
    persist: MetaDataPersistFacade,
    instances: ClusterInstanceRegistry,
    global_rules: RwLock<BTreeMap<String, serde_json::Value>>,
    properties: RwLock<BTreeMap<String, String>>,
    metadata: MetaDataManager,
    statistics: StatisticsData,
    processes: ProcessRegistry,
    process_locks: ProcessOperationLockRegistry,
    /// Metadata watch tasks of attached databases
    database_watchers: Mutex<HashMap<String, JoinHandle<()>>>,
    process_operation_timeout: Duration,
}

impl ContextManager {
    pub fn new(repository: Arc<dyn PersistRepository>, local: ComputeNodeInstance) -> Self {
        Self {
            persist: MetaDataPersistFacade::new(Arc::clone(&repository)),
            repository,
            instances: ClusterInstanceRegistry::new(local),
            global_rules: RwLock::new(BTreeMap::new()),
            properties: RwLock::new(BTreeMap::new()),
            metadata: MetaDataManager::new(),
            statistics: StatisticsData::new(),
            processes: ProcessRegistry::new(),
            process_locks: ProcessOperationLockRegistry::new(),
            database_watchers: Mutex::new(HashMap::new()),
            process_operation_timeout: DEFAULT_PROCESS_OPERATION_TIMEOUT,
        }
    }

    pub fn with_process_operation_timeout(mut self, timeout: Duration) -> Self {
        self.process_operation_timeout = timeout;
        self
    }

    pub fn repository(&self) -> &Arc<dyn PersistRepository> {
        &self.repository
    }

    pub fn persist(&self) -> &MetaDataPersistFacade {
        &self.persist
    }

    pub fn instances(&self) -> &ClusterInstanceRegistry {
        &self.instances
    }

    pub fn metadata(&self) -> &MetaDataManager {
        &self.metadata
    }

    pub fn statistics(&self) -> &StatisticsData {
        &self.statistics
    }

    pub fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }

    pub fn process_locks(&self) -> &ProcessOperationLockRegistry {
        &self.process_locks
    }

    pub fn process_operation_timeout(&self) -> Duration {
        self.process_operation_timeout
    }

    /// Load rules, properties and already-online instances from the repository
    pub async fn load(&self) -> Result<()> {
        let rules = self.persist.load_global_rules().await?;
        let props = self.persist.load_active_properties().await?;
        tracing::info!("Loaded {} global rule(s) and {} propert(ies)", rules.len(), props.len());
        *self.global_rules.write().await = rules;
        *self.properties.write().await = props;

        for type_segment in self.repository.get_children_keys(paths::ONLINE_ROOT).await? {
            let Some(instance_type) = super::InstanceType::from_segment(&type_segment) else {
                continue;
            };
            let type_root = format!("{}/{}", paths::ONLINE_ROOT, type_segment);
            for instance_id in self.repository.get_children_keys(&type_root).await? {
                let value = self
                    .repository
                    .get(&paths::online_instance(instance_type, &instance_id))
                    .await?
                    .unwrap_or_default();
                let instance = self.load_instance(instance_type, &instance_id, &value).await?;
                self.instances.add(instance).await;
            }
        }
        Ok(())
    }

    /// Build an instance from its online value and persisted attributes
    pub async fn load_instance(
        &self,
        instance_type: super::InstanceType,
        instance_id: &str,
        online_value: &str,
    ) -> Result<ComputeNodeInstance> {
        let metadata = match serde_json::from_str::<InstanceMetaData>(online_value) {
            Ok(metadata) if metadata.id == instance_id => metadata,
            _ => InstanceMetaData::new(instance_id, instance_type),
        };
        let mut instance = ComputeNodeInstance::new(metadata);
        instance.state = self.persist.load_instance_state(instance_id).await?;
        instance.labels = self.persist.load_instance_labels(instance_id).await?;
        instance.worker_id = self.persist.load_instance_worker_id(instance_id).await?;
        Ok(instance)
    }

    // Global rules and properties

    pub async fn alter_global_rule(&self, name: &str, config: serde_json::Value) {
        self.global_rules.write().await.insert(name.to_string(), config);
    }

    pub async fn global_rule(&self, name: &str) -> Option<serde_json::Value> {
        self.global_rules.read().await.get(name).cloned()
    }

    pub async fn global_rules(&self) -> BTreeMap<String, serde_json::Value> {
        self.global_rules.read().await.clone()
    }

    pub async fn alter_properties(&self, props: BTreeMap<String, String>) {
        *self.properties.write().await = props;
    }

    pub async fn properties(&self) -> BTreeMap<String, String> {
        self.properties.read().await.clone()
    }

    // Databases

    fn watchers(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.database_watchers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a database, load its persisted tables and watch its metadata.
    /// Returns false when the database was already attached.
    pub async fn create_database(self: &Arc<Self>, name: &str) -> Result<bool> {
        if self.watchers().contains_key(name) {
            tracing::debug!("Database {} already attached", name);
            return Ok(false);
        }
        self.metadata.add_database(name).await;
        for (schema, table) in self.persist.load_database_tables(name).await? {
            self.metadata.alter_table(name, &schema, table).await;
        }
        self.attach_database_watcher(name);
        tracing::info!("Database {} created", name);
        Ok(true)
    }

    /// Stop watching a database and remove it. Returns false when unknown.
    pub async fn drop_database(&self, name: &str) -> bool {
        let watcher = self.watchers().remove(name);
        let attached = watcher.is_some();
        if let Some(handle) = watcher {
            self.repository.remove_data_listener(&paths::database(name));
            handle.abort();
        }
        let existed = self.metadata.drop_database(name).await;
        if attached || existed {
            tracing::info!("Database {} dropped", name);
        }
        attached || existed
    }

    pub fn attached_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.watchers().keys().cloned().collect();
        names.sort();
        names
    }

    fn attach_database_watcher(self: &Arc<Self>, name: &str) {
        let mut rx = self.repository.watch(&paths::database(name));
        let context: Weak<Self> = Arc::downgrade(self);
        let database = name.to_string();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(context) = context.upgrade() else {
                    break;
                };
                if let Err(e) = context.apply_table_event(&event).await {
                    tracing::error!("Failed to apply metadata change {} for {}: {}", event.key, database, e);
                }
            }
            tracing::debug!("Metadata watcher for {} stopped", database);
        });
        self.watchers().insert(name.to_string(), handle);
    }

    /// Apply a change below `/metadata/<db>` to the local metadata
    pub async fn apply_table_event(&self, event: &DataChangedEvent) -> Result<()> {
        let Some(node) = paths::parse_table_node(&event.key) else {
            return Ok(());
        };
        if !node.is_active_version {
            return Ok(());
        }
        match event.change_type {
            ChangeType::Added | ChangeType::Updated => {
                if !ActiveVersionChecker::check_same(self.repository.as_ref(), event).await? {
                    return Ok(());
                }
                let table = self
                    .persist
                    .load_table(&node.database, &node.schema, &node.table, &event.value)
                    .await?
                    .ok_or_else(|| {
                        Error::MissingConfiguration(format!(
                            "table {}.{}.{} version {}",
                            node.database, node.schema, node.table, event.value
                        ))
                    })?;
                self.metadata.alter_table(&node.database, &node.schema, table).await;
            }
            ChangeType::Deleted => {
                self.metadata
                    .drop_table(&node.database, &node.schema, &node.table)
                    .await;
            }
        }
        Ok(())
    }

    /// Detach every database watcher
    pub fn shutdown(&self) {
        let watchers: Vec<(String, JoinHandle<()>)> = self.watchers().drain().collect();
        for (name, handle) in watchers {
            self.repository.remove_data_listener(&paths::database(&name));
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::metadata::TableMetaData;
    use crate::cluster::InstanceType;
    use crate::repository::RegistryRepository;

    fn context() -> Arc<ContextManager> {
        let repository: Arc<dyn PersistRepository> =
            Arc::new(RegistryRepository::open_in_memory().unwrap());
        Arc::new(ContextManager::new(
            repository,
            ComputeNodeInstance::new(InstanceMetaData::new("local", InstanceType::Proxy)),
        ))
    }

    #[tokio::test]
    async fn test_create_database_is_idempotent() {
        let context = context();
        assert!(context.create_database("sharding_db").await.unwrap());
        assert!(!context.create_database("sharding_db").await.unwrap());
        assert_eq!(context.attached_databases(), vec!["sharding_db"]);

        assert!(context.drop_database("sharding_db").await);
        assert!(!context.drop_database("sharding_db").await);
        assert!(context.attached_databases().is_empty());
    }

    #[tokio::test]
    async fn test_attached_database_follows_table_changes() {
        let context = context();
        context.create_database("db").await.unwrap();

        context
            .persist()
            .alter_table("db", "public", &TableMetaData::new("t_order"))
            .await
            .unwrap();

        let mut found = false;
        for _ in 0..50 {
            if context.metadata().table("db", "public", "t_order").await.is_some() {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(found);

        context.persist().drop_table("db", "public", "t_order").await.unwrap();
        for _ in 0..50 {
            if context.metadata().table("db", "public", "t_order").await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("table was not dropped");
    }

    #[tokio::test]
    async fn test_load_reads_rules_and_online_instances() {
        let context = context();
        context
            .persist()
            .alter_global_rule("authority", &serde_json::json!({"users": ["root"]}))
            .await
            .unwrap();
        let remote = InstanceMetaData::new("remote", InstanceType::Jdbc);
        context.persist().persist_instance_online(&remote).await.unwrap();
        context.persist().persist_instance_worker_id("remote", 5).await.unwrap();

        context.load().await.unwrap();

        assert!(context.global_rule("authority").await.is_some());
        let instance = context.instances().get("remote").await.unwrap();
        assert_eq!(instance.worker_id, Some(5));
    }
}
