//! Metadata Persistence
//!
//! Versioned reads and writes of global rules, properties and table
//! metadata, plus the per-instance attributes of compute nodes. A versioned
//! item keeps every version under `versions/<n>` and points `active_version`
//! at the committed one; the pointer is written last.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::instance::{InstanceMetaData, InstanceState};
use super::metadata::TableMetaData;
use super::paths;
use crate::error::{Error, Result};
use crate::repository::PersistRepository;

/// Facade over the repository for cluster metadata
#[derive(Clone)]
pub struct MetaDataPersistFacade {
    repository: Arc<dyn PersistRepository>,
}

impl MetaDataPersistFacade {
    pub fn new(repository: Arc<dyn PersistRepository>) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &Arc<dyn PersistRepository> {
        &self.repository
    }

    async fn active_version(&self, key: &str) -> Result<Option<u64>> {
        match self.repository.get(key).await? {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| Error::Repository(format!("Invalid active version '{}' at {}", value, key))),
            None => Ok(None),
        }
    }

    async fn next_version(&self, versions_key: &str) -> Result<u64> {
        let latest = self
            .repository
            .get_children_keys(versions_key)
            .await?
            .iter()
            .filter_map(|v| v.parse::<u64>().ok())
            .max();
        Ok(latest.map(|v| v + 1).unwrap_or(0))
    }

    /// Write `value` as a new version and then activate it
    async fn persist_versioned(
        &self,
        versions_key: &str,
        active_version_key: &str,
        value: &str,
    ) -> Result<u64> {
        let version = self.next_version(versions_key).await?;
        self.repository
            .persist(&format!("{}/{}", versions_key, version), value)
            .await?;
        self.repository
            .persist(active_version_key, &version.to_string())
            .await?;
        Ok(version)
    }

    // Global rules

    /// Store a new version of a global rule and activate it
    pub async fn alter_global_rule(&self, name: &str, config: &serde_json::Value) -> Result<u64> {
        let value = serde_json::to_string(config)?;
        let version = self
            .persist_versioned(&paths::rule_versions(name), &paths::rule_active_version(name), &value)
            .await?;
        tracing::info!("Global rule {} is now at version {}", name, version);
        Ok(version)
    }

    /// Load one version of a global rule
    pub async fn load_global_rule(&self, name: &str, version: &str) -> Result<Option<serde_json::Value>> {
        let key = format!("{}/{}", paths::rule_versions(name), version.trim());
        match self.repository.get(&key).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    /// Load the active version of every global rule
    pub async fn load_global_rules(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        let mut result = BTreeMap::new();
        for name in self.repository.get_children_keys(paths::RULES_ROOT).await? {
            let Some(version) = self.active_version(&paths::rule_active_version(&name)).await? else {
                continue;
            };
            if let Some(config) = self.load_global_rule(&name, &version.to_string()).await? {
                result.insert(name, config);
            }
        }
        Ok(result)
    }

    // Properties

    pub async fn alter_properties(&self, props: &BTreeMap<String, String>) -> Result<u64> {
        let value = serde_json::to_string(props)?;
        let version = self
            .persist_versioned(&paths::props_versions(), paths::PROPS_ACTIVE_VERSION, &value)
            .await?;
        tracing::info!("Properties are now at version {}", version);
        Ok(version)
    }

    pub async fn load_properties(&self, version: &str) -> Result<Option<BTreeMap<String, String>>> {
        let key = format!("{}/{}", paths::props_versions(), version.trim());
        match self.repository.get(&key).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    pub async fn load_active_properties(&self) -> Result<BTreeMap<String, String>> {
        match self.active_version(paths::PROPS_ACTIVE_VERSION).await? {
            Some(version) => Ok(self
                .load_properties(&version.to_string())
                .await?
                .unwrap_or_default()),
            None => Ok(BTreeMap::new()),
        }
    }

    // Table metadata

    pub async fn alter_table(&self, database: &str, schema: &str, table: &TableMetaData) -> Result<u64> {
        let value = serde_json::to_string(table)?;
        self.persist_versioned(
            &paths::table_versions(database, schema, &table.name),
            &paths::table_active_version(database, schema, &table.name),
            &value,
        )
        .await
    }

    pub async fn drop_table(&self, database: &str, schema: &str, table: &str) -> Result<()> {
        self.repository.delete(&paths::table(database, schema, table)).await
    }

    pub async fn load_table(
        &self,
        database: &str,
        schema: &str,
        table: &str,
        version: &str,
    ) -> Result<Option<TableMetaData>> {
        let key = format!("{}/{}", paths::table_versions(database, schema, table), version.trim());
        match self.repository.get(&key).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    /// Load the active version of every table of a database as `(schema, table)`
    pub async fn load_database_tables(&self, database: &str) -> Result<Vec<(String, TableMetaData)>> {
        let mut result = Vec::new();
        for schema in self.repository.get_children_keys(&paths::schemas(database)).await? {
            for table in self
                .repository
                .get_children_keys(&paths::tables(database, &schema))
                .await?
            {
                let active = self
                    .active_version(&paths::table_active_version(database, &schema, &table))
                    .await?;
                if let Some(version) = active {
                    if let Some(meta) = self
                        .load_table(database, &schema, &table, &version.to_string())
                        .await?
                    {
                        result.push((schema.clone(), meta));
                    }
                }
            }
        }
        Ok(result)
    }

    // Compute node attributes

    pub async fn persist_instance_online(&self, metadata: &InstanceMetaData) -> Result<()> {
        self.repository
            .persist(
                &paths::online_instance(metadata.instance_type, &metadata.id),
                &serde_json::to_string(metadata)?,
            )
            .await
    }

    pub async fn persist_instance_offline(&self, metadata: &InstanceMetaData) -> Result<()> {
        self.repository
            .delete(&paths::online_instance(metadata.instance_type, &metadata.id))
            .await
    }

    pub async fn persist_instance_state(&self, instance_id: &str, state: InstanceState) -> Result<()> {
        self.repository
            .persist(&paths::instance_state(instance_id), state.as_str())
            .await
    }

    pub async fn load_instance_state(&self, instance_id: &str) -> Result<InstanceState> {
        let value = self
            .repository
            .get(&paths::instance_state(instance_id))
            .await?
            .unwrap_or_default();
        Ok(InstanceState::parse(&value).unwrap_or_default())
    }

    pub async fn persist_instance_labels(&self, instance_id: &str, labels: &[String]) -> Result<()> {
        let value = if labels.is_empty() {
            String::new()
        } else {
            serde_json::to_string(labels)?
        };
        self.repository
            .persist(&paths::instance_labels(instance_id), &value)
            .await
    }

    pub async fn load_instance_labels(&self, instance_id: &str) -> Result<Vec<String>> {
        match self.repository.get(&paths::instance_labels(instance_id)).await? {
            Some(value) => parse_labels(&value),
            None => Ok(Vec::new()),
        }
    }

    pub async fn persist_instance_worker_id(&self, instance_id: &str, worker_id: i64) -> Result<()> {
        self.repository
            .persist(&paths::instance_worker_id(instance_id), &worker_id.to_string())
            .await
    }

    pub async fn load_instance_worker_id(&self, instance_id: &str) -> Result<Option<i64>> {
        match self.repository.get(&paths::instance_worker_id(instance_id)).await? {
            Some(value) => parse_worker_id(&value),
            None => Ok(None),
        }
    }
}

/// Labels value: empty means no labels
pub fn parse_labels(value: &str) -> Result<Vec<String>> {
    if value.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(value)?)
}

/// Worker id value: empty means unassigned
pub fn parse_worker_id(value: &str) -> Result<Option<i64>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse::<i64>()
        .map(Some)
        .map_err(|_| Error::Repository(format!("Invalid worker id '{}'", value)))
}
