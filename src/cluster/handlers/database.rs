//! Listener-assisted database creation and removal.
//!
//! A node that executes `CREATE DATABASE` or `DROP DATABASE` writes a marker
//! under `/states/listener_assisted/<db>`. Every node applies the marker to
//! its own context; the marker is then removed.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::context::ContextManager;
use crate::cluster::dispatch::DataChangedEventHandler;
use crate::cluster::instance::InstanceType;
use crate::cluster::paths;
use crate::error::{Error, Result};
use crate::repository::{ChangeType, DataChangedEvent};

/// Marker value under `/states/listener_assisted/<db>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerAssistedType {
    CreateDatabase,
    DropDatabase,
}

impl ListenerAssistedType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "CREATE_DATABASE" => Some(ListenerAssistedType::CreateDatabase),
            "DROP_DATABASE" => Some(ListenerAssistedType::DropDatabase),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerAssistedType::CreateDatabase => "CREATE_DATABASE",
            ListenerAssistedType::DropDatabase => "DROP_DATABASE",
        }
    }
}

/// Applies create/drop database markers
pub struct ListenerAssistedHandler;

#[async_trait]
impl DataChangedEventHandler for ListenerAssistedHandler {
    fn subscribed_key(&self) -> &'static str {
        paths::LISTENER_ASSISTED_ROOT
    }

    fn subscribed_types(&self) -> &'static [ChangeType] {
        &[ChangeType::Added, ChangeType::Updated]
    }

    async fn handle(&self, context: &Arc<ContextManager>, event: &DataChangedEvent) -> Result<()> {
        let Some(database) = paths::parse_listener_assisted(&event.key) else {
            return Ok(());
        };
        let marker = ListenerAssistedType::parse(&event.value).ok_or_else(|| {
            Error::Repository(format!("Invalid listener-assisted value '{}' for {}", event.value, database))
        })?;

        match marker {
            ListenerAssistedType::CreateDatabase => {
                context.create_database(&database).await?;
            }
            ListenerAssistedType::DropDatabase => {
                context.drop_database(&database).await;
            }
        }
        context.repository().delete(&event.key).await?;

        if context.instances().local().await.instance_type() == InstanceType::Proxy {
            let context = Arc::clone(context);
            tokio::spawn(async move {
                if let Err(e) = refresh_statistics(&context).await {
                    tracing::warn!("Statistics refresh after {} failed: {}", marker.as_str(), e);
                }
            });
        }
        Ok(())
    }
}

/// Reconcile persisted statistics with the databases and tables known locally
///
/// Missing database, schema and table entries are created; entries for
/// databases no longer known are removed. The resulting repository changes
/// reach every node through the statistics handler.
pub async fn refresh_statistics(context: &ContextManager) -> Result<()> {
    let repository = context.repository();
    let known = context.metadata().database_names().await;

    for name in &known {
        let Some(database) = context.metadata().database(name).await else {
            continue;
        };
        let key = paths::statistics_database(name);
        if !repository.exists(&key).await? {
            repository.persist(&key, "").await?;
        }
        for (schema_name, schema) in &database.schemas {
            let key = paths::statistics_schema(name, schema_name);
            if !repository.exists(&key).await? {
                repository.persist(&key, "").await?;
            }
            for table_name in schema.tables.keys() {
                let key = paths::statistics_table(name, schema_name, table_name);
                if !repository.exists(&key).await? {
                    repository.persist(&key, "").await?;
                }
            }
        }
    }

    for persisted in repository.get_children_keys(paths::STATISTICS_ROOT).await? {
        if !known.contains(&persisted) {
            repository.delete(&paths::statistics_database(&persisted)).await?;
        }
    }
    tracing::debug!("Statistics refreshed for {} database(s)", known.len());
    Ok(())
}
