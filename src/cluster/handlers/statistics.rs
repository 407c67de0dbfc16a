//! Statistics row-data changes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::context::ContextManager;
use crate::cluster::dispatch::DataChangedEventHandler;
use crate::cluster::metadata::StatisticsRow;
use crate::cluster::paths::{self, StatisticsNode};
use crate::error::{Error, Result};
use crate::repository::{ChangeType, DataChangedEvent};

/// Mirrors `/statistics/databases` into the local statistics
pub struct StatisticsChangedHandler;

#[async_trait]
impl DataChangedEventHandler for StatisticsChangedHandler {
    fn subscribed_key(&self) -> &'static str {
        paths::STATISTICS_ROOT
    }

    fn subscribed_types(&self) -> &'static [ChangeType] {
        &[ChangeType::Added, ChangeType::Updated, ChangeType::Deleted]
    }

    async fn handle(&self, context: &Arc<ContextManager>, event: &DataChangedEvent) -> Result<()> {
        let Some(node) = paths::parse_statistics(&event.key) else {
            return Ok(());
        };
        let statistics = context.statistics();
        let deleted = event.change_type == ChangeType::Deleted;

        match node {
            StatisticsNode::Database(database) => {
                if deleted {
                    statistics.drop_database(&database).await;
                } else {
                    statistics.add_database(&database).await;
                }
            }
            StatisticsNode::Schema(database, schema) => {
                if deleted {
                    statistics.drop_schema(&database, &schema).await;
                } else {
                    statistics.add_schema(&database, &schema).await;
                }
            }
            StatisticsNode::Table(database, schema, table) => {
                if deleted {
                    statistics.drop_table(&database, &schema, &table).await;
                } else {
                    statistics.add_table(&database, &schema, &table).await;
                }
            }
            StatisticsNode::Row {
                database,
                schema,
                table,
                unique_key,
            } => {
                if deleted {
                    statistics.delete_row(&database, &schema, &table, &unique_key).await;
                } else {
                    let row = parse_row(&event.value)?;
                    statistics
                        .upsert_row(&database, &schema, &table, &unique_key, row)
                        .await;
                }
            }
        }
        Ok(())
    }
}

fn parse_row(value: &str) -> Result<StatisticsRow> {
    if value.trim().is_empty() {
        return Ok(StatisticsRow::new());
    }
    match serde_json::from_str::<serde_json::Value>(value)? {
        serde_json::Value::Object(row) => Ok(row),
        other => Err(Error::Repository(format!("Statistics row must be an object, got {}", other))),
    }
}
