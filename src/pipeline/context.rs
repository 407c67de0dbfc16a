//! Inventory Dumper Contexts
//!
//! What one dump unit reads: which table, over which unique key range, in
//! what batch size and at what rate.

use std::collections::HashMap;
use std::sync::Arc;

use super::position::IngestPosition;
use super::rate_limit::RateLimiter;
use super::source::{ColumnMetaData, KeyKind};
use super::sql::TableName;
use crate::config::TableMappingConfig;

/// Resolves the schema of a logical table
#[derive(Debug, Clone, Default)]
pub struct TableAndSchemaNameMapper {
    schemas: HashMap<String, String>,
}

impl TableAndSchemaNameMapper {
    pub fn new(tables: &[TableMappingConfig]) -> Self {
        let schemas = tables
            .iter()
            .filter_map(|t| {
                t.schema
                    .as_ref()
                    .map(|schema| (t.logical.to_ascii_lowercase(), schema.clone()))
            })
            .collect();
        Self { schemas }
    }

    pub fn schema_name(&self, logical_table: &str) -> Option<&str> {
        self.schemas
            .get(&logical_table.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// One dump unit: a table, or one unique key range of a table
#[derive(Debug, Clone)]
pub struct InventoryDumperContext {
    /// Source data source name
    pub data_source_name: String,
    pub logical_table: String,
    pub actual_table: String,
    pub schema_mapper: Arc<TableAndSchemaNameMapper>,
    /// Unique key columns; None until loaded from the source
    pub unique_key_columns: Option<Vec<ColumnMetaData>>,
    /// Columns to copy; None copies every column
    pub insert_columns: Option<Vec<String>>,
    pub position: IngestPosition,
    pub sharding_item: usize,
    pub batch_size: usize,
    pub rate_limiter: RateLimiter,
}

impl InventoryDumperContext {
    /// Per-table context with no unique key range assigned yet
    pub fn new(
        data_source_name: impl Into<String>,
        actual_table: impl Into<String>,
        logical_table: impl Into<String>,
        schema_mapper: Arc<TableAndSchemaNameMapper>,
    ) -> Self {
        Self {
            data_source_name: data_source_name.into(),
            logical_table: logical_table.into(),
            actual_table: actual_table.into(),
            schema_mapper,
            unique_key_columns: None,
            insert_columns: None,
            position: IngestPosition::Placeholder,
            sharding_item: 0,
            batch_size: 1000,
            rate_limiter: RateLimiter::unlimited(),
        }
    }

    pub fn schema_name(&self) -> Option<&str> {
        self.schema_mapper.schema_name(&self.logical_table)
    }

    /// Physical source table
    pub fn source_table(&self) -> TableName {
        TableName::new(self.schema_name(), self.actual_table.clone())
    }

    /// The unique key when it is a single column
    pub fn single_unique_key(&self) -> Option<&ColumnMetaData> {
        match self.unique_key_columns.as_deref() {
            Some([column]) => Some(column),
            _ => None,
        }
    }

    /// Name of the first unique key column, for diagnostics
    pub fn unique_key_name(&self) -> Option<&str> {
        self.unique_key_columns
            .as_deref()
            .and_then(|columns| columns.first())
            .map(|c| c.name.as_str())
    }

    pub fn is_unique_key(&self, column: &str) -> bool {
        self.unique_key_columns
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(column))
    }

    /// Kind of the single unique key column
    pub fn unique_key_kind(&self) -> Option<KeyKind> {
        self.single_unique_key().map(|c| c.kind)
    }

    /// Task id shared by every run over this unit
    pub fn task_id(&self) -> String {
        task_id(&self.data_source_name, &self.actual_table, self.sharding_item)
    }

    /// Copy of this context covering `position` as shard `sharding_item`
    pub fn fork(&self, position: IngestPosition, sharding_item: usize) -> Self {
        let mut context = self.clone();
        context.position = position;
        context.sharding_item = sharding_item;
        context
    }
}

/// `<data source>.<actual table>#<sharding item>`
pub fn task_id(data_source_name: &str, actual_table: &str, sharding_item: usize) -> String {
    format!("{}#{}", task_id_prefix(data_source_name, actual_table), sharding_item)
}

pub(crate) fn task_id_prefix(data_source_name: &str, actual_table: &str) -> String {
    format!("{}.{}", data_source_name, actual_table)
}
