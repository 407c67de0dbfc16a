//! Metadata and Statistics
//!
//! In-memory view of logical databases (database → schema → table) and the
//! statistics rows collected for them. Both are updated by cluster event
//! handlers and read by the pipeline and the admin API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Table metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetaData {
    /// Table name
    pub name: String,
    /// Columns
    #[serde(default)]
    pub columns: Vec<ColumnSchema>,
    /// Primary key columns
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Indexes
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
}

impl TableMetaData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Primary key, or the first unique index when the table has none
    pub fn unique_key(&self) -> Option<Vec<String>> {
        if !self.primary_key.is_empty() {
            return Some(self.primary_key.clone());
        }
        self.indexes
            .iter()
            .find(|index| index.unique && !index.columns.is_empty())
            .map(|index| index.columns.clone())
    }
}

/// Column schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
}

/// Index schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Schema metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMetaData {
    pub tables: BTreeMap<String, TableMetaData>,
}

/// Database metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseMetaData {
    pub name: String,
    pub schemas: BTreeMap<String, SchemaMetaData>,
}

/// Registry of logical databases known to this node
#[derive(Default)]
pub struct MetaDataManager {
    databases: RwLock<BTreeMap<String, DatabaseMetaData>>,
}

impl MetaDataManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an empty database; returns false when it already exists
    pub async fn add_database(&self, name: &str) -> bool {
        let mut databases = self.databases.write().await;
        if databases.contains_key(name) {
            return false;
        }
        databases.insert(
            name.to_string(),
            DatabaseMetaData {
                name: name.to_string(),
                schemas: BTreeMap::new(),
            },
        );
        true
    }

    /// Drop a database; returns false when it was unknown
    pub async fn drop_database(&self, name: &str) -> bool {
        self.databases.write().await.remove(name).is_some()
    }

    pub async fn contains_database(&self, name: &str) -> bool {
        self.databases.read().await.contains_key(name)
    }

    pub async fn database_names(&self) -> Vec<String> {
        self.databases.read().await.keys().cloned().collect()
    }

    pub async fn database(&self, name: &str) -> Option<DatabaseMetaData> {
        self.databases.read().await.get(name).cloned()
    }

    /// Create or replace a table, creating its database and schema as needed
    pub async fn alter_table(&self, database: &str, schema: &str, table: TableMetaData) {
        let mut databases = self.databases.write().await;
        let entry = databases
            .entry(database.to_string())
            .or_insert_with(|| DatabaseMetaData {
                name: database.to_string(),
                schemas: BTreeMap::new(),
            });
        entry
            .schemas
            .entry(schema.to_string())
            .or_default()
            .tables
            .insert(table.name.clone(), table);
    }

    /// Remove a table; returns false when it was unknown
    pub async fn drop_table(&self, database: &str, schema: &str, table: &str) -> bool {
        let mut databases = self.databases.write().await;
        databases
            .get_mut(database)
            .and_then(|db| db.schemas.get_mut(schema))
            .map(|s| s.tables.remove(table).is_some())
            .unwrap_or(false)
    }

    pub async fn table(&self, database: &str, schema: &str, table: &str) -> Option<TableMetaData> {
        self.databases
            .read()
            .await
            .get(database)
            .and_then(|db| db.schemas.get(schema))
            .and_then(|s| s.tables.get(table))
            .cloned()
    }
}

/// One statistics row, stored as a JSON object
pub type StatisticsRow = serde_json::Map<String, serde_json::Value>;

/// Statistics of one table, keyed by row unique key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableStatistics {
    pub rows: BTreeMap<String, StatisticsRow>,
}

type StatisticsTree = BTreeMap<String, BTreeMap<String, BTreeMap<String, TableStatistics>>>;

/// Statistics for every database, schema and table
#[derive(Default)]
pub struct StatisticsData {
    databases: RwLock<StatisticsTree>,
}

impl StatisticsData {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_database(&self, database: &str) {
        self.databases
            .write()
            .await
            .entry(database.to_string())
            .or_default();
    }

    pub async fn drop_database(&self, database: &str) {
        self.databases.write().await.remove(database);
    }

    pub async fn add_schema(&self, database: &str, schema: &str) {
        self.databases
            .write()
            .await
            .entry(database.to_string())
            .or_default()
            .entry(schema.to_string())
            .or_default();
    }

    pub async fn drop_schema(&self, database: &str, schema: &str) {
        if let Some(db) = self.databases.write().await.get_mut(database) {
            db.remove(schema);
        }
    }

    pub async fn add_table(&self, database: &str, schema: &str, table: &str) {
        self.databases
            .write()
            .await
            .entry(database.to_string())
            .or_default()
            .entry(schema.to_string())
            .or_default()
            .entry(table.to_string())
            .or_default();
    }

    pub async fn drop_table(&self, database: &str, schema: &str, table: &str) {
        if let Some(s) = self
            .databases
            .write()
            .await
            .get_mut(database)
            .and_then(|db| db.get_mut(schema))
        {
            s.remove(table);
        }
    }

    /// Insert or replace one row
    pub async fn upsert_row(
        &self,
        database: &str,
        schema: &str,
        table: &str,
        unique_key: &str,
        row: StatisticsRow,
    ) {
        self.databases
            .write()
            .await
            .entry(database.to_string())
            .or_default()
            .entry(schema.to_string())
            .or_default()
            .entry(table.to_string())
            .or_default()
            .rows
            .insert(unique_key.to_string(), row);
    }

    pub async fn delete_row(&self, database: &str, schema: &str, table: &str, unique_key: &str) {
        if let Some(t) = self
            .databases
            .write()
            .await
            .get_mut(database)
            .and_then(|db| db.get_mut(schema))
            .and_then(|s| s.get_mut(table))
        {
            t.rows.remove(unique_key);
        }
    }

    pub async fn table(&self, database: &str, schema: &str, table: &str) -> Option<TableStatistics> {
        self.databases
            .read()
            .await
            .get(database)
            .and_then(|db| db.get(schema))
            .and_then(|s| s.get(table))
            .cloned()
    }

    pub async fn contains_database(&self, database: &str) -> bool {
        self.databases.read().await.contains_key(database)
    }

    /// `(database, schema, table)` for every table that has statistics
    pub async fn table_names(&self) -> Vec<(String, String, String)> {
        let databases = self.databases.read().await;
        let mut result = Vec::new();
        for (database, schemas) in databases.iter() {
            for (schema, tables) in schemas {
                for table in tables.keys() {
                    result.push((database.clone(), schema.clone(), table.clone()));
                }
            }
        }
        result
    }
}
