//! Pipeline SQL Builder
//!
//! Builds the statements the pipeline runs against source and target
//! databases, keyed by dialect. Values are always bound as parameters.

use serde::{Deserialize, Serialize};

use super::record::{ColumnValue, DataRecord, Operation};

/// Database dialect
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    #[serde(alias = "mariadb")]
    MySql,
    #[serde(alias = "postgres")]
    PostgreSql,
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::MySql => write!(f, "MySQL"),
            Dialect::PostgreSql => write!(f, "PostgreSQL"),
        }
    }
}

/// Schema-qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: Option<String>,
    pub table: String,
}

impl TableName {
    pub fn new(schema: Option<&str>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.map(|s| s.to_string()),
            table: table.into(),
        }
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.table),
            None => write!(f, "{}", self.table),
        }
    }
}

/// SQL text with its bound parameters, in placeholder order
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<ColumnValue>,
}

impl SqlStatement {
    fn new(sql: String, params: Vec<ColumnValue>) -> Self {
        Self { sql, params }
    }
}

/// Builds dialect-specific pipeline SQL
#[derive(Debug, Clone, Copy)]
pub struct PipelineSqlBuilder {
    dialect: Dialect,
}

impl PipelineSqlBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Quote an identifier
    pub fn quote(&self, identifier: &str) -> String {
        match self.dialect {
            Dialect::MySql => format!("`{}`", identifier.replace('`', "``")),
            Dialect::PostgreSql => format!("\"{}\"", identifier.replace('"', "\"\"")),
        }
    }

    fn qualified(&self, table: &TableName) -> String {
        match &table.schema {
            Some(schema) => format!("{}.{}", self.quote(schema), self.quote(&table.table)),
            None => self.quote(&table.table),
        }
    }

    /// Placeholder for the parameter at `index` (0-based)
    fn placeholder(&self, index: usize) -> String {
        match self.dialect {
            Dialect::MySql => "?".to_string(),
            Dialect::PostgreSql => format!("${}", index + 1),
        }
    }

    fn column_list(&self, columns: Option<&[String]>) -> String {
        match columns {
            Some(columns) if !columns.is_empty() => columns
                .iter()
                .map(|c| self.quote(c))
                .collect::<Vec<_>>()
                .join(", "),
            _ => "*".to_string(),
        }
    }

    /// Fast row estimate from catalog statistics
    pub fn build_estimated_count_sql(&self, table: &TableName) -> Option<SqlStatement> {
        match self.dialect {
            Dialect::MySql => {
                let schema_condition = match &table.schema {
                    Some(_) => "TABLE_SCHEMA = ?",
                    None => "TABLE_SCHEMA = DATABASE()",
                };
                let mut params = Vec::new();
                if let Some(schema) = &table.schema {
                    params.push(ColumnValue::String(schema.clone()));
                }
                params.push(ColumnValue::String(table.table.clone()));
                Some(SqlStatement::new(
                    format!(
                        "SELECT TABLE_ROWS FROM information_schema.TABLES WHERE {} AND TABLE_NAME = ?",
                        schema_condition
                    ),
                    params,
                ))
            }
            Dialect::PostgreSql => Some(SqlStatement::new(
                "SELECT reltuples::bigint FROM pg_class WHERE oid = $1::regclass".to_string(),
                vec![ColumnValue::String(self.qualified(table))],
            )),
        }
    }

    pub fn build_count_sql(&self, table: &TableName) -> SqlStatement {
        SqlStatement::new(format!("SELECT COUNT(*) FROM {}", self.qualified(table)), Vec::new())
    }

    pub fn build_unique_key_min_max_sql(&self, table: &TableName, unique_key: &str) -> SqlStatement {
        let key = self.quote(unique_key);
        SqlStatement::new(
            format!("SELECT MIN({}), MAX({}) FROM {}", key, key, self.qualified(table)),
            Vec::new(),
        )
    }

    /// One page of a ranged dump, ordered by the unique key.
    ///
    /// The lower bound is inclusive on the first page and exclusive
    /// afterwards; the upper bound is inclusive.
    pub fn build_divisible_sql(
        &self,
        table: &TableName,
        columns: Option<&[String]>,
        unique_key: &str,
        lower: Option<(ColumnValue, bool)>,
        upper: Option<ColumnValue>,
        limit: usize,
    ) -> SqlStatement {
        let key = self.quote(unique_key);
        let mut conditions = Vec::new();
        let mut params = Vec::new();
        if let Some((value, inclusive)) = lower {
            let op = if inclusive { ">=" } else { ">" };
            conditions.push(format!("{} {} {}", key, op, self.placeholder(params.len())));
            params.push(value);
        }
        if let Some(value) = upper {
            conditions.push(format!("{} <= {}", key, self.placeholder(params.len())));
            params.push(value);
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        let limit_placeholder = self.placeholder(params.len());
        params.push(ColumnValue::Int(limit as i64));

        SqlStatement::new(
            format!(
                "SELECT {} FROM {}{} ORDER BY {} ASC LIMIT {}",
                self.column_list(columns),
                self.qualified(table),
                where_clause,
                key,
                limit_placeholder
            ),
            params,
        )
    }

    /// Rows whose unique key equals `value`
    pub fn build_point_query_sql(
        &self,
        table: &TableName,
        columns: Option<&[String]>,
        unique_key: &str,
        value: ColumnValue,
    ) -> SqlStatement {
        SqlStatement::new(
            format!(
                "SELECT {} FROM {} WHERE {} = {}",
                self.column_list(columns),
                self.qualified(table),
                self.quote(unique_key),
                self.placeholder(0)
            ),
            vec![value],
        )
    }

    /// Every row of the table, unordered
    pub fn build_fetch_all_sql(&self, table: &TableName, columns: Option<&[String]>) -> SqlStatement {
        SqlStatement::new(
            format!("SELECT {} FROM {}", self.column_list(columns), self.qualified(table)),
            Vec::new(),
        )
    }

    /// Insert, overwriting the row with the same unique key
    pub fn build_upsert_sql(&self, record: &DataRecord) -> SqlStatement {
        let table = TableName::new(None, record.table.clone());
        let names: Vec<String> = record.columns.iter().map(|c| self.quote(&c.name)).collect();
        let placeholders: Vec<String> = (0..record.columns.len()).map(|i| self.placeholder(i)).collect();
        let updates: Vec<String> = record
            .columns
            .iter()
            .filter(|c| !c.unique_key)
            .map(|c| {
                let name = self.quote(&c.name);
                match self.dialect {
                    Dialect::MySql => format!("{} = VALUES({})", name, name),
                    Dialect::PostgreSql => format!("{} = EXCLUDED.{}", name, name),
                }
            })
            .collect();

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.qualified(&table),
            names.join(", "),
            placeholders.join(", ")
        );
        match self.dialect {
            Dialect::MySql => {
                if !updates.is_empty() {
                    sql.push_str(&format!(" ON DUPLICATE KEY UPDATE {}", updates.join(", ")));
                }
            }
            Dialect::PostgreSql => {
                let keys: Vec<String> = record.unique_key_columns().map(|c| self.quote(&c.name)).collect();
                if !keys.is_empty() {
                    if updates.is_empty() {
                        sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", keys.join(", ")));
                    } else {
                        sql.push_str(&format!(
                            " ON CONFLICT ({}) DO UPDATE SET {}",
                            keys.join(", "),
                            updates.join(", ")
                        ));
                    }
                }
            }
        }
        let params = record.columns.iter().map(|c| c.value.clone()).collect();
        SqlStatement::new(sql, params)
    }

    /// Delete by unique key
    pub fn build_delete_sql(&self, record: &DataRecord) -> SqlStatement {
        let table = TableName::new(None, record.table.clone());
        let keys: Vec<_> = record.unique_key_columns().collect();
        let conditions: Vec<String> = keys
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = {}", self.quote(&c.name), self.placeholder(i)))
            .collect();
        SqlStatement::new(
            format!("DELETE FROM {} WHERE {}", self.qualified(&table), conditions.join(" AND ")),
            keys.iter().map(|c| c.value.clone()).collect(),
        )
    }

    /// Statement applying `record` to the target
    pub fn build_record_sql(&self, record: &DataRecord) -> SqlStatement {
        match record.operation {
            Operation::Insert | Operation::Update => self.build_upsert_sql(record),
            Operation::Delete => self.build_delete_sql(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::position::IngestPosition;
    use crate::pipeline::record::Column;

    fn order_record(operation: Operation) -> DataRecord {
        let mut record = DataRecord::new(operation, "t_order", IngestPosition::integer(1, 10));
        record.add_column(Column::new("order_id", ColumnValue::Int(1), true));
        record.add_column(Column::new("status", ColumnValue::String("OK".into()), false));
        record
    }

    #[test]
    fn test_dialect_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            dialect: Dialect,
        }
        let parsed: Wrapper = toml::from_str("dialect = \"postgresql\"").unwrap();
        assert_eq!(parsed.dialect, Dialect::PostgreSql);
        let parsed: Wrapper = toml::from_str("dialect = \"mariadb\"").unwrap();
        assert_eq!(parsed.dialect, Dialect::MySql);
    }

    #[test]
    fn test_divisible_sql_first_and_later_pages() {
        let builder = PipelineSqlBuilder::new(Dialect::MySql);
        let table = TableName::new(None, "t_order_0");

        let first = builder.build_divisible_sql(
            &table,
            None,
            "order_id",
            Some((ColumnValue::Int(1), true)),
            Some(ColumnValue::Int(100)),
            1000,
        );
        assert_eq!(
            first.sql,
            "SELECT * FROM `t_order_0` WHERE `order_id` >= ? AND `order_id` <= ? ORDER BY `order_id` ASC LIMIT ?"
        );
        assert_eq!(
            first.params,
            vec![ColumnValue::Int(1), ColumnValue::Int(100), ColumnValue::Int(1000)]
        );

        let later = builder.build_divisible_sql(
            &table,
            Some(&["order_id".to_string()]),
            "order_id",
            Some((ColumnValue::Int(50), false)),
            None,
            10,
        );
        assert_eq!(
            later.sql,
            "SELECT `order_id` FROM `t_order_0` WHERE `order_id` > ? ORDER BY `order_id` ASC LIMIT ?"
        );
    }

    #[test]
    fn test_postgres_placeholders_and_quoting() {
        let builder = PipelineSqlBuilder::new(Dialect::PostgreSql);
        let table = TableName::new(Some("public"), "t_order");
        let sql = builder.build_divisible_sql(
            &table,
            None,
            "order_id",
            Some((ColumnValue::Int(1), true)),
            Some(ColumnValue::Int(9)),
            5,
        );
        assert_eq!(
            sql.sql,
            "SELECT * FROM \"public\".\"t_order\" WHERE \"order_id\" >= $1 AND \"order_id\" <= $2 ORDER BY \"order_id\" ASC LIMIT $3"
        );
    }

    #[test]
    fn test_count_statements() {
        let builder = PipelineSqlBuilder::new(Dialect::MySql);
        let table = TableName::new(None, "t_order");
        assert_eq!(builder.build_count_sql(&table).sql, "SELECT COUNT(*) FROM `t_order`");
        assert_eq!(
            builder.build_unique_key_min_max_sql(&table, "order_id").sql,
            "SELECT MIN(`order_id`), MAX(`order_id`) FROM `t_order`"
        );
        let estimated = builder.build_estimated_count_sql(&table).unwrap();
        assert!(estimated.sql.contains("TABLE_SCHEMA = DATABASE()"));
        assert_eq!(estimated.params, vec![ColumnValue::String("t_order".into())]);
    }

    #[test]
    fn test_record_statements_per_operation() {
        let mysql = PipelineSqlBuilder::new(Dialect::MySql);
        assert_eq!(
            mysql.build_record_sql(&order_record(Operation::Insert)).sql,
            "INSERT INTO `t_order` (`order_id`, `status`) VALUES (?, ?) ON DUPLICATE KEY UPDATE `status` = VALUES(`status`)"
        );
        let delete = mysql.build_record_sql(&order_record(Operation::Delete));
        assert_eq!(delete.sql, "DELETE FROM `t_order` WHERE `order_id` = ?");
        assert_eq!(delete.params, vec![ColumnValue::Int(1)]);

        let postgres = PipelineSqlBuilder::new(Dialect::PostgreSql);
        assert_eq!(
            postgres.build_record_sql(&order_record(Operation::Update)).sql,
            "INSERT INTO \"t_order\" (\"order_id\", \"status\") VALUES ($1, $2) ON CONFLICT (\"order_id\") DO UPDATE SET \"status\" = EXCLUDED.\"status\""
        );
    }

    #[test]
    fn test_quote_escapes() {
        let builder = PipelineSqlBuilder::new(Dialect::MySql);
        assert_eq!(builder.quote("we`ird"), "`we``ird`");
    }
}
