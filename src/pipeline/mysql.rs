//! MySQL / MariaDB Pipeline Endpoints
//!
//! Source data source and target sink over an sqlx MySQL pool.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::mysql::{MySqlArguments, MySqlPoolOptions, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column as _, MySql, MySqlPool, Row, TypeInfo, ValueRef};
use tokio::sync::mpsc;

use super::position::IngestPosition;
use super::record::{ColumnValue, DataRecord};
use super::source::{
    ColumnMetaData, DumpFilter, DumpQuery, PipelineDataSource, PipelineSink, Row as SourceRow,
};
use super::sql::{Dialect, PipelineSqlBuilder, SqlStatement, TableName};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// Connect a pool for `config`
pub async fn connect_pool(config: &DatabaseConfig) -> Result<MySqlPool> {
    if config.dialect != Dialect::MySql {
        return Err(Error::Config(format!(
            "Data source {} uses {}, only MySQL/MariaDB connections are supported",
            config.name, config.dialect
        )));
    }
    let pool = MySqlPoolOptions::new()
        .max_connections(config.pool_size)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(&config.url())
        .await?;
    tracing::info!("Connected to {} at {}:{}", config.name, config.host, config.port);
    Ok(pool)
}

fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &ColumnValue,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        ColumnValue::Null => query.bind(None::<String>),
        ColumnValue::Bool(b) => query.bind(*b),
        ColumnValue::Int(i) => query.bind(*i),
        ColumnValue::UInt(u) => query.bind(*u),
        ColumnValue::Float(f) => query.bind(*f),
        ColumnValue::String(s) => query.bind(s.clone()),
        ColumnValue::Bytes(b) => query.bind(b.clone()),
        ColumnValue::Timestamp(t) => query.bind(*t),
    }
}

fn bind_statement(statement: &SqlStatement) -> Query<'_, MySql, MySqlArguments> {
    statement
        .params
        .iter()
        .fold(sqlx::query(&statement.sql), bind_value)
}

/// Decode one column of a MySQL row
fn decode_value(row: &MySqlRow, index: usize) -> Result<ColumnValue> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(ColumnValue::Null);
    }
    let type_name = raw.type_info().name().to_ascii_uppercase();

    let value = match type_name.as_str() {
        "BOOLEAN" => ColumnValue::Bool(row.try_get(index)?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            ColumnValue::Int(row.try_get(index)?)
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => ColumnValue::UInt(row.try_get(index)?),
        "FLOAT" => ColumnValue::Float(row.try_get::<f32, _>(index)? as f64),
        "DOUBLE" => ColumnValue::Float(row.try_get(index)?),
        "DATETIME" | "TIMESTAMP" => ColumnValue::Timestamp(row.try_get(index)?),
        "DATE" => ColumnValue::String(row.try_get::<chrono::NaiveDate, _>(index)?.to_string()),
        "TIME" => ColumnValue::String(row.try_get::<chrono::NaiveTime, _>(index)?.to_string()),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT"
        | "GEOMETRY" => ColumnValue::Bytes(
            row.try_get::<Vec<u8>, _>(index)
                .or_else(|_| row.try_get_unchecked::<Vec<u8>, _>(index))?,
        ),
        // DECIMAL, JSON, ENUM, SET and the text types arrive as text
        _ => ColumnValue::String(
            row.try_get::<String, _>(index)
                .or_else(|_| row.try_get_unchecked::<String, _>(index))?,
        ),
    };
    Ok(value)
}

fn decode_row(row: &MySqlRow) -> Result<SourceRow> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(index, column)| Ok((column.name().to_string(), decode_value(row, index)?)))
        .collect()
}

fn text_at(row: &MySqlRow, index: usize) -> Result<String> {
    match decode_value(row, index)? {
        ColumnValue::String(s) => Ok(s),
        ColumnValue::Bytes(b) => Ok(String::from_utf8_lossy(&b).into_owned()),
        ColumnValue::Null => Ok(String::new()),
        other => Ok(other.to_string()),
    }
}

/// A MIN/MAX bound as i64; NULL means an empty table
fn integer_bound(value: &ColumnValue, table: &TableName, unique_key: &str) -> Result<Option<i64>> {
    match value {
        ColumnValue::Null => Ok(None),
        other => other.as_i64().map(Some).ok_or_else(|| {
            Error::split_by_unique_key(
                &table.table,
                Some(unique_key),
                format!("key bound {} is not a signed 64-bit integer", other),
            )
        }),
    }
}

/// MySQL source for splitting and dumping
pub struct MySqlDataSource {
    name: String,
    pool: MySqlPool,
    builder: PipelineSqlBuilder,
}

impl MySqlDataSource {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        Ok(Self::from_pool(config.name.clone(), connect_pool(config).await?))
    }

    pub fn from_pool(name: impl Into<String>, pool: MySqlPool) -> Self {
        Self {
            name: name.into(),
            pool,
            builder: PipelineSqlBuilder::new(Dialect::MySql),
        }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    fn build_query(&self, query: &DumpQuery) -> Result<SqlStatement> {
        let columns = query.columns.as_deref();
        let unique_key = || {
            query.unique_key.as_deref().ok_or_else(|| {
                Error::Pipeline(format!("Dump query on {} needs a unique key", query.table))
            })
        };
        Ok(match &query.filter {
            DumpFilter::Range {
                lower,
                lower_inclusive,
                upper,
                limit,
            } => self.builder.build_divisible_sql(
                &query.table,
                columns,
                unique_key()?,
                lower.clone().map(|v| (v, *lower_inclusive)),
                upper.clone(),
                *limit,
            ),
            DumpFilter::Point(value) => {
                self.builder
                    .build_point_query_sql(&query.table, columns, unique_key()?, value.clone())
            }
            DumpFilter::All => self.builder.build_fetch_all_sql(&query.table, columns),
        })
    }
}

#[async_trait]
impl PipelineDataSource for MySqlDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    async fn estimated_count(&self, table: &TableName) -> Result<Option<i64>> {
        let Some(statement) = self.builder.build_estimated_count_sql(table) else {
            return Ok(None);
        };
        let row = bind_statement(&statement).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(decode_value(&row, 0)?.as_i64()),
            None => Ok(None),
        }
    }

    async fn exact_count(&self, table: &TableName) -> Result<i64> {
        let statement = self.builder.build_count_sql(table);
        let row = bind_statement(&statement).fetch_one(&self.pool).await?;
        Ok(decode_value(&row, 0)?.as_i64().unwrap_or(0))
    }

    async fn unique_key_range(&self, table: &TableName, unique_key: &str) -> Result<Option<(i64, i64)>> {
        let statement = self.builder.build_unique_key_min_max_sql(table, unique_key);
        let row = bind_statement(&statement).fetch_one(&self.pool).await?;
        let minimum = integer_bound(&decode_value(&row, 0)?, table, unique_key)?;
        let maximum = integer_bound(&decode_value(&row, 1)?, table, unique_key)?;
        Ok(minimum.zip(maximum))
    }

    async fn unique_key_columns(&self, table: &TableName) -> Result<Vec<ColumnMetaData>> {
        let rows = sqlx::query(
            r#"
            SELECT s.INDEX_NAME, s.COLUMN_NAME, c.COLUMN_TYPE
            FROM information_schema.STATISTICS s
            JOIN information_schema.COLUMNS c
              ON c.TABLE_SCHEMA = s.TABLE_SCHEMA
             AND c.TABLE_NAME = s.TABLE_NAME
             AND c.COLUMN_NAME = s.COLUMN_NAME
            WHERE s.TABLE_SCHEMA = COALESCE(?, DATABASE())
              AND s.TABLE_NAME = ?
              AND s.NON_UNIQUE = 0
            ORDER BY s.INDEX_NAME = 'PRIMARY' DESC, s.INDEX_NAME, s.SEQ_IN_INDEX
            "#,
        )
        .bind(table.schema.clone())
        .bind(table.table.clone())
        .fetch_all(&self.pool)
        .await?;

        let mut selected: Option<String> = None;
        let mut columns = Vec::new();
        for row in &rows {
            let index_name = text_at(row, 0)?;
            match &selected {
                Some(name) if *name != index_name => break,
                Some(_) => {}
                None => selected = Some(index_name),
            }
            columns.push(ColumnMetaData::new(text_at(row, 1)?, text_at(row, 2)?));
        }
        tracing::debug!(
            "Unique key of {}: {:?} ({})",
            table,
            columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            selected.unwrap_or_default()
        );
        Ok(columns)
    }

    async fn table_columns(&self, table: &TableName) -> Result<Vec<ColumnMetaData>> {
        let rows = sqlx::query(
            r#"
            SELECT COLUMN_NAME, COLUMN_TYPE
            FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE())
              AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
            "#,
        )
        .bind(table.schema.clone())
        .bind(table.table.clone())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok(ColumnMetaData::new(text_at(row, 0)?, text_at(row, 1)?)))
            .collect()
    }

    async fn fetch(&self, query: &DumpQuery) -> Result<Vec<SourceRow>> {
        let statement = self.build_query(query)?;
        let rows = bind_statement(&statement).fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn stream(&self, query: &DumpQuery, buffer: usize) -> Result<mpsc::Receiver<Result<SourceRow>>> {
        let statement = self.build_query(query)?;
        let pool = self.pool.clone();
        let (tx, rx) = mpsc::channel(buffer.max(1));
        tokio::spawn(async move {
            let mut rows = bind_statement(&statement).fetch(&pool);
            loop {
                let item = match rows.try_next().await {
                    Ok(Some(row)) => decode_row(&row),
                    Ok(None) => break,
                    Err(e) => Err(e.into()),
                };
                let failed = item.is_err();
                // Receiver gone means the dump was cancelled
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn current_log_position(&self) -> Result<Option<IngestPosition>> {
        let row = match sqlx::query("SHOW MASTER STATUS").fetch_optional(&self.pool).await {
            Ok(row) => row,
            Err(e) => {
                tracing::debug!("SHOW MASTER STATUS failed ({}), trying SHOW BINARY LOG STATUS", e);
                sqlx::query("SHOW BINARY LOG STATUS")
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        let Some(row) = row else {
            tracing::warn!("Binary logging is disabled on {}", self.name);
            return Ok(None);
        };
        let file_name = text_at(&row, 0)?;
        let position = decode_value(&row, 1)?
            .as_i64()
            .and_then(|p| u64::try_from(p).ok())
            .ok_or_else(|| Error::InvalidPosition(format!("binlog position of {}", self.name)))?;
        Ok(Some(IngestPosition::Binlog { file_name, position }))
    }
}

/// MySQL target; each batch is applied in one transaction
pub struct MySqlSink {
    pool: MySqlPool,
    builder: PipelineSqlBuilder,
}

impl MySqlSink {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        Ok(Self::from_pool(connect_pool(config).await?))
    }

    pub fn from_pool(pool: MySqlPool) -> Self {
        Self {
            pool,
            builder: PipelineSqlBuilder::new(Dialect::MySql),
        }
    }
}

#[async_trait]
impl PipelineSink for MySqlSink {
    async fn write(&self, records: &[DataRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for record in records {
            let statement = self.builder.build_record_sql(record);
            bind_statement(&statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    Error::QueryExecution(format!(
                        "Failed to apply {:?} on {}: {}",
                        record.operation, record.table, e
                    ))
                })?;
        }
        tx.commit().await?;
        Ok(records.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_bound() {
        let table = TableName::new(None, "t_order_0");
        assert_eq!(integer_bound(&ColumnValue::Null, &table, "order_id").unwrap(), None);
        assert_eq!(integer_bound(&ColumnValue::UInt(7), &table, "order_id").unwrap(), Some(7));
        assert_eq!(integer_bound(&ColumnValue::Int(-3), &table, "order_id").unwrap(), Some(-3));
        assert!(matches!(
            integer_bound(&ColumnValue::UInt(u64::MAX), &table, "order_id"),
            Err(Error::SplitByUniqueKey { .. })
        ));
    }
}
