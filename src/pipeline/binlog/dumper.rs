//! Binlog Incremental Dumper
//!
//! Streams row events of the migrated tables from the source's binary log
//! and turns each committed transaction into one batch of change records.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::client::BinlogClient;
use super::event::{to_unsigned, BinlogDecoder, BinlogEvent, RowChange, RowImage, RowsEvent, RowsKind, TableMapEvent};
use crate::config::{DatabaseConfig, TableMappingConfig};
use crate::error::{Error, Result};
use crate::pipeline::channel::ChannelSender;
use crate::pipeline::incremental::IncrementalDumper;
use crate::pipeline::position::IngestPosition;
use crate::pipeline::record::{Column, ColumnValue, DataRecord, Operation, Record};
use crate::pipeline::source::PipelineDataSource;
use crate::pipeline::sql::TableName;

/// Session setup sent before registering; lets the server send checksummed
/// events and MariaDB send row events
const SESSION_SETUP: [&str; 3] = [
    "SET @master_binlog_checksum = @@global.binlog_checksum",
    "SET @source_binlog_checksum = @@global.binlog_checksum",
    "SET @mariadb_slave_capability = 4",
];

/// Incremental dumper reading the source's binary log as a replica
pub struct MySqlIncrementalDumper {
    config: DatabaseConfig,
    server_id: u32,
    source: Arc<dyn PipelineDataSource>,
    tables: Vec<TableMappingConfig>,
}

impl MySqlIncrementalDumper {
    /// `source` describes table columns; `server_id` must be unique among
    /// the source's replicas
    pub fn new(
        config: DatabaseConfig,
        server_id: u32,
        source: Arc<dyn PipelineDataSource>,
        tables: Vec<TableMappingConfig>,
    ) -> Self {
        Self {
            config,
            server_id,
            source,
            tables,
        }
    }
}

#[async_trait]
impl IncrementalDumper for MySqlIncrementalDumper {
    async fn dump(&self, from: IngestPosition, channel: ChannelSender, cancel: CancellationToken) -> Result<()> {
        let IngestPosition::Binlog { file_name, position } = &from else {
            return Err(Error::InvalidPosition(format!(
                "binlog dumper of {} cannot start from {}",
                self.config.name, from
            )));
        };

        let mut client = BinlogClient::connect(&self.config).await?;
        for statement in SESSION_SETUP {
            client.execute(statement).await?;
        }
        client.register_replica(self.server_id).await?;
        client.start_dump(self.server_id, file_name, *position).await?;
        tracing::info!(
            "Streaming binlog of {} ({}) from {} as server_id {}",
            self.config.name,
            client.server_version(),
            from,
            self.server_id
        );

        let mut collector = ChangeCollector::new(
            self.source.as_ref(),
            &self.tables,
            self.config.database.as_deref(),
            file_name.clone(),
            *position,
        );
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                event = client.next_event() => event?,
            };
            let Some(event) = event else {
                return Err(Error::Network(format!(
                    "{} ended the binlog stream at {}",
                    self.config.name,
                    collector.committed()
                )));
            };

            let records = collector.collect(&event).await?;
            if records.is_empty() {
                continue;
            }
            let pushed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                pushed = channel.push(records) => pushed,
            };
            match pushed {
                Err(_) if cancel.is_cancelled() => return Err(Error::Cancelled),
                other => other?,
            }
        }
    }
}

/// A binlog column resolved against the table definition
#[derive(Debug, Clone)]
struct MappedColumn {
    name: String,
    type_code: u8,
    unsigned: bool,
    unique_key: bool,
}

/// A migrated table as announced by a table map event
#[derive(Debug)]
struct MappedTable {
    schema: String,
    table: String,
    logical: String,
    columns: Vec<MappedColumn>,
}

impl MappedTable {
    fn matches(&self, map: &TableMapEvent) -> bool {
        self.schema == map.schema && self.table == map.table && self.columns.len() == map.column_types.len()
    }

    fn key_changed(&self, before: &RowImage, after: &RowImage) -> bool {
        self.columns.iter().enumerate().any(|(index, column)| {
            column.unique_key
                && matches!(
                    (before.get(index), after.get(index)),
                    (Some(Some(old)), Some(Some(new))) if old != new
                )
        })
    }

    fn record(&self, operation: Operation, image: &RowImage) -> DataRecord {
        let mut record = DataRecord::new(operation, self.logical.clone(), IngestPosition::Placeholder);
        for (column, value) in self.columns.iter().zip(image) {
            let Some(value) = value else { continue };
            let value = match value {
                ColumnValue::Int(v) if column.unsigned => ColumnValue::UInt(to_unsigned(column.type_code, *v)),
                other => other.clone(),
            };
            record.add_column(Column::new(column.name.clone(), value, column.unique_key));
        }
        record
    }
}

/// Decodes events and buffers the changes of the open transaction
struct ChangeCollector<'a> {
    source: &'a dyn PipelineDataSource,
    tables: &'a [TableMappingConfig],
    default_schema: Option<&'a str>,
    decoder: BinlogDecoder,
    file_name: String,
    /// Where the open transaction can be replayed from
    committed: IngestPosition,
    pending: Vec<DataRecord>,
    /// None marks a table that is not migrated
    mapped: HashMap<u64, Option<Arc<MappedTable>>>,
}

impl<'a> ChangeCollector<'a> {
    fn new(
        source: &'a dyn PipelineDataSource,
        tables: &'a [TableMappingConfig],
        default_schema: Option<&'a str>,
        file_name: String,
        position: u64,
    ) -> Self {
        Self {
            source,
            tables,
            default_schema,
            decoder: BinlogDecoder::new(),
            committed: IngestPosition::Binlog {
                file_name: file_name.clone(),
                position,
            },
            file_name,
            pending: Vec::new(),
            mapped: HashMap::new(),
        }
    }

    fn committed(&self) -> &IngestPosition {
        &self.committed
    }

    /// Decode one event; returns the records of a transaction once it commits
    async fn collect(&mut self, data: &[u8]) -> Result<Vec<Record>> {
        let (header, event) = self.decoder.decode(data)?;
        match event {
            BinlogEvent::Rotate { next_file, position } => {
                if next_file != self.file_name {
                    tracing::info!("Binlog rotated to {}:{}", next_file, position);
                }
                self.committed = IngestPosition::Binlog {
                    file_name: next_file.clone(),
                    position,
                };
                self.file_name = next_file;
            }
            BinlogEvent::FormatDescription { server_version, checksum } => {
                tracing::debug!("Binlog format from {} (checksum: {})", server_version, checksum);
            }
            BinlogEvent::TableMap(map) => self.map_table(&map).await?,
            BinlogEvent::Rows(rows) => self.buffer_rows(rows),
            BinlogEvent::Xid { xid } => {
                tracing::trace!("Transaction committed: XID {}", xid);
                return Ok(self.commit(header.next_position));
            }
            BinlogEvent::Query { schema, query } => {
                let statement = query.trim();
                if statement.eq_ignore_ascii_case("COMMIT") {
                    return Ok(self.commit(header.next_position));
                }
                if !statement.eq_ignore_ascii_case("BEGIN") {
                    // Table definitions may have changed
                    self.mapped.clear();
                    tracing::debug!(
                        "Skipping statement in [{}]: {}",
                        schema,
                        statement.chars().take(100).collect::<String>()
                    );
                }
            }
            BinlogEvent::Other { type_code } => tracing::trace!("Ignoring binlog event type {}", type_code),
            BinlogEvent::Heartbeat => {}
        }
        Ok(Vec::new())
    }

    fn mapping(&self, map: &TableMapEvent) -> Option<&'a TableMappingConfig> {
        let default_schema = self.default_schema;
        self.tables.iter().find(|mapping| {
            mapping.actual.eq_ignore_ascii_case(&map.table)
                && mapping
                    .schema
                    .as_deref()
                    .or(default_schema)
                    .map_or(true, |schema| schema.eq_ignore_ascii_case(&map.schema))
        })
    }

    async fn map_table(&mut self, map: &TableMapEvent) -> Result<()> {
        if let Some(Some(mapped)) = self.mapped.get(&map.table_id) {
            if mapped.matches(map) {
                return Ok(());
            }
        }
        let Some(mapping) = self.mapping(map) else {
            self.mapped.insert(map.table_id, None);
            return Ok(());
        };

        let table = TableName::new(Some(&map.schema), map.table.clone());
        let columns = self.source.table_columns(&table).await?;
        if columns.len() != map.column_types.len() {
            return Err(Error::Pipeline(format!(
                "{} has {} columns but its binlog rows have {}",
                table,
                columns.len(),
                map.column_types.len()
            )));
        }
        let unique_key = self.source.unique_key_columns(&table).await?;
        let columns = columns
            .into_iter()
            .zip(&map.column_types)
            .map(|(column, type_code)| MappedColumn {
                unique_key: unique_key.iter().any(|key| key.name.eq_ignore_ascii_case(&column.name)),
                unsigned: column.data_type.to_ascii_lowercase().contains("unsigned"),
                type_code: *type_code,
                name: column.name,
            })
            .collect();
        tracing::debug!("Table id {} maps {} to {}", map.table_id, table, mapping.logical);
        self.mapped.insert(
            map.table_id,
            Some(Arc::new(MappedTable {
                schema: map.schema.clone(),
                table: map.table.clone(),
                logical: mapping.logical.clone(),
                columns,
            })),
        );
        Ok(())
    }

    fn buffer_rows(&mut self, rows: RowsEvent) {
        let Some(Some(table)) = self.mapped.get(&rows.table_id).cloned() else {
            return;
        };
        for RowChange { before, after } in rows.rows {
            match (rows.kind, before, after) {
                (RowsKind::Write, _, Some(after)) => self.pending.push(table.record(Operation::Insert, &after)),
                (RowsKind::Delete, Some(before), _) => self.pending.push(table.record(Operation::Delete, &before)),
                (RowsKind::Update, Some(before), Some(mut after)) => {
                    if table.key_changed(&before, &after) {
                        self.pending.push(table.record(Operation::Delete, &before));
                        self.pending.push(table.record(Operation::Insert, &after));
                        continue;
                    }
                    // Minimal row images leave the key out of the after image
                    for (index, column) in table.columns.iter().enumerate() {
                        if column.unique_key && matches!(after.get(index), Some(None)) {
                            after[index] = before.get(index).cloned().flatten();
                        }
                    }
                    self.pending.push(table.record(Operation::Update, &after));
                }
                (kind, _, _) => tracing::warn!("Skipping {:?} row without its image on {}", kind, table.logical),
            }
        }
    }

    /// Close the open transaction at the event ending at `next_position`.
    ///
    /// Every record but the last replays from the transaction start, so a
    /// batch cut short is applied again in full on resume.
    fn commit(&mut self, next_position: u32) -> Vec<Record> {
        let committed = IngestPosition::Binlog {
            file_name: self.file_name.clone(),
            position: next_position as u64,
        };
        let records = std::mem::take(&mut self.pending);
        let last = records.len().saturating_sub(1);
        let batch = records
            .into_iter()
            .enumerate()
            .map(|(index, mut record)| {
                record.position = if index == last {
                    committed.clone()
                } else {
                    self.committed.clone()
                };
                Record::Data(record)
            })
            .collect();
        self.committed = committed;
        batch
    }
}
