//! Database schema definitions using sea-query.
//!
//! Fixed column identifiers for history tables and metadata tables, plus the
//! DDL builders for per-node and per-event-type tables. Dynamic table and
//! column names are always sanitized identifiers (see [`super::sanitize`]).

use sea_query::{Alias, ColumnDef, DynIden, Expr, Iden, Index, PostgresQueryBuilder, SeaRc, Table};

use crate::error::Result;
use crate::storage::sanitize::{index_name, quote_literal};

/// Columns of a per-node value table.
#[derive(Iden, Clone, Copy)]
pub enum ValueColumn {
    #[iden = "_id"]
    Id,
    #[iden = "server_timestamp"]
    ServerTimestamp,
    #[iden = "source_timestamp"]
    SourceTimestamp,
    #[iden = "status_code"]
    StatusCode,
    #[iden = "variant_type"]
    VariantType,
    #[iden = "variant_binary"]
    VariantBinary,
}

/// Fixed columns of a per-event-type table. Field columns are added
/// dynamically.
#[derive(Iden, Clone, Copy)]
pub enum EventColumn {
    #[iden = "_id"]
    Id,
    #[iden = "_timestamp"]
    Timestamp,
    #[iden = "_event_type_name"]
    EventTypeName,
}

/// The two shapes of history table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Value,
    Event,
}

impl TableKind {
    /// Column history is ordered and trimmed by.
    pub fn time_column(self) -> DynIden {
        match self {
            TableKind::Value => SeaRc::new(ValueColumn::SourceTimestamp),
            TableKind::Event => SeaRc::new(EventColumn::Timestamp),
        }
    }

    /// Insertion-sequence tie-break column.
    pub fn id_column(self) -> DynIden {
        match self {
            TableKind::Value => SeaRc::new(ValueColumn::Id),
            TableKind::Event => SeaRc::new(EventColumn::Id),
        }
    }
}

/// Node to table mapping with retention policy.
#[derive(Iden)]
pub enum HistorianNodes {
    #[iden = "historian_nodes"]
    Table,
    #[iden = "node_id"]
    NodeId,
    #[iden = "table_name"]
    TableName,
    #[iden = "retention_period_ms"]
    RetentionPeriodMs,
    #[iden = "retention_count"]
    RetentionCount,
    #[iden = "created_at"]
    CreatedAt,
}

/// Event type to table mapping, known fields and retention policy.
#[derive(Iden)]
pub enum HistorianEventTypes {
    #[iden = "historian_event_types"]
    Table,
    #[iden = "event_type"]
    EventType,
    #[iden = "table_name"]
    TableName,
    /// JSONB object of field name to column name.
    #[iden = "fields"]
    Fields,
    #[iden = "retention_period_ms"]
    RetentionPeriodMs,
    #[iden = "retention_count"]
    RetentionCount,
    #[iden = "created_at"]
    CreatedAt,
}

/// Applied migration versions.
#[derive(Iden)]
pub enum SchemaVersion {
    #[iden = "historian_schema_version"]
    Table,
    #[iden = "version"]
    Version,
    #[iden = "description"]
    Description,
    #[iden = "applied_at"]
    AppliedAt,
}

/// Statements creating a value table and its read index.
///
/// `_id` is a plain identity column rather than a primary key so the table
/// can be converted to a hypertable partitioned on the source timestamp.
pub fn create_value_table(table: &str) -> Result<Vec<String>> {
    let create = Table::create()
        .table(Alias::new(table))
        .if_not_exists()
        .col(
            ColumnDef::new(ValueColumn::Id)
                .big_integer()
                .not_null()
                .auto_increment(),
        )
        .col(
            ColumnDef::new(ValueColumn::ServerTimestamp)
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .col(
            ColumnDef::new(ValueColumn::SourceTimestamp)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(
            ColumnDef::new(ValueColumn::StatusCode)
                .big_integer()
                .not_null()
                .default(0),
        )
        .col(ColumnDef::new(ValueColumn::VariantType).text().not_null())
        .col(ColumnDef::new(ValueColumn::VariantBinary).binary().not_null())
        .to_string(PostgresQueryBuilder);

    let index = Index::create()
        .if_not_exists()
        .name(index_name(table, "source_timestamp")?)
        .table(Alias::new(table))
        .col(ValueColumn::SourceTimestamp)
        .col(ValueColumn::Id)
        .to_string(PostgresQueryBuilder);

    Ok(vec![create, index])
}

/// Statements creating an event table (fixed columns only) and its index.
pub fn create_event_table(table: &str) -> Result<Vec<String>> {
    let create = Table::create()
        .table(Alias::new(table))
        .if_not_exists()
        .col(
            ColumnDef::new(EventColumn::Id)
                .big_integer()
                .not_null()
                .auto_increment(),
        )
        .col(
            ColumnDef::new(EventColumn::Timestamp)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(ColumnDef::new(EventColumn::EventTypeName).text().not_null())
        .to_string(PostgresQueryBuilder);

    let index = Index::create()
        .if_not_exists()
        .name(index_name(table, "timestamp")?)
        .table(Alias::new(table))
        .col(EventColumn::Timestamp)
        .col(EventColumn::Id)
        .to_string(PostgresQueryBuilder);

    Ok(vec![create, index])
}

/// Add a nullable field column. Field values are stored codec-encoded, so
/// every field column is binary.
pub fn add_field_column(table: &str, column: &str) -> String {
    Table::alter()
        .table(Alias::new(table))
        .add_column_if_not_exists(ColumnDef::new(Alias::new(column)).binary().null())
        .to_string(PostgresQueryBuilder)
}

/// Convert a freshly created table into a TimescaleDB hypertable.
pub fn create_hypertable(table: &str, time_column: &str) -> String {
    format!(
        "SELECT create_hypertable({}, {}, if_not_exists => TRUE, migrate_data => TRUE)",
        quote_literal(table),
        quote_literal(time_column)
    )
}

/// Drop a history table.
pub fn drop_table(table: &str) -> String {
    Table::drop()
        .table(Alias::new(table))
        .if_exists()
        .to_string(PostgresQueryBuilder)
}

/// Empty a history table.
pub fn truncate_table(table: &str) -> String {
    Table::truncate()
        .table(Alias::new(table))
        .to_string(PostgresQueryBuilder)
}
