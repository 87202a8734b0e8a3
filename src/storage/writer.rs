//! History writer: value and event inserts.
//!
//! Event inserts sort fields by name before generating SQL, so the column
//! list and the placeholder list always line up whatever the iteration order
//! of the caller's map. The two fixed leading columns take `$1` and `$2`,
//! the first sorted field `$3`, and so on without gaps.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_query::{Alias, DynIden, PostgresQueryBuilder, Query, SeaRc, SimpleExpr};
use sea_query_binder::{SqlxBinder, SqlxValues};
use tracing::{debug, warn};

use crate::codec::{self, Variant};
use crate::error::{HistoryError, Result};
use crate::storage::pool::ConnectionPool;
use crate::storage::registry::{EventTypeDescriptor, HistorizedNode, SchemaRegistry};
use crate::storage::retention::{RetentionEnforcer, RetentionPolicy};
use crate::storage::schema::{EventColumn, TableKind, ValueColumn};

/// Rows per multi-row insert statement.
const INSERT_CHUNK: usize = 1000;

/// One value sample of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueRecord {
    pub source_timestamp: DateTime<Utc>,
    /// Defaults to the write time when absent.
    pub server_timestamp: Option<DateTime<Utc>>,
    pub status_code: u32,
    pub value: Variant,
}

impl ValueRecord {
    /// A good-status sample.
    pub fn new(source_timestamp: DateTime<Utc>, value: Variant) -> Self {
        Self {
            source_timestamp,
            server_timestamp: None,
            status_code: 0,
            value,
        }
    }

    pub fn with_status(mut self, status_code: u32) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn with_server_timestamp(mut self, server_timestamp: DateTime<Utc>) -> Self {
        self.server_timestamp = Some(server_timestamp);
        self
    }
}

/// Insert statement for a batch of value records.
pub fn build_value_insert(table: &str, records: &[ValueRecord]) -> Result<(String, SqlxValues)> {
    let now = Utc::now();
    let mut insert = Query::insert();
    insert.into_table(Alias::new(table)).columns([
        ValueColumn::ServerTimestamp,
        ValueColumn::SourceTimestamp,
        ValueColumn::StatusCode,
        ValueColumn::VariantType,
        ValueColumn::VariantBinary,
    ]);
    for record in records {
        insert.values_panic([
            record.server_timestamp.unwrap_or(now).into(),
            record.source_timestamp.into(),
            i64::from(record.status_code).into(),
            record.value.type_tag().to_string().into(),
            codec::encode(&record.value)?.into(),
        ]);
    }
    Ok(insert.build_sqlx(PostgresQueryBuilder))
}

/// Insert statement for one event.
///
/// Every field must already have a column in `desc`.
pub fn build_event_insert(
    desc: &EventTypeDescriptor,
    fields: &HashMap<String, Variant>,
    timestamp: DateTime<Utc>,
) -> Result<(String, SqlxValues)> {
    let mut sorted: Vec<(&String, &Variant)> = fields.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut columns: Vec<DynIden> = Vec::with_capacity(2 + sorted.len());
    columns.push(SeaRc::new(EventColumn::Timestamp));
    columns.push(SeaRc::new(EventColumn::EventTypeName));
    let mut values: Vec<SimpleExpr> = Vec::with_capacity(2 + sorted.len());
    values.push(timestamp.into());
    values.push(desc.event_type.as_str().into());

    for (field, value) in sorted {
        let column = desc.column(field).ok_or_else(|| {
            HistoryError::Validation(format!(
                "event type {:?} has no column for field {field:?}",
                desc.event_type
            ))
        })?;
        columns.push(SeaRc::new(Alias::new(column)));
        values.push(codec::encode(value)?.into());
    }

    Ok(Query::insert()
        .into_table(Alias::new(&desc.table_name))
        .columns(columns)
        .values_panic(values)
        .build_sqlx(PostgresQueryBuilder))
}

/// Appends value and event records.
pub struct HistoryWriter {
    pool: ConnectionPool,
    registry: Arc<SchemaRegistry>,
    retention: RetentionEnforcer,
    enforce_on_write: bool,
}

impl HistoryWriter {
    pub fn new(pool: ConnectionPool, registry: Arc<SchemaRegistry>, enforce_on_write: bool) -> Self {
        Self {
            retention: RetentionEnforcer::new(pool.clone()),
            pool,
            registry,
            enforce_on_write,
        }
    }

    /// Append one value to the node's table.
    pub async fn save_value(&self, node: &HistorizedNode, record: &ValueRecord) -> Result<()> {
        self.save_values(node, std::slice::from_ref(record)).await
    }

    /// Append a batch of values; retention runs once after the batch.
    ///
    /// Every chunk is inserted in one transaction, so a failed batch leaves
    /// no rows behind. A value that cannot be encoded fails the batch before
    /// anything is sent.
    pub async fn save_values(&self, node: &HistorizedNode, records: &[ValueRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let statements = records
            .chunks(INSERT_CHUNK)
            .map(|chunk| build_value_insert(&node.table_name, chunk))
            .collect::<Result<Vec<_>>>()?;
        let table = self.registry.ensure_value_table(node).await?;
        let statements = &statements;
        self.pool
            .with_connection(|mut conn| async move {
                use sqlx::Acquire;
                let mut tx = conn.begin().await?;
                for (sql, values) in statements {
                    sqlx::query_with(sql, values.clone())
                        .execute(&mut *tx)
                        .await?;
                }
                tx.commit().await?;
                Ok(())
            })
            .await?;
        debug!(node_id = %node.node_id, count = records.len(), "Values saved");

        self.after_write(&table, TableKind::Value, &node.retention)
            .await;
        Ok(())
    }

    /// Append one event, growing the event table's columns as needed.
    pub async fn save_event(
        &self,
        event_type: &str,
        fields: &HashMap<String, Variant>,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let desc = self
            .registry
            .ensure_event_table(event_type, fields.keys().map(String::as_str))
            .await?;
        let (sql, values) = build_event_insert(&desc, fields, timestamp)?;
        self.execute(&sql, &values).await?;
        debug!(event_type = %event_type, fields = fields.len(), "Event saved");

        self.after_write(&desc.table_name, TableKind::Event, &desc.retention)
            .await;
        Ok(())
    }

    async fn execute(&self, sql: &str, values: &SqlxValues) -> Result<()> {
        self.pool
            .with_connection(|mut conn| async move {
                sqlx::query_with(sql, values.clone())
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
            .await
    }

    /// The write already committed; a retention failure is only logged and
    /// retried on the next write or sweep.
    async fn after_write(&self, table: &str, kind: TableKind, policy: &RetentionPolicy) {
        if !self.enforce_on_write || policy.is_unbounded() {
            return;
        }
        if let Err(err) = self.retention.enforce(table, kind, policy).await {
            warn!(table = %table, error = %err, "Retention after write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecError, VariantType};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn descriptor() -> EventTypeDescriptor {
        let fields: BTreeMap<String, String> = [
            ("Field1", "f_field1_aaaaaaaaaaaa"),
            ("Field2", "f_field2_bbbbbbbbbbbb"),
            ("Message", "f_message_cccccccccccc"),
        ]
        .into_iter()
        .map(|(f, c)| (f.to_string(), c.to_string()))
        .collect();
        EventTypeDescriptor {
            event_type: "Alarm".into(),
            table_name: "e_alarm_0123456789ab".into(),
            fields,
            retention: RetentionPolicy::unbounded(),
        }
    }

    fn placeholders(sql: &str) -> Vec<usize> {
        let mut found = Vec::new();
        let bytes = sql.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'$' {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if end > start {
                    found.push(sql[start..end].parse().unwrap());
                }
                i = end;
            } else {
                i += 1;
            }
        }
        found
    }

    #[test]
    fn test_event_insert_sorts_fields_and_numbers_placeholders() {
        let mut fields = HashMap::new();
        fields.insert("Field2".to_string(), Variant::Int32(2));
        fields.insert("Field1".to_string(), Variant::String("one".into()));
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let (sql, values) = build_event_insert(&descriptor(), &fields, ts).unwrap();

        let f1 = sql.find("f_field1_aaaaaaaaaaaa").unwrap();
        let f2 = sql.find("f_field2_bbbbbbbbbbbb").unwrap();
        assert!(f1 < f2, "columns not sorted: {sql}");
        assert!(sql.contains("(\"_timestamp\", \"_event_type_name\", \"f_field1_aaaaaaaaaaaa\", \"f_field2_bbbbbbbbbbbb\")"));

        assert_eq!(placeholders(&sql), vec![1, 2, 3, 4]);
        assert_eq!(values.0 .0.len(), 2 + fields.len());
    }

    #[test]
    fn test_event_insert_is_independent_of_map_order() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut a = HashMap::new();
        let mut b = HashMap::new();
        for (k, v) in [("Message", 1), ("Field2", 2), ("Field1", 3)] {
            a.insert(k.to_string(), Variant::Int32(v));
        }
        for (k, v) in [("Field1", 3), ("Message", 1), ("Field2", 2)] {
            b.insert(k.to_string(), Variant::Int32(v));
        }
        let (sql_a, values_a) = build_event_insert(&descriptor(), &a, ts).unwrap();
        let (sql_b, values_b) = build_event_insert(&descriptor(), &b, ts).unwrap();
        assert_eq!(sql_a, sql_b);
        assert_eq!(values_a.0 .0, values_b.0 .0);
        assert_eq!(placeholders(&sql_a), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_event_insert_without_fields() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let (sql, values) = build_event_insert(&descriptor(), &HashMap::new(), ts).unwrap();
        assert_eq!(placeholders(&sql), vec![1, 2]);
        assert_eq!(values.0 .0.len(), 2);
    }

    #[test]
    fn test_event_insert_rejects_unknown_field() {
        let mut fields = HashMap::new();
        fields.insert("Nope".to_string(), Variant::Null);
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            build_event_insert(&descriptor(), &fields, ts),
            Err(HistoryError::Validation(_))
        ));
    }

    #[test]
    fn test_value_insert_batches_rows() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let records = vec![
            ValueRecord::new(ts, Variant::Double(1.5)),
            ValueRecord::new(ts, Variant::Double(f64::NAN)).with_status(0x8000_0000),
        ];
        let (sql, values) = build_value_insert("n_x_0123456789ab", &records).unwrap();
        assert!(sql.starts_with("INSERT INTO \"n_x_0123456789ab\""));
        assert_eq!(placeholders(&sql), (1..=10).collect::<Vec<_>>());
        assert_eq!(values.0 .0.len(), 10);
    }

    #[test]
    fn test_unencodable_values_rejected_before_insert() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bad = Variant::Array {
            element: VariantType::Int32,
            items: vec![Variant::Double(1.5)],
        };
        let records = vec![
            ValueRecord::new(ts, Variant::Int32(1)),
            ValueRecord::new(ts, bad.clone()),
        ];
        assert!(matches!(
            build_value_insert("n_x_0123456789ab", &records),
            Err(HistoryError::Codec(CodecError::MixedArray { .. }))
        ));

        let mut fields = HashMap::new();
        fields.insert("Field1".to_string(), bad);
        assert!(matches!(
            build_event_insert(&descriptor(), &fields, ts),
            Err(HistoryError::Codec(_))
        ));
    }
}
