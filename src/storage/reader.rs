//! History reader: bounded, paginated range reads.
//!
//! Rows are ordered by `(timestamp, table, _id)`, ascending or descending.
//! Each page fetches one row more than it returns; the extra row only tells
//! whether a continuation is needed. Event reads over several event types
//! query every table concurrently and merge the per-table slices.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::try_join_all;
use sea_query::{Alias, Cond, Expr, Order, PostgresQueryBuilder, Query, SelectStatement};
use sea_query_binder::SqlxBinder;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::debug;

use crate::codec::{self, CodecError, Variant};
use crate::error::{HistoryError, Result};
use crate::storage::continuation::{Continuation, Direction};
use crate::storage::pool::ConnectionPool;
use crate::storage::registry::{EventTypeDescriptor, HistorizedNode, SchemaRegistry};
use crate::storage::schema::{EventColumn, TableKind, ValueColumn};

const UNDEFINED_TABLE: &str = "42P01";

/// Largest page a single read may return.
pub const MAX_PAGE_SIZE: usize = 1_000_000;

/// Earliest representable source timestamp (1601-01-01, the OPC UA epoch).
pub fn min_timestamp() -> DateTime<Utc> {
    DateTime::from_timestamp(-11_644_473_600, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

/// A read request as the caller expresses it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadRequest {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// `None` or `Some(0)` means "as many as allowed".
    pub max_count: Option<usize>,
    /// Token from a previous page.
    pub continuation: Option<String>,
}

impl ReadRequest {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self {
            start,
            end,
            ..Default::default()
        }
    }

    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = Some(max_count);
        self
    }

    pub fn with_continuation(mut self, token: impl Into<String>) -> Self {
        self.continuation = Some(token.into());
        self
    }
}

/// Normalized inclusive range, direction and page size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBounds {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub direction: Direction,
    pub limit: usize,
}

impl ReadBounds {
    /// Resolve defaults:
    /// - no start: read newest first from the end of the range
    /// - no end: now plus one day
    /// - start after end: swap and read newest first
    /// - page size capped by `cap`
    pub fn resolve(request: &ReadRequest, cap: usize, now: DateTime<Utc>) -> Self {
        let mut direction = Direction::Forward;
        let from = match request.start {
            Some(start) => start,
            None => {
                direction = Direction::Backward;
                min_timestamp()
            }
        };
        let to = request.end.unwrap_or(now + ChronoDuration::days(1));
        let (from, to) = if from > to {
            direction = Direction::Backward;
            (to, from)
        } else {
            (from, to)
        };
        let cap = cap.clamp(1, MAX_PAGE_SIZE);
        let limit = match request.max_count {
            None | Some(0) => cap,
            Some(n) => n.min(cap),
        };
        Self {
            from,
            to,
            direction,
            limit,
        }
    }
}

/// One page of results.
#[derive(Debug, Clone)]
pub struct HistoryPage<T> {
    pub records: Vec<T>,
    /// Present iff more rows satisfy the request.
    pub continuation: Option<String>,
}

impl<T> HistoryPage<T> {
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            continuation: None,
        }
    }
}

/// A stored value sample.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredValue {
    /// Insertion sequence; breaks timestamp ties.
    pub sequence: i64,
    pub source_timestamp: DateTime<Utc>,
    pub server_timestamp: DateTime<Utc>,
    pub status_code: u32,
    /// Undecodable rows surface here instead of failing the whole read.
    pub value: std::result::Result<Variant, CodecError>,
}

/// A stored event.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub sequence: i64,
    /// Requested fields; fields absent from the row read as `Null`.
    pub fields: BTreeMap<String, std::result::Result<Variant, CodecError>>,
}

/// Reads value and event history.
pub struct HistoryReader {
    pool: ConnectionPool,
    registry: Arc<SchemaRegistry>,
    max_response_size: usize,
}

impl HistoryReader {
    pub fn new(pool: ConnectionPool, registry: Arc<SchemaRegistry>, max_response_size: usize) -> Self {
        Self {
            pool,
            registry,
            max_response_size,
        }
    }

    pub fn bounds(&self, request: &ReadRequest) -> ReadBounds {
        ReadBounds::resolve(request, self.max_response_size, Utc::now())
    }

    /// Read one page of a node's values.
    pub async fn read_values(
        &self,
        node: &HistorizedNode,
        request: &ReadRequest,
    ) -> Result<HistoryPage<StoredValue>> {
        let bounds = self.bounds(request);
        let cursor = decode_cursor(request, &bounds)?;
        if let Some(cursor) = &cursor {
            if cursor.table != node.table_name {
                return Err(HistoryError::Validation(
                    "continuation token belongs to another node".into(),
                ));
            }
        }

        let mut select = Query::select();
        select
            .columns([
                ValueColumn::Id,
                ValueColumn::ServerTimestamp,
                ValueColumn::SourceTimestamp,
                ValueColumn::StatusCode,
                ValueColumn::VariantType,
                ValueColumn::VariantBinary,
            ])
            .from(Alias::new(&node.table_name));
        apply_range(&mut select, TableKind::Value, &node.table_name, &bounds, cursor.as_ref());
        let (sql, values) = select.build_sqlx(PostgresQueryBuilder);

        let rows = self.fetch(&sql, values).await?;
        let mut records = rows
            .iter()
            .map(value_from_row)
            .collect::<Result<Vec<_>>>()?;

        let continuation = if records.len() > bounds.limit {
            records.truncate(bounds.limit);
            records.last().map(|last| {
                Continuation::new(
                    bounds.direction,
                    last.source_timestamp,
                    node.table_name.as_str(),
                    last.sequence,
                )
                .encode()
            })
        } else {
            None
        };
        debug!(node_id = %node.node_id, returned = records.len(), more = continuation.is_some(), "Values read");
        Ok(HistoryPage {
            records,
            continuation,
        })
    }

    /// Read one page of events.
    ///
    /// `event_types` restricts the read to those types (all when `None`);
    /// `select` restricts the returned fields (all known fields when `None`).
    pub async fn read_events(
        &self,
        event_types: Option<&[&str]>,
        select: Option<&[&str]>,
        request: &ReadRequest,
    ) -> Result<HistoryPage<StoredEvent>> {
        let bounds = self.bounds(request);
        let cursor = decode_cursor(request, &bounds)?;

        let descriptors = match event_types {
            None => self.registry.event_types().await?,
            Some(names) => {
                let mut found = Vec::with_capacity(names.len());
                for name in names {
                    if let Some(desc) = self.registry.event_type(name).await? {
                        found.push(desc);
                    }
                }
                found
            }
        };
        if descriptors.is_empty() {
            return Ok(HistoryPage::empty());
        }

        let slices = try_join_all(
            descriptors
                .iter()
                .map(|desc| self.read_event_table(desc, select, &bounds, cursor.as_ref())),
        )
        .await?;

        let mut merged: Vec<(String, StoredEvent)> = slices.into_iter().flatten().collect();
        merged.sort_by(|a, b| {
            let ord = event_key(a).cmp(&event_key(b));
            match bounds.direction {
                Direction::Forward => ord,
                Direction::Backward => ord.reverse(),
            }
        });

        let continuation = if merged.len() > bounds.limit {
            merged.truncate(bounds.limit);
            merged.last().map(|(table, last)| {
                Continuation::new(bounds.direction, last.timestamp, table.as_str(), last.sequence)
                    .encode()
            })
        } else {
            None
        };
        let records: Vec<StoredEvent> = merged.into_iter().map(|(_, event)| event).collect();
        debug!(tables = descriptors.len(), returned = records.len(), more = continuation.is_some(), "Events read");
        Ok(HistoryPage {
            records,
            continuation,
        })
    }

    async fn read_event_table(
        &self,
        desc: &EventTypeDescriptor,
        select: Option<&[&str]>,
        bounds: &ReadBounds,
        cursor: Option<&Continuation>,
    ) -> Result<Vec<(String, StoredEvent)>> {
        let wanted: Vec<(&str, Option<&str>)> = match select {
            Some(fields) => fields.iter().map(|f| (*f, desc.column(f))).collect(),
            None => desc.sorted_columns().map(|(f, c)| (f, Some(c))).collect(),
        };

        let mut query = Query::select();
        query
            .columns([EventColumn::Id, EventColumn::Timestamp, EventColumn::EventTypeName])
            .from(Alias::new(&desc.table_name));
        for (_, column) in &wanted {
            if let Some(column) = column {
                query.column(Alias::new(*column));
            }
        }
        apply_range(&mut query, TableKind::Event, &desc.table_name, bounds, cursor);
        let (sql, values) = query.build_sqlx(PostgresQueryBuilder);

        let rows = self.fetch(&sql, values).await?;
        rows.iter()
            .map(|row| -> Result<(String, StoredEvent)> {
                let mut fields = BTreeMap::new();
                for (field, column) in &wanted {
                    let value = match column {
                        Some(column) => match row.try_get::<Option<Vec<u8>>, _>(*column)? {
                            Some(bytes) => codec::decode_tagged(&bytes),
                            None => Ok(Variant::Null),
                        },
                        None => Ok(Variant::Null),
                    };
                    fields.insert(field.to_string(), value);
                }
                Ok((
                    desc.table_name.clone(),
                    StoredEvent {
                        event_type: row.try_get("_event_type_name")?,
                        timestamp: row.try_get("_timestamp")?,
                        sequence: row.try_get("_id")?,
                        fields,
                    },
                ))
            })
            .collect()
    }

    /// Run a select; a table that does not exist yet has no rows.
    async fn fetch(&self, sql: &str, values: sea_query_binder::SqlxValues) -> Result<Vec<PgRow>> {
        let values = &values;
        let result = self
            .pool
            .with_connection(|mut conn| async move {
                Ok(sqlx::query_with(sql, values.clone())
                    .fetch_all(&mut *conn)
                    .await?)
            })
            .await;
        match result {
            Err(err) if err.sqlstate().as_deref() == Some(UNDEFINED_TABLE) => Ok(Vec::new()),
            other => other,
        }
    }
}

fn decode_cursor(request: &ReadRequest, bounds: &ReadBounds) -> Result<Option<Continuation>> {
    let Some(token) = &request.continuation else {
        return Ok(None);
    };
    let cursor = Continuation::decode(token)?;
    if cursor.direction != bounds.direction {
        return Err(HistoryError::Validation(
            "continuation token direction does not match the request".into(),
        ));
    }
    Ok(Some(cursor))
}

/// Range filter, resume predicate, ordering and `limit + 1`.
///
/// The resume predicate encodes "key strictly past the cursor" for the key
/// `(timestamp, table, _id)`; the table component is constant per query so
/// it reduces to a comparison against the cursor's table name.
fn apply_range(
    select: &mut SelectStatement,
    kind: TableKind,
    table: &str,
    bounds: &ReadBounds,
    cursor: Option<&Continuation>,
) {
    let ts = kind.time_column();
    let id = kind.id_column();
    select
        .and_where(Expr::col(ts.clone()).gte(bounds.from))
        .and_where(Expr::col(ts.clone()).lte(bounds.to));

    if let Some(cursor) = cursor {
        let forward = bounds.direction == Direction::Forward;
        let past_ts = if forward {
            Expr::col(ts.clone()).gt(cursor.timestamp)
        } else {
            Expr::col(ts.clone()).lt(cursor.timestamp)
        };
        let same_ts = Expr::col(ts.clone()).eq(cursor.timestamp);
        let cond = match (table.cmp(cursor.table.as_str()), forward) {
            (Ordering::Equal, true) => Cond::any()
                .add(past_ts)
                .add(Cond::all().add(same_ts).add(Expr::col(id.clone()).gt(cursor.sequence))),
            (Ordering::Equal, false) => Cond::any()
                .add(past_ts)
                .add(Cond::all().add(same_ts).add(Expr::col(id.clone()).lt(cursor.sequence))),
            // Later table in the direction of travel: equal timestamps are still ahead.
            (Ordering::Greater, true) | (Ordering::Less, false) => {
                Cond::any().add(past_ts).add(same_ts)
            }
            (Ordering::Less, true) | (Ordering::Greater, false) => Cond::all().add(past_ts),
        };
        select.cond_where(cond);
    }

    let order = match bounds.direction {
        Direction::Forward => Order::Asc,
        Direction::Backward => Order::Desc,
    };
    select
        .order_by(ts, order.clone())
        .order_by(id, order)
        .limit(u64::try_from(bounds.limit).unwrap_or(u64::MAX).saturating_add(1));
}

fn event_key(entry: &(String, StoredEvent)) -> (DateTime<Utc>, &str, i64) {
    (entry.1.timestamp, entry.0.as_str(), entry.1.sequence)
}

fn value_from_row(row: &PgRow) -> Result<StoredValue> {
    let tag: String = row.try_get("variant_type")?;
    let bytes: Vec<u8> = row.try_get("variant_binary")?;
    let status: i64 = row.try_get("status_code")?;
    Ok(StoredValue {
        sequence: row.try_get("_id")?,
        source_timestamp: row.try_get("source_timestamp")?,
        server_timestamp: row.try_get("server_timestamp")?,
        status_code: u32::try_from(status).unwrap_or(u32::MAX),
        value: codec::decode(&bytes, &tag),
    })
}
