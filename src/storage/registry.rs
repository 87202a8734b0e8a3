//! Schema registry: node and event-type tables.
//!
//! Tables are created on first use with `CREATE ... IF NOT EXISTS` inside a
//! transaction holding a transaction-scoped advisory lock keyed by the table
//! name. Concurrent creators, in this process or another, serialize on the
//! lock and the losers find the table already there. The in-process cache
//! only saves the round trip; correctness never depends on it.
//!
//! Name assignments are persisted in the metadata tables so every engine
//! instance sharing the database agrees on them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use sqlx::{Acquire, Row};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{HistoryError, Result};
use crate::storage::pool::ConnectionPool;
use crate::storage::retention::RetentionPolicy;
use crate::storage::sanitize::{IdentifierAllocator, IdentifierKind};
use crate::storage::schema::{self, TableKind};

/// SQLSTATEs meaning "someone else already created it".
const DUPLICATE_OBJECT_STATES: [&str; 4] = ["23505", "42P07", "42701", "42710"];
const UNIQUE_VIOLATION: &str = "23505";

const UPSERT_NODE: &str = r#"
INSERT INTO historian_nodes (node_id, table_name, retention_period_ms, retention_count)
VALUES ($1, $2, $3, $4)
ON CONFLICT (node_id) DO UPDATE
    SET retention_period_ms = EXCLUDED.retention_period_ms,
        retention_count = EXCLUDED.retention_count
RETURNING table_name
"#;

const SELECT_NODE: &str = r#"
SELECT node_id, table_name, retention_period_ms, retention_count
FROM historian_nodes WHERE node_id = $1
"#;

const SELECT_NODES: &str = r#"
SELECT node_id, table_name, retention_period_ms, retention_count
FROM historian_nodes ORDER BY node_id
"#;

const DELETE_NODE: &str = "DELETE FROM historian_nodes WHERE node_id = $1";

const INSERT_EVENT_TYPE: &str = r#"
INSERT INTO historian_event_types (event_type, table_name, fields)
VALUES ($1, $2, '{}'::jsonb)
ON CONFLICT (event_type) DO NOTHING
"#;

const SELECT_EVENT_TYPE: &str = r#"
SELECT event_type, table_name, fields::text AS fields, retention_period_ms, retention_count
FROM historian_event_types WHERE event_type = $1
"#;

const SELECT_EVENT_TYPES: &str = r#"
SELECT event_type, table_name, fields::text AS fields, retention_period_ms, retention_count
FROM historian_event_types ORDER BY event_type
"#;

const MERGE_EVENT_FIELDS: &str = r#"
UPDATE historian_event_types SET fields = fields || $2::jsonb WHERE event_type = $1
"#;

const UPDATE_EVENT_RETENTION: &str = r#"
UPDATE historian_event_types
SET retention_period_ms = $2, retention_count = $3
WHERE event_type = $1
"#;

const DELETE_EVENT_TYPE: &str = "DELETE FROM historian_event_types WHERE event_type = $1";

const TABLE_EXISTS: &str = "SELECT to_regclass($1) IS NOT NULL";

/// A node under historization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistorizedNode {
    pub node_id: String,
    pub table_name: String,
    pub retention: RetentionPolicy,
}

/// An event type, its table and the columns of its known fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTypeDescriptor {
    pub event_type: String,
    pub table_name: String,
    /// Field name to column name. Only ever grows.
    pub fields: BTreeMap<String, String>,
    pub retention: RetentionPolicy,
}

impl EventTypeDescriptor {
    pub fn column(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Field columns in field-name order.
    pub fn sorted_columns(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(f, c)| (f.as_str(), c.as_str()))
    }
}

#[derive(Debug)]
struct RegistryState {
    nodes: HashMap<String, HistorizedNode>,
    event_types: HashMap<String, EventTypeDescriptor>,
    node_names: IdentifierAllocator,
    event_names: IdentifierAllocator,
    /// Tables known to exist in the database.
    existing: HashSet<String>,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
            event_types: HashMap::new(),
            node_names: IdentifierAllocator::new(IdentifierKind::Node),
            event_names: IdentifierAllocator::new(IdentifierKind::EventType),
            existing: HashSet::new(),
        }
    }
}

/// Creates and caches history tables.
pub struct SchemaRegistry {
    pool: ConnectionPool,
    timescaledb: bool,
    state: RwLock<RegistryState>,
}

impl SchemaRegistry {
    pub fn new(pool: ConnectionPool, timescaledb: bool) -> Self {
        Self {
            pool,
            timescaledb,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Load persisted node and event-type assignments into the cache.
    pub async fn load(&self) -> Result<()> {
        let nodes = self.fetch_nodes().await?;
        let event_types = self.fetch_event_types().await?;
        let mut state = self.state.write().await;
        for node in nodes {
            adopt_node(&mut state, node)?;
        }
        for descriptor in event_types {
            adopt_event_type(&mut state, descriptor)?;
        }
        info!(
            nodes = state.nodes.len(),
            event_types = state.event_types.len(),
            "Schema registry loaded"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    /// Register a node (or update its retention). The table itself is
    /// created on first write.
    pub async fn register_node(
        &self,
        node_id: &str,
        retention: RetentionPolicy,
    ) -> Result<HistorizedNode> {
        retention.validate()?;
        let (period_ms, count) = retention.to_columns();

        let mut round = 0;
        loop {
            let candidate = {
                let state = self.state.read().await;
                match state.nodes.get(node_id) {
                    Some(node) => node.table_name.clone(),
                    None => state.node_names.next_candidate(node_id, round)?,
                }
            };
            let candidate_ref = &candidate;

            let result = self
                .pool
                .with_connection(|mut conn| async move {
                    let row = sqlx::query(UPSERT_NODE)
                        .bind(node_id)
                        .bind(candidate_ref)
                        .bind(period_ms)
                        .bind(count)
                        .fetch_one(&mut *conn)
                        .await?;
                    Ok(row.try_get::<String, _>("table_name")?)
                })
                .await;

            match result {
                Ok(table_name) => {
                    let node = HistorizedNode {
                        node_id: node_id.to_string(),
                        table_name,
                        retention,
                    };
                    adopt_node(&mut *self.state.write().await, node.clone())?;
                    debug!(node_id = %node_id, table = %node.table_name, "Node registered");
                    return Ok(node);
                }
                // Table name taken by another node in another instance.
                Err(err) if err.sqlstate().as_deref() == Some(UNIQUE_VIOLATION) => {
                    warn!(node_id = %node_id, table = %candidate, "Table name collision, trying a longer suffix");
                    round += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Look up a node, consulting the metadata table if it was registered
    /// by another instance.
    pub async fn node(&self, node_id: &str) -> Result<HistorizedNode> {
        if let Some(node) = self.state.read().await.nodes.get(node_id) {
            return Ok(node.clone());
        }
        let row = self
            .pool
            .with_connection(|mut conn| async move {
                Ok(sqlx::query(SELECT_NODE)
                    .bind(node_id)
                    .fetch_optional(&mut *conn)
                    .await?)
            })
            .await?;
        let node = match row {
            Some(row) => node_from_row(&row)?,
            None => return Err(HistoryError::UnknownNode(node_id.to_string())),
        };
        adopt_node(&mut *self.state.write().await, node.clone())?;
        Ok(node)
    }

    /// All registered nodes, fresh from the metadata table.
    pub async fn nodes(&self) -> Result<Vec<HistorizedNode>> {
        let nodes = self.fetch_nodes().await?;
        let mut state = self.state.write().await;
        for node in &nodes {
            adopt_node(&mut state, node.clone())?;
        }
        Ok(nodes)
    }

    /// Ensure the node's value table exists; returns its name.
    pub async fn ensure_value_table(&self, node: &HistorizedNode) -> Result<String> {
        if self.state.read().await.existing.contains(&node.table_name) {
            return Ok(node.table_name.clone());
        }
        let ddl = schema::create_value_table(&node.table_name)?;
        self.create_table(&node.table_name, &ddl, None).await?;
        self.after_create(&node.table_name, TableKind::Value).await;
        self.state
            .write()
            .await
            .existing
            .insert(node.table_name.clone());
        Ok(node.table_name.clone())
    }

    /// Drop a node's table and forget the node.
    pub async fn drop_node(&self, node_id: &str) -> Result<bool> {
        let node = match self.node(node_id).await {
            Ok(node) => node,
            Err(HistoryError::UnknownNode(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        let drop = schema::drop_table(&node.table_name);
        let (drop, node_ref) = (&drop, &node);
        self.pool
            .with_connection(|mut conn| async move {
                let mut tx = conn.begin().await?;
                sqlx::query(drop).execute(&mut *tx).await?;
                sqlx::query(DELETE_NODE)
                    .bind(&node_ref.node_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(())
            })
            .await?;

        let mut state = self.state.write().await;
        state.nodes.remove(node_id);
        state.node_names.release(node_id);
        state.existing.remove(&node.table_name);
        info!(node_id = %node_id, table = %node.table_name, "Node table dropped");
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Event types
    // ------------------------------------------------------------------

    /// Ensure the event type's table exists with a column for every field
    /// in `fields`; returns the up-to-date descriptor.
    pub async fn ensure_event_table<'a, I>(
        &self,
        event_type: &str,
        fields: I,
    ) -> Result<EventTypeDescriptor>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let wanted: BTreeSet<&str> = fields.into_iter().collect();
        if let Some(field) = wanted.iter().find(|f| f.trim().is_empty()) {
            return Err(HistoryError::Validation(format!(
                "event field name {field:?} must not be empty"
            )));
        }

        {
            let state = self.state.read().await;
            if let Some(desc) = state.event_types.get(event_type) {
                if state.existing.contains(&desc.table_name)
                    && wanted.iter().all(|f| desc.fields.contains_key(*f))
                {
                    return Ok(desc.clone());
                }
            }
        }

        let mut desc = self.event_type_or_register(event_type).await?;
        let mut columns = IdentifierAllocator::new(IdentifierKind::Field);
        for (field, column) in &desc.fields {
            columns.reserve(field, column)?;
        }
        let mut added = BTreeMap::new();
        for field in wanted {
            if !desc.fields.contains_key(field) {
                added.insert(field.to_string(), columns.assign(field)?);
            }
        }

        let mut ddl = schema::create_event_table(&desc.table_name)?;
        ddl.extend(
            added
                .values()
                .map(|column| schema::add_field_column(&desc.table_name, column)),
        );
        let merge = if added.is_empty() {
            None
        } else {
            let json = serde_json::to_string(&added)
                .map_err(|e| HistoryError::Validation(e.to_string()))?;
            Some((event_type, json))
        };
        let merge = merge.as_ref().map(|(t, j)| (*t, j.as_str()));
        self.create_table(&desc.table_name, &ddl, merge).await?;
        self.after_create(&desc.table_name, TableKind::Event).await;

        if !added.is_empty() {
            info!(event_type = %event_type, table = %desc.table_name, added = ?added.keys().collect::<Vec<_>>(), "Event table columns added");
        }
        desc.fields.extend(added);

        let mut state = self.state.write().await;
        state.existing.insert(desc.table_name.clone());
        // Another writer may have grown the cached entry meanwhile.
        if let Some(cached) = state.event_types.get(event_type) {
            for (field, column) in &cached.fields {
                desc.fields.entry(field.clone()).or_insert_with(|| column.clone());
            }
        }
        adopt_event_type(&mut state, desc.clone())?;
        Ok(desc)
    }

    /// Declare an event type's fields and retention ahead of first write.
    pub async fn register_event_type(
        &self,
        event_type: &str,
        fields: &[&str],
        retention: RetentionPolicy,
    ) -> Result<EventTypeDescriptor> {
        retention.validate()?;
        let mut desc = self
            .ensure_event_table(event_type, fields.iter().copied())
            .await?;
        let (period_ms, count) = retention.to_columns();
        self.pool
            .with_connection(|mut conn| async move {
                sqlx::query(UPDATE_EVENT_RETENTION)
                    .bind(event_type)
                    .bind(period_ms)
                    .bind(count)
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
            .await?;
        desc.retention = retention;
        adopt_event_type(&mut *self.state.write().await, desc.clone())?;
        Ok(desc)
    }

    /// Cached descriptor, or the persisted one, without registering.
    pub async fn event_type(&self, event_type: &str) -> Result<Option<EventTypeDescriptor>> {
        let persisted = self.fetch_event_type(event_type).await?;
        if let Some(desc) = &persisted {
            adopt_event_type(&mut *self.state.write().await, desc.clone())?;
        }
        Ok(persisted)
    }

    /// All event types, fresh from the metadata table.
    pub async fn event_types(&self) -> Result<Vec<EventTypeDescriptor>> {
        let descriptors = self.fetch_event_types().await?;
        let mut state = self.state.write().await;
        for desc in &descriptors {
            adopt_event_type(&mut state, desc.clone())?;
        }
        Ok(descriptors)
    }

    /// Drop an event type's table and forget it.
    pub async fn drop_event_type(&self, event_type: &str) -> Result<bool> {
        let Some(desc) = self.fetch_event_type(event_type).await? else {
            return Ok(false);
        };
        let drop = schema::drop_table(&desc.table_name);
        let drop = &drop;
        self.pool
            .with_connection(|mut conn| async move {
                let mut tx = conn.begin().await?;
                sqlx::query(drop).execute(&mut *tx).await?;
                sqlx::query(DELETE_EVENT_TYPE)
                    .bind(event_type)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(())
            })
            .await?;

        let mut state = self.state.write().await;
        state.event_types.remove(event_type);
        state.event_names.release(event_type);
        state.existing.remove(&desc.table_name);
        info!(event_type = %event_type, table = %desc.table_name, "Event table dropped");
        Ok(true)
    }

    /// Whether a table exists in the database.
    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        if self.state.read().await.existing.contains(table) {
            return Ok(true);
        }
        let exists = self
            .pool
            .with_connection(|mut conn| async move {
                let exists: Option<bool> = sqlx::query_scalar(TABLE_EXISTS)
                    .bind(table)
                    .fetch_one(&mut *conn)
                    .await?;
                Ok(exists.unwrap_or(false))
            })
            .await?;
        if exists {
            self.state.write().await.existing.insert(table.to_string());
        }
        Ok(exists)
    }

    /// Forget cached table existence (after bulk drops or truncation).
    pub async fn invalidate(&self) {
        let mut state = self.state.write().await;
        *state = RegistryState::default();
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn event_type_or_register(&self, event_type: &str) -> Result<EventTypeDescriptor> {
        if event_type.trim().is_empty() {
            return Err(HistoryError::Validation(
                "event type name must not be empty".into(),
            ));
        }
        if let Some(desc) = self.fetch_event_type(event_type).await? {
            return Ok(desc);
        }

        let mut round = 0;
        loop {
            let candidate = self
                .state
                .read()
                .await
                .event_names
                .next_candidate(event_type, round)?;
            let candidate_ref = &candidate;
            let result = self
                .pool
                .with_connection(|mut conn| async move {
                    sqlx::query(INSERT_EVENT_TYPE)
                        .bind(event_type)
                        .bind(candidate_ref)
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
                .await;
            match result {
                Ok(()) => break,
                Err(err) if err.sqlstate().as_deref() == Some(UNIQUE_VIOLATION) => {
                    warn!(event_type = %event_type, table = %candidate, "Table name collision, trying a longer suffix");
                    round += 1;
                }
                Err(err) => return Err(err),
            }
        }

        // Either our insert or a concurrent one won; read back the winner.
        self.fetch_event_type(event_type)
            .await?
            .ok_or_else(|| HistoryError::Validation(format!("event type {event_type:?} vanished during registration")))
    }

    /// Run DDL under an advisory lock on `table`, optionally merging new
    /// field columns into the event-type metadata in the same transaction.
    async fn create_table(
        &self,
        table: &str,
        ddl: &[String],
        merge_fields: Option<(&str, &str)>,
    ) -> Result<()> {
        let result = self
            .pool
            .with_connection(|mut conn| async move {
                let mut tx = conn.begin().await?;
                sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                    .bind(table)
                    .execute(&mut *tx)
                    .await?;
                for stmt in ddl {
                    sqlx::query(stmt).execute(&mut *tx).await?;
                }
                if let Some((event_type, json)) = merge_fields {
                    sqlx::query(MERGE_EVENT_FIELDS)
                        .bind(event_type)
                        .bind(json)
                        .execute(&mut *tx)
                        .await?;
                }
                tx.commit().await?;
                Ok(())
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(err)
                if err
                    .sqlstate()
                    .is_some_and(|s| DUPLICATE_OBJECT_STATES.contains(&s.as_str())) =>
            {
                debug!(table = %table, "Table created concurrently");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Hypertable conversion; a failure keeps the plain table.
    async fn after_create(&self, table: &str, kind: TableKind) {
        if !self.timescaledb {
            return;
        }
        let sql = schema::create_hypertable(table, &kind.time_column().to_string());
        let sql = &sql;
        let result = self
            .pool
            .with_connection(|mut conn| async move {
                sqlx::query(sql).execute(&mut *conn).await?;
                Ok(())
            })
            .await;
        if let Err(err) = result {
            warn!(table = %table, error = %err, "Hypertable conversion failed, keeping plain table");
        }
    }

    async fn fetch_nodes(&self) -> Result<Vec<HistorizedNode>> {
        let rows = self
            .pool
            .with_connection(|mut conn| async move {
                Ok(sqlx::query(SELECT_NODES).fetch_all(&mut *conn).await?)
            })
            .await?;
        rows.iter().map(node_from_row).collect()
    }

    async fn fetch_event_type(&self, event_type: &str) -> Result<Option<EventTypeDescriptor>> {
        let row = self
            .pool
            .with_connection(|mut conn| async move {
                Ok(sqlx::query(SELECT_EVENT_TYPE)
                    .bind(event_type)
                    .fetch_optional(&mut *conn)
                    .await?)
            })
            .await?;
        row.as_ref().map(event_type_from_row).transpose()
    }

    async fn fetch_event_types(&self) -> Result<Vec<EventTypeDescriptor>> {
        let rows = self
            .pool
            .with_connection(|mut conn| async move {
                Ok(sqlx::query(SELECT_EVENT_TYPES).fetch_all(&mut *conn).await?)
            })
            .await?;
        rows.iter().map(event_type_from_row).collect()
    }
}

fn adopt_node(state: &mut RegistryState, node: HistorizedNode) -> Result<()> {
    state.node_names.reserve(&node.node_id, &node.table_name)?;
    state.nodes.insert(node.node_id.clone(), node);
    Ok(())
}

fn adopt_event_type(state: &mut RegistryState, desc: EventTypeDescriptor) -> Result<()> {
    state.event_names.reserve(&desc.event_type, &desc.table_name)?;
    state.event_types.insert(desc.event_type.clone(), desc);
    Ok(())
}

fn node_from_row(row: &sqlx::postgres::PgRow) -> Result<HistorizedNode> {
    Ok(HistorizedNode {
        node_id: row.try_get("node_id")?,
        table_name: row.try_get("table_name")?,
        retention: RetentionPolicy::from_columns(
            row.try_get("retention_period_ms")?,
            row.try_get("retention_count")?,
        ),
    })
}

fn event_type_from_row(row: &sqlx::postgres::PgRow) -> Result<EventTypeDescriptor> {
    let fields: String = row.try_get("fields")?;
    let fields: BTreeMap<String, String> = serde_json::from_str(&fields)
        .map_err(|e| HistoryError::Validation(format!("corrupt event field metadata: {e}")))?;
    Ok(EventTypeDescriptor {
        event_type: row.try_get("event_type")?,
        table_name: row.try_get("table_name")?,
        fields,
        retention: RetentionPolicy::from_columns(
            row.try_get("retention_period_ms")?,
            row.try_get("retention_count")?,
        ),
    })
}
