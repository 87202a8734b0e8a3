//! PostgreSQL history engine.
//!
//! [`PgHistorian`] wires the pool, schema registry, writer, reader and
//! retention enforcer together behind the [`HistoryStorage`] interface.
//! Settings are resolved once at construction and never change afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::admin::migrations::Migrator;
use crate::codec::Variant;
use crate::config::{ConnectionSettings, HistorianOptions};
use crate::error::{HistoryError, Result};
use crate::interfaces::{ConnectionInfo, HistoryStorage};
use crate::storage::pool::{ConnectionPool, PoolStatus};
use crate::storage::reader::{HistoryPage, HistoryReader, ReadRequest, StoredEvent, StoredValue};
use crate::storage::registry::{EventTypeDescriptor, HistorizedNode, SchemaRegistry};
use crate::storage::retention::{RetentionEnforcer, RetentionOutcome, RetentionPolicy};
use crate::storage::schema::TableKind;
use crate::storage::writer::{HistoryWriter, ValueRecord};

/// Components live only while the engine runs.
struct Engine {
    pool: ConnectionPool,
    registry: Arc<SchemaRegistry>,
    writer: HistoryWriter,
    reader: HistoryReader,
    retention: RetentionEnforcer,
}

enum EngineState {
    Created,
    Running(Arc<Engine>),
    Stopped,
}

/// History storage on PostgreSQL.
pub struct PgHistorian {
    settings: ConnectionSettings,
    state: RwLock<EngineState>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PgHistorian {
    /// Resolve options into frozen settings. No connection is made until
    /// [`HistoryStorage::init`].
    pub fn new(options: &HistorianOptions) -> Result<Self> {
        Ok(Self::from_settings(options.resolve()?))
    }

    pub fn from_settings(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            state: RwLock::new(EngineState::Created),
            sweeper: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    async fn engine(&self) -> Result<Arc<Engine>> {
        match &*self.state.read().await {
            EngineState::Created => Err(HistoryError::NotInitialized),
            EngineState::Running(engine) => Ok(Arc::clone(engine)),
            EngineState::Stopped => Err(HistoryError::PoolClosed),
        }
    }

    /// Append a batch of values of one node.
    pub async fn save_node_values(&self, node_id: &str, records: &[ValueRecord]) -> Result<()> {
        let engine = self.engine().await?;
        let node = engine.registry.node(node_id).await?;
        engine.writer.save_values(&node, records).await
    }

    /// Declare an event type's fields and retention ahead of first write.
    pub async fn register_event_type(
        &self,
        event_type: &str,
        fields: &[&str],
        retention: RetentionPolicy,
    ) -> Result<EventTypeDescriptor> {
        let engine = self.engine().await?;
        engine
            .registry
            .register_event_type(event_type, fields, retention)
            .await
    }

    pub async fn pool_status(&self) -> Result<PoolStatus> {
        Ok(self.engine().await?.pool.status())
    }

    /// Apply every retention policy now.
    pub async fn enforce_retention(&self) -> Result<RetentionOutcome> {
        let engine = self.engine().await?;
        sweep(&engine.registry, &engine.retention).await
    }

    fn spawn_sweeper(engine: &Arc<Engine>, period: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(&engine.registry);
        let retention = engine.retention.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match sweep(&registry, &retention).await {
                    Ok(outcome) => debug!(removed = outcome.total(), "Retention sweep done"),
                    Err(e) => warn!(error = %e, "Retention sweep failed"),
                }
            }
        })
    }
}

#[async_trait]
impl HistoryStorage for PgHistorian {
    async fn init(&self) -> Result<()> {
        let mut state = self.state.write().await;
        match &*state {
            EngineState::Running(_) => {
                debug!("History storage already initialized");
                return Ok(());
            }
            EngineState::Stopped => return Err(HistoryError::PoolClosed),
            EngineState::Created => {}
        }

        let settings = &self.settings;
        let pool =
            ConnectionPool::connect(settings.connect_options(), settings.pool.clone()).await?;
        let setup = async {
            Migrator::new(pool.clone()).migrate_to(None).await?;
            let registry = Arc::new(SchemaRegistry::new(pool.clone(), settings.timescaledb));
            registry.load().await?;
            Ok::<_, HistoryError>(registry)
        };
        let registry = match setup.await {
            Ok(registry) => registry,
            Err(e) => {
                pool.close().await;
                return Err(e);
            }
        };

        let engine = Arc::new(Engine {
            writer: HistoryWriter::new(
                pool.clone(),
                Arc::clone(&registry),
                settings.enforce_retention_on_write,
            ),
            reader: HistoryReader::new(
                pool.clone(),
                Arc::clone(&registry),
                settings.max_history_response_size,
            ),
            retention: RetentionEnforcer::new(pool.clone()),
            registry,
            pool,
        });

        if let Some(period) = settings.retention_interval {
            *self.sweeper.lock().await = Some(Self::spawn_sweeper(&engine, period));
        }
        *state = EngineState::Running(engine);
        info!(
            host = %settings.connection.host,
            database = %settings.connection.database,
            source = ?settings.source,
            "History storage initialized"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(sweeper) = self.sweeper.lock().await.take() {
            sweeper.abort();
        }
        if let EngineState::Running(engine) = std::mem::replace(&mut *state, EngineState::Stopped) {
            engine.pool.close().await;
            info!("History storage stopped");
        }
        Ok(())
    }

    async fn new_historized_node(
        &self,
        node_id: &str,
        retention: RetentionPolicy,
    ) -> Result<HistorizedNode> {
        let engine = self.engine().await?;
        engine.registry.register_node(node_id, retention).await
    }

    async fn save_node_value(&self, node_id: &str, record: &ValueRecord) -> Result<()> {
        let engine = self.engine().await?;
        let node = engine.registry.node(node_id).await?;
        engine.writer.save_value(&node, record).await
    }

    async fn read_node_history(
        &self,
        node_id: &str,
        request: &ReadRequest,
    ) -> Result<HistoryPage<StoredValue>> {
        let engine = self.engine().await?;
        let node = engine.registry.node(node_id).await?;
        engine.reader.read_values(&node, request).await
    }

    async fn save_event(
        &self,
        event_type: &str,
        fields: &HashMap<String, Variant>,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let engine = self.engine().await?;
        engine.writer.save_event(event_type, fields, timestamp).await
    }

    async fn read_event_history(
        &self,
        event_types: Option<&[&str]>,
        select: Option<&[&str]>,
        request: &ReadRequest,
    ) -> Result<HistoryPage<StoredEvent>> {
        let engine = self.engine().await?;
        engine.reader.read_events(event_types, select, request).await
    }

    async fn connection_info(&self) -> ConnectionInfo {
        let connection = &self.settings.connection;
        ConnectionInfo {
            host: connection.host.clone(),
            port: connection.port,
            database: connection.database.clone(),
            user: connection.user.clone(),
            initialized: matches!(&*self.state.read().await, EngineState::Running(_)),
        }
    }
}

/// Apply the retention policy of every registered node and event type.
///
/// A failing table is logged and skipped so one bad table does not starve
/// the others.
async fn sweep(registry: &SchemaRegistry, retention: &RetentionEnforcer) -> Result<RetentionOutcome> {
    let mut targets: Vec<(String, TableKind, RetentionPolicy)> = Vec::new();
    for node in registry.nodes().await? {
        if !node.retention.is_unbounded() {
            targets.push((node.table_name, TableKind::Value, node.retention));
        }
    }
    for desc in registry.event_types().await? {
        if !desc.retention.is_unbounded() {
            targets.push((desc.table_name, TableKind::Event, desc.retention));
        }
    }

    let mut total = RetentionOutcome::default();
    for (table, kind, policy) in targets {
        if !registry.table_exists(&table).await? {
            continue;
        }
        match retention.enforce(&table, kind, &policy).await {
            Ok(outcome) => {
                total.expired += outcome.expired;
                total.over_count += outcome.over_count;
            }
            Err(e) => error!(table = %table, error = %e, "Retention failed"),
        }
    }
    Ok(total)
}
