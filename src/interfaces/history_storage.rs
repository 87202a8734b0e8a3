//! History storage interface.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::codec::Variant;
use crate::error::Result;
use crate::storage::{
    HistorizedNode, HistoryPage, ReadRequest, RetentionPolicy, StoredEvent, StoredValue,
    ValueRecord,
};

/// Where the engine is connected and whether it is usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub initialized: bool,
}

/// Interface the live server uses to persist and read history.
///
/// Implementations:
/// - `PgHistorian`: PostgreSQL storage
///
/// Every data operation fails with `NotInitialized` before [`init`] and with
/// `PoolClosed` after [`stop`].
///
/// [`init`]: HistoryStorage::init
/// [`stop`]: HistoryStorage::stop
#[async_trait]
pub trait HistoryStorage: Send + Sync {
    /// Open the pool, bring the schema up to date and load registrations.
    async fn init(&self) -> Result<()>;

    /// Release every connection. The storage cannot be restarted.
    async fn stop(&self) -> Result<()>;

    /// Start historizing a node, or update its retention.
    async fn new_historized_node(
        &self,
        node_id: &str,
        retention: RetentionPolicy,
    ) -> Result<HistorizedNode>;

    /// Append one value of a historized node.
    async fn save_node_value(&self, node_id: &str, record: &ValueRecord) -> Result<()>;

    /// Read one page of a node's values.
    async fn read_node_history(
        &self,
        node_id: &str,
        request: &ReadRequest,
    ) -> Result<HistoryPage<StoredValue>>;

    /// Append one event.
    async fn save_event(
        &self,
        event_type: &str,
        fields: &HashMap<String, Variant>,
        timestamp: DateTime<Utc>,
    ) -> Result<()>;

    /// Read one page of events, merged across event types in time order.
    async fn read_event_history(
        &self,
        event_types: Option<&[&str]>,
        select: Option<&[&str]>,
        request: &ReadRequest,
    ) -> Result<HistoryPage<StoredEvent>>;

    async fn connection_info(&self) -> ConnectionInfo;
}
