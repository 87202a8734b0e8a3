//! Retention enforcement.
//!
//! Two optional policies per node or event type:
//! - period: delete rows older than `now - period`
//! - count: keep only the newest `count` rows
//!
//! When both are set a row survives only if it satisfies both. Both deletes
//! run in one transaction, always removing an oldest-first contiguous range,
//! so concurrent readers never see a hole in the retained history.

use std::time::Duration;

use chrono::Utc;
use sea_query::{Alias, Expr, Order, PostgresQueryBuilder, Query};
use sea_query_binder::SqlxBinder;
use serde::{Deserialize, Serialize};
use sqlx::Acquire;
use tracing::{debug, info};

use crate::error::{HistoryError, Result};
use crate::storage::pool::ConnectionPool;
use crate::storage::schema::TableKind;

/// How much history to keep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub period: Option<Duration>,
    pub count: Option<u64>,
}

impl RetentionPolicy {
    /// Keep everything.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.period.is_none() && self.count.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if self.period.is_some_and(|p| p.is_zero()) {
            return Err(HistoryError::Validation(
                "retention period must be positive".into(),
            ));
        }
        if self.count == Some(0) {
            return Err(HistoryError::Validation(
                "retention count must be positive".into(),
            ));
        }
        if self
            .period
            .is_some_and(|p| chrono::Duration::from_std(p).is_err())
        {
            return Err(HistoryError::Validation("retention period too large".into()));
        }
        Ok(())
    }

    /// Metadata column values `(period_ms, count)`.
    pub fn to_columns(&self) -> (Option<i64>, Option<i64>) {
        (
            self.period
                .map(|p| i64::try_from(p.as_millis()).unwrap_or(i64::MAX)),
            self.count.map(|c| i64::try_from(c).unwrap_or(i64::MAX)),
        )
    }

    pub fn from_columns(period_ms: Option<i64>, count: Option<i64>) -> Self {
        Self {
            period: period_ms
                .filter(|ms| *ms > 0)
                .map(|ms| Duration::from_millis(ms as u64)),
            count: count.filter(|c| *c > 0).map(|c| c as u64),
        }
    }
}

/// Rows deleted by one enforcement run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionOutcome {
    pub expired: u64,
    pub over_count: u64,
}

impl RetentionOutcome {
    pub fn total(&self) -> u64 {
        self.expired + self.over_count
    }
}

/// Applies retention policies to history tables.
#[derive(Clone)]
pub struct RetentionEnforcer {
    pool: ConnectionPool,
}

impl RetentionEnforcer {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Trim `table` according to `policy` in a single transaction.
    pub async fn enforce(
        &self,
        table: &str,
        kind: TableKind,
        policy: &RetentionPolicy,
    ) -> Result<RetentionOutcome> {
        if policy.is_unbounded() {
            return Ok(RetentionOutcome::default());
        }
        let statements = retention_statements(table, kind, policy)?;
        let statements = &statements;

        let outcome = self
            .pool
            .with_connection(|mut conn| async move {
                let mut tx = conn.begin().await?;
                let mut outcome = RetentionOutcome::default();
                if let Some((sql, values)) = &statements.period {
                    outcome.expired = sqlx::query_with(sql, values.clone())
                        .execute(&mut *tx)
                        .await?
                        .rows_affected();
                }
                if let Some(sql) = &statements.count {
                    outcome.over_count = sqlx::query(sql).execute(&mut *tx).await?.rows_affected();
                }
                tx.commit().await?;
                Ok(outcome)
            })
            .await?;

        if outcome.total() > 0 {
            info!(
                table = %table,
                expired = outcome.expired,
                over_count = outcome.over_count,
                "Retention removed rows"
            );
        } else {
            debug!(table = %table, "Retention found nothing to remove");
        }
        Ok(outcome)
    }

    /// Delete rows older than `cutoff` regardless of policy.
    pub async fn purge_before(
        &self,
        table: &str,
        kind: TableKind,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<u64> {
        let (sql, values) = Query::delete()
            .from_table(Alias::new(table))
            .and_where(Expr::col(kind.time_column()).lt(cutoff))
            .build_sqlx(PostgresQueryBuilder);
        let (sql, values) = (&sql, &values);

        self.pool
            .with_connection(|mut conn| async move {
                let result = sqlx::query_with(sql, values.clone())
                    .execute(&mut *conn)
                    .await?;
                Ok(result.rows_affected())
            })
            .await
    }
}

struct RetentionStatements {
    period: Option<(String, sea_query_binder::SqlxValues)>,
    count: Option<String>,
}

fn retention_statements(
    table: &str,
    kind: TableKind,
    policy: &RetentionPolicy,
) -> Result<RetentionStatements> {
    policy.validate()?;

    let period = match policy.period {
        Some(period) => {
            let period = chrono::Duration::from_std(period)
                .map_err(|_| HistoryError::Validation("retention period too large".into()))?;
            let cutoff = Utc::now() - period;
            Some(
                Query::delete()
                    .from_table(Alias::new(table))
                    .and_where(Expr::col(kind.time_column()).lt(cutoff))
                    .build_sqlx(PostgresQueryBuilder),
            )
        }
        None => None,
    };

    // Everything past the newest `count` rows, by the read ordering.
    let count = policy.count.map(|count| {
        let overflow = Query::select()
            .column(kind.id_column())
            .from(Alias::new(table))
            .order_by(kind.time_column(), Order::Desc)
            .order_by(kind.id_column(), Order::Desc)
            .offset(count)
            .to_owned();
        Query::delete()
            .from_table(Alias::new(table))
            .and_where(Expr::col(kind.id_column()).in_subquery(overflow))
            .to_string(PostgresQueryBuilder)
    });

    Ok(RetentionStatements { period, count })
}
