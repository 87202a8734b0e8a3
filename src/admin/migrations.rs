//! Versioned schema migrations.
//!
//! Each step runs in its own transaction together with the row recording its
//! version, so a failed step leaves the schema at the previous version.
//! Steps serialize on a transaction-scoped advisory lock and re-check the
//! recorded versions under it, which makes concurrent runners safe and
//! re-application a no-op.

use sea_query::{ColumnDef, Expr, PostgresQueryBuilder, Query, Table};
use sea_query_binder::SqlxBinder;
use sqlx::{Acquire, Executor, Row};
use tracing::{debug, info};

use crate::error::{HistoryError, Result};
use crate::storage::pool::ConnectionPool;
use crate::storage::schema::SchemaVersion;

const MIGRATION_LOCK: &str = "SELECT pg_advisory_xact_lock(hashtext('historian_schema_version'))";

const CURRENT_VERSION: &str = "SELECT COALESCE(MAX(version), 0) AS version FROM historian_schema_version";

const VERSION_APPLIED: &str = "SELECT EXISTS (SELECT 1 FROM historian_schema_version WHERE version = $1)";

const APPLIED_VERSIONS: &str = r#"
SELECT version, description, applied_at
FROM historian_schema_version ORDER BY version
"#;

/// One schema step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

/// Built-in steps, ascending by version.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "metadata tables",
        sql: include_str!("../../migrations/postgres/0001_metadata.sql"),
    },
    Migration {
        version: 2,
        description: "retention checks",
        sql: include_str!("../../migrations/postgres/0002_retention_checks.sql"),
    },
];

/// Highest built-in version.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// A version recorded in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: i64,
    pub description: String,
    pub applied_at: chrono::DateTime<chrono::Utc>,
}

/// Applies [`Migration`]s against one database.
pub struct Migrator {
    pool: ConnectionPool,
    migrations: &'static [Migration],
}

impl Migrator {
    pub fn new(pool: ConnectionPool) -> Self {
        Self::with_migrations(pool, MIGRATIONS)
    }

    pub fn with_migrations(pool: ConnectionPool, migrations: &'static [Migration]) -> Self {
        Self { pool, migrations }
    }

    /// Version the database is at; 0 before any step ran.
    pub async fn current_version(&self) -> Result<i64> {
        self.ensure_version_table().await?;
        self.pool
            .with_connection(|mut conn| async move {
                let row = sqlx::query(CURRENT_VERSION).fetch_one(&mut *conn).await?;
                Ok(row.try_get::<i64, _>("version")?)
            })
            .await
    }

    pub async fn applied(&self) -> Result<Vec<AppliedMigration>> {
        self.ensure_version_table().await?;
        let rows = self
            .pool
            .with_connection(|mut conn| async move {
                Ok(sqlx::query(APPLIED_VERSIONS).fetch_all(&mut *conn).await?)
            })
            .await?;
        rows.iter()
            .map(|row| {
                Ok(AppliedMigration {
                    version: row.try_get("version")?,
                    description: row.try_get("description")?,
                    applied_at: row.try_get("applied_at")?,
                })
            })
            .collect()
    }

    /// Apply every step up to `target` (latest when `None`).
    ///
    /// Returns the versions applied by this call. Versions never decrease:
    /// a target below the current version is rejected.
    pub async fn migrate_to(&self, target: Option<i64>) -> Result<Vec<i64>> {
        let latest = self.migrations.last().map(|m| m.version).unwrap_or(0);
        let target = target.unwrap_or(latest);
        if target > latest || target < 0 {
            return Err(HistoryError::Validation(format!(
                "unknown schema version {target} (latest is {latest})"
            )));
        }
        let current = self.current_version().await?;
        if target < current {
            return Err(HistoryError::Validation(format!(
                "schema is at version {current}; cannot go back to {target}"
            )));
        }

        let mut applied = Vec::new();
        for step in self
            .migrations
            .iter()
            .filter(|m| m.version > current && m.version <= target)
        {
            if self.apply(step).await? {
                applied.push(step.version);
            }
        }
        if applied.is_empty() {
            debug!(version = current, "Schema up to date");
        } else {
            info!(from = current, to = target, steps = applied.len(), "Schema migrated");
        }
        Ok(applied)
    }

    /// Run one step; `false` when another runner got there first.
    async fn apply(&self, step: &Migration) -> Result<bool> {
        let (record, values) = Query::insert()
            .into_table(SchemaVersion::Table)
            .columns([SchemaVersion::Version, SchemaVersion::Description])
            .values_panic([step.version.into(), step.description.into()])
            .build_sqlx(PostgresQueryBuilder);
        let (record, values) = (&record, &values);

        let ran = self
            .pool
            .with_connection(|mut conn| async move {
                let mut tx = conn.begin().await?;
                sqlx::query(MIGRATION_LOCK).execute(&mut *tx).await?;
                let done: bool = sqlx::query_scalar(VERSION_APPLIED)
                    .bind(step.version)
                    .fetch_one(&mut *tx)
                    .await?;
                if done {
                    return Ok(false);
                }
                (&mut *tx)
                    .execute(sqlx::raw_sql(step.sql))
                    .await
                    .map_err(|source| migration_error(step, source))?;
                sqlx::query_with(record, values.clone())
                    .execute(&mut *tx)
                    .await
                    .map_err(|source| migration_error(step, source))?;
                tx.commit()
                    .await
                    .map_err(|source| migration_error(step, source))?;
                Ok(true)
            })
            .await?;

        if ran {
            info!(version = step.version, description = %step.description, "Migration applied");
        }
        Ok(ran)
    }

    async fn ensure_version_table(&self) -> Result<()> {
        let create = version_table_ddl();
        let create = &create;
        self.pool
            .with_connection(|mut conn| async move {
                let mut tx = conn.begin().await?;
                sqlx::query(MIGRATION_LOCK).execute(&mut *tx).await?;
                sqlx::query(create).execute(&mut *tx).await?;
                tx.commit().await?;
                Ok(())
            })
            .await
    }
}

fn migration_error(step: &Migration, source: sqlx::Error) -> HistoryError {
    HistoryError::Migration {
        version: step.version,
        description: step.description.to_string(),
        source,
    }
}

fn version_table_ddl() -> String {
    Table::create()
        .table(SchemaVersion::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(SchemaVersion::Version)
                .big_integer()
                .not_null()
                .primary_key(),
        )
        .col(ColumnDef::new(SchemaVersion::Description).text().not_null())
        .col(
            ColumnDef::new(SchemaVersion::AppliedAt)
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .to_string(PostgresQueryBuilder)
}
