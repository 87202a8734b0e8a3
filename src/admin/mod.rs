//! Administrative database manager.
//!
//! Out-of-band operations on a historian database: bootstrap, migrations,
//! backup and restore, bulk cleanup and management of the encrypted
//! connection config. Bootstrap runs as a superuser on the maintenance
//! database; everything else runs as the historian role so the tables it
//! creates stay owned by that role.

pub mod backup;
pub mod migrations;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use sea_query::{Expr, PostgresQueryBuilder, Query};
use sqlx::Row;
use tracing::{info, warn};

use crate::config::{connect_options, AdminConfig};
use crate::error::{HistoryError, Result};
use crate::storage::pool::{ConnectionPool, PoolSettings};
use crate::storage::registry::SchemaRegistry;
use crate::storage::retention::RetentionEnforcer;
use crate::storage::sanitize::{quote_ident, quote_literal};
use crate::storage::schema::{self, HistorianEventTypes, HistorianNodes, TableKind};
use crate::vault::{self, ConnectionConfig, EncryptedConfig};

pub use backup::{BackupFormat, BackupOptions, RestoreTool};
pub use migrations::{latest_version, AppliedMigration, Migration, Migrator, MIGRATIONS};

const ROLE_EXISTS: &str = "SELECT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = $1)";
const DATABASE_EXISTS: &str = "SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)";
const DATABASE_SIZE: &str = "SELECT pg_database_size(current_database()) AS size";

/// Outcome of [`DatabaseManager::create_database`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseCreated {
    pub created_role: bool,
    pub created_database: bool,
    pub schema_version: i64,
    /// Encrypted config written for the engine, when a master password is set.
    pub config_file: Option<PathBuf>,
}

/// Summary returned by [`DatabaseManager::database_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub database: String,
    pub size_bytes: i64,
    pub node_count: i64,
    pub event_type_count: i64,
    pub schema_version: i64,
    pub latest_version: i64,
}

pub struct DatabaseManager {
    config: AdminConfig,
}

impl DatabaseManager {
    pub fn new(config: AdminConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AdminConfig {
        &self.config
    }

    /// Create the historian role and database if absent, optionally enable
    /// TimescaleDB, migrate to the latest version and write the encrypted
    /// connection config.
    pub async fn create_database(&self) -> Result<DatabaseCreated> {
        validate_name("user", &self.config.user)?;
        validate_name("database", &self.config.database)?;

        let superuser = self.superuser_pool(&self.config.maintenance_database).await?;
        let user = self.config.user.as_str();
        let database = self.config.database.as_str();

        let create_role = format!(
            "CREATE ROLE {} LOGIN PASSWORD {}",
            quote_ident(user),
            quote_literal(&self.config.password)
        );
        let create_database = format!(
            "CREATE DATABASE {} OWNER {}",
            quote_ident(database),
            quote_ident(user)
        );
        let (create_role, create_database) = (&create_role, &create_database);

        let (created_role, created_database) = superuser
            .with_connection(|mut conn| async move {
                let role_exists: bool = sqlx::query_scalar(ROLE_EXISTS)
                    .bind(user)
                    .fetch_one(&mut *conn)
                    .await?;
                if !role_exists {
                    sqlx::query(create_role).execute(&mut *conn).await?;
                }
                let db_exists: bool = sqlx::query_scalar(DATABASE_EXISTS)
                    .bind(database)
                    .fetch_one(&mut *conn)
                    .await?;
                // CREATE DATABASE cannot run inside a transaction block.
                if !db_exists {
                    sqlx::raw_sql(create_database).execute(&mut *conn).await?;
                }
                Ok((!role_exists, !db_exists))
            })
            .await?;
        superuser.close().await;
        info!(
            database = %database,
            user = %user,
            created_role,
            created_database,
            "Database bootstrap done"
        );

        if self.config.timescaledb {
            let target = self.superuser_pool(database).await?;
            target
                .with_connection(|mut conn| async move {
                    sqlx::query("CREATE EXTENSION IF NOT EXISTS timescaledb")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
                .await?;
            target.close().await;
            info!(database = %database, "TimescaleDB extension enabled");
        }

        let pool = self.historian_pool().await?;
        let migrator = Migrator::new(pool.clone());
        migrator.migrate_to(None).await?;
        let schema_version = migrator.current_version().await?;
        pool.close().await;

        let config_file = match self.config.master_password.as_deref() {
            Some(master) if !master.is_empty() => {
                let sealed = vault::encrypt(&self.config.historian_connection(), master)?;
                sealed.save(&self.config.config_file)?;
                info!(path = %self.config.config_file.display(), "Encrypted config written");
                Some(self.config.config_file.clone())
            }
            _ => None,
        };

        Ok(DatabaseCreated {
            created_role,
            created_database,
            schema_version,
            config_file,
        })
    }

    /// Migrate to `target` (latest when `None`); returns the resulting version.
    pub async fn migrate_to(&self, target: Option<i64>) -> Result<i64> {
        let pool = self.historian_pool().await?;
        let migrator = Migrator::new(pool.clone());
        let result: Result<i64> = async {
            migrator.migrate_to(target).await?;
            migrator.current_version().await
        }
        .await;
        pool.close().await;
        result
    }

    pub async fn backup(&self, path: &Path, options: &BackupOptions) -> Result<()> {
        backup::backup(&self.config, path, options).await
    }

    /// Restore a backup in a single client tool run. With `drop_existing`,
    /// existing objects are removed first (`--clean` for archives, a schema
    /// reset inside the script's transaction for SQL scripts).
    pub async fn restore(&self, path: &Path, drop_existing: bool) -> Result<RestoreTool> {
        let tool = backup::detect_restore_tool(path).await?;
        if drop_existing {
            warn!(database = %self.config.database, tool = ?tool, "Existing objects are replaced by the restore");
        }
        backup::run(backup::restore_command(&self.config, path, tool, drop_existing)).await?;
        info!(path = %path.display(), tool = ?tool, "Backup restored");
        Ok(tool)
    }

    /// Delete history rows older than `age` from every node and event table.
    pub async fn cleanup_older_than(&self, age: Duration) -> Result<u64> {
        let age = chrono::Duration::from_std(age)
            .map_err(|_| HistoryError::Validation("cleanup age too large".into()))?;
        let cutoff = Utc::now() - age;

        let pool = self.historian_pool().await?;
        let result: Result<u64> = async {
            let registry = SchemaRegistry::new(pool.clone(), false);
            let enforcer = RetentionEnforcer::new(pool.clone());
            let mut removed = 0;
            for (table, kind) in existing_tables(&registry).await? {
                removed += enforcer.purge_before(&table, kind, cutoff).await?;
            }
            Ok(removed)
        }
        .await;
        pool.close().await;
        let removed = result?;
        info!(cutoff = %cutoff, removed, "Cleanup finished");
        Ok(removed)
    }

    /// Drop the value tables of the given nodes and forget them.
    /// Returns how many nodes were removed.
    pub async fn remove_node_tables(&self, node_ids: &[&str]) -> Result<usize> {
        let pool = self.historian_pool().await?;
        let result: Result<usize> = async {
            let registry = SchemaRegistry::new(pool.clone(), false);
            let mut removed = 0;
            for node_id in node_ids {
                if registry.drop_node(node_id).await? {
                    removed += 1;
                } else {
                    warn!(node_id = %node_id, "Node not registered, nothing removed");
                }
            }
            Ok(removed)
        }
        .await;
        pool.close().await;
        result
    }

    /// Empty every history table, keeping registrations and schema.
    /// Returns how many tables were emptied.
    pub async fn clear_all_data(&self) -> Result<usize> {
        let pool = self.historian_pool().await?;
        let result: Result<usize> = async {
            let registry = SchemaRegistry::new(pool.clone(), false);
            let tables = existing_tables(&registry).await?;
            let statements: Vec<String> = tables
                .iter()
                .map(|(table, _)| schema::truncate_table(table))
                .collect();
            let statements = &statements;
            pool.with_connection(|mut conn| async move {
                use sqlx::Acquire;
                let mut tx = conn.begin().await?;
                for sql in statements {
                    sqlx::query(sql).execute(&mut *tx).await?;
                }
                tx.commit().await?;
                Ok(())
            })
            .await?;
            Ok(tables.len())
        }
        .await;
        pool.close().await;
        let cleared = result?;
        warn!(database = %self.config.database, tables = cleared, "All history data cleared");
        Ok(cleared)
    }

    pub async fn database_info(&self) -> Result<DatabaseInfo> {
        let pool = self.historian_pool().await?;
        let result: Result<DatabaseInfo> = async {
            let schema_version = Migrator::new(pool.clone()).current_version().await?;
            let nodes = Query::select()
                .expr(Expr::col(HistorianNodes::NodeId).count())
                .from(HistorianNodes::Table)
                .to_string(PostgresQueryBuilder);
            let event_types = Query::select()
                .expr(Expr::col(HistorianEventTypes::EventType).count())
                .from(HistorianEventTypes::Table)
                .to_string(PostgresQueryBuilder);
            let (nodes, event_types) = (&nodes, &event_types);

            let (size_bytes, node_count, event_type_count) = pool
                .with_connection(|mut conn| async move {
                    let size: i64 = sqlx::query(DATABASE_SIZE)
                        .fetch_one(&mut *conn)
                        .await?
                        .try_get("size")?;
                    let node_count: i64 = sqlx::query_scalar(nodes).fetch_one(&mut *conn).await?;
                    let event_type_count: i64 =
                        sqlx::query_scalar(event_types).fetch_one(&mut *conn).await?;
                    Ok((size, node_count, event_type_count))
                })
                .await?;
            Ok(DatabaseInfo {
                database: self.config.database.clone(),
                size_bytes,
                node_count,
                event_type_count,
                schema_version,
                latest_version: latest_version(),
            })
        }
        .await;
        pool.close().await;
        result
    }

    /// Write the decrypted connection config as plaintext JSON.
    pub async fn export_config(&self, path: &Path) -> Result<ConnectionConfig> {
        let sealed = EncryptedConfig::load(&self.config.config_file)?;
        let config = vault::decrypt(&sealed, self.master_password()?)?;
        let json = serde_json::to_string_pretty(&config)
            .map_err(|e| HistoryError::Validation(format!("cannot serialize config: {e}")))?;
        tokio::fs::write(path, json).await?;
        warn!(path = %path.display(), "Connection config exported in plaintext");
        Ok(config)
    }

    /// Encrypt a plaintext JSON connection config into the config file.
    pub async fn import_config(&self, path: &Path) -> Result<ConnectionConfig> {
        let json = tokio::fs::read_to_string(path).await?;
        let config: ConnectionConfig = serde_json::from_str(&json)
            .map_err(|e| HistoryError::Validation(format!("invalid connection config: {e}")))?;
        let sealed = vault::encrypt(&config, self.master_password()?)?;
        sealed.save(&self.config.config_file)?;
        info!(path = %self.config.config_file.display(), "Connection config imported");
        Ok(config)
    }

    /// Re-encrypt the config file under `new_password`.
    pub fn rotate_master_password(&self, new_password: &str) -> Result<()> {
        if new_password.is_empty() {
            return Err(HistoryError::Validation(
                "new master password must not be empty".into(),
            ));
        }
        let sealed = EncryptedConfig::load(&self.config.config_file)?;
        let rotated = vault::rotate(&sealed, self.master_password()?, new_password)?;
        rotated.save(&self.config.config_file)?;
        info!(path = %self.config.config_file.display(), "Master password rotated");
        Ok(())
    }

    fn master_password(&self) -> Result<&str> {
        match self.config.master_password.as_deref() {
            Some(pw) if !pw.is_empty() => Ok(pw),
            _ => Err(HistoryError::Validation("master password is required".into())),
        }
    }

    async fn superuser_pool(&self, database: &str) -> Result<ConnectionPool> {
        let mut connection = self.config.superuser_connection();
        connection.database = database.to_string();
        ConnectionPool::connect(connect_options(&connection), admin_pool_settings()).await
    }

    async fn historian_pool(&self) -> Result<ConnectionPool> {
        ConnectionPool::connect(
            connect_options(&self.config.historian_connection()),
            admin_pool_settings(),
        )
        .await
    }
}

fn admin_pool_settings() -> PoolSettings {
    PoolSettings {
        min_size: 0,
        max_size: 2,
        ..Default::default()
    }
}

fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() || name.len() > 63 {
        return Err(HistoryError::Validation(format!(
            "{what} name must be 1-63 bytes"
        )));
    }
    Ok(())
}

/// Registered node and event tables that exist in the database.
async fn existing_tables(registry: &SchemaRegistry) -> Result<Vec<(String, TableKind)>> {
    let mut tables = Vec::new();
    for node in registry.nodes().await? {
        if registry.table_exists(&node.table_name).await? {
            tables.push((node.table_name, TableKind::Value));
        }
    }
    for desc in registry.event_types().await? {
        if registry.table_exists(&desc.table_name).await? {
            tables.push((desc.table_name, TableKind::Event));
        }
    }
    Ok(tables)
}
