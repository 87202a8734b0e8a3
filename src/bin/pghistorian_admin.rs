//! pghistorian-admin: administrative tool for historian databases.
//!
//! ## Configuration
//! - `--config`: YAML file with [`AdminConfig`] fields (optional)
//! - `PGHISTORIAN_ADMIN__*`: environment overrides, e.g.
//!   `PGHISTORIAN_ADMIN__SUPERUSER_PASSWORD`
//! - `PGHISTORIAN_LOG`: log filter (default: info)

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use pghistorian::admin::{BackupFormat, BackupOptions, DatabaseManager};
use pghistorian::config::AdminConfig;
use pghistorian::utils::bootstrap::init_tracing;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Parser)]
#[command(author, version, about = "Administration of pghistorian databases")]
struct Cli {
    /// Admin configuration file (YAML).
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the historian role and database, migrate, write the encrypted config.
    CreateDb,
    /// Dump the historian database.
    Backup {
        #[arg(long)]
        output: PathBuf,
        /// custom, plain, directory or tar.
        #[arg(long, default_value_t = BackupFormat::Custom)]
        format: BackupFormat,
        /// Compression level 0-9.
        #[arg(long)]
        compress: Option<u8>,
    },
    /// Restore a dump produced by `backup`.
    Restore {
        #[arg(long)]
        input: PathBuf,
        /// Remove existing objects before restoring.
        #[arg(long, default_value_t = false)]
        drop_existing: bool,
    },
    /// Apply schema migrations.
    Migrate {
        /// Target version (latest when omitted).
        #[arg(long)]
        to: Option<i64>,
    },
    /// Delete history older than the given number of days.
    Cleanup {
        #[arg(long)]
        older_than_days: u64,
    },
    /// Drop the tables of the given nodes.
    RemoveNodes {
        #[arg(required = true)]
        node_ids: Vec<String>,
    },
    /// Empty every history table.
    Clear {
        /// Confirm the wipe.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Show database size, registrations and schema version.
    Info,
    /// Write the decrypted connection config as JSON.
    ExportConfig {
        #[arg(long)]
        output: PathBuf,
    },
    /// Encrypt a JSON connection config into the config file.
    ImportConfig {
        #[arg(long)]
        input: PathBuf,
    },
    /// Re-encrypt the config file under a new master password.
    RotatePassword {
        #[arg(long, env = "PGHISTORIAN_ADMIN_NEW_MASTER_PASSWORD", hide_env_values = true)]
        new_password: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();
    let manager = DatabaseManager::new(AdminConfig::load(cli.config.as_deref())?);

    match cli.command {
        Command::CreateDb => {
            let created = manager.create_database().await?;
            info!(
                created_role = created.created_role,
                created_database = created.created_database,
                schema_version = created.schema_version,
                config_file = ?created.config_file,
                "Database ready"
            );
        }
        Command::Backup {
            output,
            format,
            compress,
        } => {
            let options = BackupOptions {
                format,
                compression: compress,
            };
            manager.backup(&output, &options).await?;
        }
        Command::Restore {
            input,
            drop_existing,
        } => {
            manager.restore(&input, drop_existing).await?;
        }
        Command::Migrate { to } => {
            let version = manager.migrate_to(to).await?;
            info!(version, "Schema version");
        }
        Command::Cleanup { older_than_days } => {
            let age = Duration::from_secs(older_than_days.saturating_mul(SECONDS_PER_DAY));
            let removed = manager.cleanup_older_than(age).await?;
            info!(removed, "Rows removed");
        }
        Command::RemoveNodes { node_ids } => {
            let ids: Vec<&str> = node_ids.iter().map(String::as_str).collect();
            let removed = manager.remove_node_tables(&ids).await?;
            info!(removed, "Nodes removed");
        }
        Command::Clear { yes } => {
            if !yes {
                return Err("refusing to clear all data without --yes".into());
            }
            manager.clear_all_data().await?;
        }
        Command::Info => {
            let db = manager.database_info().await?;
            println!("database:        {}", db.database);
            println!("size:            {} bytes", db.size_bytes);
            println!("nodes:           {}", db.node_count);
            println!("event types:     {}", db.event_type_count);
            println!("schema version:  {} (latest {})", db.schema_version, db.latest_version);
        }
        Command::ExportConfig { output } => {
            manager.export_config(&output).await?;
        }
        Command::ImportConfig { input } => {
            manager.import_config(&input).await?;
        }
        Command::RotatePassword { new_password } => {
            manager.rotate_master_password(&new_password)?;
        }
    }
    Ok(())
}
