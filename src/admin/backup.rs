//! Backup and restore through the PostgreSQL client tools.

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::AdminConfig;
use crate::error::{HistoryError, Result};

/// Leading bytes of a `pg_dump` custom-format archive.
const ARCHIVE_MAGIC: &[u8] = b"PGDMP";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

/// Run ahead of a SQL script restore that replaces existing objects.
const RESET_SCHEMA: &str = "DROP SCHEMA IF EXISTS public CASCADE; CREATE SCHEMA public;";

/// `pg_dump` output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackupFormat {
    /// Compressed archive, restored with `pg_restore`.
    #[default]
    Custom,
    /// Plain SQL script, restored with `psql`.
    Plain,
    Directory,
    Tar,
}

impl BackupFormat {
    fn flag(self) -> &'static str {
        match self {
            BackupFormat::Custom => "c",
            BackupFormat::Plain => "p",
            BackupFormat::Directory => "d",
            BackupFormat::Tar => "t",
        }
    }
}

impl fmt::Display for BackupFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupFormat::Custom => "custom",
            BackupFormat::Plain => "plain",
            BackupFormat::Directory => "directory",
            BackupFormat::Tar => "tar",
        };
        f.write_str(name)
    }
}

impl FromStr for BackupFormat {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "custom" | "c" => Ok(BackupFormat::Custom),
            "plain" | "p" | "sql" => Ok(BackupFormat::Plain),
            "directory" | "d" => Ok(BackupFormat::Directory),
            "tar" | "t" => Ok(BackupFormat::Tar),
            other => Err(HistoryError::Validation(format!(
                "unknown backup format: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackupOptions {
    pub format: BackupFormat,
    /// 0-9; `None` keeps the `pg_dump` default for the format.
    pub compression: Option<u8>,
}

impl BackupOptions {
    pub fn validate(&self) -> Result<()> {
        match self.compression {
            Some(level) if level > 9 => Err(HistoryError::Validation(format!(
                "compression level must be 0-9, got {level}"
            ))),
            Some(level) if level > 0 && self.format == BackupFormat::Plain => {
                Err(HistoryError::Validation(
                    "compressed plain dumps cannot be restored; use the custom format".into(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// How a backup on disk is restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreTool {
    PgRestore,
    Psql,
}

/// Pick the restore tool from what is on disk.
pub async fn detect_restore_tool(path: &Path) -> Result<RestoreTool> {
    let metadata = tokio::fs::metadata(path).await?;
    if metadata.is_dir() {
        return Ok(RestoreTool::PgRestore);
    }
    let mut header = [0u8; 512];
    let mut file = tokio::fs::File::open(path).await?;
    let read = file.read(&mut header).await?;
    let header = &header[..read];

    if header.starts_with(ARCHIVE_MAGIC) {
        Ok(RestoreTool::PgRestore)
    } else if header.starts_with(GZIP_MAGIC) {
        Err(HistoryError::Backup(format!(
            "{} is a gzip-compressed SQL script; decompress it first",
            path.display()
        )))
    } else if is_tar(header) {
        Ok(RestoreTool::PgRestore)
    } else {
        Ok(RestoreTool::Psql)
    }
}

fn is_tar(header: &[u8]) -> bool {
    header.len() >= 262 && &header[257..262] == b"ustar"
}

fn base_command(program: &str, config: &AdminConfig) -> Command {
    let mut cmd = Command::new(program);
    cmd.env("PGPASSWORD", &config.password)
        .arg("--host")
        .arg(&config.host)
        .arg("--port")
        .arg(config.port.to_string())
        .arg("--username")
        .arg(&config.user)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

pub fn dump_command(config: &AdminConfig, path: &Path, options: &BackupOptions) -> Command {
    let mut cmd = base_command(&config.pg_dump, config);
    cmd.arg("--dbname")
        .arg(&config.database)
        .arg("--format")
        .arg(options.format.flag())
        .arg("--no-password")
        .arg("--file")
        .arg(path);
    if let Some(level) = options.compression {
        cmd.arg("--compress").arg(level.to_string());
    }
    cmd
}

pub fn restore_command(
    config: &AdminConfig,
    path: &Path,
    tool: RestoreTool,
    drop_existing: bool,
) -> Command {
    match tool {
        RestoreTool::PgRestore => {
            let mut cmd = base_command(&config.pg_restore, config);
            cmd.arg("--dbname")
                .arg(&config.database)
                .arg("--no-password")
                .arg("--single-transaction");
            if drop_existing {
                cmd.arg("--clean").arg("--if-exists");
            }
            cmd.arg("--no-owner").arg(path);
            cmd
        }
        // The schema reset and the script share one transaction, so a failing
        // script rolls the reset back too.
        RestoreTool::Psql => {
            let mut cmd = base_command(&config.psql, config);
            cmd.arg("--dbname")
                .arg(&config.database)
                .arg("--no-password")
                .arg("--set")
                .arg("ON_ERROR_STOP=1")
                .arg("--single-transaction");
            if drop_existing {
                cmd.arg("--command").arg(RESET_SCHEMA);
            }
            cmd.arg("--file").arg(path);
            cmd
        }
    }
}

/// Run a client tool to completion, surfacing its stderr on failure.
pub async fn run(mut cmd: Command) -> Result<()> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let output = cmd.output().await.map_err(|e| {
        HistoryError::Backup(format!("failed to start {program}: {e}"))
    })?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        return Err(HistoryError::Backup(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    if !stderr.trim().is_empty() {
        warn!(program = %program, stderr = %stderr.trim(), "Client tool reported warnings");
    }
    Ok(())
}

pub async fn backup(config: &AdminConfig, path: &Path, options: &BackupOptions) -> Result<()> {
    options.validate()?;
    run(dump_command(config, path, options)).await?;
    info!(path = %path.display(), format = %options.format, "Backup written");
    Ok(())
}
