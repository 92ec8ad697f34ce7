use std::path::Path;
use std::time::Duration;

use dbvault_core::{EngineError, PgConnection};
use serde::{Deserialize, Serialize};

use crate::process::{self, ToolCommand};

/// Locations and limits for the Postgres client tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub pg_dump: String,
    pub pg_restore: String,
    pub psql: String,
    pub timeout_secs: u64,
    /// Dumps smaller than this are treated as failed.
    pub min_dump_bytes: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            pg_dump: "pg_dump".to_owned(),
            pg_restore: "pg_restore".to_owned(),
            psql: "psql".to_owned(),
            timeout_secs: 3600,
            min_dump_bytes: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgTools {
    config: ToolConfig,
}

impl PgTools {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    fn command(&self, tool: &str, program: &str, conn: &PgConnection) -> ToolCommand {
        let mut cmd = ToolCommand::new(tool, program, Duration::from_secs(self.config.timeout_secs))
            .env("PGHOST", conn.host.clone())
            .env("PGPORT", conn.port.to_string())
            .env("PGUSER", conn.user.clone())
            .env("PGDATABASE", conn.database.clone());
        if let Some(password) = &conn.password {
            cmd = cmd.env("PGPASSWORD", password.clone());
        }
        cmd
    }

    /// Custom-format dump into `out`. `tables` restricts the dump; empty means
    /// the whole database.
    pub async fn dump(&self, conn: &PgConnection, tables: &[String], out: &Path) -> Result<u64, EngineError> {
        let mut cmd = self
            .command("pg_dump", &self.config.pg_dump, conn)
            .arg("--format=custom")
            .arg("--no-owner")
            .arg("--no-privileges");
        for table in tables {
            cmd = cmd.arg(format!("--table={table}"));
        }
        let mut file_arg = std::ffi::OsString::from("--file=");
        file_arg.push(out.as_os_str());
        process::run(&cmd.arg(file_arg)).await?;

        let size = tokio::fs::metadata(out).await.map(|m| m.len()).unwrap_or(0);
        if size < self.config.min_dump_bytes {
            return Err(EngineError::DumpTooSmall {
                size,
                min: self.config.min_dump_bytes,
            });
        }
        Ok(size)
    }

    /// Atomic restore of a custom-format dump.
    pub async fn restore(&self, conn: &PgConnection, dump: &Path) -> Result<(), EngineError> {
        let cmd = self
            .command("pg_restore", &self.config.pg_restore, conn)
            .arg("--clean")
            .arg("--if-exists")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("--single-transaction")
            .arg("--exit-on-error")
            .arg(format!("--dbname={}", conn.database))
            .arg(dump.as_os_str());
        process::run(&cmd).await.map(|_| ())
    }

    /// Runs a plain SQL script in one transaction, stopping at the first error.
    pub async fn run_script(&self, conn: &PgConnection, script: &Path) -> Result<(), EngineError> {
        let cmd = self
            .command("psql", &self.config.psql, conn)
            .arg("-v")
            .arg("ON_ERROR_STOP=1")
            .arg("--single-transaction")
            .arg("-f")
            .arg(script.as_os_str());
        process::run(&cmd).await.map(|_| ())
    }
}
