use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dbvault_core::Target;
use dbvault_engine::ToolConfig;
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub tools: ToolConfig,
    pub security: SecurityConfig,
    pub targets: Vec<Target>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub root: Option<String>,
    pub retention_days: Option<u32>,
    pub database_url: Option<String>,
    /// Finished artifacts are copied here when set.
    pub mirror_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    pub api_token: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("parsing config file {path:?}"))?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.id.trim().is_empty() {
                bail!("target with empty id");
            }
            if !seen.insert(target.id.as_str()) {
                bail!("duplicate target id {:?}", target.id);
            }
        }
        if self.scheduler.tick_secs == 0 {
            bail!("scheduler.tick_secs must be positive");
        }
        Ok(())
    }
}

/// Effective settings after environment overrides.
#[derive(Debug, Clone)]
pub struct Settings {
    pub root: PathBuf,
    pub listen: String,
    pub database_url: Option<String>,
    pub api_token: Option<String>,
    pub retention_days: Option<u32>,
    pub mirror_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub tick: Duration,
}

impl Settings {
    /// `env` looks up a variable; the daemon passes `std::env::var(..).ok()`.
    pub fn resolve(cfg: &Config, env: impl Fn(&str) -> Option<String>) -> Self {
        let root = env("DBVAULT_ROOT")
            .or_else(|| cfg.storage.root.clone())
            .unwrap_or_else(|| "./data".to_owned());

        let listen = env("DBVAULT_LISTEN")
            .or_else(|| cfg.server.listen.clone())
            .unwrap_or_else(|| "127.0.0.1:8089".to_owned());

        let database_url = env("DATABASE_URL").or_else(|| cfg.storage.database_url.clone());

        let api_token = env("DBVAULT_API_TOKEN")
            .or_else(|| cfg.security.api_token.clone())
            .filter(|t| !t.is_empty());

        let retention_days = match env("DBVAULT_RETENTION_DAYS") {
            Some(raw) => match raw.parse::<u32>() {
                Ok(days) => Some(days),
                Err(_) => {
                    tracing::warn!(value = %raw, "ignoring invalid DBVAULT_RETENTION_DAYS");
                    cfg.storage.retention_days
                }
            },
            None => cfg.storage.retention_days,
        };

        Self {
            root: PathBuf::from(root),
            listen,
            database_url,
            api_token,
            retention_days,
            mirror_dir: cfg.storage.mirror_dir.as_ref().map(PathBuf::from),
            scheduler_enabled: cfg.scheduler.enabled,
            tick: Duration::from_secs(cfg.scheduler.tick_secs.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use dbvault_core::{BackupKind, TargetConnection};

    use super::*;

    const SAMPLE: &str = r#"
[server]
listen = "0.0.0.0:9000"

[storage]
root = "/var/lib/dbvault"
retention_days = 30

[tools]
pg_dump = "/usr/lib/postgresql/16/bin/pg_dump"
timeout_secs = 600

[[targets]]
id = "shop"
engine = "sqlite"
path = "/srv/shop.db"
snapshot_file = true

[[targets.tables]]
name = "customers"
kind = "customers"
natural_key = ["code"]

[[targets.tables]]
name = "orders"
kind = "customers"
natural_key = ["number"]
foreign_keys = [{ column = "customer_id", table = "customers", key_column = "code" }]

[[targets]]
id = "crm"
engine = "postgres"
host = "db.internal"
user = "backup"
database = "crm"
"#;

    #[test]
    fn parses_targets_and_sections() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.targets.len(), 2);

        let shop = &cfg.targets[0];
        assert!(matches!(
            &shop.connection,
            TargetConnection::Sqlite { snapshot_file: true, .. }
        ));
        assert_eq!(shop.tables[1].kind, BackupKind::Customers);
        assert_eq!(shop.tables[1].foreign_keys[0].id_column, "id");

        match &cfg.targets[1].connection {
            TargetConnection::Postgres(conn) => {
                assert_eq!(conn.port, 5432);
                assert!(conn.password.is_none());
            }
            other => panic!("expected postgres, got {other:?}"),
        }
        assert_eq!(cfg.tools.timeout_secs, 600);
        assert_eq!(cfg.tools.psql, "psql");
        assert_eq!(cfg.scheduler.tick_secs, 60);
    }

    #[test]
    fn environment_overrides_file() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = [
            ("DBVAULT_ROOT", "/tmp/vault"),
            ("DBVAULT_RETENTION_DAYS", "7"),
            ("DBVAULT_API_TOKEN", "t0ken"),
        ]
        .into_iter()
        .collect();
        let settings = Settings::resolve(&cfg, |key| env.get(key).map(|v| (*v).to_owned()));
        assert_eq!(settings.root, PathBuf::from("/tmp/vault"));
        assert_eq!(settings.listen, "0.0.0.0:9000");
        assert_eq!(settings.retention_days, Some(7));
        assert_eq!(settings.api_token.as_deref(), Some("t0ken"));
        assert!(settings.database_url.is_none());
    }

    #[test]
    fn invalid_retention_override_keeps_file_value() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        let settings = Settings::resolve(&cfg, |key| {
            (key == "DBVAULT_RETENTION_DAYS").then(|| "forever".to_owned())
        });
        assert_eq!(settings.retention_days, Some(30));
    }

    #[test]
    fn duplicate_target_ids_are_rejected() {
        let doubled = format!("{SAMPLE}\n[[targets]]\nid = \"shop\"\nengine = \"sqlite\"\npath = \"/x.db\"\n");
        let cfg: Config = toml::from_str(&doubled).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_file_uses_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        let settings = Settings::resolve(&cfg, |_| None);
        assert_eq!(settings.root, PathBuf::from("./data"));
        assert!(settings.scheduler_enabled);
        assert!(cfg.targets.is_empty());
    }
}
