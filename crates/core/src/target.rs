use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::backup::BackupKind;

/// Tables that hold credentials or sessions. They are never serialized,
/// cleared or restored in bulk.
pub const PROTECTED_TABLES: &[&str] = &[
    "auth_user",
    "auth_group",
    "auth_permission",
    "auth_user_groups",
    "auth_user_user_permissions",
    "authtoken_token",
    "django_session",
    "django_migrations",
    "django_content_type",
    "sessions",
    "credentials",
];

pub fn is_protected_table(name: &str) -> bool {
    PROTECTED_TABLES
        .iter()
        .any(|protected| protected.eq_ignore_ascii_case(name))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TargetEngine {
    Postgres,
    Sqlite,
}

impl fmt::Display for TargetEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        })
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct PgConnection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    pub database: String,
}

fn default_host() -> String {
    "localhost".to_owned()
}

fn default_port() -> u16 {
    5432
}

impl fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum TargetConnection {
    Postgres(PgConnection),
    Sqlite {
        path: PathBuf,
        /// Full backups copy the database file with the online-backup API
        /// before falling back to fixtures.
        #[serde(default)]
        snapshot_file: bool,
    },
}

/// A datastore that can be backed up and restored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    #[serde(flatten)]
    pub connection: TargetConnection,
    #[serde(default)]
    pub tables: Vec<TableSpec>,
}

impl Target {
    pub fn engine(&self) -> TargetEngine {
        match self.connection {
            TargetConnection::Postgres(_) => TargetEngine::Postgres,
            TargetConnection::Sqlite { .. } => TargetEngine::Sqlite,
        }
    }
}

/// Describes one backupable table: which backup kind it belongs to and how its
/// rows are identified independently of surrogate ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub kind: BackupKind,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    /// Columns forming the natural key. Empty means the id column is the key.
    #[serde(default)]
    pub natural_key: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeySpec>,
}

fn default_id_column() -> String {
    "id".to_owned()
}

impl TableSpec {
    pub fn new(name: &str, kind: BackupKind, natural_key: &[&str]) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            id_column: default_id_column(),
            natural_key: natural_key.iter().map(|c| (*c).to_owned()).collect(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_foreign_key(mut self, column: &str, table: &str, key_column: &str) -> Self {
        self.foreign_keys.push(ForeignKeySpec {
            column: column.to_owned(),
            table: table.to_owned(),
            key_column: key_column.to_owned(),
            id_column: default_id_column(),
        });
        self
    }

    /// Key columns used to identify rows in fixtures.
    pub fn key_columns(&self) -> Vec<String> {
        if self.natural_key.is_empty() {
            vec![self.id_column.clone()]
        } else {
            self.natural_key.clone()
        }
    }

    /// Surrogate ids are dropped from fixtures once a natural key exists.
    pub fn keeps_id(&self) -> bool {
        self.natural_key.is_empty()
    }

    pub fn foreign_key(&self, column: &str) -> Option<&ForeignKeySpec> {
        self.foreign_keys.iter().find(|fk| fk.column == column)
    }
}

/// `column` references `table.id_column`; fixtures carry `table.key_column`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeySpec {
    pub column: String,
    pub table: String,
    pub key_column: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_password() {
        let conn = PgConnection {
            host: "db".into(),
            port: 5432,
            user: "app".into(),
            password: Some("hunter2".into()),
            database: "shop".into(),
        };
        let rendered = format!("{conn:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn protected_tables_match_case_insensitively() {
        assert!(is_protected_table("DJANGO_SESSION"));
        assert!(!is_protected_table("customers"));
    }

    #[test]
    fn table_without_natural_key_falls_back_to_id() {
        let spec = TableSpec::new("settings", BackupKind::Settings, &[]);
        assert_eq!(spec.key_columns(), vec!["id".to_string()]);
        assert!(spec.keeps_id());
    }
}
