use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which slice of a target a backup covers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Customers,
    Users,
    Settings,
    Full,
}

impl BackupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Customers => "customers",
            Self::Users => "users",
            Self::Settings => "settings",
            Self::Full => "full",
        }
    }

    /// A table tagged `table_kind` belongs to a backup of `self`.
    pub fn covers(self, table_kind: BackupKind) -> bool {
        self == Self::Full || self == table_kind
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BackupFormat {
    NativeDump,
    JsonFixture,
    JsonFixtureGzip,
    SqlText,
    SqliteFile,
    Unknown,
}

impl BackupFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NativeDump => "native-dump",
            Self::JsonFixture => "json-fixture",
            Self::JsonFixtureGzip => "json-fixture-gzip",
            Self::SqlText => "sql-text",
            Self::SqliteFile => "sqlite-file",
            Self::Unknown => "unknown",
        }
    }

    /// File extension used for artifacts written in this format.
    pub fn extension(self) -> &'static str {
        match self {
            Self::NativeDump => "dump",
            Self::JsonFixture => "json",
            Self::JsonFixtureGzip => "json.gz",
            Self::SqlText => "sql",
            Self::SqliteFile => "sqlite3",
            Self::Unknown => "bin",
        }
    }

    pub fn is_fixture(self) -> bool {
        matches!(self, Self::JsonFixture | Self::JsonFixtureGzip)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Restored,
}

impl BackupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Restored => "restored",
        }
    }

    /// Statuses whose record points at a complete, verified artifact.
    pub fn has_artifact(self) -> bool {
        matches!(self, Self::Success | Self::Restored)
    }
}

macro_rules! str_enum {
    ($ty:ident, $name:literal, [$($variant:ident),+]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                $(
                    if raw.eq_ignore_ascii_case($ty::$variant.as_str()) {
                        return Ok($ty::$variant);
                    }
                )+
                Err(format!("unknown {}: {raw}", $name))
            }
        }
    };
}

str_enum!(BackupKind, "backup kind", [Customers, Users, Settings, Full]);
str_enum!(
    BackupFormat,
    "backup format",
    [NativeDump, JsonFixture, JsonFixtureGzip, SqlText, SqliteFile, Unknown]
);
str_enum!(
    BackupStatus,
    "backup status",
    [Pending, InProgress, Success, Failed, Restored]
);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: Uuid,
    pub name: String,
    pub target_id: String,
    pub kind: BackupKind,
    pub format: BackupFormat,
    pub file_path: Option<PathBuf>,
    pub size_bytes: i64,
    pub checksum: Option<String>,
    pub is_scheduled: bool,
    pub status: BackupStatus,
    pub strategy: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
}

impl BackupRecord {
    /// A record for a creation attempt that has just started.
    pub fn in_progress(
        name: String,
        target_id: String,
        kind: BackupKind,
        is_scheduled: bool,
        created_by: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            target_id,
            kind,
            format: BackupFormat::Unknown,
            file_path: None,
            size_bytes: 0,
            checksum: None,
            is_scheduled,
            status: BackupStatus::InProgress,
            strategy: None,
            error_message: None,
            created_at,
            created_by,
        }
    }

    /// Attach a fully written and closed artifact.
    pub fn complete(
        &mut self,
        format: BackupFormat,
        strategy: &str,
        file_path: PathBuf,
        size_bytes: u64,
        checksum: String,
    ) {
        self.format = format;
        self.strategy = Some(strategy.to_owned());
        self.file_path = Some(file_path);
        self.size_bytes = i64::try_from(size_bytes).unwrap_or(i64::MAX);
        self.checksum = Some(checksum);
        self.status = BackupStatus::Success;
        self.error_message = None;
    }

    pub fn fail(&mut self, message: String) {
        self.file_path = None;
        self.size_bytes = 0;
        self.checksum = None;
        self.status = BackupStatus::Failed;
        self.error_message = Some(message);
    }
}

/// Audit entry written after every successful restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreEvent {
    pub id: Uuid,
    /// `None` when the artifact was uploaded rather than taken from the catalog.
    pub backup_id: Option<Uuid>,
    pub target_id: String,
    pub format: BackupFormat,
    pub strategy: String,
    pub success_count: i64,
    pub error_count: i64,
    pub created_at: DateTime<Utc>,
}
