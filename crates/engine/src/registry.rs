use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dbvault_core::{is_protected_table, BackupKind, RowRecord, TableSpec, Target, TargetConnection};
use serde_json::{Map, Value};

use crate::postgres_table::{self, PostgresTable};
use crate::sqlite_table::SqliteTable;

/// A table whose rows can be serialized to fixtures and applied back.
#[async_trait]
pub trait Backupable: Send + Sync {
    fn table(&self) -> &str;

    fn kind(&self) -> BackupKind;

    /// Every row, in id order, with foreign keys replaced by natural keys.
    async fn list_rows(&self) -> Result<Vec<RowRecord>>;

    /// Upserts one row by natural key in its own transaction.
    async fn apply_row(&self, row: &RowRecord) -> Result<()>;

    /// Deletes every row; returns the number removed.
    async fn clear(&self) -> Result<u64>;
}

/// Backupable tables of one target, in registration order (parents first).
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    tables: Vec<Arc<dyn Backupable>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the registry from the target's table specs.
    pub fn for_target(target: &Target) -> Self {
        let mut registry = Self::new();
        match &target.connection {
            TargetConnection::Sqlite { path, .. } => {
                for spec in &target.tables {
                    registry.register(Arc::new(SqliteTable::new(path.clone(), spec.clone())));
                }
            }
            TargetConnection::Postgres(conn) => {
                let pool = postgres_table::lazy_pool(conn);
                for spec in &target.tables {
                    registry.register(Arc::new(PostgresTable::new(pool.clone(), spec.clone())));
                }
            }
        }
        registry
    }

    /// Protected tables are refused.
    pub fn register(&mut self, table: Arc<dyn Backupable>) {
        if is_protected_table(table.table()) {
            tracing::warn!(table = table.table(), "refusing to register protected table");
            return;
        }
        self.tables.push(table);
    }

    pub fn for_kind(&self, kind: BackupKind) -> Vec<Arc<dyn Backupable>> {
        self.tables
            .iter()
            .filter(|t| kind.covers(t.kind()))
            .cloned()
            .collect()
    }

    pub fn table_names(&self, kind: BackupKind) -> Vec<String> {
        self.for_kind(kind)
            .iter()
            .map(|t| t.table().to_owned())
            .collect()
    }

    pub fn get(&self, table: &str) -> Option<Arc<dyn Backupable>> {
        self.tables.iter().find(|t| t.table() == table).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Double-quotes an identifier, keeping schema qualification.
pub(crate) fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Map key for a referenced id, independent of its JSON type.
pub(crate) fn json_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Referenced id -> referenced natural key, per foreign key column.
pub(crate) type ReferenceMaps = HashMap<String, HashMap<String, Value>>;

/// Splits a raw column map into a portable record: key columns into the
/// natural key, surrogate id dropped when a natural key exists, foreign keys
/// swapped for the referenced row's natural key.
pub(crate) fn portable_row(
    spec: &TableSpec,
    columns: impl IntoIterator<Item = (String, Value)>,
    references: &ReferenceMaps,
) -> RowRecord {
    let key_columns = spec.key_columns();
    let mut natural_key = Map::new();
    let mut fields = Map::new();
    for (column, mut value) in columns {
        if let Some(map) = references.get(&column) {
            if !value.is_null() {
                value = match map.get(&json_key(&value)) {
                    Some(key) => key.clone(),
                    None => {
                        tracing::warn!(
                            table = %spec.name,
                            column = %column,
                            value = %value,
                            "dangling reference written as null"
                        );
                        Value::Null
                    }
                };
            }
        }
        if key_columns.contains(&column) {
            natural_key.insert(column, value);
        } else if column == spec.id_column && !spec.keeps_id() {
            continue;
        } else {
            fields.insert(column, value);
        }
    }
    RowRecord {
        table: spec.name.clone(),
        natural_key,
        fields,
    }
}
