use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use dbvault_core::fixture::{as_blob, blob_value};
use dbvault_core::{BackupKind, EngineError, ForeignKeySpec, RowRecord, TableSpec};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags, OptionalExtension};
use serde_json::{Number, Value};

use crate::registry::{json_key, portable_row, quote_ident, Backupable, ReferenceMaps};

/// A table in a SQLite target. Each call opens its own connection on the
/// blocking pool.
pub struct SqliteTable {
    db_path: PathBuf,
    spec: Arc<TableSpec>,
}

impl SqliteTable {
    pub fn new(db_path: impl Into<PathBuf>, spec: TableSpec) -> Self {
        Self {
            db_path: db_path.into(),
            spec: Arc::new(spec),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection, &TableSpec) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = self.db_path.clone();
        let spec = Arc::clone(&self.spec);
        tokio::task::spawn_blocking(move || {
            let mut conn = open_target(&db_path)?;
            f(&mut conn, &spec)
        })
        .await?
    }
}

/// Opens an existing target database; a missing file is a connection error.
pub(crate) fn open_target(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| EngineError::ConnectionError(format!("{}: {e}", path.display())))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

#[async_trait]
impl Backupable for SqliteTable {
    fn table(&self) -> &str {
        &self.spec.name
    }

    fn kind(&self) -> BackupKind {
        self.spec.kind
    }

    async fn list_rows(&self) -> Result<Vec<RowRecord>> {
        self.blocking(|conn, spec| read_rows(conn, spec)).await
    }

    async fn apply_row(&self, row: &RowRecord) -> Result<()> {
        let row = row.clone();
        self.blocking(move |conn, spec| apply_row(conn, spec, &row))
            .await
    }

    async fn clear(&self) -> Result<u64> {
        self.blocking(|conn, spec| {
            let n = conn
                .execute(&format!("DELETE FROM {}", quote_ident(&spec.name)), [])
                .with_context(|| format!("clear table {}", spec.name))?;
            Ok(n as u64)
        })
        .await
    }
}

fn read_rows(conn: &Connection, spec: &TableSpec) -> Result<Vec<RowRecord>> {
    let mut references = ReferenceMaps::new();
    for fk in &spec.foreign_keys {
        references.insert(fk.column.clone(), reference_map(conn, fk)?);
    }

    let sql = format!(
        "SELECT * FROM {} ORDER BY {}",
        quote_ident(&spec.name),
        quote_ident(&spec.id_column)
    );
    let mut stmt = conn
        .prepare(&sql)
        .with_context(|| format!("read table {}", spec.name))?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_owned).collect();

    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for (idx, column) in columns.iter().enumerate() {
            values.push((column.clone(), to_json(row.get_ref(idx)?)));
        }
        out.push(portable_row(spec, values, &references));
    }
    Ok(out)
}

fn reference_map(conn: &Connection, fk: &ForeignKeySpec) -> Result<HashMap<String, Value>> {
    let sql = format!(
        "SELECT {}, {} FROM {}",
        quote_ident(&fk.id_column),
        quote_ident(&fk.key_column),
        quote_ident(&fk.table)
    );
    let mut stmt = conn
        .prepare(&sql)
        .with_context(|| format!("read references from {}", fk.table))?;
    let mut rows = stmt.query([])?;
    let mut map = HashMap::new();
    while let Some(row) = rows.next()? {
        map.insert(json_key(&to_json(row.get_ref(0)?)), to_json(row.get_ref(1)?));
    }
    Ok(map)
}

fn apply_row(conn: &mut Connection, spec: &TableSpec, row: &RowRecord) -> Result<()> {
    if row.table != spec.name {
        bail!("row belongs to {}, not {}", row.table, spec.name);
    }
    let tx = conn.transaction()?;

    let mut columns = Vec::new();
    let mut values = Vec::new();
    for (column, value) in row.columns() {
        let value = match spec.foreign_key(&column) {
            Some(fk) if !value.is_null() => resolve_reference(&tx, fk, &value)?,
            _ => to_sql(&value),
        };
        columns.push(column);
        values.push(value);
    }

    let keys = spec.key_columns();
    let mut key_values = Vec::new();
    let mut conditions = Vec::new();
    for key in &keys {
        let idx = columns
            .iter()
            .position(|c| c == key)
            .ok_or_else(|| anyhow!("row has no value for key column {key}"))?;
        key_values.push(values[idx].clone());
    }

    // Update in place; an existing row's surrogate id never changes.
    let mut assignments = Vec::new();
    let mut params = Vec::new();
    for (column, value) in columns.iter().zip(&values) {
        if !keys.contains(column) {
            params.push(value.clone());
            assignments.push(format!("{} = ?{}", quote_ident(column), params.len()));
        }
    }
    for (key, value) in keys.iter().zip(&key_values) {
        params.push(value.clone());
        conditions.push(format!("{} IS ?{}", quote_ident(key), params.len()));
    }
    let exists = if assignments.is_empty() {
        let sql = format!(
            "SELECT 1 FROM {} WHERE {} LIMIT 1",
            quote_ident(&spec.name),
            conditions.join(" AND ")
        );
        tx.query_row(&sql, params_from_iter(params.iter()), |_| Ok(()))
            .optional()?
            .is_some()
    } else {
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(&spec.name),
            assignments.join(", "),
            conditions.join(" AND ")
        );
        tx.execute(&sql, params_from_iter(params.iter()))? > 0
    };

    if !exists {
        let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        tx.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(&spec.name),
                names.join(", "),
                placeholders.join(", ")
            ),
            params_from_iter(values.iter()),
        )?;
    }
    tx.commit()?;
    Ok(())
}

fn resolve_reference(conn: &Connection, fk: &ForeignKeySpec, key: &Value) -> Result<SqlValue> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1 LIMIT 1",
        quote_ident(&fk.id_column),
        quote_ident(&fk.table),
        quote_ident(&fk.key_column)
    );
    conn.query_row(&sql, [to_sql(key)], |r| r.get::<_, SqlValue>(0))
        .optional()?
        .ok_or_else(|| anyhow!("unresolved reference {}.{}={}", fk.table, fk.key_column, json_key(key)))
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => blob_value(b),
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(s) => SqlValue::Text(s.clone()),
        other => match as_blob(other) {
            Some(bytes) => SqlValue::Blob(bytes),
            None => SqlValue::Text(other.to_string()),
        },
    }
}
