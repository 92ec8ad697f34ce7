use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use dbvault_core::fixture::as_blob;
use dbvault_core::{BackupKind, EngineError, PgConnection, RowRecord, TableSpec};
use serde_json::{Map, Value};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use crate::registry::{portable_row, quote_ident, Backupable, ReferenceMaps};

/// Pool that connects on first use, so an unreachable target only fails the
/// operations that touch it.
pub fn lazy_pool(conn: &PgConnection) -> PgPool {
    let mut options = PgConnectOptions::new()
        .host(&conn.host)
        .port(conn.port)
        .username(&conn.user)
        .database(&conn.database);
    if let Some(password) = &conn.password {
        options = options.password(password);
    }
    PgPoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(10))
        .connect_lazy_with(options)
}

/// A table in a Postgres target. Rows travel as JSON so column types are left
/// to the server.
pub struct PostgresTable {
    pool: PgPool,
    spec: TableSpec,
}

impl PostgresTable {
    pub fn new(pool: PgPool, spec: TableSpec) -> Self {
        Self { pool, spec }
    }

    async fn reference_maps(&self) -> Result<ReferenceMaps> {
        let mut maps = ReferenceMaps::new();
        for fk in &self.spec.foreign_keys {
            let sql = format!(
                "SELECT {}::text, to_jsonb({})::text FROM {}",
                quote_ident(&fk.id_column),
                quote_ident(&fk.key_column),
                quote_ident(&fk.table)
            );
            let rows: Vec<(String, String)> = sqlx::query_as(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)
                .with_context(|| format!("read references from {}", fk.table))?;
            let map: HashMap<String, Value> = rows
                .into_iter()
                .map(|(id, key)| (id, serde_json::from_str(&key).unwrap_or(Value::Null)))
                .collect();
            maps.insert(fk.column.clone(), map);
        }
        Ok(maps)
    }
}

fn db_err(err: sqlx::Error) -> anyhow::Error {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => EngineError::ConnectionError(err.to_string()).into(),
        other => other.into(),
    }
}

/// Blob markers become bytea hex literals.
fn to_pg_json(mut columns: Map<String, Value>) -> Map<String, Value> {
    for value in columns.values_mut() {
        if let Some(bytes) = as_blob(value) {
            *value = Value::String(format!("\\x{}", hex::encode(bytes)));
        }
    }
    columns
}

#[async_trait]
impl Backupable for PostgresTable {
    fn table(&self) -> &str {
        &self.spec.name
    }

    fn kind(&self) -> BackupKind {
        self.spec.kind
    }

    async fn list_rows(&self) -> Result<Vec<RowRecord>> {
        let references = self.reference_maps().await?;
        let sql = format!(
            "SELECT row_to_json(t)::text FROM {} t ORDER BY t.{}",
            quote_ident(&self.spec.name),
            quote_ident(&self.spec.id_column)
        );
        let rows: Vec<(String,)> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
            .with_context(|| format!("read table {}", self.spec.name))?;

        rows.into_iter()
            .map(|(raw,)| {
                let columns: Map<String, Value> = serde_json::from_str(&raw)
                    .map_err(|e| EngineError::SerializationError(e.to_string()))?;
                Ok(portable_row(&self.spec, columns, &references))
            })
            .collect()
    }

    async fn apply_row(&self, row: &RowRecord) -> Result<()> {
        if row.table != self.spec.name {
            bail!("row belongs to {}, not {}", row.table, self.spec.name);
        }
        let table = quote_ident(&self.spec.name);
        let mut columns = row.columns();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for fk in &self.spec.foreign_keys {
            let Some(key) = columns.get(&fk.column).filter(|v| !v.is_null()).cloned() else {
                continue;
            };
            let sql = format!(
                "SELECT to_jsonb({})::text FROM {} WHERE to_jsonb({}) = $1::jsonb LIMIT 1",
                quote_ident(&fk.id_column),
                quote_ident(&fk.table),
                quote_ident(&fk.key_column)
            );
            let found: Option<(String,)> = sqlx::query_as(&sql)
                .bind(key.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
            let (id,) = found.ok_or_else(|| {
                anyhow!("unresolved reference {}.{}={}", fk.table, fk.key_column, key)
            })?;
            columns.insert(fk.column.clone(), serde_json::from_str(&id)?);
        }

        let keys = self.spec.key_columns();
        let mut key_values = Vec::new();
        for key in &keys {
            let value = columns
                .get(key)
                .ok_or_else(|| anyhow!("row has no value for key column {key}"))?;
            key_values.push(value.to_string());
        }
        let assignments: Vec<String> = columns
            .keys()
            .filter(|c| !keys.contains(*c))
            .map(|c| format!("{0} = r.{0}", quote_ident(c)))
            .collect();
        // Key values follow the record parameter when there is one.
        let first_key = if assignments.is_empty() { 1 } else { 2 };
        let conditions: Vec<String> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| format!("to_jsonb({table}.{}) = ${}::jsonb", quote_ident(k), i + first_key))
            .collect();
        let conditions = conditions.join(" AND ");

        let columns = to_pg_json(columns);
        let record = Value::Object(columns.clone()).to_string();
        let sql = if assignments.is_empty() {
            format!("SELECT 1 FROM {table} WHERE {conditions}")
        } else {
            format!(
                "WITH updated AS (UPDATE {table} SET {} FROM json_populate_record(NULL::{table}, $1::json) r \
                 WHERE {conditions} RETURNING 1) SELECT 1 FROM updated",
                assignments.join(", ")
            )
        };
        let mut query = sqlx::query_scalar::<_, i32>(&sql);
        if !assignments.is_empty() {
            query = query.bind(record.clone());
        }
        for value in &key_values {
            query = query.bind(value.clone());
        }
        let matched = !query.fetch_all(&mut *tx).await.map_err(db_err)?.is_empty();

        if !matched {
            let names: Vec<String> = columns.keys().map(|c| quote_ident(c)).collect();
            let names = names.join(", ");
            let insert = format!(
                "INSERT INTO {table} ({names}) SELECT {names} FROM json_populate_record(NULL::{table}, $1::json)"
            );
            sqlx::query(&insert)
                .bind(record)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn clear(&self) -> Result<u64> {
        let done = sqlx::query(&format!("DELETE FROM {}", quote_ident(&self.spec.name)))
            .execute(&self.pool)
            .await
            .map_err(db_err)
            .with_context(|| format!("clear table {}", self.spec.name))?;
        Ok(done.rows_affected())
    }
}
