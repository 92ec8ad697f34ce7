use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use dbvault_core::{BackupKind, BackupRecord, BackupStatus, RestoreEvent, ScheduleDefinition};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::store::CatalogStore;

const BACKUP_COLUMNS: &str = "id, name, target_id, kind, format, file_path, size_bytes, checksum,
     is_scheduled, status, strategy, error_message, created_at, created_by";

const SCHEDULE_COLUMNS: &str = "id, target_id, kind, frequency, hour, minute, day_of_week,
     day_of_month, max_backups, is_active, last_run, next_run, created_at";

const EVENT_COLUMNS: &str =
    "id, backup_id, target_id, format, strategy, success_count, error_count, created_at";

/// Postgres-backed catalog.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connect to postgres")?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS backups (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                target_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                format TEXT NOT NULL,
                file_path TEXT,
                size_bytes BIGINT NOT NULL DEFAULT 0,
                checksum TEXT,
                is_scheduled BOOLEAN NOT NULL DEFAULT FALSE,
                status TEXT NOT NULL,
                strategy TEXT,
                error_message TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                created_by TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .context("create backups table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schedules (
                id UUID PRIMARY KEY,
                target_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                frequency TEXT NOT NULL,
                hour INTEGER NOT NULL,
                minute INTEGER NOT NULL,
                day_of_week INTEGER,
                day_of_month INTEGER,
                max_backups INTEGER NOT NULL,
                is_active BOOLEAN NOT NULL,
                last_run TIMESTAMPTZ,
                next_run TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("create schedules table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS restore_events (
                id UUID PRIMARY KEY,
                backup_id UUID,
                target_id TEXT NOT NULL,
                format TEXT NOT NULL,
                strategy TEXT NOT NULL,
                success_count BIGINT NOT NULL,
                error_count BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("create restore_events table")?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl CatalogStore for PostgresStore {
    async fn insert_backup(&self, record: &BackupRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO backups ({BACKUP_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        ))
        .bind(record.id)
        .bind(&record.name)
        .bind(&record.target_id)
        .bind(record.kind.as_str())
        .bind(record.format.as_str())
        .bind(path_str(record))
        .bind(record.size_bytes)
        .bind(&record.checksum)
        .bind(record.is_scheduled)
        .bind(record.status.as_str())
        .bind(&record.strategy)
        .bind(&record.error_message)
        .bind(record.created_at)
        .bind(&record.created_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_backup(&self, record: &BackupRecord) -> Result<()> {
        sqlx::query(
            "UPDATE backups SET name = $2, format = $3, file_path = $4, size_bytes = $5,
             checksum = $6, status = $7, strategy = $8, error_message = $9
             WHERE id = $1",
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(record.format.as_str())
        .bind(path_str(record))
        .bind(record.size_bytes)
        .bind(&record.checksum)
        .bind(record.status.as_str())
        .bind(&record.strategy)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_backup(&self, id: Uuid) -> Result<Option<BackupRecord>> {
        let row = sqlx::query(&format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(pg_row_to_backup).transpose()
    }

    async fn list_backups(&self, target_id: Option<&str>) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups
             WHERE $1::text IS NULL OR target_id = $1
             ORDER BY created_at DESC"
        ))
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pg_row_to_backup).collect()
    }

    async fn list_scheduled(&self, target_id: &str, kind: BackupKind) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups
             WHERE target_id = $1 AND kind = $2 AND is_scheduled AND status IN ($3, $4)
             ORDER BY created_at DESC"
        ))
        .bind(target_id)
        .bind(kind.as_str())
        .bind(BackupStatus::Success.as_str())
        .bind(BackupStatus::Restored.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pg_row_to_backup).collect()
    }

    async fn backups_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups
             WHERE created_at < $1 AND status IN ($2, $3)
             ORDER BY created_at ASC"
        ))
        .bind(cutoff)
        .bind(BackupStatus::Success.as_str())
        .bind(BackupStatus::Restored.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pg_row_to_backup).collect()
    }

    async fn delete_backup(&self, id: Uuid) -> Result<bool> {
        let done = sqlx::query("DELETE FROM backups WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn insert_restore_event(&self, event: &RestoreEvent) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO restore_events ({EVENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(event.id)
        .bind(event.backup_id)
        .bind(&event.target_id)
        .bind(event.format.as_str())
        .bind(&event.strategy)
        .bind(event.success_count)
        .bind(event.error_count)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_restore_events(&self, target_id: &str) -> Result<Vec<RestoreEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM restore_events WHERE target_id = $1
             ORDER BY created_at DESC"
        ))
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pg_row_to_event).collect()
    }

    async fn insert_schedule(&self, schedule: &ScheduleDefinition) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO schedules ({SCHEDULE_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(schedule.id)
        .bind(&schedule.target_id)
        .bind(schedule.kind.as_str())
        .bind(schedule.frequency.as_str())
        .bind(to_i32(schedule.hour))
        .bind(to_i32(schedule.minute))
        .bind(schedule.day_of_week.map(to_i32))
        .bind(schedule.day_of_month.map(to_i32))
        .bind(to_i32(schedule.max_backups))
        .bind(schedule.is_active)
        .bind(schedule.last_run)
        .bind(schedule.next_run)
        .bind(schedule.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_schedule(&self, schedule: &ScheduleDefinition) -> Result<()> {
        sqlx::query(
            "UPDATE schedules SET target_id = $2, kind = $3, frequency = $4, hour = $5,
             minute = $6, day_of_week = $7, day_of_month = $8, max_backups = $9,
             is_active = $10, last_run = $11, next_run = $12
             WHERE id = $1",
        )
        .bind(schedule.id)
        .bind(&schedule.target_id)
        .bind(schedule.kind.as_str())
        .bind(schedule.frequency.as_str())
        .bind(to_i32(schedule.hour))
        .bind(to_i32(schedule.minute))
        .bind(schedule.day_of_week.map(to_i32))
        .bind(schedule.day_of_month.map(to_i32))
        .bind(to_i32(schedule.max_backups))
        .bind(schedule.is_active)
        .bind(schedule.last_run)
        .bind(schedule.next_run)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<ScheduleDefinition>> {
        let row = sqlx::query(&format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(pg_row_to_schedule).transpose()
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pg_row_to_schedule).collect()
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<bool> {
        let done = sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }
}

fn path_str(record: &BackupRecord) -> Option<String> {
    record
        .file_path
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned())
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn parse<T: FromStr<Err = String>>(row: &PgRow, column: &str) -> Result<T> {
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .map_err(|e| anyhow!(e))
        .with_context(|| format!("parse column {column}"))
}

fn pg_row_to_backup(row: &PgRow) -> Result<BackupRecord> {
    Ok(BackupRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        target_id: row.try_get("target_id")?,
        kind: parse(row, "kind")?,
        format: parse(row, "format")?,
        file_path: row
            .try_get::<Option<String>, _>("file_path")?
            .map(PathBuf::from),
        size_bytes: row.try_get("size_bytes")?,
        checksum: row.try_get("checksum")?,
        is_scheduled: row.try_get("is_scheduled")?,
        status: parse(row, "status")?,
        strategy: row.try_get("strategy")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        created_by: row.try_get("created_by")?,
    })
}

fn pg_row_to_schedule(row: &PgRow) -> Result<ScheduleDefinition> {
    Ok(ScheduleDefinition {
        id: row.try_get("id")?,
        target_id: row.try_get("target_id")?,
        kind: parse(row, "kind")?,
        frequency: parse(row, "frequency")?,
        hour: to_u32(row.try_get("hour")?),
        minute: to_u32(row.try_get("minute")?),
        day_of_week: row.try_get::<Option<i32>, _>("day_of_week")?.map(to_u32),
        day_of_month: row.try_get::<Option<i32>, _>("day_of_month")?.map(to_u32),
        max_backups: to_u32(row.try_get("max_backups")?),
        is_active: row.try_get("is_active")?,
        last_run: row.try_get("last_run")?,
        next_run: row.try_get("next_run")?,
        created_at: row.try_get("created_at")?,
    })
}

fn pg_row_to_event(row: &PgRow) -> Result<RestoreEvent> {
    Ok(RestoreEvent {
        id: row.try_get("id")?,
        backup_id: row.try_get("backup_id")?,
        target_id: row.try_get("target_id")?,
        format: parse(row, "format")?,
        strategy: row.try_get("strategy")?,
        success_count: row.try_get("success_count")?,
        error_count: row.try_get("error_count")?,
        created_at: row.try_get("created_at")?,
    })
}
