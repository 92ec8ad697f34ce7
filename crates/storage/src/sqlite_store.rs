use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use dbvault_core::{BackupKind, BackupRecord, BackupStatus, RestoreEvent, ScheduleDefinition};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::store::CatalogStore;

const BACKUP_COLUMNS: &str = "id, name, target_id, kind, format, file_path, size_bytes, checksum,
     is_scheduled, status, strategy, error_message, created_at, created_by";

const SCHEDULE_COLUMNS: &str = "id, target_id, kind, frequency, hour, minute, day_of_week,
     day_of_month, max_backups, is_active, last_run, next_run, created_at";

const EVENT_COLUMNS: &str =
    "id, backup_id, target_id, format, strategy, success_count, error_count, created_at";

/// SQLite-backed catalog. Each call opens a fresh connection on the blocking pool.
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let store = Self { db_path };
        store.init_db()?;
        Ok(store)
    }

    fn init_db(&self) -> Result<()> {
        let conn = open(&self.db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS backups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                target_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                format TEXT NOT NULL,
                file_path TEXT,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                checksum TEXT,
                is_scheduled INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                strategy TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                created_by TEXT
            );
            CREATE INDEX IF NOT EXISTS backups_target_kind ON backups (target_id, kind, created_at);
            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                target_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                frequency TEXT NOT NULL,
                hour INTEGER NOT NULL,
                minute INTEGER NOT NULL,
                day_of_week INTEGER,
                day_of_month INTEGER,
                max_backups INTEGER NOT NULL,
                is_active INTEGER NOT NULL,
                last_run TEXT,
                next_run TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS restore_events (
                id TEXT PRIMARY KEY,
                backup_id TEXT,
                target_id TEXT NOT NULL,
                format TEXT NOT NULL,
                strategy TEXT NOT NULL,
                success_count INTEGER NOT NULL,
                error_count INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );",
        )
        .context("create catalog tables")?;
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            f(&conn)
        })
        .await?
    }
}

fn open(path: &PathBuf) -> Result<Connection> {
    let conn = Connection::open(path).context("open catalog db")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

#[async_trait::async_trait]
impl CatalogStore for SqliteStore {
    async fn insert_backup(&self, record: &BackupRecord) -> Result<()> {
        let r = record.clone();
        self.blocking(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO backups ({BACKUP_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    r.id.to_string(),
                    r.name,
                    r.target_id,
                    r.kind.as_str(),
                    r.format.as_str(),
                    r.file_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                    r.size_bytes,
                    r.checksum,
                    r.is_scheduled,
                    r.status.as_str(),
                    r.strategy,
                    r.error_message,
                    ts(r.created_at),
                    r.created_by,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_backup(&self, record: &BackupRecord) -> Result<()> {
        let r = record.clone();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE backups SET name = ?2, format = ?3, file_path = ?4, size_bytes = ?5,
                 checksum = ?6, status = ?7, strategy = ?8, error_message = ?9
                 WHERE id = ?1",
                params![
                    r.id.to_string(),
                    r.name,
                    r.format.as_str(),
                    r.file_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                    r.size_bytes,
                    r.checksum,
                    r.status.as_str(),
                    r.strategy,
                    r.error_message,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_backup(&self, id: Uuid) -> Result<Option<BackupRecord>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE id = ?1"))?;
            Ok(stmt.query_row([id.to_string()], row_to_backup).optional()?)
        })
        .await
    }

    async fn list_backups(&self, target_id: Option<&str>) -> Result<Vec<BackupRecord>> {
        let target_id = target_id.map(str::to_owned);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BACKUP_COLUMNS} FROM backups
                 WHERE ?1 IS NULL OR target_id = ?1
                 ORDER BY created_at DESC, rowid DESC"
            ))?;
            let rows = stmt.query_map([target_id], row_to_backup)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await
    }

    async fn list_scheduled(&self, target_id: &str, kind: BackupKind) -> Result<Vec<BackupRecord>> {
        let target_id = target_id.to_owned();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BACKUP_COLUMNS} FROM backups
                 WHERE target_id = ?1 AND kind = ?2 AND is_scheduled = 1 AND status IN (?3, ?4)
                 ORDER BY created_at DESC, rowid DESC"
            ))?;
            let rows = stmt.query_map(
                params![
                    target_id,
                    kind.as_str(),
                    BackupStatus::Success.as_str(),
                    BackupStatus::Restored.as_str()
                ],
                row_to_backup,
            )?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await
    }

    async fn backups_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<BackupRecord>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BACKUP_COLUMNS} FROM backups
                 WHERE created_at < ?1 AND status IN (?2, ?3)
                 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt.query_map(
                params![
                    ts(cutoff),
                    BackupStatus::Success.as_str(),
                    BackupStatus::Restored.as_str()
                ],
                row_to_backup,
            )?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await
    }

    async fn delete_backup(&self, id: Uuid) -> Result<bool> {
        self.blocking(move |conn| {
            let n = conn.execute("DELETE FROM backups WHERE id = ?1", [id.to_string()])?;
            Ok(n > 0)
        })
        .await
    }

    async fn insert_restore_event(&self, event: &RestoreEvent) -> Result<()> {
        let e = event.clone();
        self.blocking(move |conn| {
            conn.execute(
                &format!("INSERT INTO restore_events ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    e.id.to_string(),
                    e.backup_id.map(|id| id.to_string()),
                    e.target_id,
                    e.format.as_str(),
                    e.strategy,
                    e.success_count,
                    e.error_count,
                    ts(e.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_restore_events(&self, target_id: &str) -> Result<Vec<RestoreEvent>> {
        let target_id = target_id.to_owned();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM restore_events WHERE target_id = ?1
                 ORDER BY created_at DESC, rowid DESC"
            ))?;
            let rows = stmt.query_map([target_id], row_to_event)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await
    }

    async fn insert_schedule(&self, schedule: &ScheduleDefinition) -> Result<()> {
        let s = schedule.clone();
        self.blocking(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO schedules ({SCHEDULE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    s.id.to_string(),
                    s.target_id,
                    s.kind.as_str(),
                    s.frequency.as_str(),
                    s.hour,
                    s.minute,
                    s.day_of_week,
                    s.day_of_month,
                    s.max_backups,
                    s.is_active,
                    s.last_run.map(ts),
                    s.next_run.map(ts),
                    ts(s.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_schedule(&self, schedule: &ScheduleDefinition) -> Result<()> {
        let s = schedule.clone();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE schedules SET target_id = ?2, kind = ?3, frequency = ?4, hour = ?5,
                 minute = ?6, day_of_week = ?7, day_of_month = ?8, max_backups = ?9,
                 is_active = ?10, last_run = ?11, next_run = ?12
                 WHERE id = ?1",
                params![
                    s.id.to_string(),
                    s.target_id,
                    s.kind.as_str(),
                    s.frequency.as_str(),
                    s.hour,
                    s.minute,
                    s.day_of_week,
                    s.day_of_month,
                    s.max_backups,
                    s.is_active,
                    s.last_run.map(ts),
                    s.next_run.map(ts),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<ScheduleDefinition>> {
        self.blocking(move |conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"))?;
            Ok(stmt.query_row([id.to_string()], row_to_schedule).optional()?)
        })
        .await
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt.query_map([], row_to_schedule)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<bool> {
        self.blocking(move |conn| {
            let n = conn.execute("DELETE FROM schedules WHERE id = ?1", [id.to_string()])?;
            Ok(n > 0)
        })
        .await
    }
}

/// Fixed-width RFC 3339 so lexical order equals time order.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_backup(row: &rusqlite::Row) -> rusqlite::Result<BackupRecord> {
    Ok(BackupRecord {
        id: parse_uuid(0, row.get(0)?)?,
        name: row.get(1)?,
        target_id: row.get(2)?,
        kind: parse_enum(3, row.get(3)?)?,
        format: parse_enum(4, row.get(4)?)?,
        file_path: row.get::<_, Option<String>>(5)?.map(PathBuf::from),
        size_bytes: row.get(6)?,
        checksum: row.get(7)?,
        is_scheduled: row.get(8)?,
        status: parse_enum(9, row.get(9)?)?,
        strategy: row.get(10)?,
        error_message: row.get(11)?,
        created_at: parse_ts(12, row.get(12)?)?,
        created_by: row.get(13)?,
    })
}

fn row_to_schedule(row: &rusqlite::Row) -> rusqlite::Result<ScheduleDefinition> {
    Ok(ScheduleDefinition {
        id: parse_uuid(0, row.get(0)?)?,
        target_id: row.get(1)?,
        kind: parse_enum(2, row.get(2)?)?,
        frequency: parse_enum(3, row.get(3)?)?,
        hour: row.get(4)?,
        minute: row.get(5)?,
        day_of_week: row.get(6)?,
        day_of_month: row.get(7)?,
        max_backups: row.get(8)?,
        is_active: row.get(9)?,
        last_run: row
            .get::<_, Option<String>>(10)?
            .map(|raw| parse_ts(10, raw))
            .transpose()?,
        next_run: row
            .get::<_, Option<String>>(11)?
            .map(|raw| parse_ts(11, raw))
            .transpose()?,
        created_at: parse_ts(12, row.get(12)?)?,
    })
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<RestoreEvent> {
    Ok(RestoreEvent {
        id: parse_uuid(0, row.get(0)?)?,
        backup_id: row
            .get::<_, Option<String>>(1)?
            .map(|raw| parse_uuid(1, raw))
            .transpose()?,
        target_id: row.get(2)?,
        format: parse_enum(3, row.get(3)?)?,
        strategy: row.get(4)?,
        success_count: row.get(5)?,
        error_count: row.get(6)?,
        created_at: parse_ts(7, row.get(7)?)?,
    })
}

fn parse_uuid(idx: usize, raw: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&raw).map_err(|e| conversion_err(idx, e.into()))
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e.into()))
}

fn parse_enum<T: FromStr<Err = String>>(idx: usize, raw: String) -> rusqlite::Result<T> {
    raw.parse::<T>().map_err(|e| conversion_err(idx, e.into()))
}

fn conversion_err(idx: usize, err: Box<dyn std::error::Error + Send + Sync>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err)
}
