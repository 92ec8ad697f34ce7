use anyhow::Result;
use chrono::{DateTime, Utc};
use dbvault_core::{BackupKind, BackupRecord, RestoreEvent, ScheduleDefinition};
use uuid::Uuid;

/// Catalog operations, implemented by both SQLite and Postgres backends.
#[async_trait::async_trait]
pub trait CatalogStore: Send + Sync {
    /// Insert a backup record, usually in its in-progress state.
    async fn insert_backup(&self, record: &BackupRecord) -> Result<()>;

    /// Overwrite every mutable column of an existing record.
    async fn update_backup(&self, record: &BackupRecord) -> Result<()>;

    async fn get_backup(&self, id: Uuid) -> Result<Option<BackupRecord>>;

    /// All records, optionally for one target, newest first.
    async fn list_backups(&self, target_id: Option<&str>) -> Result<Vec<BackupRecord>>;

    /// Scheduled records holding an artifact for `(target_id, kind)`, newest first.
    async fn list_scheduled(&self, target_id: &str, kind: BackupKind) -> Result<Vec<BackupRecord>>;

    /// Records holding an artifact created before `cutoff`, oldest first.
    async fn backups_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<BackupRecord>>;

    /// Returns whether a row was deleted.
    async fn delete_backup(&self, id: Uuid) -> Result<bool>;

    async fn insert_restore_event(&self, event: &RestoreEvent) -> Result<()>;

    /// Restore history for a target, newest first.
    async fn list_restore_events(&self, target_id: &str) -> Result<Vec<RestoreEvent>>;

    async fn insert_schedule(&self, schedule: &ScheduleDefinition) -> Result<()>;

    async fn update_schedule(&self, schedule: &ScheduleDefinition) -> Result<()>;

    async fn get_schedule(&self, id: Uuid) -> Result<Option<ScheduleDefinition>>;

    /// All definitions, oldest first.
    async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>>;

    async fn delete_schedule(&self, id: Uuid) -> Result<bool>;
}
