use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use dbvault_core::{
    BackupKind, BackupRecord, EngineError, NewSchedule, RestoreEvent, ScheduleDefinition,
};
use uuid::Uuid;

use crate::context::EngineContext;
use crate::creator::{BackupCreator, CreateOptions};
use crate::restore::{RestoreEngine, RestoreResult};
use crate::retention::{RetentionManager, RetentionReport};
use crate::scheduler::{Clock, Scheduler};

/// Entry point for the daemon and the CLI.
#[derive(Clone)]
pub struct BackupService {
    ctx: Arc<EngineContext>,
    creator: BackupCreator,
    restorer: RestoreEngine,
    retention: RetentionManager,
    scheduler: Scheduler,
}

impl BackupService {
    pub fn new(ctx: Arc<EngineContext>, clock: Arc<dyn Clock>) -> Self {
        Self {
            creator: BackupCreator::new(Arc::clone(&ctx)),
            restorer: RestoreEngine::new(Arc::clone(&ctx)),
            retention: RetentionManager::new(Arc::clone(&ctx)),
            scheduler: Scheduler::new(Arc::clone(&ctx), clock),
            ctx,
        }
    }

    pub fn with_retention_days(mut self, days: Option<u32>) -> Self {
        self.scheduler = self.scheduler.with_retention_days(days);
        self
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn target_ids(&self) -> Vec<String> {
        self.ctx.targets.ids()
    }

    pub async fn create_backup(
        &self,
        target_id: &str,
        kind: BackupKind,
        name: Option<String>,
        created_by: Option<String>,
    ) -> Result<BackupRecord> {
        self.creator
            .create(
                target_id,
                kind,
                CreateOptions {
                    name,
                    created_by,
                    ..CreateOptions::default()
                },
            )
            .await
    }

    pub async fn restore_backup(&self, backup_id: Uuid, clear: bool) -> Result<RestoreResult> {
        self.restorer.restore(backup_id, clear, None).await
    }

    pub async fn restore_from_uploaded_file(
        &self,
        target_id: &str,
        bytes: &[u8],
        file_name: &str,
        kind: BackupKind,
        clear: bool,
    ) -> Result<RestoreResult> {
        self.restorer
            .restore_from_upload(target_id, bytes, file_name, kind, clear, None)
            .await
    }

    /// Newest first.
    pub async fn list_backups(&self, target_id: Option<&str>) -> Result<Vec<BackupRecord>> {
        self.ctx.catalog.list_backups(target_id).await
    }

    pub async fn get_backup(&self, id: Uuid) -> Result<BackupRecord> {
        Ok(self
            .ctx
            .catalog
            .get_backup(id)
            .await?
            .ok_or_else(|| EngineError::not_found("backup", id))?)
    }

    /// Path of a backup's artifact, provided it still exists.
    pub async fn backup_file(&self, id: Uuid) -> Result<PathBuf> {
        let record = self.get_backup(id).await?;
        match record.file_path {
            Some(path) if record.status.has_artifact() && path.exists() => Ok(path),
            _ => Err(EngineError::MissingArtifact(id).into()),
        }
    }

    pub async fn restore_history(&self, target_id: &str) -> Result<Vec<RestoreEvent>> {
        self.ctx.targets.get(target_id)?;
        self.ctx.catalog.list_restore_events(target_id).await
    }

    pub async fn create_schedule(&self, new: NewSchedule) -> Result<ScheduleDefinition> {
        self.ctx.targets.get(&new.target_id)?;
        let def = new.into_definition(self.scheduler.now())?;
        self.ctx.catalog.insert_schedule(&def).await?;
        tracing::info!(
            schedule_id = %def.id,
            target = %def.target_id,
            frequency = def.frequency.as_str(),
            next_run = ?def.next_run,
            "schedule created"
        );
        Ok(def)
    }

    /// Inactive definitions drop out of the scheduler but keep their history.
    pub async fn toggle_schedule(&self, id: Uuid, active: bool) -> Result<ScheduleDefinition> {
        let mut def = self.get_schedule(id).await?;
        def.is_active = active;
        def.next_run = active.then(|| def.next_run_after(self.scheduler.now()));
        self.ctx.catalog.update_schedule(&def).await?;
        tracing::info!(schedule_id = %id, active, "schedule toggled");
        Ok(def)
    }

    pub async fn delete_schedule(&self, id: Uuid) -> Result<()> {
        if !self.ctx.catalog.delete_schedule(id).await? {
            return Err(EngineError::not_found("schedule", id).into());
        }
        tracing::info!(schedule_id = %id, "schedule deleted");
        Ok(())
    }

    pub async fn get_schedule(&self, id: Uuid) -> Result<ScheduleDefinition> {
        Ok(self
            .ctx
            .catalog
            .get_schedule(id)
            .await?
            .ok_or_else(|| EngineError::not_found("schedule", id))?)
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>> {
        self.ctx.catalog.list_schedules().await
    }

    pub async fn run_schedule_now(&self, id: Uuid) -> Result<BackupRecord> {
        self.scheduler.run_now(id).await
    }

    pub async fn enforce_retention(&self, target_id: &str, kind: BackupKind) -> Result<RetentionReport> {
        self.retention.enforce(target_id, kind).await
    }

    pub async fn prune_older_than(&self, days: u32) -> Result<RetentionReport> {
        self.retention.prune_older_than(days).await
    }
}
