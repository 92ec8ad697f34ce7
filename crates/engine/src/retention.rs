use std::io::ErrorKind;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use dbvault_core::{BackupKind, BackupRecord};
use serde::Serialize;

use crate::context::EngineContext;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub deleted_count: usize,
    /// Records whose artifact was already gone.
    pub missing_purged: usize,
}

#[derive(Clone)]
pub struct RetentionManager {
    ctx: Arc<EngineContext>,
}

impl RetentionManager {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Keeps the newest `max_backups` scheduled artifacts for the pair. The
    /// tightest limit wins when several schedules cover it; without a schedule
    /// nothing is removed.
    pub async fn enforce(&self, target_id: &str, kind: BackupKind) -> Result<RetentionReport> {
        let limit = self
            .ctx
            .catalog
            .list_schedules()
            .await?
            .into_iter()
            .filter(|s| s.target_id == target_id && s.kind == kind)
            .map(|s| s.max_backups as usize)
            .min();
        let Some(limit) = limit else {
            return Ok(RetentionReport::default());
        };

        let mut report = RetentionReport::default();
        let mut present = Vec::new();
        for record in self.ctx.catalog.list_scheduled(target_id, kind).await? {
            let exists = match &record.file_path {
                Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
                None => false,
            };
            if exists {
                present.push(record);
            } else {
                self.ctx.catalog.delete_backup(record.id).await?;
                tracing::info!(backup_id = %record.id, "purged record with missing artifact");
                report.missing_purged += 1;
            }
        }

        for record in present.iter().skip(limit) {
            self.delete(record).await?;
            report.deleted_count += 1;
        }
        if report != RetentionReport::default() {
            tracing::info!(
                target = target_id,
                %kind,
                limit,
                deleted = report.deleted_count,
                missing = report.missing_purged,
                "retention enforced"
            );
        }
        Ok(report)
    }

    /// Removes every artifact created more than `days` days ago.
    pub async fn prune_older_than(&self, days: u32) -> Result<RetentionReport> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let mut report = RetentionReport::default();
        for record in self.ctx.catalog.backups_created_before(cutoff).await? {
            self.delete(&record).await?;
            report.deleted_count += 1;
        }
        if report.deleted_count > 0 {
            tracing::info!(days, deleted = report.deleted_count, "pruned old backups");
        }
        Ok(report)
    }

    /// File first, then the catalog row.
    async fn delete(&self, record: &BackupRecord) -> Result<()> {
        if let Some(path) = &record.file_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("delete artifact {}", path.display()))
                }
            }
        }
        self.ctx.catalog.delete_backup(record.id).await?;
        tracing::debug!(backup_id = %record.id, "backup deleted");
        Ok(())
    }
}
