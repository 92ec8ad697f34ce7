pub mod config;
pub mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use dbvault_engine::{BackupService, EngineContext, MirrorUploader, SystemClock, TargetSet};
use dbvault_storage::{open_catalog, ArtifactLayout};

pub use server::{build_router, AppState};

use crate::config::{Config, Settings};

/// Opens the catalog and wires the configured targets into a service.
pub async fn open_service(cfg: &Config, settings: &Settings) -> Result<BackupService> {
    let layout = ArtifactLayout::new(&settings.root)
        .with_context(|| format!("preparing data root {}", settings.root.display()))?;
    let catalog = open_catalog(&layout, settings.database_url.as_deref()).await?;
    let targets = TargetSet::from_targets(cfg.targets.clone());

    let mut ctx = EngineContext::new(catalog, layout, targets, cfg.tools.clone());
    if let Some(dir) = &settings.mirror_dir {
        ctx = ctx.with_uploader(Arc::new(MirrorUploader::new(dir)));
    }
    tracing::info!(
        root = %settings.root.display(),
        targets = ?ctx.targets.ids(),
        "backup service ready"
    );
    Ok(BackupService::new(Arc::new(ctx), Arc::new(SystemClock))
        .with_retention_days(settings.retention_days))
}
