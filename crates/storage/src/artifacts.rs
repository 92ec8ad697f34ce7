use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use dbvault_core::BackupFormat;

/// On-disk layout under the data root:
///
/// ```text
/// <root>/backups/<target>/<name>.<ext>   finished artifacts
/// <root>/staging/                        uploads and decompression buffers
/// <root>/state/catalog.db                default catalog
/// ```
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("backups")).context("create backups directory")?;
        fs::create_dir_all(root.join("staging")).context("create staging directory")?;
        fs::create_dir_all(root.join("state")).context("create state directory")?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn catalog_db_path(&self) -> PathBuf {
        self.root.join("state").join("catalog.db")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    /// Directory holding a target's artifacts, created on demand.
    pub fn target_dir(&self, target_id: &str) -> Result<PathBuf> {
        let dir = self.root.join("backups").join(sanitize_name(target_id));
        fs::create_dir_all(&dir)
            .with_context(|| format!("create target backup dir: {}", dir.display()))?;
        Ok(dir)
    }

    pub fn artifact_path(&self, target_id: &str, name: &str, format: BackupFormat) -> Result<PathBuf> {
        Ok(self
            .target_dir(target_id)?
            .join(format!("{}.{}", sanitize_name(name), format.extension())))
    }
}

/// Path-safe UTC timestamp used in generated artifact names.
pub fn format_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

/// Keeps names usable as a single path component.
pub fn sanitize_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_owned()
    } else {
        cleaned
    }
}
