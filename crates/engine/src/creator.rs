//! Backup creation: an ordered plan of strategies, each writing to a scoped
//! temp file that is only persisted once it is complete.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use dbvault_core::{
    file_checksum, BackupFormat, BackupKind, BackupRecord, CancelFlag, EngineError, FixtureWriter,
    RowRecord, TargetConnection,
};
use dbvault_storage::format_timestamp;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::context::{EngineContext, TargetEntry};
use crate::sqlite_file;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CreationStrategy {
    NativeDump,
    SqliteSnapshot,
    Fixture,
}

impl CreationStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NativeDump => "native-dump",
            Self::SqliteSnapshot => "sqlite-snapshot",
            Self::Fixture => "fixture",
        }
    }

    pub fn format(self) -> BackupFormat {
        match self {
            Self::NativeDump => BackupFormat::NativeDump,
            Self::SqliteSnapshot => BackupFormat::SqliteFile,
            Self::Fixture => BackupFormat::JsonFixtureGzip,
        }
    }
}

/// Strategies to try, in order. The fixture fallback always comes last.
///
/// `tables` are the registered tables for `kind`; a partial native dump with
/// nothing to select is skipped.
pub fn creation_plan(
    connection: &TargetConnection,
    kind: BackupKind,
    tables: &[String],
) -> Vec<CreationStrategy> {
    let mut plan = Vec::with_capacity(2);
    match connection {
        TargetConnection::Postgres(_) if kind == BackupKind::Full || !tables.is_empty() => {
            plan.push(CreationStrategy::NativeDump)
        }
        TargetConnection::Sqlite {
            snapshot_file: true,
            ..
        } if kind == BackupKind::Full => plan.push(CreationStrategy::SqliteSnapshot),
        _ => {}
    }
    plan.push(CreationStrategy::Fixture);
    plan
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub name: Option<String>,
    pub is_scheduled: bool,
    pub created_by: Option<String>,
    /// Falls back to the engine's shutdown flag when unset.
    pub cancel: Option<CancelFlag>,
}

/// A finished artifact that has not been moved into place yet.
struct Staged {
    strategy: CreationStrategy,
    file: NamedTempFile,
}

#[derive(Clone)]
pub struct BackupCreator {
    ctx: Arc<EngineContext>,
}

impl BackupCreator {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub async fn create(
        &self,
        target_id: &str,
        kind: BackupKind,
        options: CreateOptions,
    ) -> Result<BackupRecord> {
        let entry = self.ctx.targets.get(target_id)?;
        let now = Utc::now();
        let name = options
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("{}_{}", kind, format_timestamp(now)));
        let cancel = options
            .cancel
            .unwrap_or_else(|| self.ctx.shutdown.clone());

        let _guard = self.ctx.locks.lock(target_id).await;
        let mut record = BackupRecord::in_progress(
            name,
            target_id.to_owned(),
            kind,
            options.is_scheduled,
            options.created_by,
            now,
        );
        self.ctx
            .catalog
            .insert_backup(&record)
            .await
            .context("record backup start")?;
        tracing::info!(backup_id = %record.id, target = target_id, %kind, "backup started");

        match self.produce(&entry, &record, &cancel).await {
            Ok((strategy, path, size, checksum)) => {
                record.complete(strategy.format(), strategy.as_str(), path.clone(), size, checksum);
                if let Err(err) = self.ctx.catalog.update_backup(&record).await {
                    let err = err.context("record backup success");
                    tracing::error!(backup_id = %record.id, error = %format!("{err:#}"), "backup failed");
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        tracing::warn!(backup_id = %record.id, path = %path.display(), error = %e, "failed to remove artifact");
                    }
                    record.fail(format!("{err:#}"));
                    if let Err(e) = self.ctx.catalog.update_backup(&record).await {
                        tracing::warn!(backup_id = %record.id, error = %e, "failed to record backup failure");
                    }
                    return Err(err);
                }
                tracing::info!(
                    backup_id = %record.id,
                    strategy = strategy.as_str(),
                    size_bytes = record.size_bytes,
                    "backup finished"
                );
                self.upload(&record).await;
                Ok(record)
            }
            Err(err) => {
                tracing::error!(backup_id = %record.id, error = %format!("{err:#}"), "backup failed");
                record.fail(format!("{err:#}"));
                if let Err(e) = self.ctx.catalog.update_backup(&record).await {
                    tracing::warn!(backup_id = %record.id, error = %e, "failed to record backup failure");
                }
                Err(err)
            }
        }
    }

    /// Runs the plan and moves the winning artifact into place.
    async fn produce(
        &self,
        entry: &TargetEntry,
        record: &BackupRecord,
        cancel: &CancelFlag,
    ) -> Result<(CreationStrategy, PathBuf, u64, String)> {
        let dir = self.ctx.layout.target_dir(&record.target_id)?;
        let staged = self.run_plan(entry, record.kind, &dir, cancel).await?;
        let strategy = staged.strategy;

        let short_id = record.id.simple().to_string();
        let file_name = format!("{}_{}", record.name, &short_id[..8]);
        let dest = self
            .ctx
            .layout
            .artifact_path(&record.target_id, &file_name, strategy.format())?;

        let (dest, size, checksum) = tokio::task::spawn_blocking(move || -> Result<_> {
            let (checksum, size) = file_checksum(staged.file.path()).context("checksum artifact")?;
            staged
                .file
                .persist_noclobber(&dest)
                .map_err(|e| e.error)
                .with_context(|| format!("move artifact to {}", dest.display()))?;
            Ok((dest, size, checksum))
        })
        .await??;
        Ok((strategy, dest, size, checksum))
    }

    async fn run_plan(
        &self,
        entry: &TargetEntry,
        kind: BackupKind,
        dir: &Path,
        cancel: &CancelFlag,
    ) -> Result<Staged> {
        let tables = entry.registry.table_names(kind);
        let plan = creation_plan(&entry.target.connection, kind, &tables);
        let mut last_err = None;

        for (step, strategy) in plan.iter().copied().enumerate() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled.into());
            }
            let attempt = match strategy {
                CreationStrategy::NativeDump => self.native_dump(entry, kind, &tables, dir).await,
                CreationStrategy::SqliteSnapshot => snapshot_file(entry, dir).await,
                CreationStrategy::Fixture => self.fixture(entry, kind, dir, cancel).await,
            };
            match attempt {
                Ok(file) => return Ok(Staged { strategy, file }),
                Err(err) => {
                    let can_fall_back = err
                        .downcast_ref::<EngineError>()
                        .is_some_and(EngineError::allows_fallback);
                    let err = err.context(format!("{} strategy failed", strategy.as_str()));
                    if !can_fall_back || step + 1 == plan.len() {
                        return Err(err);
                    }
                    tracing::warn!(
                        target = %entry.target.id,
                        strategy = strategy.as_str(),
                        error = %format!("{err:#}"),
                        "falling back to next strategy"
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("empty creation plan")))
    }

    async fn native_dump(
        &self,
        entry: &TargetEntry,
        kind: BackupKind,
        tables: &[String],
        dir: &Path,
    ) -> Result<NamedTempFile> {
        let TargetConnection::Postgres(conn) = &entry.target.connection else {
            anyhow::bail!("native dump needs a postgres target");
        };
        let file = partial_file(dir)?;
        let selected: &[String] = if kind == BackupKind::Full { &[] } else { tables };
        let size = self.ctx.tools.dump(conn, selected, file.path()).await?;
        tracing::debug!(target = %entry.target.id, size, "pg_dump finished");
        Ok(file)
    }

    async fn fixture(
        &self,
        entry: &TargetEntry,
        kind: BackupKind,
        dir: &Path,
        cancel: &CancelFlag,
    ) -> Result<NamedTempFile> {
        let mut rows: Vec<RowRecord> = Vec::new();
        for table in entry.registry.for_kind(kind) {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled.into());
            }
            let table_rows = table
                .list_rows()
                .await
                .with_context(|| format!("serialize table {}", table.table()))?;
            tracing::debug!(table = table.table(), rows = table_rows.len(), "table serialized");
            rows.extend(table_rows);
        }

        let file = partial_file(dir)?;
        let file = tokio::task::spawn_blocking(move || write_fixture(file, &rows))
            .await?
            .map_err(|e| EngineError::SerializationError(e.to_string()))?;
        Ok(file)
    }

    async fn upload(&self, record: &BackupRecord) {
        let (Some(uploader), Some(path)) = (&self.ctx.uploader, &record.file_path) else {
            return;
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let remote = format!("{}/{}", record.target_id, file_name);
        let outcome = uploader.upload(path, &remote).await;
        if outcome.ok {
            tracing::info!(backup_id = %record.id, location = %outcome.location_or_error, "artifact uploaded");
        } else {
            tracing::warn!(backup_id = %record.id, error = %outcome.location_or_error, "artifact upload failed");
        }
    }
}

async fn snapshot_file(entry: &TargetEntry, dir: &Path) -> Result<NamedTempFile> {
    let TargetConnection::Sqlite { path, .. } = &entry.target.connection else {
        anyhow::bail!("file snapshot needs a sqlite target");
    };
    let file = partial_file(dir)?;
    let db_path = path.clone();
    tokio::task::spawn_blocking(move || -> Result<NamedTempFile> {
        sqlite_file::snapshot(&db_path, file.path())?;
        Ok(file)
    })
    .await?
}

fn partial_file(dir: &Path) -> Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(".partial-")
        .tempfile_in(dir)
        .context("create partial artifact")
}

fn write_fixture(mut file: NamedTempFile, rows: &[RowRecord]) -> std::io::Result<NamedTempFile> {
    {
        let encoder = GzEncoder::new(BufWriter::new(file.as_file_mut()), Compression::default());
        let mut writer = FixtureWriter::new(encoder)?;
        for row in rows {
            writer.write_row(row)?;
        }
        let mut buffered = writer.finish()?.finish()?;
        buffered.flush()?;
    }
    file.as_file().sync_all()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use dbvault_core::PgConnection;

    use super::*;

    fn postgres() -> TargetConnection {
        TargetConnection::Postgres(PgConnection {
            host: "localhost".into(),
            port: 5432,
            user: "app".into(),
            password: None,
            database: "shop".into(),
        })
    }

    fn sqlite(snapshot_file: bool) -> TargetConnection {
        TargetConnection::Sqlite {
            path: "/data/shop.db".into(),
            snapshot_file,
        }
    }

    #[test]
    fn postgres_plan_tries_native_dump_first() {
        let tables = vec!["customers".to_string()];
        assert_eq!(
            creation_plan(&postgres(), BackupKind::Customers, &tables),
            vec![CreationStrategy::NativeDump, CreationStrategy::Fixture]
        );
        assert_eq!(
            creation_plan(&postgres(), BackupKind::Full, &[]),
            vec![CreationStrategy::NativeDump, CreationStrategy::Fixture]
        );
        assert_eq!(
            creation_plan(&postgres(), BackupKind::Settings, &[]),
            vec![CreationStrategy::Fixture]
        );
    }

    #[test]
    fn sqlite_snapshot_only_for_full_backups_when_enabled() {
        assert_eq!(
            creation_plan(&sqlite(true), BackupKind::Full, &[]),
            vec![CreationStrategy::SqliteSnapshot, CreationStrategy::Fixture]
        );
        assert_eq!(
            creation_plan(&sqlite(true), BackupKind::Users, &[]),
            vec![CreationStrategy::Fixture]
        );
        assert_eq!(
            creation_plan(&sqlite(false), BackupKind::Full, &[]),
            vec![CreationStrategy::Fixture]
        );
    }

    #[test]
    fn fixture_artifact_is_gzip_json() {
        let dir = tempfile::tempdir().unwrap();
        let row = RowRecord {
            table: "customers".into(),
            natural_key: serde_json::from_str(r#"{"code":"C1"}"#).unwrap(),
            fields: serde_json::from_str(r#"{"name":"Ada"}"#).unwrap(),
        };
        let file = write_fixture(partial_file(dir.path()).unwrap(), &[row.clone()]).unwrap();

        let mut text = String::new();
        std::io::Read::read_to_string(
            &mut flate2::read::GzDecoder::new(std::fs::File::open(file.path()).unwrap()),
            &mut text,
        )
        .unwrap();
        assert_eq!(
            dbvault_core::read_fixture(&text).unwrap(),
            vec![dbvault_core::FixtureEntry::Row(row)]
        );
    }
}
