//! Restores: classify the artifact, pick the first strategy in the chain that
//! accepts `(format, engine)`, run it, and report.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use dbvault_core::{
    classify, is_protected_table, read_fixture_bytes, verify_file, BackupFormat, BackupKind,
    BackupStatus, CancelFlag, Classification, EngineError, FixtureEntry, RestoreEvent,
    TargetConnection, TargetEngine, VerifyError,
};
use flate2::read::GzDecoder;
use serde::Serialize;
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::context::{EngineContext, TargetEntry};
use crate::sqlite_file;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestoreStrategy {
    PgRestore,
    PsqlScript,
    SqliteScript,
    FixtureRows,
    SqliteSwap,
}

/// Strategies in the order they are offered an artifact.
pub const RESTORE_CHAIN: [RestoreStrategy; 5] = [
    RestoreStrategy::PgRestore,
    RestoreStrategy::PsqlScript,
    RestoreStrategy::SqliteScript,
    RestoreStrategy::FixtureRows,
    RestoreStrategy::SqliteSwap,
];

impl RestoreStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PgRestore => "pg-restore",
            Self::PsqlScript => "psql-script",
            Self::SqliteScript => "sqlite-script",
            Self::FixtureRows => "fixture-rows",
            Self::SqliteSwap => "sqlite-swap",
        }
    }

    pub fn accepts(self, format: BackupFormat, engine: TargetEngine) -> bool {
        use BackupFormat as F;
        use TargetEngine as E;
        match self {
            Self::PgRestore => format == F::NativeDump && engine == E::Postgres,
            Self::PsqlScript => format == F::SqlText && engine == E::Postgres,
            Self::SqliteScript => format == F::SqlText && engine == E::Sqlite,
            Self::FixtureRows => format.is_fixture(),
            Self::SqliteSwap => format == F::SqliteFile && engine == E::Sqlite,
        }
    }
}

/// First strategy in [`RESTORE_CHAIN`] accepting the pair. Unknown artifacts are
/// never attempted.
pub fn select_strategy(
    path: &Path,
    format: BackupFormat,
    engine: TargetEngine,
) -> Result<RestoreStrategy, EngineError> {
    if format == BackupFormat::Unknown {
        return Err(EngineError::FormatUnrecognized {
            path: path.display().to_string(),
        });
    }
    RESTORE_CHAIN
        .iter()
        .copied()
        .find(|s| s.accepts(format, engine))
        .ok_or(EngineError::IncompatibleFormat { format, engine })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    /// `table[key=value,...]`, or `row #n` when the row has no readable key.
    pub identifier: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreResult {
    pub strategy: RestoreStrategy,
    pub format: BackupFormat,
    pub success_count: usize,
    pub error_count: usize,
    pub skipped_count: usize,
    pub errors: Vec<RowFailure>,
    pub cancelled: bool,
}

impl RestoreResult {
    fn new(strategy: RestoreStrategy, format: BackupFormat) -> Self {
        Self {
            strategy,
            format,
            success_count: 0,
            error_count: 0,
            skipped_count: 0,
            errors: Vec::new(),
            cancelled: false,
        }
    }

    /// Tool and file strategies apply everything as one unit.
    fn atomic(strategy: RestoreStrategy, format: BackupFormat) -> Self {
        Self {
            success_count: 1,
            ..Self::new(strategy, format)
        }
    }

    fn record_failure(&mut self, identifier: String, error: String) {
        tracing::warn!(identifier = %identifier, error = %error, "row not restored");
        self.error_count += 1;
        self.errors.push(RowFailure { identifier, error });
    }

    /// Treats any failed row or an early stop as an error.
    pub fn into_strict(self) -> Result<Self, EngineError> {
        if self.error_count > 0 {
            return Err(EngineError::PartialRestoreFailure {
                success_count: self.success_count,
                error_count: self.error_count,
            });
        }
        if self.cancelled {
            return Err(EngineError::Cancelled);
        }
        Ok(self)
    }
}

#[derive(Clone)]
pub struct RestoreEngine {
    ctx: Arc<EngineContext>,
}

impl RestoreEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Restores a catalog backup after verifying its checksum.
    pub async fn restore(
        &self,
        backup_id: Uuid,
        clear_data_before_restore: bool,
        cancel: Option<CancelFlag>,
    ) -> Result<RestoreResult> {
        let mut record = self
            .ctx
            .catalog
            .get_backup(backup_id)
            .await?
            .ok_or_else(|| EngineError::not_found("backup", backup_id))?;
        let path = match &record.file_path {
            Some(path) if record.status.has_artifact() && path.exists() => path.clone(),
            _ => return Err(EngineError::MissingArtifact(backup_id).into()),
        };
        let entry = self.ctx.targets.get(&record.target_id)?;
        let cancel = cancel.unwrap_or_else(|| self.ctx.shutdown.clone());

        let _guard = self.ctx.locks.lock(&record.target_id).await;
        if let Some(expected) = record.checksum.clone() {
            verify(&path, expected).await?;
        } else {
            tracing::warn!(backup_id = %backup_id, "backup has no checksum, skipping verification");
        }

        let result = self
            .execute(&entry, &path, record.kind, clear_data_before_restore, &cancel)
            .await
            .with_context(|| format!("restore backup {backup_id}"))?;

        record.status = BackupStatus::Restored;
        self.ctx
            .catalog
            .update_backup(&record)
            .await
            .context("mark backup restored")?;
        self.audit(Some(backup_id), &record.target_id, &result).await;
        Ok(result)
    }

    /// Restores an uploaded artifact. The bytes are staged under their original
    /// file name so the extension counts as evidence; the staging directory is
    /// removed on every exit path.
    pub async fn restore_from_upload(
        &self,
        target_id: &str,
        bytes: &[u8],
        file_name: &str,
        kind: BackupKind,
        clear_data_before_restore: bool,
        cancel: Option<CancelFlag>,
    ) -> Result<RestoreResult> {
        let entry = self.ctx.targets.get(target_id)?;
        let cancel = cancel.unwrap_or_else(|| self.ctx.shutdown.clone());

        let staging = tempfile::Builder::new()
            .prefix("upload-")
            .tempdir_in(self.ctx.layout.staging_dir())
            .context("create upload staging dir")?;
        let path = staging.path().join(upload_file_name(file_name));
        tokio::fs::write(&path, bytes)
            .await
            .context("stage uploaded file")?;

        let _guard = self.ctx.locks.lock(target_id).await;
        let result = self
            .execute(&entry, &path, kind, clear_data_before_restore, &cancel)
            .await
            .with_context(|| format!("restore uploaded file {file_name}"))?;
        self.audit(None, target_id, &result).await;
        Ok(result)
    }

    async fn execute(
        &self,
        entry: &TargetEntry,
        path: &Path,
        kind: BackupKind,
        clear: bool,
        cancel: &CancelFlag,
    ) -> Result<RestoreResult> {
        let owned = path.to_path_buf();
        let classification = tokio::task::spawn_blocking(move || classify(&owned))
            .await?
            .context("read artifact head")?;
        let engine = entry.target.engine();
        let strategy = select_strategy(path, classification.format, engine)?;
        tracing::info!(
            target = %entry.target.id,
            format = %classification.format,
            gzip = classification.gzip,
            strategy = strategy.as_str(),
            "restore started"
        );

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled.into());
        }

        // Only fixtures are decoded in a streaming fashion; other wrapped
        // payloads are inflated next to the staging area first.
        let inflated = if classification.gzip && !classification.format.is_fixture() {
            Some(self.inflate(path).await?)
        } else {
            None
        };
        let source = inflated.as_ref().map(|f| f.path()).unwrap_or(path);
        let format = classification.format;

        let result = match (strategy, &entry.target.connection) {
            (RestoreStrategy::PgRestore, TargetConnection::Postgres(conn)) => {
                self.ctx.tools.restore(conn, source).await?;
                RestoreResult::atomic(strategy, format)
            }
            (RestoreStrategy::PsqlScript, TargetConnection::Postgres(conn)) => {
                self.ctx.tools.run_script(conn, source).await?;
                RestoreResult::atomic(strategy, format)
            }
            (RestoreStrategy::SqliteScript, TargetConnection::Sqlite { path: db, .. }) => {
                let (db, script) = (db.clone(), source.to_path_buf());
                tokio::task::spawn_blocking(move || sqlite_file::run_script(&db, &script)).await??;
                RestoreResult::atomic(strategy, format)
            }
            (RestoreStrategy::SqliteSwap, TargetConnection::Sqlite { path: db, .. }) => {
                let (db, replacement) = (db.clone(), source.to_path_buf());
                tokio::task::spawn_blocking(move || sqlite_file::swap_in(&db, &replacement)).await??;
                RestoreResult::atomic(strategy, format)
            }
            (RestoreStrategy::FixtureRows, _) => {
                self.apply_fixture(entry, source, classification, kind, clear, cancel)
                    .await?
            }
            _ => return Err(EngineError::IncompatibleFormat { format, engine }.into()),
        };

        tracing::info!(
            target = %entry.target.id,
            strategy = strategy.as_str(),
            success = result.success_count,
            errors = result.error_count,
            skipped = result.skipped_count,
            cancelled = result.cancelled,
            "restore finished"
        );
        Ok(result)
    }

    async fn apply_fixture(
        &self,
        entry: &TargetEntry,
        path: &Path,
        classification: Classification,
        kind: BackupKind,
        clear: bool,
        cancel: &CancelFlag,
    ) -> Result<RestoreResult> {
        let owned = path.to_path_buf();
        let bytes = tokio::task::spawn_blocking(move || read_bytes(&owned, classification.gzip))
            .await?
            .map_err(|e| EngineError::SerializationError(format!("decode fixture: {e}")))?;
        let entries = read_fixture_bytes(&bytes)?;
        let mut result = RestoreResult::new(RestoreStrategy::FixtureRows, classification.format);

        if clear {
            for table in entry.registry.for_kind(kind).iter().rev() {
                if cancel.is_cancelled() {
                    result.cancelled = true;
                    return Ok(result);
                }
                let removed = table.clear().await?;
                tracing::debug!(table = table.table(), removed, "table cleared");
            }
        }

        for fixture_entry in entries {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            let row = match fixture_entry {
                FixtureEntry::Row(row) => row,
                FixtureEntry::Invalid { identifier, error } => {
                    result.record_failure(identifier, error);
                    continue;
                }
            };
            if is_protected_table(&row.table) {
                result.skipped_count += 1;
                continue;
            }
            let Some(table) = entry.registry.get(&row.table) else {
                result.record_failure(row.identifier(), "table is not registered".to_owned());
                continue;
            };
            if !kind.covers(table.kind()) {
                result.skipped_count += 1;
                continue;
            }
            match table.apply_row(&row).await {
                Ok(()) => result.success_count += 1,
                Err(err) => result.record_failure(row.identifier(), format!("{err:#}")),
            }
        }
        Ok(result)
    }

    async fn inflate(&self, path: &Path) -> Result<NamedTempFile> {
        let source = path.to_path_buf();
        let staging = self.ctx.layout.staging_dir();
        tokio::task::spawn_blocking(move || -> Result<NamedTempFile> {
            let mut out = tempfile::Builder::new()
                .prefix("inflate-")
                .tempfile_in(staging)
                .context("create decompression buffer")?;
            let mut decoder = GzDecoder::new(File::open(&source)?);
            io::copy(&mut decoder, out.as_file_mut()).context("decompress artifact")?;
            Ok(out)
        })
        .await?
    }

    async fn audit(&self, backup_id: Option<Uuid>, target_id: &str, result: &RestoreResult) {
        let event = RestoreEvent {
            id: Uuid::new_v4(),
            backup_id,
            target_id: target_id.to_owned(),
            format: result.format,
            strategy: result.strategy.as_str().to_owned(),
            success_count: result.success_count as i64,
            error_count: result.error_count as i64,
            created_at: Utc::now(),
        };
        if let Err(e) = self.ctx.catalog.insert_restore_event(&event).await {
            tracing::warn!(target = target_id, error = %e, "failed to record restore event");
        }
    }
}

async fn verify(path: &Path, expected: String) -> Result<()> {
    let owned = path.to_path_buf();
    match tokio::task::spawn_blocking(move || verify_file(&owned, &expected)).await? {
        Ok(()) => Ok(()),
        Err(VerifyError::Mismatch(e)) => Err(e.into()),
        Err(VerifyError::Io(e)) => Err(anyhow::Error::new(e).context("read artifact for checksum")),
    }
}

/// Keeps only the final path component of a client-supplied name.
fn upload_file_name(raw: &str) -> PathBuf {
    Path::new(raw)
        .file_name()
        .filter(|name| !name.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("upload"))
}

fn read_bytes(path: &Path, gzip: bool) -> io::Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut bytes = Vec::new();
    if gzip {
        GzDecoder::new(file).read_to_end(&mut bytes)?;
    } else {
        io::BufReader::new(file).read_to_end(&mut bytes)?;
    }
    Ok(bytes)
}
