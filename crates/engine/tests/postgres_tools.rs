#![cfg(unix)]

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dbvault_core::{
    BackupFormat, BackupKind, BackupStatus, EngineError, PgConnection, RowRecord, Target,
    TargetConnection,
};
use dbvault_engine::{
    BackupService, Backupable, EngineContext, RestoreStrategy, SchemaRegistry, SystemClock,
    TargetSet, ToolConfig,
};
use dbvault_storage::{open_catalog, ArtifactLayout};
use flate2::write::GzEncoder;
use serde_json::{json, Map, Value};

#[derive(Default)]
struct MemoryTable {
    rows: Mutex<Vec<RowRecord>>,
}

impl MemoryTable {
    fn seeded(codes: &[&str]) -> Arc<Self> {
        let table = Self::default();
        for code in codes {
            table.rows.lock().unwrap().push(customer(code));
        }
        Arc::new(table)
    }

    fn codes(&self) -> Vec<String> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.natural_key["code"].as_str().unwrap().to_owned())
            .collect()
    }
}

#[async_trait]
impl Backupable for MemoryTable {
    fn table(&self) -> &str {
        "customers"
    }

    fn kind(&self) -> BackupKind {
        BackupKind::Customers
    }

    async fn list_rows(&self) -> anyhow::Result<Vec<RowRecord>> {
        Ok(self.rows.lock().unwrap().clone())
    }

    async fn apply_row(&self, row: &RowRecord) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        rows.retain(|r| r.natural_key != row.natural_key);
        rows.push(row.clone());
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        let removed = rows.len() as u64;
        rows.clear();
        Ok(removed)
    }
}

fn customer(code: &str) -> RowRecord {
    let as_map = |v: Value| -> Map<String, Value> { v.as_object().cloned().unwrap() };
    RowRecord {
        table: "customers".into(),
        natural_key: as_map(json!({ "code": code })),
        fields: as_map(json!({ "name": format!("customer {code}") })),
    }
}

/// Writes an executable shell script and returns its path.
fn fake_tool(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    {
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.sync_all().unwrap();
    }
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

/// A pg_dump that records its argv and env, then writes `payload_bytes` of dump.
fn fake_pg_dump(dir: &Path, payload_bytes: usize) -> String {
    let log = dir.display();
    fake_tool(
        dir,
        "pg_dump",
        &format!(
            r#"printf '%s\n' "$@" > "{log}/pg_dump.args"
env > "{log}/pg_dump.env"
for arg in "$@"; do
  case "$arg" in --file=*) out="${{arg#--file=}}";; esac
done
printf 'PGDMP' > "$out"
head -c {payload_bytes} /dev/zero >> "$out"
"#
        ),
    )
}

fn recording_tool(dir: &Path, name: &str, exit_code: i32) -> String {
    let log = dir.display();
    fake_tool(
        dir,
        name,
        &format!(
            r#"printf '%s\n' "$@" > "{log}/{name}.args"
for arg in "$@"; do last="$arg"; done
cat "$last" > "{log}/{name}.input"
if [ {exit_code} -ne 0 ]; then
  echo "ERROR:  relation \"customers\" does not exist" >&2
fi
exit {exit_code}
"#
        ),
    )
}

struct Harness {
    _tmp: tempfile::TempDir,
    bin: PathBuf,
    table: Arc<MemoryTable>,
    service: BackupService,
}

impl Harness {
    fn log(&self, file: &str) -> String {
        std::fs::read_to_string(self.bin.join(file)).unwrap()
    }
}

async fn harness(tools: impl FnOnce(&Path) -> ToolConfig) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let bin = tmp.path().join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let tools = tools(&bin);

    let layout = ArtifactLayout::new(tmp.path().join("data")).unwrap();
    let catalog = open_catalog(&layout, None).await.unwrap();
    let target = Target {
        id: "shop".into(),
        connection: TargetConnection::Postgres(PgConnection {
            host: "db.internal".into(),
            port: 6543,
            user: "backup".into(),
            password: Some("s3cret".into()),
            database: "shop".into(),
        }),
        tables: Vec::new(),
    };
    let table = MemoryTable::seeded(&["C1", "C2", "C3"]);
    let mut registry = SchemaRegistry::new();
    registry.register(table.clone());
    let mut targets = TargetSet::default();
    targets.insert(target, registry);

    let ctx = Arc::new(EngineContext::new(catalog, layout, targets, tools));
    let service = BackupService::new(ctx, Arc::new(SystemClock));
    Harness {
        _tmp: tmp,
        bin,
        table,
        service,
    }
}

fn engine_error(err: &anyhow::Error) -> &EngineError {
    err.downcast_ref::<EngineError>()
        .unwrap_or_else(|| panic!("no engine error in {err:#}"))
}

#[tokio::test]
async fn test_native_dump_keeps_password_out_of_argv() {
    let h = harness(|bin| ToolConfig {
        pg_dump: fake_pg_dump(bin, 600),
        ..ToolConfig::default()
    })
    .await;

    let record = h
        .service
        .create_backup("shop", BackupKind::Customers, None, None)
        .await
        .unwrap();
    assert_eq!(record.format, BackupFormat::NativeDump);
    assert_eq!(record.strategy.as_deref(), Some("native-dump"));
    assert_eq!(record.size_bytes, 605);
    assert!(record.file_path.as_ref().unwrap().to_string_lossy().ends_with(".dump"));

    let args = h.log("pg_dump.args");
    assert!(args.lines().any(|a| a == "--format=custom"));
    assert!(args.lines().any(|a| a == "--table=customers"));
    assert!(!args.contains("s3cret"));
    let env = h.log("pg_dump.env");
    assert!(env.lines().any(|l| l == "PGPASSWORD=s3cret"));
    assert!(env.lines().any(|l| l == "PGHOST=db.internal"));
    assert!(env.lines().any(|l| l == "PGPORT=6543"));
}

#[tokio::test]
async fn test_pg_restore_runs_in_one_transaction() {
    let h = harness(|bin| ToolConfig {
        pg_dump: fake_pg_dump(bin, 600),
        pg_restore: recording_tool(bin, "pg_restore", 0),
        ..ToolConfig::default()
    })
    .await;
    let record = h
        .service
        .create_backup("shop", BackupKind::Full, None, None)
        .await
        .unwrap();
    assert!(!h.log("pg_dump.args").contains("--table="));

    let result = h.service.restore_backup(record.id, true).await.unwrap();
    assert_eq!(result.strategy, RestoreStrategy::PgRestore);
    assert_eq!((result.success_count, result.error_count), (1, 0));
    let args = h.log("pg_restore.args");
    for flag in ["--clean", "--single-transaction", "--exit-on-error", "--dbname=shop"] {
        assert!(args.lines().any(|a| a == flag), "missing {flag}");
    }
    assert!(h.log("pg_restore.input").starts_with("PGDMP"));
    let reloaded = h.service.get_backup(record.id).await.unwrap();
    assert_eq!(reloaded.status, BackupStatus::Restored);
}

#[tokio::test]
async fn test_failed_pg_restore_reports_exit_code_and_stderr() {
    let h = harness(|bin| ToolConfig {
        pg_dump: fake_pg_dump(bin, 600),
        pg_restore: recording_tool(bin, "pg_restore", 3),
        ..ToolConfig::default()
    })
    .await;
    let record = h
        .service
        .create_backup("shop", BackupKind::Full, None, None)
        .await
        .unwrap();

    let err = h.service.restore_backup(record.id, false).await.unwrap_err();
    match engine_error(&err) {
        EngineError::ToolFailed { tool, code, stderr } => {
            assert_eq!(tool, "pg_restore");
            assert_eq!(*code, 3);
            assert!(stderr.contains("does not exist"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    let reloaded = h.service.get_backup(record.id).await.unwrap();
    assert_eq!(reloaded.status, BackupStatus::Success);
    assert!(h.service.restore_history("shop").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_tiny_dump_falls_back_to_fixture() {
    let h = harness(|bin| ToolConfig {
        pg_dump: fake_pg_dump(bin, 0),
        ..ToolConfig::default()
    })
    .await;
    let record = h
        .service
        .create_backup("shop", BackupKind::Customers, None, None)
        .await
        .unwrap();
    assert_eq!(record.strategy.as_deref(), Some("fixture"));
    assert_eq!(record.format, BackupFormat::JsonFixtureGzip);
    let dir = record.file_path.as_ref().unwrap().parent().unwrap().to_path_buf();
    let leftovers: Vec<_> = std::fs::read_dir(&dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(".partial-"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");

    h.table.clear().await.unwrap();
    h.table.apply_row(&customer("C9")).await.unwrap();
    let result = h.service.restore_backup(record.id, true).await.unwrap();
    assert_eq!(result.strategy, RestoreStrategy::FixtureRows);
    assert_eq!(result.success_count, 3);
    assert_eq!(h.table.codes(), vec!["C1", "C2", "C3"]);
}

#[tokio::test]
async fn test_missing_and_hanging_tools_fall_back() {
    let h = harness(|_| ToolConfig {
        pg_dump: "/nonexistent/pg_dump".into(),
        ..ToolConfig::default()
    })
    .await;
    let record = h
        .service
        .create_backup("shop", BackupKind::Full, None, None)
        .await
        .unwrap();
    assert_eq!(record.strategy.as_deref(), Some("fixture"));

    let h = harness(|bin| ToolConfig {
        pg_dump: fake_tool(bin, "pg_dump", "exec sleep 30\n"),
        timeout_secs: 1,
        ..ToolConfig::default()
    })
    .await;
    let started = std::time::Instant::now();
    let record = h
        .service
        .create_backup("shop", BackupKind::Full, None, None)
        .await
        .unwrap();
    assert_eq!(record.strategy.as_deref(), Some("fixture"));
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
}

#[tokio::test]
async fn test_compressed_sql_upload_goes_through_psql() {
    let h = harness(|bin| ToolConfig {
        psql: recording_tool(bin, "psql", 0),
        ..ToolConfig::default()
    })
    .await;
    let script = "INSERT INTO customers (code, name) VALUES ('C4', 'Barbara');\n";
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(script.as_bytes()).unwrap();
    let bytes = encoder.finish().unwrap();

    let result = h
        .service
        .restore_from_uploaded_file("shop", &bytes, "patch.sql.gz", BackupKind::Customers, false)
        .await
        .unwrap();
    assert_eq!(result.strategy, RestoreStrategy::PsqlScript);
    assert_eq!(result.format, BackupFormat::SqlText);
    assert_eq!(h.log("psql.input"), script);
    let args = h.log("psql.args");
    assert!(args.lines().any(|a| a == "ON_ERROR_STOP=1"));
    assert!(args.lines().any(|a| a == "--single-transaction"));

    let history = h.service.restore_history("shop").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].strategy, "psql-script");
}
