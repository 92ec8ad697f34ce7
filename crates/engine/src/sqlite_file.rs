//! Whole-file operations on SQLite targets. All functions block.

use std::path::Path;

use anyhow::{bail, Context, Result};
use dbvault_core::EngineError;
use rusqlite::backup::Progress;
use rusqlite::{Connection, DatabaseName, OpenFlags};

use crate::sqlite_table::open_target;

/// Copies the live database into `dest` with the online-backup API.
pub(crate) fn snapshot(db_path: &Path, dest: &Path) -> Result<()> {
    let conn = open_target(db_path)?;
    conn.backup(DatabaseName::Main, dest, None).map_err(|e| {
        EngineError::ConnectionError(format!("snapshot {}: {e}", db_path.display()))
    })?;
    Ok(())
}

/// Replaces the live database with `replacement`.
///
/// The replacement is integrity-checked first, the live contents are saved to
/// a safety copy, and the safety copy is put back if the swap fails.
pub(crate) fn swap_in(db_path: &Path, replacement: &Path) -> Result<()> {
    {
        let candidate = Connection::open_with_flags(replacement, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .context("open replacement database")?;
        integrity_check(&candidate).context("replacement database failed integrity check")?;
    }

    let dir = db_path.parent().unwrap_or_else(|| Path::new("."));
    let safety = tempfile::Builder::new()
        .prefix(".dbvault-safety-")
        .suffix(".sqlite3")
        .tempfile_in(dir)
        .context("create safety copy")?;

    let mut live = open_target(db_path)?;
    live.backup(DatabaseName::Main, safety.path(), None)
        .context("write safety copy")?;

    let swapped = live
        .restore(DatabaseName::Main, replacement, None::<fn(Progress)>)
        .map_err(anyhow::Error::from)
        .and_then(|()| integrity_check(&live));
    if let Err(err) = swapped {
        tracing::warn!(db = %db_path.display(), error = %err, "swap failed, rolling back");
        live.restore(DatabaseName::Main, safety.path(), None::<fn(Progress)>)
            .context("roll back from safety copy")?;
        return Err(err.context("swap sqlite file"));
    }
    Ok(())
}

/// Executes a SQL script in one transaction; any error rolls everything back.
pub(crate) fn run_script(db_path: &Path, script: &Path) -> Result<()> {
    let sql = std::fs::read_to_string(script).context("read sql script")?;
    let body = strip_transaction_control(&sql);
    let mut conn = open_target(db_path)?;
    let tx = conn.transaction()?;
    tx.execute_batch(&body).context("execute sql script")?;
    tx.commit()?;
    Ok(())
}

/// `.dump` output wraps itself in BEGIN/COMMIT, which cannot nest.
fn strip_transaction_control(sql: &str) -> String {
    sql.lines()
        .filter(|line| {
            let upper = line.trim().trim_end_matches(';').trim().to_ascii_uppercase();
            !matches!(
                upper.as_str(),
                "BEGIN" | "BEGIN TRANSACTION" | "COMMIT" | "END" | "END TRANSACTION"
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn integrity_check(conn: &Connection) -> Result<()> {
    let verdict: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    if verdict != "ok" {
        bail!("integrity check reported: {verdict}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db(dir: &Path, name: &str, rows: &[&str]) -> std::path::PathBuf {
        let path = dir.join(name);
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)")
            .unwrap();
        for body in rows {
            conn.execute("INSERT INTO notes (body) VALUES (?1)", [body]).unwrap();
        }
        path
    }

    fn bodies(path: &Path) -> Vec<String> {
        let conn = Connection::open(path).unwrap();
        let mut stmt = conn.prepare("SELECT body FROM notes ORDER BY id").unwrap();
        stmt.query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap()
    }

    #[test]
    fn snapshot_then_swap_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let live = db(dir.path(), "live.db", &["a", "b"]);
        let snap = dir.path().join("snap.sqlite3");
        snapshot(&live, &snap).unwrap();

        Connection::open(&live)
            .unwrap()
            .execute("DELETE FROM notes", [])
            .unwrap();
        swap_in(&live, &snap).unwrap();
        assert_eq!(bodies(&live), vec!["a", "b"]);
    }

    #[test]
    fn corrupt_replacement_leaves_live_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let live = db(dir.path(), "live.db", &["keep"]);
        let bad = dir.path().join("bad.sqlite3");
        let mut bytes = b"SQLite format 3\0".to_vec();
        bytes.extend(std::iter::repeat(0xAB).take(4096));
        std::fs::write(&bad, bytes).unwrap();

        assert!(swap_in(&live, &bad).is_err());
        assert_eq!(bodies(&live), vec!["keep"]);
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(".dbvault-safety-")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn script_failure_rolls_back_earlier_statements() {
        let dir = tempfile::tempdir().unwrap();
        let live = db(dir.path(), "live.db", &["one"]);
        let script = dir.path().join("patch.sql");
        std::fs::write(
            &script,
            "BEGIN TRANSACTION;\nINSERT INTO notes (body) VALUES ('two');\nINSERT INTO missing VALUES (1);\nCOMMIT;\n",
        )
        .unwrap();
        assert!(run_script(&live, &script).is_err());
        assert_eq!(bodies(&live), vec!["one"]);

        std::fs::write(
            &script,
            "BEGIN TRANSACTION;\nINSERT INTO notes (body) VALUES ('two');\nCOMMIT;\n",
        )
        .unwrap();
        run_script(&live, &script).unwrap();
        assert_eq!(bodies(&live), vec!["one", "two"]);
    }
}
