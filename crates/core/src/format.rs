//! Backup artifact classification.
//!
//! Evidence is weighed in a fixed order: the file name's extension first, then
//! the magic bytes in the first KiB. Anything that matches no rule is reported
//! as [`BackupFormat::Unknown`] and must be rejected by callers.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use serde::Serialize;

use crate::backup::BackupFormat;

/// Bytes inspected at the start of an artifact.
pub const SNIFF_WINDOW: usize = 1024;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";
const BINARY_RATIO: f64 = 0.30;
const SQL_MARKERS: &[&str] = &["CREATE TABLE", "INSERT INTO", "POSTGRESQL DATABASE DUMP"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub format: BackupFormat,
    pub is_binary: bool,
    /// The payload is wrapped in gzip and must be inflated before use.
    pub gzip: bool,
}

impl Classification {
    fn plain(format: BackupFormat, is_binary: bool) -> Self {
        Self {
            format,
            is_binary,
            gzip: false,
        }
    }

    pub fn unknown() -> Self {
        Self::plain(BackupFormat::Unknown, true)
    }

    pub fn is_unknown(&self) -> bool {
        self.format == BackupFormat::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtensionHint {
    Sqlite,
    Sql,
    Dump,
    Json,
    JsonGz,
}

/// Classifies the artifact at `path` from its name and leading bytes.
pub fn classify(path: &Path) -> io::Result<Classification> {
    let head = read_head(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(classify_bytes(&name, &head))
}

/// Classifies an artifact given its file name and (at least) its first
/// [`SNIFF_WINDOW`] bytes.
pub fn classify_bytes(file_name: &str, head: &[u8]) -> Classification {
    let head = &head[..head.len().min(SNIFF_WINDOW)];
    match extension_hint(&file_name.to_ascii_lowercase()) {
        Some(ExtensionHint::Sqlite) => Classification::plain(BackupFormat::SqliteFile, true),
        Some(ExtensionHint::Dump) => Classification::plain(BackupFormat::NativeDump, true),
        Some(ExtensionHint::JsonGz) => Classification {
            format: BackupFormat::JsonFixtureGzip,
            is_binary: true,
            gzip: true,
        },
        Some(ExtensionHint::Sql) => check_text_claim(head, BackupFormat::SqlText),
        Some(ExtensionHint::Json) => check_text_claim(head, BackupFormat::JsonFixture),
        None => sniff(head, true),
    }
}

fn extension_hint(name: &str) -> Option<ExtensionHint> {
    if name.ends_with(".json.gz") {
        Some(ExtensionHint::JsonGz)
    } else if name.ends_with(".sqlite3") || name.ends_with(".sqlite") || name.ends_with(".db") {
        Some(ExtensionHint::Sqlite)
    } else if name.ends_with(".sql") {
        Some(ExtensionHint::Sql)
    } else if name.ends_with(".dump") {
        Some(ExtensionHint::Dump)
    } else if name.ends_with(".json") {
        Some(ExtensionHint::Json)
    } else {
        None
    }
}

/// A text extension is trusted unless the bytes say otherwise.
fn check_text_claim(head: &[u8], claimed: BackupFormat) -> Classification {
    if head.starts_with(GZIP_MAGIC) {
        return sniff(head, true);
    }
    if has_pg_marker(head) || looks_binary(head) {
        return Classification::plain(BackupFormat::NativeDump, true);
    }
    Classification::plain(claimed, false)
}

fn sniff(head: &[u8], allow_gzip: bool) -> Classification {
    if head.is_empty() {
        return Classification::unknown();
    }
    if head.starts_with(GZIP_MAGIC) {
        if !allow_gzip {
            return Classification::unknown();
        }
        let inner = sniff(&inflate_head(head), false);
        return match inner.format {
            BackupFormat::Unknown => Classification::unknown(),
            BackupFormat::JsonFixture => Classification {
                format: BackupFormat::JsonFixtureGzip,
                is_binary: true,
                gzip: true,
            },
            format => Classification {
                format,
                is_binary: true,
                gzip: true,
            },
        };
    }
    if has_pg_marker(head) {
        return Classification::plain(BackupFormat::NativeDump, true);
    }
    if head.starts_with(SQLITE_MAGIC) {
        return Classification::plain(BackupFormat::SqliteFile, true);
    }

    let Some(text) = utf8_prefix(head) else {
        return Classification::unknown();
    };
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Classification::plain(BackupFormat::JsonFixture, false);
    }
    let upper = text.to_ascii_uppercase();
    if SQL_MARKERS.iter().any(|marker| upper.contains(marker)) {
        return Classification::plain(BackupFormat::SqlText, false);
    }
    Classification::unknown()
}

fn has_pg_marker(head: &[u8]) -> bool {
    head.starts_with(b"PGDMP") || head.starts_with(b"PGCOPY")
}

/// Valid UTF-8 is text regardless of how many multi-byte characters it holds;
/// otherwise a high share of non-ASCII or control bytes marks the data binary.
fn looks_binary(head: &[u8]) -> bool {
    if head.is_empty() || utf8_prefix(head).is_some() {
        return false;
    }
    let suspicious = head
        .iter()
        .filter(|&&b| !b.is_ascii() || (b < 0x20 && !matches!(b, b'\n' | b'\r' | b'\t' | 0x0c)))
        .count();
    suspicious as f64 / head.len() as f64 > BINARY_RATIO
}

/// Decodes the head as UTF-8, tolerating a multi-byte character cut off by the
/// sniff window.
fn utf8_prefix(head: &[u8]) -> Option<&str> {
    match std::str::from_utf8(head) {
        Ok(text) => Some(text),
        Err(e) if e.error_len().is_none() && e.valid_up_to() > 0 => {
            std::str::from_utf8(&head[..e.valid_up_to()]).ok()
        }
        Err(_) => None,
    }
}

/// Inflates as much of a truncated gzip stream as the head allows.
fn inflate_head(head: &[u8]) -> Vec<u8> {
    let mut decoder = GzDecoder::new(head);
    let mut out = vec![0u8; SNIFF_WINDOW];
    let mut filled = 0;
    while filled < out.len() {
        match decoder.read(&mut out[filled..]) {
            Ok(0) | Err(_) => break,
            Ok(n) => filled += n,
        }
    }
    out.truncate(filled);
    out
}

fn read_head(path: &Path) -> io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(SNIFF_WINDOW);
    File::open(path)?
        .take(SNIFF_WINDOW as u64)
        .read_to_end(&mut head)?;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::*;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(bytes).unwrap();
        enc.finish().unwrap()
    }

    const FIXTURE: &[u8] =
        b"[\n{\"table\":\"customers\",\"natural_key\":{\"code\":\"C1\"},\"fields\":{}}\n]\n";

    #[test]
    fn canonical_layouts_are_recognized_without_extension() {
        let mut pg = b"PGDMP\x01\x0e\x00\x04\x08\x01\x01".to_vec();
        pg.extend_from_slice(&[0u8; 64]);
        let mut sqlite = SQLITE_MAGIC.to_vec();
        sqlite.extend_from_slice(&[0x10, 0x00, 0x01, 0x01]);
        let sql = b"BEGIN;\nCREATE TABLE customers (id integer primary key);\nCOMMIT;\n";

        let cases: Vec<(Vec<u8>, BackupFormat)> = vec![
            (pg, BackupFormat::NativeDump),
            (FIXTURE.to_vec(), BackupFormat::JsonFixture),
            (gzip(FIXTURE), BackupFormat::JsonFixtureGzip),
            (sql.to_vec(), BackupFormat::SqlText),
            (sqlite, BackupFormat::SqliteFile),
        ];
        for (bytes, expected) in cases {
            let got = classify_bytes("upload", &bytes);
            assert_eq!(got.format, expected, "layout {expected}");
        }
    }

    #[test]
    fn random_bytes_are_unknown() {
        let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
        for _ in 0..32 {
            let bytes: Vec<u8> = (0..SNIFF_WINDOW)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    (state >> 24) as u8
                })
                .collect();
            assert!(classify_bytes("blob", &bytes).is_unknown());
        }
    }

    #[test]
    fn extension_takes_precedence() {
        let c = classify_bytes("customers.json.gz", &gzip(FIXTURE));
        assert_eq!(c.format, BackupFormat::JsonFixtureGzip);
        assert!(c.gzip);
        assert_eq!(
            classify_bytes("shop.dump", b"anything").format,
            BackupFormat::NativeDump
        );
        assert_eq!(
            classify_bytes("shop.sqlite3", b"").format,
            BackupFormat::SqliteFile
        );
    }

    #[test]
    fn text_extension_with_binary_payload_is_reclassified() {
        let c = classify_bytes("backup.sql", b"PGDMP\x01\x0e\x00");
        assert_eq!(c.format, BackupFormat::NativeDump);
        assert!(c.is_binary);

        let noise: Vec<u8> = (0..512u32).map(|i| (0x80 + (i % 100)) as u8).collect();
        let c = classify_bytes("customers.json", &noise);
        assert_eq!(c.format, BackupFormat::NativeDump);
    }

    #[test]
    fn utf8_text_is_never_reclassified_as_binary() {
        let arabic = "[{\"table\":\"customers\",\"fields\":{\"name\":\"محمد أحمد علي\"}}]";
        let c = classify_bytes("customers.json", arabic.as_bytes());
        assert_eq!(c.format, BackupFormat::JsonFixture);
        assert!(!c.is_binary);
    }

    #[test]
    fn gzipped_sql_keeps_inner_format() {
        let c = classify_bytes(
            "nightly.sql.gz",
            &gzip(b"INSERT INTO customers VALUES (1, 'a');"),
        );
        assert_eq!(c.format, BackupFormat::SqlText);
        assert!(c.gzip);
    }

    #[test]
    fn classify_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact");
        std::fs::write(&path, FIXTURE).unwrap();
        assert_eq!(classify(&path).unwrap().format, BackupFormat::JsonFixture);
        assert_eq!(
            classify(&dir.path().join("empty")).map_err(|e| e.kind()),
            Err(io::ErrorKind::NotFound)
        );
    }
}
