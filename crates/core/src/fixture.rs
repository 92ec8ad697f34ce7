//! Portable row fixtures.
//!
//! A fixture is a JSON array of [`RowRecord`]s written one record per line.
//! Each record is decoded on its own so one damaged row does not void the rest.

use std::borrow::Cow;
use std::io::{self, Write};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EngineError;

const BLOB_TAG: &str = "$blob";

/// A single row, identified by its natural key rather than its surrogate id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    pub table: String,
    pub natural_key: Map<String, Value>,
    pub fields: Map<String, Value>,
}

impl RowRecord {
    pub fn identifier(&self) -> String {
        format_identifier(&self.table, &self.natural_key)
    }

    /// Natural key and fields merged into one column map.
    pub fn columns(&self) -> Map<String, Value> {
        let mut all = self.natural_key.clone();
        for (k, v) in &self.fields {
            all.insert(k.clone(), v.clone());
        }
        all
    }
}

fn format_identifier(table: &str, key: &Map<String, Value>) -> String {
    let parts: Vec<String> = key
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{k}={s}"),
            other => format!("{k}={other}"),
        })
        .collect();
    format!("{table}[{}]", parts.join(","))
}

/// Encodes raw bytes so they survive a JSON round trip.
pub fn blob_value(bytes: &[u8]) -> Value {
    let mut tagged = Map::new();
    tagged.insert(BLOB_TAG.to_owned(), Value::String(hex::encode(bytes)));
    Value::Object(tagged)
}

pub fn as_blob(value: &Value) -> Option<Vec<u8>> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    hex::decode(obj.get(BLOB_TAG)?.as_str()?).ok()
}

/// Streams records into the one-record-per-line array layout.
pub struct FixtureWriter<W: Write> {
    inner: W,
    rows: usize,
}

impl<W: Write> FixtureWriter<W> {
    pub fn new(mut inner: W) -> io::Result<Self> {
        inner.write_all(b"[\n")?;
        Ok(Self { inner, rows: 0 })
    }

    pub fn write_row(&mut self, row: &RowRecord) -> io::Result<()> {
        if self.rows > 0 {
            self.inner.write_all(b",\n")?;
        }
        serde_json::to_writer(&mut self.inner, row)?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn finish(mut self) -> io::Result<W> {
        if self.rows > 0 {
            self.inner.write_all(b"\n")?;
        }
        self.inner.write_all(b"]\n")?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// One array element, decoded independently of its neighbours.
#[derive(Debug, Clone, PartialEq)]
pub enum FixtureEntry {
    Row(RowRecord),
    Invalid { identifier: String, error: String },
}

/// Decodes a fixture document.
///
/// A syntactically valid array is decoded element by element. If the array as a
/// whole does not parse but is laid out one record per line, each line is
/// decoded on its own; any other damage makes the document unreadable.
pub fn read_fixture(text: &str) -> Result<Vec<FixtureEntry>, EngineError> {
    let whole_err = match serde_json::from_str::<Vec<Value>>(text) {
        Ok(values) => {
            return Ok(values
                .into_iter()
                .enumerate()
                .map(|(i, value)| decode_value(value, i + 1))
                .collect())
        }
        Err(e) => e,
    };
    let lines = text.lines().map(|line| (Cow::Borrowed(line), None)).collect();
    read_lines(lines, &whole_err.to_string())
}

/// Decodes raw fixture bytes. Lines that are not valid UTF-8 become
/// [`FixtureEntry::Invalid`] instead of voiding the document.
pub fn read_fixture_bytes(bytes: &[u8]) -> Result<Vec<FixtureEntry>, EngineError> {
    let whole_err = match std::str::from_utf8(bytes) {
        Ok(text) => return read_fixture(text),
        Err(e) => e,
    };
    let lines = bytes
        .split(|b| *b == b'\n')
        .map(|line| match std::str::from_utf8(line) {
            Ok(text) => (Cow::Borrowed(text), None),
            Err(e) => (String::from_utf8_lossy(line), Some(format!("invalid UTF-8: {e}"))),
        })
        .collect();
    read_lines(lines, &whole_err.to_string())
}

/// Per-line fallback; each line carries any decoding error found for it.
fn read_lines(
    lines: Vec<(Cow<'_, str>, Option<String>)>,
    whole_err: &str,
) -> Result<Vec<FixtureEntry>, EngineError> {
    let unreadable = || EngineError::SerializationError(format!("fixture is not a JSON array: {whole_err}"));
    let lines: Vec<(&str, Option<String>)> = lines
        .iter()
        .map(|(line, err)| (line.trim(), err.clone()))
        .filter(|(line, _)| !line.is_empty())
        .collect();
    match lines.first() {
        Some((first, _)) if first.starts_with('[') => {}
        _ => return Err(unreadable()),
    }

    let records: Vec<(&str, Option<String>)> = lines
        .into_iter()
        .filter(|(line, _)| *line != "[" && *line != "]")
        .collect();
    if records.is_empty() || records.iter().any(|(line, _)| !line.starts_with('{')) {
        return Err(unreadable());
    }

    Ok(records
        .into_iter()
        .enumerate()
        .map(|(i, (line, encoding_err))| {
            let line = line.strip_suffix(',').unwrap_or(line);
            let parsed = match encoding_err {
                Some(err) => Err(err),
                None => serde_json::from_str::<Value>(line).map_err(|e| e.to_string()),
            };
            match parsed {
                Ok(value) => decode_value(value, i + 1),
                Err(error) => FixtureEntry::Invalid {
                    identifier: identify_fragment(line, i + 1),
                    error,
                },
            }
        })
        .collect())
}

/// Recovers `table` and `natural_key` from a record line that does not parse
/// as a whole. Both lead the record, so they usually survive damage further on.
fn identify_fragment(line: &str, position: usize) -> String {
    let field = |name: &str| -> Option<Value> {
        let marker = format!("\"{name}\":");
        let rest = &line[line.find(&marker)? + marker.len()..];
        serde_json::Deserializer::from_str(rest)
            .into_iter::<Value>()
            .next()?
            .ok()
    };
    let mut partial = Map::new();
    if let Some(table) = field("table") {
        partial.insert("table".to_owned(), table);
    }
    if let Some(key) = field("natural_key") {
        partial.insert("natural_key".to_owned(), key);
    }
    identify(&Value::Object(partial), position)
}

fn decode_value(value: Value, position: usize) -> FixtureEntry {
    let identifier = identify(&value, position);
    match serde_json::from_value::<RowRecord>(value) {
        Ok(row) => FixtureEntry::Row(row),
        Err(e) => FixtureEntry::Invalid {
            identifier,
            error: e.to_string(),
        },
    }
}

fn identify(value: &Value, position: usize) -> String {
    let table = value.get("table").and_then(Value::as_str);
    let key = value.get("natural_key").and_then(Value::as_object);
    match (table, key) {
        (Some(table), Some(key)) if !key.is_empty() => format_identifier(table, key),
        (Some(table), _) => format!("{table} row #{position}"),
        _ => format!("row #{position}"),
    }
}
