//! Line-numbered JSON-Lines reading and canonical JSON-Lines writing.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::canonical::canonical_json;
use crate::error::{AuditError, AuditResult};

/// A malformed line in an evidence file. `line` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{file}:{line}: {message}")]
pub struct JsonlParseError {
    pub file: String,
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonlRecord {
    pub line: usize,
    pub value: Map<String, Value>,
}

impl JsonlRecord {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.value.get(key).and_then(Value::as_i64)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LenientJsonl {
    pub records: Vec<JsonlRecord>,
    pub errors: Vec<JsonlParseError>,
    pub error_count: usize,
}

/// File name used in parse errors and evidence refs.
pub fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Parses JSON-Lines text, keeping at most `max_errors` errors (all are counted).
pub fn parse_jsonl_str(file: &str, text: &str, max_errors: usize) -> LenientJsonl {
    parse_jsonl_bytes(file, text.as_bytes(), max_errors)
}

/// Like [`parse_jsonl_str`], but a line that is not UTF-8 is a located error
/// instead of failing the whole file.
pub fn parse_jsonl_bytes(file: &str, bytes: &[u8], max_errors: usize) -> LenientJsonl {
    let mut out = LenientJsonl::default();
    for (line, parsed) in parsed_lines(file, bytes) {
        match parsed {
            Ok(value) => out.records.push(JsonlRecord { line, value }),
            Err(err) => {
                out.error_count += 1;
                if out.errors.len() < max_errors {
                    out.errors.push(err);
                }
            }
        }
    }
    out
}

type ParsedLine = (usize, Result<Map<String, Value>, JsonlParseError>);

/// Non-blank lines with their 1-based numbers. `\r\n` endings are accepted.
fn parsed_lines<'a>(file: &'a str, bytes: &'a [u8]) -> impl Iterator<Item = ParsedLine> + 'a {
    bytes
        .split(|b| *b == b'\n')
        .enumerate()
        .filter_map(move |(idx, raw)| {
            let line = idx + 1;
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            let parsed = match std::str::from_utf8(raw) {
                Ok(text) if text.trim().is_empty() => return None,
                Ok(text) => parse_line(file, line, text),
                Err(e) => Err(JsonlParseError {
                    file: file.to_string(),
                    line,
                    message: format!("line is not valid UTF-8: {e}"),
                }),
            };
            Some((line, parsed))
        })
}

fn parse_line(file: &str, line: usize, raw: &str) -> Result<Map<String, Value>, JsonlParseError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(JsonlParseError {
            file: file.to_string(),
            line,
            message: "line is not a JSON object".to_string(),
        }),
        Err(e) => Err(JsonlParseError {
            file: file.to_string(),
            line,
            message: format!("invalid JSON: {e}"),
        }),
    }
}

/// Strict read: the first malformed line aborts with a located parse error.
pub fn read_jsonl(path: &Path) -> AuditResult<Vec<JsonlRecord>> {
    let bytes = fs::read(path).map_err(|e| AuditError::io(path, e))?;
    let label = file_label(path);
    parsed_lines(&label, &bytes)
        .map(|(line, parsed)| -> AuditResult<JsonlRecord> {
            Ok(JsonlRecord {
                line,
                value: parsed?,
            })
        })
        .collect()
}

pub fn read_jsonl_lenient(path: &Path, max_errors: usize) -> AuditResult<LenientJsonl> {
    let bytes = fs::read(path).map_err(|e| AuditError::io(path, e))?;
    Ok(parse_jsonl_bytes(&file_label(path), &bytes, max_errors))
}

pub fn read_json_object(path: &Path) -> AuditResult<Map<String, Value>> {
    let bytes = fs::read(path).map_err(|e| AuditError::io(path, e))?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(JsonlParseError {
            file: file_label(path),
            line: 1,
            message: "document is not a JSON object".to_string(),
        }
        .into()),
        Err(e) => Err(JsonlParseError {
            file: file_label(path),
            line: e.line(),
            message: format!("invalid JSON: {e}"),
        }
        .into()),
    }
}

/// Writes `bytes` to a sibling temp file and renames it into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> AuditResult<()> {
    let tmp = tmp_path(path);
    fs::write(&tmp, bytes).map_err(|e| AuditError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| AuditError::io(path, e))
}

pub fn write_json_pretty(path: &Path, value: &impl Serialize) -> AuditResult<()> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| AuditError::Internal(format!("serialize {}: {e}", path.display())))?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

/// Rewrites `path` with one canonical JSON object per line.
pub fn write_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> AuditResult<()> {
    write_atomic(path, &encode_jsonl(rows)?)
}

pub fn encode_jsonl<T: Serialize>(rows: &[T]) -> AuditResult<Vec<u8>> {
    let mut buf = Vec::new();
    for row in rows {
        buf.extend_from_slice(&canonical_json(row)?);
        buf.push(b'\n');
    }
    Ok(buf)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Append-only canonical JSON-Lines file.
#[derive(Debug)]
pub struct JsonlAppender {
    path: PathBuf,
    file: File,
}

impl JsonlAppender {
    pub fn open(path: &Path) -> AuditResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| AuditError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, row: &impl Serialize) -> AuditResult<()> {
        let mut line = canonical_json(row)?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|_| self.file.flush())
            .map_err(|e| AuditError::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lenient_parse_keeps_line_numbers_and_caps_errors() {
        let text = "{\"a\":1}\n\nnot json\n[1]\n{\"b\":2}\n";
        let parsed = parse_jsonl_str("x.jsonl", text, 1);
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.records[0].line, 1);
        assert_eq!(parsed.records[1].line, 5);
        assert_eq!(parsed.error_count, 2);
        assert_eq!(parsed.errors.len(), 1);
        assert_eq!(parsed.errors[0].line, 3);
        assert!(parsed.errors[0].to_string().starts_with("x.jsonl:3:"));
    }

    #[test]
    fn strict_read_reports_first_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        fs::write(&path, "{\"a\":1}\n42\n").unwrap();
        match read_jsonl(&path) {
            Err(AuditError::Parse(err)) => {
                assert_eq!(err.file, "t.jsonl");
                assert_eq!(err.line, 2);
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn non_utf8_line_is_located() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        let mut bytes = b"{\"a\":1}\r\n".to_vec();
        bytes.extend_from_slice(b"{\"b\":\"\xff\xfe\"}\n{\"c\":3}\n");
        fs::write(&path, &bytes).unwrap();
        match read_jsonl(&path) {
            Err(AuditError::Parse(err)) => {
                assert_eq!(err.line, 2);
                assert!(err.message.contains("UTF-8"), "{}", err.message);
            }
            other => panic!("expected parse error, got {other:?}"),
        }

        let lenient = read_jsonl_lenient(&path, 10).unwrap();
        assert_eq!(lenient.records.len(), 2);
        assert_eq!(lenient.records[1].line, 3);
        assert_eq!(lenient.errors[0].line, 2);
    }

    #[test]
    fn appender_writes_canonical_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        let mut app = JsonlAppender::open(&path).unwrap();
        app.append(&json!({"b":1,"a":2})).unwrap();
        app.append(&json!({"c":[]})).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "{\"a\":2,\"b\":1}\n{\"c\":[]}\n");
    }
}
