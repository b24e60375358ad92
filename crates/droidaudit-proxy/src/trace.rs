//! `comm_proxy_trace.jsonl` writer.
//!
//! Every line is canonical JSON. A request and the response it produced are appended
//! under one lock acquisition, so pairs are always adjacent and in arrival order.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use droidaudit_core::canonical::{sha256_hex, sort_json};
use droidaudit_core::jsonl::JsonlAppender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProxyResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
    Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub timestamp_ms: u64,
    pub direction: Direction,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_bytes: Option<usize>,
}

impl TraceRecord {
    pub fn request(endpoint: &str, method: &str, body: &[u8]) -> Self {
        let mut record = Self::bare(Direction::Request, endpoint);
        record.method = Some(method.to_string());
        if !body.is_empty() {
            match serde_json::from_slice::<Value>(body) {
                Ok(v) => record.payload = Some(sort_json(v)),
                Err(_) => {
                    record.payload_digest = Some(sha256_hex(body));
                    record.payload_bytes = Some(body.len());
                }
            }
        }
        record
    }

    /// A request whose body was refused before it was fully read.
    pub fn oversize_request(endpoint: &str, method: &str, limit: usize) -> Self {
        let mut record = Self::bare(Direction::Request, endpoint);
        record.method = Some(method.to_string());
        record.payload_bytes = Some(limit.saturating_add(1));
        record
    }

    pub fn response(endpoint: &str, status: u16, body: &Value) -> Self {
        let mut record = Self::bare(Direction::Response, endpoint);
        record.status = Some(status);
        record.payload = Some(sort_json(body.clone()));
        record
    }

    pub fn message(endpoint: &str, payload: Value) -> Self {
        let mut record = Self::bare(Direction::Message, endpoint);
        record.payload = Some(sort_json(payload));
        record
    }

    fn bare(direction: Direction, endpoint: &str) -> Self {
        Self {
            timestamp_ms: now_ms(),
            direction,
            endpoint: endpoint.to_string(),
            method: None,
            status: None,
            payload: None,
            payload_digest: None,
            payload_bytes: None,
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug)]
pub struct CommTraceWriter {
    inner: Mutex<JsonlAppender>,
}

impl CommTraceWriter {
    pub fn open(path: &Path) -> ProxyResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| droidaudit_core::AuditError::io(parent, e))?;
        }
        Ok(Self {
            inner: Mutex::new(JsonlAppender::open(path)?),
        })
    }

    pub fn append(&self, record: &TraceRecord) -> ProxyResult<()> {
        self.inner.lock().append(record)?;
        Ok(())
    }

    /// Writes a request and its response as two adjacent lines.
    ///
    /// `respond` runs while the lock is held, so response numbering follows trace order.
    pub fn exchange<R>(
        &self,
        request: &TraceRecord,
        respond: impl FnOnce() -> (TraceRecord, R),
    ) -> ProxyResult<R> {
        let mut guard = self.inner.lock();
        guard.append(request)?;
        let (response, out) = respond();
        guard.append(&response)?;
        Ok(out)
    }
}
