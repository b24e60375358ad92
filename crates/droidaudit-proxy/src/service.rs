//! Transport-independent request handling shared by the HTTP server and the in-process
//! registry, so both produce identical responses and trace lines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ProxyResult;
use crate::trace::{CommTraceWriter, TraceRecord};

pub const HEALTH_ENDPOINT: &str = "/health";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyReply {
    pub status: u16,
    pub body: Value,
}

impl ProxyReply {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn invalid_action() -> Self {
        Self {
            status: 400,
            body: json!({"ok": false, "error": "invalid_action"}),
        }
    }

    fn not_found() -> Self {
        Self {
            status: 404,
            body: json!({"ok": false, "error": "not_found"}),
        }
    }
}

/// Request body as seen by the transport.
#[derive(Debug, Clone, Copy)]
pub enum RequestBody<'a> {
    Bytes(&'a [u8]),
    /// The transport stopped reading after `max_body_bytes`.
    TooLarge,
}

#[derive(Debug)]
pub struct ActionService {
    action_endpoint: String,
    max_body_bytes: usize,
    trace: Arc<CommTraceWriter>,
    next_action: AtomicU64,
}

impl ActionService {
    pub fn new(action_endpoint: &str, max_body_bytes: usize, trace: Arc<CommTraceWriter>) -> Self {
        Self {
            action_endpoint: action_endpoint.to_string(),
            max_body_bytes,
            trace,
            next_action: AtomicU64::new(1),
        }
    }

    pub fn action_endpoint(&self) -> &str {
        &self.action_endpoint
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    pub fn trace(&self) -> &CommTraceWriter {
        &self.trace
    }

    pub fn handle(&self, method: &str, path: &str, body: RequestBody<'_>) -> ProxyResult<ProxyReply> {
        let body = match body {
            RequestBody::Bytes(b) if b.len() <= self.max_body_bytes => Some(b),
            _ => None,
        };
        let request = match body {
            Some(b) => TraceRecord::request(path, method, b),
            None => TraceRecord::oversize_request(path, method, self.max_body_bytes),
        };
        let reply = self.trace.exchange(&request, || {
            let reply = self.route(method, path, body, request.payload.as_ref());
            (TraceRecord::response(path, reply.status, &reply.body), reply)
        })?;
        if reply.status != 200 {
            tracing::debug!(
                target: "droidaudit.proxy",
                method,
                path,
                status = reply.status,
                "request rejected"
            );
        }
        Ok(reply)
    }

    fn route(
        &self,
        method: &str,
        path: &str,
        body: Option<&[u8]>,
        payload: Option<&Value>,
    ) -> ProxyReply {
        if method.eq_ignore_ascii_case("GET") && path == HEALTH_ENDPOINT {
            return ProxyReply::ok(json!({"status": "ok"}));
        }
        if !(method.eq_ignore_ascii_case("POST") && path == self.action_endpoint) {
            return ProxyReply::not_found();
        }
        if body.is_none() {
            return ProxyReply::invalid_action();
        }
        let has_type = payload
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
            .is_some_and(|t| !t.is_empty());
        if !has_type {
            return ProxyReply::invalid_action();
        }
        let n = self.next_action.fetch_add(1, Ordering::SeqCst);
        ProxyReply::ok(json!({"ok": true, "action_id": format!("a{n}")}))
    }
}
