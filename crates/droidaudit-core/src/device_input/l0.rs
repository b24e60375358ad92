//! L0: the executor records every action it performs, synchronously.

use std::path::Path;

use serde_json::{Map, Value};

use super::{DeviceEventType, DeviceInputEvent, SourceLevel, PHYSICAL_PX};
use crate::error::{AuditError, AuditResult};
use crate::jsonl::{read_jsonl, JsonlAppender};

/// An action as the executor performed it, already in physical pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L0Action {
    Tap { x: i64, y: i64 },
    DoubleTap { x: i64, y: i64 },
    LongPress { x: i64, y: i64, duration_ms: u64 },
    Swipe { start: (i64, i64), end: (i64, i64), duration_ms: u64 },
    Type { text: String },
    Back,
    Home,
    Enter,
    OpenApp { package: String },
    Wait { duration_ms: u64 },
    Finished { status: Option<String> },
}

impl L0Action {
    fn into_parts(self) -> AuditResult<(DeviceEventType, Map<String, Value>)> {
        let mut payload = Map::new();
        let event_type = match self {
            Self::Tap { x, y } => {
                point(&mut payload, x, y)?;
                DeviceEventType::Tap
            }
            Self::DoubleTap { x, y } => {
                point(&mut payload, x, y)?;
                DeviceEventType::DoubleTap
            }
            Self::LongPress { x, y, duration_ms } => {
                point(&mut payload, x, y)?;
                payload.insert("duration_ms".to_string(), Value::from(duration_ms));
                DeviceEventType::LongPress
            }
            Self::Swipe {
                start,
                end,
                duration_ms,
            } => {
                for (x, y) in [start, end] {
                    non_negative(x, y)?;
                }
                payload.insert("coord_space".to_string(), Value::from(PHYSICAL_PX));
                payload.insert("start".to_string(), Value::from(vec![start.0, start.1]));
                payload.insert("end".to_string(), Value::from(vec![end.0, end.1]));
                payload.insert("duration_ms".to_string(), Value::from(duration_ms));
                DeviceEventType::Swipe
            }
            Self::Type { text } => {
                payload.insert("text".to_string(), Value::from(text));
                DeviceEventType::Type
            }
            Self::Back => DeviceEventType::Back,
            Self::Home => DeviceEventType::Home,
            Self::Enter => DeviceEventType::Enter,
            Self::OpenApp { package } => {
                payload.insert("package".to_string(), Value::from(package));
                DeviceEventType::OpenApp
            }
            Self::Wait { duration_ms } => {
                payload.insert("duration_ms".to_string(), Value::from(duration_ms));
                DeviceEventType::Wait
            }
            Self::Finished { status } => {
                if let Some(status) = status {
                    payload.insert("status".to_string(), Value::from(status));
                }
                DeviceEventType::Finished
            }
        };
        Ok((event_type, payload))
    }
}

fn non_negative(x: i64, y: i64) -> AuditResult<()> {
    if x < 0 || y < 0 {
        return Err(AuditError::InvalidArgument(format!(
            "L0 coordinates must be non-negative, got ({x}, {y})"
        )));
    }
    Ok(())
}

fn point(payload: &mut Map<String, Value>, x: i64, y: i64) -> AuditResult<()> {
    non_negative(x, y)?;
    payload.insert("coord_space".to_string(), Value::from(PHYSICAL_PX));
    payload.insert("x".to_string(), Value::from(x));
    payload.insert("y".to_string(), Value::from(y));
    Ok(())
}

/// Append-only L0 writer. `ref_step_idx` always equals `step_idx`.
#[derive(Debug)]
pub struct L0TraceWriter {
    appender: JsonlAppender,
    next_step_idx: u64,
}

impl L0TraceWriter {
    /// Opens (or continues) a trace; numbering resumes after the last recorded step.
    pub fn open(path: &Path) -> AuditResult<Self> {
        let next_step_idx = if path.is_file() {
            read_jsonl(path)?
                .iter()
                .filter_map(|r| r.value.get("step_idx").and_then(Value::as_u64))
                .max()
                .map_or(0, |last| last + 1)
        } else {
            0
        };
        Ok(Self {
            appender: JsonlAppender::open(path)?,
            next_step_idx,
        })
    }

    pub fn next_step_idx(&self) -> u64 {
        self.next_step_idx
    }

    pub fn record(&mut self, action: L0Action, timestamp_ms: i64) -> AuditResult<DeviceInputEvent> {
        let (event_type, payload) = action.into_parts()?;
        let step_idx = self.next_step_idx;
        let event = DeviceInputEvent {
            step_idx,
            ref_step_idx: Some(step_idx),
            source_level: SourceLevel::L0,
            event_type,
            payload,
            timestamp_ms,
            mapping_warnings: Vec::new(),
        };
        self.appender.append(&event)?;
        self.next_step_idx += 1;
        Ok(event)
    }
}
