//! Re-checks a written `device_input_trace.jsonl` against the schema and the
//! per-level strictness rules. Problems come back as strings so a bundle
//! auditor can collect everything in one pass.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_json::Value;

use super::{DeviceInputEvent, SourceLevel, COORD_UNRESOLVED, PHYSICAL_PX};
use crate::jsonl::{file_label, parse_jsonl_str};

/// Physical frame recorded in `screen_trace.jsonl`; `right`/`bottom` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBoundary {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

impl FrameBoundary {
    pub fn contains(&self, x: i64, y: i64) -> bool {
        self.left <= x && x < self.right && self.top <= y && y < self.bottom
    }

    fn from_record(value: &serde_json::Map<String, Value>) -> Option<Self> {
        if let Some(Value::Object(b)) = value.get("frame_boundary_px") {
            let side = |k: &str| b.get(k).and_then(Value::as_i64);
            return Some(Self {
                left: side("left")?,
                top: side("top")?,
                right: side("right")?,
                bottom: side("bottom")?,
            });
        }
        let width = value.get("width_px").and_then(Value::as_i64)?;
        let height = value.get("height_px").and_then(Value::as_i64)?;
        Some(Self {
            left: 0,
            top: 0,
            right: width,
            bottom: height,
        })
    }
}

pub type FrameIndex = BTreeMap<u64, FrameBoundary>;

/// Indexes `screen_trace.jsonl` frames by `step_idx`. Unusable lines are reported.
pub fn load_frame_index(path: &Path) -> (FrameIndex, Vec<String>) {
    let label = file_label(path);
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => return (FrameIndex::new(), vec![format!("{label}: cannot read: {e}")]),
    };
    let parsed = parse_jsonl_str(&label, &text, usize::MAX);
    let mut errors: Vec<String> = parsed.errors.iter().map(ToString::to_string).collect();
    let mut index = FrameIndex::new();
    for record in parsed.records {
        let Some(step) = record.value.get("step_idx").and_then(Value::as_u64) else {
            errors.push(format!("{label}:{}: missing step_idx", record.line));
            continue;
        };
        match FrameBoundary::from_record(&record.value) {
            Some(frame) => {
                index.insert(step, frame);
            }
            None => errors.push(format!(
                "{label}:{}: missing frame_boundary_px (or width_px/height_px)",
                record.line
            )),
        }
    }
    (index, errors)
}

pub fn validate_device_input_trace(path: &Path, screen_trace: Option<&Path>) -> Vec<String> {
    let label = file_label(path);
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => return vec![format!("{label}: cannot read: {e}")],
    };
    let mut errors = Vec::new();
    let frames = screen_trace.map(|p| {
        let (index, frame_errors) = load_frame_index(p);
        errors.extend(frame_errors);
        index
    });
    errors.extend(validate_device_input_lines(&label, &text, frames.as_ref()));
    errors
}

enum Coordinates {
    NotApplicable,
    Resolved(Vec<(i64, i64)>),
    Null,
    Malformed,
}

fn coordinates(event: &DeviceInputEvent) -> Coordinates {
    if !event.event_type.is_coordinate() {
        return Coordinates::NotApplicable;
    }
    let values: Vec<Option<&Value>> = if event.event_type.is_point() {
        vec![event.payload.get("x"), event.payload.get("y")]
    } else {
        vec![event.payload.get("start"), event.payload.get("end")]
    };
    if values.iter().all(|v| matches!(v, None | Some(Value::Null))) {
        return Coordinates::Null;
    }
    let pair = |v: &Value| match v.as_array().map(Vec::as_slice) {
        Some([x, y]) => Some((x.as_i64()?, y.as_i64()?)),
        _ => None,
    };
    let points = if event.event_type.is_point() {
        match (values[0].and_then(Value::as_i64), values[1].and_then(Value::as_i64)) {
            (Some(x), Some(y)) => Some(vec![(x, y)]),
            _ => None,
        }
    } else {
        values
            .iter()
            .map(|v| v.and_then(pair))
            .collect::<Option<Vec<_>>>()
    };
    points.map_or(Coordinates::Malformed, Coordinates::Resolved)
}

/// Validates trace text. `frames` enables the L0 in-bounds check.
pub fn validate_device_input_lines(
    label: &str,
    text: &str,
    frames: Option<&FrameIndex>,
) -> Vec<String> {
    let mut errors = Vec::new();
    let mut last_step: Option<u64> = None;
    let mut level: Option<SourceLevel> = None;

    for (idx, raw) in text.lines().enumerate() {
        if raw.trim().is_empty() {
            continue;
        }
        let at = format!("{label}:{}", idx + 1);
        let event: DeviceInputEvent = match serde_json::from_str(raw) {
            Ok(event) => event,
            Err(e) => {
                errors.push(format!("{at}: schema: {e}"));
                continue;
            }
        };

        if let Some(prev) = last_step {
            if event.step_idx == prev {
                errors.push(format!("{at}: duplicate step_idx {}", event.step_idx));
            } else if event.step_idx < prev {
                errors.push(format!(
                    "{at}: step_idx must be strictly increasing ({} after {prev})",
                    event.step_idx
                ));
            }
        }
        last_step = Some(last_step.map_or(event.step_idx, |p| p.max(event.step_idx)));

        match level {
            None => level = Some(event.source_level),
            Some(first) if first != event.source_level => errors.push(format!(
                "{at}: mixed source_level ({first} then {})",
                event.source_level
            )),
            Some(_) => {}
        }

        let coords = coordinates(&event);
        if !matches!(coords, Coordinates::NotApplicable)
            && event.payload.get("coord_space").and_then(Value::as_str) != Some(PHYSICAL_PX)
        {
            errors.push(format!("{at}: coordinate events must use coord_space={PHYSICAL_PX}"));
        }
        if matches!(coords, Coordinates::Malformed) {
            errors.push(format!("{at}: coordinates must be integers or null"));
        }

        match event.source_level {
            SourceLevel::L0 => check_l0(&at, &event, &coords, frames, &mut errors),
            SourceLevel::L1 | SourceLevel::L2 => match coords {
                Coordinates::Null if !event.has_warning(COORD_UNRESOLVED) => errors.push(format!(
                    "{at}: null coordinates require a {COORD_UNRESOLVED} warning"
                )),
                Coordinates::Resolved(_) if event.has_warning(COORD_UNRESOLVED) => errors.push(
                    format!("{at}: {COORD_UNRESOLVED} warning present on resolved coordinates"),
                ),
                _ => {}
            },
        }
    }
    errors
}

fn check_l0(
    at: &str,
    event: &DeviceInputEvent,
    coords: &Coordinates,
    frames: Option<&FrameIndex>,
    errors: &mut Vec<String>,
) {
    if event.ref_step_idx != Some(event.step_idx) {
        errors.push(format!("{at}: ref_step_idx must equal step_idx for L0"));
    }
    let points = match coords {
        Coordinates::NotApplicable => return,
        Coordinates::Null | Coordinates::Malformed => {
            errors.push(format!("{at}: L0 coordinate events require resolved x/y"));
            return;
        }
        Coordinates::Resolved(points) => points,
    };
    if !event.mapping_warnings.is_empty() {
        errors.push(format!(
            "{at}: L0 forbids mapping warnings on resolved coordinate events"
        ));
    }
    if points.iter().any(|&(x, y)| x < 0 || y < 0) {
        errors.push(format!("{at}: L0 coordinates must be non-negative"));
    }
    let Some(frames) = frames else {
        return;
    };
    match frames.get(&event.step_idx) {
        Some(frame) => {
            for &(x, y) in points {
                if !frame.contains(x, y) {
                    errors.push(format!(
                        "{at}: L0 coordinate ({x}, {y}) outside frame [{}, {}, {}, {})",
                        frame.left, frame.top, frame.right, frame.bottom
                    ));
                }
            }
        }
        None => errors.push(format!(
            "{at}: no screen_trace frame for step_idx {}",
            event.step_idx
        )),
    }
}
