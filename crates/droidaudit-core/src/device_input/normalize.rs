//! Type and coordinate normalization shared by the L1 and L2 mappers.
//!
//! A raw action never disappears here: an unknown `type` becomes a `wait` event with an
//! `event_type_unsupported:<type>` warning, and coordinates that cannot be resolved to
//! integer physical pixels become nulls with a `coord_unresolved` warning.

use serde_json::{Map, Value};

use super::{
    DeviceEventType, ScreenGeometry, COORD_UNRESOLVED, EVENT_TYPE_UNSUPPORTED_PREFIX, PHYSICAL_PX,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordSpace {
    PhysicalPx,
    Normalized,
    Normalized1000,
    LogicalDp,
}

const EVENT_TYPE_ALIASES: &[(&str, DeviceEventType)] = &[
    ("click", DeviceEventType::Tap),
    ("press", DeviceEventType::Tap),
    ("touch", DeviceEventType::Tap),
    ("double_click", DeviceEventType::DoubleTap),
    ("long_click", DeviceEventType::LongPress),
    ("longpress", DeviceEventType::LongPress),
    ("scroll", DeviceEventType::Swipe),
    ("drag", DeviceEventType::Swipe),
    ("fling", DeviceEventType::Swipe),
    ("input_text", DeviceEventType::Type),
    ("text", DeviceEventType::Type),
    ("type_text", DeviceEventType::Type),
    ("press_back", DeviceEventType::Back),
    ("navigate_back", DeviceEventType::Back),
    ("press_home", DeviceEventType::Home),
    ("navigate_home", DeviceEventType::Home),
    ("press_enter", DeviceEventType::Enter),
    ("launch_app", DeviceEventType::OpenApp),
    ("open", DeviceEventType::OpenApp),
    ("sleep", DeviceEventType::Wait),
    ("noop", DeviceEventType::Wait),
    ("stop", DeviceEventType::Finished),
    ("done", DeviceEventType::Finished),
    ("status", DeviceEventType::Finished),
    ("terminate", DeviceEventType::Finished),
];

const COORD_SPACE_ALIASES: &[(&str, CoordSpace)] = &[
    ("physical_px", CoordSpace::PhysicalPx),
    ("physical", CoordSpace::PhysicalPx),
    ("px", CoordSpace::PhysicalPx),
    ("pixel", CoordSpace::PhysicalPx),
    ("pixels", CoordSpace::PhysicalPx),
    ("screen_px", CoordSpace::PhysicalPx),
    ("normalized", CoordSpace::Normalized),
    ("norm", CoordSpace::Normalized),
    ("normalized_0_1", CoordSpace::Normalized),
    ("relative", CoordSpace::Normalized),
    ("ratio", CoordSpace::Normalized),
    ("normalized_1000", CoordSpace::Normalized1000),
    ("norm_1000", CoordSpace::Normalized1000),
    ("permille", CoordSpace::Normalized1000),
    ("dp", CoordSpace::LogicalDp),
    ("logical", CoordSpace::LogicalDp),
    ("logical_dp", CoordSpace::LogicalDp),
];

fn alias_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}

pub fn normalize_event_type(raw: &str) -> Option<DeviceEventType> {
    let key = alias_key(raw);
    DeviceEventType::from_canonical(&key).or_else(|| {
        EVENT_TYPE_ALIASES
            .iter()
            .find(|(alias, _)| *alias == key)
            .map(|(_, t)| *t)
    })
}

pub fn normalize_coord_space(raw: &str) -> Option<CoordSpace> {
    let key = alias_key(raw);
    COORD_SPACE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, space)| *space)
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedAction {
    pub event_type: DeviceEventType,
    pub payload: Map<String, Value>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coords {
    Point(i64, i64),
    Segment((i64, i64), (i64, i64)),
}

#[derive(Debug, Clone, Copy)]
enum Axis {
    X,
    Y,
}

pub fn normalize_action(raw: &Map<String, Value>, geometry: Option<&ScreenGeometry>) -> NormalizedAction {
    let raw_type = raw.get("type");
    let Some(event_type) = raw_type.and_then(Value::as_str).and_then(normalize_event_type) else {
        let label = match raw_type {
            Some(Value::String(s)) => s.clone(),
            None | Some(Value::Null) => "<missing>".to_string(),
            Some(other) => other.to_string(),
        };
        let mut payload = Map::new();
        payload.insert(
            "raw_type".to_string(),
            raw_type.cloned().unwrap_or(Value::Null),
        );
        return NormalizedAction {
            event_type: DeviceEventType::Wait,
            payload,
            warnings: vec![format!("{EVENT_TYPE_UNSUPPORTED_PREFIX}{label}")],
        };
    };

    let mut payload = Map::new();
    let mut warnings = Vec::new();

    if event_type.is_coordinate() {
        payload.insert("coord_space".to_string(), Value::from(PHYSICAL_PX));
        match resolve_coordinates(raw, event_type, geometry) {
            Ok(Coords::Point(x, y)) => {
                payload.insert("x".to_string(), Value::from(x));
                payload.insert("y".to_string(), Value::from(y));
            }
            Ok(Coords::Segment((sx, sy), (ex, ey))) => {
                payload.insert("start".to_string(), Value::from(vec![sx, sy]));
                payload.insert("end".to_string(), Value::from(vec![ex, ey]));
            }
            Err(detail) => {
                if event_type.is_point() {
                    payload.insert("x".to_string(), Value::Null);
                    payload.insert("y".to_string(), Value::Null);
                } else {
                    payload.insert("start".to_string(), Value::Null);
                    payload.insert("end".to_string(), Value::Null);
                }
                warnings.push(COORD_UNRESOLVED.to_string());
                warnings.push(detail);
            }
        }
    }

    match event_type {
        DeviceEventType::LongPress | DeviceEventType::Swipe | DeviceEventType::Wait => {
            if let Some(ms) = raw.get("duration_ms").and_then(Value::as_u64) {
                payload.insert("duration_ms".to_string(), Value::from(ms));
            }
        }
        DeviceEventType::Type => match raw.get("text").and_then(Value::as_str) {
            Some(text) => {
                payload.insert("text".to_string(), Value::from(text));
            }
            None => {
                payload.insert("text".to_string(), Value::from(""));
                warnings.push("text_missing".to_string());
            }
        },
        DeviceEventType::OpenApp => {
            let app = ["package", "app", "app_name"]
                .iter()
                .find_map(|k| raw.get(*k).and_then(Value::as_str));
            match app {
                Some(app) => {
                    payload.insert("package".to_string(), Value::from(app));
                }
                None => warnings.push("app_missing".to_string()),
            }
        }
        DeviceEventType::Finished => {
            if let Some(status) = ["status", "goal_status"]
                .iter()
                .find_map(|k| raw.get(*k).and_then(Value::as_str))
            {
                payload.insert("status".to_string(), Value::from(status));
            }
        }
        _ => {}
    }

    NormalizedAction {
        event_type,
        payload,
        warnings,
    }
}

fn resolve_coordinates(
    raw: &Map<String, Value>,
    event_type: DeviceEventType,
    geometry: Option<&ScreenGeometry>,
) -> Result<Coords, String> {
    let has_xy = raw.contains_key("x") || raw.contains_key("y");
    let has_segment = raw.contains_key("start") || raw.contains_key("end");
    if has_xy && has_segment {
        return Err("coord_conflict".to_string());
    }
    if (event_type.is_point() && !has_xy) || (!event_type.is_point() && !has_segment) {
        return Err("coord_missing".to_string());
    }
    let space = match raw.get("coord_space") {
        None | Some(Value::Null) => return Err("coord_space_missing".to_string()),
        Some(Value::String(s)) => {
            normalize_coord_space(s).ok_or_else(|| format!("coord_space_unknown:{s}"))?
        }
        Some(other) => return Err(format!("coord_space_unknown:{other}")),
    };

    if event_type.is_point() {
        let x = to_physical(raw.get("x"), Axis::X, space, geometry)?;
        let y = to_physical(raw.get("y"), Axis::Y, space, geometry)?;
        return Ok(Coords::Point(x, y));
    }
    let start = point_of(raw.get("start"), space, geometry)?;
    let end = point_of(raw.get("end"), space, geometry)?;
    Ok(Coords::Segment(start, end))
}

/// Accepts `[x, y]` or `{"x": .., "y": ..}`.
fn point_of(
    v: Option<&Value>,
    space: CoordSpace,
    geometry: Option<&ScreenGeometry>,
) -> Result<(i64, i64), String> {
    let (x, y) = match v {
        Some(Value::Array(items)) if items.len() == 2 => (items.first(), items.get(1)),
        Some(Value::Object(map)) => (map.get("x"), map.get("y")),
        _ => return Err("coord_non_numeric".to_string()),
    };
    Ok((
        to_physical(x, Axis::X, space, geometry)?,
        to_physical(y, Axis::Y, space, geometry)?,
    ))
}

fn numeric(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

fn to_physical(
    v: Option<&Value>,
    axis: Axis,
    space: CoordSpace,
    geometry: Option<&ScreenGeometry>,
) -> Result<i64, String> {
    let n = numeric(v).ok_or_else(|| "coord_non_numeric".to_string())?;
    let extent = |g: &ScreenGeometry| match axis {
        Axis::X => f64::from(g.width_px),
        Axis::Y => f64::from(g.height_px),
    };
    let scaled = |fraction: f64| -> Result<f64, String> {
        let g = geometry.ok_or_else(|| "screen_geometry_missing".to_string())?;
        let ext = extent(g);
        Ok((fraction * ext).round().min((ext - 1.0).max(0.0)))
    };
    let px = match space {
        CoordSpace::PhysicalPx => n.round(),
        CoordSpace::Normalized => {
            if !(0.0..=1.0).contains(&n) {
                return Err("coord_out_of_range".to_string());
            }
            scaled(n)?
        }
        CoordSpace::Normalized1000 => {
            if !(0.0..=1000.0).contains(&n) {
                return Err("coord_out_of_range".to_string());
            }
            scaled(n / 1000.0)?
        }
        CoordSpace::LogicalDp => {
            let dpi = geometry
                .and_then(|g| g.density_dpi)
                .ok_or_else(|| "screen_geometry_missing".to_string())?;
            (n * f64::from(dpi) / 160.0).round()
        }
    };
    if px.abs() > 1e15 {
        return Err("coord_out_of_range".to_string());
    }
    Ok(px as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    const GEOM: ScreenGeometry = ScreenGeometry {
        width_px: 1080,
        height_px: 2400,
        density_dpi: Some(420),
    };

    #[test]
    fn aliases_resolve() {
        assert_eq!(normalize_event_type("press_back"), Some(DeviceEventType::Back));
        assert_eq!(normalize_event_type("STOP"), Some(DeviceEventType::Finished));
        assert_eq!(normalize_event_type("long-press"), Some(DeviceEventType::LongPress));
        assert_eq!(normalize_event_type("teleport"), None);
        assert_eq!(normalize_coord_space("Pixels"), Some(CoordSpace::PhysicalPx));
        assert_eq!(normalize_coord_space("permille"), Some(CoordSpace::Normalized1000));
    }

    #[test]
    fn physical_tap_is_rounded() {
        let out = normalize_action(
            &obj(json!({"type":"click","x":120.4,"y":"340.6","coord_space":"px"})),
            None,
        );
        assert_eq!(out.event_type, DeviceEventType::Tap);
        assert_eq!(
            Value::Object(out.payload),
            json!({"coord_space":"physical_px","x":120,"y":341})
        );
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn normalized_swipe_needs_geometry() {
        let raw = obj(json!({
            "type":"scroll","start":[0.5,0.8],"end":{"x":0.5,"y":0.2},"coord_space":"normalized"
        }));
        let resolved = normalize_action(&raw, Some(&GEOM));
        assert_eq!(
            Value::Object(resolved.payload),
            json!({"coord_space":"physical_px","start":[540,1920],"end":[540,480]})
        );
        let unresolved = normalize_action(&raw, None);
        assert_eq!(
            unresolved.warnings,
            vec![COORD_UNRESOLVED.to_string(), "screen_geometry_missing".to_string()]
        );
        assert_eq!(unresolved.payload.get("start"), Some(&Value::Null));
    }

    #[test]
    fn normalized_edge_is_clamped_inside_frame() {
        let out = normalize_action(
            &obj(json!({"type":"tap","x":1200,"y":10,"coord_space":"normalized_1000"})),
            Some(&GEOM),
        );
        assert_eq!(out.warnings, vec![COORD_UNRESOLVED.to_string(), "coord_out_of_range".to_string()]);
        let out = normalize_action(
            &obj(json!({"type":"tap","x":1000,"y":1000,"coord_space":"normalized_1000"})),
            Some(&GEOM),
        );
        assert_eq!(out.payload.get("x"), Some(&json!(1079)));
        assert_eq!(out.payload.get("y"), Some(&json!(2399)));
    }

    #[test]
    fn dp_uses_density() {
        let out = normalize_action(
            &obj(json!({"type":"long_click","x":100,"y":200,"coord_space":"dp","duration_ms":600})),
            Some(&GEOM),
        );
        assert_eq!(
            Value::Object(out.payload),
            json!({"coord_space":"physical_px","x":263,"y":525,"duration_ms":600})
        );
    }

    #[test]
    fn unresolved_reasons_are_specific() {
        let cases = [
            (json!({"type":"tap","x":1,"y":2}), "coord_space_missing"),
            (json!({"type":"tap","x":1,"y":2,"coord_space":"furlongs"}), "coord_space_unknown:furlongs"),
            (json!({"type":"tap","x":"left","y":2,"coord_space":"px"}), "coord_non_numeric"),
            (json!({"type":"tap","x":1,"y":2,"start":[1,2],"coord_space":"px"}), "coord_conflict"),
            (json!({"type":"swipe","x":1,"y":2,"coord_space":"px"}), "coord_missing"),
        ];
        for (raw, detail) in cases {
            let out = normalize_action(&obj(raw), Some(&GEOM));
            assert_eq!(out.warnings, vec![COORD_UNRESOLVED.to_string(), detail.to_string()]);
        }
    }

    #[test]
    fn unknown_type_becomes_wait() {
        let out = normalize_action(&obj(json!({"type":"teleport","x":1})), None);
        assert_eq!(out.event_type, DeviceEventType::Wait);
        assert_eq!(out.warnings, vec!["event_type_unsupported:teleport".to_string()]);
        assert_eq!(out.payload.get("raw_type"), Some(&json!("teleport")));

        let missing = normalize_action(&obj(json!({"x":1})), None);
        assert_eq!(missing.warnings, vec!["event_type_unsupported:<missing>".to_string()]);
    }

    #[test]
    fn non_coordinate_payloads() {
        let out = normalize_action(&obj(json!({"type":"input_text","text":"hello"})), None);
        assert_eq!(Value::Object(out.payload), json!({"text":"hello"}));
        let out = normalize_action(&obj(json!({"type":"launch_app","app":"com.android.settings"})), None);
        assert_eq!(Value::Object(out.payload), json!({"package":"com.android.settings"}));
        let out = normalize_action(&obj(json!({"type":"done","goal_status":"complete"})), None);
        assert_eq!(Value::Object(out.payload), json!({"status":"complete"}));
    }
}
