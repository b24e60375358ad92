#![no_main]

use droidaudit_core::device_input::l1::map_agent_events;
use droidaudit_core::device_input::{MappingConfig, ScreenGeometry};
use droidaudit_core::jsonl::parse_jsonl_str;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let parsed = parse_jsonl_str("agent_events.jsonl", &text, 8);
    let cfg = MappingConfig {
        geometry: Some(ScreenGeometry {
            width_px: 1080,
            height_px: 2400,
            density_dpi: Some(420),
        }),
        ..MappingConfig::default()
    };
    if let Ok((events, stats)) = map_agent_events("agent_events.jsonl", &parsed.records, &cfg) {
        assert_eq!(events.len() as u64, stats.mapped_action_count);
        assert!(events.windows(2).all(|w| w[0].step_idx < w[1].step_idx));
    }
});
