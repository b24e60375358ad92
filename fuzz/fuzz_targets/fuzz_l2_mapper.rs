#![no_main]

use droidaudit_core::device_input::l2::map_comm_proxy_records;
use droidaudit_core::device_input::MappingConfig;
use droidaudit_core::jsonl::parse_jsonl_str;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let parsed = parse_jsonl_str("comm_proxy_trace.jsonl", &text, 8);
    let cfg = MappingConfig::default();
    if let Ok((events, stats)) = map_comm_proxy_records("comm_proxy_trace.jsonl", &parsed.records, &cfg) {
        assert_eq!(events.len() as u64, stats.action_candidate_count);
        assert_eq!(
            stats.action_candidate_count + stats.skipped_non_action_count,
            stats.input_total_count
        );
        for (i, e) in events.iter().enumerate() {
            assert_eq!(e.step_idx, i as u64);
        }
    }
});
