#![no_main]

use droidaudit_core::device_input::validator::validate_device_input_lines;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let errors = validate_device_input_lines("device_input_trace.jsonl", &text, None);
    for e in &errors {
        assert!(e.starts_with("device_input_trace.jsonl"));
    }
});
