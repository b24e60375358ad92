use std::fs;
use std::io::Write;
use std::net::TcpStream;
use std::time::{Duration, Instant};

use droidaudit_core::device_input::l2::materialize_l2_device_input_trace;
use droidaudit_core::device_input::MappingConfig;
use droidaudit_core::evidence_pack::{COMM_PROXY_TRACE, DEVICE_INPUT_TRACE};
use droidaudit_proxy::{
    CommProxyRecorder, InProcessRegistry, ProxyConfig, RecorderHandle, StopOutcome,
};
use serde_json::{json, Value};

fn trace_lines(dir: &std::path::Path) -> Vec<Value> {
    fs::read_to_string(dir.join(COMM_PROXY_TRACE))
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

async fn stop(handle: RecorderHandle) -> StopOutcome {
    tokio::task::spawn_blocking(move || handle.stop())
        .await
        .unwrap()
        .unwrap()
}

fn config(dir: &std::path::Path, force_in_process: bool) -> ProxyConfig {
    ProxyConfig {
        port: if force_in_process { 18_901 } else { 0 },
        trace_path: dir.join(COMM_PROXY_TRACE),
        max_body_bytes: 256,
        force_in_process,
        ..ProxyConfig::default()
    }
}

#[tokio::test]
async fn http_surface_and_trace_feed_l2_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let handle = CommProxyRecorder::start(config(dir.path(), false), InProcessRegistry::new())
        .unwrap();
    let client = handle.client().unwrap();

    let health = client.get_health().await.unwrap();
    assert_eq!(health.status, 200);
    assert_eq!(health.body, json!({"status":"ok"}));

    let tap = client
        .post_act(&json!({"type":"tap","x":120,"y":340,"coord_space":"physical_px"}))
        .await
        .unwrap();
    assert_eq!(tap.status, 200);
    assert_eq!(tap.body, json!({"ok":true,"action_id":"a1"}));

    let missing_type = client.post_act(&json!({"x":1})).await.unwrap();
    assert_eq!(missing_type.status, 400);
    assert_eq!(missing_type.body, json!({"ok":false,"error":"invalid_action"}));

    let garbage = client.post_act_raw(b"{oops".to_vec()).await.unwrap();
    assert_eq!(garbage.status, 400);

    let oversize = client
        .post_act(&json!({"type":"type_text","text":"x".repeat(1024)}))
        .await
        .unwrap();
    assert_eq!(oversize.status, 400);

    let back = client.post_act(&json!({"type":"back"})).await.unwrap();
    assert_eq!(back.body["action_id"], json!("a2"));

    drop(client);
    assert_eq!(stop(handle).await, StopOutcome::Graceful);

    let lines = trace_lines(dir.path());
    assert_eq!(lines.len(), 12);
    for pair in lines.chunks(2) {
        assert_eq!(pair[0]["direction"], json!("request"));
        assert_eq!(pair[1]["direction"], json!("response"));
        assert_eq!(pair[0]["endpoint"], pair[1]["endpoint"]);
    }
    assert!(lines[6]["payload"].is_null());
    assert_eq!(lines[6]["payload_bytes"], json!(5));
    assert_eq!(lines[6]["payload_digest"].as_str().unwrap().len(), 64);

    let stats = materialize_l2_device_input_trace(
        &dir.path().join(COMM_PROXY_TRACE),
        dir.path(),
        &MappingConfig::default(),
    )
    .unwrap();
    assert_eq!(stats.input_total_count, 12);
    assert_eq!(stats.action_candidate_count, 5);

    let events: Vec<Value> = fs::read_to_string(dir.path().join(DEVICE_INPUT_TRACE))
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(events[0]["event_type"], json!("tap"));
    assert_eq!(events[0]["payload"]["x"], json!(120));
}

#[tokio::test]
async fn in_process_transport_writes_the_same_trace() {
    let http_dir = tempfile::tempdir().unwrap();
    let local_dir = tempfile::tempdir().unwrap();
    let registry = InProcessRegistry::new();

    for (dir, forced) in [(http_dir.path(), false), (local_dir.path(), true)] {
        let handle = CommProxyRecorder::start(config(dir, forced), registry.clone()).unwrap();
        if forced {
            assert!(handle.is_in_process());
        }
        let client = handle.client().unwrap();
        client.get_health().await.unwrap();
        client.post_act(&json!({"type":"home"})).await.unwrap();
        client.post_act(&json!({"type":""})).await.unwrap();
        drop(client);
        stop(handle).await;
    }
    assert!(registry.is_empty());

    let strip = |mut v: Value| {
        v.as_object_mut().unwrap().remove("timestamp_ms");
        v
    };
    let http: Vec<Value> = trace_lines(http_dir.path()).into_iter().map(strip).collect();
    let local: Vec<Value> = trace_lines(local_dir.path()).into_iter().map(strip).collect();
    assert_eq!(http, local);
}

#[test]
fn stalled_upload_forces_stop_within_the_join_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = ProxyConfig {
        stop_join_timeout_ms: 50,
        ..config(dir.path(), false)
    };
    let handle = CommProxyRecorder::start(cfg, InProcessRegistry::new()).unwrap();
    if handle.is_in_process() {
        // Sockets refused here; there is no connection to hold open.
        assert_eq!(handle.stop().unwrap(), StopOutcome::Graceful);
        return;
    }
    handle
        .record_message("/note", json!({"step":"before stall"}))
        .unwrap();

    let (host, port) = handle.endpoint();
    let mut stream = TcpStream::connect((host.as_str(), port)).unwrap();
    // Headers promise more body than is ever sent.
    stream
        .write_all(
            b"POST /act HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\n\
              Content-Length: 200\r\n\r\n{\"type\":\"ta",
        )
        .unwrap();
    stream.flush().unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    let outcome = handle.stop().unwrap();
    let elapsed = started.elapsed();
    drop(stream);

    assert_eq!(outcome, StopOutcome::Forced);
    assert!(elapsed < Duration::from_secs(2), "stop took {elapsed:?}");

    let lines = trace_lines(dir.path());
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["direction"], json!("message"));
    assert_eq!(lines[0]["payload"]["step"], json!("before stall"));
}
