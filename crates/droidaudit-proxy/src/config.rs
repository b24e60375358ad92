use std::path::PathBuf;

use droidaudit_core::device_input::l2::DEFAULT_ACTION_ENDPOINT;
use droidaudit_core::evidence_pack::COMM_PROXY_TRACE;

pub const DEFAULT_MAX_BODY_BYTES: usize = 65_536;
pub const DEFAULT_STOP_JOIN_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    /// `0` asks the OS for an ephemeral port.
    pub port: u16,
    pub action_endpoint: String,
    pub trace_path: PathBuf,
    pub max_body_bytes: usize,
    pub stop_join_timeout_ms: u64,
    pub worker_threads: usize,
    /// Skip the socket entirely and serve through the in-process registry.
    pub force_in_process: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            action_endpoint: DEFAULT_ACTION_ENDPOINT.to_string(),
            trace_path: PathBuf::from(COMM_PROXY_TRACE),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            stop_join_timeout_ms: DEFAULT_STOP_JOIN_TIMEOUT_MS,
            worker_threads: 2,
            force_in_process: false,
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(host) = std::env::var("DROIDAUDIT_PROXY_HOST") {
            if !host.trim().is_empty() {
                cfg.host = host.trim().to_string();
            }
        }
        cfg.port = std::env::var("DROIDAUDIT_PROXY_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(cfg.port);
        if let Ok(endpoint) = std::env::var("DROIDAUDIT_PROXY_ACTION_ENDPOINT") {
            if endpoint.starts_with('/') {
                cfg.action_endpoint = endpoint;
            }
        }
        if let Ok(path) = std::env::var("DROIDAUDIT_PROXY_TRACE_PATH") {
            if !path.is_empty() {
                cfg.trace_path = PathBuf::from(path);
            }
        }
        cfg.max_body_bytes = read_env_usize("DROIDAUDIT_PROXY_MAX_BODY_BYTES", cfg.max_body_bytes);
        cfg.stop_join_timeout_ms =
            read_env_u64("DROIDAUDIT_PROXY_STOP_TIMEOUT_MS", cfg.stop_join_timeout_ms);
        cfg.worker_threads = read_env_usize("DROIDAUDIT_PROXY_WORKERS", cfg.worker_threads);
        cfg.force_in_process = matches!(
            std::env::var("DROIDAUDIT_PROXY_IN_PROCESS").as_deref(),
            Ok("1") | Ok("true")
        );
        cfg
    }
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn read_env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_and_bad_values_fall_back() {
        std::env::set_var("DROIDAUDIT_PROXY_PORT", "18080");
        std::env::set_var("DROIDAUDIT_PROXY_MAX_BODY_BYTES", "not-a-number");
        std::env::set_var("DROIDAUDIT_PROXY_ACTION_ENDPOINT", "v2/act");
        std::env::set_var("DROIDAUDIT_PROXY_IN_PROCESS", "1");
        let cfg = ProxyConfig::from_env();
        std::env::remove_var("DROIDAUDIT_PROXY_PORT");
        std::env::remove_var("DROIDAUDIT_PROXY_MAX_BODY_BYTES");
        std::env::remove_var("DROIDAUDIT_PROXY_ACTION_ENDPOINT");
        std::env::remove_var("DROIDAUDIT_PROXY_IN_PROCESS");

        assert_eq!(cfg.port, 18080);
        assert_eq!(cfg.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
        assert_eq!(cfg.action_endpoint, "/act");
        assert!(cfg.force_in_process);
        assert_eq!(cfg.stop_join_timeout_ms, DEFAULT_STOP_JOIN_TIMEOUT_MS);
    }
}
