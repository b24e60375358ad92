//! Anti-pollution time window.
//!
//! Hard oracles that match historical device state (sent SMS, created events, ...)
//! must only accept records inside `[t0 - slack, now + slack]` on the device clock,
//! where `t0` is captured when the episode starts. Without an anchor or a readable
//! device clock the window does not exist and the oracle is inconclusive.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::controller::{require_adb_shell, DeviceController};
use super::OracleDecision;

pub const DEFAULT_SLACK_MS: i64 = 5_000;

/// Anything below this is a seconds value, not milliseconds.
const MIN_PLAUSIBLE_EPOCH_MS: i64 = 100_000_000_000;

pub trait HostClock: Send + Sync {
    fn now_utc_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl HostClock for SystemClock {
    fn now_utc_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|v| v.as_millis() as i64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowUnavailable {
    MissingTimeAnchor,
    DeviceClockUnavailable,
    MissingAdbShell,
}

impl WindowUnavailable {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingTimeAnchor => "missing_time_anchor",
            Self::DeviceClockUnavailable => "device_clock_unavailable",
            Self::MissingAdbShell => "missing_capability:adb_shell",
        }
    }

    pub fn decision(self) -> OracleDecision {
        OracleDecision::inconclusive(self.as_str())
    }
}

impl fmt::Display for WindowUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn parse_epoch(output: &str) -> Option<i64> {
    output.trim().parse::<i64>().ok()
}

/// Device epoch in ms: `date +%s%3N`, falling back to `date +%s` (seconds) on
/// toolboxes that do not expand `%N`.
pub fn probe_device_epoch_ms(controller: &dyn DeviceController) -> Result<i64, WindowUnavailable> {
    let shell = require_adb_shell(controller).map_err(|_| WindowUnavailable::MissingAdbShell)?;
    if let Some(ms) = shell
        .adb_shell("date +%s%3N")
        .ok()
        .as_deref()
        .and_then(parse_epoch)
        .filter(|ms| *ms >= MIN_PLAUSIBLE_EPOCH_MS)
    {
        return Ok(ms);
    }
    shell
        .adb_shell("date +%s")
        .ok()
        .as_deref()
        .and_then(parse_epoch)
        .filter(|s| *s > 0)
        .and_then(|s| s.checked_mul(1_000))
        .ok_or(WindowUnavailable::DeviceClockUnavailable)
}

/// Episode start anchor; the device side is best-effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeTime {
    pub host_start_utc_ms: i64,
    pub device_start_epoch_ms: Option<i64>,
}

impl EpisodeTime {
    pub fn capture(controller: &dyn DeviceController, clock: &dyn HostClock) -> Self {
        let host_start_utc_ms = clock.now_utc_ms();
        let device_start_epoch_ms = match probe_device_epoch_ms(controller) {
            Ok(ms) => Some(ms),
            Err(reason) => {
                tracing::warn!(
                    target: "droidaudit.oracle",
                    reason = %reason,
                    "device clock anchor unavailable"
                );
                None
            }
        };
        Self {
            host_start_utc_ms,
            device_start_epoch_ms,
        }
    }
}

/// Inclusive bounds on the device clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeWindow {
    pub fn bind(
        anchor: Option<&EpisodeTime>,
        device_now_ms: Option<i64>,
        slack_ms: i64,
    ) -> Result<Self, WindowUnavailable> {
        let t0 = anchor
            .ok_or(WindowUnavailable::MissingTimeAnchor)?
            .device_start_epoch_ms
            .ok_or(WindowUnavailable::MissingTimeAnchor)?;
        let now = device_now_ms.ok_or(WindowUnavailable::DeviceClockUnavailable)?;
        let slack = slack_ms.max(0);
        Ok(Self {
            start_ms: t0.saturating_sub(slack),
            end_ms: now.max(t0).saturating_add(slack),
        })
    }

    pub fn contains(&self, ts_ms: i64) -> bool {
        self.start_ms <= ts_ms && ts_ms <= self.end_ms
    }
}

/// Probes the device clock now and binds the window in one step.
pub fn query_window(
    controller: &dyn DeviceController,
    anchor: Option<&EpisodeTime>,
    slack_ms: i64,
) -> Result<TimeWindow, WindowUnavailable> {
    if anchor.and_then(|a| a.device_start_epoch_ms).is_none() {
        return Err(WindowUnavailable::MissingTimeAnchor);
    }
    let now = probe_device_epoch_ms(controller)?;
    TimeWindow::bind(anchor, Some(now), slack_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::controller::Detached;
    use crate::oracle::testing::{FakeDevice, FixedClock};

    #[test]
    fn probe_falls_back_to_seconds() {
        let device = FakeDevice::with_shell(&[Ok("1760000000%3N\n"), Ok("1760000000\n")]);
        assert_eq!(probe_device_epoch_ms(&device), Ok(1_760_000_000_000));

        let device = FakeDevice::with_shell(&[Ok("1760000000123\n")]);
        assert_eq!(probe_device_epoch_ms(&device), Ok(1_760_000_000_123));

        let device = FakeDevice::with_shell(&[Err("offline"), Err("offline")]);
        assert_eq!(
            probe_device_epoch_ms(&device),
            Err(WindowUnavailable::DeviceClockUnavailable)
        );
        assert_eq!(
            probe_device_epoch_ms(&Detached),
            Err(WindowUnavailable::MissingAdbShell)
        );
    }

    #[test]
    fn oversized_seconds_reading_is_unavailable() {
        let device = FakeDevice::with_shell(&[Ok("garbage"), Ok("9223372036854776\n")]);
        assert_eq!(
            probe_device_epoch_ms(&device),
            Err(WindowUnavailable::DeviceClockUnavailable)
        );
    }

    #[test]
    fn capture_keeps_host_time_without_device() {
        let t = EpisodeTime::capture(&FakeDevice::without_shell(), &FixedClock(42));
        assert_eq!(t.host_start_utc_ms, 42);
        assert_eq!(t.device_start_epoch_ms, None);
        assert_eq!(
            TimeWindow::bind(Some(&t), Some(100), 5),
            Err(WindowUnavailable::MissingTimeAnchor)
        );
    }

    #[test]
    fn window_is_slackened_on_device_clock() {
        let anchor = EpisodeTime {
            host_start_utc_ms: 0,
            device_start_epoch_ms: Some(10_000),
        };
        let w = TimeWindow::bind(Some(&anchor), Some(20_000), 500).unwrap();
        assert_eq!((w.start_ms, w.end_ms), (9_500, 20_500));
        assert!(w.contains(9_500));
        assert!(!w.contains(9_499));
        assert_eq!(
            TimeWindow::bind(Some(&anchor), None, 500),
            Err(WindowUnavailable::DeviceClockUnavailable)
        );
        assert_eq!(
            TimeWindow::bind(None, Some(1), 0).unwrap_err().decision().conclusive,
            false
        );
    }

    #[test]
    fn query_window_probes_now() {
        let anchor = EpisodeTime {
            host_start_utc_ms: 0,
            device_start_epoch_ms: Some(1_760_000_000_000),
        };
        let device = FakeDevice::with_shell(&[Ok("1760000060000")]);
        let w = query_window(&device, Some(&anchor), DEFAULT_SLACK_MS).unwrap();
        assert_eq!(w.end_ms, 1_760_000_065_000);
    }
}
