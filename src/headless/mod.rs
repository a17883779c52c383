//! Headless mode - NDJSON event output for scripts and CI
//!
//! Every launch event is written to stdout as one JSON object per line, with
//! a millisecond `timestamp` added. Device listings and the final launch
//! summary use the same format.
//!
//! # Example Output
//!
//! ```json
//! {"event":"task_started","task_id":"DEPLOY","description":"Installing com.example","timestamp":1704700001000}
//! {"event":"progress","fraction":0.9,"timestamp":1704700002000}
//! {"event":"launch_finished","device":"emulator-5554","success":true,"duration_ms":812,"timestamp":1704700002100}
//! ```

use std::io::{self, Write};

use chrono::Utc;
use serde::Serialize;
use tracing::error;

use droidswap_core::{DeviceState, LaunchEvent};
use droidswap_device::DeviceInfo;
use droidswap_launch::LaunchStats;

/// Events that only exist in headless mode
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HeadlessEvent {
    /// A device reported by `adb devices`
    DeviceDetected {
        serial: String,
        name: String,
        state: DeviceState,
        api_level: Option<u32>,
        timestamp: i64,
    },

    /// Summary of a finished launch
    LaunchFinished {
        device: String,
        success: bool,
        failed_task: Option<String>,
        error_id: Option<String>,
        duration_ms: u64,
        timestamp: i64,
    },

    /// Error outside of a launch
    Error {
        message: String,
        fatal: bool,
        timestamp: i64,
    },
}

/// A launch event with the time it was written
#[derive(Serialize)]
struct Stamped<'a> {
    #[serde(flatten)]
    event: &'a LaunchEvent,
    timestamp: i64,
}

impl HeadlessEvent {
    pub fn emit(&self) {
        write_json(self);
    }

    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    pub fn device_detected(device: &DeviceInfo) -> Self {
        Self::DeviceDetected {
            serial: device.serial.clone(),
            name: device.display_name(),
            state: device.state,
            api_level: device.api_level,
            timestamp: Self::now(),
        }
    }

    pub fn launch_finished(stats: &LaunchStats) -> Self {
        Self::LaunchFinished {
            device: stats.device.clone(),
            success: stats.success,
            failed_task: stats.failed_task.clone(),
            error_id: stats.error_id.clone(),
            duration_ms: stats.duration_ms,
            timestamp: Self::now(),
        }
    }

    pub fn error(message: String, fatal: bool) -> Self {
        Self::Error {
            message,
            fatal,
            timestamp: Self::now(),
        }
    }
}

/// Write a launch event as one NDJSON line
pub fn emit_launch_event(event: &LaunchEvent) {
    write_json(&stamp(event));
}

fn stamp(event: &LaunchEvent) -> Stamped<'_> {
    Stamped {
        event,
        timestamp: Utc::now().timestamp_millis(),
    }
}

fn write_json<T: Serialize>(value: &T) {
    let json = match serde_json::to_string(value) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize headless event: {}", e);
            return;
        }
    };

    let mut stdout = io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{}", json) {
        error!("Failed to write headless event to stdout: {}", e);
        return;
    }

    if let Err(e) = stdout.flush() {
        error!("Failed to flush headless stdout: {}", e);
    }
}
