//! Live update monitoring task (`LIVE_UPDATE_MONITORING`)
//!
//! Hands each deployed app to a caller-supplied monitor once the deploy is
//! done. Monitoring is optional: the task always reports success and only
//! logs what went wrong.

use std::sync::Arc;

use super::TaskContext;
use crate::result::LaunchResult;
use droidswap_core::prelude::*;
use droidswap_deployer::MetricsRecorder;
use droidswap_device::{DeviceInfo, DeviceTransport};

pub const TASK_ID: &str = "LIVE_UPDATE_MONITORING";

/// Live updates need Android 11
pub const LIVE_UPDATE_MIN_API: u32 = 30;

/// Starts monitoring one app on one device
pub type MonitorCallback = Arc<dyn Fn(&str, &DeviceInfo) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct LiveUpdateMonitoringTask {
    app_ids: Vec<String>,
    enabled: bool,
    callback: Option<MonitorCallback>,
}

impl LiveUpdateMonitoringTask {
    pub fn new(app_ids: Vec<String>, enabled: bool, callback: Option<MonitorCallback>) -> Self {
        Self {
            app_ids,
            enabled,
            callback,
        }
    }

    pub async fn run<T: DeviceTransport>(&self, ctx: &mut TaskContext<'_, T>) -> LaunchResult {
        let device = ctx.session.device();

        let Some(callback) = self.callback.as_ref() else {
            debug!("No live update monitor configured");
            return LaunchResult::success(Vec::new());
        };
        if !self.enabled {
            info!("Live update monitoring disabled in settings");
            return LaunchResult::success(Vec::new());
        }
        if device.api() < LIVE_UPDATE_MIN_API {
            info!(
                "Live update not supported on {} (API {})",
                device.display_name(),
                device.api()
            );
            return LaunchResult::success(Vec::new());
        }

        let metrics = MetricsRecorder::new();
        for app_id in &self.app_ids {
            let mut phase = metrics.phase("START");
            match callback(app_id.as_str(), device) {
                Ok(()) => {
                    debug!("Monitoring {} on {}", app_id, device.serial);
                    phase.done();
                }
                Err(e) => {
                    // monitoring must never block the run
                    warn!("Failed to start live update monitoring for {}: {}", app_id, e);
                    phase.set_status(e.to_string());
                }
            }
        }

        LaunchResult::success(metrics.to_details(TASK_ID, &metrics.all()))
    }
}
