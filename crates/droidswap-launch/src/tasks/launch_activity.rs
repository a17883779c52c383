//! Launch activity task (`LAUNCH_ACTIVITY`)

use std::sync::LazyLock;

use regex::Regex;

use super::TaskContext;
use crate::result::LaunchResult;
use droidswap_core::prelude::*;
use droidswap_core::ResolutionAction;
use droidswap_deployer::MetricsRecorder;
use droidswap_device::{DeviceTransport, ShellOutput};

pub const TASK_ID: &str = "LAUNCH_ACTIVITY";
pub const ERROR_ID: &str = "ACTIVITY_LAUNCH_FAILED";

/// `am start` and `monkey` report most failures on stdout with exit code 0
static LAUNCH_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(Error(:| type)|\*\* No activities found|.*monkey aborted)")
        .expect("Invalid launch failure regex")
});

/// Starts the app, either a given activity or its launcher activity
#[derive(Debug, Clone)]
pub struct LaunchActivityTask {
    app_id: String,
    /// Activity class, e.g. `.MainActivity`; `None` starts the launcher activity
    activity: Option<String>,
}

impl LaunchActivityTask {
    pub fn new(app_id: impl Into<String>, activity: Option<String>) -> Self {
        Self {
            app_id: app_id.into(),
            activity,
        }
    }

    pub fn description(&self) -> String {
        format!("Launching {}", self.app_id)
    }

    /// Shell command starting the app
    pub fn command(&self) -> Vec<String> {
        match &self.activity {
            Some(activity) => vec![
                "am".to_string(),
                "start".to_string(),
                "-n".to_string(),
                format!("{}/{}", self.app_id, activity),
                "-a".to_string(),
                "android.intent.action.MAIN".to_string(),
                "-c".to_string(),
                "android.intent.category.LAUNCHER".to_string(),
            ],
            None => vec![
                "monkey".to_string(),
                "-p".to_string(),
                self.app_id.clone(),
                "-c".to_string(),
                "android.intent.category.LAUNCHER".to_string(),
                "1".to_string(),
            ],
        }
    }

    pub async fn run<T: DeviceTransport>(&self, ctx: &mut TaskContext<'_, T>) -> LaunchResult {
        let command = self.command();
        let args: Vec<&str> = command.iter().map(String::as_str).collect();
        ctx.printer.stdout(format!("$ adb shell {}", command.join(" ")));

        let metrics = MetricsRecorder::new();
        let phase = metrics.phase("START");
        let outcome = ctx.session.transport().shell(&args).await;

        let failure = match outcome {
            Ok(output) => {
                for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
                    ctx.printer.stdout(line);
                }
                launch_failure(&output)
            }
            Err(e) => Some(e.to_string()),
        };

        match failure {
            None => {
                phase.done();
                info!("Launched {} on {}", self.app_id, ctx.session.device().serial);
                LaunchResult::success(metrics.to_details(TASK_ID, &metrics.all()))
            }
            Some(reason) => {
                drop(phase);
                warn!("Failed to launch {}: {}", self.app_id, reason);
                LaunchResult::failure(
                    ERROR_ID,
                    format!("Failed to launch {}.\n{}", self.app_id, reason),
                    reason,
                )
                .with_resolution(ResolutionAction::Retry, false)
                .with_details(metrics.to_details(TASK_ID, &metrics.all()))
            }
        }
    }
}

/// Failure reason hidden in launch output, if any
fn launch_failure(output: &ShellOutput) -> Option<String> {
    let combined = output.combined();
    if let Some(found) = LAUNCH_FAILURE.find(&combined) {
        let line = combined[found.start()..].lines().next().unwrap_or_default();
        return Some(line.trim().to_string());
    }
    if !output.success() {
        return Some(combined.trim().to_string());
    }
    None
}
