//! Launch tasks
//!
//! A run is an ordered list of [`LaunchTask`]s. Every task gets the same
//! [`TaskContext`] and returns a [`LaunchResult`]; it never retries on its
//! own.

pub mod apply_code_changes;
pub mod deploy;
pub mod install;
pub mod launch_activity;
pub mod live_update;
pub mod unified_deploy;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::result::LaunchResult;
use crate::session::DeviceSession;
use droidswap_core::prelude::*;
use droidswap_core::LaunchEvent;
use droidswap_deployer::DexArchiveDatabase;
use droidswap_device::DeviceTransport;

pub use apply_code_changes::ApplyCodeChangesTask;
pub use install::InstallTask;
pub use launch_activity::LaunchActivityTask;
pub use live_update::{LiveUpdateMonitoringTask, MonitorCallback};
pub use unified_deploy::UnifiedDeployTask;

// ─────────────────────────────────────────────────────────────────
// Shared task plumbing
// ─────────────────────────────────────────────────────────────────

/// Cancellation flag of one run
#[derive(Debug, Clone, Default)]
pub struct LaunchStatus {
    cancelled: Arc<AtomicBool>,
}

impl LaunchStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Sends console lines and notifications to whoever watches the run
#[derive(Debug, Clone)]
pub struct ConsolePrinter {
    tx: mpsc::UnboundedSender<LaunchEvent>,
}

impl ConsolePrinter {
    pub fn new(tx: mpsc::UnboundedSender<LaunchEvent>) -> Self {
        Self { tx }
    }

    pub fn stdout(&self, text: impl Into<String>) {
        self.emit(LaunchEvent::stdout(text));
    }

    pub fn stderr(&self, text: impl Into<String>) {
        self.emit(LaunchEvent::stderr(text));
    }

    /// Send an event; a closed receiver only drops it
    pub fn emit(&self, event: LaunchEvent) {
        if self.tx.send(event).is_err() {
            trace!("Launch event receiver closed, dropping event");
        }
    }
}

/// Everything a task may touch while it runs
pub struct TaskContext<'a, T: DeviceTransport> {
    pub session: &'a mut DeviceSession<T>,
    pub database: DexArchiveDatabase,
    pub status: &'a LaunchStatus,
    pub printer: &'a ConsolePrinter,
    /// Failed deploys resolve themselves instead of asking
    pub fallback_mode: bool,
}

// ─────────────────────────────────────────────────────────────────
// Task list
// ─────────────────────────────────────────────────────────────────

/// Progress weight of a deploy task, per package
pub const DEPLOY_WEIGHT: u32 = 20;
pub const SWAP_WEIGHT: u32 = 10;
pub const LIVE_UPDATE_WEIGHT: u32 = 2;
pub const LAUNCH_ACTIVITY_WEIGHT: u32 = 2;

/// One step of a run
pub enum LaunchTask {
    Install(InstallTask),
    ApplyCodeChanges(ApplyCodeChangesTask),
    UnifiedDeploy(UnifiedDeployTask),
    LiveUpdateMonitoring(LiveUpdateMonitoringTask),
    LaunchActivity(LaunchActivityTask),
}

impl LaunchTask {
    /// Stable id, used as prefix of the task's launch details
    pub fn id(&self) -> &'static str {
        match self {
            LaunchTask::Install(_) => install::TASK_ID,
            LaunchTask::ApplyCodeChanges(_) => apply_code_changes::TASK_ID,
            LaunchTask::UnifiedDeploy(_) => unified_deploy::TASK_ID,
            LaunchTask::LiveUpdateMonitoring(_) => live_update::TASK_ID,
            LaunchTask::LaunchActivity(_) => launch_activity::TASK_ID,
        }
    }

    pub fn description(&self) -> String {
        match self {
            LaunchTask::Install(task) => task.description(),
            LaunchTask::ApplyCodeChanges(task) => task.description(),
            LaunchTask::UnifiedDeploy(task) => task.description(),
            LaunchTask::LiveUpdateMonitoring(_) => "Starting live update monitoring".to_string(),
            LaunchTask::LaunchActivity(task) => task.description(),
        }
    }

    /// Relative weight for progress reporting
    pub fn duration(&self) -> u32 {
        match self {
            LaunchTask::Install(task) => DEPLOY_WEIGHT * task.packages().len().max(1) as u32,
            LaunchTask::ApplyCodeChanges(task) => {
                SWAP_WEIGHT * task.packages().len().max(1) as u32
            }
            LaunchTask::UnifiedDeploy(task) => SWAP_WEIGHT * task.packages().len().max(1) as u32,
            LaunchTask::LiveUpdateMonitoring(_) => LIVE_UPDATE_WEIGHT,
            LaunchTask::LaunchActivity(_) => LAUNCH_ACTIVITY_WEIGHT,
        }
    }

    pub async fn run<T: DeviceTransport>(&self, ctx: &mut TaskContext<'_, T>) -> LaunchResult {
        match self {
            LaunchTask::Install(task) => task.run(ctx).await,
            LaunchTask::ApplyCodeChanges(task) => task.run(ctx).await,
            LaunchTask::UnifiedDeploy(task) => task.run(ctx).await,
            LaunchTask::LiveUpdateMonitoring(task) => task.run(ctx).await,
            LaunchTask::LaunchActivity(task) => task.run(ctx).await,
        }
    }
}

impl std::fmt::Debug for LaunchTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchTask")
            .field("id", &self.id())
            .field("duration", &self.duration())
            .finish()
    }
}

impl From<InstallTask> for LaunchTask {
    fn from(task: InstallTask) -> Self {
        LaunchTask::Install(task)
    }
}

impl From<ApplyCodeChangesTask> for LaunchTask {
    fn from(task: ApplyCodeChangesTask) -> Self {
        LaunchTask::ApplyCodeChanges(task)
    }
}

impl From<UnifiedDeployTask> for LaunchTask {
    fn from(task: UnifiedDeployTask) -> Self {
        LaunchTask::UnifiedDeploy(task)
    }
}

impl From<LiveUpdateMonitoringTask> for LaunchTask {
    fn from(task: LiveUpdateMonitoringTask) -> Self {
        LaunchTask::LiveUpdateMonitoring(task)
    }
}

impl From<LaunchActivityTask> for LaunchTask {
    fn from(task: LaunchActivityTask) -> Self {
        LaunchTask::LaunchActivity(task)
    }
}
