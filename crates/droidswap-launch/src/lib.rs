//! # droidswap-launch - Run Orchestration
//!
//! Turns a run request (install, apply code changes, apply changes, launch)
//! into an ordered list of launch tasks and executes them against one
//! device session.
//!
//! ## Public API
//!
//! - [`LaunchOrchestrator`] - Runs tasks, reports progress, dispatches resolutions
//! - [`LaunchTask`] - The task kinds: `DEPLOY`, `APPLY_CODE_CHANGES`,
//!   `UNIFIED_DEPLOY`, `LIVE_UPDATE_MONITORING`, `LAUNCH_ACTIVITY`
//! - [`LaunchResult`] - What a task reports back
//! - [`DeviceSession`] - Transport, device and installer of one run
//! - [`Settings`], [`load_settings()`] - `.droidswap/config.toml`

pub mod config;
pub mod orchestrator;
pub mod result;
pub mod session;
pub mod tasks;

pub use config::{init_config_dir, load_settings, read_settings, Settings};
pub use orchestrator::{LaunchOrchestrator, LaunchStats};
pub use result::LaunchResult;
pub use session::DeviceSession;
pub use tasks::{
    ApplyCodeChangesTask, ConsolePrinter, InstallTask, LaunchActivityTask, LaunchStatus,
    LaunchTask, LiveUpdateMonitoringTask, MonitorCallback, TaskContext, UnifiedDeployTask,
};
