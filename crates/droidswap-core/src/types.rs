//! Domain types shared by every layer of the deploy pipeline

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

// ─────────────────────────────────────────────────────────────────
// Package
// ─────────────────────────────────────────────────────────────────

/// An application id plus the APK files that make it up, in install order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub app_id: String,
    pub apks: Vec<PathBuf>,
}

impl Package {
    pub fn new(app_id: impl Into<String>, apks: Vec<PathBuf>) -> Self {
        Self {
            app_id: app_id.into(),
            apks,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Metrics
// ─────────────────────────────────────────────────────────────────

/// A named timing span, relative to the task-wide monotonic anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployMetric {
    pub name: String,
    pub start_ns: u64,
    pub end_ns: u64,
    pub thread_id: u64,
    pub status: Option<String>,
}

impl DeployMetric {
    pub fn duration_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}

/// Outcome of one package's deploy attempt
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployResult {
    pub app_id: String,
    /// No changes were detected, nothing was pushed to the device
    pub skipped_install: bool,
    pub metrics: Vec<DeployMetric>,
}

impl DeployResult {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Default::default()
        }
    }

    pub fn skipped(mut self) -> Self {
        self.skipped_install = true;
        self
    }
}

/// Flattened telemetry record derived 1:1 from a [`DeployMetric`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchTaskDetail {
    pub id: String,
    pub start_timestamp_ms: i64,
    pub end_timestamp_ms: i64,
    pub thread_id: u64,
    pub status: Option<String>,
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// Small stable numeric id for the current thread, used in metrics.
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}

// ─────────────────────────────────────────────────────────────────
// Resolution actions
// ─────────────────────────────────────────────────────────────────

/// Recovery operation suggested to the user after a failed deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionAction {
    None,
    Retry,
    ApplyChanges,
    RunApp,
}

/// Receiver of a resolution hyperlink click (or of an automatic
/// resolution when the run is in fallback mode).
pub trait ResolutionHandler {
    fn retry(&self);
    fn apply_changes(&self);
    fn run_app(&self);
}

impl ResolutionAction {
    /// Hyperlink labels offered for this action, in display order.
    pub fn options(&self) -> &'static [&'static str] {
        match self {
            ResolutionAction::None => &[],
            ResolutionAction::Retry => &["Retry"],
            ResolutionAction::ApplyChanges => &["Apply Changes", "Rerun"],
            ResolutionAction::RunApp => &["Rerun"],
        }
    }

    /// Primary hyperlink label, if any
    pub fn label(&self) -> Option<&'static str> {
        self.options().first().copied()
    }

    /// Invoke the handler matching this action. Returns false for `None`.
    pub fn dispatch(&self, handler: &dyn ResolutionHandler) -> bool {
        match self {
            ResolutionAction::None => return false,
            ResolutionAction::Retry => handler.retry(),
            ResolutionAction::ApplyChanges => handler.apply_changes(),
            ResolutionAction::RunApp => handler.run_app(),
        }
        true
    }
}

impl std::fmt::Display for ResolutionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionAction::None => write!(f, "NONE"),
            ResolutionAction::Retry => write!(f, "RETRY"),
            ResolutionAction::ApplyChanges => write!(f, "APPLY_CHANGES"),
            ResolutionAction::RunApp => write!(f, "RUN_APP"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Device state
// ─────────────────────────────────────────────────────────────────

/// Connection state reported by `adb devices`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Online,
    Offline,
    Unauthorized,
    #[default]
    Unknown,
}

impl DeviceState {
    pub fn parse(value: &str) -> Self {
        match value {
            "device" => DeviceState::Online,
            "offline" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            _ => DeviceState::Unknown,
        }
    }
}
