//! Turning a CLI command into a launch and running it

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use droidswap_core::prelude::*;
use droidswap_core::{LaunchEvent, Package, ResolutionAction, ResolutionHandler};
use droidswap_deployer::DexArchiveDatabase;
use droidswap_device::{DeviceInfo, DeviceTransport};
use droidswap_launch::{
    ApplyCodeChangesTask, DeviceSession, InstallTask, LaunchActivityTask, LaunchOrchestrator,
    LaunchStats, LaunchStatus, LaunchTask, LiveUpdateMonitoringTask, MonitorCallback, Settings,
    UnifiedDeployTask,
};

/// What the user asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    /// Install only
    Install,
    /// Swap changed classes into the running app
    ApplyCodeChanges,
    /// Swap changed classes and resources into the running app
    ApplyChanges,
    /// Install, start monitoring and launch
    Run,
}

impl RunKind {
    /// Command to run when the user (or fallback mode) picks `action`
    /// after this kind of run failed
    pub fn follow_up(self, action: ResolutionAction) -> Option<RunKind> {
        match action {
            ResolutionAction::None => None,
            ResolutionAction::Retry => Some(self),
            ResolutionAction::ApplyChanges => Some(RunKind::ApplyChanges),
            ResolutionAction::RunApp => Some(RunKind::Run),
        }
    }
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunKind::Install => write!(f, "install"),
            RunKind::ApplyCodeChanges => write!(f, "apply-code-changes"),
            RunKind::ApplyChanges => write!(f, "apply-changes"),
            RunKind::Run => write!(f, "run"),
        }
    }
}

/// `APP_ID=APK[,APK...]` from the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageArg(pub Package);

impl FromStr for PackageArg {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let (app_id, apks) = value
            .split_once('=')
            .ok_or_else(|| format!("expected APP_ID=APK[,APK...], got '{}'", value))?;
        let app_id = app_id.trim();
        if app_id.is_empty() {
            return Err("application id is empty".to_string());
        }
        let apks: Vec<PathBuf> = apks
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();
        if apks.is_empty() {
            return Err(format!("no APKs given for {}", app_id));
        }
        Ok(PackageArg(Package::new(app_id, apks)))
    }
}

/// One run invocation
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub kind: RunKind,
    pub packages: Vec<Package>,
    /// Activity to start for [`RunKind::Run`]; the launcher activity when `None`
    pub activity: Option<String>,
    pub fallback: bool,
}

/// Resolve relative APK paths against the project directory
pub fn resolve_packages(project: &Path, packages: Vec<Package>) -> Vec<Package> {
    packages
        .into_iter()
        .map(|package| Package {
            apks: package
                .apks
                .into_iter()
                .map(|apk| if apk.is_absolute() { apk } else { project.join(apk) })
                .collect(),
            ..package
        })
        .collect()
}

/// Tasks for one kind of run
pub fn build_tasks(
    kind: RunKind,
    request: &RunRequest,
    settings: &Settings,
    monitor: Option<MonitorCallback>,
) -> Vec<LaunchTask> {
    let packages = request.packages.clone();
    match kind {
        RunKind::Install => vec![InstallTask::new(packages, settings.install_options()).into()],
        RunKind::ApplyCodeChanges => {
            vec![ApplyCodeChangesTask::new(packages, Vec::new()).into()]
        }
        RunKind::ApplyChanges => vec![UnifiedDeployTask::new(packages).into()],
        RunKind::Run => {
            let app_ids: Vec<String> = packages.iter().map(|p| p.app_id.clone()).collect();
            let mut tasks: Vec<LaunchTask> = vec![
                InstallTask::new(packages, settings.install_options()).into(),
                LiveUpdateMonitoringTask::new(
                    app_ids.clone(),
                    settings.monitoring.live_update,
                    monitor,
                )
                .into(),
            ];
            // the first package is the app, the rest are its dependencies
            if let Some(app_id) = app_ids.first() {
                tasks.push(LaunchActivityTask::new(app_id.clone(), request.activity.clone()).into());
            }
            tasks
        }
    }
}

/// Records the resolution picked in fallback mode
#[derive(Debug, Default)]
pub struct FallbackHandler {
    picked: Mutex<Option<ResolutionAction>>,
}

impl FallbackHandler {
    fn pick(&self, action: ResolutionAction) {
        if let Ok(mut picked) = self.picked.lock() {
            *picked = Some(action);
        }
    }

    pub fn take(&self) -> Option<ResolutionAction> {
        self.picked.lock().ok().and_then(|mut p| p.take())
    }
}

impl ResolutionHandler for FallbackHandler {
    fn retry(&self) {
        self.pick(ResolutionAction::Retry);
    }

    fn apply_changes(&self) {
        self.pick(ResolutionAction::ApplyChanges);
    }

    fn run_app(&self) {
        self.pick(ResolutionAction::RunApp);
    }
}

/// Monitor that reports on the run console
pub fn console_monitor(events: mpsc::UnboundedSender<LaunchEvent>) -> MonitorCallback {
    Arc::new(move |app_id: &str, device: &DeviceInfo| -> Result<()> {
        events
            .send(LaunchEvent::stdout(format!(
                "Live update monitoring started for {} on {}",
                app_id,
                device.display_name()
            )))
            .map_err(|e| Error::channel_send(e.to_string()))
    })
}

/// Run `request` on `session`.
///
/// In fallback mode a failed run is followed by the resolution it
/// suggested, once.
pub async fn execute<T: DeviceTransport>(
    session: &mut DeviceSession<T>,
    database: DexArchiveDatabase,
    settings: &Settings,
    request: &RunRequest,
    status: LaunchStatus,
    events: mpsc::UnboundedSender<LaunchEvent>,
) -> LaunchStats {
    let fallback = request.fallback || settings.behavior.fallback_mode;
    let handler = Arc::new(FallbackHandler::default());
    let orchestrator = LaunchOrchestrator::new(events.clone())
        .with_status(status)
        .with_fallback_mode(fallback)
        .with_resolution_handler(handler.clone());

    let tasks = build_tasks(
        request.kind,
        request,
        settings,
        Some(console_monitor(events.clone())),
    );
    let stats = orchestrator.run(session, database.clone(), &tasks).await;
    if stats.success {
        return stats;
    }

    let Some(next) = handler
        .take()
        .and_then(|action| request.kind.follow_up(action))
    else {
        return stats;
    };

    info!("Fallback: running {} after failed {}", next, request.kind);
    let tasks = build_tasks(next, request, settings, Some(console_monitor(events)));
    orchestrator.run(session, database, &tasks).await
}
