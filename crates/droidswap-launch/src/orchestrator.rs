//! Runs the tasks of one launch in order
//!
//! The orchestrator owns nothing device-specific; it borrows a
//! [`DeviceSession`] for the run, reports progress by task weight, stops at
//! the first failing task and collects every task's
//! launch details into one [`LaunchStats`] record.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::result::{LaunchResult, CANCELLED_ERROR_ID};
use crate::session::DeviceSession;
use crate::tasks::{ConsolePrinter, LaunchStatus, LaunchTask, TaskContext};
use droidswap_core::prelude::*;
use droidswap_core::{
    LaunchEvent, LaunchTaskDetail, NotificationKind, ResolutionAction, ResolutionHandler,
};
use droidswap_deployer::DexArchiveDatabase;
use droidswap_device::DeviceTransport;

/// Telemetry of one run
#[derive(Debug, Clone, Serialize)]
pub struct LaunchStats {
    pub device: String,
    /// Ids of the tasks that ran, in order
    pub tasks: Vec<String>,
    pub details: Vec<LaunchTaskDetail>,
    pub success: bool,
    pub failed_task: Option<String>,
    pub error_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Sequences launch tasks and reports their outcome
pub struct LaunchOrchestrator {
    status: LaunchStatus,
    printer: ConsolePrinter,
    fallback_mode: bool,
    resolution_handler: Option<Arc<dyn ResolutionHandler + Send + Sync>>,
}

impl LaunchOrchestrator {
    pub fn new(events: mpsc::UnboundedSender<LaunchEvent>) -> Self {
        Self {
            status: LaunchStatus::new(),
            printer: ConsolePrinter::new(events),
            fallback_mode: false,
            resolution_handler: None,
        }
    }

    pub fn with_fallback_mode(mut self, enabled: bool) -> Self {
        self.fallback_mode = enabled;
        self
    }

    pub fn with_resolution_handler(
        mut self,
        handler: Arc<dyn ResolutionHandler + Send + Sync>,
    ) -> Self {
        self.resolution_handler = Some(handler);
        self
    }

    /// Share a cancellation flag created elsewhere
    pub fn with_status(mut self, status: LaunchStatus) -> Self {
        self.status = status;
        self
    }

    /// Handle for cancelling the run from elsewhere
    pub fn status(&self) -> LaunchStatus {
        self.status.clone()
    }

    pub async fn run<T: DeviceTransport>(
        &self,
        session: &mut DeviceSession<T>,
        database: DexArchiveDatabase,
        tasks: &[LaunchTask],
    ) -> LaunchStats {
        let started = Instant::now();
        let mut stats = LaunchStats {
            device: session.device().serial.clone(),
            tasks: Vec::new(),
            details: Vec::new(),
            success: true,
            failed_task: None,
            error_id: None,
            started_at: Utc::now(),
            duration_ms: 0,
        };

        let total: u32 = tasks.iter().map(LaunchTask::duration).sum::<u32>().max(1);
        let mut completed = 0u32;
        self.printer.emit(LaunchEvent::Progress { fraction: 0.0 });

        for task in tasks {
            if self.status.is_cancelled() {
                info!("Launch cancelled before {}", task.id());
                self.printer.stdout(format!("{}.", Error::cancelled("Launch")));
                stats.success = false;
                stats.failed_task = Some(task.id().to_string());
                stats.error_id = Some(CANCELLED_ERROR_ID.to_string());
                break;
            }

            info!("Running {} on {}", task.id(), stats.device);
            self.printer.emit(LaunchEvent::TaskStarted {
                task_id: task.id().to_string(),
                description: task.description(),
            });

            let mut ctx = TaskContext {
                session: &mut *session,
                database: database.clone(),
                status: &self.status,
                printer: &self.printer,
                fallback_mode: self.fallback_mode,
            };
            let result = task.run(&mut ctx).await;

            stats.tasks.push(task.id().to_string());
            stats.details.extend(result.details.iter().cloned());
            self.printer.emit(LaunchEvent::TaskFinished {
                task_id: task.id().to_string(),
                success: result.success,
            });

            if !result.success {
                self.report_failure(task, &result);
                stats.success = false;
                stats.failed_task = Some(task.id().to_string());
                stats.error_id = Some(result.error_id.clone());
                break;
            }

            completed += task.duration();
            self.printer.emit(LaunchEvent::Progress {
                fraction: f64::from(completed) / f64::from(total),
            });
        }

        stats.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if stats.success {
            info!("Launch finished on {} in {}ms", stats.device, stats.duration_ms);
        } else {
            info!(
                "Launch failed on {} at {:?} ({:?})",
                stats.device, stats.failed_task, stats.error_id
            );
        }
        stats
    }

    /// Show a failed result, or resolve it right away in fallback mode
    fn report_failure(&self, task: &LaunchTask, result: &LaunchResult) {
        if !result.console_error.is_empty() {
            self.printer.stderr(result.console_error.clone());
        }

        if result.auto_resolve {
            if let Some(handler) = &self.resolution_handler {
                let label = result.resolution.label().unwrap_or_default();
                info!("Fallback: {} after {}", result.resolution, task.id());
                self.printer.stdout(format!("Falling back to {}.", label));
                result.resolution.dispatch(handler.as_ref());
                return;
            }
            debug!("Fallback requested but no resolution handler is set");
        }

        let resolution = (result.resolution != ResolutionAction::None).then_some(result.resolution);
        self.printer.emit(LaunchEvent::Notification {
            kind: NotificationKind::Error,
            title: task.id().to_string(),
            text: result.error.clone(),
            resolution,
        });
    }
}
