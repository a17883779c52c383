//! Shared driver of the deploy tasks
//!
//! Runs one deployer operation per package, in order, and turns the outcome
//! into a [`LaunchResult`]. The first failing package stops the task; later
//! packages are never touched.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::TaskContext;
use crate::result::LaunchResult;
use droidswap_core::prelude::*;
use droidswap_core::{LaunchEvent, LaunchTaskDetail, Package, ResolutionAction};
use droidswap_deployer::{DeployerError, InstallOptions, MetricsRecorder, Redefiner};
use droidswap_device::DeviceTransport;

/// Which deployer operation a task runs for each package
pub enum DeployOperation<'a> {
    Install(&'a InstallOptions),
    CodeSwap(&'a [Arc<dyn Redefiner>]),
    FullSwap,
}

impl DeployOperation<'_> {
    fn name(&self) -> &'static str {
        match self {
            DeployOperation::Install(_) => "install",
            DeployOperation::CodeSwap(_) => "code swap",
            DeployOperation::FullSwap => "full swap",
        }
    }
}

/// Deploy `packages` one by one with `operation`.
///
/// `task_id` prefixes every launch detail; `title` is the user-facing name
/// used in notifications.
pub async fn run_deploy<T: DeviceTransport>(
    ctx: &mut TaskContext<'_, T>,
    task_id: &str,
    title: &str,
    packages: &[Package],
    operation: DeployOperation<'_>,
) -> LaunchResult {
    let started = Instant::now();
    let metrics = MetricsRecorder::new();
    let mut details: Vec<LaunchTaskDetail> = Vec::new();
    let mut skipped: Vec<&str> = Vec::new();

    for package in packages {
        if ctx.status.is_cancelled() {
            info!("{} cancelled before {}", title, package.app_id);
            return LaunchResult::cancelled(title).with_details(details);
        }

        debug!("{}: {} {}", task_id, operation.name(), package.app_id);
        let mark = metrics.len();
        let mut deployer = ctx.session.deployer(ctx.database.clone(), metrics.clone());
        let outcome = match &operation {
            DeployOperation::Install(options) => deployer.install(package, options).await,
            DeployOperation::CodeSwap(redefiners) => {
                deployer.code_swap(package, redefiners).await
            }
            DeployOperation::FullSwap => deployer.full_swap(package).await,
        };

        match outcome {
            Ok(result) => {
                details.extend(metrics.to_details(task_id, &result.metrics));
                if result.skipped_install {
                    skipped.push(&package.app_id);
                }
            }
            Err(e) => {
                warn!("{} failed for {}: {} ({})", title, package.app_id, e, e.code());
                details.extend(metrics.to_details(task_id, &metrics.since(mark)));
                return failure_result(title, &e, ctx.fallback_mode).with_details(details);
            }
        }
    }

    let text = success_message(title, started.elapsed(), &skipped);
    info!("{}", text.replace('\n', " "));
    ctx.printer.emit(LaunchEvent::info(title, text));
    LaunchResult::success(details)
}

/// Convert a deployer failure into what the user sees
pub fn failure_result(title: &str, error: &DeployerError, fallback_mode: bool) -> LaunchResult {
    let resolution = error.resolution();

    let mut bubble = format!("{} failed.\n{}", title, error.message);
    if resolution != ResolutionAction::None {
        bubble.push_str("\nOptions: ");
        bubble.push_str(&resolution.options().join(" | "));
    }

    LaunchResult::failure(error.code(), bubble, console_error(error))
        .with_resolution(resolution, fallback_mode)
}

/// Message, raw details and guidance, one block per line
pub fn console_error(error: &DeployerError) -> String {
    let mut text = error.message.clone();
    if !error.details.trim().is_empty() {
        text.push('\n');
        text.push_str(error.details.trim_end());
    }
    text.push('\n');
    text.push_str(error.call_to_action());
    text
}

fn success_message(title: &str, elapsed: Duration, skipped: &[&str]) -> String {
    let mut text = format!(
        "{} successfully finished in {}.",
        title,
        format_duration(elapsed)
    );
    if !skipped.is_empty() {
        text.push_str(&format!(
            "\nChanges were not detected for {}, the install was skipped.",
            skipped.join(", ")
        ));
    }
    text
}

/// `850 ms`, `2 s 40 ms`, `1 m 5 s`
pub fn format_duration(elapsed: Duration) -> String {
    let ms = elapsed.as_millis();
    if ms < 1_000 {
        format!("{} ms", ms)
    } else if ms < 60_000 {
        format!("{} s {} ms", ms / 1_000, ms % 1_000)
    } else {
        format!("{} m {} s", ms / 60_000, (ms % 60_000) / 1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use droidswap_deployer::DeployErrorKind;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(850)), "850 ms");
        assert_eq!(format_duration(Duration::from_millis(2_040)), "2 s 40 ms");
        assert_eq!(format_duration(Duration::from_millis(65_300)), "1 m 5 s");
    }

    #[test]
    fn test_success_message_lists_skipped_packages() {
        let text = success_message("Install", Duration::from_millis(5), &["com.a", "com.c"]);
        assert_eq!(
            text,
            "Install successfully finished in 5 ms.\n\
             Changes were not detected for com.a, com.c, the install was skipped."
        );

        let text = success_message("Install", Duration::from_millis(5), &[]);
        assert!(!text.contains("skipped"));
    }

    #[test]
    fn test_resource_change_offers_each_option_once() {
        let error = DeployerError::new(
            DeployErrorKind::ResourceModificationNotAllowed,
            "Modifying resources requires swapping code and resources together.",
        );
        let result = failure_result("Apply Code Changes", &error, false);

        assert!(!result.success);
        assert_eq!(result.error_id, "RESOURCE_MODIFICATION_NOT_ALLOWED");
        assert_eq!(result.resolution, ResolutionAction::ApplyChanges);
        assert!(!result.auto_resolve);
        assert_eq!(result.error.matches("Apply Changes").count(), 1);
        assert_eq!(result.error.matches("Rerun").count(), 1);
        assert!(result.error.starts_with("Apply Code Changes failed.\n"));
    }

    #[test]
    fn test_unsupported_operation_has_no_options() {
        let error = DeployerError::operation_not_supported("Requires API 26.");
        let result = failure_result("Apply Changes", &error, true);

        assert_eq!(result.resolution, ResolutionAction::None);
        assert!(!result.auto_resolve);
        assert!(!result.error.contains("Options"));
    }

    #[test]
    fn test_fallback_mode_auto_resolves() {
        let error = DeployerError::install_failed("Installation failed.");
        let result = failure_result("Install", &error, true);
        assert_eq!(result.resolution, ResolutionAction::Retry);
        assert!(result.auto_resolve);
        assert!(result.error.ends_with("Options: Retry"));
    }

    #[test]
    fn test_console_error_contains_details_and_guidance() {
        let error = DeployerError::install_failed("Installation failed (INSTALL_FAILED_INSUFFICIENT_STORAGE).")
            .with_details("Failure [INSTALL_FAILED_INSUFFICIENT_STORAGE]\n");
        let text = console_error(&error);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Installation failed"));
        assert_eq!(lines[1], "Failure [INSTALL_FAILED_INSUFFICIENT_STORAGE]");
        assert_eq!(lines[2], DeployErrorKind::InstallFailed.call_to_action());
    }

    /// Cancels the run as soon as a package install is committed
    struct CancelOnCommit {
        inner: droidswap_deployer::test_utils::FakeDevice,
        status: crate::tasks::LaunchStatus,
    }

    impl DeviceTransport for CancelOnCommit {
        fn serial(&self) -> &str {
            self.inner.serial()
        }

        async fn shell(&self, args: &[&str]) -> Result<droidswap_device::ShellOutput> {
            let output = self.inner.shell(args).await?;
            if args.starts_with(&["pm", "install-commit"]) {
                self.status.cancel();
            }
            Ok(output)
        }

        async fn push(&self, local: &std::path::Path, remote: &str) -> Result<()> {
            self.inner.push(local, remote).await
        }

        async fn open_stream(&self, args: &[&str]) -> Result<droidswap_device::DeviceStream> {
            self.inner.open_stream(args).await
        }
    }

    #[tokio::test]
    async fn test_cancel_between_packages_leaves_the_rest_untouched() {
        use crate::session::DeviceSession;
        use crate::tasks::{ConsolePrinter, LaunchStatus};
        use droidswap_deployer::test_utils::{ApkBuilder, DexBuilder, FakeDevice};
        use droidswap_deployer::DexArchiveDatabase;
        use droidswap_device::InstallerConfig;

        let dir = tempfile::tempdir().unwrap();
        let apk = |app_id: &str| {
            let sub = dir.path().join(app_id);
            std::fs::create_dir_all(&sub).unwrap();
            ApkBuilder::new()
                .dex(
                    "classes.dex",
                    DexBuilder::new().class("Lcom/example/MainActivity;", &[&[0x0e00]]),
                )
                .write(&sub, "base.apk")
        };
        let packages = vec![
            Package::new("com.a", vec![apk("com.a")]),
            Package::new("com.b", vec![apk("com.b")]),
        ];

        let device = FakeDevice::new("emulator-5554", 33);
        let status = LaunchStatus::new();
        let transport = CancelOnCommit {
            inner: device.clone(),
            status: status.clone(),
        };
        let mut session =
            DeviceSession::new(transport, device.info().clone(), InstallerConfig::default());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let printer = ConsolePrinter::new(tx);
        let mut ctx = TaskContext {
            session: &mut session,
            database: DexArchiveDatabase::in_memory(),
            status: &status,
            printer: &printer,
            fallback_mode: false,
        };

        let options = InstallOptions::default();
        let result = run_deploy(
            &mut ctx,
            "DEPLOY",
            "Install",
            &packages,
            DeployOperation::Install(&options),
        )
        .await;

        assert!(result.is_cancelled());
        assert_eq!(result.error, "Install was cancelled.");
        assert!(result.details.iter().any(|d| d.id == "DEPLOY.INSTALL"));
        assert_eq!(device.installs(), 1);
        assert!(device.state().installed.contains_key("com.a"));
        assert!(!device.state().installed.contains_key("com.b"));
        assert!(!device.pushes().iter().any(|p| p.contains("com.b")));
    }
}
