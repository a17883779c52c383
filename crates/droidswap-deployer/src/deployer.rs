//! Install, code swap and full swap against one device for one package

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::apk::{read_apks, ApkSnapshot};
use crate::database::DexArchiveDatabase;
use crate::diff::{plan_swap, same_contents, SwapPlan};
use crate::error::{DeployErrorKind, DeployerError, DeployerResult};
use crate::metrics::MetricsRecorder;
use crate::options::InstallOptions;
use crate::redefiner::{RedefineRequest, Redefiner};
use droidswap_core::prelude::*;
use droidswap_core::{DeployResult, Package};
use droidswap_device::{
    DeltaApk, DeltaInstallRequest, DeltaSource, DeviceInfo, DeviceTransport, DumpRequest,
    DumpResponse, InstalledApk, InstallerClient, Opcode, ShellOutput, SwapRequest, SwapResponse,
};

pub const PHASE_PARSE_APKS: &str = "PARSE_APKS";
pub const PHASE_DUMP: &str = "DUMP";
pub const PHASE_DIFF: &str = "DIFF";
pub const PHASE_PUSH: &str = "PUSH";
pub const PHASE_INSTALL: &str = "INSTALL";
pub const PHASE_REDEFINE: &str = "REDEFINE";
pub const PHASE_SWAP: &str = "SWAP";

/// Swapping needs the runtime support added in Android 8.0
pub const SWAP_MIN_API: u32 = 26;

/// Debugger class redefinition is only reliable from Android 9
pub const DEBUGGER_SWAP_MIN_API: u32 = 28;

/// Install sessions that inherit existing splits exist since Android 7.0
pub const DELTA_INSTALL_MIN_API: u32 = 24;

static SESSION_CREATED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Success: created install session \[(\d+)\]").expect("Invalid session regex")
});

static PM_FAILURE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Failure \[([^\]\s]+)").expect("Invalid pm failure regex"));

/// An APK pushed to the staging directory
#[derive(Debug, Clone)]
struct StagedApk {
    name: String,
    remote: String,
    size: u64,
}

/// Turn failing `pm` output into an install error, keeping pm's reason code
fn pm_failure(summary: &str, output: &ShellOutput) -> DeployerError {
    let combined = output.combined();
    let message = match PM_FAILURE.captures(&combined) {
        Some(caps) => format!("{} ({}).", summary, &caps[1]),
        None => format!("{}.", summary),
    };
    DeployerError::install_failed(message).with_details(combined)
}

fn digests_of_installed(apks: &[InstalledApk]) -> BTreeMap<&str, &str> {
    apks.iter()
        .map(|a| (a.name.as_str(), a.digest.as_str()))
        .collect()
}

fn digests_of(apks: &[ApkSnapshot]) -> BTreeMap<&str, &str> {
    apks.iter()
        .map(|a| (a.name.as_str(), a.digest.as_str()))
        .collect()
}

/// Orchestrates one deploy operation.
///
/// Constructed fresh for every package; the database and the metrics
/// recorder are shared with the caller.
pub struct Deployer<'a, T: DeviceTransport> {
    transport: &'a T,
    device: &'a DeviceInfo,
    installer: &'a mut InstallerClient,
    database: DexArchiveDatabase,
    metrics: MetricsRecorder,
}

impl<'a, T: DeviceTransport> Deployer<'a, T> {
    pub fn new(
        transport: &'a T,
        device: &'a DeviceInfo,
        installer: &'a mut InstallerClient,
        database: DexArchiveDatabase,
        metrics: MetricsRecorder,
    ) -> Self {
        Self {
            transport,
            device,
            installer,
            database,
            metrics,
        }
    }

    /// Push and install every APK of `package`.
    ///
    /// Skipped when the device already holds exactly these files.
    pub async fn install(
        &mut self,
        package: &Package,
        options: &InstallOptions,
    ) -> DeployerResult<DeployResult> {
        let mark = self.metrics.len();
        info!(
            "Installing {} ({} APKs) on {}",
            package.app_id,
            package.apks.len(),
            self.device.serial
        );

        let apks = self.parse_apks(package)?;
        let dump = self.dump(&package.app_id).await?;

        let fingerprint = self.device.fingerprint_key();
        let recorded = self.database.get(&fingerprint, &package.app_id)?;
        let current = recorded
            .as_deref()
            .is_some_and(|previous| same_contents(previous, &apks));
        if current && dump.installed && digests_of_installed(&dump.apks) == digests_of(&apks) {
            info!("{} is up to date on {}, skipping install", package.app_id, self.device.serial);
            return Ok(self.result(package, mark).skipped());
        }

        let flags = options.pm_flags(self.device);
        let installed_names: BTreeSet<&str> = dump.apks.iter().map(|a| a.name.as_str()).collect();
        let local_names: BTreeSet<&str> = apks.iter().map(|a| a.name.as_str()).collect();
        let delta = options.delta_install
            && dump.installed
            && self.device.api() >= DELTA_INSTALL_MIN_API
            && installed_names == local_names;

        let outcome = if delta {
            self.delta_install(package, &apks, &dump, flags).await
        } else {
            self.session_install(package, &apks, flags).await
        };
        self.cleanup_staging(&package.app_id).await;

        if let Err(e) = outcome {
            if let Err(db_err) = self.database.invalidate(&fingerprint, &package.app_id) {
                warn!("Failed to invalidate {}: {}", package.app_id, db_err);
            }
            return Err(e);
        }

        self.database.record(&fingerprint, &package.app_id, apks)?;
        Ok(self.result(package, mark))
    }

    /// Apply changed classes to the running app without restarting it.
    ///
    /// Processes with an attached debugger are updated through their
    /// `redefiners`; the installer handles the rest.
    pub async fn code_swap(
        &mut self,
        package: &Package,
        redefiners: &[Arc<dyn Redefiner>],
    ) -> DeployerResult<DeployResult> {
        self.check_swap_supported()?;

        let api = self.device.api();
        if !redefiners.is_empty() && api < DEBUGGER_SWAP_MIN_API {
            return Err(DeployerError::operation_not_supported(format!(
                "Changing code while a debugger is attached requires API {} or higher; {} runs API {}.",
                DEBUGGER_SWAP_MIN_API,
                self.device.display_name(),
                api
            )));
        }

        self.swap(package, redefiners, false).await
    }

    /// Apply changed classes and resources to the running app
    pub async fn full_swap(&mut self, package: &Package) -> DeployerResult<DeployResult> {
        self.check_swap_supported()?;
        self.swap(package, &[], true).await
    }

    fn check_swap_supported(&self) -> DeployerResult<()> {
        let api = self.device.api();
        if api < SWAP_MIN_API {
            return Err(DeployerError::operation_not_supported(format!(
                "Changing a running app requires API {} or higher; {} runs API {}.",
                SWAP_MIN_API,
                self.device.display_name(),
                api
            )));
        }
        Ok(())
    }

    fn result(&self, package: &Package, mark: usize) -> DeployResult {
        let mut result = DeployResult::new(&package.app_id);
        result.metrics = self.metrics.since(mark);
        result
    }

    fn parse_apks(&self, package: &Package) -> DeployerResult<Vec<ApkSnapshot>> {
        let phase = self.metrics.phase(PHASE_PARSE_APKS);
        if package.apks.is_empty() {
            return Err(DeployerError::new(
                DeployErrorKind::InvalidApk,
                format!("No APKs to deploy for {}.", package.app_id),
            ));
        }
        let apks = read_apks(&package.apks)?;
        phase.done();
        Ok(apks)
    }

    async fn dump(&mut self, app_id: &str) -> DeployerResult<DumpResponse> {
        let phase = self.metrics.phase(PHASE_DUMP);
        self.installer.ensure_running(self.transport).await?;

        let response = self
            .installer
            .request(
                Opcode::Dump,
                &DumpRequest {
                    package: app_id.to_string(),
                },
            )
            .await?;
        if !response.ok {
            return Err(DeployerError::new(
                DeployErrorKind::DumpFailed,
                format!("Could not read the installed state of {}.", app_id),
            )
            .with_details(response.error_message()));
        }

        let dump: DumpResponse = response.parse()?;
        debug!(
            "Dump of {}: installed={} apks={} pids={:?}",
            app_id,
            dump.installed,
            dump.apks.len(),
            dump.pids
        );
        phase.done();
        Ok(dump)
    }

    /// Push the APKs selected by `include` to the staging directory
    async fn push<F>(
        &self,
        package: &Package,
        apks: &[ApkSnapshot],
        include: F,
    ) -> DeployerResult<Vec<StagedApk>>
    where
        F: Fn(&ApkSnapshot) -> bool,
    {
        let phase = self.metrics.phase(PHASE_PUSH);
        let staging = self.installer.config().staging_dir(&package.app_id);

        let mkdir = self.transport.shell(&["mkdir", "-p", &staging]).await?;
        if !mkdir.success() {
            return Err(DeployerError::new(
                DeployErrorKind::Transport,
                format!("Could not create {} on the device.", staging),
            )
            .with_details(mkdir.combined()));
        }

        let mut staged = Vec::new();
        for (local, apk) in package.apks.iter().zip(apks) {
            if !include(apk) {
                continue;
            }
            let remote = format!("{}/{}", staging, apk.name);
            let size = std::fs::metadata(local).map_err(Error::from)?.len();
            self.transport.push(local, &remote).await?;
            staged.push(StagedApk {
                name: apk.name.clone(),
                remote,
                size,
            });
        }

        debug!("Pushed {} of {} APKs", staged.len(), apks.len());
        phase.done();
        Ok(staged)
    }

    async fn session_install(
        &self,
        package: &Package,
        apks: &[ApkSnapshot],
        flags: Vec<String>,
    ) -> DeployerResult<()> {
        let staged = self.push(package, apks, |_| true).await?;
        let phase = self.metrics.phase(PHASE_INSTALL);

        let mut create = vec!["pm", "install-create"];
        create.extend(flags.iter().map(String::as_str));
        let output = self.transport.shell(&create).await?;
        let session = SESSION_CREATED
            .captures(&output.stdout)
            .map(|caps| caps[1].to_string())
            .ok_or_else(|| pm_failure("Could not create an install session", &output))?;

        for apk in &staged {
            let size = apk.size.to_string();
            let output = self
                .transport
                .shell(&[
                    "pm",
                    "install-write",
                    "-S",
                    &size,
                    &session,
                    &apk.name,
                    &apk.remote,
                ])
                .await?;
            if !output.success() || !output.stdout.contains("Success") {
                self.abandon(&session).await;
                return Err(pm_failure(&format!("Could not write {}", apk.name), &output));
            }
        }

        let output = self
            .transport
            .shell(&["pm", "install-commit", &session])
            .await?;
        if !output.success() || !output.stdout.contains("Success") {
            return Err(pm_failure(
                &format!("Installation of {} failed", package.app_id),
                &output,
            ));
        }

        info!("Installed {} (session {})", package.app_id, session);
        phase.done();
        Ok(())
    }

    async fn abandon(&self, session: &str) {
        if let Err(e) = self
            .transport
            .shell(&["pm", "install-abandon", session])
            .await
        {
            debug!("Failed to abandon install session {}: {}", session, e);
        }
    }

    async fn delta_install(
        &mut self,
        package: &Package,
        apks: &[ApkSnapshot],
        dump: &DumpResponse,
        flags: Vec<String>,
    ) -> DeployerResult<()> {
        let installed = digests_of_installed(&dump.apks);
        let staged = self
            .push(package, apks, |apk| {
                installed.get(apk.name.as_str()) != Some(&apk.digest.as_str())
            })
            .await?;

        let mut phase = self.metrics.phase(PHASE_INSTALL);
        phase.set_status("DELTA");

        let request = DeltaInstallRequest {
            package: package.app_id.clone(),
            apks: apks
                .iter()
                .map(|apk| DeltaApk {
                    name: apk.name.clone(),
                    source: match staged.iter().find(|s| s.name == apk.name) {
                        Some(s) => DeltaSource::Pushed {
                            remote_path: s.remote.clone(),
                        },
                        None => DeltaSource::Installed,
                    },
                })
                .collect(),
            options: flags,
        };

        let response = self.installer.request(Opcode::DeltaInstall, &request).await?;
        if !response.ok {
            return Err(DeployerError::install_failed(format!(
                "Delta installation of {} failed.",
                package.app_id
            ))
            .with_details(response.error_message()));
        }

        info!(
            "Delta installed {} ({} of {} APKs changed)",
            package.app_id,
            staged.len(),
            apks.len()
        );
        phase.done();
        Ok(())
    }

    async fn swap(
        &mut self,
        package: &Package,
        redefiners: &[Arc<dyn Redefiner>],
        full: bool,
    ) -> DeployerResult<DeployResult> {
        let mark = self.metrics.len();
        info!(
            "{} swap of {} on {}",
            if full { "Full" } else { "Code" },
            package.app_id,
            self.device.serial
        );

        let apks = self.parse_apks(package)?;
        let fingerprint = self.device.fingerprint_key();

        let diff_phase = self.metrics.phase(PHASE_DIFF);
        let previous = self
            .database
            .get(&fingerprint, &package.app_id)?
            .ok_or_else(|| {
                DeployerError::new(
                    DeployErrorKind::RemoteApkNotFoundInDb,
                    format!(
                        "No previous deployment of {} is recorded for this device.",
                        package.app_id
                    ),
                )
            })?;
        let plan = plan_swap(&previous, &apks, full)?;
        diff_phase.done();

        if plan.is_noop() {
            info!("{} is unchanged, nothing to swap", package.app_id);
            self.database.record(&fingerprint, &package.app_id, apks)?;
            return Ok(self.result(package, mark).skipped());
        }

        let dump = self.dump(&package.app_id).await?;
        if !dump.installed || digests_of_installed(&dump.apks) != digests_of(&previous) {
            if let Err(e) = self.database.invalidate(&fingerprint, &package.app_id) {
                warn!("Failed to invalidate {}: {}", package.app_id, e);
            }
            return Err(DeployerError::new(
                DeployErrorKind::RemoteApkNotFoundInDb,
                format!(
                    "The installed version of {} does not match the last deployment.",
                    package.app_id
                ),
            ));
        }
        if dump.pids.is_empty() {
            return Err(DeployerError::new(
                DeployErrorKind::AppNotRunning,
                format!("{} is not running.", package.app_id),
            ));
        }

        let outcome = self
            .apply_swap(package, &apks, &plan, &dump.pids, redefiners, full)
            .await;
        self.cleanup_staging(&package.app_id).await;
        let (request, swapped) = outcome?;

        self.database.record(&fingerprint, &package.app_id, apks)?;

        info!(
            "Swapped {} classes{} in {} processes of {}",
            plan.changed_classes.len(),
            if request.resources { " and resources" } else { "" },
            swapped.swapped_pids.len() + request.skip_pids.len(),
            package.app_id
        );
        Ok(self.result(package, mark))
    }

    /// Stage the changed APKs, redefine in debugged processes and swap the
    /// rest. The caller cleans the staging directory whatever the outcome.
    async fn apply_swap(
        &mut self,
        package: &Package,
        apks: &[ApkSnapshot],
        plan: &SwapPlan,
        running: &[u32],
        redefiners: &[Arc<dyn Redefiner>],
        full: bool,
    ) -> DeployerResult<(SwapRequest, SwapResponse)> {
        let staged = self
            .push(package, apks, |apk| plan.changed_apks.contains(&apk.name))
            .await?;
        let staged_apks: Vec<String> = staged.iter().map(|s| s.remote.clone()).collect();

        let mut skip_pids = Vec::new();
        if !redefiners.is_empty() {
            let phase = self.metrics.phase(PHASE_REDEFINE);
            let request = RedefineRequest {
                package: package.app_id.clone(),
                classes: plan.changed_classes.clone(),
                staged_apks: staged_apks.clone(),
            };
            for redefiner in redefiners {
                let pid = redefiner.pid();
                if !running.contains(&pid) {
                    warn!("Debugged process {} is not running {}", pid, package.app_id);
                    continue;
                }
                redefiner.redefine(&request).map_err(|reason| {
                    DeployerError::new(
                        DeployErrorKind::RedefinitionFailed,
                        format!("Could not redefine classes in process {}.", pid),
                    )
                    .with_details(reason)
                })?;
                skip_pids.push(pid);
            }
            phase.done();
        }

        let phase = self.metrics.phase(PHASE_SWAP);
        let request = SwapRequest {
            package: package.app_id.clone(),
            staged_apks,
            classes: plan.changed_classes.clone(),
            resources: full && plan.resources_changed,
            skip_pids,
        };
        let response = self.installer.request(Opcode::Swap, &request).await?;
        if !response.ok {
            return Err(DeployerError::swap_failed(format!(
                "Could not apply changes to {}.",
                package.app_id
            ))
            .with_details(response.error_message()));
        }
        let swapped: SwapResponse = response.parse()?;
        phase.done();
        Ok((request, swapped))
    }

    async fn cleanup_staging(&self, app_id: &str) {
        let staging = self.installer.config().staging_dir(app_id);
        match self.transport.shell(&["rm", "-rf", &staging]).await {
            Ok(output) if !output.success() => {
                debug!("Failed to clean {}: {}", staging, output.combined())
            }
            Err(e) => debug!("Failed to clean {}: {}", staging, e),
            Ok(_) => {}
        }
    }
}
