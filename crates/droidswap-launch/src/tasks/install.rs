//! Install task (`DEPLOY`)

use super::deploy::{run_deploy, DeployOperation};
use super::TaskContext;
use crate::result::LaunchResult;
use droidswap_core::Package;
use droidswap_deployer::InstallOptions;
use droidswap_device::DeviceTransport;

pub const TASK_ID: &str = "DEPLOY";
pub const TITLE: &str = "Install";

/// Installs every package, skipping those already on the device
#[derive(Debug, Clone)]
pub struct InstallTask {
    packages: Vec<Package>,
    options: InstallOptions,
}

impl InstallTask {
    pub fn new(packages: Vec<Package>, options: InstallOptions) -> Self {
        Self { packages, options }
    }

    pub fn packages(&self) -> &[Package] {
        &self.packages
    }

    pub fn description(&self) -> String {
        format!("Installing {}", app_ids(&self.packages))
    }

    pub async fn run<T: DeviceTransport>(&self, ctx: &mut TaskContext<'_, T>) -> LaunchResult {
        run_deploy(
            ctx,
            TASK_ID,
            TITLE,
            &self.packages,
            DeployOperation::Install(&self.options),
        )
        .await
    }
}

pub(crate) fn app_ids(packages: &[Package]) -> String {
    packages
        .iter()
        .map(|p| p.app_id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
