//! Apply code changes task (`APPLY_CODE_CHANGES`)

use std::sync::Arc;

use super::deploy::{run_deploy, DeployOperation};
use super::install::app_ids;
use super::TaskContext;
use crate::result::LaunchResult;
use droidswap_core::Package;
use droidswap_deployer::Redefiner;
use droidswap_device::DeviceTransport;

pub const TASK_ID: &str = "APPLY_CODE_CHANGES";
pub const TITLE: &str = "Apply Code Changes";

/// Swaps changed classes into the running app.
///
/// Processes under a debugger are redefined through `redefiners`.
#[derive(Clone)]
pub struct ApplyCodeChangesTask {
    packages: Vec<Package>,
    redefiners: Vec<Arc<dyn Redefiner>>,
}

impl ApplyCodeChangesTask {
    pub fn new(packages: Vec<Package>, redefiners: Vec<Arc<dyn Redefiner>>) -> Self {
        Self {
            packages,
            redefiners,
        }
    }

    pub fn packages(&self) -> &[Package] {
        &self.packages
    }

    pub fn description(&self) -> String {
        format!("Applying code changes to {}", app_ids(&self.packages))
    }

    pub async fn run<T: DeviceTransport>(&self, ctx: &mut TaskContext<'_, T>) -> LaunchResult {
        run_deploy(
            ctx,
            TASK_ID,
            TITLE,
            &self.packages,
            DeployOperation::CodeSwap(&self.redefiners),
        )
        .await
    }
}
