//! Apply changes task (`UNIFIED_DEPLOY`)

use super::deploy::{run_deploy, DeployOperation};
use super::install::app_ids;
use super::TaskContext;
use crate::result::LaunchResult;
use droidswap_core::Package;
use droidswap_device::DeviceTransport;

pub const TASK_ID: &str = "UNIFIED_DEPLOY";
pub const TITLE: &str = "Apply Changes";

/// Swaps changed code and resources into the running app
#[derive(Debug, Clone)]
pub struct UnifiedDeployTask {
    packages: Vec<Package>,
}

impl UnifiedDeployTask {
    pub fn new(packages: Vec<Package>) -> Self {
        Self { packages }
    }

    pub fn packages(&self) -> &[Package] {
        &self.packages
    }

    pub fn description(&self) -> String {
        format!("Applying changes to {}", app_ids(&self.packages))
    }

    pub async fn run<T: DeviceTransport>(&self, ctx: &mut TaskContext<'_, T>) -> LaunchResult {
        run_deploy(
            ctx,
            TASK_ID,
            TITLE,
            &self.packages,
            DeployOperation::FullSwap,
        )
        .await
    }
}
