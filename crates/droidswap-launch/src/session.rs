//! One device, for the length of one run

use droidswap_core::prelude::*;
use droidswap_deployer::{DexArchiveDatabase, Deployer, MetricsRecorder};
use droidswap_device::{DeviceInfo, DeviceTransport, InstallerClient, InstallerConfig, InstallerState};

/// Transport, device properties and installer client of one run.
///
/// Call [`DeviceSession::close`] when the run ends so the installer exits
/// cleanly; dropping the session only closes the installer stream.
pub struct DeviceSession<T: DeviceTransport> {
    transport: T,
    device: DeviceInfo,
    installer: InstallerClient,
}

impl<T: DeviceTransport> std::fmt::Debug for DeviceSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device", &self.device.serial)
            .field("installer", &self.installer)
            .finish()
    }
}

impl<T: DeviceTransport> DeviceSession<T> {
    pub fn new(transport: T, device: DeviceInfo, config: InstallerConfig) -> Self {
        let installer = InstallerClient::new(config, device.abi.clone());
        Self {
            transport,
            device,
            installer,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn installer_state(&self) -> InstallerState {
        self.installer.state()
    }

    /// A deployer borrowing this session's device and installer
    pub fn deployer(
        &mut self,
        database: DexArchiveDatabase,
        metrics: MetricsRecorder,
    ) -> Deployer<'_, T> {
        Deployer::new(
            &self.transport,
            &self.device,
            &mut self.installer,
            database,
            metrics,
        )
    }

    /// End the session, asking the installer to exit
    pub async fn close(mut self) {
        if self.installer.state() != InstallerState::NotStarted {
            debug!("Shutting down installer on {}", self.device.serial);
        }
        self.installer.shutdown().await;
    }
}

impl<T: DeviceTransport> Drop for DeviceSession<T> {
    fn drop(&mut self) {
        if self.installer.state() == InstallerState::Ready {
            debug!(
                "Session for {} dropped with a running installer, closing its stream",
                self.device.serial
            );
        }
    }
}
