//! # droidswap-device - Device Access
//!
//! Everything that talks to an Android device: the adb-backed transport,
//! device discovery, and the client for the long-lived on-device installer.
//!
//! Depends on [`droidswap_core`] for error handling and domain types.
//!
//! ## Public API
//!
//! ### Transport
//! - [`DeviceTransport`] - Shell, push and raw streams for one device
//! - [`AdbTransport`] - Implementation backed by the `adb` executable
//! - [`locate_adb()`] - Find adb in the SDK or on `PATH`
//!
//! ### Discovery
//! - [`DeviceInfo`] - A device with its build properties
//! - [`discover_devices()`], [`read_device_properties()`], [`select_device()`]
//!
//! ### Installer
//! - [`InstallerClient`] - Bootstraps the installer and exchanges framed requests
//! - [`InstallerConfig`], [`InstallerState`]

pub mod adb;
pub mod devices;
pub mod installer;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod transport;

pub use adb::locate_adb;
pub use devices::{
    discover_devices, parse_adb_devices, parse_getprop, read_device_properties, select_device,
    DeviceInfo,
};
pub use installer::codec::Opcode;
pub use installer::protocol::{
    DeltaApk, DeltaInstallRequest, DeltaSource, DumpRequest, DumpResponse, InstalledApk,
    InstallerResponse, SwapRequest, SwapResponse,
};
pub use installer::{InstallerClient, InstallerConfig, InstallerState, INSTALLER_VERSION};
pub use transport::{
    with_retry_once, AdbTransport, DeviceStream, DeviceTransport, LocalDeviceTransport,
    ShellOutput,
};
