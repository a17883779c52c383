//! Structured deploy failures
//!
//! Every failure leaving the [`Deployer`](crate::Deployer) is a
//! [`DeployerError`]. Its kind fixes the error code and the single
//! [`ResolutionAction`] offered to the user; callers above this layer only
//! look at those, never at the lower-level error that caused it.

use droidswap_core::{Error as CoreError, ResolutionAction};
use thiserror::Error;

/// Result type alias for deployer operations
pub type DeployerResult<T> = std::result::Result<T, DeployerError>;

/// What went wrong, at the granularity the user can act on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeployErrorKind {
    // ─────────────────────────────────────────────────────────────
    // Preconditions
    // ─────────────────────────────────────────────────────────────
    OperationNotSupported,
    InvalidApk,

    // ─────────────────────────────────────────────────────────────
    // Incompatible changes (swap)
    // ─────────────────────────────────────────────────────────────
    RemoteApkNotFoundInDb,
    DifferentApkSet,
    ManifestChanged,
    ClassRemoved,
    ResourceModificationNotAllowed,
    AppNotRunning,

    // ─────────────────────────────────────────────────────────────
    // Device-side failures
    // ─────────────────────────────────────────────────────────────
    DumpFailed,
    InstallFailed,
    SwapFailed,
    RedefinitionFailed,

    // ─────────────────────────────────────────────────────────────
    // Lower-level failures converted at the deployer boundary
    // ─────────────────────────────────────────────────────────────
    Transport,
    InstallerBootstrap,
    InstallerProtocol,
    Database,
    Internal,
}

impl DeployErrorKind {
    /// Stable identifier used as the launch result's error id
    pub fn code(&self) -> &'static str {
        match self {
            DeployErrorKind::OperationNotSupported => "OPERATION_NOT_SUPPORTED",
            DeployErrorKind::InvalidApk => "INVALID_APK",
            DeployErrorKind::RemoteApkNotFoundInDb => "REMOTE_APK_NOT_FOUND_IN_DB",
            DeployErrorKind::DifferentApkSet => "DIFFERENT_NUMBER_OF_APKS",
            DeployErrorKind::ManifestChanged => "CANNOT_SWAP_MANIFEST_CHANGES",
            DeployErrorKind::ClassRemoved => "CANNOT_REMOVE_CLASS",
            DeployErrorKind::ResourceModificationNotAllowed => "RESOURCE_MODIFICATION_NOT_ALLOWED",
            DeployErrorKind::AppNotRunning => "APP_NOT_RUNNING",
            DeployErrorKind::DumpFailed => "DUMP_FAILED",
            DeployErrorKind::InstallFailed => "INSTALL_FAILED",
            DeployErrorKind::SwapFailed => "SWAP_FAILED",
            DeployErrorKind::RedefinitionFailed => "REDEFINITION_FAILED",
            DeployErrorKind::Transport => "DEVICE_TRANSPORT_ERROR",
            DeployErrorKind::InstallerBootstrap => "INSTALLER_BOOTSTRAP_FAILED",
            DeployErrorKind::InstallerProtocol => "INSTALLER_PROTOCOL_ERROR",
            DeployErrorKind::Database => "DEX_DATABASE_ERROR",
            DeployErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// The recovery offered for this kind of failure
    pub fn resolution(&self) -> ResolutionAction {
        match self {
            DeployErrorKind::OperationNotSupported | DeployErrorKind::InvalidApk => {
                ResolutionAction::None
            }

            DeployErrorKind::ResourceModificationNotAllowed => ResolutionAction::ApplyChanges,

            DeployErrorKind::RemoteApkNotFoundInDb
            | DeployErrorKind::DifferentApkSet
            | DeployErrorKind::ManifestChanged
            | DeployErrorKind::ClassRemoved
            | DeployErrorKind::AppNotRunning
            | DeployErrorKind::SwapFailed
            | DeployErrorKind::RedefinitionFailed => ResolutionAction::RunApp,

            DeployErrorKind::DumpFailed
            | DeployErrorKind::InstallFailed
            | DeployErrorKind::Transport
            | DeployErrorKind::InstallerBootstrap
            | DeployErrorKind::InstallerProtocol
            | DeployErrorKind::Database
            | DeployErrorKind::Internal => ResolutionAction::Retry,
        }
    }

    /// Default guidance shown under the error in the console
    pub fn call_to_action(&self) -> &'static str {
        match self {
            DeployErrorKind::OperationNotSupported => {
                "Use a device or emulator running a newer Android version."
            }
            DeployErrorKind::InvalidApk => "Rebuild the app and try again.",
            DeployErrorKind::RemoteApkNotFoundInDb
            | DeployErrorKind::DifferentApkSet
            | DeployErrorKind::ManifestChanged
            | DeployErrorKind::ClassRemoved
            | DeployErrorKind::AppNotRunning => {
                "These changes need the app to be reinstalled and restarted."
            }
            DeployErrorKind::ResourceModificationNotAllowed => {
                "Resources changed; swap code and resources together, or restart the app."
            }
            DeployErrorKind::DumpFailed | DeployErrorKind::InstallFailed => {
                "Check the device state and storage, then try again."
            }
            DeployErrorKind::SwapFailed | DeployErrorKind::RedefinitionFailed => {
                "The running app could not be updated in place. Restart it to pick up the changes."
            }
            DeployErrorKind::Transport => "Check that the device is still connected, then try again.",
            DeployErrorKind::InstallerBootstrap | DeployErrorKind::InstallerProtocol => {
                "The on-device installer will be restarted on the next attempt."
            }
            DeployErrorKind::Database | DeployErrorKind::Internal => "Try again.",
        }
    }
}

/// A deploy failure carrying everything needed to present it
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DeployerError {
    pub kind: DeployErrorKind,
    pub message: String,
    /// Raw output or lower-level error text
    pub details: String,
}

impl DeployerError {
    pub fn new(kind: DeployErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: String::new(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn resolution(&self) -> ResolutionAction {
        self.kind.resolution()
    }

    pub fn call_to_action(&self) -> &'static str {
        self.kind.call_to_action()
    }

    pub fn operation_not_supported(message: impl Into<String>) -> Self {
        Self::new(DeployErrorKind::OperationNotSupported, message)
    }

    pub fn install_failed(message: impl Into<String>) -> Self {
        Self::new(DeployErrorKind::InstallFailed, message)
    }

    pub fn swap_failed(message: impl Into<String>) -> Self {
        Self::new(DeployErrorKind::SwapFailed, message)
    }
}

impl From<CoreError> for DeployerError {
    fn from(err: CoreError) -> Self {
        let kind = match &err {
            CoreError::Transport { .. }
            | CoreError::AdbNotFound
            | CoreError::DeviceNotFound { .. } => DeployErrorKind::Transport,
            CoreError::InstallerBootstrap { .. } => DeployErrorKind::InstallerBootstrap,
            CoreError::InstallerProtocol { .. }
            | CoreError::InstallerTimeout { .. }
            | CoreError::InstallerNotReady { .. } => DeployErrorKind::InstallerProtocol,
            CoreError::ApkNotFound { .. }
            | CoreError::MalformedApk { .. }
            | CoreError::MalformedDex { .. } => DeployErrorKind::InvalidApk,
            CoreError::Database { .. } => DeployErrorKind::Database,
            _ => DeployErrorKind::Internal,
        };

        let message = match kind {
            DeployErrorKind::Transport => "Lost connection to the device.".to_string(),
            DeployErrorKind::InstallerBootstrap => {
                "Could not start the on-device installer.".to_string()
            }
            DeployErrorKind::InstallerProtocol => {
                "The on-device installer did not respond correctly.".to_string()
            }
            _ => err.to_string(),
        };

        DeployerError::new(kind, message).with_details(err.to_string())
    }
}
