//! Application error types with rich context

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Device Transport Errors
    // ─────────────────────────────────────────────────────────────
    #[error("adb executable not found. Set ANDROID_HOME or add platform-tools to your PATH.")]
    AdbNotFound,

    #[error("Device transport error: {message}")]
    Transport { message: String, transient: bool },

    #[error("No device matches: {specifier}")]
    DeviceNotFound { specifier: String },

    // ─────────────────────────────────────────────────────────────
    // Installer Process Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to start the on-device installer: {message}")]
    InstallerBootstrap { message: String },

    #[error("Installer protocol error: {message}")]
    InstallerProtocol { message: String },

    #[error("Installer request '{request}' timed out after {timeout_ms}ms")]
    InstallerTimeout { request: String, timeout_ms: u64 },

    #[error("Installer is not ready (state: {state})")]
    InstallerNotReady { state: String },

    // ─────────────────────────────────────────────────────────────
    // Artifact Errors
    // ─────────────────────────────────────────────────────────────
    #[error("APK not found: {path}")]
    ApkNotFound { path: PathBuf },

    #[error("Malformed APK {path}: {message}")]
    MalformedApk { path: PathBuf, message: String },

    #[error("Malformed dex file: {message}")]
    MalformedDex { message: String },

    #[error("Dex archive database error: {message}")]
    Database { message: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Invalid configuration: {message}")]
    ConfigInvalid { message: String },

    // ─────────────────────────────────────────────────────────────
    // Channel/Communication Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Channel send error: {message}")]
    ChannelSend { message: String },

    #[error("{what} was cancelled")]
    Cancelled { what: String },
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// A transport failure that may succeed when retried (pipe hiccup, adb server restart).
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            transient: true,
        }
    }

    /// A transport failure caused by the device going away.
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            transient: false,
        }
    }

    /// A transport failure that retrying will not fix (permission denied, bad path).
    pub fn transport_failed(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            transient: false,
        }
    }

    pub fn device_not_found(specifier: impl Into<String>) -> Self {
        Self::DeviceNotFound {
            specifier: specifier.into(),
        }
    }

    pub fn installer_bootstrap(message: impl Into<String>) -> Self {
        Self::InstallerBootstrap {
            message: message.into(),
        }
    }

    pub fn installer_protocol(message: impl Into<String>) -> Self {
        Self::InstallerProtocol {
            message: message.into(),
        }
    }

    pub fn malformed_apk(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::MalformedApk {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn malformed_dex(message: impl Into<String>) -> Self {
        Self::MalformedDex {
            message: message.into(),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Settings that exist but cannot be parsed
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    pub fn cancelled(what: impl Into<String>) -> Self {
        Self::Cancelled { what: what.into() }
    }

    pub fn channel_send(message: impl Into<String>) -> Self {
        Self::ChannelSend {
            message: message.into(),
        }
    }

    /// Transient transport failures are retried once by the transport layer
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport {
                transient: true,
                ..
            }
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = Error::transport("pipe closed");
        assert_eq!(err.to_string(), "Device transport error: pipe closed");

        let err = Error::AdbNotFound;
        assert!(err.to_string().contains("adb executable not found"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::transport("broken pipe").is_transient());
        assert!(!Error::disconnected("device offline").is_transient());
        assert!(!Error::installer_protocol("bad magic").is_transient());
    }

    #[test]
    fn test_cancelled_names_what_stopped() {
        assert_eq!(Error::cancelled("Install").to_string(), "Install was cancelled");
    }

    #[test]
    fn test_context_keeps_the_error() {
        let io: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let err = io.context("Failed to write config").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_malformed_apk_mentions_path() {
        let err = Error::malformed_apk("/tmp/app.apk", "missing AndroidManifest.xml");
        let text = err.to_string();
        assert!(text.contains("/tmp/app.apk"));
        assert!(text.contains("AndroidManifest.xml"));
    }

    #[test]
    fn test_timeout_message() {
        let err = Error::InstallerTimeout {
            request: "dump".to_string(),
            timeout_ms: 20_000,
        };
        assert_eq!(
            err.to_string(),
            "Installer request 'dump' timed out after 20000ms"
        );
    }
}
