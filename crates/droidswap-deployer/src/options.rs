//! Install options and their `pm install` flags

use serde::{Deserialize, Serialize};

use droidswap_device::DeviceInfo;

/// First API level where `pm install` understands `-g`
const GRANT_PERMISSIONS_MIN_API: u32 = 23;

/// First API level where an install without `--full` may be taken for an
/// instant app
const FULL_APK_REQUIRED_API: u32 = 28;

/// Options for [`Deployer::install`](crate::Deployer::install)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallOptions {
    /// Allow test-only / debuggable packages (`-t`)
    pub allow_debuggable: bool,
    /// Grant all runtime permissions at install time (`-g`)
    pub grant_all_permissions: bool,
    /// Install as a full app (`--full`)
    pub full_apk: bool,
    /// Push only changed splits and let the installer reuse the rest
    pub delta_install: bool,
    /// Extra flags, appended verbatim after whitespace splitting
    pub user_options: Option<String>,
}

impl InstallOptions {
    pub fn with_allow_debuggable(mut self, value: bool) -> Self {
        self.allow_debuggable = value;
        self
    }

    pub fn with_grant_all_permissions(mut self, value: bool) -> Self {
        self.grant_all_permissions = value;
        self
    }

    pub fn with_full_apk(mut self, value: bool) -> Self {
        self.full_apk = value;
        self
    }

    pub fn with_delta_install(mut self, value: bool) -> Self {
        self.delta_install = value;
        self
    }

    pub fn with_user_options(mut self, options: impl Into<String>) -> Self {
        let options = options.into();
        self.user_options = (!options.trim().is_empty()).then_some(options);
        self
    }

    /// Flags for `pm install-create` on `device`.
    ///
    /// Embedded devices cannot show permission prompts, so permissions are
    /// always granted there. API 28+ always gets `--full`.
    pub fn pm_flags(&self, device: &DeviceInfo) -> Vec<String> {
        let mut flags = vec!["-r".to_string()];

        if self.allow_debuggable {
            flags.push("-t".to_string());
        }

        let grant = self.grant_all_permissions || device.is_embedded();
        if grant && device.api() >= GRANT_PERMISSIONS_MIN_API {
            flags.push("-g".to_string());
        }

        if self.full_apk || device.api() >= FULL_APK_REQUIRED_API {
            flags.push("--full".to_string());
        }

        if let Some(user) = &self.user_options {
            flags.extend(user.split_whitespace().map(str::to_string));
        }

        flags
    }
}
