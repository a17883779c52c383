//! Project configuration (`.droidswap/config.toml`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use droidswap_core::prelude::*;
use droidswap_deployer::InstallOptions;
use droidswap_device::installer::{DEFAULT_BOOTSTRAP_ATTEMPTS, INSTALLER_VERSION};
use droidswap_device::InstallerConfig;

pub const CONFIG_FILENAME: &str = "config.toml";
pub const DROIDSWAP_DIR: &str = ".droidswap";

/// Default dex archive database file inside [`DROIDSWAP_DIR`]
pub const DATABASE_FILENAME: &str = "dex-db.json";

/// Default directory of installer binaries inside [`DROIDSWAP_DIR`]
pub const INSTALLER_DIRNAME: &str = "installer";

/// Project settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub installer: InstallerSettings,

    #[serde(default)]
    pub install: InstallSettings,

    #[serde(default)]
    pub deploy: DeploySettings,

    #[serde(default)]
    pub monitoring: MonitoringSettings,

    #[serde(default)]
    pub behavior: BehaviorSettings,
}

/// On-device installer settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstallerSettings {
    /// Directory with `<abi>/installer` binaries (empty = `.droidswap/installer`)
    #[serde(default)]
    pub local_path: String,

    /// Device directory the installer and staged APKs live in
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Start attempts before giving up
    #[serde(default = "default_bootstrap_attempts")]
    pub bootstrap_attempts: u32,
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            local_path: String::new(),
            remote_dir: default_remote_dir(),
            timeout_ms: default_timeout_ms(),
            bootstrap_attempts: default_bootstrap_attempts(),
        }
    }
}

/// `pm install` settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstallSettings {
    /// Pass `-t` so test-only (debuggable) APKs install
    #[serde(default = "default_true")]
    pub allow_debuggable: bool,

    /// Pass `-g` to grant all runtime permissions
    #[serde(default)]
    pub grant_all_permissions: bool,

    /// Reuse unchanged installed APKs when the split set is the same
    #[serde(default = "default_true")]
    pub delta_install: bool,

    /// Extra `pm install` options, whitespace separated
    #[serde(default)]
    pub extra_options: String,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            allow_debuggable: true,
            grant_all_permissions: false,
            delta_install: true,
            extra_options: String::new(),
        }
    }
}

/// Dex archive database settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeploySettings {
    /// Database file (empty = `.droidswap/dex-db.json`)
    #[serde(default)]
    pub database_path: String,

    /// Keep the database across runs
    #[serde(default = "default_true")]
    pub persist_database: bool,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            database_path: String::new(),
            persist_database: true,
        }
    }
}

/// Live update monitoring settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringSettings {
    #[serde(default = "default_true")]
    pub live_update: bool,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self { live_update: true }
    }
}

/// Behavior settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BehaviorSettings {
    /// Apply the suggested resolution of a failed deploy automatically
    #[serde(default)]
    pub fallback_mode: bool,
}

fn default_remote_dir() -> String {
    InstallerConfig::default().remote_dir
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_bootstrap_attempts() -> u32 {
    DEFAULT_BOOTSTRAP_ATTEMPTS
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Installer client configuration, with relative paths resolved against
    /// `project_path`
    pub fn installer_config(&self, project_path: &Path) -> InstallerConfig {
        let local_dir = if self.installer.local_path.is_empty() {
            project_path.join(DROIDSWAP_DIR).join(INSTALLER_DIRNAME)
        } else {
            project_path.join(&self.installer.local_path)
        };

        InstallerConfig {
            local_dir,
            remote_dir: self.installer.remote_dir.clone(),
            version: INSTALLER_VERSION.to_string(),
            request_timeout: Duration::from_millis(self.installer.timeout_ms.max(1)),
            bootstrap_attempts: self.installer.bootstrap_attempts.max(1),
        }
    }

    pub fn install_options(&self) -> InstallOptions {
        let mut options = InstallOptions::default()
            .with_allow_debuggable(self.install.allow_debuggable)
            .with_grant_all_permissions(self.install.grant_all_permissions)
            .with_delta_install(self.install.delta_install);
        if !self.install.extra_options.trim().is_empty() {
            options = options.with_user_options(self.install.extra_options.trim());
        }
        options
    }

    /// Database file, or `None` when the database is kept in memory only
    pub fn database_path(&self, project_path: &Path) -> Option<PathBuf> {
        if !self.deploy.persist_database {
            return None;
        }
        if self.deploy.database_path.is_empty() {
            Some(project_path.join(DROIDSWAP_DIR).join(DATABASE_FILENAME))
        } else {
            Some(project_path.join(&self.deploy.database_path))
        }
    }
}

/// Load settings from `.droidswap/config.toml`, falling back to defaults
pub fn load_settings(project_path: &Path) -> Settings {
    let config_path = project_path.join(DROIDSWAP_DIR).join(CONFIG_FILENAME);

    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return Settings::default();
    }

    match read_settings(&config_path) {
        Ok(settings) => {
            debug!("Loaded settings from {:?}", config_path);
            settings
        }
        Err(e) => {
            warn!("{}, using defaults", e);
            Settings::default()
        }
    }
}

/// Parse one config file, failing on unreadable or malformed content
pub fn read_settings(config_path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(config_path)?;
    toml::from_str(&content)
        .map_err(|e| Error::config_invalid(format!("{}: {}", config_path.display(), e)))
}

/// Create a commented default config in `.droidswap/`
pub fn init_config_dir(project_path: &Path) -> Result<()> {
    let droidswap_dir = project_path.join(DROIDSWAP_DIR);

    if !droidswap_dir.exists() {
        std::fs::create_dir_all(&droidswap_dir)
            .with_context(|| format!("Failed to create {:?}", droidswap_dir))?;
    }

    let config_path = droidswap_dir.join(CONFIG_FILENAME);
    if !config_path.exists() {
        let default_content = r#"# droidswap configuration

[installer]
local_path = ""         # Empty = .droidswap/installer/<abi>/installer
remote_dir = "/data/local/tmp/.droidswap"
timeout_ms = 20000
bootstrap_attempts = 2

[install]
allow_debuggable = true
grant_all_permissions = false
delta_install = true
extra_options = ""      # Appended to pm install, e.g. "--user 0"

[deploy]
database_path = ""      # Empty = .droidswap/dex-db.json
persist_database = true

[monitoring]
live_update = true

[behavior]
fallback_mode = false   # Apply the suggested fix after a failed deploy
"#;
        std::fs::write(&config_path, default_content)
            .with_context(|| format!("Failed to write {:?}", config_path))?;
        info!("Created default config at {:?}", config_path);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = tempdir().unwrap();
        let settings = load_settings(dir.path());

        assert_eq!(settings.installer.timeout_ms, 20_000);
        assert_eq!(settings.installer.bootstrap_attempts, 2);
        assert!(settings.install.allow_debuggable);
        assert!(settings.monitoring.live_update);
        assert!(!settings.behavior.fallback_mode);
    }

    #[test]
    fn test_partial_config() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(DROIDSWAP_DIR)).unwrap();
        std::fs::write(
            dir.path().join(DROIDSWAP_DIR).join(CONFIG_FILENAME),
            "[behavior]\nfallback_mode = true\n\n[installer]\ntimeout_ms = 500\n",
        )
        .unwrap();

        let settings = load_settings(dir.path());
        assert!(settings.behavior.fallback_mode);
        assert_eq!(settings.installer.timeout_ms, 500);
        assert_eq!(settings.installer.remote_dir, "/data/local/tmp/.droidswap");
        assert!(settings.deploy.persist_database);
    }

    #[test]
    fn test_invalid_config_falls_back() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(DROIDSWAP_DIR)).unwrap();
        std::fs::write(
            dir.path().join(DROIDSWAP_DIR).join(CONFIG_FILENAME),
            "[behavior\nfallback_mode = ",
        )
        .unwrap();

        let settings = load_settings(dir.path());
        assert!(!settings.behavior.fallback_mode);

        let err = read_settings(&dir.path().join(DROIDSWAP_DIR).join(CONFIG_FILENAME)).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
        assert!(err.to_string().contains(CONFIG_FILENAME));
    }

    #[test]
    fn test_init_config_dir_reports_io_failure() {
        let dir = tempdir().unwrap();
        let not_a_dir = dir.path().join("file");
        std::fs::write(&not_a_dir, "").unwrap();

        let err = init_config_dir(&not_a_dir).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_init_config_dir_writes_parseable_defaults() {
        let dir = tempdir().unwrap();
        init_config_dir(dir.path()).unwrap();

        let content =
            std::fs::read_to_string(dir.path().join(DROIDSWAP_DIR).join(CONFIG_FILENAME)).unwrap();
        let parsed: Settings = toml::from_str(&content).unwrap();
        let defaults = Settings::default();
        assert_eq!(parsed.installer.remote_dir, defaults.installer.remote_dir);
        assert_eq!(parsed.installer.timeout_ms, defaults.installer.timeout_ms);
        assert_eq!(parsed.install.delta_install, defaults.install.delta_install);

        // existing files are left alone
        std::fs::write(
            dir.path().join(DROIDSWAP_DIR).join(CONFIG_FILENAME),
            "[behavior]\nfallback_mode = true\n",
        )
        .unwrap();
        init_config_dir(dir.path()).unwrap();
        assert!(load_settings(dir.path()).behavior.fallback_mode);
    }

    #[test]
    fn test_installer_config_resolution() {
        let project = Path::new("/work/app");
        let mut settings = Settings::default();
        settings.installer.bootstrap_attempts = 0;
        settings.installer.timeout_ms = 1500;

        let config = settings.installer_config(project);
        assert_eq!(config.local_dir, project.join(".droidswap").join("installer"));
        assert_eq!(config.bootstrap_attempts, 1);
        assert_eq!(config.request_timeout, Duration::from_millis(1500));

        settings.installer.local_path = "tools/installer".to_string();
        assert_eq!(
            settings.installer_config(project).local_dir,
            project.join("tools/installer")
        );
    }

    #[test]
    fn test_install_options_mapping() {
        let mut settings = Settings::default();
        settings.install.grant_all_permissions = true;
        settings.install.extra_options = "  --user 0 ".to_string();

        let options = settings.install_options();
        assert!(options.allow_debuggable);
        assert!(options.grant_all_permissions);
        assert!(options.delta_install);
        assert_eq!(options.user_options.as_deref(), Some("--user 0"));

        settings.install.extra_options.clear();
        assert!(settings.install_options().user_options.is_none());
    }

    #[test]
    fn test_database_path() {
        let project = Path::new("/work/app");
        let mut settings = Settings::default();
        assert_eq!(
            settings.database_path(project),
            Some(project.join(".droidswap").join("dex-db.json"))
        );

        settings.deploy.persist_database = false;
        assert_eq!(settings.database_path(project), None);
    }
}
