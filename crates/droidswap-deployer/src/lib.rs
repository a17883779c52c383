//! # droidswap-deployer - Incremental Deploys
//!
//! Installs APKs and applies code/resource changes to a running app on one
//! device. Every operation diffs against the [`DexArchiveDatabase`] so that
//! repeated deploys only push what changed.
//!
//! ## Public API
//!
//! - [`Deployer`] - `install`, `code_swap` and `full_swap` for one package
//! - [`InstallOptions`] - `pm install` flags
//! - [`DeployerError`] - Structured failure with error code and resolution
//! - [`DexArchiveDatabase`] - Last deployed APK snapshots per device and app
//! - [`MetricsRecorder`] - Phase timings, converted to launch task details
//! - [`Redefiner`] - Debugger-side class redefinition for one process
//! - [`read_apk()`] - Inspect an APK into an [`ApkSnapshot`]

pub mod apk;
pub mod database;
pub mod deployer;
pub mod dex;
pub mod diff;
pub mod error;
pub mod metrics;
pub mod options;
pub mod redefiner;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;

pub use apk::{read_apk, read_apks, ApkSnapshot};
pub use database::DexArchiveDatabase;
pub use deployer::Deployer;
pub use diff::{plan_swap, SwapPlan};
pub use error::{DeployErrorKind, DeployerError, DeployerResult};
pub use metrics::{MetricsRecorder, Phase};
pub use options::InstallOptions;
pub use redefiner::{RedefineRequest, Redefiner};
