//! # droidswap-core - Core Domain Types
//!
//! Foundation crate for droidswap. Provides the deploy data model, error
//! handling, launch events and logging setup.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, chrono, thiserror, tracing).
//!
//! ## Public API
//!
//! ### Domain Types (`types`)
//! - [`Package`] - Application id plus the APKs to deploy for it
//! - [`DeployResult`], [`DeployMetric`] - Per-package outcome and timing spans
//! - [`LaunchTaskDetail`] - Wall-clock telemetry record derived from a metric
//! - [`ResolutionAction`], [`ResolutionHandler`] - Suggested recovery after a failure
//!
//! ### Events (`events`)
//! - [`LaunchEvent`] - Console lines, notifications and progress of a run
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Custom error enum with `transient`/`fatal` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use droidswap_core::prelude::*;
//! ```

pub mod error;
pub mod events;
pub mod logging;
pub mod prelude;
pub mod types;

pub use error::{Error, Result, ResultExt};
pub use events::{ConsoleStream, LaunchEvent, NotificationKind};
pub use types::{
    current_thread_id, DeployMetric, DeployResult, DeviceState, LaunchTaskDetail, Package,
    ResolutionAction, ResolutionHandler,
};
