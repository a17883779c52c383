//! droidswap library
//!
//! Command-line front end: maps commands onto launch tasks and renders
//! launch events for a terminal or as NDJSON.

pub mod headless;
pub mod runner;

pub use runner::{execute, PackageArg, RunKind, RunRequest};
