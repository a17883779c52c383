//! Locating the adb executable
//!
//! Looks in the Android SDK pointed to by `ANDROID_HOME` / `ANDROID_SDK_ROOT`
//! first, then falls back to `PATH`.

use std::path::{Path, PathBuf};

use droidswap_core::prelude::*;

#[cfg(windows)]
const ADB_BINARY: &str = "adb.exe";
#[cfg(not(windows))]
const ADB_BINARY: &str = "adb";

/// Candidate adb locations derived from SDK environment variables, in priority order
fn sdk_candidates() -> Vec<PathBuf> {
    ["ANDROID_HOME", "ANDROID_SDK_ROOT"]
        .iter()
        .filter_map(|var| std::env::var_os(var))
        .map(|sdk| PathBuf::from(sdk).join("platform-tools").join(ADB_BINARY))
        .collect()
}

/// Find the adb executable.
///
/// An explicit override (from configuration or the command line) wins when it exists.
pub fn locate_adb(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(dunce::canonicalize(path)?);
        }
        warn!("Configured adb path {} does not exist", path.display());
    }

    for candidate in sdk_candidates() {
        if candidate.is_file() {
            debug!("Using adb from SDK: {}", candidate.display());
            return Ok(dunce::canonicalize(&candidate)?);
        }
    }

    which::which(ADB_BINARY).map_err(|e| {
        debug!("adb not found on PATH: {}", e);
        Error::AdbNotFound
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn fake_sdk() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let tools = dir.path().join("platform-tools");
        std::fs::create_dir_all(&tools).unwrap();
        let adb = tools.join(ADB_BINARY);
        std::fs::write(&adb, b"#!/bin/sh\n").unwrap();
        (dir, adb)
    }

    #[test]
    #[serial]
    fn test_explicit_path_wins() {
        let (_dir, adb) = fake_sdk();
        let found = locate_adb(Some(&adb)).unwrap();
        assert_eq!(found, dunce::canonicalize(&adb).unwrap());
    }

    #[test]
    #[serial]
    fn test_android_home_is_used() {
        let (dir, adb) = fake_sdk();
        let previous = std::env::var_os("ANDROID_HOME");
        std::env::set_var("ANDROID_HOME", dir.path());

        let found = locate_adb(None);

        match previous {
            Some(value) => std::env::set_var("ANDROID_HOME", value),
            None => std::env::remove_var("ANDROID_HOME"),
        }
        assert_eq!(found.unwrap(), dunce::canonicalize(&adb).unwrap());
    }

    #[test]
    #[serial]
    fn test_sdk_candidates_order() {
        let home_prev = std::env::var_os("ANDROID_HOME");
        let root_prev = std::env::var_os("ANDROID_SDK_ROOT");
        std::env::set_var("ANDROID_HOME", "/sdk/home");
        std::env::set_var("ANDROID_SDK_ROOT", "/sdk/root");

        let candidates = sdk_candidates();

        for (var, prev) in [("ANDROID_HOME", home_prev), ("ANDROID_SDK_ROOT", root_prev)] {
            match prev {
                Some(value) => std::env::set_var(var, value),
                None => std::env::remove_var(var),
            }
        }

        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].starts_with("/sdk/home"));
        assert!(candidates[1].starts_with("/sdk/root"));
    }
}
