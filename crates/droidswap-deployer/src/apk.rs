//! APK inspection: file digest, per-class hashes and resource checksums

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zip::ZipArchive;

use crate::dex::{self, ClassHashes};
use droidswap_core::prelude::*;

const MANIFEST_ENTRY: &str = "AndroidManifest.xml";

/// Content summary of one APK, as recorded in the dex archive database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApkSnapshot {
    /// File name, used as the split name on the device (`base.apk`)
    pub name: String,
    /// sha256 of the whole file, lowercase hex
    pub digest: String,
    pub classes: ClassHashes,
    /// Non-code entries and their CRC-32
    pub resources: BTreeMap<String, u32>,
    pub manifest_crc: Option<u32>,
}

impl ApkSnapshot {
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }
}

/// sha256 of `bytes` as lowercase hex
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn is_dex_entry(name: &str) -> bool {
    name.strip_prefix("classes")
        .and_then(|rest| rest.strip_suffix(".dex"))
        .map(|n| n.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

/// Read an APK from disk and summarize its content
pub fn read_apk(path: &Path) -> Result<ApkSnapshot> {
    if !path.is_file() {
        return Err(Error::ApkNotFound {
            path: path.to_path_buf(),
        });
    }

    let bytes = std::fs::read(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::malformed_apk(path, "path has no file name"))?;

    let mut archive = ZipArchive::new(Cursor::new(bytes.as_slice()))
        .map_err(|e| Error::malformed_apk(path, e.to_string()))?;

    let mut classes = ClassHashes::new();
    let mut resources = BTreeMap::new();
    let mut manifest_crc = None;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::malformed_apk(path, e.to_string()))?;
        if entry.is_dir() {
            continue;
        }

        let entry_name = entry.name().to_string();
        if entry_name.starts_with("META-INF/") {
            continue;
        }

        if entry_name == MANIFEST_ENTRY {
            manifest_crc = Some(entry.crc32());
        } else if is_dex_entry(&entry_name) {
            let mut dex_bytes = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut dex_bytes)
                .map_err(|e| Error::malformed_apk(path, format!("{}: {}", entry_name, e)))?;
            let hashes = dex::class_hashes(&dex_bytes).map_err(|e| {
                Error::malformed_apk(path, format!("{}: {}", entry_name, e))
            })?;
            for (class, hash) in hashes {
                if classes.insert(class.clone(), hash).is_some() {
                    warn!("{} defines {} in more than one dex file", name, class);
                }
            }
        } else {
            resources.insert(entry_name, entry.crc32());
        }
    }

    debug!(
        "Read {}: {} classes, {} resources",
        name,
        classes.len(),
        resources.len()
    );

    Ok(ApkSnapshot {
        name,
        digest: sha256_hex(&bytes),
        classes,
        resources,
        manifest_crc,
    })
}

/// Read every APK of a package, preserving order
pub fn read_apks(paths: &[impl AsRef<Path>]) -> Result<Vec<ApkSnapshot>> {
    paths.iter().map(|p| read_apk(p.as_ref())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ApkBuilder, DexBuilder};

    #[test]
    fn test_is_dex_entry() {
        assert!(is_dex_entry("classes.dex"));
        assert!(is_dex_entry("classes2.dex"));
        assert!(!is_dex_entry("lib/classes.dex"));
        assert!(!is_dex_entry("classes_x.dex"));
        assert!(!is_dex_entry("res/raw/classes.txt"));
    }

    #[test]
    fn test_read_apk() {
        let dir = tempfile::tempdir().unwrap();
        let path = ApkBuilder::new()
            .dex(
                "classes.dex",
                DexBuilder::new().class("Lcom/example/A;", &[&[0x0e00]]),
            )
            .dex(
                "classes2.dex",
                DexBuilder::new().class("Lcom/example/B;", &[&[0x0e00]]),
            )
            .resource("res/layout/main.xml", b"<LinearLayout/>")
            .resource("META-INF/CERT.SF", b"signature")
            .write(dir.path(), "base.apk");

        let snapshot = read_apk(&path).unwrap();
        assert_eq!(snapshot.name, "base.apk");
        assert_eq!(snapshot.class_count(), 2);
        assert!(snapshot.resources.contains_key("res/layout/main.xml"));
        assert!(!snapshot.resources.contains_key("META-INF/CERT.SF"));
        assert!(snapshot.manifest_crc.is_some());
        assert_eq!(snapshot.digest, sha256_hex(&std::fs::read(&path).unwrap()));
    }

    #[test]
    fn test_missing_apk() {
        let err = read_apk(Path::new("/nonexistent/app.apk")).unwrap_err();
        assert!(matches!(err, Error::ApkNotFound { .. }));
    }

    #[test]
    fn test_not_a_zip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.apk");
        std::fs::write(&path, b"definitely not a zip").unwrap();
        let err = read_apk(&path).unwrap_err();
        assert!(matches!(err, Error::MalformedApk { .. }));
    }

    #[test]
    fn test_resource_change_is_visible() {
        let dir = tempfile::tempdir().unwrap();
        let first = ApkBuilder::new()
            .resource("res/values/strings.xml", b"<string>one</string>")
            .write(dir.path(), "a.apk");
        let second = ApkBuilder::new()
            .resource("res/values/strings.xml", b"<string>two</string>")
            .write(dir.path(), "b.apk");

        let a = read_apk(&first).unwrap();
        let b = read_apk(&second).unwrap();
        assert_ne!(
            a.resources["res/values/strings.xml"],
            b.resources["res/values/strings.xml"]
        );
        assert_eq!(a.manifest_crc, b.manifest_crc);
    }
}
