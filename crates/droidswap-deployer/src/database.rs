//! Dex archive database
//!
//! Remembers what was last deployed for each `(device fingerprint, app id)`
//! so that later deploys can diff against it. Handed to every
//! [`Deployer`](crate::Deployer) explicitly; clones share the same store.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::apk::ApkSnapshot;
use droidswap_core::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DatabaseKey {
    fingerprint: String,
    app_id: String,
}

/// On-disk form of one entry
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    fingerprint: String,
    app_id: String,
    apks: Vec<ApkSnapshot>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredDatabase {
    #[serde(default)]
    records: Vec<StoredRecord>,
}

/// Last deployed APK snapshots per device and application
#[derive(Debug, Clone, Default)]
pub struct DexArchiveDatabase {
    records: Arc<RwLock<HashMap<DatabaseKey, Vec<ApkSnapshot>>>>,
    path: Option<PathBuf>,
}

impl DexArchiveDatabase {
    /// A database that lives only as long as the process
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a database persisted at `path`, loading existing records.
    ///
    /// An unreadable file is logged and replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut records = HashMap::new();

        if path.exists() {
            match load(&path) {
                Ok(stored) => {
                    for record in stored.records {
                        records.insert(
                            DatabaseKey {
                                fingerprint: record.fingerprint,
                                app_id: record.app_id,
                            },
                            record.apks,
                        );
                    }
                    debug!("Loaded {} database records from {:?}", records.len(), path);
                }
                Err(e) => warn!("Ignoring unreadable database {:?}: {}", path, e),
            }
        }

        Ok(Self {
            records: Arc::new(RwLock::new(records)),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Snapshots last recorded for this device and app
    pub fn get(&self, fingerprint: &str, app_id: &str) -> Result<Option<Vec<ApkSnapshot>>> {
        let records = self
            .records
            .read()
            .map_err(|_| Error::database("lock poisoned"))?;
        Ok(records
            .get(&DatabaseKey {
                fingerprint: fingerprint.to_string(),
                app_id: app_id.to_string(),
            })
            .cloned())
    }

    /// Replace the record for this device and app
    pub fn record(&self, fingerprint: &str, app_id: &str, apks: Vec<ApkSnapshot>) -> Result<()> {
        {
            let mut records = self
                .records
                .write()
                .map_err(|_| Error::database("lock poisoned"))?;
            records.insert(
                DatabaseKey {
                    fingerprint: fingerprint.to_string(),
                    app_id: app_id.to_string(),
                },
                apks,
            );
        }
        self.persist()
    }

    /// Forget this device and app, e.g. after a failed install left the
    /// device in an unknown state
    pub fn invalidate(&self, fingerprint: &str, app_id: &str) -> Result<()> {
        let removed = {
            let mut records = self
                .records
                .write()
                .map_err(|_| Error::database("lock poisoned"))?;
            records
                .remove(&DatabaseKey {
                    fingerprint: fingerprint.to_string(),
                    app_id: app_id.to_string(),
                })
                .is_some()
        };
        if removed {
            self.persist()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let stored = {
            let records = self
                .records
                .read()
                .map_err(|_| Error::database("lock poisoned"))?;
            let mut stored: Vec<StoredRecord> = records
                .iter()
                .map(|(key, apks)| StoredRecord {
                    fingerprint: key.fingerprint.clone(),
                    app_id: key.app_id.clone(),
                    apks: apks.clone(),
                })
                .collect();
            stored.sort_by(|a, b| (&a.fingerprint, &a.app_id).cmp(&(&b.fingerprint, &b.app_id)));
            StoredDatabase { records: stored }
        };

        let content = serde_json::to_vec_pretty(&stored)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::database(format!("Failed to create {:?}: {}", parent, e)))?;
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::database(format!("Failed to open {:?}: {}", path, e)))?;

        file.lock_exclusive()
            .map_err(|e| Error::database(format!("Failed to lock {:?}: {}", path, e)))?;
        file.write_all(&content)
            .map_err(|e| Error::database(format!("Failed to write {:?}: {}", path, e)))?;
        file.flush()
            .map_err(|e| Error::database(format!("Failed to flush {:?}: {}", path, e)))?;

        trace!("Persisted dex archive database to {:?}", path);
        Ok(())
    }
}

fn load(path: &Path) -> Result<StoredDatabase> {
    let file = std::fs::File::open(path)?;
    file.lock_shared()
        .map_err(|e| Error::database(format!("Failed to lock {:?}: {}", path, e)))?;
    let content = std::fs::read(path)?;
    Ok(serde_json::from_slice(&content)?)
}
