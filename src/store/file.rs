//! File-backed record store.
//!
//! Each record is a JSON document at `<root>/<namespace>/<name>.json`:
//!
//! ```json
//! { "version": 3, "data": { "globalnetEnabled": "true", ... } }
//! ```
//!
//! Documents are written to a per-writer temp file and moved into place,
//! so a reader only ever sees a complete record. Creation refuses to
//! replace an existing document; conditional updates hold an advisory
//! lock on `<name>.json.lock` while they compare versions and rename.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use super::{Record, RecordStore, StoreError, Version};

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    version: u64,
    data: BTreeMap<String, String>,
}

/// Records stored as JSON files under a root directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.root.join(namespace).join(format!("{}.json", name))
    }

    fn read_document(&self, namespace: &str, name: &str) -> Result<Document, StoreError> {
        let path = self.record_path(namespace, name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            Err(source) => return Err(io_error(&path, source)),
        };
        serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    fn encode(namespace: &str, name: &str, document: &Document) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec_pretty(document).map_err(|e| StoreError::Corrupt {
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}

impl RecordStore for FileStore {
    fn get(&self, namespace: &str, name: &str) -> Result<Record, StoreError> {
        let document = self.read_document(namespace, name)?;
        Ok(Record {
            data: document.data,
            version: Version(document.version),
        })
    }

    fn create(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) -> Result<Version, StoreError> {
        let path = self.record_path(namespace, name);
        let dir = record_dir(&path)?;
        fs::create_dir_all(dir).map_err(|source| io_error(dir, source))?;

        let document = Document { version: 1, data };
        let bytes = Self::encode(namespace, name, &document)?;

        // Each creator writes its own scratch file; only one can claim the name
        let scratch = write_scratch(dir, &bytes)?;
        match scratch.persist_noclobber(&path) {
            Ok(_) => {}
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(io_error(&path, e.error)),
        }

        log::debug!("Created record {} at version {}", path.display(), document.version);
        Ok(Version(document.version))
    }

    fn update_if_version(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
        expected: Version,
    ) -> Result<Version, StoreError> {
        let path = self.record_path(namespace, name);
        let _lock = match RecordLock::try_acquire(&path.with_extension("json.lock")) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                log::debug!("Record {} is locked by another writer", path.display());
                return Err(StoreError::Conflict {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    expected,
                });
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            Err(source) => return Err(io_error(&path, source)),
        };

        let current = self.read_document(namespace, name)?;
        if current.version != expected.0 {
            return Err(StoreError::Conflict {
                namespace: namespace.to_string(),
                name: name.to_string(),
                expected,
            });
        }

        let document = Document {
            version: current.version + 1,
            data,
        };
        let bytes = Self::encode(namespace, name, &document)?;
        let scratch = write_scratch(record_dir(&path)?, &bytes)?;
        scratch
            .persist(&path)
            .map_err(|e| io_error(&path, e.error))?;

        log::debug!("Updated record {} to version {}", path.display(), document.version);
        Ok(Version(document.version))
    }
}

/// Advisory lock on `<name>.json.lock`.
///
/// The kernel drops the lock when the file handle closes, including when
/// the holding process dies, so a lock file left on disk never blocks
/// later writers. The file itself is never removed.
struct RecordLock {
    file: File,
}

impl RecordLock {
    /// `Ok(None)` when another handle holds the lock
    fn try_acquire(path: &Path) -> std::io::Result<Option<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        match file.try_lock() {
            Ok(()) => Ok(Some(RecordLock { file })),
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Error(e)) => Err(e),
        }
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            log::warn!("Failed to release record lock: {}", e);
        }
    }
}

fn record_dir(path: &Path) -> Result<&Path, StoreError> {
    path.parent().ok_or_else(|| StoreError::Io {
        path: path.display().to_string(),
        source: std::io::Error::new(ErrorKind::InvalidInput, "record path has no parent directory"),
    })
}

fn write_scratch(dir: &Path, bytes: &[u8]) -> Result<NamedTempFile, StoreError> {
    let mut scratch = NamedTempFile::new_in(dir).map_err(|source| io_error(dir, source))?;
    scratch
        .write_all(bytes)
        .map_err(|source| io_error(scratch.path(), source))?;
    scratch
        .as_file()
        .sync_all()
        .map_err(|source| io_error(scratch.path(), source))?;
    Ok(scratch)
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}
