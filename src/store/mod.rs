//! Versioned record storage.
//!
//! The registry lives in a single namespaced record on a shared backing
//! store. Every mutation is a conditional update against the version seen
//! at read time; there is no blind overwrite.
//!
//! - `memory`: in-process store, shareable across threads
//! - `file`: one JSON document per record on local disk

pub mod file;
pub mod memory;

use std::collections::BTreeMap;

use crate::ip::registry::{AllocationRegistry, RegistryError, RegistryKind};

pub use file::FileStore;
pub use memory::InMemoryStore;

/// Opaque version token handed out by a store on every read and write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(pub(crate) u64);

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored record and the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub data: BTreeMap<String, String>,
    pub version: Version,
}

/// Errors reported by a record store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error("record {namespace}/{name} already exists")]
    AlreadyExists { namespace: String, name: String },

    #[error("record {namespace}/{name} was modified concurrently (expected version {expected})")]
    Conflict {
        namespace: String,
        name: String,
        expected: Version,
    },

    #[error("record {namespace}/{name} is corrupt: {reason}")]
    Corrupt {
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("registry record {namespace}/{name} can't be decoded: {source}")]
    Registry {
        namespace: String,
        name: String,
        #[source]
        source: RegistryError,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

/// Key-value record store with conditional updates.
///
/// Implementations must make `update_if_version` atomic with respect to
/// other writers of the same record.
pub trait RecordStore {
    fn get(&self, namespace: &str, name: &str) -> Result<Record, StoreError>;

    /// Create a record; fails with `AlreadyExists` if it is present.
    fn create(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) -> Result<Version, StoreError>;

    /// Replace a record's data if its version still equals `expected`,
    /// otherwise fail with `Conflict`.
    fn update_if_version(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
        expected: Version,
    ) -> Result<Version, StoreError>;
}

impl<T: RecordStore + ?Sized> RecordStore for &T {
    fn get(&self, namespace: &str, name: &str) -> Result<Record, StoreError> {
        (**self).get(namespace, name)
    }

    fn create(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) -> Result<Version, StoreError> {
        (**self).create(namespace, name, data)
    }

    fn update_if_version(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
        expected: Version,
    ) -> Result<Version, StoreError> {
        (**self).update_if_version(namespace, name, data, expected)
    }
}

impl<T: RecordStore + ?Sized> RecordStore for std::sync::Arc<T> {
    fn get(&self, namespace: &str, name: &str) -> Result<Record, StoreError> {
        (**self).get(namespace, name)
    }

    fn create(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) -> Result<Version, StoreError> {
        (**self).create(namespace, name, data)
    }

    fn update_if_version(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
        expected: Version,
    ) -> Result<Version, StoreError> {
        (**self).update_if_version(namespace, name, data, expected)
    }
}

/// Reads and writes an [`AllocationRegistry`] through a [`RecordStore`]
#[derive(Debug, Clone)]
pub struct RegistryStore<S> {
    store: S,
    kind: RegistryKind,
}

impl<S: RecordStore> RegistryStore<S> {
    pub fn new(store: S, kind: RegistryKind) -> Self {
        RegistryStore { store, kind }
    }

    pub fn kind(&self) -> RegistryKind {
        self.kind
    }

    /// Fetch a fresh registry snapshot and its version.
    pub fn get(&self, namespace: &str) -> Result<(AllocationRegistry, Version), StoreError> {
        let name = self.kind.record_name();
        let record = self.store.get(namespace, name)?;
        let registry =
            AllocationRegistry::from_record(self.kind, &record.data).map_err(|source| StoreError::Registry {
                namespace: namespace.to_string(),
                name: name.to_string(),
                source,
            })?;
        Ok((registry, record.version))
    }

    pub fn create(&self, namespace: &str, registry: &AllocationRegistry) -> Result<Version, StoreError> {
        let data = self.encode(namespace, registry)?;
        self.store.create(namespace, self.kind.record_name(), data)
    }

    /// Create the record unless it already exists. An existing record is
    /// left untouched.
    pub fn ensure_created(&self, namespace: &str, registry: &AllocationRegistry) -> Result<(), StoreError> {
        match self.create(namespace, registry) {
            Ok(version) => {
                log::info!(
                    "Created {} registry {}/{} at version {}",
                    self.kind,
                    namespace,
                    self.kind.record_name(),
                    version
                );
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                log::debug!("{} registry {}/{} already exists", self.kind, namespace, self.kind.record_name());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Write `registry` only if the stored version is still `version`.
    pub fn conditional_update(
        &self,
        namespace: &str,
        registry: &AllocationRegistry,
        version: Version,
    ) -> Result<Version, StoreError> {
        let data = self.encode(namespace, registry)?;
        self.store
            .update_if_version(namespace, self.kind.record_name(), data, version)
    }

    fn encode(&self, namespace: &str, registry: &AllocationRegistry) -> Result<BTreeMap<String, String>, StoreError> {
        registry.to_record(self.kind).map_err(|source| StoreError::Registry {
            namespace: namespace.to_string(),
            name: self.kind.record_name().to_string(),
            source,
        })
    }
}
