//! In-process record store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{Record, RecordStore, StoreError, Version};

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<(String, String), Record>,
    next_version: u64,
}

impl Inner {
    fn bump(&mut self) -> Version {
        self.next_version += 1;
        Version(self.next_version)
    }
}

/// Thread-safe map of records with a store-wide version counter.
///
/// Versions never repeat, so a stale token can't match a later write.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock only means another thread panicked mid-test; the map
    // itself is never left half-written.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RecordStore for InMemoryStore {
    fn get(&self, namespace: &str, name: &str) -> Result<Record, StoreError> {
        self.lock()
            .records
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    fn create(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) -> Result<Version, StoreError> {
        let mut inner = self.lock();
        let key = (namespace.to_string(), name.to_string());
        if inner.records.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        let version = inner.bump();
        inner.records.insert(key, Record { data, version });
        Ok(version)
    }

    fn update_if_version(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
        expected: Version,
    ) -> Result<Version, StoreError> {
        let mut inner = self.lock();
        let key = (namespace.to_string(), name.to_string());
        let current = match inner.records.get(&key) {
            Some(record) => record.version,
            None => {
                return Err(StoreError::NotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
        };
        if current != expected {
            return Err(StoreError::Conflict {
                namespace: namespace.to_string(),
                name: name.to_string(),
                expected,
            });
        }
        let version = inner.bump();
        inner.records.insert(key, Record { data, version });
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(value: &str) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("key".to_string(), value.to_string());
        map
    }

    #[test]
    fn test_create_get_update() {
        let store = InMemoryStore::new();
        let v1 = store.create("ns", "rec", data("a")).unwrap();

        let record = store.get("ns", "rec").unwrap();
        assert_eq!(record.version, v1);
        assert_eq!(record.data["key"], "a");

        let v2 = store.update_if_version("ns", "rec", data("b"), v1).unwrap();
        assert!(v2 > v1);
        assert_eq!(store.get("ns", "rec").unwrap().data["key"], "b");
    }

    #[test]
    fn test_conflict_on_stale_version() {
        let store = InMemoryStore::new();
        let v1 = store.create("ns", "rec", data("a")).unwrap();
        store.update_if_version("ns", "rec", data("b"), v1).unwrap();

        let err = store.update_if_version("ns", "rec", data("c"), v1).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get("ns", "rec").unwrap().data["key"], "b");
    }

    #[test]
    fn test_missing_and_duplicate() {
        let store = InMemoryStore::new();
        assert!(store.get("ns", "rec").unwrap_err().is_not_found());
        assert!(store
            .update_if_version("ns", "rec", data("a"), Version(1))
            .unwrap_err()
            .is_not_found());

        store.create("ns", "rec", data("a")).unwrap();
        assert!(store.create("ns", "rec", data("b")).unwrap_err().is_already_exists());
        // Same name in another namespace is a different record
        store.create("other", "rec", data("b")).unwrap();
    }
}
