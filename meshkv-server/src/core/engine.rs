use super::error::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Backing storage engine contract: an ordered key-value map with per-key
/// atomic compound operations. The store composes replication and event
/// emission on top of this; engines only guarantee data and atomicity.
///
/// `segment` partitions the keyspace for parallel bulk scan; an engine may
/// treat all keys as a single segment.
pub trait StorageEngine: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Read into a caller-provided buffer, reusing its allocation. Returns
    /// true when the key was present.
    fn get_into(&self, key: &str, target: &mut Vec<u8>) -> bool;

    /// Insert, returning the previous value.
    fn get_and_put(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>>;

    /// Remove, returning the previous value.
    fn get_and_remove(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert only when absent; returns the existing value otherwise.
    fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>>;

    /// Replace only when the current value equals `old`.
    fn replace(&self, key: &str, old: &[u8], new: Vec<u8>) -> Result<bool>;

    /// Remove only when the current value equals `expected`.
    fn remove_if(&self, key: &str, expected: &[u8]) -> Result<bool>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn segment_count(&self) -> usize;

    fn keys_for(&self, segment: usize) -> Vec<String>;

    fn entries_for(&self, segment: usize) -> Vec<(String, Vec<u8>)>;

    /// Snapshot of all entries, in key order.
    fn entries(&self) -> Vec<(String, Vec<u8>)>;
}

impl std::fmt::Debug for dyn StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn StorageEngine")
    }
}

/// In-memory engine backed by an ordered map. The whole keyspace is a single
/// segment; compound operations are atomic under the map's write lock.
#[derive(Default)]
pub struct MemoryEngine {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageEngine for MemoryEngine {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.read().get(key).cloned()
    }

    fn get_into(&self, key: &str, target: &mut Vec<u8>) -> bool {
        match self.data.read().get(key) {
            Some(v) => {
                target.clear();
                target.extend_from_slice(v);
                true
            }
            None => false,
        }
    }

    fn get_and_put(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>> {
        Ok(self.data.write().insert(key.to_string(), value))
    }

    fn get_and_remove(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.write().remove(key))
    }

    fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let mut data = self.data.write();
        match data.get(key) {
            Some(existing) => Ok(Some(existing.clone())),
            None => {
                data.insert(key.to_string(), value);
                Ok(None)
            }
        }
    }

    fn replace(&self, key: &str, old: &[u8], new: Vec<u8>) -> Result<bool> {
        let mut data = self.data.write();
        match data.get(key) {
            Some(current) if current.as_slice() == old => {
                data.insert(key.to_string(), new);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn remove_if(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut data = self.data.write();
        match data.get(key) {
            Some(current) if current.as_slice() == expected => {
                data.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn len(&self) -> usize {
        self.data.read().len()
    }

    fn segment_count(&self) -> usize {
        1
    }

    fn keys_for(&self, _segment: usize) -> Vec<String> {
        // Single segment: the whole keyspace.
        self.data.read().keys().cloned().collect()
    }

    fn entries_for(&self, _segment: usize) -> Vec<(String, Vec<u8>)> {
        self.entries()
    }

    fn entries(&self) -> Vec<(String, Vec<u8>)> {
        self.data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_put_returns_old() {
        let engine = MemoryEngine::new();
        assert_eq!(engine.get_and_put("k", b"v1".to_vec()).unwrap(), None);
        assert_eq!(
            engine.get_and_put("k", b"v2".to_vec()).unwrap(),
            Some(b"v1".to_vec())
        );
        assert_eq!(engine.get("k"), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_get_into_reuses_buffer() {
        let engine = MemoryEngine::new();
        engine.get_and_put("k", b"hello".to_vec()).unwrap();

        let mut buf = Vec::with_capacity(32);
        assert!(engine.get_into("k", &mut buf));
        assert_eq!(buf, b"hello");
        assert!(!engine.get_into("missing", &mut buf));
    }

    #[test]
    fn test_put_if_absent() {
        let engine = MemoryEngine::new();
        assert_eq!(engine.put_if_absent("k", b"v1".to_vec()).unwrap(), None);
        assert_eq!(
            engine.put_if_absent("k", b"v2".to_vec()).unwrap(),
            Some(b"v1".to_vec())
        );
        assert_eq!(engine.get("k"), Some(b"v1".to_vec()));
    }

    #[test]
    fn test_replace_requires_expected_value() {
        let engine = MemoryEngine::new();
        engine.get_and_put("k", b"v1".to_vec()).unwrap();

        assert!(!engine.replace("k", b"wrong", b"v2".to_vec()).unwrap());
        assert!(engine.replace("k", b"v1", b"v2".to_vec()).unwrap());
        assert_eq!(engine.get("k"), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_remove_if() {
        let engine = MemoryEngine::new();
        engine.get_and_put("k", b"v".to_vec()).unwrap();

        assert!(!engine.remove_if("k", b"other").unwrap());
        assert!(engine.remove_if("k", b"v").unwrap());
        assert_eq!(engine.get("k"), None);
    }

    #[test]
    fn test_entries_are_key_ordered() {
        let engine = MemoryEngine::new();
        engine.get_and_put("b", b"2".to_vec()).unwrap();
        engine.get_and_put("a", b"1".to_vec()).unwrap();
        engine.get_and_put("c", b"3".to_vec()).unwrap();

        let keys: Vec<String> = engine.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(engine.segment_count(), 1);
        assert_eq!(engine.keys_for(0).len(), 3);
    }
}
