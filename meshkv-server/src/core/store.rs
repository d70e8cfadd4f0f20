use super::engine::StorageEngine;
use super::error::Result;
use super::events::{unix_millis, ChangeEvent, HostId, ReplicationEntry, Version};
use super::registry::{EngineOptions, NodeContext};
use crate::replication::log::ModificationLog;
use crate::subscription::SubscriptionHub;
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

const LOCK_STRIPES: usize = 16;

/// How a store is created.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Backing engine kind, resolved through the node context registry.
    pub engine: String,
    /// Base directory for persistent engines.
    pub data_dir: Option<PathBuf>,
    /// Whether this store participates in replication.
    pub replicated: bool,
    /// Modification log capacity (records buffered for peers).
    pub log_capacity: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            engine: "memory".to_string(),
            data_dir: None,
            replicated: false,
            log_capacity: 65_536,
        }
    }
}

/// Thread-safe local key-value store. Composes a backing engine with the
/// subscription hub and, when replication is configured, the modification
/// log. Every mutating call emits exactly one change event and appends
/// exactly one replication entry, in the same logical step as the mutation.
pub struct KvStore {
    name: String,
    engine: Arc<dyn StorageEngine>,
    hub: SubscriptionHub,
    log: Option<Arc<ModificationLog>>,
    host_id: Option<HostId>,
    /// Last-write-wins bookkeeping per key, tombstones included.
    versions: RwLock<HashMap<String, Version>>,
    /// Monotonic millisecond clock, never repeating within this node.
    clock: AtomicU64,
    /// Per-key stripe locks keeping mutation, event emission and log append
    /// atomic per key without serializing unrelated keys.
    stripes: Vec<Mutex<()>>,
}

impl KvStore {
    /// Create a store resolving its backing engine through the context.
    /// Engine construction failure is fatal; a missing host identifier only
    /// degrades replication, logged, never fatal.
    pub fn open(name: &str, ctx: &NodeContext, opts: StoreOptions) -> Result<Arc<Self>> {
        let engine = ctx.build_engine(
            &opts.engine,
            &EngineOptions {
                name: name.to_string(),
                data_dir: opts.data_dir.clone(),
            },
        )?;

        let host_id = ctx.host_id();
        let log = if opts.replicated {
            match host_id {
                Some(id) => {
                    info!(store = name, host_id = id, "replication enabled");
                    Some(ModificationLog::new(opts.log_capacity))
                }
                None => {
                    warn!(
                        store = name,
                        "replication requested but no host id configured, running standalone"
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(Arc::new(Self {
            name: name.to_string(),
            engine,
            hub: SubscriptionHub::new(),
            log,
            host_id,
            versions: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }))
    }

    /// In-memory store without replication, mainly for tests.
    pub fn in_memory(name: &str) -> Arc<Self> {
        Self::open(name, &NodeContext::default(), StoreOptions::default())
            .expect("memory engine cannot fail")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host_id(&self) -> Option<HostId> {
        self.host_id
    }

    pub fn hub(&self) -> &SubscriptionHub {
        &self.hub
    }

    pub fn log(&self) -> Option<&Arc<ModificationLog>> {
        self.log.as_ref()
    }

    fn origin(&self) -> HostId {
        self.host_id.unwrap_or(0)
    }

    fn stripe(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % LOCK_STRIPES]
    }

    /// Strictly increasing millisecond timestamp for this node.
    fn next_timestamp(&self) -> u64 {
        let now = unix_millis();
        let mut prev = self.clock.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self
                .clock
                .compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(observed) => prev = observed,
            }
        }
    }

    /// Current clock reading without advancing it.
    pub fn now(&self) -> u64 {
        unix_millis().max(self.clock.load(Ordering::SeqCst))
    }

    // ---- reads ----

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.engine.get(key)
    }

    /// Read into a reusable buffer; returns true when the key was present.
    pub fn get_into(&self, key: &str, target: &mut Vec<u8>) -> bool {
        self.engine.get_into(key, target)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.engine.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.engine.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engine.is_empty()
    }

    pub fn segment_count(&self) -> usize {
        self.engine.segment_count()
    }

    pub fn keys_for(&self, segment: usize) -> Vec<String> {
        self.engine.keys_for(segment)
    }

    pub fn entries_for(&self, segment: usize) -> Vec<(String, Vec<u8>)> {
        self.engine.entries_for(segment)
    }

    /// Snapshot of all entries in key order.
    pub fn entries(&self) -> Vec<(String, Vec<u8>)> {
        self.engine.entries()
    }

    pub fn version_of(&self, key: &str) -> Option<Version> {
        self.versions.read().get(key).copied()
    }

    // ---- mutations ----

    /// Insert, returning the previous value.
    pub fn put(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let _guard = self.stripe(key).lock();
        let old = self.engine.get_and_put(key, value.clone())?;
        self.record_local(key, Some(value), old.clone());
        Ok(old)
    }

    /// Remove, returning the previous value. Removing an absent key mutates
    /// nothing, so no event is emitted and nothing is logged.
    pub fn remove(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let _guard = self.stripe(key).lock();
        let old = self.engine.get_and_remove(key)?;
        if old.is_some() {
            self.record_local(key, None, old.clone());
        }
        Ok(old)
    }

    /// Insert only when absent; returns the existing value otherwise.
    pub fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let _guard = self.stripe(key).lock();
        let existing = self.engine.put_if_absent(key, value.clone())?;
        if existing.is_none() {
            self.record_local(key, Some(value), None);
        }
        Ok(existing)
    }

    /// Replace only when the current value equals `old`.
    pub fn replace(&self, key: &str, old: &[u8], new: Vec<u8>) -> Result<bool> {
        let _guard = self.stripe(key).lock();
        let replaced = self.engine.replace(key, old, new.clone())?;
        if replaced {
            self.record_local(key, Some(new), Some(old.to_vec()));
        }
        Ok(replaced)
    }

    /// Remove only when the current value equals `expected`.
    pub fn remove_if(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let _guard = self.stripe(key).lock();
        let removed = self.engine.remove_if(key, expected)?;
        if removed {
            self.record_local(key, None, Some(expected.to_vec()));
        }
        Ok(removed)
    }

    /// Remove every entry, one mutation (and one event, one log entry) per
    /// key, so clears replicate like any other write.
    pub fn clear(&self) -> Result<()> {
        for (key, _) in self.engine.entries() {
            self.remove(&key)?;
        }
        Ok(())
    }

    /// Stamp the version, emit the change event and append the replication
    /// entry for one local mutation. Caller holds the key's stripe lock.
    fn record_local(&self, key: &str, new: Option<Vec<u8>>, old: Option<Vec<u8>>) {
        let timestamp_ms = self.next_timestamp();
        let origin = self.origin();
        self.versions.write().insert(
            key.to_string(),
            Version {
                timestamp_ms,
                origin,
            },
        );

        if let Some(log) = &self.log {
            let entry = match &new {
                Some(value) => {
                    ReplicationEntry::put(key.to_string(), value.clone(), timestamp_ms, origin)
                }
                None => ReplicationEntry::tombstone(key.to_string(), timestamp_ms, origin),
            };
            log.append(entry);
        }

        let event = match (new, old) {
            (Some(value), None) => ChangeEvent::Inserted {
                key: key.to_string(),
                value,
            },
            (Some(new_value), Some(old_value)) => ChangeEvent::Updated {
                key: key.to_string(),
                old_value,
                new_value,
            },
            (None, Some(old_value)) => ChangeEvent::Removed {
                key: key.to_string(),
                old_value,
            },
            (None, None) => return,
        };
        self.hub.publish(&event);
    }

    // ---- replication ----

    /// Apply one entry received from a peer. Loop avoidance first, then
    /// last-write-wins against the recorded version. Winners mutate the
    /// engine directly and notify local subscribers, but are never appended
    /// back to the modification log, so entries cannot propagate forever.
    /// Stale and duplicate entries are silently ignored. Returns whether the
    /// entry won.
    pub fn apply_replication(&self, entry: &ReplicationEntry) -> Result<bool> {
        if Some(entry.origin) == self.host_id {
            return Ok(false);
        }

        let _guard = self.stripe(&entry.key).lock();

        let recorded = self.versions.read().get(&entry.key).copied();
        if !entry.wins_over(recorded) {
            return Ok(false);
        }

        let old = if entry.is_deleted {
            self.engine.get_and_remove(&entry.key)?
        } else {
            let value = entry.value.clone().unwrap_or_default();
            self.engine.get_and_put(&entry.key, value)?
        };

        self.versions
            .write()
            .insert(entry.key.clone(), entry.version());

        let event = match (&entry.value, old) {
            (Some(value), None) => Some(ChangeEvent::Inserted {
                key: entry.key.clone(),
                value: value.clone(),
            }),
            (Some(value), Some(old_value)) => Some(ChangeEvent::Updated {
                key: entry.key.clone(),
                old_value,
                new_value: value.clone(),
            }),
            (None, Some(old_value)) => Some(ChangeEvent::Removed {
                key: entry.key.clone(),
                old_value,
            }),
            // Winning tombstone for a key we never had: record the version,
            // nothing was mutated, nothing to announce.
            (None, None) => None,
        };
        if let Some(event) = event {
            self.hub.publish(&event);
        }

        Ok(true)
    }

    /// Snapshot of the store as replication entries carrying their recorded
    /// versions, plus the timestamp the snapshot was taken at. Used for
    /// peer bootstrap; followed on the wire by a single BatchComplete.
    pub fn replication_snapshot(&self) -> (Vec<ReplicationEntry>, u64) {
        let origin = self.origin();
        let versions = self.versions.read();
        let entries = self
            .engine
            .entries()
            .into_iter()
            .map(|(key, value)| {
                let version = versions.get(&key).copied().unwrap_or(Version {
                    timestamp_ms: 0,
                    origin,
                });
                ReplicationEntry {
                    key,
                    value: Some(value),
                    timestamp_ms: version.timestamp_ms,
                    origin: version.origin,
                    is_deleted: false,
                }
            })
            .collect();
        (entries, self.now())
    }
}
