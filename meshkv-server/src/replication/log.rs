use super::types::{ReplicationError, ReplicationResult};
use crate::core::events::ReplicationEntry;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// One appended modification, stamped with its position in the log.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub offset: u64,
    pub entry: ReplicationEntry,
}

/// Bounded in-memory buffer of modifications to ship to peers. Offsets are
/// monotonically increasing; once the buffer overflows, peers asking for an
/// evicted offset need a full bootstrap instead.
pub struct ModificationLog {
    records: RwLock<VecDeque<LogRecord>>,
    /// Next offset to assign.
    current_offset: AtomicU64,
    /// Oldest offset still buffered.
    oldest_offset: AtomicU64,
    max_size: usize,
    appended: Notify,
}

impl ModificationLog {
    pub fn new(max_size: usize) -> Arc<Self> {
        Arc::new(Self {
            records: RwLock::new(VecDeque::with_capacity(max_size.min(1024))),
            current_offset: AtomicU64::new(0),
            oldest_offset: AtomicU64::new(0),
            max_size,
            appended: Notify::new(),
        })
    }

    /// Append one entry, returning its offset. Wakes any per-peer drain
    /// waiting for new records.
    pub fn append(&self, entry: ReplicationEntry) -> u64 {
        let offset = self.current_offset.fetch_add(1, Ordering::SeqCst);

        let mut records = self.records.write();
        if records.len() >= self.max_size {
            if let Some(evicted) = records.pop_front() {
                self.oldest_offset
                    .store(evicted.offset + 1, Ordering::SeqCst);
                debug!(offset = evicted.offset, "log full, evicted oldest record");
            }
        }
        records.push_back(LogRecord { offset, entry });
        drop(records);

        self.appended.notify_waiters();
        offset
    }

    /// Records at or after `from_offset`, in order. Fails when that position
    /// has been evicted, which forces the peer through a full bootstrap.
    pub fn get_from(&self, from_offset: u64) -> ReplicationResult<Vec<LogRecord>> {
        if from_offset < self.oldest_offset.load(Ordering::SeqCst) {
            return Err(ReplicationError::BootstrapRequired);
        }

        let records = self.records.read();
        Ok(records
            .iter()
            .filter(|r| r.offset >= from_offset)
            .cloned()
            .collect())
    }

    /// Next offset to be assigned (equivalently, count of appends so far).
    pub fn current_offset(&self) -> u64 {
        self.current_offset.load(Ordering::SeqCst)
    }

    pub fn oldest_offset(&self) -> u64 {
        self.oldest_offset.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least one record past `seen` exists.
    pub async fn wait_past(&self, seen: u64) {
        loop {
            // Register interest before re-checking to avoid a lost wakeup.
            let notified = self.appended.notified();
            if self.current_offset() > seen {
                return;
            }
            notified.await;
        }
    }
}
