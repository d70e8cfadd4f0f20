use super::engine::StorageEngine;
use super::error::{Result, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One durable mutation record.
#[derive(Debug, Serialize, Deserialize)]
enum WalRecord {
    Put { key: String, value: Vec<u8> },
    Remove { key: String },
}

struct WalInner {
    data: BTreeMap<String, Vec<u8>>,
    writer: BufWriter<File>,
}

/// Durable engine: an in-memory ordered map backed by an append-only log.
/// Each record is framed as `len (u32 BE) | crc32 (u32 BE) | bincode body`;
/// the log is replayed on open and a corrupted tail truncates the replay.
pub struct WalEngine {
    inner: Mutex<WalInner>,
    path: PathBuf,
}

impl WalEngine {
    /// Open or create the log at `path`. Failure here is fatal to store
    /// creation and reported to the caller.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut data = BTreeMap::new();
        if path.exists() {
            Self::replay(&path, &mut data)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), keys = data.len(), "opened write-ahead log");

        Ok(Self {
            inner: Mutex::new(WalInner {
                data,
                writer: BufWriter::new(file),
            }),
            path,
        })
    }

    fn replay(path: &Path, data: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut records = 0usize;

        loop {
            let mut header = [0u8; 8];
            match reader.read_exact(&mut header[..4]) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            if reader.read_exact(&mut header[4..]).is_err() {
                warn!("truncated record header at tail of log, stopping replay");
                break;
            }

            let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let checksum = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

            let mut body = vec![0u8; len];
            if reader.read_exact(&mut body).is_err() {
                warn!("incomplete record at tail of log, stopping replay");
                break;
            }
            if crc32fast::hash(&body) != checksum {
                warn!("checksum mismatch at record {}, stopping replay", records);
                break;
            }

            match bincode::deserialize::<WalRecord>(&body) {
                Ok(WalRecord::Put { key, value }) => {
                    data.insert(key, value);
                }
                Ok(WalRecord::Remove { key }) => {
                    data.remove(&key);
                }
                Err(e) => {
                    warn!("undecodable record at {}: {}, stopping replay", records, e);
                    break;
                }
            }
            records += 1;
        }

        debug!(records, "log replay complete");
        Ok(())
    }

    fn append(writer: &mut BufWriter<File>, record: &WalRecord) -> Result<()> {
        let body = bincode::serialize(record)?;
        if body.len() > u32::MAX as usize {
            return Err(StoreError::Serialization("record too large".to_string()));
        }
        writer.write_all(&(body.len() as u32).to_be_bytes())?;
        writer.write_all(&crc32fast::hash(&body).to_be_bytes())?;
        writer.write_all(&body)?;
        writer.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageEngine for WalEngine {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().data.get(key).cloned()
    }

    fn get_into(&self, key: &str, target: &mut Vec<u8>) -> bool {
        match self.inner.lock().data.get(key) {
            Some(v) => {
                target.clear();
                target.extend_from_slice(v);
                true
            }
            None => false,
        }
    }

    fn get_and_put(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        Self::append(
            &mut inner.writer,
            &WalRecord::Put {
                key: key.to_string(),
                value: value.clone(),
            },
        )?;
        Ok(inner.data.insert(key.to_string(), value))
    }

    fn get_and_remove(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        if !inner.data.contains_key(key) {
            return Ok(None);
        }
        Self::append(
            &mut inner.writer,
            &WalRecord::Remove {
                key: key.to_string(),
            },
        )?;
        Ok(inner.data.remove(key))
    }

    fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.data.get(key) {
            return Ok(Some(existing.clone()));
        }
        Self::append(
            &mut inner.writer,
            &WalRecord::Put {
                key: key.to_string(),
                value: value.clone(),
            },
        )?;
        inner.data.insert(key.to_string(), value);
        Ok(None)
    }

    fn replace(&self, key: &str, old: &[u8], new: Vec<u8>) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.data.get(key) {
            Some(current) if current.as_slice() == old => {
                Self::append(
                    &mut inner.writer,
                    &WalRecord::Put {
                        key: key.to_string(),
                        value: new.clone(),
                    },
                )?;
                inner.data.insert(key.to_string(), new);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn remove_if(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.data.get(key) {
            Some(current) if current.as_slice() == expected => {
                Self::append(
                    &mut inner.writer,
                    &WalRecord::Remove {
                        key: key.to_string(),
                    },
                )?;
                inner.data.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    fn segment_count(&self) -> usize {
        1
    }

    fn keys_for(&self, _segment: usize) -> Vec<String> {
        self.inner.lock().data.keys().cloned().collect()
    }

    fn entries_for(&self, _segment: usize) -> Vec<(String, Vec<u8>)> {
        self.entries()
    }

    fn entries(&self) -> Vec<(String, Vec<u8>)> {
        self.inner
            .lock()
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reopen_replays_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.wal");

        {
            let engine = WalEngine::open(&path).unwrap();
            engine.get_and_put("a", b"1".to_vec()).unwrap();
            engine.get_and_put("b", b"2".to_vec()).unwrap();
            engine.get_and_remove("a").unwrap();
            engine.get_and_put("c", b"3".to_vec()).unwrap();
        }

        let engine = WalEngine::open(&path).unwrap();
        assert_eq!(engine.len(), 2);
        assert_eq!(engine.get("a"), None);
        assert_eq!(engine.get("b"), Some(b"2".to_vec()));
        assert_eq!(engine.get("c"), Some(b"3".to_vec()));
    }

    #[test]
    fn test_corrupted_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.wal");

        {
            let engine = WalEngine::open(&path).unwrap();
            engine.get_and_put("a", b"1".to_vec()).unwrap();
        }

        // Flip a byte in the last record's body.
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let engine = WalEngine::open(&path).unwrap();
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn test_open_failure_is_reported() {
        // A directory where the log file should be.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("occupied");
        std::fs::create_dir(&path).unwrap();
        assert!(WalEngine::open(&path).is_err());
    }

    #[test]
    fn test_remove_of_absent_key_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.wal");

        let engine = WalEngine::open(&path).unwrap();
        assert_eq!(engine.get_and_remove("nope").unwrap(), None);
        drop(engine);

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
