use super::connection::Connection;
use super::subscription::RemoteSubscription;
use super::ClientError;
use crate::protocol::{Fault, RequestBody, ResponseBody};
use std::sync::Arc;

/// Page size used when draining a server-side collection.
const CHUNK: usize = 512;

/// Map-shaped view of one remote store. Holds no key-value state of its
/// own: every operation is a call over the shared connection, so any number
/// of `RemoteMap`s (for the same or different stores) can share one socket.
#[derive(Clone)]
pub struct RemoteMap {
    conn: Arc<Connection>,
    store: String,
}

impl RemoteMap {
    pub fn new(conn: Arc<Connection>, store: impl Into<String>) -> Self {
        Self {
            conn,
            store: store.into(),
        }
    }

    pub fn store_name(&self) -> &str {
        &self.store
    }

    /// Reject bad arguments before they touch the network; the server
    /// enforces the same rules.
    fn check_key(key: &str) -> Result<(), ClientError> {
        if key.is_empty() {
            return Err(ClientError::Fault(Fault::EmptyKey));
        }
        Ok(())
    }

    fn check_value(value: &[u8]) -> Result<(), ClientError> {
        if value.is_empty() {
            return Err(ClientError::Fault(Fault::EmptyValue));
        }
        Ok(())
    }

    async fn call(&self, body: RequestBody) -> Result<ResponseBody, ClientError> {
        self.conn.call(&self.store, body).await
    }

    fn expect_value(body: ResponseBody) -> Result<Option<Vec<u8>>, ClientError> {
        match body {
            ResponseBody::Value(v) => Ok(v),
            other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    fn expect_bool(body: ResponseBody) -> Result<bool, ClientError> {
        match body {
            ResponseBody::Bool(b) => Ok(b),
            other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ClientError> {
        Self::check_key(key)?;
        Self::expect_value(self.call(RequestBody::Get { key: key.to_string() }).await?)
    }

    /// Insert, returning the previous value.
    pub async fn insert(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>, ClientError> {
        Self::check_key(key)?;
        Self::check_value(&value)?;
        Self::expect_value(
            self.call(RequestBody::GetAndPut {
                key: key.to_string(),
                value,
            })
            .await?,
        )
    }

    /// Remove, returning the previous value.
    pub async fn remove(&self, key: &str) -> Result<Option<Vec<u8>>, ClientError> {
        Self::check_key(key)?;
        Self::expect_value(
            self.call(RequestBody::GetAndRemove {
                key: key.to_string(),
            })
            .await?,
        )
    }

    pub async fn insert_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, ClientError> {
        Self::check_key(key)?;
        Self::check_value(&value)?;
        Self::expect_value(
            self.call(RequestBody::PutIfAbsent {
                key: key.to_string(),
                value,
            })
            .await?,
        )
    }

    pub async fn replace(
        &self,
        key: &str,
        old: Vec<u8>,
        new: Vec<u8>,
    ) -> Result<bool, ClientError> {
        Self::check_key(key)?;
        Self::check_value(&new)?;
        Self::expect_bool(
            self.call(RequestBody::Replace {
                key: key.to_string(),
                old,
                new,
            })
            .await?,
        )
    }

    pub async fn remove_if_eq(&self, key: &str, expected: Vec<u8>) -> Result<bool, ClientError> {
        Self::check_key(key)?;
        Self::expect_bool(
            self.call(RequestBody::RemoveIfEq {
                key: key.to_string(),
                expected,
            })
            .await?,
        )
    }

    pub async fn contains_key(&self, key: &str) -> Result<bool, ClientError> {
        Self::check_key(key)?;
        Self::expect_bool(
            self.call(RequestBody::ContainsKey {
                key: key.to_string(),
            })
            .await?,
        )
    }

    pub async fn len(&self) -> Result<usize, ClientError> {
        match self.call(RequestBody::Size).await? {
            ResponseBody::Size(n) => Ok(n),
            other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    pub async fn is_empty(&self) -> Result<bool, ClientError> {
        Ok(self.len().await? == 0)
    }

    pub async fn clear(&self) -> Result<(), ClientError> {
        match self.call(RequestBody::Clear).await? {
            ResponseBody::Unit => Ok(()),
            other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Materialize the key set server-side and return a paged view of it.
    pub async fn key_set(&self) -> Result<RemoteKeySet, ClientError> {
        match self.call(RequestBody::KeySet).await? {
            ResponseBody::Handle { handle, len } => Ok(RemoteKeySet {
                view: RemoteCollection {
                    map: self.clone(),
                    handle,
                    len,
                },
            }),
            other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Materialize the entry set server-side and return a paged view of it.
    pub async fn entry_set(&self) -> Result<RemoteEntrySet, ClientError> {
        match self.call(RequestBody::EntrySet).await? {
            ResponseBody::Handle { handle, len } => Ok(RemoteEntrySet {
                view: RemoteCollection {
                    map: self.clone(),
                    handle,
                    len,
                },
            }),
            other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Start streaming change events for this store.
    pub async fn subscribe(&self, bootstrap: bool) -> Result<RemoteSubscription, ClientError> {
        RemoteSubscription::open(Arc::clone(&self.conn), self.store.clone(), bootstrap).await
    }
}

/// Snapshot held server-side; paged over on demand and released when done.
struct RemoteCollection {
    map: RemoteMap,
    handle: u64,
    len: usize,
}

impl RemoteCollection {
    async fn fetch(&self, start: usize, count: usize) -> Result<ResponseBody, ClientError> {
        self.map
            .call(RequestBody::FetchChunk {
                handle: self.handle,
                start,
                count,
            })
            .await
    }

    async fn release(&self) -> Result<(), ClientError> {
        self.map
            .call(RequestBody::ReleaseHandle {
                handle: self.handle,
            })
            .await
            .map(|_| ())
    }
}

pub struct RemoteKeySet {
    view: RemoteCollection,
}

impl RemoteKeySet {
    pub fn len(&self) -> usize {
        self.view.len
    }

    pub fn is_empty(&self) -> bool {
        self.view.len == 0
    }

    pub async fn fetch(&self, start: usize, count: usize) -> Result<Vec<String>, ClientError> {
        match self.view.fetch(start, count).await? {
            ResponseBody::Keys(keys) => Ok(keys),
            other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Drain the whole key set in pages, then release the server handle.
    pub async fn collect(self) -> Result<Vec<String>, ClientError> {
        let mut keys = Vec::with_capacity(self.view.len);
        while keys.len() < self.view.len {
            let chunk = self.fetch(keys.len(), CHUNK).await?;
            if chunk.is_empty() {
                break;
            }
            keys.extend(chunk);
        }
        self.view.release().await?;
        Ok(keys)
    }
}

pub struct RemoteEntrySet {
    view: RemoteCollection,
}

impl RemoteEntrySet {
    pub fn len(&self) -> usize {
        self.view.len
    }

    pub fn is_empty(&self) -> bool {
        self.view.len == 0
    }

    pub async fn fetch(
        &self,
        start: usize,
        count: usize,
    ) -> Result<Vec<(String, Vec<u8>)>, ClientError> {
        match self.view.fetch(start, count).await? {
            ResponseBody::Entries(entries) => Ok(entries),
            other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Drain all entries in pages, then release the server handle.
    pub async fn collect(self) -> Result<Vec<(String, Vec<u8>)>, ClientError> {
        let mut entries = Vec::with_capacity(self.view.len);
        while entries.len() < self.view.len {
            let chunk = self.fetch(entries.len(), CHUNK).await?;
            if chunk.is_empty() {
                break;
            }
            entries.extend(chunk);
        }
        self.view.release().await?;
        Ok(entries)
    }
}
