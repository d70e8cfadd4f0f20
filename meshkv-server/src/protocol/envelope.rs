use crate::core::error::StoreError;
use crate::core::events::ChangeEvent;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One client call. `txn_id` correlates the response (or the event stream,
/// for `Subscribe`) back to the caller; many calls share one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub txn_id: u64,
    /// Store the call addresses.
    pub store: String,
    pub body: RequestBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestBody {
    Get { key: String },
    GetAndPut { key: String, value: Vec<u8> },
    GetAndRemove { key: String },
    PutIfAbsent { key: String, value: Vec<u8> },
    Replace { key: String, old: Vec<u8>, new: Vec<u8> },
    RemoveIfEq { key: String, expected: Vec<u8> },
    ContainsKey { key: String },
    Size,
    Clear,
    /// Materialize the key set server-side; returns a collection handle.
    KeySet,
    /// Materialize the entry set server-side; returns a collection handle.
    EntrySet,
    /// Page through a previously materialized collection.
    FetchChunk { handle: u64, start: usize, count: usize },
    ReleaseHandle { handle: u64 },
    /// Start streaming change events on this txn_id until unsubscribed or
    /// the connection closes. `bootstrap` opts into BatchComplete markers.
    Subscribe { bootstrap: bool },
    /// Stop the event stream started under `subscriber_txn`.
    Unsubscribe { subscriber_txn: u64 },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub txn_id: u64,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseBody {
    Value(Option<Vec<u8>>),
    Bool(bool),
    Size(usize),
    Unit,
    /// Server-side collection snapshot: opaque handle plus its length.
    Handle { handle: u64, len: usize },
    Keys(Vec<String>),
    Entries(Vec<(String, Vec<u8>)>),
    /// One change event on a subscription stream.
    Event(ChangeEvent),
    /// Terminates a subscription stream.
    SubscriptionEnded,
    Fault(Fault),
    Pong,
}

/// Failures reported to remote callers. Carried by value so they serialize
/// cleanly across the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Fault {
    #[error("key must not be empty")]
    EmptyKey,

    #[error("value must not be empty")]
    EmptyValue,

    #[error("store not found: {0}")]
    StoreNotFound(String),

    #[error("unknown collection handle: {0}")]
    UnknownHandle(u64),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<&StoreError> for Fault {
    fn from(e: &StoreError) -> Self {
        match e {
            StoreError::EmptyKey => Fault::EmptyKey,
            StoreError::EmptyValue => Fault::EmptyValue,
            StoreError::StoreNotFound(name) => Fault::StoreNotFound(name.clone()),
            StoreError::InvalidRequest(msg) => Fault::BadRequest(msg.clone()),
            other => Fault::Internal(other.to_string()),
        }
    }
}
