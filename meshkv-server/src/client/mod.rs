//! Client side of the wire protocol: a multiplexing connection plus
//! map-shaped remote views over it.

pub mod connection;
pub mod remote;
pub mod subscription;

pub use connection::Connection;
pub use remote::{RemoteEntrySet, RemoteKeySet, RemoteMap};
pub use subscription::RemoteSubscription;

use crate::protocol::Fault;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("call timed out")]
    Timeout,

    #[error(transparent)]
    Fault(#[from] Fault),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
