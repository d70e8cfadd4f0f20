use super::ClientError;
use crate::protocol::{read_frame, write_frame, Request, RequestBody, Response, ResponseBody};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

type Slot = mpsc::UnboundedSender<ResponseBody>;

/// One TCP connection to a server, shared by any number of callers. Calls
/// are stateless on the wire: each carries its transaction id and the store
/// it addresses, and a background demux task routes each response frame to
/// whichever caller issued that id.
pub struct Connection {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Arc<Mutex<HashMap<u64, Slot>>>,
    next_txn: AtomicU64,
    closed: Arc<AtomicBool>,
    call_timeout: Duration,
}

impl Connection {
    pub async fn connect(addr: SocketAddr) -> Result<Arc<Self>, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let (mut reader, writer) = stream.into_split();

        let pending: Arc<Mutex<HashMap<u64, Slot>>> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let demux_pending = Arc::clone(&pending);
        let demux_closed = Arc::clone(&closed);
        tokio::spawn(async move {
            loop {
                match read_frame::<_, Response>(&mut reader).await {
                    Ok(Some(response)) => {
                        let slot = demux_pending.lock().get(&response.txn_id).cloned();
                        match slot {
                            Some(slot) => {
                                // A dropped receiver just means the caller
                                // stopped waiting; nothing to do.
                                let _ = slot.send(response.body);
                            }
                            None => {
                                debug!(txn_id = response.txn_id, "response for unknown txn");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("demux ended: {}", e);
                        break;
                    }
                }
            }
            demux_closed.store(true, Ordering::SeqCst);
            // Dropping the slots wakes every in-flight caller with a
            // connection-closed error.
            demux_pending.lock().clear();
        });

        Ok(Arc::new(Self {
            writer: tokio::sync::Mutex::new(writer),
            pending,
            next_txn: AtomicU64::new(1),
            closed,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Shut the connection down: later calls are refused, the write half is
    /// closed so the server sees EOF, and every pending waiter fails with
    /// `ConnectionClosed`.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        drop(writer);
        self.pending.lock().clear();
    }

    pub fn next_txn(&self) -> u64 {
        self.next_txn.fetch_add(1, Ordering::SeqCst)
    }

    /// Route responses for `txn_id` to the returned receiver until
    /// `release` is called. Used for long-lived streams (subscriptions).
    pub fn register(&self, txn_id: u64) -> mpsc::UnboundedReceiver<ResponseBody> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().insert(txn_id, tx);
        rx
    }

    pub fn release(&self, txn_id: u64) {
        self.pending.lock().remove(&txn_id);
    }

    /// Write one request frame. The writer lock covers only the write, so
    /// concurrent callers interleave whole frames, never partial ones.
    pub async fn send(&self, request: &Request) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, request)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    /// One request, one response. Faults come back as errors.
    pub async fn call(&self, store: &str, body: RequestBody) -> Result<ResponseBody, ClientError> {
        let txn_id = self.next_txn();
        let mut rx = self.register(txn_id);

        let request = Request {
            txn_id,
            store: store.to_string(),
            body,
        };
        if let Err(e) = self.send(&request).await {
            self.release(txn_id);
            return Err(e);
        }

        let outcome = tokio::time::timeout(self.call_timeout, rx.recv()).await;
        self.release(txn_id);

        match outcome {
            Ok(Some(ResponseBody::Fault(fault))) => Err(ClientError::Fault(fault)),
            Ok(Some(body)) => Ok(body),
            Ok(None) => Err(ClientError::ConnectionClosed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Liveness probe.
    pub async fn ping(&self) -> Result<(), ClientError> {
        match self.call("", RequestBody::Ping).await? {
            ResponseBody::Pong => Ok(()),
            other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }
}
