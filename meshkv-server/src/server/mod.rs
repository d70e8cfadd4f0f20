//! TCP server exposing stores to remote clients. Each connection carries
//! many interleaved calls, correlated by transaction id; responses are
//! funneled through a single writer task so subscription streams and call
//! replies share the socket safely.

use crate::core::error::StoreError;
use crate::core::store::KvStore;
use crate::protocol::{read_frame, write_frame, Fault, Request, RequestBody, Response, ResponseBody};
use crate::subscription::{SubscriberGone, SubscriptionHub, SubscriptionId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Stores served by this node, by name.
#[derive(Default)]
pub struct StoreRegistry {
    stores: RwLock<HashMap<String, Arc<KvStore>>>,
}

impl StoreRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, store: Arc<KvStore>) {
        self.stores.write().insert(store.name().to_string(), store);
    }

    pub fn get(&self, name: &str) -> Option<Arc<KvStore>> {
        self.stores.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.stores.read().keys().cloned().collect()
    }
}

/// Server-side snapshot a client pages through with FetchChunk.
enum Collection {
    Keys(Vec<String>),
    Entries(Vec<(String, Vec<u8>)>),
}

impl Collection {
    fn len(&self) -> usize {
        match self {
            Collection::Keys(v) => v.len(),
            Collection::Entries(v) => v.len(),
        }
    }
}

/// Per-connection state: materialized collections and live subscriptions.
/// Dropped wholesale when the connection closes.
struct ConnState {
    handles: HashMap<u64, Collection>,
    next_handle: u64,
    /// Active subscriptions by their transaction id, with the hub they are
    /// registered on so they can be torn down.
    subscriptions: HashMap<u64, (SubscriptionHub, SubscriptionId)>,
}

impl ConnState {
    fn new() -> Self {
        Self {
            handles: HashMap::new(),
            next_handle: 1,
            subscriptions: HashMap::new(),
        }
    }
}

pub struct WireServer {
    registry: Arc<StoreRegistry>,
    running: Arc<AtomicBool>,
}

impl WireServer {
    pub fn new(registry: Arc<StoreRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Bind and start accepting clients. Returns the bound address.
    pub async fn start(self: &Arc<Self>, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        self.running.store(true, Ordering::SeqCst);
        info!(%bound, "server listening");

        let server = Arc::clone(self);
        tokio::spawn(async move {
            while server.running.load(Ordering::SeqCst) {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!(%remote, "client connected");
                        let registry = Arc::clone(&server.registry);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, registry).await {
                                debug!(%remote, "connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        if server.running.load(Ordering::SeqCst) {
                            error!("accept failed: {}", e);
                        }
                        break;
                    }
                }
            }
        });

        Ok(bound)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn handle_connection(
    stream: TcpStream,
    registry: Arc<StoreRegistry>,
) -> Result<(), crate::protocol::FrameError> {
    let (mut reader, mut writer) = stream.into_split();

    // Single writer task; everything the connection emits goes through it.
    let (tx, mut rx) = mpsc::unbounded_channel::<Response>();
    let writer_task = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &response).await {
                debug!("write failed, closing connection: {}", e);
                break;
            }
        }
    });

    let mut state = ConnState::new();
    let result = loop {
        match read_frame::<_, Request>(&mut reader).await {
            Ok(Some(request)) => {
                let txn_id = request.txn_id;
                if let Some(body) = dispatch(&registry, &mut state, &tx, request) {
                    if tx.send(Response { txn_id, body }).is_err() {
                        break Ok(());
                    }
                }
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    // Tear down whatever the connection left registered.
    for (_, (hub, id)) in state.subscriptions.drain() {
        hub.unregister(id);
    }
    drop(tx);
    let _ = writer_task.await;
    result
}

/// Execute one request. Returns the response body, or None when the request
/// produces no direct reply (a successful Subscribe only streams events).
fn dispatch(
    registry: &StoreRegistry,
    state: &mut ConnState,
    tx: &mpsc::UnboundedSender<Response>,
    request: Request,
) -> Option<ResponseBody> {
    let Request { txn_id, store, body } = request;

    if let RequestBody::Ping = body {
        return Some(ResponseBody::Pong);
    }

    let store = match registry.get(&store) {
        Some(s) => s,
        None => return Some(ResponseBody::Fault(Fault::StoreNotFound(store))),
    };

    let result = match body {
        RequestBody::Get { key } => {
            check_key(&key).map(|_| ResponseBody::Value(store.get(&key)))
        }
        RequestBody::GetAndPut { key, value } => check_key(&key)
            .and_then(|_| check_value(&value))
            .and_then(|_| Ok(ResponseBody::Value(store.put(&key, value)?))),
        RequestBody::GetAndRemove { key } => {
            check_key(&key).and_then(|_| Ok(ResponseBody::Value(store.remove(&key)?)))
        }
        RequestBody::PutIfAbsent { key, value } => check_key(&key)
            .and_then(|_| check_value(&value))
            .and_then(|_| Ok(ResponseBody::Value(store.put_if_absent(&key, value)?))),
        RequestBody::Replace { key, old, new } => check_key(&key)
            .and_then(|_| check_value(&new))
            .and_then(|_| Ok(ResponseBody::Bool(store.replace(&key, &old, new)?))),
        RequestBody::RemoveIfEq { key, expected } => {
            check_key(&key).and_then(|_| Ok(ResponseBody::Bool(store.remove_if(&key, &expected)?)))
        }
        RequestBody::ContainsKey { key } => {
            check_key(&key).map(|_| ResponseBody::Bool(store.contains_key(&key)))
        }
        RequestBody::Size => Ok(ResponseBody::Size(store.len())),
        RequestBody::Clear => store.clear().map(|_| ResponseBody::Unit),
        RequestBody::KeySet => {
            let keys = store.keys_for(0);
            Ok(materialize(state, Collection::Keys(keys)))
        }
        RequestBody::EntrySet => {
            let entries = store.entries();
            Ok(materialize(state, Collection::Entries(entries)))
        }
        RequestBody::FetchChunk { handle, start, count } => {
            return Some(fetch_chunk(state, handle, start, count));
        }
        RequestBody::ReleaseHandle { handle } => {
            state.handles.remove(&handle);
            Ok(ResponseBody::Unit)
        }
        RequestBody::Subscribe { bootstrap } => {
            subscribe(state, tx, &store, txn_id, bootstrap);
            return None;
        }
        RequestBody::Unsubscribe { subscriber_txn } => {
            if let Some((hub, id)) = state.subscriptions.remove(&subscriber_txn) {
                hub.unregister(id);
                // Lets the client's receive loop finish cleanly.
                let _ = tx.send(Response {
                    txn_id: subscriber_txn,
                    body: ResponseBody::SubscriptionEnded,
                });
                Ok(ResponseBody::Unit)
            } else {
                Err(StoreError::InvalidRequest(format!(
                    "no subscription on txn {}",
                    subscriber_txn
                )))
            }
        }
        RequestBody::Ping => unreachable!("handled above"),
    };

    Some(match result {
        Ok(body) => body,
        Err(e) => {
            warn!(txn_id, "request failed: {}", e);
            ResponseBody::Fault(Fault::from(&e))
        }
    })
}

fn check_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        Err(StoreError::EmptyKey)
    } else {
        Ok(())
    }
}

fn check_value(value: &[u8]) -> Result<(), StoreError> {
    if value.is_empty() {
        Err(StoreError::EmptyValue)
    } else {
        Ok(())
    }
}

fn materialize(state: &mut ConnState, collection: Collection) -> ResponseBody {
    let handle = state.next_handle;
    state.next_handle += 1;
    let len = collection.len();
    state.handles.insert(handle, collection);
    ResponseBody::Handle { handle, len }
}

fn fetch_chunk(state: &ConnState, handle: u64, start: usize, count: usize) -> ResponseBody {
    match state.handles.get(&handle) {
        Some(Collection::Keys(keys)) => {
            let end = (start + count).min(keys.len());
            ResponseBody::Keys(keys.get(start..end).unwrap_or_default().to_vec())
        }
        Some(Collection::Entries(entries)) => {
            let end = (start + count).min(entries.len());
            ResponseBody::Entries(entries.get(start..end).unwrap_or_default().to_vec())
        }
        None => ResponseBody::Fault(Fault::UnknownHandle(handle)),
    }
}

/// Register a hub subscriber that forwards events down the connection's
/// writer channel under the subscription's transaction id. A closed channel
/// reports `SubscriberGone`, so a vanished client is pruned on the next
/// event rather than leaking its registration.
fn subscribe(
    state: &mut ConnState,
    tx: &mpsc::UnboundedSender<Response>,
    store: &Arc<KvStore>,
    txn_id: u64,
    bootstrap: bool,
) {
    let hub = store.hub().clone();
    let forward = tx.clone();
    let id = hub.register_subscriber(
        None,
        bootstrap,
        Box::new(move |event| {
            forward
                .send(Response {
                    txn_id,
                    body: ResponseBody::Event(event.clone()),
                })
                .map_err(|_| SubscriberGone)
        }),
    );
    state.subscriptions.insert(txn_id, (hub, id));
}
