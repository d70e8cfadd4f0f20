use super::config::{PeerConfig, ReplicationConfig};
use super::log::ModificationLog;
use super::types::{PeerMessage, ReplicationError, ReplicationResult, ReplicationStats};
use crate::core::events::{unix_millis, HostId, ReplicationEntry};
use crate::core::store::KvStore;
use crate::protocol::frame::{read_frame, write_frame};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct StatsInner {
    entries_sent: AtomicU64,
    entries_applied: AtomicU64,
    entries_discarded: AtomicU64,
    bootstraps_served: AtomicU64,
    connected_peers: AtomicUsize,
}

/// Drives replication for this node: serves local modification logs to
/// peers that dial in, and dials every configured peer to pull theirs.
/// Each connection replicates one store in one direction, so a node pair
/// exchanging one store both ways holds two sockets.
pub struct ReplicationCoordinator {
    config: ReplicationConfig,
    /// Replicated stores by name. Registered before `start`.
    stores: RwLock<HashMap<String, Arc<KvStore>>>,
    /// Next offset each downstream peer has acked, per (peer, store).
    cursors: Arc<RwLock<HashMap<(HostId, String), u64>>>,
    /// Our resume position per (upstream peer, store), advanced as entries
    /// apply.
    applied: Arc<RwLock<HashMap<(HostId, String), u64>>>,
    running: Arc<AtomicBool>,
    stats: Arc<StatsInner>,
}

impl ReplicationCoordinator {
    pub fn new(config: ReplicationConfig) -> ReplicationResult<Arc<Self>> {
        config
            .validate()
            .map_err(ReplicationError::HandshakeFailed)?;
        Ok(Arc::new(Self {
            config,
            stores: RwLock::new(HashMap::new()),
            cursors: Arc::new(RwLock::new(HashMap::new())),
            applied: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(StatsInner::default()),
        }))
    }

    /// Add a store to the mesh. Call before `start`; stores registered
    /// later are served to peers but not pulled from them.
    pub fn register_store(&self, store: Arc<KvStore>) -> ReplicationResult<()> {
        if store.log().is_none() {
            return Err(ReplicationError::HandshakeFailed(format!(
                "store {} is not replicated",
                store.name()
            )));
        }
        self.stores
            .write()
            .insert(store.name().to_string(), store);
        Ok(())
    }

    fn store(&self, name: &str) -> Option<Arc<KvStore>> {
        self.stores.read().get(name).cloned()
    }

    fn store_names(&self) -> Vec<String> {
        self.stores.read().keys().cloned().collect()
    }

    /// Bind the peer listener and spawn the per-peer pull tasks. Returns
    /// the bound address, which differs from the configured one when an
    /// ephemeral port was requested.
    pub async fn start(self: &Arc<Self>) -> ReplicationResult<std::net::SocketAddr> {
        let addr = self
            .config
            .listen_address
            .ok_or_else(|| ReplicationError::HandshakeFailed("no listen_address".to_string()))?;

        self.running.store(true, Ordering::SeqCst);

        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        info!(host_id = self.config.host_id, %bound, "replication listening");

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.accept_loop(listener).await;
        });

        for peer in self.config.peers.clone() {
            self.add_peer(peer);
        }

        Ok(bound)
    }

    /// Start pulling every registered store from one more peer. Safe to
    /// call after `start`.
    pub fn add_peer(self: &Arc<Self>, peer: PeerConfig) {
        for store in self.store_names() {
            let coordinator = Arc::clone(self);
            let peer = peer.clone();
            tokio::spawn(async move {
                coordinator.pull_loop(peer, store).await;
            });
        }
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(host_id = self.config.host_id, "replication shutting down");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ReplicationStats {
        let log_offset = self
            .stores
            .read()
            .values()
            .filter_map(|s| s.log().map(|l| l.current_offset()))
            .sum();
        ReplicationStats {
            entries_sent: self.stats.entries_sent.load(Ordering::Relaxed),
            entries_applied: self.stats.entries_applied.load(Ordering::Relaxed),
            entries_discarded: self.stats.entries_discarded.load(Ordering::Relaxed),
            bootstraps_served: self.stats.bootstraps_served.load(Ordering::Relaxed),
            connected_peers: self.stats.connected_peers.load(Ordering::Relaxed),
            log_offset,
        }
    }

    /// Next offset wanted from an upstream peer, as advanced by applies.
    pub fn resume_position(&self, peer: HostId, store: &str) -> Option<u64> {
        self.applied
            .read()
            .get(&(peer, store.to_string()))
            .copied()
    }

    /// Next offset a downstream peer has acked.
    pub fn peer_cursor(&self, peer: HostId, store: &str) -> Option<u64> {
        self.cursors
            .read()
            .get(&(peer, store.to_string()))
            .copied()
    }

    // ---- serving side: peers pull our logs ----

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while self.running.load(Ordering::SeqCst) {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    debug!(%remote, "peer connected");
                    let coordinator = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = coordinator.serve_peer(stream).await {
                            warn!(%remote, "peer session ended: {}", e);
                        }
                    });
                }
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        error!("accept failed: {}", e);
                    }
                    break;
                }
            }
        }
    }

    /// One inbound session: handshake, optional bootstrap, then live drain
    /// of the store's modification log. Acks from the peer advance its
    /// cursor.
    async fn serve_peer(self: Arc<Self>, stream: TcpStream) -> ReplicationResult<()> {
        let (mut reader, mut writer) = stream.into_split();

        let (peer_id, store_name, resume_from) =
            match read_frame::<_, PeerMessage>(&mut reader).await? {
                Some(PeerMessage::Hello {
                    host_id,
                    store,
                    resume_from,
                }) => (host_id, store, resume_from),
                Some(other) => {
                    return Err(ReplicationError::HandshakeFailed(format!(
                        "expected Hello, got {:?}",
                        other
                    )))
                }
                None => return Ok(()),
            };

        let store = self.store(&store_name).ok_or_else(|| {
            ReplicationError::HandshakeFailed(format!("unknown replicated store {store_name}"))
        })?;
        let log = Arc::clone(store.log().ok_or_else(|| {
            ReplicationError::HandshakeFailed(format!("store {store_name} is not replicated"))
        })?);
        info!(peer = peer_id, store = %store_name, ?resume_from, "serving peer");

        // Decide between log resume and full bootstrap.
        let needs_bootstrap = match resume_from {
            Some(offset) => matches!(
                log.get_from(offset),
                Err(ReplicationError::BootstrapRequired)
            ),
            None => true,
        };

        let mut next = if needs_bootstrap {
            self.send_bootstrap(&mut writer, &store, &log).await?
        } else {
            resume_from.unwrap_or_default()
        };

        // Acks flow back on the same socket; a second task drains them.
        let ack_task = {
            let coordinator = Arc::clone(&self);
            let store_name = store_name.clone();
            tokio::spawn(async move {
                coordinator
                    .drain_acks(peer_id, store_name, &mut reader)
                    .await;
            })
        };

        let result = self
            .stream_live(&mut writer, &log, peer_id, &mut next)
            .await;
        ack_task.abort();
        result
    }

    /// Snapshot the store to the peer, close with the batch boundary, and
    /// return the log offset live streaming continues from.
    async fn send_bootstrap(
        &self,
        writer: &mut OwnedWriteHalf,
        store: &KvStore,
        log: &ModificationLog,
    ) -> ReplicationResult<u64> {
        let resume_offset = log.current_offset();
        let (entries, data_up_to_ms) = store.replication_snapshot();
        let count = entries.len();

        for entry in entries {
            write_frame(writer, &PeerMessage::SnapshotEntry { entry })
                .await
                .map_err(|e| ReplicationError::ConnectionFailed(e.to_string()))?;
        }
        write_frame(
            writer,
            &PeerMessage::BatchComplete {
                data_up_to_ms,
                resume_offset,
            },
        )
        .await
        .map_err(|e| ReplicationError::ConnectionFailed(e.to_string()))?;

        self.stats.bootstraps_served.fetch_add(1, Ordering::Relaxed);
        info!(entries = count, resume_offset, "bootstrap snapshot sent");
        Ok(resume_offset)
    }

    async fn stream_live(
        &self,
        writer: &mut OwnedWriteHalf,
        log: &ModificationLog,
        peer_id: HostId,
        next: &mut u64,
    ) -> ReplicationResult<()> {
        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.running.load(Ordering::SeqCst) {
            let records = log.get_from(*next)?;
            for record in records {
                *next = record.offset + 1;
                // The peer already has its own writes.
                if record.entry.origin == peer_id {
                    continue;
                }
                write_frame(
                    writer,
                    &PeerMessage::Entry {
                        offset: record.offset,
                        entry: record.entry,
                    },
                )
                .await
                .map_err(|e| ReplicationError::ConnectionFailed(e.to_string()))?;
                self.stats.entries_sent.fetch_add(1, Ordering::Relaxed);
            }

            tokio::select! {
                _ = log.wait_past(*next) => {}
                _ = heartbeat.tick() => {
                    write_frame(writer, &PeerMessage::Heartbeat {
                        offset: log.current_offset(),
                        timestamp_ms: unix_millis(),
                    })
                    .await
                    .map_err(|e| ReplicationError::ConnectionFailed(e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    async fn drain_acks(&self, peer_id: HostId, store: String, reader: &mut OwnedReadHalf) {
        loop {
            match read_frame::<_, PeerMessage>(reader).await {
                Ok(Some(PeerMessage::Ack { next_wanted })) => {
                    self.cursors
                        .write()
                        .insert((peer_id, store.clone()), next_wanted);
                }
                Ok(Some(other)) => {
                    debug!(peer = peer_id, "unexpected message from peer: {:?}", other);
                }
                Ok(None) | Err(_) => break,
            }
        }
    }

    // ---- pulling side: we consume a peer's log ----

    async fn pull_loop(self: Arc<Self>, peer: PeerConfig, store: String) {
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);

        while self.running.load(Ordering::SeqCst) {
            match self.pull_session(&peer, &store).await {
                Ok(()) => {
                    info!(peer = peer.host_id, store = %store, "replication session closed");
                }
                Err(e) => {
                    warn!(peer = peer.host_id, store = %store, "replication session failed: {}", e);
                }
            }

            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if !self.config.auto_reconnect {
                warn!(peer = peer.host_id, "auto-reconnect disabled, giving up");
                break;
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// One outbound session: dial, announce our resume position, then apply
    /// everything the peer streams until the connection drops.
    async fn pull_session(&self, peer: &PeerConfig, store_name: &str) -> ReplicationResult<()> {
        let store = self.store(store_name).ok_or_else(|| {
            ReplicationError::HandshakeFailed(format!("store {store_name} no longer registered"))
        })?;

        let stream = TcpStream::connect(peer.address)
            .await
            .map_err(|e| ReplicationError::ConnectionFailed(e.to_string()))?;
        let (mut reader, mut writer) = stream.into_split();

        let resume_from = self.resume_position(peer.host_id, store_name);
        write_frame(
            &mut writer,
            &PeerMessage::Hello {
                host_id: self.config.host_id,
                store: store_name.to_string(),
                resume_from,
            },
        )
        .await
        .map_err(|e| ReplicationError::ConnectionFailed(e.to_string()))?;
        info!(peer = peer.host_id, store = %store_name, ?resume_from, "pulling from peer");

        self.stats.connected_peers.fetch_add(1, Ordering::Relaxed);

        // Acks are written from their own task, so frame reads are never
        // torn by a timer firing mid-read.
        let ack_task = {
            let applied = Arc::clone(&self.applied);
            let key = (peer.host_id, store_name.to_string());
            let interval_ms = self.config.ack_interval_ms;
            tokio::spawn(async move {
                let mut ack_interval =
                    tokio::time::interval(Duration::from_millis(interval_ms));
                ack_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                let mut last_acked: Option<u64> = None;
                loop {
                    ack_interval.tick().await;
                    let position = applied.read().get(&key).copied();
                    if let Some(next_wanted) = position {
                        if last_acked != Some(next_wanted) {
                            if write_frame(&mut writer, &PeerMessage::Ack { next_wanted })
                                .await
                                .is_err()
                            {
                                break;
                            }
                            last_acked = Some(next_wanted);
                        }
                    }
                }
            })
        };

        let result = self.pull_apply(peer.host_id, &store, &mut reader).await;
        ack_task.abort();
        self.stats.connected_peers.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn pull_apply(
        &self,
        peer_id: HostId,
        store: &Arc<KvStore>,
        reader: &mut OwnedReadHalf,
    ) -> ReplicationResult<()> {
        let key = (peer_id, store.name().to_string());

        while self.running.load(Ordering::SeqCst) {
            let message = read_frame::<_, PeerMessage>(reader)
                .await
                .map_err(|e| ReplicationError::ConnectionFailed(e.to_string()))?;
            match message {
                Some(PeerMessage::SnapshotEntry { entry }) => {
                    self.apply(store, &entry)?;
                }
                Some(PeerMessage::Entry { offset, entry }) => {
                    self.apply(store, &entry)?;
                    self.applied.write().insert(key.clone(), offset + 1);
                }
                Some(PeerMessage::BatchComplete {
                    data_up_to_ms,
                    resume_offset,
                }) => {
                    self.applied.write().insert(key.clone(), resume_offset);
                    store.hub().notify_batch_complete(data_up_to_ms);
                    info!(peer = peer_id, data_up_to_ms, "bootstrap complete");
                }
                Some(PeerMessage::Heartbeat { offset, .. }) => {
                    debug!(peer = peer_id, offset, "heartbeat");
                }
                Some(other) => {
                    debug!(peer = peer_id, "unexpected message: {:?}", other);
                }
                None => return Ok(()),
            }
        }
        Ok(())
    }

    fn apply(&self, store: &KvStore, entry: &ReplicationEntry) -> ReplicationResult<()> {
        if store.apply_replication(entry)? {
            self.stats.entries_applied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.entries_discarded.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
