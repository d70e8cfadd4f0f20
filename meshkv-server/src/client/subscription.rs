use super::connection::Connection;
use super::ClientError;
use crate::core::events::ChangeEvent;
use crate::protocol::{Request, RequestBody, ResponseBody};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Client end of a change-event stream. The subscription lives under its
/// own transaction id on the shared connection; events interleave freely
/// with other calls and are routed here by the connection's demux task.
pub struct RemoteSubscription {
    conn: Arc<Connection>,
    store: String,
    txn_id: u64,
    rx: mpsc::UnboundedReceiver<ResponseBody>,
}

impl RemoteSubscription {
    pub(super) async fn open(
        conn: Arc<Connection>,
        store: String,
        bootstrap: bool,
    ) -> Result<Self, ClientError> {
        let txn_id = conn.next_txn();
        let rx = conn.register(txn_id);

        let request = Request {
            txn_id,
            store: store.clone(),
            body: RequestBody::Subscribe { bootstrap },
        };
        if let Err(e) = conn.send(&request).await {
            conn.release(txn_id);
            return Err(e);
        }

        Ok(Self {
            conn,
            store,
            txn_id,
            rx,
        })
    }

    /// Next change event. `None` once the stream has ended, whether by
    /// unsubscribe, server shutdown or connection loss. Errors reported by
    /// the server mid-stream end it too, after being logged; they surface
    /// here rather than on the thread that registered the subscription.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await? {
                ResponseBody::Event(event) => return Some(event),
                ResponseBody::SubscriptionEnded => return None,
                ResponseBody::Fault(fault) => {
                    warn!(store = %self.store, "subscription fault: {}", fault);
                    return None;
                }
                other => {
                    warn!(store = %self.store, "unexpected frame on subscription: {:?}", other);
                }
            }
        }
    }

    /// Tell the server to stop the stream, then drop the local routing.
    pub async fn unsubscribe(mut self) -> Result<(), ClientError> {
        self.conn
            .call(
                &self.store,
                RequestBody::Unsubscribe {
                    subscriber_txn: self.txn_id,
                },
            )
            .await?;
        // Drain until the ended marker so nothing is left queued.
        while self.next().await.is_some() {}
        self.conn.release(self.txn_id);
        Ok(())
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        self.conn.release(self.txn_id);
    }
}
