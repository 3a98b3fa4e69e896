use axum::extract::ws::{CloseFrame, Message};
use chrono::{DateTime, Utc};
use remote_core::{encode, CorrelationToken, Envelope, Identity};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

/// One live websocket. Outbound frames go through a bounded queue drained by
/// the connection's writer task.
pub struct Connection {
    pub conn_id: String,
    pub remote: SocketAddr,
    pub opened_at: Instant,
    sender: mpsc::Sender<Message>,
    max_frame_bytes: usize,
    in_flight: Mutex<VecDeque<InFlight>>,
    in_flight_limit: usize,
    shutdown: Notify,
}

struct InFlight {
    token: CorrelationToken,
    kind: String,
}

impl Connection {
    pub fn new(
        conn_id: impl Into<String>,
        remote: SocketAddr,
        sender: mpsc::Sender<Message>,
        max_frame_bytes: usize,
        in_flight_limit: usize,
    ) -> Self {
        Self {
            conn_id: conn_id.into(),
            remote,
            opened_at: Instant::now(),
            sender,
            max_frame_bytes,
            in_flight: Mutex::new(VecDeque::new()),
            in_flight_limit: in_flight_limit.max(1),
            shutdown: Notify::new(),
        }
    }

    /// Queues `envelope` without waiting. A full queue marks the peer as a slow
    /// consumer and shuts the connection down.
    pub fn send(&self, envelope: &Envelope) -> bool {
        let text = match encode(envelope, self.max_frame_bytes) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "encode_error", conn_id = %self.conn_id, kind = envelope.kind(), error = %err);
                return false;
            }
        };
        match self.sender.try_send(Message::Text(text)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(event = "send_closed", conn_id = %self.conn_id);
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "send_backpressure", conn_id = %self.conn_id);
                self.shutdown.notify_one();
                false
            }
        }
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.sender.try_send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })));
        self.shutdown.notify_one();
    }

    /// Resolves once `close` was called or the outbound queue overflowed.
    pub async fn closed(&self) {
        self.shutdown.notified().await;
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, VecDeque<InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a request of type `kind` forwarded to this peer whose reply is
    /// still due.
    pub fn track(&self, token: CorrelationToken, kind: &str) {
        let mut queue = self.in_flight();
        if queue.len() >= self.in_flight_limit {
            if let Some(dropped) = queue.pop_front() {
                debug!(event = "in_flight_evicted", conn_id = %self.conn_id, token = %dropped.token);
            }
        }
        queue.push_back(InFlight {
            token,
            kind: kind.to_string(),
        });
    }

    pub fn settle(&self, token: &CorrelationToken) -> bool {
        let mut queue = self.in_flight();
        match queue.iter().position(|entry| &entry.token == token) {
            Some(index) => queue.remove(index).is_some(),
            None => false,
        }
    }

    /// Token for a reply that did not echo one: the oldest outstanding request
    /// of the same `kind`, else the oldest request of any kind.
    pub fn next_in_flight(&self, kind: &str) -> Option<CorrelationToken> {
        let mut queue = self.in_flight();
        let index = queue
            .iter()
            .position(|entry| entry.kind == kind)
            .unwrap_or(0);
        queue.remove(index).map(|entry| entry.token)
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight().len()
    }
}

struct AgentEntry {
    conn: Arc<Connection>,
    last_seen: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    agents: HashMap<Identity, AgentEntry>,
    backend: Option<Arc<Connection>>,
}

/// Authenticated connections: one entry per agent identity plus a single
/// backend slot. Every method holds the lock only for map access.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `identity` to `conn`, returning the connection it displaced.
    pub async fn register(
        &self,
        identity: Identity,
        conn: Arc<Connection>,
        now: DateTime<Utc>,
    ) -> Option<Arc<Connection>> {
        let previous = self
            .inner
            .write()
            .await
            .agents
            .insert(
                identity,
                AgentEntry {
                    conn: conn.clone(),
                    last_seen: now,
                },
            )
            .map(|entry| entry.conn);
        previous.filter(|prev| !Arc::ptr_eq(prev, &conn))
    }

    pub async fn unregister(&self, identity: &Identity) -> Option<Arc<Connection>> {
        self.inner
            .write()
            .await
            .agents
            .remove(identity)
            .map(|entry| entry.conn)
    }

    /// Removes `identity` only while it still maps to `conn`.
    pub async fn release(&self, identity: &Identity, conn: &Arc<Connection>) -> bool {
        let mut inner = self.inner.write().await;
        let owned = inner
            .agents
            .get(identity)
            .map(|entry| Arc::ptr_eq(&entry.conn, conn))
            .unwrap_or(false);
        if owned {
            inner.agents.remove(identity);
        }
        owned
    }

    pub async fn lookup(&self, identity: &Identity) -> Option<Arc<Connection>> {
        self.inner
            .read()
            .await
            .agents
            .get(identity)
            .map(|entry| entry.conn.clone())
    }

    pub async fn list_identities(&self) -> Vec<Identity> {
        let mut ids: Vec<_> = self.inner.read().await.agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.agents.len()
    }

    /// Updates last-seen for `identity` if `conn` owns the entry and returns
    /// the previous value.
    pub async fn touch(
        &self,
        identity: &Identity,
        conn: &Arc<Connection>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let mut inner = self.inner.write().await;
        let entry = inner.agents.get_mut(identity)?;
        if !Arc::ptr_eq(&entry.conn, conn) {
            return None;
        }
        Some(std::mem::replace(&mut entry.last_seen, now))
    }

    pub async fn last_seen(&self, identity: &Identity) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .await
            .agents
            .get(identity)
            .map(|entry| entry.last_seen)
    }

    pub async fn set_backend(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let previous = self.inner.write().await.backend.replace(conn.clone());
        previous.filter(|prev| !Arc::ptr_eq(prev, &conn))
    }

    pub async fn backend(&self) -> Option<Arc<Connection>> {
        self.inner.read().await.backend.clone()
    }

    pub async fn release_backend(&self, conn: &Arc<Connection>) -> bool {
        let mut inner = self.inner.write().await;
        let owned = inner
            .backend
            .as_ref()
            .map(|current| Arc::ptr_eq(current, conn))
            .unwrap_or(false);
        if owned {
            inner.backend = None;
        }
        owned
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use remote_core::{decode, DEFAULT_MAX_FRAME_BYTES};

    pub(crate) fn test_conn(name: &str) -> (Arc<Connection>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        let remote: SocketAddr = "127.0.0.1:40000".parse().expect("addr");
        (
            Arc::new(Connection::new(name, remote, tx, DEFAULT_MAX_FRAME_BYTES, 8)),
            rx,
        )
    }

    pub(crate) fn next_envelope(rx: &mut mpsc::Receiver<Message>) -> Option<Envelope> {
        match rx.try_recv().ok()? {
            Message::Text(text) => Some(decode(text.as_bytes(), DEFAULT_MAX_FRAME_BYTES).expect("decode")),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn register_reports_displaced_connection_and_release_is_guarded() {
        let registry = ConnectionRegistry::new();
        let identity = Identity::from("agent-1");
        let (first, _rx1) = test_conn("conn-1");
        let (second, _rx2) = test_conn("conn-2");

        assert!(registry
            .register(identity.clone(), first.clone(), Utc::now())
            .await
            .is_none());
        let displaced = registry
            .register(identity.clone(), second.clone(), Utc::now())
            .await
            .expect("first connection displaced");
        assert!(Arc::ptr_eq(&displaced, &first));

        assert!(!registry.release(&identity, &first).await);
        let current = registry.lookup(&identity).await.expect("still registered");
        assert!(Arc::ptr_eq(&current, &second));

        assert!(registry.release(&identity, &second).await);
        assert!(registry.lookup(&identity).await.is_none());
    }

    #[tokio::test]
    async fn reregistering_same_connection_is_not_a_displacement() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = test_conn("conn-1");
        let identity = Identity::from("agent-1");
        registry.register(identity.clone(), conn.clone(), Utc::now()).await;
        assert!(registry
            .register(identity, conn, Utc::now())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn list_identities_is_sorted() {
        let registry = ConnectionRegistry::new();
        for name in ["charlie", "alpha", "bravo"] {
            let (conn, _rx) = test_conn(name);
            registry.register(Identity::from(name), conn, Utc::now()).await;
        }
        assert_eq!(
            registry.list_identities().await,
            vec![
                Identity::from("alpha"),
                Identity::from("bravo"),
                Identity::from("charlie")
            ]
        );
        assert!(registry.unregister(&Identity::from("bravo")).await.is_some());
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn touch_returns_previous_last_seen_for_owner_only() {
        let registry = ConnectionRegistry::new();
        let identity = Identity::from("agent-1");
        let (conn, _rx) = test_conn("conn-1");
        let (stranger, _rx2) = test_conn("conn-2");
        let opened = Utc::now();
        registry.register(identity.clone(), conn.clone(), opened).await;

        let later = opened + chrono::Duration::seconds(5);
        assert_eq!(registry.touch(&identity, &conn, later).await, Some(opened));
        assert_eq!(registry.last_seen(&identity).await, Some(later));
        assert_eq!(registry.touch(&identity, &stranger, Utc::now()).await, None);
    }

    #[tokio::test]
    async fn backend_slot_is_single_and_guarded() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = test_conn("backend-1");
        let (second, _rx2) = test_conn("backend-2");

        assert!(registry.set_backend(first.clone()).await.is_none());
        let displaced = registry.set_backend(second.clone()).await.expect("displaced");
        assert!(Arc::ptr_eq(&displaced, &first));
        assert!(!registry.release_backend(&first).await);
        assert!(registry.backend().await.is_some());
        assert!(registry.release_backend(&second).await);
        assert!(registry.backend().await.is_none());
    }

    #[tokio::test]
    async fn in_flight_queue_is_fifo_and_bounded() {
        let (conn, _rx) = test_conn("conn-1");
        for index in 0..10 {
            conn.track(CorrelationToken::new(format!("tok-{index}")), "run");
        }
        assert_eq!(conn.in_flight_len(), 8);
        assert!(conn.settle(&CorrelationToken::from("tok-5")));
        assert!(!conn.settle(&CorrelationToken::from("tok-0")));
        assert_eq!(conn.next_in_flight("run"), Some(CorrelationToken::from("tok-2")));
    }

    #[tokio::test]
    async fn untagged_reply_prefers_request_of_same_kind() {
        let (conn, _rx) = test_conn("conn-1");
        conn.track(CorrelationToken::from("tok-snip"), "snip");
        conn.track(CorrelationToken::from("tok-cmd"), "command");

        assert_eq!(conn.next_in_flight("command"), Some(CorrelationToken::from("tok-cmd")));
        assert_eq!(conn.next_in_flight("other"), Some(CorrelationToken::from("tok-snip")));
        assert_eq!(conn.next_in_flight("command"), None);
    }

    #[tokio::test]
    async fn full_queue_triggers_shutdown() {
        let (tx, _rx) = mpsc::channel(1);
        let remote: SocketAddr = "127.0.0.1:40001".parse().expect("addr");
        let conn = Connection::new("conn-slow", remote, tx, DEFAULT_MAX_FRAME_BYTES, 4);
        assert!(conn.send(&Envelope::Heartbeat));
        assert!(!conn.send(&Envelope::Heartbeat));
        tokio::time::timeout(std::time::Duration::from_millis(100), conn.closed())
            .await
            .expect("shutdown signalled");
    }
}
