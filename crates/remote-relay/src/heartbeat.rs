use crate::auth::with_store;
use crate::registry::{Connection, ConnectionRegistry};
use chrono::Utc;
use remote_core::{Action, Envelope, Identity, PendingError, PendingRequestTable};
use remote_storage::IdentityStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Liveness bookkeeping for agent heartbeats.
///
/// A heartbeat refreshes last-seen in the registry and the store, then sends
/// the agent a probe action whose reply the relay awaits itself. Nothing is
/// evicted for missing heartbeats; a dead agent is removed when its
/// connection closes.
pub struct HeartbeatTracker {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn IdentityStore>,
    probes: Arc<PendingRequestTable<Action>>,
    probe_action: String,
    probe_timeout: Duration,
}

impl HeartbeatTracker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn IdentityStore>,
        probes: Arc<PendingRequestTable<Action>>,
        probe_action: impl Into<String>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            probes,
            probe_action: probe_action.into(),
            probe_timeout,
        }
    }

    /// Returns the time since the previous heartbeat (or registration), or
    /// `None` when `conn` no longer owns the registry entry for `identity`.
    pub async fn on_heartbeat(
        &self,
        identity: &Identity,
        conn: &Arc<Connection>,
    ) -> Option<chrono::Duration> {
        let now = Utc::now();
        let Some(previous) = self.registry.touch(identity, conn, now).await else {
            debug!(event = "heartbeat_unregistered", conn_id = %conn.conn_id, identity = %identity);
            return None;
        };
        let elapsed = now - previous;
        info!(
            event = "heartbeat",
            conn_id = %conn.conn_id,
            identity = %identity,
            elapsed_ms = elapsed.num_milliseconds()
        );

        let id = identity.clone();
        if let Err(err) = with_store(&self.store, move |store| store.touch_host(&id, now)).await {
            warn!(event = "last_seen_persist_error", identity = %identity, error = %err);
        }

        self.probe(identity, conn);
        Some(elapsed)
    }

    /// Whether a reply of type `kind` can answer a relay probe.
    pub fn is_probe_kind(&self, kind: &str) -> bool {
        !self.probe_action.is_empty() && kind == self.probe_action
    }

    fn probe(&self, identity: &Identity, conn: &Arc<Connection>) {
        if self.probe_action.is_empty() {
            return;
        }
        let token = self.probes.issue();
        conn.track(token.clone(), &self.probe_action);
        let request = Action::new(self.probe_action.as_str()).with_token(token.clone());
        if !conn.send(&Envelope::Action(request)) {
            self.probes.cancel(&token);
            conn.settle(&token);
            return;
        }

        let probes = self.probes.clone();
        let timeout = self.probe_timeout;
        let identity = identity.clone();
        let conn = Arc::downgrade(conn);
        tokio::spawn(async move {
            match probes.wait(&token, timeout).await {
                Ok(reply) => {
                    debug!(event = "probe_reply", identity = %identity, kind = %reply.kind);
                }
                Err(PendingError::Timeout { .. }) => {
                    if let Some(conn) = conn.upgrade() {
                        conn.settle(&token);
                    }
                    warn!(event = "probe_timeout", identity = %identity, token = %token);
                }
                Err(err) => {
                    debug!(event = "probe_abandoned", identity = %identity, error = %err);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{next_envelope, test_conn};
    use remote_storage::{HostRecord, SqliteStore};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn heartbeat_updates_last_seen_and_sends_probe() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open db"));
        let registry = Arc::new(ConnectionRegistry::new());
        let probes = Arc::new(PendingRequestTable::new());
        let tracker = HeartbeatTracker::new(
            registry.clone(),
            store.clone(),
            probes.clone(),
            "snip",
            Duration::from_secs(5),
        );

        let registered_at = Utc::now() - chrono::Duration::seconds(10);
        let record = HostRecord::new(Identity::from("agent-1"), registered_at);
        store.insert_host(&record).expect("insert");
        let (conn, mut rx) = test_conn("conn-1");
        registry
            .register(record.identity.clone(), conn.clone(), registered_at)
            .await;

        let elapsed = tracker
            .on_heartbeat(&record.identity, &conn)
            .await
            .expect("registered");
        assert!(elapsed.num_seconds() >= 10);

        let stored = store
            .get_host(&record.identity)
            .expect("get")
            .expect("exists");
        assert!(stored.last_seen > registered_at);

        let Some(Envelope::Action(probe)) = next_envelope(&mut rx) else {
            panic!("expected probe action");
        };
        assert_eq!(probe.kind, "snip");
        let token = probe.token.expect("probe token");
        assert!(probes.is_pending(&token));
        assert_eq!(conn.in_flight_len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_from_displaced_connection_is_ignored() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open db"));
        let registry = Arc::new(ConnectionRegistry::new());
        let tracker = HeartbeatTracker::new(
            registry.clone(),
            store,
            Arc::new(PendingRequestTable::new()),
            "",
            Duration::from_secs(5),
        );
        let identity = Identity::from("agent-1");
        let (old, mut old_rx) = test_conn("conn-old");
        let (new, _new_rx) = test_conn("conn-new");
        registry.register(identity.clone(), old.clone(), Utc::now()).await;
        registry.register(identity.clone(), new, Utc::now()).await;

        assert!(tracker.on_heartbeat(&identity, &old).await.is_none());
        assert!(next_envelope(&mut old_rx).is_none());
    }
}
